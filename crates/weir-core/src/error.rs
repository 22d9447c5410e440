use weir_shm::ArenaError;

/// Errors from binding, connecting and moving values through a node.
///
/// End-of-stream is deliberately not here: it is the normal way a stream
/// finishes and is reported through [`WaitResult::EndOfStream`]
/// (or `Ok(None)` from the `recv` conveniences), never as an error.
///
/// [`WaitResult::EndOfStream`]: crate::WaitResult::EndOfStream
#[derive(Debug)]
pub enum NodeError {
    /// The underlying arena failed.
    Arena(ArenaError),
    /// Endpoint name rejected before touching the arena.
    InvalidName { name: String, reason: &'static str },
    /// A sink already owns this node, now or earlier in its lifetime.
    AlreadyBound { name: String },
    /// Fail-fast connect found no bound sink.
    NotBound { name: String },
    /// The node has reached its terminal state; no more values will move.
    NodeClosed,
    /// The caller broke the wait/observe/post discipline.
    ProtocolViolation(&'static str),
    /// Frame geometry rejected at bind, or a pixel buffer of the wrong size.
    InvalidFrameSpec(&'static str),
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Arena(e) => write!(f, "arena error: {e}"),
            Self::InvalidName { name, reason } => {
                write!(f, "invalid endpoint name {name:?}: {reason}")
            }
            Self::AlreadyBound { name } => {
                write!(f, "a sink is already bound to {name:?}")
            }
            Self::NotBound { name } => {
                write!(f, "no sink is bound to {name:?}")
            }
            Self::NodeClosed => write!(f, "node is closed"),
            Self::ProtocolViolation(msg) => write!(f, "protocol violation: {msg}"),
            Self::InvalidFrameSpec(msg) => write!(f, "invalid frame spec: {msg}"),
        }
    }
}

impl std::error::Error for NodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Arena(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ArenaError> for NodeError {
    fn from(e: ArenaError) -> Self {
        NodeError::Arena(e)
    }
}
