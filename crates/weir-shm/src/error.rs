use std::io;

/// Errors from arena mapping, allocation and naming.
#[derive(Debug)]
pub enum ArenaError {
    /// An OS call failed.
    Io { op: &'static str, source: io::Error },
    /// The segment does not exist (open-without-create path).
    NotFound { name: String },
    /// Endpoint or object name rejected.
    InvalidName { name: String, reason: &'static str },
    /// Requested capacity exceeds the fixed virtual reservation.
    TooLarge { requested: usize, max: usize },
    /// A named object with this name already exists.
    NameCollision { name: String },
    /// The named-object directory is out of entries.
    DirectoryFull { cap: usize },
    /// The bump allocator ran out of arena capacity.
    OutOfSpace { requested: usize, capacity: u64 },
    /// A handle that does not point into the arena.
    BadHandle { offset: u64 },
    /// The mapped segment does not look like one of ours.
    BadLayout(&'static str),
    /// The segment's creator did not finish initializing it in time.
    InitTimeout { name: String },
}

impl std::fmt::Display for ArenaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { op, source } => write!(f, "{op} failed: {source}"),
            Self::NotFound { name } => write!(f, "shared segment {name:?} does not exist"),
            Self::InvalidName { name, reason } => {
                write!(f, "invalid name {name:?}: {reason}")
            }
            Self::TooLarge { requested, max } => {
                write!(f, "requested {requested} bytes, reservation is {max}")
            }
            Self::NameCollision { name } => {
                write!(f, "named object {name:?} already exists")
            }
            Self::DirectoryFull { cap } => {
                write!(f, "object directory full ({cap} entries)")
            }
            Self::OutOfSpace {
                requested,
                capacity,
            } => write!(
                f,
                "allocation of {requested} bytes exceeds arena capacity {capacity}"
            ),
            Self::BadHandle { offset } => write!(f, "handle offset {offset} outside arena"),
            Self::BadLayout(msg) => write!(f, "bad arena layout: {msg}"),
            Self::InitTimeout { name } => {
                write!(f, "timed out waiting for {name:?} to be initialized")
            }
        }
    }
}

impl std::error::Error for ArenaError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}
