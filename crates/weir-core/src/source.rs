//! The reader endpoint.

use std::ptr::NonNull;

use weir_shm::{Arena, ArenaError, MIN_ARENA_SIZE};

use crate::error::NodeError;
use crate::node::{
    CycleStop, InterruptFlag, Node, NodeState, WaitResult, arena_name, find_or_construct_node,
    payload_object_name, validate_endpoint_name,
};
use crate::payload::ShmSafe;

/// A reader attached to a named node. Any number may attach to one sink.
///
/// The consumption cycle is `wait` -> (`observe` / `clone_payload`) ->
/// `post`. The payload is only accessible between a `wait` that returned
/// [`WaitResult::Ready`] and the matching `post`; the substrate holds the
/// sharable lock only inside the observation calls, so a source must not
/// retain payload bytes past `post`.
///
/// [`connect`](Source::connect) is create-and-wait: a source may start
/// before its sink and blocks until the sink binds.
#[derive(Debug)]
pub struct Source<T: ShmSafe> {
    arena: Arena,
    node: NonNull<Node>,
    slot: NonNull<T>,
    name: String,
    interrupt: Option<InterruptFlag>,
    last_seen: u64,
    pending_post: bool,
    detached: bool,
    at_end: bool,
}

// SAFETY: the shared state behind the pointers is synchronized by the node
// protocol; the Source value itself is exclusively owned.
unsafe impl<T: ShmSafe> Send for Source<T> {}

impl<T: ShmSafe> Source<T> {
    /// Attach to `name`, creating the arena and node if this source arrives
    /// before the sink, and blocking until a sink has bound.
    pub fn connect(name: &str) -> Result<Self, NodeError> {
        Self::connect_inner(name, None)
    }

    /// Like [`connect`](Source::connect), but the blocking phase aborts
    /// with [`NodeError::NodeClosed`] when `flag` is raised. The flag stays
    /// installed for later waits.
    pub fn connect_interruptible(name: &str, flag: InterruptFlag) -> Result<Self, NodeError> {
        Self::connect_inner(name, Some(flag))
    }

    /// Fail-fast attach: errors with [`NodeError::NotBound`] instead of
    /// waiting when no sink has bound `name` yet.
    pub fn try_connect(name: &str) -> Result<Self, NodeError> {
        validate_endpoint_name(name)?;
        let arena = match Arena::open_existing(&arena_name(name)) {
            Ok(arena) => arena,
            Err(ArenaError::NotFound { .. }) => {
                return Err(NodeError::NotBound {
                    name: name.to_owned(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        let node = find_or_construct_node(&arena, name)?;
        // SAFETY: node points into `arena`, which we keep alive.
        if unsafe { node.as_ref() }.state() < NodeState::SinkBound {
            return Err(NodeError::NotBound {
                name: name.to_owned(),
            });
        }
        Self::finish_connect(arena, node, name, None)
    }

    fn connect_inner(name: &str, interrupt: Option<InterruptFlag>) -> Result<Self, NodeError> {
        validate_endpoint_name(name)?;
        let arena = Arena::open_or_create(&arena_name(name), MIN_ARENA_SIZE)?;
        let node = find_or_construct_node(&arena, name)?;
        Self::finish_connect(arena, node, name, interrupt)
    }

    fn finish_connect(
        arena: Arena,
        node: NonNull<Node>,
        name: &str,
        interrupt: Option<InterruptFlag>,
    ) -> Result<Self, NodeError> {
        // SAFETY: node points into `arena`, which we keep alive.
        let node_ref = unsafe { node.as_ref() };
        let last_seen = node_ref.attach_source(&interrupt)?;

        // The slot is registered before the node leaves UNDEFINED, so a
        // successful attach implies it is findable. Failing here must undo
        // the attach or the sink would latch barriers for a ghost reader.
        let slot = (|| -> Result<*mut T, NodeError> {
            let handle = arena.find(&payload_object_name(name)).ok_or(NodeError::Arena(
                ArenaError::BadLayout("bound node has no payload slot"),
            ))?;
            // SAFETY: constructed as a T by the sink at bind.
            Ok(unsafe { arena.typed::<T>(handle)? })
        })();
        let slot = match slot {
            Ok(slot) => NonNull::new(slot).expect("arena returned a null address"),
            Err(e) => {
                node_ref.detach_source(last_seen, false);
                return Err(e);
            }
        };

        tracing::debug!(endpoint = name, last_seen, "source connected");
        Ok(Self {
            arena,
            node,
            slot,
            name: name.to_owned(),
            interrupt,
            last_seen,
            pending_post: false,
            detached: false,
            at_end: false,
        })
    }

    /// Install a cancellation flag polled inside blocking waits. A raised
    /// flag surfaces as [`WaitResult::EndOfStream`], the same way external
    /// close does.
    pub fn set_interrupt(&mut self, flag: InterruptFlag) {
        self.interrupt = Some(flag);
    }

    /// Block until a sample newer than the last one this source consumed is
    /// published, or the stream ends. After `Ready`, the sample stays
    /// observable until [`post`](Source::post).
    ///
    /// A sample published before the node closed is still delivered;
    /// end-of-stream is reported only once nothing is left to consume.
    pub fn wait(&mut self) -> Result<WaitResult, NodeError> {
        if self.pending_post {
            return Err(NodeError::ProtocolViolation(
                "wait() again without post()",
            ));
        }
        if self.at_end {
            return Ok(WaitResult::EndOfStream);
        }
        if self.detached {
            return Err(NodeError::ProtocolViolation("source is disconnected"));
        }
        // SAFETY: node points into our arena.
        let node = unsafe { self.node.as_ref() };
        match node.source_await(self.last_seen, &self.interrupt) {
            Ok(write_number) => {
                self.last_seen = write_number;
                self.pending_post = true;
                Ok(WaitResult::Ready)
            }
            Err(CycleStop::Closed) | Err(CycleStop::Interrupted) => {
                self.leave();
                self.at_end = true;
                Ok(WaitResult::EndOfStream)
            }
        }
    }

    /// Run `f` against the current sample under the sharable lock.
    /// Zero-copy: `f` must not stash the reference.
    pub fn observe<R>(&self, f: impl FnOnce(&T) -> R) -> Result<R, NodeError> {
        if !self.pending_post {
            return Err(NodeError::ProtocolViolation(
                "observe outside the wait()/post() window",
            ));
        }
        // SAFETY: node points into our arena.
        let node = unsafe { self.node.as_ref() };
        node.begin_observation();
        // SAFETY: sharable lock held; the sink cannot be mutating.
        let r = f(unsafe { self.slot.as_ref() });
        node.end_observation();
        Ok(r)
    }

    /// Copy the current sample out. The default downstream components use.
    pub fn clone_payload(&self) -> Result<T, NodeError> {
        self.observe(|v| *v)
    }

    /// Release the current sample. Must be called exactly once per `wait`
    /// that returned [`WaitResult::Ready`]; once the last attached source
    /// posts, the sink may reuse the slot.
    pub fn post(&mut self) -> Result<(), NodeError> {
        if !self.pending_post {
            return Err(NodeError::ProtocolViolation(
                "post() without a successful wait()",
            ));
        }
        // SAFETY: node points into our arena.
        unsafe { self.node.as_ref() }.source_post();
        self.pending_post = false;
        Ok(())
    }

    /// One full consumption cycle: wait, copy out, post. `None` means
    /// end-of-stream.
    pub fn recv(&mut self) -> Result<Option<T>, NodeError> {
        match self.wait()? {
            WaitResult::EndOfStream => Ok(None),
            WaitResult::Ready => {
                let value = self.clone_payload()?;
                self.post()?;
                Ok(Some(value))
            }
        }
    }

    /// Detach from the node. Any barrier debt is settled so the sink never
    /// stalls on a departed source. Idempotent; also runs on drop.
    pub fn disconnect(&mut self) {
        if self.detached {
            return;
        }
        self.leave();
        tracing::debug!(endpoint = %self.name, "source disconnected");
    }

    fn leave(&mut self) {
        if self.detached {
            return;
        }
        // SAFETY: node points into our arena.
        let node = unsafe { self.node.as_ref() };
        node.detach_source(self.last_seen, self.pending_post);
        self.pending_post = false;
        self.detached = true;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> NodeState {
        // SAFETY: node points into our arena.
        unsafe { self.node.as_ref() }.state()
    }

    /// Sample number of the most recent publication observed by the node.
    pub fn write_number(&self) -> u64 {
        // SAFETY: node points into our arena.
        unsafe { self.node.as_ref() }.write_number()
    }

    pub(crate) fn arena(&self) -> &Arena {
        &self.arena
    }

    /// Read the slot outside any lock. Only sound for fields the sink never
    /// mutates after bind (frame geometry, buffer handles).
    pub(crate) fn slot_snapshot(&self) -> T {
        // SAFETY: the slot was fully written before the node left
        // UNDEFINED, and the caller restricts itself to bind-immutable
        // fields.
        unsafe { *self.slot.as_ptr() }
    }
}

impl<T: ShmSafe> Drop for Source<T> {
    fn drop(&mut self) {
        self.disconnect();
    }
}
