//! The sole-writer endpoint.

use std::marker::PhantomData;
use std::ptr::NonNull;

use weir_shm::{Arena, MIN_ARENA_SIZE};

use crate::error::NodeError;
use crate::node::{
    CycleStop, InterruptFlag, Node, NodeState, arena_name, find_or_construct_node,
    payload_object_name, validate_endpoint_name,
};
use crate::payload::ShmSafe;

/// Default arena capacity for a payload of `payload` bytes plus `aux`
/// out-of-band bytes: slot + node + header page + 10% slack.
pub(crate) fn default_capacity(payload: usize, aux: usize) -> usize {
    let need = MIN_ARENA_SIZE + core::mem::size_of::<Node>() + payload + aux;
    need + need / 10
}

/// The sole writer bound to a named node.
///
/// Binding creates (or joins) the arena, constructs the payload slot, and
/// claims the node; there is exactly one sink per name for the node's
/// lifetime. [`push`](Sink::push) runs one publication cycle: it returns
/// only after every source attached at the previous publication has
/// released the previous sample.
///
/// Dropping the sink closes the node: every source's next wait reports
/// end-of-stream.
#[derive(Debug)]
pub struct Sink<T: ShmSafe> {
    arena: Arena,
    node: NonNull<Node>,
    slot: NonNull<T>,
    name: String,
    interrupt: Option<InterruptFlag>,
    closed: bool,
    _marker: PhantomData<T>,
}

// SAFETY: the shared state behind the pointers is synchronized by the node
// protocol; the Sink value itself is exclusively owned.
unsafe impl<T: ShmSafe> Send for Sink<T> {}

impl<T: ShmSafe + Default> Sink<T> {
    /// Bind to `name` with a default-sized arena and a default-initialized
    /// payload slot.
    pub fn bind(name: &str) -> Result<Self, NodeError> {
        Self::bind_with(name, default_capacity(core::mem::size_of::<T>(), 0), |_| {
            Ok(T::default())
        })
    }

    /// Bind with an explicit arena capacity in bytes.
    pub fn bind_with_capacity(name: &str, capacity: usize) -> Result<Self, NodeError> {
        Self::bind_with(name, capacity, |_| Ok(T::default()))
    }
}

impl<T: ShmSafe> Sink<T> {
    /// Bind to `name`. `init` runs after the node is claimed and may
    /// allocate out-of-band buffers in the arena; the value it returns
    /// seeds the payload slot.
    pub(crate) fn bind_with(
        name: &str,
        capacity: usize,
        init: impl FnOnce(&Arena) -> Result<T, NodeError>,
    ) -> Result<Self, NodeError> {
        validate_endpoint_name(name)?;
        let arena = Arena::open_or_create(&arena_name(name), capacity)?;
        let node = find_or_construct_node(&arena, name)?;

        // SAFETY: node points into `arena`, which we keep alive.
        let node_ref = unsafe { node.as_ref() };
        if !node_ref.claim_sink() {
            return Err(NodeError::AlreadyBound {
                name: name.to_owned(),
            });
        }

        let value = init(&arena)?;
        let handle = arena.construct(
            &payload_object_name(name),
            core::mem::size_of::<T>(),
            core::mem::align_of::<T>(),
            |p| {
                // SAFETY: freshly allocated, sized and aligned for T.
                unsafe { (p as *mut T).write(value) }
            },
        )?;
        // SAFETY: just constructed as a T.
        let slot = unsafe { arena.typed::<T>(handle)? };
        let slot = NonNull::new(slot).expect("arena returned a null address");

        node_ref.publish_bound();
        tracing::debug!(endpoint = name, capacity, "sink bound");

        Ok(Self {
            arena,
            node,
            slot,
            name: name.to_owned(),
            interrupt: None,
            closed: false,
            _marker: PhantomData,
        })
    }

    /// Install a cancellation flag polled inside blocking waits. A raised
    /// flag makes `push` close the node and report [`NodeError::NodeClosed`],
    /// the same outcome callers see on external close.
    pub fn set_interrupt(&mut self, flag: InterruptFlag) {
        self.interrupt = Some(flag);
    }

    /// Publish one value. `fill` mutates the payload slot in place while
    /// the exclusive lock is held; the bytes it leaves behind are exactly
    /// what every attached source observes for this sample, and they stay
    /// untouched until the next `push`.
    pub fn push(&mut self, fill: impl FnOnce(&mut T)) -> Result<(), NodeError> {
        if self.closed {
            return Err(NodeError::NodeClosed);
        }
        // SAFETY: both pointers target initialized objects in our arena.
        let node = unsafe { self.node.as_ref() };
        match node.sink_begin_cycle(&self.interrupt) {
            Ok(()) => {}
            Err(CycleStop::Closed) => {
                self.closed = true;
                return Err(NodeError::NodeClosed);
            }
            Err(CycleStop::Interrupted) => {
                node.close();
                self.closed = true;
                tracing::debug!(endpoint = %self.name, "sink interrupted, node closed");
                return Err(NodeError::NodeClosed);
            }
        }

        node.begin_mutation();
        // SAFETY: exclusive lock held; the sink is the only writer.
        fill(unsafe { self.slot.as_mut() });
        node.end_mutation();
        node.sink_publish();
        Ok(())
    }

    /// Transition the node to its terminal state and wake every waiter.
    /// Idempotent; also runs on drop.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        // SAFETY: node points into our arena.
        unsafe { self.node.as_ref() }.close();
        tracing::debug!(endpoint = %self.name, "sink closed");
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> NodeState {
        // SAFETY: node points into our arena.
        unsafe { self.node.as_ref() }.state()
    }

    /// Number of sources currently attached.
    pub fn source_count(&self) -> u16 {
        // SAFETY: node points into our arena.
        unsafe { self.node.as_ref() }.source_count()
    }

    /// Sample number of the most recent publication, 0 before the first.
    pub fn write_number(&self) -> u64 {
        // SAFETY: node points into our arena.
        unsafe { self.node.as_ref() }.write_number()
    }

    pub(crate) fn arena(&self) -> &Arena {
        &self.arena
    }
}

impl<T: ShmSafe> Drop for Sink<T> {
    fn drop(&mut self) {
        self.close();
    }
}
