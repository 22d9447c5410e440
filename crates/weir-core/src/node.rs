//! The synchronization node: a one-writer / N-readers rendezvous per item.
//!
//! A [`Node`] is a 96-byte `repr(C)` control block constructed by name
//! inside a shared arena. The sink and every source map the same bytes and
//! drive the publication cycle through the methods here:
//!
//! ```text
//!           sink: bind             sink: first push           sink: close / SIGINT
//! UNDEFINED --------> SINK_BOUND -----------------> SINK_PRESENT -----------------> END
//!                         ^                              ^
//!                         | source: attach (++refcount)  | source: wait/post cycle
//! ```
//!
//! One publication cycle: the sink waits (mutex + condvar) until every
//! reader counted into `read_barrier` has posted, mutates the payload under
//! the exclusive side of the sharable mutex, then -- back under the mutex --
//! latches `read_barrier` to the live source count, advances `write_number`
//! and broadcasts. Sources wake on the advance, observe the payload under
//! the sharable side, and post, decrementing the barrier. No step ever
//! holds both locks.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use weir_shm::{Condvar, Mutex, SharableMutex};

use crate::error::NodeError;

/// Longest accepted endpoint name. Derived object names must fit the
/// arena's directory entries.
pub const MAX_ENDPOINT_NAME: usize = 24;

/// Bounded tick for every blocking wait, so interrupt flags and external
/// close are noticed promptly even if a broadcast is missed.
pub(crate) const WAIT_TICK: Duration = Duration::from_millis(50);

/// Process-local cancellation flag polled inside blocking waits.
pub type InterruptFlag = Arc<AtomicBool>;

pub(crate) fn interrupted(flag: &Option<InterruptFlag>) -> bool {
    flag.as_ref().is_some_and(|f| f.load(Ordering::Relaxed))
}

/// The arena segment backing endpoint `name`.
pub fn arena_name(name: &str) -> String {
    format!("{name}_sh_mem")
}

/// The node object inside the arena.
pub fn node_object_name(name: &str) -> String {
    format!("{name}_node")
}

/// The payload slot inside the arena.
pub fn payload_object_name(name: &str) -> String {
    format!("{name}_obj")
}

pub(crate) fn validate_endpoint_name(name: &str) -> Result<(), NodeError> {
    if name.is_empty() {
        return Err(NodeError::InvalidName {
            name: name.to_owned(),
            reason: "empty",
        });
    }
    if name.len() > MAX_ENDPOINT_NAME {
        return Err(NodeError::InvalidName {
            name: name.to_owned(),
            reason: "longer than MAX_ENDPOINT_NAME",
        });
    }
    if !name.bytes().all(|b| b.is_ascii_graphic() && b != b'/') {
        return Err(NodeError::InvalidName {
            name: name.to_owned(),
            reason: "must be printable ASCII without '/'",
        });
    }
    Ok(())
}

/// Lifecycle state of a node. Transitions are monotonic.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NodeState {
    /// Created by the first toucher; no sink yet.
    Undefined = 0,
    /// A sink has constructed the payload slot.
    SinkBound = 1,
    /// The sink has published at least once.
    SinkPresent = 2,
    /// Terminal: no further values will be published.
    End = 3,
}

impl NodeState {
    fn from_u32(v: u32) -> NodeState {
        match v {
            0 => NodeState::Undefined,
            1 => NodeState::SinkBound,
            2 => NodeState::SinkPresent,
            _ => NodeState::End,
        }
    }
}

/// Outcome of one `Source::wait`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// A fresh sample is observable until `post()`.
    Ready,
    /// Terminal; no more samples will arrive. Not an error.
    EndOfStream,
}

/// Why a sink publication cycle did not start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CycleStop {
    /// The node reached `END` externally.
    Closed,
    /// The caller's interrupt flag was raised mid-wait.
    Interrupted,
}

/// The in-arena synchronization control block. See the module docs for the
/// protocol; all methods take `&self` and may be called from any process
/// mapping the arena.
#[repr(C)]
pub struct Node {
    state: AtomicU32,
    /// One-shot sink ownership claim; never resets for the node's lifetime.
    sink_claim: AtomicU32,
    source_ref_count: AtomicU16,
    read_barrier: AtomicU16,
    _pad0: u32,
    /// Incremented when a publication cycle begins.
    sample_number: AtomicU64,
    /// Sample number most recently published; 0 before the first push.
    write_number: AtomicU64,
    /// Guards the cycle predicates below together with `cond`.
    mutex: Mutex,
    cond: Condvar,
    /// Guards payload bytes: sink exclusive, sources sharable.
    sharable: SharableMutex,
    /// Debug-only mutation-window marker.
    write_intent: AtomicU32,
    _pad1: [u8; 36],
}

const _: () = assert!(core::mem::size_of::<Node>() == 96);

impl Node {
    /// In-place initialization; runs under the arena's directory lock.
    pub(crate) fn init(&mut self) {
        self.state = AtomicU32::new(NodeState::Undefined as u32);
        self.sink_claim = AtomicU32::new(0);
        self.source_ref_count = AtomicU16::new(0);
        self.read_barrier = AtomicU16::new(0);
        self._pad0 = 0;
        self.sample_number = AtomicU64::new(0);
        self.write_number = AtomicU64::new(0);
        self.mutex.init();
        self.cond.init();
        self.sharable.init();
        self.write_intent = AtomicU32::new(0);
        self._pad1 = [0; 36];
    }

    pub fn state(&self) -> NodeState {
        NodeState::from_u32(self.state.load(Ordering::Acquire))
    }

    pub fn source_count(&self) -> u16 {
        self.source_ref_count.load(Ordering::Acquire)
    }

    pub fn write_number(&self) -> u64 {
        self.write_number.load(Ordering::Acquire)
    }

    /// One-shot sink ownership. Loser gets `AlreadyBound`.
    pub(crate) fn claim_sink(&self) -> bool {
        self.sink_claim
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// `UNDEFINED -> SINK_BOUND`, after the payload slot exists. Wakes
    /// sources blocked in connect.
    pub(crate) fn publish_bound(&self) {
        self.mutex.with(|| {
            debug_assert_eq!(self.state(), NodeState::Undefined);
            self.state
                .store(NodeState::SinkBound as u32, Ordering::Release);
        });
        self.cond.notify_all();
    }

    /// Transition to `END` and wake everyone. Idempotent.
    pub(crate) fn close(&self) {
        let mut was = NodeState::End;
        self.mutex.with(|| {
            was = self.state();
            if was != NodeState::End {
                self.state.store(NodeState::End as u32, Ordering::Release);
            }
        });
        if was != NodeState::End {
            self.cond.notify_all();
        }
    }

    /// Block until a sink has bound (or the node ended), then register as a
    /// live source. Returns the `write_number` at attach time: the sample
    /// this source will *not* see, so a mid-stream attach never races a
    /// partially written payload and waits for the next cycle.
    pub(crate) fn attach_source(
        &self,
        interrupt: &Option<InterruptFlag>,
    ) -> Result<u64, NodeError> {
        self.mutex.lock();
        loop {
            if self.state() >= NodeState::SinkBound {
                break;
            }
            if interrupted(interrupt) {
                self.mutex.unlock();
                return Err(NodeError::NodeClosed);
            }
            self.cond.wait(&self.mutex, Some(WAIT_TICK));
        }
        self.source_ref_count.fetch_add(1, Ordering::AcqRel);
        let last_seen = self.write_number.load(Ordering::Acquire);
        self.mutex.unlock();
        Ok(last_seen)
    }

    /// Deregister a source and settle its barrier debt, so the sink is
    /// never left waiting for a departed reader. A source owes a post iff
    /// it consumed the current sample without posting, or was counted into
    /// the current cycle's barrier and has not consumed it yet
    /// (`last_seen < write_number`). Both sides of that predicate must be
    /// evaluated under the node mutex or they race `sink_publish`.
    pub(crate) fn detach_source(&self, last_seen: u64, pending_post: bool) {
        let mut wake = false;
        self.mutex.with(|| {
            let prev = self.source_ref_count.fetch_sub(1, Ordering::AcqRel);
            debug_assert!(prev > 0, "detach without attach");
            let owes_post =
                pending_post || last_seen < self.write_number.load(Ordering::Acquire);
            if owes_post {
                let barrier = self.read_barrier.load(Ordering::Acquire);
                if barrier > 0 {
                    self.read_barrier.store(barrier - 1, Ordering::Release);
                    wake = barrier == 1;
                }
            }
        });
        if wake {
            self.cond.notify_all();
        }
    }

    /// Sink side, steps 1-3: wait until every reader of the previous sample
    /// has posted, then start a cycle.
    pub(crate) fn sink_begin_cycle(
        &self,
        interrupt: &Option<InterruptFlag>,
    ) -> Result<(), CycleStop> {
        self.mutex.lock();
        loop {
            if self.state() == NodeState::End {
                self.mutex.unlock();
                return Err(CycleStop::Closed);
            }
            if self.read_barrier.load(Ordering::Acquire) == 0 {
                break;
            }
            if interrupted(interrupt) {
                self.mutex.unlock();
                return Err(CycleStop::Interrupted);
            }
            self.cond.wait(&self.mutex, Some(WAIT_TICK));
        }
        self.sample_number.fetch_add(1, Ordering::AcqRel);
        self.mutex.unlock();
        Ok(())
    }

    /// Sink side: enter the payload mutation window.
    pub(crate) fn begin_mutation(&self) {
        self.sharable.lock_exclusive();
        if cfg!(debug_assertions) {
            self.write_intent.store(1, Ordering::Release);
        }
    }

    /// Sink side: leave the payload mutation window.
    pub(crate) fn end_mutation(&self) {
        if cfg!(debug_assertions) {
            self.write_intent.store(0, Ordering::Release);
        }
        self.sharable.unlock_exclusive();
    }

    /// Sink side, step 5: latch the barrier, publish the sample number,
    /// broadcast. `write_number` only ever advances here, after the
    /// exclusive lock is released, so an observed advance implies fully
    /// written payload bytes.
    pub(crate) fn sink_publish(&self) {
        self.mutex.with(|| {
            let readers = self.source_ref_count.load(Ordering::Acquire);
            self.read_barrier.store(readers, Ordering::Release);
            let sample = self.sample_number.load(Ordering::Acquire);
            self.write_number.store(sample, Ordering::Release);
            if self.state() == NodeState::SinkBound {
                self.state
                    .store(NodeState::SinkPresent as u32, Ordering::Release);
            }
        });
        self.cond.notify_all();
    }

    /// Source side, steps 1-3: wait for a sample newer than `last_seen`.
    ///
    /// Pending data wins over `END`: a sink that pushes its final sample and
    /// immediately closes must not cause attached sources to drop that
    /// sample, so end-of-stream is reported only once there is nothing left
    /// to consume.
    pub(crate) fn source_await(
        &self,
        last_seen: u64,
        interrupt: &Option<InterruptFlag>,
    ) -> Result<u64, CycleStop> {
        self.mutex.lock();
        loop {
            let write_number = self.write_number.load(Ordering::Acquire);
            if write_number > last_seen {
                self.mutex.unlock();
                return Ok(write_number);
            }
            if self.state() == NodeState::End {
                self.mutex.unlock();
                return Err(CycleStop::Closed);
            }
            if interrupted(interrupt) {
                self.mutex.unlock();
                return Err(CycleStop::Interrupted);
            }
            self.cond.wait(&self.mutex, Some(WAIT_TICK));
        }
    }

    /// Source side: enter the payload observation window.
    pub(crate) fn begin_observation(&self) {
        self.sharable.lock_sharable();
        debug_assert_eq!(
            self.write_intent.load(Ordering::Acquire),
            0,
            "payload mutated outside the exclusive lock"
        );
    }

    /// Source side: leave the payload observation window.
    pub(crate) fn end_observation(&self) {
        self.sharable.unlock_sharable();
    }

    /// Source side, step 5: release this sample.
    pub(crate) fn source_post(&self) {
        let mut wake = false;
        self.mutex.with(|| {
            let barrier = self.read_barrier.load(Ordering::Acquire);
            debug_assert!(barrier > 0, "post with a clear barrier");
            if barrier > 0 {
                self.read_barrier.store(barrier - 1, Ordering::Release);
                wake = barrier == 1;
            }
        });
        if wake {
            self.cond.notify_all();
        }
    }
}

/// Locate the node for `name` in `arena`, constructing and initializing it
/// if this participant is the first toucher. The in-place init runs under
/// the arena's directory lock, so nobody can find a half-initialized node.
pub(crate) fn find_or_construct_node(
    arena: &weir_shm::Arena,
    name: &str,
) -> Result<std::ptr::NonNull<Node>, NodeError> {
    use weir_shm::ArenaError;

    let object = node_object_name(name);
    let handle = match arena.construct(
        &object,
        core::mem::size_of::<Node>(),
        core::mem::align_of::<Node>(),
        |p| {
            // SAFETY: the arena just allocated size_of::<Node>() bytes at
            // Node's alignment; we are the only reference until the
            // directory entry is published.
            unsafe { (*(p as *mut Node)).init() }
        },
    ) {
        Ok(handle) => handle,
        Err(ArenaError::NameCollision { .. }) => arena
            .find(&object)
            .ok_or(NodeError::Arena(ArenaError::BadLayout(
                "node registered but not findable",
            )))?,
        Err(e) => return Err(e.into()),
    };

    // SAFETY: the handle refers to a Node initialized above or by the
    // participant that won the construction race.
    let ptr = unsafe { arena.typed::<Node>(handle)? };
    Ok(std::ptr::NonNull::new(ptr).expect("arena returned a null address"))
}
