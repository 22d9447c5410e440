//! Process-shared synchronization primitives.
//!
//! All three types are plain `repr(C)` values meant to be embedded in a
//! shared-memory mapping and driven through `&self` from every process that
//! maps it. They are built directly on the futex syscall, with no
//! process-private fast paths, so a word locked in one process is observed
//! locked in all of them.
//!
//! None of these types implement `Drop`; a mapping can disappear at any time
//! and there is nothing to tear down.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::futex::{self, WaitOutcome};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const CONTENDED: u32 = 2;

/// A futex-based mutual exclusion lock embeddable in shared memory.
///
/// Three states: unlocked, locked with no waiters, locked with possible
/// waiters. Unlock only enters the kernel when a waiter may exist.
#[repr(C)]
pub struct Mutex {
    word: AtomicU32,
}

const _: () = assert!(core::mem::size_of::<Mutex>() == 4);

impl Mutex {
    /// Initialize in place to the unlocked state.
    pub fn init(&mut self) {
        self.word = AtomicU32::new(UNLOCKED);
    }

    pub fn lock(&self) {
        if self
            .word
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
        self.lock_contended();
    }

    fn lock_contended(&self) {
        loop {
            let prev = self.word.swap(CONTENDED, Ordering::Acquire);
            if prev == UNLOCKED {
                return;
            }
            futex::wait(&self.word, CONTENDED, None);
        }
    }

    pub fn unlock(&self) {
        if self.word.swap(UNLOCKED, Ordering::Release) == CONTENDED {
            futex::wake_one(&self.word);
        }
    }

    /// Run `f` with the lock held.
    pub fn with<R>(&self, f: impl FnOnce() -> R) -> R {
        self.lock();
        let r = f();
        self.unlock();
        r
    }
}

/// A condition variable embeddable in shared memory.
///
/// A single sequence word is bumped on every notification. Waiters snapshot
/// the sequence under the caller's [`Mutex`], release it, and sleep until the
/// sequence moves past the snapshot. Wakeups may be spurious; every caller
/// re-checks its predicate in a loop.
#[repr(C)]
pub struct Condvar {
    seq: AtomicU32,
}

const _: () = assert!(core::mem::size_of::<Condvar>() == 4);

impl Condvar {
    /// Initialize in place.
    pub fn init(&mut self) {
        self.seq = AtomicU32::new(0);
    }

    /// Atomically release `mutex`, wait for a notification (or `timeout`),
    /// and reacquire `mutex` before returning.
    ///
    /// The atomicity that matters is wakeup-loss freedom: a notification that
    /// happens after the caller checked its predicate (under `mutex`) and
    /// before it went to sleep is still observed, because the notifier bumps
    /// the sequence this waiter snapshotted.
    pub fn wait(&self, mutex: &Mutex, timeout: Option<Duration>) -> WaitOutcome {
        let snapshot = self.seq.load(Ordering::Acquire);
        mutex.unlock();
        let out = futex::wait(&self.seq, snapshot, timeout);
        mutex.lock();
        out
    }

    pub fn notify_all(&self) {
        self.seq.fetch_add(1, Ordering::Release);
        futex::wake_all(&self.seq);
    }

    pub fn notify_one(&self) {
        self.seq.fetch_add(1, Ordering::Release);
        futex::wake_one(&self.seq);
    }
}

/// A readers-writer lock embeddable in shared memory: many sharable holders
/// xor one exclusive holder.
///
/// Built from the in-memory [`Mutex`]/[`Condvar`] pair rather than a bare
/// futex state machine; the critical sections it protects are short
/// observation and mutation windows, so throughput is not the concern here,
/// cross-process correctness is.
#[repr(C)]
pub struct SharableMutex {
    mutex: Mutex,
    cond: Condvar,
    readers: AtomicU32,
    writer: AtomicU32,
}

const _: () = assert!(core::mem::size_of::<SharableMutex>() == 16);

impl SharableMutex {
    /// Initialize in place to the free state.
    pub fn init(&mut self) {
        self.mutex.init();
        self.cond.init();
        self.readers = AtomicU32::new(0);
        self.writer = AtomicU32::new(0);
    }

    pub fn lock_sharable(&self) {
        self.mutex.lock();
        while self.writer.load(Ordering::Relaxed) != 0 {
            self.cond.wait(&self.mutex, None);
        }
        self.readers.fetch_add(1, Ordering::Relaxed);
        self.mutex.unlock();
    }

    pub fn unlock_sharable(&self) {
        self.mutex.lock();
        let prev = self.readers.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "unlock_sharable without matching lock");
        self.mutex.unlock();
        if prev == 1 {
            self.cond.notify_all();
        }
    }

    pub fn lock_exclusive(&self) {
        self.mutex.lock();
        while self.writer.load(Ordering::Relaxed) != 0
            || self.readers.load(Ordering::Relaxed) != 0
        {
            self.cond.wait(&self.mutex, None);
        }
        self.writer.store(1, Ordering::Relaxed);
        self.mutex.unlock();
    }

    pub fn unlock_exclusive(&self) {
        self.mutex.lock();
        debug_assert_eq!(self.writer.load(Ordering::Relaxed), 1);
        self.writer.store(0, Ordering::Relaxed);
        self.mutex.unlock();
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU64;

    fn boxed<T>(init: impl FnOnce(&mut T)) -> Arc<T> {
        // SAFETY: all three sync types are valid in any byte state once
        // init() has run; we hand init a zeroed value.
        let mut v: Box<T> = unsafe { Box::new_zeroed().assume_init() };
        init(&mut v);
        Arc::from(v)
    }

    #[test]
    fn mutex_excludes() {
        let m: Arc<Mutex> = boxed(|m: &mut Mutex| m.init());
        let counter = Arc::new(AtomicU64::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let m = m.clone();
            let counter = counter.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..10_000 {
                    m.lock();
                    let v = counter.load(Ordering::Relaxed);
                    counter.store(v + 1, Ordering::Relaxed);
                    m.unlock();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 40_000);
    }

    #[test]
    fn condvar_wakes_waiter() {
        let m: Arc<Mutex> = boxed(|m: &mut Mutex| m.init());
        let c: Arc<Condvar> = boxed(|c: &mut Condvar| c.init());
        let flag = Arc::new(AtomicU32::new(0));

        let (m2, c2, f2) = (m.clone(), c.clone(), flag.clone());
        let t = std::thread::spawn(move || {
            m2.lock();
            while f2.load(Ordering::Relaxed) == 0 {
                c2.wait(&m2, Some(Duration::from_millis(100)));
            }
            m2.unlock();
        });

        std::thread::sleep(Duration::from_millis(20));
        m.lock();
        flag.store(1, Ordering::Relaxed);
        m.unlock();
        c.notify_all();
        t.join().unwrap();
    }

    #[test]
    fn sharable_admits_readers_excludes_writer() {
        let rw: Arc<SharableMutex> = boxed(|rw: &mut SharableMutex| rw.init());
        let value = Arc::new(AtomicU64::new(0));

        rw.lock_sharable();
        rw.lock_sharable(); // two concurrent sharable holders
        let (rw2, v2) = (rw.clone(), value.clone());
        let writer = std::thread::spawn(move || {
            rw2.lock_exclusive();
            v2.store(1, Ordering::Relaxed);
            rw2.unlock_exclusive();
        });

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(value.load(Ordering::Relaxed), 0, "writer got in past readers");
        rw.unlock_sharable();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(value.load(Ordering::Relaxed), 0, "writer got in past a reader");
        rw.unlock_sharable();
        writer.join().unwrap();
        assert_eq!(value.load(Ordering::Relaxed), 1);
    }
}
