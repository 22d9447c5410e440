//! Thin wrappers over the Linux futex syscall.
//!
//! Every word these functions operate on lives in a shared-memory mapping
//! visible to several processes, so `FUTEX_PRIVATE_FLAG` is never used.

use std::sync::atomic::AtomicU32;
use std::time::Duration;

/// Outcome of a [`wait`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Woken by [`wake_one`]/[`wake_all`], or spuriously.
    Woken,
    /// The word no longer held the expected value when the wait started.
    ValueChanged,
    /// The timeout expired.
    TimedOut,
    /// A signal arrived during the wait.
    Interrupted,
}

/// Block until `word` is woken, as long as it still holds `expected`.
///
/// Callers must treat any return as potentially spurious and re-check their
/// predicate in a loop.
pub fn wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> WaitOutcome {
    let ts;
    let ts_ptr = match timeout {
        Some(t) => {
            ts = libc::timespec {
                tv_sec: t.as_secs() as libc::time_t,
                tv_nsec: t.subsec_nanos() as libc::c_long,
            };
            &ts as *const libc::timespec
        }
        None => std::ptr::null(),
    };

    // SAFETY: `word` outlives the syscall; FUTEX_WAIT only reads the word and
    // sleeps, it never writes through the pointer.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT,
            expected,
            ts_ptr,
        )
    };

    if rc == 0 {
        return WaitOutcome::Woken;
    }
    match std::io::Error::last_os_error().raw_os_error() {
        Some(libc::EAGAIN) => WaitOutcome::ValueChanged,
        Some(libc::ETIMEDOUT) => WaitOutcome::TimedOut,
        Some(libc::EINTR) => WaitOutcome::Interrupted,
        // Anything else is indistinguishable from a spurious wakeup for our
        // callers, all of which re-check predicates.
        _ => WaitOutcome::Woken,
    }
}

/// Wake at most one waiter on `word`. Returns the number of waiters woken.
pub fn wake_one(word: &AtomicU32) -> usize {
    wake(word, 1)
}

/// Wake every waiter on `word`. Returns the number of waiters woken.
pub fn wake_all(word: &AtomicU32) -> usize {
    wake(word, i32::MAX)
}

fn wake(word: &AtomicU32, n: i32) -> usize {
    // SAFETY: `word` outlives the syscall; FUTEX_WAKE does not dereference
    // the pointer, it only uses the address as a key.
    let rc = unsafe { libc::syscall(libc::SYS_futex, word.as_ptr(), libc::FUTEX_WAKE, n) };
    if rc < 0 { 0 } else { rc as usize }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::Ordering;

    #[test]
    fn wait_returns_on_value_mismatch() {
        let word = AtomicU32::new(7);
        assert_eq!(wait(&word, 3, None), WaitOutcome::ValueChanged);
    }

    #[test]
    fn wait_times_out() {
        let word = AtomicU32::new(0);
        let out = wait(&word, 0, Some(Duration::from_millis(10)));
        assert_eq!(out, WaitOutcome::TimedOut);
    }

    #[test]
    fn wake_releases_waiter() {
        let word = Arc::new(AtomicU32::new(0));
        let w = word.clone();
        let t = std::thread::spawn(move || {
            while w.load(Ordering::Acquire) == 0 {
                wait(&w, 0, Some(Duration::from_millis(100)));
            }
        });
        std::thread::sleep(Duration::from_millis(20));
        word.store(1, Ordering::Release);
        wake_all(&word);
        t.join().unwrap();
    }
}
