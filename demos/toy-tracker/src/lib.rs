//! Shared plumbing for the toy pipeline binaries.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

use weir::InterruptFlag;

static STOP: OnceLock<InterruptFlag> = OnceLock::new();

extern "C" fn on_sigint(_: libc::c_int) {
    if let Some(flag) = STOP.get() {
        flag.store(true, Ordering::Relaxed);
    }
}

/// Install a SIGINT handler that raises the returned flag. The handler does
/// nothing but store; the main loop and the endpoints poll the flag.
pub fn stop_flag() -> InterruptFlag {
    let flag = STOP
        .get_or_init(|| InterruptFlag::new(AtomicBool::new(false)))
        .clone();
    let handler = on_sigint as extern "C" fn(libc::c_int);
    // SAFETY: the handler only stores to an atomic.
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
    }
    flag
}

/// `RUST_LOG`-controlled subscriber for the demo binaries.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();
}

/// Wall-clock microseconds, the timestamp the detector stamps on samples.
pub fn now_usec() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}
