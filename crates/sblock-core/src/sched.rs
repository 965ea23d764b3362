//! Real-time scheduling for event threads.

use std::io;

use tracing::{debug, warn};

/// Switch the calling thread to `SCHED_FIFO` at `priority`.
#[cfg(target_os = "linux")]
pub fn probe_realtime(priority: i32) -> io::Result<()> {
    let param = libc::sched_param {
        sched_priority: priority,
    };
    // SAFETY: pthread_self() names the calling thread and param outlives the call.
    let rc = unsafe { libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(rc))
    }
}

#[cfg(not(target_os = "linux"))]
pub fn probe_realtime(_priority: i32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "real-time scheduling is only wired up on Linux",
    ))
}

/// Best-effort version of [`probe_realtime`] used by event threads. A
/// failure leaves the thread at normal priority.
pub(crate) fn apply_realtime_priority(priority: i32) {
    match probe_realtime(priority) {
        Ok(()) => debug!(priority, "event thread running SCHED_FIFO"),
        Err(err) => warn!(priority, error = %err, "real-time priority not applied"),
    }
}
