//! Process group supervision for lane workers
//!
//! Every worker is spawned as the leader of its own process group. When the
//! lane ends, for whatever reason, [`ProcessGroup::shutdown`] sends SIGTERM
//! to the whole group and, if anything is still alive after the grace
//! period, SIGKILL. This reaches grandchildren the worker started and never
//! cleaned up. The lane awaits the shutdown before it reports `lane:end`.

use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::Child;
use tracing::{debug, info, warn};

#[cfg(unix)]
use nix::sys::signal::{killpg, Signal};
#[cfg(unix)]
use nix::unistd::Pid;

/// Default time between SIGTERM and SIGKILL
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(2);

/// How often a terminating group is checked for survivors
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Owns a process group.
///
/// Call [`shutdown`](Self::shutdown) to tear it down in order. A group
/// dropped without a shutdown is killed outright.
#[derive(Debug)]
pub struct ProcessGroup {
    pgid: u32,
    grace: Duration,
    released: bool,
}

impl ProcessGroup {
    /// Take ownership of the group led by `pid`
    pub fn new(pid: u32, grace: Duration) -> Self {
        Self {
            pgid: pid,
            grace,
            released: false,
        }
    }

    pub fn id(&self) -> u32 {
        self.pgid
    }

    /// Whether any member of the group is still around
    #[cfg(unix)]
    pub fn is_alive(&self) -> bool {
        killpg(self.pid(), None).is_ok()
    }

    #[cfg(unix)]
    fn pid(&self) -> Pid {
        Pid::from_raw(self.pgid as i32)
    }

    /// SIGTERM the group, wait up to the grace period for it to empty, then
    /// SIGKILL whatever is left. `leader` is reaped along the way; its exit
    /// status is returned.
    #[cfg(unix)]
    pub async fn shutdown(mut self, leader: &mut Child) -> Option<ExitStatus> {
        self.released = true;
        let pgid = self.pid();

        // Reap first so an exited leader does not linger as a group member.
        let _ = leader.try_wait();
        if killpg(pgid, Signal::SIGTERM).is_err() {
            // Nothing left in the group.
            return leader.try_wait().ok().flatten();
        }
        debug!("Sent SIGTERM to process group {}", pgid);

        let deadline = tokio::time::Instant::now() + self.grace;
        loop {
            let _ = leader.try_wait();
            if killpg(pgid, None).is_err() {
                debug!("Process group {} exited", pgid);
                return leader.try_wait().ok().flatten();
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        info!("Process group {} outlived grace period, sending SIGKILL", pgid);
        if let Err(e) = killpg(pgid, Signal::SIGKILL) {
            debug!("SIGKILL to process group {} failed: {}", pgid, e);
        }
        match leader.wait().await {
            Ok(status) => Some(status),
            Err(e) => {
                warn!("Failed to reap lane worker {}: {}", pgid, e);
                None
            }
        }
    }

    #[cfg(not(unix))]
    pub async fn shutdown(mut self, leader: &mut Child) -> Option<ExitStatus> {
        self.released = true;
        if let Ok(Some(status)) = leader.try_wait() {
            return Some(status);
        }
        let _ = leader.start_kill();
        leader.wait().await.ok()
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        if !self.released {
            self.kill_now();
        }
    }
}

impl ProcessGroup {
    #[cfg(unix)]
    fn kill_now(&self) {
        if killpg(self.pid(), Signal::SIGKILL).is_ok() {
            warn!("Process group {} dropped without shutdown, killed", self.pgid);
        }
    }

    #[cfg(not(unix))]
    fn kill_now(&self) {}
}
