//! Process tree termination
//!
//! Children are spawned as leaders of their own process group, so the
//! group id equals the child's pid and signalling `-pid` reaches every
//! descendant that did not deliberately leave the group.

use std::io;
use std::time::Duration;

/// Grace period between SIGTERM and SIGKILL
pub const TERM_GRACE: Duration = Duration::from_millis(200);

/// Kill a process and all its descendants.
///
/// Sends SIGTERM to the process group, waits `grace`, then SIGKILL.
/// A group that is already gone is not an error.
pub async fn kill_process_tree(pid: u32, grace: Duration) -> io::Result<()> {
    if pid == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "pid must be non-zero",
        ));
    }

    #[cfg(unix)]
    {
        if !signal_group(pid, libc::SIGTERM)? {
            return Ok(());
        }
        tokio::time::sleep(grace).await;
        signal_group(pid, libc::SIGKILL)?;
        Ok(())
    }

    #[cfg(not(unix))]
    {
        let _ = grace;
        let output = tokio::process::Command::new("taskkill")
            .args(["/t", "/f", "/pid", &pid.to_string()])
            .output()
            .await?;
        if !output.status.success() {
            return Err(io::Error::other(format!(
                "taskkill failed for pid {} (exit {:?})",
                pid,
                output.status.code()
            )));
        }
        Ok(())
    }
}

/// Signal every process in group `pgid`.
///
/// Returns `Ok(false)` if the group no longer exists.
#[cfg(unix)]
fn signal_group(pgid: u32, signal: libc::c_int) -> io::Result<bool> {
    let pgid = libc::pid_t::try_from(pgid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;

    // SAFETY: kill has no memory-safety preconditions; a negative pid
    // addresses the process group.
    let rc = unsafe { libc::kill(-pgid, signal) };
    if rc == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(false);
    }
    Err(err)
}
