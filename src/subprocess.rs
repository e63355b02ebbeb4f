//! Supervised child process for local-media extraction (spec.md 4.4,
//! 6.3, 9).
//!
//! Grounded on `original_source/src/vs-thumb/thumbnailextractor.{h,cpp}`
//! for the exit-code contract (0/1/2/crash) and on spec.md 9's
//! "spawn, wait with a deadline, graceful then forceful termination"
//! note. Built on `tokio::process` (already pulled in by the workspace's
//! `tokio` `full` feature), not a separate process-supervision crate.

use std::path::Path;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;

use crate::error::{Result, ThumbError};

/// How long to wait, after a forced kill, for the child to actually
/// exit before giving up on reaping it.
const KILL_REAP_GRACE: Duration = Duration::from_millis(500);

/// Run the extractor binary against `input_url`, writing its rendition
/// to `output_target`, within `deadline`. Maps the subprocess exit-code
/// contract in spec.md 6.3 onto the crate's error taxonomy: 0 is
/// success, 1 is `NotFound` (no suitable frame or cover), 2 and any
/// other exit or signal is `HardError`. Deadline expiry kills the child
/// and returns `Timeout`.
pub async fn run_extractor(
    executable: &Path,
    input_url: &str,
    output_target: &str,
    deadline: Duration,
) -> Result<()> {
    let mut child = Command::new(executable)
        .arg(input_url)
        .arg(output_target)
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ThumbError::HardError(format!("failed to spawn extractor: {e}")))?;

    match timeout(deadline, child.wait()).await {
        Ok(Ok(status)) => map_exit_status(status),
        Ok(Err(e)) => Err(ThumbError::HardError(format!("extractor wait failed: {e}"))),
        Err(_) => {
            terminate(&mut child).await;
            Err(ThumbError::Timeout)
        }
    }
}

fn map_exit_status(status: std::process::ExitStatus) -> Result<()> {
    match status.code() {
        Some(0) => Ok(()),
        Some(1) => Err(ThumbError::NotFound),
        Some(2) => Err(ThumbError::HardError("extractor pipeline failure".to_string())),
        Some(other) => Err(ThumbError::HardError(format!(
            "extractor exited with unexpected code {other}"
        ))),
        None => Err(ThumbError::HardError(
            "extractor terminated by signal".to_string(),
        )),
    }
}

/// Forceful termination. There is no portable SIGTERM-then-SIGKILL
/// escalation without a signal-handling crate outside this workspace's
/// dependency set, so this sends a kill directly and gives the OS a
/// short grace period to reap the child.
async fn terminate(child: &mut tokio::process::Child) {
    if let Err(e) = child.start_kill() {
        tracing::warn!(error = %e, "failed to kill extractor subprocess");
        return;
    }
    if timeout(KILL_REAP_GRACE, child.wait()).await.is_err() {
        tracing::warn!("extractor subprocess did not exit after kill within grace period");
    }
}
