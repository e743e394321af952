//! Shared utility functions.

use std::ffi::OsStr;
use std::path::Path;
use std::process::{Output, Stdio};
use std::time::Duration;

use tokio::process::Command;
use tokio::task::spawn_blocking;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::{flog_trace, Error, Result};

pub async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(f)
        .await
        .map_err(|e| Error::TaskJoin(e.to_string()))?
}

/// Run an external program in `dir`, racing it against `deadline` and
/// `cancel`. The child is killed when either fires.
///
/// A non-zero exit is not an error here.
pub async fn run_command<S: AsRef<OsStr>>(
    program: impl AsRef<OsStr>,
    args: &[S],
    dir: &Path,
    deadline: Duration,
    cancel: &CancellationToken,
) -> Result<Output> {
    let mut cmd = Command::new(program.as_ref());
    cmd.args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .kill_on_drop(true);
    flog_trace!("run_command {:?} (in {})", program.as_ref(), dir.display());

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        res = timeout(deadline, cmd.output()) => Ok(res.map_err(|_| Error::Timeout(deadline))??),
    }
}

/// Stdout followed by stderr, lossily decoded.
pub fn combined_output(output: &Output) -> String {
    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    combined
}

/// Truncate to `max` characters, replacing the tail with `...` when cut.
pub fn truncate_title(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let keep = max.saturating_sub(3);
    let mut out: String = text.chars().take(keep).collect();
    out.push_str("...");
    out
}

/// Replace every character outside `[A-Za-z0-9_-]` with `-` so the value can
/// be embedded in a directory name.
pub fn sanitize_name(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}
