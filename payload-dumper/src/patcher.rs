// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    ffi::{OsStr, OsString},
    fmt, io,
    path::Path,
    process::{Child, Command, ExitStatus, Stdio},
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{debug, trace};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to run {0:?}")]
    Spawn(OsString, #[source] io::Error),
    #[error("{0:?} failed with {1}")]
    Failed(OsString, ExitStatus),
    #[error("{0:?} did not finish within {1:?}")]
    Timeout(OsString, Duration),
    #[error("{0:?} was cancelled")]
    Cancelled(OsString),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// The binary diff format of a patch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PatchKind {
    /// bsdiff-class patches (`SOURCE_BSDIFF`, `BROTLI_BSDIFF`).
    Bsdiff,
    /// puffin patches (`PUFFDIFF`).
    Puffin,
}

impl fmt::Display for PatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bsdiff => f.write_str("bsdiff"),
            Self::Puffin => f.write_str("puffin"),
        }
    }
}

/// Everything a patch tool needs to write the new data for one operation. The
/// range strings are comma-separated `<offset>:<length>` byte ranges.
#[derive(Clone, Copy, Debug)]
pub struct PatchRequest<'a> {
    pub kind: PatchKind,
    pub old_image: &'a Path,
    pub new_image: &'a Path,
    pub patch: &'a Path,
    pub src_ranges: &'a str,
    pub dst_ranges: &'a str,
}

/// Applies a binary patch from `old_image` into the destination ranges of
/// `new_image`. Implementations must write directly to `new_image`.
pub trait Patcher: Sync {
    fn apply(&self, request: &PatchRequest, cancel_signal: &AtomicBool) -> Result<()>;
}

/// Patcher that runs external `bspatch` and `puffin` executables.
#[derive(Clone, Debug)]
pub struct ExternalPatcher {
    pub bspatch: OsString,
    pub puffin: OsString,
    /// Maximum time to wait for a single patch process.
    pub timeout: Option<Duration>,
}

impl Default for ExternalPatcher {
    fn default() -> Self {
        Self {
            bspatch: "bspatch".into(),
            puffin: "puffin".into(),
            timeout: Some(Duration::from_secs(600)),
        }
    }
}

impl ExternalPatcher {
    /// Build the command line for a request without running it.
    pub fn command(&self, request: &PatchRequest) -> Command {
        match request.kind {
            PatchKind::Bsdiff => {
                let mut command = Command::new(&self.bspatch);
                command
                    .arg(request.old_image)
                    .arg(request.new_image)
                    .arg(request.patch)
                    .arg(request.src_ranges)
                    .arg(request.dst_ranges);
                command
            }
            PatchKind::Puffin => {
                let mut command = Command::new(&self.puffin);
                command
                    .args(["-operation", "puffpatch"])
                    .arg("-src_file")
                    .arg(request.old_image)
                    .arg("-dst_file")
                    .arg(request.new_image)
                    .arg("-patch_file")
                    .arg(request.patch)
                    .arg("-src_extents")
                    .arg(request.src_ranges)
                    .arg("-dst_extents")
                    .arg(request.dst_ranges);
                command
            }
        }
    }
}

impl Patcher for ExternalPatcher {
    fn apply(&self, request: &PatchRequest, cancel_signal: &AtomicBool) -> Result<()> {
        let mut command = self.command(request);
        let program = command.get_program().to_owned();

        trace!("Running {:?}", command);

        let child = command
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| Error::Spawn(program.clone(), e))?;

        let status = wait_bounded(child, &program, self.timeout, cancel_signal)?;
        if !status.success() {
            return Err(Error::Failed(program, status));
        }

        debug!("{} patch applied to {:?}", request.kind, request.new_image);

        Ok(())
    }
}

/// Wait for `child` to exit. The child is killed if `timeout` elapses or
/// `cancel_signal` is set.
fn wait_bounded(
    mut child: Child,
    program: &OsStr,
    timeout: Option<Duration>,
    cancel_signal: &AtomicBool,
) -> Result<ExitStatus> {
    let start = Instant::now();

    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }

        let error = if cancel_signal.load(Ordering::SeqCst) {
            Some(Error::Cancelled(program.to_owned()))
        } else {
            timeout
                .filter(|t| start.elapsed() >= *t)
                .map(|t| Error::Timeout(program.to_owned(), t))
        };

        if let Some(error) = error {
            // The process may have exited in the meantime.
            let _ = child.kill();
            child.wait()?;
            return Err(error);
        }

        thread::sleep(POLL_INTERVAL);
    }
}
