//! The download side of an update: who can bring a Target's tree commit
//! into the local repository, and how failures are classified.

use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use camino::Utf8PathBuf;

use crate::ostree::repo::Repo;
use crate::ostree::sysroot::Sysroot;
use crate::target::Target;

/// Why a download did not complete.
#[derive(Debug, thiserror::Error)]
pub(crate) enum DownloadError {
    /// All remotes failed; the message accumulates every attempt.
    #[error("download failed: {0}")]
    Failed(String),
    /// The tree repository refused the pull for lack of storage, or the
    /// insufficient-space gate rejected the attempt outright.
    #[error("insufficient storage available; path: {path}; err: {msg}")]
    NoSpace {
        /// The sysroot whose volume is exhausted.
        path: Utf8PathBuf,
        /// The underlying diagnostic.
        msg: String,
    },
    /// The pull finished but the commit does not resolve locally.
    #[error("downloaded tree failed verification: {0}")]
    Verification(String),
    /// The flow-control token asked us to stop.
    #[error("download aborted")]
    Aborted,
}

/// Pulls a Target's tree commit into the sysroot repository.
pub(crate) trait Downloader {
    /// Download everything the Target's tree needs; apps are handled
    /// separately by the app engine.
    fn download(&self, target: &Target) -> Result<(), DownloadError>;
}

/// Cooperative cancellation, checked at well-defined boundaries: before
/// each remote try, before each app fetch, and before finalize. The
/// flag is tripped by the termination signals registered at startup, so
/// a stopping agent finishes its current step instead of dying inside
/// one.
#[derive(Debug, Default)]
pub(crate) struct FlowControlToken(Arc<AtomicBool>);

impl FlowControlToken {
    /// Trip this token on SIGINT/SIGTERM.
    pub(crate) fn register_signals(&self) -> std::io::Result<()> {
        for sig in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
            signal_hook::flag::register(sig, Arc::clone(&self.0))?;
        }
        Ok(())
    }

    /// Whether work may proceed past the current boundary.
    pub(crate) fn can_continue(&self) -> bool {
        !self.0.load(Ordering::SeqCst)
    }

    /// Trip the token directly, in place of a signal.
    #[cfg(test)]
    pub(crate) fn trip(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Offline downloader: pulls the commit from a mirror repository on the
/// local filesystem instead of the network.
#[derive(Debug)]
pub(crate) struct OstreePuller {
    sysroot: Rc<Sysroot>,
    src_repo_path: Utf8PathBuf,
}

impl OstreePuller {
    /// Create a puller reading from the repository at `src_repo_path`.
    pub(crate) fn new(sysroot: Rc<Sysroot>, src_repo_path: Utf8PathBuf) -> Self {
        Self {
            sysroot,
            src_repo_path,
        }
    }
}

impl Downloader for OstreePuller {
    fn download(&self, target: &Target) -> Result<(), DownloadError> {
        let repo = Repo::open(self.sysroot.repo_path())
            .map_err(|e| DownloadError::Failed(e.to_string()))?;
        repo.pull_local(&self.src_repo_path, &target.sha256)
            .map_err(|e| {
                tracing::error!("Offline ostree download failed: {e}");
                DownloadError::Failed(e.to_string())
            })
    }
}
