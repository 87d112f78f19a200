//! Manager of the root filesystem tree: pulls a Target's commit through
//! an ordered cascade of remotes, gates retries after storage
//! exhaustion, and deploys the commit into the sysroot.

use std::rc::Rc;

use anyhow::{Context, Result};
use camino::Utf8Path;
use edgeupd_utils::Task;
use fn_error_context::context;
use serde::Deserialize;

use crate::download::{DownloadError, Downloader, FlowControlToken};
use crate::ostree::repo::{Repo, TlsMaterial};
use crate::ostree::sysroot::{Slot, Sysroot};
use crate::target::Target;

/// Repo config group recording, per Target, the bytes that were
/// available when a pull last failed for lack of space.
const MIN_FREE_SPACE_SECTION: &str = "min-free-space-required";
/// The available space must have grown by more than this before a
/// Target hit by a space failure is retried.
const MIN_FREE_SPACE_DELTA: u64 = 4 * 1024;
/// Name given to every remote obtained from the download-urls helper.
const DOWNLOAD_URL_REMOTE: &str = "gcs";

/// One entry in the download cascade.
#[derive(Debug)]
struct Remote {
    name: String,
    base_url: String,
    headers: Vec<(String, String)>,
    tls: Option<TlsMaterial>,
    is_set: bool,
}

/// An entry of the device gateway's `download-urls` response.
#[derive(Debug, Deserialize)]
struct DownloadUrl {
    download_url: String,
    access_token: String,
}

/// Drives downloads and deploys of Target tree commits.
#[derive(Debug, Clone)]
pub(crate) struct RootfsTreeManager {
    sysroot: Rc<Sysroot>,
    token: Rc<FlowControlToken>,
    client: reqwest::blocking::Client,
    gateway_url: String,
    remote_name: String,
    tree_server: String,
    tls: Option<TlsMaterial>,
}

impl RootfsTreeManager {
    /// Create a manager pulling from `tree_server` (registered under
    /// `remote_name`), with `gateway_url` as the download-urls helper.
    pub(crate) fn new(
        sysroot: Rc<Sysroot>,
        token: Rc<FlowControlToken>,
        client: reqwest::blocking::Client,
        gateway_url: String,
        remote_name: String,
        tree_server: String,
        tls: Option<TlsMaterial>,
    ) -> Self {
        Self {
            sysroot,
            token,
            client,
            gateway_url,
            remote_name,
            tree_server,
            tls,
        }
    }

    fn repo(&self) -> Result<Repo, DownloadError> {
        Repo::open_or_create(self.sysroot.repo_path())
            .map_err(|e| DownloadError::Failed(e.to_string()))
    }

    /// Deploy a downloaded commit and observe the resulting sysroot
    /// change.
    #[context("Installing {target}")]
    pub(crate) fn install(&self, target: &Target) -> Result<()> {
        Task::new(format!("Deploying {}", target.sha256), "ostree")
            .arg(format!("--sysroot={}", self.sysroot.path()))
            .args(["admin", "deploy"])
            .arg(format!("--os={}", self.sysroot.os_name()))
            .arg(&target.sha256)
            .quiet()
            .run_captured()
            .map(|_| ())?;
        self.install_notify();
        Ok(())
    }

    fn install_notify(&self) {
        let slots = |s: &Sysroot| {
            let cur = s.hash_of(Slot::Current).ok().flatten().unwrap_or_default();
            let pend = s.hash_of(Slot::Pending).ok().flatten().unwrap_or_default();
            (cur, pend)
        };
        if self.sysroot.reload() {
            let (cur, pend) = slots(&self.sysroot);
            tracing::debug!(
                "Change in the ostree-based sysroot has been detected after installation; \
                 booted on: {cur} pending: {pend}"
            );
        } else {
            let (cur, pend) = slots(&self.sysroot);
            tracing::warn!(
                "Change in the ostree-based sysroot has NOT been detected after installation; \
                 booted on: {cur} pending: {pend}"
            );
        }
    }

    fn remotes_for(&self, target: &Target) -> Vec<Remote> {
        let mut remotes = vec![Remote {
            name: self.remote_name.clone(),
            base_url: self.tree_server.clone(),
            headers: vec![("X-Correlation-ID".to_string(), target.name.clone())],
            tls: self.tls.clone(),
            is_set: false,
        }];
        // Alternative URLs are prepended in the order returned so the
        // earliest returned URL is tried first.
        for (i, u) in self.download_urls().into_iter().enumerate() {
            remotes.insert(
                i,
                Remote {
                    name: DOWNLOAD_URL_REMOTE.to_string(),
                    base_url: u.download_url,
                    headers: vec![
                        ("X-Correlation-ID".to_string(), target.name.clone()),
                        (
                            "Authorization".to_string(),
                            format!("Bearer {}", u.access_token),
                        ),
                    ],
                    tls: None,
                    is_set: false,
                },
            );
        }
        remotes
    }

    fn download_urls(&self) -> Vec<DownloadUrl> {
        let url = format!("{}/download-urls", self.gateway_url);
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::Value::Null)
            .send()
            .and_then(|r| r.error_for_status())
            .and_then(|r| r.json::<Vec<DownloadUrl>>());
        match resp {
            Ok(urls) => urls,
            Err(e) => {
                tracing::warn!(
                    "Failed to obtain download URLs from Gateway, fallback to download via gateway/proxy server: {e}"
                );
                Vec::new()
            }
        }
    }

    /// Whether the per-Target space marker allows another attempt.
    fn storage_gate_passes(&self, repo: &Repo, target: &Target) -> bool {
        let recorded = match repo.config_get(MIN_FREE_SPACE_SECTION, &target.name) {
            Ok(Some(s)) => match s.parse::<u64>() {
                Ok(v) => v,
                Err(e) => {
                    tracing::error!("Failed to check Target insufficient storage level: {e}");
                    return true;
                }
            },
            Ok(None) => return true,
            Err(e) => {
                tracing::error!("Failed to check Target insufficient storage level: {e}");
                return true;
            }
        };
        let available = match available_bytes(self.sysroot.path()) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("Failed to obtain info about available storage: {e}");
                return true;
            }
        };
        tracing::info!(
            "Target {} needs at least {} of free space, got {available}",
            target.name,
            recorded.saturating_add(MIN_FREE_SPACE_DELTA)
        );
        gate_passes(recorded, available)
    }

    fn set_storage_marker(&self, repo: &Repo, target: &Target) {
        let available = match available_bytes(self.sysroot.path()) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("Failed to obtain info about available storage: {e}");
                return;
            }
        };
        if let Err(e) = repo.config_set(
            MIN_FREE_SPACE_SECTION,
            &target.name,
            &available.to_string(),
        ) {
            tracing::error!("Failed to set Target insufficient storage level: {e}");
        }
    }

    fn unset_storage_marker(&self, repo: &Repo, target: &Target) {
        if let Err(e) = repo.config_unset(MIN_FREE_SPACE_SECTION, &target.name) {
            tracing::error!("Failed to unset Target insufficient storage level: {e}");
        }
    }
}

impl Downloader for RootfsTreeManager {
    fn download(&self, target: &Target) -> Result<(), DownloadError> {
        let repo = self.repo()?;
        if !self.storage_gate_passes(&repo, target) {
            let msg = "Skip Target download, available storage has not been increased since \
                       Target download failed last time due to lack of space";
            tracing::error!("{msg}");
            return Err(DownloadError::NoSpace {
                path: self.sysroot.path().to_owned(),
                msg: msg.to_string(),
            });
        }

        let mut error_desc = String::new();
        for remote in self.remotes_for(target) {
            if !self.token.can_continue() {
                return Err(DownloadError::Aborted);
            }
            tracing::info!(
                "Fetching ostree commit {} from {}",
                target.sha256,
                remote.base_url
            );
            if !remote.is_set {
                if let Err(e) = repo.add_remote(&remote.name, &remote.base_url, remote.tls.as_ref())
                {
                    error_desc += &format!("{e}\n");
                    continue;
                }
            }
            match repo.pull(&remote.name, &target.sha256, &remote.headers) {
                Ok(()) => {
                    self.unset_storage_marker(&repo, target);
                    // Prove the commit object is complete before
                    // reporting the download as done.
                    return repo
                        .resolve(&target.sha256)
                        .map(|_| ())
                        .map_err(|e| DownloadError::Verification(e.to_string()));
                }
                Err(e) => {
                    let msg = e.to_string();
                    tracing::error!("Failed to fetch from {}, err: {msg}", remote.base_url);
                    if msg.contains("would be exceeded, at least")
                        && (msg.contains("min-free-space-size")
                            || msg.contains("min-free-space-percent"))
                    {
                        self.set_storage_marker(&repo, target);
                        return Err(DownloadError::NoSpace {
                            path: self.sysroot.path().to_owned(),
                            msg,
                        });
                    }
                    self.unset_storage_marker(&repo, target);
                    error_desc += &format!("{msg}\n");
                }
            }
        }
        Err(DownloadError::Failed(error_desc))
    }
}

/// Bytes available to unprivileged users on the volume holding `path`.
fn available_bytes(path: &Utf8Path) -> Result<u64> {
    let stat = nix::sys::statvfs::statvfs(path.as_std_path())
        .with_context(|| format!("statvfs {path}"))?;
    Ok(stat.block_size() as u64 * stat.blocks_available() as u64)
}

/// A Target that failed for lack of space may only be retried once the
/// available space has actually grown past what was recorded.
fn gate_passes(recorded: u64, available: u64) -> bool {
    available > recorded.saturating_add(MIN_FREE_SPACE_DELTA)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_boundary() {
        // Exactly the recorded level plus the delta is still a refusal;
        // one byte more lets the retry through.
        assert!(!gate_passes(1_000_000, 1_000_000));
        assert!(!gate_passes(1_000_000, 1_000_000 + MIN_FREE_SPACE_DELTA));
        assert!(gate_passes(1_000_000, 1_000_000 + MIN_FREE_SPACE_DELTA + 1));
        assert!(!gate_passes(u64::MAX, u64::MAX));
    }
}
