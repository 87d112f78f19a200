//! Read-only view of the deployment state of an OSTree sysroot.
//!
//! Deployments are reported by `ostree admin status` in boot order: any
//! not-yet-booted (pending) deployment first, then the booted one, then
//! rollback candidates. The view only reads; deploys and repo mutations
//! live with the tree manager.

use std::cell::RefCell;
use std::sync::OnceLock;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use edgeupd_utils::Task;
use fn_error_context::context;
use regex::Regex;

/// The three deployment slots visible through the view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Slot {
    /// The deployment the device is running (or, in staged mode, the
    /// most recently created one).
    Current,
    /// A deployment staged for the next boot, if any.
    Pending,
    /// The deployment the boot loader falls back to.
    Rollback,
}

/// How the view interprets the deployment list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoadMode {
    /// Operating on the live, booted sysroot.
    Booted,
    /// Operating on a sysroot that is not booted (image builds, tests).
    /// There a freshly installed deployment becomes "current" without a
    /// reboot, so "pending" must be computed by difference.
    Staged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct DeploymentEntry {
    osname: String,
    csum: String,
    booted: bool,
}

/// View of an OSTree sysroot's deployments.
#[derive(Debug)]
pub(crate) struct Sysroot {
    path: Utf8PathBuf,
    repo_path: Utf8PathBuf,
    deployment_path: Utf8PathBuf,
    os_name: String,
    mode: LoadMode,
    entries: RefCell<Vec<DeploymentEntry>>,
}

impl Sysroot {
    /// Load the sysroot at `path` for the given stateroot (os) name.
    #[context("Loading sysroot {path}")]
    pub(crate) fn load(path: &Utf8Path, os_name: &str, mode: LoadMode) -> Result<Self> {
        let entries = query_deployments(path)?;
        Ok(Self {
            path: path.to_owned(),
            repo_path: path.join("ostree/repo"),
            deployment_path: path.join(format!("ostree/deploy/{os_name}/deploy")),
            os_name: os_name.to_string(),
            mode,
            entries: RefCell::new(entries),
        })
    }

    /// The sysroot path.
    pub(crate) fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Path of the repository backing this sysroot.
    pub(crate) fn repo_path(&self) -> &Utf8Path {
        &self.repo_path
    }

    /// Directory under which deployments of this stateroot materialize.
    pub(crate) fn deployment_path(&self) -> &Utf8Path {
        &self.deployment_path
    }

    /// The stateroot (os) name deployments are filtered by.
    pub(crate) fn os_name(&self) -> &str {
        &self.os_name
    }

    /// How this view interprets the deployment list.
    pub(crate) fn mode(&self) -> LoadMode {
        self.mode
    }

    /// Re-read the deployment list, best-effort. Returns whether
    /// anything changed. In staged mode this is a no-op: there
    /// "pending" becomes "current" right after installation, and
    /// [`Sysroot::hash_of`] recomputes it on demand instead.
    pub(crate) fn reload(&self) -> bool {
        if self.mode == LoadMode::Staged {
            return true;
        }
        match query_deployments(&self.path) {
            Ok(fresh) => {
                let changed = *self.entries.borrow() != fresh;
                *self.entries.borrow_mut() = fresh;
                changed
            }
            Err(e) => {
                tracing::warn!("Failed to reload sysroot {}: {e}", self.path);
                false
            }
        }
    }

    /// Construct a view from captured status output instead of the
    /// live system.
    #[cfg(test)]
    pub(crate) fn from_status_text(
        path: &Utf8Path,
        os_name: &str,
        mode: LoadMode,
        status: &str,
    ) -> Result<Self> {
        Ok(Self {
            path: path.to_owned(),
            repo_path: path.join("ostree/repo"),
            deployment_path: path.join(format!("ostree/deploy/{os_name}/deploy")),
            os_name: os_name.to_string(),
            mode,
            entries: RefCell::new(parse_admin_status(status)?),
        })
    }

    /// The commit hash deployed in the given slot, if the slot is
    /// occupied.
    pub(crate) fn hash_of(&self, slot: Slot) -> Result<Option<String>> {
        let entries = self.entries.borrow();
        let for_os: Vec<&DeploymentEntry> = entries
            .iter()
            .filter(|e| e.osname == self.os_name)
            .collect();
        let hash = match self.mode {
            LoadMode::Booted => match slot {
                Slot::Current => for_os.iter().find(|e| e.booted).map(|e| e.csum.clone()),
                Slot::Pending => for_os
                    .first()
                    .filter(|e| !e.booted)
                    .map(|e| e.csum.clone()),
                Slot::Rollback => {
                    let booted_idx = for_os.iter().position(|e| e.booted);
                    booted_idx
                        .and_then(|i| for_os.get(i + 1))
                        .map(|e| e.csum.clone())
                }
            },
            LoadMode::Staged => match slot {
                Slot::Current => for_os.first().map(|e| e.csum.clone()),
                Slot::Pending => {
                    // Re-read so a deployment created after construction
                    // is observed; it only counts as pending while it
                    // differs from what we loaded as current.
                    let cur = for_os.first().map(|e| e.csum.clone());
                    drop(for_os);
                    drop(entries);
                    let fresh = query_deployments(&self.path)?;
                    let pend = fresh
                        .iter()
                        .find(|e| e.osname == self.os_name)
                        .map(|e| e.csum.clone());
                    match (cur, pend) {
                        (Some(c), Some(p)) if c == p => None,
                        (_, p) => p,
                    }
                }
                Slot::Rollback => {
                    let e = entries.get(1);
                    match e {
                        Some(e) if e.osname != self.os_name => {
                            tracing::warn!(
                                "Found rollback deployment doesn't match the given os name; found: {}, expected: {}",
                                e.osname,
                                self.os_name
                            );
                            None
                        }
                        Some(e) => Some(e.csum.clone()),
                        None => None,
                    }
                }
            },
        };
        Ok(hash)
    }
}

#[context("Querying deployments of {sysroot}")]
fn query_deployments(sysroot: &Utf8Path) -> Result<Vec<DeploymentEntry>> {
    let out = Task::new("Reading deployment state", "ostree")
        .arg(format!("--sysroot={sysroot}"))
        .args(["admin", "status"])
        .quiet()
        .run_captured()?;
    parse_admin_status(&out)
}

/// Parse `ostree admin status` output. Every deployment opens a block
/// with `<marker> <osname> <csum>.<serial>` where the marker column is
/// `*` for the booted deployment; detail lines below it are indented
/// further and skipped here.
fn parse_admin_status(text: &str) -> Result<Vec<DeploymentEntry>> {
    static LINE: OnceLock<Regex> = OnceLock::new();
    let line = LINE.get_or_init(|| {
        Regex::new(r"^([* ]) (\S+) ([0-9a-f]{64})\.\d+").expect("deployment line pattern")
    });
    let mut r = Vec::new();
    for l in text.lines() {
        if let Some(c) = line.captures(l) {
            r.push(DeploymentEntry {
                osname: c[2].to_string(),
                csum: c[3].to_string(),
                booted: &c[1] == "*",
            });
        }
    }
    if r.is_empty() && !text.trim().is_empty() {
        anyhow::bail!("unrecognized deployment status output: {text}");
    }
    Ok(r)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const HASH_B: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    fn status_fixture() -> String {
        format!(
            "  lmp {HASH_B}.0\n    version: 86\n    origin refspec: {HASH_B}\n\
             * lmp {HASH_A}.0\n    version: 85\n    origin refspec: {HASH_A}\n"
        )
    }

    fn sysroot_with(entries: Vec<DeploymentEntry>, mode: LoadMode) -> Sysroot {
        Sysroot {
            path: "/sysroot".into(),
            repo_path: "/sysroot/ostree/repo".into(),
            deployment_path: "/sysroot/ostree/deploy/lmp/deploy".into(),
            os_name: "lmp".to_string(),
            mode,
            entries: RefCell::new(entries),
        }
    }

    #[test]
    fn test_parse_admin_status() {
        let entries = parse_admin_status(&status_fixture()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].csum, HASH_B);
        assert!(!entries[0].booted);
        assert_eq!(entries[1].csum, HASH_A);
        assert!(entries[1].booted);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_admin_status("error: Not currently booted into an OSTree system\n").is_err());
        assert!(parse_admin_status("").unwrap().is_empty());
    }

    #[test]
    fn test_booted_slots_with_pending() {
        let entries = parse_admin_status(&status_fixture()).unwrap();
        let sysroot = sysroot_with(entries, LoadMode::Booted);
        assert_eq!(sysroot.hash_of(Slot::Current).unwrap().as_deref(), Some(HASH_A));
        assert_eq!(sysroot.hash_of(Slot::Pending).unwrap().as_deref(), Some(HASH_B));
        assert_eq!(sysroot.hash_of(Slot::Rollback).unwrap(), None);
    }

    #[test]
    fn test_booted_slots_after_boot() {
        // After rebooting into B, it leads the list and carries the
        // booted marker; A becomes the rollback.
        let text = format!("* lmp {HASH_B}.0\n  lmp {HASH_A}.0\n");
        let entries = parse_admin_status(&text).unwrap();
        let sysroot = sysroot_with(entries, LoadMode::Booted);
        assert_eq!(sysroot.hash_of(Slot::Current).unwrap().as_deref(), Some(HASH_B));
        assert_eq!(sysroot.hash_of(Slot::Pending).unwrap(), None);
        assert_eq!(sysroot.hash_of(Slot::Rollback).unwrap().as_deref(), Some(HASH_A));
    }

    #[test]
    fn test_other_os_filtered() {
        let text = format!("  other {HASH_B}.0\n* lmp {HASH_A}.0\n");
        let entries = parse_admin_status(&text).unwrap();
        let sysroot = sysroot_with(entries, LoadMode::Booted);
        assert_eq!(sysroot.hash_of(Slot::Current).unwrap().as_deref(), Some(HASH_A));
        assert_eq!(sysroot.hash_of(Slot::Pending).unwrap(), None);
    }
}
