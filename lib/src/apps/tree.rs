//! Tree-repo-backed compose-app engine.
//!
//! Devices provisioned with a tree mirror receive app bundles as part
//! of a committed filesystem tree instead of from a registry: `/apps`
//! holds the compose projects, `/images` a pre-seeded container image
//! store, and `/.whiteouts` describes the non-regular nodes (devices,
//! FIFOs) that the tree itself cannot carry.

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use nix::sys::stat::{mknod, Mode, SFlag};

use super::{App, AppEngine, AppError, ComposeProject};
use crate::ostree::repo::{Repo, TlsMaterial};

/// Remote name the app tree pulls through.
const REMOTE_NAME: &str = "treehub";
const APPS_DIR: &str = "/apps";
const IMAGES_DIR: &str = "/images";
const WHITEOUTS: &str = "/.whiteouts";

/// Where a tree engine pulls commits from.
#[derive(Debug, Clone)]
pub(crate) enum TreeSource {
    /// A remote tree server, with optional client TLS material.
    Remote {
        /// Base URL of the tree server.
        url: String,
        /// Client TLS material, if the server requires it.
        tls: Option<TlsMaterial>,
    },
    /// Another repository on the local filesystem (offline mirror).
    LocalMirror(Utf8PathBuf),
}

/// An app tree: a local repository plus the checkout directories it
/// materializes into.
#[derive(Debug)]
pub(crate) struct ComposeAppTree {
    repo: Repo,
    apps_dir: Utf8PathBuf,
    images_dir: Utf8PathBuf,
    whiteouts_path: Utf8PathBuf,
}

impl ComposeAppTree {
    /// Open (or create) the app tree repository at `tree_path`.
    pub(crate) fn new(
        tree_path: &Utf8Path,
        apps_dir: &Utf8Path,
        images_dir: &Utf8Path,
    ) -> Result<Self> {
        let repo = Repo::open_or_create(tree_path)?;
        Ok(Self {
            repo,
            apps_dir: apps_dir.to_owned(),
            images_dir: images_dir.to_owned(),
            whiteouts_path: images_dir.join(WHITEOUTS.trim_start_matches('/')),
        })
    }

    /// Pull the commit the `branch@commit` uri names.
    #[context("Pulling app tree {uri}")]
    pub(crate) fn pull(&self, source: &TreeSource, uri: &str) -> Result<()> {
        let (branch, commit) = parse_ref(uri)?;
        match source {
            TreeSource::Remote { url, tls } => {
                self.repo.add_remote(REMOTE_NAME, url, tls.as_ref())?;
                self.repo
                    .pull(REMOTE_NAME, &format!("{branch}@{commit}"), &[])?;
            }
            TreeSource::LocalMirror(src) => {
                self.repo.pull_local(src, commit)?;
            }
        }
        Ok(())
    }

    /// Check out the apps, the image store, and the whiteouts of the
    /// commit the uri names.
    #[context("Checking out app tree {uri}")]
    pub(crate) fn checkout(&self, uri: &str) -> Result<()> {
        let (_, commit) = parse_ref(uri)?;
        self.repo.checkout(commit, APPS_DIR, &self.apps_dir)?;
        self.repo.checkout(commit, IMAGES_DIR, &self.images_dir)?;
        self.apply_whiteouts(commit)
    }

    fn apply_whiteouts(&self, commit: &str) -> Result<()> {
        self.repo.checkout(commit, WHITEOUTS, &self.images_dir)?;
        tracing::debug!(
            "Processing the file containing non-regular file records: {}",
            self.whiteouts_path
        );
        let content = std::fs::read_to_string(&self.whiteouts_path)
            .with_context(|| format!("Reading {}", self.whiteouts_path))?;
        for line in content.lines() {
            if line.is_empty() {
                continue;
            }
            let (relpath, mode, rdev) = parse_whiteout(line)?;
            let dst = self.images_dir.join(relpath);
            if dst.exists() {
                tracing::debug!("A non-regular file has been already created: {dst}");
                continue;
            }
            tracing::debug!("Creating a non-regular file; path: {dst} mode: {mode:o} device: {rdev}");
            let kind = SFlag::from_bits_truncate(mode & libc::S_IFMT);
            let perm = Mode::from_bits_truncate(mode & 0o7777);
            if let Err(e) = mknod(dst.as_std_path(), kind, perm, rdev) {
                tracing::error!("Failed to create a non-regular file {dst}: {e}");
            }
        }
        Ok(())
    }
}

/// Parse a `branch@commit` tree reference.
fn parse_ref(uri: &str) -> Result<(&str, &str)> {
    let (branch, commit) = uri
        .split_once('@')
        .with_context(|| format!("invalid app tree uri: {uri}"))?;
    if branch.is_empty() || commit.is_empty() {
        anyhow::bail!("invalid app tree uri: {uri}");
    }
    Ok((branch, commit))
}

/// Parse one whiteout record: exactly three space-separated fields,
/// `<relative-path> <decimal st_mode> <decimal rdev>`. Any other field
/// count invalidates the record (and aborts processing at the caller).
fn parse_whiteout(line: &str) -> Result<(&str, libc::mode_t, libc::dev_t)> {
    let fields: Vec<&str> = line.split(' ').collect();
    if fields.len() != 3 {
        anyhow::bail!(
            "invalid non-regular file record: expected three items got {}",
            fields.len()
        );
    }
    let mode: libc::mode_t = fields[1]
        .parse()
        .with_context(|| format!("Parsing mode of {}", fields[0]))?;
    let rdev: libc::dev_t = fields[2]
        .parse()
        .with_context(|| format!("Parsing device of {}", fields[0]))?;
    Ok((fields[0], mode, rdev))
}

/// Engine retrieving app bundles from a tree repository.
#[derive(Debug)]
pub(crate) struct TreeAppEngine {
    tree: ComposeAppTree,
    source: TreeSource,
    apps_root: Utf8PathBuf,
    compose_bin: String,
    docker_bin: String,
}

impl TreeAppEngine {
    /// Create an engine over the given app tree.
    pub(crate) fn new(
        tree: ComposeAppTree,
        source: TreeSource,
        compose_bin: &str,
        docker_bin: &str,
    ) -> Self {
        let apps_root = tree.apps_dir.clone();
        Self {
            tree,
            source,
            apps_root,
            compose_bin: compose_bin.to_string(),
            docker_bin: docker_bin.to_string(),
        }
    }

    fn project(&self, app: &App) -> ComposeProject {
        ComposeProject::new(&app.name, &self.apps_root, &self.compose_bin, &self.docker_bin)
    }
}

impl AppEngine for TreeAppEngine {
    fn fetch(&self, app: &App) -> Result<(), AppError> {
        self.tree.pull(&self.source, &app.uri)?;
        self.tree.checkout(&app.uri)?;
        Ok(())
    }

    fn install(&self, app: &App) -> Result<(), AppError> {
        self.project(app).up(true)
    }

    fn start(&self, app: &App) -> Result<(), AppError> {
        self.project(app).start()
    }

    fn run(&self, app: &App) -> Result<(), AppError> {
        self.project(app).up(false)
    }

    fn remove(&self, app: &App) {
        self.project(app).down_and_remove();
    }

    fn is_running(&self, app: &App) -> bool {
        self.project(app).is_running()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ref() {
        let (branch, commit) = parse_ref("lmp@abcdef0123").unwrap();
        assert_eq!(branch, "lmp");
        assert_eq!(commit, "abcdef0123");
        assert!(parse_ref("no-separator").is_err());
        assert!(parse_ref("@commit").is_err());
        assert!(parse_ref("branch@").is_err());
    }

    #[test]
    fn test_parse_whiteout() {
        // 8612 is the decimal st_mode of a character device with 0644
        // permissions.
        let (path, mode, rdev) = parse_whiteout("dev/null 8612 259").unwrap();
        assert_eq!(path, "dev/null");
        assert_eq!(mode, 0o20644);
        assert_eq!(rdev, 259);
        // The mode field is decimal even with leading zeros.
        assert_eq!(parse_whiteout("dev/null 020644 0").unwrap().1, 20644);
        // Anything but exactly three fields is an invalid record.
        assert!(parse_whiteout("dev/null 8612").is_err());
        assert!(parse_whiteout("dev/null 8612 259 extra").is_err());
        assert!(parse_whiteout("dev/null junk 259").is_err());
    }
}
