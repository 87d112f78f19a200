//! Thin gateway over an OSTree repository.
//!
//! All mutations go through the `ostree` binary so that locking and crash
//! safety stay with the tool that owns the on-disk format; config reads
//! go straight to the repo keyfile. The gateway never retries; every
//! operation surfaces the underlying tool's message verbatim so callers
//! can match on it.

use camino::{Utf8Path, Utf8PathBuf};
use edgeupd_utils::Task;

/// Errors surfaced by repository operations, carrying the upstream
/// message unchanged.
#[derive(Debug, thiserror::Error)]
pub(crate) enum RepoError {
    /// The repository could not be opened or created.
    #[error("failed to open ostree repo at {path}: {msg}")]
    Open {
        /// Repository path.
        path: Utf8PathBuf,
        /// Upstream message.
        msg: String,
    },
    /// Adding a remote failed.
    #[error("failed to add remote {name}: {msg}")]
    Remote {
        /// Remote name.
        name: String,
        /// Upstream message.
        msg: String,
    },
    /// A pull (network or local) failed.
    #[error("failed to pull {commit}: {msg}")]
    Pull {
        /// The commit that was requested.
        commit: String,
        /// Upstream message, including any min-free-space diagnostics.
        msg: String,
    },
    /// A checkout failed.
    #[error("failed to check out {commit}: {msg}")]
    Checkout {
        /// The commit that was requested.
        commit: String,
        /// Upstream message.
        msg: String,
    },
    /// Reading or updating the repository config failed.
    #[error("failed to update repo config: {0}")]
    Config(String),
}

/// Client-side TLS material for a remote.
#[derive(Debug, Clone, Default)]
pub(crate) struct TlsMaterial {
    /// Path to the CA certificate bundle.
    pub(crate) ca_path: String,
    /// Path to the client certificate.
    pub(crate) cert_path: String,
    /// Path to the client private key.
    pub(crate) key_path: String,
}

/// Handle to an OSTree repository in `bare-user` mode.
#[derive(Debug, Clone)]
pub(crate) struct Repo {
    path: Utf8PathBuf,
}

impl Repo {
    /// Open the repository at `path` if it exists, otherwise create it
    /// with mode `bare-user`.
    pub(crate) fn open_or_create(path: &Utf8Path) -> Result<Self, RepoError> {
        let repo = Self {
            path: path.to_owned(),
        };
        if repo.is_initialized() {
            return Ok(repo);
        }
        Task::new("Initializing ostree repo", "ostree")
            .arg(repo.repo_arg())
            .args(["init", "--mode=bare-user"])
            .quiet()
            .run_captured()
            .map_err(|e| RepoError::Open {
                path: path.to_owned(),
                msg: e.to_string(),
            })?;
        Ok(repo)
    }

    /// Open an existing repository; fails if it was never initialized.
    pub(crate) fn open(path: &Utf8Path) -> Result<Self, RepoError> {
        let repo = Self {
            path: path.to_owned(),
        };
        if !repo.is_initialized() {
            return Err(RepoError::Open {
                path: path.to_owned(),
                msg: "not an ostree repository (missing config or objects)".into(),
            });
        }
        Ok(repo)
    }

    fn is_initialized(&self) -> bool {
        self.path.join("config").exists() && self.path.join("objects").exists()
    }

    fn repo_arg(&self) -> String {
        format!("--repo={}", self.path)
    }

    /// Register a remote if it is not already present. TLS material is
    /// wired in as remote options; GPG verification is disabled because
    /// Target integrity is enforced by the signed metadata instead.
    /// Calling this twice with the same arguments is a no-op.
    pub(crate) fn add_remote(
        &self,
        name: &str,
        url: &str,
        tls: Option<&TlsMaterial>,
    ) -> Result<(), RepoError> {
        let tls = tls.cloned().unwrap_or_default();
        Task::new(format!("Adding ostree remote {name}"), "ostree")
            .arg(self.repo_arg())
            .args(["remote", "add", "--if-not-exists"])
            .arg("--set=gpg-verify=false")
            .arg(format!("--set=tls-ca-path={}", tls.ca_path))
            .arg(format!("--set=tls-client-cert-path={}", tls.cert_path))
            .arg(format!("--set=tls-client-key-path={}", tls.key_path))
            .arg(name)
            .arg(url)
            .quiet()
            .run_captured()
            .map(|_| ())
            .map_err(|e| RepoError::Remote {
                name: name.to_string(),
                msg: e.to_string(),
            })
    }

    /// Pull a commit from a registered remote, passing the given HTTP
    /// headers on every request.
    pub(crate) fn pull(
        &self,
        remote: &str,
        commit: &str,
        headers: &[(String, String)],
    ) -> Result<(), RepoError> {
        let mut task = Task::new(format!("Pulling {commit} from {remote}"), "ostree")
            .arg(self.repo_arg())
            .arg("pull");
        for (k, v) in headers {
            task = task.arg(format!("--http-header={k}={v}"));
        }
        task.arg(remote)
            .arg(commit)
            .quiet()
            .run_captured()
            .map(|_| ())
            .map_err(|e| RepoError::Pull {
                commit: commit.to_string(),
                msg: e.to_string(),
            })
    }

    /// Pull a commit from another repository on the local filesystem.
    pub(crate) fn pull_local(&self, src_repo: &Utf8Path, commit: &str) -> Result<(), RepoError> {
        Task::new(format!("Pulling {commit} from {src_repo}"), "ostree")
            .arg(self.repo_arg())
            .arg("pull-local")
            .arg(src_repo)
            .arg(commit)
            .quiet()
            .run_captured()
            .map(|_| ())
            .map_err(|e| RepoError::Pull {
                commit: commit.to_string(),
                msg: e.to_string(),
            })
    }

    /// Check out `src_subpath` of a committed tree into `dst`, in user
    /// mode with union-files overwrite (existing destination files keep
    /// their content unless the commit carries a replacement).
    pub(crate) fn checkout(
        &self,
        commit: &str,
        src_subpath: &str,
        dst: &Utf8Path,
    ) -> Result<(), RepoError> {
        Task::new(format!("Checking out {src_subpath} of {commit}"), "ostree")
            .arg(self.repo_arg())
            .args(["checkout", "--user-mode", "--union-files"])
            .arg(format!("--subpath={src_subpath}"))
            .arg(commit)
            .arg(dst)
            .quiet()
            .run_captured()
            .map(|_| ())
            .map_err(|e| RepoError::Checkout {
                commit: commit.to_string(),
                msg: e.to_string(),
            })
    }

    /// Resolve a commit to prove the object is complete in the local
    /// repository.
    pub(crate) fn resolve(&self, commit: &str) -> Result<String, RepoError> {
        Task::new(format!("Resolving {commit}"), "ostree")
            .arg(self.repo_arg())
            .args(["rev-parse", commit])
            .quiet()
            .run_captured()
            .map(|out| out.trim().to_string())
            .map_err(|e| RepoError::Checkout {
                commit: commit.to_string(),
                msg: e.to_string(),
            })
    }

    /// Read a config entry; absent groups or keys read as `None`.
    pub(crate) fn config_get(
        &self,
        section: &str,
        key: &str,
    ) -> Result<Option<String>, RepoError> {
        let config_path = self.path.join("config");
        let ini = tini::Ini::from_file(&config_path.as_std_path())
            .map_err(|e| RepoError::Config(e.to_string()))?;
        Ok(ini.get::<String>(section, key))
    }

    /// Set a config entry, creating the group if needed.
    pub(crate) fn config_set(&self, section: &str, key: &str, value: &str) -> Result<(), RepoError> {
        Task::new(format!("Setting repo config {section}.{key}"), "ostree")
            .arg(self.repo_arg())
            .args(["config", "set"])
            .arg(format!("--group={section}"))
            .arg(key)
            .arg(value)
            .quiet()
            .run_captured()
            .map(|_| ())
            .map_err(|e| RepoError::Config(e.to_string()))
    }

    /// Remove a config entry. Removing an absent entry is not an
    /// error.
    pub(crate) fn config_unset(&self, section: &str, key: &str) -> Result<(), RepoError> {
        let r = Task::new(format!("Unsetting repo config {section}.{key}"), "ostree")
            .arg(self.repo_arg())
            .args(["config", "unset"])
            .arg(format!("--group={section}"))
            .arg(key)
            .quiet()
            .run_captured();
        match r {
            Ok(_) => Ok(()),
            // The keyfile error text for both a missing group and a
            // missing key contains "does not have"; tolerate those.
            Err(e) if e.to_string().contains("does not have") => Ok(()),
            Err(e) => Err(RepoError::Config(e.to_string())),
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    fn have_ostree() -> bool {
        std::process::Command::new("ostree")
            .arg("--version")
            .output()
            .is_ok()
    }

    #[test]
    fn test_create_pull_local_checkout() {
        if !have_ostree() {
            eprintln!("ostree not installed, skipping");
            return;
        }
        let td = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(td.path()).unwrap();

        // Commit a small tree into a source repo.
        let src_fs = root.join("src_fs");
        std::fs::create_dir_all(&src_fs).unwrap();
        std::fs::write(src_fs.join("foo.bar"), "some dummy content").unwrap();
        std::fs::write(src_fs.join("file02.txt"), "another dummy content").unwrap();
        Repo::open_or_create(&root.join("src_repo")).unwrap();
        let commit = Task::new("commit", "ostree")
            .arg(format!("--repo={}", root.join("src_repo")))
            .args(["commit", "--branch=lmp"])
            .arg(format!("--tree=dir={src_fs}"))
            .quiet()
            .run_captured()
            .unwrap()
            .trim()
            .to_string();

        // Pull it into a second repo and check it out.
        let dst = Repo::open_or_create(&root.join("dst_repo")).unwrap();
        dst.pull_local(&root.join("src_repo"), &commit).unwrap();
        assert_eq!(dst.resolve(&commit).unwrap(), commit);
        let out = root.join("out");
        dst.checkout(&commit, "/", &out).unwrap();
        assert_eq!(
            std::fs::read_to_string(out.join("foo.bar")).unwrap(),
            "some dummy content"
        );
        assert_eq!(
            std::fs::read_to_string(out.join("file02.txt")).unwrap(),
            "another dummy content"
        );

        // Remote registration is idempotent.
        dst.add_remote("treehub", "http://localhost", None).unwrap();
        let before = std::fs::read_to_string(root.join("dst_repo/config")).unwrap();
        dst.add_remote("treehub", "http://localhost", None).unwrap();
        let after = std::fs::read_to_string(root.join("dst_repo/config")).unwrap();
        similar_asserts::assert_eq!(before, after);

        // Config entries round-trip and unset tolerates absence.
        dst.config_set("min-free-space-required", "lmp-2", "1024").unwrap();
        assert_eq!(
            dst.config_get("min-free-space-required", "lmp-2").unwrap().as_deref(),
            Some("1024")
        );
        dst.config_unset("min-free-space-required", "lmp-2").unwrap();
        assert_eq!(dst.config_get("min-free-space-required", "lmp-2").unwrap(), None);
        dst.config_unset("no-such-group", "no-such-key").unwrap();
    }

    #[test]
    fn test_open_uninitialized() {
        let td = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(td.path()).unwrap();
        assert!(matches!(
            Repo::open(path),
            Err(RepoError::Open { .. })
        ));
    }

    #[test]
    fn test_config_get_absent() {
        let td = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(td.path()).unwrap();
        std::fs::create_dir(path.join("objects")).unwrap();
        std::fs::write(path.join("config"), "[core]\nrepo_version=1\nmode=bare-user\n").unwrap();
        let repo = Repo::open(path).unwrap();
        assert_eq!(repo.config_get("core", "mode").unwrap().as_deref(), Some("bare-user"));
        assert_eq!(repo.config_get("core", "missing").unwrap(), None);
        assert_eq!(repo.config_get("min-free-space-required", "t1").unwrap(), None);
    }

    #[test]
    fn test_config_get_marker_section() {
        let td = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(td.path()).unwrap();
        std::fs::create_dir(path.join("objects")).unwrap();
        std::fs::write(
            path.join("config"),
            "[core]\nmode=bare-user\n\n[min-free-space-required]\nrpi4-lmp-2=1048576\n",
        )
        .unwrap();
        let repo = Repo::open(path).unwrap();
        assert_eq!(
            repo.config_get("min-free-space-required", "rpi4-lmp-2")
                .unwrap()
                .as_deref(),
            Some("1048576")
        );
    }
}
