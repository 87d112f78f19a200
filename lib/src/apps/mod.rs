//! Compose-app lifecycle management.
//!
//! Two engines exist: [`compose::ComposeAppEngine`] pulls app bundles
//! from an OCI registry, [`tree::TreeAppEngine`] checks them out of a
//! local tree repository ("offline" mirror). The orchestrator owns one
//! of them behind the [`AppEngine`] trait, chosen at construction.

pub(crate) mod compose;
pub(crate) mod tree;

use camino::{Utf8Path, Utf8PathBuf};
use edgeupd_utils::Task;

/// A compose app named by a Target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct App {
    /// The app name; also its directory name under the apps root.
    pub(crate) name: String,
    /// Where the bundle comes from. Registry engines expect
    /// `host[:port]/factory/app@sha256:<hex>`; tree engines expect
    /// `branch@commit`.
    pub(crate) uri: String,
}

/// Errors from app operations.
#[derive(Debug, thiserror::Error)]
pub(crate) enum AppError {
    /// The app manifest was missing, malformed, or of an unsupported
    /// version.
    #[error("invalid app manifest: {0}")]
    BadManifest(String),
    /// Not enough storage to fetch and extract the app archive.
    #[error("insufficient storage to download app archive, available: {available} need: {need}")]
    NoSpace {
        /// Bytes usable for apps after the watermark.
        available: u64,
        /// Bytes the archive is expected to need once extracted.
        need: u64,
    },
    /// Everything else, carrying the underlying failure.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Manages the lifecycle of compose apps on the device. All operations
/// on a given app serialize; engines are not called concurrently for
/// the same app root.
pub(crate) trait AppEngine {
    /// Make the app bundle and its container images locally available.
    fn fetch(&self, app: &App) -> Result<(), AppError>;
    /// Create the app's containers without starting them, leaving a
    /// marker so a later [`AppEngine::start`] knows to run.
    fn install(&self, app: &App) -> Result<(), AppError>;
    /// Start containers created by a previous install.
    fn start(&self, app: &App) -> Result<(), AppError>;
    /// Create and start the app in one step.
    fn run(&self, app: &App) -> Result<(), AppError>;
    /// Stop the app and delete its state. Failure to bring the stack
    /// down is logged and the state kept.
    fn remove(&self, app: &App);
    /// Whether at least as many of the app's containers are running as
    /// its compose file names images.
    fn is_running(&self, app: &App) -> bool;
}

/// The compose file every app bundle carries.
pub(crate) const COMPOSE_FILE: &str = "docker-compose.yml";
/// Marker recording that an install was done with `--no-start`.
pub(crate) const NEED_START_FILE: &str = ".need_start";

/// Shared driver for the compose tooling, operating on one app
/// directory.
#[derive(Debug, Clone)]
pub(crate) struct ComposeProject {
    name: String,
    root: Utf8PathBuf,
    compose_bin: String,
    docker_bin: String,
}

impl ComposeProject {
    pub(crate) fn new(
        name: &str,
        apps_root: &Utf8Path,
        compose_bin: &str,
        docker_bin: &str,
    ) -> Self {
        Self {
            name: name.to_string(),
            root: apps_root.join(name),
            compose_bin: compose_bin.to_string(),
            docker_bin: docker_bin.to_string(),
        }
    }

    /// The app's directory, `<apps_root>/<name>`.
    pub(crate) fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn compose(&self, description: &str, args: &[&str]) -> Task {
        Task::new(description, &self.compose_bin)
            .args(args)
            .start_dir(&self.root)
    }

    /// Validate the compose file.
    pub(crate) fn config(&self) -> Result<(), AppError> {
        tracing::info!("Validating compose file of {}", self.name);
        self.compose("Validating compose file", &["config"])
            .run()
            .map_err(Into::into)
    }

    /// Pre-pull the app's container images, one at a time.
    pub(crate) fn pull_images(&self) -> Result<(), AppError> {
        tracing::info!("Pulling containers of {}", self.name);
        self.compose("Pulling containers", &["pull", "--no-parallel"])
            .run()
            .map_err(Into::into)
    }

    /// Bring the stack up. With `no_start` the containers are created
    /// but not started, and the need-start marker is left behind.
    pub(crate) fn up(&self, no_start: bool) -> Result<(), AppError> {
        let mode = if no_start { "--no-start" } else { "-d" };
        if no_start {
            std::fs::write(self.root.join(NEED_START_FILE), b"")
                .map_err(|e| AppError::Other(e.into()))?;
        }
        self.compose("Bringing up app", &["up", "--remove-orphans", mode])
            .run()
            .map_err(Into::into)
    }

    /// Start containers created by an earlier `up(true)`.
    pub(crate) fn start(&self) -> Result<(), AppError> {
        let r = self.compose("Starting app", &["start"]).run();
        if r.is_ok() {
            let _ = std::fs::remove_file(self.root.join(NEED_START_FILE));
        }
        r.map_err(Into::into)
    }

    /// Bring the stack down and delete the app directory; on failure
    /// log and keep the state so a later attempt can retry.
    pub(crate) fn down_and_remove(&self) {
        if self.compose("Bringing down app", &["down"]).run().is_ok() {
            if let Err(e) = std::fs::remove_dir_all(&self.root) {
                tracing::warn!("Failed to remove app directory {}: {e}", self.root);
            }
        } else {
            tracing::error!("compose was unable to bring down: {}", self.root);
        }
    }

    /// Compare the number of running containers labelled with this
    /// project against the number of images the compose file names.
    pub(crate) fn is_running(&self) -> bool {
        let compose_file = self.root.join(COMPOSE_FILE);
        let content = match std::fs::read_to_string(&compose_file) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!("Failed to parse app config {}: {e}", self.name);
                return false;
            }
        };
        let expected = count_image_lines(&content);

        let out = Task::new("Listing app containers", &self.docker_bin)
            .args([
                "ps",
                "-q",
                "--filter=status=running",
                &format!("--filter=label=com.docker.compose.project={}", self.name),
            ])
            .quiet()
            .run_captured();
        let out = match out {
            Ok(o) => o,
            Err(e) => {
                tracing::warn!("Failed to get a list of app containers {}: {e}", self.name);
                return false;
            }
        };
        let running = out.lines().filter(|l| !l.trim().is_empty()).count();
        if running < expected {
            tracing::debug!(
                "Number of running containers is less than the number of images in the compose file; \
                 app: {}; expected: {expected}; running: {running}",
                self.name
            );
            return false;
        }
        true
    }
}

/// Count the container images a compose file names: a line counts when
/// the `image:` token appears and no `#` precedes it on the same line.
fn count_image_lines(compose: &str) -> usize {
    compose
        .lines()
        .filter(|line| match line.find("image:") {
            Some(pos) => !line[..pos].contains('#'),
            None => false,
        })
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_image_lines() {
        let compose = "\
version: \"3.2\"
services:
  web:
    image: nginx:latest
  db:
    # image: commented-out:1
    image: postgres:12
  cache:
    image: redis # trailing comment does not matter
";
        assert_eq!(count_image_lines(compose), 3);
        assert_eq!(count_image_lines(""), 0);
        assert_eq!(count_image_lines("no images here\n"), 0);
    }

    #[test]
    fn test_project_root() {
        let p = ComposeProject::new(
            "app-01",
            Utf8Path::new("/var/sota/compose-apps"),
            "docker-compose",
            "docker",
        );
        assert_eq!(p.root(), "/var/sota/compose-apps/app-01");
    }
}
