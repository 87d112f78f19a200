//! Registry-backed compose-app engine: fetches the app archive from an
//! OCI registry, extracts it under the apps root and drives the compose
//! tooling from there.

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use edgeupd_utils::Task;

use super::{App, AppEngine, AppError, ComposeProject};
use crate::registry::{HashedDigest, RegistryClient, Uri};

/// Marker file recording which URI an app directory was fetched from.
pub(crate) const APP_URI_FILE: &str = ".app_uri";
/// Extension of the downloaded app archive.
const ARCHIVE_EXT: &str = ".tgz";
/// Reserved storage space; a volume must keep at least this much free
/// in addition to the watermark below.
const RESERVED_BYTES: u64 = 1 << 20;

/// Engine pulling app bundles from an OCI registry.
#[derive(Debug)]
pub(crate) struct ComposeAppEngine {
    apps_root: Utf8PathBuf,
    compose_bin: String,
    docker_bin: String,
    registry: RegistryClient,
}

impl ComposeAppEngine {
    /// Create an engine rooted at `apps_root`.
    pub(crate) fn new(
        apps_root: &Utf8Path,
        compose_bin: &str,
        docker_bin: &str,
        registry: RegistryClient,
    ) -> Self {
        Self {
            apps_root: apps_root.to_owned(),
            compose_bin: compose_bin.to_string(),
            docker_bin: docker_bin.to_string(),
            registry,
        }
    }

    fn project(&self, app: &App) -> ComposeProject {
        ComposeProject::new(&app.name, &self.apps_root, &self.compose_bin, &self.docker_bin)
    }

    fn download(&self, app: &App, root: &Utf8Path) -> Result<(), AppError> {
        tracing::debug!("{}: downloading app from registry: {}", app.name, app.uri);
        let uri =
            Uri::parse(&app.uri, true).map_err(|e| AppError::Other(anyhow::Error::new(e)))?;
        if uri.app != app.name {
            tracing::warn!(
                "App {} is published under a different path: {}/{}",
                app.name,
                uri.factory,
                uri.app
            );
        }
        let manifest = self.registry.app_manifest(&uri)?;
        let archive_size = manifest.archive_size()?;

        match available_storage(root) {
            Ok(available) => {
                // The extracted files are assumed to take up to 10x the
                // archive size; 80% of the volume is the usage watermark.
                let need_storage = archive_size.saturating_mul(10);
                let available_for_apps = (available as f64 * 0.8) as u64;
                if need_storage > available_for_apps {
                    return Err(AppError::NoSpace {
                        available: available_for_apps,
                        need: need_storage,
                    });
                }
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to get an available storage space, continuing with app archive download: {e}"
                );
            }
        }

        let archive_digest = HashedDigest::new(manifest.archive_digest()?)
            .map_err(|e| AppError::BadManifest(e.to_string()))?;
        let archive_file = root.join(format!(
            "{}.{}{ARCHIVE_EXT}",
            archive_digest.short_hash(),
            app.name
        ));
        let archive_uri = uri.with_digest(archive_digest);
        self.registry
            .download_blob(&archive_uri, &archive_file, archive_size)?;

        Task::new(format!("Extracting {archive_file}"), "tar")
            .args(["-xzf", archive_file.as_str()])
            .start_dir(root)
            .quiet()
            .run()
            .with_context(|| format!("Extracting the app archive {archive_file}"))?;
        std::fs::remove_file(&archive_file)
            .with_context(|| format!("Removing the app archive {archive_file}"))?;
        std::fs::write(root.join(APP_URI_FILE), &app.uri)
            .with_context(|| format!("Recording the app uri under {root}"))?;
        tracing::debug!("{}: app has been downloaded", app.name);
        Ok(())
    }
}

impl AppEngine for ComposeAppEngine {
    fn fetch(&self, app: &App) -> Result<(), AppError> {
        let project = self.project(app);
        std::fs::create_dir_all(project.root())
            .with_context(|| format!("Creating {}", project.root()))?;
        self.download(app, project.root())?;
        project.config()?;
        project.pull_images()
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

/// Bytes usable on the volume holding `path`, after the fixed reserve.
fn available_storage(path: &Utf8Path) -> anyhow::Result<u64> {
    let stat = nix::sys::statvfs::statvfs(path.as_std_path())
        .with_context(|| format!("statvfs {path}"))?;
    let available = stat.block_size() as u64 * stat.blocks_available() as u64;
    Ok(available.saturating_sub(RESERVED_BYTES))
}
