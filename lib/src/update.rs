//! # The update orchestrator
//!
//! Owns the transition of the device between Targets: check, download,
//! install, and post-reboot finalize, with rollback when the boot
//! controller rejected the new deployment. The orchestrator is the only
//! writer of the installed-versions store and the bootloader flags, and
//! the only caller of deploy operations. It never retries; failures are
//! classified and reported.

use std::rc::Rc;

use anyhow::{Context, Result};

use crate::apps::compose::ComposeAppEngine;
use crate::apps::tree::{ComposeAppTree, TreeAppEngine, TreeSource};
use crate::apps::{App, AppEngine, AppError};
use crate::bootloader::BootloaderController;
use crate::config::AgentConfig;
use crate::download::{DownloadError, Downloader, FlowControlToken, OstreePuller};
use crate::events::{self, Event, ReportQueue};
use crate::metadata::{GatewayTargetSource, MetaPullError, TargetSource};
use crate::ostree::sysroot::{LoadMode, Slot, Sysroot};
use crate::registry::RegistryClient;
use crate::rootfs::RootfsTreeManager;
use crate::storage::InstalledVersions;
use crate::target::Target;

/// The orchestrator's position in an update attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UpdateState {
    /// Nothing in flight.
    Idle,
    /// A newer, hardware-matching Target has been selected.
    MetadataValidated,
    /// Tree commit and all app bundles are local.
    Downloaded,
    /// Deployment written and apps created; versions recorded.
    Installed,
    /// Waiting for the device to boot the new deployment.
    PendingReboot,
    /// Running post-boot completion.
    Finalizing,
    /// The boot controller rejected the new deployment; restoring the
    /// previous Target.
    RollingBack,
    /// Rollback finished.
    RolledBack,
    /// The attempt failed; see the reported error.
    Failed,
}

/// Why an update attempt stopped.
#[derive(Debug, thiserror::Error)]
pub(crate) enum UpdateError {
    /// Target metadata could not be obtained.
    #[error(transparent)]
    MetaPull(#[from] MetaPullError),
    /// No published Target matches the request.
    #[error("no matching target: {0}")]
    TargetNotFound(String),
    /// The tree download failed; see the inner classification.
    #[error(transparent)]
    Download(#[from] DownloadError),
    /// An app bundle could not be fetched.
    #[error("failed to pull app {name}: {err}")]
    AppPull {
        /// The app that failed.
        name: String,
        /// The underlying error.
        err: AppError,
    },
    /// Another installation is still in flight (staged, unrebooted, or
    /// unfinalized).
    #[error("installation already in progress: {0}")]
    InstallInProgress(String),
    /// Finalize was requested with nothing pending.
    #[error("no pending installation")]
    NothingPending,
    /// The flow-control token asked us to stop.
    #[error("operation aborted")]
    Interrupted,
    /// Anything else.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// What a check-in learned.
#[derive(Debug)]
pub(crate) struct CheckOutcome {
    /// A Target newer than what the device runs, if one is published.
    pub(crate) target: Option<Target>,
    /// Whether metadata came from the local cache (gateway unreachable).
    pub(crate) cached: bool,
}

/// How an install attempt ended (its non-error terminal states).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InstallOutcome {
    /// Tree unchanged; apps are created and await finalize.
    AppsNeedFinalization,
    /// A new deployment is staged; reboot to continue.
    NeedsReboot,
}

/// How a finalize attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FinalizeOutcome {
    /// The new Target is live and current.
    Ok,
    /// The staged deployment has not been booted yet.
    NeedsReboot,
    /// The device was rolled back and the previous Target restored.
    RollbackOk,
    /// Rollback required re-deploying the previous tree; reboot to
    /// continue.
    RollbackNeedsReboot,
    /// Rollback could not restore the previous Target's apps.
    RollbackFailed,
}

/// The update orchestrator. One per process; runs one update at a time.
pub(crate) struct Updater {
    hardware_id: String,
    tag: Option<String>,
    apps_root: camino::Utf8PathBuf,
    storage_dir: camino::Utf8PathBuf,
    sysroot: Rc<Sysroot>,
    token: Rc<FlowControlToken>,
    rootfs: RootfsTreeManager,
    downloader: Box<dyn Downloader>,
    bootloader: BootloaderController,
    apps: Box<dyn AppEngine>,
    storage: InstalledVersions,
    source: Box<dyn TargetSource>,
    events: ReportQueue,
    state: UpdateState,
}

impl std::fmt::Debug for Updater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Updater")
            .field("hardware_id", &self.hardware_id)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Updater {
    /// Wire up the orchestrator and its subsystems from configuration.
    pub(crate) fn from_config(config: &AgentConfig) -> Result<Self> {
        let sysroot = Rc::new(Sysroot::load(
            &config.sysroot.path,
            &config.sysroot.os_name,
            config.sysroot.load_mode(),
        )?);
        let token = Rc::new(FlowControlToken::default());
        if let Err(e) = token.register_signals() {
            tracing::warn!("Failed to register termination signals: {e}");
        }
        let client = config.gateway.http_client()?;
        let rootfs = RootfsTreeManager::new(
            Rc::clone(&sysroot),
            Rc::clone(&token),
            client.clone(),
            config.gateway.server.clone(),
            config.gateway.remote_name.clone(),
            config.gateway.tree_server(),
            config.gateway.tls_material(),
        );

        let local_mirror = config.apps.tree.as_ref().and_then(|t| t.local_mirror.clone());
        let downloader: Box<dyn Downloader> = match &local_mirror {
            Some(mirror) => Box::new(OstreePuller::new(Rc::clone(&sysroot), mirror.clone())),
            None => Box::new(rootfs.clone()),
        };

        let apps: Box<dyn AppEngine> = match &config.apps.tree {
            Some(tree_cfg) => {
                let tree = ComposeAppTree::new(&tree_cfg.path, &config.apps.root, &tree_cfg.images_dir)?;
                let source = match &tree_cfg.local_mirror {
                    Some(mirror) => TreeSource::LocalMirror(mirror.clone()),
                    None => TreeSource::Remote {
                        url: config.gateway.tree_server(),
                        tls: config.gateway.tls_material(),
                    },
                };
                Box::new(TreeAppEngine::new(
                    tree,
                    source,
                    &config.apps.compose_bin,
                    &config.apps.docker_bin,
                ))
            }
            None => {
                let registry = RegistryClient::new(
                    client.clone(),
                    config.registry.auth_creds_endpoint(&config.gateway.server),
                );
                Box::new(ComposeAppEngine::new(
                    &config.apps.root,
                    &config.apps.compose_bin,
                    &config.apps.docker_bin,
                    registry,
                ))
            }
        };

        std::fs::create_dir_all(&config.storage.path)
            .with_context(|| format!("creating {}", config.storage.path))?;
        let storage = InstalledVersions::load(&config.storage.installed_versions_path())?;
        let source = Box::new(GatewayTargetSource::new(
            client.clone(),
            &config.gateway.server,
            &config.storage.path,
        ));
        let events = ReportQueue::new(
            client,
            config.gateway.server.clone(),
            config.gateway.event_limit,
        );

        Ok(Self {
            hardware_id: config.device.hardware_id.clone(),
            tag: config.device.tag.clone(),
            apps_root: config.apps.root.clone(),
            storage_dir: config.storage.path.clone(),
            sysroot,
            token,
            rootfs,
            downloader,
            bootloader: BootloaderController::new(config.bootloader.rollback_mode),
            apps,
            storage,
            source,
            events,
            state: UpdateState::Idle,
        })
    }

    fn transition(&mut self, next: UpdateState) {
        tracing::debug!("update state: {:?} -> {next:?}", self.state);
        self.state = next;
    }

    fn applies_here(&self, target: &Target) -> bool {
        target.matches_hardware(&self.hardware_id)
            && target.is_supported_format()
            && match &self.tag {
                Some(tag) => target.custom.tags.iter().any(|t| t == tag),
                None => true,
            }
    }

    /// Check in with the gateway and select the newest applicable
    /// Target, if it is newer than what the device runs.
    pub(crate) fn check(&mut self) -> Result<CheckOutcome, UpdateError> {
        let list = self.source.targets()?;
        let current_version = self.storage.current().map(|t| t.version()).unwrap_or(0);
        let latest = list
            .targets
            .into_iter()
            .filter(|t| self.applies_here(t))
            .max_by_key(Target::version);
        let target = latest.filter(|t| t.version() > current_version);
        if target.is_some() {
            self.transition(UpdateState::MetadataValidated);
        }
        Ok(CheckOutcome {
            target,
            cached: list.cached,
        })
    }

    /// Select a specific Target by name or version; falls back to the
    /// newest applicable one when neither is given.
    pub(crate) fn select(
        &mut self,
        name: Option<&str>,
        version: Option<i64>,
    ) -> Result<Option<Target>, UpdateError> {
        if name.is_none() && version.is_none() {
            return Ok(self.check()?.target);
        }
        let list = self.source.targets()?;
        let target = list
            .targets
            .into_iter()
            .filter(|t| self.applies_here(t))
            .find(|t| {
                name.map(|n| t.name == n).unwrap_or(true)
                    && version.map(|v| t.version() == v).unwrap_or(true)
            });
        match target {
            Some(t) => {
                self.transition(UpdateState::MetadataValidated);
                Ok(Some(t))
            }
            None => Err(UpdateError::TargetNotFound(format!(
                "name: {}, version: {}",
                name.unwrap_or("any"),
                version.map(|v| v.to_string()).as_deref().unwrap_or("any")
            ))),
        }
    }

    /// Download the Target: the tree commit first, then every app, in
    /// the iteration order of the signed app map.
    pub(crate) fn download(&mut self, target: &Target) -> Result<(), UpdateError> {
        self.events
            .push(Event::new(events::EVENT_DOWNLOAD_STARTED, target, None));
        self.events.flush();
        let r = self.download_inner(target);
        self.events.push(Event::new(
            events::EVENT_DOWNLOAD_COMPLETED,
            target,
            Some(r.is_ok()),
        ));
        self.events.flush();
        match r {
            Ok(()) => {
                self.transition(UpdateState::Downloaded);
                Ok(())
            }
            Err(e) => {
                self.transition(UpdateState::Failed);
                Err(e)
            }
        }
    }

    fn download_inner(&mut self, target: &Target) -> Result<(), UpdateError> {
        self.downloader.download(target)?;
        for app in target.apps() {
            if !self.token.can_continue() {
                return Err(UpdateError::Interrupted);
            }
            tracing::info!("Fetching app {} from {}", app.name, app.uri);
            self.apps.fetch(&app).map_err(|err| UpdateError::AppPull {
                name: app.name.clone(),
                err,
            })?;
        }
        Ok(())
    }

    /// Install a downloaded Target: stage the deployment (when the tree
    /// changes), notify the boot controller, create the apps, and
    /// record the installed version.
    pub(crate) fn install(&mut self, target: &Target) -> Result<InstallOutcome, UpdateError> {
        let current = self.sysroot.hash_of(Slot::Current).map_err(UpdateError::Other)?;
        if let Some(pending) = self.sysroot.hash_of(Slot::Pending).map_err(UpdateError::Other)? {
            if Some(&pending) != current.as_ref() {
                return Err(UpdateError::InstallInProgress(format!(
                    "deployment {pending} is staged and not finalized"
                )));
            }
        }

        self.events
            .push(Event::new(events::EVENT_INSTALLATION_STARTED, target, None));
        self.events.flush();

        let r = self.install_inner(target, current.as_deref());
        match &r {
            Ok(outcome) => {
                self.events.push(Event::new(
                    events::EVENT_INSTALLATION_APPLIED,
                    target,
                    Some(true),
                ));
                let next = match outcome {
                    InstallOutcome::NeedsReboot => UpdateState::PendingReboot,
                    InstallOutcome::AppsNeedFinalization => UpdateState::Installed,
                };
                self.transition(next);
            }
            Err(_) => {
                self.events.push(Event::new(
                    events::EVENT_INSTALLATION_COMPLETED,
                    target,
                    Some(false),
                ));
                self.transition(UpdateState::Failed);
            }
        }
        self.events.flush();
        r
    }

    fn install_inner(
        &mut self,
        target: &Target,
        current: Option<&str>,
    ) -> Result<InstallOutcome, UpdateError> {
        let tree_changes = current != Some(target.sha256.as_str());
        if tree_changes {
            self.rootfs.install(target).map_err(UpdateError::Other)?;
        }
        self.bootloader.update_notify().map_err(UpdateError::Other)?;
        self.bootloader
            .install_notify(target)
            .map_err(UpdateError::Other)?;
        for app in target.apps() {
            tracing::info!("Installing app {}", app.name);
            self.apps
                .install(&app)
                .map_err(|e| UpdateError::Other(anyhow::Error::new(e)))?;
        }
        self.prune_apps(target);
        self.storage
            .record_install(target)
            .map_err(UpdateError::Other)?;
        if tree_changes && self.sysroot.mode() == LoadMode::Booted {
            self.write_reboot_marker();
            Ok(InstallOutcome::NeedsReboot)
        } else {
            Ok(InstallOutcome::AppsNeedFinalization)
        }
    }

    /// The marker distinguishing "staged but not yet rebooted" from
    /// "rebooted and rolled back": both leave the same deployment list,
    /// but only the former is still in the boot that staged it.
    fn reboot_marker_path(&self) -> camino::Utf8PathBuf {
        self.storage_dir.join("need_reboot")
    }

    fn write_reboot_marker(&self) {
        if let Err(e) = std::fs::write(self.reboot_marker_path(), boot_id()) {
            tracing::warn!("Failed to record the pending-reboot marker: {e}");
        }
    }

    fn awaiting_reboot(&self) -> bool {
        let id = boot_id();
        match std::fs::read_to_string(self.reboot_marker_path()) {
            Ok(recorded) => !id.is_empty() && recorded.trim() == id,
            Err(_) => false,
        }
    }

    fn clear_reboot_marker(&self) {
        let _ = std::fs::remove_file(self.reboot_marker_path());
    }

    /// Complete a pending installation after (or without) the reboot:
    /// promote the new Target to current, or roll back when the boot
    /// controller returned the device to the previous deployment.
    pub(crate) fn finalize(&mut self) -> Result<FinalizeOutcome, UpdateError> {
        if !self.token.can_continue() {
            return Err(UpdateError::Interrupted);
        }
        self.transition(UpdateState::Finalizing);
        self.sysroot.reload();
        let current_hash = self
            .sysroot
            .hash_of(Slot::Current)
            .map_err(UpdateError::Other)?
            .context("no current deployment")
            .map_err(UpdateError::Other)?;
        let pending_hash = self
            .sysroot
            .hash_of(Slot::Pending)
            .map_err(UpdateError::Other)?;

        let current_record = self.storage.current();
        let current_version = current_record.as_ref().map(Target::version).unwrap_or(0);
        let newer: Vec<Target> = self
            .storage
            .all()
            .into_iter()
            .filter(|(t, is_current)| !is_current && t.version() > current_version)
            .map(|(t, _)| t)
            .collect();

        // Still waiting for the reboot into a staged deployment: the
        // deployment list alone cannot tell this apart from a completed
        // rollback, so it is gated on the boot the install ran in.
        if let Some(pending) = pending_hash {
            if self.awaiting_reboot() && newer.iter().any(|t| t.sha256 == pending) {
                self.transition(UpdateState::PendingReboot);
                return Ok(FinalizeOutcome::NeedsReboot);
            }
        }
        self.clear_reboot_marker();

        // The happy path: we are booted on (or already running, for an
        // apps-only update) the new Target's tree.
        if let Some(target) = newer
            .iter()
            .filter(|t| t.sha256 == current_hash)
            .max_by_key(|t| t.version())
            .cloned()
        {
            return self.finalize_target(&target, current_record);
        }

        // The boot controller brought us back to the previous Target.
        if let Some(prev) = current_record {
            if let Some(failed) = newer.iter().max_by_key(|t| t.version()) {
                tracing::warn!(
                    "Boot on the new deployment failed, rolling back to {}",
                    prev.name
                );
                self.transition(UpdateState::RollingBack);
                let outcome = self.rollback(failed, &prev, &current_hash);
                self.transition(UpdateState::RolledBack);
                return Ok(outcome);
            }
        }

        self.transition(UpdateState::Idle);
        Err(UpdateError::NothingPending)
    }

    fn finalize_target(
        &mut self,
        target: &Target,
        previous: Option<Target>,
    ) -> Result<FinalizeOutcome, UpdateError> {
        let mut apps_ok = true;
        for app in target.apps() {
            if !self.token.can_continue() {
                return Err(UpdateError::Interrupted);
            }
            tracing::info!("Starting app {}", app.name);
            if let Err(e) = self.apps.start(&app) {
                tracing::error!("Failed to start app {}: {e}", app.name);
                apps_ok = false;
                break;
            }
            if !self.apps.is_running(&app) {
                tracing::error!("App {} is not running after start", app.name);
                apps_ok = false;
                break;
            }
        }

        if !apps_ok {
            let outcome = match &previous {
                Some(prev) => {
                    self.transition(UpdateState::RollingBack);
                    let current_hash = target.sha256.clone();
                    let o = self.rollback(target, prev, &current_hash);
                    self.transition(UpdateState::RolledBack);
                    o
                }
                None => FinalizeOutcome::RollbackFailed,
            };
            self.events.push(Event::new(
                events::EVENT_INSTALLATION_COMPLETED,
                target,
                Some(false),
            ));
            self.events.flush();
            return Ok(outcome);
        }

        self.storage
            .set_current(&target.name)
            .map_err(UpdateError::Other)?;
        self.bootloader.set_boot_ok().map_err(UpdateError::Other)?;
        self.events.push(Event::new(
            events::EVENT_INSTALLATION_COMPLETED,
            target,
            Some(true),
        ));
        self.events.flush();
        tracing::info!("Target {} is now current", target.name);
        self.transition(UpdateState::Idle);
        Ok(FinalizeOutcome::Ok)
    }

    /// Restore the previous Target after the new one failed. The
    /// previous tree is either already booted (the boot controller did
    /// its job) or must be re-deployed.
    fn rollback(&mut self, failed: &Target, prev: &Target, current_hash: &str) -> FinalizeOutcome {
        tracing::warn!("Rolling back from {} to {}", failed.name, prev.name);
        if prev.sha256 != current_hash {
            // We are booted on neither the new nor the previous tree;
            // re-deploy the previous one and let the device reboot.
            if let Err(e) = self.rootfs.install(prev) {
                tracing::error!("Failed to re-deploy {}: {e}", prev.name);
                return FinalizeOutcome::RollbackFailed;
            }
            if let Err(e) = self.bootloader.update_notify() {
                tracing::error!("Failed to arm boot counter for rollback: {e}");
                return FinalizeOutcome::RollbackFailed;
            }
            return FinalizeOutcome::RollbackNeedsReboot;
        }
        let mut ok = true;
        for app in prev.apps() {
            tracing::info!("Restoring app {}", app.name);
            if let Err(e) = self.apps.run(&app) {
                tracing::error!("Failed to restore app {}: {e}", app.name);
                ok = false;
            }
        }
        if ok {
            FinalizeOutcome::RollbackOk
        } else {
            FinalizeOutcome::RollbackFailed
        }
    }

    /// Print a human-readable status summary.
    pub(crate) fn status(&self, out: &mut impl std::io::Write) -> Result<()> {
        let slot = |s| -> Result<Option<String>> { self.sysroot.hash_of(s) };
        writeln!(out, "Sysroot: {}", self.sysroot.path())?;
        writeln!(out, "Deployments: {}", self.sysroot.deployment_path())?;
        for (name, s) in [
            ("current", Slot::Current),
            ("pending", Slot::Pending),
            ("rollback", Slot::Rollback),
        ] {
            match slot(s)? {
                Some(h) => writeln!(out, "  {name}: {h}")?,
                None => writeln!(out, "  {name}: (none)")?,
            }
        }
        match self.storage.current() {
            Some(t) => {
                writeln!(out, "Current target: {t}")?;
                for app in t.apps() {
                    let running = if self.apps.is_running(&app) {
                        "running"
                    } else {
                        "not running"
                    };
                    writeln!(out, "  app {}: {} ({running})", app.name, app.uri)?;
                }
            }
            None => writeln!(out, "Current target: (none recorded)")?,
        }
        Ok(())
    }

    /// Remove apps that are no longer part of `target`.
    fn prune_apps(&mut self, target: &Target) {
        let keep: Vec<String> = target.apps().into_iter().map(|a| a.name).collect();
        let entries = match self.apps_root.read_dir_utf8() {
            Ok(e) => e,
            Err(_) => return,
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string();
            if entry.path().is_dir() && !keep.contains(&name) {
                tracing::info!("Removing app {name} which is not part of {}", target.name);
                self.apps.remove(&App {
                    name,
                    uri: String::new(),
                });
            }
        }
    }
}

/// The kernel's id of the current boot; empty when unavailable.
fn boot_id() -> String {
    std::fs::read_to_string("/proc/sys/kernel/random/boot_id")
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use camino::Utf8Path;

    use super::*;
    use crate::bootloader::RollbackMode;
    use crate::metadata::TargetList;
    use crate::target::TargetCustom;

    const HASH_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const HASH_B: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    fn target(name: &str, version: &str, hash: &str, apps: &[&str]) -> Target {
        let mut custom = TargetCustom::default();
        custom.version = version.to_string();
        custom.hardware_ids = vec!["raspberrypi4-64".to_string()];
        custom.target_format = Some("OSTREE".to_string());
        for app in apps {
            custom.apps.insert(
                app.to_string(),
                crate::target::AppRef {
                    uri: format!("hub.io/factory/{app}@sha256:{}", "0".repeat(64)),
                },
            );
        }
        Target {
            name: name.to_string(),
            sha256: hash.to_string(),
            custom,
        }
    }

    #[derive(Default)]
    struct Calls(RefCell<Vec<String>>);

    impl Calls {
        fn push(&self, s: String) {
            self.0.borrow_mut().push(s);
        }
        fn take(&self) -> Vec<String> {
            std::mem::take(&mut self.0.borrow_mut())
        }
    }

    struct MockDownloader(Rc<Calls>);

    impl Downloader for MockDownloader {
        fn download(&self, target: &Target) -> Result<(), DownloadError> {
            self.0.push(format!("download {}", target.sha256));
            Ok(())
        }
    }

    struct MockEngine(Rc<Calls>);

    impl AppEngine for MockEngine {
        fn fetch(&self, app: &App) -> Result<(), AppError> {
            self.0.push(format!("fetch {}", app.name));
            Ok(())
        }
        fn install(&self, app: &App) -> Result<(), AppError> {
            self.0.push(format!("install {}", app.name));
            Ok(())
        }
        fn start(&self, app: &App) -> Result<(), AppError> {
            self.0.push(format!("start {}", app.name));
            Ok(())
        }
        fn run(&self, app: &App) -> Result<(), AppError> {
            self.0.push(format!("run {}", app.name));
            Ok(())
        }
        fn remove(&self, app: &App) {
            self.0.push(format!("remove {}", app.name));
        }
        fn is_running(&self, _app: &App) -> bool {
            true
        }
    }

    struct MockSource(Vec<Target>);

    impl TargetSource for MockSource {
        fn targets(&self) -> Result<TargetList, MetaPullError> {
            Ok(TargetList {
                targets: self.0.clone(),
                cached: false,
            })
        }
    }

    struct Fixture {
        updater: Updater,
        calls: Rc<Calls>,
        _dir: tempfile::TempDir,
    }

    fn fixture(status: &str, published: Vec<Target>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let storage_dir = root.join("sota");
        std::fs::create_dir_all(&storage_dir).unwrap();
        let apps_root = root.join("compose-apps");
        std::fs::create_dir_all(&apps_root).unwrap();
        let sysroot = Rc::new(
            Sysroot::from_status_text(&root.join("sysroot"), "lmp", LoadMode::Booted, status)
                .unwrap(),
        );
        let token = Rc::new(FlowControlToken::default());
        let calls = Rc::new(Calls::default());
        let client = reqwest::blocking::Client::new();
        let rootfs = RootfsTreeManager::new(
            Rc::clone(&sysroot),
            Rc::clone(&token),
            client.clone(),
            "http://gateway.invalid".into(),
            "treehub".into(),
            "http://gateway.invalid/treehub".into(),
            None,
        );
        let storage = InstalledVersions::load(&storage_dir.join("installed_versions")).unwrap();
        let updater = Updater {
            hardware_id: "raspberrypi4-64".into(),
            tag: None,
            apps_root,
            storage_dir,
            sysroot,
            token,
            rootfs,
            downloader: Box::new(MockDownloader(Rc::clone(&calls))),
            bootloader: BootloaderController::new(RollbackMode::None),
            apps: Box::new(MockEngine(Rc::clone(&calls))),
            storage,
            source: Box::new(MockSource(published)),
            // Limit zero: orchestrator tests never talk to a gateway.
            events: ReportQueue::new(client, "http://gateway.invalid".into(), Some(0)),
            state: UpdateState::Idle,
        };
        Fixture {
            updater,
            calls,
            _dir: dir,
        }
    }

    #[test]
    fn test_check_selects_newer_target() {
        let status = format!("* lmp {HASH_A}.0\n");
        let mut foreign = target("other-9", "9", HASH_B, &[]);
        foreign.custom.hardware_ids = vec!["intel-corei7-64".to_string()];
        let published = vec![
            target("lmp-1", "1", HASH_A, &[]),
            target("lmp-2", "2", HASH_B, &[]),
            foreign,
        ];
        let mut f = fixture(&status, published);
        f.updater.storage.record_install(&target("lmp-1", "1", HASH_A, &[])).unwrap();
        f.updater.storage.set_current("lmp-1").unwrap();
        // The foreign-hardware Target is newer but must not win.
        let selected = f.updater.check().unwrap().target.unwrap();
        assert_eq!(selected.name, "lmp-2");
        // Once lmp-2 is current there is nothing newer.
        f.updater.storage.record_install(&selected).unwrap();
        f.updater.storage.set_current("lmp-2").unwrap();
        assert!(f.updater.check().unwrap().target.is_none());
    }

    #[test]
    fn test_apps_only_update_through_finalize() {
        let status = format!("* lmp {HASH_A}.0\n");
        let new = target("lmp-2", "2", HASH_A, &["app-00", "app-01"]);
        let mut f = fixture(&status, vec![new.clone()]);
        f.updater.storage.record_install(&target("lmp-1", "1", HASH_A, &[])).unwrap();
        f.updater.storage.set_current("lmp-1").unwrap();

        f.updater.download(&new).unwrap();
        assert_eq!(
            f.calls.take(),
            vec![
                format!("download {HASH_A}"),
                "fetch app-00".to_string(),
                "fetch app-01".to_string()
            ]
        );

        let outcome = f.updater.install(&new).unwrap();
        assert_eq!(outcome, InstallOutcome::AppsNeedFinalization);
        assert_eq!(f.calls.take(), vec!["install app-00", "install app-01"]);

        let outcome = f.updater.finalize().unwrap();
        assert_eq!(outcome, FinalizeOutcome::Ok);
        assert_eq!(f.calls.take(), vec!["start app-00", "start app-01"]);
        assert_eq!(f.updater.storage.current().unwrap().name, "lmp-2");
        // Exactly one record is current.
        let currents = f
            .updater
            .storage
            .all()
            .into_iter()
            .filter(|(_, c)| *c)
            .count();
        assert_eq!(currents, 1);
    }

    #[test]
    fn test_install_refused_while_another_is_staged() {
        let status = format!("  lmp {HASH_B}.0\n* lmp {HASH_A}.0\n");
        let new = target("lmp-2", "2", HASH_B, &[]);
        let mut f = fixture(&status, vec![new.clone()]);
        let e = f.updater.install(&new).unwrap_err();
        assert!(matches!(e, UpdateError::InstallInProgress(_)));
    }

    #[test]
    fn test_finalize_without_pending() {
        let status = format!("* lmp {HASH_A}.0\n");
        let mut f = fixture(&status, vec![]);
        let e = f.updater.finalize().unwrap_err();
        assert!(matches!(e, UpdateError::NothingPending));
    }

    #[test]
    fn test_finalize_awaits_reboot_in_same_boot() {
        let status = format!("  lmp {HASH_B}.0\n* lmp {HASH_A}.0\n");
        let mut f = fixture(&status, vec![]);
        f.updater.storage.record_install(&target("lmp-1", "1", HASH_A, &[])).unwrap();
        f.updater.storage.set_current("lmp-1").unwrap();
        f.updater
            .storage
            .record_install(&target("lmp-2", "2", HASH_B, &[]))
            .unwrap();
        f.updater.write_reboot_marker();
        let outcome = f.updater.finalize().unwrap();
        assert_eq!(outcome, FinalizeOutcome::NeedsReboot);
    }

    #[test]
    fn test_finalize_detects_rollback_after_reboot() {
        // The new deployment B is still listed first, but the device
        // booted A again and the install happened in an earlier boot:
        // the boot controller rolled us back.
        let status = format!("  lmp {HASH_B}.0\n* lmp {HASH_A}.0\n");
        let mut f = fixture(&status, vec![]);
        f.updater
            .storage
            .record_install(&target("lmp-1", "1", HASH_A, &["app-00"]))
            .unwrap();
        f.updater.storage.set_current("lmp-1").unwrap();
        f.updater
            .storage
            .record_install(&target("lmp-2", "2", HASH_B, &["app-00"]))
            .unwrap();
        std::fs::write(f.updater.reboot_marker_path(), "an-earlier-boot").unwrap();

        let outcome = f.updater.finalize().unwrap();
        assert_eq!(outcome, FinalizeOutcome::RollbackOk);
        assert_eq!(f.calls.take(), vec!["run app-00"]);
        // The previous Target stays current.
        assert_eq!(f.updater.storage.current().unwrap().name, "lmp-1");
    }

    #[test]
    fn test_tripped_token_stops_at_boundaries() {
        let status = format!("* lmp {HASH_A}.0\n");
        let new = target("lmp-2", "2", HASH_A, &["app-00"]);
        let mut f = fixture(&status, vec![new.clone()]);
        f.updater.token.trip();
        // The tree commit may finish, but no app fetch starts.
        let e = f.updater.download(&new).unwrap_err();
        assert!(matches!(e, UpdateError::Interrupted));
        assert_eq!(f.calls.take(), vec![format!("download {HASH_A}")]);
        let e = f.updater.finalize().unwrap_err();
        assert!(matches!(e, UpdateError::Interrupted));
    }

    #[test]
    fn test_update_select_by_name() {
        let status = format!("* lmp {HASH_A}.0\n");
        let published = vec![
            target("lmp-2", "2", HASH_B, &[]),
            target("lmp-3", "3", HASH_B, &[]),
        ];
        let mut f = fixture(&status, published);
        let t = f.updater.select(Some("lmp-2"), None).unwrap().unwrap();
        assert_eq!(t.name, "lmp-2");
        let e = f.updater.select(Some("lmp-9"), None).unwrap_err();
        assert!(matches!(e, UpdateError::TargetNotFound(_)));
    }
}
