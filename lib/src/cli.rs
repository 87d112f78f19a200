//! # Edge update agent CLI
//!
//! The thin command-line surface over the update orchestrator. Each
//! operation maps its outcome onto the stable exit-code set consumed by
//! device management tooling; nothing here carries update logic.

use std::ffi::OsString;

use anyhow::Result;
use camino::Utf8PathBuf;
use clap::Parser;

use crate::config::{AgentConfig, DEFAULT_CONFIG_PATH};
use crate::download::DownloadError;
use crate::update::{CheckOutcome, FinalizeOutcome, InstallOutcome, UpdateError, Updater};

/// Result of an agent operation; the process exits with the numeric
/// value. The set is closed: device tooling matches on these numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// The operation completed.
    Ok = 0,
    /// Unclassified failure.
    UnknownError = 1,
    /// Check-in succeeded, but from cached metadata (gateway offline).
    CheckinOkCached = 3,
    /// Check-in failed and no cached metadata was usable.
    CheckinFailure = 4,
    /// Up to date, but a boot firmware update awaits a reboot.
    OkNeedsRebootForBootFw = 5,
    /// Target metadata could not be pulled.
    TufMetaPullFailure = 10,
    /// No published Target matches the request.
    TufTargetNotFound = 20,
    /// Another installation is staged and not finalized.
    InstallationInProgress = 30,
    /// Finalize was requested with nothing pending.
    NoPendingInstallation = 40,
    /// The tree download failed on every remote.
    DownloadFailure = 50,
    /// The tree download was refused for lack of storage.
    DownloadFailureNoSpace = 60,
    /// The downloaded tree failed verification.
    DownloadFailureVerificationFailed = 70,
    /// An app bundle or its images could not be pulled.
    InstallAppPullFailure = 80,
    /// Installed, but boot firmware needs its own reboot first.
    InstallNeedsRebootForBootFw = 90,
    /// Installed; reboot into the new deployment to continue.
    InstallNeedsReboot = 100,
    /// Installed apps await finalization (no reboot needed).
    InstallAppsNeedFinalization = 105,
    /// The update failed and the previous Target was restored.
    InstallRollbackOk = 110,
    /// Rollback re-deployed the previous tree; reboot to continue.
    InstallRollbackNeedsReboot = 120,
    /// Rollback could not restore the previous Target.
    InstallRollbackFailed = 130,
}

impl From<&UpdateError> for StatusCode {
    fn from(e: &UpdateError) -> Self {
        match e {
            UpdateError::MetaPull(_) => StatusCode::TufMetaPullFailure,
            UpdateError::TargetNotFound(_) => StatusCode::TufTargetNotFound,
            UpdateError::Download(DownloadError::Failed(_)) => StatusCode::DownloadFailure,
            UpdateError::Download(DownloadError::NoSpace { .. }) => {
                StatusCode::DownloadFailureNoSpace
            }
            UpdateError::Download(DownloadError::Verification(_)) => {
                StatusCode::DownloadFailureVerificationFailed
            }
            UpdateError::Download(DownloadError::Aborted) => StatusCode::UnknownError,
            UpdateError::AppPull { .. } => StatusCode::InstallAppPullFailure,
            UpdateError::InstallInProgress(_) => StatusCode::InstallationInProgress,
            UpdateError::NothingPending => StatusCode::NoPendingInstallation,
            UpdateError::Interrupted => StatusCode::UnknownError,
            UpdateError::Other(_) => StatusCode::UnknownError,
        }
    }
}

/// Perform an update operation
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct UpdateOpts {
    /// Install this Target by name instead of the newest applicable one.
    #[clap(long)]
    pub(crate) target_name: Option<String>,

    /// Install this Target version instead of the newest applicable one.
    #[clap(long, conflicts_with = "target_name")]
    pub(crate) version: Option<i64>,
}

#[derive(Debug, clap::Subcommand, PartialEq, Eq)]
pub(crate) enum Opt {
    /// Check in with the device gateway for a newer Target.
    Check,
    /// Download and install a Target.
    Update(UpdateOpts),
    /// Complete a pending installation, after the reboot or for an
    /// apps-only update.
    Finalize,
    /// Show deployment and app state.
    Status,
}

/// The edge update agent.
#[derive(Debug, Parser)]
#[clap(name = "edgeupd", version)]
pub(crate) struct Cli {
    /// Path of the agent configuration.
    #[clap(long, default_value = DEFAULT_CONFIG_PATH)]
    pub(crate) config: Utf8PathBuf,

    /// Log more (-v info, -vv debug, -vvv trace).
    #[clap(short, long, action = clap::ArgAction::Count, global = true)]
    pub(crate) verbose: u8,

    #[clap(subcommand)]
    pub(crate) opt: Opt,
}

fn report(e: &UpdateError) -> StatusCode {
    eprintln!("error: {e}");
    StatusCode::from(e)
}

fn run_check(updater: &mut Updater) -> StatusCode {
    match updater.check() {
        Ok(CheckOutcome { target, cached }) => {
            match target {
                Some(t) => println!("Update available: {t}"),
                None => println!("Device is up to date"),
            }
            if cached {
                StatusCode::CheckinOkCached
            } else {
                StatusCode::Ok
            }
        }
        Err(e) => {
            eprintln!("error: {e}");
            StatusCode::CheckinFailure
        }
    }
}

fn run_update(updater: &mut Updater, opts: UpdateOpts) -> StatusCode {
    let target = match updater.select(opts.target_name.as_deref(), opts.version) {
        Ok(Some(t)) => t,
        Ok(None) => {
            println!("Device is up to date");
            return StatusCode::Ok;
        }
        Err(e) => return report(&e),
    };
    println!("Updating to {target}");
    if let Err(e) = updater.download(&target) {
        return report(&e);
    }
    match updater.install(&target) {
        Ok(InstallOutcome::NeedsReboot) => {
            println!("Update staged; reboot to continue");
            StatusCode::InstallNeedsReboot
        }
        Ok(InstallOutcome::AppsNeedFinalization) => {
            println!("Apps installed; run finalize to start them");
            StatusCode::InstallAppsNeedFinalization
        }
        Err(e) => report(&e),
    }
}

fn run_finalize(updater: &mut Updater) -> StatusCode {
    match updater.finalize() {
        Ok(FinalizeOutcome::Ok) => {
            println!("Update finalized");
            StatusCode::Ok
        }
        Ok(FinalizeOutcome::NeedsReboot) => {
            println!("Still awaiting reboot into the staged deployment");
            StatusCode::InstallNeedsReboot
        }
        Ok(FinalizeOutcome::RollbackOk) => {
            println!("Update failed; previous Target restored");
            StatusCode::InstallRollbackOk
        }
        Ok(FinalizeOutcome::RollbackNeedsReboot) => {
            println!("Update failed; reboot to finish restoring the previous Target");
            StatusCode::InstallRollbackNeedsReboot
        }
        Ok(FinalizeOutcome::RollbackFailed) => {
            eprintln!("error: rollback failed");
            StatusCode::InstallRollbackFailed
        }
        Err(e) => report(&e),
    }
}

/// Parse the process arguments, run the requested operation, and return
/// the status code the process should exit with.
pub fn run_from_iter<I>(args: I) -> Result<StatusCode>
where
    I: IntoIterator,
    I::Item: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);
    edgeupd_utils::initialize_tracing(cli.verbose);
    tracing::trace!("starting");
    let config = AgentConfig::load(&cli.config)?;
    let mut updater = Updater::from_config(&config)?;
    let code = match cli.opt {
        Opt::Check => run_check(&mut updater),
        Opt::Update(opts) => run_update(&mut updater, opts),
        Opt::Finalize => run_finalize(&mut updater),
        Opt::Status => {
            let mut out = std::io::stdout().lock();
            updater.status(&mut out)?;
            StatusCode::Ok
        }
    };
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_args() {
        let cli = Cli::parse_from(["edgeupd", "update", "--target-name", "lmp-3"]);
        assert_eq!(
            cli.opt,
            Opt::Update(UpdateOpts {
                target_name: Some("lmp-3".into()),
                version: None
            })
        );
        assert_eq!(cli.config, Utf8PathBuf::from(DEFAULT_CONFIG_PATH));

        let cli = Cli::parse_from(["edgeupd", "--config", "/tmp/agent.toml", "finalize"]);
        assert_eq!(cli.opt, Opt::Finalize);
        assert_eq!(cli.config, Utf8PathBuf::from("/tmp/agent.toml"));
        assert_eq!(cli.verbose, 0);

        let cli = Cli::parse_from(["edgeupd", "check", "-vv"]);
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn test_exit_code_values() {
        // The closed set device tooling depends on.
        for (code, n) in [
            (StatusCode::Ok, 0),
            (StatusCode::UnknownError, 1),
            (StatusCode::CheckinOkCached, 3),
            (StatusCode::CheckinFailure, 4),
            (StatusCode::OkNeedsRebootForBootFw, 5),
            (StatusCode::TufMetaPullFailure, 10),
            (StatusCode::TufTargetNotFound, 20),
            (StatusCode::InstallationInProgress, 30),
            (StatusCode::NoPendingInstallation, 40),
            (StatusCode::DownloadFailure, 50),
            (StatusCode::DownloadFailureNoSpace, 60),
            (StatusCode::DownloadFailureVerificationFailed, 70),
            (StatusCode::InstallAppPullFailure, 80),
            (StatusCode::InstallNeedsRebootForBootFw, 90),
            (StatusCode::InstallNeedsReboot, 100),
            (StatusCode::InstallAppsNeedFinalization, 105),
            (StatusCode::InstallRollbackOk, 110),
            (StatusCode::InstallRollbackNeedsReboot, 120),
            (StatusCode::InstallRollbackFailed, 130),
        ] {
            assert_eq!(code as i32, n);
        }
    }

    #[test]
    fn test_error_mapping() {
        let cases: [(UpdateError, StatusCode); 5] = [
            (
                UpdateError::NothingPending,
                StatusCode::NoPendingInstallation,
            ),
            (
                UpdateError::TargetNotFound("x".into()),
                StatusCode::TufTargetNotFound,
            ),
            (
                UpdateError::Download(DownloadError::NoSpace {
                    path: "/sysroot".into(),
                    msg: "min-free-space-percent".into(),
                }),
                StatusCode::DownloadFailureNoSpace,
            ),
            (
                UpdateError::Download(DownloadError::Failed("all remotes failed".into())),
                StatusCode::DownloadFailure,
            ),
            (
                UpdateError::InstallInProgress("staged".into()),
                StatusCode::InstallationInProgress,
            ),
        ];
        for (e, code) in cases {
            assert_eq!(StatusCode::from(&e), code);
        }
    }
}
