//! Boot-counter and rollback-flag handling.
//!
//! Four conventions exist in the field, selected by configuration; they
//! share two operations (*mark-boot-ok* and *notify-update-staged*)
//! plus a per-Target install notification. Every variable write is an
//! externally observable side effect, idempotent under repetition, and
//! best-effort: a failed write is logged but never aborts the caller.

use anyhow::Result;
use edgeupd_utils::Task;
use serde::Deserialize;

use crate::target::Target;

/// Tool driving the generic u-boot environment.
const UBOOT_SETENV: &str = "fw_setenv";
/// Tool driving the verified-boot environment.
const VERIFIED_SETENV: &str = "fiovb_setenv";

/// The boot-counter convention a device family follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackMode {
    /// The bootloader keeps no counters; both operations are no-ops.
    None,
    /// Plain u-boot `bootcount`/`rollback` variables.
    UbootGeneric,
    /// u-boot with `upgrade_available` masking the boot counter.
    UbootMasked,
    /// Verified boot: the masked convention through a different ABI,
    /// plus a `bootupgrade_available` flag.
    Fiovb,
    /// Anything the configuration named that this agent does not know.
    /// Every operation fails explicitly rather than guessing.
    #[serde(other)]
    Unknown,
}

/// Controller writing the boot flags for the configured convention.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BootloaderController {
    mode: RollbackMode,
}

impl BootloaderController {
    /// Create a controller for the given mode.
    pub(crate) fn new(mode: RollbackMode) -> Self {
        Self { mode }
    }

    /// Record that the current boot reached a healthy state, resetting
    /// the boot counter (and clearing `upgrade_available` where the
    /// convention has it).
    pub(crate) fn set_boot_ok(&self) -> Result<()> {
        match self.mode {
            RollbackMode::None => {}
            RollbackMode::UbootGeneric => {
                set_env(UBOOT_SETENV, "bootcount", "0");
            }
            RollbackMode::UbootMasked => {
                set_env(UBOOT_SETENV, "bootcount", "0");
                set_env(UBOOT_SETENV, "upgrade_available", "0");
            }
            RollbackMode::Fiovb => {
                set_env(VERIFIED_SETENV, "bootcount", "0");
                set_env(VERIFIED_SETENV, "upgrade_available", "0");
            }
            RollbackMode::Unknown => anyhow::bail!("unknown bootloader rollback mode"),
        }
        Ok(())
    }

    /// Record that an update has been staged: arm the boot counter and
    /// clear any stale rollback flag so the next boot tries the new
    /// deployment.
    pub(crate) fn update_notify(&self) -> Result<()> {
        match self.mode {
            RollbackMode::None => {}
            RollbackMode::UbootGeneric => {
                set_env(UBOOT_SETENV, "bootcount", "0");
                set_env(UBOOT_SETENV, "rollback", "0");
            }
            RollbackMode::UbootMasked => {
                set_env(UBOOT_SETENV, "bootcount", "0");
                set_env(UBOOT_SETENV, "upgrade_available", "1");
                set_env(UBOOT_SETENV, "rollback", "0");
            }
            RollbackMode::Fiovb => {
                set_env(VERIFIED_SETENV, "bootcount", "0");
                set_env(VERIFIED_SETENV, "upgrade_available", "1");
                set_env(VERIFIED_SETENV, "rollback", "0");
                set_env(VERIFIED_SETENV, "bootupgrade_available", "1");
            }
            RollbackMode::Unknown => anyhow::bail!("unknown bootloader rollback mode"),
        }
        Ok(())
    }

    /// Per-Target install notification. No convention currently writes
    /// anything here, but an unknown mode still fails explicitly.
    pub(crate) fn install_notify(&self, target: &Target) -> Result<()> {
        match self.mode {
            RollbackMode::Unknown => anyhow::bail!("unknown bootloader rollback mode"),
            _ => {
                tracing::trace!("install notify for {target}");
                Ok(())
            }
        }
    }
}

/// Write one bootloader environment variable. Failures are logged as
/// warnings and swallowed.
fn set_env(tool: &str, var: &str, value: &str) {
    let r = Task::new(format!("Setting {var}"), tool)
        .args([var, value])
        .quiet()
        .run_captured();
    if let Err(e) = r {
        tracing::warn!("Failed setting {var} via {tool}: {e}");
    }
}
