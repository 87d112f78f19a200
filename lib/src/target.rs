//! Software Targets as published by the device gateway.
//!
//! A Target binds an OSTree commit (the root filesystem) with an optional
//! set of compose apps. Targets are created by the signing authority and
//! are immutable once observed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::apps::App;

/// The target format this agent knows how to install.
pub(crate) const TARGET_FORMAT: &str = "OSTREE";

/// Reference to a single compose app inside a Target's custom metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct AppRef {
    /// Registry URI of the app bundle, `host[:port]/path@sha256:<hex>`.
    pub(crate) uri: String,
}

/// The `custom` section of a Target record. Unknown keys are carried
/// through verbatim so that re-serializing a record is lossless.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct TargetCustom {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) name: Option<String>,
    #[serde(default)]
    pub(crate) version: String,
    #[serde(default, rename = "hardwareIds")]
    pub(crate) hardware_ids: Vec<String>,
    #[serde(default, rename = "targetFormat", skip_serializing_if = "Option::is_none")]
    pub(crate) target_format: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub(crate) tags: Vec<String>,
    #[serde(default, rename = "docker_compose_apps", skip_serializing_if = "BTreeMap::is_empty")]
    pub(crate) apps: BTreeMap<String, AppRef>,
    #[serde(flatten)]
    pub(crate) extra: serde_json::Map<String, serde_json::Value>,
}

/// A signed record naming a tree commit and a set of apps.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Target {
    /// Target name, e.g. `raspberrypi4-64-lmp-2`.
    pub(crate) name: String,
    /// The OSTree commit hash of the root filesystem tree.
    pub(crate) sha256: String,
    /// Custom metadata attached by the signing authority.
    pub(crate) custom: TargetCustom,
}

impl Target {
    /// The Target version. Versions are monotone integers carried as
    /// strings; anything non-numeric compares as zero.
    pub(crate) fn version(&self) -> i64 {
        self.custom.version.parse().unwrap_or(0)
    }

    /// Whether this Target applies to the given hardware id.
    pub(crate) fn matches_hardware(&self, hardware_id: &str) -> bool {
        self.custom.hardware_ids.iter().any(|id| id == hardware_id)
    }

    /// Whether the target format is one this agent can install.
    pub(crate) fn is_supported_format(&self) -> bool {
        match self.custom.target_format.as_deref() {
            Some(f) => f == TARGET_FORMAT,
            // Absent means the legacy publisher which only produced OSTREE.
            None => true,
        }
    }

    /// The compose apps of this Target, in the iteration order of the
    /// signed app map (which is also the download and install order).
    pub(crate) fn apps(&self) -> Vec<App> {
        self.custom
            .apps
            .iter()
            .map(|(name, r)| App {
                name: name.clone(),
                uri: r.uri.clone(),
            })
            .collect()
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (ostree: {})", self.name, self.sha256)
    }
}
