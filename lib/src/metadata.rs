//! Fetching the signed Target list from the device gateway.
//!
//! Signature verification is the metadata library's concern and stays
//! outside this crate; here the signed payload is transported, cached,
//! and decoded into [`Target`] records. The last successfully fetched
//! copy is kept on disk so a check-in can fall back to it when the
//! gateway is unreachable.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

use crate::storage::Hashes;
use crate::target::{Target, TargetCustom};

/// Metadata could not be fetched or decoded.
#[derive(Debug, thiserror::Error)]
#[error("failed to pull update metadata: {0}")]
pub(crate) struct MetaPullError(pub(crate) String);

/// The decoded Target list.
#[derive(Debug)]
pub(crate) struct TargetList {
    /// All published Targets.
    pub(crate) targets: Vec<Target>,
    /// Whether this list came from the on-disk cache rather than the
    /// gateway.
    pub(crate) cached: bool,
}

/// Where Targets come from.
pub(crate) trait TargetSource {
    /// Fetch the current Target list.
    fn targets(&self) -> Result<TargetList, MetaPullError>;
}

#[derive(Debug, Deserialize)]
struct TargetMeta {
    hashes: Hashes,
    #[serde(default)]
    custom: TargetCustom,
}

#[derive(Debug, Deserialize)]
struct SignedTargets {
    targets: BTreeMap<String, TargetMeta>,
}

#[derive(Debug, Deserialize)]
struct SignedMeta {
    signed: SignedTargets,
}

fn parse_targets(text: &str) -> Result<Vec<Target>, MetaPullError> {
    let meta: SignedMeta = serde_json::from_str(text).map_err(|e| MetaPullError(e.to_string()))?;
    Ok(meta
        .signed
        .targets
        .into_iter()
        .map(|(name, t)| Target {
            name,
            sha256: t.hashes.sha256,
            custom: t.custom,
        })
        .collect())
}

/// Target source backed by the device gateway's TUF repo endpoint.
#[derive(Debug)]
pub(crate) struct GatewayTargetSource {
    client: reqwest::blocking::Client,
    repo_url: String,
    cache_path: Utf8PathBuf,
}

impl GatewayTargetSource {
    /// Create a source for `<gateway>/repo`, caching under
    /// `storage_dir`.
    pub(crate) fn new(
        client: reqwest::blocking::Client,
        gateway_url: &str,
        storage_dir: &Utf8Path,
    ) -> Self {
        Self {
            client,
            repo_url: format!("{gateway_url}/repo"),
            cache_path: storage_dir.join("targets.json"),
        }
    }

    fn fetch(&self) -> Result<String, MetaPullError> {
        let url = format!("{}/targets.json", self.repo_url);
        self.client
            .get(&url)
            .send()
            .and_then(|r| r.error_for_status())
            .and_then(|r| r.text())
            .map_err(|e| MetaPullError(format!("GET {url}: {e}")))
    }
}

impl TargetSource for GatewayTargetSource {
    fn targets(&self) -> Result<TargetList, MetaPullError> {
        match self.fetch() {
            Ok(text) => {
                let targets = parse_targets(&text)?;
                if let Err(e) = std::fs::write(&self.cache_path, &text) {
                    tracing::warn!("Failed to cache targets metadata at {}: {e}", self.cache_path);
                }
                Ok(TargetList {
                    targets,
                    cached: false,
                })
            }
            Err(fetch_err) => match std::fs::read_to_string(&self.cache_path) {
                Ok(text) => {
                    tracing::warn!("{fetch_err}; falling back to cached metadata");
                    Ok(TargetList {
                        targets: parse_targets(&text)?,
                        cached: true,
                    })
                }
                Err(_) => Err(fetch_err),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn targets_json() -> String {
        serde_json::json!({
            "signatures": [],
            "signed": {
                "_type": "Targets",
                "version": 3,
                "targets": {
                    "raspberrypi4-64-lmp-2": {
                        "hashes": {"sha256": "a".repeat(64)},
                        "length": 0,
                        "custom": {
                            "version": "2",
                            "hardwareIds": ["raspberrypi4-64"],
                            "targetFormat": "OSTREE"
                        }
                    }
                }
            }
        })
        .to_string()
    }

    #[test]
    fn test_parse_targets() {
        let targets = parse_targets(&targets_json()).unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].name, "raspberrypi4-64-lmp-2");
        assert_eq!(targets[0].sha256, "a".repeat(64));
        assert_eq!(targets[0].version(), 2);
        assert!(targets[0].matches_hardware("raspberrypi4-64"));
    }

    #[test]
    fn test_parse_targets_rejects_garbage() {
        assert!(parse_targets("not metadata").is_err());
        assert!(parse_targets("{}").is_err());
    }
}
