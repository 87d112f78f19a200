//! Durable record of every installed Target.
//!
//! A JSON object mapping Target name to its hashes, custom metadata and
//! the `is_current` flag; at most one record is current at any time.
//! Writes are whole-file replacements, renamed into place. A corrupted
//! file is surfaced as an error; it is never silently replaced.

use std::collections::BTreeMap;
use std::io::Write;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::{Deserialize, Serialize};

use crate::target::{Target, TargetCustom};

/// The content hashes of an installed Target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Hashes {
    /// The tree commit hash.
    pub(crate) sha256: String,
}

/// One installed Target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct VersionRecord {
    /// Content hashes.
    pub(crate) hashes: Hashes,
    /// Whether this is the Target the device currently runs.
    pub(crate) is_current: bool,
    /// The Target's custom metadata, kept verbatim.
    pub(crate) custom: TargetCustom,
}

impl VersionRecord {
    fn to_target(&self, name: &str) -> Target {
        Target {
            name: name.to_string(),
            sha256: self.hashes.sha256.clone(),
            custom: self.custom.clone(),
        }
    }
}

/// The installed-versions store.
#[derive(Debug)]
pub(crate) struct InstalledVersions {
    path: Utf8PathBuf,
    records: BTreeMap<String, VersionRecord>,
}

impl InstalledVersions {
    /// Load the store; an absent file is an empty store, anything
    /// unparsable is an error the caller must surface.
    #[context("Loading installed versions from {path}")]
    pub(crate) fn load(path: &Utf8Path) -> Result<Self> {
        let records = match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content)
                .with_context(|| format!("corrupted installed-versions file {path}"))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e).with_context(|| format!("reading {path}")),
        };
        Ok(Self {
            path: path.to_owned(),
            records,
        })
    }

    #[context("Persisting installed versions")]
    fn save(&self) -> Result<()> {
        let dir = self.path.parent().context("installed-versions path has no parent")?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("creating temp file in {dir}"))?;
        serde_json::to_writer_pretty(&mut tmp, &self.records)?;
        tmp.flush()?;
        tmp.persist(&self.path)
            .with_context(|| format!("replacing {}", self.path))?;
        Ok(())
    }

    /// Append (or refresh) the record for a just-installed Target; the
    /// record does not become current until finalize succeeds.
    pub(crate) fn record_install(&mut self, target: &Target) -> Result<()> {
        self.records.insert(
            target.name.clone(),
            VersionRecord {
                hashes: Hashes {
                    sha256: target.sha256.clone(),
                },
                is_current: false,
                custom: target.custom.clone(),
            },
        );
        self.save()
    }

    /// Make `name` the single current record.
    pub(crate) fn set_current(&mut self, name: &str) -> Result<()> {
        anyhow::ensure!(
            self.records.contains_key(name),
            "no installed-versions record for {name}"
        );
        for (k, v) in self.records.iter_mut() {
            v.is_current = k == name;
        }
        self.save()
    }

    /// The Target the store believes the device runs.
    pub(crate) fn current(&self) -> Option<Target> {
        self.records
            .iter()
            .find(|(_, v)| v.is_current)
            .map(|(k, v)| v.to_target(k))
    }

    /// All records, as (target, is_current) pairs.
    pub(crate) fn all(&self) -> Vec<(Target, bool)> {
        self.records
            .iter()
            .map(|(k, v)| (v.to_target(k), v.is_current))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &Utf8Path) -> InstalledVersions {
        InstalledVersions::load(&dir.join("installed_versions")).unwrap()
    }

    fn target(name: &str, version: &str, hash: &str) -> Target {
        let mut custom = TargetCustom::default();
        custom.version = version.to_string();
        Target {
            name: name.to_string(),
            sha256: hash.to_string(),
            custom,
        }
    }

    #[test]
    fn test_roundtrip_and_single_current() {
        let td = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(td.path()).unwrap();
        let mut s = store(dir);
        s.record_install(&target("lmp-1", "1", &"a".repeat(64))).unwrap();
        s.record_install(&target("lmp-2", "2", &"b".repeat(64))).unwrap();
        s.set_current("lmp-1").unwrap();
        s.set_current("lmp-2").unwrap();

        let s = store(dir);
        let currents: Vec<_> = s.all().into_iter().filter(|(_, c)| *c).collect();
        assert_eq!(currents.len(), 1);
        assert_eq!(currents[0].0.name, "lmp-2");
        assert_eq!(s.current().unwrap().sha256, "b".repeat(64));
    }

    #[test]
    fn test_missing_file_is_empty() {
        let td = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(td.path()).unwrap();
        let s = store(dir);
        assert!(s.all().is_empty());
        assert!(s.current().is_none());
    }

    #[test]
    fn test_corrupted_file_surfaces_error() {
        let td = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(td.path()).unwrap();
        let path = dir.join("installed_versions");
        std::fs::write(&path, "deadbeef\t\ncorrupted file\n\n").unwrap();
        let e = InstalledVersions::load(&path).unwrap_err();
        assert!(format!("{e:#}").contains("corrupted"));
        // The file is left untouched for inspection.
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "deadbeef\t\ncorrupted file\n\n"
        );
    }

    #[test]
    fn test_set_current_unknown_target() {
        let td = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(td.path()).unwrap();
        let mut s = store(dir);
        assert!(s.set_current("never-installed").is_err());
    }

    #[test]
    fn test_wire_shape() {
        let td = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(td.path()).unwrap();
        let path = dir.join("installed_versions");
        let mut s = InstalledVersions::load(&path).unwrap();
        s.record_install(&target("lmp-1", "1", &"a".repeat(64))).unwrap();
        s.set_current("lmp-1").unwrap();
        let v: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(v["lmp-1"]["hashes"]["sha256"], "a".repeat(64));
        assert_eq!(v["lmp-1"]["is_current"], true);
        assert_eq!(v["lmp-1"]["custom"]["version"], "1");
    }
}
