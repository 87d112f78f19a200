//! # Agent configuration
//!
//! One TOML file describes the device: where the sysroot lives, which
//! bootloader convention it follows, where apps are kept, and how to
//! reach the device gateway and registry. Everything is passed
//! explicitly from here; the agent reads no process-wide state.

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::Deserialize;

use crate::bootloader::RollbackMode;
use crate::ostree::repo::TlsMaterial;
use crate::ostree::sysroot::LoadMode;

/// Where the configuration is looked up unless overridden.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/edgeupd/config.toml";

fn default_sysroot() -> Utf8PathBuf {
    "/sysroot".into()
}

fn default_os_name() -> String {
    "lmp".into()
}

fn default_booted() -> bool {
    true
}

/// The `[sysroot]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SysrootConfig {
    /// Path of the physical sysroot.
    #[serde(default = "default_sysroot")]
    pub path: Utf8PathBuf,
    /// The stateroot (os) name deployments belong to.
    #[serde(default = "default_os_name")]
    pub os_name: String,
    /// Whether the agent runs on the booted system. Disable for image
    /// builds and tests operating on a sysroot directory.
    #[serde(default = "default_booted")]
    pub booted: bool,
}

impl SysrootConfig {
    pub(crate) fn load_mode(&self) -> LoadMode {
        if self.booted {
            LoadMode::Booted
        } else {
            LoadMode::Staged
        }
    }
}

impl Default for SysrootConfig {
    fn default() -> Self {
        Self {
            path: default_sysroot(),
            os_name: default_os_name(),
            booted: true,
        }
    }
}

fn default_rollback_mode() -> RollbackMode {
    RollbackMode::None
}

/// The `[bootloader]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BootloaderConfig {
    /// The boot-counter convention of this device family.
    #[serde(default = "default_rollback_mode")]
    pub rollback_mode: RollbackMode,
}

impl Default for BootloaderConfig {
    fn default() -> Self {
        Self {
            rollback_mode: default_rollback_mode(),
        }
    }
}

/// The `[device]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    /// Hardware id Targets must name to apply here.
    pub hardware_id: String,
    /// Optional tag Targets must carry (e.g. a release channel).
    #[serde(default)]
    pub tag: Option<String>,
}

fn default_apps_root() -> Utf8PathBuf {
    "/var/sota/compose-apps".into()
}

fn default_compose_bin() -> String {
    "docker-compose".into()
}

fn default_docker_bin() -> String {
    "docker".into()
}

/// The `[apps.tree]` section: retrieve app bundles from a tree
/// repository instead of the registry.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppTreeConfig {
    /// Path of the local app-tree repository.
    pub path: Utf8PathBuf,
    /// Where the container image store of the tree is checked out.
    pub images_dir: Utf8PathBuf,
    /// Pull from this repository on the local filesystem instead of the
    /// tree server (fully offline operation).
    #[serde(default)]
    pub local_mirror: Option<Utf8PathBuf>,
}

/// The `[apps]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppsConfig {
    /// Directory the compose apps live under.
    #[serde(default = "default_apps_root")]
    pub root: Utf8PathBuf,
    /// The compose tool.
    #[serde(default = "default_compose_bin")]
    pub compose_bin: String,
    /// The container engine CLI.
    #[serde(default = "default_docker_bin")]
    pub docker_bin: String,
    /// Present when app bundles come from a tree repository.
    #[serde(default)]
    pub tree: Option<AppTreeConfig>,
}

impl Default for AppsConfig {
    fn default() -> Self {
        Self {
            root: default_apps_root(),
            compose_bin: default_compose_bin(),
            docker_bin: default_docker_bin(),
            tree: None,
        }
    }
}

/// The `[registry]` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegistryConfig {
    /// Endpoint handing out Basic auth material for the registry;
    /// defaults to the gateway's `hub-creds` endpoint.
    #[serde(default)]
    pub auth_creds_endpoint: Option<String>,
}

impl RegistryConfig {
    /// The auth-material endpoint, explicit or derived.
    pub(crate) fn auth_creds_endpoint(&self, gateway_server: &str) -> String {
        self.auth_creds_endpoint
            .clone()
            .unwrap_or_else(|| format!("{gateway_server}/hub-creds/"))
    }
}

fn default_remote_name() -> String {
    "treehub".into()
}

/// The `[gateway]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    /// Base URL of the device gateway.
    pub server: String,
    /// Base URL of the tree server; defaults to `<server>/treehub`.
    #[serde(default)]
    pub tree_server: Option<String>,
    /// Name the tree server is registered under in the repo.
    #[serde(default = "default_remote_name")]
    pub remote_name: String,
    /// CA bundle for the gateway and tree server.
    #[serde(default)]
    pub tls_ca_path: Option<Utf8PathBuf>,
    /// Client certificate (device identity).
    #[serde(default)]
    pub tls_cert_path: Option<Utf8PathBuf>,
    /// Client private key.
    #[serde(default)]
    pub tls_key_path: Option<Utf8PathBuf>,
    /// Bound on queued-but-undelivered report events.
    #[serde(default)]
    pub event_limit: Option<usize>,
}

impl GatewayConfig {
    /// The tree server URL, explicit or derived.
    pub(crate) fn tree_server(&self) -> String {
        self.tree_server
            .clone()
            .unwrap_or_else(|| format!("{}/treehub", self.server))
    }

    /// TLS material for tree-repo remotes, when fully configured.
    pub(crate) fn tls_material(&self) -> Option<TlsMaterial> {
        match (&self.tls_ca_path, &self.tls_cert_path, &self.tls_key_path) {
            (Some(ca), Some(cert), Some(key)) => Some(TlsMaterial {
                ca_path: ca.to_string(),
                cert_path: cert.to_string(),
                key_path: key.to_string(),
            }),
            _ => None,
        }
    }

    /// HTTP client for gateway endpoints, carrying the device identity
    /// when one is configured.
    #[context("Building gateway http client")]
    pub(crate) fn http_client(&self) -> Result<reqwest::blocking::Client> {
        let mut builder = reqwest::blocking::Client::builder();
        if let (Some(cert), Some(key)) = (&self.tls_cert_path, &self.tls_key_path) {
            let mut pem = std::fs::read(cert).with_context(|| format!("reading {cert}"))?;
            pem.extend(std::fs::read(key).with_context(|| format!("reading {key}"))?);
            let identity = reqwest::Identity::from_pem(&pem).context("loading device identity")?;
            builder = builder.use_rustls_tls().identity(identity);
        }
        if let Some(ca) = &self.tls_ca_path {
            let ca_pem = std::fs::read(ca).with_context(|| format!("reading {ca}"))?;
            let cert = reqwest::Certificate::from_pem(&ca_pem).context("loading gateway CA")?;
            builder = builder.add_root_certificate(cert);
        }
        builder.build().map_err(Into::into)
    }
}

fn default_storage_dir() -> Utf8PathBuf {
    "/var/sota".into()
}

/// The `[storage]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// Directory holding the installed-versions file and metadata cache.
    #[serde(default = "default_storage_dir")]
    pub path: Utf8PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_dir(),
        }
    }
}

impl StorageConfig {
    /// Path of the installed-versions file.
    pub(crate) fn installed_versions_path(&self) -> Utf8PathBuf {
        self.path.join("installed_versions")
    }
}

/// The whole agent configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    /// Device identity and target filters.
    pub device: DeviceConfig,
    /// Device gateway endpoints and TLS.
    pub gateway: GatewayConfig,
    /// Sysroot layout.
    #[serde(default)]
    pub sysroot: SysrootConfig,
    /// Bootloader convention.
    #[serde(default)]
    pub bootloader: BootloaderConfig,
    /// Compose apps.
    #[serde(default)]
    pub apps: AppsConfig,
    /// Registry auth.
    #[serde(default)]
    pub registry: RegistryConfig,
    /// Durable agent state.
    #[serde(default)]
    pub storage: StorageConfig,
}

impl AgentConfig {
    /// Load the configuration from a TOML file.
    #[context("Loading configuration from {path}")]
    pub fn load(path: &Utf8Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
        toml::from_str(&content).with_context(|| format!("parsing {path}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
[device]
hardware_id = "raspberrypi4-64"
tag = "main"

[gateway]
server = "https://gw.example.com:8443"
tls_ca_path = "/var/sota/root.crt"
tls_cert_path = "/var/sota/client.pem"
tls_key_path = "/var/sota/pkey.pem"

[sysroot]
path = "/sysroot"
os_name = "lmp"

[bootloader]
rollback_mode = "uboot_masked"

[apps]
root = "/var/sota/compose-apps"
"#;

    #[test]
    fn test_parse_full() {
        let c: AgentConfig = toml::from_str(CONFIG).unwrap();
        assert_eq!(c.device.hardware_id, "raspberrypi4-64");
        assert_eq!(c.gateway.tree_server(), "https://gw.example.com:8443/treehub");
        assert_eq!(c.bootloader.rollback_mode, RollbackMode::UbootMasked);
        assert!(c.gateway.tls_material().is_some());
        assert_eq!(c.storage.installed_versions_path(), "/var/sota/installed_versions");
        assert!(c.apps.tree.is_none());
    }

    #[test]
    fn test_defaults() {
        let c: AgentConfig = toml::from_str(
            "[device]\nhardware_id = \"intel-corei7-64\"\n[gateway]\nserver = \"https://gw\"\n",
        )
        .unwrap();
        assert_eq!(c.sysroot.path, "/sysroot");
        assert_eq!(c.apps.compose_bin, "docker-compose");
        assert_eq!(c.bootloader.rollback_mode, RollbackMode::None);
        assert!(c.gateway.tls_material().is_none());
        assert_eq!(
            c.registry.auth_creds_endpoint("https://gw"),
            "https://gw/hub-creds/"
        );
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let r: Result<AgentConfig, _> = toml::from_str(
            "[device]\nhardware_id = \"x\"\nnot_a_key = 1\n[gateway]\nserver = \"https://gw\"\n",
        );
        assert!(r.is_err());
    }
}
