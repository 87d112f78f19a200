//! Client for the OCI registry hosting compose-app bundles.
//!
//! An app bundle is addressed by a pinned URI of the form
//! `host[:port]/<factory>/<app>@sha256:<hex>`; its manifest is a plain
//! OCI image manifest whose first layer is the gzipped app archive.
//! Auth follows the device-gateway handshake: Basic material from the
//! hub-creds endpoint, exchanged for a Bearer token at the registry's
//! token service. The client is stateless across calls and never
//! retries.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use anyhow::Context;
use camino::Utf8Path;
use fn_error_context::context;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::apps::AppError;

/// Media type expected for an app manifest.
pub(crate) const MANIFEST_FORMAT: &str = "application/vnd.oci.image.manifest.v1+json";
/// The compose-app bundle format version this agent understands.
const COMPOSE_APP_VERSION: &str = "v1";
/// The annotation carrying the bundle format version.
const COMPOSE_APP_ANNOTATION: &str = "compose-app";

const SUPPORTED_REGISTRY_VERSION: &str = "/v2/";
const MANIFEST_ENDPOINT: &str = "/manifests/";
const BLOB_ENDPOINT: &str = "/blobs/";
/// Caps mirroring what the registry is expected to serve; anything
/// bigger is treated as a protocol violation.
const AUTH_MATERIAL_MAX_SIZE: usize = 1024;
const MANIFEST_MAX_SIZE: usize = 2048;
const MAX_BLOB_SIZE: u64 = i32::MAX as u64;

/// A URI was empty, unpinned, or malformed.
#[derive(Debug, thiserror::Error)]
#[error("invalid app uri {uri:?}: {reason}")]
pub(crate) struct InvalidUri {
    /// The rejected input.
    pub(crate) uri: String,
    /// What was wrong with it.
    pub(crate) reason: &'static str,
}

/// A pinned sha256 digest, `sha256:<64 hex>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HashedDigest {
    digest: String,
    short_hash: String,
}

impl HashedDigest {
    /// The only digest type the registry pins with.
    pub(crate) const TYPE: &'static str = "sha256:";

    /// Validate and wrap a `sha256:<hex>` digest string.
    pub(crate) fn new(digest: &str) -> Result<Self, InvalidUri> {
        let reject = |reason| InvalidUri {
            uri: digest.to_string(),
            reason,
        };
        let hash = digest
            .strip_prefix(Self::TYPE)
            .ok_or_else(|| reject("unsupported digest type"))?;
        if hash.len() != 64 {
            return Err(reject("sha256 hash is not 64 characters"));
        }
        if !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(reject("sha256 hash is not hexadecimal"));
        }
        Ok(Self {
            digest: digest.to_string(),
            short_hash: hash[..7].to_string(),
        })
    }

    /// The full `sha256:<hex>` form.
    pub(crate) fn digest(&self) -> &str {
        &self.digest
    }

    /// The bare hex hash.
    pub(crate) fn hash(&self) -> &str {
        &self.digest[Self::TYPE.len()..]
    }

    /// The abbreviated hash used in file names.
    pub(crate) fn short_hash(&self) -> &str {
        &self.short_hash
    }
}

/// A parsed app/image URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Uri {
    /// Registry host, with optional `:port`.
    pub(crate) registry_hostname: String,
    /// Full repository path (everything between host and `@`).
    pub(crate) repo: String,
    /// The app: the last path segment.
    pub(crate) app: String,
    /// The segments before the app, empty for single-segment paths.
    pub(crate) factory: String,
    /// The pinned content digest.
    pub(crate) digest: HashedDigest,
}

impl Uri {
    /// Parse `host[:port]/path@sha256:<hex>`. When `require_factory` is
    /// set, the path must have at least two segments (the form app
    /// bundles are always published under).
    pub(crate) fn parse(uri: &str, require_factory: bool) -> Result<Self, InvalidUri> {
        let reject = |reason| InvalidUri {
            uri: uri.to_string(),
            reason,
        };
        let (name, digest) = uri.split_once('@').ok_or_else(|| reject("missing @"))?;
        let digest = HashedDigest::new(digest).map_err(|e| InvalidUri {
            uri: uri.to_string(),
            reason: e.reason,
        })?;
        let (host, repo) = name.split_once('/').ok_or_else(|| reject("missing path"))?;
        if host.is_empty() || repo.is_empty() {
            return Err(reject("missing path"));
        }
        let segments: Vec<&str> = repo.split('/').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(reject("empty path segment"));
        }
        if require_factory && segments.len() < 2 {
            return Err(reject("missing factory segment"));
        }
        let app = segments.last().expect("nonempty path").to_string();
        let factory = segments[..segments.len() - 1].join("/");
        Ok(Self {
            registry_hostname: host.to_string(),
            repo: repo.to_string(),
            app,
            factory,
            digest,
        })
    }

    /// The same repository pinned to a different digest; used to address
    /// the archive blob named by the manifest.
    pub(crate) fn with_digest(&self, digest: HashedDigest) -> Self {
        Self {
            digest,
            ..self.clone()
        }
    }
}

impl std::fmt::Display for Uri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}@{}",
            self.registry_hostname,
            self.repo,
            self.digest.digest()
        )
    }
}

#[derive(Debug, Deserialize)]
struct ManifestLayer {
    digest: String,
    size: i64,
}

/// An app manifest: an OCI image manifest whose first layer is the app
/// archive.
#[derive(Debug, Deserialize)]
pub(crate) struct Manifest {
    #[serde(rename = "mediaType", default)]
    media_type: Option<String>,
    #[serde(default)]
    layers: Vec<ManifestLayer>,
    #[serde(default)]
    annotations: BTreeMap<String, String>,
}

impl Manifest {
    /// Parse and validate manifest JSON.
    pub(crate) fn parse(text: &str) -> Result<Self, AppError> {
        let manifest: Manifest = serde_json::from_str(text)
            .map_err(|e| AppError::BadManifest(format!("not a manifest: {e}")))?;
        if let Some(mt) = manifest.media_type.as_deref() {
            if mt != MANIFEST_FORMAT {
                return Err(AppError::BadManifest(format!(
                    "unsupported manifest media type: {mt}"
                )));
            }
        }
        match manifest.annotations.get(COMPOSE_APP_ANNOTATION) {
            None => {
                return Err(AppError::BadManifest(
                    "missing a manifest version annotation".into(),
                ))
            }
            Some(v) if v != COMPOSE_APP_VERSION => {
                return Err(AppError::BadManifest(format!(
                    "unsupported manifest version: {v}"
                )))
            }
            Some(_) => {}
        }
        Ok(manifest)
    }

    /// Digest of the app archive blob.
    pub(crate) fn archive_digest(&self) -> Result<&str, AppError> {
        self.layers
            .first()
            .map(|l| l.digest.as_str())
            .filter(|d| !d.is_empty())
            .ok_or_else(|| AppError::BadManifest("missing archive digest".into()))
    }

    /// Size of the app archive blob in bytes.
    pub(crate) fn archive_size(&self) -> Result<u64, AppError> {
        let size = self
            .layers
            .first()
            .map(|l| l.size)
            .ok_or_else(|| AppError::BadManifest("missing archive size".into()))?;
        if size <= 0 || size as u128 > usize::MAX as u128 {
            return Err(AppError::BadManifest(format!(
                "invalid archive size: {size}"
            )));
        }
        Ok(size as u64)
    }
}

/// Authenticated client for app manifests and archive blobs.
#[derive(Debug)]
pub(crate) struct RegistryClient {
    client: reqwest::blocking::Client,
    auth_creds_endpoint: String,
}

impl RegistryClient {
    /// Create a client. `client` carries any device identity (mTLS)
    /// needed to talk to the hub-creds endpoint.
    pub(crate) fn new(client: reqwest::blocking::Client, auth_creds_endpoint: String) -> Self {
        Self {
            client,
            auth_creds_endpoint,
        }
    }

    /// Fetch and validate the manifest the URI pins.
    pub(crate) fn app_manifest(&self, uri: &Uri) -> Result<Manifest, AppError> {
        let auth = self.bearer_auth_header(uri)?;
        let url = format!(
            "https://{}{}{}{}{}",
            uri.registry_hostname,
            SUPPORTED_REGISTRY_VERSION,
            uri.repo,
            MANIFEST_ENDPOINT,
            uri.digest.digest()
        );
        let resp = self
            .client
            .get(&url)
            .header(reqwest::header::AUTHORIZATION, auth.as_str())
            .header(reqwest::header::ACCEPT, MANIFEST_FORMAT)
            .send()
            .and_then(|r| r.error_for_status())
            .with_context(|| format!("GET {url}"))?;
        let text = resp.text().context("Reading manifest body")?;
        if text.len() > MANIFEST_MAX_SIZE {
            return Err(AppError::BadManifest(format!(
                "manifest exceeds {MANIFEST_MAX_SIZE} bytes"
            )));
        }
        Manifest::parse(&text)
    }

    /// Download the blob the URI pins into `dst`, verifying both the
    /// advertised size and the content digest.
    pub(crate) fn download_blob(
        &self,
        uri: &Uri,
        dst: &Utf8Path,
        expected_size: u64,
    ) -> Result<(), AppError> {
        if expected_size > MAX_BLOB_SIZE {
            return Err(AppError::BadManifest(format!(
                "archive size {expected_size} exceeds the supported maximum"
            )));
        }
        let auth = self.bearer_auth_header(uri)?;
        let url = format!(
            "https://{}{}{}{}{}",
            uri.registry_hostname,
            SUPPORTED_REGISTRY_VERSION,
            uri.repo,
            BLOB_ENDPOINT,
            uri.digest.digest()
        );
        let mut resp = self
            .client
            .get(&url)
            .header(reqwest::header::AUTHORIZATION, auth.as_str())
            .send()
            .and_then(|r| r.error_for_status())
            .with_context(|| format!("GET {url}"))?;
        let mut file = std::fs::File::create(dst)
            .with_context(|| format!("Creating {dst}"))?;
        let mut hasher = Sha256::new();
        let mut written: u64 = 0;
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = resp.read(&mut buf).context("Reading blob stream")?;
            if n == 0 {
                break;
            }
            written += n as u64;
            if written > expected_size {
                return Err(anyhow::anyhow!(
                    "blob exceeds the advertised size {expected_size}"
                )
                .into());
            }
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n])
                .with_context(|| format!("Writing {dst}"))?;
        }
        if written != expected_size {
            return Err(
                anyhow::anyhow!("blob size mismatch: got {written}, expected {expected_size}")
                    .into(),
            );
        }
        let got = hex::encode(hasher.finalize());
        if got != uri.digest.hash() {
            return Err(anyhow::anyhow!(
                "blob digest mismatch: got sha256:{got}, expected {}",
                uri.digest.digest()
            )
            .into());
        }
        Ok(())
    }

    #[context("Requesting registry auth material")]
    fn basic_auth_header(&self) -> anyhow::Result<String> {
        let resp = self
            .client
            .get(&self.auth_creds_endpoint)
            .send()
            .and_then(|r| r.error_for_status())
            .with_context(|| format!("GET {}", self.auth_creds_endpoint))?;
        let text = resp.text().context("Reading auth material")?;
        if text.len() > AUTH_MATERIAL_MAX_SIZE {
            anyhow::bail!("auth material exceeds {AUTH_MATERIAL_MAX_SIZE} bytes");
        }
        #[derive(Deserialize)]
        struct HubCreds {
            #[serde(rename = "Secret")]
            secret: String,
        }
        // The endpoint returns ready-made Basic material,
        // base64(username:password).
        let creds: HubCreds = serde_json::from_str(&text).context("Parsing auth material")?;
        Ok(format!("Basic {}", creds.secret))
    }

    #[context("Requesting registry token for {uri}")]
    fn bearer_auth_header(&self, uri: &Uri) -> anyhow::Result<String> {
        let basic = self.basic_auth_header()?;
        let url = format!(
            "https://{}/token-auth/?scope=repository:{}:pull&service={}",
            uri.registry_hostname, uri.repo, uri.registry_hostname
        );
        let resp = self
            .client
            .get(&url)
            .header(reqwest::header::AUTHORIZATION, basic.as_str())
            .send()
            .and_then(|r| r.error_for_status())
            .with_context(|| format!("GET {url}"))?;
        #[derive(Deserialize)]
        struct TokenResponse {
            token: String,
        }
        let token: TokenResponse = resp.json().context("Parsing token response")?;
        Ok(format!("Bearer {}", token.token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH: &str = "b0150d88116219cbf46ebb5dc08d8a559c4f1ab2731a788628fc7375b2372cb0";

    #[test]
    fn test_parse_uri() {
        let uri = Uri::parse(&format!("host/factory/app@sha256:{HASH}"), true).unwrap();
        assert_eq!(uri.registry_hostname, "host");
        assert_eq!(uri.factory, "factory");
        assert_eq!(uri.app, "app");
        assert_eq!(uri.digest.hash(), HASH);

        // Hostname includes a port.
        let uri = Uri::parse(&format!("host:8080/factory/app@sha256:{HASH}"), true).unwrap();
        assert_eq!(uri.registry_hostname, "host:8080");
        assert_eq!(uri.factory, "factory");
        assert_eq!(uri.app, "app");

        // Single-element image name at a third party registry.
        let uri = Uri::parse(&format!("host/alpine@sha256:{HASH}"), false).unwrap();
        assert_eq!(uri.repo, "alpine");
        assert_eq!(uri.app, "alpine");
        assert_eq!(uri.factory, "");

        let uri = Uri::parse(&format!("host:8080/alpine@sha256:{HASH}"), false).unwrap();
        assert_eq!(uri.registry_hostname, "host:8080");
        assert_eq!(uri.app, "alpine");

        // Two path elements.
        let uri = Uri::parse(&format!("host/library/alpine@sha256:{HASH}"), false).unwrap();
        assert_eq!(uri.repo, "library/alpine");
        assert_eq!(uri.app, "alpine");
        assert_eq!(uri.factory, "library");

        // Three path elements.
        let uri = Uri::parse(&format!("host/library/alpine/latest@sha256:{HASH}"), false).unwrap();
        assert_eq!(uri.repo, "library/alpine/latest");
        assert_eq!(uri.app, "latest");
        assert_eq!(uri.factory, "library/alpine");
    }

    #[test]
    fn test_parse_uri_negative() {
        for uri in [
            "",
            "foo",
            "host/factory/app@",
            "host/factory/app@sha256",
            "host/factory/app@sha256:",
            "host/factory/app@sha256:131313",
            &format!("no-path@sha256:{HASH}"),
        ] {
            assert!(Uri::parse(uri, true).is_err(), "accepted {uri:?}");
        }
        // A single path element is only rejected when the publisher
        // layout (factory/app) is required.
        let uri = format!("host/no-factory@sha256:{HASH}");
        assert!(Uri::parse(&uri, true).is_err());
        assert!(Uri::parse(&uri, false).is_ok());
    }

    #[test]
    fn test_uri_roundtrip() {
        for uri in [
            format!("host/factory/app@sha256:{HASH}"),
            format!("host:8080/library/alpine/latest@sha256:{HASH}"),
        ] {
            assert_eq!(Uri::parse(&uri, false).unwrap().to_string(), uri);
        }
    }

    #[test]
    fn test_with_digest() {
        let uri = Uri::parse(&format!("host/factory/app@sha256:{HASH}"), true).unwrap();
        let other = HashedDigest::new(&format!("sha256:{}", "1".repeat(64))).unwrap();
        let blob = uri.with_digest(other.clone());
        assert_eq!(blob.repo, uri.repo);
        assert_eq!(blob.digest, other);
        assert_eq!(blob.digest.short_hash(), "1111111");
    }

    fn manifest_json(annotation: Option<&str>, size: i64) -> String {
        let annotations = match annotation {
            Some(v) => format!(r#","annotations": {{"compose-app": "{v}"}}"#),
            None => String::new(),
        };
        format!(
            r#"{{"mediaType": "application/vnd.oci.image.manifest.v1+json",
                 "layers": [{{"digest": "sha256:{}", "size": {size}}}]{annotations}}}"#,
            "2".repeat(64)
        )
    }

    #[test]
    fn test_manifest_validation() {
        let m = Manifest::parse(&manifest_json(Some("v1"), 1024)).unwrap();
        assert_eq!(m.archive_size().unwrap(), 1024);
        assert_eq!(m.archive_digest().unwrap(), format!("sha256:{}", "2".repeat(64)));

        assert!(matches!(
            Manifest::parse(&manifest_json(None, 1024)),
            Err(AppError::BadManifest(_))
        ));
        assert!(matches!(
            Manifest::parse(&manifest_json(Some("v2"), 1024)),
            Err(AppError::BadManifest(_))
        ));
        let zero = Manifest::parse(&manifest_json(Some("v1"), 0)).unwrap();
        assert!(matches!(zero.archive_size(), Err(AppError::BadManifest(_))));
        let negative = Manifest::parse(&manifest_json(Some("v1"), -1)).unwrap();
        assert!(matches!(negative.archive_size(), Err(AppError::BadManifest(_))));
    }
}
