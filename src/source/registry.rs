//! Registry image source.
//!
//! Resolves a tagged reference against an OCI/Docker registry, fetches
//! the manifest, and imports the layers base-first through the blob
//! repository. Docker schema1 manifests list layers top-down and are
//! iterated in reverse; schema2 and OCI manifests are already
//! base-first.

use crate::blob::BlobRepository;
use crate::config::BoxConfig;
use crate::constants::{DIAL_BACKOFF_MAX, DIAL_TIMEOUT, IDLE_CONN_TIMEOUT, TLS_HANDSHAKE_TIMEOUT};
use crate::engine::{EngineConn, EngineError};
use crate::error::{Error, Result};
use crate::profile::Profile;
use crate::source::engine_layer_id;
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::OciDescriptor;
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client, Reference};
use rand::Rng;
use serde::Deserialize;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Manifest media types the source accepts.
const ACCEPTED_MANIFEST_TYPES: &[&str] = &[
    "application/vnd.docker.distribution.manifest.v1+json",
    "application/vnd.docker.distribution.manifest.v1+prettyjws",
    "application/vnd.docker.distribution.manifest.v2+json",
    "application/vnd.oci.image.manifest.v1+json",
];

/// Pulls app images from a registry.
pub struct RegistrySource {
    blobs: Arc<BlobRepository>,
    config: BoxConfig,
}

impl RegistrySource {
    pub fn new(blobs: Arc<BlobRepository>, config: &BoxConfig) -> Self {
        Self {
            blobs,
            config: config.clone(),
        }
    }

    /// Downloads and imports every layer of `name`'s image; returns the
    /// engine layer ids in base-first order.
    pub async fn fetch_layers(
        &self,
        token: &CancellationToken,
        engine: &dyn EngineConn,
        name: &str,
        profile: &Profile,
    ) -> Result<Vec<String>> {
        if profile.registry.is_empty() {
            return Err(Error::RegistryRequired);
        }

        let (protocol, host) = split_scheme(&profile.registry);
        let reference = build_reference(host, &profile.repository, name)?;
        let auth = self.registry_auth(&profile.registry);
        // The client exposes one connect knob covering TCP connect and
        // TLS handshake, so both allowances go into it.
        let client = Client::new(ClientConfig {
            protocol,
            connect_timeout: Some(DIAL_TIMEOUT + TLS_HANDSHAKE_TIMEOUT),
            read_timeout: Some(IDLE_CONN_TIMEOUT),
            ..Default::default()
        });
        let client = &client;
        let reference = &reference;
        let auth = &auth;

        info!(reference = %reference, "resolving manifest");
        let (manifest_bytes, manifest_digest) = self
            .with_dial_retries(token, reference, move || {
                client.pull_manifest_raw(reference, auth, ACCEPTED_MANIFEST_TYPES)
            })
            .await?;
        debug!(reference = %reference, digest = %manifest_digest, "manifest fetched");

        let manifest = parse_manifest(&manifest_bytes)?;
        let mut layers = Vec::new();
        for layer in manifest.base_first_layers() {
            if token.is_cancelled() {
                return Err(Error::Canceled);
            }

            let descriptor = OciDescriptor {
                digest: layer.digest.clone(),
                media_type: layer.media_type.clone(),
                size: layer.size,
                urls: None,
                annotations: None,
            };
            let blob_path = self
                .blobs
                .get(&layer.digest, |mut file| async move {
                    let pulled = tokio::select! {
                        _ = token.cancelled() => return Err(Error::Canceled),
                        r = client.pull_blob(reference, &descriptor, &mut file) => r,
                    };
                    pulled.map_err(|e| Error::Registry {
                        reference: reference.to_string(),
                        reason: e.to_string(),
                    })?;
                    file.flush().await?;
                    Ok(())
                })
                .await?;

            let layer_id = engine_layer_id(&layer.digest);
            debug!(layer = %layer_id, blob = %blob_path.display(), "importing layer");
            match engine.import_layer(&layer_id, &blob_path).await {
                Ok(()) | Err(EngineError::LayerAlreadyExists(_)) => {}
                Err(e) => return Err(e.into()),
            }
            layers.push(layer_id);
        }

        Ok(layers)
    }

    fn registry_auth(&self, registry: &str) -> RegistryAuth {
        match self.config.registry_credentials(registry) {
            Some((user, password)) => {
                RegistryAuth::Basic(user.to_string(), password.to_string())
            }
            None => RegistryAuth::Anonymous,
        }
    }

    /// Runs `op` with bounded retries and a jittered pause, mirroring a
    /// retrying dialer: transient connection faults get another chance,
    /// cancellation aborts the wait.
    async fn with_dial_retries<T, F, Fut>(
        &self,
        token: &CancellationToken,
        reference: &Reference,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, oci_distribution::errors::OciDistributionError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if attempt < self.config.dialretries => {
                    attempt += 1;
                    let pause = {
                        let mut rng = rand::thread_rng();
                        DIAL_BACKOFF_MAX.mul_f64(rng.gen_range(0.0..1.0))
                    };
                    warn!(
                        reference = %reference,
                        attempt,
                        error = %e,
                        "registry request failed, retrying in {pause:?}"
                    );
                    tokio::select! {
                        _ = token.cancelled() => return Err(Error::Canceled),
                        _ = tokio::time::sleep(pause) => {}
                    }
                }
                Err(e) => {
                    return Err(Error::Registry {
                        reference: reference.to_string(),
                        reason: e.to_string(),
                    })
                }
            }
        }
    }
}

/// Splits an optional scheme off the configured registry; plain hosts
/// default to https.
fn split_scheme(registry: &str) -> (ClientProtocol, &str) {
    if let Some(host) = registry.strip_prefix("http://") {
        (ClientProtocol::Http, host)
    } else if let Some(host) = registry.strip_prefix("https://") {
        (ClientProtocol::Https, host)
    } else {
        (ClientProtocol::Https, registry)
    }
}

fn build_reference(host: &str, repository: &str, name: &str) -> Result<Reference> {
    let mut full = String::from(host);
    for segment in [repository, name] {
        if !segment.is_empty() {
            full.push('/');
            full.push_str(segment);
        }
    }
    full.parse().map_err(|e| Error::InvalidReference {
        reference: full.clone(),
        reason: format!("{e}"),
    })
}

// =============================================================================
// Manifest Schemas
// =============================================================================

/// One layer to pull, in base-first order.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LayerRef {
    pub digest: String,
    pub size: i64,
    pub media_type: String,
}

/// A fetched manifest, schema-dispatched by shape.
pub(crate) enum Manifest {
    /// Docker schema1 (signed); layers listed top-down.
    V1(ManifestV1),
    /// Docker schema2 or OCI; layers listed base-first.
    V2(ManifestV2),
}

#[derive(Debug, Deserialize)]
pub(crate) struct ManifestV1 {
    #[serde(rename = "fsLayers")]
    fs_layers: Vec<FsLayer>,
}

#[derive(Debug, Deserialize)]
struct FsLayer {
    #[serde(rename = "blobSum")]
    blob_sum: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ManifestV2 {
    layers: Vec<DescriptorV2>,
}

#[derive(Debug, Deserialize)]
struct DescriptorV2 {
    digest: String,
    #[serde(default)]
    size: i64,
    #[serde(rename = "mediaType", default)]
    media_type: String,
}

impl Manifest {
    /// Layers in the order they must be imported, base first.
    pub(crate) fn base_first_layers(&self) -> Vec<LayerRef> {
        match self {
            Manifest::V1(m) => m
                .fs_layers
                .iter()
                .rev()
                .map(|l| LayerRef {
                    digest: l.blob_sum.clone(),
                    size: 0,
                    media_type: String::new(),
                })
                .collect(),
            Manifest::V2(m) => m
                .layers
                .iter()
                .map(|l| LayerRef {
                    digest: l.digest.clone(),
                    size: l.size,
                    media_type: l.media_type.clone(),
                })
                .collect(),
        }
    }
}

/// Dispatches a raw manifest on its schema shape: schema2/OCI carry a
/// `layers` array, schema1 carries `fsLayers`. Anything else is fatal.
pub(crate) fn parse_manifest(bytes: &[u8]) -> Result<Manifest> {
    let value: serde_json::Value = serde_json::from_slice(bytes)?;
    if value.get("layers").is_some() {
        let manifest: ManifestV2 = serde_json::from_value(value)?;
        Ok(Manifest::V2(manifest))
    } else if value.get("fsLayers").is_some() {
        let manifest: ManifestV1 = serde_json::from_value(value)?;
        Ok(Manifest::V1(manifest))
    } else {
        let media_type = value
            .get("mediaType")
            .and_then(|m| m.as_str())
            .unwrap_or("<unspecified>")
            .to_string();
        Err(Error::UnknownManifest(media_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn v2_layers_are_imported_in_listed_order() {
        let bytes = serde_json::to_vec(&json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
            "layers": [
                {"digest": "sha256:base", "size": 10, "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip"},
                {"digest": "sha256:top", "size": 20, "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip"}
            ]
        }))
        .unwrap();

        let digests: Vec<String> = parse_manifest(&bytes)
            .unwrap()
            .base_first_layers()
            .into_iter()
            .map(|l| l.digest)
            .collect();
        assert_eq!(digests, vec!["sha256:base", "sha256:top"]);
    }

    #[test]
    fn v1_layers_are_reversed_to_base_first() {
        let bytes = serde_json::to_vec(&json!({
            "schemaVersion": 1,
            "fsLayers": [
                {"blobSum": "sha256:top"},
                {"blobSum": "sha256:mid"},
                {"blobSum": "sha256:base"}
            ]
        }))
        .unwrap();

        let digests: Vec<String> = parse_manifest(&bytes)
            .unwrap()
            .base_first_layers()
            .into_iter()
            .map(|l| l.digest)
            .collect();
        assert_eq!(digests, vec!["sha256:base", "sha256:mid", "sha256:top"]);
    }

    #[test]
    fn unknown_manifest_shape_is_fatal() {
        let bytes = serde_json::to_vec(&json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.index.v1+json",
            "manifests": []
        }))
        .unwrap();

        let err = parse_manifest(&bytes).unwrap_err();
        assert!(matches!(err, Error::UnknownManifest(_)));
        assert!(err.to_string().contains("image.index"));
    }

    #[test]
    fn scheme_selects_protocol_and_defaults_to_https() {
        assert!(matches!(
            split_scheme("http://reg.local:5000"),
            (ClientProtocol::Http, "reg.local:5000")
        ));
        assert!(matches!(
            split_scheme("https://reg.example.com"),
            (ClientProtocol::Https, "reg.example.com")
        ));
        assert!(matches!(
            split_scheme("reg.example.com"),
            (ClientProtocol::Https, "reg.example.com")
        ));
    }

    #[test]
    fn reference_built_from_registry_parts() {
        let reference = build_reference("reg.example.com", "apps", "echo:v1").unwrap();
        assert_eq!(reference.registry(), "reg.example.com");
        assert_eq!(reference.repository(), "apps/echo");
        assert_eq!(reference.tag(), Some("v1"));

        // Missing tag falls back to the registry default.
        let reference = build_reference("reg.example.com", "", "echo").unwrap();
        assert_eq!(reference.repository(), "echo");
    }
}
