//! Request data model: profiles and spawn configuration.
//!
//! A profile arrives as an opaque mapping inside the request frame and
//! is decoded on demand; unrecognized options are ignored.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Per-request isolation profile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Profile {
    /// Isolation backend the request targets; required.
    #[serde(rename = "type")]
    pub isolate_type: String,

    /// Registry host to pull the image from.
    pub registry: String,

    /// Repository path under the registry.
    pub repository: String,

    /// Declared layers for the helper path.
    #[serde(rename = "extendedInfo")]
    pub extended_info: ExtendedInfo,

    /// Network options (`mtn`, `netid`, ...).
    pub network: HashMap<String, String>,

    /// Extra volumes mounted into the container.
    pub volumes: Vec<VolumeProfile>,
}

impl Profile {
    /// Decodes a profile from the raw mapping carried in a frame.
    pub fn from_value(raw: &serde_json::Value) -> Result<Self> {
        serde_json::from_value(raw.clone())
            .map_err(|e| Error::InvalidArgs(format!("bad profile: {e}")))
    }

    /// True when the profile asks for a managed network allocation.
    pub fn wants_net_allocation(&self) -> bool {
        self.network.get("mtn").map(String::as_str) == Some("enable")
    }

    /// Network id for the allocation binding; empty when unset.
    pub fn net_id(&self) -> &str {
        self.network.get("netid").map(String::as_str).unwrap_or("")
    }

    /// Image URI of an app under this profile's registry.
    pub fn image_uri(&self, name: &str) -> String {
        let mut uri = self.registry.clone();
        for segment in [self.repository.as_str(), name] {
            if !segment.is_empty() {
                uri.push('/');
                uri.push_str(segment);
            }
        }
        uri
    }
}

/// Extended image information for the helper source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtendedInfo {
    /// Ordered declared layers, base first.
    pub layers: Vec<LayerDecl>,
}

/// One declared layer the helper can fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerDecl {
    /// Hex digest of the layer blob.
    pub digest: String,
    /// Digest algorithm name, e.g. `sha256`.
    #[serde(rename = "digestType")]
    pub digest_type: String,
    /// Blob size in bytes.
    #[serde(default)]
    pub size: u64,
    /// Helper-side identifier of the blob.
    #[serde(rename = "torrentId")]
    pub torrent_id: String,
}

/// One extra volume requested by the profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeProfile {
    /// Mount target inside the container root.
    pub target: String,
    /// Engine volume properties.
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

/// Everything needed to spawn one worker container.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// Raw profile as received; decoded by the box.
    pub profile: serde_json::Value,
    /// App name; must have been spooled before.
    pub name: String,
    /// Executable to run inside the container.
    pub executable: String,
    /// Command-line arguments; `--uuid` carries the worker UUID, unique
    /// for the lifetime of the box.
    pub args: HashMap<String, String>,
    /// Environment variables.
    pub env: HashMap<String, String>,
}

impl SpawnConfig {
    /// Client-assigned worker UUID; empty when the client omitted it.
    pub fn worker_uuid(&self) -> &str {
        self.args.get("--uuid").map(String::as_str).unwrap_or("")
    }
}

/// Turns an app name into a label safe for engine ids.
pub fn sanitize_app_name(name: &str) -> String {
    name.replace(':', "_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn profile_decodes_wire_names() {
        let raw = json!({
            "type": "porto",
            "registry": "registry.example.com",
            "repository": "apps",
            "extendedInfo": {
                "layers": [
                    {"digest": "ab12", "digestType": "sha256", "size": 7, "torrentId": "t1"}
                ]
            },
            "network": {"mtn": "enable", "netid": "net-1"},
        });
        let profile = Profile::from_value(&raw).unwrap();
        assert_eq!(profile.isolate_type, "porto");
        assert_eq!(profile.extended_info.layers.len(), 1);
        assert_eq!(profile.extended_info.layers[0].torrent_id, "t1");
        assert!(profile.wants_net_allocation());
        assert_eq!(profile.net_id(), "net-1");
    }

    #[test]
    fn profile_tolerates_unknown_options() {
        let raw = json!({"type": "porto", "someFutureOption": {"a": 1}});
        let profile = Profile::from_value(&raw).unwrap();
        assert_eq!(profile.isolate_type, "porto");
        assert!(!profile.wants_net_allocation());
    }

    #[test]
    fn app_name_sanitized_for_engine_ids() {
        assert_eq!(sanitize_app_name("echo:v2"), "echo_v2");
        assert_eq!(sanitize_app_name("plain"), "plain");
    }
}
