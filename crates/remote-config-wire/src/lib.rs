//! JSON models for the tracer-facing Remote Configuration endpoint.
//!
//! Tracers poll the agent's `/v0.7/config` endpoint with a
//! [`ClientGetConfigsRequest`] and receive a [`ClientGetConfigsResponse`].
//! Byte fields travel as standard base64 strings and the agent (as well as
//! other tracers) freely emits `null` for empty collections, so every
//! collection tolerates `null` on the way in.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

// Base64 serialization for single Vec<u8> field (required)
pub(crate) mod serde_base64 {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let encoded = base64::engine::general_purpose::STANDARD.encode(value);
        serializer.serialize_str(&encoded)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        base64::engine::general_purpose::STANDARD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

// Base64 serialization for optional Vec<u8> field; empty strings decode to `None`.
pub(crate) mod serde_base64_option {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(bytes) => {
                let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
                serializer.serialize_some(&encoded)
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt = Option::<String>::deserialize(deserializer)?;
        opt.filter(|s| !s.is_empty())
            .map(|s| {
                base64::engine::general_purpose::STANDARD
                    .decode(s.as_bytes())
                    .map_err(serde::de::Error::custom)
            })
            .transpose()
    }
}

// Base64 serialization for Vec<Vec<u8>> field
pub(crate) mod serde_base64_vec {
    use base64::Engine;
    use serde::ser::SerializeSeq;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &[Vec<u8>], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut seq = serializer.serialize_seq(Some(value.len()))?;
        for item in value {
            let encoded = base64::engine::general_purpose::STANDARD.encode(item);
            seq.serialize_element(&encoded)?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let strings = Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default();
        strings
            .into_iter()
            .map(|s| {
                base64::engine::general_purpose::STANDARD
                    .decode(s.as_bytes())
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}

// Custom deserializer that treats null as the type's default value
pub(crate) mod null_as_default {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
        T: Default + Deserialize<'de>,
    {
        let opt = Option::<T>::deserialize(deserializer)?;
        Ok(opt.unwrap_or_default())
    }
}

/// Body of a `POST /v0.7/config` request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientGetConfigsRequest {
    pub client: Client,
    /// Files the client already holds, so the agent can omit their content.
    #[serde(default, deserialize_with = "null_as_default::deserialize")]
    pub cached_target_files: Vec<TargetFileMeta>,
}

/// Identity and state of the polling client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    pub state: ClientState,
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default::deserialize")]
    pub products: Vec<String>,
    pub is_tracer: bool,
    pub client_tracer: ClientTracer,
    /// Capability bitmask as minimal big-endian bytes.
    #[serde(default, with = "serde_base64")]
    pub capabilities: Vec<u8>,
}

/// Metadata describing the tracer hosting the client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientTracer {
    pub runtime_id: String,
    pub language: String,
    pub tracer_version: String,
    #[serde(default, deserialize_with = "null_as_default::deserialize")]
    pub service: String,
    #[serde(default, deserialize_with = "null_as_default::deserialize")]
    pub env: String,
    #[serde(default, deserialize_with = "null_as_default::deserialize")]
    pub app_version: String,
    #[serde(default, deserialize_with = "null_as_default::deserialize")]
    pub tags: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default::deserialize")]
    pub extra_services: Vec<String>,
}

/// What the client applied during the previous cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientState {
    pub root_version: u64,
    pub targets_version: u64,
    #[serde(default, deserialize_with = "null_as_default::deserialize")]
    pub config_states: Vec<ConfigState>,
    pub has_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Opaque backend state echoed back verbatim from `targets.signed.custom`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_client_state: Option<String>,
}

impl Default for ClientState {
    fn default() -> Self {
        Self {
            root_version: 1,
            targets_version: 0,
            config_states: Vec::new(),
            has_error: false,
            error: None,
            backend_client_state: None,
        }
    }
}

/// Outcome of applying one configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ApplyState {
    #[default]
    Unknown,
    Unacknowledged,
    Acknowledged,
    Error,
}

impl ApplyState {
    pub fn as_u64(self) -> u64 {
        match self {
            ApplyState::Unknown => 0,
            ApplyState::Unacknowledged => 1,
            ApplyState::Acknowledged => 2,
            ApplyState::Error => 3,
        }
    }

    pub fn from_u64(value: u64) -> Self {
        match value {
            1 => ApplyState::Unacknowledged,
            2 => ApplyState::Acknowledged,
            3 => ApplyState::Error,
            _ => ApplyState::Unknown,
        }
    }
}

impl Serialize for ApplyState {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(self.as_u64())
    }
}

impl<'de> Deserialize<'de> for ApplyState {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<u64>::deserialize(deserializer)?.unwrap_or_default();
        Ok(ApplyState::from_u64(raw))
    }
}

/// Per-configuration entry of [`ClientState::config_states`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigState {
    pub id: String,
    pub version: u64,
    pub product: String,
    #[serde(default)]
    pub apply_state: ApplyState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apply_error: Option<String>,
}

/// A file the client already holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetFileMeta {
    pub path: String,
    pub length: u64,
    #[serde(default, deserialize_with = "null_as_default::deserialize")]
    pub hashes: Vec<TargetFileHash>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetFileHash {
    pub algorithm: String,
    pub hash: String,
}

/// Body returned by the agent for a non-empty poll.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientGetConfigsResponse {
    /// Root metadata updates; carried for completeness, the client pins its key.
    #[serde(default, with = "serde_base64_vec")]
    pub roots: Vec<Vec<u8>>,
    /// Base64 of the `{"signed": .., "signatures": [..]}` targets document.
    #[serde(default, with = "serde_base64_option")]
    pub targets: Option<Vec<u8>>,
    #[serde(default, deserialize_with = "null_as_default::deserialize")]
    pub target_files: Vec<File>,
    /// Config paths the client must hold after this cycle.
    #[serde(default, deserialize_with = "null_as_default::deserialize")]
    pub client_configs: Vec<String>,
}

/// Raw content of one target file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct File {
    pub path: String,
    #[serde(with = "serde_base64")]
    pub raw: Vec<u8>,
}
