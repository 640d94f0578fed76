// src/models.rs

use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;

// =============================================================================
// Catalog Types
// =============================================================================

/// A data or service offer as published in the federated catalog.
///
/// The well-known kit fields are typed; everything else a provider attaches
/// ends up in `extra` so nothing is lost when the offer is mirrored into
/// `metadata.json`. A well-known key whose value has an unexpected type (or
/// is `null`) is kept verbatim in `extra` instead of failing the offer.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Offer {
    /// Asset id on the provider's connector.
    #[serde(rename = "@id", skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// JSON-LD type tag; a string or a list of strings.
    #[serde(rename = "@type", skip_serializing_if = "Option::is_none")]
    pub offer_type: Option<Value>,
    pub kit_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    /// "basic" or "composite".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kit_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asset_type: Option<String>,
    /// Composite kits are published with `access_type` instead of `asset_type`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_file_name: Option<String>,
    #[serde(rename = "odrl:hasPolicy", skip_serializing_if = "Vec::is_empty")]
    pub policies: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub semantic_model: Option<Value>,
    /// Never surfaced to the matcher or written to the workspace.
    #[serde(rename = "dcat:distribution", skip_serializing)]
    pub distribution: Option<Value>,
    /// Composite kits list the kits they bundle here.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub components: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl<'de> Deserialize<'de> for Offer {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let mut raw = Map::<String, Value>::deserialize(deserializer)?;

        // The kit name is how offers are resolved; without a usable one the offer is dropped.
        let kit_name = match raw.remove("kit_name") {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(name)) => name,
            Some(other) => {
                return Err(de::Error::custom(format!(
                    "kit_name must be a string, got {}",
                    other
                )))
            }
        };

        let policies = match raw.remove("odrl:hasPolicy") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items,
            Some(single) => vec![single],
        };

        Ok(Offer {
            id: take_string(&mut raw, "@id").unwrap_or_default(),
            offer_type: take_value(&mut raw, "@type"),
            kit_name,
            provider_id: take_string(&mut raw, "provider_id"),
            kit_type: take_string(&mut raw, "kit_type"),
            asset_type: take_string(&mut raw, "asset_type"),
            access_type: take_string(&mut raw, "access_type"),
            default_file_name: take_string(&mut raw, "default_file_name"),
            policies,
            semantic_model: take_value(&mut raw, "semantic_model"),
            distribution: raw.remove("dcat:distribution").filter(|v| !v.is_null()),
            components: take_value(&mut raw, "components"),
            extra: raw,
        })
    }
}

/// Moves a string attribute out of `raw`. Anything else stays where it is.
fn take_string(raw: &mut Map<String, Value>, key: &str) -> Option<String> {
    match raw.get(key) {
        Some(Value::String(_)) => match raw.remove(key) {
            Some(Value::String(s)) => Some(s),
            _ => None,
        },
        _ => None,
    }
}

/// Moves a non-null attribute out of `raw`; an explicit `null` stays in `raw`.
fn take_value(raw: &mut Map<String, Value>, key: &str) -> Option<Value> {
    match raw.get(key) {
        Some(Value::Null) | None => None,
        Some(_) => raw.remove(key),
    }
}

impl Offer {
    /// Creates a bare offer with the given kit name, used as asset id as well.
    pub fn new(kit_name: impl Into<String>) -> Self {
        let kit_name = kit_name.into();
        Self {
            id: kit_name.clone(),
            kit_name,
            ..Default::default()
        }
    }

    /// The asset id used for credential lookup and negotiation.
    /// Kits are created with their name as `@id`, so fall back to it.
    pub fn asset_id(&self) -> &str {
        if self.id.is_empty() {
            &self.kit_name
        } else {
            &self.id
        }
    }

    /// The transfer type tag, whichever of the two spellings the provider used.
    pub fn transfer_type(&self) -> Option<&str> {
        self.asset_type.as_deref().or(self.access_type.as_deref())
    }

    /// First published policy, the one used for negotiation.
    pub fn primary_policy(&self) -> Option<&Value> {
        self.policies.first()
    }

    /// Builder-style helper to attach an arbitrary attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// A single component reference inside a composite kit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentRef {
    pub provider_id: String,
    pub kit_name: String,
}

/// One participant's catalog inside the federated catalog.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    #[serde(rename = "dspace:participantId", alias = "participantId", default)]
    pub participant_id: String,
    /// Protocol address of the participant's connector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub originator: Option<String>,
    #[serde(rename = "dcat:dataset", default, deserialize_with = "lenient_offers")]
    pub datasets: Vec<Offer>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CatalogEntry {
    pub fn new(participant_id: impl Into<String>, datasets: Vec<Offer>) -> Self {
        Self {
            participant_id: participant_id.into(),
            datasets,
            ..Default::default()
        }
    }

    pub fn with_originator(mut self, originator: impl Into<String>) -> Self {
        self.originator = Some(originator.into());
        self
    }
}

/// Snapshot of the federated catalog, in the order the catalog service returned it.
pub type FederatedCatalog = Vec<CatalogEntry>;

/// An offer together with the catalog entry it was found in.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedOffer {
    pub offer: Offer,
    pub participant_id: String,
    pub originator: Option<String>,
}

// =============================================================================
// Transfer Types
// =============================================================================

/// Endpoint and token authorizing one transfer of one asset (an EDR).
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub asset_id: String,
    pub endpoint: String,
    pub token: String,
}

// Tokens stay out of logs.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("asset_id", &self.asset_id)
            .field("endpoint", &self.endpoint)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Everything the orchestrator needs to pull one asset.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferRequest {
    pub provider_id: String,
    pub connector_url: String,
    pub kit_name: String,
    pub asset_id: String,
    pub policy: Value,
    /// Sent as JSON with a POST when present, otherwise the fetch is a GET.
    pub body: Option<Value>,
    pub overwrite: bool,
}

impl TransferRequest {
    /// Builds a request for a resolved offer using its first policy.
    /// Returns `None` if the offer publishes no policy.
    pub fn for_offer(resolved: &ResolvedOffer, connector_url: impl Into<String>) -> Option<Self> {
        let policy = resolved.offer.primary_policy()?.clone();
        Some(Self {
            provider_id: resolved.participant_id.clone(),
            connector_url: connector_url.into(),
            kit_name: resolved.offer.kit_name.clone(),
            asset_id: resolved.offer.asset_id().to_string(),
            policy,
            body: None,
            overwrite: false,
        })
    }

    pub fn with_body(mut self, body: Option<Value>) -> Self {
        self.body = body;
        self
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }
}

/// Raw response of a data pull: selected headers plus the body as a chunk stream.
pub struct PayloadResponse {
    pub content_disposition: Option<String>,
    pub content_type: Option<String>,
    pub body: BoxStream<'static, Result<Bytes, String>>,
}

impl fmt::Debug for PayloadResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadResponse")
            .field("content_disposition", &self.content_disposition)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

/// What a finished transfer left on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReceipt {
    pub folder: PathBuf,
    pub payload: PathBuf,
    pub bytes_written: u64,
    /// True if a negotiation had to be started to obtain the credential.
    pub negotiated: bool,
    /// True if an existing entry was kept because overwrite was not requested.
    pub reused: bool,
}

/// User-facing result of a kit download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOutcome {
    pub success: bool,
    pub message: String,
}

impl TransferOutcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

// =============================================================================
// Deserialization Helpers
// =============================================================================

/// Catalogs publish a single object where a list has one element.
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => Vec::new(),
        Value::Array(items) => items,
        single => vec![single],
    })
}

/// Like `one_or_many`, but offers that do not fit the envelope are dropped
/// with a warning instead of failing the whole catalog.
fn lenient_offers<'de, D>(deserializer: D) -> Result<Vec<Offer>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = one_or_many(deserializer)?;
    Ok(raw
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<Offer>(value) {
            Ok(offer) => Some(offer),
            Err(e) => {
                log::warn!("Skipping malformed catalog offer: {}", e);
                None
            }
        })
        .collect())
}
