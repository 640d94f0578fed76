// src/connectors/memory.rs
//
// In-memory dataspace used for offline catalog work and for exercising the
// transfer engine without a network. Every call is recorded so callers can
// check exactly what the engine asked for.

use crate::error::ConnectorError;
use crate::models::{Credential, FederatedCatalog, PayloadResponse};
use crate::traits::{DataspaceApi, SharedDataspaceApi};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

// --- 1. Recorded Calls ---

#[derive(Debug, Clone, PartialEq)]
pub struct NegotiationCall {
    pub connector_url: String,
    pub policy: Value,
    pub provider_id: String,
    pub asset_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchCall {
    pub endpoint: String,
    pub token: String,
    pub body: Option<Value>,
}

/// Everything the dataspace was asked, in order.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    pub catalog_fetches: usize,
    pub credential_lookups: Vec<String>,
    pub negotiations: Vec<NegotiationCall>,
    pub fetches: Vec<FetchCall>,
}

// --- 2. Fixtures ---

/// A canned response body, optionally breaking off after some chunks.
#[derive(Debug, Clone, Default)]
pub struct PayloadFixture {
    pub chunks: Vec<Bytes>,
    pub content_disposition: Option<String>,
    pub content_type: Option<String>,
    /// Yield an error after this many chunks instead of finishing.
    pub fail_after: Option<usize>,
}

impl PayloadFixture {
    pub fn new<B: Into<Bytes>>(chunks: impl IntoIterator<Item = B>) -> Self {
        Self {
            chunks: chunks.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_content_disposition(mut self, value: impl Into<String>) -> Self {
        self.content_disposition = Some(value.into());
        self
    }

    pub fn with_content_type(mut self, value: impl Into<String>) -> Self {
        self.content_type = Some(value.into());
        self
    }

    pub fn failing_after(mut self, chunks: usize) -> Self {
        self.fail_after = Some(chunks);
        self
    }
}

/// A credential the counterparty issues once a negotiation for its asset starts.
#[derive(Debug, Clone)]
struct Grant {
    credential: Credential,
    /// Lookups that still come back empty after the negotiation started.
    lookups_until_visible: usize,
    negotiated: bool,
}

#[derive(Default)]
struct MemoryState {
    catalog: FederatedCatalog,
    credentials: HashMap<String, Credential>,
    grants: HashMap<String, Grant>,
    payloads: HashMap<String, PayloadFixture>,
    failing_negotiations: bool,
    failing_lookups: bool,
    calls: CallLog,
}

// --- 3. The Memory Dataspace ---

/// Clone + thread-safe; clones share state, so a test can keep one handle
/// for assertions while the engine owns another.
#[derive(Clone, Default)]
pub struct MemoryDataspace {
    inner: Arc<Mutex<MemoryState>>,
}

impl MemoryDataspace {
    pub fn new(catalog: FederatedCatalog) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryState {
                catalog,
                ..Default::default()
            })),
        }
    }

    /// Loads a catalog snapshot saved as JSON (the federated catalog response body).
    pub fn from_catalog_file<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        let contents = std::fs::read_to_string(&path)
            .map_err(|e| format!("Failed to read catalog file: {}", e))?;
        let catalog: FederatedCatalog = serde_json::from_str(&contents)
            .map_err(|e| format!("Failed to parse catalog file: {}", e))?;
        Ok(Self::new(catalog))
    }

    /// Wraps this dataspace in an Arc for use as SharedDataspaceApi.
    pub fn shared(&self) -> SharedDataspaceApi {
        Arc::new(self.clone())
    }

    pub async fn set_catalog(&self, catalog: FederatedCatalog) {
        self.inner.lock().await.catalog = catalog;
    }

    /// Makes a credential available right away.
    pub async fn insert_credential(&self, credential: Credential) {
        let mut state = self.inner.lock().await;
        state
            .credentials
            .insert(credential.asset_id.clone(), credential);
    }

    /// Issues `credential` once a negotiation for its asset has started and
    /// `lookups_until_visible` further lookups have come back empty.
    pub async fn grant_on_negotiation(&self, credential: Credential, lookups_until_visible: usize) {
        let mut state = self.inner.lock().await;
        state.grants.insert(
            credential.asset_id.clone(),
            Grant {
                credential,
                lookups_until_visible,
                negotiated: false,
            },
        );
    }

    pub async fn insert_payload(&self, endpoint: impl Into<String>, payload: PayloadFixture) {
        self.inner
            .lock()
            .await
            .payloads
            .insert(endpoint.into(), payload);
    }

    /// Makes every negotiation request fail with an upstream error.
    pub async fn fail_negotiations(&self) {
        self.inner.lock().await.failing_negotiations = true;
    }

    /// Makes every credential lookup fail with an upstream error.
    pub async fn fail_credential_lookups(&self) {
        self.inner.lock().await.failing_lookups = true;
    }

    /// Returns a copy of everything recorded so far.
    pub async fn calls(&self) -> CallLog {
        self.inner.lock().await.calls.clone()
    }
}

#[async_trait]
impl DataspaceApi for MemoryDataspace {
    async fn federated_catalog(&self) -> Result<FederatedCatalog, ConnectorError> {
        let mut state = self.inner.lock().await;
        state.calls.catalog_fetches += 1;
        Ok(state.catalog.clone())
    }

    async fn credential(&self, asset_id: &str) -> Result<Option<Credential>, ConnectorError> {
        let mut state = self.inner.lock().await;
        state.calls.credential_lookups.push(asset_id.to_string());

        if state.failing_lookups {
            return Err(ConnectorError::Upstream(
                "EDR query API returned status: 503 Service Unavailable".to_string(),
            ));
        }

        if let Some(credential) = state.credentials.get(asset_id) {
            return Ok(Some(credential.clone()));
        }

        let issued = match state.grants.get_mut(asset_id) {
            Some(grant) if grant.negotiated => {
                if grant.lookups_until_visible == 0 {
                    Some(grant.credential.clone())
                } else {
                    grant.lookups_until_visible -= 1;
                    None
                }
            }
            _ => None,
        };

        if let Some(credential) = &issued {
            state.grants.remove(asset_id);
            state
                .credentials
                .insert(asset_id.to_string(), credential.clone());
        }
        Ok(issued)
    }

    async fn create_negotiation(
        &self,
        connector_url: &str,
        policy: &Value,
        provider_id: &str,
        asset_id: &str,
    ) -> Result<String, ConnectorError> {
        let mut state = self.inner.lock().await;
        state.calls.negotiations.push(NegotiationCall {
            connector_url: connector_url.to_string(),
            policy: policy.clone(),
            provider_id: provider_id.to_string(),
            asset_id: asset_id.to_string(),
        });

        if state.failing_negotiations {
            return Err(ConnectorError::Upstream(
                "API returned status: 500 Internal Server Error".to_string(),
            ));
        }

        if let Some(grant) = state.grants.get_mut(asset_id) {
            grant.negotiated = true;
        }
        Ok(format!("negotiation-{}", state.calls.negotiations.len()))
    }

    async fn fetch_payload(
        &self,
        credential: &Credential,
        body: Option<&Value>,
    ) -> Result<PayloadResponse, ConnectorError> {
        let mut state = self.inner.lock().await;
        state.calls.fetches.push(FetchCall {
            endpoint: credential.endpoint.clone(),
            token: credential.token.clone(),
            body: body.cloned(),
        });

        let fixture = state.payloads.get(&credential.endpoint).cloned().ok_or_else(|| {
            ConnectorError::Upstream(format!(
                "{} returned status: 404 Not Found",
                credential.endpoint
            ))
        })?;

        let chunks: Vec<Result<Bytes, String>> = match fixture.fail_after {
            Some(n) => fixture
                .chunks
                .into_iter()
                .take(n)
                .map(Ok)
                .chain(std::iter::once(Err("connection reset by peer".to_string())))
                .collect(),
            None => fixture.chunks.into_iter().map(Ok).collect(),
        };

        Ok(PayloadResponse {
            content_disposition: fixture.content_disposition,
            content_type: fixture.content_type,
            body: stream::iter(chunks).boxed(),
        })
    }
}
