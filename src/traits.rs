// src/traits.rs

use crate::error::ConnectorError;
use crate::models::{Credential, FederatedCatalog, PayloadResponse, ResolvedOffer};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// The dataspace management API as seen from the connector core.
/// Implementations should be Send + Sync so one instance can serve every transfer.
#[async_trait]
pub trait DataspaceApi: Send + Sync {
    /// Fetches a fresh federated catalog snapshot. No auth required.
    async fn federated_catalog(&self) -> Result<FederatedCatalog, ConnectorError>;

    /// Looks up an existing EDR for the asset. `Ok(None)` means none exists yet.
    async fn credential(&self, asset_id: &str) -> Result<Option<Credential>, ConnectorError>;

    /// Starts a negotiation with the counterparty and returns its id.
    async fn create_negotiation(
        &self,
        connector_url: &str,
        policy: &Value,
        provider_id: &str,
        asset_id: &str,
    ) -> Result<String, ConnectorError>;

    /// Pulls the payload behind a credential. GET without a body, POST with one.
    async fn fetch_payload(
        &self,
        credential: &Credential,
        body: Option<&Value>,
    ) -> Result<PayloadResponse, ConnectorError>;
}

/// Shared handle so the catalog service and the transfer engine can use one connector.
pub type SharedDataspaceApi = Arc<dyn DataspaceApi>;

/// Supplies the `Authorization` header value for management API calls.
/// How the token is obtained is up to the implementation.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn authorization(&self) -> Result<Option<String>, ConnectorError>;
}

pub type SharedTokenProvider = Arc<dyn TokenProvider>;

/// Finds one offer by provider and kit name.
/// The linear catalog scan implements this; an indexed cache could too.
pub trait OfferLookup {
    fn find_offer(&self, provider_id: &str, kit_name: &str) -> Option<ResolvedOffer>;
}
