// src/catalog/mod.rs
//
// Federated catalog discovery: query-based search and offer resolution.
// Every call works on a fresh snapshot from the dataspace; nothing is cached,
// so results may be as stale as the catalog service itself.

pub mod resolver;
pub mod search;

use crate::error::ConnectorError;
use crate::models::{FederatedCatalog, ResolvedOffer};
use crate::query::compile;
use crate::traits::{OfferLookup, SharedDataspaceApi};
use log::info;

// Re-export for convenience
pub use resolver::{resolve, LinearLookup};
pub use search::{predicate_record, search, search_with, PARTICIPANT_KEY};

/// Catalog access on top of a dataspace connector.
#[derive(Clone)]
pub struct CatalogService {
    api: SharedDataspaceApi,
}

impl CatalogService {
    pub fn new(api: SharedDataspaceApi) -> Self {
        Self { api }
    }

    /// Fetches the current federated catalog.
    pub async fn snapshot(&self) -> Result<FederatedCatalog, ConnectorError> {
        let catalog = self.api.federated_catalog().await?;
        info!(
            "CatalogService: Snapshot with {} participants, {} offers",
            catalog.len(),
            catalog.iter().map(|e| e.datasets.len()).sum::<usize>()
        );
        Ok(catalog)
    }

    /// Searches a fresh snapshot. An ill-formed query returns an empty catalog
    /// without contacting the dataspace.
    pub async fn search(&self, query: &str) -> Result<FederatedCatalog, ConnectorError> {
        match self.search_strict(query).await {
            Err(ConnectorError::InvalidQuery(_)) => Ok(Vec::new()),
            other => other,
        }
    }

    /// Like `search`, but reports an ill-formed query as `InvalidQuery`.
    pub async fn search_strict(&self, query: &str) -> Result<FederatedCatalog, ConnectorError> {
        let clauses = compile(query)?;
        let catalog = self.snapshot().await?;
        Ok(search_with(&catalog, &clauses))
    }

    /// Resolves one offer on a fresh snapshot. `Ok(None)` when it does not exist.
    pub async fn resolve(
        &self,
        provider_id: &str,
        kit_name: &str,
    ) -> Result<Option<ResolvedOffer>, ConnectorError> {
        let catalog = self.snapshot().await?;
        Ok(LinearLookup::new(&catalog).find_offer(provider_id, kit_name))
    }
}
