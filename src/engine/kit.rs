// src/engine/kit.rs
//
// Kit downloads on top of the transfer engine.
//
// A basic kit is one asset. A composite kit is its own main artifact plus the
// kits listed in `components`, each pulled into its own workspace entry.
// Everything is resolved and validated against one catalog snapshot before
// the first byte is transferred.

use super::TransferEngine;
use crate::catalog::{CatalogService, LinearLookup};
use crate::error::ConnectorError;
use crate::models::{ComponentRef, Offer, ResolvedOffer, TransferOutcome, TransferReceipt, TransferRequest};
use crate::traits::OfferLookup;
use log::{error, info, warn};
use serde_json::Value;
use std::sync::Arc;

const HTTP_ASSET_TYPE: &str = "http";

/// One planned transfer: the request plus the offer written as metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedTransfer {
    pub request: TransferRequest,
    pub metadata: Offer,
}

#[derive(Clone)]
pub struct KitDownloader {
    catalog: CatalogService,
    engine: Arc<TransferEngine>,
}

impl KitDownloader {
    pub fn new(catalog: CatalogService, engine: Arc<TransferEngine>) -> Self {
        Self { catalog, engine }
    }

    /// Downloads a kit and reports the result in user-facing terms.
    pub async fn download(
        &self,
        provider_id: &str,
        kit_name: &str,
        body: Option<Value>,
        overwrite: bool,
    ) -> TransferOutcome {
        let plan = match self.plan(provider_id, kit_name, body, overwrite).await {
            Ok(plan) => plan,
            Err(e) => {
                warn!("KitDownloader: {}-{} rejected: {}", provider_id, kit_name, e);
                return TransferOutcome::failed(rejection_message(e));
            }
        };

        match self.execute(&plan).await {
            Ok(receipts) => {
                info!(
                    "KitDownloader: {}-{} downloaded ({} transfers)",
                    provider_id,
                    kit_name,
                    receipts.len()
                );
                TransferOutcome::ok("KIT successfully downloaded")
            }
            Err(e) => {
                error!("KitDownloader: {}-{} failed: {}", provider_id, kit_name, e);
                TransferOutcome::failed(format!("Error caused, transfer failed: {}", e))
            }
        }
    }

    /// Like `download`, but returns the receipts or the underlying error.
    pub async fn download_kit(
        &self,
        provider_id: &str,
        kit_name: &str,
        body: Option<Value>,
        overwrite: bool,
    ) -> Result<Vec<TransferReceipt>, ConnectorError> {
        let plan = self.plan(provider_id, kit_name, body, overwrite).await?;
        self.execute(&plan).await
    }

    /// Pulls the kit's main artifact and returns its content without
    /// touching the workspace.
    pub async fn read(
        &self,
        provider_id: &str,
        kit_name: &str,
        body: Option<Value>,
    ) -> Result<Value, ConnectorError> {
        let resolved = self
            .catalog
            .resolve(provider_id, kit_name)
            .await?
            .ok_or_else(|| ConnectorError::NotFound("KIT cannot be found".to_string()))?;
        let planned = prepare(&resolved, body, false)?;
        self.engine.read_content(&planned.request).await
    }

    /// Resolves and validates every transfer a kit needs, main artifact first.
    pub async fn plan(
        &self,
        provider_id: &str,
        kit_name: &str,
        body: Option<Value>,
        overwrite: bool,
    ) -> Result<Vec<PlannedTransfer>, ConnectorError> {
        let catalog = self.catalog.snapshot().await?;
        let lookup = LinearLookup::new(&catalog);

        let main = lookup
            .find_offer(provider_id, kit_name)
            .ok_or_else(|| ConnectorError::NotFound("KIT cannot be found".to_string()))?;
        let kit_type = main
            .offer
            .kit_type
            .clone()
            .ok_or_else(|| ConnectorError::InvalidKit("kit_type information is missing".to_string()))?;

        let mut plan = vec![prepare(&main, body, overwrite)?];

        if kit_type.eq_ignore_ascii_case("basic") {
            return Ok(plan);
        }
        if !kit_type.eq_ignore_ascii_case("composite") {
            return Err(ConnectorError::Unsupported(format!("Unknown kit_type {}", kit_type)));
        }

        for component in components(&main.offer)? {
            let resolved = lookup
                .find_offer(&component.provider_id, &component.kit_name)
                .ok_or_else(|| {
                    ConnectorError::NotFound(format!(
                        "KIT component {}-{} cannot be found",
                        component.provider_id, component.kit_name
                    ))
                })?;
            plan.push(prepare(&resolved, None, overwrite)?);
        }

        Ok(plan)
    }

    /// Runs planned transfers in order; the first failure stops the kit.
    async fn execute(&self, plan: &[PlannedTransfer]) -> Result<Vec<TransferReceipt>, ConnectorError> {
        let mut receipts = Vec::with_capacity(plan.len());
        for planned in plan {
            receipts.push(self.engine.transfer(&planned.request, &planned.metadata).await?);
        }
        Ok(receipts)
    }
}

/// Checks one resolved offer is transferable and builds its request.
fn prepare(
    resolved: &ResolvedOffer,
    body: Option<Value>,
    overwrite: bool,
) -> Result<PlannedTransfer, ConnectorError> {
    let offer = &resolved.offer;

    let asset_type = offer
        .transfer_type()
        .ok_or_else(|| ConnectorError::InvalidKit("asset_type information is missing".to_string()))?;
    if !asset_type.eq_ignore_ascii_case(HTTP_ASSET_TYPE) {
        return Err(ConnectorError::Unsupported(format!("Unknown asset type {}", asset_type)));
    }

    let connector_url = connector_url(resolved)
        .ok_or_else(|| ConnectorError::InvalidKit("originator information is missing".to_string()))?;
    let request = TransferRequest::for_offer(resolved, connector_url)
        .ok_or_else(|| ConnectorError::InvalidKit("policy information is missing".to_string()))?
        .with_body(body)
        .with_overwrite(overwrite);

    // The policy travels in the request; metadata.json mirrors the rest.
    let mut metadata = offer.clone();
    metadata.policies.clear();

    Ok(PlannedTransfer { request, metadata })
}

/// The offer's own `originator` attribute wins over the catalog entry's.
fn connector_url(resolved: &ResolvedOffer) -> Option<String> {
    resolved
        .offer
        .extra
        .get("originator")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| resolved.originator.clone())
}

fn components(offer: &Offer) -> Result<Vec<ComponentRef>, ConnectorError> {
    let raw = offer
        .components
        .clone()
        .ok_or_else(|| ConnectorError::InvalidKit("'components' information is missing".to_string()))?;
    serde_json::from_value(raw)
        .map_err(|e| ConnectorError::InvalidKit(format!("'components' is malformed: {}", e)))
}

fn rejection_message(e: ConnectorError) -> String {
    match e {
        ConnectorError::NotFound(message) => message,
        other => other.to_string(),
    }
}
