// src/engine/mod.rs
//
// Negotiation/transfer orchestration.
//
// One transfer is a sequential chain:
// CredentialLookup -> (Negotiate -> Settle -> CredentialLookup)? -> Fetch -> Materialize
// Only the negotiate-then-recheck part is retried, and only as often as the
// SettlePolicy allows. Everything else fails straight to the caller.

pub mod kit;
pub mod locks;

use crate::error::ConnectorError;
use crate::models::{Credential, Offer, TransferReceipt, TransferRequest};
use crate::traits::SharedDataspaceApi;
use crate::workspace::Workspace;
use bytes::BytesMut;
use futures::StreamExt;
use log::{debug, info, warn};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

// Re-export for convenience
pub use kit::KitDownloader;
pub use locks::KeyLocks;

/// Baseline wait between starting a negotiation and looking for its credential.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(5);

// =============================================================================
// Settle Policy
// =============================================================================

/// How long to wait for a negotiated credential to show up.
///
/// The default is one recheck after 5 seconds. More attempts with a factor
/// above 1.0 give a bounded exponential backoff instead.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SettlePolicy {
    pub delay: Duration,
    pub attempts: u32,
    pub backoff_factor: f64,
}

impl Default for SettlePolicy {
    fn default() -> Self {
        Self {
            delay: DEFAULT_SETTLE_DELAY,
            attempts: 1,
            backoff_factor: 1.0,
        }
    }
}

impl SettlePolicy {
    pub fn new(delay: Duration, attempts: u32, backoff_factor: f64) -> Self {
        Self {
            delay,
            attempts,
            backoff_factor,
        }
    }

    /// Wait before recheck number `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = if self.backoff_factor.is_finite() && self.backoff_factor >= 1.0 {
            self.backoff_factor
        } else {
            1.0
        };
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        self.delay.mul_f64(factor.powi(exponent).min(1e6))
    }

    /// Total time spent settling if the credential never appears.
    pub fn total_wait(&self) -> Duration {
        (0..self.attempts.max(1)).map(|a| self.delay_for(a)).sum()
    }
}

// =============================================================================
// Stages
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStage {
    CredentialLookup,
    Negotiate,
    Settle,
    Fetch,
    Materialize,
}

impl fmt::Display for TransferStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferStage::CredentialLookup => "CredentialLookup",
            TransferStage::Negotiate => "Negotiate",
            TransferStage::Settle => "Settle",
            TransferStage::Fetch => "Fetch",
            TransferStage::Materialize => "Materialize",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Transfer Engine
// =============================================================================

/// Runs transfers against one dataspace connector into one workspace.
///
/// Share it behind an `Arc`; concurrent transfers to different folders run
/// independently, transfers to the same folder queue up behind each other.
pub struct TransferEngine {
    api: SharedDataspaceApi,
    workspace: Workspace,
    settle: SettlePolicy,
    locks: KeyLocks,
}

impl TransferEngine {
    pub fn new(api: SharedDataspaceApi, workspace: Workspace) -> Self {
        Self {
            api,
            workspace,
            settle: SettlePolicy::default(),
            locks: KeyLocks::new(),
        }
    }

    pub fn with_settle_policy(mut self, settle: SettlePolicy) -> Self {
        self.settle = settle;
        self
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn settle_policy(&self) -> &SettlePolicy {
        &self.settle
    }

    /// Pulls the asset behind `request` into the workspace entry
    /// `{provider_id}-{kit_name}`, with `offer` as its `metadata.json`.
    ///
    /// A complete entry is left alone unless `request.overwrite` is set; an
    /// incomplete one is rebuilt.
    pub async fn transfer(
        &self,
        request: &TransferRequest,
        offer: &Offer,
    ) -> Result<TransferReceipt, ConnectorError> {
        let key = Workspace::folder_key(&request.provider_id, &request.kit_name);
        let _guard = self.locks.acquire(&key).await;

        if !request.overwrite {
            if let Some(entry) = self.workspace.existing_entry(&key).await {
                info!(
                    "TransferEngine: {} already present at {}, keeping it",
                    key,
                    entry.folder.display()
                );
                return Ok(TransferReceipt {
                    folder: entry.folder,
                    payload: entry.payload,
                    bytes_written: 0,
                    negotiated: false,
                    reused: true,
                });
            }
        }

        let (credential, negotiated) = self.acquire_credential(request).await?;

        info!("TransferEngine: [{}] {} from {}", TransferStage::Fetch, request.asset_id, credential.endpoint);
        let response = self
            .api
            .fetch_payload(&credential, request.body.as_ref())
            .await?;

        let file_name = self.workspace.payload_file_name(
            offer,
            &request.kit_name,
            response.content_disposition.as_deref(),
        );
        info!("TransferEngine: [{}] {}/{}", TransferStage::Materialize, key, file_name);
        let entry = self
            .workspace
            .materialize(&key, &file_name, offer, response.body)
            .await?;

        Ok(TransferReceipt {
            folder: entry.folder,
            payload: entry.payload,
            bytes_written: entry.bytes,
            negotiated,
            reused: false,
        })
    }

    /// Pulls the asset and returns its body instead of writing it to disk.
    /// JSON bodies are parsed; anything else comes back as a string value.
    pub async fn read_content(&self, request: &TransferRequest) -> Result<Value, ConnectorError> {
        let (credential, _) = self.acquire_credential(request).await?;

        info!("TransferEngine: [{}] {} from {}", TransferStage::Fetch, request.asset_id, credential.endpoint);
        let mut response = self
            .api
            .fetch_payload(&credential, request.body.as_ref())
            .await?;

        let mut buffer = BytesMut::new();
        while let Some(chunk) = response.body.next().await {
            buffer.extend_from_slice(&chunk.map_err(ConnectorError::Upstream)?);
        }

        Ok(decode_body(&buffer))
    }

    /// Returns a credential for the request's asset, negotiating one if none
    /// exists yet. The flag tells whether a negotiation was started.
    pub async fn acquire_credential(
        &self,
        request: &TransferRequest,
    ) -> Result<(Credential, bool), ConnectorError> {
        info!("TransferEngine: [{}] {}", TransferStage::CredentialLookup, request.asset_id);
        if let Some(credential) = self.api.credential(&request.asset_id).await? {
            debug!("TransferEngine: Reusing existing credential for {}", request.asset_id);
            return Ok((credential, false));
        }

        info!(
            "TransferEngine: [{}] {} with {} at {}",
            TransferStage::Negotiate,
            request.asset_id,
            request.provider_id,
            request.connector_url
        );
        let negotiation_id = self
            .api
            .create_negotiation(
                &request.connector_url,
                &request.policy,
                &request.provider_id,
                &request.asset_id,
            )
            .await?;
        debug!("TransferEngine: Negotiation {} started", negotiation_id);

        let attempts = self.settle.attempts.max(1);
        for attempt in 0..attempts {
            let wait = self.settle.delay_for(attempt);
            info!(
                "TransferEngine: [{}] waiting {:?} for {} ({}/{})",
                TransferStage::Settle,
                wait,
                request.asset_id,
                attempt + 1,
                attempts
            );
            tokio::time::sleep(wait).await;

            info!("TransferEngine: [{}] {} (recheck)", TransferStage::CredentialLookup, request.asset_id);
            if let Some(credential) = self.api.credential(&request.asset_id).await? {
                return Ok((credential, true));
            }
        }

        warn!(
            "TransferEngine: No credential for {} after negotiation {}",
            request.asset_id, negotiation_id
        );
        Err(ConnectorError::NotFound(format!(
            "no credential for asset {} after negotiation",
            request.asset_id
        )))
    }
}

fn decode_body(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::{MemoryDataspace, PayloadFixture};
    use serde_json::json;
    use tempfile::TempDir;

    const ENDPOINT: &str = "https://p1.example/public/demo";

    fn credential() -> Credential {
        Credential {
            asset_id: "demo".to_string(),
            endpoint: ENDPOINT.to_string(),
            token: "secret".to_string(),
        }
    }

    fn request() -> TransferRequest {
        TransferRequest {
            provider_id: "P1".to_string(),
            connector_url: "https://p1.example/api/v1/dsp".to_string(),
            kit_name: "demo".to_string(),
            asset_id: "demo".to_string(),
            policy: json!({ "@id": "offer-1" }),
            body: None,
            overwrite: false,
        }
    }

    fn engine(dataspace: &MemoryDataspace, dir: &TempDir) -> TransferEngine {
        TransferEngine::new(dataspace.shared(), Workspace::new(dir.path()))
    }

    #[test]
    fn test_default_settle_policy_is_single_five_second_wait() {
        let policy = SettlePolicy::default();
        assert_eq!(policy.attempts, 1);
        assert_eq!(policy.delay_for(0), Duration::from_secs(5));
        assert_eq!(policy.total_wait(), Duration::from_secs(5));
    }

    #[test]
    fn test_backoff_grows_geometrically() {
        let policy = SettlePolicy::new(Duration::from_secs(2), 3, 2.0);
        assert_eq!(policy.delay_for(0), Duration::from_secs(2));
        assert_eq!(policy.delay_for(1), Duration::from_secs(4));
        assert_eq!(policy.delay_for(2), Duration::from_secs(8));
        assert_eq!(policy.total_wait(), Duration::from_secs(14));
    }

    #[test]
    fn test_shrinking_factor_is_treated_as_constant() {
        let policy = SettlePolicy::new(Duration::from_secs(2), 2, 0.5);
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
    }

    #[test]
    fn test_decode_body() {
        assert_eq!(decode_body(br#"{"a":1}"#), json!({ "a": 1 }));
        assert_eq!(decode_body(b"plain text"), json!("plain text"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_existing_credential_skips_negotiation() {
        let dir = TempDir::new().unwrap();
        let dataspace = MemoryDataspace::default();
        dataspace.insert_credential(credential()).await;

        let start = tokio::time::Instant::now();
        let (found, negotiated) = engine(&dataspace, &dir)
            .acquire_credential(&request())
            .await
            .unwrap();

        assert_eq!(found, credential());
        assert!(!negotiated);
        assert!(start.elapsed() < DEFAULT_SETTLE_DELAY);
        assert!(dataspace.calls().await.negotiations.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_negotiates_then_waits_before_recheck() {
        let dir = TempDir::new().unwrap();
        let dataspace = MemoryDataspace::default();
        dataspace.grant_on_negotiation(credential(), 0).await;

        let start = tokio::time::Instant::now();
        let (_, negotiated) = engine(&dataspace, &dir)
            .acquire_credential(&request())
            .await
            .unwrap();

        assert!(negotiated);
        assert!(start.elapsed() >= DEFAULT_SETTLE_DELAY);
        let calls = dataspace.calls().await;
        assert_eq!(calls.negotiations.len(), 1);
        assert_eq!(calls.negotiations[0].policy, json!({ "@id": "offer-1" }));
        assert_eq!(calls.credential_lookups.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_recheck_fails_when_credential_lags() {
        let dir = TempDir::new().unwrap();
        let dataspace = MemoryDataspace::default();
        dataspace.grant_on_negotiation(credential(), 1).await;

        let result = engine(&dataspace, &dir).acquire_credential(&request()).await;

        assert!(matches!(result, Err(ConnectorError::NotFound(_))));
        assert_eq!(dataspace.calls().await.credential_lookups.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_policy_rechecks_until_credential_appears() {
        let dir = TempDir::new().unwrap();
        let dataspace = MemoryDataspace::default();
        dataspace.grant_on_negotiation(credential(), 1).await;

        let engine = engine(&dataspace, &dir)
            .with_settle_policy(SettlePolicy::new(Duration::from_secs(1), 3, 2.0));
        let start = tokio::time::Instant::now();
        let (_, negotiated) = engine.acquire_credential(&request()).await.unwrap();

        assert!(negotiated);
        // 1s + 2s before the second recheck succeeds.
        assert!(start.elapsed() >= Duration::from_secs(3));
        assert_eq!(dataspace.calls().await.negotiations.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_content_returns_json() {
        let dir = TempDir::new().unwrap();
        let dataspace = MemoryDataspace::default();
        dataspace.insert_credential(credential()).await;
        dataspace
            .insert_payload(ENDPOINT, PayloadFixture::new([r#"{"temp":"#, r#" 21.5}"#]))
            .await;

        let body = engine(&dataspace, &dir)
            .read_content(&request().with_body(Some(json!({ "from": 1 }))))
            .await
            .unwrap();

        assert_eq!(body, json!({ "temp": 21.5 }));
        let calls = dataspace.calls().await;
        assert_eq!(calls.fetches[0].body, Some(json!({ "from": 1 })));
        // Nothing is written for reads.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_existing_entry_is_kept_without_network() {
        let dir = TempDir::new().unwrap();
        let dataspace = MemoryDataspace::default();
        dataspace.insert_credential(credential()).await;
        dataspace.insert_payload(ENDPOINT, PayloadFixture::new(["v1"])).await;
        let engine = engine(&dataspace, &dir);
        let offer = Offer::new("demo");

        let first = engine.transfer(&request(), &offer).await.unwrap();
        assert!(!first.reused);

        let second = engine.transfer(&request(), &offer).await.unwrap();
        assert!(second.reused);
        assert_eq!(second.payload, first.payload);
        assert_eq!(dataspace.calls().await.fetches.len(), 1);
    }
}
