// src/connectors/edc.rs
//
// Dataspace connector speaking the EDC management API (v3) and the
// federated catalog endpoint over HTTPS.

use crate::error::ConnectorError;
use crate::models::{Credential, FederatedCatalog, PayloadResponse};
use crate::traits::{DataspaceApi, SharedDataspaceApi, SharedTokenProvider};
use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, info};
use reqwest::header::{HeaderName, AUTHORIZATION, CONTENT_DISPOSITION, CONTENT_TYPE};
use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

const NEGOTIATION_PROTOCOL: &str = "dataspace-protocol-http";
const ODRL_NAMESPACE: &str = "http://www.w3.org/ns/odrl/2/";

/// Default request timeout when none is configured.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// One row of an EDR query result.
#[derive(Debug, Deserialize)]
struct EdrEntry {
    #[serde(rename = "transferProcessId")]
    transfer_process_id: String,
}

/// Data address behind an EDR.
#[derive(Debug, Deserialize)]
struct EdrDataAddress {
    endpoint: String,
    authorization: String,
}

/// Connector for one named connector instance in a hosted dataspace.
///
/// Clone-cheap; the inner `reqwest::Client` pools connections.
#[derive(Clone)]
pub struct EdcConnector {
    base_url: String,
    connector_name: String,
    http_client: reqwest::Client,
    /// Bound on a whole catalog or management call, body included.
    request_timeout: Duration,
    tokens: SharedTokenProvider,
}

impl EdcConnector {
    /// Creates a connector. Catalog and management calls must finish within
    /// `timeout`. Data pulls only have to connect and keep delivering bytes
    /// within it, so large payloads can stream for as long as they need.
    /// A timeout is reported like any other upstream failure.
    pub fn new(
        base_url: &str,
        connector_name: &str,
        timeout: Duration,
        tokens: SharedTokenProvider,
    ) -> Result<Self, ConnectorError> {
        Url::parse(base_url)
            .map_err(|e| ConnectorError::Config(format!("Invalid dataspace URL {}: {}", base_url, e)))?;
        if connector_name.trim().is_empty() {
            return Err(ConnectorError::Config("connector name is empty".to_string()));
        }

        let http_client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .build()
            .map_err(|e| ConnectorError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            connector_name: connector_name.to_string(),
            http_client,
            request_timeout: timeout,
            tokens,
        })
    }

    /// Wraps this connector in an Arc for use as SharedDataspaceApi.
    pub fn shared(self) -> SharedDataspaceApi {
        Arc::new(self)
    }

    fn catalog_url(&self) -> String {
        format!("{}/federated/catalog", self.base_url)
    }

    fn management_url(&self, path: &str) -> String {
        format!(
            "{}/connectors/{}/cp/management/v3/{}",
            self.base_url, self.connector_name, path
        )
    }

    async fn authorized(&self, request: RequestBuilder) -> Result<RequestBuilder, ConnectorError> {
        Ok(match self.tokens.authorization().await? {
            Some(header) => request.header(AUTHORIZATION, header),
            None => request,
        })
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder, what: &str) -> Result<T, ConnectorError> {
        let response = ensure_success(request.timeout(self.request_timeout).send().await?, what)?;
        response
            .json()
            .await
            .map_err(|e| ConnectorError::Upstream(format!("Failed to parse {} response: {}", what, e)))
    }
}

#[async_trait]
impl DataspaceApi for EdcConnector {
    async fn federated_catalog(&self) -> Result<FederatedCatalog, ConnectorError> {
        let request = self.http_client.get(self.catalog_url());
        self.send_json(request, "federated catalog").await
    }

    async fn credential(&self, asset_id: &str) -> Result<Option<Credential>, ConnectorError> {
        let request = self
            .http_client
            .post(self.management_url("edrs/request"))
            .json(&edr_query(asset_id));
        let entries: Vec<EdrEntry> = self
            .send_json(self.authorized(request).await?, "EDR query")
            .await?;

        let Some(entry) = entries.into_iter().next() else {
            debug!("EdcConnector: No EDR for asset {}", asset_id);
            return Ok(None);
        };
        info!("EdcConnector: Transfer process {} for asset {}", entry.transfer_process_id, asset_id);

        let request = self.http_client.get(
            self.management_url(&format!("edrs/{}/dataaddress", entry.transfer_process_id)),
        );
        let address: EdrDataAddress = self
            .send_json(self.authorized(request).await?, "EDR data address")
            .await?;

        Ok(Some(Credential {
            asset_id: asset_id.to_string(),
            endpoint: address.endpoint,
            token: address.authorization,
        }))
    }

    async fn create_negotiation(
        &self,
        connector_url: &str,
        policy: &Value,
        provider_id: &str,
        asset_id: &str,
    ) -> Result<String, ConnectorError> {
        let payload = negotiation_payload(connector_url, policy, provider_id, asset_id)?;
        let request = self.http_client.post(self.management_url("edrs")).json(&payload);
        let response: Value = self
            .send_json(self.authorized(request).await?, "negotiation")
            .await?;

        response
            .get("@id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ConnectorError::Upstream("negotiation response carries no @id".to_string()))
    }

    async fn fetch_payload(
        &self,
        credential: &Credential,
        body: Option<&Value>,
    ) -> Result<PayloadResponse, ConnectorError> {
        let request = match body {
            Some(body) => self.http_client.post(&credential.endpoint).json(body),
            None => self.http_client.get(&credential.endpoint),
        };
        let response = request
            .header(AUTHORIZATION, credential.token.as_str())
            .send()
            .await?;
        let response = ensure_success(response, "data pull")?;

        let header = |name: HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let content_disposition = header(CONTENT_DISPOSITION);
        let content_type = header(CONTENT_TYPE);

        Ok(PayloadResponse {
            content_disposition,
            content_type,
            body: response
                .bytes_stream()
                .map(|chunk| chunk.map_err(|e| format!("Failed to read response body: {}", e)))
                .boxed(),
        })
    }
}

fn ensure_success(response: Response, what: &str) -> Result<Response, ConnectorError> {
    if !response.status().is_success() {
        return Err(ConnectorError::Upstream(format!(
            "{} API returned status: {}",
            what,
            response.status()
        )));
    }
    Ok(response)
}

/// QuerySpec selecting the EDRs of one asset.
fn edr_query(asset_id: &str) -> Value {
    json!({
        "@context": {},
        "@type": "QuerySpec",
        "filterExpression": [
            {
                "operandLeft": "assetId",
                "operator": "=",
                "operandRight": asset_id
            }
        ]
    })
}

/// EDR negotiation request: the offer's policy pinned to provider and asset.
fn negotiation_payload(
    connector_url: &str,
    policy: &Value,
    provider_id: &str,
    asset_id: &str,
) -> Result<Value, ConnectorError> {
    let Value::Object(policy) = policy else {
        return Err(ConnectorError::InvalidKit("policy must be a JSON object".to_string()));
    };
    let mut policy = policy.clone();
    policy.insert("odrl:assigner".to_string(), json!({ "@id": provider_id }));
    policy.insert("odrl:target".to_string(), json!({ "@id": asset_id }));

    Ok(json!({
        "@context": { "odrl": ODRL_NAMESPACE },
        "counterPartyAddress": connector_url,
        "protocol": NEGOTIATION_PROTOCOL,
        "policy": policy
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::token::{NoAuth, StaticToken};
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn connector(base: &str) -> EdcConnector {
        EdcConnector::new(
            base,
            "edge",
            Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            NoAuth.shared(),
        )
        .unwrap()
    }

    #[test]
    fn test_urls() {
        let c = connector("https://ds.example.org/");
        assert_eq!(c.catalog_url(), "https://ds.example.org/federated/catalog");
        assert_eq!(
            c.management_url("edrs/request"),
            "https://ds.example.org/connectors/edge/cp/management/v3/edrs/request"
        );
    }

    #[test]
    fn test_invalid_configuration_is_rejected() {
        let invalid_url = EdcConnector::new("not a url", "edge", Duration::from_secs(1), NoAuth.shared());
        assert!(matches!(invalid_url, Err(ConnectorError::Config(_))));

        let no_name = EdcConnector::new("https://ds.example.org", " ", Duration::from_secs(1), NoAuth.shared());
        assert!(matches!(no_name, Err(ConnectorError::Config(_))));
    }

    #[test]
    fn test_edr_query_filters_by_asset() {
        let query = edr_query("demo");
        assert_eq!(query["@type"], "QuerySpec");
        assert_eq!(query["filterExpression"][0]["operandLeft"], "assetId");
        assert_eq!(query["filterExpression"][0]["operandRight"], "demo");
    }

    #[test]
    fn test_negotiation_payload_pins_assigner_and_target() {
        let policy = json!({ "@id": "offer-1", "@type": "odrl:Offer", "odrl:permission": [] });
        let payload = negotiation_payload("https://p1/api/v1/dsp", &policy, "P1", "demo").unwrap();

        assert_eq!(payload["counterPartyAddress"], "https://p1/api/v1/dsp");
        assert_eq!(payload["protocol"], NEGOTIATION_PROTOCOL);
        assert_eq!(payload["policy"]["@id"], "offer-1");
        assert_eq!(payload["policy"]["odrl:assigner"]["@id"], "P1");
        assert_eq!(payload["policy"]["odrl:target"]["@id"], "demo");
    }

    #[test]
    fn test_negotiation_payload_requires_object_policy() {
        let result = negotiation_payload("https://p1", &json!("offer-1"), "P1", "demo");
        assert!(matches!(result, Err(ConnectorError::InvalidKit(_))));
    }

    // ========================================================================
    // Local HTTP stub
    // ========================================================================

    #[derive(Debug, Clone)]
    struct Received {
        method: String,
        path: String,
        headers: Vec<(String, String)>,
        body: String,
    }

    impl Received {
        fn header(&self, name: &str) -> Option<&str> {
            self.headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        }
    }

    struct Reply {
        status: u16,
        headers: Vec<(String, String)>,
        chunks: Vec<String>,
        gap: Duration,
    }

    impl Reply {
        fn json(status: u16, body: Value) -> Self {
            Self {
                status,
                headers: vec![("content-type".to_string(), "application/json".to_string())],
                chunks: vec![body.to_string()],
                gap: Duration::ZERO,
            }
        }

        fn bytes(status: u16, body: &str) -> Self {
            Self {
                status,
                headers: Vec::new(),
                chunks: vec![body.to_string()],
                gap: Duration::ZERO,
            }
        }

        /// Body written in pieces with a pause before each one after the first.
        fn trickled(chunks: &[&str], gap: Duration) -> Self {
            Self {
                status: 200,
                headers: Vec::new(),
                chunks: chunks.iter().map(|c| c.to_string()).collect(),
                gap,
            }
        }

        fn with_header(mut self, name: &str, value: &str) -> Self {
            self.headers.push((name.to_string(), value.to_string()));
            self
        }
    }

    type Log = Arc<Mutex<Vec<Received>>>;

    /// Serves one request per connection on a loopback port until the test ends.
    async fn serve<F>(route: F) -> (String, Log)
    where
        F: Fn(&Received) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let route = Arc::new(route);

        let seen = Arc::clone(&log);
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let route = Arc::clone(&route);
                let seen = Arc::clone(&seen);
                tokio::spawn(async move {
                    if let Some(request) = read_request(&mut socket).await {
                        let reply = route(&request);
                        seen.lock().unwrap().push(request);
                        write_reply(&mut socket, reply).await;
                    }
                });
            }
        });
        (base, log)
    }

    async fn read_request(socket: &mut TcpStream) -> Option<Received> {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        let head_len = loop {
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
            let n = socket.read(&mut chunk).await.ok()?;
            if n == 0 {
                return None;
            }
            buf.extend_from_slice(&chunk[..n]);
        };

        let head = String::from_utf8_lossy(&buf[..head_len]).to_string();
        let mut lines = head.split("\r\n");
        let mut start = lines.next()?.split_whitespace();
        let method = start.next()?.to_string();
        let path = start.next()?.to_string();
        let headers: Vec<(String, String)> = lines
            .filter_map(|line| line.split_once(':'))
            .map(|(k, v)| (k.trim().to_lowercase(), v.trim().to_string()))
            .collect();
        let length = headers
            .iter()
            .find(|(k, _)| k == "content-length")
            .and_then(|(_, v)| v.parse::<usize>().ok())
            .unwrap_or(0);

        while buf.len() < head_len + length {
            let n = socket.read(&mut chunk).await.ok()?;
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        let body = String::from_utf8_lossy(&buf[head_len..]).to_string();

        Some(Received { method, path, headers, body })
    }

    async fn write_reply(socket: &mut TcpStream, reply: Reply) {
        let length: usize = reply.chunks.iter().map(String::len).sum();
        let mut head = format!(
            "HTTP/1.1 {} Stub\r\ncontent-length: {}\r\nconnection: close\r\n",
            reply.status, length
        );
        for (name, value) in &reply.headers {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        head.push_str("\r\n");
        if socket.write_all(head.as_bytes()).await.is_err() {
            return;
        }

        for (i, chunk) in reply.chunks.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(reply.gap).await;
            }
            if socket.write_all(chunk.as_bytes()).await.is_err() {
                return;
            }
            let _ = socket.flush().await;
        }
        let _ = socket.shutdown().await;
    }

    fn authorized_connector(base: &str, timeout: Duration) -> EdcConnector {
        EdcConnector::new(base, "edge", timeout, StaticToken::bearer("abc").shared()).unwrap()
    }

    async fn collect_body(response: PayloadResponse) -> Result<String, String> {
        let chunks: Vec<Result<bytes::Bytes, String>> = response.body.collect().await;
        let mut body = Vec::new();
        for chunk in chunks {
            body.extend_from_slice(&chunk?);
        }
        Ok(String::from_utf8_lossy(&body).to_string())
    }

    // ========================================================================
    // HTTP behaviour
    // ========================================================================

    #[tokio::test]
    async fn test_federated_catalog_is_fetched_without_token() {
        let (base, log) = serve(|_| {
            Reply::json(200, json!([{ "dspace:participantId": "P1", "dcat:dataset": { "kit_name": "demo" } }]))
        })
        .await;
        let catalog = connector(&base).federated_catalog().await.unwrap();

        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog[0].datasets[0].kit_name, "demo");
        let log = log.lock().unwrap();
        assert_eq!(log[0].method, "GET");
        assert_eq!(log[0].path, "/federated/catalog");
        assert!(log[0].header("authorization").is_none());
    }

    #[tokio::test]
    async fn test_empty_edr_query_means_no_credential() {
        let (base, log) = serve(|_| Reply::json(200, json!([]))).await;
        let credential = authorized_connector(&base, Duration::from_secs(5))
            .credential("demo")
            .await
            .unwrap();

        assert!(credential.is_none());
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].method, "POST");
        assert_eq!(log[0].path, "/connectors/edge/cp/management/v3/edrs/request");
        assert_eq!(log[0].header("authorization"), Some("Bearer abc"));
        let query: Value = serde_json::from_str(&log[0].body).unwrap();
        assert_eq!(query["filterExpression"][0]["operandRight"], "demo");
    }

    #[tokio::test]
    async fn test_edr_lookup_follows_transfer_process() {
        let (base, log) = serve(|request| {
            if request.path.ends_with("/edrs/request") {
                Reply::json(200, json!([{ "transferProcessId": "tp-1" }, { "transferProcessId": "tp-2" }]))
            } else {
                Reply::json(200, json!({ "endpoint": "https://p1/public", "authorization": "edr-token" }))
            }
        })
        .await;
        let credential = authorized_connector(&base, Duration::from_secs(5))
            .credential("demo")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(credential.asset_id, "demo");
        assert_eq!(credential.endpoint, "https://p1/public");
        assert_eq!(credential.token, "edr-token");
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].method, "GET");
        assert_eq!(log[1].path, "/connectors/edge/cp/management/v3/edrs/tp-1/dataaddress");
        assert_eq!(log[1].header("authorization"), Some("Bearer abc"));
    }

    #[tokio::test]
    async fn test_error_status_is_upstream_error() {
        let (base, _) = serve(|_| Reply::bytes(500, "boom")).await;
        let c = authorized_connector(&base, Duration::from_secs(5));

        match c.federated_catalog().await {
            Err(ConnectorError::Upstream(message)) => assert!(message.contains("500"), "{}", message),
            other => panic!("expected upstream error, got {:?}", other.map(|c| c.len())),
        }
        assert!(matches!(c.credential("demo").await, Err(ConnectorError::Upstream(_))));

        let credential = Credential {
            asset_id: "demo".to_string(),
            endpoint: format!("{}/public", base),
            token: "edr-token".to_string(),
        };
        assert!(matches!(c.fetch_payload(&credential, None).await, Err(ConnectorError::Upstream(_))));
    }

    #[tokio::test]
    async fn test_negotiation_needs_an_id() {
        let policy = json!({ "@id": "offer-1", "odrl:permission": [] });

        let (base, _) = serve(|_| Reply::json(200, json!({ "@type": "IdResponse" }))).await;
        let missing = authorized_connector(&base, Duration::from_secs(5))
            .create_negotiation("https://p1/api/v1/dsp", &policy, "P1", "demo")
            .await;
        assert!(matches!(missing, Err(ConnectorError::Upstream(_))));

        let (base, log) = serve(|_| Reply::json(200, json!({ "@id": "neg-1" }))).await;
        let id = authorized_connector(&base, Duration::from_secs(5))
            .create_negotiation("https://p1/api/v1/dsp", &policy, "P1", "demo")
            .await
            .unwrap();
        assert_eq!(id, "neg-1");
        let log = log.lock().unwrap();
        assert_eq!(log[0].path, "/connectors/edge/cp/management/v3/edrs");
        let sent: Value = serde_json::from_str(&log[0].body).unwrap();
        assert_eq!(sent["policy"]["odrl:target"]["@id"], "demo");
    }

    #[tokio::test]
    async fn test_fetch_uses_get_or_post_with_raw_token() {
        let (base, log) = serve(|_| {
            Reply::bytes(200, "payload")
                .with_header("content-disposition", "attachment; filename=\"report.csv\"")
                .with_header("content-type", "text/csv")
        })
        .await;
        let c = authorized_connector(&base, Duration::from_secs(5));
        let credential = Credential {
            asset_id: "demo".to_string(),
            endpoint: format!("{}/public/demo", base),
            token: "edr-token".to_string(),
        };

        let response = c.fetch_payload(&credential, None).await.unwrap();
        assert_eq!(response.content_disposition.as_deref(), Some("attachment; filename=\"report.csv\""));
        assert_eq!(response.content_type.as_deref(), Some("text/csv"));
        assert_eq!(collect_body(response).await.unwrap(), "payload");

        let body = json!({ "window": "7d" });
        let response = c.fetch_payload(&credential, Some(&body)).await.unwrap();
        assert_eq!(collect_body(response).await.unwrap(), "payload");

        let log = log.lock().unwrap();
        assert_eq!(log[0].method, "GET");
        assert_eq!(log[0].path, "/public/demo");
        assert_eq!(log[0].header("authorization"), Some("edr-token"));
        assert!(log[0].body.is_empty());
        assert_eq!(log[1].method, "POST");
        assert_eq!(log[1].header("authorization"), Some("edr-token"));
        assert_eq!(log[1].header("content-type"), Some("application/json"));
        assert_eq!(serde_json::from_str::<Value>(&log[1].body).unwrap(), body);
    }

    #[tokio::test]
    async fn test_slow_payload_outlives_request_timeout() {
        // 5 chunks, 400ms apart: 1.6s in total, never idle for a full second.
        let (base, _) = serve(|_| {
            Reply::trickled(&["chunk-1;", "chunk-2;", "chunk-3;", "chunk-4;", "chunk-5;"], Duration::from_millis(400))
        })
        .await;
        let c = authorized_connector(&base, Duration::from_secs(1));
        let credential = Credential {
            asset_id: "demo".to_string(),
            endpoint: format!("{}/public/demo", base),
            token: "edr-token".to_string(),
        };

        let response = c.fetch_payload(&credential, None).await.unwrap();
        assert_eq!(
            collect_body(response).await.unwrap(),
            "chunk-1;chunk-2;chunk-3;chunk-4;chunk-5;"
        );
    }

    #[tokio::test]
    async fn test_management_call_is_bounded_by_timeout() {
        // Never idle for a full second, but slower than one second overall.
        let (base, _) = serve(|_| Reply::trickled(&["[", " ", " ", "]"], Duration::from_millis(500))).await;
        let result = authorized_connector(&base, Duration::from_secs(1))
            .credential("demo")
            .await;

        assert!(matches!(result, Err(ConnectorError::Upstream(_))));
    }
}
