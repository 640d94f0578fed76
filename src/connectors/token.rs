// src/connectors/token.rs
//
// Credential providers for the management API. Token acquisition itself is
// outside the connector; these just hand out what they were configured with.

use crate::error::ConnectorError;
use crate::traits::{SharedTokenProvider, TokenProvider};
use async_trait::async_trait;
use std::sync::Arc;

/// A fixed bearer token, e.g. from `DS_TOKEN`.
#[derive(Clone)]
pub struct StaticToken {
    header: String,
}

impl StaticToken {
    pub fn bearer(token: impl AsRef<str>) -> Self {
        Self {
            header: format!("Bearer {}", token.as_ref()),
        }
    }

    pub fn shared(self) -> SharedTokenProvider {
        Arc::new(self)
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn authorization(&self) -> Result<Option<String>, ConnectorError> {
        Ok(Some(self.header.clone()))
    }
}

/// Sends no `Authorization` header at all.
#[derive(Clone, Copy, Default)]
pub struct NoAuth;

impl NoAuth {
    pub fn shared(self) -> SharedTokenProvider {
        Arc::new(self)
    }
}

#[async_trait]
impl TokenProvider for NoAuth {
    async fn authorization(&self) -> Result<Option<String>, ConnectorError> {
        Ok(None)
    }
}
