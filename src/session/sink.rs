//! Where completed sessions are sent.

use std::time::Duration;

use futures::future::BoxFuture;
use log::debug;
use reqwest::Client;

use super::SessionPayload;
use crate::error::PersistenceError;

/// Remote persistence for completed sessions.
///
/// Any error means the session was not stored and belongs in the retry
/// queue.
pub trait SessionSink: Send + Sync {
    fn save<'a>(&'a self, payload: &'a SessionPayload) -> BoxFuture<'a, Result<(), PersistenceError>>;
}

/// Posts sessions as JSON to `{base_url}/sessions`.
pub struct HttpSessionSink {
    client: Client,
    endpoint: String,
}

impl HttpSessionSink {
    pub fn new(base_url: &str) -> Result<Self, PersistenceError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| PersistenceError::Network(e.to_string()))?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: Client, base_url: &str) -> Self {
        Self {
            client,
            endpoint: format!("{}/sessions", base_url.trim_end_matches('/')),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl SessionSink for HttpSessionSink {
    fn save<'a>(&'a self, payload: &'a SessionPayload) -> BoxFuture<'a, Result<(), PersistenceError>> {
        Box::pin(async move {
            let response = self
                .client
                .post(&self.endpoint)
                .json(payload)
                .send()
                .await
                .map_err(|e| PersistenceError::Network(e.to_string()))?;
            let status = response.status();
            if !status.is_success() {
                return Err(PersistenceError::Server { status: status.as_u16() });
            }
            debug!("session saved: {} {}s", payload.kasina_type, payload.duration);
            Ok(())
        })
    }
}
