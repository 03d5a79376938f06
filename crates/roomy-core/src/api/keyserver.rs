//! Client for the keyserver's passphrase endpoint.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{header, Client};
use serde::Deserialize;
use tracing::debug;

use super::ApiError;
use crate::config::Config;

/// HTTP request timeout in seconds.
/// Login is interactive, so fail reasonably fast on a stuck keyserver.
const REQUEST_TIMEOUT_SECS: u64 = 30;

const PASSPHRASE_PATH: &str = "/passphrase";

/// Source of derived passphrases, keyed by the caller's access token
#[async_trait]
pub trait Keyserver: Send + Sync {
    async fn fetch_passphrase(&self, access_token: &str) -> Result<String>;
}

/// The keyserver answers with a JSON string, an object, or plain text
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PassphraseResponse {
    Plain(String),
    Wrapped { passphrase: String },
}

fn parse_passphrase(body: &str) -> Option<String> {
    let passphrase = match serde_json::from_str::<PassphraseResponse>(body) {
        Ok(PassphraseResponse::Plain(p)) | Ok(PassphraseResponse::Wrapped { passphrase: p }) => p,
        Err(_) => body.to_string(),
    };

    let passphrase = passphrase.trim();
    if passphrase.is_empty() {
        None
    } else {
        Some(passphrase.to_string())
    }
}

/// Keyserver client. Clone is cheap - reqwest::Client uses Arc internally.
#[derive(Clone)]
pub struct KeyserverClient {
    client: Client,
    base_url: String,
}

impl KeyserverClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(config.keyserver_url.clone())
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body).into())
        }
    }
}

#[async_trait]
impl Keyserver for KeyserverClient {
    async fn fetch_passphrase(&self, access_token: &str) -> Result<String> {
        let url = format!("{}{}", self.base_url, PASSPHRASE_PATH);
        debug!(%url, "Requesting passphrase");

        let response = self
            .client
            .post(&url)
            .bearer_auth(access_token)
            .header(header::ACCEPT, "application/json")
            .send()
            .await
            .with_context(|| format!("Failed to send passphrase request to {}", url))?;

        let response = Self::check_response(response).await?;
        let body = response
            .text()
            .await
            .context("Failed to read passphrase response")?;

        parse_passphrase(&body)
            .ok_or_else(|| ApiError::NoPassphrase.into())
    }
}
