//! HTTP-backed credential provider and confirmation poller.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use crate::error::{ConvoyError, CredentialError, StepError};
use crate::prefetch::{Credential, CredentialProvider};
use crate::workflow::ConfirmationPoller;

fn http_client() -> Result<Client, ConvoyError> {
    Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .timeout(Duration::from_secs(20))
        .build()
        .map_err(|e| ConvoyError::Setup(format!("failed to build HTTP client: {e}")))
}

#[derive(Debug, Deserialize)]
struct IssuedCredential {
    address: String,
    secret: String,
}

/// Requests a fresh credential with `GET <url>`, expecting
/// `{"address": "...", "secret": "..."}`.
pub struct HttpCredentialProvider {
    name: String,
    url: String,
    client: Client,
}

impl HttpCredentialProvider {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Result<Self, ConvoyError> {
        Ok(Self {
            name: name.into(),
            url: url.into(),
            client: http_client()?,
        })
    }

    fn unavailable(&self, message: impl Into<String>) -> CredentialError {
        CredentialError::Unavailable {
            provider: self.name.clone(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl CredentialProvider for HttpCredentialProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn request(&self) -> Result<Credential, CredentialError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| self.unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.unavailable(format!("HTTP {}", status.as_u16())));
        }

        let issued = response
            .json::<IssuedCredential>()
            .await
            .map_err(|e| self.unavailable(format!("malformed response: {e}")))?;
        if issued.address.is_empty() {
            return Err(self.unavailable("empty address"));
        }

        tracing::debug!(provider = %self.name, address = %issued.address, "Credential issued");
        Ok(Credential {
            address: issued.address,
            secret: issued.secret,
            provider: self.name.clone(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct CodeResponse {
    code: Option<String>,
}

/// Polls `GET <url>?address=<address>` for `{"code": "..."}`.
/// A 404 or a null code means the message has not arrived yet.
pub struct HttpConfirmationPoller {
    url: String,
    client: Client,
}

impl HttpConfirmationPoller {
    pub fn new(url: impl Into<String>) -> Result<Self, ConvoyError> {
        Ok(Self {
            url: url.into(),
            client: http_client()?,
        })
    }
}

#[async_trait]
impl ConfirmationPoller for HttpConfirmationPoller {
    async fn poll(&self, credential: &Credential) -> Result<Option<String>, StepError> {
        let response = self
            .client
            .get(&self.url)
            .query(&[("address", credential.address.as_str())])
            .bearer_auth(&credential.secret)
            .send()
            .await
            .map_err(|e| StepError::new("confirmation", e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let body = response
                    .json::<CodeResponse>()
                    .await
                    .map_err(|e| StepError::new("confirmation", format!("malformed response: {e}")))?;
                Ok(body
                    .code
                    .map(|code| code.trim().to_string())
                    .filter(|code| !code.is_empty()))
            }
            status => Err(StepError::new(
                "confirmation",
                format!("HTTP {}", status.as_u16()),
            )),
        }
    }
}
