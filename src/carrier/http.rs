//! HTTP SMS API driver
//!
//! Each segment becomes one request:
//! `POST <url>` with JSON `{"to": "<number>", "body": "<segment>"}` and, when
//! a token is configured, `Authorization: Bearer <token>`. Any 2xx response
//! counts as accepted by the carrier.

use super::{check_destination, CarrierError, CarrierGateway};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info};

pub struct HttpGateway {
    http: Client,
    url: String,
    token: Option<String>,
    max_part_len: usize,
}

impl HttpGateway {
    pub fn new(url: String, token: Option<String>, max_part_len: usize) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build reqwest client")?;

        info!("HTTP carrier gateway created for {}", url);

        Ok(Self {
            http,
            url,
            token,
            max_part_len,
        })
    }
}

#[async_trait]
impl CarrierGateway for HttpGateway {
    fn max_part_len(&self) -> usize {
        self.max_part_len
    }

    async fn send_segment(&self, destination: &str, body: &str) -> Result<(), CarrierError> {
        check_destination(destination)?;

        let mut request = self.http.post(&self.url).json(&json!({
            "to": destination,
            "body": body,
        }));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| CarrierError::Http(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body_text = resp.text().await.unwrap_or_default();
            return Err(CarrierError::Rejected {
                status: status.as_u16(),
                body: body_text,
            });
        }

        debug!("Carrier accepted segment for {} ({})", destination, status);
        Ok(())
    }
}
