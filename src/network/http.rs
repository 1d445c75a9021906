use crate::network::DbotGateway;
use crate::types::{
    ApiRequest, ApiResponse, AtnError, BalanceProof, ChannelId, EndpointPrice, Result,
    SyncStatus,
};
use async_trait::async_trait;
use ethers::types::{Address, Signature, U256};
use serde::Deserialize;
use std::str::FromStr;
use reqwest::{Client, Method, StatusCode};
use std::time::Duration;
use tracing::debug;

/// DBot gateway speaking the DBot server's HTTP API.
#[derive(Debug, Clone)]
pub struct HttpDbotGateway {
    base_url: String,
    client: Client,
}

impl HttpDbotGateway {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let base_url = normalize_base_url(&base_url.into());
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { base_url, client })
    }

    fn channel_url(&self, channel: &ChannelId) -> String {
        format!(
            "{}/api/v1/dbots/{:?}/channels/{:?}/{}",
            self.base_url, channel.receiver, channel.sender, channel.open_block_number
        )
    }

    fn call_url(&self, receiver: Address, uri: &str) -> String {
        format!(
            "{}/call/{:?}/{}",
            self.base_url,
            receiver,
            uri.trim_start_matches('/')
        )
    }
}

/// DBot domains are registered with or without a scheme.
fn normalize_base_url(domain: &str) -> String {
    let domain = domain.trim_end_matches('/');
    if domain.to_lowercase().starts_with("http") {
        domain.to_string()
    } else {
        format!("http://{}", domain)
    }
}

#[derive(Deserialize)]
struct CloseResponse {
    close_signature: String,
}

async fn provider_error(response: reqwest::Response) -> AtnError {
    let status = response.status().as_u16();
    let message = response.text().await.unwrap_or_default();
    AtnError::Provider { status, message }
}

#[async_trait]
impl DbotGateway for HttpDbotGateway {
    async fn price(&self, receiver: Address, uri: &str, method: &str) -> Result<EndpointPrice> {
        let url = format!("{}/api/v1/dbots/{:?}/price", self.base_url, receiver);
        let response = self
            .client
            .get(&url)
            .query(&[("uri", uri), ("method", method)])
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(response.json().await?),
            StatusCode::NOT_FOUND => Err(AtnError::EndpointNotFound {
                uri: uri.to_string(),
                method: method.to_string(),
            }),
            _ => Err(provider_error(response).await),
        }
    }

    async fn call(
        &self,
        receiver: Address,
        request: &ApiRequest,
        proof: &BalanceProof,
    ) -> Result<ApiResponse> {
        let method = Method::from_bytes(request.method.to_uppercase().as_bytes())
            .map_err(|_| AtnError::config(format!("invalid HTTP method {}", request.method)))?;
        let url = self.call_url(receiver, &request.uri);
        debug!(%url, nonce = proof.nonce, balance = %proof.balance, "calling DBot");

        let mut builder = self.client.request(method, &url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        for (name, value) in proof.to_headers() {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        if matches!(
            status,
            StatusCode::UNAUTHORIZED | StatusCode::PAYMENT_REQUIRED | StatusCode::CONFLICT
        ) {
            let reason = response.text().await.unwrap_or_default();
            return Err(AtnError::invalid_proof(format!("{}: {}", status, reason)));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await?.to_vec();
        Ok(ApiResponse {
            status: status.as_u16(),
            content_type,
            body,
        })
    }

    async fn channel_sync_status(&self, channel: &ChannelId) -> Result<Option<SyncStatus>> {
        let response = self.client.get(self.channel_url(channel)).send().await?;

        match response.status() {
            StatusCode::OK => Ok(Some(response.json().await?)),
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(provider_error(response).await),
        }
    }

    async fn closing_signature(&self, channel: &ChannelId, balance: U256) -> Result<Signature> {
        let response = self
            .client
            .delete(self.channel_url(channel))
            .query(&[("balance", balance.to_string())])
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            let reason = response.text().await.unwrap_or_default();
            return Err(AtnError::close_denied(format!("{}: {}", status, reason)));
        }
        let body: CloseResponse = response.json().await?;
        Signature::from_str(body.close_signature.trim_start_matches("0x"))
            .map_err(|e| AtnError::close_denied(format!("bad closing signature: {}", e)))
    }
}
