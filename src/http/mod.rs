//! Outbound HTTPS client shared by the classifier and the notifier.

use anyhow::{Context, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::Request;
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use log::{debug, warn};
use serde::Serialize;
use std::time::Duration;

/// Upper bound on a collected response body.
const MAX_RESPONSE_BYTES: usize = 1024 * 1024;

type HttpsConn = hyper_rustls::HttpsConnector<HttpConnector>;
type CourierHttpClient = Client<HttpsConn, Full<Bytes>>;

/// Installs the process-wide rustls crypto provider. Safe to call repeatedly.
pub fn install_crypto_provider() {
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .ok();
}

/// Status and collected body of a completed request.
#[derive(Debug, Clone)]
pub struct HttpReply {
    pub status: u16,
    pub body: Bytes,
}

impl HttpReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

pub struct HttpClient {
    client: CourierHttpClient,
    user_agent: String,
    timeout: Duration,
}

impl HttpClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let connector = match HttpsConnectorBuilder::new().with_native_roots() {
            Ok(connector) => connector,
            Err(e) => {
                warn!("Failed to load native root certificates, HTTPS calls will fail: {}", e);
                let tls = rustls::ClientConfig::builder()
                    .with_root_certificates(rustls::RootCertStore::empty())
                    .with_no_client_auth();
                HttpsConnectorBuilder::new().with_tls_config(tls)
            }
        };
        let https = connector
            // Plain http is allowed so local relays and stubs can be targeted.
            .https_or_http()
            .enable_http1()
            .build();

        let client: CourierHttpClient = Client::builder(TokioExecutor::new()).build(https);
        let user_agent = format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

        Ok(Self {
            client,
            user_agent,
            timeout,
        })
    }

    /// POSTs `payload` as JSON and collects the response.
    ///
    /// Non-2xx statuses are returned as an [`HttpReply`], not as errors; only
    /// transport failures, the timeout and a body over `MAX_RESPONSE_BYTES`
    /// are errors.
    pub async fn post_json<T>(&self, url: &str, bearer: Option<&str>, payload: &T) -> Result<HttpReply>
    where
        T: Serialize + ?Sized,
    {
        let json_body = serde_json::to_string(payload)?;

        let mut builder = Request::builder()
            .method(hyper::Method::POST)
            .uri(url)
            .header("content-type", "application/json")
            .header("user-agent", &self.user_agent);
        if let Some(token) = bearer {
            builder = builder.header("authorization", format!("Bearer {}", token));
        }
        let request = builder.body(Full::new(Bytes::from(json_body)))?;

        let exchange = async {
            let response = self.client.request(request).await?;
            let status = response.status().as_u16();
            let body = Limited::new(response.into_body(), MAX_RESPONSE_BYTES)
                .collect()
                .await
                .map_err(|e| anyhow::anyhow!("Response body rejected: {}", e))?
                .to_bytes();
            anyhow::Ok(HttpReply { status, body })
        };

        let reply = tokio::time::timeout(self.timeout, exchange)
            .await
            .with_context(|| format!("Request timed out after {}s", self.timeout.as_secs()))??;

        debug!("POST {} -> {}", redact(url), reply.status);
        Ok(reply)
    }
}

/// Drops path segments that may carry a credential (`/bot<token>/...`).
fn redact(url: &str) -> String {
    match url.find("/bot") {
        Some(idx) => format!("{}/bot***", &url[..idx]),
        None => url.to_string(),
    }
}

#[cfg(test)]
mod tests;
