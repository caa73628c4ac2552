use std::collections::BTreeMap;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::debug;

use flowloom_core::config::SandboxConfig;
use flowloom_core::error::{FlowloomError, Result};
use flowloom_core::traits::NetworkClient;
use flowloom_core::types::{HttpRequest, HttpResponse};

/// Network capability backed by a shared `reqwest::Client`.
///
/// The client timeout bounds every script call; the interpreter itself
/// imposes none.
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    pub fn new(config: &SandboxConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()
            .map_err(|e| FlowloomError::Network(e.to_string()))?;
        Ok(Self { client })
    }
}

impl NetworkClient for ReqwestClient {
    fn request(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse>> {
        Box::pin(async move {
            let method = request
                .method
                .to_uppercase()
                .parse::<reqwest::Method>()
                .map_err(|e| FlowloomError::Network(format!("Invalid method: {}", e)))?;

            let mut req = self.client.request(method, &request.url);
            for (k, v) in &request.headers {
                req = req.header(k.as_str(), v.as_str());
            }
            if let Some(json) = &request.json {
                req = req.json(json);
            } else if let Some(body) = request.body {
                req = req.body(body);
            }

            let resp = req
                .send()
                .await
                .map_err(|e| FlowloomError::Network(e.to_string()))?;
            let status = resp.status().as_u16();
            let headers: BTreeMap<String, String> = resp
                .headers()
                .iter()
                .filter_map(|(k, v)| Some((k.to_string(), v.to_str().ok()?.to_string())))
                .collect();
            let body = resp
                .text()
                .await
                .map_err(|e| FlowloomError::Network(e.to_string()))?;

            debug!(url = %request.url, status, "HTTP request complete");
            Ok(HttpResponse {
                status,
                headers,
                body,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_method_is_network_error() {
        let client = ReqwestClient::new(&SandboxConfig::default()).unwrap();
        let mut request = HttpRequest::get("http://127.0.0.1:9/");
        request.method = "NOT A METHOD".into();
        let err = client.request(request).await.unwrap_err();
        assert!(matches!(err, FlowloomError::Network(_)));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_network_error() {
        let mut config = SandboxConfig::default();
        config.http_timeout_secs = 2;
        let client = ReqwestClient::new(&config).unwrap();
        let err = client
            .request(HttpRequest::get("http://127.0.0.1:9/"))
            .await
            .unwrap_err();
        assert!(matches!(err, FlowloomError::Network(_)));
    }
}
