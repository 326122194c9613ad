//! HTTP client for the chv server.

use chv_core::config::ClientConfig;
use chv_core::error::{ChvError, Result};
use hyper::client::HttpConnector;
use hyper::header::CONTENT_TYPE;
use hyper::{Body, Client, Method, Request};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// JSON client for the server's `/vm` API.
///
/// Non-2xx responses become [`ChvError::Api`] carrying the body verbatim.
pub struct ApiClient {
    base_url: String,
    client: Client<HttpConnector>,
}

impl ApiClient {
    pub fn new(config: &ClientConfig) -> Self {
        Self::with_base_url(config.base_url())
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let req = Request::builder()
            .method(Method::GET)
            .uri(format!("{}{}", self.base_url, path))
            .body(Body::empty())
            .map_err(|e| ChvError::Other(format!("invalid request: {}", e)))?;
        self.send(req).await
    }

    pub async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let req = Request::builder()
            .method(Method::POST)
            .uri(format!("{}{}", self.base_url, path))
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(body)?))
            .map_err(|e| ChvError::Other(format!("invalid request: {}", e)))?;
        self.send(req).await
    }

    async fn send<T: DeserializeOwned>(&self, req: Request<Body>) -> Result<T> {
        let method = req.method().clone();
        let uri = req.uri().clone();
        tracing::debug!(%method, %uri, "Sending request");

        let resp = self.client.request(req).await.map_err(|e| {
            ChvError::Other(format!(
                "failed to reach chv server at {}: {}",
                self.base_url, e
            ))
        })?;
        let status = resp.status();
        let bytes = hyper::body::to_bytes(resp.into_body())
            .await
            .map_err(|e| ChvError::Other(format!("failed to read response: {}", e)))?;

        tracing::debug!(%method, %uri, status = status.as_u16(), "Received response");
        if !status.is_success() {
            return Err(ChvError::Api {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }

        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::net::SocketAddr;

    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Response, Server, StatusCode};

    /// Serve one canned response for every request; returns the base URL.
    async fn canned(status: StatusCode, body: &'static str) -> String {
        let make_svc = make_service_fn(move |_conn| async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| async move {
                let echo = req.uri().path().to_string();
                let body = if body.is_empty() {
                    format!(r#"{{"path":"{}"}}"#, echo)
                } else {
                    body.to_string()
                };
                Ok::<_, Infallible>(
                    Response::builder()
                        .status(status)
                        .body(Body::from(body))
                        .unwrap(),
                )
            }))
        });

        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = Server::bind(&addr).serve(make_svc);
        let url = format!("http://{}", server.local_addr());
        tokio::spawn(server);
        url
    }

    #[tokio::test]
    async fn test_success_decodes_body() {
        let client = ApiClient::with_base_url(canned(StatusCode::OK, "").await);
        let value: serde_json::Value = client.get("/vm/list").await.unwrap();
        assert_eq!(value["path"], "/vm/list");
    }

    #[tokio::test]
    async fn test_error_body_verbatim() {
        let body = r#"{"error":"VM 'vm1' already exists"}"#;
        let client = ApiClient::with_base_url(canned(StatusCode::CONFLICT, body).await);

        let err = client
            .post::<_, serde_json::Value>("/vm/start", &serde_json::json!({"name": "vm1"}))
            .await
            .unwrap_err();

        match &err {
            ChvError::Api { status, body: got } => {
                assert_eq!(*status, 409);
                assert_eq!(got, body);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(err.to_string(), format!("error: {} code: 409", body));
    }

    #[tokio::test]
    async fn test_unreachable_server() {
        // Port 1 on loopback is not expected to accept connections.
        let client = ApiClient::with_base_url("http://127.0.0.1:1");
        let err = client
            .get::<serde_json::Value>("/vm/list")
            .await
            .unwrap_err();
        assert!(matches!(err, ChvError::Other(ref msg) if msg.contains("failed to reach")));
    }

    #[test]
    fn test_base_url_from_config() {
        let client = ApiClient::new(&ClientConfig::default());
        assert_eq!(client.base_url(), "http://127.0.0.1:7000");
    }
}
