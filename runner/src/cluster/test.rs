//! Helpers for driving a kube client against a mocked API server.
use anyhow::Result;
use hyper::{body::to_bytes, Body};
use kube::Client;

pub type ApiServerHandle = tower_test::mock::Handle<http::Request<Body>, http::Response<Body>>;

/// Create a kube client whose requests are answered through the returned handle.
pub fn mock_client() -> (Client, ApiServerHandle) {
    let (mock_service, handle) =
        tower_test::mock::pair::<http::Request<Body>, http::Response<Body>>();
    (Client::new(mock_service, "default"), handle)
}

/// Build an API server response with a JSON body.
pub fn json_response(status: u16, body: serde_json::Value) -> http::Response<Body> {
    http::Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            serde_json::to_vec(&body).expect("body should serialize"),
        ))
        .expect("response should build")
}

pub async fn timeout_after_1s(handle: tokio::task::JoinHandle<()>) {
    tokio::time::timeout(std::time::Duration::from_secs(1), handle)
        .await
        .expect("timeout on mock apiserver")
        .expect("stub succeeded")
}

/// Captured request sent by the kube client, body pretty printed for expect! snapshots.
#[derive(Debug)]
pub struct Request {
    pub method: String,
    pub uri: String,
    pub body: Raw,
}

impl Request {
    pub async fn from_request(request: http::Request<Body>) -> Result<Self> {
        let method = request.method().to_string();
        let uri = request.uri().to_string();
        let body_bytes = to_bytes(request.into_body()).await?;
        let body = if !body_bytes.is_empty() {
            let json: serde_json::Value =
                serde_json::from_slice(&body_bytes).expect("body should be JSON");
            Raw(serde_json::to_string_pretty(&json)?)
        } else {
            Raw("".to_string())
        };
        Ok(Self {
            method,
            uri,
            body,
        })
    }

    /// Path of the request URI without the query.
    pub fn path(&self) -> &str {
        self.uri.split('?').next().unwrap_or_default()
    }
}

// Raw String the does not escape its value for debugging
pub struct Raw(pub String);

impl std::fmt::Debug for Raw {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
