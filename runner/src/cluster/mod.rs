//! Boundary between the load test and the Kubernetes API.
//!
//! Everything the engine does against the cluster goes through [`Cluster`] so
//! iterations can be driven by an in-memory fake in tests.
mod kubernetes;

#[cfg(test)]
pub mod fake;
#[cfg(test)]
pub mod test;

use std::{collections::BTreeMap, fmt, str::FromStr, time::Duration};

use anyhow::Result;
use clap::Args;
use kube::api::DynamicObject;
use serde::Deserialize;

pub use self::kubernetes::KubeCluster;

/// Options for connecting to the Kubernetes API.
#[derive(Args, Clone)]
pub struct ClusterOpts {
    /// Base URL of the Kubernetes API server, e.g. https://api.cluster:6443.
    #[arg(long, env = "DWLOAD_API_URL")]
    pub api_url: String,

    /// Bearer token used to authenticate against the API server.
    /// Without a token requests are sent unauthenticated, e.g. through `kubectl proxy`.
    #[arg(long, env = "DWLOAD_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Skip verification of the API server certificate.
    #[arg(long, env = "DWLOAD_INSECURE_SKIP_TLS_VERIFY")]
    pub insecure_skip_tls_verify: bool,

    /// Timeout applied to every API call.
    #[arg(
        long,
        env = "DWLOAD_REQUEST_TIMEOUT",
        default_value = "60s",
        value_parser = crate::schedule::parse_duration
    )]
    pub request_timeout: Duration,
}

// Options are logged at startup, the token must never be.
impl fmt::Debug for ClusterOpts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterOpts")
            .field("api_url", &self.api_url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("insecure_skip_tls_verify", &self.insecure_skip_tls_verify)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl ClusterOpts {
    /// Build a kube client from the options.
    pub fn client(&self) -> Result<kube::Client> {
        let mut config = kube::Config::new(self.api_url.parse::<http::Uri>()?);
        config.accept_invalid_certs = self.insecure_skip_tls_verify;
        config.read_timeout = Some(self.request_timeout);
        config.write_timeout = Some(self.request_timeout);
        if let Some(token) = &self.token {
            config.auth_info.token = Some(token.parse()?);
        }
        Ok(kube::Client::try_from(config)?)
    }
}

/// Identifies the custom resource kind managed by the load test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceKind {
    /// API group
    pub group: String,
    /// API version
    pub version: String,
    /// Kind
    pub kind: String,
    /// Plural name used in REST paths
    pub plural: String,
}

impl ResourceKind {
    /// Report the apiVersion string of the kind.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl Default for ResourceKind {
    fn default() -> Self {
        Self {
            group: "workspace.devfile.io".to_owned(),
            version: "v1alpha2".to_owned(),
            kind: "DevWorkspace".to_owned(),
            plural: "devworkspaces".to_owned(),
        }
    }
}

/// Selects a group of pods within a namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodSelector {
    /// Kubernetes label selector, evaluated by the API server.
    Labels(String),
    /// Substring of the pod name, evaluated client side.
    NameContains(String),
}

impl PodSelector {
    /// Label selector to send to the API, if any.
    pub fn label_selector(&self) -> Option<&str> {
        match self {
            PodSelector::Labels(selector) => Some(selector),
            PodSelector::NameContains(_) => None,
        }
    }

    /// Report whether a pod with this name belongs to the group.
    pub fn matches_name(&self, pod: &str) -> bool {
        match self {
            PodSelector::Labels(_) => true,
            PodSelector::NameContains(part) => pod.contains(part.as_str()),
        }
    }
}

impl FromStr for PodSelector {
    type Err = anyhow::Error;

    /// `name~<substring>` selects by pod name, anything else is a label selector.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            anyhow::bail!("pod selector must not be empty");
        }
        Ok(match s.strip_prefix("name~") {
            Some(part) => PodSelector::NameContains(part.to_owned()),
            None => PodSelector::Labels(s.to_owned()),
        })
    }
}

impl fmt::Display for PodSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PodSelector::Labels(selector) => write!(f, "{selector}"),
            PodSelector::NameContains(part) => write!(f, "name~{part}"),
        }
    }
}

/// Result of an idempotent create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateStatus {
    /// The object was created by this call.
    Created,
    /// An object with the same name already existed.
    AlreadyExists,
}

/// Result of an idempotent delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteStatus {
    /// The delete was accepted.
    Deleted,
    /// There was nothing to delete.
    NotFound,
}

/// Status fields of a managed resource. All fields are optional since the
/// operator may not have written a status yet.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    /// Lifecycle phase reported by the operator.
    pub phase: Option<String>,
    /// Human readable detail of the phase.
    pub message: Option<String>,
}

/// A managed resource as observed through a get call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObservedResource {
    /// Parsed status, default when absent.
    pub status: ResourceStatus,
    /// True once metadata.deletionTimestamp is set.
    pub deleting: bool,
}

/// Instantaneous usage of the first container of a pod.
#[derive(Debug, Clone, PartialEq)]
pub struct PodUsage {
    /// Pod name
    pub pod: String,
    /// CPU quantity as reported by the metrics API
    pub cpu: Option<String>,
    /// Memory quantity as reported by the metrics API
    pub memory: Option<String>,
}

/// Restart count of the first container of a pod.
#[derive(Debug, Clone, PartialEq)]
pub struct PodRestarts {
    /// Pod name
    pub pod: String,
    /// Restart count of the first container
    pub restarts: i32,
}

/// Errors returned by [`Cluster`] operations.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// The API server answered with an error status.
    #[error("api responded {code} {reason}: {message}")]
    Api {
        /// HTTP status code
        code: u16,
        /// Machine readable reason
        reason: String,
        /// Human readable message
        message: String,
    },
    /// The response body could not be decoded.
    #[error("malformed response body: {0}")]
    Decode(#[from] serde_json::Error),
    /// The request did not produce a response.
    #[error("request failed: {0}")]
    Transport(kube::Error),
}

impl ClusterError {
    /// HTTP status code of an API error.
    pub fn code(&self) -> Option<u16> {
        match self {
            ClusterError::Api { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<kube::Error> for ClusterError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) => ClusterError::Api {
                code: resp.code,
                reason: resp.reason,
                message: resp.message,
            },
            kube::Error::SerdeError(err) => ClusterError::Decode(err),
            err => ClusterError::Transport(err),
        }
    }
}

/// Operations the load test performs against the cluster.
#[async_trait::async_trait]
pub trait Cluster: Send + Sync {
    /// Create a managed resource in the namespace named by its metadata.
    async fn create_resource(&self, manifest: &DynamicObject) -> Result<CreateStatus, ClusterError>;
    /// Fetch a managed resource.
    async fn get_resource(&self, namespace: &str, name: &str)
        -> Result<ObservedResource, ClusterError>;
    /// Delete a managed resource.
    async fn delete_resource(&self, namespace: &str, name: &str)
        -> Result<DeleteStatus, ClusterError>;
    /// List the names of managed resources matching a label selector.
    async fn list_resources(&self, namespace: &str, selector: &str)
        -> Result<Vec<String>, ClusterError>;
    /// Merge labels into a managed resource.
    async fn patch_resource_labels(
        &self,
        namespace: &str,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), ClusterError>;
    /// Create a namespace if it does not exist yet.
    async fn ensure_namespace(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<CreateStatus, ClusterError>;
    /// List namespaces matching a label selector.
    async fn list_namespaces(&self, selector: &str) -> Result<Vec<String>, ClusterError>;
    /// Delete a namespace.
    async fn delete_namespace(&self, name: &str) -> Result<DeleteStatus, ClusterError>;
    /// Read current usage of a group of pods from the metrics API.
    async fn pod_usage(
        &self,
        namespace: &str,
        selector: &PodSelector,
    ) -> Result<Vec<PodUsage>, ClusterError>;
    /// Read restart counts of a group of pods.
    async fn pod_restarts(
        &self,
        namespace: &str,
        selector: &PodSelector,
    ) -> Result<Vec<PodRestarts>, ClusterError>;
}
