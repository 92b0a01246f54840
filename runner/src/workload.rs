//! Builds the manifest of the resource created by each iteration.
use kube::{
    api::DynamicObject,
    core::{ObjectMeta, TypeMeta},
};
use reqwest::Url;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::info;

use crate::{cluster::ResourceKind, labels};

/// Errors produced while resolving or rendering a manifest template.
#[derive(Debug, Error)]
pub enum WorkloadError {
    /// The external template could not be fetched.
    #[error("failed to fetch template {url}: {source}")]
    Fetch {
        /// Template location
        url: Url,
        /// Cause
        source: reqwest::Error,
    },
    /// The external template server did not answer 200.
    #[error("fetching template {url} returned {status}")]
    Status {
        /// Template location
        url: Url,
        /// Response status
        status: reqwest::StatusCode,
    },
    /// The template is not valid YAML or JSON.
    #[error("template {origin} is not valid YAML: {source}")]
    Parse {
        /// Where the template came from
        origin: String,
        /// Cause
        source: serde_yaml::Error,
    },
    /// The template is valid YAML but not an object.
    #[error("template {0} must be a mapping")]
    NotAMapping(String),
    /// The template describes another kind than the one under test.
    #[error("template {origin} is a {found}, expected a {expected}")]
    KindMismatch {
        /// Where the template came from
        origin: String,
        /// Configured kind
        expected: String,
        /// Kind declared by the template
        found: String,
    },
    /// The rendered document is not a valid Kubernetes object.
    #[error("rendered manifest is not a valid object: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Where the manifest template comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestSource {
    /// Minimal DevWorkspace with a single short lived container.
    BuiltIn,
    /// YAML or JSON document served over HTTP.
    External(Url),
}

impl ManifestSource {
    /// Resolve the source into a template, fetching it when external.
    #[tracing::instrument(skip(client, kind))]
    pub async fn resolve(
        &self,
        client: &reqwest::Client,
        kind: &ResourceKind,
        prefix: &str,
    ) -> Result<ManifestTemplate, WorkloadError> {
        match self {
            ManifestSource::BuiltIn => Ok(ManifestTemplate::built_in(kind, prefix)),
            ManifestSource::External(url) => {
                let resp = client
                    .get(url.clone())
                    .send()
                    .await
                    .map_err(|source| WorkloadError::Fetch {
                        url: url.clone(),
                        source,
                    })?;
                if resp.status() != reqwest::StatusCode::OK {
                    return Err(WorkloadError::Status {
                        url: url.clone(),
                        status: resp.status(),
                    });
                }
                let body = resp.text().await.map_err(|source| WorkloadError::Fetch {
                    url: url.clone(),
                    source,
                })?;
                let template = ManifestTemplate::from_document(&body, url.as_str(), kind, prefix)?;
                info!(%url, "using external template");
                Ok(template)
            }
        }
    }
}

/// Base document rendered into one manifest per iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestTemplate {
    document: Value,
    prefix: String,
}

impl ManifestTemplate {
    /// The built-in template: ephemeral storage and one busybox container
    /// with modest requests and limits that sleeps briefly.
    pub fn built_in(kind: &ResourceKind, prefix: &str) -> Self {
        Self {
            document: json!({
                "apiVersion": kind.api_version(),
                "kind": kind.kind,
                "metadata": {},
                "spec": {
                    "started": true,
                    "template": {
                        "attributes": {
                            "controller.devfile.io/storage-type": "ephemeral"
                        },
                        "components": [{
                            "name": "dev",
                            "container": {
                                "image": "busybox:latest",
                                "command": ["sleep", "10"],
                                "cpuRequest": "100m",
                                "cpuLimit": "200m",
                                "memoryRequest": "64Mi",
                                "memoryLimit": "128Mi"
                            }
                        }]
                    }
                }
            }),
            prefix: prefix.to_owned(),
        }
    }

    /// Parse a YAML or JSON document into a template. Missing apiVersion and
    /// kind default to the configured kind.
    pub fn from_document(
        body: &str,
        origin: &str,
        kind: &ResourceKind,
        prefix: &str,
    ) -> Result<Self, WorkloadError> {
        let mut document: Value =
            serde_yaml::from_str(body).map_err(|source| WorkloadError::Parse {
                origin: origin.to_owned(),
                source,
            })?;
        let object = document
            .as_object_mut()
            .ok_or_else(|| WorkloadError::NotAMapping(origin.to_owned()))?;
        match object.get("kind").and_then(Value::as_str) {
            Some(found) if found != kind.kind => {
                return Err(WorkloadError::KindMismatch {
                    origin: origin.to_owned(),
                    expected: kind.kind.clone(),
                    found: found.to_owned(),
                })
            }
            Some(_) => {}
            None => {
                object.insert("kind".to_owned(), kind.kind.clone().into());
            }
        }
        object
            .entry("apiVersion")
            .or_insert_with(|| kind.api_version().into());
        Ok(Self {
            document,
            prefix: prefix.to_owned(),
        })
    }

    /// Name of the resource created by an iteration.
    pub fn name_for(&self, vu: usize, iteration: usize) -> String {
        format!("{}-{vu}-{iteration}", self.prefix)
    }

    /// Render the manifest of one iteration: unique name, target namespace,
    /// tracking label and started toggle.
    pub fn render(
        &self,
        vu: usize,
        iteration: usize,
        namespace: &str,
    ) -> Result<DynamicObject, WorkloadError> {
        let mut object: DynamicObject = serde_json::from_value(self.document.clone())?;
        let template = std::mem::take(&mut object.metadata);
        object.metadata = ObjectMeta {
            name: Some(self.name_for(vu, iteration)),
            namespace: Some(namespace.to_owned()),
            labels: Some(
                template
                    .labels
                    .unwrap_or_default()
                    .into_iter()
                    .chain(labels::tracking_labels())
                    .collect(),
            ),
            annotations: template.annotations,
            ..Default::default()
        };
        if !object.data.is_object() {
            object.data = json!({});
        }
        let spec = object
            .data
            .as_object_mut()
            .map(|data| data.entry("spec").or_insert_with(|| json!({})));
        match spec.and_then(Value::as_object_mut) {
            Some(spec) => {
                spec.insert("started".to_owned(), true.into());
            }
            None => object.data["spec"] = json!({ "started": true }),
        }
        if object.types.is_none() {
            object.types = Some(TypeMeta {
                api_version: self.document["apiVersion"].as_str().unwrap_or_default().to_owned(),
                kind: self.document["kind"].as_str().unwrap_or_default().to_owned(),
            });
        }
        Ok(object)
    }
}
