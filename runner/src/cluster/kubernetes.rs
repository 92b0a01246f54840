use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::{
    api::{
        ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, ObjectMeta, Patch,
        PatchParams, PostParams,
    },
    Api, Client, ResourceExt,
};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{
    Cluster, ClusterError, CreateStatus, DeleteStatus, ObservedResource, PodRestarts,
    PodSelector, PodUsage, ResourceKind, ResourceStatus,
};

const CONFLICT: u16 = 409;
const NOT_FOUND: u16 = 404;

/// [`Cluster`] backed by a kube client.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    resource: ApiResource,
    pod_metrics: ApiResource,
}

impl KubeCluster {
    /// Create a cluster for the given managed kind.
    pub fn new(client: Client, kind: &ResourceKind) -> Self {
        let resource = ApiResource::from_gvk_with_plural(
            &GroupVersionKind::gvk(&kind.group, &kind.version, &kind.kind),
            &kind.plural,
        );
        let pod_metrics = ApiResource::from_gvk_with_plural(
            &GroupVersionKind::gvk("metrics.k8s.io", "v1beta1", "PodMetrics"),
            "pods",
        );
        Self {
            client,
            resource,
            pod_metrics,
        }
    }

    fn resources(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &self.resource)
    }

    fn list_params(selector: &PodSelector) -> ListParams {
        match selector.label_selector() {
            Some(labels) => ListParams::default().labels(labels),
            None => ListParams::default(),
        }
    }
}

fn create_status<T>(result: Result<T, kube::Error>) -> Result<CreateStatus, ClusterError> {
    match result.map_err(ClusterError::from) {
        Ok(_) => Ok(CreateStatus::Created),
        Err(err) if err.code() == Some(CONFLICT) => Ok(CreateStatus::AlreadyExists),
        Err(err) => Err(err),
    }
}

fn delete_status<T>(result: Result<T, kube::Error>) -> Result<DeleteStatus, ClusterError> {
    match result.map_err(ClusterError::from) {
        Ok(_) => Ok(DeleteStatus::Deleted),
        Err(err) if err.code() == Some(NOT_FOUND) => Ok(DeleteStatus::NotFound),
        Err(err) => Err(err),
    }
}

// Subset of metrics.k8s.io/v1beta1 PodMetrics
#[derive(Debug, Deserialize)]
struct PodMetricsBody {
    #[serde(default)]
    containers: Vec<ContainerMetrics>,
}

#[derive(Debug, Deserialize)]
struct ContainerMetrics {
    #[serde(default)]
    usage: BTreeMap<String, String>,
}

#[async_trait::async_trait]
impl Cluster for KubeCluster {
    async fn create_resource(&self, manifest: &DynamicObject) -> Result<CreateStatus, ClusterError> {
        let namespace = manifest.namespace().unwrap_or_default();
        debug!(namespace, name = manifest.name_any(), "create resource");
        create_status(
            self.resources(&namespace)
                .create(&PostParams::default(), manifest)
                .await,
        )
    }

    async fn get_resource(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ObservedResource, ClusterError> {
        let obj = self.resources(namespace).get(name).await?;
        let status = match obj.data.get("status") {
            Some(status) if !status.is_null() => {
                serde_json::from_value::<ResourceStatus>(status.clone())?
            }
            _ => ResourceStatus::default(),
        };
        Ok(ObservedResource {
            status,
            deleting: obj.metadata.deletion_timestamp.is_some(),
        })
    }

    async fn delete_resource(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<DeleteStatus, ClusterError> {
        delete_status(
            self.resources(namespace)
                .delete(name, &DeleteParams::default())
                .await,
        )
    }

    async fn list_resources(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<String>, ClusterError> {
        let list = self
            .resources(namespace)
            .list(&ListParams::default().labels(selector))
            .await?;
        Ok(list.items.iter().map(|obj| obj.name_any()).collect())
    }

    async fn patch_resource_labels(
        &self,
        namespace: &str,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), ClusterError> {
        let patch = json!({ "metadata": { "labels": labels } });
        self.resources(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn ensure_namespace(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<CreateStatus, ClusterError> {
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            ..Default::default()
        };
        create_status(
            Api::<Namespace>::all(self.client.clone())
                .create(&PostParams::default(), &namespace)
                .await,
        )
    }

    async fn list_namespaces(&self, selector: &str) -> Result<Vec<String>, ClusterError> {
        let list = Api::<Namespace>::all(self.client.clone())
            .list(&ListParams::default().labels(selector))
            .await?;
        Ok(list.items.iter().map(|ns| ns.name_any()).collect())
    }

    async fn delete_namespace(&self, name: &str) -> Result<DeleteStatus, ClusterError> {
        delete_status(
            Api::<Namespace>::all(self.client.clone())
                .delete(name, &DeleteParams::default())
                .await,
        )
    }

    async fn pod_usage(
        &self,
        namespace: &str,
        selector: &PodSelector,
    ) -> Result<Vec<PodUsage>, ClusterError> {
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &self.pod_metrics);
        let list = api.list(&Self::list_params(selector)).await?;
        let mut usage = Vec::with_capacity(list.items.len());
        for item in list.items {
            let pod = item.name_any();
            if !selector.matches_name(&pod) {
                continue;
            }
            let body: PodMetricsBody = serde_json::from_value(item.data)?;
            let (cpu, memory) = match body.containers.into_iter().next() {
                Some(mut container) => (
                    container.usage.remove("cpu"),
                    container.usage.remove("memory"),
                ),
                None => (None, None),
            };
            usage.push(PodUsage { pod, cpu, memory });
        }
        Ok(usage)
    }

    async fn pod_restarts(
        &self,
        namespace: &str,
        selector: &PodSelector,
    ) -> Result<Vec<PodRestarts>, ClusterError> {
        let list = Api::<Pod>::namespaced(self.client.clone(), namespace)
            .list(&Self::list_params(selector))
            .await?;
        Ok(list
            .items
            .into_iter()
            .filter(|pod| selector.matches_name(&pod.name_any()))
            .map(|pod| {
                let restarts = pod
                    .status
                    .as_ref()
                    .and_then(|status| status.container_statuses.as_ref())
                    .and_then(|statuses| statuses.first())
                    .map(|status| status.restart_count)
                    .unwrap_or_default();
                PodRestarts {
                    pod: pod.name_any(),
                    restarts,
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use expect_test::expect;
    use serde_json::json;
    use test_log::test;

    use super::*;
    use crate::cluster::test::{json_response, mock_client, timeout_after_1s, Request};

    fn cluster(client: Client) -> KubeCluster {
        KubeCluster::new(client, &ResourceKind::default())
    }

    fn manifest() -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "workspace.devfile.io/v1alpha2",
            "kind": "DevWorkspace",
            "metadata": { "name": "dw-1-0", "namespace": "loadtest" },
            "spec": { "started": true },
        }))
        .unwrap()
    }

    #[test(tokio::test)]
    async fn create_conflict_is_already_exists() {
        let (client, mut handle) = mock_client();
        let server = tokio::spawn(async move {
            let (request, send) = handle.next_request().await.expect("service not called");
            let request = Request::from_request(request).await.unwrap();
            assert_eq!(request.method, "POST");
            assert_eq!(
                request.path(),
                "/apis/workspace.devfile.io/v1alpha2/namespaces/loadtest/devworkspaces"
            );
            expect![[r#"
                {
                  "apiVersion": "workspace.devfile.io/v1alpha2",
                  "kind": "DevWorkspace",
                  "metadata": {
                    "name": "dw-1-0",
                    "namespace": "loadtest"
                  },
                  "spec": {
                    "started": true
                  }
                }
            "#]]
            .assert_debug_eq(&request.body);
            send.send_response(json_response(
                409,
                json!({
                    "kind": "Status",
                    "apiVersion": "v1",
                    "status": "Failure",
                    "message": "devworkspaces \"dw-1-0\" already exists",
                    "reason": "AlreadyExists",
                    "code": 409
                }),
            ));
        });
        let status = cluster(client).create_resource(&manifest()).await.unwrap();
        assert_eq!(status, CreateStatus::AlreadyExists);
        timeout_after_1s(server).await;
    }

    #[test(tokio::test)]
    async fn create_forbidden_is_error() {
        let (client, mut handle) = mock_client();
        let server = tokio::spawn(async move {
            let (_request, send) = handle.next_request().await.expect("service not called");
            send.send_response(json_response(
                403,
                json!({
                    "kind": "Status",
                    "apiVersion": "v1",
                    "status": "Failure",
                    "message": "forbidden",
                    "reason": "Forbidden",
                    "code": 403
                }),
            ));
        });
        let err = cluster(client)
            .create_resource(&manifest())
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(403));
        timeout_after_1s(server).await;
    }

    #[test(tokio::test)]
    async fn delete_missing_is_not_found() {
        let (client, mut handle) = mock_client();
        let server = tokio::spawn(async move {
            let (request, send) = handle.next_request().await.expect("service not called");
            assert_eq!(request.method(), http::Method::DELETE);
            assert_eq!(
                request.uri().path(),
                "/apis/workspace.devfile.io/v1alpha2/namespaces/loadtest/devworkspaces/dw-9-9"
            );
            send.send_response(json_response(
                404,
                json!({
                    "kind": "Status",
                    "apiVersion": "v1",
                    "status": "Failure",
                    "message": "devworkspaces \"dw-9-9\" not found",
                    "reason": "NotFound",
                    "code": 404
                }),
            ));
        });
        let status = cluster(client)
            .delete_resource("loadtest", "dw-9-9")
            .await
            .unwrap();
        assert_eq!(status, DeleteStatus::NotFound);
        timeout_after_1s(server).await;
    }

    #[test(tokio::test)]
    async fn get_parses_status_and_deletion() {
        let (client, mut handle) = mock_client();
        let server = tokio::spawn(async move {
            let (request, send) = handle.next_request().await.expect("service not called");
            assert_eq!(request.method(), http::Method::GET);
            send.send_response(json_response(
                200,
                json!({
                    "apiVersion": "workspace.devfile.io/v1alpha2",
                    "kind": "DevWorkspace",
                    "metadata": {
                        "name": "dw-1-0",
                        "namespace": "loadtest",
                        "deletionTimestamp": "2024-01-01T00:00:00Z"
                    },
                    "spec": { "started": true },
                    "status": { "phase": "Starting", "message": "Waiting for workspace deployment" }
                }),
            ));
        });
        let observed = cluster(client)
            .get_resource("loadtest", "dw-1-0")
            .await
            .unwrap();
        assert_eq!(observed.status.phase.as_deref(), Some("Starting"));
        assert_eq!(
            observed.status.message.as_deref(),
            Some("Waiting for workspace deployment")
        );
        assert!(observed.deleting);
        timeout_after_1s(server).await;
    }

    #[test(tokio::test)]
    async fn get_with_malformed_status_is_decode_error() {
        let (client, mut handle) = mock_client();
        let server = tokio::spawn(async move {
            let (_request, send) = handle.next_request().await.expect("service not called");
            send.send_response(json_response(
                200,
                json!({
                    "apiVersion": "workspace.devfile.io/v1alpha2",
                    "kind": "DevWorkspace",
                    "metadata": { "name": "dw-1-0", "namespace": "loadtest" },
                    "status": { "phase": 42 }
                }),
            ));
        });
        let err = cluster(client)
            .get_resource("loadtest", "dw-1-0")
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::Decode(_)), "{err:?}");
        timeout_after_1s(server).await;
    }

    #[test(tokio::test)]
    async fn pod_usage_reads_first_container_and_filters_names() {
        let (client, mut handle) = mock_client();
        let server = tokio::spawn(async move {
            let (request, send) = handle.next_request().await.expect("service not called");
            assert_eq!(
                request.uri().path(),
                "/apis/metrics.k8s.io/v1beta1/namespaces/openshift-etcd/pods"
            );
            send.send_response(json_response(
                200,
                json!({
                    "apiVersion": "metrics.k8s.io/v1beta1",
                    "kind": "PodMetricsList",
                    "metadata": {},
                    "items": [
                        {
                            "metadata": { "name": "etcd-master-0", "namespace": "openshift-etcd" },
                            "timestamp": "2024-01-01T00:00:00Z",
                            "window": "30s",
                            "containers": [
                                { "name": "etcd", "usage": { "cpu": "120m", "memory": "512Mi" } },
                                { "name": "etcdctl", "usage": { "cpu": "1m", "memory": "1Mi" } }
                            ]
                        },
                        {
                            "metadata": { "name": "etcd-guard-master-0", "namespace": "openshift-etcd" },
                            "timestamp": "2024-01-01T00:00:00Z",
                            "window": "30s",
                            "containers": []
                        },
                        {
                            "metadata": { "name": "installer-3", "namespace": "openshift-etcd" },
                            "timestamp": "2024-01-01T00:00:00Z",
                            "window": "30s",
                            "containers": [
                                { "name": "installer", "usage": { "cpu": "5m", "memory": "10Mi" } }
                            ]
                        }
                    ]
                }),
            ));
        });
        let usage = cluster(client)
            .pod_usage(
                "openshift-etcd",
                &PodSelector::NameContains("etcd".to_owned()),
            )
            .await
            .unwrap();
        assert_eq!(
            usage,
            vec![
                PodUsage {
                    pod: "etcd-master-0".to_owned(),
                    cpu: Some("120m".to_owned()),
                    memory: Some("512Mi".to_owned()),
                },
                PodUsage {
                    pod: "etcd-guard-master-0".to_owned(),
                    cpu: None,
                    memory: None,
                },
            ]
        );
        timeout_after_1s(server).await;
    }

    #[test(tokio::test)]
    async fn pod_restarts_uses_label_selector() {
        let (client, mut handle) = mock_client();
        let server = tokio::spawn(async move {
            let (request, send) = handle.next_request().await.expect("service not called");
            assert_eq!(
                request.uri().path(),
                "/api/v1/namespaces/devworkspace-controller/pods"
            );
            let query = request.uri().query().unwrap_or_default().to_owned();
            assert!(
                query.contains("labelSelector=app.kubernetes.io%2Fname%3Ddevworkspace-controller"),
                "{query}"
            );
            send.send_response(json_response(
                200,
                json!({
                    "apiVersion": "v1",
                    "kind": "PodList",
                    "metadata": {},
                    "items": [
                        {
                            "metadata": { "name": "devworkspace-controller-manager-abc" },
                            "status": {
                                "containerStatuses": [{
                                    "name": "devworkspace-controller",
                                    "image": "quay.io/devfile/devworkspace-controller:next",
                                    "imageID": "",
                                    "ready": true,
                                    "restartCount": 2
                                }]
                            }
                        },
                        {
                            "metadata": { "name": "devworkspace-controller-manager-def" },
                            "status": {}
                        }
                    ]
                }),
            ));
        });
        let restarts = cluster(client)
            .pod_restarts(
                "devworkspace-controller",
                &PodSelector::Labels("app.kubernetes.io/name=devworkspace-controller".to_owned()),
            )
            .await
            .unwrap();
        assert_eq!(
            restarts,
            vec![
                PodRestarts {
                    pod: "devworkspace-controller-manager-abc".to_owned(),
                    restarts: 2,
                },
                PodRestarts {
                    pod: "devworkspace-controller-manager-def".to_owned(),
                    restarts: 0,
                },
            ]
        );
        timeout_after_1s(server).await;
    }

    #[test(tokio::test)]
    async fn patch_labels_sends_merge_patch() {
        let (client, mut handle) = mock_client();
        let server = tokio::spawn(async move {
            let (request, send) = handle.next_request().await.expect("service not called");
            let content_type = request
                .headers()
                .get(http::header::CONTENT_TYPE)
                .map(|v| v.to_str().unwrap().to_owned());
            let request = Request::from_request(request).await.unwrap();
            assert_eq!(request.method, "PATCH");
            assert_eq!(content_type.as_deref(), Some("application/merge-patch+json"));
            expect![[r#"
                {
                  "metadata": {
                    "labels": {
                      "controller.devfile.io/creator": "intruder"
                    }
                  }
                }
            "#]]
            .assert_debug_eq(&request.body);
            send.send_response(json_response(
                403,
                json!({
                    "kind": "Status",
                    "apiVersion": "v1",
                    "status": "Failure",
                    "message": "admission webhook denied the request",
                    "reason": "Forbidden",
                    "code": 403
                }),
            ));
        });
        let labels = BTreeMap::from_iter([(
            "controller.devfile.io/creator".to_owned(),
            "intruder".to_owned(),
        )]);
        let err = cluster(client)
            .patch_resource_labels("loadtest", "dw-1-0", &labels)
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(403));
        timeout_after_1s(server).await;
    }
}
