//! In-memory [`Cluster`] used to exercise the engine without an API server.
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Mutex, MutexGuard},
};

use kube::{api::DynamicObject, ResourceExt};

use super::{
    Cluster, ClusterError, CreateStatus, DeleteStatus, ObservedResource, PodRestarts,
    PodSelector, PodUsage, ResourceStatus,
};

#[derive(Debug, Clone)]
struct FakeResource {
    labels: BTreeMap<String, String>,
    gets: usize,
}

#[derive(Debug, Default)]
struct State {
    resources: BTreeMap<(String, String), FakeResource>,
    namespaces: BTreeMap<String, BTreeMap<String, String>>,
    creates: usize,
    gets: usize,
    deletes: usize,
    patches: usize,
    restart_calls: usize,
}

/// Scriptable fake of the Kubernetes API.
///
/// Every resource walks through the same phase script: the n-th get of a
/// resource reports the n-th phase, the last entry repeats forever.
#[derive(Debug, Default)]
pub struct FakeCluster {
    phases: Vec<Option<String>>,
    deleting_after: Option<usize>,
    malformed_gets: BTreeSet<usize>,
    reject_creates: Option<u16>,
    accept_label_patches: bool,
    failing_metrics: bool,
    usage: BTreeMap<String, Vec<PodUsage>>,
    restarts: BTreeMap<String, Vec<Vec<PodRestarts>>>,
    state: Mutex<State>,
}

fn api_error(code: u16, reason: &str, message: impl Into<String>) -> ClusterError {
    ClusterError::Api {
        code,
        reason: reason.to_owned(),
        message: message.into(),
    }
}

fn matches_selector(labels: &BTreeMap<String, String>, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => labels.get(key).map(String::as_str) == Some(value),
            None => labels.contains_key(term),
        })
}

impl FakeCluster {
    /// Phases reported by successive gets of each resource.
    pub fn with_phases<'a>(mut self, phases: impl IntoIterator<Item = &'a str>) -> Self {
        self.phases = phases.into_iter().map(|p| Some(p.to_owned())).collect();
        self
    }

    /// Report the resource as being deleted from the given get onwards (1 based).
    pub fn deleting_after(mut self, get: usize) -> Self {
        self.deleting_after = Some(get);
        self
    }

    /// Make the given get (1 based) of each resource fail to decode.
    pub fn with_malformed_get(mut self, get: usize) -> Self {
        self.malformed_gets.insert(get);
        self
    }

    /// Reject every create with the given status code.
    pub fn rejecting_creates(mut self, code: u16) -> Self {
        self.reject_creates = Some(code);
        self
    }

    /// Accept label patches instead of denying them like an admission webhook.
    pub fn accepting_label_patches(mut self) -> Self {
        self.accept_label_patches = true;
        self
    }

    /// Make every metrics and pod list call fail.
    pub fn failing_metrics(mut self) -> Self {
        self.failing_metrics = true;
        self
    }

    /// Usage reported for pods of a namespace.
    pub fn with_pod_usage(mut self, namespace: &str, usage: Vec<PodUsage>) -> Self {
        self.usage.insert(namespace.to_owned(), usage);
        self
    }

    /// Restart counts reported by successive pod lists of a namespace.
    pub fn with_restarts(mut self, namespace: &str, restarts: Vec<Vec<PodRestarts>>) -> Self {
        self.restarts.insert(namespace.to_owned(), restarts);
        self
    }

    /// Seed an existing resource, e.g. left over from a previous run.
    pub fn with_resource(self, namespace: &str, name: &str, labels: &[(&str, &str)]) -> Self {
        self.lock().resources.insert(
            (namespace.to_owned(), name.to_owned()),
            FakeResource {
                labels: labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                gets: 0,
            },
        );
        self
    }

    /// Seed an existing namespace.
    pub fn with_namespace(self, name: &str, labels: &[(&str, &str)]) -> Self {
        self.lock().namespaces.insert(
            name.to_owned(),
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Number of create calls received.
    pub fn creates(&self) -> usize {
        self.lock().creates
    }

    /// Number of get calls received.
    pub fn gets(&self) -> usize {
        self.lock().gets
    }

    /// Number of delete calls received.
    pub fn deletes(&self) -> usize {
        self.lock().deletes
    }

    /// Number of label patches received.
    pub fn patches(&self) -> usize {
        self.lock().patches
    }

    /// Names of the resources currently stored, as namespace/name.
    pub fn resources(&self) -> Vec<String> {
        self.lock()
            .resources
            .keys()
            .map(|(ns, name)| format!("{ns}/{name}"))
            .collect()
    }

    /// Names of the namespaces currently stored.
    pub fn namespaces(&self) -> Vec<String> {
        self.lock().namespaces.keys().cloned().collect()
    }

    fn phase_for(&self, get: usize) -> Option<String> {
        if self.phases.is_empty() {
            return None;
        }
        let idx = (get - 1).min(self.phases.len() - 1);
        self.phases[idx].clone()
    }
}

#[async_trait::async_trait]
impl Cluster for FakeCluster {
    async fn create_resource(&self, manifest: &DynamicObject) -> Result<CreateStatus, ClusterError> {
        let mut state = self.lock();
        state.creates += 1;
        if let Some(code) = self.reject_creates {
            return Err(api_error(code, "Forbidden", "create rejected"));
        }
        let key = (
            manifest.namespace().unwrap_or_default(),
            manifest.name_any(),
        );
        if state.resources.contains_key(&key) {
            return Ok(CreateStatus::AlreadyExists);
        }
        state.resources.insert(
            key,
            FakeResource {
                labels: manifest.labels().clone(),
                gets: 0,
            },
        );
        Ok(CreateStatus::Created)
    }

    async fn get_resource(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ObservedResource, ClusterError> {
        let mut state = self.lock();
        state.gets += 1;
        let resource = state
            .resources
            .get_mut(&(namespace.to_owned(), name.to_owned()))
            .ok_or_else(|| api_error(404, "NotFound", format!("{name} not found")))?;
        resource.gets += 1;
        let get = resource.gets;
        if self.malformed_gets.contains(&get) {
            return Err(serde_json::from_str::<serde_json::Value>("{\"status\":")
                .expect_err("truncated JSON should not parse")
                .into());
        }
        Ok(ObservedResource {
            status: ResourceStatus {
                phase: self.phase_for(get),
                message: None,
            },
            deleting: self.deleting_after.map_or(false, |after| get >= after),
        })
    }

    async fn delete_resource(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<DeleteStatus, ClusterError> {
        let mut state = self.lock();
        state.deletes += 1;
        Ok(
            match state
                .resources
                .remove(&(namespace.to_owned(), name.to_owned()))
            {
                Some(_) => DeleteStatus::Deleted,
                None => DeleteStatus::NotFound,
            },
        )
    }

    async fn list_resources(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<String>, ClusterError> {
        Ok(self
            .lock()
            .resources
            .iter()
            .filter(|((ns, _), res)| ns == namespace && matches_selector(&res.labels, selector))
            .map(|((_, name), _)| name.clone())
            .collect())
    }

    async fn patch_resource_labels(
        &self,
        namespace: &str,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), ClusterError> {
        let mut state = self.lock();
        state.patches += 1;
        if !self.accept_label_patches {
            return Err(api_error(
                403,
                "Forbidden",
                "admission webhook denied the request",
            ));
        }
        let resource = state
            .resources
            .get_mut(&(namespace.to_owned(), name.to_owned()))
            .ok_or_else(|| api_error(404, "NotFound", format!("{name} not found")))?;
        resource.labels.extend(labels.clone());
        Ok(())
    }

    async fn ensure_namespace(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<CreateStatus, ClusterError> {
        let mut state = self.lock();
        if state.namespaces.contains_key(name) {
            return Ok(CreateStatus::AlreadyExists);
        }
        state.namespaces.insert(name.to_owned(), labels.clone());
        Ok(CreateStatus::Created)
    }

    async fn list_namespaces(&self, selector: &str) -> Result<Vec<String>, ClusterError> {
        Ok(self
            .lock()
            .namespaces
            .iter()
            .filter(|(_, labels)| matches_selector(labels, selector))
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn delete_namespace(&self, name: &str) -> Result<DeleteStatus, ClusterError> {
        let mut state = self.lock();
        if state.namespaces.remove(name).is_none() {
            return Ok(DeleteStatus::NotFound);
        }
        state.resources.retain(|(ns, _), _| ns != name);
        Ok(DeleteStatus::Deleted)
    }

    async fn pod_usage(
        &self,
        namespace: &str,
        selector: &PodSelector,
    ) -> Result<Vec<PodUsage>, ClusterError> {
        if self.failing_metrics {
            return Err(api_error(503, "ServiceUnavailable", "metrics unavailable"));
        }
        Ok(self
            .usage
            .get(namespace)
            .map(|usage| {
                usage
                    .iter()
                    .filter(|u| selector.matches_name(&u.pod))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn pod_restarts(
        &self,
        namespace: &str,
        selector: &PodSelector,
    ) -> Result<Vec<PodRestarts>, ClusterError> {
        if self.failing_metrics {
            return Err(api_error(503, "ServiceUnavailable", "pods unavailable"));
        }
        let call = {
            let mut state = self.lock();
            state.restart_calls += 1;
            state.restart_calls
        };
        Ok(self
            .restarts
            .get(namespace)
            .and_then(|script| script.get((call - 1).min(script.len().saturating_sub(1))))
            .map(|restarts| {
                restarts
                    .iter()
                    .filter(|r| selector.matches_name(&r.pod))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
