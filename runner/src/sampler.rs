//! Samples resource usage and restarts of the pods backing the operator.
use std::{
    collections::{btree_map::Entry, BTreeMap},
    str::FromStr,
    sync::{Arc, Mutex, PoisonError},
};

use anyhow::{anyhow, bail, Result};
use dwload_common::quantity;
use futures::future::join_all;
use tracing::{debug, warn};

use crate::{
    cluster::{Cluster, PodRestarts, PodSelector},
    metrics::Recorder,
};

/// Names of the metrics recorded for a pod group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMetrics {
    /// Trend of CPU usage in millicores
    pub cpu: String,
    /// Trend of memory usage in bytes
    pub memory: String,
    /// Counter of CPU samples above the ceiling
    pub cpu_violations: String,
    /// Counter of memory samples above the ceiling
    pub memory_violations: String,
    /// Gauge of the highest restart count
    pub restarts: String,
}

impl GroupMetrics {
    fn new(group: &str) -> Self {
        Self {
            cpu: format!("{group}_cpu_millicores"),
            memory: format!("{group}_memory_bytes"),
            cpu_violations: format!("{group}_cpu_violations"),
            memory_violations: format!("{group}_memory_violations"),
            restarts: format!("{group}_pod_restarts"),
        }
    }
}

/// A named set of pods whose usage is sampled on every poll tick.
#[derive(Debug, Clone, PartialEq)]
pub struct PodGroup {
    /// Name used as prefix of the group metrics
    pub name: String,
    /// Namespace of the pods
    pub namespace: String,
    /// Pods of the group within the namespace
    pub selector: PodSelector,
    /// CPU ceiling in millicores
    pub cpu_ceiling: Option<f64>,
    /// Memory ceiling in bytes
    pub memory_ceiling: Option<f64>,
    metrics: GroupMetrics,
}

impl PodGroup {
    /// Create a pod group.
    pub fn new(
        name: &str,
        namespace: &str,
        selector: PodSelector,
        cpu_ceiling: Option<f64>,
        memory_ceiling: Option<f64>,
    ) -> Self {
        Self {
            name: name.to_owned(),
            namespace: namespace.to_owned(),
            selector,
            cpu_ceiling,
            memory_ceiling,
            metrics: GroupMetrics::new(name),
        }
    }

    /// Metric names of the group.
    pub fn metric_names(&self) -> &GroupMetrics {
        &self.metrics
    }

    /// Groups sampled when none are configured: the controller and webhook
    /// server in the operator namespace and the cluster etcd.
    pub fn defaults(operator_namespace: &str) -> Vec<Self> {
        const CPU_CEILING: f64 = 250.0;
        const MEMORY_CEILING: f64 = 200.0 * 1024.0 * 1024.0;
        vec![
            Self::new(
                "operator",
                operator_namespace,
                PodSelector::Labels("app.kubernetes.io/name=devworkspace-controller".to_owned()),
                Some(CPU_CEILING),
                Some(MEMORY_CEILING),
            ),
            Self::new(
                "webhook",
                operator_namespace,
                PodSelector::Labels(
                    "app.kubernetes.io/name=devworkspace-webhook-server".to_owned(),
                ),
                Some(CPU_CEILING),
                Some(MEMORY_CEILING),
            ),
            Self::new(
                "etcd",
                "openshift-etcd",
                PodSelector::Labels("app=etcd".to_owned()),
                None,
                None,
            ),
        ]
    }
}

impl FromStr for PodGroup {
    type Err = anyhow::Error;

    /// Parse `name:namespace:selector[:cpu[:memory]]`, e.g.
    /// `operator:openshift-operators:app=controller:250m:200Mi`. Empty ceilings
    /// are not enforced.
    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').map(str::trim).collect();
        if !(3..=5).contains(&parts.len()) {
            bail!("pod group {s:?} must be written name:namespace:selector[:cpu[:memory]]");
        }
        if parts[0].is_empty() || parts[1].is_empty() {
            bail!("pod group {s:?} needs a name and a namespace");
        }
        let ceiling = |idx: usize, parse: fn(&str) -> Result<f64, quantity::QuantityError>| {
            parts
                .get(idx)
                .filter(|q| !q.is_empty())
                .map(|q| parse(*q).map_err(|err| anyhow!("pod group {s:?}: {err}")))
                .transpose()
        };
        Ok(Self::new(
            parts[0],
            parts[1],
            parts[2].parse()?,
            ceiling(3, quantity::cpu_millicores)?,
            ceiling(4, quantity::memory_bytes)?,
        ))
    }
}

/// Restart counts of each pod of a group when the group was first listed.
type RestartBaselines = BTreeMap<String, BTreeMap<String, i32>>;

/// Folds pod usage into the run metrics. Every failure is logged and skipped.
#[derive(Clone)]
pub struct Sampler {
    cluster: Arc<dyn Cluster>,
    recorder: Arc<dyn Recorder>,
    groups: Arc<Vec<PodGroup>>,
    baselines: Arc<Mutex<RestartBaselines>>,
}

impl Sampler {
    /// Create a sampler for the pod groups.
    pub fn new(cluster: Arc<dyn Cluster>, recorder: Arc<dyn Recorder>, groups: Vec<PodGroup>) -> Self {
        Self {
            cluster,
            recorder,
            groups: Arc::new(groups),
            baselines: Arc::default(),
        }
    }

    /// Sample every group once.
    pub async fn sample(&self) {
        join_all(self.groups.iter().map(|group| async move {
            self.sample_usage(group).await;
            self.sample_restarts(group).await;
        }))
        .await;
    }

    async fn sample_usage(&self, group: &PodGroup) {
        let pods = match self.cluster.pod_usage(&group.namespace, &group.selector).await {
            Ok(pods) => pods,
            Err(err) => {
                warn!(group = %group.name, %err, "skipping usage sample");
                return;
            }
        };
        let names = group.metric_names();
        for pod in pods {
            if let Some(cpu) = &pod.cpu {
                match quantity::cpu_millicores(cpu) {
                    Ok(millicores) => {
                        self.recorder.observe(&names.cpu, millicores);
                        if group.cpu_ceiling.is_some_and(|ceiling| millicores > ceiling) {
                            warn!(group = %group.name, pod = %pod.pod, millicores, "cpu above ceiling");
                            self.recorder.increment(&names.cpu_violations);
                        }
                    }
                    Err(err) => warn!(group = %group.name, pod = %pod.pod, %err, "unparseable cpu usage"),
                }
            }
            if let Some(memory) = &pod.memory {
                match quantity::memory_bytes(memory) {
                    Ok(bytes) => {
                        self.recorder.observe(&names.memory, bytes);
                        if group.memory_ceiling.is_some_and(|ceiling| bytes > ceiling) {
                            warn!(group = %group.name, pod = %pod.pod, bytes, "memory above ceiling");
                            self.recorder.increment(&names.memory_violations);
                        }
                    }
                    Err(err) => warn!(group = %group.name, pod = %pod.pod, %err, "unparseable memory usage"),
                }
            }
        }
    }

    async fn sample_restarts(&self, group: &PodGroup) {
        match self
            .cluster
            .pod_restarts(&group.namespace, &group.selector)
            .await
        {
            Ok(pods) => {
                if let Some(max) = self.restarts_since_baseline(group, &pods) {
                    debug!(group = %group.name, max, "pod restarts");
                    self.recorder
                        .set_gauge(&group.metric_names().restarts, f64::from(max));
                }
            }
            Err(err) => warn!(group = %group.name, %err, "skipping restart sample"),
        }
    }
}

impl Sampler {
    /// Highest number of restarts of a pod since the group was first listed.
    /// Pods that appear later count all their restarts.
    fn restarts_since_baseline(&self, group: &PodGroup, pods: &[PodRestarts]) -> Option<i32> {
        if pods.is_empty() {
            return None;
        }
        let mut baselines = self
            .baselines
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match baselines.entry(group.name.clone()) {
            Entry::Vacant(entry) => {
                entry.insert(
                    pods.iter()
                        .map(|pod| (pod.pod.clone(), pod.restarts))
                        .collect(),
                );
                Some(0)
            }
            Entry::Occupied(entry) => {
                let baseline = entry.get();
                pods.iter()
                    .map(|pod| {
                        let before = baseline.get(&pod.pod).copied().unwrap_or_default();
                        (pod.restarts - before).max(0)
                    })
                    .max()
            }
        }
    }
}
