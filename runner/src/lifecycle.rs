//! Drives one managed resource from creation to a terminal phase.
//!
//! ```text
//! Created -> Pending -> Ready | Failed | TimedOut
//! ```
//!
//! TimedOut is not an explicit failure: under heavy load a resource may still
//! converge after the observation window, so it is counted separately and
//! does not feed the ready failure threshold.
use std::{collections::BTreeMap, sync::Arc, time::Duration};

use kube::ResourceExt;
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::{
    cluster::{Cluster, ClusterError, ObservedResource},
    labels,
    metrics::{self, Recorder},
    sampler::Sampler,
    target::NamespaceMode,
    workload::{ManifestTemplate, WorkloadError},
};

/// Phases meaning the resource is up.
pub const READY_ALIASES: [&str; 2] = ["Ready", "Running"];
/// Phases meaning the resource will not come up.
pub const FAILURE_ALIASES: [&str; 3] = ["Failed", "Failing", "Error"];

/// Check recorded for every create call.
pub const CHECK_CREATED: &str = "devworkspace created";
/// Check recorded for every resource reaching a ready or failure phase.
pub const CHECK_READY: &str = "devworkspace ready";
/// Check recorded for every delete call.
pub const CHECK_DELETED: &str = "devworkspace deleted";
/// Check recorded for every identity tampering probe.
pub const CHECK_PROBE: &str = "identity tampering rejected";

/// Classification of an observed resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    /// The resource reached a ready alias.
    Ready,
    /// The resource can no longer become ready.
    Failed(String),
    /// Anything else, including a missing status.
    Pending,
}

/// Map the observed state of a resource to its phase.
///
/// Failure aliases are only terminal with `track_failures`. A resource that
/// is being deleted before it became ready is always failed.
pub fn classify(observed: &ObservedResource, track_failures: bool) -> Phase {
    let phase = observed.status.phase.as_deref().unwrap_or_default();
    if READY_ALIASES.contains(&phase) {
        return Phase::Ready;
    }
    if observed.deleting {
        return Phase::Failed("resource is being deleted".to_owned());
    }
    if track_failures && FAILURE_ALIASES.contains(&phase) {
        return Phase::Failed(
            observed
                .status
                .message
                .clone()
                .unwrap_or_else(|| phase.to_owned()),
        );
    }
    Phase::Pending
}

/// Terminal classification of an iteration, exactly one per iteration that
/// got past the create call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum Outcome {
    /// Reached a ready alias.
    Ready,
    /// Reached a failure alias or started deleting.
    Failed(String),
    /// No terminal phase within the timeout.
    TimedOut,
}

/// Record of one iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct IterationOutcome {
    /// Name of the resource
    pub name: String,
    /// Namespace of the resource
    pub namespace: String,
    /// Latency of the create call
    pub create: Duration,
    /// Time from the start of the create call until ready
    pub ready: Option<Duration>,
    /// Latency of the delete call, when the resource was deleted
    pub delete: Option<Duration>,
    /// Terminal classification
    pub outcome: Outcome,
}

/// Failures aborting an iteration before polling.
#[derive(Debug, Error)]
pub enum IterationError {
    /// The manifest could not be rendered.
    #[error(transparent)]
    Render(#[from] WorkloadError),
    /// The iteration namespace could not be created.
    #[error("failed to create namespace {namespace}: {source}")]
    Namespace {
        /// Namespace name
        namespace: String,
        /// Cause
        source: ClusterError,
    },
    /// The API rejected the create call.
    #[error("failed to create {name}: {source}")]
    Create {
        /// Resource name
        name: String,
        /// Cause
        source: ClusterError,
    },
}

/// Timing and behavior of the poll loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollSettings {
    /// Time between two polls
    pub interval: Duration,
    /// Time allowed to reach a terminal phase
    pub timeout: Duration,
    /// Treat failure aliases as terminal
    pub track_failures: bool,
    /// Delete the resource as soon as it is ready
    pub delete_after_ready: bool,
    /// Try to overwrite the creator label once ready
    pub webhook_probe: bool,
}

impl PollSettings {
    /// Number of polls before giving up, at least one.
    pub fn max_attempts(&self) -> u32 {
        if self.interval.is_zero() {
            return 1;
        }
        let attempts = self.timeout.as_nanos().div_ceil(self.interval.as_nanos());
        u32::try_from(attempts).unwrap_or(u32::MAX).max(1)
    }
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

/// Everything an iteration needs, shared by all VUs.
pub struct IterationContext {
    /// Cluster under test
    pub cluster: Arc<dyn Cluster>,
    /// Run metrics
    pub recorder: Arc<dyn Recorder>,
    /// Sampler invoked on every pending poll
    pub sampler: Sampler,
    /// Manifest template
    pub template: ManifestTemplate,
    /// Namespace layout
    pub mode: NamespaceMode,
    /// Poll loop settings
    pub settings: PollSettings,
}

impl IterationContext {
    /// Create, poll and optionally delete one resource.
    #[tracing::instrument(skip(self))]
    pub async fn run_iteration(
        &self,
        vu: usize,
        iteration: usize,
    ) -> Result<IterationOutcome, IterationError> {
        let namespace = self.mode.namespace_for(vu, iteration);
        if self.mode.is_separate() {
            self.cluster
                .ensure_namespace(&namespace, &labels::tracking_labels())
                .await
                .map_err(|source| IterationError::Namespace {
                    namespace: namespace.clone(),
                    source,
                })?;
        }
        let manifest = self.template.render(vu, iteration, &namespace)?;
        let name = manifest.name_any();

        let start = Instant::now();
        match self.cluster.create_resource(&manifest).await {
            Ok(status) => {
                debug!(name, ?status, "created");
                self.recorder.increment(metrics::CREATED);
                self.recorder.check(CHECK_CREATED, true);
            }
            Err(source) => {
                error!(name, %source, "create rejected");
                self.recorder.increment(metrics::CREATE_FAILED);
                self.recorder.check(CHECK_CREATED, false);
                return Err(IterationError::Create { name, source });
            }
        }
        let create = start.elapsed();
        self.recorder
            .observe(metrics::CREATE_DURATION, millis(create));

        let outcome = self.poll(&namespace, &name).await;
        let mut ready = None;
        match &outcome {
            Outcome::Ready => {
                let elapsed = start.elapsed();
                info!(name, ?elapsed, "ready");
                self.recorder.increment(metrics::READY);
                self.recorder
                    .observe(metrics::READY_DURATION, millis(elapsed));
                self.recorder.check(CHECK_READY, true);
                ready = Some(elapsed);
            }
            Outcome::Failed(reason) => {
                error!(name, reason, "failed to become ready");
                self.recorder.increment(metrics::READY_FAILED);
                self.recorder.check(CHECK_READY, false);
            }
            Outcome::TimedOut => {
                warn!(
                    name,
                    timeout = ?self.settings.timeout,
                    "no terminal phase before timeout"
                );
                self.recorder.increment(metrics::READY_TIMEOUT);
            }
        }

        let mut delete = None;
        if ready.is_some() {
            if self.settings.webhook_probe {
                self.probe_identity(&namespace, &name).await;
            }
            if self.settings.delete_after_ready {
                delete = self.delete(&namespace, &name).await;
            }
        }
        Ok(IterationOutcome {
            name,
            namespace,
            create,
            ready,
            delete,
            outcome,
        })
    }

    /// Poll until a terminal phase or the attempts run out. Every poll that
    /// does not observe a ready phase samples the operator pods.
    async fn poll(&self, namespace: &str, name: &str) -> Outcome {
        let attempts = self.settings.max_attempts();
        for attempt in 1..=attempts {
            match self.cluster.get_resource(namespace, name).await {
                Ok(observed) => match classify(&observed, self.settings.track_failures) {
                    Phase::Ready => return Outcome::Ready,
                    Phase::Failed(reason) => {
                        self.sampler.sample().await;
                        return Outcome::Failed(reason);
                    }
                    Phase::Pending => {
                        debug!(name, attempt, phase = ?observed.status.phase, "pending")
                    }
                },
                Err(err) => warn!(name, attempt, %err, "inconclusive poll"),
            }
            self.sampler.sample().await;
            if attempt < attempts {
                tokio::time::sleep(self.settings.interval).await;
            }
        }
        Outcome::TimedOut
    }

    /// Delete a resource, a missing resource counts as deleted.
    async fn delete(&self, namespace: &str, name: &str) -> Option<Duration> {
        let start = Instant::now();
        match self.cluster.delete_resource(namespace, name).await {
            Ok(status) => {
                let elapsed = start.elapsed();
                debug!(name, ?status, ?elapsed, "deleted");
                self.recorder
                    .observe(metrics::DELETE_DURATION, millis(elapsed));
                self.recorder.check(CHECK_DELETED, true);
                Some(elapsed)
            }
            Err(err) => {
                error!(name, %err, "delete rejected");
                self.recorder.increment(metrics::DELETE_FAILED);
                self.recorder.check(CHECK_DELETED, false);
                None
            }
        }
    }

    /// Try to overwrite the creator label. The admission webhook must reject
    /// the change with a client error.
    async fn probe_identity(&self, namespace: &str, name: &str) {
        let tampered = BTreeMap::from_iter([(
            labels::CREATOR_LABEL_KEY.to_owned(),
            "tampered-identity".to_owned(),
        )]);
        match self
            .cluster
            .patch_resource_labels(namespace, name, &tampered)
            .await
        {
            Err(err) if err.code().is_some_and(|code| (400..500).contains(&code)) => {
                debug!(name, %err, "identity tampering rejected");
                self.recorder.check(CHECK_PROBE, true);
            }
            Err(err) => {
                warn!(name, %err, "identity tampering probe inconclusive");
                self.recorder.check(CHECK_PROBE, false);
            }
            Ok(()) => {
                error!(name, "identity tampering accepted");
                self.recorder.increment(metrics::WEBHOOK_PROBE_FAILURES);
                self.recorder.check(CHECK_PROBE, false);
            }
        }
    }
}
