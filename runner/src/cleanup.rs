//! Final sweep deleting everything carrying the tracking label.
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::Args;
use futures::{stream, StreamExt};
use serde::Serialize;
use tracing::{info, warn};

use crate::{
    cluster::{Cluster, ClusterOpts, DeleteStatus, KubeCluster},
    labels::TRACKING_LABEL_SELECTOR,
    target::{NamespaceMode, TargetOpts},
    CommandResult,
};

/// Deletes issued at the same time during a sweep.
const CLEANUP_CONCURRENCY: usize = 16;

/// Options to the cleanup command
#[derive(Args, Debug)]
pub struct Opts {
    #[command(flatten)]
    cluster: ClusterOpts,

    #[command(flatten)]
    target: TargetOpts,
}

/// Counts of a sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Resources deleted
    pub resources_deleted: usize,
    /// Namespaces deleted
    pub namespaces_deleted: usize,
    /// Calls that failed
    pub failures: usize,
}

async fn target_namespaces(
    cluster: &dyn Cluster,
    mode: &NamespaceMode,
    report: &mut CleanupReport,
) -> Vec<String> {
    match mode {
        NamespaceMode::Shared(namespace) => vec![namespace.clone()],
        NamespaceMode::Separate { base } => {
            let prefix = format!("{base}-");
            match cluster.list_namespaces(TRACKING_LABEL_SELECTOR).await {
                Ok(namespaces) => namespaces
                    .into_iter()
                    .filter(|namespace| namespace.starts_with(&prefix))
                    .collect(),
                Err(err) => {
                    warn!(%err, "failed to list namespaces");
                    report.failures += 1;
                    Vec::new()
                }
            }
        }
    }
}

/// Delete every tracked resource, and in separate namespace mode every
/// tracked namespace. Failures are logged and counted, never returned.
#[tracing::instrument(skip(cluster))]
pub async fn sweep(cluster: &dyn Cluster, mode: &NamespaceMode) -> CleanupReport {
    let mut report = CleanupReport::default();
    let namespaces = target_namespaces(cluster, mode, &mut report).await;

    for namespace in &namespaces {
        let names = match cluster
            .list_resources(namespace, TRACKING_LABEL_SELECTOR)
            .await
        {
            Ok(names) => names,
            Err(err) => {
                warn!(namespace, %err, "failed to list resources");
                report.failures += 1;
                continue;
            }
        };
        let results: Vec<_> = stream::iter(names)
            .map(|name| async move {
                let result = cluster.delete_resource(namespace, &name).await;
                (name, result)
            })
            .buffer_unordered(CLEANUP_CONCURRENCY)
            .collect()
            .await;
        for (name, result) in results {
            match result {
                Ok(DeleteStatus::Deleted) => report.resources_deleted += 1,
                Ok(DeleteStatus::NotFound) => {}
                Err(err) => {
                    warn!(namespace, name, %err, "failed to delete resource");
                    report.failures += 1;
                }
            }
        }
    }

    if mode.is_separate() {
        for namespace in &namespaces {
            match cluster.delete_namespace(namespace).await {
                Ok(DeleteStatus::Deleted) => report.namespaces_deleted += 1,
                Ok(DeleteStatus::NotFound) => {}
                Err(err) => {
                    warn!(namespace, %err, "failed to delete namespace");
                    report.failures += 1;
                }
            }
        }
    }
    info!(?report, "cleanup finished");
    report
}

/// Run a sweep on its own, e.g. after an interrupted run.
pub async fn cleanup(opts: Opts) -> Result<CommandResult> {
    let cluster: Arc<dyn Cluster> = Arc::new(KubeCluster::new(
        opts.cluster.client()?,
        &opts.target.kind(),
    ));
    let report = sweep(cluster.as_ref(), &opts.target.mode()).await;
    if report.failures > 0 {
        return Ok(CommandResult::Failure(anyhow!(
            "cleanup left {} failures",
            report.failures
        )));
    }
    Ok(CommandResult::Success)
}
