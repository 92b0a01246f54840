//! The `run` command: ramp VUs through create, poll and delete iterations,
//! sweep leftovers and enforce thresholds.
use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use clap::{ArgAction, Args};
use futures::StreamExt;
use reqwest::Url;
use serde::Serialize;
use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook_tokio::Signals;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    cleanup::{self, CleanupReport},
    cluster::{Cluster, ClusterOpts, KubeCluster},
    lifecycle::{IterationContext, Outcome, PollSettings},
    metrics::{Aggregator, Recorder, RunSummary},
    sampler::{PodGroup, Sampler},
    schedule::{self, parse_duration, Executor, ScheduleStats, Stage},
    target::{NamespaceMode, TargetOpts},
    thresholds::{self, Threshold},
    watch::{BackgroundWatcher, EventWatcher},
    workload::{ManifestSource, ManifestTemplate},
    CommandResult,
};

/// Options to the run command
#[derive(Args, Debug)]
pub struct Opts {
    #[command(flatten)]
    cluster: ClusterOpts,

    #[command(flatten)]
    target: TargetOpts,

    /// Maximum number of concurrent virtual users (VUs).
    #[arg(long, env = "DWLOAD_MAX_VUS", default_value_t = 25)]
    max_vus: usize,

    /// Duration of the run. VUs ramp up over the first 20%, hold for 60% and
    /// ramp down over the last 20%.
    #[arg(long, env = "DWLOAD_DURATION", default_value = "12m", value_parser = parse_duration)]
    duration: Duration,

    /// Explicit ramping stages written duration:target, e.g. `2m:10,5m:10,1m:0`.
    /// Takes precedence over --duration.
    #[arg(long = "stage", env = "DWLOAD_STAGES", value_delimiter = ',')]
    stages: Vec<Stage>,

    /// Run this many iterations on each of --max-vus VUs instead of ramping.
    #[arg(long, env = "DWLOAD_ITERATIONS_PER_VU")]
    iterations_per_vu: Option<usize>,

    /// Time in-flight iterations get to finish once the schedule ends.
    #[arg(long, env = "DWLOAD_GRACEFUL_STOP", default_value = "30s", value_parser = parse_duration)]
    graceful_stop: Duration,

    /// Time a resource has to reach a terminal phase.
    #[arg(long, env = "DWLOAD_READY_TIMEOUT", default_value = "120s", value_parser = parse_duration)]
    ready_timeout: Duration,

    /// Time between two polls of a resource.
    #[arg(long, env = "DWLOAD_POLL_INTERVAL", default_value = "10s", value_parser = parse_duration)]
    poll_interval: Duration,

    /// Delete each resource as soon as it is ready. When false resources are
    /// left for the final sweep.
    #[arg(long, env = "DWLOAD_DELETE_AFTER_READY", default_value_t = true, action = ArgAction::Set)]
    delete_after_ready: bool,

    /// Treat Failed, Failing and Error phases as terminal.
    #[arg(long, env = "DWLOAD_TRACK_FAILURES", default_value_t = true, action = ArgAction::Set)]
    track_failures: bool,

    /// Check that the admission webhook rejects changes to the creator label.
    #[arg(long, env = "DWLOAD_WEBHOOK_PROBE")]
    webhook_probe: bool,

    /// URL of a YAML or JSON manifest used instead of the built-in template.
    #[arg(long, env = "DWLOAD_TEMPLATE_URL")]
    template_url: Option<Url>,

    /// Prefix of the resource names.
    #[arg(long, env = "DWLOAD_NAME_PREFIX", default_value = "dw-test")]
    name_prefix: String,

    /// Namespace of the operator and webhook pods sampled by default.
    #[arg(long, env = "DWLOAD_OPERATOR_NAMESPACE", default_value = "openshift-operators")]
    operator_namespace: String,

    /// Pod groups to sample, written name:namespace:selector[:cpu[:memory]].
    /// Replaces the default operator, webhook and etcd groups.
    #[arg(long = "pod-group", env = "DWLOAD_POD_GROUPS", value_delimiter = ';')]
    pod_groups: Vec<PodGroup>,

    /// Thresholds written metric: aggregation operator value. Replaces the
    /// default thresholds of the named metric.
    #[arg(long = "threshold", env = "DWLOAD_THRESHOLDS", value_delimiter = ';')]
    thresholds: Vec<Threshold>,

    /// Leave tracked resources in place once the run ends.
    #[arg(long, env = "DWLOAD_SKIP_CLEANUP")]
    skip_cleanup: bool,

    /// Write the JSON report of the run to this path.
    #[arg(long, env = "DWLOAD_SUMMARY_PATH")]
    summary_path: Option<PathBuf>,

    /// Log Warning events of the load test namespace while running.
    #[arg(long, env = "DWLOAD_WATCH_EVENTS")]
    watch_events: bool,
}

impl Opts {
    fn executor(&self) -> Executor {
        if let Some(iterations) = self.iterations_per_vu {
            Executor::PerVuIterations {
                vus: self.max_vus,
                iterations,
            }
        } else if !self.stages.is_empty() {
            Executor::RampingVus {
                start_vus: 0,
                stages: self.stages.clone(),
            }
        } else {
            Executor::ramping(self.max_vus, self.duration)
        }
    }

    fn plan(&self) -> Plan {
        let groups = if self.pod_groups.is_empty() {
            PodGroup::defaults(&self.operator_namespace)
        } else {
            self.pod_groups.clone()
        };
        Plan {
            mode: self.target.mode(),
            settings: PollSettings {
                interval: self.poll_interval,
                timeout: self.ready_timeout,
                track_failures: self.track_failures,
                delete_after_ready: self.delete_after_ready,
                webhook_probe: self.webhook_probe,
            },
            thresholds: thresholds::with_overrides(thresholds::defaults(&groups), &self.thresholds),
            groups,
            executor: self.executor(),
            graceful_stop: self.graceful_stop,
            cleanup: !self.skip_cleanup,
        }
    }
}

/// What a load test does, independent of where the cluster comes from.
#[derive(Debug, Clone)]
pub struct Plan {
    /// Namespace layout
    pub mode: NamespaceMode,
    /// Poll loop settings
    pub settings: PollSettings,
    /// Pod groups sampled on every poll
    pub groups: Vec<PodGroup>,
    /// VU schedule
    pub executor: Executor,
    /// Time in-flight iterations get to finish
    pub graceful_stop: Duration,
    /// Thresholds deciding the verdict
    pub thresholds: Vec<Threshold>,
    /// Sweep tracked resources at the end
    pub cleanup: bool,
}

/// Terminal classifications over all iterations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeCounts {
    /// Iterations that became ready
    pub ready: usize,
    /// Iterations that failed explicitly
    pub failed: usize,
    /// Iterations without a terminal phase
    pub timed_out: usize,
    /// Iterations aborted before polling
    pub aborted: usize,
}

#[derive(Debug, Default)]
struct OutcomeCounters {
    ready: AtomicUsize,
    failed: AtomicUsize,
    timed_out: AtomicUsize,
    aborted: AtomicUsize,
}

impl OutcomeCounters {
    fn counts(&self) -> OutcomeCounts {
        OutcomeCounts {
            ready: self.ready.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
        }
    }
}

/// Everything known about a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Metrics and threshold results
    pub summary: RunSummary,
    /// Terminal classifications
    pub outcomes: OutcomeCounts,
    /// Schedule counts
    pub schedule: ScheduleStats,
    /// Final sweep counts, None when skipped
    pub cleanup: Option<CleanupReport>,
}

impl RunReport {
    /// True when every threshold passed.
    pub fn passed(&self) -> bool {
        self.summary.passed
    }

    /// Write the report as JSON.
    pub async fn write(&self, path: &Path) -> Result<()> {
        tokio::fs::write(path, serde_json::to_vec_pretty(self)?).await?;
        Ok(())
    }
}

/// A load test ready to execute.
pub struct LoadTest {
    context: Arc<IterationContext>,
    aggregator: Aggregator,
    plan: Plan,
}

impl LoadTest {
    /// Wire a load test against a cluster.
    pub fn new(cluster: Arc<dyn Cluster>, template: ManifestTemplate, plan: Plan) -> Self {
        let aggregator = Aggregator::new();
        let recorder: Arc<dyn Recorder> = Arc::new(aggregator.clone());
        let sampler = Sampler::new(cluster.clone(), recorder.clone(), plan.groups.clone());
        let context = Arc::new(IterationContext {
            cluster,
            recorder,
            sampler,
            template,
            mode: plan.mode.clone(),
            settings: plan.settings.clone(),
        });
        Self {
            context,
            aggregator,
            plan,
        }
    }

    /// Run the schedule, sweep and evaluate thresholds. Cancelling stops the
    /// schedule early, the sweep still runs.
    pub async fn execute(self, cancellation: CancellationToken) -> RunReport {
        let counters = Arc::new(OutcomeCounters::default());
        let stats = {
            let context = self.context.clone();
            let counters = counters.clone();
            schedule::execute(
                &self.plan.executor,
                self.plan.graceful_stop,
                cancellation,
                move |vu, iteration| {
                    let context = context.clone();
                    let counters = counters.clone();
                    async move {
                        let counter = match context.run_iteration(vu, iteration).await {
                            Ok(outcome) => {
                                debug!(
                                    name = %outcome.name,
                                    namespace = %outcome.namespace,
                                    create = ?outcome.create,
                                    ready = ?outcome.ready,
                                    delete = ?outcome.delete,
                                    "iteration finished"
                                );
                                match outcome.outcome {
                                    Outcome::Ready => &counters.ready,
                                    Outcome::Failed(_) => &counters.failed,
                                    Outcome::TimedOut => &counters.timed_out,
                                }
                            }
                            Err(err) => {
                                warn!(vu, iteration, %err, "iteration aborted");
                                &counters.aborted
                            }
                        };
                        counter.fetch_add(1, Ordering::Relaxed);
                    }
                },
            )
            .await
        };

        let cleanup = if self.plan.cleanup {
            Some(cleanup::sweep(self.context.cluster.as_ref(), &self.plan.mode).await)
        } else {
            None
        };

        let snapshot = self.aggregator.snapshot();
        let results = thresholds::evaluate(&self.plan.thresholds, &snapshot);
        RunReport {
            summary: snapshot.summary(results),
            outcomes: counters.counts(),
            schedule: stats,
            cleanup,
        }
    }
}

/// Cancel the token on the first SIGHUP, SIGTERM, SIGINT or SIGQUIT.
fn cancel_on_signal(
    cancellation: CancellationToken,
) -> Result<(signal_hook_tokio::Handle, tokio::task::JoinHandle<()>)> {
    let mut signals = Signals::new([SIGHUP, SIGTERM, SIGINT, SIGQUIT])?;
    let handle = signals.handle();
    let task = tokio::spawn(async move {
        if let Some(signal) = signals.next().await {
            info!(?signal, "signal received, stopping run");
            cancellation.cancel();
        }
    });
    Ok((handle, task))
}

/// Execute the run command.
#[tracing::instrument(skip_all)]
pub async fn run(opts: Opts) -> Result<CommandResult> {
    let client = opts.cluster.client()?;
    let kind = opts.target.kind();
    let cluster: Arc<dyn Cluster> = Arc::new(KubeCluster::new(client.clone(), &kind));

    let source = opts
        .template_url
        .clone()
        .map_or(ManifestSource::BuiltIn, ManifestSource::External);
    let template = source
        .resolve(&reqwest::Client::new(), &kind, &opts.name_prefix)
        .await?;

    let plan = opts.plan();
    info!(?plan.executor, ?plan.mode, ?plan.settings, "starting run");

    let watcher: Option<Box<dyn BackgroundWatcher>> = opts.watch_events.then(|| {
        let namespace = match &plan.mode {
            NamespaceMode::Shared(namespace) => Some(namespace.as_str()),
            NamespaceMode::Separate { .. } => None,
        };
        Box::new(EventWatcher::start(client.clone(), namespace)) as Box<dyn BackgroundWatcher>
    });

    let cancellation = CancellationToken::new();
    let (signals, signal_task) = cancel_on_signal(cancellation.clone())?;

    let report = LoadTest::new(cluster, template, plan)
        .execute(cancellation)
        .await;

    signals.close();
    signal_task.abort();
    if let Some(watcher) = watcher {
        watcher.stop().await;
    }

    info!(outcomes = ?report.outcomes, schedule = ?report.schedule, "run finished\n{}", report.summary);
    if let Some(path) = &opts.summary_path {
        if let Err(err) = report.write(path).await {
            error!(path = %path.display(), %err, "failed to write summary");
        }
    }

    if report.passed() {
        Ok(CommandResult::Success)
    } else {
        let failed: Vec<String> = report
            .summary
            .thresholds
            .iter()
            .filter(|result| !result.passed)
            .map(|result| result.threshold.to_string())
            .collect();
        Ok(CommandResult::Failure(anyhow!(
            "thresholds failed: {}",
            failed.join(", ")
        )))
    }
}
