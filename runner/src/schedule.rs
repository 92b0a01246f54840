//! Schedules virtual users (VUs) running load test iterations.
//!
//! Every VU is a tokio task tracked by a [`TaskTracker`]. A VU loops over
//! iterations until it is told to stop, it always finishes the iteration in
//! flight unless the graceful stop budget expires.
use std::{
    future::Future,
    str::FromStr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, bail, Result};
use serde::Serialize;
use tokio::{select, time::Instant};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

/// How often the ramping executor adjusts the number of VUs.
const RAMP_TICK: Duration = Duration::from_secs(1);

/// Parse a duration such as `90`, `500ms`, `15s`, `10m` or `1h30m10s`.
/// A bare number is a count of seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        bail!("empty duration");
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| anyhow!("duration {s:?} is missing a unit"))?;
        if digits == 0 {
            bail!("invalid duration {s:?}");
        }
        let value: u64 = rest[..digits].parse()?;
        rest = &rest[digits..];
        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        total += match &rest[..unit_len] {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value * 60),
            "h" => Duration::from_secs(value * 3600),
            unit => bail!("unknown unit {unit:?} in duration {s:?}"),
        };
        rest = &rest[unit_len..];
    }
    Ok(total)
}

/// One stage of a ramping schedule: move linearly to `target` VUs over `duration`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    /// Length of the stage
    pub duration: Duration,
    /// Number of VUs at the end of the stage
    pub target: usize,
}

impl FromStr for Stage {
    type Err = anyhow::Error;

    /// Parse `duration:target`, e.g. `30s:10`.
    fn from_str(s: &str) -> Result<Self> {
        let (duration, target) = s
            .split_once(':')
            .ok_or_else(|| anyhow!("stage {s:?} must be written duration:target"))?;
        Ok(Self {
            duration: parse_duration(duration)?,
            target: target
                .trim()
                .parse()
                .map_err(|err| anyhow!("invalid target in stage {s:?}: {err}"))?,
        })
    }
}

/// Decides how many VUs run and for how long.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Executor {
    /// Ramp the number of looping VUs through stages.
    RampingVus {
        /// VUs running when the schedule starts
        start_vus: usize,
        /// Stages, run in order
        stages: Vec<Stage>,
    },
    /// Run a fixed number of VUs that each run a fixed number of iterations.
    PerVuIterations {
        /// Number of VUs
        vus: usize,
        /// Iterations per VU
        iterations: usize,
    },
}

impl Executor {
    /// Ramp up to `max_vus` over the first 20% of `duration`, hold for 60% and
    /// ramp down over the last 20%.
    pub fn ramping(max_vus: usize, duration: Duration) -> Self {
        let edge = duration.mul_f64(0.2);
        Executor::RampingVus {
            start_vus: 0,
            stages: vec![
                Stage {
                    duration: edge,
                    target: max_vus,
                },
                Stage {
                    duration: duration.saturating_sub(edge * 2),
                    target: max_vus,
                },
                Stage {
                    duration: edge,
                    target: 0,
                },
            ],
        }
    }

    /// Largest number of VUs the executor may run at once.
    pub fn max_vus(&self) -> usize {
        match self {
            Executor::RampingVus { start_vus, stages } => stages
                .iter()
                .map(|stage| stage.target)
                .fold(*start_vus, usize::max),
            Executor::PerVuIterations { vus, .. } => *vus,
        }
    }

    /// Number of VUs that should be running `elapsed` after the start of a
    /// ramping schedule. None once every stage has completed.
    pub fn target_vus_at(&self, elapsed: Duration) -> Option<usize> {
        let Executor::RampingVus { start_vus, stages } = self else {
            return None;
        };
        let mut from = *start_vus;
        let mut remaining = elapsed;
        for stage in stages {
            if remaining < stage.duration {
                let progress = remaining.as_secs_f64() / stage.duration.as_secs_f64();
                let vus = from as f64 + (stage.target as f64 - from as f64) * progress;
                return Some(vus.round() as usize);
            }
            remaining -= stage.duration;
            from = stage.target;
        }
        None
    }
}

/// Counts kept while the schedule runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScheduleStats {
    /// Iterations that ran to completion
    pub iterations_completed: usize,
    /// Iterations dropped because the graceful stop budget expired
    pub iterations_interrupted: usize,
    /// Most VUs running at the same time
    pub max_active_vus: usize,
}

#[derive(Debug, Default)]
struct Counters {
    completed: AtomicUsize,
    interrupted: AtomicUsize,
    max_active: AtomicUsize,
}

struct Slot {
    iterations: Arc<AtomicUsize>,
    stop: Option<CancellationToken>,
}

struct Pool<F> {
    tracker: TaskTracker,
    cancellation: CancellationToken,
    hard_stop: CancellationToken,
    iteration: Arc<F>,
    counters: Arc<Counters>,
    slots: Vec<Slot>,
}

impl<F, Fut> Pool<F>
where
    F: Fn(usize, usize) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn new(cancellation: CancellationToken, iteration: F) -> Self {
        Self {
            tracker: TaskTracker::new(),
            cancellation,
            hard_stop: CancellationToken::new(),
            iteration: Arc::new(iteration),
            counters: Arc::default(),
            slots: Vec::new(),
        }
    }

    fn active(&self) -> usize {
        self.slots.iter().filter(|slot| slot.stop.is_some()).count()
    }

    /// Start or stop VUs until `target` are active. Stopped VUs finish their
    /// current iteration, their slot keeps its iteration count so names stay
    /// unique when the slot is reused.
    fn scale_to(&mut self, target: usize, iterations: Option<usize>) {
        let mut active = self.active();
        while active < target {
            let idx = match self.slots.iter().position(|slot| slot.stop.is_none()) {
                Some(idx) => idx,
                None => {
                    self.slots.push(Slot {
                        iterations: Arc::default(),
                        stop: None,
                    });
                    self.slots.len() - 1
                }
            };
            let stop = self.cancellation.child_token();
            self.tracker.spawn(run_vu(
                idx + 1,
                iterations,
                self.slots[idx].iterations.clone(),
                stop.clone(),
                self.hard_stop.clone(),
                self.iteration.clone(),
                self.counters.clone(),
            ));
            self.slots[idx].stop = Some(stop);
            active += 1;
        }
        while active > target {
            if let Some(slot) = self.slots.iter_mut().rev().find(|slot| slot.stop.is_some()) {
                if let Some(stop) = slot.stop.take() {
                    stop.cancel();
                }
            }
            active -= 1;
        }
        self.counters.max_active.fetch_max(active, Ordering::Relaxed);
    }

    async fn finish(mut self, graceful_stop: Duration) -> ScheduleStats {
        self.scale_to(0, None);
        self.tracker.close();
        if tokio::time::timeout(graceful_stop, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                ?graceful_stop,
                "graceful stop expired, interrupting in-flight iterations"
            );
            self.hard_stop.cancel();
            self.tracker.wait().await;
        }
        ScheduleStats {
            iterations_completed: self.counters.completed.load(Ordering::Relaxed),
            iterations_interrupted: self.counters.interrupted.load(Ordering::Relaxed),
            max_active_vus: self.counters.max_active.load(Ordering::Relaxed),
        }
    }
}

async fn run_vu<F, Fut>(
    vu: usize,
    limit: Option<usize>,
    iterations: Arc<AtomicUsize>,
    stop: CancellationToken,
    hard_stop: CancellationToken,
    iteration: Arc<F>,
    counters: Arc<Counters>,
) where
    F: Fn(usize, usize) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    debug!(vu, "vu started");
    let mut ran = 0;
    while !stop.is_cancelled() && limit.map_or(true, |limit| ran < limit) {
        let n = iterations.fetch_add(1, Ordering::Relaxed);
        select! {
            biased;
            _ = hard_stop.cancelled() => {
                counters.interrupted.fetch_add(1, Ordering::Relaxed);
                break;
            }
            _ = iteration(vu, n) => {
                counters.completed.fetch_add(1, Ordering::Relaxed);
            }
        }
        ran += 1;
    }
    debug!(vu, ran, "vu stopped");
}

/// Run `iteration(vu, iteration)` according to the executor.
///
/// Returns once every VU has stopped. Cancelling `cancellation` stops the
/// schedule early, in-flight iterations still get `graceful_stop` to finish.
#[tracing::instrument(skip_all)]
pub async fn execute<F, Fut>(
    executor: &Executor,
    graceful_stop: Duration,
    cancellation: CancellationToken,
    iteration: F,
) -> ScheduleStats
where
    F: Fn(usize, usize) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut pool = Pool::new(cancellation.clone(), iteration);
    match executor {
        Executor::PerVuIterations { vus, iterations } => {
            info!(vus, iterations, "starting per vu iterations");
            pool.scale_to(*vus, Some(*iterations));
            pool.tracker.close();
            select! {
                _ = cancellation.cancelled() => info!("schedule cancelled"),
                _ = pool.tracker.wait() => {}
            }
        }
        Executor::RampingVus { .. } => {
            info!(max_vus = executor.max_vus(), "starting ramping vus");
            let start = Instant::now();
            let mut ticker = tokio::time::interval(RAMP_TICK);
            loop {
                select! {
                    biased;
                    _ = cancellation.cancelled() => {
                        info!("schedule cancelled");
                        break;
                    }
                    _ = ticker.tick() => {}
                }
                let Some(target) = executor.target_vus_at(start.elapsed()) else {
                    break;
                };
                if target != pool.active() {
                    debug!(target, active = pool.active(), "scaling vus");
                    pool.scale_to(target, None);
                }
            }
        }
    }
    let stats = pool.finish(graceful_stop).await;
    info!(?stats, "schedule finished");
    stats
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeSet, sync::Mutex};

    use test_log::test;

    use super::*;

    #[test]
    fn durations() {
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("15s").unwrap(), Duration::from_secs(15));
        assert_eq!(parse_duration("10m").unwrap(), Duration::from_secs(600));
        assert_eq!(
            parse_duration("1h30m10s").unwrap(),
            Duration::from_secs(5410)
        );
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10").is_ok());
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("m").is_err());
        assert!(parse_duration("1.5s").is_err());
    }

    #[test]
    fn stages() {
        assert_eq!(
            "30s:10".parse::<Stage>().unwrap(),
            Stage {
                duration: Duration::from_secs(30),
                target: 10
            }
        );
        assert!("30s".parse::<Stage>().is_err());
        assert!("30s:ten".parse::<Stage>().is_err());
    }

    #[test]
    fn ramping_interpolates_between_stages() {
        let executor = Executor::ramping(10, Duration::from_secs(100));
        assert_eq!(executor.max_vus(), 10);
        assert_eq!(executor.target_vus_at(Duration::ZERO), Some(0));
        assert_eq!(executor.target_vus_at(Duration::from_secs(10)), Some(5));
        assert_eq!(executor.target_vus_at(Duration::from_secs(20)), Some(10));
        assert_eq!(executor.target_vus_at(Duration::from_secs(79)), Some(10));
        assert_eq!(executor.target_vus_at(Duration::from_secs(90)), Some(5));
        assert_eq!(executor.target_vus_at(Duration::from_secs(100)), None);

        let per_vu = Executor::PerVuIterations {
            vus: 3,
            iterations: 2,
        };
        assert_eq!(per_vu.max_vus(), 3);
        assert_eq!(per_vu.target_vus_at(Duration::ZERO), None);
    }

    #[test(tokio::test(start_paused = true))]
    async fn per_vu_iterations_run_each_pair_once() {
        let seen = Arc::new(Mutex::new(BTreeSet::new()));
        let record = seen.clone();
        let stats = execute(
            &Executor::PerVuIterations {
                vus: 3,
                iterations: 2,
            },
            Duration::from_secs(30),
            CancellationToken::new(),
            move |vu, iteration| {
                let record = record.clone();
                async move {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    record.lock().unwrap().insert((vu, iteration));
                }
            },
        )
        .await;
        assert_eq!(
            stats,
            ScheduleStats {
                iterations_completed: 6,
                iterations_interrupted: 0,
                max_active_vus: 3,
            }
        );
        let expected: BTreeSet<_> = (1..=3)
            .flat_map(|vu| (0..2).map(move |it| (vu, it)))
            .collect();
        assert_eq!(*seen.lock().unwrap(), expected);
    }

    #[test(tokio::test(start_paused = true))]
    async fn ramping_runs_until_last_stage() {
        let stats = execute(
            &Executor::RampingVus {
                start_vus: 2,
                stages: vec![Stage {
                    duration: Duration::from_secs(10),
                    target: 2,
                }],
            },
            Duration::from_secs(30),
            CancellationToken::new(),
            |_, _| tokio::time::sleep(Duration::from_secs(3)),
        )
        .await;
        assert_eq!(stats.max_active_vus, 2);
        assert_eq!(stats.iterations_interrupted, 0);
        // Each VU starts iterations at 0s, 3s, 6s and 9s and finishes the last one.
        assert_eq!(stats.iterations_completed, 8);
    }

    #[test(tokio::test(start_paused = true))]
    async fn graceful_stop_interrupts_stuck_iterations() {
        let cancellation = CancellationToken::new();
        let signal = cancellation.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            signal.cancel();
        });
        let stats = execute(
            &Executor::PerVuIterations {
                vus: 2,
                iterations: 1,
            },
            Duration::from_secs(5),
            cancellation,
            |_, _| std::future::pending::<()>(),
        )
        .await;
        assert_eq!(stats.iterations_completed, 0);
        assert_eq!(stats.iterations_interrupted, 2);
    }
}
