//! Process Tracker - periodic resource sampling for live processes
//!
//! Every spawned process is registered by handle id. A sampling loop reads
//! CPU and resident memory through `sysinfo`, integrating CPU usage over the
//! sampling interval and keeping the peak RSS. Exited processes are retired
//! into a bounded history.
//!
//! The pid index holds at most one live handle per pid. Sampling works on a
//! snapshot of the live set; an entry retired mid-sample is skipped, and a
//! process that vanished before it could be read is simply not updated.

use crate::process::HandleId;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::{Pid, System};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use warden_foundation::TrackerConfig;

/// Sampled usage for one process
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceMetrics {
    /// Integrated from CPU usage samples; approximate
    pub cpu_time: Duration,
    pub peak_rss_bytes: u64,
    pub current_rss_bytes: u64,
    /// Filled in by the owner from its output buffers
    pub output_bytes: u64,
    pub samples: u32,
}

/// One tracked process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedProcess {
    pub handle_id: HandleId,
    pub pid: u32,
    pub label: String,
    pub started_at: DateTime<Utc>,
    pub retired_at: Option<DateTime<Utc>>,
    pub metrics: ResourceMetrics,
    #[serde(skip)]
    last_sample: Option<Instant>,
}

#[derive(Debug, Default)]
struct TrackerState {
    live: HashMap<HandleId, TrackedProcess>,
    by_pid: HashMap<u32, HandleId>,
    history: VecDeque<TrackedProcess>,
}

#[derive(Debug)]
struct TrackerInner {
    state: Mutex<TrackerState>,
    system: Mutex<System>,
    interval: Duration,
    history_size: usize,
    sampler: Mutex<Option<JoinHandle<()>>>,
}

/// Shared tracker; clones refer to the same registry
#[derive(Debug, Clone)]
pub struct ProcessTracker {
    inner: Arc<TrackerInner>,
}

impl ProcessTracker {
    pub fn new(config: &TrackerConfig) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                state: Mutex::new(TrackerState::default()),
                system: Mutex::new(System::new()),
                interval: config.sample_interval(),
                history_size: config.history_size,
                sampler: Mutex::new(None),
            }),
        }
    }

    /// Start tracking a process. A stale entry for the same pid (its process
    /// was reaped and the pid reused) is retired first.
    pub fn register(&self, handle_id: HandleId, pid: u32, label: &str) {
        let mut state = self.inner.state.lock();

        if let Some(stale) = state.by_pid.get(&pid).copied() {
            warn!(pid, stale = %stale, "Pid reused while still tracked, retiring old entry");
            Self::retire_locked(&mut state, stale, self.inner.history_size);
        }

        state.by_pid.insert(pid, handle_id);
        state.live.insert(
            handle_id,
            TrackedProcess {
                handle_id,
                pid,
                label: label.to_string(),
                started_at: Utc::now(),
                retired_at: None,
                metrics: ResourceMetrics::default(),
                last_sample: None,
            },
        );
        debug!(handle = %handle_id, pid, label, "Tracking process");
    }

    /// Move an entry to history. Unknown ids are ignored.
    pub fn retire(&self, handle_id: HandleId) {
        let mut state = self.inner.state.lock();
        Self::retire_locked(&mut state, handle_id, self.inner.history_size);
    }

    fn retire_locked(state: &mut TrackerState, handle_id: HandleId, history_size: usize) {
        let Some(mut entry) = state.live.remove(&handle_id) else {
            return;
        };
        if state.by_pid.get(&entry.pid) == Some(&handle_id) {
            state.by_pid.remove(&entry.pid);
        }
        entry.retired_at = Some(Utc::now());

        if history_size == 0 {
            return;
        }
        while state.history.len() >= history_size {
            state.history.pop_front();
        }
        state.history.push_back(entry);
    }

    /// Metrics for a live or retired handle
    pub fn metrics(&self, handle_id: HandleId) -> Option<ResourceMetrics> {
        let state = self.inner.state.lock();
        state
            .live
            .get(&handle_id)
            .or_else(|| state.history.iter().rev().find(|e| e.handle_id == handle_id))
            .map(|e| e.metrics.clone())
    }

    pub fn handle_for_pid(&self, pid: u32) -> Option<HandleId> {
        self.inner.state.lock().by_pid.get(&pid).copied()
    }

    pub fn live_count(&self) -> usize {
        self.inner.state.lock().live.len()
    }

    pub fn live(&self) -> Vec<TrackedProcess> {
        let mut live: Vec<_> = self.inner.state.lock().live.values().cloned().collect();
        live.sort_by_key(|e| e.handle_id);
        live
    }

    /// Retired entries, oldest first
    pub fn history(&self) -> Vec<TrackedProcess> {
        self.inner.state.lock().history.iter().cloned().collect()
    }

    /// Take one sample of every live process
    pub fn sample_once(&self) {
        let targets: Vec<(HandleId, u32)> = {
            let state = self.inner.state.lock();
            state.live.values().map(|e| (e.handle_id, e.pid)).collect()
        };
        if targets.is_empty() {
            return;
        }

        let mut readings = Vec::with_capacity(targets.len());
        {
            let mut system = self.inner.system.lock();
            for (handle_id, pid) in targets {
                let sys_pid = Pid::from_u32(pid);
                if !system.refresh_process(sys_pid) {
                    // Exited between enumeration and sampling
                    continue;
                }
                if let Some(process) = system.process(sys_pid) {
                    readings.push((handle_id, process.cpu_usage(), process.memory()));
                }
            }
        }

        let now = Instant::now();
        let mut state = self.inner.state.lock();
        for (handle_id, cpu_percent, rss) in readings {
            // Retired while we were sampling
            let Some(entry) = state.live.get_mut(&handle_id) else {
                continue;
            };
            let metrics = &mut entry.metrics;
            if let Some(last) = entry.last_sample {
                let elapsed = now.duration_since(last).as_secs_f64();
                let busy = elapsed * f64::from(cpu_percent.max(0.0)) / 100.0;
                metrics.cpu_time += Duration::from_secs_f64(busy);
            }
            metrics.current_rss_bytes = rss;
            metrics.peak_rss_bytes = metrics.peak_rss_bytes.max(rss);
            metrics.samples += 1;
            entry.last_sample = Some(now);
        }
    }

    /// Start the periodic sampling loop (idempotent). Needs a Tokio runtime.
    pub fn start(&self) {
        let mut sampler = self.inner.sampler.lock();
        if sampler.is_some() {
            return;
        }

        let tracker = self.clone();
        let interval = self.inner.interval;
        *sampler = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let tracker = tracker.clone();
                if tokio::task::spawn_blocking(move || tracker.sample_once())
                    .await
                    .is_err()
                {
                    warn!("Resource sampling task failed");
                }
            }
        }));
        debug!(?interval, "Process tracker started");
    }

    /// Stop the sampling loop
    pub fn stop(&self) {
        if let Some(handle) = self.inner.sampler.lock().take() {
            handle.abort();
            debug!("Process tracker stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.sampler.lock().is_some()
    }
}
