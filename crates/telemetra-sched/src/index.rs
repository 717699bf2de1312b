//! Registry of transfer methods and the triggers that launch them.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{Local, Timelike};
use parking_lot::Mutex;
use telemetra_core::message::HookToUri;
use telemetra_core::{Message, Metric, Payload, SendOptions, TimeUuid, Uplink};
use telemetra_store::LocalStore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cron::LocalTime;
use crate::runtime::{execute, Trigger};
use crate::transfer_method::TransferMethod;

#[derive(Debug, Clone, Copy)]
pub struct IndexConfig {
    /// How long to wait for the server to acknowledge a hook.
    pub hook_timeout: Duration,
    /// Delay between attempts to enable a job whose hooks failed.
    pub retry_delay: Duration,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            hook_timeout: Duration::from_secs(30),
            retry_delay: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    pub id: Uuid,
    pub name: String,
    pub enabled: bool,
    pub first_enabled: Option<TimeUuid>,
    pub last_exec: Option<TimeUuid>,
    pub retry_pending: bool,
}

enum EnableOutcome {
    Enabled,
    AlreadyEnabled,
    Unknown,
    HookFailed(String),
}

#[derive(Default)]
struct IndexState {
    enabled: HashMap<Uuid, Arc<TransferMethod>>,
    disabled: HashMap<Uuid, Arc<TransferMethod>>,
    first_enabled: HashMap<Uuid, TimeUuid>,
    by_metric: HashMap<String, HashSet<Uuid>>,
    by_activation: HashMap<String, HashSet<Uuid>>,
    retries: HashMap<Uuid, JoinHandle<()>>,
    cron_loop: Option<JoinHandle<()>>,
    closed: bool,
}

impl IndexState {
    fn job(&self, id: &Uuid) -> Option<&Arc<TransferMethod>> {
        self.enabled.get(id).or_else(|| self.disabled.get(id))
    }

    fn abort_retry(&mut self, id: &Uuid) {
        if let Some(handle) = self.retries.remove(id) {
            handle.abort();
        }
    }
}

struct Shared {
    store: Arc<LocalStore>,
    uplink: Arc<dyn Uplink>,
    config: IndexConfig,
    state: Mutex<IndexState>,
}

/// Enabled and disabled transfer methods, indexed by the metrics they
/// produce and the metrics that activate them. Cheap to clone.
#[derive(Clone)]
pub struct TransferMethodsIndex {
    shared: Arc<Shared>,
}

impl TransferMethodsIndex {
    pub fn new(store: Arc<LocalStore>, uplink: Arc<dyn Uplink>) -> Self {
        Self::with_config(store, uplink, IndexConfig::default())
    }

    pub fn with_config(store: Arc<LocalStore>, uplink: Arc<dyn Uplink>, config: IndexConfig) -> Self {
        TransferMethodsIndex {
            shared: Arc::new(Shared {
                store,
                uplink,
                config,
                state: Mutex::new(IndexState::default()),
            }),
        }
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.shared.store
    }

    fn key(&self, metric: &Metric) -> String {
        metric.global_uri(self.shared.store.owner())
    }

    /// Registers a job, disabled. Returns `false` if the id is taken.
    /// With `enable` set the job is then enabled, which may fail and retry
    /// in the background without affecting the result.
    pub async fn add(&self, job: TransferMethod, enable: bool) -> bool {
        let id = job.id();
        {
            let mut state = self.shared.state.lock();
            if state.job(&id).is_some() {
                return false;
            }
            for metric in job.target_metrics() {
                state.by_metric.entry(self.key(metric)).or_default().insert(id);
            }
            for metric in job.schedule_ref().activation_metrics() {
                state
                    .by_activation
                    .entry(self.key(metric))
                    .or_default()
                    .insert(id);
            }
            for (metric, reqs) in job.data_reqs() {
                self.shared.store.set_requirements(metric, *reqs);
            }
            debug!(job = %job.name(), %id, "scheduler.job_added");
            state.disabled.insert(id, Arc::new(job));
        }
        if enable {
            self.enable(id).await;
        }
        true
    }

    /// Moves a job to the enabled set after hooking the metrics it reads.
    ///
    /// A failed hook leaves the job disabled and schedules a background
    /// retry.
    pub async fn enable(&self, id: Uuid) -> bool {
        match self.try_enable(id).await {
            EnableOutcome::Enabled | EnableOutcome::AlreadyEnabled => true,
            EnableOutcome::Unknown => false,
            EnableOutcome::HookFailed(uri) => {
                warn!(%id, uri = %uri, "scheduler.enable_failed");
                self.schedule_retry(id);
                false
            }
        }
    }

    async fn try_enable(&self, id: Uuid) -> EnableOutcome {
        let job = {
            let state = self.shared.state.lock();
            if state.enabled.contains_key(&id) {
                return EnableOutcome::AlreadyEnabled;
            }
            match state.disabled.get(&id) {
                Some(job) => job.clone(),
                None => return EnableOutcome::Unknown,
            }
        };
        let mut needed: Vec<&Metric> = job.schedule_ref().activation_metrics().iter().collect();
        needed.extend(job.data_reqs().keys());
        for metric in needed {
            if self.shared.store.is_hooked(metric) {
                continue;
            }
            if !self.hook(metric).await {
                return EnableOutcome::HookFailed(metric.uri().to_string());
            }
        }

        let run_now = {
            let mut state = self.shared.state.lock();
            let Some(job) = state.disabled.remove(&id) else {
                // deleted or enabled while hooks were in flight
                return if state.enabled.contains_key(&id) {
                    EnableOutcome::AlreadyEnabled
                } else {
                    EnableOutcome::Unknown
                };
            };
            state.enabled.insert(id, job.clone());
            // the retry task may be the caller, detach rather than abort
            state.retries.remove(&id);
            let first = !state.first_enabled.contains_key(&id);
            if first {
                state.first_enabled.insert(id, TimeUuid::now());
            }
            (first && job.runs_on_load()).then_some(job)
        };
        info!(job = %job.name(), %id, "scheduler.job_enabled");
        if let Some(job) = run_now {
            self.spawn_job(job, Trigger::at(TimeUuid::now()));
        }
        EnableOutcome::Enabled
    }

    async fn hook(&self, metric: &Metric) -> bool {
        let hook = match HookToUri::new(metric.uri()) {
            Ok(hook) => hook,
            Err(err) => {
                warn!(error = %err, "scheduler.hook_invalid");
                return false;
            }
        };
        let options = SendOptions::no_defer().with_timeout(self.shared.config.hook_timeout);
        let reply = self
            .shared
            .uplink
            .send_message(Message::new(hook), options)
            .await;
        match reply.as_ref().map(Message::payload) {
            Some(Payload::GenericResponse(response)) if response.is_success() => {
                self.shared.store.mark_hooked(metric);
                true
            }
            Some(Payload::GenericResponse(response)) => {
                debug!(
                    uri = %metric.uri(),
                    status = response.status(),
                    reason = response.reason().unwrap_or(""),
                    "scheduler.hook_refused"
                );
                false
            }
            _ => false,
        }
    }

    fn schedule_retry(&self, id: Uuid) {
        let mut state = self.shared.state.lock();
        if state.closed {
            return;
        }
        if let Some(handle) = state.retries.get(&id) {
            if !handle.is_finished() {
                return;
            }
        }
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let delay = self.shared.config.retry_delay;
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(delay).await;
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                let index = TransferMethodsIndex { shared };
                match index.try_enable(id).await {
                    EnableOutcome::HookFailed(uri) => {
                        debug!(%id, uri = %uri, "scheduler.retry_failed");
                    }
                    _ => {
                        index.shared.state.lock().retries.remove(&id);
                        return;
                    }
                }
            }
        });
        state.retries.insert(id, handle);
    }

    /// Idempotent; unknown ids return `false`.
    pub fn disable(&self, id: Uuid) -> bool {
        let mut state = self.shared.state.lock();
        state.abort_retry(&id);
        if let Some(job) = state.enabled.remove(&id) {
            info!(job = %job.name(), %id, "scheduler.job_disabled");
            state.disabled.insert(id, job);
            return true;
        }
        state.disabled.contains_key(&id)
    }

    pub fn disable_all(&self) {
        let ids: Vec<Uuid> = self.shared.state.lock().enabled.keys().copied().collect();
        for id in ids {
            self.disable(id);
        }
    }

    pub fn delete(&self, id: Uuid) {
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        state.abort_retry(&id);
        state.enabled.remove(&id);
        state.disabled.remove(&id);
        state.first_enabled.remove(&id);
        for index in [&mut state.by_metric, &mut state.by_activation] {
            index.retain(|_, ids| {
                ids.remove(&id);
                !ids.is_empty()
            });
        }
    }

    pub fn is_enabled(&self, id: Uuid) -> bool {
        self.shared.state.lock().enabled.contains_key(&id)
    }

    pub fn job(&self, id: Uuid) -> Option<Arc<TransferMethod>> {
        self.shared.state.lock().job(&id).cloned()
    }

    /// Jobs producing `metric`.
    pub fn producers_of(&self, metric: &Metric) -> Vec<Uuid> {
        let key = self.key(metric);
        let mut ids: Vec<Uuid> = self
            .shared
            .state
            .lock()
            .by_metric
            .get(&key)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Launches every enabled job activated by one of `metrics`, at most
    /// once per job. Returns the launched job ids.
    pub fn metrics_updated(
        &self,
        t: TimeUuid,
        metrics: &[Metric],
        in_reply_to: Option<TimeUuid>,
    ) -> Vec<Uuid> {
        let mut launches: BTreeMap<Uuid, (Arc<TransferMethod>, Vec<Metric>)> = BTreeMap::new();
        {
            let state = self.shared.state.lock();
            for metric in metrics {
                let Some(ids) = state.by_activation.get(&self.key(metric)) else {
                    continue;
                };
                for id in ids {
                    if let Some(job) = state.enabled.get(id) {
                        let entry = launches
                            .entry(*id)
                            .or_insert_with(|| (job.clone(), Vec::new()));
                        if !entry.1.contains(metric) {
                            entry.1.push(metric.clone());
                        }
                    }
                }
            }
        }
        let ids: Vec<Uuid> = launches.keys().copied().collect();
        for (job, updated) in launches.into_values() {
            self.spawn_job(
                job,
                Trigger {
                    ts: t,
                    updated,
                    in_reply_to,
                },
            );
        }
        ids
    }

    pub fn get_cron_matches(&self, time: &LocalTime) -> Vec<Arc<TransferMethod>> {
        let state = self.shared.state.lock();
        let mut jobs: Vec<_> = state
            .enabled
            .values()
            .filter(|job| job.schedule_ref().matches_time(time))
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.id());
        jobs
    }

    /// Launches the cron jobs due at `time`.
    pub fn run_cron(&self, time: &LocalTime) -> Vec<Uuid> {
        let now = TimeUuid::now();
        self.get_cron_matches(time)
            .into_iter()
            .map(|job| {
                let id = job.id();
                self.spawn_job(job, Trigger::at(now));
                id
            })
            .collect()
    }

    /// Evaluates cron schedules at the start of every minute until
    /// [`close`](Self::close).
    pub fn start_cron_loop(&self) {
        let mut state = self.shared.state.lock();
        if state.closed || state.cron_loop.is_some() {
            return;
        }
        let weak = Arc::downgrade(&self.shared);
        state.cron_loop = Some(tokio::spawn(async move {
            loop {
                let now = Local::now();
                let into_minute =
                    u64::from(now.second()) * 1_000 + u64::from(now.nanosecond() / 1_000_000).min(999);
                tokio::time::sleep(Duration::from_millis(60_000 - into_minute)).await;
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                let index = TransferMethodsIndex { shared };
                let launched = index.run_cron(&LocalTime::now());
                if !launched.is_empty() {
                    debug!(count = launched.len(), "scheduler.cron_tick");
                }
                index.shared.store.maybe_purge();
            }
        }));
    }

    fn spawn_job(&self, job: Arc<TransferMethod>, trigger: Trigger) {
        tokio::spawn(execute(
            self.shared.store.clone(),
            self.shared.uplink.clone(),
            job,
            trigger,
        ));
    }

    pub fn status(&self) -> Vec<JobStatus> {
        let state = self.shared.state.lock();
        let mut status: Vec<JobStatus> = state
            .enabled
            .iter()
            .map(|(id, job)| (id, job, true))
            .chain(state.disabled.iter().map(|(id, job)| (id, job, false)))
            .map(|(id, job, enabled)| JobStatus {
                id: *id,
                name: job.name().to_string(),
                enabled,
                first_enabled: state.first_enabled.get(id).copied(),
                last_exec: job.last_exec(),
                retry_pending: state
                    .retries
                    .get(id)
                    .map(|handle| !handle.is_finished())
                    .unwrap_or(false),
            })
            .collect();
        status.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        status
    }

    /// Cancels hook retries and the cron loop.
    pub fn close(&self) {
        let mut state = self.shared.state.lock();
        state.closed = true;
        for (_, handle) in state.retries.drain() {
            handle.abort();
        }
        if let Some(handle) = state.cron_loop.take() {
            handle.abort();
        }
    }
}
