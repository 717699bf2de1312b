//! Job definitions: what a transfer method produces, when it runs and what
//! it is handed when it does.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use telemetra_core::{DataRequirements, Metric, Sample, SampleValue, TimeUuid};
use uuid::Uuid;

use crate::schedule::Schedule;
use crate::transaction::Transaction;
use crate::JobError;

/// Context values a job asks for. Only declared arguments are filled in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobArg {
    /// Time of the trigger.
    Ts,
    /// Activation metrics that changed.
    Updated,
    /// Activation metrics that did not change.
    Others,
    /// Stored rows of every metric the job declared requirements for.
    Data,
}

#[derive(Debug, Clone, Default)]
pub struct JobContext {
    pub ts: Option<TimeUuid>,
    pub updated: Vec<Metric>,
    pub others: Vec<Metric>,
    pub data: HashMap<Metric, Vec<(TimeUuid, SampleValue)>>,
    pub in_reply_to: Option<TimeUuid>,
    pub transaction: Transaction,
}

pub type JobFuture = BoxFuture<'static, Result<Vec<Sample>, JobError>>;
pub type JobFn = Arc<dyn Fn(JobContext) -> JobFuture + Send + Sync>;

pub struct TransferMethod {
    id: Uuid,
    name: String,
    targets: Vec<Metric>,
    min_exec_delta: Option<Duration>,
    data_reqs: HashMap<Metric, DataRequirements>,
    schedule: Schedule,
    exec_on_load: bool,
    args: Vec<JobArg>,
    func: JobFn,
    last_exec: Mutex<Option<TimeUuid>>,
}

impl TransferMethod {
    pub fn new<F, Fut>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<Sample>, JobError>> + Send + 'static,
    {
        TransferMethod {
            id: Uuid::new_v4(),
            name: name.into(),
            targets: Vec::new(),
            min_exec_delta: None,
            data_reqs: HashMap::new(),
            schedule: Schedule::Dummy,
            exec_on_load: false,
            args: Vec::new(),
            func: Arc::new(move |ctx| func(ctx).boxed()),
            last_exec: Mutex::new(None),
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn targets(mut self, targets: impl IntoIterator<Item = Metric>) -> Self {
        self.targets = targets.into_iter().collect();
        self
    }

    pub fn schedule(mut self, schedule: impl Into<Schedule>) -> Self {
        self.schedule = schedule.into();
        self
    }

    pub fn min_exec_delta(mut self, delta: Duration) -> Self {
        self.min_exec_delta = Some(delta);
        self
    }

    pub fn data_requirement(mut self, metric: Metric, reqs: DataRequirements) -> Self {
        self.data_reqs.insert(metric, reqs);
        self
    }

    pub fn exec_on_load(mut self, exec_on_load: bool) -> Self {
        self.exec_on_load = exec_on_load;
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = JobArg>) -> Self {
        self.args = args.into_iter().collect();
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target_metrics(&self) -> &[Metric] {
        &self.targets
    }

    pub fn schedule_ref(&self) -> &Schedule {
        &self.schedule
    }

    pub fn data_reqs(&self) -> &HashMap<Metric, DataRequirements> {
        &self.data_reqs
    }

    pub fn runs_on_load(&self) -> bool {
        self.exec_on_load
    }

    pub fn declares(&self, arg: JobArg) -> bool {
        self.args.contains(&arg)
    }

    pub fn last_exec(&self) -> Option<TimeUuid> {
        *self.last_exec.lock()
    }

    /// Records a run at `now` unless the previous one is closer than
    /// `min_exec_delta`. Returns whether the run may go ahead.
    pub(crate) fn try_start(&self, now: TimeUuid) -> bool {
        let mut last = self.last_exec.lock();
        if let (Some(delta), Some(previous)) = (self.min_exec_delta, *last) {
            let elapsed = now.timestamp_micros().saturating_sub(previous.timestamp_micros());
            if u128::try_from(elapsed).unwrap_or(0) < delta.as_micros() {
                return false;
            }
        }
        *last = Some(now);
        true
    }

    pub(crate) fn call(&self, ctx: JobContext) -> JobFuture {
        (self.func)(ctx)
    }
}

impl fmt::Debug for TransferMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferMethod")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("targets", &self.targets)
            .field("schedule", &self.schedule)
            .field("exec_on_load", &self.exec_on_load)
            .finish()
    }
}
