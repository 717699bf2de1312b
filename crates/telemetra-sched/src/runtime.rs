//! Executes transfer methods and ships what they produce.

use std::collections::BTreeMap;
use std::sync::Arc;

use telemetra_core::message::{MultiDataEntry, SendDpData, SendDsData, SendMultiData};
use telemetra_core::{
    Message, MessageError, Metric, Payload, Sample, SampleValue, SendOptions, TimeUuid, Uplink,
    MIN_TIMEUUID,
};
use telemetra_store::LocalStore;
use tracing::{debug, info, warn};

use crate::transaction::Transaction;
use crate::transfer_method::{JobArg, JobContext, TransferMethod};

/// Why a job is being run.
#[derive(Debug, Clone)]
pub(crate) struct Trigger {
    pub ts: TimeUuid,
    pub updated: Vec<Metric>,
    pub in_reply_to: Option<TimeUuid>,
}

impl Trigger {
    pub fn at(ts: TimeUuid) -> Self {
        Trigger {
            ts,
            updated: Vec::new(),
            in_reply_to: None,
        }
    }
}

pub(crate) fn build_context(store: &LocalStore, job: &TransferMethod, trigger: &Trigger) -> JobContext {
    let mut ctx = JobContext {
        transaction: Transaction::new(),
        in_reply_to: trigger.in_reply_to,
        ..JobContext::default()
    };
    if job.declares(JobArg::Ts) {
        ctx.ts = Some(trigger.ts);
    }
    let activation = job.schedule_ref().activation_metrics();
    if job.declares(JobArg::Updated) {
        ctx.updated = trigger.updated.clone();
    }
    if job.declares(JobArg::Others) {
        ctx.others = activation
            .iter()
            .filter(|metric| !trigger.updated.contains(metric))
            .cloned()
            .collect();
    }
    if job.declares(JobArg::Data) {
        for (metric, reqs) in job.data_reqs() {
            let start = reqs.past_delta.map(|delta| {
                let delta = i64::try_from(delta.as_micros()).unwrap_or(i64::MAX);
                TimeUuid::lowest(trigger.ts.timestamp_micros().saturating_sub(delta))
                    .unwrap_or(MIN_TIMEUUID)
            });
            let count = reqs
                .past_count
                .map(|count| usize::try_from(count).unwrap_or(usize::MAX));
            let rows = match (start, count) {
                (None, None) => store.get_series(metric, None, None, None),
                (start, count) => store.get_series(metric, None, start.or(Some(MIN_TIMEUUID)), count),
            };
            ctx.data.insert(metric.clone(), rows);
        }
        for metric in activation {
            if !ctx.data.contains_key(metric) {
                ctx.data
                    .insert(metric.clone(), store.get_series(metric, None, None, None));
            }
        }
    }
    ctx
}

/// Runs `job` once, committing its samples only when it succeeds.
pub(crate) async fn execute(
    store: Arc<LocalStore>,
    uplink: Arc<dyn Uplink>,
    job: Arc<TransferMethod>,
    trigger: Trigger,
) {
    if !job.try_start(TimeUuid::now()) {
        debug!(job = %job.name(), "scheduler.job_throttled");
        return;
    }
    let ctx = build_context(&store, &job, &trigger);
    let transaction = ctx.transaction.clone();
    debug!(job = %job.name(), updated = trigger.updated.len(), "scheduler.job_started");
    match job.call(ctx).await {
        Ok(mut samples) => {
            samples.extend(transaction.take());
            let fresh = commit(&store, samples);
            if fresh.is_empty() {
                return;
            }
            info!(job = %job.name(), samples = fresh.len(), "scheduler.job_committed");
            send_samples(uplink.as_ref(), fresh, SendOptions::default()).await;
        }
        Err(err) => {
            let dropped = transaction.take().len();
            warn!(job = %job.name(), error = %err, dropped, "scheduler.job_failed");
        }
    }
}

/// Inserts samples into the store, keeping the ones it did not have yet.
fn commit(store: &LocalStore, samples: Vec<Sample>) -> Vec<Sample> {
    samples
        .into_iter()
        .filter(|sample| match store.insert(sample) {
            Ok(inserted) => inserted,
            Err(err) => {
                warn!(error = %err, "scheduler.sample_rejected");
                false
            }
        })
        .collect()
}

/// Groups samples by timestamp: a lone sample becomes a single-metric data
/// message, several sharing an instant become one multi-data message.
pub fn samples_to_messages(samples: Vec<Sample>) -> Result<Vec<Message>, MessageError> {
    let mut by_time: BTreeMap<TimeUuid, Vec<Sample>> = BTreeMap::new();
    for sample in samples {
        by_time.entry(sample.t()).or_default().push(sample);
    }
    let mut messages = Vec::with_capacity(by_time.len());
    for (t, mut group) in by_time {
        let payload: Payload = if group.len() == 1 {
            let (metric, t, value) = group.remove(0).into_parts();
            match value {
                SampleValue::Text(text) => SendDsData::new(metric.uri(), t, text)?.into(),
                SampleValue::Number(number) => {
                    SendDpData::from_numeric(metric.uri(), t, number)?.into()
                }
            }
        } else {
            let entries = group
                .into_iter()
                .map(|sample| {
                    let (metric, _, value) = sample.into_parts();
                    MultiDataEntry::from_value(metric, value)
                })
                .collect::<Result<Vec<_>, _>>()?;
            SendMultiData::new(t, entries).into()
        };
        messages.push(Message::new(payload));
    }
    Ok(messages)
}

/// Sends samples upstream in timestamp order, returns the replies.
pub async fn send_samples(
    uplink: &dyn Uplink,
    samples: Vec<Sample>,
    options: SendOptions,
) -> Vec<Option<Message>> {
    let messages = match samples_to_messages(samples) {
        Ok(messages) => messages,
        Err(err) => {
            warn!(error = %err, "scheduler.encode_failed");
            return Vec::new();
        }
    };
    let mut replies = Vec::with_capacity(messages.len());
    for message in messages {
        replies.push(uplink.send_message(message, options).await);
    }
    replies
}
