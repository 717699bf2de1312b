use std::time::Instant;

use telemetra_core::{Metric, MetricKind, Sample, SampleValue, TimeUuid};
use telemetra_sched::{CronSchedule, JobArg, JobContext, JobError, TransferMethod};

use crate::config::HeartbeatSettings;

/// Builds the cron job that publishes agent uptime in seconds.
pub fn uptime_job(settings: &HeartbeatSettings) -> anyhow::Result<TransferMethod> {
    let metric = Metric::datapoint(settings.uri.as_str())?;
    let schedule: CronSchedule = settings.cron.parse()?;
    let started = Instant::now();
    let target = metric.clone();
    Ok(TransferMethod::new("telemetra.uptime", move |ctx: JobContext| {
        let metric = target.clone();
        async move {
            let t = ctx.ts.unwrap_or_else(TimeUuid::now);
            let value = SampleValue::parse(
                MetricKind::Datapoint,
                &started.elapsed().as_secs().to_string(),
            )?;
            let sample = Sample::new(metric, t, value)?;
            Ok::<_, JobError>(vec![sample])
        }
    })
    .targets([metric])
    .schedule(schedule)
    .args([JobArg::Ts]))
}
