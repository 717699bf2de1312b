use telemetra_core::Metric;

use crate::cron::{CronSchedule, LocalTime};

/// When a transfer method runs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Schedule {
    /// Never triggered by the scheduler; only `exec_on_load` or explicit runs.
    #[default]
    Dummy,
    OnUpdate(OnUpdateSchedule),
    Cron(CronSchedule),
}

impl Schedule {
    pub fn on_update(activation: impl IntoIterator<Item = Metric>) -> Self {
        Schedule::OnUpdate(OnUpdateSchedule::new(activation))
    }

    pub fn activation_metrics(&self) -> &[Metric] {
        match self {
            Schedule::OnUpdate(schedule) => schedule.activation(),
            Schedule::Dummy | Schedule::Cron(_) => &[],
        }
    }

    pub fn matches_time(&self, time: &LocalTime) -> bool {
        match self {
            Schedule::Cron(cron) => cron.matches(time),
            Schedule::Dummy | Schedule::OnUpdate(_) => false,
        }
    }
}

impl From<CronSchedule> for Schedule {
    fn from(value: CronSchedule) -> Self {
        Schedule::Cron(value)
    }
}

/// Runs the job whenever one of the activation metrics receives data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnUpdateSchedule {
    activation: Vec<Metric>,
}

impl OnUpdateSchedule {
    pub fn new(activation: impl IntoIterator<Item = Metric>) -> Self {
        let mut metrics: Vec<Metric> = Vec::new();
        for metric in activation {
            if !metrics.contains(&metric) {
                metrics.push(metric);
            }
        }
        OnUpdateSchedule {
            activation: metrics,
        }
    }

    pub fn activation(&self) -> &[Metric] {
        &self.activation
    }
}
