use std::sync::Arc;

use parking_lot::Mutex;
use telemetra_core::{Metric, Sample, SampleValue, TimeUuid, ValidationError};

/// Samples produced by one job execution.
///
/// Clones share the same buffer. The runtime commits the buffer after the
/// job returns successfully and discards it otherwise.
#[derive(Debug, Clone, Default)]
pub struct Transaction {
    samples: Arc<Mutex<Vec<Sample>>>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, sample: Sample) {
        self.samples.lock().push(sample);
    }

    pub fn push_value(
        &self,
        metric: Metric,
        t: TimeUuid,
        value: SampleValue,
    ) -> Result<(), ValidationError> {
        self.push(Sample::new(metric, t, value)?);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.lock().is_empty()
    }

    pub(crate) fn take(&self) -> Vec<Sample> {
        std::mem::take(&mut *self.samples.lock())
    }
}
