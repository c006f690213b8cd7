use serde::{Deserialize, Serialize};

/// One row per completed iteration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: usize,
    /// wall-clock seconds spent on the iteration
    pub time: f64,
    /// client updates received so far
    pub communications: usize,
    /// merges committed during the iteration
    pub clients_updated: usize,
    pub elbo_mean: Option<f32>,
    pub elbo_last: Option<f32>,
    pub train_mll: Option<f32>,
    pub train_acc: Option<f32>,
    pub val_mll: Option<f32>,
    pub val_acc: Option<f32>,
    /// rejected factors and failed merges
    pub failures: usize,
}

/// Append-only log, written by the server only
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct History {
    records: Vec<IterationRecord>,
}

impl History {
    pub(crate) fn push(&mut self, record: IterationRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[IterationRecord] {
        &self.records
    }

    pub fn last(&self) -> Option<&IterationRecord> {
        self.records.last()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn total_failures(&self) -> usize {
        self.records.iter().map(|r| r.failures).sum()
    }
}
