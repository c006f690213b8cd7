use serde::{Deserialize, Serialize};

use crate::config::EarlyStoppingConfig;
use crate::distributions::MeanFieldGaussian;
use crate::error::Result;

/// Why a local optimisation ended. Neither is a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    MaxEpochs,
    NoImprovement { epoch: usize },
}

/// Best-scoring parameters seen so far
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub q: MeanFieldGaussian,
    pub score: f32,
    pub epoch: usize,
}

/// Patience-based stopping on a per-epoch score (higher is better)
#[derive(Debug)]
pub struct EarlyStopping {
    patience: usize,
    stash_model: bool,
    best: Option<Snapshot>,
    since_best: usize,
}

impl EarlyStopping {
    pub fn new(config: &EarlyStoppingConfig) -> Self {
        Self {
            patience: config.patience,
            stash_model: config.stash_model,
            best: None,
            since_best: 0,
        }
    }

    pub fn best(&self) -> Option<&Snapshot> {
        self.best.as_ref()
    }

    /// Record the score after `epoch`; returns a reason once patience runs out.
    /// A NaN score never counts as an improvement.
    pub fn observe(
        &mut self,
        epoch: usize,
        score: f32,
        q: &MeanFieldGaussian,
    ) -> Result<Option<StopReason>> {
        let improved = match &self.best {
            None => !score.is_nan(),
            Some(best) => score > best.score,
        };

        if improved {
            self.best = Some(Snapshot {
                q: q.non_trainable_copy()?,
                score,
                epoch,
            });
            self.since_best = 0;
            return Ok(None);
        }

        self.since_best += 1;
        if self.since_best >= self.patience {
            Ok(Some(StopReason::NoImprovement { epoch }))
        } else {
            Ok(None)
        }
    }

    /// The distribution the local fit should report: the stashed best if
    /// configured, otherwise the final iterate
    pub fn resolve(self, last: &MeanFieldGaussian) -> Result<MeanFieldGaussian> {
        match self.best {
            Some(best) if self.stash_model => Ok(best.q),
            _ => last.non_trainable_copy(),
        }
    }
}
