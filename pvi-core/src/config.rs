use serde::{Deserialize, Serialize};

use crate::error::{PviError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimiserConfig {
    pub learning_rate: f64,
    pub weight_decay: f64,
}

impl Default for OptimiserConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-2,
            weight_decay: 0.0,
        }
    }
}

/// What the local early-stopping rule tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreName {
    /// per-epoch ELBO, summed over minibatches
    Elbo,
    /// negated loss averaged over the epoch's minibatches
    NegatedLoss,
    /// per-epoch expected log-likelihood term, ignoring the KL penalty
    LogLikelihood,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EarlyStoppingConfig {
    /// epochs without improvement before the local fit stops
    pub patience: usize,
    pub score: ScoreName,
    /// roll back to the best-scoring snapshot on stop
    pub stash_model: bool,
}

impl Default for EarlyStoppingConfig {
    fn default() -> Self {
        Self {
            patience: 10,
            score: ScoreName::Elbo,
            stash_model: true,
        }
    }
}

/// Local optimisation settings of one client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// weight on the refinement, in (0, 1]
    pub damping_factor: f64,
    pub optimiser: OptimiserConfig,
    pub batch_size: usize,
    pub epochs: usize,
    pub num_elbo_samples: usize,
    pub early_stopping: EarlyStoppingConfig,
    /// reject refined factors with `np2 > 0` (or non-finite entries)
    pub valid_factors: bool,
    /// subtract E_q[log t_old] from the objective (optimise against the cavity)
    pub cavity_correction: bool,
    pub print_epochs: usize,
    /// evaluate train/validation metrics every this many updates
    pub metrics_every: Option<usize>,
    pub seed: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            damping_factor: 1.0,
            optimiser: OptimiserConfig::default(),
            batch_size: 100,
            epochs: 100,
            num_elbo_samples: 10,
            early_stopping: EarlyStoppingConfig::default(),
            valid_factors: true,
            cavity_correction: false,
            print_epochs: 10,
            metrics_every: None,
            seed: 42,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.damping_factor > 0.0 && self.damping_factor <= 1.0) {
            return invalid(format!(
                "damping_factor must be in (0, 1], got {}",
                self.damping_factor
            ));
        }
        if !(self.optimiser.learning_rate > 0.0) {
            return invalid(format!(
                "learning_rate must be positive, got {}",
                self.optimiser.learning_rate
            ));
        }
        if self.optimiser.weight_decay < 0.0 {
            return invalid("weight_decay must be non-negative".into());
        }
        for (name, value) in [
            ("batch_size", self.batch_size),
            ("epochs", self.epochs),
            ("num_elbo_samples", self.num_elbo_samples),
            ("print_epochs", self.print_epochs),
            ("early_stopping.patience", self.early_stopping.patience),
        ] {
            if value == 0 {
                return invalid(format!("{} must be positive", name));
            }
        }
        if self.metrics_every == Some(0) {
            return invalid("metrics_every must be positive when set".into());
        }
        Ok(())
    }
}

/// Which clients a tick visits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Schedule {
    /// one client per tick, round robin
    Sequential,
    /// every client against one snapshot of q
    Synchronous,
    /// a random subset per tick, smaller shards more likely
    RandomSubset { num_clients: usize },
    /// each client once, in order; its local posterior replaces q
    ContinualLearning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub max_iterations: usize,
    pub schedule: Schedule,
    /// start q at N(0, init_var) instead of the prior
    pub init_var: Option<f64>,
    pub seed: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            schedule: Schedule::Sequential,
            init_var: None,
            seed: 42,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self, num_clients: usize) -> Result<()> {
        if self.max_iterations == 0 {
            return invalid("max_iterations must be positive".into());
        }
        if let Some(v) = self.init_var {
            if !(v > 0.0) {
                return invalid(format!("init_var must be positive, got {}", v));
            }
        }
        if num_clients == 0 {
            return invalid("a server needs at least one client".into());
        }
        if let Schedule::RandomSubset { num_clients: k } = self.schedule {
            if k == 0 || k > num_clients {
                return invalid(format!(
                    "random subset of {} out of {} clients",
                    k, num_clients
                ));
            }
        }
        Ok(())
    }
}

fn invalid(msg: String) -> Result<()> {
    Err(PviError::InvalidConfig(msg))
}
