//! Partitioned variational inference.
//!
//! A global mean-field Gaussian posterior over a model's parameters is
//! assembled from per-client factors without pooling the clients' data,
//!
//! ```text
//! q(θ) ∝ p(θ) Π_i t_i(θ)
//! ```
//!
//! Every term is kept in natural parameters, so multiplying terms is
//! adding parameters. A [`Server`] visits [`Client`]s according to a
//! [`Schedule`]; each client fits its shard against the current `q` and
//! proposes a refined factor, which the server validates and merges.

pub mod client;
pub mod config;
pub mod data;
pub mod distributions;
pub mod early_stopping;
pub mod error;
pub mod factor;
pub mod history;
pub mod model;
pub mod models;
pub mod natural_params;
pub mod server;

pub use client::{
    Client, ClientMetrics, ClientUpdate, PerformanceMetricsFn, PviClientT, TrainingCurve,
    UpdateStatus,
};
pub use config::{
    ClientConfig, EarlyStoppingConfig, OptimiserConfig, Schedule, ScoreName, ServerConfig,
};
pub use data::Shard;
pub use distributions::{GaussianParams, MeanFieldGaussian};
pub use early_stopping::{EarlyStopping, Snapshot, StopReason};
pub use error::{PviError, Result};
pub use factor::GaussianFactor;
pub use history::{History, IterationRecord};
pub use model::{evaluate_performance, ElboTerms, Model, PerformanceMetrics, Predictive};
pub use models::{LogisticRegression, MulticlassLogisticRegression};
pub use natural_params::NaturalParams;
pub use server::{Server, ServerState};
