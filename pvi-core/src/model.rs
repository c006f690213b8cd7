use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::data::Shard;
use crate::distributions::MeanFieldGaussian;
use crate::error::Result;

/// Monte Carlo terms a client needs to form its local objective.
pub struct ElboTerms {
    /// log p(y_n | θ_s), shape (S, n)
    pub log_likelihood: Tensor,
}

/// Class probabilities for each observation, shape (n, C)
#[derive(Debug, Clone)]
pub struct Predictive {
    pub probs: Tensor,
}

impl Predictive {
    /// Average log predictive probability of the observed labels
    ///
    /// * `y_n` - class labels stored as floats, shape (n,)
    pub fn mean_log_likelihood(&self, y_n: &Tensor) -> Result<f32> {
        let idx = y_n.to_dtype(DType::U32)?.unsqueeze(1)?;
        let p_n = self.probs.gather(&idx, 1)?.squeeze(1)?;
        let llik = p_n.clamp(1e-12, 1.0)?.log()?.mean_all()?;
        Ok(llik.to_dtype(DType::F32)?.to_scalar::<f32>()?)
    }

    /// Fraction of observations whose most probable class is the label
    pub fn accuracy(&self, y_n: &Tensor) -> Result<f32> {
        let pred_n = self.probs.argmax(1)?;
        let hits = pred_n.eq(&y_n.to_dtype(DType::U32)?)?;
        let acc = hits.to_dtype(DType::F32)?.mean_all()?;
        Ok(acc.to_scalar::<f32>()?)
    }
}

/// Held-out style performance summary
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub mll: f32,
    pub acc: f32,
}

/// Probabilistic model whose parameter vector the posterior lives over.
///
/// Every distribution handed to a model is flat, shape `(num_parameters,)`.
pub trait Model: Send + Sync {
    fn num_parameters(&self) -> usize;

    /// Monte Carlo forward pass under `q`
    ///
    /// # Arguments
    /// * `q` - distribution over parameters; gradients flow through samples when trainable
    /// * `batch` - minibatch of inputs and labels
    /// * `num_samples` - number of reparameterized draws `S`
    ///
    /// # Returns `(predictive, terms)`
    /// * `predictive` - sample-averaged class probabilities (n x C)
    /// * `terms` - per-sample, per-observation log-likelihood (S x n)
    fn sample_and_score(
        &self,
        q: &MeanFieldGaussian,
        batch: &Shard,
        num_samples: usize,
    ) -> Result<(Predictive, ElboTerms)>;

    /// Posterior predictive for inputs `x_nd`
    fn predict(&self, x_nd: &Tensor, q: &MeanFieldGaussian) -> Result<Predictive>;
}

pub fn evaluate_performance<M: Model + ?Sized>(
    model: &M,
    q: &MeanFieldGaussian,
    data: &Shard,
) -> Result<PerformanceMetrics> {
    let pred = model.predict(&data.x, q)?;
    Ok(PerformanceMetrics {
        mll: pred.mean_log_likelihood(&data.y)?,
        acc: pred.accuracy(&data.y)?,
    })
}
