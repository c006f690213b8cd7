use candle_core::{Device, Shape, Tensor};

use crate::distributions::MeanFieldGaussian;
use crate::error::Result;
use crate::natural_params::NaturalParams;

/// A client's un-normalized Gaussian term t_i(θ), natural parameters only.
///
/// The global posterior is reconstructed as
///
/// ```text
/// q(θ) ∝ p(θ) Π_i t_i(θ)   ⇔   q.np = p.np + Σ_i t_i.np
/// ```
#[derive(Debug, Clone)]
pub struct GaussianFactor {
    nat: NaturalParams,
}

impl GaussianFactor {
    /// The flat factor, t(θ) = 1
    pub fn identity<S: Into<Shape>>(shape: S, device: &Device) -> Result<Self> {
        Ok(Self {
            nat: NaturalParams::zeros(shape, device)?,
        })
    }

    pub fn from_natural(nat: NaturalParams) -> Self {
        Self { nat }
    }

    pub fn natural(&self) -> &NaturalParams {
        &self.nat
    }

    pub fn dims(&self) -> &[usize] {
        self.nat.dims()
    }

    /// Finite and `np2 <= 0` everywhere, i.e. normalizable on its own
    /// (or flat). Clients enforce this when `valid_factors` is set.
    pub fn is_valid(&self) -> Result<bool> {
        self.nat.is_valid_factor()
    }

    /// Finite everywhere; `np2` may have either sign
    pub fn is_finite(&self) -> Result<bool> {
        self.nat.is_finite()
    }

    /// Refined factor after a local fit,
    ///
    /// ```text
    /// t_new = t_old + damping * (q_new / q_old)
    /// ```
    ///
    /// `damping = 1` gives the undamped `q_new / q_old * t_old`;
    /// `damping -> 0` keeps `t_old`.
    pub fn compute_refined_factor(
        &self,
        q_new: &MeanFieldGaussian,
        q_old: &MeanFieldGaussian,
        damping: f64,
    ) -> Result<GaussianFactor> {
        let ratio = q_new.to_natural()?.divide(&q_old.to_natural()?)?.detach();
        let nat = self.nat.combine(&ratio.scale(damping)?)?;
        Ok(Self { nat })
    }

    /// Change in natural parameters when this factor replaces `old`
    pub fn delta_from(&self, old: &GaussianFactor) -> Result<NaturalParams> {
        self.nat.divide(&old.nat)
    }

    /// E_q[log t(θ)] up to a constant, Σ_j np1_j E[θ_j] + np2_j E[θ_j²]
    pub fn eqlogt(&self, q: &MeanFieldGaussian) -> Result<Tensor> {
        let mean = q.mean()?;
        let second_moment = (q.var()? + mean.sqr()?)?;
        let first = (&self.nat.np1 * &mean)?.sum_all()?;
        let second = (&self.nat.np2 * &second_moment)?.sum_all()?;
        Ok((first + second)?)
    }
}
