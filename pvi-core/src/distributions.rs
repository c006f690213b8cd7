use candle_core::{DType, Device, Shape, Tensor, Var};

use crate::error::{PviError, Result};
use crate::natural_params::{check_same_shape, NaturalParams};

/// How the parameters of a [`MeanFieldGaussian`] are stored.
#[derive(Debug, Clone)]
pub enum GaussianParams {
    /// location and (strictly positive) scale
    Standard { loc: Tensor, scale: Tensor },
    /// `np1 = loc / scale²`, `np2 = -1 / (2 scale²)`
    Natural { np1: Tensor, np2: Tensor },
    /// trainable location and log-scale
    Unconstrained { loc: Var, log_scale: Var },
}

/// Mean-field Gaussian over a parameter tensor,
/// q(θ) = Π_j N(θ_j; μ_j, σ_j²)
///
/// The value is immutable. Updates produce a new distribution, and only the
/// `Unconstrained` form holds variables an optimizer can touch. Keeping the
/// scale as `exp(log_scale)` during optimization keeps it positive.
#[derive(Debug, Clone)]
pub struct MeanFieldGaussian {
    params: GaussianParams,
}

impl MeanFieldGaussian {
    /// Create a distribution from location and scale.
    ///
    /// # Arguments
    /// * `loc` - mean μ, any shape
    /// * `scale` - standard deviation σ > 0, same shape as `loc`
    ///
    /// # Returns
    /// A non-trainable distribution, or `IncompatibleShape` if the shapes differ
    pub fn from_standard(loc: Tensor, scale: Tensor) -> Result<Self> {
        check_same_shape(&loc, &scale)?;
        Ok(Self {
            params: GaussianParams::Standard { loc, scale },
        })
    }

    /// Create a distribution from natural parameters. Propriety is not
    /// checked here; see [`MeanFieldGaussian::is_valid`].
    pub fn from_natural(nat: NaturalParams) -> Self {
        Self {
            params: GaussianParams::Natural {
                np1: nat.np1,
                np2: nat.np2,
            },
        }
    }

    /// Isotropic N(0, scale²) over a tensor of the given shape
    pub fn prior<S: Into<Shape>>(shape: S, scale: f64, device: &Device) -> Result<Self> {
        let shape = shape.into();
        let loc = Tensor::zeros(shape.clone(), DType::F32, device)?;
        let scale = (Tensor::ones(shape, DType::F32, device)? * scale)?;
        Self::from_standard(loc, scale)
    }

    /// Warm start with zero mean and a small variance `init_var`
    pub fn from_init_var<S: Into<Shape>>(shape: S, init_var: f64, device: &Device) -> Result<Self> {
        if !(init_var > 0.0) {
            return Err(PviError::InvalidConfig(format!(
                "init_var must be positive, got {}",
                init_var
            )));
        }
        Self::prior(shape, init_var.sqrt(), device)
    }

    /// Get the stored parameterization.
    pub fn params(&self) -> &GaussianParams {
        &self.params
    }

    /// Whether the parameters are optimizer variables.
    pub fn is_trainable(&self) -> bool {
        matches!(self.params, GaussianParams::Unconstrained { .. })
    }

    /// Optimizer handles, empty unless trainable
    pub fn vars(&self) -> Vec<Var> {
        match &self.params {
            GaussianParams::Unconstrained { loc, log_scale } => vec![loc.clone(), log_scale.clone()],
            _ => vec![],
        }
    }

    /// Get the shape of the parameter tensor.
    pub fn dims(&self) -> &[usize] {
        match &self.params {
            GaussianParams::Standard { loc, .. } => loc.dims(),
            GaussianParams::Natural { np1, .. } => np1.dims(),
            GaussianParams::Unconstrained { loc, .. } => loc.dims(),
        }
    }

    /// Get the number of scalar parameters θ_j.
    pub fn num_parameters(&self) -> usize {
        self.dims().iter().product()
    }

    /// Get the device of the parameters.
    pub fn device(&self) -> &Device {
        match &self.params {
            GaussianParams::Standard { loc, .. } => loc.device(),
            GaussianParams::Natural { np1, .. } => np1.device(),
            GaussianParams::Unconstrained { loc, .. } => loc.device(),
        }
    }

    /// (loc, scale); gradients flow through when trainable
    pub fn to_standard(&self) -> Result<(Tensor, Tensor)> {
        match &self.params {
            GaussianParams::Standard { loc, scale } => Ok((loc.clone(), scale.clone())),
            GaussianParams::Natural { np1, np2 } => {
                // loc = -np1 / (2 np2), scale = sqrt(-1 / (2 np2))
                let var = (np2 * -2.0)?.recip()?;
                let loc = (np1 * &var)?;
                Ok((loc, var.sqrt()?))
            }
            GaussianParams::Unconstrained { loc, log_scale } => {
                Ok((loc.as_tensor().clone(), log_scale.as_tensor().exp()?))
            }
        }
    }

    /// Natural parameters `(μ / σ², -1 / (2 σ²))`; gradients flow through
    /// when trainable
    pub fn to_natural(&self) -> Result<NaturalParams> {
        match &self.params {
            GaussianParams::Natural { np1, np2 } => Ok(NaturalParams {
                np1: np1.clone(),
                np2: np2.clone(),
            }),
            _ => {
                let (loc, scale) = self.to_standard()?;
                let prec = scale.sqr()?.recip()?;
                Ok(NaturalParams {
                    np1: (loc * &prec)?,
                    np2: (prec * -0.5)?,
                })
            }
        }
    }

    /// Get the mean μ.
    pub fn mean(&self) -> Result<Tensor> {
        Ok(self.to_standard()?.0)
    }

    /// Get the variance σ².
    pub fn var(&self) -> Result<Tensor> {
        match &self.params {
            GaussianParams::Unconstrained { log_scale, .. } => Ok((log_scale.as_tensor() * 2.0)?.exp()?),
            _ => Ok(self.to_standard()?.1.sqr()?),
        }
    }

    /// Detached copy holding standard parameters
    pub fn non_trainable_copy(&self) -> Result<Self> {
        let params = match &self.params {
            GaussianParams::Natural { np1, np2 } => GaussianParams::Natural {
                np1: np1.detach(),
                np2: np2.detach(),
            },
            _ => {
                let (loc, scale) = self.to_standard()?;
                GaussianParams::Standard {
                    loc: loc.detach(),
                    scale: scale.detach(),
                }
            }
        };
        Ok(Self { params })
    }

    /// Fresh variables initialized at the current (loc, log scale)
    pub fn trainable_copy(&self) -> Result<Self> {
        let (loc, scale) = self.to_standard()?;
        let loc = Var::from_tensor(&loc.detach())?;
        let log_scale = Var::from_tensor(&scale.detach().log()?)?;
        Ok(Self {
            params: GaussianParams::Unconstrained { loc, log_scale },
        })
    }

    /// A proper Gaussian needs `np2 < 0` everywhere
    pub fn is_valid(&self) -> Result<bool> {
        self.to_natural()?.is_valid()
    }

    /// Product with a term in natural-parameter space, `q * t`
    pub fn combine(&self, term: &NaturalParams) -> Result<Self> {
        Ok(Self::from_natural(self.to_natural()?.combine(term)?))
    }

    /// Ratio with a term in natural-parameter space, `q / t`
    pub fn divide(&self, term: &NaturalParams) -> Result<Self> {
        Ok(Self::from_natural(self.to_natural()?.divide(term)?))
    }

    /// Reparameterized samples θ = μ + σ ε, shape (S, *dims)
    pub fn rsample(&self, num_samples: usize) -> Result<Tensor> {
        let (loc, scale) = self.to_standard()?;
        let mut dims = vec![num_samples];
        dims.extend_from_slice(loc.dims());
        let eps = Tensor::randn(0f32, 1f32, dims, loc.device())?.to_dtype(loc.dtype())?;
        Ok(loc.unsqueeze(0)?.broadcast_add(&eps.broadcast_mul(&scale)?)?)
    }

    /// log q(θ) summed over parameter dimensions
    ///
    /// * `theta` - samples, shape (S, *dims)
    ///
    /// Returns shape (S,)
    pub fn log_prob(&self, theta: &Tensor) -> Result<Tensor> {
        let (loc, scale) = self.to_standard()?;
        let ln_2pi = (2.0 * std::f64::consts::PI).ln();
        let z_sq = theta.broadcast_sub(&loc)?.broadcast_div(&scale)?.sqr()?;
        let two_ln_scale = (scale.log()? * 2.0)?;
        let elem = ((z_sq.broadcast_add(&two_ln_scale)? + ln_2pi)? * -0.5)?;
        Ok(elem.flatten_from(1)?.sum(1)?)
    }

    /// KL(self || other) summed over all dimensions
    ///
    /// ```text
    /// log(σ₂/σ₁) + (σ₁² + (μ₁ - μ₂)²) / (2 σ₂²) - 1/2
    /// ```
    pub fn kl_divergence(&self, other: &MeanFieldGaussian) -> Result<Tensor> {
        let (m1, s1) = self.to_standard()?;
        let (m2, s2) = other.to_standard()?;
        check_same_shape(&m1, &m2)?;
        let log_ratio = (s2.log()? - s1.log()?)?;
        let num = (s1.sqr()? + (&m1 - &m2)?.sqr()?)?;
        let den = (s2.sqr()? * 2.0)?;
        let kl = ((log_ratio + (num / den)?)? - 0.5)?;
        Ok(kl.sum_all()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn gaussian(loc: &[f32], scale: &[f32]) -> Result<MeanFieldGaussian> {
        let dev = Device::Cpu;
        MeanFieldGaussian::from_standard(
            Tensor::from_slice(loc, loc.len(), &dev)?,
            Tensor::from_slice(scale, scale.len(), &dev)?,
        )
    }

    #[test]
    fn natural_parameters_of_unit_gaussian() -> Result<()> {
        let q = gaussian(&[2.0], &[0.5])?;
        let nat = q.to_natural()?;
        // np1 = 2 / 0.25, np2 = -1 / (2 * 0.25)
        assert_abs_diff_eq!(nat.np1.to_vec1::<f32>()?[0], 8.0, epsilon = 1e-5);
        assert_abs_diff_eq!(nat.np2.to_vec1::<f32>()?[0], -2.0, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn standard_natural_round_trip() -> Result<()> {
        let loc = [-3.0f32, 0.0, 0.25, 10.0];
        let scale = [0.01f32, 1.0, 2.5, 30.0];
        let q = gaussian(&loc, &scale)?;
        let back = MeanFieldGaussian::from_natural(q.to_natural()?);
        let (l, s) = back.to_standard()?;
        for (a, b) in l.to_vec1::<f32>()?.iter().zip(loc.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-3);
        }
        for (a, b) in s.to_vec1::<f32>()?.iter().zip(scale.iter()) {
            assert_abs_diff_eq!(a / b, 1.0, epsilon = 1e-4);
        }
        Ok(())
    }

    #[test]
    fn trainable_copy_preserves_parameters() -> Result<()> {
        let q = gaussian(&[1.0, -1.0], &[0.3, 2.0])?;
        let qt = q.trainable_copy()?;
        assert!(qt.is_trainable());
        assert!(!q.is_trainable());
        assert_eq!(qt.vars().len(), 2);

        let back = qt.non_trainable_copy()?;
        assert!(!back.is_trainable());
        let diff = back.to_natural()?.max_abs_diff(&q.to_natural()?)?;
        assert_abs_diff_eq!(diff, 0.0, epsilon = 1e-4);
        Ok(())
    }

    #[test]
    fn kl_is_zero_for_identical_and_positive_otherwise() -> Result<()> {
        let p = gaussian(&[0.0, 1.0], &[1.0, 0.5])?;
        let q = gaussian(&[0.5, 1.0], &[2.0, 0.5])?;
        let kl_pp = p.kl_divergence(&p)?.to_scalar::<f32>()?;
        let kl_qp = q.kl_divergence(&p)?.to_scalar::<f32>()?;
        assert_abs_diff_eq!(kl_pp, 0.0, epsilon = 1e-6);
        // ln(1/2) + (4 + 0.25)/2 - 0.5
        let expected = 0.5f32.ln() + 4.25 / 2.0 - 0.5;
        assert_abs_diff_eq!(kl_qp, expected, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn log_prob_at_mean() -> Result<()> {
        let q = gaussian(&[1.0, 2.0], &[1.0, 1.0])?;
        let theta = q.mean()?.unsqueeze(0)?;
        let lp = q.log_prob(&theta)?;
        assert_eq!(lp.dims(), &[1]);
        let expected = -(2.0 * std::f64::consts::PI).ln() as f32;
        assert_abs_diff_eq!(lp.to_vec1::<f32>()?[0], expected, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn rsample_shape() -> Result<()> {
        let q = MeanFieldGaussian::prior((3, 4), 1.0, &Device::Cpu)?;
        let theta = q.rsample(7)?;
        assert_eq!(theta.dims(), &[7, 3, 4]);
        assert_eq!(q.log_prob(&theta)?.dims(), &[7]);
        Ok(())
    }

    #[test]
    fn zero_term_is_identity() -> Result<()> {
        let q = gaussian(&[0.3, -2.0], &[0.7, 1.3])?;
        let zero = NaturalParams::zeros(2, &Device::Cpu)?;
        let merged = q.combine(&zero)?;
        let diff = merged.to_natural()?.max_abs_diff(&q.to_natural()?)?;
        assert_abs_diff_eq!(diff, 0.0);
        Ok(())
    }

    #[test]
    fn non_positive_init_var_is_rejected() {
        assert!(MeanFieldGaussian::from_init_var(3, 0.0, &Device::Cpu).is_err());
        assert!(MeanFieldGaussian::from_init_var(3, 1e-3, &Device::Cpu).is_ok());
    }
}
