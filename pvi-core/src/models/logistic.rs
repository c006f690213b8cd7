use candle_core::{DType, Tensor, D};
use candle_nn::ops::{log_softmax, sigmoid};

use crate::data::Shard;
use crate::distributions::MeanFieldGaussian;
use crate::error::{PviError, Result};
use crate::model::{ElboTerms, Model, Predictive};

/// Bernoulli logistic regression, `y ~ Bernoulli(sigmoid(x·w + b))`
///
/// Parameters are `[w_1, ..., w_d, b]` when `include_bias`.
#[derive(Debug, Clone)]
pub struct LogisticRegression {
    pub dim_input: usize,
    pub include_bias: bool,
    /// probit approximation of the predictive instead of sampling
    pub probit_predictive: bool,
    pub num_predictive_samples: usize,
}

impl LogisticRegression {
    pub fn new(dim_input: usize) -> Self {
        Self {
            dim_input,
            include_bias: true,
            probit_predictive: true,
            num_predictive_samples: 100,
        }
    }

    fn logits(&self, x_nd: &Tensor, theta_sp: &Tensor) -> Result<Tensor> {
        let x_np = design(x_nd, self.include_bias)?;
        check_width(&x_np, theta_sp.dim(1)?)?;
        Ok(theta_sp.matmul(&x_np.t()?)?)
    }
}

/// y·l - log(1 + e^l), with the softplus written to avoid overflow
fn bernoulli_log_likelihood(logits_sn: &Tensor, y_n: &Tensor) -> Result<Tensor> {
    let softplus = (logits_sn.relu()? + ((logits_sn.abs()?.neg()?.exp()? + 1.0)?.log()?))?;
    Ok((logits_sn.broadcast_mul(y_n)? - softplus)?)
}

/// Stack `(1 - p, p)` into (n, 2) class probabilities
fn binary_probs(p_n: &Tensor) -> Result<Tensor> {
    let p_n1 = p_n.unsqueeze(1)?;
    let q_n1 = (p_n1.neg()? + 1.0)?;
    Ok(Tensor::cat(&[&q_n1, &p_n1], 1)?)
}

impl Model for LogisticRegression {
    fn num_parameters(&self) -> usize {
        self.dim_input + usize::from(self.include_bias)
    }

    fn sample_and_score(
        &self,
        q: &MeanFieldGaussian,
        batch: &Shard,
        num_samples: usize,
    ) -> Result<(Predictive, ElboTerms)> {
        let theta_sp = q.rsample(num_samples)?;
        let logits_sn = self.logits(&batch.x, &theta_sp)?;
        let log_likelihood = bernoulli_log_likelihood(&logits_sn, &batch.y)?;
        let p_n = sigmoid(&logits_sn.detach())?.mean(0)?;
        Ok((
            Predictive {
                probs: binary_probs(&p_n)?,
            },
            ElboTerms { log_likelihood },
        ))
    }

    fn predict(&self, x_nd: &Tensor, q: &MeanFieldGaussian) -> Result<Predictive> {
        let p_n = if self.probit_predictive {
            // E[sigmoid(a)] ≈ sigmoid(m / sqrt(1 + π v / 8)) for a ~ N(m, v)
            let x_np = design(x_nd, self.include_bias)?;
            let mean_p = q.mean()?.detach();
            let var_p = q.var()?.detach();
            check_width(&x_np, mean_p.dim(0)?)?;
            let m_n = x_np.matmul(&mean_p.unsqueeze(1)?)?.squeeze(1)?;
            let v_n = x_np.sqr()?.matmul(&var_p.unsqueeze(1)?)?.squeeze(1)?;
            let denom = ((v_n * (std::f64::consts::PI / 8.0))? + 1.0)?.sqrt()?;
            sigmoid(&(m_n / denom)?)?
        } else {
            let theta_sp = q.rsample(self.num_predictive_samples)?.detach();
            sigmoid(&self.logits(x_nd, &theta_sp)?)?.mean(0)?
        };
        Ok(Predictive {
            probs: binary_probs(&p_n)?,
        })
    }
}

/// Softmax regression over `num_classes` labels `0..C`
///
/// Parameters are a flattened `(d [+1]) x C` weight matrix.
#[derive(Debug, Clone)]
pub struct MulticlassLogisticRegression {
    pub dim_input: usize,
    pub num_classes: usize,
    pub include_bias: bool,
    pub num_predictive_samples: usize,
}

impl MulticlassLogisticRegression {
    pub fn new(dim_input: usize, num_classes: usize) -> Self {
        Self {
            dim_input,
            num_classes,
            include_bias: true,
            num_predictive_samples: 100,
        }
    }

    fn dim_design(&self) -> usize {
        self.dim_input + usize::from(self.include_bias)
    }

    /// log softmax over classes, shape (S, n, C)
    fn log_probs(&self, x_nd: &Tensor, theta_sp: &Tensor) -> Result<Tensor> {
        let x_np = design(x_nd, self.include_bias)?;
        check_width(&x_np, self.dim_design())?;
        let nsamp = theta_sp.dim(0)?;
        let (nobs, ncol) = x_np.dims2()?;
        let w_spc = theta_sp.reshape((nsamp, ncol, self.num_classes))?;
        let x_snp = x_np.unsqueeze(0)?.broadcast_as((nsamp, nobs, ncol))?.contiguous()?;
        let logits_snc = x_snp.matmul(&w_spc)?;
        Ok(log_softmax(&logits_snc, D::Minus1)?)
    }
}

impl Model for MulticlassLogisticRegression {
    fn num_parameters(&self) -> usize {
        self.dim_design() * self.num_classes
    }

    fn sample_and_score(
        &self,
        q: &MeanFieldGaussian,
        batch: &Shard,
        num_samples: usize,
    ) -> Result<(Predictive, ElboTerms)> {
        let theta_sp = q.rsample(num_samples)?;
        let logp_snc = self.log_probs(&batch.x, &theta_sp)?;
        let (nsamp, nobs, _) = logp_snc.dims3()?;

        let idx = batch
            .y
            .to_dtype(DType::U32)?
            .reshape((1, nobs, 1))?
            .broadcast_as((nsamp, nobs, 1))?
            .contiguous()?;
        let log_likelihood = logp_snc.gather(&idx, 2)?.squeeze(2)?;
        let probs = logp_snc.detach().exp()?.mean(0)?;

        Ok((Predictive { probs }, ElboTerms { log_likelihood }))
    }

    fn predict(&self, x_nd: &Tensor, q: &MeanFieldGaussian) -> Result<Predictive> {
        let theta_sp = q.rsample(self.num_predictive_samples)?.detach();
        let probs = self.log_probs(x_nd, &theta_sp)?.exp()?.mean(0)?;
        Ok(Predictive { probs })
    }
}

/// Append a column of ones when a bias is modelled
fn design(x_nd: &Tensor, include_bias: bool) -> Result<Tensor> {
    if include_bias {
        let ones = Tensor::ones((x_nd.dim(0)?, 1), x_nd.dtype(), x_nd.device())?;
        Ok(Tensor::cat(&[x_nd, &ones], 1)?)
    } else {
        Ok(x_nd.clone())
    }
}

fn check_width(x_np: &Tensor, num_parameters: usize) -> Result<()> {
    let width = x_np.dim(1)?;
    if width != num_parameters {
        return Err(PviError::IncompatibleShape {
            left: x_np.dims().to_vec(),
            right: vec![num_parameters],
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::Device;

    fn point_mass(values: &[f32]) -> Result<MeanFieldGaussian> {
        let dev = Device::Cpu;
        MeanFieldGaussian::from_standard(
            Tensor::from_slice(values, values.len(), &dev)?,
            Tensor::from_slice(&vec![1e-4f32; values.len()], values.len(), &dev)?,
        )
    }

    #[test]
    fn bernoulli_log_likelihood_matches_closed_form() -> Result<()> {
        let dev = Device::Cpu;
        let logits = Tensor::new(&[[0.0f32, 2.0, -30.0, 50.0]], &dev)?;
        let y = Tensor::new(&[1f32, 0.0, 0.0, 1.0], &dev)?;
        let llik = bernoulli_log_likelihood(&logits, &y)?.to_vec2::<f32>()?;
        assert_abs_diff_eq!(llik[0][0], -(2.0f32.ln()), epsilon = 1e-5);
        assert_abs_diff_eq!(llik[0][1], -(1.0 + 2.0f32.exp()).ln(), epsilon = 1e-5);
        assert_abs_diff_eq!(llik[0][2], 0.0, epsilon = 1e-5);
        assert_abs_diff_eq!(llik[0][3], 0.0, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn logistic_shapes_and_predictive() -> Result<()> {
        let dev = Device::Cpu;
        let model = LogisticRegression::new(2);
        assert_eq!(model.num_parameters(), 3);

        let x = Tensor::new(&[[1f32, 0.0], [0.0, 1.0], [-1.0, 0.5]], &dev)?;
        let y = Tensor::new(&[1f32, 0.0, 0.0], &dev)?;
        let batch = Shard::new(x.clone(), y.clone())?;

        // w = (4, -4), b = 0 nearly deterministic
        let q = point_mass(&[4.0, -4.0, 0.0])?;
        let (pred, terms) = model.sample_and_score(&q, &batch, 5)?;
        assert_eq!(terms.log_likelihood.dims(), &[5, 3]);
        assert_eq!(pred.probs.dims(), &[3, 2]);

        let probit = model.predict(&x, &q)?;
        assert_abs_diff_eq!(probit.accuracy(&y)?, 1.0);
        let p1 = probit.probs.to_vec2::<f32>()?;
        assert_abs_diff_eq!(p1[0][1], 1.0 / (1.0 + (-4.0f32).exp()), epsilon = 1e-3);

        let mc = LogisticRegression {
            probit_predictive: false,
            ..model
        };
        assert_abs_diff_eq!(mc.predict(&x, &q)?.accuracy(&y)?, 1.0);
        Ok(())
    }

    #[test]
    fn multiclass_picks_the_dominant_column() -> Result<()> {
        let dev = Device::Cpu;
        let model = MulticlassLogisticRegression::new(2, 3);
        assert_eq!(model.num_parameters(), 9);

        // rows: w_1, w_2, bias; columns: classes
        let q = point_mass(&[5.0, 0.0, -5.0, 0.0, 5.0, -5.0, 0.0, 0.0, 2.0])?;
        let x = Tensor::new(&[[1f32, 0.0], [0.0, 1.0], [0.0, 0.0]], &dev)?;
        let y = Tensor::new(&[0f32, 1.0, 2.0], &dev)?;
        let batch = Shard::new(x.clone(), y.clone())?;

        let (pred, terms) = model.sample_and_score(&q, &batch, 4)?;
        assert_eq!(terms.log_likelihood.dims(), &[4, 3]);
        assert_abs_diff_eq!(pred.accuracy(&y)?, 1.0);

        let probs = model.predict(&x, &q)?.probs;
        let row_sums = probs.sum(1)?.to_vec1::<f32>()?;
        for s in row_sums {
            assert_abs_diff_eq!(s, 1.0, epsilon = 1e-5);
        }
        Ok(())
    }

    #[test]
    fn wrong_parameter_count_is_an_error() -> Result<()> {
        let dev = Device::Cpu;
        let model = LogisticRegression::new(3);
        let q = point_mass(&[0.0, 0.0])?;
        let x = Tensor::zeros((2, 3), DType::F32, &dev)?;
        assert!(model.predict(&x, &q).is_err());
        Ok(())
    }
}
