use candle_core::{DType, Device, Shape, Tensor};

use crate::error::{PviError, Result};

/// Natural parameters of a mean-field Gaussian term.
///
/// ```text
/// log t(θ) = np1 · θ + np2 · θ² + const
/// ```
///
/// Multiplying two terms in density space is [`NaturalParams::combine`],
/// dividing is [`NaturalParams::divide`].
#[derive(Debug, Clone)]
pub struct NaturalParams {
    pub np1: Tensor,
    pub np2: Tensor,
}

impl NaturalParams {
    /// # Arguments
    /// * `np1` - linear coefficients
    /// * `np2` - quadratic coefficients, same shape as `np1`
    pub fn new(np1: Tensor, np2: Tensor) -> Result<Self> {
        check_same_shape(&np1, &np2)?;
        Ok(Self { np1, np2 })
    }

    /// The identity element: contributes nothing when combined
    pub fn zeros<S: Into<Shape>>(shape: S, device: &Device) -> Result<Self> {
        let shape = shape.into();
        Ok(Self {
            np1: Tensor::zeros(shape.clone(), DType::F32, device)?,
            np2: Tensor::zeros(shape, DType::F32, device)?,
        })
    }

    /// Get the shape of each component.
    pub fn dims(&self) -> &[usize] {
        self.np1.dims()
    }

    /// Get the number of entries in each component.
    pub fn num_parameters(&self) -> usize {
        self.np1.elem_count()
    }

    /// Get the device of the parameters.
    pub fn device(&self) -> &Device {
        self.np1.device()
    }

    /// Product of two terms: elementwise sum of natural parameters
    pub fn combine(&self, other: &NaturalParams) -> Result<NaturalParams> {
        check_same_shape(&self.np1, &other.np1)?;
        Ok(Self {
            np1: (&self.np1 + &other.np1)?,
            np2: (&self.np2 + &other.np2)?,
        })
    }

    /// Ratio of two terms: elementwise difference of natural parameters
    pub fn divide(&self, other: &NaturalParams) -> Result<NaturalParams> {
        check_same_shape(&self.np1, &other.np1)?;
        Ok(Self {
            np1: (&self.np1 - &other.np1)?,
            np2: (&self.np2 - &other.np2)?,
        })
    }

    /// Raise the term to a power `w`: scale natural parameters by `w`
    pub fn scale(&self, w: f64) -> Result<NaturalParams> {
        Ok(Self {
            np1: (&self.np1 * w)?,
            np2: (&self.np2 * w)?,
        })
    }

    /// Copy cut off from the gradient graph
    pub fn detach(&self) -> NaturalParams {
        Self {
            np1: self.np1.detach(),
            np2: self.np2.detach(),
        }
    }

    /// No NaN or infinite entry in either component
    pub fn is_finite(&self) -> Result<bool> {
        Ok(all_finite(&self.np1)? && all_finite(&self.np2)?)
    }

    /// Whether this is a proper Gaussian: finite and `np2 < 0` everywhere
    pub fn is_valid(&self) -> Result<bool> {
        Ok(all_finite(&self.np1)? && all_values(&self.np2, |v| v.is_finite() && v < 0.0)?)
    }

    /// Whether this is an admissible (possibly flat) factor: finite and `np2 <= 0`
    pub fn is_valid_factor(&self) -> Result<bool> {
        Ok(all_finite(&self.np1)? && all_values(&self.np2, |v| v.is_finite() && v <= 0.0)?)
    }

    /// Largest absolute elementwise difference over both components
    pub fn max_abs_diff(&self, other: &NaturalParams) -> Result<f32> {
        let delta = self.divide(other)?;
        let d1 = delta.np1.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?;
        let d2 = delta.np2.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?;
        Ok(d1.max(d2))
    }
}

pub(crate) fn check_same_shape(left: &Tensor, right: &Tensor) -> Result<()> {
    if left.dims() != right.dims() {
        return Err(PviError::IncompatibleShape {
            left: left.dims().to_vec(),
            right: right.dims().to_vec(),
        });
    }
    Ok(())
}

fn all_values<F>(x: &Tensor, pred: F) -> Result<bool>
where
    F: Fn(f32) -> bool,
{
    let values = x.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    Ok(values.into_iter().all(pred))
}

fn all_finite(x: &Tensor) -> Result<bool> {
    all_values(x, |v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn params(np1: &[f32], np2: &[f32]) -> Result<NaturalParams> {
        let dev = Device::Cpu;
        NaturalParams::new(
            Tensor::from_slice(np1, np1.len(), &dev)?,
            Tensor::from_slice(np2, np2.len(), &dev)?,
        )
    }

    #[test]
    fn combine_is_elementwise_sum() -> Result<()> {
        let a = params(&[1.0, 2.0], &[-0.5, -1.0])?;
        let b = params(&[0.5, -1.0], &[-0.25, 0.0])?;
        let c = a.combine(&b)?;
        assert_eq!(c.np1.to_vec1::<f32>()?, vec![1.5, 1.0]);
        assert_eq!(c.np2.to_vec1::<f32>()?, vec![-0.75, -1.0]);
        Ok(())
    }

    #[test]
    fn combine_is_associative() -> Result<()> {
        let a = params(&[1.0, 2.0, 3.0], &[-0.5, -1.0, -2.0])?;
        let b = params(&[0.1, 0.2, 0.3], &[-0.1, -0.2, -0.3])?;
        let c = params(&[-1.0, 4.0, 0.0], &[-3.0, 0.0, -0.7])?;
        let left = a.combine(&b.combine(&c)?)?;
        let right = a.combine(&b)?.combine(&c)?;
        assert_abs_diff_eq!(left.max_abs_diff(&right)?, 0.0, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn divide_undoes_combine() -> Result<()> {
        let a = params(&[1.0, 2.0], &[-0.5, -1.0])?;
        let b = params(&[0.3, -0.7], &[-0.2, -0.1])?;
        let back = a.combine(&b)?.divide(&b)?;
        assert_abs_diff_eq!(back.max_abs_diff(&a)?, 0.0, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn mismatched_shapes_are_rejected() -> Result<()> {
        let a = params(&[1.0, 2.0], &[-0.5, -1.0])?;
        let b = params(&[1.0], &[-0.5])?;
        match a.combine(&b) {
            Err(PviError::IncompatibleShape { left, right }) => {
                assert_eq!(left, vec![2]);
                assert_eq!(right, vec![1]);
            }
            other => panic!("expected IncompatibleShape, got {:?}", other),
        }
        assert!(a.divide(&b).is_err());
        Ok(())
    }

    #[test]
    fn validity_domain() -> Result<()> {
        assert!(params(&[0.0], &[-1.0])?.is_valid()?);
        assert!(!params(&[0.0], &[0.0])?.is_valid()?);
        assert!(params(&[0.0], &[0.0])?.is_valid_factor()?);
        assert!(!params(&[0.0], &[0.5])?.is_valid_factor()?);
        assert!(!params(&[f32::NAN], &[-1.0])?.is_valid()?);

        // growing the variance is finite but not a normalizable factor
        assert!(params(&[0.0], &[0.5])?.is_finite()?);
        assert!(!params(&[0.0], &[f32::INFINITY])?.is_finite()?);
        Ok(())
    }
}
