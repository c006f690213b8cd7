use candle_core::{Device, Tensor};
use pvi_core::Shard;
use rand::distr::weighted::WeightedIndex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

pub struct SimArgs {
    pub num_train: usize,
    pub num_val: usize,
    pub dim: usize,
    pub classes: usize,
    pub rseed: u64,
}

pub struct SimOut {
    pub train: Shard,
    pub val: Shard,
    /// true weights, (dim + 1) x classes with the bias in the last row
    pub weights: Vec<f32>,
}

/// Simulate a softmax (or logistic, for two classes) regression data set
///
/// ```text
/// x_n ~ N(0, I)
/// W(j, c) ~ N(0, 1)
/// y_n ~ Categorical(softmax(x_n' W[1..d] + W[d+1]))
/// ```
///
/// With two classes only the difference of the two columns matters, so the
/// labels follow a logistic regression on `W(., 1) - W(., 0)`.
pub fn simulate_classification(args: &SimArgs) -> anyhow::Result<SimOut> {
    if args.classes < 2 {
        anyhow::bail!("need at least two classes, got {}", args.classes);
    }
    if args.num_train == 0 || args.dim == 0 {
        anyhow::bail!("empty simulation");
    }

    let mut rng = StdRng::seed_from_u64(args.rseed);
    let normal = Normal::new(0.0f32, 1.0)?;

    let nrow_w = args.dim + 1;
    let weights: Vec<f32> = (0..nrow_w * args.classes)
        .map(|_| normal.sample(&mut rng))
        .collect();

    let mut sample = |n: usize| -> anyhow::Result<Shard> {
        let x: Vec<f32> = (0..n * args.dim).map(|_| normal.sample(&mut rng)).collect();
        let mut y = Vec::with_capacity(n);
        for i in 0..n {
            let row = &x[i * args.dim..(i + 1) * args.dim];
            let logits: Vec<f32> = (0..args.classes)
                .map(|c| {
                    let bias = weights[args.dim * args.classes + c];
                    row.iter()
                        .enumerate()
                        .map(|(j, xj)| xj * weights[j * args.classes + c])
                        .sum::<f32>()
                        + bias
                })
                .collect();
            y.push(draw_categorical(&logits, &mut rng)? as f32);
        }
        let x = Tensor::from_vec(x, (n, args.dim), &Device::Cpu)?;
        let y = Tensor::from_vec(y, n, &Device::Cpu)?;
        Ok(Shard::new(x, y)?)
    };

    let train = sample(args.num_train)?;
    let val = sample(args.num_val.max(1))?;

    Ok(SimOut {
        train,
        val,
        weights,
    })
}

/// Draw a class from softmax(logits)
fn draw_categorical<R: Rng>(logits: &[f32], rng: &mut R) -> anyhow::Result<usize> {
    let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let weights: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
    let categorical = WeightedIndex::new(&weights)?;
    Ok(categorical.sample(rng))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_shapes_and_labels() -> anyhow::Result<()> {
        let args = SimArgs {
            num_train: 50,
            num_val: 20,
            dim: 3,
            classes: 4,
            rseed: 1,
        };
        let sim = simulate_classification(&args)?;
        assert_eq!(sim.train.x.dims(), &[50, 3]);
        assert_eq!(sim.val.len(), 20);
        assert_eq!(sim.weights.len(), 16);
        for y in sim.train.y.to_vec1::<f32>()? {
            assert!((0.0..4.0).contains(&y));
        }
        Ok(())
    }

    #[test]
    fn categorical_follows_dominant_logit() -> anyhow::Result<()> {
        let mut rng = StdRng::seed_from_u64(0);
        for _ in 0..20 {
            assert_eq!(draw_categorical(&[0.0, 50.0, 0.0], &mut rng)?, 1);
        }
        Ok(())
    }

    #[test]
    fn single_class_is_refused() {
        let args = SimArgs {
            num_train: 10,
            num_val: 10,
            dim: 2,
            classes: 1,
            rseed: 0,
        };
        assert!(simulate_classification(&args).is_err());
    }
}
