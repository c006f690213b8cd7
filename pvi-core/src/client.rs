use std::sync::Arc;

use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use log::{debug, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::config::{ClientConfig, ScoreName};
use crate::data::Shard;
use crate::distributions::MeanFieldGaussian;
use crate::early_stopping::{EarlyStopping, StopReason};
use crate::error::{PviError, Result};
use crate::factor::GaussianFactor;
use crate::model::{evaluate_performance, Model, PerformanceMetrics};

/// Train (and optionally validation) metrics of a client's refined q
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClientMetrics {
    pub train: PerformanceMetrics,
    pub val: Option<PerformanceMetrics>,
}

/// Per-epoch traces of one local optimisation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingCurve {
    pub elbo: Vec<f32>,
    pub kl: Vec<f32>,
    pub ll: Vec<f32>,
    /// epoch whose parameters were reported, when the best snapshot was restored
    pub stashed_epoch: Option<usize>,
    pub metrics: Option<ClientMetrics>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStatus {
    Converged(StopReason),
    /// the refined factor left the admissible domain; the old one is returned
    FactorRejected,
}

/// What a client hands back to the server after a local fit
#[derive(Debug, Clone)]
pub struct ClientUpdate {
    /// locally refined posterior
    pub q: MeanFieldGaussian,
    /// candidate replacement of the client's factor
    pub factor: GaussianFactor,
    pub status: UpdateStatus,
    /// ELBO of the reported epoch, if the client optimised anything
    pub elbo: Option<f32>,
    pub metrics: Option<ClientMetrics>,
}

/// Server-facing side of a client.
///
/// The client never commits its own factor; the server calls
/// [`PviClientT::set_factor`] once a merge has been validated.
pub trait PviClientT: Send {
    /// Refine this client's factor against the global posterior `q`
    fn update(&mut self, q: &MeanFieldGaussian) -> Result<ClientUpdate>;

    fn factor(&self) -> &GaussianFactor;

    fn set_factor(&mut self, factor: GaussianFactor);

    /// number of private training observations
    fn num_data(&self) -> usize;

    fn can_update(&self) -> bool;

    fn training_data(&self) -> Option<&Shard> {
        None
    }
}

/// Scores a posterior on a shard; [`evaluate_performance`] unless replaced
pub type PerformanceMetricsFn<M> =
    fn(&M, &MeanFieldGaussian, &Shard) -> Result<PerformanceMetrics>;

/// A data-holding client fitting its factor by stochastic optimisation
pub struct Client<M: Model> {
    id: usize,
    model: Arc<M>,
    data: Shard,
    val_data: Option<Shard>,
    performance_metrics: PerformanceMetricsFn<M>,
    factor: GaussianFactor,
    config: ClientConfig,
    training_curves: Vec<TrainingCurve>,
    num_updates: usize,
    in_flight: bool,
    rng: StdRng,
}

impl<M: Model> Client<M> {
    pub fn new(id: usize, model: Arc<M>, data: Shard, config: ClientConfig) -> Result<Self> {
        config.validate()?;
        if data.is_empty() {
            return Err(PviError::EmptyShard);
        }
        let factor = GaussianFactor::identity(model.num_parameters(), data.x.device())?;
        let rng = StdRng::seed_from_u64(config.seed.wrapping_add(id as u64));
        Ok(Self {
            id,
            model,
            data,
            val_data: None,
            performance_metrics: evaluate_performance::<M>,
            factor,
            config,
            training_curves: vec![],
            num_updates: 0,
            in_flight: false,
            rng,
        })
    }

    pub fn with_validation(mut self, val_data: Shard) -> Self {
        self.val_data = Some(val_data);
        self
    }

    pub fn with_performance_metrics(mut self, f: PerformanceMetricsFn<M>) -> Self {
        self.performance_metrics = f;
        self
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn training_curves(&self) -> &[TrainingCurve] {
        &self.training_curves
    }

    fn fit(&mut self, q_global: &MeanFieldGaussian) -> Result<ClientUpdate> {
        let cfg = &self.config;
        let q_old = q_global.non_trainable_copy()?;
        let q = q_global.trainable_copy()?;

        let mut adam = AdamW::new(
            q.vars(),
            ParamsAdamW {
                lr: cfg.optimiser.learning_rate,
                weight_decay: cfg.optimiser.weight_decay,
                ..Default::default()
            },
        )?;

        let ntot = self.data.len() as f64;
        let mut curve = TrainingCurve::default();
        let mut stopper = EarlyStopping::new(&cfg.early_stopping);
        let mut stop = StopReason::MaxEpochs;

        for epoch in 0..cfg.epochs {
            let (mut elbo_tot, mut kl_tot, mut ll_tot) = (0f32, 0f32, 0f32);
            let mut num_batches = 0usize;

            for batch in self.data.minibatches(cfg.batch_size, &mut self.rng)? {
                let kl = (q.kl_divergence(&q_old)? / ntot)?;

                let (_, terms) = self
                    .model
                    .sample_and_score(&q, &batch, cfg.num_elbo_samples)?;
                let mut llik = (terms.log_likelihood.mean(0)?.sum_all()? / batch.len() as f64)?;
                if cfg.cavity_correction {
                    llik = (llik - (self.factor.eqlogt(&q)? / ntot)?)?;
                }

                let loss = (&kl - &llik)?;
                adam.backward_step(&loss)?;

                elbo_tot -= loss.to_scalar::<f32>()?;
                kl_tot += kl.to_scalar::<f32>()?;
                ll_tot += llik.to_scalar::<f32>()?;
                num_batches += 1;
            }

            curve.elbo.push(elbo_tot);
            curve.kl.push(kl_tot);
            curve.ll.push(ll_tot);

            if epoch % cfg.print_epochs == 0 {
                debug!(
                    "[client {}] epoch {}: ELBO {:.3}, LL {:.3}, KL {:.3}",
                    self.id, epoch, elbo_tot, ll_tot, kl_tot
                );
            }

            let score = match cfg.early_stopping.score {
                ScoreName::Elbo => elbo_tot,
                ScoreName::NegatedLoss => elbo_tot / num_batches.max(1) as f32,
                ScoreName::LogLikelihood => ll_tot,
            };
            if let Some(reason) = stopper.observe(epoch, score, &q)? {
                debug!("[client {}] no improvement, stopping at epoch {}", self.id, epoch);
                stop = reason;
                break;
            }
        }

        curve.stashed_epoch = stopper
            .best()
            .filter(|_| cfg.early_stopping.stash_model)
            .map(|best| best.epoch);
        let q_new = stopper.resolve(&q)?;
        let candidate = self
            .factor
            .compute_refined_factor(&q_new, &q_old, cfg.damping_factor)?;

        let (factor, status) = if cfg.valid_factors && !candidate.is_valid()? {
            warn!("[client {}] refined factor is invalid, keeping the old one", self.id);
            (self.factor.clone(), UpdateStatus::FactorRejected)
        } else {
            (candidate, UpdateStatus::Converged(stop))
        };

        self.num_updates += 1;
        let metrics = match cfg.metrics_every {
            Some(every) if self.num_updates % every == 0 => Some(self.evaluate(&q_new)?),
            _ => None,
        };
        curve.metrics = metrics;

        let elbo = match curve.stashed_epoch {
            Some(epoch) => curve.elbo.get(epoch).copied(),
            None => curve.elbo.last().copied(),
        };
        self.training_curves.push(curve);

        Ok(ClientUpdate {
            q: q_new,
            factor,
            status,
            elbo,
            metrics,
        })
    }

    /// Performance of `q` on this client's training and validation shards
    pub fn evaluate(&self, q: &MeanFieldGaussian) -> Result<ClientMetrics> {
        let score = self.performance_metrics;
        let train = score(self.model.as_ref(), q, &self.data)?;
        let val = self
            .val_data
            .as_ref()
            .map(|val| score(self.model.as_ref(), q, val))
            .transpose()?;
        Ok(ClientMetrics { train, val })
    }
}

impl<M: Model> PviClientT for Client<M> {
    fn update(&mut self, q: &MeanFieldGaussian) -> Result<ClientUpdate> {
        self.in_flight = true;
        let result = self.fit(q);
        self.in_flight = false;
        result
    }

    fn factor(&self) -> &GaussianFactor {
        &self.factor
    }

    fn set_factor(&mut self, factor: GaussianFactor) {
        self.factor = factor;
    }

    fn num_data(&self) -> usize {
        self.data.len()
    }

    fn can_update(&self) -> bool {
        !self.in_flight
    }

    fn training_data(&self) -> Option<&Shard> {
        Some(&self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LogisticRegression;
    use crate::natural_params::NaturalParams;
    use candle_core::{DType, Device, Tensor};

    fn separable(n: usize) -> Result<Shard> {
        let dev = Device::Cpu;
        let xs: Vec<f32> = (0..n).map(|i| (i as f32 / n as f32) * 4.0 - 2.0).collect();
        let ys: Vec<f32> = xs.iter().map(|&x| if x > 0.0 { 1.0 } else { 0.0 }).collect();
        Shard::new(
            Tensor::from_slice(&xs, (n, 1), &dev)?,
            Tensor::from_slice(&ys, n, &dev)?,
        )
    }

    fn quick_config() -> ClientConfig {
        ClientConfig {
            epochs: 20,
            batch_size: 16,
            num_elbo_samples: 4,
            optimiser: crate::config::OptimiserConfig {
                learning_rate: 0.05,
                weight_decay: 0.0,
            },
            metrics_every: Some(1),
            ..Default::default()
        }
    }

    #[test]
    fn update_returns_a_valid_factor_without_committing_it() -> Result<()> {
        let model = Arc::new(LogisticRegression::new(1));
        let mut client = Client::new(0, model, separable(64)?, quick_config())?;
        let q = MeanFieldGaussian::prior(2, 1.0, &Device::Cpu)?;

        assert!(client.can_update());
        let update = client.update(&q)?;
        assert!(client.can_update());

        assert!(matches!(update.status, UpdateStatus::Converged(_)));
        assert!(update.factor.is_valid()?);
        assert!(update.q.is_valid()?);
        assert!(update.elbo.is_some());
        assert!(update.metrics.is_some());
        assert_eq!(client.training_curves().len(), 1);

        // still the identity until the server commits
        assert_eq!(client.factor().natural().np1.to_vec1::<f32>()?, vec![0.0, 0.0]);

        // positive slope on separable data
        let slope = update.q.mean()?.to_vec1::<f32>()?[0];
        assert!(slope > 0.0, "slope {}", slope);
        Ok(())
    }

    fn widening_factor(np2: f32) -> Result<GaussianFactor> {
        let dev = Device::Cpu;
        Ok(GaussianFactor::from_natural(NaturalParams::new(
            Tensor::zeros(2, DType::F32, &dev)?,
            Tensor::new(&[np2, np2], &dev)?,
        )?))
    }

    #[test]
    fn positive_np2_factor_is_rejected_only_when_asked() -> Result<()> {
        let model = Arc::new(LogisticRegression::new(1));
        let q = MeanFieldGaussian::prior(2, 1.0, &Device::Cpu)?;

        for valid_factors in [true, false] {
            // one small step keeps the refinement close to t_old
            let config = ClientConfig {
                valid_factors,
                epochs: 1,
                batch_size: 64,
                optimiser: crate::config::OptimiserConfig {
                    learning_rate: 1e-3,
                    weight_decay: 0.0,
                },
                ..quick_config()
            };
            let mut client = Client::new(0, model.clone(), separable(64)?, config)?;
            client.set_factor(widening_factor(0.25)?);

            let update = client.update(&q)?;
            let np2 = update.factor.natural().np2.to_vec1::<f32>()?;
            if valid_factors {
                assert_eq!(update.status, UpdateStatus::FactorRejected);
                assert_eq!(np2, vec![0.25, 0.25]);
            } else {
                assert!(matches!(update.status, UpdateStatus::Converged(_)));
                assert!(np2.iter().all(|&v| v > 0.2), "np2 {:?}", np2);
                assert!(update.factor.is_finite()?);
            }
            assert!(update.q.is_valid()?);
        }
        Ok(())
    }

    #[test]
    fn cavity_correction_fits_against_the_local_factor() -> Result<()> {
        let model = Arc::new(LogisticRegression::new(1));
        let config = ClientConfig {
            cavity_correction: true,
            epochs: 5,
            ..quick_config()
        };
        let mut client = Client::new(0, model, separable(32)?, config)?;

        let t = widening_factor(-0.25)?;
        let q = MeanFieldGaussian::prior(2, 1.0, &Device::Cpu)?.combine(t.natural())?;
        client.set_factor(t);

        let update = client.update(&q)?;
        assert!(matches!(update.status, UpdateStatus::Converged(_)));
        assert!(update.q.is_valid()?);
        assert!(update.factor.is_valid()?);

        let curve = &client.training_curves()[0];
        assert_eq!(curve.ll.len(), 5);
        assert!(curve.ll.iter().chain(curve.elbo.iter()).all(|v| v.is_finite()));
        Ok(())
    }

    #[test]
    fn early_stopping_reports_the_best_epoch() -> Result<()> {
        let model = Arc::new(LogisticRegression::new(1));
        let q = MeanFieldGaussian::prior(2, 1.0, &Device::Cpu)?;

        // one minibatch per epoch, so the negated loss ranks epochs like the ELBO
        for (stash_model, score) in [
            (true, ScoreName::Elbo),
            (false, ScoreName::Elbo),
            (true, ScoreName::NegatedLoss),
        ] {
            let config = ClientConfig {
                epochs: 500,
                batch_size: 32,
                num_elbo_samples: 1,
                early_stopping: crate::config::EarlyStoppingConfig {
                    patience: 2,
                    score,
                    stash_model,
                },
                ..quick_config()
            };
            let mut client = Client::new(0, model.clone(), separable(32)?, config)?;
            let update = client.update(&q)?;

            // a noisy one-sample ELBO cannot keep improving for 500 epochs
            let UpdateStatus::Converged(StopReason::NoImprovement { epoch }) = update.status else {
                panic!("expected early stop, got {:?}", update.status);
            };
            let curve = &client.training_curves()[0];
            assert_eq!(curve.elbo.len(), epoch + 1);

            if stash_model {
                let best = curve.stashed_epoch.expect("a stashed snapshot");
                assert_eq!(best + 2, epoch);
                assert!(curve.elbo.iter().all(|&e| e <= curve.elbo[best]));
                assert_eq!(update.elbo, Some(curve.elbo[best]));
            } else {
                assert_eq!(curve.stashed_epoch, None);
                assert_eq!(update.elbo, curve.elbo.last().copied());
            }
        }
        Ok(())
    }

    #[test]
    fn custom_performance_metrics() -> Result<()> {
        fn constant(
            _: &LogisticRegression,
            _: &MeanFieldGaussian,
            _: &Shard,
        ) -> Result<PerformanceMetrics> {
            Ok(PerformanceMetrics { mll: -1.0, acc: 0.5 })
        }

        let model = Arc::new(LogisticRegression::new(1));
        let client = Client::new(0, model, separable(8)?, quick_config())?
            .with_validation(separable(4)?)
            .with_performance_metrics(constant);
        let q = MeanFieldGaussian::prior(2, 1.0, &Device::Cpu)?;
        let metrics = client.evaluate(&q)?;
        assert_eq!(metrics.train.acc, 0.5);
        assert_eq!(metrics.val.map(|m| m.mll), Some(-1.0));
        Ok(())
    }

    #[test]
    fn bad_configuration_is_refused() -> Result<()> {
        let model = Arc::new(LogisticRegression::new(1));
        let config = ClientConfig {
            damping_factor: 2.0,
            ..Default::default()
        };
        assert!(Client::new(0, model, separable(8)?, config).is_err());
        Ok(())
    }
}
