use std::sync::Arc;
use std::time::Instant;

use log::{debug, info, warn};
use rand::distr::weighted::WeightedIndex;
use rand::distr::Distribution;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;

use crate::client::{Client, ClientUpdate, PviClientT, UpdateStatus};
use crate::config::{Schedule, ServerConfig};
use crate::data::Shard;
use crate::distributions::MeanFieldGaussian;
use crate::error::{PviError, Result};
use crate::factor::GaussianFactor;
use crate::history::{History, IterationRecord};
use crate::model::{evaluate_performance, Model, PerformanceMetrics};
use crate::natural_params::NaturalParams;

/// Whether [`Server::tick`] still does any work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Running,
    Stopped,
}

/// Bookkeeping for the iteration in progress
#[derive(Debug, Default)]
struct IterationStats {
    started: Option<Instant>,
    elbos: Vec<f32>,
    clients_updated: usize,
    failures: usize,
}

impl IterationStats {
    fn begin(&mut self) {
        if self.started.is_none() {
            self.started = Some(Instant::now());
        }
    }

    fn observe(&mut self, update: &ClientUpdate) {
        if let Some(elbo) = update.elbo {
            self.elbos.push(elbo);
        }
    }
}

/// Coordinator owning the global posterior.
///
/// ```text
/// q = q_init · Π_i t_i,   q_init = p unless a warm start is configured
/// ```
///
/// Each merge swaps in a new `q`; nothing is patched in place, so a
/// rejected update leaves `q` and the client's factor untouched.
pub struct Server<M: Model, C: PviClientT = Client<M>> {
    model: Arc<M>,
    p: MeanFieldGaussian,
    q_init: MeanFieldGaussian,
    q: MeanFieldGaussian,
    clients: Vec<C>,
    config: ServerConfig,
    state: ServerState,
    iterations: usize,
    communications: usize,
    next_client: usize,
    current: IterationStats,
    client_probs: Vec<f64>,
    train_data: Option<Shard>,
    val_data: Option<Shard>,
    history: History,
    rng: StdRng,
}

impl<M: Model, C: PviClientT> Server<M, C> {
    /// Set up the protocol with every factor at the identity.
    ///
    /// # Arguments
    /// * `model` - shared likelihood, also used for train/validation metrics
    /// * `p` - prior over the model's `num_parameters()` parameters
    /// * `clients` - at least one; their shards are concatenated for train metrics
    /// * `config` - validated against `clients.len()`
    ///
    /// # Returns
    /// A running server with `q = q_init`, the prior unless `init_var` is set
    pub fn new(model: Arc<M>, p: MeanFieldGaussian, clients: Vec<C>, config: ServerConfig) -> Result<Self> {
        config.validate(clients.len())?;

        if p.num_parameters() != model.num_parameters() {
            return Err(PviError::IncompatibleShape {
                left: p.dims().to_vec(),
                right: vec![model.num_parameters()],
            });
        }

        let q_init = match config.init_var {
            Some(init_var) => MeanFieldGaussian::from_init_var(p.dims(), init_var, p.device())?,
            None => p.non_trainable_copy()?,
        };

        // sample smaller shards more often
        let inv_sizes: Vec<f64> = clients
            .iter()
            .map(|c| 1.0 / c.num_data().max(1) as f64)
            .collect();
        let denom: f64 = inv_sizes.iter().sum();
        let client_probs = inv_sizes.iter().map(|w| w / denom).collect();

        let shards: Option<Vec<&Shard>> = clients.iter().map(|c| c.training_data()).collect();
        let train_data = match shards {
            Some(shards) if !shards.is_empty() => Some(Shard::concat(&shards)?),
            _ => None,
        };

        let rng = StdRng::seed_from_u64(config.seed);

        Ok(Self {
            model,
            p: p.non_trainable_copy()?,
            q: q_init.clone(),
            q_init,
            clients,
            config,
            state: ServerState::Running,
            iterations: 0,
            communications: 0,
            next_client: 0,
            current: IterationStats::default(),
            client_probs,
            train_data,
            val_data: None,
            history: History::default(),
            rng,
        })
    }

    /// Held-out data for the per-iteration `val_*` metrics
    pub fn with_validation(mut self, val_data: Shard) -> Self {
        self.val_data = Some(val_data);
        self
    }

    /// Get the current global posterior.
    pub fn q(&self) -> &MeanFieldGaussian {
        &self.q
    }

    /// Get the prior.
    pub fn p(&self) -> &MeanFieldGaussian {
        &self.p
    }

    /// Get the clients, in visiting order.
    pub fn clients(&self) -> &[C] {
        &self.clients
    }

    /// One record per completed iteration
    pub fn history(&self) -> &History {
        &self.history
    }

    /// Get the current state.
    pub fn state(&self) -> ServerState {
        self.state
    }

    /// Number of completed iterations
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Number of client updates received so far, accepted or not
    pub fn communications(&self) -> usize {
        self.communications
    }

    /// Sampling weights of the random-subset schedule, ∝ 1 / num_data
    pub fn client_probs(&self) -> &[f64] {
        &self.client_probs
    }

    /// Iteration budget; continual learning visits each client exactly once
    pub fn max_iterations(&self) -> usize {
        match self.config.schedule {
            Schedule::ContinualLearning => self.clients.len(),
            _ => self.config.max_iterations,
        }
    }

    /// True once the iteration budget is spent
    pub fn should_stop(&self) -> bool {
        self.iterations >= self.max_iterations()
    }

    /// Advance the protocol by one step of the configured schedule
    pub fn tick(&mut self) -> Result<()> {
        if self.should_stop() {
            self.state = ServerState::Stopped;
            return Ok(());
        }

        self.current.begin();
        match self.config.schedule {
            Schedule::Sequential => self.tick_sequential()?,
            Schedule::Synchronous => {
                self.tick_synchronous()?;
                self.finish_iteration()?;
            }
            Schedule::RandomSubset { num_clients } => {
                self.tick_random_subset(num_clients)?;
                self.finish_iteration()?;
            }
            Schedule::ContinualLearning => {
                self.tick_continual()?;
                self.finish_iteration()?;
            }
        }

        if self.should_stop() {
            self.state = ServerState::Stopped;
        }
        Ok(())
    }

    /// Tick until the stopping rule fires
    pub fn run(&mut self) -> Result<&History> {
        while !self.should_stop() {
            self.tick()?;
        }
        self.state = ServerState::Stopped;
        Ok(&self.history)
    }

    fn tick_sequential(&mut self) -> Result<()> {
        let idx = self.next_client;
        if self.clients[idx].can_update() {
            self.update_client(idx)?;
        } else {
            debug!("skipping client {}, not available", idx);
        }

        self.next_client += 1;
        if self.next_client == self.clients.len() {
            self.next_client = 0;
            self.finish_iteration()?;
        }
        Ok(())
    }

    fn tick_random_subset(&mut self, num_clients: usize) -> Result<()> {
        let sampler = WeightedIndex::new(&self.client_probs)
            .map_err(|e| PviError::InvalidConfig(e.to_string()))?;

        for _ in 0..num_clients {
            if !self.clients.iter().any(|c| c.can_update()) {
                info!("no client can update, ending iteration early");
                break;
            }
            let idx = sampler.sample(&mut self.rng);
            if self.clients[idx].can_update() {
                debug!("selected client {}", idx);
                self.update_client(idx)?;
            } else {
                debug!("skipping client {}, not available", idx);
            }
        }
        Ok(())
    }

    /// The next client fits against q and its local posterior becomes q.
    /// Its factor absorbs the undamped ratio `q_new / q`, so
    /// `q = q_init Π t_i` still holds after the visit.
    fn tick_continual(&mut self) -> Result<()> {
        let idx = self.next_client;
        self.next_client = (idx + 1) % self.clients.len();
        if !self.clients[idx].can_update() {
            debug!("skipping client {}, not available", idx);
            return Ok(());
        }

        let update = self.clients[idx].update(&self.q)?;
        self.communications += 1;
        self.current.observe(&update);

        if !update.q.is_valid()? {
            warn!("[client {}] returned an improper posterior, keeping q", idx);
            self.current.failures += 1;
            return Ok(());
        }

        let factor = self.clients[idx]
            .factor()
            .compute_refined_factor(&update.q, &self.q, 1.0)?;
        self.q = update.q.non_trainable_copy()?;
        self.clients[idx].set_factor(factor);
        self.current.clients_updated += 1;
        Ok(())
    }

    /// All clients against one snapshot; valid deltas are summed
    fn tick_synchronous(&mut self) -> Result<()> {
        let snapshot = self.q.non_trainable_copy()?;

        let updates: Vec<Option<Result<ClientUpdate>>> = self
            .clients
            .par_iter_mut()
            .map(|c| c.can_update().then(|| c.update(&snapshot)))
            .collect();

        let mut accepted: Vec<(usize, GaussianFactor)> = vec![];
        let mut total = NaturalParams::zeros(snapshot.dims(), snapshot.device())?;

        for (idx, update) in updates.into_iter().enumerate() {
            let Some(update) = update else {
                continue;
            };
            let update = update?;
            self.communications += 1;
            self.current.observe(&update);

            if update.status == UpdateStatus::FactorRejected {
                self.current.failures += 1;
                continue;
            }
            match self.checked_delta(idx, &snapshot, &update.factor) {
                Ok(delta) => {
                    total = total.combine(&delta)?;
                    accepted.push((idx, update.factor));
                }
                Err(err) if err.is_invalid_factor() => {
                    warn!("{}", err);
                    self.current.failures += 1;
                }
                Err(err) => return Err(err),
            }
        }

        let merged = snapshot.combine(&total)?;
        if !merged.is_valid()? {
            warn!(
                "sum of {} client deltas gives an improper posterior, keeping q",
                accepted.len()
            );
            self.current.failures += accepted.len();
            return Ok(());
        }

        self.q = merged;
        self.current.clients_updated += accepted.len();
        for (idx, factor) in accepted {
            self.clients[idx].set_factor(factor);
        }
        Ok(())
    }

    /// Ask client `idx` for a refinement against the current q and merge it
    fn update_client(&mut self, idx: usize) -> Result<()> {
        let update = self.clients[idx].update(&self.q)?;
        self.communications += 1;
        self.current.observe(&update);

        if update.status == UpdateStatus::FactorRejected {
            self.current.failures += 1;
            return Ok(());
        }

        match self.checked_delta(idx, &self.q, &update.factor) {
            Ok(delta) => {
                self.q = self.q.combine(&delta)?;
                self.clients[idx].set_factor(update.factor);
                self.current.clients_updated += 1;
                Ok(())
            }
            Err(err) if err.is_invalid_factor() => {
                warn!("{}; keeping the previous posterior", err);
                self.current.failures += 1;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// `t_new - t_old` for client `idx`, provided the factor is finite and
    /// `q * t_new / t_old` is a proper Gaussian. The factor itself may be
    /// un-normalizable (`np2 > 0`); that is the client's `valid_factors` call.
    fn checked_delta(
        &self,
        idx: usize,
        q: &MeanFieldGaussian,
        t_new: &GaussianFactor,
    ) -> Result<NaturalParams> {
        if !t_new.is_finite()? {
            return Err(PviError::InvalidFactor {
                client: idx,
                reason: "non-finite natural parameters".into(),
            });
        }
        let delta = t_new.delta_from(self.clients[idx].factor())?;
        if !q.combine(&delta)?.is_valid()? {
            return Err(PviError::InvalidFactor {
                client: idx,
                reason: "merged posterior is improper".into(),
            });
        }
        Ok(delta)
    }

    fn finish_iteration(&mut self) -> Result<()> {
        let stats = std::mem::take(&mut self.current);
        let time = stats
            .started
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or_default();

        let train = self.evaluate(self.train_data.as_ref())?;
        let val = self.evaluate(self.val_data.as_ref())?;

        let elbo_mean = if stats.elbos.is_empty() {
            None
        } else {
            Some(stats.elbos.iter().sum::<f32>() / stats.elbos.len() as f32)
        };

        let record = IterationRecord {
            iteration: self.iterations,
            time,
            communications: self.communications,
            clients_updated: stats.clients_updated,
            elbo_mean,
            elbo_last: stats.elbos.last().copied(),
            train_mll: train.map(|m| m.mll),
            train_acc: train.map(|m| m.acc),
            val_mll: val.map(|m| m.mll),
            val_acc: val.map(|m| m.acc),
            failures: stats.failures,
        };

        info!(
            "[{}] updated {} clients, {} failures, train mll {:?}, val mll {:?} ({:.2}s)",
            self.iterations + 1,
            record.clients_updated,
            record.failures,
            record.train_mll,
            record.val_mll,
            time
        );

        self.history.push(record);
        self.iterations += 1;
        Ok(())
    }

    fn evaluate(&self, data: Option<&Shard>) -> Result<Option<PerformanceMetrics>> {
        data.map(|d| evaluate_performance(self.model.as_ref(), &self.q, d))
            .transpose()
    }

    /// `max |q.np - (q_init.np + Σ_i t_i.np)|` over both components
    pub fn reconstruction_error(&self) -> Result<f32> {
        let mut expected = self.q_init.to_natural()?;
        for client in &self.clients {
            expected = expected.combine(client.factor().natural())?;
        }
        self.q.to_natural()?.max_abs_diff(&expected)
    }
}
