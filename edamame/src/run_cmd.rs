use std::fs::File;
use std::io::BufWriter;
use std::sync::Arc;

use candle_core::Device;
use clap::{Args, ValueEnum};
use log::info;
use pvi_core::{
    Client, ClientConfig, EarlyStoppingConfig, History, LogisticRegression, MeanFieldGaussian,
    Model, MulticlassLogisticRegression, OptimiserConfig, Schedule, Server, ServerConfig, Shard,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::simulate::{simulate_classification, SimArgs};

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScheduleArg {
    Sequential,
    Synchronous,
    RandomSubset,
    /// each client once, passing q along
    ContinualLearning,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// number of clients the training data is split over
    #[arg(long, default_value_t = 4)]
    pub num_clients: usize,

    /// total number of training observations
    #[arg(long, default_value_t = 2000)]
    pub num_train: usize,

    /// number of held-out observations
    #[arg(long, default_value_t = 500)]
    pub num_val: usize,

    /// input dimension
    #[arg(long, default_value_t = 5)]
    pub dim: usize,

    /// number of classes (2: logistic regression, more: softmax regression)
    #[arg(long, default_value_t = 2)]
    pub classes: usize,

    /// random seed for simulation, data splits and minibatches
    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    #[arg(long, value_enum, default_value = "sequential")]
    pub schedule: ScheduleArg,

    /// clients visited per iteration by the random-subset schedule
    #[arg(long)]
    pub subset_size: Option<usize>,

    /// ignored by the continual-learning schedule, which visits each client once
    #[arg(long, default_value_t = 10)]
    pub max_iterations: usize,

    /// damping factor in (0, 1]
    #[arg(long, default_value_t = 1.0)]
    pub damping: f64,

    /// local epochs per client update
    #[arg(long, default_value_t = 100)]
    pub epochs: usize,

    #[arg(long, default_value_t = 100)]
    pub batch_size: usize,

    /// learning rate
    #[arg(long, default_value_t = 1e-2)]
    pub lr: f64,

    /// Monte Carlo samples per ELBO estimate
    #[arg(long, default_value_t = 10)]
    pub samples: usize,

    /// early-stopping patience in epochs
    #[arg(long, default_value_t = 10)]
    pub patience: usize,

    /// JSON file with `{"client": {...}, "server": {...}}`, overrides the flags above
    #[arg(long)]
    pub config: Option<Box<str>>,

    /// output JSON file (history and final posterior)
    #[arg(short, long)]
    pub output: Option<Box<str>>,
}

/// Everything that configures one protocol run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub client: ClientConfig,
    pub server: ServerConfig,
}

impl RunConfig {
    fn from_args(args: &RunArgs) -> Self {
        let schedule = match args.schedule {
            ScheduleArg::Sequential => Schedule::Sequential,
            ScheduleArg::Synchronous => Schedule::Synchronous,
            ScheduleArg::RandomSubset => Schedule::RandomSubset {
                num_clients: args.subset_size.unwrap_or((args.num_clients / 2).max(1)),
            },
            ScheduleArg::ContinualLearning => Schedule::ContinualLearning,
        };

        let client = ClientConfig {
            damping_factor: args.damping,
            optimiser: OptimiserConfig {
                learning_rate: args.lr,
                ..Default::default()
            },
            batch_size: args.batch_size,
            epochs: args.epochs,
            num_elbo_samples: args.samples,
            early_stopping: EarlyStoppingConfig {
                patience: args.patience,
                ..Default::default()
            },
            seed: args.seed,
            ..Default::default()
        };

        let server = ServerConfig {
            max_iterations: args.max_iterations,
            schedule,
            seed: args.seed,
            ..Default::default()
        };

        Self { client, server }
    }
}

#[derive(Serialize)]
struct RunOutput<'a> {
    config: &'a RunConfig,
    history: &'a History,
    q_loc: Vec<f32>,
    q_scale: Vec<f32>,
    true_weights: &'a [f32],
}

pub fn run(args: &RunArgs) -> anyhow::Result<()> {
    let config = match &args.config {
        Some(file) => {
            let reader = File::open(file.as_ref())?;
            let config: RunConfig = serde_json::from_reader(reader)?;
            info!("read configuration from {}", file);
            config
        }
        None => RunConfig::from_args(args),
    };

    let sim = simulate_classification(&SimArgs {
        num_train: args.num_train,
        num_val: args.num_val,
        dim: args.dim,
        classes: args.classes,
        rseed: args.seed,
    })?;

    if args.num_clients == 0 || args.num_clients > sim.train.len() {
        anyhow::bail!(
            "cannot split {} observations over {} clients",
            sim.train.len(),
            args.num_clients
        );
    }

    let mut rng = StdRng::seed_from_u64(args.seed);
    let shards = sim.train.split(args.num_clients, &mut rng)?;
    info!(
        "simulated {} training rows over {} clients, {} validation rows",
        sim.train.len(),
        shards.len(),
        sim.val.len()
    );

    let (q_loc, q_scale, history) = if args.classes == 2 {
        let model = Arc::new(LogisticRegression::new(args.dim));
        fit(model, shards, &sim.val, &config)?
    } else {
        let model = Arc::new(MulticlassLogisticRegression::new(args.dim, args.classes));
        fit(model, shards, &sim.val, &config)?
    };

    if let Some(last) = history.last() {
        info!(
            "done after {} iterations: val mll {:?}, val acc {:?}, {} failures in total",
            history.len(),
            last.val_mll,
            last.val_acc,
            history.total_failures()
        );
    }
    for (j, (m, s)) in q_loc.iter().zip(q_scale.iter()).enumerate().take(10) {
        info!("q[{}] = N({:.3}, {:.3}²)", j, m, s);
    }

    if let Some(output) = &args.output {
        let out = RunOutput {
            config: &config,
            history: &history,
            q_loc,
            q_scale,
            true_weights: &sim.weights,
        };
        let writer = BufWriter::new(File::create(output.as_ref())?);
        serde_json::to_writer_pretty(writer, &out)?;
        info!("wrote {}", output);
    }

    Ok(())
}

/// Run the protocol to termination; returns the posterior (loc, scale) and history
fn fit<M: Model>(
    model: Arc<M>,
    shards: Vec<Shard>,
    val: &Shard,
    config: &RunConfig,
) -> anyhow::Result<(Vec<f32>, Vec<f32>, History)> {
    let clients = shards
        .into_iter()
        .enumerate()
        .map(|(i, shard)| -> anyhow::Result<Client<M>> {
            let client = Client::new(i, model.clone(), shard, config.client.clone())?;
            Ok(client.with_validation(val.clone()))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let prior = MeanFieldGaussian::prior(model.num_parameters(), 1.0, &Device::Cpu)?;
    let mut server = Server::new(model, prior, clients, config.server.clone())?
        .with_validation(val.clone());

    server.run()?;
    info!(
        "{} communications, reconstruction error {:.2e}",
        server.communications(),
        server.reconstruction_error()?
    );

    let (loc, scale) = server.q().to_standard()?;
    Ok((
        loc.to_vec1::<f32>()?,
        scale.to_vec1::<f32>()?,
        server.history().clone(),
    ))
}
