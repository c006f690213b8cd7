mod run_cmd;
mod simulate;

use run_cmd::*;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "edamame",
    version,
    about = "Partitioned variational inference over federated data shards",
    long_about = "Fit a shared Bayesian posterior from data held by separate clients.\n\
		  Each client refines its own exponential-family factor on its private\n\
		  shard; a server merges the factors in natural-parameter space."
)]
struct Cli {
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    commands: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Simulate a partitioned classification data set and run the protocol",
        long_about = "Run partitioned variational inference in three stages: \n\
		      (1) Simulate (multinomial) logistic regression data and split it over clients\n\
		      (2) Iterate client updates and server merges until max iterations\n\
		      (3) Report the final posterior and write the per-iteration history.\n"
    )]
    Run(RunArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    match &cli.commands {
        Commands::Run(args) => {
            run(args)?;
        }
    }

    Ok(())
}
