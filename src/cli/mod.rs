// ============================================================
// Layer 1 — CLI / Presentation Layer
// ============================================================
// This is the entry point for all user interaction.
// It uses the `clap` crate to parse command line arguments.
// All business logic is delegated to Layer 2 (application).
//
// Four commands are supported:
//   1. `preprocess` — raw images + points → processed store
//   2. `train`      — trains the density network
//   3. `eval`       — scores a checkpoint on held-out data
//   4. `clean`      — removes processed stores
//
// Any error bubbles up to main, which exits non-zero.
//
// Reference: Rust Book §7 (Modules), §12 (CLI programs)

pub mod commands;

use anyhow::Result;
use clap::Parser;
use commands::{CleanArgs, Commands, EvalArgs, PreprocessArgs, TrainArgs};

#[derive(Parser, Debug)]
#[command(
    name = "crowd-density",
    version = "0.1.0",
    about = "Train a density-map regressor for crowd counting from point annotations, then evaluate its counts."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Dispatch to the matching use case. Only routes, never computes.
    pub fn run(self) -> Result<()> {
        match self.command {
            Commands::Preprocess(args) => run_preprocess(args),
            Commands::Train(args) => run_train(args),
            Commands::Eval(args) => run_eval(args),
            Commands::Clean(args) => run_clean(args),
        }
    }
}

fn run_preprocess(args: PreprocessArgs) -> Result<()> {
    use crate::application::preprocess_use_case::PreprocessUseCase;

    let summary = PreprocessUseCase::new(args.into()).execute()?;
    println!("Processed {} samples, skipped {}.", summary.processed.len(), summary.skipped.len());
    for (id, reason) in &summary.skipped {
        println!("  skipped {id}: {reason}");
    }
    Ok(())
}

fn run_train(args: TrainArgs) -> Result<()> {
    use crate::application::train_use_case::TrainUseCase;
    use crate::infra::signal::StopSignal;
    use crate::ml::trainer::TrainerState;

    tracing::info!("Starting training on '{}'", args.train_dir.display());

    let stop = StopSignal::new();
    stop.install_ctrl_c()?;

    let outcome = TrainUseCase::new(args.into()).execute(stop)?;
    match outcome.state {
        TrainerState::Stopped { step } => println!("Training stopped at step {step}."),
        _ => println!("Training complete after {} steps.", outcome.step),
    }
    if let Some(path) = &outcome.last_checkpoint {
        println!("Last checkpoint: {}", path.display());
    }
    if let Some(mae) = outcome.best_mae {
        println!("Best eval MAE: {mae:.3}");
    }
    Ok(())
}

fn run_eval(args: EvalArgs) -> Result<()> {
    use crate::application::eval_use_case::EvalUseCase;

    let report = EvalUseCase::new(args.into()).execute()?;
    println!(
        "\n{} images | MAE {:.3} | MSE {:.3} | RMSE {:.3} | MAPE {:.3}",
        report.images, report.mae, report.mse, report.rmse, report.mape
    );
    Ok(())
}

fn run_clean(args: CleanArgs) -> Result<()> {
    use crate::application::preprocess_use_case::CleanUseCase;

    let removed = CleanUseCase::new(args.processed_dirs).execute()?;
    println!("Removed {removed} processed store(s).");
    Ok(())
}
