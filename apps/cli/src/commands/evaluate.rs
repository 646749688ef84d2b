//! Evaluate command implementation.

use crate::commands::setup::RunSetup;
use anyhow::{Context, Result};
use colored::Colorize;
use roadseg_training::split_samples;
use tracing::warn;

pub fn execute(setup: &RunSetup) -> Result<()> {
    let hyper = &setup.spec.hyperparams;
    let selection = setup.select()?;
    let (_, valid) = split_samples(&selection.samples, hyper.test_fraction, hyper.seed)
        .context("Failed to split dataset")?;
    let loader = setup.loader(setup.source(&valid, true, false)?, false)?;

    let mut training_loop = setup.build_loop()?;
    if setup.restore(&mut training_loop)?.is_none() {
        warn!("Evaluating freshly initialised weights");
    }
    let summary = training_loop.evaluate(&loader)?;

    println!();
    println!("{}", "Evaluation complete".bold().green());
    println!("  Samples: {}", valid.len());
    println!("  Val loss: {:.4}", summary.loss);
    println!("  Hard dice: {:.4}", summary.dice_hard);
    println!();
    Ok(())
}
