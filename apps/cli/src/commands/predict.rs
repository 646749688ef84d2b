//! Prediction command implementation.

use crate::commands::setup::RunSetup;
use anyhow::Result;
use colored::Colorize;
use roadseg_training::PredictionWriter;
use tracing::warn;

pub fn execute(setup: &RunSetup) -> Result<()> {
    let selection = setup.select()?;
    let loader = setup.loader(setup.source(&selection.samples, false, false)?, false)?;

    let mut training_loop = setup.build_loop()?;
    if setup.restore(&mut training_loop)?.is_none() {
        warn!("Predicting with freshly initialised weights");
    }

    let writer = PredictionWriter::new(
        setup.layout.prediction_root().to_path_buf(),
        setup.spec.run_id.clone(),
    );
    let written = training_loop.predict(&loader, &selection.samples, &writer)?;

    println!();
    println!("{}", "Predictions written".bold().green());
    println!("  Masks: {written}");
    println!("  Under: {}", setup.layout.prediction_root().display().to_string().dimmed());
    println!();
    Ok(())
}
