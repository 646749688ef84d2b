//! Training command implementation.

use crate::commands::setup::RunSetup;
use anyhow::{Context, Result};
use chrono::Utc;
use colored::Colorize;
use roadseg_training::{
    build_optimizer, make_artifact, split_samples, ArtifactKind, CheckpointStore, EpochRecord,
    FitPlan, ReduceLrOnPlateau, RunManifest,
};
use tracing::info;

pub fn execute(setup: &RunSetup) -> Result<()> {
    let hyper = &setup.spec.hyperparams;
    let selection = setup.select()?;
    let (train, valid) = split_samples(&selection.samples, hyper.test_fraction, hyper.seed)
        .context("Failed to split dataset")?;
    info!(train = train.len(), valid = valid.len(), "Split dataset");

    let train_loader = setup.loader(setup.source(&train, true, hyper.augment)?, true)?;
    let valid_loader = setup.loader(setup.source(&valid, true, false)?, false)?;

    let mut training_loop = setup.build_loop()?;
    let start_epoch = setup.restore(&mut training_loop)?.unwrap_or(hyper.start_epoch);
    let mut optimizer = build_optimizer(&hyper.optimizer, hyper.learning_rate)?;
    let mut scheduler = ReduceLrOnPlateau::default();

    setup.layout.ensure_run_dirs()?;
    let store = setup.layout.checkpoint_store(&setup.spec.run_id);
    let plan = FitPlan {
        train: &train_loader,
        valid: &valid_loader,
        store: &store,
        start_epoch,
        epochs: hyper.epochs,
    };
    let records = training_loop.fit(&plan, optimizer.as_mut(), &mut scheduler)?;

    let manifest_path = setup.layout.manifest_path(&setup.spec.run_id);
    write_manifest(setup, &store, records, training_loop.best_val_loss())?.write(&manifest_path)?;

    println!();
    println!("{}", "Training complete".bold().green());
    println!("  Run: {}", setup.spec.run_id.as_str().cyan());
    println!("  Best val loss: {:.4}", training_loop.best_val_loss());
    println!("  Checkpoint: {}", store.latest_path().display().to_string().dimmed());
    println!("  Manifest: {}", manifest_path.display().to_string().dimmed());
    println!();
    Ok(())
}

fn write_manifest(
    setup: &RunSetup,
    store: &CheckpointStore,
    epochs: Vec<EpochRecord>,
    best_val_loss: f64,
) -> Result<RunManifest> {
    let mut artifacts = Vec::new();
    for (kind, path) in [
        (ArtifactKind::LatestCheckpoint, store.latest_path()),
        (ArtifactKind::BestCheckpoint, store.best_path()),
    ] {
        if path.exists() {
            artifacts.push(make_artifact(kind, path.to_path_buf())?);
        }
    }

    Ok(RunManifest {
        run_id: setup.spec.run_id.clone(),
        created_at: Utc::now(),
        arch: setup.spec.arch.clone(),
        preset: setup.spec.preset.clone(),
        mask_variant: setup.spec.mask_variant.to_string(),
        loss: setup.spec.loss.to_string(),
        best_val_loss,
        epochs,
        artifacts,
    })
}
