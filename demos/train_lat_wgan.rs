//! Train the 1D latent GAN on a synthetic bead-spring chain, conditioned on Rouse modes.
//!
//! `cargo run --release --example train_lat_wgan -- <checkpoint_dir> [nsteps]`

use std::path::PathBuf;

use polywgan::condition::Condition;
use polywgan::config::{ArchConfig, LatWganConfig, RunConfig};
use polywgan::data::{transition_pairs, OuChainSource, TrajectorySource};
use polywgan::metrics::{batched_second_moment, EVAL_BATCH, MOMENT_BATCH};
use polywgan::registry;
use polywgan::run::{predict_in_slices, train};
use polywgan::sink::TracingSink;
use polywgan::state::load_checkpoint;
use polywgan::TrainBackend;

fn main() -> polywgan::Result<()> {
    tracing_subscriber::fmt::init();
    let mut args = std::env::args().skip(1);
    let dir = PathBuf::from(args.next().unwrap_or_else(|| "runs/lat_wgan".into()));
    let nsteps = args.next().and_then(|s| s.parse().ok());

    let device = Default::default();
    let (config, mut trainer) = if dir.join("config.json").exists() {
        let (config, state) = load_checkpoint(&dir)?;
        let trainer = registry::load::<TrainBackend>(&config, &state, &device)?;
        (config, trainer)
    } else {
        let config = RunConfig {
            arch: ArchConfig::LatWgan(LatWganConfig::default()),
            poly_len: 12,
            condition: Condition::Rouse { n_modes: 3 },
            subtract_mean: true,
            batch: 8,
            simlen: 16,
            t_eql: 120,
            ..RunConfig::default()
        };
        let trainer = registry::make_new::<TrainBackend>(&config, &device)?;
        (config, trainer)
    };
    let config = RunConfig {
        nsteps: nsteps.unwrap_or(config.nsteps),
        ..config
    };

    let mut source = OuChainSource::from_run(&config, 128);
    let summary = train(trainer.as_mut(), &mut source, &config, &mut TracingSink, &dir)?;
    println!("{summary:?}");

    // Second moment of sampled one-step displacements in condition space.
    trainer.set_eval(true);
    let mut eval_source = OuChainSource::from_run(&config, 512);
    if let Some(trajs) = eval_source.next_batch()? {
        let (cond, _) = transition_pairs(&trajs.view(), &config.condition, &config.layout())?;
        let next = predict_in_slices(trainer.as_mut(), &cond.view(), EVAL_BATCH)?;
        let step = next - &cond;
        let moment = batched_second_moment(&step.view(), MOMENT_BATCH)?;
        println!("{} sampled transitions, displacement second moment:\n{moment:.4}", cond.nrows());
    }
    Ok(())
}
