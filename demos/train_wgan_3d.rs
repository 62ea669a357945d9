//! Train the dual-critic 3D GAN on a synthetic bead-spring chain.
//!
//! `cargo run --release --example train_wgan_3d -- <checkpoint_dir> [nsteps]`

use std::path::PathBuf;

use polywgan::config::RunConfig;
use polywgan::data::OuChainSource;
use polywgan::registry;
use polywgan::run::train;
use polywgan::sink::TracingSink;
use polywgan::TrainBackend;

fn main() -> polywgan::Result<()> {
    tracing_subscriber::fmt::init();
    let mut args = std::env::args().skip(1);
    let dir = PathBuf::from(args.next().unwrap_or_else(|| "runs/wgan_3d".into()));
    let nsteps = args.next().and_then(|s| s.parse().ok()).unwrap_or(2048);

    let config = RunConfig {
        batch: 8,
        simlen: 6,
        t_eql: 4,
        nsteps,
        ..RunConfig::wgan_3d()
    };

    let device = Default::default();
    let mut trainer = registry::make_new::<TrainBackend>(&config, &device)?;
    let mut source = OuChainSource::from_run(&config, 16);
    let summary = train(trainer.as_mut(), &mut source, &config, &mut TracingSink, &dir)?;
    println!("{summary:?}");
    Ok(())
}
