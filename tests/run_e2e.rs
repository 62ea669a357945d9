use polywgan::config::{ArchConfig, LatWganConfig, RunConfig};
use polywgan::data::OuChainSource;
use polywgan::registry;
use polywgan::run::train;
use polywgan::sink::HistorySink;
use polywgan::state::load_checkpoint;
use polywgan::{Result, TrainBackend};

fn run() -> RunConfig {
    RunConfig {
        arch: ArchConfig::LatWgan(LatWganConfig {
            nz: 4,
            ngf: 8,
            ndf: 8,
            ..LatWganConfig::default()
        }),
        poly_len: 3,
        subtract_mean: true,
        batch: 4,
        simlen: 4,
        nsteps: 6,
        save_every: 4,
        seed: 2,
        ..RunConfig::default()
    }
}

#[test]
fn train_then_resume_from_checkpoint() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let device = Default::default();
    let dir = tempfile::tempdir()?;
    let config = run();

    let mut trainer = registry::make_new::<TrainBackend>(&config, &device)?;
    let mut source = OuChainSource::from_run(&config, 4);
    let mut sink = HistorySink::new();
    let summary = train(trainer.as_mut(), &mut source, &config, &mut sink, dir.path())?;
    assert_eq!(summary.steps, 6);
    // i = 0, 4 and the closing save at i = 6.
    assert_eq!(summary.saves, 3);
    assert_eq!(
        sink.series("loss_d").iter().map(|p| p.0).collect::<Vec<_>>(),
        vec![0, 1, 2, 3, 4, 5]
    );

    let (config_back, state) = load_checkpoint(dir.path())?;
    assert_eq!(config_back, config);
    let mut resumed = registry::load::<TrainBackend>(&config_back, &state, &device)?;
    let more = RunConfig {
        nsteps: 2,
        ..config_back
    };
    let out = tempfile::tempdir()?;
    let summary = train(
        resumed.as_mut(),
        &mut OuChainSource::from_run(&more, 1),
        &more,
        &mut HistorySink::new(),
        out.path(),
    )?;
    assert_eq!(summary.steps, 2);
    assert!(summary.last.is_some());
    Ok(())
}
