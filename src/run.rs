//! The training loop.
//!
//! Step `i` (counting from 0) first checks the save rule: a checkpoint is written when
//! `i % save_every == 0` or `i >= nsteps`, and the loop ends right after the save once
//! `i >= nsteps`. So a run trains exactly `nsteps` batches and writes its last checkpoint after
//! the final update. If the source runs dry first, one closing checkpoint is written.

use std::path::Path;

use ndarray::{Array2, Array3, ArrayView2};
use tracing::{debug, info, warn};

use crate::config::RunConfig;
use crate::data::{batchify, state_rows, transition_pairs, TrajectorySource};
use crate::metrics::batched_model_eval;
use crate::registry::{DataLayout, StepLosses, Trainer};
use crate::sink::MetricsSink;
use crate::state::save_checkpoint;
use crate::Result;

/// What a finished run did.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RunSummary {
    /// Training steps taken.
    pub steps: usize,
    /// Checkpoints written.
    pub saves: usize,
    pub last: Option<StepLosses>,
    /// The source ended before `nsteps`.
    pub exhausted: bool,
}

/// One trainer update on a chunk of `batch` trajectories.
pub fn step_on_chunk(
    trainer: &mut dyn Trainer,
    chunk: &Array3<f32>,
    config: &RunConfig,
) -> Result<StepLosses> {
    match trainer.layout() {
        DataLayout::Transitions => {
            let (cond, target) = transition_pairs(&chunk.view(), &config.condition, &config.layout())?;
            trainer.train_step(&target, Some(&cond))
        }
        DataLayout::States => trainer.train_step(&state_rows(&chunk.view())?, None),
    }
}

/// [`Trainer::predict`] over `input` in slices of `batch` rows, so peak memory is bounded by
/// the slice. Every architecture predicts rows as wide as its input.
pub fn predict_in_slices(
    trainer: &mut dyn Trainer,
    input: &ArrayView2<f32>,
    batch: usize,
) -> Result<Array2<f32>> {
    batched_model_eval(
        |rows: ArrayView2<f32>| trainer.predict(&rows.to_owned()),
        input,
        input.ncols(),
        batch,
    )
}

fn report(sink: &mut dyn MetricsSink, step: usize, losses: &StepLosses) {
    for (label, value) in losses.labeled() {
        if let Err(e) = sink.scalar(label, step, value) {
            warn!(sink = sink.name(), label, step, error = %e, "metrics sink failed; continuing");
        }
    }
}

fn save(trainer: &dyn Trainer, config: &RunConfig, dir: &Path, step: usize) -> Result<()> {
    save_checkpoint(dir, config, &trainer.save_state()?)?;
    info!(step, dir = %dir.display(), "saved checkpoint");
    Ok(())
}

/// Train until `config.nsteps` or until `source` ends.
///
/// Persistence and training errors propagate; sink errors are logged and ignored.
pub fn train(
    trainer: &mut dyn Trainer,
    source: &mut dyn TrajectorySource,
    config: &RunConfig,
    sink: &mut dyn MetricsSink,
    checkpoint_dir: &Path,
) -> Result<RunSummary> {
    config.validate()?;
    info!(
        arch = %trainer.arch(),
        nsteps = config.nsteps,
        save_every = config.save_every,
        batch = config.batch,
        "starting training"
    );
    let mut summary = RunSummary::default();
    let mut i = 0usize;
    while let Some(trajs) = source.next_batch()? {
        for chunk in batchify(&trajs, config.batch)? {
            if i % config.save_every == 0 || i >= config.nsteps {
                save(trainer, config, checkpoint_dir, i)?;
                summary.saves += 1;
                if i >= config.nsteps {
                    finish(sink, &summary);
                    return Ok(summary);
                }
            }
            let losses = step_on_chunk(trainer, &chunk, config)?;
            debug!(step = i, ?losses, "step");
            report(sink, i, &losses);
            summary.last = Some(losses);
            i += 1;
            summary.steps = i;
        }
    }
    warn!(steps = i, nsteps = config.nsteps, "trajectory source ended early");
    save(trainer, config, checkpoint_dir, i)?;
    summary.saves += 1;
    summary.exhausted = true;
    finish(sink, &summary);
    Ok(summary)
}

fn finish(sink: &mut dyn MetricsSink, summary: &RunSummary) {
    if let Err(e) = sink.flush() {
        warn!(sink = sink.name(), error = %e, "metrics sink flush failed");
    }
    info!(steps = summary.steps, saves = summary.saves, "training finished");
}
