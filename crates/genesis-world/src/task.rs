//! Stage tasks: the work a stage performs when a cell reaches it.

use crate::cell::Cell;
use crate::error::TaskError;
use crate::holder::CellHolder;
use crate::lighting::LightingEngine;
use crate::region::{GenerationRegion, NeighborView};
use crate::stage::{StageChain, StageId};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::Arc;

/// Completion of a stage task.
pub type TaskFuture = BoxFuture<'static, Result<(), TaskError>>;

/// What a task is running for.
#[derive(Clone)]
pub struct StageContext {
    /// Chain the stage belongs to
    pub chain: Arc<StageChain>,
    /// Stage being run
    pub stage: StageId,
    /// True for an explicit re-run on a cell already at or past the stage
    pub forced: bool,
    /// Lighting collaborator
    pub lighting: Arc<dyn LightingEngine>,
}

impl std::fmt::Debug for StageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageContext")
            .field("stage", &self.chain.get(self.stage).name())
            .field("forced", &self.forced)
            .finish_non_exhaustive()
    }
}

/// Work attached to a stage.
///
/// Both receive the dependency window, resolved before either runs.
/// `run_generation` runs when the cell has not reached the stage yet;
/// `run_load` runs instead when the cell already is at or past the stage,
/// typically because it came from storage. The default load does nothing.
pub trait StageTask: Send + Sync {
    /// Produces the stage's content for the region's center.
    fn run_generation(&self, ctx: StageContext, region: GenerationRegion) -> TaskFuture;

    /// Refreshes a cell that already has the stage's content.
    fn run_load(&self, ctx: StageContext, region: GenerationRegion) -> TaskFuture {
        let _ = (ctx, region);
        futures::future::ok(()).boxed()
    }
}

/// Task that changes nothing; only the stage marker advances.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughTask;

impl StageTask for PassthroughTask {
    fn run_generation(&self, _ctx: StageContext, _region: GenerationRegion) -> TaskFuture {
        futures::future::ok(()).boxed()
    }
}

/// Runs a synchronous closure over the locked region on the blocking pool.
pub struct SimpleTask<F> {
    work: Arc<F>,
}

impl<F> SimpleTask<F>
where
    F: Fn(&StageContext, &mut Cell, &NeighborView<'_>) -> Result<(), TaskError>
        + Send
        + Sync
        + 'static,
{
    /// Wraps `work`.
    pub fn new(work: F) -> Self {
        Self {
            work: Arc::new(work),
        }
    }
}

impl<F> StageTask for SimpleTask<F>
where
    F: Fn(&StageContext, &mut Cell, &NeighborView<'_>) -> Result<(), TaskError>
        + Send
        + Sync
        + 'static,
{
    fn run_generation(&self, ctx: StageContext, region: GenerationRegion) -> TaskFuture {
        let work = Arc::clone(&self.work);
        async move {
            tokio::task::spawn_blocking(move || {
                region.with_cells(|cell, neighbors| work(&ctx, cell, neighbors))
            })
            .await
            .map_err(|e| TaskError::Panicked(e.to_string()))?
        }
        .boxed()
    }
}

/// Hands the cell to the lighting collaborator, from both the generation
/// and the load path.
#[derive(Debug, Clone, Copy, Default)]
pub struct LightTask;

impl LightTask {
    fn light(ctx: StageContext, holder: Arc<CellHolder>) -> TaskFuture {
        async move {
            let was_lit = {
                let cell = holder.read();
                cell.stage().is_at_least(ctx.stage) && cell.is_light_correct()
            };
            ctx.lighting.light_cell(Arc::clone(&holder), was_lit).await?;
            holder.write().set_light_correct(true);
            Ok(())
        }
        .boxed()
    }
}

impl StageTask for LightTask {
    fn run_generation(&self, ctx: StageContext, region: GenerationRegion) -> TaskFuture {
        Self::light(ctx, Arc::clone(region.center()))
    }

    fn run_load(&self, ctx: StageContext, region: GenerationRegion) -> TaskFuture {
        Self::light(ctx, Arc::clone(region.center()))
    }
}
