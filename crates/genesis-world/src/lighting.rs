//! Seam to the lighting engine.

use crate::holder::CellHolder;
use crate::task::TaskFuture;
use futures::FutureExt;
use std::sync::Arc;
use tracing::trace;

/// Computes light for a cell. The pipeline only awaits the returned future
/// and records the outcome in the cell's `light_correct` flag.
pub trait LightingEngine: Send + Sync {
    /// Lights `holder`. `was_lit` is true when the cell already went through
    /// the light stage and its light is still correct, so only a cheap
    /// refresh is needed.
    fn light_cell(&self, holder: Arc<CellHolder>, was_lit: bool) -> TaskFuture;
}

/// Lighting engine that has nothing to compute.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImmediateLighting;

impl LightingEngine for ImmediateLighting {
    fn light_cell(&self, holder: Arc<CellHolder>, was_lit: bool) -> TaskFuture {
        trace!("Lighting cell {} (was lit: {was_lit})", holder.pos());
        futures::future::ok(()).boxed()
    }
}
