//! Per-position cell holder: the cell, its stage futures, and its
//! residency signal.

use crate::cell::Cell;
use crate::error::PipelineResult;
use crate::stage::StageId;
use futures::future::{BoxFuture, Shared};
use genesis_common::CellPos;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;

/// Shared completion of one stage on one cell. Every waiter observes the
/// same outcome.
pub type StageFuture = Shared<BoxFuture<'static, PipelineResult<()>>>;

/// Where a cell's content came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CellOrigin {
    /// Created empty and generated forward
    Fresh,
    /// Read from storage
    Loaded,
}

/// Owns one cell while it is resident in the pipeline.
pub struct CellHolder {
    pos: CellPos,
    cell: RwLock<Cell>,
    futures: Mutex<Vec<Option<StageFuture>>>,
    unloaded: watch::Sender<bool>,
    loaded: AtomicBool,
    promoted: AtomicBool,
}

impl CellHolder {
    pub(crate) fn new(cell: Cell, stage_count: usize) -> Self {
        let (unloaded, _) = watch::channel(false);
        Self {
            pos: cell.pos(),
            cell: RwLock::new(cell),
            futures: Mutex::new(vec![None; stage_count]),
            unloaded,
            loaded: AtomicBool::new(false),
            promoted: AtomicBool::new(false),
        }
    }

    /// Position of the cell.
    #[must_use]
    pub const fn pos(&self) -> CellPos {
        self.pos
    }

    /// Lock guarding the cell.
    #[must_use]
    pub fn cell(&self) -> &RwLock<Cell> {
        &self.cell
    }

    /// Shared access to the cell.
    pub fn read(&self) -> RwLockReadGuard<'_, Cell> {
        self.cell.read()
    }

    /// Exclusive access to the cell.
    pub fn write(&self) -> RwLockWriteGuard<'_, Cell> {
        self.cell.write()
    }

    /// Last stage committed for the cell.
    #[must_use]
    pub fn stage(&self) -> StageId {
        self.cell.read().stage()
    }

    /// Whether the holder is still registered with the pipeline.
    #[must_use]
    pub fn is_resident(&self) -> bool {
        !*self.unloaded.borrow()
    }

    /// Where the cell came from.
    #[must_use]
    pub fn origin(&self) -> CellOrigin {
        if self.loaded.load(Ordering::Acquire) {
            CellOrigin::Loaded
        } else {
            CellOrigin::Fresh
        }
    }

    pub(crate) fn set_loaded(&self) {
        self.loaded.store(true, Ordering::Release);
    }

    /// Future for `stage`, if one was scheduled.
    #[must_use]
    pub fn stage_future(&self, stage: StageId) -> Option<StageFuture> {
        self.futures.lock().get(stage.index()).cloned().flatten()
    }

    pub(crate) fn futures(&self) -> &Mutex<Vec<Option<StageFuture>>> {
        &self.futures
    }

    /// Returns true exactly once, for the first caller.
    pub(crate) fn mark_promoted(&self) -> bool {
        !self.promoted.swap(true, Ordering::AcqRel)
    }

    /// Signals residency loss and drops the stored stage futures.
    pub(crate) fn mark_unloaded(&self) {
        self.unloaded.send_replace(true);
        self.futures.lock().iter_mut().for_each(|slot| *slot = None);
    }

    /// Resolves once the holder is unloaded.
    pub(crate) fn wait_unloaded(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.unloaded.subscribe();
        async move {
            // A dropped sender also means the holder is gone.
            let _ = rx.wait_for(|unloaded| *unloaded).await;
        }
    }
}

impl std::fmt::Debug for CellHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellHolder")
            .field("pos", &self.pos)
            .field("resident", &self.is_resident())
            .field("origin", &self.origin())
            .finish_non_exhaustive()
    }
}
