//! # Genesis World
//!
//! Staged cell generation for an infinite grid world.
//!
//! This crate handles:
//! - The stage chain and its ticket distance table
//! - Advancing cells through the chain with neighbor dependencies
//! - Neighbor residency tracking and readiness thresholds
//! - Sub-entity ticker lifecycle
//! - Cell persistence

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]

pub mod cell;
pub mod config;
pub mod content;
pub mod error;
pub mod holder;
pub mod lighting;
pub mod neighbors;
pub mod pipeline;
pub mod region;
pub mod stage;
pub mod standard;
pub mod storage;
pub mod task;
pub mod tickers;
pub mod world;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::cell::*;
    pub use crate::config::*;
    pub use crate::content::*;
    pub use crate::error::*;
    pub use crate::holder::*;
    pub use crate::lighting::*;
    pub use crate::neighbors::*;
    pub use crate::pipeline::*;
    pub use crate::region::*;
    pub use crate::stage::*;
    pub use crate::standard::*;
    pub use crate::storage::*;
    pub use crate::task::*;
    pub use crate::tickers::*;
    pub use crate::world::*;
}

pub use prelude::*;

#[cfg(test)]
mod tests {
    use super::*;
    use genesis_common::{BlockPos, CellPos};
    use std::sync::Arc;

    #[test]
    fn test_cell_round_trips_through_storage() {
        let chain = standard::test_chain();
        let layout = CellLayout::new(0, 2, Arc::new(ContentTable::new()));
        let pos = CellPos::new(2, -3);
        let mut cell = Cell::new(pos, chain.first(), layout.clone());
        cell.mark_for_post_processing(BlockPos::new(33, 20, -47));
        cell.set_light_correct(true);

        let storage = MemoryCellStorage::new();
        storage.write(&cell.to_record(&chain)).expect("write");
        let record = storage.read(pos).expect("read").expect("stored");
        let loaded = Cell::from_record(record, &chain, layout).expect("valid record");
        assert_eq!(loaded.post_processing_len(), 1);
        assert!(loaded.is_light_correct());
        assert!(!loaded.is_unsaved());
    }

    #[test]
    fn test_default_config_builds_standard_chain() {
        let config = WorldConfig::default();
        let chain = StageChain::standard(Arc::new(EmptyGenerator), &config.distance_table)
            .expect("default table is valid");
        assert_eq!(chain.ticket_stage_for(0), chain.final_stage());
    }
}
