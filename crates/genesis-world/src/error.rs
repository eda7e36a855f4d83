//! Error types for the stage chain, the pipeline, and stage tasks.

use genesis_common::{CellPos, Identifier, IdentifierError};
use thiserror::Error;

/// Failure of a pipeline request.
///
/// Cloneable so one failure can be observed by every waiter of a shared
/// stage future.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    /// Requested or required cell lies outside the world bounds
    #[error("cell {0} is outside the world bounds")]
    OutOfBounds(CellPos),

    /// Cell stopped being resident before the request completed
    #[error("cell {0} was unloaded")]
    Unloaded(CellPos),

    /// Reading the stored record failed
    #[error("storage failure for cell {pos}: {reason}")]
    Storage {
        /// Cell being loaded
        pos: CellPos,
        /// Underlying error message
        reason: String,
    },

    /// The stage task failed or panicked
    #[error("stage {stage} failed for cell {pos}: {reason}")]
    TaskFailed {
        /// Cell being advanced
        pos: CellPos,
        /// Stage whose task failed
        stage: Identifier,
        /// Task error message
        reason: String,
    },

    /// A neighbor could not reach the stage this request depends on
    #[error("cell {pos} depends on {neighbor}, which failed: {cause}")]
    Dependency {
        /// Cell being advanced
        pos: CellPos,
        /// Neighbor whose request failed
        neighbor: CellPos,
        /// Failure of the neighbor request
        cause: Box<PipelineError>,
    },
}

impl PipelineError {
    /// Wraps a neighbor failure.
    #[must_use]
    pub fn dependency(pos: CellPos, neighbor: CellPos, cause: Self) -> Self {
        Self::Dependency {
            pos,
            neighbor,
            cause: Box::new(cause),
        }
    }

    /// Follows `Dependency` links down to the failure that started the chain.
    #[must_use]
    pub fn root_cause(&self) -> &Self {
        match self {
            Self::Dependency { cause, .. } => cause.root_cause(),
            other => other,
        }
    }
}

/// Result type for pipeline requests.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Failure reported by a stage task.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// Task returned an error
    #[error("{0}")]
    Failed(String),

    /// Task panicked on the worker pool
    #[error("task panicked: {0}")]
    Panicked(String),

    /// Lighting collaborator failed
    #[error("lighting failed: {0}")]
    Lighting(String),
}

/// Errors raised while building a stage chain.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageChainError {
    /// Stage name is not a valid identifier
    #[error("invalid stage name: {0}")]
    InvalidName(#[from] IdentifierError),

    /// Stage name registered twice
    #[error("stage {0} is already registered")]
    DuplicateName(String),

    /// Declared parent is not the current tail of the chain
    #[error("stage {stage} must follow {expected}, not {actual}")]
    ParentMismatch {
        /// Stage being registered
        stage: String,
        /// Current tail (or `<none>`)
        expected: String,
        /// Declared parent (or `<none>`)
        actual: String,
    },

    /// More stages than a `StageId` can index
    #[error("stage {0} exceeds the limit of {max} stages", max = u8::MAX as usize + 1)]
    TooManyStages(String),

    /// A stage was registered after the final stage
    #[error("stage {0} registered after the final stage")]
    AfterFinal(String),

    /// Chain has no final stage
    #[error("stage chain has no final stage")]
    NoFinalStage,

    /// Distance table is empty
    #[error("distance table is empty")]
    EmptyDistanceTable,

    /// Distance table asks for a later stage further away
    #[error("distance table is not monotonic at distance {0}")]
    DistanceTableNotMonotonic(usize),

    /// Name in a distance table is not a registered stage
    #[error("unknown stage {0}")]
    UnknownStage(String),

    /// A stage would wait on neighbors at its own stage or later
    #[error("stage {stage} depends on neighbors at {dependency}, which is not earlier")]
    DependencyCycle {
        /// Stage with the bad dependency
        stage: String,
        /// Stage the neighbors would need
        dependency: String,
    },
}

/// Errors raised while rebuilding a cell from a persisted record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    /// Stored stage is not part of the current chain
    #[error("unknown stage {0}")]
    UnknownStage(String),

    /// Record was written with a different vertical layout
    #[error("layout mismatch: record has {sections} sections from {min_section}, expected {expected_sections} from {expected_min}")]
    LayoutMismatch {
        /// Stored section count
        sections: usize,
        /// Stored lowest section
        min_section: i32,
        /// Configured section count
        expected_sections: usize,
        /// Configured lowest section
        expected_min: i32,
    },

    /// Stored section is malformed
    #[error("section {index}: {reason}")]
    InvalidSection {
        /// Section index within the cell
        index: usize,
        /// What is wrong with it
        reason: String,
    },
}

/// Failure reported by a sub-entity ticker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct TickError(pub String);
