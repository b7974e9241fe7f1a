pub mod sequence;
pub mod signal;
pub mod stage;

pub use sequence::{ShutdownReport, ShutdownSequence, ShutdownSequenceBuilder};
pub use signal::{StopReason, StopSignal};
pub use stage::{FnStage, ShutdownStage, StageError, StageOutcome};
