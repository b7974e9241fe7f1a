pub mod init;
pub mod sampler;

pub use init::{init_logging, LoggingError, LoggingGuard};
pub use sampler::{LogSampler, SampleDecision, SamplingStrategy};
