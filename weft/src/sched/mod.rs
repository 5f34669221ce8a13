//! Admission control: AIMD congestion windows and the weighted fair queue.

pub mod aimd;
pub mod fair;

pub use aimd::{AimdController, AimdStateBackend, MemoryAimdBackend, WindowSource};
pub use fair::{FairScheduler, MemorySchedulerBackend, SchedulerStateBackend, SchedulerStats};
