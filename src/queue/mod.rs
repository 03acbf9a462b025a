// 阶段队列引擎模块

pub mod engine;
pub mod journal;
pub mod regroup;
pub mod retry;
pub mod workers;

pub use engine::{Acquired, EngineStatus, FailOutcome, QuarantineRecord, QueueEngine, StageQueue};
pub use retry::RetryQueue;
