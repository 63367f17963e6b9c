//! 执行层：回退表、输出管控与执行循环

pub mod fallback;
pub mod governor;
pub mod loop_;

pub use fallback::{default_fallbacks, is_soft_failure, FallbackTable};
pub use governor::{GovernedOutput, OutputGovernor};
pub use loop_::{ExecutionLoop, ExecutionResult, ExecutionStatus, LastResult, StepRecord, ToolMessage};

/// 单轮最多执行的计划步数
pub const DEFAULT_MAX_ITERATIONS: usize = 3;
