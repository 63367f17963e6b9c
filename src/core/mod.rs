//! 核心层：调用预算、错误分类与恢复

pub mod budget;
pub mod error;
pub mod recovery;

pub use budget::{BudgetMetadata, CallBudget, CallRecord, ToolExecutionStatus};
pub use error::{AgentError, RecoveryAction};
pub use recovery::{RecoveryEngine, BUDGET_EXHAUSTED_MESSAGE};
