//! Agent 错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：BudgetExceeded 终止本轮；工具失败、校验器不可用、图写入被拒均可恢复；
//! 持久化失败必须上抛给 save() 的调用方。

use thiserror::Error;

/// 执行核心运行过程中可能出现的错误
#[derive(Error, Debug)]
pub enum AgentError {
    /// 本轮推理调用已达硬上限（fail closed，不再计数）
    #[error("Call budget exceeded: hard limit {limit} reached at phase '{phase}'")]
    BudgetExceeded { limit: usize, phase: String },

    /// 非必要调用超过软上限
    #[error("Soft limit {limit} reached, blocking non-essential call '{phase}'")]
    SoftLimitReached { limit: usize, phase: String },

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Verifier unavailable: {0}")]
    EvaluatorUnavailable(String),

    /// 来源无权修改该实体（update_entity 返回 false，不会以此错误中断）
    #[error("Graph write denied: {entity} by {source_kind}")]
    GraphWriteDenied { entity: String, source_kind: String },

    #[error("Persistence failure: {0}")]
    Persistence(String),

    #[error("JSON parse error: {0}")]
    JsonParseError(String),

    #[error("Plan rejected: {0}")]
    PlanRejected(String),

    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Turn timed out")]
    TurnTimeout,
}

impl AgentError {
    /// 是否终止本轮（不再允许任何推理调用）
    pub fn is_fatal_to_turn(&self) -> bool {
        matches!(self, AgentError::BudgetExceeded { .. } | AgentError::TurnTimeout)
    }
}

impl From<std::io::Error> for AgentError {
    fn from(e: std::io::Error) -> Self {
        AgentError::Persistence(e.to_string())
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::Persistence(e.to_string())
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// 把失败原因作为 hindsight 交给规划器重试一次
    RetryWithHindsight(String),
    /// 记为失败步骤，保留已有输出继续
    DegradeToPartial(String),
    /// 校验器异常时默认通过
    DefaultPass,
    /// 忽略（如图写入被拒，调用方只拿到 false）
    Ignore,
    /// 立即收尾，以明确的「超出限制」结果返回
    Finalize(String),
    /// 上抛给调用方
    Surface,
}
