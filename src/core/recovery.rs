//! 错误恢复引擎
//!
//! 根据 AgentError 类型返回 RecoveryAction，供回合管线决定是重试、降级、默认通过、收尾还是上抛。

use crate::core::{AgentError, RecoveryAction};

/// 预算耗尽时对用户可见的说明
pub const BUDGET_EXHAUSTED_MESSAGE: &str = "I couldn't finish within my limits.";

/// 语义化错误恢复：将错误映射为可执行动作
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn handle(&self, err: &AgentError) -> RecoveryAction {
        match err {
            AgentError::BudgetExceeded { .. } => {
                RecoveryAction::Finalize(BUDGET_EXHAUSTED_MESSAGE.to_string())
            }
            AgentError::TurnTimeout => {
                RecoveryAction::Finalize("I ran out of time for this request.".to_string())
            }
            AgentError::ToolExecutionFailed(msg) => {
                RecoveryAction::DegradeToPartial(format!("Error: {msg}"))
            }
            AgentError::ToolTimeout(tool) => {
                RecoveryAction::DegradeToPartial(format!("Error: tool '{tool}' timed out"))
            }
            AgentError::UnknownTool(tool) => {
                RecoveryAction::DegradeToPartial(format!("Error: Tool '{tool}' not found."))
            }
            AgentError::EvaluatorUnavailable(_) => RecoveryAction::DefaultPass,
            AgentError::GraphWriteDenied { .. } => RecoveryAction::Ignore,
            AgentError::JsonParseError(raw) => RecoveryAction::RetryWithHindsight(format!(
                "Previous plan was not valid JSON ({raw}). Output a single JSON object: \
                 {{\"plan\": [{{\"id\": 1, \"tool\": \"name\", \"args\": {{...}}}}]}}"
            )),
            AgentError::PlanRejected(reason) => RecoveryAction::RetryWithHindsight(reason.clone()),
            AgentError::SoftLimitReached { .. } => RecoveryAction::Ignore,
            AgentError::LlmError(_) | AgentError::Persistence(_) | AgentError::ConfigError(_) => {
                RecoveryAction::Surface
            }
        }
    }
}
