//! 调用预算：单轮推理调用次数的硬上限
//!
//! 所有会发起推理调用的步骤必须先经过 record_call；达到硬上限时在自增前失败（fail closed），
//! 永不超计。软上限仅拦截非必要调用，并在必要调用越过软上限时告警。

use serde::Serialize;

use crate::config::BudgetSection;
use crate::core::AgentError;

/// 默认硬上限
pub const DEFAULT_HARD_LIMIT: usize = 8;
/// 默认软上限（超过后非必要调用被拦截）
pub const DEFAULT_SOFT_LIMIT: usize = 6;

/// 本轮工具执行结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolExecutionStatus {
    #[default]
    Unset,
    Success,
    Partial,
    Failed,
}

/// 调用日志中的一条记录
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallRecord {
    pub phase: String,
    /// 计入预算的序号；预算外调用为 None
    pub ordinal: Option<usize>,
    pub essential: bool,
    pub model: Option<String>,
}

/// 单轮调用预算
#[derive(Debug, Clone)]
pub struct CallBudget {
    call_count: usize,
    hard_limit: usize,
    soft_limit: usize,
    retry_count: usize,
    phase: String,
    hindsight: Option<String>,
    tool_execution_status: ToolExecutionStatus,
    call_log: Vec<CallRecord>,
}

impl Default for CallBudget {
    fn default() -> Self {
        Self::new(DEFAULT_HARD_LIMIT)
    }
}

impl CallBudget {
    pub fn new(hard_limit: usize) -> Self {
        Self {
            call_count: 0,
            hard_limit,
            soft_limit: DEFAULT_SOFT_LIMIT.min(hard_limit),
            retry_count: 0,
            phase: "idle".to_string(),
            hindsight: None,
            tool_execution_status: ToolExecutionStatus::Unset,
            call_log: Vec::new(),
        }
    }

    pub fn from_config(config: &BudgetSection) -> Self {
        Self::new(config.hard_limit).with_soft_limit(config.soft_limit)
    }

    /// 软上限不会高于硬上限
    pub fn with_soft_limit(mut self, soft_limit: usize) -> Self {
        self.soft_limit = soft_limit.min(self.hard_limit);
        self
    }

    /// 是否还能再发起一次调用
    pub fn can_call(&self) -> bool {
        self.call_count < self.hard_limit
    }

    pub fn remaining(&self) -> usize {
        self.hard_limit.saturating_sub(self.call_count)
    }

    pub fn is_over_soft_limit(&self) -> bool {
        self.call_count >= self.soft_limit
    }

    /// 记录一次必要调用；必须在真正调用之前执行
    pub fn record_call(&mut self, phase: &str) -> Result<(), AgentError> {
        self.record(phase, true)
    }

    /// 记录一次非必要调用：在软上限处即被拦截
    pub fn record_nonessential_call(&mut self, phase: &str) -> Result<(), AgentError> {
        self.record(phase, false)
    }

    fn record(&mut self, phase: &str, essential: bool) -> Result<(), AgentError> {
        if self.call_count >= self.hard_limit {
            tracing::warn!(
                phase,
                limit = self.hard_limit,
                log = ?self.call_log.iter().map(|c| c.phase.as_str()).collect::<Vec<_>>(),
                "call budget exhausted"
            );
            return Err(AgentError::BudgetExceeded {
                limit: self.hard_limit,
                phase: phase.to_string(),
            });
        }
        if !essential && self.call_count >= self.soft_limit {
            return Err(AgentError::SoftLimitReached {
                limit: self.soft_limit,
                phase: phase.to_string(),
            });
        }
        if self.call_count >= self.soft_limit {
            tracing::warn!(
                phase,
                call = self.call_count + 1,
                soft_limit = self.soft_limit,
                "essential call over soft limit"
            );
        }

        self.call_count += 1;
        self.phase = phase.to_string();
        self.call_log.push(CallRecord {
            phase: phase.to_string(),
            ordinal: Some(self.call_count),
            essential,
            model: None,
        });
        tracing::debug!(phase, call = self.call_count, limit = self.hard_limit, "llm budget");
        Ok(())
    }

    /// 预算外调用（如异步记忆整理）：不计数，但必须留痕
    pub fn log_out_of_budget(&mut self, phase: &str, model: &str) {
        tracing::info!(phase, model, "out-of-budget call");
        self.call_log.push(CallRecord {
            phase: phase.to_string(),
            ordinal: None,
            essential: false,
            model: Some(model.to_string()),
        });
    }

    /// 记录上一次失败原因，供重试规划使用；不消耗预算
    pub fn set_hindsight(&mut self, reason: impl Into<String>) {
        self.hindsight = Some(reason.into());
        self.retry_count += 1;
    }

    pub fn record_tool_result(&mut self, success: bool, partial: bool) {
        self.tool_execution_status = if partial {
            ToolExecutionStatus::Partial
        } else if success {
            ToolExecutionStatus::Success
        } else {
            ToolExecutionStatus::Failed
        };
    }

    /// 新一轮开始前清零
    pub fn reset(&mut self) {
        self.call_count = 0;
        self.retry_count = 0;
        self.phase = "idle".to_string();
        self.hindsight = None;
        self.tool_execution_status = ToolExecutionStatus::Unset;
        self.call_log.clear();
    }

    pub fn call_count(&self) -> usize {
        self.call_count
    }

    pub fn hard_limit(&self) -> usize {
        self.hard_limit
    }

    pub fn soft_limit(&self) -> usize {
        self.soft_limit
    }

    pub fn retry_count(&self) -> usize {
        self.retry_count
    }

    pub fn phase(&self) -> &str {
        &self.phase
    }

    pub fn hindsight(&self) -> Option<&str> {
        self.hindsight.as_deref()
    }

    pub fn tool_execution_status(&self) -> ToolExecutionStatus {
        self.tool_execution_status
    }

    pub fn call_log(&self) -> &[CallRecord] {
        &self.call_log
    }

    /// 导出为响应元数据
    pub fn to_metadata(&self) -> BudgetMetadata {
        BudgetMetadata {
            llm_calls: self.call_count,
            soft_limit: self.soft_limit,
            hard_limit: self.hard_limit,
            retries: self.retry_count,
            phase: self.phase.clone(),
            tool_status: self.tool_execution_status,
            call_log: self.call_log.iter().map(|c| c.phase.clone()).collect(),
        }
    }
}

/// CallBudget 的可序列化快照
#[derive(Debug, Clone, Serialize)]
pub struct BudgetMetadata {
    pub llm_calls: usize,
    pub soft_limit: usize,
    pub hard_limit: usize,
    pub retries: usize,
    pub phase: String,
    pub tool_status: ToolExecutionStatus,
    pub call_log: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hard_limit_fails_closed() {
        let mut budget = CallBudget::new(4);
        for phase in ["routing", "planning", "verifying", "responding"] {
            budget.record_call(phase).unwrap();
        }
        assert!(!budget.can_call());

        let err = budget.record_call("retrying").unwrap_err();
        assert!(matches!(err, AgentError::BudgetExceeded { limit: 4, .. }));
        assert_eq!(budget.call_count(), 4);
        assert_eq!(budget.phase(), "responding");
    }

    #[test]
    fn test_reset_restores_capacity() {
        let mut budget = CallBudget::new(4);
        for _ in 0..4 {
            budget.record_call("planning").unwrap();
        }
        budget.set_hindsight("wrong song");
        budget.record_tool_result(false, false);

        budget.reset();
        assert_eq!(budget.call_count(), 0);
        assert_eq!(budget.remaining(), 4);
        assert!(budget.hindsight().is_none());
        assert_eq!(budget.phase(), "idle");
        assert_eq!(budget.retry_count(), 0);
        assert_eq!(budget.tool_execution_status(), ToolExecutionStatus::Unset);
        assert!(budget.record_call("planning").is_ok());
    }

    #[test]
    fn test_hindsight_does_not_consume_budget() {
        let mut budget = CallBudget::default();
        budget.set_hindsight("tool returned nothing");
        assert_eq!(budget.call_count(), 0);
        assert_eq!(budget.retry_count(), 1);
        assert_eq!(budget.hindsight(), Some("tool returned nothing"));
    }

    #[test]
    fn test_soft_limit_blocks_nonessential_only() {
        let mut budget = CallBudget::new(4).with_soft_limit(2);
        budget.record_call("routing").unwrap();
        budget.record_call("planning").unwrap();
        assert!(budget.is_over_soft_limit());

        let err = budget.record_nonessential_call("summarizing").unwrap_err();
        assert!(matches!(err, AgentError::SoftLimitReached { limit: 2, .. }));
        assert_eq!(budget.call_count(), 2);

        budget.record_call("verifying").unwrap();
        assert_eq!(budget.call_count(), 3);
    }

    #[test]
    fn test_tool_result_does_not_touch_budget() {
        let mut budget = CallBudget::default();
        budget.record_tool_result(true, false);
        assert_eq!(budget.tool_execution_status(), ToolExecutionStatus::Success);
        budget.record_tool_result(true, true);
        assert_eq!(budget.tool_execution_status(), ToolExecutionStatus::Partial);
        budget.record_tool_result(false, false);
        assert_eq!(budget.tool_execution_status(), ToolExecutionStatus::Failed);
        assert_eq!(budget.call_count(), 0);
    }

    #[test]
    fn test_out_of_budget_calls_are_logged_not_counted() {
        let mut budget = CallBudget::default();
        budget.record_call("planning").unwrap();
        budget.log_out_of_budget("memory_judging", "small-model");

        assert_eq!(budget.call_count(), 1);
        let meta = budget.to_metadata();
        assert_eq!(meta.call_log, vec!["planning", "memory_judging"]);
        assert_eq!(meta.llm_calls, 1);
        assert!(budget.call_log()[1].ordinal.is_none());
    }
}
