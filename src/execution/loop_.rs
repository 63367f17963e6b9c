//! 执行循环：按顺序跑完计划中的各步
//!
//! 每步经 ToolRunner 执行（含回退），原始输出经 OutputGovernor 管控后进入工具消息；
//! 执行日志中的展示文本另按硬阈值截断。超过 max_iterations 的步骤直接丢弃。
//! 截止时间或取消信号只在两步之间检查，不会打断正在执行的工具。

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::CallBudget;
use crate::execution::governor::OutputGovernor;
use crate::react::planner::PlanStep;
use crate::tools::ToolRunner;

pub const EXECUTION_LOG_HEADER: &str = "\n\n=== TOOL EXECUTION LOG ===\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Partial,
    Failed,
    /// 空计划，什么都没跑
    Skipped,
}

/// 交回给规划/回复阶段的工具消息（已管控）
#[derive(Debug, Clone, Serialize)]
pub struct ToolMessage {
    pub call_id: String,
    pub tool: String,
    pub content: String,
    pub success: bool,
}

/// 单步执行记录
#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub step_id: u32,
    pub tool: String,
    pub original_tool: String,
    pub args: Value,
    pub output: String,
    pub success: bool,
    pub fallback_used: bool,
    pub ephemeral_id: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LastResult {
    pub tool: String,
    pub args: Value,
    pub output: String,
    pub success: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    /// 拼接好的执行日志（供校验器与回复阶段阅读）
    pub outputs: String,
    pub tool_messages: Vec<ToolMessage>,
    /// 最后一步实际使用的工具，未执行时为 "None"
    pub tool_used: String,
    pub status: ExecutionStatus,
    pub last_result: Option<LastResult>,
    pub steps: Vec<StepRecord>,
    /// 因截止时间或取消而提前结束
    pub interrupted: bool,
}

impl ExecutionResult {
    fn skipped() -> Self {
        Self {
            outputs: String::new(),
            tool_messages: Vec::new(),
            tool_used: "None".to_string(),
            status: ExecutionStatus::Skipped,
            last_result: None,
            steps: Vec::new(),
            interrupted: false,
        }
    }

    pub fn succeeded(&self) -> bool {
        matches!(self.status, ExecutionStatus::Success | ExecutionStatus::Partial)
    }
}

pub struct ExecutionLoop {
    runner: Arc<ToolRunner>,
    governor: OutputGovernor,
}

impl ExecutionLoop {
    pub fn new(runner: Arc<ToolRunner>, governor: OutputGovernor) -> Self {
        Self { runner, governor }
    }

    pub fn runner(&self) -> &ToolRunner {
        &self.runner
    }

    pub async fn execute_plan(
        &self,
        steps: &[PlanStep],
        max_iterations: usize,
        user_input: &str,
        budget: &mut CallBudget,
    ) -> ExecutionResult {
        self.execute_plan_until(steps, max_iterations, user_input, budget, None, None)
            .await
    }

    /// 与 execute_plan 相同，但在两步之间检查截止时间与取消信号
    pub async fn execute_plan_until(
        &self,
        steps: &[PlanStep],
        max_iterations: usize,
        user_input: &str,
        budget: &mut CallBudget,
        deadline: Option<Instant>,
        cancel: Option<&CancellationToken>,
    ) -> ExecutionResult {
        if steps.is_empty() {
            return ExecutionResult::skipped();
        }
        if steps.len() > max_iterations {
            tracing::debug!(
                planned = steps.len(),
                max_iterations,
                "dropping steps beyond iteration cap"
            );
        }

        let mut log_lines = Vec::new();
        let mut result = ExecutionResult::skipped();
        let mut all_ok = true;
        let mut any_ok = false;

        for step in steps.iter().take(max_iterations) {
            if cancel.is_some_and(|c| c.is_cancelled()) || deadline.is_some_and(|d| Instant::now() >= d) {
                tracing::warn!(step = step.id, "turn deadline reached, finalizing partial result");
                result.interrupted = true;
                break;
            }

            tracing::debug!(step = step.id, tool = %step.tool, "executing step");
            let run = self.runner.run(&step.tool, step.args.clone(), user_input).await;
            if run.success {
                any_ok = true;
            } else {
                all_ok = false;
            }

            let governed = self.governor.govern(&run.output, &run.tool_used).await;
            let display = if governed.was_diverted() {
                governed.content.clone()
            } else {
                self.governor.cap_for_log(&run.output)
            };
            log_lines.push(format!("Step {} ({}): {display}", step.id, run.tool_used));

            result.tool_messages.push(ToolMessage {
                call_id: format!("call_{}", step.id),
                tool: run.tool_used.clone(),
                content: governed.content.clone(),
                success: run.success,
            });
            result.last_result = Some(LastResult {
                tool: run.tool_used.clone(),
                args: run.args_used.clone(),
                output: governed.content.clone(),
                success: run.success,
            });
            result.tool_used = run.tool_used.clone();
            result.steps.push(StepRecord {
                step_id: step.id,
                tool: run.tool_used,
                original_tool: run.original_tool,
                args: run.args_used,
                output: governed.content,
                success: run.success,
                fallback_used: run.fallback_used,
                ephemeral_id: governed.ephemeral_id,
                duration_ms: run.duration_ms,
            });

            budget.record_tool_result(run.success, any_ok && !all_ok);
        }

        if result.steps.is_empty() {
            // 第一步之前就已超时
            result.status = ExecutionStatus::Failed;
            return result;
        }

        result.outputs = format!("{EXECUTION_LOG_HEADER}{}", log_lines.join("\n"));
        result.status = if all_ok {
            ExecutionStatus::Success
        } else if any_ok {
            ExecutionStatus::Partial
        } else {
            ExecutionStatus::Failed
        };
        tracing::info!(
            steps = result.steps.len(),
            status = ?result.status,
            interrupted = result.interrupted,
            "plan executed"
        );
        result
    }
}
