//! 回合过程事件：供前端或日志订阅规划、执行、校验与重试的进度

use serde::Serialize;

/// 单个回合内的过程事件（可序列化为 JSON）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    /// 开始第 attempt 次规划（从 1 开始）
    Planning { attempt: usize },
    /// 计划就绪
    PlanReady { tools: Vec<String> },
    /// 计划被记忆图否决
    PlanRejected { step_id: u32, reason: String },
    /// 单步工具结果（预览）
    ToolResult {
        tool: String,
        success: bool,
        preview: String,
    },
    Verdict { passed: bool, reason: String },
    /// 带着 hindsight 重新规划
    Retry { hindsight: String },
    BudgetExhausted { calls: usize },
    Done { status: String },
}
