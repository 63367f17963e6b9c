//! 工具运行器
//!
//! 持有 ToolRegistry、单次超时与回退表。run() 从不返回错误：未知工具、工具 Err、超时
//! 都经 RecoveryEngine 转为 "Error: …" 字符串；硬失败或软失败文本触发一次回退。
//! 每次实际调用输出一条结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tokio::time::timeout;

use crate::core::{AgentError, RecoveryAction, RecoveryEngine};
use crate::execution::fallback::{is_soft_failure, FallbackTable};
use crate::tools::ToolRegistry;

/// 一次工具运行（含可能的回退）的结果
#[derive(Debug, Clone, Serialize)]
pub struct ToolRunResult {
    pub output: String,
    pub success: bool,
    /// 实际产出 output 的工具（回退时为回退工具）
    pub tool_used: String,
    pub original_tool: String,
    /// 实际调用时使用的参数（回退时为重建后的参数）
    pub args_used: Value,
    pub fallback_used: bool,
    pub duration_ms: u64,
}

pub struct ToolRunner {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
    fallbacks: FallbackTable,
    recovery: RecoveryEngine,
}

impl ToolRunner {
    pub fn new(registry: Arc<ToolRegistry>, timeout_secs: u64, fallbacks: FallbackTable) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs),
            fallbacks,
            recovery: RecoveryEngine::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn fallbacks(&self) -> &FallbackTable {
        &self.fallbacks
    }

    /// 单次调用：施加超时并写审计日志
    pub async fn invoke(&self, tool_name: &str, args: Value) -> Result<String, AgentError> {
        let start = Instant::now();
        let preview = args_preview(&args);
        let result = timeout(self.timeout, self.registry.execute(tool_name, args)).await;

        let (ok, outcome): (bool, &str) = match &result {
            Ok(Ok(_)) => (true, "ok"),
            Ok(Err(AgentError::UnknownTool(_))) => (false, "unknown_tool"),
            Ok(Err(_)) => (false, "error"),
            Err(_) => (false, "timeout"),
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool_name,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        match result {
            Ok(inner) => inner,
            Err(_) => Err(AgentError::ToolTimeout(tool_name.to_string())),
        }
    }

    /// 运行工具；失败时按回退表换工具再试一次
    pub async fn run(&self, tool_name: &str, args: Value, user_input: &str) -> ToolRunResult {
        let start = Instant::now();
        let (output, success, hard_failure) = match self.invoke(tool_name, args.clone()).await {
            Ok(out) => (out, true, false),
            Err(e) => (self.error_text(&e), false, true),
        };

        if hard_failure || is_soft_failure(&output) {
            if let Some(result) = self.try_fallback(tool_name, &args, user_input, start).await {
                return result;
            }
        }

        ToolRunResult {
            output,
            success,
            tool_used: tool_name.to_string(),
            original_tool: tool_name.to_string(),
            args_used: args,
            fallback_used: false,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    async fn try_fallback(
        &self,
        tool_name: &str,
        args: &Value,
        user_input: &str,
        start: Instant,
    ) -> Option<ToolRunResult> {
        let fallback = self.fallbacks.get(tool_name)?;
        if !self.registry.contains(fallback) {
            tracing::debug!(tool = tool_name, fallback, "fallback tool not registered");
            return None;
        }
        let term = self.fallbacks.search_term(args, user_input)?;
        let fb_args = self.fallbacks.build_args(fallback, &term);
        tracing::info!(tool = tool_name, fallback, term = %term, "trying fallback");

        match self.invoke(fallback, fb_args.clone()).await {
            Ok(out) => Some(ToolRunResult {
                output: format!("[Fallback: {fallback}] {out}"),
                success: true,
                tool_used: fallback.to_string(),
                original_tool: tool_name.to_string(),
                args_used: fb_args,
                fallback_used: true,
                duration_ms: start.elapsed().as_millis() as u64,
            }),
            Err(e) => {
                tracing::warn!(tool = tool_name, fallback, error = %e, "fallback failed");
                None
            }
        }
    }

    fn error_text(&self, err: &AgentError) -> String {
        match self.recovery.handle(err) {
            RecoveryAction::DegradeToPartial(text) => text,
            _ => format!("Error: {err}"),
        }
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
