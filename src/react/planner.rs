//! Planner：计划结构与解析，以及规划器接口
//!
//! 计划由外部规划器（通常是 LLM）生成，形如 {"plan": [{"id": 1, "tool": "...", "args": {...}}]}；
//! parse_plan 容忍 ```json 包裹、裸数组与前后闲聊文本。

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::AgentError;
use crate::llm::{LlmClient, Message};

const DEFAULT_PLANNER_PROMPT: &str = "You plan tool calls for a personal assistant.\n\
Return JSON only: {\"plan\": [{\"id\": 1, \"tool\": \"tool_name\", \"args\": {...}}]}.\n\
Use an empty plan when no tool is needed. Never invent tools that are not listed.";

fn empty_args() -> Value {
    Value::Object(Default::default())
}

/// 计划中的一步
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    #[serde(default)]
    pub id: u32,
    pub tool: String,
    #[serde(default = "empty_args")]
    pub args: Value,
}

impl PlanStep {
    pub fn new(id: u32, tool: impl Into<String>, args: Value) -> Self {
        Self {
            id,
            tool: tool.into(),
            args,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(rename = "plan", alias = "steps", default)]
    pub steps: Vec<PlanStep>,
}

impl Plan {
    pub fn new(steps: Vec<PlanStep>) -> Self {
        Self { steps }
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn tools(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(|s| s.tool.as_str())
    }

    /// 简短摘要（最多三个工具名），供校验器提示词使用
    pub fn summary(&self) -> String {
        if self.steps.is_empty() {
            return "(no tools)".to_string();
        }
        self.tools().take(3).collect::<Vec<_>>().join(", ")
    }
}

/// 从 LLM 文本中提取候选 JSON 片段，按可能性排序
///
/// 数组包住对象时先试数组，否则先试对象：前置的闲聊里可能混有方括号。
fn json_candidates(text: &str) -> Vec<&str> {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```") {
        let rest = &trimmed[start + 3..];
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        if let Some(end) = rest.find("```") {
            return vec![rest[..end].trim()];
        }
    }
    let span = |open: char, close: char| match (trimmed.find(open), trimmed.rfind(close)) {
        (Some(s), Some(e)) if s < e => Some((s, e)),
        _ => None,
    };
    let obj = span('{', '}');
    let arr = span('[', ']');
    let array_outer = match (obj, arr) {
        (Some((os, oe)), Some((as_, ae))) => as_ < os && ae > oe,
        _ => false,
    };
    let ordered = if array_outer { [arr, obj] } else { [obj, arr] };
    ordered
        .into_iter()
        .flatten()
        .map(|(s, e)| &trimmed[s..=e])
        .collect()
}

/// 解析计划；无 JSON 或结构不符时返回 JsonParseError
pub fn parse_plan(output: &str) -> Result<Plan, AgentError> {
    let candidates = json_candidates(output);
    if candidates.is_empty() {
        return Err(AgentError::JsonParseError(preview(output)));
    }
    let mut last_err = None;
    for json in candidates {
        match serde_json::from_str::<Value>(json) {
            Ok(value) => return plan_from_value(value),
            Err(e) => last_err = Some(format!("{e}: {}", preview(json))),
        }
    }
    Err(AgentError::JsonParseError(last_err.unwrap_or_else(|| preview(output))))
}

fn plan_from_value(value: Value) -> Result<Plan, AgentError> {
    let mut plan = match value {
        Value::Array(_) => Plan::new(
            serde_json::from_value(value).map_err(|e| AgentError::JsonParseError(e.to_string()))?,
        ),
        other => serde_json::from_value(other).map_err(|e| AgentError::JsonParseError(e.to_string()))?,
    };
    // 缺失的 id 按顺序补齐
    for (i, step) in plan.steps.iter_mut().enumerate() {
        if step.id == 0 {
            step.id = i as u32 + 1;
        }
    }
    Ok(plan)
}

fn preview(s: &str) -> String {
    s.chars().take(120).collect()
}

/// 规划请求：用户原话、记忆上下文与上一次失败的 hindsight
#[derive(Debug, Clone, Default)]
pub struct PlanRequest {
    pub user_input: String,
    pub context: String,
    pub hindsight: Option<String>,
}

/// 规划器接口（外部组件）
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, request: &PlanRequest) -> Result<Plan, AgentError>;
}

/// 基于 LLM 的规划器：拼 system（提示词 + 工具清单）后调用 LLM 并解析计划
pub struct LlmPlanner {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
}

impl LlmPlanner {
    pub fn new(llm: Arc<dyn LlmClient>, tool_schema_json: &str) -> Self {
        Self {
            llm,
            system_prompt: format!("{DEFAULT_PLANNER_PROMPT}\n\nAvailable tools:\n{tool_schema_json}"),
        }
    }

    pub fn base_system_prompt(&self) -> &str {
        &self.system_prompt
    }

    fn build_messages(&self, request: &PlanRequest) -> Vec<Message> {
        let mut system = self.system_prompt.clone();
        if !request.context.is_empty() {
            system.push_str("\n\n");
            system.push_str(&request.context);
        }
        if let Some(h) = &request.hindsight {
            system.push_str(&format!(
                "\n\nPREVIOUS ATTEMPT FAILED: {h}\nChoose a different approach or different arguments."
            ));
        }
        vec![Message::system(system), Message::user(request.user_input.clone())]
    }
}

#[async_trait]
impl Planner for LlmPlanner {
    async fn plan(&self, request: &PlanRequest) -> Result<Plan, AgentError> {
        let raw = self
            .llm
            .complete(&self.build_messages(request))
            .await
            .map_err(AgentError::LlmError)?;
        parse_plan(&raw)
    }
}
