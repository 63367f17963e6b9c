//! 输出管控：工具原始输出进入上下文前的体量控制
//!
//! 小输出原样通过；超大输出在配置了临时内容库时整体转存，只留检索提示；
//! 其余按结构裁剪（JSON 去掉大字段、截断长字符串与长列表），纯文本在词边界截断。

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::config::GovernorSection;
use crate::tools::{EphemeralStore, QueryEphemeralTool};

/// 不超过此长度的输出原样通过
pub const SOFT_THRESHOLD: usize = 1000;
/// 执行日志中单步输出的上限
pub const HARD_THRESHOLD: usize = 2000;
/// 超过此长度且有临时内容库时转存
pub const DIVERT_THRESHOLD: usize = 3000;

const LARGE_FIELDS: &[&str] = &["html", "html_body", "raw_content", "body", "content"];
const MAX_JSON_DEPTH: usize = 5;
const MAX_LIST_ITEMS: usize = 5;
const MAX_STRING_CHARS: usize = 200;
const PREVIEW_CHARS: usize = 500;

/// 管控后的输出
#[derive(Debug, Clone, PartialEq)]
pub struct GovernedOutput {
    pub content: String,
    /// 转存时的检索 id
    pub ephemeral_id: Option<String>,
}

impl GovernedOutput {
    fn inline(content: String) -> Self {
        Self {
            content,
            ephemeral_id: None,
        }
    }

    pub fn was_diverted(&self) -> bool {
        self.ephemeral_id.is_some()
    }
}

#[derive(Clone)]
pub struct OutputGovernor {
    soft: usize,
    hard: usize,
    divert: usize,
    store: Option<Arc<dyn EphemeralStore>>,
}

impl Default for OutputGovernor {
    fn default() -> Self {
        Self::from_config(&GovernorSection::default())
    }
}

impl OutputGovernor {
    pub fn from_config(cfg: &GovernorSection) -> Self {
        Self {
            soft: cfg.soft_threshold,
            hard: cfg.hard_threshold,
            divert: cfg.divert_threshold,
            store: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn EphemeralStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn hard_threshold(&self) -> usize {
        self.hard
    }

    pub async fn govern(&self, output: &str, tool: &str) -> GovernedOutput {
        let len = output.chars().count();
        if len <= self.soft {
            return GovernedOutput::inline(output.to_string());
        }

        if len > self.divert {
            if let Some(store) = &self.store {
                match store.ingest(output, tool).await {
                    Ok(id) => {
                        tracing::info!(tool, chars = len, id = %id, "output diverted to ephemeral store");
                        return GovernedOutput {
                            content: diversion_notice(len, &id),
                            ephemeral_id: Some(id),
                        };
                    }
                    Err(e) => tracing::warn!(tool, error = %e, "ephemeral ingest failed, pruning instead"),
                }
            }
        }

        tracing::debug!(tool, chars = len, "pruning tool output");
        GovernedOutput::inline(prune(output, self.soft))
    }

    /// 执行日志中的展示文本
    pub fn cap_for_log(&self, output: &str) -> String {
        cap_chars(output, self.hard)
    }
}

fn diversion_notice(len: usize, id: &str) -> String {
    let tool = QueryEphemeralTool::NAME;
    format!(
        "[System: Context Overflow Protection]\n\
         Output too large ({len} chars) to fit in context.\n\
         Content has been securely indexed to Ephemeral Store ID: {id}\n\
         You MUST use the tool '{tool}(ephemeral_id=\"{id}\", query=\"...\")' to retrieve specific details/sections."
    )
}

/// 裁剪到 max_chars 左右：JSON 按结构，其余按词边界
pub fn prune(output: &str, max_chars: usize) -> String {
    if output.chars().count() <= max_chars {
        return output.to_string();
    }
    if looks_like_json(output) {
        if let Ok(data) = serde_json::from_str::<Value>(output) {
            let pruned = prune_json(&data, 0);
            if let Ok(text) = serde_json::to_string_pretty(&pruned) {
                if text.chars().count() <= max_chars {
                    return text;
                }
            }
            let preview: String = output.trim().chars().take(PREVIEW_CHARS).collect();
            return serde_json::json!({"_truncated": true, "preview": preview}).to_string();
        }
    }
    truncate_text(output, max_chars)
}

fn looks_like_json(text: &str) -> bool {
    let t = text.trim();
    (t.starts_with('{') && t.ends_with('}')) || (t.starts_with('[') && t.ends_with(']'))
}

fn prune_json(value: &Value, depth: usize) -> Value {
    if depth > MAX_JSON_DEPTH {
        return Value::String("[NESTED]".to_string());
    }
    match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                let pruned = if LARGE_FIELDS.contains(&k.to_lowercase().as_str()) {
                    let size = match v {
                        Value::String(s) => s.chars().count(),
                        other => other.to_string().chars().count(),
                    };
                    Value::String(format!("[{size} chars - omitted]"))
                } else {
                    prune_json(v, depth + 1)
                };
                out.insert(k.clone(), pruned);
            }
            Value::Object(out)
        }
        Value::Array(items) if items.len() > MAX_LIST_ITEMS => Value::Array(vec![
            prune_json(&items[0], depth + 1),
            Value::String(format!("... [{} more items]", items.len() - 1)),
        ]),
        Value::Array(items) => Value::Array(items.iter().map(|v| prune_json(v, depth + 1)).collect()),
        Value::String(s) if s.chars().count() > MAX_STRING_CHARS => {
            Value::String(format!("{}...", s.chars().take(MAX_STRING_CHARS).collect::<String>()))
        }
        other => other.clone(),
    }
}

/// 在词边界截断，附上 TRUNCATED 标记
fn truncate_text(text: &str, max_chars: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    let head = &chars[..max_chars.min(chars.len())];
    let last_break = head.iter().rposition(|c| *c == ' ' || *c == '\n').unwrap_or(0);
    let cut = last_break.max(max_chars.saturating_sub(100));
    let kept: String = chars[..cut.min(chars.len())].iter().collect();
    let remaining = chars.len() - kept.chars().count();
    format!("{kept}\n... [TRUNCATED: {remaining} chars]")
}

fn cap_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        format!("{}... [truncated]", text.chars().take(max).collect::<String>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::InMemoryEphemeralStore;

    #[tokio::test]
    async fn test_small_output_passes_through() {
        let gov = OutputGovernor::default();
        let out = gov.govern("Playing 'X' by Y", "spotify_control").await;
        assert_eq!(out.content, "Playing 'X' by Y");
        assert!(!out.was_diverted());
    }

    #[tokio::test]
    async fn test_large_output_diverted_with_id() {
        let store = Arc::new(InMemoryEphemeralStore::new());
        let gov = OutputGovernor::default().with_store(store.clone());
        let big = "lorem ipsum dolor ".repeat(300);
        assert!(big.len() > 5000);

        let out = gov.govern(&big, "web_fetch").await;
        let id = out.ephemeral_id.clone().unwrap();
        assert!(out.content.contains(&id));
        assert!(out.content.contains("query_ephemeral"));
        assert!(out.content.contains("Context Overflow Protection"));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_large_output_without_store_is_truncated() {
        let gov = OutputGovernor::default();
        let big = "word ".repeat(1000);
        let out = gov.govern(&big, "web_fetch").await;
        assert!(out.ephemeral_id.is_none());
        assert!(out.content.contains("[TRUNCATED:"));
        assert!(out.content.chars().count() < 1100);
    }

    #[test]
    fn test_prune_json_drops_large_fields() {
        let items: Vec<Value> = (0..10).map(|i| serde_json::json!({"n": i})).collect();
        let doc = serde_json::json!({
            "title": "Page",
            "html": "<div>".repeat(500),
            "items": items,
            "summary": "s".repeat(300),
        });
        let pruned = prune(&doc.to_string(), 1000);
        let v: Value = serde_json::from_str(&pruned).unwrap();
        assert_eq!(v["title"], "Page");
        assert_eq!(v["html"], "[2500 chars - omitted]");
        assert_eq!(v["items"][1], "... [9 more items]");
        assert_eq!(v["summary"].as_str().unwrap().chars().count(), 203);
    }

    #[test]
    fn test_cap_for_log() {
        let gov = OutputGovernor::default();
        let capped = gov.cap_for_log(&"a".repeat(2500));
        assert!(capped.ends_with("... [truncated]"));
        assert_eq!(gov.cap_for_log("short"), "short");
    }
}
