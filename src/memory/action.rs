//! 动作节点：一次已完成的工具调用及其结果（创建后不可变）
//!
//! 这里也放推断「这次动作关于谁」的参数规则与关键事实抽取规则。

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::memory::entity::EntityType;

/// result_text 保留的最大字符数
pub const RESULT_TEXT_CAP: usize = 500;
/// 单条关键事实的最大字符数
pub const KEY_FACT_CAP: usize = 120;
/// 每个动作最多保留的关键事实
pub const MAX_KEY_FACTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionNode {
    pub id: String,
    pub turn: u64,
    pub timestamp: DateTime<Utc>,
    pub tool: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default)]
    pub result_text: String,
    pub success: bool,
    #[serde(default)]
    pub focus_entity: Option<String>,
    #[serde(default)]
    pub entities_involved: Vec<String>,
    #[serde(default)]
    pub key_facts: Vec<String>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub session_id: String,
}

impl ActionNode {
    /// `tool(k=v, k=v) ok|failed`
    pub fn describe(tool: &str, args: &Value, success: bool) -> String {
        let args_str = args
            .as_object()
            .map(|m| {
                m.iter()
                    .take(2)
                    .map(|(k, v)| format!("{k}={}", value_text(v)))
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .unwrap_or_default();
        let status = if success { "ok" } else { "failed" };
        format!("{tool}({args_str}) {status}")
    }
}

/// 按字符截断（不会切在多字节字符中间）
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

fn value_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// 依次取第一个非空参数
pub fn arg_str(args: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| {
        args.get(*k)
            .map(value_text)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    })
}

const PLAY_TOOLS: &[&str] = &["spotify_control", "play_music", "spotify", "play_youtube"];
const SEARCH_TOOLS: &[&str] = &["web_search", "arxiv_search", "search", "wikipedia"];
const APP_TOOLS: &[&str] = &["open_app", "launch"];

/// 参数名 -> 实体类型
const ARG_HINTS: &[(&str, EntityType)] = &[
    ("song_name", EntityType::Song),
    ("song", EntityType::Song),
    ("track", EntityType::Song),
    ("artist", EntityType::Artist),
    ("query", EntityType::Query),
    ("q", EntityType::Query),
    ("search_query", EntityType::Query),
    ("topic", EntityType::Topic),
    ("app_name", EntityType::App),
    ("app", EntityType::App),
    ("person", EntityType::Person),
    ("contact", EntityType::Person),
    ("location", EntityType::Location),
    ("city", EntityType::Location),
    ("path", EntityType::File),
    ("file", EntityType::File),
];

/// 工具专属规则：播放类 -> 歌曲，检索类 -> 查询，启动类 -> 应用
pub fn focus_hint(tool: &str, args: &Value) -> Option<(EntityType, String)> {
    if PLAY_TOOLS.contains(&tool) {
        if let Some(song) = arg_str(args, &["song_name", "song", "track"]) {
            return Some((EntityType::Song, song));
        }
    }
    if SEARCH_TOOLS.contains(&tool) {
        if let Some(q) = arg_str(args, &["query", "q", "search_query"]) {
            return Some((EntityType::Query, q));
        }
    }
    if APP_TOOLS.contains(&tool) {
        if let Some(app) = arg_str(args, &["app_name", "app"]) {
            return Some((EntityType::App, app));
        }
    }
    None
}

/// 参数中出现的所有实体（按参数表顺序）
pub fn argument_hints(args: &Value) -> Vec<(EntityType, String)> {
    ARG_HINTS
        .iter()
        .filter_map(|(key, ty)| arg_str(args, &[*key]).map(|v| (*ty, v)))
        .collect()
}

static PLAYING_RE: OnceLock<Option<Regex>> = OnceLock::new();
static OUTCOME_RE: OnceLock<Option<Regex>> = OnceLock::new();

fn playing_re() -> Option<&'static Regex> {
    PLAYING_RE
        .get_or_init(|| {
            Regex::new(r#"(?i)playing\s+['"‘“]?([^'"’”\n]+?)['"’”]?\s+by\s+([^\n.!,]+)"#).ok()
        })
        .as_ref()
}

fn outcome_re() -> Option<&'static Regex> {
    OUTCOME_RE
        .get_or_init(|| {
            Regex::new(r"(?i)\b(?:saved|created|scheduled|sent|added|set)\b[^.\n]{3,80}").ok()
        })
        .as_ref()
}

fn push_fact(facts: &mut Vec<String>, fact: String) {
    let fact = truncate_chars(fact.trim(), KEY_FACT_CAP);
    if !fact.is_empty() && !facts.contains(&fact) {
        facts.push(fact);
    }
}

/// 从参数与结果文本中抽取 1–3 条关键事实
pub fn extract_key_facts(tool: &str, args: &Value, result: &str, success: bool) -> Vec<String> {
    let mut facts: Vec<String> = Vec::new();

    if success {
        if let Some(caps) = playing_re().and_then(|re| re.captures(result)) {
            push_fact(&mut facts, format!("Played: {} by {}", caps[1].trim(), caps[2].trim()));
        } else if PLAY_TOOLS.contains(&tool) {
            if let Some(song) = arg_str(args, &["song_name", "song", "track"]) {
                push_fact(&mut facts, format!("Played: {song}"));
            }
        }
    }

    if matches!(tool, "reminder_create" | "create_reminder" | "set_reminder") {
        if let Some(text) = arg_str(args, &["text", "reminder"]) {
            push_fact(&mut facts, format!("Reminder: {text}"));
        }
    }

    if matches!(tool, "send_message" | "send_whatsapp" | "send_email") {
        if let Some(to) = arg_str(args, &["to", "recipient"]) {
            push_fact(&mut facts, format!("Sent message to: {to}"));
        }
    }

    if SEARCH_TOOLS.contains(&tool) {
        if let Some(q) = arg_str(args, &["query", "q", "search_query"]) {
            push_fact(&mut facts, format!("Searched: {q}"));
        }
    }

    if APP_TOOLS.contains(&tool) && success {
        if let Some(app) = arg_str(args, &["app_name", "app"]) {
            push_fact(&mut facts, format!("Opened: {app}"));
        }
    }

    if success {
        if let Some(m) = outcome_re().and_then(|re| re.find(result)) {
            push_fact(&mut facts, m.as_str().to_string());
        }
    }

    if facts.is_empty() {
        if success {
            push_fact(&mut facts, format!("{tool} succeeded"));
        } else {
            let first_line = result.lines().next().unwrap_or("").trim();
            push_fact(&mut facts, format!("{tool} failed: {}", truncate_chars(first_line, 60)));
        }
    }

    facts.truncate(MAX_KEY_FACTS);
    facts
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_focus_hint_by_tool() {
        let args = json!({"song_name": "Shape of You"});
        assert_eq!(
            focus_hint("spotify_control", &args),
            Some((EntityType::Song, "Shape of You".to_string()))
        );
        assert_eq!(
            focus_hint("web_search", &json!({"q": "rust async"})),
            Some((EntityType::Query, "rust async".to_string()))
        );
        assert_eq!(focus_hint("open_app", &json!({"app": "Notes"})).map(|h| h.0), Some(EntityType::App));
        assert!(focus_hint("get_weather", &json!({"city": "Paris"})).is_none());
    }

    #[test]
    fn test_argument_hints_collects_all() {
        let hints = argument_hints(&json!({"track": "Hello", "artist": "Adele", "volume": 5}));
        assert_eq!(
            hints,
            vec![
                (EntityType::Song, "Hello".to_string()),
                (EntityType::Artist, "Adele".to_string())
            ]
        );
    }

    #[test]
    fn test_key_facts_from_result_and_args() {
        let facts = extract_key_facts(
            "spotify_control",
            &json!({"song_name": "X"}),
            "Playing 'X' by Y",
            true,
        );
        assert_eq!(facts[0], "Played: X by Y");

        let facts = extract_key_facts(
            "create_reminder",
            &json!({"text": "call mom"}),
            "Reminder saved for 5pm",
            true,
        );
        assert!(facts.contains(&"Reminder: call mom".to_string()));
        assert!(facts.len() <= MAX_KEY_FACTS);
    }

    #[test]
    fn test_key_facts_never_empty() {
        let facts = extract_key_facts("get_weather", &json!({}), "Error: timeout\nretry", false);
        assert_eq!(facts, vec!["get_weather failed: Error: timeout".to_string()]);
        let facts = extract_key_facts("get_weather", &json!({}), "Sunny, 21C", true);
        assert_eq!(facts, vec!["get_weather succeeded".to_string()]);
    }

    #[test]
    fn test_truncate_chars_multibyte() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }
}
