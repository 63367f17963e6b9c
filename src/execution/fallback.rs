//! 工具回退表：主工具失败时换一个工具再试一次
//!
//! 回退工具的参数由「搜索词」重建：先看常见参数名，再退回用户原话。

use std::collections::HashMap;

use serde_json::{json, Value};

/// 视为「跑了但没成功」的输出片段
pub const FAILURE_INDICATORS: &[&str] = &["not found", "failed", "error", "couldn't", "unable"];

const SEARCH_KEYS: &[&str] = &["query", "topic", "song", "song_name", "track", "search_term", "q"];
const IGNORED_KEYS: &[&str] = &["action", "uri"];

pub fn default_fallbacks() -> HashMap<String, String> {
    HashMap::from([
        ("spotify_control".to_string(), "play_youtube".to_string()),
        ("play_youtube".to_string(), "web_search".to_string()),
    ])
}

/// 输出文本是否表明软失败
pub fn is_soft_failure(output: &str) -> bool {
    let lower = output.to_lowercase();
    FAILURE_INDICATORS.iter().any(|ind| lower.contains(ind))
}

#[derive(Debug, Clone)]
pub struct FallbackTable {
    map: HashMap<String, String>,
}

impl Default for FallbackTable {
    fn default() -> Self {
        Self::new(default_fallbacks())
    }
}

impl FallbackTable {
    pub fn new(map: HashMap<String, String>) -> Self {
        Self { map }
    }

    /// 不做任何回退
    pub fn empty() -> Self {
        Self::new(HashMap::new())
    }

    pub fn get(&self, tool: &str) -> Option<&str> {
        self.map.get(tool).map(String::as_str)
    }

    /// 从参数或用户原话中取搜索词；都取不到时返回 None
    pub fn search_term(&self, args: &Value, user_input: &str) -> Option<String> {
        let non_empty = |v: &Value| match v {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        };
        if let Some(term) = SEARCH_KEYS.iter().find_map(|k| args.get(*k).and_then(non_empty)) {
            return Some(term);
        }
        if !user_input.trim().is_empty() {
            return Some(user_input.trim().to_string());
        }
        args.as_object().and_then(|m| {
            m.iter()
                .filter(|(k, _)| !IGNORED_KEYS.contains(&k.as_str()))
                .find_map(|(_, v)| non_empty(v))
        })
    }

    /// 为回退工具构造参数
    pub fn build_args(&self, fallback_tool: &str, term: &str) -> Value {
        match fallback_tool {
            "play_youtube" => json!({"topic": term}),
            _ => json!({"query": term}),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_soft_failure_detection() {
        assert!(is_soft_failure("Track not found"));
        assert!(is_soft_failure("I couldn't reach Spotify"));
        assert!(!is_soft_failure("Playing 'X' by Y"));
    }

    #[test]
    fn test_search_term_precedence() {
        let table = FallbackTable::default();
        assert_eq!(
            table.search_term(&json!({"song_name": "Hello", "action": "play"}), "play hello"),
            Some("Hello".to_string())
        );
        assert_eq!(
            table.search_term(&json!({"action": "play"}), "play something calm"),
            Some("play something calm".to_string())
        );
        assert_eq!(
            table.search_term(&json!({"action": "play", "name": "Hi"}), ""),
            Some("Hi".to_string())
        );
        assert_eq!(table.search_term(&json!({"action": "play"}), ""), None);
    }

    #[test]
    fn test_build_args_per_tool() {
        let table = FallbackTable::default();
        assert_eq!(table.get("spotify_control"), Some("play_youtube"));
        assert_eq!(table.build_args("play_youtube", "x"), json!({"topic": "x"}));
        assert_eq!(table.build_args("web_search", "x"), json!({"query": "x"}));
    }
}
