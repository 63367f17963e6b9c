//! Verifier：判断本轮工具执行是否满足了用户请求
//!
//! 两段式：先跑不花预算的启发式（空输出、错误标记、鉴权/限流、道歉措辞），
//! 命中即 FAIL；否则花一次推理调用，解析 {"verdict", "reason"}。
//! 校验模型不可用或回复无法解析时默认通过，不阻塞主流程。

use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::VerifierSection;
use crate::core::{AgentError, CallBudget, RecoveryAction, RecoveryEngine};
use crate::llm::{LlmClient, Message};
use crate::react::planner::Plan;

/// 送入校验模型的输出上限
pub const MAX_RESULT_CHARS: usize = 1000;
const MAX_REASON_CHARS: usize = 60;
const MIN_CONTENT_CHARS: usize = 20;

pub const VERIFIER_SYSTEM_PROMPT: &str = r#"You verify if a tool execution satisfied the user's request.

OUTPUT FORMAT: {"verdict": "PASS" or "FAIL", "reason": "<=12 words"}

PASS when the tool succeeded AND the result answers the request:
- write operations confirmed ("Note created", "Email sent", "Event created")
- control operations confirmed ("Now playing", "Paused", "Volume set")
- valid empty results ("No unread emails", "No events today", "No matching results")

FAIL on explicit errors, the wrong entity/date/subject, a tool that did not run,
or a genuinely blank result when content was expected.

RULE: Empty list is not failure. Blank or error is failure.
RULE: If confidence < 80%, output FAIL.
Return JSON only, no markdown."#;

/// 期望返回正文的工具
const CONTENT_TOOLS: &[&str] = &[
    "web_search",
    "fetch_document_context",
    "file_read",
    "web_scrape",
    "read_screen",
    "define_word",
    "get_news",
];

/// 可以合法返回「没有结果」的列表类工具
const LIST_TOOLS: &[&str] = &[
    "gmail_read_email",
    "calendar_get_events",
    "tasks_list",
    "note_list",
    "list_uploaded_documents",
];

const VALID_EMPTY_PATTERNS: &[&str] = &[
    "no unread emails",
    "no emails found",
    "no new emails",
    "no events",
    "no calendar events",
    "nothing scheduled",
    "no tasks",
    "no pending tasks",
    "no notes",
    "no matching",
];

const ERROR_PATTERNS: &[&str] = &[
    "error:",
    "failed:",
    "exception:",
    "traceback",
    "unable to",
    "access denied",
    "unauthorized",
    "timeout",
    "timed out",
    "connection refused",
    "api key",
    "rate limit",
    "429",
];

const WEAK_PATTERNS: &[&str] = &[
    "i'm sorry",
    "i couldn't",
    "unfortunately",
    "i was unable",
    "i don't have access",
    "permission denied",
    "403",
    "401",
    "invalid credentials",
    "not authorized",
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verdict {
    pub passed: bool,
    pub reason: String,
    pub raw_response: Option<String>,
}

impl Verdict {
    pub fn pass(reason: impl Into<String>) -> Self {
        Self {
            passed: true,
            reason: reason.into(),
            raw_response: None,
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            reason: reason.into(),
            raw_response: None,
        }
    }

    fn with_raw(mut self, raw: impl Into<String>) -> Self {
        self.raw_response = Some(raw.into());
        self
    }
}

/// 校验模型回复的解析结果
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedVerdict {
    Verdict(Verdict),
    Unparseable(String),
}

#[derive(Deserialize)]
struct VerdictJson {
    #[serde(default)]
    verdict: String,
    #[serde(default)]
    reason: Option<String>,
}

fn step_prefix_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^Step \d+ \([^)]*\): ?").ok()).as_ref()
}

fn reason_res() -> &'static [Regex] {
    static RE: OnceLock<Vec<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        [r#""reason"\s*:\s*"([^"]+)""#, r"(?i)reason:\s*([^.\n]+)"]
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect()
    })
}

/// 去掉执行日志的标题与 "Step N (tool): " 前缀，只留工具正文
fn payload(output: &str) -> String {
    let body = output.replace("=== TOOL EXECUTION LOG ===", "");
    match step_prefix_re() {
        Some(re) => re.replace_all(&body, "").into_owned(),
        None => body,
    }
}

/// 纯数字的状态码只按词边界匹配，避免命中 id 或数值中的片段
fn contains_pattern(haystack: &str, pattern: &str) -> bool {
    if !pattern.bytes().all(|b| b.is_ascii_digit()) {
        return haystack.contains(pattern);
    }
    haystack.match_indices(pattern).any(|(i, _)| {
        let before = haystack[..i].chars().next_back();
        let after = haystack[i + pattern.len()..].chars().next();
        !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
    })
}

/// 不花预算的启发式判定；无法判断时返回 None
pub fn heuristic_verdict(output: &str, plan: &Plan) -> Option<Verdict> {
    if plan.is_empty() {
        return None;
    }
    let body = payload(output);
    let lower = body.to_lowercase();
    let expects_content = plan.tools().any(|t| CONTENT_TOOLS.contains(&t));
    let is_list_operation = plan.tools().any(|t| LIST_TOOLS.contains(&t));

    if body.trim().is_empty() {
        return Some(Verdict::fail("Empty tool output"));
    }
    if expects_content && !is_list_operation && body.trim().chars().count() < MIN_CONTENT_CHARS {
        return Some(Verdict::fail("Empty result when content expected"));
    }
    if is_list_operation && VALID_EMPTY_PATTERNS.iter().any(|p| lower.contains(p)) {
        return None;
    }
    if let Some(p) = ERROR_PATTERNS.iter().find(|p| contains_pattern(&lower, p)) {
        return Some(Verdict::fail(format!("Tool error: {p}")));
    }
    if let Some(p) = WEAK_PATTERNS.iter().find(|p| contains_pattern(&lower, p)) {
        return Some(Verdict::fail(format!("Weak response: {p}")));
    }
    None
}

fn cap_reason(s: &str) -> String {
    s.chars().take(MAX_REASON_CHARS).collect()
}

fn extract_reason(text: &str) -> Option<String> {
    reason_res()
        .iter()
        .find_map(|re| re.captures(text).and_then(|c| c.get(1)))
        .map(|m| cap_reason(m.as_str().trim()))
}

fn strip_fence(text: &str) -> &str {
    let t = text.trim();
    if let Some(start) = t.find("```") {
        let rest = &t[start + 3..];
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        return rest.find("```").map_or(rest, |end| &rest[..end]).trim();
    }
    t
}

/// 解析校验模型的回复
pub fn parse_verdict(raw: &str) -> ParsedVerdict {
    let clean = strip_fence(raw);
    if let Ok(v) = serde_json::from_str::<VerdictJson>(clean) {
        let passed = v.verdict.trim().eq_ignore_ascii_case("PASS");
        let reason = cap_reason(v.reason.as_deref().unwrap_or("No reason provided"));
        let verdict = if passed { Verdict::pass(reason) } else { Verdict::fail(reason) };
        return ParsedVerdict::Verdict(verdict.with_raw(raw));
    }
    if raw.to_uppercase().contains("FAIL") {
        let reason = extract_reason(raw).unwrap_or_else(|| "Unknown reason".to_string());
        return ParsedVerdict::Verdict(Verdict::fail(reason).with_raw(raw));
    }
    ParsedVerdict::Unparseable(raw.to_string())
}

pub struct Verifier {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
    max_result_chars: usize,
    recovery: RecoveryEngine,
}

impl Verifier {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self::from_config(llm, &VerifierSection::default())
    }

    pub fn from_config(llm: Arc<dyn LlmClient>, config: &VerifierSection) -> Self {
        Self {
            llm,
            system_prompt: config
                .system_prompt
                .clone()
                .unwrap_or_else(|| VERIFIER_SYSTEM_PROMPT.to_string()),
            max_result_chars: config.max_result_chars,
            recovery: RecoveryEngine::new(),
        }
    }

    /// 评估本轮执行结果；仅在预算耗尽时返回错误
    pub async fn evaluate(
        &self,
        user_request: &str,
        plan: &Plan,
        tool_output: &str,
        budget: &mut CallBudget,
    ) -> Result<Verdict, AgentError> {
        if let Some(verdict) = heuristic_verdict(tool_output, plan) {
            tracing::info!(reason = %verdict.reason, "heuristic verdict: FAIL");
            return Ok(verdict);
        }

        budget.record_call("verifying")?;

        let capped: String = tool_output.chars().take(self.max_result_chars).collect();
        let messages = vec![
            Message::system(self.system_prompt.clone()),
            Message::user(format!(
                "User: {user_request}\nPlan: {}\nResult:\n{capped}",
                plan.summary()
            )),
        ];

        let raw = match self.llm.complete(&messages).await {
            Ok(raw) => raw,
            Err(e) => {
                let err = AgentError::EvaluatorUnavailable(e.clone());
                tracing::warn!(error = %err, "verifier call failed");
                return Ok(match self.recovery.handle(&err) {
                    RecoveryAction::DefaultPass => Verdict::pass("Verifier unavailable").with_raw(e),
                    _ => Verdict::fail("Verifier unavailable").with_raw(e),
                });
            }
        };

        let verdict = match parse_verdict(&raw) {
            ParsedVerdict::Verdict(v) => v,
            ParsedVerdict::Unparseable(raw) => {
                tracing::debug!(raw = %raw, "unparseable verdict, assuming pass");
                Verdict::pass("Assumed pass").with_raw(raw)
            }
        };
        tracing::info!(
            model = self.llm.model_name(),
            passed = verdict.passed,
            reason = %verdict.reason,
            "verifier verdict"
        );
        Ok(verdict)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::llm::MockLlmClient;
    use crate::react::planner::PlanStep;

    fn plan(tool: &str) -> Plan {
        Plan::new(vec![PlanStep::new(1, tool, json!({}))])
    }

    #[tokio::test]
    async fn test_error_output_fails_without_spending() {
        let llm = Arc::new(MockLlmClient::new());
        let verifier = Verifier::new(llm.clone());
        let mut budget = CallBudget::new(8);
        let v = verifier
            .evaluate("weather?", &plan("get_weather"), "Error: API timeout", &mut budget)
            .await
            .unwrap();
        assert!(!v.passed);
        assert_eq!(budget.call_count(), 0);
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn test_plausible_output_spends_one_call() {
        let llm = Arc::new(MockLlmClient::with_responses([r#"{"verdict": "PASS", "reason": "now playing"}"#]));
        let verifier = Verifier::new(llm.clone());
        let mut budget = CallBudget::new(8);
        let v = verifier
            .evaluate("play X", &plan("spotify_control"), "Playing 'X' by Y", &mut budget)
            .await
            .unwrap();
        assert!(v.passed);
        assert_eq!(v.reason, "now playing");
        assert_eq!(budget.call_count(), 1);
        assert_eq!(llm.call_count(), 1);
    }

    #[tokio::test]
    async fn test_llm_error_defaults_to_pass() {
        let llm = Arc::new(MockLlmClient::new());
        llm.push_error("503 upstream");
        let verifier = Verifier::new(llm);
        let mut budget = CallBudget::new(8);
        let v = verifier
            .evaluate("play X", &plan("spotify_control"), "Playing 'X' by Y", &mut budget)
            .await
            .unwrap();
        assert!(v.passed);
        assert_eq!(v.raw_response.as_deref(), Some("503 upstream"));
    }

    #[tokio::test]
    async fn test_exhausted_budget_propagates() {
        let verifier = Verifier::new(Arc::new(MockLlmClient::new()));
        let mut budget = CallBudget::new(0);
        let err = verifier
            .evaluate("play X", &plan("spotify_control"), "Playing 'X' by Y", &mut budget)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::BudgetExceeded { .. }));
    }

    #[test]
    fn test_heuristics() {
        assert!(heuristic_verdict("", &plan("echo")).is_some());
        assert!(heuristic_verdict("short", &plan("web_search")).is_some());
        assert!(heuristic_verdict("HTTP 403 from provider", &plan("echo")).is_some());
        assert!(heuristic_verdict("Unfortunately the page moved", &plan("echo")).is_some());
        assert!(heuristic_verdict("No unread emails", &plan("gmail_read_email")).is_none());
        assert!(heuristic_verdict("Playing 'X' by Y", &plan("spotify_control")).is_none());
        assert!(heuristic_verdict("anything", &Plan::default()).is_none());
        assert!(heuristic_verdict("Stored as eph_a4293f", &plan("echo")).is_none());
        // 执行日志的框架文本不算正文
        let log = "\n\n=== TOOL EXECUTION LOG ===\nStep 1 (web_search): ";
        assert!(heuristic_verdict(log, &plan("web_search")).is_some());
    }

    #[test]
    fn test_parse_verdict_variants() {
        match parse_verdict("```json\n{\"verdict\": \"FAIL\", \"reason\": \"wrong song\"}\n```") {
            ParsedVerdict::Verdict(v) => {
                assert!(!v.passed);
                assert_eq!(v.reason, "wrong song");
            }
            other => panic!("unexpected {other:?}"),
        }
        match parse_verdict("FAIL. Reason: the date is wrong") {
            ParsedVerdict::Verdict(v) => {
                assert!(!v.passed);
                assert_eq!(v.reason, "the date is wrong");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(parse_verdict("looks fine to me"), ParsedVerdict::Unparseable(_)));
        let long = format!("{{\"verdict\": \"PASS\", \"reason\": \"{}\"}}", "r".repeat(100));
        match parse_verdict(&long) {
            ParsedVerdict::Verdict(v) => assert_eq!(v.reason.chars().count(), 60),
            other => panic!("unexpected {other:?}"),
        }
    }
}
