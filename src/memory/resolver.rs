//! 指代消解、用户指代识别与计划校验
//!
//! 优先级（先命中先返回）：
//! 1. 自指（me / myself / i / my）或强用户指代 -> 用户实体，禁止对外检索
//! 2. again / repeat -> 上一个动作，标记 Repeat
//! 3. instead -> 上一个动作，标记 ModifyTool
//! 4. this / that / it -> 上一个动作的焦点实体 > 第一个相关实体 > 动作本身
//! 5. PROMOTED 实体按名称查找
//! 6. 兜底：请用户澄清

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::memory::action::{arg_str, truncate_chars, ActionNode};
use crate::memory::entity::{EntityLifecycle, EntityNode};
use crate::memory::graph::MemoryGraph;
use crate::react::planner::PlanStep;

/// 无法消解时的澄清回复
pub const CLARIFY_RESPONSE: &str = "I'm not sure what you're referring to. Could you clarify?";

const SELF_WORDS: &[&str] = &["me", "myself", "i", "my"];
const DEMONSTRATIVES: &[&str] = &["this", "that", "it"];

const USER_PHRASES: &[&str] = &[
    "who am i",
    "about me",
    "about myself",
    "tell me about me",
    "my name",
    "my age",
    "my birthday",
    "my location",
    "what do you know about me",
    "describe me",
    "what have you stored about me",
    "what do you remember about me",
    "what's stored about me",
    "what info do you have on me",
    "what have you learned about me",
    "my profile",
    "my interests",
];

const NAME_CONTEXT: &[&str] = &["about", "tell me", "who is", "what about"];

/// 「不是公众人物」类否认所对应的回复用词
const PUBLIC_FIGURE_WORDS: &[&str] = &["celebrity", "famous", "actor", "public figure"];
/// 出现在命中短语前两个词内时视为否定表述
const NEGATORS: &[&str] = &["not", "never", "isn't", "aren't", "no"];

static LOCATION_RE: OnceLock<Option<Regex>> = OnceLock::new();
static FAVORITE_RE: OnceLock<Option<Regex>> = OnceLock::new();

fn location_re() -> Option<&'static Regex> {
    LOCATION_RE
        .get_or_init(|| Regex::new(r"(?i)\byou(?: live in|'re from| are from) ([a-z][\w-]*)").ok())
        .as_ref()
}

fn favorite_re() -> Option<&'static Regex> {
    FAVORITE_RE
        .get_or_init(|| Regex::new(r"(?i)\byour favou?rite (\w+) is ([\w-]+)").ok())
        .as_ref()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionTag {
    /// 原样重做上一个动作
    Repeat,
    /// 同样的参数，换一个工具
    ModifyTool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    Entity(EntityNode),
    Action(ActionNode),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub resolved: Option<Resolved>,
    pub confidence: f64,
    pub action_tag: Option<ActionTag>,
    pub ban_external_search: bool,
    pub fallback_response: Option<String>,
}

impl Resolution {
    fn entity(node: &EntityNode, confidence: f64) -> Self {
        Self {
            resolved: Some(Resolved::Entity(node.clone())),
            confidence,
            action_tag: None,
            ban_external_search: false,
            fallback_response: None,
        }
    }

    fn action(action: &ActionNode, confidence: f64, tag: Option<ActionTag>) -> Self {
        Self {
            resolved: Some(Resolved::Action(action.clone())),
            confidence,
            action_tag: tag,
            ban_external_search: false,
            fallback_response: None,
        }
    }

    fn unresolved() -> Self {
        Self {
            resolved: None,
            confidence: 0.0,
            action_tag: None,
            ban_external_search: false,
            fallback_response: Some(CLARIFY_RESPONSE.to_string()),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.is_some()
    }

    /// Repeat 时需要重新发起的 (工具, 参数)
    pub fn reinvocation(&self) -> Option<(String, Value)> {
        match (&self.resolved, self.action_tag) {
            (Some(Resolved::Action(a)), Some(ActionTag::Repeat)) => {
                Some((a.tool.clone(), a.args.clone()))
            }
            _ => None,
        }
    }
}

/// 计划被否决的原因
#[derive(Debug, Clone, PartialEq)]
pub struct PlanRejection {
    pub step_id: u32,
    pub reason: String,
}

impl fmt::Display for PlanRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "step {}: {}", self.step_id, self.reason)
    }
}

fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '\'')
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

/// 词边界包含：`needle` 的词序列连续出现在 `haystack` 中
fn contains_words(haystack: &[String], needle: &[String]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle)
}

/// 同 contains_words，但跳过前两个词内带否定词的命中
fn asserts_words(haystack: &[String], needle: &[String]) -> bool {
    if needle.is_empty() || haystack.len() < needle.len() {
        return false;
    }
    (0..=haystack.len() - needle.len()).any(|i| {
        haystack[i..i + needle.len()] == *needle
            && !haystack[i.saturating_sub(2)..i]
                .iter()
                .any(|w| NEGATORS.contains(&w.as_str()))
    })
}

impl MemoryGraph {
    /// 判断文本是否在说用户本人，返回 (是否, 置信度)
    pub fn is_user_reference(&self, text: &str) -> (bool, f64) {
        let tokens = words(text);
        if USER_PHRASES.iter().any(|p| contains_words(&tokens, &words(p))) {
            return (true, 1.0);
        }

        let name_words = words(&self.user().name);
        if contains_words(&tokens, &name_words) {
            if NAME_CONTEXT.iter().any(|c| contains_words(&tokens, &words(c))) {
                return (true, 0.75);
            }
            return (false, 0.3);
        }
        (false, 0.0)
    }

    pub fn resolve_reference(&self, text: &str) -> Resolution {
        let lower = text.trim().to_lowercase();
        let tokens = words(&lower);

        if SELF_WORDS.contains(&lower.as_str()) {
            let mut r = Resolution::entity(self.user(), 1.0);
            r.ban_external_search = true;
            return r;
        }
        let (is_user, user_conf) = self.is_user_reference(text);
        if is_user && user_conf > 0.7 {
            let mut r = Resolution::entity(self.user(), user_conf);
            r.ban_external_search = true;
            return r;
        }

        let last = self.last_action();

        if tokens.iter().any(|w| w == "again") || lower.contains("repeat") {
            if let Some(action) = last {
                return Resolution::action(action, 0.95, Some(ActionTag::Repeat));
            }
        }

        if tokens.iter().any(|w| w == "instead") {
            if let Some(action) = last.filter(|a| a.args.as_object().is_some_and(|m| !m.is_empty())) {
                return Resolution::action(action, 0.85, Some(ActionTag::ModifyTool));
            }
        }

        if tokens.iter().any(|w| DEMONSTRATIVES.contains(&w.as_str())) {
            if let Some(action) = last {
                if let Some(node) = action.focus_entity.as_deref().and_then(|id| self.get_entity(id)) {
                    return Resolution::entity(node, 0.9);
                }
                if let Some(node) = action
                    .entities_involved
                    .first()
                    .and_then(|id| self.get_entity(id))
                {
                    return Resolution::entity(node, 0.75);
                }
                return Resolution::action(action, 0.5, None);
            }
        }

        if let Some(node) = self.lookup_promoted_by_name(&lower) {
            return Resolution::entity(node, 0.7);
        }

        Resolution::unresolved()
    }

    /// 仅在 PROMOTED 实体中按名称（忽略大小写）查找
    fn lookup_promoted_by_name(&self, name: &str) -> Option<&EntityNode> {
        self.entities()
            .filter(|e| e.lifecycle == EntityLifecycle::Promoted)
            .find(|e| e.name.to_lowercase() == name)
    }

    /// 执行前校验计划：对外检索不得指向用户本人，参数不得触碰用户的否认事实
    pub fn validate_plan(&self, steps: &[PlanStep]) -> Result<(), PlanRejection> {
        let not_claims: Vec<String> = self.user().not_claims.iter().map(|c| c.to_lowercase()).collect();

        for step in steps {
            if self.policy().external_lookup_tools.iter().any(|t| t == &step.tool) {
                if let Some(query) = arg_str(&step.args, &["query", "q", "search_query", "topic"]) {
                    let (is_user, conf) = self.is_user_reference(&query);
                    if is_user && conf > 0.5 {
                        return Err(PlanRejection {
                            step_id: step.id,
                            reason: format!(
                                "Query '{query}' appears to be about the user. Use stored identity instead of external search."
                            ),
                        });
                    }
                }
            }

            let args_text = step.args.to_string().to_lowercase();
            if let Some(claim) = not_claims.iter().find(|c| args_text.contains(c.as_str())) {
                return Err(PlanRejection {
                    step_id: step.id,
                    reason: format!("Plan violates negative constraint: {claim}"),
                });
            }
        }
        Ok(())
    }

    /// 用图中的事实检查候选回复：否认事实、所在地、「最喜欢的 X」
    ///
    /// 返回 Err(需要纠正的原因)；图中没有的信息不做判断。
    pub fn self_check(&self, response: &str) -> Result<(), String> {
        let user = self.user();
        let tokens = words(response);

        for constraint in &user.not_claims {
            let lower = constraint.to_lowercase();
            let claim = lower.strip_prefix("not ").unwrap_or(&lower);
            let claim_words = words(claim);
            if contains_words(&claim_words, &words("public figure")) {
                if let Some(hit) = PUBLIC_FIGURE_WORDS
                    .iter()
                    .find(|w| asserts_words(&tokens, &words(w)))
                {
                    return Err(format!(
                        "Response implies the user is a public figure ('{hit}'), but graph says: NOT {claim}"
                    ));
                }
            } else if asserts_words(&tokens, &claim_words) {
                return Err(format!("Response asserts '{claim}', which the user has denied"));
            }
        }

        let location = user
            .attributes
            .get("location")
            .and_then(Value::as_str)
            .map(str::to_lowercase);
        if let (Some(location), Some(caps)) = (location, location_re().and_then(|re| re.captures(response))) {
            let claimed = caps[1].to_lowercase();
            if !words(&location).contains(&claimed) {
                return Err(format!(
                    "Response claims the user is from '{claimed}', but graph says: {location}"
                ));
            }
        }

        if let Some(caps) = favorite_re().and_then(|re| re.captures(response)) {
            let category = caps[1].to_lowercase();
            let claimed = caps[2].to_lowercase();
            let actual = user
                .attributes
                .get(&format!("favorite_{category}"))
                .and_then(Value::as_str);
            if let Some(actual) = actual {
                if !words(actual).contains(&claimed) {
                    return Err(format!(
                        "Response claims favorite {category} is '{claimed}', but graph says: {actual}"
                    ));
                }
            }
        }
        Ok(())
    }

    /// 给规划器的精简上下文：消解结果、最近动作、用户身份，不超过 budget_chars
    pub fn context_for_planner(&self, query: &str, budget_chars: usize) -> String {
        let mut parts = Vec::new();

        let resolution = self.resolve_reference(query);
        if resolution.confidence > 0.5 {
            match &resolution.resolved {
                Some(Resolved::Entity(e)) => parts.push(format!("[RESOLVED] Entity: {} ({})", e.name, e.summary)),
                Some(Resolved::Action(a)) => {
                    parts.push(format!("[RESOLVED] Last action: {} - {}", a.tool, a.summary))
                }
                None => {}
            }
        }

        let recent: Vec<String> = self
            .recent_actions(3)
            .iter()
            .map(|a| format!("T{}: {}", a.turn, a.summary))
            .collect();
        if !recent.is_empty() {
            parts.push(format!("[RECENT] {}", recent.join("; ")));
        }

        let user = self.user();
        if user.not_claims.is_empty() {
            parts.push(format!("[USER] {}", user.summary));
        } else {
            let nots: Vec<&str> = user.not_claims.iter().map(String::as_str).collect();
            parts.push(format!("[USER] {} Not: {}", user.summary, nots.join(", ")));
        }

        let context = parts.join("\n");
        if context.chars().count() > budget_chars {
            format!("{}...", truncate_chars(&context, budget_chars.saturating_sub(3)))
        } else {
            context
        }
    }

    /// 「我最近在忙什么」之类问题的摘要
    pub fn summarize_recent_activity(&self, count: usize) -> String {
        if self.actions().is_empty() {
            return "I don't have any recent activity recorded yet.".to_string();
        }
        let mut topics: Vec<String> = Vec::new();
        for action in self.recent_actions(count) {
            let topic = action
                .focus_entity
                .as_deref()
                .and_then(|id| self.get_entity(id))
                .map(|e| e.name.clone())
                .unwrap_or_else(|| action.tool.clone());
            if !topics.contains(&topic) {
                topics.push(topic);
            }
        }
        let listed = match topics.len() {
            0 => return "I don't have any recent activity recorded yet.".to_string(),
            1 => topics[0].clone(),
            n => format!("{} and {}", topics[..n - 1].join(", "), topics[n - 1]),
        };
        format!("You recently asked about {listed}.")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::entity::{Attributes, EntitySource, EntityType, USER_ID};
    use crate::memory::graph::MemoryPolicy;
    use serde_json::json;

    fn graph() -> MemoryGraph {
        MemoryGraph::new("Ada", MemoryPolicy::default())
    }

    fn step(tool: &str, args: Value) -> PlanStep {
        PlanStep {
            id: 1,
            tool: tool.to_string(),
            args,
        }
    }

    #[test]
    fn test_play_it_again_repeats_last_action() {
        let mut g = graph();
        g.record_action("spotify_control", json!({"song_name": "Shape of You"}), "Playing", true);

        let r = g.resolve_reference("play it again");
        assert_eq!(r.action_tag, Some(ActionTag::Repeat));
        assert!(r.confidence >= 0.9);
        assert_eq!(
            r.reinvocation(),
            Some(("spotify_control".to_string(), json!({"song_name": "Shape of You"})))
        );
    }

    #[test]
    fn test_self_reference_bans_external_search() {
        let g = graph();
        for text in ["me", "Myself", "who am I"] {
            let r = g.resolve_reference(text);
            assert!(r.ban_external_search, "{text}");
            assert!(matches!(&r.resolved, Some(Resolved::Entity(e)) if e.id == USER_ID));
        }
        assert_eq!(g.resolve_reference("me").confidence, 1.0);
    }

    #[test]
    fn test_demonstrative_prefers_focus_entity() {
        let mut g = graph();
        g.record_action("spotify_control", json!({"song_name": "Hello"}), "ok", true);
        let r = g.resolve_reference("who sings this?");
        assert!(matches!(&r.resolved, Some(Resolved::Entity(e)) if e.id == "song:hello"));
        assert!(r.confidence >= 0.9);

        g.record_action("get_time", json!({}), "12:00", true);
        let r = g.resolve_reference("what was that");
        assert!(matches!(&r.resolved, Some(Resolved::Action(a)) if a.tool == "get_time"));
        assert!(r.confidence <= 0.5);
    }

    #[test]
    fn test_instead_tags_modify_tool() {
        let mut g = graph();
        g.record_action("spotify_control", json!({"song_name": "Hello"}), "failed", false);
        let r = g.resolve_reference("use youtube instead");
        assert_eq!(r.action_tag, Some(ActionTag::ModifyTool));
        assert!(r.reinvocation().is_none());
    }

    #[test]
    fn test_name_lookup_and_fallback() {
        let mut g = graph();
        g.get_or_create_entity(EntityType::Person, "Grace Hopper", EntitySource::UserStated, None);
        let r = g.resolve_reference("grace hopper");
        assert_eq!(r.confidence, 0.7);

        let r = g.resolve_reference("the blue one");
        assert!(!r.is_resolved());
        assert_eq!(r.fallback_response.as_deref(), Some(CLARIFY_RESPONSE));
    }

    #[test]
    fn test_is_user_reference_name_context() {
        let g = graph();
        assert_eq!(g.is_user_reference("what do you know about me"), (true, 1.0));
        assert_eq!(g.is_user_reference("tell me about Ada"), (true, 0.75));
        assert_eq!(g.is_user_reference("Ada Lovelace"), (false, 0.3));
        assert_eq!(g.is_user_reference("weather in Paris"), (false, 0.0));
        assert_eq!(g.is_user_reference("canada news"), (false, 0.0));
    }

    #[test]
    fn test_user_phrases_match_whole_words() {
        let g = graph();
        assert_eq!(g.is_user_reference("facts about metals"), (false, 0.0));
        assert_eq!(g.is_user_reference("enemy names in zelda"), (false, 0.0));
        assert_eq!(g.is_user_reference("What's my name?"), (true, 1.0));
        assert!(g
            .validate_plan(&[step("web_search", json!({"query": "facts about metals"}))])
            .is_ok());

        let r = g.resolve_reference("tell me about medieval castles");
        assert!(!r.ban_external_search);
        assert!(!r.is_resolved());
    }

    #[test]
    fn test_validate_plan_blocks_user_lookup_and_not_claims() {
        let mut g = graph();
        assert!(g.validate_plan(&[step("web_search", json!({"query": "who is Ada"}))]).is_err());
        assert!(g.validate_plan(&[step("web_search", json!({"query": "rust news"}))]).is_ok());
        assert!(g.validate_plan(&[step("get_weather", json!({"query": "about me"}))]).is_ok());

        g.add_not_claim("Ada Lovelace", EntitySource::UserStated);
        let err = g
            .validate_plan(&[step("send_message", json!({"text": "Hi ada lovelace"}))])
            .unwrap_err();
        assert!(err.reason.contains("negative constraint"));
    }

    #[test]
    fn test_self_check_denied_facts() {
        let mut g = graph();
        g.add_not_claim("NOT a public figure", EntitySource::System);
        g.add_not_claim("the actress", EntitySource::UserStated);

        let err = g.self_check("As a famous scientist, you changed computing.").unwrap_err();
        assert!(err.contains("public figure"));
        let err = g.self_check("You are the actress from that film!").unwrap_err();
        assert!(err.contains("the actress"));

        assert!(g.self_check("You're not the actress, you write code.").is_ok());
        assert!(g.self_check("Here is your reminder for 5pm.").is_ok());
    }

    #[test]
    fn test_self_check_location_and_favorites() {
        let mut g = graph();
        assert!(g.self_check("You live in Paris and your favorite band is Muse.").is_ok());

        let mut attrs = Attributes::new();
        attrs.insert("location".to_string(), json!("London, UK"));
        attrs.insert("favorite_band".to_string(), json!("Linkin Park"));
        assert!(g.update_entity(USER_ID, &attrs, EntitySource::UserStated));

        assert!(g.self_check("Since you live in London, bring an umbrella.").is_ok());
        let err = g.self_check("Since you live in Paris, try the cafes.").unwrap_err();
        assert!(err.contains("'paris'"));

        assert!(g.self_check("Your favorite band is Linkin Park.").is_ok());
        let err = g.self_check("Your favourite band is Muse.").unwrap_err();
        assert!(err.contains("favorite band"));
        assert!(g.self_check("Your favorite color is blue.").is_ok());
    }

    #[test]
    fn test_context_respects_budget() {
        let mut g = graph();
        g.record_action("web_search", json!({"query": "rust async"}), "results", true);
        let ctx = g.context_for_planner("search that again", 1000);
        assert!(ctx.contains("[RESOLVED]"));
        assert!(ctx.contains("[USER] Ada"));

        let short = g.context_for_planner("anything", 20);
        assert_eq!(short.chars().count(), 20);
        assert!(short.ends_with("..."));
    }

    #[test]
    fn test_summarize_recent_activity() {
        let mut g = graph();
        assert!(g.summarize_recent_activity(5).contains("don't have"));
        g.record_action("web_search", json!({"query": "rust"}), "ok", true);
        g.record_action("spotify_control", json!({"song_name": "Hello"}), "ok", true);
        assert_eq!(g.summarize_recent_activity(5), "You recently asked about rust and Hello.");
    }
}
