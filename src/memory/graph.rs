//! 世界记忆图：实体 + 动作
//!
//! - 实体按来源决定初始生命周期与置信度；置信度读取时按半衰期衰减
//! - 动作只追加，压缩时先把关键事实折叠进焦点实体再丢弃
//! - 维护（降级、晋升、压缩、回收）在 advance_turn 中同步执行，没有后台定时器
//!
//! 每个会话持有独立的 MemoryGraph；并发访问经由 [`crate::memory::SharedGraph`]。

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use indexmap::map::Entry;
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;

use crate::config::GraphSection;
use crate::memory::action::{
    argument_hints, extract_key_facts, focus_hint, truncate_chars, ActionNode, RESULT_TEXT_CAP,
};
use crate::memory::authz;
use crate::memory::entity::{
    Attributes, EntityLifecycle, EntityNode, EntitySource, EntityType, USER_ID,
};

/// 置信度半衰期（天）
pub const HALF_LIFE_DAYS: f64 = 30.0;
/// 置信度下限
pub const CONFIDENCE_FLOOR: f64 = 0.1;
/// EPHEMERAL 晋升为 CANDIDATE 所需的引用次数
pub const PROMOTION_THRESHOLD: u32 = 3;
/// PROMOTED 衰减到此值以下降为 CANDIDATE
pub const DEMOTE_PROMOTED_BELOW: f64 = 0.3;
/// CANDIDATE 衰减到此值以下降为 EPHEMERAL
pub const DEMOTE_CANDIDATE_BELOW: f64 = 0.15;
/// EPHEMERAL 未被引用超过该秒数即可回收
pub const GC_TTL_SECS: i64 = 3600;
/// 引用次数不低于此值的 EPHEMERAL 不会因超时被回收
pub const GC_MIN_REFERENCES: u32 = 2;
/// CANDIDATE 未被引用超过该天数即被回收
pub const STALE_CANDIDATE_DAYS: i64 = 7;
/// 保留的动作历史条数
pub const MAX_ACTIONS: usize = 100;
/// 折叠进实体的关键事实上限
pub const MAX_FOLDED_FACTS: usize = 10;

/// 各类型非 PROMOTED 实体的数量上限
pub fn default_type_caps() -> HashMap<EntityType, usize> {
    HashMap::from([
        (EntityType::Query, 200),
        (EntityType::Song, 150),
        (EntityType::App, 100),
        (EntityType::Topic, 150),
        (EntityType::External, 100),
    ])
}

/// 记忆图的可调参数
#[derive(Debug, Clone)]
pub struct MemoryPolicy {
    pub half_life_days: f64,
    pub confidence_floor: f64,
    pub promotion_threshold: u32,
    pub demote_promoted_below: f64,
    pub demote_candidate_below: f64,
    pub gc_ttl: Duration,
    pub gc_min_references: u32,
    pub stale_candidate: Duration,
    pub max_actions: usize,
    pub type_caps: HashMap<EntityType, usize>,
    pub external_lookup_tools: Vec<String>,
}

impl Default for MemoryPolicy {
    fn default() -> Self {
        Self::from(&GraphSection::default())
    }
}

impl From<&GraphSection> for MemoryPolicy {
    fn from(cfg: &GraphSection) -> Self {
        Self {
            half_life_days: cfg.half_life_days,
            confidence_floor: cfg.confidence_floor,
            promotion_threshold: cfg.promotion_threshold,
            demote_promoted_below: cfg.demote_promoted_below,
            demote_candidate_below: cfg.demote_candidate_below,
            gc_ttl: bounded_duration(Duration::try_seconds(cfg.gc_ttl_secs), GC_TTL_SECS, "gc_ttl_secs"),
            gc_min_references: cfg.gc_min_references,
            stale_candidate: bounded_duration(
                Duration::try_days(cfg.stale_candidate_days),
                STALE_CANDIDATE_DAYS * 86_400,
                "stale_candidate_days",
            ),
            max_actions: cfg.max_actions,
            type_caps: default_type_caps(),
            external_lookup_tools: cfg.external_lookup_tools.clone(),
        }
    }
}

/// 配置值超出 chrono 可表示范围时回落到默认秒数
fn bounded_duration(value: Option<Duration>, default_secs: i64, field: &str) -> Duration {
    value.unwrap_or_else(|| {
        tracing::warn!(field, default_secs, "graph duration out of range, using default");
        Duration::seconds(default_secs)
    })
}

/// 一次维护的结果
#[derive(Debug, Clone, Default, Serialize)]
pub struct MaintenanceReport {
    pub turn: u64,
    pub demoted: Vec<String>,
    pub promoted: Vec<String>,
    pub compacted: usize,
    pub collected: Vec<String>,
}

/// 调试用统计
#[derive(Debug, Clone, Serialize)]
pub struct GraphStats {
    pub turn: u64,
    pub session: String,
    pub entities: usize,
    pub actions: usize,
    pub lifecycle_breakdown: BTreeMap<String, usize>,
}

#[derive(Debug, Clone)]
pub struct MemoryGraph {
    /// 用户实体单独存放，保证它始终存在
    pub(crate) user: EntityNode,
    /// 除用户外的所有实体
    pub(crate) entities: IndexMap<String, EntityNode>,
    pub(crate) actions: Vec<ActionNode>,
    pub(crate) current_turn: u64,
    pub(crate) current_session: String,
    pub(crate) policy: MemoryPolicy,
}

impl MemoryGraph {
    pub fn new(user_name: &str, policy: MemoryPolicy) -> Self {
        Self {
            user: EntityNode::new_user(user_name, Utc::now()),
            entities: IndexMap::new(),
            actions: Vec::new(),
            current_turn: 0,
            current_session: uuid::Uuid::new_v4().to_string(),
            policy,
        }
    }

    /// 按配置建图，并写入用户的已知属性与否认事实
    pub fn from_config(cfg: &GraphSection) -> Self {
        let mut graph = Self::new(&cfg.user_name, MemoryPolicy::from(cfg));
        graph.apply_user_profile(cfg);
        graph
    }

    pub(crate) fn apply_user_profile(&mut self, cfg: &GraphSection) {
        if !cfg.user_attributes.is_empty() {
            self.update_entity(USER_ID, &cfg.user_attributes, EntitySource::System);
        }
        for claim in &cfg.not_claims {
            self.add_not_claim(claim, EntitySource::System);
        }
    }

    pub fn policy(&self) -> &MemoryPolicy {
        &self.policy
    }

    pub fn current_turn(&self) -> u64 {
        self.current_turn
    }

    pub fn current_session(&self) -> &str {
        &self.current_session
    }

    /// 开启新会话，轮次计数继续递增
    pub fn start_session(&mut self) -> String {
        self.current_session = uuid::Uuid::new_v4().to_string();
        tracing::info!(session = %self.current_session, "memory graph session started");
        self.current_session.clone()
    }

    // ---- 实体 ----

    pub fn user(&self) -> &EntityNode {
        &self.user
    }

    pub fn get_entity(&self, id: &str) -> Option<&EntityNode> {
        if id == USER_ID {
            Some(&self.user)
        } else {
            self.entities.get(id)
        }
    }

    fn entity_mut(&mut self, id: &str) -> Option<&mut EntityNode> {
        if id == USER_ID {
            Some(&mut self.user)
        } else {
            self.entities.get_mut(id)
        }
    }

    /// 所有实体，用户在最前
    pub fn entities(&self) -> impl Iterator<Item = &EntityNode> {
        std::iter::once(&self.user).chain(self.entities.values())
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len() + 1
    }

    /// 按 (类型, 归一化名称) 查找或创建
    ///
    /// 已存在则 touch；非 PROMOTED 的实体被用户本人再次陈述时直接晋升为 PROMOTED。
    pub fn get_or_create_entity(
        &mut self,
        entity_type: EntityType,
        name: &str,
        source: EntitySource,
        attributes: Option<&Attributes>,
    ) -> &EntityNode {
        let now = Utc::now();
        let id = EntityNode::key(entity_type, name);

        let node: &mut EntityNode = if id == USER_ID {
            &mut self.user
        } else {
            match self.entities.entry(id.clone()) {
                Entry::Occupied(e) => e.into_mut(),
                Entry::Vacant(e) => {
                    let mut node = EntityNode::new(entity_type, name, source, now);
                    if let Some(attrs) = attributes {
                        node.merge_attributes(attrs);
                    }
                    tracing::debug!(entity = %id, lifecycle = ?node.lifecycle, source = source.as_str(), "entity created");
                    return e.insert(node);
                }
            }
        };

        node.touch_at(now);
        // 用户重申只把 CANDIDATE 升为 PROMOTED；EPHEMERAL 仍须走引用计数
        if source.is_user_authored() && node.lifecycle == EntityLifecycle::Candidate {
            node.lifecycle = EntityLifecycle::Promoted;
            node.source = source;
            node.confidence = node.confidence.max(source.seed().1);
            tracing::info!(entity = %id, "entity promoted by user assertion");
        }
        if let Some(attrs) = attributes {
            if authz::can_write(node, source) {
                node.merge_attributes(attrs);
            } else {
                tracing::warn!(entity = %id, source = source.as_str(), "attribute write denied");
            }
        }
        node
    }

    /// 更新属性；无权限或实体不存在时返回 false，不做任何修改
    pub fn update_entity(&mut self, id: &str, attrs: &Attributes, source: EntitySource) -> bool {
        let Some(node) = self.entity_mut(id) else {
            tracing::debug!(entity = id, "update on missing entity");
            return false;
        };
        if !authz::can_write(node, source) {
            tracing::warn!(entity = id, source = source.as_str(), "blocked entity mutation");
            return false;
        }
        node.merge_attributes(attrs);
        true
    }

    /// 为用户实体增加一条「不是我」的约束，授权规则同 update_entity
    pub fn add_not_claim(&mut self, claim: &str, source: EntitySource) -> bool {
        let claim = claim.trim();
        if claim.is_empty() {
            return false;
        }
        if !authz::can_write(&self.user, source) {
            tracing::warn!(source = source.as_str(), "blocked not_claim mutation");
            return false;
        }
        self.user.not_claims.insert(claim.to_string());
        true
    }

    pub fn touch(&mut self, id: &str) -> bool {
        self.touch_at(id, Utc::now())
    }

    pub fn touch_at(&mut self, id: &str, now: DateTime<Utc>) -> bool {
        match self.entity_mut(id) {
            Some(node) => {
                node.touch_at(now);
                true
            }
            None => false,
        }
    }

    /// 当前有效置信度（惰性衰减）
    pub fn get_current_confidence(&self, entity: &EntityNode) -> f64 {
        self.current_confidence_at(entity, Utc::now())
    }

    pub fn current_confidence_at(&self, entity: &EntityNode, now: DateTime<Utc>) -> f64 {
        entity.current_confidence_at(now, self.policy.half_life_days, self.policy.confidence_floor)
    }

    // ---- 生命周期 ----

    /// 按衰减后的置信度降一级；用户实体永不降级
    pub fn check_lifecycle_demotion(&mut self, id: &str) -> bool {
        self.check_lifecycle_demotion_at(id, Utc::now())
    }

    pub fn check_lifecycle_demotion_at(&mut self, id: &str, now: DateTime<Utc>) -> bool {
        let (half_life, floor) = (self.policy.half_life_days, self.policy.confidence_floor);
        let (promoted_below, candidate_below) = (
            self.policy.demote_promoted_below,
            self.policy.demote_candidate_below,
        );
        if id == USER_ID {
            return false;
        }
        let Some(node) = self.entities.get_mut(id) else {
            return false;
        };
        if node.is_user() {
            return false;
        }
        let current = node.current_confidence_at(now, half_life, floor);
        let next = match node.lifecycle {
            EntityLifecycle::Promoted if current < promoted_below => EntityLifecycle::Candidate,
            EntityLifecycle::Candidate if current < candidate_below => EntityLifecycle::Ephemeral,
            _ => return false,
        };
        tracing::debug!(entity = id, from = ?node.lifecycle, to = ?next, confidence = current, "entity demoted");
        node.lifecycle = next;
        true
    }

    /// EPHEMERAL 且引用次数达标的实体升为 CANDIDATE（不会直接到 PROMOTED）
    pub fn check_promotions(&mut self) -> Vec<String> {
        let threshold = self.policy.promotion_threshold;
        let mut promoted = Vec::new();
        for node in self.entities.values_mut() {
            if node.lifecycle == EntityLifecycle::Ephemeral && node.reference_count >= threshold {
                node.lifecycle = EntityLifecycle::Candidate;
                promoted.push(node.id.clone());
            }
        }
        if !promoted.is_empty() {
            tracing::debug!(count = promoted.len(), "entities promoted to candidate");
        }
        promoted
    }

    // ---- 动作 ----

    /// 记录一次已完成的工具调用，推断焦点实体与关键事实
    pub fn record_action(&mut self, tool: &str, args: Value, result: &str, success: bool) -> ActionNode {
        let focus = focus_hint(tool, &args);
        let mut hints = Vec::new();
        if let Some(h) = focus.clone() {
            hints.push(h);
        }
        hints.extend(argument_hints(&args));

        let mut involved: Vec<String> = Vec::new();
        for (ty, name) in &hints {
            let key = EntityNode::key(*ty, name);
            if involved.contains(&key) {
                continue;
            }
            let id = self
                .get_or_create_entity(*ty, name, EntitySource::ToolResult, None)
                .id
                .clone();
            involved.push(id);
        }
        let focus_entity = focus
            .map(|(ty, name)| EntityNode::key(ty, &name))
            .or_else(|| involved.first().cloned());

        let seq = self.actions.iter().filter(|a| a.turn == self.current_turn).count() + 1;
        let action = ActionNode {
            id: format!("action:t-{}-{}", self.current_turn, seq),
            turn: self.current_turn,
            timestamp: Utc::now(),
            tool: tool.to_string(),
            summary: ActionNode::describe(tool, &args, success),
            key_facts: extract_key_facts(tool, &args, result, success),
            result_text: truncate_chars(result, RESULT_TEXT_CAP),
            args,
            success,
            focus_entity,
            entities_involved: involved,
            session_id: self.current_session.clone(),
        };
        tracing::info!(action = %action.id, tool, success, focus = ?action.focus_entity, "action recorded");
        self.actions.push(action.clone());
        action
    }

    pub fn actions(&self) -> &[ActionNode] {
        &self.actions
    }

    pub fn last_action(&self) -> Option<&ActionNode> {
        self.actions.last()
    }

    /// 某个工具最近一次的动作
    pub fn last_action_for(&self, tool: &str) -> Option<&ActionNode> {
        self.actions.iter().rev().find(|a| a.tool == tool)
    }

    pub fn recent_actions(&self, count: usize) -> &[ActionNode] {
        let start = self.actions.len().saturating_sub(count);
        &self.actions[start..]
    }

    /// 只保留最近 max_actions 条；被丢弃动作的关键事实折叠进各自的焦点实体
    pub fn compact_history(&mut self) -> usize {
        let max = self.policy.max_actions;
        if self.actions.len() <= max {
            return 0;
        }
        let overflow = self.actions.len() - max;
        let dropped: Vec<ActionNode> = self.actions.drain(..overflow).collect();

        let mut engagement: HashMap<String, (u64, Vec<String>)> = HashMap::new();
        for action in &dropped {
            let Some(focus) = &action.focus_entity else {
                continue;
            };
            let entry = engagement.entry(focus.clone()).or_default();
            entry.0 += 1;
            entry.1.extend(action.key_facts.iter().cloned());
        }

        for (id, (count, facts)) in engagement {
            let Some(node) = self.entities.get_mut(&id) else {
                tracing::debug!(entity = %id, "focus entity gone, facts dropped");
                continue;
            };
            let mut folded: Vec<String> = node
                .attributes
                .get("key_facts")
                .and_then(|v| v.as_array())
                .map(|a| a.iter().filter_map(|f| f.as_str().map(String::from)).collect())
                .unwrap_or_default();
            for fact in facts {
                if !folded.contains(&fact) {
                    folded.push(fact);
                }
            }
            if folded.len() > MAX_FOLDED_FACTS {
                folded.drain(..folded.len() - MAX_FOLDED_FACTS);
            }

            let total = node
                .attributes
                .get("engagement_score")
                .and_then(|v| v.as_u64())
                .unwrap_or(0)
                + count;
            let relationship = match total {
                t if t >= 5 => "loved",
                t if t >= 3 => "liked",
                _ => "mentioned",
            };
            node.attributes.insert("key_facts".into(), Value::from(folded));
            node.attributes.insert("engagement_score".into(), Value::from(total));
            node.attributes.insert("relationship".into(), Value::from(relationship));
            node.refresh_summary();
        }

        tracing::info!(dropped = overflow, kept = self.actions.len(), "action history compacted");
        overflow
    }

    // ---- 回收 ----

    pub fn collect_garbage(&mut self) -> Vec<String> {
        self.gc_at(Utc::now())
    }

    /// 回收规则：
    /// 1. EPHEMERAL 超过 TTL 未被引用且引用次数不足
    /// 2. CANDIDATE 超过 stale 天数未被引用
    /// 3. 各类型数量超限时，淘汰最久未引用的非 PROMOTED 实体
    ///
    /// PROMOTED、用户实体与偏好实体永不回收。
    pub fn gc_at(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let policy = &self.policy;
        let mut removed: HashSet<String> = HashSet::new();

        for node in self.entities.values() {
            if is_protected(node) {
                continue;
            }
            let idle = now.signed_duration_since(node.last_referenced);
            let expired = match node.lifecycle {
                EntityLifecycle::Ephemeral => {
                    idle > policy.gc_ttl && node.reference_count < policy.gc_min_references
                }
                EntityLifecycle::Candidate => idle > policy.stale_candidate,
                EntityLifecycle::Promoted => false,
            };
            if expired {
                removed.insert(node.id.clone());
            }
        }

        for (ty, cap) in &policy.type_caps {
            let mut pool: Vec<&EntityNode> = self
                .entities
                .values()
                .filter(|n| n.entity_type == *ty && !is_protected(n) && !removed.contains(&n.id))
                .collect();
            if pool.len() <= *cap {
                continue;
            }
            pool.sort_by_key(|n| n.last_referenced);
            let excess = pool.len() - cap;
            for node in pool.into_iter().take(excess) {
                removed.insert(node.id.clone());
            }
        }

        let mut removed: Vec<String> = removed.into_iter().collect();
        removed.sort();
        for id in &removed {
            self.entities.shift_remove(id);
        }
        if !removed.is_empty() {
            tracing::info!(count = removed.len(), remaining = self.entities.len(), "garbage collected entities");
        }
        removed
    }

    // ---- 轮次维护 ----

    /// 轮次结束：轮次 +1，然后做一次完整维护
    pub fn advance_turn(&mut self) -> MaintenanceReport {
        self.advance_turn_at(Utc::now())
    }

    pub fn advance_turn_at(&mut self, now: DateTime<Utc>) -> MaintenanceReport {
        self.current_turn += 1;
        self.run_maintenance_at(now)
    }

    /// 降级 -> 晋升 -> 压缩 -> 回收
    pub fn run_maintenance_at(&mut self, now: DateTime<Utc>) -> MaintenanceReport {
        let ids: Vec<String> = self.entities.keys().cloned().collect();
        let demoted = ids
            .into_iter()
            .filter(|id| self.check_lifecycle_demotion_at(id, now))
            .collect();
        let promoted = self.check_promotions();
        let compacted = self.compact_history();
        let collected = self.gc_at(now);

        let report = MaintenanceReport {
            turn: self.current_turn,
            demoted,
            promoted,
            compacted,
            collected,
        };
        tracing::debug!(
            turn = report.turn,
            entities = self.entities.len(),
            actions = self.actions.len(),
            "memory maintenance done"
        );
        report
    }

    pub fn stats(&self) -> GraphStats {
        let mut lifecycle_breakdown = BTreeMap::new();
        for node in self.entities() {
            let key = match node.lifecycle {
                EntityLifecycle::Ephemeral => "ephemeral",
                EntityLifecycle::Candidate => "candidate",
                EntityLifecycle::Promoted => "promoted",
            };
            *lifecycle_breakdown.entry(key.to_string()).or_insert(0) += 1;
        }
        GraphStats {
            turn: self.current_turn,
            session: self.current_session.chars().take(8).collect(),
            entities: self.entity_count(),
            actions: self.actions.len(),
            lifecycle_breakdown,
        }
    }

    /// 从外部数据恢复的用户实体：修正 id、类型与生命周期
    pub(crate) fn restore_user(&mut self, mut user: EntityNode) {
        user.id = USER_ID.to_string();
        user.entity_type = EntityType::User;
        user.lifecycle = EntityLifecycle::Promoted;
        user.confidence = user.confidence.clamp(CONFIDENCE_FLOOR, 1.0);
        self.entities.shift_remove(USER_ID);
        self.user = user;
    }
}

fn is_protected(node: &EntityNode) -> bool {
    node.is_user()
        || node.entity_type == EntityType::Preference
        || node.lifecycle == EntityLifecycle::Promoted
}
