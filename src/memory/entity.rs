//! 实体节点：可被后续轮次引用的事物（用户、歌曲、话题、约束……）
//!
//! 置信度按 30 天半衰期惰性衰减，读取时计算，不依赖后台定时器；下限 0.1。

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// 唯一的用户实体 id
pub const USER_ID: &str = "user:self";

/// touch 时的置信度增量
pub const TOUCH_BOOST: f64 = 0.05;

/// 实体属性：保持插入顺序
pub type Attributes = IndexMap<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    User,
    Preference,
    Person,
    Song,
    Artist,
    App,
    Topic,
    Query,
    File,
    Event,
    Task,
    Location,
    Constraint,
    External,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::User => "user",
            EntityType::Preference => "preference",
            EntityType::Person => "person",
            EntityType::Song => "song",
            EntityType::Artist => "artist",
            EntityType::App => "app",
            EntityType::Topic => "topic",
            EntityType::Query => "query",
            EntityType::File => "file",
            EntityType::Event => "event",
            EntityType::Task => "task",
            EntityType::Location => "location",
            EntityType::Constraint => "constraint",
            EntityType::External => "external",
        }
    }
}

/// 持久程度：EPHEMERAL（可能被遗忘）→ CANDIDATE（暂定持久）→ PROMOTED（受保护）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityLifecycle {
    Ephemeral,
    Candidate,
    Promoted,
}

/// 写入来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntitySource {
    UserStated,
    UserConfirmed,
    ToolResult,
    LlmInferred,
    MemoryRecalled,
    System,
}

impl EntitySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntitySource::UserStated => "user_stated",
            EntitySource::UserConfirmed => "user_confirmed",
            EntitySource::ToolResult => "tool_result",
            EntitySource::LlmInferred => "llm_inferred",
            EntitySource::MemoryRecalled => "memory_recalled",
            EntitySource::System => "system",
        }
    }

    /// 用户本人说出/确认的来源
    pub fn is_user_authored(&self) -> bool {
        matches!(self, EntitySource::UserStated | EntitySource::UserConfirmed)
    }

    /// 新建实体时的生命周期与初始置信度
    pub fn seed(&self) -> (EntityLifecycle, f64) {
        match self {
            EntitySource::UserStated | EntitySource::UserConfirmed | EntitySource::System => {
                (EntityLifecycle::Promoted, 0.9)
            }
            EntitySource::ToolResult | EntitySource::MemoryRecalled => {
                (EntityLifecycle::Ephemeral, 0.4)
            }
            EntitySource::LlmInferred => (EntityLifecycle::Ephemeral, 0.3),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityNode {
    pub id: String,
    pub entity_type: EntityType,
    pub name: String,
    #[serde(default)]
    pub attributes: Attributes,
    /// 永远不能归到该实体名下的说法（仅用户实体使用）
    #[serde(default)]
    pub not_claims: BTreeSet<String>,
    pub lifecycle: EntityLifecycle,
    pub source: EntitySource,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
    pub last_referenced: DateTime<Utc>,
    #[serde(default)]
    pub reference_count: u32,
    #[serde(default)]
    pub summary: String,
}

impl EntityNode {
    pub fn new(entity_type: EntityType, name: &str, source: EntitySource, now: DateTime<Utc>) -> Self {
        let (lifecycle, confidence) = source.seed();
        let name = name.trim().to_string();
        let mut node = Self {
            id: Self::key(entity_type, &name),
            entity_type,
            name,
            attributes: Attributes::new(),
            not_claims: BTreeSet::new(),
            lifecycle,
            source,
            confidence,
            created_at: now,
            last_referenced: now,
            reference_count: 0,
            summary: String::new(),
        };
        node.refresh_summary();
        node
    }

    /// 用户实体：始终 PROMOTED，置信度 1.0
    pub fn new_user(name: &str, now: DateTime<Utc>) -> Self {
        let mut node = Self::new(EntityType::User, name, EntitySource::System, now);
        node.id = USER_ID.to_string();
        node.confidence = 1.0;
        node.refresh_summary();
        node
    }

    /// 由 (类型, 名称) 得到稳定 id，如 `topic:ai_news`
    pub fn key(entity_type: EntityType, name: &str) -> String {
        if entity_type == EntityType::User {
            return USER_ID.to_string();
        }
        format!("{}:{}", entity_type.as_str(), normalize_name(name))
    }

    pub fn is_user(&self) -> bool {
        self.id == USER_ID
    }

    pub fn touch_at(&mut self, now: DateTime<Utc>) {
        self.confidence = (self.confidence + TOUCH_BOOST).min(1.0);
        self.reference_count = self.reference_count.saturating_add(1);
        self.last_referenced = now;
    }

    /// `confidence * 0.5^(days / half_life)`，不低于 floor
    pub fn current_confidence_at(&self, now: DateTime<Utc>, half_life_days: f64, floor: f64) -> f64 {
        let elapsed = now.signed_duration_since(self.last_referenced);
        let days = (elapsed.num_milliseconds().max(0) as f64) / 86_400_000.0;
        let decayed = if half_life_days > 0.0 {
            self.confidence * 0.5_f64.powf(days / half_life_days)
        } else {
            self.confidence
        };
        decayed.max(floor)
    }

    pub fn merge_attributes(&mut self, attrs: &Attributes) {
        for (k, v) in attrs {
            self.attributes.insert(k.clone(), v.clone());
        }
        self.refresh_summary();
    }

    pub fn refresh_summary(&mut self) {
        let attrs: Vec<String> = self
            .attributes
            .iter()
            .filter(|(k, _)| k.as_str() != "key_facts")
            .take(3)
            .map(|(k, v)| match v {
                serde_json::Value::String(s) => format!("{k}: {s}"),
                other => format!("{k}: {other}"),
            })
            .collect();
        self.summary = if attrs.is_empty() {
            format!("{} ({})", self.name, self.entity_type.as_str())
        } else {
            format!("{} ({}). {}", self.name, self.entity_type.as_str(), attrs.join(", "))
        };
    }
}

/// 名称归一化：小写，非字母数字折叠为单个下划线
pub fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_sep = false;
    for c in name.trim().chars() {
        if c.is_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.extend(c.to_lowercase());
        } else {
            pending_sep = true;
        }
    }
    if out.is_empty() {
        out.push('_');
    }
    out
}
