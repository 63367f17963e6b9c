//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `BEE__*` 覆盖（双下划线表示嵌套，如 `BEE__BUDGET__HARD_LIMIT=4`）。
//! 每个字段的默认值与对应模块导出的常量一致。

use std::collections::HashMap;
use std::path::PathBuf;

use indexmap::IndexMap;
use serde::Deserialize;

use crate::core::budget::{DEFAULT_HARD_LIMIT, DEFAULT_SOFT_LIMIT};
use crate::execution::fallback::default_fallbacks;
use crate::execution::governor::{DIVERT_THRESHOLD, HARD_THRESHOLD, SOFT_THRESHOLD};
use crate::execution::DEFAULT_MAX_ITERATIONS;
use crate::memory::graph::{
    CONFIDENCE_FLOOR, DEMOTE_CANDIDATE_BELOW, DEMOTE_PROMOTED_BELOW, GC_MIN_REFERENCES,
    GC_TTL_SECS, HALF_LIFE_DAYS, MAX_ACTIONS, PROMOTION_THRESHOLD, STALE_CANDIDATE_DAYS,
};
use crate::react::verifier::MAX_RESULT_CHARS;
use crate::tools::ephemeral::EPHEMERAL_MAX_AGE_SECS;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub budget: BudgetSection,
    pub graph: GraphSection,
    pub governor: GovernorSection,
    pub execution: ExecutionSection,
    pub verifier: VerifierSection,
}

/// [app] 段：应用名与数据目录
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 记忆图等持久化文件所在目录，未设置时用 ./data
    pub data_dir: PathBuf,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            data_dir: PathBuf::from("data"),
        }
    }
}

/// [budget] 段：每轮推理调用上限与重试次数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BudgetSection {
    pub hard_limit: usize,
    pub soft_limit: usize,
    /// 校验失败后允许的重新规划次数
    pub max_retries: usize,
}

impl Default for BudgetSection {
    fn default() -> Self {
        Self {
            hard_limit: DEFAULT_HARD_LIMIT,
            soft_limit: DEFAULT_SOFT_LIMIT,
            max_retries: 1,
        }
    }
}

/// [graph] 段：记忆图的衰减、生命周期、回收与持久化
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GraphSection {
    /// 相对路径按 app.data_dir 解析
    pub persist_path: PathBuf,
    pub user_name: String,
    pub user_attributes: IndexMap<String, serde_json::Value>,
    /// 用户明确否认的事实（如「不是那个同名的演员」）
    pub not_claims: Vec<String>,
    pub half_life_days: f64,
    pub confidence_floor: f64,
    pub promotion_threshold: u32,
    pub demote_promoted_below: f64,
    pub demote_candidate_below: f64,
    pub gc_ttl_secs: i64,
    pub gc_min_references: u32,
    pub stale_candidate_days: i64,
    pub max_actions: usize,
    /// 对外检索类工具：查询指向用户本人时拒绝执行
    pub external_lookup_tools: Vec<String>,
}

impl Default for GraphSection {
    fn default() -> Self {
        Self {
            persist_path: PathBuf::from("world_graph.json"),
            user_name: "User".to_string(),
            user_attributes: IndexMap::new(),
            not_claims: Vec::new(),
            half_life_days: HALF_LIFE_DAYS,
            confidence_floor: CONFIDENCE_FLOOR,
            promotion_threshold: PROMOTION_THRESHOLD,
            demote_promoted_below: DEMOTE_PROMOTED_BELOW,
            demote_candidate_below: DEMOTE_CANDIDATE_BELOW,
            gc_ttl_secs: GC_TTL_SECS,
            gc_min_references: GC_MIN_REFERENCES,
            stale_candidate_days: STALE_CANDIDATE_DAYS,
            max_actions: MAX_ACTIONS,
            external_lookup_tools: ["web_search", "arxiv_search", "search", "wikipedia"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// [governor] 段：工具输出体量阈值（字符数）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GovernorSection {
    pub soft_threshold: usize,
    pub hard_threshold: usize,
    pub divert_threshold: usize,
    /// 转存内容的保留时长（秒），回合结束时清理
    pub ephemeral_max_age_secs: u64,
}

impl Default for GovernorSection {
    fn default() -> Self {
        Self {
            soft_threshold: SOFT_THRESHOLD,
            hard_threshold: HARD_THRESHOLD,
            divert_threshold: DIVERT_THRESHOLD,
            ephemeral_max_age_secs: EPHEMERAL_MAX_AGE_SECS,
        }
    }
}

/// [execution] 段：步数上限、超时与回退表
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutionSection {
    pub max_iterations: usize,
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
    /// 整轮超时（秒），只在步骤之间检查
    pub turn_timeout_secs: u64,
    /// 主工具 -> 备用工具
    pub fallbacks: HashMap<String, String>,
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            tool_timeout_secs: 30,
            turn_timeout_secs: 60,
            fallbacks: default_fallbacks(),
        }
    }
}

/// [verifier] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VerifierSection {
    /// 送入校验模型的工具输出上限
    pub max_result_chars: usize,
    /// 覆盖内置系统提示词
    pub system_prompt: Option<String>,
}

impl Default for VerifierSection {
    fn default() -> Self {
        Self {
            max_result_chars: MAX_RESULT_CHARS,
            system_prompt: None,
        }
    }
}

impl AppConfig {
    /// 记忆图文件的绝对/相对路径
    pub fn graph_path(&self) -> PathBuf {
        if self.graph.persist_path.is_absolute() {
            self.graph.persist_path.clone()
        } else {
            self.app.data_dir.join(&self.graph.persist_path)
        }
    }
}

/// 从默认路径与环境变量加载配置
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("BEE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
