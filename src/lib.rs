//! Bee 执行与记忆核心
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 调用预算、错误分类与恢复
//! - **execution**: 回退表、输出管控、执行循环
//! - **llm**: 推理后端抽象与 Mock
//! - **memory**: 世界记忆图（实体、动作、授权、指代消解、持久化）
//! - **react**: 计划与规划器接口、结果校验、回合管线
//! - **tools**: 工具注册表、运行器、临时内容库

pub mod config;
pub mod core;
pub mod execution;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod tools;

pub use crate::config::{load_config, AppConfig};
pub use crate::core::{AgentError, CallBudget};
pub use crate::memory::{MemoryGraph, SharedGraph};
pub use crate::react::{TurnOutcome, TurnPipeline, TurnStatus};
