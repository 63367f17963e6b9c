//! 记忆图持久化
//!
//! 单文件 JSON 文档 `{version, current_turn, current_session, entities, actions}`。
//! 写入时先写同目录临时文件并 fsync，再原子 rename，崩溃不会留下半截文件。

use std::io::Write;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::core::AgentError;
use crate::memory::action::ActionNode;
use crate::memory::entity::{EntityNode, USER_ID};
use crate::memory::graph::{MemoryGraph, MemoryPolicy};

/// 文档格式版本；不一致时丢弃旧文件重新开始
pub const GRAPH_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
pub struct GraphDocument {
    pub version: u32,
    pub current_turn: u64,
    pub current_session: String,
    pub entities: IndexMap<String, EntityNode>,
    pub actions: Vec<ActionNode>,
}

impl MemoryGraph {
    /// 导出为可落盘文档（动作只保留最近 max_actions 条）
    pub fn to_document(&self) -> GraphDocument {
        let entities = self
            .entities()
            .map(|e| (e.id.clone(), e.clone()))
            .collect();
        let start = self.actions.len().saturating_sub(self.policy.max_actions);
        GraphDocument {
            version: GRAPH_FORMAT_VERSION,
            current_turn: self.current_turn,
            current_session: self.current_session.clone(),
            entities,
            actions: self.actions[start..].to_vec(),
        }
    }

    /// 从文档恢复；用户实体缺失时用 fallback_name 新建
    pub fn from_document(doc: GraphDocument, policy: MemoryPolicy, fallback_name: &str) -> Self {
        let mut graph = MemoryGraph::new(fallback_name, policy);
        let mut entities = doc.entities;
        if let Some(user) = entities.shift_remove(USER_ID) {
            graph.restore_user(user);
        }
        // 键以节点自身 id 为准
        graph.entities = entities
            .into_values()
            .filter(|e| !e.is_user())
            .map(|e| (e.id.clone(), e))
            .collect();
        graph.actions = doc.actions;
        graph.current_turn = doc.current_turn;
        if !doc.current_session.is_empty() {
            graph.current_session = doc.current_session;
        }
        graph
    }
}

/// 记忆图文件存储
#[derive(Debug, Clone)]
pub struct GraphStore {
    path: PathBuf,
}

impl GraphStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 加载；文件不存在或版本不符时返回新图
    pub fn load(&self, policy: MemoryPolicy, user_name: &str) -> Result<MemoryGraph, AgentError> {
        if !self.path.exists() {
            tracing::info!(path = %self.path.display(), "no saved graph, starting fresh");
            return Ok(MemoryGraph::new(user_name, policy));
        }
        let data = std::fs::read_to_string(&self.path)?;
        let doc: GraphDocument = serde_json::from_str(&data)
            .map_err(|e| AgentError::Persistence(format!("{}: {e}", self.path.display())))?;
        if doc.version != GRAPH_FORMAT_VERSION {
            tracing::warn!(
                found = doc.version,
                expected = GRAPH_FORMAT_VERSION,
                "graph format version mismatch, starting fresh"
            );
            return Ok(MemoryGraph::new(user_name, policy));
        }
        let graph = MemoryGraph::from_document(doc, policy, user_name);
        tracing::info!(
            path = %self.path.display(),
            entities = graph.entity_count(),
            actions = graph.actions().len(),
            "graph loaded"
        );
        Ok(graph)
    }

    /// 原子写入：临时文件 + fsync + rename；父目录不存在时自动创建
    pub fn save(&self, graph: &MemoryGraph) -> Result<(), AgentError> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;

        let body = serde_json::to_vec_pretty(&graph.to_document())?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(&body)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)
            .map_err(|e| AgentError::Persistence(e.error.to_string()))?;

        tracing::debug!(path = %self.path.display(), bytes = body.len(), "graph saved");
        Ok(())
    }
}
