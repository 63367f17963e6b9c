//! 会话级记忆图句柄
//!
//! 写操作持有独占写锁；生成上下文时读快照（不可变克隆），不会看到回收到一半的图。
//! 不存在进程级单例：每个会话各自构造一个 SharedGraph。

use std::sync::Arc;

use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::GraphSection;
use crate::core::AgentError;
use crate::memory::graph::{MaintenanceReport, MemoryGraph, MemoryPolicy};
use crate::memory::persistence::GraphStore;

#[derive(Clone)]
pub struct SharedGraph {
    inner: Arc<RwLock<MemoryGraph>>,
    store: Option<GraphStore>,
}

impl SharedGraph {
    /// 仅内存，不落盘
    pub fn in_memory(graph: MemoryGraph) -> Self {
        Self {
            inner: Arc::new(RwLock::new(graph)),
            store: None,
        }
    }

    pub fn with_store(graph: MemoryGraph, store: GraphStore) -> Self {
        Self {
            inner: Arc::new(RwLock::new(graph)),
            store: Some(store),
        }
    }

    /// 从磁盘打开（文件不存在则新建），并应用配置中的用户资料
    pub fn open(store: GraphStore, cfg: &GraphSection) -> Result<Self, AgentError> {
        let mut graph = store.load(MemoryPolicy::from(cfg), &cfg.user_name)?;
        graph.apply_user_profile(cfg);
        Ok(Self::with_store(graph, store))
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, MemoryGraph> {
        self.inner.read().await
    }

    pub async fn write(&self) -> RwLockWriteGuard<'_, MemoryGraph> {
        self.inner.write().await
    }

    /// 不可变快照
    pub async fn snapshot(&self) -> MemoryGraph {
        self.inner.read().await.clone()
    }

    /// 轮次结束维护（写锁内完成）
    pub async fn advance_turn(&self) -> MaintenanceReport {
        self.inner.write().await.advance_turn()
    }

    /// 持久化；未配置存储时为空操作。失败必须上抛
    ///
    /// 先取快照释放读锁，再在 spawn_blocking 中做同步写盘
    pub async fn save(&self) -> Result<(), AgentError> {
        let Some(store) = self.store.clone() else {
            return Ok(());
        };
        let graph = self.snapshot().await;
        tokio::task::spawn_blocking(move || store.save(&graph))
            .await
            .map_err(|e| AgentError::Persistence(format!("save task failed: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::entity::{EntitySource, EntityType};

    #[tokio::test]
    async fn test_snapshot_is_isolated_from_later_writes() {
        let shared = SharedGraph::in_memory(MemoryGraph::new("Ada", MemoryPolicy::default()));
        let snap = shared.snapshot().await;
        shared
            .write()
            .await
            .get_or_create_entity(EntityType::Topic, "rust", EntitySource::UserStated, None);

        assert_eq!(snap.entity_count(), 1);
        assert_eq!(shared.read().await.entity_count(), 2);
    }

    #[tokio::test]
    async fn test_open_save_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.json");
        let mut cfg = GraphSection::default();
        cfg.user_name = "Ada".to_string();
        cfg.not_claims = vec!["the actress".to_string()];

        let shared = SharedGraph::open(GraphStore::new(&path), &cfg).unwrap();
        shared
            .write()
            .await
            .get_or_create_entity(EntityType::Topic, "rust", EntitySource::UserStated, None);
        shared.advance_turn().await;
        shared.save().await.unwrap();

        let reopened = SharedGraph::open(GraphStore::new(&path), &cfg).unwrap();
        let g = reopened.read().await;
        assert_eq!(g.current_turn(), 1);
        assert!(g.get_entity("topic:rust").is_some());
        assert_eq!(g.user().not_claims.len(), 1);
    }

    #[tokio::test]
    async fn test_save_error_reaches_caller() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "x").unwrap();
        let shared = SharedGraph::with_store(
            MemoryGraph::new("Ada", MemoryPolicy::default()),
            GraphStore::new(blocker.join("graph.json")),
        );

        // 保存期间仍可并发读
        let _guard = shared.read().await;
        let err = shared.save().await.unwrap_err();
        assert!(matches!(err, AgentError::Persistence(_)));
    }
}
