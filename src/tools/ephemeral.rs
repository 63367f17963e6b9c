//! 临时内容库：超大工具输出整体转存，只留检索 id
//!
//! InMemoryEphemeralStore 按段落切块，检索时按关键词重叠打分（无向量），
//! 通过 query_ephemeral 工具把相关片段取回。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::tools::Tool;

/// 临时内容库接口
#[async_trait]
pub trait EphemeralStore: Send + Sync {
    /// 存入全文，返回检索 id
    async fn ingest(&self, text: &str, source_tool: &str) -> Result<String, String>;

    /// 在指定文档中检索与 query 最相关的片段
    async fn query(&self, id: &str, query: &str) -> Result<String, String>;

    /// 删除早于 max_age 的文档，返回删除数量
    async fn cleanup_older_than(&self, max_age: Duration) -> usize;
}

/// 每块目标字符数
const CHUNK_CHARS: usize = 600;
/// 检索返回的片段数
const TOP_K: usize = 3;
/// 回合结束时清理早于此年龄的文档（秒）
pub const EPHEMERAL_MAX_AGE_SECS: u64 = 3600;

struct EphemeralDoc {
    source_tool: String,
    created_at: DateTime<Utc>,
    chunks: Vec<(String, HashSet<String>)>,
}

/// 将文本切分为小写词集合，用于简单相似度（词重叠数）
fn tokenize_lower(s: &str) -> HashSet<String> {
    s.split(|c: char| !c.is_alphanumeric())
        .map(|w| w.to_lowercase())
        .filter(|w| w.chars().count() > 1)
        .collect()
}

/// 按段落聚合成不超过 CHUNK_CHARS 的块；超长段落按字符硬切
fn chunk_text(text: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for para in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        if !current.is_empty() && current.chars().count() + para.chars().count() > CHUNK_CHARS {
            chunks.push(std::mem::take(&mut current));
        }
        if para.chars().count() > CHUNK_CHARS {
            let chars: Vec<char> = para.chars().collect();
            for piece in chars.chunks(CHUNK_CHARS) {
                chunks.push(piece.iter().collect());
            }
            continue;
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(para);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// 内存实现：关键词重叠检索
#[derive(Clone, Default)]
pub struct InMemoryEphemeralStore {
    docs: Arc<RwLock<HashMap<String, EphemeralDoc>>>,
}

impl InMemoryEphemeralStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.docs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.docs.read().await.is_empty()
    }
}

#[async_trait]
impl EphemeralStore for InMemoryEphemeralStore {
    async fn ingest(&self, text: &str, source_tool: &str) -> Result<String, String> {
        let chunks = chunk_text(text);
        if chunks.is_empty() {
            return Err("nothing to ingest".to_string());
        }
        let id = format!("eph_{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);
        let doc = EphemeralDoc {
            source_tool: source_tool.to_string(),
            created_at: Utc::now(),
            chunks: chunks
                .into_iter()
                .map(|c| {
                    let tokens = tokenize_lower(&c);
                    (c, tokens)
                })
                .collect(),
        };
        tracing::info!(id = %id, tool = source_tool, chunks = doc.chunks.len(), chars = text.len(), "ephemeral ingest");
        self.docs.write().await.insert(id.clone(), doc);
        Ok(id)
    }

    async fn query(&self, id: &str, query: &str) -> Result<String, String> {
        let docs = self.docs.read().await;
        let doc = docs
            .get(id)
            .ok_or_else(|| format!("Ephemeral id '{id}' not found or expired"))?;

        let query_tokens = tokenize_lower(query);
        let mut scored: Vec<(usize, usize)> = doc
            .chunks
            .iter()
            .enumerate()
            .map(|(i, (_, tokens))| (query_tokens.intersection(tokens).count(), i))
            .filter(|(score, _)| *score > 0)
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        if scored.is_empty() {
            // 没有重叠时给出开头，至少让调用方知道内容是什么
            let head = doc.chunks.first().map(|(c, _)| c.as_str()).unwrap_or("");
            return Ok(format!("[No direct match in {} output] {head}", doc.source_tool));
        }
        let mut picked: Vec<usize> = scored.into_iter().take(TOP_K).map(|(_, i)| i).collect();
        picked.sort_unstable();
        Ok(picked
            .into_iter()
            .map(|i| doc.chunks[i].0.as_str())
            .collect::<Vec<_>>()
            .join("\n---\n"))
    }

    async fn cleanup_older_than(&self, max_age: Duration) -> usize {
        // 超出 chrono 可表示范围的年龄：没有文档会比它更老
        let Some(cutoff) = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return 0;
        };
        let mut docs = self.docs.write().await;
        let before = docs.len();
        docs.retain(|_, d| d.created_at >= cutoff);
        let removed = before - docs.len();
        if removed > 0 {
            tracing::debug!(removed, "ephemeral cleanup");
        }
        removed
    }
}

/// 从临时内容库取回片段的工具
pub struct QueryEphemeralTool {
    store: Arc<dyn EphemeralStore>,
}

impl QueryEphemeralTool {
    pub const NAME: &'static str = "query_ephemeral";

    pub fn new(store: Arc<dyn EphemeralStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for QueryEphemeralTool {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "Retrieve relevant passages from a large tool output stored earlier. Args: {\"ephemeral_id\": \"eph_...\", \"query\": \"what to look for\"}"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "ephemeral_id": {"type": "string"},
                "query": {"type": "string"}
            },
            "required": ["ephemeral_id", "query"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let id = args
            .get("ephemeral_id")
            .and_then(|v| v.as_str())
            .ok_or("missing 'ephemeral_id' argument")?;
        let query = args.get("query").and_then(|v| v.as_str()).unwrap_or("");
        self.store.query(id, query).await
    }
}
