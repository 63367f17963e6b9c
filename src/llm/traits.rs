//! LLM 客户端抽象
//!
//! 执行核心只需要非流式完成：校验器与规划器各自发一次请求，调用前由 CallBudget 计数。

use async_trait::async_trait;

use crate::llm::Message;

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式完成
    async fn complete(&self, messages: &[Message]) -> Result<String, String>;

    /// 模型名，用于调用日志
    fn model_name(&self) -> &str {
        "unknown"
    }
}
