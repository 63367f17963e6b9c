//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 按顺序吐出预置回复；队列耗尽后返回默认回复。记录调用次数与最后一次收到的消息，
//! 便于断言「恰好花了几次调用」。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{LlmClient, Message};

/// 队列耗尽时的默认回复：校验通过
pub const MOCK_DEFAULT_RESPONSE: &str = r#"{"verdict": "PASS", "reason": "looks good"}"#;

/// Mock 客户端：脚本化回复 + 调用计数
#[derive(Debug, Default)]
pub struct MockLlmClient {
    responses: Mutex<VecDeque<Result<String, String>>>,
    default_response: Option<String>,
    calls: AtomicUsize,
    last_messages: Mutex<Vec<Message>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 依次返回给定回复
    pub fn with_responses<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let client = Self::default();
        for r in responses {
            client.push_response(r);
        }
        client
    }

    pub fn with_default_response(mut self, response: impl Into<String>) -> Self {
        self.default_response = Some(response.into());
        self
    }

    pub fn push_response(&self, response: impl Into<String>) {
        if let Ok(mut q) = self.responses.lock() {
            q.push_back(Ok(response.into()));
        }
    }

    /// 下一次调用返回错误（模拟后端不可用）
    pub fn push_error(&self, error: impl Into<String>) {
        if let Ok(mut q) = self.responses.lock() {
            q.push_back(Err(error.into()));
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_messages(&self) -> Vec<Message> {
        self.last_messages
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut last) = self.last_messages.lock() {
            *last = messages.to_vec();
        }
        let next = self
            .responses
            .lock()
            .map_err(|e| e.to_string())?
            .pop_front();
        match next {
            Some(r) => r,
            None => Ok(self
                .default_response
                .clone()
                .unwrap_or_else(|| MOCK_DEFAULT_RESPONSE.to_string())),
        }
    }

    fn model_name(&self) -> &str {
        "mock"
    }
}
