#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use streamchat::api::{ChatTransport, OpenAICompatibleProvider};
use streamchat::config::ProviderSettings;
use streamchat::error::ChatError;
use streamchat::models::{ChatHistory, Message};
use streamchat::storage::{ChatStore, MemoryChatStore};
use wiremock::MockServer;

pub const COMPLETIONS_PATH: &str = "/chat/completions";

pub fn settings(server: &MockServer, timeout: Duration) -> ProviderSettings {
    ProviderSettings {
        base_url: server.uri(),
        api_key: "test-key".to_string(),
        model: "deepseek-chat".to_string(),
        temperature: Some(0.7),
        max_tokens: Some(2000),
        timeout,
    }
}

pub fn provider(server: &MockServer) -> Arc<dyn ChatTransport> {
    Arc::new(OpenAICompatibleProvider::new(settings(
        server,
        Duration::from_secs(5),
    )))
}

/// Renders deltas as an upstream streaming body.
pub fn sse_body(deltas: &[&str]) -> String {
    deltas
        .iter()
        .map(|d| format!("data: {}\n\n", serde_json::json!({ "content": d })))
        .collect()
}

/// Store that records every write and can be told to fail them.
#[derive(Default)]
pub struct RecordingStore {
    inner: MemoryChatStore,
    pub creates: AtomicUsize,
    pub updates: AtomicUsize,
    pub fail_writes: AtomicBool,
    pub written: Mutex<Vec<Vec<Message>>>,
}

impl RecordingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn writes(&self) -> usize {
        self.creates.load(Ordering::SeqCst) + self.updates.load(Ordering::SeqCst)
    }

    fn record(&self, messages: &[Message]) -> Result<(), ChatError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ChatError::Persistence("disk full".to_string()));
        }
        self.written.lock().unwrap().push(messages.to_vec());
        Ok(())
    }
}

#[async_trait]
impl ChatStore for RecordingStore {
    async fn create(&self, user_id: &str, messages: &[Message]) -> Result<String, ChatError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.record(messages)?;
        self.inner.create(user_id, messages).await
    }

    async fn update(
        &self,
        id: &str,
        messages: &[Message],
        title: Option<&str>,
    ) -> Result<(), ChatError> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.record(messages)?;
        self.inner.update(id, messages, title).await
    }

    async fn list(&self, user_id: &str) -> Result<Vec<ChatHistory>, ChatError> {
        self.inner.list(user_id).await
    }

    async fn get(&self, id: &str) -> Result<Option<ChatHistory>, ChatError> {
        self.inner.get(id).await
    }

    async fn delete(&self, id: &str) -> Result<(), ChatError> {
        self.inner.delete(id).await
    }
}
