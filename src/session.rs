//! Turn driver: one conversation, one in-flight turn at a time.
//!
//! A turn runs transport → decoder → reducer under a single
//! [`CancellationToken`], then hands the finalized list to the store. Cancelled
//! and failed turns never reach the store.

use crate::api::ChatTransport;
use crate::decoder::decode_stream;
use crate::error::ChatError;
use crate::models::{Message, Role, WireMessage, NEW_CONVERSATION_ID};
use crate::reducer::{tail_is_placeholder, CancelPolicy, ConversationReducer, Snapshot, TurnState};
use crate::storage::ChatStore;
use futures::StreamExt;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// How replies are fetched from the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplyMode {
    #[default]
    Streaming,
    Complete,
}

#[derive(Debug)]
pub enum TurnStatus {
    Completed { reply: String },
    Cancelled,
    Failed(ChatError),
}

#[derive(Debug)]
pub struct TurnOutcome {
    pub status: TurnStatus,
    /// Conversation id after the turn; still `"new"` unless a turn was persisted.
    pub conversation_id: String,
    /// Set when the reply completed but could not be stored. The in-memory
    /// conversation keeps the reply regardless.
    pub persist_error: Option<ChatError>,
}

/// Cancels the running turn of a [`ChatSession`] from elsewhere (another task,
/// a signal handler). Cloneable; cancelling twice is a no-op.
#[derive(Clone, Default, Debug)]
pub struct TurnCanceller {
    current: Arc<Mutex<Option<CancellationToken>>>,
}

impl TurnCanceller {
    /// Returns `true` if this call cancelled a running turn.
    pub fn cancel(&self) -> bool {
        let Ok(current) = self.current.lock() else {
            return false;
        };
        match current.as_ref() {
            Some(token) if !token.is_cancelled() => {
                log::info!("Cancelling in-flight turn.");
                token.cancel();
                true
            }
            _ => false,
        }
    }

    fn arm(&self) -> CancellationToken {
        let token = CancellationToken::new();
        if let Ok(mut current) = self.current.lock() {
            *current = Some(token.clone());
        }
        token
    }

    fn disarm(&self) {
        if let Ok(mut current) = self.current.lock() {
            *current = None;
        }
    }
}

pub struct ChatSession {
    transport: Arc<dyn ChatTransport>,
    store: Arc<dyn ChatStore>,
    reducer: ConversationReducer,
    conversation_id: String,
    user_id: String,
    system_prompt: Option<String>,
    mode: ReplyMode,
    canceller: TurnCanceller,
}

impl ChatSession {
    /// Starts an unsaved conversation for `user_id`.
    pub fn new(
        user_id: impl Into<String>,
        transport: Arc<dyn ChatTransport>,
        store: Arc<dyn ChatStore>,
        policy: CancelPolicy,
    ) -> Self {
        Self {
            transport,
            store,
            reducer: ConversationReducer::new(policy),
            conversation_id: NEW_CONVERSATION_ID.to_string(),
            user_id: user_id.into(),
            system_prompt: None,
            mode: ReplyMode::default(),
            canceller: TurnCanceller::default(),
        }
    }

    /// Resumes a stored conversation.
    pub async fn open(
        conversation_id: &str,
        transport: Arc<dyn ChatTransport>,
        store: Arc<dyn ChatStore>,
        policy: CancelPolicy,
    ) -> Result<Self, ChatError> {
        let history = store
            .get(conversation_id)
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("conversation {}", conversation_id)))?;
        log::info!(
            "Resuming conversation {} ({} messages)",
            history.id,
            history.messages.len()
        );
        Ok(Self {
            transport,
            store,
            reducer: ConversationReducer::with_messages(history.messages, policy),
            conversation_id: history.id,
            user_id: history.user_id,
            system_prompt: None,
            mode: ReplyMode::default(),
            canceller: TurnCanceller::default(),
        })
    }

    pub fn with_system_prompt(mut self, prompt: Option<String>) -> Self {
        self.system_prompt = prompt;
        self
    }

    pub fn with_mode(mut self, mode: ReplyMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn messages(&self) -> &[Message] {
        self.reducer.messages()
    }

    pub fn state(&self) -> TurnState {
        self.reducer.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.reducer.subscribe()
    }

    pub fn canceller(&self) -> TurnCanceller {
        self.canceller.clone()
    }

    /// Runs one turn to completion, cancellation or failure.
    ///
    /// `Err` is returned only when the turn could not start (`TurnInProgress`,
    /// `InvalidInput`); everything after that is reported in the outcome.
    pub async fn send(&mut self, content: &str) -> Result<TurnOutcome, ChatError> {
        let request = self.reducer.begin_turn(content)?;
        let token = self.canceller.arm();
        log::info!(
            "Turn started in conversation {} ({} messages in request)",
            self.conversation_id,
            request.len()
        );

        let result = self.fetch_reply(request, &token).await;
        self.canceller.disarm();

        let mut persist_error = None;
        let status = match result {
            Ok(()) => match self.reducer.finalize() {
                Some(messages) => {
                    let reply = messages
                        .last()
                        .map(|m| m.content.clone())
                        .unwrap_or_default();
                    if let Err(e) = self.persist(&messages).await {
                        log::error!(
                            "Failed to save conversation {}: {}",
                            self.conversation_id,
                            e
                        );
                        persist_error = Some(e);
                    }
                    self.reducer.settle();
                    TurnStatus::Completed { reply }
                }
                None => TurnStatus::Cancelled,
            },
            Err(ChatError::Cancelled) => {
                self.reducer.cancel();
                log::warn!("Turn cancelled in conversation {}", self.conversation_id);
                TurnStatus::Cancelled
            }
            Err(e @ ChatError::Timeout(_)) => {
                log::warn!("Turn timed out in conversation {}: {}", self.conversation_id, e);
                self.reducer.expire(&e);
                TurnStatus::Failed(e)
            }
            Err(e) => {
                log::error!("Turn failed in conversation {}: {}", self.conversation_id, e);
                self.reducer.fail(&e);
                TurnStatus::Failed(e)
            }
        };

        Ok(TurnOutcome {
            status,
            conversation_id: self.conversation_id.clone(),
            persist_error,
        })
    }

    /// Renames the stored conversation.
    pub async fn rename(&mut self, title: &str) -> Result<(), ChatError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(ChatError::InvalidInput("title cannot be empty".to_string()));
        }
        if self.conversation_id == NEW_CONVERSATION_ID {
            return Err(ChatError::NotFound("conversation has not been saved yet".to_string()));
        }
        self.store
            .update(&self.conversation_id, self.reducer.messages(), Some(title))
            .await
    }

    /// Deletes the stored conversation (if any) and starts over unsaved.
    pub async fn delete(&mut self) -> Result<(), ChatError> {
        if self.reducer.state() != TurnState::Idle {
            return Err(ChatError::TurnInProgress);
        }
        if self.conversation_id != NEW_CONVERSATION_ID {
            self.store.delete(&self.conversation_id).await?;
        }
        self.reducer.load(Vec::new())?;
        self.conversation_id = NEW_CONVERSATION_ID.to_string();
        Ok(())
    }

    async fn fetch_reply(
        &mut self,
        request: Vec<WireMessage>,
        token: &CancellationToken,
    ) -> Result<(), ChatError> {
        let mut wire = Vec::with_capacity(request.len() + 1);
        if let Some(prompt) = &self.system_prompt {
            wire.push(WireMessage {
                role: Role::System,
                content: prompt.clone(),
            });
        }
        wire.extend(request);

        if self.mode == ReplyMode::Complete {
            let reply = self.transport.complete(&wire, token).await?;
            self.reducer.apply_delta(&reply);
            return Ok(());
        }

        let body = self.transport.open_stream(&wire, token).await?;
        let mut deltas = decode_stream(body);
        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(ChatError::Cancelled),
                next = deltas.next() => next,
            };
            match next {
                Some(Ok(delta)) => {
                    log::debug!("Received delta ({} bytes).", delta.len());
                    self.reducer.apply_delta(&delta);
                    debug_assert!(tail_is_placeholder(self.reducer.messages()));
                }
                Some(Err(e)) => return Err(e),
                None => return Ok(()),
            }
        }
    }

    async fn persist(&mut self, messages: &[Message]) -> Result<(), ChatError> {
        if self.conversation_id == NEW_CONVERSATION_ID {
            let id = self.store.create(&self.user_id, messages).await?;
            log::info!("Conversation saved as {}", id);
            self.conversation_id = id;
            Ok(())
        } else {
            self.store.update(&self.conversation_id, messages, None).await
        }
    }
}
