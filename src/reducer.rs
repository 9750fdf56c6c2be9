//! Conversation state machine for one chat.
//!
//! ```text
//! Idle ──begin_turn──▶ AwaitingFirstByte ──delta──▶ Streaming ──finalize──▶ Finalized ──settle──▶ Idle
//!                            │                          │
//!                            └────── cancel / fail ─────┴──────────────────────────────────────▶ Idle
//! ```
//!
//! While a turn is in flight the last message is the assistant placeholder.
//! Deltas replace that last element with a copy carrying the longer content;
//! no other element is touched. Every change publishes a fresh snapshot on a
//! [`watch`] channel for whatever renders the conversation.

use crate::error::ChatError;
use crate::models::{Message, Role, WireMessage};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::watch;

/// Content of the assistant message when a stream completes without any delta.
pub const EMPTY_REPLY_TEXT: &str = "Sorry, I could not generate a reply.";

/// Immutable view of the message list after one mutation.
pub type Snapshot = Arc<[Message]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    AwaitingFirstByte,
    Streaming,
    Finalized,
}

impl TurnState {
    pub fn is_in_flight(&self) -> bool {
        matches!(self, TurnState::AwaitingFirstByte | TurnState::Streaming)
    }
}

/// What a cancelled turn leaves behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CancelPolicy {
    /// Restore the list exactly as it was before the turn started.
    #[default]
    Discard,
    /// Keep the user message and whatever partial reply arrived.
    KeepPartial,
}

impl FromStr for CancelPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "discard" => Ok(CancelPolicy::Discard),
            "keep-partial" | "keep_partial" => Ok(CancelPolicy::KeepPartial),
            other => Err(format!("unknown cancel policy '{}'", other)),
        }
    }
}

/// Fallback text shown in place of a reply that failed.
pub fn fallback_text(error: &ChatError) -> String {
    format!("Sorry, something went wrong: {}", error)
}

pub struct ConversationReducer {
    messages: Vec<Message>,
    state: TurnState,
    policy: CancelPolicy,
    // Length of `messages` before the in-flight turn appended anything
    turn_start: usize,
    snapshots: watch::Sender<Snapshot>,
}

impl ConversationReducer {
    pub fn new(policy: CancelPolicy) -> Self {
        Self::with_messages(Vec::new(), policy)
    }

    pub fn with_messages(messages: Vec<Message>, policy: CancelPolicy) -> Self {
        let (snapshots, _) = watch::channel(Snapshot::from(messages.as_slice()));
        Self {
            turn_start: messages.len(),
            messages,
            state: TurnState::Idle,
            policy,
            snapshots,
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Receives a snapshot after every mutation, starting with the current list.
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshots.subscribe()
    }

    /// Replaces the whole list, e.g. after loading a stored conversation.
    pub fn load(&mut self, messages: Vec<Message>) -> Result<(), ChatError> {
        if self.state != TurnState::Idle {
            return Err(ChatError::TurnInProgress);
        }
        self.messages = messages;
        self.turn_start = self.messages.len();
        self.publish();
        Ok(())
    }

    /// Appends the user message and an empty assistant placeholder, and
    /// returns the role+content history to send upstream.
    pub fn begin_turn(&mut self, content: &str) -> Result<Vec<WireMessage>, ChatError> {
        if self.state != TurnState::Idle {
            return Err(ChatError::TurnInProgress);
        }
        if content.trim().is_empty() {
            return Err(ChatError::InvalidInput("message content is empty".to_string()));
        }

        self.turn_start = self.messages.len();
        self.messages.push(Message::user(content));
        let request = self.messages.iter().map(WireMessage::from).collect();
        self.messages.push(Message::assistant(String::new()));
        self.state = TurnState::AwaitingFirstByte;
        self.publish();
        Ok(request)
    }

    /// Appends `delta` to the placeholder. Returns `false` when no turn is in flight.
    pub fn apply_delta(&mut self, delta: &str) -> bool {
        if !self.state.is_in_flight() {
            log::debug!("Ignoring delta outside of a streaming turn ({:?}).", self.state);
            return false;
        }
        let Some(last) = self.messages.last_mut() else {
            return false;
        };
        *last = last.with_appended(delta);
        self.state = TurnState::Streaming;
        self.publish();
        true
    }

    /// Freezes the placeholder and returns the list to persist.
    /// `None` if no turn was in flight.
    pub fn finalize(&mut self) -> Option<Vec<Message>> {
        if !self.state.is_in_flight() {
            return None;
        }
        if let Some(last) = self.messages.last_mut() {
            if last.content.is_empty() {
                *last = Message {
                    content: EMPTY_REPLY_TEXT.to_string(),
                    ..last.clone()
                };
            }
        }
        self.state = TurnState::Finalized;
        self.publish();
        Some(self.messages.clone())
    }

    /// Completes a finalized turn once persistence has been attempted.
    pub fn settle(&mut self) {
        if self.state == TurnState::Finalized {
            self.state = TurnState::Idle;
            self.turn_start = self.messages.len();
        }
    }

    /// Abandons the in-flight turn according to the cancel policy.
    /// Returns `false` (and changes nothing) if no turn was in flight.
    pub fn cancel(&mut self) -> bool {
        if !self.state.is_in_flight() {
            return false;
        }
        match self.policy {
            CancelPolicy::Discard => self.messages.truncate(self.turn_start),
            CancelPolicy::KeepPartial => {
                if self.messages.last().is_some_and(|m| m.content.is_empty()) {
                    self.messages.pop();
                }
            }
        }
        self.state = TurnState::Idle;
        self.turn_start = self.messages.len();
        self.publish();
        true
    }

    /// Replaces the placeholder with a fallback message describing `error`
    /// and returns to `Idle`. Returns `false` if no turn was in flight.
    pub fn fail(&mut self, error: &ChatError) -> bool {
        if !self.state.is_in_flight() {
            return false;
        }
        if let Some(last) = self.messages.last_mut() {
            *last = Message {
                content: fallback_text(error),
                ..last.clone()
            };
        }
        self.state = TurnState::Idle;
        self.turn_start = self.messages.len();
        self.publish();
        true
    }

    /// Ends a turn whose deadline passed. Same as [`fail`](Self::fail), except
    /// that under `KeepPartial` a non-empty partial reply stays and the
    /// fallback notice follows it as a message of its own.
    pub fn expire(&mut self, error: &ChatError) -> bool {
        if !self.state.is_in_flight() {
            return false;
        }
        let keep_partial = self.policy == CancelPolicy::KeepPartial
            && self.messages.last().is_some_and(|m| !m.content.is_empty());
        if !keep_partial {
            return self.fail(error);
        }
        self.messages.push(Message::assistant(fallback_text(error)));
        self.state = TurnState::Idle;
        self.turn_start = self.messages.len();
        self.publish();
        true
    }

    fn publish(&self) {
        // send_replace keeps the value even with no receivers.
        self.snapshots.send_replace(Snapshot::from(self.messages.as_slice()));
    }
}

impl Default for ConversationReducer {
    fn default() -> Self {
        Self::new(CancelPolicy::default())
    }
}

/// Debug invariant: before finalization there is exactly one assistant
/// placeholder, at the tail.
pub fn tail_is_placeholder(messages: &[Message]) -> bool {
    messages.last().is_some_and(|m| m.role == Role::Assistant)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn contents(messages: &[Message]) -> Vec<&str> {
        messages.iter().map(|m| m.content.as_str()).collect()
    }

    #[test]
    fn begin_turn_appends_user_and_placeholder() {
        let mut reducer = ConversationReducer::default();
        let request = reducer.begin_turn("Hello").unwrap();
        assert_eq!(request, vec![WireMessage { role: Role::User, content: "Hello".into() }]);
        assert_eq!(reducer.state(), TurnState::AwaitingFirstByte);
        assert_eq!(contents(reducer.messages()), vec!["Hello", ""]);
        assert!(tail_is_placeholder(reducer.messages()));
    }

    #[test]
    fn deltas_concatenate_into_same_message() {
        let mut reducer = ConversationReducer::default();
        reducer.begin_turn("Hello").unwrap();
        let placeholder_id = reducer.messages()[1].id.clone();
        let user_before = reducer.messages()[0].clone();

        for delta in ["Hi", " there", "!"] {
            assert!(reducer.apply_delta(delta));
            assert_eq!(reducer.messages().len(), 2);
            assert!(tail_is_placeholder(reducer.messages()));
        }

        assert_eq!(reducer.state(), TurnState::Streaming);
        assert_eq!(reducer.messages()[1].id, placeholder_id);
        assert_eq!(reducer.messages()[1].content, "Hi there!");
        assert_eq!(reducer.messages()[0], user_before);
    }

    #[test]
    fn second_turn_is_rejected_while_in_flight() {
        let mut reducer = ConversationReducer::default();
        reducer.begin_turn("one").unwrap();
        assert!(matches!(reducer.begin_turn("two"), Err(ChatError::TurnInProgress)));
        reducer.apply_delta("x");
        assert!(matches!(reducer.begin_turn("two"), Err(ChatError::TurnInProgress)));
        reducer.finalize();
        assert!(matches!(reducer.begin_turn("two"), Err(ChatError::TurnInProgress)));
        reducer.settle();
        assert!(reducer.begin_turn("two").is_ok());
    }

    #[test]
    fn empty_input_is_rejected() {
        let mut reducer = ConversationReducer::default();
        assert!(matches!(reducer.begin_turn("  "), Err(ChatError::InvalidInput(_))));
        assert_eq!(reducer.state(), TurnState::Idle);
        assert!(reducer.messages().is_empty());
    }

    #[test]
    fn finalize_freezes_and_settle_returns_to_idle() {
        let mut reducer = ConversationReducer::default();
        reducer.begin_turn("Hello").unwrap();
        reducer.apply_delta("Hi");
        let persisted = reducer.finalize().unwrap();
        assert_eq!(contents(&persisted), vec!["Hello", "Hi"]);
        assert_eq!(reducer.state(), TurnState::Finalized);
        assert!(!reducer.apply_delta("late"));
        reducer.settle();
        assert_eq!(reducer.state(), TurnState::Idle);
        assert_eq!(contents(reducer.messages()), vec!["Hello", "Hi"]);
    }

    #[test]
    fn empty_reply_gets_placeholder_text() {
        let mut reducer = ConversationReducer::default();
        reducer.begin_turn("Hello").unwrap();
        let persisted = reducer.finalize().unwrap();
        assert_eq!(persisted[1].content, EMPTY_REPLY_TEXT);
    }

    #[test]
    fn discard_cancel_restores_pre_turn_list() {
        let history = vec![Message::user("earlier"), Message::assistant("reply")];
        let mut reducer = ConversationReducer::with_messages(history.clone(), CancelPolicy::Discard);
        reducer.begin_turn("Hello").unwrap();
        reducer.apply_delta("partial");
        assert!(reducer.cancel());
        assert_eq!(reducer.state(), TurnState::Idle);
        assert_eq!(reducer.messages(), history.as_slice());
        assert!(!reducer.cancel(), "second cancel is a no-op");
        assert_eq!(reducer.messages(), history.as_slice());
    }

    #[test]
    fn keep_partial_cancel_keeps_non_empty_reply() {
        let mut reducer = ConversationReducer::new(CancelPolicy::KeepPartial);
        reducer.begin_turn("Hello").unwrap();
        reducer.apply_delta("Hi");
        reducer.cancel();
        assert_eq!(contents(reducer.messages()), vec!["Hello", "Hi"]);

        reducer.begin_turn("Again").unwrap();
        reducer.cancel();
        assert_eq!(contents(reducer.messages()), vec!["Hello", "Hi", "Again"]);
    }

    #[test]
    fn keep_partial_timeout_keeps_reply_and_adds_notice() {
        let err = ChatError::Timeout(std::time::Duration::from_millis(100));
        let mut reducer = ConversationReducer::new(CancelPolicy::KeepPartial);
        reducer.begin_turn("Hello").unwrap();
        reducer.apply_delta("Hi");
        assert!(reducer.expire(&err));
        assert_eq!(reducer.state(), TurnState::Idle);
        let fallback = fallback_text(&err);
        assert_eq!(contents(reducer.messages()), vec!["Hello", "Hi", fallback.as_str()]);
        assert_eq!(reducer.messages()[2].role, Role::Assistant);
        assert!(!reducer.expire(&err));
    }

    #[test]
    fn timeout_without_partial_reply_shows_fallback() {
        let err = ChatError::Timeout(std::time::Duration::from_millis(100));
        let fallback = fallback_text(&err);
        for policy in [CancelPolicy::Discard, CancelPolicy::KeepPartial] {
            let mut reducer = ConversationReducer::new(policy);
            reducer.begin_turn("Hello").unwrap();
            assert!(reducer.expire(&err));
            assert_eq!(contents(reducer.messages()), vec!["Hello", fallback.as_str()]);
        }

        let mut reducer = ConversationReducer::new(CancelPolicy::Discard);
        reducer.begin_turn("Hello").unwrap();
        reducer.apply_delta("Hi");
        reducer.expire(&err);
        assert_eq!(contents(reducer.messages()), vec!["Hello", fallback.as_str()]);
    }

    #[test]
    fn cancel_after_finalize_is_noop() {
        let mut reducer = ConversationReducer::default();
        reducer.begin_turn("Hello").unwrap();
        reducer.apply_delta("Hi");
        reducer.finalize();
        assert!(!reducer.cancel());
        assert_eq!(reducer.state(), TurnState::Finalized);
        assert_eq!(contents(reducer.messages()), vec!["Hello", "Hi"]);
    }

    #[test]
    fn fail_shows_fallback_message() {
        let mut reducer = ConversationReducer::default();
        reducer.begin_turn("Hello").unwrap();
        let err = ChatError::Upstream { status: 500, body: "rate limited".into() };
        assert!(reducer.fail(&err));
        assert_eq!(reducer.state(), TurnState::Idle);
        let last = reducer.messages().last().unwrap();
        assert_eq!(last.role, Role::Assistant);
        assert!(last.content.contains("rate limited"));
        assert!(!reducer.fail(&err));
    }

    #[test]
    fn snapshots_track_every_mutation() {
        let mut reducer = ConversationReducer::default();
        let mut rx = reducer.subscribe();
        assert!(rx.borrow_and_update().is_empty());

        reducer.begin_turn("Hello").unwrap();
        assert!(rx.has_changed().unwrap());
        let first = rx.borrow_and_update().clone();
        reducer.apply_delta("Hi");
        let second = rx.borrow_and_update().clone();

        assert_eq!(first[1].content, "");
        assert_eq!(second[1].content, "Hi");
    }

    #[test]
    fn load_is_rejected_mid_turn() {
        let mut reducer = ConversationReducer::default();
        reducer.begin_turn("Hello").unwrap();
        assert!(matches!(reducer.load(Vec::new()), Err(ChatError::TurnInProgress)));
    }

    #[test]
    fn cancel_policy_parses() {
        assert_eq!("discard".parse::<CancelPolicy>().unwrap(), CancelPolicy::Discard);
        assert_eq!("Keep-Partial".parse::<CancelPolicy>().unwrap(), CancelPolicy::KeepPartial);
        assert!("maybe".parse::<CancelPolicy>().is_err());
    }
}
