use crate::api::{ChatTransport, OpenAICompatibleProvider};
use crate::config::Config;
use crate::error::ChatError;
use crate::retry::{RetryPolicy, RetryingTransport};
use crate::storage::ChatStore;
use dashmap::DashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// Shared state handed to every HTTP handler
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn ChatStore>,
    // Err holds the reason the API key could not be resolved at startup
    transport: Result<Arc<dyn ChatTransport>, String>,
    /// Streams currently being relayed, so they can be stopped by id.
    pub active_streams: Arc<DashMap<Uuid, CancellationToken>>,
}

impl AppState {
    /// Builds the upstream transport from `config`. A missing API key is
    /// logged and remembered; the chat endpoint then answers with a 500.
    pub fn new(config: Config, store: Arc<dyn ChatStore>) -> Self {
        let transport = match config.provider_settings() {
            Ok(settings) => Ok(build_transport(&config, settings)),
            Err(e) => {
                log::error!("Chat endpoint disabled: {}", e);
                Err(e.to_string())
            }
        };
        Self {
            config: Arc::new(config),
            store,
            transport,
            active_streams: Arc::new(DashMap::new()),
        }
    }

    /// State with an explicit transport, bypassing key resolution.
    pub fn with_transport(
        config: Config,
        store: Arc<dyn ChatStore>,
        transport: Arc<dyn ChatTransport>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            store,
            transport: Ok(transport),
            active_streams: Arc::new(DashMap::new()),
        }
    }

    pub fn transport(&self) -> Result<Arc<dyn ChatTransport>, ChatError> {
        self.transport
            .clone()
            .map_err(ChatError::AuthConfig)
    }

    /// Registers a new relayed stream and returns its id and token.
    pub fn register_stream(&self) -> (Uuid, CancellationToken) {
        let id = Uuid::new_v4();
        let token = CancellationToken::new();
        self.active_streams.insert(id, token.clone());
        (id, token)
    }

    /// Cancels and forgets a relayed stream. Returns `false` if it was unknown.
    pub fn stop_stream(&self, id: &Uuid) -> bool {
        match self.active_streams.remove(id) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

/// Wraps the provider in the retry decorator when more than one attempt is configured.
pub fn build_transport(
    config: &Config,
    settings: crate::config::ProviderSettings,
) -> Arc<dyn ChatTransport> {
    let provider = OpenAICompatibleProvider::new(settings);
    if config.retry_attempts > 1 {
        let policy = RetryPolicy {
            max_attempts: config.retry_attempts,
            ..RetryPolicy::default()
        };
        Arc::new(RetryingTransport::new(provider, policy))
    } else {
        Arc::new(provider)
    }
}

/// Removes a stream from the registry when the relay ends or the client goes away.
pub(crate) struct StreamRegistration {
    pub(crate) id: Uuid,
    pub(crate) streams: Arc<DashMap<Uuid, CancellationToken>>,
}

impl Drop for StreamRegistration {
    fn drop(&mut self) {
        if self.streams.remove(&self.id).is_some() {
            log::debug!("Stream {} released.", self.id);
        }
    }
}
