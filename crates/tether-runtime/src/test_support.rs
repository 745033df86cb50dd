//! Hand-written fakes for the provider boundary.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;
use serde_json::json;
use tether_core::{
    ConnectRequest, Connection, ConnectionError, ConnectionFactory, ConnectionState, ProviderEvent,
    ProviderEventStream,
};

/// What a fake turn produces.
#[derive(Clone, Debug)]
pub(crate) enum TurnScript {
    /// `echo: <prompt>`, with a tool round trip in between.
    Echo,
    /// Partial text, then a provider `Error` event.
    ProviderError(String),
    /// Partial text, then a transport failure on the stream.
    TransportFailure,
}

#[derive(Clone, Debug, Default)]
struct CloseBehavior {
    delay: Option<Duration>,
    fail: bool,
}

pub(crate) struct FakeConnection {
    key: String,
    state: Mutex<ConnectionState>,
    disconnects: AtomicUsize,
    prompts: Mutex<Vec<String>>,
    script: Mutex<TurnScript>,
    close: CloseBehavior,
}

impl FakeConnection {
    fn with_close(key: &str, close: CloseBehavior) -> Self {
        Self {
            key: key.to_string(),
            state: Mutex::new(ConnectionState::Connected),
            disconnects: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
            script: Mutex::new(TurnScript::Echo),
            close,
        }
    }

    pub(crate) fn arc(key: &str) -> Arc<Self> {
        Arc::new(Self::with_close(key, CloseBehavior::default()))
    }

    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    pub(crate) fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub(crate) fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    pub(crate) fn set_script(&self, script: TurnScript) {
        *self.script.lock() = script;
    }
}

#[async_trait]
impl Connection for FakeConnection {
    fn session_key(&self) -> Option<String> {
        Some(self.key.clone())
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    async fn connect(&self) -> Result<(), ConnectionError> {
        self.set_state(ConnectionState::Connected);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ConnectionError> {
        let _ = self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.set_state(ConnectionState::Disconnected);
        if let Some(delay) = self.close.delay {
            tokio::time::sleep(delay).await;
        }
        if self.close.fail {
            return Err(ConnectionError::Transport {
                message: "close failed".into(),
            });
        }
        Ok(())
    }

    async fn send(&self, prompt: &str) -> Result<(), ConnectionError> {
        if !self.state().is_connected() {
            return Err(ConnectionError::Closed);
        }
        self.prompts.lock().push(prompt.to_string());
        Ok(())
    }

    async fn receive(&self) -> Result<ProviderEventStream, ConnectionError> {
        let prompt = self.prompts.lock().last().cloned().unwrap_or_default();
        let events: Vec<Result<ProviderEvent, ConnectionError>> = match self.script.lock().clone() {
            TurnScript::Echo => vec![
                Ok(ProviderEvent::Init {
                    session_key: self.key.clone(),
                }),
                Ok(ProviderEvent::ContentDelta {
                    text: "echo: ".into(),
                }),
                Ok(ProviderEvent::ToolUse {
                    name: "Read".into(),
                    args: json!({"path": "README.md"}),
                }),
                Ok(ProviderEvent::ToolResult {
                    payload: json!({"content": "ok"}),
                }),
                Ok(ProviderEvent::ContentDelta { text: prompt }),
            ],
            TurnScript::ProviderError(message) => vec![
                Ok(ProviderEvent::ContentDelta {
                    text: "partial".into(),
                }),
                Ok(ProviderEvent::Error { message }),
            ],
            TurnScript::TransportFailure => vec![
                Ok(ProviderEvent::ContentDelta {
                    text: "partial".into(),
                }),
                Err(ConnectionError::Transport {
                    message: "pipe closed".into(),
                }),
            ],
        };
        Ok(Box::pin(stream::iter(events)))
    }
}

/// Counting connection factory.
#[derive(Default)]
pub(crate) struct FakeFactory {
    calls: AtomicUsize,
    next_id: AtomicUsize,
    requests: Mutex<Vec<ConnectRequest>>,
    connections: Mutex<Vec<Arc<FakeConnection>>>,
    transient_failures: AtomicUsize,
    fatal: AtomicBool,
    rekey: bool,
    create_delay: Option<Duration>,
    close: CloseBehavior,
}

impl FakeFactory {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = Some(delay);
        self
    }

    pub(crate) fn failing_transiently(self, times: usize) -> Self {
        self.transient_failures.store(times, Ordering::SeqCst);
        self
    }

    pub(crate) fn failing_fatally(self) -> Self {
        self.fatal.store(true, Ordering::SeqCst);
        self
    }

    /// Ignore resume tokens and mint a fresh key on every create.
    pub(crate) fn rekeying(mut self) -> Self {
        self.rekey = true;
        self
    }

    pub(crate) fn with_slow_close(mut self, delay: Duration) -> Self {
        self.close.delay = Some(delay);
        self
    }

    pub(crate) fn with_failing_close(mut self) -> Self {
        self.close.fail = true;
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn requests(&self) -> Vec<ConnectRequest> {
        self.requests.lock().clone()
    }

    pub(crate) fn connections(&self) -> Vec<Arc<FakeConnection>> {
        self.connections.lock().clone()
    }

    pub(crate) fn connection(&self, key: &str) -> Option<Arc<FakeConnection>> {
        self.connections
            .lock()
            .iter()
            .rev()
            .find(|c| c.key() == key)
            .cloned()
    }
}

#[async_trait]
impl ConnectionFactory for FakeFactory {
    async fn create(&self, request: &ConnectRequest) -> Result<Arc<dyn Connection>, ConnectionError> {
        let _ = self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());
        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fatal.load(Ordering::SeqCst) {
            return Err(ConnectionError::SessionNotFound {
                session_key: request.resume_key.clone().unwrap_or_default(),
            });
        }
        if self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ConnectionError::Connect {
                message: "connection refused".into(),
            });
        }

        let resume_key = request.resume_key.clone().filter(|_| !self.rekey);
        let key = resume_key.unwrap_or_else(|| {
            format!("sess-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
        });
        let conn = Arc::new(FakeConnection::with_close(&key, self.close.clone()));
        self.connections.lock().push(Arc::clone(&conn));
        Ok(conn)
    }
}
