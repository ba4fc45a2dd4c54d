//! Public entry point: owns configuration and observers, starts and stops
//! conversation sessions.

use crate::collaborators::Collaborators;
use crate::config::{ConfigPatch, TurnConfig};
use crate::error::{Result, TurnError};
use crate::events::{Event, NullObserver, ObserverRef};
use crate::fsm::SessionSnapshot;
use crate::runner::{self, Command};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;
use tracing::{debug, info};

/// Handle to a running conversation session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: UnboundedSender<Command>,
}

impl SessionHandle {
    /// Start listening again after the session went idle
    pub fn listen(&self) -> Result<()> {
        self.send(Command::Event(Event::Listen))
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot(reply))?;
        rx.await.map_err(|_| TurnError::SessionClosed)
    }

    /// End the session. Safe to call any number of times.
    pub async fn stop(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(Command::Stop(ack)).is_err() {
            debug!("Session already stopped");
            return;
        }
        let _ = done.await;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn send(&self, cmd: Command) -> Result<()> {
        self.tx.send(cmd).map_err(|_| TurnError::SessionClosed)
    }
}

/// Turn-taking engine. At most one session is active at a time.
pub struct TurnEngine {
    collaborators: Collaborators,
    config: TurnConfig,
    observer: ObserverRef,
    active: Option<SessionHandle>,
}

impl TurnEngine {
    pub fn new(collaborators: Collaborators, config: TurnConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            collaborators,
            config,
            observer: Arc::new(NullObserver),
            active: None,
        })
    }

    /// Spawn a new session on the current tokio runtime
    pub fn start_conversation(&mut self) -> Result<SessionHandle> {
        if let Some(handle) = &self.active {
            if !handle.is_closed() {
                return Err(TurnError::SessionActive);
            }
        }
        let (tx, _task) = runner::spawn(
            self.collaborators.clone(),
            self.config.clone(),
            self.observer.clone(),
        );
        let handle = SessionHandle { tx };
        info!("🚀 Conversation started");
        self.active = Some(handle.clone());
        Ok(handle)
    }

    /// Stop the active session, if any
    pub async fn stop_conversation(&mut self) {
        if let Some(handle) = self.active.take() {
            handle.stop().await;
            info!("Conversation stopped");
        }
    }

    /// Replace the observer, including on the running session
    pub fn set_callbacks(&mut self, observer: ObserverRef) {
        self.observer = observer.clone();
        if let Some(handle) = self.live_session() {
            let _ = handle.send(Command::SetObserver(observer));
        }
    }

    /// Merge a partial configuration. Nothing changes when validation fails.
    pub fn update_config(&mut self, patch: ConfigPatch) -> Result<()> {
        if patch.is_empty() {
            return Ok(());
        }
        let next = self.config.merged(&patch)?;
        if let Some(handle) = self.live_session() {
            let _ = handle.send(Command::UpdateConfig(next.clone()));
        }
        self.config = next;
        debug!("Configuration updated: {:?}", patch);
        Ok(())
    }

    pub fn config(&self) -> &TurnConfig {
        &self.config
    }

    pub fn session(&self) -> Option<&SessionHandle> {
        self.live_session()
    }

    fn live_session(&self) -> Option<&SessionHandle> {
        self.active.as_ref().filter(|h| !h.is_closed())
    }
}

impl Drop for TurnEngine {
    /// The session outlives its handles, so the engine ends it
    fn drop(&mut self) {
        if let Some(handle) = self.active.take() {
            let (ack, _) = oneshot::channel();
            if handle.send(Command::Stop(ack)).is_ok() {
                debug!("Engine dropped, stopping its session");
            }
        }
    }
}
