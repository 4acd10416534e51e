use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use tokio::sync::broadcast;

use super::protocol::StateChange;
use super::session::Session;
use super::transport::Transport;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::workflow::Workflow;

/// Builds the workflow for a new session.
pub type WorkflowFactory = Arc<dyn Fn(&EngineConfig) -> Result<Workflow> + Send + Sync>;

const BROADCAST_CAPACITY: usize = 256;

/// Opens sessions for one program and relays state changes between them.
pub struct SyncHub {
    config: Arc<EngineConfig>,
    factory: WorkflowFactory,
    changes: broadcast::Sender<StateChange>,
    next_id: AtomicU64,
}

impl SyncHub {
    pub fn new<F>(config: EngineConfig, factory: F) -> Self
    where
        F: Fn(&EngineConfig) -> Result<Workflow> + Send + Sync + 'static,
    {
        let (changes, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            config: Arc::new(config),
            factory: Arc::new(factory),
            changes,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Creates a session with its own freshly built workflow.
    pub fn open_session<T>(&self, transport: T) -> Result<Session>
    where
        T: Transport + 'static,
    {
        let workflow = (self.factory)(&self.config)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        tracing::info!("Opening session {} ({} atoms)", id, workflow.len());
        Ok(Session::new(
            id,
            workflow,
            Box::new(transport),
            self.changes.clone(),
            Arc::clone(&self.config),
        ))
    }

    /// Relays changes to every open session. Returns how many received them.
    pub fn broadcast(&self, origin: u64, changes: BTreeMap<String, Value>) -> usize {
        self.changes
            .send(StateChange { origin, changes })
            .unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.changes.subscribe()
    }

    /// Sessions currently alive.
    pub fn session_count(&self) -> usize {
        self.changes.receiver_count()
    }
}
