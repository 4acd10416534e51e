use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::protocol::{ClientMessage, ServerMessage, StateChange};
use super::transport::Transport;
use crate::config::EngineConfig;
use crate::error::{Result, TransportError};
use crate::payload::ComponentBatch;
use crate::workflow::{ExecutionOutcome, Workflow};

/// One client's live view of a program.
///
/// A session exclusively owns its workflow, cache and render buffer. The only
/// thing shared with other sessions is the stream of raw state changes.
pub struct Session {
    id: u64,
    workflow: Workflow,
    transport: Box<dyn Transport>,
    changes: broadcast::Sender<StateChange>,
    peer_changes: broadcast::Receiver<StateChange>,
    config: Arc<EngineConfig>,
    last_rerun: Option<Instant>,
}

impl Session {
    pub(crate) fn new(
        id: u64,
        workflow: Workflow,
        transport: Box<dyn Transport>,
        changes: broadcast::Sender<StateChange>,
        config: Arc<EngineConfig>,
    ) -> Self {
        let peer_changes = changes.subscribe();
        Self {
            id,
            workflow,
            transport,
            changes,
            peer_changes,
            config,
            last_rerun: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    pub fn workflow_mut(&mut self) -> &mut Workflow {
        &mut self.workflow
    }

    /// Runs the whole program once and delivers everything it renders.
    pub async fn initial_render(&mut self) -> Result<ExecutionOutcome> {
        let outcome = match self.workflow.execute(None) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.report_error(&e.to_string()).await;
                return Err(e);
            }
        };
        self.last_rerun = Some(Instant::now());
        self.deliver(&outcome).await;
        Ok(outcome)
    }

    /// Applies a batch of client updates.
    ///
    /// Returns the entries that actually changed. Those are merged into the
    /// component state, rerun (unless debounced), and relayed to the other
    /// sessions.
    pub async fn handle_update(
        &mut self,
        updates: BTreeMap<String, Value>,
    ) -> Result<BTreeMap<String, Value>> {
        let changed = self.workflow.component_state().apply(&updates);
        if changed.is_empty() {
            debug!("Session {}: update carried no changes", self.id);
            return Ok(changed);
        }

        let rerun = self.rerun(&changed).await;

        let receivers = self
            .changes
            .send(StateChange {
                origin: self.id,
                changes: changed.clone(),
            })
            .unwrap_or(0);
        debug!(
            "Session {}: relayed {} changes to {} subscribers",
            self.id,
            changed.len(),
            receivers
        );

        rerun?;
        Ok(changed)
    }

    /// Replays changes made in another session against this session's graph.
    pub async fn apply_remote(&mut self, change: StateChange) -> Result<BTreeMap<String, Value>> {
        let changed = self.workflow.component_state().apply(&change.changes);
        if changed.is_empty() {
            return Ok(changed);
        }
        debug!(
            "Session {}: replaying {} changes from session {}",
            self.id,
            changed.len(),
            change.origin
        );
        self.rerun(&changed).await?;
        Ok(changed)
    }

    fn debounced(&self) -> bool {
        let window = Duration::from_millis(self.config.debounce_ms);
        !window.is_zero()
            && self
                .last_rerun
                .is_some_and(|last| last.elapsed() < window)
    }

    /// Recomputes the atoms behind the changed components.
    async fn rerun(&mut self, changed: &BTreeMap<String, Value>) -> Result<Option<ExecutionOutcome>> {
        if self.debounced() {
            info!(
                "Session {}: dropping rerun inside the {} ms debounce window",
                self.id, self.config.debounce_ms
            );
            return Ok(None);
        }

        let mut seed: Vec<String> = Vec::new();
        let mut unmapped = false;
        for id in changed.keys() {
            match self.workflow.producer_of(id) {
                Some(atom) => {
                    if !seed.iter().any(|s| s == atom) {
                        seed.push(atom.to_string());
                    }
                }
                None => unmapped = true,
            }
        }
        if unmapped {
            debug!(
                "Session {}: a changed component has no known producer, recomputing everything",
                self.id
            );
            seed = self.workflow.atom_names().to_vec();
        }

        let seed_refs: Vec<&str> = seed.iter().map(String::as_str).collect();
        let outcome = match self.workflow.execute(Some(&seed_refs)) {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Session {}: rerun failed: {}", self.id, e);
                self.report_error(&e.to_string()).await;
                return Err(e);
            }
        };
        self.last_rerun = Some(Instant::now());
        if let Some(failed) = &outcome.failed {
            let message = self
                .workflow
                .result(failed)
                .and_then(|result| result.error.clone())
                .unwrap_or_default();
            self.report_error(&format!("Atom '{}' failed: {}", failed, message))
                .await;
        }
        self.deliver(&outcome).await;
        Ok(Some(outcome))
    }

    /// Sends the components that changed. Delivery is at most once.
    async fn deliver(&mut self, outcome: &ExecutionOutcome) {
        let components: Vec<_> = outcome.rendered().into_iter().cloned().collect();
        if components.is_empty() {
            debug!("Session {}: nothing to render", self.id);
            return;
        }

        let count = components.len();
        let batch = match ComponentBatch::encode(components, self.config.compression_threshold) {
            Ok(batch) => batch,
            Err(e) => {
                error!("Session {}: failed to encode components: {}", self.id, e);
                return;
            }
        };
        match self.transport.send(ServerMessage::Components { batch }).await {
            Ok(()) => debug!("Session {}: delivered {} components", self.id, count),
            Err(e) => warn!("Session {}: failed to deliver components: {}", self.id, e),
        }
    }

    async fn report_error(&mut self, message: &str) {
        let message = ServerMessage::Error {
            message: message.to_string(),
        };
        if let Err(e) = self.transport.send(message).await {
            warn!("Session {}: failed to report error: {}", self.id, e);
        }
    }

    /// Renders once, then serves client updates and peer changes until the
    /// client goes away.
    pub async fn run(mut self) -> Result<()> {
        info!("Session {} started", self.id);
        if let Err(e) = self.initial_render().await {
            warn!("Session {}: initial render failed: {}", self.id, e);
        }

        loop {
            tokio::select! {
                message = self.transport.receive() => match message {
                    Ok(Some(ClientMessage::StateUpdate { updates })) => {
                        if let Err(e) = self.handle_update(updates).await {
                            warn!("Session {}: update failed: {}", self.id, e);
                        }
                    }
                    Ok(Some(ClientMessage::Close)) | Ok(None) => break,
                    Err(TransportError::Decode(reason)) => {
                        warn!("Session {}: ignoring malformed message: {}", self.id, reason);
                        self.report_error(&reason).await;
                    }
                    Err(e) => {
                        warn!("Session {}: transport failed: {}", self.id, e);
                        break;
                    }
                },
                change = self.peer_changes.recv() => match change {
                    Ok(change) if change.origin == self.id => {}
                    Ok(change) => {
                        if let Err(e) = self.apply_remote(change).await {
                            warn!("Session {}: replaying peer changes failed: {}", self.id, e);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Session {}: missed {} peer change batches", self.id, skipped);
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }

        if let Err(e) = self.transport.close().await {
            debug!("Session {}: close failed: {}", self.id, e);
        }
        info!("Session {} closed", self.id);
        Ok(())
    }
}
