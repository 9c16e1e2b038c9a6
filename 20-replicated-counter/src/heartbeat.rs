//! Heartbeat-based failure detector.
//!
//! Every `heartbeat_period` the detector probes each known peer. A probe makes
//! up to `heartbeat_attempts` Heartbeat calls with exponential backoff between
//! them. A probe that never succeeds marks the peer dead and evicts its pooled
//! channel. A dead peer that answers again is healed: it moves back to the
//! live set and every registered [`RecoveryAction`] runs against it, in
//! registration order, before the probe returns.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use futures::future::join_all;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::node::Node;
use crate::recovery::{Reconnect, RecoveryAction, Resend};

/// The detector's belief about one peer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PeerHealth {
    /// Consecutive rounds in which every heartbeat attempt failed.
    pub failures: u32,
    pub dead: bool,
}

/// What one probe concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// No channel could be obtained; nothing changed.
    Skipped,
    Alive,
    /// The peer answered after being marked dead.
    Healed,
    /// The peer stayed unresponsive and was already dead.
    StillDead,
    /// The peer stopped answering and has just been marked dead.
    Died,
}

pub struct FailureDetector {
    node: Arc<Node>,
    peers: Mutex<HashMap<String, PeerHealth>>,
    actions: RwLock<Vec<Arc<dyn RecoveryAction>>>,
}

impl FailureDetector {
    pub fn new(node: Arc<Node>) -> Self {
        Self {
            node,
            peers: Mutex::new(HashMap::new()),
            actions: RwLock::new(Vec::new()),
        }
    }

    /// Detector with [`Reconnect`] then [`Resend`] registered.
    pub fn with_default_actions(node: Arc<Node>) -> Self {
        let detector = Self::new(node);
        detector.register_action(Arc::new(Reconnect));
        detector.register_action(Arc::new(Resend));
        detector
    }

    /// Appends an action; actions run in the order they were registered.
    pub fn register_action(&self, action: Arc<dyn RecoveryAction>) {
        self.actions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(action);
    }

    pub fn action_names(&self) -> Vec<&'static str> {
        self.actions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|action| action.name())
            .collect()
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn health(&self, peer: &str) -> Option<PeerHealth> {
        self.tracked().get(peer).copied()
    }

    /// Runs rounds every `heartbeat_period` until `shutdown` resolves.
    pub async fn run_until<F>(&self, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);
        let period = self.node.timing().heartbeat_period;
        info!(node = %self.node.id(), ?period, "heartbeat monitor started");

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = sleep(period) => {}
            }
            tokio::select! {
                _ = &mut shutdown => break,
                _ = self.run_round() => {}
            }
        }

        info!(node = %self.node.id(), "heartbeat monitor stopped");
    }

    /// Probes every known peer once, concurrently.
    pub async fn run_round(&self) -> Vec<(String, ProbeOutcome)> {
        let targets = self.probe_targets();
        let probes = targets.iter().map(|peer| async move {
            let outcome = self.probe(peer).await;
            (peer.clone(), outcome)
        });
        join_all(probes).await
    }

    /// Live peers, dead peers, and anything the detector still tracks; never self.
    fn probe_targets(&self) -> Vec<String> {
        let mut targets: BTreeSet<String> = self.node.alive_peers().into_iter().collect();
        targets.extend(self.node.dead_peers());
        targets.extend(self.tracked().keys().cloned());
        targets.remove(self.node.id());

        let mut tracked = self.tracked();
        for peer in &targets {
            tracked.entry(peer.clone()).or_default();
        }
        targets.into_iter().collect()
    }

    /// Probes one peer and applies the resulting state transition.
    pub async fn probe(&self, peer: &str) -> ProbeOutcome {
        let client = match self.node.get_or_create_client(peer).await {
            Ok(client) => client,
            Err(err) => {
                warn!(peer = %peer, error = %err, "skipping heartbeat, no channel");
                return ProbeOutcome::Skipped;
            }
        };

        let timing = *self.node.timing();
        let mut success = false;
        for attempt in 0..timing.heartbeat_attempts {
            match client.heartbeat(self.node.id()).await {
                Ok(true) => {
                    success = true;
                    break;
                }
                Ok(false) => {
                    warn!(peer = %peer, attempt = attempt + 1, "heartbeat answered not alive");
                }
                Err(err) => {
                    warn!(peer = %peer, attempt = attempt + 1, error = %err, "heartbeat failed");
                }
            }
            sleep(timing.heartbeat_backoff_after(attempt)).await;
        }

        if success {
            self.on_success(peer).await
        } else {
            self.on_failure(peer).await
        }
    }

    async fn on_success(&self, peer: &str) -> ProbeOutcome {
        let was_dead = {
            let mut tracked = self.tracked();
            let health = tracked.entry(peer.to_string()).or_default();
            health.failures = 0;
            std::mem::replace(&mut health.dead, false)
        };
        debug!(peer = %peer, "heartbeat succeeded");

        if !was_dead {
            return ProbeOutcome::Alive;
        }

        info!(node = %self.node.id(), peer = %peer, "peer healed");
        self.node.mark_alive(peer);

        let actions: Vec<Arc<dyn RecoveryAction>> = self
            .actions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for action in actions {
            debug!(peer = %peer, action = action.name(), "running recovery action");
            action.execute(&self.node, peer).await;
        }
        ProbeOutcome::Healed
    }

    async fn on_failure(&self, peer: &str) -> ProbeOutcome {
        let attempts = self.node.timing().heartbeat_attempts;
        let newly_dead = {
            let mut tracked = self.tracked();
            let health = tracked.entry(peer.to_string()).or_default();
            health.failures += 1;
            !std::mem::replace(&mut health.dead, true)
        };
        warn!(peer = %peer, attempts, "peer failed heartbeat");

        if !newly_dead {
            return ProbeOutcome::StillDead;
        }

        info!(node = %self.node.id(), peer = %peer, "marking peer dead");
        self.node.mark_dead(peer);
        self.node.evict_client(peer).await;
        ProbeOutcome::Died
    }

    fn tracked(&self) -> MutexGuard<'_, HashMap<String, PeerHealth>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
