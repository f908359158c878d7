use tokio::sync::mpsc;
use tracing::debug;

use super::Process;
use crate::fetch::PollResult;
use crate::reconcile::StateUpdate;
use crate::state::{CrStates, PeerState};

/// Forwards peer monitor views to the reconciler. A failed poll marks the
/// peer unavailable so it stops voting until it answers again.
pub struct PeerProcessor {
    updates: mpsc::Sender<StateUpdate>,
}

impl PeerProcessor {
    pub fn new(updates: mpsc::Sender<StateUpdate>) -> Self {
        Self { updates }
    }
}

fn peer_state(result: &mut PollResult<CrStates>) -> PeerState {
    match result.error.take() {
        Some(e) => {
            debug!(peer = %result.id, error = %e, "peer poll failed");
            PeerState {
                available: false,
                last_poll: result.time,
                error: Some(e.to_string()),
                states: CrStates::default(),
            }
        }
        None => PeerState {
            available: true,
            last_poll: result.time,
            error: None,
            states: result.payload.take().unwrap_or_default(),
        },
    }
}

impl Process for PeerProcessor {
    type Item = PollResult<CrStates>;

    async fn process(&mut self, batch: Vec<PollResult<CrStates>>) {
        let mut finished = Vec::with_capacity(batch.len());
        let mut states = Vec::with_capacity(batch.len());
        for mut result in batch {
            let state = peer_state(&mut result);
            states.push((result.id, state));
            finished.push(result.finished);
        }

        if self.updates.send(StateUpdate::Peers(states)).await.is_err() {
            debug!("reconciler gone, peer states discarded");
        }

        for done in finished {
            done.fire();
        }
    }
}
