//! Per-track fan-out nodes.
//!
//! A tee owns one inbound payload channel fed by the publishing endpoint and
//! one branch per subscriber. Fan-out never blocks: a full branch drops the
//! payload and bumps a per-branch drop counter, a closed branch is unlinked.

use bytes::Bytes;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn, Instrument};

use roomcast_protocol::{PeerId, TrackId};

/// A unit of media handed from a publisher to subscribers. The engine never
/// looks inside `data`; `rid` carries the simulcast layer identifier when the
/// track is layered.
#[derive(Debug, Clone)]
pub struct MediaPayload {
    pub data: Bytes,
    pub timestamp: u32,
    pub rid: Option<String>,
}

/// Transforms payloads on the raw-format branch of a track. Supplied by the
/// publishing endpoint at track-ready; the engine only wires it into the
/// graph.
pub trait RawDepayloader: Send + Sync {
    fn depayload(&self, payload: MediaPayload) -> MediaPayload;
}

/// Depayloader that forwards payloads unchanged, for tracks whose raw format
/// is the wire format.
#[derive(Debug, Default)]
pub struct NoopDepayloader;

impl RawDepayloader for NoopDepayloader {
    fn depayload(&self, payload: MediaPayload) -> MediaPayload {
        payload
    }
}

pub type MediaPayloadSender = mpsc::Sender<MediaPayload>;
pub type MediaPayloadReceiver = mpsc::Receiver<MediaPayload>;

/// Capacity of a subscriber branch. When full, payloads for that branch are
/// dropped rather than stalling the publisher.
pub const MEDIA_PAYLOAD_CHANNEL_CAPACITY: usize = 256;

/// Capacity of a tee's control channel.
pub const TEE_EVENT_CHANNEL_CAPACITY: usize = 64;

/// How often to log per-branch drop warnings (every N drops).
const DROP_LOG_INTERVAL: u64 = 100;

/// Control messages understood by every tee variant.
#[derive(Debug)]
pub enum TeeEvent {
    /// Link a subscriber branch. `selected_encoding` is honored by simulcast
    /// tees and ignored by the others.
    AddBranch {
        receiver_id: String,
        sender: MediaPayloadSender,
        selected_encoding: Option<String>,
    },
    /// Unlink a subscriber branch.
    RemoveBranch { receiver_id: String },
    /// Switch the forwarded simulcast encoding for one receiver.
    SelectEncoding {
        receiver_id: String,
        encoding: String,
    },
    /// Pause or resume one receiver under bandwidth pressure. Honored by
    /// filter tees; driven by an external display-manager policy.
    SetBranchPaused { receiver_id: String, paused: bool },
    /// Tear the tee down.
    Shutdown,
}

pub type TeeEventSender = mpsc::Sender<TeeEvent>;

/// Handle to a running tee task.
#[derive(Debug, Clone)]
pub struct TeeHandle {
    pub payload_tx: MediaPayloadSender,
    pub event_tx: TeeEventSender,
}

struct Branch {
    sender: MediaPayloadSender,
    paused: bool,
    drop_count: u64,
}

/// Spawn a broadcast fan-out tee. With `honor_pause` the tee behaves as a
/// filter tee: paused branches are skipped until resumed.
pub fn spawn_push_tee(track_id: &TrackId, peer_id: &PeerId, honor_pause: bool) -> TeeHandle {
    let (payload_tx, payload_rx) = mpsc::channel(MEDIA_PAYLOAD_CHANNEL_CAPACITY);
    let (event_tx, event_rx) = mpsc::channel(TEE_EVENT_CHANNEL_CAPACITY);

    let span = tracing::info_span!("tee", peer_id = %peer_id, track_id = %track_id);
    tokio::spawn(run_push_tee(payload_rx, event_rx, honor_pause).instrument(span));

    TeeHandle {
        payload_tx,
        event_tx,
    }
}

async fn run_push_tee(
    mut payload_rx: MediaPayloadReceiver,
    mut event_rx: mpsc::Receiver<TeeEvent>,
    honor_pause: bool,
) {
    let mut branches: HashMap<String, Branch> = HashMap::new();

    loop {
        // Control events are polled first so a branch linked before a
        // payload was produced is guaranteed to receive it.
        tokio::select! {
            biased;
            event = event_rx.recv() => match event {
                Some(TeeEvent::AddBranch { receiver_id, sender, selected_encoding }) => {
                    if selected_encoding.is_some() {
                        debug!(receiver_id = %receiver_id, "encoding preference ignored by non-simulcast tee");
                    }
                    branches.insert(receiver_id, Branch { sender, paused: false, drop_count: 0 });
                }
                Some(TeeEvent::RemoveBranch { receiver_id }) => {
                    branches.remove(&receiver_id);
                }
                Some(TeeEvent::SelectEncoding { receiver_id, .. }) => {
                    warn!(receiver_id = %receiver_id, "select_encoding on a non-simulcast tee");
                }
                Some(TeeEvent::SetBranchPaused { receiver_id, paused }) => {
                    if !honor_pause {
                        debug!(receiver_id = %receiver_id, "pause ignored by push tee");
                    } else if let Some(branch) = branches.get_mut(&receiver_id) {
                        branch.paused = paused;
                    }
                }
                Some(TeeEvent::Shutdown) | None => break,
            },
            payload = payload_rx.recv() => match payload {
                Some(payload) => fan_out(&mut branches, payload),
                None => {
                    debug!("publisher side closed, stopping tee");
                    break;
                }
            },
        }
    }

    info!("tee stopped");
}

fn fan_out(branches: &mut HashMap<String, Branch>, payload: MediaPayload) {
    let mut closed = Vec::new();

    for (id, branch) in branches.iter_mut() {
        if branch.paused {
            continue;
        }
        match branch.sender.try_send(payload.clone()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                branch.drop_count += 1;
                if branch.drop_count % DROP_LOG_INTERVAL == 0 {
                    warn!(
                        receiver_id = %id,
                        dropped = branch.drop_count,
                        "branch dropping payloads due to backpressure"
                    );
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => closed.push(id.clone()),
        }
    }

    for id in closed {
        branches.remove(&id);
        debug!(receiver_id = %id, "removed closed branch");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn payload(tag: u8) -> MediaPayload {
        MediaPayload {
            data: Bytes::from(vec![tag]),
            timestamp: u32::from(tag),
            rid: None,
        }
    }

    #[tokio::test]
    async fn fans_out_to_all_branches() {
        let tee = spawn_push_tee(&TrackId::from("t1"), &PeerId::from("p1"), false);

        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        for (id, sender) in [("a", tx_a), ("b", tx_b)] {
            tee.event_tx
                .send(TeeEvent::AddBranch {
                    receiver_id: id.to_string(),
                    sender,
                    selected_encoding: None,
                })
                .await
                .unwrap();
        }

        tee.payload_tx.send(payload(7)).await.unwrap();

        let got_a = timeout(Duration::from_secs(1), rx_a.recv())
            .await
            .unwrap()
            .unwrap();
        let got_b = timeout(Duration::from_secs(1), rx_b.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got_a.data, got_b.data);
        assert_eq!(got_a.data, Bytes::from(vec![7]));
    }

    #[tokio::test]
    async fn full_branch_drops_without_stalling_others() {
        let tee = spawn_push_tee(&TrackId::from("t1"), &PeerId::from("p1"), false);

        // Capacity-1 branch that nobody drains.
        let (tx_full, _rx_full_kept) = mpsc::channel(1);
        let (tx_ok, mut rx_ok) = mpsc::channel(64);
        tee.event_tx
            .send(TeeEvent::AddBranch {
                receiver_id: "full".to_string(),
                sender: tx_full,
                selected_encoding: None,
            })
            .await
            .unwrap();
        tee.event_tx
            .send(TeeEvent::AddBranch {
                receiver_id: "ok".to_string(),
                sender: tx_ok,
                selected_encoding: None,
            })
            .await
            .unwrap();

        for i in 0..10u8 {
            tee.payload_tx.send(payload(i)).await.unwrap();
        }

        for i in 0..10u8 {
            let got = timeout(Duration::from_secs(1), rx_ok.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(got.data, Bytes::from(vec![i]));
        }
    }

    #[tokio::test]
    async fn paused_filter_branch_receives_nothing() {
        let tee = spawn_push_tee(&TrackId::from("t1"), &PeerId::from("p1"), true);

        let (tx, mut rx) = mpsc::channel(8);
        tee.event_tx
            .send(TeeEvent::AddBranch {
                receiver_id: "a".to_string(),
                sender: tx,
                selected_encoding: None,
            })
            .await
            .unwrap();
        tee.event_tx
            .send(TeeEvent::SetBranchPaused {
                receiver_id: "a".to_string(),
                paused: true,
            })
            .await
            .unwrap();

        tee.payload_tx.send(payload(1)).await.unwrap();
        assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());

        tee.event_tx
            .send(TeeEvent::SetBranchPaused {
                receiver_id: "a".to_string(),
                paused: false,
            })
            .await
            .unwrap();
        tee.payload_tx.send(payload(2)).await.unwrap();
        let got = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.data, Bytes::from(vec![2]));
    }
}
