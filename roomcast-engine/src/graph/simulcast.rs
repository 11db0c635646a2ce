//! Simulcast tee: receives every encoding layer of a track and forwards one
//! selected layer per receiver.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn, Instrument};

use roomcast_protocol::{EndpointId, PeerId, TrackId};

use super::tee::{
    MediaPayload, TeeEvent, TeeHandle, MEDIA_PAYLOAD_CHANNEL_CAPACITY,
    TEE_EVENT_CHANNEL_CAPACITY,
};
use crate::engine::messages::{EngineCommand, EngineCommandSender};

/// Current encoding selection per receiver, readable outside the tee task.
pub type EncodingSelections = Arc<RwLock<HashMap<String, String>>>;

const DROP_LOG_INTERVAL: u64 = 100;

struct SimulcastBranch {
    sender: mpsc::Sender<MediaPayload>,
    selected: String,
    drop_count: u64,
}

/// Spawn a simulcast tee for a track offering `encodings` (non-empty, in the
/// publisher's declared order; the first entry is the default selection).
pub fn spawn_simulcast_tee(
    track_id: &TrackId,
    peer_id: &PeerId,
    encodings: Vec<String>,
    engine_tx: EngineCommandSender,
) -> (TeeHandle, EncodingSelections) {
    let (payload_tx, payload_rx) = mpsc::channel(MEDIA_PAYLOAD_CHANNEL_CAPACITY);
    let (event_tx, event_rx) = mpsc::channel(TEE_EVENT_CHANNEL_CAPACITY);
    let selections: EncodingSelections = Arc::new(RwLock::new(HashMap::new()));

    let span = tracing::info_span!("simulcast_tee", peer_id = %peer_id, track_id = %track_id);
    tokio::spawn(
        run_simulcast_tee(
            track_id.clone(),
            encodings,
            payload_rx,
            event_rx,
            engine_tx,
            Arc::clone(&selections),
        )
        .instrument(span),
    );

    (
        TeeHandle {
            payload_tx,
            event_tx,
        },
        selections,
    )
}

async fn run_simulcast_tee(
    track_id: TrackId,
    encodings: Vec<String>,
    mut payload_rx: mpsc::Receiver<MediaPayload>,
    mut event_rx: mpsc::Receiver<TeeEvent>,
    engine_tx: EngineCommandSender,
    selections: EncodingSelections,
) {
    let mut branches: HashMap<String, SimulcastBranch> = HashMap::new();
    let default_encoding = encodings.first().cloned().unwrap_or_default();

    loop {
        tokio::select! {
            biased;
            event = event_rx.recv() => match event {
                Some(TeeEvent::AddBranch { receiver_id, sender, selected_encoding }) => {
                    let selected = match selected_encoding {
                        Some(enc) if encodings.contains(&enc) => enc,
                        Some(enc) => {
                            warn!(receiver_id = %receiver_id, encoding = %enc, "unknown default encoding, falling back");
                            default_encoding.clone()
                        }
                        None => default_encoding.clone(),
                    };
                    selections.write().insert(receiver_id.clone(), selected.clone());
                    branches.insert(receiver_id, SimulcastBranch { sender, selected, drop_count: 0 });
                }
                Some(TeeEvent::RemoveBranch { receiver_id }) => {
                    selections.write().remove(&receiver_id);
                    branches.remove(&receiver_id);
                }
                Some(TeeEvent::SelectEncoding { receiver_id, encoding }) => {
                    if !encodings.contains(&encoding) {
                        warn!(receiver_id = %receiver_id, encoding = %encoding, "encoding not offered by track");
                        continue;
                    }
                    let Some(branch) = branches.get_mut(&receiver_id) else {
                        warn!(receiver_id = %receiver_id, "select_encoding for unknown branch");
                        continue;
                    };
                    if branch.selected == encoding {
                        debug!(receiver_id = %receiver_id, encoding = %encoding, "encoding already selected");
                        continue;
                    }
                    branch.selected = encoding.clone();
                    selections.write().insert(receiver_id.clone(), encoding.clone());
                    let switched = EngineCommand::EncodingSwitched {
                        track_id: track_id.clone(),
                        receiver_id: EndpointId::from(receiver_id.as_str()),
                        encoding,
                    };
                    if engine_tx.try_send(switched).is_err() {
                        warn!(receiver_id = %receiver_id, "engine channel unavailable for encoding switch");
                    }
                }
                Some(TeeEvent::SetBranchPaused { receiver_id, .. }) => {
                    debug!(receiver_id = %receiver_id, "pause ignored by simulcast tee");
                }
                Some(TeeEvent::Shutdown) | None => break,
            },
            payload = payload_rx.recv() => match payload {
                Some(payload) => fan_out_layer(&mut branches, payload),
                None => {
                    debug!("publisher side closed, stopping simulcast tee");
                    break;
                }
            },
        }
    }

    info!("simulcast tee stopped");
}

fn fan_out_layer(branches: &mut HashMap<String, SimulcastBranch>, payload: MediaPayload) {
    let mut closed = Vec::new();

    for (id, branch) in branches.iter_mut() {
        // A payload without a layer tag goes to everyone.
        if payload
            .rid
            .as_deref()
            .map_or(false, |rid| rid != branch.selected)
        {
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
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::time::timeout;

    fn layered(tag: u8, rid: &str) -> MediaPayload {
        MediaPayload {
            data: Bytes::from(vec![tag]),
            timestamp: u32::from(tag),
            rid: Some(rid.to_string()),
        }
    }

    #[tokio::test]
    async fn forwards_only_the_selected_layer() {
        let (engine_tx, _engine_rx) = mpsc::channel(16);
        let (tee, selections) = spawn_simulcast_tee(
            &TrackId::from("t2"),
            &PeerId::from("p1"),
            vec!["l".into(), "m".into(), "h".into()],
            engine_tx,
        );

        let (tx, mut rx) = mpsc::channel(8);
        tee.event_tx
            .send(TeeEvent::AddBranch {
                receiver_id: "e3".to_string(),
                sender: tx,
                selected_encoding: None,
            })
            .await
            .unwrap();

        tee.payload_tx.send(layered(1, "h")).await.unwrap();
        tee.payload_tx.send(layered(2, "l")).await.unwrap();

        let got = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        // Default selection is the first declared encoding.
        assert_eq!(got.data, Bytes::from(vec![2]));
        assert_eq!(selections.read().get("e3").unwrap(), "l");
    }

    #[tokio::test]
    async fn switch_reports_to_engine_and_changes_layer() {
        let (engine_tx, mut engine_rx) = mpsc::channel(16);
        let (tee, _selections) = spawn_simulcast_tee(
            &TrackId::from("t2"),
            &PeerId::from("p1"),
            vec!["l".into(), "m".into(), "h".into()],
            engine_tx,
        );

        let (tx, mut rx) = mpsc::channel(8);
        tee.event_tx
            .send(TeeEvent::AddBranch {
                receiver_id: "e3".to_string(),
                sender: tx,
                selected_encoding: None,
            })
            .await
            .unwrap();

        tee.event_tx
            .send(TeeEvent::SelectEncoding {
                receiver_id: "e3".to_string(),
                encoding: "m".to_string(),
            })
            .await
            .unwrap();

        match timeout(Duration::from_secs(1), engine_rx.recv())
            .await
            .unwrap()
            .unwrap()
        {
            EngineCommand::EncodingSwitched {
                track_id,
                receiver_id,
                encoding,
            } => {
                assert_eq!(track_id.as_str(), "t2");
                assert_eq!(receiver_id.as_str(), "e3");
                assert_eq!(encoding, "m");
            }
            _ => panic!("expected EncodingSwitched"),
        }

        tee.payload_tx.send(layered(9, "l")).await.unwrap();
        tee.payload_tx.send(layered(3, "m")).await.unwrap();
        let got = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.data, Bytes::from(vec![3]));
    }

    #[tokio::test]
    async fn unknown_encoding_is_rejected() {
        let (engine_tx, mut engine_rx) = mpsc::channel(16);
        let (tee, selections) =
            spawn_simulcast_tee(
                &TrackId::from("t2"),
                &PeerId::from("p1"),
                vec!["l".into(), "h".into()],
                engine_tx,
            );

        let (tx, _rx) = mpsc::channel(8);
        tee.event_tx
            .send(TeeEvent::AddBranch {
                receiver_id: "e3".to_string(),
                sender: tx,
                selected_encoding: None,
            })
            .await
            .unwrap();
        tee.event_tx
            .send(TeeEvent::SelectEncoding {
                receiver_id: "e3".to_string(),
                encoding: "ultra".to_string(),
            })
            .await
            .unwrap();

        assert!(timeout(Duration::from_millis(100), engine_rx.recv())
            .await
            .is_err());
        assert_eq!(selections.read().get("e3").unwrap(), "l");
    }
}
