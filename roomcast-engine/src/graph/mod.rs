//! Routing graph: one fan-out tee per active track, plus an optional
//! raw-format branch (tee → depayloader → raw push tee).
//!
//! Graph edits for one fulfillment are staged into a [`GraphSpec`] and
//! committed in one pass so a subscriber is either fully linked or not
//! linked at all.

pub mod simulcast;
pub mod tee;

use nanoid::nanoid;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn, Instrument};

use roomcast_protocol::{PeerId, TrackId};

use crate::engine::messages::EngineCommandSender;
use simulcast::{spawn_simulcast_tee, EncodingSelections};
use tee::{
    spawn_push_tee, MediaPayloadSender, RawDepayloader, TeeEvent, TeeHandle,
    MEDIA_PAYLOAD_CHANNEL_CAPACITY,
};

/// The tee variant chosen for a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeeKind {
    /// Plain broadcast fan-out.
    Push,
    /// Fan-out that throttles individual receivers on display-manager
    /// feedback.
    Filter,
    /// Per-receiver encoding selection for layered tracks.
    Simulcast,
}

/// The raw-format branch of a track: a dedicated depayloader feeding a push
/// tee that raw subscribers link to. At most one exists per track.
pub struct RawBranch {
    pub tee: TeeHandle,
    branch_id: String,
}

/// All routing nodes of one active track.
pub struct TrackRoute {
    pub kind: TeeKind,
    pub tee: TeeHandle,
    pub selections: Option<EncodingSelections>,
    pub raw: Option<RawBranch>,
    owner: PeerId,
}

impl TrackRoute {
    /// Pick the tee variant and spawn it. Simulcast wins over the
    /// display-manager filter variant; plain push is the fallback.
    pub fn build(
        track_id: &TrackId,
        owner: &PeerId,
        simulcast_encodings: Option<&[String]>,
        display_manager: bool,
        engine_tx: EngineCommandSender,
    ) -> Self {
        match simulcast_encodings {
            Some(encodings) => {
                let (tee, selections) =
                    spawn_simulcast_tee(track_id, owner, encodings.to_vec(), engine_tx);
                Self {
                    kind: TeeKind::Simulcast,
                    tee,
                    selections: Some(selections),
                    raw: None,
                    owner: owner.clone(),
                }
            }
            None => {
                let kind = if display_manager {
                    TeeKind::Filter
                } else {
                    TeeKind::Push
                };
                Self {
                    kind,
                    tee: spawn_push_tee(track_id, owner, kind == TeeKind::Filter),
                    selections: None,
                    raw: None,
                    owner: owner.clone(),
                }
            }
        }
    }

    /// Materialize the raw-format branch if it does not exist yet and return
    /// a handle to its push tee.
    pub async fn ensure_raw_branch(
        &mut self,
        track_id: &TrackId,
        depayloader: Arc<dyn RawDepayloader>,
    ) -> TeeHandle {
        if let Some(raw) = &self.raw {
            return raw.tee.clone();
        }

        let raw_tee = spawn_push_tee(track_id, &self.owner, false);
        let branch_id = format!("raw-{}", nanoid!(12));
        let (branch_tx, mut branch_rx) = mpsc::channel(MEDIA_PAYLOAD_CHANNEL_CAPACITY);

        let raw_payload_tx = raw_tee.payload_tx.clone();
        let span = tracing::info_span!("raw_branch", track_id = %track_id);
        tokio::spawn(
            async move {
                while let Some(payload) = branch_rx.recv().await {
                    if raw_payload_tx.send(depayloader.depayload(payload)).await.is_err() {
                        break;
                    }
                }
                debug!("raw branch stopped");
            }
            .instrument(span),
        );

        if self
            .tee
            .event_tx
            .send(TeeEvent::AddBranch {
                receiver_id: branch_id.clone(),
                sender: branch_tx,
                selected_encoding: None,
            })
            .await
            .is_err()
        {
            warn!(track_id = %track_id, "tee gone while adding raw branch");
        }

        let handle = raw_tee.clone();
        self.raw = Some(RawBranch {
            tee: raw_tee,
            branch_id,
        });
        handle
    }

    /// Unlink one subscriber from whichever tee it is attached to.
    pub async fn unlink(&self, receiver_id: &str, raw: bool) {
        let tee = match (&self.raw, raw) {
            (Some(branch), true) => &branch.tee,
            _ => &self.tee,
        };
        let _ = tee
            .event_tx
            .send(TeeEvent::RemoveBranch {
                receiver_id: receiver_id.to_string(),
            })
            .await;
    }

    /// Tear down every node of this route. Branch receivers observe channel
    /// closure.
    pub async fn shutdown(self) {
        if let Some(raw) = &self.raw {
            let _ = raw.tee.event_tx.send(TeeEvent::Shutdown).await;
            // The raw depayloader task stops once its branch is unlinked and
            // the main tee drops the sender.
            let _ = self
                .tee
                .event_tx
                .send(TeeEvent::RemoveBranch {
                    receiver_id: raw.branch_id.clone(),
                })
                .await;
        }
        let _ = self.tee.event_tx.send(TeeEvent::Shutdown).await;
    }
}

/// One staged subscriber link, applied on commit.
pub struct StagedLink {
    pub tee: TeeHandle,
    pub receiver_id: String,
    pub sender: MediaPayloadSender,
    pub selected_encoding: Option<String>,
}

/// Collected graph edits for one fulfillment, committed together.
#[derive(Default)]
pub struct GraphSpec {
    links: Vec<StagedLink>,
}

impl GraphSpec {
    pub fn stage(&mut self, link: StagedLink) {
        self.links.push(link);
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Install every staged link, in staging order.
    pub async fn commit(self) {
        for link in self.links {
            if link
                .tee
                .event_tx
                .send(TeeEvent::AddBranch {
                    receiver_id: link.receiver_id.clone(),
                    sender: link.sender,
                    selected_encoding: link.selected_encoding,
                })
                .await
                .is_err()
            {
                warn!(receiver_id = %link.receiver_id, "tee gone while committing link");
            }
        }
    }
}
