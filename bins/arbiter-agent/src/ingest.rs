// Ingestion body contract and per-payload routing. The listener hands the
// accumulated request body here; nothing in this module can take the
// listener down.
use crate::aggregator::{contest_id_from_url, ContestCollector, Offer};
use crate::materialize::MaterializeCtx;
use crate::sequencer::Sequencer;
use arbiter_common::events::UiEvent;
use arbiter_common::types::CompanionPayload;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

/// Parse an ingestion body: a single payload object or an array of them.
/// Array elements are returned in array order.
pub fn parse_payloads(raw: &str) -> Result<Vec<CompanionPayload>, serde_json::Error> {
    let value: Value = serde_json::from_str(raw)?;
    match value {
        Value::Array(items) => items
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<_>, _>>(),
        other => Ok(vec![serde_json::from_value(other)?]),
    }
}

/// The ingestion side of the daemon: aggregator, sequencer, and
/// materializer wired together.
#[derive(Clone)]
pub struct Pipeline {
    pub collector: ContestCollector,
    pub sequencer: Sequencer,
    pub mat: MaterializeCtx,
    pub events: UnboundedSender<UiEvent>,
}

impl Pipeline {
    /// Handle one accumulated request body. An empty body is a no-op; a
    /// malformed body is logged with the raw text and surfaced as a
    /// user-visible error; payloads are routed one by one, in order.
    pub async fn handle_body(&self, raw: &str) {
        if raw.trim().is_empty() {
            debug!("empty ingestion body, nothing to do");
            return;
        }
        let payloads = match parse_payloads(raw) {
            Ok(payloads) => payloads,
            Err(e) => {
                warn!(error = %e, body = %raw, "failed to parse ingestion body");
                let _ = self.events.send(UiEvent::Error {
                    message: format!("Could not parse pushed problem data: {}", e),
                });
                return;
            }
        };
        for payload in payloads {
            self.route(payload).await;
        }
    }

    /// Route one payload: an active collection session gets first refusal;
    /// otherwise contest-bound payloads go through the per-contest
    /// sequencer and everything else materializes directly.
    pub async fn route(&self, payload: CompanionPayload) {
        let payload = match self.collector.offer(payload).await {
            Offer::Accepted | Offer::Duplicate | Offer::OutOfScope | Offer::Late => return,
            Offer::NoSession(payload) => payload,
        };

        match contest_id_from_url(&payload.url) {
            Some(contest_id) => {
                let ctx = self.mat.clone();
                let id = contest_id.clone();
                let label = payload.name.clone();
                self.sequencer
                    .enqueue(&contest_id, label, async move {
                        ctx.commit_contest_member(&id, payload).await.map(|_| ())
                    })
                    .await;
            }
            None => {
                if let Err(e) = self.mat.commit(payload).await {
                    warn!(error = %e, "failed to materialize problem");
                    let _ = self.events.send(UiEvent::Error {
                        message: format!("Could not save pushed problem: {}", e),
                    });
                }
            }
        }
    }
}
