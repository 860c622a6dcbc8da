/// Contest collection session.
///
/// **States:** Inactive → Collecting → {Resolved, TimedOut, Stopped}.
///
/// A session collects pushed payloads for one contest, deduplicates them,
/// and resolves with the final ordered list either shortly after the
/// expected count is reached (grace delay) or at the hard timeout. At most
/// one session exists at a time; starting a second one is refused.
///
/// **Dedup policy, in this order, deliberately:** name equality first, which
/// is authoritative because listing-page batches share one URL; only when no
/// name matches and the incoming URL addresses an individual problem, exact
/// URL equality. Collisions are dropped and logged, never errors.
use anyhow::{bail, Result};
use arbiter_common::types::CompanionPayload;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

/// Where an offered payload ended up.
#[derive(Debug)]
pub enum Offer {
    /// Appended to the active session.
    Accepted,
    /// Matched an already-collected entry; dropped.
    Duplicate,
    /// A session is active but the payload is not in scope for it; dropped,
    /// session stays open.
    OutOfScope,
    /// Arrived during resolution teardown; deliberately dropped.
    Late,
    /// No active session; the payload is handed back to the caller.
    NoSession(CompanionPayload),
}

/// Path segment addressing one problem of a contest.
pub fn individual_segment(contest_id: &str) -> String {
    format!("contest/{}/problem/", contest_id)
}

/// Path segment of the shared listing page, where every problem of the
/// contest shares one URL.
pub fn listing_segment(contest_id: &str) -> String {
    format!("contest/{}/problems", contest_id)
}

pub fn in_scope(url: &str, contest_id: &str) -> bool {
    url.contains(&individual_segment(contest_id)) || url.contains(&listing_segment(contest_id))
}

pub fn is_individual_url(url: &str, contest_id: &str) -> bool {
    url.contains(&individual_segment(contest_id))
}

/// Extract the contest id a URL belongs to, if any.
pub fn contest_id_from_url(url: &str) -> Option<String> {
    let mut parts = url.split('/');
    while let Some(part) = parts.next() {
        if part == "contest" {
            return parts
                .next()
                .filter(|id| !id.is_empty())
                .map(str::to_string);
        }
    }
    None
}

struct Session {
    contest_id: String,
    expected: usize,
    epoch: u64,
    entries: Vec<CompanionPayload>,
    resolver: Option<oneshot::Sender<Vec<CompanionPayload>>>,
}

#[derive(Default)]
struct Inner {
    session: Option<Session>,
    processing: bool,
    epoch: u64,
}

#[derive(Clone)]
pub struct ContestCollector {
    inner: Arc<Mutex<Inner>>,
    grace_delay: Duration,
    collect_timeout: Duration,
    processing_reset: Duration,
}

impl ContestCollector {
    pub fn new(grace_delay: Duration, collect_timeout: Duration, processing_reset: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            grace_delay,
            collect_timeout,
            processing_reset,
        }
    }

    /// Begin collecting for `contest_id`. The returned receiver resolves
    /// with the final ordered payload list. Refused while another session is
    /// active.
    pub async fn start(
        &self,
        contest_id: String,
        expected: usize,
    ) -> Result<oneshot::Receiver<Vec<CompanionPayload>>> {
        let mut inner = self.inner.lock().await;
        if inner.session.is_some() {
            bail!("A collection session is already active");
        }
        inner.epoch += 1;
        let epoch = inner.epoch;
        let (tx, rx) = oneshot::channel();
        info!(contest_id = %contest_id, expected = expected, "collection session started");
        inner.session = Some(Session {
            contest_id,
            expected,
            epoch,
            entries: Vec::new(),
            resolver: Some(tx),
        });
        drop(inner);

        // Hard ceiling: resolve with whatever was collected, possibly
        // nothing, if the expected count never arrives.
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(this.collect_timeout).await;
            this.resolve(epoch, "collection timeout").await;
        });
        Ok(rx)
    }

    /// Offer one payload to the active session. Dedup decisions are made in
    /// strict arrival order against the entries accumulated so far.
    pub async fn offer(&self, payload: CompanionPayload) -> Offer {
        let mut inner = self.inner.lock().await;
        let processing = inner.processing;
        let Some(session) = inner.session.as_mut() else {
            if processing {
                warn!(
                    name = %payload.name,
                    "payload arrived during session teardown, dropping"
                );
                return Offer::Late;
            }
            return Offer::NoSession(payload);
        };

        if !in_scope(&payload.url, &session.contest_id) {
            debug!(
                name = %payload.name,
                url = %payload.url,
                contest_id = %session.contest_id,
                "payload out of scope for the active session, dropping"
            );
            return Offer::OutOfScope;
        }

        if session.resolver.is_none() {
            warn!(
                name = %payload.name,
                contest_id = %session.contest_id,
                "payload arrived after resolution, dropping"
            );
            return Offer::Late;
        }

        if session.entries.iter().any(|e| e.name == payload.name) {
            info!(
                name = %payload.name,
                contest_id = %session.contest_id,
                "duplicate problem name, dropping"
            );
            return Offer::Duplicate;
        }
        // URL equality is only meaningful for individually addressed
        // problems; listing-page batches share one URL.
        if is_individual_url(&payload.url, &session.contest_id)
            && session.entries.iter().any(|e| e.url == payload.url)
        {
            info!(
                name = %payload.name,
                url = %payload.url,
                contest_id = %session.contest_id,
                "duplicate problem url, dropping"
            );
            return Offer::Duplicate;
        }

        session.entries.push(payload);
        let count = session.entries.len();
        debug!(
            contest_id = %session.contest_id,
            collected = count,
            expected = session.expected,
            "payload collected"
        );

        if count >= session.expected {
            // Resolution is scheduled, not immediate, so other in-flight
            // handling of near-simultaneous payloads can finish first.
            let epoch = session.epoch;
            let this = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(this.grace_delay).await;
                this.resolve(epoch, "expected count reached").await;
            });
        }
        Offer::Accepted
    }

    async fn resolve(&self, epoch: u64, reason: &str) {
        let mut inner = self.inner.lock().await;
        let Some(session) = inner.session.as_mut() else {
            return;
        };
        if session.epoch != epoch {
            return;
        }
        let Some(tx) = session.resolver.take() else {
            return;
        };
        let entries = session.entries.clone();
        info!(
            contest_id = %session.contest_id,
            collected = entries.len(),
            reason = reason,
            "collection session resolved"
        );
        let _ = tx.send(entries);
    }

    /// Mark that resolution handling has begun. Payloads arriving with no
    /// active session are dropped while this flag is set.
    pub async fn begin_processing(&self) {
        self.inner.lock().await.processing = true;
    }

    /// Clear the active session unconditionally. Does not resolve the
    /// in-flight future. The processing flag is cleared only after a delay,
    /// so payloads racing in during teardown are dropped, not materialized.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        let epoch = inner.epoch;
        if let Some(session) = inner.session.take() {
            info!(contest_id = %session.contest_id, "collection session cleared");
        }
        drop(inner);

        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(this.processing_reset).await;
            let mut inner = this.inner.lock().await;
            if inner.epoch == epoch {
                inner.processing = false;
            }
        });
    }

    #[cfg(test)]
    pub async fn is_processing(&self) -> bool {
        self.inner.lock().await.processing
    }
}
