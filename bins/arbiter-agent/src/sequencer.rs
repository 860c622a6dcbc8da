/// Keyed ordering primitive.
///
/// Maps a contest id to the tail of a chain of asynchronous units of work.
/// Units for the same id execute strictly one at a time, in enqueue order,
/// even when `enqueue` is called from several in-flight requests. A failing
/// or panicking unit is logged and the chain continues. Idle chains retire
/// their map entry after a retention delay, with a generation check so a
/// chain that was extended in the meantime is never removed.
use anyhow::Result;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error};

struct Unit {
    label: String,
    work: BoxFuture<'static, Result<()>>,
}

struct Chain {
    generation: u64,
    tx: mpsc::UnboundedSender<Unit>,
}

type ChainMap = Arc<Mutex<HashMap<String, Chain>>>;

#[derive(Clone)]
pub struct Sequencer {
    chains: ChainMap,
    retention: Duration,
    next_generation: Arc<AtomicU64>,
}

impl Sequencer {
    pub fn new(retention: Duration) -> Self {
        Self {
            chains: Arc::new(Mutex::new(HashMap::new())),
            retention,
            next_generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Append `work` to the chain for `key`, starting a new chain if none
    /// exists.
    pub async fn enqueue<F>(&self, key: &str, label: impl Into<String>, work: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let mut unit = Unit {
            label: label.into(),
            work: work.boxed(),
        };

        let mut chains = self.chains.lock().await;
        if let Some(chain) = chains.get(key) {
            match chain.tx.send(unit) {
                Ok(()) => return,
                // The worker retired between lookup and send; start fresh.
                Err(mpsc::error::SendError(returned)) => unit = returned,
            }
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        if tx.send(unit).is_err() {
            // Receiver is alive by construction.
            error!(key = %key, "failed to seed a fresh sequencer chain");
            return;
        }
        chains.insert(
            key.to_string(),
            Chain {
                generation,
                tx,
            },
        );
        debug!(key = %key, generation = generation, "started sequencer chain");
        tokio::spawn(drain_chain(
            self.chains.clone(),
            key.to_string(),
            generation,
            rx,
            self.retention,
        ));
    }

    #[cfg(test)]
    pub async fn active_chains(&self) -> usize {
        self.chains.lock().await.len()
    }
}

async fn drain_chain(
    chains: ChainMap,
    key: String,
    generation: u64,
    mut rx: mpsc::UnboundedReceiver<Unit>,
    retention: Duration,
) {
    loop {
        match tokio::time::timeout(retention, rx.recv()).await {
            Ok(Some(unit)) => {
                debug!(key = %key, unit = %unit.label, "running sequencer unit");
                match AssertUnwindSafe(unit.work).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        error!(key = %key, unit = %unit.label, error = %e, "sequencer unit failed")
                    }
                    Err(_) => {
                        error!(key = %key, unit = %unit.label, "sequencer unit panicked")
                    }
                }
            }
            Ok(None) => break,
            Err(_) => {
                // Idle long enough to retire, unless a unit raced in or the
                // entry was replaced by a newer chain.
                let mut map = chains.lock().await;
                let ours = map
                    .get(&key)
                    .is_some_and(|chain| chain.generation == generation);
                if !ours {
                    break;
                }
                if rx.is_empty() {
                    map.remove(&key);
                    debug!(key = %key, "sequencer chain retired");
                    break;
                }
            }
        }
    }
}
