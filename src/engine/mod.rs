mod cart;
mod error;
mod hours;
mod ledger;
mod materialize;
mod store;
mod templates;
mod validate;

pub use error::EngineError;
pub use hours::{resolve_day, ClosedReason, DayStatus};
pub use store::{SharedInstance, SharedLine, SlotStore};
pub use templates::TemplateDraft;
pub use validate::quantity_from_i64;
pub(crate) use validate::now_ms;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, info};

use crate::config::EngineConfig;
use crate::model::*;
use crate::pricing::PriceBook;
use crate::wal::Wal;

use store::{apply_to_instance, apply_to_line};

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    /// Rewrite the log as a snapshot of the state it describes.
    Compact {
        response: oneshot::Sender<io::Result<usize>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut pending = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            pending = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                // Non-append commands run only after everything queued ahead of them is durable.
                if let Some(cmd) = pending {
                    handle_non_append(&mut wal, cmd);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
    debug!("WAL writer stopped");
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    if let Err(e) = result {
        // The whole batch is refused, so none of it may survive on disk.
        if let Err(rollback_err) = wal.rollback() {
            error!("WAL rollback failed after write error: {rollback_err}");
        }
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { response } => {
            let _ = response.send(compact_in_place(wal));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// Fold the log into a scratch store and write its snapshot back.
/// Runs on the writer task, so no append can slip in between read and swap.
fn compact_in_place(wal: &mut Wal) -> io::Result<usize> {
    let events = Wal::replay(wal.path())?;
    let snapshot = SlotStore::fold(&events).snapshot_events();
    Wal::write_compact_file(wal.path(), &snapshot)?;
    wal.swap_compact_file()?;
    Ok(snapshot.len())
}

pub struct Engine {
    pub store: SlotStore,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub config: EngineConfig,
    pub(super) prices: Arc<dyn PriceBook>,
    /// Serializes template validation + uniqueness check + write.
    pub(super) template_lock: Mutex<()>,
}

impl Engine {
    /// Replay the WAL at `wal_path` and start its writer. Must run inside a tokio runtime.
    pub fn new(
        wal_path: PathBuf,
        config: EngineConfig,
        prices: Arc<dyn PriceBook>,
    ) -> io::Result<Self> {
        let (wal, events) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = SlotStore::fold(&events);
        info!(
            events = events.len(),
            parks = store.park_count(),
            instances = store.instance_count(),
            "replayed WAL"
        );

        Ok(Self {
            store,
            wal_tx,
            config,
            prices,
            template_lock: Mutex::new(()),
        })
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append, then apply to the locked instance row and optionally its line.
    pub(super) async fn persist_and_apply(
        &self,
        instance: &mut SlotInstance,
        line: Option<&mut CartLine>,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_instance(instance, event);
        if let Some(line) = line {
            apply_to_line(line, event);
        }
        Ok(())
    }

    /// WAL-append, then apply to a locked line. For events with no counter effect.
    pub(super) async fn persist_line(
        &self,
        line: &mut CartLine,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_line(line, event);
        Ok(())
    }

    /// Rewrite the WAL as a snapshot. Returns the number of events kept.
    pub async fn compact_wal(&self) -> Result<usize, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        let kept = rx
            .await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        info!(events = kept, "compacted WAL");
        Ok(kept)
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
