mod availability;
mod bookings;
mod conflict;
mod error;
mod mutations;
mod queries;
mod reservations;
mod store;

pub use conflict::now_ms;
pub use error::EngineError;
pub use store::{HostGuards, Store};

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedHostState = Arc<RwLock<HostState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Drain every Append already queued behind it.
/// 3. One flush_sync for the whole batch, then answer every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after a failed append so the partial batch doesn't leak into the next one.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// One tenant's scheduling engine.
///
/// Host calendars are `RwLock`ed individually. Any operation that checks and
/// then writes allocations takes write locks on every host involved, in id
/// order, and holds them across the WAL append.
pub struct Engine {
    pub(super) store: Store,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Serializes directory writes (users, teams, schedules, event types).
    pub(super) directory: Mutex<()>,
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            store: Store::new(),
            wal_tx,
            notify,
            directory: Mutex::new(()),
        };

        // We're the sole owner of every host lock here, so try_write always
        // succeeds. Never block: this may run inside an async context (lazy
        // tenant creation).
        for event in &events {
            let mut guards = HostGuards::new();
            for host_id in engine.store.hosts_touched(event) {
                if guards.contains_key(&host_id) {
                    continue;
                }
                if let Some(host) = engine.store.get_host(&host_id) {
                    let guard = host.try_write_owned().expect("replay: uncontended write");
                    guards.insert(host_id, guard);
                }
            }
            engine.store.apply(event, &mut guards);
        }

        tracing::debug!(events = events.len(), path = %wal_path.display(), "engine replayed WAL");
        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
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

    /// WAL-append + apply + notify in one call.
    pub(super) async fn persist_and_apply(
        &self,
        guards: &mut HostGuards,
        event: Event,
    ) -> Result<(), EngineError> {
        self.wal_append(&event).await?;
        let mut touched = self.store.hosts_touched(&event);
        touched.sort();
        touched.dedup();
        self.store.apply(&event, guards);
        for host_id in touched {
            self.notify.send(host_id, &event);
        }
        Ok(())
    }

    /// Directory events touch no host calendar.
    pub(super) async fn persist_directory(&self, event: Event) -> Result<(), EngineError> {
        self.persist_and_apply(&mut HostGuards::new(), event).await
    }

    /// Acquire write locks on the given hosts in id order.
    pub(super) async fn lock_hosts(&self, ids: &[Ulid]) -> Result<HostGuards, EngineError> {
        let mut sorted: Vec<Ulid> = ids.to_vec();
        sorted.sort();
        sorted.dedup();

        let mut guards = BTreeMap::new();
        for id in sorted {
            let host = self.store.get_host(&id).ok_or(EngineError::NotFound(id))?;
            guards.insert(id, host.write_owned().await);
        }
        Ok(guards)
    }

    /// Watch allocation changes on one host's calendar.
    pub fn subscribe(&self, host_id: Ulid) -> tokio::sync::broadcast::Receiver<Event> {
        self.notify.subscribe(host_id)
    }

    pub fn store(&self) -> &Store {
        &self.store
    }
}
