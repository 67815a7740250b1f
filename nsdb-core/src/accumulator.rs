//! Write accumulator
//!
//! Writes and deletes are buffered per metric and applied in batches on a
//! fixed-period tick. The accumulator is an explicit two-state machine:
//! in `Accepting`, operations join their metric's FIFO buffer; in
//! `Draining` (while a flush runs), they are stashed and replayed FIFO
//! once the flush ends. A dedicated actor thread per namespace owns the
//! state machine and the flush path, fed by a bounded command channel.

use crate::index::IndexQuery;
use crate::sharding::Location;
use crate::storage::{MetricKey, ShardStorage};
use crate::types::Bit;
use crate::{NsdbError, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// A buffered mutation against one metric
#[derive(Debug, Clone)]
pub enum Operation {
    Write {
        metric: String,
        bit: Bit,
    },
    DeleteByRecord {
        metric: String,
        bit: Bit,
    },
    /// Mass-deletion against one location's index
    DeleteByQuery {
        metric: String,
        location: Location,
        query: IndexQuery,
    },
}

impl Operation {
    fn metric(&self) -> &str {
        match self {
            Operation::Write { metric, .. }
            | Operation::DeleteByRecord { metric, .. }
            | Operation::DeleteByQuery { metric, .. } => metric,
        }
    }
}

/// Accumulator states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulatorState {
    Accepting,
    Draining,
}

/// The pure buffer state machine: per-metric FIFO buffers plus a stash
/// for operations arriving while a drain is in progress.
pub struct WriteAccumulator {
    state: AccumulatorState,
    buffers: HashMap<String, VecDeque<Operation>>,
    stashed: VecDeque<Operation>,
}

impl WriteAccumulator {
    pub fn new() -> Self {
        Self {
            state: AccumulatorState::Accepting,
            buffers: HashMap::new(),
            stashed: VecDeque::new(),
        }
    }

    pub fn state(&self) -> AccumulatorState {
        self.state
    }

    /// Number of buffered operations, stash included
    pub fn pending(&self) -> usize {
        self.buffers.values().map(VecDeque::len).sum::<usize>() + self.stashed.len()
    }

    /// Accept an operation, stashing it while draining
    pub fn enqueue(&mut self, op: Operation) {
        match self.state {
            AccumulatorState::Accepting => {
                self.buffers
                    .entry(op.metric().to_string())
                    .or_default()
                    .push_back(op);
            }
            AccumulatorState::Draining => self.stashed.push_back(op),
        }
    }

    /// Enter the draining state and take every metric buffer
    pub fn begin_drain(&mut self) -> HashMap<String, VecDeque<Operation>> {
        self.state = AccumulatorState::Draining;
        std::mem::take(&mut self.buffers)
    }

    /// Put a failed metric's operations back, ahead of anything stashed
    pub fn restore(&mut self, metric: &str, ops: VecDeque<Operation>) {
        debug_assert_eq!(self.state, AccumulatorState::Draining);
        self.buffers.insert(metric.to_string(), ops);
    }

    /// Leave the draining state and replay the stash FIFO
    pub fn finish_drain(&mut self) {
        self.state = AccumulatorState::Accepting;
        while let Some(op) = self.stashed.pop_front() {
            self.enqueue(op);
        }
    }

    /// Discard every pending operation for a metric
    pub fn forget_metric(&mut self, metric: &str) {
        self.buffers.remove(metric);
        self.stashed.retain(|op| op.metric() != metric);
    }
}

impl Default for WriteAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

/// Commands accepted by the accumulator actor
enum Command {
    Enqueue(Operation),
    /// Force a flush; the sender, when present, is signalled on completion
    Flush(Option<SyncSender<()>>),
    /// Drop every pending operation for a metric
    ForgetMetric(String),
    /// Flush and stop
    Shutdown,
}

/// Handle to a namespace's accumulator actor
pub struct AccumulatorHandle {
    tx: SyncSender<Command>,
    handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl AccumulatorHandle {
    /// Enqueue an operation. Returns once the actor has accepted it; the
    /// operation is acknowledged but not yet durable.
    pub fn enqueue(&self, op: Operation) -> Result<()> {
        self.tx
            .send(Command::Enqueue(op))
            .map_err(|_| NsdbError::Internal("accumulator is not running".into()))
    }

    /// Force a flush and wait for it to complete
    pub fn flush(&self) -> Result<()> {
        let (done_tx, done_rx) = mpsc::sync_channel(1);
        self.tx
            .send(Command::Flush(Some(done_tx)))
            .map_err(|_| NsdbError::Internal("accumulator is not running".into()))?;
        done_rx
            .recv()
            .map_err(|_| NsdbError::Internal("accumulator stopped mid-flush".into()))
    }

    /// Drop pending operations for a metric (used by DROP METRIC)
    pub fn forget_metric(&self, metric: &str) -> Result<()> {
        self.tx
            .send(Command::ForgetMetric(metric.to_string()))
            .map_err(|_| NsdbError::Internal("accumulator is not running".into()))
    }

    /// Flush pending operations and stop the actor
    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

/// The actor thread driving a namespace's accumulator
pub struct AccumulatorActor {
    db: String,
    namespace: String,
    storage: Arc<ShardStorage>,
    accumulator: WriteAccumulator,
    rx: Receiver<Command>,
    flush_interval: Duration,
    passivate_after: Duration,
}

const COMMAND_CHANNEL_CAPACITY: usize = 1024;

impl AccumulatorActor {
    /// Spawn the actor thread for a (db, namespace)
    pub fn spawn(
        db: &str,
        namespace: &str,
        storage: Arc<ShardStorage>,
        flush_interval: Duration,
        passivate_after: Duration,
    ) -> AccumulatorHandle {
        let (tx, rx) = mpsc::sync_channel(COMMAND_CHANNEL_CAPACITY);
        let mut actor = AccumulatorActor {
            db: db.to_string(),
            namespace: namespace.to_string(),
            storage,
            accumulator: WriteAccumulator::new(),
            rx,
            flush_interval,
            passivate_after,
        };
        let handle = thread::spawn(move || actor.run());
        AccumulatorHandle {
            tx,
            handle: parking_lot::Mutex::new(Some(handle)),
        }
    }

    fn run(&mut self) {
        info!(db = %self.db, namespace = %self.namespace, "accumulator started");
        let mut last_flush = Instant::now();

        loop {
            let deadline = last_flush + self.flush_interval;
            let timeout = deadline.saturating_duration_since(Instant::now());

            match self.rx.recv_timeout(timeout) {
                Ok(Command::Enqueue(op)) => self.accumulator.enqueue(op),
                Ok(Command::Flush(done)) => {
                    self.flush_all();
                    last_flush = Instant::now();
                    if let Some(done) = done {
                        let _ = done.send(());
                    }
                }
                Ok(Command::ForgetMetric(metric)) => self.accumulator.forget_metric(&metric),
                Ok(Command::Shutdown) => {
                    self.flush_all();
                    break;
                }
                Err(RecvTimeoutError::Timeout) => {
                    self.flush_all();
                    self.storage.passivate_idle(self.passivate_after);
                    last_flush = Instant::now();
                }
                Err(RecvTimeoutError::Disconnected) => {
                    warn!(db = %self.db, namespace = %self.namespace, "channel closed, draining");
                    self.flush_all();
                    break;
                }
            }
        }

        info!(db = %self.db, namespace = %self.namespace, "accumulator stopped");
    }

    /// Drain every metric buffer. An I/O failure keeps the failed metric's
    /// operations for the next tick; other metrics still flush.
    fn flush_all(&mut self) {
        let batches = self.accumulator.begin_drain();
        for (metric, ops) in batches {
            let count = ops.len();
            match self.flush_metric(&metric, &ops) {
                Ok(()) => debug!(metric = %metric, count, "flushed"),
                Err(e) => {
                    error!(metric = %metric, error = %e, "flush failed, will retry");
                    self.accumulator.restore(&metric, ops);
                }
            }
        }
        self.accumulator.finish_drain();
    }

    /// Apply a metric's operations in enqueue order. Operations are routed
    /// to their location; locations partition documents by timestamp, so
    /// per-location order equals per-metric order for every document.
    fn flush_metric(&self, metric: &str, ops: &VecDeque<Operation>) -> Result<()> {
        let key = MetricKey::new(&self.db, &self.namespace, metric);
        let shards = self.storage.shards(&key)?;

        // group per location, preserving enqueue order within each
        let mut order: Vec<String> = Vec::new();
        let mut grouped: HashMap<String, (Location, Vec<&Operation>)> = HashMap::new();
        for op in ops {
            let location = match op {
                Operation::Write { bit, .. } | Operation::DeleteByRecord { bit, .. } => {
                    shards.location_for(bit.timestamp)
                }
                Operation::DeleteByQuery { location, .. } => location.clone(),
            };
            let dir = location.directory_name();
            grouped
                .entry(dir.clone())
                .or_insert_with(|| {
                    order.push(dir);
                    (location, Vec::new())
                })
                .1
                .push(op);
        }

        for dir in order {
            let (location, location_ops) = &grouped[&dir];
            let index = shards.index_for(location)?;
            let mut writer = index.writer();
            for op in location_ops {
                match op {
                    Operation::Write { bit, .. } => {
                        // a record failing validation is dropped, the batch continues
                        if let Err(e) = writer.write(bit.clone()) {
                            warn!(metric, error = %e, "dropping invalid record");
                        }
                    }
                    Operation::DeleteByRecord { bit, .. } => writer.delete_record(bit.clone()),
                    Operation::DeleteByQuery { query, .. } => writer.delete_query(query.clone()),
                }
            }
            writer.commit()?;
        }

        shards.invalidate_searchers();
        Ok(())
    }
}
