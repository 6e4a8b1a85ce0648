//! # Relay Slot Table
//!
//! Relay-side registry of active relayed connections. Each slot pairs the
//! stream to the source with the stream to the destination and pipes bytes
//! between them in both directions until either side closes, a piping
//! write fails, or the connection sits idle past its free-timeout.
//!
//! ## Architecture
//!
//! The table uses the actor pattern for safe concurrent state:
//! - [`SlotTable`]: the public handle (cheap to clone, sends commands)
//! - `SlotTableActor`: owns the slot map, processes commands sequentially
//! - `SlotCommand`: commands sent from handles to the actor
//!
//! Sequential command processing makes the exists / is-active / reserve /
//! create sequence of one relay negotiation atomic with respect to
//! concurrent negotiations for the same (source, destination) pair: two
//! racing requests can never both create a slot for one pair.
//!
//! ## Slot Lifecycle
//!
//! ```text
//! reserve -> create_new -> piping -> retired
//!                \-> reservation expires (sweeper)
//! ```
//!
//! Each active slot runs one pipe task that owns both streams. The task
//! answers liveness probes and source-stream swaps over a control channel
//! and retires its table entry when it exits. Retirement is guarded by a
//! per-slot sequence number so a stale exit can never remove a newer slot
//! registered under the same key.

use std::collections::HashMap;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::identity::Identity;
use crate::stream::BoxedDuplex;

// ============================================================================
// Constants
// ============================================================================

/// Default maximum number of slots (active + reserved) a relay hosts.
/// SECURITY: Hard bound on relay-side resource consumption; requests
/// beyond it are rejected, never silently evicted.
pub const DEFAULT_MAX_SLOTS: usize = 1024;

/// Default idle period after which an unused slot is reclaimed.
pub const DEFAULT_FREE_TIMEOUT: Duration = Duration::from_secs(300);

/// Upper bound on a liveness probe against a slot's pipe task.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Lifetime of a reservation that was never completed by `create_new`.
pub const RESERVATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval for the sweeper that drops expired reservations and entries
/// whose pipe task already finished.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Read buffer size per piping direction.
const RELAY_COPY_BUFFER: usize = 8 * 1024;

/// Command channel capacity for the slot table actor.
const SLOT_COMMAND_CHANNEL_SIZE: usize = 256;

/// Control channel capacity per pipe task.
const SLOT_CONTROL_CHANNEL_SIZE: usize = 8;

/// Directional key of a relayed connection: (source, destination).
pub type SlotKey = (Identity, Identity);

// ============================================================================
// Errors
// ============================================================================

/// Rejection reasons for slot table operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotError {
    /// The table is at its configured maximum.
    AtCapacity,
    /// A live slot or unexpired reservation already holds the key.
    AlreadyRegistered,
    /// No slot is registered for the key.
    NoSuchSlot,
    /// The slot exists but its pipe task is no longer reachable.
    SlotUnresponsive,
    /// The table actor has shut down.
    TableClosed,
}

impl std::fmt::Display for SlotError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlotError::AtCapacity => write!(f, "relay slot table is at capacity"),
            SlotError::AlreadyRegistered => write!(f, "slot already registered for this pair"),
            SlotError::NoSuchSlot => write!(f, "no slot registered for this pair"),
            SlotError::SlotUnresponsive => write!(f, "slot pipe task is unresponsive"),
            SlotError::TableClosed => write!(f, "slot table has shut down"),
        }
    }
}

impl std::error::Error for SlotError {}

// ============================================================================
// Commands and slot state
// ============================================================================

enum SlotCommand {
    Exists {
        key: SlotKey,
        reply: oneshot::Sender<bool>,
    },
    IsActive {
        key: SlotKey,
        reply: oneshot::Sender<bool>,
    },
    UpdateExisting {
        key: SlotKey,
        stream: BoxedDuplex,
        reply: oneshot::Sender<Result<(), SlotError>>,
    },
    Reserve {
        key: SlotKey,
        reply: oneshot::Sender<Result<(), SlotError>>,
    },
    CreateNew {
        key: SlotKey,
        source: BoxedDuplex,
        destination: BoxedDuplex,
        free_timeout: Duration,
        reply: oneshot::Sender<Result<(), SlotError>>,
    },
    Len {
        reply: oneshot::Sender<usize>,
    },
    AtCapacity {
        reply: oneshot::Sender<bool>,
    },
    Shutdown,
}

/// Control messages delivered to a slot's pipe task.
enum SlotControl {
    /// Liveness probe; a reply proves the task is still piping.
    Probe { reply: oneshot::Sender<()> },
    /// Replace the source-side stream; the old one is shut down.
    SwapSource { stream: BoxedDuplex },
    Shutdown,
}

enum SlotEntry {
    /// Admitted but not yet piping; expires if never completed.
    Reserved { seq: u64, deadline: Instant },
    Active(ActiveSlot),
}

struct ActiveSlot {
    seq: u64,
    control: mpsc::Sender<SlotControl>,
    task: JoinHandle<()>,
}

impl ActiveSlot {
    fn is_dead(&self) -> bool {
        self.task.is_finished()
    }
}

// ============================================================================
// SlotTable handle (public API - cheap to clone)
// ============================================================================

/// Handle to the relay slot table actor. Cheap to clone.
#[derive(Clone)]
pub struct SlotTable {
    cmd_tx: mpsc::Sender<SlotCommand>,
}

impl std::fmt::Debug for SlotTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotTable").finish_non_exhaustive()
    }
}

impl SlotTable {
    /// Create a slot table bounded to `max_slots` and spawn its actor.
    pub fn new(max_slots: usize) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(SLOT_COMMAND_CHANNEL_SIZE);
        let (retire_tx, retire_rx) = mpsc::unbounded_channel();

        let actor = SlotTableActor {
            max_slots,
            slots: HashMap::new(),
            retire_tx,
            next_seq: 0,
        };
        tokio::spawn(actor.run(cmd_rx, retire_rx));

        Self { cmd_tx }
    }

    /// True iff an established slot is registered for (source, destination).
    ///
    /// Reservations do not count: a reserved slot is not yet a connection.
    pub async fn exists(&self, source: &Identity, destination: &Identity) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        let cmd = SlotCommand::Exists { key: (*source, *destination), reply: reply_tx };
        if self.cmd_tx.send(cmd).await.is_err() {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }

    /// Probe whether the slot for (source, destination) is currently usable.
    ///
    /// Bounded by [`PROBE_TIMEOUT`]; a dead or unresponsive pipe task is
    /// reported as inactive.
    pub async fn is_active(&self, source: &Identity, destination: &Identity) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        let cmd = SlotCommand::IsActive { key: (*source, *destination), reply: reply_tx };
        if self.cmd_tx.send(cmd).await.is_err() {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }

    /// Replace the source-side stream of an existing slot.
    ///
    /// The previous source-side stream is shut down by the pipe task; the
    /// destination side and the idle clock are not disturbed.
    pub async fn update_existing(
        &self,
        source: &Identity,
        destination: &Identity,
        new_source_stream: BoxedDuplex,
    ) -> Result<(), SlotError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let cmd = SlotCommand::UpdateExisting {
            key: (*source, *destination),
            stream: new_source_stream,
            reply: reply_tx,
        };
        self.cmd_tx.send(cmd).await.map_err(|_| SlotError::TableClosed)?;
        reply_rx.await.map_err(|_| SlotError::TableClosed)?
    }

    /// Admit a slot for (source, destination) ahead of its streams.
    ///
    /// This is the capacity gate and double-create guard: it fails when
    /// the table is full or when a live slot or unexpired reservation
    /// already holds the key. A successful reservation guarantees the
    /// following [`create_new`](Self::create_new) cannot be rejected,
    /// which is what allows the relay to answer `OK` to both peers before
    /// the streams are handed over.
    pub async fn reserve(
        &self,
        source: &Identity,
        destination: &Identity,
    ) -> Result<(), SlotError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let cmd = SlotCommand::Reserve { key: (*source, *destination), reply: reply_tx };
        self.cmd_tx.send(cmd).await.map_err(|_| SlotError::TableClosed)?;
        reply_rx.await.map_err(|_| SlotError::TableClosed)?
    }

    /// Register a slot and start piping bytes between its two streams.
    ///
    /// Completes a prior [`reserve`](Self::reserve) if one is held for the
    /// key, otherwise reserves inline (subject to capacity). Piping runs
    /// until either side closes, a write fails, or the connection idles
    /// past `free_timeout`; the slot then closes both streams and retires
    /// itself.
    pub async fn create_new(
        &self,
        source: &Identity,
        destination: &Identity,
        source_stream: BoxedDuplex,
        destination_stream: BoxedDuplex,
        free_timeout: Duration,
    ) -> Result<(), SlotError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let cmd = SlotCommand::CreateNew {
            key: (*source, *destination),
            source: source_stream,
            destination: destination_stream,
            free_timeout,
            reply: reply_tx,
        };
        self.cmd_tx.send(cmd).await.map_err(|_| SlotError::TableClosed)?;
        reply_rx.await.map_err(|_| SlotError::TableClosed)?
    }

    /// Current number of table entries (active + reserved).
    pub async fn len(&self) -> usize {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.cmd_tx.send(SlotCommand::Len { reply: reply_tx }).await.is_err() {
            return 0;
        }
        reply_rx.await.unwrap_or(0)
    }

    /// True when no further slot can be admitted.
    pub async fn at_capacity(&self) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.cmd_tx.send(SlotCommand::AtCapacity { reply: reply_tx }).await.is_err() {
            return true;
        }
        reply_rx.await.unwrap_or(true)
    }

    /// Stop the actor and every pipe task.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(SlotCommand::Shutdown).await;
    }
}

// ============================================================================
// Actor (owns all mutable state)
// ============================================================================

struct SlotTableActor {
    max_slots: usize,
    slots: HashMap<SlotKey, SlotEntry>,
    retire_tx: mpsc::UnboundedSender<(SlotKey, u64)>,
    next_seq: u64,
}

impl SlotTableActor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<SlotCommand>,
        mut retire_rx: mpsc::UnboundedReceiver<(SlotKey, u64)>,
    ) {
        let mut sweep_interval = tokio::time::interval(SWEEP_INTERVAL);
        sweep_interval.tick().await; // Skip initial tick

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(SlotCommand::Exists { key, reply }) => {
                            let _ = reply.send(self.exists(&key));
                        }
                        Some(SlotCommand::IsActive { key, reply }) => {
                            let _ = reply.send(self.probe(&key).await);
                        }
                        Some(SlotCommand::UpdateExisting { key, stream, reply }) => {
                            let _ = reply.send(self.update_existing(&key, stream).await);
                        }
                        Some(SlotCommand::Reserve { key, reply }) => {
                            let _ = reply.send(self.reserve(key));
                        }
                        Some(SlotCommand::CreateNew { key, source, destination, free_timeout, reply }) => {
                            let _ = reply.send(self.create_new(key, source, destination, free_timeout));
                        }
                        Some(SlotCommand::Len { reply }) => {
                            let _ = reply.send(self.slots.len());
                        }
                        Some(SlotCommand::AtCapacity { reply }) => {
                            let _ = reply.send(self.slots.len() >= self.max_slots);
                        }
                        Some(SlotCommand::Shutdown) | None => {
                            debug!("slot table actor shutting down");
                            self.shutdown_all();
                            break;
                        }
                    }
                }

                Some((key, seq)) = retire_rx.recv() => {
                    self.retire(key, seq);
                }

                _ = sweep_interval.tick() => {
                    self.sweep();
                }
            }
        }
    }

    fn exists(&self, key: &SlotKey) -> bool {
        matches!(self.slots.get(key), Some(SlotEntry::Active(_)))
    }

    /// Probe the slot's pipe task. The task exits on any stream error or
    /// EOF, so a reply within the timeout proves both streams were usable
    /// as of its last loop iteration.
    async fn probe(&self, key: &SlotKey) -> bool {
        let slot = match self.slots.get(key) {
            Some(SlotEntry::Active(slot)) if !slot.is_dead() => slot,
            _ => return false,
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let probe = async {
            slot.control.send(SlotControl::Probe { reply: reply_tx }).await.is_ok()
                && reply_rx.await.is_ok()
        };
        match tokio::time::timeout(PROBE_TIMEOUT, probe).await {
            Ok(alive) => alive,
            Err(_) => {
                trace!(
                    source = %key.0,
                    destination = %key.1,
                    "liveness probe timed out"
                );
                false
            }
        }
    }

    async fn update_existing(&mut self, key: &SlotKey, stream: BoxedDuplex) -> Result<(), SlotError> {
        let slot = match self.slots.get(key) {
            Some(SlotEntry::Active(slot)) if !slot.is_dead() => slot,
            Some(_) | None => return Err(SlotError::NoSuchSlot),
        };

        let send = slot.control.send(SlotControl::SwapSource { stream });
        match tokio::time::timeout(PROBE_TIMEOUT, send).await {
            Ok(Ok(())) => {
                debug!(
                    source = %key.0,
                    destination = %key.1,
                    "replaced source-side stream of existing slot"
                );
                Ok(())
            }
            Ok(Err(_)) | Err(_) => Err(SlotError::SlotUnresponsive),
        }
    }

    fn reserve(&mut self, key: SlotKey) -> Result<(), SlotError> {
        match self.slots.get(&key) {
            Some(SlotEntry::Active(slot)) if !slot.is_dead() => {
                return Err(SlotError::AlreadyRegistered);
            }
            Some(SlotEntry::Reserved { deadline, .. }) if Instant::now() < *deadline => {
                return Err(SlotError::AlreadyRegistered);
            }
            // Dead slot or expired reservation: the key can be retaken.
            Some(_) => {
                self.teardown(&key);
            }
            None => {}
        }

        if self.slots.len() >= self.max_slots {
            warn!(
                source = %key.0,
                destination = %key.1,
                max = self.max_slots,
                "rejecting slot reservation: table at capacity"
            );
            return Err(SlotError::AtCapacity);
        }

        let seq = self.next_seq();
        self.slots.insert(
            key,
            SlotEntry::Reserved { seq, deadline: Instant::now() + RESERVATION_TIMEOUT },
        );
        trace!(source = %key.0, destination = %key.1, seq, "reserved slot");
        Ok(())
    }

    fn create_new(
        &mut self,
        key: SlotKey,
        source: BoxedDuplex,
        destination: BoxedDuplex,
        free_timeout: Duration,
    ) -> Result<(), SlotError> {
        match self.slots.get(&key) {
            // Completing a reservation; any reservation for the key will
            // do, expired ones included - the streams are already here.
            Some(SlotEntry::Reserved { .. }) => {}
            Some(SlotEntry::Active(slot)) if !slot.is_dead() => {
                return Err(SlotError::AlreadyRegistered);
            }
            Some(SlotEntry::Active(_)) => {
                self.teardown(&key);
            }
            None => {
                if self.slots.len() >= self.max_slots {
                    return Err(SlotError::AtCapacity);
                }
            }
        }

        let seq = self.next_seq();
        let (control_tx, control_rx) = mpsc::channel(SLOT_CONTROL_CHANNEL_SIZE);
        let retire_tx = self.retire_tx.clone();
        let task = tokio::spawn(run_slot_pipe(
            key,
            seq,
            source,
            destination,
            free_timeout,
            control_rx,
            retire_tx,
        ));

        self.slots.insert(key, SlotEntry::Active(ActiveSlot { seq, control: control_tx, task }));
        debug!(
            source = %key.0,
            destination = %key.1,
            seq,
            slots = self.slots.len(),
            "registered relayed connection"
        );
        Ok(())
    }

    /// Remove the entry for `key` iff it still belongs to slot `seq`.
    fn retire(&mut self, key: SlotKey, seq: u64) {
        let matches_seq = match self.slots.get(&key) {
            Some(SlotEntry::Active(slot)) => slot.seq == seq,
            Some(SlotEntry::Reserved { seq: reserved_seq, .. }) => *reserved_seq == seq,
            None => false,
        };
        if matches_seq {
            self.slots.remove(&key);
            debug!(
                source = %key.0,
                destination = %key.1,
                seq,
                remaining = self.slots.len(),
                "retired relay slot"
            );
        }
    }

    /// Drop expired reservations and entries whose pipe task already
    /// finished without managing to retire itself.
    fn sweep(&mut self) {
        let now = Instant::now();
        let stale: Vec<SlotKey> = self
            .slots
            .iter()
            .filter(|(_, entry)| match entry {
                SlotEntry::Reserved { deadline, .. } => now >= *deadline,
                SlotEntry::Active(slot) => slot.is_dead(),
            })
            .map(|(key, _)| *key)
            .collect();

        let removed = stale.len();
        for key in stale {
            self.slots.remove(&key);
        }
        if removed > 0 {
            debug!(removed, remaining = self.slots.len(), "swept stale slot entries");
        }
    }

    /// Forcibly stop and remove the slot under `key`, if any.
    fn teardown(&mut self, key: &SlotKey) {
        if let Some(SlotEntry::Active(slot)) = self.slots.remove(key) {
            let _ = slot.control.try_send(SlotControl::Shutdown);
            slot.task.abort();
        }
    }

    fn shutdown_all(&mut self) {
        for (_, entry) in self.slots.drain() {
            if let SlotEntry::Active(slot) = entry {
                let _ = slot.control.try_send(SlotControl::Shutdown);
                slot.task.abort();
            }
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

// ============================================================================
// Pipe task
// ============================================================================

/// Outcome of one iteration of the pipe loop.
enum PipeEvent {
    SourceRead(std::io::Result<usize>),
    DestinationRead(std::io::Result<usize>),
    Control(Option<SlotControl>),
    Idle,
}

/// Relay bytes between the two streams of one slot until a terminal event.
///
/// Per-direction byte order is preserved: each direction is drained
/// read-by-read into the opposite stream. No ordering exists between the
/// two directions.
async fn run_slot_pipe(
    key: SlotKey,
    seq: u64,
    mut source: BoxedDuplex,
    mut destination: BoxedDuplex,
    free_timeout: Duration,
    mut control_rx: mpsc::Receiver<SlotControl>,
    retire_tx: mpsc::UnboundedSender<(SlotKey, u64)>,
) {
    let mut source_buf = vec![0u8; RELAY_COPY_BUFFER];
    let mut destination_buf = vec![0u8; RELAY_COPY_BUFFER];
    let mut idle_deadline = Instant::now() + free_timeout;

    let close_reason = loop {
        let event = tokio::select! {
            ctrl = control_rx.recv() => PipeEvent::Control(ctrl),
            read = source.read(&mut source_buf) => PipeEvent::SourceRead(read),
            read = destination.read(&mut destination_buf) => PipeEvent::DestinationRead(read),
            _ = tokio::time::sleep_until(idle_deadline) => PipeEvent::Idle,
        };

        match event {
            PipeEvent::SourceRead(Ok(0)) => break "source closed",
            PipeEvent::SourceRead(Ok(n)) => {
                if destination.write_all(&source_buf[..n]).await.is_err()
                    || destination.flush().await.is_err()
                {
                    break "write to destination failed";
                }
                trace!(source = %key.0, destination = %key.1, bytes = n, "relayed source -> destination");
                idle_deadline = Instant::now() + free_timeout;
            }
            PipeEvent::SourceRead(Err(e)) => {
                debug!(source = %key.0, destination = %key.1, error = %e, "source read failed");
                break "source read failed";
            }
            PipeEvent::DestinationRead(Ok(0)) => break "destination closed",
            PipeEvent::DestinationRead(Ok(n)) => {
                if source.write_all(&destination_buf[..n]).await.is_err()
                    || source.flush().await.is_err()
                {
                    break "write to source failed";
                }
                trace!(source = %key.0, destination = %key.1, bytes = n, "relayed destination -> source");
                idle_deadline = Instant::now() + free_timeout;
            }
            PipeEvent::DestinationRead(Err(e)) => {
                debug!(source = %key.0, destination = %key.1, error = %e, "destination read failed");
                break "destination read failed";
            }
            PipeEvent::Control(Some(SlotControl::Probe { reply })) => {
                let _ = reply.send(());
            }
            PipeEvent::Control(Some(SlotControl::SwapSource { stream })) => {
                let mut old = std::mem::replace(&mut source, stream);
                let _ = old.shutdown().await;
                trace!(source = %key.0, destination = %key.1, "swapped source-side stream");
            }
            PipeEvent::Control(Some(SlotControl::Shutdown)) | PipeEvent::Control(None) => {
                break "shut down";
            }
            PipeEvent::Idle => break "idle past free-timeout",
        }
    };

    let _ = source.shutdown().await;
    let _ = destination.shutdown().await;
    debug!(
        source = %key.0,
        destination = %key.1,
        seq,
        reason = close_reason,
        "relay slot closed"
    );
    let _ = retire_tx.send((key, seq));
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn key_pair() -> SlotKey {
        (Keypair::generate().identity(), Keypair::generate().identity())
    }

    fn stream_pair() -> (BoxedDuplex, BoxedDuplex) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (Box::new(a), Box::new(b))
    }

    /// Poll until the slot for the pair is gone or the deadline passes.
    async fn wait_until_retired(
        table: &SlotTable,
        source: &Identity,
        destination: &Identity,
    ) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if !table.exists(source, destination).await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn create_new_registers_and_pipes_both_directions() {
        let table = SlotTable::new(8);
        let (source, destination) = key_pair();
        let (source_near, mut source_far) = stream_pair();
        let (destination_near, mut destination_far) = stream_pair();

        table
            .create_new(&source, &destination, source_near, destination_near, DEFAULT_FREE_TIMEOUT)
            .await
            .expect("create_new should succeed");

        assert!(table.exists(&source, &destination).await);
        assert!(table.is_active(&source, &destination).await);
        assert_eq!(table.len().await, 1);

        // source -> destination
        source_far.write_all(b"ping").await.unwrap();
        source_far.flush().await.unwrap();
        let mut buf = [0u8; 4];
        destination_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        // destination -> source
        destination_far.write_all(b"pong").await.unwrap();
        destination_far.flush().await.unwrap();
        source_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        table.shutdown().await;
    }

    #[tokio::test]
    async fn closing_one_side_retires_the_slot() {
        let table = SlotTable::new(8);
        let (source, destination) = key_pair();
        let (source_near, source_far) = stream_pair();
        let (destination_near, _destination_far) = stream_pair();

        table
            .create_new(&source, &destination, source_near, destination_near, DEFAULT_FREE_TIMEOUT)
            .await
            .unwrap();
        assert!(table.exists(&source, &destination).await);

        drop(source_far);

        let retired = wait_until_retired(&table, &source, &destination).await;
        assert!(retired, "slot should retire after one side closes");
        assert_eq!(table.len().await, 0);

        table.shutdown().await;
    }

    #[tokio::test]
    async fn idle_slot_is_reclaimed_after_free_timeout() {
        let table = SlotTable::new(8);
        let (source, destination) = key_pair();
        let (source_near, _source_far) = stream_pair();
        let (destination_near, _destination_far) = stream_pair();

        table
            .create_new(
                &source,
                &destination,
                source_near,
                destination_near,
                Duration::from_millis(100),
            )
            .await
            .unwrap();
        assert!(table.exists(&source, &destination).await);

        let reclaimed = wait_until_retired(&table, &source, &destination).await;
        assert!(reclaimed, "idle slot should be reclaimed");

        table.shutdown().await;
    }

    #[tokio::test]
    async fn reserve_enforces_capacity_and_uniqueness() {
        let table = SlotTable::new(1);
        let (source, destination) = key_pair();
        let other = key_pair();

        table.reserve(&source, &destination).await.expect("first reservation fits");
        assert_eq!(
            table.reserve(&source, &destination).await,
            Err(SlotError::AlreadyRegistered)
        );
        assert_eq!(table.reserve(&other.0, &other.1).await, Err(SlotError::AtCapacity));
        assert!(table.at_capacity().await);

        // A reservation is admission, not an established connection.
        assert!(!table.exists(&source, &destination).await);

        table.shutdown().await;
    }

    #[tokio::test]
    async fn create_new_completes_a_reservation() {
        let table = SlotTable::new(1);
        let (source, destination) = key_pair();
        let (source_near, _source_far) = stream_pair();
        let (destination_near, _destination_far) = stream_pair();

        table.reserve(&source, &destination).await.unwrap();
        table
            .create_new(&source, &destination, source_near, destination_near, DEFAULT_FREE_TIMEOUT)
            .await
            .expect("create_new must succeed after reserve even at capacity");

        assert!(table.exists(&source, &destination).await);
        assert_eq!(table.len().await, 1);

        table.shutdown().await;
    }

    #[tokio::test]
    async fn update_existing_swaps_the_source_stream() {
        let table = SlotTable::new(8);
        let (source, destination) = key_pair();
        let (source_near, mut old_source_far) = stream_pair();
        let (destination_near, mut destination_far) = stream_pair();

        table
            .create_new(&source, &destination, source_near, destination_near, DEFAULT_FREE_TIMEOUT)
            .await
            .unwrap();

        let (replacement_near, mut replacement_far) = stream_pair();
        table
            .update_existing(&source, &destination, replacement_near)
            .await
            .expect("update_existing should succeed on a live slot");

        // The old source stream is shut down by the pipe task.
        let mut scratch = [0u8; 1];
        let n = old_source_far.read(&mut scratch).await.unwrap();
        assert_eq!(n, 0, "old source stream should be closed");

        // Traffic now flows through the replacement stream.
        replacement_far.write_all(b"again").await.unwrap();
        replacement_far.flush().await.unwrap();
        let mut buf = [0u8; 5];
        destination_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"again");

        // And the destination side was never disturbed.
        destination_far.write_all(b"reply").await.unwrap();
        destination_far.flush().await.unwrap();
        replacement_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"reply");

        table.shutdown().await;
    }

    #[tokio::test]
    async fn update_existing_without_a_slot_fails() {
        let table = SlotTable::new(8);
        let (source, destination) = key_pair();
        let (stream, _far) = stream_pair();

        assert_eq!(
            table.update_existing(&source, &destination, stream).await,
            Err(SlotError::NoSuchSlot)
        );

        table.shutdown().await;
    }

    #[tokio::test]
    async fn retired_key_can_be_reused() {
        let table = SlotTable::new(1);
        let (source, destination) = key_pair();

        let (source_near, source_far) = stream_pair();
        let (destination_near, _destination_far) = stream_pair();
        table
            .create_new(&source, &destination, source_near, destination_near, DEFAULT_FREE_TIMEOUT)
            .await
            .unwrap();

        drop(source_far);
        let retired = wait_until_retired(&table, &source, &destination).await;
        assert!(retired);

        let (source_near, _source_far) = stream_pair();
        let (destination_near, _destination_far) = stream_pair();
        table
            .create_new(&source, &destination, source_near, destination_near, DEFAULT_FREE_TIMEOUT)
            .await
            .expect("retired key should be reusable");

        table.shutdown().await;
    }
}
