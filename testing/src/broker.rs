//! In-memory stream broker with consumer-group semantics.
//!
//! [`InMemoryStreamBroker`] mirrors the behaviour the consumer relies on from a
//! real broker:
//!
//! - new entries are delivered to exactly one consumer of a group
//! - delivered entries sit in the group's PEL until acknowledged
//! - claims only succeed for entries idle at least `min_idle`, and bump the
//!   delivery count
//! - claiming an entry whose content was deleted drops its PEL row instead
//! - reads block until an append wakes them or the timeout elapses
//!
//! Idle times are measured with [`tokio::time::Instant`], so tests can run with
//! a paused clock and move time forward with `tokio::time::advance`.
//!
//! It also offers fault injection (failing reads, appends, acks or group
//! creation) and a `trim` operation that simulates retention deleting an entry
//! while it is still pending.

use relay_core::broker::{BrokerError, BrokerFuture, StreamBroker};
use relay_core::entry::{EntryId, PendingEntry, StartOffset, StreamEntry};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;
use tokio::time::Instant;

/// Broker operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// `create_group`
    CreateGroup,
    /// `read_group`
    Read,
    /// `pending` / `pending_entry` / `pending_count`
    Pending,
    /// `claim`
    Claim,
    /// `ack`
    Ack,
    /// `append`
    Append,
    /// `entry` / `latest` / `stream_len`
    Range,
}

#[derive(Debug, Clone)]
struct PelRow {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u64,
}

#[derive(Debug, Default)]
struct GroupState {
    last_delivered: EntryId,
    pel: BTreeMap<EntryId, PelRow>,
    ack_log: Vec<EntryId>,
}

#[derive(Debug, Default)]
struct StreamState {
    entries: BTreeMap<EntryId, BTreeMap<String, String>>,
    last_id: EntryId,
    groups: HashMap<String, GroupState>,
}

#[derive(Debug, Default)]
struct State {
    streams: HashMap<String, StreamState>,
    faults: HashMap<Operation, u32>,
    calls: HashMap<Operation, u64>,
}

impl State {
    fn record(&mut self, op: Operation) -> Result<(), BrokerError> {
        *self.calls.entry(op).or_default() += 1;
        match self.faults.get_mut(&op) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(BrokerError::Transport(format!("injected {op:?} failure")))
            },
            _ => Ok(()),
        }
    }

    fn group_mut(&mut self, stream: &str, group: &str) -> Result<&mut GroupState, BrokerError> {
        self.streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
            .ok_or_else(|| no_such_group(stream, group))
    }

    fn group(&self, stream: &str, group: &str) -> Result<&GroupState, BrokerError> {
        self.streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .ok_or_else(|| no_such_group(stream, group))
    }

    fn deliver_new(
        &mut self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        let state = self
            .streams
            .get_mut(stream)
            .ok_or_else(|| no_such_group(stream, group))?;
        let group_state = state
            .groups
            .get_mut(group)
            .ok_or_else(|| no_such_group(stream, group))?;

        let now = Instant::now();
        let delivered: Vec<StreamEntry> = state
            .entries
            .range(group_state.last_delivered.successor()..)
            .take(count)
            .map(|(id, fields)| StreamEntry::new(*id, fields.clone()))
            .collect();

        for entry in &delivered {
            group_state.pel.insert(
                entry.id,
                PelRow {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    delivery_count: 1,
                },
            );
            group_state.last_delivered = entry.id;
        }
        Ok(delivered)
    }
}

fn no_such_group(stream: &str, group: &str) -> BrokerError {
    BrokerError::NoSuchGroup {
        stream: stream.to_string(),
        group: group.to_string(),
    }
}

fn pending_row(id: EntryId, row: &PelRow, now: Instant) -> PendingEntry {
    PendingEntry {
        id,
        consumer: row.consumer.clone(),
        idle: now.saturating_duration_since(row.delivered_at),
        delivery_count: row.delivery_count,
    }
}

/// In-memory [`StreamBroker`] for fast, deterministic tests.
///
/// Cloning is cheap and every clone shares the same streams, so one handle can
/// be given to the code under test while another inspects the state.
///
/// # Example
///
/// ```
/// use relay_testing::InMemoryStreamBroker;
/// use relay_core::broker::StreamBroker;
/// use relay_core::entry::StartOffset;
/// use std::collections::BTreeMap;
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = InMemoryStreamBroker::new();
/// broker.create_group("orders", "billing", StartOffset::Beginning).await?;
/// broker.append("orders", &BTreeMap::from([("k".to_string(), "v".to_string())])).await?;
///
/// let batch = broker
///     .read_group("orders", "billing", "c1", 10, Duration::ZERO)
///     .await?;
/// assert_eq!(batch.len(), 1);
/// assert_eq!(broker.pending_ids("orders", "billing"), vec![batch[0].id]);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct InMemoryStreamBroker {
    state: Arc<Mutex<State>>,
    appended: Arc<Notify>,
}

impl InMemoryStreamBroker {
    /// Create an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `times` calls of `op` fail with a transport error.
    pub fn fail_next(&self, op: Operation, times: u32) {
        self.lock().faults.insert(op, times);
    }

    /// How many times `op` has been called (including injected failures).
    #[must_use]
    pub fn call_count(&self, op: Operation) -> u64 {
        self.lock().calls.get(&op).copied().unwrap_or_default()
    }

    /// Delete an entry's content while leaving any PEL rows in place,
    /// as stream retention would. The rows go away on the next claim.
    pub fn trim(&self, stream: &str, id: EntryId) {
        if let Some(state) = self.lock().streams.get_mut(stream) {
            state.entries.remove(&id);
        }
    }

    /// Ids currently in the group's PEL, in id order.
    #[must_use]
    pub fn pending_ids(&self, stream: &str, group: &str) -> Vec<EntryId> {
        self.lock()
            .group(stream, group)
            .map(|g| g.pel.keys().copied().collect())
            .unwrap_or_default()
    }

    /// PEL row of `id`, measured now.
    #[must_use]
    pub fn pending_row(&self, stream: &str, group: &str, id: EntryId) -> Option<PendingEntry> {
        let now = Instant::now();
        self.lock()
            .group(stream, group)
            .ok()
            .and_then(|g| g.pel.get(&id).map(|row| pending_row(id, row, now)))
    }

    /// Ids acknowledged on the group, in acknowledgement order.
    #[must_use]
    pub fn acked(&self, stream: &str, group: &str) -> Vec<EntryId> {
        self.lock()
            .group(stream, group)
            .map(|g| g.ack_log.clone())
            .unwrap_or_default()
    }

    /// All entries of a stream, oldest first.
    #[must_use]
    pub fn entries(&self, stream: &str) -> Vec<StreamEntry> {
        self.lock()
            .streams
            .get(stream)
            .map(|s| {
                s.entries
                    .iter()
                    .map(|(id, fields)| StreamEntry::new(*id, fields.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of groups defined on a stream.
    #[must_use]
    pub fn group_count(&self, stream: &str) -> usize {
        self.lock()
            .streams
            .get(stream)
            .map_or(0, |s| s.groups.len())
    }

    fn next_id(last: EntryId) -> EntryId {
        #[allow(clippy::cast_possible_truncation)]
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as u64);
        if now_ms > last.millis() {
            EntryId::new(now_ms, 0)
        } else {
            last.successor()
        }
    }
}

impl StreamBroker for InMemoryStreamBroker {
    fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: StartOffset,
    ) -> BrokerFuture<'_, ()> {
        let stream = stream.to_string();
        let group = group.to_string();
        Box::pin(async move {
            let mut state = self.lock();
            state.record(Operation::CreateGroup)?;
            let stream_state = state.streams.entry(stream.clone()).or_default();
            if stream_state.groups.contains_key(&group) {
                return Err(BrokerError::GroupAlreadyExists { stream, group });
            }
            let last_delivered = match start {
                StartOffset::Beginning => EntryId::MIN,
                StartOffset::Latest => stream_state.last_id,
                StartOffset::After(id) => id,
            };
            stream_state.groups.insert(
                group,
                GroupState {
                    last_delivered,
                    ..GroupState::default()
                },
            );
            Ok(())
        })
    }

    fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> BrokerFuture<'_, Vec<StreamEntry>> {
        let stream = stream.to_string();
        let group = group.to_string();
        let consumer = consumer.to_string();
        Box::pin(async move {
            self.lock().record(Operation::Read)?;
            let deadline = Instant::now() + block;
            loop {
                // Register interest before checking so an append between the
                // check and the wait is not missed.
                let notified = self.appended.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                let delivered = self.lock().deliver_new(&stream, &group, &consumer, count)?;
                if !delivered.is_empty() {
                    return Ok(delivered);
                }
                if tokio::time::timeout_at(deadline, notified).await.is_err() {
                    return Ok(Vec::new());
                }
            }
        })
    }

    fn pending(
        &self,
        stream: &str,
        group: &str,
        min_idle: Duration,
        count: usize,
    ) -> BrokerFuture<'_, Vec<PendingEntry>> {
        let stream = stream.to_string();
        let group = group.to_string();
        Box::pin(async move {
            let mut state = self.lock();
            state.record(Operation::Pending)?;
            let now = Instant::now();
            Ok(state
                .group(&stream, &group)?
                .pel
                .iter()
                .map(|(id, row)| pending_row(*id, row, now))
                .filter(|row| row.idle >= min_idle)
                .take(count)
                .collect())
        })
    }

    fn pending_entry(
        &self,
        stream: &str,
        group: &str,
        id: EntryId,
    ) -> BrokerFuture<'_, Option<PendingEntry>> {
        let stream = stream.to_string();
        let group = group.to_string();
        Box::pin(async move {
            let mut state = self.lock();
            state.record(Operation::Pending)?;
            let now = Instant::now();
            Ok(state
                .group(&stream, &group)?
                .pel
                .get(&id)
                .map(|row| pending_row(id, row, now)))
        })
    }

    fn pending_count(&self, stream: &str, group: &str) -> BrokerFuture<'_, u64> {
        let stream = stream.to_string();
        let group = group.to_string();
        Box::pin(async move {
            let mut state = self.lock();
            state.record(Operation::Pending)?;
            Ok(state.group(&stream, &group)?.pel.len() as u64)
        })
    }

    fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[EntryId],
    ) -> BrokerFuture<'_, Vec<StreamEntry>> {
        let stream = stream.to_string();
        let group = group.to_string();
        let consumer = consumer.to_string();
        let ids = ids.to_vec();
        Box::pin(async move {
            let mut state = self.lock();
            state.record(Operation::Claim)?;
            let stream_state = state
                .streams
                .get_mut(&stream)
                .ok_or_else(|| no_such_group(&stream, &group))?;
            let group_state = stream_state
                .groups
                .get_mut(&group)
                .ok_or_else(|| no_such_group(&stream, &group))?;

            let now = Instant::now();
            let mut claimed = Vec::new();
            for id in ids {
                let Some(row) = group_state.pel.get_mut(&id) else {
                    continue;
                };
                if now.saturating_duration_since(row.delivered_at) < min_idle {
                    continue;
                }
                let Some(fields) = stream_state.entries.get(&id) else {
                    group_state.pel.remove(&id);
                    continue;
                };
                row.consumer.clone_from(&consumer);
                row.delivered_at = now;
                row.delivery_count += 1;
                claimed.push(StreamEntry::new(id, fields.clone()));
            }
            Ok(claimed)
        })
    }

    fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> BrokerFuture<'_, u64> {
        let stream = stream.to_string();
        let group = group.to_string();
        let ids = ids.to_vec();
        Box::pin(async move {
            let mut state = self.lock();
            state.record(Operation::Ack)?;
            let group_state = state.group_mut(&stream, &group)?;
            let mut removed = 0;
            for id in ids {
                if group_state.pel.remove(&id).is_some() {
                    group_state.ack_log.push(id);
                    removed += 1;
                }
            }
            Ok(removed)
        })
    }

    fn append(
        &self,
        stream: &str,
        fields: &BTreeMap<String, String>,
    ) -> BrokerFuture<'_, EntryId> {
        let stream = stream.to_string();
        let fields = fields.clone();
        Box::pin(async move {
            let id = {
                let mut state = self.lock();
                state.record(Operation::Append)?;
                let stream_state = state.streams.entry(stream).or_default();
                let id = Self::next_id(stream_state.last_id);
                stream_state.last_id = id;
                stream_state.entries.insert(id, fields);
                id
            };
            self.appended.notify_waiters();
            Ok(id)
        })
    }

    fn entry(&self, stream: &str, id: EntryId) -> BrokerFuture<'_, Option<StreamEntry>> {
        let stream = stream.to_string();
        Box::pin(async move {
            let mut state = self.lock();
            state.record(Operation::Range)?;
            Ok(state
                .streams
                .get(&stream)
                .and_then(|s| s.entries.get(&id))
                .map(|fields| StreamEntry::new(id, fields.clone())))
        })
    }

    fn latest(&self, stream: &str, count: usize) -> BrokerFuture<'_, Vec<StreamEntry>> {
        let stream = stream.to_string();
        Box::pin(async move {
            let mut state = self.lock();
            state.record(Operation::Range)?;
            Ok(state
                .streams
                .get(&stream)
                .map(|s| {
                    s.entries
                        .iter()
                        .rev()
                        .take(count)
                        .map(|(id, fields)| StreamEntry::new(*id, fields.clone()))
                        .collect()
                })
                .unwrap_or_default())
        })
    }

    fn stream_len(&self, stream: &str) -> BrokerFuture<'_, u64> {
        let stream = stream.to_string();
        Box::pin(async move {
            let mut state = self.lock();
            state.record(Operation::Range)?;
            Ok(state
                .streams
                .get(&stream)
                .map_or(0, |s| s.entries.len() as u64))
        })
    }
}
