//! The event hub: per-client bounded buffers, filters, heartbeats, and replay rings.
//!
//! Many small per-subscriber queues rather than one shared broadcast channel, so overflow on a
//! slow client never affects anyone else (§9 Design Notes: "prefer many small per-subscriber
//! buffers over one shared queue").

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Event, EventKind, SequenceCounter};

const DEFAULT_CLIENT_BUFFER: usize = 256;
const DEFAULT_RING_SIZE: usize = 1024;
const DEFAULT_HEARTBEAT_SECS: u64 = 30;
const MAX_MISSED_HEARTBEATS: u32 = 2;

/// What a client wants to receive. Applied at publish time (§4.2) so filtered-out events never
/// touch a client's queue at all.
#[derive(Debug, Clone, Default)]
pub struct ClientFilter {
    pub op_id: Option<Uuid>,
    pub stage_id: Option<String>,
    pub kinds: Option<Vec<&'static str>>,
}

impl ClientFilter {
    pub fn for_operation(op_id: Uuid) -> Self {
        Self {
            op_id: Some(op_id),
            stage_id: None,
            kinds: None,
        }
    }

    fn matches(&self, event: &Event) -> bool {
        if let Some(op_id) = self.op_id {
            if event.op_id != op_id {
                return false;
            }
        }
        if let Some(stage_id) = &self.stage_id {
            if event.stage_id.as_deref() != Some(stage_id.as_str()) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            let kind_name = event_kind_name(&event.kind);
            if !kinds.contains(&kind_name) {
                return false;
            }
        }
        true
    }
}

fn event_kind_name(kind: &EventKind) -> &'static str {
    match kind {
        EventKind::StageStart => "stage_start",
        EventKind::Progress { .. } => "progress",
        EventKind::StageComplete => "stage_complete",
        EventKind::OperationComplete => "operation_complete",
        EventKind::Error { .. } => "error",
        EventKind::Heartbeat => "heartbeat",
        EventKind::DroppedEvents { .. } => "dropped_events",
    }
}

struct ClientQueue {
    buffer: Mutex<VecDeque<Event>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
    missed_heartbeats: AtomicU32,
    filter: Mutex<ClientFilter>,
    closed: std::sync::atomic::AtomicBool,
}

impl ClientQueue {
    fn push(&self, event: Event) {
        let mut buffer = self.buffer.lock();
        if buffer.len() >= self.capacity {
            buffer.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        buffer.push_back(event);
        drop(buffer);
        self.notify.notify_one();
    }

    fn push_front_priority(&self, event: Event) {
        // Used for the hub-generated dropped_events summary so it is observed promptly even if
        // the buffer is saturated with regular traffic.
        let mut buffer = self.buffer.lock();
        buffer.push_back(event);
        if buffer.len() > self.capacity {
            buffer.pop_front();
        }
        drop(buffer);
        self.notify.notify_one();
    }
}

/// A subscription handle returned by [`Hub::subscribe`]. Dropping it unsubscribes.
pub struct ClientHandle {
    id: Uuid,
    hub: Arc<HubInner>,
    queue: Arc<ClientQueue>,
}

impl ClientHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Wait for and return the next event for this client, or `None` if the hub closed the
    /// connection (heartbeat timeout or explicit `close`).
    pub async fn recv(&self) -> Option<Event> {
        loop {
            if self.queue.closed.load(Ordering::Relaxed) {
                return None;
            }
            if let Some(event) = self.queue.buffer.lock().pop_front() {
                return Some(event);
            }
            self.queue.notify.notified().await;
        }
    }

    /// Record a client-side pong, resetting the missed-heartbeat counter (§4.2).
    pub fn record_pong(&self) {
        self.queue.missed_heartbeats.store(0, Ordering::Relaxed);
    }

    pub fn update_filter(&self, filter: ClientFilter) {
        *self.queue.filter.lock() = filter;
    }

    /// Replay from an in-memory ring starting at `from_seq` (inclusive), or report the gap if
    /// evicted (§4.2 Reconnection, §8 S5).
    pub fn resume(&self, op_id: Uuid, from_seq: u64) -> ResumeOutcome {
        self.hub.resume(op_id, from_seq)
    }
}

impl Drop for ClientHandle {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.id);
    }
}

pub enum ResumeOutcome {
    Replayed(Vec<Event>),
    Gap { earliest_available: u64 },
}

struct Ring {
    events: VecDeque<Event>,
    capacity: usize,
    counter: Arc<SequenceCounter>,
}

impl Ring {
    fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity,
            counter: Arc::new(SequenceCounter::default()),
        }
    }

    fn push(&mut self, event: Event) {
        if self.events.len() >= self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    fn replay_from(&self, from_seq: u64) -> ResumeOutcome {
        match self.events.front() {
            Some(earliest) if earliest.seq > from_seq => ResumeOutcome::Gap {
                earliest_available: earliest.seq,
            },
            _ => {
                let replayed = self
                    .events
                    .iter()
                    .filter(|e| e.seq >= from_seq)
                    .cloned()
                    .collect();
                ResumeOutcome::Replayed(replayed)
            }
        }
    }
}

struct HubInner {
    clients: Mutex<HashMap<Uuid, Arc<ClientQueue>>>,
    rings: Mutex<HashMap<Uuid, Ring>>,
    client_buffer_capacity: usize,
    ring_capacity: usize,
}

impl HubInner {
    fn unsubscribe(&self, id: Uuid) {
        self.clients.lock().remove(&id);
    }

    fn resume(&self, op_id: Uuid, from_seq: u64) -> ResumeOutcome {
        let rings = self.rings.lock();
        match rings.get(&op_id) {
            Some(ring) => ring.replay_from(from_seq),
            None => ResumeOutcome::Replayed(Vec::new()),
        }
    }
}

/// Cheaply cloneable handle to the hub; the only way publishers (Manager, stages) reach it.
#[derive(Clone)]
pub struct HubHandle(Arc<HubInner>);

impl HubHandle {
    /// Publish an event. Assigns the per-operation sequence number, appends to that operation's
    /// replay ring, then fans out to matching, non-closed clients. Never blocks: full client
    /// buffers drop their oldest entry instead (§4.2).
    pub fn publish(&self, op_id: Uuid, stage_id: Option<String>, kind: EventKind, trace_id: String) -> Event {
        let seq = {
            let mut rings = self.0.rings.lock();
            let ring = rings
                .entry(op_id)
                .or_insert_with(|| Ring::new(self.0.ring_capacity));
            let seq = ring.counter.next();
            let event = Event {
                seq,
                op_id,
                stage_id: stage_id.clone(),
                kind: kind.clone(),
                ts: Utc::now(),
                trace_id: trace_id.clone(),
            };
            ring.push(event.clone());
            seq
        };

        let event = Event {
            seq,
            op_id,
            stage_id,
            kind,
            ts: Utc::now(),
            trace_id,
        };

        let clients: Vec<Arc<ClientQueue>> = self.0.clients.lock().values().cloned().collect();
        for client in clients {
            if client.closed.load(Ordering::Relaxed) {
                continue;
            }
            if !client.filter.lock().matches(&event) {
                continue;
            }
            let dropped_before = client.dropped.load(Ordering::Relaxed);
            client.push(event.clone());
            let dropped_after = client.dropped.load(Ordering::Relaxed);
            if dropped_after > dropped_before {
                // One summary event per overflow window, not one per dropped event.
                client.push_front_priority(Event {
                    seq: event.seq,
                    op_id: event.op_id,
                    stage_id: None,
                    kind: EventKind::DroppedEvents {
                        count: dropped_after,
                    },
                    ts: Utc::now(),
                    trace_id: "hub".to_string(),
                });
            }
        }

        event
    }

    pub fn subscribe(&self, filter: ClientFilter) -> ClientHandle {
        let id = Uuid::new_v4();
        let queue = Arc::new(ClientQueue {
            buffer: Mutex::new(VecDeque::with_capacity(self.0.client_buffer_capacity)),
            notify: Notify::new(),
            capacity: self.0.client_buffer_capacity,
            dropped: AtomicU64::new(0),
            missed_heartbeats: AtomicU32::new(0),
            filter: Mutex::new(filter),
            closed: std::sync::atomic::AtomicBool::new(false),
        });
        self.0.clients.lock().insert(id, queue.clone());
        debug!(client_id = %id, "subscribed to event hub");
        ClientHandle {
            id,
            hub: self.0.clone(),
            queue,
        }
    }
}

/// Owns the client registry, replay rings, and the background heartbeat/eviction ticker.
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    pub fn new() -> Self {
        Self::with_capacities(DEFAULT_CLIENT_BUFFER, DEFAULT_RING_SIZE)
    }

    pub fn with_capacities(client_buffer_capacity: usize, ring_capacity: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                clients: Mutex::new(HashMap::new()),
                rings: Mutex::new(HashMap::new()),
                client_buffer_capacity,
                ring_capacity,
            }),
        }
    }

    pub fn handle(&self) -> HubHandle {
        HubHandle(self.inner.clone())
    }

    pub fn subscribe(&self, filter: ClientFilter) -> ClientHandle {
        let id = Uuid::new_v4();
        let queue = Arc::new(ClientQueue {
            buffer: Mutex::new(VecDeque::with_capacity(self.inner.client_buffer_capacity)),
            notify: Notify::new(),
            capacity: self.inner.client_buffer_capacity,
            dropped: AtomicU64::new(0),
            missed_heartbeats: AtomicU32::new(0),
            filter: Mutex::new(filter),
            closed: std::sync::atomic::AtomicBool::new(false),
        });
        self.inner.clients.lock().insert(id, queue.clone());
        debug!(client_id = %id, "subscribed to event hub");
        ClientHandle {
            id,
            hub: self.inner.clone(),
            queue,
        }
    }

    /// Spawn the background heartbeat ticker. Runs for the lifetime of the returned task handle;
    /// the caller (main) typically lets it run until process shutdown.
    pub fn spawn_heartbeat_ticker(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let clients: Vec<(Uuid, Arc<ClientQueue>)> =
                    inner.clients.lock().iter().map(|(k, v)| (*k, v.clone())).collect();
                for (id, client) in clients {
                    let missed = client.missed_heartbeats.fetch_add(1, Ordering::Relaxed) + 1;
                    if missed > MAX_MISSED_HEARTBEATS {
                        warn!(client_id = %id, "closing client after missed heartbeats");
                        client.closed.store(true, Ordering::Relaxed);
                        client.notify.notify_one();
                        inner.clients.lock().remove(&id);
                        continue;
                    }
                    client.push(Event {
                        seq: 0,
                        op_id: Uuid::nil(),
                        stage_id: None,
                        kind: EventKind::Heartbeat,
                        ts: Utc::now(),
                        trace_id: "hub".to_string(),
                    });
                }
            }
        })
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(pct: u8) -> EventKind {
        EventKind::Progress {
            pct,
            message: None,
            meta: None,
        }
    }

    #[tokio::test]
    async fn events_are_delivered_in_publish_order_per_operation() {
        let hub = Hub::new();
        let handle = hub.handle();
        let op_id = Uuid::new_v4();
        let client = hub.subscribe(ClientFilter::for_operation(op_id));

        for pct in [10, 20, 30] {
            handle.publish(op_id, Some("scrape".to_string()), progress(pct), "t".to_string());
        }

        let mut seen = Vec::new();
        for _ in 0..3 {
            let event = client.recv().await.unwrap();
            seen.push(event.seq);
        }
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn filter_excludes_other_operations() {
        let hub = Hub::new();
        let handle = hub.handle();
        let watched = Uuid::new_v4();
        let other = Uuid::new_v4();
        let client = hub.subscribe(ClientFilter::for_operation(watched));

        handle.publish(other, None, EventKind::StageStart, "t".to_string());
        handle.publish(watched, None, EventKind::StageStart, "t".to_string());

        let event = client.recv().await.unwrap();
        assert_eq!(event.op_id, watched);
    }

    #[tokio::test]
    async fn overflow_emits_single_dropped_events_summary() {
        let hub = Hub::with_capacities(4, 64);
        let handle = hub.handle();
        let op_id = Uuid::new_v4();
        let client = hub.subscribe(ClientFilter::for_operation(op_id));

        for pct in 0..10u8 {
            handle.publish(op_id, None, progress(pct), "t".to_string());
        }

        let mut saw_summary = 0;
        while let Some(event) = {
            let mut buf = client.queue.buffer.lock();
            buf.pop_front()
        } {
            if matches!(event.kind, EventKind::DroppedEvents { .. }) {
                saw_summary += 1;
            }
        }
        assert_eq!(saw_summary, 1);
    }

    #[tokio::test]
    async fn resume_replays_from_sequence() {
        let hub = Hub::new();
        let handle = hub.handle();
        let op_id = Uuid::new_v4();
        let client = hub.subscribe(ClientFilter::for_operation(op_id));

        for pct in 0..5u8 {
            handle.publish(op_id, None, progress(pct), "t".to_string());
        }

        match client.resume(op_id, 2) {
            ResumeOutcome::Replayed(events) => {
                assert!(events.iter().all(|e| e.seq >= 2));
                assert_eq!(events.len(), 3);
            }
            ResumeOutcome::Gap { .. } => panic!("expected replay, not gap"),
        }
    }

    #[tokio::test]
    async fn resume_reports_gap_when_evicted() {
        let hub = Hub::with_capacities(256, 3);
        let handle = hub.handle();
        let op_id = Uuid::new_v4();
        let client = hub.subscribe(ClientFilter::for_operation(op_id));

        for pct in 0..10u8 {
            handle.publish(op_id, None, progress(pct), "t".to_string());
        }

        match client.resume(op_id, 0) {
            ResumeOutcome::Gap { earliest_available } => {
                assert!(earliest_available > 0);
            }
            ResumeOutcome::Replayed(_) => panic!("expected gap"),
        }
    }
}
