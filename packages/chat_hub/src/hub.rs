//! Hub event loop
//!
//! The [`HubRunner`] is the single owner of room membership. Every mutation
//! and every broadcast goes through one of its command channels and is
//! applied sequentially, so the membership map is never shared.

use bytes::Bytes;
use serde::Serialize;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::connection::{Connection, ConnectionId, SendOutcome, WeakConnection};
use crate::{ChatId, UserId};

/// Command channel capacities.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub register_capacity: usize,
    pub unregister_capacity: usize,
    pub subscribe_capacity: usize,
    pub broadcast_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            register_capacity: 64,
            unregister_capacity: 64,
            subscribe_capacity: 64,
            broadcast_capacity: 256,
        }
    }
}

struct SubscribeCmd {
    conn: Connection,
    chat_ids: Vec<ChatId>,
}

struct BroadcastCmd {
    chat_id: ChatId,
    payload: Bytes,
    exclude_user: Option<UserId>,
}

enum Command {
    Register(Connection),
    Unregister(Connection),
    Subscribe(SubscribeCmd),
    Broadcast(BroadcastCmd),
}

enum HubQuery {
    Stats {
        respond_to: oneshot::Sender<HubStats>,
    },
    RoomMembers {
        chat_id: ChatId,
        respond_to: oneshot::Sender<Vec<ConnectionId>>,
    },
}

/// Point-in-time view of the hub.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    /// Rooms with at least one member
    pub rooms: usize,
    /// Connections currently known to the hub
    pub connections: usize,
    pub payloads_delivered: u64,
    /// Payloads discarded because a recipient queue was full or closed
    pub payloads_dropped: u64,
}

/// Per-broadcast delivery tally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: usize,
    pub excluded: usize,
}

/// Cloneable handle used by producers. All operations are fire-and-forget.
#[derive(Clone)]
pub struct Hub {
    register_tx: mpsc::Sender<Connection>,
    unregister_tx: mpsc::Sender<Connection>,
    subscribe_tx: mpsc::Sender<SubscribeCmd>,
    broadcast_tx: mpsc::Sender<BroadcastCmd>,
    query_tx: mpsc::Sender<HubQuery>,
}

impl Hub {
    /// Build a handle and the runner that serves it. The runner must be
    /// driven with [`HubRunner::run`].
    pub fn new(config: HubConfig) -> (Self, HubRunner) {
        let (register_tx, register) = mpsc::channel(config.register_capacity.max(1));
        let (unregister_tx, unregister) = mpsc::channel(config.unregister_capacity.max(1));
        let (subscribe_tx, subscribe) = mpsc::channel(config.subscribe_capacity.max(1));
        let (broadcast_tx, broadcast) = mpsc::channel(config.broadcast_capacity.max(1));
        let (query_tx, queries) = mpsc::channel(16);

        let hub = Self {
            register_tx,
            unregister_tx,
            subscribe_tx,
            broadcast_tx,
            query_tx,
        };
        let runner = HubRunner {
            commands: CommandReceivers {
                register,
                unregister,
                subscribe,
                broadcast,
            },
            queries,
            registry: RoomRegistry::default(),
        };
        (hub, runner)
    }

    /// Build a hub and spawn its runner on the current tokio runtime.
    pub fn spawn(config: HubConfig) -> Self {
        let (hub, runner) = Self::new(config);
        tokio::spawn(runner.run());
        hub
    }

    pub async fn register(&self, conn: &Connection) {
        if self.register_tx.send(conn.clone()).await.is_err() {
            debug!(conn_id = %conn.id(), "hub is gone, register ignored");
        }
    }

    /// Remove `conn` from every room and close its outbound queue.
    pub async fn unregister(&self, conn: &Connection) {
        if self.unregister_tx.send(conn.clone()).await.is_err() {
            debug!(conn_id = %conn.id(), "hub is gone, closing queue directly");
            conn.close_send();
        }
    }

    pub async fn subscribe(&self, conn: &Connection, chat_ids: Vec<ChatId>) {
        let cmd = SubscribeCmd {
            conn: conn.clone(),
            chat_ids,
        };
        if self.subscribe_tx.send(cmd).await.is_err() {
            debug!(conn_id = %conn.id(), "hub is gone, subscribe ignored");
        }
    }

    /// Fan `payload` out to every connection subscribed to `chat_id`.
    pub async fn broadcast(&self, chat_id: ChatId, payload: Bytes) {
        self.send_broadcast(chat_id, payload, None).await;
    }

    /// Like [`Hub::broadcast`], skipping every connection owned by `user_id`.
    pub async fn broadcast_except_user(&self, chat_id: ChatId, payload: Bytes, user_id: UserId) {
        self.send_broadcast(chat_id, payload, Some(user_id)).await;
    }

    async fn send_broadcast(&self, chat_id: ChatId, payload: Bytes, exclude_user: Option<UserId>) {
        let cmd = BroadcastCmd {
            chat_id,
            payload,
            exclude_user,
        };
        if self.broadcast_tx.send(cmd).await.is_err() {
            debug!(chat_id, "hub is gone, broadcast ignored");
        }
    }

    /// Snapshot of the hub. Answered only after every command already queued
    /// on the hub has been applied. `None` if the hub has stopped.
    pub async fn stats(&self) -> Option<HubStats> {
        let (tx, rx) = oneshot::channel();
        self.query_tx
            .send(HubQuery::Stats { respond_to: tx })
            .await
            .ok()?;
        rx.await.ok()
    }

    /// Connections currently subscribed to `chat_id`, sorted. Empty when the
    /// room does not exist. Same ordering guarantee as [`Hub::stats`].
    pub async fn room_members(&self, chat_id: ChatId) -> Vec<ConnectionId> {
        let (tx, rx) = oneshot::channel();
        if self
            .query_tx
            .send(HubQuery::RoomMembers {
                chat_id,
                respond_to: tx,
            })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

struct CommandReceivers {
    register: mpsc::Receiver<Connection>,
    unregister: mpsc::Receiver<Connection>,
    subscribe: mpsc::Receiver<SubscribeCmd>,
    broadcast: mpsc::Receiver<BroadcastCmd>,
}

impl CommandReceivers {
    /// Next command from whichever channel is ready. No channel has priority.
    async fn next(&mut self) -> Option<Command> {
        tokio::select! {
            Some(conn) = self.register.recv() => Some(Command::Register(conn)),
            Some(conn) = self.unregister.recv() => Some(Command::Unregister(conn)),
            Some(cmd) = self.subscribe.recv() => Some(Command::Subscribe(cmd)),
            Some(cmd) = self.broadcast.recv() => Some(Command::Broadcast(cmd)),
            else => None,
        }
    }
}

/// The hub's event loop. Owns the room registry exclusively.
pub struct HubRunner {
    commands: CommandReceivers,
    queries: mpsc::Receiver<HubQuery>,
    registry: RoomRegistry,
}

impl HubRunner {
    /// Process commands until every [`Hub`] handle has been dropped.
    pub async fn run(mut self) {
        debug!("hub started");
        loop {
            tokio::select! {
                biased;
                Some(cmd) = self.commands.next() => self.registry.apply(cmd),
                Some(query) = self.queries.recv() => self.registry.answer(query),
                else => break,
            }
        }
        debug!("hub stopped, all handles dropped");
    }
}

#[derive(Default)]
struct RoomRegistry {
    rooms: HashMap<ChatId, HashMap<ConnectionId, WeakConnection>>,
    /// Reverse index: the rooms each known connection is subscribed to.
    subscriptions: HashMap<ConnectionId, HashSet<ChatId>>,
    payloads_delivered: u64,
    payloads_dropped: u64,
}

impl RoomRegistry {
    fn apply(&mut self, cmd: Command) {
        match cmd {
            Command::Register(conn) => self.register(&conn),
            Command::Unregister(conn) => self.unregister(&conn),
            Command::Subscribe(SubscribeCmd { conn, chat_ids }) => {
                self.subscribe(&conn, &chat_ids)
            }
            Command::Broadcast(BroadcastCmd {
                chat_id,
                payload,
                exclude_user,
            }) => {
                let report = self.broadcast(chat_id, &payload, exclude_user);
                trace!(
                    chat_id,
                    delivered = report.delivered,
                    dropped = report.dropped,
                    excluded = report.excluded,
                    "broadcast"
                );
                if report.dropped > 0 {
                    warn!(chat_id, dropped = report.dropped, "slow consumers missed a broadcast");
                }
            }
        }
    }

    fn answer(&self, query: HubQuery) {
        match query {
            HubQuery::Stats { respond_to } => {
                let _ = respond_to.send(self.stats());
            }
            HubQuery::RoomMembers {
                chat_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.members(chat_id));
            }
        }
    }

    fn register(&mut self, conn: &Connection) {
        // A connection unregistered before its register arrived stays out
        if conn.is_closed() {
            return;
        }
        self.subscriptions.entry(conn.id()).or_default();
        debug!(conn_id = %conn.id(), user_id = conn.user_id(), "connection registered");
    }

    fn unregister(&mut self, conn: &Connection) {
        if let Some(chat_ids) = self.subscriptions.remove(&conn.id()) {
            for chat_id in chat_ids {
                self.leave(chat_id, conn.id());
            }
            debug!(conn_id = %conn.id(), "connection unregistered");
        }
        conn.close_send();
    }

    fn subscribe(&mut self, conn: &Connection, chat_ids: &[ChatId]) {
        if conn.is_closed() {
            debug!(conn_id = %conn.id(), "subscribe for closed connection ignored");
            return;
        }
        let subscribed = self.subscriptions.entry(conn.id()).or_default();
        for &chat_id in chat_ids {
            self.rooms
                .entry(chat_id)
                .or_default()
                .insert(conn.id(), conn.downgrade());
            subscribed.insert(chat_id);
        }
        debug!(conn_id = %conn.id(), ?chat_ids, "connection subscribed");
    }

    fn broadcast(
        &mut self,
        chat_id: ChatId,
        payload: &Bytes,
        exclude_user: Option<UserId>,
    ) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let Some(room) = self.rooms.get(&chat_id) else {
            return report;
        };

        let mut gone = Vec::new();
        for (&id, member) in room {
            if exclude_user == Some(member.user_id()) {
                report.excluded += 1;
                continue;
            }
            let Some(conn) = member.upgrade() else {
                gone.push(id);
                continue;
            };
            match conn.send(payload.clone()) {
                SendOutcome::Queued => report.delivered += 1,
                SendOutcome::Dropped | SendOutcome::Closed => report.dropped += 1,
            }
        }

        // Handles dropped without an unregister
        for id in gone {
            self.evict(id);
        }

        self.payloads_delivered += report.delivered as u64;
        self.payloads_dropped += report.dropped as u64;
        report
    }

    fn leave(&mut self, chat_id: ChatId, id: ConnectionId) {
        if let Entry::Occupied(mut room) = self.rooms.entry(chat_id) {
            room.get_mut().remove(&id);
            if room.get().is_empty() {
                room.remove();
            }
        }
    }

    fn evict(&mut self, id: ConnectionId) {
        if let Some(chat_ids) = self.subscriptions.remove(&id) {
            for chat_id in chat_ids {
                self.leave(chat_id, id);
            }
        }
    }

    fn members(&self, chat_id: ChatId) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self
            .rooms
            .get(&chat_id)
            .map(|room| room.keys().copied().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    fn stats(&self) -> HubStats {
        HubStats {
            rooms: self.rooms.len(),
            connections: self.subscriptions.len(),
            payloads_delivered: self.payloads_delivered,
            payloads_dropped: self.payloads_dropped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(s: &'static str) -> Bytes {
        Bytes::from_static(s.as_bytes())
    }

    fn drain(rx: &mut mpsc::Receiver<Bytes>) -> Vec<Bytes> {
        let mut out = Vec::new();
        while let Ok(b) = rx.try_recv() {
            out.push(b);
        }
        out
    }

    // --- registry (synchronous) ---

    #[test]
    fn rooms_are_isolated() {
        let mut reg = RoomRegistry::default();
        let (a, mut rx_a) = Connection::new(1);
        let (b, mut rx_b) = Connection::new(2);
        reg.subscribe(&a, &[10]);
        reg.subscribe(&b, &[20]);

        let report = reg.broadcast(20, &payload("for-20"), None);
        assert_eq!(report.delivered, 1);

        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(drain(&mut rx_b), vec![payload("for-20")]);
    }

    #[test]
    fn exclusion_skips_every_connection_of_the_user() {
        let mut reg = RoomRegistry::default();
        let (a1, mut rx_a1) = Connection::new(1);
        let (a2, mut rx_a2) = Connection::new(1);
        let (b, mut rx_b) = Connection::new(2);
        for c in [&a1, &a2, &b] {
            reg.subscribe(c, &[5]);
        }

        let report = reg.broadcast(5, &payload("hi"), Some(1));
        assert_eq!(report.excluded, 2);
        assert_eq!(report.delivered, 1);
        assert!(drain(&mut rx_a1).is_empty());
        assert!(drain(&mut rx_a2).is_empty());
        assert_eq!(drain(&mut rx_b).len(), 1);
    }

    #[test]
    fn duplicate_subscriptions_are_idempotent() {
        let mut reg = RoomRegistry::default();
        let (a, mut rx) = Connection::new(1);
        reg.subscribe(&a, &[3, 3]);
        reg.subscribe(&a, &[3]);

        assert_eq!(reg.members(3), vec![a.id()]);
        reg.broadcast(3, &payload("once"), None);
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn unregister_removes_empty_rooms_and_closes_queue() {
        let mut reg = RoomRegistry::default();
        let (a, mut rx_a) = Connection::new(1);
        let (b, _rx_b) = Connection::new(2);
        reg.register(&a);
        reg.subscribe(&a, &[1, 2]);
        reg.subscribe(&b, &[2]);

        reg.unregister(&a);

        assert!(a.is_closed());
        assert!(!reg.rooms.contains_key(&1));
        assert_eq!(reg.members(2), vec![b.id()]);
        assert_eq!(reg.stats().connections, 1);

        reg.broadcast(2, &payload("after"), None);
        assert!(drain(&mut rx_a).is_empty());

        // Second unregister is a no-op
        reg.unregister(&a);
        assert_eq!(reg.stats().rooms, 1);
    }

    #[test]
    fn subscribe_after_unregister_is_ignored() {
        let mut reg = RoomRegistry::default();
        let (a, _rx) = Connection::new(1);
        reg.unregister(&a);
        reg.subscribe(&a, &[9]);
        reg.register(&a);
        assert!(reg.members(9).is_empty());
        assert_eq!(reg.stats(), HubStats::default());
    }

    #[test]
    fn broadcast_to_missing_room_is_a_noop() {
        let mut reg = RoomRegistry::default();
        let report = reg.broadcast(404, &payload("nobody"), None);
        assert_eq!(report, BroadcastReport::default());
    }

    #[test]
    fn full_queue_does_not_block_other_members() {
        let mut reg = RoomRegistry::default();
        let (slow, _slow_rx) = Connection::with_capacity(1, 2);
        let (fast, mut fast_rx) = Connection::new(2);
        reg.subscribe(&slow, &[8]);
        reg.subscribe(&fast, &[8]);

        for _ in 0..5 {
            reg.broadcast(8, &payload("tick"), None);
        }

        assert_eq!(drain(&mut fast_rx).len(), 5);
        let stats = reg.stats();
        assert_eq!(stats.payloads_delivered, 7);
        assert_eq!(stats.payloads_dropped, 3);
    }

    #[test]
    fn dropped_handles_are_evicted_on_broadcast() {
        let mut reg = RoomRegistry::default();
        let (a, rx) = Connection::new(1);
        reg.subscribe(&a, &[4, 6]);
        drop(a);
        drop(rx);

        let report = reg.broadcast(4, &payload("x"), None);
        assert_eq!(report.delivered, 0);
        assert!(reg.rooms.is_empty());
        assert!(reg.subscriptions.is_empty());
    }

    // --- event loop ---

    #[tokio::test]
    async fn queries_observe_previously_queued_commands() {
        let hub = Hub::spawn(HubConfig::default());
        let (conn, mut rx) = Connection::new(1);

        hub.register(&conn).await;
        hub.subscribe(&conn, vec![7]).await;
        assert_eq!(hub.room_members(7).await, vec![conn.id()]);

        hub.broadcast(7, payload("hello room")).await;
        let stats = hub.stats().await.unwrap();
        assert_eq!(stats.rooms, 1);
        assert_eq!(stats.connections, 1);
        assert_eq!(stats.payloads_delivered, 1);
        assert_eq!(rx.recv().await.unwrap(), payload("hello room"));
    }

    #[tokio::test]
    async fn unregister_through_hub_ends_the_queue() {
        let hub = Hub::spawn(HubConfig::default());
        let (conn, mut rx) = Connection::new(1);
        hub.register(&conn).await;
        hub.subscribe(&conn, vec![1]).await;
        hub.unregister(&conn).await;

        assert!(hub.room_members(1).await.is_empty());
        assert_eq!(hub.stats().await.unwrap().rooms, 0);
        assert!(rx.recv().await.is_none());

        // Re-subscribing another connection starts from a fresh room
        let (other, _other_rx) = Connection::new(2);
        hub.subscribe(&other, vec![1]).await;
        assert_eq!(hub.room_members(1).await, vec![other.id()]);
    }

    #[tokio::test]
    async fn broadcast_except_user_through_hub() {
        let hub = Hub::spawn(HubConfig::default());
        let (me, mut my_rx) = Connection::new(1);
        let (you, mut your_rx) = Connection::new(2);
        hub.subscribe(&me, vec![3]).await;
        hub.subscribe(&you, vec![3]).await;
        hub.broadcast_except_user(3, payload("typing"), 1).await;
        hub.stats().await;

        assert!(my_rx.try_recv().is_err());
        assert_eq!(your_rx.try_recv().unwrap(), payload("typing"));
    }

    #[tokio::test]
    async fn runner_stops_when_handles_drop() {
        let (hub, runner) = Hub::new(HubConfig::default());
        let task = tokio::spawn(runner.run());
        drop(hub);
        tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .expect("runner should stop")
            .unwrap();
    }

    #[tokio::test]
    async fn unregister_with_stopped_hub_still_closes_queue() {
        let (hub, runner) = Hub::new(HubConfig::default());
        drop(runner);
        let (conn, _rx) = Connection::new(1);
        hub.unregister(&conn).await;
        assert!(conn.is_closed());
        assert!(hub.stats().await.is_none());
    }
}
