//! The membership + dissemination engine.
//!
//! An agent keeps two bounded views of the overlay. The `active` view holds
//! peers with a live TCP connection and carries all forwarding; the larger
//! `passive` view holds known addresses used to repair the active view
//! after failures. Seven protocol messages maintain the views; user
//! payloads flood through active links with SHA-1 duplicate suppression.
//!
//! Task structure: one acceptor, one reader task per connection, a heal
//! timer and a shuffle timer. Outbound sends and user-handler invocations
//! run on ephemeral tasks so a reader is never blocked on I/O or user code.
//! A reader that hits a decode or protocol error terminates and runs the
//! repair routine for its peer.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use rumor_protocol::codec;
use rumor_protocol::hash::{payload_digest, PayloadDigest};
use rumor_protocol::message::{
    Candidate, Disconnect, ForwardJoin, Join, JoinReply, Message, Neighbor, NeighborReply,
    Priority, Shuffle, ShuffleReply, UserMessage,
};
use rumor_protocol::WireError;

use crate::config::Config;
use crate::view::{IndexedMap, Node, NodeInfo, PeerWriter, ViewSnapshot};

const NANOS_PER_MILLI: i64 = 1_000_000;

/// Callback invoked once per unique payload delivered at this agent.
/// Runs on a detached task; it must not assume any ordering across peers.
pub type MessageHandler = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("no available peers")]
    NoAvailablePeers,

    #[error("join rejected by peer")]
    JoinRejected,

    #[error("peer already in the active view")]
    AlreadyActive,

    #[error("unexpected {0} in reply")]
    UnexpectedReply(&'static str),

    #[error("cannot resolve {0}")]
    Unresolvable(String),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// Cheap-to-clone handle on the shared agent state; every task holds one.
#[derive(Clone)]
pub struct Agent(Arc<AgentInner>);

struct AgentInner {
    id: u64,
    cfg: Arc<Config>,
    /// Peers with a live connection. Bounded by `max_aview_size`.
    active: RwLock<IndexedMap<u64, Node>>,
    /// Known-but-unconnected peers. Bounded by `pview_size`.
    passive: RwLock<IndexedMap<u64, Node>>,
    /// Payload digest → purge deadline (unix ns). The duplicate window.
    seen: StdMutex<IndexedMap<PayloadDigest, i64>>,
    /// User messages whose send failed, retried after the next repair.
    resend: StdMutex<IndexedMap<PayloadDigest, UserMessage>>,
    /// Addresses used to re-enter the overlay after total peer loss.
    bootstrap: StdMutex<Vec<String>>,
    rng: StdMutex<StdRng>,
    handler: MessageHandler,
}

pub fn unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}

impl Agent {
    /// Build an agent with an injected RNG; every "choose random" path in
    /// the protocol draws from it, so seeded tests are deterministic.
    pub fn new(cfg: Arc<Config>, handler: MessageHandler, mut rng: StdRng) -> Agent {
        let mut id = 0u64;
        while id == 0 {
            id = rng.gen();
        }
        let bootstrap = cfg.peers.clone();
        Agent(Arc::new(AgentInner {
            id,
            cfg,
            active: RwLock::new(IndexedMap::new()),
            passive: RwLock::new(IndexedMap::new()),
            seen: StdMutex::new(IndexedMap::new()),
            resend: StdMutex::new(IndexedMap::new()),
            bootstrap: StdMutex::new(bootstrap),
            rng: StdMutex::new(rng),
            handler,
        }))
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    fn cfg(&self) -> &Config {
        &self.0.cfg
    }

    /// Bind the configured listen address and serve forever.
    pub async fn serve(self) -> Result<(), AgentError> {
        let listen = self.cfg().listen_addr();
        let ln = TcpListener::bind(&listen).await?;
        self.serve_with(ln).await
    }

    /// Serve on an already-bound listener. Spawns the heal and shuffle
    /// loops, then accepts inbound connections forever.
    pub async fn serve_with(self, ln: TcpListener) -> Result<(), AgentError> {
        if let Ok(addr) = ln.local_addr() {
            info!(%addr, id = self.0.id, "agent listening");
        }
        tokio::spawn(self.clone().heal_loop());
        tokio::spawn(self.clone().shuffle_loop());
        loop {
            match ln.accept().await {
                Ok((stream, _)) => {
                    let (rd, wr) = stream.into_split();
                    self.clone().spawn_reader(rd, Arc::new(Mutex::new(wr)), None);
                }
                Err(e) => warn!(error = %e, "accept failed"),
            }
        }
    }

    /// Join the overlay through the first reachable peer in `peers`. The
    /// addresses are also remembered for bootstrap rejoins.
    pub async fn join(&self, peers: &[String]) -> Result<(), AgentError> {
        {
            let mut bootstrap = self.0.bootstrap.lock().unwrap();
            for p in peers {
                if !bootstrap.contains(p) {
                    bootstrap.push(p.clone());
                }
            }
        }
        self.join_any(peers).await
    }

    /// Broadcast a payload to the overlay. The payload is recorded in the
    /// duplicate window and delivered to the local handler, so copies
    /// flooded back here are suppressed.
    pub async fn broadcast(&self, payload: Vec<u8>) {
        let msg = UserMessage {
            id: self.0.id,
            payload,
            ts: unix_nanos(),
        };
        self.handle_user_message(msg, None).await;
    }

    pub async fn snapshot(&self) -> ViewSnapshot {
        let active = self.0.active.read().await;
        let passive = self.0.passive.read().await;
        ViewSnapshot {
            active_view: active.values().iter().map(NodeInfo::from).collect(),
            passive_view: passive.values().iter().map(NodeInfo::from).collect(),
        }
    }

    // ========================================================================
    // Connection reader
    // ========================================================================

    /// Spawn `run_reader` on its own task. Boxed so the recursive cycle
    /// between `run_reader` and the repair path it can trigger doesn't
    /// trip the compiler's opaque-type auto-trait inference.
    fn spawn_reader(self, rd: OwnedReadHalf, wr: PeerWriter, bound: Option<u64>) {
        let fut: std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> =
            Box::pin(self.run_reader(rd, wr, bound));
        tokio::spawn(fut);
    }

    /// Read frames off one connection until it errors, dispatching each to
    /// its handler. `bound` names the active-view node this connection
    /// belongs to; an inbound connection starts unbound and binds when a
    /// Join or Neighbor on it is accepted. The bound reader is the task
    /// responsible for repairing its node on failure.
    pub(crate) async fn run_reader(
        self,
        mut rd: OwnedReadHalf,
        wr: PeerWriter,
        mut bound: Option<u64>,
    ) {
        loop {
            let msg = match codec::read_message(&mut rd).await {
                Ok(msg) => msg,
                Err(e) => {
                    debug!(peer = ?bound, error = %e, "connection reader stopped");
                    if let Some(id) = bound {
                        self.replace_active_node(id).await;
                    }
                    return;
                }
            };
            trace!(kind = msg.name(), peer = ?bound, "received");
            match self.dispatch(msg, &wr, bound).await {
                Ok(Some(id)) => bound = Some(id),
                Ok(None) => {}
                Err(e) => {
                    warn!(peer = ?bound, error = %e, "protocol error; dropping connection");
                    if let Some(id) = bound {
                        self.replace_active_node(id).await;
                    }
                    return;
                }
            }
        }
    }

    async fn dispatch(
        &self,
        msg: Message,
        wr: &PeerWriter,
        bound: Option<u64>,
    ) -> Result<Option<u64>, AgentError> {
        let kind = msg.name();
        match msg {
            Message::Join(m) => Ok(self.handle_join(m, wr).await),
            Message::Neighbor(m) => Ok(self.handle_neighbor(m, wr).await),
            Message::ForwardJoin(m) => {
                self.handle_forward_join(m).await;
                Ok(None)
            }
            Message::Disconnect(m) => {
                self.handle_disconnect(m).await;
                Ok(None)
            }
            Message::Shuffle(m) => {
                self.handle_shuffle(m).await;
                Ok(None)
            }
            Message::ShuffleReply(m) => {
                self.handle_shuffle_reply(m).await;
                Ok(None)
            }
            Message::User(m) => {
                self.handle_user_message(m, bound).await;
                Ok(None)
            }
            // Replies are only valid inside a request/reply exchange, which
            // reads them inline; seeing one here means the peer is confused.
            Message::JoinReply(_) | Message::NeighborReply(_) => {
                Err(AgentError::UnexpectedReply(kind))
            }
        }
    }

    // ========================================================================
    // Protocol handlers
    // ========================================================================

    /// A newcomer wants in through this connection. Accepted unless it is
    /// ourselves or already active. The reply is written before the node
    /// becomes visible in the active view, so it is the first frame the
    /// joiner reads on this connection.
    async fn handle_join(&self, msg: Join, wr: &PeerWriter) -> Option<u64> {
        let accept = {
            let active = self.0.active.read().await;
            msg.id != self.0.id && !active.has(&msg.id)
        };

        let reply = Message::JoinReply(JoinReply {
            id: self.0.id,
            accept,
        });
        if let Err(e) = send_on(wr, reply).await {
            debug!(peer = msg.id, error = %e, "join reply failed");
            return None;
        }
        if !accept {
            debug!(peer = msg.id, addr = %msg.addr, "join rejected");
            return None;
        }

        let mut active = self.0.active.write().await;
        let mut passive = self.0.passive.write().await;
        let node = Node::connected(msg.id, msg.addr.clone(), wr.clone());
        if !self.admit_active(&mut active, &mut passive, node) {
            // Raced with another admission of the same id.
            return None;
        }
        info!(peer = msg.id, addr = %msg.addr, "peer joined");

        // Spread the news: one bounded random walk per other active peer.
        for nd in active.values() {
            if nd.id == msg.id {
                continue;
            }
            let fwd = ForwardJoin {
                id: self.0.id,
                source_id: msg.id,
                source_addr: msg.addr.clone(),
                ttl: self.random_ttl(self.cfg().arwl),
            };
            let ag = self.clone();
            let nd = nd.clone();
            tokio::spawn(async move { ag.send_to(&nd, Message::ForwardJoin(fwd)).await });
        }
        Some(msg.id)
    }

    /// Active-view admission request. High priority always gets in; low
    /// priority only while there is room.
    async fn handle_neighbor(&self, msg: Neighbor, wr: &PeerWriter) -> Option<u64> {
        let accept = {
            let active = self.0.active.read().await;
            msg.id != self.0.id
                && !active.has(&msg.id)
                && (msg.priority() == Priority::High || active.len() < self.cfg().max_aview_size)
        };

        let reply = Message::NeighborReply(NeighborReply {
            id: self.0.id,
            accept,
        });
        if let Err(e) = send_on(wr, reply).await {
            debug!(peer = msg.id, error = %e, "neighbor reply failed");
            return None;
        }
        if !accept {
            debug!(peer = msg.id, "neighbor request declined");
            return None;
        }

        let mut active = self.0.active.write().await;
        let mut passive = self.0.passive.write().await;
        let node = Node::connected(msg.id, msg.addr.clone(), wr.clone());
        if !self.admit_active(&mut active, &mut passive, node) {
            return None;
        }
        info!(peer = msg.id, addr = %msg.addr, "neighbor admitted");
        Some(msg.id)
    }

    /// A newcomer's random walk reached us. At the walk's end (or when our
    /// active view is too small to relay) we connect to the newcomer
    /// directly; at the passive boundary we adopt it into the passive view
    /// and keep relaying.
    async fn handle_forward_join(&self, msg: ForwardJoin) {
        let newcomer = Node::detached(msg.source_id, msg.source_addr.clone());
        let mut dial_newcomer = false;
        {
            let active = self.0.active.write().await;
            let mut passive = self.0.passive.write().await;
            if msg.ttl == 0 || active.len() <= 1 {
                dial_newcomer = msg.source_id != self.0.id && !active.has(&msg.source_id);
            } else {
                if msg.ttl == self.cfg().prwl {
                    self.admit_passive(&active, &mut passive, newcomer.clone());
                }
                if let Some(next) = self.choose_random(&active, msg.id) {
                    let fwd = ForwardJoin {
                        id: self.0.id,
                        source_id: msg.source_id,
                        source_addr: msg.source_addr.clone(),
                        ttl: msg.ttl - 1,
                    };
                    let ag = self.clone();
                    tokio::spawn(async move { ag.send_to(&next, Message::ForwardJoin(fwd)).await });
                }
            }
        }
        if dial_newcomer {
            match self.promote(newcomer, Priority::High).await {
                Ok(true) => info!(peer = msg.source_id, "connected to forwarded newcomer"),
                Ok(false) => debug!(peer = msg.source_id, "forwarded newcomer declined us"),
                Err(e) => {
                    debug!(peer = msg.source_id, error = %e, "forwarded newcomer unreachable")
                }
            }
        }
    }

    /// The sender dropped us from its active view; treat it as failed.
    async fn handle_disconnect(&self, msg: Disconnect) {
        let known = self.0.active.read().await.has(&msg.id);
        if known {
            self.replace_active_node(msg.id).await;
        }
    }

    /// Relay the shuffle while its walk lives; at the end, trade passive
    /// samples with the originator.
    async fn handle_shuffle(&self, msg: Shuffle) {
        let active = self.0.active.write().await;
        let mut passive = self.0.passive.write().await;

        if msg.ttl > 0 && active.len() > 1 {
            if let Some(next) = self.choose_random(&active, msg.id) {
                let mut fwd = msg;
                fwd.id = self.0.id;
                fwd.ttl -= 1;
                let ag = self.clone();
                tokio::spawn(async move { ag.send_to(&next, Message::Shuffle(fwd)).await });
            }
            return;
        }

        // Walk over: answer with a same-sized sample of our passive view,
        // sent over a fresh connection to the originator.
        let reply = self.choose_candidates(&passive, msg.candidates.len());
        let sent_back: Vec<u64> = reply.iter().map(|c| c.id).collect();
        let ag = self.clone();
        let origin = msg.addr.clone();
        tokio::spawn(async move { ag.send_shuffle_reply(origin, reply).await });

        self.integrate_candidates(&active, &mut passive, &msg.candidates, sent_back);
    }

    async fn handle_shuffle_reply(&self, msg: ShuffleReply) {
        let active = self.0.active.write().await;
        let mut passive = self.0.passive.write().await;
        self.integrate_candidates(&active, &mut passive, &msg.candidates, Vec::new());
    }

    /// Deliver-once-and-flood. Stale or already-seen payloads are dropped;
    /// fresh ones are recorded, handed to the user handler on a detached
    /// task, and forwarded to every active peer except the one that sent
    /// them here.
    async fn handle_user_message(&self, msg: UserMessage, from: Option<u64>) {
        let now = unix_nanos();
        let deadline = msg.ts + self.cfg().msg_life as i64 * NANOS_PER_MILLI;
        if now >= deadline {
            debug!(
                age_ms = (now - msg.ts) / NANOS_PER_MILLI,
                "dropping stale user message"
            );
            return;
        }

        let digest = payload_digest(&msg.payload);
        {
            let mut seen = self.0.seen.lock().unwrap();
            if let Some(&purge_deadline) = seen.get(&digest) {
                if purge_deadline >= now {
                    trace!(digest = %hex::encode(digest), "suppressing duplicate payload");
                    return;
                }
                seen.remove(&digest);
            }
            seen.insert(digest, now + self.cfg().purge_duration as i64 * NANOS_PER_MILLI);
        }

        let handler = self.0.handler.clone();
        let payload = msg.payload.clone();
        tokio::spawn(async move { handler(payload) });

        let peers: Vec<Node> = {
            let active = self.0.active.read().await;
            active
                .values()
                .iter()
                .filter(|nd| Some(nd.id) != from)
                .cloned()
                .collect()
        };
        for nd in peers {
            let ag = self.clone();
            let fwd = msg.clone();
            tokio::spawn(async move { ag.send_to(&nd, Message::User(fwd)).await });
        }
    }

    // ========================================================================
    // View admission
    // ========================================================================

    /// Admit a connected node into the active view, displacing a random
    /// member into the passive view when full. Returns false when the node
    /// is ourselves or already present.
    fn admit_active(
        &self,
        active: &mut IndexedMap<u64, Node>,
        passive: &mut IndexedMap<u64, Node>,
        node: Node,
    ) -> bool {
        if node.id == self.0.id || active.has(&node.id) {
            return false;
        }
        // A node id lives in at most one view.
        passive.remove(&node.id);

        if active.len() >= self.cfg().max_aview_size {
            if let Some(victim) = self.take_random(active) {
                debug!(peer = victim.id, "active view full; demoting random member");
                tokio::spawn(self.clone().send_disconnect(victim.clone()));
                self.admit_passive(&*active, passive, Node::detached(victim.id, victim.addr));
            }
        }
        active.insert(node.id, node);
        true
    }

    /// Admit a detached descriptor into the passive view, evicting a random
    /// member when full. Self and anything already in either view is
    /// skipped.
    fn admit_passive(
        &self,
        active: &IndexedMap<u64, Node>,
        passive: &mut IndexedMap<u64, Node>,
        node: Node,
    ) {
        if node.id == self.0.id || active.has(&node.id) || passive.has(&node.id) {
            return;
        }
        if passive.len() >= self.cfg().pview_size {
            let _ = self.take_random(passive);
        }
        passive.insert(node.id, Node::detached(node.id, node.addr));
    }

    /// Fold shuffle candidates into the passive view. When full, victims
    /// are drawn first from `evict_first` (the ids just sent back to the
    /// shuffle originator), then at random.
    fn integrate_candidates(
        &self,
        active: &IndexedMap<u64, Node>,
        passive: &mut IndexedMap<u64, Node>,
        candidates: &[Candidate],
        mut evict_first: Vec<u64>,
    ) {
        for c in candidates {
            if c.id == self.0.id || active.has(&c.id) || passive.has(&c.id) {
                continue;
            }
            if passive.len() >= self.cfg().pview_size {
                let correlated = loop {
                    match evict_first.pop() {
                        Some(id) if passive.has(&id) => break Some(id),
                        Some(_) => continue,
                        None => break None,
                    }
                };
                match correlated {
                    Some(id) => {
                        passive.remove(&id);
                    }
                    None => {
                        let _ = self.take_random(passive);
                    }
                }
            }
            passive.insert(c.id, Node::detached(c.id, c.addr.clone()));
        }
    }

    // ========================================================================
    // Repair
    // ========================================================================

    /// Replace a dead active node with a promoted passive peer.
    ///
    /// Runs from the dead node's reader task, from Disconnect handling, or
    /// after a failed send; whichever path gets here first removes the
    /// entry and the rest return at step one.
    pub(crate) async fn replace_active_node(&self, dead_id: u64) {
        let dead = {
            let mut active = self.0.active.write().await;
            match active.remove(&dead_id) {
                Some(nd) => nd,
                None => return,
            }
        };
        info!(peer = dead.id, addr = %dead.addr, "active peer lost; repairing");
        if let Some(writer) = &dead.writer {
            let _ = writer.lock().await.shutdown().await;
        }

        loop {
            let candidate = {
                let mut passive = self.0.passive.write().await;
                self.take_random(&mut passive)
            };
            let Some(nd) = candidate else {
                if !self.0.active.read().await.is_empty() {
                    // Nothing to promote, but we are still connected.
                    debug!("passive view empty; keeping reduced active view");
                    break;
                }
                warn!("lost all peers; rejoining bootstrap list");
                let peers = self.shuffled_bootstrap();
                if let Err(e) = self.join_any(&peers).await {
                    warn!(error = %e, "bootstrap rejoin failed");
                    let dropped = {
                        let mut resend = self.0.resend.lock().unwrap();
                        let n = resend.len();
                        resend.clear();
                        n
                    };
                    if dropped > 0 {
                        warn!(dropped, "discarded undeliverable user messages");
                    }
                    return;
                }
                break;
            };
            let priority = if self.0.active.read().await.is_empty() {
                Priority::High
            } else {
                Priority::Low
            };
            match self.promote(nd.clone(), priority).await {
                Ok(true) => {
                    info!(peer = nd.id, addr = %nd.addr, "promoted passive peer");
                    break;
                }
                Ok(false) => debug!(peer = nd.id, "passive peer declined promotion"),
                Err(e) => debug!(peer = nd.id, error = %e, "passive peer unreachable"),
            }
        }

        // The dead node may come back; keep its address around.
        {
            let active = self.0.active.write().await;
            let mut passive = self.0.passive.write().await;
            self.admit_passive(&active, &mut passive, Node::detached(dead.id, dead.addr));
        }
        self.resend_pending().await;
    }

    /// Dial a detached peer and run the Neighbor request/reply. On accept
    /// the peer enters the active view and gets a reader task. No view lock
    /// is held across the dial or the blocking reply read.
    async fn promote(&self, nd: Node, priority: Priority) -> Result<bool, AgentError> {
        let mut stream = self.dial(&nd.addr).await?;
        let request = Message::Neighbor(Neighbor {
            id: self.0.id,
            addr: self.cfg().addr.clone(),
            priority: priority as i32,
        });
        codec::write_message(&mut stream, &request).await?;
        let reply = match codec::read_message(&mut stream).await? {
            Message::NeighborReply(r) => r,
            other => return Err(AgentError::UnexpectedReply(other.name())),
        };
        if !reply.accept || reply.id == self.0.id {
            return Ok(false);
        }

        let (rd, wr) = stream.into_split();
        let wr: PeerWriter = Arc::new(Mutex::new(wr));
        let node = Node::connected(reply.id, nd.addr, wr.clone());
        let id = node.id;
        {
            let mut active = self.0.active.write().await;
            let mut passive = self.0.passive.write().await;
            if !self.admit_active(&mut active, &mut passive, node) {
                return Ok(false);
            }
        }
        self.clone().spawn_reader(rd, wr, Some(id));
        Ok(true)
    }

    /// Drain the resend buffer and flood every entry to the current active
    /// view. A send that fails again re-queues its message.
    async fn resend_pending(&self) {
        let msgs: Vec<UserMessage> = {
            let mut resend = self.0.resend.lock().unwrap();
            let msgs = resend.values().to_vec();
            resend.clear();
            msgs
        };
        if msgs.is_empty() {
            return;
        }
        info!(count = msgs.len(), "resending buffered user messages");
        let peers: Vec<Node> = self.0.active.read().await.values().to_vec();
        for msg in msgs {
            for nd in &peers {
                let ag = self.clone();
                let nd = nd.clone();
                let fwd = msg.clone();
                let fut: std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> =
                    Box::pin(async move { ag.send_to(&nd, Message::User(fwd)).await });
                tokio::spawn(fut);
            }
        }
    }

    // ========================================================================
    // Join
    // ========================================================================

    async fn join_any(&self, peers: &[String]) -> Result<(), AgentError> {
        for addr in peers {
            match self.try_join(addr).await {
                Ok(id) => {
                    info!(peer = id, addr = %addr, "joined overlay");
                    return Ok(());
                }
                Err(e) => warn!(addr = %addr, error = %e, "join attempt failed"),
            }
        }
        Err(AgentError::NoAvailablePeers)
    }

    async fn try_join(&self, addr: &str) -> Result<u64, AgentError> {
        let mut stream = self.dial(addr).await?;
        let hello = Message::Join(Join {
            id: self.0.id,
            addr: self.cfg().addr.clone(),
        });
        codec::write_message(&mut stream, &hello).await?;
        let reply = match codec::read_message(&mut stream).await? {
            Message::JoinReply(r) => r,
            other => return Err(AgentError::UnexpectedReply(other.name())),
        };
        if !reply.accept {
            return Err(AgentError::JoinRejected);
        }

        let (rd, wr) = stream.into_split();
        let wr: PeerWriter = Arc::new(Mutex::new(wr));
        let node = Node::connected(reply.id, addr.to_string(), wr.clone());
        {
            let mut active = self.0.active.write().await;
            let mut passive = self.0.passive.write().await;
            if !self.admit_active(&mut active, &mut passive, node) {
                return Err(AgentError::AlreadyActive);
            }
        }
        self.clone().spawn_reader(rd, wr, Some(reply.id));
        Ok(reply.id)
    }

    // ========================================================================
    // Background loops
    // ========================================================================

    /// Keep the overlay stitched together: rejoin the bootstrap list after
    /// total peer loss, refill the active view from the passive view when
    /// under the soft floor, and sweep expired digests out of the duplicate
    /// window.
    async fn heal_loop(self) {
        let mut tick = tokio::time::interval(Duration::from_secs(self.cfg().heal.max(1)));
        loop {
            tick.tick().await;
            self.sweep_seen();

            let active_len = self.0.active.read().await.len();
            if active_len == 0 {
                let peers = self.shuffled_bootstrap();
                if peers.is_empty() {
                    continue;
                }
                warn!("no active peers; rejoining bootstrap list");
                if let Err(e) = self.join_any(&peers).await {
                    warn!(error = %e, "bootstrap rejoin failed");
                }
                continue;
            }

            if active_len < self.cfg().min_aview_size {
                // Promotion removes the passive entry on success; a peer
                // that declines stays known.
                let candidate = {
                    let passive = self.0.passive.read().await;
                    self.choose_random(&passive, 0)
                };
                if let Some(nd) = candidate {
                    match self.promote(nd.clone(), Priority::Low).await {
                        Ok(true) => debug!(peer = nd.id, "refilled active view from passive"),
                        Ok(false) => debug!(peer = nd.id, "passive peer declined refill"),
                        Err(e) => {
                            debug!(peer = nd.id, error = %e, "dropping unreachable passive peer");
                            self.0.passive.write().await.remove(&nd.id);
                        }
                    }
                }
            }
        }
    }

    /// Periodically trade view samples with one random active peer.
    async fn shuffle_loop(self) {
        let mut tick =
            tokio::time::interval(Duration::from_secs(self.cfg().shuffle_duration.max(1)));
        loop {
            tick.tick().await;
            let (target, candidates) = {
                let active = self.0.active.read().await;
                let passive = self.0.passive.read().await;
                if active.is_empty() {
                    continue;
                }
                let Some(target) = self.choose_random(&active, 0) else {
                    continue;
                };
                let mut candidates = vec![Candidate {
                    id: self.0.id,
                    addr: self.cfg().addr.clone(),
                }];
                candidates.extend(self.choose_candidates(&active, self.cfg().ka));
                candidates.extend(self.choose_candidates(&passive, self.cfg().kp));
                (target, candidates)
            };
            let msg = Shuffle {
                id: self.0.id,
                source_id: self.0.id,
                addr: self.cfg().addr.clone(),
                candidates,
                ttl: self.cfg().srwl,
            };
            let ag = self.clone();
            tokio::spawn(async move { ag.send_to(&target, Message::Shuffle(msg)).await });
        }
    }

    fn sweep_seen(&self) {
        let now = unix_nanos();
        let mut seen = self.0.seen.lock().unwrap();
        let expired: Vec<PayloadDigest> = seen
            .keys()
            .iter()
            .zip(seen.values())
            .filter_map(|(k, &deadline)| (deadline < now).then_some(*k))
            .collect();
        for k in &expired {
            seen.remove(k);
        }
    }

    // ========================================================================
    // Sending
    // ========================================================================

    /// Write a message to an active peer. A failure queues user messages
    /// for resend and triggers repair for the peer.
    ///
    /// Returns a boxed future (rather than being declared `async fn`) so its
    /// return type isn't an opaque type: `send_to` sits on a cycle with
    /// `replace_active_node` / `resend_pending` (each spawns the other), and
    /// the compiler can't infer `Send` for mutually recursive opaque futures.
    fn send_to<'a>(
        &'a self,
        node: &'a Node,
        msg: Message,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let Some(writer) = &node.writer else {
                return;
            };
            let result = {
                let mut w = writer.lock().await;
                codec::write_message(&mut *w, &msg).await
            };
            if let Err(e) = result {
                debug!(peer = node.id, kind = msg.name(), error = %e, "send failed");
                if let Message::User(m) = msg {
                    let digest = payload_digest(&m.payload);
                    self.0.resend.lock().unwrap().insert(digest, m);
                }
                let ag = self.clone();
                let id = node.id;
                tokio::spawn(async move { ag.replace_active_node(id).await });
            }
        })
    }

    /// Tell a displaced peer we dropped it, then close our side.
    async fn send_disconnect(self, node: Node) {
        let Some(writer) = &node.writer else {
            return;
        };
        let mut w = writer.lock().await;
        let msg = Message::Disconnect(Disconnect { id: self.0.id });
        if let Err(e) = codec::write_message(&mut *w, &msg).await {
            debug!(peer = node.id, error = %e, "disconnect send failed");
        }
        let _ = w.shutdown().await;
    }

    /// Answer a shuffle over a fresh, single-use connection.
    async fn send_shuffle_reply(self, addr: String, candidates: Vec<Candidate>) {
        match self.dial(&addr).await {
            Ok(mut stream) => {
                let msg = Message::ShuffleReply(ShuffleReply {
                    id: self.0.id,
                    candidates,
                });
                if let Err(e) = codec::write_message(&mut stream, &msg).await {
                    debug!(addr = %addr, error = %e, "shuffle reply failed");
                }
                let _ = stream.shutdown().await;
            }
            Err(e) => debug!(addr = %addr, error = %e, "cannot reach shuffle originator"),
        }
    }

    async fn dial(&self, addr: &str) -> Result<TcpStream, AgentError> {
        let mut hosts = tokio::net::lookup_host(addr).await?;
        let target = match self.cfg().net.as_str() {
            "tcp4" => hosts.find(|a| a.is_ipv4()),
            "tcp6" => hosts.find(|a| a.is_ipv6()),
            _ => hosts.next(),
        };
        let Some(target) = target else {
            return Err(AgentError::Unresolvable(addr.to_string()));
        };
        Ok(TcpStream::connect(target).await?)
    }

    // ========================================================================
    // Random selection
    // ========================================================================

    /// Uniformly pick one node, skipping `exclude` (0 excludes nothing
    /// since ids are non-zero).
    fn choose_random(&self, view: &IndexedMap<u64, Node>, exclude: u64) -> Option<Node> {
        let len = view.len();
        if len == 0 {
            return None;
        }
        let index = self.0.rng.lock().unwrap().gen_range(0..len);
        let nd = view.value_at(index);
        if nd.id == exclude {
            if len == 1 {
                return None;
            }
            return Some(view.value_at((index + 1) % len).clone());
        }
        Some(nd.clone())
    }

    /// Up to `n` candidates starting at a random index, wrapping around.
    fn choose_candidates(&self, view: &IndexedMap<u64, Node>, n: usize) -> Vec<Candidate> {
        let len = view.len();
        if len == 0 || n == 0 {
            return Vec::new();
        }
        let n = n.min(len);
        let start = self.0.rng.lock().unwrap().gen_range(0..len);
        (0..n)
            .map(|i| {
                let nd = view.value_at((start + i) % len);
                Candidate {
                    id: nd.id,
                    addr: nd.addr.clone(),
                }
            })
            .collect()
    }

    fn take_random(&self, view: &mut IndexedMap<u64, Node>) -> Option<Node> {
        if view.is_empty() {
            return None;
        }
        let index = self.0.rng.lock().unwrap().gen_range(0..view.len());
        Some(view.remove_at(index).1)
    }

    fn random_ttl(&self, limit: u32) -> u32 {
        if limit == 0 {
            return 0;
        }
        self.0.rng.lock().unwrap().gen_range(0..limit)
    }

    fn shuffled_bootstrap(&self) -> Vec<String> {
        let mut peers = self.0.bootstrap.lock().unwrap().clone();
        peers.shuffle(&mut *self.0.rng.lock().unwrap());
        peers
    }
}

/// Write a reply on an explicit connection. The caller decides what a
/// failure means; the reader task owning the connection will observe the
/// broken transport either way.
async fn send_on(wr: &PeerWriter, msg: Message) -> Result<(), WireError> {
    let mut w = wr.lock().await;
    codec::write_message(&mut *w, &msg).await
}
