//! Seatsync Test Kit
//!
//! Runs one [`Server`] and any number of [`Client`]s in a single process,
//! connected by an in-memory transport that honours the two channel
//! contracts:
//! - Reliable: delivered in send order, optionally duplicated, possibly
//!   stalled behind later unreliable traffic
//! - Unreliable: optionally dropped, reordered or delayed across pumps
//!
//! Every message crosses the loopback as encoded bytes so the wire crate is
//! exercised end to end. Chaos decisions come from a seeded RNG; a given
//! seed replays identically.

#![deny(unsafe_code)]

pub mod embodiment;

use std::collections::{BTreeSet, VecDeque};
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use seatsync_client::{Client, ClientAction, ClientConfig};
use seatsync_core::{AvatarPose, ParticipantId};
use seatsync_server::{Server, ServerConfig};
use seatsync_wire::Channel;
use tracing::{debug, trace};

pub use embodiment::{EmbodimentEvent, RecordingEmbodiment};

/// Install a test-friendly tracing subscriber honouring `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ============================================================================
// Chaos Configuration
// ============================================================================

/// Link impairment knobs.
#[derive(Debug, Clone)]
pub struct ChaosConfig {
    /// Probability a reliable message is delivered twice.
    pub reliable_duplicate_prob: f64,
    /// Probability an unreliable message is lost.
    pub unreliable_loss_prob: f64,
    /// Probability an unreliable message swaps places with its predecessor.
    pub unreliable_reorder_prob: f64,
    /// Per pump, probability a client's reliable inbox is held back while
    /// unreliable traffic keeps flowing. Must be below 1.
    pub reliable_stall_prob: f64,
    /// Per pump, probability an unreliable message to a client waits for a
    /// later pump. Must be below 1.
    pub unreliable_delay_prob: f64,
    pub seed: u64,
}

impl ChaosConfig {
    /// No loss, no duplication, no reordering.
    pub fn perfect() -> Self {
        Self {
            reliable_duplicate_prob: 0.0,
            unreliable_loss_prob: 0.0,
            unreliable_reorder_prob: 0.0,
            reliable_stall_prob: 0.0,
            unreliable_delay_prob: 0.0,
            seed: 0,
        }
    }

    /// Impaired links that still satisfy the channel contracts.
    pub fn lossy(seed: u64) -> Self {
        Self {
            reliable_duplicate_prob: 0.2,
            unreliable_loss_prob: 0.25,
            unreliable_reorder_prob: 0.3,
            reliable_stall_prob: 0.3,
            unreliable_delay_prob: 0.3,
            seed,
        }
    }
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self::perfect()
    }
}

/// Delivery counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub sent: u64,
    pub delivered: u64,
    pub lost: u64,
    pub duplicated: u64,
    pub reordered: u64,
    /// Pumps in which a client's reliable inbox was held back.
    pub stalled: u64,
    pub delayed: u64,
}

// ============================================================================
// Loopback Network
// ============================================================================

/// Index of a client inside a [`LoopbackNetwork`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientHandle(usize);

struct Node {
    client: Client<RecordingEmbodiment>,
    /// Transport id of the open connection.
    link: Option<ParticipantId>,
    /// When false, connection attempts fail.
    reachable: bool,
    /// Server-to-client reliable traffic is held until released.
    reliable_held: bool,
}

/// Datagram in flight; `peer` is the client end of the link.
struct Datagram {
    peer: ParticipantId,
    bytes: Vec<u8>,
}

/// One server and its clients on an in-memory transport.
pub struct LoopbackNetwork {
    server: Server,
    client_config: ClientConfig,
    nodes: Vec<Node>,
    next_transport_id: u64,
    now: Instant,
    chaos: ChaosConfig,
    rng: StdRng,
    to_server_reliable: VecDeque<Datagram>,
    to_server_unreliable: Vec<Datagram>,
    to_client_reliable: VecDeque<Datagram>,
    to_client_unreliable: Vec<Datagram>,
    /// Server-to-client unreliable traffic is held until released.
    unreliable_held: bool,
    stats: LinkStats,
}

impl LoopbackNetwork {
    /// Create a network with a started server.
    pub fn new(server_config: ServerConfig, client_config: ClientConfig, chaos: ChaosConfig) -> Self {
        let mut server = Server::new(server_config);
        server.start();

        Self {
            server,
            client_config,
            nodes: Vec::new(),
            next_transport_id: 1,
            now: Instant::now(),
            rng: StdRng::seed_from_u64(chaos.seed),
            chaos,
            to_server_reliable: VecDeque::new(),
            to_server_unreliable: Vec::new(),
            to_client_reliable: VecDeque::new(),
            to_client_unreliable: Vec::new(),
            unreliable_held: false,
            stats: LinkStats::default(),
        }
    }

    /// Perfect links, default configs.
    pub fn perfect() -> Self {
        Self::new(
            ServerConfig::default(),
            ClientConfig::default(),
            ChaosConfig::perfect(),
        )
    }

    /// Add an idle client.
    pub fn add_client(&mut self) -> ClientHandle {
        let client = Client::new(self.client_config.clone(), RecordingEmbodiment::default());
        self.nodes.push(Node {
            client,
            link: None,
            reachable: true,
            reliable_held: false,
        });
        ClientHandle(self.nodes.len() - 1)
    }

    /// Add a client and run its handshake to quiescence.
    pub fn join_client(&mut self) -> ClientHandle {
        let handle = self.add_client();
        self.connect(handle);
        handle
    }

    pub fn connect(&mut self, handle: ClientHandle) {
        self.nodes[handle.0].client.connect();
        self.run_until_idle();
    }

    /// Stream a pose from `handle`.
    pub fn send_pose(&mut self, handle: ClientHandle, pose: AvatarPose) -> bool {
        let queued = self.queue_pose(handle, pose);
        self.run_until_idle();
        queued
    }

    /// Queue a pose from `handle` without pumping the network.
    pub fn queue_pose(&mut self, handle: ClientHandle, pose: AvatarPose) -> bool {
        self.nodes[handle.0].client.send_pose(pose)
    }

    /// Drop a client's connection; both ends observe the stop.
    pub fn sever(&mut self, handle: ClientHandle) {
        let now = self.now;
        let Some(id) = self.nodes[handle.0].link.take() else {
            return;
        };

        self.purge(id);
        self.server.on_disconnect(id);
        self.nodes[handle.0].client.on_connection_stopped(now);
        debug!(%id, "link severed");
        self.run_until_idle();
    }

    /// Make connection attempts from `handle` succeed or fail.
    pub fn set_reachable(&mut self, handle: ClientHandle, reachable: bool) {
        self.nodes[handle.0].reachable = reachable;
    }

    /// Hold reliable traffic to `handle` in order until released.
    pub fn set_reliable_held(&mut self, handle: ClientHandle, held: bool) {
        self.nodes[handle.0].reliable_held = held;
    }

    /// Hold unreliable traffic to every client until released.
    pub fn set_unreliable_held(&mut self, held: bool) {
        self.unreliable_held = held;
    }

    /// Advance virtual time, fire due timers and deliver the consequences.
    pub fn advance(&mut self, by: Duration) {
        self.now += by;
        let now = self.now;
        for node in &mut self.nodes {
            node.client.poll(now);
        }
        self.run_until_idle();
    }

    /// Exchange messages until no side has anything left to say.
    ///
    /// Traffic held with [`Self::set_reliable_held`] or
    /// [`Self::set_unreliable_held`] stays queued.
    pub fn run_until_idle(&mut self) {
        while self.step() {}
    }

    /// Run one pump round. Returns false once nothing moved.
    pub fn step(&mut self) -> bool {
        let mut progressed = self.pump_client_actions();
        progressed |= self.pump_server_outbox();
        progressed |= self.deliver_to_server();
        progressed |= self.deliver_to_clients();
        progressed
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn server(&self) -> &Server {
        &self.server
    }

    pub fn server_mut(&mut self) -> &mut Server {
        &mut self.server
    }

    pub fn client(&self, handle: ClientHandle) -> &Client<RecordingEmbodiment> {
        &self.nodes[handle.0].client
    }

    pub fn embodiment(&self, handle: ClientHandle) -> &RecordingEmbodiment {
        self.nodes[handle.0].client.embodiment()
    }

    /// Transport id of the client's open connection.
    pub fn transport_id(&self, handle: ClientHandle) -> Option<ParticipantId> {
        self.nodes[handle.0].link
    }

    pub fn handles(&self) -> impl Iterator<Item = ClientHandle> {
        (0..self.nodes.len()).map(ClientHandle)
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    pub fn stats(&self) -> &LinkStats {
        &self.stats
    }

    /// Mirror set each active client should hold: every other registered
    /// participant.
    pub fn expected_mirrors(&self, handle: ClientHandle) -> Vec<ParticipantId> {
        let own = self.transport_id(handle);
        self.server
            .participants()
            .map(|r| r.id)
            .filter(|id| Some(*id) != own)
            .collect()
    }

    // ========================================================================
    // Pumping
    // ========================================================================

    fn pump_client_actions(&mut self) -> bool {
        let now = self.now;
        let mut progressed = false;

        for index in 0..self.nodes.len() {
            let actions = self.nodes[index].client.drain_actions();
            progressed |= !actions.is_empty();

            for action in actions {
                match action {
                    ClientAction::Connect => self.open_link(index, now),
                    ClientAction::Disconnect => {
                        if let Some(id) = self.nodes[index].link.take() {
                            self.purge(id);
                            self.server.on_disconnect(id);
                        }
                    }
                    ClientAction::Send(msg) => {
                        let Some(peer) = self.nodes[index].link else {
                            continue;
                        };
                        let datagram = Datagram {
                            peer,
                            bytes: msg.encode_to_vec(),
                        };
                        match msg.channel() {
                            Channel::Reliable => {
                                Self::enqueue_reliable(
                                    &mut self.to_server_reliable,
                                    datagram,
                                    &self.chaos,
                                    &mut self.rng,
                                    &mut self.stats,
                                );
                            }
                            Channel::Unreliable => {
                                Self::enqueue_unreliable(
                                    &mut self.to_server_unreliable,
                                    datagram,
                                    &self.chaos,
                                    &mut self.rng,
                                    &mut self.stats,
                                );
                            }
                        }
                    }
                }
            }
        }

        progressed
    }

    fn open_link(&mut self, index: usize, now: Instant) {
        let node = &mut self.nodes[index];
        if !node.reachable {
            node.client.on_connection_stopped(now);
            return;
        }

        let id = ParticipantId::new(self.next_transport_id);
        self.next_transport_id += 1;

        if self.server.on_connect(id) {
            node.link = Some(id);
            node.client.on_connection_started(id);
        } else {
            node.client.on_connection_stopped(now);
        }
    }

    fn pump_server_outbox(&mut self) -> bool {
        let outbound = self.server.drain_outbox();
        let progressed = !outbound.is_empty();

        for out in outbound {
            let datagram = Datagram {
                peer: out.to,
                bytes: out.message.encode_to_vec(),
            };
            match out.channel() {
                Channel::Reliable => Self::enqueue_reliable(
                    &mut self.to_client_reliable,
                    datagram,
                    &self.chaos,
                    &mut self.rng,
                    &mut self.stats,
                ),
                Channel::Unreliable => Self::enqueue_unreliable(
                    &mut self.to_client_unreliable,
                    datagram,
                    &self.chaos,
                    &mut self.rng,
                    &mut self.stats,
                ),
            }
        }

        progressed
    }

    fn deliver_to_server(&mut self) -> bool {
        let reliable = std::mem::take(&mut self.to_server_reliable);
        let unreliable = std::mem::take(&mut self.to_server_unreliable);
        let progressed = !reliable.is_empty() || !unreliable.is_empty();

        for datagram in reliable.into_iter().chain(unreliable) {
            self.stats.delivered += 1;
            self.server.handle_datagram(datagram.peer, &datagram.bytes);
        }

        progressed
    }

    fn deliver_to_clients(&mut self) -> bool {
        let now = self.now;
        let mut deferred = false;

        let mut stalled: BTreeSet<ParticipantId> = self
            .nodes
            .iter()
            .filter(|n| n.reliable_held)
            .filter_map(|n| n.link)
            .collect();
        let waiting: BTreeSet<ParticipantId> =
            self.to_client_reliable.iter().map(|d| d.peer).collect();
        for peer in waiting {
            if !stalled.contains(&peer) && self.rng.gen_bool(self.chaos.reliable_stall_prob) {
                self.stats.stalled += 1;
                stalled.insert(peer);
                deferred = true;
            }
        }

        // Stalled datagrams keep their relative order at the queue front.
        let mut batch = Vec::new();
        for datagram in std::mem::take(&mut self.to_client_reliable) {
            if stalled.contains(&datagram.peer) {
                self.to_client_reliable.push_back(datagram);
            } else {
                batch.push(datagram);
            }
        }

        if !self.unreliable_held {
            for datagram in std::mem::take(&mut self.to_client_unreliable) {
                if self.rng.gen_bool(self.chaos.unreliable_delay_prob) {
                    self.stats.delayed += 1;
                    deferred = true;
                    self.to_client_unreliable.push(datagram);
                } else {
                    batch.push(datagram);
                }
            }
        }

        let progressed = deferred || !batch.is_empty();
        for datagram in batch {
            let Some(node) = self
                .nodes
                .iter_mut()
                .find(|n| n.link == Some(datagram.peer))
            else {
                trace!(peer = %datagram.peer, "no open link, datagram discarded");
                continue;
            };
            self.stats.delivered += 1;
            node.client.handle_datagram(&datagram.bytes, now);
        }

        progressed
    }

    fn enqueue_reliable(
        queue: &mut VecDeque<Datagram>,
        datagram: Datagram,
        chaos: &ChaosConfig,
        rng: &mut StdRng,
        stats: &mut LinkStats,
    ) {
        stats.sent += 1;
        if rng.gen_bool(chaos.reliable_duplicate_prob) {
            stats.duplicated += 1;
            queue.push_back(Datagram {
                peer: datagram.peer,
                bytes: datagram.bytes.clone(),
            });
        }
        queue.push_back(datagram);
    }

    fn enqueue_unreliable(
        queue: &mut Vec<Datagram>,
        datagram: Datagram,
        chaos: &ChaosConfig,
        rng: &mut StdRng,
        stats: &mut LinkStats,
    ) {
        stats.sent += 1;
        if rng.gen_bool(chaos.unreliable_loss_prob) {
            stats.lost += 1;
            return;
        }
        queue.push(datagram);
        let last = queue.len() - 1;
        if last > 0 && rng.gen_bool(chaos.unreliable_reorder_prob) {
            stats.reordered += 1;
            queue.swap(last - 1, last);
        }
    }

    /// Discard in-flight datagrams for a closed link.
    fn purge(&mut self, id: ParticipantId) {
        self.to_server_reliable.retain(|d| d.peer != id);
        self.to_server_unreliable.retain(|d| d.peer != id);
        self.to_client_reliable.retain(|d| d.peer != id);
        self.to_client_unreliable.retain(|d| d.peer != id);
    }
}

// ============================================================================
// Tests
// ============================================================================
