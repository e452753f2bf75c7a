//! # Network Session
//!
//! The explicit context every transport operation runs against. It owns
//! the frame queue, the batcher, the target factory and resolver, the
//! deferred buffer and the scratch recycler. Nothing here is global: two
//! sessions in one process do not see each other.
//!
//! ## Tick
//!
//! ```text
//! EarlyUpdate     poll transport ──► unbatch ──► inbound frames (per stage)
//! <every stage>   inbound frame ──► relay | defer | MessageHandler
//! FixedUpdate     processed at most once per tick
//! PostLateUpdate  outbound frame ──► batcher ──► Transport
//!                 purge deferred, rotate both rings, tick += 1
//! ```
//!
//! ## Sending
//!
//! ```text
//! send_rpc ──► scratch (RpcBody + args) ──► resolve target
//!                                              │
//!              remote ─┬─ server / direct ─────┼──► outbound record to each id
//!                      └─ client to peers ─────┼──► proxy envelope to the server
//!              local  ─┬─ immediate ───────────┴──► handler now
//!                      └─ defer_local ─────────────► inbound loopback, next tick
//! ```

use std::collections::HashMap;

use conduit_core::Recycler;

use crate::batching::{push_length, MessageBatcher};
use crate::config::TransportConfig;
use crate::deferred::{DeferredMessage, DeferredMessages};
use crate::dispatch::{rpc_hash, CustomMessages, MessageHandler, RpcBody};
use crate::error::{NetworkError, NetworkResult};
use crate::message::{Direction, MessageKind, NetworkDelivery, UpdateStage, WireHeader};
use crate::protocol::{
    read_field_delta, read_varint_u16, read_varint_u64, write_field_delta, write_varint_u16,
    write_varint_u64, BufferReader, FieldDeltaOutcome, FieldSet, ScratchBuffer,
    Vector3DeltaCompressor,
};
use crate::queue::{FrameQueue, ItemHeader, RecordHeader, ShutdownReport};
use crate::target::{
    read_proxy, write_proxy, ProxyHeader, Resolution, ResolveContext, RpcTargets, SendTo,
    TargetRef, TargetResolver,
};
use crate::transport::{ChannelKind, Transport};
use crate::SERVER_CLIENT_ID;

const SERVER_ONLY: [u64; 1] = [SERVER_CLIENT_ID];

/// Scratch buffers kept for reuse.
const SCRATCH_RETAINED: usize = 4;

/// What the local process is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionRole {
    /// Dedicated server, no local client.
    Server,
    /// Server that also runs a local client.
    Host,
    /// Client connected to a server.
    Client,
}

impl SessionRole {
    /// True for [`SessionRole::Server`] and [`SessionRole::Host`].
    #[inline]
    #[must_use]
    pub const fn is_server(self) -> bool {
        matches!(self, Self::Server | Self::Host)
    }

    /// True when a client runs in this process.
    #[inline]
    #[must_use]
    pub const fn has_local_client(self) -> bool {
        matches!(self, Self::Host | Self::Client)
    }
}

/// Routing facts of a spawned object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectRoute {
    /// Object id.
    pub object_id: u64,
    /// Client that owns the object.
    pub owner: u64,
    /// Clients that observe the object.
    pub observers: Vec<u64>,
}

impl ObjectRoute {
    /// Creates a route.
    #[must_use]
    pub fn new(object_id: u64, owner: u64, observers: Vec<u64>) -> Self {
        Self {
            object_id,
            owner,
            observers,
        }
    }
}

/// Per-call options.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RpcParams {
    /// Delivery class.
    pub delivery: NetworkDelivery,
    /// Stage the destinations process the call in.
    pub stage: UpdateStage,
    /// Run the local part on the next tick instead of immediately.
    pub defer_local: bool,
    /// Target used with [`SendTo::SpecifiedInParams`].
    pub target: Option<TargetRef>,
    /// Behaviour of the object that owns the procedure.
    pub behaviour_index: u16,
}

impl RpcParams {
    /// Reliable, processed in `Update`, local part immediate.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            delivery: NetworkDelivery::Reliable,
            stage: UpdateStage::Update,
            defer_local: false,
            target: None,
            behaviour_index: 0,
        }
    }
}

impl Default for RpcParams {
    fn default() -> Self {
        Self::new()
    }
}

/// Session counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Outbound records written.
    pub messages_sent: u64,
    /// Inbound records written from the transport.
    pub messages_received: u64,
    /// Local parts run or looped back.
    pub local_invocations: u64,
    /// Proxy envelopes forwarded by this relay.
    pub messages_relayed: u64,
    /// Messages parked for an unknown object.
    pub messages_deferred: u64,
    /// Messages dropped anywhere in the session.
    pub messages_dropped: u64,
}

/// A message on its way into the queue.
struct Outgoing<'a> {
    kind: MessageKind,
    stage: UpdateStage,
    delivery: NetworkDelivery,
    defer_local: bool,
    body: &'a [u8],
}

/// The transport session.
pub struct NetworkSession {
    config: TransportConfig,
    local_id: u64,
    role: SessionRole,
    server_is_host: bool,
    connected: Vec<u64>,
    objects: HashMap<u64, ObjectRoute>,
    queue: FrameQueue,
    batcher: MessageBatcher,
    resolver: TargetResolver,
    targets: RpcTargets,
    deferred: DeferredMessages,
    scratch: Recycler<ScratchBuffer>,
    /// Payload copied out of the inbound frame being processed.
    item_payload: Vec<u8>,
    proxy_targets: Vec<u64>,
    send_targets: Vec<u64>,
    /// One-item batch used when batching is off.
    single_batch: Vec<u8>,
    compressor: Vector3DeltaCompressor,
    time: f32,
    tick: u64,
    fixed_update_ran: bool,
    stats: SessionStats,
}

impl NetworkSession {
    /// Creates a session.
    ///
    /// Servers and hosts use [`SERVER_CLIENT_ID`]; clients use any other id.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::InvalidConfig`] when `config` does not
    /// validate or `local_id` does not fit `role`.
    pub fn new(config: TransportConfig, role: SessionRole, local_id: u64) -> NetworkResult<Self> {
        config.validate()?;
        if role.is_server() != (local_id == SERVER_CLIENT_ID) {
            return Err(NetworkError::InvalidConfig(format!(
                "{role:?} cannot use client id {local_id}"
            )));
        }
        let compressor = Vector3DeltaCompressor::new(config.delta_precision)?;
        let scratch_size = config.max_message_size;

        let session = Self {
            local_id,
            role,
            server_is_host: role == SessionRole::Host,
            connected: if role.has_local_client() {
                vec![local_id]
            } else {
                Vec::new()
            },
            objects: HashMap::new(),
            queue: FrameQueue::new(&config),
            batcher: MessageBatcher::new(config.batch_boundary, config.fragmentation_threshold),
            resolver: TargetResolver::new(),
            targets: RpcTargets::new(config.max_persistent_targets),
            deferred: DeferredMessages::new(
                config.deferred_messaging,
                config.deferred_timeout_ticks,
                config.max_deferred_messages,
            ),
            scratch: Recycler::new(SCRATCH_RETAINED, move || ScratchBuffer::new(scratch_size)),
            item_payload: Vec::with_capacity(config.max_message_size),
            proxy_targets: Vec::new(),
            send_targets: Vec::new(),
            single_batch: Vec::new(),
            compressor,
            time: 0.0,
            tick: 0,
            fixed_update_ran: false,
            stats: SessionStats::default(),
            config,
        };
        tracing::info!(
            "network session started as {:?} with client id {} (history depth {}, batching {})",
            role,
            local_id,
            session.queue.history_depth(),
            session.config.batching_enabled
        );
        Ok(session)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Local client id.
    #[inline]
    #[must_use]
    pub const fn local_id(&self) -> u64 {
        self.local_id
    }

    /// Local role.
    #[inline]
    #[must_use]
    pub const fn role(&self) -> SessionRole {
        self.role
    }

    /// Configuration in use.
    #[must_use]
    pub const fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Ticks completed.
    #[inline]
    #[must_use]
    pub const fn tick(&self) -> u64 {
        self.tick
    }

    /// Session time stamped on new records.
    #[must_use]
    pub const fn time(&self) -> f32 {
        self.time
    }

    /// Sets the session time.
    pub fn set_time(&mut self, time: f32) {
        self.time = time;
    }

    /// True when the server also runs a local client.
    #[must_use]
    pub const fn server_is_host(&self) -> bool {
        self.server_is_host
    }

    /// Tells a client whether its server is a host.
    pub fn set_server_is_host(&mut self, server_is_host: bool) {
        self.server_is_host = server_is_host;
    }

    /// Counters.
    #[must_use]
    pub const fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Frame history.
    #[must_use]
    pub const fn queue(&self) -> &FrameQueue {
        &self.queue
    }

    /// Outbound batcher.
    #[must_use]
    pub const fn batcher(&self) -> &MessageBatcher {
        &self.batcher
    }

    /// Messages waiting for their object.
    #[must_use]
    pub const fn deferred(&self) -> &DeferredMessages {
        &self.deferred
    }

    /// Target factory.
    #[must_use]
    pub const fn targets(&self) -> &RpcTargets {
        &self.targets
    }

    /// Target factory, for building temporary and persistent targets.
    pub fn targets_mut(&mut self) -> &mut RpcTargets {
        &mut self.targets
    }

    /// Vector delta compressor configured for this session.
    #[must_use]
    pub const fn compressor(&self) -> Vector3DeltaCompressor {
        self.compressor
    }

    /// Connected clients, the local one included.
    #[must_use]
    pub fn connected_clients(&self) -> &[u64] {
        &self.connected
    }

    /// Route of a spawned object.
    #[must_use]
    pub fn object(&self, object_id: u64) -> Option<&ObjectRoute> {
        self.objects.get(&object_id)
    }

    /// Runs `f` with a recycled scratch buffer.
    pub fn with_scratch<R>(&mut self, f: impl FnOnce(&mut Self, &mut ScratchBuffer) -> R) -> R {
        let mut scratch = self.scratch.acquire();
        let result = f(self, &mut scratch);
        self.scratch.release(scratch);
        result
    }

    // =========================================================================
    // Clients and objects
    // =========================================================================

    /// Registers a connected client.
    pub fn client_connected(&mut self, client: u64) {
        if self.connected.contains(&client) {
            tracing::warn!("client {} connected twice", client);
            return;
        }
        self.connected.push(client);
        tracing::info!("client {} connected", client);
    }

    /// Forgets a client: its observer entries and unsent batch go with it.
    pub fn client_disconnected(&mut self, client: u64) {
        self.connected.retain(|&id| id != client);
        for route in self.objects.values_mut() {
            route.observers.retain(|&id| id != client);
        }
        self.batcher.remove_destination(client);
        tracing::info!("client {} disconnected", client);
    }

    /// Registers a spawned object. Messages deferred for it are queued for
    /// the next tick.
    pub fn spawn_object(&mut self, route: ObjectRoute) {
        let object_id = route.object_id;
        self.objects.insert(object_id, route);

        if self.deferred.object_spawned(object_id) == 0 {
            return;
        }
        for message in self.deferred.take_ready() {
            let record = RecordHeader {
                kind: message.kind,
                stage: message.stage,
                sender: message.sender,
                delivery: NetworkDelivery::Reliable,
                timestamp: self.time,
                targets: &[],
            };
            let replayed = write_record(&mut self.queue, Direction::Inbound, &record, true, |buffer| {
                buffer.write_bytes(&message.payload)
            });
            if let Err(error) = replayed {
                self.stats.messages_dropped += 1;
                tracing::error!(
                    "deferred {:?} for object {} lost on replay: {}",
                    message.kind,
                    object_id,
                    error
                );
            }
        }
    }

    /// Forgets a despawned object.
    pub fn despawn_object(&mut self, object_id: u64) -> Option<ObjectRoute> {
        self.objects.remove(&object_id)
    }

    /// Changes the owner of an object.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::UnknownObject`] for objects not spawned.
    pub fn set_owner(&mut self, object_id: u64, owner: u64) -> NetworkResult<()> {
        self.route_mut(object_id)?.owner = owner;
        Ok(())
    }

    /// Adds an observer to an object.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::UnknownObject`] for objects not spawned.
    pub fn add_observer(&mut self, object_id: u64, client: u64) -> NetworkResult<()> {
        let route = self.route_mut(object_id)?;
        if !route.observers.contains(&client) {
            route.observers.push(client);
        }
        Ok(())
    }

    /// Removes an observer from an object.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::UnknownObject`] for objects not spawned.
    pub fn remove_observer(&mut self, object_id: u64, client: u64) -> NetworkResult<()> {
        self.route_mut(object_id)?.observers.retain(|&id| id != client);
        Ok(())
    }

    fn route_mut(&mut self, object_id: u64) -> NetworkResult<&mut ObjectRoute> {
        self.objects
            .get_mut(&object_id)
            .ok_or(NetworkError::UnknownObject(object_id))
    }

    // =========================================================================
    // Sending
    // =========================================================================

    /// Sends a procedure call on `object_id`.
    ///
    /// `args` packs the arguments after the call prefix. The remote part is
    /// queued for the end of the tick; the local part, when the local
    /// process is a destination, runs through `local_handler` now or is
    /// looped back to the next tick with [`RpcParams::defer_local`].
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::MissingTarget`] and
    /// [`NetworkError::InvalidTarget`] for unusable targets,
    /// [`NetworkError::UnknownObject`] for objects not spawned and
    /// [`NetworkError::Overflow`] when the call does not fit; nothing is
    /// queued in those cases.
    pub fn send_rpc<W>(
        &mut self,
        target: TargetRef,
        object_id: u64,
        rpc_name: &str,
        args: W,
        params: &RpcParams,
        local_handler: &mut dyn MessageHandler,
    ) -> NetworkResult<()>
    where
        W: FnOnce(&mut ScratchBuffer) -> NetworkResult<()>,
    {
        let body = RpcBody {
            object_id,
            behaviour_index: params.behaviour_index,
            rpc_hash: rpc_hash(rpc_name),
        };
        self.with_scratch(|session, scratch| {
            if let Err(error) = body.write(scratch).and_then(|()| args(scratch)) {
                session.stats.messages_dropped += 1;
                tracing::error!(
                    "rpc '{}' on object {} dropped while packing: {}",
                    rpc_name,
                    object_id,
                    error
                );
                return Err(error);
            }
            let outgoing = Outgoing {
                kind: MessageKind::Rpc,
                stage: params.stage,
                delivery: params.delivery,
                defer_local: params.defer_local,
                body: scratch.as_slice(),
            };
            session.route_object(target, params.target, object_id, &outgoing, local_handler)
        })
    }

    /// Sends the dirty fields of one object behaviour to every observer but
    /// the local process.
    ///
    /// # Errors
    ///
    /// Same as [`NetworkSession::send_rpc`].
    pub fn send_field_delta(
        &mut self,
        object_id: u64,
        behaviour_index: u16,
        fields: &dyn FieldSet,
        params: &RpcParams,
        local_handler: &mut dyn MessageHandler,
    ) -> NetworkResult<()> {
        let length_safe = self.config.ensure_length_safety;
        self.with_scratch(|session, scratch| {
            write_varint_u64(scratch, object_id)?;
            write_varint_u16(scratch, behaviour_index)?;
            session.with_scratch(|_, staging| {
                write_field_delta(fields, scratch, staging, length_safe)
            })?;
            let outgoing = Outgoing {
                kind: MessageKind::NetworkVariableDelta,
                stage: params.stage,
                delivery: params.delivery,
                defer_local: params.defer_local,
                body: scratch.as_slice(),
            };
            session.route_object(
                SendTo::NotMe.into(),
                None,
                object_id,
                &outgoing,
                local_handler,
            )
        })
    }

    /// Decodes a field delta message and applies it to `fields`.
    ///
    /// Returns the object id, the behaviour index and what was applied.
    ///
    /// # Errors
    ///
    /// Returns decoding errors and [`NetworkError::FieldCountMismatch`].
    pub fn apply_field_delta(
        payload: &[u8],
        sender: u64,
        fields: &mut dyn FieldSet,
        length_safe: bool,
    ) -> NetworkResult<(u64, u16, FieldDeltaOutcome)> {
        let mut reader = BufferReader::new(payload);
        let object_id = read_varint_u64(&mut reader)?;
        let behaviour_index = read_varint_u16(&mut reader)?;
        let outcome = read_field_delta(fields, &mut reader, sender, length_safe)?;
        Ok((object_id, behaviour_index, outcome))
    }

    /// Sends a message not tied to an object to an explicit client list.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::Overflow`] when the message does not fit.
    pub fn send_message(
        &mut self,
        kind: MessageKind,
        destinations: &[u64],
        payload: &[u8],
        params: &RpcParams,
        local_handler: &mut dyn MessageHandler,
    ) -> NetworkResult<()> {
        let context = ResolveContext {
            local_id: self.local_id,
            role: self.role,
            server_is_host: self.server_is_host,
            connected: &self.connected,
        };
        let resolution = self.resolver.resolve_clients(&context, destinations);
        let outgoing = Outgoing {
            kind,
            stage: params.stage,
            delivery: params.delivery,
            defer_local: params.defer_local,
            body: payload,
        };
        emit(
            &mut self.queue,
            &mut self.stats,
            self.local_id,
            self.time,
            &outgoing,
            resolution,
            local_handler,
        )
    }

    /// Sends a named custom message.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::Overflow`] when the message does not fit.
    pub fn send_named_message(
        &mut self,
        name: &str,
        destinations: &[u64],
        data: &[u8],
        params: &RpcParams,
        local_handler: &mut dyn MessageHandler,
    ) -> NetworkResult<()> {
        self.with_scratch(|session, scratch| {
            CustomMessages::write_named(scratch, name, data)?;
            session.send_message(
                MessageKind::NamedMessage,
                destinations,
                scratch.as_slice(),
                params,
                local_handler,
            )
        })
    }

    /// Sends an unnamed custom message.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::Overflow`] when the message does not fit.
    pub fn send_unnamed_message(
        &mut self,
        destinations: &[u64],
        data: &[u8],
        params: &RpcParams,
        local_handler: &mut dyn MessageHandler,
    ) -> NetworkResult<()> {
        self.send_message(MessageKind::UnnamedMessage, destinations, data, params, local_handler)
    }

    fn route_object(
        &mut self,
        target: TargetRef,
        params_target: Option<TargetRef>,
        object_id: u64,
        outgoing: &Outgoing<'_>,
        local_handler: &mut dyn MessageHandler,
    ) -> NetworkResult<()> {
        let target = match target {
            TargetRef::Fixed(SendTo::SpecifiedInParams) => {
                params_target.ok_or(NetworkError::MissingTarget)?
            }
            other => other,
        };
        let target = self.targets.get(target)?;
        let route = self
            .objects
            .get(&object_id)
            .ok_or(NetworkError::UnknownObject(object_id))?;
        let context = ResolveContext {
            local_id: self.local_id,
            role: self.role,
            server_is_host: self.server_is_host,
            connected: &self.connected,
        };
        let resolution = self.resolver.resolve(&context, target, route);
        emit(
            &mut self.queue,
            &mut self.stats,
            self.local_id,
            self.time,
            outgoing,
            resolution,
            local_handler,
        )
    }

    // =========================================================================
    // Tick
    // =========================================================================

    /// Runs one update stage.
    pub fn network_update(
        &mut self,
        stage: UpdateStage,
        transport: &mut dyn Transport,
        handler: &mut dyn MessageHandler,
    ) {
        match stage {
            UpdateStage::EarlyUpdate => {
                self.receive(transport);
            }
            UpdateStage::FixedUpdate => {
                if self.fixed_update_ran {
                    return;
                }
                self.fixed_update_ran = true;
            }
            _ => {}
        }

        self.process_inbound(stage, handler);

        if stage == UpdateStage::PostLateUpdate {
            self.send_outbound(transport);
            self.deferred.purge_expired(self.tick);
            self.queue.advance(Direction::Inbound);
            self.queue.advance(Direction::Outbound);
            self.tick += 1;
            self.fixed_update_ran = false;
        }
    }

    /// Runs every stage in order.
    pub fn run_tick(&mut self, transport: &mut dyn Transport, handler: &mut dyn MessageHandler) {
        for stage in UpdateStage::ALL {
            self.network_update(stage, transport, handler);
        }
    }

    /// Moves every received batch into the inbound frames. Returns the
    /// number of messages read.
    pub fn receive(&mut self, transport: &mut dyn Transport) -> usize {
        let mut received = 0;
        while let Some((sender, batch)) = transport.poll_receive() {
            received += MessageBatcher::receive_items(&batch, |message| {
                self.record_received(sender, message);
            });
        }
        received
    }

    fn record_received(&mut self, sender: u64, message: &[u8]) {
        let mut reader = BufferReader::new(message);
        let header = match WireHeader::read(&mut reader) {
            Ok(header) => header,
            Err(error) => {
                self.stats.messages_dropped += 1;
                tracing::warn!("unreadable message from client {}: {}", sender, error);
                return;
            }
        };
        let origin = match header.origin {
            Some(origin) if sender == SERVER_CLIENT_ID => origin,
            Some(origin) => {
                tracing::warn!(
                    "client {} claimed to forward for client {}, origin ignored",
                    sender,
                    origin
                );
                sender
            }
            None => sender,
        };

        let record = RecordHeader {
            kind: header.kind,
            stage: header.stage,
            sender: origin,
            delivery: NetworkDelivery::Reliable,
            timestamp: self.time,
            targets: &[],
        };
        let payload = reader.rest();
        match write_record(&mut self.queue, Direction::Inbound, &record, false, |buffer| {
            buffer.write_bytes(payload)
        }) {
            Ok(()) => self.stats.messages_received += 1,
            Err(error) => {
                self.stats.messages_dropped += 1;
                tracing::error!(
                    "{:?} from client {} dropped, inbound frame rejected it: {}",
                    header.kind,
                    sender,
                    error
                );
            }
        }
    }

    fn process_inbound(&mut self, stage: UpdateStage, handler: &mut dyn MessageHandler) {
        let mut payload = std::mem::take(&mut self.item_payload);
        let mut cursor = self.queue.frame(Direction::Inbound, stage).first_item();

        while let Some(item) = self
            .queue
            .frame(Direction::Inbound, stage)
            .next_item(&mut cursor, &mut payload)
        {
            if item.kind == MessageKind::Proxy {
                self.relay(&item, &payload, handler);
            } else {
                self.deliver(item.kind, item.sender, stage, &payload, handler);
            }
        }

        self.queue.frame_mut(Direction::Inbound, stage).mark_consumed();
        self.item_payload = payload;
    }

    fn deliver(
        &mut self,
        kind: MessageKind,
        sender: u64,
        stage: UpdateStage,
        payload: &[u8],
        handler: &mut dyn MessageHandler,
    ) {
        if kind.addresses_object() {
            match RpcBody::peek_object(payload) {
                Ok(object_id) if !self.objects.contains_key(&object_id) => {
                    let message = DeferredMessage::new(kind, sender, stage, payload);
                    if self.deferred.defer(object_id, message, self.tick) {
                        self.stats.messages_deferred += 1;
                    } else {
                        self.stats.messages_dropped += 1;
                    }
                    return;
                }
                Ok(_) => {}
                Err(error) => {
                    self.stats.messages_dropped += 1;
                    tracing::warn!("{:?} from client {} has no object id: {}", kind, sender, error);
                    return;
                }
            }
        }
        handler.handle(kind, sender, payload, stage);
    }

    fn relay(&mut self, item: &ItemHeader, payload: &[u8], handler: &mut dyn MessageHandler) {
        if !self.role.is_server() {
            self.stats.messages_dropped += 1;
            tracing::warn!("{} (sent by client {})", NetworkError::MisroutedProxy, item.sender);
            return;
        }
        let (inner, body) = match read_proxy(payload, self.config.max_clients, &mut self.proxy_targets)
        {
            Ok(unwrapped) => unwrapped,
            Err(error) => {
                self.stats.messages_dropped += 1;
                tracing::warn!("bad proxy envelope from client {}: {}", item.sender, error);
                return;
            }
        };

        let origin = item.sender;
        let local_id = self.local_id;
        let observers = if inner.kind.addresses_object() {
            RpcBody::peek_object(body)
                .ok()
                .and_then(|object_id| self.objects.get(&object_id))
                .map(|route| route.observers.as_slice())
        } else {
            None
        };
        let connected = &self.connected;
        let mut local = false;
        let mut refused = 0u64;
        self.proxy_targets.retain(|&id| {
            if id == local_id {
                local = true;
                return false;
            }
            let allowed = id != origin
                && connected.contains(&id)
                && observers.map_or(true, |observers| observers.contains(&id));
            if !allowed {
                refused += 1;
            }
            allowed
        });
        if refused > 0 {
            self.stats.messages_dropped += refused;
            tracing::warn!(
                "proxy from client {} named {} destinations that are not connected observers, not forwarded",
                origin,
                refused
            );
        }

        if !self.proxy_targets.is_empty() {
            let record = RecordHeader {
                kind: inner.kind,
                stage: UpdateStage::PostLateUpdate,
                sender: origin,
                delivery: inner.delivery,
                timestamp: self.time,
                targets: &self.proxy_targets,
            };
            let wire = WireHeader {
                kind: inner.kind,
                stage: inner.stage,
                origin: Some(origin),
            };
            match write_record(&mut self.queue, Direction::Outbound, &record, false, |buffer| {
                wire.write(buffer)?;
                buffer.write_bytes(body)
            }) {
                Ok(()) => self.stats.messages_relayed += 1,
                Err(error) => {
                    self.stats.messages_dropped += 1;
                    tracing::error!("relay of {:?} for client {} failed: {}", inner.kind, origin, error);
                }
            }
        }
        if local {
            self.deliver(inner.kind, origin, inner.stage, body, handler);
        }
    }

    fn send_outbound(&mut self, transport: &mut dyn Transport) {
        let frame = self
            .queue
            .frame(Direction::Outbound, UpdateStage::PostLateUpdate);
        let threshold = self.config.batch_threshold;
        let fragmentation = self.config.fragmentation_threshold;

        for item in frame.items() {
            self.send_targets.clear();
            self.send_targets.extend(item.targets());

            if self.config.batching_enabled {
                let queued = self.batcher.queue_item(
                    &self.send_targets,
                    item.payload,
                    item.header.delivery,
                    threshold,
                    |destination, bytes, channel| transport.send(destination, bytes, channel),
                );
                if let Err(error) = queued {
                    self.stats.messages_dropped += 1;
                    tracing::warn!("{:?} not sent: {}", item.header.kind, error);
                }
                continue;
            }

            self.single_batch.clear();
            push_length(&mut self.single_batch, item.payload.len());
            self.single_batch.extend_from_slice(item.payload);
            let channel = if self.single_batch.len() > fragmentation {
                ChannelKind::Fragmented
            } else {
                item.header.delivery.channel()
            };
            for &destination in &self.send_targets {
                transport.send(destination, &self.single_batch, channel);
            }
        }

        if self.config.batching_enabled {
            self.batcher
                .flush_all(|destination, bytes, channel| transport.send(destination, bytes, channel));
        }
    }

    /// Stops the session: drains every frame, drops unsent batches and
    /// deferred messages.
    pub fn shutdown(&mut self) -> ShutdownReport {
        let report = self.queue.shutdown();
        let unsent = self.batcher.shutdown();
        let deferred = self.deferred.clear();
        tracing::info!(
            "network session {} shut down after {} ticks: {} frames drained, {} unsent bytes, {} deferred messages dropped",
            self.local_id,
            self.tick,
            report.drained_frames,
            unsent,
            deferred
        );
        report
    }
}

/// Writes one record; a failing body rolls it back.
fn write_record(
    queue: &mut FrameQueue,
    direction: Direction,
    record: &RecordHeader<'_>,
    loopback: bool,
    body: impl FnOnce(&mut ScratchBuffer) -> NetworkResult<()>,
) -> NetworkResult<()> {
    let mut write = queue.begin_write(direction, record, loopback)?;
    body(write.buffer())?;
    write.commit()?;
    Ok(())
}

/// Queues the remote part of a resolved message, then runs or loops back
/// the local part.
fn emit(
    queue: &mut FrameQueue,
    stats: &mut SessionStats,
    local_id: u64,
    time: f32,
    outgoing: &Outgoing<'_>,
    resolution: Resolution<'_>,
    local_handler: &mut dyn MessageHandler,
) -> NetworkResult<()> {
    if !resolution.remote.is_empty() {
        let (kind, targets) = if resolution.via_relay {
            (MessageKind::Proxy, &SERVER_ONLY[..])
        } else {
            (outgoing.kind, resolution.remote)
        };
        let record = RecordHeader {
            kind,
            stage: UpdateStage::PostLateUpdate,
            sender: local_id,
            delivery: outgoing.delivery,
            timestamp: time,
            targets,
        };
        let written = write_record(queue, Direction::Outbound, &record, false, |buffer| {
            WireHeader::new(kind, outgoing.stage).write(buffer)?;
            if resolution.via_relay {
                let inner = ProxyHeader {
                    kind: outgoing.kind,
                    stage: outgoing.stage,
                    delivery: outgoing.delivery,
                };
                write_proxy(buffer, resolution.remote, inner, outgoing.body)
            } else {
                buffer.write_bytes(outgoing.body)
            }
        });
        if let Err(error) = written {
            stats.messages_dropped += 1;
            tracing::error!("{:?} dropped, outbound frame rejected it: {}", outgoing.kind, error);
            return Err(error);
        }
        stats.messages_sent += 1;
    }

    if resolution.local {
        stats.local_invocations += 1;
        if outgoing.defer_local {
            let record = RecordHeader {
                kind: outgoing.kind,
                stage: outgoing.stage,
                sender: local_id,
                delivery: outgoing.delivery,
                timestamp: time,
                targets: &[],
            };
            write_record(queue, Direction::Inbound, &record, true, |buffer| {
                buffer.write_bytes(outgoing.body)
            })
            .map_err(|error| {
                stats.messages_dropped += 1;
                tracing::error!("local {:?} lost, loopback rejected it: {}", outgoing.kind, error);
                error
            })?;
        } else {
            local_handler.handle(outgoing.kind, local_id, outgoing.body, outgoing.stage);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Packable;
    use crate::transport::RecordingTransport;

    #[derive(Default)]
    struct Recorder {
        seen: Vec<(MessageKind, u64, Vec<u8>, UpdateStage)>,
    }

    impl MessageHandler for Recorder {
        fn handle(&mut self, kind: MessageKind, sender: u64, payload: &[u8], stage: UpdateStage) {
            self.seen.push((kind, sender, payload.to_vec(), stage));
        }
    }

    fn config() -> TransportConfig {
        TransportConfig {
            max_message_size: 1024,
            frame_buffer_size: 8 * 1024,
            ..TransportConfig::default()
        }
    }

    fn host() -> NetworkSession {
        let mut session = NetworkSession::new(config(), SessionRole::Host, 0).unwrap();
        session.client_connected(1);
        session.client_connected(2);
        session.spawn_object(ObjectRoute::new(7, 1, vec![0, 1, 2]));
        session
    }

    fn batch(messages: &[Vec<u8>]) -> Vec<u8> {
        let mut out = Vec::new();
        for message in messages {
            push_length(&mut out, message.len());
            out.extend_from_slice(message);
        }
        out
    }

    fn wire(header: WireHeader, body: &[u8]) -> Vec<u8> {
        let mut buffer = ScratchBuffer::new(256);
        header.write(&mut buffer).unwrap();
        buffer.write_bytes(body).unwrap();
        buffer.as_slice().to_vec()
    }

    fn rpc_payload(object_id: u64) -> Vec<u8> {
        let mut buffer = ScratchBuffer::new(64);
        RpcBody {
            object_id,
            behaviour_index: 0,
            rpc_hash: rpc_hash("Ping"),
        }
        .write(&mut buffer)
        .unwrap();
        buffer.as_slice().to_vec()
    }

    fn unbatch(bytes: &[u8]) -> Vec<Vec<u8>> {
        let mut items = Vec::new();
        MessageBatcher::receive_items(bytes, |item| items.push(item.to_vec()));
        items
    }

    #[test]
    fn test_role_must_match_id() {
        assert!(NetworkSession::new(config(), SessionRole::Client, 0).is_err());
        assert!(NetworkSession::new(config(), SessionRole::Server, 3).is_err());
        assert!(NetworkSession::new(config(), SessionRole::Client, 3).is_ok());

        let server = NetworkSession::new(config(), SessionRole::Server, 0).unwrap();
        assert!(server.connected_clients().is_empty());
    }

    #[test]
    fn test_everyone_from_host() {
        let mut session = host();
        let mut local = Recorder::default();
        let mut transport = RecordingTransport::new(0);

        session
            .send_rpc(
                SendTo::Everyone.into(),
                7,
                "Fire",
                |buffer| 5u32.write_packed(buffer),
                &RpcParams::default(),
                &mut local,
            )
            .unwrap();
        assert_eq!(local.seen.len(), 1);
        assert_eq!(local.seen[0].0, MessageKind::Rpc);
        assert_eq!(local.seen[0].1, 0);

        session.run_tick(&mut transport, &mut local);
        assert_eq!(transport.sent.len(), 2);
        for (datagram, client) in transport.sent.iter().zip([1, 2]) {
            assert_eq!(datagram.destination, client);
            assert_eq!(datagram.channel, ChannelKind::Reliable);

            let items = unbatch(&datagram.bytes);
            assert_eq!(items.len(), 1);
            let mut reader = BufferReader::new(&items[0]);
            let header = WireHeader::read(&mut reader).unwrap();
            assert_eq!(header, WireHeader::new(MessageKind::Rpc, UpdateStage::Update));
            let body = RpcBody::read(&mut reader).unwrap();
            assert_eq!(body.object_id, 7);
            assert_eq!(body.rpc_hash, rpc_hash("Fire"));
            assert_eq!(u32::read_packed(&mut reader), Ok(5));
        }
        assert_eq!(local.seen.len(), 1);
        assert_eq!(session.stats().messages_sent, 1);
    }

    #[test]
    fn test_defer_local_runs_next_tick() {
        let mut session = host();
        let mut local = Recorder::default();
        let mut transport = RecordingTransport::new(0);
        let params = RpcParams {
            defer_local: true,
            ..RpcParams::default()
        };

        session
            .send_rpc(SendTo::Me.into(), 7, "Ping", |_| Ok(()), &params, &mut local)
            .unwrap();
        assert!(local.seen.is_empty());

        session.run_tick(&mut transport, &mut local);
        assert!(local.seen.is_empty());

        session.run_tick(&mut transport, &mut local);
        assert_eq!(local.seen.len(), 1);
        assert_eq!(local.seen[0].3, UpdateStage::Update);
        assert!(transport.sent.is_empty());

        session.run_tick(&mut transport, &mut local);
        assert_eq!(local.seen.len(), 1);
    }

    #[test]
    fn test_client_broadcast_is_wrapped_for_relay() {
        let mut session = NetworkSession::new(config(), SessionRole::Client, 1).unwrap();
        session.spawn_object(ObjectRoute::new(7, 1, vec![1, 2]));
        let mut local = Recorder::default();
        let mut transport = RecordingTransport::new(1);

        session
            .send_rpc(SendTo::Everyone.into(), 7, "Wave", |_| Ok(()), &RpcParams::default(), &mut local)
            .unwrap();
        assert_eq!(local.seen.len(), 1);

        session.run_tick(&mut transport, &mut local);
        assert_eq!(transport.sent.len(), 1);
        assert_eq!(transport.sent[0].destination, 0);

        let items = unbatch(&transport.sent[0].bytes);
        let mut reader = BufferReader::new(&items[0]);
        let header = WireHeader::read(&mut reader).unwrap();
        assert_eq!(header.kind, MessageKind::Proxy);

        let mut targets = Vec::new();
        let (inner, body) = read_proxy(reader.rest(), 8, &mut targets).unwrap();
        assert_eq!(targets, vec![0, 2]);
        assert_eq!(inner.kind, MessageKind::Rpc);
        assert_eq!(RpcBody::peek_object(body), Ok(7));
    }

    #[test]
    fn test_server_relays_envelope() {
        let mut server = NetworkSession::new(config(), SessionRole::Server, 0).unwrap();
        server.client_connected(1);
        server.client_connected(2);
        server.spawn_object(ObjectRoute::new(7, 1, vec![1, 2]));

        let mut envelope = ScratchBuffer::new(256);
        WireHeader::new(MessageKind::Proxy, UpdateStage::Update)
            .write(&mut envelope)
            .unwrap();
        let inner = ProxyHeader {
            kind: MessageKind::Rpc,
            stage: UpdateStage::Update,
            delivery: NetworkDelivery::ReliableSequenced,
        };
        write_proxy(&mut envelope, &[0, 2], inner, &rpc_payload(7)).unwrap();

        let mut transport = RecordingTransport::new(0);
        transport.push_incoming(1, batch(&[envelope.as_slice().to_vec()]));
        let mut handler = Recorder::default();
        server.run_tick(&mut transport, &mut handler);

        assert_eq!(handler.seen.len(), 1);
        assert_eq!(handler.seen[0].1, 1);

        assert_eq!(transport.sent.len(), 1);
        let forwarded = &transport.sent[0];
        assert_eq!(forwarded.destination, 2);
        assert_eq!(forwarded.channel, ChannelKind::ReliableSequenced);
        let items = unbatch(&forwarded.bytes);
        let mut reader = BufferReader::new(&items[0]);
        let header = WireHeader::read(&mut reader).unwrap();
        assert_eq!(header.kind, MessageKind::Rpc);
        assert_eq!(header.origin, Some(1));
        assert_eq!(reader.rest(), rpc_payload(7).as_slice());
        assert_eq!(server.stats().messages_relayed, 1);
    }

    #[test]
    fn test_relay_forwards_only_to_connected_observers() {
        let mut server = NetworkSession::new(config(), SessionRole::Server, 0).unwrap();
        server.client_connected(1);
        server.client_connected(2);
        server.client_connected(3);
        server.spawn_object(ObjectRoute::new(7, 1, vec![1, 2]));

        let mut envelope = ScratchBuffer::new(256);
        WireHeader::new(MessageKind::Proxy, UpdateStage::Update)
            .write(&mut envelope)
            .unwrap();
        let inner = ProxyHeader {
            kind: MessageKind::Rpc,
            stage: UpdateStage::Update,
            delivery: NetworkDelivery::Reliable,
        };
        // 1 is the sender, 99 is not connected, 3 does not observe object 7.
        write_proxy(&mut envelope, &[1, 2, 3, 99], inner, &rpc_payload(7)).unwrap();

        let mut transport = RecordingTransport::new(0);
        transport.push_incoming(1, batch(&[envelope.as_slice().to_vec()]));
        let mut handler = Recorder::default();
        server.run_tick(&mut transport, &mut handler);

        let destinations: Vec<u64> = transport.sent.iter().map(|d| d.destination).collect();
        assert_eq!(destinations, vec![2]);
        assert!(handler.seen.is_empty());
        assert_eq!(server.stats().messages_relayed, 1);
        assert_eq!(server.stats().messages_dropped, 3);
    }

    struct Score(u32);

    impl FieldSet for Score {
        fn field_count(&self) -> usize {
            1
        }

        fn is_dirty(&self, _field: usize) -> bool {
            true
        }

        fn can_write(&self, _field: usize, sender: u64) -> bool {
            sender == SERVER_CLIENT_ID
        }

        fn write_field(&self, _field: usize, buffer: &mut ScratchBuffer) -> NetworkResult<()> {
            self.0.write_packed(buffer)
        }

        fn read_field(&mut self, _field: usize, reader: &mut BufferReader<'_>) -> NetworkResult<()> {
            self.0 = u32::read_packed(reader)?;
            Ok(())
        }
    }

    #[test]
    fn test_field_deltas_reuse_scratch_buffers() {
        let mut session = host();
        let mut handler = Recorder::default();
        let params = RpcParams::new();

        session
            .send_field_delta(7, 0, &Score(10), &params, &mut handler)
            .unwrap();
        assert_eq!(session.scratch.available(), 2);
        for value in 11..20 {
            session
                .send_field_delta(7, 0, &Score(value), &params, &mut handler)
                .unwrap();
        }
        assert_eq!(session.scratch.available(), 2);

        let frame = session
            .queue()
            .frame(Direction::Outbound, UpdateStage::PostLateUpdate);
        let first = frame.items().next().unwrap();
        let mut reader = BufferReader::new(first.payload);
        WireHeader::read(&mut reader).unwrap();
        let mut replica = Score(0);
        let (object_id, _, outcome) =
            NetworkSession::apply_field_delta(reader.rest(), 0, &mut replica, true).unwrap();
        assert_eq!(object_id, 7);
        assert_eq!(outcome.applied, vec![0]);
        assert_eq!(replica.0, 10);
    }

    #[test]
    fn test_relay_with_no_valid_destination_sends_nothing() {
        let mut server = NetworkSession::new(config(), SessionRole::Server, 0).unwrap();
        server.client_connected(1);

        let mut envelope = ScratchBuffer::new(256);
        WireHeader::new(MessageKind::Proxy, UpdateStage::Update)
            .write(&mut envelope)
            .unwrap();
        let inner = ProxyHeader {
            kind: MessageKind::UnnamedMessage,
            stage: UpdateStage::Update,
            delivery: NetworkDelivery::Reliable,
        };
        write_proxy(&mut envelope, &[1, 42], inner, b"hi").unwrap();

        let mut transport = RecordingTransport::new(0);
        transport.push_incoming(1, batch(&[envelope.as_slice().to_vec()]));
        let mut handler = Recorder::default();
        server.run_tick(&mut transport, &mut handler);

        assert!(transport.sent.is_empty());
        assert_eq!(server.stats().messages_relayed, 0);
        assert_eq!(server.stats().messages_dropped, 2);
    }

    #[test]
    fn test_client_drops_proxy() {
        let mut session = NetworkSession::new(config(), SessionRole::Client, 1).unwrap();
        let mut transport = RecordingTransport::new(1);
        let envelope = wire(WireHeader::new(MessageKind::Proxy, UpdateStage::Update), &[0]);
        transport.push_incoming(0, batch(&[envelope]));

        let mut handler = Recorder::default();
        session.run_tick(&mut transport, &mut handler);
        assert!(handler.seen.is_empty());
        assert_eq!(session.stats().messages_dropped, 1);
    }

    #[test]
    fn test_origin_trusted_only_from_server() {
        let forwarded = wire(
            WireHeader {
                kind: MessageKind::UnnamedMessage,
                stage: UpdateStage::Update,
                origin: Some(5),
            },
            b"hi",
        );

        let mut client = NetworkSession::new(config(), SessionRole::Client, 2).unwrap();
        let mut transport = RecordingTransport::new(2);
        transport.push_incoming(0, batch(&[forwarded.clone()]));
        let mut handler = Recorder::default();
        client.run_tick(&mut transport, &mut handler);
        assert_eq!(handler.seen[0].1, 5);
        assert_eq!(handler.seen[0].2, b"hi");

        let mut server = NetworkSession::new(config(), SessionRole::Server, 0).unwrap();
        let mut transport = RecordingTransport::new(0);
        transport.push_incoming(3, batch(&[forwarded]));
        let mut handler = Recorder::default();
        server.run_tick(&mut transport, &mut handler);
        assert_eq!(handler.seen[0].1, 3);
    }

    #[test]
    fn test_unknown_object_waits_for_spawn() {
        let mut session = NetworkSession::new(config(), SessionRole::Client, 1).unwrap();
        let mut transport = RecordingTransport::new(1);
        let message = wire(WireHeader::new(MessageKind::Rpc, UpdateStage::Update), &rpc_payload(9));
        transport.push_incoming(0, batch(&[message]));

        let mut handler = Recorder::default();
        session.run_tick(&mut transport, &mut handler);
        assert!(handler.seen.is_empty());
        assert_eq!(session.deferred().len(), 1);

        session.spawn_object(ObjectRoute::new(9, 0, vec![1]));
        assert!(session.deferred().is_empty());
        session.run_tick(&mut transport, &mut handler);
        session.run_tick(&mut transport, &mut handler);
        assert_eq!(handler.seen.len(), 1);
        assert_eq!(handler.seen[0].1, 0);
        assert_eq!(handler.seen[0].3, UpdateStage::Update);
    }

    #[test]
    fn test_deferred_message_expires() {
        let config = TransportConfig {
            deferred_timeout_ticks: 2,
            ..config()
        };
        let mut session = NetworkSession::new(config, SessionRole::Client, 1).unwrap();
        let mut transport = RecordingTransport::new(1);
        let message = wire(WireHeader::new(MessageKind::Rpc, UpdateStage::Update), &rpc_payload(9));
        transport.push_incoming(0, batch(&[message]));

        let mut handler = Recorder::default();
        for _ in 0..3 {
            session.run_tick(&mut transport, &mut handler);
        }
        assert!(session.deferred().is_empty());
        session.spawn_object(ObjectRoute::new(9, 0, vec![1]));
        session.run_tick(&mut transport, &mut handler);
        session.run_tick(&mut transport, &mut handler);
        assert!(handler.seen.is_empty());
    }

    #[test]
    fn test_fixed_update_once_per_tick() {
        let mut session = NetworkSession::new(config(), SessionRole::Client, 1).unwrap();
        let mut transport = RecordingTransport::new(1);
        let message = wire(WireHeader::new(MessageKind::UnnamedMessage, UpdateStage::FixedUpdate), b"x");
        transport.push_incoming(0, batch(&[message]));

        let mut handler = Recorder::default();
        session.network_update(UpdateStage::EarlyUpdate, &mut transport, &mut handler);
        session.network_update(UpdateStage::FixedUpdate, &mut transport, &mut handler);
        session.network_update(UpdateStage::FixedUpdate, &mut transport, &mut handler);
        assert_eq!(handler.seen.len(), 1);
    }

    #[test]
    fn test_batching_toggle() {
        let mut local = Recorder::default();
        let params = RpcParams::default();

        let mut batched = host();
        let mut transport = RecordingTransport::new(0);
        batched.send_unnamed_message(&[1], b"a", &params, &mut local).unwrap();
        batched.send_unnamed_message(&[1], b"b", &params, &mut local).unwrap();
        batched.run_tick(&mut transport, &mut local);
        assert_eq!(transport.sent_to(1).count(), 1);
        assert_eq!(unbatch(&transport.sent[0].bytes).len(), 2);

        let config = TransportConfig {
            batching_enabled: false,
            ..config()
        };
        let mut single = NetworkSession::new(config, SessionRole::Host, 0).unwrap();
        let mut transport = RecordingTransport::new(0);
        single.send_unnamed_message(&[1], b"a", &params, &mut local).unwrap();
        single.send_unnamed_message(&[1], b"b", &params, &mut local).unwrap();
        single.run_tick(&mut transport, &mut local);
        assert_eq!(transport.sent_to(1).count(), 2);
        for datagram in &transport.sent {
            assert_eq!(unbatch(&datagram.bytes).len(), 1);
        }
        assert!(local.seen.is_empty());
    }

    #[test]
    fn test_target_errors() {
        let mut session = host();
        let mut local = Recorder::default();
        let params = RpcParams::default();

        assert_eq!(
            session.send_rpc(SendTo::SpecifiedInParams.into(), 7, "Ping", |_| Ok(()), &params, &mut local),
            Err(NetworkError::MissingTarget)
        );
        assert_eq!(
            session.send_rpc(SendTo::Owner.into(), 99, "Ping", |_| Ok(()), &params, &mut local),
            Err(NetworkError::UnknownObject(99))
        );

        let single = session.targets_mut().single(2);
        let params = RpcParams {
            target: Some(single),
            ..params
        };
        session
            .send_rpc(SendTo::SpecifiedInParams.into(), 7, "Ping", |_| Ok(()), &params, &mut local)
            .unwrap();
        assert!(local.seen.is_empty());

        session.targets_mut().single(1);
        assert_eq!(
            session.send_rpc(single, 7, "Ping", |_| Ok(()), &params, &mut local),
            Err(NetworkError::InvalidTarget)
        );
    }

    #[test]
    fn test_oversized_rpc_is_rejected() {
        let mut session = host();
        let mut local = Recorder::default();
        let result = session.send_rpc(
            SendTo::NotMe.into(),
            7,
            "Blob",
            |buffer| buffer.write_bytes(&[0u8; 1020]),
            &RpcParams::default(),
            &mut local,
        );
        assert!(matches!(result, Err(NetworkError::Overflow { .. })));
        assert_eq!(session.stats().messages_dropped, 1);
        assert_eq!(session.queue().frame(Direction::Outbound, UpdateStage::PostLateUpdate).record_count(), 0);
    }

    #[test]
    fn test_disconnect_cleans_routes() {
        let mut session = host();
        session.add_observer(7, 3).unwrap();
        session.client_disconnected(2);
        assert_eq!(session.object(7).unwrap().observers, vec![0, 1, 3]);
        assert!(!session.connected_clients().contains(&2));

        session.set_owner(7, 3).unwrap();
        assert_eq!(session.object(7).unwrap().owner, 3);
        assert_eq!(session.set_owner(8, 1), Err(NetworkError::UnknownObject(8)));
        assert!(session.despawn_object(7).is_some());
    }

    #[test]
    fn test_shutdown_reports_pending_loopback() {
        let mut session = host();
        let mut local = Recorder::default();
        let params = RpcParams {
            defer_local: true,
            ..RpcParams::default()
        };
        session
            .send_rpc(SendTo::Everyone.into(), 7, "Ping", |_| Ok(()), &params, &mut local)
            .unwrap();

        let report = session.shutdown();
        assert_eq!(report.loopback_frames, 1);
        assert_eq!(report.drained_frames, 2);
        assert_eq!(session.batcher().pending_bytes(), 0);
    }
}
