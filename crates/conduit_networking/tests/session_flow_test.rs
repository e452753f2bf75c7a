//! # Session Flows
//!
//! A host and two clients wired through a [`MemoryHub`], ticked in
//! sequence the way a game loop would.

use std::cell::RefCell;
use std::rc::Rc;

use conduit_networking::protocol::FieldSet;
use conduit_networking::{
    BufferReader, Dispatcher, MemoryHub, MemoryTransport, MessageKind, NetworkResult,
    NetworkSession, ObjectRoute, Packable, RpcParams, ScratchBuffer, SendTo, SessionRole,
    TransportConfig, UpdateStage,
};

type CallLog = Rc<RefCell<Vec<(u64, u32)>>>;

struct Peer {
    session: NetworkSession,
    transport: MemoryTransport,
    dispatcher: Dispatcher,
    calls: CallLog,
}

impl Peer {
    fn new(hub: &MemoryHub, role: SessionRole, id: u64) -> Self {
        let mut session = NetworkSession::new(TransportConfig::default(), role, id).unwrap();
        session.set_server_is_host(true);

        let calls: CallLog = Rc::default();
        let mut dispatcher = Dispatcher::new();
        let log = Rc::clone(&calls);
        dispatcher
            .rpcs
            .register("Wave", move |ctx, args| {
                log.borrow_mut().push((ctx.sender, u32::read_packed(args)?));
                Ok(())
            })
            .unwrap();

        Self {
            session,
            transport: hub.connect(id),
            dispatcher,
            calls,
        }
    }

    fn tick(&mut self) {
        self.session.run_tick(&mut self.transport, &mut self.dispatcher);
    }

    fn wave(&mut self, target: SendTo, object_id: u64, value: u32) {
        self.session
            .send_rpc(
                target.into(),
                object_id,
                "Wave",
                |buffer| value.write_packed(buffer),
                &RpcParams::default(),
                &mut self.dispatcher,
            )
            .unwrap();
    }

    fn calls(&self) -> Vec<(u64, u32)> {
        self.calls.borrow().clone()
    }
}

fn network() -> (Peer, Peer, Peer) {
    let hub = MemoryHub::new();
    let mut host = Peer::new(&hub, SessionRole::Host, 0);
    let mut first = Peer::new(&hub, SessionRole::Client, 1);
    let mut second = Peer::new(&hub, SessionRole::Client, 2);

    host.session.client_connected(1);
    host.session.client_connected(2);
    for peer in [&mut host, &mut first, &mut second] {
        peer.session.spawn_object(ObjectRoute::new(7, 1, vec![0, 1, 2]));
    }
    (host, first, second)
}

#[test]
fn test_client_broadcast_reaches_everyone_once() {
    let (mut host, mut first, mut second) = network();

    first.wave(SendTo::Everyone, 7, 3);
    assert_eq!(first.calls(), vec![(1, 3)]);

    first.tick();
    host.tick();
    second.tick();

    assert_eq!(host.calls(), vec![(1, 3)]);
    assert_eq!(second.calls(), vec![(1, 3)]);
    assert_eq!(first.calls(), vec![(1, 3)]);
    assert_eq!(host.session.stats().messages_relayed, 1);
}

#[test]
fn test_owner_target_from_host() {
    let (mut host, mut first, mut second) = network();

    host.wave(SendTo::Owner, 7, 11);
    host.tick();
    first.tick();
    second.tick();

    assert!(host.calls().is_empty());
    assert_eq!(first.calls(), vec![(0, 11)]);
    assert!(second.calls().is_empty());
}

#[test]
fn test_not_owner_from_owner_is_relayed() {
    let (mut host, mut first, mut second) = network();

    first.wave(SendTo::NotOwner, 7, 5);
    assert!(first.calls().is_empty());

    first.tick();
    host.tick();
    second.tick();

    assert_eq!(host.calls(), vec![(1, 5)]);
    assert_eq!(second.calls(), vec![(1, 5)]);
}

#[test]
fn test_named_message() {
    let (mut host, mut first, mut second) = network();
    let received: Rc<RefCell<Vec<(u64, Vec<u8>)>>> = Rc::default();
    for peer in [&mut first, &mut second] {
        let log = Rc::clone(&received);
        peer.dispatcher
            .custom
            .register_named("chat", move |sender, data| log.borrow_mut().push((sender, data.to_vec())));
    }

    host.session
        .send_named_message("chat", &[1, 2], b"gg", &RpcParams::default(), &mut host.dispatcher)
        .unwrap();
    host.tick();
    first.tick();
    second.tick();

    assert_eq!(
        *received.borrow(),
        vec![(0, b"gg".to_vec()), (0, b"gg".to_vec())]
    );
}

#[test]
fn test_message_waits_for_late_spawn() {
    let (mut host, mut first, _second) = network();
    host.session.spawn_object(ObjectRoute::new(8, 0, vec![0, 1]));

    host.wave(SendTo::NotMe, 8, 42);
    host.tick();
    first.tick();
    assert!(first.calls().is_empty());
    assert_eq!(first.session.deferred().len(), 1);

    first.session.spawn_object(ObjectRoute::new(8, 0, vec![0, 1]));
    first.tick();
    first.tick();
    assert_eq!(first.calls(), vec![(0, 42)]);
}

#[test]
fn test_deferred_local_call_on_host() {
    let (mut host, _first, _second) = network();
    let params = RpcParams {
        defer_local: true,
        stage: UpdateStage::PreLateUpdate,
        ..RpcParams::default()
    };
    host.session
        .send_rpc(
            SendTo::Me.into(),
            7,
            "Wave",
            |buffer| 9u32.write_packed(buffer),
            &params,
            &mut host.dispatcher,
        )
        .unwrap();

    host.tick();
    assert!(host.calls().is_empty());
    host.tick();
    assert_eq!(host.calls(), vec![(0, 9)]);
}

#[derive(Default)]
struct Stats {
    values: [u32; 2],
    dirty: [bool; 2],
}

impl FieldSet for Stats {
    fn field_count(&self) -> usize {
        2
    }

    fn is_dirty(&self, field: usize) -> bool {
        self.dirty[field]
    }

    fn can_write(&self, _field: usize, sender: u64) -> bool {
        sender == 0
    }

    fn write_field(&self, field: usize, buffer: &mut ScratchBuffer) -> NetworkResult<()> {
        self.values[field].write_packed(buffer)
    }

    fn read_field(&mut self, field: usize, reader: &mut BufferReader<'_>) -> NetworkResult<()> {
        self.values[field] = u32::read_packed(reader)?;
        Ok(())
    }
}

#[test]
fn test_field_delta_replicates_to_observers() {
    let (mut host, mut first, mut second) = network();
    let replicas: Vec<Rc<RefCell<Stats>>> = vec![Rc::default(), Rc::default()];

    for (peer, replica) in [&mut first, &mut second].into_iter().zip(&replicas) {
        let replica = Rc::clone(replica);
        peer.dispatcher.set_fallback(
            move |kind: MessageKind, sender: u64, payload: &[u8], _stage: UpdateStage| {
                assert_eq!(kind, MessageKind::NetworkVariableDelta);
                let (object_id, behaviour, outcome) = NetworkSession::apply_field_delta(
                    payload,
                    sender,
                    &mut *replica.borrow_mut(),
                    true,
                )
                .unwrap();
                assert_eq!((object_id, behaviour), (7, 2));
                assert_eq!(outcome.applied, vec![1]);
            },
        );
    }

    let source = Stats {
        values: [0, 250],
        dirty: [false, true],
    };
    host.session
        .send_field_delta(7, 2, &source, &RpcParams::default(), &mut host.dispatcher)
        .unwrap();
    host.tick();
    first.tick();
    second.tick();

    for replica in &replicas {
        assert_eq!(replica.borrow().values, [0, 250]);
    }
}
