// End-to-end broker scenarios over the in-memory transport.
use bytes::Bytes;
use courier_broker::{Broker, LocalDirectory, Session};
use courier_client::RemoteObject;
use courier_common::Error;
use courier_object::{LocalObject, MetaObject, ServiceObject};
use courier_pool::{PoolConfig, WorkerPool};
use courier_transport::memory::MemoryServer;
use courier_transport::{MessageStream, StreamCallbacks, Url};
use courier_wire::{
    Kind, Message, SERVER_REGISTER_EVENT, SERVER_UNREGISTER_EVENT, SERVICE_SERVER, control,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

struct Harness {
    broker: Broker,
    server: Arc<MemoryServer>,
    directory: Arc<LocalDirectory>,
    pool: Arc<WorkerPool>,
}

fn harness() -> Harness {
    let server = MemoryServer::new();
    let broker = Broker::new(server.clone());
    let directory = Arc::new(LocalDirectory::new());
    let session = Session::new(directory.clone());
    let url: Url = "mem://local:1".parse().expect("url");
    assert!(broker.listen(session, &url));
    Harness {
        broker,
        server,
        directory,
        pool: Arc::new(WorkerPool::new(PoolConfig::default())),
    }
}

fn echo_object(pool: &Arc<WorkerPool>) -> Arc<LocalObject> {
    LocalObject::builder("echo")
        .method(7, "echo", "echo::(b)->b", |payload| Ok(payload))
        .method(8, "stall", "stall::(b)->b", |payload| {
            std::thread::sleep(Duration::from_millis(300));
            Ok(payload)
        })
        .event(5, "tick", "tick::(b)")
        .build(Arc::clone(pool))
}

fn client_meta() -> MetaObject {
    let mut meta = MetaObject::new("echo");
    meta.add_method(7, "echo", "echo::(b)->b");
    meta.add_method(8, "stall", "stall::(b)->b");
    meta.add_event(5, "tick", "tick::(b)");
    meta
}

#[test]
fn call_success_round_trips_the_payload() {
    let h = harness();
    let object = echo_object(&h.pool);
    let id = h
        .broker
        .register_service("echo", object)
        .wait()
        .expect("registered");
    assert!(h.directory.is_ready(id));

    let remote = RemoteObject::new(h.server.connect(), id, client_meta());
    let value = remote
        .call(7, Bytes::from_static(&[0x01, 0x02]))
        .wait_for(Duration::from_secs(5))
        .expect("resolved")
        .expect("value");
    assert_eq!(value.as_ref(), &[0x01, 0x02]);
    assert_eq!(remote.pending_count(), 0);
}

#[test]
fn call_on_unknown_service_fails_with_service_id_text() {
    let h = harness();
    let remote = RemoteObject::new(h.server.connect(), 999, client_meta());
    let err = remote
        .call(3, Bytes::new())
        .wait_for(Duration::from_secs(5))
        .expect("resolved")
        .expect_err("unknown service");
    match err {
        Error::Remote { .. } => {
            assert!(
                err.detail_text().contains("can't find service id: 999"),
                "unexpected detail: {}",
                err.detail_text()
            );
        }
        other => panic!("expected remote error, got {other:?}"),
    }
    assert_eq!(remote.pending_count(), 0);
}

#[test]
fn transport_timeout_fails_the_outstanding_call() {
    let h = harness();
    let object = echo_object(&h.pool);
    let id = h
        .broker
        .register_service("echo", object)
        .wait()
        .expect("registered");

    let stream = h.server.connect();
    let remote = RemoteObject::new(
        Arc::clone(&stream) as Arc<dyn MessageStream>,
        id,
        client_meta(),
    );
    // The stall method holds the reply back long enough for the timeout to
    // fire first.
    let future = remote.call(8, Bytes::from_static(b"x"));
    assert_eq!(remote.pending_count(), 1);
    stream.inject_timeout(1);
    assert!(matches!(
        future.wait_for(Duration::from_secs(5)).expect("resolved"),
        Err(Error::NetworkTimeout)
    ));
    assert_eq!(remote.pending_count(), 0);
    // The late reply finds no completion and is discarded.
    std::thread::sleep(Duration::from_millis(500));
    assert_eq!(remote.pending_count(), 0);
}

#[test]
fn event_round_trip_delivers_exactly_once() {
    let h = harness();
    let object = echo_object(&h.pool);
    let id = h
        .broker
        .register_service("echo", object.clone())
        .wait()
        .expect("registered");

    let remote = RemoteObject::new(h.server.connect(), id, client_meta());
    let (tx, rx) = mpsc::channel();
    let link = remote.connect(
        5,
        Arc::new(move |payload: Bytes| {
            let _ = tx.send(payload);
        }),
    );
    assert!(link > 0);
    assert_eq!(object.subscriber_count(5), 1);

    object.meta_emit(5, Bytes::from_static(&[0xAA]));
    let payload = rx.recv_timeout(Duration::from_secs(5)).expect("event");
    assert_eq!(payload.as_ref(), &[0xAA]);
    assert!(rx.try_recv().is_err(), "event delivered more than once");
}

#[test]
fn client_disconnect_reaps_its_subscriptions() {
    let h = harness();
    let object = echo_object(&h.pool);
    let id = h
        .broker
        .register_service("echo", object.clone())
        .wait()
        .expect("registered");

    let stream: Arc<dyn MessageStream> = h.server.connect();
    let remote = RemoteObject::new(Arc::clone(&stream), id, client_meta());
    let (tx, rx) = mpsc::channel();
    remote.connect(
        5,
        Arc::new(move |payload: Bytes| {
            let _ = tx.send(payload);
        }),
    );
    assert_eq!(object.subscriber_count(5), 1);

    stream.close();
    assert_eq!(
        object.subscriber_count(5),
        0,
        "broker did not release the local link"
    );
    // A later emit reaches nobody.
    object.meta_emit(5, Bytes::from_static(&[0xBB]));
    assert!(rx.try_recv().is_err());
}

#[test]
fn registration_populates_and_unregistration_clears_indices() {
    let h = harness();
    let object = echo_object(&h.pool);
    let id = h
        .broker
        .register_service("echo", object.clone())
        .wait()
        .expect("registered");

    let infos = h.broker.registered_services();
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].name, "echo");
    assert_eq!(infos[0].service_id, id);
    assert!(!infos[0].endpoints.is_empty());
    let info = h.broker.registered_service("echo").expect("info");
    assert_eq!(info.service_id, id);
    let registered = h
        .broker
        .registered_service_object("echo")
        .expect("object");
    let expected: Arc<dyn ServiceObject> = object;
    assert!(Arc::ptr_eq(&registered, &expected));

    h.broker.unregister_service(id).wait().expect("unregister");
    assert!(h.broker.registered_service("echo").is_none());
    assert!(h.broker.registered_services().is_empty());
    assert!(h.broker.registered_service_object("echo").is_none());
    assert!(h.directory.services().is_empty());

    // Calls to the removed id now fail.
    let remote = RemoteObject::new(h.server.connect(), id, client_meta());
    let err = remote
        .call(7, Bytes::new())
        .wait_for(Duration::from_secs(5))
        .expect("resolved")
        .expect_err("service gone");
    assert!(err.detail_text().contains("can't find service id"));
}

#[test]
fn register_without_listen_fails_immediately() {
    let server = MemoryServer::new();
    let broker = Broker::new(server);
    let pool = Arc::new(WorkerPool::new(PoolConfig::default()));
    let object = echo_object(&pool);
    assert!(matches!(
        broker.register_service("echo", object).wait(),
        Err(Error::NotConfigured(_))
    ));
}

#[test]
fn listen_rejects_unrecognized_scheme() {
    let server = MemoryServer::new();
    let broker = Broker::new(server);
    let directory = Arc::new(LocalDirectory::new());
    let url: Url = "tcp://127.0.0.1:0".parse().expect("url");
    assert!(!broker.listen(Session::new(directory), &url));
}

/// Raw control-protocol client recording every frame the broker sends back.
struct RawSink {
    tx: Mutex<mpsc::Sender<Message>>,
}

impl StreamCallbacks for RawSink {
    fn on_ready_read(&self, stream: &Arc<dyn MessageStream>, id: u32) {
        if let Some(msg) = stream.read(id) {
            let _ = self.tx.lock().send(msg);
        }
    }

    fn on_disconnected(&self, _stream: &Arc<dyn MessageStream>) {}
}

#[test]
fn control_calls_reply_with_link_id_and_missing_flag() {
    let h = harness();
    let object = echo_object(&h.pool);
    let id = h
        .broker
        .register_service("echo", object.clone())
        .wait()
        .expect("registered");

    let stream: Arc<dyn MessageStream> = h.server.connect();
    let (tx, rx) = mpsc::channel();
    let sink: Arc<dyn StreamCallbacks> = Arc::new(RawSink { tx: Mutex::new(tx) });
    let as_dyn: Arc<dyn MessageStream> = Arc::clone(&stream);
    as_dyn.add_callbacks(&sink);

    // RegisterEvent as a call replies with the broker-side link id.
    let register = Message::new(
        stream.next_message_id(),
        Kind::Call,
        SERVICE_SERVER,
        SERVER_REGISTER_EVENT,
        control::encode_subscription(id, 5, 77),
    );
    assert!(stream.send(register));
    let reply = rx.recv_timeout(Duration::from_secs(5)).expect("reply");
    assert_eq!(reply.kind, Kind::Reply);
    let local_link = control::decode_link_id(reply.payload).expect("link id");
    assert!(local_link > 0);
    assert_eq!(object.subscriber_count(5), 1);

    // Unregistering an unknown remote link reports missing=true and leaves
    // the live one alone.
    let unregister_unknown = Message::new(
        stream.next_message_id(),
        Kind::Call,
        SERVICE_SERVER,
        SERVER_UNREGISTER_EVENT,
        control::encode_subscription(id, 5, 78),
    );
    assert!(stream.send(unregister_unknown));
    let reply = rx.recv_timeout(Duration::from_secs(5)).expect("reply");
    assert!(control::decode_missing_flag(reply.payload).expect("flag"));
    assert_eq!(object.subscriber_count(5), 1);

    // Unregistering the real link reports missing=false and releases it.
    let unregister = Message::new(
        stream.next_message_id(),
        Kind::Call,
        SERVICE_SERVER,
        SERVER_UNREGISTER_EVENT,
        control::encode_subscription(id, 5, 77),
    );
    assert!(stream.send(unregister));
    let reply = rx.recv_timeout(Duration::from_secs(5)).expect("reply");
    assert!(!control::decode_missing_flag(reply.payload).expect("flag"));
    assert_eq!(object.subscriber_count(5), 0);
}

#[test]
fn control_service_rejects_unknown_targets_and_bad_kinds() {
    let h = harness();
    let stream: Arc<dyn MessageStream> = h.server.connect();
    let (tx, rx) = mpsc::channel();
    let sink: Arc<dyn StreamCallbacks> = Arc::new(RawSink { tx: Mutex::new(tx) });
    let as_dyn: Arc<dyn MessageStream> = Arc::clone(&stream);
    as_dyn.add_callbacks(&sink);

    // Register against a service id nobody registered.
    let register = Message::new(
        stream.next_message_id(),
        Kind::Call,
        SERVICE_SERVER,
        SERVER_REGISTER_EVENT,
        control::encode_subscription(424242, 5, 1),
    );
    assert!(stream.send(register));
    let reply = rx.recv_timeout(Duration::from_secs(5)).expect("reply");
    assert_eq!(reply.kind, Kind::Error);

    // The control service only accepts call/emit.
    let bogus = Message::new(
        stream.next_message_id(),
        Kind::Reply,
        SERVICE_SERVER,
        SERVER_REGISTER_EVENT,
        control::encode_subscription(1, 5, 1),
    );
    assert!(stream.send(bogus));
    let reply = rx.recv_timeout(Duration::from_secs(5)).expect("reply");
    assert_eq!(reply.kind, Kind::Error);
    let (_, details) = courier_wire::fault::decode(reply.payload).expect("fault");
    assert_eq!(details.as_ref(), b"Server service only handles call/emit");
}
