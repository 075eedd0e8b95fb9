// Session broker: accepts client connections, routes frames to locally
// registered service objects, brokers event subscriptions, and reflects
// service events back to remote subscribers.
use bytes::Bytes;
use courier_common::{Error, Future, Promise, ServiceInfo};
use courier_object::{CallType, ServiceObject, Subscriber};
use courier_transport::{
    MessageServer, MessageStream, ServerCallbacks, StreamCallbacks, StreamId, Url,
};
use courier_wire::{
    Kind, Message, SERVER_REGISTER_EVENT, SERVER_UNREGISTER_EVENT, SERVICE_SERVER, control, fault,
};
use parking_lot::{Mutex, ReentrantMutex};
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

pub mod directory;
pub mod session;

pub use directory::{Directory, LocalDirectory};
pub use session::Session;

/// One event subscription opened on behalf of a remote client.
struct RemoteLink {
    local_link: u32,
    event: u32,
}

#[derive(Default)]
struct BrokerState {
    clients: HashMap<StreamId, Arc<dyn MessageStream>>,
    // client -> service id -> remote link id -> local subscription.
    // Tracked so everything a client subscribed to can be torn down when it
    // goes away.
    links: HashMap<StreamId, HashMap<u32, HashMap<u32, RemoteLink>>>,
    by_name: HashMap<String, Arc<dyn ServiceObject>>,
    info_by_name: HashMap<String, ServiceInfo>,
    name_by_id: HashMap<u32, String>,
    // Registrations waiting for the directory to assign an id, keyed by
    // object identity.
    pending: HashMap<usize, (Arc<dyn ServiceObject>, ServiceInfo)>,
}

struct BrokerShared {
    server: Arc<dyn MessageServer>,
    // Hot dispatch lookup; its own mutex to keep contention low.
    services: Mutex<HashMap<u32, Arc<dyn ServiceObject>>>,
    // Connection state, name indices, subscription tables. Reentrant
    // because disconnect callbacks can fire while teardown holds it; the
    // `dying` flag makes those re-entries return before touching state.
    // Lock order: `state` first, `services` inside it, never the reverse.
    state: ReentrantMutex<RefCell<BrokerState>>,
    session: Mutex<Option<Arc<Session>>>,
    dying: AtomicBool,
    weak_self: Weak<BrokerShared>,
}

/// The per-process server side of a courier session.
///
/// Owns its listening endpoint and every accepted client socket; service
/// objects are shared with the caller and survive the broker.
pub struct Broker {
    shared: Arc<BrokerShared>,
}

impl Broker {
    pub fn new(server: Arc<dyn MessageServer>) -> Self {
        let shared = Arc::new_cyclic(|weak| BrokerShared {
            server,
            services: Mutex::new(HashMap::new()),
            state: ReentrantMutex::new(RefCell::new(BrokerState::default())),
            session: Mutex::new(None),
            dying: AtomicBool::new(false),
            weak_self: weak.clone(),
        });
        let sink: Arc<dyn ServerCallbacks> = shared.clone();
        shared.server.add_callbacks(&sink);
        Broker { shared }
    }

    /// Bind the server and start accepting. Only url schemes the transport
    /// recognizes are allowed.
    pub fn listen(&self, session: Session, url: &Url) -> bool {
        if !self.shared.server.recognizes(url.scheme()) {
            tracing::error!(scheme = url.scheme(), "protocol not supported");
            return false;
        }
        *self.shared.session.lock() = Some(Arc::new(session));
        if !self.shared.server.listen(url) {
            return false;
        }
        tracing::info!(url = %url, "broker listening");
        true
    }

    /// Hand `object` to the directory under `name`. The future resolves
    /// with the assigned service id once the directory answers; local
    /// indices are populated from the completion callback.
    pub fn register_service(&self, name: &str, object: Arc<dyn ServiceObject>) -> Future<u32> {
        let session = match self.shared.session.lock().clone() {
            Some(session) => session,
            None => {
                tracing::error!("no session attached to the broker");
                return Future::from_error(Error::NotConfigured("no session attached"));
            }
        };
        let endpoints = self.shared.server.endpoints();
        if endpoints.is_empty() {
            tracing::error!(name, "cannot register service: broker has no endpoint");
            return Future::from_error(Error::NotConfigured("broker has no endpoint"));
        }
        let mut info = ServiceInfo::new(name, session.machine_id());
        info.endpoints = endpoints.iter().map(|url| url.to_string()).collect();
        let key = object_key(&object);
        {
            let guard = self.shared.state.lock();
            guard.borrow_mut().pending.insert(key, (object, info.clone()));
        }
        let future = session.directory().register_service(info);
        let weak = self.shared.weak_self.clone();
        future.on_finished(move |result| {
            let Some(shared) = weak.upgrade() else { return };
            match result {
                Ok(id) => shared.finish_registration(*id, key),
                Err(err) => {
                    tracing::debug!(error = %err, "service registration failed");
                    let guard = shared.state.lock();
                    guard.borrow_mut().pending.remove(&key);
                }
            }
        });
        future
    }

    /// Directory unregistration first (it is the source of truth), then
    /// best-effort removal of the local indices.
    pub fn unregister_service(&self, id: u32) -> Future<()> {
        let session = match self.shared.session.lock().clone() {
            Some(session) => session,
            None => {
                tracing::error!("no session attached to the broker");
                return Future::from_error(Error::NotConfigured("no session attached"));
            }
        };
        let future = session.directory().unregister_service(id);
        self.shared.services.lock().remove(&id);
        {
            let guard = self.shared.state.lock();
            let mut state = guard.borrow_mut();
            match state.name_by_id.remove(&id) {
                Some(name) => {
                    state.by_name.remove(&name);
                    state.info_by_name.remove(&name);
                }
                None => tracing::error!(id, "no name associated with service id"),
            }
        }
        future
    }

    pub fn registered_services(&self) -> Vec<ServiceInfo> {
        let guard = self.shared.state.lock();
        let state = guard.borrow();
        state.info_by_name.values().cloned().collect()
    }

    pub fn registered_service(&self, name: &str) -> Option<ServiceInfo> {
        let guard = self.shared.state.lock();
        let state = guard.borrow();
        state.info_by_name.get(name).cloned()
    }

    pub fn registered_service_object(&self, name: &str) -> Option<Arc<dyn ServiceObject>> {
        let guard = self.shared.state.lock();
        let state = guard.borrow();
        state.by_name.get(name).cloned()
    }

    pub fn listen_url(&self) -> Option<Url> {
        self.shared.server.listen_url()
    }

    /// Tear down: stop accepting, deregister from every client socket, and
    /// close them. `dying` is set first so reentrant disconnect callbacks
    /// short-circuit.
    pub fn close(&self) {
        if self.shared.dying.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.server.close();
        let clients: Vec<Arc<dyn MessageStream>> = {
            let guard = self.shared.state.lock();
            let mut state = guard.borrow_mut();
            state.links.clear();
            state.clients.drain().map(|(_, stream)| stream).collect()
        };
        let sink: Arc<dyn StreamCallbacks> = self.shared.clone();
        for client in clients {
            client.remove_callbacks(&sink);
            client.close();
        }
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.close();
    }
}

fn object_key(object: &Arc<dyn ServiceObject>) -> usize {
    Arc::as_ptr(object) as *const () as usize
}

/// Broker-side closure re-emitting a service event onto one client socket.
/// Send failures are logged only; the disconnect path reaps subscriptions.
fn event_forwarder(service: u32, event: u32, stream: Arc<dyn MessageStream>) -> Subscriber {
    Arc::new(move |params: Bytes| {
        let msg = Message::new(stream.next_message_id(), Kind::Event, service, event, params);
        if stream.send(msg) {
            metrics::counter!("courier_broker_events_forwarded_total").increment(1);
        } else {
            tracing::warn!(service, event, stream = %stream.id(), "event forward failed");
        }
    })
}

impl BrokerShared {
    fn finish_registration(&self, id: u32, key: usize) {
        let entry = {
            let guard = self.state.lock();
            let taken = guard.borrow_mut().pending.remove(&key);
            taken
        };
        let Some((object, mut info)) = entry else {
            tracing::warn!(id, "registration finished with no pending record");
            return;
        };
        info.service_id = id;
        self.services.lock().insert(id, object.clone());
        // Ack the directory so it can hand the service out.
        if let Some(session) = self.session.lock().clone() {
            session.directory().service_ready(id);
        }
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        state.info_by_name.insert(info.name.clone(), info.clone());
        state.by_name.insert(info.name.clone(), object);
        state.name_by_id.insert(id, info.name);
    }

    /// Completion that turns a service result into a reply or error frame
    /// on the originating socket.
    fn reply_completion(&self, stream: &Arc<dyn MessageStream>, request: &Message) -> Promise<Bytes> {
        let promise = Promise::<Bytes>::new();
        let stream = Arc::clone(stream);
        let request = request.clone();
        promise.future().on_finished(move |result| {
            let reply = match result {
                Ok(payload) => Message::reply_to(&request, payload.clone()),
                Err(Error::Remote { signature, details }) => Message {
                    kind: Kind::Error,
                    payload: fault::encode(signature, details.as_ref()),
                    ..Message::reply_to(&request, Bytes::new())
                },
                Err(err) => Message {
                    kind: Kind::Error,
                    payload: fault::encode(fault::PLAIN_SIGNATURE, err.to_string().as_bytes()),
                    ..Message::reply_to(&request, Bytes::new())
                },
            };
            if !stream.send(reply) {
                tracing::debug!(id = request.id, "reply send failed");
            }
        });
        promise
    }

    fn handle_control(&self, stream: &Arc<dyn MessageStream>, msg: Message) {
        // Register/unregister are accepted both as emit and as call.
        if msg.kind != Kind::Call && msg.kind != Kind::Event {
            tracing::error!(kind = ?msg.kind, "server service only handles call/emit");
            stream.send(Message::error_reply_to(
                &msg,
                "Server service only handles call/emit",
            ));
            return;
        }
        let sub = match control::decode_subscription(msg.payload.clone()) {
            Ok(sub) => sub,
            Err(err) => {
                tracing::error!(error = %err, "malformed control payload");
                if msg.kind == Kind::Call {
                    stream.send(Message::error_reply_to(&msg, "Malformed control payload"));
                }
                return;
            }
        };
        let object = self.services.lock().get(&sub.service).cloned();
        let Some(object) = object else {
            if msg.kind == Kind::Call {
                stream.send(Message::error_reply_to(&msg, "Service not found"));
            }
            return;
        };
        match msg.function {
            SERVER_REGISTER_EVENT => {
                let forwarder = event_forwarder(sub.service, sub.event, Arc::clone(stream));
                let local_link = object.connect(sub.event, forwarder);
                {
                    let guard = self.state.lock();
                    guard
                        .borrow_mut()
                        .links
                        .entry(stream.id())
                        .or_default()
                        .entry(sub.service)
                        .or_default()
                        .insert(
                            sub.link_id,
                            RemoteLink {
                                local_link,
                                event: sub.event,
                            },
                        );
                }
                if msg.kind == Kind::Call {
                    stream.send(Message::reply_to(&msg, control::encode_link_id(local_link)));
                }
            }
            SERVER_UNREGISTER_EVENT => {
                let removed = {
                    let guard = self.state.lock();
                    let mut state = guard.borrow_mut();
                    state
                        .links
                        .get_mut(&stream.id())
                        .and_then(|per_service| per_service.get_mut(&sub.service))
                        .and_then(|links| links.remove(&sub.link_id))
                };
                match &removed {
                    Some(link) => {
                        object.disconnect(link.local_link);
                    }
                    None => tracing::error!(
                        remote_link = sub.link_id,
                        service = sub.service,
                        "unregister request failed"
                    ),
                }
                if msg.kind == Kind::Call {
                    // On the wire, true means the link was missing.
                    stream.send(Message::reply_to(
                        &msg,
                        control::encode_missing_flag(removed.is_none()),
                    ));
                }
            }
            other => tracing::debug!(function = other, "unknown control function"),
        }
    }
}

impl ServerCallbacks for BrokerShared {
    fn on_new_connection(&self, stream: Arc<dyn MessageStream>) {
        if self.dying.load(Ordering::Acquire) {
            return;
        }
        {
            let guard = self.state.lock();
            guard.borrow_mut().clients.insert(stream.id(), stream.clone());
        }
        if let Some(me) = self.weak_self.upgrade() {
            let sink: Arc<dyn StreamCallbacks> = me;
            stream.add_callbacks(&sink);
        }
        metrics::counter!("courier_broker_connections_total").increment(1);
        tracing::debug!(stream = %stream.id(), "client connected");
    }
}

impl StreamCallbacks for BrokerShared {
    fn on_ready_read(&self, stream: &Arc<dyn MessageStream>, id: u32) {
        if self.dying.load(Ordering::Acquire) {
            return;
        }
        let Some(msg) = stream.read(id) else {
            tracing::warn!(id, "ready-read announced with no frame");
            return;
        };
        if msg.service == SERVICE_SERVER {
            self.handle_control(stream, msg);
            return;
        }
        let object = self.services.lock().get(&msg.service).cloned();
        let Some(object) = object else {
            tracing::error!(service = msg.service, "can't find service");
            if msg.kind == Kind::Call {
                let text = Error::ServiceUnknown(msg.service).to_string();
                stream.send(Message::error_reply_to(&msg, &text));
            }
            return;
        };
        match msg.kind {
            Kind::Call => {
                metrics::counter!("courier_broker_calls_total").increment(1);
                let completion = self.reply_completion(stream, &msg);
                // Queued so user code never runs on the transport thread.
                object.meta_call(msg.function, msg.payload, completion, CallType::Queued);
            }
            Kind::Event => object.meta_emit(msg.function, msg.payload),
            other => tracing::debug!(kind = ?other, "unhandled frame kind at broker"),
        }
    }

    fn on_disconnected(&self, stream: &Arc<dyn MessageStream>) {
        // Checked before taking any lock: teardown closes sockets while
        // holding state, and those closes come right back here.
        if self.dying.load(Ordering::Acquire) {
            return;
        }
        let links = {
            let guard = self.state.lock();
            let mut state = guard.borrow_mut();
            state.clients.remove(&stream.id());
            state.links.remove(&stream.id())
        };
        if let Some(per_service) = links {
            for (service_id, service_links) in per_service {
                let object = self.services.lock().get(&service_id).cloned();
                // If the service is still registered, release its end of
                // every link this client held.
                if let Some(object) = object {
                    for (_, link) in service_links {
                        tracing::trace!(
                            service = service_id,
                            event = link.event,
                            link = link.local_link,
                            "releasing subscription for disconnected client"
                        );
                        object.disconnect(link.local_link);
                    }
                }
            }
        }
        tracing::debug!(stream = %stream.id(), "client disconnected");
        stream.close();
    }
}
