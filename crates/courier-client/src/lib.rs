// Client-side mirror of a remote service: local invocations become `Call`
// frames, replies resolve the matching completion, and incoming `Event`
// frames fan out to local subscribers.
use bytes::Bytes;
use courier_common::{Error, Future, Promise};
use courier_object::{CallType, EventRegistry, MetaObject, ServiceObject, Subscriber};
use courier_transport::{MessageStream, StreamCallbacks};
use courier_wire::{
    Kind, Message, SERVER_REGISTER_EVENT, SERVER_UNREGISTER_EVENT, SERVICE_SERVER, control, fault,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Remote object proxy. Owns its socket: dropping the proxy closes the
/// connection and fails whatever is still pending.
pub struct RemoteObject {
    socket: Arc<dyn MessageStream>,
    service: u32,
    meta: MetaObject,
    events: EventRegistry,
    // Request id -> completion. Entries are inserted before the frame goes
    // out and removed exactly once on reply, error, timeout, or disconnect.
    pending: Mutex<HashMap<u32, Promise<Bytes>>>,
}

impl RemoteObject {
    pub fn new(socket: Arc<dyn MessageStream>, service: u32, meta: MetaObject) -> Arc<Self> {
        let object = Arc::new(Self {
            socket,
            service,
            meta,
            events: EventRegistry::new(),
            pending: Mutex::new(HashMap::new()),
        });
        let sink: Arc<dyn StreamCallbacks> = object.clone();
        object.socket.add_callbacks(&sink);
        object
    }

    pub fn service(&self) -> u32 {
        self.service
    }

    /// Outstanding request count; drops back to zero once every completion
    /// has resolved.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Convenience wrapper around [`ServiceObject::meta_call`].
    pub fn call(&self, function: u32, params: Bytes) -> Future<Bytes> {
        let completion = Promise::new();
        let future = completion.future();
        self.meta_call(function, params, completion, CallType::Queued);
        future
    }

    fn fail_all_pending(&self, error: Error) {
        let drained: Vec<Promise<Bytes>> = {
            let mut pending = self.pending.lock();
            pending.drain().map(|(_, promise)| promise).collect()
        };
        // Resolve outside the lock; completion callbacks may call back in.
        for promise in drained {
            promise.set_error(error.clone());
        }
    }

    fn send_failure_text(&self, function: u32) -> String {
        match self.meta.method(function) {
            Some(method) => format!(
                "network error while sending data to method '{}'",
                method.signature
            ),
            None => format!("network error while sending data to unknown method (id={function})"),
        }
    }
}

impl ServiceObject for RemoteObject {
    fn meta_object(&self) -> &MetaObject {
        &self.meta
    }

    fn meta_call(&self, function: u32, params: Bytes, completion: Promise<Bytes>, _call: CallType) {
        let id = self.socket.next_message_id();
        let msg = Message::new(id, Kind::Call, self.service, function, params);
        {
            let mut pending = self.pending.lock();
            if pending.contains_key(&id) {
                drop(pending);
                // A colliding id is a contract violation; the in-flight
                // request keeps its completion, the new one fails.
                tracing::error!(id, "there is already a pending completion for this id");
                completion.set_error(Error::DuplicateRequestId(id));
                return;
            }
            pending.insert(id, completion.clone());
        }
        metrics::counter!("courier_client_calls_total").increment(1);
        if !self.socket.send(msg) {
            self.pending.lock().remove(&id);
            let text = self.send_failure_text(function);
            tracing::error!(id, function, "call submission failed");
            completion.set_error(Error::NetworkSend(text));
        }
    }

    fn meta_emit(&self, event: u32, args: Bytes) {
        // Fire and forget. Local subscribers are not triggered here; the
        // broker reflects the event back to every subscriber, us included.
        let msg = Message::new(
            self.socket.next_message_id(),
            Kind::Event,
            self.service,
            event,
            args,
        );
        if !self.socket.send(msg) {
            tracing::error!(event, "event emission failed");
        }
    }

    fn connect(&self, event: u32, subscriber: Subscriber) -> u32 {
        let link_id = self.events.connect(event, subscriber);
        // Tell the broker we are interested, carrying our link id so both
        // sides can name the same subscription.
        let msg = Message::new(
            self.socket.next_message_id(),
            Kind::Event,
            SERVICE_SERVER,
            SERVER_REGISTER_EVENT,
            control::encode_subscription(self.service, event, link_id),
        );
        if !self.socket.send(msg) {
            tracing::error!(event, link_id, "event registration failed");
        }
        link_id
    }

    fn disconnect(&self, link_id: u32) -> bool {
        let Some(event) = self.events.event_for_link(link_id) else {
            return false;
        };
        if !self.events.disconnect(link_id) {
            return false;
        }
        let msg = Message::new(
            self.socket.next_message_id(),
            Kind::Event,
            SERVICE_SERVER,
            SERVER_UNREGISTER_EVENT,
            control::encode_subscription(self.service, event, link_id),
        );
        if !self.socket.send(msg) {
            tracing::error!(event, link_id, "event unregistration failed");
        }
        true
    }
}

impl StreamCallbacks for RemoteObject {
    fn on_ready_read(&self, stream: &Arc<dyn MessageStream>, id: u32) {
        let Some(msg) = stream.read(id) else {
            tracing::warn!(id, "ready-read announced with no frame");
            return;
        };
        match msg.kind {
            Kind::Reply => {
                let promise = self.pending.lock().remove(&msg.id);
                match promise {
                    Some(promise) => promise.set_value(msg.payload),
                    None => tracing::error!(id = msg.id, "no pending completion for reply"),
                }
            }
            Kind::Error => {
                let promise = self.pending.lock().remove(&msg.id);
                let error = match fault::decode(msg.payload) {
                    Ok((signature, details)) => Error::Remote { signature, details },
                    Err(err) => {
                        tracing::debug!(error = %err, "undecodable fault payload");
                        Error::Remote {
                            signature: fault::PLAIN_SIGNATURE.into(),
                            details: Bytes::from_static(b"undecodable fault payload"),
                        }
                    }
                };
                match promise {
                    Some(promise) => promise.set_error(error),
                    None => tracing::error!(id = msg.id, "no pending completion for error"),
                }
            }
            Kind::Event => self.events.trigger(msg.function, &msg.payload),
            Kind::Call => tracing::error!(id = msg.id, "unexpected call frame on client stream"),
        }
    }

    fn on_timeout(&self, _stream: &Arc<dyn MessageStream>, id: u32) {
        if let Some(promise) = self.pending.lock().remove(&id) {
            promise.set_error(Error::NetworkTimeout);
        }
    }

    fn on_disconnected(&self, _stream: &Arc<dyn MessageStream>) {
        self.fail_all_pending(Error::ConnectionClosed);
    }
}

impl Drop for RemoteObject {
    fn drop(&mut self) {
        self.fail_all_pending(Error::ConnectionClosed);
        self.socket.close();
    }
}
