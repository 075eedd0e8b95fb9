// In-process transport: a linked pair of streams delivering frames
// synchronously on the sender's thread. Used by tests and in-process
// wiring; `inject_timeout` stands in for a transport-level request timeout.
use courier_wire::Message;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use crate::{
    CallbackSet, MessageServer, MessageStream, ServerCallbacks, StreamCallbacks, StreamId, Url,
    next_stream_id,
};

pub struct MemoryStream {
    id: StreamId,
    peer: Mutex<Weak<MemoryStream>>,
    received: Mutex<HashMap<u32, Message>>,
    callbacks: CallbackSet<dyn StreamCallbacks>,
    connected: AtomicBool,
    next_id: AtomicU32,
    weak_self: Weak<Self>,
}

/// Create two linked stream ends.
pub fn pair() -> (Arc<MemoryStream>, Arc<MemoryStream>) {
    let a = MemoryStream::unlinked();
    let b = MemoryStream::unlinked();
    *a.peer.lock() = Arc::downgrade(&b);
    *b.peer.lock() = Arc::downgrade(&a);
    (a, b)
}

impl MemoryStream {
    fn unlinked() -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            id: next_stream_id(),
            peer: Mutex::new(Weak::new()),
            received: Mutex::new(HashMap::new()),
            callbacks: CallbackSet::new(),
            connected: AtomicBool::new(true),
            next_id: AtomicU32::new(1),
            weak_self: weak.clone(),
        })
    }

    fn deliver(&self, msg: Message) {
        let id = msg.id;
        self.received.lock().insert(id, msg);
        let Some(me) = self.weak_self.upgrade() else {
            return;
        };
        let as_dyn: Arc<dyn MessageStream> = me;
        self.callbacks.for_each(|sink| sink.on_ready_read(&as_dyn, id));
    }

    /// Simulate the transport timing out request `id`.
    pub fn inject_timeout(&self, id: u32) {
        let Some(me) = self.weak_self.upgrade() else {
            return;
        };
        let as_dyn: Arc<dyn MessageStream> = me;
        self.callbacks.for_each(|sink| sink.on_timeout(&as_dyn, id));
    }

    fn notify_disconnected(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            let Some(me) = self.weak_self.upgrade() else {
                return;
            };
            let as_dyn: Arc<dyn MessageStream> = me;
            self.callbacks.for_each(|sink| sink.on_disconnected(&as_dyn));
        }
    }
}

impl MessageStream for MemoryStream {
    fn id(&self) -> StreamId {
        self.id
    }

    fn send(&self, msg: Message) -> bool {
        if !self.connected.load(Ordering::Acquire) {
            return false;
        }
        let Some(peer) = self.peer.lock().upgrade() else {
            return false;
        };
        if !peer.connected.load(Ordering::Acquire) {
            return false;
        }
        peer.deliver(msg);
        true
    }

    fn read(&self, id: u32) -> Option<Message> {
        self.received.lock().remove(&id)
    }

    fn next_message_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn add_callbacks(&self, sink: &Arc<dyn StreamCallbacks>) {
        self.callbacks.add(sink);
    }

    fn remove_callbacks(&self, sink: &Arc<dyn StreamCallbacks>) {
        self.callbacks.remove(sink);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Tear down both ends, notifying each side's sinks.
    fn close(&self) {
        let peer = self.peer.lock().upgrade();
        self.notify_disconnected();
        if let Some(peer) = peer {
            peer.notify_disconnected();
        }
    }
}

/// In-process listener; `connect` hands the server end to the registered
/// sinks and returns the client end.
pub struct MemoryServer {
    listen_url: Mutex<Option<Url>>,
    callbacks: CallbackSet<dyn ServerCallbacks>,
}

impl MemoryServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            listen_url: Mutex::new(None),
            callbacks: CallbackSet::new(),
        })
    }

    pub fn connect(&self) -> Arc<MemoryStream> {
        let (client, server_end) = pair();
        let as_dyn: Arc<dyn MessageStream> = server_end;
        self.callbacks
            .for_each(|sink| sink.on_new_connection(Arc::clone(&as_dyn)));
        client
    }
}

impl MessageServer for MemoryServer {
    fn listen(&self, url: &Url) -> bool {
        if !self.recognizes(url.scheme()) {
            return false;
        }
        *self.listen_url.lock() = Some(url.clone());
        true
    }

    fn recognizes(&self, scheme: &str) -> bool {
        scheme == "mem"
    }

    fn listen_url(&self) -> Option<Url> {
        self.listen_url.lock().clone()
    }

    fn endpoints(&self) -> Vec<Url> {
        self.listen_url.lock().iter().cloned().collect()
    }

    fn add_callbacks(&self, sink: &Arc<dyn ServerCallbacks>) {
        self.callbacks.add(sink);
    }

    fn remove_callbacks(&self, sink: &Arc<dyn ServerCallbacks>) {
        self.callbacks.remove(sink);
    }

    fn close(&self) {
        self.listen_url.lock().take();
    }
}
