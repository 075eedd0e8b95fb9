// Framed bidirectional message streams.
//
// The broker and the remote object depend only on the `MessageStream` /
// `MessageServer` traits; `tcp` provides the production implementation and
// `memory` an in-process pair for tests. Transport callbacks may run on
// arbitrary transport threads but are serialized per stream.
use courier_wire::Message;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

pub mod memory;
pub mod tcp;
mod url;

pub use url::{InvalidUrl, Url};

/// Stable stream identifier, unique within the process; used to key
/// per-connection state and for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(pub u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_stream_id() -> StreamId {
    StreamId(NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed))
}

/// Transport-level limits.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub max_frame_bytes: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        // Large enough for most dev/test workloads.
        Self {
            max_frame_bytes: 4 * 1024 * 1024,
        }
    }
}

/// Listener for events on one stream.
pub trait StreamCallbacks: Send + Sync {
    /// A frame arrived; retrieve it with [`MessageStream::read`] using `id`.
    fn on_ready_read(&self, stream: &Arc<dyn MessageStream>, id: u32);

    /// The transport gave up waiting for a reply to request `id`.
    fn on_timeout(&self, stream: &Arc<dyn MessageStream>, id: u32) {
        let _ = (stream, id);
    }

    fn on_disconnected(&self, stream: &Arc<dyn MessageStream>);
}

/// One framed bidirectional connection.
pub trait MessageStream: Send + Sync {
    fn id(&self) -> StreamId;

    /// Enqueue a frame; false when the connection is down or the write
    /// failed.
    fn send(&self, msg: Message) -> bool;

    /// Take a received frame by the id announced via `on_ready_read`.
    fn read(&self, id: u32) -> Option<Message>;

    /// Mint the next originator-assigned frame id for this endpoint.
    fn next_message_id(&self) -> u32;

    fn add_callbacks(&self, sink: &Arc<dyn StreamCallbacks>);
    fn remove_callbacks(&self, sink: &Arc<dyn StreamCallbacks>);

    fn is_connected(&self) -> bool;
    fn close(&self);
}

/// Listener for newly accepted streams.
pub trait ServerCallbacks: Send + Sync {
    fn on_new_connection(&self, stream: Arc<dyn MessageStream>);
}

/// Accepting side of a transport.
pub trait MessageServer: Send + Sync {
    /// Bind and start accepting. False on bind failure.
    fn listen(&self, url: &Url) -> bool;

    /// Whether this transport understands the given url scheme.
    fn recognizes(&self, scheme: &str) -> bool;

    fn listen_url(&self) -> Option<Url>;
    fn endpoints(&self) -> Vec<Url>;

    fn add_callbacks(&self, sink: &Arc<dyn ServerCallbacks>);
    fn remove_callbacks(&self, sink: &Arc<dyn ServerCallbacks>);

    fn close(&self);
}

/// A set of weakly-held callback sinks. Dead sinks are pruned on dispatch,
/// so the sink <-> stream reference cycle cannot leak.
pub(crate) struct CallbackSet<T: ?Sized> {
    sinks: Mutex<Vec<Weak<T>>>,
}

impl<T: ?Sized> CallbackSet<T> {
    pub(crate) fn new() -> Self {
        Self {
            sinks: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn add(&self, sink: &Arc<T>) {
        self.sinks.lock().push(Arc::downgrade(sink));
    }

    pub(crate) fn remove(&self, sink: &Arc<T>) {
        self.sinks.lock().retain(|weak| match weak.upgrade() {
            Some(live) => !Arc::ptr_eq(&live, sink),
            None => false,
        });
    }

    /// Snapshot the live sinks and invoke `f` on each, outside the lock.
    pub(crate) fn for_each(&self, mut f: impl FnMut(&Arc<T>)) {
        let snapshot: Vec<Arc<T>> = {
            let mut sinks = self.sinks.lock();
            sinks.retain(|weak| weak.strong_count() > 0);
            sinks.iter().filter_map(|weak| weak.upgrade()).collect()
        };
        for sink in snapshot {
            f(&sink);
        }
    }
}
