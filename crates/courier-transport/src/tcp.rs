// Thread-per-connection TCP transport: length-prefixed frames, a reader
// thread per stream invoking callback sinks, an accept thread per server.
use bytes::Bytes;
use courier_wire::{Header, Message};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream as StdTcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use crate::{
    CallbackSet, MessageServer, MessageStream, ServerCallbacks, StreamCallbacks, StreamId,
    TransportConfig, Url, next_stream_id,
};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(20);

pub struct TcpMessageStream {
    id: StreamId,
    peer_addr: SocketAddr,
    socket: StdTcpStream,
    writer: Mutex<StdTcpStream>,
    // Taken by `start_reader`; present only between creation and start.
    reader_socket: Mutex<Option<StdTcpStream>>,
    received: Mutex<HashMap<u32, Message>>,
    callbacks: CallbackSet<dyn StreamCallbacks>,
    connected: AtomicBool,
    next_id: AtomicU32,
    max_frame_bytes: usize,
    weak_self: Weak<Self>,
}

impl TcpMessageStream {
    /// Connect to a listening peer and start reading immediately. Attach
    /// callbacks before sending anything that solicits a response.
    pub fn connect(url: &Url) -> io::Result<Arc<Self>> {
        Self::connect_with(url, TransportConfig::default())
    }

    pub fn connect_with(url: &Url, config: TransportConfig) -> io::Result<Arc<Self>> {
        let socket = StdTcpStream::connect((url.host(), url.port()))?;
        let stream = Self::new(socket, config)?;
        stream.start_reader();
        Ok(stream)
    }

    fn new(socket: StdTcpStream, config: TransportConfig) -> io::Result<Arc<Self>> {
        let peer_addr = socket.peer_addr()?;
        let writer = socket.try_clone()?;
        let reader = socket.try_clone()?;
        Ok(Arc::new_cyclic(|weak| Self {
            id: next_stream_id(),
            peer_addr,
            socket,
            writer: Mutex::new(writer),
            reader_socket: Mutex::new(Some(reader)),
            received: Mutex::new(HashMap::new()),
            callbacks: CallbackSet::new(),
            connected: AtomicBool::new(true),
            next_id: AtomicU32::new(1),
            max_frame_bytes: config.max_frame_bytes,
            weak_self: weak.clone(),
        }))
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub(crate) fn start_reader(&self) {
        let Some(socket) = self.reader_socket.lock().take() else {
            return;
        };
        let weak = self.weak_self.clone();
        let max_frame_bytes = self.max_frame_bytes;
        let _ = thread::Builder::new()
            .name("tcp-reader".into())
            .spawn(move || read_loop(weak, socket, max_frame_bytes));
    }
}

fn read_loop(weak: Weak<TcpMessageStream>, mut socket: StdTcpStream, max_frame_bytes: usize) {
    loop {
        let mut header_bytes = [0u8; Header::LEN];
        if socket.read_exact(&mut header_bytes).is_err() {
            break;
        }
        let header = match Header::decode(Bytes::copy_from_slice(&header_bytes)) {
            Ok(header) => header,
            Err(err) => {
                tracing::debug!(error = %err, "dropping stream on undecodable header");
                break;
            }
        };
        if header.length as usize > max_frame_bytes {
            tracing::error!(
                length = header.length,
                cap = max_frame_bytes,
                "frame too large; dropping stream"
            );
            break;
        }
        let mut payload = vec![0u8; header.length as usize];
        if socket.read_exact(&mut payload).is_err() {
            break;
        }
        let msg = Message::from_parts(header, Bytes::from(payload));
        let Some(stream) = weak.upgrade() else {
            return;
        };
        let id = msg.id;
        stream.received.lock().insert(id, msg);
        let as_dyn: Arc<dyn MessageStream> = stream.clone();
        stream.callbacks.for_each(|sink| sink.on_ready_read(&as_dyn, id));
    }

    if let Some(stream) = weak.upgrade() {
        if stream.connected.swap(false, Ordering::AcqRel) {
            let as_dyn: Arc<dyn MessageStream> = stream.clone();
            stream.callbacks.for_each(|sink| sink.on_disconnected(&as_dyn));
        }
    }
}

impl MessageStream for TcpMessageStream {
    fn id(&self) -> StreamId {
        self.id
    }

    fn send(&self, msg: Message) -> bool {
        if !self.connected.load(Ordering::Acquire) {
            return false;
        }
        let bytes = msg.encode();
        let mut writer = self.writer.lock();
        match writer.write_all(&bytes) {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!(stream = %self.id, error = %err, "send failed");
                self.connected.store(false, Ordering::Release);
                false
            }
        }
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

    fn close(&self) {
        self.connected.store(false, Ordering::Release);
        let _ = self.socket.shutdown(Shutdown::Both);
    }
}

impl Drop for TcpMessageStream {
    fn drop(&mut self) {
        let _ = self.socket.shutdown(Shutdown::Both);
    }
}

/// TCP listener implementing [`MessageServer`].
pub struct TcpServer {
    listener: Mutex<Option<TcpListener>>,
    listen_url: Mutex<Option<Url>>,
    callbacks: CallbackSet<dyn ServerCallbacks>,
    closing: AtomicBool,
    config: TransportConfig,
    weak_self: Weak<Self>,
}

impl TcpServer {
    pub fn new() -> Arc<Self> {
        Self::with_config(TransportConfig::default())
    }

    pub fn with_config(config: TransportConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            listener: Mutex::new(None),
            listen_url: Mutex::new(None),
            callbacks: CallbackSet::new(),
            closing: AtomicBool::new(false),
            config,
            weak_self: weak.clone(),
        })
    }
}

impl MessageServer for TcpServer {
    fn listen(&self, url: &Url) -> bool {
        if !self.recognizes(url.scheme()) {
            tracing::error!(scheme = url.scheme(), "scheme not supported");
            return false;
        }
        let listener = match TcpListener::bind((url.host(), url.port())) {
            Ok(listener) => listener,
            Err(err) => {
                tracing::error!(url = %url, error = %err, "bind failed");
                return false;
            }
        };
        let bound_port = match listener.local_addr() {
            Ok(addr) => addr.port(),
            Err(err) => {
                tracing::error!(error = %err, "could not read bound address");
                return false;
            }
        };
        // Non-blocking so the accept loop can observe `close`.
        if let Err(err) = listener.set_nonblocking(true) {
            tracing::error!(error = %err, "could not configure listener");
            return false;
        }
        *self.listen_url.lock() = Some(url.with_port(bound_port));
        *self.listener.lock() = Some(listener);
        let weak = self.weak_self.clone();
        let _ = thread::Builder::new()
            .name("tcp-accept".into())
            .spawn(move || accept_loop(weak));
        true
    }

    fn recognizes(&self, scheme: &str) -> bool {
        scheme == "tcp"
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
        self.closing.store(true, Ordering::Release);
        self.listener.lock().take();
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.close();
    }
}

fn accept_loop(weak: Weak<TcpServer>) {
    loop {
        let Some(server) = weak.upgrade() else { return };
        if server.closing.load(Ordering::Acquire) {
            return;
        }
        let accepted = {
            let guard = server.listener.lock();
            let Some(listener) = guard.as_ref() else {
                return;
            };
            listener.accept()
        };
        match accepted {
            Ok((socket, peer)) => {
                if socket.set_nonblocking(false).is_err() {
                    continue;
                }
                match TcpMessageStream::new(socket, server.config.clone()) {
                    Ok(stream) => {
                        tracing::debug!(stream = %stream.id(), %peer, "accepted connection");
                        let as_dyn: Arc<dyn MessageStream> = stream.clone();
                        server
                            .callbacks
                            .for_each(|sink| sink.on_new_connection(Arc::clone(&as_dyn)));
                        // Readers start only after the sinks saw the stream,
                        // so no frame is announced into the void.
                        stream.start_reader();
                    }
                    Err(err) => tracing::warn!(error = %err, "could not set up accepted stream"),
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                drop(server);
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(err) => {
                tracing::warn!(error = %err, "accept failed");
                drop(server);
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }
    }
}
