use std::{
    collections::{HashMap, VecDeque},
    path::PathBuf,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicUsize, Ordering},
        mpsc::{Receiver, Sender, channel},
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use mio::net::TcpListener;
use serde::{Deserialize, Serialize};
use tracing::{Level, debug, error, info, span};

use crate::{
    codec::MessageCodec,
    conn::{ConnState, Connection, ConnectionId, Endpoint},
    error::BusError,
    event::BusEvent,
    event_loop::{self, EventItem},
    frame::encode_frame,
    io_loop::IoLoop,
    lock,
    queue::{ByteLimitedQueue, SendItem},
    timer::{Callback, TimerHeap},
    transport::{client_tls_config, connect_transport, resolve, server_tls_config},
    wake::WakePipe,
};

/// Static configuration for one bus instance.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Opaque tag carried on every log line of this bus.
    pub identity: String,
    /// Endpoint to accept connections on; `None` means outgoing only.
    /// Port 0 binds an OS-assigned port, reported by `listening_endpoint`.
    pub listen: Option<Endpoint>,
    /// Shared secret. When set it is demanded as the first frame of every
    /// incoming connection and sent first on every outgoing one.
    pub auth_token: Option<String>,
    /// Wrap every connection in TLS. Both ends must agree.
    pub want_tls: bool,
    /// PEM file holding the certificate chain and private key. Required when
    /// listening with TLS.
    pub cert_path: Option<PathBuf>,
    /// Duplicate the length prefix after each payload to catch stream
    /// corruption. Both ends must agree.
    pub extra_size_check: bool,
    /// Cap on bytes pending in the outbound flow; `None` means unbounded.
    pub max_write_queue_bytes: Option<usize>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            identity: "bus".to_string(),
            listen: None,
            auth_token: None,
            want_tls: false,
            cert_path: None,
            extra_size_check: true,
            max_write_queue_bytes: None,
        }
    }
}

impl BusConfig {
    pub fn new(identity: impl Into<String>) -> Self {
        Self { identity: identity.into(), ..Self::default() }
    }

    pub fn with_listen(mut self, endpoint: Endpoint) -> Self {
        self.listen = Some(endpoint);
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_tls(mut self, cert_path: Option<PathBuf>) -> Self {
        self.want_tls = true;
        self.cert_path = cert_path;
        self
    }

    pub fn with_extra_size_check(mut self, on: bool) -> Self {
        self.extra_size_check = on;
        self
    }

    pub fn with_max_write_queue_bytes(mut self, cap: usize) -> Self {
        self.max_write_queue_bytes = Some(cap);
        self
    }
}

/// When a scheduled callback should run.
#[derive(Clone, Copy, Debug)]
pub enum Schedule {
    Now,
    At(Instant),
    After(Duration),
}

impl Schedule {
    fn deadline(self) -> Instant {
        match self {
            Schedule::Now => Instant::now(),
            Schedule::At(at) => at,
            Schedule::After(delay) => Instant::now() + delay,
        }
    }
}

/// Synthetic items on the event pipeline, drained by the IO loop one per
/// wake byte.
pub(crate) enum Control<M> {
    Event(BusEvent<M>),
    Disconnect(ConnectionId),
}

/// Everything behind the bus mutex.
pub(crate) struct Shared {
    pub conns: HashMap<ConnectionId, Connection>,
    pub next_id: u64,
    pub timers: TimerHeap,
    pub listen_endpoint: Option<Endpoint>,
    pub started: bool,
    pub stopped: bool,
}

/// State shared by the two bus threads and all caller threads.
pub(crate) struct BusCore<C: MessageCodec> {
    pub identity: String,
    pub auth_token: Option<String>,
    pub extra_size_check: bool,
    pub codec: C,
    pub tls_client: Option<Arc<rustls::ClientConfig>>,
    pub state: Mutex<Shared>,
    pub send_queue: ByteLimitedQueue<SendItem>,
    pub controls: Mutex<VecDeque<Control<C::In>>>,
    pub event_queue: Sender<EventItem<C::In>>,
    pub msg_wake: WakePipe,
    pub event_wake: WakePipe,
    pub general_wake: WakePipe,
    /// Encoded bytes staged in write buffers but not yet on the wire. Gates
    /// the send queue: while it exceeds the cap, the IO loop stops popping.
    pub bytes_pending_out: AtomicUsize,
    pub total_bytes_written: AtomicUsize,
    pub total_bytes_read: AtomicUsize,
    pub running: AtomicBool,
}

impl<C: MessageCodec> BusCore<C> {
    pub fn lock_state(&self) -> MutexGuard<'_, Shared> {
        lock(&self.state)
    }

    pub fn push_control(&self, control: Control<C::In>) {
        lock(&self.controls).push_back(control);
        self.event_wake.notify();
    }

    pub fn fire(&self, event: BusEvent<C::In>) {
        let _ = self.event_queue.send(EventItem::Fire(event));
    }

    pub fn schedule(&self, when: Schedule, callback: Callback) {
        let deadline = when.deadline();
        let new_head = self.lock_state().timers.schedule(deadline, callback);
        if new_head {
            // shorten the poll sleep
            self.general_wake.notify();
        }
    }

    pub fn is_definitely_dead(&self, id: ConnectionId) -> bool {
        !self.lock_state().conns.contains_key(&id)
    }

    pub fn can_read_send_queue(&self) -> bool {
        self.send_queue
            .max_bytes()
            .is_none_or(|max| self.bytes_pending_out.load(Ordering::Relaxed) < max)
    }

    /// Appends an encoded frame to the connection's write buffer, or to its
    /// preconnect buffer while the socket does not exist yet. Unknown ids
    /// disconnected in the meantime; their payloads are dropped.
    pub fn stage_bytes(&self, state: &mut Shared, id: ConnectionId, payload: &[u8]) {
        if payload.is_empty() {
            return;
        }
        let Some(conn) = state.conns.get_mut(&id) else { return };
        if conn.transport.is_some() {
            let frame = encode_frame(payload, self.extra_size_check);
            self.bytes_pending_out.fetch_add(frame.len(), Ordering::Relaxed);
            conn.write_buf.extend_from_slice(&frame);
        } else {
            conn.preconnect.push(payload.to_vec());
        }
    }

    /// Handles one complete inbound frame. Returns false when the connection
    /// must be closed.
    pub fn on_payload(&self, conn: &mut Connection, payload: &[u8]) -> bool {
        if conn.state == ConnState::AwaitingAuth {
            if self.auth_token.as_ref().is_some_and(|token| payload == token.as_bytes()) {
                conn.state = ConnState::Established;
                debug!(id = %conn.id, "connection authenticated");
                true
            } else {
                error!(id = %conn.id, "unauthorized peer connected to us");
                false
            }
        } else {
            match self.codec.decode(payload) {
                Ok(message) => {
                    self.fire(BusEvent::IncomingMessage { id: conn.id, message });
                    true
                }
                Err(err) => {
                    // an authenticated peer sent an undecodable frame: drop
                    // the frame, keep the connection
                    error!(id = %conn.id, %err, "failed to deserialize a message");
                    true
                }
            }
        }
    }
}

/// Forms an outgoing connection: blocking TCP connect plus TLS handshake,
/// then the socket handoff under the bus lock. Runs on the event thread via
/// a delay-zero timer callback so the IO loop never blocks on it.
pub(crate) fn do_connect<C: MessageCodec>(core: &Arc<BusCore<C>>, id: ConnectionId) {
    let endpoint = {
        let state = core.lock_state();
        let Some(conn) = state.conns.get(&id) else { return };
        conn.peer.clone()
    };

    match connect_transport(&endpoint, core.tls_client.as_ref()) {
        Ok(transport) => {
            let mut state = core.lock_state();
            let Some(conn) = state.conns.get_mut(&id) else { return };
            conn.transport = Some(transport);
            conn.state = ConnState::Established;
            let staged = std::mem::take(&mut conn.preconnect);
            for payload in staged {
                core.stage_bytes(&mut state, id, &payload);
            }
            drop(state);
            debug!(%id, %endpoint, "outgoing connection established");
            // the IO loop starts polling the socket when it sees this
            core.push_control(Control::Event(BusEvent::OutgoingConnectionEstablished { id }));
        }
        Err(err) => {
            debug!(%endpoint, %err, "failed to connect");
            core.lock_state().conns.remove(&id);
            core.push_control(Control::Event(BusEvent::OutgoingConnectionFailed { id }));
        }
    }
}

/// Bidirectional, strongly-typed message bus over TCP with optional TLS and
/// shared-secret authentication.
///
/// A bus owns two threads: an IO loop multiplexing every socket, and an
/// event loop that invokes the user callback for every lifecycle transition
/// and inbound message in a total order. Callers on any thread may
/// [`connect`], [`send`] and [`schedule_callback`]; none of those touch
/// sockets directly.
///
/// [`connect`]: Bus::connect
/// [`send`]: Bus::send
/// [`schedule_callback`]: Bus::schedule_callback
pub struct Bus<C: MessageCodec> {
    core: Arc<BusCore<C>>,
    config: BusConfig,
    callback: Mutex<Option<Box<dyn FnMut(BusEvent<C::In>) + Send>>>,
    event_rx: Mutex<Option<Receiver<EventItem<C::In>>>>,
    io_thread: Mutex<Option<JoinHandle<()>>>,
    event_thread: Mutex<Option<JoinHandle<()>>>,
}

impl<C: MessageCodec> Bus<C> {
    /// Builds a bus around a codec and an event callback.
    ///
    /// # Panics
    /// Panics when the configuration is inconsistent (a cert path without
    /// `want_tls`).
    pub fn new(
        config: BusConfig,
        codec: C,
        on_event: impl FnMut(BusEvent<C::In>) + Send + 'static,
    ) -> Result<Self, BusError> {
        assert!(
            config.want_tls || config.cert_path.is_none(),
            "makes no sense to give a cert path and not request tls"
        );

        let (event_tx, event_rx) = channel();
        let core = Arc::new(BusCore {
            identity: config.identity.clone(),
            auth_token: config.auth_token.clone(),
            extra_size_check: config.extra_size_check,
            codec,
            tls_client: config.want_tls.then(client_tls_config),
            state: Mutex::new(Shared {
                conns: HashMap::new(),
                next_id: 1,
                timers: TimerHeap::new(),
                listen_endpoint: config.listen.clone(),
                started: false,
                stopped: false,
            }),
            send_queue: ByteLimitedQueue::new(SendItem::byte_size, config.max_write_queue_bytes),
            controls: Mutex::new(VecDeque::new()),
            event_queue: event_tx,
            msg_wake: WakePipe::new().map_err(BusError::FailedToStart)?,
            event_wake: WakePipe::new().map_err(BusError::FailedToStart)?,
            general_wake: WakePipe::new().map_err(BusError::FailedToStart)?,
            bytes_pending_out: AtomicUsize::new(0),
            total_bytes_written: AtomicUsize::new(0),
            total_bytes_read: AtomicUsize::new(0),
            running: AtomicBool::new(false),
        });

        Ok(Self {
            core,
            config,
            callback: Mutex::new(Some(Box::new(on_event))),
            event_rx: Mutex::new(Some(event_rx)),
            io_thread: Mutex::new(None),
            event_thread: Mutex::new(None),
        })
    }

    /// Binds the accept socket (when configured) and starts both loops.
    /// Calling this on a bus that is or was already running is a no-op.
    pub fn start(&self) -> Result<(), BusError> {
        let mut state = self.core.lock_state();
        if state.started || state.stopped {
            return Ok(());
        }

        let listener = match &self.config.listen {
            None => None,
            Some(endpoint) => {
                let addr = resolve(endpoint).map_err(BusError::FailedToStart)?;
                let listener = TcpListener::bind(addr).map_err(BusError::FailedToStart)?;
                let local = listener.local_addr().map_err(BusError::FailedToStart)?;
                state.listen_endpoint = Some(Endpoint::new(endpoint.host.clone(), local.port()));
                Some(listener)
            }
        };

        let server_tls = match (&listener, self.config.want_tls) {
            (Some(_), true) => {
                let cert_path = self
                    .config
                    .cert_path
                    .as_deref()
                    .expect("listening with tls requires cert_path");
                Some(server_tls_config(cert_path).map_err(BusError::FailedToStart)?)
            }
            _ => None,
        };

        let io = IoLoop::new(Arc::clone(&self.core), listener, server_tls)
            .map_err(BusError::FailedToStart)?;

        state.started = true;
        let listen = state.listen_endpoint.clone();
        drop(state);
        self.core.running.store(true, Ordering::Release);

        let (Some(event_rx), Some(callback)) =
            (lock(&self.event_rx).take(), lock(&self.callback).take())
        else {
            return Ok(());
        };

        let identity = self.core.identity.clone();
        let event_thread = std::thread::Builder::new()
            .name(format!("{identity}-events"))
            .spawn(move || {
                let _span = span!(Level::INFO, "", bus = %identity).entered();
                event_loop::run(event_rx, callback);
            })
            .map_err(BusError::FailedToStart)?;

        let identity = self.core.identity.clone();
        let io_thread = std::thread::Builder::new()
            .name(format!("{identity}-io"))
            .spawn(move || {
                let _span = span!(Level::INFO, "", bus = %identity).entered();
                io.run();
            })
            .map_err(BusError::FailedToStart)?;

        *lock(&self.io_thread) = Some(io_thread);
        *lock(&self.event_thread) = Some(event_thread);

        info!(bus = %self.core.identity, ?listen, "message bus started");
        Ok(())
    }

    /// Stops the bus and joins both loops. `Stopped` is the last event the
    /// callback observes. A second call is a no-op; the bus cannot be
    /// started again.
    pub fn stop(&self) {
        {
            let mut state = self.core.lock_state();
            if !state.started {
                return;
            }
            state.started = false;
            state.stopped = true;
        }
        self.core.running.store(false, Ordering::Release);
        debug!(bus = %self.core.identity, "stopping message bus");

        // zero-size sentinel; deliberately no wake byte
        self.core.send_queue.put(SendItem::Disconnected);
        self.core.push_control(Control::Event(BusEvent::Stopped));

        // the IO loop exits on the Stopped sentinel, after forwarding it
        if let Some(handle) = lock(&self.io_thread).take() {
            let _ = handle.join();
        }
        let _ = self.core.event_queue.send(EventItem::Shutdown);
        if let Some(handle) = lock(&self.event_thread).take() {
            let _ = handle.join();
        }

        // dropping the transports closes the remaining sockets
        let mut state = self.core.lock_state();
        state.conns.clear();
        self.core.bytes_pending_out.store(0, Ordering::Relaxed);
    }

    /// Begins connecting to `endpoint` and returns immediately. The id is
    /// usable straight away: messages sent before establishment are buffered
    /// and flushed after the auth token.
    pub fn connect(&self, endpoint: Endpoint) -> Result<ConnectionId, BusError> {
        if !self.core.running.load(Ordering::Acquire) {
            return Err(BusError::NotStarted);
        }
        let id = {
            let mut state = self.core.lock_state();
            let id = ConnectionId(state.next_id);
            state.next_id += 1;
            state
                .conns
                .insert(id, Connection::pending(id, endpoint, self.config.extra_size_check));
            id
        };
        // Connect travels on the send queue, not the event pipeline, so the
        // auth token is staged ahead of any message sent after this returns.
        self.core.send_queue.put(SendItem::Connect(id));
        self.core.msg_wake.notify();
        Ok(id)
    }

    /// Serializes and enqueues a message. `Ok(false)` means the id is known
    /// dead and the message was dropped; `Ok(true)` means the send might
    /// succeed. Blocks while the write queue sits at its byte cap.
    pub fn send(&self, id: ConnectionId, msg: &C::Out) -> Result<bool, BusError> {
        if !self.core.running.load(Ordering::Acquire) {
            return Err(BusError::NotStarted);
        }
        let payload = self.core.codec.encode(msg)?;
        if self.core.is_definitely_dead(id) {
            return Ok(false);
        }
        self.core.send_queue.put(SendItem::Message(id, payload));
        self.core.msg_wake.notify();
        Ok(true)
    }

    /// Asks the IO loop to drop the connection. No-op when already dead.
    pub fn close_connection(&self, id: ConnectionId) {
        if self.core.is_definitely_dead(id) {
            return;
        }
        self.core.push_control(Control::Disconnect(id));
    }

    /// Schedules a closure to run on the event thread. Scheduled callbacks
    /// cannot be cancelled; model cancellation with a flag the closure
    /// checks.
    pub fn schedule_callback(&self, when: Schedule, callback: impl FnOnce() + Send + 'static) {
        self.core.schedule(when, Box::new(callback));
    }

    /// Caps the bytes pending in the outbound flow. Senders block in
    /// [`send`] while the cap is hit.
    ///
    /// [`send`]: Bus::send
    pub fn set_max_write_queue_bytes(&self, cap: Option<usize>) {
        self.core.send_queue.set_max_bytes(cap);
    }

    /// Whether any sender is currently parked on the write-queue cap.
    pub fn is_write_queue_blocked(&self) -> bool {
        self.core.send_queue.is_blocked()
    }

    /// The endpoint we accept on, with a port-zero bind resolved to the
    /// OS-assigned port.
    pub fn listening_endpoint(&self) -> Option<Endpoint> {
        self.core.lock_state().listen_endpoint.clone()
    }

    pub fn identity(&self) -> &str {
        &self.core.identity
    }

    pub fn total_bytes_read(&self) -> usize {
        self.core.total_bytes_read.load(Ordering::Relaxed)
    }

    pub fn total_bytes_written(&self) -> usize {
        self.core.total_bytes_written.load(Ordering::Relaxed)
    }
}
