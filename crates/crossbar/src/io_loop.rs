use std::{
    io,
    net::{Shutdown, SocketAddr},
    ops::ControlFlow,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, atomic::Ordering},
    thread,
    time::{Duration, Instant},
};

use mio::{Events, Interest, Poll, Token, net::TcpListener};
use rustls::{Connection as TlsSession, ServerConfig, ServerConnection};
use tracing::{debug, error, info, warn};

use crate::{
    bus::{BusCore, Control, Schedule, do_connect},
    codec::MessageCodec,
    conn::{ConnState, Connection, ConnectionId, Direction, Endpoint},
    event::BusEvent,
    event_loop::EventItem,
    queue::SendItem,
};

/// Read burst for sockets and wake pipes.
pub(crate) const MSG_BUF_SIZE: usize = 128 * 1024;

const EPOLL_TIMEOUT: Duration = Duration::from_secs(5);
/// Consecutive no-progress polls before write interest is dropped so the
/// poll call can park.
const MAX_IDLE_SPINS: u32 = 10;
const SPIN_RESET_WINDOW: Duration = Duration::from_millis(10);
/// Disconnects racing a pending connect are retried at this cadence.
const RETRY_DISCONNECT_DELAY: Duration = Duration::from_millis(100);
const LOOP_ERROR_BACKOFF: Duration = Duration::from_secs(1);

const TOKEN_GENERAL_WAKE: Token = Token(0);
const TOKEN_EVENT_WAKE: Token = Token(1);
const TOKEN_MSG_WAKE: Token = Token(2);
const TOKEN_ACCEPT: Token = Token(3);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EventOutcome {
    Worked,
    Idle,
    Exit,
}

/// The IO thread: one poll, every socket, both wake pipes, the listener.
///
/// Nothing in here may block except the poll call itself, which is bounded
/// by the earliest timer deadline. The loop only exits through the `Stopped`
/// sentinel posted by `Bus::stop`; any other failure is logged and survived.
pub(crate) struct IoLoop<C: MessageCodec> {
    events: Events,
    inner: Inner<C>,
}

struct Inner<C: MessageCodec> {
    core: Arc<BusCore<C>>,
    poll: Poll,
    listener: Option<TcpListener>,
    server_tls: Option<Arc<ServerConfig>>,
    scratch: Vec<u8>,
    /// The message wake pipe is registered for read.
    msg_wake_armed: bool,
    idle_spins: u32,
    spin_window_start: Instant,
}

impl<C: MessageCodec> IoLoop<C> {
    pub(crate) fn new(
        core: Arc<BusCore<C>>,
        mut listener: Option<TcpListener>,
        server_tls: Option<Arc<ServerConfig>>,
    ) -> io::Result<Self> {
        let poll = Poll::new()?;
        core.general_wake.register(poll.registry(), TOKEN_GENERAL_WAKE)?;
        core.event_wake.register(poll.registry(), TOKEN_EVENT_WAKE)?;
        if let Some(listener) = listener.as_mut() {
            poll.registry().register(listener, TOKEN_ACCEPT, Interest::READABLE)?;
        }

        Ok(Self {
            events: Events::with_capacity(128),
            inner: Inner {
                core,
                poll,
                listener,
                server_tls,
                scratch: vec![0; MSG_BUF_SIZE],
                msg_wake_armed: false,
                idle_spins: 0,
                spin_window_start: Instant::now(),
            },
        })
    }

    pub(crate) fn run(mut self) {
        info!("io loop running");
        loop {
            match catch_unwind(AssertUnwindSafe(|| self.turn())) {
                Ok(ControlFlow::Continue(())) => {}
                Ok(ControlFlow::Break(())) => {
                    debug!("io loop exiting gracefully");
                    return;
                }
                Err(_) => {
                    error!("io loop body panicked; backing off");
                    thread::sleep(LOOP_ERROR_BACKOFF);
                }
            }
        }
    }

    fn turn(&mut self) -> ControlFlow<()> {
        let now = Instant::now();
        if now.duration_since(self.inner.spin_window_start) > SPIN_RESET_WINDOW {
            self.inner.spin_window_start = now;
            self.inner.idle_spins = 0;
        }

        // Under backpressure the message pipe is unsubscribed so producers
        // park in the send queue instead of growing the write buffers.
        let can_read = self.inner.core.can_read_send_queue();

        let mut sleep = EPOLL_TIMEOUT;
        if can_read {
            if let Some(next) = self.inner.pump_timers(now) {
                sleep = sleep.min(next.saturating_duration_since(now));
            }
        }

        self.inner.arm_msg_wake(can_read);
        self.inner.arm_write_interest();

        if let Err(err) = self.inner.poll.poll(&mut self.events, Some(sleep)) {
            if err.kind() != io::ErrorKind::Interrupted {
                error!(%err, "poll failed");
                thread::sleep(LOOP_ERROR_BACKOFF);
            }
            return ControlFlow::Continue(());
        }

        let mut worked = false;
        for event in self.events.iter() {
            let outcome = self.inner.handle_event(
                event.token(),
                event.is_readable(),
                event.is_writable(),
                can_read,
            );
            match outcome {
                EventOutcome::Worked => worked = true,
                EventOutcome::Idle => {}
                EventOutcome::Exit => return ControlFlow::Break(()),
            }
        }

        if worked {
            self.inner.idle_spins = 0;
        } else {
            self.inner.idle_spins += 1;
        }
        ControlFlow::Continue(())
    }
}

impl<C: MessageCodec> Inner<C> {
    /// Moves due timer callbacks to the event thread and reports the next
    /// deadline so the poll sleep can be shortened.
    fn pump_timers(&mut self, now: Instant) -> Option<Instant> {
        let mut state = self.core.lock_state();
        for callback in state.timers.pop_due(now) {
            let _ = self.core.event_queue.send(EventItem::Run(callback));
        }
        state.timers.next_deadline()
    }

    fn arm_msg_wake(&mut self, can_read: bool) {
        if can_read == self.msg_wake_armed {
            return;
        }
        let result = if can_read {
            self.core.msg_wake.register(self.poll.registry(), TOKEN_MSG_WAKE)
        } else {
            self.core.msg_wake.deregister(self.poll.registry())
        };
        match result {
            Ok(()) => self.msg_wake_armed = can_read,
            Err(err) => warn!(%err, "message wake pipe registration"),
        }
    }

    /// Registers WRITABLE interest for every socket with bytes (or TLS state)
    /// to flush. After `MAX_IDLE_SPINS` polls without progress all write
    /// interest is dropped so the loop stops spinning on a stuck peer.
    fn arm_write_interest(&mut self) {
        let spinning = self.idle_spins >= MAX_IDLE_SPINS;
        let mut state = self.core.lock_state();
        let registry = self.poll.registry();
        for conn in state.conns.values_mut() {
            if !conn.registered {
                continue;
            }
            let token = conn.id.token();
            let Some(transport) = conn.transport.as_mut() else { continue };
            let desired = !spinning && (!conn.write_buf.is_empty() || transport.wants_write());
            if desired == conn.writable_armed {
                continue;
            }
            let interest = if desired {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            match registry.reregister(transport.stream_mut(), token, interest) {
                Ok(()) => conn.writable_armed = desired,
                Err(err) => debug!(?token, %err, "write interest reregister"),
            }
        }
    }

    fn handle_event(
        &mut self,
        token: Token,
        readable: bool,
        writable: bool,
        can_read: bool,
    ) -> EventOutcome {
        match token {
            TOKEN_GENERAL_WAKE => {
                self.core.general_wake.drain(&mut self.scratch);
                EventOutcome::Worked
            }
            TOKEN_EVENT_WAKE => {
                // one control per wake byte
                let pending = self.core.event_wake.drain(&mut self.scratch);
                for _ in 0..pending {
                    if self.handle_control() == EventOutcome::Exit {
                        return EventOutcome::Exit;
                    }
                }
                EventOutcome::Worked
            }
            TOKEN_MSG_WAKE => {
                if !can_read {
                    return EventOutcome::Idle;
                }
                let pending = self.core.msg_wake.drain(&mut self.scratch);
                for _ in 0..pending {
                    self.handle_send_item();
                }
                EventOutcome::Worked
            }
            TOKEN_ACCEPT => {
                if self.accept_ready() { EventOutcome::Worked } else { EventOutcome::Idle }
            }
            token => {
                let mut worked = false;
                if readable {
                    worked |= self.handle_read(token);
                }
                if writable {
                    worked |= self.handle_write(token);
                }
                if worked { EventOutcome::Worked } else { EventOutcome::Idle }
            }
        }
    }

    /// Synthetic events posted by other threads: connection establishment,
    /// disconnect requests and the stop sentinel.
    fn handle_control(&mut self) -> EventOutcome {
        let item = crate::lock(&self.core.controls).pop_front();
        let Some(item) = item else { return EventOutcome::Idle };

        match item {
            Control::Disconnect(id) => {
                let mut state = self.core.lock_state();
                let defer = match state.conns.get(&id) {
                    None => {
                        error!(%id, "no connection found for disconnect");
                        return EventOutcome::Worked;
                    }
                    // Still connecting, or established but not yet announced:
                    // retry once the state settles so the close event cannot
                    // overtake the establish event.
                    Some(conn) => conn.state == ConnState::PendingConnect || !conn.registered,
                };
                if defer {
                    drop(state);
                    let core = Arc::clone(&self.core);
                    self.core.schedule(
                        Schedule::After(RETRY_DISCONNECT_DELAY),
                        Box::new(move || core.push_control(Control::Disconnect(id))),
                    );
                } else {
                    self.close_conn(&mut state, id);
                }
                EventOutcome::Worked
            }
            Control::Event(BusEvent::OutgoingConnectionEstablished { id }) => {
                {
                    let mut state = self.core.lock_state();
                    if let Some(conn) = state.conns.get_mut(&id) {
                        let token = conn.id.token();
                        if let Some(transport) = conn.transport.as_mut() {
                            let registered = self.poll.registry().register(
                                transport.stream_mut(),
                                token,
                                Interest::READABLE,
                            );
                            match registered {
                                Ok(()) => conn.registered = true,
                                Err(err) => error!(%id, %err, "registering established connection"),
                            }
                        }
                    } else {
                        error!(%id, "no known socket for established connection");
                    }
                }
                self.core.fire(BusEvent::OutgoingConnectionEstablished { id });
                EventOutcome::Worked
            }
            Control::Event(BusEvent::Stopped) => {
                self.core.fire(BusEvent::Stopped);
                // the only way out of the loop
                EventOutcome::Exit
            }
            Control::Event(event) => {
                self.core.fire(event);
                EventOutcome::Worked
            }
        }
    }

    /// One send-queue item per message wake byte.
    fn handle_send_item(&mut self) {
        let Some(item) = self.core.send_queue.try_get() else { return };
        match item {
            SendItem::Disconnected => {}
            SendItem::Connect(id) => {
                // Stage the auth token first; the preconnect buffer is FIFO,
                // so it hits the wire before anything sent after connect().
                if let Some(token) = self.core.auth_token.clone() {
                    let mut state = self.core.lock_state();
                    self.core.stage_bytes(&mut state, id, token.as_bytes());
                }
                // The handshake blocks, so it runs on the event thread.
                let core = Arc::clone(&self.core);
                self.core.schedule(Schedule::Now, Box::new(move || do_connect(&core, id)));
            }
            SendItem::Message(id, payload) => {
                let mut state = self.core.lock_state();
                self.core.stage_bytes(&mut state, id, &payload);
            }
        }
    }

    fn accept_ready(&mut self) -> bool {
        let mut worked = false;
        loop {
            let Some(listener) = self.listener.as_ref() else { return worked };
            match listener.accept() {
                Ok((mut stream, addr)) => {
                    worked = true;
                    if let Err(err) = stream.set_nodelay(true) {
                        debug!(%err, "nodelay on accepted socket");
                    }
                    let transport = match &self.server_tls {
                        None => crate::transport::Transport::plain(stream),
                        Some(config) => match ServerConnection::new(Arc::clone(config)) {
                            Ok(session) => crate::transport::Transport::tls(
                                stream,
                                TlsSession::from(session),
                            ),
                            Err(err) => {
                                error!(%err, "tls session for accepted socket");
                                continue;
                            }
                        },
                    };
                    self.register_incoming(transport, addr);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return worked,
                Err(err) => {
                    // e.g. EMFILE; existing connections keep working
                    info!(%err, "failed to accept incoming socket");
                    return worked;
                }
            }
        }
    }

    fn register_incoming(&mut self, mut transport: crate::transport::Transport, addr: SocketAddr) {
        let needs_auth = self.core.auth_token.is_some();
        let source = Endpoint::from(addr);

        let id = {
            let mut state = self.core.lock_state();
            let id = ConnectionId(state.next_id);
            state.next_id += 1;

            let registered = self.poll.registry().register(
                transport.stream_mut(),
                id.token(),
                Interest::READABLE,
            );
            if let Err(err) = registered {
                warn!(%err, "could not register accepted socket");
                let _ = transport.stream_mut().shutdown(Shutdown::Both);
                return;
            }

            let mut conn = Connection::incoming(
                id,
                source.clone(),
                transport,
                needs_auth,
                self.core.extra_size_check,
            );
            conn.registered = true;
            state.conns.insert(id, conn);
            id
        };

        info!(%source, %id, "client connected");
        self.core.fire(BusEvent::NewIncomingConnection { source, id });
    }

    fn handle_read(&mut self, token: Token) -> bool {
        let id = ConnectionId::from_token(token);
        let mut state = self.core.lock_state();
        let mut worked = false;

        let close = 'read: loop {
            let Some(conn) = state.conns.get_mut(&id) else {
                warn!(%id, "data on a connection the bus does not know about");
                break false;
            };
            let Some(transport) = conn.transport.as_mut() else { break false };

            match transport.recv(&mut self.scratch) {
                Ok(0) => break true,
                Ok(n) => {
                    worked = true;
                    self.core.total_bytes_read.fetch_add(n, Ordering::Relaxed);
                    let payloads = match conn.frame_buf.write(&self.scratch[..n]) {
                        Ok(payloads) => payloads,
                        Err(err) => {
                            error!(%id, %err, "closing connection due to corrupted message stream");
                            break true;
                        }
                    };
                    for payload in payloads {
                        if !self.core.on_payload(conn, &payload) {
                            break 'read true;
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break false,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    warn!(%id, %err, "read failed");
                    break true;
                }
            }
        };

        if close {
            self.close_conn(&mut state, id);
            worked = true;
        }
        worked
    }

    fn handle_write(&mut self, token: Token) -> bool {
        let id = ConnectionId::from_token(token);
        let mut state = self.core.lock_state();
        let Some(conn) = state.conns.get_mut(&id) else { return false };
        let Some(transport) = conn.transport.as_mut() else { return false };

        let mut worked = false;
        let mut close = false;
        while !conn.write_buf.is_empty() {
            match transport.send(&conn.write_buf) {
                Ok(0) => {
                    warn!(%id, "socket refused bytes, closing");
                    close = true;
                    break;
                }
                Ok(n) => {
                    worked = true;
                    self.core.bytes_pending_out.fetch_sub(n, Ordering::Relaxed);
                    self.core.total_bytes_written.fetch_add(n, Ordering::Relaxed);
                    conn.write_buf.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    warn!(%id, %err, "write failed, closing");
                    close = true;
                    break;
                }
            }
        }

        // Handshake bytes may be pending even with nothing queued; a flush
        // that would block just parks until the next readiness edge.
        if !close && transport.wants_write() {
            match transport.flush() {
                Ok(()) => worked = true,
                Err(err) => {
                    warn!(%id, %err, "tls flush failed, closing");
                    close = true;
                }
            }
        }

        if close {
            self.close_conn(&mut state, id);
            worked = true;
        }
        worked
    }

    /// Removes the connection, closes its socket and emits the close event.
    /// Discarded write bytes leave the pending-out gate.
    fn close_conn(&self, state: &mut crate::bus::Shared, id: ConnectionId) {
        let Some(mut conn) = state.conns.remove(&id) else { return };
        if let Some(transport) = conn.transport.as_mut() {
            transport.close(self.poll.registry());
        }
        let discarded = conn.write_buf.len();
        if discarded > 0 {
            self.core.bytes_pending_out.fetch_sub(discarded, Ordering::Relaxed);
        }
        let event = match conn.direction {
            Direction::Incoming => BusEvent::IncomingConnectionClosed { id },
            Direction::Outgoing => BusEvent::OutgoingConnectionClosed { id },
        };
        debug!(%id, "connection closed");
        self.core.fire(event);
    }
}
