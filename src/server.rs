//! Server demultiplexer: one shared datagram socket serving many peers,
//! keyed by `conn_id`, with a secondary remote-address index that
//! accelerates lookup but is never authoritative on its own.
//!
//! Each session carries the full Go-Back-N sender/receiver state, a
//! room registry tracks group membership for broadcast delivery, and a
//! background sweep thread drives retransmission and liveness reaping
//! across every session from one place rather than one timer per peer.

use std::collections::{HashMap, HashSet};
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::codec::{Flags, Packet};
use crate::config::Config;
use crate::connection::{ReceiverState, SenderState};
use crate::loss::LossInjector;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::state::ConnectionState;

const RECV_BUF_SIZE: usize = 2048;
const SOCKET_READ_TIMEOUT: Duration = Duration::from_millis(100);
const SWEEP_INTERVAL: Duration = Duration::from_millis(20);

type MessageCallback = dyn Fn(u16, Vec<u8>) + Send + Sync + 'static;

struct Session {
    conn_id: u16,
    addr: Mutex<SocketAddr>,
    state: Mutex<ConnectionState>,
    sender: Mutex<SenderState>,
    receiver: Mutex<ReceiverState>,
    retx_deadline: Mutex<Option<Instant>>,
    loss: Mutex<LossInjector>,
    metrics: Metrics,
    last_activity: Mutex<Instant>,
}

/// A server-side demultiplexer: one bound socket, a `conn_id`-keyed
/// connection table, and an address-to-`conn_id` secondary index.
pub struct Server {
    socket: Arc<UdpSocket>,
    config: Config,
    sessions: Mutex<HashMap<u16, Arc<Session>>>,
    addr_index: Mutex<HashMap<SocketAddr, u16>>,
    rooms: Mutex<HashMap<String, HashSet<u16>>>,
    on_message: Box<MessageCallback>,
    running: AtomicBool,
}

impl Server {
    /// Binds `local_addr` and spawns the receive-dispatch thread and the
    /// retransmission/liveness sweep thread. `on_message(conn_id, payload)`
    /// is invoked in order, per connection, on the receive thread.
    pub fn bind(
        local_addr: SocketAddr,
        on_message: impl Fn(u16, Vec<u8>) + Send + Sync + 'static,
        config: Config,
    ) -> std::io::Result<Arc<Self>> {
        let socket = UdpSocket::bind(local_addr)?;
        socket.set_read_timeout(Some(SOCKET_READ_TIMEOUT))?;

        let server = Arc::new(Server {
            socket: Arc::new(socket),
            config,
            sessions: Mutex::new(HashMap::new()),
            addr_index: Mutex::new(HashMap::new()),
            rooms: Mutex::new(HashMap::new()),
            on_message: Box::new(on_message),
            running: AtomicBool::new(true),
        });

        let recv_server = Arc::clone(&server);
        thread::spawn(move || recv_server.receive_loop());

        let sweep_server = Arc::clone(&server);
        thread::spawn(move || sweep_server.sweep_loop());

        Ok(server)
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Sends `payload` to an established connection, admitting it under
    /// that connection's sliding window exactly as `Connection::send` does.
    pub fn send(&self, conn_id: u16, payload: &[u8]) -> Result<u32, crate::error::Error> {
        let session = {
            let sessions = self.sessions.lock().unwrap();
            sessions
                .get(&conn_id)
                .cloned()
                .ok_or(crate::error::Error::NotEstablished)?
        };
        if *session.state.lock().unwrap() != ConnectionState::Established {
            return Err(crate::error::Error::NotEstablished);
        }

        let mut sender = session.sender.lock().unwrap();
        if sender.next_seq.wrapping_sub(sender.send_base) >= sender.effective_window() {
            return Err(crate::error::Error::WindowFull);
        }

        let seq = sender.next_seq;
        let recv_win = session.receiver.lock().unwrap().recv_win;
        let addr = *session.addr.lock().unwrap();
        let pkt = Packet::new(Flags::empty(), conn_id, seq, 0, recv_win).with_payload(payload.to_vec());

        let now = Instant::now();
        self.transmit(&session, &pkt, addr);
        session.metrics.record_sent(payload.len(), now);

        let was_idle = sender.send_base == sender.next_seq;
        sender.unacked.insert(seq, (pkt, now));
        sender.next_seq += 1;
        drop(sender);

        if was_idle {
            *session.retx_deadline.lock().unwrap() = Some(now + self.config.t_retx);
        }

        Ok(seq)
    }

    pub fn metrics(&self, conn_id: u16) -> Option<MetricsSnapshot> {
        let sessions = self.sessions.lock().unwrap();
        sessions.get(&conn_id).map(|s| s.metrics.snapshot())
    }

    /// Adds `conn_id` to `room`'s membership, creating the room if absent.
    pub fn join_room(&self, conn_id: u16, room: &str) {
        self.rooms
            .lock()
            .unwrap()
            .entry(room.to_string())
            .or_default()
            .insert(conn_id);
    }

    pub fn leave_room(&self, conn_id: u16, room: &str) {
        if let Some(members) = self.rooms.lock().unwrap().get_mut(room) {
            members.remove(&conn_id);
        }
    }

    pub fn members_of(&self, room: &str) -> Vec<u16> {
        self.rooms
            .lock()
            .unwrap()
            .get(room)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Sends `payload` to every connection currently in `room`. A member
    /// that fails to send (e.g. a full window) is skipped, not retried.
    pub fn broadcast(&self, room: &str, payload: &[u8]) {
        for conn_id in self.members_of(room) {
            if let Err(err) = self.send(conn_id, payload) {
                warn!(conn_id, error = %err, "broadcast skipped a member");
            }
        }
    }

    fn receive_loop(self: Arc<Self>) {
        let mut buf = [0u8; RECV_BUF_SIZE];
        while self.running.load(Ordering::SeqCst) {
            match self.socket.recv_from(&mut buf) {
                Ok((n, addr)) => {
                    let pkt = match Packet::unpack(&buf[..n]) {
                        Ok(pkt) => pkt,
                        Err(err) => {
                            trace!(error = %err, "dropping malformed packet");
                            continue;
                        }
                    };
                    self.dispatch(pkt, addr);
                }
                Err(err)
                    if matches!(
                        err.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    continue;
                }
                Err(err) => {
                    warn!(error = %err, "transient substrate error; continuing");
                    continue;
                }
            }
        }
    }

    fn dispatch(self: &Arc<Self>, pkt: Packet, addr: SocketAddr) {
        if pkt.flags.contains(Flags::SYN) {
            self.handle_syn(&pkt, addr);
            return;
        }
        if pkt.flags.contains(Flags::FIN) {
            self.handle_fin(&pkt);
            return;
        }

        let session = {
            let sessions = self.sessions.lock().unwrap();
            sessions.get(&pkt.conn_id).cloned()
        };
        let Some(session) = session else {
            trace!(conn_id = pkt.conn_id, "unknown connection; dropping");
            return;
        };

        // A peer's source address may change mid-connection (NAT
        // rebinding); prefer routing by conn_id and refresh the index
        // rather than rejecting the datagram.
        {
            let mut current = session.addr.lock().unwrap();
            if *current != addr {
                self.addr_index.lock().unwrap().remove(&current);
                self.addr_index.lock().unwrap().insert(addr, pkt.conn_id);
                *current = addr;
            }
        }
        *session.last_activity.lock().unwrap() = Instant::now();

        if pkt.flags.contains(Flags::ACK) && !pkt.is_data() {
            let mut state = session.state.lock().unwrap();
            if *state == ConnectionState::SynRcvd {
                session.sender.lock().unwrap().peer_recv_win = pkt.recv_win;
                *state = ConnectionState::Established;
                debug!(conn_id = pkt.conn_id, "handshake established (server)");
                return;
            }
        }

        if pkt.is_data() && *session.state.lock().unwrap() != ConnectionState::Established {
            return;
        }

        if pkt.is_data() {
            self.handle_data(&session, &pkt, addr);
        }
        if pkt.flags.contains(Flags::ACK) {
            self.handle_ack(&session, &pkt);
        }
    }

    fn handle_syn(self: &Arc<Self>, pkt: &Packet, addr: SocketAddr) {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions.entry(pkt.conn_id).or_insert_with(|| {
            debug!(conn_id = pkt.conn_id, %addr, "new connection");
            self.addr_index.lock().unwrap().insert(addr, pkt.conn_id);
            Arc::new(Session {
                conn_id: pkt.conn_id,
                addr: Mutex::new(addr),
                state: Mutex::new(ConnectionState::SynRcvd),
                sender: Mutex::new(SenderState::new(self.config.window_size, pkt.recv_win.max(1))),
                receiver: Mutex::new(ReceiverState {
                    expected_seq: 0,
                    recv_win: self.config.recv_win,
                }),
                retx_deadline: Mutex::new(None),
                loss: Mutex::new(LossInjector::new(self.config.loss_profile)),
                metrics: Metrics::new(),
                last_activity: Mutex::new(Instant::now()),
            })
        });
        let session = Arc::clone(session);
        drop(sessions);

        let syn_ack = Packet::new(
            Flags::SYN | Flags::ACK,
            pkt.conn_id,
            0,
            pkt.seq + 1,
            self.config.recv_win,
        );
        self.transmit(&session, &syn_ack, addr);
    }

    fn handle_data(self: &Arc<Self>, session: &Arc<Session>, pkt: &Packet, addr: SocketAddr) {
        let (ack_value, recv_win, delivered) = {
            let mut receiver = session.receiver.lock().unwrap();
            let delivered = if pkt.seq == receiver.expected_seq {
                receiver.expected_seq += 1;
                true
            } else {
                if pkt.seq > receiver.expected_seq {
                    session.metrics.record_ooo();
                }
                false
            };
            (receiver.expected_seq, receiver.recv_win, delivered)
        };

        if delivered {
            (self.on_message)(session.conn_id, pkt.payload.clone());
            session
                .metrics
                .record_delivered(pkt.payload.len(), Instant::now());
        }

        let ack_pkt = Packet::new(Flags::ACK, session.conn_id, 0, ack_value, recv_win);
        self.transmit(session, &ack_pkt, addr);
    }

    fn handle_ack(self: &Arc<Self>, session: &Arc<Session>, pkt: &Packet) {
        let now = Instant::now();
        {
            let mut sender = session.sender.lock().unwrap();
            if pkt.ack > sender.send_base {
                let acked_seqs: Vec<u32> = sender
                    .unacked
                    .range(sender.send_base..pkt.ack)
                    .map(|(seq, _)| *seq)
                    .collect();
                for seq in acked_seqs {
                    if let Some((_, sent_at)) = sender.unacked.remove(&seq) {
                        session.metrics.record_rtt_sample(now.duration_since(sent_at));
                    }
                }
                sender.send_base = pkt.ack;
                sender.peer_recv_win = pkt.recv_win;
                let mut deadline = session.retx_deadline.lock().unwrap();
                *deadline = if sender.send_base == sender.next_seq {
                    None
                } else {
                    Some(now + self.config.t_retx)
                };
            } else {
                sender.peer_recv_win = pkt.recv_win;
                session.metrics.record_duplicate_ack();
            }
        }
    }

    fn handle_fin(self: &Arc<Self>, pkt: &Packet) {
        let removed = self.sessions.lock().unwrap().remove(&pkt.conn_id);
        if let Some(session) = removed {
            session.metrics.finalize(Instant::now());
            let addr = *session.addr.lock().unwrap();
            self.addr_index.lock().unwrap().remove(&addr);
            for members in self.rooms.lock().unwrap().values_mut() {
                members.remove(&pkt.conn_id);
            }
            debug!(conn_id = pkt.conn_id, "connection closed by peer FIN");
        }
    }

    fn transmit(&self, session: &Session, pkt: &Packet, addr: SocketAddr) {
        if session.loss.lock().unwrap().should_drop() {
            trace!(conn_id = session.conn_id, seq = pkt.seq, "dropped by loss injector");
            return;
        }
        let bytes = pkt.pack();
        if let Err(err) = self.socket.send_to(&bytes, addr) {
            warn!(error = %err, "substrate send error");
        }
    }

    /// Drives Go-Back-N retransmission for every session whose deadline has
    /// elapsed, and reaps connections past their liveness deadline: an
    /// unestablished session gets 8 retransmission intervals, a closing one
    /// gets 2, before it is dropped from the table.
    fn sweep_loop(self: Arc<Self>) {
        while self.running.load(Ordering::SeqCst) {
            thread::sleep(SWEEP_INTERVAL);
            let now = Instant::now();
            let sessions: Vec<Arc<Session>> =
                self.sessions.lock().unwrap().values().cloned().collect();

            for session in &sessions {
                self.retransmit_if_due(session, now);
            }
            self.reap_dead_sessions(now);
        }
    }

    fn retransmit_if_due(self: &Arc<Self>, session: &Arc<Session>, now: Instant) {
        let due = matches!(*session.retx_deadline.lock().unwrap(), Some(d) if now >= d);
        if !due {
            return;
        }

        let addr = *session.addr.lock().unwrap();
        let mut resent_bytes = 0usize;
        let mut resent_count = 0u64;
        {
            let sender = session.sender.lock().unwrap();
            for (_, (pkt, _)) in sender.unacked.iter() {
                self.transmit(session, pkt, addr);
                resent_bytes += pkt.payload.len();
                resent_count += 1;
            }
        }
        if resent_count > 0 {
            session.metrics.record_resent(resent_bytes, resent_count);
            *session.retx_deadline.lock().unwrap() = Some(now + self.config.t_retx);
        }
    }

    fn reap_dead_sessions(self: &Arc<Self>, now: Instant) {
        let handshake_deadline = self.config.t_retx * 8;
        let closing_deadline = self.config.t_retx * 2;

        let stale: Vec<u16> = {
            let sessions = self.sessions.lock().unwrap();
            sessions
                .values()
                .filter(|s| {
                    let idle = now.duration_since(*s.last_activity.lock().unwrap());
                    match *s.state.lock().unwrap() {
                        ConnectionState::SynRcvd => idle > handshake_deadline,
                        ConnectionState::Closing => idle > closing_deadline,
                        _ => false,
                    }
                })
                .map(|s| s.conn_id)
                .collect()
        };

        for conn_id in stale {
            if let Some(session) = self.sessions.lock().unwrap().remove(&conn_id) {
                let addr = *session.addr.lock().unwrap();
                self.addr_index.lock().unwrap().remove(&addr);
                debug!(conn_id, "reaped stale connection");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::state::Role;
    use std::sync::mpsc;
    use std::time::Duration as StdDuration;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    fn fast_config() -> Config {
        Config {
            t_retx: StdDuration::from_millis(50),
            t_connect: StdDuration::from_millis(500),
            ..Config::default()
        }
    }

    #[test]
    fn client_handshake_and_room_broadcast() {
        let (tx, rx) = mpsc::channel::<(u16, Vec<u8>)>();
        let server = Server::bind(
            loopback(),
            move |conn_id, payload| tx.send((conn_id, payload)).unwrap(),
            fast_config(),
        )
        .unwrap();
        let server_addr = server.local_addr().unwrap();

        let client = Connection::open(loopback(), Some(server_addr), |_| {}, Role::Initiator, fast_config())
            .unwrap();
        client.connect().unwrap();

        let conn_id = client.conn_id();
        server.join_room(conn_id, "lobby");
        assert_eq!(server.members_of("lobby"), vec![conn_id]);

        client.send(b"hello").unwrap();
        let (received_conn, payload) = rx.recv_timeout(StdDuration::from_secs(2)).unwrap();
        assert_eq!(received_conn, conn_id);
        assert_eq!(payload, b"hello");

        server.broadcast("lobby", b"welcome");
        thread::sleep(StdDuration::from_millis(100));
    }

    #[test]
    fn unknown_conn_id_is_dropped_not_errored() {
        let server = Server::bind(loopback(), |_, _| {}, fast_config()).unwrap();
        assert!(server.metrics(9999).is_none());
        assert!(matches!(
            server.send(9999, b"x"),
            Err(crate::error::Error::NotEstablished)
        ));
    }
}
