//! Connection endpoint: sender window, receiver sequencing, handshake and
//! teardown state machine, single retransmission timer, callback delivery.
//!
//! This is the single-endpoint model: the connection owns its substrate
//! socket exclusively and runs one background receiver thread.
//! The shared/server model lives in `server.rs` and reuses the same sender
//! and receiver bookkeeping, driven by one socket shared across peers.

use std::collections::BTreeMap;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, trace, warn};

use crate::codec::{Flags, Packet};
use crate::config::Config;
use crate::error::Error;
use crate::loss::LossInjector;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::state::{ConnectionState, Role};

const RECV_BUF_SIZE: usize = 2048;
const SOCKET_READ_TIMEOUT: Duration = Duration::from_millis(100);

type MessageCallback = dyn Fn(Vec<u8>) + Send + Sync + 'static;

#[derive(Debug)]
pub(crate) struct SenderState {
    pub(crate) send_base: u32,
    pub(crate) next_seq: u32,
    pub(crate) window_size: u16,
    pub(crate) peer_recv_win: u16,
    pub(crate) unacked: BTreeMap<u32, (Packet, Instant)>,
}

impl SenderState {
    pub(crate) fn effective_window(&self) -> u32 {
        (self.window_size as u32).min(self.peer_recv_win as u32)
    }

    pub(crate) fn new(window_size: u16, peer_recv_win: u16) -> Self {
        SenderState {
            send_base: 0,
            next_seq: 0,
            window_size,
            peer_recv_win,
            unacked: BTreeMap::new(),
        }
    }
}

#[derive(Debug)]
pub(crate) struct ReceiverState {
    pub(crate) expected_seq: u32,
    pub(crate) recv_win: u16,
}

/// A one-shot retransmission timer cancelled by bumping a generation
/// counter, rather than by polling a shared lock. Restarting is starting
/// a fresh one-shot with a new generation, matching Go-Back-N's "restart
/// the timer on every ACK that leaves packets outstanding" rule.
#[derive(Debug, Default)]
struct RetxTimer {
    generation: AtomicU64,
}

impl RetxTimer {
    fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    fn start(self: &Arc<Self>, duration: Duration, on_fire: impl FnOnce() + Send + 'static) {
        let target = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let timer = Arc::clone(self);
        thread::spawn(move || {
            thread::sleep(duration);
            if timer.generation.load(Ordering::SeqCst) == target {
                on_fire();
            }
        });
    }
}

/// A connection endpoint: one peer's half of a reliable transport session.
pub struct Connection {
    socket: Arc<UdpSocket>,
    role: Role,
    config: Config,
    conn_id: Mutex<u16>,
    remote_addr: Mutex<Option<SocketAddr>>,
    state: Mutex<ConnectionState>,
    established_flag: Mutex<bool>,
    established_cvar: Condvar,
    sender: Mutex<SenderState>,
    receiver: Mutex<ReceiverState>,
    timer: Arc<RetxTimer>,
    metrics: Metrics,
    loss: Mutex<LossInjector>,
    on_message: Box<MessageCallback>,
    running: AtomicBool,
}

impl Connection {
    /// Binds `local_addr`, spawns the background receiver, and constructs a
    /// connection ready for `connect()` (initiator) or to wait for an
    /// incoming SYN (responder). `remote_addr` is required for the
    /// initiator and optional for the responder, who learns it from the
    /// first SYN.
    pub fn open(
        local_addr: SocketAddr,
        remote_addr: Option<SocketAddr>,
        on_message: impl Fn(Vec<u8>) + Send + Sync + 'static,
        role: Role,
        config: Config,
    ) -> Result<Arc<Self>, Error> {
        let socket = UdpSocket::bind(local_addr)?;
        socket.set_read_timeout(Some(SOCKET_READ_TIMEOUT))?;
        let socket = Arc::new(socket);

        let conn = Arc::new(Connection {
            socket: Arc::clone(&socket),
            role,
            loss: Mutex::new(LossInjector::new(config.loss_profile)),
            conn_id: Mutex::new(0),
            remote_addr: Mutex::new(remote_addr),
            state: Mutex::new(ConnectionState::Closed),
            established_flag: Mutex::new(false),
            established_cvar: Condvar::new(),
            sender: Mutex::new(SenderState::new(config.window_size, config.window_size)),
            receiver: Mutex::new(ReceiverState {
                expected_seq: 0,
                recv_win: config.recv_win,
            }),
            timer: Arc::new(RetxTimer::default()),
            metrics: Metrics::new(),
            on_message: Box::new(on_message),
            running: AtomicBool::new(true),
            config,
        });

        let recv_conn = Arc::clone(&conn);
        thread::spawn(move || recv_conn.receiver_loop());

        Ok(conn)
    }

    /// Initiator-side three-way handshake. Blocks the caller until
    /// `ESTABLISHED` or `config.t_connect` elapses.
    pub fn connect(self: &Arc<Self>) -> Result<(), Error> {
        let remote = self
            .remote_addr
            .lock()
            .unwrap()
            .expect("connect() requires a remote address for the initiator role");

        let conn_id: u16 = rand::thread_rng().gen_range(1..=65535);
        *self.conn_id.lock().unwrap() = conn_id;
        *self.state.lock().unwrap() = ConnectionState::SynSent;

        let syn = Packet::new(Flags::SYN, conn_id, 0, 0, self.config.recv_win);
        self.transmit(&syn, remote);

        let deadline = Instant::now() + self.config.t_connect;
        let mut established = self.established_flag.lock().unwrap();
        while !*established {
            let now = Instant::now();
            if now >= deadline {
                *self.state.lock().unwrap() = ConnectionState::Closed;
                return Err(Error::HandshakeTimeout(self.config.t_connect));
            }
            let (guard, _timeout) = self
                .established_cvar
                .wait_timeout(established, deadline - now)
                .unwrap();
            established = guard;
        }
        debug!(conn_id, "initiator connect() returned established");
        Ok(())
    }

    /// Admits `payload` under the sliding window. Never blocks: the caller
    /// retries on `Error::WindowFull`.
    pub fn send(self: &Arc<Self>, payload: &[u8]) -> Result<u32, Error> {
        if !self.state.lock().unwrap().is_established() {
            return Err(Error::NotEstablished);
        }

        let mut sender = self.sender.lock().unwrap();
        if sender.next_seq.wrapping_sub(sender.send_base) >= sender.effective_window() {
            return Err(Error::WindowFull);
        }

        let seq = sender.next_seq;
        let conn_id = *self.conn_id.lock().unwrap();
        let recv_win = self.receiver.lock().unwrap().recv_win;
        let remote = self
            .remote_addr
            .lock()
            .unwrap()
            .expect("established connection always has a remote address");

        let pkt = Packet::new(Flags::empty(), conn_id, seq, 0, recv_win).with_payload(payload.to_vec());
        let now = Instant::now();
        self.transmit(&pkt, remote);
        self.metrics.record_sent(payload.len(), now);

        let was_idle = sender.send_base == sender.next_seq;
        sender.unacked.insert(seq, (pkt, now));
        sender.next_seq += 1;
        drop(sender);

        if was_idle {
            self.arm_timer();
        }

        Ok(seq)
    }

    /// Best-effort graceful teardown: emits FIN if established, cancels the
    /// timer, and stops the receiver loop. The FIN may be lost; the peer
    /// reaps the connection on its own liveness policy.
    pub fn close(self: &Arc<Self>) {
        let mut state = self.state.lock().unwrap();
        if *state == ConnectionState::Established {
            let conn_id = *self.conn_id.lock().unwrap();
            let next_seq = self.sender.lock().unwrap().next_seq;
            if let Some(remote) = *self.remote_addr.lock().unwrap() {
                let fin = Packet::new(Flags::FIN, conn_id, next_seq, 0, 0);
                self.transmit(&fin, remote);
            }
            *state = ConnectionState::Closing;
        }
        drop(state);

        self.timer.cancel();
        self.metrics.finalize(Instant::now());
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn conn_id(&self) -> u16 {
        *self.conn_id.lock().unwrap()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    fn arm_timer(self: &Arc<Self>) {
        let conn = Arc::clone(self);
        self.timer.start(self.config.t_retx, move || conn.on_timer_fire());
    }

    fn on_timer_fire(self: &Arc<Self>) {
        let remote = match *self.remote_addr.lock().unwrap() {
            Some(addr) => addr,
            None => return,
        };

        let mut resent_bytes = 0usize;
        let mut resent_count = 0u64;
        {
            let sender = self.sender.lock().unwrap();
            if sender.send_base == sender.next_seq {
                return;
            }
            for (_, (pkt, _)) in sender.unacked.iter() {
                self.transmit(pkt, remote);
                resent_bytes += pkt.payload.len();
                resent_count += 1;
            }
        }
        self.metrics.record_resent(resent_bytes, resent_count);
        debug!(
            conn_id = self.conn_id(),
            resent = resent_count,
            "retransmission timer fired"
        );
        self.arm_timer();
    }

    fn receiver_loop(self: Arc<Self>) {
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
                    self.on_packet(pkt, addr);
                }
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
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

    fn on_packet(self: &Arc<Self>, pkt: Packet, addr: SocketAddr) {
        if pkt.flags.contains(Flags::SYN) {
            self.handle_syn(&pkt, addr);
            return;
        }
        if pkt.flags.contains(Flags::FIN) {
            self.handle_fin();
            return;
        }

        let state = self.state();

        if pkt.flags.contains(Flags::ACK) && !pkt.is_data() && state == ConnectionState::SynRcvd {
            self.finalize_responder_handshake(&pkt);
            return;
        }

        if pkt.is_data() && state != ConnectionState::Established {
            return;
        }

        if pkt.is_data() {
            self.handle_data(&pkt, addr);
        }

        if pkt.flags.contains(Flags::ACK) {
            self.handle_ack(&pkt);
        }
    }

    fn handle_syn(self: &Arc<Self>, pkt: &Packet, addr: SocketAddr) {
        if pkt.flags.contains(Flags::ACK) {
            // Initiator receiving the responder's SYN|ACK.
            if *self.state.lock().unwrap() != ConnectionState::SynSent {
                return;
            }
            if pkt.conn_id != *self.conn_id.lock().unwrap() {
                return;
            }
            self.sender.lock().unwrap().peer_recv_win = pkt.recv_win;

            let ack = Packet::new(Flags::ACK, pkt.conn_id, 1, pkt.seq + 1, self.config.recv_win);
            self.transmit(&ack, addr);

            *self.state.lock().unwrap() = ConnectionState::Established;
            *self.established_flag.lock().unwrap() = true;
            self.established_cvar.notify_all();
            debug!(conn_id = pkt.conn_id, "handshake established (initiator)");
            return;
        }

        // Responder receiving a SYN. A duplicate SYN for a known conn_id is
        // idempotent: re-send SYN|ACK without changing state. Each lock
        // below is taken and released independently (never nested) so this
        // can never invert the lock order used by `send`/`close`.
        let is_new = {
            let mut conn_id_guard = self.conn_id.lock().unwrap();
            if *conn_id_guard == 0 {
                *conn_id_guard = pkt.conn_id;
                true
            } else if *conn_id_guard != pkt.conn_id {
                return;
            } else {
                false
            }
        };
        if is_new {
            *self.remote_addr.lock().unwrap() = Some(addr);
            self.sender.lock().unwrap().peer_recv_win = pkt.recv_win;
            *self.state.lock().unwrap() = ConnectionState::SynRcvd;
        }

        let syn_ack = Packet::new(
            Flags::SYN | Flags::ACK,
            pkt.conn_id,
            0,
            pkt.seq + 1,
            self.config.recv_win,
        );
        self.transmit(&syn_ack, addr);
    }

    fn finalize_responder_handshake(self: &Arc<Self>, pkt: &Packet) {
        if pkt.conn_id != *self.conn_id.lock().unwrap() {
            return;
        }
        self.sender.lock().unwrap().peer_recv_win = pkt.recv_win;
        *self.state.lock().unwrap() = ConnectionState::Established;
        debug!(conn_id = pkt.conn_id, "handshake established (responder)");
    }

    fn handle_data(self: &Arc<Self>, pkt: &Packet, addr: SocketAddr) {
        let (ack_value, recv_win, delivered) = {
            let mut receiver = self.receiver.lock().unwrap();
            let delivered = if pkt.seq == receiver.expected_seq {
                receiver.expected_seq += 1;
                true
            } else {
                if pkt.seq > receiver.expected_seq {
                    self.metrics.record_ooo();
                }
                false
            };
            (receiver.expected_seq, receiver.recv_win, delivered)
        };

        if delivered {
            (self.on_message)(pkt.payload.clone());
            self.metrics.record_delivered(pkt.payload.len(), Instant::now());
        }

        let conn_id = *self.conn_id.lock().unwrap();
        let ack_pkt = Packet::new(Flags::ACK, conn_id, 0, ack_value, recv_win);
        self.transmit(&ack_pkt, addr);
    }

    fn handle_ack(self: &Arc<Self>, pkt: &Packet) {
        let now = Instant::now();
        let restart_needed;
        {
            let mut sender = self.sender.lock().unwrap();
            if pkt.ack > sender.send_base {
                let acked_seqs: Vec<u32> = sender
                    .unacked
                    .range(sender.send_base..pkt.ack)
                    .map(|(seq, _)| *seq)
                    .collect();
                for seq in acked_seqs {
                    if let Some((_, sent_at)) = sender.unacked.remove(&seq) {
                        self.metrics.record_rtt_sample(now.duration_since(sent_at));
                    }
                }
                sender.send_base = pkt.ack;
                sender.peer_recv_win = pkt.recv_win;
                restart_needed = sender.send_base != sender.next_seq;
                if !restart_needed {
                    self.timer.cancel();
                }
            } else {
                sender.peer_recv_win = pkt.recv_win;
                self.metrics.record_duplicate_ack();
                restart_needed = false;
            }
        }
        if restart_needed {
            self.arm_timer();
        }
    }

    fn handle_fin(self: &Arc<Self>) {
        self.timer.cancel();
        *self.state.lock().unwrap() = ConnectionState::Closed;
        self.metrics.finalize(Instant::now());
        self.running.store(false, Ordering::SeqCst);
        debug!("peer FIN received; connection closed");
    }

    fn transmit(&self, pkt: &Packet, remote: SocketAddr) {
        if self.loss.lock().unwrap().should_drop() {
            trace!(seq = pkt.seq, flags = ?pkt.flags, "dropped by loss injector");
            return;
        }
        let bytes = pkt.pack();
        if let Err(err) = self.socket.send_to(&bytes, remote) {
            warn!(error = %err, "substrate send error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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

    fn spawn_pair(
        config: Config,
    ) -> (Arc<Connection>, Arc<Connection>, mpsc::Receiver<Vec<u8>>) {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let (tx, rx) = mpsc::channel();
        let responder = Connection::open(loopback(), None, move |msg| tx.send(msg).unwrap(), Role::Responder, config.clone()).unwrap();
        let responder_addr = responder.socket.local_addr().unwrap();
        let initiator = Connection::open(loopback(), Some(responder_addr), |_| {}, Role::Initiator, config).unwrap();
        (initiator, responder, rx)
    }

    #[test]
    fn clean_handshake_establishes_both_sides() {
        let (initiator, responder, _rx) = spawn_pair(fast_config());
        initiator.connect().unwrap();

        // Give the responder a moment to observe the final ACK.
        thread::sleep(StdDuration::from_millis(50));

        assert_eq!(initiator.state(), ConnectionState::Established);
        assert_eq!(responder.state(), ConnectionState::Established);
        assert_eq!(initiator.conn_id(), responder.conn_id());
    }

    #[test]
    fn in_order_delivery_with_no_loss() {
        let (initiator, _responder, rx) = spawn_pair(fast_config());
        initiator.connect().unwrap();

        for i in 0..10u8 {
            loop {
                match initiator.send(&[i]) {
                    Ok(_) => break,
                    Err(Error::WindowFull) => thread::sleep(StdDuration::from_millis(5)),
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }
        }

        let mut received = Vec::new();
        for _ in 0..10 {
            received.push(rx.recv_timeout(StdDuration::from_secs(2)).unwrap()[0]);
        }
        assert_eq!(received, (0..10u8).collect::<Vec<_>>());

        let snap = initiator.metrics();
        assert_eq!(snap.ooo_packets, 0);
    }

    #[test]
    fn send_before_established_is_rejected() {
        let (initiator, _responder, _rx) = spawn_pair(fast_config());
        assert!(matches!(initiator.send(b"x"), Err(Error::NotEstablished)));
    }

    #[test]
    fn handshake_times_out_against_dead_address() {
        let config = Config {
            t_connect: StdDuration::from_millis(100),
            ..fast_config()
        };
        let dead: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let initiator = Connection::open(loopback(), Some(dead), |_| {}, Role::Initiator, config).unwrap();
        let err = initiator.connect().unwrap_err();
        assert!(matches!(err, Error::HandshakeTimeout(_)));
        assert_eq!(initiator.state(), ConnectionState::Closed);
    }

    #[test]
    fn graceful_close_sends_fin_and_finalizes_metrics() {
        let (initiator, responder, _rx) = spawn_pair(fast_config());
        initiator.connect().unwrap();
        initiator.send(b"bye").unwrap();
        thread::sleep(StdDuration::from_millis(50));
        initiator.close();
        thread::sleep(StdDuration::from_millis(50));

        assert_eq!(responder.state(), ConnectionState::Closed);
        let snap = initiator.metrics();
        assert!(snap.duration.is_some());
    }
}
