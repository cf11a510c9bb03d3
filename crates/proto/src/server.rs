//! Accept loop, per-connection worker threads, and the receive side of the
//! protocol: channel simulation, checksum verification, ACK/NACK emission,
//! reassembly, and control-packet routing.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::channel::{ChannelCondition, ChannelConfig};
use crate::error::{ProtoError, Result};
use crate::fragment::Reassembly;
use crate::handshake::{self, DEFAULT_MAX_FRAGMENT_SIZE, HandshakeState};
use crate::packet::{Header, Packet, PacketKind};
use crate::registry::{Session, SessionRegistry};
use crate::transport;

pub const MAX_RETRIES: u32 = 5;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const RECEIVE_POLL: Duration = Duration::from_millis(500);
const ACCEPT_POLL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Ceiling applied to every client's requested fragment size.
    pub max_fragment_size: usize,
    /// Simulated loss/corruption failures tolerated per connection.
    pub max_retries: u32,
    /// Channel condition every new connection starts with.
    pub condition: ChannelCondition,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_fragment_size: DEFAULT_MAX_FRAGMENT_SIZE,
            max_retries: MAX_RETRIES,
            condition: ChannelCondition::default(),
        }
    }
}

pub struct ChatServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    running: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl ChatServer {
    pub fn bind(addr: &str, config: ServerConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            listener,
            local_addr,
            config,
            registry: Arc::new(SessionRegistry::new()),
            running: Arc::new(AtomicBool::new(true)),
            workers: Vec::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn running(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Accept connections until the stop flag clears, then join the workers.
    ///
    /// One connection's failure never reaches this loop; workers log and
    /// clean up after themselves.
    pub fn run(&mut self) {
        log::info!("server listening on {}", self.local_addr);
        while self.running.load(Ordering::SeqCst) {
            match self.listener.accept() {
                Ok((stream, peer)) => self.spawn_worker(stream, peer),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(ACCEPT_POLL);
                }
                Err(e) => {
                    log::error!("accept failed: {e}");
                    std::thread::sleep(ACCEPT_POLL);
                }
            }
        }
        self.join_workers();
        log::info!("server stopped");
    }

    /// Cooperative stop: clears the flag and waits for the workers, each of
    /// which notices within one receive-poll interval.
    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.join_workers();
    }

    fn join_workers(&mut self) {
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::error!("connection worker panicked");
            }
        }
    }

    fn spawn_worker(&mut self, stream: TcpStream, peer: SocketAddr) {
        let addr = peer.to_string();
        log::info!("new connection from {addr}");

        let host = self.local_addr.to_string();
        let config = self.config.clone();
        let registry = Arc::clone(&self.registry);
        let running = Arc::clone(&self.running);

        let handle = std::thread::spawn(move || {
            ConnectionHandler::new(stream, addr, host, config, registry, running).run();
        });
        self.workers.push(handle);
    }
}

/// Everything owned by exactly one connection's worker thread.
struct ConnectionHandler {
    stream: TcpStream,
    addr: String,
    host: String,
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    running: Arc<AtomicBool>,
    state: HandshakeState,
    condition: ChannelCondition,
    reassembly: Reassembly,
    attempts: u32,
    expected_seq: u16,
}

impl ConnectionHandler {
    fn new(
        stream: TcpStream,
        addr: String,
        host: String,
        config: ServerConfig,
        registry: Arc<SessionRegistry>,
        running: Arc<AtomicBool>,
    ) -> Self {
        let condition = config.condition;
        Self {
            stream,
            addr,
            host,
            config,
            registry,
            running,
            state: HandshakeState::Init,
            condition,
            reassembly: Reassembly::new(),
            attempts: 0,
            expected_seq: 0,
        }
    }

    fn run(&mut self) {
        if let Err(e) = self.establish() {
            log::warn!(
                "handshake with {} failed in state {:?}: {e}",
                self.addr,
                self.state
            );
            self.state = HandshakeState::Failed;
            // No partial session survives a failed handshake.
            self.registry.remove(&self.addr);
            return;
        }

        match self.receive_loop() {
            Ok(()) => log::info!("client {} disconnected", self.addr),
            Err(e) => log::warn!("connection with {} aborted: {e}", self.addr),
        }
        self.registry.remove(&self.addr);
    }

    fn establish(&mut self) -> Result<()> {
        self.stream.set_nonblocking(false)?;
        self.stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
        self.state = HandshakeState::AwaitSyn;

        let hello = handshake::server_expect_syn(
            &mut self.stream,
            &self.addr,
            &self.host,
            self.config.max_fragment_size,
        )?;
        let session = Session::new(
            hello.session_id.clone(),
            hello.params,
            self.stream.try_clone()?,
        );
        self.registry.insert(self.addr.clone(), session);

        handshake::server_expect_ack(&mut self.stream, &hello.session_id)?;
        self.registry.complete_handshake(&self.addr);
        self.state = HandshakeState::Established;
        log::info!(
            "handshake complete for {} (session {}, protocol {})",
            self.addr,
            hello.session_id,
            hello.params.protocol
        );
        Ok(())
    }

    fn receive_loop(&mut self) -> Result<()> {
        self.stream.set_read_timeout(Some(RECEIVE_POLL))?;

        loop {
            if !self.running.load(Ordering::SeqCst) {
                return Ok(());
            }
            if self.attempts > self.config.max_retries {
                return Err(ProtoError::RetryCeiling {
                    attempts: self.attempts,
                });
            }

            let (header, payload) = match transport::read_packet(&mut self.stream) {
                Ok(frame) => frame,
                Err(ProtoError::TimedOut) => continue,
                Err(ProtoError::Malformed(e)) => {
                    log::warn!("dropping malformed packet from {}: {e}", self.addr);
                    continue;
                }
                Err(e) => return Err(e),
            };

            match header.kind {
                // Routed strictly by the reserved type code, before any
                // payload inspection.
                PacketKind::ChannelConfig => self.handle_channel_config(&payload),
                PacketKind::SetNick => self.handle_set_nick(&payload)?,
                PacketKind::ListRequest => self.handle_list_request()?,
                PacketKind::Data | PacketKind::Disconnect => {
                    let Some(processed) = self.condition.apply(&payload, header.sequence) else {
                        log::info!(
                            "packet seq={} from {} lost in simulated channel",
                            header.sequence,
                            self.addr
                        );
                        self.reject(header.sequence)?;
                        continue;
                    };
                    if !header.verify(&processed) {
                        log::warn!(
                            "checksum mismatch for packet {} from {}",
                            header.sequence,
                            self.addr
                        );
                        self.reject(header.sequence)?;
                        continue;
                    }
                    if header.kind == PacketKind::Disconnect {
                        self.write(&Packet::control(PacketKind::Ack, "Disconnect ACK"))?;
                        return Ok(());
                    }
                    self.accept_data(&header, payload)?;
                }
                other => log::warn!("unexpected {other} packet from {}", self.addr),
            }
        }
    }

    /// A simulated loss or corruption: NACK the sequence and count the
    /// failure against the connection-wide ceiling.
    fn reject(&mut self, sequence: u16) -> Result<()> {
        self.attempts += 1;
        self.write(&Packet::nack(sequence))?;
        log::debug!(
            "sent NACK for seq {sequence} to {} (attempt {}/{})",
            self.addr,
            self.attempts,
            self.config.max_retries
        );
        Ok(())
    }

    fn accept_data(&mut self, header: &Header, payload: Vec<u8>) -> Result<()> {
        if header.sequence < self.expected_seq {
            // Retransmitted duplicate: re-ACK so the sender advances, but
            // never append twice.
            log::debug!(
                "duplicate fragment seq={} from {}, re-acknowledging",
                header.sequence,
                self.addr
            );
            self.write(&Packet::ack(header.sequence))?;
            self.attempts = 0;
            return Ok(());
        }

        log::info!(
            "fragment seq={} ({} bytes) from {}",
            header.sequence,
            payload.len(),
            self.addr
        );
        self.reassembly.push(payload);
        self.expected_seq = header.sequence + 1;
        self.registry.set_expected_seq(&self.addr, self.expected_seq);

        self.write(&Packet::ack(header.sequence))?;
        self.attempts = 0;

        if header.last_fragment {
            let message = self.reassembly.flush();
            match String::from_utf8(message) {
                Ok(text) => {
                    log::info!("reconstructed message from {}: {text}", self.addr);
                    let delivered = self.registry.broadcast(&self.addr, &text);
                    log::debug!("broadcast from {} reached {delivered} session(s)", self.addr);
                }
                Err(_) => {
                    log::info!("reconstructed binary message from {}, not rebroadcast", self.addr)
                }
            }
            // Sequence numbering restarts with the next message.
            self.expected_seq = 0;
            self.registry.set_expected_seq(&self.addr, 0);
        }
        Ok(())
    }

    fn handle_channel_config(&mut self, payload: &[u8]) {
        match serde_json::from_slice::<ChannelConfig>(payload) {
            Ok(config) => {
                self.condition = config.into();
                log::info!(
                    "channel conditions for {} updated: loss={} corruption={} delay={} ({:.2}s)",
                    self.addr,
                    self.condition.loss_probability,
                    self.condition.corruption_probability,
                    self.condition.delay_probability,
                    self.condition.delay_seconds
                );
            }
            Err(e) => log::warn!("invalid channel config from {}: {e}", self.addr),
        }
    }

    fn handle_set_nick(&mut self, payload: &[u8]) -> Result<()> {
        let nickname = String::from_utf8_lossy(payload).trim().to_string();
        self.registry.set_nickname(&self.addr, &nickname);
        log::info!("{} is now known as {nickname}", self.addr);
        let reply = format!("NICK OK: {nickname}");
        self.write(&Packet::control(PacketKind::Ack, reply))
    }

    fn handle_list_request(&mut self) -> Result<()> {
        let names = self.registry.list_connected();
        let reply = Packet::control(PacketKind::ListResponse, serde_json::to_vec(&names)?);
        self.write(&reply)
    }

    fn write(&mut self, packet: &Packet) -> Result<()> {
        transport::write_packet(&mut self.stream, packet)
    }
}
