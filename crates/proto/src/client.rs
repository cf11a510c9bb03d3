//! Client endpoint: handshake, windowed fragment transmission, and the
//! background receive path that absorbs broadcasts so outbound sends never
//! block on unsolicited traffic.

use std::io::{self, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::channel::{ChannelCondition, ChannelConfig};
use crate::error::{ProtoError, Result};
use crate::fragment::fragment_message;
use crate::handshake::{self, ConnectionParams, HandshakeState};
use crate::packet::{Packet, PacketKind};
use crate::transport;
use crate::window::SendWindow;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const RECEIVE_POLL: Duration = Duration::from_millis(250);
const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(3);
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Traffic the receive thread hands back to the sending side.
#[derive(Debug)]
enum Response {
    Ack(u16),
    Nack(u16),
    List(Vec<String>),
}

pub struct ChatClient {
    server_addr: String,
    server_port: u16,
    requested: ConnectionParams,
    params: ConnectionParams,
    state: HandshakeState,
    session_id: Option<String>,
    condition: ChannelCondition,
    ack_timeout: Duration,
    stream: Option<TcpStream>,
    responses: Option<Receiver<Response>>,
    broadcasts: Arc<Mutex<Vec<String>>>,
    reader: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

impl ChatClient {
    pub fn new(server_addr: impl Into<String>, server_port: u16, params: ConnectionParams) -> Self {
        Self {
            server_addr: server_addr.into(),
            server_port,
            requested: params,
            params,
            state: HandshakeState::Init,
            session_id: None,
            condition: ChannelCondition::default(),
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            stream: None,
            responses: None,
            broadcasts: Arc::new(Mutex::new(Vec::new())),
            reader: None,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == HandshakeState::Established
    }

    /// Parameters granted by the server (equal to the requested ones until
    /// the handshake completes).
    pub fn params(&self) -> ConnectionParams {
        self.params
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// The channel condition most recently pushed to the server.
    pub fn condition(&self) -> ChannelCondition {
        self.condition
    }

    pub fn set_ack_timeout(&mut self, timeout: Duration) {
        self.ack_timeout = timeout;
    }

    /// Broadcast messages received so far, draining the inbox.
    pub fn take_broadcasts(&self) -> Vec<String> {
        std::mem::take(&mut *self.broadcasts.lock().unwrap())
    }

    /// Run the three-way handshake and start the background receive path.
    pub fn connect(&mut self) -> Result<()> {
        let mut stream = TcpStream::connect((self.server_addr.as_str(), self.server_port))?;
        stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;

        let outcome = match self.run_handshake(&mut stream) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.state = HandshakeState::Failed;
                return Err(e);
            }
        };
        self.params = outcome.params;
        self.session_id = Some(outcome.session_id);

        stream.set_read_timeout(Some(RECEIVE_POLL))?;
        let (tx, rx) = mpsc::channel();
        self.stop.store(false, Ordering::SeqCst);
        let reader_stream = stream.try_clone()?;
        let stop = Arc::clone(&self.stop);
        let broadcasts = Arc::clone(&self.broadcasts);
        self.reader = Some(std::thread::spawn(move || {
            receive_loop(reader_stream, tx, broadcasts, stop);
        }));
        self.stream = Some(stream);
        self.responses = Some(rx);

        log::info!(
            "connected to {}:{} (session {}, protocol {}, fragment size {}, window {})",
            self.server_addr,
            self.server_port,
            self.session_id.as_deref().unwrap_or("?"),
            self.params.protocol,
            self.params.max_fragment_size,
            self.params.window_size
        );
        Ok(())
    }

    /// Walk SYN_SENT and SYN_ACK_RECEIVED to ESTABLISHED; the caller marks
    /// FAILED on any error.
    fn run_handshake(&mut self, stream: &mut TcpStream) -> Result<handshake::ClientHandshake> {
        handshake::client_send_syn(stream, self.requested)?;
        self.state = HandshakeState::SynSent;

        let syn_ack = handshake::client_await_syn_ack(stream)?;
        self.state = HandshakeState::SynAckReceived;

        let outcome = handshake::client_confirm(stream, syn_ack)?;
        self.state = HandshakeState::Established;
        Ok(outcome)
    }

    /// Fragment `message` and deliver it under the negotiated discipline.
    ///
    /// One fragment is outstanding at a time: each is sent and then awaited
    /// (ACK advances, NACK triggers retransmission from the window buffer)
    /// before the next goes out.
    pub fn send_message(&mut self, message: &str) -> Result<()> {
        self.ensure_established()?;
        self.drain_stale_responses();

        let fragments = fragment_message(message.as_bytes(), self.params.max_fragment_size);
        let total = fragments.len();
        log::debug!(
            "message split into {total} fragment(s) of at most {} bytes",
            self.params.max_fragment_size
        );

        let mut window = SendWindow::new(self.params.protocol, self.params.window_size);
        for (index, fragment) in fragments.into_iter().enumerate() {
            let sequence = index as u16;
            let last_fragment = index + 1 == total;
            let encoded = Packet::data(sequence, last_fragment, fragment).encode();

            log::debug!("sending fragment {}/{total} seq={sequence}", index + 1);
            self.write_bytes(&encoded)?;
            window.record_sent(sequence, encoded);
            self.await_fragment_ack(&mut window, sequence)?;
        }
        log::debug!("message delivered in {total} fragment(s)");
        Ok(())
    }

    pub fn set_nickname(&mut self, nickname: &str) -> Result<()> {
        self.ensure_established()?;
        self.drain_stale_responses();
        self.write_packet(&Packet::control(
            PacketKind::SetNick,
            nickname.as_bytes().to_vec(),
        ))?;
        self.await_control_ack()
    }

    pub fn list_connected(&mut self) -> Result<Vec<String>> {
        self.ensure_established()?;
        self.drain_stale_responses();
        self.write_packet(&Packet::control(PacketKind::ListRequest, Vec::new()))?;

        let deadline = Instant::now() + self.ack_timeout;
        loop {
            match self.recv_response(deadline)? {
                Response::List(names) => return Ok(names),
                other => log::debug!("ignoring {other:?} while waiting for the listing"),
            }
        }
    }

    /// Push a new simulated-channel condition to the server and remember it
    /// locally for status display.
    pub fn set_channel_conditions(&mut self, condition: ChannelCondition) -> Result<()> {
        self.ensure_established()?;
        let clamped = ChannelCondition::clamped(
            condition.loss_probability,
            condition.corruption_probability,
            condition.delay_probability,
            condition.delay_seconds,
        );
        let config = ChannelConfig::from(clamped);
        self.write_packet(&Packet::control(
            PacketKind::ChannelConfig,
            serde_json::to_vec(&config)?,
        ))?;
        self.condition = clamped;
        log::info!(
            "channel conditions sent: loss={} corruption={} delay={} ({:.2}s)",
            clamped.loss_probability,
            clamped.corruption_probability,
            clamped.delay_probability,
            clamped.delay_seconds
        );
        Ok(())
    }

    /// Graceful teardown: announce the disconnect, wait briefly for the
    /// server's ACK, then close the socket and stop the receive path.
    pub fn disconnect(&mut self) -> Result<()> {
        if self.stream.is_none() {
            return Ok(());
        }
        self.drain_stale_responses();
        if self
            .write_packet(&Packet::control(PacketKind::Disconnect, "Disconnect"))
            .is_ok()
        {
            let deadline = Instant::now() + DISCONNECT_TIMEOUT;
            loop {
                match self.recv_response(deadline) {
                    Ok(Response::Ack(_)) => break,
                    Ok(other) => log::debug!("ignoring {other:?} during disconnect"),
                    Err(_) => {
                        log::debug!("no disconnect ACK from the server");
                        break;
                    }
                }
            }
        }
        self.teardown();
        log::info!("disconnected from {}:{}", self.server_addr, self.server_port);
        Ok(())
    }

    fn await_fragment_ack(&mut self, window: &mut SendWindow, sequence: u16) -> Result<()> {
        let mut deadline = Instant::now() + self.ack_timeout;
        loop {
            if window.is_acked(sequence) {
                log::debug!("seq {sequence} acknowledged");
                return Ok(());
            }
            match self.recv_response(deadline)? {
                Response::Ack(seq) => window.on_ack(seq),
                Response::Nack(seq) => {
                    log::debug!("NACK for seq {seq}");
                    for (retransmit_seq, bytes) in window.on_nack(seq) {
                        log::debug!("resending packet seq={retransmit_seq}");
                        self.write_bytes(&bytes)?;
                    }
                    // Every retransmission gets a fresh wait bound.
                    deadline = Instant::now() + self.ack_timeout;
                }
                // Nobody is waiting for this listing anymore.
                Response::List(_) => {}
            }
        }
    }

    fn await_control_ack(&mut self) -> Result<()> {
        let deadline = Instant::now() + self.ack_timeout;
        loop {
            match self.recv_response(deadline)? {
                Response::Ack(_) => return Ok(()),
                other => log::debug!("ignoring {other:?} while waiting for an ACK"),
            }
        }
    }

    /// One bounded wait on the receive path's channel.
    fn recv_response(&self, deadline: Instant) -> Result<Response> {
        let responses = self.responses.as_ref().ok_or_else(not_connected)?;
        let now = Instant::now();
        if now >= deadline {
            return Err(ProtoError::TimedOut);
        }
        match responses.recv_timeout(deadline - now) {
            Ok(response) => Ok(response),
            Err(RecvTimeoutError::Timeout) => Err(ProtoError::TimedOut),
            Err(RecvTimeoutError::Disconnected) => Err(ProtoError::PeerClosed),
        }
    }

    /// Discard responses left over from a previous exchange so a stale ACK
    /// can never satisfy a new wait.
    fn drain_stale_responses(&self) {
        if let Some(responses) = self.responses.as_ref() {
            while responses.try_recv().is_ok() {}
        }
    }

    fn ensure_established(&self) -> Result<()> {
        if self.state != HandshakeState::Established {
            return Err(not_connected());
        }
        Ok(())
    }

    fn write_packet(&mut self, packet: &Packet) -> Result<()> {
        self.write_bytes(&packet.encode())
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or_else(not_connected)?;
        stream.write_all(bytes)?;
        Ok(())
    }

    fn teardown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.responses = None;
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        self.state = HandshakeState::Init;
        self.session_id = None;
    }
}

fn not_connected() -> ProtoError {
    ProtoError::Connection(io::Error::new(
        io::ErrorKind::NotConnected,
        "not connected to a server",
    ))
}

/// Background receive path: absorbs everything the server pushes, routing
/// ACK/NACK and listings to the waiting sender and collecting broadcasts.
fn receive_loop(
    mut stream: TcpStream,
    responses: Sender<Response>,
    broadcasts: Arc<Mutex<Vec<String>>>,
    stop: Arc<AtomicBool>,
) {
    while !stop.load(Ordering::SeqCst) {
        let packet = match transport::read_verified(&mut stream) {
            Ok(packet) => packet,
            Err(ProtoError::TimedOut) => continue,
            Err(ProtoError::Malformed(e)) => {
                log::debug!("dropping malformed packet: {e}");
                continue;
            }
            Err(e) => {
                log::debug!("receive path closed: {e}");
                break;
            }
        };

        let forwarded = match packet.kind {
            PacketKind::Ack => responses.send(Response::Ack(packet.sequence)),
            PacketKind::Nack => responses.send(Response::Nack(packet.sequence)),
            PacketKind::ListResponse => {
                match serde_json::from_slice::<Vec<String>>(&packet.payload) {
                    Ok(names) => responses.send(Response::List(names)),
                    Err(e) => {
                        log::warn!("invalid LIST_RESPONSE payload: {e}");
                        Ok(())
                    }
                }
            }
            PacketKind::Data => {
                let text = packet.payload_text().into_owned();
                log::info!("{text}");
                broadcasts.lock().unwrap().push(text);
                Ok(())
            }
            other => {
                log::debug!("ignoring unsolicited {other} packet");
                Ok(())
            }
        };
        if forwarded.is_err() {
            // Client side dropped the receiver; nothing left to serve.
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operations_require_an_established_connection() {
        let mut client = ChatClient::new("127.0.0.1", 1, ConnectionParams::default());
        assert!(!client.is_connected());
        assert!(client.send_message("hi").is_err());
        assert!(client.set_nickname("nick").is_err());
        assert!(client.list_connected().is_err());
        // Disconnecting while never connected is a no-op.
        assert!(client.disconnect().is_ok());
    }

    #[test]
    fn requested_params_are_reported_until_negotiated() {
        let params = ConnectionParams {
            max_fragment_size: 10,
            ..ConnectionParams::default()
        };
        let client = ChatClient::new("127.0.0.1", 1, params);
        assert_eq!(client.params().max_fragment_size, 10);
        assert_eq!(client.state(), HandshakeState::Init);
        assert!(client.session_id().is_none());
    }
}
