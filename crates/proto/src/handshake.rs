//! Three-way SYN / SYN-ACK / ACK exchange negotiating the transfer
//! parameters and issuing a session id.
//!
//! Both sides run strictly sequentially: no data flows until the final ACK
//! has been processed. Any unexpected packet kind or decode failure during
//! the exchange is a fatal protocol violation and no session survives it.

use std::net::TcpStream;

use serde::{Deserialize, Serialize};

use crate::error::{ProtoError, Result};
use crate::packet::{Packet, PacketKind};
use crate::transport;

pub const DEFAULT_MAX_FRAGMENT_SIZE: usize = 3;
pub const DEFAULT_WINDOW_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Gbn,
    Sr,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Gbn => "gbn",
            Protocol::Sr => "sr",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "gbn" => Ok(Protocol::Gbn),
            "sr" => Ok(Protocol::Sr),
            other => Err(format!("unknown protocol '{other}' (expected gbn or sr)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParams {
    pub protocol: Protocol,
    pub max_fragment_size: usize,
    pub window_size: usize,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            protocol: Protocol::Gbn,
            max_fragment_size: DEFAULT_MAX_FRAGMENT_SIZE,
            window_size: DEFAULT_WINDOW_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Init,
    SynSent,
    AwaitSyn,
    SynAckReceived,
    Established,
    Failed,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SynAck {
    pub status: String,
    pub protocol: Protocol,
    pub max_fragment_size: usize,
    pub window_size: usize,
    pub session_id: String,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FinalAck {
    pub session_id: String,
    pub message: String,
}

/// Derive the 8-character session id from the peer address and the host it
/// connected to.
pub fn session_id(client_addr: &str, host: &str) -> String {
    let digest = md5::compute(format!("{client_addr}{host}"));
    format!("{digest:x}")[..8].to_string()
}

/// Outcome of the client side of the exchange: the parameters the server
/// actually granted, plus the issued session id.
#[derive(Debug, Clone)]
pub struct ClientHandshake {
    pub params: ConnectionParams,
    pub session_id: String,
}

/// Client side, step one: send SYN carrying the requested parameters.
pub fn client_send_syn(stream: &mut TcpStream, requested: ConnectionParams) -> Result<()> {
    let syn = Packet::control(PacketKind::Syn, serde_json::to_vec(&requested)?);
    transport::write_packet(stream, &syn)?;
    log::debug!(
        "sent SYN: protocol={} max_fragment_size={} window_size={}",
        requested.protocol,
        requested.max_fragment_size,
        requested.window_size
    );
    Ok(())
}

/// Client side, step two: block for the SYN-ACK and validate its status.
pub fn client_await_syn_ack(stream: &mut TcpStream) -> Result<SynAck> {
    let response = transport::read_verified(stream).map_err(fatal_in_handshake)?;
    if response.kind != PacketKind::Ack {
        return Err(ProtoError::ProtocolViolation(format!(
            "expected SYN-ACK, got {}",
            response.kind
        )));
    }

    let syn_ack: SynAck = serde_json::from_slice(&response.payload)
        .map_err(|e| ProtoError::ProtocolViolation(format!("invalid SYN-ACK payload: {e}")))?;
    if syn_ack.status != "ok" {
        return Err(ProtoError::HandshakeRejected(syn_ack.message));
    }
    Ok(syn_ack)
}

/// Client side, step three: adopt the negotiated parameters and confirm
/// with the final ACK bearing the issued session id.
pub fn client_confirm(stream: &mut TcpStream, syn_ack: SynAck) -> Result<ClientHandshake> {
    let params = ConnectionParams {
        protocol: syn_ack.protocol,
        max_fragment_size: syn_ack.max_fragment_size,
        window_size: syn_ack.window_size,
    };
    let final_ack = FinalAck {
        session_id: syn_ack.session_id.clone(),
        message: "Connection established".to_string(),
    };
    let ack = Packet::control(PacketKind::HandshakeAck, serde_json::to_vec(&final_ack)?);
    transport::write_packet(stream, &ack)?;

    log::debug!(
        "handshake complete: session={} protocol={} max_fragment_size={}",
        syn_ack.session_id,
        params.protocol,
        params.max_fragment_size
    );
    Ok(ClientHandshake {
        params,
        session_id: syn_ack.session_id,
    })
}

/// Result of the server's first handshake step.
#[derive(Debug, Clone)]
pub struct ServerHello {
    pub params: ConnectionParams,
    pub session_id: String,
}

/// Server side, step one: expect SYN, negotiate, reply SYN-ACK.
///
/// The server only ever clamps `max_fragment_size` down to its own ceiling;
/// protocol and window size pass through as requested.
pub fn server_expect_syn(
    stream: &mut TcpStream,
    client_addr: &str,
    host: &str,
    max_fragment_ceiling: usize,
) -> Result<ServerHello> {
    let packet = transport::read_verified(stream).map_err(fatal_in_handshake)?;
    if packet.kind != PacketKind::Syn {
        return Err(ProtoError::ProtocolViolation(format!(
            "expected SYN, got {}",
            packet.kind
        )));
    }

    let requested: ConnectionParams = serde_json::from_slice(&packet.payload)
        .map_err(|e| ProtoError::ProtocolViolation(format!("invalid SYN payload: {e}")))?;
    if requested.max_fragment_size == 0 || requested.window_size == 0 {
        return Err(ProtoError::ProtocolViolation(
            "fragment and window sizes must be positive".to_string(),
        ));
    }
    let params = ConnectionParams {
        max_fragment_size: requested.max_fragment_size.min(max_fragment_ceiling),
        ..requested
    };
    let id = session_id(client_addr, host);
    log::debug!(
        "SYN from {client_addr}: requested fragment size {}, granting {}",
        requested.max_fragment_size,
        params.max_fragment_size
    );

    let syn_ack = SynAck {
        status: "ok".to_string(),
        protocol: params.protocol,
        max_fragment_size: params.max_fragment_size,
        window_size: params.window_size,
        session_id: id.clone(),
        message: "SYN-ACK: Parameters accepted".to_string(),
    };
    let reply = Packet::control(PacketKind::Ack, serde_json::to_vec(&syn_ack)?);
    transport::write_packet(stream, &reply)?;

    Ok(ServerHello {
        params,
        session_id: id,
    })
}

/// Server side, step two: expect the final ACK referencing the issued id.
pub fn server_expect_ack(stream: &mut TcpStream, session_id: &str) -> Result<()> {
    let packet = transport::read_verified(stream).map_err(fatal_in_handshake)?;
    if packet.kind != PacketKind::HandshakeAck {
        return Err(ProtoError::ProtocolViolation(format!(
            "expected HANDSHAKE_ACK, got {}",
            packet.kind
        )));
    }

    let ack: FinalAck = serde_json::from_slice(&packet.payload)
        .map_err(|e| ProtoError::ProtocolViolation(format!("invalid handshake ACK payload: {e}")))?;
    if ack.session_id != session_id {
        return Err(ProtoError::ProtocolViolation(format!(
            "handshake ACK references session {} instead of {session_id}",
            ack.session_id
        )));
    }
    Ok(())
}

/// During the handshake a malformed packet is as fatal as a broken stream.
fn fatal_in_handshake(err: ProtoError) -> ProtoError {
    match err {
        ProtoError::Malformed(inner) => {
            ProtoError::ProtocolViolation(format!("undecodable handshake packet: {inner}"))
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_is_eight_chars_and_deterministic() {
        let a = session_id("127.0.0.1:40001", "127.0.0.1:5000");
        let b = session_id("127.0.0.1:40001", "127.0.0.1:5000");
        let c = session_id("127.0.0.1:40002", "127.0.0.1:5000");
        assert_eq!(a.len(), 8);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[test]
    fn protocol_wire_names() {
        assert_eq!(serde_json::to_string(&Protocol::Gbn).unwrap(), r#""gbn""#);
        assert_eq!(serde_json::to_string(&Protocol::Sr).unwrap(), r#""sr""#);
        assert_eq!("sr".parse::<Protocol>().unwrap(), Protocol::Sr);
        assert!("tcp".parse::<Protocol>().is_err());
    }

    #[test]
    fn syn_payload_shape() {
        let params = ConnectionParams {
            protocol: Protocol::Sr,
            max_fragment_size: 10,
            window_size: 4,
        };
        let json = serde_json::to_value(params).unwrap();
        assert_eq!(json["protocol"], "sr");
        assert_eq!(json["max_fragment_size"], 10);
        assert_eq!(json["window_size"], 4);
    }

    #[test]
    fn syn_ack_roundtrips() {
        let syn_ack = SynAck {
            status: "ok".into(),
            protocol: Protocol::Gbn,
            max_fragment_size: 5,
            window_size: 4,
            session_id: "ab12cd34".into(),
            message: "SYN-ACK: Parameters accepted".into(),
        };
        let parsed: SynAck =
            serde_json::from_slice(&serde_json::to_vec(&syn_ack).unwrap()).unwrap();
        assert_eq!(parsed.status, "ok");
        assert_eq!(parsed.max_fragment_size, 5);
        assert_eq!(parsed.session_id, "ab12cd34");
    }
}
