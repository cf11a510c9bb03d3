//! A reliable-message protocol over TCP: framed packets with integrity
//! checksums, a three-way parameter-negotiating handshake, Go-Back-N and
//! Selective Repeat retransmission, fragmentation/reassembly, an injectable
//! channel simulator, and a session registry powering a broadcast chat
//! server.

pub mod channel;
pub mod client;
pub mod error;
pub mod fragment;
pub mod handshake;
pub mod packet;
pub mod registry;
pub mod server;
pub mod transport;
pub mod window;

pub use channel::{ChannelCondition, ChannelConfig};
pub use client::ChatClient;
pub use error::{ProtoError, Result};
pub use handshake::{
    ConnectionParams, HandshakeState, Protocol, DEFAULT_MAX_FRAGMENT_SIZE, DEFAULT_WINDOW_SIZE,
};
pub use packet::{
    checksum, Header, MalformedPacket, Packet, PacketKind, DEFAULT_PORT, HEADER_LEN,
    MAX_PAYLOAD_SIZE,
};
pub use registry::{Session, SessionRegistry};
pub use server::{ChatServer, ServerConfig, MAX_RETRIES};
pub use window::SendWindow;
