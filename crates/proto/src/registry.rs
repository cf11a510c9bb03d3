//! Server-side table of active connections.
//!
//! The registry is the only state shared across connection-handling
//! threads; every read, write, and broadcast iteration happens under the
//! one mutex. Per-connection window and reassembly state never lives here.

use std::collections::HashMap;
use std::io::Write;
use std::net::TcpStream;
use std::sync::Mutex;

use crate::handshake::ConnectionParams;
use crate::packet::Packet;

#[derive(Debug)]
pub struct Session {
    pub session_id: String,
    pub params: ConnectionParams,
    pub handshake_complete: bool,
    pub nickname: Option<String>,
    pub expected_seq: u16,
    stream: TcpStream,
}

impl Session {
    pub fn new(session_id: String, params: ConnectionParams, stream: TcpStream) -> Self {
        Self {
            session_id,
            params,
            handshake_complete: false,
            nickname: None,
            expected_seq: 0,
            stream,
        }
    }

    /// Nickname when set, otherwise the peer address.
    pub fn display_name(&self, addr: &str) -> String {
        self.nickname.clone().unwrap_or_else(|| addr.to_string())
    }
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, addr: String, session: Session) {
        self.sessions.lock().unwrap().insert(addr, session);
    }

    pub fn complete_handshake(&self, addr: &str) -> bool {
        let mut sessions = self.sessions.lock().unwrap();
        match sessions.get_mut(addr) {
            Some(session) => {
                session.handshake_complete = true;
                true
            }
            None => false,
        }
    }

    pub fn set_nickname(&self, addr: &str, nickname: &str) {
        if let Some(session) = self.sessions.lock().unwrap().get_mut(addr) {
            session.nickname = Some(nickname.to_string());
        }
    }

    pub fn set_expected_seq(&self, addr: &str, expected_seq: u16) {
        if let Some(session) = self.sessions.lock().unwrap().get_mut(addr) {
            session.expected_seq = expected_seq;
        }
    }

    pub fn remove(&self, addr: &str) -> Option<Session> {
        self.sessions.lock().unwrap().remove(addr)
    }

    pub fn contains(&self, addr: &str) -> bool {
        self.sessions.lock().unwrap().contains_key(addr)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn session_id(&self, addr: &str) -> Option<String> {
        self.sessions
            .lock()
            .unwrap()
            .get(addr)
            .map(|session| session.session_id.clone())
    }

    /// Snapshot of display names for every completed session, sorted for a
    /// stable order.
    pub fn list_connected(&self) -> Vec<String> {
        let sessions = self.sessions.lock().unwrap();
        let mut names: Vec<String> = sessions
            .iter()
            .filter(|(_, session)| session.handshake_complete)
            .map(|(addr, session)| session.display_name(addr))
            .collect();
        names.sort();
        names
    }

    /// Push `message` to every other completed session as one fire-and-forget
    /// DATA packet, prefixed with the sender's display name.
    ///
    /// Broadcast bypasses windowing entirely. A failed write to one
    /// recipient is logged and skipped; the rest still get the message.
    /// Returns the number of sessions the message was delivered to.
    pub fn broadcast(&self, from_addr: &str, message: &str) -> usize {
        let sessions = self.sessions.lock().unwrap();
        let display = sessions
            .get(from_addr)
            .map(|session| session.display_name(from_addr))
            .unwrap_or_else(|| from_addr.to_string());

        let text = format!("[{display}] {message}");
        let packet = Packet::data(0, true, text.into_bytes()).encode();

        let mut delivered = 0;
        for (addr, session) in sessions.iter() {
            if addr == from_addr || !session.handshake_complete {
                continue;
            }
            match (&session.stream).write_all(&packet) {
                Ok(()) => delivered += 1,
                Err(e) => log::warn!("broadcast to {addr} failed: {e}"),
            }
        }
        delivered
    }
}
