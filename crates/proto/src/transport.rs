//! Blocking, timeout-bounded framing over a TCP stream.
//!
//! Reads pull exactly one header, validate it, then pull exactly the
//! declared payload. The read timeout installed on the stream bounds every
//! blocking receive; hitting it surfaces as [`ProtoError::TimedOut`] so
//! callers can poll a stop flag and retry.

use std::io::{Read, Write};
use std::net::TcpStream;

use crate::error::{ProtoError, Result};
use crate::packet::{Header, MalformedPacket, Packet, HEADER_LEN, MAX_PAYLOAD_SIZE};

pub fn write_packet(stream: &mut TcpStream, packet: &Packet) -> Result<()> {
    stream.write_all(&packet.encode())?;
    Ok(())
}

/// Read one framed packet: header, then payload.
///
/// The checksum is NOT verified here: the receiving side may first run the
/// payload through the channel simulator. Use [`Header::verify`] (or
/// [`Packet::decode`] on a raw buffer) for verification.
pub fn read_packet(stream: &mut TcpStream) -> Result<(Header, Vec<u8>)> {
    let mut head = [0u8; HEADER_LEN];
    read_exact(stream, &mut head)?;

    let header = Header::parse(&head)?;
    let declared = header.payload_length as usize;
    if declared > MAX_PAYLOAD_SIZE {
        return Err(MalformedPacket::PayloadTooLarge(declared).into());
    }

    let mut payload = vec![0u8; declared];
    read_exact(stream, &mut payload)?;
    Ok((header, payload))
}

/// Read one packet and fully verify its checksum.
pub fn read_verified(stream: &mut TcpStream) -> Result<Packet> {
    let (header, payload) = read_packet(stream)?;
    if !header.verify(&payload) {
        return Err(MalformedPacket::ChecksumFailed(header.sequence).into());
    }
    Ok(Packet {
        kind: header.kind,
        sequence: header.sequence,
        last_fragment: header.last_fragment,
        payload,
    })
}

fn read_exact(stream: &mut TcpStream, buf: &mut [u8]) -> Result<()> {
    match stream.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(ProtoError::PeerClosed),
        Err(e)
            if e.kind() == std::io::ErrorKind::WouldBlock
                || e.kind() == std::io::ErrorKind::TimedOut =>
        {
            Err(ProtoError::TimedOut)
        }
        Err(e) => Err(ProtoError::Connection(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketKind;
    use std::net::TcpListener;
    use std::thread;
    use std::time::Duration;

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let join = thread::spawn(move || TcpStream::connect(addr).unwrap());
        let (accepted, _) = listener.accept().unwrap();
        (accepted, join.join().unwrap())
    }

    #[test]
    fn frames_survive_the_stream() {
        let (mut a, mut b) = pair();
        let sent = Packet::data(5, true, b"fragment".to_vec());
        write_packet(&mut a, &sent).unwrap();

        let received = read_verified(&mut b).unwrap();
        assert_eq!(received, sent);
    }

    #[test]
    fn back_to_back_frames_stay_separate() {
        let (mut a, mut b) = pair();
        write_packet(&mut a, &Packet::data(0, false, b"one".to_vec())).unwrap();
        write_packet(&mut a, &Packet::data(1, true, b"two".to_vec())).unwrap();

        let first = read_verified(&mut b).unwrap();
        let second = read_verified(&mut b).unwrap();
        assert_eq!(first.payload, b"one");
        assert_eq!(second.payload, b"two");
        assert!(second.last_fragment);
    }

    #[test]
    fn clean_eof_reports_peer_closed() {
        let (a, mut b) = pair();
        drop(a);
        assert!(matches!(read_packet(&mut b), Err(ProtoError::PeerClosed)));
    }

    #[test]
    fn read_timeout_reports_timed_out() {
        let (_a, mut b) = pair();
        b.set_read_timeout(Some(Duration::from_millis(30))).unwrap();
        assert!(matches!(read_packet(&mut b), Err(ProtoError::TimedOut)));
    }

    #[test]
    fn control_packet_roundtrip() {
        let (mut a, mut b) = pair();
        write_packet(&mut a, &Packet::control(PacketKind::ListRequest, "")).unwrap();
        let packet = read_verified(&mut b).unwrap();
        assert_eq!(packet.kind, PacketKind::ListRequest);
        assert_eq!(packet.sequence, 0);
    }
}
