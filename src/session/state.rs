//! Shared handshake-transition logic used by both the client-side and
//! server-side worker, kept side-agnostic so the two handlers don't
//! duplicate the same window/direction checks with subtly different bugs.

use crate::obfuscation::params::{
    WG_TYPE_COOKIE, WG_TYPE_DATA, WG_TYPE_HANDSHAKE_INIT, WG_TYPE_HANDSHAKE_RESP,
};

use super::entry::{HandshakeDirection, PeerEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketClass {
    Initiation,
    Response,
    Cookie,
    Data,
    Unknown,
}

pub fn classify(packet_type: u32) -> PacketClass {
    match packet_type {
        WG_TYPE_HANDSHAKE_INIT => PacketClass::Initiation,
        WG_TYPE_HANDSHAKE_RESP => PacketClass::Response,
        WG_TYPE_COOKIE => PacketClass::Cookie,
        WG_TYPE_DATA => PacketClass::Data,
        _ => PacketClass::Unknown,
    }
}

/// Which side of the relay a packet arrived on. Matches the two worker
/// handlers one-for-one: `Client` is processed by the client-side worker,
/// `Server` by the server-side worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    fn this_direction(self) -> HandshakeDirection {
        match self {
            Side::Client => HandshakeDirection::ClientToServer,
            Side::Server => HandshakeDirection::ServerToClient,
        }
    }

    fn opposite_direction(self) -> HandshakeDirection {
        match self {
            Side::Client => HandshakeDirection::ServerToClient,
            Side::Server => HandshakeDirection::ClientToServer,
        }
    }
}

/// Records an Initiation observed on `side`.
pub fn record_initiation(entry: &PeerEntry, side: Side, now_ms: u64) {
    entry.set_handshake_direction(side.this_direction());
    entry.stamp_handshake_request(now_ms);
}

/// Applies a Response observed on `side`. `obfuscated` is whether *this*
/// packet (the Response) arrived already obfuscated; the complement side
/// is what the relay must obfuscate going forward.
///
/// Returns `true` if the handshake completed and the packet should be
/// forwarded, `false` if it must be dropped (out-of-window
/// or wrong-direction responses are dropped).
pub fn apply_response(
    entry: &PeerEntry,
    side: Side,
    obfuscated: bool,
    handshake_timeout_ms: u64,
    now_ms: u64,
) -> bool {
    let elapsed = now_ms.saturating_sub(entry.last_handshake_request_time());
    if elapsed > handshake_timeout_ms {
        return false;
    }
    if entry.handshake_direction() != side.opposite_direction() {
        return false;
    }

    entry.set_handshaked(true);
    match side {
        Side::Client => entry.set_obfuscation_sides(obfuscated, !obfuscated),
        Side::Server => entry.set_obfuscation_sides(!obfuscated, obfuscated),
    }
    entry.stamp_handshake_complete(now_ms);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn entry() -> PeerEntry {
        let sock = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )
        .unwrap();
        sock.set_nonblocking(true).unwrap();
        sock.bind(&"127.0.0.1:0".parse::<SocketAddr>().unwrap().into())
            .unwrap();
        PeerEntry::new(
            "127.0.0.1:1".parse().unwrap(),
            "127.0.0.1:2".parse().unwrap(),
            sock,
            1,
            0,
        )
    }

    #[test]
    fn property_handshake_completes_within_window_sets_complementary_obfuscation() {
        let e = entry();
        // server sends the Initiation first...
        record_initiation(&e, Side::Server, 0);
        // ...client's Response completes it.
        let ok = apply_response(&e, Side::Client, false, 5_000, 100);
        assert!(ok);
        assert!(e.handshaked());
        assert_ne!(e.client_obfuscated(), e.server_obfuscated());
    }

    #[test]
    fn response_after_handshake_window_is_dropped() {
        let e = entry();
        record_initiation(&e, Side::Server, 0);
        let ok = apply_response(&e, Side::Client, false, 5_000, 5_001);
        assert!(!ok);
        assert!(!e.handshaked());
    }

    #[test]
    fn response_in_wrong_direction_is_dropped() {
        let e = entry();
        record_initiation(&e, Side::Server, 0);
        // a bogus "response from server" while we're waiting on the client
        let ok = apply_response(&e, Side::Server, false, 5_000, 10);
        assert!(!ok);
    }
}
