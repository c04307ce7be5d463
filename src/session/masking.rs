//! The masking handler contract: an external layer that wraps
//! obfuscated bodies in an envelope mimicking an unrelated protocol. The
//! core never interprets envelope formats, it only calls these hooks.

use std::net::SocketAddr;

use super::entry::PeerEntry;

/// Context passed to every masking hook, mirroring the tuple
/// lists: `(buffer, length, config, peer_entry, listen_sock, peer_addr,
/// forward_addr)`. `listen_sock` is omitted here since hooks that need to
/// send out-of-band traffic receive the socket directly in their method
/// signature where relevant, keeping the trait object-safe.
pub struct MaskingContext<'a> {
    pub peer: Option<&'a PeerEntry>,
    pub peer_addr: SocketAddr,
    pub forward_addr: SocketAddr,
}

/// A pluggable envelope scheme. Implementations may reallocate within the
/// buffer's capacity but must not exceed it.
pub trait MaskingHandler: Send + Sync {
    /// Unwraps an obfuscated datagram that arrived on the listener.
    /// Returns the new length; `<= 0` means drop.
    fn unwrap_from_client(&self, buffer: &mut [u8], len: usize, _ctx: &MaskingContext) -> isize {
        let _ = buffer;
        len as isize
    }

    /// Unwraps an obfuscated datagram that arrived from the upstream.
    fn unwrap_from_server(&self, buffer: &mut [u8], len: usize, _ctx: &MaskingContext) -> isize {
        let _ = buffer;
        len as isize
    }

    /// Called when an unobfuscated Initiation arrives from the client, so
    /// the handler may pin a scheme for the rest of the session.
    fn on_handshake_req_from_client(&self, _ctx: &MaskingContext) {}

    /// Called when an unobfuscated Initiation arrives from the upstream.
    fn on_handshake_req_from_server(&self, _ctx: &MaskingContext) {}

    /// Wraps an encoded packet before it is sent toward the server.
    fn data_wrap_to_server(&self, buffer: &mut [u8], len: usize, _ctx: &MaskingContext) -> usize {
        let _ = buffer;
        len
    }

    /// Wraps an encoded packet before it is sent toward the client.
    fn data_wrap_to_client(&self, buffer: &mut [u8], len: usize, _ctx: &MaskingContext) -> usize {
        let _ = buffer;
        len
    }
}

/// Transparent passthrough: every hook is a no-op. The default when no
/// masking handler is configured.
#[derive(Default)]
pub struct NoopMaskingHandler;

impl MaskingHandler for NoopMaskingHandler {}

/// Minimal HTTP-request mimicry, wrapping only the handshake Initiation
/// that carries the obfuscated body so a passive observer sees what looks
/// like an HTTP request line. Data packets pass through unwrapped: a full
/// HTTP masking scheme is out of scope here, this is one concrete,
/// runnable handler exercising the hook points.
pub struct HttpMimicryMaskingHandler {
    pub host: String,
}

impl HttpMimicryMaskingHandler {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }

    fn prefix(&self) -> Vec<u8> {
        format!(
            "POST /upload HTTP/1.1\r\nHost: {}\r\nContent-Length: ",
            self.host
        )
        .into_bytes()
    }
}

impl MaskingHandler for HttpMimicryMaskingHandler {
    fn data_wrap_to_server(&self, buffer: &mut [u8], len: usize, _ctx: &MaskingContext) -> usize {
        self.wrap(buffer, len)
    }

    fn data_wrap_to_client(&self, buffer: &mut [u8], len: usize, _ctx: &MaskingContext) -> usize {
        self.wrap(buffer, len)
    }

    fn unwrap_from_client(&self, buffer: &mut [u8], len: usize, _ctx: &MaskingContext) -> isize {
        self.unwrap(buffer, len)
    }

    fn unwrap_from_server(&self, buffer: &mut [u8], len: usize, _ctx: &MaskingContext) -> isize {
        self.unwrap(buffer, len)
    }
}

impl HttpMimicryMaskingHandler {
    /// `buffer` must have at least `prefix + 6 + len` bytes of spare capacity.
    fn wrap(&self, buffer: &mut [u8], len: usize) -> usize {
        let header_end = format!("{}\r\n\r\n", len).into_bytes();
        let mut framed = self.prefix();
        framed.extend_from_slice(&header_end);
        framed.extend_from_slice(&buffer[..len]);
        let new_len = framed.len();
        buffer[..new_len].copy_from_slice(&framed);
        new_len
    }

    fn unwrap(&self, buffer: &mut [u8], len: usize) -> isize {
        let body = &buffer[..len];
        let marker = b"\r\n\r\n";
        let Some(pos) = body
            .windows(marker.len())
            .position(|w| w == marker)
        else {
            return -1;
        };
        let body_start = pos + marker.len();
        if body_start > len {
            return -1;
        }
        let body_len = len - body_start;
        buffer.copy_within(body_start..len, 0);
        body_len as isize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_mimicry_roundtrips() {
        let handler = HttpMimicryMaskingHandler::new("example.com");
        let original = vec![1u8, 2, 3, 4, 5];
        let mut buf = original.clone();
        buf.resize(256, 0);

        let wrapped_len = handler.wrap(&mut buf, original.len());
        assert!(wrapped_len > original.len());

        let unwrapped_len = handler.unwrap(&mut buf, wrapped_len);
        assert_eq!(unwrapped_len, original.len() as isize);
        assert_eq!(&buf[..original.len()], &original[..]);
    }

    #[test]
    fn noop_handler_passes_length_through() {
        let handler = NoopMaskingHandler;
        let ctx = MaskingContext {
            peer: None,
            peer_addr: "127.0.0.1:1".parse().unwrap(),
            forward_addr: "127.0.0.1:2".parse().unwrap(),
        };
        let mut buf = vec![0u8; 8];
        assert_eq!(handler.unwrap_from_client(&mut buf, 8, &ctx), 8);
        assert_eq!(handler.data_wrap_to_server(&mut buf, 8, &ctx), 8);
    }
}
