//! The obfuscation codec: header rewrite + keyed CRC-8 XOR stream.
//!
//! `encode` and `decode` are pure functions over a mutable buffer of known
//! length, no session state, no I/O. `decode(encode(b, ...), ...) == b`
//! modulo the padding that decode strips back out.

use super::mask_cache::with_mask;
use super::params::{
    packet_type, ObfuscationParams, MAX_DUMMY_LENGTH_HANDSHAKE, MAX_DUMMY_LENGTH_TOTAL,
    WG_TYPE_COOKIE, WG_TYPE_DATA, WG_TYPE_HANDSHAKE_INIT, WG_TYPE_HANDSHAKE_RESP,
};
use super::rng::{rand_below, rand_byte_nonzero};

/// `true` iff `buffer[0..4]` does *not* look like a valid WireGuard header,
/// i.e. the packet looks obfuscated to a passive observer.
///
/// Caller must ensure `buffer.len() >= 4`.
#[inline]
pub fn is_obfuscated(buffer: &[u8]) -> bool {
    let pt = buffer[0];
    !(1..=4).contains(&pt) || buffer[1] != 0 || buffer[2] != 0 || buffer[3] != 0
}

/// XORs `buffer` in place with the keystream for `(buffer.len(), key)`.
///
/// Self-inverse: calling this twice with the same key restores the input.
pub fn xor_data(buffer: &mut [u8], key: &[u8]) {
    if key.is_empty() || buffer.is_empty() {
        return;
    }
    with_mask(buffer.len(), key, |mask| {
        for (b, m) in buffer.iter_mut().zip(mask.iter()) {
            *b ^= m;
        }
    });
}

/// Encodes `buffer[..len]` in place: optional header rewrite + padding (when
/// `version >= 1`), followed by the keyed XOR stream. Returns the new
/// length, which may be larger than `len` if padding was appended.
///
/// `buffer` must have at least `MAX_DUMMY_LENGTH_TOTAL` bytes of spare
/// capacity beyond `len` to accommodate worst-case padding.
///
/// Caller must ensure `len >= 4`.
pub fn encode(buffer: &mut [u8], mut len: usize, params: &ObfuscationParams, version: u8) -> usize {
    if version >= 1 {
        let pt = packet_type(buffer);
        let rnd = rand_byte_nonzero();
        buffer[0] ^= rnd;
        buffer[1] = rnd;

        if len < MAX_DUMMY_LENGTH_TOTAL as usize {
            let max_dummy = MAX_DUMMY_LENGTH_TOTAL - len as u16;
            let dummy_length = match pt {
                WG_TYPE_HANDSHAKE_INIT | WG_TYPE_HANDSHAKE_RESP => {
                    rand_below(max_dummy.min(MAX_DUMMY_LENGTH_HANDSHAKE))
                }
                WG_TYPE_COOKIE | WG_TYPE_DATA => {
                    if params.max_dummy_length_data > 0 {
                        rand_below(max_dummy.min(params.max_dummy_length_data))
                    } else {
                        0
                    }
                }
                _ => 0,
            };

            buffer[2] = (dummy_length & 0xFF) as u8;
            buffer[3] = (dummy_length >> 8) as u8;

            if dummy_length > 0 {
                let dl = dummy_length as usize;
                buffer[len..len + dl].fill(0xFF);
                len += dl;
            }
        }
    }

    xor_data(&mut buffer[..len], &params.key);
    len
}

/// Decodes `buffer[..len]` in place. Returns the recovered length, which
/// may come back negative or larger than `len` for a malformed/foreign
/// packet; the caller is responsible for treating such results as a drop
/// (a fail mode the caller must check for), decode itself never rejects.
///
/// On success, `*version_out` is set to 0 if the packet turned out to be
/// unobfuscated plaintext, unchanged otherwise (the caller takes the min
/// against the peer's current version).
///
/// Caller must ensure `len >= 4`.
pub fn decode(buffer: &mut [u8], len: usize, params: &ObfuscationParams, version_out: &mut u8) -> isize {
    xor_data(&mut buffer[..len], &params.key);

    if !is_obfuscated(&buffer[..len]) {
        *version_out = 0;
        return len as isize;
    }

    buffer[0] ^= buffer[1];
    let dummy_length = (buffer[2] as u16) | ((buffer[3] as u16) << 8);
    buffer[1] = 0;
    buffer[2] = 0;
    buffer[3] = 0;

    len as isize - dummy_length as isize
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(key: &[u8]) -> ObfuscationParams {
        ObfuscationParams::new(key.to_vec(), 0)
    }

    #[test]
    fn law_xor_is_involutive() {
        let key = b"keykeykey";
        let original = vec![1u8, 2, 3, 4, 5, 6, 7, 8, 9];
        let mut buf = original.clone();
        xor_data(&mut buf, key);
        xor_data(&mut buf, key);
        assert_eq!(buf, original);
    }

    #[test]
    fn law_is_obfuscated_matches_definition() {
        assert!(!is_obfuscated(&[1, 0, 0, 0]));
        assert!(!is_obfuscated(&[4, 0, 0, 0]));
        assert!(is_obfuscated(&[5, 0, 0, 0]));
        assert!(is_obfuscated(&[1, 1, 0, 0]));
        assert!(is_obfuscated(&[0, 0, 0, 0]));
    }

    #[test]
    fn law_roundtrip_recovers_original_bytes_and_length() {
        let key = b"abc";
        let p = params(key);
        let original: Vec<u8> = vec![0x01, 0x00, 0x00, 0x00, 0xDE, 0xAD];
        let len = original.len();

        let mut buf = original.clone();
        buf.resize(len + MAX_DUMMY_LENGTH_TOTAL as usize, 0);
        let new_len = encode(&mut buf, len, &p, 1);

        let mut version_out = 1u8;
        let decoded_len = decode(&mut buf, new_len, &p, &mut version_out);

        assert_eq!(decoded_len, len as isize);
        assert_eq!(&buf[..len], &original[..]);
    }

    #[test]
    fn fixed_rnd_and_roundtrip_recovers_header() {
        // We can't pin the RNG from here, but we can confirm the invariants
        // this exercises: after encode buffer[1] == the XOR-undo
        // byte that makes `buffer[0] ^= buffer[1]` recover 0x01, detection
        // flags it obfuscated, and decode recovers the original 6 bytes.
        let key = b"abc";
        let p = params(key);
        let original: Vec<u8> = vec![0x01, 0x00, 0x00, 0x00, 0xDE, 0xAD];
        let mut buf = original.clone();
        buf.resize(original.len() + MAX_DUMMY_LENGTH_TOTAL as usize, 0);

        let new_len = encode(&mut buf, original.len(), &p, 1);

        // undo the XOR stream manually to inspect the rewritten header
        let mut header_view = buf[..new_len].to_vec();
        xor_data(&mut header_view, key);
        assert!(is_obfuscated(&header_view));

        let mut version_out = 1u8;
        let decoded_len = decode(&mut buf, new_len, &p, &mut version_out);
        assert_eq!(decoded_len, original.len() as isize);
        assert_eq!(&buf[..original.len()], &original[..]);
    }

    #[test]
    fn version_0_is_passthrough_after_roundtrip() {
        let key = b"abc";
        let p = params(key);
        let original: Vec<u8> = vec![0x04, 0x00, 0x00, 0x00, 1, 2, 3, 4];
        let mut buf = original.clone();
        buf.resize(original.len() + 16, 0);

        let new_len = encode(&mut buf, original.len(), &p, 0);
        assert_eq!(new_len, original.len(), "version 0 adds no padding");

        let mut version_out = 1u8;
        let decoded_len = decode(&mut buf, new_len, &p, &mut version_out);
        assert_eq!(version_out, 0);
        assert_eq!(decoded_len, original.len() as isize);
        assert_eq!(&buf[..original.len()], &original[..]);
    }

    #[test]
    fn detection_failure_rate_is_bounded() {
        // An encoded packet should never still look unobfuscated:
        // `buffer[1]` is set to `rnd != 0`, and a valid-looking header
        // requires `buffer[1] == 0`, so the failure probability is exactly
        // zero. This test pins that down across many random draws.
        let key = b"abc";
        let p = params(key);
        let mut failures = 0;
        for _ in 0..10_000 {
            let original: Vec<u8> = vec![0x01, 0x00, 0x00, 0x00, 0xAA];
            let mut buf = original.clone();
            buf.resize(original.len() + 16, 0);
            let new_len = encode(&mut buf, original.len(), &p, 1);

            let mut header_view = buf[..new_len].to_vec();
            xor_data(&mut header_view, key);
            if !is_obfuscated(&header_view) {
                failures += 1;
            }
        }
        assert_eq!(failures, 0);
    }

    #[test]
    fn decode_signals_drop_on_oversized_dummy_length() {
        let key = b"abc";
        let p = params(key);
        // obfuscated-looking buffer whose embedded dummy_length exceeds len
        let mut buf = vec![0xAAu8, 0x01, 0xFF, 0xFF, 0x00, 0x00];
        xor_data(&mut buf, key);
        let mut version_out = 1u8;
        let result = decode(&mut buf, 6, &p, &mut version_out);
        assert!(result < 4 || result as usize > 6);
    }
}
