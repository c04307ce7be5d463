//! Stateless, symmetric packet obfuscation: header rewrite + padding +
//! keyed CRC-8 XOR stream.

pub mod codec;
pub mod crc;
pub mod mask_cache;
pub mod params;
pub mod rng;

pub use codec::{decode, encode, is_obfuscated, xor_data};
pub use params::{ObfuscationParams, OBFUSCATION_VERSION};
