//! Cryptographic primitives for the hash chain

pub mod hash;

pub use hash::{is_sha256_hex, sha256, sha256_hex};
