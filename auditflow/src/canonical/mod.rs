//! Canonical encoding.
//!
//! Two encodings live here:
//!
//! - **Canonical JSON** ([`canonical_json`]): sorted keys, compact, with
//!   typed values normalised to stable strings. It feeds content hashing
//!   ([`stable_hash`]), so it must be deterministic across runs and
//!   processes.
//! - **Tagged JSON** ([`encode_tagged`] / [`decode_tagged`]): a
//!   type-preserving envelope used for checkpoints and stored payloads.
//!   Timestamps, dates, decimals and bytes are wrapped as
//!   `{"__af_type__": tag, "value": ...}` so decoding restores the exact
//!   variant.
//!
//! Both reject NaN and infinities anywhere in the structure.

mod encoder;
mod hashing;
mod tagged;

pub use encoder::{canonical_json, canonical_json_value, to_canonical_value, CanonicalError};
pub use hashing::{repr_hash, safe_repr, sha256_hex, stable_hash, stable_hash_json, stable_hash_row};
pub use tagged::{
    decode_tagged, decode_tagged_row, decode_tagged_str, encode_tagged, encode_tagged_row,
    encode_tagged_string, TYPE_TAG_KEY,
};
