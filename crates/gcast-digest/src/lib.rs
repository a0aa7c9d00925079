//! Delivery-state digests.
//!
//! A [`Digest`] maps each sender to a [`DigestEntry`] `(low, high, high_seen)`
//! summarizing one reliable-delivery window. Digests are what members
//! exchange to reconcile state during flushes and merges: they are
//! O(members), not O(messages).
//!
//! - [`Digest`]: the map plus its merge and comparison operations.
//! - [`codec`]: the binary wire form (`count:u32` then one
//!   `member + low:i64 + high:i64 + high_seen:i64` record per sender).

pub mod codec;
mod digest;
mod error;

pub use digest::{Digest, DigestEntry};
pub use error::DigestError;
