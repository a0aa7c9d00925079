//! Per-sender reliable-delivery windows.
//!
//! This crate provides:
//!
//! - [`SeqWindow`]: buffers one sender's messages, detects gaps, delivers
//!   in FIFO order and retains delivered messages for retransmission until
//!   they are stable.
//! - [`Retransmitter`]: decides when to re-ask for missing ranges,
//!   following an exponential backoff schedule.

mod error;
mod retransmit;
mod window;

pub use error::WindowError;
pub use retransmit::{RetransmitRequest, Retransmitter};
pub use window::{Insertion, SeqRange, SeqWindow, WindowCounters};
