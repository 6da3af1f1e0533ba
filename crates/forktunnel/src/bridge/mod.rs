//! The byte channel between the two processes.
//!
//! # Architecture
//!
//! - **protocol**: the [`Envelope`](protocol::Envelope) frame carried on the
//!   wire (event name, opaque payload, dispatcher index)
//! - **codec**: fixed binary framing for envelopes
//! - **transport**: the pre-split socket pair and the post-split endpoint
//!   read/write discipline

pub mod codec;
pub mod protocol;
pub mod transport;
