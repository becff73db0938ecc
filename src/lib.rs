//! TRTP is a reliable, low-latency protocol for streaming audio from one transmitter to many
//!  receivers over RTP / UDP.
//!
//! Every datagram is an RTP packet whose SSRC carries the stream's epoch, program id and
//!  substream id. Larger TRTP packets are fragmented over consecutive sequence numbers, with
//!  the marker bit on the first fragment. Receivers detect gaps in the sequence numbers and
//!  ask the transmitter to resend them; the transmitter answers from its retry buffer or
//!  explicitly NAKs what it no longer has. Packets carry a transform from media time to a
//!  common clock shared by all participants, so receivers can render in sync.

pub mod clock_transform;
pub mod common_clock;
pub mod config;
pub mod receiver;
pub mod safe_converter;
pub mod seq_num;
pub mod transmitter;
pub mod wire;
