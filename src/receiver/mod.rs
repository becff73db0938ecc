//! The receiving side: datagrams are sorted into a ring buffer by sequence number, gaps are
//!  requested from the transmitter, and complete packets are demultiplexed into per-flow
//!  decoders.

pub mod codec_params;
pub mod decoder;
pub mod gap_controller;
pub mod receiver;
pub mod ring_buffer;
pub mod substream;
