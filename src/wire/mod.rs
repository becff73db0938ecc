//! The binary formats exchanged between transmitter and receivers: RTP framed TRTP data
//!  datagrams and the out-of-band control datagrams for retries and group membership.

pub mod control_messages;
pub mod rtp_header;
pub mod trtp_packet;
