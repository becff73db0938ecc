//! The sending side: transmit groups fan a sequenced stream out to multicast and unicast
//!  receivers and answer their retry requests, the endpoint sender does the same for direct
//!  unicast endpoints, and the media sender turns access units into packets.

pub mod cnc_server;
pub mod endpoint_sender;
pub mod media_sender;
pub mod packet_sequencer;
pub mod retry_buffer;
pub mod send_socket;
pub mod tx_group;
