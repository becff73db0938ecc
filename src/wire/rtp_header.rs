use crate::seq_num::SeqNum;
use anyhow::{bail, Context};
use bytes::{Buf, BufMut};
use std::fmt::{Debug, Formatter};

/// The fixed 12 byte RTP header that starts every TRTP data datagram.
///
/// ```ascii
/// 0: 0x80 - RTP version 2, no padding, no extension, no CSRC
/// 1: marker (bit 7) | payload type (bits 0-6), payload type is always 100
/// 2: sequence number (u16)
/// 4: timestamp (u32) - low 32 bits of the PTS on marker datagrams, 0 otherwise
/// 8: epoch (22 bits) | program id (5 bits) | substream id (5 bits)
/// ```
#[derive(Clone, Eq, PartialEq)]
pub struct RtpHeader {
    /// set on the first datagram of a TRTP packet
    pub marker: bool,
    pub seq: SeqNum,
    pub timestamp: u32,
    pub epoch: u32,
    pub program_id: u8,
    pub substream_id: u8,
}

impl Debug for RtpHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "RTP{{{:?}{}@{}:{}/{}}}", self.seq, if self.marker { "M" } else { "" }, self.epoch, self.program_id, self.substream_id)
    }
}

impl RtpHeader {
    pub const SERIALIZED_LEN: usize = 12;
    pub const VERSION_BYTE: u8 = 0x80;
    pub const TRTP_PAYLOAD_TYPE: u8 = 100;

    pub const EPOCH_MASK: u32 = 0x3f_ffff;
    pub const ID_MASK: u8 = 0x1f;

    const MARKER_BIT: u8 = 0x80;

    pub fn ser(&self, buf: &mut impl BufMut) {
        debug_assert!(self.epoch <= Self::EPOCH_MASK);
        debug_assert!(self.program_id <= Self::ID_MASK);
        debug_assert!(self.substream_id <= Self::ID_MASK);

        buf.put_u8(Self::VERSION_BYTE);
        buf.put_u8(if self.marker { Self::MARKER_BIT } else { 0 } | Self::TRTP_PAYLOAD_TYPE);
        buf.put_u16(self.seq.to_raw());
        buf.put_u32(self.timestamp);
        buf.put_u32(
            ((self.epoch & Self::EPOCH_MASK) << 10)
                | (((self.program_id & Self::ID_MASK) as u32) << 5)
                | (self.substream_id & Self::ID_MASK) as u32
        );
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<RtpHeader> {
        let version = buf.try_get_u8().context("datagram too short for an RTP header")?;
        if version != Self::VERSION_BYTE {
            bail!("unsupported RTP version / flags byte {:#x}", version);
        }

        let marker_and_type = buf.try_get_u8().context("datagram too short for an RTP header")?;
        let payload_type = marker_and_type & !Self::MARKER_BIT;
        if payload_type != Self::TRTP_PAYLOAD_TYPE {
            bail!("unexpected RTP payload type {}", payload_type);
        }

        let seq = SeqNum::from_raw(buf.try_get_u16().context("RTP header truncated")?);
        let timestamp = buf.try_get_u32().context("RTP header truncated")?;
        let ssrc = buf.try_get_u32().context("RTP header truncated")?;

        Ok(RtpHeader {
            marker: marker_and_type & Self::MARKER_BIT != 0,
            seq,
            timestamp,
            epoch: ssrc >> 10,
            program_id: ((ssrc >> 5) as u8) & Self::ID_MASK,
            substream_id: (ssrc as u8) & Self::ID_MASK,
        })
    }
}
