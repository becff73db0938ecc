use crate::clock_transform::LinearTransform;
use crate::safe_converter::{PrecheckedCast, SafeCast};
use crate::seq_num::SeqNum;
use crate::wire::rtp_header::RtpHeader;
use anyhow::{anyhow, bail, Context};
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::cmp::min;

#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum PayloadKind {
    Audio = 1,
    /// recognized on the wire, but not supported
    Video = 2,
    /// recognized on the wire, but not supported
    Subpicture = 3,
    Control = 4,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum CodecType {
    PcmBigEndian = 1,
    PcmLittleEndian = 2,
    Mpeg1Audio = 3,
    Aac = 4,
    OggVorbis = 5,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AudioFlags: u8 {
        const RANDOM_ACCESS = 0b0000_0001;
        const DROPPABLE     = 0b0000_0010;
        const DISCONTINUITY = 0b0000_0100;
        const END_OF_STREAM = 0b0000_1000;
    }
}

/// wire-level flag: aux data length and aux data follow the volume byte
const FLAG_HAS_AUX_DATA: u8 = 0b0001_0000;

/// The TRTP sub-header that follows the RTP header in a marker datagram:
///
/// ```ascii
/// 0: TRTP version (u8), always 1
/// 1: payload kind (bits 4-7) | has clock transform (bit 1) | has PTS (bit 0)
/// 2: remaining length (u32) - number of bytes after this field, summed over all fragments
/// *: PTS high 32 bits (u32), if 'has PTS'
/// *: clock transform: a_zero (i64), numerator (i32), denominator (u32), b_zero (i64),
///     if 'has clock transform'
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrtpHeader {
    pub kind: PayloadKind,
    pub pts: Option<i64>,
    pub clock_transform: Option<LinearTransform>,
    /// number of body bytes (type-specific header + payload) following the sub-header
    pub body_len: usize,
}

impl TrtpHeader {
    pub const TRTP_VERSION: u8 = 1;
    pub const MIN_SERIALIZED_LEN: usize = 1 + 1 + 4;

    const FLAG_HAS_TRANSFORM: u8 = 0b0000_0010;
    const FLAG_HAS_PTS: u8 = 0b0000_0001;

    fn extension_len(&self) -> usize {
        self.pts.map_or(0, |_| size_of::<u32>())
            + self.clock_transform.map_or(0, |_| LinearTransform::SERIALIZED_LEN)
    }

    pub fn serialized_len(&self) -> usize {
        Self::MIN_SERIALIZED_LEN + self.extension_len()
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        let kind: u8 = self.kind.into();
        let mut flags = kind << 4;
        if self.clock_transform.is_some() {
            flags |= Self::FLAG_HAS_TRANSFORM;
        }
        if self.pts.is_some() {
            flags |= Self::FLAG_HAS_PTS;
        }

        buf.put_u8(Self::TRTP_VERSION);
        buf.put_u8(flags);
        buf.put_u32((self.extension_len() + self.body_len).prechecked_cast());
        if let Some(pts) = self.pts {
            buf.put_u32((pts as u64 >> 32) as u32);
        }
        if let Some(transform) = &self.clock_transform {
            transform.ser(buf);
        }
    }

    /// `pts_low` is the RTP header's timestamp which carries the PTS's lower 32 bits
    pub fn deser(buf: &mut impl Buf, pts_low: u32) -> anyhow::Result<TrtpHeader> {
        let version = buf.try_get_u8().context("TRTP header truncated")?;
        if version != Self::TRTP_VERSION {
            bail!("unsupported TRTP version {}", version);
        }

        let flags = buf.try_get_u8().context("TRTP header truncated")?;
        let kind = PayloadKind::try_from(flags >> 4)
            .map_err(|_| anyhow!("unknown TRTP payload kind {}", flags >> 4))?;
        let remaining_len: usize = buf.try_get_u32().context("TRTP header truncated")?.safe_cast();

        let pts = if flags & Self::FLAG_HAS_PTS != 0 {
            let pts_high = buf.try_get_u32().context("TRTP header truncated: PTS missing")?;
            Some((((pts_high as u64) << 32) | pts_low as u64) as i64)
        }
        else {
            None
        };

        let clock_transform = if flags & Self::FLAG_HAS_TRANSFORM != 0 {
            Some(LinearTransform::deser(buf)?)
        }
        else {
            None
        };

        let mut result = TrtpHeader {
            kind,
            pts,
            clock_transform,
            body_len: 0,
        };
        result.body_len = remaining_len.checked_sub(result.extension_len())
            .ok_or_else(|| anyhow!("declared TRTP length {} is shorter than the header extensions", remaining_len))?;
        Ok(result)
    }
}

/// Type-specific header of an audio packet:
///
/// ```ascii
/// 0: codec type (u8)
/// 1: flags (u8): random access | droppable | discontinuity | EOS | has aux data
/// 2: volume (u8)
/// *: aux data length (u32) + aux data, if 'has aux data'
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AudioHeader {
    pub codec: CodecType,
    pub flags: AudioFlags,
    pub volume: u8,
    pub aux_data: Option<Bytes>,
}

impl AudioHeader {
    pub const MIN_SERIALIZED_LEN: usize = 3;

    pub fn serialized_len(&self) -> usize {
        Self::MIN_SERIALIZED_LEN + self.aux_data.as_ref().map_or(0, |aux| size_of::<u32>() + aux.len())
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        let mut flags = self.flags.bits();
        if self.aux_data.is_some() {
            flags |= FLAG_HAS_AUX_DATA;
        }

        buf.put_u8(self.codec.into());
        buf.put_u8(flags);
        buf.put_u8(self.volume);
        if let Some(aux) = &self.aux_data {
            buf.put_u32(aux.len().prechecked_cast());
            buf.put_slice(aux);
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<AudioHeader> {
        let raw_codec = buf.try_get_u8().context("audio header truncated")?;
        let codec = CodecType::try_from(raw_codec)
            .map_err(|_| anyhow!("unknown codec type {}", raw_codec))?;
        let raw_flags = buf.try_get_u8().context("audio header truncated")?;
        let volume = buf.try_get_u8().context("audio header truncated")?;

        let aux_data = if raw_flags & FLAG_HAS_AUX_DATA != 0 {
            let aux_len: usize = buf.try_get_u32().context("audio header truncated: aux data length missing")?.safe_cast();
            if buf.remaining() < aux_len {
                bail!("aux data length {} exceeds the {} bytes in the datagram", aux_len, buf.remaining());
            }
            Some(buf.copy_to_bytes(aux_len))
        }
        else {
            None
        };

        Ok(AudioHeader {
            codec,
            flags: AudioFlags::from_bits_truncate(raw_flags),
            volume,
            aux_data,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AudioPayload {
    pub header: AudioHeader,
    pub access_unit: Bytes,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlCommand {
    Nop,
    Flush,
    EndOfStream,
    /// the complete set of program ids the transmitter currently serves
    ActiveProgramUpdate(Vec<u8>),
}

impl ControlCommand {
    pub const ID_NOP: u16 = 1;
    pub const ID_FLUSH: u16 = 2;
    pub const ID_END_OF_STREAM: u16 = 3;
    pub const ID_ACTIVE_PROGRAM_UPDATE: u16 = 4;

    pub fn serialized_len(&self) -> usize {
        match self {
            ControlCommand::ActiveProgramUpdate(ids) => size_of::<u16>() + 1 + ids.len(),
            _ => size_of::<u16>(),
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        match self {
            ControlCommand::Nop => buf.put_u16(Self::ID_NOP),
            ControlCommand::Flush => buf.put_u16(Self::ID_FLUSH),
            ControlCommand::EndOfStream => buf.put_u16(Self::ID_END_OF_STREAM),
            ControlCommand::ActiveProgramUpdate(program_ids) => {
                buf.put_u16(Self::ID_ACTIVE_PROGRAM_UPDATE);
                buf.put_u8(program_ids.len().prechecked_cast());
                buf.put_slice(program_ids);
            }
        }
    }

    /// NB: the entire buffer must be consumed by the command
    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<ControlCommand> {
        let result = match buf.try_get_u16().context("control packet too short")? {
            Self::ID_NOP => ControlCommand::Nop,
            Self::ID_FLUSH => ControlCommand::Flush,
            Self::ID_END_OF_STREAM => ControlCommand::EndOfStream,
            Self::ID_ACTIVE_PROGRAM_UPDATE => {
                let count = buf.try_get_u8().context("active program update without program count")? as usize;
                if buf.remaining() < count {
                    bail!("active program update declares {} programs, but only {} bytes remain", count, buf.remaining());
                }
                let mut program_ids = vec![0; count];
                buf.copy_to_slice(&mut program_ids);
                ControlCommand::ActiveProgramUpdate(program_ids)
            }
            other => bail!("unknown control command {}", other),
        };

        if buf.has_remaining() {
            bail!("{} trailing bytes after control command", buf.remaining());
        }
        Ok(result)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TrtpPayload {
    Audio(AudioPayload),
    Control(ControlCommand),
}

impl TrtpPayload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            TrtpPayload::Audio(_) => PayloadKind::Audio,
            TrtpPayload::Control(_) => PayloadKind::Control,
        }
    }

    fn body_len(&self) -> usize {
        match self {
            TrtpPayload::Audio(audio) => audio.header.serialized_len() + audio.access_unit.len(),
            TrtpPayload::Control(cmd) => cmd.serialized_len(),
        }
    }

    /// the part of the body that must be contained in the marker datagram
    fn body_header_len(&self) -> usize {
        match self {
            TrtpPayload::Audio(audio) => audio.header.serialized_len(),
            TrtpPayload::Control(cmd) => cmd.serialized_len(),
        }
    }
}

/// A logical TRTP packet, i.e. everything that is sent as one unit. Sequence number and epoch
///  are not part of it since they are assigned per datagram when the packet is sent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrtpPacket {
    pub program_id: u8,
    pub substream_id: u8,
    pub pts: Option<i64>,
    pub clock_transform: Option<LinearTransform>,
    pub payload: TrtpPayload,
}

impl TrtpPacket {
    pub fn control(program_id: u8, command: ControlCommand) -> TrtpPacket {
        TrtpPacket {
            program_id,
            substream_id: 0,
            pts: None,
            clock_transform: None,
            payload: TrtpPayload::Control(command),
        }
    }

    fn trtp_header(&self) -> TrtpHeader {
        TrtpHeader {
            kind: self.payload.kind(),
            pts: self.pts,
            clock_transform: self.clock_transform,
            body_len: self.payload.body_len(),
        }
    }

    /// Serialize everything that follows the RTP header, i.e. TRTP sub-header and body
    pub fn encode_payload(&self) -> BytesMut {
        let header = self.trtp_header();
        let mut buf = BytesMut::with_capacity(header.serialized_len() + header.body_len);
        header.ser(&mut buf);

        match &self.payload {
            TrtpPayload::Audio(audio) => {
                audio.header.ser(&mut buf);
                buf.put_slice(&audio.access_unit);
            }
            TrtpPayload::Control(cmd) => cmd.ser(&mut buf),
        }
        buf
    }

    /// Split this packet into datagrams of at most `max_datagram_len` bytes, each with its own
    ///  RTP header. The first datagram has the marker bit set and carries all headers, the
    ///  others are raw continuation bytes.
    pub fn to_datagrams(&self, epoch: u32, max_datagram_len: usize, mut next_seq: impl FnMut() -> SeqNum) -> anyhow::Result<Vec<(SeqNum, Bytes)>> {
        let max_chunk_len = max_datagram_len.checked_sub(RtpHeader::SERIALIZED_LEN)
            .filter(|&len| len > 0)
            .ok_or_else(|| anyhow!("maximum datagram length {} does not leave room for payload", max_datagram_len))?;

        let header_len = self.trtp_header().serialized_len() + self.payload.body_header_len();
        if header_len > max_chunk_len {
            bail!("TRTP headers of {} bytes do not fit into a single datagram of {} bytes", header_len, max_datagram_len);
        }
        if let TrtpPayload::Control(ControlCommand::ActiveProgramUpdate(program_ids)) = &self.payload {
            if program_ids.len() > u8::MAX as usize {
                bail!("active program update with {} program ids exceeds the limit of {}", program_ids.len(), u8::MAX);
            }
        }

        let mut payload = self.encode_payload().freeze();
        let mut result = Vec::with_capacity(payload.len() / max_chunk_len + 1);

        let mut is_first = true;
        while is_first || !payload.is_empty() {
            let chunk = payload.split_to(min(max_chunk_len, payload.len()));

            let header = RtpHeader {
                marker: is_first,
                seq: next_seq(),
                timestamp: if is_first { self.pts.map_or(0, |pts| pts as u32) } else { 0 },
                epoch,
                program_id: self.program_id,
                substream_id: self.substream_id,
            };

            let mut datagram = BytesMut::with_capacity(RtpHeader::SERIALIZED_LEN + chunk.len());
            header.ser(&mut datagram);
            datagram.put_slice(&chunk);
            result.push((header.seq, datagram.freeze()));

            is_first = false;
        }
        Ok(result)
    }

    /// Decode a packet that is contained in a single (marker) datagram
    pub fn decode(datagram: &[u8]) -> anyhow::Result<(RtpHeader, TrtpPacket)> {
        let mut buf = datagram;
        let rtp_header = RtpHeader::deser(&mut buf)?;
        let packet = Self::decode_payload(&rtp_header, buf)?;
        Ok((rtp_header, packet))
    }

    /// Number of bytes following the RTP header that make up the entire packet, i.e. summed
    ///  over the marker datagram and all continuation datagrams. `marker_payload` is the
    ///  marker datagram without its RTP header.
    pub fn total_payload_len(marker_payload: &[u8], pts_low: u32) -> anyhow::Result<usize> {
        let mut buf = marker_payload;
        let header = TrtpHeader::deser(&mut buf, pts_low)?;
        Ok(header.serialized_len() + header.body_len)
    }

    /// Decode a packet from everything following the marker datagram's RTP header, with the
    ///  continuation datagrams' payload appended
    pub fn decode_payload(rtp_header: &RtpHeader, mut buf: &[u8]) -> anyhow::Result<TrtpPacket> {
        if !rtp_header.marker {
            bail!("continuation datagram {:?} can not be decoded on its own", rtp_header.seq);
        }

        let trtp_header = TrtpHeader::deser(&mut buf, rtp_header.timestamp)?;
        if buf.remaining() != trtp_header.body_len {
            bail!("declared body length {} does not match the {} bytes in the datagram", trtp_header.body_len, buf.remaining());
        }

        let payload = match trtp_header.kind {
            PayloadKind::Audio => {
                let header = AudioHeader::deser(&mut buf)?;
                TrtpPayload::Audio(AudioPayload {
                    header,
                    access_unit: Bytes::copy_from_slice(buf),
                })
            }
            PayloadKind::Control => TrtpPayload::Control(ControlCommand::deser(&mut buf)?),
            PayloadKind::Video | PayloadKind::Subpicture => {
                bail!("unsupported TRTP payload kind {:?}", trtp_header.kind);
            }
        };

        Ok(TrtpPacket {
            program_id: rtp_header.program_id,
            substream_id: rtp_header.substream_id,
            pts: trtp_header.pts,
            clock_transform: trtp_header.clock_transform,
            payload,
        })
    }
}
