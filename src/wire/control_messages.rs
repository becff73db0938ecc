use crate::seq_num::SeqNum;
use anyhow::{bail, Context};
use bytes::{Buf, BufMut, BytesMut};
use std::net::{Ipv4Addr, SocketAddrV4};

/// Control datagrams are not RTP framed: they start with a four byte magic tag (ASCII, BE).
///
/// Retry requests, fast start requests and retry NAKs share a fixed layout:
///
/// ```ascii
///  0: magic (u32)
///  4: target IP V4 address (u32) - the address the receiver listens on, i.e. the multicast
///      group or the transmitter's unicast address
///  8: target port (u16)
/// 10: first sequence number of the range (u16)
/// 12: last sequence number of the range, inclusive (u16)
/// ```
///
/// Group membership messages (join, leave, join NAK) consist of the magic only.
pub const MAGIC_RETRY_REQUEST: u32 = u32::from_be_bytes(*b"Treq");
pub const MAGIC_FAST_START_REQUEST: u32 = u32::from_be_bytes(*b"Tfsr");
pub const MAGIC_RETRY_NAK: u32 = u32::from_be_bytes(*b"Tnak");
pub const MAGIC_JOIN_GROUP: u32 = u32::from_be_bytes(*b"Tjgp");
pub const MAGIC_LEAVE_GROUP: u32 = u32::from_be_bytes(*b"Tlgp");
pub const MAGIC_JOIN_GROUP_NAK: u32 = u32::from_be_bytes(*b"Tjgn");

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RetryKind {
    Retry,
    FastStart,
    Nak,
}

impl RetryKind {
    fn magic(&self) -> u32 {
        match self {
            RetryKind::Retry => MAGIC_RETRY_REQUEST,
            RetryKind::FastStart => MAGIC_FAST_START_REQUEST,
            RetryKind::Nak => MAGIC_RETRY_NAK,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RetryMessage {
    pub kind: RetryKind,
    pub target: SocketAddrV4,
    pub seq_start: SeqNum,
    pub seq_end: SeqNum,
}

impl RetryMessage {
    pub const SERIALIZED_LEN: usize = 4 + 4 + 2 + 2 + 2;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.kind.magic());
        buf.put_u32(self.target.ip().to_bits());
        buf.put_u16(self.target.port());
        buf.put_u16(self.seq_start.to_raw());
        buf.put_u16(self.seq_end.to_raw());
    }

    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(Self::SERIALIZED_LEN);
        self.ser(&mut buf);
        buf
    }

    /// number of sequence numbers in the (inclusive) range
    pub fn range_len(&self) -> u32 {
        self.seq_end.offset_from(self.seq_start) as u32 + 1
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MembershipMessage {
    Join,
    Leave,
    JoinNak,
}

impl MembershipMessage {
    pub const SERIALIZED_LEN: usize = 4;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(match self {
            MembershipMessage::Join => MAGIC_JOIN_GROUP,
            MembershipMessage::Leave => MAGIC_LEAVE_GROUP,
            MembershipMessage::JoinNak => MAGIC_JOIN_GROUP_NAK,
        });
    }

    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(Self::SERIALIZED_LEN);
        self.ser(&mut buf);
        buf
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ControlDatagram {
    Retry(RetryMessage),
    Membership(MembershipMessage),
}

impl ControlDatagram {
    /// RTP datagrams start with version 2 in the top bits, while all magic tags start with an
    ///  ASCII 'T', so the first byte is sufficient to tell them apart
    pub fn is_control_datagram(datagram: &[u8]) -> bool {
        datagram.first() == Some(&b'T')
    }

    pub fn deser(mut buf: &[u8]) -> anyhow::Result<ControlDatagram> {
        let magic = buf.try_get_u32().context("control datagram too short")?;
        let retry_kind = match magic {
            MAGIC_JOIN_GROUP => return Ok(ControlDatagram::Membership(MembershipMessage::Join)),
            MAGIC_LEAVE_GROUP => return Ok(ControlDatagram::Membership(MembershipMessage::Leave)),
            MAGIC_JOIN_GROUP_NAK => return Ok(ControlDatagram::Membership(MembershipMessage::JoinNak)),
            MAGIC_RETRY_REQUEST => RetryKind::Retry,
            MAGIC_FAST_START_REQUEST => RetryKind::FastStart,
            MAGIC_RETRY_NAK => RetryKind::Nak,
            other => bail!("unknown control datagram magic {:#010x}", other),
        };

        let ip = Ipv4Addr::from_bits(buf.try_get_u32().context("retry datagram truncated")?);
        let port = buf.try_get_u16().context("retry datagram truncated")?;
        let seq_start = SeqNum::from_raw(buf.try_get_u16().context("retry datagram truncated")?);
        let seq_end = SeqNum::from_raw(buf.try_get_u16().context("retry datagram truncated")?);

        let msg = RetryMessage {
            kind: retry_kind,
            target: SocketAddrV4::new(ip, port),
            seq_start,
            seq_end,
        };
        if msg.seq_end.is_before(msg.seq_start) {
            bail!("retry range {:?} - {:?} is inverted", msg.seq_start, msg.seq_end);
        }
        Ok(ControlDatagram::Retry(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn retry(kind: RetryKind, start: u16, end: u16) -> RetryMessage {
        RetryMessage {
            kind,
            target: SocketAddrV4::new(Ipv4Addr::new(239, 1, 2, 3), 0x1234),
            seq_start: SeqNum::from_raw(start),
            seq_end: SeqNum::from_raw(end),
        }
    }

    #[rstest]
    #[case::retry(retry(RetryKind::Retry, 4, 4), vec![b'T',b'r',b'e',b'q', 239,1,2,3, 0x12,0x34, 0,4, 0,4])]
    #[case::fast_start(retry(RetryKind::FastStart, 65000, 99), vec![b'T',b'f',b's',b'r', 239,1,2,3, 0x12,0x34, 0xfd,0xe8, 0,99])]
    #[case::nak(retry(RetryKind::Nak, 40, 49), vec![b'T',b'n',b'a',b'k', 239,1,2,3, 0x12,0x34, 0,40, 0,49])]
    fn test_retry_ser_deser(#[case] msg: RetryMessage, #[case] expected: Vec<u8>) {
        let buf = msg.to_bytes();
        assert_eq!(buf.as_ref(), expected.as_slice());
        assert!(ControlDatagram::is_control_datagram(&buf));
        assert_eq!(ControlDatagram::deser(&buf).unwrap(), ControlDatagram::Retry(msg));
    }

    #[rstest]
    #[case::join(MembershipMessage::Join, b"Tjgp")]
    #[case::leave(MembershipMessage::Leave, b"Tlgp")]
    #[case::join_nak(MembershipMessage::JoinNak, b"Tjgn")]
    fn test_membership_ser_deser(#[case] msg: MembershipMessage, #[case] expected: &[u8; 4]) {
        let buf = msg.to_bytes();
        assert_eq!(buf.as_ref(), expected);
        assert_eq!(ControlDatagram::deser(&buf).unwrap(), ControlDatagram::Membership(msg));
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::short_magic(vec![b'T', b'r', b'e'])]
    #[case::unknown_magic(vec![b'T', b'x', b'x', b'x'])]
    #[case::truncated_retry(vec![b'T',b'r',b'e',b'q', 239,1,2,3, 0x12,0x34, 0,4, 0])]
    #[case::magic_only(vec![b'T',b'r',b'e',b'q'])]
    #[case::inverted_range(vec![b'T',b'r',b'e',b'q', 239,1,2,3, 0x12,0x34, 0,5, 0,4])]
    fn test_deser_malformed(#[case] raw: Vec<u8>) {
        assert!(ControlDatagram::deser(&raw).is_err());
    }

    #[test]
    fn test_range_len() {
        assert_eq!(retry(RetryKind::Retry, 4, 4).range_len(), 1);
        assert_eq!(retry(RetryKind::Retry, 65535, 1).range_len(), 3);
    }

    #[test]
    fn test_rtp_is_not_control() {
        assert!(!ControlDatagram::is_control_datagram(&[0x80, 0x64]));
        assert!(!ControlDatagram::is_control_datagram(&[]));
    }
}
