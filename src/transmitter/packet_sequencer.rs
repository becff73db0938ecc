use crate::config::TransmitterConfig;
use crate::seq_num::SeqNum;
use crate::transmitter::retry_buffer::RetryBuffer;
use crate::wire::rtp_header::RtpHeader;
use crate::wire::trtp_packet::TrtpPacket;
use bytes::Bytes;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;
use tokio::time::Instant;
use tracing::trace;

static NEXT_EPOCH: OnceLock<AtomicU32> = OnceLock::new();

/// Every sequencer (i.e. every transmit group or endpoint) gets its own epoch, so receivers
///  can tell apart streams that reuse an address. The counter starts at a random value so that
///  a restarted process does not repeat epochs.
pub fn allocate_epoch() -> u32 {
    NEXT_EPOCH.get_or_init(|| AtomicU32::new(rand::random::<u32>()))
        .fetch_add(1, Ordering::Relaxed)
        & RtpHeader::EPOCH_MASK
}

/// Assigns sequence numbers to the datagrams of a single stream and archives them for
///  retransmission
pub struct PacketSequencer {
    epoch: u32,
    next_seq: SeqNum,
    max_datagram_len: usize,
    retry_buffer: RetryBuffer,
}

impl PacketSequencer {
    pub fn new(config: &TransmitterConfig) -> PacketSequencer {
        Self::with_epoch(allocate_epoch(), SeqNum::from_raw(rand::random::<u16>()), config)
    }

    pub fn with_epoch(epoch: u32, first_seq: SeqNum, config: &TransmitterConfig) -> PacketSequencer {
        PacketSequencer {
            epoch,
            next_seq: first_seq,
            max_datagram_len: config.max_datagram_len,
            retry_buffer: RetryBuffer::new(config.retry_buffer_capacity, config.retransmit_packet_ttl),
        }
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    pub fn retry_buffer(&self) -> &RetryBuffer {
        &self.retry_buffer
    }

    pub fn retry_buffer_mut(&mut self) -> &mut RetryBuffer {
        &mut self.retry_buffer
    }

    /// Fragment the packet into sequenced datagrams and archive them. Nothing is archived and
    ///  no sequence numbers are consumed if the packet can not be fragmented.
    pub fn sequence(&mut self, packet: &TrtpPacket, now: Instant) -> anyhow::Result<Vec<Bytes>> {
        let mut seq = self.next_seq;
        let datagrams = packet.to_datagrams(self.epoch, self.max_datagram_len, || {
            let result = seq;
            seq = seq.next();
            result
        })?;
        self.next_seq = seq;

        trace!("sequenced packet for program {} into {} datagrams, next seq is {:?}", packet.program_id, datagrams.len(), self.next_seq);

        Ok(datagrams.into_iter()
            .map(|(seq, datagram)| {
                self.retry_buffer.push(seq, datagram.clone(), now);
                datagram
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::trtp_packet::{AudioFlags, AudioHeader, AudioPayload, CodecType, ControlCommand, TrtpPayload};

    #[test]
    fn test_epochs_are_distinct() {
        let a = allocate_epoch();
        let b = allocate_epoch();
        assert_ne!(a, b);
        assert!(a <= RtpHeader::EPOCH_MASK);
        assert!(b <= RtpHeader::EPOCH_MASK);
    }

    #[test]
    fn test_sequence() {
        let now = Instant::now();
        let mut config = TransmitterConfig::default_ipv4();
        config.max_datagram_len = 12 + 100;
        let mut sequencer = PacketSequencer::with_epoch(17, SeqNum::from_raw(65535), &config);

        let small = TrtpPacket::control(0, ControlCommand::Nop);
        let datagrams = sequencer.sequence(&small, now).unwrap();
        assert_eq!(datagrams.len(), 1);

        let (header, _) = TrtpPacket::decode(&datagrams[0]).unwrap();
        assert_eq!(header.seq, SeqNum::from_raw(65535));
        assert_eq!(header.epoch, 17);

        let big = TrtpPacket {
            program_id: 1,
            substream_id: 0,
            pts: None,
            clock_transform: None,
            payload: TrtpPayload::Audio(AudioPayload {
                header: AudioHeader { codec: CodecType::Mpeg1Audio, flags: AudioFlags::RANDOM_ACCESS, volume: 255, aux_data: None },
                access_unit: Bytes::from(vec![0; 40]),
            }),
        };
        let mut config_tiny = config.clone();
        config_tiny.max_datagram_len = 12 + 20;
        let mut tiny_sequencer = PacketSequencer::with_epoch(17, SeqNum::from_raw(0), &config_tiny);
        // 6 byte TRTP header, 3 byte audio header and 40 bytes of payload
        assert_eq!(tiny_sequencer.sequence(&big, now).unwrap().len(), 3);
        assert_eq!(tiny_sequencer.retry_buffer().newest_seq(), Some(SeqNum::from_raw(2)));

        let datagrams = sequencer.sequence(&small, now).unwrap();
        let (header, _) = TrtpPacket::decode(&datagrams[0]).unwrap();
        assert_eq!(header.seq, SeqNum::from_raw(0));
        assert_eq!(sequencer.retry_buffer().len(), 2);
    }
}
