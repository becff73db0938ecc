use crate::clock_transform::LinearTransform;
use crate::common_clock::CommonClock;
use crate::wire::trtp_packet::{AudioFlags, AudioHeader, AudioPayload, CodecType, ControlCommand, TrtpPacket, TrtpPayload};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// An encoded access unit. The presentation time stamp is in microseconds of media time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaUnit {
    pub pts: i64,
    pub data: Bytes,
    pub is_random_access: bool,
}

/// The producer of encoded audio, e.g. a file extractor or a live encoder
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MediaSource: Send {
    fn codec(&self) -> CodecType;

    /// codec specific side data that receivers need to set up their decoders
    fn aux_data(&self) -> Option<Bytes>;

    /// `None` signals the end of the stream
    async fn next_access_unit(&mut self) -> anyhow::Result<Option<MediaUnit>>;
}

/// Where a media sender's packets go: a transmit group client or an endpoint registration.
///  The sink stamps its own program id on the packets.
#[async_trait]
pub trait PacketSink: Send + Sync {
    fn program_id(&self) -> u8;

    async fn send_packet(&self, packet: TrtpPacket) -> anyhow::Result<()>;
}

/// Turns a stream of access units into TRTP packets for a single program.
///
/// Media time is mapped to common time when the first access unit after start or after a
///  flush is sent: that unit is scheduled for presentation at the current common time plus the
///  presentation latency. Receivers get the mapping with every packet.
pub struct MediaSender<S: PacketSink> {
    sink: S,
    clock: Arc<dyn CommonClock>,
    presentation_latency: Duration,
    volume: u8,
    media_to_common: Option<LinearTransform>,
    pending_discontinuity: bool,
}

impl<S: PacketSink> MediaSender<S> {
    pub fn new(sink: S, clock: Arc<dyn CommonClock>, presentation_latency: Duration) -> MediaSender<S> {
        MediaSender {
            sink,
            clock,
            presentation_latency,
            volume: u8::MAX,
            media_to_common: None,
            pending_discontinuity: false,
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    /// takes effect with the next access unit
    pub fn set_volume(&mut self, volume: u8) {
        self.volume = volume;
    }

    /// Fails with a [crate::common_clock::ClockUnavailable] error if the transform needs to be
    ///  established and the common clock can not be read
    pub async fn send_access_unit(&mut self, codec: CodecType, aux_data: Option<Bytes>, unit: MediaUnit) -> anyhow::Result<()> {
        let media_to_common = match self.media_to_common {
            Some(transform) => transform,
            None => {
                let now = self.clock.now()?;
                let latency = i64::try_from(self.presentation_latency.as_micros())
                    .context("presentation latency is out of range")?;
                let b_zero = now.checked_add(latency)
                    .ok_or_else(|| anyhow!("common time {} plus presentation latency {:?} overflows", now, self.presentation_latency))?;
                let transform = LinearTransform {
                    a_zero: unit.pts,
                    b_zero,
                    a_to_b_numer: 1,
                    a_to_b_denom: 1,
                };
                debug!("program {}: media time {} is presented at common time {}", self.sink.program_id(), transform.a_zero, transform.b_zero);
                self.media_to_common = Some(transform);
                transform
            }
        };

        let mut flags = AudioFlags::empty();
        if unit.is_random_access {
            flags |= AudioFlags::RANDOM_ACCESS;
        }
        if self.pending_discontinuity {
            flags |= AudioFlags::DISCONTINUITY;
            self.pending_discontinuity = false;
        }

        let packet = TrtpPacket {
            program_id: self.sink.program_id(),
            substream_id: 0,
            pts: Some(unit.pts),
            clock_transform: Some(media_to_common),
            payload: TrtpPayload::Audio(AudioPayload {
                header: AudioHeader {
                    codec,
                    flags,
                    volume: self.volume,
                    aux_data,
                },
                access_unit: unit.data,
            }),
        };
        self.sink.send_packet(packet).await
    }

    /// Tells receivers to discard everything they buffered for this program. The next access
    ///  unit starts a new timeline.
    pub async fn flush(&mut self) -> anyhow::Result<()> {
        debug!("program {}: flush", self.sink.program_id());
        self.media_to_common = None;
        self.pending_discontinuity = true;
        self.sink.send_packet(TrtpPacket::control(self.sink.program_id(), ControlCommand::Flush)).await
    }

    pub async fn end_of_stream(&mut self) -> anyhow::Result<()> {
        self.sink.send_packet(TrtpPacket::control(self.sink.program_id(), ControlCommand::EndOfStream)).await
    }

    /// Sends everything the source produces, followed by an end-of-stream marker
    pub async fn run(&mut self, source: &mut dyn MediaSource) -> anyhow::Result<()> {
        let codec = source.codec();
        let aux_data = source.aux_data();
        info!("program {}: start sending {:?}", self.sink.program_id(), codec);

        let mut num_units = 0usize;
        while let Some(unit) = source.next_access_unit().await? {
            self.send_access_unit(codec, aux_data.clone(), unit).await?;
            num_units += 1;
        }

        info!("program {}: end of stream after {} access units", self.sink.program_id(), num_units);
        self.end_of_stream().await
    }
}
