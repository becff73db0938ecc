use crate::clock_transform::LinearTransform;
use crate::receiver::codec_params::{CodecParams, CodecParamsInput};
use crate::receiver::decoder::{AudioDecoder, DecoderFactory};
use crate::wire::rtp_header::RtpHeader;
use crate::wire::trtp_packet::{AudioFlags, AudioPayload, ControlCommand, TrtpPacket, TrtpPayload};
use bytes::{BufMut, Bytes, BytesMut};
use rustc_hash::{FxHashMap, FxHashSet};
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Upper bound for the declared size of a (reassembled) packet, protecting against bogus length
///  fields
const MAX_PACKET_LEN: usize = 1 << 20;

/// A datagram with a parsed RTP header, as it is buffered in the ring buffer
#[derive(Clone, Debug)]
pub struct ReceivedDatagram {
    pub header: RtpHeader,
    /// everything after the RTP header
    pub payload: Bytes,
}

impl ReceivedDatagram {
    pub fn parse(datagram: Bytes) -> anyhow::Result<ReceivedDatagram> {
        let mut buf = datagram;
        let header = RtpHeader::deser(&mut buf)?;
        Ok(ReceivedDatagram {
            header,
            payload: buf,
        })
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct FlowId {
    pub program_id: u8,
    pub substream_id: u8,
}

impl FlowId {
    pub fn new(program_id: u8, substream_id: u8) -> FlowId {
        FlowId { program_id, substream_id }
    }

    fn of(header: &RtpHeader) -> FlowId {
        FlowId::new(header.program_id, header.substream_id)
    }
}

impl Debug for FlowId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "FLOW{{{}/{}}}", self.program_id, self.substream_id)
    }
}

struct PartialPacket {
    marker_header: RtpHeader,
    expected_len: usize,
    buf: BytesMut,
}

/// A single elementary audio stream with its decoder
struct Flow {
    id: FlowId,
    decoder: Option<Box<dyn AudioDecoder>>,
    params_input: Option<CodecParamsInput>,
    params: Option<CodecParams>,
    volume: Option<u8>,
    transform: Option<LinearTransform>,
    seen_random_access_point: bool,
    discontinuity_pending: bool,
    end_of_stream: bool,
    last_activity: Instant,
    fatal: Option<String>,
}

impl Flow {
    fn new(id: FlowId, now: Instant) -> Flow {
        Flow {
            id,
            decoder: None,
            params_input: None,
            params: None,
            volume: None,
            transform: None,
            seen_random_access_point: false,
            discontinuity_pending: true,
            end_of_stream: false,
            last_activity: now,
            fatal: None,
        }
    }

    fn handle_audio(&mut self, decoder_factory: &dyn DecoderFactory, pts: Option<i64>, transform: Option<LinearTransform>, audio: AudioPayload) {
        if self.fatal.is_some() {
            return;
        }
        let AudioPayload { header, access_unit } = audio;

        if header.flags.contains(AudioFlags::DISCONTINUITY) {
            self.discontinuity_pending = true;
        }

        if !self.seen_random_access_point {
            if !header.flags.contains(AudioFlags::RANDOM_ACCESS) {
                trace!("{:?}: waiting for a random access point - dropping access unit", self.id);
                return;
            }
            self.seen_random_access_point = true;
        }

        let params_input = CodecParamsInput::of(header.codec, header.aux_data.as_ref(), &access_unit);
        if self.params_input.as_ref() != Some(&params_input) {
            match CodecParams::derive(header.codec, header.aux_data.as_ref(), &access_unit) {
                Ok(params) => {
                    self.params_input = Some(params_input);
                    if self.params.as_ref() != Some(&params) {
                        self.recreate_decoder(decoder_factory, params);
                    }
                }
                Err(e) => {
                    debug!("{:?}: invalid codec parameters - dropping access unit: {}", self.id, e);
                    return;
                }
            }
        }

        let Some(decoder) = self.decoder.as_mut() else {
            return;
        };

        if self.volume != Some(header.volume) {
            decoder.set_volume(header.volume);
            self.volume = Some(header.volume);
        }
        if let Some(transform) = transform {
            if self.transform != Some(transform) {
                decoder.set_media_to_common_transform(transform);
                self.transform = Some(transform);
            }
        }

        trace!("{:?}: queueing access unit of {} bytes, PTS {:?}", self.id, access_unit.len(), pts);
        decoder.queue_access_unit(access_unit, pts, std::mem::take(&mut self.discontinuity_pending));

        self.end_of_stream = header.flags.contains(AudioFlags::END_OF_STREAM);
        if self.end_of_stream {
            debug!("{:?}: end of stream", self.id);
            decoder.end_of_stream();
        }
    }

    fn recreate_decoder(&mut self, decoder_factory: &dyn DecoderFactory, params: CodecParams) {
        if self.decoder.take().is_some() {
            info!("{:?}: codec parameters changed to {:?} - recreating the decoder", self.id, params);
        }
        else {
            debug!("{:?}: creating decoder for {:?}", self.id, params);
        }

        match decoder_factory.create_decoder(self.id.program_id, self.id.substream_id, &params) {
            Ok(decoder) => {
                self.decoder = Some(decoder);
                self.volume = None;
                self.transform = None;
                self.discontinuity_pending = true;
            }
            Err(e) => {
                warn!("{:?}: creating decoder failed: {}", self.id, e);
                self.fatal = Some(format!("creating decoder for {:?} failed: {}", self.id, e));
            }
        }
        self.params = Some(params);
    }

    fn flush(&mut self) {
        if let Some(decoder) = self.decoder.as_mut() {
            decoder.flush();
        }
    }

    fn signal_end_of_stream(&mut self) {
        if self.end_of_stream {
            return;
        }
        self.end_of_stream = true;
        if let Some(decoder) = self.decoder.as_mut() {
            decoder.end_of_stream();
        }
    }

    fn is_about_to_underflow(&self) -> bool {
        self.decoder.as_ref()
            .is_some_and(|d| d.is_about_to_underflow())
    }

    fn fatal_error(&self) -> Option<String> {
        self.fatal.clone()
            .or_else(|| self.decoder.as_ref().and_then(|d| d.fatal_error()))
    }
}

/// Demultiplexes in-order datagrams by flow, reassembles fragmented packets and feeds audio
///  to per-flow decoders. Control packets for program 0 apply to all flows.
pub struct FlowTable {
    decoder_factory: Arc<dyn DecoderFactory>,
    flow_expiry_timeout: Duration,
    flows: FxHashMap<FlowId, Flow>,
    partial_packets: FxHashMap<FlowId, PartialPacket>,
    /// program ids from the transmitter's most recent heartbeat
    active_programs: Option<FxHashSet<u8>>,
}

impl FlowTable {
    pub fn new(decoder_factory: Arc<dyn DecoderFactory>, flow_expiry_timeout: Duration) -> FlowTable {
        FlowTable {
            decoder_factory,
            flow_expiry_timeout,
            flows: Default::default(),
            partial_packets: Default::default(),
            active_programs: None,
        }
    }

    /// drop all flows and their decoders
    pub fn reset(&mut self) {
        if !self.flows.is_empty() {
            debug!("dropping {} flows", self.flows.len());
        }
        self.flows.clear();
        self.partial_packets.clear();
        self.active_programs = None;
    }

    pub fn num_flows(&self) -> usize {
        self.flows.len()
    }

    pub fn has_flow(&self, id: FlowId) -> bool {
        self.flows.contains_key(&id)
    }

    /// Process the next datagram in sequence. `discontinuity` is set if datagrams were skipped
    ///  before this one, invalidating all packets that are currently being reassembled.
    pub fn process_datagram(&mut self, datagram: ReceivedDatagram, discontinuity: bool, now: Instant) {
        if discontinuity {
            if !self.partial_packets.is_empty() {
                debug!("discarding {} incomplete packets after a discontinuity", self.partial_packets.len());
                self.partial_packets.clear();
            }
            for flow in self.flows.values_mut() {
                flow.discontinuity_pending = true;
            }
        }

        let id = FlowId::of(&datagram.header);
        if let Some(flow) = self.flows.get_mut(&id) {
            flow.last_activity = now;
        }

        if datagram.header.marker {
            self.on_marker_datagram(id, datagram, now);
        }
        else {
            self.on_continuation_datagram(id, datagram, now);
        }
    }

    fn on_marker_datagram(&mut self, id: FlowId, datagram: ReceivedDatagram, now: Instant) {
        if self.partial_packets.remove(&id).is_some() {
            debug!("{:?}: packet {:?} starts before the previous packet was complete - discarding the incomplete packet", id, datagram.header.seq);
        }

        let expected_len = match TrtpPacket::total_payload_len(&datagram.payload, datagram.header.timestamp) {
            Ok(len) => len,
            Err(e) => {
                debug!("malformed TRTP header in {:?} - dropping: {}", datagram.header, e);
                return;
            }
        };
        if expected_len > MAX_PACKET_LEN {
            debug!("{:?}: declared packet length {} exceeds the maximum - dropping", datagram.header, expected_len);
            return;
        }

        if datagram.payload.len() >= expected_len {
            self.decode_and_dispatch(&datagram.header, &datagram.payload, now);
        }
        else {
            trace!("{:?}: starting reassembly of {} bytes", datagram.header, expected_len);
            let mut buf = BytesMut::with_capacity(expected_len);
            buf.put_slice(&datagram.payload);
            self.partial_packets.insert(id, PartialPacket {
                marker_header: datagram.header,
                expected_len,
                buf,
            });
        }
    }

    fn on_continuation_datagram(&mut self, id: FlowId, datagram: ReceivedDatagram, now: Instant) {
        let Some(partial) = self.partial_packets.get_mut(&id) else {
            trace!("continuation datagram {:?} without a packet in progress - dropping", datagram.header);
            return;
        };

        if partial.buf.len() + datagram.payload.len() > partial.expected_len {
            debug!("{:?}: received more than the declared {} bytes - dropping the packet", id, partial.expected_len);
            self.partial_packets.remove(&id);
            return;
        }

        partial.buf.put_slice(&datagram.payload);
        let is_complete = partial.buf.len() == partial.expected_len;

        if is_complete {
            if let Some(partial) = self.partial_packets.remove(&id) {
                self.decode_and_dispatch(&partial.marker_header, &partial.buf, now);
            }
        }
    }

    fn decode_and_dispatch(&mut self, header: &RtpHeader, payload: &[u8], now: Instant) {
        let packet = match TrtpPacket::decode_payload(header, payload) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("malformed TRTP packet {:?} - dropping: {}", header, e);
                return;
            }
        };

        let id = FlowId::of(header);
        match packet.payload {
            TrtpPayload::Audio(audio) => {
                if id.program_id == 0 {
                    debug!("audio packet {:?} for reserved program id 0 - dropping", header);
                    return;
                }
                let decoder_factory = self.decoder_factory.as_ref();
                let flow = self.flows.entry(id)
                    .or_insert_with(|| {
                        debug!("new flow {:?}", id);
                        Flow::new(id, now)
                    });
                flow.handle_audio(decoder_factory, packet.pts, packet.clock_transform, audio);
            }
            TrtpPayload::Control(command) => self.handle_control(id.program_id, command, now),
        }
    }

    fn handle_control(&mut self, program_id: u8, command: ControlCommand, now: Instant) {
        let applies_to = |id: &FlowId| program_id == 0 || id.program_id == program_id;

        match command {
            ControlCommand::Nop => {
                trace!("NOP for program {}", program_id);
            }
            ControlCommand::Flush => {
                self.flows.retain(|id, flow| {
                    if applies_to(id) {
                        debug!("flushing {:?}", id);
                        flow.flush();
                        false
                    }
                    else {
                        true
                    }
                });
                self.partial_packets.retain(|id, _| !applies_to(id));
            }
            ControlCommand::EndOfStream => {
                for (id, flow) in self.flows.iter_mut() {
                    if applies_to(id) {
                        debug!("{:?}: end of stream", id);
                        flow.signal_end_of_stream();
                    }
                }
            }
            ControlCommand::ActiveProgramUpdate(program_ids) => {
                trace!("active programs: {:?}", program_ids);
                let active: FxHashSet<u8> = program_ids.into_iter().collect();
                for (id, flow) in self.flows.iter_mut() {
                    if active.contains(&id.program_id) {
                        flow.last_activity = now;
                    }
                }
                self.active_programs = Some(active);
            }
        }
    }

    /// Remove flows that did not receive data for the expiry timeout, unless the transmitter's
    ///  most recent heartbeat lists their program as active
    pub fn expire_flows(&mut self, now: Instant) {
        let timeout = self.flow_expiry_timeout;
        let active_programs = &self.active_programs;

        self.flows.retain(|id, flow| {
            if now < flow.last_activity + timeout {
                return true;
            }
            if active_programs.as_ref().is_some_and(|active| active.contains(&id.program_id)) {
                flow.last_activity = now;
                return true;
            }
            debug!("{:?} expired", id);
            false
        });
    }

    pub fn next_expiry_deadline(&self) -> Option<Instant> {
        self.flows.values()
            .map(|flow| flow.last_activity + self.flow_expiry_timeout)
            .min()
    }

    pub fn is_any_about_to_underflow(&self) -> bool {
        self.flows.values().any(|flow| flow.is_about_to_underflow())
    }

    pub fn fatal_error(&self) -> Option<String> {
        self.flows.values().find_map(|flow| flow.fatal_error())
    }
}
