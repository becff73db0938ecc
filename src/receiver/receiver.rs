use crate::config::ReceiverConfig;
use crate::receiver::decoder::DecoderFactory;
use crate::receiver::gap_controller::{GapAction, GapController};
use crate::receiver::ring_buffer::{Gap, RingBuffer};
use crate::receiver::substream::{FlowTable, ReceivedDatagram};
use crate::wire::control_messages::{ControlDatagram, MembershipMessage, RetryKind, RetryMessage};
use anyhow::bail;
use bytes::Bytes;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, trace, warn};

struct ReceiverShared {
    enabled: AtomicBool,
    shutdown: AtomicBool,
    wakeup: Notify,
    fatal_error: RwLock<Option<String>>,
}

/// A TRTP receiver: it receives a single transmit group's stream (multicast, or unicast from a
///  transmitter's command-and-control address), requests retransmission of lost datagrams and
///  feeds the reassembled audio to decoders.
///
/// All protocol state lives in a single worker task. The handle only interacts with it through
///  flags and a wakeup notification.
pub struct Receiver {
    shared: Arc<ReceiverShared>,
    local_addr: SocketAddr,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Receiver {
    /// Binds the socket and starts the worker task. The receiver starts out enabled.
    pub async fn start(config: ReceiverConfig, decoder_factory: Arc<dyn DecoderFactory>) -> anyhow::Result<Receiver> {
        config.validate()?;
        let SocketAddr::V4(source) = config.source_addr else {
            bail!("only IP V4 sources are supported");
        };

        let socket = if config.is_multicast() {
            let socket = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], source.port()))).await?;
            socket.join_multicast_v4(*source.ip(), config.multicast_interface)?;
            info!("joined multicast group {:?} on interface {:?}", source, config.multicast_interface);
            socket
        }
        else {
            UdpSocket::bind(config.unicast_bind_addr).await?
        };
        let local_addr = socket.local_addr()?;
        info!("bound receive socket to {:?}, source is {:?}", local_addr, source);

        let shared = Arc::new(ReceiverShared {
            enabled: AtomicBool::new(true),
            shutdown: AtomicBool::new(false),
            wakeup: Notify::new(),
            fatal_error: RwLock::new(None),
        });

        let worker = ReceiverWorker::new(config, source, socket, decoder_factory, shared.clone());
        let handle = tokio::spawn(worker.run());

        Ok(Receiver {
            shared,
            local_addr,
            worker: Mutex::new(Some(handle)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// A disabled receiver discards everything it receives and leaves its unicast group
    pub fn set_enabled(&self, enabled: bool) {
        self.shared.enabled.store(enabled, Ordering::Release);
        self.shared.wakeup.notify_one();
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::Acquire)
    }

    /// the error that caused the worker to terminate, if any
    pub async fn fatal_error(&self) -> Option<String> {
        self.shared.fatal_error.read().await.clone()
    }

    /// Stop the worker and wait for it to terminate. Calling this more than once is harmless.
    pub async fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.wakeup.notify_one();

        if let Some(handle) = self.worker.lock().await.take() {
            if let Err(e) = handle.await {
                error!("receiver worker terminated abnormally: {}", e);
            }
        }
    }
}

struct ReceiverWorker {
    config: ReceiverConfig,
    socket: UdpSocket,
    shared: Arc<ReceiverShared>,

    /// multicast group or the transmitter's command-and-control address
    source: SocketAddrV4,
    /// where retry requests are sent. For multicast sources, this is learned from incoming
    ///  datagrams.
    transmitter_addr: Option<SocketAddr>,

    ring: RingBuffer<ReceivedDatagram>,
    gaps: GapController,
    flows: FlowTable,
    current_epoch: Option<u32>,

    was_enabled: bool,
    next_membership_report: Option<Instant>,
}

impl ReceiverWorker {
    fn new(config: ReceiverConfig, source: SocketAddrV4, socket: UdpSocket, decoder_factory: Arc<dyn DecoderFactory>, shared: Arc<ReceiverShared>) -> ReceiverWorker {
        let is_multicast = config.is_multicast();
        ReceiverWorker {
            ring: RingBuffer::new(config.ring_buffer_capacity),
            gaps: GapController::new(&config),
            flows: FlowTable::new(decoder_factory, config.flow_expiry_timeout),
            config,
            socket,
            shared,
            source,
            transmitter_addr: if is_multicast { None } else { Some(SocketAddr::V4(source)) },
            current_epoch: None,
            was_enabled: false,
            next_membership_report: None,
        }
    }

    async fn run(mut self) {
        info!("starting receiver for {:?}", self.source);

        let mut buf = vec![0u8; self.config.max_datagram_len];
        loop {
            if self.shared.shutdown.load(Ordering::Acquire) {
                break;
            }

            let enabled = self.shared.enabled.load(Ordering::Acquire);
            if enabled != self.was_enabled {
                self.on_enabled_changed(enabled).await;
            }

            if enabled {
                self.on_timers(Instant::now()).await;
            }

            if let Some(msg) = self.flows.fatal_error() {
                error!("decoder failed, stopping the receiver: {}", msg);
                *self.shared.fatal_error.write().await = Some(msg);
                break;
            }

            let deadline = self.next_deadline(Instant::now());
            let received = tokio::select! {
                r = self.socket.recv_from(&mut buf) => Some(r),
                _ = self.shared.wakeup.notified() => None,
                _ = sleep_until(deadline) => None,
            };

            match received {
                Some(Ok((num_read, from))) => self.on_datagram(&buf[..num_read], from, Instant::now()).await,
                Some(Err(e)) => warn!("socket error: {}", e),
                None => {}
            }

            // process everything that is ready before waiting again
            loop {
                match self.socket.try_recv_from(&mut buf) {
                    Ok((num_read, from)) => self.on_datagram(&buf[..num_read], from, Instant::now()).await,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        warn!("socket error: {}", e);
                        break;
                    }
                }
            }
        }

        if self.was_enabled {
            self.leave_group().await;
        }
        self.reset_pipeline();
        info!("receiver for {:?} stopped", self.source);
    }

    async fn on_enabled_changed(&mut self, enabled: bool) {
        self.was_enabled = enabled;
        if enabled {
            info!("receiver enabled");
            if !self.config.is_multicast() {
                self.next_membership_report = Some(Instant::now());
            }
        }
        else {
            info!("receiver disabled");
            self.leave_group().await;
            self.next_membership_report = None;
            self.reset_pipeline();
        }
    }

    fn reset_pipeline(&mut self) {
        debug!("resetting the receive pipeline");
        self.ring.reset();
        self.gaps.reset();
        self.flows.reset();
        self.current_epoch = None;
    }

    fn next_deadline(&self, now: Instant) -> Instant {
        let inactivity_deadline = self.ring
            .time_until_inactivity_timeout(now, self.config.inactivity_timeout)
            .map(|d| now + d);

        [
            self.gaps.next_deadline(),
            inactivity_deadline,
            self.flows.next_expiry_deadline(),
            self.next_membership_report,
        ]
            .into_iter()
            .flatten()
            .min()
            .unwrap_or(now + Duration::from_secs(60))
    }

    async fn on_timers(&mut self, now: Instant) {
        self.process_ring(now).await;

        self.flows.expire_flows(now);

        if self.ring.time_until_inactivity_timeout(now, self.config.inactivity_timeout) == Some(Duration::ZERO) {
            info!("no data received for {:?} - resetting", self.config.inactivity_timeout);
            self.reset_pipeline();
        }

        if let Some(report_due) = self.next_membership_report {
            if now >= report_due {
                self.send_membership(MembershipMessage::Join).await;
                self.next_membership_report = Some(now + self.config.membership_report_interval);
            }
        }
    }

    async fn on_datagram(&mut self, datagram: &[u8], from: SocketAddr, now: Instant) {
        trace!("received {} bytes from {:?}", datagram.len(), from);

        if !self.was_enabled {
            trace!("receiver is disabled - dropping datagram");
            return;
        }
        if !self.config.is_multicast() && from != SocketAddr::V4(self.source) {
            debug!("datagram from unexpected address {:?} - dropping", from);
            return;
        }

        if ControlDatagram::is_control_datagram(datagram) {
            self.on_control_datagram(datagram, now);
        }
        else {
            self.on_rtp_datagram(datagram, from, now);
        }
        self.process_ring(now).await;
    }

    fn on_control_datagram(&mut self, datagram: &[u8], now: Instant) {
        match ControlDatagram::deser(datagram) {
            Ok(ControlDatagram::Retry(msg)) if msg.kind == RetryKind::Nak => {
                if msg.target != self.source {
                    debug!("NAK for other target {:?} - ignoring", msg.target);
                    return;
                }
                self.gaps.on_nak(&mut self.ring, Gap::new(msg.seq_start, msg.seq_end));
                self.drain_ring(now);
            }
            Ok(ControlDatagram::Membership(MembershipMessage::JoinNak)) => {
                warn!("transmitter rejected group membership - retrying with the next report");
            }
            Ok(other) => {
                debug!("unexpected control datagram {:?} - ignoring", other);
            }
            Err(e) => {
                debug!("malformed control datagram - dropping: {}", e);
            }
        }
    }

    fn on_rtp_datagram(&mut self, datagram: &[u8], from: SocketAddr, now: Instant) {
        let received = match ReceivedDatagram::parse(Bytes::copy_from_slice(datagram)) {
            Ok(received) => received,
            Err(e) => {
                debug!("malformed datagram from {:?} - dropping: {}", from, e);
                return;
            }
        };

        if self.config.is_multicast() && self.transmitter_addr != Some(from) {
            debug!("transmitter address for {:?} is {:?}", self.source, from);
            self.transmitter_addr = Some(from);
        }

        let epoch = received.header.epoch;
        match self.current_epoch {
            Some(current) if current != epoch => {
                info!("transmitter epoch changed from {} to {} - resetting", current, epoch);
                self.reset_pipeline();
                self.current_epoch = Some(epoch);
            }
            None => {
                self.current_epoch = Some(epoch);
            }
            _ => {}
        }

        let seq = received.header.seq;
        match self.ring.push(received.clone(), seq, now) {
            Ok(outcome) => trace!("{:?}: {:?}", seq, outcome),
            Err(overflow) => {
                warn!("{} - resetting", overflow);
                self.reset_pipeline();
                self.current_epoch = Some(epoch);
                if let Err(e) = self.ring.push(received, seq, now) {
                    error!("ring buffer rejected the first packet after a reset: {}", e);
                }
            }
        }
    }

    /// returns the number of datagrams handed to the flows
    fn drain_ring(&mut self, now: Instant) -> usize {
        let mut num_drained = 0;
        while let Some((datagram, discontinuity)) = self.ring.fetch() {
            self.flows.process_datagram(datagram, discontinuity, now);
            num_drained += 1;
        }
        num_drained
    }

    async fn process_ring(&mut self, now: Instant) {
        self.drain_ring(now);

        loop {
            let action = {
                let flows = &self.flows;
                self.gaps.process(&mut self.ring, now, || flows.is_any_about_to_underflow())
            };
            if let Some(action) = action {
                self.send_gap_request(action).await;
            }

            // a skipped gap releases buffered packets, and the next gap only shows after them
            if self.drain_ring(now) == 0 {
                break;
            }
        }
    }

    async fn send_gap_request(&mut self, action: GapAction) {
        let Some(to) = self.transmitter_addr else {
            debug!("transmitter address is not known yet - can not send {:?}", action);
            return;
        };

        let (kind, gap) = match action {
            GapAction::RequestRetry(gap) => (RetryKind::Retry, gap),
            GapAction::RequestFastStart(gap) => (RetryKind::FastStart, gap),
        };
        let msg = RetryMessage {
            kind,
            target: self.source,
            seq_start: gap.start,
            seq_end: gap.end,
        };
        trace!("sending {:?} to {:?}", msg, to);
        self.send_to(&msg.to_bytes(), to).await;
    }

    async fn send_membership(&mut self, msg: MembershipMessage) {
        if let Some(to) = self.transmitter_addr {
            trace!("sending {:?} to {:?}", msg, to);
            self.send_to(&msg.to_bytes(), to).await;
        }
    }

    async fn leave_group(&mut self) {
        if !self.config.is_multicast() {
            self.send_membership(MembershipMessage::Leave).await;
        }
    }

    async fn send_to(&mut self, buf: &[u8], to: SocketAddr) {
        if let Err(e) = self.socket.send_to(buf, to).await {
            warn!("error sending to {:?}: {}", to, e);
        }
    }
}
