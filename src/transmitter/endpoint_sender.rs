use crate::config::TransmitterConfig;
use crate::transmitter::media_sender::PacketSink;
use crate::transmitter::packet_sequencer::PacketSequencer;
use crate::transmitter::send_socket::{SendSocket, TrtpSocket};
use crate::transmitter::tx_group::send_retry_reply;
use crate::wire::control_messages::{ControlDatagram, RetryKind};
use crate::wire::trtp_packet::{ControlCommand, TrtpPacket};
use anyhow::{anyhow, bail};
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, trace, warn};

struct Endpoint {
    sequencer: PacketSequencer,
    program_ids: BTreeSet<u8>,
}

struct EndpointSenderState {
    endpoints: FxHashMap<SocketAddr, Endpoint>,
    next_heartbeat: Instant,
    next_trim: Instant,
}

/// Sends streams directly to individual unicast endpoints, without group membership. Each
///  endpoint has its own sequence space and retry buffer, and several producers can share an
///  endpoint with different program ids.
///
/// An endpoint is dropped when it has no producers left and its retry buffer drained.
pub struct EndpointSender {
    config: Arc<TransmitterConfig>,
    send_socket: Arc<dyn SendSocket>,
    state: Mutex<EndpointSenderState>,
    shutdown: AtomicBool,
    wakeup: Notify,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EndpointSender {
    pub fn new(config: Arc<TransmitterConfig>, send_socket: Arc<dyn SendSocket>) -> EndpointSender {
        let now = Instant::now();
        let next_trim = now + config.retry_trim_interval;
        EndpointSender {
            config,
            send_socket,
            state: Mutex::new(EndpointSenderState {
                endpoints: FxHashMap::default(),
                next_heartbeat: now,
                next_trim,
            }),
            shutdown: AtomicBool::new(false),
            wakeup: Notify::new(),
            worker: Default::default(),
        }
    }

    /// Bind the socket and start the background task that answers retry requests and sends
    ///  heartbeats
    pub async fn start(config: TransmitterConfig, bind_addr: SocketAddr) -> anyhow::Result<Arc<EndpointSender>> {
        config.validate()?;

        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        let send_socket = TrtpSocket::new(socket.clone())?;
        info!("endpoint sender bound to {:?}", send_socket.local_addr());

        let sender = Arc::new(EndpointSender::new(Arc::new(config), Arc::new(send_socket)));
        let handle = tokio::spawn(sender.clone().run(socket));
        *sender.worker.lock().await = Some(handle);
        Ok(sender)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.send_socket.local_addr()
    }

    pub async fn num_endpoints(&self) -> usize {
        self.state.lock().await.endpoints.len()
    }

    /// Allocate a program id for a new producer sending to `addr`
    pub async fn register(self: &Arc<Self>, addr: SocketAddr) -> anyhow::Result<EndpointRegistration> {
        let program_id = self.allocate_program_id(addr).await?;
        info!("registered producer with program id {} for endpoint {:?}", program_id, addr);
        self.wakeup.notify_one();
        Ok(EndpointRegistration {
            sender: self.clone(),
            addr,
            program_id,
        })
    }

    async fn allocate_program_id(&self, addr: SocketAddr) -> anyhow::Result<u8> {
        let mut state = self.state.lock().await;
        if !state.endpoints.contains_key(&addr) && state.endpoints.len() >= self.config.max_endpoints {
            bail!("maximum number of {} endpoints reached", self.config.max_endpoints);
        }

        let endpoint = state.endpoints.entry(addr)
            .or_insert_with(|| {
                debug!("new endpoint {:?}", addr);
                Endpoint {
                    sequencer: PacketSequencer::new(&self.config),
                    program_ids: BTreeSet::new(),
                }
            });

        let program_id = (1..=TransmitterConfig::MAX_PROGRAM_ID)
            .find(|id| !endpoint.program_ids.contains(id))
            .ok_or_else(|| anyhow!("no free program id for endpoint {:?}", addr))?;
        endpoint.program_ids.insert(program_id);
        Ok(program_id)
    }

    pub async fn unregister(&self, addr: SocketAddr, program_id: u8) {
        let mut state = self.state.lock().await;
        let removed = state.endpoints.get_mut(&addr)
            .is_some_and(|endpoint| endpoint.program_ids.remove(&program_id));
        if removed {
            info!("unregistered program id {} from endpoint {:?}", program_id, addr);
        }
        else {
            warn!("unregistering unknown program id {} for endpoint {:?}", program_id, addr);
        }
    }

    pub async fn send_packet(&self, addr: SocketAddr, packet: &TrtpPacket) -> anyhow::Result<()> {
        let datagrams = {
            let mut state = self.state.lock().await;
            let endpoint = state.endpoints.get_mut(&addr)
                .ok_or_else(|| anyhow!("no registered endpoint {:?}", addr))?;
            endpoint.sequencer.sequence(packet, Instant::now())?
        };

        for datagram in &datagrams {
            self.send_socket.send_datagram(addr, datagram).await;
        }
        Ok(())
    }

    /// Retry requests are answered from the retry buffer of the endpoint they come from
    pub async fn on_control_datagram(&self, datagram: &[u8], from: SocketAddr) {
        let request = match ControlDatagram::deser(datagram) {
            Ok(ControlDatagram::Retry(request)) if request.kind != RetryKind::Nak => request,
            Ok(other) => {
                trace!("endpoint sender: ignoring {:?} from {:?}", other, from);
                return;
            }
            Err(e) => {
                debug!("endpoint sender: malformed control datagram from {:?} - dropping: {}", from, e);
                return;
            }
        };

        if request.target.port() != self.local_addr().port() {
            debug!("endpoint sender: retry request for other target {:?} - ignoring", request.target);
            return;
        }

        let plan = {
            let state = self.state.lock().await;
            let Some(endpoint) = state.endpoints.get(&from) else {
                debug!("endpoint sender: retry request from unknown endpoint {:?} - ignoring", from);
                return;
            };
            endpoint.sequencer.retry_buffer().plan_retry(request.seq_start, request.seq_end, request.kind == RetryKind::FastStart)
        };

        debug!("endpoint sender: {:?} from {:?} for {:?}-{:?}: resending {}, NAK {:?}", request.kind, from, request.seq_start, request.seq_end, plan.resend.len(), plan.naks);
        send_retry_reply(self.send_socket.as_ref(), from, request.target, plan).await;
    }

    /// Trim retry buffers, collect drained endpoints without producers and send heartbeats.
    ///  Returns the time of the next maintenance action.
    pub async fn do_maintenance(&self, now: Instant) -> Instant {
        let mut outgoing = Vec::new();

        let next_deadline = {
            let mut state = self.state.lock().await;

            if now >= state.next_trim {
                state.next_trim = now + self.config.retry_trim_interval;
                state.endpoints.retain(|addr, endpoint| {
                    endpoint.sequencer.retry_buffer_mut().trim(now);
                    let is_alive = !endpoint.program_ids.is_empty() || !endpoint.sequencer.retry_buffer().is_empty();
                    if !is_alive {
                        debug!("endpoint {:?} has no producers and no pending retransmissions - dropping it", addr);
                    }
                    is_alive
                });
            }

            if now >= state.next_heartbeat {
                state.next_heartbeat = now + self.config.heartbeat_interval;
                for (addr, endpoint) in state.endpoints.iter_mut() {
                    if endpoint.program_ids.is_empty() {
                        continue;
                    }
                    let program_ids = endpoint.program_ids.iter().cloned().collect();
                    let heartbeat = TrtpPacket::control(0, ControlCommand::ActiveProgramUpdate(program_ids));
                    match endpoint.sequencer.sequence(&heartbeat, now) {
                        Ok(datagrams) => outgoing.extend(datagrams.into_iter().map(|d| (*addr, d))),
                        Err(e) => warn!("endpoint {:?}: error sequencing heartbeat: {}", addr, e),
                    }
                }
            }

            state.next_trim.min(state.next_heartbeat)
        };

        for (to, datagram) in &outgoing {
            self.send_socket.send_datagram(*to, datagram).await;
        }
        next_deadline
    }

    /// Stop the background task. Calling this more than once is harmless.
    pub async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.wakeup.notify_one();

        if let Some(handle) = self.worker.lock().await.take() {
            if let Err(e) = handle.await {
                error!("endpoint sender terminated abnormally: {}", e);
            }
        }
    }

    async fn run(self: Arc<Self>, socket: Arc<UdpSocket>) {
        info!("starting endpoint sender");

        let mut buf = vec![0u8; self.config.max_datagram_len];
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }

            let deadline = self.do_maintenance(Instant::now()).await;

            let received = tokio::select! {
                r = socket.recv_from(&mut buf) => Some(r),
                _ = self.wakeup.notified() => None,
                _ = sleep_until(deadline) => None,
            };

            match received {
                Some(Ok((num_read, from))) => self.on_control_datagram(&buf[..num_read], from).await,
                Some(Err(e)) => warn!("endpoint sender: socket error: {}", e),
                None => {}
            }
        }

        info!("endpoint sender stopped");
    }
}

/// A producer's handle for sending to an endpoint with its own program id
pub struct EndpointRegistration {
    sender: Arc<EndpointSender>,
    addr: SocketAddr,
    program_id: u8,
}

impl EndpointRegistration {
    pub fn endpoint_addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn unregister(self) {
        self.sender.unregister(self.addr, self.program_id).await;
    }
}

#[async_trait]
impl PacketSink for EndpointRegistration {
    fn program_id(&self) -> u8 {
        self.program_id
    }

    async fn send_packet(&self, mut packet: TrtpPacket) -> anyhow::Result<()> {
        packet.program_id = self.program_id;
        self.sender.send_packet(self.addr, &packet).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transmitter::tx_group::tests::{recording_socket, SentDatagrams};
    use crate::wire::control_messages::RetryMessage;
    use crate::wire::rtp_header::RtpHeader;
    use crate::wire::trtp_packet::TrtpPayload;
    use std::time::Duration;

    const LOCAL: &str = "0.0.0.0:6000";

    fn sender(config: TransmitterConfig) -> (Arc<EndpointSender>, SentDatagrams) {
        let (socket, sent) = recording_socket(LOCAL.parse().unwrap());
        (Arc::new(EndpointSender::new(Arc::new(config), socket)), sent)
    }

    fn take(sent: &SentDatagrams) -> Vec<(SocketAddr, Vec<u8>)> {
        std::mem::take(&mut *sent.lock().unwrap())
    }

    #[tokio::test]
    async fn test_register_and_send() {
        let (sender, sent) = sender(TransmitterConfig::default_ipv4());
        let a: SocketAddr = "10.0.0.5:4000".parse().unwrap();
        let b: SocketAddr = "10.0.0.6:4000".parse().unwrap();

        let a1 = sender.register(a).await.unwrap();
        let a2 = sender.register(a).await.unwrap();
        let b1 = sender.register(b).await.unwrap();
        assert_eq!((a1.program_id(), a2.program_id(), b1.program_id()), (1, 2, 1));
        assert_eq!(sender.num_endpoints().await, 2);

        a2.send_packet(TrtpPacket::control(0, ControlCommand::Flush)).await.unwrap();
        b1.send_packet(TrtpPacket::control(0, ControlCommand::Flush)).await.unwrap();

        let sent = take(&sent);
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0, a);
        assert_eq!(TrtpPacket::decode(&sent[0].1).unwrap().1, TrtpPacket::control(2, ControlCommand::Flush));
        assert_eq!(sent[1].0, b);

        // endpoints have separate streams
        let epoch_a = TrtpPacket::decode(&sent[0].1).unwrap().0.epoch;
        let epoch_b = TrtpPacket::decode(&sent[1].1).unwrap().0.epoch;
        assert_ne!(epoch_a, epoch_b);

        assert!(sender.send_packet("10.0.0.7:4000".parse().unwrap(), &TrtpPacket::control(1, ControlCommand::Nop)).await.is_err());
    }

    #[tokio::test]
    async fn test_max_endpoints() {
        let mut config = TransmitterConfig::default_ipv4();
        config.max_endpoints = 1;
        let (sender, _) = sender(config);

        let _a = sender.register("10.0.0.5:4000".parse().unwrap()).await.unwrap();
        assert!(sender.register("10.0.0.6:4000".parse().unwrap()).await.is_err());
        assert!(sender.register("10.0.0.5:4000".parse().unwrap()).await.is_ok());
    }

    #[tokio::test]
    async fn test_retry_request() {
        let (sender, sent) = sender(TransmitterConfig::default_ipv4());
        let a: SocketAddr = "10.0.0.5:4000".parse().unwrap();
        let registration = sender.register(a).await.unwrap();

        for _ in 0..3 {
            registration.send_packet(TrtpPacket::control(0, ControlCommand::Nop)).await.unwrap();
        }
        let first_seq = RtpHeader::deser(&mut &take(&sent)[0].1[..]).unwrap().seq;

        let request = RetryMessage { kind: RetryKind::Retry, target: "10.0.0.1:6000".parse().unwrap(), seq_start: first_seq.plus(1), seq_end: first_seq.plus(3) };

        // only the endpoint itself gets retransmissions
        sender.on_control_datagram(&request.to_bytes(), "10.0.0.9:4000".parse().unwrap()).await;
        assert!(take(&sent).is_empty());

        sender.on_control_datagram(&request.to_bytes(), a).await;
        let sent = take(&sent);
        assert_eq!(sent.len(), 3);
        assert_eq!(
            ControlDatagram::deser(&sent[0].1).unwrap(),
            ControlDatagram::Retry(RetryMessage { kind: RetryKind::Nak, seq_start: first_seq.plus(3), seq_end: first_seq.plus(3), ..request }),
        );
        assert_eq!(RtpHeader::deser(&mut &sent[1].1[..]).unwrap().seq, first_seq.plus(1));
        assert_eq!(RtpHeader::deser(&mut &sent[2].1[..]).unwrap().seq, first_seq.plus(2));
    }

    #[tokio::test]
    async fn test_unregister_frees_program_id() {
        let (sender, _) = sender(TransmitterConfig::default_ipv4());
        let a: SocketAddr = "10.0.0.5:4000".parse().unwrap();
        let first = sender.register(a).await.unwrap();
        let _second = sender.register(a).await.unwrap();

        sender.unregister(a, 7).await;
        sender.unregister("10.0.0.6:4000".parse().unwrap(), 1).await;
        first.unregister().await;

        let third = sender.register(a).await.unwrap();
        assert_eq!(third.program_id(), 1);
        assert_eq!(sender.num_endpoints().await, 1);
    }

    #[tokio::test]
    async fn test_heartbeat_and_collection() {
        let config = TransmitterConfig::default_ipv4();
        let (sender, sent) = sender(config.clone());
        let a: SocketAddr = "10.0.0.5:4000".parse().unwrap();
        let registration = sender.register(a).await.unwrap();

        let now = Instant::now();
        sender.do_maintenance(now).await;
        let sent_datagrams = take(&sent);
        assert_eq!(sent_datagrams.len(), 1);
        assert_eq!(
            TrtpPacket::decode(&sent_datagrams[0].1).unwrap().1.payload,
            TrtpPayload::Control(ControlCommand::ActiveProgramUpdate(vec![1])),
        );

        registration.unregister().await;

        // the heartbeat is still in the retry buffer
        sender.do_maintenance(now + Duration::from_millis(500)).await;
        assert_eq!(sender.num_endpoints().await, 1);

        sender.do_maintenance(now + config.retransmit_packet_ttl + Duration::from_secs(1)).await;
        assert_eq!(sender.num_endpoints().await, 0);
        assert!(take(&sent).is_empty());
    }

    #[tokio::test]
    async fn test_end_to_end() {
        let sender = EndpointSender::start(TransmitterConfig::default_ipv4(), "127.0.0.1:0".parse().unwrap()).await.unwrap();
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let registration = sender.register(receiver.local_addr().unwrap()).await.unwrap();

        registration.send_packet(TrtpPacket::control(0, ControlCommand::Flush)).await.unwrap();

        let mut buf = [0u8; 2048];
        let header = loop {
            let (n, from) = tokio::time::timeout(Duration::from_secs(5), receiver.recv_from(&mut buf)).await.unwrap().unwrap();
            assert_eq!(from, sender.local_addr());
            let (header, packet) = TrtpPacket::decode(&buf[..n]).unwrap();
            if packet == TrtpPacket::control(1, ControlCommand::Flush) {
                break header;
            }
        };

        let std::net::SocketAddr::V4(target) = sender.local_addr() else { panic!() };
        let request = RetryMessage { kind: RetryKind::Retry, target, seq_start: header.seq, seq_end: header.seq };
        receiver.send_to(&request.to_bytes(), sender.local_addr()).await.unwrap();

        loop {
            let (n, _) = tokio::time::timeout(Duration::from_secs(5), receiver.recv_from(&mut buf)).await.unwrap().unwrap();
            let (resent_header, packet) = TrtpPacket::decode(&buf[..n]).unwrap();
            if resent_header.seq == header.seq {
                assert_eq!(packet, TrtpPacket::control(1, ControlCommand::Flush));
                break;
            }
        }

        registration.unregister().await;
        sender.shutdown().await;
    }
}
