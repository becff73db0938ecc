use crate::config::{GroupKey, TransmitterConfig};
use crate::transmitter::packet_sequencer::PacketSequencer;
use crate::transmitter::retry_buffer::RetryPlan;
use crate::transmitter::send_socket::SendSocket;
use crate::wire::control_messages::{ControlDatagram, MembershipMessage, RetryKind, RetryMessage};
use crate::wire::trtp_packet::{ControlCommand, TrtpPacket};
use anyhow::{anyhow, bail};
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

struct TxGroupState {
    sequencer: PacketSequencer,
    program_ids: BTreeSet<u8>,
    /// receivers that joined through the command-and-control address, with the time of their
    ///  most recent join
    unicast_targets: FxHashMap<SocketAddr, Instant>,
    /// set while the group has no player clients
    idle_since: Option<Instant>,
    is_closed: bool,
    next_heartbeat: Instant,
    next_trim: Instant,
}

/// A transmit group is a single sequenced stream that is sent to a multicast address and / or
///  a set of unicast receivers. Player clients share the group's stream, each with its own
///  program id.
///
/// The group's socket is read by the command-and-control server, which hands incoming control
///  datagrams to the group.
pub struct TxGroup {
    key: GroupKey,
    config: Arc<TransmitterConfig>,
    send_socket: Arc<dyn SendSocket>,
    state: Mutex<TxGroupState>,
}

impl TxGroup {
    pub fn new(key: GroupKey, config: Arc<TransmitterConfig>, send_socket: Arc<dyn SendSocket>, now: Instant) -> TxGroup {
        let state = TxGroupState {
            sequencer: PacketSequencer::new(&config),
            program_ids: BTreeSet::new(),
            unicast_targets: FxHashMap::default(),
            idle_since: Some(now),
            is_closed: false,
            next_heartbeat: now,
            next_trim: now + config.retry_trim_interval,
        };

        TxGroup {
            key,
            config,
            send_socket,
            state: Mutex::new(state),
        }
    }

    pub fn key(&self) -> GroupKey {
        self.key
    }

    pub fn cnc_addr(&self) -> SocketAddr {
        self.send_socket.local_addr()
    }

    pub async fn epoch(&self) -> u32 {
        self.state.lock().await.sequencer.epoch()
    }

    pub async fn num_unicast_targets(&self) -> usize {
        self.state.lock().await.unicast_targets.len()
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.is_closed
    }

    pub async fn allocate_program_id(&self) -> anyhow::Result<u8> {
        let mut state = self.state.lock().await;
        if state.is_closed {
            bail!("transmit group {:?} is closed", self.key);
        }
        if state.program_ids.len() >= self.config.max_player_clients_per_group {
            bail!("transmit group {:?} already has the maximum number of {} player clients", self.key, self.config.max_player_clients_per_group);
        }

        let program_id = (1..=TransmitterConfig::MAX_PROGRAM_ID)
            .find(|id| !state.program_ids.contains(id))
            .ok_or_else(|| anyhow!("no free program id in transmit group {:?}", self.key))?;

        state.program_ids.insert(program_id);
        state.idle_since = None;
        debug!("transmit group {:?}: allocated program id {}", self.key, program_id);
        Ok(program_id)
    }

    pub async fn release_program_id(&self, program_id: u8, now: Instant) {
        let mut state = self.state.lock().await;
        if !state.program_ids.remove(&program_id) {
            warn!("transmit group {:?}: releasing unallocated program id {}", self.key, program_id);
            return;
        }
        debug!("transmit group {:?}: released program id {}", self.key, program_id);
        if state.program_ids.is_empty() {
            state.idle_since = Some(now);
        }
    }

    /// Close the group if it had no player clients for the linger timeout. A closed group does
    ///  not accept new clients and should be removed from the registry.
    pub async fn close_if_expired(&self, now: Instant) -> bool {
        let mut state = self.state.lock().await;
        if state.is_closed {
            return true;
        }
        match state.idle_since {
            Some(idle_since) if idle_since + self.config.group_linger_timeout <= now => {
                state.is_closed = true;
                true
            }
            _ => false,
        }
    }

    fn destinations(&self, state: &TxGroupState) -> Vec<SocketAddr> {
        let mut result = Vec::with_capacity(state.unicast_targets.len() + 1);
        if let GroupKey::Multicast(addr) = self.key {
            result.push(SocketAddr::V4(addr));
        }
        result.extend(state.unicast_targets.keys().cloned());
        result
    }

    fn expire_unicast_targets(&self, state: &mut TxGroupState, now: Instant) {
        let target_timeout = self.config.unicast_target_timeout;
        state.unicast_targets.retain(|addr, last_join| {
            let is_alive = *last_join + target_timeout > now;
            if !is_alive {
                debug!("transmit group {:?}: unicast target {:?} timed out", self.key, addr);
            }
            is_alive
        });
    }

    /// Sequence and send a packet to all of the group's receivers whose membership is current
    pub async fn send_packet(&self, packet: &TrtpPacket) -> anyhow::Result<()> {
        let now = Instant::now();
        let (datagrams, destinations) = {
            let mut state = self.state.lock().await;
            let datagrams = state.sequencer.sequence(packet, now)?;
            self.expire_unicast_targets(&mut state, now);
            (datagrams, self.destinations(&state))
        };

        trace!("transmit group {:?}: sending {} datagrams to {} destinations", self.key, datagrams.len(), destinations.len());
        for datagram in &datagrams {
            for &to in &destinations {
                self.send_socket.send_datagram(to, datagram).await;
            }
        }
        Ok(())
    }

    pub async fn on_control_datagram(&self, datagram: &[u8], from: SocketAddr, now: Instant) {
        let msg = match ControlDatagram::deser(datagram) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("transmit group {:?}: malformed control datagram from {:?} - dropping: {}", self.key, from, e);
                return;
            }
        };

        match msg {
            ControlDatagram::Retry(request) if request.kind != RetryKind::Nak => self.on_retry_request(request, from).await,
            ControlDatagram::Membership(MembershipMessage::Join) => self.on_join(from, now).await,
            ControlDatagram::Membership(MembershipMessage::Leave) => {
                if self.state.lock().await.unicast_targets.remove(&from).is_some() {
                    debug!("transmit group {:?}: {:?} left", self.key, from);
                }
            }
            other => {
                debug!("transmit group {:?}: unexpected control datagram {:?} from {:?} - ignoring", self.key, other, from);
            }
        }
    }

    fn is_retry_target(&self, target: SocketAddrV4) -> bool {
        match self.key {
            GroupKey::Multicast(addr) if addr == target => true,
            _ => target.port() == self.cnc_addr().port(),
        }
    }

    async fn on_retry_request(&self, request: RetryMessage, from: SocketAddr) {
        if !self.is_retry_target(request.target) {
            debug!("transmit group {:?}: retry request for other target {:?} - ignoring", self.key, request.target);
            return;
        }

        let plan = self.state.lock().await
            .sequencer
            .retry_buffer()
            .plan_retry(request.seq_start, request.seq_end, request.kind == RetryKind::FastStart);

        debug!("transmit group {:?}: {:?} from {:?} for {:?}-{:?}: resending {}, NAK {:?}", self.key, request.kind, from, request.seq_start, request.seq_end, plan.resend.len(), plan.naks);
        send_retry_reply(self.send_socket.as_ref(), from, request.target, plan).await;
    }

    async fn on_join(&self, from: SocketAddr, now: Instant) {
        let accepted = {
            let mut state = self.state.lock().await;
            if let Some(last_join) = state.unicast_targets.get_mut(&from) {
                *last_join = now;
                true
            }
            else if state.unicast_targets.len() < self.config.max_unicast_targets_per_group {
                info!("transmit group {:?}: {:?} joined", self.key, from);
                state.unicast_targets.insert(from, now);
                true
            }
            else {
                false
            }
        };

        if !accepted {
            warn!("transmit group {:?}: rejecting {:?} - maximum number of unicast targets reached", self.key, from);
            self.send_socket.send_datagram(from, &MembershipMessage::JoinNak.to_bytes()).await;
        }
    }

    /// Trim the retry buffer, expire unicast targets and send a heartbeat when they are due.
    ///  Returns the time of the next maintenance action.
    pub async fn do_maintenance(&self, now: Instant) -> Instant {
        let (heartbeat, next_deadline) = {
            let mut state = self.state.lock().await;

            if now >= state.next_trim {
                state.sequencer.retry_buffer_mut().trim(now);
                state.next_trim = now + self.config.retry_trim_interval;
            }

            self.expire_unicast_targets(&mut state, now);

            let heartbeat = if now >= state.next_heartbeat {
                state.next_heartbeat = now + self.config.heartbeat_interval;
                let program_ids = state.program_ids.iter().cloned().collect();
                Some(TrtpPacket::control(0, ControlCommand::ActiveProgramUpdate(program_ids)))
            }
            else {
                None
            };

            let next_deadline = [
                Some(state.next_trim),
                Some(state.next_heartbeat),
                state.unicast_targets.values().min().map(|t| *t + self.config.unicast_target_timeout),
                state.idle_since.map(|t| t + self.config.group_linger_timeout),
            ]
                .into_iter()
                .flatten()
                .min()
                .unwrap_or(now + self.config.heartbeat_interval);

            (heartbeat, next_deadline)
        };

        if let Some(heartbeat) = heartbeat {
            trace!("transmit group {:?}: sending heartbeat", self.key);
            if let Err(e) = self.send_packet(&heartbeat).await {
                warn!("transmit group {:?}: error sending heartbeat: {}", self.key, e);
            }
        }
        next_deadline
    }
}

/// NAKs go first, so the receiver skips what can not be retransmitted before the retransmitted
///  datagrams arrive
pub(crate) async fn send_retry_reply(socket: &dyn SendSocket, to: SocketAddr, target: SocketAddrV4, plan: RetryPlan) {
    for (seq_start, seq_end) in plan.naks {
        let nak = RetryMessage {
            kind: RetryKind::Nak,
            target,
            seq_start,
            seq_end,
        };
        socket.send_datagram(to, &nak.to_bytes()).await;
    }
    for datagram in &plan.resend {
        socket.send_datagram(to, datagram).await;
    }
}
