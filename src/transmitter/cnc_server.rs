use crate::config::{GroupKey, TransmitterConfig};
use crate::transmitter::media_sender::PacketSink;
use crate::transmitter::send_socket::{SendSocket, TrtpSocket};
use crate::transmitter::tx_group::TxGroup;
use crate::wire::trtp_packet::TrtpPacket;
use anyhow::bail;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

#[derive(Clone)]
struct GroupEntry {
    group: Arc<TxGroup>,
    socket: Arc<UdpSocket>,
}

/// The command-and-control server owns all transmit groups of a process. A single task reads
///  the groups' sockets, hands retry and membership requests to the groups and runs their
///  periodic maintenance.
///
/// The registry lock is never held while a group's lock is taken.
pub struct CncServer {
    config: Arc<TransmitterConfig>,
    registry: Mutex<Vec<GroupEntry>>,
    wakeup: Notify,
    shutdown: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CncServer {
    pub async fn start(config: TransmitterConfig) -> anyhow::Result<Arc<CncServer>> {
        config.validate()?;

        let server = Arc::new(CncServer {
            config: Arc::new(config),
            registry: Default::default(),
            wakeup: Notify::new(),
            shutdown: AtomicBool::new(false),
            worker: Default::default(),
        });

        let handle = tokio::spawn(server.clone().run());
        *server.worker.lock().await = Some(handle);
        Ok(server)
    }

    pub async fn num_groups(&self) -> usize {
        self.registry.lock().await.len()
    }

    /// Register a player client with the group identified by `key`, creating the group if it
    ///  does not exist yet. Nothing is left behind if registration fails.
    pub async fn register_client(&self, key: GroupKey) -> anyhow::Result<TxGroupClient> {
        if self.shutdown.load(Ordering::Acquire) {
            bail!("command-and-control server is shut down");
        }

        // a group can expire between lookup and program id allocation, so try a second time
        //  with a fresh group
        for _ in 0..2 {
            let (group, is_new) = self.find_or_create_group(key).await?;

            match group.allocate_program_id().await {
                Ok(program_id) => {
                    info!("registered client with program id {} in transmit group {:?}", program_id, key);
                    return Ok(TxGroupClient { group, program_id });
                }
                Err(e) => {
                    if group.is_closed().await {
                        self.remove_group(&group).await;
                        continue;
                    }
                    if is_new {
                        self.remove_group(&group).await;
                    }
                    return Err(e);
                }
            }
        }
        bail!("transmit group {:?} was closed during registration", key)
    }

    async fn find_or_create_group(&self, key: GroupKey) -> anyhow::Result<(Arc<TxGroup>, bool)> {
        if let Some(group) = self.existing_group(&*self.registry.lock().await, key)? {
            return Ok((group, false));
        }

        // the registry lock is not held while binding
        let socket = match Self::bind_group_socket(key).await {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                // a concurrent registration may have bound the port in the meantime
                if let Some(group) = self.existing_group(&*self.registry.lock().await, key)? {
                    return Ok((group, false));
                }
                return Err(e);
            }
        };

        let send_socket: Arc<dyn SendSocket> = Arc::new(TrtpSocket::new(socket.clone())?);

        let mut registry = self.registry.lock().await;
        if let Some(group) = self.existing_group(&registry, key)? {
            debug!("transmit group {:?} was created concurrently - dropping the new socket", key);
            return Ok((group, false));
        }

        let group = Arc::new(TxGroup::new(key, self.config.clone(), send_socket, Instant::now()));
        registry.push(GroupEntry { group: group.clone(), socket });
        drop(registry);

        info!("created transmit group {:?} with command-and-control address {:?}", key, group.cnc_addr());
        self.wakeup.notify_one();
        Ok((group, true))
    }

    /// `None` if there is no group for the key yet, and there is room for a new one
    fn existing_group(&self, registry: &[GroupEntry], key: GroupKey) -> anyhow::Result<Option<Arc<TxGroup>>> {
        if let Some(entry) = registry.iter().find(|e| e.group.key() == key) {
            return Ok(Some(entry.group.clone()));
        }
        if registry.len() >= self.config.max_groups {
            bail!("maximum number of {} transmit groups reached", self.config.max_groups);
        }
        Ok(None)
    }

    async fn bind_group_socket(key: GroupKey) -> anyhow::Result<UdpSocket> {
        match key {
            GroupKey::CncPort(port) => Ok(UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], port))).await?),
            GroupKey::Multicast(addr) => {
                if !addr.ip().is_multicast() {
                    bail!("{:?} is not a multicast address", addr);
                }
                let socket = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], 0))).await?;
                socket.set_multicast_loop_v4(true)?;
                Ok(socket)
            }
        }
    }

    async fn remove_group(&self, group: &Arc<TxGroup>) {
        self.registry.lock().await
            .retain(|e| !Arc::ptr_eq(&e.group, group));
    }

    /// Stop the server task and drop all groups. Calling this more than once is harmless.
    pub async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.wakeup.notify_one();

        if let Some(handle) = self.worker.lock().await.take() {
            if let Err(e) = handle.await {
                error!("command-and-control server terminated abnormally: {}", e);
            }
        }
        self.registry.lock().await.clear();
    }

    async fn run(self: Arc<Self>) {
        info!("starting command-and-control server");

        let mut buf = vec![0u8; self.config.max_datagram_len];
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }

            let entries = self.registry.lock().await.clone();

            let now = Instant::now();
            let mut deadline = now + Duration::from_secs(1);
            for entry in &entries {
                deadline = deadline.min(entry.group.do_maintenance(now).await);
            }
            self.expire_groups(&entries, now).await;

            tokio::select! {
                _ = any_readable(&entries) => {}
                _ = self.wakeup.notified() => {}
                _ = sleep_until(deadline) => {}
            }

            for entry in &entries {
                loop {
                    match entry.socket.try_recv_from(&mut buf) {
                        Ok((num_read, from)) => entry.group.on_control_datagram(&buf[..num_read], from, Instant::now()).await,
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                        Err(e) => {
                            warn!("transmit group {:?}: socket error: {}", entry.group.key(), e);
                            break;
                        }
                    }
                }
            }
        }

        info!("command-and-control server stopped");
    }

    async fn expire_groups(&self, entries: &[GroupEntry], now: Instant) {
        let mut expired = Vec::new();
        for entry in entries {
            if entry.group.close_if_expired(now).await {
                info!("transmit group {:?} has no clients left - removing it", entry.group.key());
                expired.push(entry.group.clone());
            }
        }

        if !expired.is_empty() {
            self.registry.lock().await
                .retain(|e| !expired.iter().any(|g| Arc::ptr_eq(g, &e.group)));
        }
    }
}

async fn any_readable(entries: &[GroupEntry]) {
    if entries.is_empty() {
        std::future::pending::<()>().await;
    }
    let (result, idx, _) = futures::future::select_all(entries.iter().map(|e| Box::pin(e.socket.readable()))).await;
    if let Err(e) = result {
        debug!("transmit group {:?}: error waiting for socket readiness: {}", entries[idx].group.key(), e);
    }
}

/// A player client's handle to its transmit group
pub struct TxGroupClient {
    group: Arc<TxGroup>,
    program_id: u8,
}

impl TxGroupClient {
    pub fn group_key(&self) -> GroupKey {
        self.group.key()
    }

    /// the address receivers send retry requests and membership messages to
    pub fn cnc_addr(&self) -> SocketAddr {
        self.group.cnc_addr()
    }

    pub async fn unregister(self) {
        info!("unregistering client with program id {} from transmit group {:?}", self.program_id, self.group.key());
        self.group.release_program_id(self.program_id, Instant::now()).await;
    }
}

#[async_trait]
impl PacketSink for TxGroupClient {
    fn program_id(&self) -> u8 {
        self.program_id
    }

    async fn send_packet(&self, mut packet: TrtpPacket) -> anyhow::Result<()> {
        packet.program_id = self.program_id;
        self.group.send_packet(&packet).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::control_messages::{ControlDatagram, MembershipMessage, RetryKind, RetryMessage};
    use crate::wire::trtp_packet::{ControlCommand, TrtpPayload};
    use std::net::SocketAddrV4;
    use tokio::time::timeout;

    async fn recv(socket: &UdpSocket) -> Vec<u8> {
        let mut buf = [0u8; 2048];
        let (n, _) = timeout(Duration::from_secs(5), socket.recv_from(&mut buf)).await
            .unwrap()
            .unwrap();
        buf[..n].to_vec()
    }

    /// skips heartbeats
    async fn recv_non_heartbeat(socket: &UdpSocket) -> Vec<u8> {
        loop {
            let datagram = recv(socket).await;
            if let Ok((_, packet)) = TrtpPacket::decode(&datagram) {
                if matches!(packet.payload, TrtpPayload::Control(ControlCommand::ActiveProgramUpdate(_))) {
                    continue;
                }
            }
            return datagram;
        }
    }

    #[tokio::test]
    async fn test_unicast_group() {
        let server = CncServer::start(TransmitterConfig::default_ipv4()).await.unwrap();

        let client = server.register_client(GroupKey::CncPort(0)).await.unwrap();
        assert_eq!(client.program_id(), 1);
        assert_eq!(server.num_groups().await, 1);
        let cnc_addr = SocketAddr::from(([127, 0, 0, 1], client.cnc_addr().port()));

        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        receiver.send_to(&MembershipMessage::Join.to_bytes(), cnc_addr).await.unwrap();

        // wait for the join to be processed: the group's heartbeats reach joined receivers
        let heartbeat = recv(&receiver).await;
        let (_, packet) = TrtpPacket::decode(&heartbeat).unwrap();
        assert_eq!(packet.payload, TrtpPayload::Control(ControlCommand::ActiveProgramUpdate(vec![1])));

        client.send_packet(TrtpPacket::control(17, ControlCommand::Flush)).await.unwrap();
        let datagram = recv_non_heartbeat(&receiver).await;
        let (header, packet) = TrtpPacket::decode(&datagram).unwrap();
        assert_eq!(packet, TrtpPacket::control(1, ControlCommand::Flush));

        let SocketAddr::V4(target) = cnc_addr else { panic!() };
        let request = RetryMessage { kind: RetryKind::Retry, target, seq_start: header.seq, seq_end: header.seq.next() };
        receiver.send_to(&request.to_bytes(), cnc_addr).await.unwrap();

        let resent = recv_non_heartbeat(&receiver).await;
        let resent_seq = if let Ok(ControlDatagram::Retry(nak)) = ControlDatagram::deser(&resent) {
            // the NAK for the tail may arrive first
            assert_eq!(nak.kind, RetryKind::Nak);
            assert_eq!(nak.seq_start, header.seq.next());
            TrtpPacket::decode(&recv_non_heartbeat(&receiver).await).unwrap().0.seq
        }
        else {
            TrtpPacket::decode(&resent).unwrap().0.seq
        };
        assert_eq!(resent_seq, header.seq);

        client.unregister().await;
        server.shutdown().await;
        assert_eq!(server.num_groups().await, 0);
    }

    #[tokio::test]
    async fn test_registration_limits() {
        let mut config = TransmitterConfig::default_ipv4();
        config.max_groups = 1;
        config.max_player_clients_per_group = 2;
        let server = CncServer::start(config).await.unwrap();

        let group_a = GroupKey::Multicast(SocketAddrV4::new([239, 10, 0, 1].into(), 5000));
        let group_b = GroupKey::Multicast(SocketAddrV4::new([239, 10, 0, 2].into(), 5000));

        let c1 = server.register_client(group_a).await.unwrap();
        let c2 = server.register_client(group_a).await.unwrap();
        assert_eq!((c1.program_id(), c2.program_id()), (1, 2));
        assert_eq!(c1.cnc_addr(), c2.cnc_addr());

        assert!(server.register_client(group_a).await.is_err());
        assert!(server.register_client(group_b).await.is_err());
        assert_eq!(server.num_groups().await, 1);

        c1.unregister().await;
        let c3 = server.register_client(group_a).await.unwrap();
        assert_eq!(c3.program_id(), 1);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_registration_shares_group() {
        let server = CncServer::start(TransmitterConfig::default_ipv4()).await.unwrap();
        let key = GroupKey::Multicast(SocketAddrV4::new([239, 10, 0, 3].into(), 5000));

        let (a, b) = tokio::join!(server.register_client(key), server.register_client(key));
        let (a, b) = (a.unwrap(), b.unwrap());
        let mut program_ids = vec![a.program_id(), b.program_id()];
        program_ids.sort();
        assert_eq!(program_ids, vec![1, 2]);
        assert_eq!(server.num_groups().await, 1);
        assert_eq!(a.cnc_addr(), b.cnc_addr());

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_multicast_key_requires_multicast_address() {
        let server = CncServer::start(TransmitterConfig::default_ipv4()).await.unwrap();
        let key = GroupKey::Multicast(SocketAddrV4::new([10, 0, 0, 1].into(), 5000));
        assert!(server.register_client(key).await.is_err());
        assert_eq!(server.num_groups().await, 0);
        server.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_group_expires_after_linger() {
        let mut config = TransmitterConfig::default_ipv4();
        config.group_linger_timeout = Duration::from_millis(50);
        let server = CncServer::start(config).await.unwrap();

        let client = server.register_client(GroupKey::CncPort(0)).await.unwrap();
        client.unregister().await;

        timeout(Duration::from_secs(5), async {
            while server.num_groups().await > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }).await.unwrap();

        // a new registration creates a new group
        let client = server.register_client(GroupKey::CncPort(0)).await.unwrap();
        assert_eq!(client.program_id(), 1);
        assert_eq!(server.num_groups().await, 1);

        server.shutdown().await;
    }
}
