//! Announce 감시
//!
//! public 그룹으로 오는 Announce 중 이 수신자를 대상으로 하는 것을 골라 private 그룹마다
//! 수신 세션을 하나씩 띄운다. 세션 생존 여부는 약한 참조로 확인하고, 살아 있는 세션에는
//! 최근 Announce 타임스탬프만 기록한다.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::config::ReceiverConfig;
use crate::executor::Executor;
use crate::fs::FileSystem;
use crate::message::{dequantize_grtt, validate_packet, MemberId, Message, Role, Timestamp};
use crate::progress::ProgressSink;
use crate::receiver::file_task::Destinations;
use crate::receiver::session::AcceptSession;
use crate::receiver::worker::AcceptWorker;
use crate::transport::{multicast_socket, StopHandle, StopSignal, RECV_BUFFER_LEN};
use crate::Result;

/// 실행 중인 수신 세션 표식
///
/// 세션이 강한 참조를, 감시자가 약한 참조를 가진다.
#[derive(Debug)]
pub struct LiveSession {
    session_id: u32,
    latest_announce: AtomicU64,
}

impl LiveSession {
    pub fn new(session_id: u32, announce: Timestamp) -> Self {
        Self {
            session_id,
            latest_announce: AtomicU64::new(announce.0),
        }
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    /// Register에 되돌려 보낼 최근 Announce 타임스탬프
    pub fn latest_announce(&self) -> Timestamp {
        Timestamp(self.latest_announce.load(Ordering::Relaxed))
    }

    fn record(&self, announce: Timestamp) {
        self.latest_announce.store(announce.0, Ordering::Relaxed);
    }
}

/// 새 수신 세션 시작 정보
#[derive(Debug)]
pub struct SessionLaunch {
    /// Announce 송신 주소 (응답 대상)
    pub sender: SocketAddr,
    pub sender_id: MemberId,
    pub session_id: u32,
    pub private_group: IpAddr,
    pub grtt: Duration,
    pub robust_factor: u8,
    pub block_size: u16,
    pub live: Arc<LiveSession>,
}

/// Announce 선별기
#[derive(Debug)]
pub struct AnnounceMonitor {
    public_group: IpAddr,
    receiver_id: MemberId,
    sessions: HashMap<IpAddr, Weak<LiveSession>>,
}

impl AnnounceMonitor {
    pub fn new(public_group: IpAddr, receiver_id: MemberId) -> Self {
        Self {
            public_group,
            receiver_id,
            sessions: HashMap::new(),
        }
    }

    pub fn receiver_id(&self) -> MemberId {
        self.receiver_id
    }

    /// 살아 있는 세션 수
    pub fn live_sessions(&self) -> usize {
        self.sessions.values().filter(|w| w.strong_count() > 0).count()
    }

    /// public 소켓으로 받은 데이터그램 처리, 새 세션이 필요하면 시작 정보를 돌려준다
    pub fn on_datagram(&mut self, data: &[u8], from: SocketAddr) -> Option<SessionLaunch> {
        let packet = validate_packet(data)?;
        if packet.header.role != Role::Announce {
            return None;
        }
        let Some(Message::Announce(announce)) = Message::parse(&packet) else {
            debug!("Announce 파싱 실패 ({})", from);
            return None;
        };
        if announce.public_group != self.public_group {
            debug!("다른 public 그룹의 Announce: {}", announce.public_group);
            return None;
        }
        if !announce.allowed_clients.is_empty() && !announce.allowed_clients.contains(self.receiver_id) {
            return None;
        }

        let header = packet.header;
        let private_group = announce.private_group;
        if let Some(live) = self.sessions.get(&private_group).and_then(Weak::upgrade) {
            if live.session_id() == header.session_id {
                live.record(announce.timestamp);
            } else {
                debug!(
                    "그룹 {}에 세션 {:08x} 진행 중, {:08x} 무시",
                    private_group,
                    live.session_id(),
                    header.session_id
                );
            }
            return None;
        }

        self.sessions.retain(|_, w| w.strong_count() > 0);
        let live = Arc::new(LiveSession::new(header.session_id, announce.timestamp));
        self.sessions.insert(private_group, Arc::downgrade(&live));
        Some(SessionLaunch {
            sender: from,
            sender_id: header.source_id,
            session_id: header.session_id,
            private_group,
            grtt: Duration::from_secs_f64(dequantize_grtt(header.grtt)),
            robust_factor: announce.robust_factor,
            block_size: announce.block_size,
            live,
        })
    }
}

/// public 그룹 감시 워커
pub struct MonitorWorker {
    monitor: AnnounceMonitor,
    socket: UdpSocket,
    config: ReceiverConfig,
    destinations: Arc<Destinations>,
    executor: Arc<Executor>,
    progress: Arc<ProgressSink>,
    fs: Arc<dyn FileSystem>,
    stop: StopSignal,
    sessions: Vec<StopHandle>,
}

impl MonitorWorker {
    pub fn new(
        socket: UdpSocket,
        receiver_id: MemberId,
        config: ReceiverConfig,
        destinations: Arc<Destinations>,
        executor: Arc<Executor>,
        progress: Arc<ProgressSink>,
        fs: Arc<dyn FileSystem>,
    ) -> (Self, StopHandle) {
        let (handle, stop) = StopHandle::new();
        let worker = Self {
            monitor: AnnounceMonitor::new(config.public_group, receiver_id),
            socket,
            config,
            destinations,
            executor,
            progress,
            fs,
            stop,
            sessions: Vec::new(),
        };
        (worker, handle)
    }

    pub async fn run(mut self) {
        info!(
            "Announce 감시 시작: {}:{} (수신자 {:08x})",
            self.config.public_group,
            self.config.listen_port,
            self.monitor.receiver_id()
        );
        let mut buf = vec![0u8; RECV_BUFFER_LEN];
        loop {
            tokio::select! {
                _ = self.stop.requested() => break,
                result = self.socket.recv_from(&mut buf) => match result {
                    Ok((len, from)) => {
                        if let Some(launch) = self.monitor.on_datagram(&buf[..len], from) {
                            let session_id = launch.session_id;
                            if let Err(e) = self.spawn_session(launch) {
                                warn!("수신 세션 {:08x} 시작 실패: {}", session_id, e);
                            }
                        }
                    }
                    Err(e) => warn!("수신 에러: {}", e),
                }
            }
        }

        for handle in &self.sessions {
            handle.stop();
        }
        self.stop.mark_stopped();
        info!("Announce 감시 종료: {}", self.config.public_group);
    }

    fn spawn_session(&mut self, launch: SessionLaunch) -> Result<()> {
        let network = self.executor.network_unit()?;
        let disk = self.executor.disk_unit()?;
        let socket = {
            let _runtime = network.handle().enter();
            multicast_socket(
                launch.private_group,
                self.config.listen_port,
                &self.config.socket_options(),
            )?
        };

        let sender = launch.sender;
        let session = AcceptSession::new(
            launch,
            self.monitor.receiver_id(),
            self.destinations.clone(),
            self.config.quit_on_error,
            self.fs.clone(),
            self.progress.clone(),
        );
        let session_id = session.session_id();
        let (worker, handle) = AcceptWorker::new(session, socket, sender, disk, self.fs.clone());
        self.sessions.retain(StopHandle::is_running);
        self.sessions.push(handle);

        let unit = network.clone();
        network.spawn(async move {
            let outcome = worker.run().await;
            info!("수신 세션 {:08x} 종료: {:?}", session_id, outcome);
            drop(unit);
        });
        Ok(())
    }
}

impl std::fmt::Debug for MonitorWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorWorker")
            .field("public_group", &self.config.public_group)
            .field("listen_port", &self.config.listen_port)
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{
        encode_packet, quantize_grtt, Announce, CongestionMode, MemberIds, ProtocolHeader,
    };
    use bytes::Bytes;

    const ME: MemberId = 0x0a00_0002;

    fn announce(session_id: u32, private: &str, allowed: &[u8], ts: u64) -> Bytes {
        let message = Message::Announce(Announce {
            sync_mode: true,
            sync_preview: false,
            robust_factor: 7,
            cc_mode: CongestionMode::None,
            block_size: 1300,
            timestamp: Timestamp(ts),
            public_group: "230.4.4.1".parse().unwrap(),
            private_group: private.parse().unwrap(),
            allowed_clients: MemberIds::new(allowed),
        });
        let header = ProtocolHeader {
            role: Role::Announce,
            sequence: 1,
            source_id: 0x0a00_0001,
            session_id,
            group_instance: 0,
            grtt: quantize_grtt(0.5),
            group_size: 0,
        };
        encode_packet(&header, &message)
    }

    fn monitor() -> AnnounceMonitor {
        AnnounceMonitor::new("230.4.4.1".parse().unwrap(), ME)
    }

    fn from() -> SocketAddr {
        "10.0.0.1:40000".parse().unwrap()
    }

    #[test]
    fn test_open_announce_starts_one_session_per_group() {
        let mut monitor = monitor();
        let launch = monitor
            .on_datagram(&announce(5, "230.5.5.8", &[], 100), from())
            .unwrap();
        assert_eq!(launch.sender, from());
        assert_eq!(launch.sender_id, 0x0a00_0001);
        assert_eq!(launch.session_id, 5);
        assert_eq!(launch.robust_factor, 7);
        assert_eq!(launch.block_size, 1300);
        assert!((launch.grtt.as_secs_f64() - 0.5).abs() < 0.05);
        assert_eq!(monitor.live_sessions(), 1);

        // 같은 그룹의 반복 Announce는 타임스탬프만 갱신
        assert!(monitor.on_datagram(&announce(5, "230.5.5.8", &[], 200), from()).is_none());
        assert_eq!(launch.live.latest_announce(), Timestamp(200));

        let other = monitor
            .on_datagram(&announce(6, "230.5.5.9", &[], 300), from())
            .unwrap();
        assert_eq!(monitor.live_sessions(), 2);

        // 세션이 끝나면 같은 그룹에서 다시 시작할 수 있다
        drop(launch);
        drop(other);
        assert_eq!(monitor.live_sessions(), 0);
        assert!(monitor.on_datagram(&announce(7, "230.5.5.8", &[], 400), from()).is_some());
    }

    #[test]
    fn test_closed_announce_must_list_receiver() {
        let mut monitor = monitor();
        let others = 0x0a00_0003u32.to_be_bytes();
        assert!(monitor.on_datagram(&announce(5, "230.5.5.8", &others, 1), from()).is_none());

        let mut listed = others.to_vec();
        listed.extend_from_slice(&ME.to_be_bytes());
        assert!(monitor.on_datagram(&announce(5, "230.5.5.8", &listed, 1), from()).is_some());
    }

    #[test]
    fn test_ignores_other_public_group_and_roles() {
        let mut monitor = AnnounceMonitor::new("230.4.4.2".parse().unwrap(), ME);
        assert!(monitor.on_datagram(&announce(5, "230.5.5.8", &[], 1), from()).is_none());

        let mut monitor = self::monitor();
        let mut packet = announce(5, "230.5.5.8", &[], 1).to_vec();
        packet.truncate(10);
        assert!(monitor.on_datagram(&packet, from()).is_none());
        assert_eq!(monitor.live_sessions(), 0);
    }
}
