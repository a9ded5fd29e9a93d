//! 세션 전송 계층 공통 부품
//!
//! 송신/수신 워커가 함께 쓰는 것들:
//! - UDP 소켓 생성 (주소 재사용, 버퍼 크기, 멀티캐스트 TTL/인터페이스)
//! - 세션별 일회성 타이머 큐
//! - 세션/송신원 ID 기반 패킷 필터
//! - 수신 비활성 감시 (watchdog)
//! - 워커 정지 핸들

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::interface;
use crate::message::{MemberId, ValidatedPacket};
use crate::Result;

/// 수신 버퍼 크기 (UDP 최대 데이터그램)
pub const RECV_BUFFER_LEN: usize = 65536;

/// watchdog 하한
pub const MIN_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(10);

/// 소켓 옵션
#[derive(Debug, Clone)]
pub struct SocketOptions {
    pub udp_buffer_size: usize,
    pub multicast_ttl: u32,
    /// 송신 멀티캐스트 인터페이스 이름
    pub interface: Option<String>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            udp_buffer_size: 256 * 1024,
            multicast_ttl: 1,
            interface: None,
        }
    }
}

fn any_addr(v4: bool, port: u16) -> SocketAddr {
    if v4 {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
    } else {
        SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port)
    }
}

fn new_udp_socket(v4: bool, options: &SocketOptions) -> Result<Socket> {
    let domain = if v4 { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    if let Err(e) = socket.set_recv_buffer_size(options.udp_buffer_size) {
        warn!("수신 버퍼 크기 설정 실패: {}", e);
    }
    if let Err(e) = socket.set_send_buffer_size(options.udp_buffer_size) {
        warn!("송신 버퍼 크기 설정 실패: {}", e);
    }
    socket.set_nonblocking(true)?;
    Ok(socket)
}

fn into_tokio(socket: Socket) -> Result<UdpSocket> {
    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}

/// 송신자 소켓: 지정 포트(없으면 임시 포트)에 바인딩, 멀티캐스트 TTL/인터페이스 설정
///
/// 런타임 컨텍스트 안에서 호출해야 한다.
pub fn sender_socket(group: IpAddr, source_port: Option<u16>, options: &SocketOptions) -> Result<UdpSocket> {
    let v4 = group.is_ipv4();
    let socket = new_udp_socket(v4, options)?;
    socket.bind(&SockAddr::from(any_addr(v4, source_port.unwrap_or(0))))?;

    if v4 {
        socket.set_multicast_ttl_v4(options.multicast_ttl)?;
        socket.set_multicast_loop_v4(true)?;
    } else {
        socket.set_multicast_hops_v6(options.multicast_ttl)?;
        socket.set_multicast_loop_v6(true)?;
    }

    if let Some(name) = options.interface.as_deref() {
        match interface::interface_address(name, v4) {
            Some((IpAddr::V4(addr), _)) => socket.set_multicast_if_v4(&addr)?,
            Some((IpAddr::V6(_), index)) => socket.set_multicast_if_v6(index)?,
            None => warn!("송신 인터페이스를 찾을 수 없음: {}", name),
        }
    }

    into_tokio(socket)
}

/// 멀티캐스트 수신 소켓: any:port 바인딩 후 그룹 가입
///
/// 런타임 컨텍스트 안에서 호출해야 한다.
pub fn multicast_socket(group: IpAddr, port: u16, options: &SocketOptions) -> Result<UdpSocket> {
    let v4 = group.is_ipv4();
    let socket = new_udp_socket(v4, options)?;
    if !v4 {
        socket.set_only_v6(true)?;
    }
    socket.bind(&SockAddr::from(any_addr(v4, port)))?;
    let joined = interface::join_multicast(&socket, group)?;
    debug!("멀티캐스트 소켓: {}:{} ({}개 인터페이스)", group, port, joined);
    into_tokio(socket)
}

/// 세션별 일회성 타이머 큐
#[derive(Debug)]
pub struct TimerQueue<T> {
    entries: Vec<(Instant, T)>,
}

impl<T> TimerQueue<T> {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn schedule(&mut self, at: Instant, timer: T) {
        self.entries.push((at, timer));
    }

    pub fn schedule_after(&mut self, after: Duration, timer: T) {
        self.schedule(Instant::now() + after, timer);
    }

    /// 가장 이른 만료 시각
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.iter().map(|(at, _)| *at).min()
    }

    /// 만료된 타이머를 만료 시각 순으로 꺼낸다
    pub fn pop_expired(&mut self, now: Instant) -> Vec<T> {
        let mut expired = Vec::new();
        let mut i = 0;
        while i < self.entries.len() {
            if self.entries[i].0 <= now {
                expired.push(self.entries.swap_remove(i));
            } else {
                i += 1;
            }
        }
        expired.sort_by_key(|(at, _)| *at);
        expired.into_iter().map(|(_, t)| t).collect()
    }

    pub fn cancel_all(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// 세션 소속 패킷 필터
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionFilter {
    pub session_id: u32,
    /// 수신측은 송신자 ID도 일치해야 한다
    pub source_id: Option<MemberId>,
}

impl SessionFilter {
    pub fn accepts(&self, packet: &ValidatedPacket<'_>) -> bool {
        packet.header.session_id == self.session_id
            && self.source_id.map_or(true, |id| packet.header.source_id == id)
    }
}

/// 수신 비활성 감시
///
/// 마지막 유효 패킷 이후 `max(grtt * factor, 10s)`가 지나면 만료.
#[derive(Debug, Clone, Copy)]
pub struct Watchdog {
    deadline: Instant,
}

impl Watchdog {
    pub fn new(grtt: Duration, factor: u32) -> Self {
        Self {
            deadline: Instant::now() + Self::timeout(grtt, factor),
        }
    }

    pub fn timeout(grtt: Duration, factor: u32) -> Duration {
        (grtt * factor).max(MIN_INACTIVITY_TIMEOUT)
    }

    pub fn feed(&mut self, grtt: Duration, factor: u32) {
        self.deadline = Instant::now() + Self::timeout(grtt, factor);
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

/// 실행 중인 워커에 대한 정지 핸들
#[derive(Debug, Clone)]
pub struct StopHandle {
    stop_tx: mpsc::UnboundedSender<()>,
    running: Arc<AtomicBool>,
}

/// 워커 쪽 정지 신호
#[derive(Debug)]
pub struct StopSignal {
    stop_rx: mpsc::UnboundedReceiver<()>,
    running: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn new() -> (Self, StopSignal) {
        let (stop_tx, stop_rx) = mpsc::unbounded_channel();
        let running = Arc::new(AtomicBool::new(true));
        (
            Self {
                stop_tx,
                running: running.clone(),
            },
            StopSignal { stop_rx, running },
        )
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(());
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl StopSignal {
    /// 정지 요청이 오거나 모든 핸들이 사라질 때까지 대기
    pub async fn requested(&mut self) {
        let _ = self.stop_rx.recv().await;
    }

    pub fn mark_stopped(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ProtocolHeader, Role};

    #[test]
    fn test_timer_queue_orders_expired() {
        let base = Instant::now();
        let mut timers = TimerQueue::new();
        timers.schedule(base + Duration::from_millis(30), "c");
        timers.schedule(base + Duration::from_millis(10), "a");
        timers.schedule(base + Duration::from_millis(20), "b");
        timers.schedule(base + Duration::from_secs(10), "later");

        assert_eq!(timers.next_deadline(), Some(base + Duration::from_millis(10)));
        let fired = timers.pop_expired(base + Duration::from_millis(30));
        assert_eq!(fired, vec!["a", "b", "c"]);
        assert_eq!(timers.len(), 1);

        timers.cancel_all();
        assert!(timers.is_empty());
        assert_eq!(timers.next_deadline(), None);
    }

    #[test]
    fn test_session_filter() {
        let header = ProtocolHeader {
            role: Role::Done,
            sequence: 1,
            source_id: 5,
            session_id: 99,
            group_instance: 0,
            grtt: 0,
            group_size: 0,
        };
        let packet = ValidatedPacket { header, body: &[10, 2] };

        let sender_side = SessionFilter { session_id: 99, source_id: None };
        assert!(sender_side.accepts(&packet));

        let receiver_side = SessionFilter { session_id: 99, source_id: Some(5) };
        assert!(receiver_side.accepts(&packet));

        let other_source = SessionFilter { session_id: 99, source_id: Some(6) };
        assert!(!other_source.accepts(&packet));

        let other_session = SessionFilter { session_id: 98, source_id: None };
        assert!(!other_session.accepts(&packet));
    }

    #[test]
    fn test_watchdog_floor() {
        assert_eq!(Watchdog::timeout(Duration::from_millis(500), 3), MIN_INACTIVITY_TIMEOUT);
        assert_eq!(Watchdog::timeout(Duration::from_secs(5), 4), Duration::from_secs(20));
    }

    #[tokio::test]
    async fn test_stop_handle() {
        let (handle, mut signal) = StopHandle::new();
        assert!(handle.is_running());
        handle.clone().stop();
        signal.requested().await;
        signal.mark_stopped();
        assert!(!handle.is_running());

        // 핸들이 모두 사라져도 깨어난다
        let (handle, mut signal) = StopHandle::new();
        drop(handle);
        signal.requested().await;
    }

    #[tokio::test]
    async fn test_sender_socket_binds_ephemeral() {
        let socket = sender_socket("230.5.5.8".parse().unwrap(), None, &SocketOptions::default()).unwrap();
        assert_ne!(socket.local_addr().unwrap().port(), 0);
    }
}
