//! 송신/수신 설정

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::message::MemberId;
use crate::transport::SocketOptions;
use crate::{DEFAULT_BLOCK_SIZE, DEFAULT_PORT};

/// 기본 public 멀티캐스트 그룹
pub const DEFAULT_PUBLIC_GROUP: IpAddr = IpAddr::V4(Ipv4Addr::new(230, 4, 4, 1));

/// 기본 private 멀티캐스트 그룹 (송신자)
pub const DEFAULT_PRIVATE_GROUP: IpAddr = IpAddr::V4(Ipv4Addr::new(230, 5, 5, 8));

/// 기본 UDP 버퍼 크기
pub const DEFAULT_UDP_BUFFER_SIZE: usize = 256 * 1024;

/// 전송할 단일 파일
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SingleFile {
    pub source: PathBuf,
    /// 수신측에서 쓸 이름 (없으면 자동 결정)
    pub remote_name: Option<PathBuf>,
}

impl SingleFile {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            remote_name: None,
        }
    }
}

/// 전송 대상
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileSource {
    /// 파일, 디렉토리 또는 심볼릭 링크 하나
    Path(PathBuf),
    /// 명시적 파일 목록
    List(Vec<SingleFile>),
}

impl Default for FileSource {
    fn default() -> Self {
        FileSource::List(Vec::new())
    }
}

/// 송신 작업 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderConfig {
    /// Announce를 보낼 그룹
    pub public_group: IpAddr,

    /// 세션 트래픽 그룹
    pub private_group: IpAddr,

    /// 목적지 포트
    pub destination_port: u16,

    /// 송신 소켓 포트 (없으면 임시 포트)
    pub source_port: Option<u16>,

    /// 초기 GRTT
    pub grtt: Duration,

    /// GRTT 하한/상한
    pub min_grtt: Duration,
    pub max_grtt: Duration,

    /// 단계별 최대 재시도 라운드
    pub robust_factor: u8,

    /// 블록 크기 (바이트)
    pub block_size: u16,

    pub udp_buffer_size: usize,

    /// 멀티캐스트 TTL
    pub ttl: u32,

    /// 최대 송신 속도 (bytes/s, 없으면 무제한)
    pub max_speed: Option<u64>,

    /// 고정 송신자 ID (없으면 로컬 주소에서 유도)
    pub sender_id: Option<MemberId>,

    /// 송신 인터페이스 이름
    pub interface: Option<String>,

    /// 심볼릭 링크를 따라가 대상 내용을 전송
    pub follow_symlinks: bool,

    /// 수신자 손실/읽기 실패 시 세션 전체 종료
    pub quit_on_error: bool,

    /// 원격 이름 계산 기준 디렉토리
    pub base_dir: Option<PathBuf>,

    /// 허용 수신자 목록 (있으면 closed group)
    pub allowed_clients: Option<Vec<MemberId>>,

    /// 전송 대상
    pub files: FileSource,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            public_group: DEFAULT_PUBLIC_GROUP,
            private_group: DEFAULT_PRIVATE_GROUP,
            destination_port: DEFAULT_PORT,
            source_port: None,
            grtt: Duration::from_millis(500),
            min_grtt: Duration::from_millis(100),
            max_grtt: Duration::from_secs(15),
            robust_factor: 20,
            block_size: DEFAULT_BLOCK_SIZE,
            udp_buffer_size: DEFAULT_UDP_BUFFER_SIZE,
            ttl: 1,
            max_speed: None,
            sender_id: None,
            interface: None,
            follow_symlinks: false,
            quit_on_error: false,
            base_dir: None,
            allowed_clients: None,
            files: FileSource::default(),
        }
    }
}

impl SenderConfig {
    /// 단일 경로 전송 설정
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            files: FileSource::Path(path.into()),
            ..Self::default()
        }
    }

    /// 유선 LAN용 설정
    pub fn lan() -> Self {
        Self {
            grtt: Duration::from_millis(200),
            robust_factor: 10,
            block_size: 1400,
            udp_buffer_size: 2 * 1024 * 1024,
            ..Self::default()
        }
    }

    /// 불안정한 네트워크용 설정
    pub fn unstable_network() -> Self {
        Self {
            grtt: Duration::from_secs(1),
            robust_factor: 40,
            block_size: 1000,
            max_speed: Some(2 * 1024 * 1024),
            ..Self::default()
        }
    }

    /// closed group 여부
    pub fn is_closed_group(&self) -> bool {
        self.allowed_clients.as_ref().is_some_and(|ids| !ids.is_empty())
    }

    /// 설정 범위로 제한한 초기 GRTT
    pub fn clamped_grtt(&self) -> Duration {
        self.grtt.clamp(self.min_grtt, self.max_grtt.max(self.min_grtt))
    }

    pub fn socket_options(&self) -> SocketOptions {
        SocketOptions {
            udp_buffer_size: self.udp_buffer_size,
            multicast_ttl: self.ttl,
            interface: self.interface.clone(),
        }
    }
}

/// 수신(모니터) 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiverConfig {
    /// 감시할 public 그룹
    pub public_group: IpAddr,

    pub listen_port: u16,

    /// 저장 디렉토리 (앞쪽부터 여유 공간이 있는 곳을 사용)
    pub destination_dirs: Vec<PathBuf>,

    /// 수신 중 임시 디렉토리
    pub temp_dirs: Option<Vec<PathBuf>>,

    /// 고정 수신자 ID (없으면 로컬 주소에서 유도)
    pub client_id: Option<MemberId>,

    /// 멤버 ID 유도에 쓸 인터페이스 이름
    pub interface: Option<String>,

    /// 파일 거부 시 세션 종료
    pub quit_on_error: bool,

    pub udp_buffer_size: usize,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            public_group: DEFAULT_PUBLIC_GROUP,
            listen_port: DEFAULT_PORT,
            destination_dirs: Vec::new(),
            temp_dirs: None,
            client_id: None,
            interface: None,
            quit_on_error: false,
            udp_buffer_size: DEFAULT_UDP_BUFFER_SIZE,
        }
    }
}

impl ReceiverConfig {
    pub fn new(destination: impl Into<PathBuf>) -> Self {
        Self {
            destination_dirs: vec![destination.into()],
            ..Self::default()
        }
    }

    pub fn socket_options(&self) -> SocketOptions {
        SocketOptions {
            udp_buffer_size: self.udp_buffer_size,
            multicast_ttl: 1,
            interface: self.interface.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sender_defaults() {
        let config = SenderConfig::default();
        assert_eq!(config.destination_port, 1044);
        assert_eq!(config.public_group, "230.4.4.1".parse::<IpAddr>().unwrap());
        assert_eq!(config.private_group, "230.5.5.8".parse::<IpAddr>().unwrap());
        assert_eq!(config.robust_factor, 20);
        assert_eq!(config.block_size, 1300);
        assert!(!config.is_closed_group());
    }

    #[test]
    fn test_clamped_grtt() {
        let mut config = SenderConfig::default();
        config.grtt = Duration::from_millis(1);
        assert_eq!(config.clamped_grtt(), Duration::from_millis(100));
        config.grtt = Duration::from_secs(60);
        assert_eq!(config.clamped_grtt(), Duration::from_secs(15));
    }

    #[test]
    fn test_closed_group() {
        let mut config = SenderConfig::unstable_network();
        config.allowed_clients = Some(vec![]);
        assert!(!config.is_closed_group());
        config.allowed_clients = Some(vec![7]);
        assert!(config.is_closed_group());
    }
}
