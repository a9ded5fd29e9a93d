//! # MFTP (Multicast File Transfer Protocol)
//!
//! UDP 멀티캐스트 기반 NAK 복구형 파일 배포 프로토콜
//!
//! ## 핵심 특징
//! - **일대다 전송**: 송신자 하나가 private 멀티캐스트 그룹으로 여러 수신자에게 동시에 전송
//! - **NAK 기반**: 수신자는 섹션별 누락 비트맵만 보고, 송신자는 빠진 블록만 재전송
//! - **등록 단계**: Announce/Register/RegConf로 수신자 확정, open/closed group 지원
//! - **GRTT**: 수신자 RTT 중 최댓값으로 재시도 간격 조절
//! - **속도 제한**: 토큰 버킷 게이트로 송신 속도 상한
//! - **실행 유닛 분리**: 네트워크/디스크 작업을 서로 다른 전용 스레드에서 처리

pub mod config;
pub mod error;
pub mod executor;
pub mod fs;
pub mod interface;
pub mod message;
pub mod progress;
pub mod rate;
pub mod receiver;
pub mod section;
pub mod sender;
pub mod stats;
pub mod transport;

pub use config::{FileSource, ReceiverConfig, SenderConfig, SingleFile};
pub use error::{Error, Result};
pub use executor::Executor;
pub use fs::{FileSystem, LocalFileSystem};
pub use message::{Message, Role};
pub use progress::{ProgressEvent, ProgressSink, ProgressStatus, ReceiverStatus, SenderStatus};
pub use receiver::{MonitorResult, ReceiverServer};
pub use sender::{LaunchOutcome, LaunchResult, SenderServer, TaskToken};
pub use stats::TransferStats;

/// 기본 UDP 포트
pub const DEFAULT_PORT: u16 = 1044;

/// 기본 블록 크기 (바이트)
pub const DEFAULT_BLOCK_SIZE: u16 = 1300;
