//! 에러 타입 정의

use std::path::PathBuf;

use thiserror::Error;

/// MFTP 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("전송 대상 없음: {0}")]
    TargetNotFound(PathBuf),

    #[error("지원하지 않는 전송 대상: {0}")]
    UnsupportedTarget(PathBuf),

    #[error("유효한 전송 대상 없음")]
    NoValidTarget,

    #[error("지원하지 않는 멀티캐스트 그룹 조합 (public == private 또는 주소 체계 불일치)")]
    UnsupportedGroups,

    #[error("파일이 너무 큼: size={size}, block_size={block_size}")]
    FileTooLarge { size: u64, block_size: u16 },

    #[error("그룹 멤버 ID를 결정할 수 없음")]
    MemberIdUnknown,

    #[error("채널 에러")]
    ChannelClosed,

    #[error("실행 유닛 종료됨")]
    ExecutorStopped,

    #[error("세션 치명적 에러: {0}")]
    SessionFatal(String),
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
