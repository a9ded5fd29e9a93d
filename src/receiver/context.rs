//! 수신 세션 컨텍스트와 디스크 작업

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::fs::FileSystem;
use crate::message::{
    dequantize_grtt, encode_packet, quantize_grtt, FileId, MemberId, Message, ProtocolHeader, Role,
};
use crate::section::max_blocks_per_section;
use crate::stats::TransferStats;
use crate::Result;

/// 수신 세션 타이머
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverTimer {
    RegisterRetry,
}

/// 수신 세션 종료 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiverOutcome {
    /// DoneConf 수신
    Completed,
    /// 등록 확인을 받지 못함
    Unconfirmed,
    /// 비활성 시간 초과
    TimedOut,
    Cancelled,
    Failed(String),
}

/// 수신 파일 기록 대상
///
/// 쓰기 핸들은 디스크 유닛에서만 건드린다.
#[derive(Debug)]
pub struct FileSink {
    working_path: PathBuf,
    final_path: PathBuf,
    mtime: u64,
    file: Mutex<Option<File>>,
}

impl FileSink {
    pub fn new(working_path: PathBuf, final_path: PathBuf, mtime: u64) -> Self {
        Self {
            working_path,
            final_path,
            mtime,
            file: Mutex::new(None),
        }
    }

    pub fn working_path(&self) -> &Path {
        &self.working_path
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    fn create(&self, fs: &dyn FileSystem) -> Result<()> {
        if let Some(parent) = self.working_path.parent() {
            fs.create_dir_all(parent)?;
        }
        *self.file.lock() = Some(fs.create_file(&self.working_path)?);
        Ok(())
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut guard = self.file.lock();
        let mut file = match guard.take() {
            Some(file) => file,
            None => std::fs::OpenOptions::new().write(true).open(&self.working_path)?,
        };
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        *guard = Some(file);
        Ok(())
    }

    fn finalize(&self, fs: &dyn FileSystem) -> Result<()> {
        if let Some(mut file) = self.file.lock().take() {
            file.flush()?;
        }
        if self.working_path != self.final_path {
            if let Some(parent) = self.final_path.parent() {
                fs.create_dir_all(parent)?;
            }
            fs.rename(&self.working_path, &self.final_path)?;
        }
        fs.set_modified_secs(&self.final_path, self.mtime)
    }
}

/// 디스크 유닛에서 실행할 작업 종류
#[derive(Debug, Clone)]
pub enum DiskOp {
    Create,
    Write { offset: u64, data: Bytes },
    /// 핸들 닫기, 최종 위치로 이동, 수정 시각 복원
    Finalize,
}

/// 디스크 작업
#[derive(Debug, Clone)]
pub struct DiskJob {
    pub file_id: FileId,
    pub sink: Arc<FileSink>,
    pub op: DiskOp,
}

/// 디스크 작업 결과 (생성 성공은 보고하지 않는다)
#[derive(Debug)]
pub enum DiskEvent {
    Failed { file_id: FileId, error: String },
    /// 블록 기록 완료
    Written { file_id: FileId, len: usize },
    Finalized { file_id: FileId, result: Result<()> },
}

impl DiskJob {
    /// 작업 실행
    pub fn run(self, fs: &dyn FileSystem) -> Option<DiskEvent> {
        let file_id = self.file_id;
        let failed = |e: crate::Error| DiskEvent::Failed {
            file_id,
            error: e.to_string(),
        };
        match self.op {
            DiskOp::Create => self.sink.create(fs).err().map(failed),
            DiskOp::Write { offset, data } => Some(match self.sink.write_at(offset, &data) {
                Ok(()) => DiskEvent::Written { file_id, len: data.len() },
                Err(e) => failed(e),
            }),
            DiskOp::Finalize => Some(DiskEvent::Finalized {
                file_id,
                result: self.sink.finalize(fs),
            }),
        }
    }
}

/// 수신 세션 코어가 워커에 요청하는 동작
#[derive(Debug)]
pub enum ReceiverAction {
    /// 송신자에게 유니캐스트
    Send(Bytes),
    Schedule { after: Duration, timer: ReceiverTimer },
    CancelTimers,
    Disk(DiskJob),
    Finished(ReceiverOutcome),
}

/// 수신 세션 컨텍스트
#[derive(Debug)]
pub struct ReceiverContext {
    pub receiver_id: MemberId,
    pub sender_id: MemberId,
    pub session_id: u32,
    pub grtt: Duration,
    pub robust_factor: u8,
    pub block_size: u16,
    pub max_blocks_per_section: u32,
    pub stats: TransferStats,
    /// 마지막으로 받은 메시지 역할 (watchdog 배수 결정)
    pub last_role: Option<Role>,
    sequence: u16,
}

impl ReceiverContext {
    pub fn new(
        receiver_id: MemberId,
        sender_id: MemberId,
        session_id: u32,
        grtt: Duration,
        robust_factor: u8,
        block_size: u16,
    ) -> Self {
        Self {
            receiver_id,
            sender_id,
            session_id,
            grtt,
            robust_factor,
            block_size,
            max_blocks_per_section: max_blocks_per_section(block_size),
            stats: TransferStats::new(),
            last_role: None,
            sequence: 0,
        }
    }

    /// 송신자가 헤더에 실어 보낸 GRTT 채택
    pub fn adopt_grtt(&mut self, quantized: u8) {
        self.grtt = Duration::from_secs_f64(dequantize_grtt(quantized));
    }

    /// 마지막 메시지 종류에 따른 watchdog 배수
    pub fn timeout_factor(&self) -> u32 {
        match self.last_role {
            Some(Role::FileInfo) | Some(Role::RegConf) => 5,
            Some(Role::Done) | Some(Role::DoneConf) => 4,
            _ => 3,
        }
    }

    pub fn packet(&mut self, message: &Message<'_>) -> Bytes {
        self.sequence = self.sequence.wrapping_add(1);
        let header = ProtocolHeader {
            role: message.role(),
            sequence: self.sequence,
            source_id: self.receiver_id,
            session_id: self.session_id,
            group_instance: 0,
            grtt: quantize_grtt(self.grtt.as_secs_f64()),
            group_size: 0,
        };
        encode_packet(&header, message)
    }

    pub fn send(&mut self, message: &Message<'_>, out: &mut Vec<ReceiverAction>) {
        let packet = self.packet(message);
        out.push(ReceiverAction::Send(packet));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::LocalFileSystem;

    #[test]
    fn test_disk_jobs_write_and_finalize() {
        let dir = tempfile::tempdir().unwrap();
        let working = dir.path().join("tmp/part");
        let target = dir.path().join("out/file.bin");
        let sink = Arc::new(FileSink::new(working.clone(), target.clone(), 1_600_000_000));
        let fs = LocalFileSystem;

        let job = |op| DiskJob {
            file_id: 3,
            sink: sink.clone(),
            op,
        };
        assert!(job(DiskOp::Create).run(&fs).is_none());
        for (offset, data) in [(4, &b"5678"[..]), (0, &b"1234"[..])] {
            let event = job(DiskOp::Write {
                offset,
                data: Bytes::from_static(data),
            })
            .run(&fs);
            assert!(matches!(event, Some(DiskEvent::Written { file_id: 3, len: 4 })));
        }

        match job(DiskOp::Finalize).run(&fs) {
            Some(DiskEvent::Finalized { file_id: 3, result: Ok(()) }) => {}
            other => panic!("unexpected {:?}", other),
        }
        assert!(!working.exists());
        assert_eq!(std::fs::read(&target).unwrap(), b"12345678");
        assert_eq!(fs.modified_secs(&target).unwrap(), 1_600_000_000);
    }

    #[test]
    fn test_disk_job_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"x").unwrap();
        // 파일 아래에 디렉토리를 만들 수 없음
        let sink = Arc::new(FileSink::new(blocker.join("a"), blocker.join("a"), 0));
        let event = DiskJob {
            file_id: 9,
            sink,
            op: DiskOp::Create,
        }
        .run(&LocalFileSystem);
        assert!(matches!(event, Some(DiskEvent::Failed { file_id: 9, .. })));
    }

    #[test]
    fn test_timeout_factor_follows_last_role() {
        let mut ctx = ReceiverContext::new(2, 1, 5, Duration::from_millis(500), 20, 1300);
        assert_eq!(ctx.timeout_factor(), 3);
        ctx.last_role = Some(Role::FileInfo);
        assert_eq!(ctx.timeout_factor(), 5);
        ctx.last_role = Some(Role::Done);
        assert_eq!(ctx.timeout_factor(), 4);
        ctx.last_role = Some(Role::FileSeg);
        assert_eq!(ctx.timeout_factor(), 3);
    }
}
