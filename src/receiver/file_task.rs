//! 파일 단위 수신 태스크
//!
//! 단계: waiting_file_info → receiving_blobs → (finalizing) → completed | rejected | skipped
//!
//! 블록 기록과 최종 이동은 디스크 유닛에서 실행되고, 섹션별 누락 비트맵은 이 태스크가 가진다.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::config::ReceiverConfig;
use crate::fs::{absolutize, normalize_lexically, FileSystem};
use crate::message::{
    Complete, CompleteStatus, Done, FileId, FileInfo, FileInfoAck, FileKind, FileSeg, MemberIds,
    Message, Status,
};
use crate::receiver::context::{DiskEvent, DiskJob, DiskOp, FileSink, ReceiverAction, ReceiverContext};
use crate::section::{FileGeometry, SectionRecord};
use crate::Result;

/// 저장 위치 후보
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Destinations {
    pub dirs: Vec<PathBuf>,
    pub temp_dirs: Vec<PathBuf>,
}

impl Destinations {
    /// 설정의 디렉토리들을 절대 경로로 정규화
    pub fn from_config(config: &ReceiverConfig) -> Result<Self> {
        let normalize = |dirs: &[PathBuf]| -> Result<Vec<PathBuf>> {
            dirs.iter().map(|d| absolutize(d)).collect()
        };
        Ok(Self {
            dirs: normalize(&config.destination_dirs)?,
            temp_dirs: normalize(config.temp_dirs.as_deref().unwrap_or_default())?,
        })
    }
}

/// 존재하는 가장 가까운 상위 디렉토리 기준 여유 공간
fn space_at(fs: &dyn FileSystem, path: &Path) -> Option<u64> {
    path.ancestors()
        .find(|p| fs.exists(p))
        .and_then(|p| fs.available_space(p).ok())
}

fn has_room(fs: &dyn FileSystem, dir: &Path, size: u64) -> bool {
    space_at(fs, dir).is_some_and(|space| space >= size)
}

/// 원격 이름에 맞는 기록 위치 선택
///
/// 절대 경로는 저장 디렉토리 중 하나의 아래에 있어야 하고, 상대 경로는 공간이 충분한 첫
/// 저장 디렉토리에 붙인다. 상위 디렉토리로 벗어나는 이름은 거부한다.
pub fn place_file(
    fs: &dyn FileSystem,
    destinations: &Destinations,
    name: &str,
    size: u64,
) -> Option<PathBuf> {
    let requested = normalize_lexically(Path::new(name));
    if requested.as_os_str().is_empty() {
        return None;
    }
    if requested.is_absolute() {
        return destinations
            .dirs
            .iter()
            .find(|dir| requested.starts_with(dir) && requested != **dir && has_room(fs, dir, size))
            .map(|_| requested.clone());
    }
    if requested
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return None;
    }
    destinations
        .dirs
        .iter()
        .find(|dir| has_room(fs, dir, size))
        .map(|dir| dir.join(&requested))
}

/// 임시 디렉토리가 있으면 그 안의 작업 파일, 없으면 최종 경로에 직접 기록
pub fn working_path(
    fs: &dyn FileSystem,
    destinations: &Destinations,
    final_path: &Path,
    size: u64,
    temp_name: &str,
) -> PathBuf {
    destinations
        .temp_dirs
        .iter()
        .find(|dir| has_room(fs, dir, size))
        .map(|dir| dir.join(temp_name))
        .unwrap_or_else(|| final_path.to_path_buf())
}

/// 수신 태스크 단계
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceivePhase {
    WaitingFileInfo,
    ReceivingBlobs,
    /// 마지막 블록까지 받고 디스크 마무리 대기
    Finalizing,
    Completed,
    Rejected,
    Skipped,
}

impl ReceivePhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ReceivePhase::Completed | ReceivePhase::Rejected | ReceivePhase::Skipped
        )
    }
}

/// 파일 단위 수신 태스크
#[derive(Debug)]
pub struct FileReceiveTask {
    file_id: FileId,
    kind: FileKind,
    phase: ReceivePhase,
    name: String,
    geometry: Option<FileGeometry>,
    sections: Vec<SectionRecord>,
    sink: Option<Arc<FileSink>>,
    final_path: Option<PathBuf>,
    complete_status: CompleteStatus,
}

impl FileReceiveTask {
    pub fn new(file_id: FileId) -> Self {
        Self {
            file_id,
            kind: FileKind::Regular,
            phase: ReceivePhase::WaitingFileInfo,
            name: String::new(),
            geometry: None,
            sections: Vec::new(),
            sink: None,
            final_path: None,
            complete_status: CompleteStatus::Normal,
        }
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub fn phase(&self) -> ReceivePhase {
        self.phase
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn final_path(&self) -> Option<&Path> {
        self.final_path.as_deref()
    }

    fn send_complete(&self, ctx: &mut ReceiverContext, out: &mut Vec<ReceiverAction>) {
        let message = Message::Complete(Complete {
            file_id: self.file_id,
            status: self.complete_status,
            receiver_ids: MemberIds::default(),
        });
        ctx.send(&message, out);
    }

    fn finish(
        &mut self,
        ctx: &mut ReceiverContext,
        phase: ReceivePhase,
        status: CompleteStatus,
        out: &mut Vec<ReceiverAction>,
    ) {
        self.phase = phase;
        self.complete_status = status;
        self.sink = None;
        self.sections.clear();
        self.send_complete(ctx, out);
    }

    fn reject(&mut self, ctx: &mut ReceiverContext, reason: &str, out: &mut Vec<ReceiverAction>) {
        warn!("파일 #{} 거부: {} ({})", self.file_id, self.name, reason);
        self.finish(ctx, ReceivePhase::Rejected, CompleteStatus::Rejected, out);
    }

    pub fn on_file_info(
        &mut self,
        ctx: &mut ReceiverContext,
        fs: &dyn FileSystem,
        destinations: &Destinations,
        info: &FileInfo<'_>,
        out: &mut Vec<ReceiverAction>,
    ) {
        if info.file_id != self.file_id {
            return;
        }
        match self.phase {
            ReceivePhase::WaitingFileInfo => {}
            ReceivePhase::ReceivingBlobs => {
                // 응답이 유실되어 송신자가 재전송한 경우
                self.send_ack(ctx, info, out);
                return;
            }
            ReceivePhase::Finalizing => return,
            _ => {
                self.send_complete(ctx, out);
                return;
            }
        }

        self.kind = info.kind;
        self.name = info.name_lossy();
        info!(
            "파일 정보 수신: #{} {} ({:?}, {} bytes)",
            self.file_id, self.name, info.kind, info.size
        );

        match info.kind {
            FileKind::Regular => self.accept_regular(ctx, fs, destinations, info, out),
            FileKind::Directory => self.accept_directory(ctx, fs, destinations, out),
            FileKind::Symlink | FileKind::Delete | FileKind::FreeSpace => {
                debug!("파일 #{} 처리하지 않는 종류: {:?}", self.file_id, info.kind);
                self.finish(ctx, ReceivePhase::Skipped, CompleteStatus::Skipped, out);
            }
        }
    }

    fn send_ack(&self, ctx: &mut ReceiverContext, info: &FileInfo<'_>, out: &mut Vec<ReceiverAction>) {
        let message = Message::FileInfoAck(FileInfoAck {
            file_id: self.file_id,
            partial: false,
            done: false,
            timestamp: info.timestamp,
            receiver_ids: MemberIds::default(),
        });
        ctx.send(&message, out);
    }

    fn accept_regular(
        &mut self,
        ctx: &mut ReceiverContext,
        fs: &dyn FileSystem,
        destinations: &Destinations,
        info: &FileInfo<'_>,
        out: &mut Vec<ReceiverAction>,
    ) {
        let geometry = match FileGeometry::new(info.size, ctx.block_size, ctx.max_blocks_per_section) {
            Ok(geometry) => geometry,
            Err(e) => return self.reject(ctx, &e.to_string(), out),
        };
        let temp_name = format!(".mftp-{:08x}-{}.part", ctx.session_id, self.file_id);
        let Some(final_path) = place_file(fs, destinations, &self.name, info.size) else {
            return self.reject(ctx, "저장 위치 없음", out);
        };
        if fs.is_dir(&final_path) {
            return self.reject(ctx, "같은 이름의 디렉토리 존재", out);
        }
        self.final_path = Some(final_path.clone());

        let up_to_date = fs.is_file(&final_path)
            && fs.file_size(&final_path).ok() == Some(info.size)
            && fs.modified_secs(&final_path).ok() == Some(info.mtime);
        if up_to_date {
            info!("파일 #{} 이미 최신: {}", self.file_id, final_path.display());
            return self.finish(ctx, ReceivePhase::Skipped, CompleteStatus::Normal, out);
        }

        let working = working_path(fs, destinations, &final_path, info.size, &temp_name);
        let sink = Arc::new(FileSink::new(working, final_path, info.mtime));
        out.push(ReceiverAction::Disk(DiskJob {
            file_id: self.file_id,
            sink: sink.clone(),
            op: DiskOp::Create,
        }));

        if geometry.block_count() == 0 {
            out.push(ReceiverAction::Disk(DiskJob {
                file_id: self.file_id,
                sink: sink.clone(),
                op: DiskOp::Finalize,
            }));
            self.sink = Some(sink);
            self.phase = ReceivePhase::Finalizing;
            return;
        }

        self.sections = (0..geometry.section_count())
            .map(|s| SectionRecord::new(geometry.section_block_count(s as u16)))
            .collect();
        self.geometry = Some(geometry);
        self.sink = Some(sink);
        self.phase = ReceivePhase::ReceivingBlobs;
        self.send_ack(ctx, info, out);
    }

    fn accept_directory(
        &mut self,
        ctx: &mut ReceiverContext,
        fs: &dyn FileSystem,
        destinations: &Destinations,
        out: &mut Vec<ReceiverAction>,
    ) {
        let Some(path) = place_file(fs, destinations, &self.name, 0) else {
            return self.reject(ctx, "저장 위치 없음", out);
        };
        self.final_path = Some(path.clone());
        if fs.is_dir(&path) {
            return self.finish(ctx, ReceivePhase::Completed, CompleteStatus::Normal, out);
        }
        if fs.exists(&path) {
            return self.reject(ctx, "같은 이름의 파일 존재", out);
        }
        match fs.create_dir_all(&path) {
            Ok(()) => self.finish(ctx, ReceivePhase::Completed, CompleteStatus::Normal, out),
            Err(e) => self.reject(ctx, &e.to_string(), out),
        }
    }

    pub fn on_file_seg(&mut self, ctx: &mut ReceiverContext, seg: &FileSeg<'_>, out: &mut Vec<ReceiverAction>) {
        if seg.file_id != self.file_id || self.phase != ReceivePhase::ReceivingBlobs {
            return;
        }
        let (Some(geometry), Some(sink)) = (self.geometry.as_ref(), self.sink.as_ref()) else {
            return;
        };
        let Some(record) = self.sections.get_mut(seg.section as usize) else {
            debug!("범위 밖 섹션: {}", seg.section);
            return;
        };
        if seg.block as u64 >= geometry.section_block_count(seg.section) {
            return;
        }
        let index = geometry.sect_blk_to_abs(seg.section, seg.block);
        if seg.data.len() != geometry.block_len(index) {
            debug!("블록 길이 불일치: #{} 블록 {}", self.file_id, index);
            return;
        }
        if !record.mark_received(seg.block) {
            ctx.stats.duplicate_blocks += 1;
            return;
        }

        ctx.stats.payload_bytes += seg.data.len() as u64;
        out.push(ReceiverAction::Disk(DiskJob {
            file_id: self.file_id,
            sink: sink.clone(),
            op: DiskOp::Write {
                offset: geometry.block_offset(index),
                data: Bytes::copy_from_slice(seg.data),
            },
        }));
    }

    pub fn on_done(&mut self, ctx: &mut ReceiverContext, done: &Done<'_>, out: &mut Vec<ReceiverAction>) {
        if done.file_id != self.file_id {
            return;
        }
        match self.phase {
            ReceivePhase::ReceivingBlobs => {}
            phase if phase.is_terminal() => return self.send_complete(ctx, out),
            _ => return,
        }

        if self.sections.iter().all(SectionRecord::is_complete) {
            if let Some(sink) = self.sink.clone() {
                debug!("파일 #{} 모든 블록 수신, 마무리", self.file_id);
                out.push(ReceiverAction::Disk(DiskJob {
                    file_id: self.file_id,
                    sink,
                    op: DiskOp::Finalize,
                }));
                self.phase = ReceivePhase::Finalizing;
            }
            return;
        }

        let last = self.sections.len().saturating_sub(1);
        let upto = (done.section as usize).min(last);
        for (section, record) in self.sections.iter().enumerate().take(upto + 1) {
            if record.is_complete() {
                continue;
            }
            ctx.stats.nak_reports += 1;
            ctx.stats.nak_blocks += record.missing_count();
            let message = Message::Status(Status {
                file_id: self.file_id,
                section: section as u16,
                nak_map: record.nak_map(),
            });
            ctx.send(&message, out);
        }
    }

    pub fn on_disk_event(&mut self, ctx: &mut ReceiverContext, event: DiskEvent, out: &mut Vec<ReceiverAction>) {
        if self.phase.is_terminal() {
            return;
        }
        match event {
            DiskEvent::Failed { file_id, error } if file_id == self.file_id => {
                self.reject(ctx, &error, out);
            }
            DiskEvent::Written { file_id, len } if file_id == self.file_id => {
                ctx.stats.bytes_written += len as u64;
            }
            DiskEvent::Finalized { file_id, result } if file_id == self.file_id => match result {
                Ok(()) => {
                    info!("파일 #{} 수신 완료: {}", self.file_id, self.name);
                    ctx.stats.files += 1;
                    self.finish(ctx, ReceivePhase::Completed, CompleteStatus::Normal, out);
                }
                Err(e) => self.reject(ctx, &e.to_string(), out),
            },
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::LocalFileSystem;
    use crate::message::{validate_packet, Role, Timestamp};
    use std::time::Duration;

    fn ctx() -> ReceiverContext {
        // block_size 4
        ReceiverContext::new(2, 1, 0x55, Duration::from_millis(500), 3, 4)
    }

    fn dests(dir: &Path) -> Destinations {
        Destinations {
            dirs: vec![dir.to_path_buf()],
            temp_dirs: Vec::new(),
        }
    }

    fn info<'a>(name: &'a [u8], kind: FileKind, size: u64, mtime: u64) -> FileInfo<'a> {
        FileInfo {
            file_id: 1,
            kind,
            size,
            mtime,
            name,
            link: &[],
            content_hash: None,
            timestamp: Timestamp::now(),
            receiver_ids: MemberIds::default(),
        }
    }

    fn sent(out: &[ReceiverAction]) -> Vec<Message<'_>> {
        out.iter()
            .filter_map(|a| match a {
                ReceiverAction::Send(packet) => Message::parse(&validate_packet(packet)?),
                _ => None,
            })
            .collect()
    }

    fn run_disk(out: &mut Vec<ReceiverAction>) -> Vec<DiskEvent> {
        let jobs: Vec<DiskJob> = out
            .drain(..)
            .filter_map(|a| match a {
                ReceiverAction::Disk(job) => Some(job),
                _ => None,
            })
            .collect();
        jobs.into_iter().filter_map(|job| job.run(&LocalFileSystem)).collect()
    }

    #[test]
    fn test_place_file() {
        let dir = tempfile::tempdir().unwrap();
        let d = dests(dir.path());
        let fs = LocalFileSystem;
        assert_eq!(place_file(&fs, &d, "a/b.txt", 10), Some(dir.path().join("a/b.txt")));
        assert_eq!(place_file(&fs, &d, "../escape", 10), None);
        assert_eq!(place_file(&fs, &d, "/elsewhere/x", 10), None);
        let inside = dir.path().join("abs.bin");
        assert_eq!(
            place_file(&fs, &d, inside.to_str().unwrap(), 10),
            Some(inside)
        );
        assert_eq!(place_file(&fs, &d, "huge", u64::MAX), None);
    }

    #[test]
    fn test_receive_with_loss_then_complete() {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFileSystem;
        let mut ctx = ctx();
        let mut task = FileReceiveTask::new(1);
        let mut out = Vec::new();

        task.on_file_info(&mut ctx, &fs, &dests(dir.path()), &info(b"f.bin", FileKind::Regular, 10, 1_500_000_000), &mut out);
        assert_eq!(task.phase(), ReceivePhase::ReceivingBlobs);
        assert!(matches!(sent(&out)[..], [Message::FileInfoAck(_)]));
        assert!(run_disk(&mut out).is_empty());

        for (block, data) in [(0u16, &b"0123"[..]), (2, &b"89"[..])] {
            task.on_file_seg(&mut ctx, &FileSeg { file_id: 1, section: 0, block, data }, &mut out);
        }
        // 중복
        task.on_file_seg(&mut ctx, &FileSeg { file_id: 1, section: 0, block: 0, data: b"0123" }, &mut out);
        assert_eq!(ctx.stats.duplicate_blocks, 1);
        assert_eq!(ctx.stats.payload_bytes, 6);
        // 기록량은 디스크 쓰기가 끝난 뒤에 센다
        assert_eq!(ctx.stats.bytes_written, 0);
        let events = run_disk(&mut out);
        assert_eq!(events.len(), 2);
        for event in events {
            assert!(matches!(event, DiskEvent::Written { file_id: 1, .. }));
            task.on_disk_event(&mut ctx, event, &mut out);
        }
        assert_eq!(ctx.stats.bytes_written, 6);
        assert!(out.is_empty());

        let done = Done { file_id: 1, section: 0, receiver_ids: MemberIds::default() };
        task.on_done(&mut ctx, &done, &mut out);
        match &sent(&out)[..] {
            [Message::Status(status)] => {
                assert_eq!(status.section, 0);
                assert_eq!(status.nak_map, &[0b010]);
            }
            other => panic!("unexpected {:?}", other),
        }
        out.clear();

        task.on_file_seg(&mut ctx, &FileSeg { file_id: 1, section: 0, block: 1, data: b"4567" }, &mut out);
        task.on_done(&mut ctx, &done, &mut out);
        assert_eq!(task.phase(), ReceivePhase::Finalizing);
        let events = run_disk(&mut out);
        assert_eq!(events.len(), 2);
        for event in events {
            task.on_disk_event(&mut ctx, event, &mut out);
        }
        assert_eq!(task.phase(), ReceivePhase::Completed);
        assert!(matches!(
            sent(&out)[..],
            [Message::Complete(Complete { status: CompleteStatus::Normal, .. })]
        ));

        assert_eq!(ctx.stats.bytes_written, 10);

        let target = dir.path().join("f.bin");
        assert_eq!(std::fs::read(&target).unwrap(), b"0123456789");
        assert_eq!(fs.modified_secs(&target).unwrap(), 1_500_000_000);

        // 반복된 Done에는 Complete 재전송
        out.clear();
        task.on_done(&mut ctx, &done, &mut out);
        assert_eq!(sent(&out)[0].role(), Role::Complete);
    }

    #[test]
    fn test_up_to_date_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFileSystem;
        let target = dir.path().join("same.bin");
        std::fs::write(&target, b"abcdef").unwrap();
        fs.set_modified_secs(&target, 1_234_567).unwrap();

        let mut ctx = ctx();
        let mut task = FileReceiveTask::new(1);
        let mut out = Vec::new();
        task.on_file_info(&mut ctx, &fs, &dests(dir.path()), &info(b"same.bin", FileKind::Regular, 6, 1_234_567), &mut out);
        assert_eq!(task.phase(), ReceivePhase::Skipped);
        assert!(matches!(
            sent(&out)[..],
            [Message::Complete(Complete { status: CompleteStatus::Normal, .. })]
        ));
        assert!(!out.iter().any(|a| matches!(a, ReceiverAction::Disk(_))));
    }

    #[test]
    fn test_empty_file_uses_temp_dir() {
        let dir = tempfile::tempdir().unwrap();
        let temp = tempfile::tempdir().unwrap();
        let fs = LocalFileSystem;
        let d = Destinations {
            dirs: vec![dir.path().to_path_buf()],
            temp_dirs: vec![temp.path().to_path_buf()],
        };
        let mut ctx = ctx();
        let mut task = FileReceiveTask::new(1);
        let mut out = Vec::new();
        task.on_file_info(&mut ctx, &fs, &d, &info(b"sub/empty", FileKind::Regular, 0, 99), &mut out);
        assert_eq!(task.phase(), ReceivePhase::Finalizing);
        for event in run_disk(&mut out) {
            task.on_disk_event(&mut ctx, event, &mut out);
        }
        assert_eq!(task.phase(), ReceivePhase::Completed);
        assert_eq!(std::fs::read(dir.path().join("sub/empty")).unwrap(), b"");
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_directory_and_other_kinds() {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFileSystem;
        let mut ctx = ctx();
        let mut out = Vec::new();

        let mut task = FileReceiveTask::new(1);
        task.on_file_info(&mut ctx, &fs, &dests(dir.path()), &info(b"pack/sub", FileKind::Directory, 0, 0), &mut out);
        assert_eq!(task.phase(), ReceivePhase::Completed);
        assert!(dir.path().join("pack/sub").is_dir());

        std::fs::write(dir.path().join("plain"), b"x").unwrap();
        let mut task = FileReceiveTask::new(1);
        task.on_file_info(&mut ctx, &fs, &dests(dir.path()), &info(b"plain", FileKind::Directory, 0, 0), &mut out);
        assert_eq!(task.phase(), ReceivePhase::Rejected);

        let mut task = FileReceiveTask::new(1);
        task.on_file_info(&mut ctx, &fs, &dests(dir.path()), &info(b"link", FileKind::Symlink, 0, 0), &mut out);
        assert_eq!(task.phase(), ReceivePhase::Skipped);
        assert!(matches!(
            sent(&out).last(),
            Some(Message::Complete(Complete { status: CompleteStatus::Skipped, .. }))
        ));
    }
}
