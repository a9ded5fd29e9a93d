//! 파일 단위 송신 태스크
//!
//! 단계: announcing → sending → waiting_client_status ⇄ sending_lost → complete
//!
//! - announcing: FileInfo를 라운드마다 재전송, 응답 없는 수신자는 lost
//! - sending: 블록을 순서대로 스트리밍, 마지막 블록 이후 Done 송신
//! - waiting_client_status: Done에 대한 Complete/Status 대기, Status의 NAK를 병합
//! - sending_lost: NAK된 블록만 재전송, 재전송 중 들어온 NAK는 다음 패스로 미룬다

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::{FileSource, SenderConfig};
use crate::fs::{absolutize, FileSystem};
use crate::message::{
    extract_lost_blocks, Abort, Complete, Done, FileId, FileInfo, FileInfoAck, FileKind, FileSeg,
    MemberId, MemberIds, Message, Status, Timestamp,
};
use crate::section::FileGeometry;
use crate::sender::context::{MemberStatus, ReceiverProperties, SenderAction, SenderContext, SenderTimer};
use crate::{Error, Result};

/// 한 번에 읽어 보내는 블록 수
pub const READ_BATCH: usize = 32;

/// 전송 목록 항목
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// 로컬 절대 경로
    pub path: PathBuf,
    /// 수신측 이름 ('/' 구분)
    pub remote_name: String,
}

fn slash_joined(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// base_dir 아래면 상대 경로, 아니면 파일 이름
pub fn remote_name_for(path: &Path, base_dir: Option<&Path>) -> String {
    if let Some(relative) = base_dir.and_then(|base| path.strip_prefix(base).ok()) {
        if relative.components().next().is_some() {
            return slash_joined(relative);
        }
    }
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| slash_joined(path))
}

fn expand_path(
    fs: &dyn FileSystem,
    path: &Path,
    remote_name: String,
    out: &mut Vec<FileEntry>,
) -> Result<()> {
    let is_real_dir = fs.is_dir(path) && !fs.is_symlink(path);
    out.push(FileEntry {
        path: path.to_path_buf(),
        remote_name: remote_name.clone(),
    });
    if is_real_dir {
        for child in fs.walk_dir(path)? {
            if let Ok(relative) = child.strip_prefix(path) {
                out.push(FileEntry {
                    remote_name: format!("{}/{}", remote_name, slash_joined(relative)),
                    path: child.clone(),
                });
            }
        }
    }
    Ok(())
}

fn is_supported(fs: &dyn FileSystem, path: &Path) -> bool {
    fs.is_file(path) || fs.is_dir(path) || fs.is_symlink(path)
}

/// 설정의 전송 대상을 파일 목록으로 펼친다
///
/// 단일 경로는 존재해야 하고, 목록에서는 잘못된 항목을 건너뛴다.
pub fn expand_targets(fs: &dyn FileSystem, config: &SenderConfig) -> Result<Vec<FileEntry>> {
    let base_dir = config.base_dir.as_deref().map(absolutize).transpose()?;
    let mut entries = Vec::new();

    match &config.files {
        FileSource::Path(path) => {
            let path = absolutize(path)?;
            if !fs.exists(&path) {
                return Err(Error::TargetNotFound(path));
            }
            if !is_supported(fs, &path) {
                return Err(Error::UnsupportedTarget(path));
            }
            let name = remote_name_for(&path, base_dir.as_deref());
            expand_path(fs, &path, name, &mut entries)?;
        }
        FileSource::List(files) => {
            for file in files {
                let path = absolutize(&file.source)?;
                if !fs.exists(&path) || !is_supported(fs, &path) {
                    warn!("전송 대상 제외: {}", path.display());
                    continue;
                }
                let name = match &file.remote_name {
                    Some(remote) => slash_joined(remote),
                    None => remote_name_for(&path, base_dir.as_deref()),
                };
                expand_path(fs, &path, name, &mut entries)?;
            }
        }
    }

    entries.retain(|e| {
        let fits = FileInfo::fits(e.remote_name.len(), 0);
        if !fits {
            warn!("원격 이름 길이 초과로 제외: {}", e.path.display());
        }
        fits
    });

    if entries.is_empty() {
        return Err(Error::NoValidTarget);
    }
    Ok(entries)
}

/// 디스크 유닛에서 읽는 블록 원본
#[derive(Debug)]
pub struct BlockSource {
    path: PathBuf,
    geometry: FileGeometry,
    file: Mutex<Option<File>>,
}

impl BlockSource {
    pub fn new(path: PathBuf, geometry: FileGeometry) -> Self {
        Self {
            path,
            geometry,
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn geometry(&self) -> &FileGeometry {
        &self.geometry
    }

    /// 블록들을 읽어 (절대 인덱스, 데이터)로 돌려준다
    pub fn read_blocks(&self, indices: &[u64]) -> Result<Vec<(u64, Bytes)>> {
        let mut guard = self.file.lock();
        let mut file = match guard.take() {
            Some(file) => file,
            None => File::open(&self.path)?,
        };

        let mut blocks = Vec::with_capacity(indices.len());
        for &index in indices {
            let len = self.geometry.block_len(index);
            let mut buf = BytesMut::zeroed(len);
            file.seek(SeekFrom::Start(self.geometry.block_offset(index)))?;
            file.read_exact(&mut buf)?;
            blocks.push((index, buf.freeze()));
        }
        *guard = Some(file);
        Ok(blocks)
    }
}

/// 파일 태스크 단계
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPhase {
    Announcing,
    Sending,
    WaitingClientStatus,
    SendingLost,
    Complete,
}

/// 태스크 진행 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskProgress {
    Running,
    Finished,
    Failed(String),
}

/// 파일 단위 송신 태스크
#[derive(Debug)]
pub struct FileSendTask {
    file_id: FileId,
    entry: FileEntry,
    kind: FileKind,
    size: u64,
    mtime: u64,
    link: Vec<u8>,
    source: Option<Arc<BlockSource>>,
    phase: TaskPhase,
    rounds: u8,
    next_block: u64,
    reach_eof: bool,
    read_in_flight: bool,
    nak_records: BTreeSet<u64>,
    not_yet_merged: BTreeSet<u64>,
    resend_cursor: Option<u64>,
}

impl FileSendTask {
    /// 파일 상태를 읽어 태스크 준비
    pub fn prepare(
        ctx: &SenderContext,
        fs: &dyn FileSystem,
        entry: FileEntry,
        file_id: FileId,
        follow_symlinks: bool,
    ) -> Result<Self> {
        let path = entry.path.clone();
        let mut link = Vec::new();
        let mut size = 0;
        let mtime = fs.modified_secs(&path).unwrap_or(0);

        let kind = if fs.is_symlink(&path) && !follow_symlinks {
            link = fs.read_link(&path)?.to_string_lossy().into_owned().into_bytes();
            if !FileInfo::fits(entry.remote_name.len(), link.len()) {
                return Err(Error::UnsupportedTarget(path));
            }
            FileKind::Symlink
        } else if fs.is_dir(&path) {
            FileKind::Directory
        } else if fs.is_file(&path) {
            size = fs.file_size(&path)?;
            FileKind::Regular
        } else {
            return Err(Error::UnsupportedTarget(path));
        };

        let source = if kind == FileKind::Regular && size > 0 {
            let geometry = FileGeometry::new(size, ctx.block_size, ctx.max_blocks_per_section)?;
            Some(Arc::new(BlockSource::new(path, geometry)))
        } else {
            None
        };

        Ok(Self {
            file_id,
            entry,
            kind,
            size,
            mtime,
            link,
            source,
            phase: TaskPhase::Announcing,
            rounds: 0,
            next_block: 0,
            reach_eof: false,
            read_in_flight: false,
            nak_records: BTreeSet::new(),
            not_yet_merged: BTreeSet::new(),
            resend_cursor: None,
        })
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub fn phase(&self) -> TaskPhase {
        self.phase
    }

    pub fn entry(&self) -> &FileEntry {
        &self.entry
    }

    pub fn kind(&self) -> FileKind {
        self.kind
    }

    /// 첫 FileInfo 라운드 시작
    pub fn start(&mut self, ctx: &mut SenderContext, out: &mut Vec<SenderAction>) {
        info!(
            "파일 전송 시작: #{} {} ({:?}, {} bytes)",
            self.file_id, self.entry.remote_name, self.kind, self.size
        );
        self.phase = TaskPhase::Announcing;
        self.rounds = 0;
        self.send_file_info(ctx, out);
        out.push(SenderAction::Schedule {
            after: ctx.round_interval(),
            timer: SenderTimer::FileInfoRound,
        });
    }

    fn send_file_info(&self, ctx: &mut SenderContext, out: &mut Vec<SenderAction>) {
        let timestamp = Timestamp::now();
        let name = self.entry.remote_name.as_bytes();
        for ids in ctx.target_batches(|p| p.status == MemberStatus::Registered) {
            let message = Message::FileInfo(FileInfo {
                file_id: self.file_id,
                kind: self.kind,
                size: self.size,
                mtime: self.mtime,
                name,
                link: &self.link,
                content_hash: None,
                timestamp,
                receiver_ids: MemberIds::new(&ids),
            });
            ctx.send_to_group(&message, out);
        }
    }

    pub fn on_timer(
        &mut self,
        ctx: &mut SenderContext,
        timer: SenderTimer,
        out: &mut Vec<SenderAction>,
    ) -> TaskProgress {
        match (timer, self.phase) {
            (SenderTimer::FileInfoRound, TaskPhase::Announcing) => self.on_file_info_round(ctx, out),
            (SenderTimer::StartSending, TaskPhase::Sending) => {
                self.request_next_blocks(out);
                TaskProgress::Running
            }
            (SenderTimer::WaitStatusEnd, TaskPhase::WaitingClientStatus) => {
                self.on_wait_status_end(ctx, out)
            }
            _ => TaskProgress::Running,
        }
    }

    fn on_file_info_round(&mut self, ctx: &mut SenderContext, out: &mut Vec<SenderAction>) -> TaskProgress {
        let responded = |p: &ReceiverProperties| {
            matches!(p.status, MemberStatus::Active | MemberStatus::Done)
        };
        let all_responded = ctx
            .receivers
            .values()
            .filter(|p| !p.is_proxy && p.status.is_live())
            .all(responded);

        if self.rounds < ctx.robust_factor && !all_responded {
            self.rounds += 1;
            ctx.refine_grtt(|p| p.status == MemberStatus::Active);
            self.send_file_info(ctx, out);
            out.push(SenderAction::Schedule {
                after: ctx.round_interval(),
                timer: SenderTimer::FileInfoRound,
            });
            return TaskProgress::Running;
        }

        let lost = ctx.transition(
            |p| p.status == MemberStatus::Registered && !p.is_proxy,
            MemberStatus::Lost,
        );
        if lost > 0 {
            warn!("FileInfo 무응답 수신자 {}명 lost 처리", lost);
        }

        let any_active = ctx.any(|p| p.status == MemberStatus::Active);
        if any_active && self.source.is_some() {
            ctx.refine_grtt(|p| p.status == MemberStatus::Active);
            self.rounds = 0;
            self.phase = TaskPhase::Sending;
            out.push(SenderAction::Schedule {
                after: ctx.round_interval(),
                timer: SenderTimer::StartSending,
            });
            return TaskProgress::Running;
        }

        if lost > 0 && ctx.quit_on_error {
            return TaskProgress::Failed(format!("파일 #{} 응답 없는 수신자 존재", self.file_id));
        }
        self.phase = TaskPhase::Complete;
        TaskProgress::Finished
    }

    /// 다음 블록 묶음 읽기 요청 (sending)
    fn request_next_blocks(&mut self, out: &mut Vec<SenderAction>) {
        let Some(source) = self.source.clone() else {
            return;
        };
        if self.read_in_flight || self.reach_eof {
            return;
        }
        let total = source.geometry().block_count();
        let end = (self.next_block + READ_BATCH as u64).min(total);
        let indices: Vec<u64> = (self.next_block..end).collect();
        self.next_block = end;
        if end >= total {
            self.reach_eof = true;
        }
        self.read_in_flight = true;
        out.push(SenderAction::ReadBlocks {
            source,
            file_id: self.file_id,
            indices,
            resend: false,
        });
    }

    /// 다음 재전송 묶음 읽기 요청 (sending_lost), 남은 것이 없으면 false
    fn request_lost_blocks(&mut self, out: &mut Vec<SenderAction>) -> bool {
        let Some(source) = self.source.clone() else {
            return false;
        };
        let indices: Vec<u64> = match self.resend_cursor {
            Some(cursor) => self
                .nak_records
                .range(cursor + 1..)
                .take(READ_BATCH)
                .copied()
                .collect(),
            None => self.nak_records.iter().take(READ_BATCH).copied().collect(),
        };
        let Some(&last) = indices.last() else {
            return false;
        };
        self.resend_cursor = Some(last);
        self.read_in_flight = true;
        out.push(SenderAction::ReadBlocks {
            source,
            file_id: self.file_id,
            indices,
            resend: true,
        });
        true
    }

    /// 디스크에서 읽은 블록 송신 후 다음 단계 진행
    pub fn on_blocks_read(
        &mut self,
        ctx: &mut SenderContext,
        resend: bool,
        result: Result<Vec<(u64, Bytes)>>,
        out: &mut Vec<SenderAction>,
    ) -> TaskProgress {
        self.read_in_flight = false;
        let blocks = match result {
            Ok(blocks) => blocks,
            Err(e) => {
                warn!("블록 읽기 실패: {}: {}", self.entry.path.display(), e);
                if ctx.quit_on_error {
                    return TaskProgress::Failed(format!("파일 읽기 실패: {}", e));
                }
                ctx.transition(
                    |p| matches!(p.status, MemberStatus::Active | MemberStatus::ActiveNak),
                    MemberStatus::Registered,
                );
                self.phase = TaskPhase::Complete;
                return TaskProgress::Finished;
            }
        };
        let Some(source) = self.source.clone() else {
            return TaskProgress::Running;
        };

        for (index, data) in &blocks {
            let (section, block) = source.geometry().abs_to_sect_blk(*index);
            let message = Message::FileSeg(FileSeg {
                file_id: self.file_id,
                section,
                block,
                data,
            });
            ctx.send_to_group(&message, out);
            ctx.stats.record_block(data.len(), resend);
        }

        match self.phase {
            TaskPhase::Sending if !self.reach_eof => self.request_next_blocks(out),
            TaskPhase::Sending => self.enter_waiting(ctx, out),
            TaskPhase::SendingLost => {
                if !self.request_lost_blocks(out) {
                    self.finish_lost_pass(ctx, out);
                }
            }
            _ => {}
        }
        TaskProgress::Running
    }

    fn enter_waiting(&mut self, ctx: &mut SenderContext, out: &mut Vec<SenderAction>) {
        debug!("파일 #{} 블록 송신 끝, 상태 대기", self.file_id);
        self.phase = TaskPhase::WaitingClientStatus;
        self.rounds = 0;
        self.send_done(ctx, out);
    }

    fn send_done(&mut self, ctx: &mut SenderContext, out: &mut Vec<SenderAction>) {
        let section = self
            .source
            .as_ref()
            .map_or(0, |s| s.geometry().last_section());
        for ids in ctx.target_batches(|p| {
            matches!(p.status, MemberStatus::Active | MemberStatus::ActiveNak)
        }) {
            let message = Message::Done(Done {
                file_id: self.file_id,
                section,
                receiver_ids: MemberIds::new(&ids),
            });
            ctx.send_to_group(&message, out);
        }
        out.push(SenderAction::Schedule {
            after: ctx.round_interval(),
            timer: SenderTimer::WaitStatusEnd,
        });
    }

    fn on_wait_status_end(&mut self, ctx: &mut SenderContext, out: &mut Vec<SenderAction>) -> TaskProgress {
        let any_active = ctx.any(|p| p.status == MemberStatus::Active && !p.is_proxy);
        let any_nak = ctx.any(|p| p.status == MemberStatus::ActiveNak);

        if self.rounds < ctx.robust_factor {
            self.rounds += 1;
            if any_active {
                self.send_done(ctx, out);
                return TaskProgress::Running;
            }
        } else {
            self.rounds = 0;
            let lost = ctx.transition(
                |p| p.status == MemberStatus::Active && !p.is_proxy,
                MemberStatus::Lost,
            );
            if lost > 0 {
                warn!("Done 무응답 수신자 {}명 lost 처리", lost);
                if ctx.quit_on_error {
                    return TaskProgress::Failed(format!("파일 #{} 응답 없는 수신자 존재", self.file_id));
                }
            }
        }

        if any_nak {
            self.enter_sending_lost(ctx, out);
            TaskProgress::Running
        } else {
            self.phase = TaskPhase::Complete;
            TaskProgress::Finished
        }
    }

    fn enter_sending_lost(&mut self, ctx: &mut SenderContext, out: &mut Vec<SenderAction>) {
        debug!(
            "파일 #{} 재전송: {}개 블록",
            self.file_id,
            self.nak_records.len()
        );
        self.phase = TaskPhase::SendingLost;
        self.resend_cursor = None;
        if !self.request_lost_blocks(out) {
            self.finish_lost_pass(ctx, out);
        }
    }

    fn finish_lost_pass(&mut self, ctx: &mut SenderContext, out: &mut Vec<SenderAction>) {
        self.resend_cursor = None;
        self.nak_records = std::mem::take(&mut self.not_yet_merged);
        if !self.nak_records.is_empty() {
            if !self.request_lost_blocks(out) {
                self.nak_records.clear();
            }
            return;
        }
        if self.reach_eof {
            ctx.transition(|p| p.status == MemberStatus::ActiveNak, MemberStatus::Active);
            self.enter_waiting(ctx, out);
        } else {
            self.phase = TaskPhase::Sending;
            self.request_next_blocks(out);
        }
    }

    pub fn on_file_info_ack(&mut self, ctx: &mut SenderContext, source_id: MemberId, ack: &FileInfoAck<'_>) {
        if self.phase != TaskPhase::Announcing || ack.file_id != self.file_id {
            return;
        }
        let Some(props) = ctx.receivers.get_mut(&source_id) else {
            return;
        };
        props.rtt = Some(ack.timestamp.rtt());
        let status = if ack.done {
            MemberStatus::Done
        } else {
            MemberStatus::Active
        };
        if props.is_proxy {
            for id in ack.receiver_ids.iter() {
                if let Some(member) = ctx.receivers.get_mut(&id) {
                    member.status = status;
                }
            }
        } else {
            props.status = status;
        }
    }

    pub fn on_status(&mut self, ctx: &mut SenderContext, source_id: MemberId, status: &Status<'_>) {
        if status.file_id != self.file_id {
            return;
        }
        let Some(source) = self.source.clone() else {
            return;
        };
        let Some(props) = ctx.receivers.get_mut(&source_id) else {
            return;
        };
        if props.status == MemberStatus::Done {
            return;
        }
        let geometry = source.geometry();
        if status.section > geometry.last_section() {
            return;
        }
        let expected = geometry.section_block_count(status.section);
        let lost: Vec<u64> = extract_lost_blocks(status.nak_map)
            .into_iter()
            .filter(|&blk| (blk as u64) < expected)
            .map(|blk| geometry.sect_blk_to_abs(status.section, blk))
            .collect();
        if lost.is_empty() {
            debug!("NAK 없는 Status: {:08x}", source_id);
            return;
        }

        let target = match self.phase {
            TaskPhase::WaitingClientStatus => &mut self.nak_records,
            TaskPhase::SendingLost => &mut self.not_yet_merged,
            _ => return,
        };
        props.status = MemberStatus::ActiveNak;
        ctx.stats.record_nak(lost.len());
        debug!(
            "Status 수신: {:08x} 섹션 {} 누락 {}개",
            source_id,
            status.section,
            lost.len()
        );
        target.extend(lost);
    }

    pub fn on_complete(
        &mut self,
        ctx: &mut SenderContext,
        source_id: MemberId,
        complete: &Complete<'_>,
    ) -> TaskProgress {
        if complete.file_id != self.file_id
            || !matches!(self.phase, TaskPhase::Announcing | TaskPhase::WaitingClientStatus)
        {
            return TaskProgress::Running;
        }
        let Some(props) = ctx.receivers.get_mut(&source_id) else {
            return TaskProgress::Running;
        };
        if props.is_proxy {
            for id in complete.receiver_ids.iter() {
                if let Some(member) = ctx.receivers.get_mut(&id) {
                    member.status = MemberStatus::Done;
                    member.confirm_sent = false;
                }
            }
        } else {
            props.status = MemberStatus::Done;
            props.confirm_sent = false;
        }
        debug!("Complete 수신: {:08x} ({:?})", source_id, complete.status);
        self.check_all_done(ctx)
    }

    pub fn on_abort(&mut self, ctx: &mut SenderContext, source_id: MemberId, abort: &Abort<'_>) -> TaskProgress {
        apply_abort(ctx, source_id, abort);
        if matches!(self.phase, TaskPhase::Announcing | TaskPhase::WaitingClientStatus) {
            self.check_all_done(ctx)
        } else {
            TaskProgress::Running
        }
    }

    /// 살아 있는 모든 수신자가 done이면 완료
    fn check_all_done(&mut self, ctx: &SenderContext) -> TaskProgress {
        let all_done = ctx
            .receivers
            .values()
            .filter(|p| !p.is_proxy && p.status.is_live())
            .all(|p| p.status == MemberStatus::Done);
        if all_done {
            self.phase = TaskPhase::Complete;
            TaskProgress::Finished
        } else {
            TaskProgress::Running
        }
    }
}

/// Abort 반영: proxy가 host를 지정하면 그 호스트를, 아니면 송신원을 abort 처리
pub fn apply_abort(ctx: &mut SenderContext, source_id: MemberId, abort: &Abort<'_>) {
    let Some(props) = ctx.receivers.get(&source_id) else {
        return;
    };
    let target = if props.is_proxy && abort.host != 0 && ctx.receivers.contains_key(&abort.host) {
        abort.host
    } else {
        source_id
    };
    warn!(
        "Abort 수신: {:08x} ({})",
        target,
        String::from_utf8_lossy(abort.text)
    );
    if let Some(props) = ctx.receivers.get_mut(&target) {
        props.status = MemberStatus::Abort;
    }
}
