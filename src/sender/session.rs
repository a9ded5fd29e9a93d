//! 다중 파일 전달 세션
//!
//! announcing → transferring(파일별 태스크) → ending(Done/DoneConf) → complete
//!
//! 소켓/타이머/디스크를 직접 다루지 않는다. 모든 입력(패킷, 타이머, 블록 읽기 결과)에 대해
//! 워커가 실행할 [`SenderAction`] 목록을 돌려준다.

use std::collections::{BTreeSet, VecDeque};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::config::SenderConfig;
use crate::fs::FileSystem;
use crate::message::{
    validate_packet, Announce, CongestionMode, Done, FileId, IdList, MemberId, MemberIds, Message,
    Register, Timestamp,
};
use crate::progress::{ProgressEvent, ProgressSink, ProgressStatus, SenderStatus};
use crate::sender::context::{
    MemberStatus, ReceiverProperties, SenderAction, SenderContext, SenderTimer, SessionOutcome,
};
use crate::sender::file_task::{apply_abort, FileEntry, FileSendTask, TaskProgress};
use crate::stats::TransferStats;
use crate::transport::SessionFilter;
use crate::Result;

/// 세션 단계
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Announcing,
    Transferring,
    Ending,
    Complete,
}

/// 다중 파일 전달 세션 코어
pub struct DeliverySession {
    ctx: SenderContext,
    phase: SessionPhase,
    rounds: u8,
    files: VecDeque<FileEntry>,
    next_file_id: FileId,
    task: Option<FileSendTask>,
    follow_symlinks: bool,
    public_group: std::net::IpAddr,
    /// 세션 종료 Done에 응답한 수신자
    session_acked: BTreeSet<MemberId>,
    outcome: Option<SessionOutcome>,
    fs: Arc<dyn FileSystem>,
    progress: Arc<ProgressSink>,
}

impl DeliverySession {
    pub fn new(
        config: &SenderConfig,
        sender_id: MemberId,
        session_id: u32,
        files: Vec<FileEntry>,
        fs: Arc<dyn FileSystem>,
        progress: Arc<ProgressSink>,
    ) -> Self {
        let mut ctx = SenderContext::new(
            sender_id,
            session_id,
            config.clamped_grtt(),
            (config.min_grtt, config.max_grtt),
            config.robust_factor,
            config.block_size,
            SocketAddr::new(config.public_group, config.destination_port),
            SocketAddr::new(config.private_group, config.destination_port),
        );
        ctx.quit_on_error = config.quit_on_error;
        ctx.open_group = !config.is_closed_group();
        if let Some(allowed) = &config.allowed_clients {
            for &id in allowed {
                ctx.receivers.insert(id, ReceiverProperties::new(MemberStatus::Mute));
            }
        }

        Self {
            ctx,
            phase: SessionPhase::Announcing,
            rounds: 0,
            files: files.into(),
            next_file_id: 1,
            task: None,
            follow_symlinks: config.follow_symlinks,
            public_group: config.public_group,
            session_acked: BTreeSet::new(),
            outcome: None,
            fs,
            progress,
        }
    }

    pub fn session_id(&self) -> u32 {
        self.ctx.session_id
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn context(&self) -> &SenderContext {
        &self.ctx
    }

    pub fn stats(&self) -> &TransferStats {
        &self.ctx.stats
    }

    pub fn outcome(&self) -> Option<&SessionOutcome> {
        self.outcome.as_ref()
    }

    /// 수신 패킷 필터 (세션 ID 일치)
    pub fn filter(&self) -> SessionFilter {
        SessionFilter {
            session_id: self.ctx.session_id,
            source_id: None,
        }
    }

    fn post_progress(&self, status: SenderStatus) {
        let path = self
            .task
            .as_ref()
            .map(|t| t.entry().path.clone())
            .unwrap_or_default();
        self.progress.post(ProgressEvent {
            session_id: self.ctx.session_id,
            status: ProgressStatus::Sender(status),
            path,
        });
    }

    /// 세션 시작: 첫 Announce
    pub fn start(&mut self) -> Vec<SenderAction> {
        info!(
            "세션 {:08x} 시작: {}개 항목, {}",
            self.ctx.session_id,
            self.files.len(),
            if self.ctx.open_group { "open group" } else { "closed group" }
        );
        let mut out = Vec::new();
        self.send_announce(&mut out);
        out
    }

    /// 강제 종료
    pub fn force_end(&mut self) -> Vec<SenderAction> {
        if self.phase == SessionPhase::Complete {
            return Vec::new();
        }
        warn!("세션 {:08x} 강제 종료", self.ctx.session_id);
        let mut out = Vec::new();
        self.finish(SessionOutcome::Cancelled, &mut out);
        out
    }

    fn finish(&mut self, outcome: SessionOutcome, out: &mut Vec<SenderAction>) {
        self.phase = SessionPhase::Complete;
        let status = match outcome {
            SessionOutcome::Completed => SenderStatus::Complete,
            _ => SenderStatus::ForcedEnd,
        };
        self.post_progress(status);
        self.task = None;
        info!(
            "세션 {:08x} 종료 ({:?}): {}",
            self.ctx.session_id,
            outcome,
            self.ctx.stats.summary()
        );
        self.outcome = Some(outcome.clone());
        out.push(SenderAction::CancelTimers);
        out.push(SenderAction::Finished(outcome));
    }

    fn announce_message<'a>(&self, allowed_clients: MemberIds<'a>) -> Message<'a> {
        Message::Announce(Announce {
            sync_mode: true,
            sync_preview: false,
            robust_factor: self.ctx.robust_factor,
            cc_mode: CongestionMode::None,
            block_size: self.ctx.block_size,
            timestamp: Timestamp::now(),
            public_group: self.public_group,
            private_group: self.ctx.private_dest.ip(),
            allowed_clients,
        })
    }

    fn send_announce(&mut self, out: &mut Vec<SenderAction>) {
        self.phase = SessionPhase::Announcing;
        self.post_progress(SenderStatus::Announcing);

        if self.ctx.open_group {
            let message = self.announce_message(MemberIds::default());
            self.ctx.send_to_public(&message, out);
        } else {
            // 아직 등록하지 않은 허용 수신자만 나열, 남은 수신자가 없으면 생략
            for ids in self.ctx.target_batches(|p| p.status == MemberStatus::Mute) {
                let message = self.announce_message(MemberIds::new(&ids));
                self.ctx.send_to_public(&message, out);
            }
        }

        let timer = if self.rounds < self.ctx.robust_factor {
            self.rounds += 1;
            SenderTimer::AnnounceRound
        } else {
            SenderTimer::EnterTransfer
        };
        out.push(SenderAction::Schedule {
            after: self.ctx.round_interval(),
            timer,
        });
    }

    /// 등록했지만 확인받지 못한 수신자에게 RegConf
    fn send_reg_conf(&mut self, out: &mut Vec<SenderAction>) {
        let pending = |p: &ReceiverProperties| {
            p.status == MemberStatus::Registered && !p.confirm_sent && !p.is_proxy
        };
        let batches = self.ctx.target_batches(pending);
        if batches.is_empty() {
            return;
        }
        self.post_progress(SenderStatus::ConfirmingRegistration);
        for ids in &batches {
            let message = Message::RegConf(IdList {
                receiver_ids: MemberIds::new(ids),
            });
            self.ctx.send_to_group(&message, out);
        }
        for props in self.ctx.receivers.values_mut() {
            if pending(props) {
                props.confirm_sent = true;
            }
        }
    }

    pub fn on_timer(&mut self, timer: SenderTimer) -> Vec<SenderAction> {
        let mut out = Vec::new();
        match (timer, self.phase) {
            (SenderTimer::AnnounceRound, SessionPhase::Announcing) => {
                self.ctx.refine_grtt(|p| p.status == MemberStatus::Registered);
                self.send_reg_conf(&mut out);
                self.send_announce(&mut out);
            }
            (SenderTimer::EnterTransfer, SessionPhase::Announcing) => {
                self.send_reg_conf(&mut out);
                self.enter_transfer(&mut out);
            }
            (SenderTimer::SessionDoneRound, SessionPhase::Ending) => {
                self.send_session_done(&mut out);
            }
            (_, SessionPhase::Transferring) => {
                if let Some(task) = self.task.as_mut() {
                    let progress = task.on_timer(&mut self.ctx, timer, &mut out);
                    if timer == SenderTimer::StartSending {
                        self.post_progress(SenderStatus::Transferring);
                    }
                    self.after_task(progress, &mut out);
                }
            }
            _ => debug!("무시된 타이머: {:?} ({:?})", timer, self.phase),
        }
        out
    }

    fn enter_transfer(&mut self, out: &mut Vec<SenderAction>) {
        let confirmed = self
            .ctx
            .any(|p| p.status == MemberStatus::Registered && p.confirm_sent);
        if !confirmed {
            warn!("세션 {:08x}: 등록한 수신자 없음", self.ctx.session_id);
            self.finish(SessionOutcome::NoReceivers, out);
            return;
        }
        let mute = self.ctx.transition(|p| p.status == MemberStatus::Mute, MemberStatus::Lost);
        if mute > 0 {
            warn!("등록하지 않은 허용 수신자 {}명", mute);
        }
        info!(
            "세션 {:08x} 전송 단계 진입: 수신자 {}명, GRTT {:?}",
            self.ctx.session_id,
            self.ctx.count(|p| p.status == MemberStatus::Registered && !p.is_proxy),
            self.ctx.grtt
        );
        self.phase = SessionPhase::Transferring;
        self.next_file(out);
    }

    /// 다음 파일 태스크 시작, 남은 파일이 없으면 세션 종료 단계
    fn next_file(&mut self, out: &mut Vec<SenderAction>) {
        out.push(SenderAction::CancelTimers);
        self.task = None;

        while let Some(entry) = self.files.pop_front() {
            if !self.ctx.any(|p| p.status.is_live() && !p.is_proxy) {
                warn!("남은 수신자가 없어 나머지 파일 생략");
                break;
            }
            let file_id = self.next_file_id;
            self.next_file_id = self.next_file_id.wrapping_add(1).max(1);

            match FileSendTask::prepare(&self.ctx, self.fs.as_ref(), entry.clone(), file_id, self.follow_symlinks) {
                Ok(mut task) => {
                    self.ctx
                        .transition(|p| p.status == MemberStatus::Done, MemberStatus::Registered);
                    self.ctx.stats.files += 1;
                    task.start(&mut self.ctx, out);
                    self.task = Some(task);
                    self.post_progress(SenderStatus::Announcing);
                    return;
                }
                Err(e) => {
                    warn!("파일 준비 실패: {}: {}", entry.path.display(), e);
                    if self.ctx.quit_on_error {
                        self.finish(SessionOutcome::Failed(e.to_string()), out);
                        return;
                    }
                }
            }
        }

        self.phase = SessionPhase::Ending;
        self.rounds = 0;
        self.post_progress(SenderStatus::SendingDoneNotification);
        self.send_session_done(out);
    }

    fn after_task(&mut self, progress: TaskProgress, out: &mut Vec<SenderAction>) {
        match progress {
            TaskProgress::Running => {}
            TaskProgress::Finished => {
                if let Some(task) = &self.task {
                    info!("파일 #{} 완료: {}", task.file_id(), task.entry().remote_name);
                }
                self.next_file(out);
            }
            TaskProgress::Failed(reason) => {
                warn!("파일 전송 실패: {}", reason);
                self.finish(SessionOutcome::Failed(reason), out);
            }
        }
    }

    /// 세션 종료 Done(file 0) 라운드
    fn send_session_done(&mut self, out: &mut Vec<SenderAction>) {
        let pending: Vec<MemberId> = self
            .ctx
            .receivers
            .iter()
            .filter(|(id, p)| !p.is_proxy && p.status.is_live() && !self.session_acked.contains(id))
            .map(|(id, _)| *id)
            .collect();

        if pending.is_empty() || self.rounds >= self.ctx.robust_factor {
            self.send_done_conf(out);
            return;
        }
        self.rounds += 1;

        let per_packet = (self.ctx.block_size as usize / 4).max(1);
        for chunk in pending.chunks(per_packet) {
            let raw = crate::message::encode_member_ids(chunk);
            let message = Message::Done(Done {
                file_id: 0,
                section: 0,
                receiver_ids: MemberIds::new(&raw),
            });
            self.ctx.send_to_group(&message, out);
        }
        out.push(SenderAction::Schedule {
            after: self.ctx.round_interval(),
            timer: SenderTimer::SessionDoneRound,
        });
    }

    fn send_done_conf(&mut self, out: &mut Vec<SenderAction>) {
        let batches = self.ctx.target_batches(|p| p.status.is_live());
        for ids in &batches {
            let message = Message::DoneConf(IdList {
                receiver_ids: MemberIds::new(ids),
            });
            self.ctx.send_to_group(&message, out);
        }
        self.finish(SessionOutcome::Completed, out);
    }

    /// 디스크 유닛의 블록 읽기 결과
    pub fn on_blocks_read(
        &mut self,
        file_id: FileId,
        resend: bool,
        result: Result<Vec<(u64, Bytes)>>,
    ) -> Vec<SenderAction> {
        let mut out = Vec::new();
        if self.phase != SessionPhase::Transferring {
            return out;
        }
        let Some(task) = self.task.as_mut() else {
            return out;
        };
        if task.file_id() != file_id {
            debug!("이전 파일의 블록 읽기 결과 무시: #{}", file_id);
            return out;
        }
        let before = task.phase();
        let progress = task.on_blocks_read(&mut self.ctx, resend, result, &mut out);
        if before != task.phase() {
            match task.phase() {
                crate::sender::file_task::TaskPhase::SendingLost => {
                    self.post_progress(SenderStatus::Retransferring)
                }
                crate::sender::file_task::TaskPhase::WaitingClientStatus => {
                    self.post_progress(SenderStatus::SendingDoneNotification)
                }
                _ => {}
            }
        }
        self.after_task(progress, &mut out);
        out
    }

    /// 수신 패킷 처리
    pub fn handle_packet(&mut self, data: &[u8]) -> Vec<SenderAction> {
        let mut out = Vec::new();
        if self.phase == SessionPhase::Complete {
            return out;
        }
        let Some(packet) = validate_packet(data) else {
            return out;
        };
        if !self.filter().accepts(&packet) {
            return out;
        }
        let Some(message) = Message::parse(&packet) else {
            debug!("파싱 실패: {:?}", packet.header.role);
            return out;
        };
        let source_id = packet.header.source_id;

        match message {
            Message::Register(register) => self.on_register(source_id, &register),
            Message::FileInfoAck(ack) => {
                if let Some(task) = self.task.as_mut() {
                    task.on_file_info_ack(&mut self.ctx, source_id, &ack);
                }
            }
            Message::Status(status) => {
                if let Some(task) = self.task.as_mut() {
                    task.on_status(&mut self.ctx, source_id, &status);
                }
            }
            Message::Complete(complete) => {
                if complete.file_id == 0 {
                    self.on_session_complete(source_id, &complete.receiver_ids, &mut out);
                } else if let Some(task) = self.task.as_mut() {
                    let progress = task.on_complete(&mut self.ctx, source_id, &complete);
                    self.after_task(progress, &mut out);
                }
            }
            Message::Abort(abort) => match self.task.as_mut() {
                Some(task) => {
                    let progress = task.on_abort(&mut self.ctx, source_id, &abort);
                    self.after_task(progress, &mut out);
                }
                None => apply_abort(&mut self.ctx, source_id, &abort),
            },
            other => debug!("송신측에서 처리하지 않는 메시지: {:?}", other.role()),
        }
        out
    }

    fn on_register(&mut self, source_id: MemberId, register: &Register<'_>) {
        if self.phase != SessionPhase::Announcing {
            return;
        }
        let rtt = register.timestamp.rtt();
        let open_group = self.ctx.open_group;
        let allowed = |ctx: &SenderContext, id: MemberId| open_group || ctx.receivers.contains_key(&id);

        if register.receiver_ids.is_empty() {
            if !allowed(&self.ctx, source_id) {
                debug!("허용되지 않은 수신자 등록 무시: {:08x}", source_id);
                return;
            }
            let props = self
                .ctx
                .receivers
                .entry(source_id)
                .or_insert_with(|| ReceiverProperties::new(MemberStatus::Registered));
            if props.is_proxy {
                return;
            }
            props.status = MemberStatus::Registered;
            props.confirm_sent = false;
            props.rtt = Some(rtt);
            debug!("수신자 등록: {:08x} (rtt {:?})", source_id, rtt);
        } else {
            if matches!(self.ctx.receivers.get(&source_id), Some(p) if !p.is_proxy) {
                debug!("proxy 등록 무시 (이미 일반 수신자): {:08x}", source_id);
                return;
            }
            self.ctx.receivers.insert(
                source_id,
                ReceiverProperties {
                    status: MemberStatus::Registered,
                    confirm_sent: false,
                    is_proxy: true,
                    rtt: Some(rtt),
                },
            );
            for id in register.receiver_ids.iter() {
                if !allowed(&self.ctx, id) {
                    continue;
                }
                let props = self
                    .ctx
                    .receivers
                    .entry(id)
                    .or_insert_with(|| ReceiverProperties::new(MemberStatus::Registered));
                props.status = MemberStatus::Registered;
                props.confirm_sent = false;
                props.rtt = Some(rtt);
            }
            debug!(
                "proxy 등록: {:08x} ({}명 대표)",
                source_id,
                register.receiver_ids.len()
            );
        }
    }

    fn on_session_complete(
        &mut self,
        source_id: MemberId,
        receiver_ids: &MemberIds<'_>,
        out: &mut Vec<SenderAction>,
    ) {
        if self.phase != SessionPhase::Ending {
            return;
        }
        match self.ctx.receivers.get(&source_id) {
            Some(p) if p.is_proxy => self.session_acked.extend(receiver_ids.iter()),
            Some(_) => {
                self.session_acked.insert(source_id);
            }
            None => return,
        }
        let all_acked = self
            .ctx
            .receivers
            .iter()
            .filter(|(_, p)| !p.is_proxy && p.status.is_live())
            .all(|(id, _)| self.session_acked.contains(id));
        if all_acked {
            self.send_done_conf(out);
        }
    }

    /// 현재 파일 경로
    pub fn current_path(&self) -> Option<PathBuf> {
        self.task.as_ref().map(|t| t.entry().path.clone())
    }
}

impl std::fmt::Debug for DeliverySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliverySession")
            .field("session_id", &self.ctx.session_id)
            .field("phase", &self.phase)
            .field("remaining_files", &self.files.len())
            .finish()
    }
}
