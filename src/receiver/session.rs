//! 수신(accept) 세션
//!
//! registering → receiving → completed
//!
//! 송신자 하나와의 대화를 맡는다. 등록 후 FileInfo마다 파일 태스크를 새로 만들고,
//! Done(0)/DoneConf 교환으로 세션을 마친다. 입출력은 워커가 [`ReceiverAction`]으로 실행한다.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::fs::FileSystem;
use crate::message::{
    validate_packet, Abort, Complete, CompleteStatus, Done, FileInfo, MemberId, MemberIds, Message,
    Register,
};
use crate::progress::{ProgressEvent, ProgressSink, ProgressStatus, ReceiverStatus};
use crate::receiver::context::{DiskEvent, ReceiverAction, ReceiverContext, ReceiverOutcome, ReceiverTimer};
use crate::receiver::file_task::{Destinations, FileReceiveTask, ReceivePhase};
use crate::receiver::monitor::{LiveSession, SessionLaunch};
use crate::stats::TransferStats;
use crate::transport::SessionFilter;

/// Register 재시도 간격 (GRTT 배수)
const REGISTER_RETRY_FACTOR: u32 = 5;

/// 세션 단계
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptPhase {
    Registering,
    Receiving,
    Completed,
}

/// 수신 세션 코어
pub struct AcceptSession {
    ctx: ReceiverContext,
    phase: AcceptPhase,
    register_rounds: u8,
    live: Arc<LiveSession>,
    task: Option<FileReceiveTask>,
    /// Done(0)에 Complete로 응답함
    session_done: bool,
    destinations: Arc<Destinations>,
    quit_on_error: bool,
    outcome: Option<ReceiverOutcome>,
    fs: Arc<dyn FileSystem>,
    progress: Arc<ProgressSink>,
}

impl AcceptSession {
    pub fn new(
        launch: SessionLaunch,
        receiver_id: MemberId,
        destinations: Arc<Destinations>,
        quit_on_error: bool,
        fs: Arc<dyn FileSystem>,
        progress: Arc<ProgressSink>,
    ) -> Self {
        let ctx = ReceiverContext::new(
            receiver_id,
            launch.sender_id,
            launch.session_id,
            launch.grtt,
            launch.robust_factor,
            launch.block_size,
        );
        Self {
            ctx,
            phase: AcceptPhase::Registering,
            register_rounds: 0,
            live: launch.live,
            task: None,
            session_done: false,
            destinations,
            quit_on_error,
            outcome: None,
            fs,
            progress,
        }
    }

    pub fn session_id(&self) -> u32 {
        self.ctx.session_id
    }

    pub fn phase(&self) -> AcceptPhase {
        self.phase
    }

    pub fn context(&self) -> &ReceiverContext {
        &self.ctx
    }

    pub fn stats(&self) -> &TransferStats {
        &self.ctx.stats
    }

    pub fn outcome(&self) -> Option<&ReceiverOutcome> {
        self.outcome.as_ref()
    }

    pub fn grtt(&self) -> Duration {
        self.ctx.grtt
    }

    pub fn timeout_factor(&self) -> u32 {
        self.ctx.timeout_factor()
    }

    /// 세션 ID와 송신자 ID가 모두 일치해야 한다
    pub fn filter(&self) -> SessionFilter {
        SessionFilter {
            session_id: self.ctx.session_id,
            source_id: Some(self.ctx.sender_id),
        }
    }

    /// 현재 파일 경로 (저장 위치가 정해지기 전이면 원격 이름)
    pub fn current_path(&self) -> PathBuf {
        match &self.task {
            Some(task) => task
                .final_path()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(task.name())),
            None => PathBuf::new(),
        }
    }

    fn post_progress(&self, status: ReceiverStatus) {
        self.progress.post(ProgressEvent {
            session_id: self.ctx.session_id,
            status: ProgressStatus::Receiver(status),
            path: self.current_path(),
        });
    }

    /// 세션 시작: 첫 Register
    pub fn start(&mut self) -> Vec<ReceiverAction> {
        info!(
            "수신 세션 {:08x} 시작: 송신자 {:08x}, 수신자 {:08x}",
            self.ctx.session_id, self.ctx.sender_id, self.ctx.receiver_id
        );
        let mut out = Vec::new();
        self.post_progress(ReceiverStatus::WaitingRegistrationConfirm);
        self.send_register(&mut out);
        out
    }

    fn send_register(&mut self, out: &mut Vec<ReceiverAction>) {
        self.register_rounds += 1;
        let message = Message::Register(Register {
            key_length: 0,
            timestamp: self.live.latest_announce(),
            nonce: rand::random(),
            receiver_ids: MemberIds::default(),
        });
        self.ctx.send(&message, out);
        out.push(ReceiverAction::Schedule {
            after: self.ctx.grtt * REGISTER_RETRY_FACTOR,
            timer: ReceiverTimer::RegisterRetry,
        });
    }

    pub fn on_timer(&mut self, timer: ReceiverTimer) -> Vec<ReceiverAction> {
        let mut out = Vec::new();
        match (timer, self.phase) {
            (ReceiverTimer::RegisterRetry, AcceptPhase::Registering) => {
                if self.register_rounds >= self.ctx.robust_factor {
                    warn!("수신 세션 {:08x}: 등록 확인 없음", self.ctx.session_id);
                    self.finish(ReceiverOutcome::Unconfirmed, &mut out);
                } else {
                    debug!("Register 재전송 ({}회)", self.register_rounds);
                    self.send_register(&mut out);
                }
            }
            _ => debug!("무시된 타이머: {:?} ({:?})", timer, self.phase),
        }
        out
    }

    /// 강제 종료
    ///
    /// Done(0)에 이미 응답한 세션의 시간 초과는 DoneConf 유실로 보고 완료로 처리한다.
    pub fn force_end(&mut self, outcome: ReceiverOutcome) -> Vec<ReceiverAction> {
        let mut out = Vec::new();
        if self.phase == AcceptPhase::Completed {
            return out;
        }
        let outcome = match outcome {
            ReceiverOutcome::TimedOut if self.session_done => ReceiverOutcome::Completed,
            other => other,
        };
        if outcome != ReceiverOutcome::Completed {
            warn!("수신 세션 {:08x} 강제 종료: {:?}", self.ctx.session_id, outcome);
        }
        self.finish(outcome, &mut out);
        out
    }

    fn finish(&mut self, outcome: ReceiverOutcome, out: &mut Vec<ReceiverAction>) {
        self.phase = AcceptPhase::Completed;
        self.post_progress(ReceiverStatus::Complete);
        info!(
            "수신 세션 {:08x} 종료 ({:?}): {}",
            self.ctx.session_id,
            outcome,
            self.ctx.stats.summary()
        );
        self.outcome = Some(outcome.clone());
        out.push(ReceiverAction::CancelTimers);
        out.push(ReceiverAction::Finished(outcome));
    }

    fn confirm(&mut self, out: &mut Vec<ReceiverAction>) {
        if self.phase != AcceptPhase::Registering {
            return;
        }
        info!(
            "수신 세션 {:08x} 등록 확인 (GRTT {:?})",
            self.ctx.session_id, self.ctx.grtt
        );
        self.phase = AcceptPhase::Receiving;
        self.register_rounds = 0;
        out.push(ReceiverAction::CancelTimers);
        self.post_progress(ReceiverStatus::WaitingFileInfo);
    }

    /// 수신 패킷 처리
    ///
    /// 이 세션의 패킷이 아니면 `None`.
    pub fn handle_packet(&mut self, data: &[u8]) -> Option<Vec<ReceiverAction>> {
        if self.phase == AcceptPhase::Completed {
            return None;
        }
        let packet = validate_packet(data)?;
        if !self.filter().accepts(&packet) {
            return None;
        }
        let Some(message) = Message::parse(&packet) else {
            debug!("파싱 실패: {:?}", packet.header.role);
            return None;
        };
        self.ctx.adopt_grtt(packet.header.grtt);
        self.ctx.last_role = Some(packet.header.role);

        let me = self.ctx.receiver_id;
        let mut out = Vec::new();
        match message {
            Message::RegConf(conf) => {
                if conf.receiver_ids.contains(me) {
                    self.confirm(&mut out);
                }
            }
            Message::FileInfo(info) => {
                if info.receiver_ids.contains(me) {
                    self.on_file_info(&info, &mut out);
                }
            }
            Message::FileSeg(seg) => {
                if let Some(task) = self.task.as_mut() {
                    task.on_file_seg(&mut self.ctx, &seg, &mut out);
                }
            }
            Message::Done(done) => {
                if done.receiver_ids.is_empty() || done.receiver_ids.contains(me) {
                    self.on_done(&done, &mut out);
                }
            }
            Message::DoneConf(conf) => {
                if conf.receiver_ids.contains(me) {
                    self.finish(ReceiverOutcome::Completed, &mut out);
                }
            }
            Message::Abort(abort) => {
                let text = String::from_utf8_lossy(abort.text).into_owned();
                warn!("송신자 중단: {}", text);
                self.finish(ReceiverOutcome::Failed(text), &mut out);
            }
            other => debug!("수신측에서 처리하지 않는 메시지: {:?}", other.role()),
        }
        self.check_rejection(&mut out);
        Some(out)
    }

    fn on_file_info(&mut self, info: &FileInfo<'_>, out: &mut Vec<ReceiverAction>) {
        // 확인 메시지가 유실되어도 FileInfo가 자신을 지목하면 등록된 것
        self.confirm(out);

        let start_new = match &self.task {
            None => true,
            Some(task) => task.file_id() != info.file_id && task.phase().is_terminal(),
        };
        if start_new {
            self.task = Some(FileReceiveTask::new(info.file_id));
        }
        let Some(task) = self.task.as_mut() else {
            return;
        };
        if task.file_id() != info.file_id {
            debug!(
                "파일 #{} 처리 중, FileInfo #{} 무시",
                task.file_id(),
                info.file_id
            );
            return;
        }
        task.on_file_info(
            &mut self.ctx,
            self.fs.as_ref(),
            &self.destinations,
            info,
            out,
        );
        if start_new {
            self.post_progress(ReceiverStatus::ReceivingData);
        }
    }

    fn on_done(&mut self, done: &Done<'_>, out: &mut Vec<ReceiverAction>) {
        if done.file_id != 0 {
            if let Some(task) = self.task.as_mut() {
                task.on_done(&mut self.ctx, done, out);
            }
            return;
        }

        let idle = self.task.as_ref().map_or(true, |t| t.phase().is_terminal());
        if !idle {
            let file_id = self.task.as_ref().map_or(0, FileReceiveTask::file_id);
            warn!("파일 #{} 수신 중 세션 종료 통보", file_id);
            self.finish(
                ReceiverOutcome::Failed(format!("파일 #{} 수신 중 세션 종료", file_id)),
                out,
            );
            return;
        }
        if !self.session_done {
            debug!("수신 세션 {:08x} 모든 파일 처리, DoneConf 대기", self.ctx.session_id);
        }
        self.session_done = true;
        let message = Message::Complete(Complete {
            file_id: 0,
            status: CompleteStatus::Normal,
            receiver_ids: MemberIds::default(),
        });
        self.ctx.send(&message, out);
    }

    /// 디스크 유닛 결과 반영
    pub fn on_disk_event(&mut self, event: DiskEvent) -> Vec<ReceiverAction> {
        let mut out = Vec::new();
        if self.phase == AcceptPhase::Completed {
            return out;
        }
        if let Some(task) = self.task.as_mut() {
            task.on_disk_event(&mut self.ctx, event, &mut out);
        }
        self.check_rejection(&mut out);
        out
    }

    /// quit_on_error이면 거부된 파일이 세션 전체를 끝낸다
    fn check_rejection(&mut self, out: &mut Vec<ReceiverAction>) {
        if !self.quit_on_error || self.phase == AcceptPhase::Completed {
            return;
        }
        let Some(task) = self.task.as_ref().filter(|t| t.phase() == ReceivePhase::Rejected) else {
            return;
        };
        let reason = format!("파일 #{} 거부: {}", task.file_id(), task.name());
        let message = Message::Abort(Abort {
            current_file: false,
            host: 0,
            text: reason.as_bytes(),
        });
        self.ctx.send(&message, out);
        self.finish(ReceiverOutcome::Failed(reason), out);
    }
}

impl std::fmt::Debug for AcceptSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcceptSession")
            .field("session_id", &self.ctx.session_id)
            .field("sender_id", &self.ctx.sender_id)
            .field("phase", &self.phase)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::LocalFileSystem;
    use crate::message::{
        encode_packet, quantize_grtt, FileKind, FileSeg, IdList, ProtocolHeader, Role, Timestamp,
    };
    use crate::receiver::context::DiskJob;
    use bytes::Bytes;
    use std::path::Path;

    const SENDER: MemberId = 1;
    const ME: MemberId = 2;
    const SESSION: u32 = 0x77;

    fn launch(robust: u8) -> SessionLaunch {
        SessionLaunch {
            sender: "127.0.0.1:1044".parse().unwrap(),
            sender_id: SENDER,
            session_id: SESSION,
            private_group: "230.5.5.8".parse().unwrap(),
            grtt: Duration::from_millis(100),
            robust_factor: robust,
            block_size: 4,
            live: Arc::new(LiveSession::new(SESSION, Timestamp(42))),
        }
    }

    fn session(dir: &Path, robust: u8, quit_on_error: bool) -> AcceptSession {
        let destinations = Destinations {
            dirs: vec![dir.to_path_buf()],
            temp_dirs: Vec::new(),
        };
        AcceptSession::new(
            launch(robust),
            ME,
            Arc::new(destinations),
            quit_on_error,
            Arc::new(LocalFileSystem),
            Arc::new(ProgressSink::new()),
        )
    }

    fn from(source_id: MemberId, session_id: u32, message: &Message<'_>) -> Bytes {
        let header = ProtocolHeader {
            role: message.role(),
            sequence: 1,
            source_id,
            session_id,
            group_instance: 0,
            grtt: quantize_grtt(0.1),
            group_size: 0,
        };
        encode_packet(&header, message)
    }

    fn from_sender(message: &Message<'_>) -> Bytes {
        from(SENDER, SESSION, message)
    }

    fn me_only() -> Vec<u8> {
        ME.to_be_bytes().to_vec()
    }

    fn file_info<'a>(file_id: u16, name: &'a [u8], size: u64, ids: &'a [u8]) -> Message<'a> {
        Message::FileInfo(FileInfo {
            file_id,
            kind: FileKind::Regular,
            size,
            mtime: 1_650_000_000,
            name,
            link: &[],
            content_hash: None,
            timestamp: Timestamp::now(),
            receiver_ids: MemberIds::new(ids),
        })
    }

    fn done<'a>(file_id: u16, ids: &'a [u8]) -> Message<'a> {
        Message::Done(Done {
            file_id,
            section: 0,
            receiver_ids: MemberIds::new(ids),
        })
    }

    fn sent(out: &[ReceiverAction]) -> Vec<Message<'_>> {
        out.iter()
            .filter_map(|a| match a {
                ReceiverAction::Send(packet) => Message::parse(&validate_packet(packet)?),
                _ => None,
            })
            .collect()
    }

    fn finished(out: &[ReceiverAction]) -> Option<ReceiverOutcome> {
        out.iter().find_map(|a| match a {
            ReceiverAction::Finished(o) => Some(o.clone()),
            _ => None,
        })
    }

    /// 디스크 작업을 즉시 실행하고 결과를 세션에 돌려준다
    fn settle(session: &mut AcceptSession, out: Vec<ReceiverAction>) -> Vec<ReceiverAction> {
        let mut replies = Vec::new();
        let mut jobs: Vec<DiskJob> = Vec::new();
        for action in out {
            match action {
                ReceiverAction::Disk(job) => jobs.push(job),
                other => replies.push(other),
            }
        }
        for job in jobs {
            if let Some(event) = job.run(&LocalFileSystem) {
                replies.extend(session.on_disk_event(event));
            }
        }
        replies
    }

    #[test]
    fn test_register_retries_then_unconfirmed() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(dir.path(), 2, false);

        let out = session.start();
        match sent(&out).as_slice() {
            [Message::Register(register)] => {
                assert_eq!(register.timestamp, Timestamp(42));
                assert!(register.receiver_ids.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(out.iter().any(|a| matches!(
            a,
            ReceiverAction::Schedule { after, timer: ReceiverTimer::RegisterRetry }
                if *after == Duration::from_millis(500)
        )));

        let out = session.on_timer(ReceiverTimer::RegisterRetry);
        assert!(matches!(sent(&out).as_slice(), [Message::Register(_)]));

        let out = session.on_timer(ReceiverTimer::RegisterRetry);
        assert_eq!(finished(&out), Some(ReceiverOutcome::Unconfirmed));
        assert_eq!(session.phase(), AcceptPhase::Completed);
        assert!(session.on_timer(ReceiverTimer::RegisterRetry).is_empty());
    }

    #[test]
    fn test_full_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(dir.path(), 5, false);
        session.start();

        // 다른 수신자만 지목한 RegConf는 무시
        let other = 9u32.to_be_bytes();
        let conf = Message::RegConf(IdList { receiver_ids: MemberIds::new(&other) });
        let out = session.handle_packet(&from_sender(&conf)).unwrap();
        assert!(out.is_empty());
        assert_eq!(session.phase(), AcceptPhase::Registering);

        let ids = me_only();
        let conf = Message::RegConf(IdList { receiver_ids: MemberIds::new(&ids) });
        let out = session.handle_packet(&from_sender(&conf)).unwrap();
        assert!(matches!(out.as_slice(), [ReceiverAction::CancelTimers]));
        assert_eq!(session.phase(), AcceptPhase::Receiving);

        let out = session
            .handle_packet(&from_sender(&file_info(1, b"data.bin", 6, &ids)))
            .unwrap();
        let out = settle(&mut session, out);
        assert!(matches!(sent(&out).as_slice(), [Message::FileInfoAck(_)]));

        for (block, data) in [(0u16, &b"abcd"[..]), (1, &b"ef"[..])] {
            let seg = Message::FileSeg(FileSeg { file_id: 1, section: 0, block, data });
            let out = session.handle_packet(&from_sender(&seg)).unwrap();
            assert!(settle(&mut session, out).is_empty());
        }

        let out = session.handle_packet(&from_sender(&done(1, &ids))).unwrap();
        let out = settle(&mut session, out);
        assert!(matches!(
            sent(&out).as_slice(),
            [Message::Complete(Complete { file_id: 1, status: CompleteStatus::Normal, .. })]
        ));
        assert_eq!(std::fs::read(dir.path().join("data.bin")).unwrap(), b"abcdef");
        assert_eq!(session.stats().files, 1);

        let out = session.handle_packet(&from_sender(&done(0, &ids))).unwrap();
        assert!(matches!(
            sent(&out).as_slice(),
            [Message::Complete(Complete { file_id: 0, .. })]
        ));

        let conf = Message::DoneConf(IdList { receiver_ids: MemberIds::new(&ids) });
        let out = session.handle_packet(&from_sender(&conf)).unwrap();
        assert_eq!(finished(&out), Some(ReceiverOutcome::Completed));
        assert!(session.handle_packet(&from_sender(&conf)).is_none());
    }

    #[test]
    fn test_foreign_packets_are_not_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(dir.path(), 5, false);
        session.start();
        let ids = me_only();
        let conf = Message::RegConf(IdList { receiver_ids: MemberIds::new(&ids) });

        assert!(session.handle_packet(&from(SENDER, SESSION + 1, &conf)).is_none());
        assert!(session.handle_packet(&from(SENDER + 1, SESSION, &conf)).is_none());
        assert!(session.handle_packet(&[0x50, 4, 0]).is_none());
        assert_eq!(session.phase(), AcceptPhase::Registering);
    }

    #[test]
    fn test_file_info_confirms_and_next_file_replaces_task() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(dir.path(), 5, false);
        session.start();
        let ids = me_only();

        // RegConf 유실, 빈 파일은 즉시 마무리
        let out = session
            .handle_packet(&from_sender(&file_info(1, b"empty", 0, &ids)))
            .unwrap();
        assert_eq!(session.phase(), AcceptPhase::Receiving);
        let out = settle(&mut session, out);
        assert!(matches!(
            sent(&out).as_slice(),
            [Message::Complete(Complete { file_id: 1, .. })]
        ));

        let out = session
            .handle_packet(&from_sender(&file_info(2, b"next", 4, &ids)))
            .unwrap();
        let out = settle(&mut session, out);
        assert!(matches!(sent(&out).as_slice(), [Message::FileInfoAck(_)]));
        assert_eq!(session.current_path(), dir.path().join("next"));

        // 진행 중인 파일이 있으면 다른 FileInfo는 무시
        let out = session
            .handle_packet(&from_sender(&file_info(3, b"third", 4, &ids)))
            .unwrap();
        assert!(out.is_empty());

        // 파일 수신 중 세션 종료 통보는 실패
        let out = session.handle_packet(&from_sender(&done(0, &[]))).unwrap();
        assert!(matches!(finished(&out), Some(ReceiverOutcome::Failed(_))));
    }

    #[test]
    fn test_rejection_with_quit_on_error_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(dir.path(), 5, true);
        session.start();
        let ids = me_only();

        let out = session
            .handle_packet(&from_sender(&file_info(1, b"../outside", 4, &ids)))
            .unwrap();
        let messages = sent(&out);
        assert!(matches!(
            messages.as_slice(),
            [
                Message::Complete(Complete { status: CompleteStatus::Rejected, .. }),
                Message::Abort(_)
            ]
        ));
        assert!(matches!(finished(&out), Some(ReceiverOutcome::Failed(_))));
    }

    #[test]
    fn test_timeout_after_session_done_counts_as_completed() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(dir.path(), 5, false);
        session.start();
        let ids = me_only();
        let conf = Message::RegConf(IdList { receiver_ids: MemberIds::new(&ids) });
        session.handle_packet(&from_sender(&conf)).unwrap();
        assert_eq!(session.timeout_factor(), 5);

        session.handle_packet(&from_sender(&done(0, &ids))).unwrap();
        assert_eq!(session.timeout_factor(), 4);

        let out = session.force_end(ReceiverOutcome::TimedOut);
        assert_eq!(finished(&out), Some(ReceiverOutcome::Completed));
        assert!(session.force_end(ReceiverOutcome::Cancelled).is_empty());
    }

    #[test]
    fn test_sender_abort_fails_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(dir.path(), 5, false);
        session.start();
        let abort = Message::Abort(Abort {
            current_file: false,
            host: 0,
            text: b"bye",
        });
        let out = session.handle_packet(&from_sender(&abort)).unwrap();
        assert_eq!(finished(&out), Some(ReceiverOutcome::Failed("bye".to_string())));
        assert_eq!(session.outcome(), Some(&ReceiverOutcome::Failed("bye".to_string())));
    }
}
