//! 수신 세션 워커
//!
//! 세션 코어의 동작을 실행한다. 응답은 송신자 주소로 유니캐스트하고, 디스크 작업은 디스크
//! 유닛에 순서대로 올린다. 유효한 패킷이 일정 시간 없으면 세션을 시간 초과로 끝낸다.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use crate::executor::{DiskUnit, Lease};
use crate::fs::FileSystem;
use crate::receiver::context::{DiskEvent, ReceiverAction, ReceiverOutcome, ReceiverTimer};
use crate::receiver::session::AcceptSession;
use crate::transport::{StopHandle, StopSignal, TimerQueue, Watchdog, RECV_BUFFER_LEN};

/// 수신 세션 워커
pub struct AcceptWorker {
    session: AcceptSession,
    socket: UdpSocket,
    sender: SocketAddr,
    disk: Lease<DiskUnit>,
    fs: Arc<dyn FileSystem>,
    timers: TimerQueue<ReceiverTimer>,
    stop: StopSignal,
    events_tx: mpsc::UnboundedSender<DiskEvent>,
    events_rx: mpsc::UnboundedReceiver<DiskEvent>,
    outcome: Option<ReceiverOutcome>,
}

impl AcceptWorker {
    pub fn new(
        session: AcceptSession,
        socket: UdpSocket,
        sender: SocketAddr,
        disk: Lease<DiskUnit>,
        fs: Arc<dyn FileSystem>,
    ) -> (Self, StopHandle) {
        let (handle, stop) = StopHandle::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let worker = Self {
            session,
            socket,
            sender,
            disk,
            fs,
            timers: TimerQueue::new(),
            stop,
            events_tx,
            events_rx,
            outcome: None,
        };
        (worker, handle)
    }

    /// 세션이 끝날 때까지 구동
    pub async fn run(mut self) -> ReceiverOutcome {
        let actions = self.session.start();
        self.execute(actions).await;

        let mut buf = vec![0u8; RECV_BUFFER_LEN];
        let mut watchdog = Watchdog::new(self.session.grtt(), self.session.timeout_factor());

        while self.outcome.is_none() {
            let deadline = self.timers.next_deadline();

            tokio::select! {
                _ = self.stop.requested() => {
                    let actions = self.session.force_end(ReceiverOutcome::Cancelled);
                    self.execute(actions).await;
                }
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, _from)) => {
                            if let Some(actions) = self.session.handle_packet(&buf[..len]) {
                                watchdog.feed(self.session.grtt(), self.session.timeout_factor());
                                self.execute(actions).await;
                            }
                        }
                        Err(e) => warn!("수신 에러: {}", e),
                    }
                }
                Some(event) = self.events_rx.recv() => {
                    let actions = self.session.on_disk_event(event);
                    self.execute(actions).await;
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    for timer in self.timers.pop_expired(Instant::now()) {
                        let actions = self.session.on_timer(timer);
                        self.execute(actions).await;
                        if self.outcome.is_some() {
                            break;
                        }
                    }
                }
                _ = sleep_until(watchdog.deadline()) => {
                    warn!("수신 세션 {:08x}: 비활성 시간 초과", self.session.session_id());
                    let actions = self.session.force_end(ReceiverOutcome::TimedOut);
                    self.execute(actions).await;
                }
            }
        }

        self.stop.mark_stopped();
        self.outcome.unwrap_or(ReceiverOutcome::Cancelled)
    }

    async fn execute(&mut self, actions: Vec<ReceiverAction>) {
        for action in actions {
            match action {
                ReceiverAction::Send(packet) => {
                    if let Err(e) = self.socket.send_to(&packet, self.sender).await {
                        debug!("송신 실패 ({}): {}", self.sender, e);
                    }
                }
                ReceiverAction::Schedule { after, timer } => self.timers.schedule_after(after, timer),
                ReceiverAction::CancelTimers => self.timers.cancel_all(),
                ReceiverAction::Disk(job) => {
                    let file_id = job.file_id;
                    let fs = self.fs.clone();
                    let tx = self.events_tx.clone();
                    let posted = self.disk.post(move || {
                        if let Some(event) = job.run(fs.as_ref()) {
                            let _ = tx.send(event);
                        }
                    });
                    if let Err(e) = posted {
                        warn!("디스크 작업 등록 실패: {}", e);
                        let _ = self.events_tx.send(DiskEvent::Failed {
                            file_id,
                            error: e.to_string(),
                        });
                    }
                }
                ReceiverAction::Finished(outcome) => {
                    self.timers.cancel_all();
                    self.outcome = Some(outcome);
                }
            }
        }
    }
}

impl std::fmt::Debug for AcceptWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcceptWorker")
            .field("session", &self.session)
            .field("sender", &self.sender)
            .field("timers", &self.timers.len())
            .finish()
    }
}
