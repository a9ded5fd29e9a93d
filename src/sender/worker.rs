//! 송신 세션 워커
//!
//! 세션 코어가 돌려준 동작을 소켓/타이머/디스크 유닛에 실행한다.

use std::net::SocketAddr;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::executor::{DiskUnit, Lease};
use crate::message::FileId;
use crate::rate::{RateGate, TICK_INTERVAL};
use crate::sender::context::{SenderAction, SenderTimer, SessionOutcome};
use crate::sender::session::DeliverySession;
use crate::transport::{StopHandle, StopSignal, TimerQueue, RECV_BUFFER_LEN};
use crate::Result;

/// 디스크 유닛에서 돌아오는 결과
#[derive(Debug)]
enum WorkerEvent {
    BlocksRead {
        file_id: FileId,
        resend: bool,
        result: Result<Vec<(u64, Bytes)>>,
    },
}

/// 송신 세션 워커
pub struct SenderWorker {
    session: DeliverySession,
    socket: UdpSocket,
    disk: Lease<DiskUnit>,
    gate: RateGate<SenderAction>,
    timers: TimerQueue<SenderTimer>,
    stop: StopSignal,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    events_rx: mpsc::UnboundedReceiver<WorkerEvent>,
    outcome: Option<SessionOutcome>,
}

impl SenderWorker {
    pub fn new(
        session: DeliverySession,
        socket: UdpSocket,
        disk: Lease<DiskUnit>,
        max_speed: Option<u64>,
    ) -> (Self, StopHandle) {
        let (handle, stop) = StopHandle::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let gate = match max_speed {
            Some(speed) if speed > 0 => RateGate::with_max_speed(speed),
            _ => RateGate::unlimited(),
        };

        let worker = Self {
            session,
            socket,
            disk,
            gate,
            timers: TimerQueue::new(),
            stop,
            events_tx,
            events_rx,
            outcome: None,
        };
        (worker, handle)
    }

    /// 세션이 끝날 때까지 구동
    pub async fn run(mut self) -> SessionOutcome {
        let actions = self.session.start();
        self.execute(actions).await;

        let mut buf = vec![0u8; RECV_BUFFER_LEN];
        let mut ticker = interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while self.outcome.is_none() {
            let deadline = self.timers.next_deadline();
            let limited = self.gate.is_limited();

            tokio::select! {
                _ = self.stop.requested() => {
                    self.gate.clear();
                    let actions = self.session.force_end();
                    self.execute(actions).await;
                }
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, _from)) => {
                            let actions = self.session.handle_packet(&buf[..len]);
                            self.execute(actions).await;
                        }
                        Err(e) => warn!("수신 에러: {}", e),
                    }
                }
                Some(event) = self.events_rx.recv() => {
                    let WorkerEvent::BlocksRead { file_id, resend, result } = event;
                    let actions = self.session.on_blocks_read(file_id, resend, result);
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
                _ = ticker.tick(), if limited => {
                    let actions = self.gate.tick();
                    self.run_actions(actions).await;
                }
            }
        }

        self.stop.mark_stopped();
        self.outcome.unwrap_or(SessionOutcome::Cancelled)
    }

    async fn execute(&mut self, actions: Vec<SenderAction>) {
        let ready = self.gate.admit(actions);
        self.run_actions(ready).await;
    }

    async fn run_actions(&mut self, actions: Vec<SenderAction>) {
        for action in actions {
            match action {
                SenderAction::Send(out) => self.send(&out.packet, out.dest).await,
                SenderAction::Schedule { after, timer } => self.timers.schedule_after(after, timer),
                SenderAction::CancelTimers => self.timers.cancel_all(),
                SenderAction::ReadBlocks {
                    source,
                    file_id,
                    indices,
                    resend,
                } => {
                    let tx = self.events_tx.clone();
                    let posted = self.disk.post(move || {
                        let result = source.read_blocks(&indices);
                        let _ = tx.send(WorkerEvent::BlocksRead {
                            file_id,
                            resend,
                            result,
                        });
                    });
                    if let Err(e) = posted {
                        warn!("디스크 작업 등록 실패: {}", e);
                        let _ = self.events_tx.send(WorkerEvent::BlocksRead {
                            file_id,
                            resend,
                            result: Err(e),
                        });
                    }
                }
                SenderAction::Finished(outcome) => {
                    self.timers.cancel_all();
                    self.outcome = Some(outcome);
                }
            }
        }
    }

    async fn send(&self, packet: &[u8], dest: SocketAddr) {
        if let Err(e) = self.socket.send_to(packet, dest).await {
            // 취소된 세션의 송신 실패는 무시
            debug!("송신 실패 ({}): {}", dest, e);
        }
    }
}

impl std::fmt::Debug for SenderWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SenderWorker")
            .field("session", &self.session)
            .field("timers", &self.timers.len())
            .finish()
    }
}
