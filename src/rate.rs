//! 송신 속도 제한 (토큰 버킷)
//!
//! - 틱(50ms)마다 `max_speed / 20` 바이트까지 큐에서 꺼내 전송
//! - 큐에 쌓인 바이트가 버킷 크기(한 틱 분량의 1.25배) 이상이면 새 패킷을 받지 않음
//! - 거절된 패킷과 그 뒤의 동작은 backlog로 보관되었다가, 버킷에 여유가 생기면 한 번에 재개

use std::collections::VecDeque;
use std::time::Duration;

/// 리필 주기
pub const TICK_INTERVAL: Duration = Duration::from_millis(50);

/// 초당 리필 횟수
pub const TICKS_PER_SECOND: u64 = 20;

/// 속도 제한 대상 동작
///
/// 패킷 송신이면 길이를, 아니면 None을 돌려준다.
pub trait Paced {
    fn packet_len(&self) -> Option<usize>;
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    full_size: usize,
    per_tick: usize,
}

/// 흐름 상태
#[derive(Debug)]
enum FlowState<A> {
    /// 송신 가능
    Idle,
    /// 버킷이 가득 차서 나머지 동작이 대기 중
    Blocked(VecDeque<A>),
}

/// 토큰 버킷 + 대기 동작 상태 머신
#[derive(Debug)]
pub struct RateGate<A> {
    bucket: Option<Bucket>,
    queue: VecDeque<(A, usize)>,
    queued_bytes: usize,
    flow: FlowState<A>,
}

impl<A: Paced> RateGate<A> {
    /// 속도 제한 없음: 모든 동작을 즉시 통과
    pub fn unlimited() -> Self {
        Self {
            bucket: None,
            queue: VecDeque::new(),
            queued_bytes: 0,
            flow: FlowState::Idle,
        }
    }

    /// 최대 속도(bytes/s) 지정
    pub fn with_max_speed(max_speed: u64) -> Self {
        let per_tick = (max_speed / TICKS_PER_SECOND).max(1) as usize;
        let full_size = ((max_speed / TICKS_PER_SECOND / 4 * 5) as usize).max(per_tick);
        Self {
            bucket: Some(Bucket {
                full_size,
                per_tick,
            }),
            queue: VecDeque::new(),
            queued_bytes: 0,
            flow: FlowState::Idle,
        }
    }

    pub fn is_limited(&self) -> bool {
        self.bucket.is_some()
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self.flow, FlowState::Blocked(_))
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    /// 동작 묶음 투입
    ///
    /// 지금 실행할 동작을 순서대로 돌려준다. 제한이 있으면 송신은 버킷 큐로 들어가고
    /// 틱에서 나온다. 거절 이후의 동작은 순서를 유지한 채 backlog에 남는다.
    pub fn admit(&mut self, actions: impl IntoIterator<Item = A>) -> Vec<A> {
        let Some(bucket) = self.bucket else {
            return actions.into_iter().collect();
        };

        let mut ready = Vec::new();
        for action in actions {
            if let FlowState::Blocked(backlog) = &mut self.flow {
                backlog.push_back(action);
                continue;
            }
            match action.packet_len() {
                Some(len) if self.queued_bytes < bucket.full_size => {
                    self.queued_bytes += len;
                    self.queue.push_back((action, len));
                }
                Some(_) => {
                    self.flow = FlowState::Blocked(VecDeque::from([action]));
                }
                None => ready.push(action),
            }
        }
        ready
    }

    /// 리필 틱
    ///
    /// 이번 틱에 보낼 패킷과, 버킷에 여유가 생겨 재개된 동작을 돌려준다.
    pub fn tick(&mut self) -> Vec<A> {
        let Some(bucket) = self.bucket else {
            return Vec::new();
        };

        let mut out = Vec::new();
        let mut sent = 0usize;
        while let Some(&(_, len)) = self.queue.front() {
            // 틱 예산보다 큰 패킷도 틱의 첫 패킷이면 보낸다
            if sent > 0 && sent + len > bucket.per_tick {
                break;
            }
            let Some((action, len)) = self.queue.pop_front() else {
                break;
            };
            sent += len;
            self.queued_bytes -= len;
            out.push(action);
        }

        if self.queued_bytes < bucket.full_size {
            if let FlowState::Blocked(backlog) = std::mem::replace(&mut self.flow, FlowState::Idle) {
                let resumed = self.admit(backlog);
                out.extend(resumed);
            }
        }
        out
    }

    /// 대기 중인 모든 패킷/동작 폐기
    pub fn clear(&mut self) {
        self.queue.clear();
        self.queued_bytes = 0;
        self.flow = FlowState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    enum Act {
        Send(usize),
        Mark(u32),
    }

    impl Paced for Act {
        fn packet_len(&self) -> Option<usize> {
            match self {
                Act::Send(len) => Some(*len),
                Act::Mark(_) => None,
            }
        }
    }

    #[test]
    fn test_unlimited_passes_everything() {
        let mut gate = RateGate::unlimited();
        let out = gate.admit([Act::Send(100), Act::Mark(1), Act::Send(5)]);
        assert_eq!(out, vec![Act::Send(100), Act::Mark(1), Act::Send(5)]);
        assert!(gate.tick().is_empty());
        assert!(!gate.is_limited());
    }

    #[test]
    fn test_bucket_sizes() {
        // 20_000 B/s -> 틱당 1000, 버킷 1250
        let mut gate: RateGate<Act> = RateGate::with_max_speed(20_000);
        let ready = gate.admit([Act::Send(600), Act::Send(600), Act::Send(600)]);
        assert!(ready.is_empty());
        // 600 + 600 = 1200 < 1250 이므로 세 번째도 수용
        assert_eq!(gate.queued_bytes(), 1800);
        assert!(!gate.is_blocked());

        // 600 + 600 > 1000 이므로 틱마다 하나씩
        assert_eq!(gate.tick(), vec![Act::Send(600)]);
        assert_eq!(gate.queued_bytes(), 1200);
        assert_eq!(gate.tick(), vec![Act::Send(600)]);
        assert_eq!(gate.tick(), vec![Act::Send(600)]);
        assert_eq!(gate.queued_bytes(), 0);
    }

    #[test]
    fn test_tick_never_exceeds_budget() {
        // 틱당 1000
        let mut gate = RateGate::with_max_speed(20_000);
        gate.admit([Act::Send(400), Act::Send(400), Act::Send(300), Act::Send(200)]);
        assert!(!gate.is_blocked());

        let first = gate.tick();
        assert_eq!(first, vec![Act::Send(400), Act::Send(400)]);
        let total: usize = first.iter().filter_map(|a| a.packet_len()).sum();
        assert!(total <= 1000);

        // 남은 500은 한 틱에 모두
        assert_eq!(gate.tick(), vec![Act::Send(300), Act::Send(200)]);
        assert!(gate.tick().is_empty());
    }

    #[test]
    fn test_blocked_backlog_keeps_order() {
        let mut gate = RateGate::with_max_speed(20_000);
        let ready = gate.admit([
            Act::Send(1300),
            Act::Send(10),
            Act::Mark(7),
            Act::Send(20),
        ]);
        assert!(ready.is_empty());
        assert!(gate.is_blocked());

        // 뒤에 들어온 동작은 backlog 뒤에 붙는다
        assert!(gate.admit([Act::Mark(8)]).is_empty());

        // 첫 틱: 1300 송신 후 여유 -> backlog 재개
        let out = gate.tick();
        assert_eq!(out, vec![Act::Send(1300), Act::Mark(7), Act::Mark(8)]);
        assert!(!gate.is_blocked());
        assert_eq!(gate.queued_bytes(), 30);

        let out = gate.tick();
        assert_eq!(out, vec![Act::Send(10), Act::Send(20)]);
    }

    #[test]
    fn test_clear() {
        let mut gate = RateGate::with_max_speed(20_000);
        gate.admit([Act::Send(2000), Act::Send(1)]);
        assert!(gate.is_blocked());
        gate.clear();
        assert!(!gate.is_blocked());
        assert!(gate.tick().is_empty());
    }
}
