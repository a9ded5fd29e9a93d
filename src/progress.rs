//! 진행 상황 알림
//!
//! 세션이 단계를 바꿀 때마다 이벤트를 게시하고, 등록된 리스너가 모두 받는다.
//! 전역 싱글턴 없이 서버 생성 시 주입한다.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

/// 송신 세션 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderStatus {
    Announcing,
    ConfirmingRegistration,
    Transferring,
    Retransferring,
    SendingDoneNotification,
    Complete,
    ForcedEnd,
}

/// 수신 세션 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverStatus {
    WaitingRegistrationConfirm,
    WaitingFileInfo,
    ReceivingData,
    Complete,
}

/// 진행 단계
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressStatus {
    Sender(SenderStatus),
    Receiver(ReceiverStatus),
}

/// 진행 이벤트
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub session_id: u32,
    pub status: ProgressStatus,
    /// 현재 처리 중인 파일 (없으면 빈 경로)
    pub path: PathBuf,
}

/// 리스너 등록 토큰
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerToken(u32);

type Listener = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

/// 진행 이벤트 싱크
#[derive(Default)]
pub struct ProgressSink {
    listeners: RwLock<BTreeMap<ListenerToken, Listener>>,
    next_token: AtomicU32,
}

impl ProgressSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// 리스너 등록
    pub fn add_listener<F>(&self, listener: F) -> ListenerToken
    where
        F: Fn(&ProgressEvent) + Send + Sync + 'static,
    {
        let token = ListenerToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().insert(token, Arc::new(listener));
        token
    }

    /// 리스너 해제 (등록되어 있었으면 true)
    pub fn remove_listener(&self, token: ListenerToken) -> bool {
        self.listeners.write().remove(&token).is_some()
    }

    /// 이벤트 게시
    pub fn post(&self, event: ProgressEvent) {
        // 콜백 안에서 add/remove 해도 교착되지 않도록 복사 후 호출
        let listeners: Vec<Listener> = self.listeners.read().values().cloned().collect();
        for listener in listeners {
            listener(&event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }
}

impl std::fmt::Debug for ProgressSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressSink")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn event(status: ProgressStatus) -> ProgressEvent {
        ProgressEvent {
            session_id: 7,
            status,
            path: PathBuf::from("a.bin"),
        }
    }

    #[test]
    fn test_post_reaches_all_listeners() {
        let sink = ProgressSink::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s1 = seen.clone();
        let t1 = sink.add_listener(move |e| s1.lock().push((1, e.status)));
        let s2 = seen.clone();
        let t2 = sink.add_listener(move |e| s2.lock().push((2, e.status)));
        assert_ne!(t1, t2);

        sink.post(event(ProgressStatus::Sender(SenderStatus::Announcing)));
        assert_eq!(seen.lock().len(), 2);

        assert!(sink.remove_listener(t1));
        assert!(!sink.remove_listener(t1));
        sink.post(event(ProgressStatus::Receiver(ReceiverStatus::Complete)));

        let seen = seen.lock();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[2], (2, ProgressStatus::Receiver(ReceiverStatus::Complete)));
    }

    #[test]
    fn test_listener_may_unregister_itself() {
        let sink = Arc::new(ProgressSink::new());
        let token = Arc::new(Mutex::new(None));

        let sink_ref = Arc::downgrade(&sink);
        let token_ref = token.clone();
        let t = sink.add_listener(move |_| {
            if let (Some(sink), Some(t)) = (sink_ref.upgrade(), *token_ref.lock()) {
                sink.remove_listener(t);
            }
        });
        *token.lock() = Some(t);

        sink.post(event(ProgressStatus::Sender(SenderStatus::Complete)));
        assert_eq!(sink.listener_count(), 0);
    }
}
