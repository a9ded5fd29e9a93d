//! 송신측
//!
//! [`SenderServer`]가 동기화 요청을 받아 세션 워커를 네트워크 유닛에 띄운다.
//! 동시에 실행되는 세션 수가 상한에 닿으면 요청은 대기열에 들어가고,
//! 세션이 끝날 때마다 가장 오래된 요청부터 시작된다.

pub mod context;
pub mod file_task;
pub mod session;
pub mod worker;

use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::{FileSource, SenderConfig};
use crate::executor::Executor;
use crate::fs::{FileSystem, LocalFileSystem};
use crate::interface::resolve_member_id;
use crate::progress::ProgressSink;
use crate::transport::{sender_socket, StopHandle};
use crate::{Error, Result};

pub use context::{MemberStatus, SenderAction, SessionOutcome};
pub use file_task::{expand_targets, FileEntry};
pub use session::{DeliverySession, SessionPhase};
pub use worker::SenderWorker;

/// 동기화 작업 식별 토큰 (전송 대상, public 그룹, 포트의 해시)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskToken(pub u64);

impl TaskToken {
    pub fn for_config(config: &SenderConfig) -> Self {
        let mut hasher = DefaultHasher::new();
        match &config.files {
            FileSource::Path(path) => path.hash(&mut hasher),
            FileSource::List(files) => {
                for file in files {
                    file.source.hash(&mut hasher);
                }
            }
        }
        config.public_group.hash(&mut hasher);
        config.destination_port.hash(&mut hasher);
        TaskToken(hasher.finish())
    }
}

/// 요청 처리 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchOutcome {
    AlreadySyncing,
    AlreadyQueued,
    JustStarted,
    JustQueued,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchResult {
    pub token: TaskToken,
    pub outcome: LaunchOutcome,
}

/// public/private 그룹 조합 검사
pub fn validate_groups(config: &SenderConfig) -> Result<()> {
    if config.public_group == config.private_group
        || config.public_group.is_ipv4() != config.private_group.is_ipv4()
    {
        return Err(Error::UnsupportedGroups);
    }
    Ok(())
}

struct PendingTask {
    token: TaskToken,
    config: SenderConfig,
    files: Vec<FileEntry>,
}

struct ServerInner {
    executor: Arc<Executor>,
    progress: Arc<ProgressSink>,
    fs: Arc<dyn FileSystem>,
    max_concurrent_tasks: usize,
    running: DashMap<TaskToken, StopHandle>,
    queue: Mutex<VecDeque<PendingTask>>,
    /// 실행/대기 판정을 직렬화
    admission: Mutex<()>,
    stopped: AtomicBool,
}

impl ServerInner {
    fn launch(self: &Arc<Self>, task: PendingTask) -> Result<()> {
        let PendingTask {
            token,
            config,
            files,
        } = task;
        let v4 = config.public_group.is_ipv4();
        let sender_id = resolve_member_id(config.sender_id, config.interface.as_deref(), v4)?;
        let session_id = loop {
            let id = rand::random::<u32>();
            if id != 0 {
                break id;
            }
        };

        let network = self.executor.network_unit()?;
        let disk = self.executor.disk_unit()?;
        let socket = {
            let _runtime = network.handle().enter();
            sender_socket(config.private_group, config.source_port, &config.socket_options())?
        };

        let session = session::DeliverySession::new(
            &config,
            sender_id,
            session_id,
            files,
            self.fs.clone(),
            self.progress.clone(),
        );
        let (worker, handle) = SenderWorker::new(session, socket, disk, config.max_speed);
        self.running.insert(token, handle);

        info!(
            "동기화 시작: 세션 {:08x}, 송신자 {:08x}, 그룹 {}",
            session_id, sender_id, config.private_group
        );
        let inner = self.clone();
        let unit = network.clone();
        network.spawn(async move {
            let outcome = worker.run().await;
            inner.on_finished(token, outcome);
            drop(unit);
        });
        Ok(())
    }

    fn on_finished(self: &Arc<Self>, token: TaskToken, outcome: SessionOutcome) {
        let _admission = self.admission.lock();
        self.running.remove(&token);
        info!("동기화 종료: {:?} ({:?})", token, outcome);

        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        while self.running.len() < self.max_concurrent_tasks {
            let Some(next) = self.queue.lock().pop_front() else {
                break;
            };
            let next_token = next.token;
            if let Err(e) = self.launch(next) {
                warn!("대기 작업 시작 실패 ({:?}): {}", next_token, e);
            }
        }
    }
}

/// 송신 서버
pub struct SenderServer {
    inner: Arc<ServerInner>,
}

impl SenderServer {
    pub fn new(executor: Arc<Executor>, progress: Arc<ProgressSink>, max_concurrent_tasks: usize) -> Self {
        Self::with_file_system(executor, progress, max_concurrent_tasks, Arc::new(LocalFileSystem::new()))
    }

    pub fn with_file_system(
        executor: Arc<Executor>,
        progress: Arc<ProgressSink>,
        max_concurrent_tasks: usize,
        fs: Arc<dyn FileSystem>,
    ) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                executor,
                progress,
                fs,
                max_concurrent_tasks: max_concurrent_tasks.max(1),
                running: DashMap::new(),
                queue: Mutex::new(VecDeque::new()),
                admission: Mutex::new(()),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// 파일 동기화 요청
    pub fn sync_files(&self, config: SenderConfig) -> Result<LaunchResult> {
        validate_groups(&config)?;
        let files = expand_targets(self.inner.fs.as_ref(), &config)?;
        let token = TaskToken::for_config(&config);
        let result = |outcome| -> Result<LaunchResult> { Ok(LaunchResult { token, outcome }) };

        let _admission = self.inner.admission.lock();
        self.inner.stopped.store(false, Ordering::SeqCst);
        if self.inner.running.contains_key(&token) {
            return result(LaunchOutcome::AlreadySyncing);
        }
        let mut queue = self.inner.queue.lock();
        if queue.iter().any(|t| t.token == token) {
            return result(LaunchOutcome::AlreadyQueued);
        }

        let task = PendingTask {
            token,
            config,
            files,
        };
        if self.inner.running.len() < self.inner.max_concurrent_tasks {
            drop(queue);
            self.inner.launch(task)?;
            result(LaunchOutcome::JustStarted)
        } else {
            queue.push_back(task);
            result(LaunchOutcome::JustQueued)
        }
    }

    /// 실행 중이면 강제 종료, 대기 중이면 대기열에서 제거
    pub fn cancel_task(&self, token: TaskToken) -> bool {
        if let Some(handle) = self.inner.running.get(&token) {
            handle.stop();
            return true;
        }
        let mut queue = self.inner.queue.lock();
        let before = queue.len();
        queue.retain(|t| t.token != token);
        before != queue.len()
    }

    /// 모든 세션 강제 종료
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.queue.lock().clear();
        for entry in self.inner.running.iter() {
            entry.value().stop();
        }
    }

    pub fn is_syncing(&self, token: TaskToken) -> bool {
        self.inner.running.contains_key(&token)
    }

    pub fn running_count(&self) -> usize {
        self.inner.running.len()
    }

    pub fn queued_count(&self) -> usize {
        self.inner.queue.lock().len()
    }
}

impl Drop for SenderServer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for SenderServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SenderServer")
            .field("running", &self.running_count())
            .field("queued", &self.queued_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config_for(path: &std::path::Path) -> SenderConfig {
        SenderConfig {
            sender_id: Some(7),
            robust_factor: 50,
            ..SenderConfig::new(path)
        }
    }

    #[test]
    fn test_validate_groups() {
        let mut config = SenderConfig::default();
        assert!(validate_groups(&config).is_ok());
        config.private_group = config.public_group;
        assert!(matches!(validate_groups(&config), Err(Error::UnsupportedGroups)));
        config.private_group = "ff02::1:3".parse().unwrap();
        assert!(matches!(validate_groups(&config), Err(Error::UnsupportedGroups)));
    }

    #[test]
    fn test_task_token_depends_on_target_and_port() {
        let a = SenderConfig::new("/data/a");
        let b = SenderConfig::new("/data/b");
        assert_eq!(TaskToken::for_config(&a), TaskToken::for_config(&a.clone()));
        assert_ne!(TaskToken::for_config(&a), TaskToken::for_config(&b));

        let mut c = a.clone();
        c.destination_port = 2000;
        assert_ne!(TaskToken::for_config(&a), TaskToken::for_config(&c));
    }

    #[test]
    fn test_sync_files_queue_and_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first.bin");
        let second = dir.path().join("second.bin");
        std::fs::write(&first, b"one").unwrap();
        std::fs::write(&second, b"two").unwrap();

        let server = SenderServer::new(Arc::new(Executor::new(1)), Arc::new(ProgressSink::new()), 1);

        let started = server.sync_files(config_for(&first)).unwrap();
        assert_eq!(started.outcome, LaunchOutcome::JustStarted);
        assert_eq!(
            server.sync_files(config_for(&first)).unwrap().outcome,
            LaunchOutcome::AlreadySyncing
        );

        let queued = server.sync_files(config_for(&second)).unwrap();
        assert_eq!(queued.outcome, LaunchOutcome::JustQueued);
        assert_eq!(
            server.sync_files(config_for(&second)).unwrap().outcome,
            LaunchOutcome::AlreadyQueued
        );

        assert!(server.cancel_task(queued.token));
        assert_eq!(server.queued_count(), 0);
        assert!(!server.cancel_task(queued.token));

        assert!(server.cancel_task(started.token));
        for _ in 0..100 {
            if server.running_count() == 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(server.running_count(), 0);
    }

    #[test]
    fn test_sync_files_rejects_missing_target() {
        let server = SenderServer::new(Arc::new(Executor::new(1)), Arc::new(ProgressSink::new()), 1);
        let config = config_for(std::path::Path::new("/no/such/file"));
        assert!(matches!(server.sync_files(config), Err(Error::TargetNotFound(_))));
    }
}
