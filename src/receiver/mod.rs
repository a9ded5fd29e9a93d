//! 수신측
//!
//! [`ReceiverServer`]가 public 그룹마다 감시 워커를 하나 띄우고, 감시 워커는 자신을
//! 대상으로 하는 Announce마다 수신 세션 워커를 띄운다.

pub mod context;
pub mod file_task;
pub mod monitor;
pub mod session;
pub mod worker;

use std::net::IpAddr;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::info;

use crate::config::ReceiverConfig;
use crate::executor::Executor;
use crate::fs::{FileSystem, LocalFileSystem};
use crate::interface::resolve_member_id;
use crate::progress::ProgressSink;
use crate::transport::{multicast_socket, StopHandle};
use crate::{Error, Result};

pub use context::{DiskEvent, DiskJob, ReceiverAction, ReceiverOutcome};
pub use file_task::{Destinations, FileReceiveTask, ReceivePhase};
pub use monitor::{AnnounceMonitor, MonitorWorker, SessionLaunch};
pub use session::{AcceptPhase, AcceptSession};
pub use worker::AcceptWorker;

/// 감시 요청 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorResult {
    JustStarted,
    /// 같은 public 그룹과 포트를 이미 감시 중
    AlreadyMonitoring,
    MaxMonitorsReached,
}

/// 수신 서버
pub struct ReceiverServer {
    executor: Arc<Executor>,
    progress: Arc<ProgressSink>,
    fs: Arc<dyn FileSystem>,
    max_monitors: usize,
    monitors: DashMap<(IpAddr, u16), StopHandle>,
    admission: Mutex<()>,
}

impl ReceiverServer {
    pub fn new(executor: Arc<Executor>, progress: Arc<ProgressSink>, max_monitors: usize) -> Self {
        Self::with_file_system(executor, progress, max_monitors, Arc::new(LocalFileSystem::new()))
    }

    pub fn with_file_system(
        executor: Arc<Executor>,
        progress: Arc<ProgressSink>,
        max_monitors: usize,
        fs: Arc<dyn FileSystem>,
    ) -> Self {
        Self {
            executor,
            progress,
            fs,
            max_monitors: max_monitors.max(1),
            monitors: DashMap::new(),
            admission: Mutex::new(()),
        }
    }

    /// public 그룹 감시 시작
    pub fn monitor(&self, config: ReceiverConfig) -> Result<MonitorResult> {
        if config.destination_dirs.is_empty() {
            return Err(Error::NoValidTarget);
        }
        let key = (config.public_group, config.listen_port);

        let _admission = self.admission.lock();
        self.monitors.retain(|_, handle| handle.is_running());
        if self.monitors.contains_key(&key) {
            return Ok(MonitorResult::AlreadyMonitoring);
        }
        if self.monitors.len() >= self.max_monitors {
            return Ok(MonitorResult::MaxMonitorsReached);
        }

        let v4 = config.public_group.is_ipv4();
        let receiver_id = resolve_member_id(config.client_id, config.interface.as_deref(), v4)?;
        let destinations = Arc::new(Destinations::from_config(&config)?);

        let network = self.executor.network_unit()?;
        let socket = {
            let _runtime = network.handle().enter();
            multicast_socket(config.public_group, config.listen_port, &config.socket_options())?
        };
        info!(
            "감시 등록: {}:{} -> {:?}",
            config.public_group, config.listen_port, destinations.dirs
        );
        let (worker, handle) = MonitorWorker::new(
            socket,
            receiver_id,
            config,
            destinations,
            self.executor.clone(),
            self.progress.clone(),
            self.fs.clone(),
        );
        self.monitors.insert(key, handle);

        let unit = network.clone();
        network.spawn(async move {
            worker.run().await;
            drop(unit);
        });
        Ok(MonitorResult::JustStarted)
    }

    /// 감시 중지 (감시 중이었으면 true)
    pub fn stop_monitor(&self, public_group: IpAddr, listen_port: u16) -> bool {
        match self.monitors.remove(&(public_group, listen_port)) {
            Some((_, handle)) => {
                handle.stop();
                true
            }
            None => false,
        }
    }

    /// 모든 감시와 수신 세션 중지
    pub fn stop(&self) {
        for entry in self.monitors.iter() {
            entry.value().stop();
        }
        self.monitors.clear();
    }

    pub fn is_monitoring(&self, public_group: IpAddr, listen_port: u16) -> bool {
        self.monitors
            .get(&(public_group, listen_port))
            .is_some_and(|handle| handle.is_running())
    }

    pub fn monitor_count(&self) -> usize {
        self.monitors.iter().filter(|entry| entry.value().is_running()).count()
    }
}

impl Drop for ReceiverServer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for ReceiverServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiverServer")
            .field("monitors", &self.monitor_count())
            .field("max_monitors", &self.max_monitors)
            .finish()
    }
}
