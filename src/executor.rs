//! 실행 유닛 풀
//!
//! - 네트워크 유닛: 전용 스레드 하나가 current-thread tokio 런타임을 구동, 세션 future를 실행
//! - 디스크 유닛: 전용 스레드 하나가 작업 큐를 FIFO로 처리
//! - 새 세션은 부하가 가장 낮은 유닛에 배정되고, 모든 유닛이 사용 중이면 상한까지 새 유닛을 만든다
//!
//! 풀은 전역이 아니라 명시적으로 만들어 서버에 주입한다.

use std::future::Future;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::{Error, Result};

/// 디스크 유닛에 올리는 작업
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// 부하 카운터를 가진 유닛
pub trait Unit: Send + Sync + 'static {
    fn load(&self) -> &AtomicUsize;
}

/// 유닛 사용권 (drop 시 부하 반환)
pub struct Lease<U: Unit> {
    unit: Arc<U>,
}

impl<U: Unit> Lease<U> {
    fn new(unit: Arc<U>) -> Self {
        unit.load().fetch_add(1, Ordering::SeqCst);
        Self { unit }
    }
}

impl<U: Unit> Clone for Lease<U> {
    fn clone(&self) -> Self {
        Self::new(self.unit.clone())
    }
}

impl<U: Unit> Deref for Lease<U> {
    type Target = U;

    fn deref(&self) -> &U {
        &self.unit
    }
}

impl<U: Unit> Drop for Lease<U> {
    fn drop(&mut self) {
        self.unit.load().fetch_sub(1, Ordering::SeqCst);
    }
}

/// 네트워크 유닛
pub struct NetworkUnit {
    handle: Handle,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    load: AtomicUsize,
}

impl NetworkUnit {
    fn start(name: String) -> Result<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let handle = runtime.handle().clone();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let thread = std::thread::Builder::new().name(name).spawn(move || {
            runtime.block_on(async {
                let _ = shutdown_rx.await;
            });
        })?;

        Ok(Self {
            handle,
            shutdown: Mutex::new(Some(shutdown_tx)),
            thread: Mutex::new(Some(thread)),
            load: AtomicUsize::new(0),
        })
    }

    /// 이 유닛의 런타임에서 future 실행
    pub fn spawn<F>(&self, future: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn current_load(&self) -> usize {
        self.load.load(Ordering::SeqCst)
    }
}

impl Unit for NetworkUnit {
    fn load(&self) -> &AtomicUsize {
        &self.load
    }
}

impl Drop for NetworkUnit {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(());
        }
        join_unless_current(self.thread.lock().take());
    }
}

/// 디스크 유닛
pub struct DiskUnit {
    tx: Mutex<Option<crossbeam_channel::Sender<Job>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    load: AtomicUsize,
}

impl DiskUnit {
    fn start(name: String) -> Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded::<Job>();
        let thread = std::thread::Builder::new().name(name).spawn(move || {
            while let Ok(job) = rx.recv() {
                job();
            }
        })?;

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            thread: Mutex::new(Some(thread)),
            load: AtomicUsize::new(0),
        })
    }

    /// 작업 투입 (투입 순서대로 실행)
    pub fn post<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let guard = self.tx.lock();
        let tx = guard.as_ref().ok_or(Error::ExecutorStopped)?;
        tx.send(Box::new(job)).map_err(|_| Error::ExecutorStopped)
    }

    pub fn current_load(&self) -> usize {
        self.load.load(Ordering::SeqCst)
    }
}

impl Unit for DiskUnit {
    fn load(&self) -> &AtomicUsize {
        &self.load
    }
}

impl Drop for DiskUnit {
    fn drop(&mut self) {
        // 송신측을 닫으면 남은 작업을 처리한 뒤 스레드가 끝난다
        self.tx.lock().take();
        join_unless_current(self.thread.lock().take());
    }
}

fn join_unless_current(thread: Option<JoinHandle<()>>) {
    if let Some(thread) = thread {
        if thread.thread().id() == std::thread::current().id() {
            return;
        }
        if thread.join().is_err() {
            warn!("실행 유닛 스레드 패닉");
        }
    }
}

/// 실행 유닛 풀
pub struct Executor {
    max_units_per_kind: usize,
    network: Mutex<Vec<Arc<NetworkUnit>>>,
    disk: Mutex<Vec<Arc<DiskUnit>>>,
}

impl Executor {
    /// 종류별 최대 유닛 수 지정 (0이면 1)
    pub fn new(max_units_per_kind: usize) -> Self {
        Self {
            max_units_per_kind: max_units_per_kind.max(1),
            network: Mutex::new(Vec::new()),
            disk: Mutex::new(Vec::new()),
        }
    }

    /// 하드웨어 동시성만큼
    pub fn with_available_parallelism() -> Self {
        Self::new(
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
        )
    }

    pub fn network_unit(&self) -> Result<Lease<NetworkUnit>> {
        let mut units = self.network.lock();
        pick(&mut units, self.max_units_per_kind, |n| {
            NetworkUnit::start(format!("mftp-net-{}", n))
        })
    }

    pub fn disk_unit(&self) -> Result<Lease<DiskUnit>> {
        let mut units = self.disk.lock();
        pick(&mut units, self.max_units_per_kind, |n| {
            DiskUnit::start(format!("mftp-disk-{}", n))
        })
    }

    pub fn unit_counts(&self) -> (usize, usize) {
        (self.network.lock().len(), self.disk.lock().len())
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::with_available_parallelism()
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (network, disk) = self.unit_counts();
        f.debug_struct("Executor")
            .field("max_units_per_kind", &self.max_units_per_kind)
            .field("network_units", &network)
            .field("disk_units", &disk)
            .finish()
    }
}

/// 가장 한가한 유닛 선택, 모두 사용 중이고 상한 미만이면 새로 생성
fn pick<U, F>(units: &mut Vec<Arc<U>>, max: usize, spawn: F) -> Result<Lease<U>>
where
    U: Unit,
    F: FnOnce(usize) -> Result<U>,
{
    let least = units
        .iter()
        .min_by_key(|u| u.load().load(Ordering::SeqCst))
        .cloned();

    match least {
        Some(unit) if unit.load().load(Ordering::SeqCst) == 0 || units.len() >= max => {
            Ok(Lease::new(unit))
        }
        _ => {
            let unit = Arc::new(spawn(units.len())?);
            debug!("실행 유닛 생성: #{}", units.len());
            units.push(unit.clone());
            Ok(Lease::new(unit))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_network_unit_runs_futures() {
        let executor = Executor::new(2);
        let unit = executor.network_unit().unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        unit.spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            tx.send(42).unwrap();
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
    }

    #[test]
    fn test_disk_unit_keeps_order() {
        let executor = Executor::new(1);
        let unit = executor.disk_unit().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..100 {
            let seen = seen.clone();
            unit.post(move || seen.lock().push(i)).unwrap();
        }
        let (tx, rx) = std::sync::mpsc::channel();
        unit.post(move || tx.send(()).unwrap()).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(*seen.lock(), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_least_loaded_selection() {
        let executor = Executor::new(2);

        let a = executor.disk_unit().unwrap();
        assert_eq!(a.current_load(), 1);

        // a가 사용 중이므로 두 번째 유닛 생성
        let b = executor.disk_unit().unwrap();
        assert_eq!(executor.unit_counts().1, 2);
        assert_eq!(b.current_load(), 1);

        // 상한 도달: 기존 유닛 중 하나 공유
        let c = executor.disk_unit().unwrap();
        assert_eq!(executor.unit_counts().1, 2);
        assert_eq!(a.current_load() + b.current_load(), 3);

        drop(c);
        drop(a);
        // a가 비었으므로 재사용
        let d = executor.disk_unit().unwrap();
        assert_eq!(executor.unit_counts().1, 2);
        assert_eq!(d.current_load(), 1);
        drop(b);
    }
}
