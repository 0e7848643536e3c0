use super::{InputDeviceHandle, InputSource};
use crate::error::WorkerError;
use crate::report::Stamped;
use evdev::InputEvent;
use log::{debug, info};
use std::ops::{Deref, DerefMut};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::sync::oneshot::error::TryRecvError;
use tokio_util::sync::CancellationToken;

/// 单次读取的最长等待；也是响应停止请求的最大延迟
pub const READ_TIMEOUT: Duration = Duration::from_millis(250);

/// Supervisor 持有的 worker 句柄
pub struct WorkerHandle {
    outcome: oneshot::Receiver<Result<(), WorkerError>>,
    stop: CancellationToken,
}

impl WorkerHandle {
    /// 在阻塞线程上运行 worker，结束后结果写入 error signal
    pub fn spawn<F>(work: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Result<(), WorkerError> + Send + 'static,
    {
        let (tx, outcome) = oneshot::channel();
        let stop = CancellationToken::new();
        let token = stop.clone();

        tokio::task::spawn_blocking(move || {
            let _ = tx.send(work(token));
        });

        Self { outcome, stop }
    }

    /// 请求 worker 停止，不等待
    pub fn request_stop(&self) {
        self.stop.cancel();
    }

    /// 非阻塞地查看 worker 是否已结束
    pub fn try_outcome(&mut self) -> Option<Result<(), WorkerError>> {
        match self.outcome.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(WorkerError::Vanished)),
        }
    }

    /// 等待 worker 结束
    pub async fn join(mut self) -> Result<(), WorkerError> {
        (&mut self.outcome)
            .await
            .unwrap_or(Err(WorkerError::Vanished))
    }
}

/// 句柄被丢弃时 worker 也随之停止
impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// 独占中的设备，离开作用域时自动释放
pub(crate) struct Grabbed<'a, D: InputSource> {
    device: &'a mut D,
    handle: &'a InputDeviceHandle,
}

impl<'a, D: InputSource> Grabbed<'a, D> {
    pub(crate) fn acquire(
        device: &'a mut D,
        handle: &'a InputDeviceHandle,
    ) -> Result<Self, WorkerError> {
        device.grab().map_err(WorkerError::Grab)?;
        Ok(Self { device, handle })
    }
}

impl<D: InputSource> Deref for Grabbed<'_, D> {
    type Target = D;

    fn deref(&self) -> &D {
        self.device
    }
}

impl<D: InputSource> DerefMut for Grabbed<'_, D> {
    fn deref_mut(&mut self) -> &mut D {
        self.device
    }
}

impl<D: InputSource> Drop for Grabbed<'_, D> {
    fn drop(&mut self) {
        match self.device.ungrab() {
            Ok(()) => info!("Released device: {}", self.handle),
            // 拔掉的设备 ungrab 必然失败
            Err(e) => debug!("释放 {} 失败: {}", self.handle, e),
        }
    }
}

/// 读取循环：每次读取最多阻塞 READ_TIMEOUT，之后检查停止请求。
/// 队列满时 blocking_send 会阻塞，报告不会被丢弃。
pub(crate) fn capture_loop<D, R>(
    device: &mut Grabbed<'_, D>,
    stop: &CancellationToken,
    tx: &mpsc::Sender<Stamped<R>>,
    mut on_event: impl FnMut(&InputEvent) -> Option<R>,
) -> Result<(), WorkerError>
where
    D: InputSource,
{
    while !stop.is_cancelled() {
        let events = device.read_events(READ_TIMEOUT).map_err(WorkerError::Read)?;

        for event in &events {
            if let Some(report) = on_event(event) {
                tx.blocking_send(Stamped::now(report))
                    .map_err(|_| WorkerError::QueueClosed)?;
            }
        }
    }

    Ok(())
}
