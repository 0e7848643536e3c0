pub mod usb;

use crate::error::DispatchError;
use crate::report::Stamped;
use anyhow::{Context, Result};
use log::{debug, info};
use std::fmt::Debug;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// 键盘事件较少，每 50 次写入输出一次延迟统计
pub const KEYBOARD_LATENCY_LOG_EVERY: u64 = 50;
pub const MOUSE_LATENCY_LOG_EVERY: u64 = 100;

/// 采集到写入完成之间的延迟统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LatencyStats {
    pub now: Duration,
    pub avg: Duration,
    pub min: Duration,
    pub max: Duration,
    pub samples: u64,
}

impl LatencyStats {
    pub fn record(&mut self, latency: Duration) {
        if self.samples == 0 {
            self.avg = latency;
            self.min = latency;
            self.max = latency;
        } else {
            // 滚动平均：新样本权重 1/2
            self.avg = (self.avg + latency) / 2;
            self.min = self.min.min(latency);
            self.max = self.max.max(latency);
        }
        self.now = latency;
        self.samples += 1;
    }
}

/// 以追加写方式打开 endpoint 文件
pub fn open_endpoint(path: &Path) -> Result<File> {
    info!("Opening {} for writing...", path.display());
    OpenOptions::new()
        .append(true)
        .open(path)
        .with_context(|| format!("打开 {} 失败，是否以 root 运行？", path.display()))
}

/// 把一个队列里的报告依次写到 endpoint
pub struct Dispatcher<W> {
    endpoint: String,
    sink: W,
    stats: LatencyStats,
    log_every: u64,
}

impl<W: Write> Dispatcher<W> {
    pub fn new(endpoint: impl Into<String>, sink: W, log_every: u64) -> Self {
        Self {
            endpoint: endpoint.into(),
            sink,
            stats: LatencyStats::default(),
            log_every: log_every.max(1),
        }
    }

    pub fn stats(&self) -> &LatencyStats {
        &self.stats
    }

    pub fn into_sink(self) -> W {
        self.sink
    }

    /// 写出一个完整报告；写入不完整视为失败
    pub fn dispatch<R: AsRef<[u8]> + Debug>(
        &mut self,
        message: &Stamped<R>,
    ) -> Result<(), DispatchError> {
        let bytes = message.report.as_ref();

        let written = self
            .sink
            .write(bytes)
            .and_then(|n| self.sink.flush().map(|_| n))
            .map_err(|source| DispatchError::Write {
                endpoint: self.endpoint.clone(),
                source,
            })?;
        if written != bytes.len() {
            return Err(DispatchError::PartialWrite {
                endpoint: self.endpoint.clone(),
                written,
                expected: bytes.len(),
            });
        }

        self.stats.record(Instant::now().saturating_duration_since(message.captured_at));
        debug!(
            "Wrote {} bytes to {} ({:02x?})",
            written, self.endpoint, message.report
        );

        if self.stats.samples % self.log_every == 0 {
            debug!(
                "Latency {}: now={}, avg={}, min={}, max={} μs",
                self.endpoint,
                self.stats.now.as_micros(),
                self.stats.avg.as_micros(),
                self.stats.min.as_micros(),
                self.stats.max.as_micros()
            );
        }

        Ok(())
    }

    /// 阻塞地消费队列直到所有发送端关闭或写入失败
    pub fn run<R: AsRef<[u8]> + Debug>(
        mut self,
        mut rx: mpsc::Receiver<Stamped<R>>,
    ) -> Result<(), DispatchError> {
        while let Some(message) = rx.blocking_recv() {
            self.dispatch(&message)?;
        }
        info!("{} 的报告队列已关闭", self.endpoint);
        Ok(())
    }
}

/// 在阻塞线程上运行分发器
pub fn spawn_dispatcher<W, R>(
    dispatcher: Dispatcher<W>,
    rx: mpsc::Receiver<Stamped<R>>,
) -> JoinHandle<Result<(), DispatchError>>
where
    W: Write + Send + 'static,
    R: AsRef<[u8]> + Debug + Send + 'static,
{
    tokio::task::spawn_blocking(move || dispatcher.run(rx))
}
