use crate::bluetooth::{BluezAdapter, DisconnectDetector, watch_bluez};
use crate::config::Config;
use crate::error::DispatchError;
use crate::input::keyboard::{RepeatSettings, spawn_keyboard};
use crate::input::mouse::spawn_mouse;
use crate::input::{DeviceSource, DeviceType, EvdevEnumerator, InputDeviceHandle, WorkerHandle};
use crate::output::usb::{self, Endpoints};
use crate::output::{
    Dispatcher, KEYBOARD_LATENCY_LOG_EVERY, MOUSE_LATENCY_LOG_EVERY, open_endpoint,
    spawn_dispatcher,
};
use crate::report::{KeyboardReport, MouseReport, Stamped};
use anyhow::Context;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const KEYBOARD_QUEUE_CAPACITY: usize = 10;
/// 鼠标位移事件远多于按键，队列更深
pub const MOUSE_QUEUE_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy)]
pub struct SupervisorSettings {
    pub keyboard: bool,
    pub mouse: bool,
    pub repeat: RepeatSettings,
    pub poll_interval: Duration,
}

/// 设备生命周期管理：轮询新设备、启动 worker、按断开通知停止 worker
pub struct Supervisor<S: DeviceSource> {
    source: S,
    settings: SupervisorSettings,
    keyboard_tx: mpsc::Sender<Stamped<KeyboardReport>>,
    mouse_tx: mpsc::Sender<Stamped<MouseReport>>,
    disconnects: Option<mpsc::Receiver<Vec<String>>>,
    workers: HashMap<InputDeviceHandle, WorkerHandle>,
}

impl<S: DeviceSource> Supervisor<S> {
    pub fn new(
        source: S,
        settings: SupervisorSettings,
        keyboard_tx: mpsc::Sender<Stamped<KeyboardReport>>,
        mouse_tx: mpsc::Sender<Stamped<MouseReport>>,
        disconnects: Option<mpsc::Receiver<Vec<String>>>,
    ) -> Self {
        Self {
            source,
            settings,
            keyboard_tx,
            mouse_tx,
            disconnects,
            workers: HashMap::new(),
        }
    }

    pub fn tracked(&self) -> impl Iterator<Item = &InputDeviceHandle> {
        self.workers.keys()
    }

    pub fn is_tracked(&self, handle: &InputDeviceHandle) -> bool {
        self.workers.contains_key(handle)
    }

    /// 取出所有待处理的断开通知，逐个停止匹配的 worker
    pub fn handle_disconnects(&mut self) {
        let Some(rx) = self.disconnects.as_mut() else {
            return;
        };

        let mut pending = Vec::new();
        while let Ok(names) = rx.try_recv() {
            pending.extend(names);
        }
        for name in pending {
            self.stop_matching(&name);
        }
    }

    /// 向设备名以 `name` 开头的 worker 发送停止请求，返回匹配数
    pub fn stop_matching(&self, name: &str) -> usize {
        let mut stopped = 0;
        for (handle, worker) in &self.workers {
            if handle.name.starts_with(name) {
                info!("Disconnected device, stopping listening to: {}", handle);
                worker.request_stop();
                stopped += 1;
            }
        }
        stopped
    }

    /// 枚举当前设备，为尚未跟踪的键盘/鼠标启动 worker
    pub fn discover(&mut self) {
        let workers = &self.workers;
        let found = self
            .source
            .enumerate(&|path| workers.keys().any(|h| h.path == path));

        for device in found {
            // 同一设备节点只允许一个 worker
            if self.workers.keys().any(|h| h.path == device.handle.path) {
                continue;
            }

            let handle = device.handle;
            let worker = match device.capabilities.classify() {
                Some(DeviceType::Keyboard) if self.settings.keyboard => spawn_keyboard(
                    device.device,
                    handle.clone(),
                    self.keyboard_tx.clone(),
                    self.settings.repeat,
                ),
                Some(DeviceType::Mouse) if self.settings.mouse => {
                    spawn_mouse(device.device, handle.clone(), self.mouse_tx.clone())
                }
                Some(device_type) => {
                    debug!("{:?} 代理已关闭，忽略 {}", device_type, handle);
                    continue;
                }
                None => {
                    debug!("既不是键盘也不是鼠标，忽略 {}", handle);
                    continue;
                }
            };

            info!("Started monitoring: {}", handle);
            self.workers.insert(handle, worker);
        }
    }

    /// 非阻塞地收集已结束的 worker 并移出跟踪集合，不自动重启
    pub fn reap(&mut self) -> Vec<InputDeviceHandle> {
        let mut finished = Vec::new();

        self.workers.retain(|handle, worker| match worker.try_outcome() {
            None => true,
            Some(Ok(())) => {
                warn!("Event handler quit: {}", handle);
                finished.push(handle.clone());
                false
            }
            Some(Err(e)) => {
                error!("Received error from {}: {}", handle, e);
                finished.push(handle.clone());
                false
            }
        });

        finished
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            self.handle_disconnects();
            self.discover();

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }

            self.reap();
        }

        for (handle, worker) in &self.workers {
            debug!("Stopping {}", handle);
            worker.request_stop();
        }
        info!("Supervisor 退出");
    }
}

/// 整个代理：gadget、两个分发器、Supervisor 与断开检测
pub struct Core {
    config: Config,
}

impl Core {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let endpoints = self.endpoints().await?;

        let (keyboard_tx, keyboard_rx) = mpsc::channel(KEYBOARD_QUEUE_CAPACITY);
        let (mouse_tx, mouse_rx) = mpsc::channel(MOUSE_QUEUE_CAPACITY);

        let keyboard_file = open_endpoint(&endpoints.keyboard)?;
        let mouse_file = open_endpoint(&endpoints.mouse)?;

        let keyboard_dispatch = spawn_dispatcher(
            Dispatcher::new(
                endpoints.keyboard.display().to_string(),
                keyboard_file,
                KEYBOARD_LATENCY_LOG_EVERY,
            ),
            keyboard_rx,
        );
        let mouse_dispatch = spawn_dispatcher(
            Dispatcher::new(
                endpoints.mouse.display().to_string(),
                mouse_file,
                MOUSE_LATENCY_LOG_EVERY,
            ),
            mouse_rx,
        );

        let cancel = CancellationToken::new();
        let disconnects = if self.config.monitor_disconnects {
            match self.start_disconnect_monitor(cancel.clone()).await {
                Ok(rx) => Some(rx),
                Err(e) => {
                    warn!("无法监听蓝牙断开事件，继续运行: {:#}", e);
                    None
                }
            }
        } else {
            None
        };

        let supervisor = Supervisor::new(
            EvdevEnumerator,
            self.config.supervisor_settings(),
            keyboard_tx,
            mouse_tx,
            disconnects,
        );
        let supervise = tokio::spawn(supervisor.run(cancel.clone()));

        let result = tokio::select! {
            res = keyboard_dispatch => dispatch_outcome("keyboard", res),
            res = mouse_dispatch => dispatch_outcome("mouse", res),
            _ = tokio::signal::ctrl_c() => {
                info!("收到退出信号");
                Ok(())
            }
        };

        cancel.cancel();
        let _ = supervise.await;
        // gadget 注册在此之后才释放
        drop(endpoints);

        result
    }

    async fn endpoints(&self) -> anyhow::Result<Endpoints> {
        let keyboard = self.config.keyboard_endpoint.clone();
        let mouse = self.config.mouse_endpoint.clone();

        if !self.config.setuphid {
            return Ok(Endpoints::existing(keyboard, mouse));
        }

        info!("Setting up HID gadget...");
        tokio::task::spawn_blocking(move || usb::provision(&keyboard, &mouse))
            .await
            .context("gadget 配置任务异常退出")?
    }

    async fn start_disconnect_monitor(
        &self,
        cancel: CancellationToken,
    ) -> anyhow::Result<mpsc::Receiver<Vec<String>>> {
        let session = bluer::Session::new().await?;
        let adapter = session
            .adapter(&self.config.adapter)
            .with_context(|| format!("找不到蓝牙适配器 {}", self.config.adapter))?;
        info!("Starting BlueZ monitoring for Bluetooth devices on {}", adapter.name());

        let (event_tx, event_rx) = mpsc::channel(16);
        let (names_tx, names_rx) = mpsc::channel(16);

        let watch_cancel = cancel.clone();
        let watched = adapter.clone();
        tokio::spawn(async move {
            // session 需要在监听期间保持存活
            let _session = session;
            if let Err(e) = watch_bluez(watched, event_tx, watch_cancel).await {
                error!("蓝牙事件监听失败: {:#}", e);
            }
        });

        let detector = DisconnectDetector::new(BluezAdapter::new(adapter));
        tokio::spawn(detector.run(event_rx, names_tx, cancel));

        Ok(names_rx)
    }
}

fn dispatch_outcome(
    kind: &str,
    res: Result<Result<(), DispatchError>, tokio::task::JoinError>,
) -> anyhow::Result<()> {
    match res {
        Ok(Ok(())) => {
            warn!("{} 分发器已结束", kind);
            Ok(())
        }
        Ok(Err(e)) => {
            error!("{} 分发失败: {}", kind, e);
            Err(e).with_context(|| format!("{} dispatcher failed", kind))
        }
        Err(e) => Err(e).with_context(|| format!("{} dispatcher panicked", kind)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    #[ignore]
    async fn test_core_run() {
        crate::logging::init("debug");
        let config = <Config as clap::Parser>::parse_from(["bt-hidproxy"]);
        Core::new(config).run().await.unwrap();
    }
}
