pub mod keyboard;
pub mod mouse;
pub mod worker;

use evdev::{Device, EventType, InputEvent};
use log::{debug, trace};
use std::io;
#[cfg(unix)]
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub use worker::{READ_TIMEOUT, WorkerHandle};

const INPUT_DIR: &str = "/dev/input";

/// 一个物理输入设备：设备节点路径 + 可读名称，Supervisor 以此区分 worker
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InputDeviceHandle {
    pub path: PathBuf,
    pub name: String,
}

impl InputDeviceHandle {
    pub fn new(path: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for InputDeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.path.display())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceType {
    Keyboard,
    Mouse,
}

/// 设备支持的事件类别
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub keys: bool,
    pub relative: bool,
}

impl Capabilities {
    /// 有相对位移的一律按鼠标处理（鼠标本身也带 EV_KEY 按钮），
    /// 只有按键的才是键盘
    pub fn classify(&self) -> Option<DeviceType> {
        match (self.keys, self.relative) {
            (_, true) => Some(DeviceType::Mouse),
            (true, false) => Some(DeviceType::Keyboard),
            (false, false) => None,
        }
    }
}

/// worker 独占的一个输入设备
pub trait InputSource: Send + 'static {
    fn grab(&mut self) -> io::Result<()>;

    fn ungrab(&mut self) -> io::Result<()>;

    /// 最多等待 `timeout`，超时返回空列表而不是错误
    fn read_events(&mut self, timeout: Duration) -> io::Result<Vec<InputEvent>>;

    /// 设置硬件按键重复（毫秒）
    fn set_repeat(&mut self, _delay_ms: u32, _period_ms: u32) -> io::Result<()> {
        Ok(())
    }
}

/// 扫描时发现的设备
pub struct Discovered<D> {
    pub handle: InputDeviceHandle,
    pub capabilities: Capabilities,
    pub device: D,
}

/// 枚举当前存在的输入设备，`is_tracked` 为真的节点不会被打开
pub trait DeviceSource: Send {
    type Device: InputSource;

    fn enumerate(&mut self, is_tracked: &dyn Fn(&Path) -> bool) -> Vec<Discovered<Self::Device>>;
}

/// 基于 evdev 的 /dev/input/event* 设备
pub struct EvdevDevice {
    device: Device,
}

impl EvdevDevice {
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            device: Device::open(path)?,
        })
    }

    pub fn name(&self) -> String {
        self.device
            .name()
            .map(|n| n.to_string())
            .unwrap_or_else(|| "Unknown".to_string())
    }

    pub fn capabilities(&self) -> Capabilities {
        let events = self.device.supported_events();
        Capabilities {
            keys: events.contains(EventType::KEY),
            relative: events.contains(EventType::RELATIVE),
        }
    }
}

impl InputSource for EvdevDevice {
    fn grab(&mut self) -> io::Result<()> {
        self.device.grab()
    }

    fn ungrab(&mut self) -> io::Result<()> {
        self.device.ungrab()
    }

    fn read_events(&mut self, timeout: Duration) -> io::Result<Vec<InputEvent>> {
        let mut pfd = libc::pollfd {
            fd: self.device.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;

        let ready = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if ready < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }
        if ready == 0 {
            return Ok(Vec::new());
        }
        if pfd.revents & libc::POLLIN == 0 {
            // POLLERR/POLLHUP: 设备节点已消失
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("poll revents = {:#x}", pfd.revents),
            ));
        }

        match self.device.fetch_events() {
            Ok(events) => Ok(events.collect()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    fn set_repeat(&mut self, delay_ms: u32, period_ms: u32) -> io::Result<()> {
        // REP_DELAY = 0, REP_PERIOD = 1
        let events = [
            InputEvent::new(EventType::REPEAT.0, 0, delay_ms as i32),
            InputEvent::new(EventType::REPEAT.0, 1, period_ms as i32),
        ];
        self.device.send_events(&events)
    }
}

/// 扫描 /dev/input 下的 event 节点
#[derive(Debug, Default)]
pub struct EvdevEnumerator;

impl DeviceSource for EvdevEnumerator {
    type Device = EvdevDevice;

    fn enumerate(&mut self, is_tracked: &dyn Fn(&Path) -> bool) -> Vec<Discovered<EvdevDevice>> {
        let mut found = Vec::new();

        // 读目录失败只跳过本轮，不让 Supervisor 退出
        let Ok(entries) = std::fs::read_dir(INPUT_DIR) else {
            return found;
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let is_event_node = path
                .file_name()
                .map(|n| n.to_string_lossy().starts_with("event"))
                .unwrap_or(false);
            if !is_event_node || is_tracked(&path) {
                continue;
            }

            match EvdevDevice::open(&path) {
                Ok(device) => {
                    let handle = InputDeviceHandle::new(path, device.name());
                    let capabilities = device.capabilities();
                    debug!(
                        "Device {}, capabilities: {:?} -> {:?}",
                        handle,
                        capabilities,
                        capabilities.classify()
                    );
                    found.push(Discovered {
                        handle,
                        capabilities,
                        device,
                    });
                }
                Err(e) => trace!("打开 {} 失败: {}", path.display(), e),
            }
        }

        found
    }
}
