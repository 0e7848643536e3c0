#![allow(dead_code)]

use bt_hidproxy::input::{Capabilities, DeviceSource, Discovered, InputDeviceHandle, InputSource};
use evdev::{EventType, InputEvent};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::time::Duration;

pub enum Feed {
    Events(Vec<InputEvent>),
    Fail,
}

/// 由测试驱动的假输入设备
pub struct SimDevice {
    feed: mpsc::Receiver<Feed>,
    grabbed: Arc<AtomicBool>,
    repeat: Arc<Mutex<Option<(u32, u32)>>>,
    fail_grab: bool,
    fail_repeat: bool,
}

/// 测试一侧：喂事件、观察独占状态
#[derive(Clone)]
pub struct SimController {
    feed: mpsc::Sender<Feed>,
    grabbed: Arc<AtomicBool>,
    repeat: Arc<Mutex<Option<(u32, u32)>>>,
}

impl SimController {
    pub fn send(&self, events: Vec<InputEvent>) {
        let _ = self.feed.send(Feed::Events(events));
    }

    pub fn fail(&self) {
        let _ = self.feed.send(Feed::Fail);
    }

    pub fn is_grabbed(&self) -> bool {
        self.grabbed.load(Ordering::SeqCst)
    }

    /// 最近一次写入设备的 (delay_ms, period_ms)
    pub fn repeat(&self) -> Option<(u32, u32)> {
        *self.repeat.lock().unwrap()
    }
}

pub fn sim_device() -> (SimDevice, SimController) {
    let (tx, rx) = mpsc::channel();
    let grabbed = Arc::new(AtomicBool::new(false));
    let repeat = Arc::new(Mutex::new(None));
    (
        SimDevice {
            feed: rx,
            grabbed: Arc::clone(&grabbed),
            repeat: Arc::clone(&repeat),
            fail_grab: false,
            fail_repeat: false,
        },
        SimController {
            feed: tx,
            grabbed,
            repeat,
        },
    )
}

/// 已被其他进程独占的设备
pub fn busy_device() -> (SimDevice, SimController) {
    let (mut device, controller) = sim_device();
    device.fail_grab = true;
    (device, controller)
}

/// 不支持 EV_REP 写入的设备
pub fn no_repeat_device() -> (SimDevice, SimController) {
    let (mut device, controller) = sim_device();
    device.fail_repeat = true;
    (device, controller)
}

impl InputSource for SimDevice {
    fn grab(&mut self) -> io::Result<()> {
        if self.fail_grab {
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }
        self.grabbed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn ungrab(&mut self) -> io::Result<()> {
        self.grabbed.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn set_repeat(&mut self, delay_ms: u32, period_ms: u32) -> io::Result<()> {
        if self.fail_repeat {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        *self.repeat.lock().unwrap() = Some((delay_ms, period_ms));
        Ok(())
    }

    fn read_events(&mut self, timeout: Duration) -> io::Result<Vec<InputEvent>> {
        match self.feed.recv_timeout(timeout) {
            Ok(Feed::Events(events)) => Ok(events),
            Ok(Feed::Fail) => Err(io::Error::from_raw_os_error(libc::ENODEV)),
            Err(mpsc::RecvTimeoutError::Timeout) => Ok(Vec::new()),
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                std::thread::sleep(timeout);
                Ok(Vec::new())
            }
        }
    }
}

/// 设备列表由测试控制；被打开（即被 Supervisor 接管）的条目会从列表移除
#[derive(Clone, Default)]
pub struct SimSource {
    present: Arc<Mutex<Vec<Discovered<SimDevice>>>>,
}

impl SimSource {
    pub fn plug(&self, path: &str, name: &str, capabilities: Capabilities) -> SimController {
        let (device, controller) = sim_device();
        self.plug_device(path, name, capabilities, device);
        controller
    }

    pub fn plug_device(
        &self,
        path: &str,
        name: &str,
        capabilities: Capabilities,
        device: SimDevice,
    ) {
        self.present.lock().unwrap().push(Discovered {
            handle: InputDeviceHandle::new(path, name),
            capabilities,
            device,
        });
    }

    pub fn pending(&self) -> usize {
        self.present.lock().unwrap().len()
    }
}

impl DeviceSource for SimSource {
    type Device = SimDevice;

    fn enumerate(&mut self, is_tracked: &dyn Fn(&Path) -> bool) -> Vec<Discovered<SimDevice>> {
        let mut present = self.present.lock().unwrap();
        let (tracked, fresh): (Vec<_>, Vec<_>) = present
            .drain(..)
            .partition(|d| is_tracked(d.handle.path.as_path()));
        *present = tracked;
        fresh
    }
}

pub const KEYBOARD: Capabilities = Capabilities {
    keys: true,
    relative: false,
};

pub const MOUSE: Capabilities = Capabilities {
    keys: true,
    relative: true,
};

pub fn key(code: u16, value: i32) -> InputEvent {
    InputEvent::new(EventType::KEY.0, code, value)
}

pub fn rel(code: u16, value: i32) -> InputEvent {
    InputEvent::new(EventType::RELATIVE.0, code, value)
}

pub fn syn() -> InputEvent {
    InputEvent::new(EventType::SYNCHRONIZATION.0, 0, 0)
}
