use super::worker::{Grabbed, WorkerHandle, capture_loop};
use super::{InputDeviceHandle, InputSource};
use crate::error::WorkerError;
use crate::report::{MouseReport, Stamped, build_mouse_report};
use evdev::{EventType, InputEvent, KeyCode, RelativeAxisCode};
use log::{debug, info};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const BUTTON_LEFT: u8 = 1 << 0;
const BUTTON_RIGHT: u8 = 1 << 1;
const BUTTON_MIDDLE: u8 = 1 << 2;

/// 鼠标按钮状态，每个按钮一位
#[derive(Debug, Default)]
pub struct MouseState {
    buttons: u8,
}

impl MouseState {
    pub fn buttons(&self) -> u8 {
        self.buttons
    }

    /// 按钮变化或相对位移时返回报告，其余事件（SYN 等）不产生报告
    pub fn process_event(&mut self, event: &InputEvent) -> Option<MouseReport> {
        match event.event_type() {
            EventType::KEY => {
                let bit = match KeyCode::new(event.code()) {
                    KeyCode::BTN_LEFT => BUTTON_LEFT,
                    KeyCode::BTN_RIGHT => BUTTON_RIGHT,
                    KeyCode::BTN_MIDDLE => BUTTON_MIDDLE,
                    _ => return None,
                };

                let before = self.buttons;
                if event.value() > 0 {
                    self.buttons |= bit;
                } else {
                    self.buttons &= !bit;
                }
                if self.buttons == before {
                    return None;
                }

                Some(build_mouse_report(self.buttons, 0, 0, 0))
            }

            // 每个位移事件单独成一个报告，只带对应的那一轴
            EventType::RELATIVE => {
                let value = event.value();
                match RelativeAxisCode(event.code()) {
                    RelativeAxisCode::REL_X => Some(build_mouse_report(self.buttons, value, 0, 0)),
                    RelativeAxisCode::REL_Y => Some(build_mouse_report(self.buttons, 0, value, 0)),
                    // 低精度滚轮 (8)；REL_WHEEL_HI_RES (11) 不转发
                    RelativeAxisCode::REL_WHEEL => {
                        Some(build_mouse_report(self.buttons, 0, 0, value))
                    }
                    _ => None,
                }
            }

            _ => None,
        }
    }
}

/// 启动鼠标采集 worker
pub fn spawn_mouse<D: InputSource>(
    device: D,
    handle: InputDeviceHandle,
    tx: mpsc::Sender<Stamped<MouseReport>>,
) -> WorkerHandle {
    WorkerHandle::spawn(move |stop| run_mouse(device, &handle, &tx, &stop))
}

pub fn run_mouse<D: InputSource>(
    mut device: D,
    handle: &InputDeviceHandle,
    tx: &mpsc::Sender<Stamped<MouseReport>>,
    stop: &CancellationToken,
) -> Result<(), WorkerError> {
    let mut grabbed = Grabbed::acquire(&mut device, handle)?;
    info!("Grabbed mouse-like device: {}", handle);

    let mut state = MouseState::default();
    capture_loop(&mut grabbed, stop, tx, |event| {
        debug!(
            "Mouse input event: type={}, code={}, value={}",
            event.event_type().0,
            event.code(),
            event.value()
        );
        state.process_event(event)
    })?;

    info!("Stopping processing mouse input from: {}", handle);
    Ok(())
}
