use super::worker::{Grabbed, WorkerHandle, capture_loop};
use super::{InputDeviceHandle, InputSource};
use crate::error::WorkerError;
use crate::keymap::scancode_to_hid;
use crate::report::{KeyboardReport, Stamped, build_keyboard_report};
use evdev::{EventType, InputEvent};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// 硬件按键重复设置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepeatSettings {
    /// 每秒重复次数
    pub rate: u32,
    /// 首次重复前的延迟 (ms)
    pub delay_ms: u32,
}

impl RepeatSettings {
    pub fn period_ms(&self) -> u32 {
        1000 / self.rate.max(1)
    }
}

/// 当前按住的 HID 键码（含修饰键），按按下顺序排列
#[derive(Debug, Default)]
pub struct KeyboardState {
    held: Vec<u8>,
}

impl KeyboardState {
    pub fn held(&self) -> &[u8] {
        &self.held
    }

    /// 处理一个输入事件，按键状态变化时返回新的完整报告
    pub fn process_event(&mut self, event: &InputEvent) -> Option<KeyboardReport> {
        if event.event_type() != EventType::KEY {
            return None;
        }

        let scancode = event.code();
        let pressed = match event.value() {
            0 => false,
            1 => true,
            // 自动重复不改变状态
            _ => return None,
        };

        let Some(keycode) = scancode_to_hid(scancode) else {
            warn!("Unknown scancode: {}", scancode);
            return None;
        };

        if pressed {
            if !self.held.contains(&keycode) {
                self.held.push(keycode);
            }
        } else {
            self.held.retain(|&k| k != keycode);
        }

        let report = build_keyboard_report(&self.held);
        debug!(
            "Key status (scancode {}, keycode {:#04x}): {:02x?}",
            scancode, keycode, report
        );
        Some(report)
    }
}

/// 启动键盘采集 worker
pub fn spawn_keyboard<D: InputSource>(
    device: D,
    handle: InputDeviceHandle,
    tx: mpsc::Sender<Stamped<KeyboardReport>>,
    repeat: RepeatSettings,
) -> WorkerHandle {
    WorkerHandle::spawn(move |stop| run_keyboard(device, &handle, &tx, &stop, repeat))
}

pub fn run_keyboard<D: InputSource>(
    mut device: D,
    handle: &InputDeviceHandle,
    tx: &mpsc::Sender<Stamped<KeyboardReport>>,
    stop: &CancellationToken,
    repeat: RepeatSettings,
) -> Result<(), WorkerError> {
    let mut grabbed = Grabbed::acquire(&mut device, handle)?;
    info!("Grabbed keyboard-like device: {}", handle);

    info!(
        "Setting repeat rate to {}, delay {} for {}",
        repeat.rate, repeat.delay_ms, handle
    );
    if let Err(e) = grabbed.set_repeat(repeat.delay_ms, repeat.period_ms()) {
        warn!("设置按键重复失败 {}: {}", handle, e);
    }

    let mut state = KeyboardState::default();
    capture_loop(&mut grabbed, stop, tx, |event| {
        debug!(
            "Keyboard input event: type={}, code={}, value={}",
            event.event_type().0,
            event.code(),
            event.value()
        );
        state.process_event(event)
    })?;

    info!("Stopping processing keyboard input from: {}", handle);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(code: u16, value: i32) -> InputEvent {
        InputEvent::new(EventType::KEY.0, code, value)
    }

    #[test]
    fn shift_a_sequence() {
        let mut state = KeyboardState::default();

        // A 按下, 左 Shift 按下, A 松开, 左 Shift 松开
        let reports: Vec<_> = [key(30, 1), key(42, 1), key(30, 0), key(42, 0)]
            .iter()
            .map(|e| state.process_event(e))
            .collect();

        assert_eq!(
            reports,
            vec![
                Some([0x00, 0x00, 0x04, 0, 0, 0, 0, 0]),
                Some([0x02, 0x00, 0x04, 0, 0, 0, 0, 0]),
                Some([0x02, 0x00, 0, 0, 0, 0, 0, 0]),
                Some([0x00, 0x00, 0, 0, 0, 0, 0, 0]),
            ]
        );
        assert!(state.held().is_empty());
    }

    #[test]
    fn duplicate_press_is_suppressed() {
        let mut state = KeyboardState::default();
        state.process_event(&key(30, 1));
        let report = state.process_event(&key(30, 1)).unwrap();
        assert_eq!(report, [0, 0, 0x04, 0, 0, 0, 0, 0]);
        assert_eq!(state.held(), &[0x04]);
    }

    #[test]
    fn autorepeat_and_non_key_events_produce_nothing() {
        let mut state = KeyboardState::default();
        state.process_event(&key(30, 1));

        assert_eq!(state.process_event(&key(30, 2)), None);
        assert_eq!(
            state.process_event(&InputEvent::new(EventType::SYNCHRONIZATION.0, 0, 0)),
            None
        );
        assert_eq!(
            state.process_event(&InputEvent::new(EventType::MISC.0, 4, 0x70004)),
            None
        );
        assert_eq!(state.held(), &[0x04]);
    }

    #[test]
    fn unmapped_scancode_is_ignored() {
        let mut state = KeyboardState::default();
        assert_eq!(state.process_event(&key(84, 1)), None);
        assert!(state.held().is_empty());
    }

    #[test]
    fn seventh_key_is_tracked_but_not_reported() {
        let mut state = KeyboardState::default();
        // Q W E R T Y U
        for code in 16..=22 {
            state.process_event(&key(code, 1));
        }
        assert_eq!(state.held().len(), 7);

        // 松开 Q 后 U 进入报告
        let report = state.process_event(&key(16, 0)).unwrap();
        assert_eq!(report, [0, 0, 0x1A, 0x08, 0x15, 0x17, 0x1C, 0x18]);
    }

    #[test]
    fn repeat_period_from_rate() {
        let repeat = RepeatSettings {
            rate: 62,
            delay_ms: 300,
        };
        assert_eq!(repeat.period_ms(), 16);
        assert_eq!(
            RepeatSettings {
                rate: 0,
                delay_ms: 0
            }
            .period_ms(),
            1000
        );
    }
}
