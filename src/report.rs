use crate::keymap::{is_modifier, modifier_bit};
use std::time::Instant;

pub const KEYBOARD_REPORT_LEN: usize = 8;
pub const MOUSE_REPORT_LEN: usize = 4;

/// 启动协议键盘报告: [modifiers, reserved, key1..key6]
pub type KeyboardReport = [u8; KEYBOARD_REPORT_LEN];

/// 三键相对鼠标报告: [buttons, dx, dy, wheel]
pub type MouseReport = [u8; MOUSE_REPORT_LEN];

/// 带采集时间戳的报告，从 worker 经队列移交给分发器
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stamped<R> {
    pub report: R,
    pub captured_at: Instant,
}

impl<R> Stamped<R> {
    pub fn now(report: R) -> Self {
        Self {
            report,
            captured_at: Instant::now(),
        }
    }
}

/// 由当前按住的 HID 键码生成键盘报告。
///
/// 修饰键合并进首字节，其余键按出现顺序填入 2..8，
/// 超过 6 个的部分直接截断。
pub fn build_keyboard_report(held: &[u8]) -> KeyboardReport {
    let mut report = [0u8; KEYBOARD_REPORT_LEN];

    report[0] = held
        .iter()
        .filter_map(|&key| modifier_bit(key))
        .fold(0, |mods, bit| mods | bit);

    let keys = held.iter().filter(|&&key| !is_modifier(key));
    for (slot, &key) in report[2..].iter_mut().zip(keys) {
        *slot = key;
    }

    report
}

/// 生成鼠标报告，位移按 i8 截断（超出范围的值会回绕）
pub fn build_mouse_report(buttons: u8, dx: i32, dy: i32, wheel: i32) -> MouseReport {
    [buttons, dx as i8 as u8, dy as i8 as u8, wheel as i8 as u8]
}
