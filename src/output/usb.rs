use crate::report::{KEYBOARD_REPORT_LEN, MOUSE_REPORT_LEN};
use anyhow::{Context, Result, anyhow};
use log::{debug, info};
use std::path::{Path, PathBuf};
use std::time::Duration;
use usb_gadget::function::Handle;
use usb_gadget::function::hid::Hid;
use usb_gadget::{Class, Config, Gadget, Id, RegGadget, Strings, default_udc};

/// 启动协议键盘：修饰键字节、保留字节、5 个 LED 输出位、6 键数组。
/// 键数组覆盖整个 0..=0xFF 用法范围，多媒体键和日文键都要能送达主机。
pub const KEYBOARD_REPORT_DESC: &[u8] = &[
    0x05, 0x01, 0x09, 0x06, 0xA1, 0x01, // Generic Desktop / Keyboard / Application
    0x05, 0x07, 0x19, 0xE0, 0x29, 0xE7, // modifiers: Left Ctrl .. Right GUI
    0x15, 0x00, 0x25, 0x01, 0x75, 0x01, 0x95, 0x08, 0x81, 0x02, // 8 x 1 bit
    0x95, 0x01, 0x75, 0x08, 0x81, 0x03, // reserved
    0x95, 0x05, 0x75, 0x01, 0x05, 0x08, 0x19, 0x01, 0x29, 0x05, 0x91, 0x02, // LEDs
    0x95, 0x01, 0x75, 0x03, 0x91, 0x03, // LED padding
    0x95, 0x06, 0x75, 0x08, 0x15, 0x00, 0x26, 0xFF, 0x00, // 6 x 8 bit, 0..255
    0x05, 0x07, 0x19, 0x00, 0x2A, 0xFF, 0x00, 0x81, 0x00, // key array
    0xC0,
];

/// 三键相对鼠标：按钮字节、X、Y、滚轮
pub const MOUSE_REPORT_DESC: &[u8] = &[
    0x05, 0x01, 0x09, 0x02, 0xA1, 0x01, // Generic Desktop / Mouse / Application
    0x09, 0x01, 0xA1, 0x00, // Pointer / Physical
    0x05, 0x09, 0x19, 0x01, 0x29, 0x03, // buttons 1..3
    0x15, 0x00, 0x25, 0x01, 0x95, 0x03, 0x75, 0x01, 0x81, 0x02, // 3 x 1 bit
    0x95, 0x01, 0x75, 0x05, 0x81, 0x01, // padding
    0x05, 0x01, 0x09, 0x30, 0x09, 0x31, 0x09, 0x38, // X, Y, Wheel
    0x15, 0x81, 0x25, 0x7F, 0x75, 0x08, 0x95, 0x03, 0x81, 0x06, // 3 x i8, relative
    0xC0, 0xC0,
];

/// HID boot interface 协议号
const PROTOCOL_KEYBOARD: u8 = 1;
const PROTOCOL_MOUSE: u8 = 2;

/// 键盘与鼠标 endpoint 文件；若由本进程创建 gadget，则同时持有其注册
pub struct Endpoints {
    pub keyboard: PathBuf,
    pub mouse: PathBuf,
    _registration: Option<RegGadget>,
}

impl Endpoints {
    /// 使用已有的 endpoint，不做任何配置
    pub fn existing(keyboard: impl Into<PathBuf>, mouse: impl Into<PathBuf>) -> Self {
        Self {
            keyboard: keyboard.into(),
            mouse: mouse.into(),
            _registration: None,
        }
    }
}

fn hid_function(protocol: u8, report_desc: &[u8], report_len: u8) -> (Hid, Handle) {
    let mut builder = Hid::builder();
    builder.sub_class = 1;
    builder.protocol = protocol;
    builder.report_desc = report_desc.to_vec();
    builder.report_len = report_len;
    builder.build()
}

/// 创建 USB HID gadget（键盘 + 鼠标）并绑定到第一个 UDC。
///
/// 两个 endpoint 都已存在时直接复用，重复执行是安全的。
pub fn provision(keyboard_path: &Path, mouse_path: &Path) -> Result<Endpoints> {
    if keyboard_path.exists() && mouse_path.exists() {
        info!(
            "HID endpoints {} / {} already present, skipping gadget setup",
            keyboard_path.display(),
            mouse_path.display()
        );
        return Ok(Endpoints::existing(keyboard_path, mouse_path));
    }

    usb_gadget::remove_all().context("清理残留 gadget 失败")?;

    let (keyboard_fn, keyboard_handle) =
        hid_function(PROTOCOL_KEYBOARD, KEYBOARD_REPORT_DESC, KEYBOARD_REPORT_LEN as u8);
    let (mouse_fn, mouse_handle) =
        hid_function(PROTOCOL_MOUSE, MOUSE_REPORT_DESC, MOUSE_REPORT_LEN as u8);

    let mut config = Config::new("Config 1: USB Gadget");
    config.add_function(keyboard_handle);
    config.add_function(mouse_handle);

    // Multifunction Composite Gadget (Linux Foundation)
    let mut gadget = Gadget::new(
        Class::new(0xEF, 0x02, 0x01),
        Id::new(0x1d6b, 0x0104),
        Strings::new("Linux Foundation", "Multifunction Composite Gadget", "00100"),
    );
    gadget.add_config(config);

    let udc = default_udc().context("没有可用的 UDC")?;
    let registration = gadget.bind(&udc).context("绑定 gadget 到 UDC 失败")?;
    info!("USB gadget bound");

    // 设备节点由 udev 异步创建
    std::thread::sleep(Duration::from_secs(1));

    let keyboard = endpoint_for(&keyboard_fn).context("键盘 endpoint 未出现")?;
    let mouse = endpoint_for(&mouse_fn).context("鼠标 endpoint 未出现")?;
    debug!(
        "keyboard endpoint {}, mouse endpoint {}",
        keyboard.display(),
        mouse.display()
    );

    Ok(Endpoints {
        keyboard,
        mouse,
        _registration: Some(registration),
    })
}

/// 按 Linux dev_t 编码拆出主次设备号
fn split_dev(dev: u64) -> (u32, u32) {
    let major = ((dev >> 8) & 0xfff) | ((dev >> 32) & 0xffff_f000);
    let minor = (dev & 0xff) | ((dev >> 12) & 0xffff_ff00);
    (major as u32, minor as u32)
}

/// 在 /dev 下找到设备号与该 HID function 相同的 hidg 节点
fn endpoint_for(function: &Hid) -> Result<PathBuf> {
    use std::os::unix::fs::MetadataExt;

    let wanted = function.device()?;
    for entry in std::fs::read_dir("/dev")?.flatten() {
        if !entry.file_name().to_string_lossy().starts_with("hidg") {
            continue;
        }
        let path = entry.path();
        if let Ok(metadata) = std::fs::metadata(&path) {
            if split_dev(metadata.rdev()) == wanted {
                return Ok(path);
            }
        }
    }
    Err(anyhow!("/dev 下没有设备号为 {}:{} 的 hidg 节点", wanted.0, wanted.1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keymap::{is_modifier, scancode_to_hid};

    const LOGICAL_MAXIMUM: u8 = 0x24;
    const USAGE_MAXIMUM: u8 = 0x28;
    const COLLECTION: u8 = 0xA0;
    const END_COLLECTION: u8 = 0xC0;

    /// 拆成 (tag, 数据) 短条目；长度不对时返回 None
    fn items(desc: &[u8]) -> Option<Vec<(u8, u32)>> {
        let mut items = Vec::new();
        let mut i = 0;
        while i < desc.len() {
            let prefix = desc[i];
            // 低两位是数据长度 (3 表示 4 字节)
            let size = match prefix & 0x03 {
                3 => 4,
                n => n as usize,
            };
            let data = desc.get(i + 1..i + 1 + size)?;
            let value = data
                .iter()
                .rev()
                .fold(0u32, |acc, &b| (acc << 8) | b as u32);
            items.push((prefix & 0xFC, value));
            i += 1 + size;
        }
        Some(items)
    }

    /// 每个 Collection 都有对应的 End Collection
    fn collections_balanced(desc: &[u8]) -> bool {
        let Some(items) = items(desc) else {
            return false;
        };
        let mut depth = 0i32;
        for (tag, _) in items {
            match tag {
                COLLECTION => depth += 1,
                END_COLLECTION => depth -= 1,
                _ => {}
            }
        }
        depth == 0
    }

    /// 描述符里最后一个 `tag` 条目的值，对键盘来说就是键数组那一项
    fn last_value(desc: &[u8], tag: u8) -> u32 {
        items(desc)
            .unwrap()
            .into_iter()
            .filter(|(t, _)| *t == tag)
            .last()
            .map(|(_, v)| v)
            .unwrap()
    }

    #[test]
    fn descriptors_are_well_formed() {
        assert!(collections_balanced(KEYBOARD_REPORT_DESC));
        assert!(collections_balanced(MOUSE_REPORT_DESC));
    }

    #[test]
    fn every_mapped_key_fits_the_key_array() {
        let logical_max = last_value(KEYBOARD_REPORT_DESC, LOGICAL_MAXIMUM);
        let usage_max = last_value(KEYBOARD_REPORT_DESC, USAGE_MAXIMUM);
        assert_eq!(logical_max, 0xFF);
        assert_eq!(usage_max, 0xFF);

        let out_of_range: Vec<(u16, u8)> = (0..=0x2FFu16)
            .filter_map(|code| scancode_to_hid(code).map(|hid| (code, hid)))
            .filter(|&(_, hid)| !is_modifier(hid))
            .filter(|&(_, hid)| u32::from(hid) > logical_max || u32::from(hid) > usage_max)
            .collect();
        assert!(out_of_range.is_empty(), "{:?}", out_of_range);

        // 多媒体与日文键
        for code in [113u16, 115, 183, 85, 179, 164] {
            let hid = scancode_to_hid(code).unwrap();
            assert!(hid > 0x65 && u32::from(hid) <= logical_max);
        }
    }

    #[test]
    fn device_numbers() {
        // 经典 16 位编码
        assert_eq!(split_dev(0xEF01), (0xEF, 0x01));
        // 扩展编码：major 511, minor 300
        let dev = (511u64 & 0xfff) << 8 | (300u64 & 0xff) | ((300u64 & !0xff) << 12);
        assert_eq!(split_dev(dev), (511, 300));
    }

    #[test]
    fn existing_endpoints_skip_setup() {
        let dir = std::env::temp_dir();
        let endpoints = provision(&dir, &dir).unwrap();
        assert_eq!(endpoints.keyboard, dir);
        assert_eq!(endpoints.mouse, dir);
    }

    #[test]
    #[ignore]
    fn provision_real_gadget() {
        let endpoints = provision(Path::new("/dev/hidg0"), Path::new("/dev/hidg1"))
            .expect("创建 USB HID gadget 失败");
        println!(
            "keyboard: {}, mouse: {}",
            endpoints.keyboard.display(),
            endpoints.mouse.display()
        );
    }
}
