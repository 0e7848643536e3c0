use crate::core::SupervisorSettings;
use crate::input::keyboard::RepeatSettings;
use clap::{ArgAction, Parser};
use std::path::PathBuf;
use std::time::Duration;

/// 蓝牙键鼠 -> USB HID 代理
#[derive(Debug, Clone, Parser)]
#[command(version, about)]
pub struct Config {
    /// log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "warn")]
    pub loglevel: String,

    /// setup HID gadget on startup
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub setuphid: bool,

    /// proxy mice
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub mouse: bool,

    /// proxy keyboards
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub keyboard: bool,

    /// monitor Bluetooth changes for disconnects
    #[arg(long = "monitor-udev", default_value_t = true, action = ArgAction::Set)]
    pub monitor_disconnects: bool,

    /// BlueZ adapter
    #[arg(long = "bluez-adapter", default_value = "hci0")]
    pub adapter: String,

    /// keyboard repeat rate (repeats per second)
    #[arg(long = "kbdrepeat", default_value_t = 62, value_parser = clap::value_parser!(u32).range(1..))]
    pub repeat_rate: u32,

    /// keyboard repeat delay in ms
    #[arg(long = "kbddelay", default_value_t = 300)]
    pub repeat_delay_ms: u32,

    /// keyboard endpoint file
    #[arg(long, default_value = "/dev/hidg0")]
    pub keyboard_endpoint: PathBuf,

    /// mouse endpoint file
    #[arg(long, default_value = "/dev/hidg1")]
    pub mouse_endpoint: PathBuf,

    /// interval between input device scans in ms
    #[arg(long = "poll-interval-ms", default_value_t = 1000)]
    pub poll_interval_ms: u64,
}

impl Config {
    pub fn repeat(&self) -> RepeatSettings {
        RepeatSettings {
            rate: self.repeat_rate,
            delay_ms: self.repeat_delay_ms,
        }
    }

    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            keyboard: self.keyboard,
            mouse: self.mouse,
            repeat: self.repeat(),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }
}
