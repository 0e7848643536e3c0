use anyhow::Result;
use async_trait::async_trait;
use bluer::{Adapter, AdapterEvent, DeviceEvent, DeviceProperty};
use futures::stream::{BoxStream, SelectAll, StreamExt};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// 适配器已知的一个蓝牙设备
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterDevice {
    pub address: String,
    pub name: String,
    pub connected: bool,
}

/// 蓝牙子系统的变化通知；Add 和 Remove 都可能意味着某个连接刚断开
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubsystemEvent {
    Add,
    Remove,
    Change,
}

impl SubsystemEvent {
    pub fn is_trigger(&self) -> bool {
        matches!(self, SubsystemEvent::Add | SubsystemEvent::Remove)
    }
}

/// 查询适配器上所有设备及其连接状态
#[async_trait]
pub trait AdapterStatus: Send + Sync {
    async fn devices(&self) -> Result<Vec<AdapterDevice>>;
}

/// 已知但未连接的设备名。
///
/// 同名设备只要有一个仍连接就不算断开，结果去重并保持出现顺序。
pub fn disconnected_names(devices: &[AdapterDevice]) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();

    for device in devices.iter().filter(|d| !d.connected) {
        let still_connected = devices
            .iter()
            .any(|d| d.connected && d.name == device.name);
        if !still_connected && !names.contains(&device.name) {
            names.push(device.name.clone());
        }
    }

    names
}

pub struct DisconnectDetector<A> {
    adapter: A,
}

impl<A: AdapterStatus> DisconnectDetector<A> {
    pub fn new(adapter: A) -> Self {
        Self { adapter }
    }

    /// 查询一次，返回当前断开的设备名
    pub async fn check(&self) -> Result<Vec<String>> {
        let devices = self.adapter.devices().await?;
        for device in &devices {
            if device.connected {
                info!("Device {} ({}) is still connected.", device.name, device.address);
            } else {
                info!("Device {} ({}) is disconnected.", device.name, device.address);
            }
        }
        Ok(disconnected_names(&devices))
    }

    /// 每收到一个 Add/Remove 通知就重新检查，把断开的设备名发给 Supervisor。
    /// 查询失败只记录日志，跳过本次。
    pub async fn run(
        self,
        mut events: mpsc::Receiver<SubsystemEvent>,
        tx: mpsc::Sender<Vec<String>>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            if !event.is_trigger() {
                continue;
            }

            match self.check().await {
                Ok(names) if names.is_empty() => {}
                Ok(names) => {
                    if tx.send(names).await.is_err() {
                        break;
                    }
                }
                Err(e) => error!("Error checking disconnected devices: {:#}", e),
            }
        }
        debug!("断开检测任务退出");
    }
}

/// 通过 BlueZ 查询的适配器
pub struct BluezAdapter {
    adapter: Adapter,
}

impl BluezAdapter {
    pub fn new(adapter: Adapter) -> Self {
        Self { adapter }
    }
}

#[async_trait]
impl AdapterStatus for BluezAdapter {
    async fn devices(&self) -> Result<Vec<AdapterDevice>> {
        debug!("Getting devices from adapter: {}", self.adapter.name());
        let mut devices = Vec::new();

        for address in self.adapter.device_addresses().await? {
            let device = self.adapter.device(address)?;
            let name = match device.name().await {
                Ok(Some(name)) => name,
                _ => "?".to_string(),
            };
            // 连接状态读不到的设备直接跳过
            let connected = match device.is_connected().await {
                Ok(connected) => connected,
                Err(e) => {
                    debug!("读取 {} 连接状态失败: {}", address, e);
                    continue;
                }
            };

            devices.push(AdapterDevice {
                address: address.to_string(),
                name,
                connected,
            });
        }

        Ok(devices)
    }
}

fn adapter_event_kind(event: &AdapterEvent) -> SubsystemEvent {
    match event {
        AdapterEvent::DeviceAdded(_) => SubsystemEvent::Add,
        AdapterEvent::DeviceRemoved(_) => SubsystemEvent::Remove,
        _ => SubsystemEvent::Change,
    }
}

/// 连接建立/断开对应内核里 HCI 连接节点的创建/删除
fn device_event_kind(event: &DeviceEvent) -> SubsystemEvent {
    match event {
        DeviceEvent::PropertyChanged(DeviceProperty::Connected(true)) => SubsystemEvent::Add,
        DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) => SubsystemEvent::Remove,
        _ => SubsystemEvent::Change,
    }
}

enum Watched {
    Adapter(AdapterEvent),
    Device(DeviceEvent),
}

/// 监听适配器及其所有设备的 D-Bus 事件，转成 SubsystemEvent
pub async fn watch_bluez(
    adapter: Adapter,
    tx: mpsc::Sender<SubsystemEvent>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut adapter_events = adapter.events().await?.boxed();
    let mut device_events: SelectAll<BoxStream<'static, DeviceEvent>> = SelectAll::new();

    for address in adapter.device_addresses().await? {
        let device = adapter.device(address)?;
        device_events.push(device.events().await?.boxed());
    }
    info!(
        "Watching {} for Bluetooth changes ({} devices)",
        adapter.name(),
        device_events.len()
    );

    loop {
        let watched = tokio::select! {
            _ = cancel.cancelled() => break,
            Some(event) = adapter_events.next() => Watched::Adapter(event),
            Some(event) = device_events.next(), if !device_events.is_empty() => Watched::Device(event),
            else => break,
        };

        let kind = match watched {
            Watched::Adapter(event) => {
                if let AdapterEvent::DeviceAdded(address) = &event {
                    // 新配对的设备也要订阅连接状态
                    match adapter.device(*address) {
                        Ok(device) => match device.events().await {
                            Ok(events) => device_events.push(events.boxed()),
                            Err(e) => warn!("订阅 {} 事件失败: {}", address, e),
                        },
                        Err(e) => warn!("获取设备 {} 失败: {}", address, e),
                    }
                }
                adapter_event_kind(&event)
            }
            Watched::Device(event) => device_event_kind(&event),
        };

        debug!("Bluetooth change: {:?}", kind);
        if tx.send(kind).await.is_err() {
            break;
        }
    }

    Ok(())
}
