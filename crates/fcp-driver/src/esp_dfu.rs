//! ESP 协处理器 DFU 状态机
//!
//! ## 状态
//!
//! - `Off`: ESP 关闭
//! - `DFU`: 加载器模式，接受新固件
//! - `Normal`: 应用运行中
//!
//! 状态切换：写 boot-mode 寄存器 + data-notify，等待 "DFU change" 通知位，
//! 再轮询状态寄存器确认。所有等待都有独立的时间上限。
//!
//! ## 更新流程
//!
//! ```text
//! Normal -> Off -> dfu_start -> DFU -> [block, next_block]* -> empty write
//!        -> finish -> Off -> Normal
//! ```

use crate::flash::check_usb_id;
use crate::{DfuError, DriverError, FcpDevice, ProgressSink, ProgressTracker, Transport};
use fcp_protocol::{DataWidth, FirmwarePayload};
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// ESP 固件块大小
pub const ESP_FLASH_BLOCK_SIZE: usize = 1024;

// ============================================================================
// Configuration
// ============================================================================

/// ESP 状态码（来自 devmap 的 `eSuperState`）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EspStates {
    pub off: u8,
    pub dfu: u8,
    pub normal: u8,
}

/// DFU 通知码（来自 devmap 的 `eDFU_NOTIFICATION`）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DfuNotifications {
    pub clear: u8,
    pub next_block: u8,
    pub finish: u8,
    pub error: u8,
}

/// ESP DFU 配置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EspDfuConfig {
    pub states: EspStates,
    pub notifications: DfuNotifications,
    /// 状态寄存器偏移（ESP 基址 + SuperState）
    pub state_offset: u32,
    /// boot-mode 寄存器偏移（绝对地址）
    pub boot_mode_offset: u32,
    /// DFU 通知寄存器偏移（ESP 基址 + DFU_NOTIFY）
    pub dfu_notify_offset: u32,
    /// 客户端通知中的 "DFU change" 位
    pub dfu_change_mask: u32,
    /// 写 boot-mode 后发给设备的事件
    pub boot_mode_event: u32,
}

fn lookup<'a>(devmap: &'a Value, path: &[&str]) -> Result<&'a Value, DfuError> {
    path.iter()
        .try_fold(devmap, |node, key| node.get(key))
        .ok_or_else(|| DfuError::Config(format!("devmap key {} not found", path.join("."))))
}

fn lookup_int(devmap: &Value, path: &[&str]) -> Result<i64, DfuError> {
    lookup(devmap, path)?
        .as_i64()
        .ok_or_else(|| DfuError::Config(format!("devmap key {} is not an integer", path.join("."))))
}

fn lookup_enum(devmap: &Value, enum_name: &str, value_name: &str) -> Result<u8, DfuError> {
    let value = lookup_int(devmap, &["enums", enum_name, "enumerators", value_name])?;
    u8::try_from(value).map_err(|_| {
        DfuError::Config(format!("{enum_name}.{value_name} value {value} out of range"))
    })
}

fn to_u32(name: &str, value: i64) -> Result<u32, DfuError> {
    u32::try_from(value)
        .map_err(|_| DfuError::Config(format!("{name} value {value} out of range")))
}

impl EspDfuConfig {
    /// 从 devmap JSON 提取 DFU 配置
    pub fn from_devmap(devmap: &Value) -> Result<Self, DfuError> {
        let states = EspStates {
            off: lookup_enum(devmap, "eSuperState", "eSuperOff")?,
            dfu: lookup_enum(devmap, "eSuperState", "eSuperDFU")?,
            normal: lookup_enum(devmap, "eSuperState", "eSuperNormal")?,
        };
        let notifications = DfuNotifications {
            clear: lookup_enum(devmap, "eDFU_NOTIFICATION", "eClear")?,
            next_block: lookup_enum(devmap, "eDFU_NOTIFICATION", "eNextblock")?,
            finish: lookup_enum(devmap, "eDFU_NOTIFICATION", "eFinish")?,
            error: lookup_enum(devmap, "eDFU_NOTIFICATION", "eError")?,
        };
        let dfu_change = lookup_int(
            devmap,
            &["enums", "eDEV_FCP_NOTIFY_MESSAGE_TYPE", "enumerators", "FCP_NOTIFY_DFU_CHANGE"],
        )?;

        let app = ["structs", "APP_SPACE", "members"];
        let esp = ["structs", "ESP_SPACE", "members"];
        let esp_base = lookup_int(devmap, &[app[0], app[1], app[2], "espSpace", "offset"])?;
        let super_state = lookup_int(devmap, &[esp[0], esp[1], esp[2], "SuperState", "offset"])?;
        let dfu_notify = lookup_int(devmap, &[esp[0], esp[1], esp[2], "DFU_NOTIFY", "offset"])?;
        let boot_mode = lookup_int(devmap, &[app[0], app[1], app[2], "ESPBootMode", "offset"])?;
        let boot_mode_event =
            lookup_int(devmap, &[app[0], app[1], app[2], "ESPBootMode", "notify-device"])?;

        Ok(Self {
            states,
            notifications,
            state_offset: to_u32("SuperState", esp_base + super_state)?,
            boot_mode_offset: to_u32("ESPBootMode", boot_mode)?,
            dfu_notify_offset: to_u32("DFU_NOTIFY", esp_base + dfu_notify)?,
            dfu_change_mask: to_u32("FCP_NOTIFY_DFU_CHANGE", dfu_change)?,
            boot_mode_event: to_u32("ESPBootMode.notify-device", boot_mode_event)?,
        })
    }
}

/// DFU 时序参数
#[derive(Debug, Clone)]
pub struct DfuTimings {
    /// 单次通知等待上限
    pub notification_timeout: Duration,
    /// 状态确认次数
    pub state_attempts: u32,
    /// 状态确认间隔
    pub state_interval: Duration,
    /// DFU 通知寄存器检查次数
    pub notify_attempts: u32,
    /// DFU 通知寄存器检查间隔
    pub notify_interval: Duration,
}

impl Default for DfuTimings {
    fn default() -> Self {
        Self {
            notification_timeout: Duration::from_secs(10),
            state_attempts: 5,
            state_interval: Duration::from_millis(100),
            notify_attempts: 5,
            notify_interval: Duration::from_millis(100),
        }
    }
}

// ============================================================================
// State machine
// ============================================================================

/// ESP DFU 会话（借用设备和配置）
pub struct EspDfu<'a, T: Transport> {
    device: &'a mut FcpDevice<T>,
    config: &'a EspDfuConfig,
    timings: &'a DfuTimings,
}

impl<'a, T: Transport> EspDfu<'a, T> {
    pub fn new(
        device: &'a mut FcpDevice<T>,
        config: &'a EspDfuConfig,
        timings: &'a DfuTimings,
    ) -> Self {
        Self {
            device,
            config,
            timings,
        }
    }

    /// 读取 ESP 状态寄存器
    pub fn state(&mut self) -> Result<u8, DfuError> {
        let value = self
            .device
            .data_read(self.config.state_offset, DataWidth::U8, false)
            .map_err(|e| {
                error!("Cannot get ESP state: {}", e);
                DfuError::Fcp(e)
            })?;
        Ok(value as u8)
    }

    fn set_boot_mode(&mut self, mode: u8) -> Result<(), DfuError> {
        self.device
            .data_write(self.config.boot_mode_offset, DataWidth::U8, i32::from(mode))
            .map_err(|e| {
                error!("Cannot set ESP boot mode: {}", e);
                DfuError::Fcp(e)
            })?;
        self.device
            .data_notify(self.config.boot_mode_event)
            .map_err(|e| {
                error!("Cannot notify ESP boot mode: {}", e);
                DfuError::Fcp(e)
            })
    }

    /// 等待 "DFU change" 通知位（忽略其他位）
    ///
    /// 截止时间在每次循环重新计算。
    pub fn wait_notification(&mut self, what: &'static str) -> Result<(), DfuError> {
        debug!("Waiting for ESP notification: {}", what);
        let deadline = Instant::now() + self.timings.notification_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.device.read_notification(remaining) {
                Ok(None) => break,
                Ok(Some(bits)) => {
                    debug!("Received notification 0x{:08x} while waiting for {}", bits, what);
                    if bits & self.config.dfu_change_mask != 0 {
                        return Ok(());
                    }
                },
                Err(e) => {
                    error!("Failed to read notification for {}: {}", what, e);
                    return Err(DfuError::Fcp(e));
                },
            }
        }
        error!("Timeout waiting for {}", what);
        Err(DfuError::Timeout(what))
    }

    /// 轮询状态寄存器直到等于 `expected`
    pub fn check_state(&mut self, expected: u8) -> Result<(), DfuError> {
        let mut actual = 0;
        for attempt in 0..self.timings.state_attempts {
            actual = self.state()?;
            debug!("ESP state: {}, expected: {}", actual, expected);
            if actual == expected {
                return Ok(());
            }
            if attempt + 1 < self.timings.state_attempts {
                std::thread::sleep(self.timings.state_interval);
            }
        }
        error!("ESP state change timeout; expected {}, got {}", expected, actual);
        Err(DfuError::InvalidState { expected, actual })
    }

    /// 切换 ESP 状态并确认
    pub fn set_state(&mut self, target: u8) -> Result<(), DfuError> {
        debug!("Setting ESP state to {}", target);
        self.set_boot_mode(target)?;
        self.wait_notification("ESP state change")?;
        self.check_state(target)
    }

    /// 等待 DFU 通知寄存器变为 `expected`（每次读取后清除）
    pub fn wait_dfu_notify(&mut self, expected: u8, what: &'static str) -> Result<(), DfuError> {
        let offset = self.config.dfu_notify_offset;
        for attempt in 0..self.timings.notify_attempts {
            self.wait_notification(what)?;

            let notify = self
                .device
                .data_read(offset, DataWidth::U8, false)
                .map_err(|e| {
                    error!("Cannot get ESP DFU notify: {}", e);
                    DfuError::Fcp(e)
                })? as u8;
            self.device
                .data_write(offset, DataWidth::U8, i32::from(self.config.notifications.clear))
                .map_err(|e| {
                    error!("Cannot clear ESP DFU notify: {}", e);
                    DfuError::Fcp(e)
                })?;

            if notify == expected {
                return Ok(());
            }
            if notify == self.config.notifications.error {
                warn!("ESP reported DFU error while waiting for {}", what);
            }
            if attempt + 1 < self.timings.notify_attempts {
                std::thread::sleep(self.timings.notify_interval);
            }
        }
        error!("ESP DFU notify timeout waiting for {}", what);
        Err(DfuError::Timeout(what))
    }

    /// 执行完整的 DFU 传输（调用方已完成负载校验）
    pub fn run<P: ProgressSink + ?Sized>(
        &mut self,
        data: &[u8],
        md5: [u8; 16],
        tracker: &mut ProgressTracker<'_, P>,
    ) -> Result<(), DfuError> {
        let states = self.config.states;
        let notifications = self.config.notifications;

        let state = self.state()?;
        if state == 0 {
            error!("ESP state (0) invalid (not running leapfrog firmware?)");
            return Err(DfuError::NotLeapfrog);
        }
        if state == states.normal {
            info!("ESP is running, turning it off");
            self.set_state(states.off)?;
        } else if state != states.off {
            error!("ESP state {} is neither off nor normal", state);
            return Err(DfuError::InvalidState {
                expected: states.off,
                actual: state,
            });
        }

        info!("Starting ESP DFU ({} bytes)", data.len());
        self.device
            .esp_dfu_start(data.len() as u32, md5)
            .map_err(|e| {
                error!("Cannot start ESP DFU: {}", e);
                DfuError::Fcp(e)
            })?;
        self.wait_notification("ESP DFU start")?;
        self.check_state(states.dfu)?;
        self.wait_dfu_notify(notifications.next_block, "first block request")?;

        let total = data.len() as u64;
        for (i, block) in data.chunks(ESP_FLASH_BLOCK_SIZE).enumerate() {
            let offset = i * ESP_FLASH_BLOCK_SIZE;
            self.device.esp_dfu_write(block).map_err(|e| {
                error!("Error writing ESP firmware block at offset {}", offset);
                DfuError::Write(e)
            })?;
            self.wait_dfu_notify(notifications.next_block, "next block request")?;
            tracker.update_ratio((offset + block.len()) as u64, total);
            tracker.tick();
        }

        debug!("Sending end of transfer");
        self.device
            .esp_dfu_write(&[])
            .map_err(DfuError::Write)?;
        self.wait_dfu_notify(notifications.finish, "DFU finish")?;

        self.set_state(states.off)?;
        self.set_state(states.normal)?;
        info!("ESP firmware update complete");
        Ok(())
    }
}

/// 处理 ESP 固件更新请求
///
/// 检查顺序：配置、USB ID、sha256，全部通过前不访问设备。
pub fn update_esp_firmware<T, P>(
    device: &mut FcpDevice<T>,
    config: Option<&EspDfuConfig>,
    usb_id: (u16, u16),
    payload: &FirmwarePayload<'_>,
    timings: &DfuTimings,
    sink: &mut P,
) -> Result<(), DriverError>
where
    T: Transport,
    P: ProgressSink + ?Sized,
{
    let config = config.ok_or_else(|| {
        error!("ESP DFU configuration unavailable (no devmap)");
        DfuError::Config("no devmap available".to_string())
    })?;
    check_usb_id(payload, usb_id.0, usb_id.1)?;
    if !crate::flash::verify_sha256(payload.data, &payload.sha256) {
        error!("Firmware sha256 mismatch");
        return Err(DriverError::InvalidHash);
    }

    let mut tracker = ProgressTracker::new(sink);
    tracker.update(0);

    EspDfu::new(device, config, timings).run(payload.data, payload.md5, &mut tracker)?;
    tracker.finish();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_devmap() -> Value {
        json!({
            "enums": {
                "eSuperState": {"enumerators": {"eSuperOff": 1, "eSuperDFU": 2, "eSuperNormal": 3}},
                "eDFU_NOTIFICATION": {"enumerators": {"eClear": 0, "eNextblock": 1, "eFinish": 2, "eError": 3}},
                "eDEV_FCP_NOTIFY_MESSAGE_TYPE": {"enumerators": {"FCP_NOTIFY_DFU_CHANGE": 0x0040_0000}}
            },
            "structs": {
                "APP_SPACE": {"members": {
                    "espSpace": {"offset": 0x1000},
                    "ESPBootMode": {"offset": 0x40, "notify-device": 17}
                }},
                "ESP_SPACE": {"members": {
                    "SuperState": {"offset": 4},
                    "DFU_NOTIFY": {"offset": 8}
                }}
            }
        })
    }

    #[test]
    fn test_config_from_devmap() {
        let config = EspDfuConfig::from_devmap(&sample_devmap()).unwrap();
        assert_eq!(
            config.states,
            EspStates {
                off: 1,
                dfu: 2,
                normal: 3
            }
        );
        assert_eq!(config.notifications.next_block, 1);
        assert_eq!(config.state_offset, 0x1004);
        assert_eq!(config.dfu_notify_offset, 0x1008);
        assert_eq!(config.boot_mode_offset, 0x40);
        assert_eq!(config.boot_mode_event, 17);
        assert_eq!(config.dfu_change_mask, 0x0040_0000);
    }

    #[test]
    fn test_config_missing_key_named() {
        let mut devmap = sample_devmap();
        devmap["structs"]["ESP_SPACE"]["members"]
            .as_object_mut()
            .unwrap()
            .remove("DFU_NOTIFY");
        match EspDfuConfig::from_devmap(&devmap) {
            Err(DfuError::Config(msg)) => assert!(msg.contains("DFU_NOTIFY")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_config_rejects_out_of_range_enum() {
        let mut devmap = sample_devmap();
        devmap["enums"]["eSuperState"]["enumerators"]["eSuperDFU"] = json!(300);
        assert!(matches!(
            EspDfuConfig::from_devmap(&devmap),
            Err(DfuError::Config(_))
        ));
    }

    #[test]
    fn test_default_timings() {
        let timings = DfuTimings::default();
        assert_eq!(timings.notification_timeout, Duration::from_secs(10));
        assert_eq!(timings.state_attempts, 5);
        assert_eq!(timings.notify_interval, Duration::from_millis(100));
    }
}
