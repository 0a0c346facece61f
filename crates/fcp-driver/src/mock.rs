//! Mock 设备（`mock` feature）
//!
//! 在内存中模拟 FCP 设备：flash segment、数据寄存器、ESP DFU 状态机和
//! 通知队列。[`MockDevice`] 是共享状态的句柄，克隆后交给被测代码，
//! 测试仍可通过原句柄检查设备状态。

use crate::esp_dfu::EspDfuConfig;
use crate::{Transport, TransportError};
use fcp_protocol::*;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// 模拟 flash segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockSegment {
    pub name: String,
    pub size: u32,
    pub data: Vec<u8>,
    pub erase_count: u32,
}

impl MockSegment {
    pub fn new(name: &str, size: u32) -> Self {
        Self {
            name: name.to_string(),
            size,
            data: Vec::new(),
            erase_count: 0,
        }
    }
}

/// 模拟 ESP 协处理器
#[derive(Debug, Clone)]
pub struct MockEsp {
    pub config: EspDfuConfig,
    /// 当前状态寄存器值
    pub state: u8,
    /// 已接收的固件
    pub received: Vec<u8>,
    /// DFU 开始时声明的长度和 md5
    pub started: Option<(u32, [u8; 16])>,
    /// 在每条期望通知前插入的无关通知位
    pub noise_bits: Option<u32>,
    /// 接收到这么多块之后不再发出 next-block
    pub stall_after_blocks: Option<usize>,
    pub blocks: usize,
    pub finished: bool,
}

/// 模拟设备内部状态
#[derive(Debug)]
pub struct MockState {
    pub capabilities: HashSet<u16>,
    pub flash_size: u32,
    pub segments: Vec<MockSegment>,
    /// 擦除进度脚本（每次轮询弹出一个，耗尽后返回 `erase_stall` 或 255）
    pub erase_script: VecDeque<u8>,
    /// 脚本耗尽后停留的进度值（擦除永不完成）
    pub erase_stall: Option<u8>,
    pub registers: HashMap<u32, i32>,
    pub notify_events: Vec<u32>,
    pub notifications: VecDeque<u32>,
    pub esp: Option<MockEsp>,
    pub devmap: Vec<u8>,
    pub sync_locked: bool,
    pub reboots: u32,
    /// 写类命令的数量
    pub device_writes: usize,
    /// 命令日志（名称）
    pub log: Vec<&'static str>,
    /// 注入失败的操作码
    pub fail_opcodes: HashSet<u32>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            capabilities: [Category::Init, Category::Data, Category::Flash]
                .into_iter()
                .map(|c| c as u16)
                .collect(),
            flash_size: 0x0080_0000,
            segments: Vec::new(),
            erase_script: VecDeque::new(),
            erase_stall: None,
            registers: HashMap::new(),
            notify_events: Vec::new(),
            notifications: VecDeque::new(),
            esp: None,
            devmap: Vec::new(),
            sync_locked: true,
            reboots: 0,
            device_writes: 0,
            log: Vec::new(),
            fail_opcodes: HashSet::new(),
        }
    }
}

/// 模拟 FCP 设备
#[derive(Debug, Clone, Default)]
pub struct MockDevice {
    state: Arc<Mutex<MockState>>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// 典型 Scarlett 4th Gen 布局：segment 0 为 App_Gold，1-4 为四个必需角色
    pub fn scarlett() -> Self {
        let device = Self::new();
        device.set_segments(vec![
            MockSegment::new("App_Gold", 0x0008_0000),
            MockSegment::new("App_Upgrade", 0x0008_0000),
            MockSegment::new("App_Settings", 0x0001_0000),
            MockSegment::new("App_Disk", 0x0004_0000),
            MockSegment::new("App_Env", 0x0000_2000),
        ]);
        device
    }

    /// 锁定内部状态
    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_segments(&self, segments: Vec<MockSegment>) {
        self.state().segments = segments;
    }

    pub fn set_erase_script(&self, script: impl IntoIterator<Item = u8>) {
        self.state().erase_script = script.into_iter().collect();
    }

    /// 脚本耗尽后擦除进度停在 `raw`
    pub fn stall_erase_at(&self, raw: u8) {
        self.state().erase_stall = Some(raw);
    }

    /// 启用 ESP 模拟
    pub fn enable_esp(&self, config: EspDfuConfig, initial_state: u8) {
        self.state().esp = Some(MockEsp {
            config,
            state: initial_state,
            received: Vec::new(),
            started: None,
            noise_bits: None,
            stall_after_blocks: None,
            blocks: 0,
            finished: false,
        });
    }

    pub fn set_esp_noise(&self, bits: u32) {
        if let Some(esp) = self.state().esp.as_mut() {
            esp.noise_bits = Some(bits);
        }
    }

    pub fn stall_esp_after(&self, blocks: usize) {
        if let Some(esp) = self.state().esp.as_mut() {
            esp.stall_after_blocks = Some(blocks);
        }
    }

    pub fn esp(&self) -> Option<MockEsp> {
        self.state().esp.clone()
    }

    pub fn set_devmap(&self, encoded: Vec<u8>) {
        self.state().devmap = encoded;
    }

    pub fn push_notification(&self, bits: u32) {
        self.state().notifications.push_back(bits);
    }

    pub fn fail_command(&self, category: Category, sub_op: u16) {
        self.state()
            .fail_opcodes
            .insert(Opcode::compose(category, sub_op).raw());
    }

    pub fn device_write_count(&self) -> usize {
        self.state().device_writes
    }

    pub fn segment(&self, index: usize) -> Option<MockSegment> {
        self.state().segments.get(index).cloned()
    }

    pub fn reboots(&self) -> u32 {
        self.state().reboots
    }
}

fn arg_u32(request: &[u8], at: usize) -> u32 {
    request
        .get(at..at + 4)
        .map_or(0, |b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn arg_u16(request: &[u8], at: usize) -> u16 {
    request
        .get(at..at + 2)
        .map_or(0, |b| u16::from_le_bytes([b[0], b[1]]))
}

impl MockState {
    fn signal_esp(&mut self) {
        let Some(esp) = self.esp.as_ref() else {
            return;
        };
        if let Some(noise) = esp.noise_bits {
            self.notifications.push_back(noise);
        }
        self.notifications.push_back(esp.config.dfu_change_mask);
    }

    fn set_dfu_notify(&mut self, value: u8) {
        if let Some(esp) = self.esp.as_ref() {
            self.registers
                .insert(esp.config.dfu_notify_offset, i32::from(value));
        }
        self.signal_esp();
    }

    fn data_read(&self, offset: u32) -> i32 {
        match self.esp.as_ref() {
            Some(esp) if offset == esp.config.state_offset => return i32::from(esp.state),
            _ => {},
        }
        self.registers.get(&offset).copied().unwrap_or(0)
    }

    fn data_notify(&mut self, event: u32) {
        self.notify_events.push(event);
        let Some(esp) = self.esp.as_mut() else {
            return;
        };
        if event != esp.config.boot_mode_event {
            return;
        }
        let mode = self
            .registers
            .get(&esp.config.boot_mode_offset)
            .copied()
            .unwrap_or(0);
        esp.state = mode as u8;
        self.signal_esp();
    }

    fn esp_dfu_start(&mut self, request: &[u8]) {
        let length = arg_u32(request, 4);
        let mut md5 = [0u8; 16];
        if let Some(bytes) = request.get(8..24) {
            md5.copy_from_slice(bytes);
        }
        let Some(esp) = self.esp.as_mut() else {
            return;
        };
        esp.started = Some((length, md5));
        esp.state = esp.config.states.dfu;
        esp.received.clear();
        esp.blocks = 0;
        let next_block = esp.config.notifications.next_block;
        self.signal_esp();
        self.set_dfu_notify(next_block);
    }

    fn esp_dfu_write(&mut self, data: &[u8]) {
        let Some(esp) = self.esp.as_mut() else {
            return;
        };
        let notifications = esp.config.notifications;
        if data.is_empty() {
            esp.finished = true;
            self.set_dfu_notify(notifications.finish);
            return;
        }
        esp.received.extend_from_slice(data);
        esp.blocks += 1;
        if esp.stall_after_blocks.is_some_and(|n| esp.blocks >= n) {
            return;
        }
        self.set_dfu_notify(notifications.next_block);
    }

    fn execute(&mut self, opcode: Opcode, request: &[u8], response_len: usize) -> Vec<u8> {
        let mut response = vec![0u8; response_len];
        let Some(category) = opcode.known_category() else {
            return response;
        };
        let sub_op = opcode.sub_op().value();
        match (category, sub_op) {
            (Category::Init, SUB_CAP_READ) => {
                if let Some(b) = response.first_mut() {
                    *b = u8::from(self.capabilities.contains(&arg_u16(request, 0)));
                }
            },
            (Category::Init, SUB_REBOOT) => {
                self.device_writes += 1;
                self.reboots += 1;
            },
            (Category::Meter, SUB_METER_INFO) => response[0] = 4,
            (Category::Mix, SUB_MIX_INFO) => {
                response[0] = 2;
                response[1] = 4;
            },
            (Category::Mix, SUB_MIX_WRITE) | (Category::Mux, SUB_MUX_WRITE) => {
                self.device_writes += 1;
            },
            (Category::Flash, SUB_FLASH_INFO) => {
                response[0..4].copy_from_slice(&self.flash_size.to_le_bytes());
                response[4..8].copy_from_slice(&(self.segments.len() as u32).to_le_bytes());
            },
            (Category::Flash, SUB_FLASH_SEGMENT_INFO) => {
                if let Some(segment) = self.segments.get(arg_u32(request, 0) as usize) {
                    response[0..4].copy_from_slice(&segment.size.to_le_bytes());
                    let name = segment.name.as_bytes();
                    let len = name.len().min(15);
                    response[8..8 + len].copy_from_slice(&name[..len]);
                }
            },
            (Category::Flash, SUB_FLASH_ERASE) => {
                self.device_writes += 1;
                let index = request.first().copied().unwrap_or(0) as usize;
                if let Some(segment) = self.segments.get_mut(index) {
                    segment.data.clear();
                    segment.erase_count += 1;
                }
            },
            (Category::Flash, SUB_FLASH_ERASE_PROGRESS) => {
                response[0] = self
                    .erase_script
                    .pop_front()
                    .or(self.erase_stall)
                    .unwrap_or(ERASE_DONE);
            },
            (Category::Flash, SUB_FLASH_WRITE) => {
                self.device_writes += 1;
                let index = arg_u32(request, 0) as usize;
                let offset = arg_u32(request, 4) as usize;
                let data = request.get(12..).unwrap_or_default();
                if let Some(segment) = self.segments.get_mut(index) {
                    if segment.data.len() < offset + data.len() {
                        segment.data.resize(offset + data.len(), 0xFF);
                    }
                    segment.data[offset..offset + data.len()].copy_from_slice(data);
                }
            },
            (Category::Sync, SUB_SYNC_READ) => {
                response[0] = u8::from(self.sync_locked);
            },
            (Category::EspDfu, SUB_ESP_DFU_START) => {
                self.device_writes += 1;
                self.esp_dfu_start(request);
            },
            (Category::EspDfu, SUB_ESP_DFU_WRITE) => {
                self.device_writes += 1;
                self.esp_dfu_write(request);
            },
            (Category::Data, SUB_DATA_READ) => {
                let value = self.data_read(arg_u32(request, 0));
                let len = response.len().min(4);
                response[..len].copy_from_slice(&value.to_le_bytes()[..len]);
            },
            (Category::Data, SUB_DATA_WRITE) => {
                self.device_writes += 1;
                let offset = arg_u32(request, 0);
                let mut bytes = [0u8; 4];
                let value = request.get(8..).unwrap_or_default();
                let len = value.len().min(4);
                bytes[..len].copy_from_slice(&value[..len]);
                self.registers.insert(offset, i32::from_le_bytes(bytes));
            },
            (Category::Data, SUB_DATA_NOTIFY) => {
                self.device_writes += 1;
                self.data_notify(arg_u32(request, 0));
            },
            (Category::Data, SUB_DEVMAP_INFO) => {
                response[2..4].copy_from_slice(&(self.devmap.len() as u16).to_le_bytes());
            },
            (Category::Data, SUB_DEVMAP_READ) => {
                let start = arg_u32(request, 0) as usize * DEVMAP_BLOCK_SIZE;
                if let Some(chunk) = self.devmap.get(start..start + response_len) {
                    response.copy_from_slice(chunk);
                }
            },
            _ => {},
        }
        response
    }
}

impl Transport for MockDevice {
    fn transact(
        &mut self,
        opcode: Opcode,
        request: &[u8],
        response_len: usize,
    ) -> Result<Vec<u8>, TransportError> {
        let mut state = self.state();
        if state.fail_opcodes.contains(&opcode.raw()) {
            return Err(TransportError::Io {
                command: "mock",
                source: std::io::Error::from_raw_os_error(5),
            });
        }
        let response = state.execute(opcode, request, response_len);
        state.log.push(command_name(opcode));
        Ok(response)
    }

    fn read_notification(&mut self, _timeout: Duration) -> Result<Option<u32>, TransportError> {
        Ok(self.state().notifications.pop_front())
    }
}

fn command_name(opcode: Opcode) -> &'static str {
    let Some(category) = opcode.known_category() else {
        return "unknown";
    };
    match (category, opcode.sub_op().value()) {
        (Category::Init, SUB_CAP_READ) => "cap-read",
        (Category::Init, SUB_REBOOT) => "reboot",
        (Category::Flash, SUB_FLASH_INFO) => "flash-info",
        (Category::Flash, SUB_FLASH_SEGMENT_INFO) => "flash-segment-info",
        (Category::Flash, SUB_FLASH_ERASE) => "flash-erase",
        (Category::Flash, SUB_FLASH_ERASE_PROGRESS) => "flash-erase-progress",
        (Category::Flash, SUB_FLASH_WRITE) => "flash-write",
        (Category::EspDfu, SUB_ESP_DFU_START) => "esp-dfu-start",
        (Category::EspDfu, SUB_ESP_DFU_WRITE) => "esp-dfu-write",
        (Category::Data, SUB_DATA_READ) => "data-read",
        (Category::Data, SUB_DATA_WRITE) => "data-write",
        (Category::Data, SUB_DATA_NOTIFY) => "data-notify",
        (Category::Data, SUB_DEVMAP_INFO) => "devmap-info",
        (Category::Data, SUB_DEVMAP_READ) => "devmap-read",
        _ => "other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FcpDevice;

    #[test]
    fn test_mock_flash_layout() {
        let mut device = FcpDevice::new(MockDevice::scarlett());
        let info = device.flash_info().unwrap();
        assert_eq!(info.count, 5);
        assert_eq!(device.flash_segment_info(4).unwrap().name, "App_Env");
        assert!(device.cap_read(Category::Data).unwrap());
        assert!(!device.cap_read(Category::Mux).unwrap());
    }

    #[test]
    fn test_mock_write_and_erase() {
        let mock = MockDevice::scarlett();
        let mut device = FcpDevice::new(mock.clone());
        device.flash_write(1, 4, &[1, 2, 3]).unwrap();
        assert_eq!(mock.segment(1).unwrap().data, vec![0xFF, 0xFF, 0xFF, 0xFF, 1, 2, 3]);
        device.flash_erase(1).unwrap();
        assert!(mock.segment(1).unwrap().data.is_empty());
        assert_eq!(mock.device_write_count(), 2);
    }

    #[test]
    fn test_mock_failure_injection() {
        let mock = MockDevice::scarlett();
        mock.fail_command(Category::Flash, SUB_FLASH_INFO);
        let mut device = FcpDevice::new(mock);
        assert!(matches!(device.flash_info(), Err(TransportError::Io { .. })));
    }
}
