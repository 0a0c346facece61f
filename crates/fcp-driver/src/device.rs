//! 类型化设备客户端
//!
//! [`FcpDevice`] 把每个 [`Command`] 变体包装成一个方法：请求编码、响应长度
//! 校验和响应解码都在这里完成。

use crate::{Transport, TransportError};
use fcp_protocol::*;
use tracing::{debug, trace};

/// FCP 设备
pub struct FcpDevice<T: Transport> {
    transport: T,
}

impl<T: Transport> FcpDevice<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_inner(self) -> T {
        self.transport
    }

    /// 发送一条命令，返回长度已校验的响应
    pub fn send(&mut self, command: &Command<'_>) -> Result<Vec<u8>, TransportError> {
        command.validate()?;
        let request = command.encode_request();
        let expected = command.response_len();
        trace!(
            "{} opcode=0x{:08x} req={} resp={}",
            command.name(),
            command.opcode().raw(),
            request.len(),
            expected
        );

        let response = self.transport.transact(command.opcode(), &request, expected)?;
        if response.len() != expected {
            return Err(TransportError::ResponseLength {
                command: command.name(),
                expected,
                actual: response.len(),
            });
        }
        Ok(response)
    }

    // ========================================================================
    // Init
    // ========================================================================

    /// 查询设备是否支持某个命令类别
    pub fn cap_read(&mut self, category: Category) -> Result<bool, TransportError> {
        let resp = self.send(&Command::CapRead {
            category: category as u16,
        })?;
        Ok(decode_u8(&resp)? != 0)
    }

    pub fn reboot(&mut self) -> Result<(), TransportError> {
        self.send(&Command::Reboot).map(|_| ())
    }

    // ========================================================================
    // Meter / Mix / Mux
    // ========================================================================

    pub fn meter_info(&mut self) -> Result<u8, TransportError> {
        let resp = self.send(&Command::MeterInfo)?;
        Ok(decode_meter_info(&resp)?)
    }

    pub fn meter_read(&mut self, count: u16) -> Result<Vec<u32>, TransportError> {
        let resp = self.send(&Command::MeterRead { count })?;
        Ok(decode_u32_array(&resp))
    }

    pub fn mix_info(&mut self) -> Result<MixInfo, TransportError> {
        let resp = self.send(&Command::MixInfo)?;
        Ok(MixInfo::decode(&resp)?)
    }

    pub fn mix_read(&mut self, mix_num: u16, count: u16) -> Result<Vec<u16>, TransportError> {
        let resp = self.send(&Command::MixRead { mix_num, count })?;
        Ok(decode_u16_array(&resp))
    }

    pub fn mix_write(&mut self, mix_num: u16, values: &[u16]) -> Result<(), TransportError> {
        self.send(&Command::MixWrite { mix_num, values }).map(|_| ())
    }

    pub fn mux_info(&mut self) -> Result<[u16; 3], TransportError> {
        let resp = self.send(&Command::MuxInfo)?;
        Ok(decode_mux_info(&resp)?)
    }

    pub fn mux_read(&mut self, mux_num: u8, count: u8) -> Result<Vec<u32>, TransportError> {
        let resp = self.send(&Command::MuxRead { mux_num, count })?;
        Ok(decode_u32_array(&resp))
    }

    pub fn mux_write(&mut self, mux_num: u16, values: &[u32]) -> Result<(), TransportError> {
        self.send(&Command::MuxWrite { mux_num, values }).map(|_| ())
    }

    // ========================================================================
    // Flash
    // ========================================================================

    pub fn flash_info(&mut self) -> Result<FlashInfo, TransportError> {
        let resp = self.send(&Command::FlashInfo)?;
        Ok(FlashInfo::decode(&resp)?)
    }

    pub fn flash_segment_info(&mut self, segment: u32) -> Result<SegmentInfo, TransportError> {
        let resp = self.send(&Command::FlashSegmentInfo { segment })?;
        Ok(SegmentInfo::decode(&resp)?)
    }

    pub fn flash_erase(&mut self, segment: u8) -> Result<(), TransportError> {
        self.send(&Command::FlashErase { segment }).map(|_| ())
    }

    /// 擦除进度原始值（255 = 完成）
    pub fn flash_erase_progress(&mut self, segment: u32) -> Result<u8, TransportError> {
        let resp = self.send(&Command::FlashEraseProgress { segment })?;
        Ok(decode_u8(&resp)?)
    }

    pub fn flash_write(
        &mut self,
        segment: u32,
        offset: u32,
        data: &[u8],
    ) -> Result<(), TransportError> {
        self.send(&Command::FlashWrite {
            segment,
            offset,
            data,
        })
        .map(|_| ())
    }

    // ========================================================================
    // Sync / ESP DFU
    // ========================================================================

    /// 同步锁定状态
    pub fn sync_read(&mut self) -> Result<bool, TransportError> {
        let resp = self.send(&Command::SyncRead)?;
        Ok(decode_sync(&resp)?)
    }

    pub fn esp_dfu_start(&mut self, length: u32, md5: [u8; 16]) -> Result<(), TransportError> {
        self.send(&Command::EspDfuStart { length, md5 }).map(|_| ())
    }

    pub fn esp_dfu_write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.send(&Command::EspDfuWrite { data }).map(|_| ())
    }

    // ========================================================================
    // Data
    // ========================================================================

    pub fn data_read(
        &mut self,
        offset: u32,
        width: DataWidth,
        signed: bool,
    ) -> Result<i32, TransportError> {
        let resp = self.send(&Command::DataRead { offset, width })?;
        let value = decode_data(&resp, width, signed)?;
        debug!("Read data: offset={} size={} value={}", offset, width.bytes(), value);
        Ok(value)
    }

    pub fn data_write(
        &mut self,
        offset: u32,
        width: DataWidth,
        value: i32,
    ) -> Result<(), TransportError> {
        debug!("Writing data: offset={} size={} value={}", offset, width.bytes(), value);
        self.send(&Command::DataWrite {
            offset,
            width,
            value,
        })
        .map(|_| ())
    }

    pub fn data_notify(&mut self, event: u32) -> Result<(), TransportError> {
        self.send(&Command::DataNotify { event }).map(|_| ())
    }

    /// 读取完整 devmap（原始 base64 文本）
    pub fn devmap_read(&mut self) -> Result<Vec<u8>, TransportError> {
        let resp = self.send(&Command::DevmapInfo)?;
        let size = decode_devmap_size(&resp)? as usize;

        let mut devmap = Vec::with_capacity(size);
        for (block, offset) in (0..size).step_by(DEVMAP_BLOCK_SIZE).enumerate() {
            let len = DEVMAP_BLOCK_SIZE.min(size - offset);
            let chunk = self.send(&Command::DevmapRead {
                block: block as u32,
                len,
            })?;
            devmap.extend_from_slice(&chunk);
        }
        debug!("Read {} byte devmap", devmap.len());
        Ok(devmap)
    }

    // ========================================================================
    // Notifications
    // ========================================================================

    /// 读取一条通知（见 [`Transport::read_notification`]）
    pub fn read_notification(
        &mut self,
        timeout: std::time::Duration,
    ) -> Result<Option<u32>, TransportError> {
        self.transport.read_notification(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::time::Duration;

    /// 按顺序返回预设响应的最小传输
    struct ScriptedTransport {
        responses: VecDeque<Vec<u8>>,
        sent: Vec<(u32, Vec<u8>, usize)>,
    }

    impl Transport for ScriptedTransport {
        fn transact(
            &mut self,
            opcode: Opcode,
            request: &[u8],
            response_len: usize,
        ) -> Result<Vec<u8>, TransportError> {
            self.sent.push((opcode.raw(), request.to_vec(), response_len));
            Ok(self.responses.pop_front().unwrap_or_default())
        }

        fn read_notification(&mut self, _: Duration) -> Result<Option<u32>, TransportError> {
            Ok(None)
        }
    }

    fn device(responses: Vec<Vec<u8>>) -> FcpDevice<ScriptedTransport> {
        FcpDevice::new(ScriptedTransport {
            responses: responses.into(),
            sent: Vec::new(),
        })
    }

    #[test]
    fn test_response_length_checked() {
        let mut dev = device(vec![vec![0u8; 3]]);
        let err = dev.sync_read().unwrap_err();
        assert!(matches!(
            err,
            TransportError::ResponseLength {
                expected: 4,
                actual: 3,
                ..
            }
        ));
    }

    #[test]
    fn test_validate_before_send() {
        let mut dev = device(vec![]);
        assert!(dev.flash_erase(0).is_err());
        assert!(dev.transport().sent.is_empty());
    }

    #[test]
    fn test_devmap_read_blocks() {
        let size: u16 = 2500;
        let mut info = vec![0u8; 4];
        info[2..4].copy_from_slice(&size.to_le_bytes());
        let mut dev = device(vec![info, vec![b'a'; 1024], vec![b'b'; 1024], vec![b'c'; 452]]);

        let devmap = dev.devmap_read().unwrap();
        assert_eq!(devmap.len(), 2500);
        assert_eq!(devmap[1024], b'b');

        let sent = &dev.transport().sent;
        assert_eq!(sent.len(), 4);
        assert_eq!(sent[3].1, 2u32.to_le_bytes().to_vec());
        assert_eq!(sent[3].2, 452);
    }

    #[test]
    fn test_data_read_signed() {
        let mut dev = device(vec![vec![0xFF, 0xFF]]);
        assert_eq!(dev.data_read(0x10, DataWidth::U16, true).unwrap(), -1);
        assert_eq!(dev.transport().sent[0].0, 0x0080_0000);
    }
}
