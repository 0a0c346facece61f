//! 控制 socket 协议定义
//!
//! 用于 fcp-server 和 fcp-tool 之间的通信（Unix Domain Socket）。
//! 每条消息 = 6 字节消息头 + `payload_length` 字节负载。

use crate::{ProtocolError, le_u16, le_u32};
use num_enum::TryFromPrimitive;

// ============================================================================
// Constants
// ============================================================================

/// 请求消息魔数（客户端 → 服务端）
pub const REQUEST_MAGIC: u8 = 0x53;

/// 响应消息魔数（服务端 → 客户端）
pub const RESPONSE_MAGIC: u8 = 0x73;

/// 消息头长度
pub const HEADER_LEN: usize = 6;

/// 固件负载头长度：size + vid + pid + sha256 + md5
pub const FIRMWARE_PAYLOAD_HEADER_LEN: usize = 4 + 2 + 2 + 32 + 16;

/// 最大负载长度（16 MiB 固件 + 固件负载头）
pub const MAX_PAYLOAD_LENGTH: u32 = 16 * 1024 * 1024 + FIRMWARE_PAYLOAD_HEADER_LEN as u32;

/// 服务端接收缓冲区初始大小
/// 响应负载的最大长度（错误码 i16）
pub const MAX_RESPONSE_PAYLOAD_LENGTH: u32 = 2;

pub const INITIAL_BUFFER_SIZE: usize = 4096;

// ============================================================================
// Message Types
// ============================================================================

/// 请求类型（客户端 → 服务端）
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
pub enum RequestType {
    Reboot = 0x01,
    ConfigErase = 0x02,
    AppFirmwareErase = 0x03,
    AppFirmwareUpdate = 0x04,
    EspFirmwareUpdate = 0x05,
}

/// 响应类型（服务端 → 客户端）
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
pub enum ResponseType {
    Success = 0x80,
    Error = 0x81,
    Progress = 0x82,
}

// ============================================================================
// Error Codes
// ============================================================================

/// 返回给客户端的错误码（i16）
#[repr(i16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
pub enum ErrorCode {
    Read = 1,
    Write = 2,
    InvalidCommand = 3,
    InvalidMagic = 4,
    InvalidLength = 5,
    InvalidHash = 6,
    InvalidUsbId = 7,
    InvalidState = 8,
    Timeout = 9,
    Fcp = 10,
    Config = 11,
    NotLeapfrog = 12,
}

impl ErrorCode {
    /// 面向用户的错误描述
    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::Read => "Error reading from device",
            ErrorCode::Write => "Error writing to device",
            ErrorCode::InvalidCommand => "Invalid command",
            ErrorCode::InvalidMagic => "Invalid magic",
            ErrorCode::InvalidLength => "Invalid length",
            ErrorCode::InvalidHash => "Invalid hash",
            ErrorCode::InvalidUsbId => "Firmware is for a different device (USB ID mismatch)",
            ErrorCode::InvalidState => "Device is in an unexpected state",
            ErrorCode::Timeout => "Timeout",
            ErrorCode::Fcp => "Device command failed",
            ErrorCode::Config => "Device configuration lookup failed",
            ErrorCode::NotLeapfrog => "Device is not running the Leapfrog (loader) firmware",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

impl ProtocolError {
    /// 协议错误对应的客户端错误码
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ProtocolError::InvalidMagic(_) => ErrorCode::InvalidMagic,
            ProtocolError::UnknownMessageType(_) => ErrorCode::InvalidCommand,
            ProtocolError::PayloadTooLarge { .. }
            | ProtocolError::InvalidLength { .. }
            | ProtocolError::TooShort { .. }
            | ProtocolError::OutOfRange { .. } => ErrorCode::InvalidLength,
        }
    }
}

// ============================================================================
// Message Header
// ============================================================================

/// 消息头（6 字节，packed，小端）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub magic: u8,
    pub msg_type: u8,
    pub payload_length: u32,
}

impl MessageHeader {
    pub fn request(msg_type: RequestType, payload_length: u32) -> Self {
        Self {
            magic: REQUEST_MAGIC,
            msg_type: msg_type as u8,
            payload_length,
        }
    }

    pub fn response(msg_type: ResponseType, payload_length: u32) -> Self {
        Self {
            magic: RESPONSE_MAGIC,
            msg_type: msg_type as u8,
            payload_length,
        }
    }

    /// 编码消息头
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = self.magic;
        buf[1] = self.msg_type;
        buf[2..6].copy_from_slice(&self.payload_length.to_le_bytes());
        buf
    }

    /// 解码消息头（不校验魔数和类型）
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < HEADER_LEN {
            return Err(ProtocolError::TooShort {
                needed: HEADER_LEN,
                actual: buf.len(),
            });
        }
        Ok(Self {
            magic: buf[0],
            msg_type: buf[1],
            payload_length: le_u32(buf, 2),
        })
    }
}

// ============================================================================
// Firmware Payload
// ============================================================================

/// 固件更新请求负载
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwarePayload<'a> {
    pub usb_vid: u16,
    pub usb_pid: u16,
    pub sha256: [u8; 32],
    pub md5: [u8; 16],
    pub data: &'a [u8],
}

impl<'a> FirmwarePayload<'a> {
    /// 解码负载；声明的 size 必须与实际数据长度一致
    pub fn decode(payload: &'a [u8]) -> Result<Self, ProtocolError> {
        if payload.len() < FIRMWARE_PAYLOAD_HEADER_LEN {
            return Err(ProtocolError::TooShort {
                needed: FIRMWARE_PAYLOAD_HEADER_LEN,
                actual: payload.len(),
            });
        }

        let size = le_u32(payload, 0) as usize;
        let data = &payload[FIRMWARE_PAYLOAD_HEADER_LEN..];
        if size != data.len() {
            return Err(ProtocolError::InvalidLength {
                expected: size,
                actual: data.len(),
            });
        }

        let mut sha256 = [0u8; 32];
        sha256.copy_from_slice(&payload[8..40]);
        let mut md5 = [0u8; 16];
        md5.copy_from_slice(&payload[40..56]);

        Ok(Self {
            usb_vid: le_u16(payload, 4),
            usb_pid: le_u16(payload, 6),
            sha256,
            md5,
            data,
        })
    }

    /// 编码负载（不含消息头）
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FIRMWARE_PAYLOAD_HEADER_LEN + self.data.len());
        buf.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.usb_vid.to_le_bytes());
        buf.extend_from_slice(&self.usb_pid.to_le_bytes());
        buf.extend_from_slice(&self.sha256);
        buf.extend_from_slice(&self.md5);
        buf.extend_from_slice(self.data);
        buf
    }
}

// ============================================================================
// Encoding
// ============================================================================

/// 编码无负载请求（reboot / erase）
pub fn encode_simple_request(msg_type: RequestType) -> Vec<u8> {
    MessageHeader::request(msg_type, 0).encode().to_vec()
}

/// 编码固件更新请求（消息头 + 固件负载）
pub fn encode_firmware_request(msg_type: RequestType, payload: &FirmwarePayload<'_>) -> Vec<u8> {
    let body = payload.encode();
    let mut buf = Vec::with_capacity(HEADER_LEN + body.len());
    buf.extend_from_slice(&MessageHeader::request(msg_type, body.len() as u32).encode());
    buf.extend_from_slice(&body);
    buf
}

/// 编码成功响应
pub fn encode_success() -> [u8; HEADER_LEN] {
    MessageHeader::response(ResponseType::Success, 0).encode()
}

/// 编码错误响应（i16 错误码）
pub fn encode_error(code: ErrorCode) -> [u8; HEADER_LEN + 2] {
    let mut buf = [0u8; HEADER_LEN + 2];
    buf[..HEADER_LEN].copy_from_slice(&MessageHeader::response(ResponseType::Error, 2).encode());
    buf[HEADER_LEN..].copy_from_slice(&(code as i16).to_le_bytes());
    buf
}

/// 编码进度响应（u8 百分比）
pub fn encode_progress(percent: u8) -> [u8; HEADER_LEN + 1] {
    let mut buf = [0u8; HEADER_LEN + 1];
    buf[..HEADER_LEN].copy_from_slice(&MessageHeader::response(ResponseType::Progress, 1).encode());
    buf[HEADER_LEN] = percent.min(100);
    buf
}

// ============================================================================
// Response Decoding (client side)
// ============================================================================

/// 服务端响应
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    Success,
    /// 错误码；未知码保留原始值
    Error(Result<ErrorCode, i16>),
    Progress(u8),
}

impl Response {
    /// 由消息头和负载解码响应
    pub fn decode(header: &MessageHeader, payload: &[u8]) -> Result<Self, ProtocolError> {
        if header.magic != RESPONSE_MAGIC {
            return Err(ProtocolError::InvalidMagic(header.magic));
        }
        let msg_type = ResponseType::try_from(header.msg_type)
            .map_err(|_| ProtocolError::UnknownMessageType(header.msg_type))?;

        match msg_type {
            ResponseType::Success => Ok(Response::Success),
            ResponseType::Error => {
                if payload.len() != 2 {
                    return Err(ProtocolError::InvalidLength {
                        expected: 2,
                        actual: payload.len(),
                    });
                }
                let raw = i16::from_le_bytes([payload[0], payload[1]]);
                Ok(Response::Error(ErrorCode::try_from(raw).map_err(|_| raw)))
            },
            ResponseType::Progress => {
                if payload.len() != 1 {
                    return Err(ProtocolError::InvalidLength {
                        expected: 1,
                        actual: payload.len(),
                    });
                }
                Ok(Response::Progress(payload[0]))
            },
        }
    }
}

// ============================================================================
// Request Reassembly (server side)
// ============================================================================

/// 完整接收的请求消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRequest {
    pub msg_type: u8,
    pub payload: Vec<u8>,
}

impl RawRequest {
    /// 解析请求类型
    pub fn request_type(&self) -> Result<RequestType, ProtocolError> {
        RequestType::try_from(self.msg_type)
            .map_err(|_| ProtocolError::UnknownMessageType(self.msg_type))
    }
}

/// 请求重组器
///
/// 保存部分读取的缓冲区、已读字节数以及消息头到达后得知的总长度。
/// 数据可以任意拆分后多次送入。消息头无效时按其声明的负载长度丢弃
/// 后续字节，之后的消息照常重组。
#[derive(Debug)]
pub struct FrameAssembler {
    buffer: Vec<u8>,
    total_size: Option<usize>,
    max_payload: u32,
    /// 被拒绝消息剩余待丢弃的负载字节数
    discard: u64,
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new(MAX_PAYLOAD_LENGTH)
    }
}

impl FrameAssembler {
    pub fn new(max_payload: u32) -> Self {
        Self {
            buffer: Vec::with_capacity(INITIAL_BUFFER_SIZE),
            total_size: None,
            max_payload,
            discard: 0,
        }
    }

    /// 已缓存的字节数
    pub fn bytes_read(&self) -> usize {
        self.buffer.len()
    }

    /// 消息头到达后得知的消息总长度
    pub fn total_size(&self) -> Option<usize> {
        self.total_size
    }

    /// 仍在丢弃被拒绝消息的负载
    pub fn is_discarding(&self) -> bool {
        self.discard > 0
    }

    /// 追加读取到的数据（被拒绝消息的负载不进入缓冲区）
    pub fn extend(&mut self, data: &[u8]) {
        let skip = self.discard.min(data.len() as u64) as usize;
        self.discard -= skip as u64;
        self.buffer.extend_from_slice(&data[skip..]);
    }

    fn skip_discarded(&mut self) {
        let skip = self.discard.min(self.buffer.len() as u64) as usize;
        self.buffer.drain(..skip);
        self.discard -= skip as u64;
    }

    /// 拒绝当前消息头，丢弃其声明的负载
    fn reject(&mut self, header: &MessageHeader, error: ProtocolError) -> ProtocolError {
        self.buffer.drain(..HEADER_LEN);
        self.discard = u64::from(header.payload_length);
        self.skip_discarded();
        error
    }

    /// 取出下一条完整请求
    ///
    /// - `Ok(None)`: 需要更多数据
    /// - `Err(_)`: 魔数错误或负载过大；该消息被丢弃，后续消息照常返回
    pub fn next_request(&mut self) -> Result<Option<RawRequest>, ProtocolError> {
        self.skip_discarded();
        if self.discard > 0 {
            return Ok(None);
        }

        let total = match self.total_size {
            Some(total) => total,
            None => {
                if self.buffer.len() < HEADER_LEN {
                    return Ok(None);
                }
                let header = MessageHeader::decode(&self.buffer)?;
                if header.magic != REQUEST_MAGIC {
                    return Err(self.reject(&header, ProtocolError::InvalidMagic(header.magic)));
                }
                if header.payload_length > self.max_payload {
                    let error = ProtocolError::PayloadTooLarge {
                        length: header.payload_length,
                        max: self.max_payload,
                    };
                    return Err(self.reject(&header, error));
                }
                let total = HEADER_LEN + header.payload_length as usize;
                self.buffer.reserve(total.saturating_sub(self.buffer.len()));
                self.total_size = Some(total);
                total
            },
        };

        if self.buffer.len() < total {
            return Ok(None);
        }

        let msg_type = self.buffer[1];
        let payload = self.buffer[HEADER_LEN..total].to_vec();
        self.buffer.drain(..total);
        self.total_size = None;

        Ok(Some(RawRequest { msg_type, payload }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = MessageHeader::request(RequestType::AppFirmwareUpdate, 0x0102_0304);
        let buf = header.encode();
        assert_eq!(buf, [REQUEST_MAGIC, 0x04, 0x04, 0x03, 0x02, 0x01]);
        assert_eq!(MessageHeader::decode(&buf).unwrap(), header);
    }

    #[test]
    fn test_header_too_short() {
        assert!(matches!(
            MessageHeader::decode(&[REQUEST_MAGIC, 1, 0]),
            Err(ProtocolError::TooShort { .. })
        ));
    }

    #[test]
    fn test_magic_values_distinct() {
        assert_ne!(REQUEST_MAGIC, RESPONSE_MAGIC);
    }

    #[test]
    fn test_error_frame() {
        let buf = encode_error(ErrorCode::InvalidUsbId);
        let header = MessageHeader::decode(&buf).unwrap();
        assert_eq!(header.magic, RESPONSE_MAGIC);
        assert_eq!(header.payload_length, 2);
        let response = Response::decode(&header, &buf[HEADER_LEN..]).unwrap();
        assert_eq!(response, Response::Error(Ok(ErrorCode::InvalidUsbId)));
    }

    #[test]
    fn test_unknown_error_code_kept() {
        let header = MessageHeader::response(ResponseType::Error, 2);
        let response = Response::decode(&header, &99i16.to_le_bytes()).unwrap();
        assert_eq!(response, Response::Error(Err(99)));
    }

    #[test]
    fn test_progress_frame_clamped() {
        let buf = encode_progress(150);
        assert_eq!(buf[HEADER_LEN], 100);
    }

    #[test]
    fn test_response_rejects_request_magic() {
        let header = MessageHeader::request(RequestType::Reboot, 0);
        assert_eq!(
            Response::decode(&header, &[]),
            Err(ProtocolError::InvalidMagic(REQUEST_MAGIC))
        );
    }

    #[test]
    fn test_firmware_payload_roundtrip() {
        let data = [1u8, 2, 3, 4, 5];
        let payload = FirmwarePayload {
            usb_vid: 0x1235,
            usb_pid: 0x821d,
            sha256: [0xAB; 32],
            md5: [0xCD; 16],
            data: &data,
        };
        let buf = payload.encode();
        assert_eq!(buf.len(), FIRMWARE_PAYLOAD_HEADER_LEN + 5);
        assert_eq!(FirmwarePayload::decode(&buf).unwrap(), payload);
    }

    #[test]
    fn test_firmware_payload_size_mismatch() {
        let data = [0u8; 8];
        let payload = FirmwarePayload {
            usb_vid: 0x1235,
            usb_pid: 0x821b,
            sha256: [0; 32],
            md5: [0; 16],
            data: &data,
        };
        let mut buf = payload.encode();
        buf.pop();
        let err = FirmwarePayload::decode(&buf).unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::InvalidLength);
    }

    #[test]
    fn test_assembler_single_message() {
        let mut assembler = FrameAssembler::default();
        assembler.extend(&encode_simple_request(RequestType::Reboot));
        let request = assembler.next_request().unwrap().unwrap();
        assert_eq!(request.request_type().unwrap(), RequestType::Reboot);
        assert!(request.payload.is_empty());
        assert_eq!(assembler.bytes_read(), 0);
        assert!(assembler.next_request().unwrap().is_none());
    }

    #[test]
    fn test_assembler_header_split() {
        let mut assembler = FrameAssembler::default();
        let buf = encode_simple_request(RequestType::ConfigErase);
        assembler.extend(&buf[..3]);
        assert!(assembler.next_request().unwrap().is_none());
        assert_eq!(assembler.total_size(), None);
        assembler.extend(&buf[3..]);
        assert!(assembler.next_request().unwrap().is_some());
    }

    #[test]
    fn test_assembler_two_messages_in_one_read() {
        let mut assembler = FrameAssembler::default();
        let mut buf = encode_simple_request(RequestType::AppFirmwareErase);
        buf.extend_from_slice(&encode_simple_request(RequestType::Reboot));
        assembler.extend(&buf);
        assert_eq!(
            assembler.next_request().unwrap().unwrap().msg_type,
            RequestType::AppFirmwareErase as u8
        );
        assert_eq!(
            assembler.next_request().unwrap().unwrap().msg_type,
            RequestType::Reboot as u8
        );
        assert!(assembler.next_request().unwrap().is_none());
    }

    #[test]
    fn test_assembler_bad_magic() {
        let mut assembler = FrameAssembler::default();
        assembler.extend(&[0x00, 0x01, 0, 0, 0, 0]);
        let err = assembler.next_request().unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::InvalidMagic);
    }

    #[test]
    fn test_assembler_oversized_payload() {
        let mut assembler = FrameAssembler::new(1024);
        assembler.extend(&MessageHeader::request(RequestType::AppFirmwareUpdate, 1025).encode());
        let err = assembler.next_request().unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::InvalidLength);
        assert!(assembler.is_discarding());

        // 被拒绝的负载不缓存，随后的请求照常重组
        assembler.extend(&[0xAB; 1000]);
        assert_eq!(assembler.bytes_read(), 0);
        let mut rest = vec![0xAB; 25];
        rest.extend_from_slice(&encode_simple_request(RequestType::ConfigErase));
        assembler.extend(&rest);
        assert!(!assembler.is_discarding());
        let request = assembler.next_request().unwrap().unwrap();
        assert_eq!(request.request_type().unwrap(), RequestType::ConfigErase);
    }

    #[test]
    fn test_assembler_resyncs_after_bad_magic() {
        let mut assembler = FrameAssembler::default();
        let mut buf = vec![0x99, 0x01, 3, 0, 0, 0, 0xEE, 0xEE, 0xEE];
        buf.extend_from_slice(&encode_simple_request(RequestType::Reboot));
        assembler.extend(&buf);

        let err = assembler.next_request().unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::InvalidMagic);
        let request = assembler.next_request().unwrap().unwrap();
        assert_eq!(request.request_type().unwrap(), RequestType::Reboot);
        assert!(assembler.next_request().unwrap().is_none());
    }

    #[test]
    fn test_unknown_request_type_is_framed() {
        let mut assembler = FrameAssembler::default();
        assembler.extend(&[REQUEST_MAGIC, 0x42, 1, 0, 0, 0, 0xFF]);
        let request = assembler.next_request().unwrap().unwrap();
        assert_eq!(request.payload, vec![0xFF]);
        assert_eq!(
            request.request_type().unwrap_err().error_code(),
            ErrorCode::InvalidCommand
        );
    }

    #[test]
    fn test_error_code_values() {
        assert_eq!(ErrorCode::Read as i16, 1);
        assert_eq!(ErrorCode::NotLeapfrog as i16, 12);
        assert_eq!(ErrorCode::try_from(9i16).unwrap(), ErrorCode::Timeout);
        assert!(ErrorCode::try_from(0i16).is_err());
    }
}
