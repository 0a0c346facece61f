//! 命令传输抽象
//!
//! 真实设备由 [`HwdepTransport`](crate::HwdepTransport) 实现（ALSA hwdep ioctl），
//! 测试使用 `mock` feature 提供的 `MockDevice`。

use crate::TransportError;
use fcp_protocol::Opcode;
use std::os::fd::BorrowedFd;
use std::time::Duration;

/// 设备命令传输
///
/// 一次调用对应一条命令；实现不做任何重试。
pub trait Transport {
    /// 发送请求并读回恰好 `response_len` 字节的响应
    fn transact(
        &mut self,
        opcode: Opcode,
        request: &[u8],
        response_len: usize,
    ) -> Result<Vec<u8>, TransportError>;

    /// 读取一条设备通知（u32 位掩码）
    ///
    /// 在 `timeout` 内没有通知时返回 `Ok(None)`；被信号中断时自行重试。
    fn read_notification(&mut self, timeout: Duration) -> Result<Option<u32>, TransportError>;

    /// 可用于 poll 的通知描述符（没有时返回 None）
    fn notification_fd(&self) -> Option<BorrowedFd<'_>> {
        None
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn transact(
        &mut self,
        opcode: Opcode,
        request: &[u8],
        response_len: usize,
    ) -> Result<Vec<u8>, TransportError> {
        (**self).transact(opcode, request, response_len)
    }

    fn read_notification(&mut self, timeout: Duration) -> Result<Option<u32>, TransportError> {
        (**self).read_notification(timeout)
    }

    fn notification_fd(&self) -> Option<BorrowedFd<'_>> {
        (**self).notification_fd()
    }
}
