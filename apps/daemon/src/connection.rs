//! 客户端连接
//!
//! 同一时刻只服务一个连接。数据在 poll 报告可读后读取一次，交给
//! [`FrameAssembler`] 重组，请求可以被拆成任意多次读取。

use fcp_protocol::{FrameAssembler, ProtocolError, RawRequest};
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;
use tracing::{debug, trace};

/// 单次读取的缓冲区大小
const READ_CHUNK: usize = 64 * 1024;

/// 响应写入超时（客户端停止读取时不会卡住服务端）
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// 一次读取的结果
#[derive(Debug)]
pub enum ReadOutcome {
    /// 读到了数据（可能还不足一条完整请求）
    Data(usize),
    /// 对端关闭
    Closed,
}

/// 已接受的客户端连接
pub struct Connection {
    stream: UnixStream,
    assembler: FrameAssembler,
}

impl Connection {
    pub fn new(stream: UnixStream) -> io::Result<Self> {
        stream.set_nonblocking(false)?;
        stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
        Ok(Self {
            stream,
            assembler: FrameAssembler::default(),
        })
    }

    /// 读取当前可用的数据（调用方保证 poll 已报告可读）
    pub fn read_available(&mut self) -> io::Result<ReadOutcome> {
        let mut buf = vec![0u8; READ_CHUNK];
        let n = loop {
            match self.stream.read(&mut buf) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };
        if n == 0 {
            return Ok(ReadOutcome::Closed);
        }
        self.assembler.extend(&buf[..n]);
        trace!(
            "Read {} bytes ({} buffered, expecting {:?})",
            n,
            self.assembler.bytes_read(),
            self.assembler.total_size()
        );
        Ok(ReadOutcome::Data(n))
    }

    /// 取出下一条完整请求
    pub fn next_request(&mut self) -> Result<Option<RawRequest>, ProtocolError> {
        self.assembler.next_request()
    }

    pub fn stream_mut(&mut self) -> &mut UnixStream {
        &mut self.stream
    }
}

impl AsFd for Connection {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}

/// 发送一帧响应；失败只记录日志（客户端可能已经断开）
pub fn send_frame(stream: &mut UnixStream, frame: &[u8]) {
    if let Err(e) = stream.write_all(frame) {
        debug!("Error sending response frame: {}", e);
    }
}
