//! fcp-server socket 会话
//!
//! 每条请求发送后读取响应直到终止帧（success / error）。每收到一条
//! 进度帧，空闲超时重新计时。

use fcp_firmware::{FirmwareSection, FirmwareType};
use fcp_protocol::{
    ErrorCode, FirmwarePayload, HEADER_LEN, MAX_RESPONSE_PAYLOAD_LENGTH, MessageHeader,
    ProtocolError, RESPONSE_MAGIC, RequestType, Response, encode_firmware_request,
    encode_simple_request,
};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::debug;

/// 两条响应之间的最长间隔
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(15);

/// 进度条宽度（字符）
pub const PROGRESS_WIDTH: usize = 50;

/// 会话错误
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Failed to connect to fcp-server at {}: {source}", path.display())]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// 服务端返回的错误
    #[error("{0}")]
    Server(ErrorCode),

    #[error("Invalid error code: {0}")]
    UnknownErrorCode(i16),

    #[error("Operation timed out")]
    Timeout,

    #[error("fcp-server closed the connection")]
    Disconnected,

    #[error("{0} sections cannot be uploaded")]
    NotUploadable(FirmwareType),

    #[error("Invalid response: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// 渲染进度条：`#` 已完成，`>` 半格，`-` 光标，`.` 未完成
pub fn render_progress(percent: u8) -> String {
    let percent = percent.min(100) as usize;
    let filled = percent / 2;
    let half = percent % 2 == 1;
    let bar: String = (0..PROGRESS_WIDTH)
        .map(|i| match i.cmp(&filled) {
            std::cmp::Ordering::Less => '#',
            std::cmp::Ordering::Equal if half => '>',
            std::cmp::Ordering::Equal => '-',
            std::cmp::Ordering::Greater => '.',
        })
        .collect();
    format!("\r[{bar}] {percent:3}%")
}

/// 与一个 fcp-server 的连接
pub struct Session {
    stream: UnixStream,
    idle_timeout: Duration,
    showing_progress: bool,
}

impl Session {
    pub async fn connect(path: &Path) -> Result<Self, SessionError> {
        let stream = UnixStream::connect(path)
            .await
            .map_err(|source| SessionError::Connect {
                path: path.to_path_buf(),
                source,
            })?;
        debug!("Connected to {}", path.display());
        Ok(Self::from_stream(stream))
    }

    pub fn from_stream(stream: UnixStream) -> Self {
        Self {
            stream,
            idle_timeout: RESPONSE_TIMEOUT,
            showing_progress: false,
        }
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// 发送无负载请求并等待完成
    pub async fn send_simple(
        &mut self,
        request: RequestType,
        quiet: bool,
    ) -> Result<(), SessionError> {
        self.stream
            .write_all(&encode_simple_request(request))
            .await?;
        self.await_completion(quiet).await
    }

    /// 上传一个固件 section
    pub async fn send_firmware(&mut self, section: &FirmwareSection) -> Result<(), SessionError> {
        let request = match section.firmware_type {
            FirmwareType::App | FirmwareType::Leapfrog => RequestType::AppFirmwareUpdate,
            FirmwareType::Esp => RequestType::EspFirmwareUpdate,
            other => return Err(SessionError::NotUploadable(other)),
        };
        let payload = FirmwarePayload {
            usb_vid: section.usb_vid,
            usb_pid: section.usb_pid,
            sha256: section.sha256,
            md5: section.md5_or_zero(),
            data: &section.data,
        };
        self.stream
            .write_all(&encode_firmware_request(request, &payload))
            .await?;
        self.await_completion(false).await
    }

    /// 读取一条响应
    async fn read_response(&mut self) -> Result<Response, SessionError> {
        let mut header = [0u8; HEADER_LEN];
        read_exact_or_disconnect(&mut self.stream, &mut header).await?;
        let header = MessageHeader::decode(&header)?;
        if header.magic != RESPONSE_MAGIC {
            return Err(ProtocolError::InvalidMagic(header.magic).into());
        }
        if header.payload_length > MAX_RESPONSE_PAYLOAD_LENGTH {
            return Err(ProtocolError::PayloadTooLarge {
                length: header.payload_length,
                max: MAX_RESPONSE_PAYLOAD_LENGTH,
            }
            .into());
        }
        let mut payload = vec![0u8; header.payload_length as usize];
        read_exact_or_disconnect(&mut self.stream, &mut payload).await?;
        Ok(Response::decode(&header, &payload)?)
    }

    /// 读取响应直到终止帧
    async fn await_completion(&mut self, quiet: bool) -> Result<(), SessionError> {
        loop {
            let response = tokio::time::timeout(self.idle_timeout, self.read_response())
                .await
                .map_err(|_| SessionError::Timeout);
            let response = match response.and_then(|r| r) {
                Ok(response) => response,
                Err(e) => {
                    self.end_progress_line();
                    return Err(e);
                },
            };

            match response {
                Response::Progress(percent) => self.show_progress(percent),
                Response::Success => {
                    if self.showing_progress {
                        self.show_progress(100);
                        self.end_progress_line();
                    } else if !quiet {
                        println!("Done!");
                    }
                    return Ok(());
                },
                Response::Error(code) => {
                    self.end_progress_line();
                    return Err(match code {
                        Ok(code) => SessionError::Server(code),
                        Err(raw) => SessionError::UnknownErrorCode(raw),
                    });
                },
            }
        }
    }

    /// 等待服务端关闭连接（重启请求之后）
    pub async fn wait_for_disconnect(&mut self, within: Duration) -> Result<(), SessionError> {
        let mut buf = [0u8; 64];
        let wait = async {
            loop {
                match self.stream.read(&mut buf).await {
                    Ok(0) => return Ok(()),
                    Ok(_) => continue,
                    Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => return Ok(()),
                    Err(e) => return Err(SessionError::Io(e)),
                }
            }
        };
        tokio::time::timeout(within, wait)
            .await
            .map_err(|_| SessionError::Timeout)?
    }

    fn show_progress(&mut self, percent: u8) {
        self.showing_progress = true;
        print!("{}", render_progress(percent));
        let _ = std::io::stdout().flush();
    }

    fn end_progress_line(&mut self) {
        if self.showing_progress {
            println!();
            self.showing_progress = false;
        }
    }
}

async fn read_exact_or_disconnect(
    stream: &mut UnixStream,
    buf: &mut [u8],
) -> Result<(), SessionError> {
    match stream.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(SessionError::Disconnected),
        Err(e) => Err(SessionError::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fcp_firmware::FirmwareVersion;
    use fcp_protocol::{FrameAssembler, encode_error, encode_progress, encode_success};

    #[test]
    fn test_render_progress() {
        let zero = render_progress(0);
        assert_eq!(zero, format!("\r[-{}]   0%", ".".repeat(49)));

        let half = render_progress(51);
        assert_eq!(half, format!("\r[{}>{}]  51%", "#".repeat(25), ".".repeat(24)));

        let full = render_progress(100);
        assert_eq!(full, format!("\r[{}] 100%", "#".repeat(50)));
    }

    #[tokio::test]
    async fn test_progress_then_success() {
        let (client, mut server) = UnixStream::pair().unwrap();
        let mut session = Session::from_stream(client);

        let responder = tokio::spawn(async move {
            let mut buf = [0u8; HEADER_LEN];
            server.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf[1], RequestType::AppFirmwareErase as u8);
            for p in [0u8, 50, 100] {
                server.write_all(&encode_progress(p)).await.unwrap();
            }
            server.write_all(&encode_success()).await.unwrap();
            server
        });

        session
            .send_simple(RequestType::AppFirmwareErase, false)
            .await
            .unwrap();
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_error_frame() {
        let (client, mut server) = UnixStream::pair().unwrap();
        let mut session = Session::from_stream(client);

        let responder = tokio::spawn(async move {
            let mut buf = [0u8; HEADER_LEN];
            server.read_exact(&mut buf).await.unwrap();
            server
                .write_all(&encode_error(ErrorCode::InvalidUsbId))
                .await
                .unwrap();
            server
        });

        let err = session
            .send_simple(RequestType::ConfigErase, false)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Server(ErrorCode::InvalidUsbId)));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_idle_timeout() {
        let (client, _server) = UnixStream::pair().unwrap();
        let mut session = Session::from_stream(client).with_idle_timeout(Duration::from_millis(50));
        let err = session
            .send_simple(RequestType::Reboot, true)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Timeout));
    }

    #[tokio::test]
    async fn test_oversized_response_rejected() {
        let (client, mut server) = UnixStream::pair().unwrap();
        let mut session = Session::from_stream(client);

        let responder = tokio::spawn(async move {
            let mut buf = [0u8; HEADER_LEN];
            server.read_exact(&mut buf).await.unwrap();
            let header = MessageHeader {
                magic: RESPONSE_MAGIC,
                msg_type: 1,
                payload_length: u32::MAX,
            };
            server.write_all(&header.encode()).await.unwrap();
            server
        });

        let err = session
            .send_simple(RequestType::ConfigErase, false)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::Protocol(ProtocolError::PayloadTooLarge { length: u32::MAX, .. })
        ));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_request_magic_in_response_rejected() {
        let (client, mut server) = UnixStream::pair().unwrap();
        let mut session = Session::from_stream(client);

        let responder = tokio::spawn(async move {
            let mut buf = [0u8; HEADER_LEN];
            server.read_exact(&mut buf).await.unwrap();
            server
                .write_all(&encode_simple_request(RequestType::Reboot))
                .await
                .unwrap();
            server
        });

        let err = session
            .send_simple(RequestType::ConfigErase, false)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Protocol(ProtocolError::InvalidMagic(_))));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_server_disconnect() {
        let (client, server) = UnixStream::pair().unwrap();
        let mut session = Session::from_stream(client);
        drop(server);
        assert!(session.wait_for_disconnect(Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_firmware_upload_frame() {
        let (client, mut server) = UnixStream::pair().unwrap();
        let mut session = Session::from_stream(client);
        let section = FirmwareSection::new(
            FirmwareType::Esp,
            0x1235,
            0x821d,
            FirmwareVersion([1, 0, 200, 0]),
            vec![0x5A; 3000],
        );
        let expected_md5 = section.md5_or_zero();

        let responder = tokio::spawn(async move {
            let mut assembler = FrameAssembler::default();
            let mut buf = vec![0u8; 4096];
            let request = loop {
                let n = server.read(&mut buf).await.unwrap();
                assembler.extend(&buf[..n]);
                if let Some(request) = assembler.next_request().unwrap() {
                    break request;
                }
            };
            server.write_all(&encode_success()).await.unwrap();
            request
        });

        session.send_firmware(&section).await.unwrap();
        let request = responder.await.unwrap();
        assert_eq!(request.request_type().unwrap(), RequestType::EspFirmwareUpdate);
        let payload = FirmwarePayload::decode(&request.payload).unwrap();
        assert_eq!(payload.usb_pid, 0x821d);
        assert_eq!(payload.md5, expected_md5);
        assert_eq!(payload.data.len(), 3000);
    }

    #[tokio::test]
    async fn test_container_not_uploadable() {
        let (client, _server) = UnixStream::pair().unwrap();
        let mut session = Session::from_stream(client);
        let section = FirmwareSection::new(
            FirmwareType::Container,
            0x1235,
            0x821d,
            FirmwareVersion::default(),
            Vec::new(),
        );
        assert!(matches!(
            session.send_firmware(&section).await,
            Err(SessionError::NotUploadable(FirmwareType::Container))
        ));
    }
}
