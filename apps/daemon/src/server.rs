//! 控制 socket 服务端
//!
//! 单线程 poll 循环，同时等待三类事件：
//!
//! - 监听 socket：没有客户端时接受连接，已有客户端时接受后立即关闭
//! - 当前客户端：读取数据、重组请求、同步执行并回写响应
//! - 设备通知：空闲时读出并交给 [`ControlSync`]
//!
//! 长时间操作期间主循环不运行，由 [`ClientProgress::tick`] 排空监听队列，
//! 保证多余的连接不会一直挂起。

use crate::config::ServerConfig;
use crate::connection::{Connection, ReadOutcome, send_frame};
use crate::control_sync::ControlSync;
use crate::error::ServerError;
use crate::handlers::{ServerContext, dispatch};
use crate::status;
use fcp_driver::{ProgressSink, Transport};
use fcp_protocol::status::ServerStatus;
use fcp_protocol::{RawRequest, RequestType, encode_error, encode_progress, encode_success};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::io;
use std::os::fd::AsFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// 控制 socket 服务端
pub struct Server<T: Transport> {
    ctx: ServerContext<T>,
    control: Box<dyn ControlSync>,
    listener: UnixListener,
    client: Option<Connection>,
    card: u32,
    socket_path: PathBuf,
    status_path: PathBuf,
}

impl<T: Transport> Server<T> {
    /// 绑定控制 socket（先删除残留的 socket 文件）
    pub fn bind(
        ctx: ServerContext<T>,
        config: &ServerConfig,
        control: Box<dyn ControlSync>,
    ) -> Result<Self, ServerError> {
        let socket_path = config.socket_path();
        let to_socket_error = |source: io::Error| ServerError::Socket {
            path: socket_path.clone(),
            source,
        };

        match std::fs::remove_file(&socket_path) {
            Ok(()) => debug!("Removed stale socket {}", socket_path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {},
            Err(e) => return Err(to_socket_error(e)),
        }

        let listener = UnixListener::bind(&socket_path).map_err(to_socket_error)?;
        listener.set_nonblocking(true).map_err(to_socket_error)?;
        info!("Listening on {}", socket_path.display());

        Ok(Self {
            ctx,
            control,
            listener,
            client: None,
            card: config.card,
            socket_path,
            status_path: config.status_path(),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn has_client(&self) -> bool {
        self.client.is_some()
    }

    /// 当前状态记录
    pub fn status(&self) -> ServerStatus {
        let (firmware_version, esp_firmware_version) = self.control.firmware_versions();
        ServerStatus {
            socket_path: self.socket_path.display().to_string(),
            card: self.card,
            usb_vid: self.ctx.usb_id.vid,
            usb_pid: self.ctx.usb_id.pid,
            firmware_build: self.ctx.firmware_build,
            firmware_version,
            esp_firmware_version,
        }
    }

    /// 写入状态记录
    pub fn publish_status(&self) -> Result<(), ServerError> {
        status::publish(&self.status_path, &self.status())
    }

    /// 主循环（只在 poll 或设备出错时返回）
    pub fn run(&mut self) -> Result<(), ServerError> {
        loop {
            self.poll_once(PollTimeout::NONE)?;
        }
    }

    /// 等待并处理一轮事件
    pub fn poll_once(&mut self, timeout: PollTimeout) -> Result<(), ServerError> {
        let (listener_ready, client_ready, notify_ready) = {
            let mut fds = vec![PollFd::new(self.listener.as_fd(), PollFlags::POLLIN)];
            let client_index = self.client.as_ref().map(|client| {
                fds.push(PollFd::new(client.as_fd(), PollFlags::POLLIN));
                fds.len() - 1
            });
            let notify_index = self.ctx.device.transport().notification_fd().map(|fd| {
                fds.push(PollFd::new(fd, PollFlags::POLLIN));
                fds.len() - 1
            });

            match poll(&mut fds, timeout) {
                Ok(_) => {},
                Err(Errno::EINTR) => return Ok(()),
                Err(e) => return Err(ServerError::Poll(e)),
            }

            let ready = |index: Option<usize>| {
                index
                    .and_then(|i| fds[i].revents())
                    .is_some_and(|r| {
                        r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR)
                    })
            };
            (ready(Some(0)), ready(client_index), ready(notify_index))
        };

        if notify_ready {
            self.handle_notification()?;
        }
        if client_ready {
            self.service_client();
        }
        if listener_ready {
            self.accept_clients();
        }
        Ok(())
    }

    // ========================================================================
    // Events
    // ========================================================================

    fn handle_notification(&mut self) -> Result<(), ServerError> {
        if let Some(bits) = self.ctx.device.read_notification(Duration::ZERO)? {
            self.control.on_notification(bits);
        }
        Ok(())
    }

    fn accept_clients(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    if self.client.is_some() {
                        reject(stream);
                        continue;
                    }
                    match Connection::new(stream) {
                        Ok(conn) => {
                            info!("Client connected");
                            self.client = Some(conn);
                        },
                        Err(e) => warn!("Cannot set up client connection: {}", e),
                    }
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    break;
                },
            }
        }
    }

    fn service_client(&mut self) {
        let Some(conn) = self.client.as_mut() else {
            return;
        };
        match conn.read_available() {
            Ok(ReadOutcome::Data(_)) => {},
            Ok(ReadOutcome::Closed) => {
                info!("Client disconnected");
                self.client = None;
                return;
            },
            Err(e) => {
                warn!("Client read error: {}", e);
                self.client = None;
                return;
            },
        }

        loop {
            let Some(conn) = self.client.as_mut() else {
                break;
            };
            let request = match conn.next_request() {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(e) => {
                    // 负载由重组器丢弃，连接保留
                    warn!("Invalid request: {}", e);
                    send_frame(conn.stream_mut(), &encode_error(e.error_code()));
                    continue;
                },
            };
            if !self.handle_request(&request) {
                info!("Closing client connection");
                self.client = None;
            }
        }
    }

    /// 执行一条请求并回写终止帧；返回是否保留连接
    fn handle_request(&mut self, request: &RawRequest) -> bool {
        let Some(conn) = self.client.as_mut() else {
            return false;
        };

        let result = {
            let mut sink = ClientProgress {
                stream: conn.stream_mut(),
                listener: &self.listener,
            };
            dispatch(&mut self.ctx, request, &mut sink)
        };

        let stream = conn.stream_mut();
        match result {
            Ok(RequestType::Reboot) => {
                send_frame(stream, &encode_success());
                false
            },
            Ok(_) => {
                send_frame(stream, &encode_success());
                self.control.resync();
                true
            },
            Err(e) => {
                warn!("Request failed: {} ({})", e, e.code());
                send_frame(stream, &encode_error(e.code()));
                true
            },
        }
    }
}

impl<T: Transport> Drop for Server<T> {
    fn drop(&mut self) {
        status::remove(&self.status_path);
        status::remove(&self.socket_path);
    }
}

// ============================================================================
// Progress
// ============================================================================

/// 把进度帧写给当前客户端，并在让出点拒绝排队的连接
struct ClientProgress<'a> {
    stream: &'a mut UnixStream,
    listener: &'a UnixListener,
}

impl ProgressSink for ClientProgress<'_> {
    fn progress(&mut self, percent: u8) {
        send_frame(self.stream, &encode_progress(percent));
    }

    fn tick(&mut self) {
        reject_pending(self.listener);
    }
}

fn reject(stream: UnixStream) {
    info!("Rejected additional client connection");
    drop(stream);
}

/// 接受并关闭所有排队中的连接
fn reject_pending(listener: &UnixListener) {
    loop {
        match listener.accept() {
            Ok((stream, _)) => reject(stream),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("accept failed: {}", e);
                break;
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_sync::LoggingControlSync;
    use fcp_driver::{EspDfuConfig, FcpDevice, FlashTimings, MockDevice, UsbId};
    use fcp_protocol::{
        ErrorCode, FirmwarePayload, HEADER_LEN, MessageHeader, Response, encode_firmware_request,
        encode_simple_request,
    };
    use serde_json::json;
    use sha2::{Digest, Sha256};
    use std::cell::Cell;
    use std::io::{Read, Write};
    use std::rc::Rc;

    const VID: u16 = 0x1235;
    const PID: u16 = 0x821d;

    fn poll_timeout() -> PollTimeout {
        PollTimeout::from(1000u16)
    }

    fn server(mock: &MockDevice, dir: &Path) -> Server<MockDevice> {
        let mut ctx = ServerContext::new(FcpDevice::new(mock.clone()), UsbId { vid: VID, pid: PID }, 2115);
        ctx.flash_timings = FlashTimings {
            erase_poll_interval: Duration::ZERO,
            erase_timeout: Duration::from_secs(5),
        };
        let config = ServerConfig {
            card: 1,
            socket_dir: dir.to_path_buf(),
            devmap_path: None,
            lock_file: None,
        };
        Server::bind(ctx, &config, Box::new(LoggingControlSync::default())).unwrap()
    }

    fn connect(server: &Server<MockDevice>) -> UnixStream {
        let stream = UnixStream::connect(server.socket_path()).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        stream
    }

    /// 读取响应直到终止帧（success / error）或连接关闭
    fn read_responses(stream: &mut UnixStream) -> Vec<Response> {
        let mut responses = Vec::new();
        loop {
            let mut header = [0u8; HEADER_LEN];
            if stream.read_exact(&mut header).is_err() {
                break;
            }
            let header = MessageHeader::decode(&header).unwrap();
            let mut payload = vec![0u8; header.payload_length as usize];
            stream.read_exact(&mut payload).unwrap();
            let response = Response::decode(&header, &payload).unwrap();
            responses.push(response);
            if !matches!(response, Response::Progress(_)) {
                break;
            }
        }
        responses
    }

    fn assert_closed(stream: &mut UnixStream) {
        let mut buf = [0u8; 1];
        assert_eq!(stream.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_bind_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fcp-1.sock");
        std::fs::write(&path, b"stale").unwrap();

        let server = server(&MockDevice::scarlett(), dir.path());
        assert!(UnixStream::connect(server.socket_path()).is_ok());

        drop(server);
        assert!(!path.exists());
    }

    #[test]
    fn test_status_record() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(&MockDevice::scarlett(), dir.path());
        server.publish_status().unwrap();

        let path = dir.path().join("fcp-1.json");
        let status: ServerStatus = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(status.card, 1);
        assert_eq!(status.usb_pid, PID);
        assert_eq!(status.firmware_build, 2115);
        assert!(status.socket_path.ends_with("fcp-1.sock"));

        drop(server);
        assert!(!path.exists());
    }

    #[test]
    fn test_extra_clients_rejected_during_erase() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockDevice::scarlett();
        mock.set_erase_script([0, 10, 20, 30, 40, 50]);
        let mut server = server(&mock, dir.path());

        let mut a = connect(&server);
        server.poll_once(poll_timeout()).unwrap();
        assert!(server.has_client());

        a.write_all(&encode_simple_request(RequestType::AppFirmwareErase))
            .unwrap();
        let mut b = connect(&server);
        let mut c = connect(&server);
        server.poll_once(poll_timeout()).unwrap();

        let responses = read_responses(&mut a);
        assert_eq!(responses.last(), Some(&Response::Success));
        assert!(responses[..responses.len() - 1]
            .iter()
            .all(|r| matches!(r, Response::Progress(_))));
        assert_eq!(mock.segment(1).unwrap().erase_count, 1);

        assert_closed(&mut b);
        assert_closed(&mut c);
        assert!(server.has_client());
    }

    #[test]
    fn test_stalled_erase_reports_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockDevice::scarlett();
        mock.stall_erase_at(10);
        let mut server = server(&mock, dir.path());
        server.ctx.flash_timings.erase_timeout = Duration::from_millis(50);

        let mut a = connect(&server);
        server.poll_once(poll_timeout()).unwrap();
        a.write_all(&encode_simple_request(RequestType::AppFirmwareErase))
            .unwrap();
        server.poll_once(poll_timeout()).unwrap();

        let responses = read_responses(&mut a);
        assert_eq!(responses.last(), Some(&Response::Error(Ok(ErrorCode::Timeout))));
        assert!(server.has_client());
    }

    #[test]
    fn test_request_split_across_reads() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockDevice::scarlett();
        let mut server = server(&mock, dir.path());

        let mut a = connect(&server);
        server.poll_once(poll_timeout()).unwrap();

        let frame = encode_simple_request(RequestType::ConfigErase);
        a.write_all(&frame[..3]).unwrap();
        server.poll_once(poll_timeout()).unwrap();
        assert_eq!(mock.segment(2).unwrap().erase_count, 0);

        a.write_all(&frame[3..]).unwrap();
        server.poll_once(poll_timeout()).unwrap();
        assert_eq!(read_responses(&mut a).last(), Some(&Response::Success));
        assert_eq!(mock.segment(2).unwrap().erase_count, 1);
    }

    #[test]
    fn test_unknown_type_keeps_connection() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockDevice::scarlett();
        let mut server = server(&mock, dir.path());

        let mut a = connect(&server);
        server.poll_once(poll_timeout()).unwrap();

        a.write_all(&[0x53, 0x7F, 0, 0, 0, 0]).unwrap();
        server.poll_once(poll_timeout()).unwrap();
        assert_eq!(
            read_responses(&mut a),
            vec![Response::Error(Ok(ErrorCode::InvalidCommand))]
        );
        assert!(server.has_client());

        a.write_all(&encode_simple_request(RequestType::Reboot))
            .unwrap();
        server.poll_once(poll_timeout()).unwrap();
        assert_eq!(read_responses(&mut a), vec![Response::Success]);
        assert_eq!(mock.reboots(), 1);

        // 重启后连接关闭
        assert!(!server.has_client());
        assert_closed(&mut a);
    }

    #[test]
    fn test_bad_magic_keeps_connection() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockDevice::scarlett();
        let mut server = server(&mock, dir.path());

        let mut a = connect(&server);
        server.poll_once(poll_timeout()).unwrap();

        a.write_all(&[0x99, 0x01, 2, 0, 0, 0, 0xEE, 0xEE]).unwrap();
        server.poll_once(poll_timeout()).unwrap();
        assert_eq!(
            read_responses(&mut a),
            vec![Response::Error(Ok(ErrorCode::InvalidMagic))]
        );
        assert!(server.has_client());

        // 负载已丢弃，下一条请求照常处理
        a.write_all(&encode_simple_request(RequestType::Reboot)).unwrap();
        server.poll_once(poll_timeout()).unwrap();
        assert_eq!(read_responses(&mut a), vec![Response::Success]);
        assert_eq!(mock.reboots(), 1);
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = server(&MockDevice::scarlett(), dir.path());

        let mut a = connect(&server);
        server.poll_once(poll_timeout()).unwrap();

        let header = MessageHeader::request(RequestType::AppFirmwareUpdate, u32::MAX);
        a.write_all(&header.encode()).unwrap();
        server.poll_once(poll_timeout()).unwrap();
        assert_eq!(
            read_responses(&mut a),
            vec![Response::Error(Ok(ErrorCode::InvalidLength))]
        );
        assert!(server.has_client());

        drop(a);
        server.poll_once(poll_timeout()).unwrap();
        assert!(!server.has_client());
    }

    #[test]
    fn test_client_disconnect_frees_slot() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = server(&MockDevice::scarlett(), dir.path());

        let a = connect(&server);
        server.poll_once(poll_timeout()).unwrap();
        assert!(server.has_client());

        drop(a);
        server.poll_once(poll_timeout()).unwrap();
        assert!(!server.has_client());
    }

    #[test]
    fn test_esp_update_usb_id_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockDevice::scarlett();
        let mut server = server(&mock, dir.path());
        server.ctx.esp_config = Some(
            EspDfuConfig::from_devmap(&json!({
                "enums": {
                    "eSuperState": {"enumerators": {"eSuperOff": 1, "eSuperDFU": 2, "eSuperNormal": 3}},
                    "eDFU_NOTIFICATION": {"enumerators": {"eClear": 0, "eNextblock": 1, "eFinish": 2, "eError": 3}},
                    "eDEV_FCP_NOTIFY_MESSAGE_TYPE": {"enumerators": {"FCP_NOTIFY_DFU_CHANGE": 0x0010_0000}}
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
            }))
            .unwrap(),
        );

        let data = vec![0xA5u8; 2048];
        let payload = FirmwarePayload {
            usb_vid: VID,
            usb_pid: 0x821c,
            sha256: Sha256::digest(&data).into(),
            md5: [0; 16],
            data: &data,
        };

        let mut a = connect(&server);
        server.poll_once(poll_timeout()).unwrap();
        a.write_all(&encode_firmware_request(RequestType::EspFirmwareUpdate, &payload))
            .unwrap();
        server.poll_once(poll_timeout()).unwrap();
        let responses = read_responses(&mut a);
        assert_eq!(responses, vec![Response::Error(Ok(ErrorCode::InvalidUsbId))]);
        assert_eq!(mock.device_write_count(), 0);
    }

    #[test]
    fn test_resync_after_successful_write() {
        struct Counting(Rc<Cell<u32>>);
        impl ControlSync for Counting {
            fn on_notification(&mut self, _bits: u32) {}
            fn resync(&mut self) {
                self.0.set(self.0.get() + 1);
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let mock = MockDevice::scarlett();
        let resyncs = Rc::new(Cell::new(0));
        let mut server = server(&mock, dir.path());
        server.control = Box::new(Counting(resyncs.clone()));

        let mut a = connect(&server);
        server.poll_once(poll_timeout()).unwrap();
        a.write_all(&encode_simple_request(RequestType::ConfigErase))
            .unwrap();
        server.poll_once(poll_timeout()).unwrap();
        assert_eq!(read_responses(&mut a).last(), Some(&Response::Success));
        assert_eq!(resyncs.get(), 1);

        // 失败的请求不触发同步
        a.write_all(&[0x53, 0x7F, 0, 0, 0, 0]).unwrap();
        server.poll_once(poll_timeout()).unwrap();
        read_responses(&mut a);
        assert_eq!(resyncs.get(), 1);
    }
}
