//! 请求处理
//!
//! 所有请求共享一个 [`ServerContext`]：设备、USB ID、segment 目录缓存和
//! ESP DFU 配置。每个请求同步执行到结束，进度通过 [`ProgressSink`] 发出。

use crate::error::RequestError;
use fcp_driver::{
    DfuTimings, DirectoryError, EspDfuConfig, FcpDevice, FlashDirectory, FlashTimings,
    ProgressSink, Transport, UsbId, erase_segment, update_app_firmware, update_esp_firmware,
};
use fcp_protocol::{FirmwarePayload, RawRequest, RequestType};
use tracing::{debug, info};

/// 服务端上下文（单一执行者，无需加锁）
pub struct ServerContext<T: Transport> {
    pub device: FcpDevice<T>,
    pub usb_id: UsbId,
    pub firmware_build: u32,
    directory: Option<FlashDirectory>,
    pub esp_config: Option<EspDfuConfig>,
    pub flash_timings: FlashTimings,
    pub dfu_timings: DfuTimings,
}

impl<T: Transport> ServerContext<T> {
    pub fn new(device: FcpDevice<T>, usb_id: UsbId, firmware_build: u32) -> Self {
        Self {
            device,
            usb_id,
            firmware_build,
            directory: None,
            esp_config: None,
            flash_timings: FlashTimings::default(),
            dfu_timings: DfuTimings::default(),
        }
    }

    /// segment 目录（首次成功读取后缓存）
    pub fn directory(&mut self) -> Result<FlashDirectory, DirectoryError> {
        if let Some(directory) = self.directory {
            return Ok(directory);
        }
        let directory = FlashDirectory::discover(&mut self.device)?;
        self.directory = Some(directory);
        Ok(directory)
    }
}

/// 处理一条完整请求；成功时返回请求类型
pub fn dispatch<T, P>(
    ctx: &mut ServerContext<T>,
    request: &RawRequest,
    sink: &mut P,
) -> Result<RequestType, RequestError>
where
    T: Transport,
    P: ProgressSink + ?Sized,
{
    let request_type = request.request_type()?;
    info!("Handling {:?} request ({} byte payload)", request_type, request.payload.len());

    match request_type {
        RequestType::Reboot => {
            ctx.device
                .reboot()
                .map_err(fcp_driver::DriverError::Write)?;
        },
        RequestType::ConfigErase => {
            let directory = ctx.directory()?;
            erase_segment(&mut ctx.device, directory.settings, &ctx.flash_timings, sink)?;
        },
        RequestType::AppFirmwareErase => {
            let directory = ctx.directory()?;
            erase_segment(&mut ctx.device, directory.upgrade, &ctx.flash_timings, sink)?;
        },
        RequestType::AppFirmwareUpdate => {
            let directory = ctx.directory()?;
            let payload = FirmwarePayload::decode(&request.payload)?;
            update_app_firmware(
                &mut ctx.device,
                &directory,
                &payload,
                (ctx.usb_id.vid, ctx.usb_id.pid),
                sink,
            )?;
        },
        RequestType::EspFirmwareUpdate => {
            let payload = FirmwarePayload::decode(&request.payload)?;
            update_esp_firmware(
                &mut ctx.device,
                ctx.esp_config.as_ref(),
                (ctx.usb_id.vid, ctx.usb_id.pid),
                &payload,
                &ctx.dfu_timings,
                sink,
            )?;
        },
    }

    debug!("{:?} request complete", request_type);
    Ok(request_type)
}
