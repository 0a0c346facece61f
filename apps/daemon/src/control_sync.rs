//! 控制状态同步接口
//!
//! 设备通知和写操作完成后需要刷新的控制状态（混音、路由、电平等）由
//! [`ControlSync`] 的实现负责；内置实现只记录日志。

use tracing::{debug, info};

/// 控制状态协作者
pub trait ControlSync {
    /// 主循环空闲时读到的每条设备通知
    fn on_notification(&mut self, bits: u32);

    /// 写设备的请求成功完成后调用
    fn resync(&mut self);

    /// 已知的 App / ESP 固件版本
    fn firmware_versions(&self) -> (Option<[u32; 4]>, Option<[u32; 4]>) {
        (None, None)
    }
}

/// 只记录日志的实现
#[derive(Debug, Default)]
pub struct LoggingControlSync {
    notifications: u64,
    resyncs: u64,
}

impl LoggingControlSync {
    pub fn notifications(&self) -> u64 {
        self.notifications
    }

    pub fn resyncs(&self) -> u64 {
        self.resyncs
    }
}

impl ControlSync for LoggingControlSync {
    fn on_notification(&mut self, bits: u32) {
        self.notifications += 1;
        debug!("Device notification 0x{:08x}", bits);
    }

    fn resync(&mut self) {
        self.resyncs += 1;
        info!("Device state changed, controls resynchronised");
    }
}
