//! # FCP Driver
//!
//! FCP 设备驱动层：命令传输、flash 更新编排和 ESP DFU 状态机
//!
//! ## 模块
//!
//! - `transport`: 命令传输 trait
//! - `hwdep`: ALSA hwdep 传输（Linux）
//! - `device`: 类型化设备客户端
//! - `flash`: flash segment 目录、擦除、写入
//! - `esp_dfu`: ESP 协处理器 DFU
//! - `devmap`: 设备映射表加载
//! - `card`: procfs 声卡信息
//! - `progress`: 进度上报
//! - `mock`: 模拟设备（需要 `mock` feature）
//!
//! ## 示例
//!
//! ```no_run
//! # #[cfg(target_os = "linux")]
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use fcp_driver::{FcpDevice, FlashDirectory, HwdepTransport};
//!
//! let mut device = FcpDevice::new(HwdepTransport::open(1)?);
//! let directory = FlashDirectory::discover(&mut device)?;
//! println!("App_Upgrade is segment {}", directory.upgrade.index);
//! # Ok(())
//! # }
//! # #[cfg(not(target_os = "linux"))]
//! # fn main() {}
//! ```

pub mod card;
pub mod devmap;
pub mod device;
pub mod error;
pub mod esp_dfu;
pub mod flash;
pub mod progress;
pub mod transport;

#[cfg(target_os = "linux")]
pub mod hwdep;

#[cfg(feature = "mock")]
pub mod mock;

pub use card::UsbId;
pub use devmap::{DevmapError, load_devmap};
pub use device::FcpDevice;
pub use error::{DfuError, DirectoryError, DriverError, TransportError};
pub use esp_dfu::{DfuTimings, EspDfuConfig, update_esp_firmware};
pub use flash::{
    FlashDirectory, FlashTimings, Segment, SegmentRole, erase_segment, update_app_firmware,
    write_segment,
};
pub use progress::{NoProgress, ProgressSink, ProgressTracker};
pub use transport::Transport;

#[cfg(target_os = "linux")]
pub use hwdep::HwdepTransport;

#[cfg(feature = "mock")]
pub use mock::MockDevice;
