//! 支持的设备列表

/// Focusrite USB 厂商 ID
pub const VENDOR_VID: u16 = 0x1235;

/// 支持的设备
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupportedDevice {
    pub pid: u16,
    pub name: &'static str,
}

/// 支持的设备（顺序即列表和固件排序顺序）
pub const SUPPORTED_DEVICES: &[SupportedDevice] = &[
    SupportedDevice {
        pid: 0x821b,
        name: "Scarlett 4th Gen 16i16",
    },
    SupportedDevice {
        pid: 0x821c,
        name: "Scarlett 4th Gen 18i16",
    },
    SupportedDevice {
        pid: 0x821d,
        name: "Scarlett 4th Gen 18i20",
    },
];

pub fn supported_device(pid: u16) -> Option<&'static SupportedDevice> {
    SUPPORTED_DEVICES.iter().find(|d| d.pid == pid)
}

/// 固件排序使用的 pid 顺序
pub fn device_order() -> Vec<u16> {
    SUPPORTED_DEVICES.iter().map(|d| d.pid).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supported_device_lookup() {
        assert_eq!(supported_device(0x821c).unwrap().name, "Scarlett 4th Gen 18i16");
        assert!(supported_device(0x8215).is_none());
        assert_eq!(device_order(), vec![0x821b, 0x821c, 0x821d]);
    }
}
