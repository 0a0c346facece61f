//! 声卡信息（procfs）

use std::io;
use std::path::{Path, PathBuf};

/// procfs 中的 ALSA 目录
pub const PROC_ASOUND: &str = "/proc/asound";

/// USB 厂商/产品 ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UsbId {
    pub vid: u16,
    pub pid: u16,
}

impl UsbId {
    /// 解析 `vvvv:pppp`（十六进制）
    pub fn parse(text: &str) -> Option<Self> {
        let (vid, pid) = text.trim().split_once(':')?;
        Some(Self {
            vid: u16::from_str_radix(vid, 16).ok()?,
            pid: u16::from_str_radix(pid, 16).ok()?,
        })
    }
}

impl std::fmt::Display for UsbId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vid, self.pid)
    }
}

/// `{root}/card{N}`
pub fn card_dir(root: &Path, card: u32) -> PathBuf {
    root.join(format!("card{card}"))
}

fn invalid(path: &Path, text: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("cannot parse {:?} in {}", text.trim(), path.display()),
    )
}

/// 读取 `{root}/card{N}/usbid`
pub fn read_usb_id(root: &Path, card: u32) -> io::Result<UsbId> {
    let path = card_dir(root, card).join("usbid");
    let text = std::fs::read_to_string(&path)?;
    UsbId::parse(&text).ok_or_else(|| invalid(&path, &text))
}

/// 读取 `{root}/card{N}/usbbus`（`bus/dev`，十进制）
pub fn read_usb_bus(root: &Path, card: u32) -> io::Result<(u32, u32)> {
    let path = card_dir(root, card).join("usbbus");
    let text = std::fs::read_to_string(&path)?;
    text.trim()
        .split_once('/')
        .and_then(|(bus, dev)| Some((bus.parse().ok()?, dev.parse().ok()?)))
        .ok_or_else(|| invalid(&path, &text))
}

/// 列出 `{root}` 下所有 `cardN` 编号（升序）
pub fn list_cards(root: &Path) -> io::Result<Vec<u32>> {
    let mut cards: Vec<u32> = std::fs::read_dir(root)?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            entry
                .file_name()
                .to_str()?
                .strip_prefix("card")?
                .parse()
                .ok()
        })
        .collect();
    cards.sort_unstable();
    Ok(cards)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_usb_id() {
        assert_eq!(
            UsbId::parse("1235:821d\n"),
            Some(UsbId {
                vid: 0x1235,
                pid: 0x821d
            })
        );
        assert_eq!(UsbId::parse("1235-821d"), None);
        assert_eq!(UsbId::parse("12345:1"), None);
        assert_eq!(UsbId { vid: 0x1235, pid: 0x1 }.to_string(), "1235:0001");
    }

    #[test]
    fn test_read_proc_files() {
        let root = tempfile::tempdir().unwrap();
        let card = root.path().join("card2");
        std::fs::create_dir(&card).unwrap();
        std::fs::create_dir(root.path().join("cards")).unwrap();
        std::fs::create_dir(root.path().join("card0")).unwrap();
        std::fs::write(card.join("usbid"), "1235:821c\n").unwrap();
        std::fs::write(card.join("usbbus"), "003/012\n").unwrap();

        assert_eq!(read_usb_id(root.path(), 2).unwrap().pid, 0x821c);
        assert_eq!(read_usb_bus(root.path(), 2).unwrap(), (3, 12));
        assert!(read_usb_id(root.path(), 0).is_err());
        assert_eq!(list_cards(root.path()).unwrap(), vec![0, 2]);
    }
}
