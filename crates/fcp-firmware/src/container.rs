//! 固件容器编解码
//!
//! 磁盘格式（大端）：
//!
//! ```text
//! 容器:    "SCARLBOX" | u16 vid | u16 pid | u32 version[4] | u32 num_sections | section...
//! section: magic(8)   | u16 vid | u16 pid | u32 version[4] | u32 length | sha256[32] | data
//! ```
//!
//! 单独的 section 文件（不带容器头）会被包装成只有一个 section 的容器。

use crate::FirmwareError;
use md5::Md5;
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::Read;
use std::path::Path;
use tracing::{debug, warn};

// ============================================================================
// Layout Constants
// ============================================================================

/// 魔数长度
pub const MAGIC_LEN: usize = 8;

/// 容器头长度（不含魔数）
pub const CONTAINER_HEADER_LEN: usize = 2 + 2 + 16 + 4;

/// section 头长度（不含魔数）
pub const SECTION_HEADER_LEN: usize = 2 + 2 + 16 + 4 + 32;

/// 容器允许的最大 section 数量
pub const MAX_SECTIONS: u32 = 3;

// ============================================================================
// Firmware Type
// ============================================================================

/// 固件类型（由 8 字节魔数区分）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FirmwareType {
    Container,
    App,
    Esp,
    Leapfrog,
}

impl FirmwareType {
    pub const ALL: [FirmwareType; 4] = [
        FirmwareType::Container,
        FirmwareType::App,
        FirmwareType::Esp,
        FirmwareType::Leapfrog,
    ];

    pub fn magic(self) -> &'static [u8; MAGIC_LEN] {
        match self {
            FirmwareType::Container => b"SCARLBOX",
            FirmwareType::App => b"SCARLET4",
            FirmwareType::Esp => b"SCARLESP",
            FirmwareType::Leapfrog => b"SCARLEAP",
        }
    }

    pub fn from_magic(magic: &[u8]) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.magic() == magic)
    }

    pub fn name(self) -> &'static str {
        match self {
            FirmwareType::Container => "container",
            FirmwareType::App => "App",
            FirmwareType::Esp => "ESP",
            FirmwareType::Leapfrog => "Leapfrog",
        }
    }
}

impl fmt::Display for FirmwareType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Firmware Version
// ============================================================================

/// 4 字固件版本，按字典序比较
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FirmwareVersion(pub [u32; 4]);

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.0;
        write!(f, "{a}.{b}.{c}.{d}")
    }
}

impl From<[u32; 4]> for FirmwareVersion {
    fn from(words: [u32; 4]) -> Self {
        Self(words)
    }
}

// ============================================================================
// Section / Container
// ============================================================================

/// 固件 section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareSection {
    pub firmware_type: FirmwareType,
    pub usb_vid: u16,
    pub usb_pid: u16,
    pub version: FirmwareVersion,
    pub length: u32,
    pub sha256: [u8; 32],
    /// ESP section 额外计算的 md5（DFU 启动握手需要）
    pub md5: Option<[u8; 16]>,
    /// 固件数据；只读取头部时为空
    pub data: Vec<u8>,
}

impl FirmwareSection {
    /// 由数据构造 section，计算 sha256（ESP 额外计算 md5）
    pub fn new(
        firmware_type: FirmwareType,
        usb_vid: u16,
        usb_pid: u16,
        version: FirmwareVersion,
        data: Vec<u8>,
    ) -> Self {
        let sha256: [u8; 32] = Sha256::digest(&data).into();
        let md5 = (firmware_type == FirmwareType::Esp).then(|| Md5::digest(&data).into());
        Self {
            firmware_type,
            usb_vid,
            usb_pid,
            version,
            length: data.len() as u32,
            sha256,
            md5,
            data,
        }
    }

    /// 重新计算 sha256 并与头部记录的摘要比较
    pub fn verify(&self) -> bool {
        let computed: [u8; 32] = Sha256::digest(&self.data).into();
        computed == self.sha256
    }

    /// 上传负载中的 md5 字段（非 ESP section 为全零）
    pub fn md5_or_zero(&self) -> [u8; 16] {
        self.md5.unwrap_or_default()
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.firmware_type.magic());
        buf.extend_from_slice(&self.usb_vid.to_be_bytes());
        buf.extend_from_slice(&self.usb_pid.to_be_bytes());
        for word in self.version.0 {
            buf.extend_from_slice(&word.to_be_bytes());
        }
        buf.extend_from_slice(&self.length.to_be_bytes());
        buf.extend_from_slice(&self.sha256);
        buf.extend_from_slice(&self.data);
    }
}

/// 固件容器
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareContainer {
    pub usb_vid: u16,
    pub usb_pid: u16,
    pub version: FirmwareVersion,
    pub num_sections: u32,
    /// 完整读取时包含全部 section；只读取容器头时为空
    pub sections: Vec<FirmwareSection>,
}

impl FirmwareContainer {
    /// 由 section 列表构造容器
    pub fn new(
        usb_vid: u16,
        usb_pid: u16,
        version: FirmwareVersion,
        sections: Vec<FirmwareSection>,
    ) -> Self {
        Self {
            usb_vid,
            usb_pid,
            version,
            num_sections: sections.len() as u32,
            sections,
        }
    }

    /// 查找指定类型的 section
    pub fn section(&self, firmware_type: FirmwareType) -> Option<&FirmwareSection> {
        self.sections.iter().find(|s| s.firmware_type == firmware_type)
    }

    /// 解码完整固件（校验长度和 sha256）
    pub fn decode(bytes: &[u8]) -> Result<Self, FirmwareError> {
        Self::decode_inner(bytes, true)
    }

    /// 只解码头部（不读取数据，不校验摘要）
    pub fn decode_header(bytes: &[u8]) -> Result<Self, FirmwareError> {
        Self::decode_inner(bytes, false)
    }

    /// 编码为容器格式
    pub fn encode(&self) -> Vec<u8> {
        let data_len: usize = self
            .sections
            .iter()
            .map(|s| MAGIC_LEN + SECTION_HEADER_LEN + s.data.len())
            .sum();
        let mut buf = Vec::with_capacity(MAGIC_LEN + CONTAINER_HEADER_LEN + data_len);

        buf.extend_from_slice(FirmwareType::Container.magic());
        buf.extend_from_slice(&self.usb_vid.to_be_bytes());
        buf.extend_from_slice(&self.usb_pid.to_be_bytes());
        for word in self.version.0 {
            buf.extend_from_slice(&word.to_be_bytes());
        }
        buf.extend_from_slice(&(self.sections.len() as u32).to_be_bytes());
        for section in &self.sections {
            section.encode_into(&mut buf);
        }
        buf
    }

    fn decode_inner(bytes: &[u8], with_data: bool) -> Result<Self, FirmwareError> {
        let mut reader = Reader::new(bytes);
        let magic = reader.take(MAGIC_LEN)?;
        let firmware_type =
            FirmwareType::from_magic(magic).ok_or_else(|| invalid_type(0, magic))?;

        if firmware_type != FirmwareType::Container {
            let section = decode_section(&mut reader, firmware_type, 1, with_data)?;
            return Ok(Self {
                usb_vid: section.usb_vid,
                usb_pid: section.usb_pid,
                version: section.version,
                num_sections: 1,
                sections: vec![section],
            });
        }

        let usb_vid = reader.be_u16()?;
        let usb_pid = reader.be_u16()?;
        let version = reader.version()?;
        let num_sections = reader.be_u32()?;

        if !with_data {
            return Ok(Self {
                usb_vid,
                usb_pid,
                version,
                num_sections,
                sections: Vec::new(),
            });
        }

        if !(1..=MAX_SECTIONS).contains(&num_sections) {
            return Err(FirmwareError::WrongSectionCount(num_sections));
        }

        let mut sections = Vec::with_capacity(num_sections as usize);
        for index in 1..=num_sections as usize {
            let magic = reader.take(MAGIC_LEN)?;
            let section_type = match FirmwareType::from_magic(magic) {
                Some(t) if t != FirmwareType::Container => t,
                _ => return Err(invalid_type(index, magic)),
            };
            sections.push(decode_section(&mut reader, section_type, index, true)?);
        }

        Ok(Self {
            usb_vid,
            usb_pid,
            version,
            num_sections,
            sections,
        })
    }
}

fn invalid_type(section: usize, magic: &[u8]) -> FirmwareError {
    FirmwareError::InvalidFirmwareType {
        section,
        magic: String::from_utf8_lossy(magic).into_owned(),
    }
}

fn decode_section(
    reader: &mut Reader<'_>,
    firmware_type: FirmwareType,
    index: usize,
    with_data: bool,
) -> Result<FirmwareSection, FirmwareError> {
    let usb_vid = reader.be_u16()?;
    let usb_pid = reader.be_u16()?;
    let version = reader.version()?;
    let length = reader.be_u32()?;
    let mut sha256 = [0u8; 32];
    sha256.copy_from_slice(reader.take(32)?);

    let mut section = FirmwareSection {
        firmware_type,
        usb_vid,
        usb_pid,
        version,
        length,
        sha256,
        md5: None,
        data: Vec::new(),
    };
    if !with_data {
        return Ok(section);
    }

    section.data = reader.take(length as usize)?.to_vec();
    if !section.verify() {
        let computed: [u8; 32] = Sha256::digest(&section.data).into();
        warn!(
            "sha256 mismatch in {} section {}: expected {}, computed {}",
            firmware_type,
            index,
            hex::encode(section.sha256),
            hex::encode(computed)
        );
        return Err(FirmwareError::CorruptFirmware { section: index });
    }
    if firmware_type == FirmwareType::Esp {
        section.md5 = Some(Md5::digest(&section.data).into());
    }
    Ok(section)
}

// ============================================================================
// Reader
// ============================================================================

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], FirmwareError> {
        let end = self.pos.checked_add(n).filter(|&end| end <= self.buf.len()).ok_or(
            FirmwareError::TruncatedFile {
                expected: self.pos.saturating_add(n),
                actual: self.buf.len(),
            },
        )?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn be_u16(&mut self) -> Result<u16, FirmwareError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn be_u32(&mut self) -> Result<u32, FirmwareError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn version(&mut self) -> Result<FirmwareVersion, FirmwareError> {
        Ok(FirmwareVersion([
            self.be_u32()?,
            self.be_u32()?,
            self.be_u32()?,
            self.be_u32()?,
        ]))
    }
}

// ============================================================================
// File Helpers
// ============================================================================

/// 读取并校验完整固件文件
pub fn read_firmware_file(path: impl AsRef<Path>) -> Result<FirmwareContainer, FirmwareError> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)?;
    let container = FirmwareContainer::decode(&bytes)?;
    debug!(
        "Read firmware {} ({} sections, version {})",
        path.display(),
        container.sections.len(),
        container.version
    );
    Ok(container)
}

/// 只读取固件文件头部
pub fn read_firmware_header(path: impl AsRef<Path>) -> Result<FirmwareContainer, FirmwareError> {
    let file = std::fs::File::open(path.as_ref())?;
    let mut head = Vec::with_capacity(MAGIC_LEN + SECTION_HEADER_LEN);
    file.take((MAGIC_LEN + SECTION_HEADER_LEN) as u64)
        .read_to_end(&mut head)?;
    FirmwareContainer::decode_header(&head)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app_section(data: &[u8]) -> FirmwareSection {
        FirmwareSection::new(
            FirmwareType::App,
            0x1235,
            0x821d,
            FirmwareVersion([1, 2, 3, 4]),
            data.to_vec(),
        )
    }

    #[test]
    fn test_magic_lookup() {
        assert_eq!(FirmwareType::from_magic(b"SCARLESP"), Some(FirmwareType::Esp));
        assert_eq!(FirmwareType::from_magic(b"SCARLBOX"), Some(FirmwareType::Container));
        assert_eq!(FirmwareType::from_magic(b"SCARLXXX"), None);
        assert_eq!(FirmwareType::Leapfrog.to_string(), "Leapfrog");
    }

    #[test]
    fn test_version_ordering() {
        let a = FirmwareVersion([1, 0, 2115, 0]);
        let b = FirmwareVersion([1, 0, 2200, 0]);
        let c = FirmwareVersion([2, 0, 0, 0]);
        assert!(a < b && b < c);
        assert_eq!(b.to_string(), "1.0.2200.0");
    }

    #[test]
    fn test_container_encode_layout() {
        let container = FirmwareContainer::new(
            0x1235,
            0x821b,
            FirmwareVersion([1, 0, 0, 7]),
            vec![app_section(&[0xAA; 4])],
        );
        let bytes = container.encode();
        assert_eq!(&bytes[..8], b"SCARLBOX");
        assert_eq!(&bytes[8..10], &[0x12, 0x35]);
        assert_eq!(&bytes[10..12], &[0x82, 0x1b]);
        assert_eq!(&bytes[24..28], &[0, 0, 0, 7]);
        assert_eq!(&bytes[28..32], &[0, 0, 0, 1]);
        assert_eq!(&bytes[32..40], b"SCARLET4");
        assert_eq!(bytes.len(), 32 + 8 + SECTION_HEADER_LEN + 4);
    }

    #[test]
    fn test_esp_section_has_md5() {
        let section = FirmwareSection::new(
            FirmwareType::Esp,
            0x1235,
            0x821c,
            FirmwareVersion::default(),
            b"abc".to_vec(),
        );
        assert_eq!(
            hex::encode(section.md5_or_zero()),
            "900150983cd24fb0d6963f7d28e17f72"
        );
        assert_eq!(app_section(b"abc").md5_or_zero(), [0u8; 16]);
    }

    #[test]
    fn test_decode_full_container() {
        let esp = FirmwareSection::new(
            FirmwareType::Esp,
            0x1235,
            0x821d,
            FirmwareVersion([1, 0, 0, 1]),
            vec![7u8; 100],
        );
        let container = FirmwareContainer::new(
            0x1235,
            0x821d,
            FirmwareVersion([1, 0, 0, 9]),
            vec![app_section(&[1, 2, 3]), esp],
        );
        let decoded = FirmwareContainer::decode(&container.encode()).unwrap();
        assert_eq!(decoded, container);
        assert!(decoded.section(FirmwareType::Esp).unwrap().md5.is_some());
        assert!(decoded.section(FirmwareType::Leapfrog).is_none());
    }

    #[test]
    fn test_bare_section_wrapped() {
        let section = app_section(&[9u8; 16]);
        let mut bytes = Vec::new();
        section.encode_into(&mut bytes);
        let container = FirmwareContainer::decode(&bytes).unwrap();
        assert_eq!(container.num_sections, 1);
        assert_eq!(container.usb_pid, 0x821d);
        assert_eq!(container.version, FirmwareVersion([1, 2, 3, 4]));
        assert_eq!(container.sections[0], section);
    }

    #[test]
    fn test_header_only_skips_data() {
        let container = FirmwareContainer::new(
            0x1235,
            0x821c,
            FirmwareVersion([3, 0, 0, 0]),
            vec![app_section(&[0u8; 64])],
        );
        let header = FirmwareContainer::decode_header(&container.encode()[..32]).unwrap();
        assert_eq!(header.num_sections, 1);
        assert!(header.sections.is_empty());
        assert_eq!(header.version, FirmwareVersion([3, 0, 0, 0]));
    }

    #[test]
    fn test_wrong_section_count() {
        let mut bytes = FirmwareContainer::new(0x1235, 0x821c, FirmwareVersion::default(), vec![])
            .encode();
        assert!(matches!(
            FirmwareContainer::decode(&bytes),
            Err(FirmwareError::WrongSectionCount(0))
        ));
        bytes[28..32].copy_from_slice(&4u32.to_be_bytes());
        assert!(matches!(
            FirmwareContainer::decode(&bytes),
            Err(FirmwareError::WrongSectionCount(4))
        ));
    }

    #[test]
    fn test_nested_container_rejected() {
        let mut bytes = FirmwareContainer::new(
            0x1235,
            0x821c,
            FirmwareVersion::default(),
            vec![app_section(&[1])],
        )
        .encode();
        bytes[32..40].copy_from_slice(b"SCARLBOX");
        assert!(matches!(
            FirmwareContainer::decode(&bytes),
            Err(FirmwareError::InvalidFirmwareType { section: 1, .. })
        ));
    }

    #[test]
    fn test_unknown_top_level_magic() {
        assert!(matches!(
            FirmwareContainer::decode(b"NOTFIRMWARE....."),
            Err(FirmwareError::InvalidFirmwareType { section: 0, .. })
        ));
    }

    #[test]
    fn test_truncated_data() {
        let bytes = FirmwareContainer::new(
            0x1235,
            0x821c,
            FirmwareVersion::default(),
            vec![app_section(&[1u8; 32])],
        )
        .encode();
        let cut = &bytes[..bytes.len() - 1];
        assert!(matches!(
            FirmwareContainer::decode(cut),
            Err(FirmwareError::TruncatedFile { .. })
        ));
    }

    #[test]
    fn test_read_firmware_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scarlett4-18i20.bin");
        let container = FirmwareContainer::new(
            0x1235,
            0x821d,
            FirmwareVersion([1, 0, 2, 0]),
            vec![app_section(&[5u8; 300])],
        );
        std::fs::write(&path, container.encode()).unwrap();

        assert_eq!(read_firmware_file(&path).unwrap(), container);
        let header = read_firmware_header(&path).unwrap();
        assert_eq!(header.usb_pid, 0x821d);
        assert!(header.sections.is_empty());
    }
}
