/// Shared helpers: CRC, clock source, name validation, logging.
use anyhow::{bail, Result};
use chrono::Utc;
use crc::{Crc, CRC_32_ISO_HDLC};

/// Polynomial 0xEDB88320 (reflected), init 0xFFFFFFFF, xorout 0xFFFFFFFF.
pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// The 16-bit checksum used by the inode tail is the CRC32 of the same
/// convention truncated to its low 16 bits.
pub fn crc16(data: &[u8]) -> u16 {
    (CRC32.checksum(data) & 0xFFFF) as u16
}

/// Clock source for created/modified stamps, whole seconds.
pub fn timestamp_now() -> u32 {
    Utc::now().timestamp() as u32
}

pub const MAX_NAME_LEN: usize = 27;

/// A directory entry name: 1..=27 bytes, no separator, not `.` or `..`.
pub fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN || name.contains('/') {
        bail!("Bad name");
    }
    if name == "." || name == ".." {
        bail!("Bad name");
    }
    Ok(())
}

pub fn ceil_div(a: usize, b: usize) -> usize {
    (a + b - 1) / b
}

/// Logger init shared by the CLI and tests; safe to call repeatedly.
pub fn init_logs() {
    let _ = env_logger::builder().format_timestamp(None).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32_known_vectors() {
        assert_eq!(crc32(b""), 0x0000_0000);
        assert_eq!(crc32(b"a"), 0xE8B7_BE43);
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn crc16_is_truncated_crc32() {
        assert_eq!(crc16(b"123456789"), 0x3926);
        assert_eq!(crc16(b""), 0);
    }

    #[test]
    fn name_rules() {
        assert!(check_name("hello.txt").is_ok());
        assert!(check_name(&"x".repeat(27)).is_ok());
        assert!(check_name("").is_err());
        assert!(check_name(&"x".repeat(28)).is_err());
        assert!(check_name("a/b").is_err());
        assert!(check_name(".").is_err());
        assert!(check_name("..").is_err());
    }

    #[test]
    fn ceil_div_rounds_up() {
        assert_eq!(ceil_div(0, 512), 0);
        assert_eq!(ceil_div(1, 512), 1);
        assert_eq!(ceil_div(512, 512), 1);
        assert_eq!(ceil_div(513, 512), 2);
    }
}
