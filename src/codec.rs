//! Fixed big-endian integer read/write helpers layered on a [`ByteDevice`].
//!
//! All multi-byte integers in the file format are big-endian; this module is
//! the only place that decides that, so the allocator and engine modules
//! never reach for `byteorder` directly.

use byteorder::{BigEndian, ByteOrder};

use crate::device::ByteDevice;
use crate::error::Result;

pub fn read_u32(dev: &dyn ByteDevice, offset: u64) -> Result<u32> {
    let mut buf = [0u8; 4];
    dev.pread(&mut buf, offset)?;
    Ok(BigEndian::read_u32(&buf))
}

pub fn write_u32(dev: &dyn ByteDevice, offset: u64, value: u32) -> Result<()> {
    let mut buf = [0u8; 4];
    BigEndian::write_u32(&mut buf, value);
    dev.pwrite(&buf, offset)
}

pub fn read_u64(dev: &dyn ByteDevice, offset: u64) -> Result<u64> {
    let mut buf = [0u8; 8];
    dev.pread(&mut buf, offset)?;
    Ok(BigEndian::read_u64(&buf))
}

pub fn write_u64(dev: &dyn ByteDevice, offset: u64, value: u64) -> Result<()> {
    let mut buf = [0u8; 8];
    BigEndian::write_u64(&mut buf, value);
    dev.pwrite(&buf, offset)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::device::OsFileDevice;
    use tempfile::tempdir;

    #[test]
    fn u32_round_trips_big_endian() {
        let dir = tempdir().unwrap();
        let dev = OsFileDevice::create_or_open(dir.path().join("f")).unwrap();
        dev.resize(4).unwrap();
        write_u32(&dev, 0, 0x01020304).unwrap();
        let mut raw = [0u8; 4];
        dev.pread(&mut raw, 0).unwrap();
        assert_eq!(raw, [0x01, 0x02, 0x03, 0x04]);
        assert_eq!(read_u32(&dev, 0).unwrap(), 0x01020304);
    }

    #[test]
    fn u64_round_trips_big_endian() {
        let dir = tempdir().unwrap();
        let dev = OsFileDevice::create_or_open(dir.path().join("f")).unwrap();
        dev.resize(8).unwrap();
        write_u64(&dev, 0, 0x0102030405060708).unwrap();
        let mut raw = [0u8; 8];
        dev.pread(&mut raw, 0).unwrap();
        assert_eq!(raw, [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]);
        assert_eq!(read_u64(&dev, 0).unwrap(), 0x0102030405060708);
    }
}
