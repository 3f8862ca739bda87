//! Guest memory access
//!
//! The syscall front ends only ever touch guest memory through
//! [`GuestMemory`]; the emulator supplies the implementation.

use byteorder::{ByteOrder, LittleEndian};

/// Failed guest memory access
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid guest address range {addr:#010x}+{len}")]
pub struct MemoryError {
    pub addr: u32,
    pub len: usize,
}

/// Byte-addressed view of the guest's address space
pub trait GuestMemory {
    /// Copy `buf.len()` bytes starting at `addr` into `buf`
    fn read(&self, addr: u32, buf: &mut [u8]) -> Result<(), MemoryError>;

    /// Copy `data` into guest memory starting at `addr`
    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), MemoryError>;

    /// Whether `addr..addr+len` is mapped
    fn is_valid(&self, addr: u32, len: usize) -> bool;

    fn read_bytes(&self, addr: u32, len: usize) -> Result<Vec<u8>, MemoryError> {
        let mut buf = vec![0u8; len];
        self.read(addr, &mut buf)?;
        Ok(buf)
    }

    fn read_u32(&self, addr: u32) -> Result<u32, MemoryError> {
        let mut buf = [0u8; 4];
        self.read(addr, &mut buf)?;
        Ok(LittleEndian::read_u32(&buf))
    }

    fn read_i32(&self, addr: u32) -> Result<i32, MemoryError> {
        self.read_u32(addr).map(|v| v as i32)
    }

    fn write_u32(&mut self, addr: u32, value: u32) -> Result<(), MemoryError> {
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, value);
        self.write(addr, &buf)
    }

    fn write_i32(&mut self, addr: u32, value: i32) -> Result<(), MemoryError> {
        self.write_u32(addr, value as u32)
    }
}

/// Contiguous guest RAM mapped at a base address
pub struct FlatMemory {
    base: u32,
    bytes: Vec<u8>,
}

impl FlatMemory {
    pub fn new(base: u32, size: usize) -> Self {
        Self {
            base,
            bytes: vec![0; size],
        }
    }

    fn range(&self, addr: u32, len: usize) -> Result<std::ops::Range<usize>, MemoryError> {
        let err = MemoryError { addr, len };
        let start = addr.checked_sub(self.base).ok_or(err)? as usize;
        let end = start.checked_add(len).ok_or(err)?;
        if end > self.bytes.len() {
            return Err(err);
        }
        Ok(start..end)
    }
}

impl GuestMemory for FlatMemory {
    fn read(&self, addr: u32, buf: &mut [u8]) -> Result<(), MemoryError> {
        let range = self.range(addr, buf.len())?;
        buf.copy_from_slice(&self.bytes[range]);
        Ok(())
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), MemoryError> {
        let range = self.range(addr, data.len())?;
        self.bytes[range].copy_from_slice(data);
        Ok(())
    }

    fn is_valid(&self, addr: u32, len: usize) -> bool {
        self.range(addr, len).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat_memory_roundtrip() {
        let mut mem = FlatMemory::new(0x0880_0000, 0x100);
        mem.write_u32(0x0880_0010, 0xdead_beef).unwrap();
        assert_eq!(mem.read_u32(0x0880_0010).unwrap(), 0xdead_beef);
        assert_eq!(mem.read_bytes(0x0880_0010, 1).unwrap(), vec![0xef]);
    }

    #[test]
    fn test_flat_memory_bounds() {
        let mut mem = FlatMemory::new(0x0880_0000, 0x10);
        assert!(mem.read_u32(0x0870_0000).is_err());
        assert!(mem.write(0x0880_000e, &[0; 4]).is_err());
        assert!(mem.is_valid(0x0880_000c, 4));
        assert!(!mem.is_valid(0x0880_000d, 4));
    }
}
