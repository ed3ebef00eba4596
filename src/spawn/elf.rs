// src/spawn/elf.rs
//! Minimal ELF64 parsing for the spawner.
//!
//! Only what loading a static AArch64 binary needs: header validation, the
//! loadable program headers, and section lookup by name (for `.got`).

use alloc::vec::Vec;

use crate::capability::MapFlags;
use crate::errors::ElfError;

/// ELF magic bytes.
pub const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];

const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;

/// Loadable segment program header type.
pub const PT_LOAD: u32 = 1;

/// Segment permission flags.
pub mod phdr_flags {
    pub const PF_X: u32 = 1;
    pub const PF_W: u32 = 2;
    pub const PF_R: u32 = 4;
}

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;
const SHDR_SIZE: usize = 64;

fn read_u16(data: &[u8], off: usize) -> Result<u16, ElfError> {
    let bytes = data.get(off..off + 2).ok_or(ElfError::TooSmall)?;
    Ok(u16::from_le_bytes(bytes.try_into().unwrap()))
}

fn read_u32(data: &[u8], off: usize) -> Result<u32, ElfError> {
    let bytes = data.get(off..off + 4).ok_or(ElfError::TooSmall)?;
    Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
}

fn read_u64(data: &[u8], off: usize) -> Result<u64, ElfError> {
    let bytes = data.get(off..off + 8).ok_or(ElfError::TooSmall)?;
    Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
}

/// Whether the buffer starts with the ELF magic.
#[must_use]
pub fn is_elf(data: &[u8]) -> bool {
    data.len() >= 4 && data[..4] == ELF_MAGIC
}

/// Parsed ELF64 header fields.
#[derive(Debug, Clone, Copy)]
pub struct Elf64Header {
    pub entry: u64,
    pub phoff: u64,
    pub phentsize: u16,
    pub phnum: u16,
    pub shoff: u64,
    pub shentsize: u16,
    pub shnum: u16,
    pub shstrndx: u16,
    pub machine: u16,
}

/// Parse and validate the ELF header.
pub fn parse_header(data: &[u8]) -> Result<Elf64Header, ElfError> {
    if data.len() < EHDR_SIZE {
        return Err(ElfError::TooSmall);
    }
    if !is_elf(data) || data[4] != ELFCLASS64 || data[5] != ELFDATA2LSB {
        return Err(ElfError::InvalidHeader);
    }
    Ok(Elf64Header {
        machine: read_u16(data, 18)?,
        entry: read_u64(data, 24)?,
        phoff: read_u64(data, 32)?,
        shoff: read_u64(data, 40)?,
        phentsize: read_u16(data, 54)?,
        phnum: read_u16(data, 56)?,
        shentsize: read_u16(data, 58)?,
        shnum: read_u16(data, 60)?,
        shstrndx: read_u16(data, 62)?,
    })
}

/// One ELF64 program header.
#[derive(Debug, Clone, Copy)]
pub struct ProgramHeader {
    pub p_type: u32,
    pub flags: u32,
    pub offset: u64,
    pub vaddr: u64,
    pub filesz: u64,
    pub memsz: u64,
    pub align: u64,
}

impl ProgramHeader {
    /// Whether this segment must be loaded.
    #[must_use]
    pub const fn is_load(&self) -> bool {
        self.p_type == PT_LOAD
    }

    /// Mapping flags for the segment permissions.
    #[must_use]
    pub fn map_flags(&self) -> MapFlags {
        let mut flags = MapFlags::empty();
        if self.flags & phdr_flags::PF_R != 0 {
            flags |= MapFlags::READ;
        }
        if self.flags & phdr_flags::PF_W != 0 {
            flags |= MapFlags::WRITE;
        }
        if self.flags & phdr_flags::PF_X != 0 {
            flags |= MapFlags::EXECUTE;
        }
        flags
    }
}

/// All program headers of the binary.
pub fn program_headers(data: &[u8], hdr: &Elf64Header) -> Result<Vec<ProgramHeader>, ElfError> {
    if hdr.phentsize as usize != PHDR_SIZE {
        return Err(ElfError::InvalidProgramHeader);
    }
    let mut headers = Vec::with_capacity(hdr.phnum as usize);
    for i in 0..hdr.phnum as usize {
        let off = hdr.phoff as usize + i * PHDR_SIZE;
        if off + PHDR_SIZE > data.len() {
            return Err(ElfError::InvalidProgramHeader);
        }
        headers.push(ProgramHeader {
            p_type: read_u32(data, off)?,
            flags: read_u32(data, off + 4)?,
            offset: read_u64(data, off + 8)?,
            vaddr: read_u64(data, off + 16)?,
            filesz: read_u64(data, off + 32)?,
            memsz: read_u64(data, off + 40)?,
            align: read_u64(data, off + 48)?,
        });
    }
    Ok(headers)
}

/// Virtual address of the section named `name`.
pub fn find_section_addr(data: &[u8], hdr: &Elf64Header, name: &str) -> Result<u64, ElfError> {
    if hdr.shentsize as usize != SHDR_SIZE || hdr.shstrndx >= hdr.shnum {
        return Err(ElfError::InvalidSectionHeader);
    }

    let shdr_off = |idx: usize| hdr.shoff as usize + idx * SHDR_SIZE;

    // String table holding the section names.
    let strtab_off = read_u64(data, shdr_off(hdr.shstrndx as usize) + 24)? as usize;
    let strtab_size = read_u64(data, shdr_off(hdr.shstrndx as usize) + 32)? as usize;
    let strtab = data
        .get(strtab_off..strtab_off + strtab_size)
        .ok_or(ElfError::InvalidSectionHeader)?;

    for i in 0..hdr.shnum as usize {
        let off = shdr_off(i);
        if off + SHDR_SIZE > data.len() {
            return Err(ElfError::InvalidSectionHeader);
        }
        let sh_name = read_u32(data, off)? as usize;
        let tail = strtab
            .get(sh_name..)
            .ok_or(ElfError::InvalidSectionHeader)?;
        let end = tail
            .iter()
            .position(|&b| b == 0)
            .ok_or(ElfError::InvalidSectionHeader)?;
        if &tail[..end] == name.as_bytes() {
            return read_u64(data, off + 16);
        }
    }
    Err(ElfError::NoGotSection)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_elf() {
        assert!(is_elf(&[0x7F, b'E', b'L', b'F', 0, 0]));
        assert!(!is_elf(b"no"));
        assert!(!is_elf(b"ELF\x7f data"));
    }

    #[test]
    fn test_parse_header_rejects_garbage() {
        assert!(matches!(parse_header(&[0u8; 16]), Err(ElfError::TooSmall)));

        let mut data = [0u8; 64];
        assert!(matches!(parse_header(&data), Err(ElfError::InvalidHeader)));

        data[..4].copy_from_slice(&ELF_MAGIC);
        data[4] = 1; // 32-bit class
        assert!(matches!(parse_header(&data), Err(ElfError::InvalidHeader)));
    }

    #[test]
    fn test_map_flags() {
        let phdr = ProgramHeader {
            p_type: PT_LOAD,
            flags: phdr_flags::PF_R | phdr_flags::PF_X,
            offset: 0,
            vaddr: 0x20_0000,
            filesz: 0x100,
            memsz: 0x100,
            align: 0x1000,
        };
        assert!(phdr.is_load());
        let flags = phdr.map_flags();
        assert!(flags.contains(MapFlags::READ));
        assert!(flags.contains(MapFlags::EXECUTE));
        assert!(!flags.contains(MapFlags::WRITE));
    }
}
