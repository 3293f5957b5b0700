//! Contract image format: a restricted 64-bit little-endian RISC-V ELF.
//!
//! Only PT_LOAD segments with 4096-byte alignment are accepted, and images
//! are capped at 1 GiB. The trimmer rewrites an image in place - dropping
//! segments (typically the one-shot init code), stripping trailing zeros and
//! patching the entry - so stored contract code carries no dead weight.

use crate::virtual_machine::errors::VmError;

/// Overall image size ceiling (1 GiB).
pub const SIZE_LIMIT: usize = 1 << 30;

/// Required segment alignment, equal to the VM page size.
pub const PAGE_SIZE: u32 = 1 << 12;

const ELF_MAGIC: u32 = 0x464c_457f;
const MACHINE_RISCV: u16 = 243;
const PHENT_SIZE: usize = 56;

/// One PT_LOAD segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Low three privilege bits: R=4, W=2, X=1.
    pub privileges: u8,
    pub file_offset: u32,
    pub vaddr: u32,
    pub file_size: u32,
    pub mem_size: u32,
}

/// Parsed image header.
#[derive(Debug, Clone)]
pub struct Image {
    pub entry: u32,
    pub program_header_offset: u32,
    pub segments: Vec<Segment>,
}

fn read_u16(data: &[u8], at: usize) -> u16 {
    u16::from_le_bytes(data[at..at + 2].try_into().unwrap())
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(data[at..at + 4].try_into().unwrap())
}

fn read_u64(data: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(data[at..at + 8].try_into().unwrap())
}

/// Validates an ELF image and extracts its loadable layout.
pub fn parse(elf: &[u8]) -> Result<Image, VmError> {
    if elf.len() < 0x40 {
        return Err(VmError::ElfInvalid("header truncated"));
    }
    if elf.len() > SIZE_LIMIT {
        return Err(VmError::ElfInvalid("image too large"));
    }
    if read_u32(elf, 0) != ELF_MAGIC {
        return Err(VmError::ElfInvalid("header magic mismatch"));
    }
    if read_u16(elf, 0x12) != MACHINE_RISCV {
        return Err(VmError::ElfInvalid("machine mismatch"));
    }
    let entry = read_u64(elf, 0x18);
    if entry >= SIZE_LIMIT as u64 {
        return Err(VmError::ElfInvalid("entry point out of range"));
    }
    let ph_offset = read_u64(elf, 0x20);
    if ph_offset > SIZE_LIMIT as u64 {
        return Err(VmError::ElfInvalid("program header offset out of range"));
    }
    let ph_offset = ph_offset as usize;
    let phent_size = read_u16(elf, 0x36) as usize;
    let ph_count = read_u16(elf, 0x38) as usize;
    if phent_size != PHENT_SIZE {
        return Err(VmError::ElfInvalid("program header entry size mismatch"));
    }
    if elf.len() < ph_offset + phent_size * ph_count {
        return Err(VmError::ElfInvalid("program header table truncated"));
    }

    let mut segments = Vec::with_capacity(ph_count);
    for i in 0..ph_count {
        let entry_at = ph_offset + phent_size * i;
        let p_type = read_u32(elf, entry_at);
        let p_flags = read_u32(elf, entry_at + 4);
        let p_offset = read_u64(elf, entry_at + 8);
        let p_vaddr = read_u64(elf, entry_at + 16);
        let p_filesz = read_u64(elf, entry_at + 32);
        let p_memsz = read_u64(elf, entry_at + 40);
        let p_align = read_u64(elf, entry_at + 48);

        if p_type != 1 {
            return Err(VmError::ElfInvalid("segment type unsupported"));
        }
        if p_align != PAGE_SIZE as u64 {
            return Err(VmError::ElfInvalid("segment alignment unsupported"));
        }
        if p_offset + p_filesz > SIZE_LIMIT as u64 {
            return Err(VmError::ElfInvalid("segment offset out of range"));
        }
        if (elf.len() as u64) < p_offset + p_filesz {
            return Err(VmError::ElfInvalid("segment data truncated"));
        }
        if p_vaddr > SIZE_LIMIT as u64 {
            return Err(VmError::ElfInvalid("segment vaddr out of range"));
        }
        if p_memsz > SIZE_LIMIT as u64 {
            return Err(VmError::ElfInvalid("segment memsz out of range"));
        }
        if p_memsz < p_filesz {
            return Err(VmError::ElfInvalid("segment memsz smaller than filesz"));
        }
        if p_vaddr % PAGE_SIZE as u64 != 0 {
            return Err(VmError::ElfInvalid("segment vaddr not page-aligned"));
        }
        if p_offset % 8 != 0 {
            return Err(VmError::ElfInvalid("segment offset not 8-byte aligned"));
        }

        segments.push(Segment {
            privileges: (p_flags & 7) as u8,
            file_offset: p_offset as u32,
            vaddr: p_vaddr as u32,
            file_size: p_filesz as u32,
            mem_size: p_memsz as u32,
        });
    }

    Ok(Image {
        entry: entry as u32,
        program_header_offset: ph_offset as u32,
        segments,
    })
}

fn trimmed_len(data: &[u8], min_len: usize) -> usize {
    let mut len = data.len();
    while len > min_len && data[len - 1] == 0 {
        len -= 1;
    }
    len
}

/// Produces a compacted image: segments whose vaddr appears in `drop_vaddrs`
/// are removed, the remaining file images lose their trailing zeros, the
/// program header table is rewritten in place and the entry is replaced.
///
/// The first segment must start at file offset 0 and be large enough to keep
/// holding the ELF header and program header table; it can never be dropped.
pub fn trim(
    elf: &[u8],
    image: &Image,
    drop_vaddrs: &[u32],
    new_entry: u64,
) -> Result<Vec<u8>, VmError> {
    let table_end = image.program_header_offset as usize + PHENT_SIZE * image.segments.len();
    let first = image
        .segments
        .first()
        .ok_or(VmError::ElfInvalid("no segments"))?;
    if first.file_offset != 0 || (first.file_size as usize) < table_end {
        return Err(VmError::ElfInvalid("unsupported first segment"));
    }

    let mut out = Vec::new();
    let mut table_at = image.program_header_offset as usize;
    let mut kept = 0u16;
    for (i, seg) in image.segments.iter().enumerate() {
        if drop_vaddrs.contains(&seg.vaddr) {
            if i == 0 {
                return Err(VmError::ElfInvalid("can't trim first segment"));
            }
            continue;
        }
        let min_len = if i == 0 { table_end } else { 0 };
        let data = &elf[seg.file_offset as usize..(seg.file_offset + seg.file_size) as usize];
        let new_len = trimmed_len(data, min_len);
        let new_offset = out.len();
        out.extend_from_slice(&data[..new_len]);
        while out.len() % 8 != 0 {
            out.push(0);
        }
        out[table_at..table_at + 4].copy_from_slice(&1u32.to_le_bytes());
        out[table_at + 4..table_at + 8].copy_from_slice(&(seg.privileges as u32).to_le_bytes());
        out[table_at + 8..table_at + 16].copy_from_slice(&(new_offset as u64).to_le_bytes());
        out[table_at + 16..table_at + 24].copy_from_slice(&(seg.vaddr as u64).to_le_bytes());
        out[table_at + 24..table_at + 32].copy_from_slice(&(seg.vaddr as u64).to_le_bytes());
        out[table_at + 32..table_at + 40].copy_from_slice(&(new_len as u64).to_le_bytes());
        out[table_at + 40..table_at + 48].copy_from_slice(&(seg.mem_size as u64).to_le_bytes());
        out[table_at + 48..table_at + 56].copy_from_slice(&(PAGE_SIZE as u64).to_le_bytes());
        table_at += PHENT_SIZE;
        kept += 1;
    }
    out[0x38..0x3a].copy_from_slice(&kept.to_le_bytes());
    // Zero out table entries of dropped segments
    while table_at < table_end {
        out[table_at..table_at + PHENT_SIZE].fill(0);
        table_at += PHENT_SIZE;
    }
    out[0x18..0x20].copy_from_slice(&new_entry.to_le_bytes());
    Ok(out)
}

/// Builds a minimal single-code-segment image, used by tooling and tests.
///
/// The code is placed behind the headers inside one RX segment mapped at
/// `vaddr`, with the entry at the segment start.
pub fn build_single_segment(code: &[u8], vaddr: u32) -> Vec<u8> {
    let header_len = 0x40 + PHENT_SIZE;
    let file_size = header_len + code.len();
    let mem_size = (file_size as u32).div_ceil(PAGE_SIZE) * PAGE_SIZE;
    let mut out = vec![0u8; header_len];

    out[0..4].copy_from_slice(&ELF_MAGIC.to_le_bytes());
    out[4] = 2; // 64-bit
    out[5] = 1; // little-endian
    out[6] = 1; // version
    out[0x10..0x12].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
    out[0x12..0x14].copy_from_slice(&MACHINE_RISCV.to_le_bytes());
    out[0x14..0x18].copy_from_slice(&1u32.to_le_bytes());
    out[0x18..0x20].copy_from_slice(&((vaddr as u64 + header_len as u64)).to_le_bytes());
    out[0x20..0x28].copy_from_slice(&0x40u64.to_le_bytes()); // phoff
    out[0x34..0x36].copy_from_slice(&0x40u16.to_le_bytes()); // ehsize
    out[0x36..0x38].copy_from_slice(&(PHENT_SIZE as u16).to_le_bytes());
    out[0x38..0x3a].copy_from_slice(&1u16.to_le_bytes());

    let ph = 0x40;
    out[ph..ph + 4].copy_from_slice(&1u32.to_le_bytes()); // PT_LOAD
    out[ph + 4..ph + 8].copy_from_slice(&0b101u32.to_le_bytes()); // RX
    out[ph + 8..ph + 16].copy_from_slice(&0u64.to_le_bytes());
    out[ph + 16..ph + 24].copy_from_slice(&(vaddr as u64).to_le_bytes());
    out[ph + 24..ph + 32].copy_from_slice(&(vaddr as u64).to_le_bytes());
    out[ph + 32..ph + 40].copy_from_slice(&(file_size as u64).to_le_bytes());
    out[ph + 40..ph + 48].copy_from_slice(&(mem_size as u64).to_le_bytes());
    out[ph + 48..ph + 56].copy_from_slice(&(PAGE_SIZE as u64).to_le_bytes());

    out.extend_from_slice(code);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        let mut code = vec![0x13u8, 0, 0, 0]; // nop
        code.extend_from_slice(&[0u8; 64]); // trailing zeros to trim
        build_single_segment(&code, 0x1000_0000)
    }

    #[test]
    fn parse_accepts_built_image() {
        let elf = sample();
        let image = parse(&elf).unwrap();
        assert_eq!(image.segments.len(), 1);
        assert_eq!(image.segments[0].vaddr, 0x1000_0000);
        assert_eq!(image.segments[0].privileges, 0b101);
        assert_eq!(image.entry, 0x1000_0000 + 0x40 + PHENT_SIZE as u32);
    }

    #[test]
    fn parse_rejects_bad_magic() {
        let mut elf = sample();
        elf[0] = 0;
        assert!(matches!(parse(&elf), Err(VmError::ElfInvalid(_))));
    }

    #[test]
    fn parse_rejects_wrong_machine() {
        let mut elf = sample();
        elf[0x12] = 0x3e; // x86-64
        assert!(matches!(parse(&elf), Err(VmError::ElfInvalid(_))));
    }

    #[test]
    fn parse_rejects_non_load_segment() {
        let mut elf = sample();
        elf[0x40] = 2; // PT_DYNAMIC
        assert!(parse(&elf).is_err());
    }

    #[test]
    fn parse_rejects_bad_alignment() {
        let mut elf = sample();
        elf[0x40 + 48..0x40 + 56].copy_from_slice(&8u64.to_le_bytes());
        assert!(parse(&elf).is_err());
    }

    #[test]
    fn parse_rejects_memsz_below_filesz() {
        let mut elf = sample();
        elf[0x40 + 40..0x40 + 48].copy_from_slice(&1u64.to_le_bytes());
        assert!(parse(&elf).is_err());
    }

    #[test]
    fn parse_rejects_truncated_segment() {
        let elf = sample();
        assert!(parse(&elf[..elf.len() - 8]).is_err());
    }

    #[test]
    fn trim_strips_trailing_zeros_and_preserves_layout() {
        let elf = sample();
        let image = parse(&elf).unwrap();
        let trimmed = trim(&elf, &image, &[], image.entry as u64).unwrap();
        assert!(trimmed.len() < elf.len());

        let reparsed = parse(&trimmed).unwrap();
        assert_eq!(reparsed.entry, image.entry);
        assert_eq!(reparsed.segments.len(), image.segments.len());
        for (a, b) in reparsed.segments.iter().zip(image.segments.iter()) {
            assert_eq!(a.privileges, b.privileges);
            assert_eq!(a.vaddr, b.vaddr);
            assert_eq!(a.mem_size, b.mem_size);
        }
    }

    #[test]
    fn retrim_is_a_fixpoint() {
        let elf = sample();
        let image = parse(&elf).unwrap();
        let once = trim(&elf, &image, &[], image.entry as u64).unwrap();
        let once_image = parse(&once).unwrap();
        let twice = trim(&once, &once_image, &[], once_image.entry as u64).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn trim_updates_entry() {
        let elf = sample();
        let image = parse(&elf).unwrap();
        let trimmed = trim(&elf, &image, &[], 0x1000_0040).unwrap();
        assert_eq!(parse(&trimmed).unwrap().entry, 0x1000_0040);
    }

    #[test]
    fn trim_refuses_to_drop_first_segment() {
        let elf = sample();
        let image = parse(&elf).unwrap();
        assert!(trim(&elf, &image, &[image.segments[0].vaddr], 0).is_err());
    }

    /// Two-segment image: headers + code (RX at block 1), then a data
    /// segment (RW at block 2).
    fn build_two_segment(code: &[u8], data: &[u8]) -> Vec<u8> {
        let header_len = 0x40 + 2 * PHENT_SIZE;
        let mut seg0 = vec![0u8; header_len];
        seg0.extend_from_slice(code);
        while seg0.len() % 8 != 0 {
            seg0.push(0);
        }
        let data_offset = seg0.len();

        let mut out = seg0;
        out.extend_from_slice(data);

        out[0..4].copy_from_slice(&ELF_MAGIC.to_le_bytes());
        out[4] = 2;
        out[5] = 1;
        out[6] = 1;
        out[0x10..0x12].copy_from_slice(&2u16.to_le_bytes());
        out[0x12..0x14].copy_from_slice(&MACHINE_RISCV.to_le_bytes());
        out[0x18..0x20].copy_from_slice(&(0x1000_0000u64 + header_len as u64).to_le_bytes());
        out[0x20..0x28].copy_from_slice(&0x40u64.to_le_bytes());
        out[0x36..0x38].copy_from_slice(&(PHENT_SIZE as u16).to_le_bytes());
        out[0x38..0x3a].copy_from_slice(&2u16.to_le_bytes());

        let ph = 0x40;
        out[ph..ph + 4].copy_from_slice(&1u32.to_le_bytes());
        out[ph + 4..ph + 8].copy_from_slice(&0b101u32.to_le_bytes());
        out[ph + 8..ph + 16].copy_from_slice(&0u64.to_le_bytes());
        out[ph + 16..ph + 24].copy_from_slice(&0x1000_0000u64.to_le_bytes());
        out[ph + 24..ph + 32].copy_from_slice(&0x1000_0000u64.to_le_bytes());
        out[ph + 32..ph + 40].copy_from_slice(&(data_offset as u64).to_le_bytes());
        out[ph + 40..ph + 48].copy_from_slice(&(PAGE_SIZE as u64).to_le_bytes());
        out[ph + 48..ph + 56].copy_from_slice(&(PAGE_SIZE as u64).to_le_bytes());

        let ph = 0x40 + PHENT_SIZE;
        let data_len = data.len() as u64;
        out[ph..ph + 4].copy_from_slice(&1u32.to_le_bytes());
        out[ph + 4..ph + 8].copy_from_slice(&0b110u32.to_le_bytes());
        out[ph + 8..ph + 16].copy_from_slice(&(data_offset as u64).to_le_bytes());
        out[ph + 16..ph + 24].copy_from_slice(&0x2000_0000u64.to_le_bytes());
        out[ph + 24..ph + 32].copy_from_slice(&0x2000_0000u64.to_le_bytes());
        out[ph + 32..ph + 40].copy_from_slice(&data_len.to_le_bytes());
        out[ph + 40..ph + 48].copy_from_slice(&(PAGE_SIZE as u64).to_le_bytes());
        out[ph + 48..ph + 56].copy_from_slice(&(PAGE_SIZE as u64).to_le_bytes());

        out
    }

    #[test]
    fn trim_drops_listed_segment() {
        let elf = build_two_segment(&[0x13, 0, 0, 0], &[7u8; 16]);
        let image = parse(&elf).unwrap();
        assert_eq!(image.segments.len(), 2);

        let trimmed = trim(&elf, &image, &[0x2000_0000], image.entry as u64).unwrap();
        let reparsed = parse(&trimmed).unwrap();
        assert_eq!(reparsed.segments.len(), 1);
        assert_eq!(reparsed.segments[0].vaddr, 0x1000_0000);
        assert_eq!(reparsed.entry, image.entry);
    }
}
