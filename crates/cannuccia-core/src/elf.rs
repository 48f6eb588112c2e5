//! ELF firmware ingestion.
//!
//! A CANnuccia target only cares about the bytes that end up in flash: the
//! `PT_LOAD` program segments with a non-zero file size. Everything else in
//! the image (sections, symbols, debug info) is ignored.

use goblin::elf::Elf;
use goblin::elf::header::EI_OSABI;
use goblin::elf::program_header::PT_LOAD;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ElfError {
    #[error("Not a valid ELF image: {0}")]
    Parse(#[from] goblin::error::Error),

    #[error("Segment {index} data out of bounds: offset 0x{offset:X} + 0x{len:X} past end of a 0x{file_len:X}-byte image")]
    SegmentOutOfBounds {
        index: usize,
        offset: u64,
        len: u64,
        file_len: usize,
    },

    #[error("Segment {index} physical address 0x{addr:X} does not fit a 32-bit flash address")]
    AddressOutOfRange { index: usize, addr: u64 },
}

/// One `PT_LOAD` segment worth flashing.
#[derive(Debug, Clone)]
pub struct LoadableSegment {
    /// Destination address in target flash.
    pub phys_addr: u32,
    /// Bytes copied out of the image (`p_filesz` of them).
    pub data: Vec<u8>,
    /// In-memory size; larger than `data.len()` when the segment has .bss
    /// style zero-fill. Only used for logging.
    pub mem_size: u64,
}

/// A parsed firmware image: machine type plus its flashable segments,
/// in file order.
#[derive(Debug)]
pub struct FirmwareElf {
    /// The image's `e_machine` value, checked against the target's.
    pub machine: u16,
    pub segments: Vec<LoadableSegment>,
}

impl FirmwareElf {
    pub fn parse(bytes: &[u8]) -> Result<Self, ElfError> {
        let elf = Elf::parse(bytes)?;

        debug!(
            machine = elf.header.e_machine,
            os_abi = elf.header.e_ident[EI_OSABI],
            "ELF header parsed"
        );
        debug!(count = elf.program_headers.len(), "ELF segments:");

        let mut segments = Vec::new();
        for (index, ph) in elf.program_headers.iter().enumerate() {
            if ph.p_type != PT_LOAD {
                debug!("> segment {index}: not loadable, skip");
                continue;
            }
            if ph.p_filesz == 0 {
                debug!("> segment {index}: loadable but has fileSize=0B, skip");
                continue;
            }

            let phys_addr =
                u32::try_from(ph.p_paddr).map_err(|_| ElfError::AddressOutOfRange {
                    index,
                    addr: ph.p_paddr,
                })?;

            let start = ph.p_offset;
            let end = start.checked_add(ph.p_filesz).filter(|&e| e <= bytes.len() as u64);
            let Some(end) = end else {
                return Err(ElfError::SegmentOutOfBounds {
                    index,
                    offset: ph.p_offset,
                    len: ph.p_filesz,
                    file_len: bytes.len(),
                });
            };

            debug!(
                "> segment {index}: loadable, flash fileSize={}B (out of memSize={}B) at physAddr=0x{phys_addr:08X}",
                ph.p_filesz, ph.p_memsz
            );

            segments.push(LoadableSegment {
                phys_addr,
                data: bytes[start as usize..end as usize].to_vec(),
                mem_size: ph.p_memsz,
            });
        }

        Ok(Self {
            machine: elf.header.e_machine,
            segments,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::test_images::make_elf;
    use super::*;

    #[test]
    fn test_parse_single_segment() {
        let image = make_elf(0x0053, &[(0x0800_0000, 100, 120)]);
        let elf = FirmwareElf::parse(&image).unwrap();

        assert_eq!(elf.machine, 0x0053);
        assert_eq!(elf.segments.len(), 1);
        let seg = &elf.segments[0];
        assert_eq!(seg.phys_addr, 0x0800_0000);
        assert_eq!(seg.data.len(), 100);
        assert_eq!(seg.mem_size, 120);
        assert_eq!(seg.data[0], 0x00);
        assert_eq!(seg.data[99], 99);
    }

    #[test]
    fn test_skips_empty_loadable_segments() {
        let image = make_elf(0x0053, &[(0x0800_0000, 0, 64), (0x0800_1000, 16, 16)]);
        let elf = FirmwareElf::parse(&image).unwrap();

        assert_eq!(elf.segments.len(), 1);
        assert_eq!(elf.segments[0].phys_addr, 0x0800_1000);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(FirmwareElf::parse(b"definitely not an ELF").is_err());
        assert!(FirmwareElf::parse(&[]).is_err());
    }

    #[test]
    fn test_rejects_truncated_segment_data() {
        let mut image = make_elf(0x0053, &[(0x0800_0000, 64, 64)]);
        image.truncate(image.len() - 32);
        assert!(matches!(
            FirmwareElf::parse(&image),
            Err(ElfError::SegmentOutOfBounds { .. })
        ));
    }
}
