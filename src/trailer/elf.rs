//! Locating the end of the runtime's own ELF content.

use anyhow::{bail, Context, Result};
use goblin::container::Ctx;
use goblin::elf::program_header::ProgramHeader;
use goblin::elf::Elf;
use std::io::{Read, Seek, SeekFrom};

/// Size of the largest ELF header (ELF64).
const EHDR_LEN: usize = 64;

/// Byte offset where the file's program segments end.
///
/// Only the ELF header and the program header table are read.
pub fn elf_end<R: Read + Seek>(file: &mut R) -> Result<u64> {
    let mut ehdr = [0u8; EHDR_LEN];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut ehdr)
        .context("reading ELF header of runtime")?;

    let header = Elf::parse_header(&ehdr).map_err(|e| anyhow::anyhow!("parsing ELF header: {e}"))?;
    let container = header
        .container()
        .map_err(|e| anyhow::anyhow!("unsupported ELF class: {e}"))?;
    let endianness = header
        .endianness()
        .map_err(|e| anyhow::anyhow!("unsupported ELF data encoding: {e}"))?;

    let phnum = header.e_phnum as usize;
    if phnum == 0 {
        bail!("runtime has no program headers");
    }
    let table_len = phnum * header.e_phentsize as usize;
    let mut table = vec![0u8; table_len];
    file.seek(SeekFrom::Start(header.e_phoff))?;
    file.read_exact(&mut table)
        .context("reading ELF program header table")?;

    let headers = ProgramHeader::parse(&table, 0, phnum, Ctx::new(container, endianness))
        .map_err(|e| anyhow::anyhow!("parsing ELF program headers: {e}"))?;

    let end = headers
        .iter()
        .map(|ph| ph.p_offset + ph.p_filesz)
        .max()
        .unwrap_or(0);

    // The program header table itself is part of the runtime.
    Ok(end.max(header.e_phoff + table_len as u64))
}


#[cfg(test)]
mod tests {
    use super::testing::fake_runtime;
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_elf_end_of_fake_runtime() {
        let mut bytes = fake_runtime(512);
        bytes.extend_from_slice(b"__STATIC_TOOLS__\n");
        assert_eq!(elf_end(&mut Cursor::new(bytes)).unwrap(), 512);
    }

    #[test]
    fn test_elf_end_of_real_executable() {
        let exe = std::env::current_exe().unwrap();
        let mut file = std::fs::File::open(&exe).unwrap();
        let end = elf_end(&mut file).unwrap();
        assert!(end > 0);
        assert!(end <= std::fs::metadata(&exe).unwrap().len());
    }

    #[test]
    fn test_rejects_non_elf() {
        let bytes = vec![b'#'; 128];
        assert!(elf_end(&mut Cursor::new(bytes)).is_err());
    }
}
