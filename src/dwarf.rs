use gimli::{
    DebugAbbrev, DebugInfo, DebugLine, DebugLineStr, DebugStr,
    DebugStrOffsets, Dwarf, EndianSlice, LineProgramHeader, LineRow,
    RunTimeEndian, Unit,
};
use goblin::elf::{
    header::{EI_DATA, ELFDATA2LSB, ELFDATA2MSB},
    Elf,
};
use nix::errno::Errno;
use std::{
    collections::HashMap,
    fs::File,
    io::Read,
    path::{Path, PathBuf},
};

use crate::{
    diag::{Error, Result},
    symbol::MemAddr,
};

type Slice<'a> = EndianSlice<'a, RunTimeEndian>;

/// The source-location seam of the tracer: given a module path and an
/// offset into it, produce a `file:line` string from the module's debug
/// information.
pub trait Lookup: Send {
    /// Resolve `addr` (an offset into the module image at `path`) to a
    /// `file:line` string, `None` when the module carries no line
    /// information for it.
    ///
    /// # Errors
    ///
    /// Returns an `Err` when the module cannot be read or its debug
    /// information does not parse.
    fn addr2line(&mut self, path: &str, addr: MemAddr) -> Result<Option<String>>;
}

/// DWARF-backed source-location resolver with per-address memoization.
pub struct Resolver {
    cache: HashMap<(String, MemAddr), Option<String>>,
}

impl Resolver {
    #[must_use]
    pub fn new() -> Self {
        Self {
            cache: HashMap::new(),
        }
    }

    fn find_line(path: &str, addr: MemAddr) -> Result<Option<String>> {
        let mut file = File::open(Path::new(path))?;
        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer)?;

        let elf = Elf::parse(&buffer).map_err(|e| {
            Error::backend(format!("failed to parse '{path}' ({e})"))
        })?;

        let endianness = match elf.header.e_ident[EI_DATA] {
            ELFDATA2LSB => RunTimeEndian::Little,
            ELFDATA2MSB => RunTimeEndian::Big,
            _ => return Err(Errno::ENOEXEC.into()),
        };

        if section(&elf, &buffer, ".debug_line").is_empty() {
            return Ok(None);
        }

        let info = scan_line_programs(&elf, &buffer, endianness, addr)
            .map_err(|e| {
                Error::backend(format!(
                    "failed to read debug info of '{path}' ({e})"
                ))
            })?;

        Ok(info.map(|(file, line)| {
            let base = file
                .file_name()
                .map_or_else(|| file.display().to_string(), |nm| {
                    nm.to_string_lossy().into_owned()
                });
            format!("{base}:{line}")
        }))
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new()
    }
}

impl Lookup for Resolver {
    fn addr2line(&mut self, path: &str, addr: MemAddr) -> Result<Option<String>> {
        let key = (path.to_string(), addr);
        if let Some(info) = self.cache.get(&key) {
            return Ok(info.clone());
        }

        let info = Self::find_line(path, addr)?;
        self.cache.insert(key, info.clone());
        Ok(info)
    }
}

fn section<'a>(elf: &Elf<'_>, buffer: &'a [u8], nm: &str) -> &'a [u8] {
    elf.section_headers
        .iter()
        .find(|sh| elf.shdr_strtab.get_at(sh.sh_name) == Some(nm))
        .and_then(|sh| {
            let offset = usize::try_from(sh.sh_offset).ok()?;
            let size = usize::try_from(sh.sh_size).ok()?;
            buffer.get(offset..offset + size)
        })
        .unwrap_or(&[])
}

/// Walk every compilation unit's line program and return the source file
/// and line of the row at or right below `addr`, within a sequence that
/// covers it.
fn scan_line_programs(
    elf: &Elf<'_>,
    buffer: &[u8],
    endianness: RunTimeEndian,
    addr: MemAddr,
) -> gimli::Result<Option<(PathBuf, u64)>> {
    let dwarf = Dwarf {
        debug_abbrev: DebugAbbrev::new(
            section(elf, buffer, ".debug_abbrev"),
            endianness,
        ),
        debug_info: DebugInfo::new(section(elf, buffer, ".debug_info"), endianness),
        debug_line: DebugLine::new(section(elf, buffer, ".debug_line"), endianness),
        debug_line_str: DebugLineStr::from(EndianSlice::new(
            section(elf, buffer, ".debug_line_str"),
            endianness,
        )),
        debug_str: DebugStr::new(section(elf, buffer, ".debug_str"), endianness),
        debug_str_offsets: DebugStrOffsets::from(EndianSlice::new(
            section(elf, buffer, ".debug_str_offsets"),
            endianness,
        )),
        ..Default::default()
    };

    let mut iter = dwarf.units();
    while let Some(header) = iter.next()? {
        let unit = dwarf.unit(header)?;
        let Some(program) = unit.line_program.clone() else {
            continue;
        };

        let mut candidate: Option<(PathBuf, u64)> = None;
        let mut rows = program.rows();
        while let Some((header, row)) = rows.next_row()? {
            // Addresses are monotonic within a sequence; the first row
            // past the address bounds the best candidate.
            if row.address() > addr || row.end_sequence() {
                if row.address() > addr {
                    if let Some(info) = candidate {
                        return Ok(Some(info));
                    }
                }

                candidate = None;
                continue;
            }

            if let Some(line) = row.line() {
                if let Some(file) = path_for_row(&dwarf, &unit, header, row)? {
                    candidate = Some((file, line.get()));
                }
            }
        }
    }

    Ok(None)
}

fn path_for_row(
    dwarf: &Dwarf<Slice<'_>>,
    unit: &Unit<Slice<'_>>,
    header: &LineProgramHeader<Slice<'_>>,
    row: &LineRow,
) -> gimli::Result<Option<PathBuf>> {
    let Some(file) = row.file(header) else {
        return Ok(None);
    };

    let mut path = PathBuf::new();
    if file.directory_index() != 0 {
        if let Some(dir) = file.directory(header) {
            path.push(dwarf.attr_string(unit, dir)?.to_string_lossy().as_ref());
        }
    }

    path.push(
        dwarf
            .attr_string(unit, file.path_name())?
            .to_string_lossy()
            .as_ref(),
    );

    Ok(Some(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::symtab::Table;

    #[no_mangle]
    pub extern "C" fn dwarf_probe() -> u32 {
        42
    }

    fn own_exe() -> String {
        std::env::current_exe()
            .expect("current_exe")
            .to_str()
            .expect("utf-8 path")
            .to_string()
    }

    #[test]
    fn test_missing_module() {
        let mut resolver = Resolver::new();
        assert!(resolver.addr2line("/no/such/module.so", 0x10).is_err());
    }

    #[test]
    fn test_not_object_code() {
        let mut resolver = Resolver::new();
        assert!(resolver.addr2line("/proc/self/cmdline", 0x10).is_err());
    }

    #[test]
    fn test_resolve_own_symbol() {
        let exe = own_exe();
        let table = Table::build(&exe, 0).expect("table");
        let addr = table.name_to_addr("dwarf_probe").expect("probe address");

        let mut resolver = Resolver::new();
        let info = resolver
            .addr2line(&exe, addr)
            .expect("resolver")
            .expect("line info");
        assert!(info.contains(".rs:"), "unexpected location: {info}");
    }

    #[test]
    fn test_cache_is_stable() {
        let exe = own_exe();
        let table = Table::build(&exe, 0).expect("table");
        let addr = table.name_to_addr("dwarf_probe").expect("probe address");

        let mut resolver = Resolver::new();
        let first = resolver.addr2line(&exe, addr).expect("first");
        let second = resolver.addr2line(&exe, addr).expect("second");
        assert_eq!(first, second);
    }

    #[test]
    fn test_unmapped_address() {
        let exe = own_exe();
        let mut resolver = Resolver::new();
        assert!(resolver.addr2line(&exe, 1).expect("resolver").is_none());
    }
}
