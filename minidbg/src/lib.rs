pub mod advice;
pub mod breakpoint;
pub mod command;
pub mod debugger;
pub mod dwarf;
pub mod expr;
pub mod memory;
pub mod reg;
pub mod symbol;

use std::borrow::Cow;
use std::fs;

pub use advice::BatchDriver;
pub use debugger::Debugger;
pub use dwarf::DebugInfo;

/// Loads the ELF and DWARF views of `program_path`. The mapped file and
/// the section data live for the rest of the process so every engine
/// instance of a batch can share one view.
pub fn load_program(program_path: &str) -> Result<DebugInfo, String> {
    let file = fs::File::open(program_path)
        .map_err(|e| format!("failed to open file {}: {}", program_path, e))?;
    let mmap =
        unsafe { memmap::Mmap::map(&file).map_err(|e| format!("failed to mmap file: {}", e))? };
    let mmap: &'static memmap::Mmap = Box::leak(Box::new(mmap));

    let object = object::File::parse(&mmap[..])
        .map_err(|e| format!("failed to parse object file: {}", e))?;
    let symbols = symbol::extract_symbols(&object);

    let (dwarf, endian) = dwarf::load_dwarf(&object)?;
    let dwarf: &'static gimli::Dwarf<Cow<'static, [u8]>> = Box::leak(Box::new(dwarf));

    Ok(DebugInfo::new(dwarf::borrow_sections(dwarf, endian), symbols))
}
