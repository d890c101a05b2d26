use std::borrow::{self, Cow};
use std::path::{Path, PathBuf};

use object::{Object, ObjectSection};

use crate::symbol::Symbol;

pub type Slice = gimli::EndianSlice<'static, gimli::RunTimeEndian>;
type Unit = gimli::Unit<Slice, usize>;

/// A row of the compiled line table, with the file path rendered so the
/// source file can be opened directly.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct LineEntry {
    pub file: String,
    pub line: u64,
    pub is_stmt: bool,
    pub address: u64,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct FunctionInfo {
    pub name: String,
    pub low_pc: u64,
    pub high_pc: u64,
}

pub struct VariableInfo {
    pub name: String,
    pub location: gimli::Expression<Slice>,
    pub frame_base: Option<gimli::Expression<Slice>>,
    pub encoding: gimli::Encoding,
}

/// The DWARF and ELF views of the tracee's executable, shared by every
/// engine instance debugging that program.
pub struct DebugInfo {
    dwarf: gimli::Dwarf<Slice>,
    symbols: Vec<Symbol>,
}

impl DebugInfo {
    pub fn new(dwarf: gimli::Dwarf<Slice>, symbols: Vec<Symbol>) -> DebugInfo {
        DebugInfo { dwarf, symbols }
    }

    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    /// The enclosing function of `pc`: the compilation unit whose range
    /// contains it, then the subprogram DIE whose range contains it.
    pub fn function_from_pc(&self, pc: u64) -> Result<FunctionInfo, String> {
        let mut units = self.dwarf.units();
        while let Some(header) = units
            .next()
            .map_err(|e| format!("failed to get next dwarf unit: {}", e))?
        {
            let unit = self
                .dwarf
                .unit(header)
                .map_err(|e| format!("failed to construct dwarf unit: {}", e))?;
            if !self.unit_contains(&unit, pc)? {
                continue;
            }

            let mut entries = unit.entries();
            while let Some((_, entry)) = entries
                .next_dfs()
                .map_err(|e| format!("failed to walk dwarf entries: {}", e))?
            {
                if entry.tag() != gimli::DW_TAG_subprogram {
                    continue;
                }
                if self.die_contains(&unit, entry, pc)? {
                    return self.function_info(&unit, entry);
                }
            }
        }

        Err(format!("no function covers address {:#x}", pc))
    }

    /// The nearest line-table row at or below `pc` within its sequence.
    pub fn line_entry_from_pc(&self, pc: u64) -> Result<LineEntry, String> {
        let mut units = self.dwarf.units();
        while let Some(header) = units
            .next()
            .map_err(|e| format!("failed to get next dwarf unit: {}", e))?
        {
            let unit = self
                .dwarf
                .unit(header)
                .map_err(|e| format!("failed to construct dwarf unit: {}", e))?;
            if !self.unit_contains(&unit, pc)? {
                continue;
            }
            if let Some(entry) = self.find_address(&unit, pc)? {
                return Ok(entry);
            }
        }

        Err(format!("no line entry covers address {:#x}", pc))
    }

    /// Rows covering `[low_pc, high_pc)`, in address order.
    pub fn function_line_entries(
        &self,
        low_pc: u64,
        high_pc: u64,
    ) -> Result<Vec<LineEntry>, String> {
        let mut units = self.dwarf.units();
        while let Some(header) = units
            .next()
            .map_err(|e| format!("failed to get next dwarf unit: {}", e))?
        {
            let unit = self
                .dwarf
                .unit(header)
                .map_err(|e| format!("failed to construct dwarf unit: {}", e))?;
            if !self.unit_contains(&unit, low_pc)? {
                continue;
            }

            let mut entries: Vec<LineEntry> = self
                .unit_line_rows(&unit)?
                .into_iter()
                .filter(|entry| entry.address >= low_pc && entry.address < high_pc)
                .collect();
            entries.sort_by_key(|entry| entry.address);
            return Ok(entries);
        }

        Err(format!("no line table covers address {:#x}", low_pc))
    }

    /// Addresses of the first post-prologue line entry of every
    /// subprogram carrying the requested name.
    pub fn prologue_end_addresses(&self, name: &str) -> Result<Vec<u64>, String> {
        let mut addresses = Vec::new();

        let mut units = self.dwarf.units();
        while let Some(header) = units
            .next()
            .map_err(|e| format!("failed to get next dwarf unit: {}", e))?
        {
            let unit = self
                .dwarf
                .unit(header)
                .map_err(|e| format!("failed to construct dwarf unit: {}", e))?;

            let mut rows = None;
            let mut entries = unit.entries();
            while let Some((_, entry)) = entries
                .next_dfs()
                .map_err(|e| format!("failed to walk dwarf entries: {}", e))?
            {
                if entry.tag() != gimli::DW_TAG_subprogram {
                    continue;
                }
                if self.die_name(&unit, entry)? != Some(name) {
                    continue;
                }

                let (low_pc, _) = self.die_pc_range(&unit, entry)?;
                if rows.is_none() {
                    rows = Some(self.unit_line_rows(&unit)?);
                }
                let rows = rows.as_ref().unwrap();
                // the entry row for low_pc, then the next one to skip
                // the prologue
                let position = rows
                    .iter()
                    .position(|row| row.address == low_pc)
                    .or_else(|| {
                        rows.iter().rposition(|row| row.address <= low_pc)
                    });
                if let Some(position) = position {
                    if let Some(row) = rows.get(position + 1) {
                        addresses.push(row.address);
                    }
                }
            }
        }

        Ok(addresses)
    }

    /// Address of the first statement-boundary row matching `line` in the
    /// compilation unit whose name ends with `file`.
    pub fn source_line_address(&self, file: &str, line: u64) -> Result<Option<u64>, String> {
        let mut units = self.dwarf.units();
        while let Some(header) = units
            .next()
            .map_err(|e| format!("failed to get next dwarf unit: {}", e))?
        {
            let unit = self
                .dwarf
                .unit(header)
                .map_err(|e| format!("failed to construct dwarf unit: {}", e))?;

            let unit_name = match unit.name {
                Some(name) => name
                    .to_string()
                    .map_err(|e| format!("failed to parse unit name: {}", e))?,
                None => continue,
            };
            if !Path::new(unit_name).ends_with(file) {
                continue;
            }

            let address = self
                .unit_line_rows(&unit)?
                .into_iter()
                .find(|row| row.is_stmt && row.line == line)
                .map(|row| row.address);
            return Ok(address);
        }

        Ok(None)
    }

    /// The variable DIEs directly under the subprogram enclosing `pc`,
    /// each with its location expression and the subprogram's frame base.
    pub fn variables_in_function(&self, pc: u64) -> Result<Vec<VariableInfo>, String> {
        let mut units = self.dwarf.units();
        while let Some(header) = units
            .next()
            .map_err(|e| format!("failed to get next dwarf unit: {}", e))?
        {
            let unit = self
                .dwarf
                .unit(header)
                .map_err(|e| format!("failed to construct dwarf unit: {}", e))?;
            if !self.unit_contains(&unit, pc)? {
                continue;
            }

            let mut entries = unit.entries();
            while let Some((_, entry)) = entries
                .next_dfs()
                .map_err(|e| format!("failed to walk dwarf entries: {}", e))?
            {
                if entry.tag() != gimli::DW_TAG_subprogram
                    || !self.die_contains(&unit, entry, pc)?
                {
                    continue;
                }

                let frame_base = match entry
                    .attr_value(gimli::DW_AT_frame_base)
                    .map_err(|e| format!("failed to read frame base: {}", e))?
                {
                    Some(gimli::AttributeValue::Exprloc(expression)) => Some(expression),
                    _ => None,
                };
                return self.function_variables(&unit, entry.offset(), frame_base);
            }
        }

        Err(format!("no function covers address {:#x}", pc))
    }

    fn function_variables(
        &self,
        unit: &Unit,
        offset: gimli::UnitOffset,
        frame_base: Option<gimli::Expression<Slice>>,
    ) -> Result<Vec<VariableInfo>, String> {
        let mut tree = unit
            .entries_tree(Some(offset))
            .map_err(|e| format!("failed to get entries tree: {}", e))?;
        let root = tree
            .root()
            .map_err(|e| format!("failed to get root of entries tree: {}", e))?;

        let mut variables = Vec::new();
        let mut children = root.children();
        while let Some(child) = children
            .next()
            .map_err(|e| format!("failed to walk function children: {}", e))?
        {
            let entry = child.entry();
            if entry.tag() != gimli::DW_TAG_variable {
                continue;
            }

            let name = self
                .die_name(unit, entry)?
                .map(str::to_owned)
                .unwrap_or_else(|| "?".to_owned());
            let location = match entry
                .attr_value(gimli::DW_AT_location)
                .map_err(|e| format!("failed to read location of {}: {}", name, e))?
            {
                Some(gimli::AttributeValue::Exprloc(expression)) => expression,
                _ => return Err(format!("unhandled variable location for {}", name)),
            };

            variables.push(VariableInfo {
                name,
                location,
                frame_base: frame_base.clone(),
                encoding: unit.encoding(),
            });
        }

        Ok(variables)
    }

    fn unit_contains(&self, unit: &Unit, pc: u64) -> Result<bool, String> {
        let mut ranges = self
            .dwarf
            .unit_ranges(unit)
            .map_err(|e| format!("failed to get unit ranges: {}", e))?;
        while let Some(range) = ranges
            .next()
            .map_err(|e| format!("failed to walk unit ranges: {}", e))?
        {
            if range.begin <= pc && pc < range.end {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn die_contains(
        &self,
        unit: &Unit,
        entry: &gimli::DebuggingInformationEntry<Slice>,
        pc: u64,
    ) -> Result<bool, String> {
        let mut ranges = self
            .dwarf
            .die_ranges(unit, entry)
            .map_err(|e| format!("failed to get die ranges: {}", e))?;
        while let Some(range) = ranges
            .next()
            .map_err(|e| format!("failed to walk die ranges: {}", e))?
        {
            if range.begin <= pc && pc < range.end {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn die_name(
        &self,
        unit: &Unit,
        entry: &gimli::DebuggingInformationEntry<Slice>,
    ) -> Result<Option<&'static str>, String> {
        let value = match entry
            .attr_value(gimli::DW_AT_name)
            .map_err(|e| format!("failed to get name attribute: {}", e))?
        {
            Some(value) => value,
            None => return Ok(None),
        };
        let name = self
            .dwarf
            .attr_string(unit, value)
            .map_err(|e| format!("failed to load name string: {}", e))?;
        name.to_string()
            .map(Some)
            .map_err(|e| format!("failed to parse name: {}", e))
    }

    fn die_pc_range(
        &self,
        unit: &Unit,
        entry: &gimli::DebuggingInformationEntry<Slice>,
    ) -> Result<(u64, u64), String> {
        let low_pc = match entry
            .attr_value(gimli::DW_AT_low_pc)
            .map_err(|e| format!("failed to get low pc: {}", e))?
        {
            Some(gimli::AttributeValue::Addr(addr)) => addr,
            _ => Err("die has no low pc address")?,
        };
        let high_pc = match entry
            .attr(gimli::DW_AT_high_pc)
            .map_err(|e| format!("failed to get high pc: {}", e))?
        {
            Some(attr) => match attr.value() {
                gimli::AttributeValue::Addr(addr) => addr,
                // a constant form is an offset from low pc
                _ => match attr.udata_value() {
                    Some(size) => low_pc + size,
                    None => Err("die has no high pc")?,
                },
            },
            None => Err("die has no high pc")?,
        };
        Ok((low_pc, high_pc))
    }

    fn function_info(
        &self,
        unit: &Unit,
        entry: &gimli::DebuggingInformationEntry<Slice>,
    ) -> Result<FunctionInfo, String> {
        let name = self
            .die_name(unit, entry)?
            .map(str::to_owned)
            .unwrap_or_else(|| "?".to_owned());
        let (low_pc, high_pc) = self.die_pc_range(unit, entry)?;
        Ok(FunctionInfo { name, low_pc, high_pc })
    }

    // find_address over one unit's line program: the last row at or below
    // pc, valid only while pc stays inside the row's sequence.
    fn find_address(&self, unit: &Unit, pc: u64) -> Result<Option<LineEntry>, String> {
        let program = match unit.line_program.clone() {
            Some(program) => program,
            None => return Ok(None),
        };

        let mut candidate: Option<LineEntry> = None;
        let mut rows = program.rows();
        while let Some((header, row)) = rows
            .next_row()
            .map_err(|e| format!("failed to get next line table row: {}", e))?
        {
            if row.end_sequence() {
                if let Some(entry) = candidate.take() {
                    if pc < row.address() {
                        return Ok(Some(entry));
                    }
                }
                continue;
            }

            if row.address() > pc {
                if let Some(entry) = candidate.take() {
                    return Ok(Some(entry));
                }
            } else {
                candidate = Some(self.line_entry(unit, header, row)?);
            }
        }

        Ok(None)
    }

    fn unit_line_rows(&self, unit: &Unit) -> Result<Vec<LineEntry>, String> {
        let program = match unit.line_program.clone() {
            Some(program) => program,
            None => return Ok(Vec::new()),
        };

        let mut entries = Vec::new();
        let mut rows = program.rows();
        while let Some((header, row)) = rows
            .next_row()
            .map_err(|e| format!("failed to get next line table row: {}", e))?
        {
            if row.end_sequence() {
                continue;
            }
            entries.push(self.line_entry(unit, header, row)?);
        }

        Ok(entries)
    }

    fn line_entry(
        &self,
        unit: &Unit,
        header: &gimli::LineProgramHeader<Slice>,
        row: &gimli::LineRow,
    ) -> Result<LineEntry, String> {
        Ok(LineEntry {
            file: self.render_file(unit, header, row)?,
            line: row.line().map(u64::from).unwrap_or(0),
            is_stmt: row.is_stmt(),
            address: row.address(),
        })
    }

    fn render_file(
        &self,
        unit: &Unit,
        header: &gimli::LineProgramHeader<Slice>,
        row: &gimli::LineRow,
    ) -> Result<String, String> {
        let file = header
            .file(row.file_index())
            .ok_or_else(|| format!("no file entry for index {}", row.file_index()))?;

        let mut path = PathBuf::new();
        if let Some(comp_dir) = unit.comp_dir {
            path.push(
                comp_dir
                    .to_string()
                    .map_err(|e| format!("failed to parse comp dir: {}", e))?,
            );
        }
        if let Some(directory) = file.directory(header) {
            let directory = self
                .dwarf
                .attr_string(unit, directory)
                .map_err(|e| format!("failed to load directory string: {}", e))?;
            let directory = directory
                .to_string()
                .map_err(|e| format!("failed to parse directory: {}", e))?;
            if directory.starts_with('/') {
                path = PathBuf::from(directory);
            } else {
                path.push(directory);
            }
        }
        let name = self
            .dwarf
            .attr_string(unit, file.path_name())
            .map_err(|e| format!("failed to load file name string: {}", e))?;
        path.push(
            name.to_string()
                .map_err(|e| format!("failed to parse file name: {}", e))?,
        );

        Ok(path.to_string_lossy().into_owned())
    }
}

pub fn load_dwarf(
    object: &object::File<'static>,
) -> Result<(gimli::Dwarf<Cow<'static, [u8]>>, gimli::RunTimeEndian), String> {
    let load_section = |id: gimli::SectionId| -> Result<borrow::Cow<'static, [u8]>, gimli::Error> {
        match object.section_by_name(id.name()) {
            Some(ref section) => Ok(section
                .uncompressed_data()
                .unwrap_or(borrow::Cow::Borrowed(&[][..]))),
            None => Ok(borrow::Cow::Borrowed(&[][..])),
        }
    };

    let endian = if object.is_little_endian() {
        gimli::RunTimeEndian::Little
    } else {
        gimli::RunTimeEndian::Big
    };

    Ok((
        gimli::Dwarf::load(&load_section).map_err(|e| format!("failed to load dwarf: {}", e))?,
        endian,
    ))
}

pub fn borrow_sections(
    dwarf: &'static gimli::Dwarf<Cow<'static, [u8]>>,
    endian: gimli::RunTimeEndian,
) -> gimli::Dwarf<Slice> {
    let borrow_section: &dyn for<'b> Fn(
        &'b borrow::Cow<'b, [u8]>,
    ) -> gimli::EndianSlice<'b, gimli::RunTimeEndian> =
        &|section| gimli::EndianSlice::new(section, endian);

    dwarf.borrow(borrow_section)
}
