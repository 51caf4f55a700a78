//! Preprocessor macro tables from `.debug_macinfo` (DWARF 2 to 4) and
//! `.debug_macro` (DWARF 5, and the GNU extension of DWARF 4).

use std::collections::{HashMap, HashSet};

use fallible_iterator::FallibleIterator;
use gimli::constants as gim_con;
use gimli::Reader as _;

use crate::dwarf_parser::{
    attr_string, CompilationUnit, DebugSections, DwarfError, MacroTableRef, Reader,
};

// Opcodes shared by both encodings. `.debug_macro` continues the numbering
// where `.debug_macinfo` stops, and the GNU opcodes use the same values.
const END: u8 = 0x00;
const DEFINE: u8 = 0x01;
const UNDEF: u8 = 0x02;
const START_FILE: u8 = 0x03;
const END_FILE: u8 = 0x04;
const DEFINE_STRP: u8 = 0x05;
const UNDEF_STRP: u8 = 0x06;
const IMPORT: u8 = 0x07;
const DEFINE_SUP: u8 = 0x08;
const UNDEF_SUP: u8 = 0x09;
const IMPORT_SUP: u8 = 0x0a;
const DEFINE_STRX: u8 = 0x0b;
const UNDEF_STRX: u8 = 0x0c;
const MACINFO_VENDOR_EXT: u8 = 0xff;

/// One operation of a macro table, with strings resolved.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MacroEntry {
    /// `#define`. `text` is the whole definition, e.g. `MAX(a,b) ((a)>(b)?(a):(b))`.
    Define { line: u64, text: String },
    Undef { line: u64, name: String },
    /// Start of an included file. `file` indexes the unit's line table.
    StartFile { line: u64, file: u64 },
    EndFile,
}

/// Splits a definition into its name and value.
///
/// Function-like macros keep their parameter list in the name. A definition
/// with nothing after the name has no value.
pub fn split_definition(text: &str) -> (&str, Option<&str>) {
    let name_end = text
        .find(|c: char| c == ' ' || c == '\t' || c == '(')
        .unwrap_or(text.len());
    let name_end = if text[name_end..].starts_with('(') {
        match text[name_end..].find(')') {
            Some(close) => name_end + close + 1,
            None => text.len(),
        }
    } else {
        name_end
    };
    let (name, rest) = text.split_at(name_end);
    let value = rest.trim_start_matches(|c| c == ' ' || c == '\t');
    if value.is_empty() {
        (name, None)
    } else {
        (name, Some(value))
    }
}

/// Name of a macro without any parameter list.
pub fn bare_name(name: &str) -> &str {
    name.split('(').next().unwrap_or(name)
}

/// A unit's macro table.
///
/// A table that is damaged part way keeps the entries read before the
/// damage, and `error` says what went wrong.
#[derive(Debug, Default)]
pub struct MacroTable {
    pub entries: Vec<MacroEntry>,
    pub error: Option<DwarfError>,
}

/// Reads the macro table of `unit`. Units without one get an empty table.
///
/// `.debug_macro` imports are inlined where they occur. Each imported table
/// is read at most once per unit, which also breaks import cycles.
pub fn decode_macros<'s>(
    unit: &CompilationUnit<'s>,
    sections: &'s DebugSections<'_>,
) -> MacroTable {
    let mut entries = vec![];
    let result = match unit.macros {
        None => Ok(()),
        Some(MacroTableRef::Macinfo(offset)) => {
            read_macinfo(sections.debug_macinfo(), offset, &mut entries)
                .map_err(|e| malformed(offset, e))
        }
        Some(MacroTableRef::Macro(offset)) => {
            let mut seen = HashSet::new();
            read_macro_table(
                &sections.debug_macro(),
                offset,
                Some(unit.unit_ref()),
                &mut seen,
                &mut entries,
            )
            .map_err(|e| malformed(offset, e))
        }
    };
    MacroTable {
        entries,
        error: result.err(),
    }
}

fn malformed(offset: u64, e: DwarfError) -> DwarfError {
    match e {
        e @ DwarfError::MalformedMacros { .. } => e,
        e => DwarfError::MalformedMacros {
            offset,
            reason: e.to_string(),
        },
    }
}

pub(crate) fn read_macinfo(
    section: Reader<'_>,
    offset: u64,
    out: &mut Vec<MacroEntry>,
) -> Result<(), DwarfError> {
    let mut input = section;
    input.skip(offset as usize)?;
    let mut ops = MacroOps::new(input, offset, None, HashMap::new(), None);
    while let Some(op) = ops.next()? {
        if let Op::Entry(entry) = op {
            out.push(entry);
        }
    }
    Ok(())
}

pub(crate) fn read_macro_table<'s>(
    section: &Reader<'s>,
    offset: u64,
    unit: Option<gimli::UnitRef<'_, Reader<'s>>>,
    seen: &mut HashSet<u64>,
    out: &mut Vec<MacroEntry>,
) -> Result<(), DwarfError> {
    if !seen.insert(offset) {
        tracing::trace!(offset, "macro table already read");
        return Ok(());
    }
    let mut input = section.clone();
    input.skip(offset as usize)?;

    let version = input.read_u16()?;
    if !(4..=5).contains(&version) {
        return Err(DwarfError::MalformedMacros {
            offset,
            reason: format!("unsupported .debug_macro version {}", version),
        });
    }
    let flags = input.read_u8()?;
    let format = if flags & 1 != 0 {
        gimli::Format::Dwarf64
    } else {
        gimli::Format::Dwarf32
    };
    if flags & 2 != 0 {
        // debug_line_offset; the unit already points at its line program.
        input.read_offset(format)?;
    }
    let mut forms = HashMap::new();
    if flags & 4 != 0 {
        let count = input.read_u8()?;
        for _ in 0..count {
            let opcode = input.read_u8()?;
            let arg_count = input.read_uleb128()?;
            let mut args = vec![];
            for _ in 0..arg_count {
                args.push(gimli::DwForm(u16::from(input.read_u8()?)));
            }
            forms.insert(opcode, args);
        }
    }

    let mut ops = MacroOps::new(input, offset, Some(format), forms, unit);
    while let Some(op) = ops.next()? {
        match op {
            Op::Entry(entry) => out.push(entry),
            Op::Import(target) => read_macro_table(section, target, unit, seen, out)?,
            Op::Skipped => (),
        }
    }
    Ok(())
}

enum Op {
    Entry(MacroEntry),
    Import(u64),
    Skipped,
}

/// Raw operations of one macro table, up to its terminating zero.
struct MacroOps<'u, 's> {
    input: Reader<'s>,
    /// Start of the table, for diagnostics.
    offset: u64,
    /// Offset size of a `.debug_macro` table; `None` for `.debug_macinfo`.
    format: Option<gimli::Format>,
    /// Argument forms of vendor opcodes, from the header's opcode table.
    forms: HashMap<u8, Vec<gimli::DwForm>>,
    /// For resolving string offsets and indices. Without a unit those
    /// operations are skipped.
    unit: Option<gimli::UnitRef<'u, Reader<'s>>>,
    done: bool,
}

impl<'u, 's> MacroOps<'u, 's> {
    fn new(
        input: Reader<'s>,
        offset: u64,
        format: Option<gimli::Format>,
        forms: HashMap<u8, Vec<gimli::DwForm>>,
        unit: Option<gimli::UnitRef<'u, Reader<'s>>>,
    ) -> Self {
        Self {
            input,
            offset,
            format,
            forms,
            unit,
            done: false,
        }
    }

    fn read_string(&mut self) -> Result<String, DwarfError> {
        let s = self.input.read_null_terminated_slice()?;
        Ok(s.to_string_lossy()?.into_owned())
    }

    fn resolve(
        &self,
        value: gimli::AttributeValue<Reader<'s>>,
    ) -> Result<Option<String>, DwarfError> {
        match self.unit {
            Some(unit) => Ok(Some(attr_string(unit, value)?)),
            None => Ok(None),
        }
    }

    fn next_macinfo(&mut self, opcode: u8) -> Result<Op, DwarfError> {
        Ok(match opcode {
            DEFINE => {
                let line = self.input.read_uleb128()?;
                Op::Entry(MacroEntry::Define {
                    line,
                    text: self.read_string()?,
                })
            }
            UNDEF => {
                let line = self.input.read_uleb128()?;
                Op::Entry(MacroEntry::Undef {
                    line,
                    name: self.read_string()?,
                })
            }
            START_FILE => {
                let line = self.input.read_uleb128()?;
                let file = self.input.read_uleb128()?;
                Op::Entry(MacroEntry::StartFile { line, file })
            }
            END_FILE => Op::Entry(MacroEntry::EndFile),
            MACINFO_VENDOR_EXT => {
                self.input.read_uleb128()?;
                self.input.read_null_terminated_slice()?;
                Op::Skipped
            }
            other => {
                return Err(DwarfError::MalformedMacros {
                    offset: self.offset,
                    reason: format!("unknown .debug_macinfo opcode 0x{:02x}", other),
                })
            }
        })
    }

    fn next_macro(&mut self, opcode: u8, format: gimli::Format) -> Result<Op, DwarfError> {
        let op = match opcode {
            DEFINE | UNDEF | START_FILE | END_FILE => return self.next_macinfo(opcode),
            DEFINE_STRP | UNDEF_STRP | DEFINE_STRX | UNDEF_STRX => {
                let line = self.input.read_uleb128()?;
                let value = if opcode == DEFINE_STRP || opcode == UNDEF_STRP {
                    let offset = self.input.read_offset(format)?;
                    gimli::AttributeValue::DebugStrRef(gimli::DebugStrOffset(offset))
                } else {
                    let index = self.input.read_uleb128()? as usize;
                    gimli::AttributeValue::DebugStrOffsetsIndex(gimli::DebugStrOffsetsIndex(
                        index,
                    ))
                };
                match self.resolve(value)? {
                    Some(text) if opcode == DEFINE_STRP || opcode == DEFINE_STRX => {
                        Op::Entry(MacroEntry::Define { line, text })
                    }
                    Some(name) => Op::Entry(MacroEntry::Undef { line, name }),
                    None => Op::Skipped,
                }
            }
            IMPORT => Op::Import(self.input.read_offset(format)? as u64),
            DEFINE_SUP | UNDEF_SUP => {
                self.input.read_uleb128()?;
                self.input.read_offset(format)?;
                tracing::debug!("skipping macro from supplementary object file");
                Op::Skipped
            }
            IMPORT_SUP => {
                self.input.read_offset(format)?;
                tracing::debug!("skipping import from supplementary object file");
                Op::Skipped
            }
            other => match self.forms.get(&other).cloned() {
                Some(args) => {
                    for form in args {
                        skip_form(&mut self.input, form, format, self.offset)?;
                    }
                    Op::Skipped
                }
                None => {
                    return Err(DwarfError::MalformedMacros {
                        offset: self.offset,
                        reason: format!("unknown .debug_macro opcode 0x{:02x}", other),
                    })
                }
            },
        };
        Ok(op)
    }
}

impl FallibleIterator for MacroOps<'_, '_> {
    type Item = Op;
    type Error = DwarfError;

    fn next(&mut self) -> Result<Option<Op>, DwarfError> {
        if self.done || self.input.is_empty() {
            return Ok(None);
        }
        let opcode = self.input.read_u8()?;
        if opcode == END {
            self.done = true;
            return Ok(None);
        }
        let op = match self.format {
            None => self.next_macinfo(opcode)?,
            Some(format) => self.next_macro(opcode, format)?,
        };
        Ok(Some(op))
    }
}

/// Steps over one operand of the given form.
fn skip_form(
    input: &mut Reader<'_>,
    form: gimli::DwForm,
    format: gimli::Format,
    table: u64,
) -> Result<(), DwarfError> {
    let fixed = match form {
        gim_con::DW_FORM_flag_present | gim_con::DW_FORM_implicit_const => 0,
        gim_con::DW_FORM_data1
        | gim_con::DW_FORM_ref1
        | gim_con::DW_FORM_flag
        | gim_con::DW_FORM_strx1
        | gim_con::DW_FORM_addrx1 => 1,
        gim_con::DW_FORM_data2
        | gim_con::DW_FORM_ref2
        | gim_con::DW_FORM_strx2
        | gim_con::DW_FORM_addrx2 => 2,
        gim_con::DW_FORM_strx3 | gim_con::DW_FORM_addrx3 => 3,
        gim_con::DW_FORM_data4
        | gim_con::DW_FORM_ref4
        | gim_con::DW_FORM_strx4
        | gim_con::DW_FORM_addrx4 => 4,
        gim_con::DW_FORM_data8 | gim_con::DW_FORM_ref8 | gim_con::DW_FORM_ref_sig8 => 8,
        gim_con::DW_FORM_data16 => 16,
        gim_con::DW_FORM_udata
        | gim_con::DW_FORM_ref_udata
        | gim_con::DW_FORM_strx
        | gim_con::DW_FORM_addrx
        | gim_con::DW_FORM_loclistx
        | gim_con::DW_FORM_rnglistx => {
            input.read_uleb128()?;
            0
        }
        gim_con::DW_FORM_sdata => {
            input.read_sleb128()?;
            0
        }
        gim_con::DW_FORM_string => {
            input.read_null_terminated_slice()?;
            0
        }
        gim_con::DW_FORM_strp
        | gim_con::DW_FORM_line_strp
        | gim_con::DW_FORM_sec_offset
        | gim_con::DW_FORM_strp_sup
        | gim_con::DW_FORM_GNU_strp_alt
        | gim_con::DW_FORM_GNU_ref_alt => {
            input.read_offset(format)?;
            0
        }
        gim_con::DW_FORM_block1 => usize::from(input.read_u8()?),
        gim_con::DW_FORM_block2 => usize::from(input.read_u16()?),
        gim_con::DW_FORM_block4 => input.read_u32()? as usize,
        gim_con::DW_FORM_block | gim_con::DW_FORM_exprloc => input.read_uleb128()? as usize,
        other => {
            return Err(DwarfError::MalformedMacros {
                offset: table,
                reason: format!("cannot skip operand of form {}", other),
            })
        }
    };
    input.skip(fixed)?;
    Ok(())
}
