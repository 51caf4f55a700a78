//! Forward-only decoding of compilation units (the part gimli leaves to us).
//!
//! `DebugSections` holds the raw DWARF sections of one container, with any
//! relocations the container carries for them. `decode_compilation_units`
//! walks `.debug_info` one unit header at a time, reading the root DIE of
//! each compile unit and searching its tree for `main`.

use std::borrow::Cow;
use std::fmt;
use std::rc::Rc;

use gimli::constants as gim_con;
use gimli::{Reader as _, Section as _};
use object::{Object, ObjectSection};

use crate::container::{ContainerError, ContainerHandle};
use crate::model::Language;
use crate::producer::Producer;

/// Relocations for one section, adapted so gimli can apply them while
/// reading. Only relocatable objects have any.
#[derive(Debug, Default)]
pub struct RelocationMap(object::read::RelocationMap);

impl<'a> gimli::read::Relocate for &'a RelocationMap {
    fn relocate_address(&self, offset: usize, value: u64) -> gimli::Result<u64> {
        Ok(self.0.relocate(offset as u64, value))
    }

    fn relocate_offset(&self, offset: usize, value: usize) -> gimli::Result<usize> {
        <usize as gimli::ReaderOffset>::from_u64(self.0.relocate(offset as u64, value as u64))
    }
}

/// Section contents, borrowed from the container when stored uncompressed.
#[derive(Debug, Default)]
pub struct SectionData<'data> {
    data: Cow<'data, [u8]>,
    relocations: RelocationMap,
}

/// The reader every decoder in this crate works with.
pub type Reader<'a> =
    gimli::RelocateReader<gimli::EndianSlice<'a, gimli::RunTimeEndian>, &'a RelocationMap>;

#[derive(Debug, thiserror::Error)]
pub enum DwarfError {
    #[error("DWARF error: {0}")]
    Gimli(#[from] gimli::Error),
    #[error(
        "unit at <.debug_info+0x{offset:08x}> uses DWARF version {version}, \
         only 2 to 5 are supported"
    )]
    UnsupportedVersion { offset: u64, version: u16 },
    #[error(transparent)]
    Container(#[from] ContainerError),
    #[error("malformed macro table at offset 0x{offset:x}: {reason}")]
    MalformedMacros { offset: u64, reason: String },
}

/// All DWARF sections of one container.
pub struct DebugSections<'data> {
    sections: gimli::DwarfSections<SectionData<'data>>,
    debug_macinfo: SectionData<'data>,
    debug_macro: SectionData<'data>,
    endian: gimli::RunTimeEndian,
}

impl<'data> DebugSections<'data> {
    /// Loads the debug sections of a plain object file. Compressed sections
    /// are inflated; everything else is borrowed from the container.
    pub fn load(container: &'data ContainerHandle) -> Result<Self, DwarfError> {
        let object = container.object()?;
        let endian = container.endianness();

        let sections = gimli::DwarfSections::load(|id| load_section(&object, id.name()))?;
        let debug_macinfo = load_section(&object, ".debug_macinfo")?;
        let debug_macro = load_section(&object, ".debug_macro")?;

        Ok(Self {
            sections,
            debug_macinfo,
            debug_macro,
            endian,
        })
    }

    /// Whether the container has any debug info to decode.
    pub fn has_debug_info(&self) -> bool {
        !self.dwarf().debug_info.reader().is_empty()
    }

    pub(crate) fn dwarf(&self) -> gimli::Dwarf<Reader<'_>> {
        self.sections
            .borrow(|section| borrow_section(section, self.endian))
    }

    pub(crate) fn debug_macinfo(&self) -> Reader<'_> {
        borrow_section(&self.debug_macinfo, self.endian)
    }

    pub(crate) fn debug_macro(&self) -> Reader<'_> {
        borrow_section(&self.debug_macro, self.endian)
    }
}

fn load_section<'data>(
    object: &object::File<'data>,
    name: &str,
) -> Result<SectionData<'data>, DwarfError> {
    let section = match object.section_by_name(name) {
        Some(section) => section,
        None => return Ok(SectionData::default()),
    };
    let data = section.uncompressed_data().map_err(ContainerError::from)?;
    let relocations = match section.relocation_map() {
        Ok(map) => RelocationMap(map),
        Err(e) => {
            // Fully linked images carry no relocations for debug sections, so
            // this only loses precision for odd relocatable objects.
            tracing::warn!(section = name, error = %e, "ignoring relocations");
            RelocationMap::default()
        }
    };
    Ok(SectionData { data, relocations })
}

fn borrow_section<'a>(
    section: &'a SectionData<'_>,
    endian: gimli::RunTimeEndian,
) -> Reader<'a> {
    let slice = gimli::EndianSlice::new(Cow::as_ref(&section.data), endian);
    gimli::RelocateReader::new(slice, &section.relocations)
}

/// Where a unit's macro table lives.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MacroTableRef {
    /// `DW_AT_macro_info`: offset into `.debug_macinfo`.
    Macinfo(u64),
    /// `DW_AT_macros` or `DW_AT_GNU_macros`: offset into `.debug_macro`.
    Macro(u64),
}

/// The `main` subprogram of a unit.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MainSubprogram {
    pub name: String,
    pub entry_pc: Option<u64>,
    /// Declaring file, as recorded (not normalized).
    pub decl_file: Option<String>,
    pub decl_line: Option<u64>,
}

/// One decoded compile unit.
///
/// The gimli unit is retained so the line program and macro table can be
/// decoded on demand.
pub struct CompilationUnit<'s> {
    /// Offset of the unit header in `.debug_info`.
    pub offset: u64,
    pub name: Option<String>,
    pub comp_dir: Option<String>,
    pub producer: Option<String>,
    pub compiler: Producer,
    pub version: u16,
    pub address_size: u8,
    pub language: Option<Language>,
    pub low_pc: Option<u64>,
    pub high_pc: Option<u64>,
    /// Offset of the root DIE in `.debug_info`.
    pub root_offset: u64,
    pub main: Option<MainSubprogram>,
    pub macros: Option<MacroTableRef>,
    dwarf: Rc<gimli::Dwarf<Reader<'s>>>,
    unit: gimli::Unit<Reader<'s>>,
}

impl<'s> CompilationUnit<'s> {
    pub fn unit_ref(&self) -> gimli::UnitRef<'_, Reader<'s>> {
        self.unit.unit_ref(&self.dwarf)
    }

    pub fn line_program(&self) -> Option<&gimli::IncompleteLineProgram<Reader<'s>>> {
        self.unit.line_program.as_ref()
    }
}

impl fmt::Debug for CompilationUnit<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompilationUnit")
            .field("offset", &self.offset)
            .field("name", &self.name)
            .field("comp_dir", &self.comp_dir)
            .field("producer", &self.producer)
            .field("version", &self.version)
            .field("language", &self.language)
            .field("low_pc", &self.low_pc)
            .field("high_pc", &self.high_pc)
            .field("main", &self.main)
            .field("macros", &self.macros)
            .finish()
    }
}

/// Starts a forward-only walk over the compile units in `sections`.
pub fn decode_compilation_units<'s>(sections: &'s DebugSections<'_>) -> CompilationUnits<'s> {
    let dwarf = sections.dwarf();
    let len = dwarf.debug_info.reader().len();
    CompilationUnits {
        dwarf: Rc::new(dwarf),
        next_offset: 0,
        current: 0,
        len,
        done: false,
    }
}

/// Iterator over compile units. See `decode_compilation_units`.
///
/// A unit that can't be decoded produces an `Err` and the walk moves on to
/// the next header. A header that can't be parsed ends the walk, since the
/// position of the following unit is unknown.
pub struct CompilationUnits<'s> {
    dwarf: Rc<gimli::Dwarf<Reader<'s>>>,
    next_offset: usize,
    /// Offset of the unit last attempted.
    current: usize,
    len: usize,
    done: bool,
}

impl<'s> Iterator for CompilationUnits<'s> {
    type Item = Result<CompilationUnit<'s>, DwarfError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done && self.next_offset < self.len {
            let offset = self.next_offset;
            self.current = offset;
            let header = match self
                .dwarf
                .debug_info
                .header_from_offset(gimli::DebugInfoOffset(offset))
            {
                Ok(header) => header,
                Err(gimli::Error::UnknownVersion(version)) => {
                    match self.unit_length(offset) {
                        Ok(length) => self.next_offset = offset + length,
                        Err(_) => self.done = true,
                    }
                    return Some(Err(DwarfError::UnsupportedVersion {
                        offset: offset as u64,
                        version: version as u16,
                    }));
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e.into()));
                }
            };
            self.next_offset = offset + header.length_including_self();

            match header.type_() {
                gimli::UnitType::Compilation => (),
                other => {
                    tracing::trace!(offset, ?other, "skipping non-compile unit");
                    continue;
                }
            }
            match decode_unit(&self.dwarf, header, offset as u64) {
                Ok(Some(unit)) => return Some(Ok(unit)),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
        None
    }
}

impl CompilationUnits<'_> {
    /// Offset in `.debug_info` of the unit the last item came from.
    pub fn offset(&self) -> u64 {
        self.current as u64
    }

    /// Reads the length of the unit at `offset`, for stepping over units
    /// whose header we can't otherwise parse.
    fn unit_length(&self, offset: usize) -> Result<usize, gimli::Error> {
        let mut input = self.dwarf.debug_info.reader().clone();
        input.skip(offset)?;
        let before = input.len();
        let (length, _format) = input.read_initial_length()?;
        Ok(before - input.len() + length)
    }
}

fn decode_unit<'s>(
    dwarf: &Rc<gimli::Dwarf<Reader<'s>>>,
    header: gimli::UnitHeader<Reader<'s>>,
    offset: u64,
) -> Result<Option<CompilationUnit<'s>>, DwarfError> {
    let version = header.version();
    let address_size = header.address_size();
    let unit = dwarf.unit(header)?;
    let unit_ref = unit.unit_ref(dwarf);

    let mut name = None;
    let mut comp_dir = None;
    let mut producer = None;
    let mut language = None;
    let mut low_pc = None;
    let mut high_pc = None;
    let mut high_pc_offset = None;
    let mut macros = None;

    let mut cursor = unit.entries();
    let (_, root) = match cursor.next_dfs()? {
        Some(entry) => entry,
        None => return Ok(None),
    };
    if root.tag() != gim_con::DW_TAG_compile_unit {
        // Partial units carry no translation unit of their own.
        return Ok(None);
    }
    let root_offset = root
        .offset()
        .to_debug_info_offset(&unit.header)
        .map(|o| o.0 as u64)
        .unwrap_or(offset);

    let mut attrs = root.attrs();
    while let Some(attr) = attrs.next()? {
        match attr.name() {
            gim_con::DW_AT_name => {
                name = Some(attr_string(unit_ref, attr.value())?);
            }
            gim_con::DW_AT_comp_dir => {
                comp_dir = Some(attr_string(unit_ref, attr.value())?);
            }
            gim_con::DW_AT_producer => {
                producer = Some(attr_string(unit_ref, attr.value())?);
            }
            gim_con::DW_AT_language => {
                if let gimli::AttributeValue::Language(lang) = attr.value() {
                    language = Some(Language::from_dw_lang(lang));
                }
            }
            gim_con::DW_AT_low_pc => {
                low_pc = unit_ref.attr_address(attr.value())?;
            }
            gim_con::DW_AT_high_pc => match attr.value() {
                gimli::AttributeValue::Addr(a) => high_pc = Some(a),
                gimli::AttributeValue::DebugAddrIndex(_) => {
                    high_pc = unit_ref.attr_address(attr.value())?;
                }
                v => high_pc_offset = v.udata_value(),
            },
            gim_con::DW_AT_macro_info => {
                macros = section_offset(attr.value()).map(MacroTableRef::Macinfo);
            }
            gim_con::DW_AT_macros | gim_con::DW_AT_GNU_macros => {
                macros = section_offset(attr.value()).map(MacroTableRef::Macro);
            }
            _ => (),
        }
    }
    if let (Some(low), Some(delta)) = (low_pc, high_pc_offset) {
        high_pc = Some(low.wrapping_add(delta));
    }

    let main = find_main(unit_ref, &mut cursor)?;

    let compiler = producer.as_deref().map(Producer::parse).unwrap_or_default();
    tracing::debug!(
        offset,
        name = name.as_deref().unwrap_or("?"),
        version,
        "decoded compile unit"
    );

    Ok(Some(CompilationUnit {
        offset,
        name,
        comp_dir,
        producer,
        compiler,
        version,
        address_size,
        language,
        low_pc,
        high_pc,
        root_offset,
        main,
        macros,
        dwarf: Rc::clone(dwarf),
        unit,
    }))
}

/// Walks the rest of the unit looking for the definition of `main`.
fn find_main<'s>(
    unit: gimli::UnitRef<'_, Reader<'s>>,
    cursor: &mut gimli::EntriesCursor<'_, '_, Reader<'s>>,
) -> Result<Option<MainSubprogram>, DwarfError> {
    while let Some((_, entry)) = cursor.next_dfs()? {
        if entry.tag() != gim_con::DW_TAG_subprogram {
            continue;
        }
        let mut name = None;
        let mut is_main = false;
        let mut declaration = false;
        let mut main = MainSubprogram::default();

        let mut attrs = entry.attrs();
        while let Some(attr) = attrs.next()? {
            match attr.name() {
                gim_con::DW_AT_name => {
                    let n = attr_string(unit, attr.value())?;
                    is_main |= n == "main";
                    name = Some(n);
                }
                gim_con::DW_AT_linkage_name | gim_con::DW_AT_MIPS_linkage_name => {
                    let n = attr_string(unit, attr.value())?;
                    is_main |= n == "main" || n == "_main";
                }
                gim_con::DW_AT_declaration => {
                    declaration = matches!(attr.value(), gimli::AttributeValue::Flag(true));
                }
                gim_con::DW_AT_low_pc | gim_con::DW_AT_entry_pc => {
                    if main.entry_pc.is_none() {
                        main.entry_pc = unit.attr_address(attr.value())?;
                    }
                }
                gim_con::DW_AT_decl_file => {
                    if let gimli::AttributeValue::FileIndex(f) = attr.value() {
                        main.decl_file = decl_file_path(unit, f)?;
                    }
                }
                gim_con::DW_AT_decl_line => {
                    main.decl_line = attr.value().udata_value();
                }
                _ => (),
            }
        }

        if is_main && !declaration {
            main.name = name.unwrap_or_else(|| "main".to_string());
            return Ok(Some(main));
        }
    }
    Ok(None)
}

fn decl_file_path(
    unit: gimli::UnitRef<'_, Reader<'_>>,
    index: u64,
) -> Result<Option<String>, DwarfError> {
    let program = match &unit.line_program {
        Some(program) => program,
        None => {
            tracing::debug!("decl_file without line program");
            return Ok(None);
        }
    };
    let header = program.header();
    match header.file(index) {
        Some(file) => Ok(Some(crate::line_program::file_entry_path(unit, header, file)?)),
        None => {
            tracing::debug!(index, "invalid file index");
            Ok(None)
        }
    }
}

fn section_offset(value: gimli::AttributeValue<Reader<'_>>) -> Option<u64> {
    match value {
        gimli::AttributeValue::DebugMacinfoRef(o) => Some(o.0 as u64),
        gimli::AttributeValue::DebugMacroRef(o) => Some(o.0 as u64),
        gimli::AttributeValue::SecOffset(o) => Some(o as u64),
        v => v.udata_value(),
    }
}

/// Resolves any string-valued attribute form to an owned string.
pub(crate) fn attr_string<'s>(
    unit: gimli::UnitRef<'_, Reader<'s>>,
    value: gimli::AttributeValue<Reader<'s>>,
) -> Result<String, DwarfError> {
    let r = unit.attr_string(value)?;
    Ok(r.to_string_lossy()?.into_owned())
}
