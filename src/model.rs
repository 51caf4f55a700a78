//! Data model types.
//!
//! This is our abstract description of what a build looked like, as far as it
//! can be recovered from the binaries it produced.

use indexmap::IndexMap;

/// Source language of a compilation unit, from `DW_AT_language`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Language {
    C,
    Cpp,
    Fortran,
    Assembler,
    /// Any other `DW_LANG_*` code, kept so it can be reported.
    Other(u16),
}

impl Language {
    pub fn from_dw_lang(lang: gimli::DwLang) -> Self {
        match lang {
            gimli::DW_LANG_C89
            | gimli::DW_LANG_C
            | gimli::DW_LANG_C99
            | gimli::DW_LANG_C11
            // DW_LANG_C17
            | gimli::DwLang(0x2c) => Self::C,
            gimli::DW_LANG_C_plus_plus
            | gimli::DW_LANG_C_plus_plus_03
            | gimli::DW_LANG_C_plus_plus_11
            | gimli::DW_LANG_C_plus_plus_14
            // DW_LANG_C_plus_plus_17, DW_LANG_C_plus_plus_20
            | gimli::DwLang(0x2a)
            | gimli::DwLang(0x2b) => Self::Cpp,
            gimli::DW_LANG_Fortran77
            | gimli::DW_LANG_Fortran90
            | gimli::DW_LANG_Fortran95
            | gimli::DW_LANG_Fortran03
            | gimli::DW_LANG_Fortran08
            // DW_LANG_Fortran18
            | gimli::DwLang(0x2d) => Self::Fortran,
            gimli::DW_LANG_Mips_Assembler => Self::Assembler,
            other => Self::Other(other.0),
        }
    }

    /// Short name, as used in reports and project items.
    pub fn name(&self) -> String {
        match self {
            Self::C => "c".to_string(),
            Self::Cpp => "c++".to_string(),
            Self::Fortran => "fortran".to_string(),
            Self::Assembler => "assembler".to_string(),
            Self::Other(code) => format!("0x{:04x}", code),
        }
    }
}

/// A file and line in the original sources.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct SourcePosition {
    /// Normalized path of the file.
    pub file: String,
    /// One-based line number.
    pub line: u64,
}

/// One row of a decoded line-number program.
///
/// Line and column are zero when the program didn't attribute the address to
/// a line (e.g. compiler-generated code).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct LineTableRow {
    /// Index into the unit's file table. Interpretation depends on the DWARF
    /// version; resolve it through `LineTable::file_path`.
    pub file_index: u64,
    pub line: u64,
    pub column: u64,
    /// Address of the first instruction covered by this row.
    pub address: u64,
    /// Whether this is a recommended breakpoint location.
    pub is_statement: bool,
    /// Marks the first address past the end of a sequence. The row carries no
    /// source position of its own.
    pub end_sequence: bool,
}

/// A reconstructed translation unit: which file was compiled, where, and with
/// which user-relevant preprocessor settings.
///
/// Equality is structural, which is what makes the in-process and subprocess
/// results comparable.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SourceFileRecord {
    /// Compilation directory, normalized.
    pub compilation_dir: String,
    /// Source file name as recorded by the compiler, normalized. May be
    /// relative to `compilation_dir`.
    pub source_name: String,
    /// Include paths that belong to the project, in discovery order.
    pub user_includes: Vec<String>,
    /// Include paths that belong to the toolchain or the platform.
    pub system_includes: Vec<String>,
    /// User macro definitions. A `None` value is a define without a value,
    /// e.g. `-DNDEBUG`.
    pub user_macros: IndexMap<String, Option<String>>,
    /// Best-effort equivalent command line. May be empty.
    pub compile_line: String,
}

impl SourceFileRecord {
    /// Full path of the compiled file: the source name resolved against the
    /// compilation directory.
    pub fn full_path(&self) -> String {
        crate::path::clean_path(&crate::path::join_path(
            &self.compilation_dir,
            &self.source_name,
        ))
    }
}

/// Libraries an artifact links against dynamically.
///
/// Built once by `deps::read_dependencies` and immutable afterwards.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SharedLibraries {
    libraries: Vec<String>,
    search_paths: Vec<String>,
}

impl SharedLibraries {
    pub fn new(libraries: Vec<String>, search_paths: Vec<String>) -> Self {
        Self {
            libraries,
            search_paths,
        }
    }

    /// Library names in the order the artifact declares them.
    pub fn libraries(&self) -> &[String] {
        &self.libraries
    }

    /// Run-time search paths (`DT_RUNPATH`, `LC_RPATH`, ...).
    pub fn search_paths(&self) -> &[String] {
        &self.search_paths
    }

    pub fn is_empty(&self) -> bool {
        self.libraries.is_empty()
    }
}

/// What we know about one include directory (or one header) when deciding
/// whether it belongs to the user or to the system.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct GrepEntry {
    /// Sub-directory names observed beneath this directory, e.g. `sys` and
    /// `bits` for `/usr/include`.
    pub includes: Vec<String>,
    /// First macro defined in the header, usually its include guard.
    pub first_macro: Option<String>,
    /// Line of `first_macro` within the header.
    pub first_macro_line: u64,
}

/// Something that went wrong without stopping discovery.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Warning {
    /// A header directory could not be confidently placed into user or
    /// system includes. It was treated as user.
    AmbiguousClassification { path: String },
    /// A compilation unit could not be decoded and was skipped.
    UnreadableUnit { offset: u64, reason: String },
    /// A compilation unit uses a DWARF version outside 2..=5.
    UnsupportedDwarfVersion { offset: u64, version: u16 },
    /// A unit has no line-number program, so no headers were found for it.
    MissingLineProgram { offset: u64 },
    /// The macro table of a unit could not be read completely.
    MalformedMacros { offset: u64, reason: String },
    /// An archive member or a file in a folder could not be processed.
    UnreadableMember { name: String, reason: String },
}

impl std::fmt::Display for Warning {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::AmbiguousClassification { path } => {
                write!(f, "cannot classify include directory {}", path)
            }
            Self::UnreadableUnit { offset, reason } => {
                write!(f, "unit at <.debug_info+0x{:08x}> unreadable: {}", offset, reason)
            }
            Self::UnsupportedDwarfVersion { offset, version } => write!(
                f,
                "unit at <.debug_info+0x{:08x}> uses unsupported DWARF version {}",
                offset, version
            ),
            Self::MissingLineProgram { offset } => write!(
                f,
                "unit at <.debug_info+0x{:08x}> has no line program",
                offset
            ),
            Self::MalformedMacros { offset, reason } => write!(
                f,
                "macros of unit at <.debug_info+0x{:08x}> malformed: {}",
                offset, reason
            ),
            Self::UnreadableMember { name, reason } => {
                write!(f, "{}: {}", name, reason)
            }
        }
    }
}
