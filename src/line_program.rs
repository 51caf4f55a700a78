//! Line-number programs: address to (file, line) rows, and the file table.

use std::ops::Range;

use gimli::Reader as _;
use indexmap::{IndexMap, IndexSet};

use crate::dwarf_parser::{attr_string, CompilationUnit, DwarfError, Reader};
use crate::model::{LineTableRow, SourcePosition};

/// The decoded line table of one compile unit.
///
/// Rows are ordered by address: sequences are sorted by start address, rows
/// within a sequence keep program order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LineTable {
    rows: Vec<LineTableRow>,
    /// Row index ranges, one per sequence, each ending with its
    /// `end_sequence` row (unless the program was cut short).
    sequences: Vec<Range<usize>>,
    /// File index to path, as recorded (directory joined, not normalized).
    files: IndexMap<u64, String>,
}

impl LineTable {
    /// Builds a table from already-decoded parts. `rows` must be grouped into
    /// sequences terminated by `end_sequence` rows.
    pub fn from_parts(files: IndexMap<u64, String>, rows: Vec<LineTableRow>) -> Self {
        let mut sequences: Vec<Vec<LineTableRow>> = vec![];
        let mut current = vec![];
        for row in rows {
            let end = row.end_sequence;
            current.push(row);
            if end {
                sequences.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            tracing::warn!("line number program not terminated by end sequence");
            sequences.push(current);
        }
        // Stable, so sequences starting at the same address keep their order.
        sequences.sort_by_key(|s| s[0].address);

        let mut table = Self {
            files,
            ..Self::default()
        };
        for seq in sequences {
            let start = table.rows.len();
            table.rows.extend(seq);
            table.sequences.push(start..table.rows.len());
        }
        table
    }

    pub fn rows(&self) -> &[LineTableRow] {
        &self.rows
    }

    pub fn files(&self) -> &IndexMap<u64, String> {
        &self.files
    }

    pub fn file_path(&self, index: u64) -> Option<&str> {
        self.files.get(&index).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty() && self.files.is_empty()
    }

    /// Finds the row describing `address`: the last statement row at or
    /// before it, within the sequence that covers it.
    pub fn lookup(&self, address: u64) -> Option<&LineTableRow> {
        for seq in &self.sequences {
            let rows = &self.rows[seq.clone()];
            let (first, last) = (rows.first()?, rows.last()?);
            let covers = if last.end_sequence {
                first.address <= address && address < last.address
            } else {
                first.address <= address
            };
            if !covers {
                continue;
            }
            let candidates = rows
                .iter()
                .filter(|r| !r.end_sequence && r.address <= address);
            return candidates
                .clone()
                .filter(|r| r.is_statement)
                .last()
                .or_else(|| candidates.last());
        }
        None
    }

    /// Source position of `address`, with the file path as recorded.
    pub fn position(&self, address: u64) -> Option<SourcePosition> {
        let row = self.lookup(address)?;
        Some(SourcePosition {
            file: self.file_path(row.file_index)?.to_string(),
            line: row.line,
        })
    }

    /// Distinct file indices used by rows, in order of first use.
    pub fn referenced_files(&self) -> Vec<u64> {
        let used: IndexSet<u64> = self
            .rows
            .iter()
            .filter(|r| !r.end_sequence)
            .map(|r| r.file_index)
            .collect();
        used.into_iter().collect()
    }
}

/// Runs the line-number program of `unit`. A unit without one gets an empty
/// table.
pub fn decode_line_program(unit: &CompilationUnit<'_>) -> Result<LineTable, DwarfError> {
    let program = match unit.line_program() {
        Some(program) => program.clone(),
        None => return Ok(LineTable::default()),
    };
    let unit_ref = unit.unit_ref();

    let mut rows = vec![];
    let mut state = program.rows();
    while let Some((_, row)) = state.next_row()? {
        rows.push(LineTableRow {
            file_index: row.file_index(),
            line: row.line().map(|l| l.get()).unwrap_or(0),
            column: match row.column() {
                gimli::ColumnType::LeftEdge => 0,
                gimli::ColumnType::Column(c) => c.get(),
            },
            address: row.address(),
            is_statement: row.is_stmt(),
            end_sequence: row.end_sequence(),
        });
    }

    // Read the file table after running the program, since DW_LNE_define_file
    // can add entries to it.
    let header = state.header();
    let first = if header.version() >= 5 { 0 } else { 1 };
    let mut files = IndexMap::new();
    for (i, file) in header.file_names().iter().enumerate() {
        files.insert(first + i as u64, file_entry_path(unit_ref, header, file)?);
    }

    tracing::trace!(
        offset = unit.offset,
        rows = rows.len(),
        files = files.len(),
        "decoded line program"
    );
    Ok(LineTable::from_parts(files, rows))
}

/// Path of a file table entry, joined onto its directory and then onto the
/// unit's compilation directory as needed.
pub(crate) fn file_entry_path<'s>(
    unit: gimli::UnitRef<'_, Reader<'s>>,
    header: &gimli::LineProgramHeader<Reader<'s>>,
    file: &gimli::FileEntry<Reader<'s>>,
) -> Result<String, DwarfError> {
    let name = attr_string(unit, file.path_name())?;
    let mut path = match file.directory(header) {
        Some(dir) => crate::path::join_path(&attr_string(unit, dir)?, &name),
        None => name,
    };
    if !crate::path::is_absolute(&path) {
        if let Some(comp_dir) = &unit.comp_dir {
            let comp_dir = comp_dir.to_string_lossy()?;
            path = crate::path::join_path(&comp_dir, &path);
        }
    }
    Ok(path)
}
