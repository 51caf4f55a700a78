//! Recovering how a program was built from the debug info it carries.
//!
//! Given an executable, shared library, object file or static archive, this
//! crate reconstructs one `SourceFileRecord` per compile unit: the file that
//! was compiled, the directory it was compiled in, its include paths split
//! into user and system, the user's macro definitions, and an approximate
//! command line. It also reports which shared libraries the artifact loads.
//!
//! The starting points are `discover` for a single file, `discover_folder`
//! for a directory tree, and `source_file_properties` /
//! `source_folder_properties` when only the records are wanted.

pub mod container;
pub mod deps;
pub mod dwarf_parser;
pub mod line_program;
pub mod macros;
pub mod model;
pub mod path;
pub mod producer;
pub mod project;
pub mod reconstruct;
pub mod report;
pub mod settings;

use std::path::{Path, PathBuf};

use indexmap::IndexSet;

use crate::container::{ContainerError, ContainerFormat, ContainerHandle};
use crate::dwarf_parser::{decode_compilation_units, DebugSections, DwarfError};
use crate::model::{Language, SharedLibraries, SourceFileRecord, SourcePosition, Warning};
use crate::producer::Producer;
use crate::settings::DiscoveryOptions;

/// Failures that stop discovery of a file altogether. Anything that goes
/// wrong further in is reported as a `Warning` instead.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error(transparent)]
    Container(#[from] ContainerError),
    #[error("cannot access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Per-unit facts that don't belong in a `SourceFileRecord`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UnitSummary {
    /// Index of the unit's record in `Discovery::records`.
    pub record: usize,
    /// Name of the object file (or archive member) the unit came from.
    pub object: String,
    pub producer: Producer,
    pub language: Option<Language>,
    pub main: Option<SourcePosition>,
}

/// Everything found in one discovery run.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Discovery {
    /// One record per compile unit, in file, member and unit order.
    pub records: Vec<SourceFileRecord>,
    pub units: Vec<UnitSummary>,
    /// Shared libraries of all linked artifacts seen, without duplicates.
    pub dependencies: SharedLibraries,
    pub warnings: Vec<Warning>,
}

impl Discovery {
    fn add_dependencies(&mut self, deps: &SharedLibraries) {
        if deps.is_empty() && deps.search_paths().is_empty() {
            return;
        }
        let mut libraries: IndexSet<String> =
            self.dependencies.libraries().iter().cloned().collect();
        libraries.extend(deps.libraries().iter().cloned());
        let mut search_paths: IndexSet<String> =
            self.dependencies.search_paths().iter().cloned().collect();
        search_paths.extend(deps.search_paths().iter().cloned());
        self.dependencies = SharedLibraries::new(
            libraries.into_iter().collect(),
            search_paths.into_iter().collect(),
        );
    }

    fn warn(&mut self, warning: Warning) {
        tracing::warn!("{}", warning);
        self.warnings.push(warning);
    }
}

/// Discovers a single object file, archive or fat binary.
pub fn discover(
    path: impl AsRef<Path>,
    options: &DiscoveryOptions,
) -> Result<Discovery, DiscoveryError> {
    let mut container = ContainerHandle::open(path)?;
    let discovery = discover_handle(&container, options);
    container.dispose();
    Ok(discovery)
}

/// Discovers an already opened container.
pub fn discover_handle(container: &ContainerHandle, options: &DiscoveryOptions) -> Discovery {
    let mut discovery = Discovery::default();
    discover_into(container, options, &mut discovery);
    discovery
}

fn discover_into(container: &ContainerHandle, options: &DiscoveryOptions, out: &mut Discovery) {
    match container.format() {
        ContainerFormat::Archive => {
            for member in container.members() {
                match container.open_member(member) {
                    Ok(object) => discover_into(&object, options, out),
                    Err(ContainerError::UnrecognizedFormat) => {
                        tracing::debug!(member = %member.name, "skipping non-object member");
                    }
                    Err(e) => out.warn(Warning::UnreadableMember {
                        name: format!("{}({})", container.name(), member.name),
                        reason: e.to_string(),
                    }),
                }
            }
        }
        ContainerFormat::MachOFat => {
            let mut members = container.members().iter();
            if let Some(first) = members.next() {
                match container.open_member(first) {
                    Ok(slice) => discover_into(&slice, options, out),
                    Err(e) => out.warn(Warning::UnreadableMember {
                        name: format!("{}({})", container.name(), first.name),
                        reason: e.to_string(),
                    }),
                }
            }
            for other in members {
                tracing::debug!(arch = %other.name, "ignoring additional architecture");
            }
        }
        _ => {
            if let Err(e) = discover_object(container, options, out) {
                out.warn(Warning::UnreadableMember {
                    name: container.name().to_string(),
                    reason: e.to_string(),
                });
            }
            match deps::read_dependencies(container) {
                Ok(deps) => out.add_dependencies(&deps),
                Err(e) => out.warn(Warning::UnreadableMember {
                    name: container.name().to_string(),
                    reason: format!("dependencies: {}", e),
                }),
            }
        }
    }
}

fn discover_object(
    container: &ContainerHandle,
    options: &DiscoveryOptions,
    out: &mut Discovery,
) -> Result<(), DwarfError> {
    let sections = DebugSections::load(container)?;
    if !sections.has_debug_info() {
        tracing::debug!(name = container.name(), "no debug info");
        return Ok(());
    }

    let mut units = decode_compilation_units(&sections);
    while let Some(unit) = units.next() {
        let unit = match unit {
            Ok(unit) => unit,
            Err(DwarfError::UnsupportedVersion { offset, version }) => {
                out.warn(Warning::UnsupportedDwarfVersion { offset, version });
                continue;
            }
            Err(e) => {
                out.warn(Warning::UnreadableUnit {
                    offset: units.offset(),
                    reason: e.to_string(),
                });
                continue;
            }
        };
        tracing::debug!(
            offset = unit.offset,
            name = ?unit.name,
            producer = ?unit.producer,
            "compile unit"
        );

        let lines = if unit.line_program().is_none() {
            out.warn(Warning::MissingLineProgram { offset: unit.offset });
            Default::default()
        } else {
            match line_program::decode_line_program(&unit) {
                Ok(lines) => lines,
                Err(e) => {
                    out.warn(Warning::UnreadableUnit {
                        offset: unit.offset,
                        reason: format!("line program: {}", e),
                    });
                    Default::default()
                }
            }
        };
        // A damaged macro table still contributes what was read before the
        // damage.
        let macros = macros::decode_macros(&unit, &sections);
        if let Some(e) = &macros.error {
            out.warn(Warning::MalformedMacros {
                offset: unit.offset,
                reason: e.to_string(),
            });
        }

        let result = reconstruct::reconstruct(&unit, &lines, &macros.entries, options);
        for warning in result.warnings {
            out.warn(warning);
        }
        out.units.push(UnitSummary {
            record: out.records.len(),
            object: container.name().to_string(),
            producer: result.producer,
            language: result.language,
            main: result.main,
        });
        out.records.push(result.record);
    }
    Ok(())
}

/// Discovers every object file in a directory, in file name order.
///
/// Files that aren't objects are skipped without comment. Files that look
/// like objects but can't be read produce a warning.
pub fn discover_folder(
    root: impl AsRef<Path>,
    recursive: bool,
    options: &DiscoveryOptions,
) -> Discovery {
    let mut walk = walkdir::WalkDir::new(root).sort_by_file_name();
    if !recursive {
        walk = walk.max_depth(1);
    }

    let mut discovery = Discovery::default();
    let mut objects = 0;
    for entry in walk {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                discovery.warn(Warning::UnreadableMember {
                    name: e
                        .path()
                        .map(|p| p.display().to_string())
                        .unwrap_or_default(),
                    reason: e.to_string(),
                });
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        if options.max_objects.map_or(false, |max| objects >= max) {
            tracing::debug!(objects, "object limit reached");
            break;
        }
        let mut container = match ContainerHandle::open(entry.path()) {
            Ok(container) => container,
            Err(ContainerError::UnrecognizedFormat) => continue,
            Err(e) => {
                discovery.warn(Warning::UnreadableMember {
                    name: entry.path().display().to_string(),
                    reason: e.to_string(),
                });
                continue;
            }
        };
        objects += 1;
        discover_into(&container, options, &mut discovery);
        container.dispose();
    }
    discovery
}

/// Records for the file at `path`, or for the files beneath it when it is a
/// directory.
pub fn source_file_properties(
    path: impl AsRef<Path>,
    recursive: bool,
    options: &DiscoveryOptions,
) -> Result<Vec<SourceFileRecord>, DiscoveryError> {
    let path = path.as_ref();
    let metadata = std::fs::metadata(path).map_err(|source| DiscoveryError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if metadata.is_dir() {
        return Ok(source_folder_properties(path, recursive, options));
    }
    Ok(discover(path, options)?.records)
}

pub fn source_folder_properties(
    root: impl AsRef<Path>,
    recursive: bool,
    options: &DiscoveryOptions,
) -> Vec<SourceFileRecord> {
    discover_folder(root, recursive, options).records
}
