//! Rebuilding a compiler invocation from what one unit left behind.
//!
//! The inputs are the unit's root attributes, its line table (which lists
//! every header that contributed declarations or code) and, for units built
//! with `-g3`, its macro table. Units without a macro table fall back on the
//! `-D`/`-U`/`-I` switches the producer banner may have recorded. The output is a `SourceFileRecord`: where the
//! file was compiled, which include directories were the project's own and
//! which were the toolchain's, and which macros the user defined.

use indexmap::{IndexMap, IndexSet};

use crate::dwarf_parser::{CompilationUnit, MainSubprogram};
use crate::line_program::LineTable;
use crate::macros::{bare_name, split_definition, MacroEntry};
use crate::model::{GrepEntry, Language, SourceFileRecord, SourcePosition, Warning};
use crate::path::{clean_path, is_under, join_path, parent};
use crate::producer::Producer;
use crate::settings::DiscoveryOptions;

/// Path fragments of directories that ship with compilers, SDKs and OS
/// distributions. Matched case-insensitively against `dir + "/"`.
const TOOLCHAIN_DIRS: &[&str] = &[
    "/usr/include/",
    "/usr/local/include/",
    "/lib/gcc/",
    "/include/c++/",
    "/lib/clang/",
    ".sdk/",
    "/xcode",
    "sunwspro",
    "/solarisstudio",
    "/developerstudio",
    "/mingw",
    "/cygwin",
];

/// The facts about a unit that reconstruction works from.
#[derive(Clone, Debug, Default)]
pub struct UnitFacts {
    pub offset: u64,
    pub name: Option<String>,
    pub comp_dir: Option<String>,
    pub producer: Producer,
    pub language: Option<Language>,
    pub main: Option<MainSubprogram>,
}

impl From<&CompilationUnit<'_>> for UnitFacts {
    fn from(unit: &CompilationUnit<'_>) -> Self {
        Self {
            offset: unit.offset,
            name: unit.name.clone(),
            comp_dir: unit.comp_dir.clone(),
            producer: unit.compiler.clone(),
            language: unit.language,
            main: unit.main.clone(),
        }
    }
}

/// Everything recovered about one unit.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Reconstruction {
    pub record: SourceFileRecord,
    pub language: Option<Language>,
    pub producer: Producer,
    /// Where `main` is, if this unit defines it.
    pub main: Option<SourcePosition>,
    pub warnings: Vec<Warning>,
}

pub fn reconstruct(
    unit: &CompilationUnit<'_>,
    lines: &LineTable,
    macros: &[MacroEntry],
    options: &DiscoveryOptions,
) -> Reconstruction {
    reconstruct_facts(&UnitFacts::from(unit), lines, macros, options)
}

/// Like `reconstruct`, starting from facts gathered elsewhere.
pub fn reconstruct_facts(
    facts: &UnitFacts,
    lines: &LineTable,
    macros: &[MacroEntry],
    options: &DiscoveryOptions,
) -> Reconstruction {
    let normalizer = &*options.normalizer;
    let comp_dir = facts
        .comp_dir
        .as_deref()
        .map(|d| normalizer.normalize(d))
        .unwrap_or_default();
    let source_name = facts
        .name
        .as_deref()
        .map(|n| normalizer.normalize(n))
        .unwrap_or_default();
    let resolve = |path: &str| clean_path(&join_path(&comp_dir, &normalizer.normalize(path)));
    let primary = resolve(&source_name);

    // Every file the unit mentions, except the primary source. Files that
    // rows refer to come first, in order of use.
    let mut headers = IndexSet::new();
    for index in lines.referenced_files() {
        if let Some(path) = lines.file_path(index) {
            headers.insert(resolve(path));
        }
    }
    for path in lines.files().values() {
        headers.insert(resolve(path));
    }
    for entry in macros {
        if let MacroEntry::StartFile { file, .. } = entry {
            if let Some(path) = lines.file_path(*file) {
                headers.insert(resolve(path));
            }
        }
    }
    headers.retain(|h| *h != primary && !h.is_empty() && !h.starts_with('<'));

    let mut grep = first_macros(lines, macros, &resolve);

    // Header directories, each with the headers seen in it. Recorded `-I`
    // directories come first, in command line order.
    let mut dirs: IndexMap<String, Vec<String>> = IndexMap::new();
    for dir in recorded_includes(&facts.producer) {
        let dir = resolve(dir);
        if !dir.is_empty() {
            dirs.entry(dir).or_default();
        }
    }
    for header in &headers {
        if let Some(dir) = parent(header) {
            dirs.entry(dir.to_string()).or_default().push(header.clone());
        }
    }
    for dir in dirs.keys() {
        if let Some(up) = parent(dir).filter(|up| dirs.contains_key(*up)) {
            let name = dir[up.len()..].trim_start_matches('/').to_string();
            grep.entry(up.to_string()).or_default().includes.push(name);
        }
    }

    let system_roots: Vec<String> = options
        .system_include_paths
        .iter()
        .map(|p| normalizer.normalize(p))
        .collect();
    let mut system: IndexSet<String> = IndexSet::new();
    for (dir, dir_headers) in &dirs {
        let marked = dir_headers.iter().any(|h| {
            grep.get(h)
                .and_then(|e| e.first_macro.as_deref())
                .map_or(false, |m| is_library_marker(m, options))
        });
        if system_roots.iter().any(|root| is_under(dir, root)) || is_toolchain_dir(dir) || marked {
            system.insert(dir.clone());
        }
    }
    // Directories that are included as sub-directories of a system directory
    // (`#include <sys/types.h>`) are system too.
    loop {
        let inherited: Vec<String> = dirs
            .keys()
            .filter(|dir| !system.contains(*dir))
            .filter(|dir| is_included_from(dir, &system, &grep))
            .cloned()
            .collect();
        if inherited.is_empty() {
            break;
        }
        system.extend(inherited);
    }

    let mut warnings = vec![];
    let mut record = SourceFileRecord {
        compilation_dir: comp_dir.clone(),
        source_name,
        ..SourceFileRecord::default()
    };
    for dir in dirs.keys() {
        if system.contains(dir) {
            let top = fold_into_parent(dir, &system, &grep);
            if !record.system_includes.contains(&top) {
                record.system_includes.push(top);
            }
        } else {
            let known = (!comp_dir.is_empty() && is_under(dir, &comp_dir))
                || options
                    .source_root
                    .as_deref()
                    .map_or(false, |root| is_under(dir, &normalizer.normalize(root)));
            if !known {
                tracing::debug!(dir = %dir, "ambiguous include directory");
                warnings.push(Warning::AmbiguousClassification { path: dir.clone() });
            }
            record.user_includes.push(dir.clone());
        }
    }

    let has_table = macros.iter().any(|m| matches!(m, MacroEntry::Define { .. }));
    record.user_macros = if has_table {
        user_macros(macros, options)
    } else {
        recorded_macros(&facts.producer, options)
    };
    record.compile_line = compile_line(&facts.producer, facts.language, &record);

    let main = facts.main.as_ref().and_then(|m| match (&m.decl_file, m.decl_line) {
        (Some(file), Some(line)) => Some(SourcePosition {
            file: resolve(file),
            line,
        }),
        _ => {
            let position = lines.position(m.entry_pc?)?;
            Some(SourcePosition {
                file: resolve(&position.file),
                line: position.line,
            })
        }
    });

    Reconstruction {
        record,
        language: facts.language,
        producer: facts.producer.clone(),
        main,
        warnings,
    }
}

/// Collects the first macro defined in each header.
fn first_macros(
    lines: &LineTable,
    macros: &[MacroEntry],
    resolve: &dyn Fn(&str) -> String,
) -> IndexMap<String, GrepEntry> {
    let mut grep: IndexMap<String, GrepEntry> = IndexMap::new();
    let mut stack: Vec<Option<String>> = vec![];
    for entry in macros {
        match entry {
            MacroEntry::StartFile { file, .. } => {
                stack.push(lines.file_path(*file).map(|p| resolve(p)));
            }
            MacroEntry::EndFile => {
                stack.pop();
            }
            MacroEntry::Define { line, text } => {
                if let Some(Some(file)) = stack.last() {
                    let e = grep.entry(file.clone()).or_default();
                    if e.first_macro.is_none() {
                        e.first_macro = Some(bare_name(split_definition(text).0).to_string());
                        e.first_macro_line = *line;
                    }
                }
            }
            MacroEntry::Undef { .. } => (),
        }
    }
    grep
}

/// Reserved identifiers (`__X`, `_X`) are what C libraries use for their
/// include guards; user code isn't supposed to.
fn is_library_marker(name: &str, options: &DiscoveryOptions) -> bool {
    let mut chars = name.chars();
    let reserved = match (chars.next(), chars.next()) {
        (Some('_'), Some('_')) => true,
        (Some('_'), Some(c)) => c.is_ascii_uppercase(),
        _ => false,
    };
    reserved || options.library_markers.iter().any(|re| re.is_match(name))
}

fn is_toolchain_dir(dir: &str) -> bool {
    let needle = format!("{}/", dir.to_ascii_lowercase());
    TOOLCHAIN_DIRS.iter().any(|marker| needle.contains(marker))
}

fn is_included_from(
    dir: &str,
    system: &IndexSet<String>,
    grep: &IndexMap<String, GrepEntry>,
) -> bool {
    match parent(dir) {
        Some(up) if system.contains(up) => {
            let name = dir[up.len()..].trim_start_matches('/');
            grep.get(up).map_or(false, |e| e.includes.iter().any(|i| i == name))
        }
        _ => false,
    }
}

/// Walks up from a system directory while the parent is a system directory
/// that includes it.
fn fold_into_parent(
    dir: &str,
    system: &IndexSet<String>,
    grep: &IndexMap<String, GrepEntry>,
) -> String {
    let mut top = dir;
    while is_included_from(top, system, grep) {
        match parent(top) {
            Some(up) => top = up,
            None => break,
        }
    }
    top.to_string()
}

/// Macros from the command line, plus those the primary file defines before
/// its first `#include`.
fn user_macros(
    macros: &[MacroEntry],
    options: &DiscoveryOptions,
) -> IndexMap<String, Option<String>> {
    let mut table: IndexMap<String, Option<String>> = IndexMap::new();
    let mut depth = 0;
    for entry in macros {
        match entry {
            MacroEntry::StartFile { .. } => {
                depth += 1;
                if depth > 1 {
                    break;
                }
            }
            MacroEntry::EndFile => {
                if depth <= 1 {
                    break;
                }
                depth -= 1;
            }
            MacroEntry::Define { text, .. } => {
                let (name, value) = split_definition(text);
                if name.is_empty() || options.ignore_macros.contains(name) {
                    continue;
                }
                table.insert(name.to_string(), value.map(str::to_string));
            }
            MacroEntry::Undef { name, .. } => {
                let name = bare_name(name.trim());
                table.retain(|k, _| bare_name(k) != name);
            }
        }
    }
    table
}

/// Macros from the `-D` and `-U` switches in the producer banner, in command
/// line order.
fn recorded_macros(
    producer: &Producer,
    options: &DiscoveryOptions,
) -> IndexMap<String, Option<String>> {
    let mut table: IndexMap<String, Option<String>> = IndexMap::new();
    for flag in &producer.flags {
        if let Some(definition) = flag.strip_prefix("-D") {
            let (name, value) = match definition.split_once('=') {
                Some((name, value)) => (name, Some(value)),
                None => (definition, None),
            };
            if name.is_empty() || options.ignore_macros.contains(name) {
                continue;
            }
            table.insert(name.to_string(), value.map(str::to_string));
        } else if let Some(name) = flag.strip_prefix("-U") {
            let name = bare_name(name);
            table.retain(|k, _| bare_name(k) != name);
        }
    }
    table
}

fn recorded_includes(producer: &Producer) -> impl Iterator<Item = &str> {
    producer
        .flags
        .iter()
        .filter_map(|f| f.strip_prefix("-I"))
        .filter(|dir| !dir.is_empty())
}

fn compile_line(
    producer: &Producer,
    language: Option<Language>,
    record: &SourceFileRecord,
) -> String {
    let driver = producer.family.driver(language);
    if driver.is_none() && producer.flags.is_empty() {
        // Nothing known about how the compiler was invoked.
        return String::new();
    }
    let mut parts: Vec<String> = vec![];
    if let Some(driver) = driver {
        parts.push(driver.to_string());
    }
    parts.extend(
        producer
            .flags
            .iter()
            .filter(|f| !["-D", "-U", "-I"].iter().any(|p| f.starts_with(p)))
            .cloned(),
    );
    for (name, value) in &record.user_macros {
        parts.push(match value {
            Some(value) => format!("-D{}={}", name, value),
            None => format!("-D{}", name),
        });
    }
    for dir in &record.user_includes {
        parts.push(format!("-I{}", dir));
    }
    if !record.source_name.is_empty() {
        parts.push(record.source_name.clone());
    }
    parts
        .iter()
        .map(|p| quote(p))
        .collect::<Vec<_>>()
        .join(" ")
}

fn quote(arg: &str) -> String {
    if arg.contains(|c: char| c.is_whitespace() || c == '"' || c == '\'') {
        format!("\"{}\"", arg.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        arg.to_string()
    }
}
