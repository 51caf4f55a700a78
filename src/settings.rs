//! Configuration of a discovery run.
//!
//! Everything the engine needs to know about the caller's world is captured
//! in a `DiscoveryOptions` value up front. The collaborator traits are only
//! queried while building one.

use std::io;
use std::path::Path;

use indexmap::IndexMap;
use regex::Regex;

use crate::macros::{bare_name, split_definition};
use crate::model::Language;
use crate::path::{CygwinPaths, PathNormalizer, PosixPaths, WindowsPaths};

/// The project a binary belongs to.
pub trait ProjectProxy {
    fn source_root(&self) -> Option<String>;
    fn executable(&self) -> Option<String>;
    fn working_folder(&self) -> Option<String>;
    fn resolve_symbolic_links(&self) -> bool;
}

/// Flavor of the toolchain configured for a project.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum CompileFlavor {
    #[default]
    Gnu,
    Clang,
    SunStudio,
    MinGw,
    Cygwin,
}

/// What the configured toolchain predefines.
pub trait CompilerSettings {
    /// Predefined macros, each `NAME` or `NAME=VALUE`.
    fn system_macro_definitions(&self, language: Language) -> Vec<String>;
    fn system_include_paths(&self, language: Language) -> Vec<String>;
    fn compile_flavor(&self) -> CompileFlavor;
    fn is_windows(&self) -> bool;
    /// Windows location of the Cygwin root, when the toolchain is Cygwin's.
    fn cygwin_drive(&self) -> Option<String>;
    fn normalize_path(&self, path: &str) -> String {
        path.to_string()
    }
}

/// Toolchain settings held as plain data.
#[derive(Clone, Debug, Default)]
pub struct StaticSettings {
    pub macros: Vec<String>,
    pub include_paths: Vec<String>,
    pub flavor: CompileFlavor,
    pub windows: bool,
    pub cygwin_drive: Option<String>,
}

impl CompilerSettings for StaticSettings {
    fn system_macro_definitions(&self, _language: Language) -> Vec<String> {
        self.macros.clone()
    }

    fn system_include_paths(&self, _language: Language) -> Vec<String> {
        self.include_paths.clone()
    }

    fn compile_flavor(&self) -> CompileFlavor {
        self.flavor
    }

    fn is_windows(&self) -> bool {
        self.windows
    }

    fn cygwin_drive(&self) -> Option<String> {
        self.cygwin_drive.clone()
    }
}

/// Project settings held as plain data.
#[derive(Clone, Debug, Default)]
pub struct StaticProject {
    pub source_root: Option<String>,
    pub executable: Option<String>,
    pub working_folder: Option<String>,
    pub resolve_symbolic_links: bool,
}

impl ProjectProxy for StaticProject {
    fn source_root(&self) -> Option<String> {
        self.source_root.clone()
    }

    fn executable(&self) -> Option<String> {
        self.executable.clone()
    }

    fn working_folder(&self) -> Option<String> {
        self.working_folder.clone()
    }

    fn resolve_symbolic_links(&self) -> bool {
        self.resolve_symbolic_links
    }
}

/// Macros to leave out of results, typically everything the compiler
/// predefines. Matched by name; the recorded value doesn't matter.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MacroIgnoreSet {
    macros: IndexMap<String, Option<String>>,
}

impl MacroIgnoreSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, value: Option<&str>) {
        self.macros
            .insert(bare_name(name).to_string(), value.map(str::to_string));
    }

    /// Whether a macro, possibly with a parameter list, is ignored.
    pub fn contains(&self, name: &str) -> bool {
        self.macros.contains_key(bare_name(name))
    }

    pub fn len(&self) -> usize {
        self.macros.len()
    }

    pub fn is_empty(&self) -> bool {
        self.macros.is_empty()
    }

    /// Parses either `cpp -dM -E` output (`#define NAME VALUE` lines) or
    /// plain `NAME[=VALUE]` lines. Blank lines and other `#` lines are
    /// skipped.
    pub fn parse(text: &str) -> Self {
        let mut set = Self::new();
        for line in text.lines() {
            let line = line.trim();
            if let Some(def) = line.strip_prefix("#define") {
                let (name, value) = split_definition(def.trim_start());
                if !name.is_empty() {
                    set.insert(name, value);
                }
            } else if !line.is_empty() && !line.starts_with('#') {
                let (name, value) = match line.split_once('=') {
                    Some((name, value)) => (name, Some(value)),
                    None => (line, None),
                };
                set.insert(name.trim(), value);
            }
        }
        set
    }

    pub fn from_file(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self::parse(&std::fs::read_to_string(path)?))
    }
}

impl Extend<String> for MacroIgnoreSet {
    fn extend<T: IntoIterator<Item = String>>(&mut self, iter: T) {
        for def in iter {
            let (name, value) = match def.split_once('=') {
                Some((name, value)) => (name, Some(value)),
                None => (def.as_str(), None),
            };
            self.insert(name, value);
        }
    }
}

/// Options of one discovery call.
#[derive(Debug)]
pub struct DiscoveryOptions {
    pub ignore_macros: MacroIgnoreSet,
    /// Directories whose headers always count as system headers.
    pub system_include_paths: Vec<String>,
    /// Root of the project sources, if known. User include directories
    /// outside of it and outside the compilation directory are reported as
    /// ambiguous.
    pub source_root: Option<String>,
    pub normalizer: Box<dyn PathNormalizer>,
    /// Patterns for the first macro of a header (usually its include guard)
    /// that mark the header as belonging to a third-party library.
    pub library_markers: Vec<Regex>,
    /// Upper bound on object files read in folder mode.
    pub max_objects: Option<usize>,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            ignore_macros: MacroIgnoreSet::default(),
            system_include_paths: vec![],
            source_root: None,
            normalizer: Box::new(PosixPaths),
            library_markers: vec![],
            max_objects: None,
        }
    }
}

impl DiscoveryOptions {
    /// Snapshots caller settings for the given languages.
    pub fn from_settings(
        settings: &dyn CompilerSettings,
        project: Option<&dyn ProjectProxy>,
        languages: &[Language],
    ) -> Self {
        let normalizer: Box<dyn PathNormalizer> = match settings.cygwin_drive() {
            Some(root) => Box::new(CygwinPaths::new(root)),
            None if settings.is_windows() => Box::new(WindowsPaths),
            None => Box::new(PosixPaths),
        };

        let mut ignore_macros = MacroIgnoreSet::new();
        let mut system_include_paths: Vec<String> = vec![];
        for &language in languages {
            ignore_macros.extend(settings.system_macro_definitions(language));
            for path in settings.system_include_paths(language) {
                let path = normalizer.normalize(&settings.normalize_path(&path));
                if !system_include_paths.contains(&path) {
                    system_include_paths.push(path);
                }
            }
        }

        let source_root = project
            .and_then(|p| p.source_root())
            .map(|root| normalizer.normalize(&settings.normalize_path(&root)));

        tracing::debug!(
            flavor = ?settings.compile_flavor(),
            ignored = ignore_macros.len(),
            system_paths = system_include_paths.len(),
            "discovery options"
        );

        Self {
            ignore_macros,
            system_include_paths,
            source_root,
            normalizer,
            ..Self::default()
        }
    }
}
