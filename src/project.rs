//! Discovery results shaped for a project model.

use indexmap::IndexMap;

use crate::model::{Language, SourcePosition};
use crate::path::parent;
use crate::Discovery;

/// Stands in for the value of a macro defined without one.
pub const NO_VALUE: &str = "null";

/// One source file of a discovered build target.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SourceFileProperties {
    /// File name without directories.
    pub item_name: String,
    /// Full normalized path.
    pub item_path: String,
    pub language: Option<Language>,
    /// Compiler family name, e.g. `GNU`.
    pub compiler: String,
    /// Macro name to value, `NO_VALUE` for value-less defines.
    pub user_macros: IndexMap<String, String>,
    pub user_includes: Vec<String>,
    pub system_includes: Vec<String>,
}

/// A build target, with one item per reconstructed source file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Configuration {
    pub name: String,
    pub items: Vec<SourceFileProperties>,
}

impl Configuration {
    pub fn from_discovery(name: impl Into<String>, discovery: &Discovery) -> Self {
        let items = discovery
            .units
            .iter()
            .filter_map(|unit| {
                let record = discovery.records.get(unit.record)?;
                let item_path = record.full_path();
                let item_name = item_path
                    .rsplit('/')
                    .next()
                    .unwrap_or(&item_path)
                    .to_string();
                Some(SourceFileProperties {
                    item_name,
                    item_path,
                    language: unit.language,
                    compiler: unit.producer.family.name().to_string(),
                    user_macros: record
                        .user_macros
                        .iter()
                        .map(|(k, v)| (k.clone(), v.as_deref().unwrap_or(NO_VALUE).to_string()))
                        .collect(),
                    user_includes: record.user_includes.clone(),
                    system_includes: record.system_includes.clone(),
                })
            })
            .collect();
        Self {
            name: name.into(),
            items,
        }
    }
}

/// Whether, and how, a binary can be turned into a project.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Applicable {
    /// Compiler family of the first unit.
    pub compiler_name: Option<String>,
    /// Deepest directory containing every reconstructed source file.
    pub source_root: Option<String>,
    pub main_function: Option<SourcePosition>,
    /// True when at least one source file was recovered.
    pub applicable: bool,
    pub dependencies: Vec<String>,
    pub errors: Vec<String>,
}

impl Applicable {
    pub fn from_discovery(discovery: &Discovery) -> Self {
        let paths: Vec<String> = discovery.records.iter().map(|r| r.full_path()).collect();
        Self {
            compiler_name: discovery
                .units
                .first()
                .map(|u| u.producer.family.name().to_string()),
            source_root: common_root(&paths),
            main_function: discovery.units.iter().find_map(|u| u.main.clone()),
            applicable: !discovery.records.is_empty(),
            dependencies: discovery.dependencies.libraries().to_vec(),
            errors: discovery.warnings.iter().map(|w| w.to_string()).collect(),
        }
    }
}

/// Longest directory prefix shared by the parents of `paths`.
fn common_root(paths: &[String]) -> Option<String> {
    let mut dirs = paths.iter().filter_map(|p| parent(p));
    let mut root: Vec<&str> = dirs.next()?.split('/').collect();
    for dir in dirs {
        let shared = root
            .iter()
            .zip(dir.split('/'))
            .take_while(|(a, b)| *a == b)
            .count();
        root.truncate(shared);
    }
    match root.join("/") {
        joined if joined.is_empty() && root.len() == 1 => Some("/".to_string()),
        joined if joined.is_empty() => None,
        joined => Some(joined),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::SourceFileRecord;
    use crate::producer::Producer;
    use crate::UnitSummary;

    fn discovery() -> Discovery {
        let mut a = SourceFileRecord {
            compilation_dir: "/home/u/app".to_string(),
            source_name: "src/main.c".to_string(),
            ..SourceFileRecord::default()
        };
        a.user_macros.insert("NDEBUG".to_string(), None);
        a.user_macros.insert("AAA".to_string(), Some("1".to_string()));
        let b = SourceFileRecord {
            compilation_dir: "/home/u/app".to_string(),
            source_name: "lib/util/util.c".to_string(),
            ..SourceFileRecord::default()
        };
        let unit = |record, main| UnitSummary {
            record,
            object: "app".to_string(),
            producer: Producer::parse("GNU C17 9.4.0 -g3"),
            language: Some(Language::C),
            main,
        };
        Discovery {
            records: vec![a, b],
            units: vec![
                unit(
                    0,
                    Some(SourcePosition {
                        file: "/home/u/app/src/main.c".to_string(),
                        line: 39,
                    }),
                ),
                unit(1, None),
            ],
            ..Discovery::default()
        }
    }

    #[test]
    fn configuration_items() {
        let config = Configuration::from_discovery("Debug", &discovery());
        assert_eq!(config.items.len(), 2);
        let main = &config.items[0];
        assert_eq!(main.item_name, "main.c");
        assert_eq!(main.item_path, "/home/u/app/src/main.c");
        assert_eq!(main.compiler, "GNU");
        assert_eq!(main.user_macros["NDEBUG"], "null");
        assert_eq!(main.user_macros["AAA"], "1");
    }

    #[test]
    fn applicable_summary() {
        let applicable = Applicable::from_discovery(&discovery());
        assert!(applicable.applicable);
        assert_eq!(applicable.compiler_name.as_deref(), Some("GNU"));
        assert_eq!(applicable.source_root.as_deref(), Some("/home/u/app"));
        assert_eq!(applicable.main_function.map(|m| m.line), Some(39));

        assert!(!Applicable::from_discovery(&Discovery::default()).applicable);
    }

    #[test]
    fn common_roots() {
        let paths = |p: &[&str]| p.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert_eq!(common_root(&paths(&["/a/b/c.c", "/a/b/d/e.c"])).as_deref(), Some("/a/b"));
        assert_eq!(common_root(&paths(&["/a/c.c", "/b/d.c"])).as_deref(), Some("/"));
        assert_eq!(common_root(&paths(&["C:/x/a.c", "D:/y/b.c"])), None);
        assert_eq!(common_root(&[]), None);
    }
}
