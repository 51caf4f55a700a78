//! Text form of discovery results, as printed by the `dwarf-discovery`
//! binary.
//!
//! The format is line oriented. Each line is a keyword, a space, and an
//! escaped value; records are bracketed by `record` and `end` lines. Writing
//! and then parsing a report gives back an equal `Report`.

use std::io::{self, Write};

use crate::model::SourceFileRecord;
use crate::Discovery;

const HEADER: &str = "dwarf-discovery report 1";

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Report {
    pub records: Vec<SourceFileRecord>,
    pub dependencies: Vec<String>,
    pub search_paths: Vec<String>,
    /// Rendered warnings.
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl Report {
    pub fn from_discovery(discovery: &Discovery) -> Self {
        Self {
            records: discovery.records.clone(),
            dependencies: discovery.dependencies.libraries().to_vec(),
            search_paths: discovery.dependencies.search_paths().to_vec(),
            warnings: discovery.warnings.iter().map(|w| w.to_string()).collect(),
            errors: vec![],
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("not a dwarf-discovery report")]
    MissingHeader,
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },
}

pub fn write_report(out: &mut impl Write, report: &Report) -> io::Result<()> {
    writeln!(out, "{}", HEADER)?;
    for record in &report.records {
        writeln!(out, "record")?;
        writeln!(out, "compdir {}", escape(&record.compilation_dir))?;
        writeln!(out, "source {}", escape(&record.source_name))?;
        for dir in &record.user_includes {
            writeln!(out, "user-include {}", escape(dir))?;
        }
        for dir in &record.system_includes {
            writeln!(out, "system-include {}", escape(dir))?;
        }
        for (name, value) in &record.user_macros {
            match value {
                Some(value) => writeln!(out, "macro {}={}", escape(name), escape(value))?,
                None => writeln!(out, "macro {}", escape(name))?,
            }
        }
        writeln!(out, "compile-line {}", escape(&record.compile_line))?;
        writeln!(out, "end")?;
    }
    for (keyword, values) in [
        ("dependency", &report.dependencies),
        ("search-path", &report.search_paths),
        ("warning", &report.warnings),
        ("error", &report.errors),
    ] {
        for value in values {
            writeln!(out, "{} {}", keyword, escape(value))?;
        }
    }
    Ok(())
}

pub fn parse_report(text: &str) -> Result<Report, ReportError> {
    let mut lines = text.lines().enumerate().map(|(i, l)| (i + 1, l));
    match lines.next() {
        Some((_, HEADER)) => (),
        _ => return Err(ReportError::MissingHeader),
    }

    let mut report = Report::default();
    let mut record: Option<SourceFileRecord> = None;
    for (number, line) in lines {
        let syntax = |message: &str| ReportError::Syntax {
            line: number,
            message: message.to_string(),
        };
        let (keyword, value) = line.split_once(' ').unwrap_or((line, ""));
        match (keyword, record.as_mut()) {
            ("record", None) => record = Some(SourceFileRecord::default()),
            ("end", Some(_)) => report.records.extend(record.take()),
            ("compdir", Some(r)) => r.compilation_dir = unescape(value).map_err(syntax)?,
            ("source", Some(r)) => r.source_name = unescape(value).map_err(syntax)?,
            ("user-include", Some(r)) => r.user_includes.push(unescape(value).map_err(syntax)?),
            ("system-include", Some(r)) => {
                r.system_includes.push(unescape(value).map_err(syntax)?)
            }
            ("macro", Some(r)) => {
                let (name, value) = match value.split_once('=') {
                    Some((name, value)) => (name, Some(unescape(value).map_err(syntax)?)),
                    None => (value, None),
                };
                r.user_macros.insert(unescape(name).map_err(syntax)?, value);
            }
            ("compile-line", Some(r)) => r.compile_line = unescape(value).map_err(syntax)?,
            ("dependency", None) => report.dependencies.push(unescape(value).map_err(syntax)?),
            ("search-path", None) => report.search_paths.push(unescape(value).map_err(syntax)?),
            ("warning", None) => report.warnings.push(unescape(value).map_err(syntax)?),
            ("error", None) => report.errors.push(unescape(value).map_err(syntax)?),
            ("", None) => (),
            (_, Some(_)) => return Err(syntax(&format!("unexpected `{}` inside record", keyword))),
            (_, None) => return Err(syntax(&format!("unexpected `{}`", keyword))),
        }
    }
    if record.is_some() {
        return Err(ReportError::Syntax {
            line: text.lines().count(),
            message: "unterminated record".to_string(),
        });
    }
    Ok(report)
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            // Keeps macro names containing '=' unambiguous.
            '=' => out.push_str("\\="),
            c => out.push(c),
        }
    }
    out
}

fn unescape(s: &str) -> Result<String, &'static str> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('=') => out.push('='),
            _ => return Err("bad escape"),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;
    use similar_asserts::assert_eq;

    fn sample() -> Report {
        let mut record = SourceFileRecord {
            compilation_dir: "/home/u/app".to_string(),
            source_name: "src/main.c".to_string(),
            user_includes: vec!["/home/u/app/include".to_string()],
            system_includes: vec!["/usr/include".to_string()],
            compile_line: "gcc -DAAA=1 -DMSG=\"a b\" src/main.c".to_string(),
            ..SourceFileRecord::default()
        };
        record.user_macros.insert("AAA".to_string(), Some("1".to_string()));
        record.user_macros.insert("NDEBUG".to_string(), None);
        record
            .user_macros
            .insert("MSG".to_string(), Some("\"a b\\n\"\t= x".to_string()));
        record
            .user_macros
            .insert("EMPTY".to_string(), Some(String::new()));
        Report {
            records: vec![record, SourceFileRecord::default()],
            dependencies: vec!["libc.so.6".to_string()],
            search_paths: vec!["$ORIGIN/../lib".to_string()],
            warnings: vec!["cannot classify include directory /opt/x".to_string()],
            errors: vec!["line one\nline two".to_string()],
        }
    }

    #[test]
    fn written_report_parses_back() {
        let report = sample();
        let mut out = vec![];
        write_report(&mut out, &report).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("dwarf-discovery report 1\nrecord\ncompdir /home/u/app\n"));
        assert!(text.contains("\nmacro NDEBUG\n"));
        assert_eq!(parse_report(&text).unwrap(), report);
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            parse_report("hello\n"),
            Err(ReportError::MissingHeader)
        ));
        assert!(matches!(
            parse_report("dwarf-discovery report 1\nrecord\nbogus x\n"),
            Err(ReportError::Syntax { line: 3, .. })
        ));
        assert!(matches!(
            parse_report("dwarf-discovery report 1\nrecord\n"),
            Err(ReportError::Syntax { .. })
        ));
        assert!(matches!(
            parse_report("dwarf-discovery report 1\nwarning a\\qb\n"),
            Err(ReportError::Syntax { line: 2, .. })
        ));
    }
}
