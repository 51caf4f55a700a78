//! Recognizing compilers from their `DW_AT_producer` banners.

use lazy_static::lazy_static;
use regex::Regex;

use crate::model::Language;

lazy_static! {
    static ref GCC_RE: Regex = Regex::new(
        r"^GNU (?:C|C\+\+|Fortran|Objective-C|F77|F95|GIMPLE|Assembler)[\w+]*\s+(\d+(?:\.\d+)*)"
    )
    .unwrap();
    static ref APPLE_RE: Regex =
        Regex::new(r"^Apple (?:clang|LLVM) version (\d+(?:\.\d+)*)").unwrap();
    static ref CLANG_RE: Regex = Regex::new(r"\bclang version (\d+(?:\.\d+)*)").unwrap();
    static ref SUN_RE: Regex =
        Regex::new(r"^(?:Sun|Oracle) (?:C\+\+|C|Fortran 95) (\d+(?:\.\d+)*)").unwrap();
    static ref STUDIO_RE: Regex = Regex::new(
        r"(?:Oracle Developer Studio|Oracle Solaris Studio|Sun Studio) (\d+(?:\.\d+)*)"
    )
    .unwrap();
    static ref FLAG_RE: Regex = Regex::new(r"(?:^|\s)(-(?:f|O|m|g|D|U|I|std=)\S*)").unwrap();
}

/// Compiler vendor, as far as the banner tells.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum CompilerFamily {
    Gcc,
    Clang,
    AppleClang,
    SunStudio,
    /// GCC targeting native Windows.
    MinGw,
    /// GCC running under Cygwin.
    CygwinGcc,
    /// Anything else. Holds the banner verbatim.
    Unknown(String),
}

impl CompilerFamily {
    /// Name of the compiler driver that would have been invoked for a unit
    /// of `language`.
    pub fn driver(&self, language: Option<Language>) -> Option<&'static str> {
        let language = language.unwrap_or(Language::C);
        let name = match self {
            Self::Gcc | Self::MinGw | Self::CygwinGcc => match language {
                Language::Cpp => "g++",
                Language::Fortran => "gfortran",
                _ => "gcc",
            },
            Self::Clang | Self::AppleClang => match language {
                Language::Cpp => "clang++",
                Language::Fortran => "flang",
                _ => "clang",
            },
            Self::SunStudio => match language {
                Language::Cpp => "CC",
                Language::Fortran => "f95",
                _ => "cc",
            },
            Self::Unknown(_) => return None,
        };
        Some(name)
    }

    /// Display name used in reports.
    pub fn name(&self) -> &str {
        match self {
            Self::Gcc => "GNU",
            Self::Clang => "Clang",
            Self::AppleClang => "Apple Clang",
            Self::SunStudio => "SunStudio",
            Self::MinGw => "MinGW",
            Self::CygwinGcc => "Cygwin",
            Self::Unknown(raw) => raw,
        }
    }
}

/// A parsed producer banner.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Producer {
    pub family: CompilerFamily,
    pub version: Option<String>,
    /// Switches recorded in the banner, e.g. by `-grecord-gcc-switches`.
    pub flags: Vec<String>,
}

impl Default for Producer {
    fn default() -> Self {
        Self {
            family: CompilerFamily::Unknown(String::new()),
            version: None,
            flags: vec![],
        }
    }
}

impl Producer {
    pub fn parse(raw: &str) -> Self {
        let banner = raw.trim();
        let flags = FLAG_RE
            .captures_iter(banner)
            .map(|c| c[1].to_string())
            .collect();

        let version = |c: regex::Captures<'_>| Some(c[1].to_string());
        let (family, version) = if let Some(c) = GCC_RE.captures(banner) {
            let lower = banner.to_ascii_lowercase();
            let family = if lower.contains("mingw") {
                CompilerFamily::MinGw
            } else if lower.contains("cygwin") {
                CompilerFamily::CygwinGcc
            } else {
                CompilerFamily::Gcc
            };
            (family, version(c))
        } else if let Some(c) = APPLE_RE.captures(banner) {
            (CompilerFamily::AppleClang, version(c))
        } else if let Some(c) = CLANG_RE.captures(banner) {
            (CompilerFamily::Clang, version(c))
        } else if let Some(c) = SUN_RE.captures(banner).or_else(|| STUDIO_RE.captures(banner)) {
            (CompilerFamily::SunStudio, version(c))
        } else {
            (CompilerFamily::Unknown(raw.to_string()), None)
        };

        Self {
            family,
            version,
            flags,
        }
    }
}
