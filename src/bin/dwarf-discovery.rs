use std::ffi::OsString;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{ArgAction, ArgGroup, Parser, ValueEnum};
use regex::Regex;
use tracing::subscriber::set_global_default as set_global_subscriber;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::FmtSubscriber;

use dwarfdiscovery::path::{CygwinPaths, PathNormalizer, PosixPaths, WindowsPaths};
use dwarfdiscovery::report::{write_report, Report};
use dwarfdiscovery::settings::{DiscoveryOptions, MacroIgnoreSet};

/// Recovers source files, include paths and macros from the debug info of
/// compiled binaries, and prints them as a report.
#[derive(Debug, Parser)]
#[command(version, group(ArgGroup::new("input").required(true).args(["file", "folder"])))]
struct Args {
    /// Object file, executable, shared library or archive to read. A
    /// directory is read as with `--folder`.
    #[arg(long, value_name = "PATH")]
    file: Option<PathBuf>,
    /// Directory of binaries to read.
    #[arg(long, value_name = "DIR")]
    folder: Option<PathBuf>,
    /// Descend into sub-directories of `--folder`.
    #[arg(long)]
    recursive: bool,
    /// Macros to leave out, as printed by `cpp -dM -E`.
    #[arg(long, value_name = "FILE")]
    ignore_macros: Option<PathBuf>,
    /// Directory whose headers count as system headers (repeatable).
    #[arg(long = "system-include", value_name = "DIR")]
    system_includes: Vec<String>,
    /// Root of the project sources.
    #[arg(long, value_name = "DIR")]
    source_root: Option<String>,
    /// How paths recorded in the binaries are interpreted.
    #[arg(long, value_enum, default_value_t = PathStyle::Posix)]
    paths: PathStyle,
    /// Windows location of the Cygwin root, for `--paths cygwin`.
    #[arg(long, value_name = "DIR", default_value = "C:/cygwin")]
    cygwin_root: String,
    /// Also report shared library dependencies.
    #[arg(long)]
    dependencies: bool,
    /// Regex for include guards of third-party headers (repeatable).
    #[arg(long = "marker", value_name = "REGEX")]
    markers: Vec<Regex>,
    /// Stop after this many object files in folder mode.
    #[arg(long, value_name = "N")]
    max_objects: Option<usize>,
    /// Increase verbosity (can be supplied multiple times).
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbosity: u8,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum PathStyle {
    Posix,
    Windows,
    Cygwin,
}

/// Accepts the single-dash `-file` and `-folder` spellings too.
fn long_options(args: impl Iterator<Item = OsString>) -> Vec<OsString> {
    args.map(|arg| match arg.to_str() {
        Some("-file") => "--file".into(),
        Some("-folder") => "--folder".into(),
        _ => arg,
    })
    .collect()
}

fn main() -> Result<()> {
    let args = Args::parse_from(long_options(std::env::args_os()));
    let level = match args.verbosity {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();
    let () =
        set_global_subscriber(subscriber).with_context(|| "failed to set tracing subscriber")?;

    let mut errors = vec![];
    let normalizer: Box<dyn PathNormalizer> = match args.paths {
        PathStyle::Posix => Box::new(PosixPaths),
        PathStyle::Windows => Box::new(WindowsPaths),
        PathStyle::Cygwin => Box::new(CygwinPaths::new(args.cygwin_root.clone())),
    };
    let ignore_macros = match &args.ignore_macros {
        Some(path) => MacroIgnoreSet::from_file(path).unwrap_or_else(|e| {
            errors.push(format!("cannot read {}: {}", path.display(), e));
            MacroIgnoreSet::default()
        }),
        None => MacroIgnoreSet::default(),
    };
    let options = DiscoveryOptions {
        ignore_macros,
        system_include_paths: args.system_includes.clone(),
        source_root: args.source_root.clone(),
        normalizer,
        library_markers: args.markers.clone(),
        max_objects: args.max_objects,
    };

    // Exactly one of the two is present. A directory given as `--file` is
    // read like `--folder`.
    let discovery = match (&args.file, &args.folder) {
        (Some(file), _) if file.is_dir() => Ok(dwarfdiscovery::discover_folder(
            file,
            args.recursive,
            &options,
        )),
        (Some(file), _) => dwarfdiscovery::discover(file, &options),
        (None, folder) => Ok(dwarfdiscovery::discover_folder(
            folder.as_deref().unwrap_or_else(|| Path::new(".")),
            args.recursive,
            &options,
        )),
    };

    let mut report = match discovery {
        Ok(discovery) => Report::from_discovery(&discovery),
        Err(e) => Report {
            errors: vec![e.to_string()],
            ..Report::default()
        },
    };
    if !args.dependencies {
        report.dependencies.clear();
        report.search_paths.clear();
    }
    errors.append(&mut report.errors);
    report.errors = errors;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    write_report(&mut out, &report).context("failed to write report")?;
    out.flush().context("failed to write report")?;
    Ok(())
}
