use anyhow::{Context, Result};
use clap::Parser;

use dwarfdiscovery::container::ContainerHandle;
use dwarfdiscovery::dwarf_parser::{decode_compilation_units, DebugSections};
use dwarfdiscovery::line_program::decode_line_program;
use dwarfdiscovery::macros::{decode_macros, MacroEntry};

/// Dumps the raw material discovery works from: compile units, line tables,
/// macro tables and dependencies.
#[derive(Debug, Parser)]
struct Sketch {
    filename: std::path::PathBuf,
    /// Print line table rows.
    #[arg(long)]
    lines: bool,
    /// Print macro tables.
    #[arg(long)]
    macros: bool,
}

fn main() -> Result<()> {
    let args = Sketch::parse();

    let container = ContainerHandle::open(&args.filename)?;
    println!("{}: {:?}", container.name(), container.format());

    if container.format().has_members() {
        for member in container.members() {
            println!("-- member {} ({} bytes) --", member.name, member.size);
            match container.open_member(member) {
                Ok(object) => dump_object(&object, &args)?,
                Err(e) => println!("    unreadable: {}", e),
            }
        }
    } else {
        dump_object(&container, &args)?;
    }
    Ok(())
}

fn dump_object(container: &ContainerHandle, args: &Sketch) -> Result<()> {
    let deps = dwarfdiscovery::deps::read_dependencies(container)?;
    for lib in deps.libraries() {
        println!("needs {}", lib);
    }
    for path in deps.search_paths() {
        println!("search path {}", path);
    }

    let sections = DebugSections::load(container)
        .with_context(|| format!("loading debug sections of {}", container.name()))?;
    if !sections.has_debug_info() {
        println!("no debug info");
        return Ok(());
    }

    for unit in decode_compilation_units(&sections) {
        let unit = match unit {
            Ok(unit) => unit,
            Err(e) => {
                println!("bad unit: {}", e);
                continue;
            }
        };
        println!("unit <{:#x}> v{}", unit.offset, unit.version);
        println!("    name: {:?}", unit.name);
        println!("    comp_dir: {:?}", unit.comp_dir);
        println!("    producer: {:?}", unit.producer);
        println!("    compiler: {:?}", unit.compiler);
        println!("    language: {:?}", unit.language);
        if let (Some(lo), Some(hi)) = (unit.low_pc, unit.high_pc) {
            println!("    pc: {:#x}..{:#x}", lo, hi);
        }
        if let Some(main) = &unit.main {
            println!("    main: {:?}", main);
        }

        let table = decode_line_program(&unit)?;
        for (index, path) in table.files() {
            println!("    file {}: {}", index, path);
        }
        if args.lines {
            for row in table.rows() {
                println!(
                    "    {:#010x} {}:{}:{}{}{}",
                    row.address,
                    row.file_index,
                    row.line,
                    row.column,
                    if row.is_statement { " stmt" } else { "" },
                    if row.end_sequence { " end" } else { "" },
                );
            }
        }

        if args.macros {
            let table = decode_macros(&unit, &sections);
            let mut depth = 1;
            for entry in table.entries {
                let indent = "  ".repeat(depth);
                match entry {
                    MacroEntry::Define { line, text } => {
                        println!("  {}{}: #define {}", indent, line, text)
                    }
                    MacroEntry::Undef { line, name } => {
                        println!("  {}{}: #undef {}", indent, line, name)
                    }
                    MacroEntry::StartFile { line, file } => {
                        println!("  {}{}: start file {}", indent, line, file);
                        depth += 1;
                    }
                    MacroEntry::EndFile => {
                        depth = depth.saturating_sub(1).max(1);
                        println!("  {}end file", "  ".repeat(depth));
                    }
                }
            }
            if let Some(e) = table.error {
                println!("    macro table damaged: {}", e);
            }
        }
    }
    Ok(())
}
