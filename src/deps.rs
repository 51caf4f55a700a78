//! Shared libraries an artifact depends on.

use indexmap::IndexSet;
use object::read::elf::{Dyn, FileHeader, SectionHeader};
use object::read::macho::{LoadCommandVariant, MachHeader};
use object::{elf, macho, Endianness, Object, SectionIndex};

use crate::container::{ContainerError, ContainerFormat, ContainerHandle};
use crate::model::SharedLibraries;

/// Reads the dynamic dependencies of an executable or shared library, in
/// declaration order.
///
/// Relocatable objects and archives have none. Fat binaries report their
/// first slice.
pub fn read_dependencies(
    container: &ContainerHandle,
) -> Result<SharedLibraries, ContainerError> {
    let data = container.data()?;
    let deps = match container.format() {
        ContainerFormat::Elf32 => elf_dependencies::<elf::FileHeader32<Endianness>>(data)?,
        ContainerFormat::Elf64 => elf_dependencies::<elf::FileHeader64<Endianness>>(data)?,
        ContainerFormat::MachO32 => macho_dependencies::<macho::MachHeader32<Endianness>>(data)?,
        ContainerFormat::MachO64 => macho_dependencies::<macho::MachHeader64<Endianness>>(data)?,
        ContainerFormat::MachOFat => match container.members().first() {
            Some(member) => read_dependencies(&container.open_member(member)?)?,
            None => SharedLibraries::default(),
        },
        ContainerFormat::Pe => pe_dependencies(container)?,
        ContainerFormat::Archive => SharedLibraries::default(),
    };
    tracing::debug!(
        name = container.name(),
        libraries = deps.libraries().len(),
        search_paths = deps.search_paths().len(),
        "read dependencies"
    );
    Ok(deps)
}

fn elf_dependencies<Elf: FileHeader<Endian = Endianness>>(
    data: &[u8],
) -> Result<SharedLibraries, ContainerError> {
    let header = Elf::parse(data)?;
    let endian = header.endian()?;
    let sections = header.sections(endian, data)?;

    let mut libraries = vec![];
    let mut search_paths = vec![];
    for section in sections.iter() {
        if section.sh_type(endian) != elf::SHT_DYNAMIC {
            continue;
        }
        let entries: &[Elf::Dyn] = section.data_as_array(endian, data)?;
        let strings = sections.strings(
            endian,
            data,
            SectionIndex(section.sh_link(endian) as usize),
        )?;
        for entry in entries {
            let value = || -> Result<String, ContainerError> {
                Ok(String::from_utf8_lossy(entry.string(endian, strings)?).into_owned())
            };
            match entry.tag32(endian) {
                Some(elf::DT_NULL) => break,
                Some(elf::DT_NEEDED) => libraries.push(value()?),
                Some(elf::DT_RPATH) | Some(elf::DT_RUNPATH) => {
                    search_paths.extend(
                        value()?
                            .split(':')
                            .filter(|p| !p.is_empty())
                            .map(str::to_string),
                    );
                }
                _ => (),
            }
        }
    }
    Ok(SharedLibraries::new(libraries, search_paths))
}

fn macho_dependencies<Mach: MachHeader<Endian = Endianness>>(
    data: &[u8],
) -> Result<SharedLibraries, ContainerError> {
    let header = Mach::parse(data, 0)?;
    let endian = header.endian()?;
    let mut commands = header.load_commands(endian, data, 0)?;

    let mut libraries = vec![];
    let mut search_paths = vec![];
    while let Some(command) = commands.next()? {
        match command.variant()? {
            // The library's own install name.
            LoadCommandVariant::Dylib(_) if command.cmd() == macho::LC_ID_DYLIB => (),
            LoadCommandVariant::Dylib(dylib) => {
                let name = command.string(endian, dylib.dylib.name)?;
                libraries.push(String::from_utf8_lossy(name).into_owned());
            }
            LoadCommandVariant::Rpath(rpath) => {
                let path = command.string(endian, rpath.path)?;
                search_paths.push(String::from_utf8_lossy(path).into_owned());
            }
            _ => (),
        }
    }
    Ok(SharedLibraries::new(libraries, search_paths))
}

fn pe_dependencies(container: &ContainerHandle) -> Result<SharedLibraries, ContainerError> {
    let file = container.object()?;
    let libraries: IndexSet<String> = file
        .imports()?
        .iter()
        .map(|import| String::from_utf8_lossy(import.library()).into_owned())
        .collect();
    Ok(SharedLibraries::new(libraries.into_iter().collect(), vec![]))
}
