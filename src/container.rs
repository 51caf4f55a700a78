//! Opening object files and seeing through their envelopes.
//!
//! A `ContainerHandle` is one of: an ELF file, a Mach-O file, a fat Mach-O
//! bundle of per-architecture images, a PE image, or an `ar` archive of
//! relocatable objects. Formats are recognized by magic number once, at open
//! time, and recorded in a closed `ContainerFormat` tag.
//!
//! Archives and fat binaries have members instead of sections. A member is
//! opened as a nested handle that shares the parent's buffer.

use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use object::read::elf::{FileHeader, SectionHeader};
use object::read::macho::FatArch;
use object::{elf, Endianness, Object, ObjectSection};

/// Errors from opening or reading a container. Any of these is fatal for the
/// file in question, but only for that file.
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("not a recognized object format")]
    UnrecognizedFormat,
    #[error(
        "truncated file: {size} bytes at offset 0x{offset:x} run past the end \
         (length 0x{len:x})"
    )]
    Truncated { offset: u64, size: u64, len: u64 },
    #[error("malformed object file: {0}")]
    Malformed(#[from] object::Error),
    #[error("container was disposed")]
    Disposed,
}

/// The envelope format of a container.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ContainerFormat {
    Elf32,
    Elf64,
    MachO32,
    MachO64,
    MachOFat,
    Pe,
    Archive,
}

impl ContainerFormat {
    /// Whether this format holds members rather than sections.
    pub fn has_members(&self) -> bool {
        matches!(self, Self::Archive | Self::MachOFat)
    }
}

/// A section (or, for Mach-O, a section within a segment) of an object file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Section {
    /// Section name as stored in the file, e.g. `.debug_info` or
    /// `__debug_info`.
    pub name: String,
    /// Offset of the section contents within the container's view.
    pub file_offset: u64,
    /// Size in bytes. For sections without file contents (`.bss`) this is the
    /// in-memory size.
    pub size: u64,
    pub virtual_address: u64,
    /// ELF `sh_link`; 0 for other formats.
    pub link_index: u32,
    /// ELF `sh_entsize`; 0 for other formats.
    pub entry_size: u64,
}

/// A member of an archive, or one architecture slice of a fat Mach-O file.
///
/// Offsets are relative to the parent container's view. A member is opened
/// with `ContainerHandle::open_member`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ArchiveMember {
    pub name: String,
    pub offset: u64,
    pub size: u64,
}

/// An open binary artifact.
///
/// The file is read into memory by `open` and the OS handle is closed before
/// `open` returns, so the artifact can be rewritten or deleted while the
/// handle is alive. The buffer itself is released by `dispose` or on drop.
#[derive(Debug)]
pub struct ContainerHandle {
    name: String,
    format: ContainerFormat,
    /// `None` once disposed.
    bytes: Option<Arc<[u8]>>,
    /// Range of `bytes` this handle looks at. Only members use a sub-range.
    range: Range<usize>,
    sections: Vec<Section>,
    members: Vec<ArchiveMember>,
    word_size: u8,
    endian: gimli::RunTimeEndian,
}

impl ContainerHandle {
    /// Opens and identifies the file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ContainerError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| ContainerError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_bytes(path.display().to_string(), bytes)
    }

    /// Identifies an in-memory artifact. `name` is only used in diagnostics.
    pub fn from_bytes(
        name: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Result<Self, ContainerError> {
        let len = bytes.len();
        Self::from_shared(name.into(), Arc::from(bytes), 0..len)
    }

    fn from_shared(
        name: String,
        bytes: Arc<[u8]>,
        range: Range<usize>,
    ) -> Result<Self, ContainerError> {
        let data = &bytes[range.clone()];
        let format = sniff(data).ok_or(ContainerError::UnrecognizedFormat)?;

        let mut sections = vec![];
        let mut members = vec![];
        let (word_size, endian) = match format {
            ContainerFormat::Elf32 => {
                sections = elf_sections::<elf::FileHeader32<Endianness>>(data)?;
                (4, elf_endian(data))
            }
            ContainerFormat::Elf64 => {
                sections = elf_sections::<elf::FileHeader64<Endianness>>(data)?;
                (8, elf_endian(data))
            }
            ContainerFormat::MachO32
            | ContainerFormat::MachO64
            | ContainerFormat::Pe => {
                let (s, word_size, endian) = object_sections(data)?;
                sections = s;
                (word_size, endian)
            }
            ContainerFormat::MachOFat => {
                members = fat_members(data)?;
                (0, gimli::RunTimeEndian::Big)
            }
            ContainerFormat::Archive => {
                members = archive_members(data)?;
                (0, gimli::RunTimeEndian::Little)
            }
        };

        tracing::debug!(
            name = %name,
            ?format,
            sections = sections.len(),
            members = members.len(),
            "opened container"
        );

        Ok(Self {
            name,
            format,
            bytes: Some(bytes),
            range,
            sections,
            members,
            word_size,
            endian,
        })
    }

    /// Opens one member of an archive or fat binary as its own container. The
    /// member shares this container's buffer.
    pub fn open_member(
        &self,
        member: &ArchiveMember,
    ) -> Result<Self, ContainerError> {
        let bytes = self.bytes.as_ref().ok_or(ContainerError::Disposed)?;
        let len = self.range.len() as u64;
        check_range(member.offset, member.size, len)?;
        let start = self.range.start + member.offset as usize;
        let end = start + member.size as usize;
        Self::from_shared(
            format!("{}({})", self.name, member.name),
            Arc::clone(bytes),
            start..end,
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn format(&self) -> ContainerFormat {
        self.format
    }

    /// The section table. Empty for archives and fat binaries.
    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn section_by_name(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// Members of an archive or fat binary, in file order. Empty for plain
    /// object files.
    pub fn members(&self) -> &[ArchiveMember] {
        &self.members
    }

    /// Size of an address in bytes: 4 or 8, or 0 for formats that hold
    /// members.
    pub fn word_size(&self) -> u8 {
        self.word_size
    }

    pub fn endianness(&self) -> gimli::RunTimeEndian {
        self.endian
    }

    /// The bytes of this container's view.
    pub fn data(&self) -> Result<&[u8], ContainerError> {
        let bytes = self.bytes.as_ref().ok_or(ContainerError::Disposed)?;
        Ok(&bytes[self.range.clone()])
    }

    /// Reads `len` bytes at `offset` within the view.
    pub fn read(&self, offset: u64, len: u64) -> Result<&[u8], ContainerError> {
        let data = self.data()?;
        check_range(offset, len, data.len() as u64)?;
        Ok(&data[offset as usize..(offset + len) as usize])
    }

    /// Parses the view with `object` for section-level access (DWARF loading,
    /// relocations, imports). Fails for archives and fat binaries.
    pub fn object(&self) -> Result<object::File<'_>, ContainerError> {
        Ok(object::File::parse(self.data()?)?)
    }

    /// Releases the buffer. Calling this more than once is harmless; every
    /// data accessor fails with `Disposed` afterwards.
    pub fn dispose(&mut self) {
        if self.bytes.take().is_some() {
            tracing::trace!(name = %self.name, "disposed container");
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.bytes.is_none()
    }
}

impl Drop for ContainerHandle {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Identifies a container format from the leading bytes.
pub fn sniff(data: &[u8]) -> Option<ContainerFormat> {
    if data.starts_with(b"!<arch>\n") {
        return Some(ContainerFormat::Archive);
    }
    if data.len() < 8 {
        return None;
    }
    if data.starts_with(b"\x7fELF") {
        return match data[4] {
            elf::ELFCLASS32 => Some(ContainerFormat::Elf32),
            elf::ELFCLASS64 => Some(ContainerFormat::Elf64),
            _ => None,
        };
    }

    let magic = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    match magic {
        0xfeed_face | 0xcefa_edfe => return Some(ContainerFormat::MachO32),
        0xfeed_facf | 0xcffa_edfe => return Some(ContainerFormat::MachO64),
        0xcafe_babe | 0xcafe_babf => {
            // Java class files share this magic. Their next word is a class
            // file version, which is far larger than any plausible
            // architecture count.
            let count = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
            return if (1..=32).contains(&count) {
                Some(ContainerFormat::MachOFat)
            } else {
                None
            };
        }
        _ => (),
    }

    if data.starts_with(b"MZ") && data.len() >= 0x40 {
        let pe_offset =
            u32::from_le_bytes([data[0x3c], data[0x3d], data[0x3e], data[0x3f]])
                as usize;
        if data.get(pe_offset..pe_offset.saturating_add(4)) == Some(&b"PE\0\0"[..]) {
            return Some(ContainerFormat::Pe);
        }
    }
    None
}

fn check_range(offset: u64, size: u64, len: u64) -> Result<(), ContainerError> {
    match offset.checked_add(size) {
        Some(end) if end <= len => Ok(()),
        _ => Err(ContainerError::Truncated { offset, size, len }),
    }
}

fn elf_endian(data: &[u8]) -> gimli::RunTimeEndian {
    if data[5] == elf::ELFDATA2MSB {
        gimli::RunTimeEndian::Big
    } else {
        gimli::RunTimeEndian::Little
    }
}

/// Reads the ELF section table, checking every declared range against the
/// file length.
fn elf_sections<Elf: FileHeader<Endian = Endianness>>(
    data: &[u8],
) -> Result<Vec<Section>, ContainerError> {
    let len = data.len() as u64;
    let header = Elf::parse(data)?;
    let endian = header.endian()?;

    let shoff: u64 = header.e_shoff(endian).into();
    let shentsize = u64::from(header.e_shentsize(endian));
    if shoff != 0 {
        check_range(shoff, shentsize, len)?;
        let shnum = header.shnum(endian, data)? as u64;
        check_range(shoff, shnum.saturating_mul(shentsize), len)?;
    }

    let table = header.sections(endian, data)?;
    let mut sections = Vec::with_capacity(table.len());
    for shdr in table.iter() {
        let name = table.section_name(endian, shdr)?;
        let file_offset: u64 = shdr.sh_offset(endian).into();
        let size: u64 = shdr.sh_size(endian).into();
        if shdr.sh_type(endian) != elf::SHT_NOBITS {
            check_range(file_offset, size, len)?;
        }
        sections.push(Section {
            name: String::from_utf8_lossy(name).into_owned(),
            file_offset,
            size,
            virtual_address: shdr.sh_addr(endian).into(),
            link_index: shdr.sh_link(endian),
            entry_size: shdr.sh_entsize(endian).into(),
        });
    }
    Ok(sections)
}

/// Reads the section table of Mach-O and PE files through `object`'s
/// format-independent view.
fn object_sections(
    data: &[u8],
) -> Result<(Vec<Section>, u8, gimli::RunTimeEndian), ContainerError> {
    let len = data.len() as u64;
    let file = object::File::parse(data)?;
    let mut sections = vec![];
    for section in file.sections() {
        let (file_offset, size) = match section.file_range() {
            Some((offset, size)) => {
                check_range(offset, size, len)?;
                (offset, size)
            }
            None => (0, section.size()),
        };
        sections.push(Section {
            name: section.name().unwrap_or_default().to_string(),
            file_offset,
            size,
            virtual_address: section.address(),
            link_index: 0,
            entry_size: 0,
        });
    }
    let word_size = if file.is_64() { 8 } else { 4 };
    let endian = if file.is_little_endian() {
        gimli::RunTimeEndian::Little
    } else {
        gimli::RunTimeEndian::Big
    };
    Ok((sections, word_size, endian))
}

fn archive_members(data: &[u8]) -> Result<Vec<ArchiveMember>, ContainerError> {
    let len = data.len() as u64;
    let archive = object::read::archive::ArchiveFile::parse(data)?;
    let mut members = vec![];
    for member in archive.members() {
        let member = member?;
        let (offset, size) = member.file_range();
        check_range(offset, size, len)?;
        let name = String::from_utf8_lossy(member.name());
        members.push(ArchiveMember {
            name: name.trim_end_matches('/').to_string(),
            offset,
            size,
        });
    }
    Ok(members)
}

fn fat_members(data: &[u8]) -> Result<Vec<ArchiveMember>, ContainerError> {
    fn member<A: FatArch>(
        arch: &A,
        len: u64,
    ) -> Result<ArchiveMember, ContainerError> {
        let (offset, size) = arch.file_range();
        check_range(offset, size, len)?;
        Ok(ArchiveMember {
            name: format!("{:?}", arch.architecture()).to_lowercase(),
            offset,
            size,
        })
    }

    let len = data.len() as u64;
    let mut members = vec![];
    if data.starts_with(&[0xca, 0xfe, 0xba, 0xbe]) {
        let fat = object::read::macho::MachOFatFile32::parse(data)?;
        for arch in fat.arches() {
            members.push(member(arch, len)?);
        }
    } else {
        let fat = object::read::macho::MachOFatFile64::parse(data)?;
        for arch in fat.arches() {
            members.push(member(arch, len)?);
        }
    }
    Ok(members)
}
