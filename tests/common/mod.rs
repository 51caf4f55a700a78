//! Fixture builders: DWARF through `gimli::write`, containers by hand.

#![allow(dead_code)]

use gimli::write::{
    Address, AttributeValue, DwarfUnit, EndianVec, LineProgram, LineString, Sections,
};
use gimli::{Encoding, Format, LineEncoding};

const SHT_PROGBITS: u32 = 1;
const SHT_STRTAB: u32 = 3;
const SHT_DYNAMIC: u32 = 6;

pub const ET_REL: u16 = 1;
pub const ET_EXEC: u16 = 2;

/// Description of one compile unit to synthesize.
pub struct UnitSpec {
    pub version: u16,
    pub name: &'static str,
    pub comp_dir: &'static str,
    pub producer: &'static str,
    /// Headers as (directory, file name).
    pub headers: Vec<(&'static str, &'static str)>,
    /// Line of `main` in the primary file, if the unit defines it.
    pub main_line: Option<u64>,
    /// Offset of the unit's table in `.debug_macinfo`.
    pub macinfo: Option<u64>,
}

impl Default for UnitSpec {
    fn default() -> Self {
        Self {
            version: 4,
            name: "src/main.c",
            comp_dir: "/home/u/app",
            producer: "GNU C17 9.4.0 -mtune=generic -g3 -O0",
            headers: vec![
                ("/usr/include", "stdio.h"),
                ("/usr/include/x86_64-linux-gnu/bits", "types.h"),
                ("include", "app.h"),
            ],
            main_line: Some(39),
            macinfo: None,
        }
    }
}

/// Builds the DWARF sections of one compile unit, as (section name,
/// contents) pairs.
pub fn dwarf_sections(spec: &UnitSpec) -> Vec<(&'static str, Vec<u8>)> {
    let encoding = Encoding {
        format: Format::Dwarf32,
        version: spec.version,
        address_size: 8,
    };
    let mut dwarf = DwarfUnit::new(encoding);
    let mut program = LineProgram::new(
        encoding,
        LineEncoding::default(),
        LineString::String(spec.comp_dir.as_bytes().to_vec()),
        LineString::String(spec.name.as_bytes().to_vec()),
        None,
    );
    let primary = program.add_file(
        LineString::String(spec.name.as_bytes().to_vec()),
        program.default_directory(),
        None,
    );
    let mut header_files = vec![];
    for (dir, file) in &spec.headers {
        let dir = program.add_directory(LineString::String(dir.as_bytes().to_vec()));
        header_files.push(program.add_file(LineString::String(file.as_bytes().to_vec()), dir, None));
    }

    program.begin_sequence(Some(Address::Constant(0x1000)));
    program.row().file = primary;
    program.row().line = spec.main_line.unwrap_or(1);
    program.row().address_offset = 0;
    program.generate_row();
    for (i, file) in header_files.iter().enumerate() {
        program.row().file = *file;
        program.row().line = 10 + i as u64;
        program.row().address_offset = 0x10 * (i as u64 + 1);
        program.generate_row();
    }
    program.end_sequence(0x100);
    dwarf.unit.line_program = program;

    let root = dwarf.unit.root();
    let entry = dwarf.unit.get_mut(root);
    entry.set(gimli::DW_AT_name, AttributeValue::String(spec.name.as_bytes().to_vec()));
    entry.set(
        gimli::DW_AT_comp_dir,
        AttributeValue::String(spec.comp_dir.as_bytes().to_vec()),
    );
    entry.set(
        gimli::DW_AT_producer,
        AttributeValue::String(spec.producer.as_bytes().to_vec()),
    );
    entry.set(gimli::DW_AT_language, AttributeValue::Language(gimli::DW_LANG_C99));
    entry.set(gimli::DW_AT_low_pc, AttributeValue::Address(Address::Constant(0x1000)));
    entry.set(gimli::DW_AT_high_pc, AttributeValue::Udata(0x100));
    entry.set(gimli::DW_AT_stmt_list, AttributeValue::LineProgramRef);
    if let Some(offset) = spec.macinfo {
        entry.set(
            gimli::DW_AT_macro_info,
            AttributeValue::DebugMacinfoRef(gimli::DebugMacinfoOffset(offset as usize)),
        );
    }

    if let Some(line) = spec.main_line {
        let main = dwarf.unit.add(root, gimli::DW_TAG_subprogram);
        let entry = dwarf.unit.get_mut(main);
        entry.set(gimli::DW_AT_name, AttributeValue::String(b"main".to_vec()));
        entry.set(gimli::DW_AT_external, AttributeValue::Flag(true));
        entry.set(gimli::DW_AT_decl_file, AttributeValue::FileIndex(Some(primary)));
        entry.set(gimli::DW_AT_decl_line, AttributeValue::Udata(line));
        entry.set(gimli::DW_AT_low_pc, AttributeValue::Address(Address::Constant(0x1000)));
        entry.set(gimli::DW_AT_high_pc, AttributeValue::Udata(0x40));
    }

    let mut sections = Sections::new(EndianVec::new(gimli::LittleEndian));
    dwarf.write(&mut sections).unwrap();
    let mut out = vec![];
    sections
        .for_each(|id, data| {
            if !data.slice().is_empty() {
                out.push((id.name(), data.slice().to_vec()));
            }
            Ok::<(), gimli::write::Error>(())
        })
        .unwrap();
    out
}

/// A `.debug_macinfo` table in the shape GCC emits for `-g3`.
pub struct Macinfo(Vec<u8>);

impl Macinfo {
    pub fn new() -> Self {
        Self(vec![])
    }

    pub fn define(mut self, line: u64, text: &str) -> Self {
        self.0.push(0x01);
        uleb(&mut self.0, line);
        self.0.extend(text.as_bytes());
        self.0.push(0);
        self
    }

    pub fn undef(mut self, line: u64, name: &str) -> Self {
        self.0.push(0x02);
        uleb(&mut self.0, line);
        self.0.extend(name.as_bytes());
        self.0.push(0);
        self
    }

    pub fn start_file(mut self, line: u64, file: u64) -> Self {
        self.0.push(0x03);
        uleb(&mut self.0, line);
        uleb(&mut self.0, file);
        self
    }

    pub fn end_file(mut self) -> Self {
        self.0.push(0x04);
        self
    }

    /// Appends bytes as they are, for tables that are damaged on purpose.
    pub fn raw(mut self, bytes: &[u8]) -> Self {
        self.0.extend(bytes);
        self
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.0.push(0);
        self.0
    }
}

fn uleb(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

struct ElfSection {
    name: String,
    kind: u32,
    data: Vec<u8>,
    link: u32,
    entry_size: u64,
}

/// Little-endian ELF64 writer: a header, section contents, and a section
/// header table. No program headers.
pub struct ElfBuilder {
    file_type: u16,
    sections: Vec<ElfSection>,
}

impl ElfBuilder {
    pub fn new(file_type: u16) -> Self {
        Self {
            file_type,
            sections: vec![],
        }
    }

    pub fn section(mut self, name: &str, data: Vec<u8>) -> Self {
        self.sections.push(ElfSection {
            name: name.to_string(),
            kind: SHT_PROGBITS,
            data,
            link: 0,
            entry_size: 0,
        });
        self
    }

    pub fn sections(self, sections: Vec<(&str, Vec<u8>)>) -> Self {
        sections
            .into_iter()
            .fold(self, |elf, (name, data)| elf.section(name, data))
    }

    /// Adds `.dynstr` and `.dynamic` naming `libraries` as `DT_NEEDED`.
    pub fn needed(mut self, libraries: &[&str], runpath: Option<&str>) -> Self {
        let mut strings = vec![0u8];
        let mut dynamic = vec![];
        let mut add = |tag: u64, value: &str, strings: &mut Vec<u8>| {
            dynamic.extend(tag.to_le_bytes());
            dynamic.extend((strings.len() as u64).to_le_bytes());
            strings.extend(value.as_bytes());
            strings.push(0);
        };
        for lib in libraries {
            add(1, *lib, &mut strings);
        }
        if let Some(path) = runpath {
            add(29, path, &mut strings);
        }
        dynamic.extend([0u8; 16]);

        // Section indices start at 1, after the null section.
        let strtab_index = self.sections.len() as u32 + 1;
        self.sections.push(ElfSection {
            name: ".dynstr".to_string(),
            kind: SHT_STRTAB,
            data: strings,
            link: 0,
            entry_size: 0,
        });
        self.sections.push(ElfSection {
            name: ".dynamic".to_string(),
            kind: SHT_DYNAMIC,
            data: dynamic,
            link: strtab_index,
            entry_size: 16,
        });
        self
    }

    pub fn build(mut self) -> Vec<u8> {
        self.sections.push(ElfSection {
            name: ".shstrtab".to_string(),
            kind: SHT_STRTAB,
            data: vec![],
            link: 0,
            entry_size: 0,
        });
        let mut names = vec![0u8];
        let name_offsets: Vec<u32> = self
            .sections
            .iter()
            .map(|s| {
                let offset = names.len() as u32;
                names.extend(s.name.as_bytes());
                names.push(0);
                offset
            })
            .collect();
        if let Some(last) = self.sections.last_mut() {
            last.data = names;
        }

        let mut out = vec![0u8; 64];
        let mut offsets = vec![];
        for s in &self.sections {
            align(&mut out, 8);
            offsets.push(out.len() as u64);
            out.extend(&s.data);
        }
        align(&mut out, 8);
        let shoff = out.len() as u64;

        out.extend([0u8; 64]);
        for ((s, name), offset) in self.sections.iter().zip(&name_offsets).zip(&offsets) {
            out.extend(name.to_le_bytes());
            out.extend(s.kind.to_le_bytes());
            out.extend(0u64.to_le_bytes()); // flags
            out.extend(0u64.to_le_bytes()); // addr
            out.extend(offset.to_le_bytes());
            out.extend((s.data.len() as u64).to_le_bytes());
            out.extend(s.link.to_le_bytes());
            out.extend(0u32.to_le_bytes()); // info
            out.extend(1u64.to_le_bytes()); // addralign
            out.extend(s.entry_size.to_le_bytes());
        }

        let mut header = vec![0x7f, b'E', b'L', b'F', 2, 1, 1, 0];
        header.extend([0u8; 8]);
        header.extend(self.file_type.to_le_bytes());
        header.extend(62u16.to_le_bytes()); // x86-64
        header.extend(1u32.to_le_bytes());
        header.extend(0u64.to_le_bytes()); // entry
        header.extend(0u64.to_le_bytes()); // phoff
        header.extend(shoff.to_le_bytes());
        header.extend(0u32.to_le_bytes()); // flags
        header.extend(64u16.to_le_bytes()); // ehsize
        header.extend(0u16.to_le_bytes()); // phentsize
        header.extend(0u16.to_le_bytes()); // phnum
        header.extend(64u16.to_le_bytes()); // shentsize
        header.extend((self.sections.len() as u16 + 1).to_le_bytes());
        header.extend((self.sections.len() as u16).to_le_bytes()); // shstrndx
        out[..64].copy_from_slice(&header);
        out
    }
}

fn align(out: &mut Vec<u8>, to: usize) {
    while out.len() % to != 0 {
        out.push(0);
    }
}

/// A relocatable object holding one compile unit.
pub fn object_file(spec: UnitSpec) -> Vec<u8> {
    ElfBuilder::new(ET_REL)
        .sections(dwarf_sections(&spec))
        .build()
}

/// A System V `ar` archive.
pub fn archive(members: &[(&str, &[u8])]) -> Vec<u8> {
    let mut out = b"!<arch>\n".to_vec();
    for (name, data) in members {
        let header = format!(
            "{:<16}{:<12}{:<6}{:<6}{:<8}{:<10}`\n",
            format!("{}/", name),
            0,
            0,
            0,
            644,
            data.len()
        );
        assert_eq!(header.len(), 60);
        out.extend(header.as_bytes());
        out.extend(*data);
        if out.len() % 2 == 1 {
            out.push(b'\n');
        }
    }
    out
}

pub const CPU_X86_64: u32 = 0x0100_0007;
pub const CPU_ARM64: u32 = 0x0100_000c;

const LC_SEGMENT_64: u32 = 0x19;
const LC_RPATH: u32 = 0x8000_001c;

/// A 64-bit little-endian Mach-O executable: dylib commands
/// (`LC_LOAD_DYLIB` and friends) or `LC_RPATH` with their strings, and
/// optionally a `__DWARF` segment.
pub struct MachOBuilder {
    cputype: u32,
    commands: Vec<(u32, String)>,
    sections: Vec<(String, Vec<u8>)>,
}

impl MachOBuilder {
    pub fn new(cputype: u32) -> Self {
        Self {
            cputype,
            commands: vec![],
            sections: vec![],
        }
    }

    pub fn command(mut self, cmd: u32, text: &str) -> Self {
        self.commands.push((cmd, text.to_string()));
        self
    }

    /// Adds sections to the `__DWARF` segment. ELF names are converted the
    /// way Mach-O spells them (`.debug_info` becomes `__debug_info`).
    pub fn sections(mut self, sections: Vec<(&str, Vec<u8>)>) -> Self {
        for (name, data) in sections {
            let mut name = format!("__{}", name.trim_start_matches('.'));
            name.truncate(16);
            self.sections.push((name, data));
        }
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut commands = vec![];
        for (cmd, text) in &self.commands {
            let fixed = if *cmd == LC_RPATH { 12 } else { 24 };
            let mut size = fixed + text.len() + 1;
            size = (size + 7) & !7;
            commands.extend(cmd.to_le_bytes());
            commands.extend((size as u32).to_le_bytes());
            commands.extend((fixed as u32).to_le_bytes());
            if *cmd != LC_RPATH {
                commands.extend(2u32.to_le_bytes()); // timestamp
                commands.extend(0x0001_0000u32.to_le_bytes()); // current version
                commands.extend(0x0001_0000u32.to_le_bytes()); // compatibility version
            }
            commands.extend(text.as_bytes());
            commands.resize(commands.len() + size - fixed - text.len(), 0);
        }
        let mut count = self.commands.len() as u32;

        let segment_size = if self.sections.is_empty() {
            0
        } else {
            72 + 80 * self.sections.len()
        };
        let data_start = (32 + commands.len() + segment_size + 7) & !7;
        let mut data = vec![];
        if !self.sections.is_empty() {
            let mut headers = vec![];
            for (name, contents) in &self.sections {
                let offset = data_start + data.len();
                headers.extend(name16(name));
                headers.extend(name16("__DWARF"));
                headers.extend(((offset - data_start) as u64).to_le_bytes()); // addr
                headers.extend((contents.len() as u64).to_le_bytes());
                headers.extend((offset as u32).to_le_bytes());
                headers.extend([0u8; 4 * 7]); // align, relocations, flags, reserved
                data.extend(contents);
                align(&mut data, 8);
            }
            commands.extend(LC_SEGMENT_64.to_le_bytes());
            commands.extend((segment_size as u32).to_le_bytes());
            commands.extend(name16("__DWARF"));
            commands.extend(0u64.to_le_bytes()); // vmaddr
            commands.extend((data.len() as u64).to_le_bytes());
            commands.extend((data_start as u64).to_le_bytes());
            commands.extend((data.len() as u64).to_le_bytes());
            commands.extend([0u8; 8]); // protections
            commands.extend((self.sections.len() as u32).to_le_bytes());
            commands.extend(0u32.to_le_bytes()); // flags
            commands.extend(headers);
            count += 1;
        }

        let mut out = vec![];
        out.extend(0xfeed_facfu32.to_le_bytes());
        out.extend(self.cputype.to_le_bytes());
        out.extend(3u32.to_le_bytes());
        out.extend(2u32.to_le_bytes()); // MH_EXECUTE
        out.extend(count.to_le_bytes());
        out.extend((commands.len() as u32).to_le_bytes());
        out.extend(0u32.to_le_bytes());
        out.extend(0u32.to_le_bytes());
        out.extend(commands);
        out.resize(data_start, 0);
        out.extend(data);
        out
    }
}

fn name16(name: &str) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[..name.len()].copy_from_slice(name.as_bytes());
    out
}

/// A Mach-O executable with dylib and rpath commands only.
pub fn macho(commands: &[(u32, &str)]) -> Vec<u8> {
    commands
        .iter()
        .fold(MachOBuilder::new(CPU_X86_64), |macho, (cmd, text)| {
            macho.command(*cmd, text)
        })
        .build()
}

/// A fat Mach-O file holding one slice per (cputype, image).
pub fn fat(slices: &[(u32, &[u8])]) -> Vec<u8> {
    let mut offsets = vec![];
    let mut end = 8 + 20 * slices.len();
    for (_, image) in slices {
        let offset = (end + 15) & !15;
        offsets.push(offset);
        end = offset + image.len();
    }

    let mut out = vec![];
    out.extend(0xcafe_babeu32.to_be_bytes());
    out.extend((slices.len() as u32).to_be_bytes());
    for ((cputype, image), offset) in slices.iter().zip(&offsets) {
        out.extend(cputype.to_be_bytes());
        out.extend(3u32.to_be_bytes()); // cpusubtype
        out.extend((*offset as u32).to_be_bytes());
        out.extend((image.len() as u32).to_be_bytes());
        out.extend(4u32.to_be_bytes()); // alignment, as a power of two
    }
    for ((_, image), offset) in slices.iter().zip(&offsets) {
        out.resize(*offset, 0);
        out.extend(*image);
    }
    out
}

/// A PE32+ executable whose only section holds an import directory. Each
/// entry is a DLL and the functions imported from it by name.
pub fn pe(imports: &[(&str, &[&str])]) -> Vec<u8> {
    const IDATA_RVA: u32 = 0x1000;
    let rva = |offset: usize| IDATA_RVA + offset as u32;

    let table_len = 20 * (imports.len() + 1);
    let mut idata = vec![0u8; table_len];
    for (i, (dll, functions)) in imports.iter().enumerate() {
        let name = idata.len();
        idata.extend(dll.as_bytes());
        idata.push(0);
        align(&mut idata, 8);
        let thunks = idata.len();
        idata.resize(thunks + 8 * (functions.len() + 1), 0);
        for (j, function) in functions.iter().enumerate() {
            align(&mut idata, 2);
            let hint = idata.len();
            idata.extend(0u16.to_le_bytes());
            idata.extend(function.as_bytes());
            idata.push(0);
            let at = thunks + 8 * j;
            idata[at..at + 8].copy_from_slice(&u64::from(rva(hint)).to_le_bytes());
        }
        let descriptor = 20 * i;
        put_u32(&mut idata, descriptor, rva(thunks)); // OriginalFirstThunk
        put_u32(&mut idata, descriptor + 12, rva(name));
        put_u32(&mut idata, descriptor + 16, rva(thunks)); // FirstThunk
    }
    let raw_size = (idata.len() + 0x1ff) & !0x1ff;
    let image_size = 0x1000 + ((idata.len() + 0xfff) & !0xfff);

    let mut headers = b"PE\0\0".to_vec();
    headers.extend(0x8664u16.to_le_bytes()); // x86-64
    headers.extend(1u16.to_le_bytes()); // sections
    headers.extend([0u8; 12]); // timestamp, symbol table
    headers.extend(240u16.to_le_bytes()); // optional header size
    headers.extend(0x22u16.to_le_bytes()); // executable, large address aware

    headers.extend(0x20bu16.to_le_bytes()); // PE32+
    headers.extend([0u8; 22]); // linker version, sizes, entry point, base of code
    headers.extend(0x1_4000_0000u64.to_le_bytes()); // image base
    headers.extend(0x1000u32.to_le_bytes()); // section alignment
    headers.extend(0x200u32.to_le_bytes()); // file alignment
    headers.extend(6u16.to_le_bytes()); // OS version
    headers.extend([0u8; 6]);
    headers.extend(6u16.to_le_bytes()); // subsystem version
    headers.extend([0u8; 6]);
    headers.extend((image_size as u32).to_le_bytes());
    headers.extend(0x200u32.to_le_bytes()); // size of headers
    headers.extend(0u32.to_le_bytes()); // checksum
    headers.extend(3u16.to_le_bytes()); // console
    headers.extend(0u16.to_le_bytes()); // DLL characteristics
    headers.extend([0u8; 32]); // stack and heap sizes
    headers.extend(0u32.to_le_bytes()); // loader flags
    headers.extend(16u32.to_le_bytes()); // data directories
    for index in 0..16 {
        let (address, size) = if index == 1 {
            (IDATA_RVA, table_len as u32)
        } else {
            (0, 0)
        };
        headers.extend(address.to_le_bytes());
        headers.extend(size.to_le_bytes());
    }

    headers.extend(name8(".idata"));
    headers.extend((idata.len() as u32).to_le_bytes()); // virtual size
    headers.extend(IDATA_RVA.to_le_bytes());
    headers.extend((raw_size as u32).to_le_bytes());
    headers.extend(0x200u32.to_le_bytes()); // file offset
    headers.extend([0u8; 12]); // relocations, line numbers
    headers.extend(0xc000_0040u32.to_le_bytes()); // initialized data, read, write

    let mut out = vec![0u8; 0x200];
    out[..2].copy_from_slice(b"MZ");
    out[0x3c..0x40].copy_from_slice(&0x40u32.to_le_bytes());
    out[0x40..0x40 + headers.len()].copy_from_slice(&headers);
    out.extend(idata);
    out.resize(0x200 + raw_size, 0);
    out
}

fn name8(name: &str) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[..name.len()].copy_from_slice(name.as_bytes());
    out
}

fn put_u32(out: &mut [u8], at: usize, value: u32) {
    out[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

/// Puts `bytes` in front of the named section.
pub fn prepend(sections: &mut [(&str, Vec<u8>)], name: &str, bytes: &[u8]) {
    for (section, data) in sections.iter_mut() {
        if *section == name {
            data.splice(0..0, bytes.iter().copied());
        }
    }
}
