use std::fmt;

use log::{debug, info};

use crate::bytes::Cursor;
use crate::code::{ByteCode, DumpEntry};
use crate::error::Error;
use crate::tables::{FloatTable, IdentTable, StringTable};

/// On-disk layout profile, selected once from the version word.
///
/// v41 widens the float tables to f64, prefixes the code stream with a
/// line-break pair count, and widens `0xFF` extension operands to four
/// bytes. Versions 33-40 parse with the narrow layout; anything else is
/// rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Legacy(u32),
    V41,
}

impl Format {
    pub fn from_version(version: u32) -> Result<Self, Error> {
        match version {
            41 => Ok(Self::V41),
            33..=40 => Ok(Self::Legacy(version)),
            other => Err(Error::UnsupportedVersion(other)),
        }
    }

    #[must_use]
    pub fn version(self) -> u32 {
        match self {
            Self::Legacy(version) => version,
            Self::V41 => 41,
        }
    }

    #[must_use]
    pub fn wide_floats(self) -> bool {
        matches!(self, Self::V41)
    }

    #[must_use]
    pub fn has_line_break_pairs(self) -> bool {
        matches!(self, Self::V41)
    }

    #[must_use]
    pub fn wide_extensions(self) -> bool {
        matches!(self, Self::V41)
    }
}

/// A DSO file: six strictly sequential sections, then the ident-table
/// patch applied to the code stream.
#[derive(Debug, Clone)]
pub struct Dso {
    name: String,
    reader: Cursor,
    parsed: bool,
    version: u32,
    format: Option<Format>,
    pub(crate) global_strings: StringTable,
    pub(crate) function_strings: StringTable,
    pub(crate) global_floats: FloatTable,
    pub(crate) function_floats: FloatTable,
    pub(crate) byte_code: Option<ByteCode>,
    ident_table: IdentTable,
}

impl Dso {
    /// Wrap raw file contents without parsing them yet.
    #[must_use]
    pub fn open(name: impl Into<String>, data: &[u8]) -> Self {
        Self {
            name: name.into(),
            reader: Cursor::new(data.to_vec()),
            parsed: false,
            version: 0,
            format: None,
            global_strings: StringTable::default(),
            function_strings: StringTable::default(),
            global_floats: FloatTable::default(),
            function_floats: FloatTable::default(),
            byte_code: None,
            ident_table: IdentTable::default(),
        }
    }

    /// Open and parse in one step.
    pub fn parse(name: impl Into<String>, data: &[u8]) -> Result<Self, Error> {
        let mut dso = Self::open(name, data);
        dso.parse_sections()?;
        Ok(dso)
    }

    /// Parse all sections and apply the string patch. The whole input must
    /// be consumed.
    pub fn parse_sections(&mut self) -> Result<(), Error> {
        self.version = self.reader.read_u32()?;
        info!("DSO file version: {}", self.version);
        let format = Format::from_version(self.version)?;
        self.format = Some(format);

        self.global_strings = StringTable::parse(&mut self.reader)?;
        debug!("global string table size: {}", self.global_strings.len());
        self.function_strings = StringTable::parse(&mut self.reader)?;
        debug!("function string table size: {}", self.function_strings.len());
        self.global_floats = FloatTable::parse(&mut self.reader, format.wide_floats())?;
        debug!("global float table size: {}", self.global_floats.len());
        self.function_floats = FloatTable::parse(&mut self.reader, format.wide_floats())?;
        debug!("function float table size: {}", self.function_floats.len());

        let mut byte_code = ByteCode::parse(&mut self.reader, format)?;
        debug!("bytecode size: {}", byte_code.binary_length());
        self.ident_table = IdentTable::parse(&mut self.reader)?;
        debug!("ident table size: {}", self.ident_table.len());

        if !self.reader.is_at_end() {
            return Err(Error::Parsing(format!(
                "parsing did not reach EOF ({} bytes left)",
                self.reader.remaining()
            )));
        }

        byte_code.patch_strings(&self.ident_table, &mut self.global_strings)?;
        debug!("bytecode size after patching: {}", byte_code.binary_length());
        self.byte_code = Some(byte_code);
        self.parsed = true;
        Ok(())
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn is_parsed(&self) -> bool {
        self.parsed
    }

    pub fn version(&self) -> Result<u32, Error> {
        self.parsed.then_some(self.version).ok_or(Error::NotParsed)
    }

    pub fn format(&self) -> Result<Format, Error> {
        self.format.ok_or(Error::NotParsed)
    }

    #[must_use]
    pub fn global_strings(&self) -> &StringTable {
        &self.global_strings
    }

    #[must_use]
    pub fn function_strings(&self) -> &StringTable {
        &self.function_strings
    }

    #[must_use]
    pub fn global_floats(&self) -> &FloatTable {
        &self.global_floats
    }

    #[must_use]
    pub fn function_floats(&self) -> &FloatTable {
        &self.function_floats
    }

    pub fn byte_code(&self) -> Result<&ByteCode, Error> {
        self.byte_code.as_ref().ok_or(Error::NotParsed)
    }

    #[must_use]
    pub fn ident_table(&self) -> &IdentTable {
        &self.ident_table
    }

    /// Textual dump of every parsed structure, for `--parse-only` output.
    pub fn dump(&self, sink: &mut impl fmt::Write) -> Result<(), Error> {
        if !self.parsed {
            return Err(Error::NotParsed);
        }
        let byte_code = self.byte_code()?;

        writeln!(sink, "Script version: {}", self.version).map_err(fmt_err)?;
        writeln!(sink).map_err(fmt_err)?;

        for (title, table) in [
            ("Global strings", &self.global_strings),
            ("Function strings", &self.function_strings),
        ] {
            writeln!(sink, "{title} ({} entries):", table.len()).map_err(fmt_err)?;
            for (offset, string) in table.iter() {
                writeln!(sink, "  {offset}: {string:?}").map_err(fmt_err)?;
            }
            writeln!(sink).map_err(fmt_err)?;
        }

        for (title, table) in [
            ("Global floats", &self.global_floats),
            ("Function floats", &self.function_floats),
        ] {
            writeln!(sink, "{title} ({} entries):", table.len()).map_err(fmt_err)?;
            for (index, value) in table.iter().enumerate() {
                writeln!(sink, "  {index}: {value}").map_err(fmt_err)?;
            }
            writeln!(sink).map_err(fmt_err)?;
        }

        writeln!(
            sink,
            "Bytecode: {} codes, {} bytes, {} line-break pairs",
            byte_code.code_count(),
            byte_code.binary_length(),
            byte_code.line_break_pair_count(),
        )
        .map_err(fmt_err)?;
        writeln!(sink, "Dump table:").map_err(fmt_err)?;
        for (offset, entry) in byte_code.dump_table() {
            match entry {
                DumpEntry::Code(value) => {
                    writeln!(sink, "  {offset}: {value}").map_err(fmt_err)?;
                }
                DumpEntry::Str(string) => {
                    writeln!(sink, "  {offset}: {string:?}").map_err(fmt_err)?;
                }
            }
        }
        writeln!(sink, "Index table: {:?}", byte_code.index_table()).map_err(fmt_err)?;
        writeln!(sink, "Patched locations: {:?}", byte_code.patched_locations())
            .map_err(fmt_err)?;

        writeln!(sink, "Ident table ({} entries):", self.ident_table.len()).map_err(fmt_err)?;
        for (offset, locations) in self.ident_table.iter() {
            writeln!(sink, "  {offset}: {locations:?}").map_err(fmt_err)?;
        }
        Ok(())
    }

    /// Structural differences between two parsed files, one line each.
    pub fn compare(&self, other: &Dso) -> Result<Vec<String>, Error> {
        if !self.parsed || !other.parsed {
            return Err(Error::NotParsed);
        }
        let mut out = Vec::new();
        if self.version != other.version {
            out.push(format!("version: {} vs {}", self.version, other.version));
        }
        for (title, a, b) in [
            ("global strings", &self.global_strings, &other.global_strings),
            (
                "function strings",
                &self.function_strings,
                &other.function_strings,
            ),
        ] {
            for line in a.diff(b) {
                out.push(format!("{title}: {line}"));
            }
        }
        for (title, a, b) in [
            ("global floats", &self.global_floats, &other.global_floats),
            (
                "function floats",
                &self.function_floats,
                &other.function_floats,
            ),
        ] {
            for line in a.diff(b) {
                out.push(format!("{title}: {line}"));
            }
        }

        let code_a = self.byte_code()?;
        let code_b = other.byte_code()?;
        let mut entries_a = code_a.dump_table().iter();
        let mut entries_b = code_b.dump_table().iter();
        loop {
            match (entries_a.next(), entries_b.next()) {
                (Some(a), Some(b)) => {
                    if a != b {
                        out.push(format!("dump table: {}:{:?} vs {}:{:?}", a.0, a.1, b.0, b.1));
                    }
                }
                (Some(a), None) => {
                    out.push(format!("dump table: {}:{:?} vs <absent>", a.0, a.1));
                }
                (None, Some(b)) => {
                    out.push(format!("dump table: <absent> vs {}:{:?}", b.0, b.1));
                }
                (None, None) => break,
            }
        }
        Ok(out)
    }
}

fn fmt_err(_: fmt::Error) -> Error {
    Error::Parsing("formatter sink failed".into())
}
