use std::collections::{BTreeMap, BTreeSet};

use log::debug;

use crate::bytes::Cursor;
use crate::dso::Format;
use crate::error::Error;
use crate::ops::EXT_CONTROL;
use crate::tables::{IdentTable, StringTable};

/// One decoded entry of the dump table: the code value read at a byte
/// offset, or the string a patch resolved that offset to.
#[derive(Debug, Clone, PartialEq)]
pub enum DumpEntry {
    Code(u32),
    Str(String),
}

/// The packed code stream of a DSO file.
///
/// Codes are variable-width: a plain byte, or `0xFF` followed by the full
/// value (four bytes on v41, two before). `index_table` maps the logical
/// code index to the byte offset of that code; the ident-table patcher
/// keeps it consistent while widening patched bytes.
#[derive(Debug, Clone)]
pub struct ByteCode {
    stream: Cursor,
    format: Format,
    code_count: usize,
    binary_length: usize,
    index_table: Vec<usize>,
    dump_table: BTreeMap<usize, DumpEntry>,
    patched_locations: BTreeSet<usize>,
    line_break_pair_count: u32,
    last_offset_patched: bool,
}

impl ByteCode {
    pub fn parse(cursor: &mut Cursor, format: Format) -> Result<Self, Error> {
        let code_count = cursor.read_u32()? as usize;
        let line_break_pair_count = if format.has_line_break_pairs() {
            cursor.read_u32()?
        } else {
            0
        };
        debug!("line break pair count (unused): {line_break_pair_count}");

        let mut bytes = Vec::with_capacity(code_count);
        let mut index_table = Vec::with_capacity(code_count);
        let mut dump_table = BTreeMap::new();
        for _ in 0..code_count {
            let start = bytes.len();
            let first = cursor.read_u8()?;
            bytes.push(first);
            let value = if first == EXT_CONTROL {
                if format.wide_extensions() {
                    let ext = cursor.read(4)?;
                    bytes.extend_from_slice(ext);
                    u32::from_le_bytes(ext.try_into().expect("four bytes"))
                } else {
                    let ext = cursor.read(2)?;
                    bytes.extend_from_slice(ext);
                    u32::from(u16::from_le_bytes(ext.try_into().expect("two bytes")))
                }
            } else {
                u32::from(first)
            };
            dump_table.insert(start, DumpEntry::Code(value));
            index_table.push(start);
        }

        // Line-break pairs trail the code; consumed and discarded.
        for _ in 0..line_break_pair_count * 2 {
            cursor.read_u32()?;
        }

        let binary_length = bytes.len();
        Ok(Self {
            stream: Cursor::new(bytes),
            format,
            code_count,
            binary_length,
            index_table,
            dump_table,
            patched_locations: BTreeSet::new(),
            line_break_pair_count,
            last_offset_patched: false,
        })
    }

    #[must_use]
    pub fn code_count(&self) -> usize {
        self.code_count
    }

    #[must_use]
    pub fn binary_length(&self) -> usize {
        self.binary_length
    }

    #[must_use]
    pub fn position(&self) -> usize {
        self.stream.position()
    }

    pub fn seek(&mut self, position: usize) {
        self.stream.seek(position);
    }

    #[must_use]
    pub fn dump_table(&self) -> &BTreeMap<usize, DumpEntry> {
        &self.dump_table
    }

    #[must_use]
    pub fn index_table(&self) -> &[usize] {
        &self.index_table
    }

    #[must_use]
    pub fn patched_locations(&self) -> &BTreeSet<usize> {
        &self.patched_locations
    }

    #[must_use]
    pub fn line_break_pair_count(&self) -> u32 {
        self.line_break_pair_count
    }

    /// Byte offset of the code at `code_index`.
    pub fn byte_offset(&self, code_index: u32) -> Result<usize, Error> {
        self.index_table
            .get(code_index as usize)
            .copied()
            .ok_or_else(|| Error::Parsing(format!("code index {code_index} out of range")))
    }

    /// Raw bytes of the stream between two offsets, for diagnostics.
    pub fn dump(&self, start: usize, end: usize) -> Result<&[u8], Error> {
        Ok(self.stream.slice(start, end)?)
    }

    /// One logical opcode: a byte, or the extended value after `0xFF`.
    pub fn get_code(&mut self) -> Result<u32, Error> {
        let code = self.stream.read_u8()?;
        if code == EXT_CONTROL {
            if self.format.wide_extensions() {
                Ok(self.stream.read_u32()?)
            } else {
                Ok(u32::from(self.stream.read_u16()?))
            }
        } else {
            Ok(u32::from(code))
        }
    }

    /// Next code byte without advancing; extensions are not followed.
    pub fn peek_code(&self) -> Result<u32, Error> {
        Ok(u32::from(self.stream.lookup_u8()?))
    }

    /// Next full code without advancing, following an `0xFF` extension.
    pub fn peek_code_full(&self) -> Result<u32, Error> {
        let first = self.stream.lookup_u8()?;
        if first != EXT_CONTROL {
            return Ok(u32::from(first));
        }
        if self.format.wide_extensions() {
            let bytes = self.stream.lookup(5)?;
            Ok(u32::from_le_bytes(bytes[1..5].try_into().expect("four bytes")))
        } else {
            let bytes = self.stream.lookup(3)?;
            Ok(u32::from(u16::from_le_bytes(
                bytes[1..3].try_into().expect("two bytes"),
            )))
        }
    }

    /// Immediate unsigned operand: a byte, or `0xFF` plus the full value.
    pub fn get_uint(&mut self) -> Result<u32, Error> {
        if self.stream.lookup_u8()? == EXT_CONTROL {
            self.stream.read_u8()?;
            if self.format.wide_extensions() {
                Ok(self.stream.read_u32()?)
            } else {
                Ok(u32::from(self.stream.read_u16()?))
            }
        } else {
            Ok(u32::from(self.stream.read_u8()?))
        }
    }

    /// String-table offset operand. A previously patched location always
    /// holds a full little-endian u32 and resolves against the global
    /// table; `last_offset_patched` records which case was hit.
    pub fn get_string_offset(&mut self) -> Result<u32, Error> {
        if self.patched_locations.contains(&self.stream.position()) {
            self.last_offset_patched = true;
            return Ok(self.stream.read_u32()?);
        }
        self.last_offset_patched = false;
        if self.stream.lookup_u8()? == EXT_CONTROL {
            self.stream.read_u8()?;
            let offset = if self.format.wide_extensions() {
                self.stream.read_u32()?
            } else {
                u32::from(self.stream.read_u16()?)
            };
            debug!("string offset {offset} from control code");
            Ok(offset)
        } else {
            Ok(u32::from(self.stream.read_u8()?))
        }
    }

    /// Whether the offset returned by the last `get_string_offset` came
    /// from a patched location.
    #[must_use]
    pub fn last_offset_patched(&self) -> bool {
        self.last_offset_patched
    }

    /// Float-table offset operand; same width rule as `get_uint`.
    pub fn get_float_offset(&mut self) -> Result<usize, Error> {
        Ok(self.get_uint()? as usize)
    }

    /// Resolve the ident table into the stream: every listed code index
    /// currently holds a zero byte which is widened to the four-byte string
    /// offset, shifting the index table and the recorded patch locations.
    pub fn patch_strings(
        &mut self,
        ident_table: &IdentTable,
        strings: &mut StringTable,
    ) -> Result<(), Error> {
        for (offset, locations) in ident_table.iter() {
            if !strings.contains(offset) {
                // Unused function locals are patched in with offsets past
                // the global blob; keep them addressable.
                debug!("patch offset {offset} not in string table, adding placeholder");
                strings.insert_placeholder(offset, &format!("%unused_var{offset}"));
            }
            let resolved = strings.get(offset)?;

            for &code_index in locations {
                let loc = self.byte_offset(code_index)?;
                if self.stream.get(loc)? != 0 {
                    return Err(Error::Parsing(format!(
                        "patch target at byte {loc} is not a zero byte"
                    )));
                }
                self.stream.insert(loc, &offset.to_le_bytes(), 1)?;
                self.binary_length += 3;

                for entry in &mut self.index_table[code_index as usize + 1..] {
                    *entry += 3;
                }
                self.patched_locations = self
                    .patched_locations
                    .iter()
                    .map(|&p| if p > loc { p + 3 } else { p })
                    .collect();
                self.patched_locations.insert(loc);

                let tail = self.dump_table.split_off(&(loc + 1));
                self.dump_table
                    .extend(tail.into_iter().map(|(k, v)| (k + 3, v)));
                self.dump_table.insert(loc, DumpEntry::Str(resolved.clone()));
            }
        }

        if self.binary_length != self.stream.len() {
            return Err(Error::Parsing(
                "stream length differs after patching".into(),
            ));
        }
        // The index table must still describe the widened stream: strictly
        // increasing, every entry in bounds. The final code may be wider
        // than one byte (the end sentinel), so only the start is checked.
        let in_order = self
            .index_table
            .windows(2)
            .all(|pair| pair[0] < pair[1]);
        let in_bounds = self
            .index_table
            .last()
            .is_none_or(|&last| last < self.binary_length);
        if !in_order || !in_bounds {
            return Err(Error::Parsing(
                "code index table inconsistent after patching".into(),
            ));
        }
        Ok(())
    }
}
