use std::collections::BTreeMap;

use crate::bytes::Cursor;
use crate::error::Error;

/// Pool of NUL-separated strings addressed by the byte offset at which each
/// begins inside the concatenated table blob.
///
/// Offsets that fall inside a stored string resolve to the suffix starting
/// there; the compiler addresses the pool that way for shared tails.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StringTable {
    entries: BTreeMap<u32, Vec<u8>>,
    binary_length: u32,
}

impl StringTable {
    pub fn parse(cursor: &mut Cursor) -> Result<Self, Error> {
        let binary_length = cursor.read_u32()?;
        let mut entries = BTreeMap::new();
        let mut offset = 0u32;
        while offset < binary_length {
            let max = (binary_length - offset - 1) as usize;
            let bytes = cursor.read_string(max)?;
            let len = bytes.len() as u32;
            entries.insert(offset, bytes);
            offset += len + 1;
        }
        Ok(Self {
            entries,
            binary_length,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn binary_length(&self) -> u32 {
        self.binary_length
    }

    #[must_use]
    pub fn contains(&self, offset: u32) -> bool {
        self.get_bytes(offset).is_ok()
    }

    /// String (or suffix of a string) beginning at `offset`.
    pub fn get_bytes(&self, offset: u32) -> Result<&[u8], Error> {
        if offset >= self.binary_length {
            return Err(Error::BadStringOffset(offset));
        }
        let (&start, bytes) = self
            .entries
            .range(..=offset)
            .next_back()
            .ok_or(Error::BadStringOffset(offset))?;
        let skip = (offset - start) as usize;
        if skip > bytes.len() {
            // Inside the gap left by a NUL separator.
            return Err(Error::BadStringOffset(offset));
        }
        Ok(&bytes[skip..])
    }

    pub fn get(&self, offset: u32) -> Result<String, Error> {
        self.get_bytes(offset).map(decode_latin1)
    }

    /// Replace the entry at `offset`. The decoder uses this to spell local
    /// and global variables with their `%`/`$` sigils.
    pub fn set(&mut self, offset: u32, value: &str) {
        self.entries
            .insert(offset, value.chars().map(|c| c as u8).collect());
    }

    /// Register a synthetic entry past the parsed blob, extending the
    /// table's binary length to keep the offset addressable.
    pub fn insert_placeholder(&mut self, offset: u32, value: &str) {
        let bytes: Vec<u8> = value.chars().map(|c| c as u8).collect();
        let end = offset.saturating_add(bytes.len() as u32 + 1);
        self.binary_length = self.binary_length.max(end);
        self.entries.insert(offset, bytes);
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, String)> + '_ {
        self.entries.iter().map(|(&k, v)| (k, decode_latin1(v)))
    }

    /// Element-wise differences against another table, for `--compare`.
    #[must_use]
    pub fn diff(&self, other: &Self) -> Vec<String> {
        let mut out = Vec::new();
        let mut a = self.entries.iter();
        let mut b = other.entries.iter();
        loop {
            match (a.next(), b.next()) {
                (Some((ka, va)), Some((kb, vb))) => {
                    if ka != kb || va != vb {
                        out.push(format!(
                            "string {}:{:?} vs {}:{:?}",
                            ka,
                            decode_latin1(va),
                            kb,
                            decode_latin1(vb)
                        ));
                    }
                }
                (Some((ka, va)), None) => {
                    out.push(format!("string {}:{:?} vs <absent>", ka, decode_latin1(va)));
                }
                (None, Some((kb, vb))) => {
                    out.push(format!("string <absent> vs {}:{:?}", kb, decode_latin1(vb)));
                }
                (None, None) => break,
            }
        }
        out
    }
}

fn decode_latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// Immutable table of IEEE-754 floats. Early DSO versions store f32, v41
/// stores f64; both are widened to f64 here.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FloatTable {
    values: Vec<f64>,
}

impl FloatTable {
    pub fn parse(cursor: &mut Cursor, wide: bool) -> Result<Self, Error> {
        let count = cursor.read_u32()?;
        let mut values = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let value = if wide {
                cursor.read_f64()?
            } else {
                f64::from(cursor.read_f32()?)
            };
            // Six digits cancels the widening noise of the f32 era.
            values.push((value * 1e6).round() / 1e6);
        }
        Ok(Self { values })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, offset: usize) -> Result<f64, Error> {
        self.values
            .get(offset)
            .copied()
            .ok_or(Error::BadFloatOffset(offset))
    }

    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        self.values.iter().copied()
    }

    #[must_use]
    pub fn diff(&self, other: &Self) -> Vec<String> {
        let longest = self.values.len().max(other.values.len());
        (0..longest)
            .filter_map(|i| {
                let a = self.values.get(i);
                let b = other.values.get(i);
                (a != b).then(|| format!("float {i}: {a:?} vs {b:?}"))
            })
            .collect()
    }
}

/// Relocation table: string-table offset to the code indices whose byte
/// must be patched with that offset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdentTable {
    entries: BTreeMap<u32, Vec<u32>>,
}

impl IdentTable {
    pub fn parse(cursor: &mut Cursor) -> Result<Self, Error> {
        let count = cursor.read_u32()?;
        let mut entries: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
        for _ in 0..count {
            let offset = cursor.read_u32()?;
            let location_count = cursor.read_u32()?;
            let locations = entries.entry(offset).or_default();
            for _ in 0..location_count {
                locations.push(cursor.read_u32()?);
            }
        }
        Ok(Self { entries })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &[u32])> + '_ {
        self.entries.iter().map(|(&k, v)| (k, v.as_slice()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn string_table(blob: &[u8]) -> StringTable {
        let mut image = (blob.len() as u32).to_le_bytes().to_vec();
        image.extend_from_slice(blob);
        StringTable::parse(&mut Cursor::new(image)).unwrap()
    }

    #[test]
    fn string_table_offsets_and_suffixes() {
        let table = string_table(b"echo\0name\0");
        assert_eq!(2, table.len());
        assert_eq!("echo", table.get(0).unwrap());
        assert_eq!("name", table.get(5).unwrap());
        // Any offset inside a string yields its suffix.
        for k in 0..4 {
            assert_eq!(&"echo"[k as usize..], table.get(k).unwrap());
        }
        assert_eq!("ame", table.get(6).unwrap());
        // The NUL boundary itself is the empty string.
        assert_eq!("", table.get(4).unwrap());
        assert_eq!(Err(Error::BadStringOffset(10)), table.get(10));
    }

    #[test]
    fn string_table_rename_and_placeholder() {
        let mut table = string_table(b"count\0");
        table.set(0, "%count");
        assert_eq!("%count", table.get(0).unwrap());
        assert!(!table.contains(40));
        table.insert_placeholder(40, "%unused_var40");
        assert_eq!("%unused_var40", table.get(40).unwrap());
        assert!(table.binary_length() > 40);
    }

    #[test]
    fn string_table_truncated_blob() {
        let mut image = 8u32.to_le_bytes().to_vec();
        image.extend_from_slice(b"abc");
        assert_eq!(
            Err(Error::OutOfRange),
            StringTable::parse(&mut Cursor::new(image)).map(|_| ())
        );
    }

    #[test]
    fn float_table_rounding() {
        let mut image = 2u32.to_le_bytes().to_vec();
        image.extend_from_slice(&5.000000001f64.to_le_bytes());
        image.extend_from_slice(&0.25f64.to_le_bytes());
        let table = FloatTable::parse(&mut Cursor::new(image), true).unwrap();
        assert_eq!(5.0, table.get(0).unwrap());
        assert_eq!(0.25, table.get(1).unwrap());
        assert_eq!(Err(Error::BadFloatOffset(2)), table.get(2));
    }

    #[test]
    fn float_table_narrow() {
        let mut image = 1u32.to_le_bytes().to_vec();
        image.extend_from_slice(&1.5f32.to_le_bytes());
        let table = FloatTable::parse(&mut Cursor::new(image), false).unwrap();
        assert_eq!(1.5, table.get(0).unwrap());
    }

    #[test]
    fn ident_table_entries() {
        let mut image = Vec::new();
        image.extend_from_slice(&2u32.to_le_bytes());
        image.extend_from_slice(&5u32.to_le_bytes()); // offset 5
        image.extend_from_slice(&2u32.to_le_bytes()); // two locations
        image.extend_from_slice(&1u32.to_le_bytes());
        image.extend_from_slice(&9u32.to_le_bytes());
        image.extend_from_slice(&0u32.to_le_bytes()); // offset 0
        image.extend_from_slice(&1u32.to_le_bytes());
        image.extend_from_slice(&4u32.to_le_bytes());
        let table = IdentTable::parse(&mut Cursor::new(image)).unwrap();
        let entries: Vec<_> = table.iter().collect();
        assert_eq!(vec![(0, &[4u32][..]), (5, &[1u32, 9][..])], entries);
    }
}
