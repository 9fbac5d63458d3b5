use std::{error, fmt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    OutOfRange,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::OutOfRange => "read past end of buffer",
        })
    }
}

impl error::Error for Error {}

/// Cursor over an owned byte buffer.
///
/// All indexing is byte-oriented. Multi-byte reads are little-endian unless
/// the `_be` variant is used. The buffer is owned rather than borrowed
/// because the ident-table patcher rewrites the code stream in place.
#[derive(Debug, Clone)]
pub struct Cursor {
    buffer: Vec<u8>,
    position: usize,
}

impl Cursor {
    #[must_use]
    pub fn new(buffer: Vec<u8>) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    #[must_use]
    pub fn position(&self) -> usize {
        self.position
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    #[must_use]
    pub fn is_at_end(&self) -> bool {
        self.position >= self.buffer.len()
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.position)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn seek(&mut self, position: usize) {
        self.position = position;
    }

    /// Read `n` bytes, advancing the cursor.
    pub fn read(&mut self, n: usize) -> Result<&[u8], Error> {
        let end = self.position.checked_add(n).ok_or(Error::OutOfRange)?;
        let bytes = self.buffer.get(self.position..end).ok_or(Error::OutOfRange)?;
        self.position = end;
        Ok(bytes)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        let bytes = self.read(N)?;
        Ok(bytes.try_into().expect("read returned N bytes"))
    }

    pub fn read_u8(&mut self) -> Result<u8, Error> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, Error> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    pub fn read_u16_be(&mut self) -> Result<u16, Error> {
        Ok(u16::from_be_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, Error> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u32_be(&mut self) -> Result<u32, Error> {
        Ok(u32::from_be_bytes(self.read_array()?))
    }

    pub fn read_f32(&mut self) -> Result<f32, Error> {
        Ok(f32::from_le_bytes(self.read_array()?))
    }

    pub fn read_f64(&mut self) -> Result<f64, Error> {
        Ok(f64::from_le_bytes(self.read_array()?))
    }

    /// Read bytes until a NUL or until `max` content bytes have been read,
    /// returning the bytes before the NUL. The terminating NUL is consumed.
    pub fn read_string(&mut self, max: usize) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();
        let mut b = self.read_u8()?;
        while out.len() < max && b != 0 {
            out.push(b);
            b = self.read_u8()?;
        }
        Ok(out)
    }

    /// Non-advancing read of `n` bytes at the cursor.
    pub fn lookup(&self, n: usize) -> Result<&[u8], Error> {
        let end = self.position.checked_add(n).ok_or(Error::OutOfRange)?;
        self.buffer.get(self.position..end).ok_or(Error::OutOfRange)
    }

    pub fn lookup_u8(&self) -> Result<u8, Error> {
        Ok(self.lookup(1)?[0])
    }

    pub fn lookup_u16(&self) -> Result<u16, Error> {
        let bytes = self.lookup(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn get(&self, index: usize) -> Result<u8, Error> {
        self.buffer.get(index).copied().ok_or(Error::OutOfRange)
    }

    pub fn slice(&self, start: usize, end: usize) -> Result<&[u8], Error> {
        self.buffer.get(start..end).ok_or(Error::OutOfRange)
    }

    /// Overwrite `data.len()` bytes in place at `index`.
    pub fn replace(&mut self, index: usize, data: &[u8]) -> Result<(), Error> {
        let end = index.checked_add(data.len()).ok_or(Error::OutOfRange)?;
        let target = self.buffer.get_mut(index..end).ok_or(Error::OutOfRange)?;
        target.copy_from_slice(data);
        Ok(())
    }

    /// Insert `data` at `index`, dropping `discard` existing bytes there.
    /// Used only by the string patcher (1 byte widened to 4).
    pub fn insert(&mut self, index: usize, data: &[u8], discard: usize) -> Result<(), Error> {
        let end = index.checked_add(discard).ok_or(Error::OutOfRange)?;
        if end > self.buffer.len() {
            return Err(Error::OutOfRange);
        }
        self.buffer.splice(index..end, data.iter().copied());
        Ok(())
    }
}

#[test]
fn test_cursor_reads() {
    let mut c = Cursor::new(vec![1, 0, 0x34, 0x12, 0x78, 0x56, 0x34, 0x12]);
    assert_eq!(1, c.read_u8().unwrap());
    assert_eq!(0x3400, c.read_u16().unwrap());
    assert_eq!(0x12345678, c.read_u32().unwrap());
    assert_eq!(7, c.position());
    assert_eq!(1, c.remaining());
    assert_eq!(Err(Error::OutOfRange), c.read_u16());
    assert_eq!(0x12, c.read_u8().unwrap());
    assert!(c.is_at_end());
    assert_eq!(Err(Error::OutOfRange), c.read_u8());
}

#[test]
fn test_cursor_endianness() {
    let mut c = Cursor::new(vec![0x12, 0x34, 0x12, 0x34]);
    assert_eq!(0x1234, c.read_u16_be().unwrap());
    assert_eq!(0x3412, c.read_u16().unwrap());
    let mut c = Cursor::new(1.5f64.to_le_bytes().to_vec());
    assert_eq!(1.5, c.read_f64().unwrap());
}

#[test]
fn test_cursor_lookup() {
    let mut c = Cursor::new(vec![0xff, 0xcd, 0xcd]);
    assert_eq!(0xff, c.lookup_u8().unwrap());
    assert_eq!(0xcdff, c.lookup_u16().unwrap());
    assert_eq!(0, c.position());
    c.read_u8().unwrap();
    assert_eq!(0xcdcd, c.lookup_u16().unwrap());
}

#[test]
fn test_cursor_read_string() {
    let mut c = Cursor::new(b"abc\0def".to_vec());
    assert_eq!(b"abc".to_vec(), c.read_string(16).unwrap());
    // NUL consumed.
    assert_eq!(4, c.position());
    assert_eq!(b"de".to_vec(), c.read_string(2).unwrap());
    assert_eq!(Err(Error::OutOfRange), c.read_string(4));
}

#[test]
fn test_cursor_patching() {
    let mut c = Cursor::new(vec![10, 0, 20]);
    c.replace(1, &[7]).unwrap();
    assert_eq!(&[10, 7, 20], c.as_bytes());
    c.insert(1, &[1, 2, 3, 4], 1).unwrap();
    assert_eq!(&[10, 1, 2, 3, 4, 20], c.as_bytes());
    assert_eq!(Err(Error::OutOfRange), c.replace(5, &[0, 0]));
    assert_eq!(Err(Error::OutOfRange), c.insert(6, &[0], 1));
}
