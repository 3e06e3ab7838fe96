//! ISO BMFF box reading and writing primitives.
//!
//! A box is a big-endian `u32` size, a FourCC, then the body. A size of `1`
//! means a 64-bit size follows the FourCC, `0` means the box runs to the end
//! of its parent.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{BdownError, BdownResult};

pub type FourCC = [u8; 4];

pub(crate) fn fourcc_str(code: &FourCC) -> String {
    String::from_utf8_lossy(code).into_owned()
}

/// A box parsed out of an in-memory parent.
#[derive(Debug, Clone)]
pub(crate) struct Mp4Box {
    pub(crate) fourcc: FourCC,
    /// Header included.
    pub(crate) raw: Bytes,
    pub(crate) header_size: usize,
}

impl Mp4Box {
    pub(crate) fn body(&self) -> Bytes {
        self.raw.slice(self.header_size..)
    }

    /// Children of a container box.
    pub(crate) fn children(&self) -> BoxIter {
        BoxIter::new(self.body())
    }

    pub(crate) fn child(&self, fourcc: &FourCC) -> BdownResult<Option<Mp4Box>> {
        find_box(self.body(), fourcc)
    }
}

/// Iterates over the sibling boxes of a byte range.
///
/// Stops at the first malformed header, after yielding its error.
pub(crate) struct BoxIter {
    data: Bytes,
}

impl BoxIter {
    pub(crate) fn new(data: Bytes) -> Self {
        Self { data }
    }
}

impl Iterator for BoxIter {
    type Item = BdownResult<Mp4Box>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.is_empty() {
            return None;
        }

        match parse_header(&self.data) {
            Ok((size, fourcc, header_size)) => {
                let raw = self.data.split_to(size);
                Some(Ok(Mp4Box {
                    fourcc,
                    raw,
                    header_size,
                }))
            }
            Err(e) => {
                self.data.clear();
                Some(Err(e))
            }
        }
    }
}

/// Returns `(total_size, fourcc, header_size)` of the box at the start of `data`.
fn parse_header(data: &[u8]) -> BdownResult<(usize, FourCC, usize)> {
    if data.len() < 8 {
        return Err(BdownError::mux("truncated box header"));
    }

    let mut header = data;
    let size = header.get_u32() as u64;
    let mut fourcc = [0u8; 4];
    header.copy_to_slice(&mut fourcc);

    let (size, header_size) = match size {
        0 => (data.len() as u64, 8),
        1 => {
            if header.remaining() < 8 {
                return Err(BdownError::mux("truncated box header"));
            }
            (header.get_u64(), 16)
        }
        size => (size, 8),
    };

    if size < header_size as u64 || size > data.len() as u64 {
        return Err(BdownError::mux(format!(
            "truncated {} box",
            fourcc_str(&fourcc)
        )));
    }
    Ok((size as usize, fourcc, header_size))
}

pub(crate) fn find_box(data: Bytes, fourcc: &FourCC) -> BdownResult<Option<Mp4Box>> {
    for item in BoxIter::new(data) {
        let item = item?;
        if &item.fourcc == fourcc {
            return Ok(Some(item));
        }
    }
    Ok(None)
}

/// Fail unless `buf` still holds `len` bytes.
pub(crate) fn ensure(buf: &impl Buf, len: usize, what: &str) -> BdownResult<()> {
    if buf.remaining() < len {
        return Err(BdownError::mux(format!("truncated {what} box")));
    }
    Ok(())
}

/// Read the version and flags of a full box.
pub(crate) fn read_full_box_header(buf: &mut Bytes, what: &str) -> BdownResult<(u8, u32)> {
    ensure(buf, 4, what)?;
    let value = buf.get_u32();
    Ok(((value >> 24) as u8, value & 0x00FF_FFFF))
}

/// Append a box whose body is produced by `body`.
pub(crate) fn write_box(out: &mut BytesMut, fourcc: &FourCC, body: impl FnOnce(&mut BytesMut)) {
    let start = out.len();
    out.put_u32(0);
    out.put_slice(fourcc);
    body(out);

    let size = (out.len() - start) as u32;
    out[start..start + 4].copy_from_slice(&size.to_be_bytes());
}

pub(crate) fn write_full_box(
    out: &mut BytesMut,
    fourcc: &FourCC,
    version: u8,
    flags: u32,
    body: impl FnOnce(&mut BytesMut),
) {
    write_box(out, fourcc, |out| {
        out.put_u32(((version as u32) << 24) | (flags & 0x00FF_FFFF));
        body(out);
    });
}

/// Identity transformation matrix of `mvhd` and `tkhd`.
pub(crate) fn put_unity_matrix(out: &mut BytesMut) {
    for value in [0x0001_0000u32, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000] {
        out.put_u32(value);
    }
}
