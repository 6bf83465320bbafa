//! Binary document codec.
//!
//! Wire layout (all integers little-endian):
//!
//! ```text
//! document := int32(total_len) element* 0x00
//! element  := type_byte cstring(name) payload
//! cstring  := utf8_bytes 0x00
//! string   := int32(byte_len incl. NUL) utf8_bytes 0x00
//! ```
//!
//! Arrays travel as embedded documents keyed `"0"`, `"1"`, ... under the
//! array tag. A string stored under [`WHERE_KEY`] is tagged as code.

use crate::document::{check_cstring, Document, WHERE_KEY};
use crate::error::ProtocolError;
use crate::oid::{ObjectId, OBJECT_ID_SIZE};
use crate::value::{DbRef, ElementType, Regex, UtcDateTime, Value};
use crate::{MAX_DOCUMENT_SIZE, MAX_NESTING_DEPTH};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Smallest valid document: the length prefix plus the terminator.
pub const MIN_DOCUMENT_SIZE: usize = 5;

/// Encodes a document into a fresh buffer.
pub fn encode_document(doc: &Document) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::with_capacity(64);
    encode_document_into(doc, &mut buf)?;
    Ok(buf.freeze())
}

/// Appends an encoded document to `buf`, returning the number of bytes written.
///
/// On error `buf` may hold a partial document; callers should discard it.
pub fn encode_document_into(doc: &Document, buf: &mut BytesMut) -> Result<usize, ProtocolError> {
    write_document(buf, doc, 1)
}

fn write_document(buf: &mut BytesMut, doc: &Document, depth: usize) -> Result<usize, ProtocolError> {
    let start = begin_document(buf, depth)?;
    for (key, value) in doc.iter() {
        write_element(buf, key, value, depth)?;
    }
    finish_document(buf, start)
}

fn write_array(buf: &mut BytesMut, items: &[Value], depth: usize) -> Result<usize, ProtocolError> {
    let start = begin_document(buf, depth)?;
    for (index, item) in items.iter().enumerate() {
        write_element(buf, &index.to_string(), item, depth)?;
    }
    finish_document(buf, start)
}

fn begin_document(buf: &mut BytesMut, depth: usize) -> Result<usize, ProtocolError> {
    if depth > MAX_NESTING_DEPTH {
        return Err(ProtocolError::NestingTooDeep {
            max: MAX_NESTING_DEPTH,
        });
    }
    let start = buf.len();
    // Patched by finish_document.
    buf.put_i32_le(0);
    Ok(start)
}

fn finish_document(buf: &mut BytesMut, start: usize) -> Result<usize, ProtocolError> {
    buf.put_u8(ElementType::EndOfObject as u8);
    let len = buf.len() - start;
    if len > MAX_DOCUMENT_SIZE {
        return Err(ProtocolError::DocumentTooLarge {
            size: len,
            max: MAX_DOCUMENT_SIZE,
        });
    }
    buf[start..start + 4].copy_from_slice(&(len as i32).to_le_bytes());
    Ok(len)
}

fn write_element(
    buf: &mut BytesMut,
    key: &str,
    value: &Value,
    depth: usize,
) -> Result<(), ProtocolError> {
    let tag = match value {
        Value::String(_) if key == WHERE_KEY => ElementType::Code,
        other => other.element_type(),
    };
    buf.put_u8(tag as u8);
    write_cstring(buf, key)?;

    match value {
        Value::Double(v) => buf.put_f64_le(*v),
        Value::String(s) | Value::Code(s) | Value::Symbol(s) => write_string(buf, s)?,
        Value::Document(doc) => {
            write_document(buf, doc, depth + 1)?;
        }
        Value::Array(items) => {
            write_array(buf, items, depth + 1)?;
        }
        Value::Binary(bytes) => {
            check_size(bytes.len())?;
            buf.put_i32_le(bytes.len() as i32);
            buf.put_slice(bytes);
        }
        Value::Undefined | Value::Null => {}
        Value::ObjectId(id) => buf.put_slice(&id.bytes()),
        Value::Boolean(b) => buf.put_u8(u8::from(*b)),
        Value::DateTime(dt) => buf.put_i64_le(dt.timestamp_millis()),
        Value::Regex(re) => {
            write_cstring(buf, &re.pattern)?;
            write_cstring(buf, &re.normalized_options())?;
        }
        Value::DbRef(r) => {
            write_string(buf, &r.namespace)?;
            buf.put_slice(&r.id.bytes());
        }
        Value::Int32(v) => buf.put_i32_le(*v),
    }
    Ok(())
}

/// Writes `s` followed by a NUL byte.
pub(crate) fn write_cstring(buf: &mut BytesMut, s: &str) -> Result<(), ProtocolError> {
    check_cstring(s)?;
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
    Ok(())
}

/// Writes a length-prefixed string; the length counts the trailing NUL.
fn write_string(buf: &mut BytesMut, s: &str) -> Result<(), ProtocolError> {
    check_size(s.len() + 1)?;
    buf.put_i32_le(s.len() as i32 + 1);
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
    Ok(())
}

fn check_size(size: usize) -> Result<(), ProtocolError> {
    if size > MAX_DOCUMENT_SIZE {
        return Err(ProtocolError::DocumentTooLarge {
            size,
            max: MAX_DOCUMENT_SIZE,
        });
    }
    Ok(())
}

/// Reads the length prefix of an encoded document, if four bytes are available.
///
/// Negative lengths yield `None`.
pub fn document_len(bytes: &[u8]) -> Option<usize> {
    let prefix: [u8; 4] = bytes.get(..4)?.try_into().ok()?;
    usize::try_from(i32::from_le_bytes(prefix)).ok()
}

/// Decodes the document at the start of `bytes`.
///
/// Bytes past the declared document length are ignored.
pub fn decode_document(bytes: &[u8]) -> Result<Document, ProtocolError> {
    Reader::new(bytes).read_document()
}

/// Decodes one document from `buf` and advances past it.
///
/// The document must sit in a single contiguous chunk, which holds for
/// `Bytes`, `BytesMut` and `&[u8]`.
pub fn read_document<B: Buf>(buf: &mut B) -> Result<Document, ProtocolError> {
    let mut reader = Reader::new(buf.chunk());
    let doc = reader.read_document()?;
    let consumed = reader.position();
    buf.advance(consumed);
    Ok(doc)
}

/// Bounds-checked little-endian reader over a byte slice.
///
/// Error offsets are reported relative to `base`, so nested readers point
/// at the right byte of the outer buffer.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    base: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self::with_base(buf, 0)
    }

    pub(crate) fn with_base(buf: &'a [u8], base: usize) -> Self {
        Self { buf, pos: 0, base }
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn offset(&self) -> usize {
        self.base + self.pos
    }

    pub(crate) fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.remaining() < n {
            return Err(ProtocolError::truncated(
                self.offset(),
                n - self.remaining(),
            ));
        }
        let bytes = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    fn read_fixed<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.read_fixed::<1>()?[0])
    }

    pub(crate) fn read_i32(&mut self) -> Result<i32, ProtocolError> {
        Ok(i32::from_le_bytes(self.read_fixed()?))
    }

    pub(crate) fn read_i64(&mut self) -> Result<i64, ProtocolError> {
        Ok(i64::from_le_bytes(self.read_fixed()?))
    }

    fn read_f64(&mut self) -> Result<f64, ProtocolError> {
        Ok(f64::from_le_bytes(self.read_fixed()?))
    }

    fn utf8(&self, bytes: &'a [u8], start: usize) -> Result<&'a str, ProtocolError> {
        std::str::from_utf8(bytes).map_err(|e| ProtocolError::InvalidUtf8 {
            offset: self.base + start + e.valid_up_to(),
        })
    }

    pub(crate) fn read_cstring(&mut self) -> Result<&'a str, ProtocolError> {
        let start = self.pos;
        let rest = &self.buf[start..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(ProtocolError::UnterminatedString {
                offset: self.base + start,
            })?;
        let s = self.utf8(&rest[..nul], start)?;
        self.pos += nul + 1;
        Ok(s)
    }

    fn read_string(&mut self) -> Result<String, ProtocolError> {
        let len_offset = self.offset();
        let declared = self.read_i32()?;
        let len = usize::try_from(declared)
            .ok()
            .filter(|&len| len >= 1)
            .ok_or(ProtocolError::LengthMismatch {
                declared: declared.max(0) as usize,
                available: self.remaining(),
            })?;
        let start = self.pos;
        let bytes = self.read_bytes(len)?;
        if bytes[len - 1] != 0 {
            return Err(ProtocolError::UnterminatedString { offset: len_offset });
        }
        Ok(self.utf8(&bytes[..len - 1], start)?.to_string())
    }

    /// Reads one length-prefixed document starting at the current position.
    pub(crate) fn read_document(&mut self) -> Result<Document, ProtocolError> {
        self.read_document_at_depth(1)
    }

    fn read_document_at_depth(&mut self, depth: usize) -> Result<Document, ProtocolError> {
        let mut body = self.enter_document(depth)?;
        let mut doc = Document::new();
        while let Some((key, element_type)) = body.next_element()? {
            let value = body.read_value(element_type, depth)?;
            doc.insert_unchecked(key, value);
        }
        Ok(doc)
    }

    fn read_array_at_depth(&mut self, depth: usize) -> Result<Vec<Value>, ProtocolError> {
        let mut body = self.enter_document(depth)?;
        let mut items = Vec::new();
        while let Some((key, element_type)) = body.next_element()? {
            let expected = items.len().to_string();
            if key != expected {
                return Err(ProtocolError::InvalidArrayKey {
                    expected,
                    found: key,
                });
            }
            items.push(body.read_value(element_type, depth)?);
        }
        Ok(items)
    }

    /// Validates the length prefix and returns a reader confined to the body.
    fn enter_document(&mut self, depth: usize) -> Result<Reader<'a>, ProtocolError> {
        if depth > MAX_NESTING_DEPTH {
            return Err(ProtocolError::NestingTooDeep {
                max: MAX_NESTING_DEPTH,
            });
        }
        let start = self.pos;
        let declared = self.read_i32()?;
        let available = self.buf.len() - start;
        let len = usize::try_from(declared).unwrap_or(0);
        if len > MAX_DOCUMENT_SIZE {
            return Err(ProtocolError::DocumentTooLarge {
                size: len,
                max: MAX_DOCUMENT_SIZE,
            });
        }
        if len < MIN_DOCUMENT_SIZE || len > available {
            return Err(ProtocolError::LengthMismatch {
                declared: len,
                available,
            });
        }
        let end = start + len;
        if self.buf[end - 1] != ElementType::EndOfObject as u8 {
            return Err(ProtocolError::LengthMismatch {
                declared: len,
                available,
            });
        }
        // Body excludes the terminator; next_element stops when it is reached.
        let body = Reader::with_base(&self.buf[self.pos..end - 1], self.offset());
        self.pos = end;
        Ok(body)
    }

    fn next_element(&mut self) -> Result<Option<(String, ElementType)>, ProtocolError> {
        if self.remaining() == 0 {
            return Ok(None);
        }
        let tag_offset = self.offset();
        let tag = self.read_u8()?;
        let element_type = match ElementType::try_from(tag) {
            Ok(ElementType::EndOfObject) | Err(_) => {
                return Err(ProtocolError::UnknownElementType {
                    tag,
                    offset: tag_offset,
                })
            }
            Ok(element_type) => element_type,
        };
        let key = self.read_cstring()?.to_string();
        Ok(Some((key, element_type)))
    }

    fn read_value(
        &mut self,
        element_type: ElementType,
        depth: usize,
    ) -> Result<Value, ProtocolError> {
        let value = match element_type {
            ElementType::Double => Value::Double(self.read_f64()?),
            ElementType::String => Value::String(self.read_string()?),
            ElementType::Code => Value::Code(self.read_string()?),
            ElementType::Symbol => Value::Symbol(self.read_string()?),
            ElementType::Document => Value::Document(self.read_document_at_depth(depth + 1)?),
            ElementType::Array => Value::Array(self.read_array_at_depth(depth + 1)?),
            ElementType::Binary => {
                let declared = self.read_i32()?;
                let len = usize::try_from(declared).map_err(|_| ProtocolError::LengthMismatch {
                    declared: 0,
                    available: self.remaining(),
                })?;
                Value::Binary(self.read_bytes(len)?.to_vec())
            }
            ElementType::Undefined => Value::Undefined,
            ElementType::Null => Value::Null,
            ElementType::ObjectId => Value::ObjectId(self.read_object_id()?),
            ElementType::Boolean => {
                let offset = self.offset();
                match self.read_u8()? {
                    0 => Value::Boolean(false),
                    1 => Value::Boolean(true),
                    value => return Err(ProtocolError::InvalidBoolean { value, offset }),
                }
            }
            ElementType::DateTime => Value::DateTime(UtcDateTime::from_millis(self.read_i64()?)),
            ElementType::Regex => {
                let pattern = self.read_cstring()?;
                let options = self.read_cstring()?;
                Value::Regex(Regex::new(pattern, options))
            }
            ElementType::DbRef => {
                let namespace = self.read_string()?;
                let id = self.read_object_id()?;
                Value::DbRef(DbRef::new(namespace, id))
            }
            ElementType::Int32 => Value::Int32(self.read_i32()?),
            ElementType::EndOfObject => {
                return Err(ProtocolError::UnknownElementType {
                    tag: 0,
                    offset: self.offset(),
                })
            }
        };
        Ok(value)
    }

    fn read_object_id(&mut self) -> Result<ObjectId, ProtocolError> {
        Ok(ObjectId::from_bytes(self.read_fixed::<OBJECT_ID_SIZE>()?))
    }
}

/// Renders bytes as a hex dump, eight bytes per row with an offset column.
pub fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 4);
    for (row, chunk) in bytes.chunks(8).enumerate() {
        out.push_str(&format!("{:06x}:", row * 8));
        for b in chunk {
            out.push_str(&format!(" {:02x}", b));
        }
        for _ in chunk.len()..8 {
            out.push_str("   ");
        }
        out.push_str("  ");
        for &b in chunk {
            out.push(if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            });
        }
        out.push('\n');
    }
    out
}
