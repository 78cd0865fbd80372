//! Streaming zip container for profile bundles.
//!
//! Entries use the stored (uncompressed) method with a trailing data
//! descriptor, so the whole archive streams to any `Write` sink without
//! seeking. The `zip` crate's writer requires `Seek`, which sinks like
//! [`LinkedBuffer`](crate::llbuf::LinkedBuffer) or an HTTP response body do
//! not have; readers locate entries through the central directory emitted at
//! [`ArchiveWriter::finish`] and interoperate normally.

use std::io::{self, Write};

use crc32fast::Hasher;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};

const LOCAL_HEADER_SIG: u32 = 0x0403_4b50;
const DATA_DESCRIPTOR_SIG: u32 = 0x0807_4b50;
const CENTRAL_HEADER_SIG: u32 = 0x0201_4b50;
const END_OF_CENTRAL_SIG: u32 = 0x0605_4b50;

/// Version 2.0, the minimum that understands data descriptors.
const ZIP_VERSION: u16 = 20;
/// General-purpose flag bit 3: CRC and sizes follow the entry data.
const FLAG_DATA_DESCRIPTOR: u16 = 1 << 3;
const METHOD_STORED: u16 = 0;

/// Bytes escaped in entry names derived from user-controlled strings:
/// separators and anything else that could move the entry within the
/// archive tree.
const NAME_ESCAPE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'[')
    .add(b'\\')
    .add(b']')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}');

/// Escapes one path segment of an archive entry name.
pub(crate) fn escape_entry_name(name: &str) -> String {
    utf8_percent_encode(name, NAME_ESCAPE).to_string()
}

struct EntryRecord {
    name: String,
    crc: u32,
    size: u64,
    offset: u64,
}

struct OpenEntry {
    crc: Hasher,
    size: u64,
}

/// Incremental zip writer.
///
/// `begin_entry` completes any previous entry; bytes written between calls
/// belong to the most recently opened entry. `finish` must run exactly once
/// to make the archive readable, even when no entry was ever opened.
pub struct ArchiveWriter<W: Write> {
    sink: W,
    offset: u64,
    entries: Vec<EntryRecord>,
    current: Option<OpenEntry>,
}

impl<W: Write> ArchiveWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            sink,
            offset: 0,
            entries: Vec::new(),
            current: None,
        }
    }

    /// Opens a new entry, completing the previous one.
    pub fn begin_entry(&mut self, name: &str) -> io::Result<()> {
        self.end_entry()?;
        let offset = self.offset;
        let name_bytes = name.as_bytes();
        let mut header = Vec::with_capacity(30 + name_bytes.len());
        put_u32(&mut header, LOCAL_HEADER_SIG);
        put_u16(&mut header, ZIP_VERSION);
        put_u16(&mut header, FLAG_DATA_DESCRIPTOR);
        put_u16(&mut header, METHOD_STORED);
        put_u16(&mut header, 0); // modification time
        put_u16(&mut header, 0); // modification date
        put_u32(&mut header, 0); // crc, in the descriptor
        put_u32(&mut header, 0); // compressed size, in the descriptor
        put_u32(&mut header, 0); // uncompressed size, in the descriptor
        put_u16(&mut header, name_len(name_bytes)?);
        put_u16(&mut header, 0); // extra field
        header.extend_from_slice(name_bytes);
        self.sink.write_all(&header)?;
        self.offset += header.len() as u64;
        self.entries.push(EntryRecord {
            name: name.to_string(),
            crc: 0,
            size: 0,
            offset,
        });
        self.current = Some(OpenEntry {
            crc: Hasher::new(),
            size: 0,
        });
        Ok(())
    }

    fn end_entry(&mut self) -> io::Result<()> {
        let Some(open) = self.current.take() else {
            return Ok(());
        };
        let crc = open.crc.finalize();
        let size = zip32(open.size)?;
        let mut descriptor = Vec::with_capacity(16);
        put_u32(&mut descriptor, DATA_DESCRIPTOR_SIG);
        put_u32(&mut descriptor, crc);
        put_u32(&mut descriptor, size); // compressed == uncompressed when stored
        put_u32(&mut descriptor, size);
        self.sink.write_all(&descriptor)?;
        self.offset += descriptor.len() as u64;
        if let Some(record) = self.entries.last_mut() {
            record.crc = crc;
            record.size = open.size;
        }
        Ok(())
    }

    /// Completes the archive with the central directory and end record, then
    /// returns the sink.
    pub fn finish(mut self) -> io::Result<W> {
        self.end_entry()?;
        let central_offset = self.offset;
        let mut central = Vec::new();
        for entry in &self.entries {
            let name_bytes = entry.name.as_bytes();
            let size = zip32(entry.size)?;
            put_u32(&mut central, CENTRAL_HEADER_SIG);
            put_u16(&mut central, ZIP_VERSION); // made by
            put_u16(&mut central, ZIP_VERSION); // needed to extract
            put_u16(&mut central, FLAG_DATA_DESCRIPTOR);
            put_u16(&mut central, METHOD_STORED);
            put_u16(&mut central, 0); // modification time
            put_u16(&mut central, 0); // modification date
            put_u32(&mut central, entry.crc);
            put_u32(&mut central, size);
            put_u32(&mut central, size);
            put_u16(&mut central, name_len(name_bytes)?);
            put_u16(&mut central, 0); // extra field
            put_u16(&mut central, 0); // comment
            put_u16(&mut central, 0); // disk number start
            put_u16(&mut central, 0); // internal attributes
            put_u32(&mut central, 0); // external attributes
            put_u32(&mut central, zip32(entry.offset)?);
            central.extend_from_slice(name_bytes);
        }
        self.sink.write_all(&central)?;

        let count = u16::try_from(self.entries.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "too many archive entries"))?;
        let mut end = Vec::with_capacity(22);
        put_u32(&mut end, END_OF_CENTRAL_SIG);
        put_u16(&mut end, 0); // this disk
        put_u16(&mut end, 0); // central directory disk
        put_u16(&mut end, count);
        put_u16(&mut end, count);
        put_u32(&mut end, zip32(central.len() as u64)?);
        put_u32(&mut end, zip32(central_offset)?);
        put_u16(&mut end, 0); // comment length
        self.sink.write_all(&end)?;
        self.sink.flush()?;
        Ok(self.sink)
    }
}

impl<W: Write> Write for ArchiveWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let Some(open) = self.current.as_mut() else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "no open archive entry",
            ));
        };
        self.sink.write_all(buf)?;
        open.crc.update(buf);
        open.size += buf.len() as u64;
        self.offset += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sink.flush()
    }
}

fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn zip32(v: u64) -> io::Result<u32> {
    u32::try_from(v)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "archive exceeds zip32 limits"))
}

fn name_len(name: &[u8]) -> io::Result<u16> {
    u16::try_from(name.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "entry name too long"))
}
