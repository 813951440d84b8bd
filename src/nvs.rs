//! Read-only inspection of an ESP-IDF NVS partition image.
//!
//! The partition is a sequence of 4096-byte pages:
//!
//! ```text
//! 0    state u32 | sequence u32 | version u8 | ... | header crc u32 (@28)
//! 32   entry state bitmap, 2 bits per entry (3 empty, 2 written, 0 erased)
//! 64   126 entries of 32 bytes
//! ```
//!
//! Each entry holds namespace id, type tag, span, chunk index, CRC, a
//! 16-byte key and 8 bytes of inline data. Strings and blob data continue in
//! the following `span - 1` entries. Namespace names live in namespace 0.
//!
//! The dump is best-effort: an entry whose CRC does not match is recorded as
//! skipped and the scan moves on to the next entry.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use crc::{Algorithm, Crc};

use crate::error::NvsError;

/// Flash page size.
pub const PAGE_SIZE: usize = 4096;
/// Entry size.
pub const ENTRY_SIZE: usize = 32;
/// Entries per page.
pub const ENTRIES_PER_PAGE: usize = 126;

const BITMAP_OFFSET: usize = 32;
const ENTRY_OFFSET: usize = 64;
const KEY_LENGTH: usize = 16;

/// ESP-IDF `crc32_le` as used by NVS (seeded with `0xFFFFFFFF`).
pub const CRC_32_ESP_NVS: Algorithm<u32> = Algorithm {
    width: 32,
    poly: 0x04c1_1db7,
    init: 0,
    refin: true,
    refout: true,
    xorout: 0xffff_ffff,
    check: 0xd202_d277,
    residue: 0xdebb_20e3,
};

const NVS_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ESP_NVS);

// ============================================================================
// Records
// ============================================================================

/// Page lifecycle word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum PageState {
    /// Never written.
    Empty,
    /// Being filled.
    Active,
    /// No free entries left.
    Full,
    /// Being moved to a fresh page.
    Freeing,
    /// Marked corrupt by the driver.
    Corrupt,
}

impl PageState {
    /// Decode a state word.
    pub const fn from_word(word: u32) -> Option<Self> {
        Some(match word {
            0xffff_ffff => PageState::Empty,
            0xffff_fffe => PageState::Active,
            0xffff_fffc => PageState::Full,
            0xffff_fff8 => PageState::Freeing,
            0xffff_fff0 => PageState::Corrupt,
            _ => return None,
        })
    }

    /// Whether entries on the page are worth reading.
    pub const fn has_entries(&self) -> bool {
        matches!(self, PageState::Active | PageState::Full | PageState::Freeing)
    }
}

/// Per-entry state from the page bitmap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryState {
    /// `0b11`
    Empty,
    /// `0b10`
    Written,
    /// `0b00`
    Erased,
    /// `0b01`, never written by the driver
    Illegal,
}

impl EntryState {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b11 => EntryState::Empty,
            0b10 => EntryState::Written,
            0b00 => EntryState::Erased,
            _ => EntryState::Illegal,
        }
    }
}

/// A decoded value.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "type", content = "value", rename_all = "snake_case"))]
pub enum NvsValue {
    /// `0x01`
    U8(u8),
    /// `0x02`
    U16(u16),
    /// `0x04`
    U32(u32),
    /// `0x08`
    U64(u64),
    /// `0x11`
    I8(i8),
    /// `0x12`
    I16(i16),
    /// `0x14`
    I32(i32),
    /// `0x18`
    I64(i64),
    /// `0x21`
    Str(String),
    /// `0x41` (single-page legacy blob) or `0x42` (one chunk)
    Blob(Vec<u8>),
    /// `0x48`
    BlobIndex {
        /// Total size across chunks.
        size: u32,
        /// Number of chunks.
        chunk_count: u8,
        /// Index of the first chunk.
        chunk_start: u8,
    },
    /// A tag this dump does not know.
    Unknown(u8),
}

impl NvsValue {
    /// C type name of the stored value.
    pub fn type_name(&self) -> &'static str {
        match self {
            NvsValue::U8(_) => "uint8_t",
            NvsValue::U16(_) => "uint16_t",
            NvsValue::U32(_) => "uint32_t",
            NvsValue::U64(_) => "uint64_t",
            NvsValue::I8(_) => "int8_t",
            NvsValue::I16(_) => "int16_t",
            NvsValue::I32(_) => "int32_t",
            NvsValue::I64(_) => "int64_t",
            NvsValue::Str(_) => "string",
            NvsValue::Blob(_) => "blob",
            NvsValue::BlobIndex { .. } => "blob_index",
            NvsValue::Unknown(_) => "unknown",
        }
    }
}

impl fmt::Display for NvsValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NvsValue::U8(v) => write!(f, "{v}"),
            NvsValue::U16(v) => write!(f, "{v}"),
            NvsValue::U32(v) => write!(f, "{v}"),
            NvsValue::U64(v) => write!(f, "{v}"),
            NvsValue::I8(v) => write!(f, "{v}"),
            NvsValue::I16(v) => write!(f, "{v}"),
            NvsValue::I32(v) => write!(f, "{v}"),
            NvsValue::I64(v) => write!(f, "{v}"),
            NvsValue::Str(s) => write!(f, "\"{s}\""),
            NvsValue::Blob(data) => {
                for b in data {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
            NvsValue::BlobIndex {
                size,
                chunk_count,
                chunk_start,
            } => write!(f, "size={size} chunks={chunk_count} start={chunk_start}"),
            NvsValue::Unknown(tag) => write!(f, "<type {tag:#04x}>"),
        }
    }
}

/// One readable key/value item.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NvsEntry {
    /// Page index within the image.
    pub page: usize,
    /// Entry index within the page.
    pub index: u8,
    /// Namespace id.
    pub namespace_id: u8,
    /// Namespace name, when its definition was found.
    pub namespace: Option<String>,
    /// Key.
    pub key: String,
    /// Entries occupied.
    pub span: u8,
    /// Blob chunk index (`0xFF` when unused).
    pub chunk_index: u8,
    /// Value.
    pub value: NvsValue,
}

/// An entry that could not be read.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SkippedEntry {
    /// Page index within the image.
    pub page: usize,
    /// Entry index within the page.
    pub index: u8,
    /// Why.
    pub error: NvsError,
}

/// Summary of one page header.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PageInfo {
    /// Page index within the image.
    pub index: usize,
    /// Decoded state, `None` for an invalid state word.
    pub state: Option<PageState>,
    /// Sequence number.
    pub sequence: u32,
    /// Format version byte.
    pub version: u8,
    /// Whether the header CRC matched.
    pub header_crc_ok: bool,
    /// Entries marked written.
    pub written: u8,
    /// Entries marked erased.
    pub erased: u8,
}

/// Everything read from an image.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NvsDump {
    /// Page headers in image order.
    pub pages: Vec<PageInfo>,
    /// Readable items in image order.
    pub entries: Vec<NvsEntry>,
    /// Items that failed their checks.
    pub skipped: Vec<SkippedEntry>,
    /// Pages with an invalid state word.
    pub bad_pages: Vec<NvsError>,
    /// Namespace id to name.
    pub namespaces: BTreeMap<u8, String>,
}

impl NvsDump {
    /// Items in the namespace called `name`.
    pub fn namespace<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a NvsEntry> + 'a {
        self.entries
            .iter()
            .filter(move |e| e.namespace.as_deref() == Some(name))
    }

    /// Value of `key` in namespace `namespace`.
    pub fn get(&self, namespace: &str, key: &str) -> Option<&NvsValue> {
        self.entries
            .iter()
            .find(|e| e.namespace.as_deref() == Some(namespace) && e.key == key)
            .map(|e| &e.value)
    }
}

// ============================================================================
// Parsing
// ============================================================================

fn le_u16(b: &[u8]) -> u16 {
    u16::from_le_bytes([b[0], b[1]])
}

fn le_u32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

fn le_u64(b: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&b[..8]);
    u64::from_le_bytes(raw)
}

/// CRC of a 32-byte entry, skipping its own CRC field.
pub fn entry_crc(entry: &[u8]) -> u32 {
    let mut digest = NVS_CRC.digest();
    digest.update(&entry[0..4]);
    digest.update(&entry[8..ENTRY_SIZE]);
    digest.finalize()
}

/// CRC of a page header (bytes 4..28).
pub fn header_crc(page: &[u8]) -> u32 {
    NVS_CRC.checksum(&page[4..28])
}

/// CRC of variable-length string or blob data.
pub fn data_crc(data: &[u8]) -> u32 {
    NVS_CRC.checksum(data)
}

fn entry_state(page: &[u8], index: usize) -> EntryState {
    let byte = page[BITMAP_OFFSET + index / 4];
    EntryState::from_bits(byte >> ((index % 4) * 2))
}

fn entry_bytes(page: &[u8], index: usize) -> &[u8] {
    let start = ENTRY_OFFSET + index * ENTRY_SIZE;
    &page[start..start + ENTRY_SIZE]
}

fn key_text(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// Read the variable-length payload that follows entry `index`.
fn span_data(page: &[u8], index: usize, span: usize, data: &[u8]) -> Result<Vec<u8>, NvsError> {
    let size = usize::from(le_u16(&data[0..2]));
    let stored = le_u32(&data[4..8]);
    let start = ENTRY_OFFSET + (index + 1) * ENTRY_SIZE;
    let available = span.saturating_sub(1) * ENTRY_SIZE;
    if size > available || start + size > page.len() {
        return Err(NvsError::Truncated(start + size));
    }
    let payload = &page[start..start + size];
    let computed = data_crc(payload);
    if computed != stored {
        return Err(NvsError::CrcMismatch { stored, computed });
    }
    Ok(payload.to_vec())
}

fn decode_value(page: &[u8], index: usize, tag: u8, span: usize, data: &[u8]) -> Result<NvsValue, NvsError> {
    let value = match tag {
        0x01 => NvsValue::U8(data[0]),
        0x02 => NvsValue::U16(le_u16(data)),
        0x04 => NvsValue::U32(le_u32(data)),
        0x08 => NvsValue::U64(le_u64(data)),
        0x11 => NvsValue::I8(data[0] as i8),
        0x12 => NvsValue::I16(le_u16(data) as i16),
        0x14 => NvsValue::I32(le_u32(data) as i32),
        0x18 => NvsValue::I64(le_u64(data) as i64),
        0x21 => {
            let bytes = span_data(page, index, span, data)?;
            let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
            NvsValue::Str(String::from_utf8_lossy(&bytes[..end]).into_owned())
        }
        0x41 | 0x42 => NvsValue::Blob(span_data(page, index, span, data)?),
        0x48 => NvsValue::BlobIndex {
            size: le_u32(&data[0..4]),
            chunk_count: data[4],
            chunk_start: data[5],
        },
        other => NvsValue::Unknown(other),
    };
    Ok(value)
}

fn scan_page(index: usize, page: &[u8], dump: &mut NvsDump) {
    let state_word = le_u32(&page[0..4]);
    let state = PageState::from_word(state_word);
    let (mut written, mut erased) = (0u8, 0u8);
    for i in 0..ENTRIES_PER_PAGE {
        match entry_state(page, i) {
            EntryState::Written => written += 1,
            EntryState::Erased => erased += 1,
            _ => {}
        }
    }
    dump.pages.push(PageInfo {
        index,
        state,
        sequence: le_u32(&page[4..8]),
        version: page[8],
        header_crc_ok: le_u32(&page[28..32]) == header_crc(page),
        written,
        erased,
    });

    match state {
        None => {
            log::warn!("[nvs] page {} has invalid state {:#010x}", index, state_word);
            dump.bad_pages.push(NvsError::BadPage {
                index,
                state: state_word,
            });
            return;
        }
        Some(state) if !state.has_entries() => return,
        Some(_) => {}
    }

    let mut i = 0;
    while i < ENTRIES_PER_PAGE {
        if entry_state(page, i) != EntryState::Written {
            i += 1;
            continue;
        }
        let raw = entry_bytes(page, i);
        let stored = le_u32(&raw[4..8]);
        let computed = entry_crc(raw);
        if stored != computed {
            log::debug!("[nvs] page {} entry {}: crc mismatch", index, i);
            dump.skipped.push(SkippedEntry {
                page: index,
                index: i as u8,
                error: NvsError::CrcMismatch { stored, computed },
            });
            i += 1;
            continue;
        }

        let (ns, tag, span, chunk_index) = (raw[0], raw[1], usize::from(raw[2]).max(1), raw[3]);
        let key = key_text(&raw[8..8 + KEY_LENGTH]);
        let data = &raw[24..32];

        if ns == 0 && tag == 0x01 {
            dump.namespaces.insert(data[0], key);
        } else {
            match decode_value(page, i, tag, span, data) {
                Ok(value) => dump.entries.push(NvsEntry {
                    page: index,
                    index: i as u8,
                    namespace_id: ns,
                    namespace: None,
                    key,
                    span: span as u8,
                    chunk_index,
                    value,
                }),
                Err(error) => {
                    log::debug!("[nvs] page {} entry {} `{}`: {}", index, i, key, error);
                    dump.skipped.push(SkippedEntry {
                        page: index,
                        index: i as u8,
                        error,
                    });
                }
            }
        }
        i += span;
    }
}

/// Interpret a whole partition image.
///
/// # Errors
///
/// [`NvsError::Truncated`] when the image is not a whole number of pages.
/// Everything else is recorded in the returned [`NvsDump`].
pub fn dump(image: &[u8]) -> Result<NvsDump, NvsError> {
    if image.len() % PAGE_SIZE != 0 {
        return Err(NvsError::Truncated(image.len() - image.len() % PAGE_SIZE));
    }

    let mut out = NvsDump::default();
    for (index, page) in image.chunks_exact(PAGE_SIZE).enumerate() {
        scan_page(index, page, &mut out);
    }

    // Namespace definitions may sit on a later page than their items
    for entry in &mut out.entries {
        entry.namespace = out.namespaces.get(&entry.namespace_id).cloned();
    }

    log::info!(
        "[nvs] {} pages, {} items, {} skipped, {} namespaces",
        out.pages.len(),
        out.entries.len(),
        out.skipped.len(),
        out.namespaces.len()
    );
    Ok(out)
}

impl fmt::Display for NvsDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for page in &self.pages {
            let state = page.state.map_or("invalid", |s| match s {
                PageState::Empty => "empty",
                PageState::Active => "active",
                PageState::Full => "full",
                PageState::Freeing => "freeing",
                PageState::Corrupt => "corrupt",
            });
            writeln!(
                f,
                "page {:3} {:8} seq {:6} written {:3} erased {:3}{}",
                page.index,
                state,
                page.sequence,
                page.written,
                page.erased,
                if page.header_crc_ok { "" } else { " (header crc bad)" }
            )?;
        }
        for e in &self.entries {
            let ns = e
                .namespace
                .clone()
                .unwrap_or_else(|| alloc::format!("#{}", e.namespace_id));
            writeln!(f, "{:>15} {:>15} {:>10} {}", ns, e.key, e.value.type_name(), e.value)?;
        }
        for s in &self.skipped {
            writeln!(f, "skipped page {} entry {}: {}", s.page, s.index, s.error)?;
        }
        Ok(())
    }
}

impl NvsEntry {
    /// `namespace.key`, falling back to the namespace id.
    pub fn qualified_key(&self) -> String {
        match &self.namespace {
            Some(ns) => alloc::format!("{ns}.{}", self.key),
            None => alloc::format!("#{}.{}", self.namespace_id, self.key),
        }
    }
}

impl PageInfo {
    /// Entries neither written nor erased.
    pub fn free(&self) -> u8 {
        (ENTRIES_PER_PAGE as u8).saturating_sub(self.written + self.erased)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    /// Builds pages the way the IDF driver lays them out.
    struct PageBuilder {
        page: Vec<u8>,
        next: usize,
    }

    impl PageBuilder {
        fn new(state: u32, sequence: u32) -> Self {
            let mut page = vec![0xff; PAGE_SIZE];
            page[0..4].copy_from_slice(&state.to_le_bytes());
            page[4..8].copy_from_slice(&sequence.to_le_bytes());
            page[8] = 0xfe;
            let crc = header_crc(&page);
            page[28..32].copy_from_slice(&crc.to_le_bytes());
            Self { page, next: 0 }
        }

        fn mark(&mut self, index: usize, bits: u8) {
            let byte = &mut self.page[BITMAP_OFFSET + index / 4];
            let shift = (index % 4) * 2;
            *byte = (*byte & !(0b11 << shift)) | (bits << shift);
        }

        fn raw(&mut self, ns: u8, tag: u8, span: u8, key: &str, data: [u8; 8]) -> usize {
            let index = self.next;
            let mut entry = [0xffu8; ENTRY_SIZE];
            entry[0] = ns;
            entry[1] = tag;
            entry[2] = span;
            entry[3] = 0xff;
            entry[8..8 + KEY_LENGTH].fill(0);
            entry[8..8 + key.len()].copy_from_slice(key.as_bytes());
            entry[24..32].copy_from_slice(&data);
            let crc = entry_crc(&entry);
            entry[4..8].copy_from_slice(&crc.to_le_bytes());
            let start = ENTRY_OFFSET + index * ENTRY_SIZE;
            self.page[start..start + ENTRY_SIZE].copy_from_slice(&entry);
            for i in index..index + usize::from(span) {
                self.mark(i, 0b10);
            }
            self.next += usize::from(span);
            index
        }

        fn namespace(&mut self, name: &str, id: u8) -> usize {
            self.raw(0, 0x01, 1, name, [id, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff])
        }

        fn put_u8(&mut self, ns: u8, key: &str, v: u8) -> usize {
            self.raw(ns, 0x01, 1, key, [v, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff])
        }

        fn put_i32(&mut self, ns: u8, key: &str, v: i32) -> usize {
            let mut data = [0xff; 8];
            data[0..4].copy_from_slice(&v.to_le_bytes());
            self.raw(ns, 0x14, 1, key, data)
        }

        fn put_str(&mut self, ns: u8, key: &str, s: &str) -> usize {
            let mut bytes = s.as_bytes().to_vec();
            bytes.push(0);
            let span = 1 + bytes.len().div_ceil(ENTRY_SIZE);
            let mut data = [0xff; 8];
            data[0..2].copy_from_slice(&(bytes.len() as u16).to_le_bytes());
            data[4..8].copy_from_slice(&data_crc(&bytes).to_le_bytes());
            let index = self.raw(ns, 0x21, span as u8, key, data);
            let start = ENTRY_OFFSET + (index + 1) * ENTRY_SIZE;
            self.page[start..start + bytes.len()].copy_from_slice(&bytes);
            index
        }

        fn corrupt_crc(&mut self, index: usize) {
            self.page[ENTRY_OFFSET + index * ENTRY_SIZE + 4] ^= 0x5a;
        }

        fn build(self) -> Vec<u8> {
            self.page
        }
    }

    #[test]
    fn crc_parameters() {
        assert_eq!(NVS_CRC.checksum(b"123456789"), 0xd202_d277);
    }

    #[test]
    fn reads_typed_values_and_namespaces() {
        let mut p = PageBuilder::new(0xffff_fffe, 3);
        p.put_u8(1, "brightness", 200);
        p.put_i32(1, "offset", -42);
        p.put_str(1, "name", "mThrottle-kitchen");
        p.namespace("throttle", 1);
        let dump = dump(&p.build()).unwrap();

        assert_eq!(dump.pages[0].state, Some(PageState::Active));
        assert_eq!(dump.pages[0].sequence, 3);
        assert!(dump.pages[0].header_crc_ok);
        assert_eq!(dump.get("throttle", "brightness"), Some(&NvsValue::U8(200)));
        assert_eq!(dump.get("throttle", "offset"), Some(&NvsValue::I32(-42)));
        assert_eq!(
            dump.get("throttle", "name"),
            Some(&NvsValue::Str("mThrottle-kitchen".into()))
        );
        assert_eq!(dump.entries[2].span, 2);
        assert_eq!(dump.entries[0].qualified_key(), "throttle.brightness");
        assert!(dump.skipped.is_empty());
    }

    #[test]
    fn crc_mismatch_skips_one_entry() {
        let mut p = PageBuilder::new(0xffff_fffc, 1);
        p.namespace("cfg", 2);
        let bad = p.put_u8(2, "speedStep", 4);
        p.put_u8(2, "mode", 1);
        p.corrupt_crc(bad);
        let dump = dump(&p.build()).unwrap();

        assert_eq!(dump.skipped.len(), 1);
        assert_eq!(dump.skipped[0].index, bad as u8);
        assert!(matches!(dump.skipped[0].error, NvsError::CrcMismatch { .. }));
        assert_eq!(dump.get("cfg", "mode"), Some(&NvsValue::U8(1)));
        assert_eq!(dump.get("cfg", "speedStep"), None);
    }

    #[test]
    fn erased_entries_are_ignored() {
        let mut p = PageBuilder::new(0xffff_fffe, 1);
        let gone = p.put_u8(1, "old", 9);
        p.put_u8(1, "new", 10);
        p.mark(gone, 0b00);
        let dump = dump(&p.build()).unwrap();
        assert_eq!(dump.entries.len(), 1);
        assert_eq!(dump.entries[0].key, "new");
        assert_eq!(dump.entries[0].namespace, None);
        assert_eq!(dump.pages[0].erased, 1);
        assert_eq!(dump.pages[0].free(), 124);
    }

    #[test]
    fn namespace_on_later_page() {
        let mut first = PageBuilder::new(0xffff_fffc, 1);
        first.put_u8(5, "relays", 4);
        let mut second = PageBuilder::new(0xffff_fffe, 2);
        second.namespace("relay", 5);
        let mut image = first.build();
        image.extend(second.build());
        image.extend(PageBuilder::new(0xffff_ffff, 0).build());

        let dump = dump(&image).unwrap();
        assert_eq!(dump.pages.len(), 3);
        assert_eq!(dump.pages[2].state, Some(PageState::Empty));
        assert_eq!(dump.get("relay", "relays"), Some(&NvsValue::U8(4)));
    }

    #[test]
    fn lookup_outlives_query_strings() {
        let mut p = PageBuilder::new(0xffff_fffe, 1);
        p.namespace("cfg", 1);
        p.namespace("wifi", 2);
        p.put_u8(1, "mode", 3);
        p.put_u8(2, "mode", 7);
        let dump = dump(&p.build()).unwrap();

        let value = {
            let ns = String::from("wifi");
            let key = String::from("mode");
            dump.get(&ns, &key)
        };
        assert_eq!(value, Some(&NvsValue::U8(7)));
        assert_eq!(dump.get("cfg", "mode"), Some(&NvsValue::U8(3)));
        assert_eq!(dump.get("cfg", "missing"), None);
        assert_eq!(dump.namespace("cfg").count(), 1);
    }

    #[test]
    fn invalid_page_state_is_reported() {
        let mut image = PageBuilder::new(0x1234_5678, 1).build();
        image.extend(PageBuilder::new(0xffff_fffe, 2).build());
        let dump = dump(&image).unwrap();
        assert_eq!(
            dump.bad_pages,
            [NvsError::BadPage {
                index: 0,
                state: 0x1234_5678
            }]
        );
        assert_eq!(dump.pages[1].state, Some(PageState::Active));
    }

    #[test]
    fn truncated_image() {
        assert_eq!(dump(&[0xff; 5000]), Err(NvsError::Truncated(4096)));
        assert_eq!(dump(&[]).map(|d| d.pages.len()), Ok(0));
    }

    #[test]
    fn display_lists_items() {
        let mut p = PageBuilder::new(0xffff_fffe, 1);
        p.namespace("wifi", 1);
        p.put_str(1, "ssid", "layout");
        let text = alloc::format!("{}", dump(&p.build()).unwrap());
        assert!(text.contains("wifi"));
        assert!(text.contains("\"layout\""));
        assert!(text.contains("active"));
    }
}
