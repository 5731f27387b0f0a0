//! Versioned, section-indexed binary savestate container.
//!
//! A savestate is a flat byte stream: a 16-byte file header (magic, major and
//! minor version, total length) followed by free-form sections. Each section
//! starts with a 16-byte header of its own (4-byte magic, u32 length including
//! the header, 8 reserved bytes). Producers may emit any subset of sections in
//! any order; consumers locate a section by scanning the stream. Unknown
//! sections are skipped, and a section that is absent simply reads back as
//! zeroes — older frontends rely on both behaviors, so they are load-bearing.
//!
//! File layout:
//!
//! ```text
//! 00  magic "MELN"
//! 04  u16 version major
//! 06  u16 version minor
//! 08  u32 total length (filled in by the writer on finish)
//! 0C  u32 reserved
//! 10  sections...
//! ```

pub const SAVESTATE_MAGIC: [u8; 4] = *b"MELN";
pub const SAVESTATE_MAJOR: u16 = 10;
pub const SAVESTATE_MINOR: u16 = 0;

const HEADER_LEN: usize = 0x10;
const SECTION_HEADER_LEN: usize = 0x10;

const DEFAULT_BUFFER_LEN: usize = 32 * 1024;

#[derive(Debug)]
enum Backing {
    // Growable; reallocated on overflow
    Owned(Vec<u8>),
    // Caller-provided fixed-size buffer; overflow latches an error instead
    Foreign(Box<[u8]>),
}

/// The byte buffer a savestate is written into or read out of.
///
/// An owned buffer grows as needed and is trimmed to the written length when
/// the writer finishes. A foreign buffer (e.g. a slot in a rewind ring) never
/// moves; writing past its end is an error on the writer.
#[derive(Debug)]
pub struct Savestate {
    backing: Backing,
}

impl Savestate {
    #[must_use]
    pub fn new() -> Self {
        Self::with_len(DEFAULT_BUFFER_LEN)
    }

    #[must_use]
    pub fn with_len(initial_len: usize) -> Self {
        Self { backing: Backing::Owned(vec![0; initial_len]) }
    }

    #[must_use]
    pub fn from_buffer(buffer: Box<[u8]>) -> Self {
        Self { backing: Backing::Foreign(buffer) }
    }

    #[must_use]
    pub fn buffer(&self) -> &[u8] {
        match &self.backing {
            Backing::Owned(buffer) => buffer,
            Backing::Foreign(buffer) => buffer,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer().is_empty()
    }

    #[must_use]
    pub fn into_buffer(self) -> Box<[u8]> {
        match self.backing {
            Backing::Owned(buffer) => buffer.into_boxed_slice(),
            Backing::Foreign(buffer) => buffer,
        }
    }

    fn buffer_mut(&mut self) -> &mut [u8] {
        match &mut self.backing {
            Backing::Owned(buffer) => buffer,
            Backing::Foreign(buffer) => buffer,
        }
    }

    fn resize(&mut self, new_len: usize) -> bool {
        match &mut self.backing {
            Backing::Owned(buffer) => {
                buffer.resize(new_len, 0);
                true
            }
            Backing::Foreign(_) => {
                log::error!("savestate: buffer is externally owned, cannot resize it");
                false
            }
        }
    }

    fn truncate(&mut self, len: usize) {
        if let Backing::Owned(buffer) = &mut self.backing {
            buffer.truncate(len);
        }
    }
}

impl Default for Savestate {
    fn default() -> Self {
        Self::new()
    }
}

/// Appends sections and little-endian values to a [`Savestate`].
///
/// Errors are sticky: once latched, every subsequent operation is a no-op.
/// Callers check [`SavestateWriter::error`] once, after [`SavestateWriter::finish`].
#[derive(Debug)]
pub struct SavestateWriter<'buf> {
    state: &'buf mut Savestate,
    buffer_offset: usize,
    current_section: Option<usize>,
    error: bool,
    closed: bool,
}

impl<'buf> SavestateWriter<'buf> {
    pub fn new(state: &'buf mut Savestate) -> Self {
        let mut writer =
            Self { state, buffer_offset: 0, current_section: None, error: false, closed: false };

        writer.var_array(&SAVESTATE_MAGIC);
        writer.var_u16(SAVESTATE_MAJOR);
        writer.var_u16(SAVESTATE_MINOR);

        // Total length, backpatched by finish(), then 4 reserved bytes
        writer.var_u32(0);
        writer.var_u32(0);

        writer
    }

    #[must_use]
    pub fn error(&self) -> bool {
        self.error
    }

    #[must_use]
    pub fn written_len(&self) -> usize {
        self.buffer_offset
    }

    /// Closes the open section (if any) and starts a new one.
    pub fn section(&mut self, magic: [u8; 4]) {
        if self.error || self.closed {
            return;
        }

        self.close_current_section();

        self.current_section = Some(self.buffer_offset);

        self.var_array(&magic);
        // Section length, backpatched when the section closes, then 8 reserved bytes
        self.var_u32(0);
        self.var_u64(0);
    }

    fn close_current_section(&mut self) {
        if let Some(section_start) = self.current_section.take() {
            let section_len = (self.buffer_offset - section_start) as u32;
            self.state.buffer_mut()[section_start + 4..section_start + 8]
                .copy_from_slice(&section_len.to_le_bytes());
        }
    }

    pub fn var_u8(&mut self, value: u8) {
        self.var_array(&[value]);
    }

    pub fn var_u16(&mut self, value: u16) {
        self.var_array(&value.to_le_bytes());
    }

    pub fn var_u32(&mut self, value: u32) {
        self.var_array(&value.to_le_bytes());
    }

    pub fn var_u64(&mut self, value: u64) {
        self.var_array(&value.to_le_bytes());
    }

    // Booleans are stored as u32 for compatibility with older dumps
    pub fn bool32(&mut self, value: bool) {
        self.var_u32(value.into());
    }

    pub fn var_array(&mut self, data: &[u8]) {
        if self.error || self.closed {
            return;
        }

        if self.buffer_offset + data.len() > self.state.len() {
            log::warn!(
                "savestate: {}-byte write would exceed {}-byte savestate buffer",
                data.len(),
                self.state.len()
            );

            // Double the buffer plus the current write size so we don't
            // immediately overflow again
            let new_len = self.state.len() * 2 + data.len();
            if !self.state.resize(new_len) {
                log::error!("savestate: failed to write {} bytes to savestate", data.len());
                self.error = true;
                return;
            }
        }

        self.state.buffer_mut()[self.buffer_offset..self.buffer_offset + data.len()]
            .copy_from_slice(data);
        self.buffer_offset += data.len();
    }

    /// Closes the open section, backpatches the total length, and trims an
    /// owned buffer down to the written length. Returns that length.
    pub fn finish(&mut self) -> usize {
        if self.error || self.closed {
            return self.buffer_offset;
        }

        self.close_current_section();

        let total_len = self.buffer_offset as u32;
        self.state.buffer_mut()[8..12].copy_from_slice(&total_len.to_le_bytes());

        self.state.truncate(self.buffer_offset);
        self.closed = true;

        self.buffer_offset
    }
}

/// Reads sections and little-endian values back out of a [`Savestate`].
///
/// The constructor validates the file header and latches an error on any
/// mismatch. A missed section suppresses reads (they return zeroes) until the
/// next successful [`SavestateReader::section`] call; a latched error
/// suppresses them permanently.
#[derive(Debug)]
pub struct SavestateReader<'buf> {
    state: &'buf Savestate,
    buffer_offset: usize,
    total_len: usize,
    version_major: u16,
    version_minor: u16,
    error: bool,
    section_ok: bool,
    closed: bool,
}

impl<'buf> SavestateReader<'buf> {
    pub fn new(state: &'buf Savestate) -> Self {
        let mut reader = Self {
            state,
            buffer_offset: 0,
            total_len: 0,
            version_major: SAVESTATE_MAJOR,
            version_minor: SAVESTATE_MINOR,
            error: false,
            section_ok: true,
            closed: false,
        };

        let mut magic = [0; 4];
        reader.var_array(&mut magic);
        if magic != SAVESTATE_MAGIC {
            log::error!(
                "savestate: expected magic {:02X?} ({}), got {magic:02X?}",
                SAVESTATE_MAGIC,
                str::from_utf8(&SAVESTATE_MAGIC).unwrap()
            );
            reader.error = true;
            return reader;
        }

        reader.version_major = reader.var_u16();
        if reader.version_major != SAVESTATE_MAJOR {
            log::error!(
                "savestate: bad version major {}, expecting {SAVESTATE_MAJOR}",
                reader.version_major
            );
            reader.error = true;
            return reader;
        }

        reader.version_minor = reader.var_u16();
        if reader.version_minor > SAVESTATE_MINOR {
            log::error!(
                "savestate: state from the future, {} > {SAVESTATE_MINOR}",
                reader.version_minor
            );
            reader.error = true;
            return reader;
        }

        let total_len = reader.var_u32() as usize;
        if total_len > state.len() {
            log::error!(
                "savestate: stored length {total_len} exceeds {}-byte buffer",
                state.len()
            );
            reader.error = true;
            return reader;
        }
        reader.total_len = total_len;

        // 4 reserved bytes
        reader.buffer_offset += 4;

        reader
    }

    #[must_use]
    pub fn error(&self) -> bool {
        self.error
    }

    #[must_use]
    pub fn is_at_least_version(&self, major: u16, minor: u16) -> bool {
        (self.version_major, self.version_minor) >= (major, minor)
    }

    /// Scans the section stream for `magic`. On a hit, subsequent reads start
    /// right after the section header. On a miss, reads return zeroes until
    /// another section is found.
    pub fn section(&mut self, magic: [u8; 4]) {
        if self.error || self.closed {
            return;
        }

        let buffer = self.state.buffer();

        let mut offset = HEADER_LEN;
        while offset + SECTION_HEADER_LEN <= self.total_len {
            if buffer[offset..offset + 4] == magic {
                self.buffer_offset = offset + SECTION_HEADER_LEN;
                self.section_ok = true;
                return;
            }

            let section_len =
                u32::from_le_bytes(buffer[offset + 4..offset + 8].try_into().unwrap()) as usize;
            if section_len < SECTION_HEADER_LEN {
                // A zero/short length would loop forever; the stream is corrupt
                break;
            }
            offset += section_len;
        }

        log::error!(
            "savestate: section {} not found",
            str::from_utf8(&magic).unwrap_or("????")
        );
        self.section_ok = false;
    }

    pub fn var_u8(&mut self) -> u8 {
        let mut bytes = [0; 1];
        self.var_array(&mut bytes);
        bytes[0]
    }

    pub fn var_u16(&mut self) -> u16 {
        let mut bytes = [0; 2];
        self.var_array(&mut bytes);
        u16::from_le_bytes(bytes)
    }

    pub fn var_u32(&mut self) -> u32 {
        let mut bytes = [0; 4];
        self.var_array(&mut bytes);
        u32::from_le_bytes(bytes)
    }

    pub fn var_u64(&mut self) -> u64 {
        let mut bytes = [0; 8];
        self.var_array(&mut bytes);
        u64::from_le_bytes(bytes)
    }

    pub fn bool32(&mut self) -> bool {
        self.var_u32() != 0
    }

    pub fn var_array(&mut self, out: &mut [u8]) {
        if self.error || self.closed || !self.section_ok {
            out.fill(0);
            return;
        }

        if self.buffer_offset + out.len() > self.state.len() {
            log::error!(
                "savestate: {}-byte read would exceed {}-byte savestate buffer",
                out.len(),
                self.state.len()
            );
            self.error = true;
            out.fill(0);
            return;
        }

        out.copy_from_slice(&self.state.buffer()[self.buffer_offset..self.buffer_offset + out.len()]);
        self.buffer_offset += out.len();
    }

    pub fn finish(&mut self) {
        self.closed = true;
    }
}

/// Implemented by every component that contributes to a savestate.
pub trait Snapshot {
    fn save(&mut self, file: &mut SavestateWriter<'_>);

    fn load(&mut self, file: &mut SavestateReader<'_>);
}
