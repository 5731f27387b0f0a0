//! Backup memory behind the cartridge SPI bus: tiny EEPROM, EEPROM, FLASH,
//! and the NAND save memory of later retail carts.
//!
//! The three SPI families are byte-level state machines driven one transfer
//! byte at a time; `pos` is the byte's position within the chip-select
//! transaction and `last` marks its final byte. NAND save memory ignores the
//! SPI bus entirely and is driven through dedicated ROM-bus commands instead.

use crate::cartridge::romlist::SRAM_LEN;
use nds_common::savestate::{SavestateReader, SavestateWriter};

const WEL: u8 = 1 << 1;

// NAND status bits: bit 5 ready, bit 4 write-enabled
const NAND_READY: u8 = 1 << 5;
const NAND_WRITE_ENABLE: u8 = 1 << 4;

const NAND_WINDOW_LEN: u32 = 0x20000;
const NAND_WRITE_BUFFER_LEN: usize = 0x800;

// Chip-ID block served by NAND command 94, as dumped from a retail cart
const NAND_ID: [u8; 16] = [
    0xEC, 0x00, 0x9E, 0xA1, 0x51, 0x65, 0x34, 0x35, 0x30, 0x35, 0x30, 0x31, 0x19, 0x19, 0x02, 0x0A,
];

/// Persistence boundary for backup-memory writes. Called once per completed
/// write transaction with the range that changed.
pub trait NdsSaveWriter {
    fn write_nds_save(&mut self, savedata: &[u8], first_addr: u32, len: u32);
}

/// Discards all persistence calls.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSaveWriter;

impl NdsSaveWriter for NullSaveWriter {
    fn write_nds_save(&mut self, _savedata: &[u8], _first_addr: u32, _len: u32) {}
}

// SPI transaction registers shared by the three SPI families
#[derive(Debug, Clone, Default)]
struct SpiState {
    status: u8,
    cmd: u8,
    addr: u32,
    first_addr: u32,
}

impl SpiState {
    fn save(&mut self, file: &mut SavestateWriter<'_>) {
        file.var_u8(self.cmd);
        file.var_u32(self.addr);
        file.var_u8(self.status);
        file.var_u32(self.first_addr);
    }

    fn load(&mut self, file: &mut SavestateReader<'_>) {
        self.cmd = file.var_u8();
        self.addr = file.var_u32();
        self.status = file.var_u8();
        self.first_addr = file.var_u32();
    }
}

#[derive(Debug)]
pub struct EepromTiny {
    sram: Box<[u8]>,
    state: SpiState,
}

impl EepromTiny {
    fn write(&mut self, val: u8, pos: u32, last: bool, save: &mut dyn NdsSaveWriter) -> u8 {
        let state = &mut self.state;
        let high_half = |cmd: u8| if cmd & 0x08 != 0 { 0x100 } else { 0 };

        match state.cmd {
            0x01 => {
                // write status register; only the write-protect bits stick
                if pos == 1 {
                    state.status = (state.status & 0x01) | (val & 0x0C);
                }
                0
            }

            0x05 => state.status | 0xF0,

            // write low / write high
            0x02 | 0x0A => {
                if pos < 2 {
                    state.addr = val.into();
                    state.first_addr = state.addr;
                } else {
                    if state.status & WEL != 0 {
                        let addr = (state.addr + high_half(state.cmd)) & 0x1FF;
                        self.sram[addr as usize] = val;
                    }
                    state.addr += 1;
                }
                if last {
                    state.status &= !WEL;
                    save.write_nds_save(
                        &self.sram,
                        (state.first_addr + high_half(state.cmd)) & 0x1FF,
                        state.addr - state.first_addr,
                    );
                }
                0
            }

            // read low / read high
            0x03 | 0x0B => {
                if pos < 2 {
                    state.addr = val.into();
                    0
                } else {
                    let addr = (state.addr + high_half(state.cmd)) & 0x1FF;
                    state.addr += 1;
                    self.sram[addr as usize]
                }
            }

            0x9F => 0xFF,

            cmd => {
                if pos == 1 {
                    log::warn!("unknown tiny EEPROM save command {cmd:02X}");
                }
                0xFF
            }
        }
    }
}

#[derive(Debug)]
pub struct Eeprom {
    sram: Box<[u8]>,
    state: SpiState,
}

impl Eeprom {
    fn addr_width(&self) -> u32 {
        if self.sram.len() > 65536 { 3 } else { 2 }
    }

    fn write(&mut self, val: u8, pos: u32, last: bool, save: &mut dyn NdsSaveWriter) -> u8 {
        let addr_width = self.addr_width();
        let mask = (self.sram.len() - 1) as u32;
        let state = &mut self.state;

        match state.cmd {
            0x01 => {
                if pos == 1 {
                    state.status = (state.status & 0x01) | (val & 0x0C);
                }
                0
            }

            0x05 => state.status,

            0x02 => {
                if pos <= addr_width {
                    state.addr = (state.addr << 8) | u32::from(val);
                    state.first_addr = state.addr;
                } else {
                    if state.status & WEL != 0 {
                        self.sram[(state.addr & mask) as usize] = val;
                    }
                    state.addr += 1;
                }
                if last {
                    state.status &= !WEL;
                    save.write_nds_save(
                        &self.sram,
                        state.first_addr & mask,
                        state.addr - state.first_addr,
                    );
                }
                0
            }

            0x03 => {
                if pos <= addr_width {
                    state.addr = (state.addr << 8) | u32::from(val);
                    0
                } else {
                    let byte = self.sram[(state.addr & mask) as usize];
                    state.addr += 1;
                    byte
                }
            }

            0x9F => 0xFF,

            cmd => {
                if pos == 1 {
                    log::warn!("unknown EEPROM save command {cmd:02X}");
                }
                0xFF
            }
        }
    }
}

#[derive(Debug)]
pub struct Flash {
    sram: Box<[u8]>,
    state: SpiState,
}

impl Flash {
    fn write(&mut self, val: u8, pos: u32, last: bool, save: &mut dyn NdsSaveWriter) -> u8 {
        let mask = (self.sram.len() - 1) as u32;
        let state = &mut self.state;

        let mut finish_write = |state: &mut SpiState, sram: &[u8]| {
            if last {
                state.status &= !WEL;
                save.write_nds_save(sram, state.first_addr & mask, state.addr - state.first_addr);
            }
        };

        match state.cmd {
            0x05 => state.status,

            // page program; writes zeroes, only page write (0A) carries data
            0x02 => {
                if pos <= 3 {
                    state.addr = (state.addr << 8) | u32::from(val);
                    state.first_addr = state.addr;
                } else {
                    if state.status & WEL != 0 {
                        self.sram[(state.addr & mask) as usize] = 0;
                    }
                    state.addr += 1;
                }
                finish_write(state, &self.sram);
                0
            }

            0x03 => {
                if pos <= 3 {
                    state.addr = (state.addr << 8) | u32::from(val);
                    0
                } else {
                    let byte = self.sram[(state.addr & mask) as usize];
                    state.addr += 1;
                    byte
                }
            }

            // page write
            0x0A => {
                if pos <= 3 {
                    state.addr = (state.addr << 8) | u32::from(val);
                    state.first_addr = state.addr;
                } else {
                    if state.status & WEL != 0 {
                        self.sram[(state.addr & mask) as usize] = val;
                    }
                    state.addr += 1;
                }
                finish_write(state, &self.sram);
                0
            }

            // fast read: one dummy byte after the address
            0x0B => {
                if pos <= 3 {
                    state.addr = (state.addr << 8) | u32::from(val);
                    0
                } else if pos == 4 {
                    0
                } else {
                    let byte = self.sram[(state.addr & mask) as usize];
                    state.addr += 1;
                    byte
                }
            }

            0x9F => 0xFF,

            // sector erase (64 KiB)
            0xD8 => {
                if pos <= 3 {
                    state.addr = (state.addr << 8) | u32::from(val);
                    state.first_addr = state.addr;
                }
                if pos == 3 && state.status & WEL != 0 {
                    for _ in 0..0x10000 {
                        self.sram[(state.addr & mask) as usize] = 0;
                        state.addr += 1;
                    }
                }
                finish_write(state, &self.sram);
                0
            }

            // page erase (256 B)
            0xDB => {
                if pos <= 3 {
                    state.addr = (state.addr << 8) | u32::from(val);
                    state.first_addr = state.addr;
                }
                if pos == 3 && state.status & WEL != 0 {
                    for _ in 0..0x100 {
                        self.sram[(state.addr & mask) as usize] = 0;
                        state.addr += 1;
                    }
                }
                finish_write(state, &self.sram);
                0
            }

            cmd => {
                if pos == 1 {
                    log::warn!("unknown FLASH save command {cmd:02X}");
                }
                0xFF
            }
        }
    }
}

/// NAND save memory. Reads and writes go through the ROM command bus; writes
/// are staged in a 2 KiB buffer and only hit the array on an explicit commit.
#[derive(Debug)]
pub struct NandSave {
    sram: Box<[u8]>,
    status: u8,
    base: u32,
    window: u32,
    addr: u32,
    write_buffer: Box<[u8; NAND_WRITE_BUFFER_LEN]>,
    write_pos: u32,
}

impl NandSave {
    fn new(sram: Box<[u8]>, base: u32) -> Self {
        let mut nand = Self {
            sram,
            status: NAND_READY,
            base,
            window: 0,
            addr: 0,
            write_buffer: vec![0; NAND_WRITE_BUFFER_LEN].try_into().unwrap(),
            write_pos: 0,
        };
        nand.build_sram_id();
        nand
    }

    fn sram_len(&self) -> u32 {
        self.sram.len() as u32
    }

    pub fn reset(&mut self) {
        self.status = NAND_READY;
        self.window = 0;
        self.addr = 0;
        self.write_buffer.fill(0);
        self.write_pos = 0;
    }

    #[must_use]
    pub fn status(&self) -> u8 {
        self.status
    }

    #[must_use]
    pub fn window(&self) -> u32 {
        self.window
    }

    /// Command B2: selects the 128 KiB window subsequent reads and writes
    /// operate on.
    pub fn set_window(&mut self, cmd: &[u8; 8]) {
        let addr = (u32::from(cmd[1]) << 24) | (u32::from(cmd[2] & 0xFE) << 16);

        // The real chip hangs 'busy' forever on a window below the save base
        if addr < self.base {
            log::warn!("NAND: !! BAD ADDR {addr:08X} < {:08X}", self.base);
        }
        if addr >= self.base + self.sram_len() {
            log::warn!("NAND: !! BAD ADDR {addr:08X} > {:08X}", self.base + self.sram_len());
        }

        self.window = addr;
    }

    /// Command 8B: back to ROM read mode.
    pub fn rom_mode(&mut self) {
        self.window = 0;
    }

    /// Command 85: arm the write buffer. Ignored without a window.
    pub fn enable_write(&mut self) {
        if self.window != 0 {
            self.status |= NAND_WRITE_ENABLE;
            self.write_pos = 0;
        }
    }

    /// Command 81 at transfer start: latches the burst address. The command
    /// is repeated with the same address within a burst; only the first one
    /// counts.
    pub fn begin_write(&mut self, cmd: &[u8; 8]) {
        let in_window = self.status & NAND_WRITE_ENABLE != 0
            && self.window >= self.base
            && self.window < self.base + self.sram_len();

        if in_window {
            let addr = (u32::from(cmd[1]) << 24)
                | (u32::from(cmd[2]) << 16)
                | (u32::from(cmd[3]) << 8)
                | u32::from(cmd[4]);

            if addr >= self.window && addr < self.window + NAND_WINDOW_LEN && self.addr == 0 {
                self.addr = addr;
            }
        } else {
            self.addr = 0;
        }
    }

    /// Command 81 at transfer end: stages the burst payload.
    pub fn buffer_write(&mut self, data: &[u8]) {
        if self.addr == 0 {
            return;
        }

        let space = NAND_WRITE_BUFFER_LEN - self.write_pos as usize;
        let len = data.len().min(space);
        self.write_buffer[self.write_pos as usize..self.write_pos as usize + len]
            .copy_from_slice(&data[..len]);
        self.write_pos += len as u32;
    }

    /// Command 82: flushes the staged buffer into the array. Commits outside
    /// the writable area are silently dropped.
    pub fn commit_write(&mut self, save: &mut dyn NdsSaveWriter) {
        if self.addr != 0 && self.write_pos != 0 {
            let len = self.sram_len();
            if len != 0 && self.addr < self.base + len - NAND_WINDOW_LEN {
                let offset = (self.addr - self.base) as usize;
                self.sram[offset..offset + NAND_WRITE_BUFFER_LEN]
                    .copy_from_slice(&self.write_buffer[..]);
                save.write_nds_save(&self.sram, self.addr - self.base, NAND_WRITE_BUFFER_LEN as u32);
            }

            self.addr = 0;
            self.write_pos = 0;
        }
        self.status &= !NAND_WRITE_ENABLE;
    }

    /// Command 84: drops the staged buffer.
    pub fn discard_write(&mut self) {
        self.addr = 0;
        self.write_pos = 0;
    }

    /// Command B7 while a window is selected: reads save memory instead of
    /// ROM. Bytes outside the window read back as FF.
    pub fn window_read(&self, addr: u32, out: &mut [u8]) {
        out.fill(0xFF);

        if self.window >= self.base
            && self.window < self.base + self.sram_len()
            && addr >= self.window
            && addr < self.window + NAND_WINDOW_LEN
        {
            let offset = (addr - self.base) as usize;
            let len = out.len().min(self.sram.len() - offset);
            out[..len].copy_from_slice(&self.sram[offset..offset + len]);
        }
    }

    /// Command 94: the 0x30-byte chip-ID block. A fixed 5-byte header, then
    /// the chip ID from the read-only tail of the array at offset 0x18.
    pub fn id_block(&self, out: &mut [u8]) {
        let mut id_data = [0u8; 0x30];
        id_data[..5].copy_from_slice(&[0xEC, 0xF1, 0x00, 0x95, 0x40]);
        if self.sram_len() != 0 {
            let id_start = self.sram.len() - NAND_WRITE_BUFFER_LEN;
            id_data[0x18..0x28].copy_from_slice(&self.sram[id_start..id_start + 16]);
        }

        out.fill(0);
        let len = out.len().min(0x30);
        out[..len].copy_from_slice(&id_data[..len]);
    }

    /// Command D6: the status byte replicated across every word.
    pub fn status_read(&self, out: &mut [u8]) {
        out.fill(self.status);
    }

    // The last 128 KiB of the array are read-only: FF-filled except for the
    // chip ID at the start of the final 2 KiB
    fn build_sram_id(&mut self) {
        if self.sram_len() > NAND_WINDOW_LEN {
            let len = self.sram.len();
            self.sram[len - NAND_WINDOW_LEN as usize..].fill(0xFF);
            self.sram[len - NAND_WRITE_BUFFER_LEN..len - NAND_WRITE_BUFFER_LEN + 16]
                .copy_from_slice(&NAND_ID);
        }
    }
}

/// The four backup-memory families, plus the no-backup case.
#[derive(Debug)]
pub enum CartBackup {
    None,
    EepromTiny(EepromTiny),
    Eeprom(Eeprom),
    Flash(Flash),
    Nand(NandSave),
}

impl CartBackup {
    /// Builds the family matching a ROM-list `save_mem_type`, with the array
    /// erased to FF. `nand_sram_start` is the header halfword the NAND save
    /// base is derived from.
    #[must_use]
    pub fn new(save_mem_type: u8, nand_sram_start: u16) -> Self {
        let save_mem_type = if save_mem_type > 10 { 0 } else { save_mem_type };
        let sram_len = SRAM_LEN[save_mem_type as usize] as usize;
        let sram = vec![0xFF; sram_len].into_boxed_slice();

        match save_mem_type {
            1 => Self::EepromTiny(EepromTiny { sram, state: SpiState::default() }),
            2..=4 => Self::Eeprom(Eeprom { sram, state: SpiState::default() }),
            5..=7 => Self::Flash(Flash { sram, state: SpiState::default() }),
            8..=10 => Self::Nand(NandSave::new(sram, u32::from(nand_sram_start) << 17)),
            _ => Self::None,
        }
    }

    pub fn reset(&mut self) {
        match self {
            Self::None => {}
            Self::EepromTiny(chip) => chip.state = SpiState::default(),
            Self::Eeprom(chip) => chip.state = SpiState::default(),
            Self::Flash(chip) => chip.state = SpiState::default(),
            Self::Nand(nand) => nand.reset(),
        }
    }

    /// Overlays a save file onto the array and persists the result.
    pub fn load_save(&mut self, savedata: &[u8], save: &mut dyn NdsSaveWriter) {
        let Some(sram) = self.sram_mut() else { return };

        let len = savedata.len().min(sram.len());
        sram[..len].copy_from_slice(&savedata[..len]);
        save.write_nds_save(&sram[..len], 0, len as u32);

        if let Self::Nand(nand) = self {
            nand.build_sram_id();
        }
    }

    /// One SPI transfer byte. `pos` is its position within the transaction,
    /// `last` marks the final byte before chip deselect.
    pub fn spi_write(&mut self, val: u8, pos: u32, last: bool, save: &mut dyn NdsSaveWriter) -> u8 {
        // NAND save memory does not answer on the SPI bus
        if matches!(self, Self::None) {
            return 0;
        }
        if matches!(self, Self::Nand(_)) {
            return 0xFF;
        }

        if pos == 0 {
            let state = self.spi_state_mut().unwrap();
            return match val {
                0x04 => {
                    // write disable
                    state.status &= !WEL;
                    0
                }
                0x06 => {
                    // write enable
                    state.status |= WEL;
                    0
                }
                cmd => {
                    state.cmd = cmd;
                    state.addr = 0;
                    0xFF
                }
            };
        }

        match self {
            Self::EepromTiny(chip) => chip.write(val, pos, last, save),
            Self::Eeprom(chip) => chip.write(val, pos, last, save),
            Self::Flash(chip) => chip.write(val, pos, last, save),
            Self::None | Self::Nand(_) => unreachable!(),
        }
    }

    #[must_use]
    pub fn sram(&self) -> Option<&[u8]> {
        match self {
            Self::None => None,
            Self::EepromTiny(chip) => Some(&chip.sram),
            Self::Eeprom(chip) => Some(&chip.sram),
            Self::Flash(chip) => Some(&chip.sram),
            Self::Nand(nand) => Some(&nand.sram),
        }
    }

    fn sram_mut(&mut self) -> Option<&mut [u8]> {
        match self {
            Self::None => None,
            Self::EepromTiny(chip) => Some(&mut chip.sram),
            Self::Eeprom(chip) => Some(&mut chip.sram),
            Self::Flash(chip) => Some(&mut chip.sram),
            Self::Nand(nand) => Some(&mut nand.sram),
        }
    }

    fn spi_state_mut(&mut self) -> Option<&mut SpiState> {
        match self {
            Self::None | Self::Nand(_) => None,
            Self::EepromTiny(chip) => Some(&mut chip.state),
            Self::Eeprom(chip) => Some(&mut chip.state),
            Self::Flash(chip) => Some(&mut chip.state),
        }
    }

    #[must_use]
    pub fn nand(&self) -> Option<&NandSave> {
        match self {
            Self::Nand(nand) => Some(nand),
            _ => None,
        }
    }

    pub fn nand_mut(&mut self) -> Option<&mut NandSave> {
        match self {
            Self::Nand(nand) => Some(nand),
            _ => None,
        }
    }

    /// Serializes the array contents and SPI registers. The array length is
    /// stored first so a mismatched savestate can be detected on load.
    pub fn save_state(&mut self, file: &mut SavestateWriter<'_>) {
        let sram_len = self.sram().map_or(0, <[u8]>::len) as u32;
        file.var_u32(sram_len);
        if let Some(sram) = self.sram() {
            file.var_array(sram);
        }

        match self {
            Self::None => {}
            Self::EepromTiny(chip) => chip.state.save(file),
            Self::Eeprom(chip) => chip.state.save(file),
            Self::Flash(chip) => chip.state.save(file),
            Self::Nand(nand) => {
                file.var_u32(nand.base);
                file.var_u32(nand.window);
                file.var_u32(nand.addr);
                file.var_array(&nand.write_buffer[..]);
                file.var_u32(nand.write_pos);
                file.var_u8(nand.status);
            }
        }
    }

    /// Restores the array and registers, then re-persists the loaded
    /// contents so the on-disk save matches the restored state.
    pub fn load_state(&mut self, file: &mut SavestateReader<'_>, save: &mut dyn NdsSaveWriter) {
        let stored_len = file.var_u32();
        let sram_len = self.sram().map_or(0, <[u8]>::len) as u32;
        if stored_len != sram_len {
            log::warn!("savestate: SRAM length mismatch, {sram_len} -> {stored_len}; loading anyway");
        }

        if let Some(sram) = self.sram_mut() {
            let mut restored = vec![0; stored_len as usize];
            file.var_array(&mut restored);
            let len = restored.len().min(sram.len());
            sram[..len].copy_from_slice(&restored[..len]);
        }

        match self {
            Self::None => {}
            Self::EepromTiny(chip) => chip.state.load(file),
            Self::Eeprom(chip) => chip.state.load(file),
            Self::Flash(chip) => chip.state.load(file),
            Self::Nand(nand) => {
                nand.base = file.var_u32();
                nand.window = file.var_u32();
                nand.addr = file.var_u32();
                let mut buffer = vec![0; NAND_WRITE_BUFFER_LEN];
                file.var_array(&mut buffer);
                nand.write_buffer.copy_from_slice(&buffer);
                nand.write_pos = file.var_u32();
                nand.status = file.var_u8();
                nand.build_sram_id();
            }
        }

        if let Some(sram) = self.sram() {
            save.write_nds_save(sram, 0, sram.len() as u32);
        }
    }
}
