//! Cartridge slot: the ROM/SPI transfer engine and the game-pak types that
//! answer its commands.
//!
//! A transfer is two-staged: a write to ROMCNT with bit 31 set latches the
//! 8-byte command and asks the cart to produce (or accept) the payload, then
//! timed events deliver it one 32-bit word at a time through ROMDATA. The
//! command set the cart answers depends on its encryption mode: plaintext at
//! power-on, KEY1 during boot negotiation, KEY2 for everything after.

pub mod backup;
pub mod key1;
pub mod key2;
pub mod rom;
pub mod romlist;

use crate::cartridge::backup::{CartBackup, NdsSaveWriter};
use crate::cartridge::key1::{Key1, KEY_SEED_LEN};
use crate::cartridge::key2::Key2;
use crate::cartridge::rom::{CartHeader, CartRom};
use crate::cartridge::romlist::RomListEntry;
use crate::interrupts::{CpuId, Interrupts, IrqSource};
use crate::scheduler::{Scheduler, SchedulerEvent};
use nds_common::num::GetBit;
use nds_common::savestate::{SavestateReader, SavestateWriter};
use std::fmt::Debug;
use thiserror::Error;

pub const TRANSFER_DATA_LEN: usize = 0x4000;

#[derive(Debug, Error)]
pub enum CartLoadError {
    #[error("ROM image is empty")]
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    CartToHost = 0,
    HostToCart = 1,
}

/// 512-byte-sector block device backing a homebrew cart's SD commands.
pub trait BlockDevice: Debug {
    fn read_sectors(&mut self, sector: u32, out: &mut [u8]);

    fn write_sectors(&mut self, sector: u32, data: &[u8]);
}

/// State shared by every cart flavor: the ROM image, the chip ID, and the
/// command-encryption handshake.
#[derive(Debug)]
pub struct CartCommon {
    rom: CartRom,
    chip_id: u32,
    rom_params: RomListEntry,
    cmd_enc_mode: u8,
    data_enc_mode: u8,
    dsi_mode: bool,
    key1_seed: Box<[u8; KEY_SEED_LEN]>,
    key1_seed_dsi: Box<[u8; KEY_SEED_LEN]>,
    // Rebuilt from the seed by the KEY1-init commands; never reused across them
    key1: Option<Key1>,
}

impl CartCommon {
    fn new(
        rom: CartRom,
        chip_id: u32,
        rom_params: RomListEntry,
        key1_seed: Box<[u8; KEY_SEED_LEN]>,
        key1_seed_dsi: Box<[u8; KEY_SEED_LEN]>,
    ) -> Self {
        Self {
            rom,
            chip_id,
            rom_params,
            cmd_enc_mode: 0,
            data_enc_mode: 0,
            dsi_mode: false,
            key1_seed,
            key1_seed_dsi,
            key1: None,
        }
    }

    fn reset(&mut self) {
        self.cmd_enc_mode = 0;
        self.data_enc_mode = 0;
        self.dsi_mode = false;
        self.key1 = None;
    }

    fn setup_direct_boot(&mut self, dsi_console: bool) {
        self.cmd_enc_mode = 2;
        self.data_enc_mode = 2;
        self.dsi_mode = self.rom.is_dsi() && dsi_console;
    }

    fn fill_chip_id(&self, data: &mut [u8]) {
        for chunk in data.chunks_exact_mut(4) {
            chunk.copy_from_slice(&self.chip_id.to_le_bytes());
        }
    }

    fn command_start(&mut self, cmd: [u8; 8], data: &mut [u8]) -> TransferDirection {
        match self.cmd_enc_mode {
            0 => self.command_start_plain(cmd, data),
            1 => self.command_start_key1(cmd, data),
            2 => {
                if cmd[0] == 0xB8 {
                    self.fill_chip_id(data);
                }
                TransferDirection::CartToHost
            }
            mode => {
                log::warn!("cart command in bogus encryption mode {mode}");
                TransferDirection::CartToHost
            }
        }
    }

    fn command_start_plain(&mut self, cmd: [u8; 8], data: &mut [u8]) -> TransferDirection {
        match cmd[0] {
            // dummy
            0x9F => data.fill(0xFF),

            // header read; the first 4 KiB repeat across longer payloads
            0x00 => {
                data.fill(0);
                if data.len() > 0x1000 {
                    self.rom.read(0, &mut data[..0x1000]);
                    let (head, tail) = data.split_at_mut(0x1000);
                    for chunk in tail.chunks_mut(0x1000) {
                        chunk.copy_from_slice(&head[..chunk.len()]);
                    }
                } else {
                    self.rom.read(0, data);
                }
            }

            0x90 => self.fill_chip_id(data),

            // KEY1 init, DS flavor
            0x3C => {
                self.cmd_enc_mode = 1;
                let idcode = self.rom.header().game_code_u32();
                self.key1 = Some(Key1::new(&self.key1_seed, idcode, 2, 2));
                self.dsi_mode = false;
            }

            // KEY1 init, DSi flavor
            0x3D => {
                if self.rom.is_dsi() {
                    self.cmd_enc_mode = 1;
                    let idcode = self.rom.header().game_code_u32();
                    self.key1 = Some(Key1::new(&self.key1_seed_dsi, idcode, 1, 2));
                    self.dsi_mode = true;
                }
            }

            _ => {}
        }

        TransferDirection::CartToHost
    }

    fn command_start_key1(&mut self, cmd: [u8; 8], data: &mut [u8]) -> TransferDirection {
        // KEY2 is applied by the bus hardware, but KEY1 commands are encrypted
        // by the software sending them, so they have to be decrypted here
        let Some(key1) = &self.key1 else {
            log::warn!("KEY1 command received before KEY1 init");
            return TransferDirection::CartToHost;
        };

        let c0 = u32::from_le_bytes(cmd[0..4].try_into().unwrap());
        let c1 = u32::from_le_bytes(cmd[4..8].try_into().unwrap());
        let mut pair = [c1.swap_bytes(), c0.swap_bytes()];
        key1.decrypt(&mut pair);
        let p0 = pair[1].swap_bytes();
        let p1 = pair[0].swap_bytes();

        let mut dec = [0; 8];
        dec[0..4].copy_from_slice(&p0.to_le_bytes());
        dec[4..8].copy_from_slice(&p1.to_le_bytes());

        match dec[0] & 0xF0 {
            // enable KEY2 on the data path
            0x40 => self.data_enc_mode = 2,

            0x10 => self.fill_chip_id(data),

            // secure area read
            0x20 => {
                let mut addr = u32::from(dec[2] & 0xF0) << 8;
                if self.dsi_mode {
                    // the DSi region starts with 0x3000 unreadable bytes of
                    // KEY1 material, mirroring the DS layout at 0x1000
                    addr = addr.wrapping_sub(0x1000).wrapping_add(self.rom.dsi_base());
                }
                let n = data.len().min(0x1000);
                self.rom.read(addr, &mut data[..n]);
            }

            // enter KEY2 command mode
            0xA0 => self.cmd_enc_mode = 2,

            opcode => log::debug!("unknown KEY1 command {opcode:02X}"),
        }

        TransferDirection::CartToHost
    }

    fn save_state(&mut self, file: &mut SavestateWriter<'_>) {
        file.section(*b"NDCS");

        file.var_u32(self.cmd_enc_mode.into());
        file.var_u32(self.data_enc_mode.into());
        file.bool32(self.dsi_mode);
    }

    fn load_state(&mut self, file: &mut SavestateReader<'_>) {
        file.section(*b"NDCS");

        self.cmd_enc_mode = file.var_u32() as u8;
        self.data_enc_mode = file.var_u32() as u8;
        self.dsi_mode = file.bool32();

        // The schedule is transient handshake state; a restored cart past the
        // KEY1 phase never consults it again, and one still inside it will be
        // re-initialized by the next 3C/3D command
        self.key1 = None;
    }
}

/// Retail cart: gated ROM reads plus SPI backup memory.
#[derive(Debug)]
pub struct CartRetail {
    common: CartCommon,
    backup: CartBackup,
}

impl CartRetail {
    fn command_start(&mut self, cmd: [u8; 8], data: &mut [u8]) -> TransferDirection {
        if self.common.cmd_enc_mode != 2 {
            return self.common.command_start(cmd, data);
        }

        match cmd[0] {
            0xB7 => {
                read_b7_split(&self.common.rom, cmd, data, self.common.dsi_mode);
                TransferDirection::CartToHost
            }
            _ => self.common.command_start(cmd, data),
        }
    }
}

/// Retail cart with NAND save memory; backup access rides the ROM command bus.
#[derive(Debug)]
pub struct CartRetailNand {
    common: CartCommon,
    backup: CartBackup,
}

impl CartRetailNand {
    fn command_start(
        &mut self,
        cmd: [u8; 8],
        data: &mut [u8],
        save: &mut dyn NdsSaveWriter,
    ) -> TransferDirection {
        if self.common.cmd_enc_mode != 2 {
            return self.common.command_start(cmd, data);
        }

        let nand = self.backup.nand_mut().expect("NAND cart without NAND backup");

        match cmd[0] {
            0x81 => {
                nand.begin_write(&cmd);
                return TransferDirection::HostToCart;
            }
            0x82 => nand.commit_write(save),
            0x84 => nand.discard_write(),
            0x85 => nand.enable_write(),
            0x8B => nand.rom_mode(),
            0x94 => nand.id_block(data),
            0xB2 => nand.set_window(&cmd),
            0xB7 => {
                if nand.window() == 0 {
                    read_b7_split(&self.common.rom, cmd, data, self.common.dsi_mode);
                } else {
                    let addr = cmd_address(&cmd);
                    nand.window_read(addr, data);
                }
            }
            0xD6 => nand.status_read(data),
            _ => return self.common.command_start(cmd, data),
        }

        TransferDirection::CartToHost
    }

    fn command_finish(&mut self, cmd: [u8; 8], data: &[u8]) {
        if self.common.cmd_enc_mode != 2 {
            return;
        }

        if cmd[0] == 0x81 {
            if let Some(nand) = self.backup.nand_mut() {
                nand.buffer_write(data);
            }
        }
    }
}

/// Homebrew cart: ungated ROM reads plus SD sector access through DLDI.
#[derive(Debug)]
pub struct CartHomebrew {
    common: CartCommon,
    sd: Option<Box<dyn BlockDevice>>,
}

impl CartHomebrew {
    fn command_start(&mut self, cmd: [u8; 8], data: &mut [u8]) -> TransferDirection {
        if self.common.cmd_enc_mode != 2 {
            return self.common.command_start(cmd, data);
        }

        match cmd[0] {
            0xB7 => {
                // homebrew has no secure area to hide; reads just wrap
                let addr = cmd_address(&cmd) & (self.common.rom.len() - 1);
                data.fill(0);
                self.common.rom.read(addr, data);
                TransferDirection::CartToHost
            }

            // SD sector read
            0xC0 => {
                let sector = cmd_address(&cmd);
                if let Some(sd) = &mut self.sd {
                    sd.read_sectors(sector, data);
                }
                TransferDirection::CartToHost
            }

            // SD sector write; the payload arrives over the transfer
            0xC1 => TransferDirection::HostToCart,

            _ => self.common.command_start(cmd, data),
        }
    }

    fn command_finish(&mut self, cmd: [u8; 8], data: &[u8]) {
        if self.common.cmd_enc_mode != 2 {
            return;
        }

        if cmd[0] == 0xC1 {
            let sector = cmd_address(&cmd);
            if let Some(sd) = &mut self.sd {
                sd.write_sectors(sector, data);
            }
        }
    }
}

fn cmd_address(cmd: &[u8; 8]) -> u32 {
    u32::from_be_bytes(cmd[1..5].try_into().unwrap())
}

// B7 reads never cross a 4 KiB boundary on real hardware; split in two when
// the requested range does
fn read_b7_split(rom: &CartRom, cmd: [u8; 8], data: &mut [u8], dsi_mode: bool) {
    let addr = cmd_address(&cmd);
    data.fill(0);

    if data.is_empty() {
        return;
    }

    let len = data.len() as u32;
    if (addr.wrapping_add(len - 1) >> 12) != (addr >> 12) {
        let len1 = (0x1000 - (addr & 0xFFF)) as usize;
        let (head, tail) = data.split_at_mut(len1);
        rom.read_b7(addr, head, dsi_mode);
        rom.read_b7(addr + len1 as u32, tail, dsi_mode);
    } else {
        rom.read_b7(addr, data, dsi_mode);
    }
}

/// An inserted game pak.
#[derive(Debug)]
pub enum Cart {
    Retail(CartRetail),
    RetailNand(CartRetailNand),
    Homebrew(CartHomebrew),
}

impl Cart {
    fn common(&self) -> &CartCommon {
        match self {
            Self::Retail(cart) => &cart.common,
            Self::RetailNand(cart) => &cart.common,
            Self::Homebrew(cart) => &cart.common,
        }
    }

    fn common_mut(&mut self) -> &mut CartCommon {
        match self {
            Self::Retail(cart) => &mut cart.common,
            Self::RetailNand(cart) => &mut cart.common,
            Self::Homebrew(cart) => &mut cart.common,
        }
    }

    fn type_id(&self) -> u32 {
        match self {
            Self::Retail(_) => 1,
            Self::RetailNand(_) => 2,
            Self::Homebrew(_) => 3,
        }
    }

    pub fn reset(&mut self) {
        self.common_mut().reset();
        match self {
            Self::Retail(cart) => cart.backup.reset(),
            Self::RetailNand(cart) => cart.backup.reset(),
            Self::Homebrew(_) => {}
        }
    }

    /// Skips the BIOS boot negotiation: the cart comes up already in KEY2
    /// command mode.
    pub fn setup_direct_boot(&mut self, dsi_console: bool) {
        self.common_mut().setup_direct_boot(dsi_console);
    }

    pub fn header(&self) -> &CartHeader {
        self.common().rom.header()
    }

    #[must_use]
    pub fn chip_id(&self) -> u32 {
        self.common().chip_id
    }

    #[must_use]
    pub fn rom_params(&self) -> RomListEntry {
        self.common().rom_params
    }

    #[must_use]
    pub fn checksum(&self) -> u32 {
        self.common().rom.checksum()
    }

    #[must_use]
    pub fn rom(&self) -> &CartRom {
        &self.common().rom
    }

    pub fn rom_mut(&mut self) -> &mut CartRom {
        &mut self.common_mut().rom
    }

    #[must_use]
    pub fn save_memory(&self) -> Option<&[u8]> {
        match self {
            Self::Retail(cart) => cart.backup.sram(),
            Self::RetailNand(cart) => cart.backup.sram(),
            Self::Homebrew(_) => None,
        }
    }

    /// Overlays a save file onto the backup array.
    pub fn load_save(&mut self, savedata: &[u8], save: &mut dyn NdsSaveWriter) {
        match self {
            Self::Retail(cart) => cart.backup.load_save(savedata, save),
            Self::RetailNand(cart) => cart.backup.load_save(savedata, save),
            Self::Homebrew(_) => {}
        }
    }

    /// Attaches the block device behind a homebrew cart's SD commands.
    pub fn attach_block_device(&mut self, device: Box<dyn BlockDevice>) {
        if let Self::Homebrew(cart) = self {
            cart.sd = Some(device);
        } else {
            log::warn!("block device attached to a non-homebrew cart; ignoring");
        }
    }

    pub fn command_start(
        &mut self,
        cmd: [u8; 8],
        data: &mut [u8],
        save: &mut dyn NdsSaveWriter,
    ) -> TransferDirection {
        match self {
            Self::Retail(cart) => cart.command_start(cmd, data),
            Self::RetailNand(cart) => cart.command_start(cmd, data, save),
            Self::Homebrew(cart) => cart.command_start(cmd, data),
        }
    }

    pub fn command_finish(&mut self, cmd: [u8; 8], data: &[u8]) {
        match self {
            Self::Retail(_) => {}
            Self::RetailNand(cart) => cart.command_finish(cmd, data),
            Self::Homebrew(cart) => cart.command_finish(cmd, data),
        }
    }

    pub fn spi_write(&mut self, val: u8, pos: u32, last: bool, save: &mut dyn NdsSaveWriter) -> u8 {
        match self {
            Self::Retail(cart) => cart.backup.spi_write(val, pos, last, save),
            // NAND carts don't answer on the SPI bus
            Self::RetailNand(_) | Self::Homebrew(_) => 0xFF,
        }
    }

    pub fn save_state(&mut self, file: &mut SavestateWriter<'_>) {
        self.common_mut().save_state(file);

        match self {
            Self::Retail(cart) => cart.backup.save_state(file),
            Self::RetailNand(cart) => cart.backup.save_state(file),
            Self::Homebrew(_) => {}
        }
    }

    pub fn load_state(&mut self, file: &mut SavestateReader<'_>, save: &mut dyn NdsSaveWriter) {
        self.common_mut().load_state(file);

        match self {
            Self::Retail(cart) => cart.backup.load_state(file, save),
            Self::RetailNand(cart) => cart.backup.load_state(file, save),
            Self::Homebrew(_) => {}
        }
    }
}

/// Parses a ROM dump into a cart. The BIOS images seed the KEY1 schedule;
/// either may be absent, in which case secure-area crypto degrades the same
/// way it does on a console with a corrupt BIOS.
pub fn parse_rom(
    romdata: &[u8],
    arm7_bios: Option<&[u8]>,
    dsi_arm7_bios: Option<&[u8]>,
) -> Result<Cart, CartLoadError> {
    if romdata.is_empty() {
        log::error!("cart ROM is empty");
        return Err(CartLoadError::Empty);
    }

    let mut rom_image = romdata.to_vec();
    nds_common::rom::pad_to_power_of_two(&mut rom_image, 0x200);
    if rom_image.len() != romdata.len() {
        log::warn!("bad ROM size {}, rounded to {}", romdata.len(), rom_image.len());
    }

    let rom = CartRom::new(rom_image);
    let header = *rom.header();
    let game_code = header.game_code_u32();
    let homebrew = header.is_homebrew();

    let rom_params = romlist::lookup(game_code).unwrap_or_else(|| {
        log::warn!("ROM entry not found for gamecode {game_code:08X}");
        RomListEntry {
            game_code,
            rom_size: rom.len(),
            // homebrew has no save RAM; otherwise assume 8 KiB EEPROM
            save_mem_type: if homebrew { 0 } else { 2 },
        }
    });

    if rom_params.rom_size != rom.len() {
        log::warn!("ROM size {} differs from the expected {}", rom.len(), rom_params.rom_size);
    }

    let nand = (8..=10).contains(&rom_params.save_mem_type);
    let chip_id = rom.make_chip_id(nand);

    let key1_seed = key1::seed_from_bios(arm7_bios, false);
    let key1_seed_dsi = key1::seed_from_bios(dsi_arm7_bios, true);

    let backup = CartBackup::new(rom_params.save_mem_type, header.nand_sram_start);
    let common = CartCommon::new(rom, chip_id, rom_params, key1_seed, key1_seed_dsi);

    let cart = if homebrew {
        Cart::Homebrew(CartHomebrew { common, sd: None })
    } else if nand {
        Cart::RetailNand(CartRetailNand { common, backup })
    } else {
        Cart::Retail(CartRetail { common, backup })
    };

    log::info!(
        "Inserted cart with game code {:?}, chip ID {chip_id:08X}",
        str::from_utf8(&header.game_code).unwrap_or("????")
    );

    Ok(cart)
}

/// The cartridge bus state machine behind the SPICNT/ROMCNT/ROMDATA/SPIDATA
/// registers.
#[derive(Debug)]
pub struct CartEngine {
    spi_cnt: u16,
    rom_cnt: u32,

    spi_data: u8,
    spi_data_pos: u32,
    spi_hold: bool,

    rom_command: [u8; 8],
    rom_data: u32,

    transfer_data: Box<[u8; TRANSFER_DATA_LEN]>,
    transfer_pos: u32,
    transfer_len: u32,
    transfer_dir: TransferDirection,
    transfer_cmd: [u8; 8],

    key2: Key2,
    rom_seed0: u64,
    rom_seed1: u64,

    // Which CPU currently owns the slot (NDS EXMEMCNT bit 11)
    owner: CpuId,
    dsi_console: bool,

    dma_request: bool,

    cart: Option<Cart>,
}

impl CartEngine {
    #[must_use]
    pub fn new(dsi_console: bool) -> Self {
        Self {
            spi_cnt: 0,
            rom_cnt: 0,
            spi_data: 0,
            spi_data_pos: 0,
            spi_hold: false,
            rom_command: [0; 8],
            rom_data: 0,
            transfer_data: vec![0; TRANSFER_DATA_LEN].try_into().unwrap(),
            transfer_pos: 0,
            transfer_len: 0,
            transfer_dir: TransferDirection::CartToHost,
            transfer_cmd: [0; 8],
            key2: Key2::new(),
            rom_seed0: 0,
            rom_seed1: 0,
            owner: CpuId::Arm9,
            dsi_console,
            dma_request: false,
            cart: None,
        }
    }

    pub fn reset(&mut self) {
        self.spi_cnt = 0;
        self.rom_cnt = 0;

        self.spi_data = 0;
        self.spi_data_pos = 0;
        self.spi_hold = false;

        self.rom_command = [0; 8];
        self.rom_data = 0;

        self.key2 = Key2::new();

        self.transfer_data.fill(0);
        self.transfer_pos = 0;
        self.transfer_len = 0;
        self.transfer_dir = TransferDirection::CartToHost;
        self.transfer_cmd = [0; 8];
        self.transfer_cmd[0] = 0xFF;

        if let Some(cart) = &mut self.cart {
            cart.reset();
        }
    }

    /// Inserts a cart, re-encrypting a decrypted secure area so the BIOS sees
    /// the on-cart shape. Ejects any previous cart first.
    pub fn insert_rom(&mut self, mut cart: Cart, irq: &mut Interrupts) {
        if self.cart.is_some() {
            self.eject_cart(irq);
        }

        cart.reset();

        let header = *cart.header();
        if (0x4000..0x8000).contains(&header.arm9_rom_offset) {
            let seed = cart.common().key1_seed.clone();
            cart.rom_mut().encrypt_secure_area(&seed);
        }

        self.cart = Some(cart);
    }

    /// Removes the cart; the slot raises the game-card IRQ on both CPUs.
    pub fn eject_cart(&mut self, irq: &mut Interrupts) {
        if self.cart.is_none() {
            return;
        }

        irq.set_irq(CpuId::Arm9, IrqSource::CartIreqMc);
        irq.set_irq(CpuId::Arm7, IrqSource::CartIreqMc);

        self.cart = None;
    }

    #[must_use]
    pub fn cart(&self) -> Option<&Cart> {
        self.cart.as_ref()
    }

    pub fn cart_mut(&mut self) -> Option<&mut Cart> {
        self.cart.as_mut()
    }

    pub fn set_owner(&mut self, owner: CpuId) {
        self.owner = owner;
    }

    /// Loads the ROMSEED register values KEY2 is re-seeded from.
    pub fn set_rom_seeds(&mut self, seed0: u64, seed1: u64) {
        self.rom_seed0 = seed0;
        self.rom_seed1 = seed1;
    }

    /// True once after each data word becomes ready; the DMA controller polls
    /// this to run cart-triggered transfers.
    pub fn take_dma_request(&mut self) -> bool {
        std::mem::take(&mut self.dma_request)
    }

    #[must_use]
    pub fn read_rom_cnt(&self) -> u32 {
        self.rom_cnt
    }

    #[must_use]
    pub fn read_spi_cnt(&self) -> u16 {
        self.spi_cnt
    }

    pub fn write_rom_command(&mut self, command: [u8; 8]) {
        self.rom_command = command;
    }

    #[must_use]
    pub fn rom_command(&self) -> [u8; 8] {
        self.rom_command
    }

    pub fn write_rom_cnt(
        &mut self,
        val: u32,
        now: u64,
        scheduler: &mut Scheduler,
        save: &mut dyn NdsSaveWriter,
    ) {
        // Transfers only start when bit 31 goes from 0 to 1
        let xfer_start = (val & !self.rom_cnt) & (1 << 31) != 0;
        self.rom_cnt = (val & 0xFF7F_7FFF) | (self.rom_cnt & 0x2080_0000);

        if val.bit(15) {
            self.key2.seed(self.rom_seed0, self.rom_seed1);
        }

        if !self.spi_cnt.bit(15) || self.spi_cnt.bit(13) || !xfer_start {
            return;
        }

        let datasize = match (self.rom_cnt >> 24) & 0x7 {
            7 => 4,
            0 => 0,
            n => 0x100 << n,
        };

        self.transfer_pos = 0;
        self.transfer_len = datasize;
        self.transfer_cmd = self.rom_command;
        self.transfer_data[..datasize as usize].fill(0xFF);

        // Default is read; commands that write flip this
        self.transfer_dir = TransferDirection::CartToHost;
        if let Some(cart) = &mut self.cart {
            self.transfer_dir =
                cart.command_start(self.transfer_cmd, &mut self.transfer_data[..datasize as usize], save);
        }

        if datasize > 0 && ((self.rom_cnt >> 30) & 1) != self.transfer_dir as u32 {
            log::warn!(
                "!! BAD TRANSFER DIRECTION FOR CMD {:02X}, DIR={:?}, ROMCNT={:08X}",
                self.transfer_cmd[0],
                self.transfer_dir,
                self.rom_cnt
            );
        }

        self.rom_cnt &= !(1 << 23);

        // The bus is 8 bits wide: 8 cycles to clock a command out, 4 to clock
        // a data word in. Delay fields only apply to reads.
        let xfer_cycle: u64 = if self.rom_cnt.bit(27) { 8 } else { 5 };
        let mut cmd_delay: u64 = 8;
        if !self.rom_cnt.bit(30) {
            cmd_delay += u64::from(self.rom_cnt & 0x1FFF);
            if datasize != 0 {
                cmd_delay += u64::from((self.rom_cnt >> 16) & 0x3F);
            }
        }

        if datasize == 0 {
            scheduler.insert_or_update(SchedulerEvent::RomEndTransfer, now + xfer_cycle * cmd_delay);
        } else {
            scheduler
                .insert_or_update(SchedulerEvent::RomPrepareData, now + xfer_cycle * (cmd_delay + 4));
        }
    }

    /// Reads ROMDATA; each read hands the word to the CPU and clocks the next
    /// one in (or ends the transfer once the payload is exhausted).
    pub fn read_rom_data(&mut self, now: u64, scheduler: &mut Scheduler) -> u32 {
        if self.rom_cnt.bit(30) {
            return 0;
        }

        if self.rom_cnt.bit(23) {
            self.advance_rom_transfer(now, scheduler);
        }

        self.rom_data
    }

    /// Writes ROMDATA during a host-to-cart transfer.
    pub fn write_rom_data(&mut self, val: u32, now: u64, scheduler: &mut Scheduler) {
        if !self.rom_cnt.bit(30) {
            return;
        }

        self.rom_data = val;

        if self.rom_cnt.bit(23) {
            if self.transfer_dir == TransferDirection::HostToCart {
                if self.transfer_pos < self.transfer_len {
                    self.transfer_data[self.transfer_pos as usize..self.transfer_pos as usize + 4]
                        .copy_from_slice(&self.rom_data.to_le_bytes());
                }
                self.transfer_pos += 4;
            }

            self.advance_rom_transfer(now, scheduler);
        }
    }

    fn advance_rom_transfer(&mut self, now: u64, scheduler: &mut Scheduler) {
        self.rom_cnt &= !(1 << 23);

        if self.transfer_pos < self.transfer_len {
            let xfer_cycle: u64 = if self.rom_cnt.bit(27) { 8 } else { 5 };
            let mut delay: u64 = 4;
            if !self.rom_cnt.bit(30) && self.transfer_pos & 0x1FF == 0 {
                // extra gap cycles at each 512-byte page
                delay += u64::from((self.rom_cnt >> 16) & 0x3F);
            }

            scheduler.insert_or_update(SchedulerEvent::RomPrepareData, now + xfer_cycle * delay);
        } else {
            scheduler.insert_or_update(SchedulerEvent::RomEndTransfer, now);
        }
    }

    fn rom_prepare_data(&mut self) {
        if self.transfer_dir == TransferDirection::CartToHost {
            self.rom_data = if self.transfer_pos >= self.transfer_len {
                0
            } else {
                let pos = self.transfer_pos as usize;
                u32::from_le_bytes(self.transfer_data[pos..pos + 4].try_into().unwrap())
            };
            self.transfer_pos += 4;
        }

        self.rom_cnt |= 1 << 23;
        self.dma_request = true;
    }

    fn rom_end_transfer(&mut self, irq: &mut Interrupts) {
        self.rom_cnt &= !(1 << 31);

        if self.spi_cnt.bit(14) {
            irq.set_irq(self.owner, IrqSource::CartXferDone);
        }

        if let Some(cart) = &mut self.cart {
            cart.command_finish(self.transfer_cmd, &self.transfer_data[..self.transfer_len as usize]);
        }
    }

    pub fn write_spi_cnt(&mut self, val: u16) {
        if self.spi_cnt & 0x2040 == 0x2040 && val & 0x2000 == 0 {
            // disabling the SPI bus force-releases the hold
            self.spi_hold = false;
        }

        self.spi_cnt = (self.spi_cnt & 0x0080) | (val & 0xE043);

        // The transfer keeps running to completion even if bit 13 or 15 are
        // cleared mid-flight; only the speed change takes effect immediately
        if self.spi_cnt.bit(7) {
            log::debug!("!! CHANGING AUXSPICNT DURING TRANSFER: {val:04X}");
        }
    }

    #[must_use]
    pub fn read_spi_data(&self) -> u8 {
        if !self.spi_cnt.bit(15) || !self.spi_cnt.bit(13) || self.spi_cnt.bit(7) {
            return 0;
        }

        self.spi_data
    }

    pub fn write_spi_data(
        &mut self,
        val: u8,
        now: u64,
        scheduler: &mut Scheduler,
        save: &mut dyn NdsSaveWriter,
    ) {
        if !self.spi_cnt.bit(15) || !self.spi_cnt.bit(13) || self.spi_cnt.bit(7) {
            return;
        }

        self.spi_cnt |= 1 << 7;

        let hold = self.spi_cnt.bit(6);
        let mut is_last = false;
        if !hold {
            if self.spi_hold {
                self.spi_data_pos += 1;
            } else {
                self.spi_data_pos = 0;
            }
            is_last = true;
            self.spi_hold = false;
        } else if !self.spi_hold {
            self.spi_hold = true;
            self.spi_data_pos = 0;
        } else {
            self.spi_data_pos += 1;
        }

        self.spi_data = match &mut self.cart {
            Some(cart) => cart.spi_write(val, self.spi_data_pos, is_last, save),
            None => 0,
        };

        // SPI moves one bit per cycle: 8 cycles per byte at the configured rate
        let delay: u64 = 8 * (8 << (self.spi_cnt & 0x3));
        scheduler.insert_or_update(SchedulerEvent::RomSpiDone, now + delay);
    }

    pub fn handle_event(&mut self, event: SchedulerEvent, irq: &mut Interrupts) {
        match event {
            SchedulerEvent::RomPrepareData => self.rom_prepare_data(),
            SchedulerEvent::RomEndTransfer => self.rom_end_transfer(irq),
            SchedulerEvent::RomSpiDone => self.spi_cnt &= !(1 << 7),
        }
    }

    pub fn setup_direct_boot(&mut self) {
        let dsi_console = self.dsi_console;
        if let Some(cart) = &mut self.cart {
            cart.setup_direct_boot(dsi_console);
        }
    }

    pub fn save_state(&mut self, file: &mut SavestateWriter<'_>) {
        file.section(*b"NDSC");

        file.var_u16(self.spi_cnt);
        file.var_u32(self.rom_cnt);

        file.var_u8(self.spi_data);
        file.var_u32(self.spi_data_pos);
        file.bool32(self.spi_hold);

        file.var_array(&self.rom_command);
        file.var_u32(self.rom_data);

        file.var_array(&self.transfer_data[..]);
        file.var_u32(self.transfer_pos);
        file.var_u32(self.transfer_len);
        file.var_u32(self.transfer_dir as u32);
        file.var_array(&self.transfer_cmd);

        let (key2_x, key2_y) = self.key2.registers();
        file.var_u64(key2_x);
        file.var_u64(key2_y);

        // The cart's own state only makes sense against the same ROM; tag it
        // with the cart type and checksum so a mismatched load skips it
        let (cart_type, cart_checksum) = match &self.cart {
            Some(cart) => (cart.type_id(), cart.checksum()),
            None => (0, 0),
        };
        file.var_u32(cart_type);
        file.var_u32(cart_checksum);

        if let Some(cart) = &mut self.cart {
            cart.save_state(file);
        }
    }

    pub fn load_state(&mut self, file: &mut SavestateReader<'_>, save: &mut dyn NdsSaveWriter) {
        file.section(*b"NDSC");

        self.spi_cnt = file.var_u16();
        self.rom_cnt = file.var_u32();

        self.spi_data = file.var_u8();
        self.spi_data_pos = file.var_u32();
        self.spi_hold = file.bool32();

        file.var_array(&mut self.rom_command);
        self.rom_data = file.var_u32();

        file.var_array(&mut self.transfer_data[..]);
        self.transfer_pos = file.var_u32();
        self.transfer_len = file.var_u32();
        self.transfer_dir = if file.var_u32() == 1 {
            TransferDirection::HostToCart
        } else {
            TransferDirection::CartToHost
        };
        file.var_array(&mut self.transfer_cmd);

        let key2_x = file.var_u64();
        let key2_y = file.var_u64();
        self.key2.set_registers(key2_x, key2_y);

        let saved_type = file.var_u32();
        let saved_checksum = file.var_u32();

        let (cart_type, cart_checksum) = match &self.cart {
            Some(cart) => (cart.type_id(), cart.checksum()),
            None => (0, 0),
        };

        if saved_type != cart_type || saved_checksum != cart_checksum {
            log::warn!(
                "savestate cart mismatch (type {saved_type} vs {cart_type}); skipping cart state"
            );
            return;
        }

        if let Some(cart) = &mut self.cart {
            cart.load_state(file, save);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cartridge::backup::NullSaveWriter;
    use nds_common::savestate::Savestate;
    use test_log::test;

    fn test_rom_image(game_code: &[u8; 4], len: usize) -> Vec<u8> {
        let mut rom = vec![0; len];
        for (i, byte) in rom.iter_mut().enumerate() {
            *byte = (i % 247) as u8;
        }
        rom[0x0C..0x10].copy_from_slice(game_code);
        rom[0x12] = 0;
        rom[0x20..0x24].copy_from_slice(&0x4000u32.to_le_bytes());
        rom[0x2C..0x30].copy_from_slice(&0x10000u32.to_le_bytes());
        rom[0x30..0x34].copy_from_slice(&0x20000u32.to_le_bytes());
        rom[0x3C..0x40].copy_from_slice(&0x8000u32.to_le_bytes());
        rom
    }

    fn test_cart(game_code: &[u8; 4]) -> Cart {
        parse_rom(&test_rom_image(game_code, 0x200000), None, None).unwrap()
    }

    fn engine_with_cart(game_code: &[u8; 4]) -> (CartEngine, Interrupts, Scheduler) {
        let mut engine = CartEngine::new(false);
        engine.reset();
        let mut irq = Interrupts::new();
        engine.insert_rom(test_cart(game_code), &mut irq);
        engine.setup_direct_boot();
        (engine, irq, Scheduler::new())
    }

    // Builds the encrypted form of a KEY1 command, the way boot code does
    // before putting it on the bus
    fn key1_encrypt_cmd(key1: &Key1, plain: [u8; 8]) -> [u8; 8] {
        let p0 = u32::from_le_bytes(plain[0..4].try_into().unwrap());
        let p1 = u32::from_le_bytes(plain[4..8].try_into().unwrap());

        let mut pair = [p1.swap_bytes(), p0.swap_bytes()];
        key1.encrypt(&mut pair);

        let mut out = [0; 8];
        out[0..4].copy_from_slice(&pair[1].swap_bytes().to_le_bytes());
        out[4..8].copy_from_slice(&pair[0].swap_bytes().to_le_bytes());
        out
    }

    #[test]
    fn parse_rejects_empty_rom() {
        assert!(matches!(parse_rom(&[], None, None), Err(CartLoadError::Empty)));
    }

    #[test]
    fn parse_picks_backup_family_from_rom_list() {
        // AWRE is listed with a tiny EEPROM
        let cart = test_cart(b"AWRE");
        let Cart::Retail(retail) = &cart else { panic!("expected retail cart") };
        assert_eq!(retail.backup.sram().unwrap().len(), 512);

        // Unlisted games default to 8 KiB EEPROM
        let cart = test_cart(b"TSTE");
        let Cart::Retail(retail) = &cart else { panic!("expected retail cart") };
        assert_eq!(retail.backup.sram().unwrap().len(), 8192);

        // UORE is NAND-backed
        let cart = test_cart(b"UORE");
        assert!(matches!(cart, Cart::RetailNand(_)));
        assert_ne!(cart.chip_id() & 0x0800_0000, 0);
    }

    #[test]
    fn plaintext_header_command_repeats_first_4k() {
        let mut cart = test_cart(b"TSTE");
        let mut save = NullSaveWriter;

        let mut data = vec![0xFF; 0x2000];
        let dir = cart.command_start([0; 8], &mut data, &mut save);
        assert_eq!(dir, TransferDirection::CartToHost);

        assert_eq!(&data[..0x1000], &cart.rom().bytes()[..0x1000]);
        assert_eq!(&data[0x1000..0x2000], &data[..0x1000].to_vec()[..]);
    }

    #[test]
    fn plaintext_id_command_replicates_chip_id() {
        let mut cart = test_cart(b"TSTE");
        let mut save = NullSaveWriter;
        let chip_id = cart.chip_id();

        let mut data = vec![0; 8];
        cart.command_start([0x90, 0, 0, 0, 0, 0, 0, 0], &mut data, &mut save);

        assert_eq!(&data[0..4], &chip_id.to_le_bytes());
        assert_eq!(&data[4..8], &chip_id.to_le_bytes());
    }

    #[test]
    fn key1_handshake_reaches_key2_mode() {
        let mut cart = test_cart(b"TSTE");
        let mut save = NullSaveWriter;

        // 3C switches the cart into KEY1 command mode
        cart.command_start([0x3C, 0, 0, 0, 0, 0, 0, 0], &mut [], &mut save);
        assert_eq!(cart.common().cmd_enc_mode, 1);

        // The host encrypts its commands with the same schedule the cart
        // derived from its idcode
        let seed = key1::seed_from_bios(None, false);
        let key1 = Key1::new(&seed, cart.header().game_code_u32(), 2, 2);

        // 4x enables KEY2 on the data path
        let cmd = key1_encrypt_cmd(&key1, [0x40, 0, 0, 0, 0, 0, 0, 0]);
        cart.command_start(cmd, &mut [], &mut save);
        assert_eq!(cart.common().data_enc_mode, 2);

        // 2x reads 4 KiB of the secure area
        let cmd = key1_encrypt_cmd(&key1, [0x20, 0, 0x40, 0, 0, 0, 0, 0]);
        let mut data = vec![0; 0x1000];
        cart.command_start(cmd, &mut data, &mut save);
        assert_eq!(&data[..], &cart.rom().bytes()[0x4000..0x5000]);

        // Ax switches to KEY2 command mode
        let cmd = key1_encrypt_cmd(&key1, [0xA0, 0, 0, 0, 0, 0, 0, 0]);
        cart.command_start(cmd, &mut [], &mut save);
        assert_eq!(cart.common().cmd_enc_mode, 2);
    }

    #[test]
    fn key1_chip_id_command() {
        let mut cart = test_cart(b"TSTE");
        let mut save = NullSaveWriter;
        let chip_id = cart.chip_id();

        cart.command_start([0x3C, 0, 0, 0, 0, 0, 0, 0], &mut [], &mut save);

        let seed = key1::seed_from_bios(None, false);
        let key1 = Key1::new(&seed, cart.header().game_code_u32(), 2, 2);

        let cmd = key1_encrypt_cmd(&key1, [0x10, 0, 0, 0, 0, 0, 0, 0]);
        let mut data = vec![0; 4];
        cart.command_start(cmd, &mut data, &mut save);
        assert_eq!(&data[..], &chip_id.to_le_bytes());
    }

    #[test]
    fn b7_read_through_direct_boot() {
        let mut cart = test_cart(b"TSTE");
        cart.setup_direct_boot(false);
        let mut save = NullSaveWriter;

        let mut data = vec![0xEE; 8];
        let dir = cart.command_start([0xB7, 0, 0, 0, 0, 0, 0, 0], &mut data, &mut save);
        assert_eq!(dir, TransferDirection::CartToHost);
        assert_eq!(&data[..], &cart.rom().bytes()[0x8000..0x8008]);
    }

    #[test]
    fn transfer_schedule_timing() {
        let (mut engine, mut irq, mut scheduler) = engine_with_cart(b"TSTE");
        let mut save = NullSaveWriter;

        engine.write_spi_cnt(1 << 15);
        engine.write_rom_command([0xB7, 0, 0, 0x80, 0, 0, 0, 0]);
        // datasize code 1 => 512 bytes, fast clock, no extra delay cycles
        engine.write_rom_cnt((1 << 31) | (1 << 24), 0, &mut scheduler, &mut save);

        let mut word_cycles = vec![];
        let mut last_event = None;
        while let Some((event, cycles)) = scheduler.pop(u64::MAX - 1) {
            engine.handle_event(event, &mut irq);
            last_event = Some(event);

            if event == SchedulerEvent::RomPrepareData {
                word_cycles.push(cycles);
                assert!(engine.read_rom_cnt().bit(23));
                assert!(engine.take_dma_request());
                let _ = engine.read_rom_data(cycles, &mut scheduler);
            }
        }

        assert_eq!(word_cycles.len(), 128);
        // First word at 5 * (8 + 4), then one word every 5 * 4 cycles
        assert_eq!(word_cycles[0], 60);
        assert!(word_cycles.windows(2).all(|pair| pair[1] - pair[0] == 20));

        assert_eq!(last_event, Some(SchedulerEvent::RomEndTransfer));
        assert!(!engine.read_rom_cnt().bit(31));
        assert!(!engine.read_rom_cnt().bit(23));
    }

    #[test]
    fn zero_length_transfer_ends_without_data() {
        let (mut engine, mut irq, mut scheduler) = engine_with_cart(b"TSTE");
        let mut save = NullSaveWriter;

        engine.write_spi_cnt((1 << 15) | (1 << 14));
        engine.write_rom_command([0x9F, 0, 0, 0, 0, 0, 0, 0]);
        engine.write_rom_cnt(1 << 31, 0, &mut scheduler, &mut save);

        let (event, cycles) = scheduler.pop(u64::MAX - 1).unwrap();
        assert_eq!(event, SchedulerEvent::RomEndTransfer);
        assert_eq!(cycles, 5 * 8);

        engine.handle_event(event, &mut irq);
        assert!(!engine.read_rom_cnt().bit(31));
        assert!(irq.pending(CpuId::Arm9, IrqSource::CartXferDone));
    }

    #[test]
    fn transfer_reads_back_rom_words() {
        let (mut engine, mut irq, mut scheduler) = engine_with_cart(b"TSTE");
        let mut save = NullSaveWriter;

        engine.write_spi_cnt(1 << 15);
        engine.write_rom_command([0xB7, 0x00, 0x00, 0x80, 0x00, 0, 0, 0]);
        // datasize code 7 => one 4-byte word
        engine.write_rom_cnt((1 << 31) | (7 << 24), 0, &mut scheduler, &mut save);

        let (event, cycles) = scheduler.pop(u64::MAX - 1).unwrap();
        assert_eq!(event, SchedulerEvent::RomPrepareData);
        engine.handle_event(event, &mut irq);

        let word = engine.read_rom_data(cycles, &mut scheduler);
        let expected = u32::from_le_bytes(
            engine.cart().unwrap().rom().bytes()[0x8000..0x8004].try_into().unwrap(),
        );
        assert_eq!(word, expected);
    }

    #[test]
    fn direction_mismatch_completes_without_corruption() {
        let (mut engine, mut irq, mut scheduler) = engine_with_cart(b"AWRE");
        let mut save = NullSaveWriter;

        let sram_before = engine.cart().unwrap().save_memory().unwrap().to_vec();

        engine.write_spi_cnt(1 << 15);
        engine.write_rom_command([0x9F, 0, 0, 0, 0, 0, 0, 0]);
        // bit 30 claims a write, but 9F produces data: mismatch is logged and
        // the transfer still runs to completion
        engine.write_rom_cnt((1 << 31) | (1 << 30) | (7 << 24), 0, &mut scheduler, &mut save);

        while let Some((event, _)) = scheduler.pop(u64::MAX - 1) {
            engine.handle_event(event, &mut irq);
            if event == SchedulerEvent::RomPrepareData {
                engine.write_rom_data(0xDEADBEEF, 0, &mut scheduler);
            }
        }

        assert!(!engine.read_rom_cnt().bit(31));
        assert_eq!(engine.cart().unwrap().save_memory().unwrap(), &sram_before[..]);
    }

    #[test]
    fn spi_backup_write_through_engine() {
        let (mut engine, mut irq, mut scheduler) = engine_with_cart(b"AWRE");
        let mut save = NullSaveWriter;

        let enable = (1 << 15) | (1 << 13);
        let hold = 1 << 6;

        let mut pump = |engine: &mut CartEngine, scheduler: &mut Scheduler, irq: &mut Interrupts| {
            while let Some((event, _)) = scheduler.pop(u64::MAX - 1) {
                engine.handle_event(event, irq);
            }
        };

        // WREN as a single-byte transaction
        engine.write_spi_cnt(enable);
        engine.write_spi_data(0x06, 0, &mut scheduler, &mut save);
        pump(&mut engine, &mut scheduler, &mut irq);

        // Held transaction: command, address, then release hold on the data byte
        engine.write_spi_cnt(enable | hold);
        engine.write_spi_data(0x02, 0, &mut scheduler, &mut save);
        pump(&mut engine, &mut scheduler, &mut irq);
        engine.write_spi_data(0x10, 0, &mut scheduler, &mut save);
        pump(&mut engine, &mut scheduler, &mut irq);
        engine.write_spi_cnt(enable);
        engine.write_spi_data(0xAA, 0, &mut scheduler, &mut save);
        pump(&mut engine, &mut scheduler, &mut irq);

        assert_eq!(engine.cart().unwrap().save_memory().unwrap()[0x10], 0xAA);
    }

    #[test]
    fn spi_busy_blocks_data_access() {
        let (mut engine, _irq, mut scheduler) = engine_with_cart(b"AWRE");
        let mut save = NullSaveWriter;

        engine.write_spi_cnt((1 << 15) | (1 << 13));
        engine.write_spi_data(0x06, 0, &mut scheduler, &mut save);

        // Busy until the scheduled SPI-done event fires
        assert!(engine.read_spi_cnt().bit(7));
        assert_eq!(engine.read_spi_data(), 0);

        let (event, cycles) = scheduler.pop(u64::MAX - 1).unwrap();
        assert_eq!(event, SchedulerEvent::RomSpiDone);
        // 8 cycles per bit at the fastest clock setting
        assert_eq!(cycles, 64);
    }

    #[test]
    fn eject_raises_game_card_irq_on_both_cpus() {
        let (mut engine, mut irq, _scheduler) = engine_with_cart(b"TSTE");

        engine.eject_cart(&mut irq);

        assert!(irq.pending(CpuId::Arm9, IrqSource::CartIreqMc));
        assert!(irq.pending(CpuId::Arm7, IrqSource::CartIreqMc));
        assert!(engine.cart().is_none());
    }

    #[test]
    fn savestate_round_trip_with_matching_cart() {
        let (mut engine, _irq, mut scheduler) = engine_with_cart(b"TSTE");
        let mut save = NullSaveWriter;

        engine.write_spi_cnt(1 << 15);
        engine.write_rom_command([0xB7, 0, 0, 0x80, 0, 0, 0, 0]);
        engine.write_rom_cnt((1 << 31) | (7 << 24), 0, &mut scheduler, &mut save);

        let mut state = Savestate::new();
        let mut writer = nds_common::savestate::SavestateWriter::new(&mut state);
        engine.save_state(&mut writer);
        writer.finish();
        assert!(!writer.error());

        let (mut restored, _irq2, _) = engine_with_cart(b"TSTE");
        let mut reader = nds_common::savestate::SavestateReader::new(&state);
        restored.load_state(&mut reader, &mut save);
        assert!(!reader.error());

        assert_eq!(restored.read_rom_cnt(), engine.read_rom_cnt());
        assert_eq!(restored.read_spi_cnt(), engine.read_spi_cnt());
        assert_eq!(restored.rom_command(), engine.rom_command());
    }

    #[test]
    fn savestate_cart_mismatch_skips_cart_state() {
        let (mut engine, _irq, _scheduler) = engine_with_cart(b"AWRE");
        let mut save = NullSaveWriter;

        // Dirty the backup so a (wrongly) loaded cart section would differ
        engine.cart_mut().unwrap().load_save(&[0x12; 16], &mut save);

        let mut state = Savestate::new();
        let mut writer = nds_common::savestate::SavestateWriter::new(&mut state);
        engine.save_state(&mut writer);
        writer.finish();

        // A different ROM gives a different checksum; its backup must be
        // left alone by the load
        let (mut other, _irq2, _) = engine_with_cart(b"ANDE");
        let untouched = other.cart().unwrap().save_memory().unwrap().to_vec();

        let mut reader = nds_common::savestate::SavestateReader::new(&state);
        other.load_state(&mut reader, &mut save);

        assert_eq!(other.cart().unwrap().save_memory().unwrap(), &untouched[..]);
    }
}
