//! Public interface of the emulator core fragment.

pub use crate::cartridge::backup::{
    CartBackup, Eeprom, EepromTiny, Flash, NandSave, NdsSaveWriter, NullSaveWriter,
};
pub use crate::cartridge::key1::{seed_from_bios, Key1, KEY_SEED_LEN};
pub use crate::cartridge::key2::Key2;
pub use crate::cartridge::rom::{CartHeader, CartRom};
pub use crate::cartridge::romlist::{lookup as rom_list_lookup, RomListEntry};
pub use crate::cartridge::{
    parse_rom, BlockDevice, Cart, CartEngine, CartLoadError, TransferDirection,
};
pub use crate::firmware::{ConsoleType, Firmware};
pub use crate::interrupts::{CpuId, Interrupts, IrqSource};
pub use crate::jit::block::{BlockEntry, BlockHandle, CodeRange, Fingerprint};
pub use crate::jit::dispatcher::{dispatch, CompileError, Compiler, JitCpu, TranslatedBlock};
pub use crate::jit::region::{
    code_region_for, localise, pseudo_physical, split_pseudo_physical, MemRegion,
};
pub use crate::jit::{ExecutableRegion, JitCache, JitConfig};
pub use crate::scheduler::{Scheduler, SchedulerEvent};
pub use crate::sdmmc::{NandStorage, SdCardStorage, SdHost};

use nds_common::savestate::{SavestateReader, SavestateWriter, Snapshot};

/// Cartridge slot with its own timeline: the engine, the event queue, and
/// the IRQ latch wired together behind the MMIO surface.
#[derive(Debug)]
pub struct CartSlot {
    engine: CartEngine,
    scheduler: Scheduler,
    interrupts: Interrupts,
    cycles: u64,
}

impl CartSlot {
    #[must_use]
    pub fn new(dsi_console: bool) -> Self {
        Self {
            engine: CartEngine::new(dsi_console),
            scheduler: Scheduler::new(),
            interrupts: Interrupts::new(),
            cycles: 0,
        }
    }

    pub fn reset(&mut self) {
        self.engine.reset();
        self.scheduler = Scheduler::new();
        self.interrupts = Interrupts::new();
        self.cycles = 0;
    }

    pub fn insert_rom(&mut self, cart: Cart) {
        self.engine.insert_rom(cart, &mut self.interrupts);
    }

    pub fn eject_cart(&mut self) {
        self.engine.eject_cart(&mut self.interrupts);
    }

    #[must_use]
    pub fn engine(&self) -> &CartEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut CartEngine {
        &mut self.engine
    }

    #[must_use]
    pub fn interrupts(&self) -> &Interrupts {
        &self.interrupts
    }

    pub fn interrupts_mut(&mut self) -> &mut Interrupts {
        &mut self.interrupts
    }

    #[must_use]
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Runs the slot's timeline forward, firing due events in order.
    pub fn run(&mut self, cycles: u64) {
        self.cycles += cycles;
        while let Some((event, _)) = self.scheduler.pop(self.cycles) {
            self.engine.handle_event(event, &mut self.interrupts);
        }
    }

    pub fn write_rom_cnt(&mut self, val: u32, save: &mut dyn NdsSaveWriter) {
        self.engine.write_rom_cnt(val, self.cycles, &mut self.scheduler, save);
    }

    #[must_use]
    pub fn read_rom_cnt(&self) -> u32 {
        self.engine.read_rom_cnt()
    }

    pub fn write_rom_command(&mut self, command: [u8; 8]) {
        self.engine.write_rom_command(command);
    }

    pub fn read_rom_data(&mut self) -> u32 {
        self.engine.read_rom_data(self.cycles, &mut self.scheduler)
    }

    pub fn write_rom_data(&mut self, val: u32) {
        self.engine.write_rom_data(val, self.cycles, &mut self.scheduler);
    }

    pub fn write_spi_cnt(&mut self, val: u16) {
        self.engine.write_spi_cnt(val);
    }

    #[must_use]
    pub fn read_spi_cnt(&self) -> u16 {
        self.engine.read_spi_cnt()
    }

    pub fn write_spi_data(&mut self, val: u8, save: &mut dyn NdsSaveWriter) {
        self.engine.write_spi_data(val, self.cycles, &mut self.scheduler, save);
    }

    #[must_use]
    pub fn read_spi_data(&self) -> u8 {
        self.engine.read_spi_data()
    }

    pub fn save_state(&mut self, file: &mut SavestateWriter<'_>) {
        file.section(*b"SLOT");
        file.var_u64(self.cycles);

        self.scheduler.save(file);
        self.interrupts.save(file);
        self.engine.save_state(file);
    }

    pub fn load_state(&mut self, file: &mut SavestateReader<'_>, save: &mut dyn NdsSaveWriter) {
        file.section(*b"SLOT");
        self.cycles = file.var_u64();

        self.scheduler.load(file);
        self.interrupts.load(file);
        self.engine.load_state(file, save);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nds_common::savestate::Savestate;

    fn test_rom_image(game_code: &[u8; 4]) -> Vec<u8> {
        let mut rom = vec![0; 0x200000];
        for (i, byte) in rom.iter_mut().enumerate() {
            *byte = (i % 241) as u8;
        }
        rom[0x0C..0x10].copy_from_slice(game_code);
        rom[0x20..0x24].copy_from_slice(&0x4000u32.to_le_bytes());
        rom[0x2C..0x30].copy_from_slice(&0x10000u32.to_le_bytes());
        rom[0x30..0x34].copy_from_slice(&0x20000u32.to_le_bytes());
        rom[0x3C..0x40].copy_from_slice(&0x8000u32.to_le_bytes());
        rom
    }

    fn slot_with_cart() -> CartSlot {
        let mut slot = CartSlot::new(false);
        slot.insert_rom(parse_rom(&test_rom_image(b"TSTE"), None, None).unwrap());
        slot.engine_mut().setup_direct_boot();
        slot
    }

    #[test]
    fn full_transfer_through_the_slot() {
        let mut slot = slot_with_cart();
        let mut save = NullSaveWriter;
        let rom: Vec<u8> = slot.engine().cart().unwrap().rom().bytes().to_vec();

        slot.write_spi_cnt((1 << 15) | (1 << 14));
        slot.write_rom_command([0xB7, 0, 0, 0x80, 0, 0, 0, 0]);
        slot.write_rom_cnt((1 << 31) | (1 << 24), &mut save);

        let mut payload = vec![];
        while slot.read_rom_cnt() & (1 << 31) != 0 {
            slot.run(1);
            if slot.read_rom_cnt() & (1 << 23) != 0 {
                payload.extend_from_slice(&slot.read_rom_data().to_le_bytes());
            }
        }

        assert_eq!(payload.len(), 0x200);
        assert_eq!(&payload[..], &rom[0x8000..0x8200]);
        assert!(slot.interrupts().pending(CpuId::Arm9, IrqSource::CartXferDone));
    }

    #[test]
    fn slot_savestate_round_trip() {
        let mut slot = slot_with_cart();
        let mut save = NullSaveWriter;

        slot.write_spi_cnt(1 << 15);
        slot.write_rom_command([0xB7, 0, 0, 0x80, 0, 0, 0, 0]);
        slot.write_rom_cnt((1 << 31) | (7 << 24), &mut save);
        slot.run(100);

        let mut state = Savestate::new();
        let mut writer = SavestateWriter::new(&mut state);
        slot.save_state(&mut writer);
        writer.finish();
        assert!(!writer.error());

        let mut restored = slot_with_cart();
        let mut reader = SavestateReader::new(&state);
        restored.load_state(&mut reader, &mut save);
        assert!(!reader.error());

        assert_eq!(restored.cycles(), slot.cycles());
        assert_eq!(restored.read_rom_cnt(), slot.read_rom_cnt());
    }
}
