//! Cartridge-facing IRQ lines for the two CPUs.

use nds_common::savestate::{SavestateReader, SavestateWriter, Snapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuId {
    Arm9 = 0,
    Arm7 = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqSource {
    CartXferDone = 19,
    CartIreqMc = 20,
}

impl IrqSource {
    fn bit_mask(self) -> u32 {
        1 << (self as u8)
    }
}

/// Pending-IRQ latch, one flag word per CPU. The full interrupt controller
/// lives with the CPU cores; the cartridge subsystem only ever sets bits.
#[derive(Debug, Clone, Default)]
pub struct Interrupts {
    pending: [u32; 2],
}

impl Interrupts {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_irq(&mut self, cpu: CpuId, source: IrqSource) {
        log::trace!("IRQ {source:?} raised for {cpu:?}");
        self.pending[cpu as usize] |= source.bit_mask();
    }

    #[must_use]
    pub fn pending(&self, cpu: CpuId, source: IrqSource) -> bool {
        self.pending[cpu as usize] & source.bit_mask() != 0
    }

    pub fn acknowledge(&mut self, cpu: CpuId, source: IrqSource) {
        self.pending[cpu as usize] &= !source.bit_mask();
    }
}

impl Snapshot for Interrupts {
    fn save(&mut self, file: &mut SavestateWriter<'_>) {
        file.section(*b"IRQC");

        file.var_u32(self.pending[0]);
        file.var_u32(self.pending[1]);
    }

    fn load(&mut self, file: &mut SavestateReader<'_>) {
        file.section(*b"IRQC");

        self.pending[0] = file.var_u32();
        self.pending[1] = file.var_u32();
    }
}
