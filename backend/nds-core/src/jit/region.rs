//! Code-bearing memory regions and guest-address localisation.
//!
//! Every executable region has a stable small-integer id and a power-of-two
//! size. `localise` turns a guest virtual address into a *pseudo-physical
//! address*: the region id in bits 27..31 and the offset into the region's
//! backing memory in bits 0..26. The JIT indexes all of its per-region tables
//! with that offset, so `localise` must stay total (wrapping modulo the
//! region size) and stable for the lifetime of the process.

use crate::interrupts::CpuId;

pub const REGION_COUNT: usize = 18;

pub const PSEUDO_OFFSET_MASK: u32 = 0x7FF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemRegion {
    Itcm = 1,
    Arm9Bios = 3,
    MainRam = 4,
    SharedWram = 5,
    Vram = 7,
    Arm7Bios = 8,
    Arm7Wram = 9,
    Arm7Wvram = 12,
    DsiArm9Bios = 13,
    DsiArm7Bios = 14,
    NwramA = 15,
    NwramB = 16,
    NwramC = 17,
}

impl MemRegion {
    pub const ALL: [Self; 13] = [
        Self::Itcm,
        Self::Arm9Bios,
        Self::MainRam,
        Self::SharedWram,
        Self::Vram,
        Self::Arm7Bios,
        Self::Arm7Wram,
        Self::Arm7Wvram,
        Self::DsiArm9Bios,
        Self::DsiArm7Bios,
        Self::NwramA,
        Self::NwramB,
        Self::NwramC,
    ];

    #[must_use]
    pub fn id(self) -> u32 {
        self as u32
    }

    #[must_use]
    pub fn from_id(id: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|region| region.id() == id)
    }

    #[must_use]
    pub fn size(self) -> u32 {
        match self {
            Self::Itcm | Self::SharedWram => 0x8000,
            Self::Arm9Bios => 0x1000,
            Self::MainRam => 0x100_0000,
            Self::Vram => 0x10_0000,
            Self::Arm7Bios => 0x4000,
            Self::Arm7Wram | Self::DsiArm9Bios | Self::DsiArm7Bios => 0x1_0000,
            Self::Arm7Wvram | Self::NwramA | Self::NwramB | Self::NwramC => 0x4_0000,
        }
    }

    // Canonical guest base address of the region's window for the given CPU.
    // Mirrors within the window all collapse onto the same local offset via
    // the power-of-two mask.
    fn base(self, cpu: CpuId) -> u32 {
        match self {
            Self::Itcm => 0x0000_0000,
            Self::Arm9Bios | Self::DsiArm9Bios => 0xFFFF_0000,
            Self::MainRam => 0x0200_0000,
            Self::SharedWram | Self::NwramA | Self::NwramB | Self::NwramC => 0x0300_0000,
            Self::Vram => 0x0600_0000,
            Self::Arm7Bios | Self::DsiArm7Bios => 0x0000_0000,
            Self::Arm7Wram => {
                debug_assert_eq!(cpu, CpuId::Arm7);
                0x0380_0000
            }
            Self::Arm7Wvram => 0x0600_0000,
        }
    }
}

/// Packs a region id and local offset into a pseudo-physical address.
#[must_use]
pub fn pseudo_physical(region: MemRegion, local_offset: u32) -> u32 {
    debug_assert!(local_offset < region.size());
    (region.id() << 27) | local_offset
}

/// Splits a pseudo-physical address back into its region and local offset.
#[must_use]
pub fn split_pseudo_physical(addr: u32) -> Option<(MemRegion, u32)> {
    let region = MemRegion::from_id(addr >> 27)?;
    Some((region, addr & PSEUDO_OFFSET_MASK & (region.size() - 1)))
}

/// Localises a guest virtual address within a known region.
#[must_use]
pub fn localise(cpu: CpuId, region: MemRegion, addr: u32) -> u32 {
    let local = addr.wrapping_sub(region.base(cpu)) & (region.size() - 1);
    pseudo_physical(region, local)
}

/// The code-bearing region a CPU's program counter falls into, if any. DSi
/// BIOS and NWRAM mappings are dynamic; callers that bank those around use
/// the explicit-region entry points instead.
#[must_use]
pub fn code_region_for(cpu: CpuId, addr: u32) -> Option<MemRegion> {
    match cpu {
        CpuId::Arm9 => match addr {
            0x0000_0000..=0x01FF_FFFF => Some(MemRegion::Itcm),
            0x0200_0000..=0x02FF_FFFF => Some(MemRegion::MainRam),
            0x0300_0000..=0x03FF_FFFF => Some(MemRegion::SharedWram),
            0x0600_0000..=0x06FF_FFFF => Some(MemRegion::Vram),
            0xFFFF_0000..=0xFFFF_FFFF => Some(MemRegion::Arm9Bios),
            _ => None,
        },
        CpuId::Arm7 => match addr {
            0x0000_0000..=0x0000_3FFF => Some(MemRegion::Arm7Bios),
            0x0200_0000..=0x02FF_FFFF => Some(MemRegion::MainRam),
            0x0300_0000..=0x037F_FFFF => Some(MemRegion::SharedWram),
            0x0380_0000..=0x03FF_FFFF => Some(MemRegion::Arm7Wram),
            0x0600_0000..=0x06FF_FFFF => Some(MemRegion::Arm7Wvram),
            _ => None,
        },
    }
}

/// Guest base address of a region's window, for dispatcher setup.
#[must_use]
pub fn region_base(cpu: CpuId, region: MemRegion) -> u32 {
    region.base(cpu)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_are_powers_of_two() {
        for region in MemRegion::ALL {
            assert!(region.size().is_power_of_two(), "{region:?}");
            assert!((region.id() as usize) < REGION_COUNT);
        }
    }

    #[test]
    fn localise_wraps_modulo_region_size() {
        let a = localise(CpuId::Arm9, MemRegion::Itcm, 0x0000_0040);
        let b = localise(CpuId::Arm9, MemRegion::Itcm, 0x0000_8040);
        assert_eq!(a, b);
        assert_eq!(a, pseudo_physical(MemRegion::Itcm, 0x40));
    }

    #[test]
    fn localise_subtracts_window_base() {
        let p = localise(CpuId::Arm9, MemRegion::MainRam, 0x0200_1234);
        assert_eq!(split_pseudo_physical(p), Some((MemRegion::MainRam, 0x1234)));

        let p = localise(CpuId::Arm7, MemRegion::Arm7Wram, 0x0380_0010);
        assert_eq!(split_pseudo_physical(p), Some((MemRegion::Arm7Wram, 0x10)));
    }

    #[test]
    fn localise_is_stable() {
        for _ in 0..4 {
            assert_eq!(
                localise(CpuId::Arm7, MemRegion::MainRam, 0x02C0_0000),
                localise(CpuId::Arm7, MemRegion::MainRam, 0x02C0_0000)
            );
        }
    }

    #[test]
    fn pseudo_physical_round_trip() {
        for region in MemRegion::ALL {
            let p = pseudo_physical(region, region.size() - 2);
            assert_eq!(split_pseudo_physical(p), Some((region, region.size() - 2)));
        }
    }

    #[test]
    fn code_region_for_respects_cpu_maps() {
        assert_eq!(code_region_for(CpuId::Arm9, 0x0200_0000), Some(MemRegion::MainRam));
        assert_eq!(code_region_for(CpuId::Arm9, 0xFFFF_0123), Some(MemRegion::Arm9Bios));
        assert_eq!(code_region_for(CpuId::Arm7, 0x0000_1000), Some(MemRegion::Arm7Bios));
        assert_eq!(code_region_for(CpuId::Arm7, 0x0390_0000), Some(MemRegion::Arm7Wram));
        assert_eq!(code_region_for(CpuId::Arm9, 0x0800_0000), None);
    }
}
