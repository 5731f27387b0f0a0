//! The block cache of the ARM JIT: translated blocks keyed by
//! `(cpu, region, offset)` fingerprints, with store-side invalidation and a
//! retirement table that lets recently-dropped blocks come back without
//! retranslation.

pub mod block;
pub mod codemem;
pub mod dispatcher;
pub mod index;
pub mod region;

use crate::interrupts::CpuId;
use crate::jit::block::{BlockEntry, BlockHandle, CodeRange, Fingerprint, JitBlock};
use crate::jit::codemem::{CodeMemory, CodeWriteGuard, DEFAULT_ARENA_LEN};
use crate::jit::dispatcher::{CompileError, Compiler};
use crate::jit::index::{line_mask_in_page, pages_in_range, JitRegionIndex, LINE_LEN, PAGE_LEN};
use crate::jit::region::{
    code_region_for, localise, region_base, split_pseudo_physical, MemRegion, PSEUDO_OFFSET_MASK,
};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;

// Retired blocks kept around for re-linking; oldest entry is dropped when a
// new retirement would exceed this
const RESTORE_CANDIDATE_CAP: usize = 64;

#[derive(Debug, Clone)]
pub struct JitConfig {
    /// Maximum translated block length, in guest instructions.
    pub max_block_size: u32,
    pub literal_optimizations: bool,
    pub branch_optimizations: bool,
    /// Skips the store-side invalidation bitmap for stores the memory
    /// classifier proves can't hit code.
    pub fast_memory: bool,
    /// Literal-pool addresses that must never be inlined.
    pub invalid_literals: Vec<u32>,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            max_block_size: 32,
            literal_optimizations: false,
            branch_optimizations: false,
            fast_memory: false,
            invalid_literals: vec![],
        }
    }
}

/// The slice of guest address space a dispatcher may treat as one region,
/// resolving branches with fast-lookup loads alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutableRegion {
    pub region: MemRegion,
    pub start: u32,
    pub size: u32,
}

#[derive(Debug)]
pub struct JitCache {
    config: JitConfig,
    code_mem: CodeMemory,

    // Arena of blocks; handles stay stable for a block's whole life
    blocks: Vec<Option<JitBlock>>,
    free_handles: Vec<BlockHandle>,

    blocks_arm9: FxHashMap<u32, BlockHandle>,
    blocks_arm7: FxHashMap<u32, BlockHandle>,

    restore_candidates: FxHashMap<u32, BlockHandle>,
    restore_order: VecDeque<u32>,

    index: JitRegionIndex,
}

impl JitCache {
    /// # Panics
    ///
    /// Panics if the code arena cannot be mapped.
    #[must_use]
    pub fn new(config: JitConfig) -> Self {
        Self {
            config,
            code_mem: CodeMemory::new(DEFAULT_ARENA_LEN).expect("failed to map JIT code arena"),
            blocks: vec![],
            free_handles: vec![],
            blocks_arm9: FxHashMap::default(),
            blocks_arm7: FxHashMap::default(),
            restore_candidates: FxHashMap::default(),
            restore_order: VecDeque::new(),
            index: JitRegionIndex::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut JitConfig {
        &mut self.config
    }

    fn cpu_map(&self, cpu: CpuId) -> &FxHashMap<u32, BlockHandle> {
        match cpu {
            CpuId::Arm9 => &self.blocks_arm9,
            CpuId::Arm7 => &self.blocks_arm7,
        }
    }

    fn cpu_map_mut(&mut self, cpu: CpuId) -> &mut FxHashMap<u32, BlockHandle> {
        match cpu {
            CpuId::Arm9 => &mut self.blocks_arm9,
            CpuId::Arm7 => &mut self.blocks_arm7,
        }
    }

    fn block(&self, handle: BlockHandle) -> &JitBlock {
        self.blocks[handle as usize].as_ref().expect("stale block handle")
    }

    fn alloc_block(&mut self, block: JitBlock) -> BlockHandle {
        if let Some(handle) = self.free_handles.pop() {
            self.blocks[handle as usize] = Some(block);
            handle
        } else {
            self.blocks.push(Some(block));
            (self.blocks.len() - 1) as BlockHandle
        }
    }

    fn free_block(&mut self, handle: BlockHandle) {
        self.blocks[handle as usize] = None;
        self.free_handles.push(handle);
    }

    /// Resolves a branch target to a compiled entry, or None on a cache miss.
    #[must_use]
    pub fn lookup_block(&self, cpu: CpuId, addr: u32) -> Option<BlockEntry> {
        let region = code_region_for(cpu, addr)?;
        let offset = localise(cpu, region, addr) & PSEUDO_OFFSET_MASK & (region.size() - 1);

        let entry = self.index.entry_at(region, offset);
        if entry == 0 {
            return None;
        }

        // The fast-lookup tables are shared between the CPUs; the resident
        // entry has to belong to one of this CPU's own blocks
        let fingerprint = Fingerprint::new(cpu, region, offset);
        let &handle = self.cpu_map(cpu).get(&fingerprint.raw())?;
        (self.block(handle).entry == entry).then_some(entry)
    }

    /// Translates (or re-links) the block starting at the CPU's current PC
    /// and installs it into the cache and both indices.
    pub fn compile_block(
        &mut self,
        compiler: &mut dyn Compiler,
        cpu: CpuId,
        pc: u32,
    ) -> Result<BlockEntry, CompileError> {
        let region = code_region_for(cpu, pc).ok_or(CompileError::NotCodeMemory { pc })?;
        let offset = localise(cpu, region, pc) & PSEUDO_OFFSET_MASK & (region.size() - 1);
        let fingerprint = Fingerprint::new(cpu, region, offset);

        // A live block here means a store-side invalidation was missed or the
        // caller re-compiled a hot address; drop the old one first so the
        // fingerprint stays unique
        if let Some(&stale) = self.cpu_map(cpu).get(&fingerprint.raw()) {
            self.retire_block(stale);
        }

        // A retired twin can be re-linked without translating again
        if let Some(handle) = self.restore_candidates.remove(&fingerprint.raw()) {
            self.restore_order.retain(|&fp| fp != fingerprint.raw());
            self.link_block(handle);
            return Ok(self.block(handle).entry);
        }

        let translated = compiler.translate(cpu, pc, self.config.max_block_size)?;

        let mut num_instrs = translated.num_instrs;
        if num_instrs > self.config.max_block_size {
            log::warn!(
                "translated block of {num_instrs} instructions exceeds limit {}; truncating",
                self.config.max_block_size
            );
            num_instrs = self.config.max_block_size;
        }

        let mut entry = {
            let mut guard = CodeWriteGuard::new(&mut self.code_mem);
            guard.push(&translated.code)
        };
        if entry.is_none() {
            // Arena exhausted: drop everything and start from an empty arena
            log::info!("JIT code arena full, resetting block cache");
            self.reset_block_cache();
            let mut guard = CodeWriteGuard::new(&mut self.code_mem);
            entry = guard.push(&translated.code);
        }
        let entry = entry.expect("translated block larger than the JIT code arena");

        let block = JitBlock {
            cpu,
            fingerprint,
            region,
            start_offset: offset,
            entry,
            num_instrs,
            ranges: translated.ranges,
            retired: true,
        };
        let handle = self.alloc_block(block);
        self.link_block(handle);

        Ok(entry)
    }

    // Inserts a block into the per-CPU map, the page bitmaps, and the
    // fast-lookup table
    fn link_block(&mut self, handle: BlockHandle) {
        let (cpu, fingerprint, region, start_offset, entry, ranges) = {
            let block = self.blocks[handle as usize].as_mut().expect("stale block handle");
            block.retired = false;
            (
                block.cpu,
                block.fingerprint,
                block.region,
                block.start_offset,
                block.entry,
                block.ranges.clone(),
            )
        };

        let evicted = self.cpu_map_mut(cpu).insert(fingerprint.raw(), handle);
        assert!(evicted.is_none(), "duplicate block fingerprint {:08X}", fingerprint.raw());

        for range in &ranges {
            self.index.mark(range, handle);
        }
        self.index.set_entry(region, start_offset, entry);
    }

    /// Unlinks a block from the maps and indices and parks it in the
    /// restore-candidates table.
    pub fn retire_block(&mut self, handle: BlockHandle) {
        let (cpu, fingerprint, region, start_offset, ranges) = {
            let block = self.blocks[handle as usize].as_mut().expect("stale block handle");
            debug_assert!(!block.retired, "block retired twice");
            block.retired = true;
            (block.cpu, block.fingerprint, block.region, block.start_offset, block.ranges.clone())
        };

        self.cpu_map_mut(cpu).remove(&fingerprint.raw());

        for range in &ranges {
            for page in pages_in_range(range) {
                self.index.remove_from_page(range.region, page, handle);
                self.recompute_page_code(range.region, page);
            }
        }
        self.index.clear_entry(region, start_offset);

        // Park it for potential re-linking; a fingerprint collision keeps the
        // newer block
        if let Some(old) = self.restore_candidates.insert(fingerprint.raw(), handle) {
            self.free_block(old);
        } else {
            self.restore_order.push_back(fingerprint.raw());
        }

        while self.restore_candidates.len() > RESTORE_CANDIDATE_CAP {
            let Some(oldest) = self.restore_order.pop_front() else { break };
            if let Some(evicted) = self.restore_candidates.remove(&oldest) {
                self.free_block(evicted);
            }
        }
    }

    fn recompute_page_code(&mut self, region: MemRegion, page: u32) {
        let handles = self.index.page_blocks(region, page).to_vec();

        let mut code = 0;
        for handle in handles {
            for range in &self.block(handle).ranges {
                if range.region == region {
                    code |= line_mask_in_page(range, page);
                }
            }
        }
        self.index.set_page_code(region, page, code);
    }

    /// Fine-grained invalidation: retires every block whose code covers the
    /// 16-byte line at the given pseudo-physical address.
    pub fn invalidate_by_address(&mut self, pseudo_physical: u32) {
        let Some((region, offset)) = split_pseudo_physical(pseudo_physical) else {
            panic!("invalidation outside any code region: {pseudo_physical:08X}");
        };

        let page = offset / PAGE_LEN;
        let line_bit = 1 << ((offset & (PAGE_LEN - 1)) / LINE_LEN);
        if self.index.page_code(region, page) & line_bit == 0 {
            return;
        }

        let victims: Vec<BlockHandle> = self
            .index
            .page_blocks(region, page)
            .iter()
            .copied()
            .filter(|&handle| {
                self.block(handle)
                    .ranges
                    .iter()
                    .any(|range| range.region == region && range.covers_line(offset))
            })
            .collect();

        for handle in victims {
            self.retire_block(handle);
        }
    }

    /// The store-side hook: one bitmap load on the fast path, invalidation
    /// only when the store actually lands on compiled code. Returns whether
    /// anything was retired.
    pub fn check_and_invalidate(&mut self, cpu: CpuId, region: MemRegion, addr: u32) -> bool {
        let pseudo = localise(cpu, region, addr);
        let offset = pseudo & PSEUDO_OFFSET_MASK & (region.size() - 1);

        if !self.index.has_code_at(region, offset) {
            return false;
        }

        self.invalidate_by_address(pseudo);
        true
    }

    fn invalidate_pages(&mut self, region: MemRegion, first_page: u32, page_count: u32) {
        let mut victims = vec![];
        for page in first_page..first_page + page_count {
            for &handle in self.index.page_blocks(region, page) {
                if !victims.contains(&handle) {
                    victims.push(handle);
                }
            }
        }

        for handle in victims {
            // A block can span multiple of these pages and may already be gone
            if !self.block(handle).retired {
                self.retire_block(handle);
            }
        }
    }

    /// Coarse invalidation when the ITCM mapping changes: every ITCM block
    /// goes.
    pub fn check_and_invalidate_itcm(&mut self) {
        let region = MemRegion::Itcm;
        self.invalidate_pages(region, 0, region.size() / PAGE_LEN);
    }

    /// Coarse invalidation when an ARM7 VRAM bank is mapped or unmapped:
    /// every block in that bank's 128 KiB half goes.
    pub fn check_and_invalidate_wvram(&mut self, bank: u32) {
        let region = MemRegion::Arm7Wvram;
        let half_pages = region.size() / PAGE_LEN / 2;
        self.invalidate_pages(region, (bank & 1) * half_pages, half_pages);
    }

    /// Drops every block and restore candidate. The code arena mapping stays
    /// in place, merely emptied.
    pub fn reset_block_cache(&mut self) {
        self.blocks.clear();
        self.free_handles.clear();
        self.blocks_arm9.clear();
        self.blocks_arm7.clear();
        self.restore_candidates.clear();
        self.restore_order.clear();
        self.index.clear();
        self.code_mem.reset();
    }

    /// Resolves the region a block address belongs to, so the dispatcher can
    /// service every branch inside it with fast-lookup loads alone.
    #[must_use]
    pub fn set_executable_region(&self, cpu: CpuId, block_addr: u32) -> Option<ExecutableRegion> {
        let region = code_region_for(cpu, block_addr)?;
        Some(ExecutableRegion { region, start: region_base(cpu, region), size: region.size() })
    }

    pub fn jit_enable_write(&self) {
        self.code_mem.enable_write();
    }

    pub fn jit_enable_execute(&self) {
        self.code_mem.enable_execute();
    }

    #[must_use]
    pub fn fast_lookup_entry(&self, region: MemRegion, offset: u32) -> BlockEntry {
        self.index.entry_at(region, offset)
    }

    #[must_use]
    pub fn page_code(&self, region: MemRegion, page: u32) -> u32 {
        self.index.page_code(region, page)
    }

    #[must_use]
    pub fn is_live(&self, cpu: CpuId, fingerprint: Fingerprint) -> bool {
        self.cpu_map(cpu).contains_key(&fingerprint.raw())
    }

    #[must_use]
    pub fn is_restore_candidate(&self, fingerprint: Fingerprint) -> bool {
        self.restore_candidates.contains_key(&fingerprint.raw())
    }

    #[must_use]
    pub fn live_block_count(&self) -> usize {
        self.blocks_arm9.len() + self.blocks_arm7.len()
    }
}
