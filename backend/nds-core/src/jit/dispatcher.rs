//! The seam between the CPU fetch loop, the block cache, and the external
//! code generator.

use crate::interrupts::CpuId;
use crate::jit::block::{BlockEntry, CodeRange};
use crate::jit::JitCache;
use thiserror::Error;

/// What the dispatcher needs to know about a CPU.
pub trait JitCpu {
    fn id(&self) -> CpuId;

    fn pc(&self) -> u32;
}

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("unimplemented instruction {opcode:08X} at {pc:08X}")]
    UnimplementedInstruction { pc: u32, opcode: u32 },
    #[error("program counter {pc:08X} does not map to executable memory")]
    NotCodeMemory { pc: u32 },
}

/// A finished translation, ready to be installed into the cache.
#[derive(Debug, Clone)]
pub struct TranslatedBlock {
    /// Native code bytes; the cache copies them into its arena.
    pub code: Vec<u8>,
    pub num_instrs: u32,
    /// Guest code the translation depends on. Invalidation of any byte in
    /// these ranges retires the block.
    pub ranges: Vec<CodeRange>,
}

/// The black-box code generator.
pub trait Compiler {
    fn translate(
        &mut self,
        cpu: CpuId,
        pc: u32,
        max_block_size: u32,
    ) -> Result<TranslatedBlock, CompileError>;
}

/// One dispatch step: resolve the PC to a compiled entry, translating on a
/// miss. On a failed translation the caller-supplied fallback interprets a
/// single instruction and `None` is returned; the fetch loop just retries.
pub fn dispatch<C: Compiler>(
    jit: &mut JitCache,
    compiler: &mut C,
    cpu: &impl JitCpu,
    interpret_one: impl FnOnce(),
) -> Option<BlockEntry> {
    let (id, pc) = (cpu.id(), cpu.pc());

    if let Some(entry) = jit.lookup_block(id, pc) {
        return Some(entry);
    }

    match jit.compile_block(compiler, id, pc) {
        Ok(entry) => Some(entry),
        Err(err) => {
            log::trace!("JIT compile failed at {pc:08X}: {err}");
            interpret_one();
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::region::MemRegion;
    use crate::jit::JitConfig;

    struct TestCpu {
        id: CpuId,
        pc: u32,
    }

    impl JitCpu for TestCpu {
        fn id(&self) -> CpuId {
            self.id
        }

        fn pc(&self) -> u32 {
            self.pc
        }
    }

    #[derive(Default)]
    struct CountingCompiler {
        translations: u32,
        fail: bool,
    }

    impl Compiler for CountingCompiler {
        fn translate(
            &mut self,
            _cpu: CpuId,
            pc: u32,
            _max_block_size: u32,
        ) -> Result<TranslatedBlock, CompileError> {
            if self.fail {
                return Err(CompileError::UnimplementedInstruction { pc, opcode: 0xE1A0_0000 });
            }

            self.translations += 1;
            Ok(TranslatedBlock {
                code: vec![0xC3; 0x20],
                num_instrs: 8,
                ranges: vec![CodeRange { region: MemRegion::Itcm, start: pc & 0x7FFF, len: 0x20 }],
            })
        }
    }

    #[test]
    fn dispatch_compiles_then_hits() {
        let mut jit = JitCache::new(JitConfig::default());
        let mut compiler = CountingCompiler::default();
        let cpu = TestCpu { id: CpuId::Arm9, pc: 0x40 };

        let entry = dispatch(&mut jit, &mut compiler, &cpu, || panic!("no fallback expected"));
        assert!(entry.is_some());
        assert_eq!(compiler.translations, 1);

        // The fast-lookup slot is populated now; no retranslation
        let entry2 = dispatch(&mut jit, &mut compiler, &cpu, || panic!("no fallback expected"));
        assert_eq!(entry2, entry);
        assert_eq!(compiler.translations, 1);
    }

    #[test]
    fn dispatch_falls_back_to_interpreter_on_failure() {
        let mut jit = JitCache::new(JitConfig::default());
        let mut compiler = CountingCompiler { fail: true, ..Default::default() };
        let cpu = TestCpu { id: CpuId::Arm9, pc: 0x40 };

        let mut interpreted = false;
        let entry = dispatch(&mut jit, &mut compiler, &cpu, || interpreted = true);
        assert!(entry.is_none());
        assert!(interpreted);
    }

    #[test]
    fn dispatch_falls_back_outside_code_memory() {
        let mut jit = JitCache::new(JitConfig::default());
        let mut compiler = CountingCompiler::default();
        let cpu = TestCpu { id: CpuId::Arm9, pc: 0x0800_0000 };

        let mut interpreted = false;
        let entry = dispatch(&mut jit, &mut compiler, &cpu, || interpreted = true);
        assert!(entry.is_none());
        assert!(interpreted);
        assert_eq!(compiler.translations, 0);
    }
}
