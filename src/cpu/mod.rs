/*!
cpu - Public façade for the three 6502 execution engines.

    state.rs    - architectural register file + flag helpers.
    defs.rs     - opcode/mode/cycle maps for NMOS 6502 and 65C12.
    interp.rs   - reference cycle-stepped interpreter.
    inturbo.rs  - table-generated opcode templates.
    (crate::jit - the basic-block compiler, grown large enough for a
                  directory of its own.)

All three engines share the `Cpu` register file, the bus's memory maps
and IRQ lines, and the countdown; `CpuDriver` picks one at construction
and erases the difference. For any program that does not observe host
cycle counts directly, the engines are observably identical - the tests
in `tests.rs` hold them to that.
*/

pub mod defs;
pub mod interp;
pub mod inturbo;
pub mod state;

#[cfg(test)]
mod tests;

pub use interp::{DebugHook, Interp};
pub use inturbo::Inturbo;
pub use state::Cpu;

use crate::bus::Bus;
use crate::jit::Jit;
use defs::CpuVariant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuMode {
    Interp,
    Inturbo,
    Jit,
}

/// The selected engine plus the state it drives.
pub enum CpuDriver {
    Interp(Interp),
    Inturbo(Inturbo),
    Jit(Jit),
}

impl CpuDriver {
    pub fn new(mode: CpuMode, variant: CpuVariant) -> CpuDriver {
        match mode {
            CpuMode::Interp => CpuDriver::Interp(Interp::new(variant)),
            CpuMode::Inturbo => CpuDriver::Inturbo(Inturbo::new(variant)),
            CpuMode::Jit => CpuDriver::Jit(Jit::new(variant)),
        }
    }

    /// Load PC from the reset vector.
    pub fn reset(&self, cpu: &mut Cpu, bus: &mut Bus) {
        match self {
            CpuDriver::Interp(engine) => engine.reset(cpu, bus),
            CpuDriver::Inturbo(engine) => engine.reset(cpu, bus),
            CpuDriver::Jit(engine) => engine.reset(cpu, bus),
        }
    }

    /// Run for (at least) `max_cycles` emulated cycles, or until halt or
    /// shutdown.
    pub fn run(&mut self, cpu: &mut Cpu, bus: &mut Bus, max_cycles: u64) {
        match self {
            CpuDriver::Interp(engine) => engine.run(cpu, bus, max_cycles),
            CpuDriver::Inturbo(engine) => engine.run(cpu, bus, max_cycles),
            CpuDriver::Jit(engine) => engine.run(cpu, bus, max_cycles),
        }
    }

    pub fn set_debug_hook(&mut self, hook: DebugHook) {
        match self {
            CpuDriver::Interp(engine) => engine.set_debug_hook(hook),
            CpuDriver::Inturbo(engine) => engine.set_debug_hook(hook),
            CpuDriver::Jit(engine) => engine.set_debug_hook(hook),
        }
    }

    /// Drop any compiled code covering the range (ROM paging, snapshot
    /// load). A no-op for the non-compiling engines.
    pub fn memory_range_invalidate(&mut self, addr: u16, len: u32) {
        if let CpuDriver::Jit(engine) = self {
            engine.memory_range_invalidate(addr, len);
        }
    }
}
