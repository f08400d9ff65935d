/*!
jit - Basic-block compilation engine.

Pipeline per block (see the submodules): decode to μops, pre-rewrite
optimization, backend rewrite, post-rewrite optimization, lowering into
the code cache. The driver below executes compiled blocks back to back,
chaining direct successors, and drops to the interpreter whenever
fidelity demands it:

- an effective address lands in the MMIO window (sub-instruction timing
  is observable there);
- BCD arithmetic with the D flag actually set;
- interrupt-unmasking instructions, which additionally interpret one
  successor instruction to honor the 6502's one-instruction IRQ latency;
- the countdown is close enough to expiry that a timer could fire inside
  the block (per-instruction accuracy takes over).

Self-modifying code is handled by the write-invalidation μops every
store carries: a write into a compiled block sends its entry back to the
compilation trampoline before the block can be entered again.
*/

pub mod backend;
pub mod cache;
pub mod decode;
pub mod optimize;
pub mod uop;

use std::rc::Rc;

use crate::bus::Bus;
use crate::cpu::defs::{self, CpuVariant, VECTOR_IRQ, VECTOR_NMI};
use crate::cpu::interp::{DebugHook, Interp, now};
use crate::cpu::state::Cpu;
use backend::{Cond, HostOp};
use cache::CodeCache;

/// Why a block stopped executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockExit {
    /// Continue at this address (chainable).
    Next(u16),
    /// Re-run the instruction at this address under the interpreter.
    Bounce(u16),
}

/// Runtime scratch state threaded through a block.
#[derive(Default)]
struct RunCtx {
    addr: u16,
    imm: u8,
    has_imm: bool,
    value: u8,
    carry: bool,
    overflow: bool,
    idy_base: u16,
}

pub struct Jit {
    variant: CpuVariant,
    interp: Interp,
    cache: CodeCache,
    debug: bool,
    debug_hook: Option<DebugHook>,
}

impl Jit {
    pub fn new(variant: CpuVariant) -> Jit {
        Jit {
            variant,
            interp: Interp::new(variant),
            cache: CodeCache::new(),
            debug: false,
            debug_hook: None,
        }
    }

    /// Enable the per-instruction debug hook in generated code.
    pub fn set_debug_hook(&mut self, hook: DebugHook) {
        self.debug = true;
        self.debug_hook = Some(hook);
    }

    pub fn reset(&self, cpu: &mut Cpu, bus: &mut Bus) {
        self.interp.reset(cpu, bus);
    }

    pub fn cache(&self) -> &CodeCache {
        &self.cache
    }

    /// Explicit invalidation (ROM paging, snapshot load).
    pub fn memory_range_invalidate(&mut self, addr: u16, len: u32) {
        self.cache.invalidate_range(addr, len);
    }

    pub fn run(&mut self, cpu: &mut Cpu, bus: &mut Bus, max_cycles: u64) {
        let target = cpu.cycles + max_cycles;
        let mut countdown = bus.timing.countdown();
        // (block index, epoch) of the previously executed block, for
        // chain linking.
        let mut prev_block: Option<(u32, u64)> = None;

        while !cpu.halted && cpu.cycles < target && !bus.exit_requested() {
            if bus.has_pending_invalidations() {
                for (start, len) in bus.take_pending_invalidations() {
                    self.cache.invalidate_range(start, len);
                }
                prev_block = None;
            }

            if countdown <= 0 {
                countdown = bus.advance_time(countdown);
            }

            // Interrupt poll at the block boundary. Blocks cannot change
            // the I mask (those instructions bounce), so the live flag is
            // the correct mask here.
            if bus.irqs.take_nmi_edge() {
                let before = now(bus, countdown);
                self.interp
                    .service_interrupt(cpu, bus, &mut countdown, VECTOR_NMI);
                cpu.cycles += now(bus, countdown) - before;
                prev_block = None;
                continue;
            }
            if bus.irqs.asserted() && !cpu.flag_i {
                let before = now(bus, countdown);
                self.interp
                    .service_interrupt(cpu, bus, &mut countdown, VECTOR_IRQ);
                cpu.cycles += now(bus, countdown) - before;
                prev_block = None;
                continue;
            }

            let pc = cpu.pc;
            if Bus::needs_callback(pc) || pc >= 0xFFFD {
                self.interp.single_step(cpu, bus, &mut countdown);
                prev_block = None;
                continue;
            }

            // Resolve the block: chain link, entry table, or compile.
            let chained = prev_block.and_then(|(p, epoch)| {
                if self.cache.block(p).valid && self.cache.block(p).epoch == epoch {
                    self.cache.chained(p, pc)
                } else {
                    None
                }
            });
            let idx = match chained {
                Some(idx) => idx,
                None => {
                    let idx = match self.cache.lookup(pc) {
                        Some(idx) => idx,
                        None => self.compile(bus, pc),
                    };
                    if let Some((p, epoch)) = prev_block {
                        if self.cache.block(p).valid && self.cache.block(p).epoch == epoch {
                            self.cache.set_chain(p, idx);
                        }
                    }
                    idx
                }
            };

            // A timer could expire inside this block: hand the next
            // instruction to the interpreter for exact firing position.
            if countdown <= self.cache.block(idx).max_cycles as i64 {
                self.interp.single_step(cpu, bus, &mut countdown);
                prev_block = None;
                continue;
            }

            let code = Rc::clone(&self.cache.block(idx).code);
            let epoch = self.cache.block(idx).epoch;
            let before = now(bus, countdown);
            let exit = self.exec(cpu, bus, &mut countdown, &code);
            cpu.cycles += now(bus, countdown) - before;

            match exit {
                BlockExit::Next(addr) => {
                    cpu.pc = addr;
                    prev_block = if self.cache.block(idx).valid {
                        Some((idx, epoch))
                    } else {
                        None
                    };
                }
                BlockExit::Bounce(addr) => {
                    // The generated Debug op for this instruction has
                    // already fired; the interpreter replays it silently.
                    cpu.pc = addr;
                    let opcode = bus.peek(addr);
                    let (optype, _, _) = defs::decode(self.variant, opcode);
                    self.interp.single_step(cpu, bus, &mut countdown);
                    // The one-instruction IRQ latency of an unmasking
                    // instruction: its successor must retire before any
                    // boundary poll happens.
                    if defs::may_unmask_irq(optype)
                        && optype != defs::OpType::Rti
                        && !cpu.halted
                    {
                        if let Some(hook) = self.debug_hook.as_mut() {
                            hook(cpu);
                        }
                        self.interp.single_step(cpu, bus, &mut countdown);
                    }
                    prev_block = None;
                }
            }
        }
        bus.advance_time(countdown);
    }

    fn compile(&mut self, bus: &Bus, pc: u16) -> u32 {
        let mut block = decode::decode_block(&bus.mem, self.variant, pc);
        debug_assert!(!block.is_empty());

        optimize::optimize_pre_rewrite(&mut block);
        backend::rewrite(&mut block);
        optimize::optimize_post_rewrite(&mut block);
        let code = backend::lower(&block, self.variant == CpuVariant::Nmos, self.debug);

        let last = block.last().unwrap();
        let len = last.addr.wrapping_add(last.bytes()).wrapping_sub(pc);
        // Worst case: base cycles plus up to two penalty cycles per
        // instruction (branch taken + page crossed).
        let max_cycles: u32 = block
            .iter()
            .filter(|d| !d.eliminated)
            .map(|d| d.cycles() as u32 + 2)
            .sum();

        self.cache
            .install(pc, len, Rc::from(code.into_boxed_slice()), max_cycles)
    }

    /// Write through to memory and knock out any compiled block covering
    /// the target.
    #[inline]
    fn write(&mut self, bus: &mut Bus, addr: u16, val: u8, invalidate: bool) {
        bus.mem.write(addr, val, 0);
        if invalidate {
            self.cache.invalidate_write(addr);
        }
    }

    fn exec(
        &mut self,
        cpu: &mut Cpu,
        bus: &mut Bus,
        countdown: &mut i64,
        code: &Rc<[HostOp]>,
    ) -> BlockExit {
        let mut ctx = RunCtx::default();

        macro_rules! operand {
            () => {
                if ctx.has_imm {
                    ctx.imm
                } else {
                    bus.mem.read(ctx.addr, cpu.pc)
                }
            };
        }

        for &op in code.iter() {
            match op {
                HostOp::Debug(addr) => {
                    cpu.pc = addr;
                    if let Some(hook) = self.debug_hook.as_mut() {
                        hook(cpu);
                    }
                }
                HostOp::InterpBounce(addr) => return BlockExit::Bounce(addr),
                HostOp::CheckSpecial(addr) => {
                    if Bus::needs_callback(ctx.addr) {
                        return BlockExit::Bounce(addr);
                    }
                }
                HostOp::CheckBcd(addr) => {
                    if cpu.flag_d {
                        return BlockExit::Bounce(addr);
                    }
                }
                HostOp::ChargeCycles(n) => *countdown -= n as i64,

                HostOp::ModeImm(v) => {
                    ctx.imm = v;
                    ctx.has_imm = true;
                }
                HostOp::ModeZpg(a) => {
                    ctx.addr = a as u16;
                    ctx.has_imm = false;
                }
                HostOp::ModeAbs(a) => {
                    ctx.addr = a;
                    ctx.has_imm = false;
                }
                HostOp::ModeZpx(a) => {
                    ctx.addr = a.wrapping_add(cpu.x) as u16;
                    ctx.has_imm = false;
                }
                HostOp::ModeZpy(a) => {
                    ctx.addr = a.wrapping_add(cpu.y) as u16;
                    ctx.has_imm = false;
                }
                HostOp::ModeAbx(a) => {
                    ctx.addr = a.wrapping_add(cpu.x as u16);
                    ctx.has_imm = false;
                }
                HostOp::ModeAby(a) => {
                    ctx.addr = a.wrapping_add(cpu.y as u16);
                    ctx.has_imm = false;
                }
                HostOp::ModeIdx(zp) => {
                    let zp = zp.wrapping_add(cpu.x);
                    let lo = bus.mem.read(zp as u16, cpu.pc) as u16;
                    let hi = bus.mem.read(zp.wrapping_add(1) as u16, cpu.pc) as u16;
                    ctx.addr = (hi << 8) | lo;
                    ctx.has_imm = false;
                }
                HostOp::ModeIdy(zp) => {
                    let lo = bus.mem.read(zp as u16, cpu.pc) as u16;
                    let hi = bus.mem.read(zp.wrapping_add(1) as u16, cpu.pc) as u16;
                    ctx.idy_base = (hi << 8) | lo;
                    ctx.addr = ctx.idy_base.wrapping_add(cpu.y as u16);
                    ctx.has_imm = false;
                }
                HostOp::ModeInd(ptr, nmos) => {
                    let lo = bus.mem.read(ptr, cpu.pc) as u16;
                    let hi_addr = if nmos {
                        (ptr & 0xFF00) | (ptr.wrapping_add(1) & 0x00FF)
                    } else {
                        ptr.wrapping_add(1)
                    };
                    let hi = bus.mem.read(hi_addr, cpu.pc) as u16;
                    ctx.addr = (hi << 8) | lo;
                    ctx.has_imm = false;
                }
                HostOp::ModeId(zp) => {
                    let lo = bus.mem.read(zp as u16, cpu.pc) as u16;
                    let hi = bus.mem.read(zp.wrapping_add(1) as u16, cpu.pc) as u16;
                    ctx.addr = (hi << 8) | lo;
                    ctx.has_imm = false;
                }
                HostOp::ModeIax(ptr) => {
                    let ptr = ptr.wrapping_add(cpu.x as u16);
                    let lo = bus.mem.read(ptr, cpu.pc) as u16;
                    let hi = bus.mem.read(ptr.wrapping_add(1), cpu.pc) as u16;
                    ctx.addr = (hi << 8) | lo;
                    ctx.has_imm = false;
                }
                HostOp::PageCrossAbx(base) => {
                    if (base & 0xFF00) != (base.wrapping_add(cpu.x as u16) & 0xFF00) {
                        *countdown -= 1;
                    }
                }
                HostOp::PageCrossAby(base) => {
                    if (base & 0xFF00) != (base.wrapping_add(cpu.y as u16) & 0xFF00) {
                        *countdown -= 1;
                    }
                }
                HostOp::PageCrossIdy => {
                    if (ctx.idy_base & 0xFF00) != (ctx.addr & 0xFF00) {
                        *countdown -= 1;
                    }
                }

                HostOp::LoadCarry => ctx.carry = cpu.flag_c,
                HostOp::LoadCarryInv => ctx.carry = !cpu.flag_c,
                HostOp::SaveCarry => cpu.flag_c = ctx.carry,
                HostOp::SaveCarryInv => cpu.flag_c = !ctx.carry,
                HostOp::SaveOverflow => cpu.flag_v = ctx.overflow,
                HostOp::FlagsNzA => cpu.update_zn(cpu.a),
                HostOp::FlagsNzX => cpu.update_zn(cpu.x),
                HostOp::FlagsNzY => cpu.update_zn(cpu.y),
                HostOp::FlagsNzValue => {
                    let v = ctx.value;
                    cpu.update_zn(v);
                }
                HostOp::ValueSet(v) => ctx.value = v,

                HostOp::Lda => cpu.a = operand!(),
                HostOp::Ldx => cpu.x = operand!(),
                HostOp::Ldy => cpu.y = operand!(),
                HostOp::LdaConst(v) => cpu.a = v,
                HostOp::LdxConst(v) => cpu.x = v,
                HostOp::LdyConst(v) => cpu.y = v,
                HostOp::Sta => {
                    let (a, v) = (ctx.addr, cpu.a);
                    self.write(bus, a, v, false);
                }
                HostOp::Stx => {
                    let (a, v) = (ctx.addr, cpu.x);
                    self.write(bus, a, v, false);
                }
                HostOp::Sty => {
                    let (a, v) = (ctx.addr, cpu.y);
                    self.write(bus, a, v, false);
                }
                HostOp::Ora => cpu.a |= operand!(),
                HostOp::And => cpu.a &= operand!(),
                HostOp::Eor => cpu.a ^= operand!(),
                HostOp::Adc(load) => {
                    if load {
                        ctx.carry = cpu.flag_c;
                    }
                    let v = operand!();
                    let a = cpu.a;
                    let sum = a as u16 + v as u16 + ctx.carry as u16;
                    ctx.carry = sum > 0xFF;
                    ctx.overflow = ((a ^ sum as u8) & (v ^ sum as u8) & 0x80) != 0;
                    cpu.a = sum as u8;
                }
                HostOp::Add => {
                    let v = operand!();
                    let a = cpu.a;
                    let sum = a as u16 + v as u16;
                    ctx.carry = sum > 0xFF;
                    ctx.overflow = ((a ^ sum as u8) & (v ^ sum as u8) & 0x80) != 0;
                    cpu.a = sum as u8;
                }
                HostOp::Sbc(load) => {
                    if load {
                        ctx.carry = !cpu.flag_c;
                    }
                    let v = operand!();
                    let a = cpu.a;
                    let diff = a as i16 - v as i16 - ctx.carry as i16;
                    ctx.carry = diff < 0;
                    let result = diff as u8;
                    ctx.overflow = ((a ^ v) & (a ^ result) & 0x80) != 0;
                    cpu.a = result;
                }
                HostOp::Sub => {
                    let v = operand!();
                    let a = cpu.a;
                    let diff = a as i16 - v as i16;
                    ctx.carry = diff < 0;
                    let result = diff as u8;
                    ctx.overflow = ((a ^ v) & (a ^ result) & 0x80) != 0;
                    cpu.a = result;
                }
                HostOp::Cmp => {
                    let v = operand!();
                    ctx.carry = cpu.a < v;
                    ctx.value = cpu.a.wrapping_sub(v);
                }
                HostOp::Cpx => {
                    let v = operand!();
                    ctx.carry = cpu.x < v;
                    ctx.value = cpu.x.wrapping_sub(v);
                }
                HostOp::Cpy => {
                    let v = operand!();
                    ctx.carry = cpu.y < v;
                    ctx.value = cpu.y.wrapping_sub(v);
                }
                HostOp::BitTest => {
                    let v = operand!();
                    cpu.flag_z = (cpu.a & v) == 0;
                    cpu.flag_n = (v & 0x80) != 0;
                    cpu.flag_v = (v & 0x40) != 0;
                }
                HostOp::AslAcc(n) => {
                    for _ in 0..n {
                        ctx.carry = (cpu.a & 0x80) != 0;
                        cpu.a <<= 1;
                    }
                }
                HostOp::LsrAcc(n) => {
                    for _ in 0..n {
                        ctx.carry = (cpu.a & 0x01) != 0;
                        cpu.a >>= 1;
                    }
                }
                HostOp::RolAcc(n, load) => {
                    if load {
                        ctx.carry = cpu.flag_c;
                    }
                    for _ in 0..n {
                        let carry_out = (cpu.a & 0x80) != 0;
                        cpu.a = (cpu.a << 1) | ctx.carry as u8;
                        ctx.carry = carry_out;
                    }
                }
                HostOp::RorAcc(n, load) => {
                    if load {
                        ctx.carry = cpu.flag_c;
                    }
                    for _ in 0..n {
                        let carry_out = (cpu.a & 0x01) != 0;
                        cpu.a = (cpu.a >> 1) | ((ctx.carry as u8) << 7);
                        ctx.carry = carry_out;
                    }
                }
                HostOp::AslMem => {
                    let v = bus.mem.read(ctx.addr, cpu.pc);
                    ctx.carry = (v & 0x80) != 0;
                    ctx.value = v << 1;
                    let (a, r) = (ctx.addr, ctx.value);
                    self.write(bus, a, r, false);
                }
                HostOp::LsrMem => {
                    let v = bus.mem.read(ctx.addr, cpu.pc);
                    ctx.carry = (v & 0x01) != 0;
                    ctx.value = v >> 1;
                    let (a, r) = (ctx.addr, ctx.value);
                    self.write(bus, a, r, false);
                }
                HostOp::RolMem(load) => {
                    if load {
                        ctx.carry = cpu.flag_c;
                    }
                    let v = bus.mem.read(ctx.addr, cpu.pc);
                    let carry_out = (v & 0x80) != 0;
                    ctx.value = (v << 1) | ctx.carry as u8;
                    ctx.carry = carry_out;
                    let (a, r) = (ctx.addr, ctx.value);
                    self.write(bus, a, r, false);
                }
                HostOp::RorMem(load) => {
                    if load {
                        ctx.carry = cpu.flag_c;
                    }
                    let v = bus.mem.read(ctx.addr, cpu.pc);
                    let carry_out = (v & 0x01) != 0;
                    ctx.value = (v >> 1) | ((ctx.carry as u8) << 7);
                    ctx.carry = carry_out;
                    let (a, r) = (ctx.addr, ctx.value);
                    self.write(bus, a, r, false);
                }
                HostOp::IncMem => {
                    ctx.value = bus.mem.read(ctx.addr, cpu.pc).wrapping_add(1);
                    let (a, r) = (ctx.addr, ctx.value);
                    self.write(bus, a, r, false);
                }
                HostOp::DecMem => {
                    ctx.value = bus.mem.read(ctx.addr, cpu.pc).wrapping_sub(1);
                    let (a, r) = (ctx.addr, ctx.value);
                    self.write(bus, a, r, false);
                }
                HostOp::WriteInv => {
                    self.cache.invalidate_write(ctx.addr);
                }
                HostOp::Inx => cpu.x = cpu.x.wrapping_add(1),
                HostOp::Iny => cpu.y = cpu.y.wrapping_add(1),
                HostOp::Dex => cpu.x = cpu.x.wrapping_sub(1),
                HostOp::Dey => cpu.y = cpu.y.wrapping_sub(1),
                HostOp::Tax => cpu.x = cpu.a,
                HostOp::Tay => cpu.y = cpu.a,
                HostOp::Txa => cpu.a = cpu.x,
                HostOp::Tya => cpu.a = cpu.y,
                HostOp::Tsx => cpu.x = cpu.s,
                HostOp::Txs => cpu.s = cpu.x,
                HostOp::Pha => {
                    let (addr, v) = (defs::STACK_ADDR | cpu.s as u16, cpu.a);
                    self.write(bus, addr, v, true);
                    cpu.s = cpu.s.wrapping_sub(1);
                }
                HostOp::Php => {
                    let flags = cpu.flags_byte(true);
                    let addr = defs::STACK_ADDR | cpu.s as u16;
                    self.write(bus, addr, flags, true);
                    cpu.s = cpu.s.wrapping_sub(1);
                }
                HostOp::Pla => {
                    cpu.s = cpu.s.wrapping_add(1);
                    cpu.a = bus.mem.read(defs::STACK_ADDR | cpu.s as u16, cpu.pc);
                }
                HostOp::Clc => cpu.flag_c = false,
                HostOp::Sec => cpu.flag_c = true,
                HostOp::Cld => cpu.flag_d = false,
                HostOp::Sed => cpu.flag_d = true,
                HostOp::Clv => cpu.flag_v = false,

                HostOp::Jmp(target) => return BlockExit::Next(target),
                HostOp::JmpScratch => return BlockExit::Next(ctx.addr),
                HostOp::Jsr(target, ret) => {
                    let hi = (ret >> 8) as u8;
                    let lo = ret as u8;
                    let addr = defs::STACK_ADDR | cpu.s as u16;
                    self.write(bus, addr, hi, true);
                    cpu.s = cpu.s.wrapping_sub(1);
                    let addr = defs::STACK_ADDR | cpu.s as u16;
                    self.write(bus, addr, lo, true);
                    cpu.s = cpu.s.wrapping_sub(1);
                    return BlockExit::Next(target);
                }
                HostOp::Rts => {
                    cpu.s = cpu.s.wrapping_add(1);
                    let lo = bus.mem.read(defs::STACK_ADDR | cpu.s as u16, cpu.pc) as u16;
                    cpu.s = cpu.s.wrapping_add(1);
                    let hi = bus.mem.read(defs::STACK_ADDR | cpu.s as u16, cpu.pc) as u16;
                    return BlockExit::Next(((hi << 8) | lo).wrapping_add(1));
                }
                HostOp::Branch(cond, target, fall) => {
                    let take = match cond {
                        Cond::Eq => cpu.flag_z,
                        Cond::Ne => !cpu.flag_z,
                        Cond::Cs => cpu.flag_c,
                        Cond::Cc => !cpu.flag_c,
                        Cond::Mi => cpu.flag_n,
                        Cond::Pl => !cpu.flag_n,
                        Cond::Vs => cpu.flag_v,
                        Cond::Vc => !cpu.flag_v,
                        Cond::Always => true,
                    };
                    if take {
                        *countdown -= 1;
                        if (target & 0xFF00) != (fall & 0xFF00) {
                            *countdown -= 1;
                        }
                        return BlockExit::Next(target);
                    }
                    return BlockExit::Next(fall);
                }
            }
        }
        unreachable!("block has no terminating host op");
    }
}
