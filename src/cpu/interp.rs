/*!
interp.rs - The reference cycle-stepped interpreter.

Every memory access goes through the bus and charges its own cycle;
internal cycles are charged explicitly. The result is that MMIO accesses
land on the exact cycle of the instruction the hardware performs them in,
which is what the VIA/CRTC timing fidelity rests on. The other engines
are required to be observably identical to this one.

Interrupt polling happens at instruction boundaries. CLI/SEI/PLP take
their effect on the I mask one instruction late (the poll uses the
pre-instruction value), reproducing the 6502's one-instruction IRQ
latency after CLI; RTI is immediate. NMI is edge-triggered and beats a
pending IRQ.
*/

use crate::bus::Bus;
use crate::cpu::defs::{
    self, CpuVariant, MemKind, OpMode, OpType, STACK_ADDR, VECTOR_IRQ, VECTOR_NMI, VECTOR_RESET,
};
use crate::cpu::state::Cpu;

/// Per-instruction observer, shared by all engines.
pub type DebugHook = Box<dyn FnMut(&Cpu)>;

/// Resolved addressing-mode result for one instruction.
#[derive(Clone, Copy)]
enum Operand {
    Implied,
    Acc,
    Imm(u8),
    Addr(u16),
}

impl Operand {
    #[inline]
    fn addr(&self) -> Option<u16> {
        match self {
            Operand::Addr(addr) => Some(*addr),
            _ => None,
        }
    }

    #[inline]
    fn imm(&self) -> Option<u8> {
        match self {
            Operand::Imm(v) => Some(*v),
            _ => None,
        }
    }
}

/// Emulated time at an engine-local countdown value.
#[inline]
pub fn now(bus: &Bus, countdown: i64) -> u64 {
    bus.timing.total_ticks() + (bus.timing.countdown() - countdown) as u64
}

pub struct Interp {
    variant: CpuVariant,
    debug_hook: Option<DebugHook>,
}

impl Interp {
    pub fn new(variant: CpuVariant) -> Interp {
        Interp {
            variant,
            debug_hook: None,
        }
    }

    #[inline]
    pub fn variant(&self) -> CpuVariant {
        self.variant
    }

    pub fn set_debug_hook(&mut self, hook: DebugHook) {
        self.debug_hook = Some(hook);
    }

    /// Load PC from the reset vector.
    pub fn reset(&self, cpu: &mut Cpu, bus: &mut Bus) {
        let mut countdown = bus.timing.countdown();
        let lo = bus.read(VECTOR_RESET, 0, &mut countdown) as u16;
        let hi = bus.read(VECTOR_RESET + 1, 0, &mut countdown) as u16;
        cpu.pc = (hi << 8) | lo;
    }

    /// Run until `max_cycles` more cycles have retired, the CPU halts, or
    /// shutdown is requested.
    pub fn run(&mut self, cpu: &mut Cpu, bus: &mut Bus, max_cycles: u64) {
        let target = cpu.cycles + max_cycles;
        let mut countdown = bus.timing.countdown();
        while !cpu.halted && cpu.cycles < target && !bus.exit_requested() {
            self.single_step(cpu, bus, &mut countdown);
        }
        // Leave wheel time synchronized with the retired cycle count.
        bus.advance_time(countdown);
    }

    /// Execute one instruction plus any interrupt entry it exposes.
    pub fn single_step(&mut self, cpu: &mut Cpu, bus: &mut Bus, countdown: &mut i64) {
        let before = now(bus, *countdown);
        if let Some(hook) = self.debug_hook.as_mut() {
            hook(cpu);
        }

        let i_before = cpu.flag_i;
        let optype = self.execute_one(cpu, bus, countdown);

        // Yield to the wheel on countdown underflow; timer callbacks may
        // assert IRQ lines here.
        if *countdown <= 0 {
            *countdown = bus.advance_time(*countdown);
        }

        // Interrupt poll. Instructions that can unmask an interrupt are
        // polled against the pre-instruction mask, so their effect lands
        // one instruction late; RTI is immediate.
        let effective_i = if defs::may_unmask_irq(optype) && optype != OpType::Rti {
            i_before
        } else {
            cpu.flag_i
        };
        if bus.irqs.take_nmi_edge() {
            self.service_interrupt(cpu, bus, countdown, VECTOR_NMI);
        } else if bus.irqs.asserted() && !effective_i {
            self.service_interrupt(cpu, bus, countdown, VECTOR_IRQ);
        }

        cpu.cycles += now(bus, *countdown) - before;
    }

    /// Hardware interrupt entry: 7 cycles, B clear in the pushed flags.
    pub(crate) fn service_interrupt(
        &mut self,
        cpu: &mut Cpu,
        bus: &mut Bus,
        countdown: &mut i64,
        vector: u16,
    ) {
        *countdown -= 2;
        let pch = (cpu.pc >> 8) as u8;
        let pcl = cpu.pc as u8;
        self.push(cpu, bus, countdown, pch);
        self.push(cpu, bus, countdown, pcl);
        let flags = cpu.flags_byte(false);
        self.push(cpu, bus, countdown, flags);
        cpu.flag_i = true;
        if self.variant == CpuVariant::Cmos {
            cpu.flag_d = false;
        }
        let lo = bus.read(vector, cpu.pc, countdown) as u16;
        let hi = bus.read(vector + 1, cpu.pc, countdown) as u16;
        cpu.pc = (hi << 8) | lo;
    }

    // -----------------------------------------------------------------
    // Fetch / stack primitives (each bus access costs one cycle)
    // -----------------------------------------------------------------

    #[inline]
    fn fetch8(&mut self, cpu: &mut Cpu, bus: &mut Bus, countdown: &mut i64) -> u8 {
        let pc = cpu.pc;
        let v = bus.read(pc, pc, countdown);
        cpu.pc = pc.wrapping_add(1);
        v
    }

    #[inline]
    fn fetch16(&mut self, cpu: &mut Cpu, bus: &mut Bus, countdown: &mut i64) -> u16 {
        let lo = self.fetch8(cpu, bus, countdown) as u16;
        let hi = self.fetch8(cpu, bus, countdown) as u16;
        (hi << 8) | lo
    }

    #[inline]
    fn push(&mut self, cpu: &mut Cpu, bus: &mut Bus, countdown: &mut i64, val: u8) {
        let addr = STACK_ADDR | cpu.s as u16;
        let pc = cpu.pc;
        bus.write(addr, val, pc, countdown);
        cpu.s = cpu.s.wrapping_sub(1);
    }

    #[inline]
    fn pull(&mut self, cpu: &mut Cpu, bus: &mut Bus, countdown: &mut i64) -> u8 {
        cpu.s = cpu.s.wrapping_add(1);
        let addr = STACK_ADDR | cpu.s as u16;
        let pc = cpu.pc;
        bus.read(addr, pc, countdown)
    }

    /// Zero-page pointer read with page wrap-around.
    #[inline]
    fn read_zp_ptr(&mut self, cpu: &mut Cpu, bus: &mut Bus, countdown: &mut i64, zp: u8) -> u16 {
        let pc = cpu.pc;
        let lo = bus.read(zp as u16, pc, countdown) as u16;
        let hi = bus.read(zp.wrapping_add(1) as u16, pc, countdown) as u16;
        (hi << 8) | lo
    }

    // -----------------------------------------------------------------
    // Addressing
    // -----------------------------------------------------------------

    fn resolve_operand(
        &mut self,
        cpu: &mut Cpu,
        bus: &mut Bus,
        countdown: &mut i64,
        mode: OpMode,
        is_read: bool,
    ) -> Operand {
        match mode {
            OpMode::Nil => {
                *countdown -= 1;
                Operand::Implied
            }
            OpMode::Acc => {
                *countdown -= 1;
                Operand::Acc
            }
            OpMode::Imm | OpMode::Rel => {
                let v = self.fetch8(cpu, bus, countdown);
                Operand::Imm(v)
            }
            OpMode::Zpg => {
                let addr = self.fetch8(cpu, bus, countdown) as u16;
                Operand::Addr(addr)
            }
            OpMode::Zpx => {
                let base = self.fetch8(cpu, bus, countdown);
                *countdown -= 1;
                Operand::Addr(base.wrapping_add(cpu.x) as u16)
            }
            OpMode::Zpy => {
                let base = self.fetch8(cpu, bus, countdown);
                *countdown -= 1;
                Operand::Addr(base.wrapping_add(cpu.y) as u16)
            }
            OpMode::Abs => {
                let addr = self.fetch16(cpu, bus, countdown);
                Operand::Addr(addr)
            }
            OpMode::Abx => {
                let base = self.fetch16(cpu, bus, countdown);
                let addr = base.wrapping_add(cpu.x as u16);
                if !is_read || (base & 0xFF00) != (addr & 0xFF00) {
                    *countdown -= 1;
                }
                Operand::Addr(addr)
            }
            OpMode::Aby => {
                let base = self.fetch16(cpu, bus, countdown);
                let addr = base.wrapping_add(cpu.y as u16);
                if !is_read || (base & 0xFF00) != (addr & 0xFF00) {
                    *countdown -= 1;
                }
                Operand::Addr(addr)
            }
            OpMode::Idx => {
                let zp = self.fetch8(cpu, bus, countdown).wrapping_add(cpu.x);
                *countdown -= 1;
                let addr = self.read_zp_ptr(cpu, bus, countdown, zp);
                Operand::Addr(addr)
            }
            OpMode::Idy => {
                let zp = self.fetch8(cpu, bus, countdown);
                let base = self.read_zp_ptr(cpu, bus, countdown, zp);
                let addr = base.wrapping_add(cpu.y as u16);
                if !is_read || (base & 0xFF00) != (addr & 0xFF00) {
                    *countdown -= 1;
                }
                Operand::Addr(addr)
            }
            OpMode::Id => {
                let zp = self.fetch8(cpu, bus, countdown);
                let addr = self.read_zp_ptr(cpu, bus, countdown, zp);
                Operand::Addr(addr)
            }
            OpMode::Ind => {
                let ptr = self.fetch16(cpu, bus, countdown);
                let pc = cpu.pc;
                let lo = bus.read(ptr, pc, countdown) as u16;
                let hi_addr = match self.variant {
                    // The NMOS indirect jump never crosses the page for
                    // its high byte.
                    CpuVariant::Nmos => (ptr & 0xFF00) | (ptr.wrapping_add(1) & 0x00FF),
                    CpuVariant::Cmos => {
                        *countdown -= 1;
                        ptr.wrapping_add(1)
                    }
                };
                let hi = bus.read(hi_addr, pc, countdown) as u16;
                Operand::Addr((hi << 8) | lo)
            }
            OpMode::Iax => {
                let base = self.fetch16(cpu, bus, countdown).wrapping_add(cpu.x as u16);
                *countdown -= 1;
                let pc = cpu.pc;
                let lo = bus.read(base, pc, countdown) as u16;
                let hi = bus.read(base.wrapping_add(1), pc, countdown) as u16;
                Operand::Addr((hi << 8) | lo)
            }
        }
    }

    // -----------------------------------------------------------------
    // One instruction
    // -----------------------------------------------------------------

    fn execute_one(&mut self, cpu: &mut Cpu, bus: &mut Bus, countdown: &mut i64) -> OpType {
        let opcode = self.fetch8(cpu, bus, countdown);
        let (optype, mode, _) = defs::decode(self.variant, opcode);
        let mem = defs::mem_kind(optype);
        let is_read = mem == MemKind::Read;

        let operand = self.resolve_operand(cpu, bus, countdown, mode, is_read);

        // Load the value for read and read-modify-write operations.
        let value = match (operand, mem) {
            (Operand::Imm(v), _) => v,
            (Operand::Addr(addr), MemKind::Read | MemKind::ReadWrite) => {
                let pc = cpu.pc;
                bus.read(addr, pc, countdown)
            }
            (Operand::Acc, _) => cpu.a,
            _ => 0,
        };

        match optype {
            // -- Loads / stores / transfers --
            OpType::Lda => {
                cpu.a = value;
                cpu.update_zn(value);
            }
            OpType::Ldx => {
                cpu.x = value;
                cpu.update_zn(value);
            }
            OpType::Ldy => {
                cpu.y = value;
                cpu.update_zn(value);
            }
            OpType::Sta => {
                let v = cpu.a;
                self.store(cpu, bus, countdown, operand, v);
            }
            OpType::Stx => {
                let v = cpu.x;
                self.store(cpu, bus, countdown, operand, v);
            }
            OpType::Sty => {
                let v = cpu.y;
                self.store(cpu, bus, countdown, operand, v);
            }
            OpType::Stz => self.store(cpu, bus, countdown, operand, 0),
            OpType::Tax => {
                cpu.x = cpu.a;
                cpu.update_zn(cpu.x);
            }
            OpType::Tay => {
                cpu.y = cpu.a;
                cpu.update_zn(cpu.y);
            }
            OpType::Txa => {
                cpu.a = cpu.x;
                cpu.update_zn(cpu.a);
            }
            OpType::Tya => {
                cpu.a = cpu.y;
                cpu.update_zn(cpu.a);
            }
            OpType::Tsx => {
                cpu.x = cpu.s;
                cpu.update_zn(cpu.x);
            }
            OpType::Txs => cpu.s = cpu.x,

            // -- ALU --
            OpType::Ora => {
                cpu.a |= value;
                cpu.update_zn(cpu.a);
            }
            OpType::And => {
                cpu.a &= value;
                cpu.update_zn(cpu.a);
            }
            OpType::Eor => {
                cpu.a ^= value;
                cpu.update_zn(cpu.a);
            }
            OpType::Adc => self.adc(cpu, countdown, value),
            OpType::Sbc => self.sbc(cpu, countdown, value),
            OpType::Cmp => {
                let reg = cpu.a;
                self.compare(cpu, reg, value);
            }
            OpType::Cpx => {
                let reg = cpu.x;
                self.compare(cpu, reg, value);
            }
            OpType::Cpy => {
                let reg = cpu.y;
                self.compare(cpu, reg, value);
            }
            OpType::Bit => {
                cpu.flag_z = (cpu.a & value) == 0;
                if mode != OpMode::Imm {
                    cpu.flag_n = (value & 0x80) != 0;
                    cpu.flag_v = (value & 0x40) != 0;
                }
            }

            // -- Increment / decrement --
            OpType::Inx => {
                cpu.x = cpu.x.wrapping_add(1);
                cpu.update_zn(cpu.x);
            }
            OpType::Iny => {
                cpu.y = cpu.y.wrapping_add(1);
                cpu.update_zn(cpu.y);
            }
            OpType::Dex => {
                cpu.x = cpu.x.wrapping_sub(1);
                cpu.update_zn(cpu.x);
            }
            OpType::Dey => {
                cpu.y = cpu.y.wrapping_sub(1);
                cpu.update_zn(cpu.y);
            }
            OpType::Inc => {
                let result = value.wrapping_add(1);
                self.modify(cpu, bus, countdown, operand, value, result);
                cpu.update_zn(result);
            }
            OpType::Dec => {
                let result = value.wrapping_sub(1);
                self.modify(cpu, bus, countdown, operand, value, result);
                cpu.update_zn(result);
            }

            // -- Shifts / rotates --
            OpType::Asl => {
                let result = value << 1;
                cpu.flag_c = (value & 0x80) != 0;
                self.modify(cpu, bus, countdown, operand, value, result);
                cpu.update_zn(result);
            }
            OpType::Lsr => {
                let result = value >> 1;
                cpu.flag_c = (value & 0x01) != 0;
                self.modify(cpu, bus, countdown, operand, value, result);
                cpu.update_zn(result);
            }
            OpType::Rol => {
                let result = (value << 1) | cpu.flag_c as u8;
                cpu.flag_c = (value & 0x80) != 0;
                self.modify(cpu, bus, countdown, operand, value, result);
                cpu.update_zn(result);
            }
            OpType::Ror => {
                let result = (value >> 1) | ((cpu.flag_c as u8) << 7);
                cpu.flag_c = (value & 0x01) != 0;
                self.modify(cpu, bus, countdown, operand, value, result);
                cpu.update_zn(result);
            }

            // -- Flags --
            OpType::Clc => cpu.flag_c = false,
            OpType::Sec => cpu.flag_c = true,
            OpType::Cli => cpu.flag_i = false,
            OpType::Sei => cpu.flag_i = true,
            OpType::Cld => cpu.flag_d = false,
            OpType::Sed => cpu.flag_d = true,
            OpType::Clv => cpu.flag_v = false,

            // -- Stack --
            OpType::Pha => {
                let v = cpu.a;
                self.push(cpu, bus, countdown, v);
            }
            OpType::Php => {
                let flags = cpu.flags_byte(true);
                self.push(cpu, bus, countdown, flags);
            }
            OpType::Phx => {
                let v = cpu.x;
                self.push(cpu, bus, countdown, v);
            }
            OpType::Phy => {
                let v = cpu.y;
                self.push(cpu, bus, countdown, v);
            }
            OpType::Pla => {
                *countdown -= 1;
                cpu.a = self.pull(cpu, bus, countdown);
                cpu.update_zn(cpu.a);
            }
            OpType::Plx => {
                *countdown -= 1;
                cpu.x = self.pull(cpu, bus, countdown);
                cpu.update_zn(cpu.x);
            }
            OpType::Ply => {
                *countdown -= 1;
                cpu.y = self.pull(cpu, bus, countdown);
                cpu.update_zn(cpu.y);
            }
            OpType::Plp => {
                *countdown -= 1;
                let flags = self.pull(cpu, bus, countdown);
                cpu.set_flags_byte(flags);
            }

            // -- Control flow --
            OpType::Jmp => {
                if let Operand::Addr(addr) = operand {
                    cpu.pc = addr;
                }
            }
            OpType::Jsr => {
                if let Operand::Addr(addr) = operand {
                    *countdown -= 1;
                    let ret = cpu.pc.wrapping_sub(1);
                    self.push(cpu, bus, countdown, (ret >> 8) as u8);
                    self.push(cpu, bus, countdown, ret as u8);
                    cpu.pc = addr;
                }
            }
            OpType::Rts => {
                *countdown -= 1;
                let lo = self.pull(cpu, bus, countdown) as u16;
                let hi = self.pull(cpu, bus, countdown) as u16;
                cpu.pc = ((hi << 8) | lo).wrapping_add(1);
                *countdown -= 1;
            }
            OpType::Rti => {
                *countdown -= 1;
                let flags = self.pull(cpu, bus, countdown);
                cpu.set_flags_byte(flags);
                let lo = self.pull(cpu, bus, countdown) as u16;
                let hi = self.pull(cpu, bus, countdown) as u16;
                cpu.pc = (hi << 8) | lo;
            }
            OpType::Brk => {
                // BRK skips a padding byte; the implied-mode dummy read
                // already paid for its cycle.
                cpu.pc = cpu.pc.wrapping_add(1);
                let pch = (cpu.pc >> 8) as u8;
                let pcl = cpu.pc as u8;
                self.push(cpu, bus, countdown, pch);
                self.push(cpu, bus, countdown, pcl);
                let flags = cpu.flags_byte(true);
                self.push(cpu, bus, countdown, flags);
                cpu.flag_i = true;
                if self.variant == CpuVariant::Cmos {
                    cpu.flag_d = false;
                }
                let pc = cpu.pc;
                let lo = bus.read(VECTOR_IRQ, pc, countdown) as u16;
                let hi = bus.read(VECTOR_IRQ + 1, pc, countdown) as u16;
                cpu.pc = (hi << 8) | lo;
            }
            OpType::Bpl => {
                let take = !cpu.flag_n;
                self.branch(cpu, countdown, operand, take);
            }
            OpType::Bmi => {
                let take = cpu.flag_n;
                self.branch(cpu, countdown, operand, take);
            }
            OpType::Bvc => {
                let take = !cpu.flag_v;
                self.branch(cpu, countdown, operand, take);
            }
            OpType::Bvs => {
                let take = cpu.flag_v;
                self.branch(cpu, countdown, operand, take);
            }
            OpType::Bcc => {
                let take = !cpu.flag_c;
                self.branch(cpu, countdown, operand, take);
            }
            OpType::Bcs => {
                let take = cpu.flag_c;
                self.branch(cpu, countdown, operand, take);
            }
            OpType::Bne => {
                let take = !cpu.flag_z;
                self.branch(cpu, countdown, operand, take);
            }
            OpType::Beq => {
                let take = cpu.flag_z;
                self.branch(cpu, countdown, operand, take);
            }
            OpType::Bra => self.branch(cpu, countdown, operand, true),

            OpType::Nop => {}
            OpType::Kil => {
                log::warn!("unimplemented: KIL opcode {:02X}, halting", opcode);
                cpu.halted = true;
            }

            // -- 65C12 bit testers --
            OpType::Tsb => {
                cpu.flag_z = (cpu.a & value) == 0;
                let result = value | cpu.a;
                self.modify(cpu, bus, countdown, operand, value, result);
            }
            OpType::Trb => {
                cpu.flag_z = (cpu.a & value) == 0;
                let result = value & !cpu.a;
                self.modify(cpu, bus, countdown, operand, value, result);
            }

            // -- Undocumented NMOS --
            OpType::Lax => {
                cpu.a = value;
                cpu.x = value;
                cpu.update_zn(value);
            }
            OpType::Sax => {
                let v = cpu.a & cpu.x;
                self.store(cpu, bus, countdown, operand, v);
            }
            OpType::Slo => {
                let result = value << 1;
                cpu.flag_c = (value & 0x80) != 0;
                self.modify(cpu, bus, countdown, operand, value, result);
                cpu.a |= result;
                cpu.update_zn(cpu.a);
            }
            OpType::Rla => {
                let result = (value << 1) | cpu.flag_c as u8;
                cpu.flag_c = (value & 0x80) != 0;
                self.modify(cpu, bus, countdown, operand, value, result);
                cpu.a &= result;
                cpu.update_zn(cpu.a);
            }
            OpType::Sre => {
                let result = value >> 1;
                cpu.flag_c = (value & 0x01) != 0;
                self.modify(cpu, bus, countdown, operand, value, result);
                cpu.a ^= result;
                cpu.update_zn(cpu.a);
            }
            OpType::Rra => {
                let result = (value >> 1) | ((cpu.flag_c as u8) << 7);
                cpu.flag_c = (value & 0x01) != 0;
                self.modify(cpu, bus, countdown, operand, value, result);
                self.adc(cpu, countdown, result);
            }
            OpType::Dcp => {
                let result = value.wrapping_sub(1);
                self.modify(cpu, bus, countdown, operand, value, result);
                let reg = cpu.a;
                self.compare(cpu, reg, result);
            }
            OpType::Isc => {
                let result = value.wrapping_add(1);
                self.modify(cpu, bus, countdown, operand, value, result);
                self.sbc(cpu, countdown, result);
            }
            OpType::Anc => {
                cpu.a &= value;
                cpu.update_zn(cpu.a);
                cpu.flag_c = cpu.flag_n;
            }
            OpType::Alr => {
                cpu.a &= value;
                cpu.flag_c = (cpu.a & 0x01) != 0;
                cpu.a >>= 1;
                cpu.update_zn(cpu.a);
            }
            OpType::Arr => {
                let and = cpu.a & value;
                cpu.a = (and >> 1) | ((cpu.flag_c as u8) << 7);
                cpu.update_zn(cpu.a);
                cpu.flag_c = (cpu.a & 0x40) != 0;
                cpu.flag_v = (((cpu.a >> 6) ^ (cpu.a >> 5)) & 1) != 0;
            }
            OpType::Axs => {
                let base = cpu.a & cpu.x;
                cpu.flag_c = base >= value;
                cpu.x = base.wrapping_sub(value);
                cpu.update_zn(cpu.x);
            }
            OpType::Xaa => {
                cpu.a = (cpu.a | 0xEE) & cpu.x & value;
                cpu.update_zn(cpu.a);
            }
            OpType::Las => {
                let result = value & cpu.s;
                cpu.a = result;
                cpu.x = result;
                cpu.s = result;
                cpu.update_zn(result);
            }
            OpType::Ahx => {
                let v = cpu.a & cpu.x & self.addr_hi_plus_1(operand);
                self.store(cpu, bus, countdown, operand, v);
            }
            OpType::Shx => {
                let v = cpu.x & self.addr_hi_plus_1(operand);
                self.store(cpu, bus, countdown, operand, v);
            }
            OpType::Shy => {
                let v = cpu.y & self.addr_hi_plus_1(operand);
                self.store(cpu, bus, countdown, operand, v);
            }
            OpType::Tas => {
                cpu.s = cpu.a & cpu.x;
                let v = cpu.s & self.addr_hi_plus_1(operand);
                self.store(cpu, bus, countdown, operand, v);
            }
        }

        optype
    }

    // -----------------------------------------------------------------
    // Operation helpers
    // -----------------------------------------------------------------

    fn store(&mut self, cpu: &mut Cpu, bus: &mut Bus, countdown: &mut i64, operand: Operand, val: u8) {
        if let Some(addr) = operand.addr() {
            let pc = cpu.pc;
            bus.write(addr, val, pc, countdown);
        }
    }

    /// Writeback for RMW operations: the NMOS parts write the unmodified
    /// value first, the CMOS parts spend the cycle re-reading.
    fn modify(
        &mut self,
        cpu: &mut Cpu,
        bus: &mut Bus,
        countdown: &mut i64,
        operand: Operand,
        old: u8,
        new: u8,
    ) {
        match operand.addr() {
            Some(addr) => {
                let pc = cpu.pc;
                match self.variant {
                    CpuVariant::Nmos => bus.write(addr, old, pc, countdown),
                    CpuVariant::Cmos => *countdown -= 1,
                }
                bus.write(addr, new, pc, countdown);
            }
            None => cpu.a = new,
        }
    }

    fn branch(&mut self, cpu: &mut Cpu, countdown: &mut i64, operand: Operand, take: bool) {
        let offset = operand.imm().unwrap_or(0) as i8;
        if !take {
            return;
        }
        *countdown -= 1;
        let target = cpu.pc.wrapping_add(offset as u16);
        if (target & 0xFF00) != (cpu.pc & 0xFF00) {
            *countdown -= 1;
        }
        cpu.pc = target;
    }

    fn compare(&mut self, cpu: &mut Cpu, reg: u8, value: u8) {
        cpu.flag_c = reg >= value;
        cpu.update_zn(reg.wrapping_sub(value));
    }

    fn adc(&mut self, cpu: &mut Cpu, countdown: &mut i64, value: u8) {
        if cpu.flag_d {
            self.adc_bcd(cpu, countdown, value);
            return;
        }
        let a = cpu.a;
        let carry = cpu.flag_c as u16;
        let sum = a as u16 + value as u16 + carry;
        cpu.flag_c = sum > 0xFF;
        cpu.flag_v = ((a ^ sum as u8) & (value ^ sum as u8) & 0x80) != 0;
        cpu.a = sum as u8;
        cpu.update_zn(cpu.a);
    }

    fn adc_bcd(&mut self, cpu: &mut Cpu, countdown: &mut i64, value: u8) {
        let a = cpu.a;
        let carry = cpu.flag_c as u8;

        let binary = a.wrapping_add(value).wrapping_add(carry);
        let mut lo = (a & 0x0F) + (value & 0x0F) + carry;
        if lo > 9 {
            lo += 6;
        }
        let mut hi = (a >> 4) + (value >> 4) + (lo > 0x0F) as u8;

        // NMOS: N/V come from the intermediate sum, Z from the binary one.
        cpu.flag_z = binary == 0;
        cpu.flag_n = (hi & 0x08) != 0;
        cpu.flag_v = ((a ^ value) & 0x80) == 0 && ((a ^ (hi << 4)) & 0x80) != 0;

        if hi > 9 {
            hi += 6;
        }
        cpu.flag_c = hi > 0x0F;
        cpu.a = (hi << 4) | (lo & 0x0F);

        if self.variant == CpuVariant::Cmos {
            // The 65C12 spends an extra cycle and produces valid NZ.
            *countdown -= 1;
            let a = cpu.a;
            cpu.update_zn(a);
        }
    }

    fn sbc(&mut self, cpu: &mut Cpu, countdown: &mut i64, value: u8) {
        if cpu.flag_d {
            self.sbc_bcd(cpu, countdown, value);
            return;
        }
        let a = cpu.a;
        let borrow = !cpu.flag_c as i16;
        let diff = a as i16 - value as i16 - borrow;
        cpu.flag_c = diff >= 0;
        let result = diff as u8;
        cpu.flag_v = ((a ^ value) & (a ^ result) & 0x80) != 0;
        cpu.a = result;
        cpu.update_zn(result);
    }

    fn sbc_bcd(&mut self, cpu: &mut Cpu, countdown: &mut i64, value: u8) {
        let a = cpu.a;
        let borrow = !cpu.flag_c as i16;

        // All flags come from the binary subtraction on NMOS.
        let diff = a as i16 - value as i16 - borrow;
        let binary = diff as u8;
        cpu.flag_v = ((a ^ value) & (a ^ binary) & 0x80) != 0;
        cpu.flag_c = diff >= 0;
        cpu.update_zn(binary);

        let mut lo = (a & 0x0F) as i16 - (value & 0x0F) as i16 - borrow;
        let mut hi = (a >> 4) as i16 - (value >> 4) as i16;
        if lo < 0 {
            lo -= 6;
            hi -= 1;
        }
        if hi < 0 {
            hi -= 6;
        }
        cpu.a = ((hi as u8) << 4) | (lo as u8 & 0x0F);

        if self.variant == CpuVariant::Cmos {
            *countdown -= 1;
            let a = cpu.a;
            cpu.update_zn(a);
        }
    }

    fn addr_hi_plus_1(&self, operand: Operand) -> u8 {
        match operand.addr() {
            Some(addr) => ((addr >> 8) as u8).wrapping_add(1),
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::machine_with_program;

    #[test]
    fn lda_imm_sets_flags_and_cycles() {
        let (mut interp, mut cpu, mut bus) = machine_with_program(&[0xA9, 0x80, 0x02]);
        let start = cpu.cycles;
        interp.run(&mut cpu, &mut bus, 1);
        assert_eq!(cpu.a, 0x80);
        assert!(cpu.flag_n);
        assert!(!cpu.flag_z);
        assert_eq!(cpu.cycles - start, 2);
    }

    #[test]
    fn page_crossing_read_costs_one_more() {
        // LDX #1; LDA $20FF,X (crosses); KIL
        let (mut interp, mut cpu, mut bus) =
            machine_with_program(&[0xA2, 0x01, 0xBD, 0xFF, 0x20, 0x02]);
        let start = cpu.cycles;
        interp.run(&mut cpu, &mut bus, 1000);
        // 2 (LDX) + 5 (LDA abs,X crossed) + 2 (KIL).
        assert_eq!(cpu.cycles - start, 9);

        // Same without crossing.
        let (mut interp, mut cpu, mut bus) =
            machine_with_program(&[0xA2, 0x01, 0xBD, 0x00, 0x20, 0x02]);
        let start = cpu.cycles;
        interp.run(&mut cpu, &mut bus, 1000);
        assert_eq!(cpu.cycles - start, 8);
    }

    #[test]
    fn branch_taken_and_crossing_penalties() {
        // BEQ +0 (taken, no cross): 3 cycles, then KIL.
        let (mut interp, mut cpu, mut bus) = machine_with_program(&[0xF0, 0x00, 0x02]);
        cpu.flag_z = true;
        let start = cpu.cycles;
        interp.run(&mut cpu, &mut bus, 1000);
        assert_eq!(cpu.cycles - start, 3 + 2);

        // Not taken: 2 cycles.
        let (mut interp, mut cpu, mut bus) = machine_with_program(&[0xF0, 0x10, 0x02]);
        cpu.flag_z = false;
        let start = cpu.cycles;
        interp.run(&mut cpu, &mut bus, 1000);
        assert_eq!(cpu.cycles - start, 2 + 2);
    }

    #[test]
    fn adc_binary_carry_and_overflow() {
        let (mut interp, mut cpu, mut bus) =
            machine_with_program(&[0x18, 0xA9, 0x50, 0x69, 0x50, 0x02]);
        interp.run(&mut cpu, &mut bus, 1000);
        assert_eq!(cpu.a, 0xA0);
        assert!(cpu.flag_v);
        assert!(!cpu.flag_c);
        assert!(cpu.flag_n);
    }

    #[test]
    fn adc_bcd() {
        // SED; CLC; LDA #$19; ADC #$03 -> 0x22 decimal.
        let (mut interp, mut cpu, mut bus) =
            machine_with_program(&[0xF8, 0x18, 0xA9, 0x19, 0x69, 0x03, 0x02]);
        interp.run(&mut cpu, &mut bus, 1000);
        assert_eq!(cpu.a, 0x22);
        assert!(!cpu.flag_c);
    }

    #[test]
    fn sbc_bcd() {
        // SED; SEC; LDA #$22; SBC #$03 -> 0x19 decimal.
        let (mut interp, mut cpu, mut bus) =
            machine_with_program(&[0xF8, 0x38, 0xA9, 0x22, 0xE9, 0x03, 0x02]);
        interp.run(&mut cpu, &mut bus, 1000);
        assert_eq!(cpu.a, 0x19);
        assert!(cpu.flag_c);
    }

    #[test]
    fn jsr_rts_round_trip() {
        // JSR $1910; KIL ... at $1910: LDA #$42; RTS
        let (mut interp, mut cpu, mut bus) = machine_with_program(&[0x20, 0x10, 0x19, 0x02]);
        bus.poke(0x1910, 0xA9);
        bus.poke(0x1911, 0x42);
        bus.poke(0x1912, 0x60);
        let start = cpu.cycles;
        interp.run(&mut cpu, &mut bus, 1000);
        assert_eq!(cpu.a, 0x42);
        assert!(cpu.halted);
        // JSR 6 + LDA 2 + RTS 6 + KIL 2.
        assert_eq!(cpu.cycles - start, 16);
    }

    #[test]
    fn stack_wraps_in_page_one() {
        let (mut interp, mut cpu, mut bus) = machine_with_program(&[0x48, 0x02]);
        cpu.s = 0x00;
        cpu.a = 0x77;
        interp.run(&mut cpu, &mut bus, 1000);
        assert_eq!(bus.peek(0x0100), 0x77);
        assert_eq!(cpu.s, 0xFF);
    }

    #[test]
    fn indirect_jmp_page_bug() {
        // JMP ($18FF): low byte from $18FF, high byte from $1800.
        let (mut interp, mut cpu, mut bus) = machine_with_program(&[0x6C, 0xFF, 0x18]);
        bus.poke(0x18FF, 0x02); // low -> a KIL at 0x1902
        bus.poke(0x1800, 0x19);
        bus.poke(0x1902, 0x02);
        interp.run(&mut cpu, &mut bus, 1000);
        assert!(cpu.halted);
        assert_eq!(cpu.pc, 0x1903);
    }

    #[test]
    fn undocumented_lax_and_dcp() {
        // LAX $40; DCP $41; KIL
        let (mut interp, mut cpu, mut bus) = machine_with_program(&[0xA7, 0x40, 0xC7, 0x41, 0x02]);
        bus.poke(0x0040, 0x5A);
        bus.poke(0x0041, 0x5B);
        interp.run(&mut cpu, &mut bus, 1000);
        assert_eq!(cpu.a, 0x5A);
        assert_eq!(cpu.x, 0x5A);
        assert_eq!(bus.peek(0x0041), 0x5A);
        assert!(cpu.flag_c && !cpu.flag_z);
    }

    #[test]
    fn irq_enters_vector_with_b_clear() {
        let (mut interp, mut cpu, mut bus) = machine_with_program(&[0x58, 0xEA, 0xEA, 0xEA]);
        // IRQ handler at 0x3000: KIL.
        bus.poke(0x3000, 0x02);
        bus.irqs.set_level(crate::bus::IrqSource::Serial, true);

        interp.run(&mut cpu, &mut bus, 1000);
        assert!(cpu.halted);
        // Pushed flags have B clear.
        let pushed = bus.peek(0x0100 | (cpu.s.wrapping_add(1)) as u16);
        assert_eq!(pushed & crate::cpu::defs::FLAG_BRK, 0);
        assert!(cpu.flag_i);
    }

    #[test]
    fn cli_irq_latency_is_one_instruction() {
        // I is set from power-on. CLI; INX; INX; INX.
        let (mut interp, mut cpu, mut bus) = machine_with_program(&[0x58, 0xE8, 0xE8, 0xE8]);
        bus.poke(0x3000, 0x02); // handler: KIL
        cpu.x = 0;
        bus.irqs.set_level(crate::bus::IrqSource::Serial, true);

        interp.run(&mut cpu, &mut bus, 1000);
        assert!(cpu.halted);
        // Exactly one instruction executed after CLI.
        assert_eq!(cpu.x, 1);
    }

    #[test]
    fn nmi_edge_beats_irq_and_ignores_i() {
        let (mut interp, mut cpu, mut bus) = machine_with_program(&[0xEA, 0xEA]);
        bus.poke(0x2800, 0x02); // NMI handler: KIL
        bus.poke(0x3000, 0xEA); // IRQ handler (must not run)
        // I is set from power-on; NMI must still be taken.
        bus.irqs.set_nmi(true);
        interp.run(&mut cpu, &mut bus, 1000);
        assert!(cpu.halted);
        assert_eq!(cpu.pc, 0x2801);
    }
}
