/*!
inturbo.rs - Table-generated opcode templates; not a compiler.

At init, each of the 256 opcodes gets a fixed-shape plan: operation,
addressing mode, base cycle cost and preflight flags. Dispatch is an
indirect fetch through that table; each template performs addressing,
the MMIO-range test, the operation, the NZ update and the PC advance,
then charges its cycle cost in one subtraction.

Templates only run against plain memory, which is what makes the lumped
cycle charge safe: RAM accesses cannot observe sub-instruction time.
Anything that can - an effective address inside the MMIO window - and
the genuinely awkward cases (BCD arithmetic once the D flag is set,
interrupt-unmasking instructions, BRK, the undocumented set) restore the
instruction start state and bounce to the interpreter, which handles
them with full per-cycle fidelity.
*/

use crate::bus::Bus;
use crate::cpu::defs::{self, CpuVariant, MemKind, OpMode, OpType, STACK_ADDR};
use crate::cpu::interp::{DebugHook, Interp, now};
use crate::cpu::state::Cpu;

/// One generated opcode template.
#[derive(Clone, Copy)]
struct Plan {
    optype: OpType,
    mode: OpMode,
    cycles: u8,
    /// Always handled by the interpreter.
    bounce: bool,
    /// Bounces only while the D flag is set.
    check_bcd: bool,
}

pub struct Inturbo {
    variant: CpuVariant,
    plans: Box<[Plan; 256]>,
    interp: Interp,
    debug_hook: Option<DebugHook>,
}

fn build_plan(variant: CpuVariant, opcode: u8) -> Plan {
    let (optype, mode, cycles) = defs::decode(variant, opcode);

    // Preflight checks that send an opcode straight to the interpreter.
    let bounce = matches!(
        optype,
        OpType::Brk
            | OpType::Rti
            | OpType::Cli
            | OpType::Sei
            | OpType::Plp
            | OpType::Kil
            | OpType::Sax
            | OpType::Alr
            | OpType::Slo
            | OpType::Shy
            | OpType::Anc
            | OpType::Lax
            | OpType::Dcp
            | OpType::Sre
            | OpType::Rla
            | OpType::Ahx
            | OpType::Xaa
            | OpType::Rra
            | OpType::Axs
            | OpType::Isc
            | OpType::Arr
            | OpType::Tas
            | OpType::Las
            | OpType::Shx
    );
    let check_bcd = matches!(optype, OpType::Adc | OpType::Sbc);

    Plan {
        optype,
        mode,
        cycles,
        bounce,
        check_bcd,
    }
}

impl Inturbo {
    pub fn new(variant: CpuVariant) -> Inturbo {
        let plans: Vec<Plan> = (0..=255u8).map(|op| build_plan(variant, op)).collect();
        let plans: Box<[Plan; 256]> = plans.into_boxed_slice().try_into().map_err(|_| ()).unwrap();
        Inturbo {
            variant,
            plans,
            interp: Interp::new(variant),
            debug_hook: None,
        }
    }

    pub fn set_debug_hook(&mut self, hook: DebugHook) {
        self.debug_hook = Some(hook);
    }

    pub fn reset(&self, cpu: &mut Cpu, bus: &mut Bus) {
        self.interp.reset(cpu, bus);
    }

    pub fn run(&mut self, cpu: &mut Cpu, bus: &mut Bus, max_cycles: u64) {
        let target = cpu.cycles + max_cycles;
        let mut countdown = bus.timing.countdown();
        while !cpu.halted && cpu.cycles < target && !bus.exit_requested() {
            self.single_step(cpu, bus, &mut countdown);
        }
        bus.advance_time(countdown);
    }

    pub fn single_step(&mut self, cpu: &mut Cpu, bus: &mut Bus, countdown: &mut i64) {
        if let Some(hook) = self.debug_hook.as_mut() {
            hook(cpu);
        }

        // Opcode peek without a PC advance; the template or the
        // interpreter performs the real fetch.
        let opcode = bus.peek(cpu.pc);
        let plan = self.plans[opcode as usize];

        if plan.bounce || (plan.check_bcd && cpu.flag_d) {
            self.interp.single_step(cpu, bus, countdown);
            return;
        }

        let before = now(bus, *countdown);
        if !self.exec_template(cpu, bus, countdown, plan) {
            // The template hit the MMIO window: replay under the
            // interpreter with per-cycle accuracy.
            self.interp.single_step(cpu, bus, countdown);
            return;
        }

        if *countdown <= 0 {
            *countdown = bus.advance_time(*countdown);
        }
        // The template set never unmasks interrupts, so the live I flag
        // is the correct poll mask.
        if bus.irqs.take_nmi_edge() {
            self.interp
                .service_interrupt(cpu, bus, countdown, defs::VECTOR_NMI);
        } else if bus.irqs.asserted() && !cpu.flag_i {
            self.interp
                .service_interrupt(cpu, bus, countdown, defs::VECTOR_IRQ);
        }

        cpu.cycles += now(bus, *countdown) - before;
    }

    /// Run one template. Returns false (with CPU state unchanged) when
    /// the access belongs on the interpreter's MMIO path.
    fn exec_template(&mut self, cpu: &mut Cpu, bus: &mut Bus, countdown: &mut i64, plan: Plan) -> bool {
        let pc0 = cpu.pc;
        let mem = &mut bus.mem;
        let mut pc = pc0.wrapping_add(1);
        let mut penalty = 0u8;

        // Addressing-mode computation into the scratch address.
        let mut scratch: u16 = 0;
        let mut imm: u8 = 0;
        let is_read = defs::mem_kind(plan.optype) == MemKind::Read;

        match plan.mode {
            OpMode::Nil | OpMode::Acc => {}
            OpMode::Imm | OpMode::Rel => {
                imm = mem.read(pc, pc0);
                pc = pc.wrapping_add(1);
            }
            OpMode::Zpg => {
                scratch = mem.read(pc, pc0) as u16;
                pc = pc.wrapping_add(1);
            }
            OpMode::Zpx => {
                scratch = mem.read(pc, pc0).wrapping_add(cpu.x) as u16;
                pc = pc.wrapping_add(1);
            }
            OpMode::Zpy => {
                scratch = mem.read(pc, pc0).wrapping_add(cpu.y) as u16;
                pc = pc.wrapping_add(1);
            }
            OpMode::Abs | OpMode::Abx | OpMode::Aby => {
                let lo = mem.read(pc, pc0) as u16;
                let hi = mem.read(pc.wrapping_add(1), pc0) as u16;
                pc = pc.wrapping_add(2);
                let base = (hi << 8) | lo;
                let index = match plan.mode {
                    OpMode::Abx => cpu.x as u16,
                    OpMode::Aby => cpu.y as u16,
                    _ => 0,
                };
                scratch = base.wrapping_add(index);
                if plan.mode != OpMode::Abs
                    && is_read
                    && (base & 0xFF00) != (scratch & 0xFF00)
                {
                    penalty += 1;
                }
            }
            OpMode::Idx => {
                let zp = mem.read(pc, pc0).wrapping_add(cpu.x);
                pc = pc.wrapping_add(1);
                let lo = mem.read(zp as u16, pc0) as u16;
                let hi = mem.read(zp.wrapping_add(1) as u16, pc0) as u16;
                scratch = (hi << 8) | lo;
            }
            OpMode::Idy => {
                let zp = mem.read(pc, pc0);
                pc = pc.wrapping_add(1);
                let lo = mem.read(zp as u16, pc0) as u16;
                let hi = mem.read(zp.wrapping_add(1) as u16, pc0) as u16;
                let base = (hi << 8) | lo;
                scratch = base.wrapping_add(cpu.y as u16);
                if is_read && (base & 0xFF00) != (scratch & 0xFF00) {
                    penalty += 1;
                }
            }
            OpMode::Id => {
                let zp = mem.read(pc, pc0);
                pc = pc.wrapping_add(1);
                let lo = mem.read(zp as u16, pc0) as u16;
                let hi = mem.read(zp.wrapping_add(1) as u16, pc0) as u16;
                scratch = (hi << 8) | lo;
            }
            OpMode::Ind => {
                let lo = mem.read(pc, pc0) as u16;
                let hi = mem.read(pc.wrapping_add(1), pc0) as u16;
                pc = pc.wrapping_add(2);
                let ptr = (hi << 8) | lo;
                let hi_addr = match self.variant {
                    CpuVariant::Nmos => (ptr & 0xFF00) | (ptr.wrapping_add(1) & 0x00FF),
                    CpuVariant::Cmos => ptr.wrapping_add(1),
                };
                // The pointer fetch itself is a bus access.
                if Bus::needs_callback(ptr) || Bus::needs_callback(hi_addr) {
                    return false;
                }
                scratch = (mem.read(ptr, pc0) as u16) | ((mem.read(hi_addr, pc0) as u16) << 8);
            }
            OpMode::Iax => {
                let lo = mem.read(pc, pc0) as u16;
                let hi = mem.read(pc.wrapping_add(1), pc0) as u16;
                pc = pc.wrapping_add(2);
                let ptr = ((hi << 8) | lo).wrapping_add(cpu.x as u16);
                if Bus::needs_callback(ptr) || Bus::needs_callback(ptr.wrapping_add(1)) {
                    return false;
                }
                scratch =
                    (mem.read(ptr, pc0) as u16) | ((mem.read(ptr.wrapping_add(1), pc0) as u16) << 8);
            }
        }

        // The MMIO-range test: branch out to the callback path.
        let touches_mem = defs::mem_kind(plan.optype) != MemKind::None
            && !matches!(plan.mode, OpMode::Nil | OpMode::Acc | OpMode::Imm | OpMode::Rel);
        if touches_mem && Bus::needs_callback(scratch) {
            return false;
        }

        let value = if matches!(plan.mode, OpMode::Imm) {
            imm
        } else if matches!(plan.mode, OpMode::Acc) {
            cpu.a
        } else if touches_mem
            && matches!(
                defs::mem_kind(plan.optype),
                MemKind::Read | MemKind::ReadWrite
            )
        {
            mem.read(scratch, pc0)
        } else {
            0
        };

        // The operation itself, with the NZ update folded in.
        match plan.optype {
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
            OpType::Sta => mem.write(scratch, cpu.a, pc0),
            OpType::Stx => mem.write(scratch, cpu.x, pc0),
            OpType::Sty => mem.write(scratch, cpu.y, pc0),
            OpType::Stz => mem.write(scratch, 0, pc0),
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
            OpType::Adc => {
                // D clear, checked in the preflight.
                let a = cpu.a;
                let sum = a as u16 + value as u16 + cpu.flag_c as u16;
                cpu.flag_c = sum > 0xFF;
                cpu.flag_v = ((a ^ sum as u8) & (value ^ sum as u8) & 0x80) != 0;
                cpu.a = sum as u8;
                cpu.update_zn(cpu.a);
            }
            OpType::Sbc => {
                let a = cpu.a;
                let diff = a as i16 - value as i16 - (!cpu.flag_c) as i16;
                cpu.flag_c = diff >= 0;
                let result = diff as u8;
                cpu.flag_v = ((a ^ value) & (a ^ result) & 0x80) != 0;
                cpu.a = result;
                cpu.update_zn(result);
            }
            OpType::Cmp => {
                cpu.flag_c = cpu.a >= value;
                cpu.update_zn(cpu.a.wrapping_sub(value));
            }
            OpType::Cpx => {
                cpu.flag_c = cpu.x >= value;
                cpu.update_zn(cpu.x.wrapping_sub(value));
            }
            OpType::Cpy => {
                cpu.flag_c = cpu.y >= value;
                cpu.update_zn(cpu.y.wrapping_sub(value));
            }
            OpType::Bit => {
                cpu.flag_z = (cpu.a & value) == 0;
                if plan.mode != OpMode::Imm {
                    cpu.flag_n = (value & 0x80) != 0;
                    cpu.flag_v = (value & 0x40) != 0;
                }
            }
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
            OpType::Inc | OpType::Dec | OpType::Asl | OpType::Lsr | OpType::Rol | OpType::Ror
            | OpType::Tsb | OpType::Trb => {
                let result = match plan.optype {
                    OpType::Inc => value.wrapping_add(1),
                    OpType::Dec => value.wrapping_sub(1),
                    OpType::Asl => {
                        cpu.flag_c = (value & 0x80) != 0;
                        value << 1
                    }
                    OpType::Lsr => {
                        cpu.flag_c = (value & 0x01) != 0;
                        value >> 1
                    }
                    OpType::Rol => {
                        let c = cpu.flag_c as u8;
                        cpu.flag_c = (value & 0x80) != 0;
                        (value << 1) | c
                    }
                    OpType::Ror => {
                        let c = (cpu.flag_c as u8) << 7;
                        cpu.flag_c = (value & 0x01) != 0;
                        (value >> 1) | c
                    }
                    OpType::Tsb => {
                        cpu.flag_z = (cpu.a & value) == 0;
                        value | cpu.a
                    }
                    OpType::Trb => {
                        cpu.flag_z = (cpu.a & value) == 0;
                        value & !cpu.a
                    }
                    _ => unreachable!(),
                };
                if plan.mode == OpMode::Acc {
                    cpu.a = result;
                } else {
                    mem.write(scratch, result, pc0);
                }
                if !matches!(plan.optype, OpType::Tsb | OpType::Trb) {
                    cpu.update_zn(result);
                }
            }
            OpType::Clc => cpu.flag_c = false,
            OpType::Sec => cpu.flag_c = true,
            OpType::Cld => cpu.flag_d = false,
            OpType::Sed => cpu.flag_d = true,
            OpType::Clv => cpu.flag_v = false,
            OpType::Pha => {
                mem.write(STACK_ADDR | cpu.s as u16, cpu.a, pc0);
                cpu.s = cpu.s.wrapping_sub(1);
            }
            OpType::Php => {
                let flags = cpu.flags_byte(true);
                mem.write(STACK_ADDR | cpu.s as u16, flags, pc0);
                cpu.s = cpu.s.wrapping_sub(1);
            }
            OpType::Phx => {
                mem.write(STACK_ADDR | cpu.s as u16, cpu.x, pc0);
                cpu.s = cpu.s.wrapping_sub(1);
            }
            OpType::Phy => {
                mem.write(STACK_ADDR | cpu.s as u16, cpu.y, pc0);
                cpu.s = cpu.s.wrapping_sub(1);
            }
            OpType::Pla => {
                cpu.s = cpu.s.wrapping_add(1);
                cpu.a = mem.read(STACK_ADDR | cpu.s as u16, pc0);
                cpu.update_zn(cpu.a);
            }
            OpType::Plx => {
                cpu.s = cpu.s.wrapping_add(1);
                cpu.x = mem.read(STACK_ADDR | cpu.s as u16, pc0);
                cpu.update_zn(cpu.x);
            }
            OpType::Ply => {
                cpu.s = cpu.s.wrapping_add(1);
                cpu.y = mem.read(STACK_ADDR | cpu.s as u16, pc0);
                cpu.update_zn(cpu.y);
            }
            OpType::Jmp => {
                cpu.pc = scratch;
                *countdown -= plan.cycles as i64;
                return true;
            }
            OpType::Jsr => {
                let ret = pc.wrapping_sub(1);
                mem.write(STACK_ADDR | cpu.s as u16, (ret >> 8) as u8, pc0);
                cpu.s = cpu.s.wrapping_sub(1);
                mem.write(STACK_ADDR | cpu.s as u16, ret as u8, pc0);
                cpu.s = cpu.s.wrapping_sub(1);
                cpu.pc = scratch;
                *countdown -= plan.cycles as i64;
                return true;
            }
            OpType::Rts => {
                cpu.s = cpu.s.wrapping_add(1);
                let lo = mem.read(STACK_ADDR | cpu.s as u16, pc0) as u16;
                cpu.s = cpu.s.wrapping_add(1);
                let hi = mem.read(STACK_ADDR | cpu.s as u16, pc0) as u16;
                cpu.pc = ((hi << 8) | lo).wrapping_add(1);
                *countdown -= plan.cycles as i64;
                return true;
            }
            OpType::Bpl | OpType::Bmi | OpType::Bvc | OpType::Bvs | OpType::Bcc | OpType::Bcs
            | OpType::Bne | OpType::Beq | OpType::Bra => {
                let take = match plan.optype {
                    OpType::Bpl => !cpu.flag_n,
                    OpType::Bmi => cpu.flag_n,
                    OpType::Bvc => !cpu.flag_v,
                    OpType::Bvs => cpu.flag_v,
                    OpType::Bcc => !cpu.flag_c,
                    OpType::Bcs => cpu.flag_c,
                    OpType::Bne => !cpu.flag_z,
                    OpType::Beq => cpu.flag_z,
                    OpType::Bra => true,
                    _ => unreachable!(),
                };
                let mut cycles = plan.cycles as i64;
                if take {
                    let target = pc.wrapping_add(imm as i8 as u16);
                    cycles += 1;
                    if (target & 0xFF00) != (pc & 0xFF00) {
                        cycles += 1;
                    }
                    pc = target;
                }
                cpu.pc = pc;
                *countdown -= cycles;
                return true;
            }
            OpType::Nop => {}
            _ => unreachable!("bounced optypes never reach the template"),
        }

        cpu.pc = pc;
        *countdown -= (plan.cycles + penalty) as i64;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::cpu_and_bus;

    fn run_program(program: &[u8]) -> (Cpu, Bus) {
        let (mut cpu, mut bus) = cpu_and_bus(program);
        let mut engine = Inturbo::new(CpuVariant::Nmos);
        engine.run(&mut cpu, &mut bus, 100_000);
        (cpu, bus)
    }

    #[test]
    fn template_path_executes_loads_and_stores() {
        // LDA #$12; STA $2000; LDX $2000; KIL
        let (cpu, bus) = run_program(&[0xA9, 0x12, 0x8D, 0x00, 0x20, 0xAE, 0x00, 0x20, 0x02]);
        assert!(cpu.halted);
        assert_eq!(bus.peek(0x2000), 0x12);
        assert_eq!(cpu.x, 0x12);
    }

    #[test]
    fn cycle_counts_match_interpreter() {
        use crate::cpu::interp::Interp;
        // A mix of penalties: crossing read, branch taken, RMW.
        let program = [
            0xA2, 0x01, // LDX #1
            0xBD, 0xFF, 0x20, // LDA $20FF,X (cross)
            0xD0, 0x02, // BNE +2 (taken)
            0xEA, 0xEA, // skipped
            0xE6, 0x40, // INC $40
            0x02, // KIL
        ];
        let (mut cpu_a, mut bus_a) = cpu_and_bus(&program);
        let mut inturbo = Inturbo::new(CpuVariant::Nmos);
        inturbo.run(&mut cpu_a, &mut bus_a, 100_000);

        let (mut cpu_b, mut bus_b) = cpu_and_bus(&program);
        let mut interp = Interp::new(CpuVariant::Nmos);
        interp.run(&mut cpu_b, &mut bus_b, 100_000);

        assert_eq!(cpu_a.cycles, cpu_b.cycles);
        assert_eq!(cpu_a.pc, cpu_b.pc);
        assert_eq!(cpu_a.x, cpu_b.x);
    }

    #[test]
    fn bcd_bounces_to_interpreter() {
        // SED; CLC(bounced? no, CLC is template); LDA #$19; ADC #$03; KIL
        let (cpu, _) = run_program(&[0xF8, 0x18, 0xA9, 0x19, 0x69, 0x03, 0x02]);
        assert_eq!(cpu.a, 0x22);
    }

    #[test]
    fn mmio_access_bounces_and_stays_accurate() {
        // Writing the VIA IER through the template path must land on the
        // interpreter (odd-tick alignment observable in wheel time).
        let (_, bus) = run_program(&[0x8D, 0x4E, 0xFE, 0x02]);
        assert_eq!(bus.timing.total_ticks() & 1, 1);
    }

    #[test]
    fn brk_and_rti_bounce() {
        // BRK -> handler: RTI; then KIL after the BRK pad byte.
        let (mut cpu, mut bus) = cpu_and_bus(&[0x00, 0xFF, 0x02]);
        bus.poke(0x3000, 0x40); // RTI
        let mut engine = Inturbo::new(CpuVariant::Nmos);
        engine.run(&mut cpu, &mut bus, 100_000);
        assert!(cpu.halted);
        // BRK pushes PC+2: return lands on the KIL.
        assert_eq!(cpu.pc, 0x1903);
    }
}
