/*!
via.rs - 6522 Versatile Interface Adapter (system and user instances).

Overview
========
Sixteen-register MMIO window: ports A/B with DDR masking, timers T1/T2,
shift register, ACR/PCR control, IFR/IER interrupt logic, and the four
control lines CA1/CA2/CB1/CB2.

Timer representation
====================
T1 and T2 live as timing-wheel slots counted in host ticks (2 MHz), while
the architectural counters run at 1 MHz. The stored wheel value is
`(counter << 1) + 2`: the +2 exists because the VIA interrupt condition is
counter == -1 while the wheel fires at 0. A timer whose interrupt has
already latched keeps decrementing below zero; readers normalize such
values by folding in however many latch reloads have elapsed (T1 reloads
from T1L+2, T2 wraps through 0x10000).

Access timing
=============
Register accesses happen on the mid-cycle of the 2-tick VIA cycle. The bus
advances the wheel to the access start cycle, calls `sample_firing` (will
T1/T2 hit -1 on the coming mid-cycle?), steps one tick - firing any timer
callbacks - and only then calls `read_mid`/`write_mid`. A timer that fires
on the same VIA cycle as an access wins: the T1CL/T2CL read returns 0xFF
and does not clear the interrupt, and an IFR write cannot clear it either.

Port wiring
===========
Machine-specific peripherals on the ports (keyboard and addressable latch
on the system VIA, printer stubs on the user VIA) are reached through the
`ViaBackplane` trait so this module stays machine-agnostic.
*/

use crate::bus::{IrqLines, IrqSource};
use crate::timing::{TimerId, TimingWheel};

// Register indices within the 16-byte window.
pub const REG_ORB: u8 = 0x0;
pub const REG_ORA: u8 = 0x1;
pub const REG_DDRB: u8 = 0x2;
pub const REG_DDRA: u8 = 0x3;
pub const REG_T1CL: u8 = 0x4;
pub const REG_T1CH: u8 = 0x5;
pub const REG_T1LL: u8 = 0x6;
pub const REG_T1LH: u8 = 0x7;
pub const REG_T2CL: u8 = 0x8;
pub const REG_T2CH: u8 = 0x9;
pub const REG_SR: u8 = 0xA;
pub const REG_ACR: u8 = 0xB;
pub const REG_PCR: u8 = 0xC;
pub const REG_IFR: u8 = 0xD;
pub const REG_IER: u8 = 0xE;
pub const REG_ORA_NO_HANDSHAKE: u8 = 0xF;

// IFR/IER interrupt bits.
pub const INT_CA2: u8 = 0x01;
pub const INT_CA1: u8 = 0x02;
pub const INT_SHIFT: u8 = 0x04;
pub const INT_CB2: u8 = 0x08;
pub const INT_CB1: u8 = 0x10;
pub const INT_TIMER2: u8 = 0x20;
pub const INT_TIMER1: u8 = 0x40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViaId {
    System,
    User,
}

/// Machine-side peripherals hanging off a VIA's ports.
pub trait ViaBackplane {
    /// Port A level for a CPU read. May refresh `peripheral_a` (the system
    /// VIA's keyboard scan rewrites bit 7) and drive CA2.
    fn read_port_a(&mut self, peripheral_a: &mut u8, peripheral_b: u8) -> (u8, Option<bool>);
    /// Port A output latch driven with `(ora & ddra) | !ddra`.
    fn port_a_written(&mut self, port_val: u8, peripheral_a: &mut u8, peripheral_b: u8)
    -> Option<bool>;
    fn read_port_b(&mut self) -> u8 {
        0xFF
    }
    /// Port B output latch driven with `(orb & ddrb) | !ddrb`.
    fn port_b_written(&mut self, port_val: u8, peripheral_a: u8, peripheral_b: &mut u8);
}

/// Backplane with nothing attached; used by tests and as a default.
pub struct NullBackplane;

impl ViaBackplane for NullBackplane {
    fn read_port_a(&mut self, peripheral_a: &mut u8, _peripheral_b: u8) -> (u8, Option<bool>) {
        (*peripheral_a, None)
    }
    fn port_a_written(
        &mut self,
        port_val: u8,
        peripheral_a: &mut u8,
        _peripheral_b: u8,
    ) -> Option<bool> {
        *peripheral_a = port_val;
        None
    }
    fn port_b_written(&mut self, _port_val: u8, _peripheral_a: u8, _peripheral_b: &mut u8) {}
}

/// Register block captured for the snapshot format.
#[derive(Debug, Clone, Copy, Default)]
pub struct ViaRegisters {
    pub ora: u8,
    pub orb: u8,
    pub ddra: u8,
    pub ddrb: u8,
    pub sr: u8,
    pub acr: u8,
    pub pcr: u8,
    pub ifr: u8,
    pub ier: u8,
    pub peripheral_a: u8,
    pub peripheral_b: u8,
    pub t1c_raw: i32,
    pub t1l: i32,
    pub t2c_raw: i32,
    pub t2l: i32,
    pub t1_oneshot_fired: bool,
    pub t2_oneshot_fired: bool,
    pub t1_pb7: bool,
    pub ca1: bool,
    pub ca2: bool,
}

pub struct Via {
    id: ViaId,
    externally_clocked: bool,
    irq_source: IrqSource,
    t1_timer: TimerId,
    t2_timer: TimerId,

    orb: u8,
    ora: u8,
    ddrb: u8,
    ddra: u8,
    sr: u8,
    acr: u8,
    pcr: u8,
    ifr: u8,
    ier: u8,
    peripheral_a: u8,
    peripheral_b: u8,
    t1l: u16,
    t2l: u16,
    t1_pb7: bool,

    // Cached logical levels of the control lines.
    ca1: bool,
    ca2: bool,
    cb1: bool,
    cb2: bool,
}

impl Via {
    pub fn new(id: ViaId, externally_clocked: bool, wheel: &mut TimingWheel) -> Via {
        // Hardcoded assumption that the host tick rate is 2x the 1 MHz VIA
        // clock.
        assert_eq!(wheel.tick_rate(), 2_000_000);

        let t1_timer = wheel.register();
        let t2_timer = wheel.register();

        let irq_source = match id {
            ViaId::System => IrqSource::SysVia,
            ViaId::User => IrqSource::UserVia,
        };

        let mut via = Via {
            id,
            externally_clocked,
            irq_source,
            t1_timer,
            t2_timer,
            // OR* / DDR* start at 0, matching a 1977 data sheet and
            // confirmed behavior; some other emulators use 0xFF.
            orb: 0,
            ora: 0,
            ddrb: 0,
            ddra: 0,
            sr: 0,
            acr: 0,
            pcr: 0,
            ifr: 0,
            ier: 0,
            peripheral_a: 0,
            peripheral_b: 0,
            t1l: 0xFFFF,
            t2l: 0xFFFF,
            // Needs to start high or Planetoid doesn't run.
            t1_pb7: true,
            ca1: false,
            ca2: false,
            cb1: false,
            cb2: false,
        };

        via.set_t1c(wheel, 0xFFFF);
        via.set_t2c(wheel, 0xFFFF);

        if !externally_clocked {
            wheel.start(t1_timer);
            wheel.start(t2_timer);
        }

        // Power-on does not count as a timer load, so neither timer is due
        // a one-shot interrupt yet.
        wheel.set_firing(t1_timer, false);
        wheel.set_firing(t2_timer, false);

        via
    }

    #[inline]
    pub fn id(&self) -> ViaId {
        self.id
    }

    pub fn timer_ids(&self) -> (TimerId, TimerId) {
        (self.t1_timer, self.t2_timer)
    }

    #[inline]
    pub fn peripheral_b(&self) -> u8 {
        self.peripheral_b
    }

    #[inline]
    pub fn peripheral_a(&self) -> u8 {
        self.peripheral_a
    }

    // -----------------------------------------------------------------
    // Timer value plumbing
    // -----------------------------------------------------------------

    fn set_t1c_raw(&mut self, wheel: &mut TimingWheel, val: i64) {
        // +2 because the VIA fires at counter -1 and the wheel fires at 0.
        wheel.set_value(self.t1_timer, val + 2);
    }

    fn set_t1c(&mut self, wheel: &mut TimingWheel, val: i64) {
        self.set_t1c_raw(wheel, val << 1);
    }

    fn get_t1c_raw(&mut self, wheel: &mut TimingWheel) -> i64 {
        let mut val = wheel.value(self.t1_timer) - 2;

        // With the interrupt already latched the timer decrements
        // indefinitely; fold in the latch reloads that have elapsed.
        if val < -2 {
            // T1 (latch 4) counts 4... 3... 2... 1... 0... -1... 4...
            let delta = -val - 4;
            let relatch_cycles = ((self.t1l as i64) + 2) << 1;
            let relatches = (delta / relatch_cycles) + 1;
            val += relatches * relatch_cycles;
            self.set_t1c_raw(wheel, val);
        }
        val
    }

    fn get_t1c(&mut self, wheel: &mut TimingWheel) -> i64 {
        self.get_t1c_raw(wheel) >> 1
    }

    fn set_t2c_raw(&mut self, wheel: &mut TimingWheel, val: i64) {
        wheel.set_value(self.t2_timer, val + 2);
    }

    fn set_t2c(&mut self, wheel: &mut TimingWheel, val: i64) {
        self.set_t2c_raw(wheel, val << 1);
    }

    fn get_t2c_raw(&mut self, wheel: &mut TimingWheel) -> i64 {
        let mut val = wheel.value(self.t2_timer) - 2;

        if val < -2 {
            // T2 counts 4... 3... 2... 1... 0... FFFF... FFFE...
            let delta = -val - 4;
            let relatch_cycles = 0x10000i64 << 1;
            let relatches = (delta / relatch_cycles) + 1;
            val += relatches * relatch_cycles;
            self.set_t2c_raw(wheel, val);
        }
        val
    }

    fn get_t2c(&mut self, wheel: &mut TimingWheel) -> i64 {
        self.get_t2c_raw(wheel) >> 1
    }

    // -----------------------------------------------------------------
    // Timer expiry
    // -----------------------------------------------------------------

    fn do_fire_t1(&mut self, wheel: &mut TimingWheel, irqs: &mut IrqLines) {
        debug_assert!(wheel.firing(self.t1_timer));

        self.raise_interrupt(irqs, INT_TIMER1);
        // PB7 is maintained regardless of whether PB7 output mode is
        // active; confirmed on real hardware.
        self.t1_pb7 = !self.t1_pb7;

        if (self.acr & 0x40) == 0 {
            // One-shot: latch the hit so no further interrupt asserts until
            // T1CH is rewritten. The counter itself free-runs.
            wheel.set_firing(self.t1_timer, false);
        } else {
            let delta = ((self.t1l as i64) + 2) << 1;
            wheel.adjust_value(self.t1_timer, delta);
        }
    }

    fn do_fire_t2(&mut self, wheel: &mut TimingWheel, irqs: &mut IrqLines) {
        debug_assert!(wheel.firing(self.t2_timer));
        self.raise_interrupt(irqs, INT_TIMER2);
        wheel.set_firing(self.t2_timer, false);
    }

    /// Wheel callback for the T1 slot.
    pub fn t1_fired(&mut self, wheel: &mut TimingWheel, irqs: &mut IrqLines) {
        debug_assert_eq!(self.get_t1c(wheel), -1);
        debug_assert!(!self.externally_clocked);
        self.do_fire_t1(wheel, irqs);
    }

    /// Wheel callback for the T2 slot.
    pub fn t2_fired(&mut self, wheel: &mut TimingWheel, irqs: &mut IrqLines) {
        debug_assert_eq!(self.get_t2c(wheel), -1);
        debug_assert!(!self.externally_clocked);
        // Must not fire in pulse counting mode.
        debug_assert!((self.acr & 0x20) == 0);
        self.do_fire_t2(wheel, irqs);
    }

    fn is_t1_firing(&mut self, wheel: &mut TimingWheel) -> bool {
        if !wheel.firing(self.t1_timer) {
            return false;
        }
        self.get_t1c_raw(wheel) == -1
    }

    fn is_t2_firing(&mut self, wheel: &mut TimingWheel) -> bool {
        if !wheel.firing(self.t2_timer) {
            return false;
        }
        self.get_t2c_raw(wheel) == -1
    }

    /// Will T1/T2 hit -1 on the coming mid-cycle? Must be called at the
    /// access start cycle, before the wheel steps to the mid-cycle.
    pub fn sample_firing(&mut self, wheel: &mut TimingWheel) -> (bool, bool) {
        (self.is_t1_firing(wheel), self.is_t2_firing(wheel))
    }

    // -----------------------------------------------------------------
    // Externally clocked advance (wall-time mode)
    // -----------------------------------------------------------------

    pub fn apply_wall_time_delta(
        &mut self,
        ticks: u64,
        wheel: &mut TimingWheel,
        irqs: &mut IrqLines,
    ) {
        if !self.externally_clocked {
            return;
        }

        let mut t1c = self.get_t1c(wheel);
        t1c -= ticks as i64;
        self.set_t1c(wheel, t1c);
        if t1c < 0 {
            if wheel.firing(self.t1_timer) {
                self.do_fire_t1(wheel, irqs);
            }
            let _ = self.get_t1c(wheel);
        }

        // In pulse counting mode T2 doesn't decrement.
        if (self.acr & 0x20) != 0 {
            return;
        }

        let mut t2c = self.get_t2c(wheel);
        t2c -= ticks as i64;
        self.set_t2c(wheel, t2c);
        if t2c < 0 {
            if wheel.firing(self.t2_timer) {
                self.do_fire_t2(wheel, irqs);
            }
            let _ = self.get_t2c(wheel);
        }
    }

    // -----------------------------------------------------------------
    // Interrupt flags
    // -----------------------------------------------------------------

    pub fn raise_interrupt(&mut self, irqs: &mut IrqLines, bits: u8) {
        debug_assert!((bits & 0x80) == 0);
        self.ifr |= bits;
        self.check_interrupt(irqs);
    }

    pub fn clear_interrupt(&mut self, irqs: &mut IrqLines, bits: u8) {
        debug_assert!((bits & 0x80) == 0);
        self.ifr &= !bits;
        self.check_interrupt(irqs);
    }

    fn check_interrupt(&mut self, irqs: &mut IrqLines) {
        debug_assert!((self.ier & 0x80) == 0);
        let level = (self.ier & self.ifr) != 0;
        if level {
            self.ifr |= 0x80;
        } else {
            self.ifr &= !0x80;
        }
        irqs.set_level(self.irq_source, level);
    }

    // -----------------------------------------------------------------
    // Control lines
    // -----------------------------------------------------------------

    /// Drive CA1; a PCR-selected edge latches INT_CA1.
    pub fn set_ca1(&mut self, irqs: &mut IrqLines, level: bool) {
        if level == self.ca1 {
            return;
        }
        self.ca1 = level;
        let positive = (self.pcr & 0x01) != 0;
        if level == positive {
            self.raise_interrupt(irqs, INT_CA1);
        }
    }

    /// Drive CA2 as an input; only meaningful in the PCR input modes.
    pub fn set_ca2(&mut self, irqs: &mut IrqLines, level: bool) {
        if level == self.ca2 {
            return;
        }
        self.ca2 = level;
        if (self.pcr & 0x08) != 0 {
            // Output mode; no input edge detection.
            return;
        }
        let positive = (self.pcr & 0x04) != 0;
        if level == positive {
            self.raise_interrupt(irqs, INT_CA2);
        }
    }

    pub fn set_cb1(&mut self, irqs: &mut IrqLines, level: bool) {
        if level == self.cb1 {
            return;
        }
        self.cb1 = level;
        let positive = (self.pcr & 0x10) != 0;
        if level == positive {
            self.raise_interrupt(irqs, INT_CB1);
        }
    }

    pub fn set_cb2(&mut self, irqs: &mut IrqLines, level: bool) {
        if level == self.cb2 {
            return;
        }
        self.cb2 = level;
        if (self.pcr & 0x80) != 0 {
            return;
        }
        let positive = (self.pcr & 0x40) != 0;
        if level == positive {
            self.raise_interrupt(irqs, INT_CB2);
        }
    }

    /// CA2 driven directly by level (the system VIA keyboard interrupt
    /// behaves as a level source, not an edge).
    fn apply_ca2_level(&mut self, irqs: &mut IrqLines, fire: bool) {
        if fire {
            self.raise_interrupt(irqs, INT_CA2);
        } else {
            self.clear_interrupt(irqs, INT_CA2);
        }
    }

    // -----------------------------------------------------------------
    // Port helpers
    // -----------------------------------------------------------------

    fn write_port_a(&mut self, irqs: &mut IrqLines, ports: &mut dyn ViaBackplane) {
        let port_val = (self.ora & self.ddra) | !self.ddra;
        let ca2 = ports.port_a_written(port_val, &mut self.peripheral_a, self.peripheral_b);
        if let Some(fire) = ca2 {
            self.apply_ca2_level(irqs, fire);
        }
    }

    fn write_port_b(&mut self, ports: &mut dyn ViaBackplane) {
        let port_val = (self.orb & self.ddrb) | !self.ddrb;
        ports.port_b_written(port_val, self.peripheral_a, &mut self.peripheral_b);
    }

    // -----------------------------------------------------------------
    // Register access (at the VIA mid-cycle)
    // -----------------------------------------------------------------

    /// Read a register. The wheel must already sit on the access
    /// mid-cycle; `t1_firing`/`t2_firing` come from `sample_firing`.
    pub fn read_mid(
        &mut self,
        wheel: &mut TimingWheel,
        irqs: &mut IrqLines,
        ports: &mut dyn ViaBackplane,
        reg: u8,
        t1_firing: bool,
        t2_firing: bool,
    ) -> u8 {
        let mut t1_val = self.get_t1c(wheel);
        if t1_firing {
            // The raw value has already been advanced to the relatch; the
            // architectural value this cycle is -1.
            t1_val = -1;
        }
        let t2_val = self.get_t2c(wheel);

        match reg & 0x0F {
            REG_ORB => {
                let mut val = self.orb & self.ddrb;
                val |= ports.read_port_b() & !self.ddrb;
                // PB7 toggling is a separately maintained bit mixed into
                // both IRB and ORB.
                if (self.acr & 0x80) != 0 {
                    val &= 0x7F;
                    val |= (self.t1_pb7 as u8) << 7;
                }
                val
            }
            REG_ORA => {
                self.clear_interrupt(irqs, INT_CA1);
                self.clear_interrupt(irqs, INT_CA2);
                self.read_port_a_value(irqs, ports)
            }
            REG_ORA_NO_HANDSHAKE => self.read_port_a_value(irqs, ports),
            REG_DDRB => self.ddrb,
            REG_DDRA => self.ddra,
            REG_T1CL => {
                if !t1_firing {
                    self.clear_interrupt(irqs, INT_TIMER1);
                }
                (t1_val as u16 & 0xFF) as u8
            }
            REG_T1CH => ((t1_val as u16) >> 8) as u8,
            REG_T1LL => (self.t1l & 0xFF) as u8,
            REG_T1LH => (self.t1l >> 8) as u8,
            REG_T2CL => {
                if !t2_firing {
                    self.clear_interrupt(irqs, INT_TIMER2);
                }
                (t2_val as u16 & 0xFF) as u8
            }
            REG_T2CH => ((t2_val as u16) >> 8) as u8,
            REG_SR => self.sr,
            REG_ACR => self.acr,
            REG_PCR => self.pcr,
            REG_IFR => self.ifr,
            REG_IER => self.ier | 0x80,
            _ => unreachable!(),
        }
    }

    fn read_port_a_value(&mut self, irqs: &mut IrqLines, ports: &mut dyn ViaBackplane) -> u8 {
        let (port_val, ca2) = ports.read_port_a(&mut self.peripheral_a, self.peripheral_b);
        if let Some(fire) = ca2 {
            self.apply_ca2_level(irqs, fire);
        }
        (self.ora & self.ddra) | (port_val & !self.ddra)
    }

    /// Write a register, with the same calling convention as `read_mid`.
    pub fn write_mid(
        &mut self,
        wheel: &mut TimingWheel,
        irqs: &mut IrqLines,
        ports: &mut dyn ViaBackplane,
        reg: u8,
        val: u8,
        t1_firing: bool,
        t2_firing: bool,
    ) {
        // Force the deferred relatch calculation before T1L can change
        // underneath it.
        let _ = self.get_t1c(wheel);

        match reg & 0x0F {
            REG_ORB => {
                self.orb = val;
                self.write_port_b(ports);
            }
            REG_ORA => {
                self.clear_interrupt(irqs, INT_CA1);
                self.clear_interrupt(irqs, INT_CA2);
                self.ora = val;
                self.write_port_a(irqs, ports);
            }
            REG_DDRB => {
                self.ddrb = val;
                self.write_port_b(ports);
            }
            REG_DDRA => {
                self.ddra = val;
                self.write_port_a(irqs, ports);
            }
            REG_T1CL | REG_T1LL => {
                // Writing either T1CL or T1LL updates just the low latch.
                self.t1l = (self.t1l & 0xFF00) | (val as u16);
            }
            REG_T1CH => {
                if !t1_firing {
                    self.clear_interrupt(irqs, INT_TIMER1);
                }
                self.t1l = ((val as u16) << 8) | (self.t1l & 0xFF);
                // +1 because the load takes effect in one tick.
                let timer_val = (self.t1l as i64) + 1;
                self.set_t1c(wheel, timer_val);
                wheel.set_firing(self.t1_timer, true);
                self.t1_pb7 = false;
            }
            REG_T1LH => {
                // The data sheet says a T1LH write clears the interrupt,
                // in both timer modes; validated on real hardware.
                if !t1_firing {
                    self.clear_interrupt(irqs, INT_TIMER1);
                }
                self.t1l = ((val as u16) << 8) | (self.t1l & 0xFF);
            }
            REG_T2CL => {
                self.t2l = (self.t2l & 0xFF00) | (val as u16);
            }
            REG_T2CH => {
                if !t2_firing {
                    self.clear_interrupt(irqs, INT_TIMER2);
                }
                self.t2l = ((val as u16) << 8) | (self.t2l & 0xFF);
                let mut timer_val = self.t2l as i64;
                if (self.acr & 0x20) == 0 {
                    timer_val += 1;
                }
                self.set_t2c(wheel, timer_val);
                wheel.set_firing(self.t2_timer, true);
            }
            REG_SR => {
                self.sr = val;
            }
            REG_ACR => {
                self.acr = val;
                // Quirk validated against hardware: one-shot written the
                // same cycle as a T1 expiry applies to the just-expired
                // shot. The inverse (continuous written at expiry) still
                // behaves as one-shot.
                if t1_firing && (val & 0x40) == 0 {
                    wheel.set_firing(self.t1_timer, false);
                }

                if !self.externally_clocked {
                    if (val & 0x20) != 0 {
                        // Pulse counting mode: T2 stops, freezing after
                        // one more tick.
                        if wheel.is_running(self.t2_timer) {
                            let t2_val = self.get_t2c(wheel);
                            self.set_t2c(wheel, t2_val - 1);
                            wheel.stop(self.t2_timer);
                        }
                    } else if !wheel.is_running(self.t2_timer) {
                        // Counting resumes next cycle.
                        let t2_val = self.get_t2c(wheel);
                        self.set_t2c(wheel, t2_val + 1);
                        wheel.start(self.t2_timer);
                    }
                }
            }
            REG_PCR => {
                self.pcr = val;
            }
            REG_IFR => {
                self.ifr &= !(val & 0x7F);
                // A timer firing this same cycle wins over the clear.
                if t1_firing {
                    self.ifr |= INT_TIMER1;
                }
                if t2_firing {
                    self.ifr |= INT_TIMER2;
                }
                self.check_interrupt(irqs);
            }
            REG_IER => {
                if (val & 0x80) != 0 {
                    self.ier |= val & 0x7F;
                } else {
                    self.ier &= !(val & 0x7F);
                }
                self.check_interrupt(irqs);
            }
            REG_ORA_NO_HANDSHAKE => {
                self.ora = val;
                self.write_port_a(irqs, ports);
            }
            _ => unreachable!(),
        }
    }

    // -----------------------------------------------------------------
    // Snapshot support
    // -----------------------------------------------------------------

    pub fn registers(&mut self, wheel: &mut TimingWheel) -> ViaRegisters {
        ViaRegisters {
            ora: self.ora,
            orb: self.orb,
            ddra: self.ddra,
            ddrb: self.ddrb,
            sr: self.sr,
            acr: self.acr,
            pcr: self.pcr,
            ifr: self.ifr,
            ier: self.ier,
            peripheral_a: self.peripheral_a,
            peripheral_b: self.peripheral_b,
            t1c_raw: self.get_t1c_raw(wheel) as i32,
            t1l: self.t1l as i32,
            t2c_raw: self.get_t2c_raw(wheel) as i32,
            t2l: self.t2l as i32,
            t1_oneshot_fired: !wheel.firing(self.t1_timer),
            t2_oneshot_fired: !wheel.firing(self.t2_timer),
            t1_pb7: self.t1_pb7,
            ca1: self.ca1,
            ca2: self.ca2,
        }
    }

    pub fn set_registers(&mut self, wheel: &mut TimingWheel, regs: &ViaRegisters) {
        self.ora = regs.ora;
        self.orb = regs.orb;
        self.ddra = regs.ddra;
        self.ddrb = regs.ddrb;
        self.sr = regs.sr;
        self.acr = regs.acr;
        self.pcr = regs.pcr;
        self.ifr = regs.ifr;
        self.ier = regs.ier;
        self.peripheral_a = regs.peripheral_a;
        self.peripheral_b = regs.peripheral_b;
        self.t1l = regs.t1l as u16;
        self.t2l = regs.t2l as u16;
        self.set_t1c_raw(wheel, regs.t1c_raw as i64);
        self.set_t2c_raw(wheel, regs.t2c_raw as i64);
        wheel.set_firing(self.t1_timer, !regs.t1_oneshot_fired);
        wheel.set_firing(self.t2_timer, !regs.t2_oneshot_fired);
        self.t1_pb7 = regs.t1_pb7;
        self.ca1 = regs.ca1;
        self.ca2 = regs.ca2;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::IrqLines;

    struct Harness {
        wheel: TimingWheel,
        irqs: IrqLines,
        via: Via,
        ports: NullBackplane,
    }

    impl Harness {
        fn new() -> Harness {
            let mut wheel = TimingWheel::new(2_000_000);
            let via = Via::new(ViaId::System, false, &mut wheel);
            Harness {
                wheel,
                irqs: IrqLines::new(),
                via,
                ports: NullBackplane,
            }
        }

        /// Advance the wheel by `ticks`, firing VIA timers like the bus
        /// does.
        fn run(&mut self, ticks: i64) {
            let (t1, t2) = self.via.timer_ids();
            let via = &mut self.via;
            let irqs = &mut self.irqs;
            let target = self.wheel.countdown() - ticks;
            self.wheel.advance_with(target, |w, id| {
                if id == t1 {
                    via.t1_fired(w, irqs);
                } else if id == t2 {
                    via.t2_fired(w, irqs);
                }
            });
        }

        /// A register access as the bus performs it: align to the even
        /// phase, sample firing, step one tick to the mid-cycle, access.
        fn align(&mut self) -> (bool, bool) {
            if self.wheel.total_ticks() & 1 == 1 {
                self.run(1);
            }
            let firing = self.via.sample_firing(&mut self.wheel);
            self.run(1);
            firing
        }

        fn read(&mut self, reg: u8) -> u8 {
            let (t1f, t2f) = self.align();
            self.via.read_mid(
                &mut self.wheel,
                &mut self.irqs,
                &mut self.ports,
                reg,
                t1f,
                t2f,
            )
        }

        fn write(&mut self, reg: u8, val: u8) {
            let (t1f, t2f) = self.align();
            self.via.write_mid(
                &mut self.wheel,
                &mut self.irqs,
                &mut self.ports,
                reg,
                val,
                t1f,
                t2f,
            );
        }
    }

    #[test]
    fn ifr_bit7_tracks_enabled_sources() {
        let mut h = Harness::new();
        h.write(REG_IER, 0x80 | INT_TIMER1);

        h.via.raise_interrupt(&mut h.irqs, INT_TIMER1);
        assert_eq!(h.read(REG_IFR) & 0x80, 0x80);
        assert!(h.irqs.asserted());

        h.write(REG_IFR, INT_TIMER1);
        assert_eq!(h.read(REG_IFR), 0);
        assert!(!h.irqs.asserted());
    }

    #[test]
    fn ier_reads_with_bit7_set() {
        let mut h = Harness::new();
        h.write(REG_IER, 0x80 | INT_CA1);
        assert_eq!(h.read(REG_IER), 0x80 | INT_CA1);
        h.write(REG_IER, INT_CA1);
        assert_eq!(h.read(REG_IER), 0x80);
    }

    // T1 tick values, one-shot: latch 6 counts 4... -1... then free-runs
    // through the relatch. Gaps of 10 ticks between reads match the
    // LDA abs / STA abs rhythm of a real test program.
    #[test]
    fn t1_tick_values_one_shot() {
        let mut h = Harness::new();
        h.write(REG_IER, 0x7F);
        h.write(REG_T1CL, 0x06);
        h.run(2); // LDA #0 before the T1CH write
        h.write(REG_T1CH, 0x00);

        h.run(4);
        assert_eq!(h.read(REG_T1CL), 0x04);
        h.run(8);
        // This read coincides with the expiry: forced -1, interrupt kept.
        assert_eq!(h.read(REG_T1CL), 0xFF);
        assert_ne!(h.read(REG_IFR) & INT_TIMER1, 0);
        h.run(6);
        assert_eq!(h.read(REG_T1CL), 0x02);
    }

    #[test]
    fn t2_tick_values_no_reload() {
        let mut h = Harness::new();
        h.write(REG_IER, 0x7F);
        h.write(REG_T2CL, 0x06);
        h.run(2);
        h.write(REG_T2CH, 0x00);

        h.run(4);
        assert_eq!(h.read(REG_T2CL), 0x04);
        h.run(8);
        assert_eq!(h.read(REG_T2CL), 0xFF);
        h.run(8);
        // T2 wraps through 0x10000 rather than reloading.
        assert_eq!(h.read(REG_T2CL), 0xFA);
    }

    #[test]
    fn t1_continuous_reload_period() {
        let mut h = Harness::new();
        h.write(REG_IER, 0x7F);
        h.write(REG_ACR, 0x40);
        h.write(REG_T1CL, 0x04);
        h.write(REG_T1CH, 0x00);

        // Latch 4 fires every (4 + 2) VIA cycles, forever.
        let mut fires = 0;
        for _ in 0..6 {
            // Clear, then wait for the next latch period.
            h.write(REG_IFR, INT_TIMER1);
            h.run(12);
            if h.read(REG_IFR) & INT_TIMER1 != 0 {
                fires += 1;
            }
        }
        assert_eq!(fires, 6);
    }

    #[test]
    fn t1_one_shot_fires_once() {
        let mut h = Harness::new();
        h.write(REG_IER, 0x7F);
        h.write(REG_T1CL, 0x04);
        h.write(REG_T1CH, 0x00);

        h.run(50);
        assert_ne!(h.read(REG_IFR) & INT_TIMER1, 0);
        h.write(REG_IFR, INT_TIMER1);
        h.run(200);
        assert_eq!(h.read(REG_IFR) & INT_TIMER1, 0);

        // Rewriting T1CH re-arms the shot.
        h.write(REG_T1CH, 0x00);
        h.run(50);
        assert_ne!(h.read(REG_IFR) & INT_TIMER1, 0);
    }

    #[test]
    fn pb7_mixes_into_orb_reads() {
        let mut h = Harness::new();
        h.write(REG_ACR, 0x80);
        // PB7 starts high.
        assert_eq!(h.read(REG_ORB) & 0x80, 0x80);

        // A T1CH write drives PB7 low; expiry toggles it back high.
        h.write(REG_T1CL, 0x04);
        h.write(REG_T1CH, 0x00);
        assert_eq!(h.read(REG_ORB) & 0x80, 0x00);
        h.run(40);
        assert_eq!(h.read(REG_ORB) & 0x80, 0x80);
    }

    #[test]
    fn t2_pulse_count_mode_freezes_counter() {
        let mut h = Harness::new();
        h.write(REG_IER, 0x7F);
        h.write(REG_T2CL, 0x40);
        h.write(REG_T2CH, 0x00);
        h.run(8);

        h.write(REG_ACR, 0x20);
        let frozen = h.read(REG_T2CL);
        h.run(64);
        assert_eq!(h.read(REG_T2CL), frozen);

        // Leaving pulse-count mode resumes the countdown.
        h.write(REG_ACR, 0x00);
        h.run(16);
        assert_ne!(h.read(REG_T2CL), frozen);
    }

    #[test]
    fn ca1_edge_latches_per_pcr() {
        let mut h = Harness::new();
        // Default PCR: negative edge active.
        h.via.set_ca1(&mut h.irqs, true);
        assert_eq!(h.read(REG_IFR) & INT_CA1, 0);
        h.via.set_ca1(&mut h.irqs, false);
        assert_ne!(h.read(REG_IFR) & INT_CA1, 0);

        // Positive edge select.
        h.write(REG_IFR, INT_CA1);
        h.write(REG_PCR, 0x01);
        h.via.set_ca1(&mut h.irqs, true);
        assert_ne!(h.read(REG_IFR) & INT_CA1, 0);
    }

    #[test]
    fn ora_handshake_read_clears_ca_latches() {
        let mut h = Harness::new();
        h.via.set_ca1(&mut h.irqs, true);
        h.via.set_ca1(&mut h.irqs, false);
        assert_ne!(h.read(REG_IFR) & INT_CA1, 0);

        let _ = h.read(REG_ORA);
        assert_eq!(h.read(REG_IFR) & (INT_CA1 | INT_CA2), 0);

        // The no-handshake alias must not clear.
        h.via.set_ca1(&mut h.irqs, true);
        h.via.set_ca1(&mut h.irqs, false);
        let _ = h.read(REG_ORA_NO_HANDSHAKE);
        assert_ne!(h.read(REG_IFR) & INT_CA1, 0);
    }

    #[test]
    fn snapshot_registers_round_trip() {
        let mut h = Harness::new();
        h.write(REG_DDRA, 0xF0);
        h.write(REG_ACR, 0x40);
        h.write(REG_T1CL, 0x34);
        h.write(REG_T1CH, 0x12);
        h.run(10);

        let regs = h.via.registers(&mut h.wheel);
        let mut wheel2 = TimingWheel::new(2_000_000);
        let mut via2 = Via::new(ViaId::System, false, &mut wheel2);
        via2.set_registers(&mut wheel2, &regs);
        let regs2 = via2.registers(&mut wheel2);

        assert_eq!(regs.ddra, regs2.ddra);
        assert_eq!(regs.acr, regs2.acr);
        assert_eq!(regs.t1l, regs2.t1l);
        assert_eq!(regs.t1c_raw, regs2.t1c_raw);
        assert_eq!(regs.t1_pb7, regs2.t1_pb7);
    }
}
