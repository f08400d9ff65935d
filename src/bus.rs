/*!
bus.rs - Machine orchestrator: timing, memory, peripherals, interrupts.

The `Bus` owns everything except the CPU engines: the timing wheel, the
address space, both VIAs, the video pipeline, the serial chips, keyboard,
ADC and CMOS. Engines drive it through three entry points:

- `read`/`write`: CPU memory accesses with a live countdown. Anything
  below the MMIO carve-out is a direct map access costing one cycle;
  MMIO synchronizes the wheel to "now", stalls to the 1 MHz even phase
  (the hardware's cycle stretching), steps to the device mid-cycle and
  then dispatches.
- `advance_time`: yield to the timing wheel when the countdown runs out.
  Expired timers fire here, in time order, and any video events (VSYNC
  edges, frame-ready) are delivered before the CPU resumes.
- `irqs`: level-per-source IRQ lines plus the NMI edge latch.

Every SHEILA region honors its documented register layout; unimplemented
regions (FRED, JIM, FDC, Econet, Tube) log and read 0xFF.
*/

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::acia::Acia;
use crate::adc::Adc;
use crate::cmos::Cmos;
use crate::keyboard::Keyboard;
use crate::mem::{AddressSpace, MMIO_END, MMIO_START};
use crate::options::{Model, Options};
use crate::serial::SerialUla;
use crate::timing::TimingWheel;
use crate::via::{Via, ViaBackplane, ViaId};
use crate::video::render::Renderer;
use crate::video::{Video, VideoEvent};

// -----------------------------------------------------------------
// Interrupt lines
// -----------------------------------------------------------------

/// The closed set of maskable interrupt sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqSource {
    SysVia = 0,
    UserVia = 1,
    Serial = 2,
    Fdc = 3,
}

/// Per-source IRQ levels plus the NMI edge latch.
pub struct IrqLines {
    levels: u8,
    nmi_edge: bool,
    nmi_level: bool,
}

impl IrqLines {
    pub fn new() -> IrqLines {
        IrqLines {
            levels: 0,
            nmi_edge: false,
            nmi_level: false,
        }
    }

    #[inline]
    pub fn set_level(&mut self, source: IrqSource, level: bool) {
        let bit = 1u8 << (source as u8);
        if level {
            self.levels |= bit;
        } else {
            self.levels &= !bit;
        }
    }

    #[inline]
    pub fn level(&self, source: IrqSource) -> bool {
        (self.levels & (1 << (source as u8))) != 0
    }

    /// The wired-OR IRQ line into the CPU.
    #[inline]
    pub fn asserted(&self) -> bool {
        self.levels != 0
    }

    /// Drive the NMI line; the low-to-high transition latches an edge.
    pub fn set_nmi(&mut self, level: bool) {
        if level && !self.nmi_level {
            self.nmi_edge = true;
        }
        self.nmi_level = level;
    }

    /// Consume a pending NMI edge.
    #[inline]
    pub fn take_nmi_edge(&mut self) -> bool {
        std::mem::take(&mut self.nmi_edge)
    }

    pub fn raw(&self) -> (u8, bool) {
        (self.levels, self.nmi_level)
    }

    pub fn set_raw(&mut self, levels: u8, nmi_level: bool) {
        self.levels = levels;
        self.nmi_level = nmi_level;
        self.nmi_edge = false;
    }
}

impl Default for IrqLines {
    fn default() -> Self {
        IrqLines::new()
    }
}

// -----------------------------------------------------------------
// VIA backplanes
// -----------------------------------------------------------------

/// System VIA ports: keyboard scan on port A, the IC32 addressable latch
/// on port B (with the CMOS chip behind both on a Master).
struct SysBackplane<'a> {
    keyboard: &'a Keyboard,
    cmos: &'a mut Cmos,
    model: Model,
}

impl SysBackplane<'_> {
    /// The slow data bus keyboard handshake: with the write-enable latch
    /// low, bit 7 of the bus reflects the addressed key and CA2 follows
    /// the addressed column; with it high, CA2 follows any key at all.
    fn scan_keyboard(&self, peripheral_a: &mut u8, peripheral_b: u8) -> bool {
        let sdb = *peripheral_a;
        let row = (sdb >> 4) & 7;
        let col = sdb & 0x0F;
        if (peripheral_b & 0x08) == 0 {
            if !self.keyboard.is_pressed(row, col) {
                *peripheral_a &= 0x7F;
            }
            self.keyboard.is_column_pressed(col)
        } else {
            self.keyboard.any_pressed()
        }
    }
}

impl ViaBackplane for SysBackplane<'_> {
    fn read_port_a(&mut self, peripheral_a: &mut u8, peripheral_b: u8) -> (u8, Option<bool>) {
        let fire = self.scan_keyboard(peripheral_a, peripheral_b);
        let mut val = *peripheral_a;
        if self.model == Model::Master && self.cmos.is_driving() {
            val = self.cmos.bus_value();
        }
        (val, Some(fire))
    }

    fn port_a_written(
        &mut self,
        port_val: u8,
        peripheral_a: &mut u8,
        peripheral_b: u8,
    ) -> Option<bool> {
        *peripheral_a = port_val;
        let fire = self.scan_keyboard(peripheral_a, peripheral_b);
        if self.model == Model::Master {
            self.cmos
                .update_external_inputs(port_val, *peripheral_a, peripheral_b);
        }
        Some(fire)
    }

    fn port_b_written(&mut self, port_val: u8, peripheral_a: u8, peripheral_b: &mut u8) {
        let old = *peripheral_b;
        let bit = 1u8 << (port_val & 7);
        let bit_set = (port_val & 0x08) != 0;
        if bit_set {
            *peripheral_b |= bit;
        } else {
            *peripheral_b &= !bit;
        }
        // Pulling the sound write-enable latch low-to-high clocks the
        // port A value into the sound chip, which lives outside the core.
        if bit == 1 && bit_set && (old & 1) == 0 {
            log::trace!("sound: write {:02X}", peripheral_a);
        }
        if self.model == Model::Master {
            self.cmos
                .update_external_inputs(port_val, peripheral_a, *peripheral_b);
        }
    }
}

/// User VIA ports: the printer port is write-only, the user port idles.
struct UserBackplane;

impl ViaBackplane for UserBackplane {
    fn read_port_a(&mut self, _peripheral_a: &mut u8, _peripheral_b: u8) -> (u8, Option<bool>) {
        (0xFF, None)
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

// -----------------------------------------------------------------
// The bus
// -----------------------------------------------------------------

pub struct Bus {
    pub timing: TimingWheel,
    pub mem: AddressSpace,
    pub irqs: IrqLines,

    sysvia: Via,
    uservia: Via,
    video: Video,
    acia: Acia,
    serial_ula: SerialUla,
    adc: Adc,
    cmos: Cmos,
    keyboard: Arc<Keyboard>,

    model: Model,
    do_exit: Arc<AtomicBool>,

    frame_ready_callback: Option<Box<dyn FnMut(&Renderer)>>,

    /// Address ranges whose compiled code must be dropped (ROM paging
    /// changes); drained by the JIT engine.
    pending_invalidations: Vec<(u16, u32)>,
}

impl Bus {
    pub fn new(options: &Options) -> Bus {
        let mut timing = TimingWheel::new(2_000_000);
        let externally_clocked = !options.accurate;
        let sysvia = Via::new(ViaId::System, externally_clocked, &mut timing);
        let uservia = Via::new(ViaId::User, externally_clocked, &mut timing);
        let renderer = Renderer::new(options);
        let video = Video::new(&mut timing, renderer);

        Bus {
            timing,
            mem: AddressSpace::new(options.model),
            irqs: IrqLines::new(),
            sysvia,
            uservia,
            video,
            acia: Acia::new(options),
            serial_ula: SerialUla::new(options),
            adc: Adc::new(),
            cmos: Cmos::new(options),
            keyboard: Arc::new(Keyboard::new()),
            model: options.model,
            do_exit: Arc::new(AtomicBool::new(false)),
            frame_ready_callback: None,
            pending_invalidations: Vec::new(),
        }
    }

    #[inline]
    pub fn model(&self) -> Model {
        self.model
    }

    /// Handle for the UI thread's key event writer.
    pub fn keyboard(&self) -> Arc<Keyboard> {
        Arc::clone(&self.keyboard)
    }

    /// Shutdown flag; engines check it at yield points.
    pub fn exit_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.do_exit)
    }

    #[inline]
    pub fn exit_requested(&self) -> bool {
        self.do_exit.load(Ordering::Relaxed)
    }

    pub fn set_frame_ready_callback(&mut self, callback: Box<dyn FnMut(&Renderer)>) {
        self.frame_ready_callback = Some(callback);
    }

    pub fn video(&self) -> &Video {
        &self.video
    }

    pub fn video_mut(&mut self) -> &mut Video {
        &mut self.video
    }

    pub fn serial_ula_mut(&mut self) -> &mut SerialUla {
        &mut self.serial_ula
    }

    /// Serial ULA tape-bit entry point for the cassette interface.
    pub fn receive_tape_bit(&mut self, bit: crate::serial::TapeBit) {
        self.serial_ula
            .receive_tape_bit(&mut self.acia, &mut self.irqs, bit);
    }

    pub fn adc_mut(&mut self) -> &mut Adc {
        &mut self.adc
    }

    pub fn sysvia_mut(&mut self) -> &mut Via {
        &mut self.sysvia
    }

    pub fn uservia_mut(&mut self) -> &mut Via {
        &mut self.uservia
    }

    // -----------------------------------------------------------------
    // Snapshot plumbing (threads the wheel through to the peripherals)
    // -----------------------------------------------------------------

    pub fn via_registers(&mut self, id: ViaId) -> crate::via::ViaRegisters {
        let Bus {
            timing,
            sysvia,
            uservia,
            ..
        } = self;
        match id {
            ViaId::System => sysvia.registers(timing),
            ViaId::User => uservia.registers(timing),
        }
    }

    pub fn set_via_registers(&mut self, id: ViaId, regs: &crate::via::ViaRegisters) {
        let Bus {
            timing,
            sysvia,
            uservia,
            ..
        } = self;
        match id {
            ViaId::System => sysvia.set_registers(timing, regs),
            ViaId::User => uservia.set_registers(timing, regs),
        }
    }

    pub fn set_ula_state(&mut self, control: u8, palette: &[u8; 16]) {
        let Bus { timing, video, .. } = self;
        video.set_ula_control(timing, control);
        video.set_ula_full_palette(timing, palette);
    }

    pub fn set_crtc_state(
        &mut self,
        registers: &[u8; crate::video::NUM_CRTC_REGISTERS],
        hc: u8,
        sc: u8,
        vc: u8,
        ma: u16,
        ma_row: u16,
    ) {
        let Bus { timing, video, .. } = self;
        video.set_crtc_registers(timing, registers);
        video.set_crtc_state(hc, sc, vc, ma, ma_row);
    }

    pub fn take_pending_invalidations(&mut self) -> Vec<(u16, u32)> {
        std::mem::take(&mut self.pending_invalidations)
    }

    pub fn has_pending_invalidations(&self) -> bool {
        !self.pending_invalidations.is_empty()
    }

    // -----------------------------------------------------------------
    // Timing
    // -----------------------------------------------------------------

    /// Yield to the timing wheel: advance to the (externally decremented)
    /// countdown value, firing expired timers in time order, then deliver
    /// video events. Returns the recomputed countdown.
    pub fn advance_time(&mut self, new_countdown: i64) -> i64 {
        {
            let Bus {
                timing,
                mem,
                irqs,
                sysvia,
                uservia,
                video,
                ..
            } = self;
            let (sys_t1, sys_t2) = sysvia.timer_ids();
            let (user_t1, user_t2) = uservia.timer_ids();
            let video_timer = video.timer_id();
            let mem = &*mem;

            timing.advance_with(new_countdown, |wheel, id| {
                if id == sys_t1 {
                    sysvia.t1_fired(wheel, irqs);
                } else if id == sys_t2 {
                    sysvia.t2_fired(wheel, irqs);
                } else if id == user_t1 {
                    uservia.t1_fired(wheel, irqs);
                } else if id == user_t2 {
                    uservia.t2_fired(wheel, irqs);
                } else if id == video_timer {
                    video.timer_fired(wheel, mem);
                } else {
                    unreachable!("unregistered timer fired");
                }
            });
        }
        self.process_video_events();
        self.timing.countdown()
    }

    fn process_video_events(&mut self) {
        for event in self.video.take_events() {
            match event {
                VideoEvent::Vsync(level) => {
                    self.sysvia.set_ca1(&mut self.irqs, level);
                }
                VideoEvent::FrameReady => {
                    self.video.renderer_mut().double_up_lines();
                    if let Some(callback) = self.frame_ready_callback.as_mut() {
                        callback(self.video.renderer());
                    }
                }
            }
        }
    }

    /// Wall-clock advance for externally clocked peripherals (fast mode).
    pub fn apply_wall_time_delta(&mut self, delta: u64) {
        self.sysvia
            .apply_wall_time_delta(delta, &mut self.timing, &mut self.irqs);
        self.uservia
            .apply_wall_time_delta(delta, &mut self.timing, &mut self.irqs);
        self.process_video_events();
    }

    // -----------------------------------------------------------------
    // CPU-facing memory interface
    // -----------------------------------------------------------------

    /// True when `addr` needs the MMIO path rather than the map.
    #[inline]
    pub fn needs_callback(addr: u16) -> bool {
        (MMIO_START..MMIO_END).contains(&addr)
    }

    /// CPU read. Charges the access cycle against `countdown`.
    #[inline]
    pub fn read(&mut self, addr: u16, pc: u16, countdown: &mut i64) -> u8 {
        if !Bus::needs_callback(addr) {
            *countdown -= 1;
            self.mem.read(addr, pc)
        } else {
            self.mmio_read(addr, countdown)
        }
    }

    /// CPU write, same contract as `read`.
    #[inline]
    pub fn write(&mut self, addr: u16, val: u8, pc: u16, countdown: &mut i64) {
        if !Bus::needs_callback(addr) {
            *countdown -= 1;
            self.mem.write(addr, val, pc);
        } else {
            self.mmio_write(addr, val, countdown);
        }
    }

    /// Raw read with no timing side effects (tests, debugger, snapshot).
    pub fn peek(&self, addr: u16) -> u8 {
        self.mem.read(addr, 0)
    }

    /// Raw write with no timing side effects.
    pub fn poke(&mut self, addr: u16, val: u8) {
        self.mem.write(addr, val, 0);
    }

    /// Synchronize to "now" and stall to the 1 MHz even phase, mirroring
    /// the hardware's cycle stretching for the slow bus.
    fn align_for_mmio(&mut self, countdown: &mut i64) {
        *countdown = self.advance_time(*countdown);
        if self.timing.total_ticks() & 1 == 1 {
            *countdown = self.advance_time(*countdown - 1);
        }
    }

    #[inline]
    fn step_to_mid_cycle(&mut self, countdown: &mut i64) {
        *countdown = self.advance_time(*countdown - 1);
    }

    fn mmio_read(&mut self, addr: u16, countdown: &mut i64) -> u8 {
        self.align_for_mmio(countdown);

        let val = match addr {
            0xFE40..=0xFE5F => self.sysvia_access(countdown, (addr & 0x0F) as u8, None),
            0xFE60..=0xFE7F => self.uservia_access(countdown, (addr & 0x0F) as u8, None),
            0xFE00..=0xFE07 => {
                self.step_to_mid_cycle(countdown);
                self.catch_up_video();
                self.video.crtc_read((addr & 1) as u8)
            }
            0xFE08..=0xFE0F => {
                self.step_to_mid_cycle(countdown);
                self.acia.read(&mut self.irqs, (addr & 1) as u8)
            }
            0xFE10..=0xFE17 => {
                self.step_to_mid_cycle(countdown);
                self.serial_ula.read(&mut self.acia, &mut self.irqs)
            }
            0xFE30..=0xFE33 => {
                self.step_to_mid_cycle(countdown);
                self.mem.romsel()
            }
            0xFE34..=0xFE37 => {
                self.step_to_mid_cycle(countdown);
                self.mem.acccon()
            }
            0xFE18..=0xFE1F if self.model == Model::Master => {
                self.step_to_mid_cycle(countdown);
                self.adc.read((addr & 3) as u8)
            }
            0xFEC0..=0xFEDF => {
                self.step_to_mid_cycle(countdown);
                self.adc.read((addr & 3) as u8)
            }
            _ => {
                self.step_to_mid_cycle(countdown);
                log::warn!("unimplemented: MMIO read of {:04X}", addr);
                0xFF
            }
        };
        *countdown = self.timing.countdown();
        val
    }

    fn mmio_write(&mut self, addr: u16, val: u8, countdown: &mut i64) {
        self.align_for_mmio(countdown);

        match addr {
            0xFE40..=0xFE5F => {
                self.sysvia_access(countdown, (addr & 0x0F) as u8, Some(val));
            }
            0xFE60..=0xFE7F => {
                self.uservia_access(countdown, (addr & 0x0F) as u8, Some(val));
            }
            0xFE00..=0xFE07 => {
                self.step_to_mid_cycle(countdown);
                self.catch_up_video();
                self.video
                    .crtc_write(&mut self.timing, (addr & 1) as u8, val);
            }
            0xFE08..=0xFE0F => {
                self.step_to_mid_cycle(countdown);
                let ready = self.acia.write(&mut self.irqs, (addr & 1) as u8, val);
                if ready.0 {
                    self.serial_ula
                        .transmit_ready(&mut self.acia, &mut self.irqs);
                }
            }
            0xFE10..=0xFE17 => {
                self.step_to_mid_cycle(countdown);
                self.serial_ula.write(&mut self.acia, &mut self.irqs, val);
            }
            0xFE20..=0xFE2F => {
                self.step_to_mid_cycle(countdown);
                self.catch_up_video();
                self.video.ula_write(&mut self.timing, (addr & 1) as u8, val);
            }
            0xFE30..=0xFE33 => {
                self.step_to_mid_cycle(countdown);
                self.mem.set_romsel(val);
                // Compiled code over the sideways window is stale now.
                self.pending_invalidations.push((0x8000, 0x4000));
            }
            0xFE34..=0xFE37 => {
                self.step_to_mid_cycle(countdown);
                self.mem.set_acccon(val);
                self.pending_invalidations.push((0x3000, 0x5000));
                self.pending_invalidations.push((0xC000, 0x2000));
            }
            0xFE18..=0xFE1F if self.model == Model::Master => {
                self.step_to_mid_cycle(countdown);
                self.adc_write((addr & 3) as u8, val);
            }
            0xFEC0..=0xFEDF => {
                self.step_to_mid_cycle(countdown);
                self.adc_write((addr & 3) as u8, val);
            }
            _ => {
                self.step_to_mid_cycle(countdown);
                log::warn!("unimplemented: MMIO write of {:04X}", addr);
            }
        }
        *countdown = self.timing.countdown();
    }

    fn catch_up_video(&mut self) {
        let now = self.timing.total_ticks();
        {
            let Bus { mem, video, .. } = self;
            video.advance_to(now, &*mem);
        }
        self.process_video_events();
    }

    fn adc_write(&mut self, reg: u8, val: u8) {
        let pulse = self.adc.write(reg, val);
        if pulse.0 {
            // Conversion completion pulses the system VIA's CB1.
            self.sysvia.set_cb1(&mut self.irqs, true);
            self.sysvia.set_cb1(&mut self.irqs, false);
        }
    }

    /// A system VIA access: sample timer expiry at the start cycle, step
    /// to the mid-cycle (firing timers on the way), then dispatch.
    fn sysvia_access(&mut self, countdown: &mut i64, reg: u8, write: Option<u8>) -> u8 {
        let (t1f, t2f) = self.sysvia.sample_firing(&mut self.timing);
        self.step_to_mid_cycle(countdown);

        let result = {
            let Bus {
                timing,
                irqs,
                sysvia,
                cmos,
                keyboard,
                model,
                ..
            } = self;
            let mut ports = SysBackplane {
                keyboard,
                cmos,
                model: *model,
            };
            match write {
                Some(val) => {
                    sysvia.write_mid(timing, irqs, &mut ports, reg, val, t1f, t2f);
                    0
                }
                None => sysvia.read_mid(timing, irqs, &mut ports, reg, t1f, t2f),
            }
        };
        // The addressable latch feeds the video hardware wrap-around.
        let ic32 = self.sysvia.peripheral_b();
        self.video.ic32_updated(ic32);
        result
    }

    fn uservia_access(&mut self, countdown: &mut i64, reg: u8, write: Option<u8>) -> u8 {
        let (t1f, t2f) = self.uservia.sample_firing(&mut self.timing);
        self.step_to_mid_cycle(countdown);

        let Bus {
            timing,
            irqs,
            uservia,
            ..
        } = self;
        let mut ports = UserBackplane;
        match write {
            Some(val) => {
                uservia.write_mid(timing, irqs, &mut ports, reg, val, t1f, t2f);
                0
            }
            None => uservia.read_mid(timing, irqs, &mut ports, reg, t1f, t2f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::via;

    fn make() -> Bus {
        Bus::new(&Options::default())
    }

    #[test]
    fn ram_read_write_charges_one_cycle() {
        let mut bus = make();
        let mut countdown = 100i64;
        bus.write(0x2000, 0x5A, 0, &mut countdown);
        assert_eq!(countdown, 99);
        assert_eq!(bus.read(0x2000, 0, &mut countdown), 0x5A);
        assert_eq!(countdown, 98);
    }

    #[test]
    fn os_rom_region_is_not_mmio() {
        let mut bus = make();
        let mut os = vec![0u8; 0x4000];
        os[0x3F00] = 0xD7; // maps to 0xFF00
        bus.mem.load_os_rom(&os);
        let mut countdown = 10i64;
        assert_eq!(bus.read(0xFF00, 0, &mut countdown), 0xD7);
        assert_eq!(countdown, 9);
    }

    #[test]
    fn mmio_access_aligns_to_odd_ticks() {
        let mut bus = make();
        let mut countdown = bus.timing.countdown();
        let _ = bus.read(0xFE4D, 0, &mut countdown);
        // Access lands on the device mid-cycle (odd tick).
        assert_eq!(bus.timing.total_ticks() & 1, 1);

        // And again from the now-odd phase: stall plus step.
        let mut countdown = bus.timing.countdown();
        let _ = bus.read(0xFE4D, 0, &mut countdown);
        assert_eq!(bus.timing.total_ticks() & 1, 1);
    }

    #[test]
    fn via_t1_fires_and_raises_irq_through_bus() {
        let mut bus = make();
        let mut countdown = bus.timing.countdown();
        // Enable TIMER1 interrupts, one-shot T1 = 0x0010.
        bus.write(0xFE4E, 0x80 | via::INT_TIMER1, 0, &mut countdown);
        bus.write(0xFE44, 0x10, 0, &mut countdown);
        bus.write(0xFE45, 0x00, 0, &mut countdown);
        assert!(!bus.irqs.asserted());

        // Burn enough time for the timer to expire.
        countdown -= 64;
        bus.advance_time(countdown);
        assert!(bus.irqs.asserted());
        assert!(bus.irqs.level(IrqSource::SysVia));

        // Reading IFR shows TIMER1 plus the summary bit.
        let mut countdown = bus.timing.countdown();
        let ifr = bus.read(0xFE4D, 0, &mut countdown);
        assert_eq!(ifr & via::INT_TIMER1, via::INT_TIMER1);
        assert_ne!(ifr & 0x80, 0);
    }

    #[test]
    fn romsel_switch_requests_invalidation() {
        let mut bus = make();
        bus.mem.load_rom_bank(3, &[0xC3; crate::mem::ROM_SIZE]);
        let mut countdown = bus.timing.countdown();
        bus.write(0xFE30, 3, 0, &mut countdown);
        assert_eq!(bus.peek(0x8000), 0xC3);
        let invalidations = bus.take_pending_invalidations();
        assert!(invalidations.contains(&(0x8000, 0x4000)));
    }

    #[test]
    fn unimplemented_mmio_reads_0xff() {
        let mut bus = make();
        let mut countdown = bus.timing.countdown();
        assert_eq!(bus.read(0xFC17, 0, &mut countdown), 0xFF);
        let mut countdown = bus.timing.countdown();
        assert_eq!(bus.read(0xFE80, 0, &mut countdown), 0xFF);
    }

    #[test]
    fn keyboard_scan_reaches_port_a() {
        let mut bus = make();
        let keyboard = bus.keyboard();
        keyboard.key_pressed(b'A'); // row 4, col 1

        let mut countdown = bus.timing.countdown();
        // Bit 7 is the keyboard's response line; the rest drive the scan
        // address. Select row 4 col 1 on the slow data bus.
        bus.write(0xFE43, 0x7F, 0, &mut countdown);
        bus.write(0xFE4F, 0x41, 0, &mut countdown);
        let val = bus.read(0xFE4F, 0, &mut countdown);
        // Bit 7 stays high: the addressed key is down.
        assert_ne!(val & 0x80, 0);

        keyboard.key_released(b'A');
        bus.write(0xFE4F, 0x41, 0, &mut countdown);
        let val = bus.read(0xFE4F, 0, &mut countdown);
        assert_eq!(val & 0x80, 0);
    }

    #[test]
    fn frame_ready_fires_once_per_vsync() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let mut bus = make();
        // Minimal CRTC frame: 4 chars per line, 2 one-scanline rows.
        let mut countdown = bus.timing.countdown();
        for (reg, val) in [(0u8, 3u8), (9, 0), (4, 1), (6, 1), (7, 1), (3, 0x14), (1, 1)] {
            bus.write(0xFE00, reg, 0, &mut countdown);
            bus.write(0xFE01, val, 0, &mut countdown);
        }
        let frames = Rc::new(RefCell::new(0u32));
        let frames2 = frames.clone();
        bus.set_frame_ready_callback(Box::new(move |_| *frames2.borrow_mut() += 1));

        let vsyncs_before = bus.video().num_vsyncs();
        countdown -= 160;
        bus.advance_time(countdown);
        let vsyncs = bus.video().num_vsyncs() - vsyncs_before;
        assert!(vsyncs > 0);
        assert_eq!(*frames.borrow(), vsyncs as u32);
    }

    #[test]
    fn vsync_drives_sysvia_ca1() {
        let mut bus = make();
        let mut countdown = bus.timing.countdown();
        for (reg, val) in [(0u8, 3u8), (9, 0), (4, 1), (6, 1), (7, 1), (3, 0x14), (1, 1)] {
            bus.write(0xFE00, reg, 0, &mut countdown);
            bus.write(0xFE01, val, 0, &mut countdown);
        }
        // CA1 positive edge select + enable CA1 interrupts.
        bus.write(0xFE4C, 0x01, 0, &mut countdown);
        bus.write(0xFE4E, 0x80 | via::INT_CA1, 0, &mut countdown);

        countdown -= 64;
        bus.advance_time(countdown);
        assert!(bus.irqs.level(IrqSource::SysVia));
    }

    #[test]
    fn exit_flag_round_trip() {
        let bus = make();
        assert!(!bus.exit_requested());
        bus.exit_flag().store(true, Ordering::Relaxed);
        assert!(bus.exit_requested());
    }
}
