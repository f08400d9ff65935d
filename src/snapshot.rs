/*!
snapshot.rs - BEMSNAP1 persisted machine state.

Fixed binary layout, integer fields little-endian:

    offset  size     field
    0       8        signature "BEMSNAP1"
    8       1        machine model
    9       5        A, X, Y, flags, S
    14      2        PC
    16      1        NMI line
    17      1        IRQ line bitmask
    18      4        cycle counter (low 32 bits)
    22      2        ROMSEL, ACCCON
    24      65536    memory image (32K RAM + the mapped upper 32K)
    65560   262144   sideways ROM area, 16 banks of 16K
    327704  34       system VIA block
    327738  33       user VIA block
    327771  17       video ULA control + palette
    327788  25       CRTC registers + live counters

Each VIA block is: ORA ORB IRA IRB (2 unused) DDRA DDRB SR ACR PCR IFR
IER, then T1L T2L T1C T2C as signed 32-bit tick counts at the 2 MHz
rate, then the one-shot hit flags, CA1/CA2 levels and (system VIA only)
the IC32 latch.

Save -> load -> save round-trips byte-identically; the upper 32K of the
memory image is derived from the restored ROM state and comes out the
same.
*/

use crate::bus::Bus;
use crate::cpu::state::Cpu;
use crate::mem::{NUM_ROM_BANKS, ROM_SIZE};
use crate::options::Model;
use crate::via::{ViaId, ViaRegisters};
use crate::video::NUM_CRTC_REGISTERS;

pub const SIGNATURE: &[u8; 8] = b"BEMSNAP1";
pub const SNAPSHOT_SIZE: usize = 327_813;

const OFFSET_RAM: usize = 24;
const OFFSET_ROMS: usize = OFFSET_RAM + 0x10000;
const OFFSET_SYSVIA: usize = OFFSET_ROMS + NUM_ROM_BANKS * ROM_SIZE;
const OFFSET_USERVIA: usize = OFFSET_SYSVIA + 34;
const OFFSET_ULA: usize = OFFSET_USERVIA + 33;
const OFFSET_CRTC: usize = OFFSET_ULA + 17;

struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl Writer<'_> {
    fn u8(&mut self, v: u8) {
        self.buf[self.pos] = v;
        self.pos += 1;
    }
    fn u16(&mut self, v: u16) {
        self.buf[self.pos..self.pos + 2].copy_from_slice(&v.to_le_bytes());
        self.pos += 2;
    }
    fn u32(&mut self, v: u32) {
        self.buf[self.pos..self.pos + 4].copy_from_slice(&v.to_le_bytes());
        self.pos += 4;
    }
    fn i32(&mut self, v: i32) {
        self.buf[self.pos..self.pos + 4].copy_from_slice(&v.to_le_bytes());
        self.pos += 4;
    }
    fn bytes(&mut self, v: &[u8]) {
        self.buf[self.pos..self.pos + v.len()].copy_from_slice(v);
        self.pos += v.len();
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn u8(&mut self) -> u8 {
        let v = self.buf[self.pos];
        self.pos += 1;
        v
    }
    fn u16(&mut self) -> u16 {
        let v = u16::from_le_bytes(self.buf[self.pos..self.pos + 2].try_into().unwrap());
        self.pos += 2;
        v
    }
    fn u32(&mut self) -> u32 {
        let v = u32::from_le_bytes(self.buf[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        v
    }
    fn i32(&mut self) -> i32 {
        let v = i32::from_le_bytes(self.buf[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        v
    }
    fn bytes(&mut self, len: usize) -> &'a [u8] {
        let v = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        v
    }
}

fn write_via_block(w: &mut Writer<'_>, regs: &ViaRegisters, ic32: Option<u8>) {
    w.u8(regs.ora);
    w.u8(regs.orb);
    // IRA/IRB slots carry the peripheral input levels.
    w.u8(regs.peripheral_a);
    w.u8(regs.peripheral_b);
    w.u8(0);
    w.u8(0);
    w.u8(regs.ddra);
    w.u8(regs.ddrb);
    w.u8(regs.sr);
    w.u8(regs.acr);
    w.u8(regs.pcr);
    w.u8(regs.ifr);
    w.u8(regs.ier);
    // Latches stored at the 2 MHz rate like the counters.
    w.i32(regs.t1l << 1);
    w.i32(regs.t2l << 1);
    w.i32(regs.t1c_raw);
    w.i32(regs.t2c_raw);
    w.u8(regs.t1_oneshot_fired as u8);
    w.u8(regs.t2_oneshot_fired as u8);
    w.u8(regs.ca1 as u8);
    w.u8(regs.ca2 as u8);
    if let Some(ic32) = ic32 {
        w.u8(ic32);
    }
}

fn read_via_block(r: &mut Reader<'_>, has_ic32: bool) -> (ViaRegisters, u8) {
    let mut regs = ViaRegisters::default();
    regs.ora = r.u8();
    regs.orb = r.u8();
    regs.peripheral_a = r.u8();
    regs.peripheral_b = r.u8();
    let _ = r.u8();
    let _ = r.u8();
    regs.ddra = r.u8();
    regs.ddrb = r.u8();
    regs.sr = r.u8();
    regs.acr = r.u8();
    regs.pcr = r.u8();
    regs.ifr = r.u8();
    regs.ier = r.u8();
    regs.t1l = r.i32() >> 1;
    regs.t2l = r.i32() >> 1;
    regs.t1c_raw = r.i32();
    regs.t2c_raw = r.i32();
    regs.t1_oneshot_fired = r.u8() != 0;
    regs.t2_oneshot_fired = r.u8() != 0;
    regs.ca1 = r.u8() != 0;
    regs.ca2 = r.u8() != 0;
    let ic32 = if has_ic32 { r.u8() } else { 0 };
    (regs, ic32)
}

/// Serialize the machine into a fresh snapshot image.
pub fn save(cpu: &Cpu, bus: &mut Bus) -> Vec<u8> {
    let mut image = vec![0u8; SNAPSHOT_SIZE];
    let mut w = Writer {
        buf: &mut image,
        pos: 0,
    };

    w.bytes(SIGNATURE);
    w.u8(bus.model().snapshot_id());
    w.u8(cpu.a);
    w.u8(cpu.x);
    w.u8(cpu.y);
    w.u8(cpu.flags_byte(false));
    w.u8(cpu.s);
    w.u16(cpu.pc);
    let (irq_levels, nmi_level) = bus.irqs.raw();
    w.u8(nmi_level as u8);
    w.u8(irq_levels);
    w.u32(cpu.cycles as u32);
    w.u8(bus.mem.romsel());
    w.u8(bus.mem.acccon());

    debug_assert_eq!(w.pos, OFFSET_RAM);
    for addr in 0..0x10000u32 {
        w.u8(bus.mem.read(addr as u16, 0));
    }

    debug_assert_eq!(w.pos, OFFSET_ROMS);
    for bank in 0..NUM_ROM_BANKS {
        let contents = bus.mem.rom_bank_contents(bank);
        w.bytes(&contents);
    }

    debug_assert_eq!(w.pos, OFFSET_SYSVIA);
    let sys = bus.via_registers(ViaId::System);
    write_via_block(&mut w, &sys, Some(sys.peripheral_b));
    debug_assert_eq!(w.pos, OFFSET_USERVIA);
    let user = bus.via_registers(ViaId::User);
    write_via_block(&mut w, &user, None);

    debug_assert_eq!(w.pos, OFFSET_ULA);
    w.u8(bus.video().ula_control());
    let palette = bus.video().ula_full_palette();
    w.bytes(&palette);

    debug_assert_eq!(w.pos, OFFSET_CRTC);
    let registers = bus.video().crtc_registers();
    w.bytes(&registers);
    let (hc, sc, vc, ma, ma_row) = bus.video().crtc_state();
    w.u8(vc);
    w.u8(sc);
    w.u8(hc);
    w.u8((ma >> 8) as u8);
    w.u8(ma as u8);
    w.u8((ma_row >> 8) as u8);
    w.u8(ma_row as u8);

    debug_assert_eq!(w.pos, SNAPSHOT_SIZE);
    image
}

/// Restore a snapshot into the machine. Fatal header problems come back
/// as errors for the caller to report.
pub fn load(image: &[u8], cpu: &mut Cpu, bus: &mut Bus) -> Result<(), String> {
    if image.len() != SNAPSHOT_SIZE {
        return Err(format!(
            "wrong snapshot size (expected {SNAPSHOT_SIZE}, got {})",
            image.len()
        ));
    }
    let mut r = Reader { buf: image, pos: 0 };
    if r.bytes(8) != SIGNATURE {
        return Err("file is not a BEMSNAP1 snapshot".to_string());
    }
    let model_id = r.u8();
    let Some(model) = Model::from_snapshot_id(model_id) else {
        return Err(format!("unsupported snapshot model {model_id}"));
    };
    if model != bus.model() {
        return Err(format!(
            "snapshot model {:?} does not match machine {:?}",
            model,
            bus.model()
        ));
    }

    cpu.a = r.u8();
    cpu.x = r.u8();
    cpu.y = r.u8();
    let flags = r.u8();
    cpu.set_flags_byte(flags);
    cpu.s = r.u8();
    cpu.pc = r.u16();
    let nmi = r.u8() != 0;
    let irq_levels = r.u8();
    bus.irqs.set_raw(irq_levels, nmi);
    cpu.cycles = r.u32() as u64;
    cpu.halted = false;
    let romsel = r.u8();
    let acccon = r.u8();

    let memory = r.bytes(0x10000);
    bus.mem.set_ram(&memory[..0x8000]);
    // The upper half of the memory image is the mapped view; the OS ROM
    // part of it is authoritative, the sideways part is derived.
    bus.mem.load_os_rom(&memory[0xC000..0x10000]);

    for bank in 0..NUM_ROM_BANKS {
        let contents = r.bytes(ROM_SIZE);
        bus.mem.set_rom_bank_contents(bank, contents);
    }
    bus.mem.set_romsel(romsel);
    if model == Model::Master {
        bus.mem.set_acccon(acccon);
    }

    let (sys_regs, _ic32) = read_via_block(&mut r, true);
    bus.set_via_registers(ViaId::System, &sys_regs);
    let (user_regs, _) = read_via_block(&mut r, false);
    bus.set_via_registers(ViaId::User, &user_regs);

    let control = r.u8();
    let palette: [u8; 16] = r.bytes(16).try_into().unwrap();
    bus.set_ula_state(control, &palette);

    let registers: [u8; NUM_CRTC_REGISTERS] = r.bytes(NUM_CRTC_REGISTERS).try_into().unwrap();
    let vc = r.u8();
    let sc = r.u8();
    let hc = r.u8();
    let ma_high = r.u8();
    let ma_low = r.u8();
    let ma_row_high = r.u8();
    let ma_row_low = r.u8();
    bus.set_crtc_state(
        &registers,
        hc,
        sc,
        vc,
        ((ma_high as u16) << 8) | ma_low as u16,
        ((ma_row_high as u16) << 8) | ma_row_low as u16,
    );

    debug_assert_eq!(r.pos, SNAPSHOT_SIZE);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Options;

    fn machine() -> (Cpu, Bus) {
        let mut bus = Bus::new(&Options::default());
        bus.mem.load_os_rom(&crate::test_utils::os_image());
        (Cpu::new(), bus)
    }

    #[test]
    fn header_round_trip() {
        let (mut cpu, mut bus) = machine();
        cpu.a = 0x12;
        cpu.x = 0x34;
        cpu.y = 0x56;
        cpu.pc = 0xABCD;
        cpu.flag_c = true;
        cpu.flag_n = true;
        bus.poke(0x1234, 0x99);

        let image = save(&cpu, &mut bus);
        assert_eq!(&image[0..8], SIGNATURE);

        let (mut cpu2, mut bus2) = machine();
        load(&image, &mut cpu2, &mut bus2).unwrap();
        assert_eq!(cpu2.a, 0x12);
        assert_eq!(cpu2.pc, 0xABCD);
        assert!(cpu2.flag_c && cpu2.flag_n);
        assert_eq!(bus2.peek(0x1234), 0x99);
    }

    #[test]
    fn save_load_save_is_byte_identical() {
        let (mut cpu, mut bus) = machine();
        cpu.a = 0x42;
        bus.mem.load_rom_bank(5, &[0xB5; ROM_SIZE]);
        bus.mem.set_romsel(5);
        bus.poke(0x2000, 0x77);

        let image = save(&cpu, &mut bus);
        let (mut cpu2, mut bus2) = machine();
        load(&image, &mut cpu2, &mut bus2).unwrap();
        let image2 = save(&cpu2, &mut bus2);
        assert_eq!(image, image2);
    }

    #[test]
    fn bad_signature_is_rejected() {
        let (mut cpu, mut bus) = machine();
        let mut image = save(&cpu, &mut bus);
        image[0] = b'X';
        assert!(load(&image, &mut cpu, &mut bus).is_err());
    }

    #[test]
    fn wrong_size_is_rejected() {
        let (mut cpu, mut bus) = machine();
        assert!(load(&[0u8; 100], &mut cpu, &mut bus).is_err());
    }

    #[test]
    fn via_timer_state_survives() {
        let (cpu, mut bus) = machine();
        // Arm T1 through the MMIO path.
        let mut countdown = bus.timing.countdown();
        bus.write(0xFE44, 0x34, 0, &mut countdown);
        bus.write(0xFE45, 0x12, 0, &mut countdown);

        let image = save(&cpu, &mut bus);
        let (mut cpu2, mut bus2) = machine();
        load(&image, &mut cpu2, &mut bus2).unwrap();

        let regs = bus2.via_registers(crate::via::ViaId::System);
        assert_eq!(regs.t1l, 0x1234);
        assert!(!regs.t1_oneshot_fired);
    }
}
