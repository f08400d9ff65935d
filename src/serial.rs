/*!
serial.rs - The serial ULA: tape / RS-423 routing and the DCD latch.

One write-only control register selects between the cassette interface and
RS-423, picks baud rates (logged, not modeled beyond rate names) and
gates the tape motor. The ULA drives the ACIA's DCD and CTS lines:

- tape selected: CTS is active (low); DCD depends on a carrier tone having
  persisted for ~0.17 s (20 carrier bits), modeling the latch on real
  hardware;
- RS-423 selected: DCD always low; CTS active only when a host device is
  attached.

Reading the register returns 0 but has the side effects of writing 0xFE:
the ULA has no read/write pin, so a read cycle performs a write of the
address high byte left on the bus.
*/

use crate::acia::Acia;
use crate::bus::IrqLines;
use crate::options::Options;
use crate::util::has_option;

const CONTROL_RS423: u8 = 0x40;
const CONTROL_MOTOR: u8 = 0x80;

/// Carrier bits required before tape DCD asserts (~0.17 s at 1200 baud).
const CARRIER_BITS_FOR_DCD: u64 = 20;

/// One bit period of tape input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapeBit {
    Silence,
    Zero,
    One,
}

pub struct SerialUla {
    is_rs423_selected: bool,
    is_motor_on: bool,
    tape_carrier_count: u64,
    is_tape_dcd: bool,
    /// A virtual RS-423 device is attached (drives CTS).
    has_rs423_device: bool,

    is_fasttape: bool,
    fast_mode_callback: Option<Box<dyn FnMut(bool)>>,

    log_state: bool,
}

impl SerialUla {
    pub fn new(options: &Options) -> SerialUla {
        SerialUla {
            is_rs423_selected: false,
            is_motor_on: false,
            tape_carrier_count: 0,
            is_tape_dcd: false,
            has_rs423_device: false,
            is_fasttape: has_option(&options.opt_flags, "fasttape"),
            fast_mode_callback: None,
            log_state: has_option(&options.log_flags, "serial:state"),
        }
    }

    /// Host hook invoked with `true` while the tape motor runs and
    /// `fasttape` is enabled, asking the host to drop rate limiting.
    pub fn set_fast_mode_callback(&mut self, callback: Box<dyn FnMut(bool)>) {
        self.fast_mode_callback = Some(callback);
    }

    /// A virtual device is connected to the RS-423 port; drives CTS.
    pub fn set_rs423_device_attached(&mut self, attached: bool) {
        self.has_rs423_device = attached;
    }

    pub fn is_motor_on(&self) -> bool {
        self.is_motor_on
    }

    pub fn is_rs423_selected(&self) -> bool {
        self.is_rs423_selected
    }

    fn update_acia_lines(&mut self, acia: &mut Acia, irqs: &mut IrqLines) {
        // CTS: active (low) whenever tape is selected; for RS-423 only
        // with a device on the other end.
        let is_cts = if self.is_rs423_selected {
            !self.has_rs423_device
        } else {
            false
        };

        // DCD: always low for RS-423, carrier-driven for tape.
        let is_dcd = if self.is_rs423_selected {
            false
        } else {
            self.is_tape_dcd
        };

        acia.set_dcd(irqs, is_dcd);
        acia.set_cts(irqs, is_cts);
    }

    pub fn power_on_reset(&mut self, acia: &mut Acia, irqs: &mut IrqLines) {
        self.tape_carrier_count = 0;
        self.is_tape_dcd = false;
        self.set_motor(false);
        self.is_rs423_selected = false;
        self.update_acia_lines(acia, irqs);
    }

    fn set_motor(&mut self, on: bool) {
        if on == self.is_motor_on {
            return;
        }
        self.is_motor_on = on;
        if self.is_fasttape {
            if let Some(callback) = self.fast_mode_callback.as_mut() {
                callback(on);
            }
        }
    }

    /// The ACIA has a byte to send. With tape selected the byte is
    /// consumed immediately; some protection schemes depend on this.
    pub fn transmit_ready(&mut self, acia: &mut Acia, irqs: &mut IrqLines) {
        if self.is_rs423_selected {
            return;
        }
        let _ = acia.transmit(irqs);
    }

    /// Register read: returns 0 but performs the 0xFE bus write.
    pub fn read(&mut self, acia: &mut Acia, irqs: &mut IrqLines) -> u8 {
        self.write(acia, irqs, 0xFE);
        0
    }

    pub fn write(&mut self, acia: &mut Acia, irqs: &mut IrqLines, val: u8) {
        let is_rs423_selected = (val & CONTROL_RS423) != 0;
        let is_motor_on = (val & CONTROL_MOTOR) != 0;

        if self.log_state {
            const RATES: [&str; 8] = [
                "1228.8k", "76.8k", "307.2k", "9.6k", "614.4k", "19.2k", "153.6k", "4.8k",
            ];
            log::info!(
                "serial: ULA control: [R {}] [T {}] [{}] [{}]",
                RATES[((val >> 3) & 7) as usize],
                RATES[(val & 7) as usize],
                if is_rs423_selected { "RS423" } else { "TAPE" },
                if is_motor_on { "MOTOR" } else { "" }
            );
        }

        self.set_motor(is_motor_on);
        self.is_rs423_selected = is_rs423_selected;

        // Switching between RS-423 and tape, or dropping the motor, moves
        // the physical line levels.
        self.update_acia_lines(acia, irqs);
    }

    /// One tape bit period arrives from the cassette interface.
    pub fn receive_tape_bit(&mut self, acia: &mut Acia, irqs: &mut IrqLines, bit: TapeBit) {
        self.is_tape_dcd = false;

        if bit == TapeBit::Silence {
            self.tape_carrier_count = 0;
        } else {
            self.tape_carrier_count += 1;
            // The hardware doesn't raise DCD until the carrier tone has
            // persisted: "0.1 to 0.4 seconds" per the service manual,
            // ~0.17 s measured. DCD then blips rather than holding.
            if self.tape_carrier_count == CARRIER_BITS_FOR_DCD {
                self.is_tape_dcd = true;
            }
        }

        self.update_acia_lines(acia, irqs);

        if !self.is_rs423_selected {
            // Silence clocks a 0 bit into the ACIA.
            let serial_bit = bit == TapeBit::One;
            acia.receive_bit(irqs, serial_bit);
        }
    }
}
