/*!
acia.rs - 6850-style asynchronous communications interface adapter.

Two-register window (status/control, data). Receive and transmit are
byte-wide here; the serial ULA feeds tape bits through `receive_bit`,
which runs a minimal start/data/stop framer and delivers whole bytes.

DCD latching is the subtle part: the low-to-high line edge sets the status
bit and holds it (and the interrupt) until the data register is read, even
if the line drops again. While unlatched, the status bit follows the line.
*/

use crate::bus::{IrqLines, IrqSource};
use crate::options::Options;
use crate::util::has_option;

pub const STATUS_RDRF: u8 = 0x01;
pub const STATUS_TDRE: u8 = 0x02;
pub const STATUS_DCD: u8 = 0x04;
pub const STATUS_CTS: u8 = 0x08;
pub const STATUS_IRQ: u8 = 0x80;

const CONTROL_TCB_MASK: u8 = 0x60;
const CONTROL_RIE: u8 = 0x80;
const TCB_RTS_AND_TIE: u8 = 0x20;
const TCB_NO_RTS_NO_TIE: u8 = 0x40;

/// Raised by a data-register write; the bus forwards it to the serial ULA.
#[must_use]
pub struct TransmitReady(pub bool);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxFrame {
    Idle,
    Data(u8),
    Stop,
}

pub struct Acia {
    control: u8,
    status: u8,
    receive: u8,
    transmit: u8,
    is_dcd: bool,
    is_cts: bool,

    frame: RxFrame,
    frame_bits: u8,

    log_state: bool,
    log_bytes: bool,
}

impl Acia {
    pub fn new(options: &Options) -> Acia {
        let mut acia = Acia {
            control: 0,
            status: 0,
            receive: 0,
            transmit: 0,
            is_dcd: false,
            is_cts: false,
            frame: RxFrame::Idle,
            frame_bits: 0,
            log_state: has_option(&options.log_flags, "serial:state"),
            log_bytes: has_option(&options.log_flags, "serial:bytes"),
        };
        acia.power_on_reset_registers();
        acia
    }

    fn power_on_reset_registers(&mut self) {
        self.receive = 0;
        self.transmit = 0;
        // TDRE set, everything else clear.
        self.status = STATUS_TDRE;
        self.control = 0;
    }

    pub fn power_on_reset(&mut self, irqs: &mut IrqLines) {
        self.power_on_reset_registers();
        // Reset cannot change external line levels; refresh the status
        // bits they feed.
        self.set_dcd(irqs, self.is_dcd);
        self.set_cts(irqs, self.is_cts);
    }

    fn update_irq(&mut self, irqs: &mut IrqLines) {
        let mut fire_send = false;
        if (self.control & CONTROL_TCB_MASK) == TCB_RTS_AND_TIE {
            fire_send = (self.status & STATUS_TDRE) != 0 && !self.is_cts;
        }

        let mut fire_receive = false;
        if (self.control & CONTROL_RIE) != 0 {
            fire_receive =
                (self.status & STATUS_RDRF) != 0 || (self.status & STATUS_DCD) != 0;
        }

        let fire = fire_send || fire_receive;
        self.status &= !STATUS_IRQ;
        if fire {
            self.status |= STATUS_IRQ;
        }
        irqs.set_level(IrqSource::Serial, fire);
    }

    /// Drive the DCD line. The low-to-high edge latches the status bit;
    /// high-to-low has no effect until the latch is cleared by a data
    /// register read.
    pub fn set_dcd(&mut self, irqs: &mut IrqLines, is_dcd: bool) {
        if is_dcd && !self.is_dcd {
            if self.log_state {
                log::info!("serial: DCD going high");
            }
            self.status |= STATUS_DCD;
        }
        self.is_dcd = is_dcd;
        self.update_irq(irqs);
    }

    pub fn set_cts(&mut self, irqs: &mut IrqLines, is_cts: bool) {
        self.status &= !STATUS_CTS;
        if is_cts {
            self.status |= STATUS_CTS;
        }
        self.is_cts = is_cts;
        self.update_irq(irqs);
    }

    pub fn get_rts(&self) -> bool {
        if (self.control & CONTROL_TCB_MASK) == TCB_NO_RTS_NO_TIE {
            return false;
        }
        (self.status & STATUS_RDRF) == 0
    }

    pub fn is_transmit_pending(&self) -> bool {
        (self.status & STATUS_TDRE) == 0
    }

    /// Deliver a received byte.
    pub fn receive(&mut self, irqs: &mut IrqLines, byte: u8) {
        if self.log_bytes {
            log::info!("serial: byte received: {} (0x{:02X})", byte, byte);
        }
        if (self.status & STATUS_RDRF) != 0 {
            log::warn!("unimplemented: serial receive buffer full");
        }
        self.status |= STATUS_RDRF;
        self.receive = byte;
        self.update_irq(irqs);
    }

    /// Clock one received line bit through the start/data/stop framer.
    pub fn receive_bit(&mut self, irqs: &mut IrqLines, bit: bool) {
        match self.frame {
            RxFrame::Idle => {
                // A low line is a start bit.
                if !bit {
                    self.frame = RxFrame::Data(0);
                    self.frame_bits = 0;
                }
            }
            RxFrame::Data(acc) => {
                // LSB arrives first.
                let acc = acc | ((bit as u8) << self.frame_bits);
                self.frame_bits += 1;
                if self.frame_bits == 8 {
                    self.frame = RxFrame::Stop;
                    self.receive(irqs, acc);
                } else {
                    self.frame = RxFrame::Data(acc);
                }
            }
            RxFrame::Stop => {
                // Consume the stop bit; framing errors are not modeled.
                self.frame = RxFrame::Idle;
            }
        }
    }

    /// Take the pending transmit byte, marking the register empty.
    pub fn transmit(&mut self, irqs: &mut IrqLines) -> u8 {
        debug_assert!(self.is_transmit_pending());
        self.status |= STATUS_TDRE;
        self.update_irq(irqs);
        self.transmit
    }

    pub fn read(&mut self, irqs: &mut IrqLines, reg: u8) -> u8 {
        if reg == 0 {
            let mut ret = self.status;

            // A high CTS line inhibits TDRE in the status read.
            if self.is_cts {
                ret &= !STATUS_TDRE;
            }

            // If the DCD-went-high bit isn't latched, it follows the line.
            if (ret & STATUS_DCD) == 0 && self.is_dcd {
                ret |= STATUS_DCD;
            }
            ret
        } else {
            // Data register: clears RDRF and the DCD latch.
            self.status &= !STATUS_RDRF;
            self.status &= !STATUS_DCD;
            self.update_irq(irqs);
            self.receive
        }
    }

    pub fn write(&mut self, irqs: &mut IrqLines, reg: u8, val: u8) -> TransmitReady {
        let mut transmit_ready = false;
        if reg == 0 {
            if (val & 0x03) == 0x03 {
                // Master reset. The data sheet claims other control bits
                // survive, but an active interrupt is observably cleared,
                // so the whole control register goes.
                if self.log_state {
                    log::info!("serial: reset");
                }
                self.power_on_reset(irqs);
            } else {
                self.control = val;
            }
            if self.log_state {
                const BITMODES: [&str; 8] =
                    ["7E2", "7O2", "7E1", "7O1", "8N2", "8N1", "8E1", "8N1"];
                const DIVIDERS: [&str; 4] = ["/1", "/16", "/64", "RESET"];
                log::info!(
                    "serial: control register now: ${:02X} [{}] [{}]",
                    self.control,
                    BITMODES[((self.control >> 2) & 0x07) as usize],
                    DIVIDERS[(self.control & 0x03) as usize]
                );
            }
        } else {
            if (self.status & STATUS_TDRE) == 0 {
                log::warn!("unimplemented: serial transmit buffer full");
            }
            self.transmit = val;
            self.status &= !STATUS_TDRE;
            transmit_ready = true;
        }

        self.update_irq(irqs);
        TransmitReady(transmit_ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make() -> (Acia, IrqLines) {
        (Acia::new(&Options::default()), IrqLines::new())
    }

    #[test]
    fn power_on_status_is_tdre_only() {
        let (mut acia, mut irqs) = make();
        assert_eq!(acia.read(&mut irqs, 0), STATUS_TDRE);
    }

    #[test]
    fn receive_sets_rdrf_and_data_read_clears() {
        let (mut acia, mut irqs) = make();
        acia.receive(&mut irqs, 0x55);
        assert_ne!(acia.read(&mut irqs, 0) & STATUS_RDRF, 0);
        assert_eq!(acia.read(&mut irqs, 1), 0x55);
        assert_eq!(acia.read(&mut irqs, 0) & STATUS_RDRF, 0);
    }

    #[test]
    fn receive_irq_when_enabled() {
        let (mut acia, mut irqs) = make();
        acia.write(&mut irqs, 0, CONTROL_RIE);
        assert!(!irqs.asserted());
        acia.receive(&mut irqs, 0xA5);
        assert!(irqs.asserted());
        assert_ne!(acia.read(&mut irqs, 0) & STATUS_IRQ, 0);

        let _ = acia.read(&mut irqs, 1);
        assert!(!irqs.asserted());
    }

    #[test]
    fn dcd_latch_holds_after_line_drop() {
        let (mut acia, mut irqs) = make();
        acia.set_dcd(&mut irqs, true);
        acia.set_dcd(&mut irqs, false);
        // Latched high even though the line dropped.
        assert_ne!(acia.read(&mut irqs, 0) & STATUS_DCD, 0);

        // A data read unlatches; the bit then follows the (low) line.
        let _ = acia.read(&mut irqs, 1);
        assert_eq!(acia.read(&mut irqs, 0) & STATUS_DCD, 0);
    }

    #[test]
    fn dcd_follows_line_while_unlatched_is_cleared_by_data_read() {
        let (mut acia, mut irqs) = make();
        acia.set_dcd(&mut irqs, true);
        let _ = acia.read(&mut irqs, 1);
        // Line still high: status shows DCD from the line level.
        assert_ne!(acia.read(&mut irqs, 0) & STATUS_DCD, 0);
        acia.set_dcd(&mut irqs, false);
        assert_eq!(acia.read(&mut irqs, 0) & STATUS_DCD, 0);
    }

    #[test]
    fn cts_inhibits_tdre() {
        let (mut acia, mut irqs) = make();
        acia.set_cts(&mut irqs, true);
        let status = acia.read(&mut irqs, 0);
        assert_ne!(status & STATUS_CTS, 0);
        assert_eq!(status & STATUS_TDRE, 0);
    }

    #[test]
    fn transmit_round_trip() {
        let (mut acia, mut irqs) = make();
        let ready = acia.write(&mut irqs, 1, 0x42);
        assert!(ready.0);
        assert!(acia.is_transmit_pending());
        assert_eq!(acia.transmit(&mut irqs), 0x42);
        assert!(!acia.is_transmit_pending());
    }

    #[test]
    fn master_reset_clears_control_and_irq() {
        let (mut acia, mut irqs) = make();
        acia.write(&mut irqs, 0, CONTROL_RIE);
        acia.receive(&mut irqs, 0x01);
        assert!(irqs.asserted());

        let _ = acia.write(&mut irqs, 0, 0x03);
        assert!(!irqs.asserted());
        assert_eq!(acia.read(&mut irqs, 0), STATUS_TDRE);
    }

    #[test]
    fn bit_framer_assembles_bytes_lsb_first() {
        let (mut acia, mut irqs) = make();
        // Frame 0xA3 = 1010_0011: start(0), bits LSB first, stop(1).
        let byte = 0xA3u8;
        acia.receive_bit(&mut irqs, false);
        for i in 0..8 {
            acia.receive_bit(&mut irqs, (byte >> i) & 1 != 0);
        }
        acia.receive_bit(&mut irqs, true);
        assert_eq!(acia.read(&mut irqs, 1), 0xA3);
    }
}
