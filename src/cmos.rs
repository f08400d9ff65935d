/*!
cmos.rs - Master-series CMOS RAM / RTC chip, read path only.

The chip hangs off the system VIA: port B bits gate enable and the
address strobe, IC32 latch bits select data direction and read mode, and
port A carries the address or data byte. Only reads are emulated; writes
are logged and dropped.
*/

use crate::options::Options;
use crate::util::has_option;

const PORT_B_ADDRESS_STROBE: u8 = 0x80;
const PORT_B_ENABLE: u8 = 0x40;

const IC32_DATA: u8 = 0x04;
const IC32_READ: u8 = 0x02;

/// Default CMOS contents: sensible OS configuration defaults.
const CMOS_DEFAULTS: [u8; 64] = [
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0xC9, 0xFF, 0xFF, 0x12, 0x00, //
    0x17, 0xCA, 0x1E, 0x05, 0x00, 0x35, 0xA6, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
];

pub struct Cmos {
    log: bool,
    enabled: bool,
    address_strobe: bool,
    data: bool,
    read: bool,
    addr: u8,
}

impl Cmos {
    pub fn new(options: &Options) -> Cmos {
        Cmos {
            log: has_option(&options.log_flags, "cmos:all"),
            enabled: false,
            address_strobe: false,
            data: false,
            read: false,
            addr: 0,
        }
    }

    /// True while the chip is selected for read and driving the bus.
    pub fn is_driving(&self) -> bool {
        self.enabled && !self.address_strobe && self.data && self.read
    }

    /// Value the chip drives onto the slow data bus, or 0xFF when it is
    /// not selected for read.
    pub fn bus_value(&self) -> u8 {
        debug_assert!(self.addr < 64);

        if self.enabled && !self.address_strobe && self.data && self.read {
            let val = CMOS_DEFAULTS[self.addr as usize];
            if self.log {
                log::info!("cmos: address {:02X} value {:02X} on bus", self.addr, val);
            }
            val
        } else {
            0xFF
        }
    }

    /// Follow the system VIA port B / IC32 control lines.
    pub fn update_external_inputs(&mut self, port_b: u8, port_a: u8, ic32: u8) {
        let enabled = (port_b & PORT_B_ENABLE) != 0;
        let new_address_strobe = (port_b & PORT_B_ADDRESS_STROBE) != 0;
        let new_data = (ic32 & IC32_DATA) != 0;
        let new_read = (ic32 & IC32_READ) != 0;

        self.enabled = enabled;
        if !enabled {
            return;
        }

        // The address strobe high -> low edge latches the address.
        if !new_address_strobe && self.address_strobe {
            self.addr = port_a & 0x3F;
            if self.log {
                log::info!("cmos: new address {:02X}", self.addr);
            }
        }
        self.address_strobe = new_address_strobe;

        // The data line dropping in write mode would perform a write;
        // only reads are emulated.
        if !new_data && !self.data && !new_address_strobe && !new_read {
            log::warn!(
                "unimplemented: cmos WRITE address {:02X} value {:02X}",
                self.addr,
                port_a
            );
        }

        self.data = new_data;
        self.read = new_read;

        if self.log {
            log::info!(
                "cmos: enabled {} address_strobe {} data {} read {}",
                self.enabled,
                self.address_strobe,
                self.data,
                self.read
            );
        }
    }
}
