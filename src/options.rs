/*!
options.rs - Machine model selection and construction-time options.

The `Options` record is threaded by reference through every constructor so
peripherals can probe opt/log flags once and cache booleans. The CLI that
produces it lives outside the core; `Options::default()` is what tests use.
*/

/// Emulated machine model.
///
/// `B` is the classic model B with an NMOS 6502; `Master` selects the 65C12
/// opcode maps and enables the ACCCON paging latches (ANDY/HAZEL/LYNNE).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Model {
    B,
    Master,
}

impl Model {
    /// Snapshot model byte (b-em numbering: 3 = model B, 6 = Master 128).
    pub fn snapshot_id(self) -> u8 {
        match self {
            Model::B => 3,
            Model::Master => 6,
        }
    }

    pub fn from_snapshot_id(id: u8) -> Option<Model> {
        match id {
            3 => Some(Model::B),
            6 => Some(Model::Master),
            _ => None,
        }
    }
}

/// Construction-time options for the core.
#[derive(Debug, Clone)]
pub struct Options {
    pub model: Model,
    /// Cycle-accurate peripheral timing in the faster engines (the
    /// interpreter is always accurate).
    pub accurate: bool,
    /// Emit the per-instruction debug hook in the generated engines.
    pub debug: bool,
    /// Comma-separated behavior flags, e.g. `video:border-chars=4`.
    pub opt_flags: String,
    /// Comma-separated log enables, e.g. `serial:state,cmos:all`.
    pub log_flags: String,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            model: Model::B,
            accurate: true,
            debug: false,
            opt_flags: String::new(),
            log_flags: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_model_round_trip() {
        for model in [Model::B, Model::Master] {
            assert_eq!(Model::from_snapshot_id(model.snapshot_id()), Some(model));
        }
        assert_eq!(Model::from_snapshot_id(0), None);
    }
}
