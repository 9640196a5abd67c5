//! Per-tick fault flags.
//!
//! Faults raised inside a periodic tick are never propagated as errors.
//! Each tick collects them into a [`TickFaults`] set which is forwarded to
//! telemetry and folded into the health counters.

use bitflags::bitflags;

bitflags! {
    /// Non-fatal faults observed during one estimation or control tick.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TickFaults: u16 {
        /// Tick started after its deadline.
        const OVERRUN               = 0x0001;
        /// Control tick consumed an already-seen snapshot.
        const STALE_READ            = 0x0002;
        /// Command failed structural validation and was dropped.
        const INVALID_COMMAND       = 0x0004;
        /// Transition request named an unregistered state.
        const ILLEGAL_REQUEST       = 0x0008;
        /// Transition outside the narrowed allowed set was refused.
        const ILLEGAL_TRANSITION    = 0x0010;
        /// Failure signaled with no fallback state registered.
        const UNREGISTERED_FALLBACK = 0x0020;
        /// Sensor read failed; no snapshot published this tick.
        const SENSOR_FAULT          = 0x0040;
        /// Control tick ran with no snapshot available.
        const NO_SNAPSHOT           = 0x0080;
    }
}

impl TickFaults {
    /// Faults that come from configuration gaps rather than runtime
    /// conditions.
    pub const CONFIG_MASK: Self = Self::from_bits_truncate(
        Self::ILLEGAL_REQUEST.bits()
            | Self::ILLEGAL_TRANSITION.bits()
            | Self::UNREGISTERED_FALLBACK.bits(),
    );

    /// Returns true if any configuration-gap flag is set.
    #[inline]
    pub const fn has_config_gap(&self) -> bool {
        self.intersects(Self::CONFIG_MASK)
    }
}

impl Default for TickFaults {
    fn default() -> Self {
        Self::empty()
    }
}
