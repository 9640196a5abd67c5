//! Built-in high-level behavior identities.
//!
//! The catalogue is closed: each variant maps to one state implementation
//! registered with the behavior state machine. Ids are `#[repr(u8)]` so
//! they can be requested across threads through an atomic.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// High-level behavior of the robot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum HighLevelBehavior {
    /// All joints off.
    DoNothing = 0,
    /// Interpolate from the measured pose to the stand pose.
    StandPrep = 1,
    /// Hold the stand pose.
    StandReady = 2,
    /// Hold the pose captured on entry.
    Freeze = 3,
    /// Small per-joint position sweep around the stand pose.
    Diagnostic = 4,
}

impl HighLevelBehavior {
    /// Every variant, in id order.
    pub const ALL: [Self; 5] = [
        Self::DoNothing,
        Self::StandPrep,
        Self::StandReady,
        Self::Freeze,
        Self::Diagnostic,
    ];

    /// Convert from raw `u8`. Returns `None` for invalid values.
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::DoNothing),
            1 => Some(Self::StandPrep),
            2 => Some(Self::StandReady),
            3 => Some(Self::Freeze),
            4 => Some(Self::Diagnostic),
            _ => None,
        }
    }

    /// Snake-case name, identical to the TOML spelling.
    pub const fn name(self) -> &'static str {
        match self {
            Self::DoNothing => "do_nothing",
            Self::StandPrep => "stand_prep",
            Self::StandReady => "stand_ready",
            Self::Freeze => "freeze",
            Self::Diagnostic => "diagnostic",
        }
    }
}

impl Default for HighLevelBehavior {
    fn default() -> Self {
        Self::DoNothing
    }
}

impl fmt::Display for HighLevelBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error for [`HighLevelBehavior::from_str`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown behavior '{0}'")]
pub struct UnknownBehavior(pub String);

impl FromStr for HighLevelBehavior {
    type Err = UnknownBehavior;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|b| b.name() == s)
            .ok_or_else(|| UnknownBehavior(s.to_string()))
    }
}
