//! Joint table built once at startup from configuration.
//!
//! The table is the single source of truth for which joints exist and in
//! which order their values appear in snapshots and commands. It replaces
//! any static joint registry: build it from `[[joints]]`, wrap it in an
//! `Arc`, and hand it to every component that needs joint lookups.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::consts::MAX_JOINTS;

/// Dense joint index (`0..joint_count`), the position of the joint in the
/// configured table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JointId(pub u16);

impl JointId {
    /// Array index of this joint.
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// One `[[joints]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JointConfig {
    /// Unique joint name (e.g. `"l_knee"`).
    pub name: String,
    /// Nominal standing position [rad], used by the stand behaviors.
    #[serde(default)]
    pub stand_position: f64,
}

/// Ordered, immutable joint table.
#[derive(Debug, Clone, PartialEq)]
pub struct JointMap {
    names: Vec<String>,
    stand_positions: Vec<f64>,
    by_name: HashMap<String, JointId>,
}

impl JointMap {
    /// Build the table from the configured joint list.
    ///
    /// # Errors
    /// `ConfigError::ValidationError` when the list is empty, exceeds
    /// [`MAX_JOINTS`], contains an empty or duplicate name, or a non-finite
    /// stand position.
    pub fn from_config(joints: &[JointConfig]) -> Result<Self, ConfigError> {
        if joints.is_empty() {
            return Err(ConfigError::ValidationError(
                "joint table is empty".to_string(),
            ));
        }
        if joints.len() > MAX_JOINTS {
            return Err(ConfigError::ValidationError(format!(
                "{} joints configured, at most {MAX_JOINTS} supported",
                joints.len()
            )));
        }

        let mut by_name = HashMap::with_capacity(joints.len());
        for (idx, joint) in joints.iter().enumerate() {
            if joint.name.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "joint #{idx} has an empty name"
                )));
            }
            if !joint.stand_position.is_finite() {
                return Err(ConfigError::ValidationError(format!(
                    "joint '{}' has a non-finite stand_position",
                    joint.name
                )));
            }
            if by_name
                .insert(joint.name.clone(), JointId(idx as u16))
                .is_some()
            {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate joint name '{}'",
                    joint.name
                )));
            }
        }

        Ok(Self {
            names: joints.iter().map(|j| j.name.clone()).collect(),
            stand_positions: joints.iter().map(|j| j.stand_position).collect(),
            by_name,
        })
    }

    /// Build a table from bare names with zero stand positions (tests, tools).
    pub fn from_names<I, S>(names: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let joints: Vec<JointConfig> = names
            .into_iter()
            .map(|name| JointConfig {
                name: name.into(),
                stand_position: 0.0,
            })
            .collect();
        Self::from_config(&joints)
    }

    /// Number of joints in the table.
    #[inline]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Always false for a successfully built table.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// True if `joint` indexes into this table.
    #[inline]
    pub fn contains(&self, joint: JointId) -> bool {
        joint.index() < self.names.len()
    }

    /// Look a joint up by name.
    pub fn id(&self, name: &str) -> Option<JointId> {
        self.by_name.get(name).copied()
    }

    /// Name of a joint, if it exists.
    pub fn name(&self, joint: JointId) -> Option<&str> {
        self.names.get(joint.index()).map(String::as_str)
    }

    /// Configured stand position of a joint [rad].
    pub fn stand_position(&self, joint: JointId) -> Option<f64> {
        self.stand_positions.get(joint.index()).copied()
    }

    /// Iterate all joint ids in table order.
    pub fn ids(&self) -> impl Iterator<Item = JointId> + '_ {
        (0..self.names.len()).map(|i| JointId(i as u16))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn joint(name: &str, stand: f64) -> JointConfig {
        JointConfig {
            name: name.to_string(),
            stand_position: stand,
        }
    }

    #[test]
    fn builds_ordered_table() {
        let map =
            JointMap::from_config(&[joint("l_hip", 0.1), joint("l_knee", -0.4)]).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map.id("l_knee"), Some(JointId(1)));
        assert_eq!(map.name(JointId(0)), Some("l_hip"));
        assert_eq!(map.stand_position(JointId(1)), Some(-0.4));
        assert!(map.contains(JointId(1)));
        assert!(!map.contains(JointId(2)));
        assert_eq!(map.ids().count(), 2);
    }

    #[test]
    fn rejects_duplicates() {
        let err = JointMap::from_config(&[joint("neck", 0.0), joint("neck", 0.0)]).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn rejects_empty_table_and_names() {
        assert!(JointMap::from_config(&[]).is_err());
        assert!(JointMap::from_config(&[joint("", 0.0)]).is_err());
    }

    #[test]
    fn rejects_non_finite_stand_position() {
        assert!(JointMap::from_config(&[joint("waist", f64::NAN)]).is_err());
    }

    #[test]
    fn rejects_oversized_table() {
        let names: Vec<String> = (0..=MAX_JOINTS).map(|i| format!("j{i}")).collect();
        assert!(JointMap::from_names(names).is_err());
    }
}
