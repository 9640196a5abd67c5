//! Controller core command sink.
//!
//! Boundary between the active behavior state and the external output
//! layer. The sink validates structure only; it never interprets values.
//! An invalid command is dropped for that tick and the writer is told the
//! tick was skipped. The previous command is never replayed.

use std::sync::Arc;

use humanoid_common::control::command::{CommandError, ControllerCoreCommand};
use humanoid_common::control::joint::JointMap;

/// Actuation output collaborator.
pub trait OutputWriter: Send + 'static {
    /// Called once before the first command.
    fn initialize(&mut self, _joints: &JointMap) {}

    /// Forward one validated command. Called at most once per control tick.
    fn apply(&mut self, command: &ControllerCoreCommand);

    /// No valid command this tick. The writer decides its fail-safe
    /// behavior (hold last, zero torque, ...).
    fn skip(&mut self) {}
}

/// Sink counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SinkStats {
    pub accepted: u64,
    pub rejected: u64,
    /// Ticks that produced no command at all.
    pub skipped: u64,
    pub last_rejection: Option<CommandError>,
}

/// Validating command sink wrapping an [`OutputWriter`].
pub struct CommandSink<W: OutputWriter> {
    joints: Arc<JointMap>,
    writer: W,
    stats: SinkStats,
}

impl<W: OutputWriter> CommandSink<W> {
    /// Wrap `writer` and initialize it with the joint table.
    pub fn new(joints: Arc<JointMap>, mut writer: W) -> Self {
        writer.initialize(&joints);
        Self {
            joints,
            writer,
            stats: SinkStats::default(),
        }
    }

    /// Validate `command` and forward it, or drop it and report why.
    pub fn submit(&mut self, command: &ControllerCoreCommand) -> Result<(), CommandError> {
        match command.validate(&self.joints) {
            Ok(()) => {
                self.writer.apply(command);
                self.stats.accepted += 1;
                Ok(())
            }
            Err(e) => {
                self.writer.skip();
                self.stats.rejected += 1;
                self.stats.last_rejection = Some(e.clone());
                Err(e)
            }
        }
    }

    /// No command was produced this tick. The writer falls back to its
    /// own fail-safe behavior.
    pub fn skip(&mut self) {
        self.writer.skip();
        self.stats.skipped += 1;
    }

    pub fn stats(&self) -> &SinkStats {
        &self.stats
    }

    pub fn joints(&self) -> &Arc<JointMap> {
        &self.joints
    }

    pub fn writer(&self) -> &W {
        &self.writer
    }

    pub fn into_writer(self) -> W {
        self.writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use humanoid_common::control::command::{JointControlMode, JointDesired};
    use humanoid_common::control::joint::JointId;

    #[derive(Default)]
    struct Recorder {
        initialized_with: usize,
        applied: Vec<ControllerCoreCommand>,
        skipped: u32,
    }

    impl OutputWriter for Recorder {
        fn initialize(&mut self, joints: &JointMap) {
            self.initialized_with = joints.len();
        }
        fn apply(&mut self, command: &ControllerCoreCommand) {
            self.applied.push(command.clone());
        }
        fn skip(&mut self) {
            self.skipped += 1;
        }
    }

    fn sink() -> CommandSink<Recorder> {
        let joints = Arc::new(JointMap::from_names(["hip", "knee"]).unwrap());
        CommandSink::new(joints, Recorder::default())
    }

    #[test]
    fn writer_initialized_with_joint_table() {
        assert_eq!(sink().writer().initialized_with, 2);
    }

    #[test]
    fn valid_command_is_forwarded() {
        let mut sink = sink();
        let mut cmd = ControllerCoreCommand::new();
        cmd.push(JointDesired::position(JointId(0), 0.1, 0.0));
        cmd.push(JointDesired::torque(JointId(1), 2.0));

        assert_eq!(sink.submit(&cmd), Ok(()));
        assert_eq!(sink.stats().accepted, 1);
        assert_eq!(sink.writer().applied, vec![cmd]);
    }

    #[test]
    fn invalid_command_is_dropped_not_replayed() {
        let mut sink = sink();
        let mut good = ControllerCoreCommand::new();
        good.push(JointDesired::position(JointId(0), 0.1, 0.0));
        sink.submit(&good).unwrap();

        let mut bad = ControllerCoreCommand::new();
        bad.push(JointDesired {
            torque: None,
            ..JointDesired::torque(JointId(1), 0.0)
        });
        let err = sink.submit(&bad).unwrap_err();
        assert_eq!(
            err,
            CommandError::MissingValue {
                joint: JointId(1),
                mode: JointControlMode::Torque,
                field: "torque"
            }
        );
        assert_eq!(sink.writer().applied.len(), 1);
        assert_eq!(sink.writer().skipped, 1);
        assert_eq!(sink.stats().last_rejection, Some(err));

        // The next valid command goes through.
        sink.submit(&good).unwrap();
        assert_eq!(sink.stats().accepted, 2);
        assert_eq!(sink.stats().rejected, 1);
    }

    #[test]
    fn skip_reaches_writer_without_counting_a_rejection() {
        let mut sink = sink();
        sink.skip();
        assert_eq!(sink.writer().skipped, 1);
        assert!(sink.writer().applied.is_empty());
        assert_eq!(sink.stats().skipped, 1);
        assert_eq!(sink.stats().rejected, 0);
    }

    #[test]
    fn unknown_joint_rejected() {
        let mut sink = sink();
        let mut cmd = ControllerCoreCommand::new();
        cmd.push(JointDesired::off(JointId(7)));
        assert_eq!(sink.submit(&cmd), Err(CommandError::UnknownJoint(JointId(7))));
        assert!(sink.into_writer().applied.is_empty());
    }
}
