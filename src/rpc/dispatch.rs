//! Trusted-side answers to reverse calls.
use super::calls::{InputSetCall, PerceptionCall, ReverseCall, TaskCall};
use crate::channel::{Channel, ChannelError};
use crate::config::types::ErrorCode;
use crate::plugin::{
    ActionOutcome, Coordinates, Dimensions, Image, InputSet, LabeledObject, Perception,
    PluginError, PluginResult, Task,
};
use crate::protocol::{MessageKind, PacketWriter};

/// Payload of the `Response` sent back for a reverse call.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Empty,
    Count(u32),
    Flag(bool),
    Text(String),
    Size(Dimensions),
    Features(Vec<f32>),
    Objects(Vec<LabeledObject>),
    Negatives(Vec<Coordinates>),
    Pixels(Image),
    Action(ActionOutcome),
}

impl Reply {
    pub fn write(&self, writer: &mut PacketWriter) {
        match self {
            Self::Empty => {}
            Self::Count(value) => {
                writer.add(value);
            }
            Self::Flag(value) => {
                writer.add(value);
            }
            Self::Text(value) => {
                writer.add(value);
            }
            Self::Size(size) => {
                writer.add(&size.width).add(&size.height);
            }
            Self::Features(values) => {
                writer.add_f32_block(values);
            }
            Self::Objects(objects) => {
                writer.add(&(objects.len() as u32));
                for object in objects {
                    writer
                        .add(&object.label)
                        .add(&object.left)
                        .add(&object.top)
                        .add(&object.width)
                        .add(&object.height);
                }
            }
            Self::Negatives(positions) => {
                writer.add(&(positions.len() as u32));
                for position in positions {
                    writer.add(&position.x).add(&position.y);
                }
            }
            Self::Pixels(image) => {
                writer.add(&image.width).add(&image.height).add_raw(&image.pixels);
            }
            Self::Action(outcome) => {
                writer.add(&outcome.reward).add(&(outcome.result as u32));
                if let Some(suggested) = outcome.suggested_action {
                    writer.add(&suggested);
                }
            }
        }
    }
}

/// Result of routing one reverse call.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Answered with a `Response`
    Processed,
    /// Answered with an `Error` carrying the code; the session stays usable
    ApplicationFailure(PluginError),
    /// Nothing is bound for this kind during the current command
    NoTarget,
}

/// Objects reverse calls may reach during one forward command.
///
/// Bound by a role proxy for exactly the duration of the command it sends.
#[derive(Default)]
pub enum ReverseCallTable<'a> {
    #[default]
    None,
    InputSet(&'a mut dyn InputSet),
    /// Task calls, plus perception calls through the task's perception
    Task(&'a mut dyn Task),
    Perception(&'a mut dyn Perception),
}

impl ReverseCallTable<'_> {
    /// Compute the answer; `None` when no bound object serves `call`.
    pub fn answer(&mut self, call: &ReverseCall) -> Option<PluginResult<Reply>> {
        match (self, call) {
            (Self::InputSet(input_set), ReverseCall::InputSet(call)) => {
                Some(answer_input_set(&mut **input_set, call))
            }
            (Self::Task(task), ReverseCall::Task(call)) => Some(answer_task(&mut **task, call)),
            (Self::Task(task), ReverseCall::Perception(call)) => {
                Some(answer_perception(task.perception(), call))
            }
            (Self::Perception(perception), ReverseCall::Perception(call)) => {
                Some(answer_perception(&mut **perception, call))
            }
            _ => None,
        }
    }

    /// Answer `call` over `channel`.
    ///
    /// Transport failures while answering are returned as errors.
    pub fn dispatch(
        &mut self,
        call: &ReverseCall,
        channel: &mut Channel,
    ) -> Result<DispatchOutcome, ChannelError> {
        match self.answer(call) {
            None => Ok(DispatchOutcome::NoTarget),
            Some(Ok(reply)) => {
                reply.write(channel.start_packet(MessageKind::Response));
                channel.send_packet()?;
                Ok(DispatchOutcome::Processed)
            }
            Some(Err(err)) => {
                channel
                    .start_packet(MessageKind::Error)
                    .add(&err.code.as_u32());
                channel.send_packet()?;
                Ok(DispatchOutcome::ApplicationFailure(err))
            }
        }
    }
}

fn check_feature_request(features: &[u32]) -> PluginResult<()> {
    if features.is_empty() {
        return Err(PluginError::new(
            ErrorCode::InvalidArguments,
            "no feature index requested",
        ));
    }
    Ok(())
}

fn answer_input_set(input_set: &mut dyn InputSet, call: &InputSetCall) -> PluginResult<Reply> {
    let reply = match call {
        InputSetCall::NbHeuristics => Reply::Count(input_set.nb_heuristics()?),
        InputSetCall::NbFeatures { heuristic } => Reply::Count(input_set.nb_features(*heuristic)?),
        InputSetCall::HeuristicName { heuristic } => {
            Reply::Text(input_set.heuristic_name(*heuristic)?)
        }
        InputSetCall::HeuristicSeed { heuristic } => {
            Reply::Count(input_set.heuristic_seed(*heuristic)?)
        }
        InputSetCall::NbImages => Reply::Count(input_set.nb_images()?),
        InputSetCall::NbLabels => Reply::Count(input_set.nb_labels()?),
        InputSetCall::ComputeSomeFeatures {
            image,
            position,
            heuristic,
            features,
        } => {
            check_feature_request(features)?;
            let values = input_set.compute_some_features(*image, *position, *heuristic, features)?;
            Reply::Features(fit_values(values, features.len())?)
        }
        InputSetCall::ObjectsInImage { image } => {
            Reply::Objects(input_set.objects_in_image(*image)?)
        }
        InputSetCall::NegativesInImage { image } => {
            Reply::Negatives(input_set.negatives_in_image(*image)?)
        }
        InputSetCall::ImageSize { image } => Reply::Size(input_set.image_size(*image)?),
        InputSetCall::ImageInTestSet { image } => {
            Reply::Flag(input_set.is_image_in_test_set(*image)?)
        }
        InputSetCall::RoiExtent => Reply::Count(input_set.roi_extent()?),
    };
    Ok(reply)
}

fn answer_task(task: &mut dyn Task, call: &TaskCall) -> PluginResult<Reply> {
    let reply = match call {
        TaskCall::Mode => Reply::Count(task.mode()? as u32),
        TaskCall::NbActions => Reply::Count(task.nb_actions()?),
        TaskCall::NbTrajectories => Reply::Count(task.nb_trajectories()?),
        TaskCall::TrajectoryLength { trajectory } => {
            Reply::Count(task.trajectory_length(*trajectory)?)
        }
        TaskCall::Reset => {
            task.reset()?;
            Reply::Empty
        }
        TaskCall::PerformAction { action } => {
            let mode = task.mode()?;
            let mut outcome = task.perform_action(*action)?;
            if !mode.has_suggestions() {
                outcome.suggested_action = None;
            } else if outcome.suggested_action.is_none() {
                outcome.suggested_action = Some(task.suggested_action()?);
            }
            Reply::Action(outcome)
        }
        TaskCall::SuggestedAction => Reply::Count(task.suggested_action()?),
    };
    Ok(reply)
}

fn answer_perception(perception: &mut dyn Perception, call: &PerceptionCall) -> PluginResult<Reply> {
    let reply = match call {
        PerceptionCall::NbHeuristics => Reply::Count(perception.nb_heuristics()?),
        PerceptionCall::NbFeatures { heuristic } => {
            Reply::Count(perception.nb_features(*heuristic)?)
        }
        PerceptionCall::HeuristicName { heuristic } => {
            Reply::Text(perception.heuristic_name(*heuristic)?)
        }
        PerceptionCall::HeuristicSeed { heuristic } => {
            Reply::Count(perception.heuristic_seed(*heuristic)?)
        }
        PerceptionCall::NbViews => Reply::Count(perception.nb_views()?),
        PerceptionCall::ComputeSomeFeatures {
            view,
            position,
            heuristic,
            features,
        } => {
            check_feature_request(features)?;
            let values = perception.compute_some_features(*view, *position, *heuristic, features)?;
            Reply::Features(fit_values(values, features.len())?)
        }
        PerceptionCall::ViewSize { view } => Reply::Size(perception.view_size(*view)?),
        PerceptionCall::ViewPixels { view } => {
            let image = perception.view_pixels(*view)?;
            if image.pixels.len() != Image::expected_len(image.width, image.height) {
                return Err(PluginError::new(
                    ErrorCode::AppServerError,
                    format!("view {view} has an inconsistent pixel buffer"),
                ));
            }
            Reply::Pixels(image)
        }
        PerceptionCall::RoiExtent => Reply::Count(perception.roi_extent()?),
    };
    Ok(reply)
}

/// The wire answer has exactly one value per requested index.
fn fit_values(values: Vec<f32>, expected: usize) -> PluginResult<Vec<f32>> {
    if values.len() != expected {
        return Err(PluginError::new(
            ErrorCode::AppServerError,
            format!("{} feature values computed for {expected} indexes", values.len()),
        ));
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{TaskMode, TaskResult};
    use std::time::Duration;

    struct Grid {
        calls: u32,
    }

    impl Perception for Grid {
        fn nb_heuristics(&mut self) -> PluginResult<u32> {
            Ok(2)
        }
        fn nb_features(&mut self, heuristic: u32) -> PluginResult<u32> {
            Ok(10 * (heuristic + 1))
        }
        fn heuristic_name(&mut self, heuristic: u32) -> PluginResult<String> {
            Ok(format!("grid/h{heuristic}"))
        }
        fn heuristic_seed(&mut self, _heuristic: u32) -> PluginResult<u32> {
            Ok(7)
        }
        fn nb_views(&mut self) -> PluginResult<u32> {
            Ok(1)
        }
        fn compute_some_features(
            &mut self,
            _view: u32,
            position: Coordinates,
            heuristic: u32,
            features: &[u32],
        ) -> PluginResult<Vec<f32>> {
            self.calls += 1;
            if heuristic > 1 {
                return Err(PluginError::from_code(ErrorCode::InvalidArguments));
            }
            Ok(features.iter().map(|f| (position.x + *f) as f32).collect())
        }
        fn view_size(&mut self, _view: u32) -> PluginResult<Dimensions> {
            Ok(Dimensions {
                width: 2,
                height: 1,
            })
        }
        fn view_pixels(&mut self, _view: u32) -> PluginResult<Image> {
            Ok(Image::new(2, 1, vec![1, 2, 3, 4, 5, 6]))
        }
        fn roi_extent(&mut self) -> PluginResult<u32> {
            Ok(16)
        }
    }

    struct Walk {
        perception: Grid,
        mode: TaskMode,
    }

    impl Task for Walk {
        fn mode(&mut self) -> PluginResult<TaskMode> {
            Ok(self.mode)
        }
        fn nb_actions(&mut self) -> PluginResult<u32> {
            Ok(4)
        }
        fn nb_trajectories(&mut self) -> PluginResult<u32> {
            Ok(0)
        }
        fn trajectory_length(&mut self, _trajectory: u32) -> PluginResult<u32> {
            Ok(0)
        }
        fn reset(&mut self) -> PluginResult<()> {
            Ok(())
        }
        fn perform_action(&mut self, action: u32) -> PluginResult<ActionOutcome> {
            Ok(ActionOutcome {
                reward: action as f32 * 0.5,
                result: TaskResult::None,
                suggested_action: None,
            })
        }
        fn suggested_action(&mut self) -> PluginResult<u32> {
            Ok(2)
        }
        fn perception(&mut self) -> &mut dyn Perception {
            &mut self.perception
        }
    }

    #[test]
    fn task_table_serves_perception_calls() {
        let mut task = Walk {
            perception: Grid { calls: 0 },
            mode: TaskMode::Standard,
        };
        let mut table = ReverseCallTable::Task(&mut task);
        let reply = table
            .answer(&ReverseCall::Perception(PerceptionCall::NbHeuristics))
            .unwrap()
            .unwrap();
        assert_eq!(reply, Reply::Count(2));
        assert!(table
            .answer(&ReverseCall::InputSet(InputSetCall::NbImages))
            .is_none());
    }

    #[test]
    fn suggestion_follows_task_mode() {
        let mut task = Walk {
            perception: Grid { calls: 0 },
            mode: TaskMode::Suggestions,
        };
        let mut table = ReverseCallTable::Task(&mut task);
        let call = ReverseCall::Task(TaskCall::PerformAction { action: 3 });
        match table.answer(&call).unwrap().unwrap() {
            Reply::Action(outcome) => assert_eq!(outcome.suggested_action, Some(2)),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn empty_feature_request_is_invalid() {
        let mut grid = Grid { calls: 0 };
        let mut table = ReverseCallTable::Perception(&mut grid);
        let call = ReverseCall::Perception(PerceptionCall::ComputeSomeFeatures {
            view: 0,
            position: Coordinates::new(1, 1),
            heuristic: 0,
            features: Vec::new(),
        });
        let err = table.answer(&call).unwrap().unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidArguments);
        assert_eq!(grid.calls, 0);
    }

    #[test]
    fn failures_are_answered_with_error_packets() {
        let (mut master, mut slave) = Channel::pair().unwrap();
        let mut grid = Grid { calls: 0 };
        let mut table = ReverseCallTable::Perception(&mut grid);
        let call = ReverseCall::Perception(PerceptionCall::ComputeSomeFeatures {
            view: 0,
            position: Coordinates::new(1, 1),
            heuristic: 9,
            features: vec![1],
        });

        let outcome = table.dispatch(&call, &mut master).unwrap();
        assert!(matches!(outcome, DispatchOutcome::ApplicationFailure(_)));
        assert_eq!(
            slave.receive_packet(Some(Duration::from_secs(1))).unwrap(),
            MessageKind::Error
        );
        assert_eq!(slave.read::<u32>().unwrap(), ErrorCode::InvalidArguments.as_u32());
    }

    #[test]
    fn unbound_table_has_no_target() {
        let (mut master, _slave) = Channel::pair().unwrap();
        let mut table = ReverseCallTable::None;
        let outcome = table
            .dispatch(&ReverseCall::Task(TaskCall::Mode), &mut master)
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::NoTarget);
    }
}
