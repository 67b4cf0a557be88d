//! Reverse-call requests: one closed enum per data interface.
//!
//! The same definitions encode a request on the sandboxed side and decode
//! it on the trusted side, so the field order of each kind lives in one place.
use crate::channel::{Channel, ChannelError};
use crate::plugin::Coordinates;
use crate::protocol::{KindFamily, MessageKind, PacketWriter};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSetCall {
    NbHeuristics,
    NbFeatures { heuristic: u32 },
    HeuristicName { heuristic: u32 },
    HeuristicSeed { heuristic: u32 },
    NbImages,
    NbLabels,
    ComputeSomeFeatures {
        image: u32,
        position: Coordinates,
        heuristic: u32,
        features: Vec<u32>,
    },
    ObjectsInImage { image: u32 },
    NegativesInImage { image: u32 },
    ImageSize { image: u32 },
    ImageInTestSet { image: u32 },
    RoiExtent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskCall {
    Mode,
    NbActions,
    NbTrajectories,
    TrajectoryLength { trajectory: u32 },
    Reset,
    PerformAction { action: u32 },
    SuggestedAction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PerceptionCall {
    NbHeuristics,
    NbFeatures { heuristic: u32 },
    HeuristicName { heuristic: u32 },
    HeuristicSeed { heuristic: u32 },
    NbViews,
    ComputeSomeFeatures {
        view: u32,
        position: Coordinates,
        heuristic: u32,
        features: Vec<u32>,
    },
    ViewSize { view: u32 },
    ViewPixels { view: u32 },
    RoiExtent,
}

/// A request issued by plugin code in the middle of a forward command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReverseCall {
    InputSet(InputSetCall),
    Task(TaskCall),
    Perception(PerceptionCall),
}

impl ReverseCall {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::InputSet(call) => match call {
                InputSetCall::NbHeuristics => MessageKind::InputSetNbHeuristics,
                InputSetCall::NbFeatures { .. } => MessageKind::InputSetNbFeatures,
                InputSetCall::HeuristicName { .. } => MessageKind::InputSetHeuristicName,
                InputSetCall::HeuristicSeed { .. } => MessageKind::InputSetHeuristicSeed,
                InputSetCall::NbImages => MessageKind::InputSetNbImages,
                InputSetCall::NbLabels => MessageKind::InputSetNbLabels,
                InputSetCall::ComputeSomeFeatures { .. } => MessageKind::InputSetComputeSomeFeatures,
                InputSetCall::ObjectsInImage { .. } => MessageKind::InputSetObjectsInImage,
                InputSetCall::NegativesInImage { .. } => MessageKind::InputSetNegativesInImage,
                InputSetCall::ImageSize { .. } => MessageKind::InputSetImageSize,
                InputSetCall::ImageInTestSet { .. } => MessageKind::InputSetImageInTestSet,
                InputSetCall::RoiExtent => MessageKind::InputSetRoiExtent,
            },
            Self::Task(call) => match call {
                TaskCall::Mode => MessageKind::TaskMode,
                TaskCall::NbActions => MessageKind::TaskNbActions,
                TaskCall::NbTrajectories => MessageKind::TaskNbTrajectories,
                TaskCall::TrajectoryLength { .. } => MessageKind::TaskTrajectoryLength,
                TaskCall::Reset => MessageKind::TaskReset,
                TaskCall::PerformAction { .. } => MessageKind::TaskPerformAction,
                TaskCall::SuggestedAction => MessageKind::TaskSuggestedAction,
            },
            Self::Perception(call) => match call {
                PerceptionCall::NbHeuristics => MessageKind::PerceptionNbHeuristics,
                PerceptionCall::NbFeatures { .. } => MessageKind::PerceptionNbFeatures,
                PerceptionCall::HeuristicName { .. } => MessageKind::PerceptionHeuristicName,
                PerceptionCall::HeuristicSeed { .. } => MessageKind::PerceptionHeuristicSeed,
                PerceptionCall::NbViews => MessageKind::PerceptionNbViews,
                PerceptionCall::ComputeSomeFeatures { .. } => {
                    MessageKind::PerceptionComputeSomeFeatures
                }
                PerceptionCall::ViewSize { .. } => MessageKind::PerceptionViewSize,
                PerceptionCall::ViewPixels { .. } => MessageKind::PerceptionViewPixels,
                PerceptionCall::RoiExtent => MessageKind::PerceptionRoiExtent,
            },
        }
    }

    /// Start a packet carrying this request.
    pub fn write(&self, channel: &mut Channel) {
        let writer = channel.start_packet(self.kind());
        match self {
            Self::InputSet(call) => match call {
                InputSetCall::NbFeatures { heuristic }
                | InputSetCall::HeuristicName { heuristic }
                | InputSetCall::HeuristicSeed { heuristic } => {
                    writer.add(heuristic);
                }
                InputSetCall::ComputeSomeFeatures {
                    image,
                    position,
                    heuristic,
                    features,
                } => write_feature_request(writer, *image, *position, *heuristic, features),
                InputSetCall::ObjectsInImage { image }
                | InputSetCall::NegativesInImage { image }
                | InputSetCall::ImageSize { image }
                | InputSetCall::ImageInTestSet { image } => {
                    writer.add(image);
                }
                InputSetCall::NbHeuristics
                | InputSetCall::NbImages
                | InputSetCall::NbLabels
                | InputSetCall::RoiExtent => {}
            },
            Self::Task(call) => match call {
                TaskCall::TrajectoryLength { trajectory } => {
                    writer.add(trajectory);
                }
                TaskCall::PerformAction { action } => {
                    writer.add(action);
                }
                TaskCall::Mode
                | TaskCall::NbActions
                | TaskCall::NbTrajectories
                | TaskCall::Reset
                | TaskCall::SuggestedAction => {}
            },
            Self::Perception(call) => match call {
                PerceptionCall::NbFeatures { heuristic }
                | PerceptionCall::HeuristicName { heuristic }
                | PerceptionCall::HeuristicSeed { heuristic } => {
                    writer.add(heuristic);
                }
                PerceptionCall::ComputeSomeFeatures {
                    view,
                    position,
                    heuristic,
                    features,
                } => write_feature_request(writer, *view, *position, *heuristic, features),
                PerceptionCall::ViewSize { view } | PerceptionCall::ViewPixels { view } => {
                    writer.add(view);
                }
                PerceptionCall::NbHeuristics
                | PerceptionCall::NbViews
                | PerceptionCall::RoiExtent => {}
            },
        }
    }

    /// Decode the packet just received on `channel`.
    ///
    /// `Ok(None)` when `kind` is not a reverse call at all.
    pub fn read(kind: MessageKind, channel: &mut Channel) -> Result<Option<Self>, ChannelError> {
        let call = match kind.family() {
            KindFamily::InputSetCall => Self::InputSet(read_input_set_call(kind, channel)?),
            KindFamily::TaskCall => Self::Task(read_task_call(kind, channel)?),
            KindFamily::PerceptionCall => Self::Perception(read_perception_call(kind, channel)?),
            _ => return Ok(None),
        };
        Ok(Some(call))
    }
}

fn write_feature_request(
    writer: &mut PacketWriter,
    target: u32,
    position: Coordinates,
    heuristic: u32,
    features: &[u32],
) {
    writer
        .add(&target)
        .add(&position.x)
        .add(&position.y)
        .add(&heuristic)
        .add(&(features.len() as u32))
        .add_u32_block(features);
}

fn read_feature_request(channel: &mut Channel) -> Result<(u32, Coordinates, u32, Vec<u32>), ChannelError> {
    let target = channel.read::<u32>()?;
    let x = channel.read::<u32>()?;
    let y = channel.read::<u32>()?;
    let heuristic = channel.read::<u32>()?;
    let count = channel.read::<u32>()? as usize;
    let features = channel.read_u32_block(count)?;
    Ok((target, Coordinates::new(x, y), heuristic, features))
}

fn read_input_set_call(kind: MessageKind, channel: &mut Channel) -> Result<InputSetCall, ChannelError> {
    let call = match kind {
        MessageKind::InputSetNbHeuristics => InputSetCall::NbHeuristics,
        MessageKind::InputSetNbFeatures => InputSetCall::NbFeatures {
            heuristic: channel.read()?,
        },
        MessageKind::InputSetHeuristicName => InputSetCall::HeuristicName {
            heuristic: channel.read()?,
        },
        MessageKind::InputSetHeuristicSeed => InputSetCall::HeuristicSeed {
            heuristic: channel.read()?,
        },
        MessageKind::InputSetNbImages => InputSetCall::NbImages,
        MessageKind::InputSetNbLabels => InputSetCall::NbLabels,
        MessageKind::InputSetComputeSomeFeatures => {
            let (image, position, heuristic, features) = read_feature_request(channel)?;
            InputSetCall::ComputeSomeFeatures {
                image,
                position,
                heuristic,
                features,
            }
        }
        MessageKind::InputSetObjectsInImage => InputSetCall::ObjectsInImage {
            image: channel.read()?,
        },
        MessageKind::InputSetNegativesInImage => InputSetCall::NegativesInImage {
            image: channel.read()?,
        },
        MessageKind::InputSetImageSize => InputSetCall::ImageSize {
            image: channel.read()?,
        },
        MessageKind::InputSetImageInTestSet => InputSetCall::ImageInTestSet {
            image: channel.read()?,
        },
        _ => InputSetCall::RoiExtent,
    };
    Ok(call)
}

fn read_task_call(kind: MessageKind, channel: &mut Channel) -> Result<TaskCall, ChannelError> {
    let call = match kind {
        MessageKind::TaskMode => TaskCall::Mode,
        MessageKind::TaskNbActions => TaskCall::NbActions,
        MessageKind::TaskNbTrajectories => TaskCall::NbTrajectories,
        MessageKind::TaskTrajectoryLength => TaskCall::TrajectoryLength {
            trajectory: channel.read()?,
        },
        MessageKind::TaskReset => TaskCall::Reset,
        MessageKind::TaskPerformAction => TaskCall::PerformAction {
            action: channel.read()?,
        },
        _ => TaskCall::SuggestedAction,
    };
    Ok(call)
}

fn read_perception_call(kind: MessageKind, channel: &mut Channel) -> Result<PerceptionCall, ChannelError> {
    let call = match kind {
        MessageKind::PerceptionNbHeuristics => PerceptionCall::NbHeuristics,
        MessageKind::PerceptionNbFeatures => PerceptionCall::NbFeatures {
            heuristic: channel.read()?,
        },
        MessageKind::PerceptionHeuristicName => PerceptionCall::HeuristicName {
            heuristic: channel.read()?,
        },
        MessageKind::PerceptionHeuristicSeed => PerceptionCall::HeuristicSeed {
            heuristic: channel.read()?,
        },
        MessageKind::PerceptionNbViews => PerceptionCall::NbViews,
        MessageKind::PerceptionComputeSomeFeatures => {
            let (view, position, heuristic, features) = read_feature_request(channel)?;
            PerceptionCall::ComputeSomeFeatures {
                view,
                position,
                heuristic,
                features,
            }
        }
        MessageKind::PerceptionViewSize => PerceptionCall::ViewSize {
            view: channel.read()?,
        },
        MessageKind::PerceptionViewPixels => PerceptionCall::ViewPixels {
            view: channel.read()?,
        },
        _ => PerceptionCall::RoiExtent,
    };
    Ok(call)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn through_channel(call: &ReverseCall) -> ReverseCall {
        let (mut master, mut slave) = Channel::pair().unwrap();
        call.write(&mut slave);
        slave.send_packet().unwrap();
        let kind = master.receive_packet(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(kind, call.kind());
        let decoded = ReverseCall::read(kind, &mut master).unwrap().unwrap();
        assert!(master.is_at_end(), "{kind} left unread fields");
        decoded
    }

    #[test]
    fn every_reverse_kind_maps_to_a_call() {
        let calls = [
            ReverseCall::InputSet(InputSetCall::NbHeuristics),
            ReverseCall::InputSet(InputSetCall::NbFeatures { heuristic: 1 }),
            ReverseCall::InputSet(InputSetCall::HeuristicName { heuristic: 1 }),
            ReverseCall::InputSet(InputSetCall::HeuristicSeed { heuristic: 1 }),
            ReverseCall::InputSet(InputSetCall::NbImages),
            ReverseCall::InputSet(InputSetCall::NbLabels),
            ReverseCall::InputSet(InputSetCall::ComputeSomeFeatures {
                image: 0,
                position: Coordinates::new(0, 0),
                heuristic: 0,
                features: vec![0],
            }),
            ReverseCall::InputSet(InputSetCall::ObjectsInImage { image: 0 }),
            ReverseCall::InputSet(InputSetCall::NegativesInImage { image: 0 }),
            ReverseCall::InputSet(InputSetCall::ImageSize { image: 0 }),
            ReverseCall::InputSet(InputSetCall::ImageInTestSet { image: 0 }),
            ReverseCall::InputSet(InputSetCall::RoiExtent),
            ReverseCall::Task(TaskCall::Mode),
            ReverseCall::Task(TaskCall::NbActions),
            ReverseCall::Task(TaskCall::NbTrajectories),
            ReverseCall::Task(TaskCall::TrajectoryLength { trajectory: 0 }),
            ReverseCall::Task(TaskCall::Reset),
            ReverseCall::Task(TaskCall::PerformAction { action: 0 }),
            ReverseCall::Task(TaskCall::SuggestedAction),
            ReverseCall::Perception(PerceptionCall::NbHeuristics),
            ReverseCall::Perception(PerceptionCall::NbFeatures { heuristic: 0 }),
            ReverseCall::Perception(PerceptionCall::HeuristicName { heuristic: 0 }),
            ReverseCall::Perception(PerceptionCall::HeuristicSeed { heuristic: 0 }),
            ReverseCall::Perception(PerceptionCall::NbViews),
            ReverseCall::Perception(PerceptionCall::ComputeSomeFeatures {
                view: 0,
                position: Coordinates::new(0, 0),
                heuristic: 0,
                features: vec![0],
            }),
            ReverseCall::Perception(PerceptionCall::ViewSize { view: 0 }),
            ReverseCall::Perception(PerceptionCall::ViewPixels { view: 0 }),
            ReverseCall::Perception(PerceptionCall::RoiExtent),
        ];
        let reverse_kinds: Vec<MessageKind> = MessageKind::ALL
            .iter()
            .copied()
            .filter(|kind| kind.is_reverse_call())
            .collect();
        let mapped: Vec<MessageKind> = calls.iter().map(ReverseCall::kind).collect();
        assert_eq!(mapped, reverse_kinds);
    }

    #[test]
    fn feature_request_keeps_indexes() {
        let call = ReverseCall::Perception(PerceptionCall::ComputeSomeFeatures {
            view: 2,
            position: Coordinates::new(31, 47),
            heuristic: 5,
            features: (0..3000).collect(),
        });
        assert_eq!(through_channel(&call), call);
    }

    #[test]
    fn perform_action_carries_action() {
        let call = ReverseCall::Task(TaskCall::PerformAction { action: 3 });
        assert_eq!(through_channel(&call), call);
    }

    #[test]
    fn forward_commands_are_not_reverse_calls() {
        let (mut master, _slave) = Channel::pair().unwrap();
        assert_eq!(ReverseCall::read(MessageKind::Response, &mut master).unwrap(), None);
        assert_eq!(ReverseCall::read(MessageKind::PlannerLearn, &mut master).unwrap(), None);
    }
}
