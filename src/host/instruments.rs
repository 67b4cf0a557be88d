//! Instruments role of the sandboxed process.
//!
//! An event is delivered to every instrument in load order. Before each one
//! the trusted side hears `CurrentInstrument` with its index, so a crash is
//! blamed on the right plugin; a single `Response` closes the event.
use super::CommandResult;
use crate::channel::{Channel, ChannelError};
use crate::config::types::ErrorCode;
use crate::plugin::{FeatureRef, Instrument, PluginError, PluginResult, TaskResult};
use crate::protocol::MessageKind;
use crate::rpc::wire::{
    read_classification_done, read_classifier_features, read_features, read_parameters,
    read_planner_features,
};
use crate::rpc::{RemoteInputSet, RemoteTask};
use crate::warden::Warden;

fn read_result(channel: &mut Channel) -> Result<TaskResult, ChannelError> {
    let value = channel.read::<u32>()?;
    Ok(TaskResult::from_u32(value).unwrap_or(TaskResult::None))
}

pub struct InstrumentsHost {
    instruments: Vec<Box<dyn Instrument>>,
    channel: Channel,
}

impl InstrumentsHost {
    pub fn new(instruments: Vec<Box<dyn Instrument>>, channel: Channel) -> Self {
        Self {
            instruments,
            channel,
        }
    }

    pub fn len(&self) -> usize {
        self.instruments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty()
    }

    fn read_input_set(&self, channel: &mut Channel) -> Result<RemoteInputSet, ChannelError> {
        let id = channel.read::<u32>()?;
        let detection = channel.read::<bool>()?;
        Ok(RemoteInputSet::new(self.channel.clone(), id, detection))
    }

    /// Call `hook` on every instrument, announcing each one first.
    fn broadcast(
        &mut self,
        channel: &mut Channel,
        mut hook: impl FnMut(&mut dyn Instrument),
    ) -> CommandResult {
        let warden = Warden::get();
        for (index, instrument) in self.instruments.iter_mut().enumerate() {
            let index = index as u32;
            channel.start_packet(MessageKind::CurrentInstrument).add(&index);
            channel.send_packet()?;
            if let Some(warden) = warden {
                warden.set_subject(Some(index));
            }
            hook(instrument.as_mut());
        }
        if let Some(warden) = warden {
            warden.set_subject(None);
        }
        channel.send_empty(MessageKind::Response)?;
        Ok(())
    }

    pub(super) fn handle(&mut self, kind: MessageKind, channel: &mut Channel) -> Option<CommandResult> {
        let result = match kind {
            MessageKind::InstrumentSetup => self.setup(channel),
            MessageKind::EventExperimentDone => {
                self.broadcast(channel, |instrument| instrument.on_experiment_done())
            }
            MessageKind::EventClassificationExperimentStarted
            | MessageKind::EventClassifierTrainingStarted
            | MessageKind::EventClassifierTestStarted
            | MessageKind::EventClassifierTrainingDone
            | MessageKind::EventClassifierTestDone
            | MessageKind::EventClassificationDone => self.input_set_event(kind, channel),
            MessageKind::EventFeaturesComputedByClassifier => self.classifier_features(channel),
            MessageKind::EventGoalPlanningExperimentStarted
            | MessageKind::EventPlannerLearningStarted
            | MessageKind::EventPlannerTestStarted
            | MessageKind::EventPlannerLearningDone
            | MessageKind::EventPlannerTestDone
            | MessageKind::EventPlannerActionChosen => self.task_event(kind, channel),
            MessageKind::EventFeaturesComputedByPlanner => self.planner_features(channel),
            MessageKind::EventFeatureListReported => self.feature_list(channel),
            _ => return None,
        };
        Some(result)
    }

    fn setup(&mut self, channel: &mut Channel) -> CommandResult {
        let index = channel.read::<u32>()?;
        let parameters = read_parameters(channel)?;
        let count = self.instruments.len();
        let instrument = self.instruments.get_mut(index as usize).ok_or_else(|| {
            PluginError::new(
                ErrorCode::InvalidArguments,
                format!("instrument index {index} out of range ({count} loaded)"),
            )
        })?;
        setup_one(instrument.as_mut(), index, &parameters)?;
        channel.send_empty(MessageKind::Response)?;
        Ok(())
    }

    fn input_set_event(&mut self, kind: MessageKind, channel: &mut Channel) -> CommandResult {
        let mut input_set = self.read_input_set(channel)?;
        match kind {
            MessageKind::EventClassificationExperimentStarted => self.broadcast(channel, |instrument| {
                instrument.on_classification_experiment_started(&mut input_set)
            }),
            MessageKind::EventClassifierTrainingStarted => self.broadcast(channel, |instrument| {
                instrument.on_classifier_training_started(&mut input_set)
            }),
            MessageKind::EventClassifierTestStarted => self.broadcast(channel, |instrument| {
                instrument.on_classifier_test_started(&mut input_set)
            }),
            MessageKind::EventClassifierTrainingDone => {
                let train_error = channel.read::<f32>()?;
                self.broadcast(channel, |instrument| {
                    instrument.on_classifier_training_done(&mut input_set, train_error)
                })
            }
            MessageKind::EventClassifierTestDone => {
                let test_error = channel.read::<f32>()?;
                self.broadcast(channel, |instrument| {
                    instrument.on_classifier_test_done(&mut input_set, test_error)
                })
            }
            _ => {
                let event = read_classification_done(channel)?;
                self.broadcast(channel, |instrument| {
                    instrument.on_classification_done(&mut input_set, &event)
                })
            }
        }
    }

    fn task_event(&mut self, kind: MessageKind, channel: &mut Channel) -> CommandResult {
        let mut task = RemoteTask::new(self.channel.clone());
        match kind {
            MessageKind::EventGoalPlanningExperimentStarted => self.broadcast(channel, |instrument| {
                instrument.on_goalplanning_experiment_started(&mut task)
            }),
            MessageKind::EventPlannerLearningStarted => self.broadcast(channel, |instrument| {
                instrument.on_planner_learning_started(&mut task)
            }),
            MessageKind::EventPlannerTestStarted => self.broadcast(channel, |instrument| {
                instrument.on_planner_test_started(&mut task)
            }),
            MessageKind::EventPlannerLearningDone => {
                let result = read_result(channel)?;
                self.broadcast(channel, |instrument| {
                    instrument.on_planner_learning_done(&mut task, result)
                })
            }
            MessageKind::EventPlannerTestDone => {
                let score = channel.read::<f32>()?;
                let result = read_result(channel)?;
                self.broadcast(channel, |instrument| {
                    instrument.on_planner_test_done(&mut task, score, result)
                })
            }
            _ => {
                let action = channel.read::<u32>()?;
                let reward = channel.read::<f32>()?;
                let result = read_result(channel)?;
                self.broadcast(channel, |instrument| {
                    instrument.on_planner_action_chosen(&mut task, action, reward, result)
                })
            }
        }
    }

    fn classifier_features(&mut self, channel: &mut Channel) -> CommandResult {
        let event = read_classifier_features(channel)?;
        self.broadcast(channel, |instrument| {
            instrument.on_features_computed_by_classifier(&event)
        })
    }

    fn planner_features(&mut self, channel: &mut Channel) -> CommandResult {
        let event = read_planner_features(channel)?;
        self.broadcast(channel, |instrument| {
            instrument.on_features_computed_by_planner(&event)
        })
    }

    fn feature_list(&mut self, channel: &mut Channel) -> CommandResult {
        let features: Vec<FeatureRef> = read_features(channel)?;
        self.broadcast(channel, |instrument| instrument.on_feature_list_reported(&features))
    }
}

fn setup_one(
    instrument: &mut dyn Instrument,
    index: u32,
    parameters: &[crate::plugin::Parameter],
) -> PluginResult<()> {
    let warden = Warden::get();
    if let Some(warden) = warden {
        warden.set_subject(Some(index));
    }
    let result = instrument.setup(parameters);
    if let Some(warden) = warden {
        warden.set_subject(None);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{ClassificationDone, ClassificationError, Coordinates, LabelScore, Parameter};
    use crate::rpc::wire::write_classification_done;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    #[derive(Default)]
    struct Journal {
        lines: Vec<String>,
    }

    struct Recorder {
        name: &'static str,
        journal: Rc<RefCell<Journal>>,
    }

    impl Recorder {
        fn note(&self, line: String) {
            self.journal.borrow_mut().lines.push(format!("{}: {line}", self.name));
        }
    }

    impl Instrument for Recorder {
        fn setup(&mut self, parameters: &[Parameter]) -> PluginResult<()> {
            if parameters.iter().any(|parameter| parameter.name == "REFUSE") {
                return Err(PluginError::new(ErrorCode::SetupFailed, "refused"));
            }
            self.note(format!("setup {}", parameters.len()));
            Ok(())
        }

        fn on_experiment_done(&mut self) {
            self.note("done".to_string());
        }

        fn on_classification_done(
            &mut self,
            input_set: &mut dyn crate::plugin::InputSet,
            event: &ClassificationDone,
        ) {
            self.note(format!(
                "set {} image {} error {:?}",
                input_set.id(),
                event.image,
                event.error
            ));
        }
    }

    fn host(channel: &Channel) -> (InstrumentsHost, Rc<RefCell<Journal>>) {
        let journal = Rc::new(RefCell::new(Journal::default()));
        let instruments: Vec<Box<dyn Instrument>> = ["first", "second"]
            .into_iter()
            .map(|name| {
                Box::new(Recorder {
                    name,
                    journal: journal.clone(),
                }) as Box<dyn Instrument>
            })
            .collect();
        (InstrumentsHost::new(instruments, channel.clone()), journal)
    }

    fn run(host: &mut InstrumentsHost, master: &mut Channel, slave: &mut Channel) -> CommandResult {
        master.send_packet().unwrap();
        let kind = slave.receive_packet(Some(Duration::from_secs(1))).unwrap();
        host.handle(kind, slave).expect("instrument command")
    }

    #[test]
    fn events_reach_every_instrument_in_order() {
        let (mut master, mut slave) = Channel::pair().unwrap();
        let (mut host, journal) = host(&slave);

        let writer = master.start_packet(MessageKind::EventClassificationDone);
        writer.add(&4u32).add(&false);
        write_classification_done(
            writer,
            &ClassificationDone {
                image: 9,
                original_image: 9,
                position: Coordinates::new(1, 2),
                results: vec![LabelScore { label: 0, score: 0.5 }],
                error: ClassificationError::FalseAlarm,
            },
        );
        run(&mut host, &mut master, &mut slave).unwrap();

        for expected in [0u32, 1] {
            assert_eq!(
                master.receive_packet(Some(Duration::from_secs(1))).unwrap(),
                MessageKind::CurrentInstrument
            );
            assert_eq!(master.read::<u32>().unwrap(), expected);
        }
        assert_eq!(
            master.receive_packet(Some(Duration::from_secs(1))).unwrap(),
            MessageKind::Response
        );
        assert_eq!(
            journal.borrow().lines,
            vec![
                "first: set 4 image 9 error FalseAlarm".to_string(),
                "second: set 4 image 9 error FalseAlarm".to_string(),
            ]
        );
    }

    #[test]
    fn setup_targets_one_instrument() {
        let (mut master, mut slave) = Channel::pair().unwrap();
        let (mut host, journal) = host(&slave);

        let writer = master.start_packet(MessageKind::InstrumentSetup);
        writer.add(&1u32);
        crate::rpc::wire::write_parameters(writer, &[Parameter::new("BINS", ["10"])]);
        run(&mut host, &mut master, &mut slave).unwrap();

        assert_eq!(journal.borrow().lines, vec!["second: setup 1".to_string()]);
    }

    #[test]
    fn refused_setup_is_reported() {
        let (mut master, mut slave) = Channel::pair().unwrap();
        let (mut host, _journal) = host(&slave);

        let writer = master.start_packet(MessageKind::InstrumentSetup);
        writer.add(&0u32);
        crate::rpc::wire::write_parameters(writer, &[Parameter::new("REFUSE", Vec::<String>::new())]);
        match run(&mut host, &mut master, &mut slave) {
            Err(crate::host::CommandFailure::Plugin(err)) => {
                assert_eq!(err.code, ErrorCode::SetupFailed)
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn instruments_ignore_heuristic_commands() {
        let (_master, mut slave) = Channel::pair().unwrap();
        let (mut host, _journal) = host(&slave);
        assert!(host.handle(MessageKind::HeuristicDim, &mut slave).is_none());
    }
}
