use super::{begin, CommandContext};
use crate::config::types::{PluginKind, Result, SandboxConfiguration};
use crate::core::{SandboxController, SpawnMode};
use crate::plugin::{
    ClassificationDone, ClassifierFeatures, FeatureRef, InputSet, Parameter, PlannerFeatures, Task,
    TaskResult,
};
use crate::protocol::{MessageKind, PacketWriter};
use crate::rpc::wire::{
    write_classification_done, write_classifier_features, write_features, write_parameters,
    write_planner_features,
};
use crate::rpc::ReverseCallTable;
use std::path::PathBuf;

/// Instrument plugins observing an experiment from one sandboxed process.
///
/// Each event goes to every instrument. When one of them crashes, the
/// controller's culprit tells which.
pub struct SandboxedInstruments {
    controller: SandboxController,
}

impl SandboxedInstruments {
    pub fn new(config: SandboxConfiguration) -> Self {
        Self {
            controller: SandboxController::new(PluginKind::Instruments, config),
        }
    }

    pub fn create_sandbox(&mut self, mode: SpawnMode) -> Result<()> {
        self.controller.create_sandbox(mode)
    }

    pub fn set_instruments_folder(&mut self, path: impl Into<PathBuf>) -> Result<()> {
        self.controller.set_plugins_folder(path)
    }

    pub fn load_instrument(&mut self, name: &str) -> Result<u32> {
        begin(&mut self.controller, CommandContext::method("loading").parameter("Instrument", name))?;
        self.controller.load_plugin(name)
    }

    /// Construct every loaded instrument.
    pub fn create_instruments(&mut self) -> Result<()> {
        let mut context = CommandContext::method("constructor");
        for name in self.controller.plugins() {
            context = context.parameter("Instrument", name);
        }
        begin(&mut self.controller, context)?;
        self.controller.create_plugins()
    }

    pub fn setup(&mut self, index: u32, parameters: &[Parameter]) -> Result<()> {
        let instrument = self.name(index);
        let context = CommandContext::method("setup")
            .parameter("Instrument", format_args!("#{index} {instrument}"))
            .parameters(parameters);
        begin(&mut self.controller, context)?;
        self.controller.request(
            MessageKind::InstrumentSetup,
            |writer| {
                writer.add(&index);
                write_parameters(writer, parameters);
            },
            &mut ReverseCallTable::None,
        )
    }

    pub fn on_experiment_done(&mut self) -> Result<()> {
        self.event("onExperimentDone", MessageKind::EventExperimentDone, |_| {})
    }

    pub fn on_classification_experiment_started(&mut self, input_set: &mut dyn InputSet) -> Result<()> {
        self.input_set_event(
            "onClassificationExperimentStarted",
            MessageKind::EventClassificationExperimentStarted,
            input_set,
            |_| {},
        )
    }

    pub fn on_classifier_training_started(&mut self, input_set: &mut dyn InputSet) -> Result<()> {
        self.input_set_event(
            "onClassifierTrainingStarted",
            MessageKind::EventClassifierTrainingStarted,
            input_set,
            |_| {},
        )
    }

    pub fn on_classifier_training_done(&mut self, input_set: &mut dyn InputSet, train_error: f32) -> Result<()> {
        self.input_set_event(
            "onClassifierTrainingDone",
            MessageKind::EventClassifierTrainingDone,
            input_set,
            |writer| {
                writer.add(&train_error);
            },
        )
    }

    pub fn on_classifier_test_started(&mut self, input_set: &mut dyn InputSet) -> Result<()> {
        self.input_set_event(
            "onClassifierTestStarted",
            MessageKind::EventClassifierTestStarted,
            input_set,
            |_| {},
        )
    }

    pub fn on_classifier_test_done(&mut self, input_set: &mut dyn InputSet, test_error: f32) -> Result<()> {
        self.input_set_event(
            "onClassifierTestDone",
            MessageKind::EventClassifierTestDone,
            input_set,
            |writer| {
                writer.add(&test_error);
            },
        )
    }

    pub fn on_classification_done(
        &mut self,
        input_set: &mut dyn InputSet,
        event: &ClassificationDone,
    ) -> Result<()> {
        self.input_set_event(
            "onClassificationDone",
            MessageKind::EventClassificationDone,
            input_set,
            |writer| write_classification_done(writer, event),
        )
    }

    pub fn on_features_computed_by_classifier(&mut self, event: &ClassifierFeatures) -> Result<()> {
        self.event(
            "onFeaturesComputedByClassifier",
            MessageKind::EventFeaturesComputedByClassifier,
            |writer| write_classifier_features(writer, event),
        )
    }

    pub fn on_goalplanning_experiment_started(&mut self, task: &mut dyn Task) -> Result<()> {
        self.task_event(
            "onGoalplanningExperimentStarted",
            MessageKind::EventGoalPlanningExperimentStarted,
            task,
            |_| {},
        )
    }

    pub fn on_planner_learning_started(&mut self, task: &mut dyn Task) -> Result<()> {
        self.task_event(
            "onPlannerLearningStarted",
            MessageKind::EventPlannerLearningStarted,
            task,
            |_| {},
        )
    }

    pub fn on_planner_learning_done(&mut self, task: &mut dyn Task, result: TaskResult) -> Result<()> {
        self.task_event(
            "onPlannerLearningDone",
            MessageKind::EventPlannerLearningDone,
            task,
            |writer| {
                writer.add(&(result as u32));
            },
        )
    }

    pub fn on_planner_test_started(&mut self, task: &mut dyn Task) -> Result<()> {
        self.task_event(
            "onPlannerTestStarted",
            MessageKind::EventPlannerTestStarted,
            task,
            |_| {},
        )
    }

    pub fn on_planner_test_done(&mut self, task: &mut dyn Task, score: f32, result: TaskResult) -> Result<()> {
        self.task_event(
            "onPlannerTestDone",
            MessageKind::EventPlannerTestDone,
            task,
            |writer| {
                writer.add(&score).add(&(result as u32));
            },
        )
    }

    pub fn on_planner_action_chosen(
        &mut self,
        task: &mut dyn Task,
        action: u32,
        reward: f32,
        result: TaskResult,
    ) -> Result<()> {
        self.task_event(
            "onPlannerActionChosen",
            MessageKind::EventPlannerActionChosen,
            task,
            |writer| {
                writer.add(&action).add(&reward).add(&(result as u32));
            },
        )
    }

    pub fn on_features_computed_by_planner(&mut self, event: &PlannerFeatures) -> Result<()> {
        self.event(
            "onFeaturesComputedByPlanner",
            MessageKind::EventFeaturesComputedByPlanner,
            |writer| write_planner_features(writer, event),
        )
    }

    pub fn on_feature_list_reported(&mut self, features: &[FeatureRef]) -> Result<()> {
        self.event(
            "onFeatureListReported",
            MessageKind::EventFeatureListReported,
            |writer| write_features(writer, features),
        )
    }

    pub fn controller(&self) -> &SandboxController {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut SandboxController {
        &mut self.controller
    }

    pub fn close(&mut self) -> Result<()> {
        self.controller.close_sandbox()
    }

    fn name(&self, index: u32) -> &str {
        self.controller
            .plugins()
            .get(index as usize)
            .map_or("?", String::as_str)
    }

    fn event(&mut self, method: &str, kind: MessageKind, build: impl FnOnce(&mut PacketWriter)) -> Result<()> {
        begin(&mut self.controller, CommandContext::method(method))?;
        self.controller.request(kind, build, &mut ReverseCallTable::None)
    }

    /// The input set answers the instruments' reverse calls during the event.
    fn input_set_event(
        &mut self,
        method: &str,
        kind: MessageKind,
        input_set: &mut dyn InputSet,
        build: impl FnOnce(&mut PacketWriter),
    ) -> Result<()> {
        let context = CommandContext::method(method)
            .parameter("Input set", input_set.id())
            .parameter("Detection", input_set.is_doing_detection());
        begin(&mut self.controller, context)?;
        let (id, detection) = (input_set.id(), input_set.is_doing_detection());
        self.controller.request(
            kind,
            |writer| {
                writer.add(&id).add(&detection);
                build(writer);
            },
            &mut ReverseCallTable::InputSet(input_set),
        )
    }

    fn task_event(
        &mut self,
        method: &str,
        kind: MessageKind,
        task: &mut dyn Task,
        build: impl FnOnce(&mut PacketWriter),
    ) -> Result<()> {
        begin(&mut self.controller, CommandContext::method(method))?;
        self.controller.request(kind, build, &mut ReverseCallTable::Task(task))
    }
}
