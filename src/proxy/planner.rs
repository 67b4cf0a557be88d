use super::{begin, load_predictor, CommandContext};
use crate::config::types::{PluginKind, Result, SandboxConfiguration};
use crate::core::{SandboxController, SpawnMode, TrainingListener};
use crate::plugin::{FeatureRef, Parameter, Perception, Task};
use crate::protocol::MessageKind;
use crate::rpc::wire::{read_features, write_parameters};
use crate::rpc::ReverseCallTable;
use std::path::PathBuf;

/// A goal-planner plugin running in its own sandboxed process.
pub struct SandboxedPlanner {
    controller: SandboxController,
}

impl SandboxedPlanner {
    pub fn new(config: SandboxConfiguration) -> Self {
        Self {
            controller: SandboxController::new(PluginKind::GoalPlanner, config),
        }
    }

    pub fn create_sandbox(&mut self, mode: SpawnMode) -> Result<()> {
        self.controller.create_sandbox(mode)
    }

    pub fn set_planners_folder(&mut self, path: impl Into<PathBuf>) -> Result<()> {
        self.controller.set_plugins_folder(path)
    }

    /// Load the planner, give it its model file and construct it.
    pub fn load_planner(&mut self, name: &str, model: Option<PathBuf>) -> Result<()> {
        load_predictor(&mut self.controller, name, model, None)
    }

    /// `listener` hears of every learning step the planner reports.
    pub fn set_training_listener(&mut self, listener: impl TrainingListener + 'static) {
        self.controller.set_training_listener(listener);
    }

    pub fn set_seed(&mut self, seed: u32) -> Result<()> {
        begin(&mut self.controller, CommandContext::method("setSeed").parameter("Seed", seed))?;
        self.controller.request(
            MessageKind::PlannerSetSeed,
            |writer| {
                writer.add(&seed);
            },
            &mut ReverseCallTable::None,
        )
    }

    pub fn setup(&mut self, parameters: &[Parameter]) -> Result<()> {
        begin(&mut self.controller, CommandContext::method("setup").parameters(parameters))?;
        self.controller.request(
            MessageKind::PlannerSetup,
            |writer| write_parameters(writer, parameters),
            &mut ReverseCallTable::None,
        )
    }

    pub fn load_model(&mut self, perception: &mut dyn Perception) -> Result<()> {
        begin(&mut self.controller, CommandContext::method("loadModel"))?;
        self.controller.request(
            MessageKind::LoadModel,
            |_| {},
            &mut ReverseCallTable::Perception(perception),
        )
    }

    /// Let the planner learn on `task`, answering its task and perception
    /// reverse calls until it is done.
    pub fn learn(&mut self, task: &mut dyn Task) -> Result<()> {
        let nb_actions = task.nb_actions().map_or_else(|_| "?".to_string(), |n| n.to_string());
        let context = CommandContext::method("learn")
            .parameter("Number of actions", nb_actions)
            .perception(task.perception());
        begin(&mut self.controller, context)?;
        self.controller.request(
            MessageKind::PlannerLearn,
            |_| {},
            &mut ReverseCallTable::Task(task),
        )
    }

    pub fn choose_action(&mut self, perception: &mut dyn Perception, new_sequence: bool) -> Result<u32> {
        let context = CommandContext::method("chooseAction")
            .parameter("New sequence", new_sequence)
            .perception(perception);
        begin(&mut self.controller, context)?;
        self.controller.request(
            MessageKind::PlannerChooseAction,
            |writer| {
                writer.add(&u32::from(new_sequence));
            },
            &mut ReverseCallTable::Perception(perception),
        )?;
        self.controller.read::<u32>()
    }

    pub fn report_features_used(&mut self, perception: &mut dyn Perception) -> Result<Vec<FeatureRef>> {
        begin(&mut self.controller, CommandContext::method("reportFeaturesUsed"))?;
        self.controller.request(
            MessageKind::PlannerReportFeaturesUsed,
            |_| {},
            &mut ReverseCallTable::Perception(perception),
        )?;
        self.controller.read_with(read_features)
    }

    pub fn save_model(&mut self) -> Result<()> {
        begin(&mut self.controller, CommandContext::method("saveModel"))?;
        self.controller
            .request(MessageKind::SaveModel, |_| {}, &mut ReverseCallTable::None)
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
}
