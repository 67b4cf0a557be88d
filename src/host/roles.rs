//! Role objects of the sandboxed process: they decode the role commands,
//! call the constructed plugins and encode the answers.
use super::heuristics::HeuristicsHost;
use super::instruments::InstrumentsHost;
use super::{CommandFailure, CommandResult};
use crate::channel::Channel;
use crate::config::types::{ErrorCode, PluginKind};
use crate::plugin::{
    Classifier, Coordinates, GoalPlanner, ModelData, Notifier, PluginError, PluginResult,
    RolePlugin, SavedModel,
};
use crate::protocol::MessageKind;
use crate::rpc::wire::{read_parameters, write_features, write_scores};
use crate::rpc::{RemoteInputSet, RemotePerception, RemoteTask};
use log::warn;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

pub const MODEL_FILE: &str = "predictor.model";
pub const DATA_FILE: &str = "predictor.data";

/// Output files of a predictor, opened before the process loses the right
/// to open files.
#[derive(Debug)]
pub struct ModelOutputs {
    model: File,
    data: File,
}

impl ModelOutputs {
    pub fn create(dir: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let open = |name: &str| {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(dir.join(name))
        };
        Ok(Self {
            model: open(MODEL_FILE)?,
            data: open(DATA_FILE)?,
        })
    }

    /// Replace the content of both files.
    pub fn write(&mut self, saved: &SavedModel) -> std::io::Result<()> {
        rewrite(&mut self.model, &saved.model)?;
        rewrite(&mut self.data, saved.internal_data.as_deref().unwrap_or_default())
    }
}

fn rewrite(file: &mut File, bytes: &[u8]) -> std::io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(bytes)?;
    file.flush()
}

fn respond(channel: &mut Channel) -> CommandResult {
    channel.send_empty(MessageKind::Response)?;
    Ok(())
}

fn save_into(outputs: Option<&mut ModelOutputs>, saved: PluginResult<SavedModel>) -> CommandResult {
    let outputs = outputs.ok_or_else(|| {
        PluginError::new(ErrorCode::ModelSavingFailed, "no output folder for the model")
    })?;
    let saved = saved?;
    outputs
        .write(&saved)
        .map_err(|e| PluginError::new(ErrorCode::ModelSavingFailed, e.to_string()))?;
    Ok(())
}

fn require_model(model: &ModelData) -> PluginResult<()> {
    if model.is_empty() {
        return Err(PluginError::new(
            ErrorCode::ModelLoadingFailed,
            "no model was given to this sandbox",
        ));
    }
    Ok(())
}

/// Sends the training progress of a predictor to the trusted side.
///
/// The packet goes out between the predictor's own reverse calls, while the
/// trusted side is waiting for the answer to a command.
pub struct ChannelNotifier {
    channel: Channel,
}

impl ChannelNotifier {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }
}

impl Notifier for ChannelNotifier {
    fn training_step_done(&mut self, step: u32, nb_steps: u32) {
        self.channel
            .start_packet(MessageKind::TrainingStepDone)
            .add(&step)
            .add(&nb_steps);
        if let Err(e) = self.channel.send_packet() {
            warn!("Training step {step}/{nb_steps} not reported: {e}");
        }
    }
}

/// The constructed plugins of a session, by role.
pub enum RoleHost {
    Heuristics(HeuristicsHost),
    Classifier(ClassifierHost),
    GoalPlanner(PlannerHost),
    Instruments(InstrumentsHost),
}

impl RoleHost {
    /// Group freshly constructed plugins into the role object of `kind`.
    pub fn assemble(
        kind: PluginKind,
        plugins: Vec<RolePlugin>,
        model: ModelData,
        outputs: Option<ModelOutputs>,
        channel: &Channel,
    ) -> PluginResult<Self> {
        if let Some(stray) = plugins.iter().find(|plugin| plugin.kind() != kind) {
            return Err(PluginError::new(
                ErrorCode::PluginKindMismatch,
                format!("constructed a {} in a {kind} sandbox", stray.kind()),
            ));
        }

        match kind {
            PluginKind::Heuristics => {
                let heuristics = plugins
                    .into_iter()
                    .filter_map(|plugin| match plugin {
                        RolePlugin::Heuristic(heuristic) => Some(heuristic),
                        _ => None,
                    })
                    .collect();
                Ok(Self::Heuristics(HeuristicsHost::new(heuristics)))
            }
            PluginKind::Instruments => {
                let instruments = plugins
                    .into_iter()
                    .filter_map(|plugin| match plugin {
                        RolePlugin::Instrument(instrument) => Some(instrument),
                        _ => None,
                    })
                    .collect();
                Ok(Self::Instruments(InstrumentsHost::new(instruments, channel.clone())))
            }
            PluginKind::Classifier | PluginKind::GoalPlanner => {
                let mut plugins = plugins.into_iter();
                let (Some(plugin), None) = (plugins.next(), plugins.next()) else {
                    return Err(PluginError::new(
                        ErrorCode::NoPluginLoaded,
                        format!("a {kind} sandbox needs exactly one plugin"),
                    ));
                };
                let notifier = Box::new(ChannelNotifier::new(channel.clone()));
                match plugin {
                    RolePlugin::Classifier(mut classifier) => {
                        classifier.set_notifier(notifier);
                        Ok(Self::Classifier(ClassifierHost {
                            classifier,
                            input_set: (0, false),
                            model,
                            outputs,
                            channel: channel.clone(),
                        }))
                    }
                    RolePlugin::GoalPlanner(mut planner) => {
                        planner.set_notifier(notifier);
                        Ok(Self::GoalPlanner(PlannerHost {
                            planner,
                            perception: RemotePerception::new(channel.clone()),
                            model,
                            outputs,
                            channel: channel.clone(),
                        }))
                    }
                    RolePlugin::Heuristic(_) | RolePlugin::Instrument(_) => {
                        Err(PluginError::from_code(ErrorCode::PluginKindMismatch))
                    }
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Heuristics(host) => host.len(),
            Self::Instruments(host) => host.len(),
            Self::Classifier(_) | Self::GoalPlanner(_) => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run one role command whose packet is current on `channel`.
    ///
    /// `None` when the role has no such command.
    pub fn handle(&mut self, kind: MessageKind, channel: &mut Channel) -> Option<CommandResult> {
        match self {
            Self::Heuristics(host) => host.handle(kind, channel),
            Self::Classifier(host) => host.handle(kind, channel),
            Self::GoalPlanner(host) => host.handle(kind, channel),
            Self::Instruments(host) => host.handle(kind, channel),
        }
    }
}

pub struct ClassifierHost {
    classifier: Box<dyn Classifier>,
    /// Input set of the latest train or classify command
    input_set: (u32, bool),
    model: ModelData,
    outputs: Option<ModelOutputs>,
    channel: Channel,
}

impl ClassifierHost {
    fn remote_input_set(&self) -> RemoteInputSet {
        let (id, detection) = self.input_set;
        RemoteInputSet::new(self.channel.clone(), id, detection)
    }

    fn read_input_set(&mut self, channel: &mut Channel) -> Result<RemoteInputSet, CommandFailure> {
        let id = channel.read::<u32>()?;
        let detection = channel.read::<bool>()?;
        self.input_set = (id, detection);
        Ok(self.remote_input_set())
    }

    fn handle(&mut self, kind: MessageKind, channel: &mut Channel) -> Option<CommandResult> {
        let result = match kind {
            MessageKind::ClassifierSetSeed => self.set_seed(channel),
            MessageKind::ClassifierSetup => self.setup(channel),
            MessageKind::LoadModel => self.load_model(channel),
            MessageKind::ClassifierTrain => self.train(channel),
            MessageKind::ClassifierClassify => self.classify(channel),
            MessageKind::ClassifierReportFeaturesUsed => self.report_features_used(channel),
            MessageKind::SaveModel => self.save_model(channel),
            _ => return None,
        };
        Some(result)
    }

    fn set_seed(&mut self, channel: &mut Channel) -> CommandResult {
        let seed = channel.read::<u32>()?;
        self.classifier.set_seed(seed);
        respond(channel)
    }

    fn setup(&mut self, channel: &mut Channel) -> CommandResult {
        let parameters = read_parameters(channel)?;
        self.classifier.setup(&parameters)?;
        respond(channel)
    }

    fn load_model(&mut self, channel: &mut Channel) -> CommandResult {
        require_model(&self.model)?;
        let mut input_set = self.remote_input_set();
        self.classifier.load_model(&self.model, &mut input_set)?;
        respond(channel)
    }

    fn train(&mut self, channel: &mut Channel) -> CommandResult {
        let mut input_set = self.read_input_set(channel)?;
        let train_error = self.classifier.train(&mut input_set)?;

        let writer = channel.start_packet(MessageKind::Response);
        if let Some(error) = train_error.filter(|error| !error.is_nan()) {
            writer.add(&error);
        }
        channel.send_packet()?;
        Ok(())
    }

    fn classify(&mut self, channel: &mut Channel) -> CommandResult {
        let mut input_set = self.read_input_set(channel)?;
        let image = channel.read::<u32>()?;
        let x = channel.read::<u32>()?;
        let y = channel.read::<u32>()?;
        let scores = self
            .classifier
            .classify(&mut input_set, image, Coordinates::new(x, y))?;

        write_scores(channel.start_packet(MessageKind::Response), &scores);
        channel.send_packet()?;
        Ok(())
    }

    fn report_features_used(&mut self, channel: &mut Channel) -> CommandResult {
        let features = self.classifier.report_features_used()?;
        write_features(channel.start_packet(MessageKind::Response), &features);
        channel.send_packet()?;
        Ok(())
    }

    fn save_model(&mut self, channel: &mut Channel) -> CommandResult {
        let saved = self.classifier.save_model();
        save_into(self.outputs.as_mut(), saved)?;
        respond(channel)
    }
}

pub struct PlannerHost {
    planner: Box<dyn GoalPlanner>,
    perception: RemotePerception,
    model: ModelData,
    outputs: Option<ModelOutputs>,
    channel: Channel,
}

impl PlannerHost {
    fn handle(&mut self, kind: MessageKind, channel: &mut Channel) -> Option<CommandResult> {
        let result = match kind {
            MessageKind::PlannerSetSeed => self.set_seed(channel),
            MessageKind::PlannerSetup => self.setup(channel),
            MessageKind::LoadModel => self.load_model(channel),
            MessageKind::PlannerLearn => self.learn(channel),
            MessageKind::PlannerChooseAction => self.choose_action(channel),
            MessageKind::PlannerReportFeaturesUsed => self.report_features_used(channel),
            MessageKind::SaveModel => self.save_model(channel),
            _ => return None,
        };
        Some(result)
    }

    fn set_seed(&mut self, channel: &mut Channel) -> CommandResult {
        let seed = channel.read::<u32>()?;
        self.planner.set_seed(seed);
        respond(channel)
    }

    fn setup(&mut self, channel: &mut Channel) -> CommandResult {
        let parameters = read_parameters(channel)?;
        self.planner.setup(&parameters)?;
        respond(channel)
    }

    fn load_model(&mut self, channel: &mut Channel) -> CommandResult {
        require_model(&self.model)?;
        self.planner.load_model(&self.model, &mut self.perception)?;
        respond(channel)
    }

    fn learn(&mut self, channel: &mut Channel) -> CommandResult {
        let mut task = RemoteTask::new(self.channel.clone());
        self.planner.learn(&mut task)?;
        respond(channel)
    }

    fn choose_action(&mut self, channel: &mut Channel) -> CommandResult {
        let new_sequence = channel.read::<u32>()? != 0;
        self.perception.set_new_sequence(new_sequence);
        let action = self.planner.choose_action(&mut self.perception, new_sequence)?;

        channel.start_packet(MessageKind::Response).add(&action);
        channel.send_packet()?;
        Ok(())
    }

    fn report_features_used(&mut self, channel: &mut Channel) -> CommandResult {
        let features = self.planner.report_features_used()?;
        write_features(channel.start_packet(MessageKind::Response), &features);
        channel.send_packet()?;
        Ok(())
    }

    fn save_model(&mut self, channel: &mut Channel) -> CommandResult {
        let saved = self.planner.save_model();
        save_into(self.outputs.as_mut(), saved)?;
        respond(channel)
    }
}
