use super::{begin, load_predictor, CommandContext};
use crate::config::types::{PluginKind, Result, SandboxConfiguration};
use crate::core::{SandboxController, SpawnMode, TrainingListener};
use crate::plugin::{Coordinates, FeatureRef, InputSet, LabelScore, Parameter};
use crate::protocol::MessageKind;
use crate::rpc::wire::{read_features, read_scores, write_parameters};
use crate::rpc::ReverseCallTable;
use std::path::PathBuf;

/// A classifier plugin running in its own sandboxed process.
///
/// Commands taking an input set answer the classifier's input-set reverse
/// calls from it while they run.
pub struct SandboxedClassifier {
    controller: SandboxController,
}

impl SandboxedClassifier {
    pub fn new(config: SandboxConfiguration) -> Self {
        Self {
            controller: SandboxController::new(PluginKind::Classifier, config),
        }
    }

    pub fn create_sandbox(&mut self, mode: SpawnMode) -> Result<()> {
        self.controller.create_sandbox(mode)
    }

    pub fn set_classifiers_folder(&mut self, path: impl Into<PathBuf>) -> Result<()> {
        self.controller.set_plugins_folder(path)
    }

    /// Load the classifier, give it its model files and construct it.
    pub fn load_classifier(
        &mut self,
        name: &str,
        model: Option<PathBuf>,
        internal_data: Option<PathBuf>,
    ) -> Result<()> {
        load_predictor(&mut self.controller, name, model, internal_data)
    }

    /// `listener` hears of every training step the classifier reports.
    pub fn set_training_listener(&mut self, listener: impl TrainingListener + 'static) {
        self.controller.set_training_listener(listener);
    }

    pub fn set_seed(&mut self, seed: u32) -> Result<()> {
        begin(&mut self.controller, CommandContext::method("setSeed").parameter("Seed", seed))?;
        self.controller.request(
            MessageKind::ClassifierSetSeed,
            |writer| {
                writer.add(&seed);
            },
            &mut ReverseCallTable::None,
        )
    }

    pub fn setup(&mut self, parameters: &[Parameter]) -> Result<()> {
        begin(&mut self.controller, CommandContext::method("setup").parameters(parameters))?;
        self.controller.request(
            MessageKind::ClassifierSetup,
            |writer| write_parameters(writer, parameters),
            &mut ReverseCallTable::None,
        )
    }

    /// Restore the model given at load time; `input_set` answers the
    /// questions the classifier asks meanwhile.
    pub fn load_model(&mut self, input_set: &mut dyn InputSet) -> Result<()> {
        begin(&mut self.controller, CommandContext::method("loadModel"))?;
        self.controller.request(
            MessageKind::LoadModel,
            |_| {},
            &mut ReverseCallTable::InputSet(input_set),
        )
    }

    /// Train on `input_set`. Returns the training error, when the classifier
    /// reported one.
    pub fn train(&mut self, input_set: &mut dyn InputSet) -> Result<Option<f32>> {
        let context = describe(CommandContext::method("train"), input_set);
        begin(&mut self.controller, context)?;
        let (id, detection) = (input_set.id(), input_set.is_doing_detection());
        self.controller.request(
            MessageKind::ClassifierTrain,
            |writer| {
                writer.add(&id).add(&detection);
            },
            &mut ReverseCallTable::InputSet(input_set),
        )?;

        if self.controller.is_at_end() {
            return Ok(None);
        }
        self.controller.read::<f32>().map(Some)
    }

    /// Scores of every label the classifier sees around `position` of `image`.
    pub fn classify(
        &mut self,
        input_set: &mut dyn InputSet,
        image: u32,
        position: Coordinates,
    ) -> Result<Vec<LabelScore>> {
        let context = describe(CommandContext::method("classify"), input_set)
            .parameter("Image", image)
            .parameter("Position", format_args!("({}, {})", position.x, position.y));
        begin(&mut self.controller, context)?;
        let (id, detection) = (input_set.id(), input_set.is_doing_detection());
        self.controller.request(
            MessageKind::ClassifierClassify,
            |writer| {
                writer
                    .add(&id)
                    .add(&detection)
                    .add(&image)
                    .add(&position.x)
                    .add(&position.y);
            },
            &mut ReverseCallTable::InputSet(input_set),
        )?;
        self.controller.read_with(read_scores)
    }

    pub fn report_features_used(&mut self) -> Result<Vec<FeatureRef>> {
        begin(&mut self.controller, CommandContext::method("reportFeaturesUsed"))?;
        self.controller.request(
            MessageKind::ClassifierReportFeaturesUsed,
            |_| {},
            &mut ReverseCallTable::None,
        )?;
        self.controller.read_with(read_features)
    }

    /// Have the classifier write its model into the output folder.
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

fn describe(context: CommandContext, input_set: &mut dyn InputSet) -> CommandContext {
    let nb_images = input_set.nb_images().map_or_else(|_| "?".to_string(), |n| n.to_string());
    let nb_labels = input_set.nb_labels().map_or_else(|_| "?".to_string(), |n| n.to_string());
    context
        .parameter("Input set", input_set.id())
        .parameter("Detection", input_set.is_doing_detection())
        .parameter("Number of images", nb_images)
        .parameter("Number of labels", nb_labels)
}
