//! Roles an untrusted plugin can implement.
use super::data::{InputSet, Perception, Task};
use super::types::{
    ClassificationDone, ClassifierFeatures, Coordinates, FeatureRef, Image, LabelScore, ModelData,
    Parameter, PlannerFeatures, SavedModel, TaskResult,
};
use super::PluginResult;
use crate::config::types::PluginKind;

/// Feature extractor working on one image at a time.
pub trait Heuristic {
    fn set_seed(&mut self, _seed: u32) {}

    fn init(&mut self, _nb_views: u32, _roi_extent: u32) -> PluginResult<()> {
        Ok(())
    }

    /// Number of features this heuristic computes.
    fn dim(&self) -> u32;

    fn prepare_for_sequence(&mut self) -> PluginResult<()> {
        Ok(())
    }

    fn finish_for_sequence(&mut self) {}

    fn prepare_for_image(&mut self, _view: u32, _image: &Image) -> PluginResult<()> {
        Ok(())
    }

    fn finish_for_image(&mut self, _view: u32) {}

    /// Called before the features around `position` are requested.
    fn prepare_for_coordinates(&mut self, _position: Coordinates) -> PluginResult<()> {
        Ok(())
    }

    fn finish_for_coordinates(&mut self) {}

    /// Value of one feature around `position` of the prepared image.
    fn compute_feature(&mut self, position: Coordinates, feature: u32) -> f32;
}

/// Progress reports a predictor sends while it trains or learns.
pub trait Notifier {
    fn training_step_done(&mut self, step: u32, nb_steps: u32);
}

pub trait Classifier {
    fn set_seed(&mut self, _seed: u32) {}

    /// Receive the notifier once, right after construction.
    fn set_notifier(&mut self, _notifier: Box<dyn Notifier>) {}

    fn setup(&mut self, parameters: &[Parameter]) -> PluginResult<()>;

    /// Restore the model given at construction. The input set tells which
    /// heuristics are available.
    fn load_model(&mut self, model: &ModelData, input_set: &mut dyn InputSet) -> PluginResult<()>;

    /// Train; the optional value is the training error.
    fn train(&mut self, input_set: &mut dyn InputSet) -> PluginResult<Option<f32>>;

    fn classify(
        &mut self,
        input_set: &mut dyn InputSet,
        image: u32,
        position: Coordinates,
    ) -> PluginResult<Vec<LabelScore>>;

    fn report_features_used(&mut self) -> PluginResult<Vec<FeatureRef>>;

    fn save_model(&mut self) -> PluginResult<SavedModel>;
}

pub trait GoalPlanner {
    fn set_seed(&mut self, _seed: u32) {}

    fn set_notifier(&mut self, _notifier: Box<dyn Notifier>) {}

    fn setup(&mut self, parameters: &[Parameter]) -> PluginResult<()>;

    fn load_model(&mut self, model: &ModelData, perception: &mut dyn Perception) -> PluginResult<()>;

    fn learn(&mut self, task: &mut dyn Task) -> PluginResult<()>;

    fn choose_action(&mut self, perception: &mut dyn Perception, new_sequence: bool) -> PluginResult<u32>;

    fn report_features_used(&mut self) -> PluginResult<Vec<FeatureRef>>;

    fn save_model(&mut self) -> PluginResult<SavedModel>;
}

/// Observer of an experiment. Every hook defaults to doing nothing.
///
/// The input set or task handed to a hook is only valid during the call.
pub trait Instrument {
    fn setup(&mut self, _parameters: &[Parameter]) -> PluginResult<()> {
        Ok(())
    }

    fn on_experiment_done(&mut self) {}

    fn on_classification_experiment_started(&mut self, _input_set: &mut dyn InputSet) {}

    fn on_classifier_training_started(&mut self, _input_set: &mut dyn InputSet) {}

    fn on_classifier_training_done(&mut self, _input_set: &mut dyn InputSet, _train_error: f32) {}

    fn on_classifier_test_started(&mut self, _input_set: &mut dyn InputSet) {}

    fn on_classifier_test_done(&mut self, _input_set: &mut dyn InputSet, _test_error: f32) {}

    fn on_classification_done(&mut self, _input_set: &mut dyn InputSet, _event: &ClassificationDone) {}

    fn on_features_computed_by_classifier(&mut self, _event: &ClassifierFeatures) {}

    fn on_goalplanning_experiment_started(&mut self, _task: &mut dyn Task) {}

    fn on_planner_learning_started(&mut self, _task: &mut dyn Task) {}

    fn on_planner_learning_done(&mut self, _task: &mut dyn Task, _result: TaskResult) {}

    fn on_planner_test_started(&mut self, _task: &mut dyn Task) {}

    fn on_planner_test_done(&mut self, _task: &mut dyn Task, _score: f32, _result: TaskResult) {}

    fn on_planner_action_chosen(
        &mut self,
        _task: &mut dyn Task,
        _action: u32,
        _reward: f32,
        _result: TaskResult,
    ) {
    }

    fn on_features_computed_by_planner(&mut self, _event: &PlannerFeatures) {}

    fn on_feature_list_reported(&mut self, _features: &[FeatureRef]) {}
}

/// A constructed plugin object of any role.
pub enum RolePlugin {
    Heuristic(Box<dyn Heuristic>),
    Classifier(Box<dyn Classifier>),
    GoalPlanner(Box<dyn GoalPlanner>),
    Instrument(Box<dyn Instrument>),
}

impl RolePlugin {
    pub fn kind(&self) -> PluginKind {
        match self {
            Self::Heuristic(_) => PluginKind::Heuristics,
            Self::Classifier(_) => PluginKind::Classifier,
            Self::GoalPlanner(_) => PluginKind::GoalPlanner,
            Self::Instrument(_) => PluginKind::Instruments,
        }
    }
}

impl std::fmt::Debug for RolePlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RolePlugin({})", self.kind())
    }
}
