//! Read-only data a plugin pulls from the trusted process.
use super::types::{ActionOutcome, Coordinates, Dimensions, Image, LabeledObject, TaskMode};
use super::PluginResult;

/// Images, annotations and features seen by a classifier.
pub trait InputSet {
    fn id(&self) -> u32;
    fn is_doing_detection(&self) -> bool;

    fn nb_heuristics(&mut self) -> PluginResult<u32>;
    fn nb_features(&mut self, heuristic: u32) -> PluginResult<u32>;
    fn heuristic_name(&mut self, heuristic: u32) -> PluginResult<String>;
    fn heuristic_seed(&mut self, heuristic: u32) -> PluginResult<u32>;
    fn nb_images(&mut self) -> PluginResult<u32>;
    fn nb_labels(&mut self) -> PluginResult<u32>;

    /// Values of `features` of one heuristic, in the same order.
    fn compute_some_features(
        &mut self,
        image: u32,
        position: Coordinates,
        heuristic: u32,
        features: &[u32],
    ) -> PluginResult<Vec<f32>>;

    fn objects_in_image(&mut self, image: u32) -> PluginResult<Vec<LabeledObject>>;
    fn negatives_in_image(&mut self, image: u32) -> PluginResult<Vec<Coordinates>>;
    fn image_size(&mut self, image: u32) -> PluginResult<Dimensions>;
    fn is_image_in_test_set(&mut self, image: u32) -> PluginResult<bool>;
    fn roi_extent(&mut self) -> PluginResult<u32>;
}

/// What a goal-planner sees of its environment.
pub trait Perception {
    fn nb_heuristics(&mut self) -> PluginResult<u32>;
    fn nb_features(&mut self, heuristic: u32) -> PluginResult<u32>;
    fn heuristic_name(&mut self, heuristic: u32) -> PluginResult<String>;
    fn heuristic_seed(&mut self, heuristic: u32) -> PluginResult<u32>;
    fn nb_views(&mut self) -> PluginResult<u32>;

    fn compute_some_features(
        &mut self,
        view: u32,
        position: Coordinates,
        heuristic: u32,
        features: &[u32],
    ) -> PluginResult<Vec<f32>>;

    fn view_size(&mut self, view: u32) -> PluginResult<Dimensions>;
    fn view_pixels(&mut self, view: u32) -> PluginResult<Image>;
    fn roi_extent(&mut self) -> PluginResult<u32>;
}

/// An environment a goal-planner acts in.
pub trait Task {
    fn mode(&mut self) -> PluginResult<TaskMode>;
    fn nb_actions(&mut self) -> PluginResult<u32>;
    fn nb_trajectories(&mut self) -> PluginResult<u32>;
    fn trajectory_length(&mut self, trajectory: u32) -> PluginResult<u32>;
    fn reset(&mut self) -> PluginResult<()>;
    fn perform_action(&mut self, action: u32) -> PluginResult<ActionOutcome>;
    fn suggested_action(&mut self) -> PluginResult<u32>;

    fn perception(&mut self) -> &mut dyn Perception;
}
