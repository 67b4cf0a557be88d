//! Shared fixtures: test plugins compiled into the sandbox, trusted data
//! objects answering their reverse calls, and session configuration.
#![allow(dead_code)]

use plugbox::config::types::{ErrorCode, PluginKind, SandboxConfiguration};
use plugbox::host::{PluginDescriptor, PluginRegistry};
use plugbox::plugin::{
    ActionOutcome, Classifier, Coordinates, Dimensions, FeatureRef, GoalPlanner, Heuristic, Image,
    InputSet, Instrument, LabelScore, LabeledObject, ModelData, Notifier, Parameter, Perception,
    PluginError, PluginResult, RolePlugin, SavedModel, Task, TaskMode, TaskResult,
};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

#[global_allocator]
static ALLOC: plugbox::warden::WardenAllocator = plugbox::warden::WardenAllocator;

static FORK_LOCK: Mutex<()> = Mutex::new(());

/// Forking tests run one at a time so that no other test thread holds a
/// lock the child would inherit.
pub fn serial() -> MutexGuard<'static, ()> {
    FORK_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub fn config(dir: &std::path::Path) -> SandboxConfiguration {
    let mut config = SandboxConfiguration {
        log_dir: Some(dir.join("logs")),
        output_dir: Some(dir.join("out")),
        temp_dir: dir.join("tmp"),
        allow_root: true,
        verbosity: 3,
        ..SandboxConfiguration::default()
    };
    config.timeouts.creation_ms = 5_000;
    config.timeouts.command_ms = 5_000;
    std::fs::create_dir_all(dir.join("out")).unwrap();
    config
}

pub fn with_command_timeout(mut config: SandboxConfiguration, timeout: Duration) -> SandboxConfiguration {
    config.timeouts.command_ms = timeout.as_millis() as u64;
    config
}

// ---- heuristics ----

/// `dim` features; feature `i` at (x, y) is `x + y + i`.
pub struct Gradient {
    dim: u32,
    seed: u32,
}

impl Heuristic for Gradient {
    fn set_seed(&mut self, seed: u32) {
        self.seed = seed;
    }

    fn dim(&self) -> u32 {
        self.dim
    }

    fn compute_feature(&mut self, position: Coordinates, feature: u32) -> f32 {
        (position.x + position.y + feature) as f32
    }
}

fn build_gradient(_: &ModelData) -> PluginResult<RolePlugin> {
    Ok(RolePlugin::Heuristic(Box::new(Gradient { dim: 4, seed: 0 })))
}

/// Mean red value of the prepared image, for every feature.
pub struct MeanRed {
    mean: f32,
}

impl Heuristic for MeanRed {
    fn dim(&self) -> u32 {
        1
    }

    fn prepare_for_image(&mut self, _view: u32, image: &Image) -> PluginResult<()> {
        let count = (image.width * image.height).max(1) as f32;
        let sum: u32 = image.pixels.chunks(3).map(|rgb| u32::from(rgb[0])).sum();
        self.mean = sum as f32 / count;
        Ok(())
    }

    fn finish_for_image(&mut self, _view: u32) {
        self.mean = f32::NAN;
    }

    fn compute_feature(&mut self, _position: Coordinates, _feature: u32) -> f32 {
        self.mean
    }
}

fn build_mean_red(_: &ModelData) -> PluginResult<RolePlugin> {
    Ok(RolePlugin::Heuristic(Box::new(MeanRed { mean: f32::NAN })))
}

/// Never returns from `compute_feature`.
struct Spinner;

impl Heuristic for Spinner {
    fn dim(&self) -> u32 {
        1
    }

    fn compute_feature(&mut self, _position: Coordinates, _feature: u32) -> f32 {
        loop {
            std::hint::spin_loop();
        }
    }
}

fn build_spinner(_: &ModelData) -> PluginResult<RolePlugin> {
    Ok(RolePlugin::Heuristic(Box::new(Spinner)))
}

fn build_aborting(_: &ModelData) -> PluginResult<RolePlugin> {
    std::process::abort()
}

fn build_forking(_: &ModelData) -> PluginResult<RolePlugin> {
    // SAFETY: the Warden stops the process before fork returns.
    let _ = unsafe { nix::unistd::fork() };
    Ok(RolePlugin::Heuristic(Box::new(Gradient { dim: 1, seed: 0 })))
}

fn build_greedy(_: &ModelData) -> PluginResult<RolePlugin> {
    let hoard = vec![1u8; 256 << 20];
    std::hint::black_box(&hoard);
    Ok(RolePlugin::Heuristic(Box::new(Gradient { dim: hoard.len() as u32, seed: 0 })))
}

/// Spends more processor time in its constructor than a heuristic may.
fn build_sluggish(_: &ModelData) -> PluginResult<RolePlugin> {
    let started = plugbox::kernel::watchdog::cpu_time();
    let mut acc = 0u64;
    while plugbox::kernel::watchdog::cpu_time() - started < Duration::from_millis(2_200) {
        for i in 0..10_000u64 {
            acc = acc.wrapping_mul(31).wrapping_add(i);
        }
        std::hint::black_box(acc);
    }
    Ok(RolePlugin::Heuristic(Box::new(Gradient { dim: 1, seed: 0 })))
}

fn read_passwd() {
    let _ = std::fs::read("/etc/passwd");
}

// ---- classifier ----

/// Scores each label with the sum of feature 0 of every heuristic.
/// Training reports one step per image.
pub struct SumClassifier {
    labels: u32,
    seed: u32,
    notifier: Option<Box<dyn Notifier>>,
}

impl Classifier for SumClassifier {
    fn set_seed(&mut self, seed: u32) {
        self.seed = seed;
    }

    fn set_notifier(&mut self, notifier: Box<dyn Notifier>) {
        self.notifier = Some(notifier);
    }

    fn setup(&mut self, parameters: &[Parameter]) -> PluginResult<()> {
        match parameters.iter().find(|parameter| parameter.name == "fail") {
            Some(_) => Err(PluginError::new(ErrorCode::SetupFailed, "asked to fail")),
            None => Ok(()),
        }
    }

    fn load_model(&mut self, model: &ModelData, input_set: &mut dyn InputSet) -> PluginResult<()> {
        let expected = model.model.as_ref().map_or(0, |bytes| bytes.len() as u32);
        if input_set.nb_heuristics()? < expected {
            return Err(PluginError::from_code(ErrorCode::ModelMissingHeuristic));
        }
        Ok(())
    }

    fn train(&mut self, input_set: &mut dyn InputSet) -> PluginResult<Option<f32>> {
        self.labels = input_set.nb_labels()?;
        let images = input_set.nb_images()?;
        for image in 0..images {
            input_set.objects_in_image(image)?;
            if let Some(notifier) = self.notifier.as_mut() {
                notifier.training_step_done(image + 1, images);
            }
        }
        Ok(Some(0.25))
    }

    fn classify(
        &mut self,
        input_set: &mut dyn InputSet,
        image: u32,
        position: Coordinates,
    ) -> PluginResult<Vec<LabelScore>> {
        let mut score = 0.0;
        for heuristic in 0..input_set.nb_heuristics()? {
            score += input_set.compute_some_features(image, position, heuristic, &[0])?[0];
        }
        Ok((0..self.labels.max(1))
            .map(|label| LabelScore { label, score: score + label as f32 })
            .collect())
    }

    fn report_features_used(&mut self) -> PluginResult<Vec<FeatureRef>> {
        Ok(vec![FeatureRef { heuristic: 0, feature: 0 }])
    }

    fn save_model(&mut self) -> PluginResult<SavedModel> {
        Ok(SavedModel {
            model: format!("labels {}\n", self.labels).into_bytes(),
            internal_data: Some(vec![self.seed as u8]),
        })
    }
}

fn build_sum_classifier(_: &ModelData) -> PluginResult<RolePlugin> {
    Ok(RolePlugin::Classifier(Box::new(SumClassifier {
        labels: 0,
        seed: 0,
        notifier: None,
    })))
}

fn build_aborting_classifier(_: &ModelData) -> PluginResult<RolePlugin> {
    std::process::abort()
}

// ---- goal-planner ----

/// Reads the heuristic count, then three feature vectors, then walks right.
/// Learning reports one step per feature vector.
pub struct Explorer {
    notifier: Option<Box<dyn Notifier>>,
}

impl GoalPlanner for Explorer {
    fn set_notifier(&mut self, notifier: Box<dyn Notifier>) {
        self.notifier = Some(notifier);
    }

    fn setup(&mut self, _parameters: &[Parameter]) -> PluginResult<()> {
        Ok(())
    }

    fn load_model(&mut self, _model: &ModelData, _perception: &mut dyn Perception) -> PluginResult<()> {
        Ok(())
    }

    fn learn(&mut self, task: &mut dyn Task) -> PluginResult<()> {
        let perception = task.perception();
        let heuristics = perception.nb_heuristics()?;
        if heuristics == 0 {
            return Err(PluginError::new(ErrorCode::LearningFailed, "no heuristic"));
        }
        for step in 0..3 {
            perception.compute_some_features(0, Coordinates::new(step, step), 0, &[0, 1])?;
            if let Some(notifier) = self.notifier.as_mut() {
                notifier.training_step_done(step + 1, 3);
            }
        }
        Ok(())
    }

    fn choose_action(&mut self, perception: &mut dyn Perception, new_sequence: bool) -> PluginResult<u32> {
        let size = perception.view_size(0)?;
        Ok(if new_sequence { 0 } else { size.width / 4 })
    }

    fn report_features_used(&mut self) -> PluginResult<Vec<FeatureRef>> {
        Ok(vec![FeatureRef { heuristic: 0, feature: 1 }])
    }

    fn save_model(&mut self) -> PluginResult<SavedModel> {
        Ok(SavedModel {
            model: b"explorer".to_vec(),
            internal_data: None,
        })
    }
}

fn build_explorer(_: &ModelData) -> PluginResult<RolePlugin> {
    Ok(RolePlugin::GoalPlanner(Box::new(Explorer { notifier: None })))
}

// ---- instruments ----

/// Asks the input set for one feature when training starts, and resets the
/// task when learning starts.
pub struct Tally;

impl Instrument for Tally {
    fn setup(&mut self, parameters: &[Parameter]) -> PluginResult<()> {
        match parameters.iter().find(|parameter| parameter.name == "fail") {
            Some(_) => Err(PluginError::new(ErrorCode::SetupFailed, "asked to fail")),
            None => Ok(()),
        }
    }

    fn on_classifier_training_started(&mut self, input_set: &mut dyn InputSet) {
        let _ = input_set.compute_some_features(0, Coordinates::new(1, 1), 0, &[0]);
    }

    fn on_planner_learning_started(&mut self, task: &mut dyn Task) {
        let _ = task.reset();
    }
}

fn build_tally(_: &ModelData) -> PluginResult<RolePlugin> {
    Ok(RolePlugin::Instrument(Box::new(Tally)))
}

/// Aborts once the experiment is over.
struct Fragile;

impl Instrument for Fragile {
    fn on_experiment_done(&mut self) {
        std::process::abort()
    }
}

fn build_fragile(_: &ModelData) -> PluginResult<RolePlugin> {
    Ok(RolePlugin::Instrument(Box::new(Fragile)))
}

pub fn registry() -> PluginRegistry {
    PluginRegistry::new()
        .with(PluginDescriptor::new("gradient", PluginKind::Heuristics, build_gradient))
        .with(PluginDescriptor::new("mean_red", PluginKind::Heuristics, build_mean_red))
        .with(PluginDescriptor::new("spinner", PluginKind::Heuristics, build_spinner))
        .with(PluginDescriptor::new("aborting", PluginKind::Heuristics, build_aborting))
        .with(PluginDescriptor::new("forking", PluginKind::Heuristics, build_forking))
        .with(PluginDescriptor::new("greedy", PluginKind::Heuristics, build_greedy))
        .with(PluginDescriptor::new("sluggish", PluginKind::Heuristics, build_sluggish))
        .with(
            PluginDescriptor::new("snooping", PluginKind::Heuristics, build_gradient)
                .with_load_hook(read_passwd),
        )
        .with(PluginDescriptor::new("sum", PluginKind::Classifier, build_sum_classifier))
        .with(PluginDescriptor::new(
            "aborting_classifier",
            PluginKind::Classifier,
            build_aborting_classifier,
        ))
        .with(PluginDescriptor::new("explorer", PluginKind::GoalPlanner, build_explorer))
        .with(PluginDescriptor::new("tally", PluginKind::Instruments, build_tally))
        .with(PluginDescriptor::new("fragile", PluginKind::Instruments, build_fragile))
}

// ---- trusted data ----

/// A perception over one 8x6 view with two heuristics of 2 features.
/// Feature values come from `value`, or fail with `failure` when set.
#[derive(Default)]
pub struct Grid {
    pub feature_requests: u32,
    pub heuristic_requests: u32,
    pub failure: Option<ErrorCode>,
}

impl Perception for Grid {
    fn nb_heuristics(&mut self) -> PluginResult<u32> {
        self.heuristic_requests += 1;
        Ok(2)
    }

    fn nb_features(&mut self, _heuristic: u32) -> PluginResult<u32> {
        Ok(2)
    }

    fn heuristic_name(&mut self, heuristic: u32) -> PluginResult<String> {
        Ok(format!("grid/{heuristic}"))
    }

    fn heuristic_seed(&mut self, heuristic: u32) -> PluginResult<u32> {
        Ok(heuristic * 7)
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
        self.feature_requests += 1;
        if let Some(code) = self.failure {
            return Err(PluginError::from_code(code));
        }
        Ok(features
            .iter()
            .map(|feature| (position.x * 100 + heuristic * 10 + feature) as f32)
            .collect())
    }

    fn view_size(&mut self, _view: u32) -> PluginResult<Dimensions> {
        Ok(Dimensions { width: 8, height: 6 })
    }

    fn view_pixels(&mut self, _view: u32) -> PluginResult<Image> {
        Ok(Image::new(8, 6, vec![0; Image::expected_len(8, 6)]))
    }

    fn roi_extent(&mut self) -> PluginResult<u32> {
        Ok(3)
    }
}

/// A corridor: action 1 moves right, the goal is 3 steps away.
#[derive(Default)]
pub struct Corridor {
    pub grid: Grid,
    pub position: u32,
    pub resets: u32,
}

impl Task for Corridor {
    fn mode(&mut self) -> PluginResult<TaskMode> {
        Ok(TaskMode::Standard)
    }

    fn nb_actions(&mut self) -> PluginResult<u32> {
        Ok(2)
    }

    fn nb_trajectories(&mut self) -> PluginResult<u32> {
        Ok(0)
    }

    fn trajectory_length(&mut self, _trajectory: u32) -> PluginResult<u32> {
        Err(PluginError::from_code(ErrorCode::InvalidArguments))
    }

    fn reset(&mut self) -> PluginResult<()> {
        self.position = 0;
        self.resets += 1;
        Ok(())
    }

    fn perform_action(&mut self, action: u32) -> PluginResult<ActionOutcome> {
        if action == 1 {
            self.position += 1;
        }
        let result = if self.position >= 3 {
            TaskResult::GoalReached
        } else {
            TaskResult::None
        };
        Ok(ActionOutcome {
            reward: if result == TaskResult::GoalReached { 1.0 } else { 0.0 },
            result,
            suggested_action: None,
        })
    }

    fn suggested_action(&mut self) -> PluginResult<u32> {
        Ok(1)
    }

    fn perception(&mut self) -> &mut dyn Perception {
        &mut self.grid
    }
}

/// Two images, two labels, one heuristic whose feature 0 is `x + y`.
#[derive(Default)]
pub struct Shapes {
    pub feature_requests: u32,
}

impl InputSet for Shapes {
    fn id(&self) -> u32 {
        9
    }

    fn is_doing_detection(&self) -> bool {
        false
    }

    fn nb_heuristics(&mut self) -> PluginResult<u32> {
        Ok(1)
    }

    fn nb_features(&mut self, _heuristic: u32) -> PluginResult<u32> {
        Ok(1)
    }

    fn heuristic_name(&mut self, _heuristic: u32) -> PluginResult<String> {
        Ok("sum".to_string())
    }

    fn heuristic_seed(&mut self, _heuristic: u32) -> PluginResult<u32> {
        Ok(0)
    }

    fn nb_images(&mut self) -> PluginResult<u32> {
        Ok(2)
    }

    fn nb_labels(&mut self) -> PluginResult<u32> {
        Ok(2)
    }

    fn compute_some_features(
        &mut self,
        _image: u32,
        position: Coordinates,
        _heuristic: u32,
        features: &[u32],
    ) -> PluginResult<Vec<f32>> {
        self.feature_requests += 1;
        Ok(features.iter().map(|_| (position.x + position.y) as f32).collect())
    }

    fn objects_in_image(&mut self, image: u32) -> PluginResult<Vec<LabeledObject>> {
        Ok(vec![LabeledObject {
            label: image % 2,
            left: 0,
            top: 0,
            width: 4,
            height: 4,
        }])
    }

    fn negatives_in_image(&mut self, _image: u32) -> PluginResult<Vec<Coordinates>> {
        Ok(Vec::new())
    }

    fn image_size(&mut self, _image: u32) -> PluginResult<Dimensions> {
        Ok(Dimensions { width: 16, height: 16 })
    }

    fn is_image_in_test_set(&mut self, image: u32) -> PluginResult<bool> {
        Ok(image == 1)
    }

    fn roi_extent(&mut self) -> PluginResult<u32> {
        Ok(4)
    }
}
