//! Values exchanged between plugins and the data interfaces.
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One experiment parameter: a name and its textual arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub arguments: Vec<String>,
}

impl Parameter {
    pub fn new<S: Into<String>>(name: impl Into<String>, arguments: impl IntoIterator<Item = S>) -> Self {
        Self {
            name: name.into(),
            arguments: arguments.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Coordinates {
    pub x: u32,
    pub y: u32,
}

impl Coordinates {
    pub fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

/// Annotated object of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabeledObject {
    pub label: u32,
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LabelScore {
    pub label: u32,
    pub score: f32,
}

/// A feature of a heuristic, as reported by a predictor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeatureRef {
    pub heuristic: u32,
    pub feature: u32,
}

/// How a task hands out actions to the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum TaskMode {
    Standard = 0,
    /// Recorded trajectories; every action comes with a mandatory suggestion
    Recording = 1,
    /// An external oracle suggests actions
    Suggestions = 2,
}

impl TaskMode {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Standard),
            1 => Some(Self::Recording),
            2 => Some(Self::Suggestions),
            _ => None,
        }
    }

    pub fn has_suggestions(self) -> bool {
        self != Self::Standard
    }
}

/// State of a task after an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum TaskResult {
    None = 0,
    GoalReached = 1,
    TaskFailed = 2,
}

impl TaskResult {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::GoalReached),
            2 => Some(Self::TaskFailed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub reward: f32,
    pub result: TaskResult,
    /// Present whenever the task mode is not [`TaskMode::Standard`]
    pub suggested_action: Option<u32>,
}

/// RGB image, 3 bytes per pixel, rows top to bottom.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Image {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl Image {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Self {
        Self {
            width,
            height,
            pixels,
        }
    }

    pub fn expected_len(width: u32, height: u32) -> usize {
        width as usize * height as usize * 3
    }

    pub fn dimensions(&self) -> Dimensions {
        Dimensions {
            width: self.width,
            height: self.height,
        }
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = (y as usize * self.width as usize + x as usize) * 3;
        let rgb = self.pixels.get(offset..offset + 3)?;
        Some([rgb[0], rgb[1], rgb[2]])
    }
}

/// Model handed to a predictor before construction (`UseModel`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelData {
    pub model: Option<Vec<u8>>,
    pub internal_data: Option<Vec<u8>>,
}

impl ModelData {
    pub fn is_empty(&self) -> bool {
        self.model.is_none()
    }
}

/// What a predictor produces when asked to save its model.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SavedModel {
    pub model: Vec<u8>,
    pub internal_data: Option<Vec<u8>>,
}

/// How a classification compares with the annotations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum ClassificationError {
    None = 0,
    /// An object was reported where there is none
    FalseAlarm = 1,
    /// An object was missed
    FalseRejection = 2,
    WrongClassification = 3,
}

impl ClassificationError {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::FalseAlarm),
            2 => Some(Self::FalseRejection),
            3 => Some(Self::WrongClassification),
            _ => None,
        }
    }
}

/// A classifier answered for one position of an image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationDone {
    pub image: u32,
    pub original_image: u32,
    pub position: Coordinates,
    pub results: Vec<LabelScore>,
    pub error: ClassificationError,
}

/// Features a classifier obtained from its input set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierFeatures {
    pub detection: bool,
    pub training: bool,
    pub image: u32,
    pub original_image: u32,
    pub position: Coordinates,
    pub roi_extent: u32,
    pub heuristic: u32,
    pub indexes: Vec<u32>,
    pub values: Vec<f32>,
}

/// Features a goal-planner obtained from its perception.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannerFeatures {
    pub sequence: u32,
    pub view: u32,
    pub frame: u32,
    pub position: Coordinates,
    pub roi_extent: u32,
    pub heuristic: u32,
    pub indexes: Vec<u32>,
    pub values: Vec<f32>,
}

/// Time spent in one family of heuristic calls.
///
/// `events` counts calls; `subevents` counts the units they worked on
/// (pixels, features), when that applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatisticsEntry {
    pub total: Duration,
    pub events: u32,
    pub subevents: u32,
}

impl StatisticsEntry {
    pub fn mean_per_event(&self) -> Duration {
        if self.events == 0 {
            return Duration::ZERO;
        }
        self.total / self.events
    }

    pub fn mean_per_subevent(&self) -> Duration {
        if self.subevents == 0 {
            return Duration::ZERO;
        }
        self.total / self.subevents
    }
}

/// Processor time a heuristic used, per call family, plus its memory peak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HeuristicStatistics {
    pub initialization: StatisticsEntry,
    pub sequences: StatisticsEntry,
    pub images: StatisticsEntry,
    pub positions: StatisticsEntry,
    pub features: StatisticsEntry,
    pub max_memory: u64,
}

impl HeuristicStatistics {
    pub fn total(&self) -> Duration {
        self.entries().iter().map(|entry| entry.total).sum()
    }

    pub fn entries(&self) -> [StatisticsEntry; 5] {
        [
            self.initialization,
            self.sequences,
            self.images,
            self.positions,
            self.features,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixels_are_addressed_row_major() {
        let mut pixels = vec![0u8; Image::expected_len(2, 2)];
        pixels[9..12].copy_from_slice(&[1, 2, 3]);
        let image = Image::new(2, 2, pixels);
        assert_eq!(image.pixel(1, 1), Some([1, 2, 3]));
        assert_eq!(image.pixel(2, 0), None);
    }

    #[test]
    fn only_standard_mode_lacks_suggestions() {
        assert!(!TaskMode::Standard.has_suggestions());
        assert!(TaskMode::from_u32(1).unwrap().has_suggestions());
        assert_eq!(TaskMode::from_u32(3), None);
        assert_eq!(TaskResult::from_u32(1), Some(TaskResult::GoalReached));
    }

    #[test]
    fn statistics_means_ignore_empty_entries() {
        let entry = StatisticsEntry {
            total: Duration::from_millis(30),
            events: 3,
            subevents: 0,
        };
        assert_eq!(entry.mean_per_event(), Duration::from_millis(10));
        assert_eq!(entry.mean_per_subevent(), Duration::ZERO);

        let statistics = HeuristicStatistics {
            images: entry,
            features: entry,
            ..HeuristicStatistics::default()
        };
        assert_eq!(statistics.total(), Duration::from_millis(60));
    }
}
