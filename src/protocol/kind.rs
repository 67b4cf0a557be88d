use std::fmt;

macro_rules! message_kinds {
    ($($variant:ident = $value:literal => $label:literal,)+) => {
        /// Wire message kind. Values are fixed; the set is closed.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u32)]
        pub enum MessageKind {
            $($variant = $value,)+
        }

        impl MessageKind {
            /// Every kind, in wire-value order.
            pub const ALL: &'static [MessageKind] = &[$(MessageKind::$variant,)+];

            #[must_use]
            pub const fn as_u32(self) -> u32 {
                self as u32
            }

            /// Parse a wire discriminant; `None` for unknown kinds.
            #[must_use]
            pub const fn from_u32(value: u32) -> Option<Self> {
                match value {
                    $($value => Some(Self::$variant),)+
                    _ => None,
                }
            }

            #[must_use]
            pub const fn label(self) -> &'static str {
                match self {
                    $(Self::$variant => $label,)+
                }
            }
        }
    };
}

message_kinds! {
    CreationSuccessful = 0 => "CREATION_SUCCESSFUL",
    CreationFailed = 1 => "CREATION_FAILED",
    Ping = 2 => "PING",
    Pong = 3 => "PONG",
    KeepAlive = 4 => "KEEP_ALIVE",
    Response = 5 => "RESPONSE",
    UnknownCommand = 6 => "UNKNOWN_COMMAND",
    Error = 7 => "ERROR",

    Terminate = 8 => "TERMINATE",
    SetPluginsFolder = 9 => "SET_PLUGINS_FOLDER",
    LoadPlugin = 10 => "LOAD_PLUGIN",
    UseModel = 11 => "USE_MODEL",
    CreatePlugins = 12 => "CREATE_PLUGINS",

    HeuristicSetSeed = 13 => "HEURISTIC_SET_SEED",
    HeuristicInit = 14 => "HEURISTIC_INIT",
    HeuristicDim = 15 => "HEURISTIC_DIM",
    HeuristicPrepareForImage = 16 => "HEURISTIC_PREPARE_FOR_IMAGE",
    HeuristicComputeSomeFeatures = 17 => "HEURISTIC_COMPUTE_SOME_FEATURES",
    HeuristicFinishForImage = 18 => "HEURISTIC_FINISH_FOR_IMAGE",

    LoadModel = 19 => "LOAD_MODEL",
    SaveModel = 20 => "SAVE_MODEL",

    ClassifierSetSeed = 21 => "CLASSIFIER_SET_SEED",
    ClassifierSetup = 22 => "CLASSIFIER_SETUP",
    ClassifierTrain = 23 => "CLASSIFIER_TRAIN",
    ClassifierClassify = 24 => "CLASSIFIER_CLASSIFY",
    ClassifierReportFeaturesUsed = 25 => "CLASSIFIER_REPORT_FEATURES_USED",

    InputSetNbHeuristics = 26 => "INPUT_SET_NB_HEURISTICS",
    InputSetNbFeatures = 27 => "INPUT_SET_NB_FEATURES",
    InputSetHeuristicName = 28 => "INPUT_SET_HEURISTIC_NAME",
    InputSetHeuristicSeed = 29 => "INPUT_SET_HEURISTIC_SEED",
    InputSetNbImages = 30 => "INPUT_SET_NB_IMAGES",
    InputSetNbLabels = 31 => "INPUT_SET_NB_LABELS",
    InputSetComputeSomeFeatures = 32 => "INPUT_SET_COMPUTE_SOME_FEATURES",
    InputSetObjectsInImage = 33 => "INPUT_SET_OBJECTS_IN_IMAGE",
    InputSetNegativesInImage = 34 => "INPUT_SET_NEGATIVES_IN_IMAGE",
    InputSetImageSize = 35 => "INPUT_SET_IMAGE_SIZE",
    InputSetImageInTestSet = 36 => "INPUT_SET_IMAGE_IN_TEST_SET",
    InputSetRoiExtent = 37 => "INPUT_SET_ROI_EXTENT",

    PlannerSetSeed = 38 => "PLANNER_SET_SEED",
    PlannerSetup = 39 => "PLANNER_SETUP",
    PlannerLearn = 40 => "PLANNER_LEARN",
    PlannerChooseAction = 41 => "PLANNER_CHOOSE_ACTION",
    PlannerReportFeaturesUsed = 42 => "PLANNER_REPORT_FEATURES_USED",

    TaskMode = 43 => "TASK_MODE",
    TaskNbActions = 44 => "TASK_NB_ACTIONS",
    TaskNbTrajectories = 45 => "TASK_NB_TRAJECTORIES",
    TaskTrajectoryLength = 46 => "TASK_TRAJECTORY_LENGTH",
    TaskReset = 47 => "TASK_RESET",
    TaskPerformAction = 48 => "TASK_PERFORM_ACTION",
    TaskSuggestedAction = 49 => "TASK_SUGGESTED_ACTION",

    PerceptionNbHeuristics = 50 => "PERCEPTION_NB_HEURISTICS",
    PerceptionNbFeatures = 51 => "PERCEPTION_NB_FEATURES",
    PerceptionHeuristicName = 52 => "PERCEPTION_HEURISTIC_NAME",
    PerceptionHeuristicSeed = 53 => "PERCEPTION_HEURISTIC_SEED",
    PerceptionNbViews = 54 => "PERCEPTION_NB_VIEWS",
    PerceptionComputeSomeFeatures = 55 => "PERCEPTION_COMPUTE_SOME_FEATURES",
    PerceptionViewSize = 56 => "PERCEPTION_VIEW_SIZE",
    PerceptionViewPixels = 57 => "PERCEPTION_VIEW_PIXELS",
    PerceptionRoiExtent = 58 => "PERCEPTION_ROI_EXTENT",

    MemoryLimitReached = 59 => "MEMORY_LIMIT_REACHED",
    ForbiddenSystemCall = 60 => "FORBIDDEN_SYSTEM_CALL",

    CurrentHeuristic = 61 => "CURRENT_HEURISTIC",
    CurrentInstrument = 62 => "CURRENT_INSTRUMENT",
    TrainingStepDone = 63 => "TRAINING_STEP_DONE",

    HeuristicPrepareForSequence = 64 => "HEURISTIC_PREPARE_FOR_SEQUENCE",
    HeuristicFinishForSequence = 65 => "HEURISTIC_FINISH_FOR_SEQUENCE",
    HeuristicPrepareForCoordinates = 66 => "HEURISTIC_PREPARE_FOR_COORDINATES",
    HeuristicFinishForCoordinates = 67 => "HEURISTIC_FINISH_FOR_COORDINATES",
    HeuristicReportStatistics = 68 => "HEURISTIC_REPORT_STATISTICS",

    InstrumentSetup = 69 => "INSTRUMENT_SETUP",
    EventExperimentDone = 70 => "EVENT_EXPERIMENT_DONE",
    EventClassificationExperimentStarted = 71 => "EVENT_CLASSIFICATION_EXPERIMENT_STARTED",
    EventClassifierTrainingStarted = 72 => "EVENT_CLASSIFIER_TRAINING_STARTED",
    EventClassifierTrainingDone = 73 => "EVENT_CLASSIFIER_TRAINING_DONE",
    EventClassifierTestStarted = 74 => "EVENT_CLASSIFIER_TEST_STARTED",
    EventClassifierTestDone = 75 => "EVENT_CLASSIFIER_TEST_DONE",
    EventClassificationDone = 76 => "EVENT_CLASSIFICATION_DONE",
    EventFeaturesComputedByClassifier = 77 => "EVENT_FEATURES_COMPUTED_BY_CLASSIFIER",
    EventGoalPlanningExperimentStarted = 78 => "EVENT_GOALPLANNING_EXPERIMENT_STARTED",
    EventPlannerLearningStarted = 79 => "EVENT_PLANNER_LEARNING_STARTED",
    EventPlannerLearningDone = 80 => "EVENT_PLANNER_LEARNING_DONE",
    EventPlannerTestStarted = 81 => "EVENT_PLANNER_TEST_STARTED",
    EventPlannerTestDone = 82 => "EVENT_PLANNER_TEST_DONE",
    EventPlannerActionChosen = 83 => "EVENT_PLANNER_ACTION_CHOSEN",
    EventFeaturesComputedByPlanner = 84 => "EVENT_FEATURES_COMPUTED_BY_PLANNER",
    EventFeatureListReported = 85 => "EVENT_FEATURE_LIST_REPORTED",
}

/// Broad grouping of kinds, used to route packets on both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindFamily {
    Control,
    Bootstrap,
    Command,
    InputSetCall,
    TaskCall,
    PerceptionCall,
    WardenEvent,
    /// Informational, sent by the sandboxed side while a command runs
    Notice,
}

impl MessageKind {
    #[must_use]
    pub const fn family(self) -> KindFamily {
        match self.as_u32() {
            0..=7 => KindFamily::Control,
            8..=12 => KindFamily::Bootstrap,
            26..=37 => KindFamily::InputSetCall,
            43..=49 => KindFamily::TaskCall,
            50..=58 => KindFamily::PerceptionCall,
            59..=60 => KindFamily::WardenEvent,
            61..=63 => KindFamily::Notice,
            _ => KindFamily::Command,
        }
    }

    /// Whether the sandboxed side issues this kind mid-command.
    #[must_use]
    pub const fn is_reverse_call(self) -> bool {
        matches!(
            self.family(),
            KindFamily::InputSetCall | KindFamily::TaskCall | KindFamily::PerceptionCall
        )
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_values_are_dense_and_stable() {
        for (index, kind) in MessageKind::ALL.iter().enumerate() {
            assert_eq!(kind.as_u32(), index as u32);
            assert_eq!(MessageKind::from_u32(index as u32), Some(*kind));
        }
        assert_eq!(MessageKind::from_u32(MessageKind::ALL.len() as u32), None);
    }

    #[test]
    fn reverse_calls_are_classified() {
        assert!(MessageKind::InputSetComputeSomeFeatures.is_reverse_call());
        assert!(MessageKind::TaskPerformAction.is_reverse_call());
        assert!(MessageKind::PerceptionViewPixels.is_reverse_call());
        assert!(!MessageKind::PlannerLearn.is_reverse_call());
        assert!(!MessageKind::Response.is_reverse_call());
        assert_eq!(MessageKind::ForbiddenSystemCall.family(), KindFamily::WardenEvent);
        assert_eq!(MessageKind::LoadModel.family(), KindFamily::Command);
        assert_eq!(MessageKind::TrainingStepDone.family(), KindFamily::Notice);
        assert!(!MessageKind::CurrentHeuristic.is_reverse_call());
        assert_eq!(MessageKind::EventPlannerTestDone.family(), KindFamily::Command);
    }

    #[test]
    fn labels_render_in_screaming_case() {
        assert_eq!(MessageKind::HeuristicDim.to_string(), "HEURISTIC_DIM");
        assert_eq!(MessageKind::CreatePlugins.to_string(), "CREATE_PLUGINS");
    }
}
