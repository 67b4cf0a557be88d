//! Instruments observing an experiment from their own sandboxed process.

mod common;

use common::{Corridor, Shapes};
use plugbox::config::types::{ErrorCode, LifecyclePhase, PluginKind, SandboxError};
use plugbox::core::{ControllerState, SpawnMode};
use plugbox::plugin::{
    ClassificationDone, ClassificationError, Coordinates, FeatureRef, LabelScore, Parameter,
    PlannerFeatures, TaskResult,
};
use plugbox::proxy::SandboxedInstruments;

fn instruments(dir: &std::path::Path, names: &[&str]) -> SandboxedInstruments {
    let mut instruments = SandboxedInstruments::new(common::config(dir));
    instruments
        .create_sandbox(SpawnMode::InProcess(common::registry()))
        .unwrap();
    for (expected, name) in names.iter().enumerate() {
        assert_eq!(instruments.load_instrument(name).unwrap(), expected as u32);
    }
    instruments.create_instruments().unwrap();
    instruments
}

#[test]
fn events_reach_every_instrument_with_their_data_objects() {
    let _guard = common::serial();
    let dir = tempfile::tempdir().unwrap();
    let mut instruments = instruments(dir.path(), &["tally", "tally"]);

    let mut input_set = Shapes::default();
    instruments.on_classifier_training_started(&mut input_set).unwrap();
    assert_eq!(input_set.feature_requests, 2);

    let mut task = Corridor::default();
    instruments.on_planner_learning_started(&mut task).unwrap();
    assert_eq!(task.resets, 2);

    instruments
        .on_classification_done(
            &mut input_set,
            &ClassificationDone {
                image: 1,
                original_image: 1,
                position: Coordinates::new(3, 4),
                results: vec![LabelScore { label: 1, score: 0.75 }],
                error: ClassificationError::WrongClassification,
            },
        )
        .unwrap();
    instruments
        .on_features_computed_by_planner(&PlannerFeatures {
            sequence: 0,
            view: 0,
            frame: 2,
            position: Coordinates::new(1, 1),
            roi_extent: 3,
            heuristic: 0,
            indexes: vec![0, 1],
            values: vec![0.5, 1.5],
        })
        .unwrap();
    instruments.on_planner_action_chosen(&mut task, 1, 0.0, TaskResult::None).unwrap();
    instruments
        .on_feature_list_reported(&[FeatureRef { heuristic: 0, feature: 1 }])
        .unwrap();

    assert_eq!(instruments.controller().state(), ControllerState::Ready);
    instruments.close().unwrap();
}

#[test]
fn refused_setup_leaves_the_session_usable() {
    let _guard = common::serial();
    let dir = tempfile::tempdir().unwrap();
    let mut instruments = instruments(dir.path(), &["tally"]);

    let err = instruments
        .setup(0, &[Parameter::new("fail", Vec::<String>::new())])
        .unwrap_err();
    assert!(err.is_recoverable());
    assert_eq!(err.code(), ErrorCode::SetupFailed);

    instruments.setup(0, &[Parameter::new("bins", ["8"])]).unwrap();
    instruments.on_experiment_done().unwrap();
}

#[test]
fn crashing_instrument_is_named_in_the_context() {
    let _guard = common::serial();
    let dir = tempfile::tempdir().unwrap();
    let mut instruments = instruments(dir.path(), &["tally", "fragile"]);

    let err = instruments.on_experiment_done().unwrap_err();
    match &err {
        SandboxError::Crashed {
            kind, phase, context, ..
        } => {
            assert_eq!(*kind, PluginKind::Instruments);
            assert_eq!(*phase, LifecyclePhase::Command);
            assert!(context.starts_with("Method: onExperimentDone"));
            assert!(context.contains("Current instrument: #1 (fragile)"), "context: {context}");
        }
        other => panic!("expected a crash, got {other:?}"),
    }
    assert_eq!(err.code(), ErrorCode::InstrumentCrashed);
    assert_eq!(instruments.controller().culprit(), Some(1));
    assert_eq!(instruments.controller().state(), ControllerState::Crashed);
}
