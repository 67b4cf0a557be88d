//! Forward commands whose plugins call back into the trusted process.

mod common;

use common::{Corridor, Grid, Shapes};
use plugbox::config::types::ErrorCode;
use plugbox::core::{ControllerState, SpawnMode};
use plugbox::plugin::{Coordinates, FeatureRef, Image, Parameter};
use plugbox::proxy::{SandboxedClassifier, SandboxedHeuristics, SandboxedPlanner};
use std::cell::RefCell;
use std::rc::Rc;

fn planner(dir: &std::path::Path) -> SandboxedPlanner {
    let mut planner = SandboxedPlanner::new(common::config(dir));
    planner
        .create_sandbox(SpawnMode::InProcess(common::registry()))
        .unwrap();
    planner.load_planner("explorer", None).unwrap();
    planner
}

#[test]
fn learn_answers_every_reverse_call_before_responding() {
    let _guard = common::serial();
    let dir = tempfile::tempdir().unwrap();
    let mut planner = planner(dir.path());
    let mut task = Corridor::default();

    planner.learn(&mut task).unwrap();
    assert_eq!(task.grid.feature_requests, 3);
    assert!(task.grid.heuristic_requests >= 1);
    assert_eq!(planner.controller().state(), ControllerState::Ready);
    assert!(planner.controller().context().starts_with("Method: learn"));
    assert!(planner.controller().context().contains("Number of actions: 2"));
}

#[test]
fn failing_reverse_call_is_recoverable() {
    let _guard = common::serial();
    let dir = tempfile::tempdir().unwrap();
    let mut planner = planner(dir.path());
    let mut task = Corridor {
        grid: Grid {
            failure: Some(ErrorCode::FeatureNotANumber),
            ..Grid::default()
        },
        ..Corridor::default()
    };

    let err = planner.learn(&mut task).unwrap_err();
    assert!(err.is_recoverable());
    assert_eq!(err.code(), ErrorCode::FeatureNotANumber);
    assert_eq!(task.grid.feature_requests, 1);
    assert_eq!(planner.controller().state(), ControllerState::Ready);

    planner.controller_mut().ping().unwrap();
    task.grid.failure = None;
    planner.learn(&mut task).unwrap();
}

#[test]
fn planner_chooses_actions_from_its_perception() {
    let _guard = common::serial();
    let dir = tempfile::tempdir().unwrap();
    let mut planner = planner(dir.path());
    let mut grid = Grid::default();

    assert_eq!(planner.choose_action(&mut grid, true).unwrap(), 0);
    assert_eq!(planner.choose_action(&mut grid, false).unwrap(), 2);
    assert_eq!(
        planner.report_features_used(&mut grid).unwrap(),
        vec![FeatureRef { heuristic: 0, feature: 1 }]
    );

    planner.save_model().unwrap();
    let saved = std::fs::read(dir.path().join("out").join("predictor.model")).unwrap();
    assert_eq!(saved, b"explorer");
}

#[test]
fn classifier_trains_and_classifies_through_its_input_set() {
    let _guard = common::serial();
    let dir = tempfile::tempdir().unwrap();
    let mut classifier = SandboxedClassifier::new(common::config(dir.path()));
    classifier
        .create_sandbox(SpawnMode::InProcess(common::registry()))
        .unwrap();
    classifier.load_classifier("sum", None, None).unwrap();
    classifier.set_seed(7).unwrap();
    classifier.setup(&[Parameter::new("depth", ["2"])]).unwrap();

    let mut shapes = Shapes::default();
    assert_eq!(classifier.train(&mut shapes).unwrap(), Some(0.25));

    let scores = classifier
        .classify(&mut shapes, 0, Coordinates::new(3, 4))
        .unwrap();
    assert_eq!(scores.len(), 2);
    assert_eq!(scores[0].score, 7.0);
    assert_eq!(scores[1].score, 8.0);
    assert_eq!(shapes.feature_requests, 1);

    let err = classifier.setup(&[Parameter::new("fail", Vec::<String>::new())]).unwrap_err();
    assert_eq!(err.code(), ErrorCode::SetupFailed);
    assert!(classifier.controller().context().contains("fail"));

    classifier.save_model().unwrap();
    let out = dir.path().join("out");
    assert_eq!(std::fs::read(out.join("predictor.model")).unwrap(), b"labels 2\n");
    assert_eq!(std::fs::read(out.join("predictor.data")).unwrap(), vec![7u8]);
}

#[test]
fn classifier_without_model_cannot_load_one() {
    let _guard = common::serial();
    let dir = tempfile::tempdir().unwrap();
    let mut classifier = SandboxedClassifier::new(common::config(dir.path()));
    classifier
        .create_sandbox(SpawnMode::InProcess(common::registry()))
        .unwrap();
    classifier.load_classifier("sum", None, None).unwrap();

    let err = classifier.load_model(&mut Shapes::default()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::ModelLoadingFailed);
    assert_eq!(classifier.controller().state(), ControllerState::Ready);
}

#[test]
fn classifier_model_is_checked_against_the_input_set() {
    let _guard = common::serial();
    let dir = tempfile::tempdir().unwrap();
    let model = dir.path().join("model.txt");
    std::fs::write(&model, b"needs three heuristics").unwrap();

    let mut classifier = SandboxedClassifier::new(common::config(dir.path()));
    classifier
        .create_sandbox(SpawnMode::InProcess(common::registry()))
        .unwrap();
    classifier.load_classifier("sum", Some(model), None).unwrap();

    let err = classifier.load_model(&mut Shapes::default()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::ModelMissingHeuristic);
}

#[test]
fn several_heuristics_share_one_sandbox() {
    let _guard = common::serial();
    let dir = tempfile::tempdir().unwrap();
    let mut heuristics = SandboxedHeuristics::new(common::config(dir.path()));
    heuristics
        .create_sandbox(SpawnMode::InProcess(common::registry()))
        .unwrap();
    let gradient = heuristics.load_heuristic("gradient").unwrap();
    let mean_red = heuristics.load_heuristic("mean_red").unwrap();
    assert_eq!((gradient, mean_red), (0, 1));
    assert_eq!(heuristics.controller().plugin_index("mean_red"), Some(1));
    heuristics.create_heuristics().unwrap();

    heuristics.set_seed(gradient, 3).unwrap();
    heuristics.init(gradient, 1, 8).unwrap();
    assert_eq!(heuristics.dim(gradient).unwrap(), 4);
    let values = heuristics
        .compute_some_features(gradient, Coordinates::new(2, 5), &[3, 0, 1])
        .unwrap();
    assert_eq!(values, vec![10.0, 7.0, 8.0]);

    let mut pixels = vec![0u8; Image::expected_len(2, 2)];
    for rgb in pixels.chunks_mut(3) {
        rgb[0] = 100;
    }
    let image = Image::new(2, 2, pixels);
    heuristics.prepare_for_image(mean_red, 0, &image).unwrap();
    assert_eq!(
        heuristics
            .compute_some_features(mean_red, Coordinates::new(0, 0), &[0])
            .unwrap(),
        vec![100.0]
    );
    heuristics.finish_for_image(mean_red).unwrap();

    let nan = heuristics
        .compute_some_features(mean_red, Coordinates::new(0, 0), &[0])
        .unwrap_err();
    assert_eq!(nan.code(), ErrorCode::FeatureNotANumber);

    let out_of_range = heuristics
        .compute_some_features(gradient, Coordinates::new(0, 0), &[4])
        .unwrap_err();
    assert_eq!(out_of_range.code(), ErrorCode::InvalidArguments);
    assert_eq!(heuristics.controller().state(), ControllerState::Ready);

    let logs = heuristics.controller().log_files(0);
    assert_eq!(logs.len(), 2);
    assert!(logs.iter().any(|log| log.name == "HeuristicsSandbox"));
}

#[test]
fn heuristic_statistics_count_every_call_family() {
    let _guard = common::serial();
    let dir = tempfile::tempdir().unwrap();
    let mut heuristics = SandboxedHeuristics::new(common::config(dir.path()));
    heuristics
        .create_sandbox(SpawnMode::InProcess(common::registry()))
        .unwrap();
    let gradient = heuristics.load_heuristic("gradient").unwrap();
    heuristics.create_heuristics().unwrap();

    heuristics.init(gradient, 1, 2).unwrap();
    heuristics.prepare_for_sequence(gradient).unwrap();
    heuristics
        .prepare_for_coordinates(gradient, Coordinates::new(1, 1))
        .unwrap();
    let values = heuristics
        .compute_some_features(gradient, Coordinates::new(1, 1), &[0, 1, 2])
        .unwrap();
    assert_eq!(values, vec![2.0, 3.0, 4.0]);
    heuristics.finish_for_coordinates(gradient).unwrap();
    heuristics.finish_for_sequence(gradient).unwrap();

    let statistics = heuristics.report_statistics(gradient).unwrap();
    assert_eq!(statistics.initialization.events, 2);
    assert_eq!(statistics.sequences.events, 2);
    assert_eq!(statistics.positions.events, 2);
    assert_eq!(statistics.features.events, 1);
    assert_eq!(statistics.features.subevents, 3);
    assert_eq!(statistics.images.events, 0);
    assert!(heuristics.controller().context().starts_with("Method: reportStatistics"));
}

#[test]
fn training_steps_reach_the_listener() {
    let _guard = common::serial();
    let dir = tempfile::tempdir().unwrap();
    let mut classifier = SandboxedClassifier::new(common::config(dir.path()));
    classifier
        .create_sandbox(SpawnMode::InProcess(common::registry()))
        .unwrap();
    classifier.load_classifier("sum", None, None).unwrap();

    let steps = Rc::new(RefCell::new(Vec::new()));
    let seen = steps.clone();
    classifier.set_training_listener(move |step: u32, nb_steps: u32| {
        seen.borrow_mut().push((step, nb_steps));
    });

    assert_eq!(classifier.train(&mut Shapes::default()).unwrap(), Some(0.25));
    assert_eq!(*steps.borrow(), vec![(1, 2), (2, 2)]);
    assert_eq!(classifier.controller().state(), ControllerState::Ready);
}

#[test]
fn learning_steps_reach_the_listener() {
    let _guard = common::serial();
    let dir = tempfile::tempdir().unwrap();
    let mut planner = planner(dir.path());

    let steps = Rc::new(RefCell::new(Vec::new()));
    let seen = steps.clone();
    planner.set_training_listener(move |step: u32, nb_steps: u32| {
        seen.borrow_mut().push((step, nb_steps));
    });

    planner.learn(&mut Corridor::default()).unwrap();
    assert_eq!(*steps.borrow(), vec![(1, 3), (2, 3), (3, 3)]);
}
