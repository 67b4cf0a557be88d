//! Sessions whose sandboxed process re-executes the `plugbox` binary.

mod common;

use plugbox::config::types::{ErrorCode, PluginKind};
use plugbox::core::{ControllerState, SandboxController, SpawnMode};
use plugbox::kernel::process::ChildExit;
use std::path::PathBuf;

fn exec_mode() -> SpawnMode {
    SpawnMode::Exec {
        program: PathBuf::from(env!("CARGO_BIN_EXE_plugbox")),
    }
}

#[test]
fn executed_sandbox_answers_and_exits_cleanly() {
    let _guard = common::serial();
    let dir = tempfile::tempdir().unwrap();
    let mut controller = SandboxController::new(PluginKind::Heuristics, common::config(dir.path()));

    controller.create_sandbox(exec_mode()).unwrap();
    assert_eq!(controller.state(), ControllerState::ChannelReady);
    controller.ping().unwrap();

    let err = controller.load_plugin("absent").unwrap_err();
    assert!(err.is_recoverable());
    assert_eq!(err.code(), ErrorCode::PluginsFolderNotSet);
    controller.ping().unwrap();

    controller.close_sandbox().unwrap();
    assert_eq!(controller.state(), ControllerState::Closed);
    assert_eq!(controller.exit_status(), Some(ChildExit::Exited(0)));
}

#[test]
fn executed_sandbox_refuses_a_missing_library() {
    let _guard = common::serial();
    let dir = tempfile::tempdir().unwrap();
    let plugins = dir.path().join("plugins");
    std::fs::create_dir_all(&plugins).unwrap();
    let mut controller = SandboxController::new(PluginKind::Classifier, common::config(dir.path()));

    controller.create_sandbox(exec_mode()).unwrap();
    controller.set_plugins_folder(&plugins).unwrap();
    let err = controller.load_plugin("nowhere").unwrap_err();
    assert!(err.is_recoverable(), "got {err:?}");
    assert_eq!(err.code(), ErrorCode::PluginNotFound);
    assert_eq!(controller.state(), ControllerState::ChannelReady);

    controller.close_sandbox().unwrap();
    assert_eq!(controller.exit_status(), Some(ChildExit::Exited(0)));
}
