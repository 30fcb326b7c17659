/// Tests for the sandbox controller lifecycle against an in-memory runtime
mod common;

use common::{shared, spec_in, FakeRuntime};
use fuzzforge::sandbox::{SandboxController, ENV_TARGET, ENV_TIMEOUT, SANDBOX_OUTPUT_PATH};
use fuzzforge::ForgeError;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::tempdir;

const BUILD_OK: &str = "Starting >>> rosidl_runtime_c\nFinished <<< rosidl_runtime_c [4.2s]\n";

#[test]
fn test_missing_host_path_fails_before_any_runtime_call() {
    let dir = tempdir().unwrap();
    let runtime = shared(FakeRuntime::new());
    let controller = SandboxController::new(runtime.clone());
    let mut spec = spec_in(dir.path(), "int x;");
    spec.build_descriptor = PathBuf::from("/nonexistent/CMakeLists.txt");

    let err = controller.stage_and_run(&spec).unwrap_err();

    assert!(matches!(err, ForgeError::Precondition { .. }));
    assert!(runtime.calls().is_empty());
}

#[test]
fn test_missing_build_script_is_precondition() {
    let dir = tempdir().unwrap();
    let runtime = shared(FakeRuntime::new());
    let controller = SandboxController::new(runtime.clone());
    let mut spec = spec_in(dir.path(), "int x;");
    spec.build_script = Some(dir.path().join("fuzzing.sh"));

    let err = controller.stage_and_run(&spec).unwrap_err();
    assert!(matches!(err, ForgeError::Precondition { ref label, .. } if label == "build script"));
    assert!(runtime.calls().is_empty());
}

#[test]
fn test_unknown_image_never_creates_or_removes() {
    let dir = tempdir().unwrap();
    let runtime = shared(FakeRuntime {
        missing_image: true,
        ..FakeRuntime::new()
    });
    let controller = SandboxController::new(runtime.clone());

    let err = controller.stage_and_run(&spec_in(dir.path(), "int x;")).unwrap_err();

    assert!(matches!(err, ForgeError::ImageNotFound { .. }));
    assert_eq!(runtime.calls(), vec!["inspect rosidl_runtime_c_base_image:latest"]);
    assert_eq!(runtime.count("remove"), 0);
}

#[test]
fn test_start_failure_is_fatal_and_removes_created_container() {
    let dir = tempdir().unwrap();
    let runtime = shared(FakeRuntime {
        start_fails: true,
        ..FakeRuntime::new()
    });
    let controller = SandboxController::new(runtime.clone());

    let err = controller.stage_and_run(&spec_in(dir.path(), "int x;")).unwrap_err();

    assert!(matches!(err, ForgeError::ContainerStart { .. }));
    assert!(err.is_fatal());
    assert_eq!(runtime.count("exec"), 0);
    assert_eq!(runtime.count("copy_in"), 0);
    assert_eq!(runtime.count("remove"), 1);
    assert!(runtime.state.lock().unwrap().live.is_empty());
}

#[test]
fn test_start_failure_with_explicit_name_still_removes() {
    let dir = tempdir().unwrap();
    let runtime = shared(FakeRuntime {
        start_fails: true,
        ..FakeRuntime::new()
    });
    let controller = SandboxController::new(runtime.clone());
    let mut spec = spec_in(dir.path(), "int x;");
    spec.container_name = Some("rosidl_runtime_c_fuzz_cafe0001".to_string());

    controller.stage_and_run(&spec).unwrap_err();

    assert_eq!(
        runtime.calls().last().unwrap(),
        "remove rosidl_runtime_c_fuzz_cafe0001"
    );
    assert!(runtime.state.lock().unwrap().live.is_empty());
}

#[test]
fn test_name_conflict_leaves_foreign_container_alone() {
    let dir = tempdir().unwrap();
    let runtime = shared(FakeRuntime {
        start_conflict: true,
        ..FakeRuntime::new()
    });
    let controller = SandboxController::new(runtime.clone());
    let mut spec = spec_in(dir.path(), "int x;");
    spec.container_name = Some("someone_elses_container".to_string());

    let err = controller.stage_and_run(&spec).unwrap_err();

    assert!(err.is_name_conflict());
    assert_eq!(runtime.count("remove"), 0);
}

#[test]
fn test_host_deadline_kills_exec_and_tears_down_once() {
    let dir = tempdir().unwrap();
    let runtime = shared(FakeRuntime {
        stall: true,
        ..FakeRuntime::new().with_default_output("Starting >>> rosidl_runtime_c\n")
    });
    let controller = SandboxController::new(runtime.clone());
    let mut spec = spec_in(dir.path(), "int x;");
    spec.timeout = Duration::from_millis(100);
    spec.host_grace = Duration::from_millis(200);

    let record = controller.stage_and_run(&spec).unwrap();

    assert!(record.timed_out);
    assert_eq!(record.status, None);
    assert!(!record.succeeded());
    assert_eq!(record.output, "Starting >>> rosidl_runtime_c\n");
    assert_eq!(runtime.count("remove"), 1);
    assert_eq!(runtime.calls().last().unwrap(), &format!("remove {}", record.container_name));
    assert_eq!(
        std::fs::read_to_string(&spec.output).unwrap(),
        "Starting >>> rosidl_runtime_c\n"
    );
}

#[test]
fn test_successful_run_stages_executes_and_tears_down_once() {
    let dir = tempdir().unwrap();
    let runtime = shared(FakeRuntime::new().with_default_output(BUILD_OK));
    let controller = SandboxController::new(runtime.clone());
    let spec = spec_in(dir.path(), "int LLVMFuzzerTestOneInput;");

    let record = controller.stage_and_run(&spec).unwrap();

    assert_eq!(record.status, Some(0));
    assert_eq!(record.output, BUILD_OK);
    assert!(record.output_copied);
    assert!(record.container_name.starts_with("fuzz_"));

    let calls = runtime.calls();
    assert_eq!(runtime.count("remove"), 1);
    assert_eq!(calls.last().unwrap(), &format!("remove {}", record.container_name));
    assert!(calls.contains(&format!(
        "copy_in {} /ws/src/ros2/rosidl/rosidl_runtime_c/fuzz/fuzzer.c",
        record.container_name
    )));
    assert!(calls.contains(&format!(
        "copy_in {} /ws/src/ros2/rosidl/rosidl_runtime_c/CMakeLists.txt",
        record.container_name
    )));

    let state = runtime.state.lock().unwrap();
    assert_eq!(state.files.get(SANDBOX_OUTPUT_PATH).unwrap(), BUILD_OK);
    assert_eq!(state.exec_lines[0], "{ cd '/ws' && ./fuzzing.sh; } 2>&1");
    assert!(state.exec_env[0].contains(&(ENV_TIMEOUT.to_string(), "10".to_string())));
    assert!(state.exec_env[0].contains(&(ENV_TARGET.to_string(), "fuzzer".to_string())));
    drop(state);

    assert_eq!(std::fs::read_to_string(&spec.output).unwrap(), BUILD_OK);
}

#[test]
fn test_explicit_container_name_is_used() {
    let dir = tempdir().unwrap();
    let runtime = shared(FakeRuntime::new());
    let controller = SandboxController::new(runtime.clone());
    let mut spec = spec_in(dir.path(), "int x;");
    spec.container_name = Some("rosidl_runtime_c_fuzz_cafe0001".to_string());

    let record = controller.stage_and_run(&spec).unwrap();

    assert_eq!(record.container_name, "rosidl_runtime_c_fuzz_cafe0001");
    assert!(runtime
        .calls()
        .contains(&"remove rosidl_runtime_c_fuzz_cafe0001".to_string()));
}

#[test]
fn test_build_script_staged_into_workdir() {
    let dir = tempdir().unwrap();
    let runtime = shared(FakeRuntime::new());
    let controller = SandboxController::new(runtime.clone());
    let mut spec = spec_in(dir.path(), "int x;");
    let script = dir.path().join("fuzzing.sh");
    std::fs::write(&script, "#!/bin/bash\ncolcon build\n").unwrap();
    spec.build_script = Some(script);

    let record = controller.stage_and_run(&spec).unwrap();

    assert!(runtime
        .calls()
        .contains(&format!("copy_in {} /ws/fuzzing.sh", record.container_name)));
}

#[test]
fn test_staging_failures_are_tolerated() {
    let dir = tempdir().unwrap();
    let runtime = shared(FakeRuntime {
        copy_in_fails: true,
        ..FakeRuntime::new().with_default_output("ERROR: fuzzer.c not found\n")
    });
    let controller = SandboxController::new(runtime.clone());

    let record = controller.stage_and_run(&spec_in(dir.path(), "int x;")).unwrap();

    assert_eq!(runtime.count("exec"), 1);
    assert_eq!(runtime.count("remove"), 1);
    assert!(record.output.contains("ERROR:"));
}

#[test]
fn test_exec_failure_still_tears_down_and_writes_output() {
    let dir = tempdir().unwrap();
    let runtime = shared(FakeRuntime {
        exec_fails: true,
        ..FakeRuntime::new()
    });
    let controller = SandboxController::new(runtime.clone());
    let spec = spec_in(dir.path(), "int x;");

    let record = controller.stage_and_run(&spec).unwrap();

    assert_eq!(record.status, None);
    assert_eq!(runtime.count("remove"), 1);
    assert!(spec.output.exists());
}

#[test]
fn test_copy_back_failure_keeps_captured_output() {
    let dir = tempdir().unwrap();
    let runtime = shared(FakeRuntime {
        copy_out_fails: true,
        ..FakeRuntime::new().with_default_output(BUILD_OK)
    });
    let controller = SandboxController::new(runtime.clone());
    let mut spec = spec_in(dir.path(), "int x;");
    spec.coverage_text.host = Some(dir.path().join("shared/coverage.txt"));

    let record = controller.stage_and_run(&spec).unwrap();

    assert!(!record.output_copied);
    assert_eq!(record.coverage_text, None);
    assert_eq!(runtime.count("remove"), 1);
    assert_eq!(std::fs::read_to_string(&spec.output).unwrap(), BUILD_OK);
}

#[test]
fn test_failed_sandbox_sink_is_recorded_not_raised() {
    let dir = tempdir().unwrap();
    let runtime = shared(FakeRuntime {
        sink_fails: true,
        ..FakeRuntime::new().with_default_output(BUILD_OK)
    });
    let controller = SandboxController::new(runtime.clone());

    let record = controller.stage_and_run(&spec_in(dir.path(), "int x;")).unwrap();

    assert_eq!(record.output, BUILD_OK);
    assert!(record
        .sink_failures
        .iter()
        .any(|(name, _)| name == "sandbox-file"));
    assert_eq!(runtime.count("remove"), 1);
}

#[test]
fn test_coverage_artifacts_copied_when_present() {
    let dir = tempdir().unwrap();
    let runtime = shared(FakeRuntime {
        produced: vec![
            ("/ws/fuzz_corpus/coverage.json".to_string(), "{\"lines\": 42}".to_string()),
            ("/ws/fuzz_corpus/coverage.txt".to_string(), "TOTAL 42%".to_string()),
        ],
        ..FakeRuntime::new().with_default_output(BUILD_OK)
    });
    let controller = SandboxController::new(runtime.clone());
    let mut spec = spec_in(dir.path(), "int x;");
    let json = dir.path().join("shared/cov.json");
    spec.coverage_json.host = Some(json.clone());

    let record = controller.stage_and_run(&spec).unwrap();

    assert_eq!(record.coverage_json.as_deref(), Some(json.as_path()));
    assert_eq!(std::fs::read_to_string(json).unwrap(), "{\"lines\": 42}");
    // No host destination requested for text coverage.
    assert_eq!(record.coverage_text, None);
}

#[test]
fn test_compile_probe_treats_missing_coverage_as_failure() {
    let dir = tempdir().unwrap();
    let mut spec = spec_in(dir.path(), "int x;");
    spec.coverage_text.host = Some(dir.path().join("shared/coverage.txt"));

    let without = SandboxController::new(shared(FakeRuntime::new().with_default_output(BUILD_OK)));
    assert!(!without.compile_probe(&spec).unwrap().compiled);

    let with = SandboxController::new(shared(FakeRuntime {
        produced: vec![("/ws/fuzz_corpus/coverage.txt".to_string(), "TOTAL 12%".to_string())],
        ..FakeRuntime::new().with_default_output(BUILD_OK)
    }));
    assert!(with.compile_probe(&spec).unwrap().compiled);
}
