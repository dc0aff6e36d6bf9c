//! End-to-end runs through the isolated worker strategy.
//!
//! Spawns the `fixture-worker` host and checks what the supervisor observes for
//! well-behaved, faulting, hanging and crashing programs.

use std::fs;
use std::path::Path;

use harness::config::HarnessConfig;
use harness::environment::{ExecutionEnvironment, get_results};
use harness::error::{END_OF_INPUT_HINT, Fault, FaultKind, HarnessError};
use harness::mock::MockSpec;
use harness::test_support::{environment, executor, program, worker_config};
use harness::unit::{InvocationBuilder, UnitKind};
use serde_json::json;

fn config(root: &Path) -> HarnessConfig {
    worker_config(Path::new(env!("CARGO_BIN_EXE_fixture-worker")), root)
}

fn run(cfg: &HarnessConfig, env: &mut ExecutionEnvironment, invocation: InvocationBuilder) {
    let mut executor = executor(cfg);
    executor
        .execute(env, &invocation.build().expect("invocation"), false)
        .expect("execute");
}

#[test]
fn stdin_line_is_echoed() {
    let temp = tempfile::tempdir().expect("tempdir");
    let cfg = config(temp.path());
    let mut env = environment(&cfg)
        .stdin_text("this is input")
        .build()
        .expect("env");

    run(&cfg, &mut env, program("echo"));

    let results = get_results(&env).expect("results");
    assert_eq!(results.stdout().expect("stdout"), ["this is input"]);
    assert!(results.exception().is_none());
    assert!(!results.timed_out());
}

#[test]
fn infinite_loop_times_out() {
    let temp = tempfile::tempdir().expect("tempdir");
    let cfg = config(temp.path());
    let mut env = environment(&cfg).timeout(2).build().expect("env");

    run(&cfg, &mut env, program("spin"));

    let results = get_results(&env).expect("results");
    assert!(results.timed_out());
    assert_eq!(results.exception(), Some(&Fault::timeout(2)));
    assert!(results.stdout().is_err());
}

#[test]
fn oversized_report_is_missing_output_data() {
    let temp = tempfile::tempdir().expect("tempdir");
    let cfg = HarnessConfig {
        channel_capacity_bytes: 64 * 1024,
        ..config(temp.path())
    };
    let mut env = environment(&cfg).build().expect("env");

    run(&cfg, &mut env, program("flood"));

    let results = get_results(&env).expect("results");
    assert_eq!(
        results.exception().map(|f| f.kind),
        Some(FaultKind::MissingOutputData)
    );
    assert!(results.stdout().is_err());
}

#[test]
fn spied_entry_point_returns_real_value() {
    let temp = tempfile::tempdir().expect("tempdir");
    let cfg = config(temp.path());
    let mut env = environment(&cfg).build().expect("env");

    run(
        &cfg,
        &mut env,
        program("calc")
            .function("mock_me")
            .parameter(json!(1))
            .parameter(json!(2))
            .parameter(json!(3))
            .mock(MockSpec::spy("mock_me")),
    );

    let results = get_results(&env).expect("results");
    assert_eq!(results.return_value().expect("return value"), &json!(6));
    let recorder = results.mock("mock_me").expect("mock");
    recorder.assert_called_times(1).expect("called once");
    recorder
        .assert_called_with(&[json!(1), json!(2), json!(3)])
        .expect("called with");
}

#[test]
fn mocked_dependency_records_every_call() {
    let temp = tempfile::tempdir().expect("tempdir");
    let cfg = config(temp.path());
    let mut env = environment(&cfg).build().expect("env");

    run(
        &cfg,
        &mut env,
        program("calc")
            .function("run_me")
            .mock(MockSpec::new("mock_me").returning(json!(42))),
    );

    let results = get_results(&env).expect("results");
    assert_eq!(results.return_value().expect("return value"), &json!(42));
    let recorder = results.mock("mock_me").expect("mock");
    recorder.assert_called_times(2).expect("called twice");
    assert_eq!(recorder.calls()[0], recorder.calls()[1]);
}

#[test]
fn reading_past_input_is_annotated_when_raised() {
    let temp = tempfile::tempdir().expect("tempdir");
    let cfg = config(temp.path());
    let mut env = environment(&cfg).stdin_text("only one").build().expect("env");
    let mut executor = executor(&cfg);

    let err = executor
        .execute(
            &mut env,
            &program("reader").build().expect("invocation"),
            true,
        )
        .unwrap_err();

    assert!(matches!(err, HarnessError::UnitFailed { kind: FaultKind::EndOfInput, .. }));
    assert!(err.to_string().contains(END_OF_INPUT_HINT));
    assert!(get_results(&env).is_ok());
}

#[test]
fn process_exit_leaves_no_output_data() {
    let temp = tempfile::tempdir().expect("tempdir");
    let cfg = config(temp.path());
    let mut env = environment(&cfg).build().expect("env");

    run(&cfg, &mut env, program("exiter"));

    let results = get_results(&env).expect("results");
    assert_eq!(
        results.exception().map(|f| f.kind),
        Some(FaultKind::MissingOutputData)
    );
}

#[test]
fn setup_after_failed_run_does_not_raise() {
    let temp = tempfile::tempdir().expect("tempdir");
    let cfg = config(temp.path());
    let mut executor = executor(&cfg);

    let mut env = environment(&cfg).timeout(1).build().expect("env");
    executor
        .execute(&mut env, &program("spin").build().expect("invocation"), false)
        .expect("failed run");
    assert_eq!(executor.retained_runs(UnitKind::Program), 1);

    let mut env = environment(&cfg).stdin_text("again").build().expect("env");
    executor
        .execute(&mut env, &program("echo").build().expect("invocation"), true)
        .expect("second run");
    assert_eq!(executor.retained_runs(UnitKind::Program), 0);
    assert_eq!(
        get_results(&env).expect("results").stdout().expect("stdout"),
        ["again"]
    );
}

#[test]
fn mutated_parameter_is_reported() {
    let temp = tempfile::tempdir().expect("tempdir");
    let cfg = config(temp.path());
    let mut env = environment(&cfg).build().expect("env");

    run(
        &cfg,
        &mut env,
        program("calc").function("push_one").parameter(json!([7])),
    );

    let results = get_results(&env).expect("results");
    assert_eq!(results.parameter(0).expect("parameter"), &json!([7, 1]));
}

#[test]
fn created_files_are_reported_and_staged_inputs_are_not() {
    let temp = tempfile::tempdir().expect("tempdir");
    let data = temp.path().join("data");
    fs::create_dir_all(&data).expect("data dir");
    fs::write(data.join("input.txt"), "shout").expect("write input");
    let cfg = HarnessConfig {
        stdout_marker: Some("OUTPUT ".to_string()),
        ..config(temp.path())
    };
    let mut env = environment(&cfg)
        .data_root(&data)
        .add_file("input.txt", "input.txt")
        .build()
        .expect("env");

    run(&cfg, &mut env, program("writer"));

    let results = get_results(&env).expect("results");
    assert!(results.exception().is_none(), "{:?}", results.exception());
    assert_eq!(results.stdout().expect("stdout"), ["written"]);
    assert_eq!(results.file_out("result.txt").expect("result file"), "SHOUT");
    assert!(results.file_out("input.txt").is_err());
}

#[test]
fn autowired_function_is_passed_in() {
    let temp = tempfile::tempdir().expect("tempdir");
    let cfg = config(temp.path());
    let mut env = environment(&cfg).build().expect("env");

    run(
        &cfg,
        &mut env,
        program("calc").function("apply").autowired("mock_me"),
    );

    assert_eq!(
        get_results(&env)
            .expect("results")
            .return_value()
            .expect("return value"),
        &json!(5)
    );
}

#[test]
fn unknown_autowired_name_fails_to_map() {
    let temp = tempfile::tempdir().expect("tempdir");
    let cfg = config(temp.path());
    let mut env = environment(&cfg).build().expect("env");

    run(
        &cfg,
        &mut env,
        program("calc").function("apply").autowired("not_there"),
    );

    let fault = get_results(&env)
        .expect("results")
        .exception()
        .cloned()
        .expect("fault");
    assert_eq!(fault.kind, FaultKind::Runtime);
    assert!(fault.message.contains("Failed to map 'not_there'"));
}

#[test]
fn missing_entry_point_is_a_missing_function_definition() {
    let temp = tempfile::tempdir().expect("tempdir");
    let cfg = config(temp.path());
    let mut env = environment(&cfg).build().expect("env");
    let mut executor = executor(&cfg);

    let err = executor
        .execute(
            &mut env,
            &program("calc").function("nope").build().expect("invocation"),
            true,
        )
        .unwrap_err();

    assert!(matches!(
        err,
        HarnessError::UnitFailed { kind: FaultKind::MissingFunctionDefinition, .. }
    ));
    assert!(err.to_string().contains("Failed to find function with name: nope"));
}

#[test]
fn raised_and_panicking_units_are_captured() {
    let temp = tempfile::tempdir().expect("tempdir");
    let cfg = config(temp.path());

    let mut env = environment(&cfg).build().expect("env");
    run(&cfg, &mut env, program("raiser"));
    assert_eq!(
        get_results(&env).expect("results").exception(),
        Some(&Fault::raised("raise boi has spoken"))
    );

    let mut env = environment(&cfg).build().expect("env");
    run(&cfg, &mut env, program("panicker"));
    assert_eq!(
        get_results(&env)
            .expect("results")
            .exception()
            .map(|f| (f.kind, f.message.as_str())),
        Some((FaultKind::Panic, "kaboom"))
    );
}

#[test]
fn unstartable_worker_still_yields_results() {
    let temp = tempfile::tempdir().expect("tempdir");
    let cfg = worker_config(Path::new("/nonexistent/worker"), temp.path());
    let mut env = environment(&cfg).build().expect("env");

    run(&cfg, &mut env, program("echo"));

    let fault = get_results(&env)
        .expect("results")
        .exception()
        .cloned()
        .expect("fault");
    assert_eq!(fault.kind, FaultKind::Runtime);
    assert!(fault.message.contains("spawn worker /nonexistent/worker"), "{}", fault.message);
}

#[test]
fn setup_without_cleanup_retains_the_abandoned_run() {
    let temp = tempfile::tempdir().expect("tempdir");
    let cfg = config(temp.path());
    let mut executor = executor(&cfg);
    let invocation = program("echo").build().expect("invocation");

    let mut env = environment(&cfg).stdin_text("first").build().expect("env");
    executor.setup(&mut env, &invocation).expect("first setup");
    executor.run().expect("first run");

    let mut env = environment(&cfg).stdin_text("hi").build().expect("env");
    executor.setup(&mut env, &invocation).expect("second setup");
    assert_eq!(executor.retained_runs(UnitKind::Program), 1);
    executor.run().expect("second run");
    executor.post_run(&mut env, true).expect("cleanup");

    assert_eq!(executor.retained_runs(UnitKind::Program), 0);
    assert_eq!(
        get_results(&env).expect("results").stdout().expect("stdout"),
        ["hi"]
    );
}
