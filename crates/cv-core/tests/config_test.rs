use std::io::Write;

use cv_core::config::{Config, ExecutorConfig};
use cv_telemetry::logging::LogFormat;
use rstest::rstest;

#[test]
fn default_config() {
    let cfg = Config::default();
    assert_eq!(cfg.general.project_name, "conveyor");
    assert_eq!(cfg.general.log_level, "info");
    assert_eq!(cfg.general.log_format, "human");
    assert_eq!(cfg.store.path, "~/.conveyor/conveyor.db");
    assert_eq!(cfg.queue.default_timeout_secs, 600);
    assert_eq!(cfg.queue.stale_job_max_age_secs, 604_800);
    assert_eq!(cfg.queue.max_attempts, 3);
    assert_eq!(cfg.workers.count, 4);
    assert_eq!(cfg.workers.poll_interval_ms, 1000);
    assert_eq!(cfg.workers.sweep_interval_secs, 30);
    assert_eq!(cfg.workers.job_types, vec!["agent_run".to_string()]);
    assert_eq!(cfg.orchestrator.cycle_interval_secs, 15);
    assert_eq!(cfg.orchestrator.max_tasks_per_cycle, 20);
    assert!(cfg.orchestrator.auto_loop_back);
    assert!(!cfg.orchestrator.umbrella_tasks);
    assert_eq!(cfg.daemon.patrol_interval_secs, 300);
    assert!(cfg.executors.is_empty());
    cfg.validate().expect("defaults validate");
}

#[test]
fn config_roundtrip() {
    let mut cfg = Config::default();
    cfg.executors.insert(
        "agent_run".into(),
        ExecutorConfig {
            command: "/usr/local/bin/agent".into(),
            args: vec!["--json".into()],
            env: Default::default(),
            working_dir: None,
        },
    );
    let toml_str = cfg.to_toml().expect("serialize to toml");
    assert!(toml_str.contains("conveyor"));

    let parsed: Config = toml::from_str(&toml_str).expect("parse toml back");
    assert_eq!(parsed.general.project_name, cfg.general.project_name);
    assert_eq!(parsed.workers.count, cfg.workers.count);
    assert_eq!(parsed.executors["agent_run"].args, vec!["--json".to_string()]);
    parsed.validate().expect("config validates");
}

#[test]
fn config_partial_toml() {
    let partial = r#"
[general]
project_name = "my-project"

[workers]
count = 2
"#;
    let cfg: Config = toml::from_str(partial).expect("parse partial");
    assert_eq!(cfg.general.project_name, "my-project");
    assert_eq!(cfg.workers.count, 2);
    // defaults should fill in the rest
    assert_eq!(cfg.general.log_level, "info");
    assert_eq!(cfg.workers.poll_interval_ms, 1000);
    assert_eq!(cfg.queue.max_attempts, 3);
    cfg.validate().expect("config validates");
}

#[test]
fn load_from_file() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    writeln!(
        file,
        r#"
[orchestrator]
auto_loop_back = false

[executors.agent_run]
command = "agent"
args = ["run"]
"#
    )
    .expect("write config");

    let cfg = Config::load_from(file.path()).expect("load config");
    assert!(!cfg.orchestrator.auto_loop_back);
    assert_eq!(cfg.executors["agent_run"].command, "agent");
}

#[test]
fn load_from_missing_file_is_io_error() {
    let dir = tempfile::tempdir().expect("temp dir");
    let err = Config::load_from(dir.path().join("nope.toml")).expect_err("missing file");
    assert!(err.to_string().starts_with("io:"));
}

#[test]
fn malformed_toml_is_parse_error() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    writeln!(file, "[workers\ncount = ").expect("write config");
    let err = Config::load_from(file.path()).expect_err("bad toml");
    assert!(err.to_string().starts_with("parse:"));
}

#[test]
fn zero_workers_fails_validation() {
    let mut cfg = Config::default();
    cfg.workers.count = 0;
    let err = cfg.validate().expect_err("validation should fail");
    assert!(err.to_string().contains("workers.count"));
}

#[test]
fn unknown_log_format_fails_validation() {
    let mut cfg = Config::default();
    cfg.general.log_format = "xml".into();
    let err = cfg.validate().expect_err("validation should fail");
    assert!(err.to_string().contains("log_format"));
}

#[rstest]
#[case("human", LogFormat::Human)]
#[case("text", LogFormat::Human)]
#[case("TEXT", LogFormat::Human)]
#[case("Json", LogFormat::Json)]
fn log_formats_the_logger_accepts_pass_validation(#[case] raw: &str, #[case] expected: LogFormat) {
    let mut cfg = Config::default();
    cfg.general.log_format = raw.into();
    cfg.validate().expect("valid log format");
    assert_eq!(cfg.general.log_format().expect("parsed"), expected);
}

#[test]
fn zero_patrol_interval_fails_validation() {
    let mut cfg = Config::default();
    cfg.daemon.patrol_interval_secs = 0;
    let err = cfg.validate().expect_err("validation should fail");
    assert!(err.to_string().contains("daemon.patrol_interval_secs"));
}

#[test]
fn empty_executor_command_fails_validation() {
    let mut cfg = Config::default();
    cfg.executors.insert(
        "agent_run".into(),
        ExecutorConfig {
            command: "  ".into(),
            args: Vec::new(),
            env: Default::default(),
            working_dir: None,
        },
    );
    let err = cfg.validate().expect_err("validation should fail");
    assert!(err.to_string().contains("executors.agent_run.command"));
}

#[test]
fn store_path_expands_home() {
    let cfg = Config::default();
    let resolved = cfg.store.resolved_path();
    assert!(resolved.ends_with(".conveyor/conveyor.db"));
    assert!(!resolved.to_string_lossy().starts_with('~'));
}
