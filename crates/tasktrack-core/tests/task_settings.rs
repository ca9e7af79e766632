use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::json;
use tasktrack_core::models::{TaskArguments, TaskCall, TaskErrorKind, TaskId, TaskStatus};
use tasktrack_core::orchestration::{
    ExecutorSettings, IdStrategy, RunOutcome, StoreSettings, TaskConfig, TaskPolicy, TaskSettings,
    WaitMode, global_settings, install_global_settings, resolve_settings,
};

fn temp_db_path(test_name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time should be after unix epoch")
        .as_nanos();
    std::env::temp_dir().join(format!("tasktrack-{test_name}-{nanos}.sqlite3"))
}

fn add(x: i64, y: i64) -> TaskCall {
    TaskCall::new(
        "add",
        |args: &TaskArguments| Ok(json!(args.require_i64(0, "x")? + args.require_i64(1, "y")?)),
        TaskArguments::new().arg(x).arg(y),
    )
}

#[test]
fn empty_document_yields_the_defaults() {
    let settings = TaskSettings::from_json_str("{}").unwrap();
    assert_eq!(settings, TaskSettings::default());
    assert_eq!(settings.store, StoreSettings::InMemory);
    assert_eq!(settings.executor, ExecutorSettings::ThreadPool { max_workers: 4 });
    assert_eq!(settings.default_timeout(), Duration::from_secs(30));
    assert_eq!(settings.poll_interval(), Duration::from_millis(100));
    assert_eq!(settings.wait_mode, WaitMode::Async);
    assert_eq!(settings.id_strategy, IdStrategy::Uuid);
    assert_eq!(settings.retention(), None);

    let policy = TaskPolicy::from(&settings);
    assert_eq!(policy, TaskPolicy::default());
}

#[test]
fn tagged_sections_select_store_and_executor() {
    let settings = TaskSettings::from_json_str(
        r#"{
            "store": {"kind": "sqlite", "path": "/var/lib/tasktrack/tasks.sqlite3"},
            "executor": {"kind": "process_pool", "program": "/usr/local/bin/worker", "args": ["--serve"]},
            "default_timeout_ms": 2500,
            "wait_mode": "sync",
            "id_strategy": {"kind": "sequential", "prefix": "job-"},
            "retention_secs": 86400
        }"#,
    )
    .unwrap();

    assert_eq!(
        settings.store,
        StoreSettings::Sqlite {
            path: PathBuf::from("/var/lib/tasktrack/tasks.sqlite3")
        }
    );
    match &settings.executor {
        ExecutorSettings::ProcessPool {
            program,
            args,
            env,
            max_workers,
        } => {
            assert_eq!(program, &PathBuf::from("/usr/local/bin/worker"));
            assert_eq!(args, &vec!["--serve".to_string()]);
            assert!(env.is_empty());
            assert_eq!(*max_workers, 4);
        }
        other => panic!("unexpected executor settings {other:?}"),
    }
    assert_eq!(settings.default_timeout(), Duration::from_millis(2500));
    assert_eq!(settings.wait_mode, WaitMode::Sync);
    assert_eq!(settings.retention(), Some(Duration::from_secs(86_400)));
}

#[test]
fn settings_serialize_back_to_tagged_json() {
    let settings = TaskSettings {
        executor: ExecutorSettings::Computation { max_workers: 2 },
        store: StoreSettings::Computation {
            root: PathBuf::from("/tmp/results"),
            ttl_secs: Some(60),
        },
        ..TaskSettings::default()
    };
    let value = serde_json::to_value(&settings).unwrap();
    assert_eq!(value["store"]["kind"], json!("computation"));
    assert_eq!(value["executor"]["kind"], json!("computation"));
    assert_eq!(value["wait_mode"], json!("async"));
    assert_eq!(value["id_strategy"], json!({"kind": "uuid"}));
}

#[test]
fn invalid_documents_are_rejected() {
    let cases = [
        "not json",
        r#"{"executor": {"kind": "thread_pool", "max_workers": 0}}"#,
        r#"{"poll_interval_ms": 0}"#,
        r#"{"store": {"kind": "carrier_pigeon"}}"#,
        r#"{"store": {"kind": "computation", "root": "/tmp/x"}}"#,
        r#"{"executor": {"kind": "computation"}}"#,
        r#"{"executor": {"kind": "process_pool", "program": ""}}"#,
    ];
    for raw in cases {
        let error = TaskSettings::from_json_str(raw).unwrap_err();
        assert_eq!(error.kind, TaskErrorKind::InvalidInput, "{raw}");
    }
}

#[test]
fn sqlite_settings_build_a_working_config() {
    let path = temp_db_path("settings-sqlite");
    let settings = TaskSettings {
        store: StoreSettings::Sqlite { path: path.clone() },
        executor: ExecutorSettings::ThreadPool { max_workers: 2 },
        poll_interval_ms: 5,
        id_strategy: IdStrategy::Sequential {
            prefix: "job-".to_string(),
        },
        wait_mode: WaitMode::Sync,
        ..TaskSettings::default()
    };
    let config = TaskConfig::from_settings(&settings).unwrap();

    let outcome = config.run(add(3, 5), None).unwrap();
    assert_eq!(outcome.task_id(), &TaskId::from("job-1"));
    assert_eq!(
        config.get_result(outcome.task_id(), false, None).unwrap(),
        json!(8)
    );
    config.shutdown(true).unwrap();

    let reopened = TaskConfig::from_settings(&settings).unwrap();
    assert_eq!(
        reopened.get_status(&TaskId::from("job-1")).unwrap(),
        TaskStatus::Completed
    );
    let error = reopened.submit_and_track(add(1, 1), None).unwrap_err();
    assert_eq!(error.kind, TaskErrorKind::DuplicateTask);
    reopened.shutdown(true).unwrap();

    let _ = std::fs::remove_file(path);
}

#[test]
fn explicit_settings_win_over_the_installed_global() {
    let global = TaskSettings {
        default_timeout_ms: 1234,
        ..TaskSettings::default()
    };
    install_global_settings(global.clone()).unwrap();
    assert_eq!(global_settings(), Some(&global));
    assert_eq!(
        install_global_settings(TaskSettings::default())
            .unwrap_err()
            .kind,
        TaskErrorKind::InvalidInput
    );

    assert_eq!(resolve_settings(None), global);
    let explicit = TaskSettings {
        poll_interval_ms: 7,
        ..TaskSettings::default()
    };
    assert_eq!(resolve_settings(Some(explicit.clone())), explicit);

    let config = TaskConfig::resolve(None).unwrap();
    assert_eq!(config.policy().default_timeout, Duration::from_millis(1234));
    config.shutdown(true).unwrap();
}

#[test]
fn maximal_default_timeout_is_accepted_and_usable() {
    let settings = TaskSettings::from_json_str(&format!(
        r#"{{"default_timeout_ms": {}, "poll_interval_ms": 5, "wait_mode": "sync"}}"#,
        u64::MAX
    ))
    .unwrap();
    assert_eq!(settings.default_timeout(), Duration::from_millis(u64::MAX));

    let config = TaskConfig::from_settings(&settings).unwrap();
    match config.run(add(2, 2), None).unwrap() {
        RunOutcome::Finished(_, value) => assert_eq!(value, json!(4)),
        other => panic!("expected a finished run, got {other:?}"),
    }
    config.shutdown(true).unwrap();
}
