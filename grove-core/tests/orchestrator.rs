use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use grove_core::backend::{CompletionBackend, MockBackend, StaticTemplateStore, cancel_pair};
use grove_core::error::GroveError;
use grove_core::job::JobStatus;
use grove_core::orchestrator::Orchestrator;
use grove_core::plan::load_plan;

fn write(dir: &Path, name: &str, contents: &str) {
    fs::write(dir.join(name), contents).unwrap();
}

fn oneshot(id: &str, deps: &[&str]) -> String {
    let deps = if deps.is_empty() {
        String::new()
    } else {
        format!("depends_on: [{}]\n", deps.join(", "))
    };
    format!(
        "---\nid: {id}\ntitle: Job {id}\nstatus: pending\ntype: oneshot\n{deps}---\nDo {id}.\n"
    )
}

fn orchestrator(dir: &Path, backend: &Arc<MockBackend>) -> Orchestrator {
    let templates = Arc::new(StaticTemplateStore::new());
    Orchestrator::new(
        dir,
        backend.clone() as Arc<dyn CompletionBackend>,
        templates,
    )
    .with_check_interval(Duration::from_millis(50))
}

#[tokio::test]
async fn linear_plan_completes() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "01-a.md", &oneshot("a", &[]));
    write(dir.path(), "02-b.md", &oneshot("b", &["a"]));

    let backend = Arc::new(MockBackend::new());
    orchestrator(dir.path(), &backend).run_all().await.unwrap();

    let plan = load_plan(dir.path()).unwrap();
    assert_eq!(plan.job("a").unwrap().status, JobStatus::Completed);
    assert_eq!(plan.job("b").unwrap().status, JobStatus::Completed);
    assert_eq!(backend.call_count(), 2);

    let status = grove_core::orchestrator::plan_status(&plan);
    assert_eq!(status.completed, 2);
    assert_eq!(status.failed, 0);
    assert_eq!(status.progress, 100.0);

    // b must have run after a: its briefing saw a completed dependency
    let calls = backend.calls();
    assert_eq!(calls[0].job_id, "a");
    assert_eq!(calls[1].job_id, "b");
}

#[tokio::test]
async fn missing_dependency_blocks_the_plan() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "01-a.md", &oneshot("a", &["ghost"]));

    let backend = Arc::new(MockBackend::new());
    let err = orchestrator(dir.path(), &backend)
        .run_all()
        .await
        .unwrap_err();
    match err {
        GroveError::BlockedPlan { pending } => assert_eq!(pending, vec!["a".to_string()]),
        other => panic!("expected BlockedPlan, got {other}"),
    }
    assert_eq!(backend.call_count(), 0);

    // the job is untouched on disk
    let plan = load_plan(dir.path()).unwrap();
    assert_eq!(plan.job("a").unwrap().status, JobStatus::Pending);
}

#[tokio::test]
async fn failed_job_leaves_dependents_pending() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "01-a.md", &oneshot("a", &[]));
    write(dir.path(), "02-b.md", &oneshot("b", &["a"]));

    let backend = Arc::new(MockBackend::new());
    backend.push_failure("model unavailable");

    let result = orchestrator(dir.path(), &backend).run_all().await;
    assert!(result.is_err());

    let plan = load_plan(dir.path()).unwrap();
    let a = plan.job("a").unwrap();
    assert_eq!(a.status, JobStatus::Failed);
    assert!(
        a.metadata
            .last_error
            .as_deref()
            .unwrap()
            .contains("model unavailable")
    );
    assert_eq!(a.metadata.retry_count, 1);
    assert_eq!(plan.job("b").unwrap().status, JobStatus::Pending);
}

#[tokio::test]
async fn fan_out_is_bounded_by_max_parallel_jobs() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "01-a.md", &oneshot("a", &[]));
    write(dir.path(), "02-b.md", &oneshot("b", &[]));
    write(dir.path(), "03-c.md", &oneshot("c", &[]));

    let backend = Arc::new(MockBackend::with_delay(Duration::from_millis(150)));
    orchestrator(dir.path(), &backend)
        .with_max_parallel_jobs(2)
        .run_all()
        .await
        .unwrap();

    assert_eq!(backend.call_count(), 3);
    // the first round overlaps two calls; never more than the bound
    assert_eq!(backend.peak_in_flight(), 2);

    let plan = load_plan(dir.path()).unwrap();
    assert!(plan.jobs.iter().all(|job| job.status == JobStatus::Completed));
}

#[tokio::test]
async fn generate_jobs_expands_the_plan() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "01-seed.md",
        "---\nid: seed\ntitle: Seed\nstatus: pending\ntype: oneshot\noutput:\n  type: generate_jobs\n---\nPlan the work.\n",
    );

    let backend = Arc::new(MockBackend::new());
    backend.push_response(
        r#"[
            {"title": "Implement", "prompt": "implement it"},
            {"title": "Verify", "prompt": "verify it", "depends_on": ["Implement"]}
        ]"#,
    );

    orchestrator(dir.path(), &backend).run_all().await.unwrap();

    let plan = load_plan(dir.path()).unwrap();
    assert_eq!(plan.jobs.len(), 3);
    let implement = plan.job_by_filename("02-implement.md").expect("generated file");
    let verify = plan.job_by_filename("03-verify.md").expect("generated file");
    assert_eq!(verify.depends_on, vec!["02-implement.md".to_string()]);
    assert_eq!(verify.dependencies, vec![Some(implement.id.clone())]);

    // the whole expanded plan ran to completion: seed + two generated
    assert_eq!(backend.call_count(), 3);
    assert!(plan.jobs.iter().all(|job| job.status == JobStatus::Completed));
}

#[tokio::test]
async fn chat_job_runs_one_turn_and_suspends() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "01-talk.md",
        "---\nid: talk\ntitle: Talk\nstatus: pending_user\ntype: chat\n---\nWhat changed in the parser?\n",
    );

    let backend = Arc::new(MockBackend::new());
    backend.push_response("The parser now handles frontmatter.");
    let orchestrator = orchestrator(dir.path(), &backend);

    orchestrator
        .run_job(&dir.path().join("01-talk.md"))
        .await
        .unwrap();

    assert_eq!(backend.call_count(), 1);
    let plan = load_plan(dir.path()).unwrap();
    let talk = plan.job("talk").unwrap();
    assert_eq!(talk.status, JobStatus::PendingUser);
    assert!(talk.prompt_body.contains("The parser now handles frontmatter."));

    // the appended assistant directive carries a 6-hex turn id, and the
    // matching briefing artifact exists
    let marker = talk
        .prompt_body
        .split("\"id\":\"")
        .nth(1)
        .expect("assistant directive present");
    let turn_id = &marker[..6];
    assert!(turn_id.chars().all(|ch| ch.is_ascii_hexdigit()));
    let briefing = dir
        .path()
        .join(".artifacts")
        .join(format!("briefing-talk-{turn_id}.xml"));
    assert!(briefing.exists(), "missing {}", briefing.display());

    // a second run with no new user input never reaches the backend
    orchestrator
        .run_job(&dir.path().join("01-talk.md"))
        .await
        .unwrap();
    assert_eq!(backend.call_count(), 1);
    let plan = load_plan(dir.path()).unwrap();
    assert_eq!(plan.job("talk").unwrap().status, JobStatus::PendingUser);
}

#[tokio::test]
async fn chat_complete_action_closes_the_job() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "01-talk.md",
        "---\nid: talk\ntitle: Talk\nstatus: pending_user\ntype: chat\n---\nthanks\n\n<!-- grove: {\"template\":\"default\",\"action\":\"complete\"} -->\n",
    );

    let backend = Arc::new(MockBackend::new());
    orchestrator(dir.path(), &backend)
        .run_job(&dir.path().join("01-talk.md"))
        .await
        .unwrap();

    assert_eq!(backend.call_count(), 0);
    let plan = load_plan(dir.path()).unwrap();
    assert_eq!(plan.job("talk").unwrap().status, JobStatus::Completed);
}

#[tokio::test]
async fn run_next_executes_exactly_one_runnable_job() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "01-a.md", &oneshot("a", &[]));
    write(dir.path(), "02-b.md", &oneshot("b", &["a"]));

    let backend = Arc::new(MockBackend::new());
    let orchestrator = orchestrator(dir.path(), &backend);

    let first = orchestrator.run_next().await.unwrap();
    assert_eq!(first.as_deref(), Some("a"));
    assert_eq!(backend.call_count(), 1);

    let second = orchestrator.run_next().await.unwrap();
    assert_eq!(second.as_deref(), Some("b"));

    let third = orchestrator.run_next().await.unwrap();
    assert_eq!(third, None);
}

#[tokio::test]
async fn cancellation_stops_the_run() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "01-a.md", &oneshot("a", &[]));

    let backend = Arc::new(MockBackend::new());
    let (handle, token) = cancel_pair();
    handle.cancel();

    let err = orchestrator(dir.path(), &backend)
        .with_cancel_token(token)
        .run_all()
        .await
        .unwrap_err();
    assert!(matches!(err, GroveError::Canceled));
    assert_eq!(backend.call_count(), 0);
}

#[tokio::test]
async fn completed_jobs_are_not_rerun_on_resume() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "01-a.md", &oneshot("a", &[]));
    write(dir.path(), "02-b.md", &oneshot("b", &["a"]));

    let backend = Arc::new(MockBackend::new());
    let orchestrator = orchestrator(dir.path(), &backend);
    orchestrator.run_all().await.unwrap();
    assert_eq!(backend.call_count(), 2);

    // a second run finds everything completed and makes no calls
    orchestrator.run_all().await.unwrap();
    assert_eq!(backend.call_count(), 2);
}

#[tokio::test]
async fn shell_jobs_drive_success_from_exit_codes() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "01-ok.md",
        "---\nid: ok\ntitle: Ok\nstatus: pending\ntype: shell\n---\necho done\n",
    );
    write(
        dir.path(),
        "02-bad.md",
        "---\nid: bad\ntitle: Bad\nstatus: pending\ntype: shell\n---\nexit 3\n",
    );

    let backend = Arc::new(MockBackend::new());
    let result = orchestrator(dir.path(), &backend).run_all().await;
    assert!(result.is_err());

    let plan = load_plan(dir.path()).unwrap();
    let ok = plan.job("ok").unwrap();
    assert_eq!(ok.status, JobStatus::Completed);
    assert!(ok.prompt_body.contains("done"));
    let bad = plan.job("bad").unwrap();
    assert_eq!(bad.status, JobStatus::Failed);
    assert!(bad.metadata.last_error.as_deref().unwrap().contains("3"));
}
