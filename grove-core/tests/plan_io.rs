use std::collections::HashSet;
use std::fs;
use std::path::Path;

use grove_core::graph::DependencyGraph;
use grove_core::job::JobStatus;
use grove_core::persist::StatePersister;
use grove_core::plan::load_plan;

fn write(dir: &Path, name: &str, contents: &str) {
    fs::write(dir.join(name), contents).unwrap();
}

#[test]
fn load_roundtrips_through_status_updates() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "01-rich.md",
        concat!(
            "---\n",
            "id: rich-3f9a\n",
            "title: A rich job\n",
            "status: pending\n",
            "type: oneshot\n",
            "model: small-fast\n",
            "template: builder\n",
            "prepend_dependencies: true\n",
            "on_complete_status: needs_review\n",
            "operator_note: keep me\n",
            "output:\n",
            "  type: file\n",
            "  path: out/result.md\n",
            "---\n",
            "Body with **markdown**.\n",
        ),
    );

    let mut plan = load_plan(dir.path()).unwrap();
    let job = plan.job_mut("rich-3f9a").unwrap();
    assert_eq!(job.model.as_deref(), Some("small-fast"));
    assert_eq!(job.prepend_dependencies, Some(true));
    assert_eq!(job.on_complete_status.as_deref(), Some("needs_review"));

    let persister = StatePersister::new();
    persister.update_job_status(job, JobStatus::Running).unwrap();
    persister.update_job_status(job, JobStatus::Completed).unwrap();

    // everything the operator wrote survives the rewrites, including keys
    // the loader does not model
    let reloaded = load_plan(dir.path()).unwrap();
    let job = reloaded.job("rich-3f9a").unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.title, "A rich job");
    assert_eq!(job.model.as_deref(), Some("small-fast"));
    assert_eq!(job.template.as_deref(), Some("builder"));
    assert_eq!(job.output.path.as_deref(), Some("out/result.md"));
    assert_eq!(job.prompt_body.trim(), "Body with **markdown**.");
    assert!(job.start_time.is_some());
    assert!(job.end_time.is_some());

    let raw = fs::read_to_string(&job.file_path).unwrap();
    assert!(raw.contains("operator_note: keep me"));
    assert!(raw.contains("duration:"));
}

#[test]
fn execution_plan_is_a_valid_topological_layering() {
    let dir = tempfile::tempdir().unwrap();
    let job = |id: &str, status: &str, deps: &[&str]| {
        let deps = if deps.is_empty() {
            String::new()
        } else {
            format!("depends_on: [{}]\n", deps.join(", "))
        };
        format!("---\nid: {id}\ntitle: {id}\nstatus: {status}\ntype: shell\n{deps}---\n")
    };
    write(dir.path(), "01-a.md", &job("a", "completed", &[]));
    write(dir.path(), "02-b.md", &job("b", "pending", &["a"]));
    write(dir.path(), "03-c.md", &job("c", "pending", &["a"]));
    write(dir.path(), "04-d.md", &job("d", "pending", &["b", "c"]));
    write(dir.path(), "05-e.md", &job("e", "pending", &[]));

    let plan = load_plan(dir.path()).unwrap();
    let graph = DependencyGraph::build(&plan);
    let stages = graph.execution_plan().unwrap().stages;

    // every dependency edge crosses from a lower stage to a higher one
    let stage_of = |id: &str| {
        stages
            .iter()
            .position(|stage| stage.iter().any(|member| member == id))
    };
    for member in ["b", "c"] {
        assert!(stage_of(member) < stage_of("d"), "{member} must precede d");
    }

    // the union of stages is exactly the not-yet-completed jobs
    let emitted: HashSet<String> = stages.into_iter().flatten().collect();
    let expected: HashSet<String> = plan
        .jobs
        .iter()
        .filter(|job| job.status != JobStatus::Completed)
        .map(|job| job.id.clone())
        .collect();
    assert_eq!(emitted, expected);
}

#[test]
fn runnable_set_satisfies_the_predicate() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "01-a.md",
        "---\nid: a\ntitle: a\nstatus: completed\ntype: shell\n---\n",
    );
    write(
        dir.path(),
        "02-b.md",
        "---\nid: b\ntitle: b\nstatus: pending\ntype: shell\ndepends_on: [a]\n---\n",
    );
    write(
        dir.path(),
        "03-c.md",
        "---\nid: c\ntitle: c\nstatus: hold\ntype: shell\n---\n",
    );

    let plan = load_plan(dir.path()).unwrap();
    let graph = DependencyGraph::build(&plan);
    for job in graph.runnable_jobs() {
        assert!(grove_core::graph::is_runnable(job, &plan));
        assert_ne!(job.status, JobStatus::Hold);
    }
}
