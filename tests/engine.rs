use std::fs;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use neuroflow::pipeline::{EXIT_CANCELLED, EXIT_FAILURE, EXIT_SUCCESS};
use neuroflow::{
    Builtin, CancelToken, NodeSpec, NodeStatus, ParamSpec, Pipeline, PipelineTemplate, Settings,
    SinkSpec, SubjectManifest,
};
use tempfile::TempDir;

struct Fixture {
    _dir: TempDir,
    root: Utf8PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().canonicalize().unwrap()).unwrap();
        Self { _dir: dir, root }
    }

    /// Writes `sub-<s>/anat/sub-<s>_T1w.nii.gz` under `bids/`.
    fn subject(&self, subject: &str, content: &str) -> Utf8PathBuf {
        let dir = self.root.join(format!("bids/sub-{subject}/anat"));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("sub-{subject}_T1w.nii.gz"));
        fs::write(&path, content).unwrap();
        path
    }

    fn bids(&self) -> Utf8PathBuf {
        self.root.join("bids")
    }

    fn out(&self) -> Utf8PathBuf {
        self.root.join("out")
    }

    fn settings(&self) -> Settings {
        let mut settings = Settings::default()
            .with_work_dir(self.root.join("work"))
            .with_concurrency(4)
            .with_retries(0, Duration::ZERO);
        settings.poll_interval = Duration::from_millis(10);
        settings
    }
}

fn sh(name: &str, script: &str) -> NodeSpec {
    NodeSpec::command(name, "/bin/sh", ["-c", script])
}

fn touch(name: &str, content: &str) -> NodeSpec {
    NodeSpec::builtin(name, Builtin::Touch)
        .param("content", ParamSpec::literal(content))
        .output("out", format!("{name}.txt"))
}

fn bare_subject() -> Vec<SubjectManifest> {
    vec![SubjectManifest::new("01", None)]
}

fn tree(root: &Utf8Path) -> Vec<(String, Vec<u8>)> {
    let mut files = Vec::new();
    let pattern = root.join("**/*");

    for entry in glob::glob(pattern.as_str()).unwrap() {
        let path = Utf8PathBuf::try_from(entry.unwrap()).unwrap();
        if path.is_file() {
            let relative = path.strip_prefix(root).unwrap().to_string();
            files.push((relative, fs::read(&path).unwrap()));
        }
    }

    files.sort();
    files
}

#[cfg(unix)]
fn anatomical() -> PipelineTemplate {
    PipelineTemplate::new("anat", "1.0")
        .node(
            NodeSpec::builtin("normalize", Builtin::Copy)
                .param("in", ParamSpec::input("T1w"))
                .output("warped", "warped.nii.gz")
                .sink(
                    SinkSpec::new("warped", "T1w")
                        .space("MNI152NLin2009cAsym")
                        .desc("preproc")
                        .keep_dtype(),
                ),
        )
        .node(
            NodeSpec::command(
                "segment",
                "/bin/sh",
                ["-c", "cp \"$0\" seg.nii.gz", "{in}"],
            )
            .version("1")
            .param("in", ParamSpec::output("normalize", "warped"))
            .output("seg", "seg.nii.gz")
            .sink(
                SinkSpec::new("seg", "T1w")
                    .suffix("dseg")
                    .meta("Type", "Brain"),
            ),
        )
}

#[cfg(unix)]
#[test]
fn test_normalize_then_segment_is_cached_on_rerun() {
    let fx = Fixture::new();
    fx.subject("01", "anatomy");

    let first = Pipeline::new(anatomical(), fx.settings())
        .run(fx.bids(), fx.out(), &[])
        .unwrap();

    assert_eq!(first.exit_code(), EXIT_SUCCESS, "{}", first.render());
    assert_eq!(first.invocations, 2);

    let subject = first.subject("sub-01").unwrap();
    let sink = subject.sink().unwrap();
    assert_eq!(sink.written.len(), 2);
    assert_eq!(sink.sidecars.len(), 1);

    let staged = fx
        .out()
        .join("anat/sub-01/anat/sub-01_space-MNI152NLin2009cAsym_desc-preproc_T1w.nii.gz");
    assert_eq!(fs::read_to_string(&staged).unwrap(), "anatomy");
    assert_eq!(
        fs::read_to_string(fx.out().join("anat/sub-01/anat/sub-01_dseg.nii.gz")).unwrap(),
        "anatomy"
    );
    assert_eq!(
        fs::read_to_string(fx.out().join("anat/sub-01/anat/sub-01_dseg.json")).unwrap(),
        "{\n  \"Type\": \"Brain\"\n}"
    );

    let before = tree(&fx.out());

    let second = Pipeline::new(anatomical(), fx.settings())
        .run(fx.bids(), fx.out(), &[])
        .unwrap();

    assert_eq!(second.exit_code(), EXIT_SUCCESS);
    assert_eq!(second.invocations, 0);

    let record = second.subject("sub-01").unwrap().record().unwrap();
    assert!(
        record
            .results
            .iter()
            .all(|r| r.status == NodeStatus::SkippedCached)
    );

    let sink = second.subject("sub-01").unwrap().sink().unwrap();
    assert!(sink.written.is_empty());
    assert_eq!(sink.unchanged.len(), 2);
    assert_eq!(tree(&fx.out()), before);
}

#[test]
fn test_changed_input_invalidates_only_its_subject() {
    let fx = Fixture::new();
    fx.subject("01", "one");
    fx.subject("02", "two");

    let template = PipelineTemplate::new("stage", "1").node(
        NodeSpec::builtin("stage", Builtin::Copy)
            .param("in", ParamSpec::input("T1w"))
            .output("image", "image.nii.gz"),
    );

    let first = Pipeline::new(template.clone(), fx.settings())
        .run(fx.bids(), fx.out(), &[])
        .unwrap();
    assert_eq!(first.invocations, 2);

    fx.subject("02", "two, reprocessed");

    let second = Pipeline::new(template, fx.settings())
        .run(fx.bids(), fx.out(), &[])
        .unwrap();
    assert_eq!(second.invocations, 1);

    let status = |label: &str| {
        second.subject(label).unwrap().record().unwrap().results[0].status
    };
    assert_eq!(status("sub-01"), NodeStatus::SkippedCached);
    assert_eq!(status("sub-02"), NodeStatus::Succeeded);
}

#[test]
fn test_participant_filter() {
    let fx = Fixture::new();
    fx.subject("01", "one");
    fx.subject("02", "two");

    let template = PipelineTemplate::new("p", "1").node(touch("a", "x"));
    let summary = Pipeline::new(template, fx.settings())
        .run(fx.bids(), fx.out(), &["sub-02".to_string()])
        .unwrap();

    assert_eq!(summary.subjects.len(), 1);
    assert_eq!(summary.subjects[0].label, "sub-02");
}

#[test]
fn test_parameter_change_keeps_siblings_cached() {
    let fx = Fixture::new();

    let template = |content: &str| {
        PipelineTemplate::new("p", "1")
            .node(touch("a", content))
            .node(touch("b", "sibling"))
            .node(
                NodeSpec::builtin("c", Builtin::Copy)
                    .param("in", ParamSpec::output("a", "out"))
                    .output("copy", "a.txt"),
            )
    };

    let first = Pipeline::new(template("v1"), fx.settings())
        .run_manifests(&bare_subject(), fx.out())
        .unwrap();
    assert_eq!(first.invocations, 3);

    let second = Pipeline::new(template("v2"), fx.settings())
        .run_manifests(&bare_subject(), fx.out())
        .unwrap();

    let record = second.subject("sub-01").unwrap().record().unwrap();
    assert_eq!(record.result("a").unwrap().status, NodeStatus::Succeeded);
    assert_eq!(record.result("b").unwrap().status, NodeStatus::SkippedCached);
    assert_eq!(record.result("c").unwrap().status, NodeStatus::Succeeded);
    assert_eq!(second.invocations, 2);

    let copy = &record.result("c").unwrap().outputs["copy"][0];
    assert_eq!(fs::read_to_string(copy).unwrap(), "v2");
}

#[test]
fn test_missing_cached_file_is_rebuilt() {
    let fx = Fixture::new();
    let template = || PipelineTemplate::new("p", "1").node(touch("a", "x"));

    let first = Pipeline::new(template(), fx.settings())
        .run_manifests(&bare_subject(), fx.out())
        .unwrap();
    let produced = first.subject("sub-01").unwrap().record().unwrap().results[0].outputs["out"]
        [0]
    .clone();
    fs::remove_file(&produced).unwrap();

    let second = Pipeline::new(template(), fx.settings())
        .run_manifests(&bare_subject(), fx.out())
        .unwrap();

    assert_eq!(second.invocations, 1);
    assert_eq!(fs::read_to_string(&produced).unwrap(), "x");
}

#[cfg(unix)]
#[test]
fn test_failure_is_isolated_and_propagates() {
    let fx = Fixture::new();

    let template = PipelineTemplate::new("p", "1")
        .node(sh("a", "echo 'cannot read header' >&2; exit 1").output("out", "a.txt"))
        .node(touch("b", "independent"))
        .node(
            NodeSpec::builtin("c", Builtin::Copy)
                .param("in", ParamSpec::output("a", "out"))
                .output("copy", "a.txt"),
        )
        .node(touch("d", "late").depends_on("c"));

    let summary = Pipeline::new(template, fx.settings())
        .run_manifests(&bare_subject(), fx.out())
        .unwrap();

    assert_eq!(summary.exit_code(), EXIT_FAILURE);

    let subject = summary.subject("sub-01").unwrap();
    let record = subject.record().unwrap();

    assert_eq!(record.result("a").unwrap().status, NodeStatus::Failed);
    assert_eq!(record.result("b").unwrap().status, NodeStatus::Succeeded);
    assert_eq!(record.result("c").unwrap().status, NodeStatus::FailedUpstream);
    assert_eq!(record.result("d").unwrap().status, NodeStatus::FailedUpstream);
    assert_eq!(record.result("c").unwrap().attempts, 0);
    assert!(subject.sink().is_none());

    let failed = record.result("a").unwrap();
    assert!(failed.logs.stderr.contains("cannot read header"));

    let log = fs::read_to_string(fx.root.join("work/logs/sub-01/a.log")).unwrap();
    assert!(log.contains("cannot read header"));
    assert!(log.contains("code 1"));
}

#[cfg(unix)]
#[test]
fn test_transient_failures_are_retried() {
    let fx = Fixture::new();
    let counter = fx.root.join("attempts");

    let script = "echo x >> \"$0\"; [ \"$(wc -l < \"$0\")\" -ge 2 ] || exit 75; touch done.txt";
    let template = PipelineTemplate::new("p", "1").node(
        NodeSpec::command("flaky", "/bin/sh", ["-c", script, "{counter}"])
            .param("counter", ParamSpec::literal(counter.as_str()))
            .output("done", "done.txt"),
    );

    let settings = fx.settings().with_retries(2, Duration::from_millis(10));
    let summary = Pipeline::new(template, settings)
        .run_manifests(&bare_subject(), fx.out())
        .unwrap();

    let record = summary.subject("sub-01").unwrap().record().unwrap();
    let flaky = record.result("flaky").unwrap();

    assert_eq!(flaky.status, NodeStatus::Succeeded);
    assert_eq!(flaky.attempts, 2);
    assert_eq!(fs::read_to_string(&counter).unwrap().lines().count(), 2);
}

#[cfg(unix)]
#[test]
fn test_permanent_failures_are_not_retried() {
    let fx = Fixture::new();
    let counter = fx.root.join("attempts");

    let template = PipelineTemplate::new("p", "1").node(
        NodeSpec::command("broken", "/bin/sh", ["-c", "echo x >> \"$0\"; exit 2", "{counter}"])
            .param("counter", ParamSpec::literal(counter.as_str())),
    );

    let settings = fx.settings().with_retries(3, Duration::from_millis(10));
    let summary = Pipeline::new(template, settings)
        .run_manifests(&bare_subject(), fx.out())
        .unwrap();

    let record = summary.subject("sub-01").unwrap().record().unwrap();
    let broken = record.result("broken").unwrap();

    assert_eq!(broken.status, NodeStatus::Failed);
    assert_eq!(broken.attempts, 1);
    assert_eq!(fs::read_to_string(&counter).unwrap().lines().count(), 1);
}

#[cfg(unix)]
#[test]
fn test_timeout_kills_the_tool() {
    let fx = Fixture::new();
    let template = PipelineTemplate::new("p", "1")
        .node(sh("slow", "sleep 5; touch late.txt").output("late", "late.txt"));

    let settings = fx.settings().with_timeout(Some(Duration::from_millis(200)));
    let start = Instant::now();
    let summary = Pipeline::new(template, settings)
        .run_manifests(&bare_subject(), fx.out())
        .unwrap();

    assert!(start.elapsed() < Duration::from_secs(4));

    let record = summary.subject("sub-01").unwrap().record().unwrap();
    let slow = record.result("slow").unwrap();
    assert_eq!(slow.status, NodeStatus::Failed);
    assert!(slow.error.as_deref().unwrap().contains("timed out"));
}

#[cfg(unix)]
#[test]
fn test_missing_output_fails_despite_exit_zero() {
    let fx = Fixture::new();
    let template = PipelineTemplate::new("p", "1")
        .node(sh("quiet", "echo nothing to see").output("mask", "mask.nii.gz"));

    let summary = Pipeline::new(template, fx.settings())
        .run_manifests(&bare_subject(), fx.out())
        .unwrap();

    let record = summary.subject("sub-01").unwrap().record().unwrap();
    let quiet = record.result("quiet").unwrap();

    assert_eq!(quiet.status, NodeStatus::Failed);
    assert!(quiet.error.as_deref().unwrap().contains("mask.nii.gz"));
    assert_eq!(quiet.logs.stdout, "nothing to see\n");
}

#[test]
fn test_node_without_outputs_is_cached() {
    let fx = Fixture::new();
    let template = || {
        PipelineTemplate::new("p", "1").node(NodeSpec::builtin("check", Builtin::Touch))
    };

    let first = Pipeline::new(template(), fx.settings())
        .run_manifests(&bare_subject(), fx.out())
        .unwrap();
    assert_eq!(first.invocations, 1);

    let second = Pipeline::new(template(), fx.settings())
        .run_manifests(&bare_subject(), fx.out())
        .unwrap();
    assert_eq!(second.invocations, 0);
}

#[test]
fn test_cancelled_before_start() {
    let fx = Fixture::new();
    let token = CancelToken::new();
    token.cancel();

    let summary = Pipeline::new(PipelineTemplate::new("p", "1").node(touch("a", "x")), fx.settings())
        .with_cancel(token)
        .run_manifests(&bare_subject(), fx.out())
        .unwrap();

    assert!(summary.subjects.is_empty());
    assert_eq!(summary.exit_code(), EXIT_CANCELLED);
}

#[cfg(unix)]
#[test]
fn test_cancel_stops_running_tools() {
    let fx = Fixture::new();
    let token = CancelToken::new();

    let template = PipelineTemplate::new("p", "1")
        .node(sh("slow", "sleep 5; touch out.txt").output("out", "out.txt"))
        .node(touch("after", "x").depends_on("slow"));

    let trigger = {
        let token = token.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(200));
            token.cancel();
        })
    };

    let start = Instant::now();
    let summary = Pipeline::new(template, fx.settings())
        .with_cancel(token)
        .run_manifests(&bare_subject(), fx.out())
        .unwrap();
    trigger.join().unwrap();

    assert!(start.elapsed() < Duration::from_secs(4));
    assert_eq!(summary.exit_code(), EXIT_CANCELLED);

    let record = summary.subject("sub-01").unwrap().record().unwrap();
    assert!(record.cancelled);
    assert_eq!(record.result("slow").unwrap().status, NodeStatus::Cancelled);
    assert_eq!(record.result("after").unwrap().status, NodeStatus::Cancelled);
}

#[cfg(unix)]
#[test]
fn test_independent_nodes_run_in_declaration_order_with_one_worker() {
    let fx = Fixture::new();
    let journal = fx.root.join("journal");

    let step = |name: &str| {
        NodeSpec::command(name, "/bin/sh", ["-c", "echo \"$1\" >> \"$0\"", "{journal}", name])
            .param("journal", ParamSpec::literal(journal.as_str()))
    };

    let template = PipelineTemplate::new("p", "1")
        .node(step("z"))
        .node(step("y"))
        .node(step("x"));

    let settings = fx.settings().with_concurrency(1);
    let summary = Pipeline::new(template, settings)
        .run_manifests(&bare_subject(), fx.out())
        .unwrap();

    assert_eq!(summary.exit_code(), EXIT_SUCCESS);
    assert_eq!(fs::read_to_string(&journal).unwrap(), "z\ny\nx\n");
}

#[cfg(unix)]
#[test]
fn test_at_most_max_concurrency_tools_overlap() {
    let fx = Fixture::new();
    let journal = fx.root.join("journal");

    let step = |name: &str| {
        NodeSpec::command(
            name,
            "/bin/sh",
            ["-c", "echo + >> \"$0\"; sleep 0.3; echo - >> \"$0\"", "{journal}", name],
        )
        .param("journal", ParamSpec::literal(journal.as_str()))
    };

    let template = ["a", "b", "c", "d", "e"]
        .into_iter()
        .fold(PipelineTemplate::new("p", "1"), |template, name| {
            template.node(step(name))
        });

    let settings = fx.settings().with_concurrency(2);
    let summary = Pipeline::new(template, settings)
        .run_manifests(&bare_subject(), fx.out())
        .unwrap();

    assert_eq!(summary.exit_code(), EXIT_SUCCESS);

    let events = fs::read_to_string(&journal).unwrap();
    let (mut running, mut peak) = (0i32, 0i32);

    for event in events.lines() {
        running += if event == "+" { 1 } else { -1 };
        peak = peak.max(running);
    }

    assert_eq!(events.lines().count(), 10);
    assert_eq!(running, 0);
    assert_eq!(peak, 2);
}
