//! End-to-end run: targets → staged downloads → merged document.
//!
//! Targets are fetched through a bounded, order-preserving buffer
//! (`StreamExt::buffered`): up to `concurrency` downloads overlap, but their
//! outcomes are handed to the merge step strictly in input order. The merge
//! loop is the only place that touches the merger or the failure list.

use std::path::PathBuf;
use std::pin::pin;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tokio::runtime::RuntimeFlavor;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use aipbinder_fetcher::{FetchError, FetchReport, Fetcher};
use aipbinder_shared::{
    AipBinderError, EventSink, FetchConfig, PipelineEvent, Result, RetrievalTarget, RunId,
};

use crate::merger::{DocumentMerger, PdfMerger};
use crate::staging::{Stager, StagingArea, StagingSlot};

/// Per-run settings that are not part of the fetch policy.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Identifies the run and keys its staging area.
    pub run_id: RunId,
    /// Where the combined document is written.
    pub output_path: PathBuf,
}

/// A target that did not make it into the combined document.
#[derive(Debug, Clone, Serialize)]
pub struct TargetFailure {
    /// Position of the target in the input.
    pub index: usize,
    /// The target itself.
    pub target: RetrievalTarget,
    /// Last error seen for it (download or merge).
    pub reason: String,
}

/// Summary of a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct MergeResult {
    pub run_id: RunId,
    /// Number of input targets.
    pub total: usize,
    /// Targets fetched and merged.
    pub succeeded_count: usize,
    /// Targets that failed, in input order.
    pub failed_targets: Vec<RetrievalTarget>,
    /// Failure details, parallel to `failed_targets`.
    pub failures: Vec<TargetFailure>,
    /// Combined document; present iff `succeeded_count > 0`.
    pub output: Option<PathBuf>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// What fetching one target produced.
#[derive(Debug)]
pub enum RetrievalOutcome {
    /// The target's document is in `slot`.
    Success { slot: StagingSlot, report: FetchReport },
    /// Every attempt failed.
    Failed {
        index: usize,
        target: RetrievalTarget,
        last_error: FetchError,
    },
}

/// Accumulated per-target bookkeeping for one run.
#[derive(Debug, Default)]
struct Tally {
    succeeded: usize,
    failures: Vec<TargetFailure>,
    output: Option<PathBuf>,
}

impl Tally {
    fn fail(
        &mut self,
        index: usize,
        target: &RetrievalTarget,
        reason: String,
        events: &dyn EventSink,
    ) {
        warn!(index, label = %target.label, %reason, "target skipped");
        events.emit(PipelineEvent::TargetFailed {
            index,
            label: target.label.clone(),
            reason: reason.clone(),
        });
        self.failures.push(TargetFailure {
            index,
            target: target.clone(),
            reason,
        });
    }
}

/// Drives fetch → stage → merge over an ordered target list.
pub struct Pipeline {
    config: RunConfig,
    fetcher: Fetcher,
    stager: Stager,
    concurrency: usize,
}

impl Pipeline {
    /// Build a pipeline; fails if the fetch policy is invalid.
    pub fn new(config: RunConfig, fetch: &FetchConfig, stager: Stager) -> Result<Self> {
        let fetcher = Fetcher::new(fetch)?;
        Ok(Self {
            config,
            fetcher,
            stager,
            concurrency: fetch.concurrency.max(1),
        })
    }

    pub fn run_id(&self) -> &RunId {
        &self.config.run_id
    }

    /// Run over `targets`, merging into a PDF.
    pub async fn run(
        &self,
        targets: &[RetrievalTarget],
        events: &dyn EventSink,
        cancel: &CancellationToken,
    ) -> Result<MergeResult> {
        self.run_with_merger(targets, PdfMerger::new(), events, cancel)
            .await
    }

    /// Run over `targets` with a caller-supplied merger.
    ///
    /// Per-target failures are recorded in the result. Only a staging
    /// failure, cancellation, or a failure to write the output ends the run
    /// with an error. The merger is closed and the staging area released on
    /// every path.
    #[instrument(skip_all, fields(run_id = %self.config.run_id, targets = targets.len()))]
    pub async fn run_with_merger<M: DocumentMerger>(
        &self,
        targets: &[RetrievalTarget],
        mut merger: M,
        events: &dyn EventSink,
        cancel: &CancellationToken,
    ) -> Result<MergeResult> {
        let started_at = Utc::now();
        let run_id = self.config.run_id.clone();

        events.emit(PipelineEvent::RunStarted {
            run_id: run_id.clone(),
            total: targets.len(),
        });

        if targets.is_empty() {
            merger.close();
            info!("no targets, nothing to merge");
            events.emit(PipelineEvent::RunFinished {
                succeeded: 0,
                failed: 0,
            });
            return Ok(MergeResult {
                run_id,
                total: 0,
                succeeded_count: 0,
                failed_targets: Vec::new(),
                failures: Vec::new(),
                output: None,
                started_at,
                finished_at: Utc::now(),
            });
        }

        let area = match self.stager.prepare(&run_id) {
            Ok(area) => area,
            Err(e) => {
                merger.close();
                return Err(e);
            }
        };

        info!(
            concurrency = self.concurrency,
            max_attempts = self.fetcher.policy().max_attempts,
            staging = %area.path().display(),
            "starting run"
        );

        let processed = self
            .process(targets, &area, &mut merger, events, cancel)
            .await;

        merger.close();
        off_worker(|| self.stager.release(&area));

        let tally = processed?;
        let failed_targets: Vec<RetrievalTarget> =
            tally.failures.iter().map(|f| f.target.clone()).collect();

        events.emit(PipelineEvent::RunFinished {
            succeeded: tally.succeeded,
            failed: failed_targets.len(),
        });

        info!(
            succeeded = tally.succeeded,
            failed = failed_targets.len(),
            output = ?tally.output,
            "run complete"
        );

        Ok(MergeResult {
            run_id,
            total: targets.len(),
            succeeded_count: tally.succeeded,
            failed_targets,
            failures: tally.failures,
            output: tally.output,
            started_at,
            finished_at: Utc::now(),
        })
    }

    /// Fetch and merge every target; finalize if anything was merged.
    async fn process<M: DocumentMerger>(
        &self,
        targets: &[RetrievalTarget],
        area: &StagingArea,
        merger: &mut M,
        events: &dyn EventSink,
        cancel: &CancellationToken,
    ) -> Result<Tally> {
        let mut tally = Tally::default();

        let mut outcomes = pin!(
            stream::iter(targets.iter().enumerate())
                .map(move |(index, target)| self.fetch_one(index, target, area, events))
                .buffered(self.concurrency)
        );

        loop {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!("run cancelled");
                    return Err(AipBinderError::Cancelled);
                }
                next = outcomes.next() => match next {
                    Some(outcome) => outcome,
                    None => break,
                },
            };

            match outcome {
                RetrievalOutcome::Success { slot, .. } => {
                    let target = &targets[slot.index];
                    match off_worker(|| merger.append(&slot)) {
                        Ok(()) => {
                            tally.succeeded += 1;
                            events.emit(PipelineEvent::TargetMerged {
                                index: slot.index,
                                label: target.label.clone(),
                            });
                        }
                        Err(e) => tally.fail(slot.index, target, e.to_string(), events),
                    }
                }
                RetrievalOutcome::Failed {
                    index,
                    target,
                    last_error,
                } => tally.fail(index, &target, last_error.to_string(), events),
            }
        }

        if merger.has_content() {
            let path = off_worker(|| merger.finalize(&self.config.output_path))
                .map_err(|e| AipBinderError::Output(e.to_string()))?;
            events.emit(PipelineEvent::OutputWritten { path: path.clone() });
            tally.output = Some(path);
        }

        Ok(tally)
    }

    /// Download one target into its slot.
    async fn fetch_one(
        &self,
        index: usize,
        target: &RetrievalTarget,
        area: &StagingArea,
        events: &dyn EventSink,
    ) -> RetrievalOutcome {
        let slot = area.slot_for(index);
        let max_attempts = self.fetcher.policy().max_attempts;

        let fetched = self
            .fetcher
            .fetch(&target.location, &slot.path, |attempt, cause| {
                events.emit(PipelineEvent::AttemptFailed {
                    index,
                    label: target.label.clone(),
                    attempt,
                    max_attempts,
                    cause: cause.to_string(),
                });
            })
            .await;

        match fetched {
            Ok(report) => {
                events.emit(PipelineEvent::TargetFetched {
                    index,
                    label: target.label.clone(),
                    attempts: report.attempts,
                    bytes: report.bytes,
                });
                RetrievalOutcome::Success { slot, report }
            }
            Err(last_error) => RetrievalOutcome::Failed {
                index,
                target: target.clone(),
                last_error,
            },
        }
    }
}

/// Run blocking filesystem/PDF work without stalling the other tasks of a
/// multi-threaded runtime. On a current-thread runtime it runs inline.
fn off_worker<T>(work: impl FnOnce() -> T) -> T {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(work)
        }
        _ => work(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use aipbinder_shared::SilentSink;
    use url::Url;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::merger::MergeError;
    use crate::test_support::{page_markers, sample_pdf};

    fn fetch_config(max_attempts: u32, concurrency: usize) -> FetchConfig {
        FetchConfig {
            max_attempts,
            retry_delay: Duration::ZERO,
            timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            concurrency,
        }
    }

    fn pipeline(tmp: &Path, max_attempts: u32, concurrency: usize) -> Pipeline {
        let config = RunConfig {
            run_id: RunId::new(),
            output_path: tmp.join("out").join("UHHH.pdf"),
        };
        Pipeline::new(
            config,
            &fetch_config(max_attempts, concurrency),
            Stager::new(tmp.join("staging")),
        )
        .unwrap()
    }

    fn target(server: &MockServer, p: &str, label: &str) -> RetrievalTarget {
        RetrievalTarget::new(Url::parse(&format!("{}{p}", server.uri())).unwrap(), label)
    }

    async fn serve_pdf(server: &MockServer, p: &str, marker: &str) {
        Mock::given(method("GET"))
            .and(path(p))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(sample_pdf(&[marker])))
            .mount(server)
            .await;
    }

    async fn serve_status(server: &MockServer, p: &str, status: u16) {
        Mock::given(method("GET"))
            .and(path(p))
            .respond_with(ResponseTemplate::new(status))
            .mount(server)
            .await;
    }

    fn staging_is_clean(tmp: &Path) -> bool {
        let root = tmp.join("staging");
        !root.exists() || std::fs::read_dir(root).unwrap().next().is_none()
    }

    fn labels(targets: &[RetrievalTarget]) -> Vec<&str> {
        targets.iter().map(|t| t.label.as_str()).collect()
    }

    #[tokio::test]
    async fn all_targets_merged_in_order() {
        let server = MockServer::start().await;
        serve_pdf(&server, "/a.pdf", "A").await;
        serve_pdf(&server, "/b.pdf", "B").await;

        let tmp = tempfile::tempdir().unwrap();
        let pipeline = pipeline(tmp.path(), 3, 1);
        let targets = vec![
            target(&server, "/a.pdf", "a"),
            target(&server, "/b.pdf", "b"),
        ];

        let result = pipeline
            .run(&targets, &SilentSink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.total, 2);
        assert_eq!(result.succeeded_count, 2);
        assert!(result.failed_targets.is_empty());

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["succeeded_count"], 2);
        assert_eq!(json["run_id"], pipeline.run_id().to_string());

        let output = result.output.expect("output written");
        assert_eq!(page_markers(&output), ["A", "B"]);
        assert!(staging_is_clean(tmp.path()));
    }

    #[tokio::test]
    async fn failing_target_is_skipped() {
        let server = MockServer::start().await;
        serve_pdf(&server, "/a.pdf", "A").await;
        serve_status(&server, "/bad.pdf", 500).await;
        serve_pdf(&server, "/c.pdf", "C").await;

        let tmp = tempfile::tempdir().unwrap();
        let pipeline = pipeline(tmp.path(), 2, 1);
        let targets = vec![
            target(&server, "/a.pdf", "a"),
            target(&server, "/bad.pdf", "b"),
            target(&server, "/c.pdf", "c"),
        ];

        let result = pipeline
            .run(&targets, &SilentSink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.succeeded_count, 2);
        assert_eq!(result.failed_targets, vec![targets[1].clone()]);
        assert_eq!(result.failures[0].index, 1);
        assert!(result.failures[0].reason.contains("HTTP 500"));
        assert_eq!(
            result.succeeded_count + result.failed_targets.len(),
            targets.len()
        );
        assert_eq!(page_markers(&result.output.unwrap()), ["A", "C"]);

        let bad_requests = server
            .received_requests()
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.url.path() == "/bad.pdf")
            .count();
        assert_eq!(bad_requests, 2);
    }

    #[tokio::test]
    async fn all_failed_produces_no_output() {
        let server = MockServer::start().await;
        serve_status(&server, "/bad.pdf", 404).await;

        let tmp = tempfile::tempdir().unwrap();
        let pipeline = pipeline(tmp.path(), 2, 1);
        let targets = vec![target(&server, "/bad.pdf", "x")];

        let result = pipeline
            .run(&targets, &SilentSink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.succeeded_count, 0);
        assert_eq!(labels(&result.failed_targets), ["x"]);
        assert!(result.output.is_none());
        assert!(!tmp.path().join("out").join("UHHH.pdf").exists());
        assert!(staging_is_clean(tmp.path()));
    }

    #[tokio::test]
    async fn empty_input_creates_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let pipeline = pipeline(tmp.path(), 2, 1);

        let result = pipeline
            .run(&[], &SilentSink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.total, 0);
        assert_eq!(result.succeeded_count, 0);
        assert!(result.failed_targets.is_empty());
        assert!(result.output.is_none());
        assert!(!tmp.path().join("staging").exists());
    }

    #[tokio::test]
    async fn concurrent_fetches_keep_input_order() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/slow.pdf"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(sample_pdf(&["first"]))
                    .set_delay(Duration::from_millis(400)),
            )
            .mount(&server)
            .await;
        serve_pdf(&server, "/fast1.pdf", "second").await;
        serve_pdf(&server, "/fast2.pdf", "third").await;

        let tmp = tempfile::tempdir().unwrap();
        let pipeline = pipeline(tmp.path(), 1, 3);
        let targets = vec![
            target(&server, "/slow.pdf", "slow"),
            target(&server, "/fast1.pdf", "fast1"),
            target(&server, "/fast2.pdf", "fast2"),
        ];

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let result = pipeline
            .run(&targets, &tx, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            page_markers(&result.output.unwrap()),
            ["first", "second", "third"]
        );

        let mut merged = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let PipelineEvent::TargetMerged { index, .. } = event {
                merged.push(index);
            }
        }
        assert_eq!(merged, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn duplicate_locations_are_fetched_twice() {
        let server = MockServer::start().await;
        serve_pdf(&server, "/a.pdf", "A").await;

        let tmp = tempfile::tempdir().unwrap();
        let pipeline = pipeline(tmp.path(), 1, 2);
        let targets = vec![
            target(&server, "/a.pdf", "a"),
            target(&server, "/a.pdf", "a again"),
        ];

        let result = pipeline
            .run(&targets, &SilentSink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.succeeded_count, 2);
        assert_eq!(page_markers(&result.output.unwrap()), ["A", "A"]);
    }

    #[tokio::test]
    async fn unparseable_document_counts_as_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/html.pdf"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
            .mount(&server)
            .await;
        serve_pdf(&server, "/ok.pdf", "OK").await;

        let tmp = tempfile::tempdir().unwrap();
        let pipeline = pipeline(tmp.path(), 3, 1);
        let targets = vec![
            target(&server, "/html.pdf", "broken"),
            target(&server, "/ok.pdf", "ok"),
        ];

        let result = pipeline
            .run(&targets, &SilentSink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.succeeded_count, 1);
        assert_eq!(labels(&result.failed_targets), ["broken"]);
        assert!(result.failures[0].reason.contains("not a usable PDF"));
        // A bad document is not retried: the download itself succeeded.
        let html_requests = server
            .received_requests()
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.url.path() == "/html.pdf")
            .count();
        assert_eq!(html_requests, 1);
    }

    #[tokio::test]
    async fn events_report_attempts_and_failures() {
        let server = MockServer::start().await;
        serve_status(&server, "/bad.pdf", 503).await;

        let tmp = tempfile::tempdir().unwrap();
        let pipeline = pipeline(tmp.path(), 3, 1);
        let targets = vec![target(&server, "/bad.pdf", "bad")];

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        pipeline
            .run(&targets, &tx, &CancellationToken::new())
            .await
            .unwrap();

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }

        let attempts: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                PipelineEvent::AttemptFailed { attempt, .. } => Some(*attempt),
                _ => None,
            })
            .collect();
        assert_eq!(attempts, vec![1, 2, 3]);
        assert!(matches!(events.first(), Some(PipelineEvent::RunStarted { total: 1, .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, PipelineEvent::TargetFailed { index: 0, .. })));
        assert_eq!(
            events.last(),
            Some(&PipelineEvent::RunFinished {
                succeeded: 0,
                failed: 1
            })
        );
    }

    // -----------------------------------------------------------------------
    // Merger lifecycle
    // -----------------------------------------------------------------------

    /// Merger double that records every call.
    #[derive(Clone, Default)]
    struct RecordingMerger {
        calls: Arc<Mutex<Vec<String>>>,
        appended: usize,
        fail_finalize: bool,
    }

    impl RecordingMerger {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl DocumentMerger for RecordingMerger {
        fn append(&mut self, slot: &StagingSlot) -> std::result::Result<(), MergeError> {
            assert!(slot.path.exists(), "slot must be populated before append");
            self.calls.lock().unwrap().push(format!("append:{}", slot.index));
            self.appended += 1;
            Ok(())
        }

        fn has_content(&self) -> bool {
            self.appended > 0
        }

        fn finalize(&mut self, output: &Path) -> std::result::Result<PathBuf, MergeError> {
            self.calls.lock().unwrap().push("finalize".into());
            if self.fail_finalize {
                return Err(MergeError::Write {
                    path: output.to_path_buf(),
                    reason: "disk full".into(),
                });
            }
            Ok(output.to_path_buf())
        }

        fn close(&mut self) {
            self.calls.lock().unwrap().push("close".into());
        }
    }

    #[tokio::test]
    async fn all_failed_never_finalizes() {
        let server = MockServer::start().await;
        serve_status(&server, "/bad.pdf", 500).await;

        let tmp = tempfile::tempdir().unwrap();
        let pipeline = pipeline(tmp.path(), 1, 1);
        let merger = RecordingMerger::default();
        let targets = vec![
            target(&server, "/bad.pdf", "x"),
            target(&server, "/bad.pdf", "y"),
        ];

        let result = pipeline
            .run_with_merger(&targets, merger.clone(), &SilentSink, &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.output.is_none());
        assert_eq!(merger.calls(), ["close"]);
    }

    #[tokio::test]
    async fn merger_closed_once_after_finalize() {
        let server = MockServer::start().await;
        serve_pdf(&server, "/a.pdf", "A").await;

        let tmp = tempfile::tempdir().unwrap();
        let pipeline = pipeline(tmp.path(), 1, 1);
        let merger = RecordingMerger::default();
        let targets = vec![target(&server, "/a.pdf", "a")];

        pipeline
            .run_with_merger(&targets, merger.clone(), &SilentSink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(merger.calls(), ["append:0", "finalize", "close"]);
    }

    #[tokio::test]
    async fn output_failure_is_fatal_after_cleanup() {
        let server = MockServer::start().await;
        serve_pdf(&server, "/a.pdf", "A").await;

        let tmp = tempfile::tempdir().unwrap();
        let pipeline = pipeline(tmp.path(), 1, 1);
        let merger = RecordingMerger {
            fail_finalize: true,
            ..Default::default()
        };
        let targets = vec![target(&server, "/a.pdf", "a")];

        let err = pipeline
            .run_with_merger(&targets, merger.clone(), &SilentSink, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, AipBinderError::Output(ref msg) if msg.contains("disk full")));
        assert_eq!(merger.calls(), ["append:0", "finalize", "close"]);
        assert!(staging_is_clean(tmp.path()));
    }

    #[tokio::test]
    async fn unwritable_output_leaves_no_partial_file() {
        let server = MockServer::start().await;
        serve_pdf(&server, "/a.pdf", "A").await;

        let tmp = tempfile::tempdir().unwrap();
        let pipeline = pipeline(tmp.path(), 1, 1);
        let output = tmp.path().join("out").join("UHHH.pdf");
        std::fs::create_dir_all(&output).unwrap();
        let targets = vec![target(&server, "/a.pdf", "a")];

        let err = pipeline
            .run(&targets, &SilentSink, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, AipBinderError::Output(_)));
        assert!(output.is_dir());
        assert!(!tmp.path().join("out").join(".UHHH.pdf.tmp").exists());
        assert!(staging_is_clean(tmp.path()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn runs_on_multi_threaded_runtime() {
        let server = MockServer::start().await;
        serve_pdf(&server, "/a.pdf", "A").await;
        serve_pdf(&server, "/b.pdf", "B").await;

        let tmp = tempfile::tempdir().unwrap();
        let pipeline = pipeline(tmp.path(), 1, 2);
        let targets = vec![
            target(&server, "/a.pdf", "a"),
            target(&server, "/b.pdf", "b"),
        ];

        let result = pipeline
            .run(&targets, &SilentSink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(page_markers(&result.output.unwrap()), ["A", "B"]);
        assert!(staging_is_clean(tmp.path()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancelled_concurrent_run_removes_staging() {
        let server = MockServer::start().await;
        serve_pdf(&server, "/fast.pdf", "F").await;
        Mock::given(method("GET"))
            .and(path("/slow.pdf"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(sample_pdf(&["late"]))
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let pipeline = pipeline(tmp.path(), 1, 4);
        let targets = vec![
            target(&server, "/slow.pdf", "slow"),
            target(&server, "/fast.pdf", "f1"),
            target(&server, "/fast.pdf", "f2"),
            target(&server, "/slow.pdf", "slow again"),
        ];

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let err = pipeline
            .run(&targets, &SilentSink, &cancel)
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert!(staging_is_clean(tmp.path()));
    }

    #[tokio::test]
    async fn staging_failure_is_fatal_but_closes_merger() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("staging");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let pipeline = pipeline(tmp.path(), 1, 1);
        let merger = RecordingMerger::default();
        let targets = vec![RetrievalTarget::new(
            Url::parse("http://127.0.0.1:1/a.pdf").unwrap(),
            "a",
        )];

        let err = pipeline
            .run_with_merger(&targets, merger.clone(), &SilentSink, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, AipBinderError::Staging { .. }));
        assert_eq!(merger.calls(), ["close"]);
    }

    #[tokio::test]
    async fn cancelled_run_still_cleans_up() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(sample_pdf(&["late"]))
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let pipeline = pipeline(tmp.path(), 1, 1);
        let merger = RecordingMerger::default();
        let targets = vec![target(&server, "/a.pdf", "a")];

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = pipeline
            .run_with_merger(&targets, merger.clone(), &SilentSink, &cancel)
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(merger.calls(), ["close"]);
        assert!(staging_is_clean(tmp.path()));
        assert!(!tmp.path().join("out").join("UHHH.pdf").exists());
    }
}
