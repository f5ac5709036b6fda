//! Two-stage rendering: part filter, then pager.
//!
//! The chosen part is sanitized into an owned copy, piped through the first
//! matching filter command (or `cat`) with `WIDTH`, `HEIGHT` and `MIMETYPE`
//! set, and once the filter has exited the pager is started with the allowed
//! headers followed by the filter's output on its stdin.

use std::{sync::Arc, time::Duration};

use {
    mimeview_common::{Header, Message, MessagePart},
    mimeview_config::{MimeviewConfig, ViewerConfig},
    tracing::{debug, error, warn},
};

use crate::{
    error::Result,
    sanitize::sanitized,
    selector::select_part,
    session::Session,
    subprocess::{Capture, Completion, ProcessId, Spawner, Started, Subprocess, TokioSpawner},
};

/// Filter used when no configured rule matches the part.
pub const PASSTHROUGH_FILTER: &str = "cat";

/// How a render request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// No part of the message can be rendered; nothing was started.
    NoRenderablePart,
    /// The pager is running and is the session's active viewer.
    ViewerLaunched(ProcessId),
    /// The session was torn down before the pager could be shown.
    Cancelled,
}

/// Lifecycle of a single render request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestState {
    Created,
    Sanitized,
    Preprocessing,
    PreprocessComplete,
    ViewerLaunched,
    Released,
}

/// Everything one render request needs, alive until the pager is started.
struct PipelineRequest<'a> {
    session: &'a Arc<Session>,
    message: &'a Message,
    part: &'a MessagePart,
    content: Vec<u8>,
    state: RequestState,
}

impl<'a> PipelineRequest<'a> {
    fn new(session: &'a Arc<Session>, message: &'a Message, part: &'a MessagePart) -> Self {
        Self {
            session,
            message,
            part,
            content: Vec::new(),
            state: RequestState::Created,
        }
    }

    fn advance(&mut self, next: RequestState) {
        debug!(session = self.session.name(), from = ?self.state, to = ?next, "render request");
        self.state = next;
    }

    /// Sanitize into an owned copy; the message itself is left as parsed.
    fn sanitize(&mut self) {
        self.content = sanitized(&self.part.content);
        debug!(
            before = self.part.size(),
            after = self.content.len(),
            "sanitized part content"
        );
        self.advance(RequestState::Sanitized);
    }

    fn release(mut self) {
        self.advance(RequestState::Released);
    }
}

enum Preprocessed {
    /// Empty input: no filter was run.
    Skipped,
    Finished(Completion),
    Cancelled,
}

/// Header lines for the pager, collected in message order.
struct HeaderBlock<'a> {
    viewer: &'a ViewerConfig,
    bytes: Vec<u8>,
}

impl<'a> HeaderBlock<'a> {
    fn new(viewer: &'a ViewerConfig) -> Self {
        Self {
            viewer,
            bytes: Vec::new(),
        }
    }

    fn push(&mut self, header: &Header) {
        if self.viewer.shows_header(&header.key) {
            self.bytes
                .extend_from_slice(format!("{}: {}\n", header.key, header.value).as_bytes());
        }
    }

    fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Runs render requests for sessions against a [`Spawner`].
pub struct ViewerLauncher {
    config: Arc<MimeviewConfig>,
    spawner: Arc<dyn Spawner>,
}

impl ViewerLauncher {
    pub fn new(config: Arc<MimeviewConfig>, spawner: Arc<dyn Spawner>) -> Self {
        Self { config, spawner }
    }

    /// A launcher that spawns real processes.
    pub fn with_tokio(config: MimeviewConfig) -> Self {
        Self::new(Arc::new(config), Arc::new(TokioSpawner::new()))
    }

    pub fn config(&self) -> &MimeviewConfig {
        &self.config
    }

    /// Render `message` in `session`.
    ///
    /// Returns once the pager has been started, or earlier when there is
    /// nothing to render or the session was torn down meanwhile. Failing to
    /// start the filter or the pager is an error and leaves no process
    /// registered for this request.
    pub async fn launch(&self, session: &Arc<Session>, message: &Message) -> Result<LaunchOutcome> {
        let viewer = &self.config.viewer;
        let Some(part) = select_part(message, &viewer.alternatives, viewer.alternative_policy)
        else {
            debug!(session = session.name(), parts = message.parts.len(), "no renderable part");
            return Ok(LaunchOutcome::NoRenderablePart);
        };

        let _render = session.lock_render().await;
        let mut request = PipelineRequest::new(session, message, part);
        request.sanitize();

        let output = match self.preprocess(&mut request).await? {
            Preprocessed::Skipped => None,
            Preprocessed::Finished(completion) => completion.stdout,
            Preprocessed::Cancelled => return Ok(LaunchOutcome::Cancelled),
        };

        let Some(id) = self.start_viewer(&mut request, output).await? else {
            return Ok(LaunchOutcome::Cancelled);
        };
        request.release();
        Ok(LaunchOutcome::ViewerLaunched(id))
    }

    async fn preprocess(&self, request: &mut PipelineRequest<'_>) -> Result<Preprocessed> {
        let part = request.part;
        let geometry = request.session.display().geometry();
        let mimetype = part.mime_type().to_string();
        let command = self
            .config
            .filter_for(&part.type_, &part.subtype)
            .map_or(PASSTHROUGH_FILTER, |rule| rule.command.as_str());

        if request.content.is_empty() {
            debug!(%mimetype, "empty part, skipping filter");
            return Ok(Preprocessed::Skipped);
        }

        debug!(%mimetype, command, width = geometry.width, height = geometry.height, "preprocessing part");
        let viewer = &self.config.viewer;
        let mut process = Subprocess::shell(&viewer.shell, command, Capture::ALL)
            .with_env("WIDTH", geometry.width.to_string())
            .with_env("HEIGHT", geometry.height.to_string())
            .with_env("MIMETYPE", mimetype)
            .with_timeout(viewer.preprocess_timeout_secs.map(Duration::from_secs))
            .with_capture_limit(viewer.max_capture_bytes);
        process.queue_stdin(std::mem::take(&mut request.content));

        let Started { handle, completion } = self.spawner.start(process)?;
        let id = handle.id();
        if !request.session.register(handle).await {
            return Ok(Preprocessed::Cancelled);
        }
        request.advance(RequestState::Preprocessing);

        let result = completion.await;
        request.session.release(id).await;

        match result {
            Ok(done) => {
                log_filter_result(command, &done);
                Ok(Preprocessed::Finished(done))
            },
            Err(_) => {
                debug!(%id, "filter terminated before completing");
                Ok(Preprocessed::Cancelled)
            },
        }
    }

    async fn start_viewer(
        &self,
        request: &mut PipelineRequest<'_>,
        output: Option<Vec<u8>>,
    ) -> Result<Option<ProcessId>> {
        request.advance(RequestState::PreprocessComplete);
        let session = request.session;
        if session.is_closed() {
            debug!(session = session.name(), "session closed, not starting viewer");
            return Ok(None);
        }
        let viewer = &self.config.viewer;

        let mut headers = HeaderBlock::new(viewer);
        for header in &request.message.headers {
            headers.push(header);
        }

        let mut process = Subprocess::shell(&viewer.shell, &viewer.pager, Capture::NONE);
        process.queue_stdin(headers.into_bytes());
        if let Some(output) = output {
            process.queue_stdin(output);
        }

        let Started { handle, completion } = self.spawner.start(process).map_err(|e| {
            error!(pager = %viewer.pager, error = %e, "failed to start viewer");
            e.into_viewer_error()
        })?;
        let id = handle.id();
        if !session.set_active_viewer(handle).await {
            return Ok(None);
        }
        request.advance(RequestState::ViewerLaunched);

        let reaper = Arc::clone(session);
        tokio::spawn(async move {
            if let Ok(done) = completion.await {
                debug!(id = %done.id, exit_code = ?done.exit_code, "viewer finished");
                reaper.viewer_exited(done.id).await;
            }
        });

        session.display().request_rerender();
        Ok(Some(id))
    }
}

fn log_filter_result(command: &str, done: &Completion) {
    if done.timed_out {
        warn!(id = %done.id, command, "filter timed out, showing partial output");
    } else if !done.success() {
        warn!(id = %done.id, command, exit_code = ?done.exit_code, "filter exited unsuccessfully");
    }
    if let Some(stderr) = done.stderr.as_deref().filter(|s| !s.is_empty()) {
        debug!(id = %done.id, stderr = %String::from_utf8_lossy(stderr).trim_end(), "filter stderr");
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            error::Error,
            session::{DisplaySurface, Geometry},
            subprocess::ProcessHandle,
        },
        mimeview_common::MimeType,
        mimeview_config::FilterRule,
        std::sync::{
            Mutex,
            atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        },
        tokio::sync::oneshot,
    };

    // ── Test doubles ────────────────────────────────────────────────────────

    struct RecordingDisplay {
        rerenders: AtomicUsize,
    }

    impl RecordingDisplay {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                rerenders: AtomicUsize::new(0),
            })
        }

        fn rerenders(&self) -> usize {
            self.rerenders.load(Ordering::SeqCst)
        }
    }

    impl DisplaySurface for RecordingDisplay {
        fn geometry(&self) -> Geometry {
            Geometry {
                width: 100,
                height: 40,
            }
        }

        fn request_rerender(&self) {
            self.rerenders.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Filters behave like `cat` and finish immediately; pagers stay
    /// running until `finish_viewers` is called.
    #[derive(Default)]
    struct FakeSpawner {
        next_id: AtomicU64,
        started: Mutex<Vec<Subprocess>>,
        running_viewers: Mutex<Vec<(ProcessId, oneshot::Sender<Completion>)>>,
        fail_filter: AtomicBool,
        fail_viewer: AtomicBool,
    }

    impl FakeSpawner {
        fn started(&self) -> Vec<Subprocess> {
            self.started.lock().unwrap().clone()
        }

        fn finish_viewers(&self) {
            for (id, tx) in self.running_viewers.lock().unwrap().drain(..) {
                let _ = tx.send(Completion {
                    id,
                    exit_code: Some(0),
                    ..Default::default()
                });
            }
        }
    }

    impl Spawner for FakeSpawner {
        fn start(&self, process: Subprocess) -> Result<Started> {
            let is_viewer = process.capture() == Capture::NONE;
            let fail = if is_viewer {
                &self.fail_viewer
            } else {
                &self.fail_filter
            };
            if fail.load(Ordering::SeqCst) {
                return Err(Error::spawn(
                    process.command_line(),
                    std::io::Error::other("no more processes"),
                ));
            }

            let id = ProcessId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
            let (done_tx, done_rx) = oneshot::channel();
            let (kill_tx, kill_rx) = oneshot::channel::<()>();
            let driver = tokio::spawn(async move {
                let _ = kill_rx.await;
            });

            if is_viewer {
                self.running_viewers.lock().unwrap().push((id, done_tx));
            } else {
                let _ = done_tx.send(Completion {
                    id,
                    exit_code: Some(0),
                    timed_out: false,
                    stdout: Some(process.stdin_bytes()),
                    stderr: Some(Vec::new()),
                });
            }

            let label = process.command_line();
            self.started.lock().unwrap().push(process);
            Ok(Started {
                handle: ProcessHandle::new(id, None, label, kill_tx, driver),
                completion: done_rx,
            })
        }
    }

    // ── Fixtures ────────────────────────────────────────────────────────────

    fn config() -> MimeviewConfig {
        let mut cfg = MimeviewConfig::default();
        cfg.viewer.show_headers = vec!["From".into(), "Subject".into()];
        cfg
    }

    fn message(type_: &str, subtype: &str, content: &[u8]) -> Message {
        Message::new(
            vec![
                Header::new("From", "a@x"),
                Header::new("Subject", "hi"),
                Header::new("X-Skip", "z"),
            ],
            vec![MessagePart::new(type_, subtype, content.to_vec())],
        )
    }

    struct Harness {
        spawner: Arc<FakeSpawner>,
        display: Arc<RecordingDisplay>,
        session: Arc<Session>,
        launcher: ViewerLauncher,
    }

    fn harness(config: MimeviewConfig) -> Harness {
        let spawner = Arc::new(FakeSpawner::default());
        let display = RecordingDisplay::new();
        let session = Arc::new(Session::new("test", display.clone()));
        let launcher = ViewerLauncher::new(Arc::new(config), spawner.clone());
        Harness {
            spawner,
            display,
            session,
            launcher,
        }
    }

    fn env_of<'a>(process: &'a Subprocess, key: &str) -> Option<&'a str> {
        process
            .env()
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    // ── Tests ───────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn end_to_end_passthrough() {
        let h = harness(config());
        let msg = message("text", "plain", b"hello\x1bworld");

        let outcome = h.launcher.launch(&h.session, &msg).await.unwrap();
        let LaunchOutcome::ViewerLaunched(viewer_id) = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };

        let started = h.spawner.started();
        assert_eq!(started.len(), 2);

        let filter = &started[0];
        assert_eq!(filter.argv(), ["sh", "-c", "cat"]);
        assert_eq!(filter.capture(), Capture::ALL);
        assert_eq!(filter.stdin_bytes(), b"helloworld");
        assert_eq!(env_of(filter, "WIDTH"), Some("100"));
        assert_eq!(env_of(filter, "HEIGHT"), Some("40"));
        assert_eq!(env_of(filter, "MIMETYPE"), Some("text/plain"));

        let pager = &started[1];
        assert_eq!(pager.argv(), ["sh", "-c", "less -R"]);
        assert_eq!(pager.capture(), Capture::NONE);
        assert_eq!(pager.stdin_bytes(), b"From: a@x\nSubject: hi\nhelloworld");
        let chunks = pager.stdin_chunks().unwrap();
        assert_eq!(chunks[0], b"From: a@x\nSubject: hi\n");
        assert_eq!(chunks[1], b"helloworld");

        assert_eq!(h.session.active_viewer(), Some(viewer_id));
        assert_eq!(h.session.process_ids().await, vec![viewer_id]);
        assert_eq!(h.display.rerenders(), 1);
        // The parsed message keeps its original bytes.
        assert_eq!(msg.parts[0].content, b"hello\x1bworld");
    }

    #[tokio::test]
    async fn uses_first_matching_filter_rule() {
        let mut cfg = config();
        cfg.filters = vec![
            FilterRule::new(MimeType::new("image", "*"), "catimg -"),
            FilterRule::new(MimeType::new("text", "*"), "fold -w \"$WIDTH\""),
            FilterRule::new(MimeType::new("text", "html"), "w3m -T text/html"),
        ];
        cfg.viewer.alternatives = vec![MimeType::new("text", "html")];
        let h = harness(cfg);

        h.launcher
            .launch(&h.session, &message("text", "html", b"<p>x</p>"))
            .await
            .unwrap();
        let started = h.spawner.started();
        assert_eq!(started[0].argv()[2], "fold -w \"$WIDTH\"");
        assert_eq!(env_of(&started[0], "MIMETYPE"), Some("text/html"));
    }

    #[tokio::test]
    async fn empty_part_skips_filter() {
        let h = harness(config());
        let outcome = h
            .launcher
            .launch(&h.session, &message("text", "plain", b""))
            .await
            .unwrap();
        assert!(matches!(outcome, LaunchOutcome::ViewerLaunched(_)));

        let started = h.spawner.started();
        assert_eq!(started.len(), 1, "only the pager should start");
        assert_eq!(started[0].argv()[2], "less -R");
        assert_eq!(started[0].stdin_bytes(), b"From: a@x\nSubject: hi\n");
        assert_eq!(started[0].stdin_chunks().unwrap().len(), 1);
        assert_eq!(h.display.rerenders(), 1);
    }

    #[tokio::test]
    async fn part_emptied_by_sanitizing_skips_filter() {
        let h = harness(config());
        h.launcher
            .launch(&h.session, &message("text", "plain", b"\x1b\x00\x7f"))
            .await
            .unwrap();
        assert_eq!(h.spawner.started().len(), 1);
    }

    #[tokio::test]
    async fn no_renderable_part_does_nothing() {
        let h = harness(config());
        let outcome = h
            .launcher
            .launch(&h.session, &message("image", "png", b"\x89PNG"))
            .await
            .unwrap();
        assert_eq!(outcome, LaunchOutcome::NoRenderablePart);
        assert!(h.spawner.started().is_empty());
        assert_eq!(h.display.rerenders(), 0);
        assert_eq!(h.session.active_viewer(), None);
    }

    #[tokio::test]
    async fn filter_spawn_failure_leaves_no_state() {
        let h = harness(config());
        h.spawner.fail_filter.store(true, Ordering::SeqCst);
        let err = h
            .launcher
            .launch(&h.session, &message("text", "plain", b"body"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Spawn { .. }), "{err}");
        assert_eq!(h.session.process_count().await, 0);
        assert_eq!(h.session.active_viewer(), None);
        assert_eq!(h.display.rerenders(), 0);
    }

    #[tokio::test]
    async fn viewer_spawn_failure_is_reported() {
        let h = harness(config());
        h.spawner.fail_viewer.store(true, Ordering::SeqCst);
        let err = h
            .launcher
            .launch(&h.session, &message("text", "plain", b"body"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ViewerSpawn { .. }), "{err}");
        assert!(err.to_string().contains("less -R"));
        assert_eq!(h.session.process_count().await, 0);
        assert_eq!(h.session.active_viewer(), None);
    }

    #[tokio::test]
    async fn second_launch_supersedes_viewer() {
        let h = harness(config());
        let msg = message("text", "plain", b"body");
        let LaunchOutcome::ViewerLaunched(first) = h.launcher.launch(&h.session, &msg).await.unwrap()
        else {
            panic!("first launch failed");
        };
        let LaunchOutcome::ViewerLaunched(second) =
            h.launcher.launch(&h.session, &msg).await.unwrap()
        else {
            panic!("second launch failed");
        };
        assert_ne!(first, second);
        assert_eq!(h.session.active_viewer(), Some(second));
        assert_eq!(h.session.process_ids().await, vec![second]);
        assert_eq!(h.display.rerenders(), 2);
    }

    #[tokio::test]
    async fn viewer_exit_clears_active_viewer() {
        let h = harness(config());
        h.launcher
            .launch(&h.session, &message("text", "plain", b"body"))
            .await
            .unwrap();
        h.spawner.finish_viewers();
        h.session.wait_viewer_closed().await;
        // Let the reaper finish its bookkeeping.
        while h.session.process_count().await > 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(h.session.active_viewer(), None);
    }

    #[tokio::test]
    async fn teardown_after_launch() {
        let h = harness(config());
        h.launcher
            .launch(&h.session, &message("text", "plain", b"body"))
            .await
            .unwrap();
        h.session.teardown().await;
        assert_eq!(h.session.process_count().await, 0);
        assert_eq!(h.session.active_viewer(), None);
    }

    #[tokio::test]
    async fn launch_into_torn_down_session_is_cancelled() {
        let h = harness(config());
        h.session.teardown().await;

        let outcome = h
            .launcher
            .launch(&h.session, &message("text", "plain", b"body"))
            .await
            .unwrap();
        assert_eq!(outcome, LaunchOutcome::Cancelled);
        // The filter was started but refused on registration; no pager follows.
        assert_eq!(h.spawner.started().len(), 1);
        assert_eq!(h.session.process_count().await, 0);
        assert_eq!(h.session.active_viewer(), None);
        assert_eq!(h.display.rerenders(), 0);

        let outcome = h
            .launcher
            .launch(&h.session, &message("text", "plain", b""))
            .await
            .unwrap();
        assert_eq!(outcome, LaunchOutcome::Cancelled);
        assert_eq!(h.spawner.started().len(), 1);
    }

    #[test]
    fn header_block_filters_and_keeps_order() {
        let mut viewer = ViewerConfig::default();
        viewer.show_headers = vec!["Subject".to_string(), "From".to_string()];
        let mut block = HeaderBlock::new(&viewer);
        for header in [
            Header::new("From", "a@x"),
            Header::new("X-Skip", "z"),
            Header::new("subject", "wrong case"),
            Header::new("Subject", "hi"),
        ] {
            block.push(&header);
        }
        assert_eq!(block.into_bytes(), b"From: a@x\nSubject: hi\n");
    }

    // ── Real processes ──────────────────────────────────────────────────────

    async fn run_real(cfg: MimeviewConfig, msg: &Message) -> LaunchOutcome {
        let session = Arc::new(Session::new("real", RecordingDisplay::new()));
        let launcher = ViewerLauncher::with_tokio(cfg);
        let outcome = launcher.launch(&session, msg).await.unwrap();
        session.wait_viewer_closed().await;
        outcome
    }

    #[tokio::test]
    async fn real_processes_filter_then_pager() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("pager.out");
        let mut cfg = config();
        cfg.viewer.pager = format!("cat > '{}'", out.display());
        cfg.filters = vec![FilterRule::new(
            MimeType::new("text", "plain"),
            "tr a-z A-Z; printf ' %sx%s' \"$WIDTH\" \"$HEIGHT\"",
        )];

        let outcome = run_real(cfg, &message("text", "plain", b"hello\x1bworld")).await;
        assert!(matches!(outcome, LaunchOutcome::ViewerLaunched(_)));
        let written = std::fs::read(&out).unwrap();
        assert_eq!(written, b"From: a@x\nSubject: hi\nHELLOWORLD 100x40");
    }

    #[tokio::test]
    async fn teardown_during_filter_cancels_request() {
        let mut cfg = config();
        cfg.filters = vec![FilterRule::new(
            MimeType::new("text", "plain"),
            "exec sleep 30",
        )];
        let session = Arc::new(Session::new("real", RecordingDisplay::new()));
        let launcher = Arc::new(ViewerLauncher::with_tokio(cfg));

        let task = {
            let (session, launcher) = (Arc::clone(&session), Arc::clone(&launcher));
            tokio::spawn(async move {
                let msg = message("text", "plain", b"body");
                launcher.launch(&session, &msg).await
            })
        };
        while session.process_count().await == 0 {
            tokio::task::yield_now().await;
        }
        session.teardown().await;

        assert_eq!(task.await.unwrap().unwrap(), LaunchOutcome::Cancelled);
        assert_eq!(session.process_count().await, 0);
        assert_eq!(session.active_viewer(), None);
    }

    #[tokio::test]
    async fn failing_filter_output_still_reaches_pager() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("pager.out");
        let mut cfg = config();
        cfg.viewer.show_headers.clear();
        cfg.viewer.pager = format!("cat > '{}'", out.display());
        cfg.filters = vec![FilterRule::new(
            MimeType::new("text", "*"),
            "printf partial; echo oops >&2; exit 7",
        )];

        run_real(cfg, &message("text", "plain", b"ignored")).await;
        assert_eq!(std::fs::read(&out).unwrap(), b"partial");
    }
}
