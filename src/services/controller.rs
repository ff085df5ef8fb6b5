use crate::config::Config;
use crate::error::ControlError;
use crate::media::{BlackFrameProbe, ProbeOutcome, StartOffset, TrimError, Trimmer, args};
use crate::messages::DeviceState;
use crate::ownership::Ownership;
use crate::process::{self, ProcessError, ProcessHandle};
use crate::status::{self, StatusPublisher};
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::task::TaskTracker;

/// Arbitrates the single capture pipeline between still captures and recordings.
///
/// All state transitions happen inside one mutex-guarded section, so a
/// check-then-act race between two commands cannot start a second recording.
/// Every accepted recording gets exactly one completion task; that task is the
/// only place a recording is declared finished, whether it ran out its
/// duration, was stopped, or failed.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<Inner>,
}

struct Inner {
    ffmpeg: PathBuf,
    stream_url: String,
    captures_dir: PathBuf,
    capture_timeout: Duration,
    probe: BlackFrameProbe,
    trimmer: Trimmer,
    ownership: Ownership,
    status: Arc<dyn StatusPublisher>,
    shared: Mutex<Shared>,
    state_tx: watch::Sender<DeviceState>,
    tasks: TaskTracker,
}

struct Shared {
    state: DeviceState,
    recording: Option<ActiveRecording>,
    next_job: u64,
}

/// What the guarded section knows about the recording in flight
struct ActiveRecording {
    id: u64,
    stop_tx: mpsc::Sender<StopRequest>,
}

struct StopRequest {
    reply: oneshot::Sender<Result<StopAck, ProcessError>>,
}

enum StopAck {
    Signalled,
    AlreadyStopping,
    /// The process already exited and the job is winding down
    Finishing,
}

impl StopAck {
    fn notice(&self) -> &'static str {
        match self {
            StopAck::Signalled => "Recording stopping...",
            StopAck::AlreadyStopping => "Recording already stopping...",
            StopAck::Finishing => "Recording already finishing",
        }
    }
}

/// One still capture
struct CaptureJob {
    path: PathBuf,
    source: String,
}

/// One recording, owned by its completion task
struct RecordingJob {
    id: u64,
    path: PathBuf,
    handle: ProcessHandle,
    stop_rx: mpsc::Receiver<StopRequest>,
    resume: DeviceState,
}

/// Puts the state back when a still capture ends, however it ends
struct CaptureLease {
    inner: Arc<Inner>,
    resume: DeviceState,
}

impl Drop for CaptureLease {
    fn drop(&mut self) {
        let mut shared = self.inner.lock();
        if shared.state == DeviceState::Capturing {
            self.inner.set_state(&mut shared, self.resume);
        }
    }
}

impl Controller {
    pub fn new(config: &Config, status: Arc<dyn StatusPublisher>) -> Self {
        let (state_tx, _state_rx) = watch::channel(DeviceState::Idle);

        Self {
            inner: Arc::new(Inner {
                ffmpeg: config.ffmpeg_path.clone(),
                stream_url: config.stream_url.clone(),
                captures_dir: std::path::absolute(&config.captures_dir)
                    .unwrap_or_else(|_| config.captures_dir.clone()),
                capture_timeout: config.capture_timeout(),
                probe: BlackFrameProbe::new(config.probe_settings()),
                trimmer: Trimmer::new(config.ffmpeg_path.clone(), config.trim_timeout()),
                ownership: Ownership::new(config.fix_ownership, config.control_timeout()),
                status,
                shared: Mutex::new(Shared {
                    state: DeviceState::Idle,
                    recording: None,
                    next_job: 0,
                }),
                state_tx,
                tasks: TaskTracker::new(),
            }),
        }
    }

    pub fn state(&self) -> DeviceState {
        self.inner.lock().state
    }

    pub fn subscribe(&self) -> watch::Receiver<DeviceState> {
        self.inner.state_tx.subscribe()
    }

    /// The relay is up: `Idle -> Streaming`, once per process lifetime
    pub fn mark_streaming(&self) {
        let mut shared = self.inner.lock();
        if shared.state == DeviceState::Idle {
            self.inner.set_state(&mut shared, DeviceState::Streaming);
        }
    }

    pub async fn capture_picture(&self) -> Result<PathBuf, ControlError> {
        let lease = match self.inner.begin_capture() {
            Ok(lease) => lease,
            Err(e) => {
                self.inner.publish(status::error(e.to_string())).await;
                return Err(e);
            }
        };

        let job = CaptureJob {
            path: unique_capture_path(&self.inner.captures_dir, "picture", "jpg", Local::now()),
            source: self.inner.stream_url.clone(),
        };

        // Same warm-up as a recording even though stills are never trimmed
        let outcome = self.inner.probe.detect_start_offset().await;
        resolve_offset(outcome);

        self.inner.publish("Image capturing started now!").await;

        let result = process::run_sync(
            &self.inner.ffmpeg,
            args::still_args(&job.source, &job.path),
            self.inner.capture_timeout,
        )
        .await;
        drop(lease);

        let detail = match result {
            Ok(output) if output.success() => {
                self.inner.ownership.fix(&job.path).await;
                self.inner
                    .publish(status::success(format!("Image saved to {}", job.path.display())))
                    .await;
                return Ok(job.path);
            }
            Ok(output) => status::quote_output(&output.output),
            Err(ProcessError::TimedOut {
                timeout, output, ..
            }) => format!(
                "no frame within {:?}: {}",
                timeout,
                status::quote_output(&output)
            ),
            Err(e) => e.to_string(),
        };

        self.inner
            .publish(status::error(format!("Capture failed: {}", detail)))
            .await;
        Err(ControlError::SubprocessFailure {
            what: "still capture",
            detail,
        })
    }

    /// Start recording and return as soon as the process runs.
    ///
    /// `duration` is handed to ffmpeg as its own stop condition.
    pub async fn start_recording(&self, duration: Option<Duration>) -> Result<PathBuf, ControlError> {
        let job = match self.inner.begin_recording(duration) {
            Ok(job) => job,
            Err(e) => {
                let message = match &e {
                    ControlError::SubprocessFailure { detail, .. } => {
                        format!("Failed to start recording: {}", detail)
                    }
                    other => other.to_string(),
                };
                self.inner.publish(status::error(message)).await;
                return Err(e);
            }
        };

        let path = job.path.clone();
        tracing::info!(job = job.id, pid = ?job.handle.id(), ?duration, "Recording to {:?}", path);

        // The completion task exists from here on, so the process is always
        // supervised and stop requests are served even while the probe runs.
        let (offset_tx, offset_rx) = oneshot::channel();
        let inner = self.inner.clone();
        self.inner
            .tasks
            .spawn(async move { inner.complete_recording(job, offset_rx).await });

        let offset = resolve_offset(self.inner.probe.detect_start_offset().await);

        self.inner
            .publish(format!("Recording started: {}", path.display()))
            .await;

        // Sent after "started" so "stopped" can never be published before it
        let _ = offset_tx.send(offset);

        Ok(path)
    }

    /// Ask the running recording to stop. Completion is reported by its task.
    pub async fn stop_recording(&self) -> Result<(), ControlError> {
        let stop_tx = {
            let shared = self.inner.lock();
            match (shared.state, shared.recording.as_ref()) {
                (DeviceState::Recording, Some(active)) => Some(active.stop_tx.clone()),
                _ => None,
            }
        };

        let Some(stop_tx) = stop_tx else {
            let e = ControlError::RejectedByState {
                state: self.state(),
                reason: "No recording in progress",
            };
            self.inner.publish(status::error(e.to_string())).await;
            return Err(e);
        };

        let (reply, reply_rx) = oneshot::channel();
        let ack = match stop_tx.send(StopRequest { reply }).await {
            Ok(()) => reply_rx.await.ok(),
            Err(_) => None,
        };

        match ack {
            // The completion task publishes the notice, after "Recording started"
            Some(Ok(ack)) => {
                tracing::debug!("Stop acknowledged: {}", ack.notice());
                Ok(())
            }
            Some(Err(e)) => {
                self.inner
                    .publish(status::error(format!("Failed to stop recording: {}", e)))
                    .await;
                Err(ControlError::SubprocessFailure {
                    what: "stop signal",
                    detail: e.to_string(),
                })
            }
            // The process exited on its own before the request was served
            None => {
                self.inner.publish("Recording already finishing").await;
                Ok(())
            }
        }
    }

    /// Stop any recording and wait for every completion task to finish its trim.
    pub async fn shutdown(&self) {
        if self.state() == DeviceState::Recording {
            let _ = self.stop_recording().await;
        }

        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        self.inner.tasks.reopen();
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        // Plain state with no invariants spanning a panic, so poisoning is ignored
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, shared: &mut Shared, state: DeviceState) {
        tracing::debug!("Device state {:?} -> {:?}", shared.state, state);
        shared.state = state;
        self.state_tx.send_replace(state);
    }

    async fn publish(&self, message: impl AsRef<str>) {
        self.status.publish(message.as_ref()).await;
    }

    fn begin_capture(self: &Arc<Self>) -> Result<CaptureLease, ControlError> {
        let mut shared = self.lock();
        let resume = shared.state;

        match resume {
            DeviceState::Recording => Err(ControlError::RejectedByState {
                state: resume,
                reason: "Recording in progress, cannot capture picture",
            }),
            DeviceState::Capturing => Err(ControlError::RejectedByState {
                state: resume,
                reason: "Capture already in progress",
            }),
            DeviceState::Idle | DeviceState::Streaming => {
                self.set_state(&mut shared, DeviceState::Capturing);
                Ok(CaptureLease {
                    inner: Arc::clone(self),
                    resume,
                })
            }
        }
    }

    /// Check, spawn and register in one guarded section.
    fn begin_recording(&self, duration: Option<Duration>) -> Result<RecordingJob, ControlError> {
        let mut shared = self.lock();
        let resume = shared.state;

        match resume {
            DeviceState::Recording => {
                return Err(ControlError::RejectedByState {
                    state: resume,
                    reason: "Recording already in progress",
                });
            }
            DeviceState::Capturing => {
                return Err(ControlError::RejectedByState {
                    state: resume,
                    reason: "Capture in progress, try again shortly",
                });
            }
            DeviceState::Idle | DeviceState::Streaming => {}
        }

        let path = unique_capture_path(&self.captures_dir, "video", "mp4", Local::now());
        let handle = process::start(
            &self.ffmpeg,
            args::record_args(&self.stream_url, duration, &path),
        )
        .map_err(|e| ControlError::SubprocessFailure {
            what: "recording",
            detail: e.to_string(),
        })?;

        shared.next_job += 1;
        let id = shared.next_job;
        let (stop_tx, stop_rx) = mpsc::channel(4);
        shared.recording = Some(ActiveRecording { id, stop_tx });
        self.set_state(&mut shared, DeviceState::Recording);

        Ok(RecordingJob {
            id,
            path,
            handle,
            stop_rx,
            resume,
        })
    }

    /// Clear the job and leave `Recording`, only if `id` is still the active job
    fn finish_recording(&self, id: u64, resume: DeviceState) {
        let mut shared = self.lock();
        if shared.recording.as_ref().is_some_and(|active| active.id == id) {
            shared.recording = None;
            self.set_state(&mut shared, resume);
        }
    }

    async fn complete_recording(
        self: Arc<Self>,
        mut job: RecordingJob,
        mut offset_rx: oneshot::Receiver<StartOffset>,
    ) {
        let mut stop_requested = false;
        // A dropped sender means the starting command went away; no offset then
        let mut offset = None;
        // Stop notices are held until "Recording started" is out
        let mut notices: Vec<&'static str> = Vec::new();

        let exit = loop {
            tokio::select! {
                status = job.handle.exited() => break status,
                Some(request) = job.stop_rx.recv() => {
                    let ack = if stop_requested {
                        Ok(StopAck::AlreadyStopping)
                    } else {
                        job.handle.interrupt().map(|_| StopAck::Signalled)
                    };
                    if let Ok(ack) = &ack {
                        stop_requested = true;
                        notices.push(ack.notice());
                    }
                    let _ = request.reply.send(ack);
                }
                received = &mut offset_rx, if offset.is_none() => {
                    offset = Some(received.unwrap_or(StartOffset::ZERO));
                }
            }

            if offset.is_some() {
                for notice in notices.drain(..) {
                    self.publish(notice).await;
                }
            }
        };

        let RecordingJob {
            id,
            path,
            handle,
            mut stop_rx,
            resume,
        } = job;

        let failure = match exit {
            Ok(exit_status) => {
                let output = handle.finish(exit_status).await;
                // ffmpeg exits non-zero when interrupted, which is how a stop ends
                if output.success() || stop_requested {
                    None
                } else {
                    Some(format!("{}: {}", output.status, status::quote_output(&output.output)))
                }
            }
            Err(e) => Some(e.to_string()),
        };

        let offset = match offset {
            Some(offset) => offset,
            None => loop {
                tokio::select! {
                    received = &mut offset_rx => break received.unwrap_or(StartOffset::ZERO),
                    Some(request) = stop_rx.recv() => {
                        let _ = request.reply.send(Ok(StopAck::Finishing));
                        notices.push(StopAck::Finishing.notice());
                    }
                }
            },
        };
        // Stops from here on find no receiver and report the recording as finishing
        drop(stop_rx);
        for notice in notices.drain(..) {
            self.publish(notice).await;
        }

        self.finish_recording(id, resume);

        if let Some(detail) = &failure {
            tracing::error!(job = id, "Recording process failed: {}", detail);
            self.publish(status::error(format!("Recording process failed: {}", detail)))
                .await;
        }
        self.publish(format!("Recording stopped: {}", path.display()))
            .await;

        if !path.is_file() {
            self.publish(status::error(format!(
                "Recording produced no file at {}",
                path.display()
            )))
            .await;
            return;
        }

        let trimmed = self.trimmer.trim(&path, offset).await;
        self.ownership.fix(&path).await;

        match trimmed {
            Ok(()) => {
                self.publish(status::success(format!(
                    "Trimmed video saved: {}",
                    path.display()
                )))
                .await;
            }
            Err(e) => {
                let e = ControlError::from(e);
                tracing::error!(job = id, "{}", e);
                self.publish(status::error(format!(
                    "Trim failed, original kept at {}: {}",
                    path.display(),
                    describe_trim_error(&e)
                )))
                .await;
            }
        }
    }
}

fn describe_trim_error(e: &ControlError) -> String {
    match e {
        ControlError::PostProcessFailure(TrimError::Encode { status: exit, output }) => {
            format!("re-encode exited with {}: {}", exit, status::quote_output(output))
        }
        ControlError::PostProcessFailure(inner) => inner.to_string(),
        other => other.to_string(),
    }
}

fn resolve_offset(outcome: ProbeOutcome) -> StartOffset {
    if let ProbeOutcome::Inconclusive { attempts } = outcome {
        tracing::warn!(
            "{}; assuming no blank lead-in",
            ControlError::ProbeInconclusive { attempts }
        );
    }
    outcome.offset()
}

/// `<kind>_<YYYYmmdd_HHMMSS>.<ext>` in `dir`, with `_N` appended on collision
fn unique_capture_path(dir: &Path, kind: &str, ext: &str, now: DateTime<Local>) -> PathBuf {
    let stamp = now.format("%Y%m%d_%H%M%S");
    let mut path = dir.join(format!("{kind}_{stamp}.{ext}"));

    let mut n = 1;
    while path.exists() {
        path = dir.join(format!("{kind}_{stamp}_{n}.{ext}"));
        n += 1;
    }

    path
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::testutil::{FAILING_TRIM, FakeFfmpeg, Script, StatusLog};
    use chrono::TimeZone;
    use serial_test::serial;
    use tempfile::TempDir;

    const WAIT: Duration = Duration::from_secs(10);

    const SLOW_BLANK_PROBE: &str = "sleep 1
echo '[blackdetect @ 0x1] black_start:0 black_end:2.5 black_duration:2.5' >&2";

    // Takes half a second to wind down after SIGINT
    const SLOW_TO_STOP: &str = r#"printf 'raw-video' > "$last"
sleep 30 </dev/null >/dev/null 2>&1 &
pid=$!
trap 'sleep 0.5; kill $pid 2>/dev/null; exit 255' INT
wait $pid"#;

    struct Harness {
        controller: Controller,
        statuses: Arc<StatusLog>,
        fake: FakeFfmpeg,
        captures: TempDir,
    }

    impl Harness {
        fn new(script: Script) -> Self {
            let fake = FakeFfmpeg::new(script);
            let captures = tempfile::tempdir().unwrap();
            let config = Config {
                ffmpeg_path: fake.program(),
                captures_dir: captures.path().to_path_buf(),
                probe_interval_ms: 10,
                probe_max_attempts: 3,
                probe_attempt_timeout_secs: 5,
                capture_timeout_secs: 5,
                fix_ownership: false,
                ..Config::default()
            };
            let statuses = Arc::new(StatusLog::default());
            let controller = Controller::new(&config, statuses.clone());
            controller.mark_streaming();

            Self {
                controller,
                statuses,
                fake,
                captures,
            }
        }

        fn files_with_prefix(&self, prefix: &str) -> Vec<PathBuf> {
            std::fs::read_dir(self.captures.path())
                .unwrap()
                .filter_map(Result::ok)
                .filter(|e| e.file_name().to_string_lossy().starts_with(prefix))
                .map(|e| e.path())
                .collect()
        }

        fn recordings_spawned(&self) -> usize {
            self.fake.invocations_matching("-vcodec libx264 -pix_fmt")
        }
    }

    #[test]
    fn test_capture_path_avoids_collisions() {
        let dir = tempfile::tempdir().unwrap();
        let now = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();

        let first = unique_capture_path(dir.path(), "video", "mp4", now);
        assert_eq!(first, dir.path().join("video_20240309_140507.mp4"));

        std::fs::write(&first, b"x").unwrap();
        let second = unique_capture_path(dir.path(), "video", "mp4", now);
        assert_eq!(second, dir.path().join("video_20240309_140507_1.mp4"));
    }

    #[tokio::test]
    #[serial]
    async fn test_starts_idle_then_streams() {
        let fake = FakeFfmpeg::new(Script::default());
        let config = Config {
            ffmpeg_path: fake.program(),
            ..Config::default()
        };
        let controller = Controller::new(&config, Arc::new(StatusLog::default()));

        assert_eq!(controller.state(), DeviceState::Idle);
        controller.mark_streaming();
        assert_eq!(controller.state(), DeviceState::Streaming);
        controller.mark_streaming();
        assert_eq!(*controller.subscribe().borrow(), DeviceState::Streaming);
    }

    #[tokio::test]
    #[serial]
    async fn test_bounded_recording_runs_to_completion() {
        let h = Harness::new(Script::default());

        let path = h
            .controller
            .start_recording(Some(Duration::from_millis(300)))
            .await
            .unwrap();
        h.statuses.wait_for("Trimmed video saved", WAIT).await;
        h.controller.shutdown().await;

        let messages = h.statuses.messages();
        let started = h.statuses.position("Recording started").unwrap();
        let stopped = h.statuses.position("Recording stopped").unwrap();
        let trimmed = h.statuses.position("SUCCESS: Trimmed video saved").unwrap();
        assert!(started < stopped && stopped < trimmed, "{:?}", messages);

        assert_eq!(h.files_with_prefix("video_"), vec![path.clone()]);
        assert_eq!(std::fs::read(&path).unwrap(), b"trimmed-video");
        assert_eq!(h.fake.invocations_matching("-t 0.300"), 1);
        assert_eq!(h.fake.invocations_matching("-c:a aac"), 1);
        // probe saw blank video until 2.5s, trim keeps one second of slack
        assert_eq!(h.fake.invocations_matching("-ss 1.500"), 1);
        assert_eq!(h.controller.state(), DeviceState::Streaming);
    }

    #[tokio::test]
    #[serial]
    async fn test_second_start_is_rejected() {
        let h = Harness::new(Script::default());

        h.controller.start_recording(None).await.unwrap();
        let second = h.controller.start_recording(None).await;

        assert!(matches!(
            second,
            Err(ControlError::RejectedByState {
                state: DeviceState::Recording,
                ..
            })
        ));
        assert!(h.statuses.contains("ERROR: Recording already in progress"));
        assert_eq!(h.recordings_spawned(), 1);

        h.controller.stop_recording().await.unwrap();
        h.statuses.wait_for("Trimmed video saved", WAIT).await;
        h.controller.shutdown().await;
    }

    #[tokio::test]
    #[serial]
    async fn test_concurrent_starts_spawn_one_recording() {
        let h = Harness::new(Script::default());

        let (a, b) = tokio::join!(
            h.controller.start_recording(None),
            h.controller.start_recording(None)
        );

        assert_eq!([a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(), 1);
        assert_eq!(h.recordings_spawned(), 1);

        h.controller.stop_recording().await.unwrap();
        h.statuses.wait_for("Trimmed video saved", WAIT).await;
        h.controller.shutdown().await;
    }

    #[tokio::test]
    #[serial]
    async fn test_stop_without_recording_is_rejected() {
        let h = Harness::new(Script::default());

        let result = h.controller.stop_recording().await;

        assert!(matches!(result, Err(ControlError::RejectedByState { .. })));
        assert_eq!(h.statuses.messages(), vec!["ERROR: No recording in progress"]);
        assert!(h.fake.invocations().is_empty());
        assert_eq!(h.controller.state(), DeviceState::Streaming);
    }

    #[tokio::test]
    #[serial]
    async fn test_stop_finishes_through_completion_task() {
        let h = Harness::new(Script::default());
        let mut states = h.controller.subscribe();

        let path = h.controller.start_recording(None).await.unwrap();
        assert_eq!(*states.borrow_and_update(), DeviceState::Recording);

        h.controller.stop_recording().await.unwrap();
        h.statuses.wait_for("Trimmed video saved", WAIT).await;
        h.controller.shutdown().await;

        let stopping = h.statuses.position("Recording stopping...").unwrap();
        let stopped = h.statuses.position("Recording stopped").unwrap();
        assert!(stopping < stopped);
        assert_eq!(h.statuses.count("Recording stopped"), 1);
        assert_eq!(h.fake.invocations_matching("-c:a aac"), 1);
        assert_eq!(std::fs::read(&path).unwrap(), b"trimmed-video");
        assert_eq!(h.controller.state(), DeviceState::Streaming);
        assert_eq!(*states.borrow_and_update(), DeviceState::Streaming);

        // Nothing left to stop
        assert!(h.controller.stop_recording().await.is_err());
        assert_eq!(h.recordings_spawned(), 1);
    }

    #[tokio::test]
    #[serial]
    async fn test_stop_during_start_offset_detection() {
        let h = Harness::new(Script::default().probe(SLOW_BLANK_PROBE));
        let controller = h.controller.clone();
        let starting = tokio::spawn(async move { controller.start_recording(None).await });

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(h.controller.state(), DeviceState::Recording);
        assert!(!h.statuses.contains("Recording started"));

        h.controller.stop_recording().await.unwrap();
        let path = starting.await.unwrap().unwrap();
        h.statuses.wait_for("Trimmed video saved", WAIT).await;
        h.controller.shutdown().await;

        let messages = h.statuses.messages();
        let started = h.statuses.position("Recording started").unwrap();
        let stopping = h.statuses.position("Recording stopping...").unwrap();
        let stopped = h.statuses.position("Recording stopped").unwrap();
        assert!(started < stopping && stopping < stopped, "{:?}", messages);
        assert_eq!(h.statuses.count("Recording stopped"), 1);
        assert_eq!(h.fake.invocations_matching("-c:a aac"), 1);
        assert_eq!(std::fs::read(&path).unwrap(), b"trimmed-video");
        assert_eq!(h.controller.state(), DeviceState::Streaming);
    }

    #[tokio::test]
    #[serial]
    async fn test_repeated_stop_does_not_resignal() {
        let h = Harness::new(Script::default().record(SLOW_TO_STOP));

        h.controller.start_recording(None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.controller.stop_recording().await.unwrap();
        h.controller.stop_recording().await.unwrap();
        h.statuses.wait_for("Trimmed video saved", WAIT).await;
        h.controller.shutdown().await;

        let messages = h.statuses.messages();
        let stopping = h.statuses.position("Recording stopping...").unwrap();
        let again = h.statuses.position("Recording already stopping...").unwrap();
        let stopped = h.statuses.position("Recording stopped").unwrap();
        assert!(stopping < again && again < stopped, "{:?}", messages);
        assert_eq!(h.statuses.count("Recording stopping..."), 1);
        assert_eq!(h.statuses.count("Recording stopped"), 1);
        assert_eq!(h.fake.invocations_matching("-c:a aac"), 1);
        assert_eq!(h.controller.state(), DeviceState::Streaming);
    }

    #[tokio::test]
    #[serial]
    async fn test_stop_after_bounded_exit_reports_finishing() {
        let h = Harness::new(Script::default().probe(SLOW_BLANK_PROBE));
        let controller = h.controller.clone();
        let starting = tokio::spawn(async move {
            controller
                .start_recording(Some(Duration::from_millis(100)))
                .await
        });

        // The bounded run exits long before the start offset is known
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(h.controller.state(), DeviceState::Recording);

        h.controller.stop_recording().await.unwrap();
        starting.await.unwrap().unwrap();
        h.statuses.wait_for("Trimmed video saved", WAIT).await;
        h.controller.shutdown().await;

        let messages = h.statuses.messages();
        let started = h.statuses.position("Recording started").unwrap();
        let finishing = h.statuses.position("Recording already finishing").unwrap();
        let stopped = h.statuses.position("Recording stopped").unwrap();
        assert!(started < finishing && finishing < stopped, "{:?}", messages);
        assert_eq!(h.statuses.count("Recording stopping..."), 0);
        assert_eq!(h.statuses.count("ERROR:"), 0);
        assert_eq!(h.fake.invocations_matching("-t 0.100"), 1);
        assert_eq!(h.controller.state(), DeviceState::Streaming);
    }

    #[tokio::test]
    #[serial]
    async fn test_picture_during_recording_is_rejected() {
        let h = Harness::new(Script::default());

        let video = h.controller.start_recording(None).await.unwrap();
        let result = h.controller.capture_picture().await;

        assert!(matches!(result, Err(ControlError::RejectedByState { .. })));
        assert!(h.statuses.contains("ERROR: Recording in progress, cannot capture picture"));
        assert!(h.files_with_prefix("picture_").is_empty());
        assert_eq!(h.fake.invocations_matching("-frames:v"), 0);
        assert_eq!(h.controller.state(), DeviceState::Recording);
        assert_eq!(h.statuses.count("Recording stopped"), 0);

        h.controller.stop_recording().await.unwrap();
        h.statuses.wait_for("Trimmed video saved", WAIT).await;
        h.controller.shutdown().await;
        assert!(video.is_file());
    }

    #[tokio::test]
    #[serial]
    async fn test_picture_is_saved_and_state_restored() {
        let h = Harness::new(Script::default());

        let path = h.controller.capture_picture().await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"jpeg-bytes");
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("picture_"));
        assert_eq!(
            h.statuses.messages(),
            vec![
                "Image capturing started now!".to_string(),
                format!("SUCCESS: Image saved to {}", path.display()),
            ]
        );
        assert_eq!(h.fake.invocations_matching("blackdetect"), 1);
        assert_eq!(h.controller.state(), DeviceState::Streaming);
    }

    #[tokio::test]
    #[serial]
    async fn test_failed_picture_reports_output() {
        let h = Harness::new(Script::default().picture("echo 'stream not found' >&2\nexit 1"));

        let result = h.controller.capture_picture().await;

        assert!(matches!(result, Err(ControlError::SubprocessFailure { .. })));
        assert!(h.statuses.contains("ERROR: Capture failed: stream not found"));
        assert_eq!(h.controller.state(), DeviceState::Streaming);
    }

    #[tokio::test]
    #[serial]
    async fn test_failed_trim_keeps_recording() {
        let h = Harness::new(Script::default().trim(FAILING_TRIM));

        let path = h
            .controller
            .start_recording(Some(Duration::from_millis(300)))
            .await
            .unwrap();
        h.statuses.wait_for("Trim failed", WAIT).await;
        h.controller.shutdown().await;

        assert_eq!(std::fs::read(&path).unwrap(), b"raw-video");
        assert!(h.statuses.contains("encoder exploded"));
        assert!(!h.statuses.contains("Trimmed video saved"));
        assert_eq!(h.files_with_prefix(".trim-").len(), 0);
        assert_eq!(h.controller.state(), DeviceState::Streaming);
    }

    #[tokio::test]
    #[serial]
    async fn test_inconclusive_probe_still_records() {
        let h = Harness::new(
            Script::default().probe("echo '[blackdetect @ 0x1] black_start:0' >&2"),
        );

        h.controller
            .start_recording(Some(Duration::from_millis(300)))
            .await
            .unwrap();
        h.statuses.wait_for("Trimmed video saved", WAIT).await;
        h.controller.shutdown().await;

        assert_eq!(h.fake.invocations_matching("blackdetect"), 3);
        assert_eq!(h.fake.invocations_matching("-ss 0.000"), 1);
    }

    #[tokio::test]
    #[serial]
    async fn test_recording_failure_is_reported() {
        let h = Harness::new(Script::default().record("echo 'rtsp 404' >&2\nexit 1"));

        h.controller.start_recording(None).await.unwrap();
        h.statuses.wait_for("Recording produced no file", WAIT).await;
        h.controller.shutdown().await;

        let failed = h.statuses.position("ERROR: Recording process failed").unwrap();
        let stopped = h.statuses.position("Recording stopped").unwrap();
        assert!(failed < stopped);
        assert_eq!(h.fake.invocations_matching("-c:a aac"), 0);
        assert_eq!(h.controller.state(), DeviceState::Streaming);
    }

    #[tokio::test]
    #[serial]
    async fn test_unstartable_recording_leaves_state() {
        let captures = tempfile::tempdir().unwrap();
        let config = Config {
            ffmpeg_path: PathBuf::from("/nonexistent/ffmpeg"),
            captures_dir: captures.path().to_path_buf(),
            fix_ownership: false,
            ..Config::default()
        };
        let statuses = Arc::new(StatusLog::default());
        let controller = Controller::new(&config, statuses.clone());
        controller.mark_streaming();

        let result = controller.start_recording(None).await;

        assert!(matches!(result, Err(ControlError::SubprocessFailure { .. })));
        assert!(statuses.contains("ERROR: Failed to start recording"));
        assert_eq!(controller.state(), DeviceState::Streaming);
        assert!(controller.stop_recording().await.is_err());
    }

    #[tokio::test]
    #[serial]
    async fn test_shutdown_stops_active_recording() {
        let h = Harness::new(Script::default());

        h.controller.start_recording(None).await.unwrap();
        tokio::time::timeout(WAIT, h.controller.shutdown())
            .await
            .unwrap();

        assert!(h.statuses.contains("Trimmed video saved"));
        assert_eq!(h.controller.state(), DeviceState::Streaming);
    }
}
