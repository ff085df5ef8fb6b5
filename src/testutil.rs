//! A `/bin/sh` stand-in for ffmpeg, so tests drive the real process paths.
//!
//! The generated script picks a behavior from its arguments (probe, still,
//! trim, otherwise recording) and appends every invocation to
//! `invocations.log` next to itself.

use crate::status::StatusPublisher;
use async_trait::async_trait;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;

const DEFAULT_PROBE: &str =
    "echo '[blackdetect @ 0x1] black_start:0 black_end:2.5 black_duration:2.5' >&2";

const DEFAULT_PICTURE: &str = "printf 'jpeg-bytes' > \"$last\"";

// Bounded runs stop by themselves; unbounded ones wait for SIGINT like ffmpeg.
const DEFAULT_RECORD: &str = r#"printf 'raw-video' > "$last"
if [ -n "$dur" ]; then
  sleep 0.3
  exit 0
fi
sleep 30 </dev/null >/dev/null 2>&1 &
pid=$!
trap 'kill $pid 2>/dev/null; exit 255' INT
wait $pid"#;

const DEFAULT_TRIM: &str = "printf 'trimmed-video' > \"$last\"";

pub const FAILING_TRIM: &str = "printf 'partial' > \"$last\"\necho 'encoder exploded' >&2\nexit 1";

#[derive(Debug, Clone)]
pub struct Script {
    probe: String,
    picture: String,
    record: String,
    trim: String,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            probe: DEFAULT_PROBE.to_string(),
            picture: DEFAULT_PICTURE.to_string(),
            record: DEFAULT_RECORD.to_string(),
            trim: DEFAULT_TRIM.to_string(),
        }
    }
}

impl Script {
    pub fn probe(mut self, body: &str) -> Self {
        self.probe = body.to_string();
        self
    }

    pub fn picture(mut self, body: &str) -> Self {
        self.picture = body.to_string();
        self
    }

    pub fn record(mut self, body: &str) -> Self {
        self.record = body.to_string();
        self
    }

    pub fn trim(mut self, body: &str) -> Self {
        self.trim = body.to_string();
        self
    }

    fn render(&self) -> String {
        format!(
            r#"#!/bin/sh
prev=""
input=""
dur=""
last=""
for a in "$@"; do
  case "$prev" in
    -i) input="$a" ;;
    -t) dur="$a" ;;
  esac
  prev="$a"
  last="$a"
done
echo "$*" >> "$(dirname "$0")/invocations.log"
case "$*" in
  *blackdetect*)
{probe}
    ;;
  *-frames:v*)
{picture}
    ;;
  *-c:a*)
{trim}
    ;;
  *)
{record}
    ;;
esac
"#,
            probe = self.probe,
            picture = self.picture,
            trim = self.trim,
            record = self.record,
        )
    }
}

pub struct FakeFfmpeg {
    dir: TempDir,
}

impl FakeFfmpeg {
    pub fn new(script: Script) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ffmpeg");

        std::fs::write(&path, script.render()).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

        Self { dir }
    }

    pub fn program(&self) -> PathBuf {
        self.dir.path().join("ffmpeg")
    }

    pub fn invocations(&self) -> Vec<String> {
        std::fs::read_to_string(self.dir.path().join("invocations.log"))
            .map(|log| log.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }

    pub fn invocations_matching(&self, needle: &str) -> usize {
        self.invocations()
            .iter()
            .filter(|line| line.contains(needle))
            .count()
    }
}

/// Collects published statuses in order
#[derive(Default)]
pub struct StatusLog {
    messages: Mutex<Vec<String>>,
}

#[async_trait]
impl StatusPublisher for StatusLog {
    async fn publish(&self, message: &str) {
        self.messages.lock().unwrap().push(message.to_string());
    }
}

impl StatusLog {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.position(needle).is_some()
    }

    /// Index of the first message containing `needle`
    pub fn position(&self, needle: &str) -> Option<usize> {
        self.messages().iter().position(|m| m.contains(needle))
    }

    pub fn count(&self, needle: &str) -> usize {
        self.messages().iter().filter(|m| m.contains(needle)).count()
    }

    pub async fn wait_for(&self, needle: &str, timeout: Duration) {
        let waited = tokio::time::timeout(timeout, async {
            while !self.contains(needle) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;

        if waited.is_err() {
            panic!("no status containing {:?} in {:?}", needle, self.messages());
        }
    }
}
