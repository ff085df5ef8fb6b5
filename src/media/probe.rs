use super::args;
use crate::process;
use regex::Regex;
use std::fmt;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

static BLACK_END: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"black_end:\s*([0-9]+(?:\.[0-9]+)?)").unwrap());

/// Seconds of blank video at the start of a stream. Never negative.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default)]
pub struct StartOffset(f64);

impl StartOffset {
    pub const ZERO: Self = Self(0.0);

    pub fn from_secs(secs: f64) -> Self {
        if secs.is_finite() && secs > 0.0 {
            Self(secs)
        } else {
            Self::ZERO
        }
    }

    /// Where a trim should start: one second before usable video, clamped at zero
    pub fn trim_point(&self) -> f64 {
        (self.0 - 1.0).max(0.0)
    }
}

impl fmt::Display for StartOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}s", self.0)
    }
}

/// What one blackdetect run told us
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProbeReading {
    /// No blank segment reported, usable video from the start
    Clean,
    /// Blank video until the given timestamp (the last one reported)
    BlankUntil(f64),
    /// Blank markers present but no end timestamp could be read
    Unparsed,
}

pub fn parse_blackdetect(output: &str) -> ProbeReading {
    if !output.contains("black_start") && !output.contains("black_end") {
        return ProbeReading::Clean;
    }

    BLACK_END
        .captures_iter(output)
        .filter_map(|caps| caps[1].parse::<f64>().ok())
        .last()
        .map(ProbeReading::BlankUntil)
        .unwrap_or(ProbeReading::Unparsed)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProbeOutcome {
    Detected(StartOffset),
    /// No usable reading within the attempt budget
    Inconclusive { attempts: u32 },
}

impl ProbeOutcome {
    pub fn offset(&self) -> StartOffset {
        match self {
            ProbeOutcome::Detected(offset) => *offset,
            ProbeOutcome::Inconclusive { .. } => StartOffset::ZERO,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProbeSettings {
    pub ffmpeg: PathBuf,
    pub stream_url: String,
    pub interval: Duration,
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
}

/// Polls the live stream until it can tell when usable (non-blank) video begins.
pub struct BlackFrameProbe {
    settings: ProbeSettings,
}

impl BlackFrameProbe {
    pub fn new(settings: ProbeSettings) -> Self {
        Self { settings }
    }

    pub async fn detect_start_offset(&self) -> ProbeOutcome {
        let max_attempts = self.settings.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            if let Some(offset) = self.attempt(attempt).await {
                tracing::info!(attempt, %offset, "Detected stream start offset");
                return ProbeOutcome::Detected(offset);
            }

            if attempt < max_attempts {
                tokio::time::sleep(self.settings.interval).await;
            }
        }

        ProbeOutcome::Inconclusive {
            attempts: max_attempts,
        }
    }

    async fn attempt(&self, attempt: u32) -> Option<StartOffset> {
        let output = match process::run_sync(
            &self.settings.ffmpeg,
            args::probe_args(&self.settings.stream_url),
            self.settings.attempt_timeout,
        )
        .await
        {
            Ok(output) => output,
            Err(e) => {
                tracing::debug!(attempt, "Probe run failed: {}", e);
                return None;
            }
        };

        match parse_blackdetect(&output.output) {
            ProbeReading::BlankUntil(secs) => Some(StartOffset::from_secs(secs)),
            ProbeReading::Clean if output.success() => Some(StartOffset::ZERO),
            ProbeReading::Clean => {
                tracing::debug!(attempt, status = %output.status, "Probe failed without a reading");
                None
            }
            ProbeReading::Unparsed => {
                tracing::debug!(attempt, "Blank segment reported without an end, retrying");
                None
            }
        }
    }
}
