use std::time::Duration;
use thiserror::Error;

pub const SETTINGS_TOPIC: &str = "camera/control/settings";
pub const ACTION_TOPIC: &str = "camera/control/action";
pub const STATUS_TOPIC: &str = "camera/status";

/// Lifecycle state of the one capture device (observable via watch channel)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceState {
    Idle,
    Streaming,
    Capturing,
    Recording,
}

/// A raw message as delivered by the transport
#[derive(Clone, Debug, PartialEq)]
pub struct Inbound {
    pub topic: String,
    pub payload: String,
}

/// `<control-name> <value>`
#[derive(Clone, Debug, PartialEq)]
pub struct Setting {
    pub control: String,
    pub value: String,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    Picture,
    Record { duration: Option<Duration> },
    Stop,
}

#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("Invalid setting format. Expected <control> <value>")]
    InvalidSetting,

    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Invalid duration: {0}")]
    InvalidDuration(String),
}

impl Setting {
    pub fn parse(payload: &str) -> Result<Self, ParseError> {
        let parts: Vec<&str> = payload.split_whitespace().collect();
        match parts.as_slice() {
            [control, value] => Ok(Self {
                control: control.to_string(),
                value: value.to_string(),
            }),
            _ => Err(ParseError::InvalidSetting),
        }
    }
}

impl Action {
    /// Parse an action payload. An empty payload is not an action and yields `None`.
    pub fn parse(payload: &str) -> Result<Option<Self>, ParseError> {
        let payload = payload.trim();
        let mut parts = payload.split_whitespace();

        let Some(action) = parts.next() else {
            return Ok(None);
        };

        let action = match action {
            "picture" => Action::Picture,
            "record" => Action::Record {
                duration: parts.next().map(parse_duration).transpose()?,
            },
            "stop" => Action::Stop,
            _ => return Err(ParseError::UnknownAction(payload.to_string())),
        };

        Ok(Some(action))
    }
}

/// Shortest recording ffmpeg is asked for; `-t` is written with millisecond precision
const MIN_DURATION: Duration = Duration::from_millis(1);

fn parse_duration(token: &str) -> Result<Duration, ParseError> {
    token
        .parse::<f64>()
        .ok()
        .filter(|secs| secs.is_finite() && *secs > 0.0)
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .filter(|duration| *duration >= MIN_DURATION)
        .ok_or_else(|| ParseError::InvalidDuration(token.to_string()))
}
