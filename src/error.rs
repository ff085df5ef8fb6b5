use crate::media::TrimError;
use crate::messages::DeviceState;
use thiserror::Error;

/// Why a lifecycle operation did not go through. None of these are fatal:
/// the controller is back in a stable state by the time one is returned.
#[derive(Debug, Error)]
pub enum ControlError {
    /// The command conflicts with the current state; nothing was started
    #[error("{reason}")]
    RejectedByState {
        state: DeviceState,
        reason: &'static str,
    },

    #[error("{what} failed: {detail}")]
    SubprocessFailure { what: &'static str, detail: String },

    #[error("black-frame probe gave no reading after {attempts} attempts")]
    ProbeInconclusive { attempts: u32 },

    #[error("post-processing failed: {0}")]
    PostProcessFailure(#[from] TrimError),
}
