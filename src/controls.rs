use crate::messages::Setting;
use crate::process;
use crate::status;
use std::path::PathBuf;
use std::time::Duration;

/// Passthrough to `v4l2-ctl` for runtime device controls
#[derive(Clone, Debug)]
pub struct DeviceControls {
    v4l2_ctl: PathBuf,
    device: String,
    timeout: Duration,
}

impl DeviceControls {
    pub fn new(v4l2_ctl: PathBuf, device: String, timeout: Duration) -> Self {
        Self {
            v4l2_ctl,
            device,
            timeout,
        }
    }

    /// Apply one `<control>=<value>` assignment and describe the outcome as a status
    pub async fn apply(&self, setting: &Setting) -> String {
        let assignment = format!("{}={}", setting.control, setting.value);
        tracing::info!("Setting {} on {}", assignment, self.device);

        let result = process::run_sync(
            &self.v4l2_ctl,
            ["-d", self.device.as_str(), "-c", assignment.as_str()],
            self.timeout,
        )
        .await;

        match result {
            Ok(output) if output.success() => success_message(setting),
            Ok(output) => failure_message(&setting.control, &output.output),
            Err(e) => failure_message(&setting.control, &e.to_string()),
        }
    }

    /// Query the device once so a stale holder lets go of it before the relay opens it
    pub async fn reset(&self, timeout: Duration) {
        tracing::info!("Attempting to reset camera {}", self.device);

        match process::run_sync(
            &self.v4l2_ctl,
            ["-d", self.device.as_str(), "--get-fmt-video"],
            timeout,
        )
        .await
        {
            Ok(output) if !output.success() => tracing::warn!(
                "Camera reset query exited with {}: {}",
                output.status,
                output.output.trim()
            ),
            Ok(_) => {}
            Err(e) => tracing::warn!("Camera reset query failed: {}", e),
        }

        tracing::info!("Camera reset attempt complete");
    }
}

fn success_message(setting: &Setting) -> String {
    let enabled = setting.value == "1";
    match (setting.control.as_str(), enabled) {
        ("focus_automatic_continuous", true) => {
            status::success("Auto Focus ENABLED. Manual slider is now ignored.")
        }
        ("focus_automatic_continuous", false) => {
            status::success("Manual Focus ENABLED. Use the slider to adjust focus.")
        }
        ("white_balance_automatic", true) => {
            status::success("Auto White Balance ENABLED. Manual slider is now ignored.")
        }
        ("white_balance_automatic", false) => {
            status::success("Manual WB ENABLED. Use the slider to adjust temperature.")
        }
        (control, _) => status::success(format!("{} set to {}", control, setting.value)),
    }
}

fn failure_message(control: &str, output: &str) -> String {
    let output = status::quote_output(output);
    match control {
        "focus_automatic_continuous" => {
            status::error(format!("Auto Focus toggle failed. Output: {}", output))
        }
        "white_balance_automatic" => {
            status::error(format!("Auto WB toggle failed. Output: {}", output))
        }
        "focus_absolute" => {
            status::error("Focus adjustment blocked. Please click 'Manual Focus' first.")
        }
        "white_balance_temperature" => status::error(
            "White Balance adjustment blocked. Please click 'Manual WB (Disable Auto)' first.",
        ),
        "pan_absolute" => status::error(
            "Pan adjustment blocked. The feature may be unsupported or require manual focus/zoom to be disabled.",
        ),
        _ => status::error(format!("Setting {} failed. Output: {}", control, output)),
    }
}
