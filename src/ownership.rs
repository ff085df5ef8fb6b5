use crate::process;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Hands finished captures to the user who started the service.
///
/// The service usually runs as root (device access), which would leave every
/// capture root-owned. Failures only warn; the capture itself is fine.
#[derive(Clone, Debug)]
pub struct Ownership {
    enabled: bool,
    chown: PathBuf,
    timeout: Duration,
}

impl Ownership {
    pub fn new(enabled: bool, timeout: Duration) -> Self {
        Self {
            enabled,
            chown: PathBuf::from("chown"),
            timeout,
        }
    }

    pub async fn fix(&self, path: &Path) {
        if !self.enabled {
            return;
        }

        let sudo_user = std::env::var("SUDO_USER").ok();
        let user = std::env::var("USER").ok();
        let Some(owner) = target_owner(sudo_user, user) else {
            tracing::warn!(
                "Cannot determine target user for {:?}, ownership remains unchanged",
                path
            );
            return;
        };

        self.chown(path, &owner).await;
    }

    async fn chown(&self, path: &Path, owner: &str) {
        let args = [
            OsString::from(format!("{owner}:{owner}")),
            path.as_os_str().to_owned(),
        ];

        match process::run_sync(&self.chown, args, self.timeout).await {
            Ok(output) if output.success() => {
                tracing::info!("Changed ownership of {:?} to {}", path, owner);
            }
            Ok(output) => tracing::warn!(
                "Failed to change ownership of {:?} to {} ({}): {}",
                path,
                owner,
                output.status,
                output.output.trim()
            ),
            Err(e) => tracing::warn!("Failed to change ownership of {:?}: {}", path, e),
        }
    }
}

/// `$SUDO_USER` wins over `$USER`; empty values count as unset
fn target_owner(sudo_user: Option<String>, user: Option<String>) -> Option<String> {
    sudo_user
        .filter(|u| !u.is_empty())
        .or_else(|| user.filter(|u| !u.is_empty()))
}
