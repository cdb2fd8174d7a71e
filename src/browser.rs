use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::process::Command;

/// Opens the default browser at most once per launcher.
#[derive(Clone, Default)]
pub struct BrowserLauncher {
    launched: Arc<AtomicBool>,
}

impl BrowserLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// True for the first caller only.
    pub fn claim(&self) -> bool {
        self.launched
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Schedules the launch. False if this launcher already fired.
    pub fn launch_after(&self, url: String, delay: Duration) -> bool {
        if !self.claim() {
            return false;
        }

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(err) = open_url(&url).await {
                tracing::warn!("could not open browser at {}: {:#}", url, err);
            }
        });
        true
    }
}

async fn open_url(url: &str) -> Result<()> {
    let mut command = if cfg!(target_os = "macos") {
        let mut cmd = Command::new("open");
        cmd.arg(url);
        cmd
    } else if cfg!(target_os = "windows") {
        let mut cmd = Command::new("cmd");
        cmd.args(["/C", "start", "", url]);
        cmd
    } else {
        let mut cmd = Command::new("xdg-open");
        cmd.arg(url);
        cmd
    };

    let status = command
        .status()
        .await
        .context("failed to spawn browser opener")?;
    if !status.success() {
        anyhow::bail!("browser opener exited with {status}");
    }
    Ok(())
}
