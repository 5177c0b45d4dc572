//! The restoration job run for every accepted file-action webhook.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use crate::host::{HostClient, LogLevel};
use crate::restore::Restorer;
use crate::types::{join_path, ActionFile, RestoreMode};

const FAILURE_SUBJECT: &str = "Error occurred";
const FAILURE_MESSAGE: &str = "Error information was written to log file";

/// Split `name` into stem and extension, extension including the dot.
///
/// Leading dots belong to the stem, so `.profile` has no extension.
pub fn split_extension(name: &str) -> (&str, &str) {
    let leading = name.len() - name.trim_start_matches('.').len();
    match name[leading..].rfind('.') {
        Some(idx) => name.split_at(leading + idx),
        None => (name, ""),
    }
}

/// `<directory>/<stem>_<suffix><ext>` for the given mode.
pub fn output_path(directory: &str, name: &str, mode: RestoreMode) -> String {
    let (stem, ext) = split_extension(name);
    join_path(
        directory,
        &format!("{stem}_{}{ext}", mode.output_suffix()),
    )
}

#[derive(Debug, Clone)]
pub struct RestoreJob {
    pub file: ActionFile,
    /// Host user the webhook was signed for; all host calls act as them.
    pub user: String,
    pub mode: RestoreMode,
}

impl RestoreJob {
    pub fn new(file: ActionFile, user: impl Into<String>, mode: RestoreMode) -> Self {
        Self {
            file,
            user: user.into(),
            mode,
        }
    }

    pub fn source_path(&self) -> String {
        self.file.full_path()
    }

    pub fn output_path(&self) -> String {
        output_path(&self.file.directory, &self.file.name, self.mode)
    }

    /// Run to completion. Every outcome is reported to the user; nothing is returned.
    pub async fn run(self, host: HostClient, restorer: Arc<dyn Restorer>) {
        match self.execute(&host, restorer).await {
            Ok(output) => {
                info!(
                    user = %self.user,
                    mode = %self.mode,
                    output = %output,
                    "Restoration job succeeded"
                );
            }
            Err(err) => self.report_failure(&host, &err).await,
        }
    }

    async fn execute(&self, host: &HostClient, restorer: Arc<dyn Restorer>) -> Result<String> {
        let source = self.source_path();
        let output = self.output_path();

        let input = host.download(&self.user, &source).await?;
        info!(
            source = %source,
            bytes = input.len(),
            mode = %self.mode,
            "Downloaded source image"
        );

        let scale = self.mode.scale();
        let restored = tokio::task::spawn_blocking(move || restorer.restore(&input, scale))
            .await
            .context("restoration task panicked")?
            .with_context(|| format!("failed to {} {source}", self.mode))?;

        host.upload(&self.user, &output, restored).await?;

        host.notify(
            &self.user,
            self.mode.finished_subject(),
            &format!("{output} is ready."),
        )
        .await
        .context("failed to send completion notification")?;

        Ok(output)
    }

    async fn report_failure(&self, host: &HostClient, err: &anyhow::Error) {
        let message = format!("{err:#}");
        error!(
            user = %self.user,
            file = %self.source_path(),
            mode = %self.mode,
            error = %message,
            "Restoration job failed"
        );

        if let Err(log_err) = host.log(&self.user, LogLevel::Error, &message).await {
            warn!(error = %format!("{log_err:#}"), "Failed to write job error to host log");
        }
        if let Err(notify_err) = host
            .notify(&self.user, FAILURE_SUBJECT, FAILURE_MESSAGE)
            .await
        {
            warn!(error = %format!("{notify_err:#}"), "Failed to send failure notification");
        }
    }
}
