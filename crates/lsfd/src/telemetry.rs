//! File-backed runtime telemetry.
//!
//! The file holds one JSON object mapping app ids to runtimes in
//! milliseconds, e.g. `{"3f2c…": 212.5}`. It is re-read on every query so
//! an external collector can rewrite it at any time. A missing file means
//! no app has recent traffic.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use lsf_controller::{Telemetry, TelemetryFuture};
use tracing::debug;

pub struct FileTelemetry {
    path: PathBuf,
}

impl FileTelemetry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> anyhow::Result<HashMap<String, f64>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no runtime file yet");
                return Ok(HashMap::new());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("read {}", self.path.display()));
            }
        };
        serde_json::from_str(&content).with_context(|| format!("parse {}", self.path.display()))
    }
}

impl Telemetry for FileTelemetry {
    fn query_p95_app_runtimes(&self) -> TelemetryFuture<'_, HashMap<String, f64>> {
        Box::pin(self.read())
    }

    fn query_average_app_runtime<'a>(&'a self, app_id: &'a str) -> TelemetryFuture<'a, f64> {
        Box::pin(async move {
            self.read()
                .await?
                .get(app_id)
                .copied()
                .with_context(|| format!("no runtime recorded for app {app_id}"))
        })
    }
}
