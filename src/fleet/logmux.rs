//! Per-container log streaming and normalization.
//!
//! One [`LogStreamer`] task runs per active runner container. It consumes
//! the follow-mode byte stream from the runtime, reassembles lines, flattens
//! structured JSON records into `key=value` form, and routes each line to
//! either the container's log file or the console.

use std::path::PathBuf;
use std::sync::Arc;

use futures::StreamExt;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::runtime::RuntimeClient;

/// Structured record emitted by the runner agent inside the container.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LogRecord {
    time: String,
    level: String,
    msg: String,
    #[serde(rename = "jobId")]
    job_id: String,
    #[serde(rename = "runId")]
    run_id: String,
    #[serde(rename = "agentId")]
    agent_id: String,
    #[serde(rename = "projectId")]
    project_id: String,
    #[serde(rename = "projectOwnerId")]
    project_owner_id: String,
    source: String,
}

/// Normalizes one log line.
///
/// A line that parses as a structured JSON record is flattened to
/// `time=.. level=.. msg=..` with the remaining fields appended only when
/// non-empty. Anything else passes through unchanged, so re-feeding an
/// already-flattened line is a no-op.
pub fn format_line(line: &str) -> String {
    if !(line.starts_with('{') && line.ends_with('}')) {
        return line.to_string();
    }

    let record: LogRecord = match serde_json::from_str(line) {
        Ok(record) => record,
        Err(_) => return line.to_string(),
    };

    let mut out = format!(
        "time={} level={} msg={}",
        record.time, record.level, record.msg
    );
    for (key, value) in [
        ("jobId", &record.job_id),
        ("runId", &record.run_id),
        ("agentId", &record.agent_id),
        ("projectId", &record.project_id),
        ("projectOwnerId", &record.project_owner_id),
        ("source", &record.source),
    ] {
        if !value.is_empty() {
            out.push_str(&format!(" {}={}", key, value));
        }
    }
    out
}

/// Streams and routes the logs of one container until the stream ends or
/// the owning controller signals shutdown.
pub struct LogStreamer {
    container_name: String,
    container_id: String,
    log_dir: Option<PathBuf>,
    runtime: Arc<dyn RuntimeClient>,
}

impl LogStreamer {
    pub fn new(
        container_name: impl Into<String>,
        container_id: impl Into<String>,
        log_dir: Option<PathBuf>,
        runtime: Arc<dyn RuntimeClient>,
    ) -> Self {
        Self {
            container_name: container_name.into(),
            container_id: container_id.into(),
            log_dir,
            runtime,
        }
    }

    /// Consumes the container's log stream to completion.
    ///
    /// End-of-stream and read errors terminate the task quietly; the
    /// monitoring loop detects the container's exit independently.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut sink = match self.open_sink().await {
            Ok(sink) => sink,
            Err(e) => {
                warn!(container = %self.container_name, error = %e, "unable to open log sink");
                return;
            }
        };

        let mut stream = self.runtime.stream_logs(&self.container_id);
        let mut pending = String::new();

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!(container = %self.container_name, "log streaming cancelled");
                    return;
                }
                chunk = stream.next() => match chunk {
                    Some(Ok(bytes)) => {
                        pending.push_str(&String::from_utf8_lossy(&bytes));
                        while let Some(pos) = pending.find('\n') {
                            let line: String = pending.drain(..=pos).collect();
                            let line = line.trim_end_matches(['\n', '\r']);
                            if let Err(e) = self.emit(&mut sink, line).await {
                                warn!(container = %self.container_name, error = %e, "failed to write log line");
                            }
                        }
                    }
                    Some(Err(e)) => {
                        debug!(container = %self.container_name, error = %e, "log stream error");
                        return;
                    }
                    None => {
                        debug!(container = %self.container_name, "log stream ended");
                        return;
                    }
                }
            }
        }
    }

    /// Opens the container's log file when a log directory is configured.
    async fn open_sink(&self) -> std::io::Result<Option<tokio::fs::File>> {
        let Some(dir) = &self.log_dir else {
            return Ok(None);
        };

        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!("{}.log", self.container_name));
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Some(file))
    }

    async fn emit(&self, sink: &mut Option<tokio::fs::File>, line: &str) -> std::io::Result<()> {
        let line = format_line(line);
        match sink {
            Some(file) => {
                file.write_all(line.as_bytes()).await?;
                file.write_all(b"\n").await?;
                file.flush().await?;
            }
            None => println!("{}: {}", self.container_name, line),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_line_full_record() {
        let line = r#"{"time":"2024-01-01T00:00:00Z","level":"info","msg":"job accepted","jobId":"j1","runId":"r1","agentId":"a1","projectId":"p1","projectOwnerId":"o1","source":"agent"}"#;
        assert_eq!(
            format_line(line),
            "time=2024-01-01T00:00:00Z level=info msg=job accepted jobId=j1 runId=r1 agentId=a1 projectId=p1 projectOwnerId=o1 source=agent"
        );
    }

    #[test]
    fn test_format_line_minimal_record() {
        let line = r#"{"time":"t","level":"info","msg":"hello"}"#;
        assert_eq!(format_line(line), "time=t level=info msg=hello");
    }

    #[test]
    fn test_format_line_is_idempotent() {
        let line = r#"{"time":"t","level":"info","msg":"hello","jobId":"j1"}"#;
        let once = format_line(line);
        assert_eq!(format_line(&once), once);
    }

    #[test]
    fn test_format_line_passthrough() {
        assert_eq!(format_line("plain text output"), "plain text output");
        assert_eq!(format_line("{not json"), "{not json");
        assert_eq!(format_line("{\"broken\": }"), "{\"broken\": }");
    }

    #[test]
    fn test_format_line_skips_empty_optional_fields() {
        let line = r#"{"time":"t","level":"warn","msg":"m","jobId":"","runId":"r9"}"#;
        assert_eq!(format_line(line), "time=t level=warn msg=m runId=r9");
    }
}
