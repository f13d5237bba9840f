//! JSONL audit sink for `guildforge`. Appends one serialized [`AuditEvent`] per line.
//! Always writes; bring your own path.

use guildforge::audit::{AuditEvent, AuditSink};
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

#[derive(Clone, Debug)]
pub struct JsonlSink {
    path: PathBuf,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl tower_service::Service<AuditEvent> for JsonlSink {
    type Response = ();
    type Error = io::Error;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: AuditEvent) -> Self::Future {
        let path = self.path.clone();
        let line = serde_json::to_string(&event).map(|mut line| {
            line.push('\n');
            line
        });
        Box::pin(async move {
            use tokio::io::AsyncWriteExt;
            let line = line?;
            let mut file =
                tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await?;
            file.write_all(line.as_bytes()).await?;
            file.flush().await?;
            tracing::trace!(path = %path.display(), kind = event.kind.as_str(), "audit line written");
            Ok::<(), io::Error>(())
        })
    }
}

impl AuditSink for JsonlSink {
    type SinkError = io::Error;
}
