use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use livecast_common::endpoint::BroadcastEndpoint;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Lines of encoder output retained for error reports.
const TAIL_LINES: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Progress,
    Info,
}

pub fn classify(line: &str) -> Severity {
    let lower = line.to_ascii_lowercase();
    if lower.contains("error") {
        Severity::Error
    } else if lower.contains("warning") {
        Severity::Warning
    } else if lower.contains("frame=") {
        Severity::Progress
    } else {
        Severity::Info
    }
}

/// Splits encoder output on both `\n` and `\r`; progress lines are
/// carriage-return terminated.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &b in bytes {
            if b == b'\n' || b == b'\r' {
                self.flush_into(&mut lines);
            } else {
                self.pending.push(b);
            }
        }
        lines
    }

    pub fn finish(&mut self) -> Option<String> {
        let mut lines = Vec::new();
        self.flush_into(&mut lines);
        lines.pop()
    }

    fn flush_into(&mut self, lines: &mut Vec<String>) {
        if self.pending.is_empty() {
            return;
        }
        let line = String::from_utf8_lossy(&self.pending).trim().to_string();
        self.pending.clear();
        if !line.is_empty() {
            lines.push(line);
        }
    }
}

/// Background reader draining an encoder's stderr for the life of the process.
///
/// Keeps the process from blocking on a full error pipe, forwards every line
/// to tracing by severity, and retains the last lines for failure reports.
pub struct DiagnosticsReader {
    tail: Arc<Mutex<VecDeque<String>>>,
    task: JoinHandle<std::io::Result<()>>,
}

impl DiagnosticsReader {
    pub fn spawn<R>(stream: R, label: &'static str, endpoint: Option<BroadcastEndpoint>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(TAIL_LINES)));
        let task = tokio::spawn(read_lines(stream, label, endpoint, tail.clone()));
        Self { tail, task }
    }

    /// Wait for the reader to hit end-of-stream, bounded by `wait`.
    pub async fn finish(self, wait: Duration) -> String {
        let problem = match tokio::time::timeout(wait, self.task).await {
            Ok(Ok(Ok(()))) => None,
            Ok(Ok(Err(e))) => Some(format!("failed to read encoder output: {e}")),
            Ok(Err(e)) => Some(format!("encoder output reader panicked: {e}")),
            Err(_) => {
                debug!("encoder output reader still open, not waiting further");
                None
            }
        };
        if let Some(problem) = problem {
            warn!(error = %problem, "encoder diagnostics incomplete");
        }
        lock(&self.tail).iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

fn lock(tail: &Mutex<VecDeque<String>>) -> MutexGuard<'_, VecDeque<String>> {
    tail.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn read_lines<R>(
    mut stream: R,
    label: &'static str,
    endpoint: Option<BroadcastEndpoint>,
    tail: Arc<Mutex<VecDeque<String>>>,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut splitter = LineSplitter::default();
    let mut buf = vec![0u8; 8 * 1024];

    loop {
        let n = stream.read(&mut buf).await?;
        let lines = if n == 0 {
            splitter.finish().into_iter().collect()
        } else {
            splitter.push(&buf[..n])
        };

        for line in lines {
            let line = match &endpoint {
                Some(endpoint) => endpoint.mask(&line),
                None => line,
            };
            match classify(&line) {
                Severity::Error => error!(encoder = label, "{line}"),
                Severity::Warning => warn!(encoder = label, "{line}"),
                Severity::Progress => info!(encoder = label, "{line}"),
                Severity::Info => debug!(encoder = label, "{line}"),
            }
            let mut tail = lock(&tail);
            if tail.len() == TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }

        if n == 0 {
            return Ok(());
        }
    }
}
