use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::{StreamError, StreamResult};
use crate::scheduler::DurationProbe;

/// Measures audio length by asking the encoder binary to describe the file.
pub struct FfmpegProbe {
    program: String,
}

impl FfmpegProbe {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl DurationProbe for FfmpegProbe {
    async fn duration(&self, path: &Path) -> StreamResult<Duration> {
        // Without an output file the encoder exits non-zero, but the input
        // banner including its duration is still printed.
        let output = Command::new(&self.program)
            .arg("-hide_banner")
            .arg("-i")
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| StreamError::Spawn {
                program: self.program.clone(),
                message: e.to_string(),
            })?;

        let text = String::from_utf8_lossy(&output.stderr);
        let duration = parse_duration(&text).ok_or_else(|| {
            StreamError::Generation(format!(
                "could not determine duration of {}",
                path.display()
            ))
        })?;
        debug!(path = %path.display(), secs = duration.as_secs_f64(), "probed audio duration");
        Ok(duration)
    }
}

/// Parse the first `Duration: HH:MM:SS.ss` entry of encoder output.
pub fn parse_duration(output: &str) -> Option<Duration> {
    let line = output.lines().find(|l| l.contains("Duration:"))?;
    let value = line.split("Duration:").nth(1)?.split(',').next()?.trim();

    let mut parts = value.split(':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }

    let total = hours * 3600.0 + minutes * 60.0 + seconds;
    (total.is_finite() && total >= 0.0).then(|| Duration::from_millis((total * 1000.0).round() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_banner_duration() {
        let out = "Input #0, wav, from 'news.wav':\n  Duration: 00:00:45.12, bitrate: 384 kb/s\n";
        assert_eq!(parse_duration(out), Some(Duration::from_millis(45_120)));
    }

    #[test]
    fn parses_hours_and_minutes() {
        let out = "  Duration: 01:05:40.50, start: 0.000000, bitrate: 128 kb/s";
        assert_eq!(parse_duration(out), Some(Duration::from_millis(3_940_500)));
    }

    #[test]
    fn unknown_duration() {
        assert_eq!(parse_duration("  Duration: N/A, bitrate: N/A"), None);
        assert_eq!(parse_duration("news.wav: No such file or directory"), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn probe_reads_stderr_of_program() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-ffmpeg");
        std::fs::write(
            &script,
            "#!/bin/sh\necho '  Duration: 00:05:40.00, start: 0.0' >&2\nexit 1\n",
        )
        .unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let probe = FfmpegProbe::new(script.to_string_lossy());
        let d = probe.duration(Path::new("news.wav")).await.unwrap();
        assert_eq!(d, Duration::from_secs(340));
    }
}
