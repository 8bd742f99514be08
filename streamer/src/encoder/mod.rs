pub mod command;
pub mod diagnostics;
pub mod pipe;
pub mod probe;
pub mod segment;

use tokio::process::Command;
use tracing::{debug, warn};

/// Check that the encoder binary runs (streaming fails without it).
pub async fn check_ffmpeg_available(program: &str) {
    match Command::new(program).arg("-version").output().await {
        Ok(out) if out.status.success() => {
            debug!(program, "ffmpeg is available");
        }
        Ok(_) => {
            warn!(program, "ffmpeg returned non-zero for -version; streaming may fail");
        }
        Err(e) => {
            warn!(
                program,
                error = %e,
                "ffmpeg not found; streaming will fail. \
                 Install ffmpeg with libx264 and aac support."
            );
        }
    }
}
