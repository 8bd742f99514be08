use std::path::{Path, PathBuf};
use std::time::Duration;

use livecast_common::config::Config;
use livecast_common::endpoint::BroadcastEndpoint;

/// Encoder parameters shared by every invocation in a session.
#[derive(Debug, Clone)]
pub struct EncoderSettings {
    pub program: String,
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    pub video_bitrate: String,
    pub buffer_size: String,
    pub preset: String,
    pub audio_bitrate: String,
    pub sample_rate: u32,
    pub background_audio: Option<PathBuf>,
    pub background_volume: f32,
    pub stop_grace: Duration,
}

impl EncoderSettings {
    pub fn from_config(config: &Config) -> Self {
        let encoder = &config.encoder;
        Self {
            program: encoder.ffmpeg_path.clone(),
            fps: config.stream.fps,
            width: config.stream.width,
            height: config.stream.height,
            video_bitrate: encoder.video_bitrate.clone(),
            buffer_size: encoder.buffer_size.clone(),
            preset: encoder.preset.clone(),
            audio_bitrate: encoder.audio_bitrate.clone(),
            sample_rate: encoder.sample_rate,
            background_audio: encoder.background_audio.clone(),
            background_volume: encoder.background_volume,
            stop_grace: Duration::from_secs(encoder.stop_grace_secs),
        }
    }

    /// Arguments for a persistent encoder reading raw RGBA frames from stdin.
    ///
    /// With a `duration`, the session is bounded and mixes `narration` over
    /// the looping background; without one it runs until stdin closes.
    pub fn pipe_args(
        &self,
        narration: Option<&Path>,
        duration: Option<Duration>,
        endpoint: &BroadcastEndpoint,
    ) -> Vec<String> {
        let mut args = strings(&["-hide_banner", "-loglevel", "info", "-stats"]);
        args.extend(strings(&["-f", "rawvideo", "-pix_fmt", "rgba", "-s"]));
        args.push(format!("{}x{}", self.width, self.height));
        args.extend(["-r".to_string(), self.fps.to_string()]);
        args.extend(strings(&["-i", "pipe:0"]));
        self.push_audio_and_output(&mut args, narration, duration, endpoint);
        args
    }

    /// Arguments for one bounded segment encoding a still image.
    pub fn segment_args(
        &self,
        image: &Path,
        narration: Option<&Path>,
        duration: Duration,
        endpoint: &BroadcastEndpoint,
    ) -> Vec<String> {
        let mut args = strings(&["-hide_banner", "-loglevel", "info", "-stats", "-re"]);
        args.extend(strings(&["-loop", "1", "-i"]));
        args.push(path_arg(image));
        self.push_audio_and_output(&mut args, narration, Some(duration), endpoint);
        args
    }

    fn push_audio_and_output(
        &self,
        args: &mut Vec<String>,
        narration: Option<&Path>,
        duration: Option<Duration>,
        endpoint: &BroadcastEndpoint,
    ) {
        let background = self.background_audio.as_deref();

        if let Some(narration) = narration {
            args.push("-i".into());
            args.push(path_arg(narration));
        }
        if let Some(background) = background {
            args.extend(strings(&["-stream_loop", "-1", "-i"]));
            args.push(path_arg(background));
        }
        if narration.is_none() && background.is_none() {
            args.extend(strings(&["-f", "lavfi", "-i"]));
            args.push(format!(
                "anullsrc=channel_layout=stereo:sample_rate={}",
                self.sample_rate
            ));
        }

        args.extend(["-c:v".to_string(), "libx264".to_string()]);
        args.extend(["-preset".to_string(), self.preset.clone()]);
        args.extend(strings(&["-tune", "zerolatency", "-pix_fmt", "yuv420p"]));
        args.extend(["-r".to_string(), self.fps.to_string()]);
        args.extend(["-g".to_string(), (self.fps * 2).to_string()]);
        args.extend(["-b:v".to_string(), self.video_bitrate.clone()]);
        args.extend(["-maxrate".to_string(), self.video_bitrate.clone()]);
        args.extend(["-bufsize".to_string(), self.buffer_size.clone()]);

        match audio_filter(narration.is_some(), background.is_some(), self.background_volume) {
            Some(filter) => {
                args.extend(["-filter_complex".to_string(), filter]);
                args.extend(strings(&["-map", "0:v", "-map", "[aout]"]));
            }
            None => args.extend(strings(&["-map", "0:v", "-map", "1:a"])),
        }

        args.extend(["-c:a".to_string(), "aac".to_string()]);
        args.extend(["-b:a".to_string(), self.audio_bitrate.clone()]);
        args.extend(["-ar".to_string(), self.sample_rate.to_string()]);
        if let Some(duration) = duration {
            args.extend(["-t".to_string(), format!("{:.3}", duration.as_secs_f64())]);
        }
        args.extend(strings(&["-f", "flv"]));
        args.push(endpoint.url());
    }
}

/// Audio filter graph for the inputs following the video input.
///
/// Narration is padded so it never truncates the mix and the longest input
/// decides the mixed length; the `-t` bound is the hard stop.
pub fn audio_filter(narration: bool, background: bool, volume: f32) -> Option<String> {
    match (narration, background) {
        (true, true) => Some(format!(
            "[1:a]apad,volume=1.0[news];[2:a]volume={volume}[bg];\
             [news][bg]amix=inputs=2:duration=longest[aout]"
        )),
        (true, false) => Some("[1:a]apad,volume=1.0[aout]".into()),
        (false, true) => Some(format!("[1:a]volume={volume}[aout]")),
        (false, false) => None,
    }
}

/// Render a command line for logging with the stream key masked.
pub fn display_command(program: &str, args: &[String], endpoint: &BroadcastEndpoint) -> String {
    let joined = std::iter::once(program.to_string())
        .chain(args.iter().cloned())
        .collect::<Vec<_>>()
        .join(" ");
    endpoint.mask(&joined)
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(background: Option<&str>) -> EncoderSettings {
        EncoderSettings {
            program: "ffmpeg".into(),
            fps: 30,
            width: 1920,
            height: 1080,
            video_bitrate: "6800k".into(),
            buffer_size: "13600k".into(),
            preset: "veryfast".into(),
            audio_bitrate: "128k".into(),
            sample_rate: 44100,
            background_audio: background.map(PathBuf::from),
            background_volume: 0.04,
            stop_grace: Duration::from_secs(5),
        }
    }

    fn endpoint() -> BroadcastEndpoint {
        BroadcastEndpoint::new("rtmp://a.rtmp.youtube.com/live2", "abcd-1234-efgh")
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn segment_mixes_narration_over_background() {
        let args = settings(Some("audio/song.mp3")).segment_args(
            Path::new("screenshot.png"),
            Some(Path::new("audio/tts/news_1.wav")),
            Duration::from_secs(600),
            &endpoint(),
        );
        assert_eq!(value_after(&args, "-loop"), Some("1"));
        assert_eq!(value_after(&args, "-stream_loop"), Some("-1"));
        assert_eq!(value_after(&args, "-t"), Some("600.000"));
        let filter = value_after(&args, "-filter_complex").unwrap();
        assert!(filter.contains("apad"));
        assert!(filter.contains("volume=0.04"));
        assert!(filter.contains("duration=longest"));
        assert_eq!(args.last().unwrap(), "rtmp://a.rtmp.youtube.com/live2/abcd-1234-efgh");
    }

    #[test]
    fn filler_only_segment_has_no_narration_input() {
        let args = settings(Some("audio/song.mp3")).segment_args(
            Path::new("screenshot.png"),
            None,
            Duration::from_secs(300),
            &endpoint(),
        );
        assert_eq!(args.iter().filter(|a| *a == "-i").count(), 2);
        assert_eq!(value_after(&args, "-filter_complex"), Some("[1:a]volume=0.04[aout]"));
    }

    #[test]
    fn unbounded_pipe_uses_silent_track() {
        let args = settings(None).pipe_args(None, None, &endpoint());
        assert_eq!(value_after(&args, "-s"), Some("1920x1080"));
        assert_eq!(value_after(&args, "-pix_fmt"), Some("rgba"));
        assert_eq!(value_after(&args, "-g"), Some("60"));
        assert!(args.iter().any(|a| a.starts_with("anullsrc")));
        assert!(value_after(&args, "-t").is_none());
        assert!(value_after(&args, "-filter_complex").is_none());
    }

    #[test]
    fn bounded_pipe_session_mixes_audio() {
        let args = settings(Some("song.mp3")).pipe_args(
            Some(Path::new("news.wav")),
            Some(Duration::from_millis(340_500)),
            &endpoint(),
        );
        assert_eq!(value_after(&args, "-i"), Some("pipe:0"));
        assert_eq!(value_after(&args, "-t"), Some("340.500"));
        assert!(value_after(&args, "-filter_complex").unwrap().contains("amix=inputs=2"));
    }

    #[test]
    fn logged_command_hides_key() {
        let ep = endpoint();
        let args = settings(None).pipe_args(None, None, &ep);
        let shown = display_command("ffmpeg", &args, &ep);
        assert!(!shown.contains("abcd-1234-efgh"));
        assert!(shown.ends_with("live2/STREAM_KEY_HIDDEN"));
    }
}
