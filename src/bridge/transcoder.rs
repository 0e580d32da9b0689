//! Command lines for the external encoder.

use std::ffi::OsString;

use tokio::process::Command;

/// Encoder parameters for one platform.
#[derive(Clone, Debug, PartialEq)]
pub struct EncoderSettings {
    pub input_format: String,
    pub video_codec: String,
    pub preset: String,
    pub height: u32,
    pub framerate: u32,
    pub keyframe_interval: u32,
    pub video_bitrate: String,
    pub max_rate: String,
    pub buffer_size: String,
    pub pixel_format: String,
    pub audio_codec: String,
    pub audio_bitrate: String,
    pub sample_rate: u32,
    pub channels: u32,
    pub output_format: String,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        EncoderSettings {
            input_format: "webm".to_string(),
            video_codec: "libx264".to_string(),
            preset: "ultrafast".to_string(),
            height: 480,
            framerate: 24,
            keyframe_interval: 48,
            video_bitrate: "700k".to_string(),
            max_rate: "850k".to_string(),
            buffer_size: "1700k".to_string(),
            pixel_format: "yuv420p".to_string(),
            audio_codec: "aac".to_string(),
            audio_bitrate: "64k".to_string(),
            sample_rate: 44100,
            channels: 2,
            output_format: "flv".to_string(),
        }
    }
}

/// Builds the process that turns the incoming container stream (on stdin)
/// into an RTMP push to `destination`.
pub trait Transcoder: Send + Sync {
    fn command(&self, destination: &str) -> Command;
}

#[derive(Clone, Debug)]
pub struct Ffmpeg {
    program: OsString,
    settings: EncoderSettings,
}

impl Ffmpeg {
    pub fn new(program: impl Into<OsString>, settings: EncoderSettings) -> Self {
        Ffmpeg {
            program: program.into(),
            settings,
        }
    }

    pub fn settings(&self) -> &EncoderSettings {
        &self.settings
    }

    pub fn args(&self, destination: &str) -> Vec<String> {
        let s = &self.settings;
        let scale = format!("scale=-2:{}", s.height);
        let framerate = s.framerate.to_string();
        let keyframes = s.keyframe_interval.to_string();
        let sample_rate = s.sample_rate.to_string();
        let channels = s.channels.to_string();

        [
            "-re", "-f", s.input_format.as_str(), "-i", "pipe:0",
            "-c:v", s.video_codec.as_str(), "-preset", s.preset.as_str(),
            "-vf", scale.as_str(),
            "-b:v", s.video_bitrate.as_str(), "-maxrate", s.max_rate.as_str(), "-bufsize", s.buffer_size.as_str(),
            "-pix_fmt", s.pixel_format.as_str(),
            "-r", framerate.as_str(), "-g", keyframes.as_str(),
            "-c:a", s.audio_codec.as_str(), "-b:a", s.audio_bitrate.as_str(),
            "-ar", sample_rate.as_str(), "-ac", channels.as_str(),
            "-f", s.output_format.as_str(), destination,
        ]
        .iter()
        .map(|arg| arg.to_string())
        .collect()
    }
}

impl Transcoder for Ffmpeg {
    fn command(&self, destination: &str) -> Command {
        let mut command = Command::new(&self.program);
        command.arg("-hide_banner").args(self.args(destination));
        command
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|arg| arg == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn default_args_read_webm_from_stdin() {
        let args = Ffmpeg::new("ffmpeg", EncoderSettings::default()).args("rtmp://x/key");

        assert_eq!(&args[..5], ["-re", "-f", "webm", "-i", "pipe:0"]);
        assert_eq!(pair(&args, "-c:v"), Some("libx264"));
        assert_eq!(pair(&args, "-vf"), Some("scale=-2:480"));
        assert_eq!(pair(&args, "-b:v"), Some("700k"));
        assert_eq!(pair(&args, "-r"), Some("24"));
        assert_eq!(pair(&args, "-g"), Some("48"));
        assert_eq!(pair(&args, "-b:a"), Some("64k"));
        assert_eq!(pair(&args, "-ar"), Some("44100"));
        assert_eq!(args[args.len() - 3..], ["-f", "flv", "rtmp://x/key"]);
    }

    #[test]
    fn configured_rates_reach_the_command_line() {
        let settings = EncoderSettings {
            height: 720,
            framerate: 30,
            keyframe_interval: 60,
            video_bitrate: "800k".to_string(),
            max_rate: "900k".to_string(),
            buffer_size: "1800k".to_string(),
            audio_bitrate: "128k".to_string(),
            ..Default::default()
        };
        let args = Ffmpeg::new("ffmpeg", settings).args("rtmps://fb/key");
        assert_eq!(pair(&args, "-vf"), Some("scale=-2:720"));
        assert_eq!(pair(&args, "-b:v"), Some("800k"));
        assert_eq!(pair(&args, "-maxrate"), Some("900k"));
        assert_eq!(pair(&args, "-bufsize"), Some("1800k"));
        assert_eq!(pair(&args, "-r"), Some("30"));
        assert_eq!(pair(&args, "-g"), Some("60"));
        assert_eq!(pair(&args, "-b:a"), Some("128k"));
        assert_eq!(pair(&args, "-c:a"), Some("aac"));
    }
}
