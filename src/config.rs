//! Command line and environment configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser};

use crate::bridge::{BridgeLimits, BridgeManager, Bridges, EncoderSettings, Ffmpeg, RtmpTarget};

pub const YOUTUBE_DEFAULT_RTMP_URL: &str = "rtmp://a.rtmp.youtube.com/live2";
pub const FACEBOOK_DEFAULT_RTMP_URL: &str = "rtmps://live-api-s.facebook.com:443/rtmp";

#[derive(Clone, Debug, Parser)]
#[command(name = "prostream-hub", version, about = "Signaling hub and RTMP bridge for live church production")]
pub struct Config {
    /// WebSocket signaling listen address.
    #[arg(long, env = "PROSTREAM_SIGNAL_ADDR", default_value = "127.0.0.1:8080")]
    pub signal_addr: SocketAddr,

    /// HTTP listen address of the RTMP bridge.
    #[arg(long, env = "PROSTREAM_HTTP_ADDR", default_value = "127.0.0.1:8081")]
    pub http_addr: SocketAddr,

    /// Seconds an empty session is kept before it is dropped.
    #[arg(long, env = "PROSTREAM_SESSION_IDLE_SECS", default_value_t = 600)]
    pub session_idle_secs: u64,

    #[arg(long, env = "PROSTREAM_REAP_INTERVAL_SECS", default_value_t = 30)]
    pub reap_interval_secs: u64,

    /// Encoder executable.
    #[arg(long, env = "PROSTREAM_FFMPEG", default_value = "ffmpeg")]
    pub ffmpeg: PathBuf,

    /// Chunks queued per stream before new ones are rejected.
    #[arg(long, env = "PROSTREAM_MAX_PENDING_CHUNKS", default_value_t = 64)]
    pub max_pending_chunks: usize,

    #[arg(long, env = "PROSTREAM_MAX_CHUNK_BYTES", default_value_t = 8 * 1024 * 1024)]
    pub max_chunk_bytes: usize,

    #[command(flatten)]
    pub encoder: EncoderArgs,

    #[arg(long, env = "YOUTUBE_RTMP_URL", default_value = YOUTUBE_DEFAULT_RTMP_URL)]
    pub youtube_rtmp_url: String,

    #[arg(long, env = "YOUTUBE_STREAM_KEY", hide_env_values = true)]
    pub youtube_stream_key: Option<String>,

    #[arg(long, env = "YOUTUBE_VIDEO_BITRATE", default_value = "700k")]
    pub youtube_video_bitrate: String,

    #[arg(long, env = "YOUTUBE_VIDEO_MAXRATE", default_value = "850k")]
    pub youtube_video_maxrate: String,

    #[arg(long, env = "YOUTUBE_VIDEO_BUFSIZE", default_value = "1700k")]
    pub youtube_video_bufsize: String,

    #[arg(long, env = "FACEBOOK_RTMP_URL", default_value = FACEBOOK_DEFAULT_RTMP_URL)]
    pub facebook_rtmp_url: String,

    #[arg(long, env = "FACEBOOK_STREAM_KEY", hide_env_values = true)]
    pub facebook_stream_key: Option<String>,

    #[arg(long, env = "FACEBOOK_VIDEO_BITRATE", default_value = "800k")]
    pub facebook_video_bitrate: String,

    #[arg(long, env = "FACEBOOK_VIDEO_MAXRATE", default_value = "900k")]
    pub facebook_video_maxrate: String,

    #[arg(long, env = "FACEBOOK_VIDEO_BUFSIZE", default_value = "1800k")]
    pub facebook_video_bufsize: String,
}

/// Encoder parameters shared by every platform.
#[derive(Clone, Debug, Args)]
pub struct EncoderArgs {
    /// Output height; the width follows the source aspect ratio.
    #[arg(long, env = "PROSTREAM_VIDEO_HEIGHT", default_value_t = 480)]
    pub height: u32,

    #[arg(long, env = "PROSTREAM_FRAMERATE", default_value_t = 24)]
    pub framerate: u32,

    /// Frames between keyframes.
    #[arg(long, env = "PROSTREAM_KEYFRAME_INTERVAL", default_value_t = 48)]
    pub keyframe_interval: u32,

    #[arg(long, env = "PROSTREAM_AUDIO_BITRATE", default_value = "64k")]
    pub audio_bitrate: String,

    #[arg(long, env = "PROSTREAM_X264_PRESET", default_value = "ultrafast")]
    pub preset: String,
}

impl EncoderArgs {
    fn settings(&self, video_bitrate: &str, max_rate: &str, buffer_size: &str) -> EncoderSettings {
        EncoderSettings {
            preset: self.preset.clone(),
            height: self.height,
            framerate: self.framerate,
            keyframe_interval: self.keyframe_interval,
            video_bitrate: video_bitrate.to_string(),
            max_rate: max_rate.to_string(),
            buffer_size: buffer_size.to_string(),
            audio_bitrate: self.audio_bitrate.clone(),
            ..Default::default()
        }
    }
}

impl Config {
    pub fn session_idle(&self) -> Duration {
        Duration::from_secs(self.session_idle_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }

    pub fn bridge_limits(&self) -> BridgeLimits {
        BridgeLimits {
            max_pending_chunks: self.max_pending_chunks,
            max_chunk_bytes: self.max_chunk_bytes,
            ..Default::default()
        }
    }

    pub fn youtube_encoder(&self) -> EncoderSettings {
        self.encoder.settings(
            &self.youtube_video_bitrate,
            &self.youtube_video_maxrate,
            &self.youtube_video_bufsize,
        )
    }

    pub fn facebook_encoder(&self) -> EncoderSettings {
        self.encoder.settings(
            &self.facebook_video_bitrate,
            &self.facebook_video_maxrate,
            &self.facebook_video_bufsize,
        )
    }

    /// One bridge manager per platform. A platform without a stream key is
    /// still routed; starting a stream on it fails with a config error.
    pub fn bridges(&self) -> Bridges {
        let youtube = BridgeManager::new(
            "youtube",
            "yt",
            RtmpTarget::new(self.youtube_rtmp_url.as_str(), self.youtube_stream_key.clone()),
            Arc::new(Ffmpeg::new(&self.ffmpeg, self.youtube_encoder())),
            self.bridge_limits(),
        );
        let facebook = BridgeManager::new(
            "facebook",
            "fb",
            RtmpTarget::new(self.facebook_rtmp_url.as_str(), self.facebook_stream_key.clone()),
            Arc::new(Ffmpeg::new(&self.ffmpeg, self.facebook_encoder())),
            self.bridge_limits(),
        );
        Bridges::new([youtube, facebook])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::{CommandFactory, FromArgMatches};

    /// Parse without consulting the process environment.
    fn parse(args: &[&str]) -> Config {
        let matches = Config::command()
            .mut_args(|arg| arg.env(None::<&'static str>))
            .try_get_matches_from(args)
            .unwrap();
        Config::from_arg_matches(&matches).unwrap()
    }

    #[test]
    fn defaults() {
        let config = parse(&["prostream-hub"]);
        assert_eq!(config.signal_addr, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.http_addr, "127.0.0.1:8081".parse().unwrap());
        assert_eq!(config.session_idle(), Duration::from_secs(600));
        assert_eq!(config.max_pending_chunks, 64);
        assert_eq!(config.youtube_rtmp_url, YOUTUBE_DEFAULT_RTMP_URL);
        assert_eq!(config.youtube_encoder(), EncoderSettings::default());

        let facebook = config.facebook_encoder();
        assert_eq!(facebook.video_bitrate, "800k");
        assert_eq!(facebook.max_rate, "900k");
        assert_eq!(facebook.buffer_size, "1800k");
    }

    #[test]
    fn encoder_flags_override_both_platforms() {
        let config = parse(&[
            "prostream-hub",
            "--height",
            "720",
            "--framerate",
            "30",
            "--keyframe-interval",
            "60",
            "--audio-bitrate",
            "128k",
            "--youtube-video-bitrate",
            "2500k",
        ]);

        let youtube = config.youtube_encoder();
        assert_eq!(youtube.height, 720);
        assert_eq!(youtube.framerate, 30);
        assert_eq!(youtube.keyframe_interval, 60);
        assert_eq!(youtube.audio_bitrate, "128k");
        assert_eq!(youtube.video_bitrate, "2500k");

        let facebook = config.facebook_encoder();
        assert_eq!(facebook.height, 720);
        assert_eq!(facebook.video_bitrate, "800k");
    }

    #[test]
    fn every_platform_is_routed() {
        let config = parse(&[
            "prostream-hub",
            "--youtube-stream-key",
            "abcd-efgh",
            "--reap-interval-secs",
            "0",
        ]);
        let bridges = config.bridges();

        let mut platforms: Vec<_> = bridges.platforms().collect();
        platforms.sort_unstable();
        assert_eq!(platforms, ["facebook", "youtube"]);
        assert_eq!(config.reap_interval(), Duration::from_secs(1));
    }
}
