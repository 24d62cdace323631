use std::net::SocketAddr;

use clap::Parser;
use relay_core::resource::Resource;

/// Live media relay: redundant inputs in, one templated output out, with
/// hot switching between passthrough and transcoding.
#[derive(Parser, Debug, Clone)]
#[command(name = "av-relay")]
#[command(version)]
#[command(long_about = "Relays live media from redundant inputs to one output.\n\n\
    EXAMPLES:\n    \
    av-relay -i rtsp://cam-a/main -i 1:rtsp://cam-b/main -o udp://239.0.0.1:1234\n    \
    av-relay -i 'srt://src:9000;latency=200' -o 'rtmp://live/{video_codec}_{resolution}' --retry-output\n    \
    av-relay -i cam.ts --video-codec libx264 --video-bitrate 2M -o out.flv --listen-control 127.0.0.1:8080")]
pub struct Cli {
    /// Input as [PRIORITY:]URL[;key=value...]; lower priorities are tried first,
    /// inputs sharing a priority are read together
    #[arg(short = 'i', long = "input", value_parser = parse_input)]
    pub inputs: Vec<Resource>,

    /// Output URL template; may use {video_codec}, {audio_codec}, {sample_rate}, {resolution}
    #[arg(short = 'o', long = "output")]
    pub outputs: Vec<String>,

    /// Output container format (guessed from the URL when omitted)
    #[arg(short = 'f', long = "format")]
    pub format: Option<String>,

    /// Output protocol/muxer option
    #[arg(long = "output-option", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub output_options: Vec<(String, String)>,

    /// Reconnect the output instead of failing when it breaks
    #[arg(long)]
    pub retry_output: bool,

    /// Delay between output reconnect attempts, in milliseconds
    #[arg(long, default_value_t = 1000)]
    pub retry_backoff_ms: u64,

    /// Discard buffered output data on close instead of flushing it
    #[arg(long)]
    pub drop_on_close: bool,

    /// Hardware device type for transcoding (cuda, qsv, vaapi, v4l2m2m)
    #[arg(long)]
    pub hwaccel: Option<String>,

    /// Hardware device name or index
    #[arg(long)]
    pub hwaccel_device: Option<String>,

    /// Video codec, or "copy" for passthrough
    #[arg(long, default_value = "copy")]
    pub video_codec: String,

    /// Video bitrate in bits per second (suffixes k and M accepted); with
    /// "copy" this is the passthrough ceiling
    #[arg(long, value_parser = parse_bitrate)]
    pub video_bitrate: Option<u64>,

    /// Averaging window of the video bitrate, in milliseconds
    #[arg(long, default_value_t = 1000)]
    pub averaging_period_ms: u64,

    /// Video encoder option
    #[arg(long = "video-option", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub video_options: Vec<(String, String)>,

    /// Audio codec; only "copy" is supported
    #[arg(long, default_value = "copy")]
    pub audio_codec: String,

    /// Audio encoder option
    #[arg(long = "audio-option", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub audio_options: Vec<(String, String)>,

    /// Run passthrough and transcode side by side on separate tracks
    #[arg(long)]
    pub separate_tracks: bool,

    /// With --separate-tracks, keep one in N non-key units per track
    #[arg(long)]
    pub sample_every: Option<u64>,

    /// Units the output queue may hold before new ones are dropped
    #[arg(long, default_value_t = relay_core::sender::DEFAULT_QUEUE_TOLERANCE)]
    pub queue_tolerance: usize,

    /// Keep NUM of every DEN decoded frames when transcoding
    #[arg(long, value_name = "NUM/DEN", value_parser = parse_fraction)]
    pub fps_fraction: Option<(u32, u32)>,

    /// Enable queue-driven bitrate adaptation with this step (bits per second)
    #[arg(long, value_parser = parse_bitrate)]
    pub auto_bitrate_step: Option<u64>,

    /// Address of the HTTP control surface
    #[arg(long)]
    pub listen_control: Option<SocketAddr>,

    /// List the available encoders and exit
    #[arg(long)]
    pub encoders: bool,

    /// List the available decoders and exit
    #[arg(long)]
    pub decoders: bool,

    #[arg(long, hide = true)]
    pub map: Vec<String>,

    #[arg(long = "filter-complex", hide = true)]
    pub filter_complex: Option<String>,

    #[arg(long, hide = true)]
    pub vf: Option<String>,

    #[arg(long, hide = true)]
    pub af: Option<String>,
}

impl Cli {
    /// Options that are accepted by the parser only to be refused with a
    /// clear message.
    pub fn reject_unsupported(&self) -> anyhow::Result<()> {
        if !self.map.is_empty() {
            anyhow::bail!("--map is not supported: every input stream is forwarded");
        }
        if self.filter_complex.is_some() {
            anyhow::bail!("--filter-complex is not supported: no filter graphs are applied");
        }
        if self.vf.is_some() || self.af.is_some() {
            anyhow::bail!("--vf/--af are not supported: frames are never filtered");
        }
        Ok(())
    }
}

pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {:?}", s)),
    }
}

/// `[PRIORITY:]URL[;key=value...]`. A prefix is a priority only when it is
/// all digits, so `rtsp://...` and `C:\...` stay URLs.
pub fn parse_input(s: &str) -> Result<Resource, String> {
    let mut parts = s.split(';');
    let head = parts.next().unwrap_or_default();
    let (priority, url) = match head.split_once(':') {
        Some((prefix, rest))
            if !prefix.is_empty() && prefix.chars().all(|c| c.is_ascii_digit()) =>
        {
            let priority = prefix
                .parse::<u32>()
                .map_err(|e| format!("bad priority {:?}: {}", prefix, e))?;
            (priority, rest)
        }
        _ => (0, head),
    };
    if url.is_empty() {
        return Err(format!("missing URL in {:?}", s));
    }
    let mut resource = Resource::new(url, priority);
    for option in parts.filter(|p| !p.is_empty()) {
        let (key, value) = parse_key_value(option)?;
        resource = resource.with_option(&key, &value);
    }
    Ok(resource)
}

pub fn parse_bitrate(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let (digits, scale) = match s.chars().last() {
        Some('k') | Some('K') => (&s[..s.len() - 1], 1_000),
        Some('m') | Some('M') => (&s[..s.len() - 1], 1_000_000),
        _ => (s, 1),
    };
    digits
        .parse::<u64>()
        .map(|v| v * scale)
        .map_err(|e| format!("bad bitrate {:?}: {}", s, e))
}

pub fn parse_fraction(s: &str) -> Result<(u32, u32), String> {
    let (num, den) = s
        .split_once('/')
        .ok_or_else(|| format!("expected NUM/DEN, got {:?}", s))?;
    let num = num.parse().map_err(|e| format!("bad numerator {:?}: {}", num, e))?;
    let den = den.parse().map_err(|e| format!("bad denominator {:?}: {}", den, e))?;
    Ok((num, den))
}
