/// Registers FFmpeg components (formats, protocols, codecs). Call once at
/// startup before anything is opened.
pub fn init() -> anyhow::Result<()> {
    ffmpeg_next::init().map_err(|e| anyhow::anyhow!("ffmpeg_next init: {}", e))
}

pub mod abr;
pub mod bsf;
pub mod codec;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod forwarder;
pub mod hw;
pub mod input;
pub mod node;
pub mod output;
pub mod packet;
pub mod recoder;
pub mod resource;
pub mod runtime;
pub mod scaler;
pub mod sender;
pub mod stream;
pub mod stream_index;
pub mod switch;
pub mod throttle;
