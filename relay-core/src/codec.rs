//! The codec engine boundary and its FFmpeg implementation.

use std::collections::VecDeque;

use ffmpeg_next::{Rational, Rescale};
use serde::{Deserialize, Serialize};

use crate::{
    decoder::VideoDecoder,
    encoder::{self, VideoEncoder},
    packet::{MediaType, RawPacket},
    stream::AvStream,
};

/// Microseconds, the time base every transcoded packet carries.
pub const ENGINE_TIME_BASE: Rational = Rational(1, 1_000_000);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    /// Bits per second.
    ConstantBitrate(u64),
}

/// Keep `num` of every `den` decoded video frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FpsFraction {
    pub num: u32,
    pub den: u32,
}

impl Default for FpsFraction {
    fn default() -> Self {
        Self { num: 1, den: 1 }
    }
}

impl FpsFraction {
    pub fn new(num: u32, den: u32) -> anyhow::Result<Self> {
        if num == 0 || den == 0 || num > den {
            anyhow::bail!("invalid fps fraction {}/{}: need 0 < num <= den", num, den);
        }
        Ok(Self { num, den })
    }

    pub fn is_identity(&self) -> bool {
        self.num == self.den
    }

    /// Whether the `index`-th decoded frame is kept; kept frames are spread
    /// evenly over each group of `den`.
    pub fn keeps(&self, index: u64) -> bool {
        if self.den == 0 || self.num >= self.den {
            return true;
        }
        (index * self.num as u64) % self.den as u64 < self.num as u64
    }
}

/// What a transcoder is built from; the staged state of the encoder factory.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct TranscoderSettings {
    pub codec_name: String,
    pub bit_rate: u64,
    pub options: Vec<(String, String)>,
    pub hardware_device_type: Option<String>,
    pub hardware_device_name: Option<String>,
    pub fps: FpsFraction,
    pub global_header: bool,
}

/// A live decode+encode chain for one video stream.
pub trait Transcoder: Send {
    fn codec_name(&self) -> &str;
    /// The encoded stream; `None` until the encoder saw its first frame.
    fn output_stream(&self) -> Option<AvStream>;
    fn quality(&self) -> Quality;
    fn set_quality(&mut self, quality: Quality) -> anyhow::Result<()>;
    fn set_fps_fraction(&mut self, fps: FpsFraction);
    /// Feeds one packet, returns whatever the encoder produced (possibly nothing).
    fn transcode(&mut self, packet: RawPacket) -> anyhow::Result<Vec<RawPacket>>;
    fn flush(&mut self) -> anyhow::Result<Vec<RawPacket>>;
}

pub trait CodecEngine: Send + Sync {
    /// Time base of everything a transcoder emits.
    fn time_base(&self) -> Rational;
    fn new_transcoder(
        &self,
        input: &AvStream,
        settings: &TranscoderSettings,
    ) -> anyhow::Result<Box<dyn Transcoder>>;
}

#[derive(Default)]
pub struct FfmpegCodecEngine;

impl CodecEngine for FfmpegCodecEngine {
    fn time_base(&self) -> Rational {
        ENGINE_TIME_BASE
    }

    fn new_transcoder(
        &self,
        input: &AvStream,
        settings: &TranscoderSettings,
    ) -> anyhow::Result<Box<dyn Transcoder>> {
        Ok(Box::new(FfmpegTranscoder::new(input, settings.clone())?))
    }
}

pub struct FfmpegTranscoder {
    input: AvStream,
    settings: TranscoderSettings,
    decoder: VideoDecoder,
    encoder: Option<VideoEncoder>,
    frame_count: u64,
    /// pts of key packets whose frames must come out as key frames
    key_pts: VecDeque<i64>,
}

impl FfmpegTranscoder {
    pub fn new(input: &AvStream, settings: TranscoderSettings) -> anyhow::Result<Self> {
        let decoder = VideoDecoder::new(input, settings.hardware_device_type.as_deref())?;
        Ok(Self {
            input: input.clone(),
            settings,
            decoder,
            encoder: None,
            frame_count: 0,
            key_pts: VecDeque::new(),
        })
    }

    fn open_encoder(&self, frame: &ffmpeg_next::frame::Video) -> anyhow::Result<VideoEncoder> {
        let rate = self.input.rate();
        let frame_rate = if rate.numerator() > 0 && rate.denominator() > 0 {
            Rational::new(
                rate.numerator() * self.settings.fps.num as i32,
                rate.denominator() * self.settings.fps.den as i32,
            )
            .reduce()
        } else {
            Rational::new(25, 1)
        };
        VideoEncoder::new(&encoder::Settings {
            codec: self.settings.codec_name.clone(),
            width: frame.width(),
            height: frame.height(),
            source_format: frame.format(),
            frame_rate,
            time_base: ENGINE_TIME_BASE,
            bit_rate: self.settings.bit_rate,
            options: self.settings.options.clone(),
            hardware_device_type: self.settings.hardware_device_type.clone(),
            hardware_device_name: self.settings.hardware_device_name.clone(),
            global_header: self.settings.global_header,
        })
    }

    fn take_key(&mut self, pts: Option<i64>) -> bool {
        let Some(pts) = pts else {
            return false;
        };
        while self.key_pts.front().is_some_and(|k| *k < pts) {
            self.key_pts.pop_front();
        }
        if self.key_pts.front() == Some(&pts) {
            self.key_pts.pop_front();
            return true;
        }
        false
    }

    fn drain_decoder(&mut self, out: &mut Vec<RawPacket>) -> anyhow::Result<()> {
        while let Some(mut frame) = self.decoder.receive_frame()? {
            let force_key = self.take_key(frame.pts());
            let index = self.frame_count;
            self.frame_count += 1;
            if !self.settings.fps.keeps(index) && !force_key {
                continue;
            }

            if self.encoder.is_none() {
                self.encoder = Some(self.open_encoder(&frame)?);
            }
            let Some(encoder) = self.encoder.as_mut() else {
                continue;
            };
            let input_tb = self.input.time_base();
            frame.set_pts(frame.pts().map(|pts| pts.rescale(input_tb, encoder.time_base())));
            encoder.send_frame(&frame, force_key)?;
            Self::drain_encoder(encoder, self.input.index(), out)?;
        }
        Ok(())
    }

    fn drain_encoder(
        encoder: &mut VideoEncoder,
        index: usize,
        out: &mut Vec<RawPacket>,
    ) -> anyhow::Result<()> {
        while let Some(mut packet) = encoder.receive_packet()? {
            packet.set_stream(index);
            out.push(RawPacket::new(packet, encoder.time_base(), MediaType::Video));
        }
        Ok(())
    }
}

impl Transcoder for FfmpegTranscoder {
    fn codec_name(&self) -> &str {
        &self.settings.codec_name
    }

    fn output_stream(&self) -> Option<AvStream> {
        let encoder = self.encoder.as_ref()?;
        Some(AvStream::new(
            self.input.index(),
            encoder.parameters(),
            encoder.time_base(),
            encoder.frame_rate(),
        ))
    }

    fn quality(&self) -> Quality {
        match &self.encoder {
            Some(encoder) => Quality::ConstantBitrate(encoder.bit_rate()),
            None => Quality::ConstantBitrate(self.settings.bit_rate),
        }
    }

    fn set_quality(&mut self, quality: Quality) -> anyhow::Result<()> {
        let Quality::ConstantBitrate(bit_rate) = quality;
        self.settings.bit_rate = bit_rate;
        if let Some(encoder) = self.encoder.as_mut() {
            log::info!("{}: bitrate -> {} bps", encoder.codec_name(), bit_rate);
            encoder.set_bit_rate(bit_rate);
        }
        Ok(())
    }

    fn set_fps_fraction(&mut self, fps: FpsFraction) {
        self.settings.fps = fps;
        self.frame_count = 0;
    }

    fn transcode(&mut self, packet: RawPacket) -> anyhow::Result<Vec<RawPacket>> {
        if packet.is_key() {
            let mut rescaled = packet.clone();
            rescaled.rescale_to(self.input.time_base());
            if let Some(pts) = rescaled.pts() {
                self.key_pts.push_back(pts);
                if self.key_pts.len() > 16 {
                    self.key_pts.pop_front();
                }
            }
        }
        self.decoder.send_packet(packet)?;
        let mut out = Vec::new();
        self.drain_decoder(&mut out)?;
        Ok(out)
    }

    fn flush(&mut self) -> anyhow::Result<Vec<RawPacket>> {
        let mut out = Vec::new();
        self.decoder.send_eof()?;
        self.drain_decoder(&mut out)?;
        if let Some(encoder) = self.encoder.as_mut() {
            encoder.send_eof()?;
            Self::drain_encoder(encoder, self.input.index(), &mut out)?;
        }
        Ok(out)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodecKind {
    Encoder,
    Decoder,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CodecInfo {
    pub name: String,
    pub description: String,
    pub media_type: MediaType,
}

/// Every codec of `kind` compiled into the linked FFmpeg.
pub fn list_codecs(kind: CodecKind) -> Vec<CodecInfo> {
    let mut codecs = Vec::new();
    let mut opaque = std::ptr::null_mut();
    loop {
        let ptr = unsafe { ffmpeg_next::ffi::av_codec_iterate(&mut opaque) };
        if ptr.is_null() {
            break;
        }
        let matches = unsafe {
            match kind {
                CodecKind::Encoder => ffmpeg_next::ffi::av_codec_is_encoder(ptr) != 0,
                CodecKind::Decoder => ffmpeg_next::ffi::av_codec_is_decoder(ptr) != 0,
            }
        };
        if !matches {
            continue;
        }
        let codec = unsafe { ffmpeg_next::Codec::wrap(ptr as *mut _) };
        codecs.push(CodecInfo {
            name: codec.name().to_string(),
            description: codec.description().to_string(),
            media_type: codec.medium().into(),
        });
    }
    codecs.sort_by(|a, b| a.name.cmp(&b.name));
    codecs
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    /// Counters shared between a test and the transcoders it made.
    #[derive(Default)]
    pub struct EngineCounters {
        pub created: AtomicUsize,
        pub set_quality_calls: AtomicUsize,
        pub transcoded: AtomicUsize,
    }

    /// Re-encodes by prefixing every payload with 0xEE, in the engine time base.
    /// With `hold` set, each transcoder keeps that many units back the way a
    /// real encoder's lookahead does, and only hands them over on flush.
    pub struct MockEngine {
        pub counters: Arc<EngineCounters>,
        pub output_codec: ffmpeg_next::codec::Id,
        pub hold: usize,
    }

    impl MockEngine {
        pub fn new() -> Self {
            Self {
                counters: Arc::new(EngineCounters::default()),
                output_codec: ffmpeg_next::codec::Id::HEVC,
                hold: 0,
            }
        }

        pub fn with_hold(mut self, hold: usize) -> Self {
            self.hold = hold;
            self
        }
    }

    impl CodecEngine for MockEngine {
        fn time_base(&self) -> Rational {
            ENGINE_TIME_BASE
        }

        fn new_transcoder(
            &self,
            input: &AvStream,
            settings: &TranscoderSettings,
        ) -> anyhow::Result<Box<dyn Transcoder>> {
            self.counters.created.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(MockTranscoder {
                stream: AvStream::from_codec(
                    input.index(),
                    ffmpeg_next::media::Type::Video,
                    self.output_codec,
                    ENGINE_TIME_BASE,
                ),
                settings: settings.clone(),
                counters: Arc::clone(&self.counters),
                hold: self.hold,
                held: VecDeque::new(),
                emitted: false,
            }))
        }
    }

    pub struct MockTranscoder {
        stream: AvStream,
        settings: TranscoderSettings,
        counters: Arc<EngineCounters>,
        hold: usize,
        held: VecDeque<RawPacket>,
        emitted: bool,
    }

    impl Transcoder for MockTranscoder {
        fn codec_name(&self) -> &str {
            &self.settings.codec_name
        }

        fn output_stream(&self) -> Option<AvStream> {
            self.emitted.then(|| self.stream.clone())
        }

        fn quality(&self) -> Quality {
            Quality::ConstantBitrate(self.settings.bit_rate)
        }

        fn set_quality(&mut self, quality: Quality) -> anyhow::Result<()> {
            self.counters.set_quality_calls.fetch_add(1, Ordering::SeqCst);
            let Quality::ConstantBitrate(bit_rate) = quality;
            self.settings.bit_rate = bit_rate;
            Ok(())
        }

        fn set_fps_fraction(&mut self, fps: FpsFraction) {
            self.settings.fps = fps;
        }

        fn transcode(&mut self, mut packet: RawPacket) -> anyhow::Result<Vec<RawPacket>> {
            self.counters.transcoded.fetch_add(1, Ordering::SeqCst);
            packet.rescale_to(ENGINE_TIME_BASE);
            let mut data = vec![0xEE];
            data.extend_from_slice(&packet.data());
            self.held.push_back(packet.with_data(&data));

            let mut out = Vec::new();
            while self.held.len() > self.hold {
                if let Some(packet) = self.held.pop_front() {
                    out.push(packet);
                }
            }
            self.emitted |= !out.is_empty();
            Ok(out)
        }

        fn flush(&mut self) -> anyhow::Result<Vec<RawPacket>> {
            let out: Vec<RawPacket> = self.held.drain(..).collect();
            self.emitted |= !out.is_empty();
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fps_fraction_keeps_evenly() {
        let half = FpsFraction::new(1, 2).unwrap();
        let kept: Vec<bool> = (0..4).map(|i| half.keeps(i)).collect();
        assert_eq!(kept, vec![true, false, true, false]);

        let two_thirds = FpsFraction::new(2, 3).unwrap();
        let kept = (0..30).filter(|i| two_thirds.keeps(*i)).count();
        assert_eq!(kept, 20);

        assert!((0..10).all(|i| FpsFraction::default().keeps(i)));
    }

    #[test]
    fn test_fps_fraction_validation() {
        assert!(FpsFraction::new(0, 1).is_err());
        assert!(FpsFraction::new(3, 2).is_err());
        assert!(FpsFraction::new(1, 0).is_err());
        assert!(FpsFraction::new(5, 5).unwrap().is_identity());
    }

    #[test]
    fn test_quality_json() {
        let q = serde_json::to_string(&Quality::ConstantBitrate(500_000)).unwrap();
        assert_eq!(q, r#"{"constant_bitrate":500000}"#);
    }
}
