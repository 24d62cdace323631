//! Hot reconfiguration of the transcode path.

use std::{sync::Arc, time::Duration};

use ffmpeg_next::Rational;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    codec::{CodecEngine, FpsFraction, Quality, Transcoder, TranscoderSettings},
    error::RelayError,
    packet::RawPacket,
    stream::AvStream,
    switch::{PathKind, Switch},
    throttle::{BitrateThrottle, DEFAULT_AVERAGING_PERIOD},
};

pub const COPY: &str = "copy";

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

fn default_averaging_period() -> Duration {
    DEFAULT_AVERAGING_PERIOD
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecConfig {
    pub codec_name: String,
    #[serde(
        rename = "averaging_period_ms",
        with = "duration_ms",
        default = "default_averaging_period"
    )]
    pub averaging_period: Duration,
    /// Bits per second; 0 means codec default (or no ceiling for "copy").
    #[serde(default)]
    pub average_bit_rate: u64,
    #[serde(default)]
    pub custom_options: Vec<(String, String)>,
    #[serde(default)]
    pub hardware_device_type: String,
    #[serde(default)]
    pub hardware_device_name: String,
}

impl CodecConfig {
    pub fn copy() -> Self {
        Self::new(COPY)
    }

    pub fn new(codec_name: &str) -> Self {
        Self {
            codec_name: codec_name.to_string(),
            averaging_period: DEFAULT_AVERAGING_PERIOD,
            average_bit_rate: 0,
            custom_options: Vec::new(),
            hardware_device_type: String::new(),
            hardware_device_name: String::new(),
        }
    }

    pub fn with_bit_rate(mut self, bit_rate: u64) -> Self {
        self.average_bit_rate = bit_rate;
        self
    }

    pub fn is_copy(&self) -> bool {
        self.codec_name == COPY
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoderConfig {
    pub audio: CodecConfig,
    pub video: CodecConfig,
}

impl Default for RecoderConfig {
    fn default() -> Self {
        Self {
            audio: CodecConfig::copy(),
            video: CodecConfig::copy(),
        }
    }
}

impl RecoderConfig {
    /// The path the switch starts on for this configuration.
    pub fn initial_path(&self) -> PathKind {
        if self.video.is_copy() {
            PathKind::Passthrough
        } else {
            PathKind::Transcode
        }
    }
}

struct RecoderState {
    config: RecoderConfig,
    /// The encoder factory: settings the live transcoder is built from.
    factory: Option<TranscoderSettings>,
    live: Option<Box<dyn Transcoder>>,
    /// The live transcoder is out with the worker, encoding.
    checked_out: bool,
    output_stream: Option<AvStream>,
    fps: FpsFraction,
}

/// Owns the transcoder and its configuration. One lock guards both, so
/// readers never see a half-applied configuration. The lock is never held
/// while a transcoder is opened or encodes: the worker checks the live
/// transcoder out, and changes made meanwhile are applied on check-in.
pub struct RecoderManager {
    engine: Arc<dyn CodecEngine>,
    switch: Arc<Switch>,
    throttle: Arc<BitrateThrottle>,
    global_header: bool,
    state: Mutex<RecoderState>,
}

impl RecoderManager {
    pub fn new(
        engine: Arc<dyn CodecEngine>,
        switch: Arc<Switch>,
        throttle: Arc<BitrateThrottle>,
        global_header: bool,
    ) -> Self {
        Self {
            engine,
            switch,
            throttle,
            global_header,
            state: Mutex::new(RecoderState {
                config: RecoderConfig::default(),
                factory: None,
                live: None,
                checked_out: false,
                output_stream: None,
                fps: FpsFraction::default(),
            }),
        }
    }

    pub fn time_base(&self) -> Rational {
        self.engine.time_base()
    }

    fn settings_for(&self, video: &CodecConfig, fps: FpsFraction) -> TranscoderSettings {
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        TranscoderSettings {
            codec_name: video.codec_name.clone(),
            bit_rate: video.average_bit_rate,
            options: video.custom_options.clone(),
            hardware_device_type: non_empty(&video.hardware_device_type),
            hardware_device_name: non_empty(&video.hardware_device_name),
            fps,
            global_header: self.global_header,
        }
    }

    pub fn configure(&self, config: RecoderConfig) -> anyhow::Result<()> {
        if !config.audio.is_copy() {
            return Err(RelayError::AudioTranscodingUnsupported(config.audio.codec_name).into());
        }

        let mut state = self.state.lock();
        if config.video.is_copy() {
            self.throttle
                .arm(config.video.average_bit_rate, config.video.averaging_period);
            self.switch.request_value(PathKind::Passthrough);
            state.config = config;
            return Ok(());
        }

        let bit_rate = config.video.average_bit_rate;
        let current_codec = state.factory.as_ref().map(|f| f.codec_name.clone());
        match current_codec {
            Some(current) if current != config.video.codec_name => {
                return Err(RelayError::CodecChangeUnsupported {
                    current,
                    requested: config.video.codec_name.clone(),
                }
                .into());
            }
            Some(_) => {}
            None => {
                log::info!("creating {} encoder factory", config.video.codec_name);
                state.factory = Some(self.settings_for(&config.video, state.fps));
            }
        }

        let state = &mut *state;
        if let Some(live) = state.live.as_mut() {
            let target = Quality::ConstantBitrate(bit_rate);
            if bit_rate > 0 && live.quality() != target {
                live.set_quality(target)?;
            }
        }
        if let Some(factory) = state.factory.as_mut() {
            factory.bit_rate = bit_rate;
            factory.options = config.video.custom_options.clone();
        }

        self.switch.request_value(PathKind::Transcode);
        state.config = config;
        Ok(())
    }

    /// The applied configuration; video reads "copy" while passthrough is live.
    pub fn recoder_config(&self) -> RecoderConfig {
        let state = self.state.lock();
        let mut config = state.config.clone();
        if self.switch.current() == PathKind::Passthrough {
            config.video.codec_name = COPY.to_string();
        }
        config
    }

    /// Retargets the encoder bitrate without touching the switch.
    pub fn set_video_bitrate(&self, bit_rate: u64) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        let state = &mut *state;
        if state.config.video.is_copy() {
            return Ok(());
        }
        state.config.video.average_bit_rate = bit_rate;
        if let Some(live) = state.live.as_mut() {
            let target = Quality::ConstantBitrate(bit_rate);
            if live.quality() != target {
                live.set_quality(target)?;
            }
        }
        if let Some(factory) = state.factory.as_mut() {
            factory.bit_rate = bit_rate;
        }
        Ok(())
    }

    pub fn video_bitrate(&self) -> Option<u64> {
        let state = self.state.lock();
        match (&state.live, &state.factory) {
            (Some(live), _) => {
                let Quality::ConstantBitrate(b) = live.quality();
                Some(b)
            }
            (None, Some(factory)) => Some(factory.bit_rate),
            (None, None) => None,
        }
    }

    pub fn fps_fraction(&self) -> FpsFraction {
        self.state.lock().fps
    }

    pub fn set_fps_fraction(&self, fps: FpsFraction) {
        let mut state = self.state.lock();
        if state.fps == fps {
            return;
        }
        state.fps = fps;
        if let Some(factory) = state.factory.as_mut() {
            factory.fps = fps;
        }
        if let Some(live) = state.live.as_mut() {
            live.set_fps_fraction(fps);
        }
        log::info!("fps fraction set to {}/{}", fps.num, fps.den);
    }

    pub fn has_factory(&self) -> bool {
        self.state.lock().factory.is_some()
    }

    pub fn has_live_encoder(&self) -> bool {
        let state = self.state.lock();
        state.live.is_some() || state.checked_out
    }

    pub fn output_stream(&self) -> Option<AvStream> {
        self.state.lock().output_stream.clone()
    }

    /// Runs `packet` of `stream` through the live transcoder, creating it
    /// from the factory on first use. Without a factory the packet passes
    /// unchanged, rescaled to the engine time base.
    pub fn transcode(&self, stream: &AvStream, mut packet: RawPacket) -> anyhow::Result<Vec<RawPacket>> {
        let Some((mut live, fps)) = self.check_out(stream)? else {
            packet.rescale_to(self.engine.time_base());
            return Ok(vec![packet]);
        };
        let out = live.transcode(packet);
        self.check_in(live, fps);
        out
    }

    /// Flushes the live transcoder and retires it. The factory stays, so the
    /// next transcoded unit opens a fresh encoder on its key frame.
    pub fn flush(&self) -> anyhow::Result<Vec<RawPacket>> {
        let Some(mut live) = self.state.lock().live.take() else {
            return Ok(Vec::new());
        };
        log::info!("retiring {} transcoder", live.codec_name());
        let out = live.flush();
        // keep describing what the path emitted until a new encoder reports
        if let Some(stream) = live.output_stream() {
            self.state.lock().output_stream = Some(stream);
        }
        out
    }

    fn check_out(&self, stream: &AvStream) -> anyhow::Result<Option<(Box<dyn Transcoder>, FpsFraction)>> {
        let settings = {
            let mut state = self.state.lock();
            if let Some(live) = state.live.take() {
                state.checked_out = true;
                return Ok(Some((live, state.fps)));
            }
            let Some(factory) = state.factory.clone() else {
                return Ok(None);
            };
            state.checked_out = true;
            factory
        };

        log::info!(
            "starting {} transcoder for stream {}",
            settings.codec_name,
            stream.index()
        );
        match self.engine.new_transcoder(stream, &settings) {
            Ok(live) => Ok(Some((live, settings.fps))),
            Err(e) => {
                self.state.lock().checked_out = false;
                Err(e)
            }
        }
    }

    fn check_in(&self, mut live: Box<dyn Transcoder>, fps: FpsFraction) {
        let mut state = self.state.lock();
        state.checked_out = false;
        if state.fps != fps {
            live.set_fps_fraction(state.fps);
        }
        if let Some(factory) = state.factory.as_ref() {
            let target = Quality::ConstantBitrate(factory.bit_rate);
            if factory.bit_rate > 0 && live.quality() != target {
                if let Err(e) = live.set_quality(target) {
                    log::warn!("cannot retarget {} to {:?}: {:#}", live.codec_name(), target, e);
                }
            }
        }
        if let Some(stream) = live.output_stream() {
            state.output_stream = Some(stream);
        }
        state.live = Some(live);
    }
}
