use std::rc::Rc;

use ffmpeg_next::{Dictionary, Rational, codec::Parameters, format::Pixel, picture};

use crate::{
    hw::{device_option, find_hw_encoder, pixel_format_for_encoder},
    scaler::Scaler,
};

#[derive(Debug, Clone)]
pub struct Settings {
    pub codec: String,
    pub width: u32,
    pub height: u32,
    pub source_format: Pixel,
    pub frame_rate: Rational,
    pub time_base: Rational,
    /// Constant bitrate target in bits/s; 0 leaves the codec default.
    pub bit_rate: u64,
    pub options: Vec<(String, String)>,
    pub hardware_device_type: Option<String>,
    pub hardware_device_name: Option<String>,
    /// Codec configuration goes to extradata instead of in-band.
    pub global_header: bool,
}

/// Video encoder of the transcode path.
pub struct VideoEncoder {
    inner: ffmpeg_next::codec::encoder::Video,
    codec_name: String,
    time_base: Rational,
    frame_rate: Rational,
    bit_rate: u64,
    scaler: Option<Scaler>,
}

impl VideoEncoder {
    pub fn new(settings: &Settings) -> anyhow::Result<Self> {
        let hw_codec = settings
            .hardware_device_type
            .as_deref()
            .and_then(|t| find_hw_encoder(&settings.codec, t));

        if let Some(codec) = hw_codec {
            let hw_name = codec.name().to_string();
            log::info!("attempting hardware encoder: {}", hw_name);
            match Self::open(codec, &hw_name, settings) {
                Ok(encoder) => return Ok(encoder),
                Err(e) => log::warn!(
                    "hardware encoder {} failed: {}, falling back to {}",
                    hw_name,
                    e,
                    settings.codec
                ),
            }
        }

        let codec = ffmpeg_next::encoder::find_by_name(&settings.codec)
            .ok_or_else(|| anyhow::anyhow!("codec not found: {}", settings.codec))?;
        Self::open(codec, &settings.codec, settings)
    }

    fn open(
        codec: ffmpeg_next::Codec,
        codec_name: &str,
        settings: &Settings,
    ) -> anyhow::Result<Self> {
        let context = ffmpeg_next::codec::Context::new_with_codec(codec);
        let mut encoder = context.encoder().video()?;
        encoder.set_width(settings.width);
        encoder.set_height(settings.height);
        encoder.set_format(pixel_format_for_encoder(settings.source_format, codec_name));
        encoder.set_frame_rate(Some(settings.frame_rate));
        encoder.set_time_base(settings.time_base);
        if settings.global_header {
            encoder.set_flags(ffmpeg_next::codec::Flags::GLOBAL_HEADER);
        }
        if settings.bit_rate > 0 {
            encoder.set_bit_rate(settings.bit_rate as usize);
            unsafe {
                Self::write_rate_control(encoder.as_mut_ptr(), settings.bit_rate);
            }
        }

        let mut opts = Dictionary::new();
        if settings.options.is_empty() && codec_name.starts_with("libx26") {
            opts.set("preset", "ultrafast");
            opts.set("tune", "zerolatency");
        }
        for (key, value) in &settings.options {
            opts.set(key, value);
        }
        if let Some(name) = settings.hardware_device_name.as_deref() {
            if let Some((key, value)) = device_option(codec_name, name) {
                opts.set(key, &value);
            }
        }

        let opened = encoder.open_with(opts)?;
        log::info!(
            "encoder opened: {} {}x{} @ {} bps",
            codec_name,
            settings.width,
            settings.height,
            settings.bit_rate
        );
        let time_base: Rational = unsafe { (*opened.0.as_ptr()).time_base.into() };

        Ok(Self {
            inner: opened,
            codec_name: codec_name.to_string(),
            time_base,
            frame_rate: settings.frame_rate,
            bit_rate: settings.bit_rate,
            scaler: None,
        })
    }

    unsafe fn write_rate_control(ctx: *mut ffmpeg_next::ffi::AVCodecContext, bit_rate: u64) {
        let rate = bit_rate.min(i64::MAX as u64) as i64;
        unsafe {
            (*ctx).bit_rate = rate;
            (*ctx).rc_max_rate = rate;
            (*ctx).rc_buffer_size = rate.clamp(1, i32::MAX as i64) as i32;
        }
    }

    pub fn codec_name(&self) -> &str {
        &self.codec_name
    }

    pub fn time_base(&self) -> Rational {
        self.time_base
    }

    pub fn bit_rate(&self) -> u64 {
        self.bit_rate
    }

    /// Retargets a running encoder; encoders that support reconfiguration
    /// (libx264, nvenc) pick the new rate up on the next frame.
    pub fn set_bit_rate(&mut self, bit_rate: u64) {
        unsafe {
            Self::write_rate_control(self.inner.as_mut_ptr(), bit_rate);
        }
        self.bit_rate = bit_rate;
    }

    /// Codec parameters of what this encoder produces.
    pub fn parameters(&self) -> Parameters {
        let ctx: &ffmpeg_next::codec::Context = &self.inner;
        unsafe {
            let params = ffmpeg_next::ffi::avcodec_parameters_alloc();
            ffmpeg_next::ffi::avcodec_parameters_from_context(params, ctx.as_ptr());
            Parameters::wrap(params, None::<Rc<dyn std::any::Any>>)
        }
    }

    pub fn frame_rate(&self) -> Rational {
        self.frame_rate
    }

    pub fn send_frame(
        &mut self,
        frame: &ffmpeg_next::frame::Video,
        force_key: bool,
    ) -> anyhow::Result<()> {
        let needs_conversion = frame.format() != self.inner.format()
            || frame.width() != self.inner.width()
            || frame.height() != self.inner.height();

        let mut converted = if needs_conversion {
            let rebuild = self.scaler.as_ref().is_none_or(|s| !s.accepts(frame));
            if rebuild {
                self.scaler = Some(Scaler::new(
                    frame,
                    self.inner.format(),
                    self.inner.width(),
                    self.inner.height(),
                )?);
            }
            match self.scaler.as_mut() {
                Some(scaler) => scaler.run(frame)?,
                None => anyhow::bail!("no scaler for frame"),
            }
        } else {
            frame.clone()
        };

        converted.set_kind(if force_key {
            picture::Type::I
        } else {
            picture::Type::None
        });
        self.inner.send_frame(&converted)?;
        Ok(())
    }

    pub fn send_eof(&mut self) -> anyhow::Result<()> {
        self.inner.send_eof()?;
        Ok(())
    }

    pub fn receive_packet(&mut self) -> anyhow::Result<Option<ffmpeg_next::codec::packet::Packet>> {
        let mut packet = ffmpeg_next::codec::packet::Packet::empty();
        match self.inner.receive_packet(&mut packet) {
            Ok(()) => {
                let rate = self.frame_rate;
                if rate.numerator() > 0 && packet.duration() == 0 {
                    let duration = ffmpeg_next::Rescale::rescale(
                        &1i64,
                        Rational::new(rate.denominator(), rate.numerator()),
                        self.time_base,
                    );
                    packet.set_duration(duration);
                }
                Ok(Some(packet))
            }
            Err(ffmpeg_next::Error::Other { errno }) if errno == ffmpeg_next::util::error::EAGAIN => {
                Ok(None)
            }
            Err(ffmpeg_next::Error::Eof) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

unsafe impl Send for VideoEncoder {}
