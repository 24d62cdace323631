use ffmpeg_next::Rational;

use crate::{hw::find_hw_decoder, packet::RawPacket, stream::AvStream};

/// Video decoder of the transcode path. Frames come out with their pts in
/// the stream's time base.
pub struct VideoDecoder {
    stream: AvStream,
    inner: ffmpeg_next::codec::decoder::Video,
    codec_name: String,
}

impl VideoDecoder {
    pub fn new(stream: &AvStream, hardware_device_type: Option<&str>) -> anyhow::Result<Self> {
        if !stream.is_video() {
            anyhow::bail!("stream {} is not a video stream", stream.index());
        }

        let hw_codec = hardware_device_type.and_then(|t| find_hw_decoder(stream.codec_id(), t));
        if let Some(codec) = hw_codec {
            match Self::open(stream, Some(codec)) {
                Ok(decoder) => return Ok(decoder),
                Err(e) => log::warn!(
                    "hardware decoder {} failed: {}, falling back to software",
                    codec.name(),
                    e
                ),
            }
        }
        Self::open(stream, None)
    }

    fn open(stream: &AvStream, codec: Option<ffmpeg_next::Codec>) -> anyhow::Result<Self> {
        let mut decoder_ctx = ffmpeg_next::codec::Context::new();
        unsafe {
            (*decoder_ctx.as_mut_ptr()).time_base = stream.time_base().into();
            (*decoder_ctx.as_mut_ptr()).pkt_timebase = stream.time_base().into();
        }
        decoder_ctx.set_parameters(stream.parameters().clone())?;

        let inner = match codec {
            Some(codec) => decoder_ctx.decoder().open_as(codec)?.video()?,
            None => decoder_ctx.decoder().video()?,
        };
        if inner.width() == 0 || inner.height() == 0 {
            return Err(anyhow::anyhow!(
                "missing codec parameters for stream {}",
                stream.index()
            ));
        }
        let codec_name = inner
            .codec()
            .map(|c| c.name().to_string())
            .unwrap_or_else(|| stream.codec_name().to_string());
        log::info!(
            "decoder {} opened for stream {} ({}x{})",
            codec_name,
            stream.index(),
            inner.width(),
            inner.height()
        );

        Ok(Self {
            stream: stream.clone(),
            inner,
            codec_name,
        })
    }

    pub fn codec_name(&self) -> &str {
        &self.codec_name
    }

    pub fn time_base(&self) -> Rational {
        self.stream.time_base()
    }

    pub fn send_packet(&mut self, mut packet: RawPacket) -> anyhow::Result<()> {
        packet.rescale_to(self.stream.time_base());
        self.inner.send_packet(packet.packet())?;
        Ok(())
    }

    pub fn send_eof(&mut self) -> anyhow::Result<()> {
        self.inner.send_eof()?;
        Ok(())
    }

    pub fn receive_frame(&mut self) -> anyhow::Result<Option<ffmpeg_next::frame::Video>> {
        let mut frame = ffmpeg_next::frame::Video::empty();
        match self.inner.receive_frame(&mut frame) {
            Ok(()) => {
                if frame.pts().is_none() {
                    frame.set_pts(frame.timestamp());
                }
                Ok(Some(frame))
            }
            Err(ffmpeg_next::Error::Eof) => Ok(None),
            Err(ffmpeg_next::Error::Other { errno }) if errno == ffmpeg_next::util::error::EAGAIN => {
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }
}

unsafe impl Send for VideoDecoder {}
