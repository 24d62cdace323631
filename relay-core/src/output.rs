use std::collections::HashMap;

use ffmpeg_next::{Dictionary, Rational};

use crate::{packet::RawPacket, stream::AvStream};

/// A muxer writing to one URL. Streams are registered by their unified
/// index before the first packet; the header goes out with the first packet.
pub struct AvOutput {
    url: String,
    inner: ffmpeg_next::format::context::Output,
    /// unified index -> muxer stream index
    streams: HashMap<usize, usize>,
    drop_on_close: bool,
    have_written_header: bool,
    have_written_trailer: bool,
}

impl AvOutput {
    pub fn new(url: &str, format: Option<&str>, options: Dictionary) -> anyhow::Result<Self> {
        let output = match format {
            Some(format) => ffmpeg_next::format::output_as_with(&url, format, options)?,
            None => ffmpeg_next::format::output_with(&url, options)?,
        };
        Ok(Self {
            url: url.to_string(),
            inner: output,
            streams: HashMap::new(),
            drop_on_close: false,
            have_written_header: false,
            have_written_trailer: false,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn set_drop_on_close(&mut self, drop_on_close: bool) {
        self.drop_on_close = drop_on_close;
    }

    pub fn add_stream(&mut self, stream: &AvStream) -> anyhow::Result<()> {
        if self.have_written_header {
            anyhow::bail!("{}: cannot add stream {} after header", self.url, stream.index());
        }
        let codec_parameters = stream.parameters();
        let mut writer_stream = self
            .inner
            .add_stream(ffmpeg_next::encoder::find(codec_parameters.id()))?;
        writer_stream.set_parameters(codec_parameters.clone());
        writer_stream.set_time_base(stream.time_base());
        // let the muxer pick the tag for its container
        unsafe {
            (*(*writer_stream.as_mut_ptr()).codecpar).codec_tag = 0;
        }
        self.streams.insert(stream.index(), writer_stream.index());
        Ok(())
    }

    pub fn write_packet(&mut self, mut packet: RawPacket) -> anyhow::Result<()> {
        if !self.have_written_header {
            self.inner.write_header()?;
            self.have_written_header = true;
        }
        let time_base = packet.time_base();
        let writer_stream_index = *self
            .streams
            .get(&packet.index())
            .ok_or_else(|| anyhow::anyhow!("{}: stream {} not found", self.url, packet.index()))?;
        let out_time_base: Rational = self
            .inner
            .stream(writer_stream_index)
            .map(|s| s.time_base())
            .ok_or_else(|| anyhow::anyhow!("{}: muxer stream {} missing", self.url, writer_stream_index))?;

        let p = packet.get_mut();
        p.set_stream(writer_stream_index);
        p.set_position(-1);
        p.rescale_ts(time_base, out_time_base);
        p.write_interleaved(&mut self.inner)?;
        Ok(())
    }

    /// Writes the trailer, unless buffered data is to be dropped on close.
    pub fn finish(&mut self) -> anyhow::Result<()> {
        if self.have_written_header && !self.have_written_trailer {
            self.have_written_trailer = true;
            if self.drop_on_close {
                log::debug!("{}: closing without trailer", self.url);
                return Ok(());
            }
            self.inner.write_trailer()?;
        }
        Ok(())
    }
}

unsafe impl Send for AvOutput {}
