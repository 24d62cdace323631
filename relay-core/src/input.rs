use std::collections::HashMap;
use std::ffi::CString;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use ffmpeg_next::Dictionary;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    error::RelayError,
    node::{NodeStatistics, PacketSourceProvider, Processor},
    packet::{MediaType, RawPacket, RawPacketCmd, RawPacketReceiver, RawPacketSender, SourceId},
    resource::{Resource, ResourceGroup, group_by_priority},
    stream::AvStream,
    stream_index::StreamIndexUnifier,
};

/// Resource option naming the demuxer/device instead of guessing it from the URL.
pub const FORMAT_OPTION: &str = "f";

/// One opened, URL-addressed packet source.
pub trait MediaSource: Send {
    fn url(&self) -> &str;
    fn streams(&self) -> Vec<AvStream>;
    /// `Ok(None)` at end of stream.
    fn read_packet(&mut self) -> anyhow::Result<Option<RawPacket>>;
    fn close(&mut self);
}

/// Opens resources; URL scheme dispatch lives behind this boundary.
pub trait SourceOpener: Send + Sync {
    fn open(&self, resource: &Resource) -> anyhow::Result<Box<dyn MediaSource>>;
}

pub struct AvInput {
    url: String,
    inner: Option<ffmpeg_next::format::context::Input>,
    streams: HashMap<usize, AvStream>,
}

impl AvInput {
    /// Resolve input format by name (e.g. "x11grab", "v4l2") via FFmpeg's av_find_input_format.
    fn find_input_format(name: &str) -> anyhow::Result<ffmpeg_next::format::format::Input> {
        let cname = CString::new(name)
            .map_err(|e| anyhow::anyhow!("invalid format name {:?}: {}", name, e))?;
        let ptr = unsafe { ffmpeg_next::ffi::av_find_input_format(cname.as_ptr()) };
        if ptr.is_null() {
            return Err(anyhow::anyhow!("input format not found: {}", name));
        }
        Ok(unsafe { ffmpeg_next::format::format::Input::wrap(ptr as *mut _) })
    }

    pub fn new(url: &str, format: Option<&str>, options: Dictionary) -> anyhow::Result<Self> {
        use ffmpeg_next::format::format::Format;

        let path = Path::new(url);
        let input = match format {
            Some(fmt_name) => {
                let fmt = Self::find_input_format(fmt_name)?;
                ffmpeg_next::format::open_with(path, &Format::Input(fmt), options)?.input()
            }
            None => ffmpeg_next::format::input_with_dictionary(path, options)?,
        };

        let mut streams = HashMap::new();
        for stream in input.streams() {
            streams.insert(stream.index(), AvStream::from(stream));
        }

        Ok(Self {
            url: url.to_string(),
            inner: Some(input),
            streams,
        })
    }
}

impl MediaSource for AvInput {
    fn url(&self) -> &str {
        &self.url
    }

    fn streams(&self) -> Vec<AvStream> {
        let mut streams: Vec<AvStream> = self.streams.values().cloned().collect();
        streams.sort_by_key(|s| s.index());
        streams
    }

    fn read_packet(&mut self) -> anyhow::Result<Option<RawPacket>> {
        let input = self
            .inner
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("input {} is closed", self.url))?;
        let mut packet = ffmpeg_next::codec::packet::Packet::empty();
        match packet.read(input) {
            Ok(()) => {
                let (time_base, media_type) = match self.streams.get(&packet.stream()) {
                    Some(stream) => (stream.time_base(), stream.media_type()),
                    None => (ffmpeg_next::Rational::new(1, 1), MediaType::Unknown),
                };
                Ok(Some(RawPacket::new(packet, time_base, media_type)))
            }
            Err(ffmpeg_next::Error::Eof) => Ok(None),
            Err(e) => Err(anyhow::anyhow!("read packet from {}: {}", self.url, e)),
        }
    }

    fn close(&mut self) {
        if self.inner.take().is_some() {
            log::debug!("input {} closed", self.url);
        }
    }
}

/// Opens resources with FFmpeg's demuxers, one options dictionary per resource.
#[derive(Default)]
pub struct FfmpegOpener;

impl SourceOpener for FfmpegOpener {
    fn open(&self, resource: &Resource) -> anyhow::Result<Box<dyn MediaSource>> {
        let mut format = None;
        let mut options = Dictionary::new();
        for (key, value) in &resource.options {
            if key == FORMAT_OPTION {
                format = Some(value.as_str());
            } else {
                options.set(key, value);
            }
        }
        let input = AvInput::new(&resource.url, format, options)?;
        log::info!(
            "opened input {} with {} streams",
            resource.url,
            input.streams.len()
        );
        Ok(Box::new(input))
    }
}

/// The sources of one fallback tier teed into one packet stream.
pub struct CompositeInput {
    name: String,
    priority: u32,
    sources: Mutex<Vec<(SourceId, Box<dyn MediaSource>)>>,
    streams: Vec<AvStream>,
    unifier: Arc<StreamIndexUnifier<SourceId>>,
    raw_chan: RawPacketSender,
    cancel: CancellationToken,
    stats: Arc<NodeStatistics>,
}

impl CompositeInput {
    fn new(
        priority: u32,
        sources: Vec<Box<dyn MediaSource>>,
        unifier: Arc<StreamIndexUnifier<SourceId>>,
        cancel: CancellationToken,
    ) -> Self {
        let mut streams = Vec::new();
        let mut tagged = Vec::new();
        for (slot, source) in sources.into_iter().enumerate() {
            let id = SourceId(slot);
            for stream in source.streams() {
                let index = unifier.assign(id, stream.index());
                streams.push(stream.with_index(index));
            }
            tagged.push((id, source));
        }
        streams.sort_by_key(|s| s.index());

        let name = format!(
            "input[{}]",
            tagged
                .iter()
                .map(|(_, s)| s.url().to_string())
                .collect::<Vec<_>>()
                .join(",")
        );
        let (sender, _) = tokio::sync::broadcast::channel(1024);
        Self {
            name,
            priority,
            sources: Mutex::new(tagged),
            streams,
            unifier,
            raw_chan: sender,
            cancel,
            stats: Arc::new(NodeStatistics::new()),
        }
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn source_count(&self) -> usize {
        self.sources.lock().len()
    }

    pub fn statistics(&self) -> Arc<NodeStatistics> {
        Arc::clone(&self.stats)
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Reads every source until all of them end, one blocking worker each.
    /// Returns `EndOfStream` after broadcasting EOF, `Canceled` when stopped,
    /// or the first read error (which also stops the other readers).
    pub async fn serve(&self) -> anyhow::Result<()> {
        let sources = std::mem::take(&mut *self.sources.lock());
        if sources.is_empty() {
            anyhow::bail!("{} has no sources left to serve", self.name);
        }

        let mut readers = futures::stream::FuturesUnordered::new();
        for (id, source) in sources {
            let cancel = self.cancel.clone();
            let sender = self.raw_chan.clone();
            let unifier = Arc::clone(&self.unifier);
            let stats = Arc::clone(&self.stats);
            readers.push(tokio::task::spawn_blocking(move || {
                Self::read_loop(id, source, cancel, sender, unifier, stats)
            }));
        }

        let mut first_err: Option<anyhow::Error> = None;
        while let Some(joined) = readers.next().await {
            let result = joined
                .map_err(|e| anyhow::anyhow!("input reader task failed: {}", e))
                .and_then(|r| r);
            if let Err(e) = result {
                if first_err.is_none() {
                    log::error!("{}: {:#}", self.name, e);
                    self.cancel.cancel();
                    first_err = Some(e);
                }
            }
        }

        if let Some(e) = first_err {
            return Err(e);
        }
        if self.cancel.is_cancelled() {
            return Err(RelayError::Canceled.into());
        }
        log::info!("{}: end of stream", self.name);
        let _ = self.raw_chan.send(RawPacketCmd::EOF);
        Err(RelayError::EndOfStream.into())
    }

    fn read_loop(
        id: SourceId,
        mut source: Box<dyn MediaSource>,
        cancel: CancellationToken,
        sender: RawPacketSender,
        unifier: Arc<StreamIndexUnifier<SourceId>>,
        stats: Arc<NodeStatistics>,
    ) -> anyhow::Result<()> {
        let result = loop {
            if cancel.is_cancelled() {
                break Ok(());
            }
            match source.read_packet() {
                Ok(Some(packet)) => {
                    let mut packet = packet.with_source(id);
                    packet.set_index(unifier.assign(id, packet.index()));
                    stats.record_read(packet.media_type(), packet.size());
                    // no subscriber yet is not an error
                    let _ = sender.send(RawPacketCmd::Data(packet));
                }
                Ok(None) => {
                    log::info!("end of input {}", source.url());
                    break Ok(());
                }
                Err(e) => break Err(e),
            }
        };
        source.close();
        result
    }
}

impl Processor for CompositeInput {
    fn name(&self) -> &str {
        &self.name
    }

    fn packet_source(&self) -> Option<&dyn PacketSourceProvider> {
        Some(self)
    }
}

impl PacketSourceProvider for CompositeInput {
    fn subscribe(&self) -> RawPacketReceiver {
        self.raw_chan.subscribe()
    }

    fn streams(&self) -> Vec<AvStream> {
        self.streams.clone()
    }
}

impl Drop for CompositeInput {
    fn drop(&mut self) {
        self.cancel.cancel();
        for (_, source) in self.sources.lock().iter_mut() {
            source.close();
        }
    }
}

/// Builds composite inputs, one fallback tier at a time.
pub struct InputFactory {
    groups: Vec<ResourceGroup>,
    opener: Arc<dyn SourceOpener>,
    unifier: Arc<StreamIndexUnifier<SourceId>>,
    cancel: CancellationToken,
}

impl InputFactory {
    pub fn new(
        resources: &[Resource],
        opener: Arc<dyn SourceOpener>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            groups: group_by_priority(resources),
            opener,
            unifier: Arc::new(StreamIndexUnifier::new()),
            cancel,
        }
    }

    pub fn priorities(&self) -> Vec<u32> {
        self.groups.iter().map(|g| g.priority).collect()
    }

    /// Opens every resource of the tier or none of them.
    pub fn new_input(&self, priority: u32) -> anyhow::Result<CompositeInput> {
        let group = self
            .groups
            .iter()
            .find(|g| g.priority == priority)
            .ok_or(RelayError::NoSuchPriority(priority))?;

        let mut opened: Vec<Box<dyn MediaSource>> = Vec::with_capacity(group.resources.len());
        for resource in &group.resources {
            match self.opener.open(resource) {
                Ok(source) => opened.push(source),
                Err(e) => {
                    for mut source in opened {
                        source.close();
                    }
                    return Err(e).with_context(|| {
                        format!("open input {} (priority {})", resource.url, priority)
                    });
                }
            }
        }

        // a new generation of sources gets a fresh index space
        self.unifier.reset();
        Ok(CompositeInput::new(
            priority,
            opened,
            Arc::clone(&self.unifier),
            self.cancel.child_token(),
        ))
    }

    /// Tries the tiers in ascending priority and returns the first one that opens.
    pub fn open_first_available(&self) -> anyhow::Result<CompositeInput> {
        for priority in self.priorities() {
            match self.new_input(priority) {
                Ok(input) => return Ok(input),
                Err(e) => log::warn!("fallback tier {} unavailable: {:#}", priority, e),
            }
        }
        Err(RelayError::NoInputAvailable.into())
    }
}

#[cfg(test)]
#[path = "input_test.rs"]
mod input_test;
