//! Output senders: one per output key, built from a URL template, sized from
//! the bitrate tier table and optionally wrapped in reconnect logic.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use ffmpeg_next::Dictionary;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    bsf::container_for_url,
    node::{NodeStatistics, PacketSink},
    output::AvOutput,
    packet::{MediaType, RawPacket},
    stream::{AvStream, Resolution},
};

/// Floor of every transmit buffer.
pub const MIN_BUFFER_SIZE: usize = 10 * 1024;
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(1);
pub const DEFAULT_QUEUE_TOLERANCE: usize = 256;
const LANE_CAPACITY: usize = 4096;

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutputKey {
    pub audio_codec: String,
    pub video_codec: String,
    pub audio_sample_rate: u32,
    pub video_resolution: Resolution,
}

impl OutputKey {
    /// The key of a stream layout: first audio and first video stream win.
    pub fn from_streams(streams: &[AvStream]) -> Self {
        let mut key = OutputKey::default();
        if let Some(audio) = streams.iter().find(|s| s.is_audio()) {
            key.audio_codec = audio.codec_name().to_string();
            key.audio_sample_rate = audio.sample_rate();
        }
        if let Some(video) = streams.iter().find(|s| s.is_video()) {
            key.video_codec = video.codec_name().to_string();
            key.video_resolution = video.resolution();
        }
        key
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitrateTier {
    pub resolution: Resolution,
    pub bitrate_low: u64,
    pub bitrate_high: u64,
}

impl BitrateTier {
    pub const fn new(width: u32, height: u32, bitrate_low: u64, bitrate_high: u64) -> Self {
        Self {
            resolution: Resolution::new(width, height),
            bitrate_low,
            bitrate_high,
        }
    }

    /// About one second of the tier's top bitrate, at least `MIN_BUFFER_SIZE`.
    pub fn buffer_size(&self) -> usize {
        ((self.bitrate_high / 8) as usize).max(MIN_BUFFER_SIZE)
    }

    pub fn clamp(&self, bit_rate: u64) -> u64 {
        bit_rate.clamp(self.bitrate_low, self.bitrate_high.max(self.bitrate_low))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TierLookup {
    pub tier: BitrateTier,
    pub exact: bool,
}

/// Resolution tiers plus the index of the one used when nothing matches.
/// `best` always points into `tiers`, however the table was built.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "TierTableFields")]
pub struct TierTable {
    tiers: Vec<BitrateTier>,
    best: usize,
}

#[derive(Deserialize)]
struct TierTableFields {
    tiers: Vec<BitrateTier>,
    best: usize,
}

impl TryFrom<TierTableFields> for TierTable {
    type Error = anyhow::Error;

    fn try_from(fields: TierTableFields) -> anyhow::Result<Self> {
        TierTable::new(fields.tiers, fields.best)
    }
}

impl Default for TierTable {
    fn default() -> Self {
        Self {
            tiers: vec![
                BitrateTier::new(426, 240, 300_000, 700_000),
                BitrateTier::new(640, 360, 400_000, 1_000_000),
                BitrateTier::new(854, 480, 500_000, 2_000_000),
                BitrateTier::new(1280, 720, 1_500_000, 4_000_000),
                BitrateTier::new(1920, 1080, 3_000_000, 6_000_000),
            ],
            best: 4,
        }
    }
}

impl TierTable {
    pub fn new(tiers: Vec<BitrateTier>, best: usize) -> anyhow::Result<Self> {
        if best >= tiers.len() {
            anyhow::bail!("best tier {} out of range ({} tiers)", best, tiers.len());
        }
        Ok(Self { tiers, best })
    }

    pub fn best(&self) -> BitrateTier {
        self.tiers[self.best]
    }

    pub fn tiers(&self) -> &[BitrateTier] {
        &self.tiers
    }

    pub fn lookup(&self, resolution: Resolution) -> TierLookup {
        match self.tiers.iter().find(|t| t.resolution == resolution) {
            Some(tier) => TierLookup {
                tier: *tier,
                exact: true,
            },
            None => {
                if !resolution.is_zero() {
                    log::warn!(
                        "no bitrate tier for {}, using {}",
                        resolution,
                        self.best().resolution
                    );
                }
                TierLookup {
                    tier: self.best(),
                    exact: false,
                }
            }
        }
    }
}

/// Where and how outputs are opened. The URL may reference the output key
/// as `{video_codec}`, `{audio_codec}`, `{sample_rate}` and `{resolution}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputTemplate {
    pub url_template: String,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub options: Vec<(String, String)>,
    #[serde(default)]
    pub retry: bool,
    #[serde(default = "default_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default)]
    pub drop_on_close: bool,
}

fn default_backoff_ms() -> u64 {
    DEFAULT_RETRY_BACKOFF.as_millis() as u64
}

impl OutputTemplate {
    pub fn new(url_template: &str) -> Self {
        Self {
            url_template: url_template.to_string(),
            format: None,
            options: Vec::new(),
            retry: false,
            retry_backoff_ms: default_backoff_ms(),
            drop_on_close: false,
        }
    }

    pub fn render(&self, key: &OutputKey) -> String {
        self.url_template
            .replace("{video_codec}", &key.video_codec)
            .replace("{audio_codec}", &key.audio_codec)
            .replace("{sample_rate}", &key.audio_sample_rate.to_string())
            .replace("{resolution}", &key.video_resolution.to_string())
    }

    /// Container name the output muxes into, explicit or guessed from the URL.
    pub fn container_format(&self) -> Option<String> {
        self.format
            .clone()
            .or_else(|| container_for_url(&self.url_template).map(str::to_string))
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Everything needed to (re)open one sender.
#[derive(Clone, Debug)]
pub struct SenderTarget {
    pub url: String,
    pub format: Option<String>,
    pub options: Vec<(String, String)>,
    pub streams: Vec<AvStream>,
    pub buffer_size: usize,
    pub drop_on_close: bool,
}

pub trait Sender: Send {
    fn url(&self) -> &str;
    fn send(&mut self, packet: RawPacket) -> anyhow::Result<()>;
    fn close(&mut self) -> anyhow::Result<()>;
    /// Discard buffered data (linger=0) instead of flushing it on close.
    fn set_drop_on_close(&mut self, drop_on_close: bool);
}

pub trait SenderConnector: Send + Sync {
    fn connect(&self, target: &SenderTarget) -> anyhow::Result<Box<dyn Sender>>;
}

/// Transport options carrying the buffer size and linger for `url`.
pub fn transport_options(url: &str, buffer_size: usize, drop_on_close: bool) -> Vec<(&'static str, String)> {
    let scheme = url.split("://").next().unwrap_or_default().to_ascii_lowercase();
    let mut options = Vec::new();
    match scheme.as_str() {
        "udp" => options.push(("buffer_size", buffer_size.to_string())),
        "tcp" | "rtmp" | "rtsp" => options.push(("send_buffer_size", buffer_size.to_string())),
        "srt" => {
            options.push(("sndbuf", buffer_size.to_string()));
            if drop_on_close {
                options.push(("linger", "0".to_string()));
            }
        }
        _ => {}
    }
    options
}

pub struct AvSender {
    output: AvOutput,
}

impl AvSender {
    pub fn open(target: &SenderTarget) -> anyhow::Result<Self> {
        let mut options = Dictionary::new();
        for (key, value) in transport_options(&target.url, target.buffer_size, target.drop_on_close) {
            options.set(key, &value);
        }
        // explicit options win
        for (key, value) in &target.options {
            options.set(key, value);
        }
        let mut output = AvOutput::new(&target.url, target.format.as_deref(), options)?;
        for stream in &target.streams {
            output.add_stream(stream)?;
        }
        output.set_drop_on_close(target.drop_on_close);
        log::info!(
            "output {} opened ({} streams, buffer {} bytes)",
            target.url,
            target.streams.len(),
            target.buffer_size
        );
        Ok(Self { output })
    }
}

impl Sender for AvSender {
    fn url(&self) -> &str {
        self.output.url()
    }

    fn send(&mut self, packet: RawPacket) -> anyhow::Result<()> {
        self.output.write_packet(packet)
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.output.finish()
    }

    fn set_drop_on_close(&mut self, drop_on_close: bool) {
        self.output.set_drop_on_close(drop_on_close);
    }
}

#[derive(Default)]
pub struct AvConnector;

impl SenderConnector for AvConnector {
    fn connect(&self, target: &SenderTarget) -> anyhow::Result<Box<dyn Sender>> {
        Ok(Box::new(AvSender::open(target)?))
    }
}

/// Reconnects through its connector instead of failing. Packets that arrive
/// while disconnected are dropped; after every (re)connect video resumes at
/// the next key frame.
pub struct RetrySender {
    target: SenderTarget,
    connector: Arc<dyn SenderConnector>,
    inner: Option<Box<dyn Sender>>,
    backoff: Duration,
    awaiting_key: bool,
    failures: u64,
}

impl RetrySender {
    pub fn new(target: SenderTarget, connector: Arc<dyn SenderConnector>, backoff: Duration) -> Self {
        Self {
            target,
            connector,
            inner: None,
            backoff,
            awaiting_key: true,
            failures: 0,
        }
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_some()
    }

    fn fail(&mut self, e: anyhow::Error) {
        self.failures += 1;
        log::warn!(
            "output {} failed ({} so far): {:#}, retrying in {:?}",
            self.target.url,
            self.failures,
            e,
            self.backoff
        );
        if let Some(mut inner) = self.inner.take() {
            let _ = inner.close();
        }
        std::thread::sleep(self.backoff);
    }
}

impl Sender for RetrySender {
    fn url(&self) -> &str {
        &self.target.url
    }

    fn send(&mut self, packet: RawPacket) -> anyhow::Result<()> {
        if self.inner.is_none() {
            match self.connector.connect(&self.target) {
                Ok(inner) => {
                    self.inner = Some(inner);
                    self.awaiting_key = true;
                }
                Err(e) => {
                    self.fail(e.context(format!("connect {}", self.target.url)));
                    return Ok(());
                }
            }
        }
        if self.awaiting_key {
            if !packet.info().is_video_key_frame() {
                return Ok(());
            }
            self.awaiting_key = false;
        }
        let result = match self.inner.as_mut() {
            Some(inner) => inner.send(packet),
            None => Ok(()),
        };
        if let Err(e) = result {
            self.fail(e);
        }
        Ok(())
    }

    fn close(&mut self) -> anyhow::Result<()> {
        match self.inner.take() {
            Some(mut inner) => inner.close(),
            None => Ok(()),
        }
    }

    fn set_drop_on_close(&mut self, drop_on_close: bool) {
        self.target.drop_on_close = drop_on_close;
        if let Some(inner) = self.inner.as_mut() {
            inner.set_drop_on_close(drop_on_close);
        }
    }
}

pub struct SenderFactory {
    tiers: TierTable,
    template: OutputTemplate,
    connector: Arc<dyn SenderConnector>,
}

impl SenderFactory {
    pub fn new(tiers: TierTable, template: OutputTemplate, connector: Arc<dyn SenderConnector>) -> Self {
        Self {
            tiers,
            template,
            connector,
        }
    }

    pub fn template(&self) -> &OutputTemplate {
        &self.template
    }

    pub fn tier_for(&self, key: &OutputKey) -> TierLookup {
        self.tiers.lookup(key.video_resolution)
    }

    pub fn target_for(&self, key: &OutputKey, streams: &[AvStream], drop_on_close: bool) -> SenderTarget {
        SenderTarget {
            url: self.template.render(key),
            format: self.template.container_format(),
            options: self.template.options.clone(),
            streams: streams.to_vec(),
            buffer_size: self.tier_for(key).tier.buffer_size(),
            drop_on_close,
        }
    }

    pub fn new_sender(&self, key: &OutputKey, streams: &[AvStream]) -> anyhow::Result<Box<dyn Sender>> {
        let target = self.target_for(key, streams, self.template.drop_on_close);
        if self.template.retry {
            return Ok(Box::new(RetrySender::new(
                target,
                Arc::clone(&self.connector),
                self.template.retry_backoff(),
            )));
        }
        self.connector.connect(&target)
    }
}

enum LaneCmd {
    Packet(RawPacket),
    DropOnClose(bool),
    Finish,
}

struct Lane {
    url: String,
    layout: Vec<(usize, String)>,
    tier: BitrateTier,
    tx: mpsc::Sender<LaneCmd>,
    worker: Option<tokio::task::JoinHandle<()>>,
}

impl Lane {
    fn queue_len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

fn layout_of(streams: &[AvStream]) -> Vec<(usize, String)> {
    streams
        .iter()
        .map(|s| (s.index(), s.codec_name().to_string()))
        .collect()
}

#[derive(Default)]
struct HubState {
    active: Option<OutputKey>,
    lanes: HashMap<OutputKey, Lane>,
    finished: Vec<tokio::task::JoinHandle<()>>,
}

/// The sink side of the forwarder: one sender per output key, each opened
/// and fed through a bounded queue by its own blocking worker. Nothing here
/// connects while holding the hub lock.
pub struct SenderHub {
    factory: Arc<SenderFactory>,
    handle: tokio::runtime::Handle,
    errors: mpsc::Sender<anyhow::Error>,
    cancel: CancellationToken,
    tolerance: AtomicUsize,
    drop_on_close: AtomicBool,
    stats: Arc<NodeStatistics>,
    state: Mutex<HubState>,
}

impl SenderHub {
    /// Must be called from within a tokio runtime.
    pub fn new(
        factory: SenderFactory,
        errors: mpsc::Sender<anyhow::Error>,
        cancel: CancellationToken,
    ) -> Self {
        let drop_on_close = factory.template().drop_on_close;
        Self {
            factory: Arc::new(factory),
            handle: tokio::runtime::Handle::current(),
            errors,
            cancel,
            tolerance: AtomicUsize::new(DEFAULT_QUEUE_TOLERANCE),
            drop_on_close: AtomicBool::new(drop_on_close),
            stats: Arc::new(NodeStatistics::new()),
            state: Mutex::new(HubState::default()),
        }
    }

    pub fn statistics(&self) -> Arc<NodeStatistics> {
        Arc::clone(&self.stats)
    }

    pub fn queue_tolerance(&self) -> usize {
        self.tolerance.load(Ordering::Relaxed)
    }

    pub fn set_queue_tolerance(&self, tolerance: usize) {
        let previous = self.tolerance.swap(tolerance, Ordering::Relaxed);
        if previous != tolerance {
            log::info!("output queue tolerance {} -> {}", previous, tolerance);
        }
    }

    pub fn set_drop_on_close(&self, drop_on_close: bool) {
        self.drop_on_close.store(drop_on_close, Ordering::Relaxed);
        for lane in self.state.lock().lanes.values() {
            let _ = lane.tx.try_send(LaneCmd::DropOnClose(drop_on_close));
        }
    }

    /// Packets waiting in the active sender's queue.
    pub fn queue_len(&self) -> usize {
        let state = self.state.lock();
        state
            .active
            .as_ref()
            .and_then(|key| state.lanes.get(key))
            .map(|lane| lane.queue_len())
            .unwrap_or(0)
    }

    pub fn active_tier(&self) -> Option<BitrateTier> {
        let state = self.state.lock();
        let key = state.active.as_ref()?;
        state.lanes.get(key).map(|lane| lane.tier)
    }

    pub fn active_key(&self) -> Option<OutputKey> {
        self.state.lock().active.clone()
    }

    pub fn sender_count(&self) -> usize {
        self.state.lock().lanes.len()
    }

    pub fn urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = self.state.lock().lanes.values().map(|l| l.url.clone()).collect();
        urls.sort();
        urls
    }

    /// Registers the lane right away; its worker connects before draining
    /// the queue, so packets pushed meanwhile simply wait.
    fn open_lane(&self, key: &OutputKey, streams: &[AvStream]) -> Lane {
        let url = self.factory.template().render(key);
        let tier = self.factory.tier_for(key).tier;
        let (tx, rx) = mpsc::channel(LANE_CAPACITY);
        let worker = {
            let factory = Arc::clone(&self.factory);
            let key = key.clone();
            let streams = streams.to_vec();
            let errors = self.errors.clone();
            let stats = Arc::clone(&self.stats);
            let cancel = self.cancel.clone();
            self.handle.spawn_blocking(move || {
                Self::lane_loop(factory, key, streams, rx, errors, stats, cancel)
            })
        };
        Lane {
            url,
            layout: layout_of(streams),
            tier,
            tx,
            worker: Some(worker),
        }
    }

    fn lane_loop(
        factory: Arc<SenderFactory>,
        key: OutputKey,
        streams: Vec<AvStream>,
        mut rx: mpsc::Receiver<LaneCmd>,
        errors: mpsc::Sender<anyhow::Error>,
        stats: Arc<NodeStatistics>,
        cancel: CancellationToken,
    ) {
        if cancel.is_cancelled() {
            return;
        }
        let mut sender = match factory.new_sender(&key, &streams) {
            Ok(sender) => sender,
            Err(e) => {
                let e = e.context(format!("open {}", factory.template().render(&key)));
                log::error!("{:#}", e);
                let _ = errors.try_send(e);
                return;
            }
        };

        while let Some(cmd) = rx.blocking_recv() {
            if cancel.is_cancelled() {
                break;
            }
            match cmd {
                LaneCmd::Packet(packet) => {
                    let media_type = packet.media_type();
                    let size = packet.size();
                    if let Err(e) = sender.send(packet) {
                        let e = e.context(format!("send to {}", sender.url()));
                        log::error!("{:#}", e);
                        let _ = errors.try_send(e);
                        break;
                    }
                    stats.record_wrote(media_type, size);
                }
                LaneCmd::DropOnClose(drop_on_close) => sender.set_drop_on_close(drop_on_close),
                LaneCmd::Finish => break,
            }
        }
        if let Err(e) = sender.close() {
            log::warn!("close {}: {:#}", sender.url(), e);
        }
        log::info!("output {} closed", sender.url());
    }

    fn retire(state: &mut HubState, key: &OutputKey) {
        if let Some(mut lane) = state.lanes.remove(key) {
            let _ = lane.tx.try_send(LaneCmd::Finish);
            if let Some(worker) = lane.worker.take() {
                state.finished.push(worker);
            }
        }
    }

    /// Waits for every sender worker to close its output.
    pub async fn join(&self) {
        let workers: Vec<tokio::task::JoinHandle<()>> = {
            let mut state = self.state.lock();
            let mut workers = std::mem::take(&mut state.finished);
            workers.extend(state.lanes.values_mut().filter_map(|l| l.worker.take()));
            workers
        };
        for worker in workers {
            let _ = worker.await;
        }
    }
}

impl PacketSink for SenderHub {
    fn streams_changed(&self, streams: Vec<AvStream>) -> anyhow::Result<()> {
        let key = OutputKey::from_streams(&streams);
        let layout = layout_of(&streams);
        let mut state = self.state.lock();

        let reusable = state
            .lanes
            .get(&key)
            .is_some_and(|lane| lane.layout == layout && !lane.tx.is_closed());
        if !reusable {
            Self::retire(&mut state, &key);
            let url = self.factory.template().render(&key);
            // another key rendering to the same URL gives way
            let same_url: Vec<OutputKey> = state
                .lanes
                .iter()
                .filter(|(_, lane)| lane.url == url)
                .map(|(k, _)| k.clone())
                .collect();
            for other in &same_url {
                Self::retire(&mut state, other);
            }
            let lane = self.open_lane(&key, &streams);
            if self.drop_on_close.load(Ordering::Relaxed) != self.factory.template().drop_on_close {
                let _ = lane
                    .tx
                    .try_send(LaneCmd::DropOnClose(self.drop_on_close.load(Ordering::Relaxed)));
            }
            log::info!("sender for {:?} -> {}", key, lane.url);
            state.lanes.insert(key.clone(), lane);
        }
        state.active = Some(key);
        Ok(())
    }

    fn push(&self, packet: RawPacket) -> anyhow::Result<()> {
        let media_type: MediaType = packet.media_type();
        let state = self.state.lock();
        let lane = state
            .active
            .as_ref()
            .and_then(|key| state.lanes.get(key))
            .ok_or_else(|| anyhow::anyhow!("no stream layout announced before first packet"))?;

        if lane.queue_len() > self.queue_tolerance() {
            self.stats.record_missed(media_type);
            return Ok(());
        }
        // a dead lane already reported its failure to the supervisor
        if lane.tx.try_send(LaneCmd::Packet(packet)).is_err() {
            self.stats.record_missed(media_type);
        }
        Ok(())
    }

    fn finish(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        let keys: Vec<OutputKey> = state.lanes.keys().cloned().collect();
        for key in &keys {
            Self::retire(&mut state, key);
        }
        state.active = None;
        Ok(())
    }
}

#[cfg(test)]
#[path = "sender_test.rs"]
mod sender_test;
