//! Routes input units through the passthrough path, the transcode path or
//! both, and hands what survives the gates to one sink.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use ffmpeg_next::Rational;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast::error::RecvError, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::{
    bsf::BsfChain,
    error::{RelayError, is_clean_shutdown},
    node::{NodeStatistics, PacketSink, Processor},
    packet::{MediaType, RawPacket, RawPacketCmd, RawPacketReceiver},
    recoder::RecoderManager,
    stream::AvStream,
    stream_index::StreamIndexUnifier,
    switch::{PathKind, RoutingMode, Switch, SwitchEvent},
    throttle::{BitrateThrottle, PassAll, SamplingPolicy},
};

const TRANSCODE_QUEUE: usize = 256;

#[derive(Clone)]
pub struct ForwarderOptions {
    pub mode: RoutingMode,
    /// Output container; selects the bitstream filters of each path.
    pub output_format: Option<String>,
    pub sampling: Arc<dyn SamplingPolicy>,
}

impl Default for ForwarderOptions {
    fn default() -> Self {
        Self {
            mode: RoutingMode::Switched,
            output_format: None,
            sampling: Arc::new(PassAll),
        }
    }
}

enum TranscodeCmd {
    Unit(RawPacket),
    /// Hand over everything the transcoder still holds, retire it, then ack.
    Drain(oneshot::Sender<()>),
    Flush,
}

#[derive(Default)]
struct OutputState {
    /// Switched mode: path whose layout the sink last saw.
    active: Option<PathKind>,
    /// Both-pipes mode: paths already part of the announced layout.
    joined: Vec<PathKind>,
    layout: Vec<AvStream>,
    chains: HashMap<PathKind, BsfChain>,
}

/// Where both paths meet: gating, layout announcements, index remapping and
/// bitstream filtering in front of the sink.
struct OutputStage {
    mode: RoutingMode,
    format: Option<String>,
    input_streams: Vec<AvStream>,
    transcode_index: Option<usize>,
    engine_time_base: Rational,
    recoder: Arc<RecoderManager>,
    sampling: Arc<dyn SamplingPolicy>,
    sink: Arc<dyn PacketSink>,
    unifier: StreamIndexUnifier<PathKind>,
    stats: Arc<NodeStatistics>,
    state: Mutex<OutputState>,
}

impl OutputStage {
    fn path_layout(&self, path: PathKind) -> Vec<AvStream> {
        match (path, self.mode) {
            (PathKind::Passthrough, RoutingMode::BothPipes) => self.input_streams.clone(),
            (PathKind::Passthrough, RoutingMode::Switched) => self
                .input_streams
                .iter()
                .map(|s| s.with_time_base(self.engine_time_base))
                .collect(),
            (PathKind::Transcode, _) => {
                let encoded = self.recoder.output_stream();
                self.input_streams
                    .iter()
                    .map(|s| match &encoded {
                        Some(encoded) if Some(s.index()) == self.transcode_index => {
                            encoded.with_index(s.index())
                        }
                        _ => s.with_time_base(self.engine_time_base),
                    })
                    .collect()
            }
        }
    }

    fn missed(&self, media_type: MediaType) {
        self.stats.record_missed(media_type);
    }

    /// Switched-mode units were gated when they were routed, so whatever a
    /// path emits for them is written even if the switch has moved since.
    fn deliver(&self, path: PathKind, mut packet: RawPacket) -> anyhow::Result<()> {
        let info = packet.info();
        if self.mode == RoutingMode::BothPipes && !self.sampling.admit(path, &info) {
            self.missed(info.media_type);
            return Ok(());
        }

        let mut state = self.state.lock();
        match self.mode {
            RoutingMode::Switched => {
                if state.active != Some(path) {
                    let layout = self.path_layout(path);
                    log::info!(
                        "output now from {} path: {}",
                        path,
                        describe(&layout)
                    );
                    let chain = BsfChain::new(self.format.as_deref(), &layout);
                    let layout = chain.output_streams(&layout);
                    state.chains.insert(path, chain);
                    self.sink.streams_changed(layout.clone())?;
                    state.layout = layout;
                    state.active = Some(path);
                }
            }
            RoutingMode::BothPipes => {
                if !state.joined.contains(&path) {
                    let layout: Vec<AvStream> = self
                        .path_layout(path)
                        .iter()
                        .map(|s| s.with_index(self.unifier.assign(path, s.index())))
                        .collect();
                    log::info!("{} path joins output: {}", path, describe(&layout));
                    let chain = BsfChain::new(self.format.as_deref(), &layout);
                    state.layout.extend(chain.output_streams(&layout));
                    state.chains.insert(path, chain);
                    state.layout.sort_by_key(|s| s.index());
                    self.sink.streams_changed(state.layout.clone())?;
                    state.joined.push(path);
                }
                packet.set_index(self.unifier.assign(path, packet.index()));
            }
        }

        let packet = match state.chains.get_mut(&path) {
            Some(chain) => chain.filter(packet),
            None => packet,
        };
        let size = packet.size();
        self.sink.push(packet)?;
        self.stats.record_wrote(info.media_type, size);
        Ok(())
    }

    fn layout(&self) -> Vec<AvStream> {
        self.state.lock().layout.clone()
    }
}

fn describe(streams: &[AvStream]) -> String {
    streams
        .iter()
        .map(|s| format!("#{} {}", s.index(), s.codec_name()))
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Clone, Debug, Serialize)]
pub struct ForwarderSnapshot {
    pub name: String,
    pub mode: RoutingMode,
    pub current: PathKind,
    pub pending: Option<PathKind>,
    pub switches: u64,
    pub throttle_dropped: u64,
    pub streams: Vec<String>,
}

pub struct DualPathForwarder {
    name: String,
    rx: Mutex<Option<RawPacketReceiver>>,
    switch: Arc<Switch>,
    recoder: Arc<RecoderManager>,
    throttle: Arc<BitrateThrottle>,
    stage: Arc<OutputStage>,
    cancel: CancellationToken,
    stats: Arc<NodeStatistics>,
    switches: Arc<AtomicU64>,
}

impl DualPathForwarder {
    /// Subscribes to `source` right away, so nothing it produces after this
    /// call is missed.
    pub fn new(
        source: &dyn Processor,
        switch: Arc<Switch>,
        recoder: Arc<RecoderManager>,
        throttle: Arc<BitrateThrottle>,
        sink: Arc<dyn PacketSink>,
        options: ForwarderOptions,
        cancel: CancellationToken,
    ) -> anyhow::Result<Self> {
        let provider = source
            .packet_source()
            .ok_or_else(|| RelayError::NotAPacketSource(source.name().to_string()))?;
        let rx = provider.subscribe();
        let input_streams = provider.streams();
        let floor = input_streams.iter().map(|s| s.index() + 1).max().unwrap_or(1);
        let transcode_index = input_streams.iter().find(|s| s.is_video()).map(|s| s.index());
        let stats = Arc::new(NodeStatistics::new());

        let switches = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&switches);
        switch.on_switch(Arc::new(move |event: SwitchEvent| {
            if let SwitchEvent::Committed { .. } = event {
                counter.fetch_add(1, Ordering::Relaxed);
            }
        }));

        let stage = Arc::new(OutputStage {
            mode: options.mode,
            format: options.output_format,
            input_streams,
            transcode_index,
            engine_time_base: recoder.time_base(),
            recoder: Arc::clone(&recoder),
            sampling: options.sampling,
            sink,
            unifier: StreamIndexUnifier::with_floor(floor),
            stats: Arc::clone(&stats),
            state: Mutex::new(OutputState::default()),
        });
        Ok(Self {
            name: format!("forwarder[{}]", source.name()),
            rx: Mutex::new(Some(rx)),
            switch,
            recoder,
            throttle,
            stage,
            cancel,
            stats,
            switches,
        })
    }

    pub fn statistics(&self) -> Arc<NodeStatistics> {
        Arc::clone(&self.stats)
    }

    pub fn mode(&self) -> RoutingMode {
        self.stage.mode
    }

    /// The stream layout last announced to the sink.
    pub fn output_streams(&self) -> Vec<AvStream> {
        self.stage.layout()
    }

    pub fn snapshot(&self) -> ForwarderSnapshot {
        let current = self.switch.current();
        let next = self.switch.next_value();
        ForwarderSnapshot {
            name: self.name.clone(),
            mode: self.stage.mode,
            current,
            pending: (next != current).then_some(next),
            switches: self.switches.load(Ordering::Relaxed),
            throttle_dropped: self.throttle.dropped(),
            streams: self
                .output_streams()
                .iter()
                .map(|s| format!("#{} {}", s.index(), s.codec_name()))
                .collect(),
        }
    }

    /// Runs until the input ends (`EndOfStream` once everything is flushed
    /// and the sink finished), the token is cancelled (`Canceled`) or a stage
    /// fails.
    pub async fn serve(&self) -> anyhow::Result<()> {
        let mut rx = self
            .rx
            .lock()
            .take()
            .ok_or_else(|| anyhow::anyhow!("{} is already serving", self.name))?;

        let (tx, worker_rx) = mpsc::channel(TRANSCODE_QUEUE);
        let worker = {
            let stage = Arc::clone(&self.stage);
            let recoder = Arc::clone(&self.recoder);
            let cancel = self.cancel.clone();
            tokio::task::spawn_blocking(move || transcode_loop(stage, recoder, worker_rx, cancel))
        };

        let routed = self.route(&mut rx, &tx).await;
        if routed
            .as_ref()
            .err()
            .and_then(|e| e.downcast_ref::<RelayError>())
            == Some(&RelayError::EndOfStream)
        {
            let _ = tx.send(TranscodeCmd::Flush).await;
        }
        drop(tx);

        let transcoded = match worker.await {
            Ok(result) => result,
            Err(e) => Err(anyhow::anyhow!("transcode worker panicked: {}", e)),
        };
        if let Err(e) = self.stage.sink.finish() {
            log::warn!("{}: finishing sink: {:#}", self.name, e);
        }

        let result = match (routed, transcoded) {
            (_, Err(e)) => Err(e.context("transcode path")),
            (routed, Ok(())) => routed,
        };
        match &result {
            Err(e) if is_clean_shutdown(e) => log::info!("{} stopped: {}", self.name, e),
            Err(e) => log::error!("{} failed: {:#}", self.name, e),
            Ok(()) => {}
        }
        result
    }

    async fn route(
        &self,
        rx: &mut RawPacketReceiver,
        tx: &mpsc::Sender<TranscodeCmd>,
    ) -> anyhow::Result<()> {
        loop {
            let cmd = tokio::select! {
                _ = self.cancel.cancelled() => return Err(RelayError::Canceled.into()),
                cmd = rx.recv() => cmd,
            };
            let packet = match cmd {
                Ok(RawPacketCmd::Data(packet)) => packet,
                Ok(RawPacketCmd::EOF) | Err(RecvError::Closed) => {
                    return Err(RelayError::EndOfStream.into());
                }
                Err(RecvError::Lagged(n)) => {
                    log::warn!("{} lagged behind the input by {} units", self.name, n);
                    self.stats.record_missed_n(MediaType::Unknown, n);
                    continue;
                }
            };
            self.stats.record_read(packet.media_type(), packet.size());

            match self.stage.mode {
                RoutingMode::Switched => {
                    if self.switch.evaluate(&packet.info()).is_some() {
                        self.settle(tx).await?;
                    }
                    let path = self.switch.current();
                    if !self.switch.output_allowed(path) {
                        self.stage.missed(packet.media_type());
                        continue;
                    }
                    match path {
                        PathKind::Passthrough => self.passthrough(packet)?,
                        PathKind::Transcode => Self::to_transcoder(tx, packet).await?,
                    }
                }
                RoutingMode::BothPipes => {
                    self.passthrough(packet.clone())?;
                    Self::to_transcoder(tx, packet).await?;
                }
            }
        }
    }

    /// Lets the path the switch just left write out what was already routed to
    /// it, then moves the post filter onto the new path.
    async fn settle(&self, tx: &mpsc::Sender<TranscodeCmd>) -> anyhow::Result<()> {
        if self.switch.post_value() == PathKind::Transcode {
            let (done, drained) = oneshot::channel();
            tx.send(TranscodeCmd::Drain(done))
                .await
                .map_err(|_| anyhow::anyhow!("transcode worker stopped"))?;
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(RelayError::Canceled.into()),
                ack = drained => ack.map_err(|_| anyhow::anyhow!("transcode worker stopped"))?,
            }
        }
        self.switch.settle();
        Ok(())
    }

    fn passthrough(&self, mut packet: RawPacket) -> anyhow::Result<()> {
        if !self.throttle.admit(&packet) {
            self.stage.missed(packet.media_type());
            return Ok(());
        }
        if self.stage.mode == RoutingMode::Switched {
            packet.rescale_to(self.stage.engine_time_base);
        }
        self.stage.deliver(PathKind::Passthrough, packet)
    }

    async fn to_transcoder(tx: &mpsc::Sender<TranscodeCmd>, packet: RawPacket) -> anyhow::Result<()> {
        tx.send(TranscodeCmd::Unit(packet))
            .await
            .map_err(|_| anyhow::anyhow!("transcode worker stopped"))
    }
}

fn transcode_loop(
    stage: Arc<OutputStage>,
    recoder: Arc<RecoderManager>,
    mut rx: mpsc::Receiver<TranscodeCmd>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let streams: HashMap<usize, AvStream> = stage
        .input_streams
        .iter()
        .map(|s| (s.index(), s.clone()))
        .collect();

    while let Some(cmd) = rx.blocking_recv() {
        if cancel.is_cancelled() {
            break;
        }
        let mut packet = match cmd {
            TranscodeCmd::Unit(packet) => packet,
            TranscodeCmd::Drain(done) => {
                for packet in recoder.flush()? {
                    stage.deliver(PathKind::Transcode, packet)?;
                }
                let _ = done.send(());
                continue;
            }
            TranscodeCmd::Flush => {
                for packet in recoder.flush()? {
                    stage.deliver(PathKind::Transcode, packet)?;
                }
                break;
            }
        };

        let outputs = match streams.get(&packet.index()) {
            Some(stream) if Some(stream.index()) == stage.transcode_index => {
                recoder.transcode(stream, packet)?
            }
            _ => {
                // nothing to pair with until the encoder announced its stream
                if recoder.has_factory() && recoder.output_stream().is_none() {
                    stage.missed(packet.media_type());
                    continue;
                }
                packet.rescale_to(stage.engine_time_base);
                vec![packet]
            }
        };
        for packet in outputs {
            stage.deliver(PathKind::Transcode, packet)?;
        }
    }
    Ok(())
}

impl Processor for DualPathForwarder {
    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
#[path = "forwarder_test.rs"]
mod forwarder_test;
