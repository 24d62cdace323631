//! Wires input, forwarder, senders and auto bitrate together and supervises
//! them until the input ends, someone stops the run, or a stage fails.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    abr::{AutoBitRate, AutoBitRateConfig, QueueMonitor},
    bsf::wants_global_header,
    codec::{CodecEngine, FfmpegCodecEngine, FpsFraction},
    error::is_clean_shutdown,
    forwarder::{DualPathForwarder, ForwarderOptions, ForwarderSnapshot},
    input::{CompositeInput, FfmpegOpener, InputFactory, SourceOpener},
    node::{PacketSink, Processor, StatisticsSnapshot},
    recoder::{RecoderConfig, RecoderManager},
    resource::Resource,
    sender::{
        AvConnector, BitrateTier, DEFAULT_QUEUE_TOLERANCE, OutputTemplate, SenderConnector,
        SenderFactory, SenderHub, TierTable,
    },
    switch::{RoutingMode, Switch},
    throttle::{BitrateThrottle, EveryNth, PassAll, SamplingPolicy},
};

const SUPERVISOR_QUEUE: usize = 16;

#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub resources: Vec<Resource>,
    pub output: OutputTemplate,
    pub recoder: RecoderConfig,
    pub routing: RoutingMode,
    /// Both-pipes mode: keep one in N non-key units per path (None = all).
    pub sample_every: Option<u64>,
    pub tiers: TierTable,
    pub auto_bitrate: AutoBitRateConfig,
    pub queue_tolerance: usize,
    pub fps: FpsFraction,
}

impl RuntimeConfig {
    pub fn new(resources: Vec<Resource>, output: OutputTemplate) -> Self {
        Self {
            resources,
            output,
            recoder: RecoderConfig::default(),
            routing: RoutingMode::Switched,
            sample_every: None,
            tiers: TierTable::default(),
            auto_bitrate: AutoBitRateConfig::default(),
            queue_tolerance: DEFAULT_QUEUE_TOLERANCE,
            fps: FpsFraction::default(),
        }
    }
}

/// The boundaries the runtime talks to media through.
#[derive(Clone)]
pub struct Backends {
    pub opener: Arc<dyn SourceOpener>,
    pub engine: Arc<dyn CodecEngine>,
    pub connector: Arc<dyn SenderConnector>,
}

impl Backends {
    pub fn ffmpeg() -> Self {
        Self {
            opener: Arc::new(FfmpegOpener),
            engine: Arc::new(FfmpegCodecEngine),
            connector: Arc::new(AvConnector),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Opening,
    Running,
    Finished,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct RuntimeStatistics {
    pub input: StatisticsSnapshot,
    pub forwarder: StatisticsSnapshot,
    pub output: StatisticsSnapshot,
    /// End to end: read by the input, written by the senders, missed anywhere.
    pub total: StatisticsSnapshot,
}

#[derive(Clone, Debug, Serialize)]
pub struct InputSnapshot {
    pub name: String,
    pub priority: u32,
    pub streams: Vec<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct OutputSnapshot {
    pub url_template: String,
    pub urls: Vec<String>,
    pub queue_len: usize,
    pub queue_tolerance: usize,
    pub active_tier: Option<BitrateTier>,
}

#[derive(Clone, Debug, Serialize)]
pub struct Topology {
    pub state: RunState,
    pub input: Option<InputSnapshot>,
    pub forwarder: Option<ForwarderSnapshot>,
    pub output: Option<OutputSnapshot>,
}

struct Running {
    input: Arc<CompositeInput>,
    forwarder: Arc<DualPathForwarder>,
    hub: Arc<SenderHub>,
    abr: Arc<AutoBitRate>,
}

pub struct ForwarderRuntime {
    config: RuntimeConfig,
    backends: Backends,
    switch: Arc<Switch>,
    throttle: Arc<BitrateThrottle>,
    recoder: Arc<RecoderManager>,
    queue_tolerance: AtomicUsize,
    drop_on_close: AtomicBool,
    auto_bitrate: Mutex<AutoBitRateConfig>,
    state: Mutex<RunState>,
    running: Mutex<Option<Running>>,
    outcome: Mutex<Option<String>>,
    cancel: CancellationToken,
    finished: CancellationToken,
}

impl ForwarderRuntime {
    /// Validates and applies the initial recoder configuration; nothing is
    /// opened until `serve`.
    pub fn new(config: RuntimeConfig, backends: Backends) -> anyhow::Result<Self> {
        if config.resources.is_empty() {
            anyhow::bail!("no input configured");
        }
        let switch = Arc::new(Switch::new(config.recoder.initial_path()));
        let throttle = Arc::new(BitrateThrottle::default());
        let global_header = config
            .output
            .container_format()
            .is_some_and(|f| wants_global_header(&f));
        let recoder = Arc::new(RecoderManager::new(
            Arc::clone(&backends.engine),
            Arc::clone(&switch),
            Arc::clone(&throttle),
            global_header,
        ));
        recoder.set_fps_fraction(config.fps);
        recoder.configure(config.recoder.clone())?;

        Ok(Self {
            queue_tolerance: AtomicUsize::new(config.queue_tolerance),
            drop_on_close: AtomicBool::new(config.output.drop_on_close),
            auto_bitrate: Mutex::new(config.auto_bitrate.clone()),
            config,
            backends,
            switch,
            throttle,
            recoder,
            state: Mutex::new(RunState::Idle),
            running: Mutex::new(None),
            outcome: Mutex::new(None),
            cancel: CancellationToken::new(),
            finished: CancellationToken::new(),
        })
    }

    fn sampling(&self) -> Arc<dyn SamplingPolicy> {
        match self.config.sample_every {
            Some(n) if n > 1 => Arc::new(EveryNth::new(n)),
            _ => Arc::new(PassAll),
        }
    }

    /// Runs one forwarding session to completion. Clean shutdowns (input
    /// ended, stopped) return `Ok`.
    pub async fn serve(&self) -> anyhow::Result<()> {
        {
            let mut state = self.state.lock();
            if *state != RunState::Idle {
                anyhow::bail!("runtime already started");
            }
            *state = RunState::Opening;
        }
        let result = self.run().await;
        let result = match result {
            Err(e) if is_clean_shutdown(&e) => {
                log::info!("forwarding ended: {}", e);
                Ok(())
            }
            other => other,
        };
        if let Err(e) = &result {
            log::error!("forwarding failed: {:#}", e);
            *self.outcome.lock() = Some(format!("{:#}", e));
        }
        *self.state.lock() = RunState::Finished;
        self.finished.cancel();
        result
    }

    async fn run(&self) -> anyhow::Result<()> {
        let factory = InputFactory::new(
            &self.config.resources,
            Arc::clone(&self.backends.opener),
            self.cancel.child_token(),
        );
        let input = tokio::task::spawn_blocking(move || factory.open_first_available())
            .await
            .map_err(|e| anyhow::anyhow!("opening input panicked: {}", e))??;
        let input = Arc::new(input);
        log::info!("{} opened at priority {}", input.name(), input.priority());

        let (errors_tx, mut errors_rx) = mpsc::channel(SUPERVISOR_QUEUE);
        let hub = Arc::new(SenderHub::new(
            SenderFactory::new(
                self.config.tiers.clone(),
                self.config.output.clone(),
                Arc::clone(&self.backends.connector),
            ),
            errors_tx.clone(),
            self.cancel.child_token(),
        ));
        hub.set_queue_tolerance(self.queue_tolerance.load(Ordering::Relaxed));
        hub.set_drop_on_close(self.drop_on_close.load(Ordering::Relaxed));

        let forwarder = Arc::new(DualPathForwarder::new(
            input.as_ref(),
            Arc::clone(&self.switch),
            Arc::clone(&self.recoder),
            Arc::clone(&self.throttle),
            Arc::clone(&hub) as Arc<dyn PacketSink>,
            ForwarderOptions {
                mode: self.config.routing,
                output_format: self.config.output.container_format(),
                sampling: self.sampling(),
            },
            self.cancel.child_token(),
        )?);
        let abr = Arc::new(AutoBitRate::new(
            self.auto_bitrate.lock().clone(),
            Arc::clone(&self.recoder),
            Arc::clone(&self.switch),
            Arc::clone(&hub) as Arc<dyn QueueMonitor>,
        ));
        *self.running.lock() = Some(Running {
            input: Arc::clone(&input),
            forwarder: Arc::clone(&forwarder),
            hub: Arc::clone(&hub),
            abr: Arc::clone(&abr),
        });
        *self.state.lock() = RunState::Running;

        let mut forwarder_task = tokio::spawn({
            let forwarder = Arc::clone(&forwarder);
            async move { forwarder.serve().await }
        });
        let input_task = tokio::spawn({
            let input = Arc::clone(&input);
            let errors = errors_tx.clone();
            async move {
                if let Err(e) = input.serve().await {
                    let _ = errors.send(e).await;
                }
            }
        });
        let abr_task = tokio::spawn({
            let cancel = self.cancel.child_token();
            let errors = errors_tx.clone();
            async move {
                if let Err(e) = abr.run(cancel).await {
                    let _ = errors.send(e.context("auto bitrate")).await;
                }
            }
        });
        drop(errors_tx);

        let mut forwarder_done = false;
        let result = loop {
            tokio::select! {
                Some(e) = errors_rx.recv() => {
                    if is_clean_shutdown(&e) {
                        // the forwarder drains and ends on its own
                        continue;
                    }
                    break Err(e);
                }
                joined = &mut forwarder_task => {
                    forwarder_done = true;
                    break joined
                        .map_err(|e| anyhow::anyhow!("forwarder task failed: {}", e))
                        .and_then(|r| r);
                }
            }
        };

        if result.as_ref().is_err_and(|e| !is_clean_shutdown(e)) {
            self.cancel.cancel();
        }
        if !forwarder_done {
            self.cancel.cancel();
            let _ = forwarder_task.await;
        }
        // senders drain what the forwarder handed them before closing
        hub.join().await;
        self.cancel.cancel();
        let _ = input_task.await;
        if let Err(e) = abr_task.await {
            log::error!("auto bitrate task failed: {}", e);
        }

        // a sender that failed while draining still fails the run
        let mut result = result;
        while let Ok(e) = errors_rx.try_recv() {
            let clean_so_far = match &result {
                Ok(()) => true,
                Err(prev) => is_clean_shutdown(prev),
            };
            if clean_so_far && !is_clean_shutdown(&e) {
                result = Err(e);
            }
        }
        result
    }

    /// Cancels every worker; `serve` returns once they wound down.
    pub fn stop(&self) {
        log::info!("stop requested");
        self.cancel.cancel();
        let mut state = self.state.lock();
        if *state == RunState::Idle {
            *state = RunState::Finished;
            self.finished.cancel();
        }
    }

    /// Resolves when the run is over, with its failure if it had one.
    pub async fn wait(&self) -> Result<(), String> {
        self.finished.cancelled().await;
        match self.outcome.lock().clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn state(&self) -> RunState {
        *self.state.lock()
    }

    pub fn recoder_config(&self) -> RecoderConfig {
        self.recoder.recoder_config()
    }

    pub fn set_recoder_config(&self, config: RecoderConfig) -> anyhow::Result<()> {
        self.recoder.configure(config)
    }

    pub fn queue_tolerance(&self) -> usize {
        self.queue_tolerance.load(Ordering::Relaxed)
    }

    pub fn set_queue_tolerance(&self, tolerance: usize) {
        self.queue_tolerance.store(tolerance, Ordering::Relaxed);
        if let Some(running) = self.running.lock().as_ref() {
            running.hub.set_queue_tolerance(tolerance);
        }
    }

    pub fn auto_bitrate(&self) -> AutoBitRateConfig {
        self.auto_bitrate.lock().clone()
    }

    pub fn set_auto_bitrate(&self, config: AutoBitRateConfig) -> anyhow::Result<()> {
        config.validate()?;
        *self.auto_bitrate.lock() = config.clone();
        if let Some(running) = self.running.lock().as_ref() {
            running.abr.set_config(config);
        }
        Ok(())
    }

    pub fn fps_fraction(&self) -> FpsFraction {
        self.recoder.fps_fraction()
    }

    pub fn set_fps_fraction(&self, fps: FpsFraction) {
        self.recoder.set_fps_fraction(fps);
    }

    pub fn drop_on_close(&self) -> bool {
        self.drop_on_close.load(Ordering::Relaxed)
    }

    pub fn set_drop_on_close(&self, drop_on_close: bool) {
        if self.drop_on_close.swap(drop_on_close, Ordering::Relaxed) != drop_on_close {
            log::info!("drop on close set to {}", drop_on_close);
        }
        if let Some(running) = self.running.lock().as_ref() {
            running.hub.set_drop_on_close(drop_on_close);
        }
    }

    pub fn statistics(&self) -> RuntimeStatistics {
        let running = self.running.lock();
        let Some(running) = running.as_ref() else {
            return RuntimeStatistics::default();
        };
        let input = running.input.statistics().snapshot();
        let forwarder = running.forwarder.statistics().snapshot();
        let output = running.hub.statistics().snapshot();
        RuntimeStatistics {
            input,
            forwarder,
            output,
            total: StatisticsSnapshot {
                bytes_read: input.bytes_read,
                frames_read: input.frames_read,
                bytes_wrote: output.bytes_wrote,
                frames_wrote: output.frames_wrote,
                frames_missed: input.frames_missed + forwarder.frames_missed + output.frames_missed,
            },
        }
    }

    pub fn topology(&self) -> Topology {
        let running = self.running.lock();
        let Some(running) = running.as_ref() else {
            return Topology {
                state: self.state(),
                input: None,
                forwarder: None,
                output: None,
            };
        };
        Topology {
            state: self.state(),
            input: Some(InputSnapshot {
                name: running.input.name().to_string(),
                priority: running.input.priority(),
                streams: running
                    .input
                    .packet_source()
                    .map(|p| {
                        p.streams()
                            .iter()
                            .map(|s| format!("#{} {}", s.index(), s.codec_name()))
                            .collect()
                    })
                    .unwrap_or_default(),
            }),
            forwarder: Some(running.forwarder.snapshot()),
            output: Some(OutputSnapshot {
                url_template: self.config.output.url_template.clone(),
                urls: running.hub.urls(),
                queue_len: running.hub.queue_len(),
                queue_tolerance: running.hub.queue_tolerance(),
                active_tier: running.hub.active_tier(),
            }),
        }
    }
}

#[cfg(test)]
#[path = "runtime_test.rs"]
mod runtime_test;
