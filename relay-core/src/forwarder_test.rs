use std::sync::{Arc, atomic::Ordering};

use ffmpeg_next::{Rational, codec::Id, media::Type};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::codec::{
    ENGINE_TIME_BASE,
    testing::{EngineCounters, MockEngine},
};
use crate::error::RelayError;
use crate::forwarder::{DualPathForwarder, ForwarderOptions};
use crate::node::{PacketSink, PacketSourceProvider, Processor};
use crate::packet::{MediaType, RawPacket, RawPacketCmd, RawPacketReceiver, RawPacketSender};
use crate::recoder::{CodecConfig, RecoderConfig, RecoderManager};
use crate::stream::AvStream;
use crate::switch::{PathKind, RoutingMode, Switch};
use crate::throttle::BitrateThrottle;

const INPUT_TB: Rational = Rational(1, 1000);

struct FakeInput {
    tx: RawPacketSender,
    video_extradata: Option<Vec<u8>>,
}

impl FakeInput {
    fn new() -> Self {
        Self {
            tx: broadcast::channel(64).0,
            video_extradata: None,
        }
    }

    fn with_video_extradata(data: &[u8]) -> Self {
        Self {
            video_extradata: Some(data.to_vec()),
            ..Self::new()
        }
    }

    fn send(&self, packet: RawPacket) {
        let _ = self.tx.send(RawPacketCmd::Data(packet));
    }

    fn eof(&self) {
        let _ = self.tx.send(RawPacketCmd::EOF);
    }
}

impl Processor for FakeInput {
    fn name(&self) -> &str {
        "fake"
    }

    fn packet_source(&self) -> Option<&dyn PacketSourceProvider> {
        Some(self)
    }
}

impl PacketSourceProvider for FakeInput {
    fn subscribe(&self) -> RawPacketReceiver {
        self.tx.subscribe()
    }

    fn streams(&self) -> Vec<AvStream> {
        let video = AvStream::from_codec(0, Type::Video, Id::H264, INPUT_TB);
        let video = match &self.video_extradata {
            Some(data) => video.with_extradata(data),
            None => video,
        };
        vec![video, AvStream::from_codec(1, Type::Audio, Id::AAC, INPUT_TB)]
    }
}

struct NotASource;

impl Processor for NotASource {
    fn name(&self) -> &str {
        "encoder"
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Layout(Vec<(usize, &'static str)>),
    Unit { index: usize, payload: Vec<u8>, time_base: Rational },
    Finish,
}

#[derive(Default)]
struct CollectingSink {
    events: Mutex<Vec<Event>>,
    announced: Mutex<Vec<AvStream>>,
}

impl CollectingSink {
    fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    fn units(&self) -> Vec<(usize, Vec<u8>)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Unit { index, payload, .. } => Some((index, payload)),
                _ => None,
            })
            .collect()
    }
}

impl PacketSink for CollectingSink {
    fn streams_changed(&self, streams: Vec<AvStream>) -> anyhow::Result<()> {
        let layout = streams.iter().map(|s| (s.index(), s.codec_name())).collect();
        self.events.lock().push(Event::Layout(layout));
        *self.announced.lock() = streams;
        Ok(())
    }

    fn push(&self, packet: RawPacket) -> anyhow::Result<()> {
        self.events.lock().push(Event::Unit {
            index: packet.index(),
            payload: packet.data().to_vec(),
            time_base: packet.time_base(),
        });
        Ok(())
    }

    fn finish(&self) -> anyhow::Result<()> {
        self.events.lock().push(Event::Finish);
        Ok(())
    }
}

fn video(tag: u8, key: bool) -> RawPacket {
    let mut p = RawPacket::from_data(&[tag], 0, MediaType::Video, key, INPUT_TB);
    p.set_timestamps(Some(tag as i64 * 40), Some(tag as i64 * 40));
    p
}

fn audio(tag: u8) -> RawPacket {
    let mut p = RawPacket::from_data(&[tag], 1, MediaType::Audio, false, INPUT_TB);
    p.set_timestamps(Some(tag as i64 * 40), Some(tag as i64 * 40));
    p
}

struct Rig {
    input: FakeInput,
    sink: Arc<CollectingSink>,
    switch: Arc<Switch>,
    recoder: Arc<RecoderManager>,
    counters: Arc<EngineCounters>,
    forwarder: DualPathForwarder,
}

fn rig(mode: RoutingMode) -> Rig {
    rig_with(mode, PathKind::Passthrough, MockEngine::new())
}

fn rig_with(mode: RoutingMode, initial: PathKind, engine: MockEngine) -> Rig {
    let input = FakeInput::new();
    let sink = Arc::new(CollectingSink::default());
    let switch = Arc::new(Switch::new(initial));
    let throttle = Arc::new(BitrateThrottle::default());
    let counters = Arc::clone(&engine.counters);
    let recoder = Arc::new(RecoderManager::new(
        Arc::new(engine),
        Arc::clone(&switch),
        Arc::clone(&throttle),
        false,
    ));
    let forwarder = DualPathForwarder::new(
        &input,
        Arc::clone(&switch),
        Arc::clone(&recoder),
        throttle,
        Arc::clone(&sink) as Arc<dyn PacketSink>,
        ForwarderOptions {
            mode,
            ..Default::default()
        },
        CancellationToken::new(),
    )
    .unwrap();
    Rig {
        input,
        sink,
        switch,
        recoder,
        counters,
        forwarder,
    }
}

fn layouts(events: &[Event]) -> Vec<Event> {
    events
        .iter()
        .filter(|e| matches!(e, Event::Layout(_)))
        .cloned()
        .collect()
}

fn transcode_to_hevc(recoder: &RecoderManager) {
    recoder
        .configure(RecoderConfig {
            audio: CodecConfig::copy(),
            video: CodecConfig::new("libx265").with_bit_rate(2_000_000),
        })
        .unwrap();
}

fn ends_with_eof(result: anyhow::Result<()>) {
    let err = result.err().expect("serve ends with an error value");
    assert_eq!(err.downcast_ref::<RelayError>(), Some(&RelayError::EndOfStream));
}

#[test]
fn test_requires_packet_source() {
    let switch = Arc::new(Switch::new(PathKind::Passthrough));
    let throttle = Arc::new(BitrateThrottle::default());
    let recoder = Arc::new(RecoderManager::new(
        Arc::new(MockEngine::new()),
        Arc::clone(&switch),
        Arc::clone(&throttle),
        false,
    ));
    let err = DualPathForwarder::new(
        &NotASource,
        switch,
        recoder,
        throttle,
        Arc::new(CollectingSink::default()),
        ForwarderOptions::default(),
        CancellationToken::new(),
    )
    .err()
    .expect("no packet source");
    assert_eq!(
        err.downcast_ref::<RelayError>(),
        Some(&RelayError::NotAPacketSource("encoder".into()))
    );
}

#[tokio::test]
async fn test_passthrough_is_rescaled_and_announced() {
    let rig = rig(RoutingMode::Switched);
    rig.input.send(video(1, true));
    rig.input.send(audio(2));
    rig.input.eof();
    ends_with_eof(rig.forwarder.serve().await);

    let events = rig.sink.events();
    assert_eq!(events[0], Event::Layout(vec![(0, "h264"), (1, "aac")]));
    assert_eq!(
        events[1],
        Event::Unit {
            index: 0,
            payload: vec![1],
            time_base: ENGINE_TIME_BASE
        }
    );
    assert_eq!(events.last(), Some(&Event::Finish));
    assert_eq!(events.len(), 4);
    assert!(!rig.recoder.has_factory());
}

#[tokio::test]
async fn test_switch_lands_on_key_frame() {
    let rig = rig(RoutingMode::Switched);
    transcode_to_hevc(&rig.recoder);
    assert!(rig.switch.is_pending());

    rig.input.send(audio(1));
    rig.input.send(video(2, false));
    rig.input.send(video(3, true));
    rig.input.send(audio(4));
    rig.input.send(video(5, false));
    rig.input.eof();
    ends_with_eof(rig.forwarder.serve().await);

    assert_eq!(
        layouts(&rig.sink.events()),
        vec![
            Event::Layout(vec![(0, "h264"), (1, "aac")]),
            Event::Layout(vec![(0, "hevc"), (1, "aac")]),
        ]
    );
    // the key frame is the first unit of the transcode path
    assert_eq!(
        rig.sink.units(),
        vec![
            (1, vec![1]),
            (0, vec![2]),
            (0, vec![0xEE, 3]),
            (1, vec![4]),
            (0, vec![0xEE, 5]),
        ]
    );
    assert_eq!(rig.switch.current(), PathKind::Transcode);
    assert_eq!(rig.forwarder.snapshot().switches, 1);
    assert_eq!(rig.forwarder.statistics().snapshot().frames_wrote.total, 5);
    assert_eq!(rig.recoder.recoder_config().video.codec_name, "libx265");
}

#[tokio::test]
async fn test_cut_back_to_passthrough_mid_gop_keeps_queued_units() {
    // the encoder keeps one unit back, so the cut finds work still in flight
    let rig = rig_with(
        RoutingMode::Switched,
        PathKind::Transcode,
        MockEngine::new().with_hold(1),
    );
    transcode_to_hevc(&rig.recoder);
    rig.recoder.configure(RecoderConfig::default()).unwrap();
    assert_eq!(rig.switch.next_value(), PathKind::Passthrough);

    rig.input.send(video(1, false));
    rig.input.send(video(2, false));
    rig.input.send(video(3, true));
    rig.input.send(audio(4));
    rig.input.send(video(5, false));
    rig.input.eof();
    ends_with_eof(rig.forwarder.serve().await);

    assert_eq!(
        layouts(&rig.sink.events()),
        vec![
            Event::Layout(vec![(0, "hevc"), (1, "aac")]),
            Event::Layout(vec![(0, "h264"), (1, "aac")]),
        ]
    );
    // every unit takes exactly one path and the old path drains before the cut
    assert_eq!(
        rig.sink.units(),
        vec![
            (0, vec![0xEE, 1]),
            (0, vec![0xEE, 2]),
            (0, vec![3]),
            (1, vec![4]),
            (0, vec![5]),
        ]
    );
    let stats = rig.forwarder.statistics().snapshot();
    assert_eq!(stats.frames_wrote.total, 5);
    assert_eq!(stats.frames_missed.total, 0);
    assert_eq!(rig.switch.post_value(), PathKind::Passthrough);
    assert!(!rig.recoder.has_live_encoder());
    assert_eq!(rig.counters.created.load(Ordering::SeqCst), 1);
    assert_eq!(rig.recoder.recoder_config().video.codec_name, "copy");
}

#[tokio::test]
async fn test_both_pipes_unify_indices() {
    let rig = rig(RoutingMode::BothPipes);
    transcode_to_hevc(&rig.recoder);

    rig.input.send(video(1, true));
    rig.input.send(audio(2));
    rig.input.eof();
    ends_with_eof(rig.forwarder.serve().await);

    let events = rig.sink.events();
    assert_eq!(events[0], Event::Layout(vec![(0, "h264"), (2, "aac")]));
    let last_layout = events
        .iter()
        .rev()
        .find_map(|e| match e {
            Event::Layout(l) => Some(l.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(last_layout, vec![(0, "h264"), (2, "aac"), (3, "hevc"), (4, "aac")]);

    let mut units = rig.sink.units();
    units.sort();
    assert_eq!(
        units,
        vec![
            (0, vec![1]),
            (2, vec![2]),
            (3, vec![0xEE, 1]),
            (4, vec![2]),
        ]
    );
}

#[tokio::test]
async fn test_cancel_finishes_sink() {
    let rig = rig(RoutingMode::Switched);
    let cancel = CancellationToken::new();
    let forwarder = DualPathForwarder::new(
        &rig.input,
        Arc::clone(&rig.switch),
        Arc::clone(&rig.recoder),
        Arc::new(BitrateThrottle::default()),
        Arc::clone(&rig.sink) as Arc<dyn PacketSink>,
        ForwarderOptions::default(),
        cancel.clone(),
    )
    .unwrap();
    cancel.cancel();
    let err = forwarder.serve().await.err().expect("canceled");
    assert_eq!(err.downcast_ref::<RelayError>(), Some(&RelayError::Canceled));
    assert_eq!(rig.sink.events(), vec![Event::Finish]);
    assert!(forwarder.serve().await.is_err());
}

#[tokio::test]
async fn test_length_prefixed_output_announces_avcc() {
    let input = FakeInput::with_video_extradata(&[0, 0, 0, 1, 0x67, 0x64, 0, 0x1f, 0, 0, 0, 1, 0x68, 0xeb]);
    let sink = Arc::new(CollectingSink::default());
    let switch = Arc::new(Switch::new(PathKind::Passthrough));
    let throttle = Arc::new(BitrateThrottle::default());
    let recoder = Arc::new(RecoderManager::new(
        Arc::new(MockEngine::new()),
        Arc::clone(&switch),
        Arc::clone(&throttle),
        false,
    ));
    let forwarder = DualPathForwarder::new(
        &input,
        switch,
        recoder,
        throttle,
        Arc::clone(&sink) as Arc<dyn PacketSink>,
        ForwarderOptions {
            output_format: Some("flv".into()),
            ..Default::default()
        },
        CancellationToken::new(),
    )
    .unwrap();

    let mut key = RawPacket::from_data(&[0, 0, 0, 1, 0x65, 0x88], 0, MediaType::Video, true, INPUT_TB);
    key.set_timestamps(Some(0), Some(0));
    input.send(key);
    input.eof();
    ends_with_eof(forwarder.serve().await);

    let announced = sink.announced.lock().clone();
    assert_eq!(announced[0].extradata().unwrap()[0], 0x01);
    // packets and record agree: 4-byte NAL lengths
    assert_eq!(sink.units(), vec![(0, vec![0, 0, 0, 2, 0x65, 0x88])]);
}
