//! What the forwarder needs from its neighbours, and the per-node counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::{
    packet::{MediaType, RawPacket, RawPacketReceiver},
    stream::AvStream,
};

/// A node that can hand out a stream of packets.
pub trait PacketSourceProvider: Send + Sync {
    fn subscribe(&self) -> RawPacketReceiver;
    fn streams(&self) -> Vec<AvStream>;
}

/// A node that accepts pushed packets.
pub trait PacketSink: Send + Sync {
    /// The layout of the packets that follow; called before the first packet
    /// and whenever the producing path changes.
    fn streams_changed(&self, streams: Vec<AvStream>) -> anyhow::Result<()>;
    fn push(&self, packet: RawPacket) -> anyhow::Result<()>;
    fn finish(&self) -> anyhow::Result<()>;
}

/// Any pipeline node. Capabilities are opt-in.
pub trait Processor: Send + Sync {
    fn name(&self) -> &str;

    fn packet_source(&self) -> Option<&dyn PacketSourceProvider> {
        None
    }
}

#[derive(Default)]
pub struct FramesCounters {
    video: AtomicU64,
    audio: AtomicU64,
    other: AtomicU64,
    unknown: AtomicU64,
}

impl FramesCounters {
    pub fn add(&self, media_type: MediaType, n: u64) {
        let counter = match media_type {
            MediaType::Video => &self.video,
            MediaType::Audio => &self.audio,
            MediaType::Other => &self.other,
            MediaType::Unknown => &self.unknown,
        };
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> FramesSnapshot {
        let video = self.video.load(Ordering::Relaxed);
        let audio = self.audio.load(Ordering::Relaxed);
        let other = self.other.load(Ordering::Relaxed);
        let unknown = self.unknown.load(Ordering::Relaxed);
        FramesSnapshot {
            total: video + audio + other + unknown,
            video,
            audio,
            other,
            unknown,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FramesSnapshot {
    pub total: u64,
    pub video: u64,
    pub audio: u64,
    pub other: u64,
    pub unknown: u64,
}

impl std::ops::Add for FramesSnapshot {
    type Output = FramesSnapshot;

    fn add(self, rhs: Self) -> Self {
        FramesSnapshot {
            total: self.total + rhs.total,
            video: self.video + rhs.video,
            audio: self.audio + rhs.audio,
            other: self.other + rhs.other,
            unknown: self.unknown + rhs.unknown,
        }
    }
}

#[derive(Default)]
pub struct NodeStatistics {
    bytes_read: AtomicU64,
    bytes_wrote: AtomicU64,
    frames_read: FramesCounters,
    frames_missed: FramesCounters,
    frames_wrote: FramesCounters,
}

impl NodeStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_read(&self, media_type: MediaType, bytes: usize) {
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
        self.frames_read.add(media_type, 1);
    }

    pub fn record_missed(&self, media_type: MediaType) {
        self.frames_missed.add(media_type, 1);
    }

    pub fn record_missed_n(&self, media_type: MediaType, n: u64) {
        self.frames_missed.add(media_type, n);
    }

    pub fn record_wrote(&self, media_type: MediaType, bytes: usize) {
        self.bytes_wrote.fetch_add(bytes as u64, Ordering::Relaxed);
        self.frames_wrote.add(media_type, 1);
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_wrote: self.bytes_wrote.load(Ordering::Relaxed),
            frames_read: self.frames_read.snapshot(),
            frames_missed: self.frames_missed.snapshot(),
            frames_wrote: self.frames_wrote.snapshot(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    pub bytes_read: u64,
    pub bytes_wrote: u64,
    pub frames_read: FramesSnapshot,
    pub frames_missed: FramesSnapshot,
    pub frames_wrote: FramesSnapshot,
}

impl std::ops::Add for StatisticsSnapshot {
    type Output = StatisticsSnapshot;

    fn add(self, rhs: Self) -> Self {
        StatisticsSnapshot {
            bytes_read: self.bytes_read + rhs.bytes_read,
            bytes_wrote: self.bytes_wrote + rhs.bytes_wrote,
            frames_read: self.frames_read + rhs.frames_read,
            frames_missed: self.frames_missed + rhs.frames_missed,
            frames_wrote: self.frames_wrote + rhs.frames_wrote,
        }
    }
}
