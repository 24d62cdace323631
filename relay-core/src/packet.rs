use bytes::Bytes;
use ffmpeg_next::{Rational, codec::packet::Flags};
use serde::{Deserialize, Serialize};

pub type RawPacketSender = tokio::sync::broadcast::Sender<RawPacketCmd>;
pub type RawPacketReceiver = tokio::sync::broadcast::Receiver<RawPacketCmd>;

#[derive(Clone)]
pub enum RawPacketCmd {
    Data(RawPacket),
    EOF,
}

/// Identity of one underlying source inside a composite input.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceId(pub usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Video,
    Audio,
    Other,
    Unknown,
}

impl From<ffmpeg_next::media::Type> for MediaType {
    fn from(medium: ffmpeg_next::media::Type) -> Self {
        match medium {
            ffmpeg_next::media::Type::Video => MediaType::Video,
            ffmpeg_next::media::Type::Audio => MediaType::Audio,
            ffmpeg_next::media::Type::Unknown => MediaType::Unknown,
            _ => MediaType::Other,
        }
    }
}

/// Header of a packet unit: everything routing predicates look at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UnitInfo {
    pub source: SourceId,
    pub stream_index: usize,
    pub media_type: MediaType,
    pub is_key: bool,
}

impl UnitInfo {
    pub fn is_video_key_frame(&self) -> bool {
        self.media_type == MediaType::Video && self.is_key
    }
}

#[derive(Clone)]
pub struct RawPacket {
    packet: ffmpeg_next::codec::packet::Packet,
    time_base: Rational,
    source: SourceId,
    media_type: MediaType,
}

impl RawPacket {
    pub fn new(
        packet: ffmpeg_next::codec::packet::Packet,
        time_base: Rational,
        media_type: MediaType,
    ) -> Self {
        Self {
            packet,
            time_base,
            source: SourceId::default(),
            media_type,
        }
    }

    /// Builds a packet around a copy of `data`.
    pub fn from_data(
        data: &[u8],
        stream_index: usize,
        media_type: MediaType,
        is_key: bool,
        time_base: Rational,
    ) -> Self {
        let mut packet = ffmpeg_next::codec::packet::Packet::copy(data);
        packet.set_stream(stream_index);
        if is_key {
            packet.set_flags(Flags::KEY);
        }
        Self::new(packet, time_base, media_type)
    }

    pub fn with_source(mut self, source: SourceId) -> Self {
        self.source = source;
        self
    }

    pub fn pts(&self) -> Option<i64> {
        self.packet.pts()
    }

    pub fn dts(&self) -> Option<i64> {
        self.packet.dts()
    }

    pub fn set_timestamps(&mut self, pts: Option<i64>, dts: Option<i64>) {
        self.packet.set_pts(pts);
        self.packet.set_dts(dts);
    }

    pub fn size(&self) -> usize {
        self.packet.size()
    }

    pub fn index(&self) -> usize {
        self.packet.stream()
    }

    pub fn set_index(&mut self, index: usize) {
        self.packet.set_stream(index);
    }

    pub fn data(&self) -> Bytes {
        self.packet
            .data()
            .map(Bytes::copy_from_slice)
            .unwrap_or_default()
    }

    pub fn is_key(&self) -> bool {
        self.packet.is_key()
    }

    pub fn source(&self) -> SourceId {
        self.source
    }

    pub fn media_type(&self) -> MediaType {
        self.media_type
    }

    pub fn time_base(&self) -> Rational {
        self.time_base
    }

    pub fn info(&self) -> UnitInfo {
        UnitInfo {
            source: self.source,
            stream_index: self.index(),
            media_type: self.media_type,
            is_key: self.is_key(),
        }
    }

    /// Converts the timestamps into `time_base`.
    pub fn rescale_to(&mut self, time_base: Rational) {
        if self.time_base == time_base {
            return;
        }
        self.packet.rescale_ts(self.time_base, time_base);
        self.time_base = time_base;
    }

    /// Same packet metadata around a new payload.
    pub fn with_data(&self, data: &[u8]) -> RawPacket {
        let mut packet = ffmpeg_next::codec::packet::Packet::copy(data);
        packet.set_stream(self.packet.stream());
        packet.set_pts(self.packet.pts());
        packet.set_dts(self.packet.dts());
        packet.set_duration(self.packet.duration());
        packet.set_flags(self.packet.flags());
        Self {
            packet,
            time_base: self.time_base,
            source: self.source,
            media_type: self.media_type,
        }
    }

    pub fn get_mut(&mut self) -> &mut ffmpeg_next::codec::packet::Packet {
        &mut self.packet
    }

    pub fn packet(&self) -> &ffmpeg_next::codec::packet::Packet {
        &self.packet
    }
}
