//! Packet framing conversions between codecs and containers.
//!
//! The filter is picked from the output container name, never guessed from
//! packet content. Each forwarder path builds its own chain: the transcode
//! path from the encoder's output streams, the passthrough path from the
//! source streams.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};
use ffmpeg_next::codec::Id;

use crate::{
    packet::{MediaType, RawPacket},
    stream::AvStream,
};

/// Annex B start code (4-byte)
const START_CODE: &[u8] = &[0x00, 0x00, 0x00, 0x01];

/// Containers that carry H.264/HEVC as start-code delimited elementary streams.
const ANNEXB_CONTAINERS: &[&str] = &["mpegts", "rtp_mpegts", "rtsp", "rtp", "h264", "hevc"];
/// Containers that carry length-prefixed NAL units and raw AAC.
const LENGTH_PREFIXED_CONTAINERS: &[&str] = &["flv", "mp4", "mov", "ismv", "ipod", "3gp", "f4v"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BitstreamFilterKind {
    /// h264_mp4toannexb / hevc_mp4toannexb
    Mp4ToAnnexB,
    /// Start codes to 4-byte NAL lengths.
    AnnexBToMp4,
    /// aac_adtstoasc
    AacAdtsToAsc,
}

pub fn select(format: &str, media_type: MediaType, codec: Id) -> Option<BitstreamFilterKind> {
    let format = format.to_ascii_lowercase();
    let nal_codec = matches!(codec, Id::H264 | Id::HEVC);
    if ANNEXB_CONTAINERS.contains(&format.as_str()) {
        if media_type == MediaType::Video && nal_codec {
            return Some(BitstreamFilterKind::Mp4ToAnnexB);
        }
    } else if LENGTH_PREFIXED_CONTAINERS.contains(&format.as_str()) {
        if media_type == MediaType::Video && nal_codec {
            return Some(BitstreamFilterKind::AnnexBToMp4);
        }
        if media_type == MediaType::Audio && codec == Id::AAC {
            return Some(BitstreamFilterKind::AacAdtsToAsc);
        }
    }
    None
}

/// Whether encoders feeding `format` keep parameter sets in extradata.
pub fn wants_global_header(format: &str) -> bool {
    LENGTH_PREFIXED_CONTAINERS.contains(&format.to_ascii_lowercase().as_str())
}

/// Container name for an output URL when none was given explicitly.
pub fn container_for_url(url: &str) -> Option<&'static str> {
    let lower = url.to_ascii_lowercase();
    let scheme = lower.split("://").next().unwrap_or_default();
    match scheme {
        "rtmp" | "rtmps" => return Some("flv"),
        "srt" | "udp" | "tcp" => return Some("mpegts"),
        "rtsp" => return Some("rtsp"),
        "rtp" => return Some("rtp"),
        _ => {}
    }
    let path = lower.split(['?', '#']).next().unwrap_or_default();
    match path.rsplit('.').next() {
        Some("ts") => Some("mpegts"),
        Some("flv") => Some("flv"),
        Some("mp4") => Some("mp4"),
        Some("mov") => Some("mov"),
        Some("h264") | Some("264") => Some("h264"),
        Some("hevc") | Some("265") => Some("hevc"),
        _ => None,
    }
}

/// Check if packet data is in Annex B format by looking at the start codes.
pub fn is_annexb_packet(data: &[u8]) -> bool {
    data.starts_with(START_CODE) || data.starts_with(&START_CODE[1..])
}

/// Converts length-prefixed NAL units to start-code delimited ones.
pub fn convert_avcc_to_annexb(avcc: &[u8], length_size: usize) -> Bytes {
    let mut out = BytesMut::with_capacity(avcc.len() + 16);
    let mut i = 0;
    while i + length_size <= avcc.len() {
        let len = avcc[i..i + length_size]
            .iter()
            .fold(0usize, |acc, b| acc << 8 | *b as usize);
        i += length_size;
        if len == 0 || i + len > avcc.len() {
            break;
        }
        out.extend_from_slice(START_CODE);
        out.extend_from_slice(&avcc[i..i + len]);
        i += len;
    }
    out.freeze()
}

/// Splits start-code delimited data into NAL unit payloads.
fn split_annexb(data: &[u8]) -> Vec<&[u8]> {
    let mut nals = Vec::new();
    let mut start = None;
    let mut i = 0;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            if let Some(s) = start {
                let mut end = i;
                // the zero of a 4-byte start code belongs to the next NAL
                if end > s && data[end - 1] == 0 {
                    end -= 1;
                }
                nals.push(&data[s..end]);
            }
            i += 3;
            start = Some(i);
        } else {
            i += 1;
        }
    }
    if let Some(s) = start {
        if s < data.len() {
            nals.push(&data[s..]);
        }
    }
    nals
}

pub fn convert_annexb_to_avcc(data: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(data.len() + 8);
    for nal in split_annexb(data) {
        if nal.is_empty() {
            continue;
        }
        out.put_u32(nal.len() as u32);
        out.extend_from_slice(nal);
    }
    out.freeze()
}

/// Parameter sets of an avcC record as Annex B, plus the NAL length size.
fn parse_avcc(extradata: &[u8]) -> Option<(usize, Bytes)> {
    if extradata.len() < 7 || extradata[0] != 1 {
        return None;
    }
    let length_size = (extradata[4] & 0x03) as usize + 1;
    let mut out = BytesMut::new();
    let mut i = 5;

    let sps_count = (extradata[i] & 0x1f) as usize;
    i += 1;
    for _ in 0..sps_count {
        i = copy_parameter_set(extradata, i, &mut out)?;
    }
    let pps_count = *extradata.get(i)? as usize;
    i += 1;
    for _ in 0..pps_count {
        i = copy_parameter_set(extradata, i, &mut out)?;
    }
    Some((length_size, out.freeze()))
}

/// Parameter sets (VPS/SPS/PPS/SEI arrays) of an hvcC record.
fn parse_hvcc(extradata: &[u8]) -> Option<(usize, Bytes)> {
    if extradata.len() < 23 || extradata[0] != 1 {
        return None;
    }
    let length_size = (extradata[21] & 0x03) as usize + 1;
    let arrays = extradata[22] as usize;
    let mut out = BytesMut::new();
    let mut i = 23;
    for _ in 0..arrays {
        // array_completeness(1) reserved(1) nal_unit_type(6)
        i += 1;
        let count = u16::from_be_bytes([*extradata.get(i)?, *extradata.get(i + 1)?]) as usize;
        i += 2;
        for _ in 0..count {
            i = copy_parameter_set(extradata, i, &mut out)?;
        }
    }
    Some((length_size, out.freeze()))
}

fn copy_parameter_set(data: &[u8], at: usize, out: &mut BytesMut) -> Option<usize> {
    let len = u16::from_be_bytes([*data.get(at)?, *data.get(at + 1)?]) as usize;
    let start = at + 2;
    let nal = data.get(start..start + len)?;
    out.extend_from_slice(START_CODE);
    out.extend_from_slice(nal);
    Some(start + len)
}

/// Drops the emulation prevention byte of every `00 00 03` sequence.
fn unescape_rbsp(nal: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(nal.len());
    let mut zeros = 0;
    for &b in nal {
        if zeros >= 2 && b == 3 {
            zeros = 0;
            continue;
        }
        zeros = if b == 0 { zeros + 1 } else { 0 };
        out.push(b);
    }
    out
}

fn push_parameter_set(out: &mut BytesMut, nal: &[u8]) {
    out.put_u16(nal.len() as u16);
    out.extend_from_slice(nal);
}

/// avcC record built from Annex B SPS/PPS, with 4-byte NAL lengths.
pub fn avcc_from_annexb(extradata: &[u8]) -> Option<Bytes> {
    let nals = split_annexb(extradata);
    let sps: Vec<&[u8]> = nals.iter().copied().filter(|n| n.first().map(|b| b & 0x1f) == Some(7)).collect();
    let pps: Vec<&[u8]> = nals.iter().copied().filter(|n| n.first().map(|b| b & 0x1f) == Some(8)).collect();
    let first = sps.first().filter(|s| s.len() >= 4)?;
    if sps.len() > 31 || pps.len() > 255 {
        return None;
    }

    let mut out = BytesMut::new();
    out.extend_from_slice(&[1, first[1], first[2], first[3], 0xff, 0xe0 | sps.len() as u8]);
    for nal in &sps {
        push_parameter_set(&mut out, nal);
    }
    out.put_u8(pps.len() as u8);
    for nal in &pps {
        push_parameter_set(&mut out, nal);
    }
    Some(out.freeze())
}

fn hevc_nal_type(nal: &[u8]) -> Option<u8> {
    nal.first().map(|b| (b >> 1) & 0x3f)
}

/// hvcC record built from Annex B VPS/SPS/PPS, with 4-byte NAL lengths.
/// Profile, tier and level come from the SPS; chroma and bit depth are
/// announced as 4:2:0 8-bit.
pub fn hvcc_from_annexb(extradata: &[u8]) -> Option<Bytes> {
    let nals = split_annexb(extradata);
    let sps = nals.iter().find(|n| hevc_nal_type(n) == Some(33))?;
    // NAL header(2), vps id / max sub layers / nesting(1), general PTL(12)
    let sps = unescape_rbsp(sps);
    let ptl = sps.get(3..15)?;
    let sub_layers = ((sps[2] >> 1) & 0x07) + 1;
    let nested = sps[2] & 0x01;

    let mut out = BytesMut::new();
    out.put_u8(1);
    out.extend_from_slice(ptl);
    out.extend_from_slice(&[0xf0, 0x00, 0xfc, 0xfd, 0xf8, 0xf8, 0x00, 0x00]);
    out.put_u8(sub_layers << 3 | nested << 2 | 0x03);

    let arrays: Vec<(u8, Vec<&[u8]>)> = [32u8, 33, 34]
        .into_iter()
        .map(|t| (t, nals.iter().copied().filter(|n| hevc_nal_type(n) == Some(t)).collect::<Vec<_>>()))
        .filter(|(_, list)| !list.is_empty())
        .collect();
    out.put_u8(arrays.len() as u8);
    for (t, list) in arrays {
        out.put_u8(0x80 | t);
        out.put_u16(list.len() as u16);
        for nal in list {
            push_parameter_set(&mut out, nal);
        }
    }
    Some(out.freeze())
}

const AAC_SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// Two-byte AudioSpecificConfig. `profile` is FFmpeg's AAC profile
/// (object type minus one); unknown profiles are announced as LC.
pub fn audio_specific_config(profile: i32, sample_rate: u32, channels: u32) -> Option<[u8; 2]> {
    let object_type = if (0..=30).contains(&profile) { profile as u8 + 1 } else { 2 };
    let freq_index = AAC_SAMPLE_RATES.iter().position(|r| *r == sample_rate)? as u8;
    let channel_config = match channels {
        1..=6 => channels as u8,
        8 => 7,
        _ => return None,
    };
    Some([
        object_type << 3 | freq_index >> 1,
        (freq_index & 0x01) << 7 | channel_config << 3,
    ])
}

/// What a stream announces once its packets go through `kind`.
#[derive(Debug, PartialEq, Eq)]
enum OutputRecord {
    Keep,
    Replace(Bytes),
    /// No record can describe the filtered packets; leave them as they are.
    Unavailable,
}

fn output_record(kind: BitstreamFilterKind, stream: &AvStream) -> OutputRecord {
    match (kind, stream.extradata()) {
        (BitstreamFilterKind::Mp4ToAnnexB, _) => OutputRecord::Keep,
        (BitstreamFilterKind::AnnexBToMp4, Some(extra)) if is_annexb_packet(extra) => {
            let record = if stream.codec_id() == Id::HEVC {
                hvcc_from_annexb(extra)
            } else {
                avcc_from_annexb(extra)
            };
            record.map_or(OutputRecord::Unavailable, OutputRecord::Replace)
        }
        (BitstreamFilterKind::AnnexBToMp4, _) => OutputRecord::Keep,
        (BitstreamFilterKind::AacAdtsToAsc, Some(_)) => OutputRecord::Keep,
        (BitstreamFilterKind::AacAdtsToAsc, None) => {
            audio_specific_config(stream.profile(), stream.sample_rate(), stream.channels())
                .map_or(OutputRecord::Unavailable, |asc| {
                    OutputRecord::Replace(Bytes::copy_from_slice(&asc))
                })
        }
    }
}

/// Length of the ADTS header in front of `data`, if it has one.
fn adts_header_len(data: &[u8]) -> Option<usize> {
    if data.len() < 7 || data[0] != 0xff || data[1] & 0xf0 != 0xf0 {
        return None;
    }
    let protection_absent = data[1] & 0x01 == 1;
    let len = if protection_absent { 7 } else { 9 };
    (data.len() >= len).then_some(len)
}

/// One configured filter instance for one stream.
pub struct BitstreamFilter {
    kind: BitstreamFilterKind,
    nal_length_size: usize,
    parameter_sets: Bytes,
}

impl BitstreamFilter {
    pub fn new(kind: BitstreamFilterKind, codec: Id, extradata: Option<&[u8]>) -> Self {
        let parsed = match (kind, extradata) {
            (BitstreamFilterKind::Mp4ToAnnexB, Some(extra)) if !is_annexb_packet(extra) => {
                if codec == Id::HEVC {
                    parse_hvcc(extra)
                } else {
                    parse_avcc(extra)
                }
            }
            _ => None,
        };
        let (nal_length_size, parameter_sets) = parsed.unwrap_or((4, Bytes::new()));
        Self {
            kind,
            nal_length_size,
            parameter_sets,
        }
    }

    pub fn for_stream(kind: BitstreamFilterKind, stream: &AvStream) -> Self {
        Self::new(kind, stream.codec_id(), stream.extradata())
    }

    pub fn kind(&self) -> BitstreamFilterKind {
        self.kind
    }

    pub fn filter(&mut self, packet: RawPacket) -> RawPacket {
        let data = packet.data();
        if data.is_empty() {
            return packet;
        }
        match self.kind {
            BitstreamFilterKind::Mp4ToAnnexB => {
                if is_annexb_packet(&data) {
                    return packet;
                }
                let converted = convert_avcc_to_annexb(&data, self.nal_length_size);
                if packet.is_key() && !self.parameter_sets.is_empty() {
                    let mut out =
                        BytesMut::with_capacity(self.parameter_sets.len() + converted.len());
                    out.extend_from_slice(&self.parameter_sets);
                    out.extend_from_slice(&converted);
                    packet.with_data(&out)
                } else {
                    packet.with_data(&converted)
                }
            }
            BitstreamFilterKind::AnnexBToMp4 => {
                if !is_annexb_packet(&data) {
                    return packet;
                }
                packet.with_data(&convert_annexb_to_avcc(&data))
            }
            BitstreamFilterKind::AacAdtsToAsc => match adts_header_len(&data) {
                Some(len) => packet.with_data(&data[len..]),
                None => packet,
            },
        }
    }
}

/// The filters one path needs for one output container, by stream index.
#[derive(Default)]
pub struct BsfChain {
    filters: HashMap<usize, BitstreamFilter>,
    records: HashMap<usize, Bytes>,
}

impl BsfChain {
    pub fn new(format: Option<&str>, streams: &[AvStream]) -> Self {
        let mut filters = HashMap::new();
        let mut records = HashMap::new();
        if let Some(format) = format {
            for stream in streams {
                let Some(kind) = select(format, stream.media_type(), stream.codec_id()) else {
                    continue;
                };
                match output_record(kind, stream) {
                    OutputRecord::Unavailable => {
                        log::warn!(
                            "stream {} ({}) to {}: no configuration record for {:?}, packets left as is",
                            stream.index(),
                            stream.codec_name(),
                            format,
                            kind
                        );
                        continue;
                    }
                    OutputRecord::Replace(record) => {
                        records.insert(stream.index(), record);
                    }
                    OutputRecord::Keep => {}
                }
                log::debug!(
                    "stream {} ({}) to {}: {:?}",
                    stream.index(),
                    stream.codec_name(),
                    format,
                    kind
                );
                filters.insert(stream.index(), BitstreamFilter::for_stream(kind, stream));
            }
        }
        Self { filters, records }
    }

    /// `streams` as the muxer must see them once this chain has filtered
    /// their packets.
    pub fn output_streams(&self, streams: &[AvStream]) -> Vec<AvStream> {
        streams
            .iter()
            .map(|s| match self.records.get(&s.index()) {
                Some(record) => s.with_extradata(record),
                None => s.clone(),
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn kind_for(&self, stream_index: usize) -> Option<BitstreamFilterKind> {
        self.filters.get(&stream_index).map(|f| f.kind())
    }

    pub fn filter(&mut self, packet: RawPacket) -> RawPacket {
        match self.filters.get_mut(&packet.index()) {
            Some(f) => f.filter(packet),
            None => packet,
        }
    }
}

#[cfg(test)]
mod tests {
    use ffmpeg_next::Rational;

    use super::*;

    fn video(data: &[u8], is_key: bool) -> RawPacket {
        RawPacket::from_data(data, 0, MediaType::Video, is_key, Rational::new(1, 90000))
    }

    #[test]
    fn test_global_header_containers() {
        assert!(wants_global_header("flv"));
        assert!(wants_global_header("MP4"));
        assert!(!wants_global_header("mpegts"));
    }

    #[test]
    fn test_select_by_container() {
        use BitstreamFilterKind::*;
        assert_eq!(select("mpegts", MediaType::Video, Id::H264), Some(Mp4ToAnnexB));
        assert_eq!(select("RTSP", MediaType::Video, Id::HEVC), Some(Mp4ToAnnexB));
        assert_eq!(select("mpegts", MediaType::Audio, Id::AAC), None);
        assert_eq!(select("flv", MediaType::Video, Id::H264), Some(AnnexBToMp4));
        assert_eq!(select("mp4", MediaType::Audio, Id::AAC), Some(AacAdtsToAsc));
        assert_eq!(select("flv", MediaType::Video, Id::VP9), None);
        assert_eq!(select("matroska", MediaType::Video, Id::H264), None);
    }

    #[test]
    fn test_container_for_url() {
        assert_eq!(container_for_url("rtmp://host/app/key"), Some("flv"));
        assert_eq!(container_for_url("srt://host:9000?mode=caller"), Some("mpegts"));
        assert_eq!(container_for_url("/tmp/out.ts"), Some("mpegts"));
        assert_eq!(container_for_url("/tmp/out.mkv"), None);
    }

    #[test]
    fn test_is_annexb() {
        assert!(is_annexb_packet(&[0x00, 0x00, 0x00, 0x01, 0x67]));
        assert!(is_annexb_packet(&[0x00, 0x00, 0x01, 0x67]));
        assert!(!is_annexb_packet(&[0x01, 0x00, 0x00, 0x00]));
        assert!(!is_annexb_packet(&[0x00, 0x00]));
    }

    #[test]
    fn test_avcc_to_annexb() {
        let avcc = [0, 0, 0, 4, 0x65, 0x88, 0x81, 0x00, 0, 0, 0, 2, 0x41, 0x9a];
        let out = convert_avcc_to_annexb(&avcc, 4);
        assert_eq!(
            &out[..],
            &[0, 0, 0, 1, 0x65, 0x88, 0x81, 0x00, 0, 0, 0, 1, 0x41, 0x9a][..]
        );
        // 2-byte lengths
        let out = convert_avcc_to_annexb(&[0, 2, 0x41, 0x9a], 2);
        assert_eq!(&out[..], &[0, 0, 0, 1, 0x41, 0x9a][..]);
    }

    #[test]
    fn test_annexb_to_avcc_mixed_start_codes() {
        let annexb = [0, 0, 0, 1, 0x67, 0x42, 0, 0, 1, 0x68, 0xce, 0, 0, 0, 1, 0x65, 0x88];
        let out = convert_annexb_to_avcc(&annexb);
        assert_eq!(
            &out[..],
            &[0, 0, 0, 2, 0x67, 0x42, 0, 0, 0, 2, 0x68, 0xce, 0, 0, 0, 2, 0x65, 0x88][..]
        );
    }

    #[test]
    fn test_mp4_to_annexb_inserts_parameter_sets_on_key_frames() {
        // avcC: version 1, profile, compat, level, 0xff (4-byte lengths),
        // 1 SPS of 2 bytes, 1 PPS of 2 bytes
        let avcc = [1, 0x42, 0, 0x1e, 0xff, 0xe1, 0, 2, 0x67, 0x42, 1, 0, 2, 0x68, 0xce];
        let mut bsf = BitstreamFilter::new(BitstreamFilterKind::Mp4ToAnnexB, Id::H264, Some(&avcc));

        let key = bsf.filter(video(&[0, 0, 0, 2, 0x65, 0x88], true));
        assert_eq!(
            &key.data()[..],
            &[0, 0, 0, 1, 0x67, 0x42, 0, 0, 0, 1, 0x68, 0xce, 0, 0, 0, 1, 0x65, 0x88][..]
        );
        assert!(key.is_key());

        let delta = bsf.filter(video(&[0, 0, 0, 2, 0x41, 0x9a], false));
        assert_eq!(&delta.data()[..], &[0, 0, 0, 1, 0x41, 0x9a][..]);

        // already Annex B: untouched
        let same = bsf.filter(video(&[0, 0, 0, 1, 0x41], false));
        assert_eq!(&same.data()[..], &[0, 0, 0, 1, 0x41][..]);
    }

    #[test]
    fn test_hvcc_length_size_and_arrays() {
        let mut hvcc = vec![1u8; 21];
        hvcc.push(0xfc | 0x01); // 2-byte NAL lengths
        hvcc.push(1); // one array
        hvcc.extend_from_slice(&[0x20, 0, 1, 0, 2, 0x40, 0x01]); // VPS
        let mut bsf = BitstreamFilter::new(BitstreamFilterKind::Mp4ToAnnexB, Id::HEVC, Some(&hvcc));
        let out = bsf.filter(video(&[0, 3, 0x26, 0x01, 0xaf], true));
        assert_eq!(
            &out.data()[..],
            &[0, 0, 0, 1, 0x40, 0x01, 0, 0, 0, 1, 0x26, 0x01, 0xaf][..]
        );
    }

    #[test]
    fn test_adts_header_is_stripped() {
        let mut bsf = BitstreamFilter::new(BitstreamFilterKind::AacAdtsToAsc, Id::AAC, None);
        let adts = [0xff, 0xf1, 0x50, 0x80, 0x01, 0x7f, 0xfc, 0x21, 0x10];
        let out = bsf.filter(RawPacket::from_data(&adts, 1, MediaType::Audio, true, Rational::new(1, 48000)));
        assert_eq!(&out.data()[..], &[0x21, 0x10][..]);

        let raw = [0x21, 0x10, 0x05];
        let out = bsf.filter(RawPacket::from_data(&raw, 1, MediaType::Audio, true, Rational::new(1, 48000)));
        assert_eq!(&out.data()[..], &raw[..]);
    }

    #[test]
    fn test_chain_per_path_codec() {
        let tb = Rational::new(1, 90000);
        let h264 = AvStream::from_codec(0, ffmpeg_next::media::Type::Video, Id::H264, tb);
        let vp9 = AvStream::from_codec(0, ffmpeg_next::media::Type::Video, Id::VP9, tb);
        let aac = AvStream::from_codec(1, ffmpeg_next::media::Type::Audio, Id::AAC, tb)
            .with_extradata(&[0x11, 0x90]);

        let passthrough = BsfChain::new(Some("flv"), &[h264, aac.clone()]);
        assert_eq!(passthrough.kind_for(0), Some(BitstreamFilterKind::AnnexBToMp4));
        assert_eq!(passthrough.kind_for(1), Some(BitstreamFilterKind::AacAdtsToAsc));

        let transcode = BsfChain::new(Some("flv"), &[vp9, aac]);
        assert_eq!(transcode.kind_for(0), None);

        assert!(BsfChain::new(None, &[]).is_empty());
    }

    const SPS: &[u8] = &[0x67, 0x64, 0x00, 0x1f, 0xac, 0xd9];
    const PPS: &[u8] = &[0x68, 0xeb, 0xe3];

    fn annexb_extradata() -> Vec<u8> {
        [START_CODE, SPS, START_CODE, PPS].concat()
    }

    #[test]
    fn test_avcc_from_annexb_parameter_sets() {
        let avcc = avcc_from_annexb(&annexb_extradata()).unwrap();
        assert_eq!(
            &avcc[..],
            &[
                1, 0x64, 0x00, 0x1f, 0xff, 0xe1, 0, 6, 0x67, 0x64, 0x00, 0x1f, 0xac, 0xd9, 1, 0,
                3, 0x68, 0xeb, 0xe3
            ][..]
        );
        // what the reverse filter reads back
        let (length_size, sets) = parse_avcc(&avcc).unwrap();
        assert_eq!(length_size, 4);
        assert_eq!(&sets[..], &annexb_extradata()[..]);

        assert!(avcc_from_annexb(&[0, 0, 0, 1, 0x68, 0xeb]).is_none());
    }

    #[test]
    fn test_hvcc_from_annexb() {
        let vps = [0x40, 0x01, 0x0c, 0x01];
        // general PTL with an emulation prevention byte in the constraint flags
        let sps = [
            0x42, 0x01, 0x01, 0x01, 0x60, 0x00, 0x00, 0x03, 0x00, 0x90, 0x00, 0x00, 0x03, 0x00,
            0x00, 0x03, 0x00, 0x5d, 0xa0,
        ];
        let pps = [0x44, 0x01, 0xc1];
        let extradata = [START_CODE, &vps[..], START_CODE, &sps[..], START_CODE, &pps[..]].concat();
        let hvcc = hvcc_from_annexb(&extradata).unwrap();
        assert_eq!(hvcc[0], 1);
        assert_eq!(&hvcc[1..13], &[0x01, 0x60, 0, 0, 0, 0x90, 0, 0, 0, 0, 0, 0x5d][..]);
        assert_eq!(hvcc[21] & 0x03, 3);
        assert_eq!(hvcc[22], 3);

        let (length_size, sets) = parse_hvcc(&hvcc).unwrap();
        assert_eq!(length_size, 4);
        assert_eq!(&sets[..], &extradata[..]);
    }

    #[test]
    fn test_audio_specific_config() {
        // AAC LC, 48 kHz, stereo
        assert_eq!(audio_specific_config(1, 48000, 2), Some([0x11, 0x90]));
        // unknown profile is LC
        assert_eq!(audio_specific_config(-99, 44100, 2), Some([0x12, 0x10]));
        assert_eq!(audio_specific_config(1, 47000, 2), None);
        assert_eq!(audio_specific_config(1, 48000, 0), None);

    }

    #[test]
    fn test_filtered_layout_carries_length_prefixed_record() {
        let tb = Rational::new(1, 90000);
        let h264 = AvStream::from_codec(0, ffmpeg_next::media::Type::Video, Id::H264, tb)
            .with_extradata(&annexb_extradata());
        let aac = AvStream::from_codec(1, ffmpeg_next::media::Type::Audio, Id::AAC, tb);

        let chain = BsfChain::new(Some("flv"), &[h264.clone(), aac.clone()]);
        let out = chain.output_streams(&[h264.clone(), aac.clone()]);
        assert_eq!(out[0].extradata().unwrap()[0], 0x01);
        // no sample rate or channels to build an ASC from: ADTS passes through
        assert_eq!(chain.kind_for(1), None);
        assert!(out[1].extradata().is_none());

        // already avcC: kept
        let avcc = h264.with_extradata(&[1, 0x42, 0, 0x1e, 0xff, 0xe0, 0]);
        let out = BsfChain::new(Some("mp4"), &[avcc.clone()]).output_streams(&[avcc]);
        assert_eq!(out[0].extradata(), Some(&[1, 0x42, 0, 0x1e, 0xff, 0xe0, 0][..]));

        // Annex B without any SPS: left to the muxer
        let broken = h264.with_extradata(&[0, 0, 0, 1, 0x06, 0x05]);
        let chain = BsfChain::new(Some("flv"), &[broken.clone()]);
        assert_eq!(chain.kind_for(0), None);
        assert_eq!(chain.output_streams(&[broken])[0].extradata(), Some(&[0, 0, 0, 1, 0x06, 0x05][..]));

        // mpegts output keeps the source record
        let chain = BsfChain::new(Some("mpegts"), &[h264.clone()]);
        assert_eq!(chain.output_streams(&[h264.clone()])[0].extradata(), h264.extradata());
    }
}
