//! Hardware-accelerated codec discovery.
//!
//! Hardware codecs are only used when a hardware device type is configured
//! (`cuda`, `qsv`, `vaapi`, `v4l2m2m`); callers fall back to the software
//! codec when none is found or it fails to open.

fn decoder_suffix(device_type: &str) -> Option<&'static str> {
    match device_type.to_ascii_lowercase().as_str() {
        "cuda" | "nvdec" | "cuvid" => Some("cuvid"),
        "qsv" => Some("qsv"),
        "v4l2m2m" => Some("v4l2m2m"),
        _ => None,
    }
}

fn encoder_suffix(device_type: &str) -> Option<&'static str> {
    match device_type.to_ascii_lowercase().as_str() {
        "cuda" | "nvenc" => Some("nvenc"),
        "vaapi" => Some("vaapi"),
        "qsv" => Some("qsv"),
        "v4l2m2m" => Some("v4l2m2m"),
        _ => None,
    }
}

/// Family name hardware codecs are prefixed with ("h264_nvenc", "hevc_qsv").
fn codec_family(codec_id: ffmpeg_next::codec::Id) -> Option<&'static str> {
    match codec_id {
        ffmpeg_next::codec::Id::H264 => Some("h264"),
        ffmpeg_next::codec::Id::HEVC => Some("hevc"),
        ffmpeg_next::codec::Id::VP8 => Some("vp8"),
        ffmpeg_next::codec::Id::VP9 => Some("vp9"),
        ffmpeg_next::codec::Id::AV1 => Some("av1"),
        ffmpeg_next::codec::Id::MPEG2VIDEO => Some("mpeg2"),
        ffmpeg_next::codec::Id::MPEG4 => Some("mpeg4"),
        _ => None,
    }
}

/// Name of the hardware decoder for `codec_id` on `device_type`, if the
/// device has named decoders at all.
pub fn hw_decoder_name(codec_id: ffmpeg_next::codec::Id, device_type: &str) -> Option<String> {
    Some(format!("{}_{}", codec_family(codec_id)?, decoder_suffix(device_type)?))
}

/// Name of the hardware encoder for a software codec name on `device_type`.
pub fn hw_encoder_name(codec_name: &str, device_type: &str) -> Option<String> {
    let family = match codec_name {
        "libx264" | "h264" => "h264",
        "libx265" | "hevc" | "h265" => "hevc",
        "libvpx-vp9" | "vp9" => "vp9",
        "libaom-av1" | "libsvtav1" | "av1" => "av1",
        _ => return None,
    };
    Some(format!("{}_{}", family, encoder_suffix(device_type)?))
}

pub fn find_hw_decoder(
    codec_id: ffmpeg_next::codec::Id,
    device_type: &str,
) -> Option<ffmpeg_next::Codec> {
    let name = hw_decoder_name(codec_id, device_type)?;
    let codec = ffmpeg_next::decoder::find_by_name(&name)?;
    log::info!("found hardware decoder: {}", name);
    Some(codec)
}

pub fn find_hw_encoder(codec_name: &str, device_type: &str) -> Option<ffmpeg_next::Codec> {
    let name = hw_encoder_name(codec_name, device_type)?;
    let codec = ffmpeg_next::encoder::find_by_name(&name)?;
    log::info!("found hardware encoder: {}", name);
    Some(codec)
}

/// Encoder option selecting the device, for encoders that take one.
pub fn device_option(codec_name: &str, device_name: &str) -> Option<(&'static str, String)> {
    if device_name.is_empty() {
        return None;
    }
    if codec_name.ends_with("_nvenc") {
        return Some(("gpu", device_name.to_string()));
    }
    None
}

/// Returns a pixel format suitable for the encoder. Source formats not supported (e.g. rgb24)
/// are mapped to YUV420P; hardware encoders prefer NV12.
pub fn pixel_format_for_encoder(
    source: ffmpeg_next::format::Pixel,
    codec_name: &str,
) -> ffmpeg_next::format::Pixel {
    use ffmpeg_next::format::Pixel;
    let is_hw = codec_name.contains("nvenc")
        || codec_name.contains("vaapi")
        || codec_name.contains("qsv")
        || codec_name.contains("v4l2m2m");
    match source {
        Pixel::YUV420P | Pixel::NV12 => source,
        _ if is_hw => Pixel::NV12,
        _ => Pixel::YUV420P,
    }
}
