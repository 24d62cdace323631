use std::fmt;

use ffmpeg_next::{Rational, codec::Parameters, format::stream};
use serde::{Deserialize, Serialize};

use crate::packet::MediaType;

unsafe impl Send for AvStream {}
unsafe impl Sync for AvStream {}

/// Width x height; zero means "not a video stream / unknown".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_zero(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

pub struct AvStream {
    index: usize,
    parameters: Parameters,
    time_base: Rational,
    rate: Rational,
}

impl AvStream {
    pub fn new(index: usize, parameters: Parameters, time_base: Rational, rate: Rational) -> Self {
        Self {
            index,
            parameters,
            time_base,
            rate,
        }
    }

    /// A stream described only by its medium and codec, e.g. for an encoder
    /// output or a source that has not produced codec parameters yet.
    pub fn from_codec(
        index: usize,
        medium: ffmpeg_next::media::Type,
        codec_id: ffmpeg_next::codec::Id,
        time_base: Rational,
    ) -> Self {
        let mut params = Parameters::new();
        unsafe {
            let ptr = params.as_mut_ptr();
            (*ptr).codec_type = medium.into();
            (*ptr).codec_id = codec_id.into();
        }
        Self {
            index,
            parameters: params,
            time_base,
            rate: Rational::new(0, 1),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }
    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }
    pub fn time_base(&self) -> Rational {
        self.time_base
    }
    pub fn rate(&self) -> Rational {
        self.rate
    }

    pub fn with_index(&self, index: usize) -> Self {
        let mut s = self.clone();
        s.index = index;
        s
    }

    pub fn with_time_base(&self, time_base: Rational) -> Self {
        let mut s = self.clone();
        s.time_base = time_base;
        s
    }

    pub fn media_type(&self) -> MediaType {
        self.parameters.medium().into()
    }

    pub fn is_video(&self) -> bool {
        self.parameters.medium() == ffmpeg_next::media::Type::Video
    }

    pub fn is_audio(&self) -> bool {
        self.parameters.medium() == ffmpeg_next::media::Type::Audio
    }

    pub fn codec_id(&self) -> ffmpeg_next::codec::Id {
        self.parameters.id()
    }

    /// Short codec name as FFmpeg spells it ("h264", "hevc", "aac").
    pub fn codec_name(&self) -> &'static str {
        self.parameters.id().name()
    }

    pub fn width(&self) -> u32 {
        unsafe {
            let ptr = self.parameters.as_ptr();
            (*ptr).width.max(0) as u32
        }
    }

    pub fn height(&self) -> u32 {
        unsafe {
            let ptr = self.parameters.as_ptr();
            (*ptr).height.max(0) as u32
        }
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width(), self.height())
    }

    pub fn sample_rate(&self) -> u32 {
        unsafe {
            let ptr = self.parameters.as_ptr();
            (*ptr).sample_rate.max(0) as u32
        }
    }

    pub fn channels(&self) -> u32 {
        unsafe {
            let ptr = self.parameters.as_ptr();
            (*ptr).ch_layout.nb_channels.max(0) as u32
        }
    }

    /// FFmpeg profile constant; negative when unknown.
    pub fn profile(&self) -> i32 {
        unsafe { (*self.parameters.as_ptr()).profile }
    }

    pub fn set_resolution(&mut self, resolution: Resolution) {
        unsafe {
            let ptr = self.parameters.as_mut_ptr();
            (*ptr).width = resolution.width as i32;
            (*ptr).height = resolution.height as i32;
        }
    }

    /// Codec configuration record (avcC/hvcC/AudioSpecificConfig), if any.
    pub fn extradata(&self) -> Option<&[u8]> {
        unsafe {
            let p = self.parameters.as_ptr();
            let data = (*p).extradata;
            let size = (*p).extradata_size;
            if data.is_null() || size <= 0 {
                return None;
            }
            Some(std::slice::from_raw_parts(data, size as usize))
        }
    }

    /// Copy of this stream announcing `data` as its configuration record.
    pub fn with_extradata(&self, data: &[u8]) -> Self {
        let mut s = self.clone();
        unsafe {
            let p = s.parameters.as_mut_ptr();
            ffmpeg_next::ffi::av_freep(&mut (*p).extradata as *mut *mut u8 as *mut std::ffi::c_void);
            (*p).extradata_size = 0;
            let padded = data.len() + ffmpeg_next::ffi::AV_INPUT_BUFFER_PADDING_SIZE as usize;
            let buf = ffmpeg_next::ffi::av_mallocz(padded) as *mut u8;
            if !buf.is_null() {
                std::ptr::copy_nonoverlapping(data.as_ptr(), buf, data.len());
                (*p).extradata = buf;
                (*p).extradata_size = data.len() as i32;
            }
        }
        s
    }

    pub fn fps(&self) -> f32 {
        if self.rate.denominator() == 0 {
            return 0.0;
        }
        self.rate.numerator() as f32 / self.rate.denominator() as f32
    }
}

impl From<stream::Stream<'_>> for AvStream {
    fn from(stream: stream::Stream<'_>) -> Self {
        Self {
            index: stream.index(),
            parameters: stream.parameters(),
            time_base: stream.time_base(),
            rate: stream.avg_frame_rate(),
        }
    }
}

impl Clone for AvStream {
    fn clone(&self) -> Self {
        Self {
            index: self.index,
            parameters: self.parameters.clone(),
            time_base: self.time_base,
            rate: self.rate,
        }
    }
}

impl fmt::Debug for AvStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AvStream")
            .field("index", &self.index)
            .field("codec", &self.codec_name())
            .field("media_type", &self.media_type())
            .field("time_base", &self.time_base)
            .finish()
    }
}
