use ffmpeg_next::{format::Pixel, frame::Video, software::scaling};

/// Converts decoded frames to the encoder's pixel format and size.
pub struct Scaler {
    context: scaling::Context,
    source: (Pixel, u32, u32),
}

impl Scaler {
    pub fn new(frame: &Video, format: Pixel, width: u32, height: u32) -> anyhow::Result<Self> {
        let context = scaling::Context::get(
            frame.format(),
            frame.width(),
            frame.height(),
            format,
            width,
            height,
            scaling::flag::Flags::BILINEAR,
        )?;
        Ok(Self {
            context,
            source: (frame.format(), frame.width(), frame.height()),
        })
    }

    /// Whether `frame` has the layout this scaler was built for.
    pub fn accepts(&self, frame: &Video) -> bool {
        self.source == (frame.format(), frame.width(), frame.height())
    }

    pub fn run(&mut self, frame: &Video) -> anyhow::Result<Video> {
        let mut converted = Video::empty();
        self.context.run(frame, &mut converted)?;
        converted.set_pts(frame.pts());
        converted.set_kind(frame.kind());
        Ok(converted)
    }
}

unsafe impl Send for Scaler {}
