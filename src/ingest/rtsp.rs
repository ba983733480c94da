//! RTSP camera source.
//!
//! Uses a GStreamer pipeline (`rtspsrc ! decodebin ! videoconvert ! appsink`)
//! behind the `rtsp-gstreamer` feature. The appsink keeps a single buffer and
//! drops older ones, so a slow reader always gets the newest picture.

#[cfg(feature = "rtsp-gstreamer")]
use anyhow::Context;
use anyhow::Result;
#[cfg(feature = "rtsp-gstreamer")]
use gstreamer::prelude::*;
use image::RgbImage;

use super::{CaptureSettings, VideoCapture};

pub struct RtspCapture {
    #[cfg(feature = "rtsp-gstreamer")]
    inner: GstreamerRtsp,
    #[cfg(not(feature = "rtsp-gstreamer"))]
    settings: CaptureSettings,
}

impl RtspCapture {
    pub fn new(settings: CaptureSettings) -> Result<Self> {
        #[cfg(feature = "rtsp-gstreamer")]
        {
            Ok(Self {
                inner: GstreamerRtsp::new(settings)?,
            })
        }
        #[cfg(not(feature = "rtsp-gstreamer"))]
        {
            anyhow::bail!(
                "RTSP camera {} requires the rtsp-gstreamer feature",
                settings.redacted_url()
            )
        }
    }
}

impl VideoCapture for RtspCapture {
    fn describe(&self) -> String {
        #[cfg(feature = "rtsp-gstreamer")]
        {
            self.inner.settings.redacted_url()
        }
        #[cfg(not(feature = "rtsp-gstreamer"))]
        {
            self.settings.redacted_url()
        }
    }

    fn open(&mut self) -> Result<()> {
        #[cfg(feature = "rtsp-gstreamer")]
        {
            self.inner.open()
        }
        #[cfg(not(feature = "rtsp-gstreamer"))]
        {
            anyhow::bail!("RTSP requires the rtsp-gstreamer feature")
        }
    }

    fn read_frame(&mut self) -> Result<Option<RgbImage>> {
        #[cfg(feature = "rtsp-gstreamer")]
        {
            self.inner.read_frame()
        }
        #[cfg(not(feature = "rtsp-gstreamer"))]
        {
            anyhow::bail!("RTSP requires the rtsp-gstreamer feature")
        }
    }

    fn release(&mut self) {
        #[cfg(feature = "rtsp-gstreamer")]
        self.inner.release();
    }
}

// ----------------------------------------------------------------------------
// GStreamer pipeline
// ----------------------------------------------------------------------------

#[cfg(feature = "rtsp-gstreamer")]
struct GstreamerRtsp {
    settings: CaptureSettings,
    pipeline: Option<(gstreamer::Pipeline, gstreamer_app::AppSink)>,
}

#[cfg(feature = "rtsp-gstreamer")]
impl GstreamerRtsp {
    fn new(settings: CaptureSettings) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;
        Ok(Self {
            settings,
            pipeline: None,
        })
    }

    fn build_pipeline(&self) -> Result<(gstreamer::Pipeline, gstreamer_app::AppSink)> {
        let url = self.settings.authenticated_url()?;
        let protocols = if self.settings.reliable_transport {
            " protocols=tcp"
        } else {
            ""
        };
        // rtspsrc timeout is in microseconds.
        let timeout_us = self.settings.read_timeout.as_micros();
        let description = format!(
            "rtspsrc location=\"{}\" latency=0 timeout={}{} ! decodebin ! videoconvert ! \
             video/x-raw,format=RGB ! appsink name=appsink sync=false max-buffers=1 drop=true",
            url, timeout_us, protocols
        );
        let pipeline = gstreamer::parse::launch(&description)
            .context("build RTSP pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow::anyhow!("RTSP pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow::anyhow!("appsink element has unexpected type"))?;
        Ok((pipeline, appsink))
    }

    fn open(&mut self) -> Result<()> {
        self.release();
        let (pipeline, appsink) = self.build_pipeline()?;
        pipeline
            .set_state(gstreamer::State::Playing)
            .context("set RTSP pipeline to Playing")?;
        log::info!("capture: connected to {}", self.settings.redacted_url());
        self.pipeline = Some((pipeline, appsink));
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Option<RgbImage>> {
        let Some((pipeline, appsink)) = self.pipeline.as_ref() else {
            anyhow::bail!("RTSP source not connected; call open() first");
        };
        poll_bus(pipeline)?;

        let timeout = gstreamer::ClockTime::from_mseconds(
            self.settings.read_timeout.as_millis().min(u64::MAX as u128) as u64,
        );
        match appsink.try_pull_sample(timeout) {
            Some(sample) => sample_to_image(&sample).map(Some),
            None if appsink.is_eos() => anyhow::bail!("RTSP stream reached end of stream"),
            None => Ok(None),
        }
    }

    fn release(&mut self) {
        if let Some((pipeline, _)) = self.pipeline.take() {
            if let Err(err) = pipeline.set_state(gstreamer::State::Null) {
                log::warn!("failed to stop RTSP pipeline: {}", err);
            }
        }
    }
}

#[cfg(feature = "rtsp-gstreamer")]
impl Drop for GstreamerRtsp {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(feature = "rtsp-gstreamer")]
fn poll_bus(pipeline: &gstreamer::Pipeline) -> Result<()> {
    let Some(bus) = pipeline.bus() else {
        return Ok(());
    };
    while let Some(message) = bus.pop() {
        use gstreamer::MessageView;
        match message.view() {
            MessageView::Error(err) => {
                anyhow::bail!(
                    "gstreamer error from {:?}: {}",
                    err.src().map(|s| s.path_string()),
                    err.error()
                );
            }
            MessageView::Eos(..) => anyhow::bail!("gstreamer reached EOS"),
            _ => {}
        }
    }
    Ok(())
}

#[cfg(feature = "rtsp-gstreamer")]
fn sample_to_image(sample: &gstreamer::Sample) -> Result<RgbImage> {
    let buffer = sample.buffer().context("RTSP sample missing buffer")?;
    let caps = sample.caps().context("RTSP sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse RTSP caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map RTSP buffer")?;
    let data = map.as_slice();

    let pixels = if stride == row_bytes {
        data.get(..row_bytes * height as usize)
            .context("RTSP buffer shorter than frame")?
            .to_vec()
    } else {
        let mut pixels = Vec::with_capacity(row_bytes * height as usize);
        for row in 0..height as usize {
            let start = row * stride;
            pixels.extend_from_slice(
                data.get(start..start + row_bytes)
                    .context("RTSP buffer row is out of bounds")?,
            );
        }
        pixels
    };

    RgbImage::from_raw(width, height, pixels).context("RTSP frame size mismatch")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(not(feature = "rtsp-gstreamer"))]
    #[test]
    fn rtsp_without_feature_is_an_error() {
        let settings = CaptureSettings {
            url: "rtsp://user:pw@camera/stream".to_string(),
            ..CaptureSettings::default()
        };
        let err = RtspCapture::new(settings).err().expect("feature disabled");
        let message = err.to_string();
        assert!(message.contains("rtsp-gstreamer"));
        assert!(!message.contains("pw"));
    }
}
