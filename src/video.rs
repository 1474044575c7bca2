use crate::render::Surface;
use anyhow::{Context, Error, Result};
use image::{EncodableLayout, RgbaImage};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{Level, debug, error, info, span};

use nokhwa::{
    Camera, nokhwa_initialize,
    pixel_format::RgbAFormat,
    query,
    utils::{ApiBackend, CameraIndex, RequestedFormat, RequestedFormatType},
};

pub trait FrameSource {
    fn next_frame(&mut self) -> Result<RgbaImage>;
    /// Short label for the control panel.
    fn describe(&self) -> String;
}

pub struct CameraSource {
    camera: Camera,
}

impl CameraSource {
    /// Opens camera `index`, or the last one found when unset.
    pub fn new(index: Option<u32>, fps: u32) -> Result<Self> {
        let span = span!(Level::INFO, "CameraSource#new");
        let _guard = span.enter();

        nokhwa_initialize(|granted| {
            debug!("User said {}", granted);
        });

        let cameras = query(ApiBackend::Auto)?;
        cameras
            .iter()
            .for_each(|cam| debug!("Found camera: {:?}", cam));

        let index = match index {
            Some(i) => CameraIndex::Index(i),
            None => cameras
                .last()
                .context("No cameras found")?
                .index()
                .clone(),
        };

        let mut camera = Camera::new(
            index,
            RequestedFormat::new::<RgbAFormat>(RequestedFormatType::AbsoluteHighestFrameRate),
        )?;
        camera.set_frame_rate(fps)?;
        camera.open_stream()?;
        info!(
            "Opened {} at {}",
            camera.info().human_name(),
            camera.resolution()
        );

        Ok(Self { camera })
    }
}

impl FrameSource for CameraSource {
    fn next_frame(&mut self) -> Result<RgbaImage> {
        let span = span!(Level::DEBUG, "get_frame");
        let _guard = span.enter();
        let frame = self.camera.frame()?;
        Ok(frame.decode_image::<RgbAFormat>()?)
    }

    fn describe(&self) -> String {
        format!("Camera: {}", self.camera.info().human_name())
    }
}

impl Drop for CameraSource {
    fn drop(&mut self) {
        if let Err(e) = self.camera.stop_stream() {
            error!("Failed to stop camera stream {e:?}");
        }
    }
}

/// Feeds the same still image every frame.
pub struct ImageSource {
    path: PathBuf,
    image: RgbaImage,
}

impl ImageSource {
    pub fn open(path: &Path) -> Result<Self> {
        let image = image::open(path)
            .with_context(|| format!("Failed to read image {path:?}"))?
            .into_rgba8();
        Ok(Self {
            path: path.to_path_buf(),
            image,
        })
    }
}

impl FrameSource for ImageSource {
    fn next_frame(&mut self) -> Result<RgbaImage> {
        Ok(self.image.clone())
    }

    fn describe(&self) -> String {
        format!("Image: {}", self.path.display())
    }
}

/// A frame source the control panel can switch to.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceChoice {
    Camera { index: u32, name: String },
    Image(PathBuf),
}

impl SourceChoice {
    pub fn label(&self) -> String {
        match self {
            Self::Camera { name, .. } => format!("Camera: {name}"),
            Self::Image(path) => format!("Image: {}", path.display()),
        }
    }

    pub fn open(&self, fps: u32) -> Result<Box<dyn FrameSource>> {
        Ok(match self {
            Self::Camera { index, .. } => Box::new(CameraSource::new(Some(*index), fps)?),
            Self::Image(path) => Box::new(ImageSource::open(path)?),
        })
    }
}

/// Cameras nokhwa can see, followed by `image` if given.
pub fn list_sources(image: Option<&Path>) -> Vec<SourceChoice> {
    let span = span!(Level::DEBUG, "list_sources");
    let _guard = span.enter();

    nokhwa_initialize(|granted| {
        debug!("User said {}", granted);
    });

    let mut sources = match query(ApiBackend::Auto) {
        Ok(cameras) => cameras
            .iter()
            .filter_map(|cam| match cam.index() {
                CameraIndex::Index(index) => Some(SourceChoice::Camera {
                    index: *index,
                    name: cam.human_name(),
                }),
                CameraIndex::String(_) => None,
            })
            .collect::<Vec<_>>(),
        Err(e) => {
            error!("Failed to list cameras: {e:?}");
            Vec::new()
        }
    };
    if let Some(path) = image {
        sources.push(SourceChoice::Image(path.to_path_buf()));
    }
    sources
}

/// Index of the source to start with: the image when there is one,
/// otherwise camera `camera`, otherwise the last camera found.
pub fn initial_source(sources: &[SourceChoice], camera: Option<u32>) -> Option<usize> {
    if let Some(idx) = sources
        .iter()
        .position(|s| matches!(s, SourceChoice::Image(_)))
    {
        return Some(idx);
    }
    match camera {
        Some(wanted) => sources
            .iter()
            .position(|s| matches!(s, SourceChoice::Camera { index, .. } if *index == wanted)),
        None => sources
            .iter()
            .rposition(|s| matches!(s, SourceChoice::Camera { .. })),
    }
}

/// Largest canvas with the frame's aspect ratio, sized by the viewport's
/// longer axis.
pub fn fit_to_viewport(frame: (u32, u32), viewport: (u32, u32)) -> Surface {
    let (frame_w, frame_h) = frame;
    let (view_w, view_h) = viewport;
    let aspect = frame_h as f32 / frame_w as f32;

    let (width, height) = if view_w > view_h {
        let height = view_h as f32;
        (height / aspect, height)
    } else {
        let width = view_w as f32;
        (width, width * aspect)
    };

    Surface::new(
        (width.round() as u32).max(1),
        (height.round() as u32).max(1),
    )
}

pub struct OutputVideoStream {
    output_proc: std::process::Child,
    width: u32,
    height: u32,
}

impl Drop for OutputVideoStream {
    fn drop(&mut self) {
        if let Err(e) = self.output_proc.kill() {
            error!("Failed to stop output process {e:?}");
        }
        let _ = self.output_proc.wait();
    }
}

impl OutputVideoStream {
    pub fn new(width: u32, height: u32, device: Option<&str>) -> Result<Self> {
        let size = format!("{}x{}", width, height);
        let mut command = match device {
            Some(d) => {
                let mut command = Command::new("ffmpeg");
                command.args([
                    "-f",
                    "rawvideo",
                    "-pix_fmt",
                    "rgba",
                    "-s",
                    &size,
                    "-i",
                    "-",
                    "-map",
                    "0:v",
                    "-preset",
                    "fast",
                    "-vf",
                    "format=yuv420p",
                    "-f",
                    "v4l2",
                    &format!("/dev/{d}"),
                ]);
                command
            }
            None => {
                let mut command = Command::new("ffplay");
                command.args([
                    "-f",
                    "rawvideo",
                    "-pixel_format",
                    "rgba",
                    "-video_size",
                    &size,
                    "-window_title",
                    "facemask",
                    "-fflags",
                    "nobuffer",
                    "-flags",
                    "low_delay",
                    "-loglevel",
                    "error",
                    "-",
                ]);
                command
            }
        };
        let output_proc = command
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to spawn {:?}", command.get_program()))?;

        Ok(Self {
            output_proc,
            width,
            height,
        })
    }

    pub fn write_frame(&mut self, img: &RgbaImage) -> Result<()> {
        if img.dimensions() != (self.width, self.height) {
            return Err(Error::msg(format!(
                "Frame is {:?}, stream expects {}x{}",
                img.dimensions(),
                self.width,
                self.height
            )));
        }
        if let Some(stdin) = self.output_proc.stdin.as_mut() {
            stdin.write_all(img.as_bytes())?;
        }

        Ok(())
    }
}

/// Keeps an output stream matching the canvas, restarting the player
/// whenever the frame size changes.
pub struct VideoSink {
    device: Option<String>,
    stream: Option<OutputVideoStream>,
}

impl VideoSink {
    pub fn new(device: Option<String>) -> Self {
        Self {
            device,
            stream: None,
        }
    }

    pub fn write_frame(&mut self, img: &RgbaImage) -> Result<()> {
        let span = span!(Level::DEBUG, "write_frame");
        let _guard = span.enter();

        let mut stream = match self.stream.take() {
            Some(s) if (s.width, s.height) == img.dimensions() => s,
            previous => {
                if previous.is_some() {
                    debug!("Output size changed to {:?}, restarting stream", img.dimensions());
                }
                drop(previous);
                OutputVideoStream::new(img.width(), img.height(), self.device.as_deref())?
            }
        };
        let written = stream.write_frame(img);
        self.stream = Some(stream);
        written
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fit_landscape_viewport() {
        assert_eq!(fit_to_viewport((640, 480), (1280, 720)), Surface::new(960, 720));
        assert_eq!(fit_to_viewport((1920, 1080), (1280, 720)), Surface::new(1280, 720));
    }

    #[test]
    fn test_fit_portrait_viewport() {
        assert_eq!(fit_to_viewport((640, 480), (480, 800)), Surface::new(480, 360));
    }

    #[test]
    fn test_fit_square_viewport_uses_width() {
        assert_eq!(fit_to_viewport((400, 800), (500, 500)), Surface::new(500, 1000));
    }

    #[test]
    fn test_fit_preserves_aspect() {
        let surface = fit_to_viewport((1280, 720), (1000, 700));
        let aspect = surface.width as f32 / surface.height as f32;
        assert!((aspect - 16. / 9.).abs() < 0.01);
    }

    #[test]
    fn test_image_source_missing_file() {
        assert!(ImageSource::open(Path::new("/nonexistent/frame.png")).is_err());
        assert!(SourceChoice::Image("/nonexistent/frame.png".into()).open(30).is_err());
    }

    fn camera(index: u32) -> SourceChoice {
        SourceChoice::Camera {
            index,
            name: format!("cam{index}"),
        }
    }

    #[test]
    fn test_initial_source_prefers_image() {
        let sources = [camera(0), camera(2), SourceChoice::Image("in.png".into())];
        assert_eq!(initial_source(&sources, None), Some(2));
        assert_eq!(initial_source(&sources, Some(0)), Some(2));
    }

    #[test]
    fn test_initial_source_camera() {
        let sources = [camera(0), camera(2)];
        assert_eq!(initial_source(&sources, None), Some(1));
        assert_eq!(initial_source(&sources, Some(0)), Some(0));
        assert_eq!(initial_source(&sources, Some(1)), None);
        assert_eq!(initial_source(&[], None), None);
    }

    #[test]
    fn test_source_labels() {
        assert_eq!(camera(3).label(), "Camera: cam3");
        assert_eq!(SourceChoice::Image("a/b.png".into()).label(), "Image: a/b.png");
    }
}
