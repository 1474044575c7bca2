use crate::controls::{ControlPanel, InputView, PanelEvent, PanelInput, apply_options};
use crate::fps::FpsCounter;
use crate::options::SolutionOptions;
use crate::panel::PanelView;
use crate::render::{EffectRenderer, RenderBackend, Surface, WgpuBackend};
use crate::solution::FaceSolution;
use crate::video::{FrameSource, SourceChoice, VideoSink, fit_to_viewport};
use anyhow::{Context, Result};
use image::RgbaImage;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{Level, error, info, span, trace};

/// What the frame loop has to do after panel input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopAction {
    Quit,
    /// Switch to the source at this index.
    SwitchSource(usize),
}

/// Everything the frame loop owns.
pub struct AppContext<S, B> {
    panel: ControlPanel,
    view: InputView,
    solution: S,
    renderer: EffectRenderer<B>,
    fps: FpsCounter,
    viewport: (u32, u32),
}

impl<S: FaceSolution, B: RenderBackend> AppContext<S, B> {
    pub fn new(
        options: SolutionOptions,
        sources: Vec<String>,
        active_source: usize,
        mut solution: S,
        renderer: EffectRenderer<B>,
        viewport: (u32, u32),
    ) -> Self {
        let panel = ControlPanel::new(options, sources, active_source);
        let mut view = InputView::default();
        apply_options(panel.options(), &mut solution, &mut view);

        Self {
            panel,
            view,
            solution,
            renderer,
            fps: FpsCounter::new(),
            viewport,
        }
    }

    /// Applies panel input. Options changes go straight to the solution;
    /// quitting and source switches are left to the caller.
    pub fn handle_inputs(&mut self, inputs: &[PanelInput]) -> Option<LoopAction> {
        let mut action = None;
        for input in inputs {
            match self.panel.handle(*input) {
                Some(PanelEvent::Changed(options)) => {
                    apply_options(&options, &mut self.solution, &mut self.view)
                }
                Some(PanelEvent::SourceChanged(idx)) => {
                    action = Some(LoopAction::SwitchSource(idx))
                }
                Some(PanelEvent::Quit) => return Some(LoopAction::Quit),
                None => {}
            }
        }
        action
    }

    /// Fits the canvas to the frame, runs the solution and renders the
    /// result. Blocks until the frame is fully drawn.
    pub fn process_frame(&mut self, frame: RgbaImage) -> Result<Surface> {
        let span = span!(Level::DEBUG, "process_frame");
        let _guard = span.enter();

        let surface = fit_to_viewport(frame.dimensions(), self.viewport);
        let result = self.solution.send(frame)?;
        trace!("{} faces", result.multi_face_geometry.len());
        self.renderer.render(result, surface)?;
        self.fps.tick();
        Ok(surface)
    }

    pub fn panel(&self) -> &ControlPanel {
        &self.panel
    }

    pub fn panel_mut(&mut self) -> &mut ControlPanel {
        &mut self.panel
    }

    pub fn view(&self) -> &InputView {
        &self.view
    }

    pub fn renderer(&self) -> &EffectRenderer<B> {
        &self.renderer
    }

    pub fn renderer_mut(&mut self) -> &mut EffectRenderer<B> {
        &mut self.renderer
    }

    pub fn fps(&self) -> f32 {
        self.fps.fps()
    }
}

/// Runs until the source dries up, the output closes or the user quits.
///
/// `source` must be the opened form of `sources[ctx.panel().active_source()]`.
pub fn run<S: FaceSolution>(
    ctx: &mut AppContext<S, WgpuBackend>,
    sources: &[SourceChoice],
    mut source: Box<dyn FrameSource>,
    sink: &mut VideoSink,
    mut panel: Option<PanelView>,
    fps: u32,
) -> Result<()> {
    let frame_interval = Duration::from_secs_f32(1. / fps.max(1) as f32);

    loop {
        let span = span!(Level::INFO, "frame_loop_iter");
        let _guard = span.enter();
        let start = Instant::now();

        if let Some(view) = panel.as_ref() {
            let current = ctx.panel().active_source();
            match ctx.handle_inputs(&view.poll_input()?) {
                Some(LoopAction::Quit) => {
                    info!("Quit requested");
                    break;
                }
                Some(LoopAction::SwitchSource(idx)) => match switch_source(sources, idx, fps) {
                    Ok(next) => {
                        info!("Reading from {}", next.describe());
                        source = next;
                    }
                    Err(e) => {
                        error!("Failed to switch source: {e:?}");
                        ctx.panel_mut().set_active_source(current);
                    }
                },
                None => {}
            }
        }

        let frame = match source.next_frame() {
            Ok(frame) => frame,
            Err(e) => {
                error!("Failed to pull frame from source: {e:?}");
                break;
            }
        };

        match ctx
            .process_frame(frame)
            .and_then(|_| ctx.renderer().backend().read_frame())
        {
            Ok(img) => {
                if let Err(e) = sink.write_frame(&img) {
                    error!("Output stream closed: {e:?}");
                    break;
                }
            }
            Err(e) => error!("Failed to process frame: {e:?}"),
        }

        if let Some(view) = panel.as_mut() {
            view.draw(ctx.panel(), ctx.fps(), ctx.view())?;
        }

        if let Some(remaining) = frame_interval.checked_sub(start.elapsed()) {
            thread::sleep(remaining);
        }
    }

    Ok(())
}

fn switch_source(sources: &[SourceChoice], idx: usize, fps: u32) -> Result<Box<dyn FrameSource>> {
    sources
        .get(idx)
        .with_context(|| format!("No source at index {idx}"))?
        .open(fps)
}

/// Renders a single frame and saves it to `dest`.
pub fn process_image<S: FaceSolution>(
    ctx: &mut AppContext<S, WgpuBackend>,
    source: &mut dyn FrameSource,
    dest: &Path,
) -> Result<()> {
    ctx.renderer_mut().wait_for_model();
    let frame = source.next_frame()?;
    let surface = ctx.process_frame(frame)?;
    let img = ctx.renderer().backend().read_frame()?;
    img.save(dest)
        .with_context(|| format!("Failed to write {dest:?}"))?;
    info!("Wrote {}x{} result to {dest:?}", surface.width, surface.height);
    Ok(())
}
