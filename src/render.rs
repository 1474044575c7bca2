pub mod backend;
pub mod camera;
pub mod gpu;
pub mod model;
pub mod scene;
pub mod vertex;

use crate::solution::DetectionResult;
use anyhow::{Result, bail};
use camera::PerspectiveCamera;
use model::ModelLoader;
use nalgebra::Vector3;
use scene::{DirectionalLight, FaceGroup, HemisphereLight, ImagePlane, Node, NodeId, Scene, rgb};
use tracing::{Level, span, trace};

pub use backend::WgpuBackend;

pub const VIDEO_DEPTH: f32 = 50.;
pub const FOV_DEGREES: f32 = 63.;
pub const NEAR: f32 = 1.;
pub const FAR: f32 = 1000.;

const BACKGROUND: u32 = 0xa9a9a9;

/// Pixel dimensions of the canvas being rendered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Surface {
    pub width: u32,
    pub height: u32,
}

impl Surface {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn aspect(&self) -> f32 {
        self.width as f32 / self.height as f32
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

pub trait RenderBackend {
    /// Sets the viewport. Called before every draw.
    fn resize(&mut self, width: u32, height: u32) -> Result<()>;
    fn draw(&mut self, scene: &Scene, camera: &PerspectiveCamera) -> Result<()>;
}

/// Draws the camera frame as a backdrop with the head model posed over it.
pub struct EffectRenderer<B> {
    backend: B,
    scene: Scene,
    group: NodeId,
    camera: PerspectiveCamera,
    loader: ModelLoader,
}

impl<B: RenderBackend> EffectRenderer<B> {
    pub fn new(backend: B, loader: ModelLoader) -> Self {
        let mut scene = Scene::new(rgb(BACKGROUND));
        scene.add(Node::Hemisphere(HemisphereLight {
            sky: rgb(0xffffff),
            ground: rgb(0x444444),
            position: Vector3::new(0., 100., 0.),
        }));
        scene.add(Node::Directional(DirectionalLight {
            color: rgb(0xffffff),
            position: Vector3::new(-30., 100., -5.),
        }));
        let group = scene.add(Node::Group(FaceGroup::default()));

        Self {
            backend,
            scene,
            group,
            camera: PerspectiveCamera::new(FOV_DEGREES, 1., NEAR, FAR),
            loader,
        }
    }

    pub fn render(&mut self, result: DetectionResult, surface: Surface) -> Result<()> {
        let span = span!(Level::DEBUG, "EffectRenderer#render");
        let _guard = span.enter();

        self.update_camera(surface)?;

        let plane = ImagePlane::filling_view(&self.camera, VIDEO_DEPTH, result.image);
        let plane = self.scene.add(Node::Plane(plane));

        self.poll_model();
        if let Some(group) = self.face_group_mut() {
            match result.multi_face_geometry.first() {
                Some(geometry) => group.set_pose(&geometry.pose_transform),
                None => group.hide(),
            }
        }

        let drawn = self.backend.draw(&self.scene, &self.camera);
        self.scene.remove(plane);
        drawn
    }

    /// Moves the face group out of `Pending` once the head model load finishes.
    pub fn poll_model(&mut self) {
        if !self.model_pending() {
            return;
        }

        if let Some(loaded) = self.loader.poll() {
            if let Some(group) = self.face_group_mut() {
                group.apply_load(loaded);
            }
        }
    }

    /// Blocks until the head model has loaded or failed.
    pub fn wait_for_model(&mut self) {
        if self.model_pending() {
            let loaded = self.loader.wait();
            if let Some(group) = self.face_group_mut() {
                group.apply_load(loaded);
            }
        }
    }

    fn model_pending(&self) -> bool {
        self.face_group()
            .is_some_and(|g| matches!(g.model, scene::ModelState::Pending))
    }

    fn update_camera(&mut self, surface: Surface) -> Result<()> {
        if surface.is_empty() {
            bail!("Cannot render to a {}x{} surface", surface.width, surface.height);
        }
        trace!("Surface {}x{}", surface.width, surface.height);
        self.camera = PerspectiveCamera::new(FOV_DEGREES, surface.aspect(), NEAR, FAR);
        self.backend.resize(surface.width, surface.height)
    }

    pub fn face_group(&self) -> Option<&FaceGroup> {
        match self.scene.get(self.group) {
            Some(Node::Group(group)) => Some(group),
            _ => None,
        }
    }

    fn face_group_mut(&mut self) -> Option<&mut FaceGroup> {
        match self.scene.get_mut(self.group) {
            Some(Node::Group(group)) => Some(group),
            _ => None,
        }
    }

    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    pub fn camera(&self) -> &PerspectiveCamera {
        &self.camera
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::TriMesh;
    use crate::solution::{FaceGeometry, Mesh, PoseTransform};
    use anyhow::Error;
    use approx::assert_relative_eq;
    use image::RgbaImage;
    use nalgebra::Matrix4;
    use scene::ModelState;

    #[derive(Debug, Clone)]
    struct Draw {
        child_count: usize,
        plane: Option<(f32, f32, f32)>,
        group_visible: bool,
        group_matrix: Matrix4<f32>,
        aspect: f32,
    }

    #[derive(Default)]
    struct RecordingBackend {
        viewports: Vec<(u32, u32)>,
        draws: Vec<Draw>,
        fail_draw: bool,
    }

    impl RenderBackend for RecordingBackend {
        fn resize(&mut self, width: u32, height: u32) -> Result<()> {
            self.viewports.push((width, height));
            Ok(())
        }

        fn draw(&mut self, scene: &Scene, camera: &PerspectiveCamera) -> Result<()> {
            let group = scene
                .children()
                .find_map(|n| match n {
                    Node::Group(g) => Some(g.clone()),
                    _ => None,
                })
                .unwrap();
            let plane = scene.children().find_map(|n| match n {
                Node::Plane(p) => Some((p.width, p.height, p.depth)),
                _ => None,
            });
            self.draws.push(Draw {
                child_count: scene.child_count(),
                plane,
                group_visible: group.visible,
                group_matrix: group.matrix,
                aspect: camera.aspect,
            });
            if self.fail_draw {
                return Err(Error::msg("device lost"));
            }
            Ok(())
        }
    }

    /// The sender keeps the head model pending for as long as it lives.
    fn renderer() -> (EffectRenderer<RecordingBackend>, flume::Sender<Result<TriMesh>>) {
        let (loader, tx) = ModelLoader::never();
        (EffectRenderer::new(RecordingBackend::default(), loader), tx)
    }

    fn pose(seed: f32) -> [f32; 16] {
        std::array::from_fn(|i| seed + i as f32)
    }

    fn result(poses: &[[f32; 16]]) -> DetectionResult {
        DetectionResult {
            image: RgbaImage::new(4, 3),
            multi_face_geometry: poses
                .iter()
                .map(|p| FaceGeometry {
                    pose_transform: PoseTransform::from_packed(*p),
                    mesh: Mesh::default(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_plane_fills_view() {
        let (mut renderer, _loader) = renderer();
        renderer.render(result(&[]), Surface::new(1920, 1080)).unwrap();

        let (width, height, depth) = renderer.backend().draws[0].plane.unwrap();
        assert_relative_eq!(height, 61.28, epsilon = 0.01);
        assert_relative_eq!(width, 108.94, epsilon = 0.02);
        assert_eq!(depth, VIDEO_DEPTH);
    }

    #[test]
    fn test_plane_removed_after_render() {
        let (mut renderer, _loader) = renderer();
        let before = renderer.scene().child_count();

        renderer.render(result(&[]), Surface::new(640, 480)).unwrap();
        renderer.render(result(&[pose(0.)]), Surface::new(640, 480)).unwrap();

        assert_eq!(renderer.scene().child_count(), before);
        assert_eq!(renderer.scene().plane_count(), 0);
        for draw in &renderer.backend().draws {
            assert_eq!(draw.child_count, before + 1);
        }
    }

    #[test]
    fn test_plane_removed_when_draw_fails() {
        let (mut renderer, _loader) = renderer();
        renderer.backend_mut().fail_draw = true;
        let before = renderer.scene().child_count();

        assert!(renderer.render(result(&[]), Surface::new(640, 480)).is_err());
        assert_eq!(renderer.scene().child_count(), before);
    }

    #[test]
    fn test_first_pose_applied() {
        let (mut renderer, _loader) = renderer();
        let first = pose(1.);
        renderer
            .render(result(&[first, pose(100.)]), Surface::new(640, 480))
            .unwrap();

        let draw = &renderer.backend().draws[0];
        assert!(draw.group_visible);
        assert_eq!(draw.group_matrix, Matrix4::from_column_slice(&first));
        // column-major: translation lives in the last four values
        assert_eq!(draw.group_matrix[(0, 3)], first[12]);
    }

    #[test]
    fn test_no_face_hides_group_and_keeps_matrix() {
        let (mut renderer, _loader) = renderer();
        let first = pose(5.);
        renderer.render(result(&[first]), Surface::new(640, 480)).unwrap();
        renderer.render(result(&[]), Surface::new(640, 480)).unwrap();

        let draw = &renderer.backend().draws[1];
        assert!(!draw.group_visible);
        assert_eq!(draw.group_matrix, Matrix4::from_column_slice(&first));
    }

    #[test]
    fn test_no_face_before_any_pose() {
        let (mut renderer, _loader) = renderer();
        renderer.render(result(&[]), Surface::new(640, 480)).unwrap();

        let group = renderer.face_group().unwrap();
        assert!(!group.visible);
        assert_eq!(group.matrix, Matrix4::identity());
        assert!(matches!(group.model, ModelState::Pending));
    }

    #[test]
    fn test_resize_between_renders() {
        let (mut renderer, _loader) = renderer();
        renderer.render(result(&[]), Surface::new(640, 480)).unwrap();
        renderer.render(result(&[]), Surface::new(1280, 720)).unwrap();

        let backend = renderer.backend();
        assert_eq!(backend.viewports, vec![(640, 480), (1280, 720)]);
        assert_relative_eq!(backend.draws[0].aspect, 4. / 3.);
        assert_relative_eq!(backend.draws[1].aspect, 16. / 9.);
        assert_relative_eq!(renderer.camera().aspect, 16. / 9.);
    }

    #[test]
    fn test_empty_surface_rejected() {
        let (mut renderer, _loader) = renderer();
        let before = renderer.scene().child_count();
        assert!(renderer.render(result(&[]), Surface::new(0, 480)).is_err());
        assert!(renderer.backend().draws.is_empty());
        assert_eq!(renderer.scene().child_count(), before);
    }

    #[test]
    fn test_pending_model_still_posed() {
        let (loader, tx) = ModelLoader::never();
        let mut renderer = EffectRenderer::new(RecordingBackend::default(), loader);

        renderer.render(result(&[pose(2.)]), Surface::new(640, 480)).unwrap();
        let group = renderer.face_group().unwrap();
        assert!(matches!(group.model, ModelState::Pending));
        assert!(group.visible);

        tx.send(Ok(TriMesh::default())).unwrap();
        renderer.render(result(&[pose(3.)]), Surface::new(640, 480)).unwrap();
        let group = renderer.face_group().unwrap();
        assert!(matches!(group.model, ModelState::Ready(_)));
        assert_eq!(group.matrix, Matrix4::from_column_slice(&pose(3.)));
    }

    #[test]
    fn test_failed_model_leaves_group_empty() {
        let loader = ModelLoader::resolved(Err(Error::msg("bad obj")));
        let mut renderer = EffectRenderer::new(RecordingBackend::default(), loader);

        renderer.render(result(&[pose(0.)]), Surface::new(640, 480)).unwrap();
        let group = renderer.face_group().unwrap();
        assert!(matches!(group.model, ModelState::Failed));
        assert!(group.visible);
    }

    #[test]
    fn test_scene_setup() {
        let (renderer, _loader) = renderer();
        let scene = renderer.scene();
        assert_eq!(scene.background, rgb(0xa9a9a9));

        let hemi = scene.hemisphere_light().unwrap();
        assert_eq!(hemi.ground, rgb(0x444444));
        assert_eq!(hemi.position, Vector3::new(0., 100., 0.));
        let dir = scene.directional_light().unwrap();
        assert_eq!(dir.position, Vector3::new(-30., 100., -5.));
    }
}
