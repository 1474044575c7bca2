use super::camera::PerspectiveCamera;
use crate::assets::TriMesh;
use crate::solution::PoseTransform;
use anyhow::Result;
use image::RgbaImage;
use nalgebra::{Matrix4, Vector3};
use std::sync::Arc;
use tracing::{error, info};

pub fn rgb(hex: u32) -> [f32; 3] {
    [
        ((hex >> 16) & 0xff) as f32 / 255.,
        ((hex >> 8) & 0xff) as f32 / 255.,
        (hex & 0xff) as f32 / 255.,
    ]
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HemisphereLight {
    pub sky: [f32; 3],
    pub ground: [f32; 3],
    pub position: Vector3<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DirectionalLight {
    pub color: [f32; 3],
    /// Shines from here toward the origin.
    pub position: Vector3<f32>,
}

#[derive(Debug, Clone)]
pub enum ModelState {
    Pending,
    Ready(Arc<TriMesh>),
    Failed,
}

/// Holds the head model. Its matrix is replaced wholesale every frame.
#[derive(Debug, Clone)]
pub struct FaceGroup {
    pub matrix: Matrix4<f32>,
    pub visible: bool,
    pub model: ModelState,
}

impl Default for FaceGroup {
    fn default() -> Self {
        Self {
            matrix: Matrix4::identity(),
            visible: false,
            model: ModelState::Pending,
        }
    }
}

impl FaceGroup {
    pub fn set_pose(&mut self, pose: &PoseTransform) {
        self.matrix = pose.to_matrix();
        self.visible = true;
    }

    pub fn hide(&mut self) {
        self.visible = false;
    }

    /// Applies a finished model load. Only a pending group changes state.
    pub fn apply_load(&mut self, loaded: Result<TriMesh>) {
        if !matches!(self.model, ModelState::Pending) {
            return;
        }
        self.model = match loaded {
            Ok(mesh) => {
                info!("Head model ready ({} triangles)", mesh.triangle_count());
                ModelState::Ready(Arc::new(mesh))
            }
            Err(e) => {
                error!("Failed to load head model: {e:?}");
                ModelState::Failed
            }
        };
    }

    pub fn mesh(&self) -> Option<&Arc<TriMesh>> {
        match &self.model {
            ModelState::Ready(mesh) => Some(mesh),
            _ => None,
        }
    }
}

/// Camera-facing quad showing the current frame.
#[derive(Debug, Clone)]
pub struct ImagePlane {
    pub width: f32,
    pub height: f32,
    pub depth: f32,
    pub texture: RgbaImage,
}

impl ImagePlane {
    /// Plane at `depth` sized to exactly fill the camera's view.
    pub fn filling_view(camera: &PerspectiveCamera, depth: f32, texture: RgbaImage) -> Self {
        Self {
            width: camera.visible_width_at(depth),
            height: camera.visible_height_at(depth),
            depth,
            texture,
        }
    }

    pub fn model_matrix(&self) -> Matrix4<f32> {
        Matrix4::new_translation(&Vector3::new(0., 0., -self.depth))
            * Matrix4::new_nonuniform_scaling(&Vector3::new(self.width, self.height, 1.))
    }
}

#[derive(Debug, Clone)]
pub enum Node {
    Hemisphere(HemisphereLight),
    Directional(DirectionalLight),
    Group(FaceGroup),
    Plane(ImagePlane),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeId(u64);

#[derive(Debug, Clone)]
pub struct Scene {
    pub background: [f32; 3],
    children: Vec<(NodeId, Node)>,
    next_id: u64,
}

impl Scene {
    pub fn new(background: [f32; 3]) -> Self {
        Self {
            background,
            children: Vec::new(),
            next_id: 0,
        }
    }

    pub fn add(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        self.children.push((id, node));
        id
    }

    pub fn remove(&mut self, id: NodeId) -> Option<Node> {
        let idx = self.children.iter().position(|(i, _)| *i == id)?;
        Some(self.children.remove(idx).1)
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.children.iter().find(|(i, _)| *i == id).map(|(_, n)| n)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.children
            .iter_mut()
            .find(|(i, _)| *i == id)
            .map(|(_, n)| n)
    }

    pub fn children(&self) -> impl Iterator<Item = &Node> {
        self.children.iter().map(|(_, n)| n)
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    #[cfg(test)]
    pub fn plane_count(&self) -> usize {
        self.children()
            .filter(|n| matches!(n, Node::Plane(_)))
            .count()
    }

    pub fn hemisphere_light(&self) -> Option<&HemisphereLight> {
        self.children().find_map(|n| match n {
            Node::Hemisphere(l) => Some(l),
            _ => None,
        })
    }

    pub fn directional_light(&self) -> Option<&DirectionalLight> {
        self.children().find_map(|n| match n {
            Node::Directional(l) => Some(l),
            _ => None,
        })
    }
}
