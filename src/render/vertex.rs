use crate::assets::TriMesh;

#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable, PartialEq)]
pub struct PlaneVertex {
    pub position: [f32; 3],
    pub tex_coord: [f32; 2],
}

impl PlaneVertex {
    const ATTRIBS: [wgpu::VertexAttribute; 2] =
        wgpu::vertex_attr_array![0 => Float32x3, 1 => Float32x2];

    pub fn desc() -> wgpu::VertexBufferLayout<'static> {
        use std::mem;

        wgpu::VertexBufferLayout {
            array_stride: mem::size_of::<Self>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &Self::ATTRIBS,
        }
    }

    pub fn new(position: [f32; 2], tex_coord: [f32; 2]) -> Self {
        Self {
            position: [position[0], position[1], 0.],
            tex_coord,
        }
    }

    /// Unit quad in the XY plane centered on the origin, facing +Z.
    /// Texture row 0 maps to the top edge.
    pub fn unit_quad() -> Vec<Self> {
        let tl = Self::new([-0.5, 0.5], [0., 0.]);
        let tr = Self::new([0.5, 0.5], [1., 0.]);
        let bl = Self::new([-0.5, -0.5], [0., 1.]);
        let br = Self::new([0.5, -0.5], [1., 1.]);
        vec![tl, bl, br, tl, br, tr]
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable, PartialEq)]
pub struct MeshVertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
}

impl MeshVertex {
    const ATTRIBS: [wgpu::VertexAttribute; 2] =
        wgpu::vertex_attr_array![0 => Float32x3, 1 => Float32x3];

    pub fn desc() -> wgpu::VertexBufferLayout<'static> {
        use std::mem;

        wgpu::VertexBufferLayout {
            array_stride: mem::size_of::<Self>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &Self::ATTRIBS,
        }
    }

    pub fn from_mesh(mesh: &TriMesh) -> Vec<Self> {
        mesh.corners
            .iter()
            .map(|c| Self {
                position: c.position,
                normal: c.normal,
            })
            .collect()
    }
}
