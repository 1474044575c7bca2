use super::camera::PerspectiveCamera;
use super::gpu::GpuExecutor;
use super::scene::{FaceGroup, ImagePlane, Node, Scene, rgb};
use super::vertex::{MeshVertex, PlaneVertex};
use super::RenderBackend;
use crate::assets::TriMesh;
use anyhow::{Result, bail};
use image::RgbaImage;
use nalgebra::Matrix4;
use std::sync::Arc;
use tracing::{Level, debug, span};
use wgpu::util::DeviceExt;

const COLOR_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;
const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;
const MODEL_COLOR: u32 = 0xe0e0e0;

#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct PlaneUniforms {
    mvp: [[f32; 4]; 4],
}

#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct MeshUniforms {
    mvp: [[f32; 4]; 4],
    model: [[f32; 4]; 4],
    sky: [f32; 4],
    ground: [f32; 4],
    hemi_dir: [f32; 4],
    dir_color: [f32; 4],
    dir_direction: [f32; 4],
    base_color: [f32; 4],
}

fn vec4(v: [f32; 3]) -> [f32; 4] {
    [v[0], v[1], v[2], 0.]
}

impl MeshUniforms {
    fn new(scene: &Scene, proj: &Matrix4<f32>, group: &FaceGroup) -> Self {
        let (sky, ground, hemi_dir): ([f32; 3], [f32; 3], [f32; 3]) = match scene.hemisphere_light() {
            Some(l) => (l.sky, l.ground, l.position.normalize().into()),
            None => ([0.; 3], [0.; 3], [0., 1., 0.]),
        };
        let (dir_color, dir_direction): ([f32; 3], [f32; 3]) = match scene.directional_light() {
            Some(l) => (l.color, l.position.normalize().into()),
            None => ([0.; 3], [0., 1., 0.]),
        };

        Self {
            mvp: (proj * group.matrix).into(),
            model: group.matrix.into(),
            sky: vec4(sky),
            ground: vec4(ground),
            hemi_dir: vec4(hemi_dir),
            dir_color: vec4(dir_color),
            dir_direction: vec4(dir_direction),
            base_color: vec4(rgb(MODEL_COLOR)),
        }
    }
}

struct Targets {
    color: wgpu::Texture,
    depth: wgpu::Texture,
}

struct VideoTexture {
    texture: wgpu::Texture,
    bind_group: wgpu::BindGroup,
}

struct UploadedMesh {
    source: Arc<TriMesh>,
    buffer: wgpu::Buffer,
    vertex_count: u32,
}

/// Draws a [`Scene`] off-screen with wgpu. The finished frame is fetched
/// with [`WgpuBackend::read_frame`].
pub struct WgpuBackend {
    gpu: GpuExecutor,
    width: u32,
    height: u32,
    targets: Targets,
    plane_pipeline: wgpu::RenderPipeline,
    mesh_pipeline: wgpu::RenderPipeline,
    plane_uniforms: wgpu::Buffer,
    mesh_uniforms: wgpu::Buffer,
    mesh_bind_group: wgpu::BindGroup,
    quad: wgpu::Buffer,
    sampler: wgpu::Sampler,
    video: Option<VideoTexture>,
    mesh: Option<UploadedMesh>,
}

impl WgpuBackend {
    pub fn new(width: u32, height: u32) -> Result<Self> {
        let span = span!(Level::INFO, "WgpuBackend#new");
        let _guard = span.enter();

        if width == 0 || height == 0 {
            bail!("Cannot create a {width}x{height} render target");
        }

        let mut gpu = GpuExecutor::new()?;
        let targets = create_targets(&gpu, width, height);

        let plane_shader = gpu.load_shader("plane", wgpu::include_wgsl!("plane.wgsl"));
        let mesh_shader = gpu.load_shader("mesh", wgpu::include_wgsl!("mesh.wgsl"));

        let plane_pipeline = create_pipeline(
            &gpu,
            "plane_pipeline",
            &plane_shader,
            PlaneVertex::desc(),
            wgpu::DepthStencilState {
                format: DEPTH_FORMAT,
                // backdrop never occludes the model
                depth_write_enabled: false,
                depth_compare: wgpu::CompareFunction::Always,
                stencil: Default::default(),
                bias: Default::default(),
            },
        );
        let mesh_pipeline = create_pipeline(
            &gpu,
            "mesh_pipeline",
            &mesh_shader,
            MeshVertex::desc(),
            wgpu::DepthStencilState {
                format: DEPTH_FORMAT,
                depth_write_enabled: true,
                depth_compare: wgpu::CompareFunction::Less,
                stencil: Default::default(),
                bias: Default::default(),
            },
        );

        let plane_uniforms = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("plane_uniforms"),
            size: std::mem::size_of::<PlaneUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mesh_uniforms = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("mesh_uniforms"),
            size: std::mem::size_of::<MeshUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mesh_bind_group = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("mesh_bind_group"),
            layout: &mesh_pipeline.get_bind_group_layout(0),
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: mesh_uniforms.as_entire_binding(),
            }],
        });

        let quad = gpu
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("plane_vertices"),
                contents: bytemuck::cast_slice(&PlaneVertex::unit_quad()),
                usage: wgpu::BufferUsages::VERTEX,
            });

        let sampler = gpu.device.create_sampler(&wgpu::SamplerDescriptor {
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });

        Ok(Self {
            gpu,
            width,
            height,
            targets,
            plane_pipeline,
            mesh_pipeline,
            plane_uniforms,
            mesh_uniforms,
            mesh_bind_group,
            quad,
            sampler,
            video: None,
            mesh: None,
        })
    }

    /// Reads back the most recently drawn frame.
    pub fn read_frame(&self) -> Result<RgbaImage> {
        self.gpu.read_texture(&self.targets.color)
    }

    fn upload_video(&mut self, plane: &ImagePlane) {
        let (width, height) = plane.texture.dimensions();
        let reusable = self
            .video
            .as_ref()
            .is_some_and(|v| v.texture.width() == width && v.texture.height() == height);

        if reusable {
            if let Some(video) = &self.video {
                self.gpu
                    .write_texture(&video.texture, plane.texture.as_raw(), width, height);
            }
        } else {
            debug!("Allocating {width}x{height} video texture");
            let texture = self
                .gpu
                .rgba_buffer_to_texture(plane.texture.as_raw(), width, height);
            let bind_group = self.gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("plane_bind_group"),
                layout: &self.plane_pipeline.get_bind_group_layout(0),
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: self.plane_uniforms.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::TextureView(
                            &texture.create_view(&Default::default()),
                        ),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: wgpu::BindingResource::Sampler(&self.sampler),
                    },
                ],
            });
            self.video = Some(VideoTexture {
                texture,
                bind_group,
            });
        }
    }

    /// Returns the number of vertices to draw.
    fn upload_mesh(&mut self, mesh: &Arc<TriMesh>) -> u32 {
        let cached = self
            .mesh
            .as_ref()
            .is_some_and(|m| Arc::ptr_eq(&m.source, mesh));

        if !cached {
            debug!("Uploading head model ({} triangles)", mesh.triangle_count());
            let vertices = MeshVertex::from_mesh(mesh);
            let buffer = self
                .gpu
                .device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("mesh_vertices"),
                    contents: bytemuck::cast_slice(&vertices),
                    usage: wgpu::BufferUsages::VERTEX,
                });
            self.mesh = Some(UploadedMesh {
                source: mesh.clone(),
                buffer,
                vertex_count: vertices.len() as u32,
            });
        }

        self.mesh.as_ref().map_or(0, |m| m.vertex_count)
    }
}

impl RenderBackend for WgpuBackend {
    fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            bail!("Cannot resize render target to {width}x{height}");
        }
        if (width, height) != (self.width, self.height) {
            debug!("Resizing render target to {width}x{height}");
            self.targets = create_targets(&self.gpu, width, height);
            self.width = width;
            self.height = height;
        }
        Ok(())
    }

    fn draw(&mut self, scene: &Scene, camera: &PerspectiveCamera) -> Result<()> {
        let span = span!(Level::DEBUG, "WgpuBackend#draw");
        let _guard = span.enter();

        let proj = camera.projection_matrix();

        let plane = scene.children().find_map(|n| match n {
            Node::Plane(p) => Some(p),
            _ => None,
        });
        let group = scene.children().find_map(|n| match n {
            Node::Group(g) if g.visible => Some(g),
            _ => None,
        });

        let has_plane = match plane {
            Some(plane) => {
                let uniforms = PlaneUniforms {
                    mvp: (proj * plane.model_matrix()).into(),
                };
                self.gpu
                    .queue
                    .write_buffer(&self.plane_uniforms, 0, bytemuck::bytes_of(&uniforms));
                self.upload_video(plane);
                true
            }
            None => false,
        };

        let mesh = match group.and_then(|g| g.mesh().map(|m| (g, m))) {
            Some((group, mesh)) => {
                let uniforms = MeshUniforms::new(scene, &proj, group);
                self.gpu
                    .queue
                    .write_buffer(&self.mesh_uniforms, 0, bytemuck::bytes_of(&uniforms));
                Some(self.upload_mesh(mesh))
            }
            None => None,
        };

        let mut encoder = self
            .gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("draw_encoder"),
            });

        let [r, g, b] = scene.background;
        let color_view = self.targets.color.create_view(&Default::default());
        let depth_view = self.targets.depth.create_view(&Default::default());
        let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("scene_pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &color_view,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color {
                        r: r as f64,
                        g: g as f64,
                        b: b as f64,
                        a: 1.,
                    }),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                view: &depth_view,
                depth_ops: Some(wgpu::Operations {
                    load: wgpu::LoadOp::Clear(1.),
                    store: wgpu::StoreOp::Store,
                }),
                stencil_ops: None,
            }),
            ..Default::default()
        });

        if let (true, Some(video)) = (has_plane, &self.video) {
            render_pass.set_pipeline(&self.plane_pipeline);
            render_pass.set_bind_group(0, &video.bind_group, &[]);
            render_pass.set_vertex_buffer(0, self.quad.slice(..));
            render_pass.draw(0..6, 0..1);
        }

        if let (Some(vertex_count), Some(uploaded)) = (mesh, &self.mesh) {
            render_pass.set_pipeline(&self.mesh_pipeline);
            render_pass.set_bind_group(0, &self.mesh_bind_group, &[]);
            render_pass.set_vertex_buffer(0, uploaded.buffer.slice(..));
            render_pass.draw(0..vertex_count, 0..1);
        }
        drop(render_pass);

        self.gpu.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }
}

fn create_targets(gpu: &GpuExecutor, width: u32, height: u32) -> Targets {
    let size = wgpu::Extent3d {
        width,
        height,
        depth_or_array_layers: 1,
    };
    let color = gpu.device.create_texture(&wgpu::TextureDescriptor {
        label: Some("color_target"),
        size,
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: COLOR_FORMAT,
        view_formats: &[COLOR_FORMAT],
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
    });
    let depth = gpu.device.create_texture(&wgpu::TextureDescriptor {
        label: Some("depth_target"),
        size,
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: DEPTH_FORMAT,
        view_formats: &[DEPTH_FORMAT],
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
    });
    Targets { color, depth }
}

fn create_pipeline(
    gpu: &GpuExecutor,
    label: &str,
    shader: &wgpu::ShaderModule,
    vertex_layout: wgpu::VertexBufferLayout<'static>,
    depth_stencil: wgpu::DepthStencilState,
) -> wgpu::RenderPipeline {
    gpu.device
        .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some(label),
            layout: None,
            vertex: wgpu::VertexState {
                module: shader,
                entry_point: Some("vert_main"),
                compilation_options: Default::default(),
                buffers: &[vertex_layout],
            },
            primitive: wgpu::PrimitiveState {
                cull_mode: None,
                ..Default::default()
            },
            fragment: Some(wgpu::FragmentState {
                module: shader,
                entry_point: Some("frag_main"),
                compilation_options: Default::default(),
                targets: &[Some(wgpu::ColorTargetState {
                    format: COLOR_FORMAT,
                    blend: Some(wgpu::BlendState::REPLACE),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
            }),
            depth_stencil: Some(depth_stencil),
            multisample: Default::default(),
            multiview: None,
            cache: None,
        })
}
