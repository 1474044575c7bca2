use anyhow::{Context, Result};
use nalgebra::Vector3;
use obj::{Obj, ObjData};
use std::io::Read;
use std::path::Path;
use tracing::{Level, debug, span};

/// Triangle soup read from a Wavefront OBJ file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TriMesh {
    /// Raw `v` records in file order.
    pub positions: Vec<[f32; 3]>,
    /// Three corners per triangle.
    pub corners: Vec<Corner>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Corner {
    pub position: [f32; 3],
    pub normal: [f32; 3],
}

impl TriMesh {
    pub fn triangle_count(&self) -> usize {
        self.corners.len() / 3
    }
}

pub fn load_obj(path: &Path) -> Result<TriMesh> {
    let span = span!(Level::DEBUG, "load_obj");
    let _guard = span.enter();

    let obj = Obj::load(path).with_context(|| format!("Failed to read OBJ file {path:?}"))?;
    let mesh = from_obj_data(&obj.data).with_context(|| format!("Invalid OBJ file {path:?}"))?;
    debug!(
        "Loaded {path:?}: {} vertices, {} triangles",
        mesh.positions.len(),
        mesh.triangle_count()
    );
    Ok(mesh)
}

pub fn parse_obj(input: impl Read) -> Result<TriMesh> {
    let data = ObjData::load_buf(input).context("Failed to parse OBJ data")?;
    from_obj_data(&data)
}

fn from_obj_data(data: &ObjData) -> Result<TriMesh> {
    let mut corners = Vec::new();

    for poly in data
        .objects
        .iter()
        .flat_map(|o| o.groups.iter())
        .flat_map(|g| g.polys.iter())
    {
        let tuples = &poly.0;
        if tuples.len() < 3 {
            continue;
        }

        let position = |i: usize| -> Result<[f32; 3]> {
            let idx = tuples[i].0;
            data.position
                .get(idx)
                .copied()
                .with_context(|| format!("Face references missing vertex {}", idx + 1))
        };
        // Faces without normals get a flat one.
        let flat = face_normal(position(0)?, position(1)?, position(2)?);
        let corner = |i: usize| -> Result<Corner> {
            let normal = match tuples[i].2 {
                Some(n) => *data
                    .normal
                    .get(n)
                    .with_context(|| format!("Face references missing normal {}", n + 1))?,
                None => flat,
            };
            Ok(Corner {
                position: position(i)?,
                normal,
            })
        };

        // Fan triangulation; OBJ polygons are convex.
        for i in 1..tuples.len() - 1 {
            corners.push(corner(0)?);
            corners.push(corner(i)?);
            corners.push(corner(i + 1)?);
        }
    }

    Ok(TriMesh {
        positions: data.position.clone(),
        corners,
    })
}

fn face_normal(a: [f32; 3], b: [f32; 3], c: [f32; 3]) -> [f32; 3] {
    let a = Vector3::from(a);
    let n = (Vector3::from(b) - a).cross(&(Vector3::from(c) - a));
    n.try_normalize(f32::EPSILON)
        .unwrap_or_else(Vector3::z)
        .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUAD: &str = "\
v 0 0 0
v 1 0 0
v 1 1 0
v 0 1 0
f 1 2 3 4
";

    #[test]
    fn test_quad_is_fanned() {
        let mesh = parse_obj(QUAD.as_bytes()).unwrap();
        assert_eq!(mesh.positions.len(), 4);
        assert_eq!(mesh.triangle_count(), 2);
        assert_eq!(mesh.corners[3].position, [0., 0., 0.]);
        assert_eq!(mesh.corners[5].position, [0., 1., 0.]);
        assert_eq!(mesh.corners[0].normal, [0., 0., 1.]);
    }

    #[test]
    fn test_file_normals_win() {
        let src = "v 0 0 0\nv 1 0 0\nv 0 1 0\nvn 0 1 0\nf 1//1 2//1 3//1\n";
        let mesh = parse_obj(src.as_bytes()).unwrap();
        assert_eq!(mesh.triangle_count(), 1);
        assert!(mesh.corners.iter().all(|c| c.normal == [0., 1., 0.]));
    }

    #[test]
    fn test_points_only() {
        let mesh = parse_obj("v 1 2 3\nv 4 5 6\n".as_bytes()).unwrap();
        assert_eq!(mesh.positions, vec![[1., 2., 3.], [4., 5., 6.]]);
        assert_eq!(mesh.triangle_count(), 0);
    }

    #[test]
    fn test_out_of_range_vertex() {
        let err = parse_obj("v 0 0 0\nv 1 0 0\nf 1 2 9\n".as_bytes()).unwrap_err();
        assert!(err.to_string().contains("missing vertex 9"));
    }

    #[test]
    fn test_out_of_range_normal() {
        let src = "v 0 0 0\nv 1 0 0\nv 0 1 0\nvn 0 0 1\nf 1//1 2//1 3//4\n";
        assert!(parse_obj(src.as_bytes()).is_err());
    }
}
