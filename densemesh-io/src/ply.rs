//! PLY format support

use crate::{MeshReader, MeshWriter, PointCloudReader, PointCloudWriter};
use densemesh_core::{Color, Error, Point3d, PointCloud, Result, TriangleMesh, Vector3d};
use ply_rs::{
    parser::Parser,
    ply::{
        Addable, DefaultElement, ElementDef, Encoding, Ply, Property, PropertyDef, PropertyType,
        ScalarType,
    },
    writer::Writer,
};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use tracing::{debug, info};

pub struct PlyReader;
pub struct PlyWriter;

/// Vertex element data shared by clouds and meshes
struct VertexData {
    points: Vec<Point3d>,
    normals: Option<Vec<Vector3d>>,
    colors: Option<Vec<Color>>,
}

fn read_ply_file(path: &Path) -> Result<Ply<DefaultElement>> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let parser = Parser::<DefaultElement>::new();
    let ply = parser.read_ply(&mut reader)?;
    debug!(
        "Parsed PLY {} ({:?}) with elements [{}]",
        path.display(),
        ply.header.encoding,
        ply.header.elements.keys().cloned().collect::<Vec<_>>().join(", ")
    );
    Ok(ply)
}

fn read_vertices(ply: &Ply<DefaultElement>) -> Result<VertexData> {
    let empty = Vec::new();
    let vertices = ply.payload.get("vertex").unwrap_or(&empty);

    let points = vertices
        .iter()
        .map(|v| {
            Ok(Point3d::new(
                extract_property_value(v, "x")?,
                extract_property_value(v, "y")?,
                extract_property_value(v, "z")?,
            ))
        })
        .collect::<Result<Vec<_>>>()?;

    // Optional attributes must be present on every vertex to be used
    let normals = vertices
        .iter()
        .map(|v| {
            Some(Vector3d::new(
                extract_property_value(v, "nx").ok()?,
                extract_property_value(v, "ny").ok()?,
                extract_property_value(v, "nz").ok()?,
            ))
        })
        .collect::<Option<Vec<_>>>()
        .filter(|n| !n.is_empty());

    let colors = vertices
        .iter()
        .map(|v| {
            Some(Color::new(
                extract_color_channel(v, "red")?,
                extract_color_channel(v, "green")?,
                extract_color_channel(v, "blue")?,
            ))
        })
        .collect::<Option<Vec<_>>>()
        .filter(|c| !c.is_empty());

    Ok(VertexData {
        points,
        normals,
        colors,
    })
}

fn double_property(name: &str) -> PropertyDef {
    PropertyDef::new(name.to_string(), PropertyType::Scalar(ScalarType::Double))
}

fn uchar_property(name: &str) -> PropertyDef {
    PropertyDef::new(name.to_string(), PropertyType::Scalar(ScalarType::UChar))
}

/// Vertex element definition and payload for positions, normals and colors
fn vertex_element(
    points: &[Point3d],
    normals: Option<&[Vector3d]>,
    colors: Option<&[Color]>,
) -> (ElementDef, Vec<DefaultElement>) {
    let mut def = ElementDef::new("vertex".to_string());
    def.count = points.len();
    for name in ["x", "y", "z"] {
        def.properties.add(double_property(name));
    }
    if normals.is_some() {
        for name in ["nx", "ny", "nz"] {
            def.properties.add(double_property(name));
        }
    }
    if colors.is_some() {
        for name in ["red", "green", "blue"] {
            def.properties.add(uchar_property(name));
        }
    }

    let payload = points
        .iter()
        .enumerate()
        .map(|(i, p)| {
            let mut vertex = DefaultElement::new();
            vertex.insert("x".to_string(), Property::Double(p.x));
            vertex.insert("y".to_string(), Property::Double(p.y));
            vertex.insert("z".to_string(), Property::Double(p.z));
            if let Some(normals) = normals {
                vertex.insert("nx".to_string(), Property::Double(normals[i].x));
                vertex.insert("ny".to_string(), Property::Double(normals[i].y));
                vertex.insert("nz".to_string(), Property::Double(normals[i].z));
            }
            if let Some(colors) = colors {
                let c = colors[i];
                vertex.insert("red".to_string(), Property::UChar(color_to_byte(c.x)));
                vertex.insert("green".to_string(), Property::UChar(color_to_byte(c.y)));
                vertex.insert("blue".to_string(), Property::UChar(color_to_byte(c.z)));
            }
            vertex
        })
        .collect();

    (def, payload)
}

fn write_ply_file(path: &Path, ply: &mut Ply<DefaultElement>) -> Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    let written = Writer::new().write_ply(&mut writer, ply)?;
    writer.flush()?;
    debug!("Wrote {} bytes to {}", written, path.display());
    Ok(())
}

fn new_binary_ply() -> Ply<DefaultElement> {
    let mut ply = Ply::<DefaultElement>::new();
    ply.header.encoding = Encoding::BinaryLittleEndian;
    ply.header.comments.push("densemesh".to_string());
    ply
}

impl PointCloudReader for PlyReader {
    fn read_point_cloud<P: AsRef<Path>>(path: P) -> Result<PointCloud> {
        let path = path.as_ref();
        let ply = read_ply_file(path)?;
        let VertexData {
            points,
            normals,
            colors,
        } = read_vertices(&ply)?;

        let mut cloud = PointCloud::from_points(points);
        if let Some(normals) = normals {
            cloud.set_normals(normals)?;
        }
        if let Some(colors) = colors {
            cloud.set_colors(colors)?;
        }
        info!(
            "Read {} points from {} (normals: {}, colors: {})",
            cloud.len(),
            path.display(),
            cloud.has_normals(),
            cloud.has_colors()
        );
        Ok(cloud)
    }
}

impl PointCloudWriter for PlyWriter {
    fn write_point_cloud<P: AsRef<Path>>(cloud: &PointCloud, path: P) -> Result<()> {
        let path = path.as_ref();
        cloud.validate()?;
        let mut ply = new_binary_ply();
        let (def, payload) = vertex_element(
            &cloud.points,
            cloud.normals.as_deref(),
            cloud.colors.as_deref(),
        );
        ply.header.elements.add(def);
        ply.payload.insert("vertex".to_string(), payload);

        write_ply_file(path, &mut ply)?;
        info!("Wrote {} points to {}", cloud.len(), path.display());
        Ok(())
    }
}

impl MeshReader for PlyReader {
    fn read_mesh<P: AsRef<Path>>(path: P) -> Result<TriangleMesh> {
        let path = path.as_ref();
        let ply = read_ply_file(path)?;
        let VertexData {
            points, normals, ..
        } = read_vertices(&ply)?;

        // Polygons are fanned into triangles
        let mut faces = Vec::new();
        if let Some(face_element) = ply.payload.get("face") {
            for face in face_element {
                let indices = extract_face_indices(face)?;
                for k in 1..indices.len().saturating_sub(1) {
                    faces.push([indices[0], indices[k], indices[k + 1]]);
                }
            }
        }

        let mut mesh = TriangleMesh::from_vertices_and_faces(points, faces);
        mesh.normals = normals;
        mesh.validate()?;
        info!(
            "Read mesh with {} vertices and {} faces from {}",
            mesh.vertex_count(),
            mesh.face_count(),
            path.display()
        );
        Ok(mesh)
    }
}

impl MeshWriter for PlyWriter {
    fn write_mesh<P: AsRef<Path>>(mesh: &TriangleMesh, path: P) -> Result<()> {
        let path = path.as_ref();
        mesh.validate()?;
        let mut ply = new_binary_ply();

        let (vertex_def, vertices) = vertex_element(&mesh.vertices, mesh.normals.as_deref(), None);
        ply.header.elements.add(vertex_def);
        ply.payload.insert("vertex".to_string(), vertices);

        let mut face_def = ElementDef::new("face".to_string());
        face_def.count = mesh.faces.len();
        face_def.properties.add(PropertyDef::new(
            "vertex_indices".to_string(),
            PropertyType::List(ScalarType::UChar, ScalarType::UInt),
        ));
        ply.header.elements.add(face_def);

        let faces = mesh
            .faces
            .iter()
            .map(|face| {
                let indices = face
                    .iter()
                    .map(|&i| {
                        u32::try_from(i).map_err(|_| {
                            Error::InvalidData(format!("vertex index {} does not fit PLY", i))
                        })
                    })
                    .collect::<Result<Vec<u32>>>()?;
                let mut element = DefaultElement::new();
                element.insert("vertex_indices".to_string(), Property::ListUInt(indices));
                Ok(element)
            })
            .collect::<Result<Vec<_>>>()?;
        ply.payload.insert("face".to_string(), faces);

        write_ply_file(path, &mut ply)?;
        info!(
            "Wrote mesh with {} vertices and {} faces to {}",
            mesh.vertex_count(),
            mesh.face_count(),
            path.display()
        );
        Ok(())
    }
}

fn color_to_byte(value: f64) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Extract a property value as f64 from a PLY element
fn extract_property_value(element: &DefaultElement, name: &str) -> Result<f64> {
    match element.get(name) {
        Some(Property::Float(val)) => Ok(*val as f64),
        Some(Property::Double(val)) => Ok(*val),
        Some(Property::Char(val)) => Ok(*val as f64),
        Some(Property::UChar(val)) => Ok(*val as f64),
        Some(Property::Short(val)) => Ok(*val as f64),
        Some(Property::UShort(val)) => Ok(*val as f64),
        Some(Property::Int(val)) => Ok(*val as f64),
        Some(Property::UInt(val)) => Ok(*val as f64),
        _ => Err(Error::InvalidData(format!(
            "Property '{}' not found or invalid type",
            name
        ))),
    }
}

/// Extract a color channel in `[0, 1]`; integer channels are scaled by
/// their type's maximum
fn extract_color_channel(element: &DefaultElement, name: &str) -> Option<f64> {
    match element.get(name)? {
        Property::UChar(val) => Some(*val as f64 / u8::MAX as f64),
        Property::UShort(val) => Some(*val as f64 / u16::MAX as f64),
        Property::Float(val) => Some(*val as f64),
        Property::Double(val) => Some(*val),
        _ => None,
    }
}

/// Extract face indices from a PLY face element
fn extract_face_indices(element: &DefaultElement) -> Result<Vec<usize>> {
    let negative = || Error::InvalidData("negative face index".to_string());
    match element
        .get("vertex_indices")
        .or_else(|| element.get("vertex_index"))
    {
        Some(Property::ListInt(indices)) => indices
            .iter()
            .map(|&idx| usize::try_from(idx).map_err(|_| negative()))
            .collect(),
        Some(Property::ListUInt(indices)) => Ok(indices.iter().map(|&idx| idx as usize).collect()),
        Some(Property::ListUShort(indices)) => Ok(indices.iter().map(|&idx| idx as usize).collect()),
        Some(Property::ListUChar(indices)) => Ok(indices.iter().map(|&idx| idx as usize).collect()),
        _ => Err(Error::InvalidData("Face indices not found".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const ASCII_SQUARE: &str = "ply
format ascii 1.0
comment hand written
element vertex 4
property float x
property float y
property float z
property float nx
property float ny
property float nz
property uchar red
property uchar green
property uchar blue
element face 1
property list uchar int vertex_indices
end_header
0.0 0.0 0.0 0.0 0.0 1.0 255 0 0
1.0 0.0 0.0 0.0 0.0 1.0 0 255 0
1.0 1.0 0.0 0.0 0.0 1.0 0 0 255
0.0 1.0 0.0 0.0 0.0 1.0 255 255 255
4 0 1 2 3
";

    #[test]
    fn test_ascii_point_cloud_with_attributes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("square.ply");
        std::fs::write(&path, ASCII_SQUARE).unwrap();

        let cloud = PlyReader::read_point_cloud(&path).unwrap();
        assert_eq!(cloud.len(), 4);
        assert_eq!(cloud.points[2], Point3d::new(1.0, 1.0, 0.0));
        assert_eq!(cloud.normals.as_ref().unwrap()[0], Vector3d::z());
        let colors = cloud.colors.as_ref().unwrap();
        assert_relative_eq!(colors[0], Color::new(1.0, 0.0, 0.0));
        assert_relative_eq!(colors[3], Color::new(1.0, 1.0, 1.0));
    }

    #[test]
    fn test_ascii_mesh_polygon_is_fanned() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("square.ply");
        std::fs::write(&path, ASCII_SQUARE).unwrap();

        let mesh = PlyReader::read_mesh(&path).unwrap();
        assert_eq!(mesh.vertex_count(), 4);
        assert_eq!(mesh.faces, vec![[0, 1, 2], [0, 2, 3]]);
        assert!(mesh.normals.is_some());
    }

    #[test]
    fn test_point_cloud_without_normals() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bare.ply");
        std::fs::write(
            &path,
            "ply\nformat ascii 1.0\nelement vertex 2\nproperty double x\nproperty double y\nproperty double z\nend_header\n1 2 3\n4 5 6\n",
        )
        .unwrap();

        let cloud = PlyReader::read_point_cloud(&path).unwrap();
        assert_eq!(cloud.points, vec![Point3d::new(1.0, 2.0, 3.0), Point3d::new(4.0, 5.0, 6.0)]);
        assert!(!cloud.has_normals());
        assert!(!cloud.has_colors());
    }

    #[test]
    fn test_binary_point_cloud_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cloud.ply");
        let cloud = PointCloud::from_points(vec![
            Point3d::new(0.125, -3.5, 1e-3),
            Point3d::new(10.0, 20.0, 30.0),
        ])
        .with_normals(vec![Vector3d::x(), Vector3d::y()])
        .unwrap()
        .with_colors(vec![Color::new(1.0, 0.0, 0.0), Color::new(0.0, 0.0, 1.0)])
        .unwrap();

        PlyWriter::write_point_cloud(&cloud, &path).unwrap();
        let loaded = PlyReader::read_point_cloud(&path).unwrap();
        assert_eq!(loaded, cloud);

        let ply = read_ply_file(&path).unwrap();
        assert_eq!(ply.header.encoding, Encoding::BinaryLittleEndian);
    }

    #[test]
    fn test_mesh_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mesh.ply");
        let mut mesh = TriangleMesh::from_vertices_and_faces(
            vec![
                Point3d::new(0.0, 0.0, 0.0),
                Point3d::new(1.0, 0.0, 0.0),
                Point3d::new(0.5, 1.0, 0.0),
            ],
            vec![[0, 1, 2]],
        );
        mesh.compute_normals();

        PlyWriter::write_mesh(&mesh, &path).unwrap();
        let loaded = PlyReader::read_mesh(&path).unwrap();
        assert_eq!(loaded.vertices, mesh.vertices);
        assert_eq!(loaded.faces, mesh.faces);
        assert_eq!(loaded.normals, mesh.normals);
    }

    #[test]
    fn test_invalid_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.ply");

        std::fs::write(&path, "not_ply\n").unwrap();
        assert!(PlyReader::read_point_cloud(&path).is_err());

        std::fs::write(
            &path,
            "ply\nformat ascii 1.0\nelement vertex 1\nproperty float x\nproperty float y\nend_header\n1 2\n",
        )
        .unwrap();
        assert!(matches!(
            PlyReader::read_point_cloud(&path),
            Err(Error::InvalidData(_))
        ));

        std::fs::write(
            &path,
            "ply\nformat ascii 1.0\nelement vertex 1\nproperty float x\nproperty float y\nproperty float z\nelement face 1\nproperty list uchar int vertex_indices\nend_header\n0 0 0\n3 0 1 2\n",
        )
        .unwrap();
        assert!(PlyReader::read_mesh(&path).is_err());

        assert!(matches!(
            PlyReader::read_point_cloud(dir.path().join("missing.ply")),
            Err(Error::Io(_))
        ));
    }
}
