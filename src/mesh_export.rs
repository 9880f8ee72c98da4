//! Writing the finished surface out as an ASCII PLY file.
//!
//! Export is one-shot: a [MeshExporter] refuses to start a second export
//! while one is running. The file is rendered to memory and validated
//! before anything touches the disk, then written next to the destination
//! and renamed into place, so neither a bad mesh nor a failed write leaves
//! a partial file behind.

use crate::volume::{Mesh, VolumeError};
use log::info;
use std::{
    fmt, fs,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
};

/// How the mesh is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshExportOptions {
    /// Negate y and z, converting from camera convention (y down, z
    /// forward) to the y-up convention most viewers expect
    pub flip_axes: bool,
    /// Write per-vertex color when the mesh has it
    pub include_colors: bool,
}

impl Default for MeshExportOptions {
    fn default() -> Self {
        Self {
            flip_axes: true,
            include_colors: true,
        }
    }
}

/// What went wrong with an export.
#[derive(Debug)]
pub enum ExportError {
    /// Another export is still running
    Busy,
    /// The mesh is malformed
    Validation(String),
    /// Writing the file failed
    IoError(std::io::Error),
    /// Extracting the mesh from the volume failed
    Volume(VolumeError),
    /// The session went away before the mesh arrived
    Cancelled,
}

impl fmt::Display for ExportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportError::Busy => write!(f, "an export is already running"),
            ExportError::Validation(what) => write!(f, "invalid mesh: {}", what),
            ExportError::IoError(error) => write!(f, "io error: {}", error),
            ExportError::Volume(error) => write!(f, "mesh extraction failed: {}", error),
            ExportError::Cancelled => write!(f, "export cancelled"),
        }
    }
}

impl std::error::Error for ExportError {}

impl From<std::io::Error> for ExportError {
    fn from(value: std::io::Error) -> Self {
        Self::IoError(value)
    }
}

impl From<VolumeError> for ExportError {
    fn from(value: VolumeError) -> Self {
        Self::Volume(value)
    }
}

/// Facts about a written mesh file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshSummary {
    /// Where the file went
    pub path: PathBuf,
    /// Vertices written
    pub vertices: usize,
    /// Faces written
    pub triangles: usize,
    /// Whether per-vertex color was written
    pub colored: bool,
}

/// Check that `mesh` is a well-formed list of unshared triangles.
pub fn validate(mesh: &Mesh) -> Result<(), ExportError> {
    let invalid = |what: String| Err(ExportError::Validation(what));
    let n = mesh.vertices.len();

    if n % 3 != 0 {
        return invalid(format!("{} vertices is not a whole number of triangles", n));
    }
    if mesh.normals.len() != n {
        return invalid(format!("{} normals for {} vertices", mesh.normals.len(), n));
    }
    if let Some(colors) = &mesh.colors {
        if colors.len() != n {
            return invalid(format!("{} colors for {} vertices", colors.len(), n));
        }
    }
    if mesh.triangle_indices.len() != n {
        return invalid(format!(
            "{} indices for {} vertices",
            mesh.triangle_indices.len(),
            n
        ));
    }
    if let Some(bad) = mesh.triangle_indices.iter().find(|i| **i as usize >= n) {
        return invalid(format!("index {} out of bounds", bad));
    }

    Ok(())
}

/// Render `mesh` as ASCII PLY text.
pub fn render_ply(mesh: &Mesh, options: &MeshExportOptions) -> Result<String, ExportError> {
    validate(mesh)?;

    let colors = mesh.colors.as_ref().filter(|_| options.include_colors);
    let triangles = mesh.triangle_indices.len() / 3;
    let sign = if options.flip_axes { -1.0 } else { 1.0 };

    let mut out = String::with_capacity(64 + mesh.vertices.len() * 32);
    out.push_str("ply\nformat ascii 1.0\ncomment HeadScan\n");
    out.push_str(&format!("element vertex {}\n", mesh.vertices.len()));
    out.push_str("property float x\nproperty float y\nproperty float z\n");
    if colors.is_some() {
        out.push_str("property uchar red\nproperty uchar green\nproperty uchar blue\n");
    }
    out.push_str(&format!("element face {}\n", triangles));
    out.push_str("property list uchar int vertex_indices\nend_header\n");

    for (i, v) in mesh.vertices.iter().enumerate() {
        out.push_str(&format!("{} {} {}", v.x, sign * v.y, sign * v.z));
        if let Some([r, g, b]) = colors.map(|c| c[i]) {
            out.push_str(&format!(" {} {} {}", r, g, b));
        }
        out.push('\n');
    }
    for face in mesh.triangle_indices.chunks_exact(3) {
        out.push_str(&format!("3 {} {} {}\n", face[0], face[1], face[2]));
    }

    Ok(out)
}

/// Validate and write `mesh` to `path`.
pub fn write_ply(
    mesh: &Mesh,
    path: impl AsRef<Path>,
    options: &MeshExportOptions,
) -> Result<MeshSummary, ExportError> {
    let text = render_ply(mesh, options)?;
    write_atomically(path.as_ref(), text.as_bytes())?;

    Ok(MeshSummary {
        path: path.as_ref().to_path_buf(),
        vertices: mesh.vertices.len(),
        triangles: mesh.triangle_indices.len() / 3,
        colored: options.include_colors && mesh.colors.is_some(),
    })
}

/// Sibling of `path` that a file is staged in before it is renamed over
/// `path`.
fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    path.with_file_name(name)
}

/// Write `contents` to a sibling of `path` and rename it into place. The
/// staged file is removed if either step fails.
fn write_atomically(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let staged = staging_path(path);
    let res = fs::write(&staged, contents).and_then(|()| fs::rename(&staged, path));
    if res.is_err() {
        let _ = fs::remove_file(&staged);
    }
    res
}

/// Clears the busy flag when an export ends, however it ends.
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Runs exports one at a time.
#[derive(Debug, Default)]
pub struct MeshExporter {
    busy: AtomicBool,
}

impl MeshExporter {
    /// An idle exporter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an export is running.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Get a mesh from `extract` and write it to `path`. Fails with
    /// [ExportError::Busy] if another export is running.
    pub fn export<F>(
        &self,
        path: impl AsRef<Path>,
        options: &MeshExportOptions,
        extract: F,
    ) -> Result<MeshSummary, ExportError>
    where
        F: FnOnce() -> Result<Mesh, ExportError>,
    {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ExportError::Busy)?;
        let _guard = BusyGuard(&self.busy);

        let mesh = extract()?;
        let summary = write_ply(&mesh, path, options)?;
        info!(
            "MeshExporter : wrote {} triangles to {}.",
            summary.triangles,
            summary.path.display()
        );
        Ok(summary)
    }
}
