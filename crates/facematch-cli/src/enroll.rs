//! Build a reference database from a directory of face crops.
//!
//! Expected layout: one subdirectory per identity, holding that person's
//! images (`<dir>/<identity>/*.{jpg,jpeg,png}`). Hidden files and other
//! extensions are ignored.

use crate::embedder::FaceEmbedder;
use facematch_core::ReferenceDatabase;
use facematch_models::InferenceRuntime;
use serde::Serialize;
use std::path::{Path, PathBuf};

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Debug, Default, Serialize)]
pub struct EnrollReport {
    /// Identities with at least one embedding.
    pub identities: usize,
    pub embedded: usize,
    /// Images that could not be embedded.
    pub failed: Vec<PathBuf>,
    /// Identity directories that yielded no embeddings.
    pub empty: Vec<String>,
}

pub fn is_face_image(path: &Path) -> bool {
    let hidden = path
        .file_name()
        .and_then(|n| n.to_str())
        .map_or(true, |n| n.starts_with('.'));
    let supported = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| IMAGE_EXTENSIONS.iter().any(|x| e.eq_ignore_ascii_case(x)));
    !hidden && supported
}

/// Identity directories and their images, both sorted by name.
pub fn collect_images(dir: &Path) -> std::io::Result<Vec<(String, Vec<PathBuf>)>> {
    let mut people = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some(identity) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            continue;
        };
        if identity.starts_with('.') {
            continue;
        }

        let mut images: Vec<PathBuf> = std::fs::read_dir(&path)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && is_face_image(p))
            .collect();
        images.sort();
        people.push((identity, images));
    }
    people.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(people)
}

/// Embed every image under `dir` into a new database.
///
/// Per-image failures are logged and reported, never fatal.
pub async fn build_database<R: InferenceRuntime>(
    embedder: &FaceEmbedder<'_, R>,
    dir: &Path,
) -> std::io::Result<(ReferenceDatabase, EnrollReport)> {
    let mut db = ReferenceDatabase::new();
    let mut report = EnrollReport::default();

    for (identity, images) in collect_images(dir)? {
        let mut count = 0usize;
        for image in &images {
            let embedding = match embedder.embed_file(image).await {
                Ok(e) => e,
                Err(err) => {
                    tracing::warn!(path = %image.display(), error = %err, "skipping image");
                    report.failed.push(image.clone());
                    continue;
                }
            };
            if let Err(err) = db.insert(identity.as_str(), embedding.values) {
                tracing::warn!(path = %image.display(), error = %err, "skipping image");
                report.failed.push(image.clone());
                continue;
            }
            count += 1;
        }

        tracing::info!(identity = %identity, images = images.len(), embedded = count, "identity enrolled");
        if count == 0 {
            report.empty.push(identity);
        } else {
            report.identities += 1;
            report.embedded += count;
        }
    }

    Ok((db, report))
}
