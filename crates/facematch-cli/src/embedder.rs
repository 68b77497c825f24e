//! Face image → embedding, through a loaded model.
//!
//! Images are expected to be already-cropped faces. They are resized to the
//! model's input size and standardized per image (zero mean, unit variance)
//! before inference; the output is L2-normalized.

use facematch_core::Embedding;
use facematch_models::{InferenceRuntime, InputLayout, InputSize, ModelHandle, RuntimeError, Tensor};
use image::imageops::FilterType;
use image::DynamicImage;
use ndarray::Array4;
use std::path::Path;
use thiserror::Error;

const RGB_CHANNELS: usize = 3;

#[derive(Error, Debug)]
pub enum EmbedError {
    #[error("image: {0}")]
    Image(#[from] image::ImageError),
    #[error("inference: {0}")]
    Runtime(#[from] RuntimeError),
    #[error("model produced an empty embedding")]
    EmptyOutput,
    #[error("model produced a non-finite embedding")]
    NonFinite,
}

pub struct FaceEmbedder<'a, R: InferenceRuntime> {
    runtime: &'a R,
    handle: &'a ModelHandle<R::Model>,
    model_version: String,
}

impl<'a, R: InferenceRuntime> FaceEmbedder<'a, R> {
    pub fn new(runtime: &'a R, handle: &'a ModelHandle<R::Model>) -> Self {
        Self {
            runtime,
            handle,
            model_version: model_version(&handle.provenance),
        }
    }

    /// Embed the face image stored at `path`.
    pub async fn embed_file(&self, path: &Path) -> Result<Embedding, EmbedError> {
        let img = image::open(path)?;
        tracing::debug!(path = %path.display(), width = img.width(), height = img.height(), "image loaded");
        self.embed(&img).await
    }

    pub async fn embed(&self, img: &DynamicImage) -> Result<Embedding, EmbedError> {
        let input = preprocess(img, self.handle.input_size, self.handle.layout);
        let output = self.runtime.predict(&self.handle.model, input).await?;

        let values: Vec<f32> = output.iter().copied().collect();
        if values.is_empty() {
            return Err(EmbedError::EmptyOutput);
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(EmbedError::NonFinite);
        }

        Ok(Embedding::new(values)
            .with_model_version(self.model_version.clone())
            .l2_normalized())
    }
}

/// `https://host/models/facenet.onnx` → `facenet`.
fn model_version(provenance: &str) -> String {
    let name = provenance.rsplit(&['/', '\\'][..]).next().unwrap_or(provenance);
    name.split('.').next().unwrap_or(name).to_string()
}

/// Resize and standardize an image into a single-image tensor.
pub fn preprocess(img: &DynamicImage, size: InputSize, layout: InputLayout) -> Tensor {
    let rgb = img.to_rgb8();
    let resized = image::imageops::resize(&rgb, size.width, size.height, FilterType::Triangle);

    let raw = resized.as_raw();
    let n = raw.len().max(1) as f32;
    let mean = raw.iter().map(|&v| v as f32).sum::<f32>() / n;
    let variance = raw.iter().map(|&v| (v as f32 - mean).powi(2)).sum::<f32>() / n;
    // Floor keeps flat images from dividing by zero.
    let std = variance.sqrt().max(1.0 / n.sqrt());

    let [d0, d1, d2, d3] = layout.tensor_shape(size, RGB_CHANNELS);
    let mut tensor = Array4::<f32>::zeros((d0, d1, d2, d3));

    for (x, y, pixel) in resized.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for c in 0..RGB_CHANNELS {
            let value = (pixel[c] as f32 - mean) / std;
            match layout {
                InputLayout::Nhwc => tensor[[0, y, x, c]] = value,
                InputLayout::Nchw => tensor[[0, c, y, x]] = value,
            }
        }
    }

    tensor.into_dyn()
}
