//! Model input geometry.
//!
//! The declared input shape always wins. Only when the model does not
//! declare a usable spatial size does the source name decide.

use crate::runtime::InferenceRuntime;
use serde::Serialize;

/// Input side length of small mobile-class embedders.
pub const SMALL_INPUT_SIZE: u32 = 112;
/// Input side length of FaceNet-class embedders.
pub const DEFAULT_INPUT_SIZE: u32 = 160;

const SMALL_MODEL_MARKERS: [&str; 2] = ["mobilefacenet", "112"];
const RGB_CHANNELS: i64 = 3;

/// Required spatial size of the model input, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InputSize {
    pub width: u32,
    pub height: u32,
}

impl InputSize {
    pub const fn square(side: u32) -> Self {
        Self {
            width: side,
            height: side,
        }
    }

    /// `[width, height]`.
    pub fn to_array(self) -> [u32; 2] {
        [self.width, self.height]
    }
}

/// Memory layout of a 4-D image input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InputLayout {
    /// `[batch, height, width, channels]`
    #[default]
    Nhwc,
    /// `[batch, channels, height, width]`
    Nchw,
}

impl InputLayout {
    /// Infer the layout from a declared shape. Channel-first exports put the
    /// channel count (3) in position 1; everything else is read as NHWC.
    pub fn detect(shape: Option<&[i64]>) -> Self {
        match shape {
            Some([_, c, _, last]) if *c == RGB_CHANNELS && *last != RGB_CHANNELS => Self::Nchw,
            _ => Self::Nhwc,
        }
    }

    /// Shape of a single-image tensor in this layout.
    pub fn tensor_shape(self, size: InputSize, channels: usize) -> [usize; 4] {
        let (h, w) = (size.height as usize, size.width as usize);
        match self {
            Self::Nhwc => [1, h, w, channels],
            Self::Nchw => [1, channels, h, w],
        }
    }
}

/// Spatial size declared by a 4-D input shape, if height and width are known.
pub fn input_size_from_shape(shape: &[i64]) -> Option<InputSize> {
    let (h, w) = match InputLayout::detect(Some(shape)) {
        InputLayout::Nhwc => (*shape.get(1)?, *shape.get(2)?),
        InputLayout::Nchw => (*shape.get(2)?, *shape.get(3)?),
    };
    if shape.len() != 4 || h <= 0 || w <= 0 {
        return None;
    }
    Some(InputSize {
        width: u32::try_from(w).ok()?,
        height: u32::try_from(h).ok()?,
    })
}

/// Size implied by a model's source identifier.
pub fn input_size_from_name(identifier: &str) -> InputSize {
    let lower = identifier.to_ascii_lowercase();
    if SMALL_MODEL_MARKERS.iter().any(|m| lower.contains(m)) {
        InputSize::square(SMALL_INPUT_SIZE)
    } else {
        InputSize::square(DEFAULT_INPUT_SIZE)
    }
}

/// Resolve the input size of a loaded model.
pub fn model_input_size<R: InferenceRuntime>(runtime: &R, model: &R::Model, identifier: &str) -> InputSize {
    let declared = runtime.input_shape(model);
    match declared.as_deref().and_then(input_size_from_shape) {
        Some(size) => size,
        None => {
            let size = input_size_from_name(identifier);
            tracing::debug!(
                identifier,
                declared = ?declared,
                width = size.width,
                height = size.height,
                "input shape not declared; using name heuristic"
            );
            size
        }
    }
}

/// Concrete shape for a synthetic probe input.
///
/// Unknown dimensions of a declared 4-D shape are filled from `size`
/// (batch = 1, channels = 3). Without a usable declaration the probe is
/// `[1, height, width, 3]`.
pub fn probe_shape(declared: Option<&[i64]>, size: InputSize) -> Vec<usize> {
    let layout = InputLayout::detect(declared);
    let fallback = layout.tensor_shape(size, RGB_CHANNELS as usize);
    match declared {
        Some(shape) if shape.len() == 4 => shape
            .iter()
            .zip(fallback)
            .map(|(&d, f)| if d > 0 { d as usize } else { f })
            .collect(),
        Some(shape) if !shape.is_empty() => shape.iter().map(|&d| if d > 0 { d as usize } else { 1 }).collect(),
        _ => fallback.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_nhwc() {
        assert_eq!(input_size_from_shape(&[-1, 160, 160, 3]), Some(InputSize::square(160)));
        assert_eq!(
            input_size_from_shape(&[1, 96, 128, 3]),
            Some(InputSize { width: 128, height: 96 })
        );
    }

    #[test]
    fn test_shape_nchw() {
        assert_eq!(input_size_from_shape(&[1, 3, 112, 112]), Some(InputSize::square(112)));
    }

    #[test]
    fn test_shape_unknown_dims() {
        assert_eq!(input_size_from_shape(&[-1, -1, -1, 3]), None);
        assert_eq!(input_size_from_shape(&[1, 128]), None);
        assert_eq!(input_size_from_shape(&[]), None);
    }

    #[test]
    fn test_name_heuristic() {
        assert_eq!(input_size_from_name("https://host/MobileFaceNet.onnx"), InputSize::square(112));
        assert_eq!(input_size_from_name("/models/arcface_112.onnx"), InputSize::square(112));
        assert_eq!(input_size_from_name("/models/facenet.onnx"), InputSize::square(160));
        assert_eq!(InputSize::square(112).to_array(), [112, 112]);
    }

    #[test]
    fn test_layout_detect() {
        assert_eq!(InputLayout::detect(Some(&[1, 3, 112, 112][..])), InputLayout::Nchw);
        assert_eq!(InputLayout::detect(Some(&[1, 160, 160, 3][..])), InputLayout::Nhwc);
        assert_eq!(InputLayout::detect(Some(&[1, 3, 3, 3][..])), InputLayout::Nhwc);
        assert_eq!(InputLayout::detect(None), InputLayout::Nhwc);
    }

    #[test]
    fn test_probe_shape() {
        let size = InputSize::square(160);
        assert_eq!(probe_shape(None, size), vec![1, 160, 160, 3]);
        assert_eq!(probe_shape(Some(&[-1, 160, 160, 3][..]), size), vec![1, 160, 160, 3]);
        assert_eq!(probe_shape(Some(&[-1, 3, -1, -1][..]), InputSize::square(112)), vec![1, 3, 112, 112]);
        assert_eq!(probe_shape(Some(&[-1, 512][..]), size), vec![1, 512]);
    }
}
