//! Safetensors container reader.
//!
//! A safetensors file is a `u64` little-endian header length, that many
//! bytes of JSON (name → `{dtype, shape, data_offsets}`), then the raw
//! tensor bytes. We read the whole file into memory and hand it to the
//! `safetensors` crate, which validates the header (offsets in-bounds,
//! non-overlapping, monotonic) for us; its parse errors are mapped onto
//! `HeaderParseError` so callers never see a crate-specific type. Every
//! tensor is dequantized to `f32` and copied into the caller's
//! `WeightArena` — float32 tensors so quantized weights look identical to
//! native ones at use time (spec.md: "Dequantization is performed eagerly
//! if the target runtime format is float32 for that tensor").

use std::path::Path;

use safetensors::tensor::Dtype;
use safetensors::SafeTensors;

use crate::error::{QwenAsrError, Result};
use crate::kernels;
use crate::tensor::{WeightArena, WeightArenaBuilder};

/// Per-tensor scale/zero-point metadata for the one integer-quantized
/// layout this loader understands: symmetric or affine per-tensor
/// quantization with a single `f32` scale and an optional `i32`
/// zero-point, stored as companion tensors `{name}.scale` /
/// `{name}.zero_point` alongside the quantized `{name}` tensor.
fn quant_metadata<'a>(
    st: &'a SafeTensors<'a>,
    name: &str,
) -> Result<(f32, Option<f32>)> {
    let scale_name = format!("{name}.scale");
    let scale_view = st.tensor(&scale_name).map_err(|_| {
        QwenAsrError::MissingTensor(format!("{scale_name} (required to dequantize {name})"))
    })?;
    let scale = bytes_to_f32(scale_view.data(), scale_view.dtype(), &scale_name)?[0];

    let zero_name = format!("{name}.zero_point");
    let zero = st.tensor(&zero_name).ok().map(|v| {
        bytes_to_f32(v.data(), v.dtype(), &zero_name)
            .unwrap_or_else(|_| vec![0.0])[0]
    });

    Ok((scale, zero))
}

fn bytes_to_f32(bytes: &[u8], dtype: Dtype, name: &str) -> Result<Vec<f32>> {
    match dtype {
        Dtype::F32 => Ok(bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()),
        Dtype::F16 => Ok(bytes
            .chunks_exact(2)
            .map(|c| half::f16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect()),
        Dtype::BF16 => Ok(bytes
            .chunks_exact(2)
            .map(|c| half::bf16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect()),
        Dtype::I32 => Ok(bytes
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f32)
            .collect()),
        other => Err(QwenAsrError::UnsupportedDtype {
            name: name.to_string(),
            dtype: format!("{other:?}"),
        }),
    }
}

fn dequantize_tensor(st: &SafeTensors, name: &str, shape: &[usize], bytes: &[u8], dtype: Dtype) -> Result<Vec<f32>> {
    let (scale, zero) = quant_metadata(st, name)?;
    // I8 is signed two's-complement; U8 is not — widening the wrong way
    // corrupts every negative quantized value.
    let raw: Vec<i32> = match dtype {
        Dtype::I8 => bytes.iter().map(|&b| b as i8 as i32).collect(),
        _ => bytes.iter().map(|&b| b as i32).collect(),
    };
    let mut out = vec![0.0f32; shape.iter().product()];
    kernels::dequantize(&raw, scale, zero.unwrap_or(0.0), &mut out);
    Ok(out)
}

/// Loads every tensor in `path` into `arena`, dequantizing as needed.
/// Fails loudly (per spec.md section 4.2) rather than silently skipping a
/// tensor the caller didn't ask for.
pub fn load_into(path: &Path, arena: &mut WeightArenaBuilder) -> Result<()> {
    let bytes = std::fs::read(path)
        .map_err(|_| QwenAsrError::FileNotFound(path.display().to_string()))?;

    let st = SafeTensors::deserialize(&bytes)
        .map_err(|e| QwenAsrError::HeaderParseError(e.to_string()))?;

    for (name, view) in st.tensors() {
        // Scale/zero-point companion tensors are metadata, not model
        // weights in their own right; they're consumed by
        // `dequantize_tensor` above and never placed in the arena.
        if name.ends_with(".scale") || name.ends_with(".zero_point") {
            continue;
        }

        let shape: Vec<usize> = view.shape().to_vec();
        if shape.is_empty() {
            return Err(QwenAsrError::ShapeMismatch {
                name: name.clone(),
                expected: vec![1],
                actual: shape,
            });
        }

        let data = match view.dtype() {
            Dtype::U8 | Dtype::I8 => dequantize_tensor(&st, &name, &shape, view.data(), view.dtype())?,
            dtype => bytes_to_f32(view.data(), dtype, &name)?,
        };

        arena.insert(name, shape, &data);
    }

    Ok(())
}

pub fn load(path: &Path) -> Result<WeightArena> {
    let mut builder = WeightArena::builder();
    load_into(path, &mut builder)?;
    Ok(builder.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use safetensors::tensor::TensorView as StView;
    use std::collections::HashMap;
    use std::io::Write;

    fn write_safetensors(path: &Path, tensors: Vec<(&str, Vec<usize>, Vec<u8>, Dtype)>) {
        let mut map: HashMap<String, StView> = HashMap::new();
        // Keep the backing byte buffers alive for the lifetime of the views.
        let bufs: Vec<Vec<u8>> = tensors.iter().map(|t| t.2.clone()).collect();
        for (i, (name, shape, _, dtype)) in tensors.iter().enumerate() {
            map.insert(
                name.to_string(),
                StView::new(*dtype, shape.clone(), &bufs[i]).unwrap(),
            );
        }
        let out = safetensors::serialize(&map, &None).unwrap();
        let mut f = std::fs::File::create(path).unwrap();
        f.write_all(&out).unwrap();
    }

    #[test]
    fn loads_f32_tensor() {
        let dir = std::env::temp_dir().join("qwen_asr_test_f32.safetensors");
        let data: Vec<u8> = [1.0f32, 2.0, 3.0, 4.0]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        write_safetensors(&dir, vec![("w", vec![2, 2], data, Dtype::F32)]);

        let arena = load(&dir).unwrap();
        let view = arena.get("w").unwrap();
        assert_eq!(view.shape, &[2, 2]);
        assert_eq!(view.data, &[1.0, 2.0, 3.0, 4.0]);
        std::fs::remove_file(&dir).ok();
    }

    #[test]
    fn i8_dequantizes_as_signed() {
        let dir = std::env::temp_dir().join("qwen_asr_test_i8.safetensors");
        let scale: Vec<u8> = 2.0f32.to_le_bytes().to_vec();
        // -1i8 and 1i8, as raw bytes.
        let q: Vec<u8> = vec![0xFF, 0x01];
        write_safetensors(
            &dir,
            vec![("w", vec![2], q, Dtype::I8), ("w.scale", vec![1], scale, Dtype::F32)],
        );

        let arena = load(&dir).unwrap();
        let view = arena.get("w").unwrap();
        assert_eq!(view.data, &[-2.0, 2.0]);
        std::fs::remove_file(&dir).ok();
    }

    #[test]
    fn missing_file_is_file_not_found() {
        let err = load(Path::new("/nonexistent/path/model.safetensors")).unwrap_err();
        assert!(matches!(err, QwenAsrError::FileNotFound(_)));
    }

    #[test]
    fn truncated_header_is_header_parse_error() {
        let dir = std::env::temp_dir().join("qwen_asr_test_truncated.safetensors");
        // A declared header length far larger than the actual file.
        std::fs::write(&dir, (u64::MAX / 2).to_le_bytes()).unwrap();
        let err = load(&dir).unwrap_err();
        assert!(matches!(err, QwenAsrError::HeaderParseError(_)));
        std::fs::remove_file(&dir).ok();
    }
}
