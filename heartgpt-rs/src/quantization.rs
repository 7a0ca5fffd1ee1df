//! Blockwise 4-bit weight quantization.
//!
//! Weights are flattened, split into blocks of `block_size` values and each
//! block is normalised by its absolute maximum. Normalised values are mapped
//! to the nearest entry of a 16-entry code book (NF4 or FP4) and two codes
//! are packed per byte. With double quantization the per-block absmax values
//! are themselves stored as 8-bit codes with one f32 scale per 256 blocks.

use candle_core::{DType, Device, Tensor};

use crate::config::{QuantType, QuantizationConfig};
use crate::error::{HeartGptError, Result};

/// NF4 code book: quantiles of N(0, 1) normalised to [-1, 1].
pub const NF4_CODE: [f32; 16] = [
    -1.0,
    -0.696_192_8,
    -0.525_073_05,
    -0.394_917_5,
    -0.284_441_38,
    -0.184_773_43,
    -0.091_050_036,
    0.0,
    0.079_580_3,
    0.160_930_2,
    0.246_112_3,
    0.337_915_24,
    0.440_709_83,
    0.562_617,
    0.722_956_84,
    1.0,
];

/// FP4 (e2m1) code book normalised to [-1, 1], sorted ascending.
pub const FP4_CODE: [f32; 16] = [
    -1.0,
    -0.666_666_7,
    -0.5,
    -0.333_333_34,
    -0.25,
    -0.166_666_67,
    -0.005_208_333,
    0.0,
    0.0,
    0.005_208_333,
    0.166_666_67,
    0.25,
    0.333_333_34,
    0.5,
    0.666_666_7,
    1.0,
];

/// Number of absmax values sharing one scale under double quantization.
pub const DOUBLE_QUANT_BLOCK: usize = 256;

fn code_book(quant_type: QuantType) -> &'static [f32; 16] {
    match quant_type {
        QuantType::Nf4 => &NF4_CODE,
        QuantType::Fp4 => &FP4_CODE,
    }
}

/// Index of the code closest to `x`, for a code book sorted ascending.
fn nearest_code(code: &[f32; 16], x: f32) -> u8 {
    let idx = code.partition_point(|&c| c < x);
    if idx == 0 {
        return 0;
    }
    if idx >= code.len() {
        return 15;
    }
    let (lo, hi) = (code[idx - 1], code[idx]);
    #[allow(clippy::cast_possible_truncation)]
    if x - lo <= hi - x {
        (idx - 1) as u8
    } else {
        idx as u8
    }
}

/// Per-block absmax scales, held on the weight's device.
#[derive(Debug, Clone)]
pub enum AbsMax {
    /// One f32 per block.
    Plain(Tensor),
    /// 8-bit codes around a shared offset, one f32 scale per group.
    Double {
        /// Mean-centred absmax codes biased by 127 into `u8`, padded to whole groups.
        codes: Tensor,
        /// Scale per group of [`DOUBLE_QUANT_BLOCK`] codes.
        scales: Tensor,
        /// Mean subtracted before quantizing.
        offset: f32,
        /// Number of blocks described.
        blocks: usize,
    },
}

impl AbsMax {
    fn quantize(values: &[f32], double: bool, device: &Device) -> Result<Self> {
        if !double {
            return Ok(Self::Plain(Tensor::from_slice(values, values.len(), device)?));
        }
        #[allow(clippy::cast_precision_loss)]
        let offset = values.iter().sum::<f32>() / values.len().max(1) as f32;
        let groups = values.len().div_ceil(DOUBLE_QUANT_BLOCK);
        let mut codes = vec![127u8; groups * DOUBLE_QUANT_BLOCK];
        let mut scales = Vec::with_capacity(groups);
        for (g, group) in values.chunks(DOUBLE_QUANT_BLOCK).enumerate() {
            let max = group
                .iter()
                .map(|v| (v - offset).abs())
                .fold(0.0f32, f32::max);
            let scale = if max > 0.0 { max / 127.0 } else { 1.0 };
            scales.push(scale);
            for (i, v) in group.iter().enumerate() {
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let code = (((v - offset) / scale).round().clamp(-127.0, 127.0) + 127.0) as u8;
                codes[g * DOUBLE_QUANT_BLOCK + i] = code;
            }
        }
        Ok(Self::Double {
            codes: Tensor::from_vec(codes, groups * DOUBLE_QUANT_BLOCK, device)?,
            scales: Tensor::from_vec(scales, groups, device)?,
            offset,
            blocks: values.len(),
        })
    }

    /// Absmax of every block as an f32 `[blocks]` tensor.
    fn values(&self) -> Result<Tensor> {
        match self {
            Self::Plain(values) => Ok(values.clone()),
            Self::Double {
                codes,
                scales,
                offset,
                blocks,
            } => {
                let groups = scales.elem_count();
                let centred = codes
                    .to_dtype(DType::F32)?
                    .affine(1.0, -127.0)?
                    .reshape((groups, DOUBLE_QUANT_BLOCK))?
                    .broadcast_mul(&scales.reshape((groups, 1))?)?;
                Ok(centred
                    .flatten_all()?
                    .narrow(0, 0, *blocks)?
                    .affine(1.0, f64::from(*offset))?)
            }
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::Plain(values) => values.elem_count(),
            Self::Double { blocks, .. } => *blocks,
        }
    }

    fn size_bytes(&self) -> usize {
        match self {
            Self::Plain(values) => values.elem_count() * 4,
            Self::Double { codes, scales, .. } => codes.elem_count() + scales.elem_count() * 4 + 4,
        }
    }
}

/// A frozen 2-D weight stored as packed 4-bit codes.
///
/// Codes and scales live on the weight's device; [`QuantizedWeight::dequantize`]
/// unpacks them with tensor ops, so the forward pass never round-trips
/// through host memory.
#[derive(Clone)]
pub struct QuantizedWeight {
    /// Two codes per byte, high nibble first, padded to whole blocks.
    packed: Tensor,
    /// Code value of the high nibble of every byte, `[256]` f32.
    high_nibble: Tensor,
    /// Code value of the low nibble of every byte, `[256]` f32.
    low_nibble: Tensor,
    absmax: AbsMax,
    shape: (usize, usize),
    block_size: usize,
    quant_type: QuantType,
}

impl std::fmt::Debug for QuantizedWeight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuantizedWeight")
            .field("shape", &self.shape)
            .field("quant_type", &self.quant_type)
            .field("block_size", &self.block_size)
            .field("blocks", &self.absmax.len())
            .finish_non_exhaustive()
    }
}

impl QuantizedWeight {
    /// Quantize a `[out, in]` weight.
    ///
    /// Code assignment runs once on the host; the packed result is moved
    /// back to the weight's device.
    ///
    /// # Errors
    ///
    /// Returns an error if the tensor is not 2-D or the block size is invalid.
    pub fn quantize(weight: &Tensor, config: &QuantizationConfig) -> Result<Self> {
        let (rows, cols) = weight.dims2().map_err(|_| {
            HeartGptError::Quantization(format!(
                "expected a 2-D weight, got shape {:?}",
                weight.dims()
            ))
        })?;
        if config.block_size == 0 {
            return Err(HeartGptError::Quantization("block_size must be > 0".into()));
        }

        let device = weight.device();
        let code = code_book(config.quant_type);
        let values = weight.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let blocks = values.len().div_ceil(config.block_size);

        let mut absmax = Vec::with_capacity(blocks);
        // Padding positions keep code 0x7 (0.0 in both code books).
        let mut packed = vec![0x77u8; (blocks * config.block_size).div_ceil(2)];
        for (block_idx, block) in values.chunks(config.block_size).enumerate() {
            let max = block.iter().map(|v| v.abs()).fold(0.0f32, f32::max);
            absmax.push(max);
            let inv = if max > 0.0 { 1.0 / max } else { 0.0 };
            let base = block_idx * config.block_size;
            for (i, &v) in block.iter().enumerate() {
                let q = nearest_code(code, v * inv);
                let pos = base + i;
                let byte = &mut packed[pos / 2];
                if pos % 2 == 0 {
                    *byte = (*byte & 0x0f) | (q << 4);
                } else {
                    *byte = (*byte & 0xf0) | q;
                }
            }
        }

        let high: Vec<f32> = (0..=255u8).map(|b| code[usize::from(b >> 4)]).collect();
        let low: Vec<f32> = (0..=255u8).map(|b| code[usize::from(b & 0x0f)]).collect();
        let packed_len = packed.len();
        Ok(Self {
            packed: Tensor::from_vec(packed, packed_len, device)?,
            high_nibble: Tensor::from_vec(high, 256, device)?,
            low_nibble: Tensor::from_vec(low, 256, device)?,
            absmax: AbsMax::quantize(&absmax, config.double_quant, device)?,
            shape: (rows, cols),
            block_size: config.block_size,
            quant_type: config.quant_type,
        })
    }

    /// Weight shape `(out, in)`.
    #[must_use]
    pub fn shape(&self) -> (usize, usize) {
        self.shape
    }

    /// Code book used for this weight.
    #[must_use]
    pub fn quant_type(&self) -> QuantType {
        self.quant_type
    }

    /// Device holding the codes.
    #[must_use]
    pub fn device(&self) -> &Device {
        self.packed.device()
    }

    /// Bytes held by the packed codes and scales.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.packed.elem_count() + self.absmax.size_bytes()
    }

    /// Restore a dense weight in `dtype`.
    ///
    /// # Errors
    ///
    /// Returns an error if a tensor op fails.
    pub fn dequantize(&self, dtype: DType) -> Result<Tensor> {
        let blocks = self.absmax.len();
        let padded = blocks * self.block_size;
        let high = self.high_nibble.index_select(&self.packed, 0)?;
        let low = self.low_nibble.index_select(&self.packed, 0)?;
        let normalised = Tensor::stack(&[high, low], 1)?
            .flatten_all()?
            .narrow(0, 0, padded)?
            .reshape((blocks, self.block_size))?;
        let scales = self.absmax.values()?.reshape((blocks, 1))?;
        let dense = normalised
            .broadcast_mul(&scales)?
            .flatten_all()?
            .narrow(0, 0, self.shape.0 * self.shape.1)?
            .reshape(self.shape)?;
        Ok(dense.to_dtype(dtype)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(quant_type: QuantType, double_quant: bool, block_size: usize) -> QuantizationConfig {
        QuantizationConfig {
            quant_type,
            double_quant,
            block_size,
            ..QuantizationConfig::default()
        }
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    #[test]
    fn test_code_books_sorted() {
        for code in [&NF4_CODE, &FP4_CODE] {
            assert!(code.windows(2).all(|w| w[0] <= w[1]));
            assert_eq!(code[0], -1.0);
            assert_eq!(code[15], 1.0);
        }
    }

    #[test]
    fn test_nearest_code() {
        assert_eq!(nearest_code(&NF4_CODE, -2.0), 0);
        assert_eq!(nearest_code(&NF4_CODE, 2.0), 15);
        assert_eq!(nearest_code(&NF4_CODE, 0.0), 7);
        assert_eq!(nearest_code(&NF4_CODE, 0.07), 8);
        assert_eq!(nearest_code(&NF4_CODE, 0.5), 13);
    }

    #[test]
    fn test_exact_codes_survive() {
        let values: Vec<f32> = NF4_CODE.iter().map(|c| c * 3.0).collect();
        let weight = Tensor::from_vec(values, (2, 8), &Device::Cpu).unwrap();
        let q = QuantizedWeight::quantize(&weight, &config(QuantType::Nf4, false, 16)).unwrap();
        let restored = q.dequantize(DType::F32).unwrap();
        assert!(max_abs_diff(&weight, &restored) < 1e-5);
    }

    #[test]
    fn test_nf4_error_is_bounded_by_absmax() {
        let weight = Tensor::randn(0f32, 1.0, (32, 64), &Device::Cpu).unwrap();
        let q = QuantizedWeight::quantize(&weight, &config(QuantType::Nf4, false, 64)).unwrap();
        let restored = q.dequantize(DType::F32).unwrap();
        assert_eq!(restored.dims(), &[32, 64]);
        let absmax = weight.abs().unwrap().max_all().unwrap().to_scalar::<f32>().unwrap();
        // Widest NF4 gap is between -1.0 and -0.696.
        assert!(max_abs_diff(&weight, &restored) <= 0.16 * absmax);
    }

    #[test]
    fn test_fp4_roundtrip_shape_and_sign() {
        let values = vec![1.0f32, -1.0, 0.5, -0.5, 0.25, -0.25, 0.0, 0.75];
        let weight = Tensor::from_vec(values.clone(), (2, 4), &Device::Cpu).unwrap();
        let q = QuantizedWeight::quantize(&weight, &config(QuantType::Fp4, false, 4)).unwrap();
        let restored = q.dequantize(DType::F32).unwrap().flatten_all().unwrap();
        let restored = restored.to_vec1::<f32>().unwrap();
        for (orig, got) in values.iter().zip(&restored) {
            assert!(orig * got >= 0.0, "sign flipped: {orig} -> {got}");
        }
    }

    #[test]
    fn test_double_quant_close_to_plain() {
        let weight = Tensor::randn(0f32, 0.02, (64, 128), &Device::Cpu).unwrap();
        let plain = QuantizedWeight::quantize(&weight, &config(QuantType::Nf4, false, 64)).unwrap();
        let double = QuantizedWeight::quantize(&weight, &config(QuantType::Nf4, true, 64)).unwrap();
        let a = plain.dequantize(DType::F32).unwrap();
        let b = double.dequantize(DType::F32).unwrap();
        assert!(max_abs_diff(&a, &b) < 1e-3);
        assert!(double.size_bytes() < plain.size_bytes());
    }

    #[test]
    fn test_partial_last_block() {
        let weight = Tensor::randn(0f32, 1.0, (3, 5), &Device::Cpu).unwrap();
        let q = QuantizedWeight::quantize(&weight, &config(QuantType::Nf4, false, 4)).unwrap();
        let restored = q.dequantize(DType::F32).unwrap();
        assert_eq!(restored.dims(), &[3, 5]);
    }

    #[test]
    fn test_zero_block() {
        let weight = Tensor::zeros((2, 4), DType::F32, &Device::Cpu).unwrap();
        let q = QuantizedWeight::quantize(&weight, &config(QuantType::Nf4, true, 4)).unwrap();
        let restored = q.dequantize(DType::F32).unwrap();
        assert!(max_abs_diff(&weight, &restored) < 1e-6);
    }

    #[test]
    fn test_rejects_non_matrix() {
        let weight = Tensor::zeros(8, DType::F32, &Device::Cpu).unwrap();
        assert!(QuantizedWeight::quantize(&weight, &QuantizationConfig::default()).is_err());
    }

    #[test]
    fn test_codes_stay_on_weight_device() {
        let weight = Tensor::randn(0f32, 1.0, (8, 64), &Device::Cpu).unwrap();
        let q = QuantizedWeight::quantize(&weight, &config(QuantType::Nf4, true, 64)).unwrap();
        assert!(q.device().same_device(weight.device()));
        // 512 codes in 256 bytes, 8 block codes padded to one group of 256 plus one scale and the offset.
        assert_eq!(q.size_bytes(), 256 + 256 + 4 + 4);
    }

    #[test]
    fn test_double_quant_partial_group() {
        let weight = Tensor::randn(0f32, 0.5, (3, 70), &Device::Cpu).unwrap();
        let plain = QuantizedWeight::quantize(&weight, &config(QuantType::Fp4, false, 6)).unwrap();
        let double = QuantizedWeight::quantize(&weight, &config(QuantType::Fp4, true, 6)).unwrap();
        let a = plain.dequantize(DType::F32).unwrap();
        let b = double.dequantize(DType::F32).unwrap();
        assert_eq!(b.dims(), &[3, 70]);
        assert!(max_abs_diff(&a, &b) < 1e-2);
    }

    #[test]
    fn test_dequantize_to_compute_dtype() {
        let weight = Tensor::randn(0f32, 1.0, (4, 64), &Device::Cpu).unwrap();
        let q = QuantizedWeight::quantize(&weight, &QuantizationConfig::default()).unwrap();
        assert_eq!(q.dequantize(DType::F16).unwrap().dtype(), DType::F16);
        assert!(q.size_bytes() < 4 * 64 * 2);
    }
}
