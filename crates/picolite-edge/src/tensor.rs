//! Tensor metadata and typed views over raw little-endian bytes.
//!
//! Tensor storage is never typed in memory: the arena and the model blob
//! are plain byte regions without alignment guarantees, so every element
//! access goes through `from_le_bytes`/`to_le_bytes`. Real values travel
//! as `f64`, which is exact up to 2^53. Integer-to-integer moves go
//! through `i64` with `index`/`set_index` so int64 payloads survive.

use half::f16;
use serde::{Deserialize, Serialize};

/// Maximum tensor rank accepted by the verifier and kernels.
pub const MAX_RANK: usize = 8;

/// Element types supported by the interpreter.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Float32 = 0,
    Float16 = 1,
    Int8 = 2,
    UInt8 = 3,
    Int16 = 4,
    Int32 = 5,
    Int64 = 6,
    Bool = 7,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size(&self) -> usize {
        match self {
            DType::Int8 | DType::UInt8 | DType::Bool => 1,
            DType::Float16 | DType::Int16 => 2,
            DType::Float32 | DType::Int32 => 4,
            DType::Int64 => 8,
        }
    }

    /// Bytes needed to store `n` elements, `None` on overflow.
    pub fn storage_bytes(&self, n: usize) -> Option<usize> {
        n.checked_mul(self.size())
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DType::Float32 | DType::Float16)
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, DType::Int8 | DType::UInt8 | DType::Int16 | DType::Int32 | DType::Int64)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DType::Float32 => "float32",
            DType::Float16 => "float16",
            DType::Int8 => "int8",
            DType::UInt8 => "uint8",
            DType::Int16 => "int16",
            DType::Int32 => "int32",
            DType::Int64 => "int64",
            DType::Bool => "bool",
        }
    }

    /// Representable range for integer types.
    fn int_range(&self) -> Option<(f64, f64)> {
        match self {
            DType::Int8 => Some((i8::MIN as f64, i8::MAX as f64)),
            DType::UInt8 => Some((0.0, u8::MAX as f64)),
            DType::Int16 => Some((i16::MIN as f64, i16::MAX as f64)),
            DType::Int32 => Some((i32::MIN as f64, i32::MAX as f64)),
            DType::Int64 => Some((i64::MIN as f64, i64::MAX as f64)),
            _ => None,
        }
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Affine quantization: `real = scale * (q - zero_point)`.
///
/// A single scale is per-tensor; more than one is per-channel along
/// `quantized_dimension`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quantization {
    pub scale: Vec<f32>,
    pub zero_point: Vec<i64>,
    #[serde(default)]
    pub quantized_dimension: usize,
}

impl Quantization {
    pub fn per_tensor(scale: f32, zero_point: i64) -> Self {
        Self { scale: vec![scale], zero_point: vec![zero_point], quantized_dimension: 0 }
    }

    pub fn per_channel(scale: Vec<f32>, zero_point: Vec<i64>, dim: usize) -> Self {
        Self { scale, zero_point, quantized_dimension: dim }
    }

    pub fn is_per_channel(&self) -> bool {
        self.scale.len() > 1
    }

    /// Scale and zero point for a channel; channel 0 for per-tensor.
    #[inline]
    pub fn params(&self, channel: usize) -> (f64, f64) {
        let c = if self.is_per_channel() { channel } else { 0 };
        let zp = if self.zero_point.len() > 1 { self.zero_point[c] } else { self.zero_point[0] };
        (self.scale[c] as f64, zp as f64)
    }
}

/// Location of constant data inside the model blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferRef {
    pub offset: usize,
    pub len: usize,
}

/// Declared tensor metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorDesc {
    #[serde(default)]
    pub name: String,
    pub dtype: DType,
    pub shape: Vec<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quant: Option<Quantization>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer: Option<BufferRef>,
}

impl TensorDesc {
    pub fn new(name: &str, dtype: DType, shape: &[usize]) -> Self {
        Self { name: name.to_string(), dtype, shape: shape.to_vec(), quant: None, buffer: None }
    }

    pub fn with_quant(mut self, quant: Quantization) -> Self {
        self.quant = Some(quant);
        self
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn nbytes(&self) -> usize {
        self.numel() * self.dtype.size()
    }

    pub fn is_constant(&self) -> bool {
        self.buffer.is_some()
    }
}

/// Number of elements for a shape (1 for scalars).
pub fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}

#[inline]
fn read_value(dtype: DType, data: &[u8], i: usize) -> f64 {
    match dtype {
        DType::Float32 => {
            let b = &data[i * 4..i * 4 + 4];
            f32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64
        }
        DType::Float16 => {
            let b = &data[i * 2..i * 2 + 2];
            f16::from_bits(u16::from_le_bytes([b[0], b[1]])).to_f64()
        }
        DType::Int8 => data[i] as i8 as f64,
        DType::UInt8 => data[i] as f64,
        DType::Bool => (data[i] != 0) as u8 as f64,
        DType::Int16 => {
            let b = &data[i * 2..i * 2 + 2];
            i16::from_le_bytes([b[0], b[1]]) as f64
        }
        DType::Int32 => {
            let b = &data[i * 4..i * 4 + 4];
            i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64
        }
        DType::Int64 => {
            let b = &data[i * 8..i * 8 + 8];
            i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]) as f64
        }
    }
}

/// Exact stored value for integer and bool tensors.
#[inline]
fn read_int(dtype: DType, data: &[u8], i: usize) -> Option<i64> {
    let v = match dtype {
        DType::Int8 => data[i] as i8 as i64,
        DType::UInt8 => data[i] as i64,
        DType::Bool => (data[i] != 0) as i64,
        DType::Int16 => i16::from_le_bytes([data[i * 2], data[i * 2 + 1]]) as i64,
        DType::Int32 => {
            let b = &data[i * 4..i * 4 + 4];
            i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as i64
        }
        DType::Int64 => {
            let b = &data[i * 8..i * 8 + 8];
            i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
        }
        DType::Float32 | DType::Float16 => return None,
    };
    Some(v)
}

/// Stores `v` saturating to the integer type; float types go through `f64`.
#[inline]
fn write_int(dtype: DType, data: &mut [u8], i: usize, v: i64) {
    match dtype {
        DType::Int8 => data[i] = v.clamp(i8::MIN as i64, i8::MAX as i64) as i8 as u8,
        DType::UInt8 => data[i] = v.clamp(0, u8::MAX as i64) as u8,
        DType::Bool => data[i] = (v != 0) as u8,
        DType::Int16 => {
            let v = v.clamp(i16::MIN as i64, i16::MAX as i64) as i16;
            data[i * 2..i * 2 + 2].copy_from_slice(&v.to_le_bytes());
        }
        DType::Int32 => {
            let v = v.clamp(i32::MIN as i64, i32::MAX as i64) as i32;
            data[i * 4..i * 4 + 4].copy_from_slice(&v.to_le_bytes());
        }
        DType::Int64 => data[i * 8..i * 8 + 8].copy_from_slice(&v.to_le_bytes()),
        DType::Float32 | DType::Float16 => write_value(dtype, data, i, v as f64),
    }
}

/// Stores `v` rounding half away from zero and saturating for integer types.
#[inline]
fn write_value(dtype: DType, data: &mut [u8], i: usize, v: f64) {
    let int = |v: f64| {
        let (lo, hi) = dtype.int_range().unwrap_or((0.0, 0.0));
        if v.is_nan() { 0.0 } else { v.round().clamp(lo, hi) }
    };
    match dtype {
        DType::Float32 => data[i * 4..i * 4 + 4].copy_from_slice(&(v as f32).to_le_bytes()),
        DType::Float16 => data[i * 2..i * 2 + 2].copy_from_slice(&f16::from_f64(v).to_bits().to_le_bytes()),
        DType::Int8 => data[i] = int(v) as i8 as u8,
        DType::UInt8 => data[i] = int(v) as u8,
        DType::Bool => data[i] = (v != 0.0) as u8,
        DType::Int16 => data[i * 2..i * 2 + 2].copy_from_slice(&(int(v) as i16).to_le_bytes()),
        DType::Int32 => data[i * 4..i * 4 + 4].copy_from_slice(&(int(v) as i32).to_le_bytes()),
        DType::Int64 => data[i * 8..i * 8 + 8].copy_from_slice(&(int(v) as i64).to_le_bytes()),
    }
}

/// (channel stride, channel count) for per-channel quantized tensors.
fn channel_layout(desc: &TensorDesc) -> (usize, usize) {
    match &desc.quant {
        Some(q) if q.is_per_channel() && q.quantized_dimension < desc.shape.len() => {
            let dim = q.quantized_dimension;
            (numel(&desc.shape[dim + 1..]).max(1), desc.shape[dim])
        }
        _ => (1, 1),
    }
}

/// Both sides are unquantized integers (or bool), so values move as `i64`.
pub(crate) fn exact_integers(src: &TensorView<'_>, dst: &TensorDesc) -> bool {
    let int = |d: DType| d.is_integer() || d == DType::Bool;
    int(src.dtype()) && int(dst.dtype) && src.quantization().is_none() && dst.quant.is_none()
}

/// Read-only view of a tensor's metadata and bytes.
#[derive(Clone, Copy)]
pub struct TensorView<'a> {
    desc: &'a TensorDesc,
    data: &'a [u8],
    channel_stride: usize,
    channels: usize,
}

impl<'a> TensorView<'a> {
    pub fn new(desc: &'a TensorDesc, data: &'a [u8]) -> Self {
        let (channel_stride, channels) = channel_layout(desc);
        Self { desc, data, channel_stride, channels }
    }

    pub fn desc(&self) -> &'a TensorDesc {
        self.desc
    }

    pub fn name(&self) -> &'a str {
        &self.desc.name
    }

    pub fn dtype(&self) -> DType {
        self.desc.dtype
    }

    pub fn shape(&self) -> &'a [usize] {
        &self.desc.shape
    }

    pub fn rank(&self) -> usize {
        self.desc.shape.len()
    }

    pub fn numel(&self) -> usize {
        self.desc.numel()
    }

    pub fn quantization(&self) -> Option<&'a Quantization> {
        self.desc.quant.as_ref()
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.data
    }

    /// Stored value without dequantization. Int64 values beyond 2^53
    /// lose precision; use [`index`](Self::index) for exact integers.
    #[inline]
    pub fn value(&self, i: usize) -> f64 {
        read_value(self.desc.dtype, self.data, i)
    }

    /// Stored value as an integer, exact for integer types. Floats
    /// truncate toward zero and saturate.
    #[inline]
    pub fn index(&self, i: usize) -> i64 {
        read_int(self.desc.dtype, self.data, i).unwrap_or_else(|| self.value(i) as i64)
    }

    /// Dequantized value.
    #[inline]
    pub fn real(&self, i: usize) -> f64 {
        let v = self.value(i);
        match &self.desc.quant {
            Some(q) => {
                let (scale, zp) = q.params((i / self.channel_stride) % self.channels);
                (v - zp) * scale
            }
            None => v,
        }
    }

    /// All elements, dequantized, as `f32`.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        (0..self.numel()).map(|i| self.real(i) as f32).collect()
    }
}

impl std::fmt::Debug for TensorView<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TensorView")
            .field("name", &self.desc.name)
            .field("dtype", &self.desc.dtype)
            .field("shape", &self.desc.shape)
            .finish()
    }
}

/// Mutable view of a tensor's bytes.
pub struct TensorViewMut<'a> {
    desc: &'a TensorDesc,
    data: &'a mut [u8],
    channel_stride: usize,
    channels: usize,
}

impl<'a> TensorViewMut<'a> {
    pub fn new(desc: &'a TensorDesc, data: &'a mut [u8]) -> Self {
        let (channel_stride, channels) = channel_layout(desc);
        Self { desc, data, channel_stride, channels }
    }

    pub fn desc(&self) -> &'a TensorDesc {
        self.desc
    }

    pub fn name(&self) -> &'a str {
        &self.desc.name
    }

    pub fn dtype(&self) -> DType {
        self.desc.dtype
    }

    pub fn shape(&self) -> &'a [usize] {
        &self.desc.shape
    }

    pub fn numel(&self) -> usize {
        self.desc.numel()
    }

    pub fn quantization(&self) -> Option<&'a Quantization> {
        self.desc.quant.as_ref()
    }

    pub fn bytes(&self) -> &[u8] {
        &*self.data
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut *self.data
    }

    pub fn as_view(&self) -> TensorView<'_> {
        TensorView { desc: self.desc, data: &*self.data, channel_stride: self.channel_stride, channels: self.channels }
    }

    #[inline]
    pub fn value(&self, i: usize) -> f64 {
        read_value(self.desc.dtype, self.data, i)
    }

    #[inline]
    pub fn set_value(&mut self, i: usize, v: f64) {
        write_value(self.desc.dtype, self.data, i, v);
    }

    /// Stores an integer without a float round trip, saturating to the type.
    #[inline]
    pub fn set_index(&mut self, i: usize, v: i64) {
        write_int(self.desc.dtype, self.data, i, v);
    }

    /// Quantizes `v` with the tensor's parameters and stores it.
    #[inline]
    pub fn set_real(&mut self, i: usize, v: f64) {
        match &self.desc.quant {
            Some(q) => {
                let (scale, zp) = q.params((i / self.channel_stride) % self.channels);
                write_value(self.desc.dtype, self.data, i, (v / scale).round() + zp);
            }
            None => write_value(self.desc.dtype, self.data, i, v),
        }
    }

    pub fn fill_real(&mut self, v: f64) {
        for i in 0..self.numel() {
            self.set_real(i, v);
        }
    }

    /// Copies `src` element-for-element, requantizing when the
    /// representations differ. Both tensors must have the same element count.
    pub fn copy_from(&mut self, src: &TensorView<'_>) {
        let same_repr = src.dtype() == self.dtype() && src.quantization() == self.quantization();
        if same_repr && src.bytes().len() == self.data.len() {
            self.data.copy_from_slice(src.bytes());
        } else if exact_integers(src, self.desc) {
            for i in 0..self.numel().min(src.numel()) {
                self.set_index(i, src.index(i));
            }
        } else {
            for i in 0..self.numel().min(src.numel()) {
                self.set_real(i, src.real(i));
            }
        }
    }

    /// Writes `values`, quantizing if the tensor is quantized.
    pub fn write_f32(&mut self, values: &[f32]) -> Result<(), crate::Error> {
        if values.len() != self.numel() {
            return Err(crate::Error::InvalidArgument(format!(
                "tensor '{}' holds {} elements, got {}",
                self.desc.name,
                self.numel(),
                values.len()
            )));
        }
        for (i, &v) in values.iter().enumerate() {
            self.set_real(i, v as f64);
        }
        Ok(())
    }

    /// Copies raw little-endian bytes into the tensor.
    pub fn copy_from_bytes(&mut self, bytes: &[u8]) -> Result<(), crate::Error> {
        if bytes.len() != self.data.len() {
            return Err(crate::Error::InvalidArgument(format!(
                "tensor '{}' holds {} bytes, got {}",
                self.desc.name,
                self.data.len(),
                bytes.len()
            )));
        }
        self.data.copy_from_slice(bytes);
        Ok(())
    }

    pub fn to_f32_vec(&self) -> Vec<f32> {
        self.as_view().to_f32_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_access_is_exact() {
        let big = (1i64 << 53) + 1;
        let desc = TensorDesc::new("l", DType::Int64, &[2]);
        let mut data: Vec<u8> = [big, i64::MIN].iter().flat_map(|v| v.to_le_bytes()).collect();
        let src = TensorView::new(&desc, &data);
        assert_eq!(src.index(0), big);
        assert_ne!(src.value(0) as i64, big);

        let narrow = TensorDesc::new("n", DType::Int16, &[2]);
        let mut out = vec![0u8; 4];
        TensorViewMut::new(&narrow, &mut out).copy_from(&src);
        assert_eq!(out, [i16::MAX.to_le_bytes(), i16::MIN.to_le_bytes()].concat());

        let mut dst = TensorViewMut::new(&desc, &mut data);
        dst.set_index(1, big - 2);
        assert_eq!(dst.as_view().index(1), big - 2);

        let float = TensorDesc::new("f", DType::Float32, &[1]);
        let mut f = 2.9f32.to_le_bytes().to_vec();
        assert_eq!(TensorView::new(&float, &f).index(0), 2);
        TensorViewMut::new(&float, &mut f).set_index(0, -3);
        assert_eq!(f32::from_le_bytes([f[0], f[1], f[2], f[3]]), -3.0);
    }

    #[test]
    fn test_dtype_storage() {
        assert_eq!(DType::Float32.storage_bytes(10), Some(40));
        assert_eq!(DType::Int16.storage_bytes(3), Some(6));
        assert_eq!(DType::Int64.storage_bytes(usize::MAX), None);
    }

    #[test]
    fn test_dtype_serde_names() {
        let json = serde_json::to_string(&DType::UInt8).unwrap();
        assert_eq!(json, "\"uint8\"");
        let dt: DType = serde_json::from_str("\"float16\"").unwrap();
        assert_eq!(dt, DType::Float16);
    }

    #[test]
    fn test_int8_quantize_saturates() {
        let desc = TensorDesc::new("q", DType::Int8, &[3])
            .with_quant(Quantization::per_tensor(0.5, -1));
        let mut buf = [0u8; 3];
        let mut t = TensorViewMut::new(&desc, &mut buf);
        t.set_real(0, 1.0);
        t.set_real(1, 1000.0);
        t.set_real(2, -1000.0);
        assert_eq!(t.value(0), 1.0); // 1.0 / 0.5 - 1
        assert_eq!(t.value(1), 127.0);
        assert_eq!(t.value(2), -128.0);
        assert!((t.as_view().real(0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_per_channel_real() {
        let desc = TensorDesc::new("w", DType::Int8, &[2, 2])
            .with_quant(Quantization::per_channel(vec![1.0, 0.5], vec![0, 0], 0));
        let buf = [2u8, 4, 2, 4];
        let v = TensorView::new(&desc, &buf);
        assert_eq!(v.to_f32_vec(), vec![2.0, 4.0, 1.0, 2.0]);
    }

    #[test]
    fn test_float16_roundtrip() {
        let desc = TensorDesc::new("h", DType::Float16, &[2]);
        let mut buf = [0u8; 4];
        let mut t = TensorViewMut::new(&desc, &mut buf);
        t.write_f32(&[1.5, -2.25]).unwrap();
        assert_eq!(t.to_f32_vec(), vec![1.5, -2.25]);
    }

    #[test]
    fn test_write_f32_len_mismatch() {
        let desc = TensorDesc::new("x", DType::Float32, &[2]);
        let mut buf = [0u8; 8];
        let mut t = TensorViewMut::new(&desc, &mut buf);
        assert!(t.write_f32(&[1.0]).is_err());
    }

    #[test]
    fn test_copy_from_requantizes() {
        let src_desc = TensorDesc::new("f", DType::Float32, &[2]);
        let src_buf: Vec<u8> = [0.5f32, -1.0].iter().flat_map(|v| v.to_le_bytes()).collect();
        let src = TensorView::new(&src_desc, &src_buf);
        let dst_desc = TensorDesc::new("q", DType::Int8, &[2]).with_quant(Quantization::per_tensor(0.25, 0));
        let mut dst_buf = [0u8; 2];
        let mut dst = TensorViewMut::new(&dst_desc, &mut dst_buf);
        dst.copy_from(&src);
        assert_eq!(dst.value(0), 2.0);
        assert_eq!(dst.value(1), -4.0);
    }
}
