//! `.plite` model format: a single-buffer, zero-copy model container.
//!
//! Layout:
//! ```text
//! ┌──────────────────────────────────┐
//! │ Magic: "PLTE" (4 bytes)          │
//! │ Version: u32 LE                  │
//! │ Header size: u32 LE              │
//! ├──────────────────────────────────┤
//! │ Header JSON (tensors, graph)     │
//! ├──────────────────────────────────┤
//! │ Padding to 64-byte alignment     │
//! ├──────────────────────────────────┤
//! │ Constant blob (blob_len bytes)   │
//! └──────────────────────────────────┘
//! ```
//!
//! [`Model::from_bytes`] verifies the whole graph before returning; a
//! `Model` that exists is structurally sound. Constant tensor data stays
//! in the caller's buffer.

use serde::{Deserialize, Serialize};

use crate::error::VerifyError;
use crate::ops::OpParams;
use crate::registry::OperatorCode;
use crate::tensor::{BufferRef, DType, TensorDesc, TensorViewMut, MAX_RANK};

/// Magic bytes identifying a .plite file.
pub const MAGIC: &[u8; 4] = b"PLTE";

/// Current format version.
pub const VERSION: u32 = 1;

/// Magic + version + header size.
const PREAMBLE: usize = 12;

/// Alignment of the constant blob relative to the buffer start.
pub const BLOB_ALIGNMENT: usize = 64;

/// Alignment of each constant inside the blob.
const CONST_ALIGNMENT: usize = 16;

/// One operator application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDesc {
    pub op: OperatorCode,
    /// Tensor indices; `-1` marks an omitted optional input.
    pub inputs: Vec<i32>,
    pub outputs: Vec<usize>,
    #[serde(default)]
    pub params: OpParams,
}

impl NodeDesc {
    /// Input slots resolved to tensor indices, `None` where omitted.
    pub fn input_indices(&self) -> impl Iterator<Item = Option<usize>> + '_ {
        self.inputs.iter().map(|&i| usize::try_from(i).ok())
    }
}

/// Header metadata for a .plite model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelHeader {
    #[serde(default)]
    pub description: String,
    pub tensors: Vec<TensorDesc>,
    pub nodes: Vec<NodeDesc>,
    pub inputs: Vec<usize>,
    pub outputs: Vec<usize>,
    #[serde(default)]
    pub blob_len: usize,
}

/// A verified model borrowing its constant data from the caller's buffer.
#[derive(Debug, Clone)]
pub struct Model<'a> {
    header: ModelHeader,
    blob: &'a [u8],
    version: u32,
}

impl<'a> Model<'a> {
    /// Parse and verify a .plite model. Never reads past `data`.
    pub fn from_bytes(data: &'a [u8]) -> Result<Self, VerifyError> {
        if data.len() < PREAMBLE {
            return Err(VerifyError::TooSmall { needed: PREAMBLE, actual: data.len() });
        }

        if &data[0..4] != MAGIC {
            return Err(VerifyError::BadMagic);
        }

        let version = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        if version != VERSION {
            return Err(VerifyError::UnsupportedVersion(version));
        }

        let header_size = u32::from_le_bytes([data[8], data[9], data[10], data[11]]) as usize;
        let header_end = PREAMBLE
            .checked_add(header_size)
            .ok_or(VerifyError::TooSmall { needed: usize::MAX, actual: data.len() })?;
        let header_bytes = data
            .get(PREAMBLE..header_end)
            .ok_or(VerifyError::TooSmall { needed: header_end, actual: data.len() })?;

        let header_str = std::str::from_utf8(header_bytes)
            .map_err(|_| VerifyError::InvalidHeader("not valid UTF-8".into()))?;
        let header: ModelHeader =
            serde_json::from_str(header_str).map_err(|e| VerifyError::InvalidHeader(e.to_string()))?;

        let blob_start = align_up(header_end, BLOB_ALIGNMENT);
        let blob_end = blob_start
            .checked_add(header.blob_len)
            .ok_or_else(|| VerifyError::InvalidHeader("blob_len overflows".into()))?;
        let blob = data
            .get(blob_start..blob_end)
            .ok_or(VerifyError::TooSmall { needed: blob_end, actual: data.len() })?;

        verify(&header)?;
        tracing::debug!(
            tensors = header.tensors.len(),
            nodes = header.nodes.len(),
            blob_bytes = blob.len(),
            "verified model"
        );
        Ok(Model { header, blob, version })
    }

    pub fn header(&self) -> &ModelHeader {
        &self.header
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn description(&self) -> &str {
        &self.header.description
    }

    pub fn num_tensors(&self) -> usize {
        self.header.tensors.len()
    }

    pub fn num_nodes(&self) -> usize {
        self.header.nodes.len()
    }

    pub fn tensor(&self, i: usize) -> Option<&TensorDesc> {
        self.header.tensors.get(i)
    }

    pub fn tensors(&self) -> &[TensorDesc] {
        &self.header.tensors
    }

    pub fn node(&self, i: usize) -> Option<&NodeDesc> {
        self.header.nodes.get(i)
    }

    pub fn nodes(&self) -> &[NodeDesc] {
        &self.header.nodes
    }

    /// Graph input tensor indices.
    pub fn inputs(&self) -> &[usize] {
        &self.header.inputs
    }

    /// Graph output tensor indices.
    pub fn outputs(&self) -> &[usize] {
        &self.header.outputs
    }

    /// Constant data of tensor `i`, borrowed from the model buffer.
    pub fn const_data(&self, i: usize) -> Option<&'a [u8]> {
        let buf = self.header.tensors.get(i)?.buffer?;
        self.blob.get(buf.offset..buf.offset + buf.len)
    }
}

fn inconsistent(msg: String) -> VerifyError {
    VerifyError::Inconsistent(msg)
}

/// Structural checks on a parsed header.
fn verify(header: &ModelHeader) -> Result<(), VerifyError> {
    let n = header.tensors.len();

    for (i, t) in header.tensors.iter().enumerate() {
        if t.shape.len() > MAX_RANK {
            return Err(inconsistent(format!("tensor {} has rank {} > {}", i, t.shape.len(), MAX_RANK)));
        }
        if t.shape.iter().any(|&d| d == 0) {
            return Err(inconsistent(format!("tensor {} has a zero dimension {:?}", i, t.shape)));
        }
        let numel = t
            .shape
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
            .ok_or_else(|| inconsistent(format!("tensor {} element count overflows", i)))?;
        let nbytes = t
            .dtype
            .storage_bytes(numel)
            .filter(|&b| b <= isize::MAX as usize)
            .ok_or_else(|| inconsistent(format!("tensor {} byte size overflows", i)))?;
        if let Some(q) = &t.quant {
            verify_quant(i, t, q)?;
        }
        if let Some(BufferRef { offset, len }) = t.buffer {
            if len != nbytes {
                return Err(inconsistent(format!("tensor {} buffer holds {} bytes, needs {}", i, len, nbytes)));
            }
            let in_blob = offset.checked_add(len).map_or(false, |end| end <= header.blob_len);
            if !in_blob {
                return Err(inconsistent(format!("tensor {} buffer lies outside the blob", i)));
            }
        }
    }

    let mut is_input = vec![false; n];
    for &i in &header.inputs {
        let t = header.tensors.get(i).ok_or_else(|| inconsistent(format!("graph input {} out of range", i)))?;
        if t.is_constant() {
            return Err(inconsistent(format!("graph input {} is a constant", i)));
        }
        if std::mem::replace(&mut is_input[i], true) {
            return Err(inconsistent(format!("graph input {} listed twice", i)));
        }
    }
    for &o in &header.outputs {
        if o >= n {
            return Err(inconsistent(format!("graph output {} out of range", o)));
        }
    }

    // Walk nodes in declared order: every input must already be available.
    let mut available: Vec<bool> = header.tensors.iter().map(|t| t.is_constant()).collect();
    for &i in &header.inputs {
        available[i] = true;
    }
    let mut produced = vec![false; n];
    for (k, node) in header.nodes.iter().enumerate() {
        if node.outputs.is_empty() {
            return Err(inconsistent(format!("node {} has no outputs", k)));
        }
        if let OperatorCode::Custom(name) = &node.op {
            if name.is_empty() {
                return Err(inconsistent(format!("node {} has an empty custom operator name", k)));
            }
        }
        for &i in &node.inputs {
            if i == -1 {
                continue;
            }
            let idx = usize::try_from(i)
                .ok()
                .filter(|&i| i < n)
                .ok_or_else(|| inconsistent(format!("node {} input {} out of range", k, i)))?;
            if !available[idx] {
                return Err(inconsistent(format!(
                    "node {} reads tensor {} before it is produced",
                    k, idx
                )));
            }
        }
        for &o in &node.outputs {
            if o >= n {
                return Err(inconsistent(format!("node {} output {} out of range", k, o)));
            }
            if is_input[o] || header.tensors[o].is_constant() {
                return Err(inconsistent(format!("node {} writes input or constant tensor {}", k, o)));
            }
            if std::mem::replace(&mut produced[o], true) {
                return Err(inconsistent(format!("tensor {} has more than one producer", o)));
            }
        }
        for &o in &node.outputs {
            available[o] = true;
        }
    }

    for &o in &header.outputs {
        if !available[o] {
            return Err(inconsistent(format!("graph output {} is never produced", o)));
        }
    }
    Ok(())
}

fn verify_quant(i: usize, t: &TensorDesc, q: &crate::tensor::Quantization) -> Result<(), VerifyError> {
    if q.scale.is_empty() || q.zero_point.is_empty() {
        return Err(inconsistent(format!("tensor {} has empty quantization parameters", i)));
    }
    if q.zero_point.len() != 1 && q.zero_point.len() != q.scale.len() {
        return Err(inconsistent(format!("tensor {} has {} scales but {} zero points", i, q.scale.len(), q.zero_point.len())));
    }
    if q.scale.iter().any(|s| !s.is_finite() || *s <= 0.0) {
        return Err(inconsistent(format!("tensor {} has a non-positive or non-finite scale", i)));
    }
    if q.is_per_channel() {
        let extent = t.shape.get(q.quantized_dimension).copied();
        if extent != Some(q.scale.len()) {
            return Err(inconsistent(format!(
                "tensor {} has {} channel scales for dimension {} of shape {:?}",
                i,
                q.scale.len(),
                q.quantized_dimension,
                t.shape
            )));
        }
    }
    Ok(())
}

/// Round `n` up to the next multiple of `align`.
fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// Builder for creating .plite models programmatically.
#[derive(Debug, Default)]
pub struct ModelBuilder {
    header: ModelHeader,
    blob: Vec<u8>,
}

impl ModelBuilder {
    pub fn new(description: &str) -> Self {
        Self {
            header: ModelHeader { description: description.to_string(), ..Default::default() },
            blob: Vec::new(),
        }
    }

    /// Add a non-constant tensor, returning its index.
    pub fn add_tensor(&mut self, desc: TensorDesc) -> usize {
        self.header.tensors.push(desc);
        self.header.tensors.len() - 1
    }

    /// Add a constant tensor backed by raw little-endian bytes.
    pub fn add_const(&mut self, mut desc: TensorDesc, data: &[u8]) -> usize {
        let padding = align_up(self.blob.len(), CONST_ALIGNMENT) - self.blob.len();
        self.blob.extend(std::iter::repeat(0u8).take(padding));
        desc.buffer = Some(BufferRef { offset: self.blob.len(), len: data.len() });
        self.blob.extend_from_slice(data);
        self.add_tensor(desc)
    }

    pub fn add_const_f32(&mut self, name: &str, shape: &[usize], values: &[f32]) -> usize {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.add_const(TensorDesc::new(name, DType::Float32, shape), &bytes)
    }

    pub fn add_const_i32(&mut self, name: &str, shape: &[usize], values: &[i32]) -> usize {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.add_const(TensorDesc::new(name, DType::Int32, shape), &bytes)
    }

    /// Add a constant from real values, quantized with `desc`'s parameters.
    pub fn add_const_quantized(&mut self, desc: TensorDesc, real: &[f32]) -> usize {
        let mut bytes = vec![0u8; desc.nbytes()];
        let mut view = TensorViewMut::new(&desc, &mut bytes);
        for (i, &v) in real.iter().enumerate().take(desc.numel()) {
            view.set_real(i, v as f64);
        }
        self.add_const(desc, &bytes)
    }

    /// Append a node; returns its index.
    pub fn add_node(
        &mut self,
        op: impl Into<OperatorCode>,
        inputs: &[i32],
        outputs: &[usize],
        params: OpParams,
    ) -> usize {
        self.header.nodes.push(NodeDesc {
            op: op.into(),
            inputs: inputs.to_vec(),
            outputs: outputs.to_vec(),
            params,
        });
        self.header.nodes.len() - 1
    }

    pub fn set_inputs(&mut self, inputs: &[usize]) {
        self.header.inputs = inputs.to_vec();
    }

    pub fn set_outputs(&mut self, outputs: &[usize]) {
        self.header.outputs = outputs.to_vec();
    }

    pub fn header(&self) -> &ModelHeader {
        &self.header
    }

    /// Serialize to .plite bytes. The header is not verified here.
    pub fn to_bytes(&self) -> Result<Vec<u8>, VerifyError> {
        let mut header = self.header.clone();
        header.blob_len = self.blob.len();
        let header_json =
            serde_json::to_vec(&header).map_err(|e| VerifyError::InvalidHeader(e.to_string()))?;
        let header_size = header_json.len();
        let header_len = u32::try_from(header_size)
            .map_err(|_| VerifyError::InvalidHeader("header exceeds 4 GiB".into()))?;

        let blob_start = align_up(PREAMBLE + header_size, BLOB_ALIGNMENT);
        let padding = blob_start - (PREAMBLE + header_size);

        let mut buf = Vec::with_capacity(blob_start + self.blob.len());
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&VERSION.to_le_bytes());
        buf.extend_from_slice(&header_len.to_le_bytes());
        buf.extend_from_slice(&header_json);
        buf.extend(std::iter::repeat(0u8).take(padding));
        buf.extend_from_slice(&self.blob);
        Ok(buf)
    }
}
