//! Operator parameters carried by each graph node.

use serde::{Deserialize, Serialize};

/// Activation fused into the output of arithmetic, convolution and
/// fully-connected kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    #[default]
    None,
    Relu,
    #[serde(rename = "relu_n1_to_1")]
    ReluN1To1,
    Relu6,
    Tanh,
    SignBit,
}

impl Activation {
    #[inline]
    pub fn apply(&self, v: f64) -> f64 {
        match self {
            Activation::None => v,
            Activation::Relu => v.max(0.0),
            Activation::ReluN1To1 => v.clamp(-1.0, 1.0),
            Activation::Relu6 => v.clamp(0.0, 6.0),
            Activation::Tanh => v.tanh(),
            Activation::SignBit => {
                if v.is_sign_negative() { 1.0 } else { 0.0 }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Padding {
    Same,
    #[default]
    Valid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MirrorMode {
    #[default]
    Reflect,
    Symmetric,
}

/// Union of every built-in operator's options. Unused fields keep their
/// defaults and are omitted from the serialized header.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpParams {
    #[serde(skip_serializing_if = "is_default")]
    pub activation: Activation,
    #[serde(skip_serializing_if = "is_default")]
    pub padding: Padding,
    /// `[height, width]` strides.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stride: Option<[usize; 2]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dilation: Option<[usize; 2]>,
    /// Pooling window `[height, width]`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<[usize; 2]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth_multiplier: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub axis: Option<i32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub axes: Vec<i32>,
    #[serde(skip_serializing_if = "is_default")]
    pub keep_dims: bool,
    /// Target shape for Reshape/BroadcastTo; one `-1` may be inferred.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub new_shape: Vec<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub perm: Vec<usize>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub begin: Vec<i64>,
    /// Slice sizes (`-1` = to the end) or StridedSlice end indices.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub size: Vec<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub end: Vec<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub strides: Vec<i64>,
    /// StridedSlice bit masks, one bit per dimension.
    #[serde(skip_serializing_if = "is_default")]
    pub begin_mask: u32,
    #[serde(skip_serializing_if = "is_default")]
    pub end_mask: u32,
    #[serde(skip_serializing_if = "is_default")]
    pub shrink_axis_mask: u32,
    /// `[before, after]` per dimension.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub paddings: Vec<[usize; 2]>,
    #[serde(skip_serializing_if = "is_default")]
    pub mirror_mode: MirrorMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alpha: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub beta: Option<f32>,
    /// Fill value, or PadV2 constant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_splits: Option<usize>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub size_splits: Vec<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_size: Option<usize>,
    #[serde(skip_serializing_if = "is_default")]
    pub exclusive: bool,
    #[serde(skip_serializing_if = "is_default")]
    pub reverse: bool,
    #[serde(skip_serializing_if = "is_default")]
    pub adj_x: bool,
    #[serde(skip_serializing_if = "is_default")]
    pub adj_y: bool,
    #[serde(skip_serializing_if = "is_default")]
    pub align_corners: bool,
    #[serde(skip_serializing_if = "is_default")]
    pub half_pixel_centers: bool,
    /// FullyConnected: keep leading input dims instead of flattening.
    #[serde(skip_serializing_if = "is_default")]
    pub keep_num_dims: bool,
}

fn is_default<T: Default + PartialEq>(v: &T) -> bool {
    *v == T::default()
}

impl OpParams {
    pub fn stride(&self) -> (usize, usize) {
        let [h, w] = self.stride.unwrap_or([1, 1]);
        (h.max(1), w.max(1))
    }

    pub fn dilation(&self) -> (usize, usize) {
        let [h, w] = self.dilation.unwrap_or([1, 1]);
        (h.max(1), w.max(1))
    }

    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    pub fn with_axis(mut self, axis: i32) -> Self {
        self.axis = Some(axis);
        self
    }

    pub fn with_new_shape(mut self, shape: &[i64]) -> Self {
        self.new_shape = shape.to_vec();
        self
    }
}
