//! Operator registry: fixed-capacity table from operator code to kernel.
//!
//! The registry starts empty and is populated explicitly before any
//! interpreter is built from it. Built-in kinds resolve through a dense
//! slot table indexed by the kind's discriminant; custom names resolve
//! through a hash map. Both lookups are O(1).

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ExecutionError, RegistrationError, ShapeError};
use crate::ops::{self, EvalContext, PrepareContext};

/// Default number of registry slots.
pub const DEFAULT_CAPACITY: usize = 128;

macro_rules! op_kinds {
    ($($kind:ident),* $(,)?) => {
        /// Closed set of built-in operator kinds.
        #[repr(C)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum OpKind {
            $($kind),*
        }

        impl OpKind {
            /// Every kind, in declaration order.
            pub const ALL: &'static [OpKind] = &[$(OpKind::$kind),*];

            pub const COUNT: usize = Self::ALL.len();

            pub fn name(&self) -> &'static str {
                match self {
                    $(OpKind::$kind => stringify!($kind)),*
                }
            }
        }
    };
}

op_kinds! {
    Abs,
    Add,
    AddN,
    ArgMax,
    ArgMin,
    AssignVariable,
    AveragePool2D,
    BatchMatMul,
    BatchToSpaceNd,
    BroadcastArgs,
    BroadcastTo,
    CallOnce,
    Cast,
    Ceil,
    CircularBuffer,
    Concatenation,
    Conv2D,
    Cos,
    CumSum,
    Delay,
    DepthToSpace,
    DepthwiseConv2D,
    Dequantize,
    DetectionPostprocess,
    Div,
    EmbeddingLookup,
    Energy,
    Elu,
    Equal,
    EthosU,
    Exp,
    ExpandDims,
    FftAutoScale,
    Fill,
    FilterBank,
    FilterBankLog,
    FilterBankSquareRoot,
    FilterBankSpectralSubtraction,
    Floor,
    FloorDiv,
    FloorMod,
    Framer,
    FullyConnected,
    Gather,
    GatherNd,
    Greater,
    GreaterEqual,
    HardSwish,
    If,
    Irfft,
    L2Normalization,
    L2Pool2D,
    LeakyRelu,
    Less,
    LessEqual,
    Log,
    LogicalAnd,
    LogicalNot,
    LogicalOr,
    Logistic,
    LogSoftmax,
    Maximum,
    MaxPool2D,
    MirrorPad,
    Mean,
    Minimum,
    Mul,
    Neg,
    NotEqual,
    OverlapAdd,
    Pack,
    Pad,
    PadV2,
    Pcan,
    Prelu,
    Quantize,
    ReadVariable,
    ReduceMax,
    Relu,
    Relu6,
    Reshape,
    ResizeBilinear,
    ResizeNearestNeighbor,
    Rfft,
    Round,
    Rsqrt,
    SelectV2,
    Shape,
    Sin,
    Slice,
    Softmax,
    SpaceToBatchNd,
    SpaceToDepth,
    Split,
    SplitV,
    Squeeze,
    Sqrt,
    Square,
    SquaredDifference,
    StridedSlice,
    Stacker,
    Sub,
    Sum,
    Svdf,
    Tanh,
    TransposeConv,
    Transpose,
    Unpack,
    UnidirectionalSequenceLstm,
    VarHandle,
    While,
    Window,
    ZerosLike,
}

impl OpKind {
    /// The built-in kernel for this kind, if the crate ships one.
    pub fn builtin_kernel(&self) -> Option<FnKernel> {
        ops::BUILTIN_KERNELS
            .iter()
            .find(|(kind, _)| kind == self)
            .map(|(_, kernel)| *kernel)
    }

    pub fn has_builtin_kernel(&self) -> bool {
        self.builtin_kernel().is_some()
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for OpKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OpKind::ALL
            .iter()
            .copied()
            .find(|k| k.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown operator kind '{}'", s))
    }
}

/// How a node names its operator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorCode {
    Builtin(OpKind),
    Custom(String),
}

impl fmt::Display for OperatorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperatorCode::Builtin(kind) => write!(f, "{}", kind),
            OperatorCode::Custom(name) => write!(f, "custom:{}", name),
        }
    }
}

impl From<OpKind> for OperatorCode {
    fn from(kind: OpKind) -> Self {
        OperatorCode::Builtin(kind)
    }
}

/// A kernel: shape inference at planning time, execution at invoke time.
pub trait Kernel: Send + Sync {
    /// Validate operands, infer output shapes and request scratch memory.
    fn prepare(&self, ctx: &mut PrepareContext<'_>) -> Result<(), ShapeError>;

    /// Compute outputs from inputs. Must not allocate.
    fn eval(&self, ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError>;
}

pub type PrepareFn = fn(&mut PrepareContext<'_>) -> Result<(), ShapeError>;
pub type EvalFn = fn(&mut EvalContext<'_>) -> Result<(), ExecutionError>;

/// Kernel built from a pair of plain functions.
#[derive(Clone, Copy)]
pub struct FnKernel {
    pub prepare: PrepareFn,
    pub eval: EvalFn,
}

impl FnKernel {
    pub const fn new(prepare: PrepareFn, eval: EvalFn) -> Self {
        Self { prepare, eval }
    }
}

impl Kernel for FnKernel {
    fn prepare(&self, ctx: &mut PrepareContext<'_>) -> Result<(), ShapeError> {
        (self.prepare)(ctx)
    }

    fn eval(&self, ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
        (self.eval)(ctx)
    }
}

impl fmt::Debug for FnKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnKernel")
    }
}

struct Entry {
    code: OperatorCode,
    kernel: Box<dyn Kernel>,
}

/// Fixed-capacity operator registry.
pub struct OpRegistry {
    entries: Vec<Entry>,
    builtin_slots: [Option<u16>; OpKind::COUNT],
    custom_slots: HashMap<String, u16>,
    capacity: usize,
}

impl OpRegistry {
    /// Empty registry with [`DEFAULT_CAPACITY`] slots.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.min(u16::MAX as usize);
        Self {
            entries: Vec::with_capacity(capacity),
            builtin_slots: [None; OpKind::COUNT],
            custom_slots: HashMap::new(),
            capacity,
        }
    }

    /// Register the built-in kernel for `kind`.
    pub fn register(&mut self, kind: OpKind) -> Result<(), RegistrationError> {
        let kernel = kind.builtin_kernel().ok_or(RegistrationError::Unsupported(kind))?;
        self.register_kernel(kind, kernel)
    }

    /// Register a caller-supplied kernel for a built-in kind.
    pub fn register_kernel<K>(&mut self, kind: OpKind, kernel: K) -> Result<(), RegistrationError>
    where
        K: Kernel + 'static,
    {
        if self.builtin_slots[kind as usize].is_some() {
            return Err(RegistrationError::Duplicate(kind.name().to_string()));
        }
        let slot = self.push(OperatorCode::Builtin(kind), Box::new(kernel))?;
        self.builtin_slots[kind as usize] = Some(slot);
        Ok(())
    }

    /// Register a named custom operator.
    pub fn register_custom<K>(&mut self, name: &str, kernel: K) -> Result<(), RegistrationError>
    where
        K: Kernel + 'static,
    {
        if name.is_empty() {
            return Err(RegistrationError::InvalidName);
        }
        if self.custom_slots.contains_key(name) {
            return Err(RegistrationError::Duplicate(format!("custom:{}", name)));
        }
        let slot = self.push(OperatorCode::Custom(name.to_string()), Box::new(kernel))?;
        self.custom_slots.insert(name.to_string(), slot);
        Ok(())
    }

    /// Register every kind that has a built-in kernel and is not present yet.
    pub fn register_all_builtins(&mut self) -> Result<(), RegistrationError> {
        for (kind, kernel) in ops::BUILTIN_KERNELS {
            if !self.contains(&OperatorCode::Builtin(*kind)) {
                self.register_kernel(*kind, *kernel)?;
            }
        }
        Ok(())
    }

    fn push(&mut self, code: OperatorCode, kernel: Box<dyn Kernel>) -> Result<u16, RegistrationError> {
        if self.entries.len() >= self.capacity {
            return Err(RegistrationError::CapacityExceeded { capacity: self.capacity });
        }
        tracing::debug!(op = %code, slot = self.entries.len(), "registered operator");
        self.entries.push(Entry { code, kernel });
        Ok((self.entries.len() - 1) as u16)
    }

    /// Resolve an operator code to its kernel.
    pub fn find(&self, code: &OperatorCode) -> Option<&dyn Kernel> {
        let slot = match code {
            OperatorCode::Builtin(kind) => self.builtin_slots[*kind as usize]?,
            OperatorCode::Custom(name) => *self.custom_slots.get(name.as_str())?,
        };
        self.entries.get(slot as usize).map(|e| e.kernel.as_ref())
    }

    pub fn contains(&self, code: &OperatorCode) -> bool {
        self.find(code).is_some()
    }

    /// Registered operator codes in registration order.
    pub fn codes(&self) -> impl Iterator<Item = &OperatorCode> {
        self.entries.iter().map(|e| &e.code)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for OpRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for OpRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpRegistry")
            .field("ops", &self.entries.iter().map(|e| e.code.to_string()).collect::<Vec<_>>())
            .field("capacity", &self.capacity)
            .finish()
    }
}
