//! Execution plan: kernel resolution, shape checking and memory planning.
//!
//! Built exactly once per interpreter. Every node is resolved against the
//! registry and prepared in declared order, then every non-constant tensor
//! and scratch buffer gets a fixed offset in the arena. Executing a step
//! only slices the arena; nothing is allocated.

use std::fmt;
use std::ops::Range;

use smallvec::SmallVec;

use crate::arena::{Arena, GreedyMemoryPlanner};
use crate::error::{Error, ExecutionError, RegistrationError, ShapeError};
use crate::format::Model;
use crate::ops::{
    EvalContext, InputViews, OutputViews, PrepareContext, TensorInfo, MAX_NODE_INPUTS, MAX_NODE_OUTPUTS,
};
use crate::registry::{Kernel, OpRegistry, OperatorCode};
use crate::tensor::{TensorView, TensorViewMut};

/// Where a tensor's bytes live at invoke time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    /// Never read or written by the plan.
    Unbound,
    /// Read-only data in the model blob.
    Constant,
    /// Fixed region of the arena.
    Arena(Range<usize>),
}

/// What a planned arena region holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    Tensor(usize),
    Scratch { node: usize },
}

/// One placed arena region and its live range in plan steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub kind: BufferKind,
    pub offset: usize,
    pub size: usize,
    pub first_use: usize,
    pub last_use: usize,
}

/// Arena regions one step writes: its outputs, then its scratch buffer.
type WriteRanges = SmallVec<[Range<usize>; MAX_NODE_OUTPUTS + 1]>;
/// Arena regions one step reads, in input order.
type ReadRanges = SmallVec<[Range<usize>; MAX_NODE_INPUTS]>;

/// A node ready to execute.
pub struct PlanStep<'r> {
    pub node: usize,
    pub op: OperatorCode,
    pub inputs: SmallVec<[Option<usize>; MAX_NODE_INPUTS]>,
    pub outputs: SmallVec<[usize; MAX_NODE_OUTPUTS]>,
    pub scratch: Option<Range<usize>>,
    writes: WriteRanges,
    reads: ReadRanges,
    kernel: &'r dyn Kernel,
}

impl fmt::Debug for PlanStep<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlanStep")
            .field("node", &self.node)
            .field("op", &self.op)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("scratch", &self.scratch)
            .finish()
    }
}

/// Complete execution plan for one model against one registry.
#[derive(Debug)]
pub struct ExecutionPlan<'r> {
    steps: Vec<PlanStep<'r>>,
    bindings: Vec<Binding>,
    placements: Vec<Placement>,
    arena_bytes: usize,
    live_bytes: Vec<usize>,
}

impl<'r> ExecutionPlan<'r> {
    /// Resolve, prepare and place every node of `model`, carving the
    /// resulting high-water mark from `arena`.
    pub fn build(model: &Model<'_>, registry: &'r OpRegistry, arena: &mut Arena) -> Result<Self, Error> {
        let n_tensors = model.num_tensors();
        let n_nodes = model.num_nodes();
        let mut steps = Vec::with_capacity(n_nodes);
        let mut scratch_sizes = Vec::with_capacity(n_nodes);

        for (k, node) in model.nodes().iter().enumerate() {
            let kernel = registry.find(&node.op).ok_or_else(|| RegistrationError::Unregistered {
                node: k,
                op: node.op.to_string(),
            })?;
            if node.inputs.len() > MAX_NODE_INPUTS || node.outputs.len() > MAX_NODE_OUTPUTS {
                return Err(ShapeError::Invalid {
                    node: k,
                    op: node.op.to_string(),
                    reason: format!(
                        "{} inputs and {} outputs exceed the limit of {} and {}",
                        node.inputs.len(),
                        node.outputs.len(),
                        MAX_NODE_INPUTS,
                        MAX_NODE_OUTPUTS
                    ),
                }
                .into());
            }

            let info = |i: usize| {
                model.tensor(i).map(|desc| TensorInfo { index: i, desc, data: model.const_data(i) })
            };
            let inputs: Vec<Option<TensorInfo<'_>>> =
                node.input_indices().map(|i| i.and_then(|i| info(i))).collect();
            let outputs: Vec<TensorInfo<'_>> = node.outputs.iter().filter_map(|&o| info(o)).collect();

            let mut ctx = PrepareContext::new(k, &node.op, &node.params, inputs, outputs);
            kernel.prepare(&mut ctx)?;
            let (inferred, scratch) = ctx.finish();

            for (&o, shape) in node.outputs.iter().zip(inferred) {
                let declared = &model.tensors()[o].shape;
                if let Some(shape) = shape {
                    if &shape != declared {
                        return Err(ShapeError::Mismatch {
                            node: k,
                            tensor: o,
                            declared: declared.clone(),
                            inferred: shape,
                        }
                        .into());
                    }
                }
            }

            tracing::debug!(node = k, op = %node.op, scratch, "prepared node");
            scratch_sizes.push(scratch);
            steps.push(PlanStep {
                node: k,
                op: node.op.clone(),
                inputs: node.input_indices().collect(),
                outputs: node.outputs.iter().copied().collect(),
                scratch: None,
                writes: WriteRanges::new(),
                reads: ReadRanges::new(),
                kernel,
            });
        }

        // Live ranges in step indices.
        let last_step = n_nodes.saturating_sub(1);
        let mut ranges: Vec<Option<(usize, usize)>> = vec![None; n_tensors];
        let mut touch = |t: usize, step: usize| {
            let r = ranges[t].get_or_insert((step, step));
            r.0 = r.0.min(step);
            r.1 = r.1.max(step);
        };
        for step in &steps {
            for &o in &step.outputs {
                touch(o, step.node);
            }
            for &i in step.inputs.iter().flatten() {
                touch(i, step.node);
            }
        }
        for &t in model.inputs().iter().chain(model.outputs()) {
            touch(t, 0);
            touch(t, last_step);
        }

        let mut planner = GreedyMemoryPlanner::new();
        let mut kinds = Vec::new();
        let mut bindings = vec![Binding::Unbound; n_tensors];
        for (t, range) in ranges.iter().enumerate() {
            let desc = &model.tensors()[t];
            if desc.is_constant() {
                bindings[t] = Binding::Constant;
            } else if let Some((first, last)) = *range {
                planner.add_buffer(desc.nbytes(), first, last);
                kinds.push(BufferKind::Tensor(t));
            }
        }
        for (k, &bytes) in scratch_sizes.iter().enumerate() {
            if bytes > 0 {
                planner.add_buffer(bytes, k, k);
                kinds.push(BufferKind::Scratch { node: k });
            }
        }

        let high_water = planner.plan();
        let region = arena.alloc(high_water)?;

        let mut placements = Vec::with_capacity(kinds.len());
        for (id, kind) in kinds.into_iter().enumerate() {
            let (Some(req), Some(offset)) = (planner.request(id), planner.offset(id)) else {
                continue;
            };
            let start = region.start + offset;
            let range = start..start + req.size;
            match kind {
                BufferKind::Tensor(t) => bindings[t] = Binding::Arena(range),
                BufferKind::Scratch { node } => steps[node].scratch = Some(range),
            }
            tracing::debug!(?kind, offset = start, size = req.size, "placed buffer");
            placements.push(Placement {
                kind,
                offset: start,
                size: req.size,
                first_use: req.first_use,
                last_use: req.last_use,
            });
        }

        for step in &mut steps {
            let arena_range = |t: usize| match &bindings[t] {
                Binding::Arena(r) => Some(r.clone()),
                _ => None,
            };
            step.writes = step.outputs.iter().map(|&o| arena_range(o).unwrap_or(0..0)).collect();
            step.writes.push(step.scratch.clone().unwrap_or(0..0));
            step.reads = step.inputs.iter().flatten().filter_map(|&i| arena_range(i)).collect();
        }

        let live_bytes = (0..n_nodes).map(|s| planner.live_bytes_at(s)).collect();
        tracing::info!(
            steps = steps.len(),
            arena_bytes = high_water,
            capacity = arena.capacity(),
            "execution plan built"
        );
        Ok(ExecutionPlan { steps, bindings, placements, arena_bytes: high_water, live_bytes })
    }

    pub fn steps(&self) -> &[PlanStep<'r>] {
        &self.steps
    }

    pub fn placements(&self) -> &[Placement] {
        &self.placements
    }

    pub fn binding(&self, tensor: usize) -> Option<&Binding> {
        self.bindings.get(tensor)
    }

    /// High-water mark of the planned layout.
    pub fn arena_bytes(&self) -> usize {
        self.arena_bytes
    }

    /// Bytes of all buffers live while step `i` runs.
    pub fn peak_live_bytes(&self, i: usize) -> Option<usize> {
        self.live_bytes.get(i).copied()
    }

    /// Run every step in order against `arena`.
    pub(crate) fn run(&self, model: &Model<'_>, arena: &mut [u8]) -> Result<(), ExecutionError> {
        for step in &self.steps {
            tracing::trace!(node = step.node, op = %step.op, "invoke step");
            self.run_step(model, step, arena)?;
        }
        Ok(())
    }

    fn run_step(&self, model: &Model<'_>, step: &PlanStep<'r>, arena: &mut [u8]) -> Result<(), ExecutionError> {
        let node = step.node;
        let missing = |slot| ExecutionError::MissingTensor { node, slot };

        for (slot, &o) in step.outputs.iter().enumerate() {
            if !matches!(self.bindings.get(o), Some(Binding::Arena(_))) {
                return Err(missing(slot));
            }
        }
        let (mut written, read) =
            split_regions(arena, &step.writes, &step.reads).ok_or(ExecutionError::Aliased { node })?;

        let mut read_iter = read.into_iter();
        let mut inputs = InputViews::new();
        for (slot, i) in step.inputs.iter().enumerate() {
            let Some(i) = *i else {
                inputs.push(None);
                continue;
            };
            let desc = model.tensor(i).ok_or(missing(slot))?;
            let data = match self.bindings.get(i) {
                Some(Binding::Constant) => model.const_data(i).ok_or(missing(slot))?,
                Some(Binding::Arena(_)) => read_iter.next().ok_or(missing(slot))?,
                _ => return Err(missing(slot)),
            };
            inputs.push(Some(TensorView::new(desc, data)));
        }

        let scratch = written.pop().unwrap_or_default();
        let mut outputs = OutputViews::new();
        for (slot, (&o, data)) in step.outputs.iter().zip(written).enumerate() {
            let desc = model.tensor(o).ok_or(missing(slot))?;
            outputs.push(TensorViewMut::new(desc, data));
        }

        let node_desc = model.node(node).ok_or(missing(0))?;
        let mut ctx = EvalContext::new(node, &step.op, &node_desc.params, inputs, outputs, scratch);
        step.kernel.eval(&mut ctx)
    }
}

/// Split `arena` into one mutable slice per `writes` range (in order) and
/// one shared slice per `reads` range (in order). `None` if any write
/// overlaps another write or a read. Empty ranges never overlap.
fn split_regions<'a>(
    arena: &'a mut [u8],
    writes: &[Range<usize>],
    reads: &[Range<usize>],
) -> Option<(SmallVec<[&'a mut [u8]; MAX_NODE_OUTPUTS + 1]>, SmallVec<[&'a [u8]; MAX_NODE_INPUTS]>)> {
    let overlaps = |a: &Range<usize>, b: &Range<usize>| {
        !a.is_empty() && !b.is_empty() && a.start < b.end && b.start < a.end
    };
    if writes.iter().chain(reads).any(|r| r.end > arena.len()) {
        return None;
    }

    let mut order: SmallVec<[usize; MAX_NODE_OUTPUTS + 1]> = (0..writes.len()).filter(|&i| !writes[i].is_empty()).collect();
    order.sort_unstable_by_key(|&i| writes[i].start);
    for pair in order.windows(2) {
        if overlaps(&writes[pair[0]], &writes[pair[1]]) {
            return None;
        }
    }
    if reads.iter().any(|r| writes.iter().any(|w| overlaps(r, w))) {
        return None;
    }

    let mut muts: SmallVec<[Option<&'a mut [u8]>; MAX_NODE_OUTPUTS + 1]> = writes
        .iter()
        .map(|w| if w.is_empty() { Some(Default::default()) } else { None })
        .collect();
    let mut gaps: SmallVec<[(usize, &'a [u8]); MAX_NODE_OUTPUTS + 2]> = SmallVec::new();
    let mut rest: &'a mut [u8] = arena;
    let mut cursor = 0;
    for &i in &order {
        let w = &writes[i];
        let (gap, tail) = std::mem::take(&mut rest).split_at_mut(w.start - cursor);
        let (region, tail) = tail.split_at_mut(w.len());
        gaps.push((cursor, &*gap));
        muts[i] = Some(region);
        rest = tail;
        cursor = w.end;
    }
    gaps.push((cursor, &*rest));

    let shared = reads
        .iter()
        .map(|r| {
            gaps.iter().find_map(|&(start, gap)| {
                (r.start >= start && r.end <= start + gap.len()).then(|| &gap[r.start - start..r.end - start])
            })
        })
        .collect::<Option<SmallVec<[&'a [u8]; MAX_NODE_INPUTS]>>>()?;
    let written = muts.into_iter().collect::<Option<SmallVec<[&'a mut [u8]; MAX_NODE_OUTPUTS + 1]>>>()?;
    Some((written, shared))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::ModelBuilder;
    use crate::ops::OpParams;
    use crate::registry::OpKind;
    use crate::tensor::{DType, TensorDesc};

    fn chain(len: usize) -> Vec<u8> {
        let mut b = ModelBuilder::new("chain");
        let mut prev = b.add_tensor(TensorDesc::new("x", DType::Float32, &[16]));
        b.set_inputs(&[prev]);
        for i in 0..len {
            let next = b.add_tensor(TensorDesc::new(&format!("t{}", i), DType::Float32, &[16]));
            b.add_node(OpKind::Relu, &[prev as i32], &[next], OpParams::default());
            prev = next;
        }
        b.set_outputs(&[prev]);
        b.to_bytes().unwrap()
    }

    fn registry(kinds: &[OpKind]) -> OpRegistry {
        let mut reg = OpRegistry::new();
        for &k in kinds {
            reg.register(k).unwrap();
        }
        reg
    }

    #[test]
    fn test_split_regions_disjoint() {
        let mut buf = [0u8; 64];
        let (w, r) = split_regions(&mut buf, &[32..48, 0..16], &[16..32, 48..64]).unwrap();
        assert_eq!(w.len(), 2);
        assert_eq!(w[0].len(), 16);
        assert_eq!(r[1].len(), 16);
    }

    #[test]
    fn test_split_regions_rejects_overlap() {
        let mut buf = [0u8; 64];
        assert!(split_regions(&mut buf, &[0..32, 16..48], &[]).is_none());
        assert!(split_regions(&mut buf, &[0..32], &[24..40]).is_none());
        assert!(split_regions(&mut buf, &[0..65], &[]).is_none());
        assert!(split_regions(&mut buf, &[0..16, 0..0], &[0..0]).is_some());
    }

    #[test]
    fn test_chain_reuses_memory() {
        let bytes = chain(6);
        let model = Model::from_bytes(&bytes).unwrap();
        let reg = registry(&[OpKind::Relu]);
        let mut arena = Arena::new(4096).unwrap();
        let plan = ExecutionPlan::build(&model, &reg, &mut arena).unwrap();
        assert_eq!(plan.steps().len(), 6);
        // Input and output live throughout; intermediates ping-pong.
        assert!(plan.arena_bytes() <= 4 * 64, "arena_bytes={}", plan.arena_bytes());
        assert_eq!(arena.used(), plan.arena_bytes());
        for s in 0..6 {
            assert!(plan.peak_live_bytes(s).unwrap() <= plan.arena_bytes());
        }
    }

    #[test]
    fn test_unregistered_op() {
        let bytes = chain(1);
        let model = Model::from_bytes(&bytes).unwrap();
        let reg = registry(&[OpKind::Add]);
        let err = ExecutionPlan::build(&model, &reg, &mut Arena::new(1024).unwrap()).unwrap_err();
        assert_eq!(
            err,
            Error::Registration(RegistrationError::Unregistered { node: 0, op: "Relu".into() })
        );
    }

    #[test]
    fn test_shape_mismatch() {
        let mut b = ModelBuilder::new("");
        let x = b.add_tensor(TensorDesc::new("x", DType::Float32, &[4]));
        let y = b.add_tensor(TensorDesc::new("y", DType::Float32, &[2, 2]));
        b.add_node(OpKind::Relu, &[x as i32], &[y], OpParams::default());
        b.set_inputs(&[x]);
        b.set_outputs(&[y]);
        let bytes = b.to_bytes().unwrap();
        let model = Model::from_bytes(&bytes).unwrap();
        let reg = registry(&[OpKind::Relu]);
        let err = ExecutionPlan::build(&model, &reg, &mut Arena::new(1024).unwrap()).unwrap_err();
        assert!(matches!(err, Error::Shape(ShapeError::Mismatch { node: 0, tensor: 1, .. })));
    }

    #[test]
    fn test_node_operand_limit() {
        let build = |n: usize| {
            let mut b = ModelBuilder::new("");
            let x = b.add_tensor(TensorDesc::new("x", DType::Float32, &[2]));
            let y = b.add_tensor(TensorDesc::new("y", DType::Float32, &[2]));
            b.add_node(OpKind::AddN, &vec![x as i32; n], &[y], OpParams::default());
            b.set_inputs(&[x]);
            b.set_outputs(&[y]);
            b.to_bytes().unwrap()
        };
        let reg = registry(&[OpKind::AddN]);
        let bytes = build(MAX_NODE_INPUTS);
        let model = Model::from_bytes(&bytes).unwrap();
        let plan = ExecutionPlan::build(&model, &reg, &mut Arena::new(1024).unwrap()).unwrap();
        assert_eq!(plan.steps()[0].reads.len(), MAX_NODE_INPUTS);
        assert_eq!(plan.steps()[0].writes.len(), 2);
        let bytes = build(MAX_NODE_INPUTS + 1);
        let model = Model::from_bytes(&bytes).unwrap();
        let err = ExecutionPlan::build(&model, &reg, &mut Arena::new(1024).unwrap()).unwrap_err();
        assert!(matches!(err, Error::Shape(ShapeError::Invalid { node: 0, .. })), "{:?}", err);
    }

    #[test]
    fn test_arena_too_small() {
        let bytes = chain(2);
        let model = Model::from_bytes(&bytes).unwrap();
        let reg = registry(&[OpKind::Relu]);
        let err = ExecutionPlan::build(&model, &reg, &mut Arena::new(64).unwrap()).unwrap_err();
        assert!(matches!(err, Error::Allocation(_)));
    }

    #[test]
    fn test_placements_never_collide_while_live() {
        let bytes = chain(5);
        let model = Model::from_bytes(&bytes).unwrap();
        let reg = registry(&[OpKind::Relu]);
        let plan = ExecutionPlan::build(&model, &reg, &mut Arena::new(4096).unwrap()).unwrap();
        let ps = plan.placements();
        for (i, a) in ps.iter().enumerate() {
            for b in &ps[i + 1..] {
                let live = a.first_use <= b.last_use && b.first_use <= a.last_use;
                let space = a.offset < b.offset + b.size && b.offset < a.offset + a.size;
                assert!(!(live && space), "{:?} collides with {:?}", a, b);
            }
        }
    }

    #[test]
    fn test_run_chain() {
        let bytes = chain(2);
        let model = Model::from_bytes(&bytes).unwrap();
        let reg = registry(&[OpKind::Relu]);
        let mut arena = Arena::new(1024).unwrap();
        let plan = ExecutionPlan::build(&model, &reg, &mut arena).unwrap();
        let Some(Binding::Arena(input)) = plan.binding(0).cloned() else { panic!("input unbound") };
        let values: Vec<u8> = (0..16).flat_map(|i| (i as f32 - 8.0).to_le_bytes()).collect();
        arena.bytes_mut(input).unwrap().copy_from_slice(&values);
        plan.run(&model, arena.as_mut_slice()).unwrap();
        let Some(Binding::Arena(output)) = plan.binding(2).cloned() else { panic!("output unbound") };
        let out = TensorView::new(model.tensor(2).unwrap(), arena.bytes(output).unwrap()).to_f32_vec();
        assert_eq!(out[..9], [0.0; 9]);
        assert_eq!(out[15], 7.0);
    }
}
