//! Interpreter: binds a verified model and a registry to an owned arena.
//!
//! Lifecycle: `Constructed` → [`allocate_tensors`](Interpreter::allocate_tensors)
//! → `Allocated` → any number of [`invoke`](Interpreter::invoke) calls. A
//! failed allocation, including failing to reserve the arena itself, moves
//! the interpreter to `Failed` for good.

use crate::arena::Arena;
use crate::error::{Error, Result};
use crate::format::Model;
use crate::plan::{Binding, ExecutionPlan};
use crate::registry::OpRegistry;
use crate::tensor::{TensorView, TensorViewMut};

/// Interpreter lifecycle state.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Constructed,
    Allocated,
    Failed,
}

/// Runs one model with one registry inside a fixed-size arena.
pub struct Interpreter<'m, 'r> {
    model: &'m Model<'m>,
    registry: &'r OpRegistry,
    arena_size: usize,
    arena: Option<Arena>,
    plan: Option<ExecutionPlan<'r>>,
    state: State,
}

impl<'m, 'r> Interpreter<'m, 'r> {
    /// Bind `model` and `registry`. The arena of `arena_size` bytes is
    /// reserved by [`allocate_tensors`](Self::allocate_tensors).
    pub fn new(model: &'m Model<'m>, registry: &'r OpRegistry, arena_size: usize) -> Self {
        Self { model, registry, arena_size, arena: None, plan: None, state: State::Constructed }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn model(&self) -> &'m Model<'m> {
        self.model
    }

    /// Plan the whole graph and place every tensor in the arena.
    pub fn allocate_tensors(&mut self) -> Result<()> {
        match self.state {
            State::Constructed => {}
            State::Allocated => return Err(Error::InvalidState("tensors already allocated")),
            State::Failed => return Err(Error::InvalidState("a previous allocation failed")),
        }
        let built = Arena::new(self.arena_size).map_err(Error::from).and_then(|mut arena| {
            let plan = ExecutionPlan::build(self.model, self.registry, &mut arena)?;
            Ok((arena, plan))
        });
        match built {
            Ok((arena, plan)) => {
                tracing::info!(
                    steps = plan.steps().len(),
                    used = arena.used(),
                    capacity = arena.capacity(),
                    "allocated tensors"
                );
                self.arena = Some(arena);
                self.plan = Some(plan);
                self.state = State::Allocated;
                Ok(())
            }
            Err(e) => {
                tracing::debug!(error = %e, "allocation failed");
                self.state = State::Failed;
                Err(e)
            }
        }
    }

    /// Run every step once. On a kernel failure the outputs are undefined
    /// but the interpreter stays usable.
    pub fn invoke(&mut self) -> Result<()> {
        let (plan, arena) = match (&self.plan, &mut self.arena, self.state) {
            (Some(plan), Some(arena), State::Allocated) => (plan, arena),
            (_, _, State::Failed) => return Err(Error::InvalidState("a previous allocation failed")),
            _ => return Err(Error::InvalidState("tensors not allocated")),
        };
        plan.run(self.model, arena.as_mut_slice())?;
        Ok(())
    }

    pub fn inputs_size(&self) -> usize {
        self.model.inputs().len()
    }

    pub fn outputs_size(&self) -> usize {
        self.model.outputs().len()
    }

    /// Arena bytes claimed by the plan; zero before allocation.
    pub fn arena_used_bytes(&self) -> usize {
        self.arena.as_ref().map_or(0, Arena::used)
    }

    pub fn arena_capacity(&self) -> usize {
        self.arena_size
    }

    pub fn plan(&self) -> Option<&ExecutionPlan<'r>> {
        self.plan.as_ref()
    }

    pub fn input(&self, n: usize) -> Option<TensorView<'_>> {
        self.tensor(*self.model.inputs().get(n)?)
    }

    pub fn output(&self, n: usize) -> Option<TensorView<'_>> {
        self.tensor(*self.model.outputs().get(n)?)
    }

    pub fn input_mut(&mut self, n: usize) -> Option<TensorViewMut<'_>> {
        let t = *self.model.inputs().get(n)?;
        self.tensor_mut(t)
    }

    /// `None` for constant outputs, which live in the model buffer.
    pub fn output_mut(&mut self, n: usize) -> Option<TensorViewMut<'_>> {
        let t = *self.model.outputs().get(n)?;
        self.tensor_mut(t)
    }

    /// Any allocated tensor by model index.
    pub fn tensor(&self, t: usize) -> Option<TensorView<'_>> {
        let desc = self.model.tensor(t)?;
        let data = match self.plan.as_ref()?.binding(t)? {
            Binding::Arena(range) => self.arena.as_ref()?.bytes(range.clone())?,
            Binding::Constant => self.model.const_data(t)?,
            Binding::Unbound => return None,
        };
        Some(TensorView::new(desc, data))
    }

    fn tensor_mut(&mut self, t: usize) -> Option<TensorViewMut<'_>> {
        let desc = self.model.tensor(t)?;
        let range = match self.plan.as_ref()?.binding(t)? {
            Binding::Arena(range) => range.clone(),
            _ => return None,
        };
        Some(TensorViewMut::new(desc, self.arena.as_mut()?.bytes_mut(range)?))
    }

    /// Stable pointer to tensor `t`'s bytes for foreign callers; valid
    /// until the interpreter is dropped.
    ///
    /// Arena tensors may be written through it between calls. Constants
    /// point into the model buffer and must only be read.
    pub fn tensor_ptr(&self, t: usize) -> Option<*mut u8> {
        match self.plan.as_ref()?.binding(t)? {
            Binding::Arena(range) => self.arena.as_ref()?.raw_ptr(range.clone()),
            Binding::Constant => Some(self.model.const_data(t)?.as_ptr() as *mut u8),
            Binding::Unbound => None,
        }
    }
}

impl std::fmt::Debug for Interpreter<'_, '_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interpreter")
            .field("state", &self.state)
            .field("arena", &self.arena)
            .field("steps", &self.plan.as_ref().map(|p| p.steps().len()))
            .finish()
    }
}
