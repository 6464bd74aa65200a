//! State and memory protocol shared by edges with learned parameters.
//!
//! An untied edge owns a weight and a bias slot in the parameter arena and
//! the matching gradient slots. A tied edge owns nothing and only names the
//! edge whose parameters it uses; the graph resolves that id whenever the
//! tied edge reads or writes parameters.

use log::debug;
use ndarray::{ArrayView2, ArrayViewMut2};

use crate::backend::{Backend, ScratchPool};
use crate::edge::Edge;
use crate::error::{EdgeError, Result};
use crate::memory::{Arena, Region, Slot};
use crate::network::EdgeId;
use crate::optimizer::{Optimizer, OptimizerFactory};
use crate::WeightPrecision;

/// Shapes of an edge's parameters when it owns them.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub struct ParamShape {
    pub weight_rows: usize,
    pub weight_cols: usize,
    /// Zero when the edge has no bias.
    pub bias_len: usize,
}

impl ParamShape {
    pub fn len(&self) -> usize {
        self.weight_rows * self.weight_cols + self.bias_len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Splits `region` into a `(rows, cols)` weight slot followed by a
    /// `(1, bias_len)` bias slot.
    pub fn carve(&self, region: Region) -> Result<ParamSlots> {
        let weight_len = self.weight_rows * self.weight_cols;
        let weights = region
            .slice(0, weight_len)?
            .shaped(self.weight_rows, self.weight_cols)?;
        let bias = if self.bias_len > 0 {
            Some(
                region
                    .slice(weight_len, weight_len + self.bias_len)?
                    .shaped(1, self.bias_len)?,
            )
        } else {
            None
        };
        if region.len() != self.len() {
            return Err(EdgeError::Shape(format!(
                "region of {} elements handed to parameters of {} elements",
                region.len(),
                self.len()
            )));
        }
        Ok(ParamSlots { weights, bias })
    }
}

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub struct ParamSlots {
    pub weights: Slot,
    pub bias: Option<Slot>,
}

impl ParamSlots {
    pub fn views<'a>(&self, arena: &'a Arena) -> Result<ParamViews<'a>> {
        Ok(ParamViews {
            weights: arena.view(&self.weights)?,
            bias: match self.bias {
                Some(ref bias) => Some(arena.view(bias)?),
                None => None,
            },
        })
    }

    pub fn views_mut<'a>(&self, arena: &'a mut Arena) -> Result<GradViews<'a>> {
        match self.bias {
            Some(ref bias) => {
                let (weights, bias) = arena.view_pair_mut(&self.weights, bias)?;
                Ok(GradViews {
                    weights,
                    bias: Some(bias),
                })
            }
            None => Ok(GradViews {
                weights: arena.view_mut(&self.weights)?,
                bias: None,
            }),
        }
    }
}

/// Read-only parameters handed to a forward or backward pass.
pub struct ParamViews<'a> {
    pub weights: ArrayView2<'a, WeightPrecision>,
    pub bias: Option<ArrayView2<'a, WeightPrecision>>,
}

/// Writable tensors handed to a gradient pass.
pub struct GradViews<'a> {
    pub weights: ArrayViewMut2<'a, WeightPrecision>,
    pub bias: Option<ArrayViewMut2<'a, WeightPrecision>>,
}

/// Memory an owning edge has been bound to.
#[derive(Debug, Default)]
pub struct OwnedParams {
    params: Option<ParamSlots>,
    grads: Option<ParamSlots>,
    weight_optimizer: Option<Box<dyn Optimizer>>,
    bias_optimizer: Option<Box<dyn Optimizer>>,
    num_grads_received: usize,
}

#[derive(Debug)]
pub enum ParamBinding {
    Owned(OwnedParams),
    TiedTo(EdgeId),
}

/// Weighted-edge state: who owns the parameters and how gradients scale.
#[derive(Debug)]
pub struct WeightState {
    binding: ParamBinding,
    has_no_bias: bool,
    scale_gradients: WeightPrecision,
}

impl WeightState {
    pub fn new(has_no_bias: bool, scale_gradients: WeightPrecision) -> WeightState {
        WeightState {
            binding: ParamBinding::Owned(OwnedParams::default()),
            has_no_bias,
            scale_gradients,
        }
    }

    pub fn binding(&self) -> &ParamBinding {
        &self.binding
    }

    pub fn has_bias(&self) -> bool {
        !self.has_no_bias
    }

    pub fn scale_gradients(&self) -> WeightPrecision {
        self.scale_gradients
    }

    pub fn tied_to(&self) -> Option<EdgeId> {
        match self.binding {
            ParamBinding::TiedTo(id) => Some(id),
            ParamBinding::Owned(_) => None,
        }
    }

    pub fn is_tied(&self) -> bool {
        self.tied_to().is_some()
    }

    pub(crate) fn tie(&mut self, target: EdgeId) {
        self.binding = ParamBinding::TiedTo(target);
    }

    fn owned(&self, name: &str) -> Result<&OwnedParams> {
        match self.binding {
            ParamBinding::Owned(ref owned) => Ok(owned),
            ParamBinding::TiedTo(_) => Err(EdgeError::Configuration(format!(
                "edge `{}` is tied and owns no parameters",
                name
            ))),
        }
    }

    pub fn param_slots(&self, name: &str) -> Result<ParamSlots> {
        self.owned(name)?
            .params
            .ok_or_else(|| EdgeError::Unbound(name.to_string()))
    }

    pub fn grad_slots(&self, name: &str) -> Result<ParamSlots> {
        self.owned(name)?
            .grads
            .ok_or_else(|| EdgeError::Unbound(name.to_string()))
    }

    pub fn weight_optimizer(&self) -> Option<&dyn Optimizer> {
        match self.binding {
            ParamBinding::Owned(ref owned) => owned.weight_optimizer.as_deref(),
            ParamBinding::TiedTo(_) => None,
        }
    }

    pub fn bias_optimizer(&self) -> Option<&dyn Optimizer> {
        match self.binding {
            ParamBinding::Owned(ref owned) => owned.bias_optimizer.as_deref(),
            ParamBinding::TiedTo(_) => None,
        }
    }

    /// Gradient contributions since the last reset. Only meaningful on the
    /// owning edge; tied edges report zero.
    pub fn num_grads_received(&self) -> usize {
        match self.binding {
            ParamBinding::Owned(ref owned) => owned.num_grads_received,
            ParamBinding::TiedTo(_) => 0,
        }
    }

    pub(crate) fn increment_num_grads_received(&mut self) {
        if let ParamBinding::Owned(ref mut owned) = self.binding {
            owned.num_grads_received += 1;
        }
    }

    pub(crate) fn reset_num_grads_received(&mut self) {
        if let ParamBinding::Owned(ref mut owned) = self.binding {
            owned.num_grads_received = 0;
        }
    }

    fn bind_params(&mut self, region: Region, shape: &ParamShape) -> Result<()> {
        if let ParamBinding::Owned(ref mut owned) = self.binding {
            owned.params = Some(shape.carve(region)?);
        }
        Ok(())
    }

    fn bind_grads(&mut self, region: Region, shape: &ParamShape, optimizer: OptimizerFactory<'_>) -> Result<()> {
        if let ParamBinding::Owned(ref mut owned) = self.binding {
            owned.grads = Some(shape.carve(region)?);
            let mut weight_optimizer = optimizer();
            weight_optimizer.allocate_memory(shape.weight_rows, shape.weight_cols);
            owned.weight_optimizer = Some(weight_optimizer);
            if shape.bias_len > 0 {
                let mut bias_optimizer = optimizer();
                bias_optimizer.allocate_memory(1, shape.bias_len);
                owned.bias_optimizer = Some(bias_optimizer);
            }
        }
        Ok(())
    }
}

/// Edges with learned parameters: convolutional and locally connected.
pub trait WeightedEdge: Edge {
    fn weight_state(&self) -> &WeightState;

    fn weight_state_mut(&mut self) -> &mut WeightState;

    /// Parameter shapes this edge would own if it were untied.
    fn param_shape(&self) -> Result<ParamShape>;

    /// Reserves any scratch memory the gradient pass will borrow.
    fn reserve_scratch(&self, _scratch: &ScratchPool) -> Result<()> {
        Ok(())
    }

    /// Binds the weight and bias slots inside `region` of the parameter
    /// arena. No-op for tied edges.
    fn set_memory(&mut self, region: Region) -> Result<()> {
        if self.weight_state().is_tied() {
            return Ok(());
        }
        let shape = self.param_shape()?;
        debug!("{}: binding {} parameters", self.name(), shape.len());
        self.weight_state_mut().bind_params(region, &shape)
    }

    /// Binds gradient slots inside `region` of the gradient arena and
    /// allocates optimizer state for them. Tied edges only reserve scratch.
    fn set_grad_memory(
        &mut self,
        region: Region,
        scratch: &ScratchPool,
        optimizer: OptimizerFactory<'_>,
    ) -> Result<()> {
        self.reserve_scratch(scratch)?;
        if self.weight_state().is_tied() {
            return Ok(());
        }
        let shape = self.param_shape()?;
        self.weight_state_mut().bind_grads(region, &shape, optimizer)
    }

    /// `output = conv(input, W) (+ output unless overwrite)`, plus bias.
    fn compute_up<B: Backend>(
        &self,
        backend: &B,
        params: ParamViews<'_>,
        input: ArrayView2<'_, WeightPrecision>,
        output: ArrayViewMut2<'_, WeightPrecision>,
        overwrite: bool,
    ) -> Result<()>;

    /// Error derivative with respect to the input.
    fn compute_down<B: Backend>(
        &self,
        backend: &B,
        params: ParamViews<'_>,
        deriv_output: ArrayView2<'_, WeightPrecision>,
        input: ArrayView2<'_, WeightPrecision>,
        output: ArrayView2<'_, WeightPrecision>,
        deriv_input: ArrayViewMut2<'_, WeightPrecision>,
        overwrite: bool,
    ) -> Result<()>;

    /// Writes (`accumulate == false`) or adds the parameter gradient,
    /// averaged over the minibatch.
    fn compute_outer<B: Backend>(
        &self,
        backend: &B,
        grads: GradViews<'_>,
        accumulate: bool,
        input: ArrayView2<'_, WeightPrecision>,
        deriv_output: ArrayView2<'_, WeightPrecision>,
    ) -> Result<()>;
}

/// `0` replaces the target, `1` adds to it.
pub(crate) fn scale_targets(accumulate: bool) -> WeightPrecision {
    if accumulate {
        1.0
    } else {
        0.0
    }
}
