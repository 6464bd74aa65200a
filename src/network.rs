//! A set of edges together with the memory their parameters live in.
//!
//! Building happens in two states. An [`EdgeGraphBuilder`] collects edges,
//! ties and image sizes; [`EdgeGraphBuilder::bind`] then resolves every tie
//! to the one edge owning the parameters, sizes and allocates the parameter
//! and gradient arenas, and hands each owning edge its regions. The result is
//! an [`EdgeGraph`], through which all forward, backward and gradient passes
//! run.

use std::collections::HashMap;
use std::fmt;

use log::{debug, info, trace};
use ndarray::{ArrayView2, ArrayViewMut2};

use crate::backend::Backend;
use crate::config::NetworkConfig;
use crate::conv_edge::ConvolutionalEdge;
use crate::edge::{Edge, EdgeKind};
use crate::error::{configuration, EdgeError, Result};
use crate::geometry::FieldOfView;
use crate::local_edge::LocallyConnectedEdge;
use crate::memory::{Arena, ArenaPlanner};
use crate::optimizer::{momentum, OptimizerFactory};
use crate::pool_edge::PoolingEdge;
use crate::weighted::{ParamShape, ParamSlots, WeightState, WeightedEdge};
use crate::WeightPrecision;

/// Index of an edge inside its graph.
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy, PartialOrd, Ord)]
pub struct EdgeId(usize);

impl EdgeId {
    pub(crate) fn new(index: usize) -> EdgeId {
        EdgeId(index)
    }

    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug)]
pub enum AnyEdge {
    Convolutional(ConvolutionalEdge),
    LocallyConnected(LocallyConnectedEdge),
    Pooling(PoolingEdge),
}

impl AnyEdge {
    pub fn as_edge(&self) -> &dyn Edge {
        match self {
            AnyEdge::Convolutional(e) => e,
            AnyEdge::LocallyConnected(e) => e,
            AnyEdge::Pooling(e) => e,
        }
    }

    pub fn as_edge_mut(&mut self) -> &mut dyn Edge {
        match self {
            AnyEdge::Convolutional(e) => e,
            AnyEdge::LocallyConnected(e) => e,
            AnyEdge::Pooling(e) => e,
        }
    }

    pub fn kind(&self) -> EdgeKind {
        self.as_edge().kind()
    }

    pub fn name(&self) -> &str {
        self.as_edge().name()
    }

    pub fn weight_state(&self) -> Option<&WeightState> {
        match self {
            AnyEdge::Convolutional(e) => Some(e.weight_state()),
            AnyEdge::LocallyConnected(e) => Some(e.weight_state()),
            AnyEdge::Pooling(_) => None,
        }
    }

    fn weight_state_mut(&mut self) -> Option<&mut WeightState> {
        match self {
            AnyEdge::Convolutional(e) => Some(e.weight_state_mut()),
            AnyEdge::LocallyConnected(e) => Some(e.weight_state_mut()),
            AnyEdge::Pooling(_) => None,
        }
    }

    /// Parameter shape of a weighted edge, `None` for pooling.
    pub fn param_shape(&self) -> Result<Option<ParamShape>> {
        match self {
            AnyEdge::Convolutional(e) => e.param_shape().map(Some),
            AnyEdge::LocallyConnected(e) => e.param_shape().map(Some),
            AnyEdge::Pooling(_) => Ok(None),
        }
    }

    pub fn tied_to(&self) -> Option<EdgeId> {
        self.weight_state().and_then(WeightState::tied_to)
    }
}

impl fmt::Display for AnyEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.as_edge(), f)
    }
}

fn lookup<'a>(edges: &'a [AnyEdge], id: EdgeId) -> Result<&'a AnyEdge> {
    edges
        .get(id.0)
        .ok_or_else(|| EdgeError::UnknownEdge(id.to_string()))
}

fn lookup_mut<'a>(edges: &'a mut [AnyEdge], id: EdgeId) -> Result<&'a mut AnyEdge> {
    edges
        .get_mut(id.0)
        .ok_or_else(|| EdgeError::UnknownEdge(id.to_string()))
}

fn lookup_name(names: &HashMap<String, EdgeId>, name: &str) -> Result<EdgeId> {
    names
        .get(name)
        .copied()
        .ok_or_else(|| EdgeError::UnknownEdge(name.to_string()))
}

/// Sizing state: edges can be added, tied and sized, but own no memory yet.
#[derive(Debug, Default)]
pub struct EdgeGraphBuilder {
    edges: Vec<AnyEdge>,
    names: HashMap<String, EdgeId>,
}

impl EdgeGraphBuilder {
    pub fn new() -> EdgeGraphBuilder {
        EdgeGraphBuilder::default()
    }

    /// Adds every configured edge, then applies ties by name and image sizes.
    pub fn from_config(config: &NetworkConfig) -> Result<EdgeGraphBuilder> {
        let mut builder = EdgeGraphBuilder::new();
        for edge in config.edges.iter() {
            builder.add_edge(edge.build()?)?;
        }
        for edge in config.edges.iter() {
            let id = builder.id(&edge.name)?;
            // A tied edge takes the owner's geometry, so its size is
            // resolved against that rather than its own entry.
            if let Some(ref target) = edge.tied_to {
                let target = builder.id(target)?;
                builder.tie(id, target)?;
            }
            if let Some([image_size_y, image_size_x]) = edge.image_size {
                builder.set_image_size(id, image_size_y, image_size_x)?;
            }
        }
        Ok(builder)
    }

    pub fn add_edge(&mut self, edge: AnyEdge) -> Result<EdgeId> {
        if self.names.contains_key(edge.name()) {
            return Err(configuration(format!("duplicate edge name `{}`", edge.name())));
        }
        let id = EdgeId(self.edges.len());
        self.names.insert(edge.name().to_string(), id);
        self.edges.push(edge);
        Ok(id)
    }

    pub fn id(&self, name: &str) -> Result<EdgeId> {
        lookup_name(&self.names, name)
    }

    pub fn edge(&self, id: EdgeId) -> Result<&AnyEdge> {
        lookup(&self.edges, id)
    }

    pub fn set_image_size(&mut self, id: EdgeId, image_size_y: usize, image_size_x: usize) -> Result<()> {
        lookup_mut(&mut self.edges, id)?
            .as_edge_mut()
            .set_image_size(image_size_y, image_size_x)
    }

    /// Makes `edge` use the parameters of `target`. Both must be of the same kind.
    pub fn tie(&mut self, edge: EdgeId, target: EdgeId) -> Result<()> {
        if edge == target {
            return Err(configuration(format!(
                "edge `{}` cannot be tied to itself",
                lookup(&self.edges, edge)?.name()
            )));
        }
        let target_edge = lookup(&self.edges, target)?;
        let source = target_edge.as_edge().tie_source();
        let target_name = target_edge.name().to_string();
        let tied = lookup_mut(&mut self.edges, edge)?;
        if tied.kind() != source.kind() {
            return Err(EdgeError::IncompatibleTie {
                edge: tied.name().to_string(),
                kind: tied.kind(),
                target: target_name,
                target_kind: source.kind(),
            });
        }
        debug!("tying `{}` to `{}`", tied.name(), target_name);
        tied.as_edge_mut().set_tied_to(target, &source)
    }

    /// Follows tie chains until an owning edge is reached.
    fn owner_of(&self, id: EdgeId) -> Result<EdgeId> {
        let mut current = id;
        for _ in 0..=self.edges.len() {
            match lookup(&self.edges, current)?.tied_to() {
                Some(next) => current = next,
                None => return Ok(current),
            }
        }
        Err(configuration(format!(
            "ties starting at `{}` form a cycle",
            lookup(&self.edges, id)?.name()
        )))
    }

    /// Points every tied edge straight at its owner, re-applying the owner's
    /// geometry, and checks that parameter shapes agree.
    fn resolve_ties(&mut self) -> Result<()> {
        for index in 0..self.edges.len() {
            let id = EdgeId(index);
            if self.edges[index].tied_to().is_none() {
                continue;
            }
            let owner = self.owner_of(id)?;
            let source = self.edges[owner.0].as_edge().tie_source();
            self.edges[index].as_edge_mut().set_tied_to(owner, &source)?;

            let tied_shape = self.edges[index].param_shape()?;
            let owner_shape = self.edges[owner.0].param_shape()?;
            if tied_shape != owner_shape {
                return Err(configuration(format!(
                    "edge `{}` is tied to `{}` but their parameter shapes differ ({:?} vs {:?})",
                    self.edges[index].name(),
                    self.edges[owner.0].name(),
                    tied_shape,
                    owner_shape
                )));
            }
            debug!("`{}` resolves to owner `{}`", self.edges[index].name(), self.edges[owner.0].name());
        }
        Ok(())
    }

    pub fn bind<B: Backend>(self, backend: B) -> Result<EdgeGraph<B>> {
        self.bind_with(backend, &momentum)
    }

    /// Sizes and allocates parameter and gradient memory and binds every
    /// edge to its share of it.
    pub fn bind_with<B: Backend>(mut self, backend: B, optimizer: OptimizerFactory<'_>) -> Result<EdgeGraph<B>> {
        self.resolve_ties()?;

        let mut params_plan = ArenaPlanner::new();
        let mut grads_plan = ArenaPlanner::new();
        let mut regions = Vec::with_capacity(self.edges.len());
        for edge in self.edges.iter() {
            let required = edge.as_edge().parameter_memory_requirement()?;
            debug!("`{}` requires {} parameters", edge.name(), required);
            regions.push((params_plan.reserve(required), grads_plan.reserve(required)));
        }

        let params = Arena::from_planner("parameters", &params_plan);
        let grads = Arena::from_planner("gradients", &grads_plan);
        for (edge, (param_region, grad_region)) in self.edges.iter_mut().zip(regions) {
            match edge {
                AnyEdge::Convolutional(e) => {
                    e.set_memory(param_region)?;
                    e.set_grad_memory(grad_region, backend.scratch(), optimizer)?;
                }
                AnyEdge::LocallyConnected(e) => {
                    e.set_memory(param_region)?;
                    e.set_grad_memory(grad_region, backend.scratch(), optimizer)?;
                }
                AnyEdge::Pooling(_) => {}
            }
        }
        info!(
            "bound {} edges: {} parameters, {} gradients",
            self.edges.len(),
            params.len(),
            grads.len()
        );

        Ok(EdgeGraph {
            edges: self.edges,
            names: self.names,
            params,
            grads,
            backend,
        })
    }
}

/// Bound state: every owning edge has its parameter and gradient slots.
#[derive(Debug)]
pub struct EdgeGraph<B> {
    edges: Vec<AnyEdge>,
    names: HashMap<String, EdgeId>,
    params: Arena,
    grads: Arena,
    backend: B,
}

impl<B: Backend> EdgeGraph<B> {
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn id(&self, name: &str) -> Result<EdgeId> {
        lookup_name(&self.names, name)
    }

    pub fn edge(&self, id: EdgeId) -> Result<&AnyEdge> {
        lookup(&self.edges, id)
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Closes the graph and hands back its backend.
    pub fn close(self) -> B {
        debug!("closing graph of {} edges", self.edges.len());
        self.backend
    }

    pub fn parameters(&self) -> &Arena {
        &self.params
    }

    pub fn parameters_mut(&mut self) -> &mut Arena {
        &mut self.params
    }

    pub fn gradients(&self) -> &Arena {
        &self.grads
    }

    /// Edge owning the parameters `id` uses; `id` itself unless tied.
    pub fn owner(&self, id: EdgeId) -> Result<EdgeId> {
        Ok(lookup(&self.edges, id)?.tied_to().unwrap_or(id))
    }

    fn owner_state(&self, id: EdgeId) -> Result<&WeightState> {
        let owner = self.owner(id)?;
        let edge = lookup(&self.edges, owner)?;
        edge.weight_state().ok_or_else(|| {
            configuration(format!("edge `{}` has no parameters", edge.name()))
        })
    }

    fn param_slots(&self, id: EdgeId) -> Result<ParamSlots> {
        let owner = self.owner(id)?;
        self.owner_state(id)?.param_slots(lookup(&self.edges, owner)?.name())
    }

    fn grad_slots(&self, id: EdgeId) -> Result<ParamSlots> {
        let owner = self.owner(id)?;
        self.owner_state(id)?.grad_slots(lookup(&self.edges, owner)?.name())
    }

    pub fn weights(&self, id: EdgeId) -> Result<ArrayView2<'_, WeightPrecision>> {
        let slots = self.param_slots(id)?;
        self.params.view(&slots.weights)
    }

    pub fn weights_mut(&mut self, id: EdgeId) -> Result<ArrayViewMut2<'_, WeightPrecision>> {
        let slots = self.param_slots(id)?;
        self.params.view_mut(&slots.weights)
    }

    pub fn bias(&self, id: EdgeId) -> Result<Option<ArrayView2<'_, WeightPrecision>>> {
        match self.param_slots(id)?.bias {
            Some(slot) => Ok(Some(self.params.view(&slot)?)),
            None => Ok(None),
        }
    }

    pub fn bias_mut(&mut self, id: EdgeId) -> Result<Option<ArrayViewMut2<'_, WeightPrecision>>> {
        match self.param_slots(id)?.bias {
            Some(slot) => Ok(Some(self.params.view_mut(&slot)?)),
            None => Ok(None),
        }
    }

    pub fn grad_weights(&self, id: EdgeId) -> Result<ArrayView2<'_, WeightPrecision>> {
        let slots = self.grad_slots(id)?;
        self.grads.view(&slots.weights)
    }

    pub fn grad_bias(&self, id: EdgeId) -> Result<Option<ArrayView2<'_, WeightPrecision>>> {
        match self.grad_slots(id)?.bias {
            Some(slot) => Ok(Some(self.grads.view(&slot)?)),
            None => Ok(None),
        }
    }

    /// Gradient contributions the parameter set `id` uses has received
    /// since the last [`reset_gradients`](Self::reset_gradients).
    pub fn num_grads_received(&self, id: EdgeId) -> Result<usize> {
        Ok(self.owner_state(id)?.num_grads_received())
    }

    /// Starts a new accumulation pass: the next gradient written to each
    /// parameter set overwrites instead of adding.
    pub fn reset_gradients(&mut self) {
        for edge in self.edges.iter_mut() {
            if let Some(state) = edge.weight_state_mut() {
                state.reset_num_grads_received();
            }
        }
    }

    /// Changes the input size of an edge after binding. Allowed only when
    /// the parameter shape stays the same.
    pub fn set_image_size(&mut self, id: EdgeId, image_size_y: usize, image_size_x: usize) -> Result<()> {
        let edge = lookup_mut(&mut self.edges, id)?;
        let before = edge.param_shape().ok().flatten();
        let previous = edge.as_edge().base().spatial().ok();
        edge.as_edge_mut().set_image_size(image_size_y, image_size_x)?;
        let after = edge.param_shape()?;
        if after != before {
            if let Some(p) = previous {
                edge.as_edge_mut().set_image_size(p.image_size_y, p.image_size_x)?;
            }
            return Err(configuration(format!(
                "resizing `{}` to {}x{} would change its parameter shape",
                edge.name(),
                image_size_y,
                image_size_x
            )));
        }
        Ok(())
    }

    /// Receptive field of one unit at the end of `chain`, in terms of the
    /// input of its first edge. `chain` lists edges from input to output.
    pub fn field_of_view(&self, chain: &[EdgeId]) -> Result<FieldOfView> {
        let mut fov = FieldOfView::unit();
        for &id in chain.iter().rev() {
            fov = lookup(&self.edges, id)?.as_edge().field_of_view(fov)?;
        }
        Ok(fov)
    }

    /// Forward pass through edge `id`: writes (`overwrite`) or adds its
    /// contribution to `output`.
    pub fn compute_up(
        &self,
        id: EdgeId,
        input: ArrayView2<'_, WeightPrecision>,
        output: ArrayViewMut2<'_, WeightPrecision>,
        overwrite: bool,
    ) -> Result<()> {
        trace!("compute_up {}", id);
        match lookup(&self.edges, id)? {
            AnyEdge::Convolutional(e) => {
                let params = self.param_slots(id)?.views(&self.params)?;
                e.compute_up(&self.backend, params, input, output, overwrite)
            }
            AnyEdge::LocallyConnected(e) => {
                let params = self.param_slots(id)?.views(&self.params)?;
                e.compute_up(&self.backend, params, input, output, overwrite)
            }
            AnyEdge::Pooling(e) => e.compute_up(&self.backend, input, output, overwrite),
        }
    }

    /// Backward pass through edge `id`: derivative with respect to its input.
    pub fn compute_down(
        &self,
        id: EdgeId,
        deriv_output: ArrayView2<'_, WeightPrecision>,
        input: ArrayView2<'_, WeightPrecision>,
        output: ArrayView2<'_, WeightPrecision>,
        deriv_input: ArrayViewMut2<'_, WeightPrecision>,
        overwrite: bool,
    ) -> Result<()> {
        trace!("compute_down {}", id);
        match lookup(&self.edges, id)? {
            AnyEdge::Convolutional(e) => {
                let params = self.param_slots(id)?.views(&self.params)?;
                e.compute_down(&self.backend, params, deriv_output, input, output, deriv_input, overwrite)
            }
            AnyEdge::LocallyConnected(e) => {
                let params = self.param_slots(id)?.views(&self.params)?;
                e.compute_down(&self.backend, params, deriv_output, input, output, deriv_input, overwrite)
            }
            AnyEdge::Pooling(e) => {
                e.compute_down(&self.backend, deriv_output, input, output, deriv_input, overwrite)
            }
        }
    }

    /// Gradient pass through edge `id`. The first contribution to a
    /// parameter set after a reset overwrites its gradient, later ones add.
    /// Pooling edges have no gradient and are skipped.
    pub fn compute_outer(
        &mut self,
        id: EdgeId,
        input: ArrayView2<'_, WeightPrecision>,
        deriv_output: ArrayView2<'_, WeightPrecision>,
    ) -> Result<()> {
        trace!("compute_outer {}", id);
        if lookup(&self.edges, id)?.kind() == EdgeKind::Pooling {
            return Ok(());
        }
        let owner = self.owner(id)?;
        let slots = self.grad_slots(id)?;
        let accumulate = self.num_grads_received(id)? > 0;

        let grads = slots.views_mut(&mut self.grads)?;
        match &self.edges[id.0] {
            AnyEdge::Convolutional(e) => e.compute_outer(&self.backend, grads, accumulate, input, deriv_output)?,
            AnyEdge::LocallyConnected(e) => {
                e.compute_outer(&self.backend, grads, accumulate, input, deriv_output)?
            }
            AnyEdge::Pooling(_) => {}
        }
        if let Some(state) = self.edges[owner.0].weight_state_mut() {
            state.increment_num_grads_received();
        }
        Ok(())
    }
}
