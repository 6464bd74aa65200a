//! Pooling edges: fixed downsampling, no parameters.

use std::fmt;

use ndarray::{ArrayView2, ArrayViewMut2};
use serde::{Deserialize, Serialize};

use crate::backend::Backend;
use crate::edge::{kind_mismatch, Edge, EdgeBase, EdgeKind, TieSource};
use crate::error::Result;
use crate::geometry::Geometry;
use crate::network::EdgeId;
use crate::weighted::scale_targets;
use crate::WeightPrecision;

#[derive(PartialEq, Eq, Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolMode {
    Max,
    #[serde(alias = "average")]
    Avg,
}

impl Default for PoolMode {
    fn default() -> Self {
        PoolMode::Max
    }
}

#[derive(Debug)]
pub struct PoolingEdge {
    base: EdgeBase,
    mode: PoolMode,
}

impl PoolingEdge {
    /// Pooling keeps the channel count.
    pub fn new(name: &str, num_channels: usize, geometry: Geometry, mode: PoolMode) -> Result<PoolingEdge> {
        Ok(PoolingEdge {
            base: EdgeBase::new(name, num_channels, num_channels, geometry)?,
            mode,
        })
    }

    pub fn mode(&self) -> PoolMode {
        self.mode
    }

    pub fn compute_up<B: Backend>(
        &self,
        backend: &B,
        input: ArrayView2<'_, WeightPrecision>,
        output: ArrayViewMut2<'_, WeightPrecision>,
        overwrite: bool,
    ) -> Result<()> {
        let shape = self.base.conv_shape()?;
        let targets = scale_targets(!overwrite);
        match self.mode {
            PoolMode::Max => backend.max_pool(input, output, &shape, targets),
            PoolMode::Avg => backend.avg_pool(input, output, &shape, targets),
        }
    }

    pub fn compute_down<B: Backend>(
        &self,
        backend: &B,
        deriv_output: ArrayView2<'_, WeightPrecision>,
        input: ArrayView2<'_, WeightPrecision>,
        output: ArrayView2<'_, WeightPrecision>,
        deriv_input: ArrayViewMut2<'_, WeightPrecision>,
        overwrite: bool,
    ) -> Result<()> {
        let shape = self.base.conv_shape()?;
        let targets = scale_targets(!overwrite);
        match self.mode {
            PoolMode::Max => backend.max_pool_undo(input, deriv_output, output, deriv_input, &shape, targets),
            PoolMode::Avg => backend.avg_pool_undo(deriv_output, deriv_input, &shape, targets),
        }
    }
}

impl fmt::Display for PoolingEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self.mode {
            PoolMode::Max => "MaxPool",
            PoolMode::Avg => "AvgPool",
        };
        self.base.describe(f, label)
    }
}

impl Edge for PoolingEdge {
    fn base(&self) -> &EdgeBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut EdgeBase {
        &mut self.base
    }

    fn kind(&self) -> EdgeKind {
        EdgeKind::Pooling
    }

    fn tie_source(&self) -> TieSource {
        TieSource::Pooling {
            geometry: self.base.geometry(),
        }
    }

    /// Pooling learns nothing, so tying only shares the window geometry.
    fn set_tied_to(&mut self, _target: EdgeId, source: &TieSource) -> Result<()> {
        match *source {
            TieSource::Pooling { geometry } => self.base.set_geometry(geometry),
            _ => Err(kind_mismatch(self, source)),
        }
    }
}
