//! Locally connected edges: like a convolution, but every output location
//! has a filter of its own.

use std::fmt;

use log::trace;
use ndarray::{ArrayView2, ArrayViewMut2};

use crate::backend::Backend;
use crate::edge::{kind_mismatch, Edge, EdgeBase, EdgeKind, TieSource};
use crate::error::{shape as shape_error, Result};
use crate::geometry::Geometry;
use crate::network::EdgeId;
use crate::weighted::{scale_targets, GradViews, ParamShape, ParamViews, WeightState, WeightedEdge};
use crate::WeightPrecision;

/// Weights have shape `(output channels, locations × kernel_size² × input channels)`
/// and the bias always has one value per output channel and location.
#[derive(Debug)]
pub struct LocallyConnectedEdge {
    base: EdgeBase,
    weights: WeightState,
}

impl LocallyConnectedEdge {
    pub fn new(
        name: &str,
        num_input_channels: usize,
        num_output_channels: usize,
        geometry: Geometry,
    ) -> Result<LocallyConnectedEdge> {
        Ok(LocallyConnectedEdge {
            base: EdgeBase::new(name, num_input_channels, num_output_channels, geometry)?,
            weights: WeightState::new(false, 1.0),
        })
    }

    pub fn with_weight_state(mut self, weights: WeightState) -> Self {
        self.weights = weights;
        self
    }

    pub fn kernel_size(&self) -> usize {
        self.base.geometry().kernel_size
    }

    pub fn stride(&self) -> usize {
        self.base.geometry().stride
    }

    pub fn padding(&self) -> usize {
        self.base.geometry().padding
    }
}

impl fmt::Display for LocallyConnectedEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.base.describe(f, "Local")
    }
}

impl Edge for LocallyConnectedEdge {
    fn base(&self) -> &EdgeBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut EdgeBase {
        &mut self.base
    }

    fn kind(&self) -> EdgeKind {
        EdgeKind::LocallyConnected
    }

    fn tie_source(&self) -> TieSource {
        TieSource::LocallyConnected {
            geometry: self.base.geometry(),
        }
    }

    fn set_tied_to(&mut self, target: EdgeId, source: &TieSource) -> Result<()> {
        match *source {
            TieSource::LocallyConnected { geometry } => {
                self.base.set_geometry(geometry)?;
                self.weights.tie(target);
                Ok(())
            }
            _ => Err(kind_mismatch(self, source)),
        }
    }

    fn parameter_memory_requirement(&self) -> Result<usize> {
        if self.weights.is_tied() {
            return Ok(0);
        }
        Ok(self.param_shape()?.len())
    }
}

impl WeightedEdge for LocallyConnectedEdge {
    fn weight_state(&self) -> &WeightState {
        &self.weights
    }

    fn weight_state_mut(&mut self) -> &mut WeightState {
        &mut self.weights
    }

    fn param_shape(&self) -> Result<ParamShape> {
        let num_filters = self.base.num_output_channels();
        let num_locations = self.base.spatial()?.num_locations();
        Ok(ParamShape {
            weight_rows: num_filters,
            weight_cols: self.base.geometry().filter_input_size(self.base.num_input_channels())
                * num_locations,
            bias_len: if self.weights.has_bias() {
                num_filters * num_locations
            } else {
                0
            },
        })
    }

    fn compute_up<B: Backend>(
        &self,
        backend: &B,
        params: ParamViews<'_>,
        input: ArrayView2<'_, WeightPrecision>,
        mut output: ArrayViewMut2<'_, WeightPrecision>,
        overwrite: bool,
    ) -> Result<()> {
        let shape = self.base.conv_shape()?;
        trace!("{}: compute_up overwrite={}", self.name(), overwrite);
        backend.local_forward(
            input,
            params.weights,
            output.view_mut(),
            &shape,
            scale_targets(!overwrite),
        )?;
        if let Some(bias) = params.bias {
            backend.add_row_vector(output, bias)?;
        }
        Ok(())
    }

    fn compute_down<B: Backend>(
        &self,
        backend: &B,
        params: ParamViews<'_>,
        deriv_output: ArrayView2<'_, WeightPrecision>,
        _input: ArrayView2<'_, WeightPrecision>,
        _output: ArrayView2<'_, WeightPrecision>,
        deriv_input: ArrayViewMut2<'_, WeightPrecision>,
        overwrite: bool,
    ) -> Result<()> {
        let shape = self.base.conv_shape()?;
        backend.local_backward_input(
            deriv_output,
            params.weights,
            deriv_input,
            &shape,
            scale_targets(!overwrite),
        )
    }

    fn compute_outer<B: Backend>(
        &self,
        backend: &B,
        grads: GradViews<'_>,
        accumulate: bool,
        input: ArrayView2<'_, WeightPrecision>,
        deriv_output: ArrayView2<'_, WeightPrecision>,
    ) -> Result<()> {
        let shape = self.base.conv_shape()?;
        if input.nrows() == 0 {
            return Err(shape_error(format!("{}: gradient of an empty batch", self.name())));
        }
        let targets = scale_targets(accumulate);
        let scale = self.weights.scale_gradients() / input.nrows() as WeightPrecision;
        let GradViews { weights: dw, bias: db } = grads;

        backend.local_backward_weights(input, deriv_output, dw, &shape, targets, scale)?;
        if let Some(db) = db {
            backend.sum_rows(deriv_output, db, targets, scale)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CpuBackend;
    use crate::error::EdgeError;
    use ndarray::Array2;

    #[test]
    fn memory_scales_with_locations() {
        let mut edge = LocallyConnectedEdge::new("local1", 3, 4, Geometry::new(3, 1, 0).unwrap()).unwrap();
        edge.set_image_size(6, 6).unwrap();
        // 4x4 locations, 27 weights each, per-location bias.
        assert_eq!(edge.parameter_memory_requirement().unwrap(), 4 * (27 * 16 + 16));
    }

    #[test]
    fn tying_to_a_convolution_fails() {
        let mut edge = LocallyConnectedEdge::new("local1", 3, 4, Geometry::new(3, 1, 0).unwrap()).unwrap();
        let source = TieSource::Convolutional {
            geometry: Geometry::new(3, 1, 0).unwrap(),
            partial_sum: 0,
            shared_bias: true,
        };
        assert!(edge.set_tied_to(EdgeId::new(0), &source).is_err());
        assert!(!edge.weight_state().is_tied());
    }

    #[test]
    fn empty_batch_gradient_is_rejected() {
        let backend = CpuBackend::open();
        let mut edge = LocallyConnectedEdge::new("local1", 1, 2, Geometry::new(1, 1, 0).unwrap()).unwrap();
        edge.set_image_size(2, 2).unwrap();
        let input = Array2::zeros((0, 4));
        let deriv_output = Array2::zeros((0, 8));
        let mut dw = Array2::zeros((2, 4));
        let mut db = Array2::zeros((1, 8));
        let grads = GradViews {
            weights: dw.view_mut(),
            bias: Some(db.view_mut()),
        };
        let result = edge.compute_outer(&backend, grads, false, input.view(), deriv_output.view());
        assert!(matches!(result, Err(EdgeError::Shape(_))));
        assert!(dw.iter().all(|v| !v.is_nan()));
    }

    #[test]
    fn description() {
        let mut edge = LocallyConnectedEdge::new("local1", 3, 4, Geometry::new(3, 1, 0).unwrap()).unwrap();
        edge.set_image_size(6, 5).unwrap();
        assert_eq!(edge.to_string(), "local1 Local Kernel: 3-3-3 : 4 Layer: 6-5-3 : 4-3-4");
    }
}
