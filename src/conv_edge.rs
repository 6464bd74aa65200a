//! Convolutional edges: one filter bank shared by every output location.
//!
//! More can be read here:
//! - <https://towardsdatascience.com/a-comprehensive-guide-to-convolutional-neural-networks-the-eli5-way-3bd2b1164a53?gi=f4a37beea40b>

use std::fmt;

use log::trace;
use ndarray::{ArrayView2, ArrayViewMut2};

use crate::backend::{Backend, ScratchPool};
use crate::edge::{kind_mismatch, Edge, EdgeBase, EdgeKind, TieSource};
use crate::error::{shape as shape_error, Result};
use crate::geometry::{div_up, Geometry, Spatial};
use crate::network::EdgeId;
use crate::weighted::{scale_targets, GradViews, ParamShape, ParamViews, WeightState, WeightedEdge};
use crate::WeightPrecision;

/// Rust implementation of a convolutional edge.
///
/// The weight matrix has shape `(output channels, kernel_size² × input channels)`.
/// With a shared bias there is one bias per output channel, otherwise one
/// per output channel and output location.
#[derive(Debug)]
pub struct ConvolutionalEdge {
    base: EdgeBase,
    weights: WeightState,
    /// Side of the square tiles the weight gradient is split into, 0 when
    /// the gradient is computed in one pass.
    partial_sum: usize,
    shared_bias: bool,
}

impl ConvolutionalEdge {
    pub fn new(
        name: &str,
        num_input_channels: usize,
        num_output_channels: usize,
        geometry: Geometry,
    ) -> Result<ConvolutionalEdge> {
        Ok(ConvolutionalEdge {
            base: EdgeBase::new(name, num_input_channels, num_output_channels, geometry)?,
            weights: WeightState::new(false, 1.0),
            partial_sum: 0,
            shared_bias: true,
        })
    }

    pub fn with_partial_sum(mut self, partial_sum: usize) -> Self {
        self.partial_sum = partial_sum;
        self
    }

    pub fn with_shared_bias(mut self, shared_bias: bool) -> Self {
        self.shared_bias = shared_bias;
        self
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

    pub fn partial_sum(&self) -> usize {
        self.partial_sum
    }

    pub fn shared_bias(&self) -> bool {
        self.shared_bias
    }

    /// Number of `partial_sum x partial_sum` tiles covering the output grid.
    pub fn num_partial_sums(&self, spatial: &Spatial) -> usize {
        if self.partial_sum == 0 {
            return 1;
        }
        div_up(spatial.num_modules_y, self.partial_sum) * div_up(spatial.num_modules_x, self.partial_sum)
    }
}

impl fmt::Display for ConvolutionalEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.base.describe(f, "Convolutional")
    }
}

impl Edge for ConvolutionalEdge {
    fn base(&self) -> &EdgeBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut EdgeBase {
        &mut self.base
    }

    fn kind(&self) -> EdgeKind {
        EdgeKind::Convolutional
    }

    fn tie_source(&self) -> TieSource {
        TieSource::Convolutional {
            geometry: self.base.geometry(),
            partial_sum: self.partial_sum,
            shared_bias: self.shared_bias,
        }
    }

    fn set_tied_to(&mut self, target: EdgeId, source: &TieSource) -> Result<()> {
        match *source {
            TieSource::Convolutional {
                geometry,
                partial_sum,
                shared_bias,
            } => {
                self.base.set_geometry(geometry)?;
                // Partial sums only change how gradients are accumulated,
                // so a tied edge may keep its own setting.
                if self.partial_sum == 0 {
                    self.partial_sum = partial_sum;
                }
                self.shared_bias = shared_bias;
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

impl WeightedEdge for ConvolutionalEdge {
    fn weight_state(&self) -> &WeightState {
        &self.weights
    }

    fn weight_state_mut(&mut self) -> &mut WeightState {
        &mut self.weights
    }

    fn param_shape(&self) -> Result<ParamShape> {
        let num_filters = self.base.num_output_channels();
        let bias_locs = if self.shared_bias {
            1
        } else {
            self.base.spatial()?.num_locations()
        };
        Ok(ParamShape {
            weight_rows: num_filters,
            weight_cols: self.base.geometry().filter_input_size(self.base.num_input_channels()),
            bias_len: if self.weights.has_bias() {
                num_filters * bias_locs
            } else {
                0
            },
        })
    }

    fn reserve_scratch(&self, scratch: &ScratchPool) -> Result<()> {
        let spatial = self.base.spatial()?;
        let num_filters = self.base.num_output_channels();
        if self.partial_sum > 0 {
            let filter_input_size = self.base.geometry().filter_input_size(self.base.num_input_channels());
            scratch.reserve(
                num_filters * filter_input_size * self.num_partial_sums(&spatial),
                &format!("partial sums {}", self.name()),
            );
        }
        if self.weights.has_bias() && self.shared_bias && !self.weights.is_tied() {
            scratch.reserve(num_filters * spatial.num_locations(), "shared bias");
        }
        Ok(())
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
        if self.shared_bias && params.bias.is_some() && !output.is_standard_layout() {
            return Err(shape_error(format!(
                "{}: shared bias needs a row-major output buffer",
                self.name()
            )));
        }
        backend.conv_forward(
            input,
            params.weights,
            output.view_mut(),
            &shape,
            scale_targets(!overwrite),
        )?;
        if let Some(bias) = params.bias {
            if self.shared_bias {
                // One row per (image, location) so the per-channel bias
                // broadcasts over every location at once.
                let rows = output.nrows() * shape.num_locations();
                let per_location = output
                    .view_mut()
                    .into_shape((rows, self.base.num_output_channels()))?;
                backend.add_row_vector(per_location, bias)?;
            } else {
                backend.add_row_vector(output, bias)?;
            }
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
        trace!("{}: compute_down overwrite={}", self.name(), overwrite);
        backend.conv_backward_input(
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
        let batch_size = input.nrows();
        if batch_size == 0 {
            return Err(shape_error(format!("{}: gradient of an empty batch", self.name())));
        }
        let num_filters = self.base.num_output_channels();
        let filter_input_size = shape.filter_input_size();
        let targets = scale_targets(accumulate);
        let scale = self.weights.scale_gradients() / batch_size as WeightPrecision;
        let GradViews { weights: dw, bias: db } = grads;
        trace!("{}: compute_outer accumulate={}", self.name(), accumulate);

        if self.partial_sum > 0 {
            let partial_sums = self.num_partial_sums(&self.base.spatial()?);
            let mut dw_temp = backend
                .scratch()
                .borrow(num_filters, filter_input_size * partial_sums);
            backend.conv_backward_weights(
                input,
                deriv_output,
                dw_temp.view_mut(),
                &shape,
                self.partial_sum,
                0.0,
                1.0,
            )?;
            dw_temp.reshape(num_filters * filter_input_size, partial_sums)?;
            let dw = dw.into_shape((num_filters * filter_input_size, 1))?;
            backend.sum_cols(dw_temp.view(), dw, targets, scale)?;
        } else {
            backend.conv_backward_weights(input, deriv_output, dw, &shape, 0, targets, scale)?;
        }

        if let Some(db) = db {
            if self.shared_bias {
                // Reducing over the batch first and over locations second is
                // much faster on GPU backends than the reverse order.
                let mut db_temp = backend.scratch().borrow(1, deriv_output.ncols());
                backend.sum_rows(deriv_output, db_temp.view_mut(), 0.0, 1.0)?;
                db_temp.reshape(shape.num_locations(), num_filters)?;
                backend.sum_rows(db_temp.view(), db, targets, scale)?;
            } else {
                backend.sum_rows(deriv_output, db, targets, scale)?;
            }
        }
        Ok(())
    }
}
