//! The tensor backend edges run on.
//!
//! Edges never touch tensor elements themselves. They only issue the batched
//! spatial primitives of [`Backend`] on 2D tensors whose rows are batch
//! elements, plus a few reductions and broadcasts. A GPU backend implements
//! the same trait; [`CpuBackend`] is the reference implementation.
//!
//! Layout conventions, for a batch of `B` images of `H x W x C`:
//! - images are `(B, H * W * C)`, columns ordered `(y, x, channel)`,
//! - edge outputs are `(B, My * Mx * F)`, columns ordered `(my, mx, filter)`,
//! - convolution weights are `(F, K * K * C)`, columns ordered `(ky, kx, c)`,
//! - local weights are `(F, My * Mx * K * K * C)`, one convolution-shaped
//!   block per output location.

use ndarray::{ArrayView2, ArrayViewMut2};

use crate::error::Result;
use crate::geometry::{Geometry, Spatial};
use crate::WeightPrecision;

mod cpu;
mod scratch;

pub use cpu::CpuBackend;
pub use scratch::{Scratch, ScratchPool};

/// Everything a spatial primitive needs to know about the edge issuing it.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub struct ConvShape {
    pub image_size_y: usize,
    pub image_size_x: usize,
    pub num_modules_y: usize,
    pub num_modules_x: usize,
    pub kernel_size: usize,
    pub padding: usize,
    pub stride: usize,
    pub num_input_channels: usize,
}

impl ConvShape {
    pub fn new(geometry: &Geometry, spatial: &Spatial, num_input_channels: usize) -> ConvShape {
        ConvShape {
            image_size_y: spatial.image_size_y,
            image_size_x: spatial.image_size_x,
            num_modules_y: spatial.num_modules_y,
            num_modules_x: spatial.num_modules_x,
            kernel_size: geometry.kernel_size,
            padding: geometry.padding,
            stride: geometry.stride,
            num_input_channels,
        }
    }

    pub fn num_locations(&self) -> usize {
        self.num_modules_y * self.num_modules_x
    }

    pub fn filter_input_size(&self) -> usize {
        self.kernel_size * self.kernel_size * self.num_input_channels
    }

    pub fn image_cols(&self) -> usize {
        self.image_size_y * self.image_size_x * self.num_input_channels
    }
}

/// Primitive operations an edge issues.
///
/// `scale_targets` selects between overwriting (`0.0`) and accumulating
/// (`1.0`) into the target: `target = scale_targets * target + result`.
/// Reductions additionally scale the freshly computed part by
/// `scale_source` / `scale_outputs`.
pub trait Backend {
    fn conv_forward(
        &self,
        input: ArrayView2<'_, WeightPrecision>,
        weights: ArrayView2<'_, WeightPrecision>,
        output: ArrayViewMut2<'_, WeightPrecision>,
        shape: &ConvShape,
        scale_targets: WeightPrecision,
    ) -> Result<()>;

    fn conv_backward_input(
        &self,
        deriv_output: ArrayView2<'_, WeightPrecision>,
        weights: ArrayView2<'_, WeightPrecision>,
        deriv_input: ArrayViewMut2<'_, WeightPrecision>,
        shape: &ConvShape,
        scale_targets: WeightPrecision,
    ) -> Result<()>;

    /// Weight gradient of a convolution. With `partial_sum == 0` the target is
    /// `(F, K * K * C)`. With `partial_sum == k` the output grid is tiled into
    /// `k x k` blocks and the target is `(F, K * K * C * blocks)` holding one
    /// estimate per block, block index fastest.
    fn conv_backward_weights(
        &self,
        input: ArrayView2<'_, WeightPrecision>,
        deriv_output: ArrayView2<'_, WeightPrecision>,
        dw: ArrayViewMut2<'_, WeightPrecision>,
        shape: &ConvShape,
        partial_sum: usize,
        scale_targets: WeightPrecision,
        scale_outputs: WeightPrecision,
    ) -> Result<()>;

    fn local_forward(
        &self,
        input: ArrayView2<'_, WeightPrecision>,
        weights: ArrayView2<'_, WeightPrecision>,
        output: ArrayViewMut2<'_, WeightPrecision>,
        shape: &ConvShape,
        scale_targets: WeightPrecision,
    ) -> Result<()>;

    fn local_backward_input(
        &self,
        deriv_output: ArrayView2<'_, WeightPrecision>,
        weights: ArrayView2<'_, WeightPrecision>,
        deriv_input: ArrayViewMut2<'_, WeightPrecision>,
        shape: &ConvShape,
        scale_targets: WeightPrecision,
    ) -> Result<()>;

    fn local_backward_weights(
        &self,
        input: ArrayView2<'_, WeightPrecision>,
        deriv_output: ArrayView2<'_, WeightPrecision>,
        dw: ArrayViewMut2<'_, WeightPrecision>,
        shape: &ConvShape,
        scale_targets: WeightPrecision,
        scale_outputs: WeightPrecision,
    ) -> Result<()>;

    /// Pooling keeps the channel count, so `shape.num_input_channels` is
    /// also the number of output channels.
    fn max_pool(
        &self,
        input: ArrayView2<'_, WeightPrecision>,
        output: ArrayViewMut2<'_, WeightPrecision>,
        shape: &ConvShape,
        scale_targets: WeightPrecision,
    ) -> Result<()>;

    /// Routes each output derivative to the arg-max input of its window.
    fn max_pool_undo(
        &self,
        input: ArrayView2<'_, WeightPrecision>,
        deriv_output: ArrayView2<'_, WeightPrecision>,
        output: ArrayView2<'_, WeightPrecision>,
        deriv_input: ArrayViewMut2<'_, WeightPrecision>,
        shape: &ConvShape,
        scale_targets: WeightPrecision,
    ) -> Result<()>;

    fn avg_pool(
        &self,
        input: ArrayView2<'_, WeightPrecision>,
        output: ArrayViewMut2<'_, WeightPrecision>,
        shape: &ConvShape,
        scale_targets: WeightPrecision,
    ) -> Result<()>;

    /// Spreads each output derivative evenly over the in-bounds window.
    fn avg_pool_undo(
        &self,
        deriv_output: ArrayView2<'_, WeightPrecision>,
        deriv_input: ArrayViewMut2<'_, WeightPrecision>,
        shape: &ConvShape,
        scale_targets: WeightPrecision,
    ) -> Result<()>;

    /// Sums over rows: `(rows, cols) -> (1, cols)`.
    fn sum_rows(
        &self,
        source: ArrayView2<'_, WeightPrecision>,
        target: ArrayViewMut2<'_, WeightPrecision>,
        scale_target: WeightPrecision,
        scale_source: WeightPrecision,
    ) -> Result<()>;

    /// Sums over columns: `(rows, cols) -> (rows, 1)`.
    fn sum_cols(
        &self,
        source: ArrayView2<'_, WeightPrecision>,
        target: ArrayViewMut2<'_, WeightPrecision>,
        scale_target: WeightPrecision,
        scale_source: WeightPrecision,
    ) -> Result<()>;

    /// Adds the `(1, cols)` vector to every row of `target`.
    fn add_row_vector(
        &self,
        target: ArrayViewMut2<'_, WeightPrecision>,
        vector: ArrayView2<'_, WeightPrecision>,
    ) -> Result<()>;

    /// Pool of temporary tensors owned by this backend.
    fn scratch(&self) -> &ScratchPool;
}
