//! Reference backend running every primitive on the host with ndarray.
//!
//! Convolutions use the im2col technique: each output location's input patch
//! is unrolled into one row, so the whole convolution becomes one matrix
//! product. Read more here:
//! - <https://leonardoaraujosantos.gitbook.io/artificial-inteligence/machine_learning/deep_learning/convolution_layer/making_faster>

use log::{debug, trace};
use ndarray::*;
use num_traits::Float;

use super::{Backend, ConvShape, ScratchPool};
use crate::error::{shape as shape_error, Result};
use crate::geometry::div_up;
use crate::WeightPrecision;

#[derive(Debug, Default)]
pub struct CpuBackend {
    scratch: ScratchPool,
}

impl CpuBackend {
    pub fn open() -> CpuBackend {
        debug!("opening cpu backend");
        CpuBackend::default()
    }

    pub fn close(self) {
        debug!("closing cpu backend");
    }
}

fn expect_dim(what: &str, actual: (usize, usize), expected: (usize, usize)) -> Result<()> {
    if actual != expected {
        return Err(shape_error(format!(
            "{} has shape {:?}, expected {:?}",
            what, actual, expected
        )));
    }
    Ok(())
}

/// `target *= scale_targets`, where a zero scale clears the target.
fn scale_targets_in_place<F: Float>(target: &mut ArrayViewMut2<F>, scale_targets: F) {
    if scale_targets == F::zero() {
        target.fill(F::zero());
    } else if scale_targets != F::one() {
        target.mapv_inplace(|x| x * scale_targets);
    }
}

/// Number of filters of an output whose rows hold `num_locations` positions.
fn filters_of(what: &str, cols: usize, num_locations: usize) -> Result<usize> {
    if num_locations == 0 || cols % num_locations != 0 {
        return Err(shape_error(format!(
            "{} has {} columns, not a multiple of {} output locations",
            what, cols, num_locations
        )));
    }
    Ok(cols / num_locations)
}

/// Image coordinates under each kernel tap of module `(my, mx)`, in
/// `(ky, kx)` order. `None` marks a tap landing in the padding.
fn window(shape: &ConvShape, my: usize, mx: usize) -> impl Iterator<Item = Option<(usize, usize)>> {
    let k = shape.kernel_size;
    let y0 = (my * shape.stride) as isize - shape.padding as isize;
    let x0 = (mx * shape.stride) as isize - shape.padding as isize;
    let (h, w) = (shape.image_size_y as isize, shape.image_size_x as isize);
    (0..k * k).map(move |tap| {
        let y = y0 + (tap / k) as isize;
        let x = x0 + (tap % k) as isize;
        if y >= 0 && y < h && x >= 0 && x < w {
            Some((y as usize, x as usize))
        } else {
            None
        }
    })
}

fn pixel(shape: &ConvShape, y: usize, x: usize) -> usize {
    (y * shape.image_size_x + x) * shape.num_input_channels
}

/// Unrolls one image row into a `(locations, K * K * C)` patch matrix.
/// Taps that fall into the padding stay zero.
pub(crate) fn im2col_ref<'a, T, F: 'a + Float>(im_arr: T, shape: &ConvShape) -> Array2<F>
where
    T: AsArray<'a, F, Ix1>,
{
    let image: ArrayView1<F> = im_arr.into();
    let channels = shape.num_input_channels;
    let mut cols_img: Array2<F> = Array::zeros((shape.num_locations(), shape.filter_input_size()));
    let mut cont = 0_usize;
    for my in 0..shape.num_modules_y {
        for mx in 0..shape.num_modules_x {
            let mut row = cols_img.row_mut(cont);
            for (tap, pos) in window(shape, my, mx).enumerate() {
                if let Some((y, x)) = pos {
                    let start = pixel(shape, y, x);
                    row.slice_mut(s![tap * channels..(tap + 1) * channels])
                        .assign(&image.slice(s![start..start + channels]));
                }
            }
            cont += 1;
        }
    }
    cols_img
}

/// Adds one unrolled patch back onto the pixels it was taken from.
fn scatter_patch<F: Float + std::ops::AddAssign>(
    patch: ArrayView1<F>,
    module: usize,
    image: &mut ArrayViewMut1<F>,
    shape: &ConvShape,
) {
    let channels = shape.num_input_channels;
    let (my, mx) = (module / shape.num_modules_x, module % shape.num_modules_x);
    for (tap, pos) in window(shape, my, mx).enumerate() {
        if let Some((y, x)) = pos {
            let start = pixel(shape, y, x);
            let mut target = image.slice_mut(s![start..start + channels]);
            target += &patch.slice(s![tap * channels..(tap + 1) * channels]);
        }
    }
}

/// Inverse of [`im2col_ref`]: overlapping patches accumulate.
fn col2im_add<F: Float + std::ops::AddAssign>(
    cols: ArrayView2<F>,
    image: &mut ArrayViewMut1<F>,
    shape: &ConvShape,
) {
    for (module, patch) in cols.outer_iter().enumerate() {
        scatter_patch(patch, module, image, shape);
    }
}

/// Module indices of every `partial_sum x partial_sum` tile of the output grid.
fn partial_sum_blocks(shape: &ConvShape, partial_sum: usize) -> Vec<Vec<usize>> {
    let blocks_x = div_up(shape.num_modules_x, partial_sum);
    let blocks_y = div_up(shape.num_modules_y, partial_sum);
    let mut blocks = vec![Vec::new(); blocks_x * blocks_y];
    for my in 0..shape.num_modules_y {
        for mx in 0..shape.num_modules_x {
            let block = (my / partial_sum) * blocks_x + mx / partial_sum;
            blocks[block].push(my * shape.num_modules_x + mx);
        }
    }
    blocks
}

impl Backend for CpuBackend {
    fn conv_forward(
        &self,
        input: ArrayView2<'_, WeightPrecision>,
        weights: ArrayView2<'_, WeightPrecision>,
        mut output: ArrayViewMut2<'_, WeightPrecision>,
        shape: &ConvShape,
        scale_targets: WeightPrecision,
    ) -> Result<()> {
        let batch = input.nrows();
        let num_filters = weights.nrows();
        expect_dim("conv input", input.dim(), (batch, shape.image_cols()))?;
        expect_dim("conv weights", weights.dim(), (num_filters, shape.filter_input_size()))?;
        expect_dim(
            "conv output",
            output.dim(),
            (batch, shape.num_locations() * num_filters),
        )?;
        trace!("conv_forward batch={} filters={}", batch, num_filters);

        scale_targets_in_place(&mut output, scale_targets);
        let filter_transpose = weights.t();
        for (image, mut out_row) in input.outer_iter().zip(output.outer_iter_mut()) {
            let im_col = im2col_ref(image, shape);
            let mul = im_col.dot(&filter_transpose);
            out_row += &mul.into_shape(shape.num_locations() * num_filters)?;
        }
        Ok(())
    }

    fn conv_backward_input(
        &self,
        deriv_output: ArrayView2<'_, WeightPrecision>,
        weights: ArrayView2<'_, WeightPrecision>,
        mut deriv_input: ArrayViewMut2<'_, WeightPrecision>,
        shape: &ConvShape,
        scale_targets: WeightPrecision,
    ) -> Result<()> {
        let batch = deriv_output.nrows();
        let num_filters = weights.nrows();
        expect_dim("conv weights", weights.dim(), (num_filters, shape.filter_input_size()))?;
        expect_dim(
            "conv output derivative",
            deriv_output.dim(),
            (batch, shape.num_locations() * num_filters),
        )?;
        expect_dim("conv input derivative", deriv_input.dim(), (batch, shape.image_cols()))?;

        scale_targets_in_place(&mut deriv_input, scale_targets);
        for (d_row, mut di_row) in deriv_output.outer_iter().zip(deriv_input.outer_iter_mut()) {
            let d = d_row.to_owned().into_shape((shape.num_locations(), num_filters))?;
            let cols = d.dot(&weights);
            col2im_add(cols.view(), &mut di_row, shape);
        }
        Ok(())
    }

    fn conv_backward_weights(
        &self,
        input: ArrayView2<'_, WeightPrecision>,
        deriv_output: ArrayView2<'_, WeightPrecision>,
        mut dw: ArrayViewMut2<'_, WeightPrecision>,
        shape: &ConvShape,
        partial_sum: usize,
        scale_targets: WeightPrecision,
        scale_outputs: WeightPrecision,
    ) -> Result<()> {
        let batch = input.nrows();
        let num_locations = shape.num_locations();
        let num_filters = filters_of("conv output derivative", deriv_output.ncols(), num_locations)?;
        let filter_input_size = shape.filter_input_size();
        expect_dim("conv input", input.dim(), (batch, shape.image_cols()))?;
        expect_dim("conv output derivative", deriv_output.dim(), (batch, num_locations * num_filters))?;

        let blocks = if partial_sum > 0 {
            partial_sum_blocks(shape, partial_sum)
        } else {
            vec![(0..num_locations).collect()]
        };
        let num_blocks = blocks.len();
        expect_dim(
            "conv weight gradient",
            dw.dim(),
            (num_filters, filter_input_size * num_blocks),
        )?;

        scale_targets_in_place(&mut dw, scale_targets);
        for (image, d_row) in input.outer_iter().zip(deriv_output.outer_iter()) {
            let im_col = im2col_ref(image, shape);
            let d = d_row.to_owned().into_shape((num_locations, num_filters))?;
            for (block, modules) in blocks.iter().enumerate() {
                let grad = d
                    .select(Axis(0), modules)
                    .t()
                    .dot(&im_col.select(Axis(0), modules));
                if num_blocks == 1 {
                    dw.scaled_add(scale_outputs, &grad);
                } else {
                    // Block index runs fastest within each filter row.
                    let mut target = dw.slice_mut(s![.., block..;num_blocks]);
                    target.scaled_add(scale_outputs, &grad);
                }
            }
        }
        Ok(())
    }

    fn local_forward(
        &self,
        input: ArrayView2<'_, WeightPrecision>,
        weights: ArrayView2<'_, WeightPrecision>,
        mut output: ArrayViewMut2<'_, WeightPrecision>,
        shape: &ConvShape,
        scale_targets: WeightPrecision,
    ) -> Result<()> {
        let batch = input.nrows();
        let num_filters = weights.nrows();
        let fis = shape.filter_input_size();
        expect_dim("local input", input.dim(), (batch, shape.image_cols()))?;
        expect_dim(
            "local weights",
            weights.dim(),
            (num_filters, fis * shape.num_locations()),
        )?;
        expect_dim(
            "local output",
            output.dim(),
            (batch, shape.num_locations() * num_filters),
        )?;

        scale_targets_in_place(&mut output, scale_targets);
        for (image, mut out_row) in input.outer_iter().zip(output.outer_iter_mut()) {
            let im_col = im2col_ref(image, shape);
            for (module, patch) in im_col.outer_iter().enumerate() {
                let filter = weights.slice(s![.., module * fis..(module + 1) * fis]);
                let mut target = out_row.slice_mut(s![module * num_filters..(module + 1) * num_filters]);
                target += &filter.dot(&patch);
            }
        }
        Ok(())
    }

    fn local_backward_input(
        &self,
        deriv_output: ArrayView2<'_, WeightPrecision>,
        weights: ArrayView2<'_, WeightPrecision>,
        mut deriv_input: ArrayViewMut2<'_, WeightPrecision>,
        shape: &ConvShape,
        scale_targets: WeightPrecision,
    ) -> Result<()> {
        let batch = deriv_output.nrows();
        let num_filters = weights.nrows();
        let fis = shape.filter_input_size();
        expect_dim(
            "local weights",
            weights.dim(),
            (num_filters, fis * shape.num_locations()),
        )?;
        expect_dim(
            "local output derivative",
            deriv_output.dim(),
            (batch, shape.num_locations() * num_filters),
        )?;
        expect_dim("local input derivative", deriv_input.dim(), (batch, shape.image_cols()))?;

        scale_targets_in_place(&mut deriv_input, scale_targets);
        for (d_row, mut di_row) in deriv_output.outer_iter().zip(deriv_input.outer_iter_mut()) {
            for module in 0..shape.num_locations() {
                let filter = weights.slice(s![.., module * fis..(module + 1) * fis]);
                let grad = d_row.slice(s![module * num_filters..(module + 1) * num_filters]);
                let patch = filter.t().dot(&grad);
                scatter_patch(patch.view(), module, &mut di_row, shape);
            }
        }
        Ok(())
    }

    fn local_backward_weights(
        &self,
        input: ArrayView2<'_, WeightPrecision>,
        deriv_output: ArrayView2<'_, WeightPrecision>,
        mut dw: ArrayViewMut2<'_, WeightPrecision>,
        shape: &ConvShape,
        scale_targets: WeightPrecision,
        scale_outputs: WeightPrecision,
    ) -> Result<()> {
        let batch = input.nrows();
        let num_locations = shape.num_locations();
        let num_filters = filters_of("local output derivative", deriv_output.ncols(), num_locations)?;
        let fis = shape.filter_input_size();
        expect_dim("local input", input.dim(), (batch, shape.image_cols()))?;
        expect_dim("local weight gradient", dw.dim(), (num_filters, fis * num_locations))?;

        scale_targets_in_place(&mut dw, scale_targets);
        for (image, d_row) in input.outer_iter().zip(deriv_output.outer_iter()) {
            let im_col = im2col_ref(image, shape);
            for (module, patch) in im_col.outer_iter().enumerate() {
                let grad = d_row.slice(s![module * num_filters..(module + 1) * num_filters]);
                let outer = grad
                    .insert_axis(Axis(1))
                    .dot(&patch.insert_axis(Axis(0)));
                dw.slice_mut(s![.., module * fis..(module + 1) * fis])
                    .scaled_add(scale_outputs, &outer);
            }
        }
        Ok(())
    }

    fn max_pool(
        &self,
        input: ArrayView2<'_, WeightPrecision>,
        mut output: ArrayViewMut2<'_, WeightPrecision>,
        shape: &ConvShape,
        scale_targets: WeightPrecision,
    ) -> Result<()> {
        let batch = input.nrows();
        let channels = shape.num_input_channels;
        expect_dim("pool input", input.dim(), (batch, shape.image_cols()))?;
        expect_dim("pool output", output.dim(), (batch, shape.num_locations() * channels))?;

        scale_targets_in_place(&mut output, scale_targets);
        for (image, mut out_row) in input.outer_iter().zip(output.outer_iter_mut()) {
            for module in 0..shape.num_locations() {
                let (my, mx) = (module / shape.num_modules_x, module % shape.num_modules_x);
                for c in 0..channels {
                    let best = window(shape, my, mx)
                        .flatten()
                        .map(|(y, x)| image[pixel(shape, y, x) + c])
                        .fold(None, |best: Option<WeightPrecision>, v| {
                            Some(best.map_or(v, |b| b.max(v)))
                        });
                    out_row[module * channels + c] += best.unwrap_or(0.0);
                }
            }
        }
        Ok(())
    }

    fn max_pool_undo(
        &self,
        input: ArrayView2<'_, WeightPrecision>,
        deriv_output: ArrayView2<'_, WeightPrecision>,
        output: ArrayView2<'_, WeightPrecision>,
        mut deriv_input: ArrayViewMut2<'_, WeightPrecision>,
        shape: &ConvShape,
        scale_targets: WeightPrecision,
    ) -> Result<()> {
        let batch = input.nrows();
        let channels = shape.num_input_channels;
        let out_dim = (batch, shape.num_locations() * channels);
        expect_dim("pool input", input.dim(), (batch, shape.image_cols()))?;
        expect_dim("pool output", output.dim(), out_dim)?;
        expect_dim("pool output derivative", deriv_output.dim(), out_dim)?;
        expect_dim("pool input derivative", deriv_input.dim(), (batch, shape.image_cols()))?;

        scale_targets_in_place(&mut deriv_input, scale_targets);
        for ((image, d_row), mut di_row) in input
            .outer_iter()
            .zip(deriv_output.outer_iter())
            .zip(deriv_input.outer_iter_mut())
        {
            for module in 0..shape.num_locations() {
                let (my, mx) = (module / shape.num_modules_x, module % shape.num_modules_x);
                for c in 0..channels {
                    let mut arg_max: Option<(usize, WeightPrecision)> = None;
                    for (y, x) in window(shape, my, mx).flatten() {
                        let index = pixel(shape, y, x) + c;
                        if arg_max.map_or(true, |(_, best)| image[index] > best) {
                            arg_max = Some((index, image[index]));
                        }
                    }
                    if let Some((index, _)) = arg_max {
                        di_row[index] += d_row[module * channels + c];
                    }
                }
            }
        }
        Ok(())
    }

    fn avg_pool(
        &self,
        input: ArrayView2<'_, WeightPrecision>,
        mut output: ArrayViewMut2<'_, WeightPrecision>,
        shape: &ConvShape,
        scale_targets: WeightPrecision,
    ) -> Result<()> {
        let batch = input.nrows();
        let channels = shape.num_input_channels;
        expect_dim("pool input", input.dim(), (batch, shape.image_cols()))?;
        expect_dim("pool output", output.dim(), (batch, shape.num_locations() * channels))?;

        scale_targets_in_place(&mut output, scale_targets);
        for (image, mut out_row) in input.outer_iter().zip(output.outer_iter_mut()) {
            for module in 0..shape.num_locations() {
                let (my, mx) = (module / shape.num_modules_x, module % shape.num_modules_x);
                let taps: Vec<usize> = window(shape, my, mx)
                    .flatten()
                    .map(|(y, x)| pixel(shape, y, x))
                    .collect();
                if taps.is_empty() {
                    continue;
                }
                let count = taps.len() as WeightPrecision;
                for c in 0..channels {
                    let sum: WeightPrecision = taps.iter().map(|&p| image[p + c]).sum();
                    out_row[module * channels + c] += sum / count;
                }
            }
        }
        Ok(())
    }

    fn avg_pool_undo(
        &self,
        deriv_output: ArrayView2<'_, WeightPrecision>,
        mut deriv_input: ArrayViewMut2<'_, WeightPrecision>,
        shape: &ConvShape,
        scale_targets: WeightPrecision,
    ) -> Result<()> {
        let batch = deriv_output.nrows();
        let channels = shape.num_input_channels;
        expect_dim(
            "pool output derivative",
            deriv_output.dim(),
            (batch, shape.num_locations() * channels),
        )?;
        expect_dim("pool input derivative", deriv_input.dim(), (batch, shape.image_cols()))?;

        scale_targets_in_place(&mut deriv_input, scale_targets);
        for (d_row, mut di_row) in deriv_output.outer_iter().zip(deriv_input.outer_iter_mut()) {
            for module in 0..shape.num_locations() {
                let (my, mx) = (module / shape.num_modules_x, module % shape.num_modules_x);
                let taps: Vec<usize> = window(shape, my, mx)
                    .flatten()
                    .map(|(y, x)| pixel(shape, y, x))
                    .collect();
                let count = taps.len() as WeightPrecision;
                for c in 0..channels {
                    let share = d_row[module * channels + c] / count;
                    for &p in taps.iter() {
                        di_row[p + c] += share;
                    }
                }
            }
        }
        Ok(())
    }

    fn sum_rows(
        &self,
        source: ArrayView2<'_, WeightPrecision>,
        mut target: ArrayViewMut2<'_, WeightPrecision>,
        scale_target: WeightPrecision,
        scale_source: WeightPrecision,
    ) -> Result<()> {
        expect_dim("row sum target", target.dim(), (1, source.ncols()))?;
        scale_targets_in_place(&mut target, scale_target);
        target
            .row_mut(0)
            .scaled_add(scale_source, &source.sum_axis(Axis(0)));
        Ok(())
    }

    fn sum_cols(
        &self,
        source: ArrayView2<'_, WeightPrecision>,
        mut target: ArrayViewMut2<'_, WeightPrecision>,
        scale_target: WeightPrecision,
        scale_source: WeightPrecision,
    ) -> Result<()> {
        expect_dim("column sum target", target.dim(), (source.nrows(), 1))?;
        scale_targets_in_place(&mut target, scale_target);
        target
            .column_mut(0)
            .scaled_add(scale_source, &source.sum_axis(Axis(1)));
        Ok(())
    }

    fn add_row_vector(
        &self,
        mut target: ArrayViewMut2<'_, WeightPrecision>,
        vector: ArrayView2<'_, WeightPrecision>,
    ) -> Result<()> {
        expect_dim("row vector", vector.dim(), (1, target.ncols()))?;
        target += &vector.row(0);
        Ok(())
    }

    fn scratch(&self) -> &ScratchPool {
        &self.scratch
    }
}
