//! Spatial arithmetic shared by every edge kind: output grid sizing and
//! field-of-view propagation.
//!
//! More can be read here:
//! - <https://theano-pymc.readthedocs.io/en/latest/tutorial/conv_arithmetic.html>

use serde::{Deserialize, Serialize};

use crate::error::{configuration, Result};

/// Kernel geometry of an edge. Kernels are always square.
#[derive(PartialEq, Eq, Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Geometry {
    pub kernel_size: usize,
    pub stride: usize,
    pub padding: usize,
}

impl Geometry {
    pub fn new(kernel_size: usize, stride: usize, padding: usize) -> Result<Geometry> {
        if kernel_size == 0 {
            return Err(configuration("kernel size of 0 passed"));
        }
        if stride == 0 {
            return Err(configuration("stride of 0 passed"));
        }
        Ok(Geometry {
            kernel_size,
            stride,
            padding,
        })
    }

    /// Number of output positions along one axis:
    /// `floor((image_size + 2 * padding - kernel_size) / stride) + 1`.
    ///
    /// A trailing strip of the image that does not fit a whole stride is
    /// dropped silently; only a kernel larger than the padded image is an error.
    pub fn num_modules(&self, image_size: usize) -> Result<usize> {
        let padded = image_size + 2 * self.padding;
        if padded < self.kernel_size {
            return Err(configuration(format!(
                "kernel of size {} does not fit an image of size {} with padding {}",
                self.kernel_size, image_size, self.padding
            )));
        }
        Ok((padded - self.kernel_size) / self.stride + 1)
    }

    /// Number of weights in one filter: kernel_size² × input channels.
    pub fn filter_input_size(&self, num_input_channels: usize) -> usize {
        self.kernel_size * self.kernel_size * num_input_channels
    }

    /// Moves a field of view one edge closer to the input.
    ///
    /// `fov` describes what an output unit sees in terms of this edge's
    /// output grid; the result describes it in terms of this edge's input
    /// image, whose width is `image_size_x`.
    pub fn field_of_view(&self, image_size_x: usize, fov: FieldOfView) -> FieldOfView {
        let kernel = self.kernel_size as isize;
        let stride = self.stride as isize;
        let padding = self.padding as isize;
        let image = image_size_x as isize;

        let k = (image + 2 * padding - kernel) / stride;
        let effective_right_pad = k * stride - (image + padding - kernel);
        FieldOfView {
            size: kernel + stride * (fov.size - 1),
            sep: fov.sep * stride,
            pad1: fov.pad1 * stride + padding,
            pad2: fov.pad2 * stride + effective_right_pad,
        }
    }
}

/// Receptive field of a unit: extent, separation between adjacent units,
/// and the padding hanging off the left and right edge of the image.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub struct FieldOfView {
    pub size: isize,
    pub sep: isize,
    pub pad1: isize,
    pub pad2: isize,
}

impl FieldOfView {
    /// A single unit at the output: sees itself, nothing padded.
    pub fn unit() -> FieldOfView {
        FieldOfView {
            size: 1,
            sep: 1,
            pad1: 0,
            pad2: 0,
        }
    }
}

impl Default for FieldOfView {
    fn default() -> Self {
        FieldOfView::unit()
    }
}

/// Input image size together with the output grid derived from it.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub struct Spatial {
    pub image_size_y: usize,
    pub image_size_x: usize,
    pub num_modules_y: usize,
    pub num_modules_x: usize,
}

impl Spatial {
    pub fn resolve(geometry: &Geometry, image_size_y: usize, image_size_x: usize) -> Result<Spatial> {
        Ok(Spatial {
            image_size_y,
            image_size_x,
            num_modules_y: geometry.num_modules(image_size_y)?,
            num_modules_x: geometry.num_modules(image_size_x)?,
        })
    }

    pub fn num_pixels(&self) -> usize {
        self.image_size_y * self.image_size_x
    }

    pub fn num_locations(&self) -> usize {
        self.num_modules_y * self.num_modules_x
    }
}

/// Integer division rounding up.
pub(crate) fn div_up(a: usize, b: usize) -> usize {
    (a + b - 1) / b
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modules_follow_floor_formula() {
        for image in 1..20 {
            for kernel in 1..6 {
                for stride in 1..4 {
                    for padding in 0..3 {
                        let g = Geometry::new(kernel, stride, padding).unwrap();
                        if image + 2 * padding < kernel {
                            assert!(g.num_modules(image).is_err());
                            continue;
                        }
                        let expected =
                            ((image + 2 * padding - kernel) as f64 / stride as f64).floor() as usize + 1;
                        assert_eq!(g.num_modules(image).unwrap(), expected);
                    }
                }
            }
        }
    }

    #[test]
    fn scenario_sizes() {
        let same = Geometry::new(3, 1, 1).unwrap();
        assert_eq!(same.num_modules(8).unwrap(), 8);
        let strided = Geometry::new(4, 2, 0).unwrap();
        assert_eq!(strided.num_modules(8).unwrap(), 3);
    }

    #[test]
    fn trailing_strip_is_dropped() {
        // 9 + 0 - 4 = 5, 5 / 2 = 2 -> one pixel column never covered.
        let g = Geometry::new(4, 2, 0).unwrap();
        assert_eq!(g.num_modules(9).unwrap(), 3);
    }

    #[test]
    fn zero_stride_rejected() {
        assert!(Geometry::new(3, 0, 0).is_err());
        assert!(Geometry::new(0, 1, 0).is_err());
    }

    #[test]
    fn field_of_view_regression() {
        let first = Geometry::new(3, 1, 1).unwrap();
        let second = Geometry::new(3, 2, 1).unwrap();
        // second edge sits on the 8x8 output of the first one.
        let fov = second.field_of_view(8, FieldOfView::unit());
        assert_eq!(
            fov,
            FieldOfView {
                size: 3,
                sep: 2,
                pad1: 1,
                pad2: 0
            }
        );
        let fov = first.field_of_view(8, fov);
        assert_eq!(
            fov,
            FieldOfView {
                size: 5,
                sep: 2,
                pad1: 2,
                pad2: 1
            }
        );
    }

    #[test]
    fn field_of_view_composes() {
        let pairs = [
            ((3, 1, 1), (3, 2, 1)),
            ((5, 2, 2), (3, 1, 0)),
            ((2, 2, 0), (4, 3, 1)),
        ];
        for &((k1, s1, p1), (k2, s2, p2)) in pairs.iter() {
            let first = Geometry::new(k1, s1, p1).unwrap();
            let second = Geometry::new(k2, s2, p2).unwrap();
            let stepwise = first.field_of_view(32, second.field_of_view(16, FieldOfView::unit()));
            let combined = Geometry::new(k1 + s1 * (k2 - 1), s1 * s2, p1 + s1 * p2).unwrap();
            let direct = combined.field_of_view(32, FieldOfView::unit());
            assert_eq!(stepwise.size, direct.size);
            assert_eq!(stepwise.sep, direct.sep);
            assert_eq!(stepwise.pad1, direct.pad1);
        }
    }

    #[test]
    fn div_up_rounds() {
        assert_eq!(div_up(8, 3), 3);
        assert_eq!(div_up(9, 3), 3);
        assert_eq!(div_up(1, 4), 1);
    }
}
