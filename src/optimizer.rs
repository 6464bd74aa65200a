//! Hooks into the weight-update optimizers.
//!
//! Updates themselves happen outside the edges. When gradient memory is bound,
//! each owning edge asks one optimizer for its weights and one for its bias
//! to allocate state matching their shapes.

use std::fmt;

use ndarray::Array2;

use crate::WeightPrecision;

pub trait Optimizer: fmt::Debug {
    /// Allocates optimizer state for a `rows x cols` parameter tensor.
    fn allocate_memory(&mut self, rows: usize, cols: usize);

    /// Shape of the allocated state, if any.
    fn dim(&self) -> Option<(usize, usize)>;
}

/// Velocity buffer of a momentum optimizer.
#[derive(Debug, Default, Clone)]
pub struct Momentum {
    velocity: Option<Array2<WeightPrecision>>,
}

impl Momentum {
    pub fn new() -> Momentum {
        Momentum::default()
    }

    pub fn velocity(&self) -> Option<&Array2<WeightPrecision>> {
        self.velocity.as_ref()
    }
}

impl Optimizer for Momentum {
    fn allocate_memory(&mut self, rows: usize, cols: usize) {
        self.velocity = Some(Array2::zeros((rows, cols)));
    }

    fn dim(&self) -> Option<(usize, usize)> {
        self.velocity.as_ref().map(|v| v.dim())
    }
}

/// Builds a fresh optimizer for one parameter tensor.
pub type OptimizerFactory<'a> = &'a dyn Fn() -> Box<dyn Optimizer>;

pub fn momentum() -> Box<dyn Optimizer> {
    Box::new(Momentum::new())
}
