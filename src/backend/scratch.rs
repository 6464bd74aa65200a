//! Pooled scratch buffers for temporary tensors.
//!
//! A buffer handed out by [`ScratchPool::borrow`] is removed from the pool
//! until its [`Scratch`] guard is dropped, so two borrowers never share one.

use std::cell::RefCell;
use std::collections::HashMap;

use log::debug;
use ndarray::{ArrayView2, ArrayViewMut2};

use crate::error::{shape, Result};
use crate::WeightPrecision;

#[derive(Debug, Default)]
pub struct ScratchPool {
    free: RefCell<HashMap<usize, Vec<Vec<WeightPrecision>>>>,
    reserved: RefCell<HashMap<usize, usize>>,
}

impl ScratchPool {
    pub fn new() -> ScratchPool {
        ScratchPool::default()
    }

    /// Makes sure one buffer of `len` elements is ready before the first
    /// borrow. Repeated reservations of the same size share the buffer.
    pub fn reserve(&self, len: usize, why: &str) {
        let mut reserved = self.reserved.borrow_mut();
        let count = reserved.entry(len).or_insert(0);
        *count += 1;
        if *count == 1 {
            debug!("reserving {} scratch elements for {}", len, why);
            self.free
                .borrow_mut()
                .entry(len)
                .or_insert_with(Vec::new)
                .push(vec![0.0; len]);
        }
    }

    /// Number of idle buffers of exactly `len` elements.
    pub fn available(&self, len: usize) -> usize {
        self.free.borrow().get(&len).map_or(0, Vec::len)
    }

    /// Borrows a `rows x cols` buffer. Contents are unspecified; callers
    /// overwrite it before reading.
    pub fn borrow(&self, rows: usize, cols: usize) -> Scratch<'_> {
        let len = rows * cols;
        let data = self
            .free
            .borrow_mut()
            .get_mut(&len)
            .and_then(Vec::pop)
            .unwrap_or_else(|| vec![0.0; len]);
        Scratch {
            pool: self,
            data,
            rows,
            cols,
        }
    }

    fn release(&self, data: Vec<WeightPrecision>) {
        self.free
            .borrow_mut()
            .entry(data.len())
            .or_insert_with(Vec::new)
            .push(data);
    }
}

/// A borrowed scratch tensor, returned to its pool on drop.
#[derive(Debug)]
pub struct Scratch<'a> {
    pool: &'a ScratchPool,
    data: Vec<WeightPrecision>,
    rows: usize,
    cols: usize,
}

impl<'a> Scratch<'a> {
    pub fn dim(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn reshape(&mut self, rows: usize, cols: usize) -> Result<()> {
        if rows * cols != self.data.len() {
            return Err(shape(format!(
                "cannot reshape {}x{} scratch to {}x{}",
                self.rows, self.cols, rows, cols
            )));
        }
        self.rows = rows;
        self.cols = cols;
        Ok(())
    }

    /// # Panics
    ///
    /// Never in practice: `borrow` sizes the buffer as `rows * cols` and
    /// `reshape` refuses any shape with a different element count, so the
    /// shape always matches the buffer.
    pub fn view(&self) -> ArrayView2<'_, WeightPrecision> {
        ArrayView2::from_shape((self.rows, self.cols), &self.data[..])
            .expect("scratch length always matches its shape")
    }

    /// # Panics
    ///
    /// Never in practice, for the same reason as [`Scratch::view`].
    pub fn view_mut(&mut self) -> ArrayViewMut2<'_, WeightPrecision> {
        ArrayViewMut2::from_shape((self.rows, self.cols), &mut self.data[..])
            .expect("scratch length always matches its shape")
    }
}

impl<'a> Drop for Scratch<'a> {
    fn drop(&mut self) {
        let data = std::mem::take(&mut self.data);
        self.pool.release(data);
    }
}
