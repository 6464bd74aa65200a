//! Parameter and gradient memory.
//!
//! All parameters of a network live in one flat [`Arena`], and all gradients
//! in a second one. Memory is planned in two phases: every edge reports how
//! many elements it needs, an [`ArenaPlanner`] hands out disjoint [`Region`]s,
//! and the arena is allocated once at the total size. Edges then carve their
//! weight and bias [`Slot`]s out of their region. Every view into the arena
//! is checked against its bounds and its element count.

use ndarray::{ArrayView2, ArrayViewMut2};

use crate::error::{shape, Result};
use crate::WeightPrecision;

/// A contiguous `[offset, offset + len)` range of an arena.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub struct Region {
    offset: usize,
    len: usize,
}

impl Region {
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn end(&self) -> usize {
        self.offset + self.len
    }

    /// Sub-range `[start, end)` relative to this region. No copy.
    pub fn slice(&self, start: usize, end: usize) -> Result<Region> {
        if start > end || end > self.len {
            return Err(shape(format!(
                "slice [{}, {}) out of a region of {} elements",
                start, end, self.len
            )));
        }
        Ok(Region {
            offset: self.offset + start,
            len: end - start,
        })
    }

    /// Interprets the region as a row-major `rows x cols` matrix.
    pub fn shaped(self, rows: usize, cols: usize) -> Result<Slot> {
        Slot::new(self, rows, cols)
    }
}

/// A region together with the 2D shape it is viewed with.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub struct Slot {
    region: Region,
    rows: usize,
    cols: usize,
}

impl Slot {
    pub fn new(region: Region, rows: usize, cols: usize) -> Result<Slot> {
        if rows * cols != region.len {
            return Err(shape(format!(
                "cannot view {} elements as {}x{}",
                region.len, rows, cols
            )));
        }
        Ok(Slot { region, rows, cols })
    }

    pub fn region(&self) -> Region {
        self.region
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn dim(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Same elements, new shape. The element count must not change.
    pub fn reshape(&self, rows: usize, cols: usize) -> Result<Slot> {
        Slot::new(self.region, rows, cols)
    }
}

/// Sizing phase of an arena: hands out consecutive regions.
#[derive(Debug, Default)]
pub struct ArenaPlanner {
    cursor: usize,
}

impl ArenaPlanner {
    pub fn new() -> ArenaPlanner {
        ArenaPlanner::default()
    }

    pub fn reserve(&mut self, len: usize) -> Region {
        let region = Region {
            offset: self.cursor,
            len,
        };
        self.cursor += len;
        region
    }

    pub fn total(&self) -> usize {
        self.cursor
    }
}

/// One large zero-initialised buffer that edges view through slots.
#[derive(Debug, Clone)]
pub struct Arena {
    name: String,
    data: Vec<WeightPrecision>,
}

impl Arena {
    pub fn zeros(name: &str, len: usize) -> Arena {
        Arena {
            name: name.to_string(),
            data: vec![0.0; len],
        }
    }

    /// Allocates an arena covering everything `planner` handed out.
    pub fn from_planner(name: &str, planner: &ArenaPlanner) -> Arena {
        Arena::zeros(name, planner.total())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[WeightPrecision] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [WeightPrecision] {
        &mut self.data
    }

    pub fn fill(&mut self, value: WeightPrecision) {
        self.data.iter_mut().for_each(|x| *x = value);
    }

    fn check(&self, region: Region) -> Result<()> {
        if region.end() > self.data.len() {
            return Err(shape(format!(
                "region [{}, {}) exceeds arena `{}` of {} elements",
                region.offset,
                region.end(),
                self.name,
                self.data.len()
            )));
        }
        Ok(())
    }

    pub fn view(&self, slot: &Slot) -> Result<ArrayView2<'_, WeightPrecision>> {
        self.check(slot.region)?;
        let data = &self.data[slot.region.offset..slot.region.end()];
        Ok(ArrayView2::from_shape(slot.dim(), data)?)
    }

    pub fn view_mut(&mut self, slot: &Slot) -> Result<ArrayViewMut2<'_, WeightPrecision>> {
        self.check(slot.region)?;
        let data = &mut self.data[slot.region.offset..slot.region.end()];
        Ok(ArrayViewMut2::from_shape(slot.dim(), data)?)
    }

    /// Mutable views of two disjoint slots at once, `first` must come before
    /// `second` in the arena.
    pub fn view_pair_mut(
        &mut self,
        first: &Slot,
        second: &Slot,
    ) -> Result<(
        ArrayViewMut2<'_, WeightPrecision>,
        ArrayViewMut2<'_, WeightPrecision>,
    )> {
        self.check(first.region)?;
        self.check(second.region)?;
        if first.region.end() > second.region.offset {
            return Err(shape(format!(
                "regions [{}, {}) and [{}, {}) of arena `{}` overlap or are out of order",
                first.region.offset,
                first.region.end(),
                second.region.offset,
                second.region.end(),
                self.name
            )));
        }
        let (head, tail) = self.data.split_at_mut(second.region.offset);
        let a = &mut head[first.region.offset..first.region.end()];
        let b = &mut tail[..second.region.len];
        Ok((
            ArrayViewMut2::from_shape(first.dim(), a)?,
            ArrayViewMut2::from_shape(second.dim(), b)?,
        ))
    }
}
