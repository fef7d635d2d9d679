//! Decomposable iteration domains.
//!
//! A [`Range`] is split in two phases. [`create_instance`](Range::create_instance)
//! carves the whole domain into one coarse, exclusive partition per worker.
//! The worker owning a partition then calls
//! [`split_blocked_range`](Range::split_blocked_range) repeatedly to pull small
//! grains out of it, so grain creation never contends with other workers.

use std::cmp;
use std::ops;

/// A domain that can be partitioned and pulled grain by grain.
pub trait Range: Clone + Send + 'static {
    /// Returns piece `index` of `total` contiguous, non-overlapping pieces
    /// covering the whole range. The last piece absorbs the remainder.
    ///
    /// # Panics
    ///
    /// Panics if `total == 0` or `index >= total`.
    fn create_instance(&self, index: usize, total: usize) -> Self;

    /// Advances the internal cursor and returns up to `grains_wanted`
    /// further grains. An empty vector means the range is exhausted, or that
    /// `grains_wanted` was zero, in which case the cursor does not move.
    fn split_blocked_range(&mut self, grains_wanted: usize) -> Vec<Self>;
}

/// A half-open interval `[start, end)` pulled in grains of `step` indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Range1D {
    start: usize,
    end: usize,
    step: usize,
    cursor: usize,
}

impl Range1D {
    /// # Panics
    ///
    /// Panics if `step == 0` or `start > end`.
    pub fn new(start: usize, end: usize, step: usize) -> Self {
        assert!(step > 0, "range step must be positive");
        assert!(start <= end, "range start {} is past end {}", start, end);
        Range1D {
            start,
            end,
            step,
            cursor: start,
        }
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn end(&self) -> usize {
        self.end
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// The indices covered by this range.
    pub fn indices(&self) -> ops::Range<usize> {
        self.start..self.end
    }

    /// Returns true once every grain has been pulled.
    pub fn is_exhausted(&self) -> bool {
        self.cursor >= self.end
    }

    fn next_grain(&mut self) -> Option<(usize, usize)> {
        if self.is_exhausted() {
            return None;
        }
        let start = self.cursor;
        let end = cmp::min(start.saturating_add(self.step), self.end);
        self.cursor = end;
        Some((start, end))
    }
}

impl Range for Range1D {
    fn create_instance(&self, index: usize, total: usize) -> Self {
        assert!(total > 0, "cannot partition into zero pieces");
        assert!(index < total, "piece {} out of {}", index, total);

        let chunk = self.len() / total;
        let start = self.start + index * chunk;
        let end = if index == total - 1 {
            self.end
        } else {
            start + chunk
        };
        Range1D::new(start, end, self.step)
    }

    fn split_blocked_range(&mut self, grains_wanted: usize) -> Vec<Self> {
        let mut grains = Vec::with_capacity(grains_wanted.min(16));
        while grains.len() < grains_wanted {
            match self.next_grain() {
                Some((start, end)) => grains.push(Range1D::new(start, end, self.step)),
                None => break,
            }
        }
        grains
    }
}

/// A rectangle of `rows × cols`, each axis a [`Range1D`].
///
/// Partitioning splits rows only; every partition keeps the full column
/// width. Grains are `row.step × col.step` tiles walked along the columns of
/// one row band before moving to the next band.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Range2D {
    rows: Range1D,
    cols: Range1D,
    row_cursor: usize,
    col_cursor: usize,
}

impl Range2D {
    pub fn new(rows: Range1D, cols: Range1D) -> Self {
        let rows = Range1D::new(rows.start, rows.end, rows.step);
        let cols = Range1D::new(cols.start, cols.end, cols.step);
        Range2D {
            row_cursor: rows.start,
            col_cursor: cols.start,
            rows,
            cols,
        }
    }

    pub fn rows(&self) -> &Range1D {
        &self.rows
    }

    pub fn cols(&self) -> &Range1D {
        &self.cols
    }

    /// Number of cells covered.
    pub fn area(&self) -> usize {
        self.rows.len() * self.cols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.area() == 0
    }

    /// Every `(row, col)` cell, row by row.
    pub fn cells(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.rows
            .indices()
            .flat_map(move |r| self.cols.indices().map(move |c| (r, c)))
    }
}

impl Range for Range2D {
    fn create_instance(&self, index: usize, total: usize) -> Self {
        Range2D::new(self.rows.create_instance(index, total), self.cols.clone())
    }

    fn split_blocked_range(&mut self, grains_wanted: usize) -> Vec<Self> {
        let mut tiles = Vec::with_capacity(grains_wanted.min(16));
        if grains_wanted == 0 {
            return tiles;
        }
        if self.cols.is_empty() {
            self.row_cursor = self.rows.end;
            return tiles;
        }

        while tiles.len() < grains_wanted && self.row_cursor < self.rows.end {
            let row_end = cmp::min(self.row_cursor.saturating_add(self.rows.step), self.rows.end);
            let col_end = cmp::min(self.col_cursor.saturating_add(self.cols.step), self.cols.end);

            tiles.push(Range2D::new(
                Range1D::new(self.row_cursor, row_end, self.rows.step),
                Range1D::new(self.col_cursor, col_end, self.cols.step),
            ));

            self.col_cursor = col_end;
            if self.col_cursor >= self.cols.end {
                self.col_cursor = self.cols.start;
                self.row_cursor = row_end;
            }
        }
        tiles
    }
}
