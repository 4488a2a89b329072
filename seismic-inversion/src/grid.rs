use ndarray::Array2;

use crate::error::{InversionError, Result};

/// Model and gradient grid. Fields on it are `Array2` indexed `[[i, k]]`,
/// `i` along the surface and `k` down into the subsurface.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    pub nx: usize,
    /// Depth cells; `k = 0` is the top row.
    pub nz: usize,
    pub dx: f64,
    pub dz: f64,
    /// Position in metres of cell `(0, 0)`, so sources and receivers
    /// given in metres land on the same cells after a shift.
    pub x0: f64,
    pub z0: f64,
}

impl Grid {
    pub fn new(nx: usize, nz: usize, dx: f64, dz: f64) -> Self {
        Grid {
            nx,
            nz,
            dx,
            dz,
            x0: 0.0,
            z0: 0.0,
        }
    }

    pub fn with_origin(mut self, x0: f64, z0: f64) -> Self {
        self.x0 = x0;
        self.z0 = z0;
        self
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.nx, self.nz)
    }

    pub fn len(&self) -> usize {
        self.nx * self.nz
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn zeros(&self) -> Array2<f64> {
        Array2::zeros(self.shape())
    }

    pub fn ones(&self) -> Array2<f64> {
        Array2::ones(self.shape())
    }

    pub fn x_coord(&self, i: usize) -> f64 {
        self.x0 + self.dx * (i as f64)
    }

    pub fn z_coord(&self, k: usize) -> f64 {
        self.z0 + self.dz * (k as f64)
    }

    pub fn in_bounds(&self, i: i64, k: i64) -> bool {
        i >= 0 && k >= 0 && (i as usize) < self.nx && (k as usize) < self.nz
    }

    /// Row-major offset, depth fastest; matches the `.mtx` file layout.
    pub fn index(&self, i: usize, k: usize) -> usize {
        i * self.nz + k
    }

    pub fn coordinate(&self, index: usize) -> (usize, usize) {
        (index / self.nz, index % self.nz)
    }

    /// Cell index (possibly outside the grid) nearest to a physical position.
    pub fn nearest_cell(&self, x: f64, z: f64) -> (i64, i64) {
        (
            ((x - self.x0) / self.dx).round() as i64,
            ((z - self.z0) / self.dz).round() as i64,
        )
    }

    /// Fails unless `field` lives on this grid.
    pub fn check(&self, field: &Array2<f64>) -> Result<()> {
        if field.dim() != self.shape() {
            return Err(InversionError::ShapeMismatch {
                expected: self.shape(),
                actual: field.dim(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_round_trips_through_coordinate() {
        let grid = Grid::new(4, 3, 1.0, 1.0);
        for idx in 0..grid.len() {
            let (i, k) = grid.coordinate(idx);
            assert_eq!(grid.index(i, k), idx);
        }
        assert_eq!(grid.index(2, 1), 7);
    }

    #[test]
    fn flat_index_follows_field_iteration_order() {
        let grid = Grid::new(3, 5, 1.0, 1.0);
        let field = Array2::from_shape_fn(grid.shape(), |(i, k)| grid.index(i, k) as f64);
        assert!(field.iter().enumerate().all(|(n, &v)| v == n as f64));
    }

    #[test]
    fn nearest_cell_respects_origin() {
        let grid = Grid::new(10, 10, 2.0, 2.0).with_origin(10.0, 0.0);
        assert_eq!(grid.nearest_cell(14.2, 3.1), (2, 2));
        assert!(!grid.in_bounds(-1, 0));
        assert!(grid.in_bounds(9, 9));
    }
}
