//! Multiplicative windows and grid-to-grid operators.

use std::borrow::Cow;
use std::f64::consts::FRAC_PI_2;

use ndarray::{Array1, Array2, Axis, Zip};

use crate::error::{InversionError, Result};
use crate::grid::Grid;
use crate::topology::ShotTopology;
use crate::wavefield::Wavefield;

/// `cos^2` ramp over `[i_start, i_end]`: 0 before, 1 from `i_end` on.
/// `reverse` gives the falling complement.
pub fn calc_cosine_taper(len: usize, i_start: usize, i_end: usize, reverse: bool) -> Result<Array1<f64>> {
    let up = cosine_taper_up(len, i_start, i_end)?;
    Ok(if reverse { up.mapv(|v| 1.0 - v) } else { up })
}

/// Rising ramp over `[i_start1, i_end1]` times falling ramp over `[i_start2, i_end2]`:
/// 0 at both ends, 1 in between. `reverse` gives the complement.
pub fn calc_cosine_taper_two_zone(
    len: usize,
    i_start1: usize,
    i_end1: usize,
    i_start2: usize,
    i_end2: usize,
    reverse: bool,
) -> Result<Array1<f64>> {
    if i_end1 > i_start2 {
        return Err(InversionError::InvalidTaperEdges(format!(
            "first zone ends at {i_end1} after second zone starts at {i_start2}"
        )));
    }
    let up = cosine_taper_up(len, i_start1, i_end1)?;
    let down = cosine_taper_up(len, i_start2, i_end2)?.mapv(|v| 1.0 - v);
    let taper = up * down;
    Ok(if reverse { taper.mapv(|v| 1.0 - v) } else { taper })
}

fn cosine_taper_up(len: usize, i_start: usize, i_end: usize) -> Result<Array1<f64>> {
    if i_start >= i_end || i_end >= len {
        return Err(InversionError::InvalidTaperEdges(format!(
            "need start < end < {len}, got start {i_start}, end {i_end}"
        )));
    }
    let width = (i_end - i_start) as f64;
    Ok(Array1::from_shape_fn(len, |j| {
        if j < i_start {
            0.0
        } else if j >= i_end {
            1.0
        } else {
            let phase = FRAC_PI_2 * (i_end - j) as f64 / width;
            phase.cos().powi(2)
        }
    }))
}

/// One-dimensional window applied along one axis of a 2D array.
#[derive(Debug, Clone)]
pub struct Taper1D {
    data: Array1<f64>,
    axis: Axis,
}

impl Taper1D {
    pub fn new(data: Array1<f64>, axis: Axis) -> Self {
        Taper1D { data, axis }
    }

    pub fn ones(len: usize, axis: Axis) -> Self {
        Self::new(Array1::ones(len), axis)
    }

    pub fn cosine(len: usize, i_start: usize, i_end: usize, reverse: bool, axis: Axis) -> Result<Self> {
        Ok(Self::new(calc_cosine_taper(len, i_start, i_end, reverse)?, axis))
    }

    pub fn data(&self) -> &Array1<f64> {
        &self.data
    }

    /// Multiplies every lane of `target` along the taper axis by the window.
    pub fn apply(&self, target: &mut Array2<f64>) -> Result<()> {
        if target.len_of(self.axis) != self.data.len() {
            let expected = match self.axis.index() {
                0 => (self.data.len(), target.ncols()),
                _ => (target.nrows(), self.data.len()),
            };
            return Err(InversionError::ShapeMismatch {
                expected,
                actual: target.dim(),
            });
        }
        for mut lane in target.lanes_mut(self.axis) {
            lane *= &self.data;
        }
        Ok(())
    }
}

/// Sparse linear map between fields of two grids. Each output cell is the mean
/// of its input cells.
#[derive(Debug, Clone)]
pub struct GridOperator {
    src_shape: (usize, usize),
    dst_shape: (usize, usize),
    rows: Vec<Vec<usize>>,
}

impl GridOperator {
    fn new(src: &Grid, dst: &Grid, rows: Vec<Vec<usize>>) -> Self {
        GridOperator {
            src_shape: src.shape(),
            dst_shape: dst.shape(),
            rows,
        }
    }

    pub fn src_shape(&self) -> (usize, usize) {
        self.src_shape
    }

    pub fn dst_shape(&self) -> (usize, usize) {
        self.dst_shape
    }

    pub fn apply(&self, field: &Array2<f64>) -> Result<Array2<f64>> {
        if field.dim() != self.src_shape {
            return Err(InversionError::ShapeMismatch {
                expected: self.src_shape,
                actual: field.dim(),
            });
        }
        let nz_src = self.src_shape.1;
        let nz_dst = self.dst_shape.1;
        let mut out = Array2::zeros(self.dst_shape);
        Zip::indexed(&mut out).par_for_each(|(i, k), v| {
            let row = &self.rows[i * nz_dst + k];
            if !row.is_empty() {
                let sum: f64 = row.iter().map(|&c| field[[c / nz_src, c % nz_src]]).sum();
                *v = sum / row.len() as f64;
            }
        });
        Ok(out)
    }
}

/// Operator from `src` to `dst`.
///
/// A finer (or equal) source is sampled at the nearest source cell of every
/// target cell. A coarser source injects each of its cells into a box of
/// `pad_order = round(DH_src / DH_dst)` target cells centred on it; cells of
/// the box outside the target grid are dropped.
pub fn calc_transform_matrix(src: &Grid, dst: &Grid) -> GridOperator {
    let mut rows = vec![Vec::new(); dst.len()];
    if src.dx <= dst.dx && src.dz <= dst.dz {
        for (i, k) in (0..dst.nx).flat_map(|i| (0..dst.nz).map(move |k| (i, k))) {
            let (is, ks) = src.nearest_cell(dst.x_coord(i), dst.z_coord(k));
            if src.in_bounds(is, ks) {
                rows[dst.index(i, k)].push(src.index(is as usize, ks as usize));
            }
        }
    } else {
        let pad_order_x = ((src.dx / dst.dx).round() as i64).max(1);
        let pad_order_z = ((src.dz / dst.dz).round() as i64).max(1);
        let pad_width_x = (pad_order_x - 1) / 2;
        let pad_width_z = (pad_order_z - 1) / 2;
        for (is, ks) in (0..src.nx).flat_map(|i| (0..src.nz).map(move |k| (i, k))) {
            let (ic, kc) = dst.nearest_cell(src.x_coord(is), src.z_coord(ks));
            for a in 0..pad_order_x {
                for b in 0..pad_order_z {
                    let (id, kd) = (ic - pad_width_x + a, kc - pad_width_z + b);
                    if dst.in_bounds(id, kd) {
                        rows[dst.index(id as usize, kd as usize)].push(src.index(is, ks));
                    }
                }
            }
        }
    }
    GridOperator::new(src, dst, rows)
}

/// Two-dimensional window plus the grid operators of a joint inversion and of
/// wavefield compression.
#[derive(Debug, Clone, Default)]
pub struct Taper2D {
    data: Option<Array2<f64>>,
    transform_1to2: Option<GridOperator>,
    transform_2to1: Option<GridOperator>,
    average: Option<(GridOperator, Grid)>,
    recover: Option<(GridOperator, Grid)>,
}

impl Taper2D {
    pub fn new() -> Self {
        Self::default()
    }

    /// Window of ones for a `(n_traces, nt)` seismogram or a grid field.
    pub fn init(&mut self, shape: (usize, usize)) {
        self.data = Some(Array2::ones(shape));
    }

    pub fn set_window(&mut self, data: Array2<f64>) {
        self.data = Some(data);
    }

    /// Window of `shape` built by applying a one-dimensional taper to ones.
    pub fn calc_window(&mut self, shape: (usize, usize), taper: &Taper1D) -> Result<()> {
        let mut data = Array2::ones(shape);
        taper.apply(&mut data)?;
        self.data = Some(data);
        Ok(())
    }

    pub fn window(&self) -> Option<&Array2<f64>> {
        self.data.as_ref()
    }

    pub fn apply(&self, target: &mut Array2<f64>) -> Result<()> {
        let Some(data) = &self.data else {
            return Ok(());
        };
        if data.dim() != target.dim() {
            return Err(InversionError::ShapeMismatch {
                expected: data.dim(),
                actual: target.dim(),
            });
        }
        *target *= data;
        Ok(())
    }

    pub fn calc_transform_matrix_1to2(&mut self, grid1: &Grid, grid2: &Grid) {
        self.transform_1to2 = Some(calc_transform_matrix(grid1, grid2));
    }

    pub fn calc_transform_matrix_2to1(&mut self, grid1: &Grid, grid2: &Grid) {
        self.transform_2to1 = Some(calc_transform_matrix(grid2, grid1));
    }

    fn transforms(&self) -> Result<(&GridOperator, &GridOperator)> {
        match (&self.transform_1to2, &self.transform_2to1) {
            (Some(t12), Some(t21)) => Ok((t12, t21)),
            _ => Err(InversionError::InvalidConfig(
                "grid transform used before both transform matrices were calculated".to_string(),
            )),
        }
    }

    /// Moves a model parameter from grid 1 onto grid 2.
    ///
    /// The part of `p2` that grid 1 cannot represent is kept, and cells outside
    /// `mask2` keep their old value.
    pub fn apply_model_transform_1to2(
        &self,
        p1: &Array2<f64>,
        p2: &mut Array2<f64>,
        mask2: &Array2<f64>,
        topology: &ShotTopology,
    ) -> Result<()> {
        let (t12, t21) = self.transforms()?;
        model_transform(t12, t21, p1, p2, mask2, topology)
    }

    pub fn apply_model_transform_2to1(
        &self,
        p2: &Array2<f64>,
        p1: &mut Array2<f64>,
        mask1: &Array2<f64>,
        topology: &ShotTopology,
    ) -> Result<()> {
        let (t12, t21) = self.transforms()?;
        model_transform(t21, t12, p2, p1, mask1, topology)
    }

    /// Moves a gradient from grid 1 onto grid 2; cells outside `mask2` keep their value.
    pub fn apply_gradient_transform_1to2(
        &self,
        g1: &Array2<f64>,
        g2: &mut Array2<f64>,
        mask2: &Array2<f64>,
        topology: &ShotTopology,
    ) -> Result<()> {
        let (t12, _) = self.transforms()?;
        gradient_transform(t12, g1, g2, mask2, topology)
    }

    pub fn apply_gradient_transform_2to1(
        &self,
        g2: &Array2<f64>,
        g1: &mut Array2<f64>,
        mask1: &Array2<f64>,
        topology: &ShotTopology,
    ) -> Result<()> {
        let (_, t21) = self.transforms()?;
        gradient_transform(t21, g2, g1, mask1, topology)
    }

    /// Box average of `dh x dh` cells for storing forward snapshots, and the
    /// piecewise-constant recovery back. Returns the coarse grid.
    pub fn calc_average_matrix(&mut self, grid: &Grid, dh: usize) -> Grid {
        let dh = dh.max(1);
        let coarse = Grid::new(
            grid.nx.div_ceil(dh),
            grid.nz.div_ceil(dh),
            grid.dx * dh as f64,
            grid.dz * dh as f64,
        )
        .with_origin(grid.x0, grid.z0);

        let mut average = vec![Vec::new(); coarse.len()];
        let mut recover = vec![Vec::new(); grid.len()];
        for i in 0..grid.nx {
            for k in 0..grid.nz {
                let c = coarse.index(i / dh, k / dh);
                average[c].push(grid.index(i, k));
                recover[grid.index(i, k)].push(c);
            }
        }
        self.average = Some((GridOperator::new(grid, &coarse, average), coarse.clone()));
        self.recover = Some((GridOperator::new(&coarse, grid, recover), grid.clone()));
        coarse
    }

    pub fn apply_wavefield_average<'a>(&self, wavefield: &'a Wavefield) -> Result<Cow<'a, Wavefield>> {
        match &self.average {
            Some((op, grid)) => map_wavefield(op, grid, wavefield).map(Cow::Owned),
            None => Ok(Cow::Borrowed(wavefield)),
        }
    }

    pub fn apply_wavefield_recover<'a>(&self, wavefield: &'a Wavefield) -> Result<Cow<'a, Wavefield>> {
        match &self.recover {
            Some((op, grid)) => map_wavefield(op, grid, wavefield).map(Cow::Owned),
            None => Ok(Cow::Borrowed(wavefield)),
        }
    }
}

fn map_wavefield(op: &GridOperator, grid: &Grid, wavefield: &Wavefield) -> Result<Wavefield> {
    let mut out = Wavefield::new(wavefield.equation(), grid);
    for (c, field) in wavefield.iter() {
        *out.get_mut(c)? = op.apply(field)?;
    }
    Ok(out)
}

fn model_transform(
    forward: &GridOperator,
    back: &GridOperator,
    src: &Array2<f64>,
    dst: &mut Array2<f64>,
    mask: &Array2<f64>,
    topology: &ShotTopology,
) -> Result<()> {
    check_dst(forward, dst, mask)?;
    let mut averaged = src.clone();
    topology.average_field(&mut averaged);

    let air = Zip::from(&*dst).and(mask).map_collect(|&p, &m| (1.0 - m) * p);
    let residual = &*dst - &forward.apply(&back.apply(dst)?)?;
    let mut transformed = forward.apply(&averaged)? + residual;
    Zip::from(&mut transformed)
        .and(mask)
        .and(&air)
        .for_each(|p, &m, &a| *p = *p * m + a);
    *dst = transformed;
    Ok(())
}

fn gradient_transform(
    op: &GridOperator,
    src: &Array2<f64>,
    dst: &mut Array2<f64>,
    mask: &Array2<f64>,
    topology: &ShotTopology,
) -> Result<()> {
    check_dst(op, dst, mask)?;
    let mut averaged = src.clone();
    topology.average_field(&mut averaged);
    let transformed = op.apply(&averaged)?;
    Zip::from(dst)
        .and(&transformed)
        .and(mask)
        .for_each(|d, &t, &m| *d = t * m + (1.0 - m) * *d);
    Ok(())
}

fn check_dst(op: &GridOperator, dst: &Array2<f64>, mask: &Array2<f64>) -> Result<()> {
    for field in [dst, mask] {
        if field.dim() != op.dst_shape() {
            return Err(InversionError::ShapeMismatch {
                expected: op.dst_shape(),
                actual: field.dim(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equation::EquationType;
    use crate::topology::testing::ReplicatedCommunicator;
    use crate::topology::LocalCommunicator;
    use crate::wavefield::Component;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use std::sync::Arc;

    #[test]
    fn rising_taper_edges() {
        let taper = calc_cosine_taper(20, 5, 12, false).unwrap();
        assert!(taper.slice(ndarray::s![..5]).iter().all(|&v| v == 0.0));
        assert!(taper.slice(ndarray::s![12..]).iter().all(|&v| v == 1.0));
        for j in 5..12 {
            assert!(taper[j + 1] >= taper[j]);
        }
    }

    #[test]
    fn invalid_edges_are_rejected() {
        assert!(matches!(
            calc_cosine_taper(10, 5, 5, false),
            Err(InversionError::InvalidTaperEdges(_))
        ));
        assert!(calc_cosine_taper(10, 2, 10, false).is_err());
        assert!(calc_cosine_taper_two_zone(20, 2, 8, 6, 12, false).is_err());
    }

    #[test]
    fn two_zone_reverse_is_complement() {
        let forward = calc_cosine_taper_two_zone(30, 2, 8, 15, 25, false).unwrap();
        let reverse = calc_cosine_taper_two_zone(30, 2, 8, 15, 25, true).unwrap();
        for (f, r) in forward.iter().zip(reverse.iter()) {
            assert_abs_diff_eq!(*r, 1.0 - f, epsilon = 1e-15);
        }
        assert_eq!(forward[0], 0.0);
        assert_abs_diff_eq!(forward[10], 1.0, epsilon = 1e-15);
        assert_eq!(forward[29], 0.0);
    }

    #[test]
    fn taper1d_scales_time_axis() {
        let taper = Taper1D::new(array![0.0, 0.5, 1.0], Axis(1));
        let mut seismogram = Array2::ones((2, 3));
        taper.apply(&mut seismogram).unwrap();
        assert_eq!(seismogram, array![[0.0, 0.5, 1.0], [0.0, 0.5, 1.0]]);
        assert!(taper.apply(&mut Array2::ones((3, 2))).is_err());
    }

    #[test]
    fn equal_grids_round_trip() {
        let grid = Grid::new(6, 4, 2.0, 2.0);
        let mut taper = Taper2D::new();
        taper.calc_transform_matrix_1to2(&grid, &grid);
        taper.calc_transform_matrix_2to1(&grid, &grid);
        let topo = ShotTopology::single();
        let mask = grid.ones();

        let p1 = Array2::from_elem(grid.shape(), 3.5);
        let mut p2 = grid.zeros();
        taper.apply_model_transform_1to2(&p1, &mut p2, &mask, &topo).unwrap();
        let mut back = grid.zeros();
        taper.apply_model_transform_2to1(&p2, &mut back, &mask, &topo).unwrap();
        for v in back.iter() {
            assert_abs_diff_eq!(*v, 3.5, epsilon = 1e-12);
        }
    }

    #[test]
    fn coarse_to_fine_injects_boxes() {
        let coarse = Grid::new(2, 2, 2.0, 2.0);
        let fine = Grid::new(4, 4, 1.0, 1.0);
        let op = calc_transform_matrix(&coarse, &fine);
        let out = op.apply(&array![[1.0, 2.0], [3.0, 4.0]]).unwrap();
        // pad order 2, pad width 0: coarse (0, 0) covers fine (0..2, 0..2)
        assert_eq!(out[[0, 0]], 1.0);
        assert_eq!(out[[1, 1]], 1.0);
        assert_eq!(out[[2, 3]], 4.0);
        assert_eq!(out[[0, 2]], 2.0);
    }

    #[test]
    fn fine_to_coarse_samples_nearest() {
        let fine = Grid::new(4, 4, 1.0, 1.0);
        let coarse = Grid::new(2, 2, 2.0, 2.0);
        let op = calc_transform_matrix(&fine, &coarse);
        let field = Array2::from_shape_fn((4, 4), |(i, k)| (i * 4 + k) as f64);
        let out = op.apply(&field).unwrap();
        assert_eq!(out, array![[0.0, 2.0], [8.0, 10.0]]);
    }

    #[test]
    fn air_survives_model_transform() {
        let grid = Grid::new(3, 3, 1.0, 1.0);
        let mut taper = Taper2D::new();
        taper.calc_transform_matrix_1to2(&grid, &grid);
        taper.calc_transform_matrix_2to1(&grid, &grid);
        let topo = ShotTopology::new(
            Arc::new(LocalCommunicator),
            Arc::new(ReplicatedCommunicator { size: 3 }),
            3,
            0,
        );
        let mut mask = grid.ones();
        mask[[0, 0]] = 0.0;
        let p1 = Array2::from_elem(grid.shape(), 0.3);
        let mut p2 = Array2::from_elem(grid.shape(), 0.9);
        taper.apply_model_transform_1to2(&p1, &mut p2, &mask, &topo).unwrap();
        assert_eq!(p2[[0, 0]], 0.9);
        assert_abs_diff_eq!(p2[[1, 2]], 0.3, epsilon = 1e-12);

        let mut g2 = Array2::from_elem(grid.shape(), 5.0);
        taper.apply_gradient_transform_1to2(&p1, &mut g2, &mask, &topo).unwrap();
        assert_eq!(g2[[0, 0]], 5.0);
        assert_abs_diff_eq!(g2[[2, 2]], 0.3, epsilon = 1e-12);
    }

    #[test]
    fn transform_without_matrices_fails() {
        let grid = Grid::new(2, 2, 1.0, 1.0);
        let mut p2 = grid.zeros();
        let result = Taper2D::new().apply_model_transform_1to2(
            &grid.ones(),
            &mut p2,
            &grid.ones(),
            &ShotTopology::single(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn wavefield_average_and_recover() {
        let grid = Grid::new(4, 3, 1.0, 1.0);
        let mut taper = Taper2D::new();
        let coarse = taper.calc_average_matrix(&grid, 2);
        assert_eq!(coarse.shape(), (2, 2));

        let mut wf = Wavefield::new(EquationType::Acoustic, &grid);
        *wf.get_mut(Component::P).unwrap() = Array2::from_shape_fn((4, 3), |(i, _)| if i < 2 { 2.0 } else { 6.0 });
        let stored = taper.apply_wavefield_average(&wf).unwrap();
        assert_eq!(stored.get(Component::P).unwrap(), &array![[2.0, 2.0], [6.0, 6.0]]);
        let recovered = taper.apply_wavefield_recover(&stored).unwrap();
        assert_eq!(recovered.get(Component::P).unwrap(), wf.get(Component::P).unwrap());

        let plain = Taper2D::new();
        assert!(matches!(plain.apply_wavefield_recover(&wf).unwrap(), Cow::Borrowed(_)));
    }

    #[test]
    fn window_from_time_taper() {
        let ramp = Taper1D::cosine(6, 1, 4, false, Axis(1)).unwrap();
        let mut taper = Taper2D::new();
        taper.calc_window((3, 6), &ramp).unwrap();
        let mut residual = Array2::from_elem((3, 6), 2.0);
        taper.apply(&mut residual).unwrap();
        assert_eq!(residual[[1, 0]], 0.0);
        assert_eq!(residual[[2, 5]], 2.0);
        assert!(taper.apply(&mut Array2::ones((6, 3))).is_err());
    }
}
