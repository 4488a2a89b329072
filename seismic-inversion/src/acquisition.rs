use std::f64::consts::PI;

use ndarray::{Array1, Array2};

use crate::error::{InversionError, Result};
use crate::grid::Grid;
use crate::wavefield::Component;

/// Ricker wavelet with peak frequency `f0` (Hz) delayed by `t0` (s).
pub fn ricker_wavelet(f0: f64, t0: f64, t: f64) -> f64 {
    let tau = t - t0;
    let arg = (PI * f0 * tau).powi(2);
    (1.0 - 2.0 * arg) * (-arg).exp()
}

/// Sampled Ricker signal, delayed by `1.2 / f0` so it starts near zero.
pub fn ricker_signal(f0: f64, dt: f64, nt: usize) -> Array1<f64> {
    let t0 = 1.2 / f0;
    Array1::from_shape_fn(nt, |it| ricker_wavelet(f0, t0, it as f64 * dt))
}

/// Point injections into one wavefield component.
#[derive(Debug, Clone)]
pub struct Sources {
    pub positions: Vec<(usize, usize)>,
    pub component: Component,
    /// Injected signal per position, shape `(n_sources, nt)`.
    pub signals: Array2<f64>,
}

impl Sources {
    pub fn new(
        grid: &Grid,
        positions: Vec<(usize, usize)>,
        component: Component,
        signals: Array2<f64>,
    ) -> Result<Self> {
        check_positions(grid, &positions)?;
        if signals.nrows() != positions.len() {
            return Err(InversionError::ShapeMismatch {
                expected: (positions.len(), signals.ncols()),
                actual: signals.dim(),
            });
        }
        Ok(Sources {
            positions,
            component,
            signals,
        })
    }

    /// Single source firing a Ricker wavelet.
    pub fn ricker(grid: &Grid, position: (usize, usize), component: Component, f0: f64, dt: f64, nt: usize) -> Result<Self> {
        let signal = ricker_signal(f0, dt, nt).insert_axis(ndarray::Axis(0));
        Sources::new(grid, vec![position], component, signal)
    }

    pub fn nt(&self) -> usize {
        self.signals.ncols()
    }

    pub fn sample(&self, source: usize, t: usize) -> f64 {
        if t < self.signals.ncols() {
            self.signals[[source, t]]
        } else {
            0.0
        }
    }
}

/// Point recordings of one wavefield component.
#[derive(Debug, Clone)]
pub struct Receivers {
    pub positions: Vec<(usize, usize)>,
    pub component: Component,
    /// Seismogram, shape `(n_receivers, nt)`.
    pub data: Array2<f64>,
}

impl Receivers {
    pub fn new(grid: &Grid, positions: Vec<(usize, usize)>, component: Component, nt: usize) -> Result<Self> {
        check_positions(grid, &positions)?;
        let data = Array2::zeros((positions.len(), nt));
        Ok(Receivers {
            positions,
            component,
            data,
        })
    }

    pub fn reset(&mut self) {
        self.data.fill(0.0);
    }

    /// Receivers at the positions of `sources`, used to record the adjoint run.
    pub fn at_sources(sources: &Sources, nt: usize) -> Self {
        Receivers {
            positions: sources.positions.clone(),
            component: sources.component,
            data: Array2::zeros((sources.positions.len(), nt)),
        }
    }

    /// Adjoint sources injecting `residuals` at these receiver positions.
    pub fn adjoint_sources(&self, residuals: Array2<f64>) -> Sources {
        Sources {
            positions: self.positions.clone(),
            component: self.component,
            signals: residuals,
        }
    }
}

fn check_positions(grid: &Grid, positions: &[(usize, usize)]) -> Result<()> {
    for &(i, k) in positions {
        if !grid.in_bounds(i as i64, k as i64) {
            return Err(InversionError::InvalidConfig(format!(
                "position ({}, {}) is outside grid bounds ({}, {})",
                i, k, grid.nx, grid.nz
            )));
        }
    }
    Ok(())
}
