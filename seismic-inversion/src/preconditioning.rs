use std::f64::consts::FRAC_PI_2;

use ndarray::{Array2, Axis, Zip};
use serde::{Deserialize, Serialize};

use crate::error::{InversionError, Result};
use crate::gradient::{max_abs, Gradient};
use crate::grid::Grid;
use crate::io::{self, FileFormat};
use crate::taper::Taper1D;
use crate::wavefield::Wavefield;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnergyMode {
    #[default]
    Off,
    /// Divide by the time-integrated forward energy.
    Forward,
    /// Divide by the product of forward and adjoint energies.
    ForwardAdjoint,
}

/// Approximate Hessian diagonal from wavefield energy.
#[derive(Debug, Clone)]
pub struct EnergyPreconditioning {
    mode: EnergyMode,
    epsilon_hessian: f64,
    save_base: Option<String>,
    forward_energy: Array2<f64>,
    adjoint_energy: Array2<f64>,
}

impl EnergyPreconditioning {
    pub fn init(grid: &Grid, mode: EnergyMode, epsilon_hessian: f64, save_base: Option<String>) -> Self {
        EnergyPreconditioning {
            mode,
            epsilon_hessian,
            save_base,
            forward_energy: grid.zeros(),
            adjoint_energy: grid.zeros(),
        }
    }

    pub fn mode(&self) -> EnergyMode {
        self.mode
    }

    pub fn reset(&mut self) {
        self.forward_energy.fill(0.0);
        self.adjoint_energy.fill(0.0);
    }

    /// Adds `dt * |wavefield|^2` of one timestep to the running integrals.
    pub fn int_squared_wavefields(&mut self, forward: &Wavefield, adjoint: &Wavefield, dt: f64) -> Result<()> {
        if self.mode == EnergyMode::Off {
            return Ok(());
        }
        accumulate(&mut self.forward_energy, &forward.squared_sum(), dt)?;
        if self.mode == EnergyMode::ForwardAdjoint {
            accumulate(&mut self.adjoint_energy, &adjoint.squared_sum(), dt)?;
        }
        Ok(())
    }

    /// Current approximate Hessian (not normalised).
    pub fn approx_hessian(&self) -> Array2<f64> {
        match self.mode {
            EnergyMode::ForwardAdjoint => &self.forward_energy * &self.adjoint_energy,
            _ => self.forward_energy.clone(),
        }
    }

    /// Divides `gradient` by the normalised Hessian plus `epsilon_hessian`,
    /// saving the Hessian as `<base>.shot_<shot>` if requested.
    pub fn apply(&self, gradient: &mut Gradient, shot: usize, format: FileFormat) -> Result<()> {
        if self.mode == EnergyMode::Off {
            return Ok(());
        }
        let mut hessian = self.approx_hessian();
        let max = max_abs(&hessian);
        if max > 0.0 {
            hessian.mapv_inplace(|v| v / max);
        }
        hessian.mapv_inplace(|v| v + self.epsilon_hessian);
        if let Some(base) = &self.save_base {
            io::write_field(&format!("{base}.shot_{shot}"), &hessian, format)?;
        }
        let inverse = hessian.mapv(|v| if v == 0.0 { 0.0 } else { 1.0 / v });
        *gradient *= &inverse;
        Ok(())
    }
}

fn accumulate(acc: &mut Array2<f64>, energy: &Array2<f64>, dt: f64) -> Result<()> {
    if energy.dim() != acc.dim() {
        return Err(InversionError::ShapeMismatch {
            expected: acc.dim(),
            actual: energy.dim(),
        });
    }
    Zip::from(acc).and(energy).par_for_each(|a, &e| *a += dt * e);
    Ok(())
}

/// Multiplicative mask that damps the gradient around sources and receivers.
#[derive(Debug, Clone)]
pub struct SourceReceiverTaper {
    taper: Array2<f64>,
}

impl SourceReceiverTaper {
    pub fn ones(grid: &Grid) -> Self {
        SourceReceiverTaper { taper: grid.ones() }
    }

    /// `sin^2` ramp from 0 at each position to 1 at `radius` cells; radius 0 leaves the mask at 1.
    pub fn radial(grid: &Grid, positions: &[(usize, usize)], radius: usize) -> Self {
        let mut taper = grid.ones();
        if radius > 0 {
            let r = radius as f64;
            for ((i, k), v) in taper.indexed_iter_mut() {
                for &(ip, kp) in positions {
                    let di = i as f64 - ip as f64;
                    let dk = k as f64 - kp as f64;
                    let dist = (di * di + dk * dk).sqrt();
                    if dist < r {
                        *v = v.min((FRAC_PI_2 * dist / r).sin().powi(2));
                    }
                }
            }
        }
        SourceReceiverTaper { taper }
    }

    /// Mutes everything above the shallowest source or receiver, ramping up to 1
    /// over `width` cells below it.
    pub fn depth(grid: &Grid, positions: &[(usize, usize)], width: usize) -> Result<Self> {
        let mut taper = grid.ones();
        let Some(top) = positions.iter().map(|&(_, k)| k).min() else {
            return Ok(SourceReceiverTaper { taper });
        };
        let end = (top + width).min(grid.nz.saturating_sub(1));
        if width > 0 && end > top {
            Taper1D::cosine(grid.nz, top, end, false, Axis(1))?.apply(&mut taper)?;
        }
        Ok(SourceReceiverTaper { taper })
    }

    pub fn taper(&self) -> &Array2<f64> {
        &self.taper
    }

    pub fn apply(&self, gradient: &mut Gradient) {
        gradient.apply_mask(&self.taper);
    }
}
