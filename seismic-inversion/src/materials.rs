use ndarray::{Array2, Zip};

use crate::error::Result;
use crate::model::Model;
use crate::parameter::Parameter;

/// Lamé parameters and staggered-grid averages derived from a velocity model.
#[derive(Debug, Clone)]
pub struct MaterialProperties {
    // Primary storage at (i, k) positions - normal stress locations
    pub lambda: Array2<f64>,
    pub mu: Array2<f64>,
    pub rho: Array2<f64>,

    // Averaged values at staggered positions
    pub rho_vx: Array2<f64>, // Density at vx positions (i+1/2, k)
    pub rho_vz: Array2<f64>, // Density at vz positions (i, k+1/2)
    pub mu_xz: Array2<f64>,  // Mu at sigma_xz positions (i+1/2, k+1/2)
}

impl MaterialProperties {
    pub fn new(vp: &Array2<f64>, vs: &Array2<f64>, rho: &Array2<f64>) -> Self {
        let mut lambda = Array2::<f64>::zeros(vp.dim());
        let mut mu = Array2::<f64>::zeros(vp.dim());

        Zip::from(&mut lambda)
            .and(&mut mu)
            .and(vp)
            .and(vs)
            .and(rho)
            .for_each(|l, m, &vp, &vs, &rho| {
                *m = rho * vs * vs;
                *l = rho * vp * vp - 2.0 * *m;
            });

        let rho_vx = Self::average_to_vx(rho);
        let rho_vz = Self::average_to_vz(rho);
        let mu_xz = Self::average_to_xz(&mu);

        Self {
            lambda,
            mu,
            rho: rho.clone(),
            rho_vx,
            rho_vz,
            mu_xz,
        }
    }

    pub fn from_model(model: &Model) -> Result<Self> {
        Ok(Self::new(
            model.get(Parameter::VelocityP)?,
            model.get(Parameter::VelocityS)?,
            model.get(Parameter::Density)?,
        ))
    }

    pub fn max_vp(&self) -> f64 {
        let mut vp_max = 0.0_f64;
        Zip::from(&self.lambda)
            .and(&self.mu)
            .and(&self.rho)
            .for_each(|&l, &m, &r| {
                if r > 0.0 {
                    vp_max = vp_max.max(((l + 2.0 * m) / r).sqrt());
                }
            });
        vp_max
    }

    fn harmonic_mean(a: f64, b: f64) -> f64 {
        if a == 0.0 && b == 0.0 {
            0.0
        } else {
            2.0 * a * b / (a + b)
        }
    }

    fn average_to_vx(rho: &Array2<f64>) -> Array2<f64> {
        let (nx, _) = rho.dim();
        Array2::from_shape_fn(rho.dim(), |(i, k)| {
            if i < nx - 1 {
                Self::harmonic_mean(rho[[i, k]], rho[[i + 1, k]])
            } else {
                rho[[i, k]]
            }
        })
    }

    fn average_to_vz(rho: &Array2<f64>) -> Array2<f64> {
        let (_, nz) = rho.dim();
        Array2::from_shape_fn(rho.dim(), |(i, k)| {
            if k < nz - 1 {
                Self::harmonic_mean(rho[[i, k]], rho[[i, k + 1]])
            } else {
                rho[[i, k]]
            }
        })
    }

    fn average_to_xz(mu: &Array2<f64>) -> Array2<f64> {
        // Harmonic mean of the four surrounding cells; any zero (fluid) gives zero
        let (nx, nz) = mu.dim();
        Array2::from_shape_fn(mu.dim(), |(i, k)| {
            if i < nx - 1 && k < nz - 1 {
                let corners = [mu[[i, k]], mu[[i + 1, k]], mu[[i, k + 1]], mu[[i + 1, k + 1]]];
                if corners.iter().any(|&m| m == 0.0) {
                    0.0
                } else {
                    4.0 / corners.iter().map(|m| 1.0 / m).sum::<f64>()
                }
            } else {
                mu[[i, k]]
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn homogeneous_medium_keeps_its_values() {
        let vp = Array2::from_elem((4, 4), 6000.0);
        let vs = Array2::from_elem((4, 4), 4000.0);
        let rho = Array2::from_elem((4, 4), 3000.0);
        let mat = MaterialProperties::new(&vp, &vs, &rho);
        assert_relative_eq!(mat.mu[[1, 1]], 3000.0 * 4000.0 * 4000.0);
        assert_relative_eq!(mat.rho_vz[[2, 1]], 3000.0);
        assert_relative_eq!(mat.mu_xz[[0, 0]], mat.mu[[0, 0]]);
        assert_relative_eq!(mat.max_vp(), 6000.0, max_relative = 1e-12);
    }

    #[test]
    fn fluid_cell_zeroes_shear_average() {
        let vp = Array2::from_elem((3, 3), 2000.0);
        let mut vs = Array2::from_elem((3, 3), 1000.0);
        vs[[1, 1]] = 0.0;
        let rho = Array2::from_elem((3, 3), 1000.0);
        let mat = MaterialProperties::new(&vp, &vs, &rho);
        assert_eq!(mat.mu_xz[[0, 0]], 0.0);
        assert!(mat.mu_xz[[1, 1]] == 0.0);
    }
}
