use ndarray::{Array2, Zip};
use tracing::debug;

use crate::acquisition::{Receivers, Sources};
use crate::equation::EquationType;
use crate::error::{InversionError, Result};
use crate::grid::Grid;
use crate::materials::MaterialProperties;
use crate::model::Model;
use crate::parameter::Parameter;
use crate::taper::Taper2D;
use crate::wavefield::{Component, Wavefield, WavefieldRecord};

/// One-step time integrator for forward and adjoint runs.
pub trait WaveSolver: Send + Sync {
    fn equation(&self) -> EquationType;

    fn dt(&self) -> f64;

    /// Derives everything the time loop needs from `model`.
    fn prepare(&mut self, model: &Model) -> Result<()>;

    /// Advances `wavefield` by one step at time index `t`, injecting `sources`
    /// and recording `receivers`.
    fn run(&self, receivers: &mut Receivers, sources: &Sources, wavefield: &mut Wavefield, t: usize) -> Result<()>;
}

/// Staggered-grid velocity-stress P-SV scheme with rigid boundaries.
#[derive(Clone)]
pub struct ElasticSolver {
    grid: Grid,
    dt: f64,
    cfl_safety: f64,
    materials: Option<MaterialProperties>,
}

impl ElasticSolver {
    pub fn new(grid: Grid, dt: f64, cfl_safety: f64) -> Self {
        ElasticSolver {
            grid,
            dt,
            cfl_safety,
            materials: None,
        }
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    // dt <= safety * min(dx, dz) / vp_max
    pub fn stable_dt(&self, vp_max: f64) -> f64 {
        self.cfl_safety * self.grid.dx.min(self.grid.dz) / vp_max
    }

    fn materials(&self) -> Result<&MaterialProperties> {
        self.materials
            .as_ref()
            .ok_or_else(|| InversionError::InvalidConfig("solver used before prepare".to_string()))
    }

    fn apply_sources(&self, mat: &MaterialProperties, sources: &Sources, wavefield: &mut Wavefield, t: usize) -> Result<()> {
        for (s, &(i, k)) in sources.positions.iter().enumerate() {
            let amplitude = sources.sample(s, t);
            if amplitude == 0.0 {
                continue;
            }
            match sources.component {
                // explosion, scaled by the P-wave modulus
                Component::P => {
                    let scaled = amplitude * (mat.lambda[[i, k]] + 2.0 * mat.mu[[i, k]]);
                    wavefield.get_mut(Component::Sxx)?[[i, k]] += scaled;
                    wavefield.get_mut(Component::Szz)?[[i, k]] += scaled;
                }
                component => wavefield.get_mut(component)?[[i, k]] += amplitude,
            }
        }
        Ok(())
    }

    fn update_stresses(&self, mat: &MaterialProperties, wavefield: &mut Wavefield) -> Result<()> {
        let (dx, dz, dt) = (self.grid.dx, self.grid.dz, self.dt);
        let (nx, nz) = self.grid.shape();
        let shape = self.grid.shape();
        let mut dsxx = Array2::<f64>::zeros(shape);
        let mut dszz = Array2::<f64>::zeros(shape);
        let mut dsxz = Array2::<f64>::zeros(shape);
        {
            let vx = wavefield.get(Component::Vx)?;
            let vz = wavefield.get(Component::Vz)?;

            // normal stresses at (i, k)
            Zip::indexed(&mut dsxx)
                .and(&mut dszz)
                .par_for_each(|(i, k), sxx, szz| {
                    if i == 0 || k == 0 || i + 1 >= nx || k + 1 >= nz {
                        return;
                    }
                    let lambda = mat.lambda[[i, k]];
                    let lambda_plus_2mu = lambda + 2.0 * mat.mu[[i, k]];
                    let dvx_dx = (vx[[i, k]] - vx[[i - 1, k]]) / dx;
                    let dvz_dz = (vz[[i, k]] - vz[[i, k - 1]]) / dz;
                    *sxx = dt * (lambda_plus_2mu * dvx_dx + lambda * dvz_dz);
                    *szz = dt * (lambda * dvx_dx + lambda_plus_2mu * dvz_dz);
                });

            // shear stress at (i+1/2, k+1/2)
            Zip::indexed(&mut dsxz).par_for_each(|(i, k), sxz| {
                if i + 1 >= nx || k + 1 >= nz {
                    return;
                }
                let dvx_dz = (vx[[i, k + 1]] - vx[[i, k]]) / dz;
                let dvz_dx = (vz[[i + 1, k]] - vz[[i, k]]) / dx;
                *sxz = dt * mat.mu_xz[[i, k]] * (dvx_dz + dvz_dx);
            });
        }
        *wavefield.get_mut(Component::Sxx)? += &dsxx;
        *wavefield.get_mut(Component::Szz)? += &dszz;
        *wavefield.get_mut(Component::Sxz)? += &dsxz;
        Ok(())
    }

    fn update_velocities(&self, mat: &MaterialProperties, wavefield: &mut Wavefield) -> Result<()> {
        let (dx, dz, dt) = (self.grid.dx, self.grid.dz, self.dt);
        let (nx, nz) = self.grid.shape();
        let shape = self.grid.shape();
        let mut dvx = Array2::<f64>::zeros(shape);
        let mut dvz = Array2::<f64>::zeros(shape);
        {
            let sxx = wavefield.get(Component::Sxx)?;
            let szz = wavefield.get(Component::Szz)?;
            let sxz = wavefield.get(Component::Sxz)?;

            Zip::indexed(&mut dvx)
                .and(&mut dvz)
                .par_for_each(|(i, k), vx, vz| {
                    if i == 0 || k == 0 || i + 1 >= nx || k + 1 >= nz {
                        return;
                    }
                    let rho_vx = mat.rho_vx[[i, k]];
                    if rho_vx > 0.0 {
                        let dsxx_dx = (sxx[[i + 1, k]] - sxx[[i, k]]) / dx;
                        let dsxz_dz = (sxz[[i, k]] - sxz[[i, k - 1]]) / dz;
                        *vx = dt / rho_vx * (dsxx_dx + dsxz_dz);
                    }
                    let rho_vz = mat.rho_vz[[i, k]];
                    if rho_vz > 0.0 {
                        let dsxz_dx = (sxz[[i, k]] - sxz[[i - 1, k]]) / dx;
                        let dszz_dz = (szz[[i, k + 1]] - szz[[i, k]]) / dz;
                        *vz = dt / rho_vz * (dsxz_dx + dszz_dz);
                    }
                });
        }
        *wavefield.get_mut(Component::Vx)? += &dvx;
        *wavefield.get_mut(Component::Vz)? += &dvz;
        Ok(())
    }

    fn apply_boundary_conditions(&self, wavefield: &mut Wavefield) -> Result<()> {
        let (nx, nz) = self.grid.shape();
        for c in [Component::Vx, Component::Vz] {
            let v = wavefield.get_mut(c)?;
            for k in 0..nz {
                v[[0, k]] = 0.0;
                v[[nx - 1, k]] = 0.0;
            }
            for i in 0..nx {
                v[[i, 0]] = 0.0;
                v[[i, nz - 1]] = 0.0;
            }
        }
        Ok(())
    }
}

impl WaveSolver for ElasticSolver {
    fn equation(&self) -> EquationType {
        EquationType::Elastic
    }

    fn dt(&self) -> f64 {
        self.dt
    }

    fn prepare(&mut self, model: &Model) -> Result<()> {
        self.grid.check(model.get(Parameter::VelocityP)?)?;
        let materials = MaterialProperties::from_model(model)?;
        let vp_max = materials.max_vp();
        if vp_max > 0.0 && self.dt > self.stable_dt(vp_max) {
            return Err(InversionError::InvalidConfig(format!(
                "CFL condition violated: dt={}, max stable dt={}",
                self.dt,
                self.stable_dt(vp_max)
            )));
        }
        debug!(vp_max, dt = self.dt, "elastic solver prepared");
        self.materials = Some(materials);
        Ok(())
    }

    fn run(&self, receivers: &mut Receivers, sources: &Sources, wavefield: &mut Wavefield, t: usize) -> Result<()> {
        let mat = self.materials()?;
        self.apply_sources(mat, sources, wavefield, t)?;
        self.update_stresses(mat, wavefield)?;
        self.update_velocities(mat, wavefield)?;
        self.apply_boundary_conditions(wavefield)?;
        record(receivers, wavefield, t)
    }
}

fn record(receivers: &mut Receivers, wavefield: &Wavefield, t: usize) -> Result<()> {
    if t >= receivers.data.ncols() {
        return Ok(());
    }
    for (r, &(i, k)) in receivers.positions.iter().enumerate() {
        receivers.data[[r, t]] = match receivers.component {
            Component::P if wavefield.get(Component::P).is_err() => {
                -0.5 * (wavefield.get(Component::Sxx)?[[i, k]] + wavefield.get(Component::Szz)?[[i, k]])
            }
            component => wavefield.get(component)?[[i, k]],
        };
    }
    Ok(())
}

/// Runs `nt` forward steps from rest, filling `receivers`.
pub fn run_forward(solver: &dyn WaveSolver, grid: &Grid, sources: &Sources, receivers: &mut Receivers, nt: usize) -> Result<Wavefield> {
    receivers.reset();
    let mut wavefield = Wavefield::new(solver.equation(), grid);
    for t in 0..nt {
        solver.run(receivers, sources, &mut wavefield, t)?;
    }
    Ok(wavefield)
}

/// Forward run that also stores the (averaged) wavefield after every step
/// `t` with `t % dt_inversion == 0`; snapshot `k` belongs to `t = k * dt_inversion`.
pub fn record_forward(
    solver: &dyn WaveSolver,
    grid: &Grid,
    sources: &Sources,
    receivers: &mut Receivers,
    nt: usize,
    dt_inversion: usize,
    compression: &Taper2D,
) -> Result<WavefieldRecord> {
    let dt_inversion = dt_inversion.max(1);
    receivers.reset();
    let mut wavefield = Wavefield::new(solver.equation(), grid);
    let mut record = WavefieldRecord::new();
    for t in 0..nt {
        solver.run(receivers, sources, &mut wavefield, t)?;
        if t % dt_inversion == 0 {
            record.push(compression.apply_wavefield_average(&wavefield)?.into_owned());
        }
    }
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(grid: &Grid) -> Model {
        Model::homogeneous(
            EquationType::Elastic,
            grid.clone(),
            &[
                (Parameter::VelocityP, 2000.0),
                (Parameter::VelocityS, 1000.0),
                (Parameter::Density, 2000.0),
            ],
        )
        .unwrap()
    }

    #[test]
    fn unstable_timestep_is_rejected() {
        let grid = Grid::new(20, 20, 10.0, 10.0);
        let mut solver = ElasticSolver::new(grid.clone(), 0.01, 0.5);
        assert!(matches!(
            solver.prepare(&model(&grid)),
            Err(InversionError::InvalidConfig(_))
        ));
    }

    #[test]
    fn run_requires_prepare() {
        let grid = Grid::new(10, 10, 10.0, 10.0);
        let solver = ElasticSolver::new(grid.clone(), 1e-3, 0.5);
        let sources = Sources::ricker(&grid, (5, 5), Component::P, 20.0, 1e-3, 10).unwrap();
        let mut receivers = Receivers::new(&grid, vec![(2, 2)], Component::Vz, 10).unwrap();
        let mut wf = Wavefield::new(EquationType::Elastic, &grid);
        assert!(solver.run(&mut receivers, &sources, &mut wf, 0).is_err());
    }

    #[test]
    fn explosion_reaches_receiver() {
        let grid = Grid::new(40, 40, 10.0, 10.0);
        let mut solver = ElasticSolver::new(grid.clone(), 1e-3, 0.5);
        solver.prepare(&model(&grid)).unwrap();
        let nt = 150;
        let sources = Sources::ricker(&grid, (20, 20), Component::P, 15.0, 1e-3, nt).unwrap();
        let mut receivers = Receivers::new(&grid, vec![(20, 30)], Component::Vz, nt).unwrap();
        let wf = run_forward(&solver, &grid, &sources, &mut receivers, nt).unwrap();
        assert!(wf.is_finite());
        assert!(receivers.data.iter().any(|v| v.abs() > 0.0));
        // boundaries stay rigid
        assert_eq!(wf.get(Component::Vx).unwrap()[[0, 10]], 0.0);
    }

    #[test]
    fn record_keeps_every_sampled_step() {
        let grid = Grid::new(12, 12, 10.0, 10.0);
        let mut solver = ElasticSolver::new(grid.clone(), 1e-3, 0.5);
        solver.prepare(&model(&grid)).unwrap();
        let sources = Sources::ricker(&grid, (6, 6), Component::P, 20.0, 1e-3, 10).unwrap();
        let mut receivers = Receivers::new(&grid, vec![(3, 3)], Component::Vx, 10).unwrap();
        let record = record_forward(&solver, &grid, &sources, &mut receivers, 10, 3, &Taper2D::new()).unwrap();
        // t = 0, 3, 6, 9
        assert_eq!(record.len(), 4);
    }
}
