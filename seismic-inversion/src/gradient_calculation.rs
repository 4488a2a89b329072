//! Per-shot adjoint pass.
//!
//! The adjoint wavefield is stepped backwards from the last timestep and, every
//! `dt_inversion` steps, correlated with the forward snapshot stored at the same
//! time. The correlations are turned into a gradient which is then tapered,
//! preconditioned, masked and normalised.

use std::path::PathBuf;

use tracing::{debug, error, info};

use crate::acquisition::{Receivers, Sources};
use crate::error::{InversionError, Result};
use crate::gradient::Gradient;
use crate::grid::Grid;
use crate::io::FileFormat;
use crate::model::Model;
use crate::parameter::ParameterSet;
use crate::preconditioning::{EnergyMode, EnergyPreconditioning, SourceReceiverTaper};
use crate::solver::WaveSolver;
use crate::taper::Taper2D;
use crate::topology::ShotTopology;
use crate::wavefield::{Wavefield, WavefieldRecord};
use crate::workflow::Workflow;
use crate::xcorr::ZeroLagXcorr;

/// Base name of the model written when the adjoint run blows up.
pub const CRASH_MODEL: &str = "model_crash";

#[derive(Debug, Clone)]
pub struct GradientSettings {
    pub dt: f64,
    pub nt: usize,
    pub dt_inversion: usize,
    pub source_taper_radius: usize,
    pub receiver_taper_radius: usize,
    /// Cells over which the gradient ramps up below the shallowest source or receiver; 0 disables.
    pub depth_taper_width: usize,
    pub median_filter_width: usize,
    pub energy_mode: EnergyMode,
    pub epsilon_hessian: f64,
    pub save_approx_hessian: Option<String>,
    pub file_format: FileFormat,
    pub write_gradient_per_shot: bool,
    pub gradient_filename: String,
    pub crash_model: String,
}

/// Everything the adjoint pass needs to know about one shot.
pub struct Shot<'a> {
    pub number: usize,
    pub sources: &'a Sources,
    pub receivers: &'a Receivers,
    /// Residuals injected at the receiver positions.
    pub adjoint_sources: &'a Sources,
    pub record: &'a WavefieldRecord,
}

pub struct GradientCalculation {
    grid: Grid,
    settings: GradientSettings,
    active: ParameterSet,
    xcorr: ZeroLagXcorr,
    energy: EnergyPreconditioning,
    wavefield: Wavefield,
    compression: Taper2D,
}

impl GradientCalculation {
    pub fn new(solver: &dyn WaveSolver, grid: Grid, workflow: &Workflow, settings: GradientSettings, compression: Taper2D) -> Self {
        let equation = solver.equation();
        let active = workflow.invert_for().clone();
        let energy = EnergyPreconditioning::init(
            &grid,
            settings.energy_mode,
            settings.epsilon_hessian,
            settings.save_approx_hessian.clone(),
        );
        GradientCalculation {
            xcorr: ZeroLagXcorr::new(equation, &grid, &active),
            wavefield: Wavefield::new(equation, &grid),
            grid,
            settings,
            active,
            energy,
            compression,
        }
    }

    pub fn settings(&self) -> &GradientSettings {
        &self.settings
    }

    pub fn xcorr(&self) -> &ZeroLagXcorr {
        &self.xcorr
    }

    /// Runs the adjoint pass of `shot` and leaves its finished gradient in `gradient`.
    pub fn run(
        &mut self,
        solver: &dyn WaveSolver,
        gradient: &mut Gradient,
        model: &Model,
        shot: &Shot<'_>,
        workflow: &Workflow,
        topology: &ShotTopology,
    ) -> Result<()> {
        if workflow.invert_for() != &self.active {
            self.active = workflow.invert_for().clone();
            self.xcorr = ZeroLagXcorr::new(solver.equation(), &self.grid, &self.active);
        }
        self.wavefield.zero();
        self.xcorr.reset();
        self.energy.reset();

        self.backward(solver, shot)?;

        if topology.shot().any(!self.wavefield.is_finite()) {
            let dump = PathBuf::from(&self.settings.crash_model);
            if topology.is_writer() {
                model.write(&self.settings.crash_model, self.settings.file_format)?;
            }
            error!(shot = shot.number, dump = %dump.display(), "non-finite adjoint wavefield");
            return Err(InversionError::NonFiniteWavefield { dump });
        }

        gradient.reset();
        gradient.estimate_parameter(&self.xcorr, model, self.settings.dt)?;
        self.post_process(gradient, model, shot)?;

        if self.settings.write_gradient_per_shot {
            let base = format!(
                "{}.stage_{}.It_{}.shot_{}",
                self.settings.gradient_filename,
                workflow.current_stage() + 1,
                workflow.iteration + 1,
                shot.number
            );
            gradient.write(&base, self.settings.file_format)?;
        }
        info!(shot = shot.number, "gradient calculated");
        Ok(())
    }

    // t runs from nt - 1 down to 1; snapshot k holds the forward field at k * dt_inversion
    fn backward(&mut self, solver: &dyn WaveSolver, shot: &Shot<'_>) -> Result<()> {
        let dt = self.settings.dt;
        let dt_inversion = self.settings.dt_inversion.max(1);
        let derivative_scale = dt_inversion as f64 / dt;
        let mut adjoint_receivers = Receivers::at_sources(shot.adjoint_sources, 0);

        for t in (1..self.settings.nt).rev() {
            solver.run(&mut adjoint_receivers, shot.adjoint_sources, &mut self.wavefield, t)?;
            if t % dt_inversion != 0 {
                continue;
            }
            let k = t / dt_inversion;
            let forward = self.compression.apply_wavefield_recover(shot.record.get(k)?)?;
            self.energy.int_squared_wavefields(&forward, &self.wavefield, dt)?;

            let mut derivative = forward.clone().into_owned();
            let previous = self.compression.apply_wavefield_recover(shot.record.get(k - 1)?)?;
            derivative.sub_assign(&previous);
            derivative.scale(derivative_scale);

            self.xcorr.update(&derivative, &forward, &self.wavefield)?;
        }
        debug!(shot = shot.number, "adjoint pass finished");
        Ok(())
    }

    fn post_process(&self, gradient: &mut Gradient, model: &Model, shot: &Shot<'_>) -> Result<()> {
        let s = &self.settings;
        SourceReceiverTaper::radial(&self.grid, &shot.sources.positions, s.source_taper_radius).apply(gradient);
        SourceReceiverTaper::radial(&self.grid, &shot.receivers.positions, s.receiver_taper_radius).apply(gradient);

        let positions: Vec<(usize, usize)> = shot
            .sources
            .positions
            .iter()
            .chain(&shot.receivers.positions)
            .copied()
            .collect();
        SourceReceiverTaper::depth(&self.grid, &positions, s.depth_taper_width)?.apply(gradient);

        self.energy.apply(gradient, shot.number, s.file_format)?;
        gradient.apply_median_filter(s.median_filter_width);
        gradient.apply_mask(&model.physical_mask()?);
        gradient.normalize();
        Ok(())
    }
}
