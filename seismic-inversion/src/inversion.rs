use std::collections::BTreeMap;
use std::path::PathBuf;

use ndarray::{Array1, Array2};
use rayon::prelude::*;
use tracing::{info, warn};

use crate::acquisition::{Receivers, Sources};
use crate::error::Result;
use crate::gradient::{apply_gradient_update, Gradient};
use crate::gradient_calculation::{GradientCalculation, GradientSettings, Shot};
use crate::grid::Grid;
use crate::io::FileFormat;
use crate::misfit::{AbortCriterion, AbortDecision, BreakLoopType, Misfit, MisfitType};
use crate::model::Model;
use crate::optimization::ConjugateGradient;
use crate::parameter::Parameter;
use crate::solver::{record_forward, run_forward, WaveSolver};
use crate::steplength::{StepLengthParams, StepLengthSearch};
use crate::taper::Taper2D;
use crate::topology::{self, ShotTopology};
use crate::workflow::Workflow;

/// Sources, receivers and observed seismogram of one shot.
#[derive(Debug, Clone)]
pub struct ShotGather {
    pub sources: Sources,
    pub receivers: Receivers,
    pub observed: Array2<f64>,
}

#[derive(Debug, Clone)]
pub struct InversionSettings {
    pub gradient: GradientSettings,
    pub steplength: StepLengthParams,
    pub misfit_types: Vec<MisfitType>,
    pub break_loop_type: BreakLoopType,
    /// Largest model update relative to the largest model value.
    pub gradient_scale: f64,
    pub thresholds: Option<BTreeMap<Parameter, [f64; 2]>>,
    /// Coarsening factor of the stored forward wavefields.
    pub dh_inversion: usize,
    pub file_format: FileFormat,
    /// Model written after every iteration as `<base>.stage_<N>.It_<N>`.
    pub model_filename: Option<String>,
    pub misfit_log: Option<PathBuf>,
    pub steplength_log: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct InversionSummary {
    /// Model updates performed over all stages.
    pub iterations: usize,
    /// Total misfit of every evaluated iteration, in order.
    pub misfit_history: Vec<f64>,
    pub final_stage: usize,
}

/// Outer loop: gradient, conjugate direction, line search, update.
pub struct Inversion<S> {
    solver: S,
    grid: Grid,
    settings: InversionSettings,
    workflow: Workflow,
    misfit: Misfit,
    abort: AbortCriterion,
    steplength: StepLengthSearch,
    cg: ConjugateGradient,
    topology: ShotTopology,
    compression: Taper2D,
}

impl<S: WaveSolver + Clone> Inversion<S> {
    pub fn new(solver: S, grid: Grid, workflow: Workflow, settings: InversionSettings, topology: ShotTopology) -> Self {
        let mut compression = Taper2D::new();
        if settings.dh_inversion > 1 {
            compression.calc_average_matrix(&grid, settings.dh_inversion);
        }
        let mut steplength = StepLengthSearch::new(settings.steplength.clone());
        if let (Some(path), true) = (&settings.steplength_log, topology.is_writer()) {
            steplength = steplength.with_log(path.clone());
        }
        Inversion {
            solver,
            grid,
            misfit: Misfit::new(settings.misfit_types.clone()),
            abort: AbortCriterion::new(settings.break_loop_type),
            steplength,
            cg: ConjugateGradient::new(),
            settings,
            workflow,
            topology,
            compression,
        }
    }

    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    pub fn misfit(&self) -> &Misfit {
        &self.misfit
    }

    pub fn run(&mut self, model: &mut Model, shots: &[ShotGather]) -> Result<InversionSummary> {
        let mut summary = InversionSummary::default();
        loop {
            let stage = self.workflow.current_stage();
            let it = self.workflow.iteration;
            info!(stage = stage + 1, iteration = it + 1, "starting iteration");

            let (misfits, mut gradient) = self.calc_gradient(model, shots)?;
            self.misfit.add_to_storage(misfits)?;
            let current = self.misfit.get_misfit_sum(it)?;
            summary.misfit_history.push(current);
            if let (Some(path), true) = (&self.settings.misfit_log, self.topology.is_writer()) {
                self.misfit.write_log(path, stage + 1, it + 1)?;
            }
            info!(misfit = current, "misfit of current model");

            match self
                .abort
                .check(&mut self.misfit, &mut self.workflow, &mut self.steplength, None)?
            {
                AbortDecision::Terminate => {
                    info!("abort criterion reached in the last stage");
                    break;
                }
                AbortDecision::StageChanged => continue,
                AbortDecision::Held | AbortDecision::Continue => {}
            }

            self.cg
                .apply(&mut gradient, &self.workflow, model, self.settings.gradient_scale)?;
            let steplength = self.line_search(model, &gradient, shots, current)?;
            apply_gradient_update(model, &gradient, steplength)?;
            if let Some(thresholds) = &self.settings.thresholds {
                model.apply_thresholds(thresholds)?;
            }
            info!(steplength, "model updated");

            if let (Some(base), true) = (&self.settings.model_filename, self.topology.is_writer()) {
                model.write(&format!("{}.stage_{}.It_{}", base, stage + 1, it + 1), self.settings.file_format)?;
            }

            summary.iterations += 1;
            self.workflow.iteration += 1;
            if self.workflow.iteration >= self.workflow.max_iterations() {
                if self.workflow.is_last_stage() {
                    info!("maximum number of iterations reached in the last stage");
                    break;
                }
                self.workflow.change_stage(&mut self.misfit, &mut self.steplength);
            }
        }
        summary.final_stage = self.workflow.current_stage();
        Ok(summary)
    }

    /// Misfits `(n_types, n_shots)` and the shot-summed gradient of `model`.
    fn calc_gradient(&mut self, model: &Model, shots: &[ShotGather]) -> Result<(Array2<f64>, Gradient)> {
        self.solver.prepare(model)?;
        let solver = &self.solver;
        let grid = &self.grid;
        let settings = &self.settings.gradient;
        let misfit = &self.misfit;
        let workflow = &self.workflow;
        let topology = &self.topology;
        let compression = &self.compression;

        let results = topology
            .assigned_shots(shots.len())
            .into_par_iter()
            .map(|s| -> Result<(usize, Array1<f64>, Gradient)> {
                let gather = &shots[s];
                let mut receivers = gather.receivers.clone();
                let record = record_forward(
                    solver,
                    grid,
                    &gather.sources,
                    &mut receivers,
                    settings.nt,
                    settings.dt_inversion,
                    compression,
                )?;
                let shot_misfit = misfit.calc(&receivers.data, &gather.observed)?;
                let residuals = misfit.calc_adjoint_sources(&receivers.data, &gather.observed)?;
                let adjoint_sources = receivers.adjoint_sources(residuals);

                let shot = Shot {
                    number: s,
                    sources: &gather.sources,
                    receivers: &receivers,
                    adjoint_sources: &adjoint_sources,
                    record: &record,
                };
                let mut calc = GradientCalculation::new(solver, grid.clone(), workflow, settings.clone(), compression.clone());
                let mut gradient = Gradient::new(solver.equation(), grid.clone(), workflow.invert_for())?;
                calc.run(solver, &mut gradient, model, &shot, workflow, topology)?;
                Ok((s, shot_misfit, gradient))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut misfits = Array2::zeros((misfit.types().len(), shots.len()));
        let mut total = Gradient::new(solver.equation(), grid.clone(), workflow.invert_for())?;
        for (s, shot_misfit, gradient) in results {
            misfits.column_mut(s).assign(&shot_misfit);
            total += &gradient;
        }
        total.sum_shot_domain(topology.inter_shot());
        topology::sum_field(topology.inter_shot(), &mut misfits);
        Ok((misfits, total))
    }

    fn line_search(&mut self, model: &Model, direction: &Gradient, shots: &[ShotGather], current: f64) -> Result<f64> {
        let mut trial_solver = self.solver.clone();
        let grid = &self.grid;
        let nt = self.settings.gradient.nt;
        let thresholds = self.settings.thresholds.as_ref();
        let misfit = &self.misfit;
        let topology = &self.topology;

        let mut trial = |steplength: f64| -> Result<f64> {
            let mut candidate = model.clone();
            apply_gradient_update(&mut candidate, direction, steplength)?;
            if let Some(thresholds) = thresholds {
                candidate.apply_thresholds(thresholds)?;
            }
            if !candidate.is_finite() {
                return Ok(f64::INFINITY);
            }
            if let Err(err) = trial_solver.prepare(&candidate) {
                warn!(steplength, %err, "trial model rejected");
                return Ok(f64::INFINITY);
            }
            forward_misfit(&trial_solver, grid, shots, nt, misfit, topology)
        };
        let stage = self.workflow.current_stage() + 1;
        let iteration = self.workflow.iteration + 1;
        self.steplength.run(&mut trial, current, stage, iteration)
    }
}

/// Total misfit of all shots for an already prepared solver.
fn forward_misfit(
    solver: &dyn WaveSolver,
    grid: &Grid,
    shots: &[ShotGather],
    nt: usize,
    misfit: &Misfit,
    topology: &ShotTopology,
) -> Result<f64> {
    let local = topology
        .assigned_shots(shots.len())
        .into_par_iter()
        .map(|s| -> Result<f64> {
            let gather = &shots[s];
            let mut receivers = gather.receivers.clone();
            run_forward(solver, grid, &gather.sources, &mut receivers, nt)?;
            Ok(misfit.calc(&receivers.data, &gather.observed)?.sum())
        })
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .sum::<f64>();
    let mut total = [local];
    topology.inter_shot().sum_in_place(&mut total);
    Ok(total[0])
}

/// Synthetic observed data of `model`, one gather per source.
pub fn synthetic_observations(
    solver: &mut dyn WaveSolver,
    model: &Model,
    grid: &Grid,
    sources: &[Sources],
    receivers: &Receivers,
    nt: usize,
) -> Result<Vec<ShotGather>> {
    solver.prepare(model)?;
    let solver: &dyn WaveSolver = solver;
    sources
        .par_iter()
        .map(|src| -> Result<ShotGather> {
            let mut recorded = receivers.clone();
            run_forward(solver, grid, src, &mut recorded, nt)?;
            let observed = recorded.data.clone();
            recorded.reset();
            Ok(ShotGather {
                sources: src.clone(),
                receivers: recorded,
                observed,
            })
        })
        .collect()
}
