//! Step length along the search direction.
//!
//! The misfit at `alpha = 0` is known from the current iteration. Trial step
//! lengths are expanded (on success) or halved (on failure) until three points
//! bracket a minimum, then the vertex of the parabola through them is taken.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;
use crate::io;

/// Misfit of the model updated with a trial step length.
///
/// Every call costs a full forward simulation of all shots.
pub trait TrialMisfit {
    fn misfit(&mut self, steplength: f64) -> Result<f64>;
}

impl<F> TrialMisfit for F
where
    F: FnMut(f64) -> Result<f64>,
{
    fn misfit(&mut self, steplength: f64) -> Result<f64> {
        self(steplength)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SteplengthType {
    /// Bracket and fit a parabola.
    #[default]
    Parabola,
    /// Evaluate evenly spaced step lengths up to the maximum and keep the best.
    LineScan,
    /// Always use the initial step length, no trials.
    Fixed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepLengthParams {
    #[serde(default = "default_init")]
    pub init: f64,
    #[serde(default = "default_min")]
    pub min: f64,
    #[serde(default = "default_max")]
    pub max: f64,
    /// Trial budget per iteration.
    #[serde(default = "default_max_step_calc")]
    pub max_step_calc: usize,
    #[serde(default)]
    pub steplength_type: SteplengthType,
}

fn default_init() -> f64 {
    0.03
}

fn default_min() -> f64 {
    1e-4
}

fn default_max() -> f64 {
    0.5
}

fn default_max_step_calc() -> usize {
    5
}

impl Default for StepLengthParams {
    fn default() -> Self {
        StepLengthParams {
            init: default_init(),
            min: default_min(),
            max: default_max(),
            max_step_calc: default_max_step_calc(),
            steplength_type: SteplengthType::default(),
        }
    }
}

/// Vertex of the parabola through three points, if it has a minimum.
pub fn parabola_vertex(points: [(f64, f64); 3]) -> Option<f64> {
    let [(x0, y0), (x1, y1), (x2, y2)] = points;
    let denom = (x0 - x1) * (x0 - x2) * (x1 - x2);
    if denom == 0.0 {
        return None;
    }
    let a = (x2 * (y1 - y0) + x1 * (y0 - y2) + x0 * (y2 - y1)) / denom;
    let b = (x2 * x2 * (y0 - y1) + x1 * x1 * (y2 - y0) + x0 * x0 * (y1 - y2)) / denom;
    let vertex = -b / (2.0 * a);
    if a > 0.0 && vertex.is_finite() {
        Some(vertex)
    } else {
        None
    }
}

#[derive(Debug, Clone)]
pub struct StepLengthSearch {
    params: StepLengthParams,
    steplength_init: f64,
    step2ok: bool,
    step3ok: bool,
    step_calc_count: usize,
    parabola: [(f64, f64); 3],
    line: Vec<(f64, f64)>,
    optimum: f64,
    log: Option<PathBuf>,
}

impl StepLengthSearch {
    pub fn new(params: StepLengthParams) -> Self {
        let steplength_init = params.init;
        StepLengthSearch {
            params,
            steplength_init,
            step2ok: false,
            step3ok: false,
            step_calc_count: 0,
            parabola: [(0.0, 0.0); 3],
            line: Vec::new(),
            optimum: 0.0,
            log: None,
        }
    }

    /// Appends every trial to `path` as `stage iteration steplength misfit`.
    pub fn with_log(mut self, path: PathBuf) -> Self {
        self.log = Some(path);
        self
    }

    pub fn params(&self) -> &StepLengthParams {
        &self.params
    }

    pub fn initial(&self) -> f64 {
        self.steplength_init
    }

    pub fn set_initial(&mut self, steplength: f64) {
        self.steplength_init = steplength;
    }

    pub fn reset_initial(&mut self) {
        self.steplength_init = self.params.init;
    }

    pub fn step2ok(&self) -> bool {
        self.step2ok
    }

    pub fn step3ok(&self) -> bool {
        self.step3ok
    }

    pub fn step_calc_count(&self) -> usize {
        self.step_calc_count
    }

    pub fn optimum(&self) -> f64 {
        self.optimum
    }

    /// `(steplength, misfit)` of every trial of the last search.
    pub fn trials(&self) -> &[(f64, f64)] {
        &self.line
    }

    /// Finds the step length for this iteration. `current_misfit` is the misfit at zero step.
    pub fn run<T>(&mut self, trial: &mut T, current_misfit: f64, stage: usize, iteration: usize) -> Result<f64>
    where
        T: TrialMisfit + ?Sized,
    {
        self.step2ok = false;
        self.step3ok = false;
        self.step_calc_count = 0;
        self.line.clear();
        self.parabola = [(0.0, current_misfit); 3];

        let optimum = match self.params.steplength_type {
            SteplengthType::Fixed => self.steplength_init,
            SteplengthType::LineScan => self.line_scan(trial, current_misfit, stage, iteration)?,
            SteplengthType::Parabola => self.parabolic(trial, current_misfit, stage, iteration)?,
        };
        self.optimum = optimum;
        if self.params.steplength_type != SteplengthType::Fixed {
            self.steplength_init = optimum.clamp(self.params.min, self.params.max);
        }
        debug!(optimum, trials = self.step_calc_count, "step length search finished");
        Ok(optimum)
    }

    fn evaluate<T>(&mut self, trial: &mut T, steplength: f64, stage: usize, iteration: usize) -> Result<f64>
    where
        T: TrialMisfit + ?Sized,
    {
        self.step_calc_count += 1;
        let misfit = trial.misfit(steplength)?;
        debug!(steplength, misfit, "step length trial");
        if let Some(path) = &self.log {
            io::append_line(path, &format!("{} {} {:e} {:e}", stage, iteration, steplength, misfit))?;
        }
        let misfit = if misfit.is_finite() {
            misfit
        } else {
            warn!(steplength, "non-finite trial misfit, rejecting step length");
            f64::INFINITY
        };
        self.line.push((steplength, misfit));
        Ok(misfit)
    }

    fn budget_left(&self) -> bool {
        self.step_calc_count < self.params.max_step_calc
    }

    /// Doubles an improving step until the misfit rises, or halves a failing one until it
    /// improves, then fits a parabola through the bracket. There is no early exit on a
    /// merely improving trial; only a bracket or the trial budget ends the search.
    fn parabolic<T>(&mut self, trial: &mut T, m0: f64, stage: usize, iteration: usize) -> Result<f64>
    where
        T: TrialMisfit + ?Sized,
    {
        let (min, max) = (self.params.min, self.params.max);
        let mut a1 = self.steplength_init.clamp(min, max);
        let mut m1 = self.evaluate(trial, a1, stage, iteration)?;

        if m1 < m0 {
            self.step2ok = true;
            while self.budget_left() {
                let a2 = (a1 * 2.0).min(max);
                if a2 <= a1 {
                    break;
                }
                let m2 = self.evaluate(trial, a2, stage, iteration)?;
                if m2 > m1 {
                    self.parabola = [(0.0, m0), (a1, m1), (a2, m2)];
                    self.step3ok = true;
                    break;
                }
                a1 = a2;
                m1 = m2;
            }
        } else {
            let (mut a_hi, mut m_hi) = (a1, m1);
            while self.budget_left() {
                let a = a_hi / 2.0;
                if a < min {
                    break;
                }
                let m = self.evaluate(trial, a, stage, iteration)?;
                if m < m0 {
                    self.step2ok = true;
                    if m_hi.is_finite() {
                        self.parabola = [(0.0, m0), (a, m), (a_hi, m_hi)];
                        self.step3ok = true;
                    }
                    break;
                }
                a_hi = a;
                m_hi = m;
            }
        }

        if self.step2ok && self.step3ok {
            match parabola_vertex(self.parabola) {
                Some(vertex) if (min..=max).contains(&vertex) => return Ok(vertex),
                other => warn!(vertex = ?other, "degenerate parabola fit, using best trial"),
            }
        } else if !self.step2ok {
            warn!(trials = self.step_calc_count, "no step length reduced the misfit");
        }
        Ok(self.best_trial(m0))
    }

    fn line_scan<T>(&mut self, trial: &mut T, m0: f64, stage: usize, iteration: usize) -> Result<f64>
    where
        T: TrialMisfit + ?Sized,
    {
        let n = self.params.max_step_calc.max(1);
        for k in 1..=n {
            let steplength = self.params.max * k as f64 / n as f64;
            let misfit = self.evaluate(trial, steplength, stage, iteration)?;
            if misfit < m0 {
                self.step2ok = true;
            }
        }
        Ok(self.best_trial(m0))
    }

    /// Trial with the lowest misfit below `m0`; the minimum step length if no trial improved.
    fn best_trial(&self, m0: f64) -> f64 {
        self.line
            .iter()
            .filter(|(_, m)| m.is_finite() && *m < m0)
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map_or(self.params.min, |&(steplength, _)| steplength)
    }
}
