use std::fmt;
use std::path::Path;

use ndarray::{Array1, Array2, Axis, Zip};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{InversionError, Result};
use crate::io;
use crate::steplength::StepLengthSearch;
use crate::workflow::Workflow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MisfitType {
    /// `0.5 * sum((syn - obs)^2)`
    #[default]
    L2,
    /// L2 of traces normalised by their maximum absolute value.
    NormalizedL2,
}

impl MisfitType {
    pub fn name(self) -> &'static str {
        match self {
            MisfitType::L2 => "l2",
            MisfitType::NormalizedL2 => "normalized_l2",
        }
    }

    pub fn calc(self, synthetic: &Array2<f64>, observed: &Array2<f64>) -> f64 {
        let residual = self.residual(synthetic, observed);
        0.5 * residual.iter().map(|r| r * r).sum::<f64>()
    }

    /// Residual injected as adjoint source, shape `(n_receivers, nt)`.
    pub fn residual(self, synthetic: &Array2<f64>, observed: &Array2<f64>) -> Array2<f64> {
        match self {
            MisfitType::L2 => synthetic - observed,
            MisfitType::NormalizedL2 => normalize_traces(synthetic) - normalize_traces(observed),
        }
    }
}

impl fmt::Display for MisfitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn normalize_traces(data: &Array2<f64>) -> Array2<f64> {
    let mut out = data.clone();
    for mut trace in out.axis_iter_mut(Axis(0)) {
        let max = trace.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
        if max > 0.0 {
            trace.mapv_inplace(|v| v / max);
        }
    }
    out
}

/// Misfit values of every iteration of the current stage.
///
/// One row per misfit type, one column per shot.
#[derive(Debug, Clone)]
pub struct Misfit {
    types: Vec<MisfitType>,
    storage: Vec<Array2<f64>>,
}

impl Misfit {
    pub fn new(types: Vec<MisfitType>) -> Self {
        let types = if types.is_empty() {
            vec![MisfitType::default()]
        } else {
            types
        };
        Misfit {
            types,
            storage: Vec::new(),
        }
    }

    pub fn types(&self) -> &[MisfitType] {
        &self.types
    }

    /// True if more than one misfit type is tracked.
    pub fn is_multi(&self) -> bool {
        self.types.len() > 1
    }

    /// Misfit of one shot under every tracked type.
    pub fn calc(&self, synthetic: &Array2<f64>, observed: &Array2<f64>) -> Result<Array1<f64>> {
        check_same_shape(synthetic, observed)?;
        Ok(self
            .types
            .iter()
            .map(|t| t.calc(synthetic, observed))
            .collect())
    }

    /// Adjoint source of the primary (first) misfit type.
    pub fn calc_adjoint_sources(&self, synthetic: &Array2<f64>, observed: &Array2<f64>) -> Result<Array2<f64>> {
        check_same_shape(synthetic, observed)?;
        Ok(self.types[0].residual(synthetic, observed))
    }

    /// Stores the misfits of one iteration, shape `(n_types, n_shots)`.
    pub fn add_to_storage(&mut self, misfits: Array2<f64>) -> Result<()> {
        if misfits.nrows() != self.types.len() {
            return Err(InversionError::ShapeMismatch {
                expected: (self.types.len(), misfits.ncols()),
                actual: misfits.dim(),
            });
        }
        self.storage.push(misfits);
        Ok(())
    }

    pub fn clear_storage(&mut self) {
        self.storage.clear();
    }

    /// Number of stored iterations.
    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    fn iteration(&self, iteration: usize) -> Result<&Array2<f64>> {
        self.storage
            .get(iteration)
            .ok_or_else(|| {
                InversionError::InvalidConfig(format!(
                    "no misfit stored for iteration {iteration} ({} stored)",
                    self.storage.len()
                ))
            })
    }

    /// Sum over all shots and misfit types.
    pub fn get_misfit_sum(&self, iteration: usize) -> Result<f64> {
        Ok(self.iteration(iteration)?.sum())
    }

    /// Per-shot misfit, summed over types.
    pub fn get_misfit_it(&self, iteration: usize) -> Result<Array1<f64>> {
        Ok(self.iteration(iteration)?.sum_axis(Axis(0)))
    }

    pub fn get_misfit_shot(&self, iteration: usize, shot: usize) -> Result<f64> {
        let misfits = self.iteration(iteration)?;
        if shot >= misfits.ncols() {
            return Err(InversionError::InvalidConfig(format!(
                "shot {shot} out of range ({} shots)",
                misfits.ncols()
            )));
        }
        Ok(misfits.column(shot).sum())
    }

    /// Maximum over misfit types of `(misfit[it1] - misfit[it2]) / misfit[it1]`.
    pub fn get_misfit_residual_max(&self, it1: usize, it2: usize) -> Result<f64> {
        let first = self.iteration(it1)?.sum_axis(Axis(1));
        let second = self.iteration(it2)?.sum_axis(Axis(1));
        let mut max = f64::NEG_INFINITY;
        Zip::from(&first).and(&second).for_each(|&a, &b| {
            max = max.max((a - b) / a);
        });
        Ok(max)
    }

    /// Relative change `(misfit[it1] - misfit[it2]) / misfit[it1]`.
    pub fn relative_change(&self, it1: usize, it2: usize) -> Result<f64> {
        if self.is_multi() {
            return self.get_misfit_residual_max(it1, it2);
        }
        let first = self.get_misfit_sum(it1)?;
        Ok((first - self.get_misfit_sum(it2)?) / first)
    }

    /// Appends `stage iteration misfit` for the latest stored iteration.
    pub fn write_log(&self, path: &Path, stage: usize, iteration: usize) -> Result<()> {
        let Some(last) = self.storage.last() else {
            return Ok(());
        };
        let per_type: Vec<String> = last
            .sum_axis(Axis(1))
            .iter()
            .map(|v| format!("{v:e}"))
            .collect();
        io::append_line(path, &format!("{} {} {:e} {}", stage, iteration, last.sum(), per_type.join(" ")))
    }
}

fn check_same_shape(synthetic: &Array2<f64>, observed: &Array2<f64>) -> Result<()> {
    if synthetic.dim() != observed.dim() {
        return Err(InversionError::ShapeMismatch {
            expected: observed.dim(),
            actual: synthetic.dim(),
        });
    }
    Ok(())
}

/// How the abort decisions of two coupled physics channels combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BreakLoopType {
    /// Each channel decides on its own.
    #[default]
    Independent,
    /// A trigger in either channel stops both.
    Either,
    /// Both channels must trigger.
    Both,
}

impl TryFrom<i64> for BreakLoopType {
    type Error = InversionError;

    fn try_from(value: i64) -> Result<Self> {
        match value {
            0 => Ok(BreakLoopType::Independent),
            1 => Ok(BreakLoopType::Either),
            2 => Ok(BreakLoopType::Both),
            other => Err(InversionError::UnsupportedBreakLoopType(other)),
        }
    }
}

/// Outcome of an abort check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortDecision {
    Continue,
    /// This channel triggered but waits for its companion before changing stage.
    Held,
    /// Triggered, and the workflow moved to its next stage.
    StageChanged,
    /// Triggered in the last stage.
    Terminate,
}

impl AbortDecision {
    pub fn triggered(self) -> bool {
        self != AbortDecision::Continue
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AbortCriterion {
    break_loop_type: BreakLoopType,
}

impl AbortCriterion {
    pub fn new(break_loop_type: BreakLoopType) -> Self {
        AbortCriterion { break_loop_type }
    }

    /// Trigger of this channel alone. Needs two earlier iterations.
    pub fn triggered(&self, misfit: &Misfit, workflow: &Workflow) -> Result<bool> {
        let it = workflow.iteration;
        if it <= 1 {
            return Ok(false);
        }
        let threshold = workflow.relative_misfit_change();
        let residual = misfit.relative_change(it - 2, it)?;
        let mut triggered = false;
        if residual.abs() < threshold {
            info!(residual, threshold, "abort criterion 1 fulfilled: |misfit(it-2) - misfit(it)| / misfit(it-2) below threshold");
            triggered = true;
        }
        if -residual > 2.0 * threshold {
            info!(residual, threshold, "abort criterion 2 fulfilled: misfit grew by more than twice the threshold");
            triggered = true;
        }
        Ok(triggered)
    }

    /// Checks this channel, combining with the trigger of a coupled channel if there is one,
    /// and advances the workflow stage when the combined criterion fires.
    ///
    /// With [`BreakLoopType::Both`] a channel that fires alone reports [`AbortDecision::Held`]:
    /// its own break flag is set, the stage stays.
    pub fn check(
        &self,
        misfit: &mut Misfit,
        workflow: &mut Workflow,
        steplength: &mut StepLengthSearch,
        companion: Option<bool>,
    ) -> Result<AbortDecision> {
        if workflow.iteration <= 1 {
            return Ok(AbortDecision::Continue);
        }
        let mut own = self.triggered(misfit, workflow)?;
        let companion_triggered = companion.unwrap_or(false);
        if self.break_loop_type == BreakLoopType::Either && companion_triggered {
            own = true;
        }
        let fire = match (self.break_loop_type, companion) {
            (BreakLoopType::Both, Some(other)) => own && other,
            _ => own,
        };
        if !fire {
            return Ok(if own { AbortDecision::Held } else { AbortDecision::Continue });
        }
        if workflow.is_last_stage() {
            return Ok(AbortDecision::Terminate);
        }
        info!(from = workflow.current_stage(), "changing workflow stage");
        workflow.change_stage(misfit, steplength);
        Ok(AbortDecision::StageChanged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameter::{Parameter, ParameterSet};
    use crate::steplength::StepLengthParams;
    use crate::workflow::Stage;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn single_stage(threshold: f64) -> Workflow {
        Workflow::new(vec![Stage::new(ParameterSet::from([Parameter::VelocityP]), threshold, 20)]).unwrap()
    }

    fn history(values: &[f64]) -> Misfit {
        let mut misfit = Misfit::new(vec![MisfitType::L2]);
        for &v in values {
            misfit.add_to_storage(array![[v]]).unwrap();
        }
        misfit
    }

    #[test]
    fn l2_misfit_and_residual() {
        let syn = array![[1.0, 2.0], [0.0, 0.0]];
        let obs = array![[0.0, 0.0], [0.0, 1.0]];
        assert_relative_eq!(MisfitType::L2.calc(&syn, &obs), 3.0);
        assert_eq!(MisfitType::L2.residual(&syn, &obs), array![[1.0, 2.0], [0.0, -1.0]]);
    }

    #[test]
    fn normalized_l2_ignores_amplitude() {
        let obs = array![[0.0, 1.0, -0.5]];
        let syn = &obs * 7.0;
        assert_relative_eq!(MisfitType::NormalizedL2.calc(&syn, &obs), 0.0);
    }

    #[test]
    fn storage_sums_over_types_and_shots() {
        let mut misfit = Misfit::new(vec![MisfitType::L2, MisfitType::NormalizedL2]);
        misfit.add_to_storage(array![[1.0, 2.0], [3.0, 4.0]]).unwrap();
        misfit.add_to_storage(array![[1.0, 1.0], [1.0, 1.0]]).unwrap();
        assert_relative_eq!(misfit.get_misfit_sum(0).unwrap(), 10.0);
        assert_eq!(misfit.get_misfit_it(0).unwrap(), array![4.0, 6.0]);
        assert_relative_eq!(misfit.get_misfit_shot(0, 1).unwrap(), 6.0);
        // per type: (3-2)/3 and (7-2)/7
        assert_relative_eq!(misfit.get_misfit_residual_max(0, 1).unwrap(), 5.0 / 7.0);
        assert!(misfit.add_to_storage(array![[1.0]]).is_err());
        misfit.clear_storage();
        assert!(misfit.is_empty());
    }

    #[test]
    fn steady_decrease_does_not_abort() {
        let misfit = history(&[10.0, 8.0, 7.9]);
        let mut workflow = single_stage(0.02);
        workflow.iteration = 2;
        assert!(!AbortCriterion::default().triggered(&misfit, &workflow).unwrap());
    }

    #[test]
    fn stagnation_aborts() {
        let misfit = history(&[10.0, 8.0, 9.99]);
        let mut workflow = single_stage(0.02);
        workflow.iteration = 2;
        assert!(AbortCriterion::default().triggered(&misfit, &workflow).unwrap());
    }

    #[test]
    fn divergence_aborts() {
        let misfit = history(&[10.0, 11.0, 12.0]);
        let mut workflow = single_stage(0.05);
        workflow.iteration = 2;
        assert!(AbortCriterion::default().triggered(&misfit, &workflow).unwrap());
    }

    #[test]
    fn early_iterations_never_abort() {
        let misfit = history(&[10.0, 10.0]);
        let mut workflow = single_stage(0.02);
        workflow.iteration = 1;
        assert!(!AbortCriterion::default().triggered(&misfit, &workflow).unwrap());
    }

    #[test]
    fn trigger_advances_stage_then_terminates() {
        let stages = vec![
            Stage::new(ParameterSet::from([Parameter::VelocityP]), 0.02, 20),
            Stage::new(ParameterSet::from([Parameter::VelocityS]), 0.02, 20),
        ];
        let mut workflow = Workflow::new(stages).unwrap();
        let mut steplength = StepLengthSearch::new(StepLengthParams::default());
        let mut misfit = history(&[10.0, 8.0, 9.99]);
        workflow.iteration = 2;
        let criterion = AbortCriterion::default();

        let decision = criterion.check(&mut misfit, &mut workflow, &mut steplength, None).unwrap();
        assert_eq!(decision, AbortDecision::StageChanged);
        assert_eq!(workflow.current_stage(), 1);
        assert_eq!(workflow.iteration, 0);
        assert!(misfit.is_empty());

        misfit = history(&[10.0, 8.0, 9.99]);
        workflow.iteration = 2;
        let decision = criterion.check(&mut misfit, &mut workflow, &mut steplength, None).unwrap();
        assert_eq!(decision, AbortDecision::Terminate);
    }

    #[test]
    fn break_loop_types_combine_channels() {
        let mut steplength = StepLengthSearch::new(StepLengthParams::default());
        let steady = [10.0, 8.0, 7.9];

        let mut workflow = single_stage(0.02);
        workflow.iteration = 2;
        let either = AbortCriterion::new(BreakLoopType::Either);
        let decision = either
            .check(&mut history(&steady), &mut workflow, &mut steplength, Some(true))
            .unwrap();
        assert!(decision.triggered());

        let both = AbortCriterion::new(BreakLoopType::Both);
        let decision = both
            .check(&mut history(&[10.0, 8.0, 7.9]), &mut workflow, &mut steplength, Some(true))
            .unwrap();
        assert_eq!(decision, AbortDecision::Continue);

        let independent = AbortCriterion::new(BreakLoopType::Independent);
        let decision = independent
            .check(&mut history(&steady), &mut workflow, &mut steplength, Some(true))
            .unwrap();
        assert_eq!(decision, AbortDecision::Continue);
    }

    #[test]
    fn both_mode_holds_stage_when_only_one_channel_fires() {
        let stages = vec![
            Stage::new(ParameterSet::from([Parameter::VelocityP]), 0.02, 20),
            Stage::new(ParameterSet::from([Parameter::VelocityS]), 0.02, 20),
        ];
        let mut workflow = Workflow::new(stages).unwrap();
        let mut steplength = StepLengthSearch::new(StepLengthParams::default());
        let both = AbortCriterion::new(BreakLoopType::Both);
        workflow.iteration = 2;

        let mut misfit = history(&[10.0, 8.0, 9.99]);
        let decision = both.check(&mut misfit, &mut workflow, &mut steplength, Some(false)).unwrap();
        assert_eq!(decision, AbortDecision::Held);
        assert!(decision.triggered());
        assert_eq!(workflow.current_stage(), 0);
        assert_eq!(workflow.iteration, 2);
        assert!(!misfit.is_empty());

        let decision = both.check(&mut misfit, &mut workflow, &mut steplength, Some(true)).unwrap();
        assert_eq!(decision, AbortDecision::StageChanged);
        assert_eq!(workflow.current_stage(), 1);
    }

    #[test]
    fn unknown_break_loop_type_is_rejected() {
        assert!(matches!(
            BreakLoopType::try_from(3),
            Err(InversionError::UnsupportedBreakLoopType(3))
        ));
        assert_eq!(BreakLoopType::try_from(2).unwrap(), BreakLoopType::Both);
    }
}
