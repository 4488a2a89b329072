use std::collections::BTreeMap;

use ndarray::{Array2, Zip};
use tracing::{debug, warn};

use crate::error::Result;
use crate::gradient::Gradient;
use crate::model::Model;
use crate::parameter::Parameter;
use crate::workflow::Workflow;

/// Polak-Ribière coefficient `g.(g - g_last) / g_last.g_last`.
///
/// Returns 0 (steepest descent) when the previous gradient vanishes or the
/// result is not finite.
pub fn polak_ribiere(gradient: &Array2<f64>, last_gradient: &Array2<f64>) -> f64 {
    let mut numerator = 0.0;
    let mut denominator = 0.0;
    Zip::from(gradient).and(last_gradient).for_each(|&g, &l| {
        numerator += g * (g - l);
        denominator += l * l;
    });
    let beta = numerator / denominator;
    if denominator == 0.0 || !beta.is_finite() {
        warn!(numerator, denominator, "degenerate Polak-Ribière coefficient, restarting with steepest descent");
        return 0.0;
    }
    beta
}

/// Nonlinear conjugate gradient directions, one history per parameter.
#[derive(Debug, Clone, Default)]
pub struct ConjugateGradient {
    last_gradient: BTreeMap<Parameter, Array2<f64>>,
    last_conjugate: BTreeMap<Parameter, Array2<f64>>,
}

impl ConjugateGradient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.last_gradient.clear();
        self.last_conjugate.clear();
    }

    /// Seeds the history of one parameter, e.g. when resuming a run.
    pub fn set_history(&mut self, parameter: Parameter, last_gradient: Array2<f64>, last_conjugate: Array2<f64>) {
        self.last_gradient.insert(parameter, last_gradient);
        self.last_conjugate.insert(parameter, last_conjugate);
    }

    pub fn last_conjugate(&self, parameter: Parameter) -> Option<&Array2<f64>> {
        self.last_conjugate.get(&parameter)
    }

    /// Replaces every parameter inverted for in the current stage by its
    /// conjugate direction. The first iteration of a stage uses the raw gradient.
    pub fn calc(&mut self, gradient: &mut Gradient, workflow: &Workflow) -> Result<()> {
        for p in workflow.invert_for().iter() {
            if !gradient.active().contains(p) {
                continue;
            }
            let g = gradient.get(p)?.clone();
            let history = self.last_gradient.get(&p).zip(self.last_conjugate.get(&p));
            let direction = match history {
                Some((last_g, last_d)) if workflow.iteration > 0 => {
                    let beta = polak_ribiere(&g, last_g);
                    debug!(parameter = %p, beta, "conjugate direction");
                    &g + &(last_d * beta)
                }
                _ => g.clone(),
            };
            self.last_gradient.insert(p, g);
            self.last_conjugate.insert(p, direction.clone());
            gradient.set(p, direction)?;
        }
        Ok(())
    }

    /// [`calc`](Self::calc) followed by the gradient scaling.
    pub fn apply(&mut self, gradient: &mut Gradient, workflow: &Workflow, model: &Model, scale: f64) -> Result<()> {
        self.calc(gradient, workflow)?;
        gradient.scale(model, workflow, scale)
    }
}
