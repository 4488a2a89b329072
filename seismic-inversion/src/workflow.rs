use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{InversionError, Result};
use crate::misfit::Misfit;
use crate::parameter::{Parameter, ParameterSet};
use crate::steplength::StepLengthSearch;

/// One phase of the inversion with a fixed set of inverted parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub invert_for: ParameterSet,
    #[serde(default = "default_relative_misfit_change")]
    pub relative_misfit_change: f64,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
}

fn default_relative_misfit_change() -> f64 {
    0.01
}

fn default_max_iterations() -> usize {
    20
}

impl Stage {
    pub fn new(invert_for: ParameterSet, relative_misfit_change: f64, max_iterations: usize) -> Self {
        Stage {
            invert_for,
            relative_misfit_change,
            max_iterations,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Workflow {
    stages: Vec<Stage>,
    current_stage: usize,
    /// Iteration within the current stage.
    pub iteration: usize,
}

impl Workflow {
    pub fn new(stages: Vec<Stage>) -> Result<Self> {
        if stages.is_empty() {
            return Err(InversionError::InvalidConfig(
                "workflow needs at least one stage".to_string(),
            ));
        }
        if let Some(i) = stages.iter().position(|s| s.invert_for.is_empty()) {
            return Err(InversionError::InvalidConfig(format!(
                "workflow stage {i} inverts for no parameter"
            )));
        }
        Ok(Workflow {
            stages,
            current_stage: 0,
            iteration: 0,
        })
    }

    pub fn stage(&self) -> &Stage {
        &self.stages[self.current_stage]
    }

    pub fn current_stage(&self) -> usize {
        self.current_stage
    }

    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }

    pub fn is_last_stage(&self) -> bool {
        self.current_stage + 1 == self.stages.len()
    }

    pub fn invert_for(&self) -> &ParameterSet {
        &self.stage().invert_for
    }

    pub fn is_inverting(&self, parameter: Parameter) -> bool {
        self.stage().invert_for.contains(parameter)
    }

    pub fn relative_misfit_change(&self) -> f64 {
        self.stage().relative_misfit_change
    }

    pub fn max_iterations(&self) -> usize {
        self.stage().max_iterations
    }

    /// Moves to the next stage: restarts the iteration count, forgets the
    /// misfit history and restores the configured initial step length.
    pub fn change_stage(&mut self, misfit: &mut Misfit, steplength: &mut StepLengthSearch) -> bool {
        if self.is_last_stage() {
            return false;
        }
        self.current_stage += 1;
        self.iteration = 0;
        misfit.clear_storage();
        steplength.reset_initial();
        info!(
            stage = self.current_stage,
            invert_for = ?self.stage().invert_for,
            "entering workflow stage"
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::misfit::MisfitType;
    use crate::steplength::StepLengthParams;
    use ndarray::array;

    #[test]
    fn stages_deserialize_with_defaults() {
        #[derive(Deserialize)]
        struct Doc {
            stages: Vec<Stage>,
        }
        let doc: Doc = toml::from_str(
            r#"
            [[stages]]
            invert_for = ["velocityP"]

            [[stages]]
            invert_for = ["velocityP", "velocityS"]
            relative_misfit_change = 0.005
            "#,
        )
        .unwrap();
        let workflow = Workflow::new(doc.stages).unwrap();
        assert_eq!(workflow.num_stages(), 2);
        assert_eq!(workflow.relative_misfit_change(), 0.01);
        assert_eq!(workflow.max_iterations(), 20);
    }

    #[test]
    fn empty_workflow_is_rejected() {
        assert!(Workflow::new(Vec::new()).is_err());
        assert!(Workflow::new(vec![Stage::new(ParameterSet::new(), 0.01, 5)]).is_err());
    }

    #[test]
    fn change_stage_resets_state() {
        let stages = vec![
            Stage::new(ParameterSet::from([Parameter::VelocityP]), 0.01, 5),
            Stage::new(ParameterSet::from([Parameter::Density]), 0.01, 5),
        ];
        let mut workflow = Workflow::new(stages).unwrap();
        let mut misfit = Misfit::new(vec![MisfitType::L2]);
        misfit.add_to_storage(array![[1.0]]).unwrap();
        let params = StepLengthParams::default();
        let mut steplength = StepLengthSearch::new(params.clone());
        steplength.set_initial(params.init * 4.0);
        workflow.iteration = 3;

        assert!(workflow.change_stage(&mut misfit, &mut steplength));
        assert!(workflow.is_inverting(Parameter::Density));
        assert!(!workflow.is_inverting(Parameter::VelocityP));
        assert_eq!(workflow.iteration, 0);
        assert!(misfit.is_empty());
        assert_eq!(steplength.initial(), params.init);

        assert!(!workflow.change_stage(&mut misfit, &mut steplength));
        assert_eq!(workflow.current_stage(), 1);
    }
}
