use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::parameter::Parameter;
use crate::wavefield::Component;

/// Wave-equation family of a simulation (all 2D).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EquationType {
    Acoustic,
    Elastic,
    Visco,
    Sh,
    ViscoSh,
    Emem,
    Tmem,
    ViscoEmem,
    ViscoTmem,
}

impl EquationType {
    pub fn name(self) -> &'static str {
        match self {
            EquationType::Acoustic => "acoustic",
            EquationType::Elastic => "elastic",
            EquationType::Visco => "visco",
            EquationType::Sh => "sh",
            EquationType::ViscoSh => "viscosh",
            EquationType::Emem => "emem",
            EquationType::Tmem => "tmem",
            EquationType::ViscoEmem => "viscoemem",
            EquationType::ViscoTmem => "viscotmem",
        }
    }

    pub fn is_seismic(self) -> bool {
        matches!(
            self,
            EquationType::Acoustic
                | EquationType::Elastic
                | EquationType::Visco
                | EquationType::Sh
                | EquationType::ViscoSh
        )
    }

    pub fn is_visco(self) -> bool {
        matches!(
            self,
            EquationType::Visco
                | EquationType::ViscoSh
                | EquationType::ViscoEmem
                | EquationType::ViscoTmem
        )
    }

    /// Parameters a model of this family carries.
    pub fn parameters(self) -> &'static [Parameter] {
        use Parameter::*;
        match self {
            EquationType::Acoustic => &[VelocityP, Density, Porosity, Saturation],
            EquationType::Elastic => &[VelocityP, VelocityS, Density, Porosity, Saturation],
            EquationType::Visco => &[VelocityP, VelocityS, Density, TauP, TauS, Porosity, Saturation],
            EquationType::Sh => &[VelocityS, Density, Porosity, Saturation],
            EquationType::ViscoSh => &[VelocityS, Density, TauS, Porosity, Saturation],
            EquationType::Emem | EquationType::Tmem => {
                &[ConductivityEM, PermittivityEM, Porosity, Saturation]
            }
            EquationType::ViscoEmem | EquationType::ViscoTmem => &[
                ConductivityEM,
                PermittivityEM,
                TauConductivityEM,
                TauPermittivityEM,
                Porosity,
                Saturation,
            ],
        }
    }

    pub fn has_parameter(self, parameter: Parameter) -> bool {
        self.parameters().contains(&parameter)
    }

    /// Wavefield components propagated by this family.
    pub fn components(self) -> &'static [Component] {
        use Component::*;
        match self {
            EquationType::Acoustic => &[Vx, Vz, P],
            EquationType::Elastic | EquationType::Visco => &[Vx, Vz, Sxx, Szz, Sxz],
            EquationType::Sh | EquationType::ViscoSh => &[Vy, Sxy, Syz],
            EquationType::Emem | EquationType::ViscoEmem => &[Ex, Ez, Hy],
            EquationType::Tmem | EquationType::ViscoTmem => &[Ey, Hx, Hz],
        }
    }

    /// Parameter whose zero value marks air/vacuum in a seismic model.
    pub fn mask_parameter(self) -> Parameter {
        match self {
            EquationType::Sh | EquationType::ViscoSh => Parameter::VelocityS,
            EquationType::Acoustic | EquationType::Elastic | EquationType::Visco => {
                Parameter::VelocityP
            }
            _ => Parameter::PermittivityEM,
        }
    }
}

impl fmt::Display for EquationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EquationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let all = [
            EquationType::Acoustic,
            EquationType::Elastic,
            EquationType::Visco,
            EquationType::Sh,
            EquationType::ViscoSh,
            EquationType::Emem,
            EquationType::Tmem,
            EquationType::ViscoEmem,
            EquationType::ViscoTmem,
        ];
        all.into_iter()
            .find(|e| e.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown equation type '{s}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seismic_switch_is_consistent_with_parameters() {
        for eq in ["acoustic", "elastic", "visco", "sh", "viscosh"] {
            let eq: EquationType = eq.parse().unwrap();
            assert!(eq.is_seismic());
            assert!(eq.has_parameter(Parameter::Density));
            assert!(!eq.has_parameter(Parameter::ConductivityEM));
        }
        let em: EquationType = "ViscoEMEM".parse().unwrap();
        assert!(!em.is_seismic());
        assert!(em.has_parameter(Parameter::TauPermittivityEM));
        assert!(!em.has_parameter(Parameter::Density));
    }
}
