use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Physical (or petrophysical) parameter that a model carries and an inversion may update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Parameter {
    #[serde(rename = "velocityP")]
    VelocityP,
    #[serde(rename = "velocityS")]
    VelocityS,
    #[serde(rename = "density")]
    Density,
    #[serde(rename = "tauP")]
    TauP,
    #[serde(rename = "tauS")]
    TauS,
    #[serde(rename = "porosity")]
    Porosity,
    #[serde(rename = "saturation")]
    Saturation,
    #[serde(rename = "conductivityEM")]
    ConductivityEM,
    #[serde(rename = "permittivityEM")]
    PermittivityEM,
    #[serde(rename = "tauConductivityEM")]
    TauConductivityEM,
    #[serde(rename = "tauPermittivityEM")]
    TauPermittivityEM,
}

impl Parameter {
    pub const ALL: [Parameter; 11] = [
        Parameter::VelocityP,
        Parameter::VelocityS,
        Parameter::Density,
        Parameter::TauP,
        Parameter::TauS,
        Parameter::Porosity,
        Parameter::Saturation,
        Parameter::ConductivityEM,
        Parameter::PermittivityEM,
        Parameter::TauConductivityEM,
        Parameter::TauPermittivityEM,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Parameter::VelocityP => "velocityP",
            Parameter::VelocityS => "velocityS",
            Parameter::Density => "density",
            Parameter::TauP => "tauP",
            Parameter::TauS => "tauS",
            Parameter::Porosity => "porosity",
            Parameter::Saturation => "saturation",
            Parameter::ConductivityEM => "conductivityEM",
            Parameter::PermittivityEM => "permittivityEM",
            Parameter::TauConductivityEM => "tauConductivityEM",
            Parameter::TauPermittivityEM => "tauPermittivityEM",
        }
    }

    /// Porosity and saturation are reached only through petrophysical Jacobians.
    pub fn is_petrophysical(self) -> bool {
        matches!(self, Parameter::Porosity | Parameter::Saturation)
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Parameter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Parameter::ALL
            .iter()
            .copied()
            .find(|p| p.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown parameter '{s}'"))
    }
}

/// The parameters a workflow stage inverts for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterSet(BTreeSet<Parameter>);

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, parameter: Parameter) -> bool {
        self.0.contains(&parameter)
    }

    pub fn contains_any(&self, parameters: &[Parameter]) -> bool {
        parameters.iter().any(|p| self.0.contains(p))
    }

    pub fn insert(&mut self, parameter: Parameter) {
        self.0.insert(parameter);
    }

    pub fn iter(&self) -> impl Iterator<Item = Parameter> + '_ {
        self.0.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl FromIterator<Parameter> for ParameterSet {
    fn from_iter<I: IntoIterator<Item = Parameter>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<const N: usize> From<[Parameter; N]> for ParameterSet {
    fn from(parameters: [Parameter; N]) -> Self {
        parameters.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_names_case_insensitively() {
        assert_eq!("velocityp".parse::<Parameter>(), Ok(Parameter::VelocityP));
        assert_eq!("conductivityEM".parse::<Parameter>(), Ok(Parameter::ConductivityEM));
        assert!("viscosity".parse::<Parameter>().is_err());
    }

    #[test]
    fn set_deserializes_from_name_list() {
        #[derive(Deserialize)]
        struct Stage {
            invert_for: ParameterSet,
        }
        let stage: Stage = toml::from_str(r#"invert_for = ["velocityP", "density"]"#).unwrap();
        assert!(stage.invert_for.contains(Parameter::VelocityP));
        assert!(stage.invert_for.contains(Parameter::Density));
        assert!(!stage.invert_for.contains(Parameter::VelocityS));
        assert_eq!(stage.invert_for.len(), 2);
    }
}
