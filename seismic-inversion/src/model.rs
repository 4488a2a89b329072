use std::collections::BTreeMap;
use std::path::PathBuf;

use ndarray::{Array2, Zip};

use crate::equation::EquationType;
use crate::error::{InversionError, Result};
use crate::grid::Grid;
use crate::io::{self, FileFormat};
use crate::parameter::Parameter;

/// Permittivity of free space (F/m).
pub const VACUUM_PERMITTIVITY: f64 = 8.854_187_817e-12;

/// Subsurface parameters of one equation family, keyed by parameter.
#[derive(Debug, Clone)]
pub struct Model {
    equation: EquationType,
    grid: Grid,
    parameters: BTreeMap<Parameter, Array2<f64>>,
    // d(physical)/d(petrophysical), keyed (physical, petrophysical)
    jacobians: BTreeMap<(Parameter, Parameter), Array2<f64>>,
    pub relaxation_frequency: f64,
    pub num_relaxation_mechanisms: usize,
}

impl Model {
    pub fn new(equation: EquationType, grid: Grid) -> Self {
        let parameters = equation
            .parameters()
            .iter()
            .map(|&p| (p, grid.zeros()))
            .collect();
        Model {
            equation,
            grid,
            parameters,
            jacobians: BTreeMap::new(),
            relaxation_frequency: 0.0,
            num_relaxation_mechanisms: if equation.is_visco() { 1 } else { 0 },
        }
    }

    /// Constant model; parameters not listed stay zero.
    pub fn homogeneous(equation: EquationType, grid: Grid, values: &[(Parameter, f64)]) -> Result<Self> {
        let mut model = Model::new(equation, grid);
        for &(p, v) in values {
            model.get_mut(p)?.fill(v);
        }
        Ok(model)
    }

    pub fn equation(&self) -> EquationType {
        self.equation
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    pub fn get(&self, parameter: Parameter) -> Result<&Array2<f64>> {
        self.parameters
            .get(&parameter)
            .ok_or_else(|| self.unsupported(parameter))
    }

    pub fn get_mut(&mut self, parameter: Parameter) -> Result<&mut Array2<f64>> {
        let err = self.unsupported(parameter);
        self.parameters.get_mut(&parameter).ok_or(err)
    }

    pub fn set(&mut self, parameter: Parameter, values: Array2<f64>) -> Result<()> {
        self.grid.check(&values)?;
        *self.get_mut(parameter)? = values;
        Ok(())
    }

    fn unsupported(&self, parameter: Parameter) -> InversionError {
        InversionError::UnsupportedParameter {
            parameter,
            equation: self.equation.name().to_string(),
        }
    }

    pub fn parameters(&self) -> impl Iterator<Item = (Parameter, &Array2<f64>)> {
        self.parameters.iter().map(|(&p, f)| (p, f))
    }

    pub fn set_jacobian(&mut self, physical: Parameter, petro: Parameter, values: Array2<f64>) -> Result<()> {
        self.grid.check(&values)?;
        self.get(physical)?;
        self.get(petro)?;
        self.jacobians.insert((physical, petro), values);
        Ok(())
    }

    pub fn jacobian(&self, physical: Parameter, petro: Parameter) -> Option<&Array2<f64>> {
        self.jacobians.get(&(physical, petro))
    }

    pub fn is_finite(&self) -> bool {
        self.parameters
            .values()
            .all(|f| f.iter().all(|v| v.is_finite()))
    }

    /// 1 inside the subsurface, 0 in air/vacuum.
    ///
    /// Seismic: `sign(|vp|)` (`vs` for SH). EM: `sign(|eps/eps0 - 1|)`.
    pub fn physical_mask(&self) -> Result<Array2<f64>> {
        let reference = self.get(self.equation.mask_parameter())?;
        let mask = if self.equation.is_seismic() {
            reference.mapv(|v| sign(v.abs()))
        } else {
            reference.mapv(|v| sign((v / VACUUM_PERMITTIVITY - 1.0).abs()))
        };
        Ok(mask)
    }

    /// Clamps each listed parameter to `[min, max]` inside the physical region.
    pub fn apply_thresholds(&mut self, thresholds: &BTreeMap<Parameter, [f64; 2]>) -> Result<()> {
        let mask = self.physical_mask()?;
        for (&p, &[min, max]) in thresholds {
            let Some(field) = self.parameters.get_mut(&p) else {
                continue;
            };
            Zip::from(field).and(&mask).for_each(|v, &m| {
                if m != 0.0 {
                    *v = v.clamp(min, max);
                }
            });
        }
        Ok(())
    }

    /// Writes every parameter to `<base>.<parameter>.<ext>`.
    pub fn write(&self, base: &str, format: FileFormat) -> Result<Vec<PathBuf>> {
        self.parameters
            .iter()
            .map(|(p, field)| io::write_field(&format!("{}.{}", base, p.name()), field, format))
            .collect()
    }
}

pub(crate) fn sign(v: f64) -> f64 {
    if v > 0.0 {
        1.0
    } else if v < 0.0 {
        -1.0
    } else {
        0.0
    }
}
