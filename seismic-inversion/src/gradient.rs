use std::collections::{BTreeMap, BTreeSet};
use std::ops::{Add, AddAssign, Mul, MulAssign, Sub, SubAssign};
use std::path::PathBuf;

use ndarray::{Array2, Zip};

use crate::equation::EquationType;
use crate::error::{InversionError, Result};
use crate::grid::Grid;
use crate::io::{self, FileFormat};
use crate::materials::MaterialProperties;
use crate::model::Model;
use crate::parameter::{Parameter, ParameterSet};
use crate::topology::{self, Communicator};
use crate::workflow::Workflow;
use crate::xcorr::{XcorrTerm, ZeroLagXcorr};

/// Misfit gradient per model parameter.
///
/// Only parameters in the active set take part in arithmetic; the others are
/// kept at zero.
#[derive(Debug, Clone, PartialEq)]
pub struct Gradient {
    equation: EquationType,
    grid: Grid,
    active: ParameterSet,
    fields: BTreeMap<Parameter, Array2<f64>>,
}

impl Gradient {
    pub fn new(equation: EquationType, grid: Grid, active: &ParameterSet) -> Result<Self> {
        check_supported(equation, active)?;
        let fields = equation
            .parameters()
            .iter()
            .map(|&p| (p, grid.zeros()))
            .collect();
        Ok(Gradient {
            equation,
            grid,
            active: active.clone(),
            fields,
        })
    }

    pub fn equation(&self) -> EquationType {
        self.equation
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    pub fn active(&self) -> &ParameterSet {
        &self.active
    }

    /// Switches the active set; fields leaving it are zeroed.
    pub fn set_active(&mut self, active: &ParameterSet) -> Result<()> {
        check_supported(self.equation, active)?;
        for (p, field) in self.fields.iter_mut() {
            if !active.contains(*p) {
                field.fill(0.0);
            }
        }
        self.active = active.clone();
        Ok(())
    }

    pub fn reset(&mut self) {
        for field in self.fields.values_mut() {
            field.fill(0.0);
        }
    }

    pub fn get(&self, parameter: Parameter) -> Result<&Array2<f64>> {
        self.fields
            .get(&parameter)
            .ok_or_else(|| unsupported(self.equation, parameter))
    }

    pub fn get_mut(&mut self, parameter: Parameter) -> Result<&mut Array2<f64>> {
        if !self.active.contains(parameter) {
            if !self.equation.has_parameter(parameter) {
                return Err(unsupported(self.equation, parameter));
            }
            return Err(InversionError::InactiveParameter(parameter));
        }
        let equation = self.equation;
        self.fields
            .get_mut(&parameter)
            .ok_or_else(|| unsupported(equation, parameter))
    }

    pub fn set(&mut self, parameter: Parameter, values: Array2<f64>) -> Result<()> {
        self.grid.check(&values)?;
        *self.get_mut(parameter)? = values;
        Ok(())
    }

    /// Active fields in parameter order.
    pub fn active_fields(&self) -> impl Iterator<Item = (Parameter, &Array2<f64>)> {
        self.fields
            .iter()
            .filter(|(p, _)| self.active.contains(**p))
            .map(|(&p, f)| (p, f))
    }

    fn active_fields_mut(&mut self) -> impl Iterator<Item = (Parameter, &mut Array2<f64>)> {
        let active = &self.active;
        self.fields
            .iter_mut()
            .filter(move |(p, _)| active.contains(**p))
            .map(|(&p, f)| (p, f))
    }

    pub fn is_finite(&self) -> bool {
        self.active_fields()
            .all(|(_, f)| f.iter().all(|v| v.is_finite()))
    }

    /// Turns the accumulated correlations of one shot into parameter gradients.
    ///
    /// Porosity and saturation gradients are the chain rule through the
    /// model's petrophysical Jacobians; without a Jacobian a term contributes zero.
    pub fn estimate_parameter(&mut self, xcorr: &ZeroLagXcorr, model: &Model, dt: f64) -> Result<()> {
        let petro = self.active.iter().any(Parameter::is_petrophysical);
        let wanted: BTreeSet<Parameter> = self
            .equation
            .parameters()
            .iter()
            .copied()
            .filter(|p| !p.is_petrophysical() && (petro || self.active.contains(*p)))
            .collect();
        let physical = physical_gradients(xcorr, model, dt, &wanted)?;

        for p in self.active.iter() {
            let gradient = if p.is_petrophysical() {
                let mut acc = self.grid.zeros();
                for (&q, g) in &physical {
                    if let Some(jacobian) = model.jacobian(q, p) {
                        Zip::from(&mut acc)
                            .and(g)
                            .and(jacobian)
                            .for_each(|a, &g, &j| *a += g * j);
                    }
                }
                acc
            } else {
                match physical.get(&p) {
                    Some(g) => g.clone(),
                    None => return Err(unsupported(self.equation, p)),
                }
            };
            self.fields.insert(p, gradient);
        }
        Ok(())
    }

    /// Rescales every parameter inverted for in the current stage so that its
    /// largest update is `factor` times the largest model value.
    pub fn scale(&mut self, model: &Model, workflow: &Workflow, factor: f64) -> Result<()> {
        for (p, field) in self.active_fields_mut() {
            if !workflow.is_inverting(p) {
                continue;
            }
            let max_model = max_abs(model.get(p)?);
            let max_gradient = max_abs(field);
            if max_gradient > 0.0 {
                let s = factor * max_model / max_gradient;
                field.mapv_inplace(|v| v * s);
            }
        }
        Ok(())
    }

    /// Divides each active field by its maximum absolute value.
    pub fn normalize(&mut self) {
        for (_, field) in self.active_fields_mut() {
            let max = max_abs(field);
            if max > 0.0 {
                field.mapv_inplace(|v| v / max);
            }
        }
    }

    /// Sliding `width x width` median; windows are truncated at the edges.
    pub fn apply_median_filter(&mut self, width: usize) {
        if width < 2 {
            return;
        }
        for (_, field) in self.active_fields_mut() {
            *field = median_filter(field, width);
        }
    }

    /// Multiplies every active field by `mask`.
    pub fn apply_mask(&mut self, mask: &Array2<f64>) {
        *self *= mask;
    }

    /// Sums the active fields over the group (shot reduction).
    pub fn sum_shot_domain(&mut self, comm: &dyn Communicator) {
        for (_, field) in self.active_fields_mut() {
            topology::sum_field(comm, field);
        }
    }

    /// Writes every active field to `<base>.<parameter>.<ext>`.
    pub fn write(&self, base: &str, format: FileFormat) -> Result<Vec<PathBuf>> {
        self.active_fields()
            .map(|(p, field)| io::write_field(&format!("{}.{}", base, p.name()), field, format))
            .collect()
    }
}

fn check_supported(equation: EquationType, active: &ParameterSet) -> Result<()> {
    match active.iter().find(|p| !equation.has_parameter(*p)) {
        Some(p) => Err(unsupported(equation, p)),
        None => Ok(()),
    }
}

fn unsupported(equation: EquationType, parameter: Parameter) -> InversionError {
    InversionError::UnsupportedParameter {
        parameter,
        equation: equation.name().to_string(),
    }
}

/// `model -= steplength * gradient` on the active parameters.
pub fn apply_gradient_update(model: &mut Model, gradient: &Gradient, steplength: f64) -> Result<()> {
    for (p, g) in gradient.active_fields() {
        let field = model.get_mut(p)?;
        Zip::from(field).and(g).for_each(|m, &g| *m -= steplength * g);
    }
    Ok(())
}

pub(crate) fn max_abs(field: &Array2<f64>) -> f64 {
    field.iter().fold(0.0_f64, |m, v| m.max(v.abs()))
}

fn safe_div(num: f64, den: f64) -> f64 {
    if den == 0.0 {
        0.0
    } else {
        num / den
    }
}

fn median_filter(field: &Array2<f64>, width: usize) -> Array2<f64> {
    let (nx, nz) = field.dim();
    let half = width / 2;
    let mut window = Vec::with_capacity(width * width);
    let mut out = Array2::zeros((nx, nz));
    for ((i, k), v) in out.indexed_iter_mut() {
        window.clear();
        for ii in i.saturating_sub(half)..(i + half + 1).min(nx) {
            for kk in k.saturating_sub(half)..(k + half + 1).min(nz) {
                window.push(field[[ii, kk]]);
            }
        }
        window.sort_by(f64::total_cmp);
        let n = window.len();
        *v = if n % 2 == 1 {
            window[n / 2]
        } else {
            0.5 * (window[n / 2 - 1] + window[n / 2])
        };
    }
    out
}

fn physical_gradients(
    xcorr: &ZeroLagXcorr,
    model: &Model,
    dt: f64,
    wanted: &BTreeSet<Parameter>,
) -> Result<BTreeMap<Parameter, Array2<f64>>> {
    if wanted.is_empty() {
        return Ok(BTreeMap::new());
    }
    match model.equation() {
        EquationType::Acoustic => acoustic_gradients(xcorr, model, dt, wanted),
        EquationType::Elastic | EquationType::Visco => elastic_gradients(xcorr, model, dt, wanted),
        EquationType::Sh | EquationType::ViscoSh => sh_gradients(xcorr, model, dt, wanted),
        EquationType::Emem | EquationType::Tmem | EquationType::ViscoEmem | EquationType::ViscoTmem => {
            em_gradients(xcorr, model, dt, wanted)
        }
    }
}

fn acoustic_gradients(
    xcorr: &ZeroLagXcorr,
    model: &Model,
    dt: f64,
    wanted: &BTreeSet<Parameter>,
) -> Result<BTreeMap<Parameter, Array2<f64>>> {
    let vp = model.get(Parameter::VelocityP)?;
    let rho = model.get(Parameter::Density)?;
    let xp = xcorr.get(XcorrTerm::P)?;
    let shape = model.grid().shape();

    // bulk modulus K = rho vp^2
    let grad_k = Array2::from_shape_fn(shape, |ix| {
        let k = rho[ix] * vp[ix] * vp[ix];
        -dt * safe_div(xp[ix], k * k)
    });

    let mut out = BTreeMap::new();
    for &p in wanted {
        let g = match p {
            Parameter::VelocityP => Array2::from_shape_fn(shape, |ix| 2.0 * rho[ix] * vp[ix] * grad_k[ix]),
            Parameter::Density => {
                let xrho = xcorr.get(XcorrTerm::Rho)?;
                Array2::from_shape_fn(shape, |ix| vp[ix] * vp[ix] * grad_k[ix] - dt * xrho[ix])
            }
            _ => continue,
        };
        out.insert(p, g);
    }
    Ok(out)
}

fn elastic_gradients(
    xcorr: &ZeroLagXcorr,
    model: &Model,
    dt: f64,
    wanted: &BTreeSet<Parameter>,
) -> Result<BTreeMap<Parameter, Array2<f64>>> {
    let vp = model.get(Parameter::VelocityP)?;
    let vs = model.get(Parameter::VelocityS)?;
    let rho = model.get(Parameter::Density)?;
    let mat = MaterialProperties::from_model(model)?;
    let (lambda, mu) = (&mat.lambda, &mat.mu);
    let shape = model.grid().shape();
    let relaxation = model.num_relaxation_mechanisms as f64;

    let x_lambda = xcorr.get(XcorrTerm::Lambda)?;
    let grad_lambda = Array2::from_shape_fn(shape, |ix| {
        let lm = lambda[ix] + mu[ix];
        -dt * safe_div(x_lambda[ix], 4.0 * lm * lm)
    });

    let needs_mu = wanted
        .iter()
        .any(|p| matches!(p, Parameter::VelocityS | Parameter::Density | Parameter::TauS));
    let grad_mu = if needs_mu {
        let (a, b, c) = (
            xcorr.get(XcorrTerm::MuA)?,
            xcorr.get(XcorrTerm::MuB)?,
            xcorr.get(XcorrTerm::MuC)?,
        );
        Array2::from_shape_fn(shape, |ix| {
            let mu2 = mu[ix] * mu[ix];
            let lm = lambda[ix] + mu[ix];
            -dt * (safe_div(c[ix], mu2)
                + 0.25 * (safe_div(x_lambda[ix], lm * lm) + safe_div(a[ix] - b[ix], mu2)))
        })
    } else {
        Array2::zeros(shape)
    };

    let mut out = BTreeMap::new();
    for &p in wanted {
        let g = match p {
            Parameter::VelocityP => {
                Array2::from_shape_fn(shape, |ix| 2.0 * rho[ix] * vp[ix] * grad_lambda[ix])
            }
            Parameter::VelocityS => Array2::from_shape_fn(shape, |ix| {
                -4.0 * rho[ix] * vs[ix] * grad_lambda[ix] + 2.0 * rho[ix] * vs[ix] * grad_mu[ix]
            }),
            Parameter::Density => {
                let x_rho = xcorr.get(XcorrTerm::Rho)?;
                Array2::from_shape_fn(shape, |ix| {
                    let (vp2, vs2) = (vp[ix] * vp[ix], vs[ix] * vs[ix]);
                    (vp2 - 2.0 * vs2) * grad_lambda[ix] + vs2 * grad_mu[ix] - dt * x_rho[ix]
                })
            }
            Parameter::TauP => Array2::from_shape_fn(shape, |ix| {
                grad_lambda[ix] * rho[ix] * vp[ix] * vp[ix] * relaxation
            }),
            Parameter::TauS => Array2::from_shape_fn(shape, |ix| {
                (grad_mu[ix] - 2.0 * grad_lambda[ix]) * rho[ix] * vs[ix] * vs[ix] * relaxation
            }),
            _ => continue,
        };
        out.insert(p, g);
    }
    Ok(out)
}

fn sh_gradients(
    xcorr: &ZeroLagXcorr,
    model: &Model,
    dt: f64,
    wanted: &BTreeSet<Parameter>,
) -> Result<BTreeMap<Parameter, Array2<f64>>> {
    let vs = model.get(Parameter::VelocityS)?;
    let rho = model.get(Parameter::Density)?;
    let shape = model.grid().shape();
    let relaxation = model.num_relaxation_mechanisms as f64;

    let x_mu = xcorr.get(XcorrTerm::MuC)?;
    let grad_mu = Array2::from_shape_fn(shape, |ix| {
        let mu = rho[ix] * vs[ix] * vs[ix];
        -dt * safe_div(x_mu[ix], mu * mu)
    });

    let mut out = BTreeMap::new();
    for &p in wanted {
        let g = match p {
            Parameter::VelocityS => Array2::from_shape_fn(shape, |ix| 2.0 * rho[ix] * vs[ix] * grad_mu[ix]),
            Parameter::Density => {
                let x_rho = xcorr.get(XcorrTerm::Rho)?;
                Array2::from_shape_fn(shape, |ix| vs[ix] * vs[ix] * grad_mu[ix] - dt * x_rho[ix])
            }
            Parameter::TauS => Array2::from_shape_fn(shape, |ix| {
                grad_mu[ix] * rho[ix] * vs[ix] * vs[ix] * relaxation
            }),
            _ => continue,
        };
        out.insert(p, g);
    }
    Ok(out)
}

fn em_gradients(
    xcorr: &ZeroLagXcorr,
    model: &Model,
    dt: f64,
    wanted: &BTreeSet<Parameter>,
) -> Result<BTreeMap<Parameter, Array2<f64>>> {
    let relaxation = model.num_relaxation_mechanisms as f64;
    let mut out = BTreeMap::new();
    for &p in wanted {
        let g = match p {
            Parameter::ConductivityEM => xcorr.get(XcorrTerm::SigmaEM)? * dt,
            Parameter::PermittivityEM => xcorr.get(XcorrTerm::EpsilonEM)? * dt,
            Parameter::TauConductivityEM => {
                let sigma = model.get(Parameter::ConductivityEM)?;
                xcorr.get(XcorrTerm::SigmaEM)? * sigma * (dt * relaxation)
            }
            Parameter::TauPermittivityEM => {
                let eps = model.get(Parameter::PermittivityEM)?;
                xcorr.get(XcorrTerm::EpsilonEM)? * eps * (dt * relaxation)
            }
            _ => continue,
        };
        out.insert(p, g);
    }
    Ok(out)
}

impl AddAssign<&Gradient> for Gradient {
    fn add_assign(&mut self, rhs: &Gradient) {
        for (p, field) in self.active_fields_mut() {
            if let Some(other) = rhs.fields.get(&p) {
                *field += other;
            }
        }
    }
}

impl SubAssign<&Gradient> for Gradient {
    fn sub_assign(&mut self, rhs: &Gradient) {
        for (p, field) in self.active_fields_mut() {
            if let Some(other) = rhs.fields.get(&p) {
                *field -= other;
            }
        }
    }
}

impl MulAssign<f64> for Gradient {
    fn mul_assign(&mut self, rhs: f64) {
        for (_, field) in self.active_fields_mut() {
            field.mapv_inplace(|v| v * rhs);
        }
    }
}

impl MulAssign<&Array2<f64>> for Gradient {
    fn mul_assign(&mut self, rhs: &Array2<f64>) {
        for (_, field) in self.active_fields_mut() {
            *field *= rhs;
        }
    }
}

impl Add<&Gradient> for &Gradient {
    type Output = Gradient;

    fn add(self, rhs: &Gradient) -> Gradient {
        let mut out = self.clone();
        out += rhs;
        out
    }
}

impl Sub<&Gradient> for &Gradient {
    type Output = Gradient;

    fn sub(self, rhs: &Gradient) -> Gradient {
        let mut out = self.clone();
        out -= rhs;
        out
    }
}

impl Mul<f64> for &Gradient {
    type Output = Gradient;

    fn mul(self, rhs: f64) -> Gradient {
        let mut out = self.clone();
        out *= rhs;
        out
    }
}
