//! Zero-lag cross-correlation of forward and adjoint wavefields.
//!
//! Each correlation term is a sum of elementwise products of one forward
//! component (either the field itself or its time derivative) with one adjoint
//! component. The pairings per equation family live in [`pairings`]; the
//! accumulator only allocates the terms the active parameter set needs.

use std::collections::BTreeMap;
use std::fmt;

use ndarray::{Array2, Zip};

use crate::equation::EquationType;
use crate::error::{InversionError, Result};
use crate::grid::Grid;
use crate::parameter::{Parameter, ParameterSet};
use crate::wavefield::{Component, Wavefield};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum XcorrTerm {
    Lambda,
    MuA,
    MuB,
    MuC,
    Rho,
    P,
    SigmaEM,
    EpsilonEM,
}

impl XcorrTerm {
    pub fn name(self) -> &'static str {
        match self {
            XcorrTerm::Lambda => "xcorrLambda",
            XcorrTerm::MuA => "xcorrMuA",
            XcorrTerm::MuB => "xcorrMuB",
            XcorrTerm::MuC => "xcorrMuC",
            XcorrTerm::Rho => "xcorrRho",
            XcorrTerm::P => "xcorrP",
            XcorrTerm::SigmaEM => "xcorrSigmaEM",
            XcorrTerm::EpsilonEM => "xcorrEpsilonEM",
        }
    }
}

impl fmt::Display for XcorrTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which forward field a product reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardField {
    Field,
    Derivative,
}

/// One `forward[c1] * adjoint[c2]` product contributing to a term.
pub type Pairing = (ForwardField, Component, Component);

const PETRO: [Parameter; 2] = [Parameter::Porosity, Parameter::Saturation];

fn activated_by(active: &ParameterSet, parameters: &[Parameter]) -> bool {
    active.contains_any(parameters) || active.contains_any(&PETRO)
}

/// Correlation terms needed to invert for `active` with this equation family.
pub fn required_terms(equation: EquationType, active: &ParameterSet) -> Vec<XcorrTerm> {
    use Parameter::*;
    let mut terms = Vec::new();
    match equation {
        EquationType::Acoustic => {
            if activated_by(active, &[VelocityP, Density]) {
                terms.push(XcorrTerm::P);
            }
            if activated_by(active, &[Density]) {
                terms.push(XcorrTerm::Rho);
            }
        }
        EquationType::Elastic | EquationType::Visco => {
            if activated_by(active, &[VelocityP, VelocityS, Density, TauP, TauS]) {
                terms.push(XcorrTerm::Lambda);
            }
            if activated_by(active, &[VelocityS, Density, TauS]) {
                terms.extend([XcorrTerm::MuA, XcorrTerm::MuB, XcorrTerm::MuC]);
            }
            if activated_by(active, &[Density]) {
                terms.push(XcorrTerm::Rho);
            }
        }
        EquationType::Sh | EquationType::ViscoSh => {
            if activated_by(active, &[VelocityS, Density, TauS]) {
                terms.push(XcorrTerm::MuC);
            }
            if activated_by(active, &[Density]) {
                terms.push(XcorrTerm::Rho);
            }
        }
        EquationType::Emem | EquationType::Tmem | EquationType::ViscoEmem | EquationType::ViscoTmem => {
            if activated_by(active, &[ConductivityEM, TauConductivityEM]) {
                terms.push(XcorrTerm::SigmaEM);
            }
            if activated_by(
                active,
                &[ConductivityEM, PermittivityEM, TauConductivityEM, TauPermittivityEM],
            ) {
                terms.push(XcorrTerm::EpsilonEM);
            }
        }
    }
    terms
}

/// Component products forming `term` for this equation family.
pub fn pairings(equation: EquationType, term: XcorrTerm) -> &'static [Pairing] {
    use Component::*;
    use ForwardField::*;
    match (equation, term) {
        (EquationType::Acoustic, XcorrTerm::P) => &[(Derivative, P, P)],
        (EquationType::Acoustic, XcorrTerm::Rho) => &[(Derivative, Vx, Vx), (Derivative, Vz, Vz)],
        // (sxx + szz) * (sxx + szz)
        (EquationType::Elastic | EquationType::Visco, XcorrTerm::Lambda) => &[
            (Derivative, Sxx, Sxx),
            (Derivative, Sxx, Szz),
            (Derivative, Szz, Sxx),
            (Derivative, Szz, Szz),
        ],
        (EquationType::Elastic | EquationType::Visco, XcorrTerm::MuA) => {
            &[(Derivative, Sxx, Sxx), (Derivative, Szz, Szz)]
        }
        (EquationType::Elastic | EquationType::Visco, XcorrTerm::MuB) => {
            &[(Derivative, Szz, Sxx), (Derivative, Sxx, Szz)]
        }
        (EquationType::Elastic | EquationType::Visco, XcorrTerm::MuC) => &[(Derivative, Sxz, Sxz)],
        (EquationType::Elastic | EquationType::Visco, XcorrTerm::Rho) => {
            &[(Derivative, Vx, Vx), (Derivative, Vz, Vz)]
        }
        (EquationType::Sh | EquationType::ViscoSh, XcorrTerm::MuC) => {
            &[(Derivative, Sxy, Sxy), (Derivative, Syz, Syz)]
        }
        (EquationType::Sh | EquationType::ViscoSh, XcorrTerm::Rho) => &[(Derivative, Vy, Vy)],
        (EquationType::Emem | EquationType::ViscoEmem, XcorrTerm::SigmaEM) => {
            &[(Field, Ex, Ex), (Field, Ez, Ez)]
        }
        (EquationType::Emem | EquationType::ViscoEmem, XcorrTerm::EpsilonEM) => {
            &[(Derivative, Ex, Ex), (Derivative, Ez, Ez)]
        }
        (EquationType::Tmem | EquationType::ViscoTmem, XcorrTerm::SigmaEM) => &[(Field, Ey, Ey)],
        (EquationType::Tmem | EquationType::ViscoTmem, XcorrTerm::EpsilonEM) => {
            &[(Derivative, Ey, Ey)]
        }
        _ => &[],
    }
}

/// Correlation accumulators of one shot.
#[derive(Debug, Clone)]
pub struct ZeroLagXcorr {
    equation: EquationType,
    terms: BTreeMap<XcorrTerm, Array2<f64>>,
}

impl ZeroLagXcorr {
    pub fn new(equation: EquationType, grid: &Grid, active: &ParameterSet) -> Self {
        let terms = required_terms(equation, active)
            .into_iter()
            .map(|t| (t, grid.zeros()))
            .collect();
        ZeroLagXcorr { equation, terms }
    }

    pub fn equation(&self) -> EquationType {
        self.equation
    }

    pub fn reset(&mut self) {
        for field in self.terms.values_mut() {
            field.fill(0.0);
        }
    }

    pub fn is_allocated(&self, term: XcorrTerm) -> bool {
        self.terms.contains_key(&term)
    }

    pub fn terms(&self) -> impl Iterator<Item = XcorrTerm> + '_ {
        self.terms.keys().copied()
    }

    pub fn get(&self, term: XcorrTerm) -> Result<&Array2<f64>> {
        self.terms
            .get(&term)
            .ok_or(InversionError::UnsupportedXcorr { term })
    }

    /// Adds the zero-lag products of one sampled backward timestep.
    pub fn update(&mut self, forward_derivative: &Wavefield, forward: &Wavefield, adjoint: &Wavefield) -> Result<()> {
        for (&term, acc) in self.terms.iter_mut() {
            for &(source, fwd_component, adj_component) in pairings(self.equation, term) {
                let fwd = match source {
                    ForwardField::Field => forward.get(fwd_component)?,
                    ForwardField::Derivative => forward_derivative.get(fwd_component)?,
                };
                let adj = adjoint.get(adj_component)?;
                Zip::from(&mut *acc)
                    .and(fwd)
                    .and(adj)
                    .par_for_each(|a, &f, &b| *a += f * b);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn filled(equation: EquationType, grid: &Grid, value: f64) -> Wavefield {
        let mut wf = Wavefield::new(equation, grid);
        for (_, field) in wf.iter_mut() {
            field.fill(value);
        }
        wf
    }

    #[test]
    fn only_required_terms_are_allocated() {
        let grid = Grid::new(3, 3, 1.0, 1.0);
        let xcorr = ZeroLagXcorr::new(
            EquationType::Elastic,
            &grid,
            &ParameterSet::from([Parameter::VelocityP]),
        );
        assert!(xcorr.get(XcorrTerm::Lambda).is_ok());
        assert!(matches!(
            xcorr.get(XcorrTerm::Rho),
            Err(InversionError::UnsupportedXcorr { term: XcorrTerm::Rho })
        ));

        let em = ZeroLagXcorr::new(
            EquationType::Emem,
            &grid,
            &ParameterSet::from([Parameter::PermittivityEM]),
        );
        assert_eq!(em.terms().collect::<Vec<_>>(), vec![XcorrTerm::EpsilonEM]);
    }

    #[test]
    fn petrophysical_inversion_needs_every_term() {
        let grid = Grid::new(2, 2, 1.0, 1.0);
        let xcorr = ZeroLagXcorr::new(
            EquationType::Elastic,
            &grid,
            &ParameterSet::from([Parameter::Porosity]),
        );
        assert_eq!(xcorr.terms().count(), 5);
    }

    #[test]
    fn accumulation_is_linear_in_timesteps() {
        let grid = Grid::new(4, 5, 1.0, 1.0);
        let active = ParameterSet::from([Parameter::VelocityS, Parameter::Density]);
        let mut xcorr = ZeroLagXcorr::new(EquationType::Elastic, &grid, &active);
        let deriv = filled(EquationType::Elastic, &grid, 3.0);
        let fwd = filled(EquationType::Elastic, &grid, 1.0);
        let adj = filled(EquationType::Elastic, &grid, 2.0);

        xcorr.update(&deriv, &fwd, &adj).unwrap();
        let single: BTreeMap<_, _> = xcorr
            .terms()
            .map(|t| (t, xcorr.get(t).unwrap()[[1, 1]]))
            .collect();
        assert_eq!(single[&XcorrTerm::Lambda], 24.0);
        assert_eq!(single[&XcorrTerm::MuC], 6.0);

        let n = 7;
        for _ in 1..n {
            xcorr.update(&deriv, &fwd, &adj).unwrap();
        }
        for (term, value) in single {
            let field = xcorr.get(term).unwrap();
            assert!(field.iter().all(|&v| v == n as f64 * value), "{term}");
        }

        xcorr.reset();
        assert!(xcorr.get(XcorrTerm::Rho).unwrap().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn em_sigma_correlates_the_field_itself() {
        let grid = Grid::new(2, 2, 1.0, 1.0);
        let active = ParameterSet::from([Parameter::ConductivityEM]);
        let mut xcorr = ZeroLagXcorr::new(EquationType::Tmem, &grid, &active);
        let deriv = filled(EquationType::Tmem, &grid, 5.0);
        let fwd = filled(EquationType::Tmem, &grid, 2.0);
        let adj = filled(EquationType::Tmem, &grid, 0.5);
        xcorr.update(&deriv, &fwd, &adj).unwrap();
        assert_relative_eq!(xcorr.get(XcorrTerm::SigmaEM).unwrap()[[0, 0]], 1.0);
        assert_relative_eq!(xcorr.get(XcorrTerm::EpsilonEM).unwrap()[[0, 0]], 2.5);
    }

    #[test]
    fn mismatched_wavefield_is_an_error() {
        let grid = Grid::new(2, 2, 1.0, 1.0);
        let active = ParameterSet::from([Parameter::VelocityP]);
        let mut xcorr = ZeroLagXcorr::new(EquationType::Elastic, &grid, &active);
        let em = Wavefield::new(EquationType::Emem, &grid);
        assert!(xcorr.update(&em, &em, &em).is_err());
    }
}
