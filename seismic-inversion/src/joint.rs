//! Parameter exchange between the two models of a joint seismic/EM inversion.

use std::collections::BTreeMap;

use ndarray::Array2;
use tracing::info;

use crate::error::{InversionError, Result};
use crate::model::Model;
use crate::parameter::Parameter;
use crate::taper::Taper2D;
use crate::topology::ShotTopology;

/// Grid the receiving model lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// `target` is on grid 1 and receives from grid 2.
    To1,
    /// `target` is on grid 2 and receives from grid 1.
    To2,
}

/// Moves porosity and/or saturation from `source` into `target`.
///
/// `exchange_strategy` 0 leaves `target` alone, 2 moves both, any other value
/// moves saturation into a seismic target or porosity into an EM target.
pub fn exchange_petrophysics(
    taper: &Taper2D,
    source: &Model,
    target: &mut Model,
    direction: Direction,
    exchange_strategy: i64,
    thresholds: Option<&BTreeMap<Parameter, [f64; 2]>>,
    topology: &ShotTopology,
) -> Result<()> {
    let parameters: &[Parameter] = match exchange_strategy {
        0 => &[],
        2 => &[Parameter::Porosity, Parameter::Saturation],
        _ if target.equation().is_seismic() => &[Parameter::Saturation],
        _ => &[Parameter::Porosity],
    };
    if !parameters.is_empty() {
        let mask = target.physical_mask()?;
        for &p in parameters {
            transfer(taper, source, target, p, direction, &mask, topology)?;
        }
        info!(
            from = %source.equation(),
            to = %target.equation(),
            exchange_strategy,
            "petrophysical parameters exchanged"
        );
    }
    if let Some(thresholds) = thresholds {
        target.apply_thresholds(thresholds)?;
    }
    Ok(())
}

/// Moves every physical parameter the two models share from `source` into `target`.
///
/// Both models must belong to the same physics (seismic or EM) and
/// `exchange_strategy` must be larger than 1.
pub fn exchange_model_parameters(
    taper: &Taper2D,
    source: &Model,
    target: &mut Model,
    direction: Direction,
    exchange_strategy: i64,
    topology: &ShotTopology,
) -> Result<()> {
    if source.equation().is_seismic() != target.equation().is_seismic() {
        return Err(InversionError::InvalidConfig(format!(
            "cannot exchange model parameters between {} and {}",
            source.equation(),
            target.equation()
        )));
    }
    if exchange_strategy <= 1 {
        return Err(InversionError::InvalidConfig(format!(
            "exchangeStrategy must be 0, 2, 4 or 6 to exchange model parameters, got {}",
            exchange_strategy
        )));
    }

    let mask = target.physical_mask()?;
    let shared: Vec<Parameter> = target
        .equation()
        .parameters()
        .iter()
        .copied()
        .filter(|p| !p.is_petrophysical() && source.equation().has_parameter(*p))
        .collect();
    for &p in &shared {
        transfer(taper, source, target, p, direction, &mask, topology)?;
    }
    info!(
        from = %source.equation(),
        to = %target.equation(),
        count = shared.len(),
        "model parameters exchanged"
    );
    Ok(())
}

fn transfer(
    taper: &Taper2D,
    source: &Model,
    target: &mut Model,
    parameter: Parameter,
    direction: Direction,
    mask: &Array2<f64>,
    topology: &ShotTopology,
) -> Result<()> {
    let from = source.get(parameter)?;
    let mut to = target.get(parameter)?.clone();
    match direction {
        Direction::To1 => taper.apply_model_transform_2to1(from, &mut to, mask, topology)?,
        Direction::To2 => taper.apply_model_transform_1to2(from, &mut to, mask, topology)?,
    }
    target.set(parameter, to)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equation::EquationType;
    use crate::grid::Grid;
    use crate::model::VACUUM_PERMITTIVITY;
    use approx::assert_abs_diff_eq;

    fn grid() -> Grid {
        Grid::new(4, 4, 1.0, 1.0)
    }

    fn taper() -> Taper2D {
        let mut taper = Taper2D::new();
        taper.calc_transform_matrix_1to2(&grid(), &grid());
        taper.calc_transform_matrix_2to1(&grid(), &grid());
        taper
    }

    fn seismic(equation: EquationType, porosity: f64, saturation: f64) -> Model {
        let mut values = vec![
            (Parameter::Density, 2000.0),
            (Parameter::Porosity, porosity),
            (Parameter::Saturation, saturation),
        ];
        if equation != EquationType::Sh {
            values.push((Parameter::VelocityP, 3000.0));
        }
        if equation != EquationType::Acoustic {
            values.push((Parameter::VelocityS, 1500.0));
        }
        Model::homogeneous(equation, grid(), &values).unwrap()
    }

    fn em(porosity: f64, saturation: f64) -> Model {
        Model::homogeneous(
            EquationType::Emem,
            grid(),
            &[
                (Parameter::ConductivityEM, 0.01),
                (Parameter::PermittivityEM, 5.0 * VACUUM_PERMITTIVITY),
                (Parameter::Porosity, porosity),
                (Parameter::Saturation, saturation),
            ],
        )
        .unwrap()
    }

    fn value(model: &Model, p: Parameter) -> f64 {
        model.get(p).unwrap()[[1, 2]]
    }

    #[test]
    fn strategy_zero_changes_nothing() {
        let source = em(0.3, 0.6);
        let mut target = seismic(EquationType::Elastic, 0.1, 0.2);
        exchange_petrophysics(&taper(), &source, &mut target, Direction::To1, 0, None, &ShotTopology::single()).unwrap();
        assert_eq!(value(&target, Parameter::Porosity), 0.1);
        assert_eq!(value(&target, Parameter::Saturation), 0.2);
    }

    #[test]
    fn strategy_two_moves_both() {
        let source = em(0.3, 0.6);
        let mut target = seismic(EquationType::Elastic, 0.1, 0.2);
        exchange_petrophysics(&taper(), &source, &mut target, Direction::To2, 2, None, &ShotTopology::single()).unwrap();
        assert_abs_diff_eq!(value(&target, Parameter::Porosity), 0.3, epsilon = 1e-12);
        assert_abs_diff_eq!(value(&target, Parameter::Saturation), 0.6, epsilon = 1e-12);
    }

    #[test]
    fn other_strategies_depend_on_target_physics() {
        let topology = ShotTopology::single();
        let mut seismic_target = seismic(EquationType::Elastic, 0.1, 0.2);
        exchange_petrophysics(&taper(), &em(0.3, 0.6), &mut seismic_target, Direction::To1, 1, None, &topology).unwrap();
        assert_eq!(value(&seismic_target, Parameter::Porosity), 0.1);
        assert_abs_diff_eq!(value(&seismic_target, Parameter::Saturation), 0.6, epsilon = 1e-12);

        let mut em_target = em(0.3, 0.6);
        exchange_petrophysics(&taper(), &seismic(EquationType::Elastic, 0.1, 0.2), &mut em_target, Direction::To1, 3, None, &topology).unwrap();
        assert_abs_diff_eq!(value(&em_target, Parameter::Porosity), 0.1, epsilon = 1e-12);
        assert_eq!(value(&em_target, Parameter::Saturation), 0.6);
    }

    #[test]
    fn thresholds_follow_exchange() {
        let mut thresholds = BTreeMap::new();
        thresholds.insert(Parameter::Porosity, [0.0, 0.25]);
        let mut target = seismic(EquationType::Elastic, 0.1, 0.2);
        exchange_petrophysics(&taper(), &em(0.3, 0.6), &mut target, Direction::To1, 2, Some(&thresholds), &ShotTopology::single())
            .unwrap();
        assert_abs_diff_eq!(value(&target, Parameter::Porosity), 0.25);
    }

    #[test]
    fn shared_seismic_parameters_only() {
        let mut source = seismic(EquationType::Acoustic, 0.1, 0.2);
        source.get_mut(Parameter::VelocityP).unwrap().fill(2500.0);
        source.get_mut(Parameter::Density).unwrap().fill(1800.0);
        let mut target = seismic(EquationType::Elastic, 0.1, 0.2);
        exchange_model_parameters(&taper(), &source, &mut target, Direction::To1, 2, &ShotTopology::single()).unwrap();
        assert_abs_diff_eq!(value(&target, Parameter::VelocityP), 2500.0, epsilon = 1e-9);
        assert_abs_diff_eq!(value(&target, Parameter::Density), 1800.0, epsilon = 1e-9);
        assert_eq!(value(&target, Parameter::VelocityS), 1500.0);
    }

    #[test]
    fn model_exchange_rejects_mixed_physics_and_low_strategy() {
        let topology = ShotTopology::single();
        let mut target = seismic(EquationType::Elastic, 0.1, 0.2);
        assert!(exchange_model_parameters(&taper(), &em(0.3, 0.6), &mut target, Direction::To1, 2, &topology).is_err());
        let source = seismic(EquationType::Elastic, 0.1, 0.2);
        assert!(exchange_model_parameters(&taper(), &source, &mut target, Direction::To1, 1, &topology).is_err());
    }
}
