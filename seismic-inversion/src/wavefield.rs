use std::collections::BTreeMap;
use std::fmt;

use ndarray::{Array2, Zip};

use crate::equation::EquationType;
use crate::error::{InversionError, Result};
use crate::grid::Grid;

/// Wavefield component on the staggered grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Component {
    Vx,
    Vy,
    Vz,
    P,
    Sxx,
    Szz,
    Sxz,
    Sxy,
    Syz,
    Ex,
    Ey,
    Ez,
    Hx,
    Hy,
    Hz,
}

impl Component {
    pub fn name(self) -> &'static str {
        match self {
            Component::Vx => "vx",
            Component::Vy => "vy",
            Component::Vz => "vz",
            Component::P => "p",
            Component::Sxx => "sxx",
            Component::Szz => "szz",
            Component::Sxz => "sxz",
            Component::Sxy => "sxy",
            Component::Syz => "syz",
            Component::Ex => "ex",
            Component::Ey => "ey",
            Component::Ez => "ez",
            Component::Hx => "hx",
            Component::Hy => "hy",
            Component::Hz => "hz",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// All components of one equation family at one timestep.
#[derive(Debug, Clone, PartialEq)]
pub struct Wavefield {
    equation: EquationType,
    fields: BTreeMap<Component, Array2<f64>>,
}

impl Wavefield {
    pub fn new(equation: EquationType, grid: &Grid) -> Self {
        let fields = equation
            .components()
            .iter()
            .map(|&c| (c, grid.zeros()))
            .collect();
        Wavefield { equation, fields }
    }

    pub fn equation(&self) -> EquationType {
        self.equation
    }

    pub fn zero(&mut self) {
        for field in self.fields.values_mut() {
            field.fill(0.0);
        }
    }

    pub fn get(&self, component: Component) -> Result<&Array2<f64>> {
        self.fields
            .get(&component)
            .ok_or_else(|| self.unsupported(component))
    }

    pub fn get_mut(&mut self, component: Component) -> Result<&mut Array2<f64>> {
        let err = self.unsupported(component);
        self.fields.get_mut(&component).ok_or(err)
    }

    fn unsupported(&self, component: Component) -> InversionError {
        InversionError::UnsupportedComponent {
            component: component.name().to_string(),
            equation: self.equation.name().to_string(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Component, &Array2<f64>)> {
        self.fields.iter().map(|(&c, f)| (c, f))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Component, &mut Array2<f64>)> {
        self.fields.iter_mut().map(|(&c, f)| (c, f))
    }

    /// `self -= rhs` component by component.
    pub fn sub_assign(&mut self, rhs: &Wavefield) {
        for (c, field) in self.fields.iter_mut() {
            if let Some(other) = rhs.fields.get(c) {
                *field -= other;
            }
        }
    }

    pub fn scale(&mut self, factor: f64) {
        for field in self.fields.values_mut() {
            field.mapv_inplace(|v| v * factor);
        }
    }

    pub fn is_finite(&self) -> bool {
        self.fields
            .values()
            .all(|f| f.iter().all(|v| v.is_finite()))
    }

    /// Sum of squared components per cell.
    pub fn squared_sum(&self) -> Array2<f64> {
        let mut iter = self.fields.values();
        let mut acc = match iter.next() {
            Some(first) => first.mapv(|v| v * v),
            None => return Array2::zeros((0, 0)),
        };
        for field in iter {
            Zip::from(&mut acc)
                .and(field)
                .par_for_each(|a, &v| *a += v * v);
        }
        acc
    }
}

/// Forward snapshots sampled every `DTInversion` timesteps, in time order.
#[derive(Debug, Clone, Default)]
pub struct WavefieldRecord {
    snapshots: Vec<Wavefield>,
}

impl WavefieldRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, snapshot: Wavefield) {
        self.snapshots.push(snapshot);
    }

    pub fn get(&self, index: usize) -> Result<&Wavefield> {
        self.snapshots
            .get(index)
            .ok_or(InversionError::MissingSnapshot {
                index,
                len: self.snapshots.len(),
            })
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elastic_wavefield_has_no_electric_field() {
        let grid = Grid::new(3, 3, 1.0, 1.0);
        let wf = Wavefield::new(EquationType::Elastic, &grid);
        assert!(wf.get(Component::Sxz).is_ok());
        assert!(matches!(
            wf.get(Component::Ex),
            Err(InversionError::UnsupportedComponent { .. })
        ));
    }

    #[test]
    fn squared_sum_adds_all_components() {
        let grid = Grid::new(2, 2, 1.0, 1.0);
        let mut wf = Wavefield::new(EquationType::Emem, &grid);
        wf.get_mut(Component::Ex).unwrap().fill(2.0);
        wf.get_mut(Component::Hy).unwrap().fill(1.0);
        let energy = wf.squared_sum();
        assert!(energy.iter().all(|&e| e == 5.0));
    }

    #[test]
    fn nan_is_detected() {
        let grid = Grid::new(2, 2, 1.0, 1.0);
        let mut wf = Wavefield::new(EquationType::Acoustic, &grid);
        assert!(wf.is_finite());
        wf.get_mut(Component::P).unwrap()[[1, 1]] = f64::NAN;
        assert!(!wf.is_finite());
    }
}
