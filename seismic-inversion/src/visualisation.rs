use ndarray::Array2;
use plotters::prelude::*;
use std::path::Path;

use crate::error::{InversionError, Result};

/// How field values are mapped onto the colour gradient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorScale {
    /// `[-max|v|, max|v|]`, zero at the centre colour. For gradients and residuals.
    Symmetric,
    /// `[min, max]` of the field. For model parameters.
    Range,
}

impl ColorScale {
    /// Symmetric for fields that change sign, range otherwise.
    pub fn for_field(data: &Array2<f64>) -> Self {
        let (min, max) = min_max(data);
        if min < 0.0 && max > 0.0 {
            ColorScale::Symmetric
        } else {
            ColorScale::Range
        }
    }

    fn bounds(self, data: &Array2<f64>) -> (f64, f64) {
        let (min, max) = min_max(data);
        match self {
            ColorScale::Symmetric => {
                let max_abs = min.abs().max(max.abs());
                (-max_abs, max_abs)
            }
            ColorScale::Range => (min, max),
        }
    }
}

fn min_max(data: &Array2<f64>) -> (f64, f64) {
    data.iter()
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)))
}

/// Renders 2D fields as PNG images, one rectangle per cell.
pub struct FieldPlotter {
    width: u32,
    height: u32,
    scale: ColorScale,
    colors: Box<dyn colorgrad::Gradient>,
}

impl FieldPlotter {
    /// Red-yellow-blue, symmetric around zero.
    pub fn diverging(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            scale: ColorScale::Symmetric,
            colors: Box::new(colorgrad::preset::rd_yl_bu()),
        }
    }

    /// Viridis over the value range.
    pub fn sequential(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            scale: ColorScale::Range,
            colors: Box::new(colorgrad::preset::viridis()),
        }
    }

    /// Plotter suited to `data`, see [`ColorScale::for_field`].
    pub fn for_field(data: &Array2<f64>, width: u32, height: u32) -> Self {
        match ColorScale::for_field(data) {
            ColorScale::Symmetric => Self::diverging(width, height),
            ColorScale::Range => Self::sequential(width, height),
        }
    }

    pub fn scale(&self) -> ColorScale {
        self.scale
    }

    pub fn plot_field(&self, data: &Array2<f64>, path: &Path, title: &str) -> Result<()> {
        self.draw(data, path, title)
            .map_err(|e| InversionError::Plot(e.to_string()))
    }

    fn draw(
        &self,
        data: &Array2<f64>,
        path: &Path,
        title: &str,
    ) -> std::result::Result<(), Box<dyn std::error::Error>> {
        let root = BitMapBackend::new(path, (self.width, self.height)).into_drawing_area();
        root.fill(&WHITE)?;

        let (nx, nz) = data.dim();
        let (lo, hi) = self.scale.bounds(data);
        let caption = format!("{} [{:.3e}, {:.3e}]", title, lo, hi);

        let mut chart = ChartBuilder::on(&root)
            .caption(caption, ("sans-serif", 20))
            .margin(10)
            .x_label_area_size(40)
            .y_label_area_size(40)
            .build_cartesian_2d(0..nx, 0..nz)?;

        chart
            .configure_mesh()
            .disable_mesh()
            .x_desc("x (cells)")
            .y_desc("depth (cells)")
            .draw()?;

        chart.draw_series(data.indexed_iter().map(|((i, k), &value)| {
            Rectangle::new([(i, k), (i + 1, k + 1)], self.color(value, lo, hi).filled())
        }))?;

        root.present()?;
        Ok(())
    }

    fn color(&self, value: f64, lo: f64, hi: f64) -> RGBColor {
        let t = if hi > lo && value.is_finite() {
            ((value - lo) / (hi - lo)).clamp(0.0, 1.0)
        } else {
            0.5
        };
        let [r, g, b, _] = self.colors.at(t as f32).to_rgba8();
        RGBColor(r, g, b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn scale_follows_sign_of_field() {
        assert_eq!(ColorScale::for_field(&array![[-1.0, 2.0]]), ColorScale::Symmetric);
        assert_eq!(ColorScale::for_field(&array![[1500.0, 2000.0]]), ColorScale::Range);
        assert_eq!(ColorScale::Symmetric.bounds(&array![[-1.0, 2.0]]), (-2.0, 2.0));
        assert_eq!(ColorScale::Range.bounds(&array![[1500.0, f64::NAN, 2000.0]]), (1500.0, 2000.0));
    }

    #[test]
    fn constant_field_maps_to_centre() {
        let plotter = FieldPlotter::sequential(10, 10);
        let RGBColor(r0, g0, b0) = plotter.color(3.0, 3.0, 3.0);
        let RGBColor(r1, g1, b1) = plotter.color(7.0, 0.0, 14.0);
        assert_eq!((r0, g0, b0), (r1, g1, b1));
        assert_eq!(FieldPlotter::for_field(&array![[0.0, -1.0], [1.0, 0.0]], 10, 10).scale(), ColorScale::Symmetric);
    }
}
