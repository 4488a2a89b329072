//! Adjoint-state full-waveform inversion.
//!
//! A [`solver::WaveSolver`] provides forward and adjoint runs. Per shot,
//! [`gradient_calculation::GradientCalculation`] cross-correlates the stored
//! forward wavefield with the adjoint one and post-processes the result.
//! [`inversion::Inversion`] drives the outer loop: conjugate gradient,
//! parabolic line search and workflow stages.

pub mod acquisition;
pub mod config;
pub mod equation;
pub mod error;
pub mod gradient;
pub mod gradient_calculation;
pub mod grid;
pub mod inversion;
pub mod io;
pub mod joint;
pub mod materials;
pub mod misfit;
pub mod model;
pub mod optimization;
pub mod parameter;
pub mod preconditioning;
pub mod solver;
pub mod steplength;
pub mod taper;
pub mod topology;
pub mod visualisation;
pub mod wavefield;
pub mod workflow;
pub mod xcorr;
