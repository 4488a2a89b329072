use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::acquisition::{Receivers, Sources};
use crate::equation::EquationType;
use crate::gradient_calculation::{GradientSettings, CRASH_MODEL};
use crate::grid::Grid;
use crate::inversion::InversionSettings;
use crate::io::FileFormat;
use crate::misfit::{BreakLoopType, MisfitType};
use crate::model::Model;
use crate::parameter::Parameter;
use crate::preconditioning::EnergyMode;
use crate::steplength::StepLengthParams;
use crate::wavefield::Component;
use crate::workflow::{Stage, Workflow};

/// Grid configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    pub nx: usize,
    pub nz: usize,
    pub dx: f64,
    pub dz: f64,
}

impl GridConfig {
    fn validate(&self) -> Result<()> {
        if self.nx < 3 || self.nz < 3 {
            return Err(anyhow!("Grid needs at least 3x3 points (nx={}, nz={})", self.nx, self.nz));
        }
        if self.dx <= 0.0 || self.dz <= 0.0 {
            return Err(anyhow!(
                "Grid spacing must be positive (dx={}, dz={})",
                self.dx,
                self.dz
            ));
        }
        Ok(())
    }

    pub fn grid(&self) -> Grid {
        Grid::new(self.nx, self.nz, self.dx, self.dz)
    }
}

/// Rectangular perturbation of the true model, in grid cells.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyConfig {
    pub x_start: usize,
    pub x_end: usize,
    pub z_start: usize,
    pub z_end: usize,
    #[serde(default)]
    pub vp: Option<f64>,
    #[serde(default)]
    pub vs: Option<f64>,
    #[serde(default)]
    pub rho: Option<f64>,
}

/// Homogeneous starting model (m/s, kg/m³).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_equation")]
    pub equation: EquationType,
    pub vp: f64,
    pub vs: f64,
    pub rho: f64,
    /// Perturbations making up the true model that generates the observed data.
    #[serde(default)]
    pub anomalies: Vec<AnomalyConfig>,
}

fn default_equation() -> EquationType {
    EquationType::Elastic
}

impl ModelConfig {
    fn validate(&self, grid: &GridConfig) -> Result<()> {
        if self.equation != EquationType::Elastic {
            return Err(anyhow!(
                "Only the elastic solver is available, got equation '{}'",
                self.equation
            ));
        }
        if self.vp <= 0.0 || self.vs <= 0.0 || self.rho <= 0.0 {
            return Err(anyhow!(
                "Material properties must be positive (vp={}, vs={}, rho={})",
                self.vp,
                self.vs,
                self.rho
            ));
        }
        if self.vs > self.vp {
            return Err(anyhow!(
                "S-wave velocity must be less than P-wave velocity (vs={} > vp={})",
                self.vs,
                self.vp
            ));
        }
        for (i, a) in self.anomalies.iter().enumerate() {
            if a.x_start >= a.x_end || a.z_start >= a.z_end || a.x_end > grid.nx || a.z_end > grid.nz {
                return Err(anyhow!(
                    "Anomaly {} spans an empty or out-of-grid box ([{}, {}) x [{}, {}))",
                    i,
                    a.x_start,
                    a.x_end,
                    a.z_start,
                    a.z_end
                ));
            }
        }
        Ok(())
    }

    pub fn starting_model(&self, grid: &Grid) -> Result<Model> {
        Ok(Model::homogeneous(
            self.equation,
            grid.clone(),
            &[
                (Parameter::VelocityP, self.vp),
                (Parameter::VelocityS, self.vs),
                (Parameter::Density, self.rho),
            ],
        )?)
    }

    /// Starting model with every anomaly painted in.
    pub fn true_model(&self, grid: &Grid) -> Result<Model> {
        let mut model = self.starting_model(grid)?;
        for a in &self.anomalies {
            for (parameter, value) in [
                (Parameter::VelocityP, a.vp),
                (Parameter::VelocityS, a.vs),
                (Parameter::Density, a.rho),
            ] {
                if let Some(value) = value {
                    model
                        .get_mut(parameter)?
                        .slice_mut(ndarray::s![a.x_start..a.x_end, a.z_start..a.z_end])
                        .fill(value);
                }
            }
        }
        Ok(model)
    }

    pub fn max_vp(&self) -> f64 {
        self.anomalies
            .iter()
            .filter_map(|a| a.vp)
            .fold(self.vp, f64::max)
    }
}

/// Time stepping (`DT`, `T`, `DTInversion`, `DHInversion`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dt: Option<f64>, // Optional: will be auto-computed from CFL if not provided
    pub total_time: f64,
    #[serde(default = "default_cfl_safety")]
    pub cfl_safety: f64,
    #[serde(default = "default_one")]
    pub dt_inversion: usize,
    #[serde(default = "default_one")]
    pub dh_inversion: usize,
}

fn default_cfl_safety() -> f64 {
    0.5
}

fn default_one() -> usize {
    1
}

impl SimulationConfig {
    fn validate(&self) -> Result<()> {
        if self.total_time <= 0.0 {
            return Err(anyhow!("total_time must be positive, got {}", self.total_time));
        }
        if self.cfl_safety <= 0.0 || self.cfl_safety > 1.0 {
            return Err(anyhow!(
                "cfl_safety must be in (0, 1], got {}",
                self.cfl_safety
            ));
        }
        if self.dt_inversion == 0 || self.dh_inversion == 0 {
            return Err(anyhow!(
                "dt_inversion and dh_inversion must be at least 1 (got {} and {})",
                self.dt_inversion,
                self.dh_inversion
            ));
        }
        Ok(())
    }

    /// Compute dt from CFL condition if not specified
    pub fn compute_dt_if_needed(&mut self, dx: f64, dz: f64, vp_max: f64) {
        if self.dt.is_none() {
            self.dt = Some(self.cfl_safety * dx.min(dz) / vp_max);
        }
    }

    pub fn dt(&self) -> Result<f64> {
        self.dt.ok_or_else(|| anyhow!("dt has not been computed"))
    }

    /// Calculate number of timesteps given dt
    pub fn compute_nt(&self, dt: f64) -> usize {
        (self.total_time / dt).round() as usize
    }
}

/// One shot: a Ricker source at a grid position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub x: usize,
    pub z: usize,
    pub frequency: f64,
    #[serde(default = "default_source_component")]
    pub component: String,
}

fn default_source_component() -> String {
    "p".to_string()
}

/// Horizontal line of receivers at depth `z`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiverLineConfig {
    pub z: usize,
    pub x_start: usize,
    pub x_end: usize,
    #[serde(default = "default_one")]
    pub spacing: usize,
    #[serde(default = "default_receiver_component")]
    pub component: String,
}

fn default_receiver_component() -> String {
    "vz".to_string()
}

impl ReceiverLineConfig {
    pub fn positions(&self) -> Vec<(usize, usize)> {
        (self.x_start..=self.x_end)
            .step_by(self.spacing.max(1))
            .map(|x| (x, self.z))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    pub sources: Vec<SourceConfig>,
    pub receivers: ReceiverLineConfig,
}

pub fn parse_component(name: &str) -> Result<Component> {
    use Component::*;
    [Vx, Vy, Vz, P, Sxx, Szz, Sxz, Sxy, Syz, Ex, Ey, Ez, Hx, Hy, Hz]
        .into_iter()
        .find(|c| c.name().eq_ignore_ascii_case(name))
        .ok_or_else(|| anyhow!("Unknown wavefield component '{}'", name))
}

impl AcquisitionConfig {
    fn validate(&self, nx: usize, nz: usize, equation: EquationType) -> Result<()> {
        if self.sources.is_empty() {
            return Err(anyhow!("At least one source must be defined"));
        }
        for (i, source) in self.sources.iter().enumerate() {
            if source.x >= nx || source.z >= nz {
                return Err(anyhow!(
                    "Source {} at ({}, {}) is outside grid bounds ({}, {})",
                    i,
                    source.x,
                    source.z,
                    nx,
                    nz
                ));
            }
            if source.frequency <= 0.0 {
                return Err(anyhow!("Source frequency must be positive, got {}", source.frequency));
            }
            check_component(&source.component, equation)?;
        }
        let line = &self.receivers;
        if line.x_start > line.x_end || line.x_end >= nx || line.z >= nz {
            return Err(anyhow!(
                "Receiver line x=[{}, {}] z={} does not fit the grid ({}, {})",
                line.x_start,
                line.x_end,
                line.z,
                nx,
                nz
            ));
        }
        check_component(&line.component, equation)
    }
}

impl AcquisitionConfig {
    /// One Ricker shot per configured source.
    pub fn shots(&self, grid: &Grid, dt: f64, nt: usize) -> Result<Vec<Sources>> {
        self.sources
            .iter()
            .map(|s| -> Result<Sources> {
                let component = parse_component(&s.component)?;
                Ok(Sources::ricker(grid, (s.x, s.z), component, s.frequency, dt, nt)?)
            })
            .collect()
    }

    pub fn receivers(&self, grid: &Grid, nt: usize) -> Result<Receivers> {
        let component = parse_component(&self.receivers.component)?;
        Ok(Receivers::new(grid, self.receivers.positions(), component, nt)?)
    }
}

fn check_component(name: &str, equation: EquationType) -> Result<()> {
    let component = parse_component(name)?;
    // pressure in a stress formulation is injected as an explosion
    if component != Component::P && !equation.components().contains(&component) {
        return Err(anyhow!(
            "Component '{}' does not exist in a {} wavefield",
            name,
            equation
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdConfig {
    pub parameter: Parameter,
    pub min: f64,
    pub max: f64,
}

/// Misfit, abort and update settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InversionConfig {
    #[serde(default)]
    pub misfit_types: Vec<MisfitType>,
    #[serde(default)]
    pub break_loop_type: i64,
    #[serde(default = "default_gradient_scale")]
    pub gradient_scale: f64,
    #[serde(default)]
    pub use_model_thresholds: bool,
    #[serde(default)]
    pub thresholds: Vec<ThresholdConfig>,
    #[serde(default)]
    pub exchange_strategy: i64,
}

fn default_gradient_scale() -> f64 {
    0.05
}

impl InversionConfig {
    fn validate(&self) -> Result<()> {
        BreakLoopType::try_from(self.break_loop_type)?;
        if self.gradient_scale <= 0.0 {
            return Err(anyhow!("gradient_scale must be positive, got {}", self.gradient_scale));
        }
        if !(0..=6).contains(&self.exchange_strategy) {
            return Err(anyhow!("exchange_strategy must be in 0..=6, got {}", self.exchange_strategy));
        }
        for t in &self.thresholds {
            if t.min > t.max {
                return Err(anyhow!(
                    "Threshold for {} has min {} above max {}",
                    t.parameter,
                    t.min,
                    t.max
                ));
            }
        }
        Ok(())
    }

    pub fn thresholds(&self) -> Option<BTreeMap<Parameter, [f64; 2]>> {
        self.use_model_thresholds.then(|| {
            self.thresholds
                .iter()
                .map(|t| (t.parameter, [t.min, t.max]))
                .collect()
        })
    }
}

fn validate_steplength(params: &StepLengthParams) -> Result<()> {
    if params.min <= 0.0 || params.min > params.max {
        return Err(anyhow!(
            "Step length bounds must satisfy 0 < min <= max (min={}, max={})",
            params.min,
            params.max
        ));
    }
    if params.init < params.min || params.init > params.max {
        return Err(anyhow!(
            "Initial step length {} is outside [{}, {}]",
            params.init,
            params.min,
            params.max
        ));
    }
    if params.max_step_calc == 0 {
        return Err(anyhow!("max_step_calc must be at least 1"));
    }
    Ok(())
}

/// Gradient tapers and preconditioning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreconditioningConfig {
    #[serde(default)]
    pub energy_preconditioning: EnergyMode,
    #[serde(default = "default_epsilon_hessian")]
    pub epsilon_hessian: f64,
    #[serde(default)]
    pub save_approx_hessian: Option<String>,
    #[serde(default)]
    pub source_taper_radius: usize,
    #[serde(default)]
    pub receiver_taper_radius: usize,
    #[serde(default)]
    pub depth_taper_width: usize,
    #[serde(default)]
    pub median_filter_width: usize,
}

fn default_epsilon_hessian() -> f64 {
    0.005
}

impl Default for PreconditioningConfig {
    fn default() -> Self {
        PreconditioningConfig {
            energy_preconditioning: EnergyMode::default(),
            epsilon_hessian: default_epsilon_hessian(),
            save_approx_hessian: None,
            source_taper_radius: 0,
            receiver_taper_radius: 0,
            depth_taper_width: 0,
            median_filter_width: 0,
        }
    }
}

impl PreconditioningConfig {
    fn validate(&self) -> Result<()> {
        if self.energy_preconditioning != EnergyMode::Off && self.epsilon_hessian <= 0.0 {
            return Err(anyhow!(
                "epsilon_hessian must be positive with energy preconditioning, got {}",
                self.epsilon_hessian
            ));
        }
        Ok(())
    }
}

/// Output files, all relative to `directory`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_directory")]
    pub directory: PathBuf,
    #[serde(default)]
    pub file_format: FileFormat,
    #[serde(default)]
    pub write_gradient_per_shot: bool,
    #[serde(default = "default_gradient_filename")]
    pub gradient_filename: String,
    #[serde(default = "default_model_filename")]
    pub model_filename: String,
    #[serde(default = "default_misfit_log")]
    pub misfit_log: String,
    #[serde(default = "default_steplength_log")]
    pub steplength_log: String,
}

fn default_directory() -> PathBuf {
    PathBuf::from("output")
}

fn default_gradient_filename() -> String {
    "gradients/grad".to_string()
}

fn default_model_filename() -> String {
    "model/model".to_string()
}

fn default_misfit_log() -> String {
    "logs/misfit.log".to_string()
}

fn default_steplength_log() -> String {
    "logs/steplength.log".to_string()
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            directory: default_directory(),
            file_format: FileFormat::default(),
            write_gradient_per_shot: false,
            gradient_filename: default_gradient_filename(),
            model_filename: default_model_filename(),
            misfit_log: default_misfit_log(),
            steplength_log: default_steplength_log(),
        }
    }
}

impl OutputConfig {
    pub fn path(&self, name: &str) -> PathBuf {
        self.directory.join(name)
    }

    fn base(&self, name: &str) -> String {
        self.path(name).to_string_lossy().into_owned()
    }
}

/// Complete inversion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub grid: GridConfig,
    pub model: ModelConfig,
    pub simulation: SimulationConfig,
    pub acquisition: AcquisitionConfig,
    #[serde(default = "default_inversion")]
    pub inversion: InversionConfig,
    #[serde(default)]
    pub steplength: StepLengthParams,
    #[serde(default)]
    pub preconditioning: PreconditioningConfig,
    #[serde(default)]
    pub output: OutputConfig,
    pub workflow: Vec<Stage>,
}

fn default_inversion() -> InversionConfig {
    InversionConfig {
        misfit_types: Vec::new(),
        break_loop_type: 0,
        gradient_scale: default_gradient_scale(),
        use_model_thresholds: false,
        thresholds: Vec::new(),
        exchange_strategy: 0,
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| anyhow!("Failed to read config file '{}': {}", path.display(), e))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(content).map_err(|e| anyhow!("Failed to parse TOML config: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration parameters
    pub fn validate(&mut self) -> Result<()> {
        self.grid.validate()?;
        self.model.validate(&self.grid)?;
        self.simulation.validate()?;
        self.acquisition
            .validate(self.grid.nx, self.grid.nz, self.model.equation)?;
        self.inversion.validate()?;
        validate_steplength(&self.steplength)?;
        self.preconditioning.validate()?;
        Workflow::new(self.workflow.clone())?;
        for (i, stage) in self.workflow.iter().enumerate() {
            if let Some(p) = stage.invert_for.iter().find(|p| !self.model.equation.has_parameter(*p)) {
                return Err(anyhow!("Workflow stage {} inverts for {}, which a {} model does not have", i, p, self.model.equation));
            }
        }

        self.simulation
            .compute_dt_if_needed(self.grid.dx, self.grid.dz, self.model.max_vp());
        let dt = self.simulation.dt()?;
        if dt < 1e-7 {
            warn!(dt, "computed dt is very small, simulation may be slow");
        }
        if self.simulation.compute_nt(dt) < 2 {
            return Err(anyhow!("total_time {} covers fewer than two time steps", self.simulation.total_time));
        }
        Ok(())
    }

    pub fn nt(&self) -> Result<usize> {
        Ok(self.simulation.compute_nt(self.simulation.dt()?))
    }

    pub fn workflow(&self) -> Result<Workflow> {
        Ok(Workflow::new(self.workflow.clone())?)
    }

    pub fn gradient_settings(&self) -> Result<GradientSettings> {
        let p = &self.preconditioning;
        let out = &self.output;
        Ok(GradientSettings {
            dt: self.simulation.dt()?,
            nt: self.nt()?,
            dt_inversion: self.simulation.dt_inversion,
            source_taper_radius: p.source_taper_radius,
            receiver_taper_radius: p.receiver_taper_radius,
            depth_taper_width: p.depth_taper_width,
            median_filter_width: p.median_filter_width,
            energy_mode: p.energy_preconditioning,
            epsilon_hessian: p.epsilon_hessian,
            save_approx_hessian: p.save_approx_hessian.as_deref().map(|name| out.base(name)),
            file_format: out.file_format,
            write_gradient_per_shot: out.write_gradient_per_shot,
            gradient_filename: out.base(&out.gradient_filename),
            crash_model: out.base(CRASH_MODEL),
        })
    }

    pub fn inversion_settings(&self) -> Result<InversionSettings> {
        let out = &self.output;
        Ok(InversionSettings {
            gradient: self.gradient_settings()?,
            steplength: self.steplength.clone(),
            misfit_types: self.inversion.misfit_types.clone(),
            break_loop_type: BreakLoopType::try_from(self.inversion.break_loop_type)?,
            gradient_scale: self.inversion.gradient_scale,
            thresholds: self.inversion.thresholds(),
            dh_inversion: self.simulation.dh_inversion,
            file_format: out.file_format,
            model_filename: Some(out.base(&out.model_filename)),
            misfit_log: Some(out.path(&out.misfit_log)),
            steplength_log: Some(out.path(&out.steplength_log)),
        })
    }

    /// Log configuration summary
    pub fn log_summary(&self) {
        info!(
            nx = self.grid.nx,
            nz = self.grid.nz,
            width = self.grid.nx as f64 * self.grid.dx,
            depth = self.grid.nz as f64 * self.grid.dz,
            "grid"
        );
        info!(
            equation = %self.model.equation,
            vp = self.model.vp,
            vs = self.model.vs,
            rho = self.model.rho,
            anomalies = self.model.anomalies.len(),
            "starting model"
        );
        if let Ok(dt) = self.simulation.dt() {
            info!(
                dt,
                nt = self.simulation.compute_nt(dt),
                total_time = self.simulation.total_time,
                dt_inversion = self.simulation.dt_inversion,
                "time stepping"
            );
        }
        info!(
            shots = self.acquisition.sources.len(),
            receivers = self.acquisition.receivers.positions().len(),
            "acquisition"
        );
        for (i, stage) in self.workflow.iter().enumerate() {
            info!(
                stage = i + 1,
                invert_for = ?stage.invert_for,
                relative_misfit_change = stage.relative_misfit_change,
                max_iterations = stage.max_iterations,
                "workflow stage"
            );
        }
    }
}
