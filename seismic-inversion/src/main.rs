use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use seismic_inversion::config::Config;
use seismic_inversion::inversion::{synthetic_observations, Inversion};
use seismic_inversion::parameter::Parameter;
use seismic_inversion::solver::ElasticSolver;
use seismic_inversion::topology::ShotTopology;
use seismic_inversion::visualisation::FieldPlotter;

/// Full-waveform inversion of synthetic elastic data.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// TOML configuration file
    config: PathBuf,

    /// Log filter, overridden by RUST_LOG
    #[arg(long, default_value = "info")]
    log: String,

    /// Write PNG images of the true and the final P-wave velocity
    #[arg(long)]
    plot: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log)))
        .init();

    let config = Config::from_file(&cli.config)?;
    config.log_summary();

    let out = &config.output.directory;
    let grid = config.grid.grid();
    let dt = config.simulation.dt()?;
    let nt = config.nt()?;
    let mut solver = ElasticSolver::new(grid.clone(), dt, config.simulation.cfl_safety);

    let true_model = config.model.true_model(&grid)?;
    true_model.write(&config.output.path("model/true").to_string_lossy(), config.output.file_format)?;
    let shots = config.acquisition.shots(&grid, dt, nt)?;
    let receivers = config.acquisition.receivers(&grid, nt)?;
    info!(shots = shots.len(), nt, "modelling observed data");
    let gathers = synthetic_observations(&mut solver, &true_model, &grid, &shots, &receivers, nt)?;

    let mut model = config.model.starting_model(&grid)?;
    let mut inversion = Inversion::new(
        solver,
        grid,
        config.workflow()?,
        config.inversion_settings()?,
        ShotTopology::single(),
    );
    let summary = inversion.run(&mut model, &gathers)?;
    info!(
        iterations = summary.iterations,
        final_stage = summary.final_stage + 1,
        misfit = ?summary.misfit_history.last(),
        "inversion finished"
    );
    model.write(&config.output.path("model/final").to_string_lossy(), config.output.file_format)?;

    if cli.plot {
        let plotter = FieldPlotter::sequential(800, 600);
        plotter.plot_field(
            true_model.get(Parameter::VelocityP)?,
            &config.output.path("true_vp.png"),
            "True P-wave velocity",
        )?;
        plotter.plot_field(
            model.get(Parameter::VelocityP)?,
            &config.output.path("final_vp.png"),
            "Inverted P-wave velocity",
        )?;
        info!(directory = %out.display(), "images written");
    }
    Ok(())
}
