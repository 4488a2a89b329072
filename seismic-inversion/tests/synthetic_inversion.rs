use seismic_inversion::config::Config;
use seismic_inversion::inversion::{synthetic_observations, Inversion};
use seismic_inversion::parameter::Parameter;
use seismic_inversion::solver::ElasticSolver;
use seismic_inversion::topology::ShotTopology;

fn config(output: &str) -> Config {
    let toml = format!(
        r#"
        [grid]
        nx = 24
        nz = 20
        dx = 10.0
        dz = 10.0

        [model]
        vp = 2000.0
        vs = 1100.0
        rho = 2000.0

        [[model.anomalies]]
        x_start = 9
        x_end = 15
        z_start = 7
        z_end = 12
        vp = 2200.0

        [simulation]
        total_time = 0.25
        dt_inversion = 2

        [acquisition]
        sources = [
            {{ x = 6, z = 3, frequency = 15.0 }},
            {{ x = 17, z = 3, frequency = 15.0 }},
        ]
        receivers = {{ z = 3, x_start = 2, x_end = 21, spacing = 2 }}

        [steplength]
        init = 0.02
        max_step_calc = 4

        [preconditioning]
        energy_preconditioning = "forward"
        source_taper_radius = 2

        [output]
        directory = '{output}'
        write_gradient_per_shot = true

        [[workflow]]
        invert_for = ["velocityP"]
        max_iterations = 2
        "#
    );
    Config::from_toml(&toml).unwrap()
}

#[test]
fn synthetic_inversion_runs_to_completion() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir.path().to_string_lossy());
    let grid = config.grid.grid();
    let dt = config.simulation.dt().unwrap();
    let nt = config.nt().unwrap();

    let mut solver = ElasticSolver::new(grid.clone(), dt, config.simulation.cfl_safety);
    let true_model = config.model.true_model(&grid).unwrap();
    let shots = config.acquisition.shots(&grid, dt, nt).unwrap();
    let receivers = config.acquisition.receivers(&grid, nt).unwrap();
    let gathers = synthetic_observations(&mut solver, &true_model, &grid, &shots, &receivers, nt).unwrap();
    assert_eq!(gathers.len(), 2);
    assert!(gathers.iter().all(|g| g.observed.iter().any(|v| *v != 0.0)));

    let mut model = config.model.starting_model(&grid).unwrap();
    let mut inversion = Inversion::new(
        solver,
        grid,
        config.workflow().unwrap(),
        config.inversion_settings().unwrap(),
        ShotTopology::single(),
    );
    let summary = inversion.run(&mut model, &gathers).unwrap();

    assert_eq!(summary.iterations, 2);
    assert_eq!(summary.misfit_history.len(), 2);
    assert!(summary.misfit_history.iter().all(|m| m.is_finite() && *m > 0.0));
    assert!(summary.misfit_history[1] < summary.misfit_history[0]);
    assert!(model.is_finite());
    // velocity at the anomaly centre moves toward the true 2200 m/s
    let centre = model.get(Parameter::VelocityP).unwrap()[[12, 9]];
    assert!(centre > 2000.0 && centre < 2400.0, "vp at anomaly centre {centre}");
    // only P-wave velocity is updated
    assert!(model.get(Parameter::VelocityS).unwrap().iter().all(|v| *v == 1100.0));

    let out = dir.path();
    assert!(out.join("logs/misfit.log").exists());
    assert!(out.join("logs/steplength.log").exists());
    assert!(out.join("model/model.stage_1.It_1.velocityP.mtx").exists());
    assert!(out.join("model/model.stage_1.It_2.velocityP.mtx").exists());
    assert!(out.join("gradients/grad.stage_1.It_1.shot_1.velocityP.mtx").exists());
}

#[test]
fn starting_model_matches_true_model_outside_anomaly() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir.path().to_string_lossy());
    let grid = config.grid.grid();
    let start = config.model.starting_model(&grid).unwrap();
    let truth = config.model.true_model(&grid).unwrap();
    let diff = truth.get(Parameter::VelocityP).unwrap() - start.get(Parameter::VelocityP).unwrap();
    assert_eq!(diff.iter().filter(|v| **v != 0.0).count(), 6 * 5);
}
