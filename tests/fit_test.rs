//! End-to-end fits through the public API: linear and mass constraints, soft
//! constraints, unmeasured parameters, degenerate constraint sets and the
//! fitted covariance.

use approx::{assert_abs_diff_eq, assert_relative_eq};
use kinfit::{
    objects, FitProblem, FitState, HardConstraint, LinearConstraint, MassConstraint,
    MeasuredObject, NewtonFitter, ObjectId, ParamRef, RecordingTracer, SoftLinearConstraint,
    SoftMassConstraint, TraceEvent,
};
use nalgebra::DMatrix;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();
}

/// Two measurements `1 ± 1` with the constraint `a + b = 0`.
fn split_problem() -> (FitProblem, ObjectId, ObjectId) {
    let mut problem = FitProblem::new();
    let a = problem
        .add_object(MeasuredObject::new("a").with_measured("x", 1.0, 1.0))
        .unwrap();
    let b = problem
        .add_object(MeasuredObject::new("b").with_measured("x", 1.0, 1.0))
        .unwrap();
    problem
        .add_constraint(
            LinearConstraint::new("a+b", 0.0)
                .with_term(ParamRef::new(a, 0), 1.0)
                .with_term(ParamRef::new(b, 0), 1.0),
        )
        .unwrap();
    (problem, a, b)
}

/// Dijet event, roughly back-to-back, fitted to the Z mass with transverse
/// momentum balance.
fn dijet_problem() -> (FitProblem, Vec<ObjectId>) {
    let mut problem = FitProblem::new();
    let j1 = problem
        .add_object(MeasuredObject::four_vector(
            "j1",
            [48.0, 30.0, 10.0, 30.0],
            [4.0, 2.0, 2.0, 2.0],
        ))
        .unwrap();
    let j2 = problem
        .add_object(MeasuredObject::four_vector(
            "j2",
            [52.0, -28.0, -12.0, -36.0],
            [4.0, 2.0, 2.0, 2.0],
        ))
        .unwrap();
    let jets = vec![j1, j2];
    problem
        .add_constraint(LinearConstraint::component_sum("px", &jets, objects::PX, 0.0))
        .unwrap();
    problem
        .add_constraint(LinearConstraint::component_sum("py", &jets, objects::PY, 0.0))
        .unwrap();
    problem
        .add_constraint(MassConstraint::new("mZ", &jets, 91.19))
        .unwrap();
    (problem, jets)
}

fn assert_symmetric_psd(cov: &DMatrix<f64>) {
    assert_eq!(cov, &cov.transpose());
    let eig = cov.clone().symmetric_eigen();
    let scale = eig.eigenvalues.amax().max(1.0);
    for l in eig.eigenvalues.iter() {
        assert!(*l >= -1e-9 * scale, "negative eigenvalue {l} in\n{cov}");
    }
}

#[test]
fn test_empty_problem() {
    init_tracing();
    let mut problem = FitProblem::new();
    let mut fitter = NewtonFitter::new();
    let prob = fitter.fit(&mut problem);

    assert_eq!(prob, -1.0);
    assert_eq!(fitter.state(), FitState::Converged);
    assert_eq!(fitter.error_code(), 0);
    assert_eq!(fitter.iterations(), 0);
    assert_eq!(fitter.chi2(), 0.0);
    assert_eq!(fitter.dof(), 0);
    assert_eq!(fitter.n_par(), 0);
}

#[test]
fn test_only_fixed_parameters() {
    let mut problem = FitProblem::new();
    problem
        .add_object(MeasuredObject::new("m").with_fixed("mass", 0.105))
        .unwrap();
    let mut fitter = NewtonFitter::new();
    assert_eq!(fitter.fit(&mut problem), -1.0);
    assert_eq!(fitter.iterations(), 0);
    assert_eq!(fitter.state(), FitState::Converged);
}

#[test]
fn test_symmetric_split() {
    init_tracing();
    let (mut problem, a, b) = split_problem();
    let mut fitter = NewtonFitter::new();
    let prob = fitter.fit(&mut problem);

    assert_eq!(fitter.error_code(), 0);
    assert_abs_diff_eq!(problem.object(a).param(0), 0.0, epsilon = 1e-9);
    assert_abs_diff_eq!(problem.object(b).param(0), 0.0, epsilon = 1e-9);
    assert_abs_diff_eq!(fitter.chi2(), 2.0, epsilon = 1e-9);
    assert_eq!(fitter.dof(), 1);
    // upper tail of chi2(1) at 2
    assert_abs_diff_eq!(prob, 0.157_299_207, epsilon = 1e-6);

    let cov = fitter.covariance().expect("covariance after a converged fit");
    let expected = DMatrix::from_row_slice(2, 2, &[0.5, -0.5, -0.5, 0.5]);
    for (c, e) in cov.iter().zip(expected.iter()) {
        assert_abs_diff_eq!(*c, *e, epsilon = 1e-9);
    }
    assert_abs_diff_eq!(problem.object(a).cov(0, 0), 0.5, epsilon = 1e-9);
    assert_abs_diff_eq!(problem.object(b).cov(0, 0), 0.5, epsilon = 1e-9);
}

#[test]
fn test_unequal_errors_weight_the_correction() {
    let mut problem = FitProblem::new();
    let a = problem
        .add_object(MeasuredObject::new("a").with_measured("x", 3.0, 1.0))
        .unwrap();
    let b = problem
        .add_object(MeasuredObject::new("b").with_measured("x", 0.0, 2.0))
        .unwrap();
    problem
        .add_constraint(
            LinearConstraint::new("a=b", 0.0)
                .with_term(ParamRef::new(a, 0), 1.0)
                .with_term(ParamRef::new(b, 0), -1.0),
        )
        .unwrap();
    let mut fitter = NewtonFitter::new();
    fitter.fit(&mut problem);

    // weighted mean (3/1 + 0/4) / (1 + 1/4) = 2.4
    assert_abs_diff_eq!(problem.object(a).param(0), 2.4, epsilon = 1e-9);
    assert_abs_diff_eq!(problem.object(b).param(0), 2.4, epsilon = 1e-9);
    // chi2 = 0.6^2 + (2.4 / 2)^2
    assert_abs_diff_eq!(fitter.chi2(), 1.8, epsilon = 1e-9);
    // variance of the weighted mean: 1 / (1 + 1/4)
    let cov = fitter.covariance().unwrap();
    assert_abs_diff_eq!(cov[(0, 0)], 0.8, epsilon = 1e-9);
    assert_abs_diff_eq!(cov[(0, 1)], 0.8, epsilon = 1e-9);
}

#[test]
fn test_mass_fit_satisfies_constraints() {
    init_tracing();
    let (mut problem, jets) = dijet_problem();
    let mut fitter = NewtonFitter::new();
    fitter.set_debug(2);
    let prob = fitter.fit(&mut problem);

    assert_eq!(fitter.state(), FitState::Converged, "{:?}", fitter.last_error());
    assert_eq!(fitter.n_par(), 8);
    assert_eq!(fitter.n_con(), 3);
    assert_eq!(fitter.dof(), 3);
    assert!(prob > 0.0 && prob <= 1.0, "probability {prob}");
    assert!(fitter.chi2() > 0.0);

    for g in problem.constraint_values() {
        assert!(g.abs() <= 1e-6, "constraint residual {g}");
    }
    let mass = MassConstraint::new("check", &jets, 91.19);
    assert_relative_eq!(mass.current_mass(problem.objects()), 91.19, max_relative = 1e-8);

    let cov = fitter.covariance().unwrap();
    assert_eq!(cov.nrows(), 8);
    assert_symmetric_psd(cov);
    // constraints remove information: fitted errors never exceed measured ones
    for (id, obj) in problem.objects().iter() {
        for i in 0..obj.n_params() {
            assert!(
                obj.cov(i, i) <= obj.error(i).powi(2) + 1e-9,
                "object {}: param {i} variance {} above measurement",
                id.index(),
                obj.cov(i, i)
            );
        }
    }
}

#[test]
fn test_covariance_respects_linear_constraints() {
    let (mut problem, jets) = dijet_problem();
    let mut fitter = NewtonFitter::new();
    fitter.fit(&mut problem);
    let cov = fitter.covariance().unwrap();

    // the fitted total px is exactly zero, so its variance must vanish
    let px: Vec<usize> = jets
        .iter()
        .map(|&id| fitter.global_param_index(id, objects::PX).unwrap())
        .collect();
    let var = cov[(px[0], px[0])] + cov[(px[1], px[1])] + 2.0 * cov[(px[0], px[1])];
    assert_abs_diff_eq!(var, 0.0, epsilon = 1e-9);
}

#[test]
fn test_duplicate_constraint_uses_spectral_path() {
    init_tracing();
    let mut problem = FitProblem::new();
    let a = problem
        .add_object(MeasuredObject::new("a").with_measured("x", 1.0, 1.0))
        .unwrap();
    let b = problem
        .add_object(MeasuredObject::new("b").with_measured("x", 1.0, 1.0))
        .unwrap();
    for name in ["sum", "sum again"] {
        problem
            .add_constraint(
                LinearConstraint::new(name, 0.0)
                    .with_term(ParamRef::new(a, 0), 1.0)
                    .with_term(ParamRef::new(b, 0), 1.0),
            )
            .unwrap();
    }

    let tracer = RecordingTracer::new();
    let history = tracer.history();
    let mut fitter = NewtonFitter::new();
    fitter.set_tracer(Box::new(tracer));
    fitter.fit(&mut problem);

    assert!(fitter.spectral_fallbacks() >= 1);
    let first = history
        .records()
        .into_iter()
        .find(|r| r.event == TraceEvent::Step)
        .unwrap();
    assert!(first.spectral);
    assert!(first.best_merit.unwrap() < first.start_merit.unwrap());

    // the degenerate system still reaches the symmetric solution
    assert_eq!(fitter.state(), FitState::Converged);
    assert_abs_diff_eq!(problem.object(a).param(0), 0.0, epsilon = 1e-9);
    assert_abs_diff_eq!(problem.object(b).param(0), 0.0, epsilon = 1e-9);
    // but the KKT matrix cannot be inverted for the covariance
    assert!(fitter.covariance().is_none());
    assert_eq!(fitter.error_code(), 0);
}

#[test]
fn test_repeat_fits_are_identical() {
    let (mut problem, _) = dijet_problem();
    let mut fitter = NewtonFitter::new();
    let p1 = fitter.fit(&mut problem);
    let (chi2, iterations) = (fitter.chi2(), fitter.iterations());

    problem.reset();
    let p2 = fitter.fit(&mut problem);
    assert_eq!(p1, p2);
    assert_eq!(chi2, fitter.chi2());
    assert_eq!(iterations, fitter.iterations());

    // a fresh fitter on a fresh problem agrees as well
    let (mut other, _) = dijet_problem();
    let mut fresh = NewtonFitter::new();
    assert_eq!(fresh.fit(&mut other), p1);
    assert_eq!(fresh.iterations(), iterations);
}

#[test]
fn test_soft_constraint_only() {
    let mut problem = FitProblem::new();
    let a = problem
        .add_object(MeasuredObject::new("a").with_measured("x", 1.0, 1.0))
        .unwrap();
    let b = problem
        .add_object(MeasuredObject::new("b").with_measured("x", 1.0, 1.0))
        .unwrap();
    problem
        .add_soft_constraint(
            SoftLinearConstraint::new("a+b", 0.0, 1.0)
                .with_term(ParamRef::new(a, 0), 1.0)
                .with_term(ParamRef::new(b, 0), 1.0),
        )
        .unwrap();
    let mut fitter = NewtonFitter::new();
    let prob = fitter.fit(&mut problem);

    // minimum of (a-1)^2 + (b-1)^2 + (a+b)^2 at a = b = 1/3
    assert_eq!(fitter.n_con(), 0);
    assert_eq!(fitter.n_soft(), 1);
    assert_eq!(fitter.dof(), 1);
    assert_abs_diff_eq!(problem.object(a).param(0), 1.0 / 3.0, epsilon = 1e-9);
    assert_abs_diff_eq!(fitter.chi2(), 4.0 / 3.0, epsilon = 1e-9);
    assert!(prob > 0.0 && prob < 1.0);
}

#[test]
fn test_soft_mass_pulls_towards_resonance() {
    let (mut hard, jets) = dijet_problem();
    let mut fitter = NewtonFitter::new();
    fitter.fit(&mut hard);
    let chi2_hard = fitter.chi2();

    // same event, but the mass constraint replaced by a Breit-Wigner-ish width
    let mut problem = FitProblem::new();
    let mut ids = Vec::new();
    for &id in &jets {
        let obj = hard.object(id);
        let p = [0, 1, 2, 3].map(|i| obj.measured_param(i));
        let e = [0, 1, 2, 3].map(|i| obj.error(i));
        ids.push(problem.add_object(MeasuredObject::four_vector(obj.name(), p, e)).unwrap());
    }
    problem
        .add_constraint(LinearConstraint::component_sum("px", &ids, objects::PX, 0.0))
        .unwrap();
    problem
        .add_constraint(LinearConstraint::component_sum("py", &ids, objects::PY, 0.0))
        .unwrap();
    problem
        .add_soft_constraint(SoftMassConstraint::new("mZ", &ids, 91.19, 2.5))
        .unwrap();
    fitter.fit(&mut problem);

    assert_eq!(fitter.state(), FitState::Converged);
    assert_eq!(fitter.dof(), 3);
    let mass = MassConstraint::new("m", &ids, 91.19).current_mass(problem.objects());
    // between the measured mass (about 99.8) and the resonance
    assert!(mass > 91.19 && mass < 99.8, "mass {mass}");
    // a soft constraint costs less than the hard one
    assert!(fitter.chi2() < chi2_hard);
}

#[test]
fn test_unmeasured_neutrino() {
    init_tracing();
    let mut problem = FitProblem::new();
    let lep = problem
        .add_object(
            MeasuredObject::new("lepton")
                .with_measured("px", 10.0, 1.0)
                .with_measured("py", -5.0, 1.0),
        )
        .unwrap();
    let nu = problem
        .add_object(
            MeasuredObject::new("neutrino")
                .with_unmeasured("px", 0.0, 10.0)
                .with_unmeasured("py", 0.0, 10.0),
        )
        .unwrap();
    for local in 0..2 {
        problem
            .add_constraint(
                LinearConstraint::new(format!("p{local} balance"), 0.0)
                    .with_term(ParamRef::new(lep, local), 1.0)
                    .with_term(ParamRef::new(nu, local), 1.0),
            )
            .unwrap();
    }
    problem
        .add_constraint(
            LinearConstraint::new("lepton px+py", 4.0)
                .with_term(ParamRef::new(lep, 0), 1.0)
                .with_term(ParamRef::new(lep, 1), 1.0),
        )
        .unwrap();

    let mut fitter = NewtonFitter::new();
    let prob = fitter.fit(&mut problem);

    assert_eq!(fitter.n_unmeasured(), 2);
    assert_eq!(fitter.dof(), 1);
    assert_eq!(fitter.state(), FitState::Converged);
    assert!(prob > 0.0);
    assert_abs_diff_eq!(problem.object(lep).param(0), 9.5, epsilon = 1e-9);
    assert_abs_diff_eq!(problem.object(lep).param(1), -5.5, epsilon = 1e-9);
    assert_abs_diff_eq!(problem.object(nu).param(0), -9.5, epsilon = 1e-9);
    assert_abs_diff_eq!(problem.object(nu).param(1), 5.5, epsilon = 1e-9);
    assert_abs_diff_eq!(fitter.chi2(), 0.5, epsilon = 1e-9);

    // the neutrino inherits the lepton's fitted uncertainty
    let obj = problem.object(nu);
    assert_abs_diff_eq!(obj.cov(0, 0), 0.5, epsilon = 1e-9);
    assert_abs_diff_eq!(obj.cov(0, 1), -0.5, epsilon = 1e-9);
}

#[test]
fn test_underdetermined_still_runs() {
    let mut problem = FitProblem::new();
    let nu = problem
        .add_object(
            MeasuredObject::new("nu")
                .with_unmeasured("px", 0.0, 1.0)
                .with_unmeasured("py", 0.0, 1.0),
        )
        .unwrap();
    problem
        .add_constraint(LinearConstraint::new("px", 3.0).with_term(ParamRef::new(nu, 0), 1.0))
        .unwrap();
    let mut fitter = NewtonFitter::new();
    let prob = fitter.fit(&mut problem);

    assert_eq!(fitter.dof(), -1);
    assert_eq!(prob, -1.0);
    // the singular direction is dropped, the constrained one is solved
    assert_eq!(fitter.state(), FitState::Converged);
    assert_eq!(fitter.error_code(), 0);
    assert_eq!(fitter.iterations(), 1);
    assert_eq!(fitter.stats().spectral_fallbacks, 1);
    assert_abs_diff_eq!(problem.object(nu).param(0), 3.0, epsilon = 1e-9);
    assert_abs_diff_eq!(problem.object(nu).param(1), 0.0, epsilon = 1e-12);
}

#[test]
fn test_tracer_sees_every_iteration() {
    let (mut problem, _) = dijet_problem();
    let tracer = RecordingTracer::new().with_logging(true);
    let history = tracer.history();
    let mut fitter = NewtonFitter::new();
    fitter.set_tracer(Box::new(tracer));
    fitter.fit(&mut problem);

    let records = history.records();
    assert_eq!(records.first().unwrap().event, TraceEvent::Initialize);
    assert_eq!(records.last().unwrap().event, TraceEvent::Finish);
    let steps: Vec<_> = records.iter().filter(|r| r.event == TraceEvent::Step).collect();
    assert_eq!(steps.len(), fitter.iterations());
    for step in steps {
        assert!(step.best_merit.unwrap() <= step.start_merit.unwrap());
    }
    assert_eq!(records.last().unwrap().state, FitState::Converged);
    assert!(fitter.take_tracer().is_some());
}

#[test]
fn test_constraint_error_and_merit() {
    let (problem, jets) = dijet_problem();
    let px = LinearConstraint::component_sum("px", &jets, objects::PX, 0.0);
    // sqrt(2^2 + 2^2)
    assert_abs_diff_eq!(px.error(problem.objects()), 8f64.sqrt(), epsilon = 1e-12);

    let fitter = NewtonFitter::new();
    let g: f64 = problem.constraint_values().iter().map(|g| g.abs()).sum();
    assert_abs_diff_eq!(fitter.merit_value(&problem, 0.5), 0.5 * g, epsilon = 1e-12);
}
