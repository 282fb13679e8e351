//! Job orchestration: scalar-type dispatch, thread-grid fork-join and the
//! master-side write-back of each quantity's moment array.

use crate::config::{validate, Container, Quantity, QuantityKind, RunPlan};
use crate::error::{KpmError, Result};
use crate::generics::Scalar;
use crate::hamiltonian::Hamiltonian;
use crate::lattice::{Boundary, Domain, Lattice};
use crate::moments::{self, Worker};
use crate::parallel::{run_workers, Shared};
use crate::singleshot::singleshot;
use crate::vector::KpmVector;
use ndarray::ArrayD;
use num_complex::{Complex32, Complex64};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::path::Path;
use std::sync::Mutex;
use std::time::Instant;

/// Run every quantity of a job container and write the results back in
/// place. This is what the binary calls.
pub fn run_file(path: &Path) -> Result<()> {
    let container = Container::load(path)?;
    let plan = validate(&container.job)?;
    let container = Mutex::new(container);
    match (plan.is_complex, plan.precision) {
        (false, 0) => run_typed::<f32>(&plan, &container),
        (false, _) => run_typed::<f64>(&plan, &container),
        (true, 0) => run_typed::<Complex32>(&plan, &container),
        (true, _) => run_typed::<Complex64>(&plan, &container),
    }
}

/// Run a validated plan and return the final array of every quantity, in
/// plan order. Used directly by tests that have no file to write back to.
pub fn run_plan<S: Scalar>(plan: &RunPlan) -> Result<Vec<ArrayD<Complex64>>> {
    let lattice = build_lattice(plan)?;
    let mut results = Vec::new();
    for q in &plan.quantities {
        results.push(run_quantity::<S>(plan, &lattice, q, None)?);
    }
    Ok(results)
}

fn run_typed<S: Scalar>(plan: &RunPlan, container: &Mutex<Container>) -> Result<()> {
    let lattice = build_lattice(plan)?;
    log_iteration_estimate::<S>(plan, &lattice);

    for q in &plan.quantities {
        tracing::info!(
            quantity = %q.name,
            rank = q.moments.len(),
            randoms = q.randoms,
            disorder = q.disorder,
            "starting quantity"
        );
        let started = Instant::now();
        let name = q.name.clone();
        let dataset = q.dataset();
        let sink = move |arr: &ArrayD<Complex64>| {
            let mut c = container.lock().expect("container poisoned");
            if let Err(e) = c.store(&name, dataset, arr) {
                tracing::warn!(error = %e, "could not flush intermediate result");
            }
        };
        run_quantity::<S>(plan, &lattice, q, Some(&sink))?;
        tracing::info!(
            quantity = %q.name,
            seconds = started.elapsed().as_secs_f64(),
            "finished quantity"
        );
    }
    Ok(())
}

fn run_quantity<S: Scalar>(
    plan: &RunPlan,
    lattice: &Lattice,
    q: &Quantity,
    sink: Option<&(dyn Fn(&ArrayD<Complex64>) + Sync)>,
) -> Result<ArrayD<Complex64>> {
    let shared: Shared<S> = Shared::new(lattice, q.accumulator_len());
    let worker_results = run_workers(lattice.n_threads(), |id| -> Result<()> {
        let domain = Domain::new(lattice.clone(), id);
        let ham = Hamiltonian::build(&plan.hamiltonian, &domain)?;
        let rng = ChaCha8Rng::seed_from_u64(
            plan.seed ^ (id as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15),
        );
        let mut w = Worker {
            domain,
            ham,
            shared: &shared,
            rng,
        };
        match &q.kind {
            QuantityKind::Moments => moments::accumulate(
                &mut w, &q.indices, &q.moments, q.randoms, q.disorder, sink,
            ),
            QuantityKind::SingleShot { energies, gamma } => singleshot(
                &mut w,
                &q.indices[0],
                &q.indices[1],
                q.moments[0],
                energies,
                *gamma,
                q.randoms,
                q.disorder,
                plan.energy_scale,
                sink,
            ),
        }
    });
    for r in worker_results {
        r?;
    }
    let result = shared
        .output
        .lock()
        .expect("output poisoned")
        .take()
        .ok_or_else(|| KpmError::MissingDataset(format!("/Calculation/{}", q.name)));
    result
}

fn build_lattice(plan: &RunPlan) -> Result<Lattice> {
    let threads = if plan.lattice.threads.is_empty() {
        vec![1; plan.dim]
    } else {
        plan.lattice.threads.clone()
    };
    let boundaries = if plan.lattice.boundaries.is_empty() {
        vec![Boundary::Periodic; plan.dim]
    } else {
        plan.lattice.boundaries.clone()
    };
    Lattice::new(
        plan.dim,
        &plan.lattice.extents,
        plan.lattice.orbitals,
        &threads,
        plan.lattice.nghosts,
        plan.lattice.tile,
        &boundaries,
        plan.vect_pot.clone(),
    )
}

/// Log the wall time of one Chebyshev iteration on a single subdomain, so
/// the cost of a long job shows up before the job does.
fn log_iteration_estimate<S: Scalar>(plan: &RunPlan, lattice: &Lattice) {
    let single = Lattice::new(
        lattice.dim,
        &lattice.bulk[..lattice.dim],
        lattice.orbitals,
        &vec![1; lattice.dim],
        lattice.nghosts,
        lattice.tile,
        &lattice.boundary[..lattice.dim],
        lattice.vect_pot.clone(),
    );
    let Ok(single) = single else { return };
    let domain = Domain::new(single, 0);
    let Ok(mut ham) = Hamiltonian::<S>::build(&plan.hamiltonian, &domain) else {
        return;
    };
    let mut rng = ChaCha8Rng::seed_from_u64(plan.seed);
    ham.generate_disorder(&domain, &mut rng);
    let shared: Shared<S> = Shared::new(&domain.lattice, 1);
    let Ok(mut phi) = KpmVector::<S>::new(2, &domain) else {
        return;
    };
    let Ok(mut phi0) = KpmVector::<S>::new(1, &domain) else {
        return;
    };
    phi0.init_random(&mut rng, &ham, &domain);
    phi.set_index(0);
    phi.copy_slot(0, &phi0, 0);
    phi.exchange(&domain, &shared);
    phi.multiply(0, &ham, &domain, &shared);

    let reps = 10;
    let t0 = Instant::now();
    for _ in 0..reps {
        phi.multiply(1, &ham, &domain, &shared);
    }
    tracing::info!(
        seconds = t0.elapsed().as_secs_f64() / reps as f64,
        "single-subdomain Chebyshev iteration"
    );
}
