//! Shared-memory fork-join scaffolding.
//!
//! A job spawns one worker per thread-grid cell for the lifetime of a
//! quantity. The only writable shared objects are the halo staging slots,
//! the global moment accumulator, the small block accumulator of the 3D
//! driver and the output snapshot; all of them are guarded by the
//! barrier-plus-lock discipline: a thread only takes a lock inside a phase
//! delimited by barriers, so the locks never contend on the hot path.

use crate::generics::Scalar;
use crate::lattice::Lattice;
use ndarray::ArrayD;
use num_complex::Complex64;
use std::sync::{Barrier, Mutex, RwLock};

/// Block width of the 2D/3D block-dot-product optimization.
pub const MEMORY: usize = 10;

/// State shared by every worker of one quantity.
pub struct Shared<S: Scalar> {
    pub barrier: Barrier,
    /// One staging slot per thread, holding the two published faces of the
    /// axis currently being exchanged: `[low face | high face]`.
    pub staging: Vec<RwLock<Vec<S>>>,
    /// The global moment array, reduced into between disorder iterations.
    pub accumulator: Mutex<Vec<S>>,
    /// The shared MEMORY x MEMORY partial block of the 3D driver.
    pub block: Mutex<Vec<S>>,
    /// Latest reduced snapshot, stored by the master thread at each flush.
    pub output: Mutex<Option<ArrayD<Complex64>>>,
}

impl<S: Scalar> Shared<S> {
    pub fn new(lattice: &Lattice, moment_len: usize) -> Shared<S> {
        let n = lattice.n_threads();
        let slot = 2 * lattice.max_face_volume();
        Shared {
            barrier: Barrier::new(n),
            staging: (0..n).map(|_| RwLock::new(vec![S::zero(); slot])).collect(),
            accumulator: Mutex::new(vec![S::zero(); moment_len]),
            block: Mutex::new(vec![S::zero(); MEMORY * MEMORY]),
            output: Mutex::new(None),
        }
    }

    /// Add a thread-local partial array into the global accumulator.
    pub fn reduce(&self, local: &[S]) {
        let mut acc = self.accumulator.lock().expect("accumulator poisoned");
        for (g, l) in acc.iter_mut().zip(local) {
            *g += *l;
        }
    }

    /// Zero the global accumulator (master thread, between realizations).
    pub fn reset_accumulator(&self) {
        let mut acc = self.accumulator.lock().expect("accumulator poisoned");
        for g in acc.iter_mut() {
            *g = S::zero();
        }
    }
}

/// Fork-join over the thread grid: run `f(thread_id)` on every worker and
/// collect the results in thread-id order. A worker panic aborts the job,
/// matching the all-or-nothing execution model.
pub fn run_workers<T, F>(n_threads: usize, f: F) -> Vec<T>
where
    F: Fn(usize) -> T + Sync,
    T: Send,
{
    std::thread::scope(|s| {
        let mut handles = Vec::with_capacity(n_threads);
        for id in 0..n_threads {
            let f = &f;
            handles.push(s.spawn(move || f(id)));
        }
        handles
            .into_iter()
            .map(|h| h.join().expect("worker thread panicked"))
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lattice::Boundary;
    use ndarray::Array2;

    #[test]
    fn workers_run_in_id_order() {
        let ids = run_workers(4, |id| id * id);
        assert_eq!(ids, vec![0, 1, 4, 9]);
    }

    #[test]
    fn reduce_sums_thread_partials() {
        let l = Lattice::new(
            1,
            &[16],
            1,
            &[4],
            2,
            4,
            &[Boundary::Periodic],
            Array2::zeros((1, 1)),
        )
        .unwrap();
        let shared: Shared<f64> = Shared::new(&l, 3);
        run_workers(4, |id| shared.reduce(&[id as f64, 1.0, 0.0]));
        let acc = shared.accumulator.lock().unwrap();
        assert_eq!(*acc, vec![6.0, 4.0, 0.0]);
    }
}
