#![allow(non_snake_case)]
//! Kernel-polynomial (Chebyshev) spectral moments of large sparse real-space
//! tight-binding Hamiltonians.
//!
//! Given a Hamiltonian rescaled to the spectral interval (-1, 1), the engine
//! estimates traces of the form
//!
//! mu(n1..nk) = Tr[ v^{a1} T_n1(H) v^{a2} T_n2(H) ... v^{ak} T_nk(H) ]
//!
//! with T_n the Chebyshev polynomials of the first kind and v^a the nested
//! commutators of position with H, averaging quadratic forms over random
//! vectors and disorder realizations. The lattice is domain-decomposed over
//! a fixed shared-memory thread grid; each subdomain carries ghost layers
//! refreshed by a two-barrier halo exchange, and the sparse applications run
//! tile by tile so the hopping tables stay hot in cache.
//!
//! The crate computes:
//!
//! - moment tensors of rank 1, 2 and 3 (density of states, Kubo
//!   conductivities and their second-order cousins), with the final
//!   symmetrization that exploits Hermiticity and index permutations;
//! - a "single-shot" zero-temperature DC response that sums the Chebyshev
//!   series against analytic Green's-function coefficients at fixed
//!   energies.
//!
//! Disorder enters as Anderson on-site terms, structural impurity patterns
//! anchored at random cells, vacancies and a uniform-field Peierls phase.
//! The front end that builds and rescales the model, and the tool that
//! convolves the raw moments into named response functions, live outside
//! this crate; the interface is the self-describing job container in
//! [`config`].

pub mod config;
pub mod dense;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod generics;
pub mod hamiltonian;
pub mod lattice;
pub mod moments;
pub mod parallel;
pub mod singleshot;
pub mod vector;

pub use config::{parse_direction, Container, JobFile, Quantity, RunPlan};
pub use error::{KpmError, Result};
pub use generics::Scalar;
pub use hamiltonian::{Hamiltonian, HamiltonianSpec};
pub use lattice::{Boundary, Domain, Lattice};
pub use moments::Worker;
pub use parallel::{Shared, MEMORY};
pub use vector::KpmVector;
