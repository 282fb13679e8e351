//! The job container and its validation.
//!
//! The front end hands the engine a fully prepared description in one
//! self-describing document: scalar selection, lattice geometry, the
//! Hamiltonian subtree and one node per quantity under `Calculation`. The
//! engine writes each quantity's moment array back into the same document
//! under `/Calculation/<name>/<dataset>` and saves it in place, so a
//! partially finished job still carries its running averages.
//!
//! Direction strings follow the factor syntax: factors separated by commas,
//! each factor a string over 'x', 'y', 'z', the empty factor meaning the
//! identity. `"xx,y"` therefore is a rank-2 quantity with a two-axis
//! velocity on the left and a single-axis velocity on the right.

use crate::error::{KpmError, Result};
use crate::hamiltonian::{AndersonSpec, HamiltonianSpec, PatternSpec, VacancySpec};
use crate::lattice::Boundary;
use ndarray::ArrayD;
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

fn default_one() -> usize {
    1
}
fn default_nghosts() -> usize {
    2
}
fn default_tile() -> usize {
    4
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LatticeInput {
    pub extents: Vec<usize>,
    #[serde(default = "default_one")]
    pub orbitals: usize,
    #[serde(default)]
    pub threads: Vec<usize>,
    #[serde(default = "default_nghosts")]
    pub nghosts: usize,
    #[serde(default = "default_tile")]
    pub tile: usize,
    #[serde(default)]
    pub boundaries: Vec<Boundary>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HamiltonianInput {
    /// Integer flux quanta through the global cross-section; expands into a
    /// Landau-gauge vector potential.
    #[serde(rename = "MagneticField", default)]
    pub magnetic_field: i64,
    /// Explicit vector potential matrix, row-major dim x dim. Added on top
    /// of the Landau gauge term when both are present.
    #[serde(rename = "VectorPotential", default)]
    pub vector_potential: Option<Vec<Vec<f64>>>,
    #[serde(rename = "Hoppings")]
    pub hoppings: Vec<crate::hamiltonian::HoppingSpec>,
    #[serde(rename = "Anderson", default)]
    pub anderson: Vec<AndersonSpec>,
    #[serde(rename = "Patterns", default)]
    pub patterns: Vec<PatternSpec>,
    #[serde(rename = "Vacancies", default)]
    pub vacancies: VacancySpec,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuantityInput {
    #[serde(rename = "Direction", default)]
    pub direction: String,
    #[serde(rename = "NumMoments")]
    pub num_moments: Vec<usize>,
    #[serde(rename = "NumRandoms")]
    pub num_randoms: usize,
    #[serde(rename = "NumDisorder", default = "default_one")]
    pub num_disorder: usize,
    #[serde(rename = "Energy", default)]
    pub energy: Option<Vec<f64>>,
    #[serde(rename = "Gamma", default)]
    pub gamma: Option<f64>,
    /// Accepted for the post-processing stage; the core does not use it.
    #[serde(rename = "Temperature", default)]
    pub temperature: Option<f64>,
    #[serde(rename = "NumPoints", default)]
    pub num_points: Option<usize>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobFile {
    #[serde(rename = "IS_COMPLEX")]
    pub is_complex: usize,
    #[serde(rename = "PRECISION")]
    pub precision: usize,
    #[serde(rename = "DIM")]
    pub dim: usize,
    #[serde(rename = "EnergyScale")]
    pub energy_scale: f64,
    #[serde(rename = "Seed", default)]
    pub seed: Option<u64>,
    #[serde(rename = "Lattice")]
    pub lattice: LatticeInput,
    #[serde(rename = "Hamiltonian")]
    pub hamiltonian: HamiltonianInput,
    #[serde(rename = "Calculation")]
    pub calculation: BTreeMap<String, QuantityInput>,
}

/// Parse a direction string into per-factor axis lists.
pub fn parse_direction(s: &str, dim: usize) -> Result<Vec<Vec<usize>>> {
    let mut factors = Vec::new();
    for part in s.split(',') {
        let mut axes = Vec::new();
        for ch in part.chars() {
            let a = match ch {
                'x' => 0,
                'y' => 1,
                'z' => 2,
                _ => return Err(KpmError::InvalidDirection(s.into())),
            };
            if a >= dim {
                return Err(KpmError::DirectionOutOfRange { axis: a, dim });
            }
            axes.push(a);
        }
        factors.push(axes);
    }
    Ok(factors)
}

/// A validated quantity, ready for the drivers.
#[derive(Clone, Debug)]
pub struct Quantity {
    pub name: String,
    pub indices: Vec<Vec<usize>>,
    pub moments: Vec<usize>,
    pub randoms: usize,
    pub disorder: usize,
    pub kind: QuantityKind,
}

#[derive(Clone, Debug)]
pub enum QuantityKind {
    Moments,
    SingleShot { energies: Vec<f64>, gamma: f64 },
}

impl Quantity {
    /// Length of the flat array this quantity accumulates into.
    pub fn accumulator_len(&self) -> usize {
        match &self.kind {
            QuantityKind::Moments => self.moments.iter().product(),
            QuantityKind::SingleShot { energies, .. } => energies.len(),
        }
    }

    /// Dataset name of the output inside the quantity's calculation node.
    pub fn dataset(&self) -> &'static str {
        match self.kind {
            QuantityKind::Moments => "MU",
            QuantityKind::SingleShot { .. } => "SingleShot",
        }
    }
}

/// The validated run plan extracted from a job file.
#[derive(Clone, Debug)]
pub struct RunPlan {
    pub is_complex: bool,
    pub precision: usize,
    pub dim: usize,
    pub energy_scale: f64,
    pub seed: u64,
    pub lattice: LatticeInput,
    pub vect_pot: ndarray::Array2<f64>,
    pub hamiltonian: HamiltonianSpec,
    pub quantities: Vec<Quantity>,
}

pub fn validate(job: &JobFile) -> Result<RunPlan> {
    if !(1..=3).contains(&job.dim) {
        return Err(KpmError::InvalidDimension(job.dim));
    }
    if job.precision > 1 {
        return Err(KpmError::UnsupportedPrecision(job.precision));
    }
    let is_complex = job.is_complex != 0;

    // The Peierls substitution needs a complex amplitude.
    let mut vect_pot = ndarray::Array2::<f64>::zeros((job.dim, job.dim));
    if let Some(rows) = &job.hamiltonian.vector_potential {
        for (a, row) in rows.iter().enumerate().take(job.dim) {
            for (b, &v) in row.iter().enumerate().take(job.dim) {
                vect_pot[[a, b]] = v;
            }
        }
    }
    if job.hamiltonian.magnetic_field != 0 {
        if job.dim < 2 {
            return Err(KpmError::InvalidDimension(job.dim));
        }
        let cells = (job.lattice.extents[0] * job.lattice.extents[1]) as f64;
        vect_pot[[0, 1]] +=
            2.0 * std::f64::consts::PI * job.hamiltonian.magnetic_field as f64 / cells;
    }
    if !is_complex && vect_pot.iter().any(|&a| a != 0.0) {
        return Err(KpmError::MagneticFieldNeedsComplex);
    }

    let hamiltonian = HamiltonianSpec {
        hoppings: job.hamiltonian.hoppings.clone(),
        anderson: job.hamiltonian.anderson.clone(),
        patterns: job.hamiltonian.patterns.clone(),
        vacancies: job.hamiltonian.vacancies.clone(),
    };

    let mut quantities = Vec::new();
    for (name, q) in &job.calculation {
        let indices = parse_direction(&q.direction, job.dim)?;
        let singleshot = q.energy.is_some() || q.gamma.is_some();
        if singleshot {
            let (Some(energies), Some(gamma)) = (q.energy.clone(), q.gamma) else {
                return Err(KpmError::MissingSingleShotData(name.clone()));
            };
            if indices.len() != 2 || indices.iter().any(Vec::is_empty) {
                return Err(KpmError::InvalidDirection(q.direction.clone()));
            }
            // The series is summed in pairs, so the moment count rounds
            // down to even.
            let n = q.num_moments.first().copied().unwrap_or(0);
            if n < 2 {
                return Err(KpmError::OddMomentCount(n));
            }
            quantities.push(Quantity {
                name: name.clone(),
                indices,
                moments: vec![2 * (n / 2)],
                randoms: q.num_randoms,
                disorder: q.num_disorder,
                kind: QuantityKind::SingleShot { energies, gamma },
            });
            continue;
        }

        if indices.len() != q.num_moments.len() {
            return Err(KpmError::MomentRankMismatch {
                name: name.clone(),
                moments: q.num_moments.len(),
                factors: indices.len(),
            });
        }
        if indices.len() > 3 {
            return Err(KpmError::UnsupportedRank(name.clone(), indices.len()));
        }
        for &n in &q.num_moments {
            if n == 0 || n % 2 != 0 {
                return Err(KpmError::OddMomentCount(n));
            }
        }
        quantities.push(Quantity {
            name: name.clone(),
            indices,
            moments: q.num_moments.clone(),
            randoms: q.num_randoms,
            disorder: q.num_disorder,
            kind: QuantityKind::Moments,
        });
    }

    Ok(RunPlan {
        is_complex,
        precision: job.precision,
        dim: job.dim,
        energy_scale: job.energy_scale,
        seed: job.seed.unwrap_or(0x6b706d_73656564),
        lattice: job.lattice.clone(),
        vect_pot,
        hamiltonian,
        quantities,
    })
}

// ---------------------------------------------------------------------------
// Container I/O
// ---------------------------------------------------------------------------

/// A complex array in its on-disk form.
#[derive(Serialize, Deserialize)]
struct StoredArray {
    shape: Vec<usize>,
    re: Vec<f64>,
    im: Vec<f64>,
}

/// The job document, kept in memory and written back in place after each
/// flush.
pub struct Container {
    pub path: PathBuf,
    pub value: serde_json::Value,
    pub job: JobFile,
}

impl Container {
    pub fn load(path: &Path) -> Result<Container> {
        let text = std::fs::read_to_string(path)?;
        let value: serde_json::Value =
            serde_json::from_str(&text).map_err(|e| KpmError::ContainerParse {
                file: path.display().to_string(),
                message: e.to_string(),
            })?;
        let job: JobFile =
            serde_json::from_value(value.clone()).map_err(|e| KpmError::ContainerParse {
                file: path.display().to_string(),
                message: e.to_string(),
            })?;
        Ok(Container {
            path: path.to_path_buf(),
            value,
            job,
        })
    }

    /// Write a moment array under `/Calculation/<quantity>/<dataset>` and
    /// save the document.
    pub fn store(&mut self, quantity: &str, dataset: &str, arr: &ArrayD<Complex64>) -> Result<()> {
        let stored = StoredArray {
            shape: arr.shape().to_vec(),
            re: arr.iter().map(|z| z.re).collect(),
            im: arr.iter().map(|z| z.im).collect(),
        };
        let node = self.value["Calculation"][quantity]
            .as_object_mut()
            .ok_or_else(|| KpmError::MissingDataset(format!("/Calculation/{quantity}")))?;
        node.insert(
            dataset.to_string(),
            serde_json::to_value(&stored).expect("array serialization cannot fail"),
        );
        std::fs::write(&self.path, serde_json::to_string_pretty(&self.value)?.as_bytes())?;
        Ok(())
    }

    /// Read back a stored array, for tests and the post-processing stage.
    pub fn load_array(&self, quantity: &str, dataset: &str) -> Result<ArrayD<Complex64>> {
        let node = &self.value["Calculation"][quantity][dataset];
        let stored: StoredArray =
            serde_json::from_value(node.clone()).map_err(|_| {
                KpmError::MissingDataset(format!("/Calculation/{quantity}/{dataset}"))
            })?;
        let data: Vec<Complex64> = stored
            .re
            .iter()
            .zip(&stored.im)
            .map(|(&re, &im)| Complex64::new(re, im))
            .collect();
        ArrayD::from_shape_vec(stored.shape.clone(), data).map_err(|e| {
            KpmError::ContainerParse {
                file: self.path.display().to_string(),
                message: e.to_string(),
            }
        })
    }
}

impl From<serde_json::Error> for KpmError {
    fn from(e: serde_json::Error) -> Self {
        KpmError::ContainerParse {
            file: String::new(),
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_factors_parse() {
        assert_eq!(parse_direction("", 2).unwrap(), vec![Vec::<usize>::new()]);
        assert_eq!(parse_direction("x", 2).unwrap(), vec![vec![0]]);
        assert_eq!(
            parse_direction("xx,y", 2).unwrap(),
            vec![vec![0, 0], vec![1]]
        );
        assert_eq!(
            parse_direction("x,y,z", 3).unwrap(),
            vec![vec![0], vec![1], vec![2]]
        );
        assert_eq!(
            parse_direction(",", 2).unwrap(),
            vec![Vec::<usize>::new(), Vec::new()]
        );
    }

    #[test]
    fn bad_direction_characters_abort() {
        assert!(matches!(
            parse_direction("xq", 2),
            Err(KpmError::InvalidDirection(_))
        ));
        assert!(matches!(
            parse_direction("z", 2),
            Err(KpmError::DirectionOutOfRange { axis: 2, dim: 2 })
        ));
    }

    fn minimal_job() -> JobFile {
        serde_json::from_value(serde_json::json!({
            "IS_COMPLEX": 1,
            "PRECISION": 1,
            "DIM": 1,
            "EnergyScale": 2.0,
            "Lattice": { "extents": [16] },
            "Hamiltonian": {
                "Hoppings": [
                    { "from_orb": 0, "to_orb": 0, "delta": [1, 0, 0], "re": 0.5 },
                    { "from_orb": 0, "to_orb": 0, "delta": [-1, 0, 0], "re": 0.5 }
                ]
            },
            "Calculation": {
                "dos": { "Direction": "", "NumMoments": [32], "NumRandoms": 4 }
            }
        }))
        .unwrap()
    }

    #[test]
    fn minimal_job_validates() {
        let plan = validate(&minimal_job()).unwrap();
        assert_eq!(plan.quantities.len(), 1);
        assert_eq!(plan.quantities[0].indices, vec![Vec::<usize>::new()]);
        assert_eq!(plan.quantities[0].accumulator_len(), 32);
    }

    #[test]
    fn odd_moment_counts_are_rejected() {
        let mut job = minimal_job();
        job.calculation.get_mut("dos").unwrap().num_moments = vec![33];
        assert!(matches!(
            validate(&job),
            Err(KpmError::OddMomentCount(33))
        ));
    }

    #[test]
    fn magnetic_field_with_real_amplitudes_is_rejected() {
        let mut job = minimal_job();
        job.is_complex = 0;
        job.dim = 2;
        job.lattice.extents = vec![16, 16];
        job.hamiltonian.magnetic_field = 1;
        assert!(matches!(
            validate(&job),
            Err(KpmError::MagneticFieldNeedsComplex)
        ));
    }

    #[test]
    fn container_roundtrips_arrays() {
        let dir = std::env::temp_dir().join("rustkpm-config-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("job.json");
        std::fs::write(
            &path,
            serde_json::to_string_pretty(&minimal_job()).unwrap(),
        )
        .unwrap();
        let mut c = Container::load(&path).unwrap();
        let arr = ArrayD::from_shape_vec(
            vec![2, 2],
            vec![
                Complex64::new(1.0, 0.0),
                Complex64::new(0.0, -1.0),
                Complex64::new(0.5, 0.5),
                Complex64::new(-2.0, 0.0),
            ],
        )
        .unwrap();
        c.store("dos", "MU", &arr).unwrap();
        let back = Container::load(&path).unwrap().load_array("dos", "MU").unwrap();
        assert_eq!(back, arr);
    }
}
