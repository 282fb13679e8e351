//! Integer lattice geometry and coordinate arithmetic.
//!
//! The global lattice is a regular D-dimensional grid (D in {1,2,3}) of
//! cells with `orbitals` orbitals per cell, split across a static thread grid.
//! Each thread owns a rectangular subdomain padded with `nghosts` ghost layers
//! on every face; ghost cells mirror the neighbouring subdomain after a halo
//! exchange so cross-boundary hoppings apply without branching.
//!
//! Site-orbital amplitudes are addressed by a single linear index packing
//! (x0, x1, x2, orbital) row-major with the orbital slowest. The bulk is
//! traversed in tiles of side `tile` to keep the hopping table hot in cache.

use crate::error::{KpmError, Result};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Boundary condition along one axis of the global lattice.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Boundary {
    Periodic,
    Open,
}

/// Shared lattice geometry, identical for every thread.
#[derive(Clone, Debug)]
pub struct Lattice {
    /// - Real-space dimension, 1..=3. Unused axes have extent 1.
    pub dim: usize,
    /// - Global extent per axis.
    pub lt: [usize; 3],
    /// - Per-thread extent per axis, including ghosts on both faces.
    pub ld: [usize; 3],
    /// - Per-thread bulk extent per axis (`ld - 2*nghosts` on real axes).
    pub bulk: [usize; 3],
    /// - Orbitals per lattice cell.
    pub orbitals: usize,
    /// - Ghost layer width on each face of each real axis.
    pub nghosts: usize,
    /// - Tile side; divides the bulk extent of every real axis.
    pub tile: usize,
    /// - Thread grid per axis.
    pub threads: [usize; 3],
    /// - Boundary condition per axis.
    pub boundary: [Boundary; 3],
    /// - Vector potential A; a hop by delta from global cell g picks up the
    ///   phase delta . A . g.
    pub vect_pot: Array2<f64>,
    /// - Linear strides [1, ld0, ld0*ld1, nd]; the last entry is the orbital
    ///   stride.
    pub basis: [usize; 4],
    /// - Cells per orbital in the local array (ghosts included).
    pub nd: usize,
    /// - Local amplitudes, `nd * orbitals`.
    pub sized: usize,
    /// - Global bulk amplitudes over all threads and orbitals.
    pub sizet: usize,
    /// - Tiles per axis in the local bulk.
    pub tiles: [usize; 3],
    /// - Total tiles in the local bulk.
    pub n_tiles: usize,
}

impl Lattice {
    pub fn new(
        dim: usize,
        extents: &[usize],
        orbitals: usize,
        threads: &[usize],
        nghosts: usize,
        tile: usize,
        boundary: &[Boundary],
        vect_pot: Array2<f64>,
    ) -> Result<Lattice> {
        if !(1..=3).contains(&dim) {
            return Err(KpmError::InvalidDimension(dim));
        }
        let mut lt = [1usize; 3];
        let mut t = [1usize; 3];
        let mut bc = [Boundary::Periodic; 3];
        for d in 0..dim {
            lt[d] = extents[d];
            t[d] = *threads.get(d).unwrap_or(&1);
            bc[d] = *boundary.get(d).unwrap_or(&Boundary::Periodic);
            if lt[d] % t[d] != 0 {
                return Err(KpmError::ExtentNotDivisible {
                    axis: d,
                    extent: lt[d],
                    threads: t[d],
                });
            }
            let per_thread = lt[d] / t[d];
            if per_thread % tile != 0 {
                return Err(KpmError::BulkNotTileable {
                    axis: d,
                    extent: per_thread,
                    stride: tile,
                });
            }
        }
        let mut ld = [1usize; 3];
        let mut bulk = [1usize; 3];
        let mut tiles = [1usize; 3];
        for d in 0..dim {
            bulk[d] = lt[d] / t[d];
            ld[d] = bulk[d] + 2 * nghosts;
            tiles[d] = bulk[d] / tile;
        }
        let nd = ld[0] * ld[1] * ld[2];
        let basis = [1, ld[0], ld[0] * ld[1], nd];
        Ok(Lattice {
            dim,
            lt,
            ld,
            bulk,
            orbitals,
            nghosts,
            tile,
            threads: t,
            boundary: bc,
            vect_pot,
            basis,
            nd,
            sized: nd * orbitals,
            sizet: lt[0] * lt[1] * lt[2] * orbitals,
            tiles,
            n_tiles: tiles[0] * tiles[1] * tiles[2],
        })
    }

    /// Number of worker threads in the grid.
    #[inline(always)]
    pub fn n_threads(&self) -> usize {
        self.threads[0] * self.threads[1] * self.threads[2]
    }

    /// Linear local index of (x, orbital).
    #[inline(always)]
    pub fn site_index(&self, x: [usize; 3], orb: usize) -> usize {
        x[0] + x[1] * self.basis[1] + x[2] * self.basis[2] + orb * self.basis[3]
    }

    /// Inverse of `site_index`.
    #[inline(always)]
    pub fn decompose(&self, i: usize) -> ([usize; 3], usize) {
        let orb = i / self.basis[3];
        let r = i % self.basis[3];
        let x2 = r / self.basis[2];
        let r = r % self.basis[2];
        ([r % self.basis[1], r / self.basis[1], x2], orb)
    }

    /// Linear offset of a hop by `delta` cells (and an orbital change), valid
    /// anywhere in the bulk because the ghost layers absorb the excursion.
    #[inline(always)]
    pub fn hop_offset(&self, delta: [i32; 3], from_orb: usize, to_orb: usize) -> isize {
        delta[0] as isize
            + delta[1] as isize * self.basis[1] as isize
            + delta[2] as isize * self.basis[2] as isize
            + (to_orb as isize - from_orb as isize) * self.basis[3] as isize
    }

    /// Tile index of a bulk cell.
    #[inline(always)]
    pub fn tile_of(&self, x: [usize; 3]) -> usize {
        let t0 = (x[0] - self.nghosts) / self.tile;
        let t1 = if self.dim > 1 {
            (x[1] - self.nghosts) / self.tile
        } else {
            0
        };
        let t2 = if self.dim > 2 {
            (x[2] - self.nghosts) / self.tile
        } else {
            0
        };
        t0 + t1 * self.tiles[0] + t2 * self.tiles[0] * self.tiles[1]
    }

    /// Local coordinates of the first cell of a tile.
    #[inline(always)]
    pub fn tile_origin(&self, t: usize) -> [usize; 3] {
        let t0 = t % self.tiles[0];
        let t1 = (t / self.tiles[0]) % self.tiles[1];
        let t2 = t / (self.tiles[0] * self.tiles[1]);
        let mut x = [0usize; 3];
        x[0] = self.nghosts + t0 * self.tile;
        if self.dim > 1 {
            x[1] = self.nghosts + t1 * self.tile;
        }
        if self.dim > 2 {
            x[2] = self.nghosts + t2 * self.tile;
        }
        x
    }

    /// Visit the linear index of the first cell of every row of a tile, for
    /// one orbital. A row is `tile` contiguous cells along axis 0; the tile
    /// holds `tile^(dim-1)` rows.
    #[inline(always)]
    pub fn for_each_tile_row(&self, t: usize, orb: usize, mut f: impl FnMut(usize)) {
        let origin = self.tile_origin(t);
        let base = self.site_index(origin, orb);
        let n1 = if self.dim > 1 { self.tile } else { 1 };
        let n2 = if self.dim > 2 { self.tile } else { 1 };
        for i2 in 0..n2 {
            for i1 in 0..n1 {
                f(base + i1 * self.basis[1] + i2 * self.basis[2]);
            }
        }
    }

    /// Visit the linear index of the first cell of every bulk row, for one
    /// orbital. Used by the untiled validation multiply and the dot products.
    #[inline(always)]
    pub fn for_each_bulk_row(&self, orb: usize, mut f: impl FnMut(usize)) {
        let g = self.nghosts;
        let n1 = if self.dim > 1 { self.bulk[1] } else { 1 };
        let n2 = if self.dim > 2 { self.bulk[2] } else { 1 };
        let x1_0 = if self.dim > 1 { g } else { 0 };
        let x2_0 = if self.dim > 2 { g } else { 0 };
        for i2 in 0..n2 {
            for i1 in 0..n1 {
                let x = [g, x1_0 + i1, x2_0 + i2];
                f(self.site_index(x, orb));
            }
        }
    }

    /// Length of a bulk row along axis 0.
    #[inline(always)]
    pub fn row_len(&self) -> usize {
        self.bulk[0]
    }

    /// Extents of the face exchanged along axis `d`: full extent (ghosts
    /// included) on axes already exchanged, bulk extent on axes not yet
    /// exchanged. Axis `d` itself is excluded. This ordering propagates
    /// corner data across successive axis exchanges.
    pub(crate) fn face_shape(&self, d: usize) -> ([usize; 3], [usize; 3]) {
        let mut len = [1usize; 3];
        let mut off = [0usize; 3];
        for a in 0..self.dim {
            if a == d {
                continue;
            }
            if a < d {
                len[a] = self.ld[a];
                off[a] = 0;
            } else {
                len[a] = self.bulk[a];
                off[a] = self.nghosts;
            }
        }
        (len, off)
    }

    /// Amplitudes in one ghost-depth face slab along axis `d` (all orbitals,
    /// all `nghosts` layers).
    pub(crate) fn face_volume(&self, d: usize) -> usize {
        let (len, _) = self.face_shape(d);
        let mut area = 1usize;
        for a in 0..3 {
            if a != d {
                area *= len[a];
            }
        }
        area * self.nghosts * self.orbitals
    }

    /// The largest face slab over all axes; sizes the per-thread staging slot.
    pub fn max_face_volume(&self) -> usize {
        (0..self.dim).map(|d| self.face_volume(d)).max().unwrap_or(0)
    }

    /// Visit every cell of one orbital's face slab along axis `d`, layers
    /// starting at coordinate `xd` on that axis. The closure receives the
    /// running face counter (the staging offset within the orbital block)
    /// and the linear site index.
    #[inline(always)]
    pub(crate) fn for_each_face_cell(
        &self,
        d: usize,
        xd: usize,
        orb: usize,
        mut f: impl FnMut(usize, usize),
    ) {
        let (len, off) = self.face_shape(d);
        let mut count = 0usize;
        for ig in 0..self.nghosts {
            for i2 in 0..len[2] {
                for i1 in 0..len[1] {
                    for i0 in 0..len[0] {
                        let mut x = [off[0] + i0, off[1] + i1, off[2] + i2];
                        x[d] = xd + ig;
                        f(count, self.site_index(x, orb));
                        count += 1;
                    }
                }
            }
        }
    }
}

/// A thread's placement inside the grid: its coordinate and neighbour map.
#[derive(Clone, Debug)]
pub struct Domain {
    pub lattice: Lattice,
    pub thread_id: usize,
    /// - Thread-grid coordinate, row-major with axis 0 fastest.
    pub coord: [usize; 3],
    /// - Neighbour thread ids per axis, [low, high]; `None` on an open
    ///   boundary face.
    pub neighbors: [[Option<usize>; 2]; 3],
}

impl Domain {
    pub fn new(lattice: Lattice, thread_id: usize) -> Domain {
        let t = lattice.threads;
        let coord = [
            thread_id % t[0],
            (thread_id / t[0]) % t[1],
            thread_id / (t[0] * t[1]),
        ];
        let mut neighbors = [[None; 2]; 3];
        for d in 0..lattice.dim {
            for (side, step) in [(0usize, -1i64), (1usize, 1i64)] {
                let c = coord[d] as i64 + step;
                let wrapped = c.rem_euclid(t[d] as i64) as usize;
                let crosses = c < 0 || c >= t[d] as i64;
                if crosses && lattice.boundary[d] == Boundary::Open {
                    continue;
                }
                let mut nc = coord;
                nc[d] = wrapped;
                neighbors[d][side] = Some(nc[0] + nc[1] * t[0] + nc[2] * t[0] * t[1]);
            }
        }
        Domain {
            lattice,
            thread_id,
            coord,
            neighbors,
        }
    }

    /// Global cell coordinate of a local cell, wrapped into the global box.
    #[inline(always)]
    pub fn local_to_global(&self, x: [usize; 3]) -> [i64; 3] {
        let l = &self.lattice;
        let mut g = [0i64; 3];
        for d in 0..l.dim {
            let raw =
                (self.coord[d] * l.bulk[d]) as i64 + x[d] as i64 - l.nghosts as i64;
            g[d] = raw.rem_euclid(l.lt[d] as i64);
        }
        g
    }

    /// Local coordinates of a global cell owned by this thread. Returns
    /// `None` when the cell lives in another thread's bulk.
    pub fn global_to_local(&self, g: [i64; 3]) -> Option<[usize; 3]> {
        let l = &self.lattice;
        let mut x = [0usize; 3];
        for d in 0..l.dim {
            let lo = (self.coord[d] * l.bulk[d]) as i64;
            if g[d] < lo || g[d] >= lo + l.bulk[d] as i64 {
                return None;
            }
            x[d] = (g[d] - lo) as usize + l.nghosts;
        }
        Some(x)
    }

    /// Peierls phase picked up by a hop of `delta` cells out of the global
    /// cell `g`: delta . A . g.
    #[inline(always)]
    pub fn peierls_phase(&self, delta: [i32; 3], g: [i64; 3]) -> f64 {
        let l = &self.lattice;
        let mut phase = 0.0;
        for a in 0..l.dim {
            if delta[a] == 0 {
                continue;
            }
            let mut row = 0.0;
            for b in 0..l.dim {
                row += l.vect_pot[[a, b]] * g[b] as f64;
            }
            phase += delta[a] as f64 * row;
        }
        phase
    }
}
