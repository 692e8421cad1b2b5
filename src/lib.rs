use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use log::{debug, info, warn};
use rand::{RngCore, SeedableRng};
use rand_distr::{Binomial, Distribution};
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use thiserror::Error;

const AVOGADRO: f64 = 6.02214076e23;
const NEIGHBORS_PER_TET: usize = 4;
// Relative drift allowed between the cached total propensity and a fresh
// recomputation before the group sums are rebuilt.
const TOTAL_PROPENSITY_REL_TOL: f64 = 1e-9;

pub type Result<T> = std::result::Result<T, SolverError>;

#[derive(Debug, Error)]
pub enum SolverError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("shape invariant violated: {0}")]
    Shape(String),
    #[error("numeric invariant violated: {0}")]
    Numeric(String),
    #[error("sampling inconsistency: {0}")]
    Sampling(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("thread pool error: {0}")]
    ThreadPool(String),
}

// ---------------------------------------------------------------------------
// RNG and sampling primitives
// ---------------------------------------------------------------------------

const MT_N: usize = 624;
const MT_M: usize = 397;
const MT_MATRIX_A: u32 = 0x9908_b0df;
const MT_UPPER_MASK: u32 = 0x8000_0000;
const MT_LOWER_MASK: u32 = 0x7fff_ffff;

/// 32-bit Mersenne-Twister generator (MT19937), wired into the `rand`
/// ecosystem through `RngCore` so distribution samplers can drive it.
#[derive(Clone)]
pub struct Mt19937 {
    state: [u32; MT_N],
    index: usize,
}

impl Mt19937 {
    pub fn new(seed: u32) -> Self {
        let mut state = [0u32; MT_N];
        state[0] = seed;
        for i in 1..MT_N {
            state[i] = 1_812_433_253u32
                .wrapping_mul(state[i - 1] ^ (state[i - 1] >> 30))
                .wrapping_add(i as u32);
        }
        Self {
            state,
            index: MT_N,
        }
    }

    fn twist(&mut self) {
        for i in 0..MT_N {
            let y = (self.state[i] & MT_UPPER_MASK) | (self.state[(i + 1) % MT_N] & MT_LOWER_MASK);
            let mut next = self.state[(i + MT_M) % MT_N] ^ (y >> 1);
            if y & 1 == 1 {
                next ^= MT_MATRIX_A;
            }
            self.state[i] = next;
        }
        self.index = 0;
    }
}

impl RngCore for Mt19937 {
    fn next_u32(&mut self) -> u32 {
        if self.index >= MT_N {
            self.twist();
        }
        let mut y = self.state[self.index];
        self.index += 1;
        y ^= y >> 11;
        y ^= (y << 7) & 0x9d2c_5680;
        y ^= (y << 15) & 0xefc6_0000;
        y ^ (y >> 18)
    }

    fn next_u64(&mut self) -> u64 {
        let lo = self.next_u32() as u64;
        let hi = self.next_u32() as u64;
        (hi << 32) | lo
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for chunk in dest.chunks_mut(4) {
            let bytes = self.next_u32().to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> std::result::Result<(), rand::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

impl SeedableRng for Mt19937 {
    type Seed = [u8; 4];

    fn from_seed(seed: [u8; 4]) -> Self {
        Self::new(u32::from_le_bytes(seed))
    }
}

/// Uniform draw on the unit interval, `(raw - raw_min) / (raw_max - raw_min)`
/// over the generator's full 32-bit range.
#[inline]
pub fn draw_uniform<R: RngCore>(rng: &mut R) -> f64 {
    rng.next_u32() as f64 * (1.0 / u32::MAX as f64)
}

/// Stochastic rounding: `floor(x) + 1` with probability `x - floor(x)`,
/// `floor(x)` otherwise, so the expected value equals `x`. Does not advance
/// the generator when `x` is already integral.
#[inline]
pub fn rand_round<R: RngCore>(x: f64, rng: &mut R) -> i32 {
    debug_assert!(x >= 0.0);
    let floor = x.floor();
    let frac = x - floor;
    if frac > 0.0 && draw_uniform(rng) < frac {
        floor as i32 + 1
    } else {
        floor as i32
    }
}

/// Binomial draw B(n, p) with the degenerate cases resolved before
/// delegating to the distribution sampler.
#[inline]
pub fn binomial<R: RngCore>(n: i32, p: f64, rng: &mut R) -> i32 {
    if n <= 0 || p <= 0.0 {
        return 0;
    }
    if p >= 1.0 {
        return n;
    }
    // n > 0 and p in (0, 1): construction cannot fail.
    Binomial::new(n as u64, p)
        .map(|d| d.sample(rng) as i32)
        .unwrap_or(0)
}

fn derive_seed(seed: Option<u64>, instance: u64) -> u64 {
    const GOLDEN_GAMMA: u64 = 0x9E37_79B9_7F4A_7C15;
    let base = seed.unwrap_or(0xD1FF_5EED_BA5E_CAFE);
    let mut z = base ^ (instance.wrapping_mul(GOLDEN_GAMMA));
    // SplitMix64
    z = z.wrapping_add(GOLDEN_GAMMA);
    let mut result = z;
    result = (result ^ (result >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    result = (result ^ (result >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    result ^ (result >> 31)
}

// ---------------------------------------------------------------------------
// Tetrahedral mesh and per-(species, tet) state
// ---------------------------------------------------------------------------

/// Raw mesh geometry as read from a mesh file, before validation.
#[derive(Clone, Debug, Default)]
pub struct MeshGeometry {
    pub volumes: Vec<f64>,
    pub neighbors: Vec<i32>,
    pub shapes: Vec<f64>,
}

/// Mesh plus molecular state, stored as flat arrays. Per-(species, tet)
/// arrays are species-major: address `s * n_tets + i`.
#[derive(Debug)]
pub struct TetMesh {
    n_tets: usize,
    n_species: usize,
    volumes: Vec<f64>,
    neighbors: Vec<i32>,
    shapes: Vec<f64>,
    shape_sums: Vec<f64>,
    mol_counts: Vec<i32>,
    buckets: Vec<i32>,
    occupancies: Vec<f64>,
    occupancy_times: Vec<f64>,
}

impl TetMesh {
    pub fn with_geometry(geometry: MeshGeometry, n_species: usize) -> Result<Self> {
        let MeshGeometry {
            volumes,
            neighbors,
            mut shapes,
        } = geometry;
        let n_tets = volumes.len();
        if n_tets == 0 {
            return Err(SolverError::Shape(
                "mesh must contain at least one tetrahedron".into(),
            ));
        }
        if n_species == 0 {
            return Err(SolverError::Shape(
                "mesh state requires at least one species".into(),
            ));
        }
        if neighbors.len() != n_tets * NEIGHBORS_PER_TET
            || shapes.len() != n_tets * NEIGHBORS_PER_TET
        {
            return Err(SolverError::Shape(format!(
                "mesh arrays are inconsistent: {} tetrahedra, {} neighbor slots, {} shape slots",
                n_tets,
                neighbors.len(),
                shapes.len()
            )));
        }
        for (i, &v) in volumes.iter().enumerate() {
            if !v.is_finite() || v <= 0.0 {
                return Err(SolverError::Shape(format!(
                    "tetrahedron {} has non-positive volume {}",
                    i, v
                )));
            }
        }
        for i in 0..n_tets {
            for j in 0..NEIGHBORS_PER_TET {
                let nb = neighbors[NEIGHBORS_PER_TET * i + j];
                if nb < -1 || nb >= n_tets as i32 {
                    return Err(SolverError::Shape(format!(
                        "tetrahedron {} lists out-of-range neighbor {}",
                        i, nb
                    )));
                }
                if nb == i as i32 {
                    return Err(SolverError::Shape(format!(
                        "tetrahedron {} lists itself as a neighbor",
                        i
                    )));
                }
                let shape = &mut shapes[NEIGHBORS_PER_TET * i + j];
                if !shape.is_finite() || *shape < 0.0 {
                    return Err(SolverError::Shape(format!(
                        "tetrahedron {} has invalid shape coefficient {}",
                        i, shape
                    )));
                }
                // Boundary slots carry no flux.
                if nb == -1 {
                    *shape = 0.0;
                }
            }
        }
        let shape_sums = shapes
            .chunks_exact(NEIGHBORS_PER_TET)
            .map(|row| row.iter().sum())
            .collect();
        Ok(Self {
            n_tets,
            n_species,
            volumes,
            neighbors,
            shapes,
            shape_sums,
            mol_counts: vec![0; n_tets * n_species],
            buckets: vec![0; n_tets],
            occupancies: vec![0.0; n_tets * n_species],
            occupancy_times: vec![0.0; n_tets * n_species],
        })
    }

    #[inline]
    pub fn n_tets(&self) -> usize {
        self.n_tets
    }

    #[inline]
    pub fn n_species(&self) -> usize {
        self.n_species
    }

    #[inline]
    fn species_addr(&self, s: usize, i: usize) -> usize {
        debug_assert!(s < self.n_species && i < self.n_tets);
        s * self.n_tets + i
    }

    #[inline]
    pub fn volume(&self, i: usize) -> f64 {
        debug_assert!(i < self.n_tets);
        self.volumes[i]
    }

    #[inline]
    pub fn neighbor(&self, i: usize, j: usize) -> i32 {
        debug_assert!(i < self.n_tets && j < NEIGHBORS_PER_TET);
        self.neighbors[NEIGHBORS_PER_TET * i + j]
    }

    #[inline]
    pub fn shape(&self, i: usize, j: usize) -> f64 {
        debug_assert!(i < self.n_tets && j < NEIGHBORS_PER_TET);
        self.shapes[NEIGHBORS_PER_TET * i + j]
    }

    #[inline]
    pub fn shape_sum(&self, i: usize) -> f64 {
        debug_assert!(i < self.n_tets);
        self.shape_sums[i]
    }

    #[inline]
    pub fn molecule_count(&self, s: usize, i: usize) -> i32 {
        self.mol_counts[self.species_addr(s, i)]
    }

    #[inline]
    fn molecule_count_mut(&mut self, s: usize, i: usize) -> &mut i32 {
        let addr = self.species_addr(s, i);
        &mut self.mol_counts[addr]
    }

    #[inline]
    fn occupancy(&self, s: usize, i: usize) -> f64 {
        self.occupancies[self.species_addr(s, i)]
    }

    #[inline]
    fn occupancy_mut(&mut self, s: usize, i: usize) -> &mut f64 {
        let addr = self.species_addr(s, i);
        &mut self.occupancies[addr]
    }

    #[inline]
    fn occupancy_time(&self, s: usize, i: usize) -> f64 {
        self.occupancy_times[self.species_addr(s, i)]
    }

    #[inline]
    fn occupancy_time_mut(&mut self, s: usize, i: usize) -> &mut f64 {
        let addr = self.species_addr(s, i);
        &mut self.occupancy_times[addr]
    }

    pub fn max_shape_sum(&self) -> f64 {
        self.shape_sums.iter().copied().fold(0.0, f64::max)
    }

    pub fn total_volume(&self) -> f64 {
        self.volumes.iter().sum()
    }

    pub fn total_count(&self, s: usize) -> i64 {
        let start = self.species_addr(s, 0);
        self.mol_counts[start..start + self.n_tets]
            .iter()
            .map(|&c| c as i64)
            .sum()
    }

    // Stage molecules arriving in the j-th neighbor of tet i. The caller
    // only routes a positive count here when the slot has a real neighbor.
    #[inline]
    fn add_to_bucket(&mut self, i: usize, j: usize, count: i32) {
        let nb = self.neighbor(i, j);
        debug_assert!(count == 0 || nb >= 0);
        self.buckets[nb as usize] += count;
    }

    fn flush_buckets(&mut self, s: usize) {
        for i in 0..self.n_tets {
            let arrived = self.buckets[i];
            if arrived != 0 {
                *self.molecule_count_mut(s, i) += arrived;
                self.buckets[i] = 0;
            }
        }
    }

    /// Spread `n_total` molecules of species `s` over the mesh, each tet
    /// receiving the stochastically rounded share of its volume fraction.
    /// With `conserve` the rounding residual is corrected by single-molecule
    /// volume-weighted adjustments so the total matches exactly.
    pub fn distribute<R: RngCore>(
        &mut self,
        s: usize,
        n_total: i32,
        conserve: bool,
        rng: &mut R,
    ) -> Result<()> {
        if n_total < 0 {
            return Err(SolverError::InvalidArgument(format!(
                "cannot distribute a negative molecule count {}",
                n_total
            )));
        }
        let total_volume = self.total_volume();
        let mut placed: i64 = 0;
        for i in 0..self.n_tets {
            let share = n_total as f64 * self.volumes[i] / total_volume;
            let mols = rand_round(share, rng);
            *self.molecule_count_mut(s, i) = mols;
            placed += mols as i64;
        }
        if conserve {
            while placed < n_total as i64 {
                let i = self.volume_weighted_tet(rng);
                *self.molecule_count_mut(s, i) += 1;
                placed += 1;
            }
            while placed > n_total as i64 {
                let i = self.volume_weighted_tet(rng);
                if self.molecule_count(s, i) > 0 {
                    *self.molecule_count_mut(s, i) -= 1;
                    placed -= 1;
                }
            }
        }
        Ok(())
    }

    fn volume_weighted_tet<R: RngCore>(&self, rng: &mut R) -> usize {
        let mut target = draw_uniform(rng) * self.total_volume();
        for (i, &v) in self.volumes.iter().enumerate() {
            if target <= v {
                return i;
            }
            target -= v;
        }
        self.n_tets - 1
    }
}

// Insertion-ordered tet set used during diffusion sweeps. Iteration order is
// a pure function of the insertion sequence, which keeps equal-seed runs
// bit-identical (a hash set would not).
#[derive(Default)]
struct TouchedTets {
    marked: Vec<bool>,
    items: Vec<usize>,
}

impl TouchedTets {
    fn with_capacity(n_tets: usize) -> Self {
        Self {
            marked: vec![false; n_tets],
            items: Vec::new(),
        }
    }

    #[inline]
    fn insert(&mut self, i: usize) {
        if !self.marked[i] {
            self.marked[i] = true;
            self.items.push(i);
        }
    }

    fn clear(&mut self) {
        for &i in &self.items {
            self.marked[i] = false;
        }
        self.items.clear();
    }
}

// ---------------------------------------------------------------------------
// Input file parsing
// ---------------------------------------------------------------------------

struct LineCursor<'a> {
    lines: std::str::Lines<'a>,
    line_no: usize,
    file_kind: &'static str,
}

impl<'a> LineCursor<'a> {
    fn new(text: &'a str, file_kind: &'static str) -> Self {
        Self {
            lines: text.lines(),
            line_no: 0,
            file_kind,
        }
    }

    fn next_raw(&mut self) -> Option<&'a str> {
        self.line_no += 1;
        self.lines.next()
    }

    // Next line with content, skipping blank ones.
    fn next_record(&mut self, what: &str) -> Result<&'a str> {
        loop {
            match self.next_raw() {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => return Ok(line),
                None => {
                    return Err(SolverError::Parse(format!(
                        "{} file ended while looking for {}",
                        self.file_kind, what
                    )))
                }
            }
        }
    }

    // The line after each block header is a free-form description.
    fn skip_description(&mut self) -> Result<()> {
        self.next_raw().map(|_| ()).ok_or_else(|| {
            SolverError::Parse(format!(
                "{} file ended before its description line",
                self.file_kind
            ))
        })
    }

    // Block headers are a tag token followed by an entry count.
    fn block_header(&mut self, what: &str) -> Result<usize> {
        let line = self.next_record(what)?;
        let mut fields = line.split_whitespace();
        let _tag = fields.next();
        self.parse_field(fields.next(), what)
    }

    fn parse_field<T: FromStr>(&self, token: Option<&str>, what: &str) -> Result<T> {
        let raw = token.ok_or_else(|| {
            SolverError::Parse(format!(
                "{} file line {}: missing {}",
                self.file_kind, self.line_no, what
            ))
        })?;
        raw.parse().map_err(|_| {
            SolverError::Parse(format!(
                "{} file line {}: invalid {} '{}'",
                self.file_kind, self.line_no, what, raw
            ))
        })
    }
}

fn parse_mesh(text: &str) -> Result<MeshGeometry> {
    let mut cursor = LineCursor::new(text, "mesh");
    let n_tets = cursor.block_header("tetrahedron count")?;
    cursor.skip_description()?;

    let mut geometry = MeshGeometry {
        volumes: Vec::with_capacity(n_tets),
        neighbors: Vec::with_capacity(n_tets * NEIGHBORS_PER_TET),
        shapes: Vec::with_capacity(n_tets * NEIGHBORS_PER_TET),
    };
    for _ in 0..n_tets {
        let line = cursor.next_record("a tetrahedron record")?;
        let mut fields = line.split_whitespace();
        let _tag = fields.next().ok_or_else(|| {
            SolverError::Parse(format!(
                "mesh file line {}: empty tetrahedron record",
                cursor.line_no
            ))
        })?;
        geometry
            .volumes
            .push(cursor.parse_field(fields.next(), "volume")?);
        for _ in 0..NEIGHBORS_PER_TET {
            geometry
                .neighbors
                .push(cursor.parse_field(fields.next(), "neighbor index")?);
        }
        for _ in 0..NEIGHBORS_PER_TET {
            geometry
                .shapes
                .push(cursor.parse_field(fields.next(), "shape coefficient")?);
        }
    }
    Ok(geometry)
}

struct ParsedSpecies {
    name: String,
    initial_count: i32,
}

struct ParsedReaction {
    reactants: Vec<String>,
    products: Vec<String>,
    rate_constant: f64,
}

struct ParsedModel {
    species: Vec<ParsedSpecies>,
    reactions: Vec<ParsedReaction>,
    diffusion: Vec<(String, f64)>,
}

fn parse_model(text: &str) -> Result<ParsedModel> {
    let mut cursor = LineCursor::new(text, "model");

    let n_species = cursor.block_header("species count")?;
    cursor.skip_description()?;
    let mut species = Vec::with_capacity(n_species);
    for _ in 0..n_species {
        let line = cursor.next_record("a species record")?;
        let mut fields = line.split_whitespace();
        let name: String = cursor.parse_field(fields.next(), "species name")?;
        let initial_count: i32 = cursor.parse_field(fields.next(), "initial molecule count")?;
        if initial_count < 0 {
            return Err(SolverError::Parse(format!(
                "model file line {}: species '{}' has negative initial count {}",
                cursor.line_no, name, initial_count
            )));
        }
        species.push(ParsedSpecies {
            name,
            initial_count,
        });
    }

    let n_reactions = cursor.block_header("reaction count")?;
    cursor.skip_description()?;
    let mut reactions = Vec::with_capacity(n_reactions);
    for _ in 0..n_reactions {
        let line = cursor.next_record("a reaction record")?;
        let mut fields = line.split_whitespace();
        let n_reactants: usize = cursor.parse_field(fields.next(), "reactant count")?;
        if n_reactants > 2 {
            return Err(SolverError::Parse(format!(
                "model file line {}: reactions support at most two reactants, got {}",
                cursor.line_no, n_reactants
            )));
        }
        let mut reactants = Vec::with_capacity(n_reactants);
        for _ in 0..n_reactants {
            reactants.push(cursor.parse_field(fields.next(), "reactant name")?);
        }
        let n_products: usize = cursor.parse_field(fields.next(), "product count")?;
        let mut products = Vec::with_capacity(n_products);
        for _ in 0..n_products {
            products.push(cursor.parse_field(fields.next(), "product name")?);
        }
        let rate_constant: f64 = cursor.parse_field(fields.next(), "rate constant")?;
        if !rate_constant.is_finite() || rate_constant < 0.0 {
            return Err(SolverError::Parse(format!(
                "model file line {}: rate constant must be finite and non-negative, got {}",
                cursor.line_no, rate_constant
            )));
        }
        reactions.push(ParsedReaction {
            reactants,
            products,
            rate_constant,
        });
    }

    let n_diffusions = cursor.block_header("diffusion entry count")?;
    if n_diffusions != n_species {
        return Err(SolverError::Shape(format!(
            "model declares {} species but {} diffusion entries",
            n_species, n_diffusions
        )));
    }
    cursor.skip_description()?;
    let mut diffusion = Vec::with_capacity(n_diffusions);
    for _ in 0..n_diffusions {
        let line = cursor.next_record("a diffusion record")?;
        let mut fields = line.split_whitespace();
        let name: String = cursor.parse_field(fields.next(), "species name")?;
        let coeff: f64 = cursor.parse_field(fields.next(), "diffusion coefficient")?;
        if !coeff.is_finite() || coeff < 0.0 {
            return Err(SolverError::Parse(format!(
                "model file line {}: diffusion coefficient must be finite and non-negative, got {}",
                cursor.line_no, coeff
            )));
        }
        diffusion.push((name, coeff));
    }

    Ok(ParsedModel {
        species,
        reactions,
        diffusion,
    })
}

// ---------------------------------------------------------------------------
// Reaction model
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RateLaw {
    Constitutive,
    Unimolecular { s: usize },
    Bimolecular { a: usize, b: usize },
    Dimerization { s: usize },
}

impl RateLaw {
    fn from_reactants(reactants: &[usize]) -> Self {
        match *reactants {
            [] => Self::Constitutive,
            [s] => Self::Unimolecular { s },
            [a, b] if a == b => Self::Dimerization { s: a },
            [a, b] => Self::Bimolecular { a, b },
            _ => unreachable!("reactant arity is validated at parse time"),
        }
    }

    fn reactant_species(&self) -> Vec<usize> {
        match *self {
            Self::Constitutive => Vec::new(),
            Self::Unimolecular { s } | Self::Dimerization { s } => vec![s],
            Self::Bimolecular { a, b } => vec![a, b],
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct SpeciesDelta {
    species: usize,
    delta: i32,
}

#[derive(Clone, Debug)]
struct Reaction {
    rate_constant: f64,
    law: RateLaw,
    deltas: Vec<SpeciesDelta>,
    update_species: Vec<usize>,
}

/// Chemical model: species, reactions with their rate laws, diffusion
/// coefficients, and the precomputed dependency closures the solver uses to
/// refresh propensities after an event.
pub struct Model {
    species_names: Vec<String>,
    diffusion_coeffs: Vec<f64>,
    max_diffusion: f64,
    reactions: Vec<Reaction>,
    reaction_deps: Vec<Vec<usize>>,
    diffusion_deps: Vec<Vec<usize>>,
}

impl Model {
    fn build(parsed: &ParsedModel) -> Result<Self> {
        let n_species = parsed.species.len();
        if n_species == 0 {
            return Err(SolverError::Shape(
                "model must declare at least one species".into(),
            ));
        }
        let mut index: HashMap<&str, usize> = HashMap::with_capacity(n_species);
        for (s, sp) in parsed.species.iter().enumerate() {
            if index.insert(sp.name.as_str(), s).is_some() {
                return Err(SolverError::Parse(format!(
                    "duplicate species name '{}'",
                    sp.name
                )));
            }
        }
        let resolve = |name: &str| -> Result<usize> {
            index.get(name).copied().ok_or_else(|| {
                SolverError::Parse(format!("reference to unknown species '{}'", name))
            })
        };

        let mut reactions = Vec::with_capacity(parsed.reactions.len());
        for record in &parsed.reactions {
            let mut reactant_idxs = Vec::with_capacity(record.reactants.len());
            for name in &record.reactants {
                reactant_idxs.push(resolve(name)?);
            }
            let mut net = vec![0i32; n_species];
            for &s in &reactant_idxs {
                net[s] -= 1;
            }
            for name in &record.products {
                net[resolve(name)?] += 1;
            }
            let deltas: Vec<_> = net
                .iter()
                .enumerate()
                .filter_map(|(species, &delta)| {
                    (delta != 0).then_some(SpeciesDelta { species, delta })
                })
                .collect();
            let update_species = deltas.iter().map(|d| d.species).collect();
            reactions.push(Reaction {
                rate_constant: record.rate_constant,
                law: RateLaw::from_reactants(&reactant_idxs),
                deltas,
                update_species,
            });
        }

        let mut diffusion_coeffs = vec![f64::NAN; n_species];
        for (name, coeff) in &parsed.diffusion {
            let s = resolve(name)?;
            if !diffusion_coeffs[s].is_nan() {
                return Err(SolverError::Parse(format!(
                    "duplicate diffusion entry for species '{}'",
                    name
                )));
            }
            diffusion_coeffs[s] = *coeff;
        }
        let max_diffusion = diffusion_coeffs.iter().copied().fold(0.0, f64::max);

        let (reaction_deps, diffusion_deps) = build_dependency_sets(n_species, &reactions);

        Ok(Self {
            species_names: parsed.species.iter().map(|sp| sp.name.clone()).collect(),
            diffusion_coeffs,
            max_diffusion,
            reactions,
            reaction_deps,
            diffusion_deps,
        })
    }

    #[inline]
    pub fn n_species(&self) -> usize {
        self.species_names.len()
    }

    #[inline]
    pub fn n_reactions(&self) -> usize {
        self.reactions.len()
    }

    pub fn species_name(&self, s: usize) -> &str {
        &self.species_names[s]
    }

    #[inline]
    pub fn diffusion_coeff(&self, s: usize) -> f64 {
        self.diffusion_coeffs[s]
    }

    #[inline]
    pub fn max_diffusion_coeff(&self) -> f64 {
        self.max_diffusion
    }

    /// Reactions whose propensity must be refreshed in the tet where
    /// reaction `r` just fired.
    #[inline]
    pub fn reaction_dependencies(&self, r: usize) -> &[usize] {
        &self.reaction_deps[r]
    }

    /// Reactions whose propensity must be refreshed in a tet whose count of
    /// species `s` changed by diffusion.
    #[inline]
    pub fn diffusion_dependencies(&self, s: usize) -> &[usize] {
        &self.diffusion_deps[s]
    }

    /// Species whose counts change when reaction `r` fires.
    #[inline]
    pub fn update_species(&self, r: usize) -> &[usize] {
        &self.reactions[r].update_species
    }

    #[inline]
    pub fn compute_propensity(&self, r: usize, i: usize, tets: &TetMesh) -> f64 {
        let reaction = &self.reactions[r];
        let k = reaction.rate_constant;
        match reaction.law {
            RateLaw::Constitutive => k,
            RateLaw::Unimolecular { s } => {
                let x = tets.molecule_count(s, i);
                if x <= 0 {
                    0.0
                } else {
                    k * x as f64
                }
            }
            RateLaw::Bimolecular { a, b } => {
                let xa = tets.molecule_count(a, i);
                let xb = tets.molecule_count(b, i);
                if xa <= 0 || xb <= 0 {
                    0.0
                } else {
                    k / (AVOGADRO * tets.volume(i)) * xa as f64 * xb as f64
                }
            }
            RateLaw::Dimerization { s } => {
                let x = tets.molecule_count(s, i);
                if x < 2 {
                    0.0
                } else {
                    // distinct unordered pairs: x (x - 1) / 2
                    k / (AVOGADRO * tets.volume(i)) * 0.5 * x as f64 * (x - 1) as f64
                }
            }
        }
    }

    pub fn apply_reaction(&self, r: usize, i: usize, tets: &mut TetMesh) -> Result<()> {
        let reaction = &self.reactions[r];
        for d in &reaction.deltas {
            if tets.molecule_count(d.species, i) + d.delta < 0 {
                return Err(SolverError::Numeric(format!(
                    "reaction {} would drive species '{}' negative in tetrahedron {}",
                    r, self.species_names[d.species], i
                )));
            }
        }
        for d in &reaction.deltas {
            *tets.molecule_count_mut(d.species, i) += d.delta;
        }
        Ok(())
    }
}

fn build_dependency_sets(
    n_species: usize,
    reactions: &[Reaction],
) -> (Vec<Vec<usize>>, Vec<Vec<usize>>) {
    // diffusion_deps[s]: reactions whose propensity reads species s.
    let mut diffusion_deps: Vec<Vec<usize>> = vec![Vec::new(); n_species];
    for (r, reaction) in reactions.iter().enumerate() {
        for s in reaction.law.reactant_species() {
            if !diffusion_deps[s].contains(&r) {
                diffusion_deps[s].push(r);
            }
        }
    }

    // reaction_deps[r]: r itself plus every reaction reading a species that
    // r modifies. Stamp markers avoid clearing the dedup scratch per row.
    let mut reaction_deps = vec![Vec::new(); reactions.len()];
    let mut visit_markers = vec![0usize; reactions.len()];
    let mut stamp = 1usize;
    for (r, deps) in reaction_deps.iter_mut().enumerate() {
        if stamp == usize::MAX {
            visit_markers.fill(0);
            stamp = 1;
        }
        let mark = stamp;
        stamp += 1;

        visit_markers[r] = mark;
        deps.push(r);
        for d in &reactions[r].deltas {
            for &dep in &diffusion_deps[d.species] {
                if visit_markers[dep] != mark {
                    visit_markers[dep] = mark;
                    deps.push(dep);
                }
            }
        }
    }
    (reaction_deps, diffusion_deps)
}

// ---------------------------------------------------------------------------
// Composition-rejection propensity index
// ---------------------------------------------------------------------------

const NO_GROUP: i32 = -1;

#[derive(Clone, Copy, Debug)]
struct EntrySlot {
    group: i32,
    pos: u32,
}

#[derive(Clone, Debug)]
struct PropGroup {
    // Members have propensity in [2^e, 2^(e+1)); bound is the upper edge,
    // so within-group rejection accepts with probability >= 1/2.
    bound: f64,
    sum: f64,
    members: Vec<u32>,
}

/// Two-level index over the propensities a[r, i], supporting O(1) amortized
/// update and O(1) expected sampling proportional to propensity. Entries are
/// grouped by the power-of-two bracket of their current value; zero entries
/// live outside every group and are never sampled.
pub struct CompRejIndex {
    n_tets: usize,
    values: Vec<f64>,
    slots: Vec<EntrySlot>,
    groups: Vec<PropGroup>,
    group_by_exp: HashMap<i32, usize>,
    total: f64,
}

impl CompRejIndex {
    pub fn new(n_reactions: usize, n_tets: usize) -> Self {
        let n_entries = n_reactions * n_tets;
        debug_assert!(n_entries <= u32::MAX as usize);
        Self {
            n_tets,
            values: vec![0.0; n_entries],
            slots: vec![
                EntrySlot {
                    group: NO_GROUP,
                    pos: 0
                };
                n_entries
            ],
            groups: Vec::new(),
            group_by_exp: HashMap::new(),
            total: 0.0,
        }
    }

    #[inline]
    pub fn total(&self) -> f64 {
        self.total
    }

    #[inline]
    pub fn value(&self, r: usize, i: usize) -> f64 {
        self.values[r * self.n_tets + i]
    }

    fn bracket_exponent(value: f64) -> i32 {
        debug_assert!(value > 0.0);
        value.log2().floor() as i32
    }

    fn group_slot(&mut self, exponent: i32) -> usize {
        if let Some(&g) = self.group_by_exp.get(&exponent) {
            return g;
        }
        let g = self.groups.len();
        self.groups.push(PropGroup {
            bound: (exponent as f64 + 1.0).exp2(),
            sum: 0.0,
            members: Vec::new(),
        });
        self.group_by_exp.insert(exponent, g);
        g
    }

    fn remove_member(&mut self, g: usize, key: usize) {
        let pos = self.slots[key].pos as usize;
        let members = &mut self.groups[g].members;
        members.swap_remove(pos);
        if pos < members.len() {
            let moved = members[pos] as usize;
            self.slots[moved].pos = pos as u32;
        }
    }

    pub fn update(&mut self, r: usize, i: usize, value: f64) -> Result<()> {
        if !(value >= 0.0) || !value.is_finite() {
            return Err(SolverError::Numeric(format!(
                "propensity a[{}, {}] = {} is not a finite non-negative number",
                r, i, value
            )));
        }
        let key = r * self.n_tets + i;
        let old = self.values[key];
        if old == value {
            return Ok(());
        }
        let old_slot = self.slots[key];
        let new_group = (value > 0.0).then(|| self.group_slot(Self::bracket_exponent(value)));
        let old_group = (old_slot.group != NO_GROUP).then_some(old_slot.group as usize);

        if old_group == new_group {
            if let Some(g) = new_group {
                self.groups[g].sum += value - old;
            }
        } else {
            if let Some(g) = old_group {
                self.remove_member(g, key);
                self.groups[g].sum -= old;
            }
            match new_group {
                Some(g) => {
                    let pos = self.groups[g].members.len() as u32;
                    self.groups[g].members.push(key as u32);
                    self.groups[g].sum += value;
                    self.slots[key] = EntrySlot {
                        group: g as i32,
                        pos,
                    };
                }
                None => {
                    self.slots[key] = EntrySlot {
                        group: NO_GROUP,
                        pos: 0,
                    };
                }
            }
        }
        self.total += value - old;
        self.values[key] = value;
        Ok(())
    }

    /// Sample (r, i) with probability a[r, i] / a0, or None when a0 is zero.
    pub fn sample<R: RngCore>(&self, rng: &mut R) -> Option<(usize, usize)> {
        if !(self.total > 0.0) {
            return None;
        }
        // First level: pick a group proportionally to its summed propensity.
        let mut target = draw_uniform(rng) * self.total;
        let mut chosen = usize::MAX;
        for (g, group) in self.groups.iter().enumerate() {
            if group.sum <= 0.0 || group.members.is_empty() {
                continue;
            }
            chosen = g;
            if target <= group.sum {
                break;
            }
            target -= group.sum;
        }
        if chosen == usize::MAX {
            return None;
        }
        // Second level: rejection within the group. Every member's value is
        // at least half the group bound, so this accepts quickly.
        let group = &self.groups[chosen];
        loop {
            let pick = (draw_uniform(rng) * group.members.len() as f64) as usize;
            let key = group.members[pick.min(group.members.len() - 1)] as usize;
            if draw_uniform(rng) * group.bound < self.values[key] {
                return Some((key / self.n_tets, key % self.n_tets));
            }
        }
    }

    /// Recompute every group sum and the cached total from the stored
    /// values. Returns true when the cached total had drifted beyond the
    /// relative tolerance, in which case the caller should warn.
    pub fn reconcile(&mut self, rel_tol: f64) -> bool {
        let mut fresh_total = 0.0;
        for g in 0..self.groups.len() {
            let sum: f64 = self.groups[g]
                .members
                .iter()
                .map(|&key| self.values[key as usize])
                .sum();
            self.groups[g].sum = sum;
            fresh_total += sum;
        }
        let drifted = (fresh_total - self.total).abs() > rel_tol * fresh_total.abs().max(1.0);
        self.total = fresh_total;
        drifted
    }
}

// ---------------------------------------------------------------------------
// Reaction-diffusion solver
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default)]
pub struct SolverOptions {
    /// Correct the stochastic-rounding residual of the initial distribution
    /// so per-species totals match the model file exactly.
    pub conserve_initial_counts: bool,
}

struct SimState {
    tets: TetMesh,
    model: Model,
    comprej: CompRejIndex,
    fired: Vec<(usize, usize)>,
    touched: TouchedTets,
}

/// Operator-split reaction-diffusion solver: exact SSA for reactions inside
/// each update period, one binomial diffusion sweep per species at the end
/// of it.
pub struct RdSolver {
    rng: Mt19937,
    options: SolverOptions,
    sim: Option<SimState>,
    elapsed: f64,
}

impl RdSolver {
    pub fn new(seed: u32) -> Self {
        Self::with_options(seed, SolverOptions::default())
    }

    pub fn with_options(seed: u32, options: SolverOptions) -> Self {
        Self {
            rng: Mt19937::new(seed),
            options,
            sim: None,
            elapsed: 0.0,
        }
    }

    pub fn load<P: AsRef<Path>>(&mut self, mesh_path: P, model_path: P) -> Result<()> {
        let mesh_text = fs::read_to_string(mesh_path)?;
        let model_text = fs::read_to_string(model_path)?;
        self.load_from_str(&mesh_text, &model_text)
    }

    /// Build the mesh, model, and propensity index from file contents. On
    /// failure the solver keeps whatever state it had before the call.
    pub fn load_from_str(&mut self, mesh_text: &str, model_text: &str) -> Result<()> {
        let geometry = parse_mesh(mesh_text)?;
        let parsed = parse_model(model_text)?;
        let model = Model::build(&parsed)?;
        let mut tets = TetMesh::with_geometry(geometry, model.n_species())?;
        for (s, sp) in parsed.species.iter().enumerate() {
            tets.distribute(
                s,
                sp.initial_count,
                self.options.conserve_initial_counts,
                &mut self.rng,
            )?;
        }

        let mut comprej = CompRejIndex::new(model.n_reactions(), tets.n_tets());
        for i in 0..tets.n_tets() {
            for r in 0..model.n_reactions() {
                comprej.update(r, i, model.compute_propensity(r, i, &tets))?;
            }
        }

        info!(
            "loaded mesh and model: {} tetrahedra, {} species, {} reactions",
            tets.n_tets(),
            model.n_species(),
            model.n_reactions()
        );
        let n_tets = tets.n_tets();
        self.sim = Some(SimState {
            tets,
            model,
            comprej,
            fired: Vec::new(),
            touched: TouchedTets::with_capacity(n_tets),
        });
        self.elapsed = 0.0;
        Ok(())
    }

    fn sim(&self) -> Result<&SimState> {
        self.sim
            .as_ref()
            .ok_or_else(|| SolverError::InvalidArgument("no mesh and model loaded".into()))
    }

    /// Operator-split window: 1 / (max diffusion coefficient * max shape
    /// sum). Infinite when the mesh supports no diffusive transport.
    pub fn tau(&self) -> Result<f64> {
        let sim = self.sim()?;
        let rate = sim.model.max_diffusion_coeff() * sim.tets.max_shape_sum();
        Ok(if rate > 0.0 { 1.0 / rate } else { f64::INFINITY })
    }

    pub fn count(&self, s: usize, i: usize) -> Result<i32> {
        let sim = self.sim()?;
        if s >= sim.tets.n_species() || i >= sim.tets.n_tets() {
            return Err(SolverError::InvalidArgument(format!(
                "count index (species {}, tet {}) out of range",
                s, i
            )));
        }
        Ok(sim.tets.molecule_count(s, i))
    }

    pub fn total_count(&self, s: usize) -> Result<i64> {
        let sim = self.sim()?;
        if s >= sim.tets.n_species() {
            return Err(SolverError::InvalidArgument(format!(
                "species index {} out of range",
                s
            )));
        }
        Ok(sim.tets.total_count(s))
    }

    pub fn n_tets(&self) -> Result<usize> {
        Ok(self.sim()?.tets.n_tets())
    }

    pub fn n_species(&self) -> Result<usize> {
        Ok(self.sim()?.tets.n_species())
    }

    /// Simulated time accumulated over completed periods.
    pub fn elapsed_time(&self) -> f64 {
        self.elapsed
    }

    /// Self-check: recompute every propensity from the current state and
    /// compare it with the stored index.
    pub fn check_propensities(&self) -> Result<()> {
        let sim = self.sim()?;
        for r in 0..sim.model.n_reactions() {
            for i in 0..sim.tets.n_tets() {
                let stored = sim.comprej.value(r, i);
                let fresh = sim.model.compute_propensity(r, i, &sim.tets);
                if (stored - fresh).abs() > TOTAL_PROPENSITY_REL_TOL * fresh.max(1.0) {
                    return Err(SolverError::Sampling(format!(
                        "stored propensity a[{}, {}] = {} diverged from recomputed {}",
                        r, i, stored, fresh
                    )));
                }
            }
        }
        Ok(())
    }

    /// Advance one operator-split window: SSA reactions over [0, tau), then
    /// one binomial diffusion sweep per species, then the occupancy reset.
    pub fn run_period(&mut self, tau: f64) -> Result<()> {
        if !tau.is_finite() || tau <= 0.0 {
            return Err(SolverError::InvalidArgument(format!(
                "update period must be positive and finite, got {}",
                tau
            )));
        }
        let sim = self
            .sim
            .as_mut()
            .ok_or_else(|| SolverError::InvalidArgument("no mesh and model loaded".into()))?;
        Self::run_reactions(&mut self.rng, sim, tau)?;
        Self::run_diffusions(&mut self.rng, sim, tau)?;
        Self::zero_occupancies(sim);
        if sim.comprej.reconcile(TOTAL_PROPENSITY_REL_TOL) {
            warn!("total propensity drifted beyond tolerance; group sums rebuilt");
        }
        self.elapsed += tau;
        debug!(
            "completed period: tau={:.5e} reaction_events={} elapsed={:.5e}",
            tau,
            sim.fired.len(),
            self.elapsed
        );
        Ok(())
    }

    // Exact SSA over [0, tau): exponential waiting times from the total
    // propensity, event selection through the composition-rejection index.
    fn run_reactions(rng: &mut Mt19937, sim: &mut SimState, tau: f64) -> Result<()> {
        let SimState {
            tets,
            model,
            comprej,
            fired,
            ..
        } = sim;
        fired.clear();
        let mut elapsed = 0.0;
        loop {
            let a0 = comprej.total();
            if a0 <= 0.0 {
                break;
            }
            let mut u = draw_uniform(rng);
            while u <= 0.0 {
                u = draw_uniform(rng);
            }
            let dt = -u.ln() / a0;
            if elapsed + dt > tau {
                break;
            }
            elapsed += dt;
            let Some((r, i)) = comprej.sample(rng) else {
                break;
            };
            // Fold the flat segment since the last update into the occupancy
            // integral before the counts change.
            for &s in model.update_species(r) {
                let count = tets.molecule_count(s, i) as f64;
                *tets.occupancy_mut(s, i) += count * (elapsed - tets.occupancy_time(s, i));
                *tets.occupancy_time_mut(s, i) = elapsed;
            }
            model.apply_reaction(r, i, tets)?;
            for &dep in model.reaction_dependencies(r) {
                comprej.update(dep, i, model.compute_propensity(dep, i, tets))?;
            }
            fired.push((r, i));
        }
        Ok(())
    }

    // One binomial diffusion sweep per species. Outgoing molecules are drawn
    // against the occupancy-averaged count, split over the neighbor slots
    // with conditional binomials, and staged in buckets until the sweep for
    // this species is complete.
    fn run_diffusions(rng: &mut Mt19937, sim: &mut SimState, tau: f64) -> Result<()> {
        let SimState {
            tets,
            model,
            comprej,
            touched,
            ..
        } = sim;

        fn route(
            tets: &mut TetMesh,
            touched: &mut TouchedTets,
            s: usize,
            i: usize,
            j: usize,
            k: i32,
        ) {
            if k == 0 {
                return;
            }
            let nb = tets.neighbor(i, j);
            if nb >= 0 {
                tets.add_to_bucket(i, j, k);
                touched.insert(nb as usize);
            } else {
                // Boundary slot: the molecules stay put.
                *tets.molecule_count_mut(s, i) += k;
            }
        }

        for s in 0..tets.n_species() {
            let d = model.diffusion_coeff(s);
            if d <= 0.0 {
                continue;
            }
            touched.clear();
            for i in 0..tets.n_tets() {
                let shape_sum = tets.shape_sum(i);
                if shape_sum <= 0.0 {
                    continue;
                }
                let count = tets.molecule_count(s, i);
                let zeta = d * shape_sum * tau;
                let n_avg = (tets.occupancy(s, i)
                    + (tau - tets.occupancy_time(s, i)) * count as f64)
                    / tau;
                let n_max = rand_round(n_avg, rng).min(count);
                if n_max <= 0 {
                    continue;
                }
                let n_out = binomial(n_max, zeta, rng);
                if n_out == 0 {
                    continue;
                }
                *tets.molecule_count_mut(s, i) -= n_out;
                touched.insert(i);

                let mut remaining_shape = shape_sum;
                let mut left = n_out;
                for j in 0..NEIGHBORS_PER_TET - 1 {
                    let shape = tets.shape(i, j);
                    let p = if remaining_shape > 0.0 {
                        shape / remaining_shape
                    } else {
                        0.0
                    };
                    let k = binomial(left, p, rng);
                    left -= k;
                    remaining_shape -= shape;
                    route(tets, touched, s, i, j, k);
                }
                // The last direction absorbs whatever is left.
                route(tets, touched, s, i, NEIGHBORS_PER_TET - 1, left);
            }
            tets.flush_buckets(s);
            for &i in &touched.items {
                for &dep in model.diffusion_dependencies(s) {
                    comprej.update(dep, i, model.compute_propensity(dep, i, tets))?;
                }
            }
        }
        Ok(())
    }

    // Occupancy integrals only accumulate in tets where a reaction fired, so
    // resetting the fired pairs returns every counter to zero for the next
    // period.
    fn zero_occupancies(sim: &mut SimState) {
        let SimState {
            tets, model, fired, ..
        } = sim;
        for &(r, i) in fired.iter() {
            for &s in model.update_species(r) {
                *tets.occupancy_mut(s, i) = 0.0;
                *tets.occupancy_time_mut(s, i) = 0.0;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Ensemble of independent solver instances
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct EnsembleOptions {
    pub n_instances: usize,
    pub n_periods: usize,
    /// Update period per step; defaults to each solver's computed tau.
    pub period: Option<f64>,
    pub seed: Option<u64>,
    pub n_threads: Option<usize>,
    pub solver: SolverOptions,
}

impl Default for EnsembleOptions {
    fn default() -> Self {
        Self {
            n_instances: 1,
            n_periods: 1,
            period: None,
            seed: None,
            n_threads: None,
            solver: SolverOptions::default(),
        }
    }
}

/// Final molecule counts of every instance, instance-major.
pub struct EnsembleResult {
    data: Vec<i32>,
    n_instances: usize,
    n_species: usize,
    n_tets: usize,
}

impl EnsembleResult {
    #[inline]
    pub fn count(&self, instance: usize, s: usize, i: usize) -> i32 {
        debug_assert!(instance < self.n_instances && s < self.n_species && i < self.n_tets);
        self.data[(instance * self.n_species + s) * self.n_tets + i]
    }

    pub fn data(&self) -> &[i32] {
        &self.data
    }

    pub fn n_instances(&self) -> usize {
        self.n_instances
    }

    pub fn n_species(&self) -> usize {
        self.n_species
    }

    pub fn n_tets(&self) -> usize {
        self.n_tets
    }
}

/// Run independent solver instances over the same mesh and model, each with
/// a seed derived from the base seed, in parallel.
pub fn run_ensemble<P: AsRef<Path>>(
    mesh_path: P,
    model_path: P,
    options: &EnsembleOptions,
) -> Result<EnsembleResult> {
    let mesh_text = fs::read_to_string(mesh_path)?;
    let model_text = fs::read_to_string(model_path)?;
    run_ensemble_from_str(&mesh_text, &model_text, options)
}

pub fn run_ensemble_from_str(
    mesh_text: &str,
    model_text: &str,
    options: &EnsembleOptions,
) -> Result<EnsembleResult> {
    if options.n_instances == 0 {
        return Err(SolverError::InvalidArgument(
            "number of instances must be greater than zero".into(),
        ));
    }
    if options.n_periods == 0 {
        return Err(SolverError::InvalidArgument(
            "number of periods must be greater than zero".into(),
        ));
    }
    // Probe the inputs once so malformed files fail before the fan-out and
    // the result buffer can be sized up front.
    let geometry = parse_mesh(mesh_text)?;
    let parsed = parse_model(model_text)?;
    let n_tets = geometry.volumes.len();
    let n_species = parsed.species.len();
    if n_tets == 0 || n_species == 0 {
        return Err(SolverError::Shape(
            "mesh and model must declare at least one tetrahedron and one species".into(),
        ));
    }
    let stride = n_species * n_tets;

    let mut data = vec![0i32; options.n_instances * stride];
    let simulate = |data: &mut Vec<i32>| -> Result<()> {
        data.par_chunks_mut(stride)
            .enumerate()
            .try_for_each(|(instance, chunk)| {
                let seed = derive_seed(options.seed, instance as u64) as u32;
                let mut solver = RdSolver::with_options(seed, options.solver);
                solver.load_from_str(mesh_text, model_text)?;
                let tau = match options.period {
                    Some(tau) => tau,
                    None => {
                        let tau = solver.tau()?;
                        if !tau.is_finite() {
                            return Err(SolverError::InvalidArgument(
                                "mesh supports no diffusive transport; set an explicit period"
                                    .into(),
                            ));
                        }
                        tau
                    }
                };
                for _ in 0..options.n_periods {
                    solver.run_period(tau)?;
                }
                let sim = solver.sim()?;
                chunk.copy_from_slice(&sim.tets.mol_counts);
                Ok(())
            })
    };

    match options.n_threads {
        Some(n) => ThreadPoolBuilder::new()
            .num_threads(n)
            .build()
            .map_err(|e| SolverError::ThreadPool(e.to_string()))?
            .install(|| simulate(&mut data))?,
        None => simulate(&mut data)?,
    }

    Ok(EnsembleResult {
        data,
        n_instances: options.n_instances,
        n_species,
        n_tets,
    })
}
