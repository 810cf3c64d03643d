//! Two-dimensional wave equation on an `N x N` grid.
//!
//! Frames 0 and 1 are flat. Every later frame starts from the source values
//! `sin(t)` and adds the five-point update of the two frames before it:
//!
//! `u[t][i][j] += λ²·(u[t-1][i±1][j] + u[t-1][i][j±1]) + (2 - 4λ²)·u[t-1][i][j] - u[t-2][i][j]`
//!
//! with `λ = speed·dt/dx`. Border cells only ever hold source values. The
//! interior rows are partitioned across ranks and every rank's band is
//! all-gathered after each step, since the next step reads the neighbouring
//! bands.

use log::{info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::collective::{agree_partition, Collective};
use crate::error::{PdcrError, Result};
use crate::runner::{run_worker_in_place, ComputeError, WorkerContext};

use super::contrast::GrayFrame;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaveParams {
    /// Grid cells per side.
    pub size: usize,
    pub frames: usize,
    pub sources: usize,
    pub dt: f32,
    pub dx: f32,
    pub speed: f32,
    /// Seeds the source placement so every run with the same parameters
    /// produces the same frames.
    pub seed: u64,
}

impl Default for WaveParams {
    fn default() -> Self {
        Self {
            size: 300,
            frames: 100,
            sources: 10,
            dt: 0.1,
            dx: 0.1,
            speed: 0.5,
            seed: 0,
        }
    }
}

impl WaveParams {
    pub fn validate(&self) -> Result<()> {
        if self.size < 3 {
            return Err(PdcrError::invalid_domain(format!(
                "grid of size {} has no interior",
                self.size
            )));
        }
        if self.frames < 2 {
            return Err(PdcrError::invalid_domain("at least two frames are needed"));
        }
        for (name, value) in [("dt", self.dt), ("dx", self.dx), ("speed", self.speed)] {
            if !(value.is_finite() && value > 0.0) {
                return Err(PdcrError::invalid_domain(format!(
                    "{name} must be positive, got {value}"
                )));
            }
        }
        Ok(())
    }

    /// The time step actually used: `dt`, lowered to `dx·√2 / (2·speed)`
    /// when `speed·dt/dx` exceeds `√2 / 2`.
    pub fn stable_dt(&self) -> f32 {
        let lambda = self.speed * self.dt / self.dx;
        if lambda > 0.5 * std::f32::consts::SQRT_2 {
            self.dx * std::f32::consts::SQRT_2 / (2.0 * self.speed)
        } else {
            self.dt
        }
    }
}

/// Seeded source positions as `(row, col)`.
pub fn place_sources(size: usize, count: usize, seed: u64) -> Vec<(usize, usize)> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| (rng.gen_range(0..size), rng.gen_range(0..size)))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaveReport {
    pub size: usize,
    pub frames: usize,
    pub dt: f32,
    pub sources: Vec<(usize, usize)>,
    /// Largest absolute amplitude in each frame.
    pub peaks: Vec<f32>,
    /// Row-major cells of every frame, frame 0 first.
    pub history: Vec<Vec<f32>>,
}

impl WaveReport {
    /// Every frame on the grey range, all with one scale. The range is taken
    /// from frame 2 onward; frames 0 and 1 are flat.
    pub fn images(&self) -> Result<Vec<GrayFrame>> {
        let (min, max) = self
            .history
            .iter()
            .skip(2)
            .flatten()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        let range = max - min;

        self.history
            .iter()
            .map(|cells| {
                let pixels = cells
                    .iter()
                    .map(|&v| {
                        if range > 0.0 {
                            ((v - min) / range * 255.0).clamp(0.0, 255.0) as u8
                        } else {
                            0
                        }
                    })
                    .collect();
                GrayFrame::new(self.size, self.size, pixels)
            })
            .collect()
    }
}

fn source_frame(size: usize, sources: &[(usize, usize)], t: f32) -> Vec<f32> {
    let mut frame = vec![0.0; size * size];
    for &(row, col) in sources {
        frame[row * size + col] = t.sin();
    }
    frame
}

/// Runs the simulation on every rank of `comm`. All ranks hold every frame
/// after each step, so every rank returns the same report.
pub fn simulate<C: Collective>(comm: &mut C, params: &WaveParams) -> Result<WaveReport> {
    params.validate()?;
    let size = params.size;
    let dt = params.stable_dt();
    if dt != params.dt && comm.is_coordinator() {
        warn!(
            "speed*dt/dx = {} exceeds sqrt(2)/2, time step lowered from {} to {dt}",
            params.speed * params.dt / params.dx,
            params.dt
        );
    }

    let drawn = comm
        .is_coordinator()
        .then(|| place_sources(size, params.sources, params.seed));
    let sources: Vec<(usize, usize)> = comm.broadcast(drawn)?;
    if let Some(&(row, col)) = sources.iter().find(|&&(row, col)| row >= size || col >= size) {
        return Err(PdcrError::invalid_domain(format!(
            "source ({row}, {col}) lies outside the grid"
        )));
    }

    let proposed = comm.is_coordinator().then_some(size - 2);
    let rows = agree_partition(comm, proposed)?;
    let interior = rows.scaled(size);
    let ctx = WorkerContext::new(&interior, comm.rank())?;
    let band = ctx.span();

    let sq_lambda = (params.speed * dt / params.dx).powi(2);
    let mut before = vec![0.0f32; size * size];
    let mut previous = vec![0.0f32; size * size];
    let mut peaks = vec![0.0f32; 2];
    let mut history = vec![before.clone(), previous.clone()];

    for step in 2..params.frames {
        let mut next = source_frame(size, &sources, step as f32 * dt);

        let kernel = |ctx: &WorkerContext, cells: &mut [f32]| -> Result<(), ComputeError> {
            for (k, cell) in cells.iter_mut().enumerate() {
                // Interior index 0 is the first cell of grid row 1.
                let at = ctx.global_index(k) + size;
                let col = at % size;
                if col == 0 || col == size - 1 {
                    continue;
                }
                let neighbours =
                    previous[at + size] + previous[at - size] + previous[at + 1] + previous[at - 1];
                *cell += sq_lambda * neighbours + (2.0 - 4.0 * sq_lambda) * previous[at]
                    - before[at];
            }
            Ok(())
        };
        let local = &mut next[size + band.offset..size + band.end()];
        run_worker_in_place(&kernel, &ctx, local)?;

        let gathered = comm.all_gather(&next[size + band.offset..size + band.end()], &interior)?;
        next[size..size * (size - 1)].copy_from_slice(&gathered);

        peaks.push(next.iter().fold(0.0f32, |peak, v| peak.max(v.abs())));
        history.push(next.clone());
        before = std::mem::replace(&mut previous, next);
    }

    if comm.is_coordinator() {
        info!(
            "wave of {size}x{size} cells over {} frames, final peak {:.4}",
            params.frames,
            peaks.last().copied().unwrap_or_default()
        );
    }
    Ok(WaveReport {
        size,
        frames: params.frames,
        dt,
        sources,
        peaks,
        history,
    })
}
