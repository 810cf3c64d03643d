//! Orthographic volume rendering, partitioned by frames.
//!
//! Each frame rotates the volume about one axis, sums it along the depth
//! axis, stretches the sum onto `0..=255` and smooths it. Frames are
//! independent, so a frame is the indivisible unit: every rank renders a
//! contiguous run of frames and the pixels are gathered on the coordinator.
//!
//! The schedule spends the first third of the frames turning about `x`, the
//! second about `y` and the last about `z`, each through `6π·frame/frames`.

use std::f64::consts::PI;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::collective::{agree_partition, Collective};
use crate::error::{PdcrError, Result};
use crate::runner::{run_worker_in_place, ComputeError, WorkerContext};

use super::contrast::GrayFrame;

/// 8-bit voxels, indexed `(z * height + y) * width + x`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    width: usize,
    height: usize,
    depth: usize,
    voxels: Vec<u8>,
}

impl Volume {
    pub fn new(width: usize, height: usize, depth: usize, voxels: Vec<u8>) -> Result<Self> {
        if width == 0 || height == 0 || depth == 0 {
            return Err(PdcrError::invalid_domain(format!(
                "volume of {width}x{height}x{depth} is empty"
            )));
        }
        let cells = width.checked_mul(height).and_then(|plane| plane.checked_mul(depth));
        if cells != Some(voxels.len()) {
            return Err(PdcrError::invalid_domain(format!(
                "{} voxels do not fill a {width}x{height}x{depth} volume",
                voxels.len()
            )));
        }
        Ok(Self {
            width,
            height,
            depth,
            voxels,
        })
    }

    /// Parses a VOX file: the header `D3 <width> <height> <depth> 255`, one
    /// whitespace byte, then the voxels slice by slice.
    pub fn from_vox(data: &[u8]) -> Result<Self> {
        let mut pos = 0;
        let mut field = |name: &str| {
            next_token(data, &mut pos).ok_or_else(|| {
                PdcrError::invalid_domain(format!("VOX header is missing the {name}"))
            })
        };

        if field("magic number")? != "D3" {
            return Err(PdcrError::invalid_domain("not a VOX file (expected D3)"));
        }
        let mut dims = [0usize; 3];
        for (dim, name) in dims.iter_mut().zip(["width", "height", "depth"]) {
            *dim = field(name)?
                .parse()
                .map_err(|_| PdcrError::invalid_domain(format!("VOX {name} is not a number")))?;
        }
        if field("maximum value")? != "255" {
            return Err(PdcrError::invalid_domain("VOX maximum value must be 255"));
        }

        let voxels = data.get(pos + 1..).unwrap_or_default().to_vec();
        let [width, height, depth] = dims;
        Self::new(width, height, depth, voxels)
    }

    /// A ball with a brighter block beside it, so every rotation shows.
    pub fn phantom(size: usize) -> Result<Self> {
        let centre = size as f64 / 2.0;
        let radius = size as f64 / 3.0;
        let block = size / 8..size / 4 + 1;

        let mut voxels = Vec::with_capacity(size * size * size);
        for z in 0..size {
            for y in 0..size {
                for x in 0..size {
                    let offset = [x, y, z].map(|c| c as f64 + 0.5 - centre);
                    let inside = offset.iter().map(|c| c * c).sum::<f64>() <= radius * radius;
                    let value = if block.contains(&x) && block.contains(&y) {
                        250
                    } else if inside {
                        100
                    } else {
                        0
                    };
                    voxels.push(value);
                }
            }
        }
        Self::new(size, size, size, voxels)
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    fn plane(&self) -> usize {
        self.width * self.height
    }

    fn at(&self, z: usize, y: usize, x: usize) -> usize {
        (z * self.height + y) * self.width + x
    }

    /// Rotates about `x`, then `y`, then `z`, truncating coordinates to whole
    /// voxels after every step. Voxels rotated out of the box are dropped.
    pub fn rotated(&self, rx: f64, ry: f64, rz: f64) -> Vec<u8> {
        let (w, h, d) = (self.width as i64, self.height as i64, self.depth as i64);
        let (sinx, cosx) = rx.sin_cos();
        let (siny, cosy) = ry.sin_cos();
        let (sinz, cosz) = rz.sin_cos();

        let mut rotated = vec![0u8; self.voxels.len()];
        for z in 0..self.depth {
            for y in 0..self.height {
                for x in 0..self.width {
                    let (xi, yi, zi) = (y as i64 - h / 2, x as i64 - w / 2, z as i64 - d / 2);

                    let (yf, zf) = (yi as f64, zi as f64);
                    let (yi, zi) = ((yf * cosx + zf * sinx) as i64, (zf * cosx - yf * sinx) as i64);

                    let (xf, zf) = (xi as f64, zi as f64);
                    let (xi, zi) = ((xf * cosy + zf * siny) as i64, (zf * cosy - xf * siny) as i64);

                    let (xf, yf) = (xi as f64, yi as f64);
                    let row = (xf * cosz + yf * sinz + (h / 2) as f64) as i64;
                    let col = (yf * cosz - xf * sinz + (w / 2) as f64) as i64;
                    let slice = zi + d / 2;

                    if (0..h).contains(&row) && (0..w).contains(&col) && (0..d).contains(&slice) {
                        let to = self.at(slice as usize, row as usize, col as usize);
                        rotated[to] = self.voxels[self.at(z, y, x)];
                    }
                }
            }
        }
        rotated
    }
}

fn next_token<'a>(data: &'a [u8], pos: &mut usize) -> Option<&'a str> {
    while data.get(*pos).is_some_and(u8::is_ascii_whitespace) {
        *pos += 1;
    }
    let start = *pos;
    while data.get(*pos).is_some_and(|b| !b.is_ascii_whitespace()) {
        *pos += 1;
    }
    std::str::from_utf8(&data[start..*pos]).ok().filter(|token| !token.is_empty())
}

/// Rotation angles `(x, y, z)` for `frame` out of `frames`.
pub fn rotation(frame: usize, frames: usize) -> (f64, f64, f64) {
    let frames = frames.max(1);
    let angle = 6.0 * PI * frame as f64 / frames as f64;
    match 3 * frame / frames {
        0 => (angle, 0.0, 0.0),
        1 => (0.0, angle, 0.0),
        _ => (0.0, 0.0, angle),
    }
}

/// Sums `voxels` along the depth axis and stretches the sums onto
/// `0..=255`. A flat projection is all zeros.
pub fn project(voxels: &[u8], plane: usize) -> Vec<u8> {
    if plane == 0 {
        return Vec::new();
    }
    let mut sums = vec![0u64; plane];
    for slice in voxels.chunks(plane) {
        for (sum, &v) in sums.iter_mut().zip(slice) {
            *sum += u64::from(v);
        }
    }

    let min = sums.iter().copied().min().unwrap_or_default();
    let max = sums.iter().copied().max().unwrap_or_default();
    sums.iter()
        .map(|&s| if max > min { ((s - min) * 255 / (max - min)) as u8 } else { 0 })
        .collect()
}

/// Replaces each pixel with the mean of the non-zero pixels in its 3x3
/// neighbourhood, itself included.
pub fn smooth(image: &[u8], width: usize, height: usize) -> Vec<u8> {
    let mut out = vec![0u8; image.len()];
    for row in 0..height {
        for col in 0..width {
            let (mut sum, mut count) = (0u32, 0u32);
            for r in row.saturating_sub(1)..=(row + 1).min(height - 1) {
                for c in col.saturating_sub(1)..=(col + 1).min(width - 1) {
                    let v = image[r * width + c];
                    if v != 0 {
                        sum += u32::from(v);
                        count += 1;
                    }
                }
            }
            out[row * width + col] = if count == 0 { 0 } else { (sum / count) as u8 };
        }
    }
    out
}

/// One finished frame, `width * height` pixels.
pub fn render_frame(volume: &Volume, frame: usize, frames: usize) -> Vec<u8> {
    let (rx, ry, rz) = rotation(frame, frames);
    let image = project(&volume.rotated(rx, ry, rz), volume.plane());
    smooth(&image, volume.width, volume.height)
}

/// Renders `frames` frames of the coordinator's volume across every rank of
/// `comm`. Only the coordinator returns the frames, in order.
pub fn render<C: Collective>(
    comm: &mut C,
    volume: Option<&Volume>,
    frames: usize,
) -> Result<Option<Vec<GrayFrame>>> {
    let shared = comm.is_coordinator().then(|| volume.cloned());
    let volume = comm
        .broadcast(shared)?
        .ok_or_else(|| PdcrError::invalid_domain("the coordinator must supply the volume"))?;

    let proposed = comm.is_coordinator().then_some(frames);
    let frame_spans = agree_partition(comm, proposed)?;
    let total = frame_spans.extent();
    let plane = volume.plane();
    let pixels = frame_spans.scaled(plane);

    let ctx = WorkerContext::new(&pixels, comm.rank())?;
    let mut local = vec![0u8; ctx.span().len];
    let kernel = |ctx: &WorkerContext, cells: &mut [u8]| -> Result<(), ComputeError> {
        let first = ctx.span().offset / plane;
        for (k, image) in cells.chunks_mut(plane).enumerate() {
            image.copy_from_slice(&render_frame(&volume, first + k, total));
        }
        Ok(())
    };
    run_worker_in_place(&kernel, &ctx, &mut local)?;
    debug!("rank {} rendered frames {:?}", comm.rank(), frame_spans.span(comm.rank())?);

    match comm.gather(&local, &pixels)? {
        Some(all) => {
            let rendered = all
                .chunks(plane)
                .map(|image| GrayFrame::new(volume.width, volume.height, image.to_vec()))
                .collect::<Result<Vec<_>>>()?;
            info!(
                "rendered {total} frames of a {}x{}x{} volume",
                volume.width, volume.height, volume.depth
            );
            Ok(Some(rendered))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::run_local;
    use crate::shared::ThreadGroup;

    fn sequential(volume: &Volume, frames: usize) -> Vec<Vec<u8>> {
        (0..frames).map(|frame| render_frame(volume, frame, frames)).collect()
    }

    #[test]
    fn vox_header_and_voxels_are_parsed() {
        let mut data = b"D3\n2 3 2\n255\n".to_vec();
        data.extend(0..12u8);
        let volume = Volume::from_vox(&data).unwrap();
        assert_eq!((volume.width(), volume.height(), volume.depth()), (2, 3, 2));
        assert_eq!(volume.voxels[volume.at(1, 2, 1)], 11);
    }

    #[test]
    fn vox_rejects_bad_input() {
        assert!(Volume::from_vox(b"P5\n2 2 2\n255\n").is_err());
        assert!(Volume::from_vox(b"D3\n2 two 2\n255\n").is_err());
        let mut short = b"D3\n2 2 2\n255\n".to_vec();
        short.extend([1, 2, 3]);
        assert!(matches!(Volume::from_vox(&short), Err(PdcrError::InvalidDomain(_))));
        assert!(Volume::new(0, 2, 2, Vec::new()).is_err());
    }

    #[test]
    fn rotation_schedule_turns_one_axis_per_third() {
        assert_eq!(rotation(0, 6), (0.0, 0.0, 0.0));
        let (rx, ry, rz) = rotation(1, 6);
        assert!((rx - PI).abs() < 1e-12 && ry == 0.0 && rz == 0.0);
        let (rx, ry, rz) = rotation(3, 6);
        assert!(rx == 0.0 && (ry - 3.0 * PI).abs() < 1e-12 && rz == 0.0);
        let (rx, ry, rz) = rotation(5, 6);
        assert!(rx == 0.0 && ry == 0.0 && (rz - 5.0 * PI).abs() < 1e-12);
    }

    #[test]
    fn zero_rotation_keeps_the_volume() {
        let volume = Volume::phantom(9).unwrap();
        assert_eq!(volume.rotated(0.0, 0.0, 0.0), volume.voxels);
    }

    #[test]
    fn projection_stretches_depth_sums() {
        // Two 2x1 slices: sums are 10 and 30.
        assert_eq!(project(&[4, 10, 6, 20], 2), vec![0, 255]);
        assert_eq!(project(&[7, 7, 7, 7], 2), vec![0, 0]);
    }

    #[test]
    fn smoothing_averages_non_zero_neighbours() {
        let image = [0, 0, 0, 0, 90, 0, 0, 0, 30];
        let smoothed = smooth(&image, 3, 3);
        assert_eq!(smoothed[0], 90);
        assert_eq!(smoothed[4], 60);
        assert_eq!(smoothed[8], 60);
    }

    #[test]
    fn distributed_frames_match_sequential() {
        let volume = Volume::phantom(10).unwrap();
        let expected = sequential(&volume, 7);

        for workers in [1, 3] {
            let results = ThreadGroup::new(workers)
                .unwrap()
                .run(|m| {
                    let input = m.is_coordinator().then_some(&volume);
                    render(m, input, 7)
                })
                .unwrap();
            let frames = results[0].as_ref().unwrap();
            let pixels: Vec<Vec<u8>> = frames.iter().map(|f| f.pixels().to_vec()).collect();
            assert_eq!(pixels, expected, "{workers} workers");
            assert!(results[1..].iter().all(Option::is_none));
        }

        let results = run_local(4, |c| {
            let input = c.is_coordinator().then_some(&volume);
            render(c, input, 7)
        })
        .unwrap();
        let frames = results[0].as_ref().unwrap();
        assert_eq!(frames.len(), 7);
        assert!(frames.iter().all(|f| (f.width(), f.height()) == (10, 10)));
        assert_eq!(frames[6].pixels(), expected[6].as_slice());
    }

    #[test]
    fn more_ranks_than_frames() {
        let volume = Volume::phantom(6).unwrap();
        let results = run_local(5, |c| {
            let input = c.is_coordinator().then_some(&volume);
            render(c, input, 2)
        })
        .unwrap();
        assert_eq!(results[0].as_ref().map(Vec::len), Some(2));
    }

    #[test]
    fn coordinator_must_supply_the_volume() {
        let err = ThreadGroup::new(2)
            .unwrap()
            .run(|m| render(m, None, 3))
            .unwrap_err();
        assert!(matches!(err, PdcrError::InvalidDomain(_)));
    }
}
