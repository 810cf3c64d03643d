//! Contrast stretching of 8-bit grey images, partitioned by rows.

use image::GrayImage;
use log::info;
use serde::{Deserialize, Serialize};

use crate::collective::{agree_partition, Collective};
use crate::error::{PdcrError, Result};
use crate::partition::partition;
use crate::reduce::{self, ReduceOp};
use crate::runner::{run_worker_in_place, ComputeError, WorkerContext};
use crate::shared::SharedRound;

/// Row-major 8-bit grey pixels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrayFrame {
    width: usize,
    height: usize,
    pixels: Vec<u8>,
}

impl GrayFrame {
    pub fn new(width: usize, height: usize, pixels: Vec<u8>) -> Result<Self> {
        if width.checked_mul(height) != Some(pixels.len()) {
            return Err(PdcrError::invalid_domain(format!(
                "{} pixels do not fill a {width}x{height} frame",
                pixels.len()
            )));
        }
        Ok(Self { width, height, pixels })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn into_image(self) -> Result<GrayImage> {
        let (width, height) = (dimension(self.width)?, dimension(self.height)?);
        GrayImage::from_raw(width, height, self.pixels)
            .ok_or_else(|| PdcrError::invalid_domain("pixel buffer does not match the frame size"))
    }
}

impl From<GrayImage> for GrayFrame {
    fn from(image: GrayImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            width: width as usize,
            height: height as usize,
            pixels: image.into_raw(),
        }
    }
}

fn dimension(value: usize) -> Result<u32> {
    u32::try_from(value).map_err(|_| {
        PdcrError::invalid_domain(format!("dimension {value} is too large for an image"))
    })
}

fn check_levels(low: u8, high: u8) -> Result<()> {
    if low > high {
        return Err(PdcrError::invalid_domain(format!(
            "low level {low} is above high level {high}"
        )));
    }
    Ok(())
}

/// Maps `value` from `[min, max]` onto `[low, high]`, truncating. A flat
/// image (`max <= min`) maps to `low`.
pub fn stretch_value(value: u8, min: u8, max: u8, low: u8, high: u8) -> u8 {
    if max <= min {
        return low;
    }
    let span = u32::from(high - low);
    let scaled = u32::from(value.saturating_sub(min)) * span / u32::from(max - min);
    low + scaled.min(span) as u8
}

fn stretch_kernel(
    min: u8,
    max: u8,
    low: u8,
    high: u8,
) -> impl Fn(&WorkerContext, &mut [u8]) -> Result<(), ComputeError> + Sync {
    move |_ctx: &WorkerContext, pixels: &mut [u8]| {
        for (i, pixel) in pixels.iter_mut().enumerate() {
            if *pixel < min || *pixel > max {
                return Err(ComputeError::at(i, format!("pixel {} outside [{min}, {max}]", *pixel)));
            }
            *pixel = stretch_value(*pixel, min, max, low, high);
        }
        Ok(())
    }
}

/// Stretches the coordinator's frame across every rank of `comm`.
///
/// Rows are partitioned; each rank finds its local extremes, the global
/// extremes are all-reduced, and the stretched rows are gathered back. Only
/// the coordinator returns the frame.
pub fn stretch<C: Collective>(
    comm: &mut C,
    frame: Option<&GrayFrame>,
    low: u8,
    high: u8,
) -> Result<Option<GrayFrame>> {
    check_levels(low, high)?;

    let dims = comm.is_coordinator().then(|| frame.map(|f| (f.width, f.height)));
    let (width, height) = comm
        .broadcast(dims)?
        .ok_or_else(|| PdcrError::invalid_domain("the coordinator must supply the frame"))?;

    let proposed = comm.is_coordinator().then_some(height);
    let rows = agree_partition(comm, proposed)?;
    let pixels = rows.scaled(width);
    let mut local = comm.scatter(frame.map(|f| f.pixels.as_slice()), &pixels)?;

    let local_min = reduce::fold(local.iter().copied(), ReduceOp::Min)?;
    let local_max = reduce::fold(local.iter().copied(), ReduceOp::Max)?;
    let min = comm.all_reduce(local_min, ReduceOp::Min)?;
    let max = comm.all_reduce(local_max, ReduceOp::Max)?;

    let ctx = WorkerContext::new(&pixels, comm.rank())?;
    run_worker_in_place(&stretch_kernel(min, max, low, high), &ctx, &mut local)?;

    match comm.gather(&local, &pixels)? {
        Some(stretched) => {
            info!("stretched {width}x{height} frame from [{min}, {max}] to [{low}, {high}]");
            Ok(Some(GrayFrame::new(width, height, stretched)?))
        }
        None => Ok(None),
    }
}

/// Shared-memory variant: the frame is stretched in place by `workers`
/// threads without copying rows.
pub fn stretch_shared(frame: &mut GrayFrame, low: u8, high: u8, workers: usize) -> Result<()> {
    check_levels(low, high)?;

    let pixels = partition(frame.height, workers)?.scaled(frame.width);
    let round = SharedRound::new(pixels)?;
    let min = round.map_reduce(&frame.pixels, ReduceOp::Min, |_ctx: &WorkerContext, chunk: &[u8]| {
        Ok(chunk.iter().copied().min().unwrap_or(u8::MAX))
    })?;
    let max = round.map_reduce(&frame.pixels, ReduceOp::Max, |_ctx: &WorkerContext, chunk: &[u8]| {
        Ok(chunk.iter().copied().max().unwrap_or(u8::MIN))
    })?;

    round.compute_in_place(&mut frame.pixels, stretch_kernel(min, max, low, high))?;
    info!(
        "stretched {}x{} frame from [{min}, {max}] to [{low}, {high}]",
        frame.width, frame.height
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::run_local;
    use crate::shared::ThreadGroup;

    fn gradient() -> GrayFrame {
        // 4 rows of 3, values 50..=105 in steps of 5.
        GrayFrame::new(3, 4, (0..12).map(|i| 50 + 5 * i).collect()).unwrap()
    }

    fn sequential(frame: &GrayFrame, low: u8, high: u8) -> Vec<u8> {
        let min = *frame.pixels.iter().min().unwrap();
        let max = *frame.pixels.iter().max().unwrap();
        frame.pixels.iter().map(|&v| stretch_value(v, min, max, low, high)).collect()
    }

    #[test]
    fn stretch_value_hits_both_ends() {
        assert_eq!(stretch_value(50, 50, 105, 0, 255), 0);
        assert_eq!(stretch_value(105, 50, 105, 0, 255), 255);
        assert_eq!(stretch_value(100, 100, 100, 10, 200), 10);
        assert_eq!(stretch_value(3, 2, 4, 100, 110), 105);
    }

    #[test]
    fn frame_rejects_wrong_pixel_count() {
        assert!(GrayFrame::new(3, 3, vec![0; 8]).is_err());
    }

    #[test]
    fn image_conversion_keeps_pixels() {
        let frame = gradient();
        let image = frame.clone().into_image().unwrap();
        assert_eq!(image.dimensions(), (3, 4));
        assert_eq!(GrayFrame::from(image), frame);
    }

    #[test]
    fn distributed_matches_sequential() {
        let frame = gradient();
        let expected = sequential(&frame, 0, 255);

        let local = run_local(3, |c| {
            let input = c.is_coordinator().then_some(&frame);
            stretch(c, input, 0, 255)
        })
        .unwrap();
        assert_eq!(local[0].as_ref().map(GrayFrame::pixels), Some(expected.as_slice()));

        let threads = ThreadGroup::new(5)
            .unwrap()
            .run(|m| {
                let input = m.is_coordinator().then_some(&frame);
                stretch(m, input, 0, 255)
            })
            .unwrap();
        assert_eq!(threads[0].as_ref().map(GrayFrame::pixels), Some(expected.as_slice()));
    }

    #[test]
    fn shared_matches_sequential() {
        let mut frame = gradient();
        let expected = sequential(&frame, 20, 220);
        stretch_shared(&mut frame, 20, 220, 3).unwrap();
        assert_eq!(frame.pixels(), expected.as_slice());
    }

    #[test]
    fn flat_frame_maps_to_low() {
        let mut frame = GrayFrame::new(2, 2, vec![77; 4]).unwrap();
        stretch_shared(&mut frame, 5, 250, 2).unwrap();
        assert_eq!(frame.pixels(), &[5, 5, 5, 5]);
    }

    #[test]
    fn inverted_levels_are_rejected() {
        let mut frame = gradient();
        assert!(matches!(
            stretch_shared(&mut frame, 200, 100, 2),
            Err(PdcrError::InvalidDomain(_))
        ));
    }
}
