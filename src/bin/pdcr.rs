//! Command-line driver for the partition/compute/recombine engine.
//!
//! Usage:
//! ```text
//! pdcr --workers 4 increment --extent 12
//! pdcr --mode local primes --from 1 --to 1000000
//! pdcr contrast --input in.pgm --output out.pgm
//! pdcr --mode tcp --workers 3 --address 0.0.0.0:7070 wave --size 300 --output-dir frames
//! pdcr --mode local --workers 8 render --input head.vox --output-dir frames
//! pdcr --mode tcp --address 10.0.0.5:7070 worker      # on each worker host
//! ```

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use log::info;
use serde_json::json;

use domain_decomposition::comm::{run_local, Communicator, TcpTransport};
use domain_decomposition::workloads::{
    self, contrast, GrayFrame, Job, JobInput, JobOutput, Volume, WaveParams,
};
use domain_decomposition::{
    elementwise, partition, Collective, EngineConfig, Mode, SharedRound, ThreadGroup,
};

#[derive(Parser, Debug)]
#[command(
    name = "pdcr",
    author,
    version,
    about = "Partition, distribute, compute, recombine",
    long_about = None
)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Number of workers (ranks), including the coordinator
    #[arg(short, long, global = true)]
    workers: Option<usize>,

    /// Backend that runs the round
    #[arg(long, global = true, value_enum)]
    mode: Option<Mode>,

    /// Coordinator address in tcp mode
    #[arg(long, global = true)]
    address: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the spans a domain splits into
    Partition {
        #[arg(long)]
        extent: usize,
        /// Also report which rank owns this global index
        #[arg(long)]
        index: Option<usize>,
    },

    /// Add one to every element of 1..=extent
    Increment {
        #[arg(long, default_value_t = 12)]
        extent: usize,
    },

    /// Count the primes in [from, to]
    Primes {
        #[arg(long, default_value_t = 1)]
        from: u64,
        #[arg(long)]
        to: u64,
    },

    /// Stretch the contrast of a grey image (PGM, PNG, ...)
    Contrast {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
        #[arg(long, default_value_t = 0)]
        low: u8,
        #[arg(long, default_value_t = 255)]
        high: u8,
    },

    /// Simulate the 2-D wave equation
    Wave {
        #[arg(long, default_value_t = 300)]
        size: usize,
        #[arg(long, default_value_t = 100)]
        frames: usize,
        #[arg(long, default_value_t = 10)]
        sources: usize,
        #[arg(long, default_value_t = 0.1)]
        dt: f32,
        #[arg(long, default_value_t = 0.1)]
        dx: f32,
        #[arg(long, default_value_t = 0.5)]
        speed: f32,
        #[arg(long, default_value_t = 0)]
        seed: u64,
        /// Directory to write every frame to as frameNNNN.png
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },

    /// Render rotating views of a volume, one frame per unit of work
    Render {
        /// VOX volume file; a generated phantom is used when absent
        #[arg(long)]
        input: Option<PathBuf>,
        /// Side of the generated phantom
        #[arg(long, default_value_t = 64)]
        phantom: usize,
        #[arg(long, default_value_t = 360)]
        frames: usize,
        /// Directory to write the frames to as frameNNNN.png
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },

    /// Join a tcp round as a worker and run whatever the coordinator sends
    Worker,
}

fn load_config(cli: &Cli) -> anyhow::Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    if let Some(mode) = cli.mode {
        config.mode = mode;
    }
    if let Some(address) = &cli.address {
        config.tcp.address = address.clone();
    }
    config.validate()?;
    Ok(config)
}

/// Threads mode: zero-copy rounds where the workload has one, a thread
/// group otherwise.
fn run_threads(
    config: &EngineConfig,
    job: &Job,
    input: Option<JobInput>,
) -> anyhow::Result<Option<JobOutput>> {
    match (job, input) {
        (Job::Increment, Some(JobInput::Buffer(buffer))) => {
            let round = SharedRound::new(partition(buffer.len(), config.workers)?)?;
            let mut output = vec![0i64; buffer.len()];
            round.scatter_compute(
                &buffer,
                &mut output,
                elementwise(|x: &i64| x.checked_add(1).ok_or_else(|| format!("{x} + 1 overflows"))),
            )?;
            Ok(Some(JobOutput::Buffer(output)))
        }
        (Job::Contrast { low, high }, Some(JobInput::Frame(mut frame))) => {
            contrast::stretch_shared(&mut frame, *low, *high, config.workers)?;
            Ok(Some(JobOutput::Frame(frame)))
        }
        (job, input) => {
            let group = ThreadGroup::new(config.workers)?;
            let mut outputs = group.run(|m| {
                let input = m.is_coordinator().then_some(input.as_ref()).flatten();
                workloads::execute(m, job, input)
            })?;
            Ok(outputs.swap_remove(0))
        }
    }
}

fn run_job(config: &EngineConfig, job: Job, input: Option<JobInput>) -> anyhow::Result<JobOutput> {
    let started = Instant::now();
    info!("running {} in {:?} mode on {} workers", job.name(), config.mode, config.workers);

    let output = match config.mode {
        Mode::Threads => run_threads(config, &job, input)?,
        Mode::Local => {
            let mut outputs = run_local(config.workers, |c| {
                let input = c.is_coordinator().then_some(input.as_ref()).flatten();
                workloads::execute(c, &job, input)
            })?;
            outputs.swap_remove(0)
        }
        Mode::Tcp => {
            let mut comm = Communicator::new(TcpTransport::listen(&config.tcp, config.workers)?);
            comm.run(|c| workloads::coordinate(c, &job, input.as_ref()))?
        }
    };

    info!("{} finished in {:.3?}", job.name(), started.elapsed());
    output.context("the coordinator produced no output")
}

fn write_frames(dir: &Path, frames: Vec<GrayFrame>) -> anyhow::Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("cannot create {}", dir.display()))?;
    let count = frames.len();
    for (index, frame) in frames.into_iter().enumerate() {
        let path = dir.join(format!("frame{index:04}.png"));
        frame
            .into_image()?
            .save(&path)
            .with_context(|| format!("cannot write image {}", path.display()))?;
    }
    info!("wrote {count} frames to {}", dir.display());
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let report = match cli.command {
        Command::Partition { extent, index } => {
            let partition = partition(extent, config.workers)?;
            let owner = match index {
                Some(index) => Some(
                    partition
                        .owner_of(index)
                        .with_context(|| format!("index {index} is outside a domain of {extent}"))?,
                ),
                None => None,
            };
            json!({
                "extent": partition.extent(),
                "workers": partition.workers(),
                "counts": partition.counts(),
                "displacements": partition.displacements(),
                "owner": owner,
            })
        }

        Command::Worker => {
            if config.mode != Mode::Tcp {
                bail!("the worker command only joins tcp rounds; pass --mode tcp");
            }
            let mut comm = Communicator::new(TcpTransport::connect(&config.tcp)?);
            let job = comm.run(workloads::serve)?;
            json!({ "rank": comm.rank(), "job": job.name() })
        }

        Command::Increment { extent } => {
            let buffer: Vec<i64> = (1..=extent as i64).collect();
            match run_job(&config, Job::Increment, Some(JobInput::Buffer(buffer)))? {
                JobOutput::Buffer(output) => json!({ "output": output }),
                other => bail!("unexpected output {other:?}"),
            }
        }

        Command::Primes { from, to } => match run_job(&config, Job::Primes { from, to }, None)? {
            JobOutput::Primes(report) => serde_json::to_value(report)?,
            other => bail!("unexpected output {other:?}"),
        },

        Command::Contrast {
            input,
            output,
            low,
            high,
        } => {
            let image = image::open(&input)
                .with_context(|| format!("cannot read image {}", input.display()))?
                .to_luma8();
            let frame = GrayFrame::from(image);
            match run_job(&config, Job::Contrast { low, high }, Some(JobInput::Frame(frame)))? {
                JobOutput::Frame(frame) => {
                    let (width, height) = (frame.width(), frame.height());
                    frame
                        .into_image()?
                        .save(&output)
                        .with_context(|| format!("cannot write image {}", output.display()))?;
                    json!({ "output": output, "width": width, "height": height })
                }
                other => bail!("unexpected output {other:?}"),
            }
        }

        Command::Wave {
            size,
            frames,
            sources,
            dt,
            dx,
            speed,
            seed,
            output_dir,
        } => {
            let params = WaveParams {
                size,
                frames,
                sources,
                dt,
                dx,
                speed,
                seed,
            };
            match run_job(&config, Job::Wave(params), None)? {
                JobOutput::Wave(report) => {
                    if let Some(dir) = &output_dir {
                        write_frames(dir, report.images()?)?;
                    }
                    json!({
                        "size": report.size,
                        "frames": report.frames,
                        "dt": report.dt,
                        "sources": report.sources,
                        "peaks": report.peaks,
                    })
                }
                other => bail!("unexpected output {other:?}"),
            }
        }

        Command::Render {
            input,
            phantom,
            frames,
            output_dir,
        } => {
            let volume = match &input {
                Some(path) => {
                    let data = std::fs::read(path)
                        .with_context(|| format!("cannot read volume {}", path.display()))?;
                    Volume::from_vox(&data)?
                }
                None => Volume::phantom(phantom)?,
            };
            let dims = [volume.width(), volume.height(), volume.depth()];
            match run_job(&config, Job::Render { frames }, Some(JobInput::Volume(volume)))? {
                JobOutput::Frames(rendered) => {
                    let count = rendered.len();
                    if let Some(dir) = &output_dir {
                        write_frames(dir, rendered)?;
                    }
                    json!({ "volume": dims, "frames": count })
                }
                other => bail!("unexpected output {other:?}"),
            }
        }
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
