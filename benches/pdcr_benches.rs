use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use domain_decomposition::workloads::contrast::stretch_shared;
use domain_decomposition::workloads::{primes, volume, wave, GrayFrame, Volume, WaveParams};
use domain_decomposition::{
    elementwise, partition, run_local, scatter_compute_gather, Collective, SharedRound,
    ThreadGroup,
};

fn partition_benchmark(c: &mut Criterion) {
    c.bench_function("partition_1m_over_64", |b| {
        b.iter(|| partition(black_box(1_000_003), black_box(64)))
    });
}

fn increment_benchmark(c: &mut Criterion) {
    let input: Vec<i64> = (0..1_000_000).collect();
    let mut group = c.benchmark_group("increment");
    group.throughput(Throughput::Elements(input.len() as u64));

    for workers in [1, 2, 4, 8] {
        group.bench_with_input(BenchmarkId::new("shared", workers), &workers, |b, &workers| {
            let round = SharedRound::new(partition(input.len(), workers).unwrap()).unwrap();
            let mut output = vec![0i64; input.len()];
            b.iter(|| {
                round
                    .scatter_compute(&input, &mut output, elementwise(|x: &i64| Ok(x + 1)))
                    .unwrap()
            })
        });
    }

    group.bench_function("local_4", |b| {
        b.iter(|| {
            run_local(4, |comm| {
                let global = comm.is_coordinator().then_some(input.as_slice());
                scatter_compute_gather(comm, global, elementwise(|x: &i64| Ok(x + 1)))
            })
            .unwrap()
        })
    });

    group.finish();
}

fn workload_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("workloads");
    group.sample_size(10);

    group.bench_function("primes_to_200k_threads_4", |b| {
        let threads = ThreadGroup::new(4).unwrap();
        b.iter(|| threads.run(|m| primes::count(m, 1, black_box(200_000))).unwrap())
    });

    let pixels: Vec<u8> = (0..512 * 512).map(|i| (40 + i % 120) as u8).collect();
    let frame = GrayFrame::new(512, 512, pixels).unwrap();
    group.bench_function("contrast_512_shared_4", |b| {
        b.iter(|| {
            let mut frame = frame.clone();
            stretch_shared(&mut frame, 0, 255, 4).unwrap();
            frame
        })
    });

    let params = WaveParams {
        size: 128,
        frames: 40,
        ..WaveParams::default()
    };
    group.bench_function("wave_128_threads_4", |b| {
        let threads = ThreadGroup::new(4).unwrap();
        b.iter(|| threads.run(|m| wave::simulate(m, &params)).unwrap())
    });

    let phantom = Volume::phantom(32).unwrap();
    group.bench_function("render_32_threads_4", |b| {
        let threads = ThreadGroup::new(4).unwrap();
        b.iter(|| {
            threads
                .run(|m| {
                    let input = m.is_coordinator().then_some(&phantom);
                    volume::render(m, input, 12)
                })
                .unwrap()
        })
    });

    group.finish();
}

criterion_group!(benches, partition_benchmark, increment_benchmark, workload_benchmark);
criterion_main!(benches);
