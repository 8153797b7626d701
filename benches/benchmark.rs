// Benchmarks for fingerprinting, pairwise distance and two-stage clustering
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use dedupx_core::cluster::{prefilter, refine};
use dedupx_core::fingerprint;
use dedupx_core::{DistanceEngine, FeatureMetric, FeatureVector, Fingerprint, HammingMetric};
use image::{DynamicImage, Rgb, RgbImage};
use rand::prelude::*;
use rand::rngs::StdRng;

/// Fingerprints clustered around a few centres, so stage 1 finds real groups.
fn generate_fingerprints(n: usize, rng: &mut StdRng) -> Vec<Fingerprint> {
    let centres: Vec<Vec<bool>> = (0..(n / 8).max(1))
        .map(|_| (0..100).map(|_| rng.random::<bool>()).collect())
        .collect();
    (0..n)
        .map(|i| {
            let mut bits = centres[i % centres.len()].clone();
            for _ in 0..rng.random_range(0..6) {
                let at = rng.random_range(0..bits.len());
                bits[at] = !bits[at];
            }
            Fingerprint::from_bits(10, &bits).unwrap()
        })
        .collect()
}

fn generate_vector(dim: usize, rng: &mut StdRng) -> FeatureVector {
    let data: Vec<f32> = (0..dim).map(|_| rng.random_range(-1.0f32..1.0f32)).collect();
    let mut v = FeatureVector::new(data, "bench");
    v.normalize();
    v
}

fn benchmark_fingerprint_compute(c: &mut Criterion) {
    let image = DynamicImage::ImageRgb8(RgbImage::from_fn(640, 480, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
    }));
    let mut group = c.benchmark_group("fingerprint_compute");
    for size in [8u32, 10, 16] {
        group.bench_with_input(BenchmarkId::new("640x480", size), &size, |b, &size| {
            b.iter(|| fingerprint::compute(black_box(&image), size).unwrap());
        });
    }
    group.finish();
}

fn benchmark_pairwise_hamming(c: &mut Criterion) {
    let engine = DistanceEngine::new(4, 6).unwrap();
    let mut rng = StdRng::seed_from_u64(7);
    let mut group = c.benchmark_group("pairwise_hamming");
    for n in [100usize, 1000, 4000] {
        let fps = generate_fingerprints(n, &mut rng);
        group.bench_with_input(BenchmarkId::new("edges_within", n), &fps, |b, fps| {
            b.iter(|| engine.edges_within(black_box(fps), &HammingMetric, 8.0).unwrap());
        });
    }
    group.finish();
}

fn benchmark_two_stage(c: &mut Criterion) {
    let engine = DistanceEngine::new(4, 6).unwrap();
    let mut rng = StdRng::seed_from_u64(11);
    let mut group = c.benchmark_group("two_stage");
    group.sample_size(20);
    for n in [500usize, 2000] {
        let fps = generate_fingerprints(n, &mut rng);
        let vectors: Vec<FeatureVector> = (0..n).map(|_| generate_vector(512, &mut rng)).collect();
        group.bench_with_input(BenchmarkId::new("prefilter_refine", n), &n, |b, _| {
            b.iter(|| {
                let components = prefilter(&engine, &fps, &HammingMetric, 8.0).unwrap();
                let mut groups = 0;
                for component in &components {
                    let members: Vec<FeatureVector> =
                        component.members.iter().map(|&i| vectors[i].clone()).collect();
                    groups += refine(&engine, &component.members, &members, &FeatureMetric::Cosine, 0.5)
                        .unwrap()
                        .len();
                }
                black_box(groups)
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    benchmark_fingerprint_compute,
    benchmark_pairwise_hamming,
    benchmark_two_stage
);
criterion_main!(benches);
