use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use irisreg_core::gallery::{EyeSide, GalleryEntry, GalleryPayload};
use irisreg_core::matcher::plaintext::PlaintextMatcher;
use uuid::Uuid;

fn sample_template(seed: u8) -> irisreg_core::codec::IrisTemplate {
    use irisreg_core::codec::CodeGrid;
    let bits: Vec<u8> = (0..(16 * 256 * 2)).map(|i| ((i as u8).wrapping_add(seed) % 2)).collect();
    let mask = vec![1u8; 16 * 256 * 2];
    irisreg_core::codec::IrisTemplate {
        iris_codes: vec![CodeGrid::new(16, 256, 2, bits).unwrap()],
        mask_codes: vec![CodeGrid::new(16, 256, 2, mask).unwrap()],
    }
}

fn gallery_entry(seed: u8) -> GalleryEntry {
    GalleryEntry {
        identity_id: Uuid::new_v4(),
        template_id: Uuid::new_v4(),
        identity_name: "bench".into(),
        eye_side: EyeSide::Left,
        payload: GalleryPayload::Plain(sample_template(seed)),
    }
}

fn single_pair_distance_benchmarks(c: &mut Criterion) {
    let matcher = PlaintextMatcher::new(15, 0.45 * 8192.0, 5e-5);
    let probe = sample_template(1);
    let gallery = sample_template(2);

    let mut group = c.benchmark_group("plaintext_distance_single_pair");
    group.bench_function("rotation_shift_15", |b| {
        b.iter(|| {
            let d = matcher.distance(&probe, &gallery).unwrap();
            criterion::black_box(d)
        });
    });
    group.finish();
}

fn one_to_n_benchmarks(c: &mut Criterion) {
    let matcher = PlaintextMatcher::new(15, 0.45 * 8192.0, 5e-5);
    let probe = sample_template(1);

    let mut group = c.benchmark_group("plaintext_match_1n");
    for gallery_size in [1usize, 10, 100] {
        let snapshot: Vec<GalleryEntry> = (0..gallery_size).map(|i| gallery_entry(i as u8)).collect();
        group.bench_with_input(BenchmarkId::from_parameter(gallery_size), &snapshot, |b, snap| {
            b.iter(|| {
                let outcome = matcher.match_1n(&probe, snap, 0.39);
                criterion::black_box(outcome)
            });
        });
    }
    group.finish();
}

criterion_group!(matcher, single_pair_distance_benchmarks, one_to_n_benchmarks);
criterion_main!(matcher);
