//! Performance benchmarks for svmem
//!
//! Run with: cargo bench --package svmem-core

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use svmem_core::{AccessMode, ExportFormat, HostRuntime, RegionFlags, SvmManager};

fn manager() -> SvmManager {
    SvmManager::new(Arc::new(HostRuntime::cpu()))
}

fn bench_allocate_free(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocate_free");

    for size in [64, 4096, 65536, 1048576].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let manager = manager();
            let mut ctx = manager.create_default_context().unwrap();
            b.iter(|| {
                let region = ctx.allocate(size, RegionFlags::FINE_GRAIN).unwrap();
                ctx.free(black_box(region)).unwrap();
            });
            ctx.destroy().unwrap();
        });
    }
    group.finish();
}

fn bench_map_coarse(c: &mut Criterion) {
    let manager = manager();
    let mut ctx = manager.create_default_context().unwrap();
    let coarse = ctx.allocate(4096, RegionFlags::COARSE_GRAIN).unwrap();
    let fine = ctx.allocate(4096, RegionFlags::FINE_GRAIN).unwrap();

    let mut group = c.benchmark_group("with_mapped");
    for (name, region) in [("coarse", coarse), ("fine", fine)] {
        group.bench_function(name, |b| {
            b.iter(|| {
                ctx.with_mapped(region, AccessMode::ReadWrite, |m| {
                    m.as_mut_slice()?[0] = 1;
                    Ok(())
                })
                .unwrap();
            });
        });
    }
    group.finish();

    ctx.free(coarse).unwrap();
    ctx.free(fine).unwrap();
    ctx.destroy().unwrap();
}

fn bench_snapshot(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot");
    group.sample_size(50);

    for live in [0usize, 64, 512].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(live), live, |b, &live| {
            let manager = manager();
            let mut ctx = manager.create_default_context().unwrap();
            let regions: Vec<_> = (0..live)
                .map(|_| ctx.allocate(256, RegionFlags::FINE_GRAIN).unwrap())
                .collect();

            b.iter(|| black_box(manager.snapshot()));

            for region in regions {
                ctx.free(region).unwrap();
            }
            ctx.destroy().unwrap();
        });
    }
    group.finish();
}

fn bench_export(c: &mut Criterion) {
    let manager = manager();
    manager.discover().unwrap();

    c.bench_function("export_json", |b| {
        b.iter(|| black_box(manager.export(ExportFormat::Json).unwrap()));
    });
}

criterion_group!(
    benches,
    bench_allocate_free,
    bench_map_coarse,
    bench_snapshot,
    bench_export
);
criterion_main!(benches);
