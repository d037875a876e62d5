use candle_storage::test_utils::CpuDevice;
use candle_storage::Storage;
use criterion::{criterion_group, Criterion, Throughput};

fn run_refcount_benchmark(c: &mut Criterion) {
    let dev = CpuDevice::new();
    let storage = Storage::<f32>::new_with_size(&dev, 1024).unwrap();
    let mut group = c.benchmark_group("cpu_refcount");
    group.throughput(Throughput::Elements(1));
    group.bench_function("retain_release", |b| {
        b.iter(|| {
            storage.retain();
            storage.free().unwrap();
        })
    });
    group.bench_function("retain_if_live_release", |b| {
        b.iter(|| {
            assert!(storage.retain_if_live());
            storage.free().unwrap();
        })
    });
    group.finish();
    storage.free().unwrap();
}

fn criterion_benchmark(c: &mut Criterion) {
    run_refcount_benchmark(c);
}

criterion_group!(benches, criterion_benchmark);
