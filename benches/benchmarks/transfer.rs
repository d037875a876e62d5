use candle_storage::test_utils::CpuDevice;
use candle_storage::{Storage, WithDType};
use criterion::{black_box, criterion_group, Criterion, Throughput};

fn run_transfer_benchmark<T: WithDType>(c: &mut Criterion, name: &str) {
    let dev = CpuDevice::new();
    let size = 1024i64;
    let storage = Storage::<T>::new_with_size(&dev, size).unwrap();
    let mut group = c.benchmark_group("cpu_transfer");
    group.throughput(Throughput::Bytes(T::DTYPE.size_in_bytes() as u64));
    group.bench_function(name, |b| {
        let mut index = 0;
        b.iter(|| {
            storage.set(&dev, index, T::from_f64(1.0)).unwrap();
            black_box(storage.get(&dev, index).unwrap());
            index = (index + 1) % size;
        })
    });
    group.finish();
    storage.free().unwrap();
}

fn criterion_benchmark(c: &mut Criterion) {
    run_transfer_benchmark::<f32>(c, "set_get_f32");
    run_transfer_benchmark::<u8>(c, "set_get_u8");
}

criterion_group!(benches, criterion_benchmark);
