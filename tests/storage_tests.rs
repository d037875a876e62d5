use std::path::Path;
use std::sync::Arc;

use candle_storage::test_utils::{CountingAllocator, CpuDevice, FailingAllocator};
use candle_storage::{
    DType, DeviceAllocator, DeviceContext, Error, Result, Storage, StorageFlags, WithDType,
};
use half::f16;

#[test]
fn empty_storage() -> Result<()> {
    let dev = CpuDevice::new();
    let s = Storage::<f32>::new(&dev)?;
    assert_eq!(s.size(), 0);
    assert!(s.data().is_null());
    assert_eq!(s.dtype(), DType::F32);
    s.free()
}

#[test]
fn sized_storage() -> Result<()> {
    let dev = CpuDevice::new();
    for n in [1i64, 7, 1024] {
        let s = Storage::<f32>::new_with_size(&dev, n)?;
        assert_eq!(s.size(), n);
        assert_eq!(s.element_size(), 4);
        assert!(!s.data().is_null());
        assert_eq!(s.device().ordinal(), 0);
        s.free()?;
    }
    Ok(())
}

#[test]
fn negative_size_is_rejected() {
    let dev = CpuDevice::new();
    assert!(matches!(
        Storage::<f32>::new_with_size(&dev, -1),
        Err(Error::InvalidArgument { .. })
    ));
}

#[test]
fn element_sizes() -> Result<()> {
    let dev = CpuDevice::new();
    let s = Storage::<u8>::new_with_size(&dev, 1)?;
    assert_eq!(s.element_size(), 1);
    assert_eq!(s.dtype(), DType::U8);
    s.free()?;
    let s = Storage::<f16>::new_with_size(&dev, 1)?;
    assert_eq!(s.element_size(), 2);
    assert_eq!(s.dtype(), DType::F16);
    s.free()?;
    let s = Storage::<i64>::new_with_size(&dev, 1)?;
    assert_eq!(s.element_size(), 8);
    assert_eq!(s.dtype(), DType::I64);
    s.free()
}

fn roundtrip<T: WithDType>(dev: &CpuDevice, values: &[T]) -> Result<()> {
    let s = Storage::<T>::new_with_size(dev, values.len() as i64)?;
    for (i, v) in values.iter().enumerate() {
        s.set(dev, i as i64, *v)?;
    }
    for (i, v) in values.iter().enumerate() {
        assert_eq!(s.get(dev, i as i64)?, *v);
    }
    s.free()
}

#[test]
fn set_get_roundtrip() -> Result<()> {
    let dev = CpuDevice::new();
    roundtrip(&dev, &[3u8, 1, 4, 1, 5])?;
    roundtrip(&dev, &[0u32, u32::MAX, 42])?;
    roundtrip(&dev, &[-7i64, 0, i64::MAX])?;
    roundtrip(&dev, &[f16::from_f32(1.5), f16::from_f32(-0.25)])?;
    roundtrip(&dev, &[3.5f32, f32::MIN, f32::MAX])?;
    roundtrip(&dev, &[2.71828f64, -0.0])?;
    Ok(())
}

#[test]
fn randomized_roundtrip() -> Result<()> {
    use rand::Rng;
    let dev = CpuDevice::new();
    let mut rng = rand::thread_rng();
    let values: Vec<f32> = (0..257).map(|_| rng.gen_range(-1e6f32..1e6f32)).collect();
    roundtrip(&dev, &values)
}

#[test]
fn small_constant_storages() -> Result<()> {
    let dev = CpuDevice::new();
    let s = Storage::<f32>::new_with_size1(&dev, 1.0)?;
    assert_eq!(s.size(), 1);
    assert_eq!(s.get(&dev, 0)?, 1.0);
    s.free()?;
    let s = Storage::<f32>::new_with_size2(&dev, 1.0, 2.0)?;
    assert_eq!((s.get(&dev, 0)?, s.get(&dev, 1)?), (1.0, 2.0));
    s.free()?;
    let s = Storage::<u32>::new_with_size3(&dev, 1, 2, 3)?;
    assert_eq!(s.get(&dev, 2)?, 3);
    s.free()?;
    let s = Storage::<f64>::new_with_size4(&dev, 1.0, 2.0, 3.0, 4.0)?;
    for i in 0..4 {
        assert_eq!(s.get(&dev, i)?, (i + 1) as f64);
    }
    s.free()
}

#[test]
fn out_of_range_indexing_leaves_contents_unchanged() -> Result<()> {
    let dev = CpuDevice::new();
    let s = Storage::<u32>::new_with_size3(&dev, 10, 11, 12)?;
    for index in [-1i64, 3, i64::MAX] {
        assert!(matches!(
            s.get(&dev, index),
            Err(Error::IndexOutOfRange { .. })
        ));
        assert!(matches!(
            s.set(&dev, index, 99),
            Err(Error::IndexOutOfRange { .. })
        ));
    }
    assert_eq!(
        (s.get(&dev, 0)?, s.get(&dev, 1)?, s.get(&dev, 2)?),
        (10, 11, 12)
    );
    s.free()?;

    // an empty storage has no valid index at all
    let s = Storage::<u32>::new(&dev)?;
    assert!(matches!(s.get(&dev, 0), Err(Error::IndexOutOfRange { .. })));
    s.free()
}

#[test]
fn mapping_is_unsupported() {
    let dev = CpuDevice::new();
    for (size, shared) in [(0i64, false), (16, true)] {
        assert!(matches!(
            Storage::<f32>::new_with_mapping(&dev, Path::new("/tmp/storage.bin"), size, shared),
            Err(Error::UnsupportedOperation { .. })
        ));
    }
}

#[test]
fn allocation_failure_surfaces_the_status() {
    let dev = CpuDevice::new();
    match Storage::<f32>::new_with_allocator(&dev, 8, Arc::new(FailingAllocator)) {
        Err(Error::AllocationFailure { requested, .. }) => assert_eq!(requested, 32),
        r => panic!("unexpected result: {r:?}"),
    }
}

#[test]
fn wrapped_memory_is_freed_by_default() -> Result<()> {
    let dev = CpuDevice::new();
    let alloc = Arc::new(CountingAllocator::host());
    let stream = dev.current_stream().unwrap();
    let ptr = alloc.malloc(4 * 4, stream).unwrap();
    let s = unsafe {
        Storage::<f32>::new_with_data_and_allocator(&dev, ptr as *mut f32, 4, alloc.clone())?
    };
    assert!(s.flags().contains(StorageFlags::FREEMEM));
    s.set(&dev, 0, 9.0)?;
    assert_eq!(s.get(&dev, 0)?, 9.0);
    s.free()?;
    assert_eq!(alloc.frees(), 1);
    Ok(())
}

#[test]
fn wrapped_memory_with_freemem_cleared_is_never_freed() -> Result<()> {
    let dev = CpuDevice::new();
    let alloc = Arc::new(CountingAllocator::host());
    let mut backing = vec![1f32, 2.0, 3.0, 4.0];
    let s = unsafe {
        Storage::<f32>::new_with_data_and_allocator(&dev, backing.as_mut_ptr(), 4, alloc.clone())?
    };
    s.clear_flag(StorageFlags::FREEMEM);
    assert_eq!(s.get(&dev, 3)?, 4.0);
    s.set(&dev, 0, -1.0)?;
    s.free()?;
    assert_eq!(alloc.frees(), 0);
    // the wrapped memory is still ours
    assert_eq!(backing[0], -1.0);
    Ok(())
}

#[test]
fn wrapped_null_pointer() -> Result<()> {
    let dev = CpuDevice::new();
    let s = unsafe { Storage::<f32>::new_with_data(&dev, std::ptr::null_mut(), 0)? };
    assert_eq!(s.size(), 0);
    assert!(s.data().is_null());
    s.free()?;

    assert!(matches!(
        unsafe { Storage::<f32>::new_with_data(&dev, std::ptr::null_mut(), 3) },
        Err(Error::InvalidArgument { .. })
    ));
    Ok(())
}

#[test]
fn views_alias_the_backing_buffer() -> Result<()> {
    let dev = CpuDevice::new();
    let alloc = Arc::new(CountingAllocator::host());
    let base = Storage::<f32>::new_with_allocator(&dev, 8, alloc.clone())?;
    for i in 0..8i64 {
        base.set(&dev, i, i as f32)?;
    }
    let view = Storage::new_view(base, 2, 4)?;
    assert_eq!(view.size(), 4);
    assert!(view.flags().contains(StorageFlags::VIEW));
    assert!(!view.flags().contains(StorageFlags::FREEMEM));
    assert_eq!(view.data(), unsafe { base.data().add(2) });
    assert_eq!(view.get(&dev, 0)?, 2.0);
    view.set(&dev, 1, 42.0)?;
    assert_eq!(base.get(&dev, 3)?, 42.0);

    // the base handle can be released, the view keeps the chain alive
    base.free()?;
    assert_eq!(alloc.frees(), 0);
    assert_eq!(view.get(&dev, 0)?, 2.0);
    view.free()?;
    assert_eq!(alloc.frees(), 1);
    Ok(())
}

#[test]
fn chained_views_release_uniformly() -> Result<()> {
    let dev = CpuDevice::new();
    let alloc = Arc::new(CountingAllocator::host());
    let base = Storage::<i64>::new_with_allocator(&dev, 6, alloc.clone())?;
    for i in 0..6i64 {
        base.set(&dev, i, 100 + i)?;
    }
    let outer = Storage::new_view(base, 1, 4)?;
    let inner = Storage::new_view(outer, 1, 2)?;
    assert_eq!(inner.get(&dev, 0)?, 102);
    base.free()?;
    outer.free()?;
    assert_eq!(alloc.frees(), 0);
    inner.free()?;
    assert_eq!(alloc.frees(), 1);
    Ok(())
}

#[test]
fn view_bounds_are_validated() -> Result<()> {
    let dev = CpuDevice::new();
    let alloc = Arc::new(CountingAllocator::host());
    let base = Storage::<u8>::new_with_allocator(&dev, 8, alloc.clone())?;
    for (offset, size) in [(-1i64, 4i64), (0, -1), (6, 4), (9, 0)] {
        assert!(matches!(
            Storage::new_view(base, offset, size),
            Err(Error::InvalidArgument { .. })
        ));
    }
    // an empty view at the end of the buffer is fine
    let view = Storage::new_view(base, 8, 0)?;
    assert!(view.data().is_null());
    view.free()?;

    // the rejected views took no reference, this free tears down
    base.free()?;
    assert_eq!(alloc.frees(), 1);
    Ok(())
}
