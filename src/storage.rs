//! Reference counted device memory buffers.

use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicI32, AtomicU8, Ordering};
use std::sync::Arc;

use crate::{DType, DeviceAllocator, DeviceContext, DeviceId, Error, Result, WithDType};

/// Bitset of per-storage behavior flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageFlags(u8);

impl StorageFlags {
    /// The storage participates in reference counting. Without this
    /// bit, [`Storage::free`] is a no-op.
    pub const REFCOUNTED: StorageFlags = StorageFlags(1 << 0);
    /// The buffer may be grown or shrunk.
    pub const RESIZABLE: StorageFlags = StorageFlags(1 << 1);
    /// Teardown hands the buffer back to the allocator.
    pub const FREEMEM: StorageFlags = StorageFlags(1 << 2);
    /// The storage aliases another storage's memory and releases a
    /// backing reference instead of freeing the buffer.
    pub const VIEW: StorageFlags = StorageFlags(1 << 3);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: StorageFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: StorageFlags) -> Self {
        Self(self.0 | other.0)
    }
}

impl std::ops::BitOr for StorageFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

const DEFAULT_FLAGS: StorageFlags = StorageFlags::REFCOUNTED
    .union(StorageFlags::RESIZABLE)
    .union(StorageFlags::FREEMEM);

struct StorageInner<T: WithDType> {
    /// Device address of the buffer, null when `size` is 0.
    data: *mut T,
    /// Element count, never negative.
    size: i64,
    /// Runtime tag for the element layout.
    dtype: DType,
    refcount: AtomicI32,
    // Kept separate from the refcount: flag mutation is not allowed to
    // race other flag mutation, but must never disturb retain/free.
    flags: AtomicU8,
    device: DeviceId,
    allocator: Arc<dyn DeviceAllocator>,
    /// Strong reference to the aliased storage when `VIEW` is set.
    view: Option<Storage<T>>,
}

/// A reference counted buffer of device memory holding `size` elements
/// of type `T`.
///
/// `Storage` is a pointer-sized handle over a shared record; copying
/// the handle does not touch the reference count. Sharing follows the
/// manual retain/release discipline of the tensor layer sitting on
/// top: every logical owner pairs one [`retain`](Self::retain) with one
/// [`free`](Self::free), and the release observing the count reach zero
/// tears the record down. A handle must not be used in any way once the
/// reference it covers has been released;
/// [`retain_if_live`](Self::retain_if_live) is the only safe upgrade
/// path for weak, cache-style handles.
pub struct Storage<T: WithDType> {
    inner: NonNull<StorageInner<T>>,
}

impl<T: WithDType> Clone for Storage<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: WithDType> Copy for Storage<T> {}

// The record only hands out raw device pointers and its shared state is
// either atomic or immutable after construction.
unsafe impl<T: WithDType> Send for Storage<T> {}
unsafe impl<T: WithDType> Sync for Storage<T> {}

impl<T: WithDType> Storage<T> {
    fn from_inner(inner: StorageInner<T>) -> Self {
        let ptr = Box::into_raw(Box::new(inner));
        Self {
            inner: unsafe { NonNull::new_unchecked(ptr) },
        }
    }

    fn inner(&self) -> &StorageInner<T> {
        unsafe { self.inner.as_ref() }
    }

    /// Empty storage owning no memory.
    pub fn new(ctx: &dyn DeviceContext) -> Result<Self> {
        Self::new_with_size(ctx, 0)
    }

    /// Storage of `size` elements allocated through the context's
    /// default allocator on the current device.
    pub fn new_with_size(ctx: &dyn DeviceContext, size: i64) -> Result<Self> {
        let allocator = ctx.default_allocator();
        Self::new_with_allocator(ctx, size, allocator)
    }

    /// Storage of `size` elements allocated through a caller supplied
    /// allocator, e.g. a pooling arena.
    pub fn new_with_allocator(
        ctx: &dyn DeviceContext,
        size: i64,
        allocator: Arc<dyn DeviceAllocator>,
    ) -> Result<Self> {
        if size < 0 {
            return Err(Error::InvalidArgument {
                op: "new_with_size",
                msg: format!("invalid size {size}"),
            });
        }
        let device = ctx
            .current_device()
            .map_err(|source| Error::FatalDevice {
                op: "current_device",
                source,
            })?;
        let data = if size > 0 {
            let stream = ctx.current_stream().map_err(|source| Error::FatalDevice {
                op: "current_stream",
                source,
            })?;
            let requested = size as usize * T::DTYPE.size_in_bytes();
            let ptr = allocator
                .malloc(requested, stream)
                .map_err(|source| Error::AllocationFailure {
                    requested,
                    dtype: T::DTYPE,
                    source,
                })?;
            ptr as *mut T
        } else {
            std::ptr::null_mut()
        };
        Ok(Self::from_inner(StorageInner {
            data,
            size,
            dtype: T::DTYPE,
            refcount: AtomicI32::new(1),
            flags: AtomicU8::new(DEFAULT_FLAGS.bits()),
            device,
            allocator,
            view: None,
        }))
    }

    /// Single element storage.
    pub fn new_with_size1(ctx: &dyn DeviceContext, data0: T) -> Result<Self> {
        Self::new_with_elems(ctx, &[data0])
    }

    pub fn new_with_size2(ctx: &dyn DeviceContext, data0: T, data1: T) -> Result<Self> {
        Self::new_with_elems(ctx, &[data0, data1])
    }

    pub fn new_with_size3(ctx: &dyn DeviceContext, data0: T, data1: T, data2: T) -> Result<Self> {
        Self::new_with_elems(ctx, &[data0, data1, data2])
    }

    pub fn new_with_size4(
        ctx: &dyn DeviceContext,
        data0: T,
        data1: T,
        data2: T,
        data3: T,
    ) -> Result<Self> {
        Self::new_with_elems(ctx, &[data0, data1, data2, data3])
    }

    fn new_with_elems(ctx: &dyn DeviceContext, elems: &[T]) -> Result<Self> {
        let storage = Self::new_with_size(ctx, elems.len() as i64)?;
        for (index, value) in elems.iter().enumerate() {
            if let Err(err) = storage.set(ctx, index as i64, *value) {
                let _ = storage.free();
                return Err(err);
            }
        }
        Ok(storage)
    }

    /// File-backed storage is not available for device memory.
    pub fn new_with_mapping(
        _ctx: &dyn DeviceContext,
        _path: &std::path::Path,
        _size: i64,
        _shared: bool,
    ) -> Result<Self> {
        Err(Error::UnsupportedOperation {
            op: "new_with_mapping",
        })
    }

    /// Wraps caller owned device memory without copying, using the
    /// context's default allocator for the eventual release.
    ///
    /// See [`new_with_data_and_allocator`](Self::new_with_data_and_allocator)
    /// for the ownership caveat and the safety contract.
    pub unsafe fn new_with_data(ctx: &dyn DeviceContext, data: *mut T, size: i64) -> Result<Self> {
        let allocator = ctx.default_allocator();
        Self::new_with_data_and_allocator(ctx, data, size, allocator)
    }

    /// Wraps caller owned device memory without copying. The device
    /// affinity is queried from the pointer itself, or from the current
    /// device for an empty storage.
    ///
    /// The storage is created with [`StorageFlags::FREEMEM`] set, so the
    /// last `free` hands `data` back to `allocator`. Callers keeping
    /// ownership of the memory must
    /// `clear_flag(StorageFlags::FREEMEM)` right after construction.
    ///
    /// # Safety
    ///
    /// `data` must either be null or point to at least `size` elements
    /// of memory on a device known to `ctx`, valid for the lifetime of
    /// the storage and, unless `FREEMEM` is cleared, releasable through
    /// `allocator`.
    pub unsafe fn new_with_data_and_allocator(
        ctx: &dyn DeviceContext,
        data: *mut T,
        size: i64,
        allocator: Arc<dyn DeviceAllocator>,
    ) -> Result<Self> {
        if size < 0 {
            return Err(Error::InvalidArgument {
                op: "new_with_data",
                msg: format!("invalid size {size}"),
            });
        }
        if data.is_null() && size > 0 {
            return Err(Error::InvalidArgument {
                op: "new_with_data",
                msg: format!("null data pointer for a storage of size {size}"),
            });
        }
        let device = if data.is_null() {
            ctx.current_device()
        } else {
            ctx.device_for_ptr(data as *const c_void)
        }
        .map_err(|source| Error::FatalDevice {
            op: "device_for_ptr",
            source,
        })?;
        Ok(Self::from_inner(StorageInner {
            data,
            size,
            dtype: T::DTYPE,
            refcount: AtomicI32::new(1),
            flags: AtomicU8::new(DEFAULT_FLAGS.bits()),
            device,
            allocator,
            view: None,
        }))
    }

    /// Zero-copy alias of `size` elements of `backing`, starting at
    /// `offset`. The view holds a strong reference to `backing`;
    /// releasing the view releases that reference instead of freeing
    /// any memory.
    pub fn new_view(backing: Storage<T>, offset: i64, size: i64) -> Result<Self> {
        let backing_size = backing.size();
        if offset < 0 || size < 0 || offset > backing_size || size > backing_size - offset {
            return Err(Error::InvalidArgument {
                op: "new_view",
                msg: format!(
                    "view of {size} elements at offset {offset} does not fit in storage of size {backing_size}"
                ),
            });
        }
        backing.retain();
        let data = if size == 0 {
            std::ptr::null_mut()
        } else {
            unsafe { backing.data().add(offset as usize) }
        };
        Ok(Self::from_inner(StorageInner {
            data,
            size,
            dtype: T::DTYPE,
            refcount: AtomicI32::new(1),
            flags: AtomicU8::new(StorageFlags::REFCOUNTED.union(StorageFlags::VIEW).bits()),
            device: backing.device(),
            allocator: backing.inner().allocator.clone(),
            view: Some(backing),
        }))
    }

    /// Raw device address of the buffer. Never synchronizes and never
    /// checks liveness; the caller must hold a valid reference.
    pub fn data(&self) -> *mut T {
        self.inner().data
    }

    /// Element count.
    pub fn size(&self) -> i64 {
        self.inner().size
    }

    /// Element size in bytes, fixed by the dtype tag.
    pub fn element_size(&self) -> usize {
        self.inner().dtype.size_in_bytes()
    }

    pub fn dtype(&self) -> DType {
        self.inner().dtype
    }

    /// The device the buffer lives on, fixed at construction.
    pub fn device(&self) -> DeviceId {
        self.inner().device
    }

    pub fn flags(&self) -> StorageFlags {
        StorageFlags(self.inner().flags.load(Ordering::Relaxed))
    }

    pub fn set_flag(&self, flag: StorageFlags) {
        self.inner().flags.fetch_or(flag.bits(), Ordering::Relaxed);
    }

    pub fn clear_flag(&self, flag: StorageFlags) {
        self.inner()
            .flags
            .fetch_and(!flag.bits(), Ordering::Relaxed);
    }

    /// Reads one element back to the host.
    ///
    /// The copy is enqueued on the context's current stream and the
    /// whole stream is drained before the value is returned, so any
    /// previously queued work on that stream completes too.
    pub fn get(&self, ctx: &dyn DeviceContext, index: i64) -> Result<T> {
        let inner = self.inner();
        if index < 0 || index >= inner.size {
            return Err(Error::IndexOutOfRange {
                index,
                size: inner.size,
            });
        }
        let stream = ctx.current_stream().map_err(|source| Error::FatalDevice {
            op: "current_stream",
            source,
        })?;
        let mut value = std::mem::MaybeUninit::<T>::uninit();
        unsafe {
            ctx.copy_to_host(
                value.as_mut_ptr() as *mut c_void,
                inner.data.add(index as usize) as *const c_void,
                T::DTYPE.size_in_bytes(),
                stream,
            )
        }
        .map_err(|source| Error::FatalDevice {
            op: "copy_to_host",
            source,
        })?;
        ctx.synchronize(stream)
            .map_err(|source| Error::FatalDevice {
                op: "stream_synchronize",
                source,
            })?;
        Ok(unsafe { value.assume_init() })
    }

    /// Writes one element from the host.
    ///
    /// Like [`get`](Self::get) this blocks on a full drain of the
    /// current stream; single-element mutation trades throughput for
    /// strong consistency.
    pub fn set(&self, ctx: &dyn DeviceContext, index: i64, value: T) -> Result<()> {
        let inner = self.inner();
        if index < 0 || index >= inner.size {
            return Err(Error::IndexOutOfRange {
                index,
                size: inner.size,
            });
        }
        let stream = ctx.current_stream().map_err(|source| Error::FatalDevice {
            op: "current_stream",
            source,
        })?;
        unsafe {
            ctx.copy_to_device(
                inner.data.add(index as usize) as *mut c_void,
                &value as *const T as *const c_void,
                T::DTYPE.size_in_bytes(),
                stream,
            )
        }
        .map_err(|source| Error::FatalDevice {
            op: "copy_to_device",
            source,
        })?;
        ctx.synchronize(stream)
            .map_err(|source| Error::FatalDevice {
                op: "stream_synchronize",
                source,
            })
    }

    /// Takes one additional strong reference. No-op when the storage is
    /// not refcounted.
    pub fn retain(&self) {
        let inner = self.inner();
        if self.flags().contains(StorageFlags::REFCOUNTED) {
            inner.refcount.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Attempts to take a strong reference without racing a concurrent
    /// final release: the count is only incremented through a
    /// compare-and-swap that retries while the observed count is
    /// positive and gives up the instant it is not. Returns whether a
    /// reference was taken.
    ///
    /// This is the upgrade path for weak, cache-style handles; a plain
    /// load-then-increment would resurrect a storage whose teardown has
    /// already been committed by another thread.
    pub fn retain_if_live(&self) -> bool {
        let inner = self.inner();
        let mut count = inner.refcount.load(Ordering::Relaxed);
        while count > 0 {
            match inner.refcount.compare_exchange(
                count,
                count + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => count = observed,
            }
        }
        false
    }

    /// Releases one strong reference. No-op when the storage is not
    /// refcounted.
    ///
    /// Exactly one release observes the count reach zero and performs
    /// teardown: the buffer is handed back to the allocator when
    /// `FREEMEM` is set, the backing reference is released when `VIEW`
    /// is set, and the record itself is deallocated. The handle, and
    /// every copy of it, must not be used afterwards.
    ///
    /// An allocator failure during teardown is unrecoverable; the error
    /// is surfaced and the record is leaked rather than repaired.
    pub fn free(&self) -> Result<()> {
        let inner = self.inner();
        if !self.flags().contains(StorageFlags::REFCOUNTED) {
            return Ok(());
        }
        if inner.refcount.fetch_sub(1, Ordering::Release) != 1 {
            return Ok(());
        }
        // This thread observed the zero transition and owns teardown;
        // the fence orders it after every preceding release.
        fence(Ordering::Acquire);
        unsafe { self.teardown() }
    }

    unsafe fn teardown(&self) -> Result<()> {
        let inner = self.inner.as_ptr();
        let flags = StorageFlags((*inner).flags.load(Ordering::Relaxed));
        if flags.contains(StorageFlags::FREEMEM) {
            if let Err(source) = (*inner).allocator.free((*inner).data as *mut c_void) {
                log::error!("leaking storage record, allocator failed to release buffer: {source}");
                return Err(Error::FatalDevice {
                    op: "allocator_free",
                    source,
                });
            }
        }
        if flags.contains(StorageFlags::VIEW) {
            if let Some(backing) = (*inner).view {
                backing.free()?;
            }
        }
        drop(Box::from_raw(inner));
        Ok(())
    }
}

impl<T: WithDType> std::fmt::Debug for Storage<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner();
        f.debug_struct("Storage")
            .field("size", &inner.size)
            .field("dtype", &inner.dtype)
            .field("device", &inner.device)
            .field("flags", &self.flags())
            .finish()
    }
}
