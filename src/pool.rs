//! The backing reservation for a pool.

use core::{alloc::Layout, fmt, ptr::NonNull};

use crate::{Allocator, Error, Global, Result};

/// A block of memory reserved from an inner allocator to back a pool.
///
/// The simulator only ever does bookkeeping on offsets into the pool, so the
/// reserved bytes are never read or written. The reservation exists so that
/// handles designate real, distinct addresses, and is returned to the inner
/// allocator when the pool is renewed or dropped.
pub struct Pool<A = Global>
where
    A: Allocator,
{
    /// The underlying allocator.
    inner: A,
    base: NonNull<u8>,
    layout: Layout,
}

impl<A> Pool<A>
where
    A: Allocator,
{
    /// Reserve `size` bytes from `inner`.
    pub fn reserve(inner: A, size: usize) -> Result<Self> {
        let layout = Self::layout_for(size)?;
        let base = inner
            .allocate(layout)
            .map_err(|_| Error::PoolReservation { size })?
            .cast::<u8>();
        log::debug!("reserved a {size}-byte pool at {base:p}");
        Ok(Pool {
            inner,
            base,
            layout,
        })
    }

    fn layout_for(size: usize) -> Result<Layout> {
        if size == 0 {
            return Err(Error::ZeroSizedPool);
        }
        Layout::from_size_align(size, 1).map_err(|_| Error::PoolReservation { size })
    }

    /// Replace this reservation with a fresh one of `size` bytes.
    ///
    /// On failure the current reservation is kept.
    pub fn renew(&mut self, size: usize) -> Result<()> {
        let layout = Self::layout_for(size)?;
        let base = self
            .inner
            .allocate(layout)
            .map_err(|_| Error::PoolReservation { size })?
            .cast::<u8>();

        // Safety: `self.base` was allocated by `self.inner` with
        // `self.layout`, is still allocated, and is forgotten right after.
        unsafe { self.inner.deallocate(self.base, self.layout) };
        log::debug!(
            "renewed pool: released {} bytes at {:p}, reserved {size} bytes at {base:p}",
            self.layout.size(),
            self.base
        );

        self.base = base;
        self.layout = layout;
        Ok(())
    }

    /// The first byte of the reservation.
    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// The size of the reservation in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.layout.size()
    }

    /// Always `false`: pools hold at least one byte.
    #[inline]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Get a shared reference to the inner allocator.
    #[inline]
    pub fn inner(&self) -> &A {
        &self.inner
    }

    /// The address `offset` bytes into the reservation, if it lies inside it.
    pub fn address_of(&self, offset: usize) -> Option<NonNull<u8>> {
        if offset >= self.len() {
            return None;
        }
        // Safety: `offset` is in bounds of the reservation, so the result
        // stays inside the same allocated object and cannot be null.
        Some(unsafe { self.base.add(offset) })
    }
}

impl<A> fmt::Debug for Pool<A>
where
    A: Allocator,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("base", &format_args!("{:p}", self.base))
            .field("len", &self.len())
            .finish()
    }
}

impl<A> Drop for Pool<A>
where
    A: Allocator,
{
    fn drop(&mut self) {
        // Safety: the reservation was allocated by `self.inner` with
        // `self.layout` and nothing references it after this point.
        unsafe { self.inner.deallocate(self.base, self.layout) };
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::AllocError;
    use core::cell::Cell;

    /// Wraps `Global`, keeping count of live allocations and bytes.
    #[derive(Default)]
    pub(crate) struct Counting {
        pub(crate) live: Cell<usize>,
        pub(crate) bytes: Cell<usize>,
    }

    unsafe impl Allocator for Counting {
        fn allocate(&self, layout: Layout) -> core::result::Result<NonNull<[u8]>, AllocError> {
            let ptr = Global.allocate(layout)?;
            self.live.set(self.live.get() + 1);
            self.bytes.set(self.bytes.get() + layout.size());
            Ok(ptr)
        }

        unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
            self.live.set(self.live.get() - 1);
            self.bytes.set(self.bytes.get() - layout.size());
            Global.deallocate(ptr, layout);
        }
    }

    /// An allocator that always fails.
    pub(crate) struct Refusing;

    unsafe impl Allocator for Refusing {
        fn allocate(&self, _: Layout) -> core::result::Result<NonNull<[u8]>, AllocError> {
            Err(AllocError)
        }

        unsafe fn deallocate(&self, _: NonNull<u8>, _: Layout) {
            unreachable!("nothing was ever allocated")
        }
    }

    #[test]
    fn renew_and_drop_release_reservations() {
        let counting = Counting::default();
        {
            let mut pool = Pool::reserve(&counting, 128).unwrap();
            assert_eq!(pool.len(), 128);
            assert_eq!((counting.live.get(), counting.bytes.get()), (1, 128));

            pool.renew(64).unwrap();
            assert_eq!(pool.len(), 64);
            assert_eq!((counting.live.get(), counting.bytes.get()), (1, 64));

            assert_eq!(pool.renew(0).unwrap_err(), Error::ZeroSizedPool);
            assert_eq!(pool.len(), 64);
        }
        assert_eq!((counting.live.get(), counting.bytes.get()), (0, 0));
    }

    #[test]
    fn addresses_stay_inside_the_reservation() {
        let pool = Pool::reserve(Global, 16).unwrap();
        let base = pool.base().as_ptr() as usize;
        assert_eq!(pool.address_of(0), Some(pool.base()));
        assert_eq!(pool.address_of(15).map(|p| p.as_ptr() as usize), Some(base + 15));
        assert_eq!(pool.address_of(16), None);
    }

    #[test]
    fn reservation_failures() {
        assert_eq!(
            Pool::reserve(Refusing, 32).unwrap_err(),
            Error::PoolReservation { size: 32 }
        );
        assert_eq!(Pool::reserve(Global, 0).unwrap_err(), Error::ZeroSizedPool);
        assert_eq!(
            Pool::reserve(Global, usize::MAX).unwrap_err(),
            Error::PoolReservation { size: usize::MAX }
        );
    }
}
