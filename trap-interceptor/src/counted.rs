use std::{fmt, ops};

/// Number of top level exception types, the maximum number of distinct
/// exception ports a thread can have registered at once.
///
/// This is platform independent, but located the `<arch>/exception.h`
pub const EXC_TYPES_COUNT: usize = 14;

/// A fixed capacity array of `N` contiguous slots.
///
/// Mach calls such as `thread_swap_exception_ports` take a pointer to the
/// first element of several caller owned arrays and write up to `N`
/// consecutive entries through it. This type guarantees that layout: it is
/// exactly `[T; N]`, so writing slot `i` through [`Self::as_mut_ptr`]`.add(i)`
/// is visible in slot `i` and nowhere else.
#[derive(Copy, Clone, PartialEq, Eq)]
#[repr(transparent)]
pub struct CountedBuffer<T, const N: usize>([T; N]);

impl<T: Default + Copy, const N: usize> CountedBuffer<T, N> {
    /// Creates a buffer with every slot set to the default value
    #[inline]
    pub fn new() -> Self {
        Self([T::default(); N])
    }
}

impl<T: Default + Copy, const N: usize> Default for CountedBuffer<T, N> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> CountedBuffer<T, N> {
    /// The number of slots, always `N`
    #[inline]
    pub const fn capacity(&self) -> usize {
        N
    }

    #[inline]
    pub fn as_ptr(&self) -> *const T {
        self.0.as_ptr()
    }

    /// Pointer to slot 0, through which all `N` slots may be written
    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut T {
        self.0.as_mut_ptr()
    }

    #[inline]
    pub fn as_slice(&self) -> &[T] {
        &self.0
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.0
    }

    #[inline]
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.0.iter()
    }
}

impl<T, const N: usize> ops::Index<usize> for CountedBuffer<T, N> {
    type Output = T;

    #[inline]
    fn index(&self, index: usize) -> &T {
        &self.0[index]
    }
}

impl<T, const N: usize> ops::IndexMut<usize> for CountedBuffer<T, N> {
    #[inline]
    fn index_mut(&mut self, index: usize) -> &mut T {
        &mut self.0[index]
    }
}

impl<'b, T, const N: usize> IntoIterator for &'b CountedBuffer<T, N> {
    type Item = &'b T;
    type IntoIter = std::slice::Iter<'b, T>;

    #[inline]
    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<T: fmt::Debug, const N: usize> fmt::Debug for CountedBuffer<T, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}
