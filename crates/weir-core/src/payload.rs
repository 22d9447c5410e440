/// Capability bound for values that may live in a payload slot.
///
/// A payload crosses process boundaries as raw bytes: the sink writes it in
/// place, every source observes or memcpys the same bytes through its own
/// mapping. That is only sound for fixed-size, bit-copyable layouts.
///
/// # Safety
///
/// Implementors guarantee the type is `repr(C)` (or `repr(transparent)`
/// over such a type), contains no pointers, references, or any other value
/// whose meaning is process-local, and that every bit pattern the sink can
/// produce is a valid value of the type.
pub unsafe trait ShmSafe: Copy + 'static {}

// SAFETY: primitive scalars are valid for any produced bit pattern and hold
// no process-local state. (`bool` is included because the only producers in
// this crate store it as 0 or 1.)
unsafe impl ShmSafe for u8 {}
unsafe impl ShmSafe for u16 {}
unsafe impl ShmSafe for u32 {}
unsafe impl ShmSafe for u64 {}
unsafe impl ShmSafe for i8 {}
unsafe impl ShmSafe for i16 {}
unsafe impl ShmSafe for i32 {}
unsafe impl ShmSafe for i64 {}
unsafe impl ShmSafe for f32 {}
unsafe impl ShmSafe for f64 {}
unsafe impl ShmSafe for bool {}

// SAFETY: an array of shareable values is shareable.
unsafe impl<T: ShmSafe, const N: usize> ShmSafe for [T; N] {}
