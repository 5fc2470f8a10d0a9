#[cold]
const fn cold() {}

/// Hints the compiler that the condition is expected to be true.
#[inline(always)]
pub const fn likely(b: bool) -> bool {
    if !b {
        cold();
    }
    b
}

/// Hints the compiler that the condition is expected to be false.
#[inline(always)]
pub const fn unlikely(b: bool) -> bool {
    if b {
        cold();
    }
    b
}
