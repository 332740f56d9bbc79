//! This module defines traits for safely receiving into typed buffers. Because the matching engine
//! doesn't do any sort of type checking between sender and receiver, a receive can potentially be
//! used as a way to transmute between different types. Therefore, we must only allow receiving
//! into types for which any bit pattern is valid.

use std::mem::MaybeUninit;

use crate::datatype::Equivalence;

pub(crate) mod traits {
    pub use super::EquivalenceFromAnyBytes;
}

/// Any type whose `Equivalence` implementation maps only fields that can be composed of an
/// arbitrary permutation of bytes. This includes any type where all fields are themselves
/// `EquivalenceFromAnyBytes`, as long as all possible bit patterns of those fields are allowed in
/// any combination.
///
/// # Safety
///
/// Every byte pattern of `size_of::<Self>()` bytes must be a valid value of `Self`.
pub unsafe trait EquivalenceFromAnyBytes {}

unsafe impl<T> EquivalenceFromAnyBytes for MaybeUninit<T> where T: Equivalence {}

macro_rules! from_any_bytes {
    ($($rstype:ty),*) => {
        $(unsafe impl EquivalenceFromAnyBytes for $rstype {})*
    };
}

from_any_bytes!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize, f32, f64);

#[cfg(feature = "complex")]
from_any_bytes!(num_complex::Complex<f32>, num_complex::Complex<f64>);
