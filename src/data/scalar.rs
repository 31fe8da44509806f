//! Element types a scatter plan can move.
//!
//! Payloads travel as raw bytes, so every element is `Pod`. The `Add`
//! combine goes through [`Scalar::combine_add`], which wraps on integer
//! overflow; `Max` needs an order, which complex numbers do not have.

use std::fmt::Debug;
use std::ops::Add;

use bytemuck::{Pod, Zeroable};
use num_traits::Zero;
use serde::{Deserialize, Serialize};

pub trait Scalar: Pod + Zero + PartialEq + Debug + Send + Sync + 'static {
    /// Whether `try_max` is meaningful for this type.
    const ORDERED: bool;

    /// The larger of `a` and `b`, or `None` for unordered types.
    fn try_max(a: Self, b: Self) -> Option<Self>;

    /// Sum used by the `Add` combine.
    fn combine_add(a: Self, b: Self) -> Self;
}

macro_rules! ordered_scalar {
    ($add:ident => $($t:ty),* $(,)?) => {$(
        impl Scalar for $t {
            const ORDERED: bool = true;
            #[inline]
            fn try_max(a: Self, b: Self) -> Option<Self> {
                Some(if b > a { b } else { a })
            }
            #[inline]
            fn combine_add(a: Self, b: Self) -> Self {
                ordered_scalar!(@$add a, b)
            }
        }
    )*};
    (@plain $a:ident, $b:ident) => { $a + $b };
    (@wrapping $a:ident, $b:ident) => { $a.wrapping_add($b) };
}

ordered_scalar!(plain => f32, f64);
ordered_scalar!(wrapping => i32, i64, u32, u64);

/// Double precision complex number, laid out as `[re, im]`.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable, Serialize, Deserialize)]
pub struct Complex64 {
    pub re: f64,
    pub im: f64,
}

impl Complex64 {
    pub const fn new(re: f64, im: f64) -> Self {
        Self { re, im }
    }
}

impl Add for Complex64 {
    type Output = Self;
    #[inline]
    fn add(self, rhs: Self) -> Self {
        Self::new(self.re + rhs.re, self.im + rhs.im)
    }
}

impl Zero for Complex64 {
    fn zero() -> Self {
        Self::new(0.0, 0.0)
    }
    fn is_zero(&self) -> bool {
        self.re == 0.0 && self.im == 0.0
    }
}

impl Scalar for Complex64 {
    const ORDERED: bool = false;
    fn try_max(_a: Self, _b: Self) -> Option<Self> {
        None
    }
    #[inline]
    fn combine_add(a: Self, b: Self) -> Self {
        a + b
    }
}
