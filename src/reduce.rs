//! Scalar reductions combined across workers.
//!
//! Every backend folds contributions in rank order, so a floating-point sum is
//! reproducible for a fixed worker count. It is not bit-reproducible across
//! different worker counts: changing `P` regroups the additions. Integer sums
//! are checked; a sum that leaves the type's range fails the reduction.

use serde::{Deserialize, Serialize};

use crate::error::{PdcrError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReduceOp {
    Min,
    Max,
    Sum,
}

/// A scalar with an identity and an associative, commutative combination
/// for each [`ReduceOp`].
pub trait Reducible: Copy + Send + 'static {
    fn identity(op: ReduceOp) -> Self;

    /// `None` when the combination is not representable.
    fn combine(self, other: Self, op: ReduceOp) -> Option<Self>;
}

macro_rules! impl_reducible_int {
    ($($t:ty),*) => {
        $(
            impl Reducible for $t {
                fn identity(op: ReduceOp) -> Self {
                    match op {
                        ReduceOp::Min => <$t>::MAX,
                        ReduceOp::Max => <$t>::MIN,
                        ReduceOp::Sum => 0,
                    }
                }

                fn combine(self, other: Self, op: ReduceOp) -> Option<Self> {
                    match op {
                        ReduceOp::Min => Some(self.min(other)),
                        ReduceOp::Max => Some(self.max(other)),
                        ReduceOp::Sum => self.checked_add(other),
                    }
                }
            }
        )*
    };
}

macro_rules! impl_reducible_float {
    ($($t:ty),*) => {
        $(
            impl Reducible for $t {
                fn identity(op: ReduceOp) -> Self {
                    match op {
                        ReduceOp::Min => <$t>::INFINITY,
                        ReduceOp::Max => <$t>::NEG_INFINITY,
                        ReduceOp::Sum => 0.0,
                    }
                }

                fn combine(self, other: Self, op: ReduceOp) -> Option<Self> {
                    Some(match op {
                        ReduceOp::Min => self.min(other),
                        ReduceOp::Max => self.max(other),
                        ReduceOp::Sum => self + other,
                    })
                }
            }
        )*
    };
}

impl_reducible_int!(u8, i32, i64, u32, u64, usize);
impl_reducible_float!(f32, f64);

/// Combines values in iteration order, starting from the identity.
pub fn fold<S: Reducible>(values: impl IntoIterator<Item = S>, op: ReduceOp) -> Result<S> {
    values
        .into_iter()
        .try_fold(S::identity(op), |acc, value| acc.combine(value, op))
        .ok_or_else(|| {
            PdcrError::overflow(format!(
                "{op:?} of the contributions does not fit in {}",
                std::any::type_name::<S>()
            ))
        })
}
