//! Enumerations shared across the runtime.

use serde::{Deserialize, Serialize};

/// Orientation of a view or tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Op {
    #[default]
    NoTrans,
    Trans,
    ConjTrans,
}

impl Op {
    /// Compose two orientations: applying `other` on top of `self`.
    ///
    /// Mixing `Trans` and `ConjTrans` gives a conjugated, untransposed
    /// view, which has no representation; `None` is returned.
    pub fn compose(self, other: Op) -> Option<Op> {
        match (self, other) {
            (Op::NoTrans, o) | (o, Op::NoTrans) => Some(o),
            (Op::Trans, Op::Trans) | (Op::ConjTrans, Op::ConjTrans) => Some(Op::NoTrans),
            (Op::Trans, Op::ConjTrans) | (Op::ConjTrans, Op::Trans) => None,
        }
    }

    pub fn is_transposed(self) -> bool {
        self != Op::NoTrans
    }
}

/// Which triangle of a matrix is referenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Uplo {
    #[default]
    General,
    Lower,
    Upper,
}

impl Uplo {
    /// The triangle seen through a transposed view.
    pub fn flip(self) -> Uplo {
        match self {
            Uplo::General => Uplo::General,
            Uplo::Lower => Uplo::Upper,
            Uplo::Upper => Uplo::Lower,
        }
    }

    /// The triangle as seen through `op`.
    pub fn under(self, op: Op) -> Uplo {
        if op.is_transposed() {
            self.flip()
        } else {
            self
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Diag {
    #[default]
    NonUnit,
    Unit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Side {
    #[default]
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Layout {
    #[default]
    ColMajor,
    RowMajor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Norm {
    /// Largest modulus of any entry.
    Max,
    /// Largest column sum.
    One,
    /// Largest row sum.
    Inf,
    /// Frobenius.
    Fro,
}

/// Where a tile instance lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Residency {
    Host,
    Device(usize),
}

impl Residency {
    pub fn device(self) -> Option<usize> {
        match self {
            Residency::Host => None,
            Residency::Device(d) => Some(d),
        }
    }
}

/// Structure attached to a view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MatrixKind {
    #[default]
    General,
    Triangular { uplo: Uplo, diag: Diag },
    Hermitian { uplo: Uplo },
    Symmetric { uplo: Uplo },
    /// General band with `kl` sub- and `ku` super-diagonals.
    Band { kl: usize, ku: usize },
    /// Triangular band with `kd` off-diagonals.
    TriangularBand { uplo: Uplo, diag: Diag, kd: usize },
}

impl MatrixKind {
    /// Stored triangle, `General` for full storage.
    pub fn uplo(self) -> Uplo {
        match self {
            MatrixKind::Triangular { uplo, .. }
            | MatrixKind::Hermitian { uplo }
            | MatrixKind::Symmetric { uplo }
            | MatrixKind::TriangularBand { uplo, .. } => uplo,
            MatrixKind::General | MatrixKind::Band { .. } => Uplo::General,
        }
    }

    pub fn diag(self) -> Diag {
        match self {
            MatrixKind::Triangular { diag, .. } | MatrixKind::TriangularBand { diag, .. } => diag,
            _ => Diag::NonUnit,
        }
    }

    /// Kind of the view obtained by transposing.
    pub fn transposed(self) -> MatrixKind {
        match self {
            MatrixKind::General => MatrixKind::General,
            MatrixKind::Triangular { uplo, diag } => MatrixKind::Triangular {
                uplo: uplo.flip(),
                diag,
            },
            MatrixKind::Hermitian { uplo } => MatrixKind::Hermitian { uplo: uplo.flip() },
            MatrixKind::Symmetric { uplo } => MatrixKind::Symmetric { uplo: uplo.flip() },
            MatrixKind::Band { kl, ku } => MatrixKind::Band { kl: ku, ku: kl },
            MatrixKind::TriangularBand { uplo, diag, kd } => MatrixKind::TriangularBand {
                uplo: uplo.flip(),
                diag,
                kd,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transposing_flips_triangle_and_band() {
        let k = MatrixKind::Triangular {
            uplo: Uplo::Lower,
            diag: Diag::Unit,
        };
        assert_eq!(k.transposed().uplo(), Uplo::Upper);
        assert_eq!(k.transposed().diag(), Diag::Unit);
        assert_eq!(
            MatrixKind::Band { kl: 2, ku: 1 }.transposed(),
            MatrixKind::Band { kl: 1, ku: 2 }
        );
        assert_eq!(Uplo::Lower.under(Op::ConjTrans), Uplo::Upper);
        assert_eq!(Uplo::Lower.under(Op::NoTrans), Uplo::Lower);
    }

    #[test]
    fn test_op_composition() {
        assert_eq!(Op::NoTrans.compose(Op::ConjTrans), Some(Op::ConjTrans));
        assert_eq!(Op::Trans.compose(Op::Trans), Some(Op::NoTrans));
        assert_eq!(Op::ConjTrans.compose(Op::ConjTrans), Some(Op::NoTrans));
        assert_eq!(Op::Trans.compose(Op::ConjTrans), None);
    }
}
