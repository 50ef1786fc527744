//! Tile handles.
//!
//! A [`Tile`] is a reference-counted handle to one instance of a block of
//! matrix data. The handle carries the orientation and triangle of the view
//! it was obtained from, so kernels always see the *logical* block while the
//! storage is never rearranged.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use ndarray::{Array2, ArrayView2, ArrayViewMut2};

use crate::scalar::Scalar;
use crate::types::{Op, Residency, Uplo};

pub(crate) type TileData<T> = Arc<RwLock<Array2<T>>>;

pub(crate) fn new_data<T>(block: Array2<T>) -> TileData<T> {
    Arc::new(RwLock::new(block))
}

/// Handle to one tile instance.
#[derive(Clone)]
pub struct Tile<T: Scalar> {
    data: TileData<T>,
    op: Op,
    /// Stored triangle, before `op` is applied.
    uplo: Uplo,
    residency: Residency,
}

impl<T: Scalar> Tile<T> {
    pub(crate) fn new(data: TileData<T>, op: Op, uplo: Uplo, residency: Residency) -> Self {
        Self {
            data,
            op,
            uplo,
            residency,
        }
    }

    /// A standalone host tile, mainly for kernels and tests.
    pub fn from_array(block: Array2<T>) -> Self {
        Self::new(new_data(block), Op::NoTrans, Uplo::General, Residency::Host)
    }

    fn read(&self) -> RwLockReadGuard<'_, Array2<T>> {
        self.data.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Array2<T>> {
        self.data.write().unwrap_or_else(|p| p.into_inner())
    }

    /// Logical row count.
    pub fn mb(&self) -> usize {
        let (rows, cols) = self.read().dim();
        if self.op.is_transposed() {
            cols
        } else {
            rows
        }
    }

    /// Logical column count.
    pub fn nb(&self) -> usize {
        let (rows, cols) = self.read().dim();
        if self.op.is_transposed() {
            rows
        } else {
            cols
        }
    }

    pub fn op(&self) -> Op {
        self.op
    }

    /// Logical triangle.
    pub fn uplo(&self) -> Uplo {
        self.uplo.under(self.op)
    }

    pub fn residency(&self) -> Residency {
        self.residency
    }

    pub fn with_uplo(mut self, uplo: Uplo) -> Self {
        self.uplo = uplo.under(self.op);
        self
    }

    /// Handle to the same data, transposed.
    pub fn transpose(&self) -> Option<Self> {
        let op = self.op.compose(Op::Trans)?;
        Some(Self { op, ..self.clone() })
    }

    /// Handle to the same data, conjugate-transposed.
    pub fn conj_transpose(&self) -> Option<Self> {
        let op = self.op.compose(Op::ConjTrans)?;
        Some(Self { op, ..self.clone() })
    }

    /// Whether two handles refer to the same storage.
    pub fn shares_storage(&self, other: &Tile<T>) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    /// Run `f` on the logical block.
    ///
    /// Transposed handles see a strided view; conjugate-transposed complex
    /// handles see a temporary copy.
    pub fn with_view<R>(&self, f: impl FnOnce(ArrayView2<'_, T>) -> R) -> R {
        let guard = self.read();
        match self.op {
            Op::NoTrans => f(guard.view()),
            Op::Trans => f(guard.view().reversed_axes()),
            Op::ConjTrans if !T::IS_COMPLEX => f(guard.view().reversed_axes()),
            Op::ConjTrans => {
                let tmp = guard.t().mapv(|x| x.conj());
                drop(guard);
                f(tmp.view())
            }
        }
    }

    /// Run `f` on the logical block with write access.
    pub fn with_view_mut<R>(&self, f: impl FnOnce(ArrayViewMut2<'_, T>) -> R) -> R {
        let mut guard = self.write();
        match self.op {
            Op::NoTrans => f(guard.view_mut()),
            Op::Trans => f(guard.view_mut().reversed_axes()),
            Op::ConjTrans if !T::IS_COMPLEX => f(guard.view_mut().reversed_axes()),
            Op::ConjTrans => {
                let mut tmp = guard.t().mapv(|x| x.conj());
                let r = f(tmp.view_mut());
                guard.assign(&tmp.t().mapv(|x| x.conj()));
                r
            }
        }
    }

    /// Copy of the logical block.
    pub fn to_logical(&self) -> Array2<T> {
        self.with_view(|v| v.to_owned())
    }

    /// Copy of the stored block, ignoring the handle's orientation.
    pub(crate) fn to_stored(&self) -> Array2<T> {
        self.read().clone()
    }

    pub(crate) fn data(&self) -> &TileData<T> {
        &self.data
    }
}

impl<T: Scalar> std::fmt::Debug for Tile<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tile")
            .field("mb", &self.mb())
            .field("nb", &self.nb())
            .field("op", &self.op)
            .field("uplo", &self.uplo())
            .field("residency", &self.residency)
            .finish()
    }
}
