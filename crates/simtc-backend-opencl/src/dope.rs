//! Dope vectors: run-time shape and stride expressions of memref values.

use simtc_backend_core::clir::Expr;
use simtc_ir::{CompilationError, Extent, MemrefType, Result, Slice, Status, is_dynamic_value};

/// Which half of a dope vector an entry belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DopeKind {
    Shape,
    Stride,
}

impl DopeKind {
    pub fn suffix(self) -> &'static str {
        match self {
            Self::Shape => "shape",
            Self::Stride => "stride",
        }
    }
}

/// Shape and stride of a memref as expressions; static entries are literals.
#[derive(Clone, Debug, PartialEq)]
pub struct DopeVector {
    pub shape: Vec<Expr>,
    pub stride: Vec<Expr>,
}

impl DopeVector {
    /// Dope vector of `mr`, asking `dynamic` for every dynamic entry.
    pub fn from_type(mr: &MemrefType, mut dynamic: impl FnMut(DopeKind, usize) -> Expr) -> Self {
        let mut entries = |values: &[i64], kind| {
            values
                .iter()
                .enumerate()
                .map(|(mode, &v)| {
                    if is_dynamic_value(v) {
                        dynamic(kind, mode)
                    } else {
                        Expr::Int(v)
                    }
                })
                .collect::<Vec<_>>()
        };
        let shape = entries(&mr.shape, DopeKind::Shape);
        let stride = entries(&mr.stride, DopeKind::Stride);
        Self { shape, stride }
    }

    pub fn dim(&self) -> usize {
        self.shape.len()
    }

    pub fn shape(&self, mode: usize) -> Expr {
        self.shape[mode].clone()
    }

    pub fn stride(&self, mode: usize) -> Expr {
        self.stride[mode].clone()
    }

    /// Replaces entries that `mr` knows statically by literals.
    pub fn specialize(mut self, mr: &MemrefType) -> Self {
        for (entry, &v) in self
            .shape
            .iter_mut()
            .zip(&mr.shape)
            .chain(self.stride.iter_mut().zip(&mr.stride))
        {
            if !is_dynamic_value(v) {
                *entry = Expr::Int(v);
            }
        }
        self
    }

    /// Element offset of `indices`.
    pub fn offset(&self, indices: &[Expr]) -> Expr {
        indices
            .iter()
            .zip(&self.stride)
            .fold(Expr::Int(0), |acc, (idx, stride)| acc + idx.clone() * stride.clone())
    }

    /// Element offset and dope vector of a subview.
    ///
    /// `dynamic` holds the dynamic offsets and sizes in mode order.
    pub fn subview(&self, slices: &[Slice], dynamic: &[Expr]) -> Result<(Expr, DopeVector)> {
        if slices.len() != self.dim() {
            return Err(CompilationError::new(Status::IrInvalidNumberOfIndices));
        }
        let mut operands = dynamic.iter().cloned();
        let mut next = |extent: Extent| -> Result<Option<Expr>> {
            match extent {
                Extent::Static(v) => Ok(Some(Expr::Int(v))),
                Extent::Dynamic => operands
                    .next()
                    .map(Some)
                    .ok_or_else(|| CompilationError::internal("missing dynamic subview operand")),
                Extent::Infer => Ok(None),
            }
        };
        let mut offset = Expr::Int(0);
        let mut out = DopeVector {
            shape: Vec::new(),
            stride: Vec::new(),
        };
        for (mode, slice) in slices.iter().enumerate() {
            let (start, size) = match *slice {
                Slice::Index(start) => (start, None),
                Slice::Range { offset, size } => (offset, Some(size)),
            };
            let start = next(start)?.ok_or_else(|| CompilationError::new(Status::IrInvalidSlice))?;
            offset = offset + start.clone() * self.stride(mode);
            let Some(size) = size else { continue };
            let size = match next(size)? {
                Some(size) => size,
                None => self.shape(mode) - start,
            };
            out.shape.push(size);
            out.stride.push(self.stride(mode));
        }
        Ok((offset, out))
    }

    /// Dope vector after splitting mode `mode` into `shape`.
    pub fn expand(&self, mode: usize, shape: &[Extent], dynamic: &[Expr]) -> Result<DopeVector> {
        if mode >= self.dim() {
            return Err(CompilationError::new(Status::IrOutOfBounds));
        }
        if shape.len() < 2 {
            return Err(CompilationError::new(Status::IrExpandShapeOrderTooSmall));
        }
        if shape.iter().filter(|e| **e == Extent::Infer).count() > 1 {
            return Err(CompilationError::new(Status::IrMultipleDynamicModes));
        }
        let mut operands = dynamic.iter().cloned();
        let mut known = Vec::with_capacity(shape.len());
        for &extent in shape {
            known.push(match extent {
                Extent::Static(v) => Some(Expr::Int(v)),
                Extent::Dynamic => Some(operands.next().ok_or_else(|| {
                    CompilationError::internal("missing dynamic expand operand")
                })?),
                Extent::Infer => None,
            });
        }
        let product = known
            .iter()
            .flatten()
            .cloned()
            .fold(Expr::Int(1), |acc, e| acc * e);
        let inferred = self.shape(mode) / product;

        let mut out = DopeVector {
            shape: self.shape[..mode].to_vec(),
            stride: self.stride[..mode].to_vec(),
        };
        let mut stride = self.stride(mode);
        for extent in known {
            let extent = extent.unwrap_or_else(|| inferred.clone());
            out.shape.push(extent.clone());
            out.stride.push(stride.clone());
            stride = stride * extent;
        }
        out.shape.extend_from_slice(&self.shape[mode + 1..]);
        out.stride.extend_from_slice(&self.stride[mode + 1..]);
        Ok(out)
    }

    /// Dope vector after fusing modes `from..=to`.
    pub fn fuse(&self, from: usize, to: usize) -> Result<DopeVector> {
        if from >= to || to >= self.dim() {
            return Err(CompilationError::new(Status::IrInvalidFusionRange));
        }
        let fused = self.shape[from..=to]
            .iter()
            .cloned()
            .fold(Expr::Int(1), |acc, e| acc * e);
        let mut shape = self.shape[..from].to_vec();
        shape.push(fused);
        shape.extend_from_slice(&self.shape[to + 1..]);
        let mut stride = self.stride[..=from].to_vec();
        stride.extend_from_slice(&self.stride[to + 1..]);
        Ok(DopeVector { shape, stride })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use simtc_backend_core::printer::print_expr;
    use simtc_ir::{AddressSpace, DYNAMIC, ScalarType};

    fn memref(shape: &[i64], stride: &[i64]) -> MemrefType {
        MemrefType {
            element: ScalarType::F32,
            shape: shape.to_vec(),
            stride: stride.to_vec(),
            addrspace: AddressSpace::Global,
        }
    }

    fn dynamic_dope(mr: &MemrefType) -> DopeVector {
        DopeVector::from_type(mr, |kind, mode| Expr::var(format!("A_{}{mode}", kind.suffix())))
    }

    #[test]
    fn dynamic_entries_become_variables() {
        let dv = dynamic_dope(&memref(&[DYNAMIC, 8], &[1, DYNAMIC]));
        assert_eq!(dv.shape, vec![Expr::var("A_shape0"), Expr::Int(8)]);
        assert_eq!(dv.stride, vec![Expr::Int(1), Expr::var("A_stride1")]);
        let off = dv.offset(&[Expr::var("i"), Expr::var("j")]);
        assert_eq!(print_expr(&off), "i + j * A_stride1");
    }

    #[test]
    fn subview_drops_index_modes() {
        let dv = dynamic_dope(&memref(&[16, 32], &[1, 16]));
        let slices = [
            Slice::Range {
                offset: Extent::Static(4),
                size: Extent::Infer,
            },
            Slice::Index(Extent::Dynamic),
        ];
        let (off, sub) = dv.subview(&slices, &[Expr::var("j")]).unwrap();
        assert_eq!(print_expr(&off), "4 + j * 16");
        assert_eq!(sub.shape, vec![Expr::Int(12)]);
        assert_eq!(sub.stride, vec![Expr::Int(1)]);
    }

    #[test]
    fn subview_with_dynamic_size() {
        let dv = dynamic_dope(&memref(&[DYNAMIC], &[1]));
        let slices = [Slice::Range {
            offset: Extent::Dynamic,
            size: Extent::Infer,
        }];
        let (_, sub) = dv.subview(&slices, &[Expr::var("o")]).unwrap();
        assert_eq!(print_expr(&sub.shape[0]), "A_shape0 - o");
    }

    #[test]
    fn expand_infers_one_extent() {
        let dv = dynamic_dope(&memref(&[DYNAMIC, 4], &[1, DYNAMIC]));
        let ex = dv
            .expand(0, &[Extent::Static(4), Extent::Infer], &[])
            .unwrap();
        assert_eq!(ex.dim(), 3);
        assert_eq!(print_expr(&ex.shape[1]), "A_shape0 / 4");
        assert_eq!(ex.stride[0], Expr::Int(1));
        assert_eq!(ex.stride[1], Expr::Int(4));
        assert_eq!(ex.stride[2], Expr::var("A_stride1"));

        let err = dv
            .expand(0, &[Extent::Infer, Extent::Infer], &[])
            .unwrap_err();
        assert_eq!(err.status, Status::IrMultipleDynamicModes);
    }

    #[test]
    fn expand_with_dynamic_operand() {
        let dv = dynamic_dope(&memref(&[64], &[1]));
        let ex = dv
            .expand(0, &[Extent::Dynamic, Extent::Infer], &[Expr::var("n")])
            .unwrap();
        assert_eq!(print_expr(&ex.shape[1]), "64 / n");
        assert_eq!(print_expr(&ex.stride[1]), "n");
    }

    #[test]
    fn fuse_multiplies_shapes() {
        let dv = dynamic_dope(&memref(&[4, DYNAMIC, 2], &[1, 4, DYNAMIC]));
        let fused = dv.fuse(0, 1).unwrap();
        assert_eq!(print_expr(&fused.shape[0]), "4 * A_shape1");
        assert_eq!(fused.stride, vec![Expr::Int(1), Expr::var("A_stride2")]);
        assert_eq!(dv.fuse(1, 1).unwrap_err().status, Status::IrInvalidFusionRange);
    }

    #[test]
    fn specialize_prefers_static_type() {
        let dv = dynamic_dope(&memref(&[DYNAMIC], &[1]));
        let dv = dv.specialize(&memref(&[12], &[1]));
        assert_eq!(dv.shape, vec![Expr::Int(12)]);
    }
}
