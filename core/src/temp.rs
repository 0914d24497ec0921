use crate::types::Type;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TempKind {
    /// Dead at the end of its extended basic block.
    Ebb,
    /// Lives in a CPU env word across TBs.
    Global,
    Const,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TempIdx(pub u32);

/// An IR value slot.
#[derive(Debug, Clone)]
pub struct Temp {
    pub idx: TempIdx,
    pub ty: Type,
    pub kind: TempKind,
    /// Value of a `Const`.
    pub val: u64,
    /// Backing env word of a `Global`.
    pub env_word: u32,
    pub name: Option<&'static str>,
}

impl Temp {
    fn with_kind(idx: TempIdx, ty: Type, kind: TempKind) -> Self {
        Self {
            idx,
            ty,
            kind,
            val: 0,
            env_word: 0,
            name: None,
        }
    }

    pub fn new_ebb(idx: TempIdx, ty: Type) -> Self {
        Self::with_kind(idx, ty, TempKind::Ebb)
    }

    pub fn new_const(idx: TempIdx, ty: Type, val: u64) -> Self {
        Self {
            val: ty.mask(val),
            ..Self::with_kind(idx, ty, TempKind::Const)
        }
    }

    pub fn new_global(idx: TempIdx, ty: Type, env_word: u32, name: &'static str) -> Self {
        Self {
            env_word,
            name: Some(name),
            ..Self::with_kind(idx, ty, TempKind::Global)
        }
    }

    pub fn is_const(&self) -> bool {
        self.kind == TempKind::Const
    }

    pub fn is_global(&self) -> bool {
        self.kind == TempKind::Global
    }
}
