/// Width of an IR value. `I32` results live zero-extended in their
/// 64-bit slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Type {
    I32 = 0,
    I64 = 1,
}

pub const TYPE_COUNT: usize = 2;

impl Type {
    pub const fn size_bits(self) -> u32 {
        match self {
            Type::I32 => 32,
            Type::I64 => 64,
        }
    }

    pub const fn size_bytes(self) -> u32 {
        self.size_bits() / 8
    }

    pub const fn mask(self, val: u64) -> u64 {
        match self {
            Type::I32 => val as u32 as u64,
            Type::I64 => val,
        }
    }

    /// Reinterpret the low bits of `val` as a signed value of this width.
    const fn signed(self, val: u64) -> i64 {
        match self {
            Type::I32 => val as u32 as i32 as i64,
            Type::I64 => val as i64,
        }
    }
}

/// Comparison used by `setcond` and `brcond`.
///
/// Each condition and its inverse differ only in bit 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Cond {
    Never = 0,
    Always = 1,
    Eq = 8,
    Ne = 9,
    Lt = 10,
    Ge = 11,
    Le = 12,
    Gt = 13,
    Ltu = 14,
    Geu = 15,
    Leu = 16,
    Gtu = 17,
    /// `a & b == 0`
    TstEq = 18,
    TstNe = 19,
}

const CONDS: [(Cond, &str); 14] = [
    (Cond::Never, "never"),
    (Cond::Always, "always"),
    (Cond::Eq, "eq"),
    (Cond::Ne, "ne"),
    (Cond::Lt, "lt"),
    (Cond::Ge, "ge"),
    (Cond::Le, "le"),
    (Cond::Gt, "gt"),
    (Cond::Ltu, "ltu"),
    (Cond::Geu, "geu"),
    (Cond::Leu, "leu"),
    (Cond::Gtu, "gtu"),
    (Cond::TstEq, "tsteq"),
    (Cond::TstNe, "tstne"),
];

impl Cond {
    pub fn from_u8(v: u8) -> Option<Cond> {
        CONDS.iter().find(|(c, _)| *c as u8 == v).map(|&(c, _)| c)
    }

    pub fn name(self) -> &'static str {
        CONDS
            .iter()
            .find(|(c, _)| *c == self)
            .map_or("?", |&(_, n)| n)
    }

    pub fn invert(self) -> Cond {
        match Cond::from_u8(self as u8 ^ 1) {
            Some(c) => c,
            None => unreachable!("conditions come in pairs"),
        }
    }

    /// The condition that holds for `(b, a)` whenever `self` holds for
    /// `(a, b)`.
    pub const fn swap(self) -> Cond {
        match self {
            Cond::Lt => Cond::Gt,
            Cond::Gt => Cond::Lt,
            Cond::Ge => Cond::Le,
            Cond::Le => Cond::Ge,
            Cond::Ltu => Cond::Gtu,
            Cond::Gtu => Cond::Ltu,
            Cond::Geu => Cond::Leu,
            Cond::Leu => Cond::Geu,
            c => c,
        }
    }

    pub fn eval(self, ty: Type, a: u64, b: u64) -> bool {
        let (a, b) = (ty.mask(a), ty.mask(b));
        let (sa, sb) = (ty.signed(a), ty.signed(b));
        match self {
            Cond::Never => false,
            Cond::Always => true,
            Cond::Eq => a == b,
            Cond::Ne => a != b,
            Cond::Lt => sa < sb,
            Cond::Ge => sa >= sb,
            Cond::Le => sa <= sb,
            Cond::Gt => sa > sb,
            Cond::Ltu => a < b,
            Cond::Geu => a >= b,
            Cond::Leu => a <= b,
            Cond::Gtu => a > b,
            Cond::TstEq => a & b == 0,
            Cond::TstNe => a & b != 0,
        }
    }
}

/// Size and signedness of a guest memory access, packed in three bits:
/// log2 of the size in bytes, then the sign flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemOp(u16);

impl MemOp {
    pub const SIZE_8: u16 = 0;
    pub const SIZE_16: u16 = 1;
    pub const SIZE_32: u16 = 2;
    pub const SIZE_64: u16 = 3;
    pub const SIGN: u16 = 4;

    pub const fn new(bits: u16) -> Self {
        Self(bits)
    }

    pub const fn ub() -> Self {
        Self(Self::SIZE_8)
    }
    pub const fn sb() -> Self {
        Self(Self::SIZE_8 | Self::SIGN)
    }
    pub const fn uw() -> Self {
        Self(Self::SIZE_16)
    }
    pub const fn sw() -> Self {
        Self(Self::SIZE_16 | Self::SIGN)
    }
    pub const fn ul() -> Self {
        Self(Self::SIZE_32)
    }
    pub const fn sl() -> Self {
        Self(Self::SIZE_32 | Self::SIGN)
    }
    pub const fn uq() -> Self {
        Self(Self::SIZE_64)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn size(self) -> u16 {
        self.0 & 3
    }

    pub const fn is_signed(self) -> bool {
        self.0 & Self::SIGN != 0
    }

    pub const fn size_bytes(self) -> u32 {
        1 << self.size()
    }

    /// Widen a raw loaded value to 64 bits.
    pub const fn extend(self, raw: u64) -> u64 {
        if self.size() == Self::SIZE_64 {
            return raw;
        }
        let bits = 8 << self.size();
        let shift = 64 - bits;
        if self.is_signed() {
            (((raw << shift) as i64) >> shift) as u64
        } else {
            (raw << shift) >> shift
        }
    }
}

/// Guest helper called from generated code with the CPU env words and
/// up to three arguments.
pub type HelperFn = fn(env: &mut [u64], args: [u64; 3]) -> u64;
