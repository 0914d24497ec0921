/// IR opcodes.
///
/// Ops flagged [`OpFlags::INT`] take their width from `Op::op_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Mov = 0,
    SetCond,
    Add,
    Sub,
    Mul,
    Neg,
    And,
    Or,
    Xor,
    Not,
    Shl,
    Shr,
    Sar,
    /// Sign-extend the low 32 bits.
    ExtI32I64,
    /// Zero-extend the low 32 bits.
    ExtUI32I64,
    GuestLd,
    GuestSt,
    /// Jump to a label.
    Br,
    BrCond,
    SetLabel,
    /// Patchable direct jump into another TB.
    GotoTb,
    /// Return to the dispatcher with an exit code.
    ExitTb,
    /// Leave the TB with an exception number.
    Raise,
    Call,
    Mb,
    Nop,
    Discard,
    /// Guest instruction boundary; carries the restore data.
    InsnStart,
    Count,
}

/// Properties of an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpFlags(u16);

impl OpFlags {
    pub const NONE: OpFlags = OpFlags(0);
    /// Leaves the TB.
    pub const BB_EXIT: OpFlags = OpFlags(1 << 0);
    /// Last op of a basic block.
    pub const BB_END: OpFlags = OpFlags(1 << 1);
    /// May leave generated code midway (fault, helper).
    pub const CALL_CLOBBER: OpFlags = OpFlags(1 << 2);
    /// Must be kept even when its outputs are dead.
    pub const SIDE_EFFECTS: OpFlags = OpFlags(1 << 3);
    /// Works on I32 and I64.
    pub const INT: OpFlags = OpFlags(1 << 4);
    /// Emits no host code of its own.
    pub const NOT_PRESENT: OpFlags = OpFlags(1 << 5);
    pub const COND_BRANCH: OpFlags = OpFlags(1 << 6);

    pub const fn contains(self, other: OpFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: OpFlags) -> Self {
        Self(self.0 | other.0)
    }
}

/// Operand counts and flags of an opcode.
#[derive(Debug, Clone, Copy)]
pub struct OpDef {
    pub name: &'static str,
    pub nb_oargs: u8,
    pub nb_iargs: u8,
    pub nb_cargs: u8,
    pub flags: OpFlags,
}

const fn def(name: &'static str, outs: u8, ins: u8, consts: u8, flags: OpFlags) -> OpDef {
    OpDef {
        name,
        nb_oargs: outs,
        nb_iargs: ins,
        nb_cargs: consts,
        flags,
    }
}

const ALU: OpFlags = OpFlags::INT;
const MEM: OpFlags = OpFlags::CALL_CLOBBER.union(OpFlags::SIDE_EFFECTS);
const JUMP: OpFlags = OpFlags::BB_END.union(OpFlags::NOT_PRESENT);
const EXIT: OpFlags = OpFlags::BB_EXIT.union(OpFlags::BB_END);
const MARK: OpFlags = OpFlags::NOT_PRESENT;
const COND: OpFlags = OpFlags::BB_END
    .union(OpFlags::COND_BRANCH)
    .union(OpFlags::INT);

/// Definitions, indexed by `Opcode as usize`.
pub static OPCODE_DEFS: [OpDef; Opcode::Count as usize] = [
    def("mov", 1, 1, 0, ALU),
    def("setcond", 1, 2, 1, ALU),
    def("add", 1, 2, 0, ALU),
    def("sub", 1, 2, 0, ALU),
    def("mul", 1, 2, 0, ALU),
    def("neg", 1, 1, 0, ALU),
    def("and", 1, 2, 0, ALU),
    def("or", 1, 2, 0, ALU),
    def("xor", 1, 2, 0, ALU),
    def("not", 1, 1, 0, ALU),
    def("shl", 1, 2, 0, ALU),
    def("shr", 1, 2, 0, ALU),
    def("sar", 1, 2, 0, ALU),
    def("ext_i32_i64", 1, 1, 0, OpFlags::NONE),
    def("extu_i32_i64", 1, 1, 0, OpFlags::NONE),
    // address in, memop as carg
    def("guest_ld", 1, 1, 1, MEM),
    def("guest_st", 0, 2, 1, MEM),
    def("br", 0, 0, 1, JUMP),
    // a, b in; cond and label as cargs
    def("brcond", 0, 2, 2, COND),
    def("set_label", 0, 0, 1, JUMP),
    def("goto_tb", 0, 0, 1, EXIT),
    def("exit_tb", 0, 0, 1, EXIT),
    def("raise", 0, 0, 1, EXIT),
    // dst, three args, helper index
    def("call", 1, 3, 1, MEM),
    def("mb", 0, 0, 1, OpFlags::SIDE_EFFECTS),
    def("nop", 0, 0, 0, MARK),
    def("discard", 0, 1, 0, MARK),
    // index into the context's insn data
    def("insn_start", 0, 0, 1, MARK),
];

impl Opcode {
    pub fn def(self) -> &'static OpDef {
        &OPCODE_DEFS[self as usize]
    }

    pub fn name(self) -> &'static str {
        self.def().name
    }

    /// Whether the op works on both I32 and I64.
    pub fn is_int_polymorphic(self) -> bool {
        self.def().flags.contains(OpFlags::INT)
    }
}
