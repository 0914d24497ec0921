use std::ops::Range;

use crate::opcode::Opcode;
use crate::temp::TempIdx;
use crate::types::Type;

pub const MAX_OP_ARGS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpIdx(pub u32);

/// One IR operation.
///
/// `args` holds the outputs, then the inputs, then the constant
/// arguments (labels, conditions, memops, exit codes) as raw values.
#[derive(Debug, Clone)]
pub struct Op {
    pub idx: OpIdx,
    pub opc: Opcode,
    /// Width of int-polymorphic ops.
    pub op_type: Type,
    pub args: [TempIdx; MAX_OP_ARGS],
    pub nargs: u8,
}

impl Op {
    pub fn with_args(idx: OpIdx, opc: Opcode, op_type: Type, args: &[TempIdx]) -> Self {
        assert!(args.len() <= MAX_OP_ARGS, "{opc:?}: too many arguments");
        let mut all = [TempIdx(0); MAX_OP_ARGS];
        all[..args.len()].copy_from_slice(args);
        Self {
            idx,
            opc,
            op_type,
            args: all,
            nargs: args.len() as u8,
        }
    }

    fn slots(&self) -> [Range<usize>; 3] {
        let def = self.opc.def();
        let o = def.nb_oargs as usize;
        let i = o + def.nb_iargs as usize;
        let c = i + def.nb_cargs as usize;
        [0..o, o..i, i..c]
    }

    pub fn oargs(&self) -> &[TempIdx] {
        let [o, _, _] = self.slots();
        &self.args[o]
    }

    pub fn iargs(&self) -> &[TempIdx] {
        let [_, i, _] = self.slots();
        &self.args[i]
    }

    pub fn cargs(&self) -> &[TempIdx] {
        let [_, _, c] = self.slots();
        &self.args[c]
    }

    /// Constant argument `n` as its raw value.
    pub fn carg(&self, n: usize) -> u32 {
        self.cargs()[n].0
    }
}
