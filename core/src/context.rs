use std::collections::HashMap;

use crate::label::Label;
use crate::op::{Op, OpIdx};
use crate::tb::INSN_START_WORDS;
use crate::temp::{Temp, TempIdx, TempKind};
use crate::types::{Type, TYPE_COUNT};

pub const MAX_TEMPS: usize = 512;
/// Upper bound on guest instructions in one TB.
pub const MAX_INSNS: usize = 512;

/// Translation state for one TB at a time.
///
/// Globals sit at the front of the temp pool and survive
/// [`Context::reset`]; everything else is per TB.
pub struct Context {
    temps: Vec<Temp>,
    ops: Vec<Op>,
    labels: Vec<Label>,
    nb_globals: u32,
    /// Constant temps already allocated, per type and value.
    consts: [HashMap<u64, TempIdx>; TYPE_COUNT],
    /// `insn_start` data, by guest instruction number.
    insn_data: Vec<[u64; INSN_START_WORDS]>,
    /// Store slot the TB will occupy; exit codes refer to it.
    pub tb_idx: u32,
}

impl Context {
    pub fn new() -> Self {
        Self {
            temps: Vec::with_capacity(128),
            ops: Vec::with_capacity(256),
            labels: Vec::new(),
            nb_globals: 0,
            consts: Default::default(),
            insn_data: Vec::new(),
            tb_idx: 0,
        }
    }

    pub fn reset(&mut self) {
        self.temps.truncate(self.nb_globals as usize);
        self.ops.clear();
        self.labels.clear();
        self.consts.iter_mut().for_each(HashMap::clear);
        self.insn_data.clear();
        self.tb_idx = 0;
    }

    fn alloc(&mut self, make: impl FnOnce(TempIdx) -> Temp) -> TempIdx {
        assert!(self.temps.len() < MAX_TEMPS, "temp pool exhausted");
        let idx = TempIdx(self.temps.len() as u32);
        self.temps.push(make(idx));
        idx
    }

    pub fn nb_globals(&self) -> u32 {
        self.nb_globals
    }

    pub fn nb_temps(&self) -> u32 {
        self.temps.len() as u32
    }

    /// Temp that dies at the end of its extended basic block.
    pub fn new_temp(&mut self, ty: Type) -> TempIdx {
        self.alloc(|idx| Temp::new_ebb(idx, ty))
    }

    /// Constant temp; equal values of one type share a temp.
    pub fn new_const(&mut self, ty: Type, val: u64) -> TempIdx {
        let val = ty.mask(val);
        if let Some(&idx) = self.consts[ty as usize].get(&val) {
            return idx;
        }
        let idx = self.alloc(|idx| Temp::new_const(idx, ty, val));
        self.consts[ty as usize].insert(val, idx);
        idx
    }

    /// Global backed by CPU env word `env_word`. All globals must be
    /// registered before the first other temp.
    pub fn new_global(&mut self, ty: Type, env_word: u32, name: &'static str) -> TempIdx {
        assert_eq!(
            self.temps.len() as u32,
            self.nb_globals,
            "globals must be registered before locals"
        );
        self.nb_globals += 1;
        self.alloc(|idx| Temp::new_global(idx, ty, env_word, name))
    }

    pub fn temp(&self, idx: TempIdx) -> &Temp {
        &self.temps[idx.0 as usize]
    }

    pub fn consts(&self) -> impl Iterator<Item = &Temp> {
        self.temps.iter().filter(|t| t.kind == TempKind::Const)
    }

    pub fn emit_op(&mut self, op: Op) -> OpIdx {
        let idx = op.idx;
        self.ops.push(op);
        idx
    }

    pub fn next_op_idx(&self) -> OpIdx {
        OpIdx(self.ops.len() as u32)
    }

    pub fn op(&self, idx: OpIdx) -> &Op {
        &self.ops[idx.0 as usize]
    }

    pub fn op_mut(&mut self, idx: OpIdx) -> &mut Op {
        &mut self.ops[idx.0 as usize]
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn num_ops(&self) -> usize {
        self.ops.len()
    }

    pub fn new_label(&mut self) -> u32 {
        let id = self.labels.len() as u32;
        self.labels.push(Label::new(id));
        id
    }

    pub fn label(&self, id: u32) -> &Label {
        &self.labels[id as usize]
    }

    pub fn label_mut(&mut self, id: u32) -> &mut Label {
        &mut self.labels[id as usize]
    }

    pub fn labels(&self) -> &[Label] {
        &self.labels
    }

    /// Record the restore data of the next guest instruction and
    /// return its number.
    pub fn push_insn_data(&mut self, data: [u64; INSN_START_WORDS]) -> u32 {
        self.insn_data.push(data);
        self.insn_data.len() as u32 - 1
    }

    pub fn insn_data(&self, n: u32) -> &[u64; INSN_START_WORDS] {
        &self.insn_data[n as usize]
    }

    pub fn num_insns(&self) -> usize {
        self.insn_data.len()
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}
