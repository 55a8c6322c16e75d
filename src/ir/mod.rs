//! # ir
//!
//! Whole-program representation the analyses run on.
//! Values, functions, blocks and instructions live in dense arenas inside
//! `Program` and refer to each other by index.
//! A call keeps its called value as the last operand, so `[args..., callee]`.
//! A store is `[value, pointer]`, a gep is `[base, indices...]` whose last
//! operand is the element offset.

mod builder;

pub use builder::{ProgramBuilder, RetKind};

use std::fmt::Write;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub type ValueId = usize;
pub type FuncId = usize;
pub type BlockId = usize;
pub type InstId = usize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Initializer {
    Null,
    Scalar,
    /// Address of a global or a function.
    Pointer(ValueId),
    Aggregate(Vec<Initializer>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueKind {
    /// `initializer == None` means the global is defined outside the program.
    Global { initializer: Option<Initializer> },
    Function(FuncId),
    Argument { func: FuncId, index: usize },
    Instruction(InstId),
    ConstantNull,
    ConstantInt(i64),
    Undef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Value {
    pub name: String,
    pub is_pointer: bool,
    pub kind: ValueKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CastKind {
    BitCast,
    IntToPtr,
    PtrToInt,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Opcode {
    Alloca,
    Call,
    Ret,
    Load,
    Store,
    GetElementPtr,
    Phi,
    Cast(CastKind),
    Select,
    VaArg,
    ICmp,
    BinaryOp,
    Shift,
    Br,
    ExtractValue,
    Other,
}

impl Opcode {
    pub fn mnemonic(self) -> &'static str {
        match self {
            Opcode::Alloca => "alloca",
            Opcode::Call => "call",
            Opcode::Ret => "ret",
            Opcode::Load => "load",
            Opcode::Store => "store",
            Opcode::GetElementPtr => "getelementptr",
            Opcode::Phi => "phi",
            Opcode::Cast(CastKind::BitCast) => "bitcast",
            Opcode::Cast(CastKind::IntToPtr) => "inttoptr",
            Opcode::Cast(CastKind::PtrToInt) => "ptrtoint",
            Opcode::Cast(CastKind::Other) => "cast",
            Opcode::Select => "select",
            Opcode::VaArg => "va_arg",
            Opcode::ICmp => "icmp",
            Opcode::BinaryOp => "binop",
            Opcode::Shift => "shift",
            Opcode::Br => "br",
            Opcode::ExtractValue => "extractvalue",
            Opcode::Other => "other",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLoc {
    pub line: u32,
    pub file: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub id: InstId,
    /// The value this instruction produces (also used when it produces none).
    pub value: ValueId,
    pub func: FuncId,
    pub block: BlockId,
    pub opcode: Opcode,
    pub operands: Vec<ValueId>,
    pub is_void: bool,
    #[serde(default)]
    pub loc: Option<SourceLoc>,
}

impl Instruction {
    #[inline]
    pub fn is_call(&self) -> bool {
        self.opcode == Opcode::Call
    }

    /// `br %cond` as opposed to an unconditional jump.
    #[inline]
    pub fn is_conditional_branch(&self) -> bool {
        self.opcode == Opcode::Br && !self.operands.is_empty()
    }

    pub fn call_args(&self) -> &[ValueId] {
        match self.operands.split_last() {
            Some((_, args)) if self.is_call() => args,
            _ => &[],
        }
    }

    pub fn called_value(&self) -> Option<ValueId> {
        if self.is_call() {
            self.operands.last().copied()
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicBlock {
    pub id: BlockId,
    pub func: FuncId,
    pub insts: Vec<InstId>,
    pub succs: Vec<BlockId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Function {
    pub id: FuncId,
    pub name: String,
    pub value: ValueId,
    pub params: Vec<ValueId>,
    /// Layout order, the first block is the entry. Empty for declarations.
    pub blocks: Vec<BlockId>,
    pub is_vararg: bool,
    pub returns_pointer: bool,
    pub returns_void: bool,
}

impl Function {
    #[inline]
    pub fn is_declaration(&self) -> bool {
        self.blocks.is_empty()
    }

    /// A call passing `argc` arguments can bind to this function. Variadic
    /// functions take any number past their fixed parameters.
    pub fn accepts_args(&self, argc: usize) -> bool {
        if self.is_vararg {
            argc >= self.params.len()
        } else {
            argc == self.params.len()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    pub values: Vec<Value>,
    pub functions: Vec<Function>,
    pub blocks: Vec<BasicBlock>,
    pub insts: Vec<Instruction>,
    pub globals: Vec<ValueId>,
}

impl Program {
    pub fn from_json(text: &str) -> Result<Self> {
        let program: Program = serde_json::from_str(text)?;
        program.validate()?;
        Ok(program)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    #[inline]
    pub fn value(&self, id: ValueId) -> &Value {
        &self.values[id]
    }

    #[inline]
    pub fn inst(&self, id: InstId) -> &Instruction {
        &self.insts[id]
    }

    #[inline]
    pub fn func(&self, id: FuncId) -> &Function {
        &self.functions[id]
    }

    #[inline]
    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id]
    }

    pub fn function_by_name(&self, name: &str) -> Option<FuncId> {
        self.functions.iter().position(|f| f.name == name)
    }

    /// Instructions of a function in block layout order.
    pub fn func_insts(&self, func: FuncId) -> impl Iterator<Item = InstId> + '_ {
        self.functions[func]
            .blocks
            .iter()
            .flat_map(move |bb| self.blocks[*bb].insts.iter().copied())
    }

    pub fn inst_count(&self, func: FuncId) -> usize {
        self.functions[func]
            .blocks
            .iter()
            .map(|bb| self.blocks[*bb].insts.len())
            .sum()
    }

    pub fn as_inst(&self, value: ValueId) -> Option<InstId> {
        match self.values.get(value)?.kind {
            ValueKind::Instruction(inst) => Some(inst),
            _ => None,
        }
    }

    pub fn as_function(&self, value: ValueId) -> Option<FuncId> {
        match self.values.get(value)?.kind {
            ValueKind::Function(func) => Some(func),
            _ => None,
        }
    }

    #[inline]
    pub fn is_global(&self, value: ValueId) -> bool {
        matches!(self.values[value].kind, ValueKind::Global { .. })
    }

    /// Globals and functions, the values that live for the whole program.
    #[inline]
    pub fn is_global_value(&self, value: ValueId) -> bool {
        matches!(
            self.values[value].kind,
            ValueKind::Global { .. } | ValueKind::Function(_)
        )
    }

    #[inline]
    pub fn is_null_constant(&self, value: ValueId) -> bool {
        matches!(self.values[value].kind, ValueKind::ConstantNull)
    }

    #[inline]
    pub fn is_pointer(&self, value: ValueId) -> bool {
        self.values[value].is_pointer
    }

    /// Statically known callee of a call instruction.
    pub fn callee(&self, inst: InstId) -> Option<FuncId> {
        self.insts[inst]
            .called_value()
            .and_then(|called| self.as_function(called))
    }

    pub fn is_indirect_call(&self, inst: InstId) -> bool {
        self.insts[inst].is_call() && self.callee(inst).is_none()
    }

    pub fn callee_named(&self, inst: InstId, name: &str) -> bool {
        self.callee(inst)
            .map(|func| self.functions[func].name == name)
            .unwrap_or(false)
    }

    /// Calls to `llvm.dbg.*` carry no program semantics.
    pub fn is_debug_inst(&self, inst: InstId) -> bool {
        self.callee(inst)
            .map(|func| self.functions[func].name.starts_with("llvm.dbg."))
            .unwrap_or(false)
    }

    pub fn value_name(&self, value: ValueId) -> String {
        let v = &self.values[value];
        match &v.kind {
            ValueKind::Global { .. } | ValueKind::Function(_) => format!("@{}", v.name),
            ValueKind::ConstantNull => "null".to_owned(),
            ValueKind::ConstantInt(c) => c.to_string(),
            ValueKind::Undef => "undef".to_owned(),
            _ => format!("%{}", v.name),
        }
    }

    /// One-line textual form, e.g. `%p = call @malloc(8)`.
    pub fn inst_text(&self, inst: InstId) -> String {
        let i = &self.insts[inst];
        let mut text = String::new();
        if !i.is_void {
            let _ = write!(text, "{} = ", self.value_name(i.value));
        }
        text.push_str(i.opcode.mnemonic());
        if let Some(called) = i.called_value() {
            let args: Vec<String> = i.call_args().iter().map(|a| self.value_name(*a)).collect();
            let _ = write!(text, " {}({})", self.value_name(called), args.join(", "));
        } else if !i.operands.is_empty() {
            let ops: Vec<String> = i.operands.iter().map(|o| self.value_name(*o)).collect();
            let _ = write!(text, " {}", ops.join(", "));
        }
        text
    }

    /// Human readable position, `line: N file: F` when debug info exists.
    pub fn source_loc(&self, inst: InstId) -> String {
        let i = &self.insts[inst];
        match &i.loc {
            Some(loc) => format!("line: {} file: {}", loc.line, loc.file),
            None => format!("{}: {}", self.functions[i.func].name, self.inst_text(inst)),
        }
    }

    /// Checks every cross reference of the arenas.
    pub fn validate(&self) -> Result<()> {
        let nv = self.values.len();
        let bad = |msg: String| Err(Error::MalformedProgram(msg));

        for (id, value) in self.values.iter().enumerate() {
            match &value.kind {
                ValueKind::Function(f) if *f >= self.functions.len() => {
                    return bad(format!("value {} refers to function {}", id, f))
                }
                ValueKind::Argument { func, .. } if *func >= self.functions.len() => {
                    return bad(format!("argument {} refers to function {}", id, func))
                }
                ValueKind::Instruction(i) if *i >= self.insts.len() => {
                    return bad(format!("value {} refers to instruction {}", id, i))
                }
                ValueKind::Global {
                    initializer: Some(init),
                } => {
                    if let Some(target) = init_targets(init).into_iter().find(|t| *t >= nv) {
                        return bad(format!("global {} initialized with value {}", id, target));
                    }
                }
                _ => {}
            }
        }
        for global in &self.globals {
            if *global >= nv || !self.is_global(*global) {
                return bad(format!("global list names non-global value {}", global));
            }
        }
        for (id, func) in self.functions.iter().enumerate() {
            if func.id != id || func.value >= nv || self.as_function(func.value) != Some(id) {
                return bad(format!("function {} has an inconsistent value", func.name));
            }
            if let Some(p) = func.params.iter().find(|p| **p >= nv) {
                return bad(format!("function {} has parameter {}", func.name, p));
            }
            for bb in &func.blocks {
                if *bb >= self.blocks.len() || self.blocks[*bb].func != id {
                    return bad(format!("function {} lists foreign block {}", func.name, bb));
                }
            }
        }
        for (id, block) in self.blocks.iter().enumerate() {
            if block.id != id || block.func >= self.functions.len() {
                return bad(format!("block {} is inconsistent", id));
            }
            if let Some(s) = block.succs.iter().find(|s| **s >= self.blocks.len()) {
                return bad(format!("block {} has successor {}", id, s));
            }
            for inst in &block.insts {
                if *inst >= self.insts.len() || self.insts[*inst].block != id {
                    return bad(format!("block {} lists foreign instruction {}", id, inst));
                }
            }
        }
        for (id, inst) in self.insts.iter().enumerate() {
            if inst.id != id || inst.value >= nv || self.as_inst(inst.value) != Some(id) {
                return bad(format!("instruction {} has an inconsistent value", id));
            }
            if inst.func >= self.functions.len() || inst.block >= self.blocks.len() {
                return bad(format!("instruction {} has no owner", id));
            }
            if let Some(op) = inst.operands.iter().find(|op| **op >= nv) {
                return bad(format!("instruction {} uses value {}", id, op));
            }
            let arity_ok = match inst.opcode {
                Opcode::Call
                | Opcode::Load
                | Opcode::GetElementPtr
                | Opcode::Cast(_)
                | Opcode::ExtractValue => !inst.operands.is_empty(),
                Opcode::Store | Opcode::ICmp | Opcode::BinaryOp => inst.operands.len() == 2,
                Opcode::Select => inst.operands.len() == 3,
                Opcode::Br => inst.operands.len() <= 1,
                _ => true,
            };
            if !arity_ok {
                return bad(format!(
                    "instruction {} ({}) has {} operands",
                    id,
                    inst.opcode.mnemonic(),
                    inst.operands.len()
                ));
            }
        }
        Ok(())
    }
}

fn init_targets(init: &Initializer) -> Vec<ValueId> {
    match init {
        Initializer::Pointer(v) => vec![*v],
        Initializer::Aggregate(fields) => fields.iter().flat_map(init_targets).collect(),
        Initializer::Null | Initializer::Scalar => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> Program {
        let mut pb = ProgramBuilder::new();
        let malloc = pb.declare("malloc", RetKind::Pointer, &[false]);
        let main = pb.define("main", RetKind::Scalar, &[]);
        let bb = pb.block(main);
        let size = pb.const_int(8);
        let malloc_fn = pb.func_value(malloc);
        let p = pb.call(bb, malloc_fn, &[size]);
        pb.rename(p, "p");
        pb.located(p, 3, "a.c");
        let zero = pb.const_int(0);
        pb.ret(bb, Some(zero));
        pb.finish()
    }

    #[test]
    fn test_inst_text() {
        let program = sample();
        assert_eq!(program.inst_text(0), "%p = call @malloc(8)");
        assert_eq!(program.inst_text(1), "ret 0");
        assert_eq!(program.source_loc(0), "line: 3 file: a.c");
        assert_eq!(program.source_loc(1), "main: ret 0");
    }

    #[test]
    fn test_call_accessors() {
        let program = sample();
        let call = program.inst(0);
        assert!(call.is_call());
        assert_eq!(call.call_args().len(), 1);
        assert_eq!(program.callee(0), program.function_by_name("malloc"));
        assert!(!program.is_indirect_call(0));
        assert!(program.callee_named(0, "malloc"));
    }

    #[test]
    fn test_accepts_args() {
        let mut pb = ProgramBuilder::new();
        let fixed = pb.declare("fixed", RetKind::Void, &[true, false]);
        let printf = pb.declare("printf", RetKind::Scalar, &[true]);
        pb.set_vararg(printf);
        let program = pb.finish();

        let fixed = program.func(fixed);
        assert!(fixed.accepts_args(2));
        assert!(!fixed.accepts_args(1));
        assert!(!fixed.accepts_args(3));
        let printf = program.func(printf);
        assert!(printf.accepts_args(1));
        assert!(printf.accepts_args(4));
        assert!(!printf.accepts_args(0));
    }

    #[test]
    fn test_json_roundtrip_validates() {
        let program = sample();
        let text = program.to_json().unwrap();
        let back = Program::from_json(&text).unwrap();
        assert_eq!(back, program);
    }

    #[test]
    fn test_validate_rejects_dangling_operand() {
        let mut program = sample();
        program.insts[0].operands.push(1000);
        assert!(matches!(program.validate(), Err(Error::MalformedProgram(_))));
    }

    #[test]
    fn test_validate_rejects_bad_store_arity() {
        let mut program = sample();
        program.insts[1].opcode = Opcode::Store;
        assert!(program.validate().is_err());
    }
}
