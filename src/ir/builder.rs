use super::{
    BasicBlock, BlockId, CastKind, FuncId, Function, Initializer, InstId, Instruction, Opcode,
    Program, SourceLoc, Value, ValueId, ValueKind,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetKind {
    Void,
    Scalar,
    Pointer,
}

/// Incremental construction of a `Program`.
///
/// Instruction results are named `%<inst id>` unless renamed.
pub struct ProgramBuilder {
    program: Program,
    null: Option<ValueId>,
}

impl Default for ProgramBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self {
            program: Program::default(),
            null: None,
        }
    }

    pub fn finish(self) -> Program {
        self.program
    }

    fn add_value(&mut self, name: String, is_pointer: bool, kind: ValueKind) -> ValueId {
        let id = self.program.values.len();
        self.program.values.push(Value {
            name,
            is_pointer,
            kind,
        });
        id
    }

    pub fn rename(&mut self, value: ValueId, name: &str) {
        self.program.values[value].name = name.to_owned();
    }

    pub fn located(&mut self, value: ValueId, line: u32, file: &str) {
        if let Some(inst) = self.program.as_inst(value) {
            self.program.insts[inst].loc = Some(SourceLoc {
                line,
                file: file.to_owned(),
            });
        }
    }

    pub fn null(&mut self) -> ValueId {
        if let Some(null) = self.null {
            return null;
        }
        let null = self.add_value("null".to_owned(), true, ValueKind::ConstantNull);
        self.null = Some(null);
        null
    }

    pub fn undef(&mut self, is_pointer: bool) -> ValueId {
        self.add_value("undef".to_owned(), is_pointer, ValueKind::Undef)
    }

    pub fn const_int(&mut self, c: i64) -> ValueId {
        self.add_value(c.to_string(), false, ValueKind::ConstantInt(c))
    }

    pub fn global(&mut self, name: &str, initializer: Option<Initializer>) -> ValueId {
        let id = self.add_value(name.to_owned(), true, ValueKind::Global { initializer });
        self.program.globals.push(id);
        id
    }

    fn add_function(&mut self, name: &str, ret: RetKind, params: &[bool]) -> FuncId {
        let func = self.program.functions.len();
        let value = self.add_value(name.to_owned(), true, ValueKind::Function(func));
        let params: Vec<ValueId> = params
            .iter()
            .enumerate()
            .map(|(index, is_pointer)| {
                self.add_value(
                    format!("{}.arg{}", name, index),
                    *is_pointer,
                    ValueKind::Argument { func, index },
                )
            })
            .collect();
        self.program.functions.push(Function {
            id: func,
            name: name.to_owned(),
            value,
            params,
            blocks: Vec::new(),
            is_vararg: false,
            returns_pointer: ret == RetKind::Pointer,
            returns_void: ret == RetKind::Void,
        });
        func
    }

    /// External function, no body.
    pub fn declare(&mut self, name: &str, ret: RetKind, params: &[bool]) -> FuncId {
        self.add_function(name, ret, params)
    }

    /// Function with a body; add blocks with `block`.
    pub fn define(&mut self, name: &str, ret: RetKind, params: &[bool]) -> FuncId {
        self.add_function(name, ret, params)
    }

    pub fn set_vararg(&mut self, func: FuncId) {
        self.program.functions[func].is_vararg = true;
    }

    pub fn func_value(&self, func: FuncId) -> ValueId {
        self.program.functions[func].value
    }

    pub fn param(&self, func: FuncId, index: usize) -> ValueId {
        self.program.functions[func].params[index]
    }

    pub fn block(&mut self, func: FuncId) -> BlockId {
        let id = self.program.blocks.len();
        self.program.blocks.push(BasicBlock {
            id,
            func,
            insts: Vec::new(),
            succs: Vec::new(),
        });
        self.program.functions[func].blocks.push(id);
        id
    }

    pub fn link(&mut self, from: BlockId, to: BlockId) {
        let succs = &mut self.program.blocks[from].succs;
        if !succs.contains(&to) {
            succs.push(to);
        }
    }

    fn push(
        &mut self,
        bb: BlockId,
        opcode: Opcode,
        operands: Vec<ValueId>,
        is_void: bool,
        is_pointer: bool,
    ) -> ValueId {
        let id: InstId = self.program.insts.len();
        let func = self.program.blocks[bb].func;
        let value = self.add_value(id.to_string(), is_pointer, ValueKind::Instruction(id));
        self.program.insts.push(Instruction {
            id,
            value,
            func,
            block: bb,
            opcode,
            operands,
            is_void,
            loc: None,
        });
        self.program.blocks[bb].insts.push(id);
        value
    }

    pub fn alloca(&mut self, bb: BlockId) -> ValueId {
        self.push(bb, Opcode::Alloca, Vec::new(), false, true)
    }

    pub fn load(&mut self, bb: BlockId, ptr: ValueId, is_pointer: bool) -> ValueId {
        self.push(bb, Opcode::Load, vec![ptr], false, is_pointer)
    }

    pub fn store(&mut self, bb: BlockId, value: ValueId, ptr: ValueId) -> ValueId {
        self.push(bb, Opcode::Store, vec![value, ptr], true, false)
    }

    pub fn gep(&mut self, bb: BlockId, base: ValueId, offset: ValueId) -> ValueId {
        self.push(bb, Opcode::GetElementPtr, vec![base, offset], false, true)
    }

    /// Direct call when `callee` is a function value; its signature decides
    /// the result type.
    pub fn call(&mut self, bb: BlockId, callee: ValueId, args: &[ValueId]) -> ValueId {
        let ret = match self.program.as_function(callee) {
            Some(func) => {
                let f = &self.program.functions[func];
                if f.returns_void {
                    RetKind::Void
                } else if f.returns_pointer {
                    RetKind::Pointer
                } else {
                    RetKind::Scalar
                }
            }
            None => RetKind::Scalar,
        };
        self.call_with(bb, callee, args, ret)
    }

    /// Call through an arbitrary value, typed by `ret`.
    pub fn call_with(
        &mut self,
        bb: BlockId,
        callee: ValueId,
        args: &[ValueId],
        ret: RetKind,
    ) -> ValueId {
        let mut operands = args.to_vec();
        operands.push(callee);
        self.push(
            bb,
            Opcode::Call,
            operands,
            ret == RetKind::Void,
            ret == RetKind::Pointer,
        )
    }

    pub fn ret(&mut self, bb: BlockId, value: Option<ValueId>) -> ValueId {
        self.push(bb, Opcode::Ret, value.into_iter().collect(), true, false)
    }

    /// Unconditional jump to `target`.
    pub fn br(&mut self, bb: BlockId, target: BlockId) -> ValueId {
        self.link(bb, target);
        self.push(bb, Opcode::Br, Vec::new(), true, false)
    }

    pub fn cond_br(
        &mut self,
        bb: BlockId,
        cond: ValueId,
        then_bb: BlockId,
        else_bb: BlockId,
    ) -> ValueId {
        self.link(bb, then_bb);
        self.link(bb, else_bb);
        self.push(bb, Opcode::Br, vec![cond], true, false)
    }

    pub fn icmp(&mut self, bb: BlockId, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.push(bb, Opcode::ICmp, vec![lhs, rhs], false, false)
    }

    pub fn binary(&mut self, bb: BlockId, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.push(bb, Opcode::BinaryOp, vec![lhs, rhs], false, false)
    }

    pub fn shift(&mut self, bb: BlockId, value: ValueId, amount: ValueId) -> ValueId {
        self.push(bb, Opcode::Shift, vec![value, amount], false, false)
    }

    pub fn phi(&mut self, bb: BlockId, incoming: &[ValueId], is_pointer: bool) -> ValueId {
        self.push(bb, Opcode::Phi, incoming.to_vec(), false, is_pointer)
    }

    pub fn select(&mut self, bb: BlockId, cond: ValueId, a: ValueId, b: ValueId) -> ValueId {
        let is_pointer = self.program.is_pointer(a);
        self.push(bb, Opcode::Select, vec![cond, a, b], false, is_pointer)
    }

    pub fn cast(&mut self, bb: BlockId, kind: CastKind, value: ValueId, is_pointer: bool) -> ValueId {
        self.push(bb, Opcode::Cast(kind), vec![value], false, is_pointer)
    }

    pub fn vaarg(&mut self, bb: BlockId, is_pointer: bool) -> ValueId {
        self.push(bb, Opcode::VaArg, Vec::new(), false, is_pointer)
    }

    pub fn extract_value(&mut self, bb: BlockId, aggregate: ValueId, is_pointer: bool) -> ValueId {
        self.push(bb, Opcode::ExtractValue, vec![aggregate], false, is_pointer)
    }
}
