// This module implements kiln's single static assignment intermediate representation.
// A Function owns every Block and Value it contains in two arenas indexed by BlockId and
// ValueId, so the control-flow graph's back-references (predecessor edges, a value's
// owning block) are plain indices rather than shared pointers. Ids come from two
// per-function allocators that start at 1 and panic before reaching i32::MAX. Values are
// write-once: their id, op, type and extra never change after creation, and only their
// use count and source span can be updated. Side effects are ordered through synthetic
// MemoryState values: each function creates one at entry, every effecting value consumes
// the current one, and every Return/ReturnJump block's Result control consumes the final
// one on its path. The builder API asserts the op table's arity and the block kind's
// control/successor contract, because a violation is a bug in the lowering pass.

//! SSA intermediate representation.
//!
//! # Block kinds
//!
//! ```text
//! Kind        | Control         | Successors
//! ------------+-----------------+------------
//! Normal      | optional        | [next]
//! If          | boolean value   | [then, else]
//! Return      | result value    | []
//! ReturnJump  | result value    | []
//! ```

pub mod link;
pub mod op;
pub mod print;
pub mod types;
pub mod verify;

pub use link::{Link, LinkType};
pub use op::{ExtraKind, Op, OpInfo};
pub use types::{BasicKind, Param, Signature, Type};
pub use verify::verify;

use hashbrown::{HashMap, HashSet};
use std::fmt;

/// Identifies a block within its function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(u32);

/// Identifies a value within its function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(u32);

impl BlockId {
    pub fn raw(self) -> u32 {
        self.0
    }

    fn index(self) -> usize {
        self.0 as usize - 1
    }
}

impl ValueId {
    pub fn raw(self) -> u32 {
        self.0
    }

    fn index(self) -> usize {
        self.0 as usize - 1
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}", self.0)
    }
}

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A range of source positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Span {
    pub pos: u32,
    pub end: u32,
}

impl Span {
    pub fn new(pos: u32, end: u32) -> Self {
        Self { pos, end }
    }

    pub fn is_unknown(&self) -> bool {
        self.pos == 0 && self.end == 0
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unknown() {
            f.write_str("unknown position")
        } else {
            write!(f, "{}..{}", self.pos, self.end)
        }
    }
}

/// Hands out monotonically increasing ids.
#[derive(Debug, Clone, Default)]
struct IdAllocator {
    last: u32,
}

impl IdAllocator {
    fn next(&mut self) -> u32 {
        let next = self.last + 1;
        if next >= i32::MAX as u32 {
            panic!("function has too many values/blocks");
        }

        self.last = next;
        next
    }

    fn last(&self) -> u32 {
        self.last
    }
}

/// Opcode-specific payload of a value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Extra {
    None,
    Bool(bool),
    Int(i64),
    Str(String),
    /// Index of the function parameter.
    Parameter(u32),
    /// Fully-qualified name of the called function.
    Callee(String),
}

impl Extra {
    pub fn kind(&self) -> ExtraKind {
        match self {
            Extra::None => ExtraKind::None,
            Extra::Bool(_) => ExtraKind::Bool,
            Extra::Int(_) => ExtraKind::Int,
            Extra::Str(_) => ExtraKind::Str,
            Extra::Parameter(_) => ExtraKind::Parameter,
            Extra::Callee(_) => ExtraKind::Callee,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Extra::None)
    }
}

impl fmt::Display for Extra {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Extra::None => Ok(()),
            Extra::Bool(b) => write!(f, "{}", b),
            Extra::Int(i) => write!(f, "{}", i),
            Extra::Str(s) => write!(f, "{:?}", s),
            Extra::Parameter(i) => write!(f, "param {}", i),
            Extra::Callee(name) => f.write_str(name),
        }
    }
}

/// One SSA value.
#[derive(Debug, Clone)]
pub struct Value {
    id: ValueId,
    op: Op,
    ty: Type,
    extra: Extra,
    args: Vec<ValueId>,
    block: BlockId,
    pub span: Span,
    uses: u32,
}

impl Value {
    pub fn id(&self) -> ValueId {
        self.id
    }

    pub fn op(&self) -> Op {
        self.op
    }

    pub fn ty(&self) -> &Type {
        &self.ty
    }

    pub fn extra(&self) -> &Extra {
        &self.extra
    }

    pub fn args(&self) -> &[ValueId] {
        &self.args
    }

    pub fn block(&self) -> BlockId {
        self.block
    }

    /// Number of times this value is used as an argument or block control.
    pub fn uses(&self) -> u32 {
        self.uses
    }
}

/// Kinds of basic block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockKind {
    Normal,
    If,
    Return,
    /// A tail jump out of the function. Terminal like Return.
    ReturnJump,
}

impl BlockKind {
    pub const fn name(self) -> &'static str {
        match self {
            BlockKind::Normal => "Normal",
            BlockKind::If => "If",
            BlockKind::Return => "Return",
            BlockKind::ReturnJump => "ReturnJump",
        }
    }

    /// The exact number of successors a finished block has.
    pub const fn successors(self) -> usize {
        match self {
            BlockKind::Normal => 1,
            BlockKind::If => 2,
            BlockKind::Return | BlockKind::ReturnJump => 0,
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, BlockKind::Return | BlockKind::ReturnJump)
    }
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Likelihood that an If block's first successor is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(i8)]
pub enum BranchPrediction {
    Unlikely = -1,
    #[default]
    Unknown = 0,
    Likely = 1,
}

/// One half of a paired control-flow edge.
///
/// `index` is the position in the target block's opposite edge list
/// (predecessors for a successor edge, successors for a predecessor edge)
/// where the edge back to the origin lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub block: BlockId,
    pub index: usize,
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}, {}}}", self.block, self.index)
    }
}

/// One basic block.
#[derive(Debug, Clone)]
pub struct Block {
    id: BlockId,
    kind: BlockKind,
    likely: BranchPrediction,
    succs: Vec<Edge>,
    preds: Vec<Edge>,
    control: Option<ValueId>,
    pub span: Span,
    values: Vec<ValueId>,
}

impl Block {
    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn kind(&self) -> BlockKind {
        self.kind
    }

    pub fn likely(&self) -> BranchPrediction {
        self.likely
    }

    pub fn successors(&self) -> &[Edge] {
        &self.succs
    }

    pub fn predecessors(&self) -> &[Edge] {
        &self.preds
    }

    pub fn control(&self) -> Option<ValueId> {
        self.control
    }

    /// Values in program order.
    pub fn values(&self) -> &[ValueId] {
        &self.values
    }
}

/// A function in SSA form.
#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub signature: Signature,
    blocks: Vec<Block>,
    values: Vec<Value>,
    entry: Option<BlockId>,
    block_ids: IdAllocator,
    value_ids: IdAllocator,
    named_values: HashMap<String, Vec<ValueId>>,
    pub links: Vec<Link>,
}

impl Function {
    pub fn new(name: impl Into<String>, signature: Signature) -> Self {
        Self {
            name: name.into(),
            signature,
            blocks: Vec::new(),
            values: Vec::new(),
            entry: None,
            block_ids: IdAllocator::default(),
            value_ids: IdAllocator::default(),
            named_values: HashMap::new(),
            links: Vec::new(),
        }
    }

    pub fn entry(&self) -> Option<BlockId> {
        self.entry
    }

    pub fn set_entry(&mut self, block: BlockId) {
        assert!(block.index() < self.blocks.len(), "{}: no block {}", self.name, block);
        self.entry = Some(block);
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.index()]
    }

    pub fn value(&self, id: ValueId) -> &Value {
        &self.values[id.index()]
    }

    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter()
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.values.iter()
    }

    /// The largest value id handed out so far.
    pub fn last_value_id(&self) -> u32 {
        self.value_ids.last()
    }

    /// Values bound to a declared name, such as a parameter.
    pub fn named(&self, name: &str) -> &[ValueId] {
        self.named_values.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Names bound to `value`, sorted.
    pub fn names_of(&self, value: ValueId) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .named_values
            .iter()
            .filter(|(_, values)| values.contains(&value))
            .map(|(name, _)| name.as_str())
            .collect();
        names.sort_unstable();
        names
    }

    pub fn bind_name(&mut self, name: impl Into<String>, value: ValueId) {
        assert!(value.index() < self.values.len(), "{}: no value {}", self.name, value);
        self.named_values.entry(name.into()).or_default().push(value);
    }

    /// Creates a block and appends it to the function.
    ///
    /// The first block created becomes the entry block.
    pub fn new_block(&mut self, kind: BlockKind, span: Span) -> BlockId {
        let id = BlockId(self.block_ids.next());
        self.blocks.push(Block {
            id,
            kind,
            likely: BranchPrediction::Unknown,
            succs: Vec::new(),
            preds: Vec::new(),
            control: None,
            span,
            values: Vec::new(),
        });
        if self.entry.is_none() {
            self.entry = Some(id);
        }
        id
    }

    pub fn new_value(&mut self, block: BlockId, span: Span, op: Op, ty: Type, args: &[ValueId]) -> ValueId {
        self.new_value_extra(block, span, op, ty, Extra::None, args)
    }

    pub fn new_value_int(&mut self, block: BlockId, span: Span, op: Op, ty: Type, extra: i64, args: &[ValueId]) -> ValueId {
        self.new_value_extra(block, span, op, ty, Extra::Int(extra), args)
    }

    /// Creates a value at the end of `block`, incrementing the use count of
    /// each argument.
    ///
    /// # Panics
    ///
    /// Panics if the arguments, type or extra do not fit `op`.
    pub fn new_value_extra(
        &mut self,
        block: BlockId,
        span: Span,
        op: Op,
        ty: Type,
        extra: Extra,
        args: &[ValueId],
    ) -> ValueId {
        assert!(block.index() < self.blocks.len(), "{}: no block {}", self.name, block);
        self.check_new_value(op, &ty, &extra, args);

        let id = ValueId(self.value_ids.next());
        for arg in args {
            self.values[arg.index()].uses += 1;
        }

        self.values.push(Value {
            id,
            op,
            ty,
            extra,
            args: args.to_vec(),
            block,
            span,
            uses: 0,
        });
        self.blocks[block.index()].values.push(id);
        id
    }

    fn check_new_value(&self, op: Op, ty: &Type, extra: &Extra, args: &[ValueId]) {
        let info = op.info();
        assert!(
            info.accepts(args.len()),
            "{}: {} takes {} arguments, got {}",
            self.name,
            op,
            info.operands,
            args.len()
        );
        assert_eq!(info.extra, extra.kind(), "{}: {} given extra {:?}", self.name, op, extra);
        for arg in args {
            assert!(arg.index() < self.values.len(), "{}: {} argument {} does not exist", self.name, op, arg);
        }

        let arg_ty = |i: usize| &self.values[args[i].index()].ty;
        match op {
            Op::MakeMemoryState => {
                assert!(ty.is_memory_state(), "{}: {} must have type memory state, got {}", self.name, op, ty)
            }
            Op::FunctionCall => {
                assert!(ty.is_result(), "{}: {} must have a result type, got {}", self.name, op, ty);
                assert!(
                    !args.is_empty() && arg_ty(0).is_memory_state(),
                    "{}: {} must take a memory state first",
                    self.name,
                    op
                );
            }
            Op::MakeResult => {
                assert!(ty.is_result(), "{}: {} must have a result type, got {}", self.name, op, ty);
                assert!(
                    (1..=2).contains(&args.len()) && arg_ty(args.len() - 1).is_memory_state(),
                    "{}: {} takes an optional value then a memory state",
                    self.name,
                    op
                );
            }
            Op::ResultMemory => {
                assert!(arg_ty(0).is_result(), "{}: {} takes a result", self.name, op);
                assert!(ty.is_memory_state(), "{}: {} must have type memory state", self.name, op);
            }
            Op::ResultValue => {
                assert!(arg_ty(0).is_result(), "{}: {} takes a result", self.name, op);
            }
            Op::Negate | Op::Add | Op::Subtract | Op::Multiply | Op::Divide => {
                assert!(ty.is_integer(), "{}: {} needs an integer type, got {}", self.name, op, ty);
                for i in 0..args.len() {
                    assert_eq!(arg_ty(i), ty, "{}: {} operand {} has the wrong type", self.name, op, i);
                }
            }
            Op::AddString => {
                assert!(ty.is_string(), "{}: {} needs a string type, got {}", self.name, op, ty);
            }
            Op::ConstantBool => assert!(ty.is_boolean(), "{}: {} needs a boolean type", self.name, op),
            Op::ConstantInt | Op::ConstantUntypedInt => {
                assert!(ty.is_integer(), "{}: {} needs an integer type", self.name, op)
            }
            Op::ConstantString => assert!(ty.is_string(), "{}: {} needs a string type", self.name, op),
            Op::Drop | Op::Copy | Op::Parameter | Op::StringPtr | Op::StringLen | Op::Cast => {
                assert!(!ty.is_synthetic(), "{}: {} cannot produce {}", self.name, op, ty);
            }
        }
    }

    /// Sets the control value of `block`, counting it as a use.
    ///
    /// # Panics
    ///
    /// Panics if the value's type does not suit the block kind.
    pub fn set_control(&mut self, block: BlockId, value: ValueId) {
        let kind = self.blocks[block.index()].kind;
        let ty = &self.values[value.index()].ty;
        match kind {
            BlockKind::Normal => {}
            BlockKind::If => assert!(ty.is_boolean(), "{}: If block {} needs a boolean control, got {}", self.name, block, ty),
            BlockKind::Return | BlockKind::ReturnJump => {
                assert!(ty.is_result(), "{}: {} block {} needs a result control, got {}", self.name, kind, block, ty)
            }
        }

        let b = &mut self.blocks[block.index()];
        if let Some(old) = b.control.replace(value) {
            self.values[old.index()].uses -= 1;
        }
        self.values[value.index()].uses += 1;
    }

    /// Adds a paired successor/predecessor edge from `from` to `to`.
    ///
    /// # Panics
    ///
    /// Panics if `from` already has all the successors its kind allows.
    pub fn add_edge(&mut self, from: BlockId, to: BlockId) {
        assert!(to.index() < self.blocks.len(), "{}: no block {}", self.name, to);
        let source = &self.blocks[from.index()];
        assert!(
            source.succs.len() < source.kind.successors(),
            "{}: {} block {} cannot have {} successors",
            self.name,
            source.kind,
            from,
            source.succs.len() + 1
        );

        let succ_index = source.succs.len();
        let pred_index = self.blocks[to.index()].preds.len();
        self.blocks[from.index()].succs.push(Edge { block: to, index: pred_index });
        self.blocks[to.index()].preds.push(Edge { block: from, index: succ_index });
    }

    /// Sets the branch prediction for an If block.
    pub fn set_likely(&mut self, block: BlockId, likely: BranchPrediction) {
        let b = &mut self.blocks[block.index()];
        assert!(
            b.kind == BlockKind::If || likely == BranchPrediction::Unknown,
            "{}: only If blocks take a branch prediction",
            self.name
        );
        b.likely = likely;
    }

    /// Replaces argument `index` of `value`, moving the use count.
    ///
    /// # Panics
    ///
    /// Panics if the replacement has a different type from the old
    /// argument, or if it is `value` or depends on `value`.
    pub fn replace_arg(&mut self, value: ValueId, index: usize, with: ValueId) {
        assert!(with.index() < self.values.len(), "{}: no value {}", self.name, with);
        assert!(
            !self.depends_on(with, value),
            "{}: {} cannot take {} as an argument: argument cycle",
            self.name,
            value,
            with
        );
        let old = self.values[value.index()].args[index];
        assert_eq!(
            self.values[old.index()].ty,
            self.values[with.index()].ty,
            "{}: replacement for {} argument {} has a different type",
            self.name,
            value,
            index
        );
        self.values[old.index()].uses -= 1;
        self.values[with.index()].uses += 1;
        self.values[value.index()].args[index] = with;
    }

    pub fn add_link(&mut self, link: Link) {
        self.links.push(link);
    }

    /// Whether `target` is `from` or is reachable through its arguments.
    fn depends_on(&self, from: ValueId, target: ValueId) -> bool {
        let mut seen = HashSet::new();
        let mut stack = vec![from];
        while let Some(id) = stack.pop() {
            if id == target {
                return true;
            }
            if seen.insert(id) {
                stack.extend_from_slice(&self.values[id.index()].args);
            }
        }
        false
    }
}
