//! Abstract IR operations.
//!
//! Every [`Op`] has a static [`OpInfo`] entry describing its arity,
//! commutativity, whether it is virtual (produces no machine code), whether
//! it is abstract or specific to one architecture, whether it has side
//! effects, and which [`ExtraKind`] payload it carries. The builder in
//! [`super::Function`] checks new values against this table.

use std::fmt;

/// Payload kind an operation expects in [`super::Extra`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtraKind {
    None,
    Bool,
    Int,
    Str,
    Parameter,
    Callee,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    // Integer arithmetic. The operand width comes from the value type.
    Negate,
    Add,
    Subtract,
    Multiply,
    Divide,
    AddString,

    ConstantBool,
    ConstantInt,
    ConstantUntypedInt,
    ConstantString,

    Drop,
    Copy,

    MakeMemoryState,
    Parameter,
    MakeResult,
    FunctionCall,
    ResultValue,
    ResultMemory,

    StringPtr,
    StringLen,
    Cast,
}

impl Op {
    pub const fn info(self) -> OpInfo {
        use Op::*;
        match self {
            Negate => OpInfo { name: "Negate", operands: 1, commutative: false, is_virtual: false, is_abstract: true, effects: false, extra: ExtraKind::None },
            Add => OpInfo { name: "Add", operands: 2, commutative: true, is_virtual: false, is_abstract: true, effects: false, extra: ExtraKind::None },
            Subtract => OpInfo { name: "Subtract", operands: 2, commutative: false, is_virtual: false, is_abstract: true, effects: false, extra: ExtraKind::None },
            Multiply => OpInfo { name: "Multiply", operands: 2, commutative: true, is_virtual: false, is_abstract: true, effects: false, extra: ExtraKind::None },
            Divide => OpInfo { name: "Divide", operands: 2, commutative: false, is_virtual: false, is_abstract: true, effects: false, extra: ExtraKind::None },
            AddString => OpInfo { name: "AddString", operands: 2, commutative: false, is_virtual: false, is_abstract: true, effects: false, extra: ExtraKind::None },
            ConstantBool => OpInfo { name: "ConstantBool", operands: 0, commutative: false, is_virtual: false, is_abstract: true, effects: false, extra: ExtraKind::Bool },
            ConstantInt => OpInfo { name: "ConstantInt", operands: 0, commutative: false, is_virtual: false, is_abstract: true, effects: false, extra: ExtraKind::Int },
            ConstantUntypedInt => OpInfo { name: "ConstantUntypedInt", operands: 0, commutative: false, is_virtual: false, is_abstract: true, effects: false, extra: ExtraKind::Int },
            ConstantString => OpInfo { name: "ConstantString", operands: 0, commutative: false, is_virtual: false, is_abstract: true, effects: false, extra: ExtraKind::Str },
            Drop => OpInfo { name: "Drop", operands: 1, commutative: false, is_virtual: false, is_abstract: true, effects: false, extra: ExtraKind::None },
            Copy => OpInfo { name: "Copy", operands: 1, commutative: false, is_virtual: false, is_abstract: true, effects: false, extra: ExtraKind::None },
            MakeMemoryState => OpInfo { name: "MakeMemoryState", operands: 0, commutative: false, is_virtual: true, is_abstract: true, effects: false, extra: ExtraKind::None },
            Parameter => OpInfo { name: "Parameter", operands: 0, commutative: false, is_virtual: true, is_abstract: true, effects: false, extra: ExtraKind::Parameter },
            MakeResult => OpInfo { name: "MakeResult", operands: -1, commutative: false, is_virtual: false, is_abstract: true, effects: false, extra: ExtraKind::None },
            FunctionCall => OpInfo { name: "FunctionCall", operands: -1, commutative: false, is_virtual: false, is_abstract: true, effects: true, extra: ExtraKind::Callee },
            ResultValue => OpInfo { name: "ResultValue", operands: 1, commutative: false, is_virtual: true, is_abstract: true, effects: false, extra: ExtraKind::None },
            ResultMemory => OpInfo { name: "ResultMemory", operands: 1, commutative: false, is_virtual: true, is_abstract: true, effects: false, extra: ExtraKind::None },
            StringPtr => OpInfo { name: "StringPtr", operands: 1, commutative: false, is_virtual: false, is_abstract: true, effects: false, extra: ExtraKind::None },
            StringLen => OpInfo { name: "StringLen", operands: 1, commutative: false, is_virtual: false, is_abstract: true, effects: false, extra: ExtraKind::None },
            Cast => OpInfo { name: "Cast", operands: 1, commutative: false, is_virtual: false, is_abstract: true, effects: false, extra: ExtraKind::None },
        }
    }

    pub fn name(self) -> &'static str {
        self.info().name
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OpInfo {
    pub name: &'static str,
    /// Number of arguments, or -1 for variadic.
    pub operands: i8,
    pub commutative: bool,
    pub is_virtual: bool,
    /// Architecture-independent. Lowering replaces abstract ops with
    /// machine-specific ones before code generation.
    pub is_abstract: bool,
    /// Consumes a memory state as its first argument and yields a new one.
    pub effects: bool,
    pub extra: ExtraKind,
}

impl OpInfo {
    pub const fn is_variadic(&self) -> bool {
        self.operands < 0
    }

    /// Returns true if `n` arguments are acceptable.
    pub const fn accepts(&self, n: usize) -> bool {
        self.is_variadic() || self.operands as usize == n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arity_table() {
        assert!(Op::Add.info().accepts(2));
        assert!(!Op::Add.info().accepts(1));
        assert!(Op::FunctionCall.info().accepts(0));
        assert!(Op::FunctionCall.info().accepts(7));
        assert!(Op::MakeMemoryState.info().accepts(0));
    }

    #[test]
    fn test_only_calls_have_effects() {
        let ops = [
            Op::Negate, Op::Add, Op::Subtract, Op::Multiply, Op::Divide, Op::AddString,
            Op::ConstantBool, Op::ConstantInt, Op::ConstantUntypedInt, Op::ConstantString,
            Op::Drop, Op::Copy, Op::MakeMemoryState, Op::Parameter, Op::MakeResult,
            Op::ResultValue, Op::ResultMemory, Op::StringPtr, Op::StringLen, Op::Cast,
        ];
        for op in ops {
            assert!(!op.info().effects, "{} should be pure", op);
        }
        assert!(Op::FunctionCall.info().effects);
    }

    #[test]
    fn test_all_ops_abstract() {
        let ops = [
            Op::Negate, Op::Add, Op::Subtract, Op::Multiply, Op::Divide, Op::AddString,
            Op::ConstantBool, Op::ConstantInt, Op::ConstantUntypedInt, Op::ConstantString,
            Op::Drop, Op::Copy, Op::MakeMemoryState, Op::Parameter, Op::MakeResult,
            Op::FunctionCall, Op::ResultValue, Op::ResultMemory, Op::StringPtr, Op::StringLen,
            Op::Cast,
        ];
        for op in ops {
            assert!(op.info().is_abstract, "{} should be abstract", op);
        }
    }

    #[test]
    fn test_commutative_ops() {
        assert!(Op::Add.info().commutative);
        assert!(Op::Multiply.info().commutative);
        assert!(!Op::Subtract.info().commutative);
        assert!(!Op::Divide.info().commutative);
    }
}
