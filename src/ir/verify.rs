//! IR verifier.
//!
//! The builder asserts what it can check locally. The verifier checks the
//! properties that only hold once a function is complete: every block has
//! exactly the successors its kind requires, edges are paired, the argument
//! graph is acyclic, and side effects are totally ordered along every
//! control-flow path by the memory-state chain.

use super::{BlockId, BlockKind, Function, Op, ValueId};
use crate::core::error::{VerifyError, VerifyResult};
use hashbrown::HashSet;

/// Memory state reaching a point in the function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum MemState {
    /// A memory-state value is current.
    Current(ValueId),
    /// An effecting value ran; its memory state has not been projected yet.
    Pending(ValueId),
}

impl MemState {
    fn describe(self) -> String {
        match self {
            MemState::Current(v) => v.to_string(),
            MemState::Pending(v) => format!("the memory state of {}", v),
        }
    }
}

/// Checks that `f` is well formed.
pub fn verify(f: &Function) -> VerifyResult<()> {
    let entry = f.entry().ok_or_else(|| VerifyError::NoEntry {
        function: f.name.clone(),
    })?;

    for block in f.blocks() {
        check_block(f, block.id())?;
    }
    check_acyclic(f)?;
    check_memory_order(f, entry)?;

    log::trace!("{}: verified {} blocks", f.name, f.blocks().count());
    Ok(())
}

fn check_block(f: &Function, id: BlockId) -> VerifyResult<()> {
    let block = f.block(id);
    let kind = block.kind();
    let want = kind.successors();
    if block.successors().len() != want {
        return Err(VerifyError::SuccessorCount {
            function: f.name.clone(),
            block: id,
            kind: kind.name(),
            got: block.successors().len(),
            want,
        });
    }

    let bad_control = |reason: &str| VerifyError::BadControl {
        function: f.name.clone(),
        block: id,
        kind: kind.name(),
        reason: reason.to_string(),
    };
    match (kind, block.control()) {
        (BlockKind::Normal, _) => {}
        (BlockKind::If, Some(c)) if f.value(c).ty().is_boolean() => {}
        (BlockKind::If, _) => return Err(bad_control("expected a boolean value")),
        (BlockKind::Return | BlockKind::ReturnJump, Some(c)) if f.value(c).ty().is_result() => {}
        (BlockKind::Return | BlockKind::ReturnJump, _) => return Err(bad_control("expected a result value")),
    }

    for (i, edge) in block.successors().iter().enumerate() {
        let back = f.block(edge.block).predecessors().get(edge.index);
        if back.map_or(true, |b| b.block != id || b.index != i) {
            return Err(VerifyError::UnpairedEdge {
                function: f.name.clone(),
                from: id,
                to: edge.block,
            });
        }
    }
    for (i, edge) in block.predecessors().iter().enumerate() {
        let forward = f.block(edge.block).successors().get(edge.index);
        if forward.map_or(true, |s| s.block != id || s.index != i) {
            return Err(VerifyError::UnpairedEdge {
                function: f.name.clone(),
                from: edge.block,
                to: id,
            });
        }
    }
    Ok(())
}

fn check_acyclic(f: &Function) -> VerifyResult<()> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        New,
        Active,
        Done,
    }

    let mut marks = vec![Mark::New; f.last_value_id() as usize + 1];
    for value in f.values() {
        if marks[value.id().raw() as usize] != Mark::New {
            continue;
        }

        // Iterative DFS; each frame is a value and the next argument to visit.
        let mut stack = vec![(value.id(), 0usize)];
        marks[value.id().raw() as usize] = Mark::Active;
        while let Some((id, next)) = stack.pop() {
            let args = f.value(id).args();
            if next == args.len() {
                marks[id.raw() as usize] = Mark::Done;
                continue;
            }
            stack.push((id, next + 1));

            let arg = args[next];
            match marks[arg.raw() as usize] {
                Mark::Active => {
                    return Err(VerifyError::ArgumentCycle {
                        function: f.name.clone(),
                        value: arg,
                    })
                }
                Mark::New => {
                    marks[arg.raw() as usize] = Mark::Active;
                    stack.push((arg, 0));
                }
                Mark::Done => {}
            }
        }
    }
    Ok(())
}

fn check_memory_order(f: &Function, entry: BlockId) -> VerifyResult<()> {
    let initial: Vec<ValueId> = f
        .block(entry)
        .values()
        .iter()
        .copied()
        .filter(|&v| f.value(v).op() == Op::MakeMemoryState)
        .collect();
    let total = f.values().filter(|v| v.op() == Op::MakeMemoryState).count();
    if initial.len() != 1 || total != 1 {
        return Err(VerifyError::EntryMemoryState {
            function: f.name.clone(),
            count: total,
        });
    }

    let mut seen = HashSet::new();
    let mut work = vec![(entry, MemState::Current(initial[0]))];
    while let Some((id, state)) = work.pop() {
        if !seen.insert((id, state)) {
            continue;
        }

        let state = walk_block(f, id, state)?;
        let block = f.block(id);
        if block.kind().is_terminal() {
            check_terminal(f, id, state)?;
        }
        for edge in block.successors() {
            work.push((edge.block, state));
        }
    }
    Ok(())
}

/// Advances the memory state through the values of one block.
fn walk_block(f: &Function, id: BlockId, mut state: MemState) -> VerifyResult<MemState> {
    for &v in f.block(id).values() {
        let value = f.value(v);
        let info = value.op().info();
        if info.effects {
            let consumed = value.args()[0];
            if state != MemState::Current(consumed) {
                return Err(VerifyError::StaleMemoryState {
                    function: f.name.clone(),
                    value: v,
                    op: info.name,
                    got: consumed.to_string(),
                    want: state.describe(),
                });
            }
            state = MemState::Pending(v);
        } else if value.op() == Op::ResultMemory && state == MemState::Pending(value.args()[0]) {
            state = MemState::Current(v);
        }
    }
    Ok(state)
}

fn check_terminal(f: &Function, id: BlockId, state: MemState) -> VerifyResult<()> {
    // Presence and type of the control were checked by check_block.
    let Some(control) = f.block(id).control() else {
        return Ok(());
    };

    let value = f.value(control);
    let consumes_final = match value.op() {
        Op::MakeResult => value.args().last().is_some_and(|&m| state == MemState::Current(m)),
        _ if value.op().info().effects => state == MemState::Pending(control),
        _ => false,
    };
    if !consumes_final {
        return Err(VerifyError::UnconsumedMemoryState {
            function: f.name.clone(),
            block: id,
            want: state.describe(),
        });
    }
    Ok(())
}
