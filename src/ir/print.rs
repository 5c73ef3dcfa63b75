//! Textual rendering of functions for diagnostics.
//!
//! The output is not meant to be parsed back. A function prints as:
//!
//! ```text
//! name type
//! b1:
//!     v1 := (op args... (extra e)) type (names)
//!     (Kind vN) -> b2, b3 (likely)
//! ```

use super::{Block, BranchPrediction, Function, Value};
use std::fmt::{self, Write};

impl Function {
    /// Returns a textual representation of the function.
    pub fn print(&self) -> String {
        self.to_string()
    }

    /// Renders one value, left-aligning ids to `width` digits.
    pub fn print_value(&self, value: &Value, width: usize) -> String {
        let mut out = String::new();
        let _ = self.write_value(&mut out, value, width);
        out
    }

    fn write_value(&self, out: &mut impl Write, value: &Value, width: usize) -> fmt::Result {
        write!(out, "v{:<width$} := ({}", value.id().raw(), value.op(), width = width)?;
        for arg in value.args() {
            write!(out, " {}", arg)?;
        }
        if !value.extra().is_none() {
            write!(out, " (extra {})", value.extra())?;
        }
        write!(out, ") {}", value.ty())?;

        let names = self.names_of(value.id());
        if !names.is_empty() {
            write!(out, " ({})", names.join(", "))?;
        }
        Ok(())
    }

    fn write_block_exit(&self, out: &mut impl Write, block: &Block) -> fmt::Result {
        write!(out, "({}", block.kind())?;
        if let Some(control) = block.control() {
            write!(out, " {}", control)?;
        }
        out.write_char(')')?;

        if !block.successors().is_empty() {
            out.write_str(" -> ")?;
            for (i, edge) in block.successors().iter().enumerate() {
                if i > 0 {
                    out.write_str(", ")?;
                }
                write!(out, "{}", edge.block)?;
            }
            match block.likely() {
                BranchPrediction::Likely => out.write_str(" (likely)")?,
                BranchPrediction::Unlikely => out.write_str(" (unlikely)")?,
                BranchPrediction::Unknown => {}
            }
        }
        Ok(())
    }
}

fn digits(mut n: u32) -> usize {
    let mut count = 1;
    while n >= 10 {
        n /= 10;
        count += 1;
    }
    count
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} {}", self.name, self.signature)?;
        let width = digits(self.last_value_id());
        for block in self.blocks() {
            writeln!(f, "{}:", block.id())?;
            for &id in block.values() {
                f.write_char('\t')?;
                self.write_value(f, self.value(id), width)?;
                f.write_char('\n')?;
            }
            f.write_char('\t')?;
            self.write_block_exit(f, block)?;
            f.write_char('\n')?;
        }
        Ok(())
    }
}
