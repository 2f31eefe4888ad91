//! Model of the evaluation stack of one procedure.
//!
//! The backend pushes a shared value when it is evaluated for the first time
//! and has further uses. Each later use either pops it (top of stack, last
//! use) or loads it through an `sp`-relative offset. Procedure-call
//! arguments sit on the same stack until the callee returns.

use crate::error::{CodegenError, CodegenResult};
use crate::ir::SharedId;

/// How a use of a stacked value is emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// `pop {r0}`
    Pop,
    /// `ldr r0, [sp, #4*n]`
    Load(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Shared(SharedId),
    /// Anonymous temporary consumed by the emitter itself.
    Temp,
    /// Outgoing argument of a procedure call.
    ProcArg,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    slot: Slot,
    remaining: u32,
}

#[derive(Debug, Default)]
pub struct VirtualStack {
    entries: Vec<Entry>,
}

impl VirtualStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depth(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Push a shared value with `remaining` uses still to come.
    pub fn push(&mut self, id: SharedId, remaining: u32) {
        self.entries.push(Entry {
            slot: Slot::Shared(id),
            remaining,
        });
    }

    pub fn push_temp(&mut self) {
        self.entries.push(Entry {
            slot: Slot::Temp,
            remaining: 1,
        });
    }

    pub fn push_arg(&mut self) {
        self.entries.push(Entry {
            slot: Slot::ProcArg,
            remaining: 0,
        });
    }

    pub fn contains(&self, id: SharedId) -> bool {
        self.entries.iter().any(|e| e.slot == Slot::Shared(id))
    }

    /// Consume one use of `id`.
    pub fn take(&mut self, id: SharedId) -> CodegenResult<Access> {
        let pos = self
            .entries
            .iter()
            .rposition(|e| e.slot == Slot::Shared(id))
            .ok_or_else(|| {
                CodegenError::InternalInvariant(format!("shared value SH{} is not on the stack", id.0))
            })?;
        let len = self.entries.len();
        let entry = &mut self.entries[pos];
        if entry.remaining == 0 {
            return Err(CodegenError::InternalInvariant(format!(
                "shared value SH{} used more often than counted",
                id.0
            )));
        }
        entry.remaining -= 1;
        let top = pos + 1 == len;
        if top && entry.remaining == 0 {
            self.entries.pop();
            Ok(Access::Pop)
        } else {
            Ok(Access::Load(len - pos - 1))
        }
    }

    /// Pop the temporary on top of the stack.
    pub fn pop_temp(&mut self) -> CodegenResult<()> {
        match self.entries.last() {
            Some(Entry {
                slot: Slot::Temp, ..
            }) => {
                self.entries.pop();
                Ok(())
            }
            _ => Err(CodegenError::InternalInvariant(
                "temporary is not on top of the stack".into(),
            )),
        }
    }

    /// Drop exhausted shared values from the top. Returns how many words
    /// `sp` must move.
    pub fn collapse(&mut self) -> usize {
        let mut n = 0;
        while let Some(Entry {
            slot: Slot::Shared(_),
            remaining: 0,
        }) = self.entries.last()
        {
            self.entries.pop();
            n += 1;
        }
        n
    }

    /// Drop `count` call arguments after the callee returned, together with
    /// exhausted values among and above them. Returns how many words `sp`
    /// must move.
    pub fn pop_args(&mut self, count: usize) -> CodegenResult<usize> {
        let mut words = 0;
        let mut args = 0;
        while args < count {
            match self.entries.pop() {
                Some(Entry {
                    slot: Slot::ProcArg,
                    ..
                }) => args += 1,
                Some(Entry {
                    slot: Slot::Shared(_),
                    remaining: 0,
                }) => {}
                _ => {
                    return Err(CodegenError::InternalInvariant(
                        "call arguments are not on top of the stack".into(),
                    ))
                }
            }
            words += 1;
        }
        Ok(words + self.collapse())
    }

    /// Describe what is left, for stack-check faults.
    pub fn describe(&self) -> String {
        self.entries
            .iter()
            .map(|e| match e.slot {
                Slot::Shared(id) => format!("SH{}x{}", id.0, e.remaining),
                Slot::Temp => "tmp".to_string(),
                Slot::ProcArg => "arg".to_string(),
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_use_on_top_pops() {
        let mut s = VirtualStack::new();
        s.push(SharedId(1), 2);
        assert_eq!(s.take(SharedId(1)), Ok(Access::Load(0)));
        assert_eq!(s.take(SharedId(1)), Ok(Access::Pop));
        assert!(s.is_empty());
    }

    #[test]
    fn buried_values_are_loaded_then_collapsed() {
        let mut s = VirtualStack::new();
        s.push(SharedId(1), 1);
        s.push(SharedId(2), 1);
        assert_eq!(s.take(SharedId(1)), Ok(Access::Load(1)));
        assert_eq!(s.take(SharedId(2)), Ok(Access::Pop));
        assert_eq!(s.collapse(), 1);
        assert!(s.is_empty());
    }

    #[test]
    fn over_use_is_internal() {
        let mut s = VirtualStack::new();
        s.push(SharedId(1), 1);
        s.push(SharedId(2), 1);
        s.take(SharedId(1)).unwrap();
        assert!(matches!(
            s.take(SharedId(1)),
            Err(CodegenError::InternalInvariant(_))
        ));
        assert!(matches!(
            s.take(SharedId(9)),
            Err(CodegenError::InternalInvariant(_))
        ));
    }

    #[test]
    fn collapse_stops_at_call_arguments() {
        let mut s = VirtualStack::new();
        s.push_arg();
        s.push(SharedId(3), 1);
        assert_eq!(s.take(SharedId(3)), Ok(Access::Pop));
        assert_eq!(s.collapse(), 0);
        assert_eq!(s.depth(), 1);
        assert_eq!(s.pop_args(1), Ok(1));
        assert!(s.is_empty());
    }

    #[test]
    fn temporaries_must_be_on_top() {
        let mut s = VirtualStack::new();
        s.push_temp();
        s.push(SharedId(1), 1);
        assert!(s.pop_temp().is_err());
        s.take(SharedId(1)).unwrap();
        assert_eq!(s.pop_temp(), Ok(()));
    }
}
