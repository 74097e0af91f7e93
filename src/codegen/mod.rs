pub mod assembler;
pub mod compiler;
pub mod threads;
pub mod x86_64;

pub use self::{assembler::*, compiler::*, threads::*};

use crate::event::{Addr, Pid};
use crate::witness::EventId;
use std::fmt;

/// Identifier embedded into written data; one per byte of a write.
pub type WriteId = u8;

/// Instruction pointer of emitted code.
pub type InstPtr = Addr;

pub type OperationBox = Box<dyn Operation>;

/// Per-epoch lifecycle of an operation instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpPhase {
    Reset,
    Prepared,
    Emitted,
}

/// One abstract instruction of a test program, owned by exactly one thread.
///
/// The compiler drives every instance through `enable_emit`, `insert_po` and
/// the backend's emission hook, in this order, once per epoch. Afterwards
/// `update_from` may be called for every value the instance was observed to
/// read.
pub trait Operation: fmt::Debug {
    fn pid(&self) -> Pid;

    fn set_pid(&mut self, pid: Pid);

    /// Independent copy that shares no per-emission state with `self`.
    fn box_clone(&self) -> OperationBox;

    /// Forget everything recorded during the last emission.
    fn reset(&mut self);

    /// Prepares emission against the current epoch; `false` means this
    /// operation produces no code and no events in this pass.
    fn enable_emit(&mut self, asms: &mut AssemblerState) -> bool;

    /// Links the first event of this operation after the last event of
    /// `before` in program order; `None` if this is the first operation of its
    /// thread.
    fn insert_po(&mut self, before: Option<&dyn Operation>, asms: &mut AssemblerState);

    /// Emits x86-64 machine code for execution at `start` into `code`.
    ///
    /// Returns the number of bytes written; 0 if the operation has no x86-64
    /// form.
    fn emit_x86_64(
        &mut self,
        _asms: &mut AssemblerState,
        _start: InstPtr,
        _code: &mut [u8],
    ) -> usize {
        0
    }

    /// Last event of this operation in program order, given the first event
    /// of the operation that follows it (if known).
    fn last_event(&self, next_event: Option<EventId>, asms: &mut AssemblerState) -> Option<EventId>;

    /// True if whatever precedes this operation must be ordered before
    /// whatever follows it by a barrier of the architecture.
    fn orders_next(&self) -> bool {
        false
    }

    /// Records the dynamic relations for an observed access.
    ///
    /// `part` selects the access within the instruction at `ip`, `from_id`
    /// holds one observed id per byte read at `addr`.
    fn update_from(
        &self,
        ip: InstPtr,
        part: usize,
        addr: Addr,
        from_id: &[WriteId],
        asms: &mut AssemblerState,
    ) -> bool;
}

impl Clone for OperationBox {
    fn clone(&self) -> Self {
        self.box_clone()
    }
}
