//! x86-64 test operations.
//!
//! Every memory operation first loads its address into `rax` with a 64-bit
//! immediate. Stores and exchanges additionally load the write ids of all
//! bytes into `rdx` as one little-endian immediate, so the value reaching
//! memory is exactly the list of ids. Loads target `al`/`ax`/`eax`/`rax`.

use super::{AssemblerState, InstPtr, OpPhase, Operation, OperationBox, WriteId, MAX_INST_SIZE};
use crate::event::{Addr, EventType, Pid};
use crate::witness::EventId;
use byteorder::{ByteOrder, LittleEndian};
use log::debug;
use strum::{EnumString, EnumVariantNames, IntoStaticStr};

//
// Public Interface
//

/// Upper bound of the code size of any single operation.
pub const MAX_OP_LEN: usize = 32;

pub const MAX_DELAY: usize = MAX_OP_LEN;

pub const REX_W: u8 = 0x48;
pub const OPERAND_SIZE_16: u8 = 0x66;
pub const MOV_R64_IMM64: u8 = 0xb8;
pub const REG_RAX: u8 = 0;
pub const REG_RDX: u8 = 2;
pub const MOV_STORE_8: u8 = 0x88;
pub const MOV_STORE: u8 = 0x89;
pub const MOV_LOAD_8: u8 = 0x8a;
pub const MOV_LOAD: u8 = 0x8b;
pub const XCHG_8: u8 = 0x86;
pub const XCHG: u8 = 0x87;
pub const MFENCE: [u8; 3] = [0x0f, 0xae, 0xf0];
pub const NOP: u8 = 0x90;
pub const RET: u8 = 0xc3;

/// ModR/M byte for `[rax]` with `rdx` (`dl`, `dx`, `edx`) as register operand.
pub const MODRM_RAX_RDX: u8 = 0x10;
/// ModR/M byte for `[rax]` with `rax` (`al`, `ax`, `eax`) as register operand.
pub const MODRM_RAX_RAX: u8 = 0x00;

#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumString, EnumVariantNames, IntoStaticStr)]
#[strum(serialize_all = "kebab_case")]
pub enum MemKind {
    Read,
    Write,
    #[strum(serialize = "rmw", serialize = "read-modify-write")]
    ReadModifyWrite,
}

/// A load, store or locked exchange of 1, 2, 4 or 8 bytes at a fixed address.
#[derive(Clone, Debug)]
pub struct MemOperation {
    pid: Pid,
    kind: MemKind,
    addr: Addr,
    size: usize,
    phase: OpPhase,
    reads: Vec<EventId>,
    writes: Vec<EventId>,
    data: [WriteId; MAX_INST_SIZE],
    access_ip: Option<InstPtr>,
}

impl MemOperation {
    pub fn new(pid: Pid, kind: MemKind, addr: Addr, size: usize) -> Self {
        assert!(
            matches!(size, 1 | 2 | 4 | 8),
            "unsupported access size {}",
            size
        );
        Self {
            pid,
            kind,
            addr,
            size,
            phase: OpPhase::Reset,
            reads: Vec::new(),
            writes: Vec::new(),
            data: [0; MAX_INST_SIZE],
            access_ip: None,
        }
    }

    pub fn kind(&self) -> MemKind {
        self.kind
    }

    pub fn addr(&self) -> Addr {
        self.addr
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn phase(&self) -> OpPhase {
        self.phase
    }

    /// Address of the instruction performing the access, once emitted.
    pub fn access_ip(&self) -> Option<InstPtr> {
        self.access_ip
    }

    /// Write ids this operation stores in the current epoch.
    pub fn write_ids(&self) -> &[WriteId] {
        if self.writes.is_empty() {
            &[]
        } else {
            &self.data[..self.size]
        }
    }

    fn events(&self) -> impl Iterator<Item = EventId> + '_ {
        self.reads.iter().chain(self.writes.iter()).copied()
    }

    fn first_event(&self) -> Option<EventId> {
        self.reads.first().or_else(|| self.writes.first()).copied()
    }
}

impl Operation for MemOperation {
    fn pid(&self) -> Pid {
        self.pid
    }

    fn set_pid(&mut self, pid: Pid) {
        self.pid = pid;
    }

    fn box_clone(&self) -> OperationBox {
        Box::new(self.clone())
    }

    fn reset(&mut self) {
        self.phase = OpPhase::Reset;
        self.reads.clear();
        self.writes.clear();
        self.data = [0; MAX_INST_SIZE];
        self.access_ip = None;
    }

    fn enable_emit(&mut self, asms: &mut AssemblerState) -> bool {
        assert_eq!(self.phase, OpPhase::Reset, "operation not reset");

        if matches!(self.kind, MemKind::Read | MemKind::ReadModifyWrite) {
            self.reads = asms.make_read(self.pid, EventType::READ, self.addr, self.size);
        }
        if matches!(self.kind, MemKind::Write | MemKind::ReadModifyWrite) {
            self.writes = asms.make_write(
                self.pid,
                EventType::WRITE,
                self.addr,
                &mut self.data,
                self.size,
            );
        }

        self.phase = OpPhase::Prepared;
        true
    }

    fn insert_po(&mut self, before: Option<&dyn Operation>, asms: &mut AssemblerState) {
        assert_eq!(self.phase, OpPhase::Prepared, "program order of unprepared operation");

        let events: Vec<EventId> = self.events().collect();
        for pair in events.windows(2) {
            asms.witness_mut().po.insert(pair[0], pair[1]);
        }

        let first = self.first_event();
        if let Some(before) = before {
            if let Some(prev) = before.last_event(first, asms) {
                if let Some(first) = first {
                    asms.witness_mut().po.insert(prev, first);
                }
            }
        }
    }

    fn emit_x86_64(
        &mut self,
        _asms: &mut AssemblerState,
        start: InstPtr,
        code: &mut [u8],
    ) -> usize {
        assert_eq!(self.phase, OpPhase::Prepared, "emission of unprepared operation");

        let mut buf = CodeBuffer::new(code);
        buf.mov_imm64(REG_RAX, self.addr);

        if self.kind != MemKind::Read {
            buf.mov_imm64(REG_RDX, LittleEndian::read_u64(&self.data));
        }

        self.access_ip = Some(start + buf.len() as InstPtr);
        buf.emit(operand_prefix(self.size));
        match self.kind {
            MemKind::Read => buf.emit(&[opcode(self.size, MOV_LOAD_8, MOV_LOAD), MODRM_RAX_RAX]),
            MemKind::Write => buf.emit(&[opcode(self.size, MOV_STORE_8, MOV_STORE), MODRM_RAX_RDX]),
            MemKind::ReadModifyWrite => buf.emit(&[opcode(self.size, XCHG_8, XCHG), MODRM_RAX_RDX]),
        }

        self.phase = OpPhase::Emitted;
        buf.len()
    }

    fn last_event(
        &self,
        _next_event: Option<EventId>,
        _asms: &mut AssemblerState,
    ) -> Option<EventId> {
        self.writes.last().or_else(|| self.reads.last()).copied()
    }

    fn update_from(
        &self,
        ip: InstPtr,
        part: usize,
        addr: Addr,
        from_id: &[WriteId],
        asms: &mut AssemblerState,
    ) -> bool {
        assert_eq!(self.phase, OpPhase::Emitted, "update of operation not emitted");

        if self.kind == MemKind::Write {
            return false;
        }
        if Some(ip) != self.access_ip
            || part != 0
            || addr != self.addr
            || from_id.len() != self.size
        {
            debug!(
                "observation at {:#x} (part {}, {} bytes at {:#x}) does not match {:?}",
                ip,
                part,
                from_id.len(),
                addr,
                self
            );
            return false;
        }

        // A locked exchange cannot observe its own store.
        let after = if self.kind == MemKind::ReadModifyWrite {
            &self.writes
        } else {
            &self.reads
        };
        let from = asms.get_write(after, addr, from_id);

        let witness = asms.witness_mut();
        for (i, write) in from.into_iter().enumerate() {
            witness.rf.insert(write, self.reads[i]);
            if self.kind == MemKind::ReadModifyWrite {
                witness.co.insert(write, self.writes[i]);
            }
        }

        true
    }
}

/// Full barrier (`mfence`).
#[derive(Clone, Debug)]
pub struct Fence {
    pid: Pid,
    link: PassThrough,
}

impl Fence {
    pub fn new(pid: Pid) -> Self {
        Self {
            pid,
            link: PassThrough::default(),
        }
    }
}

impl Operation for Fence {
    fn pid(&self) -> Pid {
        self.pid
    }

    fn set_pid(&mut self, pid: Pid) {
        self.pid = pid;
    }

    fn box_clone(&self) -> OperationBox {
        Box::new(self.clone())
    }

    fn reset(&mut self) {
        self.link.reset();
    }

    fn enable_emit(&mut self, _asms: &mut AssemblerState) -> bool {
        self.link.prepare();
        true
    }

    fn insert_po(&mut self, before: Option<&dyn Operation>, asms: &mut AssemblerState) {
        self.link.insert_po(before, true, asms);
    }

    fn emit_x86_64(
        &mut self,
        _asms: &mut AssemblerState,
        _start: InstPtr,
        code: &mut [u8],
    ) -> usize {
        self.link.emitted();
        let mut buf = CodeBuffer::new(code);
        buf.emit(&MFENCE);
        buf.len()
    }

    fn last_event(
        &self,
        next_event: Option<EventId>,
        asms: &mut AssemblerState,
    ) -> Option<EventId> {
        self.link.last_event(next_event, asms)
    }

    fn orders_next(&self) -> bool {
        self.link.barrier
    }

    fn update_from(
        &self,
        _: InstPtr,
        _: usize,
        _: Addr,
        _: &[WriteId],
        _: &mut AssemblerState,
    ) -> bool {
        false
    }
}

/// A run of `nop`s; emits nothing if empty.
#[derive(Clone, Debug)]
pub struct Delay {
    pid: Pid,
    count: usize,
    link: PassThrough,
}

impl Delay {
    pub fn new(pid: Pid, count: usize) -> Self {
        assert!(count <= MAX_DELAY, "delay of {} exceeds {}", count, MAX_DELAY);
        Self {
            pid,
            count,
            link: PassThrough::default(),
        }
    }
}

impl Operation for Delay {
    fn pid(&self) -> Pid {
        self.pid
    }

    fn set_pid(&mut self, pid: Pid) {
        self.pid = pid;
    }

    fn box_clone(&self) -> OperationBox {
        Box::new(self.clone())
    }

    fn reset(&mut self) {
        self.link.reset();
    }

    fn enable_emit(&mut self, _asms: &mut AssemblerState) -> bool {
        if self.count == 0 {
            return false;
        }
        self.link.prepare();
        true
    }

    fn insert_po(&mut self, before: Option<&dyn Operation>, asms: &mut AssemblerState) {
        self.link.insert_po(before, false, asms);
    }

    fn emit_x86_64(
        &mut self,
        _asms: &mut AssemblerState,
        _start: InstPtr,
        code: &mut [u8],
    ) -> usize {
        self.link.emitted();
        let mut buf = CodeBuffer::new(code);
        (0..self.count).for_each(|_| buf.emit(&[NOP]));
        buf.len()
    }

    fn last_event(
        &self,
        next_event: Option<EventId>,
        asms: &mut AssemblerState,
    ) -> Option<EventId> {
        self.link.last_event(next_event, asms)
    }

    fn orders_next(&self) -> bool {
        self.link.barrier
    }

    fn update_from(
        &self,
        _: InstPtr,
        _: usize,
        _: Addr,
        _: &[WriteId],
        _: &mut AssemblerState,
    ) -> bool {
        false
    }
}

/// Returns from the generated thread function.
#[derive(Clone, Debug)]
pub struct Return {
    pid: Pid,
    link: PassThrough,
}

impl Return {
    pub fn new(pid: Pid) -> Self {
        Self {
            pid,
            link: PassThrough::default(),
        }
    }
}

impl Operation for Return {
    fn pid(&self) -> Pid {
        self.pid
    }

    fn set_pid(&mut self, pid: Pid) {
        self.pid = pid;
    }

    fn box_clone(&self) -> OperationBox {
        Box::new(self.clone())
    }

    fn reset(&mut self) {
        self.link.reset();
    }

    fn enable_emit(&mut self, _asms: &mut AssemblerState) -> bool {
        self.link.prepare();
        true
    }

    fn insert_po(&mut self, before: Option<&dyn Operation>, asms: &mut AssemblerState) {
        self.link.insert_po(before, false, asms);
    }

    fn emit_x86_64(
        &mut self,
        _asms: &mut AssemblerState,
        _start: InstPtr,
        code: &mut [u8],
    ) -> usize {
        self.link.emitted();
        let mut buf = CodeBuffer::new(code);
        buf.emit(&[RET]);
        buf.len()
    }

    fn last_event(
        &self,
        next_event: Option<EventId>,
        asms: &mut AssemblerState,
    ) -> Option<EventId> {
        self.link.last_event(next_event, asms)
    }

    fn orders_next(&self) -> bool {
        self.link.barrier
    }

    fn update_from(
        &self,
        _: InstPtr,
        _: usize,
        _: Addr,
        _: &[WriteId],
        _: &mut AssemblerState,
    ) -> bool {
        false
    }
}

//
// Private Implementation
//

fn operand_prefix(size: usize) -> &'static [u8] {
    match size {
        1 | 4 => &[],
        2 => &[OPERAND_SIZE_16],
        8 => &[REX_W],
        _ => unreachable!("access size checked on construction"),
    }
}

fn opcode(size: usize, byte_op: u8, op: u8) -> u8 {
    if size == 1 {
        byte_op
    } else {
        op
    }
}

struct CodeBuffer<'a> {
    code: &'a mut [u8],
    pos: usize,
}

impl<'a> CodeBuffer<'a> {
    fn new(code: &'a mut [u8]) -> Self {
        Self { code, pos: 0 }
    }

    fn len(&self) -> usize {
        self.pos
    }

    fn emit(&mut self, bytes: &[u8]) {
        let end = self.pos + bytes.len();
        assert!(end <= self.code.len(), "code buffer too small");
        self.code[self.pos..end].copy_from_slice(bytes);
        self.pos = end;
    }

    fn mov_imm64(&mut self, reg: u8, imm: u64) {
        let mut insn = [REX_W, MOV_R64_IMM64 + reg, 0, 0, 0, 0, 0, 0, 0, 0];
        LittleEndian::write_u64(&mut insn[2..], imm);
        self.emit(&insn);
    }
}

/// Program-order bookkeeping of operations without events of their own: the
/// preceding event is handed on to whatever follows.
#[derive(Clone, Debug)]
struct PassThrough {
    phase: OpPhase,
    before_event: Option<EventId>,
    barrier: bool,
}

impl Default for PassThrough {
    fn default() -> Self {
        Self {
            phase: OpPhase::Reset,
            before_event: None,
            barrier: false,
        }
    }
}

impl PassThrough {
    fn reset(&mut self) {
        *self = Self::default();
    }

    fn prepare(&mut self) {
        assert_eq!(self.phase, OpPhase::Reset, "operation not reset");
        self.phase = OpPhase::Prepared;
    }

    fn emitted(&mut self) {
        assert_eq!(self.phase, OpPhase::Prepared, "emission of unprepared operation");
        self.phase = OpPhase::Emitted;
    }

    fn insert_po(
        &mut self,
        before: Option<&dyn Operation>,
        barrier: bool,
        asms: &mut AssemblerState,
    ) {
        assert_eq!(self.phase, OpPhase::Prepared, "program order of unprepared operation");
        self.before_event = before.and_then(|op| op.last_event(None, asms));
        self.barrier = barrier || before.map_or(false, |op| op.orders_next());
    }

    // The successor is only known once it links itself after us.
    fn last_event(
        &self,
        next_event: Option<EventId>,
        asms: &mut AssemblerState,
    ) -> Option<EventId> {
        if let (true, Some(before), Some(next)) = (self.barrier, self.before_event, next_event) {
            asms.arch_mut().insert_barrier(before, next);
        }
        self.before_event
    }
}
