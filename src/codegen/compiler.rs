use super::{AssemblerOptions, AssemblerState, InstPtr, Operation, Threads, WriteId};
use crate::event::{Addr, Pid};
use crate::witness::Architecture;
use log::{debug, trace};
use std::collections::BTreeMap;

//
// Public Interface
//

/// Target specific code emission strategy.
pub trait Backend: Default {
    fn name() -> &'static str;

    fn supports(&self, arch: &dyn Architecture) -> bool;

    fn emit(
        &self,
        op: &mut dyn Operation,
        asms: &mut AssemblerState,
        start: InstPtr,
        code: &mut [u8],
    ) -> usize;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct BackendX86_64;

impl Backend for BackendX86_64 {
    fn name() -> &'static str {
        "x86-64"
    }

    fn supports(&self, arch: &dyn Architecture) -> bool {
        arch.name() == "TSO"
    }

    fn emit(
        &self,
        op: &mut dyn Operation,
        asms: &mut AssemblerState,
        start: InstPtr,
        code: &mut [u8],
    ) -> usize {
        op.emit_x86_64(asms, start, code)
    }
}

/// Position of an operation inside the compiler's thread table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OpRef {
    pub pid: Pid,
    pub index: usize,
}

/// Emits the operations of a test program and keeps track of which
/// operation owns which instruction address.
#[derive(Debug)]
pub struct Compiler<B: Backend> {
    asms: AssemblerState,
    backend: B,
    threads: Threads,
    // Code of every thread is laid out linearly and disjointly, hence an
    // address belongs to at most one interval.
    ip_to_op: BTreeMap<InstPtr, (InstPtr, OpRef)>,
}

impl<B: Backend> Compiler<B> {
    pub fn new(
        arch: Box<dyn Architecture>,
        options: &AssemblerOptions,
        threads: Option<Threads>,
    ) -> Self {
        let backend = B::default();
        assert!(
            backend.supports(arch.as_ref()),
            "{} backend cannot target {}",
            B::name(),
            arch.name()
        );

        let mut compiler = Self {
            asms: AssemblerState::new(arch, options),
            backend,
            threads: Threads::new(),
            ip_to_op: BTreeMap::new(),
        };
        compiler.reset(threads);
        compiler
    }

    /// Starts a new epoch, installing `threads` if given.
    ///
    /// All operations of the (new) thread table are reset, as well as the
    /// assembler state and the address index.
    pub fn reset(&mut self, threads: Option<Threads>) {
        if let Some(threads) = threads {
            self.threads = threads;
        }
        self.threads
            .values_mut()
            .flat_map(|ops| ops.iter_mut())
            .for_each(|op| op.reset());
        self.asms.reset();
        self.ip_to_op.clear();
        debug!("compiler reset: {} threads", self.threads.len());
    }

    pub fn threads(&self) -> &Threads {
        &self.threads
    }

    pub fn asms(&self) -> &AssemblerState {
        &self.asms
    }

    pub fn asms_mut(&mut self) -> &mut AssemblerState {
        &mut self.asms
    }

    pub fn operation(&self, op: OpRef) -> Option<&dyn Operation> {
        self.threads
            .get(&op.pid)
            .and_then(|ops| ops.get(op.index))
            .map(|op| op.as_ref())
    }

    /// Emits a single operation at `base` into `code`.
    ///
    /// Returns 0 without any side effect if the operation declines emission.
    /// With `last_op` the operation is linked in program order after the
    /// referenced one, and `last_op` is advanced to it.
    pub fn emit_op(
        &mut self,
        base: InstPtr,
        op_ref: OpRef,
        code: &mut [u8],
        last_op: Option<&mut Option<OpRef>>,
    ) -> usize {
        let ops = self
            .threads
            .get_mut(&op_ref.pid)
            .expect("operation of an installed thread");
        assert!(op_ref.index < ops.len(), "no operation at {:?}", op_ref);

        let (done, rest) = ops.split_at_mut(op_ref.index);
        let op = &mut rest[0];

        if !op.enable_emit(&mut self.asms) {
            trace!("{:?} declined emission", op_ref);
            return 0;
        }

        match last_op {
            Some(last) => {
                let before = (*last).map(|prev| {
                    assert!(
                        prev.pid == op_ref.pid && prev.index < op_ref.index,
                        "program order links operations of one thread"
                    );
                    &*done[prev.index]
                });
                op.insert_po(before, &mut self.asms);
                *last = Some(op_ref);
            }
            None => op.insert_po(None, &mut self.asms),
        }

        let op_len = self.backend.emit(&mut **op, &mut self.asms, base, code);
        assert_ne!(op_len, 0, "{} backend emitted no code for {:?}", B::name(), op);
        assert!(op_len <= code.len());

        self.insert_ip(base, base + op_len as InstPtr, op_ref);
        trace!("emitted {:?} at {:#x} ({} bytes)", op_ref, base, op_len);

        op_len
    }

    /// Emits all operations of thread `pid` consecutively from `base`.
    ///
    /// Returns 0 if the thread is unknown.
    pub fn emit(&mut self, pid: Pid, base: InstPtr, code: &mut [u8]) -> usize {
        let count = match self.threads.get(&pid) {
            Some(ops) => ops.len(),
            None => return 0,
        };

        let len = code.len();
        let mut emit_len = 0;
        let mut last_op = None;

        for index in 0..count {
            let op_len = self.emit_op(
                base + emit_len as InstPtr,
                OpRef { pid, index },
                &mut code[emit_len..],
                Some(&mut last_op),
            );

            emit_len += op_len;
            assert!(emit_len <= len);
        }

        debug!("emitted thread {} at {:#x}: {} bytes", pid, base, emit_len);
        emit_len
    }

    /// Records the dynamic relations of an access observed at `ip`.
    ///
    /// Returns false if no emitted operation covers `ip` or if the operation
    /// could not resolve the observation.
    pub fn update_from(
        &mut self,
        ip: InstPtr,
        part: usize,
        addr: Addr,
        from_id: &[WriteId],
    ) -> bool {
        let op_ref = match self.ip_to_op_ref(ip) {
            Some(op_ref) => op_ref,
            None => return false,
        };
        let op = &self.threads[&op_ref.pid][op_ref.index];
        op.update_from(ip, part, addr, from_id, &mut self.asms)
    }

    pub fn ip_to_op(&self, ip: InstPtr) -> Option<&dyn Operation> {
        self.ip_to_op_ref(ip).and_then(|op| self.operation(op))
    }

    pub fn ip_to_op_ref(&self, ip: InstPtr) -> Option<OpRef> {
        self.ip_to_op
            .range(..=ip)
            .next_back()
            .filter(|(_, (end, _))| ip < *end)
            .map(|(_, (_, op))| *op)
    }
}

//
// Private Implementation
//

impl<B: Backend> Compiler<B> {
    fn insert_ip(&mut self, start: InstPtr, end: InstPtr, op: OpRef) {
        if let Some((prev_start, (prev_end, _))) = self.ip_to_op.range(..=start).next_back() {
            assert!(
                *prev_end <= start,
                "code at {:#x} overlaps code emitted at {:#x}",
                start,
                prev_start
            );
        }
        if let Some((next_start, _)) = self.ip_to_op.range(start..).next() {
            assert!(
                end <= *next_start,
                "code at {:#x} overlaps code emitted at {:#x}",
                start,
                next_start
            );
        }
        self.ip_to_op.insert(start, (end, op));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::x86_64::{Delay, Fence, MemKind, MemOperation, Return};
    use crate::codegen::{threads_extract, OperationBox, INIT_PID};
    use crate::witness::ArchTso;

    type X86Compiler = Compiler<BackendX86_64>;

    fn compiler(ops: Vec<OperationBox>) -> X86Compiler {
        X86Compiler::new(
            Box::new(ArchTso::default()),
            &AssemblerOptions::default(),
            Some(threads_extract(&ops)),
        )
    }

    fn write_then_read() -> Vec<OperationBox> {
        vec![
            Box::new(MemOperation::new(0, MemKind::Write, 0x1000, 1)),
            Box::new(MemOperation::new(0, MemKind::Read, 0x1000, 1)),
        ]
    }

    #[test]
    fn lookup_on_empty_index() {
        let compiler = compiler(write_then_read());
        assert!(compiler.ip_to_op(0).is_none());
        assert!(compiler.ip_to_op(0x4000).is_none());
    }

    #[test]
    fn update_before_emission_fails() {
        let mut compiler = compiler(write_then_read());
        assert!(!compiler.update_from(0x4000, 0, 0x1000, &[0]));
    }

    #[test]
    fn unknown_thread_emits_nothing() {
        let mut compiler = compiler(write_then_read());
        let mut code = [0u8; 64];
        assert_eq!(compiler.emit(7, 0x4000, &mut code), 0);
        assert!(compiler.ip_to_op(0x4000).is_none());
    }

    #[test]
    fn interval_lookup() {
        let mut compiler = compiler(write_then_read());
        let mut code = [0u8; 128];
        let len = compiler.emit(0, 0x4000, &mut code);
        let end = 0x4000 + len as InstPtr;

        let first = compiler.ip_to_op_ref(0x4000).unwrap();
        assert_eq!(first, OpRef { pid: 0, index: 0 });

        let second = compiler.ip_to_op_ref(end - 1).unwrap();
        assert_eq!(second, OpRef { pid: 0, index: 1 });

        // Every address inside the code belongs to exactly one operation.
        for ip in 0x4000..end {
            assert!(compiler.ip_to_op(ip).is_some());
        }
        assert!(compiler.ip_to_op(0x3fff).is_none());
        assert!(compiler.ip_to_op(end).is_none());
    }

    fn two_threads() -> X86Compiler {
        let mut ops = write_then_read();
        ops.extend(write_then_read().into_iter().map(|mut op| {
            op.set_pid(1);
            op
        }));
        compiler(ops)
    }

    #[test]
    #[should_panic(expected = "code at 0x4000 overlaps code emitted at 0x4000")]
    fn emitting_twice_at_one_base() {
        let mut compiler = two_threads();
        let mut code = [0u8; 128];
        compiler.emit(0, 0x4000, &mut code);
        compiler.emit(1, 0x4000, &mut code);
    }

    #[test]
    #[should_panic(expected = "code at 0x4005 overlaps code emitted at 0x4000")]
    fn emitting_inside_emitted_code() {
        let mut compiler = two_threads();
        let mut code = [0u8; 128];
        compiler.emit(0, 0x4000, &mut code);
        compiler.emit(1, 0x4005, &mut code);
    }

    #[test]
    #[should_panic(expected = "code at 0x3ff0 overlaps code emitted at 0x4000")]
    fn emitting_into_following_code() {
        let mut compiler = two_threads();
        let mut code = [0u8; 128];
        compiler.emit(0, 0x4000, &mut code);
        compiler.emit(1, 0x3ff0, &mut code);
    }

    #[test]
    fn adjacent_threads_do_not_overlap() {
        let mut compiler = two_threads();
        let mut code = [0u8; 128];
        let len = compiler.emit(0, 0x4000, &mut code);
        let end = 0x4000 + len as InstPtr;
        assert!(compiler.emit(1, end, &mut code) > 0);

        assert_eq!(compiler.ip_to_op_ref(end - 1), Some(OpRef { pid: 0, index: 1 }));
        assert_eq!(compiler.ip_to_op_ref(end), Some(OpRef { pid: 1, index: 0 }));
    }

    #[test]
    fn end_to_end_read_from() {
        let mut compiler = compiler(write_then_read());
        let mut code = [0u8; 128];
        let len = compiler.emit(0, 0x4000, &mut code);
        assert!(len > 0);

        let po: Vec<_> = compiler.asms().witness().po.iter().collect();
        assert_eq!(po.len(), 1);
        let (write, read) = po[0];
        assert!(compiler.asms().event(write).all_type(crate::event::EventType::WRITE));
        assert!(compiler.asms().event(read).all_type(crate::event::EventType::READ));

        // The write embeds its id as the immediate stored to memory.
        let write_id = compiler.asms().event(write).iiid.poi as WriteId;
        // The load is the final instruction, two bytes long.
        let read_ip = 0x4000 + len as InstPtr - 2;
        assert!(!compiler.update_from(read_ip + 1, 0, 0x1000, &[write_id]));
        assert!(compiler.update_from(read_ip, 0, 0x1000, &[write_id]));

        let rf: Vec<_> = compiler.asms().witness().rf.iter().collect();
        assert_eq!(rf, vec![(write, read)]);
    }

    #[test]
    fn initial_value_is_read_from_init() {
        let mut compiler = compiler(write_then_read());
        let mut code = [0u8; 128];
        let len = compiler.emit(0, 0x4000, &mut code);

        assert!(compiler.update_from(0x4000 + len as InstPtr - 2, 0, 0x1000, &[0]));
        let (from, _) = compiler.asms().witness().rf.iter().next().unwrap();
        assert_eq!(compiler.asms().event(from).iiid.pid, INIT_PID);
    }

    #[test]
    fn declined_operation_leaves_no_trace() {
        let mut compiler = compiler(vec![
            Box::new(MemOperation::new(0, MemKind::Write, 0x1000, 1)),
            Box::new(Delay::new(0, 0)),
            Box::new(MemOperation::new(0, MemKind::Write, 0x1000, 1)),
        ]);
        let mut code = [0u8; 128];
        let len = compiler.emit(0, 0x4000, &mut code);

        let first_len = {
            let mut single = [0u8; 64];
            let mut other = self::compiler(vec![Box::new(MemOperation::new(
                0,
                MemKind::Write,
                0x1000,
                1,
            ))]);
            other.emit(0, 0x4000, &mut single)
        };
        assert_eq!(len, 2 * first_len);
        assert_eq!(
            compiler.ip_to_op_ref(0x4000 + first_len as InstPtr),
            Some(OpRef { pid: 0, index: 2 })
        );
        // Program order skips the delay.
        assert_eq!(compiler.asms().witness().po.len(), 1);
    }

    #[test]
    fn fence_orders_neighbours() {
        let mut compiler = compiler(vec![
            Box::new(MemOperation::new(1, MemKind::Write, 0x1000, 1)),
            Box::new(Fence::new(1)),
            Box::new(Delay::new(1, 2)),
            Box::new(MemOperation::new(1, MemKind::Read, 0x2000, 1)),
            Box::new(Return::new(1)),
        ]);
        let mut code = [0u8; 256];
        assert!(compiler.emit(1, 0x8000, &mut code) > 0);

        let witness = compiler.asms().witness();
        let po: Vec<_> = witness.po.iter().collect();
        assert_eq!(po.len(), 1);
        let barriers: Vec<_> = compiler.asms().arch().barriers().iter().collect();
        assert_eq!(barriers, po);
    }

    #[test]
    fn reset_starts_a_new_epoch() {
        let mut compiler = compiler(write_then_read());
        let mut code = [0u8; 128];
        compiler.emit(0, 0x4000, &mut code);

        compiler.reset(None);
        assert!(compiler.ip_to_op(0x4000).is_none());
        assert!(compiler.asms().witness().events.is_empty());

        // Same base is free again after the reset.
        assert!(compiler.emit(0, 0x4000, &mut code) > 0);
        assert_eq!(compiler.asms().witness().po.len(), 1);
    }

    #[test]
    #[should_panic]
    fn buffer_overrun_is_fatal() {
        let mut compiler = compiler(write_then_read());
        let mut code = [0u8; 8];
        compiler.emit(0, 0x4000, &mut code);
    }
}
