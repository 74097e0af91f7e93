use super::{Operation, OperationBox};
use crate::event::Pid;
use std::collections::HashMap;

/// Operations of a test program by owning thread, in emission order.
pub type Threads = HashMap<Pid, Vec<OperationBox>>;

/// Partitions `container` by thread, keeping the relative order per thread.
///
/// Every operation in the result is a freshly reset clone owned by the
/// returned table, so no two tables (nor two slots of one table) ever share an
/// instance, even when `container` names the same instance more than once or
/// is extracted again later.
pub fn threads_extract<I>(container: I) -> Threads
where
    I: IntoIterator,
    I::Item: AsRef<dyn Operation>,
{
    let mut result = Threads::new();

    for op in container {
        let op = op.as_ref();
        let mut owned = op.box_clone();
        owned.set_pid(op.pid());
        owned.reset();
        result.entry(op.pid()).or_default().push(owned);
    }

    result
}

/// Total number of operations over all threads.
pub fn threads_size(threads: &Threads) -> usize {
    threads.values().map(Vec::len).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::x86_64::{Fence, MemKind, MemOperation};
    use crate::codegen::OpPhase;
    use std::rc::Rc;

    fn program() -> Vec<Rc<dyn Operation>> {
        vec![
            Rc::new(MemOperation::new(0, MemKind::Write, 0x10, 1)) as Rc<dyn Operation>,
            Rc::new(MemOperation::new(1, MemKind::Read, 0x10, 1)),
            Rc::new(Fence::new(0)),
            Rc::new(MemOperation::new(0, MemKind::Read, 0x20, 1)),
        ]
    }

    #[test]
    fn partitions_by_pid_in_order() {
        let threads = threads_extract(&program());

        assert_eq!(threads.len(), 2);
        assert_eq!(threads_size(&threads), 4);
        let p0: Vec<String> = threads[&0].iter().map(|op| format!("{:?}", op)).collect();
        assert_eq!(p0.len(), 3);
        assert!(p0[0].contains("Write"));
        assert!(p0[1].contains("Fence"));
        assert!(p0[2].contains("Read"));
        assert_eq!(threads[&1].len(), 1);
    }

    #[test]
    fn repeated_extraction_never_aliases() {
        let ops = program();
        let first = threads_extract(&ops);
        let second = threads_extract(&ops[1..]);

        for (pid, ops) in &second {
            for op in ops {
                let addr = &**op as *const dyn Operation as *const u8;
                let aliased = first[pid]
                    .iter()
                    .any(|other| &**other as *const dyn Operation as *const u8 == addr);
                assert!(!aliased, "thread tables share an operation");
            }
        }
    }

    #[test]
    fn same_instance_twice_yields_two_owners() {
        let op: Rc<dyn Operation> = Rc::new(MemOperation::new(2, MemKind::Write, 0x30, 2));
        let threads = threads_extract(vec![op.clone(), op]);
        let ops = &threads[&2];

        assert_eq!(ops.len(), 2);
        assert!(!std::ptr::eq(
            &*ops[0] as *const dyn Operation as *const u8,
            &*ops[1] as *const dyn Operation as *const u8
        ));
    }

    #[test]
    fn extracted_operations_are_reset() {
        let mut used = MemOperation::new(0, MemKind::Write, 0x10, 1);
        let mut asms = crate::codegen::AssemblerState::new(
            Box::new(crate::witness::ArchTso::default()),
            &Default::default(),
        );
        assert!(used.enable_emit(&mut asms));
        assert_eq!(used.phase(), OpPhase::Prepared);

        let ops: Vec<OperationBox> = vec![Box::new(used) as OperationBox];
        let threads = threads_extract(&ops);
        assert!(format!("{:?}", threads[&0][0]).contains("Reset"));
    }
}
