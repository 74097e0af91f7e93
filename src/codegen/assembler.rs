use super::WriteId;
use crate::event::{Addr, Event, EventType, Iiid, Pid, Poi};
use crate::witness::{Architecture, EventId, ExecWitness};
use log::{trace, warn};
use std::{collections::HashMap, mem::size_of};

//
// Public Interface
//

pub const MAX_INST_SIZE: usize = 8;
pub const MAX_INST_EVTS: usize = MAX_INST_SIZE / size_of::<WriteId>();

pub const INIT_WRITE: WriteId = 0x00;
pub const MIN_WRITE: WriteId = INIT_WRITE + 1;
pub const MAX_WRITE: WriteId = 0xff - (MAX_INST_EVTS as WriteId - 1);

pub const MIN_READ: Poi = 0x8000_0000_0000_0000;
pub const MAX_READ: Poi = Poi::MAX - (MAX_INST_EVTS as Poi - 1);

/// Thread id of the synthetic writes that model the initial memory state.
pub const INIT_PID: Pid = Pid::MAX;

pub mod defaults {
    pub const STRICT: bool = false;
}

#[derive(Clone, Debug)]
pub struct AssemblerOptions {
    /// Treat an observed id that resolves to no known write (and is not the
    /// initial marker) as fatal instead of a warning.
    pub strict: bool,
}

impl Default for AssemblerOptions {
    fn default() -> Self {
        Self {
            strict: defaults::STRICT,
        }
    }
}

/// Identifier allocation and epoch-scoped storage for one compile cycle.
///
/// Writes embed a fresh [`WriteId`] per byte into the data they store, so a
/// value read back from memory names the write that produced it. Reads get
/// instance positions from the upper half of [`Poi`], keeping them apart from
/// write-derived positions.
#[derive(Debug)]
pub struct AssemblerState {
    witness: ExecWitness,
    arch: Box<dyn Architecture>,
    writes: HashMap<WriteId, EventId>,
    last_write_id: WriteId,
    last_read_id: Poi,
    options: AssemblerOptions,
}

impl AssemblerState {
    pub fn new(arch: Box<dyn Architecture>, options: &AssemblerOptions) -> Self {
        let mut state = Self {
            witness: ExecWitness::default(),
            arch,
            writes: HashMap::new(),
            last_write_id: MIN_WRITE - 1,
            last_read_id: MIN_READ - 1,
            options: options.clone(),
        };
        state.reset();
        state
    }

    pub fn reset(&mut self) {
        self.last_write_id = MIN_WRITE - 1;
        self.last_read_id = MIN_READ - 1;
        self.writes.clear();
        self.witness.clear();
        self.arch.clear();
    }

    pub fn exhausted(&self) -> bool {
        self.last_write_id >= MAX_WRITE || self.last_read_id >= MAX_READ
    }

    pub fn witness(&self) -> &ExecWitness {
        &self.witness
    }

    pub fn witness_mut(&mut self) -> &mut ExecWitness {
        &mut self.witness
    }

    pub fn arch(&self) -> &dyn Architecture {
        self.arch.as_ref()
    }

    pub fn arch_mut(&mut self) -> &mut dyn Architecture {
        self.arch.as_mut()
    }

    pub fn event(&self, id: EventId) -> &Event {
        self.witness.events.get(id)
    }

    /// Event of the write that embedded `write_id` in this epoch.
    pub fn write_event(&self, write_id: WriteId) -> Option<EventId> {
        self.writes.get(&write_id).copied()
    }

    /// Creates one read event per sub-word of `size` bytes at `addr`.
    pub fn make_read(&mut self, pid: Pid, ty: EventType, addr: Addr, size: usize) -> Vec<EventId> {
        assert_valid_size(size);
        assert!(!self.exhausted(), "identifier space exhausted");

        (0..size / size_of::<WriteId>())
            .map(|i| {
                self.last_read_id += 1;
                let offset = (i * size_of::<WriteId>()) as Addr;
                let event = Event::new(ty, addr + offset, Iiid::new(pid, self.last_read_id));
                trace!("read {}", event);
                self.witness.events.insert(event, true)
            })
            .collect()
    }

    /// Creates one write event per sub-word of `size` bytes at `addr` and
    /// stores the allocated ids into `data` at the matching offsets.
    pub fn make_write(
        &mut self,
        pid: Pid,
        ty: EventType,
        addr: Addr,
        data: &mut [WriteId],
        size: usize,
    ) -> Vec<EventId> {
        assert_valid_size(size);
        assert!(data.len() >= size / size_of::<WriteId>(), "data buffer too small");
        assert!(!self.exhausted(), "identifier space exhausted");

        (0..size / size_of::<WriteId>())
            .map(|i| {
                self.last_write_id += 1;
                let write_id = self.last_write_id;
                let offset = (i * size_of::<WriteId>()) as Addr;
                let event = Event::new(ty, addr + offset, Iiid::new(pid, Poi::from(write_id)));
                trace!("write {} id={:#04x}", event, write_id);

                data[i] = write_id;
                let id = self.witness.events.insert(event, true);
                self.writes.insert(write_id, id);
                id
            })
            .collect()
    }

    /// Resolves observed ids, one per sub-word of `from_id`, to the writes
    /// that produced them.
    ///
    /// An id resolves if it is not [`INIT_WRITE`], names a write of this
    /// epoch at the same address, and that write is not the instance given in
    /// `after` for the same sub-word. Anything else is attributed to the
    /// initial state of the address.
    pub fn get_write(
        &mut self,
        after: &[EventId],
        addr: Addr,
        from_id: &[WriteId],
    ) -> Vec<EventId> {
        let size = from_id.len() * size_of::<WriteId>();
        assert_valid_size(size);
        assert_eq!(after.len(), from_id.len(), "one 'after' event per sub-word");

        let mut addr = addr;
        let mut result = Vec::with_capacity(from_id.len());

        for (&write_id, &after) in from_id.iter().zip(after) {
            let after_iiid = self.witness.events.get(after).iiid;
            let resolved = if write_id == INIT_WRITE {
                None
            } else {
                self.writes.get(&write_id).copied().filter(|&id| {
                    let write = self.witness.events.get(id);
                    write.addr == addr && write.iiid != after_iiid
                })
            };

            let event = match resolved {
                Some(id) => id,
                None => {
                    if write_id != INIT_WRITE {
                        // Reading an id of a previous epoch rarely produces a false
                        // positive, but memory is expected to be zeroed between epochs.
                        warn!(
                            "invalid write id {:#04x} at {:#x}, has memory been reset?",
                            write_id, addr
                        );
                        assert!(
                            !self.options.strict,
                            "unresolvable write id {:#04x} at {:#x}",
                            write_id,
                            addr
                        );
                    }
                    self.initial_write(addr)
                }
            };

            result.push(event);
            addr += size_of::<WriteId>() as Addr;
        }

        result
    }
}

//
// Private Implementation
//

fn assert_valid_size(size: usize) {
    assert!(size <= MAX_INST_SIZE, "access size {} too large", size);
    assert!(size >= size_of::<WriteId>(), "access size {} too small", size);
    assert!(size % size_of::<WriteId>() == 0, "access size {} not a multiple", size);
}

impl AssemblerState {
    fn initial_write(&mut self, addr: Addr) -> EventId {
        let initial = Event::new(EventType::WRITE, addr, Iiid::new(INIT_PID, addr));
        self.witness.events.insert(initial, false)
    }
}
