//! Minimal execution witness consumed by a consistency checker.
//!
//! Only what the code generator needs is provided here: a de-duplicating
//! event store handing out stable identifiers, plain relation containers and
//! the architecture-specific ordering a backend accumulates while emitting.

use crate::event::Event;
use anyhow::Result;
use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    io::Write,
};

//
// Public Interface
//

/// Stable handle of an event inside an [`EventSet`], valid for one epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(usize);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.pad(&format!("e{}", self.0))
    }
}

#[derive(Clone, Debug, Default)]
pub struct EventSet {
    events: Vec<Event>,
    lookup: HashMap<Event, EventId>,
}

impl EventSet {
    /// Inserts `event` unless an equal one exists and returns its handle.
    ///
    /// With `assert_unique` the event must not have been inserted before.
    pub fn insert(&mut self, event: Event, assert_unique: bool) -> EventId {
        if let Some(id) = self.lookup.get(&event) {
            assert!(!assert_unique, "event already inserted: {}", event);
            return *id;
        }
        let id = EventId(self.events.len());
        self.events.push(event);
        self.lookup.insert(event, id);
        id
    }

    pub fn get(&self, id: EventId) -> &Event {
        &self.events[id.0]
    }

    pub fn find(&self, event: &Event) -> Option<EventId> {
        self.lookup.get(event).copied()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (EventId, &Event)> {
        self.events.iter().enumerate().map(|(i, e)| (EventId(i), e))
    }

    pub fn clear(&mut self) {
        self.events.clear();
        self.lookup.clear();
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EventRel {
    pairs: BTreeSet<(EventId, EventId)>,
}

impl EventRel {
    pub fn insert(&mut self, from: EventId, to: EventId) -> bool {
        self.pairs.insert((from, to))
    }

    pub fn contains(&self, from: EventId, to: EventId) -> bool {
        self.pairs.contains(&(from, to))
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (EventId, EventId)> + '_ {
        self.pairs.iter().copied()
    }

    pub fn clear(&mut self) {
        self.pairs.clear();
    }
}

/// Events plus the program-order, read-from and coherence-order relations of
/// one execution.
#[derive(Clone, Debug, Default)]
pub struct ExecWitness {
    pub events: EventSet,
    pub po: EventRel,
    pub rf: EventRel,
    pub co: EventRel,
}

impl ExecWitness {
    pub fn clear(&mut self) {
        self.events.clear();
        self.po.clear();
        self.rf.clear();
        self.co.clear();
    }
}

/// Target memory model, collecting orderings imposed by explicit barriers.
pub trait Architecture: fmt::Debug {
    fn name(&self) -> &'static str;

    fn clear(&mut self);

    fn insert_barrier(&mut self, before: EventId, after: EventId);

    fn barriers(&self) -> &EventRel;
}

/// Total store order, as implemented by x86-64.
#[derive(Clone, Debug, Default)]
pub struct ArchTso {
    pub mfence: EventRel,
}

impl Architecture for ArchTso {
    fn name(&self) -> &'static str {
        "TSO"
    }

    fn clear(&mut self) {
        self.mfence.clear();
    }

    fn insert_barrier(&mut self, before: EventId, after: EventId) {
        self.mfence.insert(before, after);
    }

    fn barriers(&self) -> &EventRel {
        &self.mfence
    }
}

pub fn write_witness<W>(ew: &ExecWitness, arch: &dyn Architecture, mut out: W) -> Result<()>
where
    W: Write,
{
    writeln!(out, "; {} events, architecture {}", ew.events.len(), arch.name())?;
    for (id, event) in ew.events.iter() {
        writeln!(out, "{:>5} {}", id, event)?;
    }
    for (name, rel) in [
        ("po", &ew.po),
        ("rf", &ew.rf),
        ("co", &ew.co),
        ("barrier", arch.barriers()),
    ] {
        writeln!(out, "; {} ({} pairs)", name, rel.len())?;
        for (from, to) in rel.iter() {
            writeln!(out, "{} {} -> {}", name, from, to)?;
        }
    }
    Ok(())
}
