use bitflags::bitflags;
use std::{
    cmp::Ordering,
    fmt,
    hash::{Hash, Hasher},
};

//
// Public Interface
//

/// Thread (processor) identifier.
pub type Pid = u16;

/// Position of an instruction instance within its thread.
pub type Poi = u64;

/// Memory address of an event.
pub type Addr = u64;

/// Identifies one dynamic instruction instance.
///
/// The ordering is lexicographic over `(pid, poi)` and exists so that
/// instances can be used as keys; it does not express any ordering between
/// the instructions themselves.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Iiid {
    pub pid: Pid,
    pub poi: Poi,
}

impl Iiid {
    pub fn new(pid: Pid, poi: Poi) -> Self {
        Self { pid, poi }
    }

    pub fn next(&self) -> Self {
        Self::new(self.pid, self.poi + 1)
    }

    pub fn prev(&self) -> Self {
        assert!(self.poi > 0, "no instance precedes poi 0");
        Self::new(self.pid, self.poi - 1)
    }
}

impl Hash for Iiid {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.poi.hash(state);
    }
}

impl fmt::Display for Iiid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "P{:02}: {:016x}", self.pid, self.poi)
    }
}

bitflags! {
    /// Kind of an event, composable as a bit set.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct EventType: u32 {
        const READ = 0x0000_0001;
        const WRITE = 0x0000_0002;
        const ACQUIRE = 0x0000_0004;
        const RELEASE = 0x0000_0008;
        const MEMORY_OPERATION = Self::READ.bits()
            | Self::WRITE.bits()
            | Self::ACQUIRE.bits()
            | Self::RELEASE.bits();

        const REG_IN_ADDR = 0x0000_0010;
        const REG_IN_DATA = 0x0000_0020;
        const REG_OUT = 0x0000_0040;
        const BRANCH = 0x0000_0080;
    }
}

const TYPE_NAMES: [(EventType, &str); 8] = [
    (EventType::READ, "Read"),
    (EventType::WRITE, "Write"),
    (EventType::ACQUIRE, "Acquire"),
    (EventType::RELEASE, "Release"),
    (EventType::REG_IN_ADDR, "RegInAddr"),
    (EventType::REG_IN_DATA, "RegInData"),
    (EventType::REG_OUT, "RegOut"),
    (EventType::BRANCH, "Branch"),
];

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_empty() {
            return f.pad("None");
        }
        let names = TYPE_NAMES
            .iter()
            .filter(|(ty, _)| self.contains(*ty))
            .map(|(_, name)| *name)
            .collect::<Vec<_>>()
            .join("|");
        f.pad(&names)
    }
}

/// A memory or control-flow occurrence at an address, tied to an instruction
/// instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Event {
    pub addr: Addr,
    pub ty: EventType,
    pub iiid: Iiid,
}

impl Event {
    pub fn new(ty: EventType, addr: Addr, iiid: Iiid) -> Self {
        Self { addr, ty, iiid }
    }

    /// True if the event carries every type in `mask`.
    pub fn all_type(&self, mask: EventType) -> bool {
        assert!(!mask.is_empty(), "type mask must not be empty");
        self.ty.contains(mask)
    }

    /// True if the event carries at least one type in `mask`.
    pub fn any_type(&self, mask: EventType) -> bool {
        assert!(!mask.is_empty(), "type mask must not be empty");
        self.ty.intersects(mask)
    }
}

// Storage order only: says nothing about the order of events in an execution.
impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        self.iiid
            .cmp(&other.iiid)
            .then(self.addr.cmp(&other.addr))
            .then(self.ty.cmp(&other.ty))
    }
}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}] {:>8} @ {:x}", self.iiid, self.ty, self.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iiid_neighbours() {
        let iiid = Iiid::new(3, 10);
        assert_eq!(iiid.next(), Iiid::new(3, 11));
        assert_eq!(iiid.prev(), Iiid::new(3, 9));
        assert_eq!(iiid, Iiid::new(3, 10), "original is left untouched");
    }

    #[test]
    #[should_panic]
    fn iiid_prev_of_zero() {
        let _ = Iiid::new(0, 0).prev();
    }

    #[test]
    fn iiid_orders_by_pid_first() {
        assert!(Iiid::new(0, 100) < Iiid::new(1, 0));
        assert!(Iiid::new(1, 1) < Iiid::new(1, 2));
    }

    #[test]
    fn iiid_display() {
        assert_eq!(Iiid::new(1, 0x2a).to_string(), "P01: 000000000000002a");
    }

    #[test]
    fn type_predicates() {
        let event = Event::new(EventType::READ | EventType::ACQUIRE, 0x10, Iiid::new(0, 1));
        assert!(event.all_type(EventType::READ));
        assert!(event.all_type(EventType::READ | EventType::ACQUIRE));
        assert!(!event.all_type(EventType::READ | EventType::WRITE));
        assert!(event.any_type(EventType::MEMORY_OPERATION));
        assert!(!event.any_type(EventType::BRANCH | EventType::REG_OUT));
    }

    #[test]
    #[should_panic]
    fn empty_mask_is_rejected() {
        let event = Event::new(EventType::WRITE, 0x10, Iiid::new(0, 1));
        event.any_type(EventType::empty());
    }

    #[test]
    fn event_display() {
        let event = Event::new(EventType::READ | EventType::WRITE, 0x1f00, Iiid::new(2, 5));
        assert_eq!(
            event.to_string(),
            "[P02: 0000000000000005] Read|Write @ 1f00"
        );
        let none = Event::new(EventType::empty(), 0, Iiid::default());
        assert!(none.to_string().contains("None"));
    }

    #[test]
    fn equality_covers_all_fields() {
        let a = Event::new(EventType::WRITE, 0x10, Iiid::new(0, 1));
        assert_ne!(a, Event::new(EventType::READ, 0x10, Iiid::new(0, 1)));
        assert_ne!(a, Event::new(EventType::WRITE, 0x11, Iiid::new(0, 1)));
        assert!(a < Event::new(EventType::WRITE, 0x0, Iiid::new(0, 2)));
    }
}
