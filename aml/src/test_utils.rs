use crate::{tables::Signature, AmlError, Handle, Handler, PciAddress};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        atomic::{AtomicU32, AtomicUsize, Ordering},
        Arc,
        Mutex,
    },
    vec::Vec,
};

/// A host backed by plain maps. Memory, I/O ports, and PCI configuration space read as zero until written.
/// Every access is recorded, and tables can be placed in "physical memory" for `find_table` to report. Clones
/// share their state, so a test can keep one to inspect after handing another to an [`crate::Interpreter`].
#[derive(Clone)]
pub(crate) struct TestHandler(Arc<State>);

struct State {
    memory: Mutex<BTreeMap<usize, u8>>,
    io: Mutex<BTreeMap<u16, u8>>,
    pci: Mutex<BTreeMap<(PciKey, u16), u8>>,
    accesses: Mutex<Vec<Access>>,
    tables: Mutex<Vec<(Signature, u64)>>,
    notifications: Mutex<Vec<(std::string::String, u64)>>,
    mappings: AtomicUsize,
    next_handle: AtomicU32,
    held_mutexes: Mutex<BTreeSet<Handle>>,
    signalled_events: Mutex<BTreeSet<Handle>>,
    nanos: AtomicUsize,
    /// How many calls into the handler are currently running, and the most that ever have been at once.
    active: AtomicUsize,
    max_active: AtomicUsize,
}

/// Segment, bus, device, and function.
type PciKey = (u16, u8, u8, u8);

fn pci_key(address: PciAddress) -> PciKey {
    (address.segment(), address.bus(), address.device(), address.function())
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Access {
    Memory { address: usize, width: u8, write: bool },
    Io { port: u16, width: u8, write: bool },
    Pci { address: PciAddress, offset: u16, width: u8, write: bool },
}

impl TestHandler {
    pub(crate) fn new() -> TestHandler {
        TestHandler(Arc::new(State {
            memory: Mutex::new(BTreeMap::new()),
            io: Mutex::new(BTreeMap::new()),
            pci: Mutex::new(BTreeMap::new()),
            accesses: Mutex::new(Vec::new()),
            tables: Mutex::new(Vec::new()),
            notifications: Mutex::new(Vec::new()),
            mappings: AtomicUsize::new(0),
            next_handle: AtomicU32::new(1),
            held_mutexes: Mutex::new(BTreeSet::new()),
            signalled_events: Mutex::new(BTreeSet::new()),
            nanos: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }))
    }

    /// Put a table in memory at `address`, and report it from `find_table`.
    pub(crate) fn add_table(&self, address: u64, table: &[u8]) {
        let signature = Signature([table[0], table[1], table[2], table[3]]);
        let mut memory = self.0.memory.lock().unwrap();
        for (offset, byte) in table.iter().enumerate() {
            memory.insert(address as usize + offset, *byte);
        }
        self.0.tables.lock().unwrap().push((signature, address));
    }

    pub(crate) fn num_mappings(&self) -> usize {
        self.0.mappings.load(Ordering::SeqCst)
    }

    pub(crate) fn accesses(&self) -> Vec<Access> {
        self.0.accesses.lock().unwrap().clone()
    }

    pub(crate) fn notifications(&self) -> Vec<(std::string::String, u64)> {
        self.0.notifications.lock().unwrap().clone()
    }

    pub(crate) fn max_concurrent_calls(&self) -> usize {
        self.0.max_active.load(Ordering::SeqCst)
    }

    pub(crate) fn is_held(&self, mutex: Handle) -> bool {
        self.0.held_mutexes.lock().unwrap().contains(&mutex)
    }

    fn enter(&self) {
        let active = self.0.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.0.max_active.fetch_max(active, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }

    fn read_memory(&self, address: usize, width: u8) -> u64 {
        self.0.accesses.lock().unwrap().push(Access::Memory { address, width, write: false });
        let memory = self.0.memory.lock().unwrap();
        (0..(width as usize / 8))
            .map(|i| (*memory.get(&(address + i)).unwrap_or(&0) as u64) << (i * 8))
            .fold(0, |value, byte| value | byte)
    }

    fn write_memory(&self, address: usize, width: u8, value: u64) {
        self.0.accesses.lock().unwrap().push(Access::Memory { address, width, write: true });
        let mut memory = self.0.memory.lock().unwrap();
        for i in 0..(width as usize / 8) {
            memory.insert(address + i, (value >> (i * 8)) as u8);
        }
    }

    fn read_io(&self, port: u16, width: u8) -> u64 {
        self.0.accesses.lock().unwrap().push(Access::Io { port, width, write: false });
        let io = self.0.io.lock().unwrap();
        (0..(width as u16 / 8))
            .map(|i| (*io.get(&(port + i)).unwrap_or(&0) as u64) << (i * 8))
            .fold(0, |value, byte| value | byte)
    }

    fn write_io(&self, port: u16, width: u8, value: u64) {
        self.0.accesses.lock().unwrap().push(Access::Io { port, width, write: true });
        let mut io = self.0.io.lock().unwrap();
        for i in 0..(width as u16 / 8) {
            io.insert(port + i, (value >> (i * 8)) as u8);
        }
    }

    fn read_pci(&self, address: PciAddress, offset: u16, width: u8) -> u64 {
        self.0.accesses.lock().unwrap().push(Access::Pci { address, offset, width, write: false });
        let pci = self.0.pci.lock().unwrap();
        (0..(width as u16 / 8))
            .map(|i| (*pci.get(&(pci_key(address), offset + i)).unwrap_or(&0) as u64) << (i * 8))
            .fold(0, |value, byte| value | byte)
    }

    fn write_pci(&self, address: PciAddress, offset: u16, width: u8, value: u64) {
        self.0.accesses.lock().unwrap().push(Access::Pci { address, offset, width, write: true });
        let mut pci = self.0.pci.lock().unwrap();
        for i in 0..(width as u16 / 8) {
            pci.insert((pci_key(address), offset + i), (value >> (i * 8)) as u8);
        }
    }
}

#[rustfmt::skip]
impl Handler for TestHandler {
    fn read_u8(&self, address: usize) -> u8 { self.read_memory(address, 8) as u8 }
    fn read_u16(&self, address: usize) -> u16 { self.read_memory(address, 16) as u16 }
    fn read_u32(&self, address: usize) -> u32 { self.read_memory(address, 32) as u32 }
    fn read_u64(&self, address: usize) -> u64 { self.read_memory(address, 64) }
    fn write_u8(&self, address: usize, value: u8) { self.write_memory(address, 8, value as u64) }
    fn write_u16(&self, address: usize, value: u16) { self.write_memory(address, 16, value as u64) }
    fn write_u32(&self, address: usize, value: u32) { self.write_memory(address, 32, value as u64) }
    fn write_u64(&self, address: usize, value: u64) { self.write_memory(address, 64, value) }
    fn read_io_u8(&self, port: u16) -> u8 { self.read_io(port, 8) as u8 }
    fn read_io_u16(&self, port: u16) -> u16 { self.read_io(port, 16) as u16 }
    fn read_io_u32(&self, port: u16) -> u32 { self.read_io(port, 32) as u32 }
    fn write_io_u8(&self, port: u16, value: u8) { self.write_io(port, 8, value as u64) }
    fn write_io_u16(&self, port: u16, value: u16) { self.write_io(port, 16, value as u64) }
    fn write_io_u32(&self, port: u16, value: u32) { self.write_io(port, 32, value as u64) }
    fn read_pci_u8(&self, address: PciAddress, offset: u16) -> u8 { self.read_pci(address, offset, 8) as u8 }
    fn read_pci_u16(&self, address: PciAddress, offset: u16) -> u16 { self.read_pci(address, offset, 16) as u16 }
    fn read_pci_u32(&self, address: PciAddress, offset: u16) -> u32 { self.read_pci(address, offset, 32) as u32 }
    fn write_pci_u8(&self, address: PciAddress, offset: u16, value: u8) { self.write_pci(address, offset, 8, value as u64) }
    fn write_pci_u16(&self, address: PciAddress, offset: u16, value: u16) { self.write_pci(address, offset, 16, value as u64) }
    fn write_pci_u32(&self, address: PciAddress, offset: u16, value: u32) { self.write_pci(address, offset, 32, value as u64) }

    fn nanos_since_boot(&self) -> u64 {
        self.0.nanos.fetch_add(1000, Ordering::SeqCst) as u64
    }

    fn stall(&self, _microseconds: u64) {}

    fn sleep(&self, _milliseconds: u64) {
        self.enter();
        std::thread::sleep(std::time::Duration::from_millis(1));
        self.exit();
    }

    fn create_mutex(&self) -> Handle {
        Handle(self.0.next_handle.fetch_add(1, Ordering::SeqCst))
    }

    fn acquire(&self, mutex: Handle, _timeout: u16) -> Result<(), AmlError> {
        if self.0.held_mutexes.lock().unwrap().insert(mutex) { Ok(()) } else { Err(AmlError::MutexTimeout) }
    }

    fn release(&self, mutex: Handle) {
        self.0.held_mutexes.lock().unwrap().remove(&mutex);
    }

    fn create_event(&self) -> Handle {
        Handle(self.0.next_handle.fetch_add(1, Ordering::SeqCst))
    }

    fn wait_event(&self, event: Handle, _timeout: u16) -> Result<(), AmlError> {
        if self.0.signalled_events.lock().unwrap().remove(&event) { Ok(()) } else { Err(AmlError::MutexTimeout) }
    }

    fn signal_event(&self, event: Handle) {
        self.0.signalled_events.lock().unwrap().insert(event);
    }

    fn reset_event(&self, event: Handle) {
        self.0.signalled_events.lock().unwrap().remove(&event);
    }

    fn map_physical_region(&self, physical_address: u64, _length: usize) -> usize {
        self.0.mappings.fetch_add(1, Ordering::SeqCst);
        physical_address as usize
    }

    fn unmap_physical_region(&self, _virtual_address: usize, _length: usize) {
        self.0.mappings.fetch_sub(1, Ordering::SeqCst);
    }

    fn find_table(&self, signature: Signature, instance: usize, _prefer_rsdt: bool) -> Option<u64> {
        self.0.tables.lock().unwrap().iter().filter(|(s, _)| *s == signature).nth(instance).map(|(_, address)| *address)
    }

    fn notify(&self, path: &crate::namespace::AmlName, value: u64) {
        self.0.notifications.lock().unwrap().push((path.as_string(), value));
    }
}

/// Wrap `body` in a table with a valid header and checksum.
pub(crate) fn make_table(signature: &[u8; 4], revision: u8, body: &[u8]) -> Vec<u8> {
    let length = 36 + body.len();
    let mut table = Vec::with_capacity(length);
    table.extend_from_slice(signature);
    table.extend_from_slice(&(length as u32).to_le_bytes());
    table.push(revision);
    table.push(0);
    table.extend_from_slice(b"RUSTOS");
    table.extend_from_slice(b"TESTTBL ");
    table.extend_from_slice(&1u32.to_le_bytes());
    table.extend_from_slice(b"RSTC");
    table.extend_from_slice(&1u32.to_le_bytes());
    table.extend_from_slice(body);

    let sum = table.iter().fold(0u8, |sum, &byte| sum.wrapping_add(byte));
    table[9] = 0u8.wrapping_sub(sum);
    table
}

/// A DSDT (revision 2, so integers are 64 bits) containing `body`.
pub(crate) fn aml_table(body: &[u8]) -> Vec<u8> {
    make_table(b"DSDT", 2, body)
}

/// A FADT with just the fields the interpreter looks at filled in.
pub(crate) fn make_fadt(revision: u8, minor_version: u8, hardware_reduced: bool, dsdt: u32, x_dsdt: u64) -> Vec<u8> {
    let mut body = std::vec![0u8; 276 - 36];
    body[(40 - 36)..(44 - 36)].copy_from_slice(&dsdt.to_le_bytes());
    let flags: u32 = if hardware_reduced { 1 << 20 } else { 0 };
    body[(112 - 36)..(116 - 36)].copy_from_slice(&flags.to_le_bytes());
    body[131 - 36] = minor_version;
    body[(140 - 36)..(148 - 36)].copy_from_slice(&x_dsdt.to_le_bytes());
    make_table(b"FACP", revision, &body)
}
