use crate::{
    address_space::AddressSpaceHandler,
    namespace::{NameSeg, NodeHandle},
    object::{copy_bits, DeferredArgs, FieldAccessType, FieldFlags, FieldUnit, FieldUnitKind, FieldUpdateRule, Object, ObjectType},
    AmlError,
    Handler,
    Interpreter,
};
use alloc::{boxed::Box, sync::Arc, vec, vec::Vec};
use bit_field::BitField;
use core::any::Any;
use log::{trace, warn};
use pci_types::PciAddress;
use spinning_top::Spinlock;

const PAGE_SIZE: u64 = 0x1000;

#[derive(Clone)]
pub struct OpRegion {
    pub space: RegionSpace,
    pub base: u64,
    /// Zero until the region's deferred arguments have been evaluated.
    pub length: u64,
    pub deferred: Option<DeferredArgs>,
    /// The contents of the table a `DataTableRegion` refers to.
    pub table: Option<Arc<[u8]>>,
    pub(crate) handler: Option<Arc<AddressSpaceHandler>>,
    pub(crate) context: Option<Arc<Spinlock<RegionContext>>>,
}

impl OpRegion {
    pub fn new(space: RegionSpace, base: u64, length: u64) -> OpRegion {
        OpRegion { space, base, length, deferred: None, table: None, handler: None, context: None }
    }

    pub fn deferred(space: RegionSpace, deferred: DeferredArgs) -> OpRegion {
        OpRegion { space, base: 0, length: 0, deferred: Some(deferred), table: None, handler: None, context: None }
    }

    pub fn is_attached(&self) -> bool {
        self.handler.is_some()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum RegionSpace {
    SystemMemory,
    SystemIO,
    PciConfig,
    EmbeddedControl,
    SmBus,
    SystemCmos,
    PciBarTarget,
    Ipmi,
    GeneralPurposeIo,
    GenericSerialBus,
    Pcc,
    /// The space of regions created by `DataTableRegion`. It can't be named by `OperationRegion`.
    DataTable,
    Oem(u8),
}

impl From<u8> for RegionSpace {
    fn from(value: u8) -> Self {
        match value {
            0 => RegionSpace::SystemMemory,
            1 => RegionSpace::SystemIO,
            2 => RegionSpace::PciConfig,
            3 => RegionSpace::EmbeddedControl,
            4 => RegionSpace::SmBus,
            5 => RegionSpace::SystemCmos,
            6 => RegionSpace::PciBarTarget,
            7 => RegionSpace::Ipmi,
            8 => RegionSpace::GeneralPurposeIo,
            9 => RegionSpace::GenericSerialBus,
            10 => RegionSpace::Pcc,
            _ => RegionSpace::Oem(value),
        }
    }
}

impl RegionSpace {
    /// The space id passed to `_REG` methods.
    pub fn id(&self) -> u8 {
        match self {
            RegionSpace::SystemMemory => 0,
            RegionSpace::SystemIO => 1,
            RegionSpace::PciConfig => 2,
            RegionSpace::EmbeddedControl => 3,
            RegionSpace::SmBus => 4,
            RegionSpace::SystemCmos => 5,
            RegionSpace::PciBarTarget => 6,
            RegionSpace::Ipmi => 7,
            RegionSpace::GeneralPurposeIo => 8,
            RegionSpace::GenericSerialBus => 9,
            RegionSpace::Pcc => 10,
            RegionSpace::DataTable => 0x7e,
            RegionSpace::Oem(value) => *value,
        }
    }

    /// The widest access the interpreter will make to this space when a field's access type is `Any`.
    fn max_access_width(&self) -> u32 {
        match self {
            RegionSpace::SystemMemory => 64,
            RegionSpace::EmbeddedControl | RegionSpace::DataTable => 8,
            _ => 32,
        }
    }
}

/// Per-region state owned by the handler the region is attached to. It is created by
/// [`RegionHandler::setup`] on the first access through the handler.
pub enum RegionContext {
    None,
    SystemMemory { mappings: Vec<Mapping>, current: Option<usize> },
    Pci(PciAddress),
    DataTable { data: Arc<[u8]>, base: u64 },
    Custom(Box<dyn Any + Send>),
}

#[derive(Clone, Copy, Debug)]
pub struct Mapping {
    pub physical: u64,
    pub virtual_address: usize,
    pub length: usize,
}

impl Mapping {
    fn covers(&self, address: u64, length: usize) -> bool {
        address >= self.physical && address + length as u64 <= self.physical + self.length as u64
    }
}

/// What a handler is told about a region when it is first accessed.
#[derive(Clone)]
pub struct RegionInfo {
    pub node: NodeHandle,
    pub space: RegionSpace,
    pub base: u64,
    pub length: u64,
    pub pci_address: Option<PciAddress>,
    pub table: Option<Arc<[u8]>>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RegionAccess {
    Read,
    Write,
}

/// Implemented by address space handlers. `access` is called with the absolute address of the access (for PCI
/// configuration space, the offset into the function's configuration space), a width of 8, 16, 32, or 64 bits,
/// and the value to write (or the place to put the value read).
pub trait RegionHandler: Send + Sync {
    fn setup(&self, _region: &RegionInfo, _host: &dyn Handler) -> Result<RegionContext, AmlError> {
        Ok(RegionContext::None)
    }

    fn teardown(&self, _context: &mut RegionContext, _host: &dyn Handler) {}

    fn access(
        &self,
        access: RegionAccess,
        address: u64,
        width: u32,
        value: &mut u64,
        context: &mut RegionContext,
        host: &dyn Handler,
    ) -> Result<(), AmlError>;
}

pub struct SystemMemoryHandler;

impl RegionHandler for SystemMemoryHandler {
    fn setup(&self, _region: &RegionInfo, _host: &dyn Handler) -> Result<RegionContext, AmlError> {
        Ok(RegionContext::SystemMemory { mappings: Vec::new(), current: None })
    }

    fn teardown(&self, context: &mut RegionContext, host: &dyn Handler) {
        if let RegionContext::SystemMemory { mappings, current } = context {
            for mapping in mappings.drain(..) {
                host.unmap_physical_region(mapping.virtual_address, mapping.length);
            }
            *current = None;
        }
    }

    fn access(
        &self,
        access: RegionAccess,
        address: u64,
        width: u32,
        value: &mut u64,
        context: &mut RegionContext,
        host: &dyn Handler,
    ) -> Result<(), AmlError> {
        let RegionContext::SystemMemory { mappings, current } = context else {
            return Err(AmlError::InvalidArgument);
        };
        let length = (width / 8) as usize;

        let index = match *current {
            Some(index) if mappings.get(index).is_some_and(|mapping| mapping.covers(address, length)) => index,
            _ => match mappings.iter().position(|mapping| mapping.covers(address, length)) {
                Some(index) => index,
                None => {
                    // Map up to the end of the page, unless the access itself crosses the boundary
                    let map_length = usize::max(length, (PAGE_SIZE - (address % PAGE_SIZE)) as usize);
                    let virtual_address = host.map_physical_region(address, map_length);
                    trace!("Mapped {:#x} bytes of physical memory at {:#x} for region access", map_length, address);
                    mappings.push(Mapping { physical: address, virtual_address, length: map_length });
                    mappings.len() - 1
                }
            },
        };
        *current = Some(index);

        let mapping = mappings[index];
        let virtual_address = mapping.virtual_address + (address - mapping.physical) as usize;
        match access {
            RegionAccess::Read => {
                *value = match width {
                    8 => host.read_u8(virtual_address) as u64,
                    16 => host.read_u16(virtual_address) as u64,
                    32 => host.read_u32(virtual_address) as u64,
                    64 => host.read_u64(virtual_address),
                    _ => return Err(AmlError::FieldInvalidAccessSize),
                }
            }
            RegionAccess::Write => match width {
                8 => host.write_u8(virtual_address, *value as u8),
                16 => host.write_u16(virtual_address, *value as u16),
                32 => host.write_u32(virtual_address, *value as u32),
                64 => host.write_u64(virtual_address, *value),
                _ => return Err(AmlError::FieldInvalidAccessSize),
            },
        }
        Ok(())
    }
}

pub struct SystemIoHandler;

impl RegionHandler for SystemIoHandler {
    fn access(
        &self,
        access: RegionAccess,
        address: u64,
        width: u32,
        value: &mut u64,
        _context: &mut RegionContext,
        host: &dyn Handler,
    ) -> Result<(), AmlError> {
        let port = u16::try_from(address).map_err(|_| AmlError::FieldInvalidAddress)?;
        match access {
            RegionAccess::Read => {
                *value = match width {
                    8 => host.read_io_u8(port) as u64,
                    16 => host.read_io_u16(port) as u64,
                    32 => host.read_io_u32(port) as u64,
                    _ => return Err(AmlError::FieldInvalidAccessSize),
                }
            }
            RegionAccess::Write => match width {
                8 => host.write_io_u8(port, *value as u8),
                16 => host.write_io_u16(port, *value as u16),
                32 => host.write_io_u32(port, *value as u32),
                _ => return Err(AmlError::FieldInvalidAccessSize),
            },
        }
        Ok(())
    }
}

pub struct PciConfigHandler;

impl RegionHandler for PciConfigHandler {
    fn setup(&self, region: &RegionInfo, _host: &dyn Handler) -> Result<RegionContext, AmlError> {
        Ok(RegionContext::Pci(region.pci_address.unwrap_or_else(|| PciAddress::new(0, 0, 0, 0))))
    }

    fn access(
        &self,
        access: RegionAccess,
        address: u64,
        width: u32,
        value: &mut u64,
        context: &mut RegionContext,
        host: &dyn Handler,
    ) -> Result<(), AmlError> {
        let RegionContext::Pci(pci_address) = *context else {
            return Err(AmlError::InvalidArgument);
        };
        let offset = u16::try_from(address).map_err(|_| AmlError::FieldInvalidAddress)?;
        match access {
            RegionAccess::Read => {
                *value = match width {
                    8 => host.read_pci_u8(pci_address, offset) as u64,
                    16 => host.read_pci_u16(pci_address, offset) as u64,
                    32 => host.read_pci_u32(pci_address, offset) as u64,
                    _ => return Err(AmlError::FieldInvalidAccessSize),
                }
            }
            RegionAccess::Write => match width {
                8 => host.write_pci_u8(pci_address, offset, *value as u8),
                16 => host.write_pci_u16(pci_address, offset, *value as u16),
                32 => host.write_pci_u32(pci_address, offset, *value as u32),
                _ => return Err(AmlError::FieldInvalidAccessSize),
            },
        }
        Ok(())
    }
}

/// Handles regions created by `DataTableRegion`. These are read-only views of a table already in memory.
pub struct DataTableHandler;

impl RegionHandler for DataTableHandler {
    fn setup(&self, region: &RegionInfo, _host: &dyn Handler) -> Result<RegionContext, AmlError> {
        let data = region.table.clone().ok_or(AmlError::InvalidArgument)?;
        Ok(RegionContext::DataTable { data, base: region.base })
    }

    fn access(
        &self,
        access: RegionAccess,
        address: u64,
        width: u32,
        value: &mut u64,
        context: &mut RegionContext,
        _host: &dyn Handler,
    ) -> Result<(), AmlError> {
        let RegionContext::DataTable { data, base } = context else {
            return Err(AmlError::InvalidArgument);
        };
        if access == RegionAccess::Write {
            return Err(AmlError::InvalidOperationOnObject {
                op: crate::Operation::WriteField,
                typ: ObjectType::OpRegion,
            });
        }

        let offset = address.checked_sub(*base).ok_or(AmlError::RegionOutOfBounds)? as usize;
        let length = (width / 8) as usize;
        let bytes = data.get(offset..(offset + length)).ok_or(AmlError::RegionOutOfBounds)?;
        let mut buffer = [0u8; 8];
        buffer[0..length].copy_from_slice(bytes);
        *value = u64::from_le_bytes(buffer);
        Ok(())
    }
}

/// A region that is ready to be accessed: its arguments have been evaluated, and it is attached to a handler
/// that has set up its context.
pub(crate) struct PreparedRegion {
    space: RegionSpace,
    base: u64,
    length: u64,
    handler: Arc<AddressSpaceHandler>,
    context: Arc<Spinlock<RegionContext>>,
}

enum AccessTarget {
    Region(PreparedRegion),
    Index { index: NodeHandle, data: NodeHandle },
}

/// Encode a seven-character EISA id string (e.g. `PNP0A03`) in the compressed form used by `_HID` integers.
pub(crate) fn eisa_id(id: &str) -> Option<u32> {
    let bytes = id.as_bytes();
    if bytes.len() != 7 || !bytes[0..3].iter().all(|c| c.is_ascii_uppercase()) {
        return None;
    }

    let vendor = ((bytes[0] - 0x40) as u32) << 10 | ((bytes[1] - 0x40) as u32) << 5 | (bytes[2] - 0x40) as u32;
    let product = u32::from_str_radix(&id[3..7], 16).ok()?;
    Some(((vendor << 16) | product).swap_bytes())
}

impl Interpreter {
    /// Evaluate a region's deferred arguments if that hasn't happened yet, make sure it is attached to a
    /// handler, and set up its context.
    pub(crate) fn prepare_region(&self, node: NodeHandle) -> Result<PreparedRegion, AmlError> {
        let object = self.namespace.read().object(node)?.ok_or(AmlError::InvalidReference)?;

        let deferred = match &*object.lock() {
            Object::OpRegion(region) => region.deferred.clone(),
            other => return Err(AmlError::ObjectNotOfExpectedType { expected: ObjectType::OpRegion, got: other.typ() }),
        };
        if let Some(deferred) = deferred {
            self.execute_deferred_region(&object, &deferred)?;
        }

        let attached = matches!(&*object.lock(), Object::OpRegion(region) if region.handler.is_some());
        if !attached {
            self.attach_region(node)?;
        }

        let (info, handler, context) = match &*object.lock() {
            Object::OpRegion(region) => (
                RegionInfo {
                    node,
                    space: region.space,
                    base: region.base,
                    length: region.length,
                    pci_address: None,
                    table: region.table.clone(),
                },
                region.handler.clone(),
                region.context.clone(),
            ),
            _ => return Err(AmlError::InvalidReference),
        };
        let handler = handler.ok_or(AmlError::NoHandlerForRegion(info.space))?;

        let context = match context {
            Some(context) => context,
            None => {
                let mut info = info.clone();
                if info.space == RegionSpace::PciConfig {
                    info.pci_address = Some(self.pci_address_for_region(node)?);
                }
                let context = Arc::new(Spinlock::new(handler.handler.setup(&info, &*self.handler)?));
                if let Object::OpRegion(region) = &mut *object.lock() {
                    region.context = Some(context.clone());
                }
                context
            }
        };

        Ok(PreparedRegion { space: info.space, base: info.base, length: info.length, handler, context })
    }

    /// Work out the PCI address of the function a configuration-space region belongs to. The device and
    /// function come from the `_ADR` of the region's parent, and the segment and bus from the `_SEG` and `_BBN`
    /// of the closest PCI root bridge above it.
    fn pci_address_for_region(&self, region: NodeHandle) -> Result<PciAddress, AmlError> {
        let device = self.namespace.read().parent(region)?.ok_or(AmlError::InvalidReference)?;
        let adr = self.evaluate_child_integer(device, "_ADR")?.unwrap_or(0);

        let mut segment = 0;
        let mut bus = 0;
        let mut current = Some(device);
        while let Some(node) = current {
            if self.is_pci_root_bridge(node)? {
                segment = self.evaluate_child_integer(node, "_SEG")?.unwrap_or(0);
                bus = self.evaluate_child_integer(node, "_BBN")?.unwrap_or(0);
                break;
            }
            current = self.namespace.read().parent(node)?;
        }

        let address =
            PciAddress::new(segment as u16, bus as u8, adr.get_bits(16..32) as u8, adr.get_bits(0..16) as u8);
        trace!("PCI configuration region is for function {}", address);
        Ok(address)
    }

    fn is_pci_root_bridge(&self, node: NodeHandle) -> Result<bool, AmlError> {
        let pcie_root = eisa_id("PNP0A08");
        let pci_root = eisa_id("PNP0A03");
        let matches = |object: &Object| match object {
            Object::Integer(id) => Some(*id as u32) == pcie_root || Some(*id as u32) == pci_root,
            Object::String(id) => id == "PNP0A08" || id == "PNP0A03",
            _ => false,
        };

        if let Some(hid) = self.evaluate_child(node, "_HID")? {
            if matches(&*hid.lock()) {
                return Ok(true);
            }
        }
        if let Some(cid) = self.evaluate_child(node, "_CID")? {
            let cid = cid.snapshot();
            return Ok(match cid {
                Object::Package(ids) => ids.iter().any(|id| matches(&*id.lock())),
                other => matches(&other),
            });
        }
        Ok(false)
    }

    fn evaluate_child_integer(&self, scope: NodeHandle, name: &str) -> Result<Option<u64>, AmlError> {
        match self.evaluate_child(scope, name)? {
            Some(value) => Ok(Some(self.operand_to_integer(&value)?)),
            None => Ok(None),
        }
    }

    fn field_unit(&self, node: NodeHandle) -> Result<FieldUnit, AmlError> {
        let object = self.namespace.read().object(node)?.ok_or(AmlError::InvalidReference)?;
        let object = object.lock();
        match &*object {
            Object::FieldUnit(field) => Ok(field.clone()),
            other => Err(AmlError::ObjectNotOfExpectedType { expected: ObjectType::FieldUnit, got: other.typ() }),
        }
    }

    fn access_width(&self, field: &FieldUnit, target: &AccessTarget) -> Result<u32, AmlError> {
        Ok(match field.flags.access_type()? {
            FieldAccessType::Byte | FieldAccessType::Buffer => 8,
            FieldAccessType::Word => 16,
            FieldAccessType::DWord => 32,
            FieldAccessType::QWord => 64,
            FieldAccessType::Any => {
                let max = match target {
                    AccessTarget::Region(region) => region.space.max_access_width(),
                    AccessTarget::Index { .. } => 32,
                };
                let span = ((field.bit_index % 8 + field.bit_length) as u32).next_power_of_two();
                span.clamp(8, max)
            }
        })
    }

    fn access_target(&self, field: &FieldUnit) -> Result<AccessTarget, AmlError> {
        match field.kind {
            FieldUnitKind::Normal { region } => Ok(AccessTarget::Region(self.prepare_region(region)?)),
            FieldUnitKind::Bank { region, bank, bank_value } => {
                let bank = self.field_unit(bank)?;
                self.write_field(&bank, &Object::Integer(bank_value))?;
                Ok(AccessTarget::Region(self.prepare_region(region)?))
            }
            FieldUnitKind::Index { index, data } => Ok(AccessTarget::Index { index, data }),
        }
    }

    fn read_unit(&self, target: &AccessTarget, byte_offset: u64, width: u32) -> Result<u64, AmlError> {
        match target {
            AccessTarget::Region(region) => {
                let address = self.unit_address(region, byte_offset, width)?;
                let mut value = 0;
                let _guard = region.handler.context_lock.lock();
                let mut context = region.context.lock();
                region.handler.handler.access(
                    RegionAccess::Read,
                    address,
                    width,
                    &mut value,
                    &mut context,
                    &*self.handler,
                )?;
                Ok(value)
            }
            AccessTarget::Index { index, data } => {
                self.write_field(&self.field_unit(*index)?, &Object::Integer(byte_offset))?;
                let value = self.read_field(&self.field_unit(*data)?)?;
                self.operand_to_integer(&value.wrap())
            }
        }
    }

    fn write_unit(&self, target: &AccessTarget, byte_offset: u64, width: u32, value: u64) -> Result<(), AmlError> {
        match target {
            AccessTarget::Region(region) => {
                let address = self.unit_address(region, byte_offset, width)?;
                let mut value = value;
                let _guard = region.handler.context_lock.lock();
                let mut context = region.context.lock();
                region.handler.handler.access(
                    RegionAccess::Write,
                    address,
                    width,
                    &mut value,
                    &mut context,
                    &*self.handler,
                )
            }
            AccessTarget::Index { index, data } => {
                self.write_field(&self.field_unit(*index)?, &Object::Integer(byte_offset))?;
                self.write_field(&self.field_unit(*data)?, &Object::Integer(value))
            }
        }
    }

    fn unit_address(&self, region: &PreparedRegion, byte_offset: u64, width: u32) -> Result<u64, AmlError> {
        let width_bytes = (width / 8) as u64;
        if byte_offset + width_bytes > region.length {
            warn!(
                "Field access at offset {:#x} (width {}) is outside region of length {:#x}",
                byte_offset, width, region.length
            );
            return Err(AmlError::RegionOutOfBounds);
        }

        let address = region.base.checked_add(byte_offset).ok_or(AmlError::FieldInvalidAddress)?;
        if cfg!(feature = "strict-alignment") && address % width_bytes != 0 {
            return Err(AmlError::AlignmentViolation);
        }
        Ok(address)
    }

    /// Read the whole contents of a region a byte at a time, as `Load` does.
    pub(crate) fn read_region_bytes(&self, node: NodeHandle) -> Result<Vec<u8>, AmlError> {
        let region = self.prepare_region(node)?;
        let length = usize::try_from(region.length).map_err(|_| AmlError::RegionOutOfBounds)?;
        let target = AccessTarget::Region(region);

        let mut bytes = Vec::with_capacity(length);
        for offset in 0..(length as u64) {
            bytes.push(self.read_unit(&target, offset, 8)? as u8);
        }
        Ok(bytes)
    }

    /// Read a field unit. Fields that fit in an integer are read as an integer, and wider fields as a buffer.
    pub(crate) fn read_field(&self, field: &FieldUnit) -> Result<Object, AmlError> {
        let _global_lock = self.acquire_global_lock(field.flags)?;
        let target = self.access_target(field)?;
        let width = self.access_width(field, &target)?;

        let mut bytes = vec![0u8; field.bit_length.div_ceil(8).max(1)];
        let field_end = field.bit_index + field.bit_length;
        let mut unit_bit = field.bit_index - field.bit_index % width as usize;
        while unit_bit < field_end {
            let lo = usize::max(field.bit_index, unit_bit);
            let hi = usize::min(field_end, unit_bit + width as usize);

            let raw = self.read_unit(&target, (unit_bit / 8) as u64, width)?;
            copy_bits(&raw.to_le_bytes(), lo - unit_bit, &mut bytes, lo - field.bit_index, hi - lo)?;
            unit_bit += width as usize;
        }

        if field.bit_length <= self.integer_bytes() * 8 {
            let mut value = [0u8; 8];
            let length = bytes.len().min(8);
            value[0..length].copy_from_slice(&bytes[0..length]);
            Ok(Object::Integer(u64::from_le_bytes(value)))
        } else {
            Ok(Object::Buffer(bytes))
        }
    }

    /// Write a value to a field unit. Units only partly covered by the field are filled according to the
    /// field's update rule.
    pub(crate) fn write_field(&self, field: &FieldUnit, value: &Object) -> Result<(), AmlError> {
        let data = match value {
            Object::Integer(value) => value.to_le_bytes().to_vec(),
            Object::Buffer(bytes) => bytes.clone(),
            Object::String(string) => string.as_bytes().to_vec(),
            other => {
                return Err(AmlError::InvalidOperationOnObject { op: crate::Operation::WriteField, typ: other.typ() });
            }
        };

        let _global_lock = self.acquire_global_lock(field.flags)?;
        let target = self.access_target(field)?;
        let width = self.access_width(field, &target)?;
        let update_rule = field.flags.update_rule()?;
        let width_mask = if width == 64 { u64::MAX } else { (1u64 << width) - 1 };

        let field_end = field.bit_index + field.bit_length;
        let mut unit_bit = field.bit_index - field.bit_index % width as usize;
        while unit_bit < field_end {
            let lo = usize::max(field.bit_index, unit_bit);
            let hi = usize::min(field_end, unit_bit + width as usize);

            let initial = if hi - lo == width as usize {
                0
            } else {
                match update_rule {
                    FieldUpdateRule::Preserve => self.read_unit(&target, (unit_bit / 8) as u64, width)?,
                    FieldUpdateRule::WriteAsOnes => width_mask,
                    FieldUpdateRule::WriteAsZeros => 0,
                }
            };

            let mut unit = initial.to_le_bytes();
            copy_bits(&data, lo - field.bit_index, &mut unit, lo - unit_bit, hi - lo)?;
            self.write_unit(&target, (unit_bit / 8) as u64, width, u64::from_le_bytes(unit) & width_mask)?;
            unit_bit += width as usize;
        }

        Ok(())
    }

    /// Fields with a lock rule of `Lock` must hold the global lock while they are accessed.
    fn acquire_global_lock(&self, flags: FieldFlags) -> Result<Option<GlobalLockGuard<'_>>, AmlError> {
        if !flags.lock_rule() {
            return Ok(None);
        }

        let mutex = {
            let namespace = self.namespace.read();
            let Some(node) = namespace.child(namespace.root(), NameSeg(*b"_GL_"))? else { return Ok(None) };
            match namespace.object(node)?.map(|object| object.snapshot()) {
                Some(Object::Mutex { mutex, .. }) => mutex,
                _ => return Ok(None),
            }
        };

        self.handler.acquire(mutex, 0xffff)?;
        Ok(Some(GlobalLockGuard { handler: &*self.handler, mutex }))
    }
}

struct GlobalLockGuard<'a> {
    handler: &'a dyn Handler,
    mutex: crate::Handle,
}

impl Drop for GlobalLockGuard<'_> {
    fn drop(&mut self) {
        self.handler.release(self.mutex);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestHandler;

    fn info(space: RegionSpace) -> RegionInfo {
        RegionInfo {
            node: crate::namespace::Namespace::new().root(),
            space,
            base: 0,
            length: 0x100,
            pci_address: None,
            table: None,
        }
    }

    #[test]
    fn eisa_ids() {
        assert_eq!(eisa_id("PNP0A03"), Some(0x030a_d041));
        assert_eq!(eisa_id("PNP0A08"), Some(0x080a_d041));
        assert_eq!(eisa_id("PNP0A0"), None);
        assert_eq!(eisa_id("pnp0a03"), None);
    }

    #[test]
    fn memory_mappings_are_reused_and_page_limited() {
        let host = TestHandler::new();
        let handler = SystemMemoryHandler;
        let mut context = handler.setup(&info(RegionSpace::SystemMemory), &host).unwrap();

        let mut value = 0xdead_beef;
        handler.access(RegionAccess::Write, 0x1ff8, 32, &mut value, &mut context, &host).unwrap();
        let mut value = 0;
        handler.access(RegionAccess::Read, 0x1ffc, 8, &mut value, &mut context, &host).unwrap();
        handler.access(RegionAccess::Read, 0x1ff8, 32, &mut value, &mut context, &host).unwrap();
        assert_eq!(value, 0xdead_beef);

        let RegionContext::SystemMemory { ref mappings, .. } = context else { panic!() };
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].length, 8);

        // Crossing into the next page needs a new mapping
        handler.access(RegionAccess::Read, 0x2000, 64, &mut value, &mut context, &host).unwrap();
        let RegionContext::SystemMemory { ref mappings, .. } = context else { panic!() };
        assert_eq!(mappings.len(), 2);
        assert_eq!(mappings[1].length, 0x1000);

        handler.teardown(&mut context, &host);
        assert_eq!(host.num_mappings(), 0);
    }

    #[test]
    fn pci_accesses_use_the_region_function() {
        let host = TestHandler::new();
        let handler = PciConfigHandler;
        let mut region = info(RegionSpace::PciConfig);
        region.pci_address = Some(PciAddress::new(0, 1, 2, 3));
        let mut context = handler.setup(&region, &host).unwrap();

        let mut value = 0x8086;
        handler.access(RegionAccess::Write, 0x00, 16, &mut value, &mut context, &host).unwrap();
        assert_eq!(host.read_pci_u16(PciAddress::new(0, 1, 2, 3), 0x00), 0x8086);
        assert_eq!(host.read_pci_u16(PciAddress::new(0, 1, 2, 4), 0x00), 0x0000);
        assert_eq!(
            handler.access(RegionAccess::Write, 0x00, 64, &mut value, &mut context, &host),
            Err(AmlError::FieldInvalidAccessSize)
        );
    }

    #[test]
    fn data_tables_are_read_only() {
        let host = TestHandler::new();
        let handler = DataTableHandler;
        let mut region = info(RegionSpace::DataTable);
        region.base = 0x4000;
        region.table = Some(Arc::from(&[0x11u8, 0x22, 0x33, 0x44][..]));
        let mut context = handler.setup(&region, &host).unwrap();

        let mut value = 0;
        handler.access(RegionAccess::Read, 0x4001, 16, &mut value, &mut context, &host).unwrap();
        assert_eq!(value, 0x3322);
        assert!(handler.access(RegionAccess::Write, 0x4000, 8, &mut value, &mut context, &host).is_err());
        assert_eq!(
            handler.access(RegionAccess::Read, 0x4003, 16, &mut value, &mut context, &host),
            Err(AmlError::RegionOutOfBounds)
        );
    }
}
