use crate::{
    namespace::NodeHandle,
    op_region::OpRegion,
    owner::OwnerId,
    stream::AmlCode,
    tables::TableIndex,
    AmlError,
    Handle,
    Operation,
};
use alloc::{
    format,
    string::{String, ToString},
    sync::Arc,
    vec::Vec,
};
use bit_field::BitField;
use bitvec::{order::Lsb0, view::BitView};
use core::fmt;
use spinning_top::{guard::SpinlockGuard, Spinlock};

pub type NativeMethod = dyn Fn(&[WrappedObject]) -> Result<WrappedObject, AmlError> + Send + Sync;

#[derive(Clone)]
pub enum Object {
    Uninitialized,
    Integer(u64),
    String(String),
    Buffer(Vec<u8>),
    Package(Vec<WrappedObject>),
    BufferField(BufferField),
    FieldUnit(FieldUnit),
    Device,
    Event(Handle),
    Method(Method),
    Mutex { mutex: Handle, sync_level: u8 },
    Reference { kind: ReferenceKind, target: ReferenceTarget },
    OpRegion(OpRegion),
    PowerResource { system_level: u8, resource_order: u16 },
    Processor { proc_id: u8, pblk_address: u32, pblk_length: u8 },
    ThermalZone,
    Debug,
    /// The target of an `Alias`. Lookups chase this transparently.
    Alias(NodeHandle),
}

/// An [`Object`] shared between the namespace, packages, locals, and in-flight operations. All mutation goes
/// through the lock; callers must not hold the guard of one object while locking the same object again (e.g.
/// when storing a local to itself), as the lock is not re-entrant.
#[derive(Clone)]
pub struct WrappedObject(Arc<Spinlock<Object>>);

impl WrappedObject {
    pub fn new(object: Object) -> WrappedObject {
        WrappedObject(Arc::new(Spinlock::new(object)))
    }

    pub fn lock(&self) -> SpinlockGuard<'_, Object> {
        self.0.lock()
    }

    /// Take a copy of the current contents of the object.
    pub fn snapshot(&self) -> Object {
        self.0.lock().clone()
    }

    pub fn ptr_eq(&self, other: &WrappedObject) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Copy this object into a new, unshared object. Packages are copied element-by-element, so the copy shares
    /// no storage with the original. References are copied as references.
    pub fn deep_copy(&self) -> WrappedObject {
        let snapshot = self.snapshot();
        match snapshot {
            Object::Package(elements) => {
                Object::Package(elements.iter().map(|element| element.deep_copy()).collect()).wrap()
            }
            other => other.wrap(),
        }
    }
}

impl fmt::Debug for WrappedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.try_lock() {
            Some(object) => write!(f, "WrappedObject({})", *object),
            None => write!(f, "WrappedObject(<locked>)"),
        }
    }
}

impl Object {
    pub fn wrap(self) -> WrappedObject {
        WrappedObject::new(self)
    }

    pub fn native_method<F>(num_args: u8, f: F) -> Object
    where
        F: Fn(&[WrappedObject]) -> Result<WrappedObject, AmlError> + Send + Sync + 'static,
    {
        let mut flags = 0;
        flags.set_bits(0..3, num_args);
        Object::Method(Method { code: MethodCode::Native(Arc::new(f)), flags: MethodFlags(flags), owner: OwnerId::NONE })
    }

    pub fn as_integer(&self) -> Result<u64, AmlError> {
        if let Object::Integer(value) = self {
            Ok(*value)
        } else {
            Err(AmlError::ObjectNotOfExpectedType { expected: ObjectType::Integer, got: self.typ() })
        }
    }

    pub fn as_string(&self) -> Result<&str, AmlError> {
        if let Object::String(value) = self {
            Ok(value)
        } else {
            Err(AmlError::ObjectNotOfExpectedType { expected: ObjectType::String, got: self.typ() })
        }
    }

    pub fn as_buffer(&self) -> Result<&[u8], AmlError> {
        if let Object::Buffer(bytes) = self {
            Ok(bytes)
        } else {
            Err(AmlError::ObjectNotOfExpectedType { expected: ObjectType::Buffer, got: self.typ() })
        }
    }

    /// Implicitly convert a data object to an integer. Buffers contribute at most `allowed_bytes` bytes
    /// (little-endian), and strings are parsed as hexadecimal up to the first non-hex character.
    pub fn to_integer(&self, allowed_bytes: usize) -> Result<u64, AmlError> {
        match self {
            Object::Integer(value) => Ok(*value),
            Object::Buffer(value) => {
                let length = usize::min(value.len(), allowed_bytes);
                let mut bytes = [0u8; 8];
                bytes[0..length].copy_from_slice(&value[0..length]);
                Ok(u64::from_le_bytes(bytes))
            }
            Object::String(value) => Ok(parse_hex_prefix(value, allowed_bytes)),
            _ => Err(AmlError::InvalidOperationOnObject { op: Operation::ToInteger, typ: self.typ() }),
        }
    }

    /// Implicitly convert a data object to a buffer. Integers produce `allowed_bytes` bytes, and strings are
    /// copied along with their null terminator.
    pub fn to_buffer(&self, allowed_bytes: usize) -> Result<Vec<u8>, AmlError> {
        match self {
            Object::Buffer(bytes) => Ok(bytes.clone()),
            Object::Integer(value) => Ok(value.to_le_bytes()[0..allowed_bytes.min(8)].to_vec()),
            Object::String(value) => {
                let mut bytes = value.as_bytes().to_vec();
                if !bytes.is_empty() {
                    bytes.push(0);
                }
                Ok(bytes)
            }
            _ => Err(AmlError::InvalidOperationOnObject { op: Operation::ToBuffer, typ: self.typ() }),
        }
    }

    /// Implicitly convert a data object to a string. Integers become fixed-width uppercase hex (without a
    /// prefix), and buffers become a comma-separated list of `0xNN` bytes.
    pub fn to_aml_string(&self, allowed_bytes: usize) -> Result<String, AmlError> {
        match self {
            Object::String(value) => Ok(value.clone()),
            Object::Integer(value) => Ok(format!("{:01$X}", value, allowed_bytes * 2)),
            Object::Buffer(bytes) => {
                Ok(bytes.iter().map(|byte| format!("0x{:02X}", byte)).collect::<Vec<_>>().join(","))
            }
            _ => Err(AmlError::InvalidOperationOnObject { op: Operation::ToString, typ: self.typ() }),
        }
    }

    /// Returns the `ObjectType` of this object. References report their own type, rather than that of the
    /// object they refer to, except for table handles.
    pub fn typ(&self) -> ObjectType {
        match self {
            Object::Uninitialized => ObjectType::Uninitialized,
            Object::Integer(_) => ObjectType::Integer,
            Object::String(_) => ObjectType::String,
            Object::Buffer(_) => ObjectType::Buffer,
            Object::Package(_) => ObjectType::Package,
            Object::BufferField(_) => ObjectType::BufferField,
            Object::FieldUnit(_) => ObjectType::FieldUnit,
            Object::Device => ObjectType::Device,
            Object::Event(_) => ObjectType::Event,
            Object::Method(_) => ObjectType::Method,
            Object::Mutex { .. } => ObjectType::Mutex,
            Object::Reference { kind: ReferenceKind::Table, .. } => ObjectType::DdbHandle,
            Object::Reference { .. } => ObjectType::Reference,
            Object::OpRegion(_) => ObjectType::OpRegion,
            Object::PowerResource { .. } => ObjectType::PowerResource,
            Object::Processor { .. } => ObjectType::Processor,
            Object::ThermalZone => ObjectType::ThermalZone,
            Object::Debug => ObjectType::Debug,
            Object::Alias(_) => ObjectType::LocalAlias,
        }
    }

    pub fn is_data(&self) -> bool {
        matches!(self, Object::Integer(_) | Object::String(_) | Object::Buffer(_) | Object::Package(_))
    }
}

/// Parse a string as hex, stopping at the first character that is not a hex digit. Leading whitespace and an
/// optional `0x` prefix are skipped. Digits that do not fit in `allowed_bytes` are discarded.
pub(crate) fn parse_hex_prefix(string: &str, allowed_bytes: usize) -> u64 {
    let trimmed = string.trim_start();
    let trimmed = trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")).unwrap_or(trimmed);
    let mut value = 0u64;
    for digit in trimmed.chars().map_while(|c| c.to_digit(16)).take(allowed_bytes * 2) {
        value = (value << 4) | digit as u64;
    }
    value
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Object::Uninitialized => write!(f, "[Uninitialized]"),
            Object::Integer(value) => write!(f, "Integer({:#x})", value),
            Object::String(value) => write!(f, "String({:?})", value),
            Object::Buffer(bytes) => write!(f, "Buffer({:x?})", bytes),
            Object::Package(elements) => {
                write!(f, "Package {{ ")?;
                for (i, element) in elements.iter().enumerate() {
                    let element = match element.0.try_lock() {
                        Some(element) => format!("{}", *element),
                        None => "<locked>".to_string(),
                    };
                    if i == elements.len() - 1 {
                        write!(f, "{}", element)?;
                    } else {
                        write!(f, "{}, ", element)?;
                    }
                }
                write!(f, " }}")
            }
            Object::BufferField(field) => {
                write!(f, "BufferField {{ bit_index: {}, bit_length: {} }}", field.bit_index, field.bit_length)
            }
            Object::FieldUnit(field) => {
                write!(f, "FieldUnit {{ bit_index: {}, bit_length: {} }}", field.bit_index, field.bit_length)
            }
            Object::Device => write!(f, "Device"),
            Object::Event(handle) => write!(f, "Event({:?})", handle),
            Object::Method(method) => match method.code {
                MethodCode::Aml(ref code) => {
                    write!(f, "Method {{ arg_count: {}, length: {} }}", method.flags.arg_count(), code.len())
                }
                MethodCode::Native(_) => write!(f, "NativeMethod {{ arg_count: {} }}", method.flags.arg_count()),
            },
            Object::Mutex { sync_level, .. } => write!(f, "Mutex {{ sync_level: {} }}", sync_level),
            Object::Reference { kind, target } => write!(f, "Reference({:?} -> {:?})", kind, target),
            Object::OpRegion(region) => {
                write!(f, "OpRegion {{ space: {:?}, base: {:#x}, length: {:#x} }}", region.space, region.base, region.length)
            }
            Object::PowerResource { system_level, resource_order } => {
                write!(f, "PowerResource {{ system_level: {}, resource_order: {} }}", system_level, resource_order)
            }
            Object::Processor { proc_id, .. } => write!(f, "Processor {{ id: {} }}", proc_id),
            Object::ThermalZone => write!(f, "ThermalZone"),
            Object::Debug => write!(f, "Debug"),
            Object::Alias(target) => write!(f, "Alias({:?})", target),
        }
    }
}

#[derive(Clone)]
pub struct Method {
    pub code: MethodCode,
    pub flags: MethodFlags,
    /// The owner of the table that declared the method. Invocations get their own owner.
    pub owner: OwnerId,
}

#[derive(Clone)]
pub enum MethodCode {
    Aml(AmlCode),
    Native(Arc<NativeMethod>),
}

impl Method {
    pub fn is_native(&self) -> bool {
        matches!(self.code, MethodCode::Native(_))
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MethodFlags(pub u8);

impl MethodFlags {
    pub fn arg_count(&self) -> usize {
        self.0.get_bits(0..3) as usize
    }

    pub fn serialize(&self) -> bool {
        self.0.get_bit(3)
    }

    pub fn sync_level(&self) -> u8 {
        self.0.get_bits(4..8)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ReferenceKind {
    RefOf,
    Index,
    /// A `DdbHandle` produced by `Load` or `LoadTable`.
    Table,
    /// A reference to a namespace node that is not a data object (e.g. a `Device` used as a method argument).
    Name,
}

#[derive(Clone)]
pub enum ReferenceTarget {
    Node(NodeHandle),
    Object(WrappedObject),
    /// A single byte of a buffer, produced by `Index` on a buffer or string.
    BufferIndex { buffer: WrappedObject, index: usize },
    Table(TableIndex),
}

impl fmt::Debug for ReferenceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReferenceTarget::Node(node) => write!(f, "Node({})", node.unique_id()),
            ReferenceTarget::Object(_) => write!(f, "Object"),
            ReferenceTarget::BufferIndex { index, .. } => write!(f, "BufferIndex({})", index),
            ReferenceTarget::Table(table) => write!(f, "Table({:?})", table),
        }
    }
}

#[derive(Clone)]
pub struct BufferField {
    /// `None` until the arguments of a module-level `Create*Field` have been evaluated.
    pub buffer: Option<WrappedObject>,
    pub bit_index: usize,
    pub bit_length: usize,
    pub deferred: Option<DeferredArgs>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CreateFieldKind {
    Bit,
    Byte,
    Word,
    DWord,
    QWord,
    /// `CreateField`, which takes an explicit bit index and bit length.
    Arbitrary,
}

impl CreateFieldKind {
    /// Returns the bit index and bit length of the field, given the index operand (and, for `CreateField`, the
    /// length operand).
    pub fn bits(&self, index: u64, length: u64) -> (usize, usize) {
        match self {
            CreateFieldKind::Bit => (index as usize, 1),
            CreateFieldKind::Byte => (index as usize * 8, 8),
            CreateFieldKind::Word => (index as usize * 8, 16),
            CreateFieldKind::DWord => (index as usize * 8, 32),
            CreateFieldKind::QWord => (index as usize * 8, 64),
            CreateFieldKind::Arbitrary => (index as usize, length as usize),
        }
    }
}

/// The recorded AML of operands whose evaluation is deferred until the object they belong to is first used.
#[derive(Clone)]
pub struct DeferredArgs {
    pub code: AmlCode,
    pub scope: NodeHandle,
    pub owner: OwnerId,
    pub kind: DeferredKind,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DeferredKind {
    Region,
    DataRegion,
    BufferField(CreateFieldKind),
}

#[derive(Clone, Debug)]
pub struct FieldUnit {
    pub kind: FieldUnitKind,
    pub flags: FieldFlags,
    pub bit_index: usize,
    pub bit_length: usize,
}

#[derive(Clone, Debug)]
pub enum FieldUnitKind {
    Normal { region: NodeHandle },
    Bank { region: NodeHandle, bank: NodeHandle, bank_value: u64 },
    Index { index: NodeHandle, data: NodeHandle },
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FieldFlags(pub u8);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FieldAccessType {
    Any,
    Byte,
    Word,
    DWord,
    QWord,
    Buffer,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FieldUpdateRule {
    Preserve,
    WriteAsOnes,
    WriteAsZeros,
}

impl FieldFlags {
    pub fn access_type(&self) -> Result<FieldAccessType, AmlError> {
        match self.0.get_bits(0..4) {
            0 => Ok(FieldAccessType::Any),
            1 => Ok(FieldAccessType::Byte),
            2 => Ok(FieldAccessType::Word),
            3 => Ok(FieldAccessType::DWord),
            4 => Ok(FieldAccessType::QWord),
            5 => Ok(FieldAccessType::Buffer),
            _ => Err(AmlError::InvalidFieldFlags),
        }
    }

    pub fn lock_rule(&self) -> bool {
        self.0.get_bit(4)
    }

    pub fn update_rule(&self) -> Result<FieldUpdateRule, AmlError> {
        match self.0.get_bits(5..7) {
            0 => Ok(FieldUpdateRule::Preserve),
            1 => Ok(FieldUpdateRule::WriteAsOnes),
            2 => Ok(FieldUpdateRule::WriteAsZeros),
            _ => Err(AmlError::InvalidFieldFlags),
        }
    }

    /// Replace the access type, as done by an `AccessField` entry in a field list.
    pub fn with_access_type(self, access_type: u8) -> FieldFlags {
        let mut flags = self.0;
        flags.set_bits(0..4, access_type.get_bits(0..4));
        FieldFlags(flags)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ObjectType {
    Any,
    Uninitialized,
    Integer,
    String,
    Buffer,
    Package,
    FieldUnit,
    Device,
    Event,
    Method,
    Mutex,
    OpRegion,
    PowerResource,
    Processor,
    ThermalZone,
    BufferField,
    DdbHandle,
    Debug,
    Reference,
    LocalScope,
    LocalAlias,
    LocalMethodAlias,
    BankField,
    IndexField,
}

impl ObjectType {
    /// The value returned for an object of this type by the `ObjectType` operator.
    pub fn aml_type_code(&self) -> u64 {
        match self {
            ObjectType::Any | ObjectType::Uninitialized | ObjectType::LocalScope | ObjectType::Reference => 0,
            ObjectType::Integer => 1,
            ObjectType::String => 2,
            ObjectType::Buffer => 3,
            ObjectType::Package => 4,
            ObjectType::FieldUnit | ObjectType::BankField | ObjectType::IndexField => 5,
            ObjectType::Device => 6,
            ObjectType::Event => 7,
            ObjectType::Method | ObjectType::LocalMethodAlias => 8,
            ObjectType::Mutex => 9,
            ObjectType::OpRegion => 10,
            ObjectType::PowerResource => 11,
            ObjectType::Processor => 12,
            ObjectType::ThermalZone => 13,
            ObjectType::BufferField => 14,
            ObjectType::DdbHandle => 15,
            ObjectType::Debug => 16,
            ObjectType::LocalAlias => 0,
        }
    }

    /// Whether a `Scope` operator may open a node of this type.
    pub fn is_scope_opening(&self) -> bool {
        matches!(
            self,
            ObjectType::Any
                | ObjectType::Device
                | ObjectType::Processor
                | ObjectType::ThermalZone
                | ObjectType::PowerResource
                | ObjectType::LocalScope
        )
    }

    /// Local types are never found by searching parent scopes.
    pub fn is_local(&self) -> bool {
        matches!(self, ObjectType::LocalScope)
    }

    /// Whether evaluating a node of this type is meaningful.
    pub fn is_evaluable(&self) -> bool {
        !matches!(
            self,
            ObjectType::Any
                | ObjectType::Device
                | ObjectType::Event
                | ObjectType::Mutex
                | ObjectType::OpRegion
                | ObjectType::ThermalZone
                | ObjectType::LocalScope
        )
    }
}

/// Helper type for decoding the result of `_STA` objects.
pub struct DeviceStatus(pub u64);

impl DeviceStatus {
    pub fn present(&self) -> bool {
        self.0.get_bit(0)
    }

    pub fn enabled(&self) -> bool {
        self.0.get_bit(1)
    }

    pub fn show_in_ui(&self) -> bool {
        self.0.get_bit(2)
    }

    pub fn functioning(&self) -> bool {
        self.0.get_bit(3)
    }

    /// This flag is only used for Battery devices (PNP0C0A), and indicates if the battery is
    /// present.
    pub fn battery_present(&self) -> bool {
        self.0.get_bit(4)
    }
}

/// Copy `length` bits from `src` starting at bit `src_index` into `dst` starting at bit `dst_index`. Bits past
/// the end of `src` are read as zero. Fails if the destination range does not fit in `dst`.
pub(crate) fn copy_bits(
    src: &[u8],
    src_index: usize,
    dst: &mut [u8],
    dst_index: usize,
    length: usize,
) -> Result<(), AmlError> {
    let src_bits = src.view_bits::<Lsb0>();
    let dst_bits = dst.view_bits_mut::<Lsb0>();
    if dst_index.checked_add(length).map_or(true, |end| end > dst_bits.len()) {
        return Err(AmlError::IndexOutOfBounds);
    }

    let available = src_bits.len().saturating_sub(src_index).min(length);
    if available > 0 {
        dst_bits[dst_index..(dst_index + available)].copy_from_bitslice(&src_bits[src_index..(src_index + available)]);
    }
    dst_bits[(dst_index + available)..(dst_index + length)].fill(false);
    Ok(())
}

/// Read a buffer field out of `buffer`. Fields that fit in an integer of `allowed_bytes` produce an integer,
/// and wider fields produce a buffer.
pub(crate) fn read_buffer_field(
    buffer: &[u8],
    bit_index: usize,
    bit_length: usize,
    allowed_bytes: usize,
) -> Result<Object, AmlError> {
    if bit_index.checked_add(bit_length).map_or(true, |end| end > buffer.len() * 8) {
        return Err(AmlError::IndexOutOfBounds);
    }

    let mut bytes = alloc::vec![0u8; bit_length.div_ceil(8)];
    copy_bits(buffer, bit_index, &mut bytes, 0, bit_length)?;
    if bit_length <= allowed_bytes * 8 {
        let mut value = [0u8; 8];
        value[0..bytes.len()].copy_from_slice(&bytes);
        Ok(Object::Integer(u64::from_le_bytes(value)))
    } else {
        Ok(Object::Buffer(bytes))
    }
}

/// Write `value` into a buffer field, zero-extending or truncating it to the field's length.
pub(crate) fn write_buffer_field(
    buffer: &mut [u8],
    bit_index: usize,
    bit_length: usize,
    value: &[u8],
) -> Result<(), AmlError> {
    if bit_index.checked_add(bit_length).map_or(true, |end| end > buffer.len() * 8) {
        return Err(AmlError::IndexOutOfBounds);
    }
    copy_bits(value, 0, buffer, bit_index, bit_length)
}
