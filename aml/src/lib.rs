//! `acpi_aml` is an interpreter for AML (ACPI Machine Language), the bytecode firmware uses to describe the
//! devices on a platform and how to control them. It is designed to be used from a kernel: it is `no_std`, and
//! reaches the hardware (and the rest of the kernel) only through the [`Handler`] trait.
//!
//! The interpreter is used by creating an [`Interpreter`], loading the `DSDT` and `SSDT`s into it (either by
//! handing it the tables with [`Interpreter::load_table`], or asking it to find them through the handler with
//! [`Interpreter::initialize_tables`]), and then evaluating objects in the namespace:
//!
//! ```ignore
//! let interpreter = Interpreter::new(MyHandler);
//! interpreter.load_table(dsdt)?;
//! interpreter.initialize_devices()?;
//! let status = interpreter.evaluate(AmlName::from_str("\\_SB.PCI0._STA")?, vec![])?;
//! ```

#![no_std]

#[cfg(test)]
extern crate std;

extern crate alloc;

pub mod address_space;
pub mod config;
pub mod namespace;
pub mod object;
pub mod op_region;
pub mod osi;
pub mod owner;
pub mod tables;

mod context;
mod interpreter;
mod loader;
mod named;
mod opcode;
mod ops;
mod predefined;
mod store;
mod stream;

#[cfg(test)]
mod test_utils;
#[cfg(test)]
mod tests;

pub use config::Config;
pub use pci_types::PciAddress;

use alloc::{boxed::Box, sync::Arc, vec::Vec};
use context::{ContextKind, MethodContext, Pass};
use core::{
    str::FromStr,
    sync::atomic::{AtomicBool, Ordering},
};
use log::{error, info, trace, warn};
use namespace::{AmlName, InsertPolicy, Namespace, NodeFlags, NodeHandle};
use object::{Method, MethodCode, Object, ObjectType, WrappedObject};
use op_region::{DataTableHandler, PciConfigHandler, RegionSpace, SystemIoHandler, SystemMemoryHandler};
use osi::{osi_method, OsiHook, OsiInterfaces, WindowsVersion};
use owner::{OwnerId, OwnerIdAllocator};
use spinning_top::{RwSpinlock, Spinlock};
use tables::{Signature, TableList};

/// Methods can take at most this many arguments.
const MAX_ARGS: usize = 7;

pub struct Interpreter {
    handler: Box<dyn Handler>,
    config: Config,
    pub namespace: RwSpinlock<Namespace>,
    tables: Spinlock<TableList>,
    owner_ids: Spinlock<OwnerIdAllocator>,
    osi: Arc<OsiInterfaces>,
    /// Held while AML is being executed, so only one method runs at a time.
    pub(crate) interpreter_lock: Spinlock<()>,
    /// Set when the DSDT is older than revision 2.
    integers_32bit: AtomicBool,
}

impl Interpreter {
    pub fn new<H>(handler: H) -> Interpreter
    where
        H: Handler + 'static,
    {
        Interpreter::with_config(handler, Config::default())
    }

    pub fn with_config<H>(handler: H, config: Config) -> Interpreter
    where
        H: Handler + 'static,
    {
        let interpreter = Interpreter {
            handler: Box::new(handler),
            config,
            namespace: RwSpinlock::new(Namespace::new()),
            tables: Spinlock::new(TableList::new()),
            owner_ids: Spinlock::new(OwnerIdAllocator::new()),
            osi: Arc::new(OsiInterfaces::new()),
            interpreter_lock: Spinlock::new(()),
            integers_32bit: AtomicBool::new(false),
        };

        if let Err(err) = interpreter.add_predefined_objects() {
            error!("Failed to create predefined objects: {:?}", err);
        }
        interpreter
    }

    /// Create the objects that need the host (`\_GL_` and `\_OSI`), and install the default address space
    /// handlers at the root.
    fn add_predefined_objects(&self) -> Result<(), AmlError> {
        let root = self.namespace.read().root();
        {
            let mut namespace = self.namespace.write();
            let global_lock = namespace.create(
                root,
                &AmlName::from_str("\\_GL_")?,
                ObjectType::Mutex,
                OwnerId::NONE,
                InsertPolicy::ErrorIfFound,
                NodeFlags::new(),
            )?;
            namespace
                .attach_object(global_lock, Object::Mutex { mutex: self.handler.create_mutex(), sync_level: 0 }.wrap())?;

            let osi = self.osi.clone();
            let osi_node = namespace.create(
                root,
                &AmlName::from_str("\\_OSI")?,
                ObjectType::Method,
                OwnerId::NONE,
                InsertPolicy::ErrorIfFound,
                NodeFlags::new(),
            )?;
            namespace.attach_object(osi_node, Object::native_method(1, move |args| osi_method(&osi, args)).wrap())?;
        }

        self.install_handler_locked(root, RegionSpace::SystemMemory, Arc::new(SystemMemoryHandler), true)?;
        self.install_handler_locked(root, RegionSpace::SystemIO, Arc::new(SystemIoHandler), true)?;
        self.install_handler_locked(root, RegionSpace::PciConfig, Arc::new(PciConfigHandler), true)?;
        self.install_handler_locked(root, RegionSpace::DataTable, Arc::new(DataTableHandler), true)?;
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The width of integers, in bytes. This is 4 if the DSDT is older than revision 2, and 8 otherwise.
    pub fn integer_bytes(&self) -> usize {
        if self.integers_32bit.load(Ordering::Relaxed) {
            4
        } else {
            8
        }
    }

    /// Find the node at `path`, which is resolved from the root. Single-segment names are searched for using
    /// the usual search rules.
    pub fn lookup(&self, path: &AmlName) -> Result<NodeHandle, AmlError> {
        let namespace = self.namespace.read();
        namespace.lookup(namespace.root(), path, ObjectType::Any, true)
    }

    /// Evaluate the object at `path`. Methods are invoked with `args`, and other objects produce their current
    /// value (reading fields from the hardware). The results of predefined names are checked, and repaired if
    /// firmware got them slightly wrong.
    pub fn evaluate(&self, path: AmlName, args: Vec<WrappedObject>) -> Result<WrappedObject, AmlError> {
        let node = self.lookup(&path)?;
        self.evaluate_node(node, args)
    }

    /// Like [`Interpreter::evaluate`], but produces `None` if there is no object at `path`.
    pub fn evaluate_if_present(
        &self,
        path: AmlName,
        args: Vec<WrappedObject>,
    ) -> Result<Option<WrappedObject>, AmlError> {
        match self.lookup(&path) {
            Ok(node) => self.evaluate_node(node, args).map(Some),
            Err(AmlError::ObjectDoesNotExist(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn evaluate_node(&self, node: NodeHandle, args: Vec<WrappedObject>) -> Result<WrappedObject, AmlError> {
        let _lock = self.interpreter_lock.lock();
        let value = self.evaluate_node_locked(node, args)?.ok_or(AmlError::NoReturnValue)?;
        // Data objects can come straight out of the namespace; the caller gets its own copy.
        Ok(value.deep_copy())
    }

    /// Evaluate a node with the interpreter lock already held. Methods that don't return a value produce
    /// `None`.
    pub(crate) fn evaluate_node_locked(
        &self,
        node: NodeHandle,
        mut args: Vec<WrappedObject>,
    ) -> Result<Option<WrappedObject>, AmlError> {
        let (name, typ, object) = {
            let namespace = self.namespace.read();
            let entry = namespace.node(node)?;
            trace!("Evaluating {:?} ({:?})", namespace.full_path(node), entry.typ());
            (entry.name(), entry.typ(), entry.object().cloned())
        };

        if args.len() > MAX_ARGS {
            warn!("Evaluation of {} passed {} arguments; ignoring the extra ones", name.as_str(), args.len());
            args.truncate(MAX_ARGS);
        }
        if let Some(predefined) = predefined::lookup(name) {
            if predefined.arg_count != args.len() {
                warn!(
                    "{} expects {} arguments, but was passed {}",
                    name.as_str(),
                    predefined.arg_count,
                    args.len()
                );
            }
        }

        let value = match typ {
            ObjectType::LocalAlias | ObjectType::LocalMethodAlias => {
                let target = match object.as_ref().map(|object| object.snapshot()) {
                    Some(Object::Alias(target)) => target,
                    _ => return Err(AmlError::InvalidReference),
                };
                return self.evaluate_node_locked(target, args);
            }
            ObjectType::Method => {
                let method = match object.map(|object| object.snapshot()) {
                    Some(Object::Method(method)) => method,
                    Some(other) => {
                        return Err(AmlError::ObjectNotOfExpectedType { expected: ObjectType::Method, got: other.typ() });
                    }
                    None => return Err(AmlError::ObjectDoesNotExist(self.namespace.read().full_path(node)?)),
                };
                self.call_method(node, method, args)?
            }
            typ if !typ.is_evaluable() => return Err(AmlError::InvalidType(typ)),
            _ => Some(self.evaluate_node_value(node)?),
        };

        match value {
            Some(value) => Ok(Some(predefined::validate_and_repair(name, value, self.integer_bytes())?)),
            None => Ok(None),
        }
    }

    fn call_method(
        &self,
        node: NodeHandle,
        method: Method,
        args: Vec<WrappedObject>,
    ) -> Result<Option<WrappedObject>, AmlError> {
        let arg_count = method.flags.arg_count();
        if args.len() != arg_count {
            warn!("Method takes {} arguments, but was passed {}", arg_count, args.len());
        }

        match method.code {
            MethodCode::Native(ref native) => native(&args).map(Some),
            MethodCode::Aml(code) => {
                let owner = self.owner_ids.lock().allocate()?;
                let mut context = MethodContext::new(ContextKind::Method, Pass::Execute, code, node, owner);
                context.method = Some(node);
                context.sync_floor = method.flags.sync_level();
                for (slot, arg) in context.args.iter_mut().zip(args.into_iter().take(arg_count)) {
                    *slot = Some(arg);
                }
                self.run(context)
            }
        }
    }

    /// Evaluate the child of `scope` called `name`, if it exists.
    pub(crate) fn evaluate_child(&self, scope: NodeHandle, name: &str) -> Result<Option<WrappedObject>, AmlError> {
        let child = self.namespace.read().child(scope, namespace::NameSeg::from_str(name)?)?;
        match child {
            Some(child) => self.evaluate_node_locked(child, Vec::new()),
            None => Ok(None),
        }
    }

    /// Make an interface answer affirmatively to `_OSI`.
    pub fn install_interface(&self, name: &str) -> Result<(), AmlError> {
        self.osi.install(name)
    }

    pub fn remove_interface(&self, name: &str) -> Result<(), AmlError> {
        self.osi.remove(name)
    }

    /// Set a hook that is called with each `_OSI` query and the answer we would give, and which decides the
    /// final answer.
    pub fn set_osi_hook(&self, hook: Option<Box<OsiHook>>) {
        self.osi.set_hook(hook)
    }

    /// The latest version of Windows that firmware has asked about and been told is supported.
    pub fn latest_windows(&self) -> WindowsVersion {
        self.osi.latest_windows()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Operation {
    Mid,
    Concat,
    ConcatRes,
    Compare,
    Increment,
    Decrement,
    Store,
    CopyObject,
    Index,
    SizeOf,
    DerefOf,
    Match,
    ToBuffer,
    ToInteger,
    ToString,
    ToDecimalString,
    ToHexString,
    ReadField,
    WriteField,
}

#[derive(Clone, PartialEq, Debug)]
#[non_exhaustive]
pub enum AmlError {
    /*
     * Errors caused by the host passing bad parameters.
     */
    InvalidHandle,
    /// The handle refers to a node that has since been removed.
    StaleHandle,
    InvalidArgument,
    EmptyNamesAreInvalid,
    InvalidNameSeg([u8; 4]),
    InvalidNormalizedName(AmlName),
    RootHasNoParent,

    /*
     * Errors produced while parsing or executing AML.
     */
    RunOutOfStream,
    IllegalOpcode(u16),
    InvalidPkgLength,
    ObjectDoesNotExist(AmlName),
    NameCollision(AmlName),
    /// A `Scope` targeted a node of a type that can't have children.
    InvalidScopeTarget(AmlName),
    ObjectNotOfExpectedType {
        expected: ObjectType,
        got: ObjectType,
    },
    InvalidOperationOnObject {
        op: Operation,
        typ: ObjectType,
    },
    OperandStackOverflow,
    UnexpectedResult,
    NoCurrentOp,
    /// A method that should have produced a value didn't return one.
    NoReturnValue,
    UninitializedLocal(u8),
    UninitializedArg(u8),
    InvalidReference,
    DivideByZero,
    AlignmentViolation,
    IndexOutOfBounds,
    InvalidFieldFlags,
    FieldInvalidAccessSize,
    FieldInvalidAddress,
    RegionOutOfBounds,
    NoHandlerForRegion(RegionSpace),
    MethodArgCountIncorrect,
    MethodDepthExceeded,
    LoopLimitExceeded,
    BreakOutsideLoop,
    ContinueOutsideLoop,
    ReturnOutsideMethod,
    MutexSyncLevelViolation,
    MutexNotAcquired,
    /// Produced by the `Fatal` op.
    Fatal {
        typ: u8,
        code: u32,
        arg: u64,
    },
    /// The object referred to has been removed from the namespace.
    NotExist,
    /// Objects of this type can't be evaluated.
    InvalidType(ObjectType),

    /*
     * Errors with the tables handed to us.
     */
    TableInvalidChecksum(Signature),
    TableTruncated,
    TableInvalidSignature,
    TableUnsupportedRevision,
    TableNotFound(Signature),
    TableAlreadyLoaded,
    TableNotLoaded,
    CannotUnloadDsdt,
    HardwareReducedRequired,

    /*
     * Running out of (or misusing) resources.
     */
    OwnerIdExhausted,
    OwnerIdNotAllocated(u16),
    MutexTimeout,
    HandlerAlreadyExists,
    SameHandler,
    HandlerNotFound,
}

/// A mutex or event created by the host.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Handle(pub u32);

/// This trait represents the interface from the `Interpreter` to the hosting kernel, and allows AML to interact
/// with the underlying hardware.
pub trait Handler: Send + Sync {
    /*
     * Memory accesses are made to virtual addresses produced by `map_physical_region`.
     */
    fn read_u8(&self, address: usize) -> u8;
    fn read_u16(&self, address: usize) -> u16;
    fn read_u32(&self, address: usize) -> u32;
    fn read_u64(&self, address: usize) -> u64;

    fn write_u8(&self, address: usize, value: u8);
    fn write_u16(&self, address: usize, value: u16);
    fn write_u32(&self, address: usize, value: u32);
    fn write_u64(&self, address: usize, value: u64);

    fn read_io_u8(&self, port: u16) -> u8;
    fn read_io_u16(&self, port: u16) -> u16;
    fn read_io_u32(&self, port: u16) -> u32;

    fn write_io_u8(&self, port: u16, value: u8);
    fn write_io_u16(&self, port: u16, value: u16);
    fn write_io_u32(&self, port: u16, value: u32);

    fn read_pci_u8(&self, address: PciAddress, offset: u16) -> u8;
    fn read_pci_u16(&self, address: PciAddress, offset: u16) -> u16;
    fn read_pci_u32(&self, address: PciAddress, offset: u16) -> u32;

    fn write_pci_u8(&self, address: PciAddress, offset: u16, value: u8);
    fn write_pci_u16(&self, address: PciAddress, offset: u16, value: u16);
    fn write_pci_u32(&self, address: PciAddress, offset: u16, value: u32);

    /// Returns a monotonically-increasing value of nanoseconds.
    fn nanos_since_boot(&self) -> u64;

    /// Stall for at least the given number of **microseconds**. An implementation should not relinquish control of
    /// the processor during the stall, and for this reason, firmwares should not stall for periods of more than
    /// 100 microseconds.
    fn stall(&self, microseconds: u64);

    /// Sleep for at least the given number of **milliseconds**. An implementation may round to the closest sleep
    /// time supported, and should relinquish the processor.
    fn sleep(&self, milliseconds: u64);

    fn create_mutex(&self) -> Handle;

    /// Acquire the mutex, waiting at most `timeout` milliseconds. A timeout of `0xffff` waits forever. If the
    /// mutex could not be acquired in time, this should return [`AmlError::MutexTimeout`].
    fn acquire(&self, mutex: Handle, timeout: u16) -> Result<(), AmlError>;
    fn release(&self, mutex: Handle);

    fn create_event(&self) -> Handle;

    /// Wait for the event to be signalled, for at most `timeout` milliseconds. A timeout should be reported as
    /// [`AmlError::MutexTimeout`].
    fn wait_event(&self, event: Handle, timeout: u16) -> Result<(), AmlError>;
    fn signal_event(&self, event: Handle);
    fn reset_event(&self, event: Handle);

    /// Map a region of physical memory, returning the virtual address it can be accessed at. The default
    /// implementation assumes physical memory is identity-mapped.
    fn map_physical_region(&self, physical_address: u64, _length: usize) -> usize {
        physical_address as usize
    }

    fn unmap_physical_region(&self, _virtual_address: usize, _length: usize) {}

    fn read_physical(&self, physical_address: u64, length: usize) -> Vec<u8> {
        let virtual_address = self.map_physical_region(physical_address, length);
        let bytes = (0..length).map(|offset| self.read_u8(virtual_address + offset)).collect();
        self.unmap_physical_region(virtual_address, length);
        bytes
    }

    /// Find the physical address of the `instance`th table with the given signature, from the RSDT or XSDT.
    fn find_table(&self, _signature: Signature, _instance: usize, _prefer_rsdt: bool) -> Option<u64> {
        None
    }

    /// Called when AML uses `Notify` on a device.
    fn notify(&self, path: &AmlName, value: u64) {
        info!("Notify({}, {:#x}) ignored by host", path, value);
    }

    /// Called by the `Breakpoint` op.
    fn breakpoint(&self) {}

    fn handle_fatal_error(&self, fatal_type: u8, fatal_code: u32, fatal_arg: u64) {
        error!(
            "Fatal error while executing AML (encountered DefFatalOp). fatal_type = {:?}, fatal_code = {:?}, fatal_arg = {:?}",
            fatal_type, fatal_code, fatal_arg
        );
    }
}
