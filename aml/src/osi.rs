use crate::{
    object::{Object, WrappedObject},
    AmlError,
};
use alloc::{borrow::ToOwned, boxed::Box, string::String, vec::Vec};
use log::{trace, warn};
use spinning_top::Spinlock;

/// The versions of Windows that firmware can ask about with `_OSI`, in the order they were released. The
/// latest one answered affirmatively is recorded, as firmware often enables features based on it.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum WindowsVersion {
    None,
    Windows2000,
    WindowsXp,
    WindowsXpSp1,
    WindowsServer2003,
    WindowsXpSp2,
    WindowsServer2003Sp1,
    WindowsVista,
    WindowsServer2008,
    WindowsVistaSp1,
    WindowsVistaSp2,
    Windows7,
    Windows8,
    Windows8_1,
    Windows10,
    Windows10Rs1,
    Windows10Rs2,
    Windows10Rs3,
    Windows10Rs4,
    Windows10Rs5,
    Windows10_19H1,
    Windows10_20H1,
    Windows11,
    Windows11_22H2,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OsiKind {
    Windows(WindowsVersion),
    Feature,
    /// Installed by the host at runtime.
    Host,
}

#[derive(Clone, Debug)]
pub struct OsiInterface {
    pub name: String,
    pub kind: OsiKind,
    pub enabled: bool,
}

const DEFAULT_INTERFACES: &[(&str, OsiKind, bool)] = &[
    ("Windows 2000", OsiKind::Windows(WindowsVersion::Windows2000), true),
    ("Windows 2001", OsiKind::Windows(WindowsVersion::WindowsXp), true),
    ("Windows 2001 SP1", OsiKind::Windows(WindowsVersion::WindowsXpSp1), true),
    ("Windows 2001.1", OsiKind::Windows(WindowsVersion::WindowsServer2003), true),
    ("Windows 2001 SP2", OsiKind::Windows(WindowsVersion::WindowsXpSp2), true),
    ("Windows 2001.1 SP1", OsiKind::Windows(WindowsVersion::WindowsServer2003Sp1), true),
    ("Windows 2006", OsiKind::Windows(WindowsVersion::WindowsVista), true),
    ("Windows 2006.1", OsiKind::Windows(WindowsVersion::WindowsServer2008), true),
    ("Windows 2006 SP1", OsiKind::Windows(WindowsVersion::WindowsVistaSp1), true),
    ("Windows 2006 SP2", OsiKind::Windows(WindowsVersion::WindowsVistaSp2), true),
    ("Windows 2009", OsiKind::Windows(WindowsVersion::Windows7), true),
    ("Windows 2012", OsiKind::Windows(WindowsVersion::Windows8), true),
    ("Windows 2013", OsiKind::Windows(WindowsVersion::Windows8_1), true),
    ("Windows 2015", OsiKind::Windows(WindowsVersion::Windows10), true),
    ("Windows 2016", OsiKind::Windows(WindowsVersion::Windows10Rs1), true),
    ("Windows 2017", OsiKind::Windows(WindowsVersion::Windows10Rs2), true),
    ("Windows 2017.2", OsiKind::Windows(WindowsVersion::Windows10Rs3), true),
    ("Windows 2018", OsiKind::Windows(WindowsVersion::Windows10Rs4), true),
    ("Windows 2018.2", OsiKind::Windows(WindowsVersion::Windows10Rs5), true),
    ("Windows 2019", OsiKind::Windows(WindowsVersion::Windows10_19H1), true),
    ("Windows 2020", OsiKind::Windows(WindowsVersion::Windows10_20H1), true),
    ("Windows 2021", OsiKind::Windows(WindowsVersion::Windows11), true),
    ("Windows 2022", OsiKind::Windows(WindowsVersion::Windows11_22H2), true),
    ("Extended Address Space Descriptor", OsiKind::Feature, true),
    // These are only answered affirmatively if the host enables them
    ("Module Device", OsiKind::Feature, false),
    ("Processor Device", OsiKind::Feature, false),
    ("3.0 Thermal Model", OsiKind::Feature, false),
    ("3.0 _SCP Extensions", OsiKind::Feature, false),
    ("Processor Aggregator Device", OsiKind::Feature, false),
];

/// Strings that firmware uses to detect non-Windows operating systems. Answering them affirmatively tends to
/// send firmware down poorly-tested paths.
const QUIRK_STRINGS: &[&str] = &["Linux", "Darwin"];

/// A hook that can override the answer to an `_OSI` query. It is passed the queried string and the answer the
/// interface list gave, and returns the answer to give to the firmware.
pub type OsiHook = dyn Fn(&str, bool) -> bool + Send + Sync;

pub struct OsiInterfaces {
    interfaces: Spinlock<Vec<OsiInterface>>,
    hook: Spinlock<Option<Box<OsiHook>>>,
    latest_windows: Spinlock<WindowsVersion>,
}

impl OsiInterfaces {
    pub fn new() -> OsiInterfaces {
        let interfaces = DEFAULT_INTERFACES
            .iter()
            .map(|&(name, kind, enabled)| OsiInterface { name: name.to_owned(), kind, enabled })
            .collect();
        OsiInterfaces {
            interfaces: Spinlock::new(interfaces),
            hook: Spinlock::new(None),
            latest_windows: Spinlock::new(WindowsVersion::None),
        }
    }

    /// Answer an `_OSI` query.
    pub fn query(&self, name: &str) -> bool {
        let (supported, kind) = {
            let interfaces = self.interfaces.lock();
            match interfaces.iter().find(|interface| interface.name == name) {
                Some(interface) => (interface.enabled, Some(interface.kind)),
                None => (false, None),
            }
        };

        if QUIRK_STRINGS.contains(&name) && !supported {
            warn!("Firmware queried _OSI(\"{}\"): answering false", name);
        }

        let answer = match &*self.hook.lock() {
            Some(hook) => hook(name, supported),
            None => supported,
        };

        if answer {
            if let Some(OsiKind::Windows(version)) = kind {
                let mut latest = self.latest_windows.lock();
                if version > *latest {
                    *latest = version;
                }
            }
        }

        trace!("_OSI(\"{}\") = {}", name, answer);
        answer
    }

    /// Add an interface to the list answered affirmatively, or enable one of the known optional features.
    pub fn install(&self, name: &str) -> Result<(), AmlError> {
        if name.is_empty() {
            return Err(AmlError::InvalidArgument);
        }

        let mut interfaces = self.interfaces.lock();
        match interfaces.iter_mut().find(|interface| interface.name == name) {
            Some(interface) if interface.enabled => Err(AmlError::InvalidArgument),
            Some(interface) => {
                interface.enabled = true;
                Ok(())
            }
            None => {
                interfaces.push(OsiInterface { name: name.to_owned(), kind: OsiKind::Host, enabled: true });
                Ok(())
            }
        }
    }

    /// Stop answering `name` affirmatively. Built-in interfaces are disabled rather than removed, so they can be
    /// re-enabled later.
    pub fn remove(&self, name: &str) -> Result<(), AmlError> {
        let mut interfaces = self.interfaces.lock();
        let index = interfaces
            .iter()
            .position(|interface| interface.name == name && interface.enabled)
            .ok_or(AmlError::NotExist)?;

        if interfaces[index].kind == OsiKind::Host {
            interfaces.remove(index);
        } else {
            interfaces[index].enabled = false;
        }
        Ok(())
    }

    pub fn set_hook(&self, hook: Option<Box<OsiHook>>) {
        *self.hook.lock() = hook;
    }

    pub fn latest_windows(&self) -> WindowsVersion {
        *self.latest_windows.lock()
    }

    pub fn interfaces(&self) -> Vec<OsiInterface> {
        self.interfaces.lock().clone()
    }
}

impl Default for OsiInterfaces {
    fn default() -> Self {
        OsiInterfaces::new()
    }
}

/// The body of the `\_OSI` native method.
pub(crate) fn osi_method(interfaces: &OsiInterfaces, args: &[WrappedObject]) -> Result<WrappedObject, AmlError> {
    let arg = args.first().ok_or(AmlError::MethodArgCountIncorrect)?;
    let answer = match &*arg.lock() {
        Object::String(name) => interfaces.query(name),
        other => return Err(AmlError::ObjectNotOfExpectedType { expected: crate::object::ObjectType::String, got: other.typ() }),
    };
    Ok(Object::Integer(if answer { u64::MAX } else { 0 }).wrap())
}
