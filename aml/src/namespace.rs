use crate::{
    address_space::AddressSpaceHandler,
    object::{Object, ObjectType, WrappedObject},
    owner::OwnerId,
    AmlError,
};
use alloc::{
    string::{String, ToString},
    sync::Arc,
    vec,
    vec::Vec,
};
use bit_field::BitField;
use core::{fmt, str, str::FromStr};
use log::{trace, warn};

const ROOT_INDEX: u32 = 0;

/// Refers to a node in the [`Namespace`] arena. A handle carries the unique id of the node it was created for, so
/// a handle to a node that has since been removed is detected (`AmlError::StaleHandle`) even if its slot in the
/// arena has been reused.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct NodeHandle {
    index: u32,
    unique_id: u64,
}

impl NodeHandle {
    pub fn unique_id(&self) -> u64 {
        self.unique_id
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct NodeFlags(u8);

impl NodeFlags {
    pub fn new() -> NodeFlags {
        NodeFlags(0)
    }

    pub fn external() -> NodeFlags {
        let mut flags = NodeFlags(0);
        flags.set_external(true);
        flags
    }

    pub fn temporary() -> NodeFlags {
        let mut flags = NodeFlags(0);
        flags.set_temporary(true);
        flags
    }

    /// The node was created by an `External` declaration and has not (yet) been defined.
    pub fn is_external(&self) -> bool {
        self.0.get_bit(0)
    }

    pub fn set_external(&mut self, value: bool) {
        self.0.set_bit(0, value);
    }

    /// The node was created by a running control method, and will be removed when it returns.
    pub fn is_temporary(&self) -> bool {
        self.0.get_bit(1)
    }

    pub fn set_temporary(&mut self, value: bool) {
        self.0.set_bit(1, value);
    }

    /// The node was a data object that was later opened by a `Scope`, and has been retyped to `Any`.
    pub fn is_scope_retyped(&self) -> bool {
        self.0.get_bit(2)
    }

    pub fn set_scope_retyped(&mut self, value: bool) {
        self.0.set_bit(2, value);
    }

    /// The node was created by the first pass over a table that is still being loaded. The second pass adopts
    /// it instead of reporting a collision.
    pub fn is_pending(&self) -> bool {
        self.0.get_bit(3)
    }

    pub fn set_pending(&mut self, value: bool) {
        self.0.set_bit(3, value);
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InsertPolicy {
    ErrorIfFound,
    OpenIfFound,
    /// Replace the existing node's object and type, and remove its children.
    OverrideIfFound,
}

pub struct Node {
    name: NameSeg,
    typ: ObjectType,
    flags: NodeFlags,
    owner: OwnerId,
    unique_id: u64,
    parent: Option<u32>,
    first_child: Option<u32>,
    next_sibling: Option<u32>,
    object: Option<WrappedObject>,
    pub(crate) handlers: Vec<Arc<AddressSpaceHandler>>,
}

impl Node {
    pub fn name(&self) -> NameSeg {
        self.name
    }

    pub fn typ(&self) -> ObjectType {
        self.typ
    }

    pub fn flags(&self) -> NodeFlags {
        self.flags
    }

    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    pub fn unique_id(&self) -> u64 {
        self.unique_id
    }

    pub fn object(&self) -> Option<&WrappedObject> {
        self.object.as_ref()
    }

    pub fn handlers(&self) -> &[Arc<AddressSpaceHandler>] {
        &self.handlers
    }
}

/// The ACPI namespace. Nodes live in an arena and are linked into a tree by index; children are kept in
/// declaration order and searched linearly.
pub struct Namespace {
    nodes: Vec<Option<Node>>,
    free: Vec<u32>,
    next_unique_id: u64,
}

impl Namespace {
    /// Create a new namespace, with the root node and the pre-defined scopes and objects that do not depend on
    /// the host.
    pub fn new() -> Namespace {
        let root = Node {
            name: NameSeg(*b"____"),
            typ: ObjectType::Device,
            flags: NodeFlags::new(),
            owner: OwnerId::NONE,
            unique_id: 0,
            parent: None,
            first_child: None,
            next_sibling: None,
            object: Some(Object::Device.wrap()),
            handlers: Vec::new(),
        };
        let mut namespace = Namespace { nodes: vec![Some(root)], free: Vec::new(), next_unique_id: 1 };

        const PREDEFINED_SCOPES: [(&[u8; 4], ObjectType); 5] = [
            (b"_GPE", ObjectType::LocalScope),
            (b"_PR_", ObjectType::LocalScope),
            (b"_SB_", ObjectType::Device),
            (b"_SI_", ObjectType::LocalScope),
            (b"_TZ_", ObjectType::Device),
        ];
        for (name, typ) in PREDEFINED_SCOPES {
            let handle = namespace.insert_child(ROOT_INDEX, NameSeg(*name), typ, OwnerId::NONE, NodeFlags::new());
            if typ == ObjectType::Device {
                namespace.set_object(handle.index, Object::Device.wrap());
            }
        }

        /*
         * `\_OS` predates `\_OSI`, and was used by firmware to work out which OS was running. We follow the NT
         * interpreter in calling ourselves `Microsoft Windows NT`.
         */
        let os = namespace.insert_child(ROOT_INDEX, NameSeg(*b"_OS_"), ObjectType::String, OwnerId::NONE, NodeFlags::new());
        namespace.set_object(os.index, Object::String("Microsoft Windows NT".to_string()).wrap());

        /*
         * `\_REV` was abused by firmware to detect Linux, so (like Linux and Windows) we always report `2`
         * regardless of the revision of the specification we support.
         */
        let rev = namespace.insert_child(ROOT_INDEX, NameSeg(*b"_REV"), ObjectType::Integer, OwnerId::NONE, NodeFlags::new());
        namespace.set_object(rev.index, Object::Integer(2).wrap());

        namespace
    }

    pub fn root(&self) -> NodeHandle {
        NodeHandle { index: ROOT_INDEX, unique_id: 0 }
    }

    pub fn node(&self, handle: NodeHandle) -> Result<&Node, AmlError> {
        match self.nodes.get(handle.index as usize) {
            Some(Some(node)) if node.unique_id == handle.unique_id => Ok(node),
            Some(_) => Err(AmlError::StaleHandle),
            None => Err(AmlError::InvalidHandle),
        }
    }

    fn node_mut(&mut self, handle: NodeHandle) -> Result<&mut Node, AmlError> {
        match self.nodes.get_mut(handle.index as usize) {
            Some(Some(node)) if node.unique_id == handle.unique_id => Ok(node),
            Some(_) => Err(AmlError::StaleHandle),
            None => Err(AmlError::InvalidHandle),
        }
    }

    pub(crate) fn node_handlers_mut(&mut self, handle: NodeHandle) -> Result<&mut Vec<Arc<AddressSpaceHandler>>, AmlError> {
        Ok(&mut self.node_mut(handle)?.handlers)
    }

    fn live(&self, index: u32) -> Option<&Node> {
        self.nodes.get(index as usize).and_then(|node| node.as_ref())
    }

    fn live_mut(&mut self, index: u32) -> Option<&mut Node> {
        self.nodes.get_mut(index as usize).and_then(|node| node.as_mut())
    }

    fn handle_for(&self, index: u32) -> Option<NodeHandle> {
        self.live(index).map(|node| NodeHandle { index, unique_id: node.unique_id })
    }

    pub fn is_valid(&self, handle: NodeHandle) -> bool {
        self.node(handle).is_ok()
    }

    pub fn typ(&self, handle: NodeHandle) -> Result<ObjectType, AmlError> {
        Ok(self.node(handle)?.typ)
    }

    pub fn object(&self, handle: NodeHandle) -> Result<Option<WrappedObject>, AmlError> {
        Ok(self.node(handle)?.object.clone())
    }

    pub fn parent(&self, handle: NodeHandle) -> Result<Option<NodeHandle>, AmlError> {
        Ok(self.node(handle)?.parent.and_then(|parent| self.handle_for(parent)))
    }

    pub fn children(&self, handle: NodeHandle) -> Result<Vec<NodeHandle>, AmlError> {
        let mut children = Vec::new();
        let mut next = self.node(handle)?.first_child;
        while let Some(index) = next {
            let Some(child) = self.live(index) else { break };
            children.push(NodeHandle { index, unique_id: child.unique_id });
            next = child.next_sibling;
        }
        Ok(children)
    }

    /// Find a direct child of `parent` by name, without applying any search rules.
    pub fn child(&self, parent: NodeHandle, name: NameSeg) -> Result<Option<NodeHandle>, AmlError> {
        self.node(parent)?;
        Ok(self.find_child(parent.index, name.repaired().0).and_then(|index| self.handle_for(index)))
    }

    fn find_child(&self, parent: u32, name: NameSeg) -> Option<u32> {
        let mut next = self.live(parent)?.first_child;
        while let Some(index) = next {
            let child = self.live(index)?;
            if child.name == name {
                return Some(index);
            }
            next = child.next_sibling;
        }
        None
    }

    fn insert_child(&mut self, parent: u32, name: NameSeg, typ: ObjectType, owner: OwnerId, flags: NodeFlags) -> NodeHandle {
        let unique_id = self.next_unique_id;
        self.next_unique_id += 1;

        let node = Node {
            name,
            typ,
            flags,
            owner,
            unique_id,
            parent: Some(parent),
            first_child: None,
            next_sibling: None,
            object: None,
            handlers: Vec::new(),
        };
        let index = match self.free.pop() {
            Some(index) => {
                self.nodes[index as usize] = Some(node);
                index
            }
            None => {
                self.nodes.push(Some(node));
                (self.nodes.len() - 1) as u32
            }
        };

        // Append, so that children stay in declaration order
        let mut last = None;
        let mut next = self.live(parent).and_then(|parent| parent.first_child);
        while let Some(sibling) = next {
            last = Some(sibling);
            next = self.live(sibling).and_then(|sibling| sibling.next_sibling);
        }
        match last {
            Some(last) => {
                if let Some(last) = self.live_mut(last) {
                    last.next_sibling = Some(index);
                }
            }
            None => {
                if let Some(parent) = self.live_mut(parent) {
                    parent.first_child = Some(index);
                }
            }
        }

        trace!("Created namespace node {} of type {:?} (owner {:?})", name.as_str(), typ, owner);
        NodeHandle { index, unique_id }
    }

    fn set_object(&mut self, index: u32, object: WrappedObject) {
        if let Some(node) = self.live_mut(index) {
            node.object = Some(object);
        }
    }

    /// Resolve the prefix of `name` relative to `scope`, returning the node the name's segments start from, and
    /// the segments themselves.
    fn resolve_prefix(&self, scope: u32, name: &AmlName) -> Result<(u32, Vec<NameSeg>), AmlError> {
        let mut current = scope;
        let mut segments = Vec::new();

        for component in name.components() {
            match component {
                NameComponent::Root => {
                    current = ROOT_INDEX;
                    segments.clear();
                }
                NameComponent::Prefix => {
                    if segments.pop().is_none() {
                        current = self.live(current).and_then(|node| node.parent).ok_or(AmlError::RootHasNoParent)?;
                    }
                }
                NameComponent::Segment(seg) => segments.push(seg.repaired().0),
            }
        }

        Ok((current, segments))
    }

    fn describe(&self, scope: NodeHandle, name: &AmlName) -> AmlName {
        self.full_path(scope).and_then(|scope| name.resolve(&scope)).unwrap_or_else(|_| name.clone())
    }

    /// Find the node referred to by `name`, relative to `scope`. If `search_parent` is set, and the name is a
    /// single segment with no prefix, the ACPI search rules apply: if the name is not found in `scope`, each
    /// parent scope is searched in turn up to the root. A node whose type does not match `expected` is still
    /// returned, as real firmware often gets this wrong.
    pub fn lookup(
        &self,
        scope: NodeHandle,
        name: &AmlName,
        expected: ObjectType,
        search_parent: bool,
    ) -> Result<NodeHandle, AmlError> {
        self.node(scope)?;
        let (start, segments) = self.resolve_prefix(scope.index, name)?;

        if segments.is_empty() {
            return self.handle_for(start).ok_or(AmlError::StaleHandle);
        }

        let found = if search_parent && name.search_rules_apply() && !expected.is_local() {
            let mut level = Some(start);
            let mut found = None;
            while let Some(current) = level {
                if let Some(child) = self.find_child(current, segments[0]) {
                    found = Some(child);
                    break;
                }
                level = self.live(current).and_then(|node| node.parent);
            }
            found
        } else {
            segments.iter().try_fold(start, |current, &seg| self.find_child(current, seg))
        };

        let Some(mut index) = found else {
            return Err(AmlError::ObjectDoesNotExist(self.describe(scope, name)));
        };

        // Chase aliases (only a single level, as aliases to aliases are not allowed)
        if let Some(node) = self.live(index) {
            if matches!(node.typ, ObjectType::LocalAlias | ObjectType::LocalMethodAlias) {
                if let Some(object) = &node.object {
                    if let Object::Alias(target) = *object.lock() {
                        if self.node(target).is_err() {
                            return Err(AmlError::NotExist);
                        }
                        index = target.index;
                    }
                }
            }
        }

        let node = self.live(index).ok_or(AmlError::NotExist)?;
        if expected != ObjectType::Any && node.typ != ObjectType::Any && node.typ != expected {
            warn!(
                "Found {} while looking for an object of type {:?}, but it has type {:?}",
                self.describe(scope, name),
                expected,
                node.typ
            );
        }

        Ok(NodeHandle { index, unique_id: node.unique_id })
    }

    /// Create a node at `name`, relative to `scope`. Every segment but the last must already exist. What happens
    /// if the final node already exists is decided by `policy`, except that a node created by an `External`
    /// declaration is always silently upgraded to the real definition.
    pub fn create(
        &mut self,
        scope: NodeHandle,
        name: &AmlName,
        typ: ObjectType,
        owner: OwnerId,
        policy: InsertPolicy,
        flags: NodeFlags,
    ) -> Result<NodeHandle, AmlError> {
        self.node(scope)?;
        let (start, segments) = self.resolve_prefix(scope.index, name)?;
        let Some((&last, intermediate)) = segments.split_last() else {
            return Err(AmlError::EmptyNamesAreInvalid);
        };

        let mut parent = start;
        for (i, &seg) in intermediate.iter().enumerate() {
            parent = match self.find_child(parent, seg) {
                Some(child) => child,
                None => {
                    let partial = AmlName::from_components(
                        segments[..=i].iter().map(|&seg| NameComponent::Segment(seg)).collect(),
                    );
                    let path = self.handle_for(start).map(|start| self.describe(start, &partial)).unwrap_or(partial);
                    return Err(AmlError::ObjectDoesNotExist(path));
                }
            };
        }

        let last = match name.last_segment() {
            Some(original) if original.repaired().1 => {
                warn!("Repaired invalid name segment {:?} to {:?}", original, last);
                last
            }
            _ => last,
        };

        let Some(existing) = self.find_child(parent, last) else {
            return Ok(self.insert_child(parent, last, typ, owner, flags));
        };
        let path = self.handle_for(existing).map(|handle| self.describe(handle, &AmlName::null()));

        let node = self.live_mut(existing).ok_or(AmlError::NotExist)?;
        let handle = NodeHandle { index: existing, unique_id: node.unique_id };

        if flags.is_external() {
            return Ok(handle);
        }
        if node.flags.is_pending() && node.owner == owner && !flags.is_pending() {
            node.flags.set_pending(false);
            node.typ = typ;
            return Ok(handle);
        }
        if node.flags.is_external() {
            trace!("Upgrading external declaration of {} to a real definition", node.name.as_str());
            node.flags.set_external(false);
            node.typ = typ;
            node.owner = owner;
            return Ok(handle);
        }

        match policy {
            InsertPolicy::ErrorIfFound => Err(AmlError::NameCollision(path.unwrap_or_else(|| name.clone()))),
            InsertPolicy::OpenIfFound => Ok(handle),
            InsertPolicy::OverrideIfFound => {
                warn!("Overriding existing namespace node {}", path.unwrap_or_else(|| name.clone()));
                node.typ = typ;
                node.owner = owner;
                node.flags = flags;
                node.object = None;
                let children = self.children(handle)?;
                for child in children {
                    self.remove(child)?;
                }
                Ok(handle)
            }
        }
    }

    /// Attach an object to a node. The node takes the type of the object, unless it was declared as a more
    /// specific kind of node, or has been retyped by a `Scope`.
    pub fn attach_object(&mut self, handle: NodeHandle, object: WrappedObject) -> Result<(), AmlError> {
        let object_type = object.lock().typ();
        let node = self.node_mut(handle)?;
        let keep_type = node.flags.is_scope_retyped()
            || matches!(
                node.typ,
                ObjectType::BankField | ObjectType::IndexField | ObjectType::LocalAlias | ObjectType::LocalMethodAlias
            );
        if !keep_type {
            node.typ = object_type;
        }
        node.object = Some(object);
        Ok(())
    }

    pub fn detach_object(&mut self, handle: NodeHandle) -> Result<Option<WrappedObject>, AmlError> {
        Ok(self.node_mut(handle)?.object.take())
    }

    pub fn set_type(&mut self, handle: NodeHandle, typ: ObjectType) -> Result<(), AmlError> {
        self.node_mut(handle)?.typ = typ;
        Ok(())
    }

    pub fn set_flags(&mut self, handle: NodeHandle, flags: NodeFlags) -> Result<(), AmlError> {
        self.node_mut(handle)?.flags = flags;
        Ok(())
    }

    /// Remove a node and its entire subtree. Returns the objects that were attached to the removed nodes, so the
    /// caller can tear down anything that depends on them (e.g. operation regions).
    pub fn remove(&mut self, handle: NodeHandle) -> Result<Vec<WrappedObject>, AmlError> {
        if handle.index == ROOT_INDEX {
            return Err(AmlError::InvalidArgument);
        }
        let parent = self.node(handle)?.parent;

        // Unlink from the parent's child list
        if let Some(parent) = parent {
            let next_sibling = self.live(handle.index).and_then(|node| node.next_sibling);
            let first = self.live(parent).and_then(|parent| parent.first_child);
            if first == Some(handle.index) {
                if let Some(parent) = self.live_mut(parent) {
                    parent.first_child = next_sibling;
                }
            } else {
                let mut cursor = first;
                while let Some(index) = cursor {
                    let next = self.live(index).and_then(|node| node.next_sibling);
                    if next == Some(handle.index) {
                        if let Some(node) = self.live_mut(index) {
                            node.next_sibling = next_sibling;
                        }
                        break;
                    }
                    cursor = next;
                }
            }
        }

        let mut removed = Vec::new();
        let mut stack = vec![handle.index];
        while let Some(index) = stack.pop() {
            let Some(node) = self.nodes.get_mut(index as usize).and_then(|node| node.take()) else { continue };
            let mut child = node.first_child;
            while let Some(child_index) = child {
                stack.push(child_index);
                child = self.live(child_index).and_then(|child| child.next_sibling);
            }
            if let Some(object) = node.object {
                removed.push(object);
            }
            self.free.push(index);
        }

        Ok(removed)
    }

    /// Remove every node created by `owner`, along with its subtree.
    pub fn remove_by_owner(&mut self, owner: OwnerId) -> Vec<WrappedObject> {
        let mut targets = Vec::new();
        let mut stack = vec![ROOT_INDEX];
        while let Some(index) = stack.pop() {
            let Some(node) = self.live(index) else { continue };
            if index != ROOT_INDEX && node.owner == owner {
                targets.push(NodeHandle { index, unique_id: node.unique_id });
                continue;
            }
            let mut child = node.first_child;
            while let Some(child_index) = child {
                stack.push(child_index);
                child = self.live(child_index).and_then(|child| child.next_sibling);
            }
        }

        let mut removed = Vec::new();
        for target in targets {
            if let Ok(objects) = self.remove(target) {
                removed.extend(objects);
            }
        }
        removed
    }

    /// Clear the pending flag on every node created by the first pass of `owner`'s table.
    pub(crate) fn clear_pending(&mut self, owner: OwnerId) {
        for node in self.nodes.iter_mut().flatten() {
            if node.owner == owner {
                node.flags.set_pending(false);
            }
        }
    }

    pub fn full_path(&self, handle: NodeHandle) -> Result<AmlName, AmlError> {
        let mut segments = Vec::new();
        let mut current = self.node(handle)?;
        while let Some(parent) = current.parent {
            segments.push(NameComponent::Segment(current.name));
            current = self.live(parent).ok_or(AmlError::StaleHandle)?;
        }

        let mut components = vec![NameComponent::Root];
        components.extend(segments.into_iter().rev());
        Ok(AmlName(components))
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.iter().filter(|node| node.is_some()).count()
    }

    /// Traverse the namespace depth-first in declaration order, calling `f` on each node. `f` returns whether the
    /// children of the node should also be visited. Temporary nodes are hidden.
    pub fn traverse<F>(&self, f: F) -> Result<(), AmlError>
    where
        F: FnMut(NodeHandle, &Node) -> Result<bool, AmlError>,
    {
        self.walk_children(self.root(), false, f)
    }

    /// Traverse the subtree under `start` (including `start` itself).
    pub fn walk_children<F>(&self, start: NodeHandle, include_temporary: bool, mut f: F) -> Result<(), AmlError>
    where
        F: FnMut(NodeHandle, &Node) -> Result<bool, AmlError>,
    {
        self.node(start)?;
        let mut stack = vec![start.index];
        while let Some(index) = stack.pop() {
            let Some(node) = self.live(index) else { continue };
            if node.flags.is_temporary() && !include_temporary {
                continue;
            }
            if f(NodeHandle { index, unique_id: node.unique_id }, node)? {
                // Push in reverse so the first child is visited first
                let mut children = Vec::new();
                let mut child = node.first_child;
                while let Some(child_index) = child {
                    children.push(child_index);
                    child = self.live(child_index).and_then(|child| child.next_sibling);
                }
                stack.extend(children.into_iter().rev());
            }
        }
        Ok(())
    }
}

impl Default for Namespace {
    fn default() -> Self {
        Namespace::new()
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const STEM: &str = "│   ";
        const BRANCH: &str = "├── ";
        const END: &str = "└── ";

        fn print_level(namespace: &Namespace, f: &mut fmt::Formatter<'_>, index: u32, indent_stack: String) -> fmt::Result {
            let mut children = Vec::new();
            let mut next = namespace.live(index).and_then(|node| node.first_child);
            while let Some(child) = next {
                let Some(node) = namespace.live(child) else { break };
                if !node.flags.is_temporary() {
                    children.push(child);
                }
                next = node.next_sibling;
            }

            for (i, &child) in children.iter().enumerate() {
                let Some(node) = namespace.live(child) else { continue };
                let end = i == children.len() - 1;
                write!(f, "{}{}{}: {:?}", &indent_stack, if end { END } else { BRANCH }, node.name.as_str(), node.typ)?;
                if node.flags.is_external() {
                    write!(f, " [External]")?;
                }
                match &node.object {
                    Some(object) => writeln!(f, " = {}", *object.lock())?,
                    None => writeln!(f)?,
                }
                print_level(namespace, f, child, indent_stack.clone() + if end { "    " } else { STEM })?;
            }

            Ok(())
        }

        writeln!(f, "\\:")?;
        print_level(self, f, ROOT_INDEX, String::from("    "))
    }
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct AmlName(Vec<NameComponent>);

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum NameComponent {
    Root,
    Prefix,
    Segment(NameSeg),
}

impl AmlName {
    pub fn root() -> AmlName {
        AmlName(vec![NameComponent::Root])
    }

    /// The null name, encoded in AML as a single `0x00`. It refers to the current scope.
    pub fn null() -> AmlName {
        AmlName(Vec::new())
    }

    pub fn from_name_seg(seg: NameSeg) -> AmlName {
        AmlName(vec![NameComponent::Segment(seg)])
    }

    pub fn from_components(components: Vec<NameComponent>) -> AmlName {
        AmlName(components)
    }

    pub fn components(&self) -> &[NameComponent] {
        &self.0
    }

    pub fn as_string(&self) -> String {
        self.0
            .iter()
            .fold(String::new(), |name, component| match component {
                NameComponent::Root => name + "\\",
                NameComponent::Prefix => name + "^",
                NameComponent::Segment(seg) => name + seg.as_str() + ".",
            })
            .trim_end_matches('.')
            .to_string()
    }

    pub fn is_null(&self) -> bool {
        !self.0.iter().any(|component| matches!(component, NameComponent::Segment(_)))
    }

    /// An AML path is normal if it does not contain any prefix elements ("^" characters, when
    /// expressed as a string).
    pub fn is_normal(&self) -> bool {
        !self.0.contains(&NameComponent::Prefix)
    }

    pub fn is_absolute(&self) -> bool {
        self.0.first() == Some(&NameComponent::Root)
    }

    /// Special rules apply when searching for certain paths (specifically, those that are made up
    /// of a single name segment). Returns `true` if those rules apply.
    pub fn search_rules_apply(&self) -> bool {
        self.0.len() == 1 && matches!(self.0[0], NameComponent::Segment(_))
    }

    pub fn last_segment(&self) -> Option<NameSeg> {
        match self.0.last() {
            Some(NameComponent::Segment(seg)) => Some(*seg),
            _ => None,
        }
    }

    /// Normalize an AML path, resolving prefix chars. Returns `AmlError::InvalidNormalizedName` if the path
    /// normalizes to an invalid path (e.g. `\^_FOO`)
    pub fn normalize(self) -> Result<AmlName, AmlError> {
        if self.is_normal() {
            return Ok(self);
        }

        let mut normalized = Vec::with_capacity(self.0.len());
        for &component in &self.0 {
            match component {
                NameComponent::Prefix => match normalized.last() {
                    Some(NameComponent::Segment(_)) => {
                        normalized.pop();
                    }
                    _ => return Err(AmlError::InvalidNormalizedName(self.clone())),
                },
                other => normalized.push(other),
            }
        }
        Ok(AmlName(normalized))
    }

    /// Get the parent of this `AmlName`. For example, the parent of `\_SB.PCI0._PRT` is `\_SB.PCI0`.
    pub fn parent(&self) -> Result<AmlName, AmlError> {
        let mut normalized = self.clone().normalize()?;
        match normalized.0.last() {
            Some(NameComponent::Segment(_)) => {
                normalized.0.pop();
                Ok(normalized)
            }
            _ => Err(AmlError::RootHasNoParent),
        }
    }

    /// Resolve this path against a given absolute scope, making it absolute and normal.
    pub fn resolve(&self, scope: &AmlName) -> Result<AmlName, AmlError> {
        if self.is_absolute() {
            return self.clone().normalize();
        }
        if !scope.is_absolute() {
            return Err(AmlError::InvalidArgument);
        }

        let mut resolved = scope.clone();
        resolved.0.extend_from_slice(&self.0);
        resolved.normalize()
    }
}

impl FromStr for AmlName {
    type Err = AmlError;

    fn from_str(mut string: &str) -> Result<Self, Self::Err> {
        if string.is_empty() {
            return Err(AmlError::EmptyNamesAreInvalid);
        }

        let mut components = Vec::new();

        // If it starts with a \, make it an absolute name
        if string.starts_with('\\') {
            components.push(NameComponent::Root);
            string = &string[1..];
        }

        if !string.is_empty() {
            for mut part in string.split('.') {
                while part.starts_with('^') {
                    components.push(NameComponent::Prefix);
                    part = &part[1..];
                }

                components.push(NameComponent::Segment(NameSeg::from_str(part)?));
            }
        }

        Ok(Self(components))
    }
}

impl fmt::Display for AmlName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_string())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NameSeg(pub(crate) [u8; 4]);

impl NameSeg {
    pub fn from_str(string: &str) -> Result<NameSeg, AmlError> {
        // Each NameSeg can only have four chars, and must have at least one
        if string.is_empty() || string.len() > 4 {
            return Err(AmlError::InvalidNameSeg([0xff, 0xff, 0xff, 0xff]));
        }

        // We pre-fill the array with '_', so it will already be correct if the length is < 4
        let mut seg = [b'_'; 4];
        let bytes = string.as_bytes();
        seg[..bytes.len()].copy_from_slice(bytes);

        if !is_lead_name_char(seg[0]) || !seg[1..].iter().all(|&c| is_name_char(c)) {
            return Err(AmlError::InvalidNameSeg(seg));
        }

        Ok(NameSeg(seg))
    }

    pub fn from_bytes(bytes: [u8; 4]) -> Result<NameSeg, AmlError> {
        if !is_lead_name_char(bytes[0]) || !bytes[1..].iter().all(|&c| is_name_char(c)) {
            return Err(AmlError::InvalidNameSeg(bytes));
        }
        Ok(NameSeg(bytes))
    }

    /// Create a segment from raw AML bytes. Only the lead character is checked; anything else is fixed up by
    /// [`NameSeg::repaired`] when the name reaches the namespace.
    pub(crate) fn from_raw(bytes: [u8; 4]) -> Result<NameSeg, AmlError> {
        if !is_lead_name_char(bytes[0]) {
            return Err(AmlError::InvalidNameSeg(bytes));
        }
        Ok(NameSeg(bytes))
    }

    /// Repair a segment so that it only contains `A-Z`, `0-9`, and `_`. Lowercase letters are uppercased, and
    /// anything else becomes `_`. Returns whether anything was changed.
    pub fn repaired(&self) -> (NameSeg, bool) {
        let mut bytes = self.0;
        let mut changed = false;
        for (i, byte) in bytes.iter_mut().enumerate() {
            let valid = if i == 0 { is_lead_name_char(*byte) } else { is_name_char(*byte) };
            if !valid {
                changed = true;
                *byte = if byte.is_ascii_lowercase() { byte.to_ascii_uppercase() } else { b'_' };
            }
        }
        (NameSeg(bytes), changed)
    }

    pub fn as_str(&self) -> &str {
        str::from_utf8(&self.0).unwrap_or("????")
    }

    pub fn as_bytes(&self) -> [u8; 4] {
        self.0
    }

    /// Whether this is a name reserved by ACPI (i.e. it starts with an underscore).
    pub fn is_predefined(&self) -> bool {
        self.0[0] == b'_'
    }
}

pub fn is_lead_name_char(c: u8) -> bool {
    c.is_ascii_uppercase() || c == b'_'
}

pub fn is_name_char(c: u8) -> bool {
    is_lead_name_char(c) || c.is_ascii_digit()
}

impl fmt::Debug for NameSeg {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}
