use crate::{
    namespace::NodeHandle,
    object::{Object, ObjectType, WrappedObject},
    op_region::{RegionHandler, RegionSpace},
    AmlError,
    Interpreter,
};
use alloc::{sync::Arc, vec, vec::Vec};
use log::{info, trace, warn};
use spinning_top::Spinlock;

/// A handler installed for one address space at a namespace node. It serves every region of that space in the
/// node's subtree, except those beneath a nearer node with its own handler for the space.
pub struct AddressSpaceHandler {
    pub(crate) space: RegionSpace,
    pub(crate) handler: Arc<dyn RegionHandler>,
    /// Held for the duration of each access made through the handler.
    pub(crate) context_lock: Spinlock<()>,
    pub(crate) regions: Spinlock<Vec<NodeHandle>>,
    is_default: bool,
}

impl AddressSpaceHandler {
    fn new(space: RegionSpace, handler: Arc<dyn RegionHandler>, is_default: bool) -> AddressSpaceHandler {
        AddressSpaceHandler {
            space,
            handler,
            context_lock: Spinlock::new(()),
            regions: Spinlock::new(Vec::new()),
            is_default,
        }
    }

    pub fn space(&self) -> RegionSpace {
        self.space
    }

    pub fn is_default(&self) -> bool {
        self.is_default
    }

    /// The regions currently attached to this handler.
    pub fn regions(&self) -> Vec<NodeHandle> {
        self.regions.lock().clone()
    }
}

/// `_REG` methods are not run for spaces that are always available.
fn needs_reg(space: RegionSpace) -> bool {
    !matches!(space, RegionSpace::SystemMemory | RegionSpace::SystemIO)
}

impl Interpreter {
    /// Install a handler for `space` at `node`, which must be the root or a `Device`, `Processor`, or
    /// `ThermalZone`. Regions of the space in the node's subtree are moved over to the new handler, and the
    /// `_REG` methods of their devices are run to tell them the space is now available.
    pub fn install_handler(
        &self,
        node: NodeHandle,
        space: RegionSpace,
        handler: Arc<dyn RegionHandler>,
    ) -> Result<(), AmlError> {
        let _lock = self.interpreter_lock.lock();
        self.install_handler_locked(node, space, handler, false)?;
        if needs_reg(space) {
            self.run_reg_methods_locked(node, space, true)?;
        }
        Ok(())
    }

    pub(crate) fn install_handler_locked(
        &self,
        node: NodeHandle,
        space: RegionSpace,
        handler: Arc<dyn RegionHandler>,
        is_default: bool,
    ) -> Result<Arc<AddressSpaceHandler>, AmlError> {
        let mut namespace = self.namespace.write();
        let typ = namespace.typ(node)?;
        if node != namespace.root()
            && !matches!(typ, ObjectType::Device | ObjectType::Processor | ObjectType::ThermalZone)
        {
            return Err(AmlError::InvalidArgument);
        }

        if let Some(existing) = namespace.node(node)?.handlers().iter().find(|existing| existing.space == space) {
            return if Arc::ptr_eq(&existing.handler, &handler) {
                Err(AmlError::SameHandler)
            } else {
                Err(AmlError::HandlerAlreadyExists)
            };
        }

        let new_handler = Arc::new(AddressSpaceHandler::new(space, handler, is_default));
        namespace.node_handlers_mut(node)?.push(new_handler.clone());

        /*
         * Find the regions that the new handler now serves. We don't descend past nodes that have their own
         * handler for the space, as those regions still belong to the nearer handler.
         */
        let mut regions = Vec::new();
        namespace.walk_children(node, true, |handle, child| {
            if handle != node && child.handlers().iter().any(|existing| existing.space == space) {
                return Ok(false);
            }
            if let Some(object) = child.object() {
                if matches!(&*object.lock(), Object::OpRegion(region) if region.space == space) {
                    regions.push((handle, object.clone()));
                }
            }
            Ok(true)
        })?;
        let path = namespace.full_path(node)?;
        drop(namespace);

        for (region, object) in &regions {
            self.detach_region_object(object);
            self.attach_region_to(*region, object, &new_handler);
        }

        if is_default {
            trace!("Installed default handler for {:?} at {}", space, path);
        } else {
            info!("Installed handler for {:?} at {} ({} regions attached)", space, path, regions.len());
        }
        Ok(new_handler)
    }

    /// Remove the handler for `space` at `node`. Regions it served are handed to the nearest handler for the
    /// space above `node`, if there is one; otherwise they are left without a handler, and accesses to them will
    /// fail until a new handler is installed.
    pub fn remove_handler(&self, node: NodeHandle, space: RegionSpace) -> Result<(), AmlError> {
        let _lock = self.interpreter_lock.lock();

        let removed = {
            let mut namespace = self.namespace.write();
            let handlers = namespace.node_handlers_mut(node)?;
            let index =
                handlers.iter().position(|handler| handler.space == space).ok_or(AmlError::HandlerNotFound)?;
            handlers.remove(index)
        };

        let regions = removed.regions();
        for region in regions {
            let Some(object) = self.namespace.read().object(region).ok().flatten() else { continue };
            self.detach_region_object(&object);
            if let Err(err) = self.attach_region(region) {
                trace!("Region {:?} has no handler after removal: {:?}", region, err);
            }
        }

        info!("Removed handler for {:?}", space);
        Ok(())
    }

    /// Attach a region to the handler for its space nearest to it in the namespace.
    pub(crate) fn attach_region(&self, region: NodeHandle) -> Result<(), AmlError> {
        let object = self.namespace.read().object(region)?.ok_or(AmlError::InvalidReference)?;
        let space = match &*object.lock() {
            Object::OpRegion(region) => region.space,
            other => {
                return Err(AmlError::ObjectNotOfExpectedType { expected: ObjectType::OpRegion, got: other.typ() });
            }
        };

        let handler = {
            let namespace = self.namespace.read();
            let mut current = namespace.parent(region)?;
            let mut found = None;
            while let Some(node) = current {
                if let Some(handler) = namespace.node(node)?.handlers().iter().find(|handler| handler.space == space)
                {
                    found = Some(handler.clone());
                    break;
                }
                current = namespace.parent(node)?;
            }
            found.ok_or(AmlError::NoHandlerForRegion(space))?
        };

        self.attach_region_to(region, &object, &handler);
        Ok(())
    }

    fn attach_region_to(&self, region: NodeHandle, object: &WrappedObject, handler: &Arc<AddressSpaceHandler>) {
        if let Object::OpRegion(op_region) = &mut *object.lock() {
            op_region.handler = Some(handler.clone());
            op_region.context = None;
        }
        handler.regions.lock().push(region);
    }

    /// Detach a region object from its handler, tearing down the handler's context for it. Used when a handler is
    /// replaced, and when regions are removed from the namespace.
    pub(crate) fn detach_region_object(&self, object: &WrappedObject) {
        let (handler, context) = match &mut *object.lock() {
            Object::OpRegion(region) => (region.handler.take(), region.context.take()),
            _ => return,
        };
        let Some(handler) = handler else { return };

        if let Some(context) = context {
            let _guard = handler.context_lock.lock();
            handler.handler.teardown(&mut context.lock(), &*self.handler);
        }

        // The node may already be gone, so match on the object the node held
        let namespace = self.namespace.read();
        handler.regions.lock().retain(|&node| match namespace.object(node) {
            Ok(Some(held)) => !held.ptr_eq(object),
            _ => false,
        });
    }

    /// Run `_REG(space, connect)` for every device in the subtree under `node` that declares a region of
    /// `space`. Failures are logged, and do not stop the remaining `_REG` methods from running.
    pub fn run_reg_methods(&self, node: NodeHandle, space: RegionSpace, connect: bool) -> Result<(), AmlError> {
        let _lock = self.interpreter_lock.lock();
        self.run_reg_methods_locked(node, space, connect)
    }

    pub(crate) fn run_reg_methods_locked(
        &self,
        node: NodeHandle,
        space: RegionSpace,
        connect: bool,
    ) -> Result<(), AmlError> {
        let mut devices: Vec<NodeHandle> = Vec::new();
        {
            let namespace = self.namespace.read();
            namespace.walk_children(node, false, |handle, child| {
                if let Some(object) = child.object() {
                    if matches!(&*object.lock(), Object::OpRegion(region) if region.space == space) {
                        if let Some(parent) = namespace.parent(handle)? {
                            if !devices.contains(&parent) {
                                devices.push(parent);
                            }
                        }
                    }
                }
                Ok(true)
            })?;
        }

        for device in devices {
            let reg = match self.namespace.read().child(device, crate::namespace::NameSeg(*b"_REG")) {
                Ok(Some(reg)) => reg,
                _ => continue,
            };
            let args = vec![Object::Integer(space.id() as u64).wrap(), Object::Integer(connect as u64).wrap()];
            if let Err(err) = self.evaluate_node_locked(reg, args) {
                warn!("_REG for {:?} at {:?} failed: {:?}", space, self.namespace.read().full_path(reg), err);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        op_region::{RegionAccess, RegionContext},
        test_utils::{aml_table, TestHandler},
        Handler,
    };
    use core::str::FromStr;

    struct NullHandler;

    impl RegionHandler for NullHandler {
        fn access(
            &self,
            _access: RegionAccess,
            _address: u64,
            _width: u32,
            value: &mut u64,
            _context: &mut RegionContext,
            _host: &dyn Handler,
        ) -> Result<(), AmlError> {
            *value = 0x55;
            Ok(())
        }
    }

    fn handler_of(interpreter: &Interpreter, path: &str) -> Option<Arc<AddressSpaceHandler>> {
        let node = interpreter.lookup(&crate::namespace::AmlName::from_str(path).unwrap()).unwrap();
        let object = interpreter.namespace.read().object(node).unwrap().unwrap();
        let object = object.lock();
        match &*object {
            Object::OpRegion(region) => region.handler.clone(),
            _ => None,
        }
    }

    /*
     * DefinitionBlock:
     *     Device (\DEV0) {
     *         OperationRegion (MEM0, SystemMemory, 0x1000, 0x10)
     *     }
     */
    const DEVICE_WITH_REGION: [u8; 21] = [
        0x5b, 0x82, 0x13, b'D', b'E', b'V', b'0', 0x5b, 0x80, b'M', b'E', b'M', b'0', 0x00, 0x0b, 0x00, 0x10, 0x0a,
        0x10, 0xa3, 0xa3,
    ];

    #[test]
    fn install_and_remove_restores_nearest_handler() {
        let interpreter = Interpreter::new(TestHandler::new());
        interpreter.load_table(&aml_table(&DEVICE_WITH_REGION)).unwrap();
        let dev = interpreter.lookup(&crate::namespace::AmlName::from_str("\\DEV0").unwrap()).unwrap();
        let region = interpreter.lookup(&crate::namespace::AmlName::from_str("\\DEV0.MEM0").unwrap()).unwrap();

        {
            let _lock = interpreter.interpreter_lock.lock();
            interpreter.prepare_region(region).unwrap();
        }
        let default = handler_of(&interpreter, "\\DEV0.MEM0").unwrap();
        assert!(default.is_default());
        assert_eq!(default.regions(), vec![region]);

        let custom: Arc<dyn RegionHandler> = Arc::new(NullHandler);
        interpreter.install_handler(dev, RegionSpace::SystemMemory, custom.clone()).unwrap();
        let installed = handler_of(&interpreter, "\\DEV0.MEM0").unwrap();
        assert!(!installed.is_default());
        assert!(default.regions().is_empty());
        assert_eq!(
            interpreter.install_handler(dev, RegionSpace::SystemMemory, custom.clone()),
            Err(AmlError::SameHandler)
        );
        assert_eq!(
            interpreter.install_handler(dev, RegionSpace::SystemMemory, Arc::new(NullHandler)),
            Err(AmlError::HandlerAlreadyExists)
        );

        interpreter.remove_handler(dev, RegionSpace::SystemMemory).unwrap();
        assert!(interpreter.namespace.read().node(dev).unwrap().handlers().is_empty());
        let restored = handler_of(&interpreter, "\\DEV0.MEM0").unwrap();
        assert!(Arc::ptr_eq(&restored, &default));
        assert_eq!(default.regions(), vec![region]);
        assert_eq!(interpreter.remove_handler(dev, RegionSpace::SystemMemory), Err(AmlError::HandlerNotFound));
    }

    #[test]
    fn handlers_only_install_on_scoping_nodes() {
        let interpreter = Interpreter::new(TestHandler::new());
        interpreter.load_table(&aml_table(&DEVICE_WITH_REGION)).unwrap();
        let region = interpreter.lookup(&crate::namespace::AmlName::from_str("\\DEV0.MEM0").unwrap()).unwrap();
        assert_eq!(
            interpreter.install_handler(region, RegionSpace::EmbeddedControl, Arc::new(NullHandler)),
            Err(AmlError::InvalidArgument)
        );
    }
}
