use crate::{
    context::{term_args, ContextKind, MethodContext, OpInFlight, Pass},
    namespace::{AmlName, NodeHandle},
    object::{DeferredArgs, DeferredKind, DeviceStatus, Object, ObjectType, ReferenceKind, ReferenceTarget, WrappedObject},
    op_region::RegionSpace,
    opcode::Opcode,
    owner::OwnerId,
    stream::AmlCode,
    tables::{
        validate_checksum,
        Fadt,
        SdtHeader,
        Signature,
        TableDescriptor,
        TableIndex,
        TableMapping,
        TableOrigin,
        SDT_HEADER_LENGTH,
    },
    AmlError,
    Interpreter,
};
use alloc::{sync::Arc, vec, vec::Vec};
use core::{str::FromStr, sync::atomic::Ordering};
use log::{debug, error, info, trace, warn};

impl Interpreter {
    /// Install a definition block (a `DSDT`, `SSDT`, `PSDT`, or `OSDT`) and load it into the namespace. Errors
    /// in the table's module-level code are logged and skipped; only malformed tables fail to load.
    pub fn load_table(&self, table: &[u8]) -> Result<TableIndex, AmlError> {
        let index = self.install_table(table)?;
        self.load_installed_table(index)?;
        Ok(index)
    }

    /// Add a table to the table list without loading it. Its header and checksum are validated.
    pub fn install_table(&self, table: &[u8]) -> Result<TableIndex, AmlError> {
        self.install_descriptor(TableDescriptor::new(Arc::from(table), TableOrigin::ExternalVirtual, None)?)
    }

    /// Install the table at a physical address. The host's mapping of the table is kept while the table is
    /// installed, unless this is the `DSDT` and `copy_dsdt_locally` is set, in which case a private copy is used
    /// and the mapping is released straight away.
    pub fn install_physical_table(&self, address: u64) -> Result<TableIndex, AmlError> {
        let length = self.physical_table_length(address)?;
        let mapping = TableMapping { virtual_address: self.handler.map_physical_region(address, length), length };
        let data = self.read_mapped(mapping);

        let mut descriptor = match TableDescriptor::new(Arc::from(data), TableOrigin::InternalPhysical, Some(address)) {
            Ok(descriptor) => descriptor,
            Err(err) => {
                self.handler.unmap_physical_region(mapping.virtual_address, mapping.length);
                return Err(err);
            }
        };
        if descriptor.signature() == Signature::DSDT && self.config.copy_dsdt_locally {
            warn!("Keeping a local copy of the DSDT, using {} bytes of memory", length);
            self.handler.unmap_physical_region(mapping.virtual_address, mapping.length);
            descriptor.origin = TableOrigin::InternalVirtual;
        } else {
            descriptor.mapping = Some(mapping);
        }

        self.install_descriptor(descriptor)
    }

    fn install_descriptor(&self, descriptor: TableDescriptor) -> Result<TableIndex, AmlError> {
        info!(
            "Installing table {} (OEM {:?}, revision {}, {} bytes)",
            descriptor.signature(),
            descriptor.header.oem_table_id(),
            descriptor.header.revision,
            descriptor.header.length
        );
        let mapping = descriptor.mapping;
        let (index, duplicate) = {
            let mut tables = self.tables.lock();
            let num_tables = tables.len();
            let index = tables.install(descriptor);
            (index, tables.len() == num_tables)
        };
        if let Some(mapping) = mapping.filter(|_| duplicate) {
            self.handler.unmap_physical_region(mapping.virtual_address, mapping.length);
        }
        Ok(index)
    }

    fn read_mapped(&self, mapping: TableMapping) -> Vec<u8> {
        (0..mapping.length).map(|offset| self.handler.read_u8(mapping.virtual_address + offset)).collect()
    }

    /// Tables that are still mapped are read again before they are loaded, and have to still be valid.
    fn reverify_mapped_table(&self, index: TableIndex) -> Result<(), AmlError> {
        let (signature, mapping, data) = {
            let tables = self.tables.lock();
            let table = tables.get(index)?;
            match (table.origin, table.mapping) {
                (TableOrigin::InternalPhysical, Some(mapping)) => (table.signature(), mapping, table.data.clone()),
                _ => return Ok(()),
            }
        };

        let current = self.read_mapped(mapping);
        if current[..] == data[..] {
            return Ok(());
        }
        warn!("Table {} has changed in memory since it was installed", signature);
        let header = SdtHeader::parse(&current)?;
        if header.signature != signature {
            return Err(AmlError::TableInvalidSignature);
        }
        validate_checksum(signature, &current[0..header.length as usize])?;

        let mut tables = self.tables.lock();
        let table = tables.get_mut(index)?;
        table.header = header;
        table.data = Arc::from(current);
        Ok(())
    }

    pub fn load_installed_table(&self, index: TableIndex) -> Result<(), AmlError> {
        let _lock = self.interpreter_lock.lock();
        let root = self.namespace.read().root();
        self.load_table_locked(index, root)
    }

    /// Remove everything a table added to the namespace. The `DSDT` can't be unloaded.
    pub fn unload_table(&self, index: TableIndex) -> Result<(), AmlError> {
        let _lock = self.interpreter_lock.lock();
        self.unload_table_locked(index)
    }

    /// Load a table, with its top-level names declared relative to `scope`.
    ///
    /// This takes two passes over the table. The first declares every named object, and creates the `Method`
    /// objects, so that method invocations can be parsed no matter where the method is declared. The second
    /// runs the table's module-level code, creating the remaining objects.
    pub(crate) fn load_table_locked(&self, index: TableIndex, scope: NodeHandle) -> Result<(), AmlError> {
        self.reverify_mapped_table(index)?;
        let (signature, revision, code) = {
            let tables = self.tables.lock();
            let table = tables.get(index)?;
            if table.loaded {
                return Err(AmlError::TableAlreadyLoaded);
            }
            if !table.signature().is_aml() {
                return Err(AmlError::TableInvalidSignature);
            }
            let (start, end) = table.body_range();
            (table.signature(), table.header.revision, AmlCode::new(table.data.clone(), start, end))
        };

        if signature == Signature::DSDT && revision < 2 {
            info!("DSDT has revision {}; integers are 32 bits wide", revision);
            self.integers_32bit.store(true, Ordering::Relaxed);
        }

        let owner = self.owner_ids.lock().allocate()?;
        debug!("Loading table {} with owner {:?} ({} bytes of AML)", signature, owner, code.len());

        let result = self
            .run(MethodContext::new(ContextKind::Table, Pass::Declare, code.clone(), scope, owner))
            .and_then(|_| self.run(MethodContext::new(ContextKind::Table, Pass::Execute, code, scope, owner)));

        match result {
            Ok(_) => {
                self.namespace.write().clear_pending(owner);
                {
                    let mut tables = self.tables.lock();
                    let table = tables.get_mut(index)?;
                    table.loaded = true;
                    table.owner = owner;
                }
                info!("Loaded table {} ({} namespace nodes)", signature, self.namespace.read().num_nodes());
                Ok(())
            }
            Err(err) => {
                if signature == Signature::DSDT {
                    error!("Failed to load DSDT: {:?}", err);
                } else {
                    warn!("Failed to load table {}: {:?}", signature, err);
                }
                self.remove_owned_objects(owner);
                if let Err(err) = self.owner_ids.lock().release(owner) {
                    warn!("Failed to release owner id {:?}: {:?}", owner, err);
                }
                Err(err)
            }
        }
    }

    pub(crate) fn unload_table_locked(&self, index: TableIndex) -> Result<(), AmlError> {
        let (signature, owner, mapping) = {
            let mut tables = self.tables.lock();
            let table = tables.get_mut(index)?;
            if table.signature() == Signature::DSDT {
                return Err(AmlError::CannotUnloadDsdt);
            }
            if !table.loaded {
                return Err(AmlError::TableNotLoaded);
            }
            table.loaded = false;
            let mapping = match table.origin {
                TableOrigin::InternalPhysical => table.mapping.take(),
                _ => None,
            };
            (table.signature(), core::mem::replace(&mut table.owner, OwnerId::NONE), mapping)
        };

        if let Some(mapping) = mapping {
            self.handler.unmap_physical_region(mapping.virtual_address, mapping.length);
        }
        self.remove_owned_objects(owner);
        self.owner_ids.lock().release(owner)?;
        info!("Unloaded table {} (owner {:?})", signature, owner);
        Ok(())
    }

    fn remove_owned_objects(&self, owner: OwnerId) {
        let removed = self.namespace.write().remove_by_owner(owner);
        trace!("Removed {} objects owned by {:?}", removed.len(), owner);
        for object in &removed {
            self.detach_region_object(object);
        }
    }

    /// Find the tables from the host's RSDT/XSDT, and install and load the `DSDT` and every `SSDT`, `PSDT`,
    /// and `OSDT`. A `DSDT` that fails to load is an error; the other tables are skipped if they fail.
    pub fn initialize_tables(&self) -> Result<(), AmlError> {
        let prefer_rsdt = self.config.do_not_use_xsdt;
        let fadt_address =
            self.handler.find_table(Signature::FADT, 0, prefer_rsdt).ok_or(AmlError::TableNotFound(Signature::FADT))?;
        let fadt = Fadt::parse(&self.read_physical_table(fadt_address)?)?;
        if self.config.require_hardware_reduced {
            fadt.check_hardware_reduced()?;
        }

        let dsdt_address = fadt.dsdt_address(self.config.do_not_use_xsdt);
        let dsdt = self.install_physical_table(dsdt_address)?;
        self.load_installed_table(dsdt)?;

        for signature in [Signature::SSDT, Signature::PSDT, Signature::OSDT] {
            let mut instance = 0;
            while let Some(address) = self.handler.find_table(signature, instance, prefer_rsdt) {
                instance += 1;
                let result =
                    self.install_physical_table(address).and_then(|index| self.load_installed_table(index));
                if let Err(err) = result {
                    warn!("Skipping {} #{} at {:#x}: {:?}", signature, instance - 1, address, err);
                }
            }
        }

        Ok(())
    }

    fn read_physical_table(&self, address: u64) -> Result<Vec<u8>, AmlError> {
        let length = self.physical_table_length(address)?;
        Ok(self.handler.read_physical(address, length))
    }

    fn physical_table_length(&self, address: u64) -> Result<usize, AmlError> {
        let header = self.handler.read_physical(address, SDT_HEADER_LENGTH);
        let length = match SdtHeader::parse(&header) {
            Ok(header) => header.length as usize,
            // The header alone is shorter than the length it claims, so read the length directly
            Err(AmlError::TableTruncated) if header.len() >= 8 => {
                u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize
            }
            Err(err) => return Err(err),
        };
        if length < SDT_HEADER_LENGTH {
            return Err(AmlError::TableTruncated);
        }
        Ok(length)
    }

    /// Run `\_INI` and `\_SB._INI`, then evaluate `_STA` and `_INI` for every device in the namespace. Devices
    /// whose `_STA` reports them as neither present nor functioning are skipped, along with their children.
    /// Before this, `_REG` is run for the regions of the default address spaces.
    pub fn initialize_devices(&self) -> Result<(), AmlError> {
        let _lock = self.interpreter_lock.lock();
        let root = self.namespace.read().root();

        for space in [RegionSpace::SystemMemory, RegionSpace::SystemIO, RegionSpace::PciConfig, RegionSpace::DataTable]
        {
            if let Err(err) = self.run_reg_methods_locked(root, space, true) {
                warn!("Failed to run _REG methods for {:?}: {:?}", space, err);
            }
        }

        for path in ["\\_INI", "\\_SB._INI"] {
            let path = AmlName::from_str(path)?;
            let node = match self.namespace.read().lookup(root, &path, ObjectType::Method, false) {
                Ok(node) => node,
                Err(AmlError::ObjectDoesNotExist(_)) => continue,
                Err(err) => return Err(err),
            };
            if let Err(err) = self.evaluate_node_locked(node, Vec::new()) {
                warn!("{} failed: {:?}", path, err);
            }
        }

        let mut num_devices = 0;
        let mut num_initialized = 0;
        let mut pending = vec![root];
        while let Some(scope) = pending.pop() {
            let children = self.namespace.read().children(scope)?;
            for child in children {
                let typ = self.namespace.read().typ(child)?;
                match typ {
                    ObjectType::Device | ObjectType::Processor | ObjectType::ThermalZone => {
                        num_devices += 1;
                        let status = self.device_status(child)?;
                        if status.present() {
                            match self.evaluate_child(child, "_INI") {
                                Ok(Some(_)) => num_initialized += 1,
                                Ok(None) => (),
                                Err(err) => warn!(
                                    "_INI for {} failed: {:?}",
                                    self.namespace.read().full_path(child)?,
                                    err
                                ),
                            }
                        }
                        if status.present() || status.functioning() {
                            pending.push(child);
                        }
                    }
                    typ if typ.is_scope_opening() => pending.push(child),
                    _ => (),
                }
            }
        }

        info!("Initialized {} of {} devices", num_initialized, num_devices);
        Ok(())
    }

    /// The result of a device's `_STA`. Devices without one are present and functioning.
    fn device_status(&self, device: NodeHandle) -> Result<DeviceStatus, AmlError> {
        match self.evaluate_child(device, "_STA")? {
            Some(status) => Ok(DeviceStatus(self.operand_to_integer(&status)?)),
            None => Ok(DeviceStatus(0x0f)),
        }
    }

    /// Run the recorded operands of a deferred object, producing `num_args` values.
    pub(crate) fn execute_deferred(
        &self,
        deferred: &DeferredArgs,
        num_args: usize,
    ) -> Result<Vec<WrappedObject>, AmlError> {
        trace!("Executing deferred operands ({} bytes)", deferred.code.len());
        let mut context = MethodContext::new(
            ContextKind::Deferred,
            Pass::Execute,
            deferred.code.clone(),
            deferred.scope,
            deferred.owner,
        );
        context.start_in_flight_op(OpInFlight::new(Opcode::InternalArgumentList, &term_args(num_args), 0));

        let result = self.run(context)?.ok_or(AmlError::UnexpectedResult)?;
        match result.snapshot() {
            Object::Package(args) if args.len() == num_args => Ok(args),
            _ => Err(AmlError::UnexpectedResult),
        }
    }

    /// Work out the address and length of a region whose operands were deferred.
    pub(crate) fn execute_deferred_region(
        &self,
        object: &WrappedObject,
        deferred: &DeferredArgs,
    ) -> Result<(), AmlError> {
        let (base, length, table) = match deferred.kind {
            DeferredKind::Region => {
                let args = self.execute_deferred(deferred, 2)?;
                (self.operand_to_integer(&args[0])?, self.operand_to_integer(&args[1])?, None)
            }
            DeferredKind::DataRegion => {
                let args = self.execute_deferred(deferred, 3)?;
                let signature = self.operand_to_string(&args[0])?;
                let oem_id = self.operand_to_string(&args[1])?;
                let oem_table_id = self.operand_to_string(&args[2])?;
                let (data, base) = self.find_data_table(&signature, &oem_id, &oem_table_id)?;
                (base, data.len() as u64, Some(data))
            }
            DeferredKind::BufferField(_) => return Err(AmlError::InvalidArgument),
        };

        match &mut *object.lock() {
            Object::OpRegion(region) => {
                trace!("Resolved deferred region: {:?} at {:#x} (length {:#x})", region.space, base, length);
                region.base = base;
                region.length = length;
                region.deferred = None;
                if table.is_some() {
                    region.table = table;
                }
                Ok(())
            }
            other => Err(AmlError::ObjectNotOfExpectedType { expected: ObjectType::OpRegion, got: other.typ() }),
        }
    }

    /// Find the table a `DataTableRegion` refers to, asking the host for it if it hasn't been installed.
    /// Returns the table's contents and the address the region should start at.
    pub(crate) fn find_data_table(
        &self,
        signature: &str,
        oem_id: &str,
        oem_table_id: &str,
    ) -> Result<(Arc<[u8]>, u64), AmlError> {
        let signature = parse_signature(signature)?;

        let index = self.tables.lock().find_by_oem(signature, oem_id, oem_table_id);
        let index = match index {
            Some(index) => index,
            None => {
                let address = self
                    .handler
                    .find_table(signature, 0, self.config.do_not_use_xsdt)
                    .ok_or(AmlError::TableNotFound(signature))?;
                self.install_physical_table(address)?
            }
        };

        let tables = self.tables.lock();
        let table = tables.get(index)?;
        let length = table.header.length as usize;
        Ok((Arc::from(&table.data[0..length]), table.physical_address.unwrap_or(0)))
    }

    /// Load a table from a `Buffer`, `OperationRegion`, or field, as the `Load` op does.
    pub(crate) fn load_from_object(&self, context: &MethodContext, name: &AmlName) -> Result<TableIndex, AmlError> {
        let node = self.namespace.read().lookup(context.current_scope, name, ObjectType::Any, true)?;
        let object = self.namespace.read().object(node)?.ok_or(AmlError::InvalidReference)?;

        let data = match object.snapshot() {
            Object::Buffer(bytes) => bytes,
            Object::OpRegion(_) => self.read_region_bytes(node)?,
            Object::FieldUnit(field) => self.read_field(&field)?.to_buffer(self.integer_bytes())?,
            other => {
                return Err(AmlError::ObjectNotOfExpectedType { expected: ObjectType::Buffer, got: other.typ() });
            }
        };

        let descriptor = TableDescriptor::new(Arc::from(data), TableOrigin::InternalVirtual, None)?;
        if !descriptor.signature().is_aml() || descriptor.signature() == Signature::DSDT {
            return Err(AmlError::TableInvalidSignature);
        }
        let index = self.install_descriptor(descriptor)?;
        let root = self.namespace.read().root();
        self.load_table_locked(index, root)?;
        Ok(index)
    }

    /// Perform `LoadTable`. The table is found by signature and OEM ids among the installed tables, and loaded
    /// relative to the root path given. The parameter data is stored to the object at the parameter path once
    /// the table has loaded. Produces a `DdbHandle`, or `Zero` if there's no such table.
    pub(crate) fn load_table_op(
        &self,
        context: &mut MethodContext,
        args: &[WrappedObject],
    ) -> Result<WrappedObject, AmlError> {
        let [signature, oem_id, oem_table_id, root_path, parameter_path, parameter_data] = args else {
            return Err(AmlError::UnexpectedResult);
        };
        let signature = parse_signature(&self.operand_to_string(signature)?)?;
        let oem_id = self.operand_to_string(oem_id)?;
        let oem_table_id = self.operand_to_string(oem_table_id)?;

        let Some(index) = self.tables.lock().find_by_oem(signature, &oem_id, &oem_table_id) else {
            warn!("LoadTable of {} ({:?}, {:?}) found no table", signature, oem_id, oem_table_id);
            return Ok(Object::Integer(0).wrap());
        };

        let root_path = self.operand_to_string(root_path)?;
        let scope = if root_path.is_empty() {
            self.namespace.read().root()
        } else {
            self.namespace.read().lookup(
                context.current_scope,
                &AmlName::from_str(&root_path)?,
                ObjectType::Any,
                false,
            )?
        };
        self.load_table_locked(index, scope)?;

        let parameter_path = self.operand_to_string(parameter_path)?;
        if !parameter_path.is_empty() {
            let node =
                self.namespace.read().lookup(scope, &AmlName::from_str(&parameter_path)?, ObjectType::Any, false)?;
            self.store_to_node(node, parameter_data)?;
        }

        Ok(Object::Reference { kind: ReferenceKind::Table, target: ReferenceTarget::Table(index) }.wrap())
    }
}

fn parse_signature(signature: &str) -> Result<Signature, AmlError> {
    let bytes: [u8; 4] = signature.as_bytes().try_into().map_err(|_| AmlError::InvalidArgument)?;
    Ok(Signature(bytes))
}
