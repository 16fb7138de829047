use crate::{
    context::{term_args, ArgKind, Argument, BlockKind, ContextKind, MethodContext, OpInFlight, ParseStatus, Pass},
    namespace::{AmlName, InsertPolicy, NameSeg, NodeFlags, NodeHandle},
    object::{
        BufferField,
        CreateFieldKind,
        DeferredArgs,
        DeferredKind,
        FieldFlags,
        FieldUnit,
        FieldUnitKind,
        Method,
        MethodCode,
        MethodFlags,
        Object,
        ObjectType,
    },
    op_region::{OpRegion, RegionSpace},
    opcode::Opcode,
    AmlError,
    Interpreter,
};
use alloc::{vec, vec::Vec};
use log::{trace, warn};

const RESERVED_FIELD: u8 = 0x00;
const ACCESS_FIELD: u8 = 0x01;
const CONNECT_FIELD: u8 = 0x02;
const EXTENDED_ACCESS_FIELD: u8 = 0x03;
const BUFFER_OP: u8 = 0x11;

impl Interpreter {
    /// Start an op that adds something to the namespace. Ops whose encoding is entirely fixed are performed
    /// straight away; those with `TermArg` operands are put in flight.
    pub(crate) fn start_named_op(&self, context: &mut MethodContext, opcode: Opcode) -> Result<(), AmlError> {
        match opcode {
            Opcode::Scope => {
                let end = context.pkg_end()?;
                context.op_end = Some(end);
                let name = context.namestring()?;
                let node = self.namespace.read().lookup(context.current_scope, &name, ObjectType::Any, true)?;
                self.open_scope(context, node, &name)?;

                let old_scope = context.current_scope;
                context.start_new_block(BlockKind::Scope { old_scope }, end);
                context.current_scope = node;
            }
            Opcode::Device | Opcode::Processor | Opcode::PowerRes | Opcode::ThermalZone => {
                let end = context.pkg_end()?;
                context.op_end = Some(end);
                let name = context.namestring()?;
                let object = match opcode {
                    Opcode::Device => Object::Device,
                    Opcode::Processor => {
                        let proc_id = context.next()?;
                        let pblk_address = context.next_u32()?;
                        let pblk_length = context.next()?;
                        Object::Processor { proc_id, pblk_address, pblk_length }
                    }
                    Opcode::PowerRes => {
                        let system_level = context.next()?;
                        let resource_order = context.next_u16()?;
                        Object::PowerResource { system_level, resource_order }
                    }
                    _ => Object::ThermalZone,
                };

                let node = self.declare(context, &name, object.typ())?;
                self.namespace.write().attach_object(node, object.wrap())?;

                let old_scope = context.current_scope;
                context.start_new_block(BlockKind::Scope { old_scope }, end);
                context.current_scope = node;
            }
            Opcode::Method => {
                let end = context.pkg_end()?;
                context.op_end = Some(end);
                let name = context.namestring()?;
                let flags = MethodFlags(context.next()?);
                let code = context.code.range(context.pc(), end);
                context.set_pc(end);

                let node = self.declare(context, &name, ObjectType::Method)?;
                let method = Method { code: MethodCode::Aml(code), flags, owner: context.owner };
                self.namespace.write().attach_object(node, Object::Method(method).wrap())?;
            }
            Opcode::External => {
                let name = context.namestring()?;
                let typ = external_type(context.next()?);
                let arg_count = context.next()?;
                self.declare_external(context, &name, typ, arg_count)?;
            }
            Opcode::Mutex => {
                let name = context.namestring()?;
                let sync_level = context.next()? & 0x0f;
                let node = self.declare(context, &name, ObjectType::Mutex)?;
                if context.pass == Pass::Execute {
                    let mutex = self.handler.create_mutex();
                    self.namespace.write().attach_object(node, Object::Mutex { mutex, sync_level }.wrap())?;
                }
            }
            Opcode::Event => {
                let name = context.namestring()?;
                let node = self.declare(context, &name, ObjectType::Event)?;
                if context.pass == Pass::Execute {
                    let event = self.handler.create_event();
                    self.namespace.write().attach_object(node, Object::Event(event).wrap())?;
                }
            }
            Opcode::Alias => {
                let source = context.namestring()?;
                let alias = context.namestring()?;
                match self.declare_alias(context, &source, &alias) {
                    Ok(()) => (),
                    // The source may be declared later in the table
                    Err(_) if context.pass == Pass::Declare => (),
                    Err(err) => return Err(err),
                }
            }
            Opcode::Name => {
                let name = context.namestring()?;
                let op = OpInFlight::new_with(
                    Opcode::Name,
                    vec![Argument::Name(name)],
                    &[ArgKind::Name],
                    &[ArgKind::DataRef],
                    context.pc(),
                );
                context.start_in_flight_op(op);
            }
            Opcode::OpRegion => {
                let name = context.namestring()?;
                let space = context.next()?;
                let mut op = OpInFlight::new_with(
                    Opcode::OpRegion,
                    vec![Argument::Name(name), Argument::Integer(space as u64)],
                    &[ArgKind::Name, ArgKind::Byte],
                    &term_args(2),
                    context.pc(),
                );
                op.deferring = self.should_defer(context);
                context.start_in_flight_op(op);
            }
            Opcode::DataRegion => {
                let name = context.namestring()?;
                let mut op = OpInFlight::new_with(
                    Opcode::DataRegion,
                    vec![Argument::Name(name)],
                    &[ArgKind::Name],
                    &term_args(3),
                    context.pc(),
                );
                op.deferring = self.should_defer(context);
                context.start_in_flight_op(op);
            }
            Opcode::Field => {
                let end = context.pkg_end()?;
                context.op_end = Some(end);
                let region_name = context.namestring()?;
                let flags = FieldFlags(context.next()?);
                if context.pass == Pass::Declare {
                    context.set_pc(end);
                    return Ok(());
                }

                let region =
                    self.namespace.read().lookup(context.current_scope, &region_name, ObjectType::OpRegion, true)?;
                self.parse_field_list(context, end, flags, FieldUnitKind::Normal { region }, ObjectType::FieldUnit)?;
            }
            Opcode::IndexField => {
                let end = context.pkg_end()?;
                context.op_end = Some(end);
                let index_name = context.namestring()?;
                let data_name = context.namestring()?;
                let flags = FieldFlags(context.next()?);
                if context.pass == Pass::Declare {
                    context.set_pc(end);
                    return Ok(());
                }

                let (index, data) = {
                    let namespace = self.namespace.read();
                    let index = namespace.lookup(context.current_scope, &index_name, ObjectType::FieldUnit, true)?;
                    let data = namespace.lookup(context.current_scope, &data_name, ObjectType::FieldUnit, true)?;
                    (index, data)
                };
                self.parse_field_list(context, end, flags, FieldUnitKind::Index { index, data }, ObjectType::IndexField)?;
            }
            Opcode::BankField => {
                let end = context.pkg_end()?;
                context.op_end = Some(end);
                let region = context.namestring()?;
                let bank = context.namestring()?;
                let mut op = OpInFlight::new_with(
                    Opcode::BankField,
                    vec![Argument::Name(region), Argument::Name(bank)],
                    &[ArgKind::Name, ArgKind::Name],
                    &[ArgKind::TermArg],
                    context.pc(),
                );
                op.end = Some(end);
                context.start_in_flight_op(op);
            }
            Opcode::CreateBitField
            | Opcode::CreateByteField
            | Opcode::CreateWordField
            | Opcode::CreateDWordField
            | Opcode::CreateQWordField => {
                let mut op =
                    OpInFlight::new(opcode, &[ArgKind::TermArg, ArgKind::TermArg, ArgKind::Name], context.pc());
                op.deferring = self.should_defer(context);
                context.start_in_flight_op(op);
            }
            Opcode::CreateField => {
                let mut op = OpInFlight::new(
                    opcode,
                    &[ArgKind::TermArg, ArgKind::TermArg, ArgKind::TermArg, ArgKind::Name],
                    context.pc(),
                );
                op.deferring = self.should_defer(context);
                context.start_in_flight_op(op);
            }
            _ => return Err(AmlError::IllegalOpcode(0)),
        }

        Ok(())
    }

    /// Finish a named op that had to collect operands.
    pub(crate) fn retire_named_op(&self, context: &mut MethodContext, op: OpInFlight) -> Result<ParseStatus, AmlError> {
        match op.op {
            Opcode::Name => {
                let [Argument::Name(name), object] = op.args()? else { return Err(AmlError::UnexpectedResult) };
                let node = self.declare(context, name, ObjectType::Any)?;
                if context.pass == Pass::Execute {
                    self.namespace.write().attach_object(node, object.object()?.clone())?;
                }
            }
            Opcode::OpRegion => {
                let [Argument::Name(name), Argument::Integer(space), base, length] = op.args()? else {
                    return Err(AmlError::UnexpectedResult);
                };
                let space = RegionSpace::from(*space as u8);
                if context.pass == Pass::Declare {
                    self.declare(context, name, ObjectType::OpRegion)?;
                    return Ok(ParseStatus::Continue);
                }

                let region = if op.deferring {
                    let deferred = DeferredArgs {
                        code: context.code.range(op.start, context.pc()),
                        scope: context.current_scope,
                        owner: context.owner,
                        kind: DeferredKind::Region,
                    };
                    OpRegion::deferred(space, deferred)
                } else {
                    let base = self.operand_to_integer(base.object()?)?;
                    let length = self.operand_to_integer(length.object()?)?;
                    OpRegion::new(space, base, length)
                };

                let node = self.declare(context, name, ObjectType::OpRegion)?;
                self.namespace.write().attach_object(node, Object::OpRegion(region).wrap())?;
                self.attach_new_region(node)?;
            }
            Opcode::DataRegion => {
                let [Argument::Name(name), signature, oem_id, oem_table_id] = op.args()? else {
                    return Err(AmlError::UnexpectedResult);
                };
                if context.pass == Pass::Declare {
                    self.declare(context, name, ObjectType::OpRegion)?;
                    return Ok(ParseStatus::Continue);
                }

                let region = if op.deferring {
                    let deferred = DeferredArgs {
                        code: context.code.range(op.start, context.pc()),
                        scope: context.current_scope,
                        owner: context.owner,
                        kind: DeferredKind::DataRegion,
                    };
                    OpRegion::deferred(RegionSpace::DataTable, deferred)
                } else {
                    let signature = self.operand_to_string(signature.object()?)?;
                    let oem_id = self.operand_to_string(oem_id.object()?)?;
                    let oem_table_id = self.operand_to_string(oem_table_id.object()?)?;
                    let (data, base) = self.find_data_table(&signature, &oem_id, &oem_table_id)?;
                    let mut region = OpRegion::new(RegionSpace::DataTable, base, data.len() as u64);
                    region.table = Some(data);
                    region
                };

                let node = self.declare(context, name, ObjectType::OpRegion)?;
                self.namespace.write().attach_object(node, Object::OpRegion(region).wrap())?;
                self.attach_new_region(node)?;
            }
            Opcode::BankField => {
                let end = op.end.ok_or(AmlError::InvalidPkgLength)?;
                let [Argument::Name(region), Argument::Name(bank), bank_value] = op.args()? else {
                    return Err(AmlError::UnexpectedResult);
                };
                if context.pass == Pass::Declare {
                    context.set_pc(end);
                    return Ok(ParseStatus::Continue);
                }

                let bank_value = self.operand_to_integer(bank_value.object()?)?;
                let flags = FieldFlags(context.next()?);
                let (region, bank) = {
                    let namespace = self.namespace.read();
                    let region = namespace.lookup(context.current_scope, region, ObjectType::OpRegion, true)?;
                    let bank = namespace.lookup(context.current_scope, bank, ObjectType::FieldUnit, true)?;
                    (region, bank)
                };
                self.parse_field_list(
                    context,
                    end,
                    flags,
                    FieldUnitKind::Bank { region, bank, bank_value },
                    ObjectType::BankField,
                )?;
            }
            Opcode::CreateBitField
            | Opcode::CreateByteField
            | Opcode::CreateWordField
            | Opcode::CreateDWordField
            | Opcode::CreateQWordField
            | Opcode::CreateField => return self.retire_create_field(context, op),
            _ => return Err(AmlError::IllegalOpcode(0)),
        }

        Ok(ParseStatus::Continue)
    }

    fn retire_create_field(&self, context: &mut MethodContext, op: OpInFlight) -> Result<ParseStatus, AmlError> {
        let kind = match op.op {
            Opcode::CreateBitField => CreateFieldKind::Bit,
            Opcode::CreateByteField => CreateFieldKind::Byte,
            Opcode::CreateWordField => CreateFieldKind::Word,
            Opcode::CreateDWordField => CreateFieldKind::DWord,
            Opcode::CreateQWordField => CreateFieldKind::QWord,
            _ => CreateFieldKind::Arbitrary,
        };
        let name = op.arguments.last().ok_or(AmlError::UnexpectedResult)?.name()?;
        if context.pass == Pass::Declare {
            self.declare(context, name, ObjectType::BufferField)?;
            return Ok(ParseStatus::Continue);
        }

        let field = if op.deferring {
            let end = op.deferred_end.ok_or(AmlError::UnexpectedResult)?;
            BufferField {
                buffer: None,
                bit_index: 0,
                bit_length: 0,
                deferred: Some(DeferredArgs {
                    code: context.code.range(op.start, end),
                    scope: context.current_scope,
                    owner: context.owner,
                    kind: DeferredKind::BufferField(kind),
                }),
            }
        } else {
            let buffer = op.arguments[0].object()?.clone();
            let index = self.operand_to_integer(op.arguments[1].object()?)?;
            let length = match kind {
                CreateFieldKind::Arbitrary => self.operand_to_integer(op.arguments[2].object()?)?,
                _ => 0,
            };
            self.new_buffer_field(buffer, kind, index, length)?
        };

        let node = self.declare(context, name, ObjectType::BufferField)?;
        self.namespace.write().attach_object(node, Object::BufferField(field).wrap())?;
        Ok(ParseStatus::Continue)
    }

    /// Make a buffer field over `buffer`, checking that it fits.
    pub(crate) fn new_buffer_field(
        &self,
        buffer: crate::object::WrappedObject,
        kind: CreateFieldKind,
        index: u64,
        length: u64,
    ) -> Result<BufferField, AmlError> {
        let (bit_index, bit_length) = kind.bits(index, length);
        let buffer_bits = match &*buffer.lock() {
            Object::Buffer(bytes) => bytes.len() * 8,
            other => {
                return Err(AmlError::ObjectNotOfExpectedType { expected: ObjectType::Buffer, got: other.typ() });
            }
        };
        if bit_length == 0 || bit_index.checked_add(bit_length).map_or(true, |end| end > buffer_bits) {
            return Err(AmlError::IndexOutOfBounds);
        }
        Ok(BufferField { buffer: Some(buffer), bit_index, bit_length, deferred: None })
    }

    /// Module-level operands are recorded and evaluated when the object is first used, as they may refer to
    /// objects declared later in the table (or in later tables).
    fn should_defer(&self, context: &MethodContext) -> bool {
        context.pass == Pass::Execute && context.kind != ContextKind::Method
    }

    fn attach_new_region(&self, node: NodeHandle) -> Result<(), AmlError> {
        match self.attach_region(node) {
            // A handler may be installed for the space later
            Ok(()) | Err(AmlError::NoHandlerForRegion(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Create the node for a declaration. During the first pass over a table, nodes are marked as pending so
    /// the second pass can adopt them. Nodes declared by a running method are removed when it returns.
    pub(crate) fn declare(
        &self,
        context: &MethodContext,
        name: &AmlName,
        typ: ObjectType,
    ) -> Result<NodeHandle, AmlError> {
        let override_policy = if self.config.runtime_namespace_override {
            InsertPolicy::OverrideIfFound
        } else {
            InsertPolicy::ErrorIfFound
        };
        let (policy, flags) = match (context.pass, context.kind) {
            (Pass::Declare, _) => {
                let mut flags = NodeFlags::new();
                flags.set_pending(true);
                (InsertPolicy::ErrorIfFound, flags)
            }
            (Pass::Execute, ContextKind::Method) => (override_policy, NodeFlags::temporary()),
            (Pass::Execute, _) => (override_policy, NodeFlags::new()),
        };

        let mut namespace = self.namespace.write();
        let node = namespace.create(context.current_scope, name, typ, context.owner, policy, flags)?;

        // An `External` node upgraded by the first pass must still be adopted by the second
        if context.pass == Pass::Declare {
            let existing = namespace.node(node)?;
            if existing.owner() == context.owner && !existing.flags().is_pending() {
                let mut flags = existing.flags();
                flags.set_pending(true);
                namespace.set_flags(node, flags)?;
            }
        }
        Ok(node)
    }

    fn declare_external(
        &self,
        context: &MethodContext,
        name: &AmlName,
        typ: ObjectType,
        arg_count: u8,
    ) -> Result<(), AmlError> {
        let mut flags = NodeFlags::external();
        if context.kind == ContextKind::Method {
            flags.set_temporary(true);
        }

        let mut namespace = self.namespace.write();
        let node = namespace.create(context.current_scope, name, typ, context.owner, InsertPolicy::OpenIfFound, flags)?;
        let node_info = namespace.node(node)?;
        if !node_info.flags().is_external() || node_info.object().is_some() {
            return Ok(());
        }

        trace!("External declaration of {} ({:?})", name, typ);
        if typ == ObjectType::Method {
            // Calls must parse the right number of arguments, even though the method doesn't exist yet
            let path = namespace.full_path(node)?;
            let stub = Object::native_method(arg_count & 0x7, move |_| Err(AmlError::ObjectDoesNotExist(path.clone())));
            namespace.attach_object(node, stub.wrap())?;
        }
        Ok(())
    }

    fn declare_alias(&self, context: &MethodContext, source: &AmlName, alias: &AmlName) -> Result<(), AmlError> {
        let (target, typ) = {
            let namespace = self.namespace.read();
            let target = namespace.lookup(context.current_scope, source, ObjectType::Any, true)?;
            (target, namespace.typ(target)?)
        };
        let alias_type = if typ == ObjectType::Method { ObjectType::LocalMethodAlias } else { ObjectType::LocalAlias };

        let node = self.declare(context, alias, alias_type)?;
        self.namespace.write().attach_object(node, Object::Alias(target).wrap())?;
        Ok(())
    }

    /// Check that `Scope` can open `node`. Firmware sometimes opens a scope on a data object to declare things
    /// under it; unless configured to be strict, the node is retyped so that it can hold children.
    fn open_scope(&self, context: &MethodContext, node: NodeHandle, name: &AmlName) -> Result<(), AmlError> {
        let typ = self.namespace.read().typ(node)?;
        if typ.is_scope_opening() {
            return Ok(());
        }

        match typ {
            ObjectType::Integer | ObjectType::String | ObjectType::Buffer if !self.config.strict_scope_retyping => {
                if context.pass == Pass::Execute {
                    warn!("Scope opened on {} of type {:?}; retyping it to Any", name, typ);
                }
                let mut namespace = self.namespace.write();
                let mut flags = namespace.node(node)?.flags();
                flags.set_scope_retyped(true);
                namespace.set_flags(node, flags)?;
                namespace.set_type(node, ObjectType::Any)?;
                Ok(())
            }
            _ => {
                if context.pass == Pass::Execute {
                    self.remove_pending_children(context, node)?;
                }
                Err(AmlError::InvalidScopeTarget(name.clone()))
            }
        }
    }

    /// The first pass can open a scope on a `Name` before it has been typed, so the children it declared there
    /// have to go if the second pass refuses the scope.
    fn remove_pending_children(&self, context: &MethodContext, node: NodeHandle) -> Result<(), AmlError> {
        let removed = {
            let mut namespace = self.namespace.write();
            let mut removed = Vec::new();
            for child in namespace.children(node)? {
                let entry = namespace.node(child)?;
                if entry.flags().is_pending() && entry.owner() == context.owner {
                    removed.extend(namespace.remove(child)?);
                }
            }
            removed
        };
        for object in &removed {
            self.detach_region_object(object);
        }
        Ok(())
    }

    /// Create the field units of a field list, which runs until `end`.
    fn parse_field_list(
        &self,
        context: &mut MethodContext,
        end: usize,
        flags: FieldFlags,
        kind: FieldUnitKind,
        typ: ObjectType,
    ) -> Result<(), AmlError> {
        let mut flags = flags;
        let mut bit_index = 0;

        while context.pc() < end {
            match context.peek()? {
                RESERVED_FIELD => {
                    context.next()?;
                    bit_index += context.pkglength()?;
                }
                ACCESS_FIELD => {
                    context.next()?;
                    let access_type = context.next()?;
                    let _access_attrib = context.next()?;
                    flags = flags.with_access_type(access_type);
                }
                CONNECT_FIELD => {
                    context.next()?;
                    if context.peek()? == BUFFER_OP {
                        context.next()?;
                        let buffer_end = context.pkg_end()?;
                        context.set_pc(buffer_end);
                    } else {
                        context.namestring()?;
                    }
                    warn!("Connection fields are not supported; ignoring the connection");
                }
                EXTENDED_ACCESS_FIELD => {
                    context.next()?;
                    let access_type = context.next()?;
                    let _extended_attrib = context.next()?;
                    let _access_length = context.next()?;
                    flags = flags.with_access_type(access_type);
                }
                _ => {
                    let bytes = context.take(4)?;
                    let seg = NameSeg::from_raw([bytes[0], bytes[1], bytes[2], bytes[3]])?;
                    let bit_length = context.pkglength()?;

                    let field = FieldUnit { kind: kind.clone(), flags, bit_index, bit_length };
                    let node = self.declare(context, &AmlName::from_name_seg(seg), typ)?;
                    self.namespace.write().attach_object(node, Object::FieldUnit(field).wrap())?;
                    bit_index += bit_length;
                }
            }
        }

        Ok(())
    }
}

/// Decode the object type byte of an `External` declaration.
fn external_type(typ: u8) -> ObjectType {
    match typ {
        1 => ObjectType::Integer,
        2 => ObjectType::String,
        3 => ObjectType::Buffer,
        4 => ObjectType::Package,
        5 => ObjectType::FieldUnit,
        6 => ObjectType::Device,
        7 => ObjectType::Event,
        8 => ObjectType::Method,
        9 => ObjectType::Mutex,
        10 => ObjectType::OpRegion,
        11 => ObjectType::PowerResource,
        12 => ObjectType::Processor,
        13 => ObjectType::ThermalZone,
        14 => ObjectType::BufferField,
        15 => ObjectType::DdbHandle,
        _ => ObjectType::Any,
    }
}
