use crate::{
    context::{MethodContext, Target},
    namespace::NodeHandle,
    object::{
        read_buffer_field,
        write_buffer_field,
        BufferField,
        DeferredKind,
        Object,
        ObjectType,
        ReferenceKind,
        ReferenceTarget,
        WrappedObject,
    },
    AmlError,
    Interpreter,
    Operation,
};
use alloc::{string::String, vec::Vec};
use log::{info, trace};

impl Interpreter {
    /// Get the current value of the object attached to `node`. Fields are read from their region, and nodes
    /// that don't hold data (devices, mutexes, regions and the like) produce a reference to themselves.
    pub(crate) fn evaluate_node_value(&self, node: NodeHandle) -> Result<WrappedObject, AmlError> {
        let object = {
            let namespace = self.namespace.read();
            let object = namespace.node(node).map_err(stale_to_not_exist)?.object().cloned();
            match object {
                Some(object) => object,
                None => return Err(AmlError::ObjectDoesNotExist(namespace.full_path(node)?)),
            }
        };

        let field = match &*object.lock() {
            Object::FieldUnit(field) => Some(field.clone()),
            Object::BufferField(_) => None,
            Object::Device
            | Object::Event(_)
            | Object::Mutex { .. }
            | Object::OpRegion(_)
            | Object::PowerResource { .. }
            | Object::Processor { .. }
            | Object::ThermalZone => {
                return Ok(Object::Reference { kind: ReferenceKind::Name, target: ReferenceTarget::Node(node) }.wrap());
            }
            _ => return Ok(object.clone()),
        };

        match field {
            Some(field) => Ok(self.read_field(&field)?.wrap()),
            None => Ok(self.read_buffer_field_object(&object)?.wrap()),
        }
    }

    /// Evaluate the recorded operands of a module-level `Create*Field`, if that hasn't happened yet, and
    /// return the resolved field.
    pub(crate) fn resolve_buffer_field(&self, object: &WrappedObject) -> Result<BufferField, AmlError> {
        let (field, deferred) = match &*object.lock() {
            Object::BufferField(field) => (field.clone(), field.deferred.clone()),
            other => {
                return Err(AmlError::ObjectNotOfExpectedType { expected: ObjectType::BufferField, got: other.typ() });
            }
        };
        let Some(deferred) = deferred else { return Ok(field) };
        let DeferredKind::BufferField(kind) = deferred.kind else { return Err(AmlError::InvalidArgument) };

        let num_args = if kind == crate::object::CreateFieldKind::Arbitrary { 3 } else { 2 };
        let args = self.execute_deferred(&deferred, num_args)?;
        let index = self.operand_to_integer(&args[1])?;
        let length = if num_args == 3 { self.operand_to_integer(&args[2])? } else { 0 };
        let resolved = self.new_buffer_field(args[0].clone(), kind, index, length)?;

        trace!("Resolved deferred buffer field: bit {} length {}", resolved.bit_index, resolved.bit_length);
        *object.lock() = Object::BufferField(resolved.clone());
        Ok(resolved)
    }

    fn read_buffer_field_object(&self, object: &WrappedObject) -> Result<Object, AmlError> {
        let field = self.resolve_buffer_field(object)?;
        let buffer = field.buffer.ok_or(AmlError::InvalidReference)?;
        let buffer = buffer.lock();
        read_buffer_field(buffer.as_buffer()?, field.bit_index, field.bit_length, self.integer_bytes())
    }

    fn write_buffer_field_object(&self, object: &WrappedObject, value: &Object) -> Result<(), AmlError> {
        let field = self.resolve_buffer_field(object)?;
        let data = match value {
            Object::Integer(value) => value.to_le_bytes()[0..self.integer_bytes()].to_vec(),
            Object::Buffer(bytes) => bytes.clone(),
            Object::String(string) => string.as_bytes().to_vec(),
            other => {
                return Err(AmlError::InvalidOperationOnObject { op: Operation::WriteField, typ: other.typ() });
            }
        };

        let buffer = field.buffer.ok_or(AmlError::InvalidReference)?;
        let mut buffer = buffer.lock();
        match &mut *buffer {
            Object::Buffer(bytes) => write_buffer_field(bytes, field.bit_index, field.bit_length, &data),
            other => Err(AmlError::ObjectNotOfExpectedType { expected: ObjectType::Buffer, got: other.typ() }),
        }
    }

    /// Read the object a `SuperName` operand refers to. Arguments holding a reference are read through.
    pub(crate) fn read_target(&self, context: &MethodContext, target: &Target) -> Result<WrappedObject, AmlError> {
        match target {
            Target::Null | Target::Name(_) => Err(AmlError::InvalidArgument),
            Target::Debug => Ok(Object::Debug.wrap()),
            Target::Local(local) => self.read_local(context, *local),
            Target::Arg(arg) => {
                let value = self.read_arg(context, *arg)?;
                let is_reference = matches!(
                    &*value.lock(),
                    Object::Reference { kind: ReferenceKind::RefOf | ReferenceKind::Name | ReferenceKind::Index, .. }
                );
                if is_reference {
                    self.deref(&value)
                } else {
                    Ok(value)
                }
            }
            Target::Node(node) => self.evaluate_node_value(*node),
            Target::Object(object) => {
                let is_index = matches!(&*object.lock(), Object::Reference { kind: ReferenceKind::Index, .. });
                if is_index {
                    self.deref(object)
                } else {
                    Ok(object.clone())
                }
            }
        }
    }

    /// Follow a reference to the object it refers to. This is `DerefOf`, except that strings are not looked up
    /// as names.
    pub(crate) fn deref(&self, reference: &WrappedObject) -> Result<WrappedObject, AmlError> {
        let target = match &*reference.lock() {
            Object::Reference { target, .. } => target.clone(),
            _ => return Err(AmlError::InvalidReference),
        };

        match target {
            ReferenceTarget::Node(node) => self.evaluate_node_value(node),
            ReferenceTarget::Object(object) => Ok(object),
            ReferenceTarget::BufferIndex { buffer, index } => {
                let byte = match &*buffer.lock() {
                    Object::Buffer(bytes) => bytes.get(index).copied(),
                    Object::String(string) => string.as_bytes().get(index).copied(),
                    _ => None,
                };
                Ok(Object::Integer(byte.ok_or(AmlError::IndexOutOfBounds)? as u64).wrap())
            }
            ReferenceTarget::Table(_) => Err(AmlError::InvalidReference),
        }
    }

    /// The `ObjectType` of the thing a target refers to, without reading fields.
    pub(crate) fn target_type(&self, context: &MethodContext, target: &Target) -> Result<ObjectType, AmlError> {
        let object = match target {
            Target::Node(node) => return self.namespace.read().typ(*node).map_err(stale_to_not_exist),
            Target::Local(local) => self.read_local(context, *local)?,
            Target::Arg(arg) => self.read_arg(context, *arg)?,
            Target::Object(object) => object.clone(),
            Target::Debug => return Ok(ObjectType::Debug),
            Target::Null | Target::Name(_) => return Err(AmlError::InvalidArgument),
        };

        let referenced = match &*object.lock() {
            Object::Reference { kind: ReferenceKind::Table, .. } => return Ok(ObjectType::DdbHandle),
            Object::Reference { target, .. } => target.clone(),
            other => return Ok(other.typ()),
        };
        match referenced {
            ReferenceTarget::Node(node) => self.namespace.read().typ(node).map_err(stale_to_not_exist),
            ReferenceTarget::Object(object) => Ok(object.lock().typ()),
            ReferenceTarget::BufferIndex { .. } => Ok(ObjectType::Integer),
            ReferenceTarget::Table(_) => Ok(ObjectType::DdbHandle),
        }
    }

    /// Store `value` into `target`, converting it to the type of the target where the target has a fixed type
    /// (named data objects, fields, and buffer fields). Locals and arguments take the value as-is.
    pub(crate) fn store(
        &self,
        context: &mut MethodContext,
        target: &Target,
        value: &WrappedObject,
    ) -> Result<(), AmlError> {
        match target {
            Target::Null => Ok(()),
            Target::Debug => {
                info!("[AML Debug] {}", value.snapshot());
                Ok(())
            }
            Target::Name(name) => Err(AmlError::ObjectDoesNotExist(name.clone())),
            Target::Local(local) => {
                let copy = value.deep_copy().snapshot();
                match &context.locals[*local as usize] {
                    // Written in place, so references made by `RefOf(LocalX)` see the new value
                    Some(existing) => *existing.lock() = copy,
                    None => context.locals[*local as usize] = Some(copy.wrap()),
                }
                Ok(())
            }
            Target::Arg(arg) => {
                let current = context.args[*arg as usize].clone();
                if let Some(current) = current {
                    let referenced = match &*current.lock() {
                        Object::Reference { kind: ReferenceKind::RefOf | ReferenceKind::Name, target } => {
                            Some(target.clone())
                        }
                        _ => None,
                    };
                    if let Some(referenced) = referenced {
                        return self.store_through(referenced, value);
                    }
                }
                context.args[*arg as usize] = Some(value.deep_copy());
                Ok(())
            }
            Target::Node(node) => self.store_to_node(*node, value),
            Target::Object(object) => {
                let referenced = match &*object.lock() {
                    Object::Reference { kind: ReferenceKind::Index | ReferenceKind::RefOf, target } => {
                        Some(target.clone())
                    }
                    _ => None,
                };
                match referenced {
                    Some(referenced) => self.store_through(referenced, value),
                    None => self.store_to_object(object, &value.snapshot()),
                }
            }
        }
    }

    fn store_through(&self, target: ReferenceTarget, value: &WrappedObject) -> Result<(), AmlError> {
        match target {
            ReferenceTarget::Node(node) => self.store_to_node(node, value),
            ReferenceTarget::Object(object) => {
                // Package elements and referenced locals are replaced, rather than converted
                let copy = value.deep_copy().snapshot();
                *object.lock() = copy;
                Ok(())
            }
            ReferenceTarget::BufferIndex { buffer, index } => {
                let byte = self.operand_to_integer(value)? as u8;
                match &mut *buffer.lock() {
                    Object::Buffer(bytes) => {
                        *bytes.get_mut(index).ok_or(AmlError::IndexOutOfBounds)? = byte;
                        Ok(())
                    }
                    Object::String(string) => {
                        let mut bytes = core::mem::take(string).into_bytes();
                        let result = match bytes.get_mut(index) {
                            Some(existing) => {
                                *existing = byte;
                                Ok(())
                            }
                            None => Err(AmlError::IndexOutOfBounds),
                        };
                        *string = String::from_utf8_lossy(&bytes).into_owned();
                        result
                    }
                    other => Err(AmlError::ObjectNotOfExpectedType { expected: ObjectType::Buffer, got: other.typ() }),
                }
            }
            ReferenceTarget::Table(_) => Err(AmlError::InvalidReference),
        }
    }

    pub(crate) fn store_to_node(&self, node: NodeHandle, value: &WrappedObject) -> Result<(), AmlError> {
        let object = self.namespace.read().node(node).map_err(stale_to_not_exist)?.object().cloned();
        match object {
            Some(object) => self.store_to_object(&object, &value.snapshot()),
            None => self.namespace.write().attach_object(node, value.deep_copy()),
        }
    }

    /// Store into an object with implicit conversion to its current type.
    fn store_to_object(&self, object: &WrappedObject, value: &Object) -> Result<(), AmlError> {
        let field = match &*object.lock() {
            Object::FieldUnit(field) => Some(field.clone()),
            _ => None,
        };
        if let Some(field) = field {
            return self.write_field(&field, value);
        }
        if matches!(&*object.lock(), Object::BufferField(_)) {
            return self.write_buffer_field_object(object, value);
        }

        let integer_bytes = self.integer_bytes();
        let mut target = object.lock();
        match &mut *target {
            Object::Integer(existing) => *existing = self.truncate(value.to_integer(integer_bytes)?),
            Object::String(existing) => *existing = value.to_aml_string(integer_bytes)?,
            Object::Buffer(existing) => {
                // The target keeps its length: the new contents are truncated or zero-extended
                let bytes = value.to_buffer(integer_bytes)?;
                let length = usize::min(existing.len(), bytes.len());
                existing.fill(0);
                existing[0..length].copy_from_slice(&bytes[0..length]);
            }
            Object::Method(_)
            | Object::Device
            | Object::Event(_)
            | Object::Mutex { .. }
            | Object::OpRegion(_)
            | Object::PowerResource { .. }
            | Object::Processor { .. }
            | Object::ThermalZone => {
                return Err(AmlError::InvalidOperationOnObject { op: Operation::Store, typ: target.typ() });
            }
            other => {
                *other = match value {
                    Object::Package(elements) => {
                        Object::Package(elements.iter().map(|element| element.deep_copy()).collect())
                    }
                    value => value.clone(),
                }
            }
        }
        Ok(())
    }

    /// `CopyObject`: like `Store`, but the target takes the type of the value rather than converting it.
    pub(crate) fn copy_object(
        &self,
        context: &mut MethodContext,
        target: &Target,
        value: &WrappedObject,
    ) -> Result<(), AmlError> {
        match target {
            Target::Node(node) => {
                let object = self.namespace.read().node(*node).map_err(stale_to_not_exist)?.object().cloned();
                let is_field = object
                    .as_ref()
                    .is_some_and(|object| matches!(&*object.lock(), Object::FieldUnit(_) | Object::BufferField(_)));
                if is_field {
                    return self.store_to_node(*node, value);
                }
                self.namespace.write().attach_object(*node, value.deep_copy())
            }
            Target::Arg(arg) => {
                context.args[*arg as usize] = Some(value.deep_copy());
                Ok(())
            }
            Target::Object(object) => {
                let copy = value.deep_copy().snapshot();
                *object.lock() = copy;
                Ok(())
            }
            other => self.store(context, other, value),
        }
    }

    /// Create a reference to the object a target refers to (`RefOf`).
    pub(crate) fn reference_to(&self, context: &mut MethodContext, target: &Target) -> Result<WrappedObject, AmlError> {
        let target = match target {
            Target::Node(node) => ReferenceTarget::Node(*node),
            Target::Local(local) => {
                let slot = &mut context.locals[*local as usize];
                ReferenceTarget::Object(slot.get_or_insert_with(|| Object::Uninitialized.wrap()).clone())
            }
            Target::Arg(arg) => {
                let slot = &mut context.args[*arg as usize];
                let object = slot.get_or_insert_with(|| Object::Uninitialized.wrap()).clone();
                if matches!(&*object.lock(), Object::Reference { .. }) {
                    return Ok(object.clone());
                }
                ReferenceTarget::Object(object)
            }
            Target::Object(object) => {
                if matches!(&*object.lock(), Object::Reference { .. }) {
                    return Ok(object.clone());
                }
                ReferenceTarget::Object(object.clone())
            }
            Target::Debug | Target::Null | Target::Name(_) => return Err(AmlError::InvalidReference),
        };
        Ok(Object::Reference { kind: ReferenceKind::RefOf, target }.wrap())
    }

    pub(crate) fn operand_to_integer(&self, operand: &WrappedObject) -> Result<u64, AmlError> {
        let object = operand.lock();
        match &*object {
            Object::Integer(_) | Object::String(_) | Object::Buffer(_) => {
                Ok(self.truncate(object.to_integer(self.integer_bytes())?))
            }
            other => Err(AmlError::ObjectNotOfExpectedType { expected: ObjectType::Integer, got: other.typ() }),
        }
    }

    pub(crate) fn operand_to_string(&self, operand: &WrappedObject) -> Result<String, AmlError> {
        operand.lock().to_aml_string(self.integer_bytes())
    }

    pub(crate) fn operand_to_buffer(&self, operand: &WrappedObject) -> Result<Vec<u8>, AmlError> {
        operand.lock().to_buffer(self.integer_bytes())
    }

    /// Truncate an integer to the width of integers in the loaded tables.
    pub(crate) fn truncate(&self, value: u64) -> u64 {
        value & self.ones()
    }
}

/// References to nodes that have since been removed are reported as no longer existing.
fn stale_to_not_exist(err: AmlError) -> AmlError {
    match err {
        AmlError::StaleHandle => AmlError::NotExist,
        other => other,
    }
}
