use crate::{
    context::{Argument, BlockKind, ContextKind, HeldMutex, Invocation, MethodContext, OpInFlight, ParseStatus, Target},
    namespace::{AmlName, NodeHandle},
    object::{Object, ObjectType, ReferenceKind, ReferenceTarget, WrappedObject},
    opcode::Opcode,
    AmlError,
    Interpreter,
    Operation,
};
use alloc::{format, string::String, vec::Vec};
use core::{cmp::Ordering, str::FromStr};
use log::{error, trace, warn};

const ELSE_OP: u8 = 0xa1;
const END_TAG: u8 = 0x79;

impl Interpreter {
    /// Perform an in-flight op once all of its operands have been collected.
    pub(crate) fn retire_op(&self, context: &mut MethodContext, op: OpInFlight) -> Result<ParseStatus, AmlError> {
        trace!("Retiring op {:?}", op.op);

        if op.failed {
            return self.retire_failed_op(context, op);
        }
        if is_named_op(op.op) {
            return self.retire_named_op(context, op);
        }
        if context.parse_only() {
            return self.retire_parsed_op(context, op);
        }

        match op.op {
            Opcode::If => {
                let [predicate] = op.args()?;
                let predicate = self.operand_to_integer(predicate.object()?)?;
                let end = op.end.ok_or(AmlError::InvalidPkgLength)?;
                if predicate != 0 {
                    context.start_new_block(BlockKind::If, end);
                } else {
                    context.set_pc(end);
                    self.start_else_block(context)?;
                }
            }
            Opcode::While => {
                let [predicate] = op.args()?;
                let predicate = self.operand_to_integer(predicate.object()?)?;
                let end = op.end.ok_or(AmlError::InvalidPkgLength)?;
                if predicate != 0 {
                    if op.iterations >= self.config.max_loop_iterations {
                        return Err(AmlError::LoopLimitExceeded);
                    }
                    context.start_new_block(
                        BlockKind::While { predicate_start: op.start, iterations: op.iterations + 1 },
                        end,
                    );
                } else {
                    context.set_pc(end);
                }
            }
            Opcode::Return => {
                let [value] = op.args()?;
                let value = value.object()?.clone();
                return match context.kind {
                    ContextKind::Method => Ok(ParseStatus::ReturnValue(Some(value))),
                    ContextKind::Table => {
                        warn!("Return in module-level code; stopping execution of the table");
                        Ok(ParseStatus::Terminate)
                    }
                    ContextKind::Deferred => Err(AmlError::ReturnOutsideMethod),
                };
            }
            Opcode::InternalMethodCall => {
                let node = op.node.ok_or(AmlError::NoCurrentOp)?;
                let method = match self.namespace.read().object(node)?.map(|object| object.snapshot()) {
                    Some(Object::Method(method)) => method,
                    Some(other) => {
                        return Err(AmlError::ObjectNotOfExpectedType { expected: ObjectType::Method, got: other.typ() });
                    }
                    None => return Err(AmlError::ObjectDoesNotExist(self.namespace.read().full_path(node)?)),
                };
                let args =
                    op.arguments.iter().map(|argument| argument.object().cloned()).collect::<Result<Vec<_>, _>>()?;
                return Ok(ParseStatus::Pending(Invocation { node, method, args }));
            }
            Opcode::InternalArgumentList => {
                let args =
                    op.arguments.iter().map(|argument| argument.object().cloned()).collect::<Result<Vec<_>, _>>()?;
                return Ok(ParseStatus::ReturnValue(Some(Object::Package(args).wrap())));
            }
            Opcode::Buffer => {
                let [size] = op.args()?;
                let size = self.operand_to_integer(size.object()?)? as usize;
                let end = op.end.ok_or(AmlError::InvalidPkgLength)?;
                let mut bytes = context.take(end.saturating_sub(context.pc()))?;
                if bytes.len() < size {
                    bytes.resize(size, 0);
                }
                context.deliver(Object::Buffer(bytes).wrap())?;
            }
            Opcode::VarPackage => {
                let [num_elements] = op.args()?;
                let num_elements = self.operand_to_integer(num_elements.object()?)? as usize;
                let end = op.end.ok_or(AmlError::InvalidPkgLength)?;
                let mut package = OpInFlight::new(Opcode::Package, &[], context.pc());
                package.num_elements = num_elements;
                context.start_in_flight_op(package);
                context.start_new_block(BlockKind::Package, end);
            }

            Opcode::Store | Opcode::CopyObject => {
                let [value, target] = op.args()?;
                let value = value.object()?.clone();
                if op.op == Opcode::Store {
                    self.store(context, target.target()?, &value)?;
                } else {
                    self.copy_object(context, target.target()?, &value)?;
                }
                context.deliver(value)?;
            }

            Opcode::Add
            | Opcode::Subtract
            | Opcode::Multiply
            | Opcode::ShiftLeft
            | Opcode::ShiftRight
            | Opcode::And
            | Opcode::Nand
            | Opcode::Or
            | Opcode::Nor
            | Opcode::Xor
            | Opcode::Mod => {
                let [left, right, target] = op.args()?;
                let left = self.operand_to_integer(left.object()?)?;
                let right = self.operand_to_integer(right.object()?)?;
                let result = match op.op {
                    Opcode::Add => left.wrapping_add(right),
                    Opcode::Subtract => left.wrapping_sub(right),
                    Opcode::Multiply => left.wrapping_mul(right),
                    Opcode::ShiftLeft => u32::try_from(right).ok().and_then(|shift| left.checked_shl(shift)).unwrap_or(0),
                    Opcode::ShiftRight => {
                        u32::try_from(right).ok().and_then(|shift| left.checked_shr(shift)).unwrap_or(0)
                    }
                    Opcode::And => left & right,
                    Opcode::Nand => !(left & right),
                    Opcode::Or => left | right,
                    Opcode::Nor => !(left | right),
                    Opcode::Xor => left ^ right,
                    _ => left.checked_rem(right).ok_or(AmlError::DivideByZero)?,
                };
                self.store_result(context, target, Object::Integer(self.truncate(result)))?;
            }
            Opcode::Divide => {
                let [dividend, divisor, remainder_target, quotient_target] = op.args()?;
                let dividend = self.operand_to_integer(dividend.object()?)?;
                let divisor = self.operand_to_integer(divisor.object()?)?;
                let quotient = dividend.checked_div(divisor).ok_or(AmlError::DivideByZero)?;
                let remainder = dividend.checked_rem(divisor).ok_or(AmlError::DivideByZero)?;

                self.store(context, remainder_target.target()?, &Object::Integer(remainder).wrap())?;
                self.store_result(context, quotient_target, Object::Integer(quotient))?;
            }
            Opcode::Not | Opcode::FindSetLeftBit | Opcode::FindSetRightBit | Opcode::ToBCD | Opcode::FromBCD => {
                let [operand, target] = op.args()?;
                let operand = self.operand_to_integer(operand.object()?)?;
                let result = match op.op {
                    Opcode::Not => !operand,
                    Opcode::FindSetLeftBit => {
                        if operand == 0 {
                            0
                        } else {
                            64 - operand.leading_zeros() as u64
                        }
                    }
                    Opcode::FindSetRightBit => {
                        if operand == 0 {
                            0
                        } else {
                            operand.trailing_zeros() as u64 + 1
                        }
                    }
                    Opcode::ToBCD => to_bcd(operand)?,
                    _ => from_bcd(operand)?,
                };
                self.store_result(context, target, Object::Integer(self.truncate(result)))?;
            }
            Opcode::Increment | Opcode::Decrement => {
                let [target] = op.args()?;
                let target = target.target()?;
                let value = self.read_target(context, target)?;
                let value = self.operand_to_integer(&value)?;
                let result = if op.op == Opcode::Increment { value.wrapping_add(1) } else { value.wrapping_sub(1) };
                let result = Object::Integer(self.truncate(result)).wrap();
                self.store(context, target, &result)?;
                context.deliver(result)?;
            }

            Opcode::LAnd | Opcode::LOr => {
                let [left, right] = op.args()?;
                let left = self.operand_to_integer(left.object()?)? != 0;
                let right = self.operand_to_integer(right.object()?)? != 0;
                let result = if op.op == Opcode::LAnd { left && right } else { left || right };
                context.deliver(self.boolean(result))?;
            }
            Opcode::LNot => {
                let [operand] = op.args()?;
                let operand = self.operand_to_integer(operand.object()?)?;
                context.deliver(self.boolean(operand == 0))?;
            }
            Opcode::LEqual
            | Opcode::LNotEqual
            | Opcode::LGreater
            | Opcode::LGreaterEqual
            | Opcode::LLess
            | Opcode::LLessEqual => {
                let [left, right] = op.args()?;
                let ordering = self.compare(left.object()?, right.object()?)?;
                let result = match op.op {
                    Opcode::LEqual => ordering == Ordering::Equal,
                    Opcode::LNotEqual => ordering != Ordering::Equal,
                    Opcode::LGreater => ordering == Ordering::Greater,
                    Opcode::LGreaterEqual => ordering != Ordering::Less,
                    Opcode::LLess => ordering == Ordering::Less,
                    _ => ordering != Ordering::Greater,
                };
                context.deliver(self.boolean(result))?;
            }

            Opcode::Concat => {
                let [left, right, target] = op.args()?;
                let result = self.concat(&left.object()?.snapshot(), &right.object()?.snapshot())?;
                self.store_result(context, target, result)?;
            }
            Opcode::ConcatRes => {
                let [left, right, target] = op.args()?;
                let left = self.operand_to_buffer(left.object()?)?;
                let right = self.operand_to_buffer(right.object()?)?;
                let mut result = Vec::with_capacity(left.len() + right.len());
                result.extend_from_slice(strip_end_tag(&left));
                result.extend_from_slice(strip_end_tag(&right));
                result.extend_from_slice(&[END_TAG, 0x00]);
                self.store_result(context, target, Object::Buffer(result))?;
            }
            Opcode::Mid => {
                let [source, index, length, target] = op.args()?;
                let index = self.operand_to_integer(index.object()?)? as usize;
                let length = self.operand_to_integer(length.object()?)? as usize;
                let source = source.object()?.snapshot();
                let result = match source {
                    Object::String(string) => {
                        let bytes = mid(string.as_bytes(), index, length);
                        Object::String(String::from_utf8_lossy(bytes).into_owned())
                    }
                    other => {
                        let bytes = other.to_buffer(self.integer_bytes()).map_err(|_| {
                            AmlError::InvalidOperationOnObject { op: Operation::Mid, typ: other.typ() }
                        })?;
                        Object::Buffer(mid(&bytes, index, length).to_vec())
                    }
                };
                self.store_result(context, target, result)?;
            }
            Opcode::ToBuffer => {
                let [operand, target] = op.args()?;
                let result = self.operand_to_buffer(operand.object()?)?;
                self.store_result(context, target, Object::Buffer(result))?;
            }
            Opcode::ToInteger => {
                let [operand, target] = op.args()?;
                let result = match operand.object()?.snapshot() {
                    Object::String(string) => parse_explicit_integer(&string),
                    other => other.to_integer(self.integer_bytes())?,
                };
                self.store_result(context, target, Object::Integer(self.truncate(result)))?;
            }
            Opcode::ToDecimalString => {
                let [operand, target] = op.args()?;
                let result = match operand.object()?.snapshot() {
                    Object::Integer(value) => format!("{}", value),
                    Object::Buffer(bytes) => {
                        bytes.iter().map(|byte| format!("{}", byte)).collect::<Vec<_>>().join(",")
                    }
                    Object::String(string) => string,
                    other => {
                        return Err(AmlError::InvalidOperationOnObject {
                            op: Operation::ToDecimalString,
                            typ: other.typ(),
                        });
                    }
                };
                self.store_result(context, target, Object::String(result))?;
            }
            Opcode::ToHexString => {
                let [operand, target] = op.args()?;
                let result = self.operand_to_string(operand.object()?)?;
                self.store_result(context, target, Object::String(result))?;
            }
            Opcode::ToString => {
                let [operand, length, target] = op.args()?;
                let length = self.operand_to_integer(length.object()?)?;
                let bytes = self.operand_to_buffer(operand.object()?)?;
                let end = bytes.iter().position(|&byte| byte == 0).unwrap_or(bytes.len());
                let end = if length == self.ones() { end } else { usize::min(end, length as usize) };
                let result = String::from_utf8_lossy(&bytes[0..end]).into_owned();
                self.store_result(context, target, Object::String(result))?;
            }

            Opcode::Index => {
                let [source, index, target] = op.args()?;
                let source = source.object()?.clone();
                let index = self.operand_to_integer(index.object()?)? as usize;
                let reference = match &*source.lock() {
                    Object::Package(elements) => {
                        let element = elements.get(index).ok_or(AmlError::IndexOutOfBounds)?;
                        Object::Reference { kind: ReferenceKind::Index, target: ReferenceTarget::Object(element.clone()) }
                    }
                    Object::Buffer(bytes) if index < bytes.len() => Object::Reference {
                        kind: ReferenceKind::Index,
                        target: ReferenceTarget::BufferIndex { buffer: source.clone(), index },
                    },
                    Object::String(string) if index < string.len() => Object::Reference {
                        kind: ReferenceKind::Index,
                        target: ReferenceTarget::BufferIndex { buffer: source.clone(), index },
                    },
                    Object::Buffer(_) | Object::String(_) => return Err(AmlError::IndexOutOfBounds),
                    other => return Err(AmlError::InvalidOperationOnObject { op: Operation::Index, typ: other.typ() }),
                };
                self.store_result(context, target, reference)?;
            }
            Opcode::RefOf => {
                let [target] = op.args()?;
                let reference = self.reference_to(context, target.target()?)?;
                context.deliver(reference)?;
            }
            Opcode::CondRefOf => {
                let [source, target] = op.args()?;
                let exists = match source.target()? {
                    Target::Null | Target::Name(_) | Target::Debug => false,
                    Target::Local(local) => context.locals[*local as usize].is_some(),
                    Target::Arg(arg) => context.args[*arg as usize].is_some(),
                    Target::Node(_) | Target::Object(_) => true,
                };
                if exists {
                    let reference = self.reference_to(context, source.target()?)?;
                    self.store(context, target.target()?, &reference)?;
                }
                context.deliver(self.boolean(exists))?;
            }
            Opcode::DerefOf => {
                let [operand] = op.args()?;
                let operand = operand.object()?.clone();
                let path = match &*operand.lock() {
                    Object::String(path) => Some(path.clone()),
                    Object::Reference { .. } => None,
                    other => {
                        return Err(AmlError::InvalidOperationOnObject { op: Operation::DerefOf, typ: other.typ() });
                    }
                };
                let value = match path {
                    Some(path) => {
                        let name = AmlName::from_str(&path)?;
                        let node = self.namespace.read().lookup(context.current_scope, &name, ObjectType::Any, true)?;
                        self.evaluate_node_value(node)?
                    }
                    None => self.deref(&operand)?,
                };

                // Names in packages are stored as references, and are resolved when the element is used
                let named = match &*value.lock() {
                    Object::Reference { kind: ReferenceKind::Name, target: ReferenceTarget::Node(node) } => Some(*node),
                    _ => None,
                };
                let value = match named {
                    Some(node) => self.evaluate_node_value(node)?,
                    None => value,
                };
                context.deliver(value)?;
            }
            Opcode::SizeOf => {
                let [target] = op.args()?;
                let mut value = self.read_target(context, target.target()?)?;
                if matches!(&*value.lock(), Object::Reference { .. }) {
                    value = self.deref(&value)?;
                }
                let size = match &*value.lock() {
                    Object::Buffer(bytes) => bytes.len(),
                    Object::String(string) => string.len(),
                    Object::Package(elements) => elements.len(),
                    other => return Err(AmlError::InvalidOperationOnObject { op: Operation::SizeOf, typ: other.typ() }),
                };
                context.deliver(Object::Integer(size as u64).wrap())?;
            }
            Opcode::ObjectType => {
                let [target] = op.args()?;
                let typ = self.target_type(context, target.target()?)?;
                context.deliver(Object::Integer(typ.aml_type_code()).wrap())?;
            }
            Opcode::Match => {
                let [package, first_op, first_object, second_op, second_object, start] = op.args()?;
                let start = self.operand_to_integer(start.object()?)? as usize;
                let elements = match package.object()?.snapshot() {
                    Object::Package(elements) => elements,
                    other => return Err(AmlError::InvalidOperationOnObject { op: Operation::Match, typ: other.typ() }),
                };
                let first = (first_op.integer()?, first_object.object()?);
                let second = (second_op.integer()?, second_object.object()?);

                let mut result = self.ones();
                for (index, element) in elements.iter().enumerate().skip(start) {
                    if self.match_element(element, first)? && self.match_element(element, second)? {
                        result = index as u64;
                        break;
                    }
                }
                context.deliver(Object::Integer(result).wrap())?;
            }

            Opcode::Notify => {
                let [target, value] = op.args()?;
                let node = self.target_node(context, target.target()?)?;
                let value = self.operand_to_integer(value.object()?)?;
                let path = self.namespace.read().full_path(node)?;
                trace!("Notify({}, {:#x})", path, value);
                self.handler.notify(&path, value);
            }
            Opcode::Sleep => {
                let [duration] = op.args()?;
                self.handler.sleep(self.operand_to_integer(duration.object()?)?);
            }
            Opcode::Stall => {
                let [duration] = op.args()?;
                self.handler.stall(self.operand_to_integer(duration.object()?)?);
            }
            Opcode::Acquire => {
                let [target, timeout] = op.args()?;
                let timed_out = self.acquire(context, target.target()?, timeout.integer()? as u16)?;
                context.deliver(self.boolean(timed_out))?;
            }
            Opcode::Release => {
                let [target] = op.args()?;
                self.release(context, target.target()?)?;
            }
            Opcode::Wait => {
                let [target, timeout] = op.args()?;
                let event = self.event_handle(context, target.target()?)?;
                let timeout = self.operand_to_integer(timeout.object()?)?;
                let timed_out = match self.handler.wait_event(event, u16::try_from(timeout).unwrap_or(u16::MAX)) {
                    Ok(()) => false,
                    Err(AmlError::MutexTimeout) => true,
                    Err(err) => return Err(err),
                };
                context.deliver(self.boolean(timed_out))?;
            }
            Opcode::Signal | Opcode::Reset => {
                let [target] = op.args()?;
                let event = self.event_handle(context, target.target()?)?;
                if op.op == Opcode::Signal {
                    self.handler.signal_event(event);
                } else {
                    self.handler.reset_event(event);
                }
            }
            Opcode::Fatal => {
                let [typ, code, arg] = op.args()?;
                let typ = typ.integer()? as u8;
                let code = code.integer()? as u32;
                let arg = self.operand_to_integer(arg.object()?)?;
                error!("Fatal error in AML: type {:#x}, code {:#x}, argument {:#x}", typ, code, arg);
                self.handler.handle_fatal_error(typ, code, arg);
                return Err(AmlError::Fatal { typ, code, arg });
            }

            Opcode::Load => {
                let [Argument::Name(name), target] = op.args()? else { return Err(AmlError::UnexpectedResult) };
                let table = self.load_from_object(context, name)?;
                let handle = Object::Reference { kind: ReferenceKind::Table, target: ReferenceTarget::Table(table) };
                self.store(context, target.target()?, &handle.wrap())?;
                context.deliver(self.boolean(true))?;
            }
            Opcode::LoadTable => {
                let args = op.arguments.iter().map(|argument| argument.object().cloned()).collect::<Result<Vec<_>, _>>()?;
                let handle = self.load_table_op(context, &args)?;
                context.deliver(handle)?;
            }
            Opcode::Unload => {
                let [target] = op.args()?;
                let handle = self.read_target(context, target.target()?)?;
                let table = match &*handle.lock() {
                    Object::Reference { target: ReferenceTarget::Table(table), .. } => *table,
                    other => {
                        return Err(AmlError::ObjectNotOfExpectedType { expected: ObjectType::DdbHandle, got: other.typ() });
                    }
                };
                self.unload_table_locked(table)?;
            }

            other => {
                warn!("Op {:?} can't be performed here", other);
                return Err(AmlError::NoCurrentOp);
            }
        }

        Ok(ParseStatus::Continue)
    }

    /// An op whose operands are only being parsed completes without doing anything, apart from skipping any
    /// package it has.
    fn retire_parsed_op(&self, context: &mut MethodContext, op: OpInFlight) -> Result<ParseStatus, AmlError> {
        match op.op {
            Opcode::If | Opcode::While => {
                if let Some(end) = op.end {
                    context.set_pc(end);
                }
                Ok(ParseStatus::Continue)
            }
            Opcode::Buffer | Opcode::VarPackage => {
                if let Some(end) = op.end {
                    context.set_pc(end);
                }
                context.deliver_placeholder()?;
                Ok(ParseStatus::Continue)
            }
            _ => {
                context.deliver_placeholder()?;
                Ok(ParseStatus::Continue)
            }
        }
    }

    /// Complete an op that an error was recovered from part-way through its operands.
    fn retire_failed_op(&self, context: &mut MethodContext, op: OpInFlight) -> Result<ParseStatus, AmlError> {
        trace!("Skipping failed op {:?}", op.op);
        match op.op {
            Opcode::If | Opcode::While | Opcode::Buffer | Opcode::VarPackage | Opcode::BankField => {
                if let Some(end) = op.end {
                    context.set_pc(end);
                }
                if op.op == Opcode::If && !context.at_block_end() && context.peek()? == ELSE_OP {
                    context.opcode()?;
                    let end = context.pkg_end()?;
                    context.set_pc(end);
                }
            }
            _ => (),
        }
        context.deliver_placeholder()?;
        Ok(ParseStatus::Continue)
    }

    /// After an `If` whose predicate was false, run the `Else` that follows it, if there is one.
    fn start_else_block(&self, context: &mut MethodContext) -> Result<(), AmlError> {
        if context.at_block_end() || context.peek()? != ELSE_OP {
            return Ok(());
        }
        context.opcode()?;
        let end = context.pkg_end()?;
        context.start_new_block(BlockKind::Else, end);
        Ok(())
    }

    /// Store the result of an op to its target operand, and hand it on as the value of the op.
    fn store_result(&self, context: &mut MethodContext, target: &Argument, result: Object) -> Result<(), AmlError> {
        let result = result.wrap();
        self.store(context, target.target()?, &result)?;
        context.deliver(result)
    }

    fn boolean(&self, value: bool) -> WrappedObject {
        Object::Integer(if value { self.ones() } else { 0 }).wrap()
    }

    /// Compare two objects, converting the right-hand side to the type of the left.
    pub(crate) fn compare(&self, left: &WrappedObject, right: &WrappedObject) -> Result<Ordering, AmlError> {
        let left = left.snapshot();
        let right = right.snapshot();
        let integer_bytes = self.integer_bytes();
        match left {
            Object::Integer(left) => Ok(self.truncate(left).cmp(&self.truncate(right.to_integer(integer_bytes)?))),
            Object::String(left) => Ok(left.as_bytes().cmp(right.to_aml_string(integer_bytes)?.as_bytes())),
            Object::Buffer(left) => Ok(left[..].cmp(&right.to_buffer(integer_bytes)?[..])),
            other => Err(AmlError::InvalidOperationOnObject { op: Operation::Compare, typ: other.typ() }),
        }
    }

    fn match_element(&self, element: &WrappedObject, (op, object): (u64, &WrappedObject)) -> Result<bool, AmlError> {
        if op == 0 {
            return Ok(true);
        }
        // Elements that can't be compared never match
        let Ok(ordering) = self.compare(element, object) else { return Ok(false) };
        Ok(match op {
            1 => ordering == Ordering::Equal,
            2 => ordering != Ordering::Greater,
            3 => ordering == Ordering::Less,
            4 => ordering != Ordering::Less,
            5 => ordering == Ordering::Greater,
            _ => return Err(AmlError::InvalidArgument),
        })
    }

    fn concat(&self, left: &Object, right: &Object) -> Result<Object, AmlError> {
        let integer_bytes = self.integer_bytes();
        match left {
            Object::Integer(left) => {
                let right = self.truncate(right.to_integer(integer_bytes)?);
                let mut bytes = left.to_le_bytes()[0..integer_bytes].to_vec();
                bytes.extend_from_slice(&right.to_le_bytes()[0..integer_bytes]);
                Ok(Object::Buffer(bytes))
            }
            Object::String(left) => {
                let mut string = left.clone();
                string.push_str(&right.to_aml_string(integer_bytes)?);
                Ok(Object::String(string))
            }
            Object::Buffer(left) => {
                let mut bytes = left.clone();
                bytes.extend_from_slice(&right.to_buffer(integer_bytes)?);
                Ok(Object::Buffer(bytes))
            }
            other => Err(AmlError::InvalidOperationOnObject { op: Operation::Concat, typ: other.typ() }),
        }
    }

    /// Find the namespace node a target refers to, following references held by locals and arguments.
    fn target_node(&self, context: &MethodContext, target: &Target) -> Result<NodeHandle, AmlError> {
        let object = match target {
            Target::Node(node) => return Ok(*node),
            Target::Local(local) => self.read_local(context, *local)?,
            Target::Arg(arg) => self.read_arg(context, *arg)?,
            Target::Object(object) => object.clone(),
            _ => return Err(AmlError::InvalidArgument),
        };
        let object = object.lock();
        match &*object {
            Object::Reference { target: ReferenceTarget::Node(node), .. } => Ok(*node),
            _ => Err(AmlError::InvalidReference),
        }
    }

    /// The object a `Mutex` or `Event` operand refers to.
    fn sync_object(&self, context: &MethodContext, target: &Target) -> Result<WrappedObject, AmlError> {
        if let Target::Object(object) = target {
            if matches!(&*object.lock(), Object::Mutex { .. } | Object::Event(_)) {
                return Ok(object.clone());
            }
        }
        let node = self.target_node(context, target)?;
        let namespace = self.namespace.read();
        match namespace.object(node)? {
            Some(object) => Ok(object),
            None => Err(AmlError::ObjectDoesNotExist(namespace.full_path(node)?)),
        }
    }

    fn event_handle(&self, context: &MethodContext, target: &Target) -> Result<crate::Handle, AmlError> {
        let object = self.sync_object(context, target)?;
        let object = object.lock();
        match &*object {
            Object::Event(event) => Ok(*event),
            other => Err(AmlError::ObjectNotOfExpectedType { expected: ObjectType::Event, got: other.typ() }),
        }
    }

    /// Acquire a mutex for the current context. Returns whether the acquisition timed out.
    fn acquire(&self, context: &mut MethodContext, target: &Target, timeout: u16) -> Result<bool, AmlError> {
        let object = self.sync_object(context, target)?;
        let (mutex, sync_level) = match &*object.lock() {
            Object::Mutex { mutex, sync_level } => (*mutex, *sync_level),
            other => return Err(AmlError::ObjectNotOfExpectedType { expected: ObjectType::Mutex, got: other.typ() }),
        };

        if let Some(held) = context.held_mutexes.iter_mut().find(|held| held.object.ptr_eq(&object)) {
            held.count += 1;
            return Ok(false);
        }
        if sync_level < context.current_sync_level() {
            warn!(
                "Acquire of mutex with sync level {} while at sync level {}",
                sync_level,
                context.current_sync_level()
            );
            return Err(AmlError::MutexSyncLevelViolation);
        }

        match self.handler.acquire(mutex, timeout) {
            Ok(()) => {
                context.held_mutexes.push(HeldMutex { object, mutex, sync_level, count: 1 });
                Ok(false)
            }
            Err(AmlError::MutexTimeout) => Ok(true),
            Err(err) => Err(err),
        }
    }

    fn release(&self, context: &mut MethodContext, target: &Target) -> Result<(), AmlError> {
        let object = self.sync_object(context, target)?;
        let index = context
            .held_mutexes
            .iter()
            .position(|held| held.object.ptr_eq(&object))
            .ok_or(AmlError::MutexNotAcquired)?;

        // Mutexes must be released in the reverse order of their sync levels
        let sync_level = context.held_mutexes[index].sync_level;
        let highest_other = context
            .held_mutexes
            .iter()
            .enumerate()
            .filter(|&(other, _)| other != index)
            .map(|(_, held)| held.sync_level)
            .max();
        if highest_other.is_some_and(|highest| highest > sync_level) {
            return Err(AmlError::MutexSyncLevelViolation);
        }

        let held = &mut context.held_mutexes[index];
        held.count -= 1;
        if held.count == 0 {
            let held = context.held_mutexes.remove(index);
            self.handler.release(held.mutex);
        }
        Ok(())
    }
}

fn is_named_op(op: Opcode) -> bool {
    matches!(
        op,
        Opcode::Name
            | Opcode::OpRegion
            | Opcode::DataRegion
            | Opcode::BankField
            | Opcode::CreateBitField
            | Opcode::CreateByteField
            | Opcode::CreateWordField
            | Opcode::CreateDWordField
            | Opcode::CreateQWordField
            | Opcode::CreateField
    )
}

fn mid(bytes: &[u8], index: usize, length: usize) -> &[u8] {
    if index >= bytes.len() {
        return &[];
    }
    let end = index.saturating_add(length).min(bytes.len());
    &bytes[index..end]
}

/// Remove the end tag (and its checksum byte) from a resource template.
fn strip_end_tag(bytes: &[u8]) -> &[u8] {
    match bytes.len() {
        length if length >= 2 && bytes[length - 2] == END_TAG => &bytes[..(length - 2)],
        _ => bytes,
    }
}

/// `ToInteger` on a string accepts both decimal and `0x`-prefixed hexadecimal.
fn parse_explicit_integer(string: &str) -> u64 {
    let trimmed = string.trim_start();
    match trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        Some(hex) => hex.chars().map_while(|c| c.to_digit(16)).fold(0u64, |value, digit| (value << 4) | digit as u64),
        None => trimmed
            .chars()
            .map_while(|c| c.to_digit(10))
            .fold(0u64, |value, digit| value.wrapping_mul(10).wrapping_add(digit as u64)),
    }
}

fn to_bcd(value: u64) -> Result<u64, AmlError> {
    let mut value = value;
    let mut result = 0u64;
    let mut shift = 0;
    while value != 0 {
        if shift >= 64 {
            return Err(AmlError::InvalidArgument);
        }
        result |= (value % 10) << shift;
        value /= 10;
        shift += 4;
    }
    Ok(result)
}

fn from_bcd(value: u64) -> Result<u64, AmlError> {
    let mut result = 0u64;
    for nibble in (0..16).rev().map(|i| (value >> (i * 4)) & 0xf) {
        if nibble > 9 {
            return Err(AmlError::InvalidArgument);
        }
        result = result * 10 + nibble;
    }
    Ok(result)
}
