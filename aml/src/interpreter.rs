use crate::{
    context::{
        term_args,
        ArgKind,
        Argument,
        BlockKind,
        ContextKind,
        Invocation,
        MethodContext,
        OpInFlight,
        ParseStatus,
        Pass,
        Target,
    },
    namespace::{AmlName, NodeHandle},
    object::{MethodCode, Object, ObjectType, ReferenceKind, ReferenceTarget, WrappedObject},
    opcode::Opcode,
    AmlError,
    Interpreter,
};
use alloc::{vec, vec::Vec};
use log::{trace, warn};

/// The value produced by the `Revision` opcode.
pub(crate) const INTERPRETER_REVISION: u64 = 1;

impl Interpreter {
    /*
     * This is the main loop that executes AML. Every op is handled at the top level of the loop, and method
     * invocations push a new context rather than recursing, so deeply-nested AML can't exhaust the Rust stack.
     *
     * Worked example: AddOp TermArg TermArg Target
     * - We go round the loop 4 times to interpret this.
     * - We encounter the AddOp. We add a new in-flight operation expecting 3 operands.
     * - We go round again and find some sort of TermArg. This may create new in-flight ops which we then go
     *   round again to complete. Once they're finished, their result is added to the AddOp's operands.
     * - Once all 3 operands are there, the AddOp is retired before we move on in the stream.
     */
    pub(crate) fn run(&self, context: MethodContext) -> Result<Option<WrappedObject>, AmlError> {
        let mut stack = vec![context];

        loop {
            let Some(context) = stack.last_mut() else { return Ok(None) };
            let status = self.step(context).and_then(|status| match status {
                ParseStatus::SkipDepth(depth) => {
                    for _ in 0..depth {
                        context.end_block()?;
                    }
                    Ok(ParseStatus::Continue)
                }
                other => Ok(other),
            });

            match status {
                Ok(ParseStatus::Continue) | Ok(ParseStatus::SkipDepth(_)) => (),
                Ok(ParseStatus::Pending(invocation)) => {
                    if let Err(err) = self.invoke(&mut stack, invocation) {
                        self.unwind(&mut stack, err)?;
                    }
                }
                Ok(ParseStatus::ReturnValue(value)) => {
                    if let Some(finished) = stack.pop() {
                        self.finish_context(finished);
                    }
                    let Some(caller) = stack.last_mut() else { return Ok(value) };
                    let delivered = match value {
                        Some(value) => caller.deliver(value),
                        None if caller.wants_result() => Err(AmlError::NoReturnValue),
                        None => Ok(()),
                    };
                    if let Err(err) = delivered {
                        self.unwind(&mut stack, err)?;
                    }
                }
                Ok(ParseStatus::Terminate) => {
                    if let Some(finished) = stack.pop() {
                        self.finish_context(finished);
                    }
                    if stack.is_empty() {
                        return Ok(None);
                    }
                }
                Err(err) => self.unwind(&mut stack, err)?,
            }
        }
    }

    fn invoke(&self, stack: &mut Vec<MethodContext>, invocation: Invocation) -> Result<(), AmlError> {
        if stack.len() >= self.config.max_call_depth {
            return Err(AmlError::MethodDepthExceeded);
        }
        let caller = stack.last_mut().ok_or(AmlError::NoCurrentOp)?;

        match invocation.method.code {
            MethodCode::Native(ref method) => {
                let result = method(&invocation.args)?;
                caller.deliver(result)
            }
            MethodCode::Aml(ref code) => {
                let owner = self.owner_ids.lock().allocate()?;
                let mut context =
                    MethodContext::new(ContextKind::Method, Pass::Execute, code.clone(), invocation.node, owner);
                context.method = Some(invocation.node);
                context.sync_floor = u8::max(caller.current_sync_level(), invocation.method.flags.sync_level());

                let expected = invocation.method.flags.arg_count();
                if invocation.args.len() > expected {
                    warn!("Method invoked with {} arguments, but only takes {}", invocation.args.len(), expected);
                }
                for (slot, arg) in context.args.iter_mut().zip(invocation.args.into_iter().take(expected)) {
                    *slot = Some(arg);
                }

                trace!("Invoking method {:?} (owner {:?})", self.namespace.read().full_path(invocation.node), owner);
                stack.push(context);
                Ok(())
            }
        }
    }

    /// Clean up after a context that has finished, successfully or not. Mutexes it still holds are released,
    /// and the namespace nodes created by a method invocation are removed.
    pub(crate) fn finish_context(&self, mut context: MethodContext) {
        for held in context.held_mutexes.drain(..) {
            warn!("Method exited while still holding a mutex (sync level {}); releasing it", held.sync_level);
            self.handler.release(held.mutex);
        }

        if context.kind == ContextKind::Method {
            let removed = self.namespace.write().remove_by_owner(context.owner);
            for object in &removed {
                self.detach_region_object(object);
            }
            if let Err(err) = self.owner_ids.lock().release(context.owner) {
                warn!("Failed to release owner id {:?}: {:?}", context.owner, err);
            }
        }
    }

    /// Propagate an error up the call stack. Module-level code recovers by skipping past the failing op;
    /// everything else is aborted.
    fn unwind(&self, stack: &mut Vec<MethodContext>, err: AmlError) -> Result<(), AmlError> {
        loop {
            let Some(context) = stack.last_mut() else { return Err(err) };
            if context.kind == ContextKind::Table && is_recoverable(&err) {
                return self.recover(context, err);
            }

            if let Some(finished) = stack.pop() {
                self.finish_context(finished);
            }
            if stack.is_empty() {
                return Err(err);
            }
        }
    }

    fn recover(&self, context: &mut MethodContext, err: AmlError) -> Result<(), AmlError> {
        warn!("Error in module-level AML at offset {:#x}, skipping: {:?}", context.pc(), err);

        if let AmlError::IllegalOpcode(_) = err {
            // There's no way to find the end of an op we don't understand
            let end = context.current_block.end;
            context.set_pc(end);
            context.in_flight.truncate(context.current_block.in_flight_base);
            return Ok(());
        }

        if let Some(end) = context.op_end.take() {
            if end > context.pc() && end <= context.current_block.end {
                context.set_pc(end);
            }
        }
        if context.wants_result() {
            context.fail_block_ops();
            context.deliver_placeholder()?;
        }
        Ok(())
    }

    pub(crate) fn step(&self, context: &mut MethodContext) -> Result<ParseStatus, AmlError> {
        /*
         * First, see if we've gathered enough arguments to complete the top in-flight operation.
         */
        if let Some(op) = context.take_ready_op() {
            context.op_end = op.end;
            return self.retire_op(context, op);
        }

        if context.at_block_end() {
            return self.finish_block(context);
        }

        /*
         * Some operands are encoded inline, rather than as another op.
         */
        match context.next_kind() {
            Some(ArgKind::Name) => {
                let deferring_op = context.in_flight.last().is_some_and(|op| op.deferring && op.deferred_end.is_none());
                if deferring_op {
                    let pc = context.pc();
                    context.last_op()?.deferred_end = Some(pc);
                }
                let name = context.namestring()?;
                context.last_op()?.arguments.push(Argument::Name(name));
                return Ok(ParseStatus::Continue);
            }
            Some(ArgKind::Byte) => {
                let value = context.next()?;
                context.last_op()?.arguments.push(Argument::Integer(value as u64));
                return Ok(ParseStatus::Continue);
            }
            Some(ArgKind::Word) => {
                let value = context.next_u16()?;
                context.last_op()?.arguments.push(Argument::Integer(value as u64));
                return Ok(ParseStatus::Continue);
            }
            Some(ArgKind::DWord) => {
                let value = context.next_u32()?;
                context.last_op()?.arguments.push(Argument::Integer(value as u64));
                return Ok(ParseStatus::Continue);
            }
            _ => (),
        }

        self.dispatch(context)
    }

    /// We've reached the end of the current block. What we should do about this depends on what type of block
    /// it was.
    fn finish_block(&self, context: &mut MethodContext) -> Result<ParseStatus, AmlError> {
        match context.current_block.kind {
            BlockKind::Normal => match context.kind {
                ContextKind::Table => Ok(ParseStatus::Terminate),
                ContextKind::Method => Ok(ParseStatus::ReturnValue(self.implicit_return(context))),
                ContextKind::Deferred => Err(AmlError::RunOutOfStream),
            },
            BlockKind::Scope { .. } | BlockKind::If | BlockKind::Else => {
                context.end_block()?;
                Ok(ParseStatus::Continue)
            }
            BlockKind::Package => {
                let package_op = context.in_flight.pop().ok_or(AmlError::NoCurrentOp)?;
                context.end_block()?;

                let mut elements = Vec::with_capacity(package_op.num_elements);
                for argument in package_op.arguments {
                    elements.push(argument.object()?.clone());
                }
                if elements.len() > package_op.num_elements {
                    warn!(
                        "Package declares {} elements but initializes {}; truncating",
                        package_op.num_elements,
                        elements.len()
                    );
                    elements.truncate(package_op.num_elements);
                }
                while elements.len() < package_op.num_elements {
                    // Each uninitialized element must be a distinct object
                    elements.push(Object::Uninitialized.wrap());
                }

                context.deliver(Object::Package(elements).wrap())?;
                Ok(ParseStatus::Continue)
            }
            BlockKind::While { predicate_start, iterations } => {
                let finished = context.end_block()?;
                context.set_pc(predicate_start);
                let mut op = OpInFlight::new(Opcode::While, &[ArgKind::TermArg], predicate_start);
                op.end = Some(finished.end);
                op.iterations = iterations;
                context.start_in_flight_op(op);
                Ok(ParseStatus::Continue)
            }
        }
    }

    fn implicit_return(&self, context: &mut MethodContext) -> Option<WrappedObject> {
        if self.config.enable_interpreter_slack {
            if let Some(result) = context.last_result.take() {
                return Some(result);
            }
        }
        if self.config.implicit_return {
            Some(Object::Integer(0).wrap())
        } else {
            None
        }
    }

    /// Now that we've retired as many in-flight operations as we have arguments for, move forward in the AML
    /// stream. This consumes the next op's encoding and sets things up to collect its operands, but (other than
    /// for simple data objects) doesn't perform it.
    fn dispatch(&self, context: &mut MethodContext) -> Result<ParseStatus, AmlError> {
        context.op_end = None;
        let op_start = context.pc();
        let opcode = context.opcode()?;
        let parse_only = context.parse_only();
        let target_position = matches!(context.next_kind(), Some(ArgKind::SuperName | ArgKind::CondSuperName));

        match opcode {
            Opcode::Zero if target_position => context.deliver_target(Target::Null)?,
            Opcode::Zero => context.deliver(Object::Integer(0).wrap())?,
            Opcode::One => context.deliver(Object::Integer(1).wrap())?,
            Opcode::Ones => context.deliver(Object::Integer(self.ones()).wrap())?,
            Opcode::Revision => context.deliver(Object::Integer(INTERPRETER_REVISION).wrap())?,
            Opcode::BytePrefix => {
                let value = context.next()?;
                context.deliver(Object::Integer(value as u64).wrap())?;
            }
            Opcode::WordPrefix => {
                let value = context.next_u16()?;
                context.deliver(Object::Integer(value as u64).wrap())?;
            }
            Opcode::DWordPrefix => {
                let value = context.next_u32()?;
                context.deliver(Object::Integer(value as u64).wrap())?;
            }
            Opcode::QWordPrefix => {
                let value = context.next_u64()?;
                context.deliver(Object::Integer(value).wrap())?;
            }
            Opcode::StringPrefix => {
                let value = context.string()?;
                context.deliver(Object::String(value).wrap())?;
            }
            Opcode::Debug if target_position => context.deliver_target(Target::Debug)?,
            Opcode::Debug => context.deliver(Object::Debug.wrap())?,
            Opcode::Local(local) if target_position => context.deliver_target(Target::Local(local))?,
            Opcode::Arg(arg) if target_position => context.deliver_target(Target::Arg(arg))?,
            Opcode::Local(_) | Opcode::Arg(_) if parse_only => context.deliver_placeholder()?,
            Opcode::Local(local) => {
                let value = self.read_local(context, local)?;
                let value = if context.next_kind() == Some(ArgKind::DataRef) { value.deep_copy() } else { value };
                context.deliver(value)?;
            }
            Opcode::Arg(arg) => {
                let value = self.read_arg(context, arg)?;
                let value = if context.next_kind() == Some(ArgKind::DataRef) { value.deep_copy() } else { value };
                context.deliver(value)?;
            }
            Opcode::Timer if parse_only => context.deliver_placeholder()?,
            Opcode::Timer => {
                let ticks = self.handler.nanos_since_boot() / 100;
                context.deliver(Object::Integer(ticks).wrap())?;
            }

            Opcode::RootChar
            | Opcode::ParentPrefixChar
            | Opcode::DualNamePrefix
            | Opcode::MultiNamePrefix
            | Opcode::NameChar(_) => {
                context.set_pc(op_start);
                let name = context.namestring()?;
                self.handle_name(context, name)?;
            }
            Opcode::Digit(digit) => return Err(AmlError::IllegalOpcode(digit as u16)),

            Opcode::Noop => (),
            Opcode::Breakpoint => {
                if !parse_only {
                    self.handler.breakpoint();
                }
            }

            Opcode::Buffer => {
                let end = context.pkg_end()?;
                context.op_end = Some(end);
                if parse_only {
                    context.set_pc(end);
                    context.deliver_placeholder()?;
                } else {
                    let mut op = OpInFlight::new(Opcode::Buffer, &[ArgKind::TermArg], context.pc());
                    op.end = Some(end);
                    context.start_in_flight_op(op);
                }
            }
            Opcode::Package => {
                let end = context.pkg_end()?;
                context.op_end = Some(end);
                let num_elements = context.next()?;
                if parse_only {
                    context.set_pc(end);
                    context.deliver_placeholder()?;
                } else {
                    /*
                     * We now need to interpret an arbitrary number of package elements, bounded by the remaining
                     * pkglength. We utilise a combination of a block to manage the pkglength, plus an in-flight op
                     * to store interpreted elements.
                     */
                    let mut op = OpInFlight::new(Opcode::Package, &[], context.pc());
                    op.num_elements = num_elements as usize;
                    context.start_in_flight_op(op);
                    context.start_new_block(BlockKind::Package, end);
                }
            }
            Opcode::VarPackage => {
                let end = context.pkg_end()?;
                context.op_end = Some(end);
                if parse_only {
                    context.set_pc(end);
                    context.deliver_placeholder()?;
                } else {
                    let mut op = OpInFlight::new(Opcode::VarPackage, &[ArgKind::TermArg], context.pc());
                    op.end = Some(end);
                    context.start_in_flight_op(op);
                }
            }

            Opcode::If | Opcode::While => {
                let end = context.pkg_end()?;
                context.op_end = Some(end);
                if parse_only {
                    context.set_pc(end);
                } else {
                    let mut op = OpInFlight::new(opcode, &[ArgKind::TermArg], context.pc());
                    op.end = Some(end);
                    context.start_in_flight_op(op);
                }
            }
            Opcode::Else => {
                // An `Else` is only entered straight after its `If` has been skipped
                let end = context.pkg_end()?;
                context.set_pc(end);
            }
            Opcode::Break => {
                if !parse_only {
                    let depth = context.loop_depth().ok_or(AmlError::BreakOutsideLoop)?;
                    return Ok(ParseStatus::SkipDepth(depth));
                }
            }
            Opcode::Continue => {
                if !parse_only {
                    let depth = context.loop_depth().ok_or(AmlError::ContinueOutsideLoop)?;
                    for _ in 1..depth {
                        context.end_block()?;
                    }
                    let end = context.current_block.end;
                    context.set_pc(end);
                }
            }

            Opcode::Scope
            | Opcode::Device
            | Opcode::Processor
            | Opcode::PowerRes
            | Opcode::ThermalZone
            | Opcode::Method
            | Opcode::External
            | Opcode::Mutex
            | Opcode::Event
            | Opcode::Alias
            | Opcode::Field
            | Opcode::IndexField
            | Opcode::BankField
            | Opcode::Name
            | Opcode::OpRegion
            | Opcode::DataRegion
            | Opcode::CreateBitField
            | Opcode::CreateByteField
            | Opcode::CreateWordField
            | Opcode::CreateDWordField
            | Opcode::CreateQWordField
            | Opcode::CreateField => self.start_named_op(context, opcode)?,

            Opcode::InternalMethodCall | Opcode::InternalArgumentList => {
                return Err(AmlError::IllegalOpcode(0));
            }

            _ => {
                let op = OpInFlight::new(opcode, &arg_kinds(opcode), context.pc());
                context.start_in_flight_op(op);
            }
        }

        Ok(ParseStatus::Continue)
    }

    /// Handle a `NameString` that appears where an op or operand is expected. What it means depends on what the
    /// current op wants from it.
    fn handle_name(&self, context: &mut MethodContext, name: AmlName) -> Result<(), AmlError> {
        let parse_only = context.parse_only();
        let resolved = self.namespace.read().lookup(context.current_scope, &name, ObjectType::Any, true);

        match context.next_kind() {
            Some(ArgKind::SuperName) => match resolved {
                Ok(node) => context.deliver_target(Target::Node(node)),
                Err(_) if parse_only => context.deliver_target(Target::Null),
                Err(err) => Err(err),
            },
            Some(ArgKind::CondSuperName) => match resolved {
                Ok(node) => context.deliver_target(Target::Node(node)),
                Err(_) => context.deliver_target(Target::Name(name)),
            },
            Some(ArgKind::DataRef) if parse_only => context.deliver_placeholder(),
            Some(ArgKind::DataRef) => match resolved {
                Ok(node) => context.deliver(
                    Object::Reference { kind: ReferenceKind::Name, target: ReferenceTarget::Node(node) }.wrap(),
                ),
                Err(_) => {
                    warn!("Unresolved name {} in package; storing it as a string", name);
                    context.deliver(Object::String(name.as_string()).wrap())
                }
            },
            _ => {
                let node = match resolved {
                    Ok(node) => node,
                    Err(_) if parse_only => return context.deliver_placeholder(),
                    Err(err) => return Err(err),
                };

                /*
                 * A name that refers to a method is an invocation. We need the method's argument count to know
                 * how many operands to parse, even if we're not going to perform the call.
                 */
                let object = self.namespace.read().object(node)?;
                let arg_count = object.as_ref().and_then(|object| match &*object.lock() {
                    Object::Method(method) => Some(method.flags.arg_count()),
                    _ => None,
                });
                if let Some(arg_count) = arg_count {
                    let mut op = OpInFlight::new(Opcode::InternalMethodCall, &term_args(arg_count), context.pc());
                    op.node = Some(node);
                    context.start_in_flight_op(op);
                    return Ok(());
                }

                if parse_only {
                    return context.deliver_placeholder();
                }
                let value = self.evaluate_node_value(node)?;
                context.deliver(value)
            }
        }
    }

    pub(crate) fn read_local(&self, context: &MethodContext, local: u8) -> Result<WrappedObject, AmlError> {
        match &context.locals[local as usize] {
            Some(value) => Ok(value.clone()),
            None if self.config.enable_interpreter_slack => {
                warn!("Read of uninitialized Local{}; using zero", local);
                Ok(Object::Integer(0).wrap())
            }
            None => Err(AmlError::UninitializedLocal(local)),
        }
    }

    pub(crate) fn read_arg(&self, context: &MethodContext, arg: u8) -> Result<WrappedObject, AmlError> {
        match &context.args[arg as usize] {
            Some(value) => Ok(value.clone()),
            None if self.config.enable_interpreter_slack => {
                warn!("Read of uninitialized Arg{}; using zero", arg);
                Ok(Object::Integer(0).wrap())
            }
            None => Err(AmlError::UninitializedArg(arg)),
        }
    }

    /// `Ones`, truncated to the width of integers in the loaded tables.
    pub(crate) fn ones(&self) -> u64 {
        if self.integer_bytes() == 4 {
            u32::MAX as u64
        } else {
            u64::MAX
        }
    }
}

fn is_recoverable(err: &AmlError) -> bool {
    !matches!(err, AmlError::RunOutOfStream | AmlError::InvalidPkgLength)
}

/// The operands collected by ops that don't declare anything and don't have a package.
pub(crate) fn arg_kinds(op: Opcode) -> Vec<ArgKind> {
    use ArgKind::*;
    let kinds: &[ArgKind] = match op {
        Opcode::Store | Opcode::CopyObject => &[TermArg, SuperName],
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
        | Opcode::Mod
        | Opcode::Concat
        | Opcode::ConcatRes
        | Opcode::Index
        | Opcode::ToString => &[TermArg, TermArg, SuperName],
        Opcode::Divide => &[TermArg, TermArg, SuperName, SuperName],
        Opcode::Mid => &[TermArg, TermArg, TermArg, SuperName],
        Opcode::Increment | Opcode::Decrement | Opcode::RefOf | Opcode::SizeOf | Opcode::ObjectType => &[SuperName],
        Opcode::Release | Opcode::Signal | Opcode::Reset | Opcode::Unload => &[SuperName],
        Opcode::Not
        | Opcode::FindSetLeftBit
        | Opcode::FindSetRightBit
        | Opcode::ToBCD
        | Opcode::FromBCD
        | Opcode::ToBuffer
        | Opcode::ToDecimalString
        | Opcode::ToHexString
        | Opcode::ToInteger => &[TermArg, SuperName],
        Opcode::CondRefOf => &[CondSuperName, SuperName],
        Opcode::DerefOf | Opcode::LNot | Opcode::Return | Opcode::Sleep | Opcode::Stall => &[TermArg],
        Opcode::LAnd
        | Opcode::LOr
        | Opcode::LEqual
        | Opcode::LNotEqual
        | Opcode::LGreater
        | Opcode::LGreaterEqual
        | Opcode::LLess
        | Opcode::LLessEqual => &[TermArg, TermArg],
        Opcode::Match => &[TermArg, Byte, TermArg, Byte, TermArg, TermArg],
        Opcode::Notify | Opcode::Wait => &[SuperName, TermArg],
        Opcode::Acquire => &[SuperName, Word],
        Opcode::Fatal => &[Byte, DWord, TermArg],
        Opcode::Load => &[Name, SuperName],
        Opcode::LoadTable => &[TermArg, TermArg, TermArg, TermArg, TermArg, TermArg],
        _ => &[],
    };
    kinds.to_vec()
}
