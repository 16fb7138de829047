use crate::{
    namespace::{AmlName, NodeHandle},
    object::{Method, Object, WrappedObject},
    opcode::Opcode,
    owner::OwnerId,
    stream::{AmlCode, AmlStream},
    AmlError,
    Handle,
};
use alloc::{string::String, vec, vec::Vec};
use core::mem;

/// Which pass over the AML a context is making. The declaration pass only creates namespace nodes (and the
/// `Method` objects needed to parse calls correctly), skipping everything that would need evaluation.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Pass {
    Declare,
    Execute,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum ContextKind {
    /// The top level of a definition block. Errors here are logged and skipped over.
    Table,
    Method,
    /// The recorded operands of a deferred object (see [`crate::object::DeferredArgs`]).
    Deferred,
}

/// What the interpreter should do after a single step of a context.
pub(crate) enum ParseStatus {
    Continue,
    /// The context is waiting on the result of a method invocation.
    Pending(Invocation),
    ReturnValue(Option<WrappedObject>),
    /// The end of a definition block has been reached.
    Terminate,
    /// Unwind this many blocks (produced by `Break`).
    SkipDepth(usize),
}

pub(crate) struct Invocation {
    pub node: NodeHandle,
    pub method: Method,
    pub args: Vec<WrappedObject>,
}

/// The kinds of operand an in-flight op can collect. Each kind changes how the next piece of AML is interpreted:
/// names in a `TermArg` position are evaluated (or invoked, if they name a method), but in a `SuperName`
/// position they are only resolved to the node they refer to.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum ArgKind {
    TermArg,
    SuperName,
    /// The operand of `CondRefOf`: a name that doesn't exist is kept as a name, rather than being an error.
    CondSuperName,
    /// An element of a package, or the object of a `Name`. Names become references to the node they name.
    DataRef,
    /// A raw `NameString` that is part of the encoding of the op.
    Name,
    Byte,
    Word,
    DWord,
}

#[derive(Clone, Debug)]
pub(crate) enum Target {
    Null,
    Debug,
    Local(u8),
    Arg(u8),
    Node(NodeHandle),
    Object(WrappedObject),
    /// A name that could not be resolved. Only produced for `CondRefOf`.
    Name(AmlName),
}

#[derive(Clone, Debug)]
pub(crate) enum Argument {
    Object(WrappedObject),
    Target(Target),
    Name(AmlName),
    Integer(u64),
}

impl Argument {
    pub fn object(&self) -> Result<&WrappedObject, AmlError> {
        match self {
            Argument::Object(object) => Ok(object),
            _ => Err(AmlError::UnexpectedResult),
        }
    }

    pub fn target(&self) -> Result<&Target, AmlError> {
        match self {
            Argument::Target(target) => Ok(target),
            _ => Err(AmlError::UnexpectedResult),
        }
    }

    pub fn name(&self) -> Result<&AmlName, AmlError> {
        match self {
            Argument::Name(name) => Ok(name),
            _ => Err(AmlError::UnexpectedResult),
        }
    }

    pub fn integer(&self) -> Result<u64, AmlError> {
        match self {
            Argument::Integer(value) => Ok(*value),
            _ => Err(AmlError::UnexpectedResult),
        }
    }
}

#[derive(Debug)]
pub(crate) struct OpInFlight {
    pub op: Opcode,
    pub expected: Vec<ArgKind>,
    pub arguments: Vec<Argument>,
    /// Where the op's operands start in the stream.
    pub start: usize,
    /// The end of the op's package, for ops that have a `PkgLength`.
    pub end: Option<usize>,
    /// For deferred `Create*Field` ops, where the evaluated operands end (the name follows them).
    pub deferred_end: Option<usize>,
    pub num_elements: usize,
    pub iterations: u32,
    pub node: Option<NodeHandle>,
    /// The operands are being parsed but not evaluated, and will be recorded for later.
    pub deferring: bool,
    /// Something went wrong evaluating one of the operands, so the op is parsed to its end but not performed.
    pub failed: bool,
}

impl OpInFlight {
    pub fn new(op: Opcode, expected: &[ArgKind], start: usize) -> OpInFlight {
        OpInFlight::new_with(op, Vec::new(), &[], expected, start)
    }

    /// Create an in-flight op whose first few operands have already been read from the stream.
    pub fn new_with(
        op: Opcode,
        arguments: Vec<Argument>,
        given: &[ArgKind],
        more: &[ArgKind],
        start: usize,
    ) -> OpInFlight {
        let mut expected = Vec::with_capacity(given.len() + more.len());
        expected.extend_from_slice(given);
        expected.extend_from_slice(more);
        OpInFlight {
            op,
            expected,
            arguments,
            start,
            end: None,
            deferred_end: None,
            num_elements: 0,
            iterations: 0,
            node: None,
            deferring: false,
            failed: false,
        }
    }

    pub fn next_kind(&self) -> Option<ArgKind> {
        if self.op == Opcode::Package {
            Some(ArgKind::DataRef)
        } else {
            self.expected.get(self.arguments.len()).copied()
        }
    }

    /// Packages are only completed by the end of their block, however many elements they've collected.
    pub fn is_ready(&self) -> bool {
        self.op != Opcode::Package && self.arguments.len() >= self.expected.len()
    }

    pub fn args<const N: usize>(&self) -> Result<&[Argument; N], AmlError> {
        <&[Argument; N]>::try_from(&self.arguments[..]).map_err(|_| AmlError::UnexpectedResult)
    }
}

pub(crate) struct Block {
    pub pc: usize,
    pub end: usize,
    pub kind: BlockKind,
    /// The number of in-flight ops when the block was started. Ops above this belong to the block.
    pub in_flight_base: usize,
}

#[derive(Clone, Debug)]
pub(crate) enum BlockKind {
    Normal,
    Scope { old_scope: NodeHandle },
    Package,
    If,
    Else,
    While { predicate_start: usize, iterations: u32 },
}

#[derive(Clone, Debug)]
pub(crate) struct HeldMutex {
    pub object: WrappedObject,
    pub mutex: Handle,
    pub sync_level: u8,
    /// How many times the context has acquired the mutex without releasing it.
    pub count: u32,
}

pub(crate) struct MethodContext {
    pub kind: ContextKind,
    pub pass: Pass,
    pub code: AmlCode,
    pub current_block: Block,
    pub block_stack: Vec<Block>,
    pub in_flight: Vec<OpInFlight>,
    pub locals: [Option<WrappedObject>; 8],
    pub args: [Option<WrappedObject>; 7],
    pub current_scope: NodeHandle,
    pub owner: OwnerId,
    pub method: Option<NodeHandle>,
    /// The lowest sync level a mutex acquired by this context may have: the sync level of a serialized method,
    /// or the highest level held by its callers.
    pub sync_floor: u8,
    pub held_mutexes: Vec<HeldMutex>,
    /// The result of the last statement, for interpreter slack.
    pub last_result: Option<WrappedObject>,
    /// The end of the package of the op being started, so that error recovery can skip it.
    pub op_end: Option<usize>,
}

impl MethodContext {
    pub fn new(kind: ContextKind, pass: Pass, code: AmlCode, scope: NodeHandle, owner: OwnerId) -> MethodContext {
        let block = Block { pc: code.start(), end: code.end(), kind: BlockKind::Normal, in_flight_base: 0 };
        MethodContext {
            kind,
            pass,
            code,
            current_block: block,
            block_stack: Vec::new(),
            in_flight: Vec::new(),
            locals: Default::default(),
            args: Default::default(),
            current_scope: scope,
            owner,
            method: None,
            sync_floor: 0,
            held_mutexes: Vec::new(),
            last_result: None,
            op_end: None,
        }
    }

    fn stream(&mut self) -> AmlStream<'_> {
        AmlStream::new(&self.code.bytes()[..], &mut self.current_block.pc, self.current_block.end)
    }

    pub fn pc(&self) -> usize {
        self.current_block.pc
    }

    pub fn set_pc(&mut self, pc: usize) {
        self.current_block.pc = pc;
    }

    pub fn at_block_end(&self) -> bool {
        self.current_block.pc >= self.current_block.end
    }

    pub fn opcode(&mut self) -> Result<Opcode, AmlError> {
        self.stream().opcode()
    }

    pub fn pkg_end(&mut self) -> Result<usize, AmlError> {
        self.stream().pkg_end()
    }

    pub fn pkglength(&mut self) -> Result<usize, AmlError> {
        self.stream().pkglength()
    }

    pub fn namestring(&mut self) -> Result<AmlName, AmlError> {
        self.stream().namestring()
    }

    pub fn string(&mut self) -> Result<String, AmlError> {
        self.stream().string()
    }

    pub fn peek(&mut self) -> Result<u8, AmlError> {
        self.stream().peek()
    }

    pub fn next(&mut self) -> Result<u8, AmlError> {
        self.stream().next()
    }

    pub fn next_u16(&mut self) -> Result<u16, AmlError> {
        self.stream().next_u16()
    }

    pub fn next_u32(&mut self) -> Result<u32, AmlError> {
        self.stream().next_u32()
    }

    pub fn next_u64(&mut self) -> Result<u64, AmlError> {
        self.stream().next_u64()
    }

    pub fn take(&mut self, n: usize) -> Result<Vec<u8>, AmlError> {
        Ok(self.stream().take(n)?.to_vec())
    }

    pub fn last_op(&mut self) -> Result<&mut OpInFlight, AmlError> {
        match self.in_flight.last_mut() {
            Some(op) => Ok(op),
            None => Err(AmlError::NoCurrentOp),
        }
    }

    pub fn start_in_flight_op(&mut self, op: OpInFlight) {
        self.in_flight.push(op);
    }

    /// Pop the top in-flight op if it has all of its operands.
    pub fn take_ready_op(&mut self) -> Option<OpInFlight> {
        if self.in_flight.len() > self.current_block.in_flight_base && self.in_flight.last()?.is_ready() {
            self.in_flight.pop()
        } else {
            None
        }
    }

    /// Start a new block running from the current position up to `end`. The enclosing block continues from
    /// `end` once the new block is finished.
    pub fn start_new_block(&mut self, kind: BlockKind, end: usize) {
        let block = Block { pc: self.current_block.pc, end, kind, in_flight_base: self.in_flight.len() };
        self.current_block.pc = end;
        self.block_stack.push(mem::replace(&mut self.current_block, block));
    }

    /// Finish the current block, returning to the enclosing one. Any ops the block left in flight are dropped.
    pub fn end_block(&mut self) -> Result<Block, AmlError> {
        let parent = self.block_stack.pop().ok_or(AmlError::RunOutOfStream)?;
        let finished = mem::replace(&mut self.current_block, parent);
        self.in_flight.truncate(finished.in_flight_base);
        if let BlockKind::Scope { old_scope } = finished.kind {
            self.current_scope = old_scope;
        }
        Ok(finished)
    }

    /// How many blocks must be finished to leave the innermost `While`, if there is one.
    pub fn loop_depth(&self) -> Option<usize> {
        let mut blocks = self.block_stack.iter().rev();
        let mut block = &self.current_block;
        let mut depth = 1;
        loop {
            match block.kind {
                BlockKind::While { .. } => return Some(depth),
                BlockKind::Normal => return None,
                _ => (),
            }
            block = blocks.next()?;
            depth += 1;
        }
    }

    /// Whether the result of the next op will be consumed by an in-flight op, rather than being a statement.
    pub fn wants_result(&self) -> bool {
        let base = self.current_block.in_flight_base;
        match self.in_flight.last() {
            Some(op) if self.in_flight.len() > base => op.next_kind().is_some(),
            Some(op) => {
                matches!(self.current_block.kind, BlockKind::Package)
                    && self.in_flight.len() == base
                    && op.op == Opcode::Package
            }
            None => false,
        }
    }

    pub fn next_kind(&self) -> Option<ArgKind> {
        if self.wants_result() {
            self.in_flight.last().and_then(|op| op.next_kind())
        } else {
            None
        }
    }

    /// Whether ops are being parsed without being performed, either because this is the declaration pass, or
    /// because an enclosing op is deferring or has failed.
    pub fn parse_only(&self) -> bool {
        self.pass == Pass::Declare || self.in_flight.iter().any(|op| op.deferring || op.failed)
    }

    /// Hand the result of an op to the op waiting for it, or record it as the result of the current statement.
    pub fn deliver(&mut self, object: WrappedObject) -> Result<(), AmlError> {
        if !self.wants_result() {
            self.last_result = Some(object);
            return Ok(());
        }

        let op = self.last_op()?;
        let argument = match op.next_kind() {
            Some(ArgKind::TermArg | ArgKind::DataRef) => Argument::Object(object),
            Some(ArgKind::SuperName | ArgKind::CondSuperName) => Argument::Target(Target::Object(object)),
            _ => return Err(AmlError::UnexpectedResult),
        };
        op.arguments.push(argument);
        Ok(())
    }

    pub fn deliver_target(&mut self, target: Target) -> Result<(), AmlError> {
        self.last_op()?.arguments.push(Argument::Target(target));
        Ok(())
    }

    pub fn deliver_placeholder(&mut self) -> Result<(), AmlError> {
        if self.wants_result() {
            match self.next_kind() {
                Some(ArgKind::SuperName | ArgKind::CondSuperName) => self.deliver_target(Target::Null)?,
                Some(ArgKind::Name) => self.last_op()?.arguments.push(Argument::Name(AmlName::null())),
                Some(ArgKind::Byte | ArgKind::Word | ArgKind::DWord) => {
                    self.last_op()?.arguments.push(Argument::Integer(0))
                }
                _ => self.deliver(Object::Uninitialized.wrap())?,
            }
        }
        Ok(())
    }

    /// Mark every op of the current block as failed, so that the rest of their operands are parsed but not
    /// evaluated.
    pub fn fail_block_ops(&mut self) {
        let base = self.current_block.in_flight_base;
        for op in self.in_flight.iter_mut().skip(base) {
            op.failed = true;
        }
    }

    /// The highest sync level of the mutexes this context holds, or the floor it inherited.
    pub fn current_sync_level(&self) -> u8 {
        self.held_mutexes.iter().map(|held| held.sync_level).fold(self.sync_floor, u8::max)
    }
}

/// Arguments whose operands are all `TermArg`s.
pub(crate) fn term_args(n: usize) -> Vec<ArgKind> {
    vec![ArgKind::TermArg; n]
}
