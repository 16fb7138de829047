//! End-to-end tests that load hand-assembled AML and evaluate it through the public interface.

use crate::{
    namespace::AmlName,
    object::{Object, ObjectType, WrappedObject},
    test_utils::{aml_table, make_fadt, make_table, Access, TestHandler},
    AmlError,
    Config,
    Interpreter,
};
use core::str::FromStr;
use std::{
    string::{String, ToString},
    vec,
    vec::Vec,
};

fn path(path: &str) -> AmlName {
    AmlName::from_str(path).unwrap()
}

fn integer(object: WrappedObject) -> u64 {
    object.snapshot().as_integer().unwrap()
}

/// Prefix `contents` with `opcode` and a `PkgLength` covering them.
fn with_pkg(opcode: &[u8], contents: &[u8]) -> Vec<u8> {
    [opcode, &pkg_length(contents.len()), contents].concat()
}

/// The encoding of a `PkgLength` for `length` bytes of contents. The length includes the encoding itself.
fn pkg_length(length: usize) -> Vec<u8> {
    if length + 1 < 0x40 {
        vec![(length + 1) as u8]
    } else if length + 2 < 0x1000 {
        let total = length + 2;
        vec![0x40 | (total & 0xf) as u8, (total >> 4) as u8]
    } else {
        let total = length + 3;
        vec![0x80 | (total & 0xf) as u8, (total >> 4) as u8, (total >> 12) as u8]
    }
}

/// The `PkgLength` encoding of a raw value, as used for the bit lengths in field lists.
fn raw_length(value: usize) -> Vec<u8> {
    if value < 0x40 {
        vec![value as u8]
    } else {
        vec![0x40 | (value & 0xf) as u8, (value >> 4) as u8]
    }
}

/// The shortest encoding of an integer constant.
fn int(value: u64) -> Vec<u8> {
    match value {
        0 => vec![0x00],
        1 => vec![0x01],
        u64::MAX => vec![0xff],
        0..=0xff => vec![0x0a, value as u8],
        0..=0xffff => [&[0x0b][..], &(value as u16).to_le_bytes()].concat(),
        0..=0xffff_ffff => [&[0x0c][..], &(value as u32).to_le_bytes()].concat(),
        _ => [&[0x0e][..], &value.to_le_bytes()].concat(),
    }
}

fn method(name: &[u8; 4], flags: u8, body: &[u8]) -> Vec<u8> {
    with_pkg(&[0x14], &[&name[..], &[flags], body].concat())
}

fn device(name: &[u8; 4], body: &[u8]) -> Vec<u8> {
    with_pkg(&[0x5b, 0x82], &[&name[..], body].concat())
}

struct XorShift(u64);

impl XorShift {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }
}

#[test]
fn minimal_method() {
    /*
     * Method (MAIN, 0) { Return (0x2a) }
     */
    const AML: [u8; 10] = [0x14, 0x09, b'M', b'A', b'I', b'N', 0x00, 0xa4, 0x0a, 0x2a];

    let interpreter = Interpreter::new(TestHandler::new());
    interpreter.load_table(&aml_table(&AML)).unwrap();
    assert_eq!(integer(interpreter.evaluate(path("\\MAIN"), vec![]).unwrap()), 42);
}

#[test]
fn scope_on_data_object_retypes_it() {
    /*
     * Name (DEBB, 0)
     * Scope (DEBB) { Noop }
     */
    const AML: [u8; 14] =
        [0x08, b'D', b'E', b'B', b'B', 0x0a, 0x00, 0x10, 0x06, b'D', b'E', b'B', b'B', 0xa3];

    let interpreter = Interpreter::new(TestHandler::new());
    interpreter.load_table(&aml_table(&AML)).unwrap();
    let node = interpreter.lookup(&path("\\DEBB")).unwrap();
    assert_eq!(interpreter.namespace.read().typ(node).unwrap(), ObjectType::Any);
}

#[test]
fn region_arguments_are_evaluated_on_first_access() {
    /*
     * OperationRegion (RGN1, SystemMemory, 0xff, 0x10)
     * Field (RGN1, ByteAcc, NoLock, Preserve) { FLD0, 8 }
     * Method (WRIT, 1) { Store (Arg0, FLD0) }
     */
    let aml = [
        &[0x5b, 0x80, b'R', b'G', b'N', b'1', 0x00, 0x0b, 0xff, 0x00, 0x0a, 0x10][..],
        &with_pkg(&[0x5b, 0x81], &[b'R', b'G', b'N', b'1', 0x01, b'F', b'L', b'D', b'0', 0x08]),
        &method(b"WRIT", 1, &[0x70, 0x68, b'F', b'L', b'D', b'0']),
    ]
    .concat();

    let host = TestHandler::new();
    let interpreter = Interpreter::new(host.clone());
    interpreter.load_table(&aml_table(&aml)).unwrap();

    let region = interpreter.lookup(&path("\\RGN1")).unwrap();
    let region_object = interpreter.namespace.read().object(region).unwrap().unwrap();
    match &*region_object.lock() {
        Object::OpRegion(region) => {
            assert_eq!(region.length, 0);
            assert!(region.deferred.is_some());
        }
        other => panic!("RGN1 is {:?}", other.typ()),
    }

    interpreter.evaluate(path("\\WRIT"), vec![Object::Integer(0x5a).wrap()]).unwrap();
    match &*region_object.lock() {
        Object::OpRegion(region) => {
            assert_eq!(region.base, 0xff);
            assert_eq!(region.length, 0x10);
        }
        other => panic!("RGN1 is {:?}", other.typ()),
    }
    assert!(host.accesses().contains(&Access::Memory { address: 0xff, width: 8, write: true }));
    assert_eq!(integer(interpreter.evaluate(path("\\FLD0"), vec![]).unwrap()), 0x5a);
}

#[test]
fn osi_answers_from_the_interface_list() {
    let interpreter = Interpreter::new(TestHandler::new());
    let osi = |name: &str| {
        integer(interpreter.evaluate(path("\\_OSI"), vec![Object::String(String::from(name)).wrap()]).unwrap())
    };

    assert_eq!(osi("Windows 2015"), u64::MAX);
    assert_eq!(osi("Linux"), 0);
    assert_eq!(osi("Windows 2020"), osi("Windows 2020"));

    interpreter.install_interface("Linux").unwrap();
    assert_eq!(osi("Linux"), u64::MAX);
}

#[test]
fn unloading_a_table_removes_only_its_objects() {
    /*
     * DSDT:
     *     Device (DEV0) { }
     * SSDT:
     *     Scope (\DEV0) {
     *         Name (FOO_, One)
     *         Name (BAR_, 0x02)
     *     }
     */
    let dsdt = device(b"DEV0", &[]);
    let ssdt = with_pkg(
        &[0x10],
        &[0x5c, b'D', b'E', b'V', b'0', 0x08, b'F', b'O', b'O', b'_', 0x01, 0x08, b'B', b'A', b'R', b'_', 0x0a, 0x02],
    );

    let interpreter = Interpreter::new(TestHandler::new());
    interpreter.load_table(&aml_table(&dsdt)).unwrap();
    let index = interpreter.load_table(&make_table(b"SSDT", 2, &ssdt)).unwrap();
    let foo = interpreter.lookup(&path("\\DEV0.FOO_")).unwrap();
    assert_eq!(integer(interpreter.evaluate(path("\\DEV0.BAR_"), vec![]).unwrap()), 2);

    interpreter.unload_table(index).unwrap();
    assert!(matches!(interpreter.lookup(&path("\\DEV0.FOO_")), Err(AmlError::ObjectDoesNotExist(_))));
    assert!(matches!(interpreter.lookup(&path("\\DEV0.BAR_")), Err(AmlError::ObjectDoesNotExist(_))));
    assert!(interpreter.lookup(&path("\\DEV0")).is_ok());
    assert_eq!(interpreter.evaluate_node(foo, vec![]).err(), Some(AmlError::StaleHandle));
    assert_eq!(interpreter.unload_table(index), Err(AmlError::TableNotLoaded));
}

#[test]
fn dsdt_cannot_be_unloaded() {
    let interpreter = Interpreter::new(TestHandler::new());
    let index = interpreter.load_table(&aml_table(&device(b"DEV0", &[]))).unwrap();
    assert_eq!(interpreter.unload_table(index), Err(AmlError::CannotUnloadDsdt));
}

#[test]
fn methods_can_be_called_before_their_declaration() {
    /*
     * Method (CALL, 0) { Return (ADD2 (3, 4)) }
     * Method (ADD2, 2) { Return (Add (Arg0, Arg1)) }
     */
    const AML: [u8; 29] = [
        0x14, 0x0f, b'C', b'A', b'L', b'L', 0x00, 0xa4, b'A', b'D', b'D', b'2', 0x0a, 0x03, 0x0a, 0x04, 0x14, 0x0c,
        b'A', b'D', b'D', b'2', 0x02, 0xa4, 0x72, 0x68, 0x69, 0x00, 0xa3,
    ];

    let interpreter = Interpreter::new(TestHandler::new());
    interpreter.load_table(&aml_table(&AML)).unwrap();
    assert_eq!(integer(interpreter.evaluate(path("\\CALL"), vec![]).unwrap()), 7);
    assert_eq!(
        integer(
            interpreter
                .evaluate(path("\\ADD2"), vec![Object::Integer(40).wrap(), Object::Integer(2).wrap()])
                .unwrap()
        ),
        42
    );
}

#[test]
fn loops_and_locals() {
    /*
     * Method (MAIN, 0) {
     *     Store (Zero, Local0)
     *     While (LLess (Local0, 0x0a)) { Increment (Local0) }
     *     Return (Local0)
     * }
     */
    let body = [
        &[0x70, 0x00, 0x60][..],
        &with_pkg(&[0xa2], &[0x95, 0x60, 0x0a, 0x0a, 0x75, 0x60]),
        &[0xa4, 0x60],
    ]
    .concat();

    let interpreter = Interpreter::new(TestHandler::new());
    interpreter.load_table(&aml_table(&method(b"MAIN", 0, &body))).unwrap();
    assert_eq!(integer(interpreter.evaluate(path("\\MAIN"), vec![]).unwrap()), 10);
}

#[test]
fn runaway_loops_are_stopped() {
    /*
     * Method (MAIN, 0) { While (One) { Noop } }
     */
    let aml = method(b"MAIN", 0, &with_pkg(&[0xa2], &[0x01, 0xa3]));

    let config = Config { max_loop_iterations: 16, ..Config::default() };
    let interpreter = Interpreter::with_config(TestHandler::new(), config);
    interpreter.load_table(&aml_table(&aml)).unwrap();
    assert_eq!(interpreter.evaluate(path("\\MAIN"), vec![]).err(), Some(AmlError::LoopLimitExceeded));
}

#[test]
fn packages_and_buffer_fields() {
    /*
     * Name (PKG0, Package (3) { One, "two", Buffer (One) { 0x03 } })
     * Name (BUF0, Buffer (4) { })
     * CreateDWordField (BUF0, Zero, DW00)
     * Method (ELEM, 0) { Return (DerefOf (Index (PKG0, One))) }
     * Method (SIZE, 0) { Return (SizeOf (PKG0)) }
     * Method (BYTE, 0) {
     *     Store (0x12345678, DW00)
     *     Return (DerefOf (Index (BUF0, One)))
     * }
     */
    let package = with_pkg(&[0x12], &[&[0x03, 0x01, 0x0d, b't', b'w', b'o', 0x00][..], &with_pkg(&[0x11], &[0x01, 0x03])].concat());
    let aml = [
        &[0x08, b'P', b'K', b'G', b'0'][..],
        &package,
        &[0x08, b'B', b'U', b'F', b'0'],
        &with_pkg(&[0x11], &[0x0a, 0x04]),
        &[0x8a, b'B', b'U', b'F', b'0', 0x00, b'D', b'W', b'0', b'0'],
        &method(b"ELEM", 0, &[0xa4, 0x83, 0x88, b'P', b'K', b'G', b'0', 0x01, 0x00]),
        &method(b"SIZE", 0, &[0xa4, 0x87, b'P', b'K', b'G', b'0']),
        &method(
            b"BYTE",
            0,
            &[0x70, 0x0c, 0x78, 0x56, 0x34, 0x12, b'D', b'W', b'0', b'0', 0xa4, 0x83, 0x88, b'B', b'U', b'F', b'0', 0x01, 0x00],
        ),
    ]
    .concat();

    let interpreter = Interpreter::new(TestHandler::new());
    interpreter.load_table(&aml_table(&aml)).unwrap();
    assert_eq!(interpreter.evaluate(path("\\ELEM"), vec![]).unwrap().snapshot().as_string().unwrap(), "two");
    assert_eq!(integer(interpreter.evaluate(path("\\SIZE"), vec![]).unwrap()), 3);
    assert_eq!(integer(interpreter.evaluate(path("\\BYTE"), vec![]).unwrap()), 0x56);
}

#[test]
fn old_tables_use_32_bit_integers() {
    /*
     * Method (ONES, 0) { Return (Ones) }
     * Method (OVER, 0) { Return (Add (0xffffffff, One)) }
     */
    let aml = [
        method(b"ONES", 0, &[0xa4, 0xff]),
        method(b"OVER", 0, &[0xa4, 0x72, 0x0c, 0xff, 0xff, 0xff, 0xff, 0x01, 0x00]),
    ]
    .concat();

    let interpreter = Interpreter::new(TestHandler::new());
    interpreter.load_table(&make_table(b"DSDT", 1, &aml)).unwrap();
    assert_eq!(interpreter.integer_bytes(), 4);
    assert_eq!(integer(interpreter.evaluate(path("\\ONES"), vec![]).unwrap()), 0xffff_ffff);
    assert_eq!(integer(interpreter.evaluate(path("\\OVER"), vec![]).unwrap()), 0);
}

#[test]
fn notify_reaches_the_host() {
    /*
     * Device (DEV0) { }
     * Method (MAIN, 0) { Notify (DEV0, 0x80) }
     */
    let aml = [device(b"DEV0", &[]), method(b"MAIN", 0, &[0x86, b'D', b'E', b'V', b'0', 0x0a, 0x80])].concat();

    let host = TestHandler::new();
    let interpreter = Interpreter::new(host.clone());
    interpreter.load_table(&aml_table(&aml)).unwrap();
    interpreter.evaluate(path("\\MAIN"), vec![]).unwrap();
    assert_eq!(host.notifications(), vec![(String::from("\\DEV0"), 0x80)]);
}

#[test]
fn mutexes() {
    /*
     * Mutex (MTX0, 0)
     * Mutex (MTX1, 5)
     * Mutex (MTX2, 2)
     * Method (PAIR, 0) {
     *     Store (Acquire (MTX0, 0xffff), Local0)
     *     Release (MTX0)
     *     Return (Local0)
     * }
     * Method (HOLD, 0) { Return (Acquire (MTX0, 0xffff)) }
     * Method (BAD_, 0) { Release (MTX0) }
     * Method (ORDR, 0) {
     *     Acquire (MTX1, 0xffff)
     *     Acquire (MTX2, 0xffff)
     * }
     */
    let aml = [
        &[0x5b, 0x01, b'M', b'T', b'X', b'0', 0x00][..],
        &[0x5b, 0x01, b'M', b'T', b'X', b'1', 0x05],
        &[0x5b, 0x01, b'M', b'T', b'X', b'2', 0x02],
        &method(
            b"PAIR",
            0,
            &[
                0x70, 0x5b, 0x23, b'M', b'T', b'X', b'0', 0xff, 0xff, 0x60, 0x5b, 0x27, b'M', b'T', b'X', b'0', 0xa4,
                0x60,
            ],
        ),
        &method(b"HOLD", 0, &[0xa4, 0x5b, 0x23, b'M', b'T', b'X', b'0', 0xff, 0xff]),
        &method(b"BAD_", 0, &[0x5b, 0x27, b'M', b'T', b'X', b'0']),
        &method(
            b"ORDR",
            0,
            &[0x5b, 0x23, b'M', b'T', b'X', b'1', 0xff, 0xff, 0x5b, 0x23, b'M', b'T', b'X', b'2', 0xff, 0xff],
        ),
    ]
    .concat();

    let host = TestHandler::new();
    let interpreter = Interpreter::new(host.clone());
    interpreter.load_table(&aml_table(&aml)).unwrap();

    let mtx0 = interpreter.lookup(&path("\\MTX0")).unwrap();
    let handle = match interpreter.namespace.read().object(mtx0).unwrap().unwrap().snapshot() {
        Object::Mutex { mutex, sync_level } => {
            assert_eq!(sync_level, 0);
            mutex
        }
        other => panic!("MTX0 is {:?}", other.typ()),
    };

    assert_eq!(integer(interpreter.evaluate(path("\\PAIR"), vec![]).unwrap()), 0);
    assert!(!host.is_held(handle));

    // Mutexes still held when a method returns are released for it
    assert_eq!(integer(interpreter.evaluate(path("\\HOLD"), vec![]).unwrap()), 0);
    assert!(!host.is_held(handle));

    assert_eq!(interpreter.evaluate(path("\\BAD_"), vec![]).err(), Some(AmlError::MutexNotAcquired));
    assert_eq!(interpreter.evaluate(path("\\ORDR"), vec![]).err(), Some(AmlError::MutexSyncLevelViolation));
}

#[test]
fn fatal_stops_the_method() {
    /*
     * Method (MAIN, 0) {
     *     Fatal (0x01, 0x00000002, 0x03)
     *     Return (One)
     * }
     */
    let aml = method(b"MAIN", 0, &[0x5b, 0x32, 0x01, 0x02, 0x00, 0x00, 0x00, 0x0a, 0x03, 0xa4, 0x01]);

    let interpreter = Interpreter::new(TestHandler::new());
    interpreter.load_table(&aml_table(&aml)).unwrap();
    assert_eq!(interpreter.evaluate(path("\\MAIN"), vec![]).err(), Some(AmlError::Fatal { typ: 1, code: 2, arg: 3 }));
}

#[test]
fn uninitialized_locals() {
    /*
     * Method (MAIN, 0) { Return (Local0) }
     * Method (NOPE, 0) { Noop }
     */
    let aml = [method(b"MAIN", 0, &[0xa4, 0x60]), method(b"NOPE", 0, &[0xa3])].concat();

    let interpreter = Interpreter::new(TestHandler::new());
    interpreter.load_table(&aml_table(&aml)).unwrap();
    assert_eq!(interpreter.evaluate(path("\\MAIN"), vec![]).err(), Some(AmlError::UninitializedLocal(0)));
    assert_eq!(integer(interpreter.evaluate(path("\\NOPE"), vec![]).unwrap()), 0);

    let config = Config { enable_interpreter_slack: true, ..Config::default() };
    let interpreter = Interpreter::with_config(TestHandler::new(), config);
    interpreter.load_table(&aml_table(&aml)).unwrap();
    assert_eq!(integer(interpreter.evaluate(path("\\MAIN"), vec![]).unwrap()), 0);

    let config = Config { implicit_return: false, ..Config::default() };
    let interpreter = Interpreter::with_config(TestHandler::new(), config);
    interpreter.load_table(&aml_table(&aml)).unwrap();
    assert_eq!(interpreter.evaluate(path("\\NOPE"), vec![]).err(), Some(AmlError::NoReturnValue));
}

#[test]
fn evaluate_if_present() {
    let interpreter = Interpreter::new(TestHandler::new());
    interpreter.load_table(&aml_table(&method(b"MAIN", 0, &[0xa4, 0x01]))).unwrap();
    assert_eq!(interpreter.evaluate_if_present(path("\\MAIN"), vec![]).unwrap().map(integer), Some(1));
    assert!(interpreter.evaluate_if_present(path("\\NONE"), vec![]).unwrap().is_none());
}

#[test]
fn load_from_a_buffer() {
    /*
     * Name (TBL0, Buffer () { <SSDT containing Name (LDED, 0x05)> })
     * Method (MAIN, 0) {
     *     Load (TBL0, Local0)
     *     Return (LDED)
     * }
     */
    let ssdt = make_table(b"SSDT", 2, &[0x08, b'L', b'D', b'E', b'D', 0x0a, 0x05]);
    let aml = [
        &[0x08, b'T', b'B', b'L', b'0'][..],
        &with_pkg(&[0x11], &[&int(ssdt.len() as u64)[..], &ssdt].concat()),
        &method(b"MAIN", 0, &[0x5b, 0x20, b'T', b'B', b'L', b'0', 0x60, 0xa4, b'L', b'D', b'E', b'D']),
    ]
    .concat();

    let interpreter = Interpreter::new(TestHandler::new());
    interpreter.load_table(&aml_table(&aml)).unwrap();
    assert_eq!(integer(interpreter.evaluate(path("\\MAIN"), vec![]).unwrap()), 5);
    assert!(interpreter.lookup(&path("\\LDED")).is_ok());
}

#[test]
fn tables_are_found_through_the_host() {
    const FADT_ADDRESS: u64 = 0x10_0000;
    const DSDT_ADDRESS: u64 = 0x20_0000;
    const SSDT_ADDRESS: u64 = 0x30_0000;

    let host = TestHandler::new();
    host.add_table(FADT_ADDRESS, &make_fadt(6, 5, false, 0, DSDT_ADDRESS));
    host.add_table(DSDT_ADDRESS, &aml_table(&method(b"MAIN", 0, &[0xa4, 0x0a, 0x2a])));
    host.add_table(SSDT_ADDRESS, &make_table(b"SSDT", 2, &[0x08, b'S', b'S', b'D', b'N', 0x0a, 0x07]));

    let interpreter = Interpreter::new(host.clone());
    interpreter.initialize_tables().unwrap();
    assert_eq!(integer(interpreter.evaluate(path("\\MAIN"), vec![]).unwrap()), 42);
    assert_eq!(integer(interpreter.evaluate(path("\\SSDN"), vec![]).unwrap()), 7);
    // The FADT is only read once, but the DSDT and SSDT stay mapped.
    assert_eq!(host.num_mappings(), 2);
}

#[test]
fn legacy_dsdt_pointer() {
    let host = TestHandler::new();
    host.add_table(0x10_0000, &make_fadt(6, 5, false, 0x20_0000, 0x40_0000));
    host.add_table(0x20_0000, &aml_table(&method(b"MAIN", 0, &[0xa4, 0x01])));
    host.add_table(0x40_0000, &aml_table(&method(b"MAIN", 0, &[0xa4, 0x0a, 0x02])));

    let config = Config { do_not_use_xsdt: true, ..Config::default() };
    let interpreter = Interpreter::with_config(host.clone(), config);
    interpreter.initialize_tables().unwrap();
    assert_eq!(integer(interpreter.evaluate(path("\\MAIN"), vec![]).unwrap()), 1);

    let interpreter = Interpreter::new(host);
    interpreter.initialize_tables().unwrap();
    assert_eq!(integer(interpreter.evaluate(path("\\MAIN"), vec![]).unwrap()), 2);
}

#[test]
fn hardware_reduced_requirement() {
    let host = TestHandler::new();
    host.add_table(0x10_0000, &make_fadt(6, 5, false, 0, 0x20_0000));
    host.add_table(0x20_0000, &aml_table(&[]));

    let config = Config { require_hardware_reduced: true, ..Config::default() };
    let interpreter = Interpreter::with_config(host, config);
    assert_eq!(interpreter.initialize_tables(), Err(AmlError::HardwareReducedRequired));
}

#[test]
fn device_initialization_follows_status() {
    /*
     * Name (INIT, Zero)
     * Device (DEV0) {
     *     Name (_STA, 0x0f)
     *     Method (_INI, 0) { Add (INIT, One, INIT) }
     * }
     * Device (DEV1) {
     *     Name (_STA, Zero)
     *     Method (_INI, 0) { Add (INIT, 0x10, INIT) }
     *     Device (CHLD) { Method (_INI, 0) { Add (INIT, 0x100, INIT) } }
     * }
     * Device (DEV2) {
     *     Name (_STA, 0x08)
     *     Method (_INI, 0) { Add (INIT, 0x1000, INIT) }
     *     Device (CHLD) { Method (_INI, 0) { Add (INIT, 0x10000, INIT) } }
     * }
     */
    let add_to_init = |value: u64| [&[0x72, b'I', b'N', b'I', b'T'][..], &int(value), b"INIT"].concat();
    let sta = |value: u64| [&[0x08, b'_', b'S', b'T', b'A'][..], &int(value)].concat();
    let aml = [
        vec![0x08, b'I', b'N', b'I', b'T', 0x00],
        device(b"DEV0", &[sta(0x0f), method(b"_INI", 0, &add_to_init(0x1))].concat()),
        device(
            b"DEV1",
            &[sta(0), method(b"_INI", 0, &add_to_init(0x10)), device(b"CHLD", &method(b"_INI", 0, &add_to_init(0x100)))]
                .concat(),
        ),
        device(
            b"DEV2",
            &[
                sta(0x08),
                method(b"_INI", 0, &add_to_init(0x1000)),
                device(b"CHLD", &method(b"_INI", 0, &add_to_init(0x10000))),
            ]
            .concat(),
        ),
    ]
    .concat();

    let interpreter = Interpreter::new(TestHandler::new());
    interpreter.load_table(&aml_table(&aml)).unwrap();
    interpreter.initialize_devices().unwrap();
    assert_eq!(integer(interpreter.evaluate(path("\\INIT"), vec![]).unwrap()), 0x10001);
}

/// Build a table of randomly chosen declarations, each with a name that hasn't been used before.
fn random_declarations(rng: &mut XorShift, serial: &mut u32) -> Vec<u8> {
    let mut body = Vec::new();
    for _ in 0..(1 + rng.next() % 6) {
        *serial += 1;
        let seg = |prefix: u8| {
            [prefix, b'0' + (*serial / 100 % 10) as u8, b'0' + (*serial / 10 % 10) as u8, b'0' + (*serial % 10) as u8]
        };
        let value = rng.next() >> (rng.next() % 64);

        let declaration = match rng.next() % 6 {
            0 => [&[0x08][..], &seg(b'N'), &int(value)].concat(),
            1 => [&[0x08][..], &seg(b'S'), &[0x0d, b'a', b'b', 0x00]].concat(),
            2 => {
                let args = (value % 8) as u8;
                method(&seg(b'M'), args, &[&[0xa4][..], &int(args as u64)].concat())
            }
            3 => device(&seg(b'D'), &[&[0x08, b'_', b'A', b'D', b'R'][..], &int(value)].concat()),
            4 => with_pkg(&[0x10], &[&[0x5c, b'D', b'E', b'V', b'0', 0x08][..], &seg(b'C'), &int(value)].concat()),
            _ => [&[0x5b, 0x80][..], &seg(b'R'), &[0x00], &int(value & 0xffff_f000), &int(0x10)].concat(),
        };
        body.extend(declaration);
    }
    body
}

#[test]
fn load_then_unload_restores_the_namespace() {
    let interpreter = Interpreter::new(TestHandler::new());
    interpreter
        .load_table(&aml_table(&[device(b"DEV0", &[0x08, b'_', b'A', b'D', b'R', 0x00]), vec![0x08, b'B', b'A', b'S', b'E', 0x01]].concat()))
        .unwrap();

    let mut rng = XorShift(0x2545_f491_4f6c_dd1d);
    let mut serial = 0;
    for round in 0..64 {
        let before = interpreter.namespace.read().to_string();
        let table = make_table(b"SSDT", 2, &random_declarations(&mut rng, &mut serial));
        let index = interpreter.load_table(&table).unwrap();
        assert_ne!(interpreter.namespace.read().to_string(), before, "round {}", round);

        interpreter.unload_table(index).unwrap();
        assert_eq!(interpreter.namespace.read().to_string(), before, "round {}", round);
    }
}

#[test]
fn field_reads_return_what_was_written() {
    let mut rng = XorShift(0x9e37_79b9_7f4a_7c15);
    for _ in 0..64 {
        let access_type = 1 + (rng.next() % 4) as u8;
        let offset = (rng.next() % 128) as usize;
        let width = 1 + (rng.next() % 64) as usize;
        let value = if width == 64 { rng.next() } else { rng.next() & ((1 << width) - 1) };

        /*
         * OperationRegion (RGN0, SystemMemory, 0x4000, 0x20)
         * Field (RGN0, <access_type>, NoLock, Preserve) {
         *     Offset (<offset in bits>),
         *     FLD0, <width>
         * }
         * Method (WRIT, 1) { Store (Arg0, FLD0) }
         */
        let reserved = if offset > 0 { [&[0x00][..], &raw_length(offset)].concat() } else { Vec::new() };
        let field_list = [&[b'R', b'G', b'N', b'0', access_type][..], &reserved, b"FLD0", &raw_length(width)].concat();
        let aml = [
            &[0x5b, 0x80, b'R', b'G', b'N', b'0', 0x00, 0x0b, 0x00, 0x40, 0x0a, 0x20][..],
            &with_pkg(&[0x5b, 0x81], &field_list),
            &method(b"WRIT", 1, &[0x70, 0x68, b'F', b'L', b'D', b'0']),
        ]
        .concat();

        let interpreter = Interpreter::new(TestHandler::new());
        interpreter.load_table(&aml_table(&aml)).unwrap();
        interpreter.evaluate(path("\\WRIT"), vec![Object::Integer(value).wrap()]).unwrap();
        assert_eq!(
            integer(interpreter.evaluate(path("\\FLD0"), vec![]).unwrap()),
            value,
            "access type {}, offset {}, width {}",
            access_type,
            offset,
            width
        );
    }
}

#[test]
fn evaluations_never_overlap() {
    /*
     * Method (MAIN, 0) {
     *     Sleep (One)
     *     Sleep (One)
     *     Return (One)
     * }
     */
    let aml = method(b"MAIN", 0, &[0x5b, 0x22, 0x01, 0x5b, 0x22, 0x01, 0xa4, 0x01]);

    let host = TestHandler::new();
    let interpreter = Interpreter::new(host.clone());
    interpreter.load_table(&aml_table(&aml)).unwrap();

    std::thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                for _ in 0..8 {
                    assert_eq!(integer(interpreter.evaluate(path("\\MAIN"), vec![]).unwrap()), 1);
                }
            });
        }
    });
    assert_eq!(host.max_concurrent_calls(), 1);
}

#[test]
fn evaluate_returns_a_copy_of_data_objects() {
    /*
     * Name (INT_, 5)
     * Name (PKG_, Package () { One })
     * Method (GETI, 0) { Return (INT_) }
     */
    let aml = [
        &[0x08, b'I', b'N', b'T', b'_', 0x0a, 0x05][..],
        &[0x08, b'P', b'K', b'G', b'_'],
        &with_pkg(&[0x12], &[0x01, 0x01]),
        &method(b"GETI", 0, &[0xa4, b'I', b'N', b'T', b'_']),
    ]
    .concat();

    let interpreter = Interpreter::new(TestHandler::new());
    interpreter.load_table(&aml_table(&aml)).unwrap();

    let value = interpreter.evaluate(path("\\INT_"), vec![]).unwrap();
    *value.lock() = Object::Integer(99);
    assert_eq!(integer(interpreter.evaluate(path("\\INT_"), vec![]).unwrap()), 5);

    let value = interpreter.evaluate(path("\\GETI"), vec![]).unwrap();
    *value.lock() = Object::Integer(99);
    assert_eq!(integer(interpreter.evaluate(path("\\INT_"), vec![]).unwrap()), 5);

    let package = interpreter.evaluate(path("\\PKG_"), vec![]).unwrap();
    if let Object::Package(elements) = &*package.lock() {
        *elements[0].lock() = Object::Integer(9);
    }
    match interpreter.evaluate(path("\\PKG_"), vec![]).unwrap().snapshot() {
        Object::Package(elements) => assert_eq!(integer(elements[0].clone()), 1),
        other => panic!("PKG_ is {:?}", other.typ()),
    }
}

#[test]
fn redeclaration_needs_namespace_override() {
    /*
     * Name (VALU, 5)
     * Method (MAIN, 0) {
     *     Name (\VALU, 7)
     *     Return (\VALU)
     * }
     */
    let aml = [
        &[0x08, b'V', b'A', b'L', b'U', 0x0a, 0x05][..],
        &method(
            b"MAIN",
            0,
            &[0x08, b'\\', b'V', b'A', b'L', b'U', 0x0a, 0x07, 0xa4, b'\\', b'V', b'A', b'L', b'U'],
        ),
    ]
    .concat();

    let interpreter = Interpreter::new(TestHandler::new());
    interpreter.load_table(&aml_table(&aml)).unwrap();
    assert!(matches!(interpreter.evaluate(path("\\MAIN"), vec![]).err(), Some(AmlError::NameCollision(_))));
    assert_eq!(integer(interpreter.evaluate(path("\\VALU"), vec![]).unwrap()), 5);

    let config = Config { runtime_namespace_override: true, ..Config::default() };
    let interpreter = Interpreter::with_config(TestHandler::new(), config);
    interpreter.load_table(&aml_table(&aml)).unwrap();
    assert_eq!(integer(interpreter.evaluate(path("\\MAIN"), vec![]).unwrap()), 7);
}

#[test]
fn ssdt_redeclaration_needs_namespace_override() {
    /*
     * DSDT: Name (VALU, 5)
     * SSDT: Name (VALU, 9)
     *       Name (SSDN, 1)
     */
    let dsdt = aml_table(&[0x08, b'V', b'A', b'L', b'U', 0x0a, 0x05]);
    let ssdt = make_table(b"SSDT", 2, &[0x08, b'V', b'A', b'L', b'U', 0x0a, 0x09, 0x08, b'S', b'S', b'D', b'N', 0x01]);

    let interpreter = Interpreter::new(TestHandler::new());
    interpreter.load_table(&dsdt).unwrap();
    interpreter.load_table(&ssdt).unwrap();
    assert_eq!(integer(interpreter.evaluate(path("\\VALU"), vec![]).unwrap()), 5);
    assert_eq!(integer(interpreter.evaluate(path("\\SSDN"), vec![]).unwrap()), 1);

    let config = Config { runtime_namespace_override: true, ..Config::default() };
    let interpreter = Interpreter::with_config(TestHandler::new(), config);
    interpreter.load_table(&dsdt).unwrap();
    interpreter.load_table(&ssdt).unwrap();
    assert_eq!(integer(interpreter.evaluate(path("\\VALU"), vec![]).unwrap()), 9);
    assert_eq!(integer(interpreter.evaluate(path("\\SSDN"), vec![]).unwrap()), 1);
}

#[test]
fn strict_scope_mode_refuses_data_objects() {
    /*
     * Name (DEBB, 0)
     * Scope (DEBB) { Name (INNR, 1) }
     * Name (AFTR, 2)
     */
    let aml = [
        &[0x08, b'D', b'E', b'B', b'B', 0x0a, 0x00][..],
        &with_pkg(&[0x10], &[b'D', b'E', b'B', b'B', 0x08, b'I', b'N', b'N', b'R', 0x01]),
        &[0x08, b'A', b'F', b'T', b'R', 0x0a, 0x02],
    ]
    .concat();

    let config = Config { strict_scope_retyping: true, ..Config::default() };
    let interpreter = Interpreter::with_config(TestHandler::new(), config);
    interpreter.load_table(&aml_table(&aml)).unwrap();

    let node = interpreter.lookup(&path("\\DEBB")).unwrap();
    assert_eq!(interpreter.namespace.read().typ(node).unwrap(), ObjectType::Integer);
    assert_eq!(integer(interpreter.evaluate(path("\\DEBB"), vec![]).unwrap()), 0);
    assert!(interpreter.lookup(&path("\\DEBB.INNR")).is_err());
    assert_eq!(integer(interpreter.evaluate(path("\\AFTR"), vec![]).unwrap()), 2);

    // Without strict mode, the scope is opened on the retyped node
    let interpreter = Interpreter::new(TestHandler::new());
    interpreter.load_table(&aml_table(&aml)).unwrap();
    assert_eq!(integer(interpreter.evaluate(path("\\DEBB.INNR"), vec![]).unwrap()), 1);
}

#[test]
fn dsdt_copy_ignores_later_changes_to_memory() {
    const DSDT_ADDRESS: u64 = 0x20_0000;
    let original = aml_table(&[0x08, b'V', b'A', b'L', b'U', 0x0a, 0x01]);
    let changed = aml_table(&[0x08, b'V', b'A', b'L', b'U', 0x0a, 0x02]);

    // Mapped in place, the table is read again when it's loaded
    let host = TestHandler::new();
    host.add_table(DSDT_ADDRESS, &original);
    let interpreter = Interpreter::new(host.clone());
    let dsdt = interpreter.install_physical_table(DSDT_ADDRESS).unwrap();
    assert_eq!(host.num_mappings(), 1);
    host.add_table(DSDT_ADDRESS, &changed);
    interpreter.load_installed_table(dsdt).unwrap();
    assert_eq!(integer(interpreter.evaluate(path("\\VALU"), vec![]).unwrap()), 2);

    // A local copy is loaded as it was when it was installed
    let host = TestHandler::new();
    host.add_table(DSDT_ADDRESS, &original);
    let config = Config { copy_dsdt_locally: true, ..Config::default() };
    let interpreter = Interpreter::with_config(host.clone(), config);
    let dsdt = interpreter.install_physical_table(DSDT_ADDRESS).unwrap();
    assert_eq!(host.num_mappings(), 0);
    host.add_table(DSDT_ADDRESS, &changed);
    interpreter.load_installed_table(dsdt).unwrap();
    assert_eq!(integer(interpreter.evaluate(path("\\VALU"), vec![]).unwrap()), 1);
}

#[test]
fn mapped_tables_are_checked_again_on_load() {
    const DSDT_ADDRESS: u64 = 0x20_0000;
    let original = aml_table(&[0x08, b'V', b'A', b'L', b'U', 0x0a, 0x01]);
    let mut corrupted = original.clone();
    let last = corrupted.len() - 1;
    corrupted[last] = 0x03;

    let host = TestHandler::new();
    host.add_table(DSDT_ADDRESS, &original);
    let interpreter = Interpreter::new(host.clone());
    let dsdt = interpreter.install_physical_table(DSDT_ADDRESS).unwrap();
    host.add_table(DSDT_ADDRESS, &corrupted);
    assert!(matches!(interpreter.load_installed_table(dsdt), Err(AmlError::TableInvalidChecksum(_))));
    assert!(interpreter.lookup(&path("\\VALU")).is_err());
}

#[test]
fn unloading_a_physical_table_releases_its_mapping() {
    const SSDT_ADDRESS: u64 = 0x30_0000;
    let host = TestHandler::new();
    host.add_table(SSDT_ADDRESS, &make_table(b"SSDT", 2, &[0x08, b'S', b'S', b'D', b'N', 0x0a, 0x07]));

    let interpreter = Interpreter::new(host.clone());
    interpreter.load_table(&aml_table(&[])).unwrap();
    let ssdt = interpreter.install_physical_table(SSDT_ADDRESS).unwrap();
    interpreter.load_installed_table(ssdt).unwrap();
    assert_eq!(host.num_mappings(), 1);

    interpreter.unload_table(ssdt).unwrap();
    assert_eq!(host.num_mappings(), 0);
    assert!(interpreter.lookup(&path("\\SSDN")).is_err());
}

#[test]
fn locked_fields_hold_the_global_lock() {
    /*
     * OperationRegion (RGN1, SystemMemory, 0x100, 0x10)
     * Field (RGN1, ByteAcc, Lock, Preserve) { FLD0, 8 }
     */
    let aml = [
        &[0x5b, 0x80, b'R', b'G', b'N', b'1', 0x00, 0x0b, 0x00, 0x01, 0x0a, 0x10][..],
        &with_pkg(&[0x5b, 0x81], &[b'R', b'G', b'N', b'1', 0x11, b'F', b'L', b'D', b'0', 0x08]),
    ]
    .concat();

    let host = TestHandler::new();
    let interpreter = Interpreter::new(host.clone());
    interpreter.load_table(&aml_table(&aml)).unwrap();

    let global_lock = interpreter.lookup(&path("\\_GL_")).unwrap();
    let mutex = match interpreter.namespace.read().object(global_lock).unwrap().unwrap().snapshot() {
        Object::Mutex { mutex, .. } => mutex,
        other => panic!("_GL_ is {:?}", other.typ()),
    };

    crate::Handler::acquire(&host, mutex, 0).unwrap();
    assert_eq!(interpreter.evaluate(path("\\FLD0"), vec![]).err(), Some(AmlError::MutexTimeout));
    crate::Handler::release(&host, mutex);

    assert_eq!(integer(interpreter.evaluate(path("\\FLD0"), vec![]).unwrap()), 0);
    assert!(!host.is_held(mutex));
    assert!(host.accesses().contains(&Access::Memory { address: 0x100, width: 8, write: false }));
}
