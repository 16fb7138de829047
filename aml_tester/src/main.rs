/*
 * This is a small program for testing the interpreter on artificial AML. It:
 *      - scans a directory (or takes a list of files) for ASL and AML files
 *      - compiles ASL files into AML with `iasl`, unless the AML file is newer than the ASL
 *      - loads each AML file into an interpreter, and runs `\MAIN` if the file defines it
 *      - prints a summary of which files passed, and why the others failed
 */

use acpi_aml::{namespace::AmlName, AmlError, Config, Handle, Interpreter};
use clap::{Arg, ArgAction, ArgGroup, ArgMatches};
use pci_types::PciAddress;
use std::{
    collections::HashSet,
    ffi::OsStr,
    fs,
    io::Write,
    path::{Path, PathBuf},
    process::Command,
    str::FromStr,
};

enum CompilationOutcome {
    Ignored,
    IsAml(PathBuf),
    Newer(PathBuf),
    NotCompiled(PathBuf),
    Failed(PathBuf),
    Succeeded(PathBuf),
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
enum TestResult {
    Pass,
    /// `iasl` failed to compile the ASL.
    CompileFail,
    /// The interpreter failed to load the table, or `\MAIN` failed.
    ParseFail,
    /// The ASL needed compiling, but `iasl` isn't installed.
    NotCompiled,
}

fn main() -> std::io::Result<()> {
    let mut cmd = clap::Command::new("aml_tester")
        .version("v0.1.0")
        .author("Isaac Woods")
        .about("Compiles and tests ASL files")
        .arg(Arg::new("no_compile").long("no-compile").action(ArgAction::SetTrue).help("Don't compile ASL to AML"))
        .arg(
            Arg::new("combined")
                .long("combined")
                .action(ArgAction::SetTrue)
                .help("Don't clear the namespace between tests"),
        )
        .arg(
            Arg::new("copy_dsdt_locally")
                .long("copy-dsdt-locally")
                .action(ArgAction::SetTrue)
                .help("Keep an owned copy of the DSDT"),
        )
        .arg(
            Arg::new("enable_interpreter_slack")
                .long("enable-interpreter-slack")
                .action(ArgAction::SetTrue)
                .help("Tolerate uninitialized locals and missing return values"),
        )
        .arg(
            Arg::new("runtime_namespace_override")
                .long("runtime-namespace-override")
                .action(ArgAction::SetTrue)
                .help("Let later declarations replace existing objects"),
        )
        .arg(
            Arg::new("do_not_use_xsdt")
                .long("do-not-use-xsdt")
                .action(ArgAction::SetTrue)
                .help("Prefer the RSDT and 32-bit table pointers"),
        )
        .arg(Arg::new("path").short('p').long("path").required(false).action(ArgAction::Set).value_name("DIR"))
        .arg(
            Arg::new("files")
                .action(ArgAction::Append)
                .value_parser(clap::value_parser!(PathBuf))
                .value_name("FILE.{asl,aml}"),
        )
        .group(ArgGroup::new("files_list").args(["path", "files"]).required(true));
    if std::env::args().count() <= 1 {
        cmd.print_help()?;
        return Ok(());
    }
    log::set_logger(&Logger).unwrap();
    log::set_max_level(log::LevelFilter::Info);

    let matches = cmd.get_matches();
    let config = Config {
        copy_dsdt_locally: matches.get_flag("copy_dsdt_locally"),
        enable_interpreter_slack: matches.get_flag("enable_interpreter_slack"),
        runtime_namespace_override: matches.get_flag("runtime_namespace_override"),
        do_not_use_xsdt: matches.get_flag("do_not_use_xsdt"),
        ..Config::default()
    };

    // Make sure we have the ability to compile ASL -> AML, if user wants it
    let user_wants_compile = !matches.get_flag("no_compile");
    let can_compile = user_wants_compile &&
        // Test if `iasl` is installed, so we can give a good error later if it's not
        match Command::new("iasl").arg("-v").status() {
            Ok(exit_status) if exit_status.success() => true,
            Ok(exit_status) => {
                panic!("`iasl` exited with unsuccessful status: {:?}", exit_status);
            },
            Err(_) => false,
    };

    let tests = find_tests(&matches)?;
    let compiled_files =
        tests.iter().map(|name| resolve_and_compile(name, can_compile)).collect::<std::io::Result<Vec<_>>>()?;

    if user_wants_compile
        && compiled_files.iter().any(|outcome| matches!(outcome, CompilationOutcome::NotCompiled(_)))
    {
        panic!(
            "`iasl` is not installed, but we want to compile some ASL files! Pass --no-compile, or install `iasl`"
        );
    }
    if user_wants_compile {
        let (passed, failed) = compiled_files.iter().fold((0, 0), |(passed, failed), outcome| match outcome {
            CompilationOutcome::Succeeded(_) => (passed + 1, failed),
            CompilationOutcome::Failed(_) => (passed, failed + 1),
            _ => (passed, failed),
        });
        if passed + failed > 0 {
            println!(
                "Compiled {} ASL files: {}{} passed{}, {}{} failed{}",
                passed + failed,
                termion::color::Fg(termion::color::Green),
                passed,
                termion::style::Reset,
                termion::color::Fg(termion::color::Red),
                failed,
                termion::style::Reset
            );
            println!();
        }
    }

    let mut dedup_list: HashSet<PathBuf> = HashSet::new();
    let mut summaries: Vec<(PathBuf, TestResult)> = Vec::new();
    let aml_files = compiled_files
        .iter()
        .filter_map(|outcome| match outcome {
            CompilationOutcome::IsAml(path) | CompilationOutcome::Newer(path) | CompilationOutcome::Succeeded(path) => {
                Some(path.clone())
            }
            CompilationOutcome::Failed(path) => {
                summaries.push((path.clone(), TestResult::CompileFail));
                None
            }
            CompilationOutcome::NotCompiled(path) => {
                summaries.push((path.clone(), TestResult::NotCompiled));
                None
            }
            CompilationOutcome::Ignored => None,
        })
        .filter(|path| dedup_list.insert(path.clone()))
        .collect::<Vec<_>>();

    let combined_test = matches.get_flag("combined");
    let mut interpreter = Interpreter::with_config(Handler, config.clone());

    let (passed, failed) = aml_files.into_iter().fold((0, 0), |(passed, failed), file_entry| {
        print!("Testing AML file: {:?}... ", file_entry);
        std::io::stdout().flush().unwrap();

        let contents = match fs::read(&file_entry) {
            Ok(contents) => contents,
            Err(err) => {
                println!("{}Failed to read ({}){}", termion::color::Fg(termion::color::Red), err, termion::style::Reset);
                summaries.push((file_entry, TestResult::CompileFail));
                return (passed, failed + 1);
            }
        };

        if !combined_test {
            interpreter = Interpreter::with_config(Handler, config.clone());
        }

        match run_test(&contents, &interpreter) {
            Ok(()) => {
                println!("{}OK{}", termion::color::Fg(termion::color::Green), termion::style::Reset);
                println!("Namespace: {}", interpreter.namespace.read());
                summaries.push((file_entry, TestResult::Pass));
                (passed + 1, failed)
            }
            Err(err) => {
                println!("{}Failed ({:?}){}", termion::color::Fg(termion::color::Red), err, termion::style::Reset);
                println!("Namespace: {}", interpreter.namespace.read());
                summaries.push((file_entry, TestResult::ParseFail));
                (passed, failed + 1)
            }
        }
    });

    println!("Summary:");
    for (file, status) in summaries.iter() {
        let status = match status {
            TestResult::Pass => {
                format!("{}OK{}", termion::color::Fg(termion::color::Green), termion::style::Reset)
            }
            TestResult::CompileFail => {
                format!("{}COMPILE FAIL{}", termion::color::Fg(termion::color::Red), termion::style::Reset)
            }
            TestResult::ParseFail => {
                format!("{}PARSE FAIL{}", termion::color::Fg(termion::color::Red), termion::style::Reset)
            }
            TestResult::NotCompiled => {
                format!("{}NOT COMPILED{}", termion::color::Fg(termion::color::Red), termion::style::Reset)
            }
        };
        println!("\t{:<50}: {}", file.display(), status);
    }
    println!(
        "\nTest results: {}{} passed{}, {}{} failed{}",
        termion::color::Fg(termion::color::Green),
        passed,
        termion::style::Reset,
        termion::color::Fg(termion::color::Red),
        failed,
        termion::style::Reset
    );
    Ok(())
}

/// Load a table, then run `\MAIN` if it exists. Its return value, if any, is printed but not checked.
fn run_test(table: &[u8], interpreter: &Interpreter) -> Result<(), AmlError> {
    interpreter.load_table(table)?;

    let main = AmlName::from_str("\\MAIN")?;
    match interpreter.evaluate_if_present(main, vec![]) {
        Ok(Some(result)) => {
            println!("\\MAIN returned {:?}", result);
            Ok(())
        }
        Ok(None) | Err(AmlError::NoReturnValue) => Ok(()),
        Err(err) => Err(err),
    }
}

fn find_tests(matches: &ArgMatches) -> std::io::Result<Vec<PathBuf>> {
    let files: Vec<PathBuf> = if let Some(dir_path) = matches.get_one::<String>("path") {
        let dir_path = Path::new(dir_path);

        if fs::metadata(dir_path)?.is_dir() {
            println!("Running tests in directory: {:?}", dir_path);
            fs::read_dir(dir_path)?.filter_map(|entry| entry.ok().map(|entry| entry.path())).collect()
        } else {
            println!("Running single test: {:?}", dir_path);
            vec![dir_path.to_path_buf()]
        }
    } else {
        matches.get_many::<PathBuf>("files").unwrap_or_default().cloned().collect()
    };

    // Make sure all files exist, propagate error if it occurs
    for path in &files {
        if !path.is_file() {
            println!("Not a regular file: {}", path.display());
            path.metadata()?;
        }
    }

    Ok(files)
}

/// Determine what to do with this file - ignore, compile and parse, or just parse.
/// If ".aml" does not exist, or if ".asl" is newer, compiles the file.
/// If the ".aml" file is newer, indicate it is ready to parse.
fn resolve_and_compile(path: &PathBuf, can_compile: bool) -> std::io::Result<CompilationOutcome> {
    if path.extension() == Some(OsStr::new("aml")) && path.metadata()?.is_file() {
        return Ok(CompilationOutcome::IsAml(path.clone()));
    }

    if path.extension() != Some(OsStr::new("asl")) || !path.metadata()?.is_file() {
        return Ok(CompilationOutcome::Ignored);
    }

    let aml_path = path.with_extension("aml");

    if aml_path.is_file() {
        let asl_last_modified = path.metadata()?.modified()?;
        let aml_last_modified = aml_path.metadata()?.modified()?;
        if asl_last_modified <= aml_last_modified {
            return Ok(CompilationOutcome::Newer(aml_path));
        }
    }

    if !can_compile {
        return Ok(CompilationOutcome::NotCompiled(path.clone()));
    }

    println!("Compiling file: {}", path.display());
    let output = Command::new("iasl").arg(path).output()?;

    if !output.status.success() {
        println!(
            "Failed to compile ASL file: {}. Output from iasl:\n {}",
            path.display(),
            String::from_utf8_lossy(&output.stderr)
        );
        Ok(CompilationOutcome::Failed(path.clone()))
    } else {
        Ok(CompilationOutcome::Succeeded(aml_path))
    }
}

struct Logger;

impl log::Log for Logger {
    fn enabled(&self, _: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        println!("[{}] {}", record.level(), record.args());
    }

    fn flush(&self) {
        std::io::stdout().flush().unwrap();
    }
}

/// A host that logs every hardware access and reads zeros.
struct Handler;

impl acpi_aml::Handler for Handler {
    fn read_u8(&self, address: usize) -> u8 {
        println!("read_u8 {address:#x}");
        0
    }
    fn read_u16(&self, address: usize) -> u16 {
        println!("read_u16 {address:#x}");
        0
    }
    fn read_u32(&self, address: usize) -> u32 {
        println!("read_u32 {address:#x}");
        0
    }
    fn read_u64(&self, address: usize) -> u64 {
        println!("read_u64 {address:#x}");
        0
    }

    fn write_u8(&self, address: usize, value: u8) {
        println!("write_u8 {address:#x}<-{value:#x}");
    }
    fn write_u16(&self, address: usize, value: u16) {
        println!("write_u16 {address:#x}<-{value:#x}");
    }
    fn write_u32(&self, address: usize, value: u32) {
        println!("write_u32 {address:#x}<-{value:#x}");
    }
    fn write_u64(&self, address: usize, value: u64) {
        println!("write_u64 {address:#x}<-{value:#x}");
    }

    fn read_io_u8(&self, port: u16) -> u8 {
        println!("read_io_u8 {port:#x}");
        0
    }
    fn read_io_u16(&self, port: u16) -> u16 {
        println!("read_io_u16 {port:#x}");
        0
    }
    fn read_io_u32(&self, port: u16) -> u32 {
        println!("read_io_u32 {port:#x}");
        0
    }

    fn write_io_u8(&self, port: u16, value: u8) {
        println!("write_io_u8 {port:#x}<-{value:#x}");
    }
    fn write_io_u16(&self, port: u16, value: u16) {
        println!("write_io_u16 {port:#x}<-{value:#x}");
    }
    fn write_io_u32(&self, port: u16, value: u32) {
        println!("write_io_u32 {port:#x}<-{value:#x}");
    }

    fn read_pci_u8(&self, address: PciAddress, offset: u16) -> u8 {
        println!("read_pci_u8 ({address}, {offset:#x})");
        0
    }
    fn read_pci_u16(&self, address: PciAddress, offset: u16) -> u16 {
        println!("read_pci_u16 ({address}, {offset:#x})");
        0
    }
    fn read_pci_u32(&self, address: PciAddress, offset: u16) -> u32 {
        println!("read_pci_u32 ({address}, {offset:#x})");
        0
    }

    fn write_pci_u8(&self, address: PciAddress, offset: u16, value: u8) {
        println!("write_pci_u8 ({address}, {offset:#x})<-{value:#x}");
    }
    fn write_pci_u16(&self, address: PciAddress, offset: u16, value: u16) {
        println!("write_pci_u16 ({address}, {offset:#x})<-{value:#x}");
    }
    fn write_pci_u32(&self, address: PciAddress, offset: u16, value: u32) {
        println!("write_pci_u32 ({address}, {offset:#x})<-{value:#x}");
    }

    fn nanos_since_boot(&self) -> u64 {
        0
    }

    fn stall(&self, microseconds: u64) {
        println!("Stalling for {}us", microseconds);
    }
    fn sleep(&self, milliseconds: u64) {
        println!("Sleeping for {}ms", milliseconds);
    }

    fn create_mutex(&self) -> Handle {
        Handle(0)
    }
    fn acquire(&self, _mutex: Handle, _timeout: u16) -> Result<(), AmlError> {
        Ok(())
    }
    fn release(&self, _mutex: Handle) {}

    fn create_event(&self) -> Handle {
        Handle(0)
    }
    fn wait_event(&self, _event: Handle, _timeout: u16) -> Result<(), AmlError> {
        Ok(())
    }
    fn signal_event(&self, _event: Handle) {}
    fn reset_event(&self, _event: Handle) {}

    fn breakpoint(&self) {
        println!("Breakpoint");
    }
}
