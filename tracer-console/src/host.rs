use std::io::{self, BufRead, Write};
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use winapi::um::handleapi::{CloseHandle, INVALID_HANDLE_VALUE};
use winapi::um::tlhelp32::{
    CreateToolhelp32Snapshot, Process32FirstW, Process32NextW, PROCESSENTRY32W, TH32CS_SNAPPROCESS,
};

use tracer::{InstructionType, TracedInstruction};

const MAX_TRACES: usize = 512;

/// How deep the built-in demo workload recurses.
const DEMO_DEPTH: u32 = 5;

fn print_process_overview() {
    let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0) };
    if snapshot == INVALID_HANDLE_VALUE {
        return;
    }

    let mut entry: PROCESSENTRY32W = unsafe { mem::zeroed() };
    entry.dwSize = mem::size_of::<PROCESSENTRY32W>() as u32;

    println!("Running processes:");
    println!("===================================");

    if unsafe { Process32FirstW(snapshot, &mut entry) } != 0 {
        loop {
            let len = entry
                .szExeFile
                .iter()
                .position(|&c| c == 0)
                .unwrap_or(entry.szExeFile.len());
            let name = String::from_utf16_lossy(&entry.szExeFile[..len]);
            println!("{} (PID: {})", name, entry.th32ProcessID);

            if unsafe { Process32NextW(snapshot, &mut entry) } == 0 {
                break;
            }
        }
    }

    println!("===================================");
    unsafe { CloseHandle(snapshot) };
}

fn prompt(message: &str) -> String {
    print!("{}", message);
    io::stdout().flush().ok();

    let mut line = String::new();
    io::stdin().lock().read_line(&mut line).ok();
    line.trim().to_string()
}

#[inline(never)]
fn demo_workload(n: u32) -> u32 {
    if n <= 1 {
        return 1;
    }
    n * demo_workload(n - 1)
}

fn kind_tag(kind: InstructionType) -> &'static str {
    match kind {
        InstructionType::Call => "call>",
        InstructionType::Return => "<ret ",
        InstructionType::Branch => "jump ",
    }
}

fn drain_and_print(count_hint: &mut usize) {
    let mut traces = [TracedInstruction::default(); MAX_TRACES];
    let fetched = tracer::fetch_traces(&mut traces).unwrap_or(0);

    for trace in &traces[..fetched] {
        println!(
            "{:2} {} {:08X} -> {:08X}  {}",
            trace.call_depth,
            kind_tag(trace.kind),
            trace.branch_source,
            trace.branch_target,
            trace.decoded_text(),
        );
    }
    *count_hint += fetched;
}

pub fn run() {
    print_process_overview();

    if let Err(error) = tracer::init(tracer::LIBRARY_VERSION, true) {
        eprintln!("init failed: {}", error);
        return;
    }
    println!("Tracer v{}", tracer::version());

    let pid: i32 = prompt("Enter process id (empty for this process): ")
        .parse()
        .unwrap_or(-1);

    let context = match tracer::attach_process(pid, None) {
        Ok(context) => context,
        Err(error) => {
            eprintln!("Can't attach to process {}: {}", pid, error);
            return;
        }
    };
    println!("Attached to process {}.", context.pid());
    tracer::set_process_context(Some(context.clone()));

    let input = prompt("Enter function address to trace (hex, empty for built-in demo): ");
    let (address, run_demo) = if input.is_empty() && context.is_local() {
        (demo_workload as *const () as usize, true)
    } else {
        match usize::from_str_radix(input.trim_start_matches("0x"), 16) {
            Ok(address) => (address, false),
            Err(_) => {
                eprintln!("Not a hex address: {}", input);
                return;
            }
        }
    };

    if let Err(error) = tracer::start_trace(address, -1, -1, -1) {
        eprintln!("start_trace failed: {}", error);
        return;
    }
    println!("Tracing {:#x}. Press enter to stop.", address);

    if run_demo {
        println!("demo_workload({}) = {}", DEMO_DEPTH, demo_workload(DEMO_DEPTH));
    }

    let ended = Arc::new(AtomicBool::new(false));
    let ended_console = Arc::clone(&ended);
    let console = std::thread::spawn(move || {
        let mut line = String::new();
        io::stdin().lock().read_line(&mut line).ok();
        ended_console.store(true, Ordering::Relaxed);
    });

    let mut total = 0;
    while !ended.load(Ordering::Relaxed) {
        drain_and_print(&mut total);
        std::thread::sleep(Duration::from_millis(1));
    }
    drain_and_print(&mut total);
    println!("{} record(s) total.", total);

    console.join().ok();

    tracer::stop_trace(address, -1).ok();
    tracer::shutdown().ok();
}
