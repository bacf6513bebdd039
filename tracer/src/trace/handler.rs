//! The vectored exception dispatcher.
//!
//! Registered first in the process-wide chain, reacting only to single-step
//! exceptions. Everything else passes through untouched. Per-thread state
//! lives in [`crate::tls`]; the captured CPU context is edited in place to
//! steer the CPU into (and out of) branch-trap single-stepping.

use std::time::Duration;

use iced_x86::{Decoder, DecoderOptions, Formatter, IntelFormatter};
use winapi::shared::ntdef::LONG;
use winapi::um::minwinbase::EXCEPTION_SINGLE_STEP;
use winapi::um::processthreadsapi::GetCurrentThreadId;
use winapi::um::winnt::{CONTEXT, EXCEPTION_POINTERS, EXCEPTION_RECORD};
use winapi::vc::excpt::{EXCEPTION_CONTINUE_EXECUTION, EXCEPTION_CONTINUE_SEARCH};

use crate::bits;
use crate::hwbp::{self, Condition};
use crate::record::{InstructionType, RegisterSet, TextSink, TracedInstruction, MAX_INSTRUCTION_BYTES};
use crate::tls;
use crate::trace::TraceContext;

bitflags::bitflags! {
    /// Trace-control bits in DR7.
    struct DebugControl: u32 {
        /// Record the source of the most recent branch (surfaces in the
        /// exception information).
        const LAST_BRANCH_RECORD = 1 << 8;
        /// Trap on the next taken branch instead of the next instruction.
        const BRANCH_TRAP = 1 << 9;
    }
}

/// Single-step flag in EFLAGS.
const EFLAGS_TRAP: u32 = 1 << 8;

/// Turns branch-trap single-stepping on or off in a captured context.
fn set_trace_flags(context: &mut CONTEXT, enable: bool) {
    let control = DebugControl::LAST_BRANCH_RECORD | DebugControl::BRANCH_TRAP;
    if enable {
        context.Dr7 |= control.bits();
        context.EFlags |= EFLAGS_TRAP;
    } else {
        context.Dr7 &= !control.bits();
        context.EFlags &= !EFLAGS_TRAP;
    }
}

fn capture_registers(context: &CONTEXT) -> RegisterSet {
    RegisterSet {
        eax: context.Eax,
        ebx: context.Ebx,
        ecx: context.Ecx,
        edx: context.Edx,
        esi: context.Esi,
        edi: context.Edi,
        ebp: context.Ebp,
        esp: context.Esp,

        seg_gs: context.SegGs,
        seg_fs: context.SegFs,
        seg_es: context.SegEs,
        seg_ds: context.SegDs,
        seg_cs: context.SegCs,
        seg_ss: context.SegSs,
    }
}

/// Decodes the branch behind this single-step event, emits its record and
/// decides whether the trace goes on. Returns the continue decision and the
/// address execution will return to if the trace gets suspended at this
/// point: the pushed return address for a call, the branch target otherwise.
fn trace_instruction(
    trace_context: &TraceContext,
    record: &EXCEPTION_RECORD,
    context: &CONTEXT,
) -> (bool, usize) {
    let exception_address = record.ExceptionAddress as usize;

    if trace_context.current_trace().is_none() {
        return (false, exception_address);
    }

    let last_branch = record.ExceptionInformation[0] as usize;
    if last_branch == 0 {
        // No last-branch record on this event (e.g. the plain single step
        // right after the entry breakpoint); nothing to emit yet.
        return (true, exception_address);
    }

    let bytes =
        unsafe { core::slice::from_raw_parts(last_branch as *const u8, MAX_INSTRUCTION_BYTES) };
    let mut decoder = Decoder::with_ip(32, bytes, last_branch as u64, DecoderOptions::NONE);
    let instruction = decoder.decode();
    if instruction.is_invalid() {
        // Undecodable branch source: give up on this trace, keep the process
        // running.
        return (false, exception_address);
    }

    let mut item = TracedInstruction::zeroed();
    item.trace_id = tls::current_trace_id();
    item.thread_id = unsafe { GetCurrentThreadId() } as i32;
    item.branch_source = last_branch as u32;
    item.branch_target = exception_address as u32;
    item.registers = capture_registers(context);

    let continue_trace;
    let resume_address;

    match InstructionType::from_flow_control(instruction.flow_control()) {
        InstructionType::Call => {
            item.kind = InstructionType::Call;
            item.call_depth = tls::on_branch_entered();
            continue_trace = item.call_depth >= 0;

            // The value the call just pushed is where execution will return.
            resume_address = unsafe { *(context.Esp as *const u32) } as usize;
        }
        InstructionType::Return => {
            item.kind = InstructionType::Return;
            item.call_depth = tls::on_branch_returned();
            continue_trace = item.call_depth > 0;

            resume_address = context.Eip as usize;
        }
        InstructionType::Branch => {
            item.kind = InstructionType::Branch;
            item.call_depth = tls::call_depth();
            continue_trace = item.call_depth >= 0;

            resume_address = context.Eip as usize;
        }
    }

    let mut formatter = IntelFormatter::new();
    let mut sink = TextSink::new();
    formatter.format(&instruction, &mut sink);
    sink.copy_into(&mut item);

    // Records must not be dropped: wait for the consumer to drain.
    while !trace_context.ring().push(&item) {
        std::thread::sleep(Duration::from_millis(1));
    }

    (continue_trace, resume_address)
}

pub(crate) unsafe extern "system" fn vectored_handler(pointers: *mut EXCEPTION_POINTERS) -> LONG {
    let record = &*(*pointers).ExceptionRecord;
    if record.ExceptionCode != EXCEPTION_SINGLE_STEP {
        return EXCEPTION_CONTINUE_SEARCH;
    }

    let process = match crate::process::local::local_process() {
        Some(process) => process,
        None => return EXCEPTION_CONTINUE_SEARCH,
    };
    let trace_context = process.trace_context();

    let context = &mut *(*pointers).ContextRecord;
    let exception_address = record.ExceptionAddress as usize;

    let index = tls::active_breakpoint_index();
    if index == -1 {
        // No trace on this thread yet. Did one of our entry breakpoints
        // fire? Match the exception address against the armed slots.
        let slot = [context.Dr0, context.Dr1, context.Dr2, context.Dr3]
            .iter()
            .position(|&dr| dr as usize == exception_address);

        let slot = match slot {
            Some(slot) if bits::get_bits(context.Dr7, slot as u32 * 2, 1) == 1 => slot as u32,
            _ => return EXCEPTION_CONTINUE_SEARCH,
        };

        let trace = match trace_context.find_trace(exception_address, GetCurrentThreadId()) {
            Some(trace) => trace,
            None => return EXCEPTION_CONTINUE_SEARCH,
        };

        if !trace_context.try_install_current(trace) {
            // Another thread is already driving a trace; one tracer at a
            // time, so this hit is silently ignored.
            return EXCEPTION_CONTINUE_EXECUTION;
        }

        // Drop the slot's enable bit so the entry breakpoint cannot refire
        // on the instruction we are about to resume; it is restored on the
        // next handler entry so the entry stays armed for later invocations.
        bits::set_bits(&mut context.Dr7, slot * 2, 1, 0);
        tls::on_begin_new_trace(slot as i32);
    } else {
        bits::set_bits(&mut context.Dr7, index as u32 * 2, 1, 1);
    }

    // If a suspension one-shot just fired, clear it and compensate the call
    // that was elided while tracing was off.
    let resume_index = tls::suspended_breakpoint_index();
    if resume_index != -1 {
        hwbp::clear_slot(context, resume_index as u32);
        tls::set_suspended_breakpoint_index(-1);
        tls::on_branch_returned();
    }

    let (continue_trace, resume_address) = trace_instruction(trace_context, record, context);

    if continue_trace {
        let suspend = match trace_context.current_trace() {
            Some(current) => {
                !current.contains_code_address(exception_address)
                    || current.depth_capped(tls::call_depth())
            }
            None => true,
        };

        if suspend {
            // Run at full speed until execution comes back: a one-shot
            // execute breakpoint on the return site replaces the trap flags.
            match hwbp::set_on_context(resume_address, 1, context, Condition::Execute) {
                Ok(slot) => tls::set_suspended_breakpoint_index(slot as i32),
                Err(error) => {
                    log::warn!(
                        "No slot left for the resume breakpoint at {:#x}: {}",
                        resume_address,
                        error
                    );
                }
            }
            set_trace_flags(context, false);
        } else {
            set_trace_flags(context, true);
        }
    } else {
        // The traced function returned to its caller (or decoding failed):
        // account one completed invocation and put the thread back to normal
        // execution.
        trace_context.on_trace_finished(context);
        set_trace_flags(context, false);
        tls::on_trace_ended();
    }

    EXCEPTION_CONTINUE_EXECUTION
}
