// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Frame-pointer stack unwinding over captured memory.

use crate::MAX_STACK_DEPTH;
use dumpmem::MemoryMap;

/// One recovered frame: the return address and the frame pointer it was
/// found through (zero for the initial frame).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub rip: u64,
    pub frame_pointer: u64,
}

/// The result of an unwind attempt. `fault` records the memory error that
/// stopped the walk, if any; `truncated` is set when the depth cap was the
/// limit instead.
#[derive(Debug, Default)]
pub struct Unwind {
    pub frames: Vec<StackFrame>,
    pub truncated: bool,
    pub fault: Option<dumpmem::Error>,
}

/// Unwinds from a register frame by chasing saved frame pointers: each
/// frame holds the caller's RBP at `[rbp]` and the return address at
/// `[rbp + 8]`. The frame pointer must move strictly upward (stacks grow
/// down) or the walk stops, which bounds it even through corrupt loops.
pub fn unwind_stack(memory: &MemoryMap, root: u64, rip: u64, rsp: u64, rbp: u64) -> Unwind {
    let mut out = Unwind::default();
    out.frames.push(StackFrame {
        rip,
        frame_pointer: 0,
    });

    let mut frame = rbp;
    let mut floor = rsp.min(rbp);
    while out.frames.len() < MAX_STACK_DEPTH {
        if frame == 0 || frame < floor {
            return out;
        }
        let saved_rbp = match memory.read_plain::<u64>(root, frame) {
            Ok(v) => v,
            Err(err) => {
                out.fault = Some(err);
                return out;
            }
        };
        let return_rip = match memory.read_plain::<u64>(root, frame.wrapping_add(8)) {
            Ok(v) => v,
            Err(err) => {
                out.fault = Some(err);
                return out;
            }
        };
        if return_rip == 0 {
            return out;
        }
        out.frames.push(StackFrame {
            rip: return_rip,
            frame_pointer: frame,
        });
        if saved_rbp <= frame {
            return out;
        }
        floor = frame;
        frame = saved_rbp;
    }
    out.truncated = true;
    out
}
