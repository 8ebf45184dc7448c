// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Recovery of the hypervisor console ring buffer.

use crate::host::HostSymbols;
use crate::Error;
use dumpmem::MemoryMap;
use xendefs::XenCrashInfo;

/// Upper bound on a believable console ring; anything larger is treated as
/// corruption rather than attempted as one allocation.
const MAX_RING_SIZE: u64 = 16 << 20;

/// Reads the circular console ring and reassembles it in chronological
/// order. The ring location comes from the anchor note when present,
/// otherwise from the `conring`/`conring_size` symbols. Each of the (at
/// most two) spans of the ring is read independently; a span that faults
/// is replaced by a marker so the surviving text is still reported.
pub fn read_console_ring(
    memory: &MemoryMap,
    root: u64,
    info: &XenCrashInfo,
    symbols: &HostSymbols,
) -> Result<String, Error> {
    let (ring_va, size) = if info.console_ring_va != 0 && info.console_ring_size != 0 {
        (info.console_ring_va, info.console_ring_size)
    } else {
        let conring = symbols.conring.ok_or(Error::MissingSymbol {
            name: xendefs::SYM_CONRING,
        })?;
        let conring_size = symbols.conring_size.ok_or(Error::MissingSymbol {
            name: xendefs::SYM_CONRING_SIZE,
        })?;
        let ring_va = memory.read_plain::<u64>(root, conring)?;
        let size = u64::from(memory.read_plain::<u32>(root, conring_size)?);
        (ring_va, size)
    };
    if size == 0 || size > MAX_RING_SIZE {
        return Err(Error::ConsoleRingSize { size });
    }

    // Free-running producer/consumer counters; reduce modulo the ring size
    // and recover at most one ring's worth.
    let cons = read_index(memory, root, symbols.conring_cons).unwrap_or(0);
    let prod = read_index(memory, root, symbols.conring_prod).unwrap_or(size as u32);
    let used = u64::from(prod.wrapping_sub(cons)).min(size);
    let first = u64::from(prod).wrapping_sub(used) % size;

    let head_len = used.min(size - first);
    let tail_len = used - head_len;

    let mut out = String::new();
    for (va, len) in [(ring_va.wrapping_add(first), head_len), (ring_va, tail_len)] {
        if len == 0 {
            continue;
        }
        match memory.read_virt(root, va, len as usize) {
            Ok(bytes) => append_text(&mut out, &bytes),
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "console ring span unreadable"
                );
                out.push_str(&format!("<unreadable console ring span: {err}>\n"));
            }
        }
    }
    Ok(out)
}

fn read_index(memory: &MemoryMap, root: u64, symbol: Option<u64>) -> Option<u32> {
    memory.read_plain::<u32>(root, symbol?).ok()
}

fn append_text(out: &mut String, bytes: &[u8]) {
    // The ring is rarely full; skip the unwritten NUL padding.
    for chunk in String::from_utf8_lossy(bytes).split('\0') {
        out.push_str(chunk);
    }
}
