// SPDX-FileCopyrightText: The rcoredump contributors
//
// SPDX-License-Identifier: GPL-3.0-only

//! Reads `AT_PLATFORM` out of this process's own auxiliary vector, for
//! `$PLATFORM` token expansion in library search paths. No `libc` dependency
//! is needed: `/proc/self/auxv` is a flat array of `(tag, value)` word pairs
//! in the kernel's native word size, readable by hand.

use std::ffi::CStr;
use std::mem::size_of;

const AT_PLATFORM: usize = 15;
const AT_NULL: usize = 0;

/// Returns the `AT_PLATFORM` string (e.g. `"x86_64"`), or `None` if the
/// auxiliary vector is unreadable or carries no such entry.
pub fn platform() -> Option<String> {
    let raw = std::fs::read("/proc/self/auxv").ok()?;
    let word = size_of::<usize>();
    let entry = word * 2;
    for chunk in raw.chunks_exact(entry) {
        let tag = usize::from_ne_bytes(chunk[..word].try_into().ok()?);
        let val = usize::from_ne_bytes(chunk[word..entry].try_into().ok()?);
        if tag == AT_NULL {
            break;
        }
        if tag == AT_PLATFORM {
            // `val` is a pointer into our own address space (it's our auxv)
            // at a NUL-terminated string placed there by the kernel at exec.
            if val == 0 {
                return None;
            }
            let ptr = val as *const std::os::raw::c_char;
            let cstr = unsafe { CStr::from_ptr(ptr) };
            return cstr.to_str().ok().map(str::to_string);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_a_platform_string_on_linux() {
        // Best-effort: /proc may not exist in the sandbox running this test,
        // but when it does, AT_PLATFORM is always present on Linux/x86_64.
        if std::path::Path::new("/proc/self/auxv").exists() {
            assert!(platform().is_some());
        }
    }
}
