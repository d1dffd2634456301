// SPDX-FileCopyrightText: The rcoredump contributors
//
// SPDX-License-Identifier: GPL-3.0-only

//! A compact emulation of Linux's dynamic loader, run by the forwarder to
//! discover which shared libraries an executable needs so they can be
//! shipped alongside the core.
//!
//! The ELF dynamic section is parsed by hand from raw bytes, rather than
//! through a crate's higher-level dynamic-section API, since the `PT_DYNAMIC`
//! → string-table address-to-file-offset mapping is small, spec-defined, and
//! easy to get exactly right without guessing at an unfamiliar API surface.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};

use anyhow::Context;
use once_cell::unsync::Lazy;

use crate::wire::Link;

const PT_LOAD: u32 = 1;
const PT_DYNAMIC: u32 = 2;
const DT_NEEDED: i64 = 1;
const DT_STRTAB: i64 = 5;
const DT_RPATH: i64 = 15;
const DT_RUNPATH: i64 = 29;

const ELFCLASS32: u8 = 1;
const ELFCLASS64: u8 = 2;

/// Raw facts extracted from one ELF file's dynamic section.
struct DynamicInfo {
    needed: Vec<String>,
    rpath: Vec<String>,
    runpath: Vec<String>,
    is_64: bool,
}

/// Resolves the full transitive closure of `executable`'s `DT_NEEDED`
/// libraries, returning one [`Link`] per distinct name encountered
/// (including unresolved ones).
pub fn resolve_links(executable: &Path) -> anyhow::Result<Vec<Link>> {
    let exe_dir = executable
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let bytes = std::fs::read(executable)
        .with_context(|| format!("reading {} for dynamic section parsing", executable.display()))?;
    let info = parse_dynamic_info(&bytes)
        .with_context(|| format!("parsing ELF dynamic section of {}", executable.display()))?;

    let ld_library_path: Vec<String> = std::env::var("LD_LIBRARY_PATH")
        .unwrap_or_default()
        .split(':')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    // `AT_PLATFORM` is only worth reading from our own auxiliary vector if a
    // search-path entry actually references `$PLATFORM`/`${PLATFORM}`, so the
    // read is deferred until `expand_tokens` first needs it.
    let platform: Lazy<Option<String>> = Lazy::new(crate::auxv::platform);

    let mut seen = HashSet::new();
    let mut work: VecDeque<PendingLookup> = info
        .needed
        .into_iter()
        .map(|name| PendingLookup {
            name,
            referrer_dir: exe_dir.clone(),
            referrer_rpath: info.rpath.clone(),
            referrer_runpath: info.runpath.clone(),
            is_64: info.is_64,
        })
        .collect();

    let mut links = Vec::new();
    while let Some(item) = work.pop_front() {
        if !seen.insert(item.name.clone()) {
            continue;
        }
        let link = resolve_one(&item, &ld_library_path, &platform);

        if link.found && link.error.is_empty() {
            if let Ok(child_bytes) = std::fs::read(&link.resolved_path) {
                if let Ok(child_info) = parse_dynamic_info(&child_bytes) {
                    let child_dir = Path::new(&link.resolved_path)
                        .parent()
                        .map(Path::to_path_buf)
                        .unwrap_or_else(|| PathBuf::from("."));
                    for name in child_info.needed {
                        if !seen.contains(&name) {
                            work.push_back(PendingLookup {
                                name,
                                referrer_dir: child_dir.clone(),
                                referrer_rpath: child_info.rpath.clone(),
                                referrer_runpath: child_info.runpath.clone(),
                                is_64: child_info.is_64,
                            });
                        }
                    }
                }
            }
        }
        links.push(link);
    }
    Ok(links)
}

struct PendingLookup {
    name: String,
    referrer_dir: PathBuf,
    referrer_rpath: Vec<String>,
    referrer_runpath: Vec<String>,
    is_64: bool,
}

fn resolve_one(item: &PendingLookup, ld_library_path: &[String], platform: &Lazy<Option<String>>) -> Link {
    if item.name.contains('/') {
        let p = PathBuf::from(&item.name);
        let resolved = if p.is_absolute() {
            p
        } else {
            item.referrer_dir.join(&p)
        };
        return finalize(&item.name, resolved);
    }

    let expand = |dir: &str| expand_tokens(dir, &item.referrer_dir, item.is_64, platform);
    let search_dirs: Vec<String> = item
        .referrer_rpath
        .iter()
        .map(|d| expand(d))
        .chain(ld_library_path.iter().map(|d| expand(d)))
        .chain(item.referrer_runpath.iter().map(|d| expand(d)))
        .chain(default_search_dirs())
        .collect();

    for dir in &search_dirs {
        let candidate = PathBuf::from(dir).join(&item.name);
        if candidate.is_file() {
            return Link {
                name: item.name.clone(),
                resolved_path: candidate.to_string_lossy().into_owned(),
                found: true,
                error: String::new(),
            };
        }
    }
    Link {
        name: item.name.clone(),
        resolved_path: String::new(),
        found: false,
        error: String::new(),
    }
}

fn finalize(name: &str, path: PathBuf) -> Link {
    if path.is_file() {
        Link {
            name: name.to_string(),
            resolved_path: path.to_string_lossy().into_owned(),
            found: true,
            error: String::new(),
        }
    } else {
        Link {
            name: name.to_string(),
            resolved_path: String::new(),
            found: false,
            error: format!("{} does not exist", path.display()),
        }
    }
}

fn default_search_dirs() -> Vec<String> {
    vec![
        "/lib".to_string(),
        "/usr/lib".to_string(),
        "/lib64".to_string(),
        "/usr/lib64".to_string(),
    ]
}

/// Expands `$ORIGIN`/`${ORIGIN}`, `$LIB`/`${LIB}`, `$PLATFORM`/`${PLATFORM}`;
/// unrecognized `$X` tokens pass through untouched. `platform` is only forced
/// (triggering the one-time `/proc/self/auxv` read) when `s` actually
/// mentions `PLATFORM`.
fn expand_tokens(s: &str, origin_dir: &Path, is_64: bool, platform: &Lazy<Option<String>>) -> String {
    let lib = if is_64 { "lib64" } else { "lib" };
    let platform_value = if s.contains("PLATFORM") {
        platform.as_deref().unwrap_or("").to_string()
    } else {
        String::new()
    };
    let mut out = s.to_string();
    for (token, replacement) in [
        ("ORIGIN", origin_dir.to_string_lossy().into_owned()),
        ("LIB", lib.to_string()),
        ("PLATFORM", platform_value),
    ] {
        out = out.replace(&format!("${{{token}}}"), &replacement);
        out = out.replace(&format!("${token}"), &replacement);
    }
    out
}

fn parse_dynamic_info(bytes: &[u8]) -> anyhow::Result<DynamicInfo> {
    anyhow::ensure!(bytes.len() >= 20 && &bytes[0..4] == b"\x7fELF", "not an ELF file");
    let class = bytes[4];
    let is_64 = match class {
        ELFCLASS64 => true,
        ELFCLASS32 => false,
        other => anyhow::bail!("unsupported ELF class {other}"),
    };
    anyhow::ensure!(bytes[5] == 1, "only little-endian ELF is supported");

    let (phoff, phentsize, phnum) = if is_64 {
        (
            read_u64(bytes, 0x20)? as usize,
            read_u16(bytes, 0x36)? as usize,
            read_u16(bytes, 0x38)? as usize,
        )
    } else {
        (
            read_u32(bytes, 0x1c)? as usize,
            read_u16(bytes, 0x2a)? as usize,
            read_u16(bytes, 0x2c)? as usize,
        )
    };

    // Collects every PT_LOAD segment, to translate a dynamic-section address
    // into a file offset later, and separately the PT_DYNAMIC segment.
    let mut loads = Vec::new();
    let mut dynamic_range = None;
    for i in 0..phnum {
        let off = phoff + i * phentsize;
        if is_64 {
            let p_type = read_u32(bytes, off)?;
            let p_offset = read_u64(bytes, off + 0x08)? as usize;
            let p_vaddr = read_u64(bytes, off + 0x10)? as usize;
            let p_filesz = read_u64(bytes, off + 0x20)? as usize;
            if p_type == PT_LOAD {
                loads.push((p_vaddr, p_offset, p_filesz));
            } else if p_type == PT_DYNAMIC {
                dynamic_range = Some((p_offset, p_filesz));
            }
        } else {
            let p_type = read_u32(bytes, off)?;
            let p_offset = read_u32(bytes, off + 0x04)? as usize;
            let p_vaddr = read_u32(bytes, off + 0x08)? as usize;
            let p_filesz = read_u32(bytes, off + 0x10)? as usize;
            if p_type == PT_LOAD {
                loads.push((p_vaddr, p_offset, p_filesz));
            } else if p_type == PT_DYNAMIC {
                dynamic_range = Some((p_offset, p_filesz));
            }
        }
    }

    let (dyn_offset, dyn_size) = match dynamic_range {
        Some(r) => r,
        None => {
            // Statically linked executables have no PT_DYNAMIC segment.
            return Ok(DynamicInfo {
                needed: Vec::new(),
                rpath: Vec::new(),
                runpath: Vec::new(),
                is_64,
            });
        }
    };

    let vaddr_to_offset = |vaddr: usize| -> Option<usize> {
        loads
            .iter()
            .find(|(v, _, sz)| vaddr >= *v && vaddr < *v + *sz)
            .map(|(v, off, _)| off + (vaddr - v))
    };

    let entry_size = if is_64 { 16 } else { 8 };
    let mut needed_idx = Vec::new();
    let mut rpath_idx = Vec::new();
    let mut runpath_idx = Vec::new();
    let mut strtab_vaddr = None;

    let mut cursor = dyn_offset;
    let end = dyn_offset + dyn_size;
    while cursor + entry_size <= end && cursor + entry_size <= bytes.len() {
        let (tag, val) = if is_64 {
            (read_i64(bytes, cursor)?, read_u64(bytes, cursor + 8)?)
        } else {
            (read_i32(bytes, cursor)? as i64, read_u32(bytes, cursor + 4)? as u64)
        };
        if tag == 0 {
            break;
        }
        match tag {
            DT_NEEDED => needed_idx.push(val as usize),
            DT_RPATH => rpath_idx.push(val as usize),
            DT_RUNPATH => runpath_idx.push(val as usize),
            DT_STRTAB => strtab_vaddr = Some(val as usize),
            _ => {}
        }
        cursor += entry_size;
    }

    let strtab_vaddr = strtab_vaddr.context("ELF has a dynamic section but no DT_STRTAB")?;
    let strtab_offset =
        vaddr_to_offset(strtab_vaddr).context("DT_STRTAB address is outside any PT_LOAD segment")?;

    let read_str = |idx: usize| -> anyhow::Result<String> { read_cstr(bytes, strtab_offset + idx) };

    let needed = needed_idx
        .into_iter()
        .map(read_str)
        .collect::<anyhow::Result<Vec<_>>>()?;
    // DT_RPATH/DT_RUNPATH are single colon-separated string-table entries.
    let rpath = rpath_idx
        .into_iter()
        .map(read_str)
        .collect::<anyhow::Result<Vec<_>>>()?
        .into_iter()
        .flat_map(|s| s.split(':').map(str::to_string).collect::<Vec<_>>())
        .filter(|s| !s.is_empty())
        .collect();
    let runpath = runpath_idx
        .into_iter()
        .map(read_str)
        .collect::<anyhow::Result<Vec<_>>>()?
        .into_iter()
        .flat_map(|s| s.split(':').map(str::to_string).collect::<Vec<_>>())
        .filter(|s| !s.is_empty())
        .collect();

    Ok(DynamicInfo {
        needed,
        rpath,
        runpath,
        is_64,
    })
}

fn read_cstr(bytes: &[u8], offset: usize) -> anyhow::Result<String> {
    let end = bytes[offset..]
        .iter()
        .position(|&b| b == 0)
        .context("unterminated string in ELF string table")?;
    Ok(String::from_utf8_lossy(&bytes[offset..offset + end]).into_owned())
}

fn read_u16(bytes: &[u8], off: usize) -> anyhow::Result<u16> {
    Ok(u16::from_le_bytes(bytes.get(off..off + 2).context("ELF truncated")?.try_into()?))
}

fn read_u32(bytes: &[u8], off: usize) -> anyhow::Result<u32> {
    Ok(u32::from_le_bytes(bytes.get(off..off + 4).context("ELF truncated")?.try_into()?))
}

fn read_i32(bytes: &[u8], off: usize) -> anyhow::Result<i32> {
    Ok(i32::from_le_bytes(bytes.get(off..off + 4).context("ELF truncated")?.try_into()?))
}

fn read_u64(bytes: &[u8], off: usize) -> anyhow::Result<u64> {
    Ok(u64::from_le_bytes(bytes.get(off..off + 8).context("ELF truncated")?.try_into()?))
}

fn read_i64(bytes: &[u8], off: usize) -> anyhow::Result<i64> {
    Ok(i64::from_le_bytes(bytes.get(off..off + 8).context("ELF truncated")?.try_into()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_tokens_substitutes_origin_lib_and_platform() {
        let platform: Lazy<Option<String>> = Lazy::new(|| Some("x86_64".to_string()));
        let out = expand_tokens(
            "$ORIGIN/../${LIB}:$PLATFORM",
            Path::new("/opt/app/bin"),
            true,
            &platform,
        );
        assert_eq!(out, "/opt/app/bin/../lib64:x86_64");
    }

    #[test]
    fn expand_tokens_skips_auxv_read_when_platform_unused() {
        let platform: Lazy<Option<String>> =
            Lazy::new(|| panic!("auxv should not be read when $PLATFORM is absent"));
        let out = expand_tokens("$ORIGIN/lib", Path::new("/opt/app/bin"), true, &platform);
        assert_eq!(out, "/opt/app/bin/lib");
    }

    #[test]
    fn static_executable_without_pt_dynamic_has_no_needed() {
        // A handful of zero bytes past the ELF magic/class/data fields with
        // phnum=0 parses as "no PT_DYNAMIC" rather than erroring.
        let mut bytes = vec![0u8; 64];
        bytes[0..4].copy_from_slice(b"\x7fELF");
        bytes[4] = ELFCLASS64;
        bytes[5] = 1;
        let info = parse_dynamic_info(&bytes).unwrap();
        assert!(info.needed.is_empty());
    }

    fn write_phdr(bytes: &mut [u8], off: usize, p_type: u32, p_offset: u64, p_vaddr: u64, p_filesz: u64) {
        bytes[off..off + 4].copy_from_slice(&p_type.to_le_bytes());
        bytes[off + 8..off + 16].copy_from_slice(&p_offset.to_le_bytes());
        bytes[off + 0x10..off + 0x18].copy_from_slice(&p_vaddr.to_le_bytes());
        bytes[off + 0x20..off + 0x28].copy_from_slice(&p_filesz.to_le_bytes());
    }

    fn write_dyn_entry(bytes: &mut [u8], off: usize, tag: i64, val: u64) {
        bytes[off..off + 8].copy_from_slice(&tag.to_le_bytes());
        bytes[off + 8..off + 16].copy_from_slice(&val.to_le_bytes());
    }

    /// Builds a minimal little-endian ELF64 file with a single `PT_DYNAMIC`
    /// segment carrying one `DT_NEEDED` entry for `name`, and a `PT_LOAD`
    /// segment identity-mapping the whole file so `DT_STRTAB`'s address
    /// resolves back to its own file offset.
    fn build_elf_with_needed(name: &str) -> Vec<u8> {
        const STRTAB_OFFSET: usize = 224;
        let mut bytes = vec![0u8; STRTAB_OFFSET];
        bytes[0..4].copy_from_slice(b"\x7fELF");
        bytes[4] = ELFCLASS64;
        bytes[5] = 1;
        bytes[0x20..0x28].copy_from_slice(&64u64.to_le_bytes()); // e_phoff
        bytes[0x36..0x38].copy_from_slice(&56u16.to_le_bytes()); // e_phentsize
        bytes[0x38..0x3a].copy_from_slice(&2u16.to_le_bytes()); // e_phnum

        bytes.extend_from_slice(name.as_bytes());
        bytes.push(0);
        let total_len = bytes.len() as u64;

        write_phdr(&mut bytes, 64, PT_LOAD, 0, 0, total_len);
        write_phdr(&mut bytes, 120, PT_DYNAMIC, 176, 176, 48);

        write_dyn_entry(&mut bytes, 176, DT_NEEDED, STRTAB_OFFSET as u64);
        write_dyn_entry(&mut bytes, 192, DT_STRTAB, STRTAB_OFFSET as u64);
        write_dyn_entry(&mut bytes, 208, 0, 0);

        bytes
    }

    /// End-to-end: an executable whose `DT_NEEDED` entry names a library not
    /// next to it is resolved by searching `LD_LIBRARY_PATH`.
    #[test]
    fn resolve_links_finds_dependency_via_ld_library_path() {
        let exe_dir = tempfile::tempdir().unwrap();
        let exe_path = exe_dir.path().join("prog");
        std::fs::write(&exe_path, build_elf_with_needed("libfoo.so")).unwrap();

        let lib_dir = tempfile::tempdir().unwrap();
        std::fs::write(lib_dir.path().join("libfoo.so"), b"not a real shared object").unwrap();

        let previous = std::env::var("LD_LIBRARY_PATH").ok();
        std::env::set_var("LD_LIBRARY_PATH", lib_dir.path());
        let links = resolve_links(&exe_path);
        match previous {
            Some(v) => std::env::set_var("LD_LIBRARY_PATH", v),
            None => std::env::remove_var("LD_LIBRARY_PATH"),
        }
        let links = links.unwrap();

        assert_eq!(links.len(), 1);
        assert_eq!(links[0].name, "libfoo.so");
        assert!(links[0].found);
        assert_eq!(
            links[0].resolved_path,
            lib_dir.path().join("libfoo.so").to_string_lossy()
        );
    }
}
