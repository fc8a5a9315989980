//! ELF frontend: parses an object's `.eh_frame` into canonical unwind rows
//! and the sorted `file offset -> rule id` map the tree builder consumes.
//!
//! Any construct outside the supported vocabulary fails the whole object.
//! A partially translated table would silently unwind through bad frames,
//! which is worse than falling back to frame pointers.

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use gimli::{BaseAddresses, EhFrame, RunTimeEndian, UnwindSection};
use memmap2::Mmap;
use object::{Object, ObjectSection, ObjectSegment};
use unwind_forge_common::{RULE_ID_NONE, TRACKED_REGISTERS};

use crate::error::UnwindError;
use crate::expr::{compile_expression, ExprOp};
use crate::rules::{CfaRule, RegisterRule, UnwindRow};
use crate::tree::Entry;

/// Assigns ids to rows and expressions as they are extracted. During a build
/// the ids are tentative; they only become real when the object commits.
pub(crate) trait RowInterner {
    fn intern_expression(&mut self, ops: &[ExprOp]) -> Result<u32, UnwindError>;
    fn intern_row(&mut self, row: &UnwindRow) -> Result<u32, UnwindError>;
}

/// Memory-maps an object file. Mmap keeps the binary out of the heap; large
/// libraries would otherwise cost a full copy each.
pub(crate) fn map_object(path: &Path) -> Result<Mmap, UnwindError> {
    let file = File::open(path)
        .map_err(|e| UnwindError::FileNotFound(format!("{}: {e}", path.display())))?;
    unsafe { Mmap::map(&file) }
        .map_err(|e| UnwindError::FileNotFound(format!("{}: {e}", path.display())))
}

fn parse_error(what: &str, e: impl std::fmt::Display) -> UnwindError {
    UnwindError::ParseError(format!("{what}: {e}"))
}

fn intern_unwind_expression(
    expr: &gimli::UnwindExpression<usize>,
    eh_frame_data: &[u8],
    encoding: gimli::Encoding,
    endian: RunTimeEndian,
    interner: &mut dyn RowInterner,
) -> Result<u32, UnwindError> {
    let start = expr.offset;
    let end = start
        .checked_add(expr.length)
        .filter(|&end| end <= eh_frame_data.len())
        .ok_or_else(|| {
            UnwindError::ParseError("expression extends past .eh_frame".into())
        })?;
    let ops = compile_expression(&eh_frame_data[start..end], encoding, endian)?;
    interner.intern_expression(&ops)
}

fn canonicalize_row(
    row: &gimli::UnwindTableRow<usize>,
    eh_frame_data: &[u8],
    encoding: gimli::Encoding,
    endian: RunTimeEndian,
    interner: &mut dyn RowInterner,
) -> Result<UnwindRow, UnwindError> {
    let cfa = match row.cfa() {
        gimli::CfaRule::RegisterAndOffset { register, offset } => {
            let reg = u8::try_from(register.0).map_err(|_| {
                UnwindError::ParseError(format!("CFA register {} out of range", register.0))
            })?;
            CfaRule::RegPlusOffset {
                reg,
                offset: *offset,
            }
        }
        gimli::CfaRule::Expression(expr) => CfaRule::Expression {
            id: intern_unwind_expression(expr, eh_frame_data, encoding, endian, interner)?,
        },
    };

    let mut out = UnwindRow::new(cfa);
    for (reg, rule) in row.registers() {
        let slot = reg.0 as usize;
        if slot >= TRACKED_REGISTERS {
            // Vector and segment registers are not needed to walk the stack.
            continue;
        }
        out.registers[slot] = match rule {
            gimli::RegisterRule::Undefined => RegisterRule::Undefined,
            gimli::RegisterRule::SameValue => RegisterRule::SameValue,
            gimli::RegisterRule::Offset(offset) => RegisterRule::Offset(*offset),
            gimli::RegisterRule::ValOffset(offset) => RegisterRule::ValOffset(*offset),
            gimli::RegisterRule::Register(other) => RegisterRule::Register(u32::from(other.0)),
            gimli::RegisterRule::Expression(expr) => RegisterRule::Expression(
                intern_unwind_expression(expr, eh_frame_data, encoding, endian, interner)?,
            ),
            gimli::RegisterRule::ValExpression(expr) => RegisterRule::ValExpression(
                intern_unwind_expression(expr, eh_frame_data, encoding, endian, interner)?,
            ),
            gimli::RegisterRule::Constant(value) => RegisterRule::Constant(*value as i64),
            other => {
                return Err(UnwindError::ParseError(format!(
                    "unsupported register rule {other:?} for register {}",
                    reg.0
                )))
            }
        };
    }
    Ok(out)
}

/// Walks `.eh_frame` and returns the object's offset map, sorted by file
/// offset with strict key increase. Each FDE contributes its rows plus an
/// end marker `(end_address, 0)`; at equal offsets a real row wins over a
/// marker, and runs of identical rule ids collapse to their first entry.
pub(crate) fn extract_offset_map(
    data: &[u8],
    interner: &mut dyn RowInterner,
) -> Result<Vec<Entry>, UnwindError> {
    let obj = object::File::parse(data).map_err(|e| parse_error("not an object file", e))?;
    if obj.format() != object::BinaryFormat::Elf {
        return Err(UnwindError::UnsupportedFormat(format!("{:?}", obj.format())));
    }
    let endian = if obj.is_little_endian() {
        RunTimeEndian::Little
    } else {
        RunTimeEndian::Big
    };

    // First load segment with file offset 0 gives the base virtual address
    // (0x400000 for non-PIE executables, 0 for PIE and shared objects).
    // Subtracting it makes every key file-relative.
    let base_vaddr = obj
        .segments()
        .find(|s| s.file_range().0 == 0)
        .map(|s| s.address())
        .unwrap_or(0);

    let eh_frame_section = obj
        .section_by_name(".eh_frame")
        .ok_or_else(|| UnwindError::ParseError("no .eh_frame section".into()))?;
    let eh_frame_data = eh_frame_section
        .data()
        .map_err(|e| parse_error("unreadable .eh_frame", e))?;
    let eh_frame_addr = eh_frame_section.address();

    let eh_frame = EhFrame::new(eh_frame_data, endian);
    let bases = BaseAddresses::default().set_eh_frame(eh_frame_addr);
    let encoding = gimli::Encoding {
        address_size: 8,
        format: gimli::Format::Dwarf32,
        version: 4,
    };

    // ~1 row per 24 bytes of .eh_frame, plus one end marker per FDE.
    let mut entries: Vec<(u64, u32, bool)> = Vec::with_capacity(eh_frame_data.len() / 20);
    let mut ctx = gimli::UnwindContext::new();
    let mut cies = HashMap::new();

    let mut iter = eh_frame.entries(&bases);
    loop {
        let entry = match iter.next().map_err(|e| parse_error("bad .eh_frame entry", e))? {
            Some(entry) => entry,
            None => break,
        };
        match entry {
            gimli::CieOrFde::Cie(cie) => {
                cies.insert(cie.offset(), cie);
            }
            gimli::CieOrFde::Fde(partial_fde) => {
                let fde = partial_fde
                    .parse(|_, bases, offset| {
                        if let Some(cie) = cies.get(&offset.0) {
                            Ok(cie.clone())
                        } else {
                            eh_frame.cie_from_offset(bases, offset)
                        }
                    })
                    .map_err(|e| parse_error("bad FDE", e))?;

                let mut table = fde
                    .rows(&eh_frame, &bases, &mut ctx)
                    .map_err(|e| parse_error("bad FDE rows", e))?;
                loop {
                    let row = match table
                        .next_row()
                        .map_err(|e| parse_error("bad unwind row", e))?
                    {
                        Some(row) => row,
                        None => break,
                    };
                    let canonical =
                        canonicalize_row(row, eh_frame_data, encoding, endian, interner)?;
                    let rule_id = interner.intern_row(&canonical)?;
                    let key = row.start_address().wrapping_sub(base_vaddr);
                    entries.push((key, rule_id, false));
                }
                let end_key = fde.end_address().wrapping_sub(base_vaddr);
                entries.push((end_key, RULE_ID_NONE, true));
            }
        }
    }

    // Real rows win ties against end markers; then only the first entry of
    // any run of identical conclusions is kept. The predecessor search finds
    // the last key <= target, so dropping later duplicates is lossless.
    entries.sort_by_key(|&(key, _, is_end)| (key, is_end));
    entries.dedup_by_key(|&mut (key, ..)| key);
    let mut map: Vec<Entry> = entries.into_iter().map(|(key, id, _)| (key, id)).collect();
    let before = map.len();
    map.dedup_by(|b, a| a.1 == b.1);
    if map.len() != before {
        tracing::debug!("offset map dedup: {before} -> {} entries", map.len());
    }

    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullInterner;

    impl RowInterner for NullInterner {
        fn intern_expression(&mut self, _ops: &[ExprOp]) -> Result<u32, UnwindError> {
            Ok(1)
        }
        fn intern_row(&mut self, _row: &UnwindRow) -> Result<u32, UnwindError> {
            Ok(1)
        }
    }

    #[test]
    fn test_garbage_is_parse_error() {
        let err = extract_offset_map(b"definitely not an object", &mut NullInterner).unwrap_err();
        assert!(matches!(err, UnwindError::ParseError(_)), "{err}");
    }

    #[test]
    fn test_elf_without_eh_frame() {
        // Minimal valid ELF64 header, no program or section headers.
        let mut elf = vec![0u8; 64];
        elf[0..4].copy_from_slice(b"\x7fELF");
        elf[4] = 2; // ELFCLASS64
        elf[5] = 1; // little endian
        elf[6] = 1; // EV_CURRENT
        elf[16..18].copy_from_slice(&3u16.to_le_bytes()); // ET_DYN
        elf[18..20].copy_from_slice(&0x3eu16.to_le_bytes()); // EM_X86_64
        elf[20..24].copy_from_slice(&1u32.to_le_bytes());
        elf[52..54].copy_from_slice(&64u16.to_le_bytes()); // e_ehsize
        elf[54..56].copy_from_slice(&56u16.to_le_bytes()); // e_phentsize
        elf[58..60].copy_from_slice(&64u16.to_le_bytes()); // e_shentsize

        let err = extract_offset_map(&elf, &mut NullInterner).unwrap_err();
        match err {
            UnwindError::ParseError(msg) => assert!(msg.contains(".eh_frame"), "{msg}"),
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_missing_file() {
        let err = map_object(Path::new("/nonexistent/really-not-here")).unwrap_err();
        assert!(matches!(err, UnwindError::FileNotFound(_)));
    }
}
