use log::{debug, trace, warn};
use thiserror::Error;

use crate::ast::{
    AdjustOp, Comparison, Endianness, Kind, Offset, OffsetBase, Spellbook, MAX_LEVELS,
};
use crate::pattern::{search_test, string_test};

/// How many `use` calls may be outstanding at once. Rule databases can
/// express mutually recursive pages; beyond this depth the sub-lookup is
/// abandoned with a diagnostic.
const MAX_USE_DEPTH: usize = 16;

/// A failed integer read from the target.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ReadError {
    #[error("read of {width} bytes at {at} lands outside the {len}-byte target")]
    OutOfBounds { at: i64, width: u32, len: usize },
    #[error("unsupported integer read width {0}")]
    UnsupportedWidth(u32),
}

/// Reads a zero-extended unsigned integer of 1, 2, 4 or 8 bytes from
/// `buf` at `at`. A read whose end falls at or past the end of the buffer
/// fails; the last byte of the buffer is therefore never readable. That
/// bound is historical and relied upon by existing rule databases.
pub fn read_uint(buf: &[u8], at: i64, width: u32, endianness: Endianness) -> Result<u64, ReadError> {
    let out_of_bounds = ReadError::OutOfBounds {
        at,
        width,
        len: buf.len(),
    };
    if at < 0 {
        return Err(out_of_bounds);
    }
    let end = match at.checked_add(i64::from(width)) {
        Some(end) => end,
        None => return Err(out_of_bounds),
    };
    if end >= buf.len() as i64 {
        return Err(out_of_bounds);
    }

    let j = at as usize;
    let w = width as usize;
    let value = match width {
        1 => u64::from(buf[j]),
        2 | 4 | 8 => {
            let mut raw = [0u8; 8];
            match endianness {
                Endianness::Little => {
                    raw[..w].copy_from_slice(&buf[j..j + w]);
                    u64::from_le_bytes(raw)
                }
                Endianness::Big => {
                    raw[8 - w..].copy_from_slice(&buf[j..j + w]);
                    u64::from_be_bytes(raw)
                }
            }
        }
        _ => return Err(ReadError::UnsupportedWidth(width)),
    };
    Ok(value)
}

// offset arithmetic is signed 64-bit and checked; anything that falls off
// the range is handled like a bounds failure
fn checked(value: Option<i64>) -> Option<i64> {
    if value.is_none() {
        debug!("offset arithmetic out of range, skipping rule");
    }
    value
}

impl Spellbook {
    /// Walks the main page against `target` and returns the descriptions
    /// of every matched rule, in match order. The slices borrow from the
    /// spellbook; nothing is copied.
    pub fn identify<'s>(&'s self, target: &[u8]) -> Vec<&'s [u8]> {
        let mut out = Vec::new();
        self.identify_page(target, 0, "", false, 0, &mut out);
        out
    }

    /// Identification plus the final polish: descriptions joined with
    /// spaces, backspace markers applied, whitespace trimmed. Returns the
    /// empty string when nothing matched.
    pub fn describe(&self, target: &[u8]) -> String {
        crate::merge_descriptions(&self.identify(target))
    }

    fn identify_page<'s>(
        &'s self,
        target: &[u8],
        page_offset: i64,
        page: &str,
        swap_endian: bool,
        depth: usize,
        out: &mut Vec<&'s [u8]>,
    ) {
        let rules = match self.page(page) {
            Some(rules) => rules,
            None => return,
        };

        trace!(
            "|====> identifying at {} using page {:?} ({} rules)",
            page_offset,
            page,
            rules.len()
        );

        let mut matched = [false; MAX_LEVELS];
        let mut ever_matched = [false; MAX_LEVELS];
        let mut global_offset: i64 = 0;

        if !page.is_empty() {
            // rules of a named page hang off the `use` rule that called
            // it, so their top level starts out matched
            matched[0] = true;
            ever_matched[0] = true;
        }

        'rules: for rule in rules {
            // declaration order has moved past every nested group that
            // could still fire
            for level in rule.level + 1..MAX_LEVELS {
                if ever_matched[level] {
                    break 'rules;
                }
            }

            if matched[..rule.level].iter().any(|parent| !parent) {
                continue;
            }

            trace!("| {}", rule);

            let lookup_offset =
                match self.resolve_offset(&rule.offset, target, page_offset, global_offset, swap_endian)
                {
                    Some(offset) => offset,
                    None => continue,
                };

            if lookup_offset < 0 || lookup_offset >= target.len() as i64 {
                debug!(
                    "lookup offset {} is outside the {}-byte target, skipping rule",
                    lookup_offset,
                    target.len()
                );
                continue;
            }

            let mut success = false;

            match &rule.kind {
                Kind::Integer(ik) => {
                    if ik.comparison == Comparison::MatchAny {
                        success = true;
                    } else {
                        let value = match read_uint(
                            target,
                            lookup_offset,
                            ik.byte_width,
                            ik.endianness.maybe_swapped(swap_endian),
                        ) {
                            Ok(value) => value,
                            Err(err) => {
                                debug!("in integer test: {}, skipping rule", err);
                                continue;
                            }
                        };
                        let value = match ik.and_mask {
                            Some(mask) => value & mask,
                            None => value,
                        };

                        success = match ik.comparison {
                            Comparison::Equal => value == ik.value as u64,
                            Comparison::NotEqual => value != ik.value as u64,
                            Comparison::LessThan => {
                                if ik.signed {
                                    match ik.byte_width {
                                        1 => (value as i8) < (ik.value as i8),
                                        2 => (value as i16) < (ik.value as i16),
                                        4 => (value as i32) < (ik.value as i32),
                                        _ => (value as i64) < ik.value,
                                    }
                                } else {
                                    value < ik.value as u64
                                }
                            }
                            Comparison::GreaterThan => {
                                if ik.signed {
                                    match ik.byte_width {
                                        1 => (value as i8) > (ik.value as i8),
                                        2 => (value as i16) > (ik.value as i16),
                                        4 => (value as i32) > (ik.value as i32),
                                        _ => (value as i64) > ik.value,
                                    }
                                } else {
                                    value > ik.value as u64
                                }
                            }
                            Comparison::MatchAny => true,
                        };

                        if success {
                            global_offset = lookup_offset + i64::from(ik.byte_width);
                        }
                    }
                }

                Kind::String(sk) => {
                    let result = string_test(target, lookup_offset as usize, &sk.pattern, &sk.flags);
                    success = result.is_some();
                    if sk.negate {
                        success = !success;
                    } else if let Some(consumed) = result {
                        global_offset = lookup_offset + consumed as i64;
                    }
                }

                Kind::Search(sk) => {
                    match search_test(target, lookup_offset as usize, sk.max_len, &sk.pattern) {
                        Some(found) => {
                            trace!("search hit at 0x{:x}", found);
                            success = true;
                            global_offset = (found + sk.pattern.len()) as i64;
                        }
                        None => {}
                    }
                }

                Kind::Default => {
                    if !ever_matched[rule.level] {
                        success = true;
                    }
                }

                Kind::Clear => {
                    ever_matched[rule.level] = false;
                }

                Kind::Use(uk) => {
                    if self.page(&uk.page).is_none() {
                        warn!("use of missing page {:?}, skipping rule", uk.page);
                        continue;
                    }
                    if depth >= MAX_USE_DEPTH {
                        warn!(
                            "use recursion deeper than {} pages, abandoning sub-lookup of {:?}",
                            MAX_USE_DEPTH, uk.page
                        );
                        continue;
                    }
                    trace!("|====> using {:?}", uk.page);
                    self.identify_page(
                        target,
                        lookup_offset,
                        &uk.page,
                        swap_endian ^ uk.swap_endian,
                        depth + 1,
                        out,
                    );
                }
            }

            if success {
                trace!("|==========> rule matched");
                if !rule.description.is_empty() {
                    out.push(rule.description.as_slice());
                }
                matched[rule.level] = true;
                ever_matched[rule.level] = true;
            } else {
                matched[rule.level] = false;
            }
        }

        trace!("|====> done with page {:?} at {}", page, page_offset);
    }

    fn resolve_offset(
        &self,
        offset: &Offset,
        target: &[u8],
        page_offset: i64,
        global_offset: i64,
        swap_endian: bool,
    ) -> Option<i64> {
        let mut lookup = match &offset.base {
            OffsetBase::Direct(value) => checked(value.checked_add(page_offset))?,
            OffsetBase::Indirect(indirect) => {
                let mut address = indirect.offset_address;
                if indirect.is_relative {
                    address = checked(address.checked_add(global_offset))?;
                }

                let pointer = match read_uint(
                    target,
                    address,
                    indirect.byte_width,
                    indirect.endianness.maybe_swapped(swap_endian),
                ) {
                    Ok(value) => value,
                    Err(err) => {
                        debug!("while dereferencing: {}, skipping rule", err);
                        return None;
                    }
                };
                let mut lookup = pointer as i64;

                if let Some(adjustment) = &indirect.adjustment {
                    let operand = if adjustment.is_relative {
                        let operand_address = checked(address.checked_add(adjustment.value))?;
                        // the operand read keeps the pointer's declared
                        // endianness even when the page swaps
                        match read_uint(
                            target,
                            operand_address,
                            indirect.byte_width,
                            indirect.endianness,
                        ) {
                            Ok(value) => value as i64,
                            Err(err) => {
                                debug!("while dereferencing: {}, skipping rule", err);
                                return None;
                            }
                        }
                    } else {
                        adjustment.value
                    };

                    lookup = checked(match adjustment.op {
                        AdjustOp::Add => lookup.checked_add(operand),
                        AdjustOp::Sub => lookup.checked_sub(operand),
                        AdjustOp::Mul => lookup.checked_mul(operand),
                        AdjustOp::Div => lookup.checked_div(operand),
                    })?;
                }

                lookup
            }
        };

        if offset.is_relative {
            lookup = checked(lookup.checked_add(global_offset))?;
        }
        Some(lookup)
    }
}
