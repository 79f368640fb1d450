use std::fs;
use std::path::Path;
use std::str;

use log::{trace, warn};
use nom::branch::alt;
use nom::character::complete::{char, one_of};
use nom::combinator::{fail, opt};
use nom::IResult;

use crate::ast::{
    Adjustment, AdjustOp, Comparison, Endianness, IndirectOffset, IntegerKind, Kind, Offset,
    OffsetBase, Rule, SearchKind, Spellbook, StringFlags, StringKind, UseKind, MAX_LEVELS,
};
use crate::lexer;
use crate::Error;

/// Window length of a `search` test when the rule gives none.
const DEFAULT_SEARCH_LEN: usize = 8192;

impl Spellbook {
    /// Parses rule text into the book. Lines that are empty, comments
    /// (`#`) or unsupported directives (`!`) are ignored; malformed rules
    /// log a diagnostic and are dropped without affecting their neighbors.
    pub fn load_text(&mut self, text: &[u8]) {
        let mut page = String::new();
        for line in text.split(|&b| b == b'\n') {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            parse_line(line, &mut page, self);
        }
    }

    /// Reads one rule file into the book.
    pub fn load_file<P: AsRef<Path>>(&mut self, path: P) -> Result<(), Error> {
        let path = path.as_ref();
        let text = fs::read(path).map_err(|source| Error::RuleSource {
            path: path.to_path_buf(),
            source,
        })?;
        self.load_text(&text);
        Ok(())
    }

    /// Reads every file in a directory, in alphabetic order, and parses
    /// their concatenation. Page context carries across file boundaries,
    /// exactly as if the files had been one.
    pub fn load_directory<P: AsRef<Path>>(&mut self, dir: P) -> Result<(), Error> {
        let dir = dir.as_ref();
        let pattern = dir.join("*");
        let entries = glob::glob(&pattern.to_string_lossy()).map_err(|_| Error::RuleDirectory {
            path: dir.to_path_buf(),
        })?;

        let mut text = Vec::new();
        for entry in entries {
            let path = match entry {
                Ok(path) => path,
                Err(err) => {
                    warn!("skipping unreadable rule database entry: {}", err);
                    continue;
                }
            };
            if !path.is_file() {
                continue;
            }
            let bytes = fs::read(&path).map_err(|source| Error::RuleSource {
                path: path.clone(),
                source,
            })?;
            text.extend_from_slice(&bytes);
            text.push(b'\n');
        }

        self.load_text(&text);
        Ok(())
    }
}

fn scan_field(line: &[u8], start: usize) -> (&[u8], usize) {
    let mut i = start;
    while i < line.len() && !lexer::is_rule_whitespace(line[i]) {
        i += 1;
    }
    (&line[start..i], i)
}

// like scan_field, but a backslash shields the next byte from ending the
// field, so escaped spaces survive into the test
fn scan_test_field(line: &[u8], start: usize) -> (&[u8], usize) {
    let mut i = start;
    while i < line.len() && !lexer::is_rule_whitespace(line[i]) {
        if line[i] == b'\\' {
            i += 2;
        } else {
            i += 1;
        }
    }
    let end = i.min(line.len());
    (&line[start..end], end)
}

fn skip_whitespace(line: &[u8], mut i: usize) -> usize {
    while i < line.len() && lexer::is_rule_whitespace(line[i]) {
        i += 1;
    }
    i
}

fn parse_line(line: &[u8], page: &mut String, book: &mut Spellbook) {
    if line.is_empty() {
        return;
    }
    if line[0] == b'#' || line[0] == b'!' {
        return;
    }

    let mut level = 0;
    let mut i = 0;
    while i < line.len() && line[i] == b'>' {
        level += 1;
        i += 1;
    }

    if level == 0 {
        // a top-level rule closes whatever named page was open
        page.clear();
    }

    if level >= MAX_LEVELS {
        warn!(
            "rule nested {} levels deep (max {}), skipping: {}",
            level,
            MAX_LEVELS,
            String::from_utf8_lossy(line)
        );
        return;
    }

    trace!("| {}", String::from_utf8_lossy(line));

    let (offset_field, i) = scan_field(line, i);
    let i = skip_whitespace(line, i);
    let (kind_field, i) = scan_field(line, i);
    let i = skip_whitespace(line, i);
    let (test_field, i) = scan_test_field(line, i);
    let i = skip_whitespace(line, i);
    let description = &line[i..];

    let offset = match offset_expr(offset_field) {
        // trailing bytes after a well-formed offset have always been ignored
        Ok((_, offset)) => offset,
        Err(_) => {
            warn!(
                "malformed offset {:?}, skipping: {}",
                String::from_utf8_lossy(offset_field),
                String::from_utf8_lossy(line)
            );
            return;
        }
    };

    let (kind_rest, kind_name) = match lexer::identifier(kind_field) {
        Ok(parsed) => parsed,
        Err(_) => return,
    };
    let kind_name = str::from_utf8(kind_name).unwrap_or_default();

    let kind = match kind_name {
        "byte" | "short" | "long" | "quad" | "leshort" | "lelong" | "lequad" | "beshort"
        | "belong" | "bequad" | "ubyte" | "ushort" | "ulong" | "uquad" | "uleshort" | "ulelong"
        | "ulequad" | "ubeshort" | "ubelong" | "ubequad" => {
            match integer_kind(kind_name, kind_rest, test_field) {
                Some(kind) => kind,
                None => {
                    warn!("bad integer test, skipping: {}", String::from_utf8_lossy(line));
                    return;
                }
            }
        }
        "string" => {
            let (negate, pattern_field) = match test_field.strip_prefix(b"!") {
                Some(rest) => (true, rest),
                None => (false, test_field),
            };
            let pattern = match lexer::decoded_string(pattern_field) {
                Ok(pattern) => pattern,
                Err(err) => {
                    warn!(
                        "bad string pattern ({}), skipping: {}",
                        err,
                        String::from_utf8_lossy(line)
                    );
                    return;
                }
            };
            let flags = match kind_rest.strip_prefix(b"/") {
                Some(rest) => lexer::string_flags(rest),
                None => StringFlags::default(),
            };
            Kind::String(StringKind {
                pattern,
                negate,
                flags,
            })
        }
        "search" => {
            let max_len = match kind_rest.strip_prefix(b"/") {
                Some(rest) => match lexer::unsigned(rest) {
                    Ok((_, len)) => len as usize,
                    Err(_) => {
                        warn!(
                            "bad search length {:?}, skipping: {}",
                            String::from_utf8_lossy(rest),
                            String::from_utf8_lossy(line)
                        );
                        return;
                    }
                },
                None => DEFAULT_SEARCH_LEN,
            };
            let pattern = match lexer::decoded_string(test_field) {
                Ok(pattern) => pattern,
                Err(err) => {
                    warn!(
                        "bad search pattern ({}), skipping: {}",
                        err,
                        String::from_utf8_lossy(line)
                    );
                    return;
                }
            };
            Kind::Search(SearchKind { pattern, max_len })
        }
        "default" => Kind::Default,
        "clear" => Kind::Clear,
        "use" => {
            // the field splitter keeps escaping backslashes, so the swap
            // marker arrives as either `^page` or `\^page`
            let (swap_endian, name_field) = if let Some(rest) = test_field.strip_prefix(b"\\^") {
                (true, rest)
            } else if let Some(rest) = test_field.strip_prefix(b"^") {
                (true, rest)
            } else {
                (false, test_field)
            };
            if name_field.is_empty() {
                warn!("use without a page name, skipping: {}", String::from_utf8_lossy(line));
                return;
            }
            Kind::Use(UseKind {
                page: String::from_utf8_lossy(name_field).into_owned(),
                swap_endian,
            })
        }
        "name" => {
            // opens a named page; the directive itself is not a rule. The
            // page stays open until the next top-level rule.
            if level != 0 {
                warn!(
                    "name directive below the top level, skipping: {}",
                    String::from_utf8_lossy(line)
                );
                return;
            }
            let page_name = match lexer::identifier(test_field) {
                Ok((_, name)) if !name.is_empty() => name,
                _ => {
                    warn!(
                        "name directive without a page name, skipping: {}",
                        String::from_utf8_lossy(line)
                    );
                    return;
                }
            };
            *page = String::from_utf8_lossy(page_name).into_owned();
            return;
        }
        other => {
            warn!(
                "unhandled kind {:?}, skipping: {}",
                other,
                String::from_utf8_lossy(line)
            );
            return;
        }
    };

    book.add_rule(
        page,
        Rule {
            level,
            offset,
            kind,
            description: description.to_vec(),
        },
    );
}

fn integer_kind(name: &str, kind_rest: &[u8], test: &[u8]) -> Option<Kind> {
    let mut signed = true;
    let mut endianness = Endianness::Little;

    let mut simple = name;
    if let Some(stripped) = simple.strip_prefix('u') {
        signed = false;
        simple = stripped;
    }
    if let Some(stripped) = simple.strip_prefix("le") {
        simple = stripped;
    } else if let Some(stripped) = simple.strip_prefix("be") {
        endianness = Endianness::Big;
        simple = stripped;
    }
    let byte_width = match simple {
        "byte" => 1,
        "short" => 2,
        "long" => 4,
        "quad" => 8,
        _ => return None,
    };

    let and_mask = match kind_rest.strip_prefix(b"&") {
        Some(rest) => match lexer::unsigned(rest) {
            Ok((_, mask)) => Some(mask),
            Err(_) => {
                warn!(
                    "couldn't parse integer mask {:?}",
                    String::from_utf8_lossy(rest)
                );
                return None;
            }
        },
        None => None,
    };

    let mut comparison = Comparison::Equal;
    let mut k = 0;
    match test.first() {
        Some(b'x') => {
            comparison = Comparison::MatchAny;
            k = 1;
        }
        Some(b'=') => k = 1,
        Some(b'!') => {
            comparison = Comparison::NotEqual;
            k = 1;
        }
        Some(b'<') => {
            comparison = Comparison::LessThan;
            k = 1;
        }
        Some(b'>') => {
            comparison = Comparison::GreaterThan;
            k = 1;
        }
        _ => {}
    }

    let mut value = 0;
    if comparison != Comparison::MatchAny {
        match lexer::signed(&test[k..]) {
            Ok((_, parsed)) => value = parsed,
            Err(_) => {
                warn!(
                    "couldn't parse integer test value {:?}",
                    String::from_utf8_lossy(&test[k..])
                );
                return None;
            }
        }
    }

    Some(Kind::Integer(IntegerKind {
        byte_width,
        endianness,
        signed,
        and_mask,
        comparison,
        value,
    }))
}

// offset := ['&'] ( indirect | direct )
fn offset_expr(input: &[u8]) -> IResult<&[u8], Offset> {
    let (input, relative) = opt(char('&'))(input)?;
    let (input, base) = alt((indirect_base, direct_base))(input)?;
    Ok((
        input,
        Offset {
            base,
            is_relative: relative.is_some(),
        },
    ))
}

fn direct_base(input: &[u8]) -> IResult<&[u8], OffsetBase> {
    let (input, value) = lexer::signed(input)?;
    Ok((input, OffsetBase::Direct(value)))
}

// indirect := '(' ['&'] intlit ('.'|',') fmt [ op operand ] ')'
fn indirect_base(input: &[u8]) -> IResult<&[u8], OffsetBase> {
    let (input, _) = char('(')(input)?;
    let (input, relative) = opt(char('&'))(input)?;
    let (input, offset_address) = lexer::signed(input)?;
    let (input, _) = one_of(".,")(input)?;
    let (input, (byte_width, endianness)) = pointer_format(input)?;
    let (input, adjustment) = opt(adjustment_expr)(input)?;
    let (input, _) = char(')')(input)?;
    Ok((
        input,
        OffsetBase::Indirect(IndirectOffset {
            is_relative: relative.is_some(),
            byte_width,
            endianness,
            offset_address,
            adjustment,
        }),
    ))
}

// fmt := [bBsSlLiImM]; uppercase is big-endian. The id3 (`i`) and
// middle-endian (`m`) widths exist in the wild but are not supported.
fn pointer_format(input: &[u8]) -> IResult<&[u8], (u32, Endianness)> {
    let (rest, letter) = one_of("bBsSlLiImM")(input)?;
    let endianness = if letter.is_ascii_uppercase() {
        Endianness::Big
    } else {
        Endianness::Little
    };
    let byte_width = match letter.to_ascii_lowercase() {
        'b' => 1,
        's' => 2,
        'l' => 4,
        'i' => {
            warn!("id3 offset format is not supported");
            return fail(input);
        }
        _ => {
            warn!("middle-endian offset format is not supported");
            return fail(input);
        }
    };
    Ok((rest, (byte_width, endianness)))
}

// op := '+' | '-' | '*' | '/'; a parenthesized operand is read from the
// target at evaluation time instead of being a literal
fn adjustment_expr(input: &[u8]) -> IResult<&[u8], Adjustment> {
    let (input, op) = one_of("+-*/")(input)?;
    let op = match op {
        '+' => AdjustOp::Add,
        '-' => AdjustOp::Sub,
        '*' => AdjustOp::Mul,
        _ => AdjustOp::Div,
    };
    let (input, open) = opt(char('('))(input)?;
    let (input, value) = lexer::signed(input)?;
    let input = if open.is_some() {
        let (input, _) = char(')')(input)?;
        input
    } else {
        input
    };
    Ok((
        input,
        Adjustment {
            op,
            is_relative: open.is_some(),
            value,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book_of(text: &[u8]) -> Spellbook {
        let mut book = Spellbook::new();
        book.load_text(text);
        book
    }

    fn main_rules(book: &Spellbook) -> &[Rule] {
        book.page("").expect("main page")
    }

    #[test]
    fn comments_and_directives_are_ignored() {
        let book = book_of(b"# comment\n!:mime image/png\n\n0\tstring\tBM\tPC bitmap\n");
        assert_eq!(book.rule_count(), 1);
    }

    #[test]
    fn levels_count_leading_markers() {
        let book = book_of(b"0\tstring\tBM\tPC bitmap\n>18\tlelong\tx\t, width %d\n>>4\tbyte\t1\tdeep\n");
        let rules = main_rules(&book);
        assert_eq!(rules.len(), 3);
        assert_eq!(rules[0].level, 0);
        assert_eq!(rules[1].level, 1);
        assert_eq!(rules[2].level, 2);
        assert_eq!(rules[1].offset.base, OffsetBase::Direct(18));
        assert_eq!(rules[1].description, b", width %d".to_vec());
    }

    #[test]
    fn rules_nested_too_deep_are_dropped() {
        let mut line = vec![b'>'; MAX_LEVELS];
        line.extend_from_slice(b"0\tbyte\t1\ttoo deep\n");
        let book = book_of(&line);
        assert_eq!(book.rule_count(), 0);
    }

    #[test]
    fn integer_kind_names_carry_width_sign_and_order() {
        let book = book_of(
            b"0\tbyte\t1\ta\n\
              0\tleshort\t2\tb\n\
              0\tbelong\t3\tc\n\
              0\tuquad\t4\td\n\
              0\tubeshort\t5\te\n",
        );
        let rules = main_rules(&book);
        let ik = |rule: &Rule| match &rule.kind {
            Kind::Integer(ik) => ik.clone(),
            other => panic!("expected integer kind, got {:?}", other),
        };

        let byte = ik(&rules[0]);
        assert_eq!((byte.byte_width, byte.signed), (1, true));
        assert_eq!(byte.endianness, Endianness::Little);

        let leshort = ik(&rules[1]);
        assert_eq!(leshort.byte_width, 2);
        assert_eq!(leshort.endianness, Endianness::Little);

        let belong = ik(&rules[2]);
        assert_eq!(belong.byte_width, 4);
        assert_eq!(belong.endianness, Endianness::Big);

        let uquad = ik(&rules[3]);
        assert_eq!((uquad.byte_width, uquad.signed), (8, false));

        let ubeshort = ik(&rules[4]);
        assert_eq!((ubeshort.byte_width, ubeshort.signed), (2, false));
        assert_eq!(ubeshort.endianness, Endianness::Big);
    }

    #[test]
    fn integer_test_comparators() {
        let book = book_of(
            b"0\tbyte\t0x7f\teq\n\
              0\tbyte\t=0x7f\texplicit eq\n\
              0\tbyte\t!0\tne\n\
              0\tbyte\t<10\tlt\n\
              0\tbyte\t>-1\tgt\n\
              0\tbyte\tx\tany\n",
        );
        let rules = main_rules(&book);
        let cmp = |rule: &Rule| match &rule.kind {
            Kind::Integer(ik) => (ik.comparison, ik.value),
            other => panic!("expected integer kind, got {:?}", other),
        };
        assert_eq!(cmp(&rules[0]), (Comparison::Equal, 0x7f));
        assert_eq!(cmp(&rules[1]), (Comparison::Equal, 0x7f));
        assert_eq!(cmp(&rules[2]), (Comparison::NotEqual, 0));
        assert_eq!(cmp(&rules[3]), (Comparison::LessThan, 10));
        assert_eq!(cmp(&rules[4]), (Comparison::GreaterThan, -1));
        assert_eq!(cmp(&rules[5]), (Comparison::MatchAny, 0));
    }

    #[test]
    fn integer_mask_suffix() {
        let book = book_of(b"0\tlelong&0xfff0\t0x40\tmasked\n");
        match &main_rules(&book)[0].kind {
            Kind::Integer(ik) => assert_eq!(ik.and_mask, Some(0xfff0)),
            other => panic!("expected integer kind, got {:?}", other),
        }
    }

    #[test]
    fn string_kind_decodes_escapes_and_flags() {
        let book = book_of(b"0\tstring\t\\x89PNG\\r\\n\\x1a\\n\tPNG image\n0\tstring/Wc\t!hello\\ world\tnot hello\n");
        let rules = main_rules(&book);

        match &rules[0].kind {
            Kind::String(sk) => {
                assert_eq!(sk.pattern, b"\x89PNG\r\n\x1a\n".to_vec());
                assert!(!sk.negate);
                assert!(sk.flags.is_empty());
            }
            other => panic!("expected string kind, got {:?}", other),
        }
        assert_eq!(rules[0].description, b"PNG image".to_vec());

        match &rules[1].kind {
            Kind::String(sk) => {
                assert_eq!(sk.pattern, b"hello world".to_vec());
                assert!(sk.negate);
                assert!(sk.flags.compact_whitespace);
                assert!(sk.flags.lower_matches_both);
            }
            other => panic!("expected string kind, got {:?}", other),
        }
    }

    #[test]
    fn search_kind_length_suffix() {
        let book = book_of(b"0\tsearch/16\tneedle\tfound\n0\tsearch\tneedle\tfound\n");
        let rules = main_rules(&book);
        match &rules[0].kind {
            Kind::Search(sk) => assert_eq!((sk.max_len, sk.pattern.as_slice()), (16, &b"needle"[..])),
            other => panic!("expected search kind, got {:?}", other),
        }
        match &rules[1].kind {
            Kind::Search(sk) => assert_eq!(sk.max_len, DEFAULT_SEARCH_LEN),
            other => panic!("expected search kind, got {:?}", other),
        }
    }

    #[test]
    fn indirect_offsets() {
        let book = book_of(
            b"(4.l)\tbyte\t0x7f\tplain\n\
              &(0x10,S)\tbyte\t1\tcomma and big endian\n\
              (&4.b+16)\tbyte\t1\trelative pointer\n\
              (4.l+(8))\tbyte\t1\trelative operand\n\
              (4.l/-2)\tbyte\t1\tdivision\n",
        );
        let rules = main_rules(&book);
        assert_eq!(rules.len(), 5);

        match &rules[0].offset.base {
            OffsetBase::Indirect(ind) => {
                assert_eq!(ind.offset_address, 4);
                assert_eq!(ind.byte_width, 4);
                assert_eq!(ind.endianness, Endianness::Little);
                assert!(!ind.is_relative);
                assert!(ind.adjustment.is_none());
            }
            other => panic!("expected indirect offset, got {:?}", other),
        }

        assert!(rules[1].offset.is_relative);
        match &rules[1].offset.base {
            OffsetBase::Indirect(ind) => {
                assert_eq!(ind.offset_address, 0x10);
                assert_eq!(ind.byte_width, 2);
                assert_eq!(ind.endianness, Endianness::Big);
            }
            other => panic!("expected indirect offset, got {:?}", other),
        }

        match &rules[2].offset.base {
            OffsetBase::Indirect(ind) => {
                assert!(ind.is_relative);
                let adj = ind.adjustment.as_ref().unwrap();
                assert_eq!((adj.op, adj.is_relative, adj.value), (AdjustOp::Add, false, 16));
            }
            other => panic!("expected indirect offset, got {:?}", other),
        }

        match &rules[3].offset.base {
            OffsetBase::Indirect(ind) => {
                let adj = ind.adjustment.as_ref().unwrap();
                assert_eq!((adj.op, adj.is_relative, adj.value), (AdjustOp::Add, true, 8));
            }
            other => panic!("expected indirect offset, got {:?}", other),
        }

        match &rules[4].offset.base {
            OffsetBase::Indirect(ind) => {
                let adj = ind.adjustment.as_ref().unwrap();
                assert_eq!((adj.op, adj.value), (AdjustOp::Div, -2));
            }
            other => panic!("expected indirect offset, got {:?}", other),
        }
    }

    #[test]
    fn unsupported_pointer_formats_are_skipped() {
        let book = book_of(b"(4.i)\tbyte\t1\tid3\n(4.m)\tbyte\t1\tmiddle\n0\tbyte\t1\tok\n");
        assert_eq!(book.rule_count(), 1);
    }

    #[test]
    fn malformed_rules_do_not_poison_neighbors() {
        let book = book_of(
            b"0\tbyte\t1\tgood\n\
              zzz\tbyte\t1\tbad offset\n\
              0\twombat\t1\tbad kind\n\
              0\tstring\t\\q\tbad escape\n\
              (4.l\tbyte\t1\tunclosed indirect\n\
              0\tbyte\tnotanumber\tbad value\n\
              0\tbyte\t2\tgood again\n",
        );
        assert_eq!(book.rule_count(), 2);
    }

    #[test]
    fn name_opens_a_page_and_top_level_closes_it() {
        let book = book_of(
            b"0\tname\telf\n\
              >0\tleshort\t2\texecutable\n\
              >0\tleshort\t3\tshared object\n\
              0\tstring\tMZ\tDOS executable\n",
        );
        let elf = book.page("elf").expect("elf page");
        assert_eq!(elf.len(), 2);
        assert_eq!(elf[0].level, 1);
        assert_eq!(main_rules(&book).len(), 1);
    }

    #[test]
    fn use_kind_with_swap_marker() {
        let book = book_of(b"0\tuse\telf\tplain\n0\tuse\t\\^elf\tswapped\n0\tuse\t^elf\tbare marker\n");
        let rules = main_rules(&book);
        match &rules[0].kind {
            Kind::Use(uk) => assert_eq!((uk.page.as_str(), uk.swap_endian), ("elf", false)),
            other => panic!("expected use kind, got {:?}", other),
        }
        match &rules[1].kind {
            Kind::Use(uk) => assert_eq!((uk.page.as_str(), uk.swap_endian), ("elf", true)),
            other => panic!("expected use kind, got {:?}", other),
        }
        match &rules[2].kind {
            Kind::Use(uk) => assert_eq!((uk.page.as_str(), uk.swap_endian), ("elf", true)),
            other => panic!("expected use kind, got {:?}", other),
        }
    }

    #[test]
    fn description_runs_from_first_non_whitespace_to_line_end() {
        // the whole separator run is consumed; everything after it is
        // data, embedded whitespace included
        let book = book_of(b"0\tstring\tBM\t  PC bitmap,  v3\t!\n");
        assert_eq!(
            main_rules(&book)[0].description,
            b"PC bitmap,  v3\t!".to_vec()
        );
    }

    #[test]
    fn direct_offset_literals_round_trip_through_display() {
        let source = b"0x18\tbyte\t1\ta\n&-16\tbyte\t1\tb\n052\tbyte\t1\tc\n";
        let book = book_of(source);
        for rule in main_rules(&book) {
            let rendered = rule.offset.to_string();
            let (_, reparsed) = offset_expr(rendered.as_bytes()).expect("rendered offset parses");
            assert_eq!(reparsed, rule.offset);
        }
    }

    #[test]
    fn fixture_database_parses_fully() {
        let text = include_bytes!("../test_files/rules/images");
        let book = book_of(text);
        assert_eq!(book.rule_count(), 7);
        assert!(book.page("pngdim").is_some());
    }
}
