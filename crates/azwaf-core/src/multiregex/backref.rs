//! Backreference emulation
//!
//! Backreferences such as `\b(\w+)\b \b\1\b` are rewritten so the referenced
//! group is repeated in place of the backreference. The verifier then checks
//! that the stand-in group captured the same text as the referenced group.
//! A negative lookahead `(?!\b\1\b)` directly followed by a copy of the
//! referenced group is rewritten to a stand-in that must capture different text.

use crate::{Result, WafError};
use regex::bytes::Regex;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug)]
enum Part {
    Text(String),
    Group(Group),
    Backref(usize),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum StandIn {
    #[default]
    No,
    Equal,
    NotEqual,
}

#[derive(Clone, Debug, Default)]
struct Group {
    parts: Vec<Part>,
    non_capturing: bool,
    negative_lookahead: bool,
    id: usize,
    stand_in: StandIn,
}

impl Part {
    fn render(&self) -> String {
        match self {
            Part::Text(t) => t.clone(),
            Part::Group(g) => g.render(),
            Part::Backref(n) => format!("\\{n}"),
        }
    }
}

impl Group {
    fn render(&self) -> String {
        let mut s = String::from("(");
        for p in &self.parts {
            s.push_str(&p.render());
        }
        s.push(')');
        s
    }
}

/// Regex whose backreference was replaced by a copy of the referenced group
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackrefRegex {
    pub expr: String,
    pub referenced_group: usize,
    pub equal_groups: Vec<usize>,
    pub not_equal_groups: Vec<usize>,
}

fn parse_regex(rx: &str) -> Result<Group> {
    let mut stack: Vec<Group> = Vec::new();
    let mut cur = Group::default();
    let mut next_id = 0;
    let mut text_start = 0;
    let mut escape = false;
    let mut charclass = false;
    let bytes = rx.as_bytes();

    for (i, c) in rx.char_indices() {
        if escape {
            if c.is_ascii_digit() && !charclass {
                if i - 1 > text_start {
                    cur.parts.push(Part::Text(rx[text_start..i - 1].to_string()));
                }
                text_start = i + 1;
                cur.parts.push(Part::Backref((c as u8 - b'0') as usize));
            }
            escape = false;
        } else if c == '\\' {
            escape = true;
        } else if charclass {
            if c == ']' {
                charclass = false;
            }
        } else if c == '[' {
            charclass = true;
        } else if c == '(' || c == ')' {
            if i > text_start {
                cur.parts.push(Part::Text(rx[text_start..i].to_string()));
            }
            text_start = i + 1;

            if c == '(' {
                stack.push(std::mem::take(&mut cur));
                if bytes.get(i + 1) == Some(&b'?') {
                    cur.non_capturing = true;
                    cur.negative_lookahead = bytes.get(i + 2) == Some(&b'!');
                } else {
                    next_id += 1;
                    cur.id = next_id;
                }
            } else {
                let done = std::mem::take(&mut cur);
                cur = stack
                    .pop()
                    .ok_or_else(|| WafError::Regex(format!("unmatched parenthesis at character {i}")))?;
                cur.parts.push(Part::Group(done));
            }
        }
    }

    if !stack.is_empty() {
        return Err(WafError::Regex("incomplete group".into()));
    }

    if text_start < rx.len() {
        cur.parts.push(Part::Text(rx[text_start..].to_string()));
    }

    Ok(cur)
}

fn ends_with_word_boundary(s: &str) -> bool {
    let Some(head) = s.strip_suffix("\\b") else {
        return false;
    };
    let slashes = head.bytes().rev().take_while(|&b| b == b'\\').count();
    slashes % 2 == 0
}

fn surrounded_by_word_boundaries(parts: &[Part], i: usize) -> bool {
    i > 0
        && ends_with_word_boundary(&parts[i - 1].render())
        && parts.get(i + 1).map_or(false, |p| p.render().starts_with("\\b"))
}

fn find_referenced(
    g: &Group,
    max_seen: &mut usize,
    referenced: &mut Option<usize>,
) -> Result<()> {
    for (i, p) in g.parts.iter().enumerate() {
        match p {
            Part::Backref(n) => {
                let n = *n;
                if n == 0 {
                    return Err(WafError::Regex("backreference to group 0 is not supported".into()));
                }
                match referenced {
                    None => *referenced = Some(n),
                    Some(r) if *r != n => {
                        return Err(WafError::Regex(
                            "backreferences to multiple different groups is not supported".into(),
                        ))
                    }
                    _ => {}
                }
                if n > *max_seen {
                    return Err(WafError::Regex(format!(
                        "backreference attempted to reference group {n}, but only backreference to previous groups is supported"
                    )));
                }
                if n == g.id {
                    return Err(WafError::Regex(format!(
                        "backreference in group {} attempted to reference group {n}, but circular backreferences are not supported",
                        g.id
                    )));
                }
                if !surrounded_by_word_boundaries(&g.parts, i) {
                    return Err(WafError::Regex(
                        r"only backreference that are surrounded by word boundaries (\b) are supported".into(),
                    ));
                }
            }
            Part::Group(child) => {
                if child.id > *max_seen {
                    *max_seen = child.id;
                }
                find_referenced(child, max_seen, referenced)?;
            }
            Part::Text(_) => {}
        }
    }
    Ok(())
}

fn referenced_group(g: &Group, id: usize) -> Result<Option<Group>> {
    for (i, p) in g.parts.iter().enumerate() {
        if let Part::Group(child) = p {
            if child.id == id {
                if !surrounded_by_word_boundaries(&g.parts, i) {
                    return Err(WafError::Regex(
                        r"only backreference to groups that are surrounded by word boundaries (\b) are supported".into(),
                    ));
                }
                return Ok(Some(child.clone()));
            }
            if let Some(found) = referenced_group(child, id)? {
                return Ok(Some(found));
            }
        }
    }
    Ok(None)
}

fn bounded_stand_in(target: &Group) -> Group {
    let mut parts = vec![Part::Text("\\b".into())];
    parts.extend(target.parts.iter().cloned());
    parts.push(Part::Text("\\b".into()));
    Group {
        parts,
        stand_in: StandIn::NotEqual,
        ..Group::default()
    }
}

fn replace_backrefs(g: &mut Group, target: &Group) {
    let target_rendered = target.render();
    let target_inner = &target_rendered[1..target_rendered.len() - 1];

    let mut i = 0;
    while i < g.parts.len() {
        match &g.parts[i] {
            Part::Backref(_) => {
                g.parts[i] = Part::Group(Group {
                    parts: target.parts.clone(),
                    stand_in: StandIn::Equal,
                    ..Group::default()
                });
            }
            Part::Group(child) => {
                let is_not_equal_lookahead = child.negative_lookahead
                    && child.parts.len() == 3
                    && i + 1 < g.parts.len()
                    && child.parts[0].render() == "?!\\b"
                    && child.parts[2].render() == "\\b"
                    && matches!(child.parts[1], Part::Backref(n) if n == target.id);

                if is_not_equal_lookahead {
                    let next_is_copy =
                        matches!(&g.parts[i + 1], Part::Group(_)) && g.parts[i + 1].render() == target_rendered;
                    if next_is_copy {
                        g.parts[i] = Part::Group(bounded_stand_in(target));
                        g.parts[i + 1] = Part::Text(String::new());
                        i += 1;
                        continue;
                    }

                    if let Part::Text(next) = &g.parts[i + 1] {
                        if let Some(rest) = next.strip_prefix(target_inner) {
                            let rest = rest.to_string();
                            g.parts[i] = Part::Group(bounded_stand_in(target));
                            g.parts[i + 1] = Part::Text(rest);
                            i += 1;
                            continue;
                        }
                    }
                }

                if let Part::Group(child) = &mut g.parts[i] {
                    replace_backrefs(child, target);
                }
            }
            Part::Text(_) => {}
        }
        i += 1;
    }
}

fn renumber(g: &mut Group, next_id: &mut usize, out: &mut BackrefRegex) {
    for p in g.parts.iter_mut() {
        if let Part::Group(child) = p {
            if !child.non_capturing {
                child.id = *next_id;
                *next_id += 1;
                match child.stand_in {
                    StandIn::Equal => out.equal_groups.push(child.id),
                    StandIn::NotEqual => out.not_equal_groups.push(child.id),
                    StandIn::No => {}
                }
            }
            renumber(child, next_id, out);
        }
    }
}

/// Rewrite an expression containing a backreference.
///
/// Returns `Ok(None)` when the expression has no backreference.
pub fn rewrite(expr: &str) -> Result<Option<BackrefRegex>> {
    let mut root = parse_regex(expr)?;

    let mut max_seen = 0;
    let mut referenced = None;
    find_referenced(&root, &mut max_seen, &mut referenced)?;
    let Some(referenced) = referenced else {
        return Ok(None);
    };

    let target = referenced_group(&root, referenced)?
        .ok_or_else(|| WafError::Regex(format!("referenced group {referenced} not found")))?;

    replace_backrefs(&mut root, &target);

    let mut out = BackrefRegex {
        expr: String::new(),
        referenced_group: referenced,
        equal_groups: Vec::new(),
        not_equal_groups: Vec::new(),
    };
    let mut next_id = 1;
    renumber(&mut root, &mut next_id, &mut out);

    let rendered = root.render();
    out.expr = rendered[1..rendered.len() - 1].to_string();
    Ok(Some(out))
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

impl BackrefRegex {
    fn groups_consistent(&self, groups: &[&[u8]]) -> bool {
        let Some(reference) = groups.get(self.referenced_group) else {
            return false;
        };
        for &g in &self.equal_groups {
            let other = groups.get(g).copied().unwrap_or_default();
            if !other.is_empty() && !reference.eq_ignore_ascii_case(other) {
                return false;
            }
        }
        for &g in &self.not_equal_groups {
            let other = groups.get(g).copied().unwrap_or_default();
            if !other.is_empty() && reference.eq_ignore_ascii_case(other) {
                return false;
            }
        }
        true
    }

    /// Find the first match whose stand-in groups agree with the referenced group.
    pub fn try_match(&self, regex: &Regex, input: &[u8]) -> Option<(usize, usize, Vec<Vec<u8>>)> {
        let mut offset = 0;
        loop {
            let rest = &input[offset..];
            let mut any = false;
            for caps in regex.captures_iter(rest) {
                any = true;
                let groups: Vec<&[u8]> = (0..caps.len())
                    .map(|i| caps.get(i).map_or(&b""[..], |m| m.as_bytes()))
                    .collect();
                if self.groups_consistent(&groups) {
                    let whole = caps.get(0)?;
                    let owned = groups.iter().map(|g| g.to_vec()).collect();
                    return Some((offset + whole.start(), offset + whole.end(), owned));
                }
            }
            if !any {
                return None;
            }

            // Overlapping candidates may hide a consistent match; retry from the next word start
            loop {
                offset += 1;
                if offset >= input.len() {
                    return None;
                }
                if !is_word_byte(input[offset]) {
                    break;
                }
            }
        }
    }
}
