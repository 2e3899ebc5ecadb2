//! Shell pattern matching for `case`: `*`, `?`, bracket expressions and
//! backslash escapes.

/// Prefix glob metacharacters with a backslash so they match literally.
pub(super) fn escape_into(out: &mut String, text: &str) {
    for c in text.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Item {
    Char(char),
    Any,
    Star,
    Class { negated: bool, ranges: Vec<(char, char)> },
}

fn compile(pattern: &str) -> Vec<Item> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut items = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '\\' if i + 1 < chars.len() => {
                items.push(Item::Char(chars[i + 1]));
                i += 2;
            }
            '*' => {
                if items.last() != Some(&Item::Star) {
                    items.push(Item::Star);
                }
                i += 1;
            }
            '?' => {
                items.push(Item::Any);
                i += 1;
            }
            '[' => match class(&chars, i + 1) {
                Some((item, next)) => {
                    items.push(item);
                    i = next;
                }
                None => {
                    items.push(Item::Char('['));
                    i += 1;
                }
            },
            c => {
                items.push(Item::Char(c));
                i += 1;
            }
        }
    }
    items
}

/// A bracket expression starting after `[`. An unterminated one is `None`
/// and the `[` matches itself.
fn class(chars: &[char], mut i: usize) -> Option<(Item, usize)> {
    let negated = matches!(chars.get(i), Some('!' | '^'));
    if negated {
        i += 1;
    }
    let mut ranges = Vec::new();
    let mut first = true;
    loop {
        let mut c = *chars.get(i)?;
        if c == ']' && !first {
            return Some((Item::Class { negated, ranges }, i + 1));
        }
        first = false;
        if c == '\\' {
            i += 1;
            c = *chars.get(i)?;
        }
        match (chars.get(i + 1), chars.get(i + 2)) {
            (Some('-'), Some(&end)) if end != ']' => {
                ranges.push((c, end));
                i += 3;
            }
            _ => {
                ranges.push((c, c));
                i += 1;
            }
        }
    }
}

fn item_matches(item: &Item, c: char) -> bool {
    match item {
        Item::Char(p) => *p == c,
        Item::Any => true,
        Item::Star => false,
        Item::Class { negated, ranges } => {
            ranges.iter().any(|(lo, hi)| (*lo..=*hi).contains(&c)) != *negated
        }
    }
}

/// Whether `text` matches the whole of `pattern`.
pub(super) fn matches(pattern: &str, text: &str) -> bool {
    let items = compile(pattern);
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0, 0);
    // Position after the last `*` and the text index it was tried at.
    let mut backtrack: Option<(usize, usize)> = None;
    while t < text.len() {
        match items.get(p) {
            Some(Item::Star) => {
                p += 1;
                backtrack = Some((p, t));
            }
            Some(item) if item_matches(item, text[t]) => {
                p += 1;
                t += 1;
            }
            _ => match backtrack {
                Some((star_p, star_t)) => {
                    p = star_p;
                    t = star_t + 1;
                    backtrack = Some((star_p, t));
                }
                None => return false,
            },
        }
    }
    items[p..].iter().all(|item| *item == Item::Star)
}
