//! Reverses ProGuard/R8 name obfuscation using the tool's `mapping.txt`.
//!
//! The format is line based:
//!
//! ```text
//! com.example.Widget -> a.b:
//!     int count -> a
//!     12:14:void draw(android.graphics.Canvas):40:42 -> b
//! ```
//!
//! Lookups that miss return the name they were given.

use crate::LineNum;
use std::borrow::Cow;
use std::collections::HashMap;
use std::io::BufRead;
use std::path::Path;
use std::{fs, io};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProguardMapError {
    #[error("could not read proguard map")]
    Io(#[from] io::Error),
    #[error("malformed proguard map at line {line}: {reason}")]
    Malformed { line: usize, reason: String },
}

#[derive(Debug, Default, Clone)]
pub struct ProguardMap {
    /// Keyed by obfuscated class name
    classes: HashMap<String, ClassMapping>,
}

#[derive(Debug, Clone)]
struct ClassMapping {
    clear_name: String,
    /// obfuscated -> clear
    fields: HashMap<String, String>,
    /// Several clear methods can share one obfuscated name; line ranges tell them apart
    methods: HashMap<String, Vec<MethodMapping>>,
}

#[derive(Debug, Clone)]
struct MethodMapping {
    clear_name: String,
    /// Inclusive range of line numbers in the obfuscated code
    obfuscated_lines: Option<(u32, u32)>,
    /// First line in the original source, when it differs from the obfuscated range
    original_start: Option<u32>,
}

/// A stack frame with names restored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame<'a> {
    pub class_name: Cow<'a, str>,
    pub method_name: Cow<'a, str>,
    pub file_name: Cow<'a, str>,
    pub line: LineNum,
}

impl ProguardMap {
    pub fn parse(text: &str) -> Result<ProguardMap, ProguardMapError> {
        ProguardMap::from_reader(text.as_bytes())
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<ProguardMap, ProguardMapError> {
        let file = fs::File::open(path)?;
        ProguardMap::from_reader(io::BufReader::new(file))
    }

    pub fn from_reader<R: BufRead>(reader: R) -> Result<ProguardMap, ProguardMapError> {
        let mut map = ProguardMap::default();
        let mut current: Option<String> = None;

        for (line_index, line) in reader.lines().enumerate() {
            let line = line?;
            let line_num = line_index + 1;
            let malformed = |reason: &str| ProguardMapError::Malformed {
                line: line_num,
                reason: reason.to_owned(),
            };

            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            if !line.starts_with(char::is_whitespace) {
                let class_line = trimmed
                    .strip_suffix(':')
                    .ok_or_else(|| malformed("class mapping must end with ':'"))?;
                let (clear, obfuscated) = split_arrow(class_line)
                    .ok_or_else(|| malformed("class mapping without '->'"))?;

                map.classes.insert(
                    obfuscated.to_owned(),
                    ClassMapping {
                        clear_name: clear.to_owned(),
                        fields: HashMap::new(),
                        methods: HashMap::new(),
                    },
                );
                current = Some(obfuscated.to_owned());
                continue;
            }

            let class = match current.as_ref().and_then(|c| map.classes.get_mut(c)) {
                Some(c) => c,
                None => return Err(malformed("member mapping before any class mapping")),
            };
            let (member, obfuscated) =
                split_arrow(trimmed).ok_or_else(|| malformed("member mapping without '->'"))?;

            if member.contains('(') {
                let method = parse_method(member).ok_or_else(|| malformed("bad method mapping"))?;
                class
                    .methods
                    .entry(obfuscated.to_owned())
                    .or_insert_with(Vec::new)
                    .push(method);
            } else {
                let name = member
                    .split_whitespace()
                    .last()
                    .ok_or_else(|| malformed("field mapping without a name"))?;
                class.fields.insert(obfuscated.to_owned(), name.to_owned());
            }
        }

        log::debug!("Loaded proguard mappings for {} classes", map.classes.len());
        Ok(map)
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    /// Array suffixes are kept: `a.b[][]` maps to `com.example.Widget[][]`.
    pub fn class_name<'a>(&'a self, obfuscated: &'a str) -> Cow<'a, str> {
        let base = obfuscated.trim_end_matches("[]");
        let dimensions = &obfuscated[base.len()..];

        match self.classes.get(base) {
            Some(c) if dimensions.is_empty() => Cow::Borrowed(&c.clear_name),
            Some(c) => Cow::Owned(format!("{}{}", c.clear_name, dimensions)),
            None => Cow::Borrowed(obfuscated),
        }
    }

    /// `obfuscated_class` is the class name as it appears in the dump
    pub fn field_name<'a>(&'a self, obfuscated_class: &str, obfuscated_field: &'a str) -> &'a str {
        self.classes
            .get(obfuscated_class)
            .and_then(|c| c.fields.get(obfuscated_field))
            .map(|s| s.as_str())
            .unwrap_or(obfuscated_field)
    }

    pub fn frame<'a>(
        &'a self,
        obfuscated_class: &'a str,
        obfuscated_method: &'a str,
        file_name: &'a str,
        line: LineNum,
    ) -> Frame<'a> {
        let class = match self.classes.get(obfuscated_class) {
            Some(c) => c,
            None => {
                return Frame {
                    class_name: Cow::Borrowed(obfuscated_class),
                    method_name: Cow::Borrowed(obfuscated_method),
                    file_name: Cow::Borrowed(file_name),
                    line,
                }
            }
        };

        let candidates = class
            .methods
            .get(obfuscated_method)
            .map(|m| m.as_slice())
            .unwrap_or(&[]);
        let by_line = match line {
            LineNum::Normal(n) => candidates.iter().find(|m| match m.obfuscated_lines {
                Some((start, end)) => start <= n && n <= end,
                None => false,
            }),
            _ => None,
        };

        let (method_name, line) = match (by_line, candidates.first()) {
            (Some(m), _) => (Cow::Borrowed(m.clear_name.as_str()), m.original_line(line)),
            (None, Some(m)) => (Cow::Borrowed(m.clear_name.as_str()), line),
            (None, None) => (Cow::Borrowed(obfuscated_method), line),
        };

        Frame {
            class_name: Cow::Borrowed(&class.clear_name),
            method_name,
            // obfuscated builds usually say "SourceFile"; the outer class name is a better guess
            file_name: Cow::Owned(source_file_for(&class.clear_name)),
            line,
        }
    }
}

impl MethodMapping {
    fn original_line(&self, line: LineNum) -> LineNum {
        match (line, self.obfuscated_lines, self.original_start) {
            (LineNum::Normal(n), Some((start, _)), Some(original)) => {
                LineNum::Normal(original + (n - start))
            }
            _ => line,
        }
    }
}

fn split_arrow(s: &str) -> Option<(&str, &str)> {
    let idx = s.find(" -> ")?;
    let (left, right) = (s[..idx].trim(), s[idx + 4..].trim());
    if left.is_empty() || right.is_empty() {
        None
    } else {
        Some((left, right))
    }
}

/// `[start:end:]return_type name(args)[:original_start[:original_end]]`
fn parse_method(member: &str) -> Option<MethodMapping> {
    let mut rest = member;
    let mut obfuscated_lines = None;

    if rest.starts_with(|c: char| c.is_ascii_digit()) {
        let mut parts = rest.splitn(3, ':');
        let start = parts.next()?.parse().ok()?;
        let end = parts.next()?.parse().ok()?;
        rest = parts.next()?;
        obfuscated_lines = Some((start, end));
    }

    let open = rest.find('(')?;
    let close = rest.rfind(')')?;
    let name = rest[..open].split_whitespace().last()?;
    let original_start = rest[close + 1..]
        .split(':')
        .find(|s| !s.is_empty())
        .and_then(|s| s.parse().ok());

    Some(MethodMapping {
        clear_name: name.to_owned(),
        obfuscated_lines,
        original_start,
    })
}

fn source_file_for(class_name: &str) -> String {
    let simple = class_name.rsplit('.').next().unwrap_or(class_name);
    let outer = simple.split('$').next().unwrap_or(simple);
    format!("{}.java", outer)
}
