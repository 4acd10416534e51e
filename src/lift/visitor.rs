use std::collections::{HashMap, HashSet};

use oxc::ast::ast::Expression;
use oxc::ast::{AstKind, Visit};

/// A replacement of `source[start..end]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Edit {
    pub start: u32,
    pub end: u32,
    pub text: String,
}

/// What aliased identifiers are rewritten to.
#[derive(Debug, Clone, Copy)]
pub(crate) enum RewriteMode<'s> {
    /// `param0`, `param1`, ... by first appearance.
    Params,
    /// `<binding>.read("<atom>")`.
    Reads { binding: &'s str },
}

/// Collects references to lifted atoms inside one statement or expression.
pub(crate) struct ReferenceCollector<'s> {
    mode: RewriteMode<'s>,
    aliases: &'s HashMap<String, String>,
    functions: &'s HashSet<String>,
    shadowed: HashSet<String>,
    handled: HashSet<u32>,
    /// Referenced atoms in first-appearance order.
    pub atoms: Vec<String>,
    pub edits: Vec<Edit>,
}

impl<'s> ReferenceCollector<'s> {
    pub fn new(
        mode: RewriteMode<'s>,
        aliases: &'s HashMap<String, String>,
        functions: &'s HashSet<String>,
    ) -> Self {
        Self {
            mode,
            aliases,
            functions,
            shadowed: HashSet::new(),
            handled: HashSet::new(),
            atoms: Vec::new(),
            edits: Vec::new(),
        }
    }

    /// Names bound locally (function parameters) that hide aliases.
    pub fn shadow<I>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        self.shadowed.extend(names);
        self
    }

    fn note(&mut self, atom: &str) -> usize {
        match self.atoms.iter().position(|a| a == atom) {
            Some(index) => index,
            None => {
                self.atoms.push(atom.to_string());
                self.atoms.len() - 1
            }
        }
    }

    fn replacement(&mut self, name: &str) -> Option<String> {
        if self.shadowed.contains(name) {
            return None;
        }
        let atom = self.aliases.get(name)?.clone();
        let index = self.note(&atom);
        Some(match self.mode {
            RewriteMode::Params => format!("param{}", index),
            RewriteMode::Reads { binding } => format!("{}.read({:?})", binding, atom),
        })
    }
}

impl<'a> Visit<'a> for ReferenceCollector<'_> {
    fn enter_node(&mut self, kind: AstKind<'a>) {
        match kind {
            AstKind::ObjectProperty(property) if property.shorthand => {
                if let Expression::Identifier(ident) = &property.value {
                    let name = ident.name.as_str();
                    if let Some(text) = self.replacement(name) {
                        self.edits.push(Edit {
                            start: property.span.start,
                            end: property.span.end,
                            text: format!("{}: {}", name, text),
                        });
                        self.handled.insert(ident.span.start);
                    }
                }
            }
            AstKind::IdentifierReference(ident) => {
                if self.handled.remove(&ident.span.start) {
                    return;
                }
                let name = ident.name.as_str();
                if let Some(text) = self.replacement(name) {
                    self.edits.push(Edit {
                        start: ident.span.start,
                        end: ident.span.end,
                        text,
                    });
                } else if self.functions.contains(name) && !self.shadowed.contains(name) {
                    self.note(name);
                }
            }
            _ => {}
        }
    }
}

/// `source[start..end]` with the edits applied. Overlapping edits after the
/// first are dropped.
pub(crate) fn splice(source: &str, start: u32, end: u32, edits: &[Edit]) -> String {
    let mut edits: Vec<&Edit> = edits
        .iter()
        .filter(|edit| edit.start >= start && edit.end <= end)
        .collect();
    edits.sort_by_key(|edit| edit.start);

    let mut out = String::with_capacity((end - start) as usize);
    let mut cursor = start as usize;
    for edit in edits {
        if (edit.start as usize) < cursor {
            continue;
        }
        out.push_str(&source[cursor..edit.start as usize]);
        out.push_str(&edit.text);
        cursor = edit.end as usize;
    }
    out.push_str(&source[cursor..end as usize]);
    out
}

/// 1-based line of a byte offset.
pub(crate) fn line_of(source: &str, offset: u32) -> u32 {
    let offset = (offset as usize).min(source.len());
    source.as_bytes()[..offset]
        .iter()
        .filter(|b| **b == b'\n')
        .count() as u32
        + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_splice_applies_sorted_edits() {
        let source = "text(a + b)";
        let edits = vec![
            Edit { start: 9, end: 10, text: "param1".into() },
            Edit { start: 5, end: 6, text: "param0".into() },
        ];
        assert_eq!(splice(source, 0, source.len() as u32, &edits), "text(param0 + param1)");
    }

    #[test]
    fn test_splice_ignores_out_of_range() {
        let source = "x; text(a)";
        let edits = vec![
            Edit { start: 0, end: 1, text: "y".into() },
            Edit { start: 8, end: 9, text: "param0".into() },
        ];
        assert_eq!(splice(source, 3, source.len() as u32, &edits), "text(param0)");
    }

    #[test]
    fn test_line_of() {
        let source = "a\nbb\nccc";
        assert_eq!(line_of(source, 0), 1);
        assert_eq!(line_of(source, 2), 2);
        assert_eq!(line_of(source, 6), 3);
        assert_eq!(line_of(source, 100), 3);
    }
}
