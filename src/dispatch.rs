//! Keyword dispatch engine.
//!
//! Every grammar is a static table from keyword to [`Rule`]: how often the
//! keyword may appear, how many arguments it takes, which section of the
//! document it belongs to, and which handler folds it into the grammar's
//! accumulator. [`run`] walks a [`Lines`] cursor through such a table,
//! enforcing the cardinality, argument and ordering rules before any
//! handler sees an item. Handlers may consume further lines (objects,
//! nested records) from the cursor.
//!
//! Nested records (router-status entries, key certificates) are parsed by
//! calling [`run`] again from a handler with the record's own table and a
//! `stop` predicate marking where the record ends.

use std::collections::HashMap;

use crate::error::DocumentParseError;
use crate::meta::block;
use crate::meta::{Item, Lines};

use strum::IntoStaticStr;
use tracing::trace;

/// How many times a keyword may appear within one run of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Cardinality {
    RequiredOnce,
    OptionalOnce,
    OptionalMany,
    /// Must be the very first item, exactly once.
    RequiredFirst,
    /// Exactly once; ends the run.
    RequiredLast,
}

impl Cardinality {
    fn is_required(self) -> bool {
        matches!(
            self,
            Cardinality::RequiredOnce | Cardinality::RequiredFirst | Cardinality::RequiredLast
        )
    }
}

/// Number of arguments (tokens after the keyword) an item must carry.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Args {
    Exactly(usize),
    AtLeast(usize),
    Any,
}

impl Args {
    fn check(self, item: &Item<'_>) -> Result<(), DocumentParseError> {
        let n = item.args.len();
        match self {
            Args::Exactly(want) if n != want => Err(item.malformed(format!(
                "expected {} tokens, found {}",
                want + 1,
                item.n_tokens()
            ))),
            Args::AtLeast(want) if n < want => Err(item.malformed(format!(
                "expected at least {} tokens, found {}",
                want + 1,
                item.n_tokens()
            ))),
            _ => Ok(()),
        }
    }
}

/// What a handler did with an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Handled {
    Stored,
    /// Recognized and validated, but deliberately not kept.
    Ignored,
}

pub(crate) type Handler<A> =
    fn(&mut A, &Item<'_>, &mut Lines<'_>) -> Result<Handled, DocumentParseError>;

/// The rule for a single keyword.
pub(crate) struct Rule<A: 'static, P: 'static> {
    pub cardinality: Cardinality,
    pub args: Args,
    pub phase: P,
    pub handler: Handler<A>,
}

/// What to do with keywords missing from a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnknownKeywords {
    Reject,
    /// Skip the item, and any object following it.
    Tolerate,
}

/// Phase for tables whose keywords may appear in any order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, IntoStaticStr)]
pub(crate) enum Unphased {
    #[strum(serialize = "document body")]
    Body,
}

/// A complete grammar (or record sub-grammar).
pub(crate) struct Table<A: 'static, P: 'static> {
    pub name: &'static str,
    pub rules: &'static phf::Map<&'static str, Rule<A, P>>,
    pub unknown: UnknownKeywords,
}

#[cfg(test)]
impl<A: 'static, P: 'static> Table<A, P> {
    /// Keywords that may appear at most once per run, besides the first
    /// and the last.
    pub(crate) fn once_keywords(&self) -> Vec<&'static str> {
        let mut keywords: Vec<&'static str> = self
            .rules
            .entries()
            .filter(|(_, r)| {
                matches!(
                    r.cardinality,
                    Cardinality::RequiredOnce | Cardinality::OptionalOnce
                )
            })
            .map(|(k, _)| *k)
            .collect();
        keywords.sort_unstable();
        keywords
    }

    /// Repeat every keyword of [`Table::once_keywords`] in `text`, one at a
    /// time, and check that each repetition is refused as a duplicate.
    /// Every such keyword must occur in `text`.
    pub(crate) fn assert_rejects_repeats<T>(
        &self,
        text: &str,
        parse: impl Fn(&str) -> Result<T, DocumentParseError>,
    ) {
        for keyword in self.once_keywords() {
            let (doubled, line) = crate::meta::repeat_item(text, keyword)
                .unwrap_or_else(|| panic!("{}: sample lacks '{}'", self.name, keyword));
            assert_eq!(
                parse(&doubled).err(),
                Some(DocumentParseError::DuplicateKeyword {
                    keyword: keyword.to_string(),
                    line,
                }),
                "{}: repeated '{}'",
                self.name,
                keyword
            );
        }
    }
}

/// Result of a successful run.
#[derive(Debug, Default)]
pub(crate) struct Summary {
    /// Keywords that were recognized but ignored, or tolerated as unknown.
    pub ignored: Vec<String>,
    /// True if a `RequiredLast` keyword ended the run.
    pub terminated: bool,
}

impl Summary {
    fn note_ignored(&mut self, keyword: &str) {
        if !self.ignored.iter().any(|k| k == keyword) {
            self.ignored.push(keyword.to_string());
        }
    }
}

/// Dispatch items from `lines` through `table` into `acc`.
///
/// The run ends at end of input, after a `RequiredLast` keyword, or right
/// before the first item whose keyword satisfies `stop` (that item is left
/// unconsumed).
pub(crate) fn run<A, P>(
    table: &Table<A, P>,
    acc: &mut A,
    lines: &mut Lines<'_>,
    stop: impl Fn(&str) -> bool,
) -> Result<Summary, DocumentParseError>
where
    P: Copy + PartialOrd + Into<&'static str>,
{
    let first = table
        .rules
        .entries()
        .find(|(_, r)| r.cardinality == Cardinality::RequiredFirst)
        .map(|(k, _)| *k);

    let mut counts: HashMap<&'static str, usize> = HashMap::new();
    let mut phase: Option<P> = None;
    let mut summary = Summary::default();
    let mut seen_any = false;

    while let Some(item) = lines.peek_item()? {
        if stop(item.keyword) {
            break;
        }
        lines.next_item()?;

        if !seen_any {
            seen_any = true;
            if let Some(first) = first {
                if item.keyword != first {
                    return Err(DocumentParseError::missing(first));
                }
            }
        }

        let (keyword, rule) = match table.rules.get_entry(item.keyword) {
            Some((k, r)) => (*k, r),
            None => match table.unknown {
                UnknownKeywords::Reject => {
                    return Err(DocumentParseError::UnrecognizedKeyword {
                        keyword: item.keyword.to_string(),
                        line: item.line,
                    })
                }
                UnknownKeywords::Tolerate => {
                    trace!(
                        keyword = item.keyword,
                        line = item.line,
                        grammar = table.name,
                        "skipping unknown keyword"
                    );
                    block::skip_any(lines)?;
                    summary.note_ignored(item.keyword);
                    continue;
                }
            },
        };

        let count = counts.entry(keyword).or_insert(0);
        *count += 1;
        if *count > 1 && rule.cardinality != Cardinality::OptionalMany {
            return Err(DocumentParseError::DuplicateKeyword {
                keyword: keyword.to_string(),
                line: item.line,
            });
        }

        rule.args.check(&item)?;

        match phase {
            Some(current) if rule.phase < current => {
                return Err(DocumentParseError::OrderingViolation {
                    keyword: keyword.to_string(),
                    phase: current.into().to_string(),
                    line: item.line,
                });
            }
            _ => phase = Some(rule.phase),
        }

        if (rule.handler)(acc, &item, lines)? == Handled::Ignored {
            trace!(keyword, line = item.line, grammar = table.name, "ignoring item");
            summary.note_ignored(keyword);
        }

        if rule.cardinality == Cardinality::RequiredLast {
            summary.terminated = true;
            break;
        }
    }

    for (keyword, rule) in table.rules.entries() {
        if !rule.cardinality.is_required() || counts.contains_key(keyword) {
            continue;
        }
        if rule.cardinality == Cardinality::RequiredLast && lines.is_exhausted() {
            return Err(DocumentParseError::UnexpectedEndOfDocument {
                context: table.name.to_string(),
            });
        }
        return Err(DocumentParseError::missing(*keyword));
    }

    Ok(summary)
}
