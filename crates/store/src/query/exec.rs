//! Query planning and execution.
//!
//! Each indexable condition becomes a union of intersections of index key
//! ranges. The candidate sets of all indexable conditions are intersected,
//! smallest first; with none the whole table is scanned. Every candidate is
//! then fetched and checked against all conditions before ordering and
//! pagination.

use std::collections::{BTreeSet, HashSet};

use tracing::debug;

use super::{
    Access, Compiled, Condition, Direction, Domain, Op, Order, Query, QueryPlan, SetOperation,
};
use crate::{
    backend::StorageBackend,
    btree::{Bound, Range, prefix_successor},
    columns::Columns,
    error::Result,
    index::{
        Index, IndexKind,
        keys::{
            decimal_key, escape, needle_bigrams, operand_tokens, parse_decimal, terminated,
            truncate,
        },
    },
};

/// Read access to one secondary index.
pub trait IndexLookup {
    /// The index kind.
    fn kind(&self) -> IndexKind;

    /// Primary keys of the entries inside `range`.
    ///
    /// # Errors
    ///
    /// Returns a page error.
    fn primary_keys(&self, range: Range) -> Result<BTreeSet<Vec<u8>>>;

    /// Primary keys in index order.
    ///
    /// # Errors
    ///
    /// Returns a page error.
    fn ordered_keys(&self) -> Result<Vec<Vec<u8>>>;

    /// True when index order equals value order.
    fn is_exact(&self) -> bool;
}

impl<B: StorageBackend> IndexLookup for Index<B> {
    fn kind(&self) -> IndexKind {
        Index::kind(self)
    }

    fn primary_keys(&self, range: Range) -> Result<BTreeSet<Vec<u8>>> {
        Index::primary_keys(self, range)
    }

    fn ordered_keys(&self) -> Result<Vec<Vec<u8>>> {
        Index::ordered_keys(self)
    }

    fn is_exact(&self) -> bool {
        Index::is_exact(self)
    }
}

/// What a query runs against.
pub trait RecordSource {
    /// Reads one record.
    ///
    /// # Errors
    ///
    /// Returns a storage or codec error.
    fn fetch(&self, primary_key: &[u8]) -> Result<Option<Columns>>;

    /// Visits every record until `f` returns false.
    ///
    /// # Errors
    ///
    /// Returns a storage or codec error, or the first error from `f`.
    fn for_each(&self, f: &mut dyn FnMut(Vec<u8>, Columns) -> Result<bool>) -> Result<()>;

    /// Primary keys starting with `prefix`.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    fn keys_with_prefix(&self, prefix: &[u8]) -> Result<BTreeSet<Vec<u8>>>;

    /// The index on `column`, if any.
    fn index(&self, column: &str) -> Option<&dyn IndexLookup>;
}

/// A matching record and its order value.
type Matched = (Vec<u8>, Option<Vec<u8>>);

/// Runs `query`, returning the matching primary keys and the plan used.
///
/// # Errors
///
/// Returns [`Error::InvalidOperation`](crate::Error::InvalidOperation) for an
/// invalid regular expression, or any storage error. No partial result is
/// returned.
pub fn search(source: &dyn RecordSource, query: &Query) -> Result<(Vec<Vec<u8>>, QueryPlan)> {
    let mut plan = QueryPlan::default();
    let order_column = query.order.as_ref().map(|order| order.column.as_str());
    let matched = evaluate(source, &query.conditions, order_column, &mut plan)?;
    let keys = match &query.order {
        Some(order) => apply_order(source, order, matched, &mut plan)?,
        None => matched.into_iter().map(|(key, _)| key).collect(),
    };
    debug!(plan = %plan, results = keys.len(), "Executed query");
    Ok((query.paginate(keys), plan))
}

/// Combines the results of several queries. The first query's order and
/// pagination apply to the combined result; the others' are ignored.
///
/// # Errors
///
/// Returns the first error from any query.
pub fn meta_search(
    source: &dyn RecordSource,
    queries: &[Query],
    operation: SetOperation,
) -> Result<Vec<Vec<u8>>> {
    let Some((first, rest)) = queries.split_first() else {
        return Ok(Vec::new());
    };
    let order_column = first.order.as_ref().map(|order| order.column.as_str());
    let mut plan = QueryPlan::default();
    let mut combined = evaluate(source, &first.conditions, order_column, &mut plan)?;

    for query in rest {
        let others = evaluate(source, &query.conditions, order_column, &mut plan)?;
        match operation {
            SetOperation::Union => {
                let mut seen: HashSet<Vec<u8>> =
                    combined.iter().map(|(key, _)| key.clone()).collect();
                combined.extend(others.into_iter().filter(|(key, _)| seen.insert(key.clone())));
            },
            SetOperation::Intersection => {
                let keep: HashSet<Vec<u8>> = others.into_iter().map(|(key, _)| key).collect();
                combined.retain(|(key, _)| keep.contains(key));
            },
            SetOperation::Difference => {
                let drop: HashSet<Vec<u8>> = others.into_iter().map(|(key, _)| key).collect();
                combined.retain(|(key, _)| !drop.contains(key));
            },
        }
    }

    let keys = match &first.order {
        Some(order) => apply_order(source, order, combined, &mut plan)?,
        None => combined.into_iter().map(|(key, _)| key).collect(),
    };
    Ok(first.paginate(keys))
}

fn evaluate(
    source: &dyn RecordSource,
    conditions: &[Condition],
    order_column: Option<&str>,
    plan: &mut QueryPlan,
) -> Result<Vec<Matched>> {
    let compiled = conditions.iter().map(Compiled::new).collect::<Result<Vec<_>>>()?;

    let mut candidate_sets = Vec::new();
    for condition in conditions {
        match candidates(source, condition)? {
            Some((keys, access)) => {
                plan.steps.push((condition.column.clone(), access));
                candidate_sets.push(keys);
            },
            None => plan.steps.push((condition.column.clone(), Access::Filter)),
        }
    }

    let order_value = |key: &[u8], columns: &Columns| match order_column {
        Some("") => Some(key.to_vec()),
        Some(column) => columns.get(column).cloned(),
        None => None,
    };
    let mut matched = Vec::new();

    if candidate_sets.is_empty() {
        plan.full_scan = true;
        source.for_each(&mut |key: Vec<u8>, columns: Columns| {
            plan.candidates += 1;
            if compiled.iter().all(|c| c.matches(&key, &columns)) {
                let value = order_value(&key, &columns);
                matched.push((key, value));
            }
            Ok(true)
        })?;
        return Ok(matched);
    }

    candidate_sets.sort_by_key(BTreeSet::len);
    let mut sets = candidate_sets.into_iter();
    let mut keys = sets.next().unwrap_or_default();
    for set in sets {
        if keys.is_empty() {
            break;
        }
        keys.retain(|key| set.contains(key));
    }

    plan.candidates += keys.len();
    for key in keys {
        let Some(columns) = source.fetch(&key)? else {
            continue;
        };
        if compiled.iter().all(|c| c.matches(&key, &columns)) {
            let value = order_value(&key, &columns);
            matched.push((key, value));
        }
    }
    Ok(matched)
}

/// Candidate keys for one condition, or `None` when no index serves it.
fn candidates(
    source: &dyn RecordSource,
    condition: &Condition,
) -> Result<Option<(BTreeSet<Vec<u8>>, Access)>> {
    if condition.negate || condition.no_index {
        return Ok(None);
    }
    if condition.column.is_empty() {
        let keys = match condition.op {
            Op::StrEq => BTreeSet::from([condition.operand.clone()]),
            Op::StrOneOf => operand_tokens(&condition.operand).into_iter().collect(),
            Op::StrBeginsWith => source.keys_with_prefix(&condition.operand)?,
            _ => return Ok(None),
        };
        return Ok(Some((keys, Access::PrimaryKey)));
    }
    let Some(index) = source.index(&condition.column) else {
        return Ok(None);
    };
    let Some(groups) = index_ranges(index.kind(), condition.op, &condition.operand) else {
        return Ok(None);
    };

    let mut keys = BTreeSet::new();
    for group in groups {
        let mut ranges = group.into_iter();
        let Some(first) = ranges.next() else {
            continue;
        };
        let mut hits = index.primary_keys(first)?;
        for range in ranges {
            if hits.is_empty() {
                break;
            }
            let more = index.primary_keys(range)?;
            hits.retain(|key| more.contains(key));
        }
        keys.append(&mut hits);
    }
    Ok(Some((keys, Access::Index(index.kind()))))
}

/// Index ranges serving `op`, as a union of intersections, or `None` when the
/// kind does not serve the operator. An empty outer list matches nothing.
fn index_ranges(kind: IndexKind, op: Op, operand: &[u8]) -> Option<Vec<Vec<Range>>> {
    let tokens = || operand_tokens(operand);
    match (kind, op) {
        (IndexKind::Lexical, Op::StrEq) => {
            Some(vec![vec![Range::prefix(&terminated(truncate(operand)))]])
        },
        (IndexKind::Lexical, Op::StrBeginsWith) => {
            Some(vec![vec![Range::prefix(&escape(truncate(operand)))]])
        },
        (IndexKind::Lexical, Op::StrBetween) => {
            let bounds = tokens();
            let range = match bounds.as_slice() {
                [] => return Some(Vec::new()),
                [lo] => Range::from(&escape(truncate(lo))),
                [lo, hi, ..] => Range {
                    start: Bound::Included(escape(truncate(lo))),
                    end: upper_bound(&terminated(truncate(hi))),
                },
            };
            Some(vec![vec![range]])
        },
        (IndexKind::Lexical, Op::StrOneOf) => Some(
            tokens()
                .iter()
                .map(|token| vec![Range::prefix(&terminated(truncate(token)))])
                .collect(),
        ),
        (IndexKind::Decimal, _) => decimal_ranges(op, operand),
        (IndexKind::Token, Op::StrAllTokens) => {
            let ranges: Vec<Range> = tokens()
                .iter()
                .map(|token| Range::prefix(&terminated(truncate(token))))
                .collect();
            Some(if ranges.is_empty() { Vec::new() } else { vec![ranges] })
        },
        (IndexKind::Token, Op::StrAnyToken) => Some(
            tokens()
                .iter()
                .map(|token| vec![Range::prefix(&terminated(truncate(token)))])
                .collect(),
        ),
        (IndexKind::QGram, Op::StrIncludes | Op::StrBeginsWith | Op::FtsPhrase) => {
            Some(vec![qgram_ranges(operand, false)?])
        },
        (IndexKind::QGram, Op::StrEndsWith | Op::StrEq) => Some(vec![qgram_ranges(operand, true)?]),
        (IndexKind::QGram, Op::FtsAllTokens) => {
            let mut group = Vec::new();
            for word in tokens() {
                group.extend(qgram_ranges(&word, false)?);
            }
            Some(if group.is_empty() { Vec::new() } else { vec![group] })
        },
        (IndexKind::QGram, Op::FtsAnyToken) => {
            tokens().iter().map(|word| qgram_ranges(word, false)).collect()
        },
        _ => None,
    }
}

fn decimal_ranges(op: Op, operand: &[u8]) -> Option<Vec<Vec<Range>>> {
    let key = |text: &[u8]| decimal_key(parse_decimal(text)).to_vec();
    let at_least = |text: &[u8]| Bound::Included(key(text));
    let at_most = |text: &[u8]| upper_bound(&key(text));
    let range = match op {
        Op::NumEq => Range::prefix(&key(operand)),
        Op::NumGt => match prefix_successor(&key(operand)) {
            Some(next) => Range::from(&next),
            None => return Some(Vec::new()),
        },
        Op::NumGe => Range { start: at_least(operand), end: Bound::Unbounded },
        Op::NumLt => Range { start: Bound::Unbounded, end: Bound::Excluded(key(operand)) },
        Op::NumLe => Range { start: Bound::Unbounded, end: at_most(operand) },
        Op::NumBetween => match operand_tokens(operand).as_slice() {
            [] => return Some(Vec::new()),
            [lo] => Range { start: at_least(lo), end: Bound::Unbounded },
            [lo, hi, ..] => Range { start: at_least(lo), end: at_most(hi) },
        },
        Op::NumOneOf => {
            let groups = operand_tokens(operand)
                .iter()
                .map(|token| vec![Range::prefix(&key(token))])
                .collect();
            return Some(groups);
        },
        _ => return None,
    };
    Some(vec![vec![range]])
}

/// Exclusive end just past every entry whose derived key is `derived`.
fn upper_bound(derived: &[u8]) -> Bound {
    match prefix_successor(derived) {
        Some(next) => Bound::Excluded(next),
        None => Bound::Unbounded,
    }
}

/// Shingle ranges a value containing `needle` must hit, or `None` when the
/// needle cannot be looked up (empty or not UTF-8). With `anchored_end` the
/// value must also end with the needle's last character.
fn qgram_ranges(needle: &[u8], anchored_end: bool) -> Option<Vec<Range>> {
    let text = std::str::from_utf8(needle).ok().filter(|text| !text.is_empty())?;
    let mut chars = text.chars();
    let first = chars.next()?;
    let mut ranges: Vec<Range> = if chars.next().is_some() {
        needle_bigrams(text).iter().map(|gram| Range::prefix(&terminated(gram))).collect()
    } else {
        vec![Range::prefix(&escape(first.to_string().as_bytes()))]
    };
    if anchored_end {
        if let Some(last) = text.chars().next_back() {
            ranges.push(Range::prefix(&terminated(last.to_string().as_bytes())));
        }
    }
    Some(ranges)
}

fn apply_order(
    source: &dyn RecordSource,
    order: &Order,
    matched: Vec<Matched>,
    plan: &mut QueryPlan,
) -> Result<Vec<Vec<u8>>> {
    let (mut present, mut absent): (Vec<Matched>, Vec<Matched>) =
        matched.into_iter().partition(|(_, value)| value.is_some());
    absent.sort_by(|a, b| a.0.cmp(&b.0));

    let from_index = if order.column.is_empty() {
        None
    } else {
        source.index(&order.column).filter(|index| {
            index.is_exact()
                && matches!(
                    (order.domain, index.kind()),
                    (Domain::String, IndexKind::Lexical) | (Domain::Numeric, IndexKind::Decimal)
                )
        })
    };

    let mut ordered = None;
    if let Some(index) = from_index {
        let wanted: HashSet<&[u8]> = present.iter().map(|(key, _)| key.as_slice()).collect();
        let keys: Vec<Vec<u8>> = index
            .ordered_keys()?
            .into_iter()
            .filter(|key| wanted.contains(key.as_slice()))
            .collect();
        // A stale index falls back to sorting.
        if keys.len() == wanted.len() {
            plan.ordered_by_index = true;
            ordered = Some(keys);
        }
    }
    let mut keys = match ordered {
        Some(keys) => keys,
        None => {
            let sort_key = |value: &[u8]| match order.domain {
                Domain::String => value.to_vec(),
                Domain::Numeric => decimal_key(parse_decimal(value)).to_vec(),
            };
            present.sort_by_cached_key(|(key, value)| {
                (value.as_deref().map(&sort_key).unwrap_or_default(), key.clone())
            });
            present.into_iter().map(|(key, _)| key).collect()
        },
    };
    if order.direction == Direction::Descending {
        keys.reverse();
    }
    keys.extend(absent.into_iter().map(|(key, _)| key));
    Ok(keys)
}
