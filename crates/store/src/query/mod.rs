//! Queries over column values.
//!
//! A [`Query`] is a conjunction of [`Condition`]s with an optional
//! [`Order`] and pagination. Execution (see [`exec`]) narrows candidates
//! through secondary indexes where one serves a condition, then fetches
//! every candidate and checks all conditions against the stored record, so
//! index lookups only ever need to return a superset.

pub mod exec;

use std::fmt;

use regex::bytes::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    columns::Columns,
    error::{Error, Result},
    index::keys::{operand_tokens, parse_decimal, tokens},
};

/// Condition operators. Operand lists are separated by spaces or commas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Op {
    /// Value equals the operand.
    StrEq,
    /// Value contains the operand.
    StrIncludes,
    /// Value starts with the operand.
    StrBeginsWith,
    /// Value ends with the operand.
    StrEndsWith,
    /// `lo <= value <= hi` byte-wise, operand `"lo hi"`.
    StrBetween,
    /// Value tokens include every operand token.
    StrAllTokens,
    /// Value tokens include at least one operand token.
    StrAnyToken,
    /// Value equals one of the operand tokens.
    StrOneOf,
    /// Value matches the operand as a regular expression.
    StrRegex,
    /// Numerically equal.
    NumEq,
    /// Numerically greater.
    NumGt,
    /// Numerically greater or equal.
    NumGe,
    /// Numerically less.
    NumLt,
    /// Numerically less or equal.
    NumLe,
    /// `lo <= value <= hi` numerically.
    NumBetween,
    /// Numerically equal to one of the operands.
    NumOneOf,
    /// Value contains the operand phrase.
    FtsPhrase,
    /// Value contains every operand word.
    FtsAllTokens,
    /// Value contains at least one operand word.
    FtsAnyToken,
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Smallest first.
    Ascending,
    /// Largest first.
    Descending,
}

/// How order values compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Domain {
    /// Byte-wise.
    String,
    /// As decimal numbers.
    Numeric,
}

/// How several result sets combine in a meta search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SetOperation {
    /// Keys in any result.
    Union,
    /// Keys in every result.
    Intersection,
    /// Keys in the first result and no other.
    Difference,
}

/// One column condition.
#[derive(Debug, Clone)]
pub struct Condition {
    pub(crate) column: String,
    pub(crate) op: Op,
    pub(crate) operand: Vec<u8>,
    pub(crate) negate: bool,
    pub(crate) no_index: bool,
}

impl Condition {
    /// A condition on `column`; the empty name addresses the primary key.
    pub fn new(column: impl Into<String>, op: Op, operand: impl AsRef<[u8]>) -> Self {
        Self {
            column: column.into(),
            op,
            operand: operand.as_ref().to_vec(),
            negate: false,
            no_index: false,
        }
    }

    /// Inverts the result.
    #[must_use]
    pub fn negate(mut self) -> Self {
        self.negate = true;
        self
    }

    /// Forbids answering this condition from an index.
    #[must_use]
    pub fn no_index(mut self) -> Self {
        self.no_index = true;
        self
    }

    /// The column the condition applies to.
    pub fn column(&self) -> &str {
        &self.column
    }

    /// The operator.
    pub fn op(&self) -> Op {
        self.op
    }
}

/// Result ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    /// Column whose value orders the results; empty for the primary key.
    pub column: String,
    /// Sort direction.
    pub direction: Direction,
    /// Comparison domain.
    pub domain: Domain,
}

/// A query: conditions, ordering and pagination.
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub(crate) conditions: Vec<Condition>,
    pub(crate) order: Option<Order>,
    pub(crate) limit: Option<usize>,
    pub(crate) offset: usize,
}

impl Query {
    /// A query matching every record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a condition.
    #[must_use]
    pub fn filter(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Adds `column op operand`.
    #[must_use]
    pub fn condition(self, column: &str, op: Op, operand: impl AsRef<[u8]>) -> Self {
        self.filter(Condition::new(column, op, operand))
    }

    /// Orders the results.
    #[must_use]
    pub fn order(mut self, column: &str, direction: Direction, domain: Domain) -> Self {
        self.order = Some(Order { column: column.to_string(), direction, domain });
        self
    }

    /// Paginates the results. A negative limit means no limit and a negative
    /// offset means zero.
    #[must_use]
    pub fn limit(mut self, limit: i64, offset: i64) -> Self {
        self.limit = usize::try_from(limit).ok();
        self.offset = usize::try_from(offset).unwrap_or(0);
        self
    }

    /// The conditions, in insertion order.
    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    fn paginate(&self, keys: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
        let limit = self.limit.unwrap_or(usize::MAX);
        keys.into_iter().skip(self.offset).take(limit).collect()
    }
}

/// How one condition was answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Access {
    /// Candidates came from the column's index.
    Index(crate::index::IndexKind),
    /// Candidates came from primary key lookups.
    PrimaryKey,
    /// Checked against fetched records only.
    Filter,
}

/// How a query was executed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryPlan {
    /// Per condition, in query order: the column and how it was answered.
    pub steps: Vec<(String, Access)>,
    /// True when every record had to be scanned.
    pub full_scan: bool,
    /// True when the result order came from an index.
    pub ordered_by_index: bool,
    /// Number of candidate records checked.
    pub candidates: usize,
}

impl fmt::Display for QueryPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (column, access) in &self.steps {
            let column = if column.is_empty() { "<primary key>" } else { column.as_str() };
            match access {
                Access::Index(kind) => writeln!(f, "using {kind:?} index on {column:?}")?,
                Access::PrimaryKey => writeln!(f, "using primary key lookup")?,
                Access::Filter => writeln!(f, "filtering {column:?}")?,
            }
        }
        if self.full_scan {
            writeln!(f, "scanning the whole table")?;
        }
        if self.ordered_by_index {
            writeln!(f, "ordered by index")?;
        }
        write!(f, "{} candidates", self.candidates)
    }
}

/// A condition ready for evaluation.
pub(crate) struct Compiled<'a> {
    pub(crate) condition: &'a Condition,
    regex: Option<Regex>,
}

impl<'a> Compiled<'a> {
    pub(crate) fn new(condition: &'a Condition) -> Result<Self> {
        let regex = match condition.op {
            Op::StrRegex => {
                let pattern = std::str::from_utf8(&condition.operand)
                    .map_err(|_| Error::invalid("regular expression is not UTF-8"))?;
                Some(Regex::new(pattern).map_err(|e| Error::invalid(e.to_string()))?)
            },
            _ => None,
        };
        Ok(Self { condition, regex })
    }

    /// Evaluates the condition on a record.
    pub(crate) fn matches(&self, primary_key: &[u8], columns: &Columns) -> bool {
        let value = if self.condition.column.is_empty() {
            Some(primary_key)
        } else {
            columns.get(&self.condition.column).map(Vec::as_slice)
        };
        match value {
            Some(value) => self.matches_value(value) != self.condition.negate,
            None => self.condition.negate,
        }
    }

    fn matches_value(&self, value: &[u8]) -> bool {
        let operand = self.condition.operand.as_slice();
        match self.condition.op {
            Op::StrEq => value == operand,
            Op::StrIncludes | Op::FtsPhrase => contains(value, operand),
            Op::StrBeginsWith => value.starts_with(operand),
            Op::StrEndsWith => value.ends_with(operand),
            Op::StrBetween => {
                let bounds = operand_tokens(operand);
                match bounds.as_slice() {
                    [] => false,
                    [lo] => value >= lo.as_slice(),
                    [lo, hi, ..] => value >= lo.as_slice() && value <= hi.as_slice(),
                }
            },
            Op::StrAllTokens => {
                let wanted = operand_tokens(operand);
                let have = tokens(value);
                !wanted.is_empty() && wanted.iter().all(|token| have.contains(token))
            },
            Op::StrAnyToken => {
                let have = tokens(value);
                operand_tokens(operand).iter().any(|token| have.contains(token))
            },
            Op::StrOneOf => operand_tokens(operand).iter().any(|token| token == value),
            Op::StrRegex => self.regex.as_ref().is_some_and(|regex| regex.is_match(value)),
            Op::NumEq => parse_decimal(value) == parse_decimal(operand),
            Op::NumGt => parse_decimal(value) > parse_decimal(operand),
            Op::NumGe => parse_decimal(value) >= parse_decimal(operand),
            Op::NumLt => parse_decimal(value) < parse_decimal(operand),
            Op::NumLe => parse_decimal(value) <= parse_decimal(operand),
            Op::NumBetween => {
                let number = parse_decimal(value);
                let bounds = operand_tokens(operand);
                match bounds.as_slice() {
                    [] => false,
                    [lo] => number >= parse_decimal(lo),
                    [lo, hi, ..] => number >= parse_decimal(lo) && number <= parse_decimal(hi),
                }
            },
            Op::NumOneOf => {
                let number = parse_decimal(value);
                operand_tokens(operand).iter().any(|token| parse_decimal(token) == number)
            },
            Op::FtsAllTokens => {
                let words = operand_tokens(operand);
                !words.is_empty() && words.iter().all(|word| contains(value, word))
            },
            Op::FtsAnyToken => operand_tokens(operand).iter().any(|word| contains(value, word)),
        }
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|window| window == needle)
}
