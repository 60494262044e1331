//! Local re-aggregation of raw tuples.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{group_by_re, projection_span, select_modifier_re, split_solution_modifiers, variable_re};
use crate::query::RawResult;
use crate::value::{Row, Scalar};

static NULL: Scalar = Scalar::Null;

static_regex!(
    projection_item_re,
    r"(?i)\(\s*(COUNT|SUM|AVG|MIN|MAX)\s*\(\s*(DISTINCT\s+)?([?$]\w+|\*)\s*\)\s+AS\s+[?$](\w+)\s*\)|\b(COUNT|SUM|AVG|MIN|MAX)\s*\(\s*(DISTINCT\s+)?([?$]\w+|\*)\s*\)|[?$](\w+)"
);
static_regex!(
    order_key_re,
    r"(?i)(?:(ASC|DESC)\s*\(\s*)?(?:(COUNT|SUM|AVG|MIN|MAX)\s*\(\s*(DISTINCT\s+)?([?$]\w+|\*)\s*\)|[?$](\w+))"
);
static_regex!(order_by_re, r"(?is)\bORDER\s+BY\s+(.*?)(?:\bLIMIT\b|\bOFFSET\b|$)");
static_regex!(having_re, r"(?i)\bHAVING\b");
static_regex!(limit_re, r"(?i)\bLIMIT\s+(\d+)");
static_regex!(offset_re, r"(?i)\bOFFSET\s+(\d+)");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AggregateFunction {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateFunction {
    fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "COUNT" => Some(Self::Count),
            "SUM" => Some(Self::Sum),
            "AVG" => Some(Self::Avg),
            "MIN" => Some(Self::Min),
            "MAX" => Some(Self::Max),
            _ => None,
        }
    }
}

impl fmt::Display for AggregateFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Count => "COUNT",
            Self::Sum => "SUM",
            Self::Avg => "AVG",
            Self::Min => "MIN",
            Self::Max => "MAX",
        };
        f.write_str(name)
    }
}

/// One aggregate in the projection, e.g. `(COUNT(DISTINCT ?x) AS ?n)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateTerm {
    pub function: AggregateFunction,
    pub distinct: bool,
    /// Aggregated variable without sigil; `None` for `*`
    pub input: Option<String>,
    /// Output column name without sigil
    pub alias: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProjectionItem {
    Group(String),
    Aggregate(AggregateTerm),
}

impl ProjectionItem {
    pub fn column(&self) -> &str {
        match self {
            ProjectionItem::Group(name) => name,
            ProjectionItem::Aggregate(term) => &term.alias,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderKey {
    /// Output column the key refers to
    pub column: String,
    pub descending: bool,
}

/// What an aggregate query asked for, recovered from its text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationPlan {
    /// Projection in original order
    pub projection: Vec<ProjectionItem>,
    pub group_by: Vec<String>,
    pub order_by: Vec<OrderKey>,
    pub having: bool,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

fn term_from(function: &str, distinct: bool, input: &str, alias: Option<&str>) -> Option<AggregateTerm> {
    let function = AggregateFunction::parse(function)?;
    let input = match input {
        "*" => None,
        var => Some(var.trim_start_matches(['?', '$']).to_string()),
    };
    let alias = alias.map_or_else(|| function.to_string().to_lowercase(), str::to_string);
    Some(AggregateTerm {
        function,
        distinct,
        input,
        alias,
    })
}

impl AggregationPlan {
    /// Recover the plan of an aggregate query. `None` when the projection
    /// holds no aggregate this module understands, or holds any expression
    /// other than plain variables and simple aggregates.
    pub fn parse(query_text: &str) -> Option<Self> {
        let (body, tail) = split_solution_modifiers(query_text);
        let (start, end) = projection_span(body)?;
        let projection_text = select_modifier_re().replace(&body[start..end], "");

        let mut projection = Vec::new();
        let mut covered = 0;
        for caps in projection_item_re().captures_iter(&projection_text) {
            // Anything between recognised items (SAMPLE, arithmetic, nested
            // calls) cannot be recomputed locally
            let whole = caps.get(0)?;
            if !projection_text[covered..whole.start()].trim().is_empty() {
                return None;
            }
            covered = whole.end();

            let item = if let Some(function) = caps.get(1) {
                ProjectionItem::Aggregate(term_from(
                    function.as_str(),
                    caps.get(2).is_some(),
                    &caps[3],
                    caps.get(4).map(|m| m.as_str()),
                )?)
            } else if let Some(function) = caps.get(5) {
                ProjectionItem::Aggregate(term_from(
                    function.as_str(),
                    caps.get(6).is_some(),
                    &caps[7],
                    None,
                )?)
            } else {
                ProjectionItem::Group(caps[8].to_string())
            };
            projection.push(item);
        }
        if !projection_text[covered..].trim().is_empty() {
            return None;
        }
        if !projection
            .iter()
            .any(|item| matches!(item, ProjectionItem::Aggregate(_)))
        {
            return None;
        }

        let group_by: Vec<String> = match group_by_re().captures(tail).and_then(|c| c.get(1)) {
            Some(m) => variable_re()
                .captures_iter(m.as_str())
                .map(|c| c[1].to_string())
                .collect(),
            None => projection
                .iter()
                .filter_map(|item| match item {
                    ProjectionItem::Group(name) => Some(name.clone()),
                    ProjectionItem::Aggregate(_) => None,
                })
                .collect(),
        };

        let order_by = order_by_re()
            .captures(tail)
            .and_then(|c| c.get(1))
            .map(|m| parse_order_keys(m.as_str(), &projection))
            .unwrap_or_default();

        Some(AggregationPlan {
            projection,
            group_by,
            order_by,
            having: having_re().is_match(tail),
            limit: capture_number(limit_re(), tail),
            offset: capture_number(offset_re(), tail),
        })
    }

    pub fn aggregates(&self) -> impl Iterator<Item = &AggregateTerm> {
        self.projection.iter().filter_map(|item| match item {
            ProjectionItem::Aggregate(term) => Some(term),
            ProjectionItem::Group(_) => None,
        })
    }

    pub fn output_columns(&self) -> Vec<String> {
        self.projection
            .iter()
            .map(|item| item.column().to_string())
            .collect()
    }

    /// Group raw tuples and compute the aggregates locally.
    ///
    /// Deterministic: the same plan and the same multiset of raw rows always
    /// produce the same result, whatever order the rows arrive in.
    pub fn aggregate(&self, raw: &RawResult) -> RawResult {
        if self.having {
            warn!("HAVING is not re-applied by local aggregation; returning all groups");
        }

        let group_idx: Vec<Option<usize>> =
            self.group_by.iter().map(|g| raw.column_index(g)).collect();
        let terms: Vec<&AggregateTerm> = self.aggregates().collect();
        let input_idx: Vec<Option<usize>> = terms
            .iter()
            .map(|t| t.input.as_deref().and_then(|v| raw.column_index(v)))
            .collect();

        let mut index: HashMap<String, usize> = HashMap::new();
        let mut groups: Vec<(Row, Vec<Accumulator>)> = Vec::new();

        for row in &raw.rows {
            let key_values: Row = group_idx
                .iter()
                .map(|i| i.and_then(|i| row.get(i)).cloned().unwrap_or(Scalar::Null))
                .collect();
            let key = group_key(&key_values);
            let slot = *index.entry(key).or_insert_with(|| {
                groups.push((key_values, terms.iter().map(|_| Accumulator::default()).collect()));
                groups.len() - 1
            });
            let accumulators = &mut groups[slot].1;
            for (n, term) in terms.iter().enumerate() {
                let value = match (&term.input, input_idx[n]) {
                    (None, _) => None,
                    (Some(_), Some(i)) => row.get(i),
                    (Some(_), None) => Some(&NULL),
                };
                accumulators[n].add(term, value, row);
            }
        }

        // Aggregating without groups always yields exactly one row
        if groups.is_empty() && self.group_by.is_empty() {
            groups.push((Vec::new(), terms.iter().map(|_| Accumulator::default()).collect()));
        }

        let mut output: Vec<(Row, Row)> = groups
            .into_iter()
            .map(|(key_values, accumulators)| {
                let mut aggregates = accumulators
                    .into_iter()
                    .zip(&terms)
                    .map(|(acc, term)| acc.finish(term.function));
                let row = self
                    .projection
                    .iter()
                    .map(|item| match item {
                        ProjectionItem::Group(name) => self
                            .group_by
                            .iter()
                            .position(|g| g == name)
                            .and_then(|i| key_values.get(i).cloned())
                            .unwrap_or(Scalar::Null),
                        ProjectionItem::Aggregate(_) => aggregates.next().unwrap_or(Scalar::Null),
                    })
                    .collect();
                (row, key_values)
            })
            .collect();

        let columns = self.output_columns();
        let order: Vec<(usize, bool)> = self
            .order_by
            .iter()
            .filter_map(|key| {
                columns
                    .iter()
                    .position(|c| *c == key.column)
                    .map(|i| (i, key.descending))
            })
            .collect();

        output.sort_by(|(a_row, a_key), (b_row, b_key)| {
            for &(i, descending) in &order {
                let ord = a_row[i].total_cmp(&b_row[i]);
                let ord = if descending { ord.reverse() } else { ord };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            compare_rows(a_key, b_key)
        });

        let rows = output
            .into_iter()
            .map(|(row, _)| row)
            .skip(self.offset.unwrap_or(0))
            .take(self.limit.unwrap_or(usize::MAX))
            .collect();

        RawResult::new(columns, rows)
    }
}

fn parse_order_keys(text: &str, projection: &[ProjectionItem]) -> Vec<OrderKey> {
    order_key_re()
        .captures_iter(text)
        .filter_map(|caps| {
            let descending = caps
                .get(1)
                .is_some_and(|d| d.as_str().eq_ignore_ascii_case("DESC"));
            let column = if let Some(function) = caps.get(2) {
                // An aggregate expression orders by the projected alias computing it
                let wanted = term_from(function.as_str(), caps.get(3).is_some(), &caps[4], None)?;
                projection.iter().find_map(|item| match item {
                    ProjectionItem::Aggregate(t)
                        if t.function == wanted.function
                            && t.distinct == wanted.distinct
                            && t.input == wanted.input =>
                    {
                        Some(t.alias.clone())
                    }
                    _ => None,
                })?
            } else {
                caps[5].to_string()
            };
            Some(OrderKey { column, descending })
        })
        .collect()
}

fn capture_number(re: &Regex, text: &str) -> Option<usize> {
    re.captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

fn group_key(values: &[Scalar]) -> String {
    values
        .iter()
        .map(Scalar::key)
        .collect::<Vec<_>>()
        .join("\u{1f}")
}

fn compare_rows(a: &[Scalar], b: &[Scalar]) -> Ordering {
    a.iter()
        .zip(b)
        .map(|(x, y)| x.total_cmp(y))
        .find(|o| *o != Ordering::Equal)
        .unwrap_or_else(|| a.len().cmp(&b.len()))
}

/// Running state of one aggregate within one group.
#[derive(Debug, Default)]
struct Accumulator {
    count: u64,
    seen: HashSet<String>,
    int_sum: i64,
    float_sum: f64,
    all_int: bool,
    numeric: u64,
    min: Option<Scalar>,
    max: Option<Scalar>,
}

impl Accumulator {
    fn add(&mut self, term: &AggregateTerm, value: Option<&Scalar>, row: &Row) {
        let Some(value) = value else {
            // COUNT(*)
            if term.distinct && !self.seen.insert(group_key(row)) {
                return;
            }
            self.count += 1;
            return;
        };
        if value.is_null() {
            return;
        }
        if term.distinct && !self.seen.insert(value.key()) {
            return;
        }
        self.count += 1;

        match term.function {
            AggregateFunction::Count => {}
            AggregateFunction::Sum | AggregateFunction::Avg => {
                if self.numeric == 0 {
                    self.all_int = true;
                }
                match value {
                    Scalar::Int(i) => {
                        self.float_sum += *i as f64;
                        match self.int_sum.checked_add(*i) {
                            Some(sum) => self.int_sum = sum,
                            None => self.all_int = false,
                        }
                    }
                    other => match other.as_f64() {
                        Some(f) => {
                            self.float_sum += f;
                            self.all_int = false;
                        }
                        None => return,
                    },
                }
                self.numeric += 1;
            }
            AggregateFunction::Min => {
                if self
                    .min
                    .as_ref()
                    .map_or(true, |m| value.total_cmp(m) == Ordering::Less)
                {
                    self.min = Some(value.clone());
                }
            }
            AggregateFunction::Max => {
                if self
                    .max
                    .as_ref()
                    .map_or(true, |m| value.total_cmp(m) == Ordering::Greater)
                {
                    self.max = Some(value.clone());
                }
            }
        }
    }

    fn finish(self, function: AggregateFunction) -> Scalar {
        match function {
            AggregateFunction::Count => Scalar::Int(i64::try_from(self.count).unwrap_or(i64::MAX)),
            AggregateFunction::Sum => {
                if self.numeric == 0 {
                    Scalar::Int(0)
                } else if self.all_int {
                    Scalar::Int(self.int_sum)
                } else {
                    Scalar::Float(self.float_sum)
                }
            }
            AggregateFunction::Avg => {
                if self.numeric == 0 {
                    Scalar::Int(0)
                } else {
                    Scalar::Float(self.float_sum / self.numeric as f64)
                }
            }
            AggregateFunction::Min => self.min.unwrap_or(Scalar::Null),
            AggregateFunction::Max => self.max.unwrap_or(Scalar::Null),
        }
    }
}
