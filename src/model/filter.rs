use crate::error::FilterError;
use std::fmt;
use std::str::FromStr;

/// Lookup operators accepted between brackets in a filter term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Exact,
    IExact,
    Contains,
    IContains,
    In,
    StartsWith,
    IStartsWith,
    /// Suffix match, case-insensitive
    EndsWith,
    Year,
    Date,
    IsoYear,
    Range,
    Gte,
    Lte,
    Gt,
    Lt,
}

impl Operator {
    pub const ALL: [Operator; 16] = [
        Operator::Exact,
        Operator::IExact,
        Operator::Contains,
        Operator::IContains,
        Operator::In,
        Operator::StartsWith,
        Operator::IStartsWith,
        Operator::EndsWith,
        Operator::Year,
        Operator::Date,
        Operator::IsoYear,
        Operator::Range,
        Operator::Gte,
        Operator::Lte,
        Operator::Gt,
        Operator::Lt,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Operator::Exact => "exact",
            Operator::IExact => "iexact",
            Operator::Contains => "contains",
            Operator::IContains => "icontains",
            Operator::In => "in",
            Operator::StartsWith => "startswith",
            Operator::IStartsWith => "istartswith",
            Operator::EndsWith => "endswith",
            Operator::Year => "year",
            Operator::Date => "date",
            Operator::IsoYear => "iso_year",
            Operator::Range => "range",
            Operator::Gte => "gte",
            Operator::Lte => "lte",
            Operator::Gt => "gt",
            Operator::Lt => "lt",
        }
    }
}

impl FromStr for Operator {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Operator::ALL
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| FilterError::UnknownFilterOperator(s.to_string()))
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single `[!]path[operator]value` term, value still in its raw textual form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    pub path: String,
    pub operator: Operator,
    pub value: String,
    pub negated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connector {
    And,
    Or,
}

/// Boolean predicate tree compiled from a filter string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    Leaf(Condition),
    Combine {
        connector: Connector,
        left: Box<Predicate>,
        right: Box<Predicate>,
    },
}

impl Predicate {
    pub fn and(self, other: Predicate) -> Predicate {
        Predicate::Combine {
            connector: Connector::And,
            left: Box::new(self),
            right: Box::new(other),
        }
    }

    pub fn or(self, other: Predicate) -> Predicate {
        Predicate::Combine {
            connector: Connector::Or,
            left: Box::new(self),
            right: Box::new(other),
        }
    }

    pub fn conditions(&self) -> Vec<&Condition> {
        match self {
            Predicate::Leaf(condition) => vec![condition],
            Predicate::Combine { left, right, .. } => {
                let mut all = left.conditions();
                all.extend(right.conditions());
                all
            }
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Leaf(c) => write!(
                f,
                "{}{}[{}]{}",
                if c.negated { "!" } else { "" },
                c.path,
                c.operator,
                c.value
            ),
            Predicate::Combine {
                connector,
                left,
                right,
            } => {
                let word = match connector {
                    Connector::And => "AND",
                    Connector::Or => "OR",
                };
                write!(f, "({} {} {})", left, word, right)
            }
        }
    }
}
