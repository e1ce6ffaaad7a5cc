use crate::error::FilterError;
use crate::model::{Condition, Connector, Predicate};
use once_cell::sync::Lazy;
use regex::Regex;

static TERM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?P<negate>!?)(?P<field>[A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)*)\[(?P<operator>[A-Za-z_]+)\](?P<value>[^;,]+)(?P<sep>[;,]?)",
    )
    .expect("filter term pattern")
});

/// Compiles a `filterBy` string into a predicate tree.
///
/// Terms are folded left to right in encounter order. The separator following
/// term *i* decides how term *i + 1* joins everything accumulated so far: `;`
/// is AND, `,` is OR. There is no precedence between the two, so
/// `a;b,c` reads as `(a AND b) OR c` and `a,b;c` as `(a OR b) AND c`.
pub fn compile_filter(text: Option<&str>) -> Result<Option<Predicate>, FilterError> {
    let text = match text {
        Some(t) if !t.trim().is_empty() => t,
        _ => return Ok(None),
    };

    let mut accumulated: Option<Predicate> = None;
    let mut pending = Connector::And;

    for caps in TERM.captures_iter(text) {
        let condition = Condition {
            path: caps["field"].to_string(),
            operator: caps["operator"].parse()?,
            value: caps["value"].to_string(),
            negated: !caps["negate"].is_empty(),
        };
        let leaf = Predicate::Leaf(condition);

        accumulated = Some(match accumulated {
            None => leaf,
            Some(left) => match pending {
                Connector::And => left.and(leaf),
                Connector::Or => left.or(leaf),
            },
        });
        pending = match &caps["sep"] {
            "," => Connector::Or,
            _ => Connector::And,
        };
    }

    Ok(accumulated)
}
