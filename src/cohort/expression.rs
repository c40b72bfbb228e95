use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Error, Result};
use crate::history::UserId;

static RE_EXPRESSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-9]+[&~])*[0-9]+$").unwrap());

const OP_AND: char = '&';
const OP_OR: char = '~';

/// A boolean combination of numeric cohort ids, e.g. `1&2~3~4`.
///
/// `&` (intersection) binds tighter than `~` (union), so `1&2~3` is
/// "members of both 1 and 2, plus members of 3".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CohortExpression {
    /// Union of intersections.
    terms: Vec<Vec<i64>>,
}

impl CohortExpression {
    pub fn is_expression(s: &str) -> bool {
        RE_EXPRESSION.is_match(s.trim())
    }

    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if !Self::is_expression(s) {
            return Err(Error::CohortExpression(s.to_string()));
        }
        let terms = s
            .split(OP_OR)
            .map(|term| {
                term.split(OP_AND)
                    .map(|id| {
                        id.parse::<i64>()
                            .map_err(|_| Error::CohortExpression(s.to_string()))
                    })
                    .collect::<Result<Vec<i64>>>()
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { terms })
    }

    /// Every cohort id mentioned, in first-seen order.
    pub fn cohort_ids(&self) -> Vec<i64> {
        let mut seen = HashSet::new();
        self.terms
            .iter()
            .flatten()
            .copied()
            .filter(|id| seen.insert(*id))
            .collect()
    }

    /// Evaluate against already-loaded membership lists.
    ///
    /// Output order follows the first cohort of each term, users appear once.
    /// Ids missing from `members` are treated as empty cohorts.
    pub fn resolve(&self, members: &HashMap<i64, Vec<UserId>>) -> Vec<UserId> {
        let empty = Vec::new();
        let mut seen: HashSet<&str> = HashSet::new();
        let mut users = Vec::new();

        for term in &self.terms {
            let Some((first, rest)) = term.split_first() else {
                continue;
            };
            let others: Vec<HashSet<&str>> = rest
                .iter()
                .map(|id| {
                    members
                        .get(id)
                        .unwrap_or(&empty)
                        .iter()
                        .map(String::as_str)
                        .collect()
                })
                .collect();

            for user in members.get(first).unwrap_or(&empty) {
                if others.iter().all(|set| set.contains(user.as_str()))
                    && seen.insert(user.as_str())
                {
                    users.push(user.clone());
                }
            }
        }
        users
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members() -> HashMap<i64, Vec<UserId>> {
        let mut m = HashMap::new();
        m.insert(1, vec!["a".into(), "b".into(), "c".into()]);
        m.insert(2, vec!["b".into(), "c".into(), "d".into()]);
        m.insert(3, vec!["c".into(), "e".into()]);
        m.insert(4, vec!["f".into()]);
        m
    }

    #[test]
    fn test_is_expression() {
        assert!(CohortExpression::is_expression("12"));
        assert!(CohortExpression::is_expression("1&2~3~4"));
        assert!(!CohortExpression::is_expression("e3_ob2b"));
        assert!(!CohortExpression::is_expression("1&"));
        assert!(!CohortExpression::is_expression("&1"));
    }

    #[test]
    fn test_parse_rejects_names() {
        assert!(matches!(
            CohortExpression::parse("e3_ob2b"),
            Err(Error::CohortExpression(_))
        ));
    }

    #[test]
    fn test_single_cohort() {
        let expr = CohortExpression::parse("4").unwrap();
        assert_eq!(expr.resolve(&members()), vec!["f"]);
    }

    #[test]
    fn test_and_binds_tighter_than_or() {
        let expr = CohortExpression::parse("1&2~3").unwrap();
        assert_eq!(expr.cohort_ids(), vec![1, 2, 3]);
        // (1 ∩ 2) ∪ 3 = {b, c} ∪ {c, e}
        assert_eq!(expr.resolve(&members()), vec!["b", "c", "e"]);
    }

    #[test]
    fn test_intersection_of_three_requires_all() {
        let expr = CohortExpression::parse("1&2&3").unwrap();
        let users = expr.resolve(&members());
        assert_eq!(users, vec!["c"]);
        // "b" belongs to cohorts 1 and 2 but not 3; two of three is not enough
        assert!(!users.contains(&"b".to_string()));
    }

    #[test]
    fn test_unknown_cohort_is_empty() {
        let expr = CohortExpression::parse("1&99~4").unwrap();
        assert_eq!(expr.resolve(&members()), vec!["f"]);
    }
}
