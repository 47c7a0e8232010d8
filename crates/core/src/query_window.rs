/// How a row window is applied to a user's query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowPlan {
    /// The engine applies the window. `page_sql` fetches one row past the
    /// page so `has_more` can be detected when `count_sql` fails.
    Paged {
        page_sql: String,
        count_sql: String,
        limit: u64,
    },
    /// Statements that cannot take a LIMIT clause; the caller runs `sql`
    /// as-is and slices the window out of the full result.
    Unpaged { sql: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UserLimit {
    limit: u64,
    offset: u64,
    clause_start: usize,
}

const COUNT_ALIAS: &str = "pagewise_count";

#[must_use]
pub fn plan_window(sql: &str, limit: u32, offset: u64) -> WindowPlan {
    let statement = strip_terminator(sql);
    if !is_windowable(statement) {
        return WindowPlan::Unpaged {
            sql: statement.to_string(),
        };
    }

    let limit = u64::from(limit);
    let count_sql = format!("SELECT COUNT(*) FROM ({statement}) AS {COUNT_ALIAS}");

    let page_sql = match trailing_limit(statement) {
        // The user's own LIMIT caps the result; page inside it.
        Some(user) => {
            let base = statement[..user.clause_start].trim_end();
            let remaining = user.limit.saturating_sub(offset);
            let fetch = remaining.min(limit + 1);
            format!(
                "{base} LIMIT {fetch} OFFSET {}",
                user.offset.saturating_add(offset)
            )
        }
        None => format!("{statement} LIMIT {} OFFSET {offset}", limit + 1),
    };

    WindowPlan::Paged {
        page_sql,
        count_sql,
        limit,
    }
}

fn strip_terminator(sql: &str) -> &str {
    sql.trim().trim_end_matches(';').trim_end()
}

fn is_windowable(statement: &str) -> bool {
    let first_word = statement
        .trim_start_matches('(')
        .split_whitespace()
        .next()
        .unwrap_or_default();
    first_word.eq_ignore_ascii_case("select") || first_word.eq_ignore_ascii_case("with")
}

/// Parses `LIMIT n`, `LIMIT n OFFSET m` or `LIMIT m, n` at the very end of
/// the statement.
fn trailing_limit(statement: &str) -> Option<UserLimit> {
    let lowered = statement.to_ascii_lowercase();
    let clause_start = lowered.rfind("limit")?;
    let preceded_by_space = lowered[..clause_start]
        .chars()
        .next_back()
        .is_some_and(char::is_whitespace);
    if !preceded_by_space {
        return None;
    }

    let tail = lowered[clause_start + "limit".len()..].trim();
    let (limit, offset) = if let Some((limit, offset)) = tail.split_once("offset") {
        (parse_count(limit)?, parse_count(offset)?)
    } else if let Some((offset, limit)) = tail.split_once(',') {
        (parse_count(limit)?, parse_count(offset)?)
    } else {
        (parse_count(tail)?, 0)
    };

    Some(UserLimit {
        limit,
        offset,
        clause_start,
    })
}

fn parse_count(raw: &str) -> Option<u64> {
    raw.trim().parse::<u64>().ok()
}

/// Client-side window over a fully materialized result.
#[must_use]
pub fn slice_window<T>(rows: Vec<T>, limit: u32, offset: u64) -> Vec<T> {
    let start = usize::try_from(offset).unwrap_or(usize::MAX);
    rows.into_iter()
        .skip(start)
        .take(limit as usize)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{plan_window, slice_window, WindowPlan};

    fn paged(plan: WindowPlan) -> (String, String, u64) {
        match plan {
            WindowPlan::Paged {
                page_sql,
                count_sql,
                limit,
            } => (page_sql, count_sql, limit),
            WindowPlan::Unpaged { sql } => panic!("expected paged plan, got `{sql}`"),
        }
    }

    #[test]
    fn plain_select_gets_window_and_count() {
        let (page_sql, count_sql, limit) = paged(plan_window("SELECT * FROM users;", 100, 300));

        assert_eq!(page_sql, "SELECT * FROM users LIMIT 101 OFFSET 300");
        assert_eq!(
            count_sql,
            "SELECT COUNT(*) FROM (SELECT * FROM users) AS pagewise_count"
        );
        assert_eq!(limit, 100);
    }

    #[test]
    fn user_limit_caps_the_window() {
        let (page_sql, _, _) = paged(plan_window("select id from t limit 150", 100, 100));
        assert_eq!(page_sql, "select id from t LIMIT 50 OFFSET 100");

        let (past_end, _, _) = paged(plan_window("select id from t limit 150", 100, 200));
        assert_eq!(past_end, "select id from t LIMIT 0 OFFSET 200");
    }

    #[test]
    fn user_offset_is_added_to_page_offset() {
        let (page_sql, _, _) = paged(plan_window("SELECT id FROM t LIMIT 500 OFFSET 20", 25, 50));
        assert_eq!(page_sql, "SELECT id FROM t LIMIT 26 OFFSET 70");

        let (mysql_form, _, _) = paged(plan_window("SELECT id FROM t LIMIT 20, 500", 25, 50));
        assert_eq!(mysql_form, "SELECT id FROM t LIMIT 26 OFFSET 70");
    }

    #[test]
    fn limit_inside_subquery_is_left_alone() {
        let (page_sql, _, _) = paged(plan_window(
            "SELECT * FROM (SELECT id FROM t LIMIT 5) AS s",
            25,
            0,
        ));
        assert_eq!(
            page_sql,
            "SELECT * FROM (SELECT id FROM t LIMIT 5) AS s LIMIT 26 OFFSET 0"
        );
    }

    #[test]
    fn non_select_statements_are_not_wrapped() {
        assert_eq!(
            plan_window("SHOW TABLES;", 100, 0),
            WindowPlan::Unpaged {
                sql: "SHOW TABLES".to_string()
            }
        );
        assert!(matches!(
            plan_window("  with x as (select 1) select * from x", 25, 0),
            WindowPlan::Paged { .. }
        ));
    }

    #[test]
    fn slice_window_handles_short_results() {
        let rows = (0..10).collect::<Vec<_>>();
        assert_eq!(slice_window(rows.clone(), 4, 8), vec![8, 9]);
        assert!(slice_window(rows, 4, 25).is_empty());
    }
}
