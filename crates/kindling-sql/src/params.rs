/// The sentinel rendered wherever a positional parameter is needed. A
/// post-render pass replaces successive occurrences with `$1`, `$2`, ….
pub const PLACEHOLDER: &str = "__count__";

enum Token {
    Count(Option<usize>),
    Reset(Option<usize>),
}

/// Recognizes `__count__`, `__count:N__`, `__reset__` and `__reset:N__` at
/// the head of `text`, returning the token and its length.
fn token_at(text: &str) -> Option<(Token, usize)> {
    let rest = text.strip_prefix("__")?;
    let (reset, rest) = if let Some(rest) = rest.strip_prefix("count") {
        (false, rest)
    } else if let Some(rest) = rest.strip_prefix("reset") {
        (true, rest)
    } else {
        return None;
    };
    let (arg, rest) = if let Some(rest) = rest.strip_prefix(':') {
        let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        if digits.is_empty() {
            return None;
        }
        let value = digits.parse().ok()?;
        (Some(value), &rest[digits.len()..])
    } else {
        (None, rest)
    };
    let rest = rest.strip_prefix("__")?;
    let len = text.len() - rest.len();
    let token = if reset {
        Token::Reset(arg)
    } else {
        Token::Count(arg)
    };
    Some((token, len))
}

/// Replaces parameter sentinels with `$1`, `$2`, … in order of occurrence.
///
/// `__count:N__` emits `$N` and continues counting from `N + 1`;
/// `__reset:N__` moves the counter without emitting anything; a bare
/// `__reset__` restarts at 1.
pub fn rewrite_placeholders(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut next = 1usize;
    let mut rest = sql;
    while let Some(at) = rest.find("__") {
        out.push_str(&rest[..at]);
        match token_at(&rest[at..]) {
            Some((Token::Count(arg), len)) => {
                if let Some(arg) = arg {
                    next = arg;
                }
                out.push('$');
                out.push_str(&next.to_string());
                next += 1;
                rest = &rest[at + len..];
            }
            Some((Token::Reset(arg), len)) => {
                next = arg.unwrap_or(1);
                rest = &rest[at + len..];
            }
            None => {
                out.push_str("__");
                rest = &rest[at + 2..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Counts the positional-parameter sentinels in `sql`. Rendering keeps this
/// equal to the length of the bound parameter list.
pub fn count_placeholders(sql: &str) -> usize {
    let mut count = 0;
    let mut rest = sql;
    while let Some(at) = rest.find("__") {
        match token_at(&rest[at..]) {
            Some((Token::Count(_), len)) => {
                count += 1;
                rest = &rest[at + len..];
            }
            Some((Token::Reset(_), len)) => {
                rest = &rest[at + len..];
            }
            None => rest = &rest[at + 2..],
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential() {
        assert_eq!(
            rewrite_placeholders("a = __count__ AND b = __count__"),
            "a = $1 AND b = $2"
        );
    }

    #[test]
    fn explicit_index() {
        assert_eq!(
            rewrite_placeholders("a = __count:5__ AND b = __count__"),
            "a = $5 AND b = $6"
        );
    }

    #[test]
    fn reset() {
        assert_eq!(
            rewrite_placeholders("a = __count__ UNION ALL a = __reset____count__"),
            "a = $1 UNION ALL a = $1"
        );
        assert_eq!(
            rewrite_placeholders("__reset:3____count__"),
            "$3"
        );
    }

    #[test]
    fn unrelated_underscores_survive(){
        assert_eq!(rewrite_placeholders("\"_id\" = __count__"), "\"_id\" = $1");
        assert_eq!(rewrite_placeholders("__counter__"), "__counter__");
    }

    #[test]
    fn counting() {
        let sql = "x = __count__, y = __count:9__, z = __reset____count__";
        assert_eq!(count_placeholders(sql), 3);
        assert_eq!(count_placeholders("no params"), 0);
    }
}
