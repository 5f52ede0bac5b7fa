use crate::{Error, Result};

/// One `(kind, id)` link in a key chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct KeyPart {
    pub kind: String,
    pub id: i64,
}

/// Identifies an entity by an ordered chain of `(kind, id)` pairs from the
/// root ancestor down to the leaf. The empty chain is the zero key: no
/// parent, no identity.
///
/// The canonical textual form lists the chain leaf first:
/// `{("fruit",1),("groceries",7)}`. The legacy `groceries:7/fruit:1` form
/// (leaf last) is accepted by [`Key::parse`] but never emitted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Key {
    chain: Vec<KeyPart>,
}

impl Key {
    pub const fn zero() -> Key {
        Key { chain: Vec::new() }
    }

    /// Creates a key for `(kind, id)` under `parent`.
    pub fn new(parent: &Key, kind: &str, id: i64) -> Key {
        let mut chain = parent.chain.clone();
        chain.push(KeyPart {
            kind: kind.to_string(),
            id,
        });
        Key { chain }
    }

    pub fn is_zero(&self) -> bool {
        self.chain.is_empty()
    }

    /// The leaf kind name, if any.
    pub fn kind(&self) -> Option<&str> {
        self.chain.last().map(|p| p.kind.as_str())
    }

    /// The leaf id; 0 for the zero key.
    pub fn id(&self) -> i64 {
        self.chain.last().map(|p| p.id).unwrap_or(0)
    }

    pub fn parent(&self) -> Key {
        match self.chain.len() {
            0 | 1 => Key::zero(),
            n => Key {
                chain: self.chain[..n - 1].to_vec(),
            },
        }
    }

    /// The chain from root to leaf.
    pub fn chain(&self) -> &[KeyPart] {
        &self.chain
    }

    /// Parses either textual form; the empty string is the zero key.
    pub fn parse(text: &str) -> Result<Key> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Key::zero());
        }
        if text.starts_with('{') {
            Key::parse_braced(text)
        } else {
            Key::parse_slashed(text)
        }
    }

    fn parse_braced(text: &str) -> Result<Key> {
        let inner = text
            .strip_prefix('{')
            .and_then(|t| t.strip_suffix('}'))
            .ok_or_else(|| Error::invalid_identifier(format!("malformed key '{text}'")))?;
        let mut chain = Vec::new();
        for item in split_parenthesized(inner) {
            match parse_reference_literal(&item)? {
                Some(part) => chain.push(part),
                None => {
                    return Err(Error::invalid_identifier(format!(
                        "key '{text}' contains an empty link"
                    )))
                }
            }
        }
        // Braced text runs leaf to root.
        chain.reverse();
        Ok(Key { chain })
    }

    fn parse_slashed(text: &str) -> Result<Key> {
        let mut chain = Vec::new();
        for local in text.split('/').filter(|s| !s.is_empty()) {
            let (kind, id) = local.split_once(':').ok_or_else(|| {
                Error::invalid_identifier(format!(
                    "format error in key '{text}': local part has no ':'"
                ))
            })?;
            let id: i64 = id.trim().parse().map_err(|_| {
                Error::invalid_identifier(format!(
                    "parsing key '{text}': id '{id}' is not an integer"
                ))
            })?;
            chain.push(KeyPart {
                kind: kind.trim().to_string(),
                id,
            });
        }
        Ok(Key { chain })
    }

    /// The leaf rendered as a composite literal: `(kind,id)`, or `("",0)` for
    /// the zero key.
    pub fn reference_literal(&self) -> String {
        match self.chain.last() {
            Some(part) => format!("({},{})", part.kind, part.id),
            None => "(\"\",0)".to_string(),
        }
    }

    /// The full chain rendered as an array literal of composite pairs, leaf
    /// first: `{"(fruit,1)","(groceries,7)"}`. The zero key renders as `{}`.
    pub fn array_literal(&self) -> String {
        let mut out = String::from("{");
        for (i, part) in self.chain.iter().rev().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push('"');
            out.push('(');
            out.push_str(&part.kind);
            out.push(',');
            out.push_str(&part.id.to_string());
            out.push(')');
            out.push('"');
        }
        out.push('}');
        out
    }

    /// Parses an array literal produced by [`Key::array_literal`] (or by the
    /// database's text output for the same value) back into a key.
    pub fn parse_array_literal(text: &str) -> Result<Key> {
        let text = text.trim();
        let inner = text
            .strip_prefix('{')
            .and_then(|t| t.strip_suffix('}'))
            .ok_or_else(|| {
                Error::invalid_identifier(format!("malformed key chain literal '{text}'"))
            })?;
        let mut chain = Vec::new();
        for item in split_array_elements(inner) {
            if let Some(part) = parse_reference_literal(&item)? {
                chain.push(part);
            }
        }
        // Array literals run leaf to root.
        chain.reverse();
        Ok(Key { chain })
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_zero() {
            return Ok(());
        }
        f.write_str("{")?;
        for (i, part) in self.chain.iter().rev().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "(\"{}\",{})", part.kind, part.id)?;
        }
        f.write_str("}")
    }
}

/// Parses one `(kind,id)` composite literal. Quotes around the kind are
/// optional; a quoted empty kind (the zero reference) yields `None`.
pub fn parse_reference_literal(text: &str) -> Result<Option<KeyPart>> {
    let text = text.trim();
    let inner = text
        .strip_prefix('(')
        .and_then(|t| t.strip_suffix(')'))
        .ok_or_else(|| Error::invalid_identifier(format!("malformed reference '{text}'")))?;
    let (kind, id) = inner
        .rsplit_once(',')
        .ok_or_else(|| Error::invalid_identifier(format!("malformed reference '{text}'")))?;
    let kind = kind.trim().trim_matches('"');
    if kind.is_empty() {
        return Ok(None);
    }
    let id: i64 = id.trim().parse().map_err(|_| {
        Error::invalid_identifier(format!("reference '{text}': id is not an integer"))
    })?;
    Ok(Some(KeyPart {
        kind: kind.to_string(),
        id,
    }))
}

/// Splits `(a,1),(b,2)` into its parenthesized items.
fn split_parenthesized(text: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();
    for c in text.chars() {
        match c {
            '(' => {
                depth += 1;
                current.push(c);
            }
            ')' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            ',' if depth == 0 => {
                if !current.trim().is_empty() {
                    items.push(current.trim().to_string());
                }
                current = String::new();
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        items.push(current.trim().to_string());
    }
    items
}

/// Splits the body of an array literal into elements, honouring double
/// quotes and backslash escapes.
fn split_array_elements(text: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut escaped = false;
    for c in text.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '"' => quoted = !quoted,
            ',' if !quoted => {
                if !current.trim().is_empty() {
                    items.push(current.trim().to_string());
                }
                current = String::new();
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        items.push(current.trim().to_string());
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_key() {
        let key = Key::zero();
        assert!(key.is_zero());
        assert_eq!(key.id(), 0);
        assert_eq!(key.kind(), None);
        assert_eq!(key.to_string(), "");
        assert_eq!(Key::parse("").unwrap(), key);
    }

    #[test]
    fn parent_chain() {
        let groceries = Key::new(&Key::zero(), "groceries", 7);
        let fruit = Key::new(&groceries, "fruit", 1);
        assert_eq!(fruit.id(), 1);
        assert_eq!(fruit.kind(), Some("fruit"));
        assert_eq!(fruit.parent(), groceries);
        assert_eq!(groceries.parent(), Key::zero());
        assert_eq!(fruit.chain().len(), 2);
        assert_eq!(fruit.chain()[0].kind, "groceries");
    }

    #[test]
    fn canonical_roundtrip() {
        let groceries = Key::new(&Key::zero(), "groceries", 7);
        let fruit = Key::new(&groceries, "fruit", 1);
        let text = fruit.to_string();
        assert_eq!(text, "{(\"fruit\",1),(\"groceries\",7)}");
        assert_eq!(Key::parse(&text).unwrap(), fruit);
    }

    #[test]
    fn parse_braced_unquoted() {
        let key = Key::parse("{(fruit,1),(groceries,7)}").unwrap();
        assert_eq!(key.kind(), Some("fruit"));
        assert_eq!(key.parent().kind(), Some("groceries"));
    }

    #[test]
    fn parse_legacy_form() {
        let key = Key::parse("groceries:7/fruit:1").unwrap();
        assert_eq!(key.kind(), Some("fruit"));
        assert_eq!(key.id(), 1);
        assert_eq!(key.parent().kind(), Some("groceries"));
        // Legacy input, canonical output.
        assert_eq!(Key::parse(&key.to_string()).unwrap(), key);
    }

    #[test]
    fn parse_errors() {
        assert!(Key::parse("fruit").is_err());
        assert!(Key::parse("fruit:x").is_err());
        assert!(Key::parse("{(fruit)}").is_err());
    }

    #[test]
    fn array_literal_roundtrip() {
        let groceries = Key::new(&Key::zero(), "groceries", 7);
        let fruit = Key::new(&groceries, "fruit", 1);
        let lit = fruit.array_literal();
        assert_eq!(lit, "{\"(fruit,1)\",\"(groceries,7)\"}");
        assert_eq!(Key::parse_array_literal(&lit).unwrap(), fruit);
        assert_eq!(Key::zero().array_literal(), "{}");
        assert!(Key::parse_array_literal("{}").unwrap().is_zero());
    }

    #[test]
    fn reference_literals() {
        let key = Key::new(&Key::zero(), "demo.product", 42);
        assert_eq!(key.reference_literal(), "(demo.product,42)");
        assert_eq!(Key::zero().reference_literal(), "(\"\",0)");
        let part = parse_reference_literal("(demo.product,42)").unwrap().unwrap();
        assert_eq!(part.kind, "demo.product");
        assert_eq!(part.id, 42);
        assert!(parse_reference_literal("(\"\",0)").unwrap().is_none());
    }
}
