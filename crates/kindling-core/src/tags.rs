use indexmap::IndexMap;

/// A parsed configuration tag bag.
///
/// The grammar is a `;`-separated list of `name[=value]` entries; a missing
/// value defaults to `"true"`. Names match case-insensitively, values keep
/// their case.
#[derive(Debug, Clone, Default)]
pub struct Tags {
    entries: IndexMap<String, String>,
}

impl Tags {
    pub fn new() -> Tags {
        Tags::default()
    }

    pub fn parse(source: &str) -> Tags {
        let mut tags = Tags::new();
        for entry in source.split(';') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            match entry.split_once('=') {
                Some((name, value)) => tags.put(name, value.trim()),
                None => tags.put(entry, "true"),
            }
        }
        tags
    }

    pub fn put(&mut self, name: &str, value: impl Into<String>) {
        self.entries
            .insert(name.trim().to_ascii_lowercase(), value.into());
    }

    pub fn merge(&mut self, other: &Tags) {
        for (name, value) in &other.entries {
            self.entries.insert(name.clone(), value.clone());
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn has(&self, name: &str) -> bool {
        self.entries.contains_key(&name.to_ascii_lowercase())
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        match self.get(name)? {
            "1" => Some(true),
            "0" => Some(false),
            v => v.to_ascii_lowercase().parse().ok(),
        }
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        self.get(name)?.parse().ok()
    }

    pub fn get_string_list(&self, name: &str) -> Vec<String> {
        match self.get(name) {
            Some(v) => v.split(',').map(|s| s.trim().to_string()).collect(),
            None => Vec::new(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_basic() {
        let tags = Tags::parse("key;scoped=false; verbosename=Product Name");
        assert_eq!(tags.get("key"), Some("true"));
        assert_eq!(tags.get_bool("key"), Some(true));
        assert_eq!(tags.get_bool("scoped"), Some(false));
        assert_eq!(tags.get("verbosename"), Some("Product Name"));
        assert!(!tags.has("label"));
    }

    #[test]
    fn names_are_case_insensitive() {
        let tags = Tags::parse("TableName=product");
        assert_eq!(tags.get("tablename"), Some("product"));
        assert_eq!(tags.get("TABLENAME"), Some("product"));
    }

    #[test]
    fn typed_getters() {
        let tags = Tags::parse("weight=10;cols=a, b ,c;flag=1");
        assert_eq!(tags.get_int("weight"), Some(10));
        assert_eq!(tags.get_bool("flag"), Some(true));
        assert_eq!(tags.get_string_list("cols"), vec!["a", "b", "c"]);
        assert!(tags.get_string_list("missing").is_empty());
    }

    #[test]
    fn merge_overrides() {
        let mut tags = Tags::parse("a=1;b=2");
        tags.merge(&Tags::parse("b=3;c=4"));
        assert_eq!(tags.get("a"), Some("1"));
        assert_eq!(tags.get("b"), Some("3"));
        assert_eq!(tags.get("c"), Some("4"));
    }
}
