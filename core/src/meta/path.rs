//! Tokenizer for dotted, index-bracketed property paths such as
//! `order[0].item[key].name`.

/// One parsed step of a property path, plus the unparsed remainder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PropertyTokenizer {
    name: String,
    indexed_name: String,
    index: Option<String>,
    children: Option<String>,
}

impl PropertyTokenizer {
    pub fn new(full_name: &str) -> PropertyTokenizer {
        let (indexed_name, children) = match full_name.find('.') {
            Some(delim) => (
                full_name[..delim].to_string(),
                Some(full_name[delim + 1..].to_string()),
            ),
            None => (full_name.to_string(), None),
        };
        let (name, index) = match indexed_name.find('[') {
            Some(open) => {
                // the bracket contents; a missing closing bracket keeps the
                // raw text so the caller's error points at the real input
                let inner = indexed_name[open + 1..]
                    .strip_suffix(']')
                    .unwrap_or(&indexed_name[open + 1..]);
                (indexed_name[..open].to_string(), Some(inner.to_string()))
            }
            None => (indexed_name.clone(), None),
        };
        PropertyTokenizer {
            name,
            indexed_name,
            index,
            children,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The bracket contents, a numeric string or a map-key string.
    pub fn index(&self) -> Option<&str> {
        self.index.as_deref()
    }

    /// Base name plus bracketed index when present.
    pub fn indexed_name(&self) -> &str {
        &self.indexed_name
    }

    pub fn children(&self) -> Option<&str> {
        self.children.as_deref()
    }

    pub fn has_next(&self) -> bool {
        self.children.is_some()
    }

    pub fn next(&self) -> PropertyTokenizer {
        PropertyTokenizer::new(self.children.as_deref().unwrap_or(""))
    }
}

#[cfg(test)]
mod unit {
    use super::*;

    #[test]
    fn simple_name() {
        let t = PropertyTokenizer::new("name");
        assert_eq!(t.name(), "name");
        assert_eq!(t.index(), None);
        assert_eq!(t.indexed_name(), "name");
        assert!(!t.has_next());
    }

    #[test]
    fn dotted_path() {
        let t = PropertyTokenizer::new("order.item.name");
        assert_eq!(t.name(), "order");
        assert_eq!(t.children(), Some("item.name"));
        let t2 = t.next();
        assert_eq!(t2.name(), "item");
        assert_eq!(t2.children(), Some("name"));
    }

    #[test]
    fn numeric_and_key_indexes() {
        let t = PropertyTokenizer::new("order[0].item[key].name");
        assert_eq!(t.name(), "order");
        assert_eq!(t.index(), Some("0"));
        assert_eq!(t.indexed_name(), "order[0]");
        let t2 = t.next();
        assert_eq!(t2.name(), "item");
        assert_eq!(t2.index(), Some("key"));
        assert_eq!(t2.children(), Some("name"));
    }
}
