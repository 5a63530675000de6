//! Query terms and the term-level boolean tree
//!
//! Terms are identified by an xxh3 hash of their text together with the
//! stream they were indexed in. The term tree is the planner's input and is
//! produced by an external query parser.

use std::fmt;

use xxhash_rust::xxh3::xxh3_64;

/// Stream (document field) a term was indexed from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct StreamId(pub u8);

/// A query term
#[derive(Debug, Clone)]
pub struct Term {
    hash: u64,
    stream: StreamId,
    gram_size: u8,
    text: String,
}

impl Term {
    /// Create a unigram term in the default stream
    pub fn new(text: impl Into<String>) -> Self {
        Self::with_stream(text, StreamId::default())
    }

    /// Create a unigram term in `stream`
    pub fn with_stream(text: impl Into<String>, stream: StreamId) -> Self {
        let text = text.into();
        Self {
            hash: xxh3_64(text.as_bytes()),
            stream,
            gram_size: 1,
            text,
        }
    }

    /// Create an n-gram term from its words, joined by single spaces
    pub fn ngram(words: &[&str], stream: StreamId) -> Self {
        let mut term = Self::with_stream(words.join(" "), stream);
        term.gram_size = words.len().clamp(1, u8::MAX as usize) as u8;
        term
    }

    /// Hash of the term text
    pub fn hash(&self) -> u64 {
        self.hash
    }

    /// Stream the term belongs to
    pub fn stream(&self) -> StreamId {
        self.stream
    }

    /// Number of words in the term
    pub fn gram_size(&self) -> u8 {
        self.gram_size
    }

    /// Term text, for diagnostics
    pub fn text(&self) -> &str {
        &self.text
    }
}

impl PartialEq for Term {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.stream == other.stream
    }
}

impl Eq for Term {}

impl std::hash::Hash for Term {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
        self.stream.hash(state);
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.stream.0 == 0 {
            write!(f, "\"{}\"", self.text)
        } else {
            write!(f, "{}:\"{}\"", self.stream.0, self.text)
        }
    }
}

/// Term-level boolean query tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TermMatchNode {
    /// All children must match
    And(Vec<TermMatchNode>),
    /// At least one child must match
    Or(Vec<TermMatchNode>),
    /// Child must not match
    Not(Box<TermMatchNode>),
    /// Document contains the term
    Term(Term),
}

impl TermMatchNode {
    /// Leaf for `text` in the default stream
    pub fn term(text: impl Into<String>) -> Self {
        Self::Term(Term::new(text))
    }

    /// Conjunction
    pub fn and(children: Vec<TermMatchNode>) -> Self {
        Self::And(children)
    }

    /// Disjunction
    pub fn or(children: Vec<TermMatchNode>) -> Self {
        Self::Or(children)
    }

    /// Negation
    pub fn negate(child: TermMatchNode) -> Self {
        Self::Not(Box::new(child))
    }

    /// Visit every term leaf in depth-first order
    pub fn for_each_term<'a>(&'a self, visit: &mut impl FnMut(&'a Term)) {
        match self {
            Self::And(children) | Self::Or(children) => {
                for child in children {
                    child.for_each_term(visit);
                }
            }
            Self::Not(child) => child.for_each_term(visit),
            Self::Term(term) => visit(term),
        }
    }

    /// Number of nodes in the tree
    pub fn node_count(&self) -> usize {
        match self {
            Self::And(children) | Self::Or(children) => {
                1 + children.iter().map(Self::node_count).sum::<usize>()
            }
            Self::Not(child) => 1 + child.node_count(),
            Self::Term(_) => 1,
        }
    }
}

impl fmt::Display for TermMatchNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::And(children) | Self::Or(children) => {
                let op = if matches!(self, Self::And(_)) { "And" } else { "Or" };
                write!(f, "{}(", op)?;
                for (i, child) in children.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", child)?;
                }
                write!(f, ")")
            }
            Self::Not(child) => write!(f, "Not({})", child),
            Self::Term(term) => write!(f, "{}", term),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_term_identity_is_hash_and_stream() {
        let a = Term::new("apple");
        let b = Term::new("apple");
        let c = Term::with_stream("apple", StreamId(2));

        assert_eq!(a, b);
        assert_eq!(a.hash(), b.hash());
        assert_ne!(a, c);
        assert_eq!(a.gram_size(), 1);
    }

    #[test]
    fn test_ngram() {
        let term = Term::ngram(&["new", "york"], StreamId(1));
        assert_eq!(term.gram_size(), 2);
        assert_eq!(term.text(), "new york");
        assert_eq!(term.to_string(), "1:\"new york\"");
    }

    #[test]
    fn test_tree_display_and_walk() {
        let tree = TermMatchNode::and(vec![
            TermMatchNode::term("a"),
            TermMatchNode::or(vec![
                TermMatchNode::term("b"),
                TermMatchNode::negate(TermMatchNode::term("c")),
            ]),
        ]);

        assert_eq!(tree.to_string(), "And(\"a\", Or(\"b\", Not(\"c\")))");
        assert_eq!(tree.node_count(), 6);

        let mut seen = Vec::new();
        tree.for_each_term(&mut |t| seen.push(t.text().to_string()));
        assert_eq!(seen, vec!["a", "b", "c"]);
    }
}
