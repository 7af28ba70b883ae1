//! String interning for identifiers, property names, and string literals.
//!
//! Avoids repeated heap allocation for the same identifier text appearing
//! throughout a program by storing each unique string once and handing out
//! a small copyable `StringId` in its place.

use ahash::AHashMap;

/// Index into the interner's storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct StringId(u32);

impl StringId {
    /// Reconstructs a `StringId` from a raw bytecode operand.
    #[inline]
    #[must_use]
    pub fn from_index(index: u16) -> Self {
        Self(u32::from(index))
    }

    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Owns every unique string the lexer/parser/compiler has seen, keyed by a
/// `StringId`. Lookups during parsing go through `intern`; lookups during
/// VM execution (for error messages and property name formatting) go
/// through `resolve`.
#[derive(Debug, Default)]
pub struct Interns {
    strings: Vec<Box<str>>,
    index: AHashMap<Box<str>, StringId>,
}

impl Interns {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns `s`, returning its existing id if already present.
    ///
    /// # Panics
    /// Panics if more than `u32::MAX` unique strings are interned.
    pub fn intern(&mut self, s: &str) -> StringId {
        if let Some(&id) = self.index.get(s) {
            return id;
        }
        let id = StringId(u32::try_from(self.strings.len()).expect("intern table overflow"));
        self.strings.push(s.into());
        self.index.insert(s.into(), id);
        id
    }

    #[must_use]
    pub fn resolve(&self, id: StringId) -> &str {
        &self.strings[id.index()]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::Interns;

    #[test]
    fn same_text_interns_to_same_id() {
        let mut interns = Interns::new();
        let a = interns.intern("hello");
        let b = interns.intern("hello");
        assert_eq!(a, b);
        assert_eq!(interns.resolve(a), "hello");
    }

    #[test]
    fn distinct_text_gets_distinct_ids() {
        let mut interns = Interns::new();
        let a = interns.intern("foo");
        let b = interns.intern("bar");
        assert_ne!(a, b);
    }
}
