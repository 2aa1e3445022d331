//! Two interners live here: the process-wide leak table that backs
//! [`Location`](super::Location)'s `&'static str` fields, and the per-program
//! [`StringTable`] that maps decoded string-literal payloads to dense ids.

use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock},
};

use once_cell::sync::Lazy;

use crate::{
    compiler::Compiler,
    frontend::{escape, Token, TokenKind},
    report::CResult,
};

#[derive(Debug, Default)]
pub struct InterningTable {
    strings: RwLock<Vec<&'static str>>,
}

static INTERNING_TABLE: Lazy<Arc<InterningTable>> = Lazy::new(Default::default);

impl InterningTable {
    pub fn insert_if_absent(&self, string: &str) -> &'static str {
        if let Some(interned) = self.find(string) {
            return interned;
        }

        let mut strings = self.strings.write().unwrap();

        let interned: &'static str = Box::leak(string.to_owned().into_boxed_str());
        strings.push(interned);
        interned
    }

    fn find(&self, string: &str) -> Option<&'static str> {
        let strings = self.strings.read().unwrap();

        strings.iter().find(|s| **s == string).copied()
    }
}

/// Interns `string` for the lifetime of the process.
pub fn intern_str(string: &str) -> &'static str {
    INTERNING_TABLE.insert_if_absent(string)
}

/// Maps decoded string payloads to small sequential ids. Identical payloads
/// share an id no matter how they were escaped in source.
#[derive(Debug, Default)]
pub struct StringTable {
    ids: BTreeMap<Vec<u8>, u64>,
}

impl StringTable {
    pub fn intern(&mut self, bytes: Vec<u8>) -> u64 {
        let next_id = self.ids.len() as u64;
        *self.ids.entry(bytes).or_insert(next_id)
    }

    pub fn get(&self, bytes: &[u8]) -> Option<u64> {
        self.ids.get(bytes).copied()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Entries ordered by id, for reproducible data-section emission.
    pub fn iter_by_id(&self) -> Vec<(u64, &[u8])> {
        let mut entries = self
            .ids
            .iter()
            .map(|(bytes, id)| (*id, bytes.as_slice()))
            .collect::<Vec<_>>();
        entries.sort_by_key(|(id, _)| *id);
        entries
    }

    /// Drops every string whose id is not in `keep`; returns how many were
    /// removed.
    pub fn retain_ids(&mut self, keep: &hashbrown::HashSet<u64>) -> usize {
        let before = self.ids.len();
        self.ids.retain(|_, id| keep.contains(id));
        before - self.ids.len()
    }
}

/// Decodes every string-literal token and annotates it with its interned id.
pub fn extract_strings(
    compiler: &Compiler,
    tokens: &mut [Token],
    strings: &mut StringTable,
) -> CResult<()> {
    for token in tokens {
        if !matches!(token.kind, TokenKind::Str { .. }) {
            continue;
        }

        let payload = &token.text[1..token.text.len() - 1];
        let mut bytes = Vec::with_capacity(payload.len());
        escape::decode(
            &compiler.reporter,
            token.location,
            payload,
            &mut |byte| {
                bytes.push(byte);
                true
            },
        )?;

        token.kind = TokenKind::Str {
            id: Some(strings.intern(bytes)),
        };
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::report::Reporter;

    fn interned_ids(source: &str) -> (Vec<u64>, StringTable) {
        let reporter = Reporter::silent();
        let mut tokens = Vec::new();
        crate::frontend::lexer::lex(&reporter, source, "<test>", &mut tokens).unwrap();

        let compiler = crate::compiler::test_support::test_compiler();
        let mut strings = StringTable::default();
        extract_strings(&compiler, &mut tokens, &mut strings).unwrap();

        let ids = tokens
            .iter()
            .filter_map(|t| match t.kind {
                TokenKind::Str { id } => id,
                _ => None,
            })
            .collect();
        (ids, strings)
    }

    #[test]
    fn identical_payloads_share_an_id() {
        // "A" written three different ways decodes to the same byte.
        let (ids, strings) = interned_ids(r#" "A" "\x41" "A" "#);
        assert_eq!(ids, vec![0, 0, 0]);
        assert_eq!(strings.len(), 1);
        assert_eq!(strings.get(b"A"), Some(0));
    }

    #[test]
    fn distinct_payloads_get_sequential_ids() {
        let (ids, strings) = interned_ids(r#" "one" "two" "one" "three" "#);
        assert_eq!(ids, vec![0, 1, 0, 2]);
        assert_eq!(strings.len(), 3);
    }

    #[test]
    fn leak_interner_deduplicates() {
        let a = intern_str("frontend/intern/test");
        let b = intern_str("frontend/intern/test");
        assert!(std::ptr::eq(a, b));
    }
}
