//! Types flowing through the abstract stack.

use std::fmt;

use crate::frontend::{Location, Token};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    Int,
    Bool,
    Pointer,
    Any,
    /// A unification variable in a stack effect; the number is the
    /// variable's name within one effect alternative.
    Var(u32),
}

impl TypeKind {
    /// `any` compares equal to everything; variables never reach this
    /// comparison (they are substituted through a binding map first).
    pub fn matches(self, other: TypeKind) -> bool {
        self == TypeKind::Any || other == TypeKind::Any || self == other
    }
}

impl fmt::Display for TypeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeKind::Int => f.write_str("u64"),
            TypeKind::Bool => f.write_str("bool"),
            TypeKind::Pointer => f.write_str("ptr"),
            TypeKind::Any => f.write_str("any"),
            TypeKind::Var(n) => write!(f, "_{n}"),
        }
    }
}

/// A type together with the location that introduced the value carrying it,
/// so stack mismatches can point at the offending push.
#[derive(Debug, Clone, Copy)]
pub struct Type {
    pub kind: TypeKind,
    pub location: Location,
}

impl Type {
    pub fn new(kind: TypeKind, location: Location) -> Self {
        Self { kind, location }
    }

    /// The type named by a typename keyword token (`any`, `bool`, `ptr`,
    /// `i8` … `u64`).
    pub fn from_typename(token: &Token) -> Option<Self> {
        let kind = match token.text.as_bytes().first()? {
            b'a' => TypeKind::Any,
            b'b' => TypeKind::Bool,
            b'p' => TypeKind::Pointer,
            b'i' | b'u' => TypeKind::Int,
            _ => return None,
        };
        Some(Self::new(kind, token.location))
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.kind.fmt(f)
    }
}

pub type Typestack = Vec<Type>;

/// Declared `input -- output` transformation of a function.
#[derive(Debug, Clone, Default)]
pub struct StackEffect {
    pub input: Vec<Type>,
    pub output: Vec<Type>,
}

impl fmt::Display for StackEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for ty in &self.input {
            write!(f, "{ty} ")?;
        }
        f.write_str("--")?;
        for ty in &self.output {
            write!(f, " {ty}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn any_matches_everything() {
        for kind in [TypeKind::Int, TypeKind::Bool, TypeKind::Pointer, TypeKind::Any] {
            assert!(TypeKind::Any.matches(kind));
            assert!(kind.matches(TypeKind::Any));
        }
        assert!(!TypeKind::Int.matches(TypeKind::Bool));
        assert!(!TypeKind::Pointer.matches(TypeKind::Int));
    }

    #[test]
    fn effect_display() {
        let at = Location::builtin();
        let effect = StackEffect {
            input: vec![Type::new(TypeKind::Int, at), Type::new(TypeKind::Int, at)],
            output: vec![Type::new(TypeKind::Bool, at)],
        };
        assert_eq!(effect.to_string(), "u64 u64 -- bool");

        let empty = StackEffect::default();
        assert_eq!(empty.to_string(), "--");
    }
}
