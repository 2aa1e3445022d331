use std::fmt;

use strum::EnumString;

pub mod escape;
pub mod intern;
pub mod lexer;
pub mod resolve;

/// A source position. File names and enclosing function names are interned
/// for the lifetime of the process (see [`intern`]), which keeps locations
/// `Copy` and lets diagnostics print them at any point of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    pub file: &'static str,
    /// 1-based.
    pub line: u32,
    /// 1-based; tabs count as one column.
    pub column: u32,
    pub function: Option<&'static str>,
}

impl Location {
    pub fn new(file: &'static str, line: u32, column: u32) -> Self {
        Self {
            file,
            line,
            column,
            function: None,
        }
    }

    /// Location of compiler built-ins (intrinsics, synthesized operations).
    pub fn builtin() -> Self {
        Self::new("<built-in>", 0, 0)
    }

    pub fn with_function(mut self, name: &'static str) -> Self {
        self.function = Some(name);
        self
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

#[derive(Debug, Clone)]
pub struct Token {
    pub location: Location,
    /// Raw source text. String and char literals keep their quotes.
    pub text: String,
    pub kind: TokenKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    Word,
    Integer {
        value: u64,
        /// Byte width from an `i8`/`u8`/…/`i64`/`u64` suffix.
        width: Option<u8>,
    },
    /// String literal. The interning pass fills in the id.
    Str {
        id: Option<u64>,
    },
    Char,
    Keyword(Keyword),
    /// A `&fun` keyword after the definition registrar has numbered it.
    AnonFunction(u32),
    AddressOf,
}

impl Token {
    pub fn new(location: Location, text: impl Into<String>, kind: TokenKind) -> Self {
        Self {
            location,
            text: text.into(),
            kind,
        }
    }

    pub fn keyword(&self) -> Option<Keyword> {
        match self.kind {
            TokenKind::Keyword(keyword) => Some(keyword),
            _ => None,
        }
    }
}

/// Keywords are matched exactly and case-sensitively; every other word is an
/// identifier, an integer, or an address-of token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString)]
pub enum Keyword {
    #[strum(serialize = "end")]
    End,
    #[strum(serialize = "if")]
    If,
    #[strum(serialize = "else")]
    Else,
    #[strum(serialize = "while")]
    While,
    #[strum(serialize = "do")]
    Do,
    #[strum(serialize = "include")]
    Include,
    #[strum(serialize = "import")]
    Import,
    #[strum(serialize = "return")]
    Return,
    #[strum(serialize = "true", serialize = "false")]
    Bool,
    #[strum(serialize = "dyn")]
    Dynamic,
    #[strum(
        serialize = "any",
        serialize = "bool",
        serialize = "ptr",
        serialize = "i8",
        serialize = "i16",
        serialize = "i32",
        serialize = "i64",
        serialize = "u8",
        serialize = "u16",
        serialize = "u32",
        serialize = "u64"
    )]
    Typename,
    #[strum(serialize = "is")]
    StackEffectDefinition,
    #[strum(serialize = "--")]
    StackEffectDivider,
    #[strum(
        serialize = "[]byte",
        serialize = "[]u8",
        serialize = "[]u16",
        serialize = "[]u32",
        serialize = "[]u64",
        serialize = "[]usize"
    )]
    Array,
    #[strum(serialize = "constant")]
    Constant,
    #[strum(serialize = "fun", serialize = "&fun")]
    Function,
}
