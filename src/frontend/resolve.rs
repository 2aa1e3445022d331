//! Include and import resolution.
//!
//! Repeatedly finds the earliest `include`/`import` keyword, requires the
//! token before it to be a string literal, and splices the lexed contents of
//! the referenced file in place of the pair. `import` appends the configured
//! source extension and is deduplicated by canonical filesystem path, so a
//! repeated import erases the pair and splices nothing.

use std::path::{Path, PathBuf};

use hashbrown::HashSet;

use crate::{
    compiler::Compiler,
    frontend::{
        intern::intern_str,
        lexer, Keyword, Token, TokenKind,
    },
    report::CResult,
};

pub fn resolve_includes(compiler: &Compiler, tokens: &mut Vec<Token>) -> CResult<()> {
    let mut already_imported: HashSet<PathBuf> = HashSet::new();

    loop {
        let Some(index) = tokens.iter().position(|t| {
            matches!(t.keyword(), Some(Keyword::Include | Keyword::Import))
        }) else {
            return Ok(());
        };

        let keyword = tokens[index].keyword().unwrap();
        let keyword_location = tokens[index].location;

        if index == 0 || !matches!(tokens[index - 1].kind, TokenKind::Str { .. }) {
            let name = if keyword == Keyword::Import {
                "import"
            } else {
                "include"
            };
            return Err(compiler.reporter.fatal_at(
                keyword_location,
                format!("`{name}` requires a preceding path string"),
            ));
        }

        // The path is the raw literal text, not the escape-decoded payload.
        let path_token = &tokens[index - 1];
        let mut requested = path_token.text[1..path_token.text.len() - 1].to_string();
        if keyword == Keyword::Import {
            requested.push_str(&compiler.options.import_extension);
        }

        let includer_dir = Path::new(keyword_location.file)
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();

        let Some(resolved) = search_include_path(compiler, &includer_dir, Path::new(&requested))
        else {
            return Err(compiler
                .reporter
                .fatal_at(keyword_location, format!("cannot find file {requested}")));
        };

        if keyword == Keyword::Import {
            let canonical = resolved.canonicalize().unwrap_or_else(|_| resolved.clone());
            if !already_imported.insert(canonical) {
                tokens.drain(index - 1..=index);
                continue;
            }
        }

        let contents = match std::fs::read_to_string(&resolved) {
            Ok(contents) => contents,
            Err(error) => {
                return Err(compiler.reporter.fatal_at(
                    keyword_location,
                    format!("file {} cannot be opened: {error}", resolved.display()),
                ));
            }
        };

        let mut included = Vec::new();
        lexer::lex(
            &compiler.reporter,
            &contents,
            intern_str(&resolved.to_string_lossy()),
            &mut included,
        )?;

        tokens.splice(index - 1..=index, included);
    }
}

/// Multi-segment paths are first tried relative to the including file's
/// directory; afterwards the configured include directories in order.
fn search_include_path(
    compiler: &Compiler,
    includer_dir: &Path,
    requested: &Path,
) -> Option<PathBuf> {
    let has_parent = requested
        .parent()
        .is_some_and(|parent| !parent.as_os_str().is_empty());

    if has_parent {
        let local = includer_dir.join(requested);
        if local.is_file() {
            return Some(local);
        }
    }

    for directory in &compiler.options.include_search_paths {
        let candidate = directory.join(requested);
        if candidate.is_file() {
            return Some(candidate);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use std::fs;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::compiler::test_support::test_compiler;

    struct TestDir(PathBuf);

    impl TestDir {
        fn new(label: &str) -> Self {
            let path = std::env::temp_dir().join(format!(
                "stacky-resolve-{label}-{}",
                std::process::id()
            ));
            let _ = fs::remove_dir_all(&path);
            fs::create_dir_all(&path).unwrap();
            Self(path)
        }

        fn write(&self, name: &str, contents: &str) -> PathBuf {
            let path = self.0.join(name);
            fs::write(&path, contents).unwrap();
            path
        }
    }

    impl Drop for TestDir {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.0);
        }
    }

    fn lex_file(compiler: &Compiler, path: &Path) -> Vec<Token> {
        let contents = fs::read_to_string(path).unwrap();
        let mut tokens = Vec::new();
        lexer::lex(
            &compiler.reporter,
            &contents,
            intern_str(&path.to_string_lossy()),
            &mut tokens,
        )
        .unwrap();
        tokens
    }

    fn words_of(tokens: &[Token]) -> Vec<&str> {
        tokens.iter().map(|t| t.text.as_str()).collect()
    }

    #[test]
    fn include_splices_in_place() {
        let dir = TestDir::new("include");
        dir.write("util.stacky", "1 2 +");
        let main = dir.write("main.stacky", "\"util.stacky\" include drop");

        let mut compiler = test_compiler();
        compiler.options.include_search_paths = vec![dir.0.clone()];

        let mut tokens = lex_file(&compiler, &main);
        resolve_includes(&compiler, &mut tokens).unwrap();

        assert_eq!(words_of(&tokens), vec!["1", "2", "+", "drop"]);
    }

    #[test]
    fn include_splices_every_time() {
        let dir = TestDir::new("include-twice");
        dir.write("util.stacky", "7");
        let main = dir.write(
            "main.stacky",
            "\"util.stacky\" include \"util.stacky\" include",
        );

        let mut compiler = test_compiler();
        compiler.options.include_search_paths = vec![dir.0.clone()];

        let mut tokens = lex_file(&compiler, &main);
        resolve_includes(&compiler, &mut tokens).unwrap();

        assert_eq!(words_of(&tokens), vec!["7", "7"]);
    }

    #[test]
    fn import_deduplicates_by_canonical_path() {
        let dir = TestDir::new("import");
        dir.write("util.stacky", "3 4 *");
        // Both files import util; the second import must become a no-op.
        dir.write("a.stacky", "\"util\" import");
        let main = dir.write("main.stacky", "\"a\" import \"util\" import 9");

        let mut compiler = test_compiler();
        compiler.options.include_search_paths = vec![dir.0.clone()];

        let mut tokens = lex_file(&compiler, &main);
        resolve_includes(&compiler, &mut tokens).unwrap();

        assert_eq!(words_of(&tokens), vec!["3", "4", "*", "9"]);
    }

    #[test]
    fn missing_file_is_fatal() {
        let dir = TestDir::new("missing");
        let main = dir.write("main.stacky", "\"nope\" import");

        let mut compiler = test_compiler();
        compiler.options.include_search_paths = vec![dir.0.clone()];

        let mut tokens = lex_file(&compiler, &main);
        assert!(resolve_includes(&compiler, &mut tokens).is_err());
    }

    #[test]
    fn include_without_path_is_fatal() {
        let compiler = test_compiler();
        let mut tokens = Vec::new();
        lexer::lex(&compiler.reporter, "include", "<test>", &mut tokens).unwrap();
        assert!(resolve_includes(&compiler, &mut tokens).is_err());
    }
}
