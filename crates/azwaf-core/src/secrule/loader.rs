//! Rule loading from disk
//!
//! Rule files are parsed with their `include` statements and `@pmf` phrase
//! files resolved relative to the directory of the including file.

use super::ast::Statement;
use super::parser::parse;
use crate::{Result, WafError};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Directory name next to the executable holding the CRS rule sets
pub const RULESET_DIR_NAME: &str = "rulesetfiles";

/// Rules skipped after loading CRS: 942130 relies on backreferences across
/// groups, 942330 on embedded anchors.
const UNSUPPORTED_RULE_IDS: [i64; 2] = [942130, 942330];

const RULESET_PATHS: &[(&str, &str)] = &[
    ("OWASP CRS 3.0", "crs3.0/main.conf"),
    ("OWASP CRS 3.0 with config for regression tests", "crs3.0/main.regressiontesting.conf"),
    ("OWASP CRS 3.1", "crs3.1/main.conf"),
    ("OWASP CRS 3.1 with config for regression tests", "crs3.1/main.regressiontesting.conf"),
    ("OWASP CRS 3.2", "crs3.2/main.conf"),
    ("OWASP CRS 3.2 with config for regression tests", "crs3.2/main.regressiontesting.conf"),
];

/// File system operations the rule loader needs
pub trait RuleLoaderFileSystem: Send + Sync {
    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>>;
    fn abs(&self, path: &Path) -> io::Result<PathBuf>;
    fn eval_symlinks(&self, path: &Path) -> io::Result<PathBuf>;
}

/// The real OS file system
#[derive(Clone, Copy, Debug, Default)]
pub struct OsRuleLoaderFileSystem;

impl RuleLoaderFileSystem for OsRuleLoaderFileSystem {
    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    fn abs(&self, path: &Path) -> io::Result<PathBuf> {
        if path.is_absolute() {
            Ok(path.to_path_buf())
        } else {
            Ok(std::env::current_dir()?.join(path))
        }
    }

    fn eval_symlinks(&self, path: &Path) -> io::Result<PathBuf> {
        std::fs::canonicalize(path)
    }
}

/// Source of the statements for a ruleset id
pub trait RuleLoader: Send + Sync {
    fn rules(&self, ruleset_id: &str) -> Result<Vec<Statement>>;
}

/// Relative main file of a known ruleset id
pub fn ruleset_path(ruleset_id: &str) -> Option<&'static str> {
    RULESET_PATHS.iter().find(|(id, _)| *id == ruleset_id).map(|(_, p)| *p)
}

/// `rulesetfiles` next to the running executable
pub fn default_rules_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf))
        .unwrap_or_default()
        .join(RULESET_DIR_NAME)
}

/// Loads the OWASP CRS rule sets
pub struct CrsRuleLoader {
    fs: Arc<dyn RuleLoaderFileSystem>,
    rules_dir: PathBuf,
}

impl CrsRuleLoader {
    pub fn new(fs: Arc<dyn RuleLoaderFileSystem>, rules_dir: Option<PathBuf>) -> Self {
        Self {
            fs,
            rules_dir: rules_dir.unwrap_or_else(default_rules_dir),
        }
    }
}

impl RuleLoader for CrsRuleLoader {
    fn rules(&self, ruleset_id: &str) -> Result<Vec<Statement>> {
        let rel = ruleset_path(ruleset_id)
            .ok_or_else(|| WafError::RuleLoad(format!("unsupported ruleset: {ruleset_id}")))?;

        let statements = load_rules_from_path(self.fs.as_ref(), &self.rules_dir.join(rel), &[])?;
        Ok(filter_unsupported_rules(statements))
    }
}

/// Loads one SecRule file given up front
pub struct StandaloneRuleLoader {
    fs: Arc<dyn RuleLoaderFileSystem>,
    path: PathBuf,
}

impl StandaloneRuleLoader {
    pub fn new(fs: Arc<dyn RuleLoaderFileSystem>, path: impl Into<PathBuf>) -> Self {
        Self { fs, path: path.into() }
    }

    pub fn load(&self) -> Result<Vec<Statement>> {
        load_rules_from_path(self.fs.as_ref(), &self.path, &[])
    }
}

impl RuleLoader for StandaloneRuleLoader {
    fn rules(&self, _ruleset_id: &str) -> Result<Vec<Statement>> {
        self.load()
    }
}

/// Parse the file at `path`. `parents` holds the resolved paths of every
/// file currently including this one.
fn load_rules_from_path(fs: &dyn RuleLoaderFileSystem, path: &Path, parents: &[PathBuf]) -> Result<Vec<Statement>> {
    let abs = fs
        .abs(path)
        .map_err(|e| WafError::RuleLoad(format!("failed get absolute path for {}: {e}", path.display())))?;
    let resolved = fs
        .eval_symlinks(&abs)
        .map_err(|e| WafError::RuleLoad(format!("failed to eval symlinks for {}: {e}", abs.display())))?;

    if parents.contains(&resolved) {
        return Err(WafError::RuleLoad(format!(
            "cyclic include detect in config file {}",
            resolved.display()
        )));
    }

    let bytes = fs
        .read_file(&resolved)
        .map_err(|e| WafError::RuleLoad(format!("failed to read rule file {}: {e}", resolved.display())))?;
    let text = String::from_utf8_lossy(&bytes);

    let dir = resolved.parent().map(Path::to_path_buf).unwrap_or_default();
    let mut chain = parents.to_vec();
    chain.push(resolved.clone());

    let mut phrases = |file_name: &str| load_phrase_file(fs, &dir.join(file_name));
    let mut includes = |include: &str| {
        let p = Path::new(include);
        let p = if p.is_absolute() { p.to_path_buf() } else { dir.join(p) };
        load_rules_from_path(fs, &p, &chain)
    };

    tracing::debug!(file = %resolved.display(), "Parsing rule file");

    parse(&text, Some(&mut phrases), Some(&mut includes)).map_err(|e| match e {
        WafError::Unsupported(_) => e,
        e => WafError::Parse(format!("error while parsing rule file {}: {e}", resolved.display())),
    })
}

/// Phrases of a `@pmf` file: one per line, blank and `#` lines skipped
fn load_phrase_file(fs: &dyn RuleLoaderFileSystem, path: &Path) -> Result<Vec<String>> {
    let bytes = fs
        .read_file(path)
        .map_err(|e| WafError::RuleLoad(format!("failed to load phrase file {}: {e}", path.display())))?;

    Ok(String::from_utf8_lossy(&bytes)
        .split('\n')
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|l| l.trim().to_string())
        .collect())
}

fn filter_unsupported_rules(statements: Vec<Statement>) -> Vec<Statement> {
    statements
        .into_iter()
        .filter(|s| !matches!(s, Statement::Rule(r) if UNSUPPORTED_RULE_IDS.contains(&r.id)))
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;

    /// In-memory file system; symlinks map one path onto another
    #[derive(Default)]
    pub(crate) struct MockFileSystem {
        pub files: HashMap<PathBuf, Vec<u8>>,
        pub symlinks: HashMap<PathBuf, PathBuf>,
    }

    impl MockFileSystem {
        pub fn with_file(mut self, path: &str, content: &str) -> Self {
            self.files.insert(PathBuf::from(path), content.as_bytes().to_vec());
            self
        }

        pub fn with_symlink(mut self, from: &str, to: &str) -> Self {
            self.symlinks.insert(PathBuf::from(from), PathBuf::from(to));
            self
        }
    }

    impl RuleLoaderFileSystem for MockFileSystem {
        fn read_file(&self, path: &Path) -> io::Result<Vec<u8>> {
            self.files
                .get(path)
                .cloned()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "file not found"))
        }

        fn abs(&self, path: &Path) -> io::Result<PathBuf> {
            if path.is_absolute() {
                Ok(path.to_path_buf())
            } else {
                Ok(Path::new("/cwd").join(path))
            }
        }

        fn eval_symlinks(&self, path: &Path) -> io::Result<PathBuf> {
            Ok(self.symlinks.get(path).cloned().unwrap_or_else(|| path.to_path_buf()))
        }
    }

    fn ids(stmts: &[Statement]) -> Vec<i64> {
        stmts.iter().map(Statement::id).collect()
    }

    #[test]
    fn test_crs_loader_with_includes() {
        let fs = MockFileSystem::default()
            .with_file("/rules/crs3.0/main.conf", "include rules/a.conf\ninclude /abs/b.conf\n")
            .with_file(
                "/rules/crs3.0/rules/a.conf",
                "SecRule ARGS \"x\" \"id:1\"\nSecRule ARGS \"y\" \"id:942130\"\n",
            )
            .with_file("/abs/b.conf", "SecRule ARGS \"@pmf words.data\" \"id:2\"\n")
            .with_file("/abs/words.data", "# comment\none\n\n  two \n");

        let loader = CrsRuleLoader::new(Arc::new(fs), Some(PathBuf::from("/rules")));
        let stmts = loader.rules("OWASP CRS 3.0").unwrap();
        assert_eq!(ids(&stmts), vec![1, 2]);

        let Statement::Rule(r) = &stmts[1] else { panic!() };
        assert_eq!(r.items[0].pm_phrases, vec!["one", "two"]);
    }

    #[test]
    fn test_unknown_ruleset() {
        let loader = CrsRuleLoader::new(Arc::new(MockFileSystem::default()), Some(PathBuf::from("/rules")));
        let err = loader.rules("OWASP CRS 9.9").unwrap_err();
        assert_eq!(err.to_string(), "rule loading error: unsupported ruleset: OWASP CRS 9.9");
    }

    #[test]
    fn test_ruleset_paths() {
        assert_eq!(ruleset_path("OWASP CRS 3.2"), Some("crs3.2/main.conf"));
        assert_eq!(
            ruleset_path("OWASP CRS 3.1 with config for regression tests"),
            Some("crs3.1/main.regressiontesting.conf")
        );
        assert_eq!(ruleset_path("bogus"), None);
    }

    #[test]
    fn test_cyclic_include() {
        let fs = MockFileSystem::default()
            .with_file("/r/a.conf", "include b.conf\n")
            .with_file("/r/b.conf", "include a.conf\n");
        let loader = StandaloneRuleLoader::new(Arc::new(fs), "/r/a.conf");
        let err = loader.load().unwrap_err();
        assert!(err.to_string().contains("cyclic include detect in config file /r/a.conf"), "{err}");
    }

    #[test]
    fn test_cyclic_include_through_symlink() {
        let fs = MockFileSystem::default()
            .with_file("/r/a.conf", "include link.conf\n")
            .with_symlink("/r/link.conf", "/r/a.conf");
        let loader = StandaloneRuleLoader::new(Arc::new(fs), "/r/a.conf");
        assert!(loader.load().unwrap_err().to_string().contains("cyclic include"));
    }

    #[test]
    fn test_same_file_included_twice() {
        let fs = MockFileSystem::default()
            .with_file("/r/a.conf", "include c.conf\ninclude c.conf\n")
            .with_file("/r/c.conf", "SecMarker M\n");
        let loader = StandaloneRuleLoader::new(Arc::new(fs), "/r/a.conf");
        assert_eq!(loader.load().unwrap().len(), 2);
    }

    #[test]
    fn test_relative_standalone_path() {
        let fs = MockFileSystem::default().with_file("/cwd/my.conf", "SecAction \"id:7,nolog\"\n");
        let loader = StandaloneRuleLoader::new(Arc::new(fs), "my.conf");
        assert_eq!(ids(&loader.rules("ignored").unwrap()), vec![7]);
    }

    #[test]
    fn test_missing_file_and_parse_error() {
        let loader = StandaloneRuleLoader::new(Arc::new(MockFileSystem::default()), "/nope.conf");
        assert!(loader.load().unwrap_err().to_string().contains("failed to read rule file /nope.conf"));

        let fs = MockFileSystem::default().with_file("/bad.conf", "SecFoo\n");
        let loader = StandaloneRuleLoader::new(Arc::new(fs), "/bad.conf");
        let err = loader.load().unwrap_err();
        assert_eq!(err.to_string(), "error while parsing rule file /bad.conf: unknown statement on line 1: SecFoo");
    }

    #[test]
    fn test_missing_phrase_file() {
        let fs = MockFileSystem::default().with_file("/r/a.conf", "SecRule ARGS \"@pmf nope.data\" \"id:1\"\n");
        let loader = StandaloneRuleLoader::new(Arc::new(fs), "/r/a.conf");
        assert!(loader.load().unwrap_err().to_string().contains("failed to load phrase file /r/nope.data"));
    }
}
