//! Bidirectional path translation between the host and sandbox namespaces.
//!
//! Tokens the lexer classifies as [`TokenKind::PathLike`] are rewritten, and
//! so are quoted words holding an absolute path. Flags, globs and
//! substitutions are carried through byte for byte. For a bare path token
//! only the directory prefix is replaced, so any escaping in the remainder
//! survives; a quoted path is re-quoted as a whole.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::lexer::{self, TokenKind};
use crate::sandbox::mounts::MountTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    HostToSandbox,
    SandboxToHost,
}

#[derive(Debug, Clone)]
pub struct PathTranslator {
    mounts: Arc<MountTable>,
    host_home: PathBuf,
    sandbox_home: PathBuf,
}

impl PathTranslator {
    pub fn new(
        mounts: Arc<MountTable>,
        host_home: impl Into<PathBuf>,
        sandbox_home: impl Into<PathBuf>,
    ) -> Self {
        Self {
            mounts,
            host_home: host_home.into(),
            sandbox_home: sandbox_home.into(),
        }
    }

    pub fn mounts(&self) -> &Arc<MountTable> {
        &self.mounts
    }

    pub fn host_home(&self) -> &Path {
        &self.host_home
    }

    pub fn sandbox_home(&self) -> &Path {
        &self.sandbox_home
    }

    /// Rewrite every path-like token of `text` into the other namespace.
    pub fn translate(&self, text: &str, direction: Direction) -> String {
        let mut out = String::with_capacity(text.len());
        let mut cursor = 0;

        for token in lexer::tokenize(text) {
            let rewritten = match token.kind {
                TokenKind::PathLike => self.translate_path(&token.text, direction),
                TokenKind::Quoted => self.translate_quoted(&token.text, direction),
                _ => None,
            };
            if let Some(rewritten) = rewritten {
                out.push_str(&text[cursor..token.span.start]);
                out.push_str(&rewritten);
                cursor = token.span.end;
            }
        }

        out.push_str(&text[cursor..]);
        out
    }

    /// Translate a single unquoted path word. `None` means "leave as is".
    pub fn translate_path(&self, raw: &str, direction: Direction) -> Option<String> {
        match direction {
            Direction::HostToSandbox => self.host_to_sandbox(raw, join_raw),
            Direction::SandboxToHost => self.sandbox_to_host(raw, join_raw),
        }
    }

    /// Quoted text is literal to the shell, so `~` and aliases stay as they
    /// are and only absolute paths move. Words that still expand something
    /// inside double quotes are left alone.
    fn translate_quoted(&self, raw: &str, direction: Direction) -> Option<String> {
        let single_quoted_only = raw.len() >= 2
            && raw.starts_with('\'')
            && raw.ends_with('\'')
            && raw.matches('\'').count() == 2;
        if raw.contains(['$', '`']) && !single_quoted_only {
            return None;
        }
        let text = lexer::unquote(raw);
        if !text.starts_with('/') {
            return None;
        }
        let mapped = match direction {
            Direction::HostToSandbox => self.host_to_sandbox(&text, join_plain),
            Direction::SandboxToHost => self.sandbox_to_host(&text, join_plain),
        }?;
        (mapped != text).then(|| single_quote(&mapped))
    }

    fn host_to_sandbox(&self, raw: &str, join: Join) -> Option<String> {
        if let Some(alias) = lexer::alias_prefix(raw) {
            let mount = self.mounts.by_alias(alias)?;
            return Some(join(&mount.sandbox_path, &raw[alias.len()..]));
        }

        let expanded = expand_tilde(raw, &self.host_home, join);
        let path = expanded.as_deref().unwrap_or(raw);

        // Already in the sandbox namespace: leave it, which keeps translation idempotent.
        if self
            .mounts
            .iter()
            .any(|m| strip_dir(path, &m.sandbox_path).is_some())
        {
            return expanded;
        }

        // Host directories may nest (a workspace under Documents), so the deepest wins.
        let by_mount = self
            .mounts
            .iter()
            .filter_map(|m| strip_dir(path, &m.host_path).map(|rest| (m, rest)))
            .max_by_key(|(m, _)| m.host_path.as_os_str().len());
        if let Some((mount, rest)) = by_mount {
            return Some(join(&mount.sandbox_path, rest));
        }

        if strip_dir(path, &self.sandbox_home).is_some() {
            return expanded;
        }
        if let Some(rest) = strip_dir(path, &self.host_home) {
            return Some(join(&self.sandbox_home, rest));
        }

        expanded
    }

    fn sandbox_to_host(&self, raw: &str, join: Join) -> Option<String> {
        if let Some(alias) = lexer::alias_prefix(raw) {
            let mount = self.mounts.by_alias(alias)?;
            return Some(join(&mount.host_path, &raw[alias.len()..]));
        }

        let expanded = expand_tilde(raw, &self.sandbox_home, join);
        let path = expanded.as_deref().unwrap_or(raw);

        if let Some((mount, rest)) = self
            .mounts
            .iter()
            .find_map(|m| strip_dir(path, &m.sandbox_path).map(|rest| (m, rest)))
        {
            return Some(join(&mount.host_path, rest));
        }
        if let Some(rest) = strip_dir(path, &self.sandbox_home) {
            return Some(join(&self.host_home, rest));
        }

        expanded
    }
}

/// Joins a translated directory with the untouched remainder of a path.
type Join = fn(&Path, &str) -> String;

/// Expand a leading `~` or `~/`; `~user` forms are left alone.
fn expand_tilde(raw: &str, home: &Path, join: Join) -> Option<String> {
    let rest = raw.strip_prefix('~')?;
    if rest.is_empty() || rest.starts_with('/') {
        Some(join(home, rest))
    } else {
        None
    }
}

/// If `raw` is `base` or lies below it, return the remainder (empty or `/…`).
fn strip_dir<'a>(raw: &'a str, base: &Path) -> Option<&'a str> {
    let base = base.to_str()?;
    let rest = raw.strip_prefix(base)?;
    (rest.is_empty() || rest.starts_with('/')).then_some(rest)
}

fn join_raw(base: &Path, rest: &str) -> String {
    format!("{}{}", shell_quote(&base.display().to_string()), rest)
}

fn join_plain(base: &Path, rest: &str) -> String {
    format!("{}{}", base.display(), rest)
}

fn single_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}

/// Quote a path prefix for the shell if it contains anything beyond a
/// conservative set of safe characters.
pub(crate) fn shell_quote(text: &str) -> String {
    let safe = text
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "/._-+@%,:".contains(c));
    if safe {
        text.to_string()
    } else {
        format!("'{}'", text.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::mounts::{MountSpec, test_table};

    fn translator() -> PathTranslator {
        PathTranslator::new(Arc::new(test_table()), "/Users/alice", "/home/user")
    }

    fn to_sandbox(cmd: &str) -> String {
        translator().translate(cmd, Direction::HostToSandbox)
    }

    #[test]
    fn sandbox_paths_pass_through() {
        let cmd = r#"find /home/user/Documents -name "*.pdf" -type f"#;
        assert_eq!(to_sandbox(cmd), cmd);
    }

    #[test]
    fn tilde_and_aliases_map_to_mounts() {
        assert_eq!(to_sandbox("ls ~/Documents"), "ls /home/user/Documents");
        assert_eq!(
            to_sandbox("cat Documents/report.pdf"),
            "cat /home/user/Documents/report.pdf"
        );
        assert_eq!(to_sandbox("ls Desktop"), "ls /home/user/Desktop");
        assert_eq!(to_sandbox("ls ~"), "ls /home/user");
    }

    #[test]
    fn host_paths_map_through_mount_table() {
        assert_eq!(
            to_sandbox("unzip -l /Users/alice/Downloads/a.zip"),
            "unzip -l /home/user/Downloads/a.zip"
        );
        assert_eq!(
            to_sandbox("touch /Users/alice/.sandshell/workspace/new.txt"),
            "touch /home/user/workspace/new.txt"
        );
        assert_eq!(to_sandbox("ls /Users/alice/Music"), "ls /home/user/Music");
    }

    #[test]
    fn flags_globs_and_whitespace_are_preserved() {
        assert_eq!(
            to_sandbox("ls  -la   ~/Desktop/*.png | wc -l"),
            "ls  -la   /home/user/Desktop/*.png | wc -l"
        );
    }

    #[test]
    fn quoted_and_substituted_words_are_left_alone() {
        let quoted = r#"cat "~/Documents/notes.txt""#;
        assert_eq!(to_sandbox(quoted), quoted);

        let substituted = "echo $(ls ~/Documents)";
        assert_eq!(to_sandbox(substituted), substituted);
    }

    #[test]
    fn quoted_absolute_paths_are_translated_whole() {
        let t = translator();
        assert_eq!(
            t.translate(r#"cat "/Users/alice/Documents/tax return.pdf""#, Direction::HostToSandbox),
            "cat '/home/user/Documents/tax return.pdf'"
        );
        assert_eq!(
            t.translate(
                r#"grep -c x "/home/user/workspace/notes.txt""#,
                Direction::SandboxToHost
            ),
            "grep -c x '/Users/alice/.sandshell/workspace/notes.txt'"
        );
        assert_eq!(
            t.translate("ls '/home/user/Downloads/*.zip'", Direction::SandboxToHost),
            "ls '/Users/alice/Downloads/*.zip'"
        );
        // Unmapped or still-expanding words keep their bytes.
        let untouched = [
            r#"cat "/etc/hosts""#,
            r#"ls "/home/user/workspace/$HOME""#,
            "find . -name '*.pdf'",
        ];
        for cmd in untouched {
            assert_eq!(t.translate(cmd, Direction::SandboxToHost), cmd);
        }
    }

    #[test]
    fn unrelated_paths_are_unchanged() {
        assert_eq!(to_sandbox("cat /etc/passwd"), "cat /etc/passwd");
        assert_eq!(to_sandbox("ls ~bob"), "ls ~bob");
        assert_eq!(to_sandbox("cat ./notes.txt"), "cat ./notes.txt");
    }

    #[test]
    fn translation_is_idempotent() {
        for cmd in [
            "ls ~/Documents",
            "cp Downloads/a.zip /Users/alice/.sandshell/workspace/",
            "du -sh ~/Desktop ~/Downloads",
        ] {
            let once = to_sandbox(cmd);
            assert_eq!(to_sandbox(&once), once);
        }
    }

    #[test]
    fn round_trip_returns_to_same_host_location() {
        let t = translator();
        for host in [
            "/Users/alice/Documents/tax/2024.pdf",
            "/Users/alice/Desktop",
            "/Users/alice/.sandshell/workspace/out/",
            "/Users/alice/notes.txt",
        ] {
            let sandbox = t.translate(host, Direction::HostToSandbox);
            assert_ne!(sandbox, host);
            assert_eq!(t.translate(&sandbox, Direction::SandboxToHost), host);
        }
    }

    #[test]
    fn sandbox_to_host_quotes_unsafe_prefixes() {
        let table = MountTable::new(vec![
            MountSpec::read_only("/Users/alice/My Documents", "/home/user/Documents"),
            MountSpec::read_write("/Users/alice/work", "/home/user/workspace"),
        ])
        .unwrap();
        let t = PathTranslator::new(Arc::new(table), "/Users/alice", "/home/user");
        assert_eq!(
            t.translate("cat /home/user/Documents/a.txt", Direction::SandboxToHost),
            "cat '/Users/alice/My Documents'/a.txt"
        );
    }

    #[test]
    fn missing_alias_is_left_alone() {
        let table = MountTable::new(vec![MountSpec::read_write(
            "/Users/alice/work",
            "/home/user/workspace",
        )])
        .unwrap();
        let t = PathTranslator::new(Arc::new(table), "/Users/alice", "/home/user");
        assert_eq!(t.translate("ls Desktop", Direction::HostToSandbox), "ls Desktop");
    }
}
