//! Quote-aware shell tokenizer.
//!
//! Produces tagged tokens with byte spans into the original command, so the
//! translator can rewrite individual path tokens while every other byte
//! (whitespace, quoting, globs, flags) is carried through verbatim.
//!
//! This is not a shell parser. It understands just enough structure
//! (quotes, escapes, separators, redirections, substitutions) for the
//! validator to reason about sub-commands instead of a flat string.

use std::ops::Range;

/// Directory aliases accepted as path shorthand (`Documents/report.pdf`).
pub const DIRECTORY_ALIASES: &[&str] = &["Desktop", "Documents", "Downloads"];

/// Classification of a single token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Filesystem path (`/x`, `~/x`, `./x`, `../x`, alias shorthand).
    PathLike,
    /// Option flag (`-la`, `--name=x`).
    Flag,
    /// Any other bare word (verbs, patterns, plain file names).
    Literal,
    /// Word starting with a single or double quote.
    Quoted,
    /// Word containing `$(...)`, backticks, or `<(...)`/`>(...)`.
    Substitution,
    /// Separator or redirection operator.
    Operator,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    /// Byte range of this token in the tokenized input.
    pub span: Range<usize>,
}

impl Token {
    pub fn is_operator(&self, op: &str) -> bool {
        self.kind == TokenKind::Operator && self.text == op
    }

    pub fn is_separator(&self) -> bool {
        self.kind == TokenKind::Operator && SEPARATORS.contains(&self.text.as_str())
    }

    pub fn is_redirection(&self) -> bool {
        self.kind == TokenKind::Operator && !self.is_separator()
    }
}

const SEPARATORS: &[&str] = &["|", "||", "&&", ";", "&", "\n"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QuoteState {
    None,
    Single,
    Double,
}

/// In-progress word while scanning.
#[derive(Default)]
struct WordBuf {
    start: Option<usize>,
    has_substitution: bool,
}

/// Tokenize a shell command line.
pub fn tokenize(command: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut word = WordBuf::default();
    let mut quote = QuoteState::None;
    let mut escaped = false;
    // Nesting depth inside `$(`, `<(`, `>(`; whitespace does not split there.
    let mut paren_depth = 0usize;
    let mut in_backtick = false;

    let bytes = command.as_bytes();
    let mut chars = command.char_indices().peekable();

    while let Some((i, ch)) = chars.next() {
        if escaped {
            escaped = false;
            continue;
        }

        match quote {
            QuoteState::Single => {
                if ch == '\'' {
                    quote = QuoteState::None;
                }
                continue;
            }
            QuoteState::Double => {
                match ch {
                    '\\' => escaped = true,
                    '"' => quote = QuoteState::None,
                    '`' => {
                        word.has_substitution = true;
                    }
                    '$' if bytes.get(i + 1) == Some(&b'(') => {
                        word.has_substitution = true;
                    }
                    _ => {}
                }
                continue;
            }
            QuoteState::None => {}
        }

        if ch == '\\' {
            word.start.get_or_insert(i);
            escaped = true;
            continue;
        }

        if in_backtick {
            if ch == '`' {
                in_backtick = false;
            }
            continue;
        }

        if paren_depth > 0 {
            match ch {
                '(' => paren_depth += 1,
                ')' => paren_depth -= 1,
                '\'' => quote = QuoteState::Single,
                '"' => quote = QuoteState::Double,
                _ => {}
            }
            continue;
        }

        match ch {
            '\'' => {
                word.start.get_or_insert(i);
                quote = QuoteState::Single;
            }
            '"' => {
                word.start.get_or_insert(i);
                quote = QuoteState::Double;
            }
            '`' => {
                word.start.get_or_insert(i);
                word.has_substitution = true;
                in_backtick = true;
            }
            '$' if bytes.get(i + 1) == Some(&b'(') => {
                word.start.get_or_insert(i);
                word.has_substitution = true;
                chars.next();
                paren_depth = 1;
            }
            '<' | '>' if bytes.get(i + 1) == Some(&b'(') => {
                flush_word(command, &mut word, i, &mut tokens);
                word.start = Some(i);
                word.has_substitution = true;
                chars.next();
                paren_depth = 1;
            }
            ' ' | '\t' | '\r' => flush_word(command, &mut word, i, &mut tokens),
            '\n' | ';' => {
                flush_word(command, &mut word, i, &mut tokens);
                push_operator(command, i, i + 1, &mut tokens);
            }
            '|' => {
                flush_word(command, &mut word, i, &mut tokens);
                let mut end = i + 1;
                if let Some(&(_, next)) = chars.peek()
                    && (next == '|' || next == '&')
                {
                    chars.next();
                    end += 1;
                }
                let text = if &command[i..end] == "|&" { "|" } else { &command[i..end] };
                tokens.push(Token {
                    kind: TokenKind::Operator,
                    text: text.to_string(),
                    span: i..end,
                });
            }
            '&' => {
                flush_word(command, &mut word, i, &mut tokens);
                let mut end = i + 1;
                match chars.peek().map(|&(_, c)| c) {
                    Some('&') => {
                        chars.next();
                        end += 1;
                    }
                    Some('>') => {
                        chars.next();
                        end += 1;
                        if let Some(&(_, '>')) = chars.peek() {
                            chars.next();
                            end += 1;
                        }
                    }
                    _ => {}
                }
                push_operator(command, i, end, &mut tokens);
            }
            '<' | '>' => {
                // A word made only of digits directly before the operator is a
                // file descriptor (`2>`), not an argument.
                let start = match word.start {
                    Some(s) if command[s..i].bytes().all(|b| b.is_ascii_digit()) => {
                        word = WordBuf::default();
                        s
                    }
                    _ => {
                        flush_word(command, &mut word, i, &mut tokens);
                        i
                    }
                };
                let mut end = i + 1;
                while let Some(&(j, next)) = chars.peek() {
                    let extends = match next {
                        '>' | '<' => j - start < 3 && next == ch,
                        '&' => true,
                        '-' => command[start..j].ends_with('&'),
                        d if d.is_ascii_digit() => command[start..j].ends_with('&'),
                        _ => false,
                    };
                    if !extends {
                        break;
                    }
                    chars.next();
                    end = j + next.len_utf8();
                }
                push_operator(command, start, end, &mut tokens);
            }
            _ => {
                word.start.get_or_insert(i);
            }
        }
    }

    flush_word(command, &mut word, command.len(), &mut tokens);
    tokens
}

fn push_operator(command: &str, start: usize, end: usize, tokens: &mut Vec<Token>) {
    tokens.push(Token {
        kind: TokenKind::Operator,
        text: command[start..end].to_string(),
        span: start..end,
    });
}

fn flush_word(command: &str, word: &mut WordBuf, end: usize, tokens: &mut Vec<Token>) {
    if let Some(start) = word.start.take() {
        let text = &command[start..end];
        tokens.push(Token {
            kind: classify(text, word.has_substitution),
            text: text.to_string(),
            span: start..end,
        });
    }
    word.has_substitution = false;
}

fn classify(text: &str, has_substitution: bool) -> TokenKind {
    if has_substitution {
        TokenKind::Substitution
    } else if text.starts_with('\'') || text.starts_with('"') {
        TokenKind::Quoted
    } else if text.len() > 1 && text.starts_with('-') {
        TokenKind::Flag
    } else if is_path_like(text) {
        TokenKind::PathLike
    } else {
        TokenKind::Literal
    }
}

/// Path-like heuristic shared by tokenizer, translator, and validator.
pub fn is_path_like(text: &str) -> bool {
    if text.starts_with('/')
        || text.starts_with('~')
        || text.starts_with("./")
        || text.starts_with("../")
        || text == "."
        || text == ".."
    {
        return true;
    }
    if alias_prefix(text).is_some() {
        return true;
    }
    text.contains('/') && text.split('/').any(|c| c == "..")
}

/// If `text` is a directory alias (`Documents`) or starts with one
/// (`Documents/x`), return the alias.
pub fn alias_prefix(text: &str) -> Option<&'static str> {
    DIRECTORY_ALIASES.iter().copied().find(|alias| {
        text == *alias
            || text
                .strip_prefix(alias)
                .is_some_and(|rest| rest.starts_with('/'))
    })
}

/// Strip shell quoting and escapes from a word, for analysis only.
pub fn unquote(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut quote = QuoteState::None;
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        match quote {
            QuoteState::Single => {
                if ch == '\'' {
                    quote = QuoteState::None;
                } else {
                    out.push(ch);
                }
            }
            QuoteState::Double => match ch {
                '"' => quote = QuoteState::None,
                '\\' => match chars.peek() {
                    Some(&next) if matches!(next, '"' | '\\' | '$' | '`') => {
                        out.push(next);
                        chars.next();
                    }
                    _ => out.push(ch),
                },
                _ => out.push(ch),
            },
            QuoteState::None => match ch {
                '\'' => quote = QuoteState::Single,
                '"' => quote = QuoteState::Double,
                '\\' => {
                    if let Some(next) = chars.next() {
                        out.push(next);
                    }
                }
                _ => out.push(ch),
            },
        }
    }

    out
}

/// Characters of a word that the shell sees outside any quoting, with their
/// byte offsets. Quote characters and escaped characters are skipped.
fn unquoted_chars(text: &str) -> Vec<(usize, char)> {
    let mut out = Vec::new();
    let mut quote = QuoteState::None;
    let mut chars = text.char_indices();

    while let Some((i, ch)) = chars.next() {
        match quote {
            QuoteState::Single => {
                if ch == '\'' {
                    quote = QuoteState::None;
                }
            }
            QuoteState::Double => match ch {
                '"' => quote = QuoteState::None,
                '\\' => {
                    chars.next();
                }
                _ => {}
            },
            QuoteState::None => match ch {
                '\'' => quote = QuoteState::Single,
                '"' => quote = QuoteState::Double,
                '\\' => {
                    chars.next();
                }
                _ => out.push((i, ch)),
            },
        }
    }

    out
}

/// Whether the shell would brace-expand part of this word (`{a,b}`, `{1..3}`).
/// `{}` as used by `find -exec` does not expand.
pub fn has_brace_expansion(text: &str) -> bool {
    let chars = unquoted_chars(text);
    for (n, &(open, ch)) in chars.iter().enumerate() {
        if ch != '{' {
            continue;
        }
        let mut depth = 0usize;
        for &(close, ch) in &chars[n..] {
            match ch {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        let body = &text[open + 1..close];
                        if body.contains(',') || body.contains("..") {
                            return true;
                        }
                        break;
                    }
                }
                _ => {}
            }
        }
    }
    false
}

/// Whether the word uses ANSI-C (`$'\x2f'`) or locale (`$"..."`) quoting,
/// whose decoded text differs from what is written.
pub fn has_dollar_quote(text: &str) -> bool {
    let bytes = text.as_bytes();
    unquoted_chars(text)
        .iter()
        .any(|&(i, ch)| ch == '$' && matches!(bytes.get(i + 1), Some(b'\'' | b'"')))
}

/// A simple command between separators, with its redirections split out.
#[derive(Debug, Clone, Default)]
pub struct Segment {
    /// Words of the command (verb first), operators excluded.
    pub words: Vec<Token>,
    /// `(operator, target)` pairs; the target is `None` for fd duplications
    /// like `2>&1` or when the line ends after the operator.
    pub redirects: Vec<(Token, Option<Token>)>,
    /// Whether this segment reads from a pipe.
    pub piped: bool,
    /// Whether this segment is terminated by a background `&`.
    pub background: bool,
}

impl Segment {
    pub fn verb(&self) -> Option<&Token> {
        self.words.first()
    }

    pub fn args(&self) -> &[Token] {
        self.words.get(1..).unwrap_or(&[])
    }
}

/// Split a token stream into simple commands.
pub fn segments(tokens: &[Token]) -> Vec<Segment> {
    let mut out = Vec::new();
    let mut current = Segment::default();
    let mut iter = tokens.iter().peekable();

    while let Some(token) = iter.next() {
        if token.is_separator() {
            let piped_next = token.text == "|";
            current.background = token.text == "&";
            if !current.words.is_empty() || !current.redirects.is_empty() {
                out.push(std::mem::take(&mut current));
            } else {
                current = Segment::default();
            }
            current.piped = piped_next;
        } else if token.is_redirection() {
            let duplicates_fd = token.text.contains('&')
                && token
                    .text
                    .ends_with(|c: char| c.is_ascii_digit() || c == '-');
            let target = if duplicates_fd {
                None
            } else {
                iter.next_if(|t| t.kind != TokenKind::Operator).cloned()
            };
            current.redirects.push((token.clone(), target));
        } else {
            current.words.push(token.clone());
        }
    }

    if !current.words.is_empty() || !current.redirects.is_empty() {
        out.push(current);
    }
    out
}
