//! Shell lexing: words, control operators and redirections.
//!
//! This is deliberately a subset of POSIX sh. It understands quoting, escapes,
//! pipelines, lists and simple redirections, and records (without evaluating)
//! variable expansion, command substitution and globbing so that the
//! classifier can fail closed on anything it cannot see through.

use serde::{Deserialize, Serialize};

/// Error produced when input cannot be tokenized.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} at offset {offset}")]
pub struct LexError {
    pub message: String,
    pub offset: usize,
}

impl LexError {
    fn new(message: impl Into<String>, offset: usize) -> Self {
        Self {
            message: message.into(),
            offset,
        }
    }
}

/// A shell word.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Word {
    /// Source text exactly as written, quotes included.
    pub raw: String,
    /// Value after quote removal.
    pub value: String,
    /// Any part of the word was quoted or escaped.
    pub quoted: bool,
    /// Contains an unquoted or double-quoted `$VAR` expansion.
    pub expansion: bool,
    /// Contains `$(..)` or backtick command substitution.
    pub substitution: bool,
    /// Contains an unquoted glob metacharacter.
    pub glob: bool,
    /// Starts with an unquoted `~`.
    pub tilde: bool,
}

impl Word {
    /// Whether the word looks like an option flag (`-r`, `--force`).
    pub fn is_flag(&self) -> bool {
        self.value.len() > 1 && self.value.starts_with('-')
    }
}

/// List and pipeline operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlOp {
    Pipe,
    And,
    Or,
    Semi,
    Background,
}

impl ControlOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pipe => "|",
            Self::And => "&&",
            Self::Or => "||",
            Self::Semi => ";",
            Self::Background => "&",
        }
    }
}

/// Redirection operator kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedirectKind {
    /// `>` / `>|`
    Write,
    /// `>>`
    Append,
    /// `<`
    Read,
    /// `>&` / `<&` (target is a descriptor, not a path)
    Duplicate,
    /// `&>`
    WriteBoth,
    /// `&>>`
    AppendBoth,
}

impl RedirectKind {
    /// Whether the redirection writes to its target path.
    pub fn writes_path(self) -> bool {
        matches!(
            self,
            Self::Write | Self::Append | Self::WriteBoth | Self::AppendBoth
        )
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Write => ">",
            Self::Append => ">>",
            Self::Read => "<",
            Self::Duplicate => ">&",
            Self::WriteBoth => "&>",
            Self::AppendBoth => "&>>",
        }
    }
}

/// A redirection operator, optionally prefixed by a descriptor number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectOp {
    pub fd: Option<u32>,
    pub kind: RedirectKind,
}

impl std::fmt::Display for RedirectOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(fd) = self.fd {
            write!(f, "{fd}")?;
        }
        write!(f, "{}", self.kind.as_str())
    }
}

/// Lexer output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Word(Word),
    Control(ControlOp),
    Redirect(RedirectOp),
}

/// A redirection attached to a simple command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redirect {
    pub op: RedirectOp,
    pub target: Word,
}

/// One simple command inside a list or pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    /// Words including the program name.
    pub words: Vec<Word>,
    pub redirects: Vec<Redirect>,
    /// Operator that connects this segment to the previous one.
    pub connector: Option<ControlOp>,
}

impl Segment {
    pub fn piped_from_previous(&self) -> bool {
        self.connector == Some(ControlOp::Pipe)
    }
}

/// Tokenize a command line.
pub fn tokenize(input: &str) -> Result<Vec<Token>, LexError> {
    let chars: Vec<(usize, char)> = input.char_indices().collect();
    let peek = |i: usize| chars.get(i).map(|(_, c)| *c);
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (offset, c) = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '#' => break,
            '|' => {
                if peek(i + 1) == Some('|') {
                    tokens.push(Token::Control(ControlOp::Or));
                    i += 2;
                } else {
                    tokens.push(Token::Control(ControlOp::Pipe));
                    i += 1;
                }
            }
            '&' => match peek(i + 1) {
                Some('&') => {
                    tokens.push(Token::Control(ControlOp::And));
                    i += 2;
                }
                Some('>') => {
                    if peek(i + 2) == Some('>') {
                        tokens.push(Token::Redirect(RedirectOp {
                            fd: None,
                            kind: RedirectKind::AppendBoth,
                        }));
                        i += 3;
                    } else {
                        tokens.push(Token::Redirect(RedirectOp {
                            fd: None,
                            kind: RedirectKind::WriteBoth,
                        }));
                        i += 2;
                    }
                }
                _ => {
                    tokens.push(Token::Control(ControlOp::Background));
                    i += 1;
                }
            },
            ';' => {
                tokens.push(Token::Control(ControlOp::Semi));
                i += 1;
                while peek(i) == Some(';') {
                    i += 1;
                }
            }
            '<' | '>' => {
                let (op, len) = lex_redirect(&chars, i, None)?;
                tokens.push(Token::Redirect(op));
                i += len;
            }
            _ => {
                let (word, next) = lex_word(input, &chars, i)?;
                let is_fd = !word.quoted
                    && !word.value.is_empty()
                    && word.value.chars().all(|ch| ch.is_ascii_digit());
                if is_fd && matches!(peek(next), Some('<') | Some('>')) {
                    let fd = word
                        .value
                        .parse::<u32>()
                        .map_err(|_| LexError::new("descriptor out of range", offset))?;
                    let (op, len) = lex_redirect(&chars, next, Some(fd))?;
                    tokens.push(Token::Redirect(op));
                    i = next + len;
                } else {
                    tokens.push(Token::Word(word));
                    i = next;
                }
            }
        }
    }

    Ok(tokens)
}

fn lex_redirect(
    chars: &[(usize, char)],
    i: usize,
    fd: Option<u32>,
) -> Result<(RedirectOp, usize), LexError> {
    let peek = |j: usize| chars.get(j).map(|(_, c)| *c);
    let offset = chars[i].0;
    let (kind, len) = match (chars[i].1, peek(i + 1)) {
        ('>', Some('>')) => (RedirectKind::Append, 2),
        ('>', Some('&')) => (RedirectKind::Duplicate, 2),
        ('>', Some('|')) => (RedirectKind::Write, 2),
        ('>', _) => (RedirectKind::Write, 1),
        ('<', Some('<')) => {
            return Err(LexError::new("here-documents are not supported", offset));
        }
        ('<', Some('&')) => (RedirectKind::Duplicate, 2),
        ('<', _) => (RedirectKind::Read, 1),
        _ => return Err(LexError::new("expected redirection", offset)),
    };
    Ok((RedirectOp { fd, kind }, len))
}

fn is_word_break(c: char) -> bool {
    c.is_whitespace() || matches!(c, '|' | '&' | ';' | '<' | '>')
}

fn lex_word(
    input: &str,
    chars: &[(usize, char)],
    start: usize,
) -> Result<(Word, usize), LexError> {
    let mut value = String::new();
    let mut word = Word {
        raw: String::new(),
        value: String::new(),
        quoted: false,
        expansion: false,
        substitution: false,
        glob: false,
        tilde: chars[start].1 == '~',
    };
    let mut i = start;

    while i < chars.len() {
        let (offset, c) = chars[i];
        if is_word_break(c) {
            break;
        }
        match c {
            '\'' => {
                word.quoted = true;
                i += 1;
                loop {
                    match chars.get(i) {
                        Some((_, '\'')) => {
                            i += 1;
                            break;
                        }
                        Some((_, ch)) => {
                            value.push(*ch);
                            i += 1;
                        }
                        None => return Err(LexError::new("unterminated single quote", offset)),
                    }
                }
            }
            '"' => {
                word.quoted = true;
                i += 1;
                loop {
                    match chars.get(i) {
                        Some((_, '"')) => {
                            i += 1;
                            break;
                        }
                        Some((_, '\\')) => match chars.get(i + 1) {
                            Some((_, ch)) if matches!(ch, '"' | '\\' | '$' | '`') => {
                                value.push(*ch);
                                i += 2;
                            }
                            Some(_) => {
                                value.push('\\');
                                i += 1;
                            }
                            None => {
                                return Err(LexError::new("unterminated double quote", offset))
                            }
                        },
                        Some((_, '$')) => {
                            if matches!(chars.get(i + 1), Some((_, '('))) {
                                word.substitution = true;
                            } else {
                                word.expansion = true;
                            }
                            value.push('$');
                            i += 1;
                        }
                        Some((_, '`')) => {
                            word.substitution = true;
                            value.push('`');
                            i += 1;
                        }
                        Some((_, ch)) => {
                            value.push(*ch);
                            i += 1;
                        }
                        None => return Err(LexError::new("unterminated double quote", offset)),
                    }
                }
            }
            '\\' => {
                word.quoted = true;
                match chars.get(i + 1) {
                    Some((_, ch)) => {
                        value.push(*ch);
                        i += 2;
                    }
                    None => return Err(LexError::new("trailing backslash", offset)),
                }
            }
            '$' => {
                if matches!(chars.get(i + 1), Some((_, '('))) {
                    word.substitution = true;
                    let end = skip_balanced(chars, i + 1)
                        .ok_or_else(|| LexError::new("unterminated command substitution", offset))?;
                    for (_, ch) in &chars[i..end] {
                        value.push(*ch);
                    }
                    i = end;
                } else {
                    word.expansion = true;
                    value.push('$');
                    i += 1;
                }
            }
            '`' => {
                word.substitution = true;
                let close = chars[i + 1..]
                    .iter()
                    .position(|(_, ch)| *ch == '`')
                    .ok_or_else(|| LexError::new("unterminated backtick", offset))?;
                let end = i + 1 + close + 1;
                for (_, ch) in &chars[i..end] {
                    value.push(*ch);
                }
                i = end;
            }
            '*' | '?' | '[' => {
                word.glob = true;
                value.push(c);
                i += 1;
            }
            _ => {
                value.push(c);
                i += 1;
            }
        }
    }

    let begin = chars[start].0;
    let end = chars.get(i).map(|(o, _)| *o).unwrap_or(input.len());
    word.raw = input[begin..end].to_string();
    word.value = value;
    Ok((word, i))
}

/// Given the index of an opening `(`, return the index just past its match.
fn skip_balanced(chars: &[(usize, char)], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (idx, (_, ch)) in chars.iter().enumerate().skip(open) {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(idx + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// Group tokens into simple commands.
pub fn split_segments(tokens: Vec<Token>) -> Result<Vec<Segment>, LexError> {
    let mut segments = Vec::new();
    let mut current = Segment {
        words: Vec::new(),
        redirects: Vec::new(),
        connector: None,
    };
    let mut iter = tokens.into_iter().enumerate().peekable();

    while let Some((idx, token)) = iter.next() {
        match token {
            Token::Word(w) => current.words.push(w),
            Token::Redirect(op) => match iter.next() {
                Some((_, Token::Word(target))) => current.redirects.push(Redirect { op, target }),
                _ => return Err(LexError::new(format!("redirection {op} has no target"), idx)),
            },
            Token::Control(op) => {
                if current.words.is_empty() {
                    if current.redirects.is_empty() && op == ControlOp::Background {
                        continue;
                    }
                    return Err(LexError::new(
                        format!("operator {} without a command", op.as_str()),
                        idx,
                    ));
                }
                let finished = std::mem::replace(
                    &mut current,
                    Segment {
                        words: Vec::new(),
                        redirects: Vec::new(),
                        connector: Some(op),
                    },
                );
                segments.push(finished);
            }
        }
    }

    if !current.words.is_empty() {
        segments.push(current);
    } else if !current.redirects.is_empty() {
        return Err(LexError::new("redirection without a command", 0));
    } else if matches!(current.connector, Some(ControlOp::Pipe | ControlOp::And | ControlOp::Or)) {
        return Err(LexError::new("dangling operator at end of input", 0));
    }

    Ok(segments)
}

/// Render segments back into a single canonical command line.
pub fn render(segments: &[Segment]) -> String {
    let mut out = String::new();
    for segment in segments {
        if let Some(op) = segment.connector {
            out.push(' ');
            out.push_str(op.as_str());
            out.push(' ');
        }
        let words: Vec<&str> = segment.words.iter().map(|w| w.raw.as_str()).collect();
        out.push_str(&words.join(" "));
        for redirect in &segment.redirects {
            out.push(' ');
            out.push_str(&redirect.op.to_string());
            out.push(' ');
            out.push_str(&redirect.target.raw);
        }
    }
    out
}

/// Quote a literal for safe inclusion in a command line.
pub fn quote(value: &str) -> String {
    let safe = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./:,@%+=".contains(c));
    if safe {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(input: &str) -> Vec<String> {
        tokenize(input)
            .unwrap()
            .into_iter()
            .filter_map(|t| match t {
                Token::Word(w) => Some(w.value),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_simple_words() {
        assert_eq!(words("rm -rf  /tmp/x"), vec!["rm", "-rf", "/tmp/x"]);
    }

    #[test]
    fn test_quotes_and_escapes() {
        assert_eq!(
            words(r#"echo 'a b' "c \"d\"" e\ f"#),
            vec!["echo", "a b", "c \"d\"", "e f"]
        );
    }

    #[test]
    fn test_unterminated_quote_is_error() {
        let err = tokenize("echo 'oops").unwrap_err();
        assert!(err.message.contains("unterminated"));
    }

    #[test]
    fn test_control_operators() {
        let tokens = tokenize("a | b && c || d; e &").unwrap();
        let ops: Vec<ControlOp> = tokens
            .iter()
            .filter_map(|t| match t {
                Token::Control(op) => Some(*op),
                _ => None,
            })
            .collect();
        assert_eq!(
            ops,
            vec![
                ControlOp::Pipe,
                ControlOp::And,
                ControlOp::Or,
                ControlOp::Semi,
                ControlOp::Background
            ]
        );
    }

    #[test]
    fn test_redirects_with_descriptors() {
        let segments = split_segments(tokenize("cmd > out.txt 2>&1").unwrap()).unwrap();
        assert_eq!(segments.len(), 1);
        let redirects = &segments[0].redirects;
        assert_eq!(redirects.len(), 2);
        assert_eq!(redirects[0].op.kind, RedirectKind::Write);
        assert_eq!(redirects[0].target.value, "out.txt");
        assert_eq!(redirects[1].op.fd, Some(2));
        assert_eq!(redirects[1].op.kind, RedirectKind::Duplicate);
    }

    #[test]
    fn test_flags_substitution_and_globs() {
        let tokens = tokenize("rm $(cat list) $HOME/x /data/*").unwrap();
        let ws: Vec<Word> = tokens
            .into_iter()
            .filter_map(|t| match t {
                Token::Word(w) => Some(w),
                _ => None,
            })
            .collect();
        assert!(ws[1].substitution);
        assert!(ws[2].expansion);
        assert!(ws[3].glob);
        assert!(!ws[0].glob);
    }

    #[test]
    fn test_single_quotes_suppress_expansion() {
        let tokens = tokenize("echo '$HOME'").unwrap();
        match &tokens[1] {
            Token::Word(w) => {
                assert!(!w.expansion);
                assert_eq!(w.value, "$HOME");
            }
            other => panic!("expected word, got {other:?}"),
        }
    }

    #[test]
    fn test_segments_and_connectors() {
        let segments = split_segments(tokenize("curl x | sh").unwrap()).unwrap();
        assert_eq!(segments.len(), 2);
        assert!(segments[1].piped_from_previous());
        assert_eq!(render(&segments), "curl x | sh");
    }

    #[test]
    fn test_dangling_pipe_is_error() {
        assert!(split_segments(tokenize("ls |").unwrap()).is_err());
    }

    #[test]
    fn test_render_normalizes_whitespace() {
        let segments = split_segments(tokenize("  ls    -la   'my dir'  ").unwrap()).unwrap();
        assert_eq!(render(&segments), "ls -la 'my dir'");
    }

    #[test]
    fn test_quote() {
        assert_eq!(quote("/tmp/a"), "/tmp/a");
        assert_eq!(quote("a b"), "'a b'");
        assert_eq!(quote("it's"), r"'it'\''s'");
        assert_eq!(quote(""), "''");
    }
}
