//! Indentation-aware tokenizer for the restricted code language.
//!
//! Produces a flat token stream with `Newline`/`Indent`/`Dedent` markers.
//! Statements keep their source line number for error reporting. Constructs
//! outside the language (lambda, class, exception handling, ...) are
//! rejected here, before any parsing happens.

use crate::error::EvalError;

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    Kw(Kw),
    Newline,
    Indent,
    Dedent,
    Plus,
    Minus,
    Star,
    DblStar,
    Slash,
    DblSlash,
    Percent,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Assign,
    AugAssign(AugOp),
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Dot,
    Eof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AugOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kw {
    If,
    Elif,
    Else,
    For,
    While,
    Def,
    Return,
    Break,
    Continue,
    Import,
    As,
    In,
    Not,
    And,
    Or,
    True,
    False,
    None,
    Pass,
}

/// Statement-level keywords that exist in the host language family but are
/// outside this sandbox. Naming one is a compile-time security rejection.
const FORBIDDEN_KEYWORDS: &[&str] = &[
    "lambda", "class", "try", "except", "finally", "raise", "with", "global", "nonlocal", "del",
    "yield", "assert", "from", "async", "await", "is",
];

#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub tok: Tok,
    pub line: usize,
}

pub fn lex(source: &str) -> Result<Vec<Spanned>, EvalError> {
    let mut tokens: Vec<Spanned> = Vec::new();
    let mut indents: Vec<usize> = vec![0];
    let mut bracket_depth = 0usize;

    for (idx, raw_line) in source.lines().enumerate() {
        let line_no = idx + 1;
        let body = raw_line.trim_end();
        let trimmed = body.trim_start();
        if bracket_depth == 0 {
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let indent = indent_width(body);
            adjust_indent(&mut tokens, &mut indents, indent, line_no)?;
        }
        lex_line(trimmed, line_no, &mut tokens, &mut bracket_depth)?;
        if bracket_depth == 0 {
            tokens.push(Spanned {
                tok: Tok::Newline,
                line: line_no,
            });
        }
    }

    if bracket_depth != 0 {
        return Err(EvalError::Evaluation(
            "unbalanced brackets at end of code block".to_string(),
        ));
    }
    let last_line = tokens.last().map_or(1, |s| s.line);
    while indents.len() > 1 {
        indents.pop();
        tokens.push(Spanned {
            tok: Tok::Dedent,
            line: last_line,
        });
    }
    tokens.push(Spanned {
        tok: Tok::Eof,
        line: last_line,
    });
    Ok(tokens)
}

/// Tabs count as four columns.
fn indent_width(line: &str) -> usize {
    let mut width = 0;
    for c in line.chars() {
        match c {
            ' ' => width += 1,
            '\t' => width += 4,
            _ => break,
        }
    }
    width
}

fn adjust_indent(
    tokens: &mut Vec<Spanned>,
    indents: &mut Vec<usize>,
    indent: usize,
    line: usize,
) -> Result<(), EvalError> {
    let current = *indents.last().unwrap_or(&0);
    if indent > current {
        indents.push(indent);
        tokens.push(Spanned {
            tok: Tok::Indent,
            line,
        });
    } else if indent < current {
        while indents.len() > 1 && *indents.last().unwrap() > indent {
            indents.pop();
            tokens.push(Spanned {
                tok: Tok::Dedent,
                line,
            });
        }
        if *indents.last().unwrap() != indent {
            return Err(EvalError::Evaluation(format!(
                "inconsistent indentation at line {line}"
            )));
        }
    }
    Ok(())
}

fn lex_line(
    text: &str,
    line: usize,
    tokens: &mut Vec<Spanned>,
    bracket_depth: &mut usize,
) -> Result<(), EvalError> {
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;
    let mut push = |tok: Tok| {
        tokens.push(Spanned { tok, line });
    };

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' => i += 1,
            '#' => break,
            '0'..='9' => {
                let start = i;
                let mut is_float = false;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '_') {
                    i += 1;
                }
                if i < chars.len() && chars[i] == '.' {
                    is_float = true;
                    i += 1;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
                if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                    is_float = true;
                    i += 1;
                    if i < chars.len() && (chars[i] == '+' || chars[i] == '-') {
                        i += 1;
                    }
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
                let raw: String = chars[start..i].iter().filter(|c| **c != '_').collect();
                if is_float {
                    let value: f64 = raw.parse().map_err(|_| {
                        EvalError::Evaluation(format!("malformed number '{raw}' at line {line}"))
                    })?;
                    push(Tok::Float(value));
                } else {
                    let value: i64 = raw.parse().map_err(|_| {
                        EvalError::Evaluation(format!("malformed integer '{raw}' at line {line}"))
                    })?;
                    push(Tok::Int(value));
                }
            }
            '.' if chars.get(i + 1).is_some_and(|c| c.is_ascii_digit()) => {
                let start = i;
                i += 1;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                let raw: String = chars[start..i].iter().collect();
                let value: f64 = raw.parse().map_err(|_| {
                    EvalError::Evaluation(format!("malformed number '{raw}' at line {line}"))
                })?;
                push(Tok::Float(value));
            }
            'a'..='z' | 'A'..='Z' | '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '_')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                if FORBIDDEN_KEYWORDS.contains(&word.as_str()) {
                    return Err(EvalError::Security(format!(
                        "'{word}' is not allowed (line {line})"
                    )));
                }
                let tok = match word.as_str() {
                    "if" => Tok::Kw(Kw::If),
                    "elif" => Tok::Kw(Kw::Elif),
                    "else" => Tok::Kw(Kw::Else),
                    "for" => Tok::Kw(Kw::For),
                    "while" => Tok::Kw(Kw::While),
                    "def" => Tok::Kw(Kw::Def),
                    "return" => Tok::Kw(Kw::Return),
                    "break" => Tok::Kw(Kw::Break),
                    "continue" => Tok::Kw(Kw::Continue),
                    "import" => Tok::Kw(Kw::Import),
                    "as" => Tok::Kw(Kw::As),
                    "in" => Tok::Kw(Kw::In),
                    "not" => Tok::Kw(Kw::Not),
                    "and" => Tok::Kw(Kw::And),
                    "or" => Tok::Kw(Kw::Or),
                    "True" => Tok::Kw(Kw::True),
                    "False" => Tok::Kw(Kw::False),
                    "None" => Tok::Kw(Kw::None),
                    "pass" => Tok::Kw(Kw::Pass),
                    _ => Tok::Ident(word),
                };
                push(tok);
            }
            '"' | '\'' => {
                let quote = c;
                i += 1;
                let mut value = String::new();
                loop {
                    match chars.get(i) {
                        None => {
                            return Err(EvalError::Evaluation(format!(
                                "unterminated string at line {line}"
                            )));
                        }
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some('\\') => {
                            let escaped = chars.get(i + 1).copied().ok_or_else(|| {
                                EvalError::Evaluation(format!(
                                    "unterminated escape at line {line}"
                                ))
                            })?;
                            value.push(match escaped {
                                'n' => '\n',
                                't' => '\t',
                                '\\' => '\\',
                                '\'' => '\'',
                                '"' => '"',
                                other => other,
                            });
                            i += 2;
                        }
                        Some(&ch) => {
                            value.push(ch);
                            i += 1;
                        }
                    }
                }
                push(Tok::Str(value));
            }
            '+' | '-' | '*' | '/' | '%' => {
                let (tok, width) = lex_operator(&chars, i);
                push(tok);
                i += width;
                continue;
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    push(Tok::Eq);
                    i += 2;
                } else {
                    push(Tok::Assign);
                    i += 1;
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    push(Tok::Ne);
                    i += 2;
                } else {
                    return Err(EvalError::Security(format!(
                        "'!' is not allowed (line {line})"
                    )));
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    push(Tok::Le);
                    i += 2;
                } else {
                    push(Tok::Lt);
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    push(Tok::Ge);
                    i += 2;
                } else {
                    push(Tok::Gt);
                    i += 1;
                }
            }
            '(' => {
                *bracket_depth += 1;
                push(Tok::LParen);
                i += 1;
            }
            ')' => {
                *bracket_depth = bracket_depth.saturating_sub(1);
                push(Tok::RParen);
                i += 1;
            }
            '[' => {
                *bracket_depth += 1;
                push(Tok::LBracket);
                i += 1;
            }
            ']' => {
                *bracket_depth = bracket_depth.saturating_sub(1);
                push(Tok::RBracket);
                i += 1;
            }
            '{' => {
                *bracket_depth += 1;
                push(Tok::LBrace);
                i += 1;
            }
            '}' => {
                *bracket_depth = bracket_depth.saturating_sub(1);
                push(Tok::RBrace);
                i += 1;
            }
            ',' => {
                push(Tok::Comma);
                i += 1;
            }
            ':' => {
                push(Tok::Colon);
                i += 1;
            }
            '.' => {
                push(Tok::Dot);
                i += 1;
            }
            other => {
                return Err(EvalError::Security(format!(
                    "character '{other}' is not allowed (line {line})"
                )));
            }
        }
    }
    Ok(())
}

/// Arithmetic operators and their augmented-assignment forms.
fn lex_operator(chars: &[char], i: usize) -> (Tok, usize) {
    let c = chars[i];
    let next = chars.get(i + 1).copied();
    let next2 = chars.get(i + 2).copied();
    match (c, next, next2) {
        ('*', Some('*'), Some('=')) => (Tok::AugAssign(AugOp::Pow), 3),
        ('*', Some('*'), _) => (Tok::DblStar, 2),
        ('*', Some('='), _) => (Tok::AugAssign(AugOp::Mul), 2),
        ('*', _, _) => (Tok::Star, 1),
        ('/', Some('/'), Some('=')) => (Tok::AugAssign(AugOp::FloorDiv), 3),
        ('/', Some('/'), _) => (Tok::DblSlash, 2),
        ('/', Some('='), _) => (Tok::AugAssign(AugOp::Div), 2),
        ('/', _, _) => (Tok::Slash, 1),
        ('+', Some('='), _) => (Tok::AugAssign(AugOp::Add), 2),
        ('+', _, _) => (Tok::Plus, 1),
        ('-', Some('='), _) => (Tok::AugAssign(AugOp::Sub), 2),
        ('-', _, _) => (Tok::Minus, 1),
        ('%', Some('='), _) => (Tok::AugAssign(AugOp::Mod), 2),
        ('%', _, _) => (Tok::Percent, 1),
        _ => unreachable!("lex_operator called on non-operator"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(source: &str) -> Vec<Tok> {
        lex(source).unwrap().into_iter().map(|s| s.tok).collect()
    }

    #[test]
    fn simple_assignment() {
        assert_eq!(
            toks("x = 1"),
            vec![
                Tok::Ident("x".into()),
                Tok::Assign,
                Tok::Int(1),
                Tok::Newline,
                Tok::Eof
            ]
        );
    }

    #[test]
    fn indentation_produces_indent_dedent_pairs() {
        let tokens = toks("if x:\n    y = 1\nz = 2");
        assert!(tokens.contains(&Tok::Indent));
        assert!(tokens.contains(&Tok::Dedent));
        let indent_pos = tokens.iter().position(|t| *t == Tok::Indent).unwrap();
        let dedent_pos = tokens.iter().position(|t| *t == Tok::Dedent).unwrap();
        assert!(indent_pos < dedent_pos);
    }

    #[test]
    fn dangling_indents_close_at_eof() {
        let tokens = toks("if x:\n    if y:\n        z = 1");
        let dedents = tokens.iter().filter(|t| **t == Tok::Dedent).count();
        assert_eq!(dedents, 2);
    }

    #[test]
    fn brackets_join_lines() {
        let tokens = toks("xs = [1,\n      2,\n      3]");
        let newlines = tokens.iter().filter(|t| **t == Tok::Newline).count();
        assert_eq!(newlines, 1);
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let tokens = toks("# setup\n\nx = 1  # inline\n");
        assert_eq!(
            tokens,
            vec![
                Tok::Ident("x".into()),
                Tok::Assign,
                Tok::Int(1),
                Tok::Newline,
                Tok::Eof
            ]
        );
    }

    #[test]
    fn augmented_operators() {
        assert_eq!(toks("x += 1")[1], Tok::AugAssign(AugOp::Add));
        assert_eq!(toks("x //= 2")[1], Tok::AugAssign(AugOp::FloorDiv));
        assert_eq!(toks("x **= 2")[1], Tok::AugAssign(AugOp::Pow));
    }

    #[test]
    fn numbers_split_int_and_float() {
        assert_eq!(toks("1")[0], Tok::Int(1));
        assert_eq!(toks("1.5")[0], Tok::Float(1.5));
        assert_eq!(toks("1e3")[0], Tok::Float(1000.0));
        assert_eq!(toks("1_000")[0], Tok::Int(1000));
    }

    #[test]
    fn strings_with_escapes() {
        assert_eq!(toks("s = 'a\\nb'")[2], Tok::Str("a\nb".into()));
        assert_eq!(toks("s = \"q\"")[2], Tok::Str("q".into()));
    }

    #[test]
    fn forbidden_keywords_are_security_errors() {
        for source in [
            "lambda x: x",
            "class A: pass",
            "try:\n    pass",
            "raise ValueError",
            "with open('f') as f: pass",
            "del x",
            "from os import path",
            "x = yield",
        ] {
            let err = lex(source).unwrap_err();
            assert!(
                matches!(err, EvalError::Security(_)),
                "{source}: {err}"
            );
        }
    }

    #[test]
    fn forbidden_characters_are_security_errors() {
        for source in ["x = a @ b", "x = a | b", "x = ~a", "x = a ^ b"] {
            let err = lex(source).unwrap_err();
            assert!(matches!(err, EvalError::Security(_)), "{source}");
        }
    }

    #[test]
    fn inconsistent_dedent_is_reported() {
        let err = lex("if x:\n        y = 1\n    z = 2").unwrap_err();
        assert!(err.to_string().contains("inconsistent indentation"));
    }
}
