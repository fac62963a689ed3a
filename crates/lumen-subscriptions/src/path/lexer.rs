//! Tokenizer for the path-expression language.

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub(super) enum Token {
    /// `%previous` / `%current`
    Var(String),
    /// Bare identifier: field names, `and`, `or`, `in`, `true`, `false`,
    /// `empty`, `memberOf`
    Ident(String),
    /// Single-quoted string literal
    Str(String),
    Int(i64),
    Dot,
    LParen,
    RParen,
    Pipe,
    Eq,
    NotEq,
}

#[derive(Debug, Clone, PartialEq)]
pub(super) struct LexError {
    pub message: String,
    pub position: usize,
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at offset {}", self.message, self.position)
    }
}

pub(super) fn tokenize(input: &str) -> Result<Vec<Token>, LexError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '|' => {
                tokens.push(Token::Pipe);
                i += 1;
            }
            '=' => {
                tokens.push(Token::Eq);
                i += 1;
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::NotEq);
                    i += 2;
                } else {
                    return Err(LexError {
                        message: "expected '=' after '!'".into(),
                        position: i,
                    });
                }
            }
            '\'' => {
                let start = i;
                i += 1;
                let mut value = String::new();
                loop {
                    match chars.get(i) {
                        Some('\'') => {
                            i += 1;
                            break;
                        }
                        Some(c) => {
                            value.push(*c);
                            i += 1;
                        }
                        None => {
                            return Err(LexError {
                                message: "unterminated string literal".into(),
                                position: start,
                            });
                        }
                    }
                }
                tokens.push(Token::Str(value));
            }
            '%' => {
                let start = i;
                i += 1;
                let word = read_word(&chars, &mut i);
                if word.is_empty() {
                    return Err(LexError {
                        message: "expected variable name after '%'".into(),
                        position: start,
                    });
                }
                tokens.push(Token::Var(word));
            }
            '0'..='9' | '-' => {
                let start = i;
                let mut literal = String::new();
                if c == '-' {
                    literal.push('-');
                    i += 1;
                }
                while let Some(d) = chars.get(i) {
                    if d.is_ascii_digit() {
                        literal.push(*d);
                        i += 1;
                    } else {
                        break;
                    }
                }
                let value = literal.parse::<i64>().map_err(|_| LexError {
                    message: format!("invalid integer literal '{literal}'"),
                    position: start,
                })?;
                tokens.push(Token::Int(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let word = read_word(&chars, &mut i);
                tokens.push(Token::Ident(word));
            }
            other => {
                return Err(LexError {
                    message: format!("unexpected character '{other}'"),
                    position: i,
                });
            }
        }
    }

    Ok(tokens)
}

fn read_word(chars: &[char], i: &mut usize) -> String {
    let mut word = String::new();
    while let Some(c) = chars.get(*i) {
        if c.is_ascii_alphanumeric() || *c == '_' {
            word.push(*c);
            *i += 1;
        } else {
            break;
        }
    }
    word
}
