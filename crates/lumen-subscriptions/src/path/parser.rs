//! Recursive-descent parser producing the path-expression AST.

use std::fmt;

use super::lexer::Token;

/// Parsed path expression.
#[derive(Debug, Clone, PartialEq)]
pub enum PathExpr {
    Or(Box<PathExpr>, Box<PathExpr>),
    And(Box<PathExpr>, Box<PathExpr>),
    Compare {
        left: Operand,
        op: CompareOp,
        right: Operand,
    },
    In {
        operand: Operand,
        choices: Vec<Literal>,
    },
    /// `accessor.empty()`
    Empty(Accessor),
    /// `accessor.memberOf('valueSetUrl')`
    MemberOf {
        accessor: Accessor,
        value_set: String,
    },
    /// Bare operand in predicate position, e.g. the literal `true`
    Truthy(Operand),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Accessor(Accessor),
    Literal(Literal),
}

/// A variable binding plus a chain of field accessors.
#[derive(Debug, Clone, PartialEq)]
pub struct Accessor {
    pub var: Variable,
    pub segments: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variable {
    Previous,
    Current,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Str(String),
    Int(i64),
    Bool(bool),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParseError(pub String);

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub(super) fn parse(tokens: &[Token]) -> Result<PathExpr, ParseError> {
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.pos != tokens.len() {
        return Err(ParseError(format!(
            "unexpected trailing input at token {}",
            parser.pos
        )));
    }
    Ok(expr)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<&'a Token> {
        let token = self.tokens.get(self.pos);
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: &Token, what: &str) -> Result<(), ParseError> {
        match self.advance() {
            Some(token) if token == expected => Ok(()),
            other => Err(ParseError(format!("expected {what}, found {other:?}"))),
        }
    }

    fn at_keyword(&self, word: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(w)) if w == word)
    }

    fn parse_or(&mut self) -> Result<PathExpr, ParseError> {
        let mut left = self.parse_and()?;
        while self.at_keyword("or") {
            self.advance();
            let right = self.parse_and()?;
            left = PathExpr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<PathExpr, ParseError> {
        let mut left = self.parse_predicate()?;
        while self.at_keyword("and") {
            self.advance();
            let right = self.parse_predicate()?;
            left = PathExpr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_predicate(&mut self) -> Result<PathExpr, ParseError> {
        if self.peek() == Some(&Token::LParen) {
            self.advance();
            let inner = self.parse_or()?;
            self.expect(&Token::RParen, "')'")?;
            return Ok(inner);
        }

        // Accessors ending in a method call are complete predicates.
        let operand = match self.parse_term()? {
            Term::Predicate(expr) => return Ok(expr),
            Term::Operand(operand) => operand,
        };

        match self.peek() {
            Some(Token::Eq) => {
                self.advance();
                let right = self.parse_plain_operand()?;
                Ok(PathExpr::Compare {
                    left: operand,
                    op: CompareOp::Eq,
                    right,
                })
            }
            Some(Token::NotEq) => {
                self.advance();
                let right = self.parse_plain_operand()?;
                Ok(PathExpr::Compare {
                    left: operand,
                    op: CompareOp::Ne,
                    right,
                })
            }
            Some(Token::Ident(w)) if w == "in" => {
                self.advance();
                let choices = self.parse_literal_list()?;
                Ok(PathExpr::In { operand, choices })
            }
            _ => Ok(PathExpr::Truthy(operand)),
        }
    }

    fn parse_plain_operand(&mut self) -> Result<Operand, ParseError> {
        match self.parse_term()? {
            Term::Operand(operand) => Ok(operand),
            Term::Predicate(_) => Err(ParseError(
                "method calls are not valid comparison operands".into(),
            )),
        }
    }

    fn parse_term(&mut self) -> Result<Term, ParseError> {
        match self.advance() {
            Some(Token::Var(name)) => self.parse_accessor(name),
            Some(Token::Str(s)) => Ok(Term::Operand(Operand::Literal(Literal::Str(s.clone())))),
            Some(Token::Int(n)) => Ok(Term::Operand(Operand::Literal(Literal::Int(*n)))),
            Some(Token::Ident(w)) if w == "true" => {
                Ok(Term::Operand(Operand::Literal(Literal::Bool(true))))
            }
            Some(Token::Ident(w)) if w == "false" => {
                Ok(Term::Operand(Operand::Literal(Literal::Bool(false))))
            }
            other => Err(ParseError(format!("expected operand, found {other:?}"))),
        }
    }

    fn parse_accessor(&mut self, var: &str) -> Result<Term, ParseError> {
        let var = match var {
            "previous" => Variable::Previous,
            "current" => Variable::Current,
            other => {
                return Err(ParseError(format!(
                    "unknown variable '%{other}', expected %previous or %current"
                )));
            }
        };

        let mut segments = Vec::new();

        while self.peek() == Some(&Token::Dot) {
            self.advance();
            let name = match self.advance() {
                Some(Token::Ident(name)) => name.clone(),
                other => {
                    return Err(ParseError(format!(
                        "expected field name after '.', found {other:?}"
                    )));
                }
            };

            // A '(' directly after the name makes this a method call,
            // terminating the accessor chain.
            if self.peek() == Some(&Token::LParen) {
                self.advance();
                let accessor = Accessor { var, segments };
                return match name.as_str() {
                    "empty" => {
                        self.expect(&Token::RParen, "')' after empty(")?;
                        Ok(Term::Predicate(PathExpr::Empty(accessor)))
                    }
                    "memberOf" => {
                        let value_set = match self.advance() {
                            Some(Token::Str(url)) => url.clone(),
                            other => {
                                return Err(ParseError(format!(
                                    "memberOf expects a quoted value-set URL, found {other:?}"
                                )));
                            }
                        };
                        self.expect(&Token::RParen, "')' after memberOf(…")?;
                        Ok(Term::Predicate(PathExpr::MemberOf {
                            accessor,
                            value_set,
                        }))
                    }
                    other => Err(ParseError(format!("unknown function '{other}()'"))),
                };
            }

            segments.push(name);
        }

        Ok(Term::Operand(Operand::Accessor(Accessor { var, segments })))
    }

    fn parse_literal_list(&mut self) -> Result<Vec<Literal>, ParseError> {
        self.expect(&Token::LParen, "'(' after 'in'")?;
        let mut choices = Vec::new();
        loop {
            match self.advance() {
                Some(Token::Str(s)) => choices.push(Literal::Str(s.clone())),
                Some(Token::Int(n)) => choices.push(Literal::Int(*n)),
                Some(Token::Ident(w)) if w == "true" => choices.push(Literal::Bool(true)),
                Some(Token::Ident(w)) if w == "false" => choices.push(Literal::Bool(false)),
                other => {
                    return Err(ParseError(format!(
                        "expected literal in 'in' list, found {other:?}"
                    )));
                }
            }
            match self.advance() {
                Some(Token::Pipe) => continue,
                Some(Token::RParen) => break,
                other => {
                    return Err(ParseError(format!(
                        "expected '|' or ')' in 'in' list, found {other:?}"
                    )));
                }
            }
        }
        Ok(choices)
    }
}

enum Term {
    Operand(Operand),
    Predicate(PathExpr),
}
