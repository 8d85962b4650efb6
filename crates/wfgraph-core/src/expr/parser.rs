//! Recursive-descent parser. Precedence, lowest first:
//! `||`, `&&`, `== !=`, `< <= > >=`, unary `!`, primary.

use super::lexer::{Spanned, Token};
use super::{BinaryOp, Context, ContextPath, Expr, ExprError, ExprValue, Function};

pub(crate) struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
}

impl Parser {
    pub(crate) fn new(tokens: Vec<Spanned>) -> Self {
        Self { tokens, pos: 0 }
    }

    pub(crate) fn parse(mut self) -> Result<Expr, ExprError> {
        let expr = self.or()?;
        if let Some(extra) = self.tokens.get(self.pos) {
            return Err(ExprError::UnexpectedToken {
                pos: extra.pos,
                found: extra.token.describe(),
                expected: "end of expression".to_string(),
            });
        }
        Ok(expr)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|s| &s.token)
    }

    fn next(&mut self, expected: &str) -> Result<Spanned, ExprError> {
        let tok = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| ExprError::UnexpectedEnd {
                expected: expected.to_string(),
            })?;
        self.pos += 1;
        Ok(tok)
    }

    fn expect(&mut self, want: Token, expected: &str) -> Result<(), ExprError> {
        let got = self.next(expected)?;
        if got.token == want {
            Ok(())
        } else {
            Err(ExprError::UnexpectedToken {
                pos: got.pos,
                found: got.token.describe(),
                expected: expected.to_string(),
            })
        }
    }

    fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    fn or(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.and()?;
        while self.peek() == Some(&Token::OrOr) {
            self.pos += 1;
            let rhs = self.and()?;
            lhs = Self::binary(BinaryOp::Or, lhs, rhs);
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.equality()?;
        while self.peek() == Some(&Token::AndAnd) {
            self.pos += 1;
            let rhs = self.equality()?;
            lhs = Self::binary(BinaryOp::And, lhs, rhs);
        }
        Ok(lhs)
    }

    fn equality(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.comparison()?;
        loop {
            let op = match self.peek() {
                Some(Token::EqEq) => BinaryOp::Eq,
                Some(Token::NotEq) => BinaryOp::Ne,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.comparison()?;
            lhs = Self::binary(op, lhs, rhs);
        }
    }

    fn comparison(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Lt) => BinaryOp::Lt,
                Some(Token::Le) => BinaryOp::Le,
                Some(Token::Gt) => BinaryOp::Gt,
                Some(Token::Ge) => BinaryOp::Ge,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Self::binary(op, lhs, rhs);
        }
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        let tok = self.next("a value")?;
        match tok.token {
            Token::Str(s) => Ok(Expr::Literal(ExprValue::String(s))),
            Token::Number(n) => Ok(Expr::Literal(ExprValue::Number(n))),
            Token::LParen => {
                let inner = self.or()?;
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            }
            Token::Ident(name) => match name.as_str() {
                "true" => Ok(Expr::Literal(ExprValue::Bool(true))),
                "false" => Ok(Expr::Literal(ExprValue::Bool(false))),
                "null" => Ok(Expr::Literal(ExprValue::Null)),
                _ if self.peek() == Some(&Token::LParen) => self.call(&name),
                _ => self.path(&name),
            },
            other => Err(ExprError::UnexpectedToken {
                pos: tok.pos,
                found: other.describe(),
                expected: "a value".to_string(),
            }),
        }
    }

    fn call(&mut self, name: &str) -> Result<Expr, ExprError> {
        let func = Function::from_name(name)?;
        self.expect(Token::LParen, "'('")?;
        let mut args = Vec::new();
        if self.peek() != Some(&Token::RParen) {
            loop {
                args.push(self.or()?);
                if self.peek() == Some(&Token::Comma) {
                    self.pos += 1;
                } else {
                    break;
                }
            }
        }
        self.expect(Token::RParen, "')'")?;
        if args.len() != func.arity() {
            return Err(ExprError::WrongArity {
                function: func.name().to_string(),
                expected: func.arity(),
                found: args.len(),
            });
        }
        Ok(Expr::Call { func, args })
    }

    fn path(&mut self, head: &str) -> Result<Expr, ExprError> {
        let context = Context::from_name(head)?;
        let mut segments = Vec::new();
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.pos += 1;
                    let tok = self.next("a property name")?;
                    match tok.token {
                        Token::Ident(seg) => segments.push(seg),
                        other => {
                            return Err(ExprError::UnexpectedToken {
                                pos: tok.pos,
                                found: other.describe(),
                                expected: "a property name".to_string(),
                            })
                        }
                    }
                }
                Some(Token::LBracket) => {
                    self.pos += 1;
                    let tok = self.next("an index")?;
                    match tok.token {
                        Token::Str(seg) => segments.push(seg),
                        Token::Number(n) => segments.push(ExprValue::Number(n).render()),
                        other => {
                            return Err(ExprError::UnexpectedToken {
                                pos: tok.pos,
                                found: other.describe(),
                                expected: "an index".to_string(),
                            })
                        }
                    }
                    self.expect(Token::RBracket, "']'")?;
                }
                _ => break,
            }
        }
        Ok(Expr::Ref(ContextPath { context, segments }))
    }
}
