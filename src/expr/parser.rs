use super::lexer::{Spanned, Token, tokenize};
use super::{Arg, BinaryOp, Expr, UnaryOp};
use crate::error::ParseError;

/// Deepest nesting of groups, blocks and unary operators.
const MAX_NESTING: usize = 256;
/// Tallest tree, counting every link of an operator chain.
const MAX_HEIGHT: usize = 1024;

/// Parses command text into an expression tree.
pub fn parse(text: &str) -> Result<Expr, ParseError> {
    let tokens = tokenize(text)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        end: text.len(),
        nesting: 0,
        height: 0,
    };

    let expr = parser.expr()?;

    match parser.peek() {
        None => Ok(expr),
        Some(_) => Err(parser.error("unexpected trailing input")),
    }
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    end: usize,
    nesting: usize,
    height: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|s| &s.token)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map_or(self.end, |s| s.offset)
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError::new(self.offset(), message)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|s| s.token.clone());
        self.pos += 1;
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token, what: &str) -> Result<(), ParseError> {
        if self.eat(&token) {
            Ok(())
        } else {
            Err(self.error(format!("expected {what}")))
        }
    }

    /// Goes one level down the tree; `nested` also counts towards nesting.
    fn descend(&mut self, nested: bool) -> Result<(), ParseError> {
        self.height += 1;
        self.nesting += usize::from(nested);
        if self.nesting > MAX_NESTING || self.height > MAX_HEIGHT {
            return Err(self.error("expression is nested too deeply"));
        }
        Ok(())
    }

    fn ascend(&mut self, levels: usize, nested: bool) {
        self.height -= levels;
        self.nesting -= usize::from(nested);
    }

    fn expr(&mut self) -> Result<Expr, ParseError> {
        self.descend(true)?;
        let expr = self.or()?;
        self.ascend(1, true);
        Ok(expr)
    }

    fn or(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.and()?;
        let mut links = 0;
        while self.eat(&Token::OrOr) {
            self.descend(false)?;
            links += 1;
            let rhs = self.and()?;
            lhs = binary(BinaryOp::Or, lhs, rhs);
        }
        self.ascend(links, false);
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.comparison()?;
        let mut links = 0;
        while self.eat(&Token::AndAnd) {
            self.descend(false)?;
            links += 1;
            let rhs = self.comparison()?;
            lhs = binary(BinaryOp::And, lhs, rhs);
        }
        self.ascend(links, false);
        Ok(lhs)
    }

    fn comparison(&mut self) -> Result<Expr, ParseError> {
        let lhs = self.sum()?;
        let op = match self.peek() {
            Some(Token::EqEq) => BinaryOp::Eq,
            Some(Token::Ne) => BinaryOp::Ne,
            Some(Token::Lt) => BinaryOp::Lt,
            Some(Token::Le) => BinaryOp::Le,
            Some(Token::Gt) => BinaryOp::Gt,
            Some(Token::Ge) => BinaryOp::Ge,
            _ => return Ok(lhs),
        };
        self.pos += 1;
        let rhs = self.sum()?;
        Ok(binary(op, lhs, rhs))
    }

    fn sum(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.product()?;
        let mut links = 0;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => {
                    self.ascend(links, false);
                    return Ok(lhs);
                }
            };
            self.pos += 1;
            self.descend(false)?;
            links += 1;
            let rhs = self.product()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn product(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.unary()?;
        let mut links = 0;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::Percent) => BinaryOp::Rem,
                _ => {
                    self.ascend(links, false);
                    return Ok(lhs);
                }
            };
            self.pos += 1;
            self.descend(false)?;
            links += 1;
            let rhs = self.unary()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn unary(&mut self) -> Result<Expr, ParseError> {
        let op = match self.peek() {
            Some(Token::Minus) => UnaryOp::Neg,
            Some(Token::Bang) => UnaryOp::Not,
            _ => return self.postfix(),
        };
        self.pos += 1;
        self.descend(true)?;
        let expr = self.unary()?;
        self.ascend(1, true);
        Ok(Expr::Unary {
            op,
            expr: Box::new(expr),
        })
    }

    fn postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.primary()?;
        let mut links = 0;

        loop {
            if matches!(self.peek(), Some(Token::LParen | Token::LBracket)) {
                self.descend(false)?;
                links += 1;
            }
            match self.peek() {
                Some(Token::LParen) => {
                    let Expr::Symbol(callee) = expr else {
                        return Err(self.error("only named functions can be called"));
                    };
                    self.pos += 1;
                    let args = self.args()?;
                    expr = Expr::Call { callee, args };
                }
                Some(Token::LBracket) => {
                    self.pos += 1;
                    let index = self.expr()?;
                    self.expect(Token::RBracket, "']'")?;
                    expr = Expr::Index {
                        target: Box::new(expr),
                        index: Box::new(index),
                    };
                }
                _ => {
                    self.ascend(links, false);
                    return Ok(expr);
                }
            }
        }
    }

    fn args(&mut self) -> Result<Vec<Arg>, ParseError> {
        let mut args = Vec::new();

        loop {
            if self.eat(&Token::RParen) {
                return Ok(args);
            }

            let named = matches!(
                (self.peek(), self.tokens.get(self.pos + 1).map(|s| &s.token)),
                (Some(Token::Ident(_)), Some(Token::Assign))
            );

            let name = if named {
                let Some(Token::Ident(name)) = self.next() else {
                    unreachable!("checked by lookahead");
                };
                self.pos += 1;
                Some(name)
            } else {
                None
            };

            let value = self.expr()?;
            args.push(Arg { name, value });

            if !self.eat(&Token::Comma) {
                self.expect(Token::RParen, "',' or ')'")?;
                return Ok(args);
            }
        }
    }

    fn primary(&mut self) -> Result<Expr, ParseError> {
        let offset = self.offset();

        match self.next() {
            Some(Token::Int(i)) => Ok(Expr::Int(i)),
            Some(Token::Float(f)) => Ok(Expr::Float(f)),
            Some(Token::Str(s)) => Ok(Expr::Str(s)),
            Some(Token::Ident(name)) => match name.as_str() {
                "true" => Ok(Expr::Bool(true)),
                "false" => Ok(Expr::Bool(false)),
                "null" => Ok(Expr::Null),
                "let" => Err(ParseError::new(offset, "'let' is only allowed inside a block")),
                _ => self.path(name),
            },
            Some(Token::LParen) => {
                let expr = self.expr()?;
                self.expect(Token::RParen, "')'")?;
                Ok(expr)
            }
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                loop {
                    if self.eat(&Token::RBracket) {
                        return Ok(Expr::List(items));
                    }
                    items.push(self.expr()?);
                    if !self.eat(&Token::Comma) {
                        self.expect(Token::RBracket, "',' or ']'")?;
                        return Ok(Expr::List(items));
                    }
                }
            }
            Some(Token::LBrace) => self.block(),
            Some(_) => Err(ParseError::new(offset, "expected an expression")),
            None => Err(ParseError::new(offset, "unexpected end of input")),
        }
    }

    fn path(&mut self, head: String) -> Result<Expr, ParseError> {
        let mut name = head;
        while self.eat(&Token::PathSep) {
            match self.next() {
                Some(Token::Ident(part)) => {
                    name.push_str("::");
                    name.push_str(&part);
                }
                _ => return Err(self.error("expected a name after '::'")),
            }
        }
        Ok(Expr::Symbol(name))
    }

    fn block(&mut self) -> Result<Expr, ParseError> {
        let mut bindings = Vec::new();

        while self.peek() == Some(&Token::Ident("let".into())) {
            self.pos += 1;
            let name = match self.next() {
                Some(Token::Ident(name)) => name,
                _ => return Err(self.error("expected a name after 'let'")),
            };
            self.expect(Token::Assign, "'='")?;
            let value = self.expr()?;
            self.expect(Token::Semi, "';'")?;
            bindings.push((name, value));
        }

        let body = self.expr()?;
        self.expect(Token::RBrace, "'}'")?;

        Ok(Expr::Block {
            bindings,
            body: Box::new(body),
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
