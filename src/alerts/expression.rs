use std::collections::BTreeMap;
use std::fmt;

/// Errors from parsing or evaluating a custom expression.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprError {
    /// Unexpected character in the source
    BadToken { position: usize, found: char },
    /// Expression ended mid-construct
    UnexpectedEnd,
    /// Token that cannot start or continue an expression here
    UnexpectedToken { position: usize, token: String },
    /// Identifier outside the allowed variable set, rejected at parse time
    UnknownVariable(String),
    /// Division by zero during evaluation
    DivisionByZero,
    /// Variable allowed at parse time but missing at evaluation time
    MissingVariable(String),
}

impl fmt::Display for ExprError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExprError::BadToken { position, found } => {
                write!(f, "Unexpected character '{}' at offset {}", found, position)
            }
            ExprError::UnexpectedEnd => write!(f, "Expression ended unexpectedly"),
            ExprError::UnexpectedToken { position, token } => {
                write!(f, "Unexpected token '{}' at offset {}", token, position)
            }
            ExprError::UnknownVariable(name) => {
                write!(f, "Unknown variable '{}': not part of the alert context", name)
            }
            ExprError::DivisionByZero => write!(f, "Division by zero"),
            ExprError::MissingVariable(name) => {
                write!(f, "Variable '{}' missing from evaluation context", name)
            }
        }
    }
}

impl std::error::Error for ExprError {}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Lt,
    Le,
    Gt,
    Ge,
    EqEq,
    NotEq,
    AndAnd,
    OrOr,
    Not,
    LParen,
    RParen,
}

/// A parsed arithmetic/boolean expression over named context variables.
///
/// The grammar is deliberately small: numbers, the allowed identifiers,
/// `+ - * /`, comparisons, `&& || !` and parentheses. Anything else is
/// rejected at parse time, including identifiers outside the allowed
/// set, so a malformed rule fails at registration rather than mid-run.
///
/// Booleans are represented as 1.0/0.0; the top-level result is truthy
/// when non-zero.
///
/// # Example
/// ```rust
/// use etc_traffic_sim_core::alerts::expression::Expr;
/// use std::collections::BTreeMap;
///
/// let allowed = ["mean_speed_kmh".to_string()];
/// let expr = Expr::parse("mean_speed_kmh < 40 && mean_speed_kmh > 0", &allowed).unwrap();
/// let mut vars = BTreeMap::new();
/// vars.insert("mean_speed_kmh".to_string(), 25.0);
/// assert!(expr.eval_bool(&vars).unwrap());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Variable(String),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

impl Expr {
    /// Parses `source`, accepting only identifiers present in `allowed`.
    pub fn parse(source: &str, allowed: &[String]) -> Result<Expr, ExprError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser { tokens, position: 0, allowed };
        let expr = parser.parse_or()?;
        if parser.position != parser.tokens.len() {
            return Err(ExprError::UnexpectedToken {
                position: parser.position,
                token: format!("{:?}", parser.tokens[parser.position]),
            });
        }
        Ok(expr)
    }

    /// Evaluates to a number (booleans as 1.0/0.0).
    pub fn eval(&self, vars: &BTreeMap<String, f64>) -> Result<f64, ExprError> {
        match self {
            Expr::Number(n) => Ok(*n),
            Expr::Variable(name) => vars
                .get(name)
                .copied()
                .ok_or_else(|| ExprError::MissingVariable(name.clone())),
            Expr::Unary(op, inner) => {
                let value = inner.eval(vars)?;
                Ok(match op {
                    UnaryOp::Neg => -value,
                    UnaryOp::Not => {
                        if value == 0.0 {
                            1.0
                        } else {
                            0.0
                        }
                    }
                })
            }
            Expr::Binary(op, lhs, rhs) => {
                let l = lhs.eval(vars)?;
                // Short-circuit the logical operators.
                match op {
                    BinaryOp::And => {
                        return Ok(if l != 0.0 && rhs.eval(vars)? != 0.0 { 1.0 } else { 0.0 });
                    }
                    BinaryOp::Or => {
                        return Ok(if l != 0.0 || rhs.eval(vars)? != 0.0 { 1.0 } else { 0.0 });
                    }
                    _ => {}
                }
                let r = rhs.eval(vars)?;
                Ok(match op {
                    BinaryOp::Add => l + r,
                    BinaryOp::Sub => l - r,
                    BinaryOp::Mul => l * r,
                    BinaryOp::Div => {
                        if r == 0.0 {
                            return Err(ExprError::DivisionByZero);
                        }
                        l / r
                    }
                    BinaryOp::Lt => bool_to_f64(l < r),
                    BinaryOp::Le => bool_to_f64(l <= r),
                    BinaryOp::Gt => bool_to_f64(l > r),
                    BinaryOp::Ge => bool_to_f64(l >= r),
                    BinaryOp::Eq => bool_to_f64(l == r),
                    BinaryOp::Ne => bool_to_f64(l != r),
                    BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
                })
            }
        }
    }

    /// Evaluates to a truth value: non-zero is true.
    pub fn eval_bool(&self, vars: &BTreeMap<String, f64>) -> Result<bool, ExprError> {
        Ok(self.eval(vars)? != 0.0)
    }
}

fn bool_to_f64(b: bool) -> f64 {
    if b { 1.0 } else { 0.0 }
}

fn tokenize(source: &str) -> Result<Vec<Token>, ExprError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
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
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::EqEq);
                    i += 2;
                } else {
                    return Err(ExprError::BadToken { position: i, found: '=' });
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::NotEq);
                    i += 2;
                } else {
                    tokens.push(Token::Not);
                    i += 1;
                }
            }
            '&' => {
                if chars.get(i + 1) == Some(&'&') {
                    tokens.push(Token::AndAnd);
                    i += 2;
                } else {
                    return Err(ExprError::BadToken { position: i, found: '&' });
                }
            }
            '|' => {
                if chars.get(i + 1) == Some(&'|') {
                    tokens.push(Token::OrOr);
                    i += 2;
                } else {
                    return Err(ExprError::BadToken { position: i, found: '|' });
                }
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let literal: String = chars[start..i].iter().collect();
                let number = literal
                    .parse::<f64>()
                    .map_err(|_| ExprError::UnexpectedToken { position: start, token: literal })?;
                tokens.push(Token::Number(number));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '_')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(ExprError::BadToken { position: i, found: other }),
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    position: usize,
    allowed: &'a [String],
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    fn parse_or(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_and()?;
        while self.peek() == Some(&Token::OrOr) {
            self.advance();
            let rhs = self.parse_and()?;
            lhs = Expr::Binary(BinaryOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_comparison()?;
        while self.peek() == Some(&Token::AndAnd) {
            self.advance();
            let rhs = self.parse_comparison()?;
            lhs = Expr::Binary(BinaryOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExprError> {
        let lhs = self.parse_additive()?;
        let op = match self.peek() {
            Some(Token::Lt) => BinaryOp::Lt,
            Some(Token::Le) => BinaryOp::Le,
            Some(Token::Gt) => BinaryOp::Gt,
            Some(Token::Ge) => BinaryOp::Ge,
            Some(Token::EqEq) => BinaryOp::Eq,
            Some(Token::NotEq) => BinaryOp::Ne,
            _ => return Ok(lhs),
        };
        self.advance();
        let rhs = self.parse_additive()?;
        Ok(Expr::Binary(op, Box::new(lhs), Box::new(rhs)))
    }

    fn parse_additive(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_multiplicative()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        match self.peek() {
            Some(Token::Minus) => {
                self.advance();
                Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.parse_unary()?)))
            }
            Some(Token::Not) => {
                self.advance();
                Ok(Expr::Unary(UnaryOp::Not, Box::new(self.parse_unary()?)))
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, ExprError> {
        match self.advance() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Ident(name)) => {
                if self.allowed.iter().any(|a| a == &name) {
                    Ok(Expr::Variable(name))
                } else {
                    Err(ExprError::UnknownVariable(name))
                }
            }
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    Some(token) => Err(ExprError::UnexpectedToken {
                        position: self.position - 1,
                        token: format!("{:?}", token),
                    }),
                    None => Err(ExprError::UnexpectedEnd),
                }
            }
            Some(token) => Err(ExprError::UnexpectedToken {
                position: self.position - 1,
                token: format!("{:?}", token),
            }),
            None => Err(ExprError::UnexpectedEnd),
        }
    }
}
