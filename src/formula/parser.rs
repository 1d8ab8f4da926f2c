// Recursive-descent parser for the formula language.
//
// Precedence, loosest first:
//   comparison   = <> < <= > >=      (left-assoc)
//   additive     + -                 (left-assoc)
//   multiplicative * /               (left-assoc)
//   unary        - +
//   primary      literal | identifier | CALL(args) | ( expr )

use super::FormulaSyntaxError;
use super::lexer::{Token, TokenKind, tokenize};

/// Parenthesis, call and sign nesting accepted in one formula. Hand-written
/// IF chains sit far below this; the parser recurses once per level.
pub const MAX_DEPTH: usize = 256;

/// Height of the finished expression tree, counting every operator and call
/// node. Evaluation and drop recurse once per level, so this caps their stack.
pub const MAX_HEIGHT: usize = 1024;

/// An expression with its tree height.
type Node = (Expr, usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    If,
    And,
    Or,
    Not,
    IsNumber,
    Min,
    Abs,
}

impl Function {
    pub fn lookup(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "IF" => Some(Function::If),
            "AND" => Some(Function::And),
            "OR" => Some(Function::Or),
            "NOT" => Some(Function::Not),
            "ISNUMBER" => Some(Function::IsNumber),
            "MIN" => Some(Function::Min),
            "ABS" => Some(Function::Abs),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Function::If => "IF",
            Function::And => "AND",
            Function::Or => "OR",
            Function::Not => "NOT",
            Function::IsNumber => "ISNUMBER",
            Function::Min => "MIN",
            Function::Abs => "ABS",
        }
    }

    /// (min, max) argument count; `None` max means unbounded.
    pub fn arity(self) -> (usize, Option<usize>) {
        match self {
            Function::If => (2, Some(3)),
            Function::And | Function::Or | Function::Min => (1, None),
            Function::Not | Function::IsNumber | Function::Abs => (1, Some(1)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Plus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Text(String),
    Bool(bool),
    Ident(String),
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Call {
        func: Function,
        args: Vec<Expr>,
    },
}

impl Expr {
    /// Every identifier referenced anywhere in the expression.
    pub fn visit_idents<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Ident(name) => out.push(name),
            Expr::Unary { expr, .. } => expr.visit_idents(out),
            Expr::Binary { left, right, .. } => {
                left.visit_idents(out);
                right.visit_idents(out);
            }
            Expr::Call { args, .. } => args.iter().for_each(|a| a.visit_idents(out)),
            Expr::Number(_) | Expr::Text(_) | Expr::Bool(_) => {}
        }
    }
}

pub fn parse(src: &str) -> Result<Expr, FormulaSyntaxError> {
    let tokens = tokenize(src)?;
    let mut parser = Parser { tokens, pos: 0, depth: 0 };

    // Spreadsheet users often paste formulas with their leading '='
    if parser.peek() == &TokenKind::Eq {
        parser.pos += 1;
    }
    if parser.peek() == &TokenKind::Eof {
        return Err(FormulaSyntaxError::new("empty formula", parser.position()));
    }

    let (expr, _) = parser.comparison()?;
    match parser.peek() {
        TokenKind::Eof => Ok(expr),
        TokenKind::RParen => Err(FormulaSyntaxError::new("unmatched ')'", parser.position())),
        other => Err(FormulaSyntaxError::new(
            format!("unexpected {} after end of expression", describe(other)),
            parser.position(),
        )),
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &TokenKind {
        // tokenize always terminates the stream with Eof
        &self.tokens[self.pos.min(self.tokens.len() - 1)].kind
    }

    fn position(&self) -> usize {
        self.tokens[self.pos.min(self.tokens.len() - 1)].position
    }

    fn advance(&mut self) -> Token {
        let tok = self.tokens[self.pos.min(self.tokens.len() - 1)].clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<(), FormulaSyntaxError> {
        if self.peek() == &kind {
            self.advance();
            Ok(())
        } else {
            Err(FormulaSyntaxError::new(
                format!("expected {} but found {}", what, describe(self.peek())),
                self.position(),
            ))
        }
    }

    fn enter(&mut self) -> Result<(), FormulaSyntaxError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(FormulaSyntaxError::new(
                format!("expression nested deeper than {} levels", MAX_DEPTH),
                self.position(),
            ));
        }
        Ok(())
    }

    fn node(&self, expr: Expr, height: usize) -> Result<Node, FormulaSyntaxError> {
        if height > MAX_HEIGHT {
            return Err(FormulaSyntaxError::new(
                format!("expression tree deeper than {} levels", MAX_HEIGHT),
                self.position(),
            ));
        }
        Ok((expr, height))
    }

    fn fold(&self, op: BinaryOp, (left, lh): Node, (right, rh): Node) -> Result<Node, FormulaSyntaxError> {
        let expr = Expr::Binary { op, left: Box::new(left), right: Box::new(right) };
        self.node(expr, 1 + lh.max(rh))
    }

    fn comparison(&mut self) -> Result<Node, FormulaSyntaxError> {
        let mut left = self.additive()?;
        loop {
            let op = match self.peek() {
                TokenKind::Eq => BinaryOp::Eq,
                TokenKind::Ne => BinaryOp::Ne,
                TokenKind::Lt => BinaryOp::Lt,
                TokenKind::Le => BinaryOp::Le,
                TokenKind::Gt => BinaryOp::Gt,
                TokenKind::Ge => BinaryOp::Ge,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.additive()?;
            left = self.fold(op, left, right)?;
        }
    }

    fn additive(&mut self) -> Result<Node, FormulaSyntaxError> {
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.multiplicative()?;
            left = self.fold(op, left, right)?;
        }
    }

    fn multiplicative(&mut self) -> Result<Node, FormulaSyntaxError> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.unary()?;
            left = self.fold(op, left, right)?;
        }
    }

    fn unary(&mut self) -> Result<Node, FormulaSyntaxError> {
        let op = match self.peek() {
            TokenKind::Minus => UnaryOp::Neg,
            TokenKind::Plus => UnaryOp::Plus,
            _ => return self.primary(),
        };
        self.advance();
        self.enter()?;
        let (expr, height) = self.unary()?;
        self.depth -= 1;
        self.node(Expr::Unary { op, expr: Box::new(expr) }, height + 1)
    }

    fn primary(&mut self) -> Result<Node, FormulaSyntaxError> {
        let position = self.position();
        let tok = self.advance();
        match tok.kind {
            TokenKind::Number(n) => Ok((Expr::Number(n), 1)),
            TokenKind::Text(s) => Ok((Expr::Text(s), 1)),
            TokenKind::LParen => {
                self.enter()?;
                let inner = self.comparison()?;
                self.expect(TokenKind::RParen, "')'")?;
                self.depth -= 1;
                Ok(inner)
            }
            TokenKind::Ident(name) => {
                if self.peek() == &TokenKind::LParen {
                    return self.call(&name, position);
                }
                let expr = if name.eq_ignore_ascii_case("TRUE") {
                    Expr::Bool(true)
                } else if name.eq_ignore_ascii_case("FALSE") {
                    Expr::Bool(false)
                } else {
                    Expr::Ident(name)
                };
                Ok((expr, 1))
            }
            TokenKind::Eof => Err(FormulaSyntaxError::new("unexpected end of formula", position)),
            other => Err(FormulaSyntaxError::new(
                format!("unexpected {}", describe(&other)),
                position,
            )),
        }
    }

    fn call(&mut self, name: &str, position: usize) -> Result<Node, FormulaSyntaxError> {
        let func = Function::lookup(name)
            .ok_or_else(|| FormulaSyntaxError::new(format!("unknown function '{}'", name), position))?;

        self.expect(TokenKind::LParen, "'('")?;
        self.enter()?;

        let mut args = Vec::new();
        let mut height = 0;
        if self.peek() != &TokenKind::RParen {
            loop {
                let (arg, h) = self.comparison()?;
                height = height.max(h);
                args.push(arg);
                if self.peek() == &TokenKind::Comma {
                    self.advance();
                    continue;
                }
                break;
            }
        }
        self.expect(TokenKind::RParen, "',' or ')'")?;
        self.depth -= 1;

        let (min, max) = func.arity();
        let ok = args.len() >= min && max.is_none_or(|m| args.len() <= m);
        if !ok {
            let expected = match max {
                Some(m) if m == min => format!("{}", min),
                Some(m) => format!("{} to {}", min, m),
                None => format!("at least {}", min),
            };
            return Err(FormulaSyntaxError::new(
                format!(
                    "{} expects {} argument(s), got {}",
                    func.name(),
                    expected,
                    args.len()
                ),
                position,
            ));
        }

        self.node(Expr::Call { func, args }, height + 1)
    }
}

fn describe(kind: &TokenKind) -> String {
    match kind {
        TokenKind::Number(n) => format!("number {}", n),
        TokenKind::Text(s) => format!("string {:?}", s),
        TokenKind::Ident(s) => format!("identifier '{}'", s),
        TokenKind::LParen => "'('".into(),
        TokenKind::RParen => "')'".into(),
        TokenKind::Comma => "','".into(),
        TokenKind::Plus => "'+'".into(),
        TokenKind::Minus => "'-'".into(),
        TokenKind::Star => "'*'".into(),
        TokenKind::Slash => "'/'".into(),
        TokenKind::Eq => "'='".into(),
        TokenKind::Ne => "'<>'".into(),
        TokenKind::Lt => "'<'".into(),
        TokenKind::Le => "'<='".into(),
        TokenKind::Gt => "'>'".into(),
        TokenKind::Ge => "'>='".into(),
        TokenKind::Eof => "end of formula".into(),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
