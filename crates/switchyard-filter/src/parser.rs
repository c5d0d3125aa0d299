//! Query text to [`Expr`].
//!
//! Recursive descent over the usual precedence ladder:
//!
//! ```text
//! or < and < = != < < <= > >= < + - < * div mod < unary - < | < path
//! ```
//!
//! Lexing follows the standard disambiguation rule: after an operand, `*` is
//! multiplication and `and`/`or`/`div`/`mod` are operators; anywhere else they
//! are a wildcard and element names.
//!
//! Nesting and operator chains are bounded by [`MAX_NESTING`] so hostile
//! input fails to parse instead of exhausting the stack.

use crate::ast::{Axis, Expr, Function, LocationPath, MathOp, NodeTest, RelOp, Step};
use crate::FilterError;

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Slash,
    DoubleSlash,
    Dot,
    DotDot,
    At,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Pipe,
    Plus,
    Minus,
    /// Wildcard name test.
    Star,
    Multiply,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    ColonColon,
    And,
    Or,
    Div,
    Mod,
    Literal(String),
    Number(f64),
    Name(String),
    Variable(String),
    Eof,
}

impl Tok {
    /// Tokens after which `*` and operator names are operators.
    fn ends_operand(&self) -> bool {
        matches!(
            self,
            Tok::Name(_)
                | Tok::Literal(_)
                | Tok::Number(_)
                | Tok::Variable(_)
                | Tok::RParen
                | Tok::RBracket
                | Tok::Dot
                | Tok::DotDot
                | Tok::Star
        )
    }
}

struct Lexer<'a> {
    src: &'a str,
    pos: usize,
    tokens: Vec<(Tok, usize)>,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            pos: 0,
            tokens: Vec::new(),
        }
    }

    fn peek_char(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn peek_char_at(&self, offset: usize) -> Option<char> {
        self.src[self.pos..].chars().nth(offset)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek_char()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn error(&self, message: impl Into<String>) -> FilterError {
        FilterError::Parse {
            position: self.pos,
            message: message.into(),
        }
    }

    fn after_operand(&self) -> bool {
        self.tokens.last().map_or(false, |(t, _)| t.ends_operand())
    }

    fn tokenize(mut self) -> Result<Vec<(Tok, usize)>, FilterError> {
        loop {
            while self.peek_char().map_or(false, char::is_whitespace) {
                self.bump();
            }
            let start = self.pos;
            let Some(c) = self.peek_char() else {
                self.tokens.push((Tok::Eof, start));
                return Ok(self.tokens);
            };
            let tok = match c {
                '/' => {
                    self.bump();
                    if self.peek_char() == Some('/') {
                        self.bump();
                        Tok::DoubleSlash
                    } else {
                        Tok::Slash
                    }
                }
                '.' if self.peek_char_at(1).map_or(false, |d| d.is_ascii_digit()) => {
                    self.number()?
                }
                '.' => {
                    self.bump();
                    if self.peek_char() == Some('.') {
                        self.bump();
                        Tok::DotDot
                    } else {
                        Tok::Dot
                    }
                }
                '@' => self.single(Tok::At),
                ',' => self.single(Tok::Comma),
                '(' => self.single(Tok::LParen),
                ')' => self.single(Tok::RParen),
                '[' => self.single(Tok::LBracket),
                ']' => self.single(Tok::RBracket),
                '|' => self.single(Tok::Pipe),
                '+' => self.single(Tok::Plus),
                '-' => self.single(Tok::Minus),
                '=' => self.single(Tok::Eq),
                '*' => {
                    let tok = if self.after_operand() {
                        Tok::Multiply
                    } else {
                        Tok::Star
                    };
                    self.single(tok)
                }
                '!' => {
                    self.bump();
                    if self.bump() != Some('=') {
                        return Err(self.error("expected '=' after '!'"));
                    }
                    Tok::Ne
                }
                '<' => {
                    self.bump();
                    if self.peek_char() == Some('=') {
                        self.bump();
                        Tok::Le
                    } else {
                        Tok::Lt
                    }
                }
                '>' => {
                    self.bump();
                    if self.peek_char() == Some('=') {
                        self.bump();
                        Tok::Ge
                    } else {
                        Tok::Gt
                    }
                }
                ':' => {
                    self.bump();
                    if self.bump() != Some(':') {
                        return Err(self.error("expected '::'"));
                    }
                    Tok::ColonColon
                }
                '"' | '\'' => self.literal(c)?,
                '$' => {
                    self.bump();
                    let name = self.qname()?;
                    Tok::Variable(name)
                }
                c if c.is_ascii_digit() => self.number()?,
                c if is_name_start(c) => {
                    let name = self.qname()?;
                    if self.after_operand() {
                        match name.as_str() {
                            "and" => Tok::And,
                            "or" => Tok::Or,
                            "div" => Tok::Div,
                            "mod" => Tok::Mod,
                            _ => Tok::Name(name),
                        }
                    } else {
                        Tok::Name(name)
                    }
                }
                other => return Err(self.error(format!("unexpected character '{other}'"))),
            };
            self.tokens.push((tok, start));
        }
    }

    fn single(&mut self, tok: Tok) -> Tok {
        self.bump();
        tok
    }

    fn literal(&mut self, quote: char) -> Result<Tok, FilterError> {
        self.bump();
        let start = self.pos;
        while let Some(c) = self.bump() {
            if c == quote {
                let end = self.pos - c.len_utf8();
                return Ok(Tok::Literal(self.src[start..end].to_owned()));
            }
        }
        Err(self.error("unterminated string literal"))
    }

    fn number(&mut self) -> Result<Tok, FilterError> {
        let start = self.pos;
        while self.peek_char().map_or(false, |c| c.is_ascii_digit()) {
            self.bump();
        }
        if self.peek_char() == Some('.') {
            self.bump();
            while self.peek_char().map_or(false, |c| c.is_ascii_digit()) {
                self.bump();
            }
        }
        self.src[start..self.pos]
            .parse::<f64>()
            .map(Tok::Number)
            .map_err(|_| self.error("malformed number"))
    }

    fn ncname(&mut self) -> Result<String, FilterError> {
        let start = self.pos;
        match self.peek_char() {
            Some(c) if is_name_start(c) => {
                self.bump();
            }
            _ => return Err(self.error("expected a name")),
        }
        while self.peek_char().map_or(false, is_name_char) {
            self.bump();
        }
        Ok(self.src[start..self.pos].to_owned())
    }

    /// `name` or `prefix:name`. A `::` after the name is left for the axis.
    fn qname(&mut self) -> Result<String, FilterError> {
        let mut name = self.ncname()?;
        if self.peek_char() == Some(':') && self.peek_char_at(1).map_or(false, is_name_start) {
            self.bump();
            name.push(':');
            name.push_str(&self.ncname()?);
        }
        Ok(name)
    }
}

fn is_name_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | '.')
}

/// Deepest grouping, predicate, argument or negation nesting accepted, and
/// the longest run of one binary operator within a level.
pub const MAX_NESTING: usize = 256;

/// Parse query text into an expression tree.
pub fn parse(src: &str) -> Result<Expr, FilterError> {
    let tokens = Lexer::new(src).tokenize()?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let expr = parser.or_expr()?;
    match parser.peek() {
        Tok::Eof => Ok(expr),
        other => Err(parser.error(format!("unexpected {other:?} after expression"))),
    }
}

struct Parser {
    tokens: Vec<(Tok, usize)>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &Tok {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].0
    }

    fn peek_at(&self, offset: usize) -> &Tok {
        &self.tokens[(self.pos + offset).min(self.tokens.len() - 1)].0
    }

    fn next(&mut self) -> Tok {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.peek() == tok {
            self.next();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: &Tok) -> Result<(), FilterError> {
        if self.eat(tok) {
            Ok(())
        } else {
            Err(self.error(format!("expected {tok:?}, found {:?}", self.peek())))
        }
    }

    fn error(&self, message: impl Into<String>) -> FilterError {
        FilterError::Parse {
            position: self.tokens[self.pos.min(self.tokens.len() - 1)].1,
            message: message.into(),
        }
    }

    fn too_deep(&self) -> FilterError {
        self.error("expression nested too deeply")
    }

    /// Run `parse` one nesting level down.
    fn nested<T>(
        &mut self,
        parse: impl FnOnce(&mut Self) -> Result<T, FilterError>,
    ) -> Result<T, FilterError> {
        if self.depth >= MAX_NESTING {
            return Err(self.too_deep());
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    /// Each operator folded into a left-leaning chain deepens the tree by one.
    fn link(&self, links: &mut usize) -> Result<(), FilterError> {
        *links += 1;
        if self.depth + *links > MAX_NESTING {
            return Err(self.too_deep());
        }
        Ok(())
    }

    fn or_expr(&mut self) -> Result<Expr, FilterError> {
        self.nested(|p| {
            let mut left = p.and_expr()?;
            let mut links = 0;
            while p.eat(&Tok::Or) {
                p.link(&mut links)?;
                left = Expr::or(left, p.and_expr()?);
            }
            Ok(left)
        })
    }

    fn and_expr(&mut self) -> Result<Expr, FilterError> {
        let mut left = self.equality_expr()?;
        let mut links = 0;
        while self.eat(&Tok::And) {
            self.link(&mut links)?;
            left = Expr::and(left, self.equality_expr()?);
        }
        Ok(left)
    }

    fn equality_expr(&mut self) -> Result<Expr, FilterError> {
        let mut left = self.relational_expr()?;
        let mut links = 0;
        loop {
            let op = match self.peek() {
                Tok::Eq => RelOp::Eq,
                Tok::Ne => RelOp::Ne,
                _ => return Ok(left),
            };
            self.next();
            self.link(&mut links)?;
            left = Expr::relational(op, left, self.relational_expr()?);
        }
    }

    fn relational_expr(&mut self) -> Result<Expr, FilterError> {
        let mut left = self.additive_expr()?;
        let mut links = 0;
        loop {
            let op = match self.peek() {
                Tok::Lt => RelOp::Lt,
                Tok::Le => RelOp::Le,
                Tok::Gt => RelOp::Gt,
                Tok::Ge => RelOp::Ge,
                _ => return Ok(left),
            };
            self.next();
            self.link(&mut links)?;
            left = Expr::relational(op, left, self.additive_expr()?);
        }
    }

    fn additive_expr(&mut self) -> Result<Expr, FilterError> {
        let mut left = self.multiplicative_expr()?;
        let mut links = 0;
        loop {
            let op = match self.peek() {
                Tok::Plus => MathOp::Add,
                Tok::Minus => MathOp::Sub,
                _ => return Ok(left),
            };
            self.next();
            self.link(&mut links)?;
            left = Expr::math(op, left, self.multiplicative_expr()?);
        }
    }

    fn multiplicative_expr(&mut self) -> Result<Expr, FilterError> {
        let mut left = self.unary_expr()?;
        let mut links = 0;
        loop {
            let op = match self.peek() {
                Tok::Multiply => MathOp::Mul,
                Tok::Div => MathOp::Div,
                Tok::Mod => MathOp::Mod,
                _ => return Ok(left),
            };
            self.next();
            self.link(&mut links)?;
            left = Expr::math(op, left, self.unary_expr()?);
        }
    }

    fn unary_expr(&mut self) -> Result<Expr, FilterError> {
        if self.eat(&Tok::Minus) {
            let operand = self.nested(Self::unary_expr)?;
            return Ok(Expr::Negate(Box::new(operand)));
        }
        self.union_expr()
    }

    fn union_expr(&mut self) -> Result<Expr, FilterError> {
        let mut left = self.path_expr()?;
        let mut links = 0;
        while self.eat(&Tok::Pipe) {
            self.link(&mut links)?;
            left = Expr::Union(Box::new(left), Box::new(self.path_expr()?));
        }
        Ok(left)
    }

    fn path_expr(&mut self) -> Result<Expr, FilterError> {
        if self.starts_location_path() {
            return Ok(Expr::LocationPath(self.location_path()?));
        }
        let primary = self.primary_expr()?;
        let mut predicates = Vec::new();
        while self.peek() == &Tok::LBracket {
            predicates.push(self.predicate()?);
        }
        let base = if predicates.is_empty() {
            primary
        } else {
            Expr::Filter {
                base: Box::new(primary),
                predicates,
            }
        };
        let mut steps = Vec::new();
        match self.peek() {
            Tok::Slash => {
                self.next();
            }
            Tok::DoubleSlash => {
                self.next();
                steps.push(Step::new(Axis::DescendantOrSelf, NodeTest::Node));
            }
            _ => return Ok(base),
        }
        self.relative_steps(&mut steps)?;
        Ok(Expr::RelativePath {
            base: Box::new(base),
            path: LocationPath {
                absolute: false,
                steps,
            },
        })
    }

    fn starts_location_path(&self) -> bool {
        match self.peek() {
            Tok::Slash | Tok::DoubleSlash | Tok::Dot | Tok::DotDot | Tok::At | Tok::Star => true,
            Tok::Name(name) => match self.peek_at(1) {
                Tok::LParen => is_node_type(name),
                _ => true,
            },
            _ => false,
        }
    }

    fn location_path(&mut self) -> Result<LocationPath, FilterError> {
        let mut steps = Vec::new();
        let absolute = match self.peek() {
            Tok::Slash => {
                self.next();
                if !self.starts_step() {
                    return Ok(LocationPath {
                        absolute: true,
                        steps,
                    });
                }
                true
            }
            Tok::DoubleSlash => {
                self.next();
                steps.push(Step::new(Axis::DescendantOrSelf, NodeTest::Node));
                true
            }
            _ => false,
        };
        self.relative_steps(&mut steps)?;
        Ok(LocationPath { absolute, steps })
    }

    fn starts_step(&self) -> bool {
        matches!(
            self.peek(),
            Tok::Dot | Tok::DotDot | Tok::At | Tok::Star | Tok::Name(_)
        )
    }

    fn relative_steps(&mut self, steps: &mut Vec<Step>) -> Result<(), FilterError> {
        steps.push(self.step()?);
        loop {
            match self.peek() {
                Tok::Slash => {
                    self.next();
                }
                Tok::DoubleSlash => {
                    self.next();
                    steps.push(Step::new(Axis::DescendantOrSelf, NodeTest::Node));
                }
                _ => return Ok(()),
            }
            steps.push(self.step()?);
        }
    }

    fn step(&mut self) -> Result<Step, FilterError> {
        if self.eat(&Tok::Dot) {
            return Ok(Step::new(Axis::SelfAxis, NodeTest::Node));
        }
        if self.eat(&Tok::DotDot) {
            return Ok(Step::new(Axis::Parent, NodeTest::Node));
        }
        let axis = if self.eat(&Tok::At) {
            Axis::Attribute
        } else if self.peek_at(1) == &Tok::ColonColon {
            let name = match self.next() {
                Tok::Name(name) => name,
                other => return Err(self.error(format!("expected an axis, found {other:?}"))),
            };
            let axis = Axis::from_name(&name)
                .ok_or_else(|| self.error(format!("unknown axis '{name}'")))?;
            self.next();
            axis
        } else {
            Axis::Child
        };
        let test = match self.next() {
            Tok::Star => NodeTest::Wildcard,
            Tok::Name(name) if is_node_type(&name) && self.peek() == &Tok::LParen => {
                self.next();
                self.expect(&Tok::RParen)?;
                match name.as_str() {
                    "text" => NodeTest::Text,
                    _ => NodeTest::Node,
                }
            }
            Tok::Name(name) => NodeTest::Name(name),
            other => return Err(self.error(format!("expected a node test, found {other:?}"))),
        };
        let mut step = Step::new(axis, test);
        while self.peek() == &Tok::LBracket {
            let predicate = self.predicate()?;
            step = step.with_predicate(predicate);
        }
        Ok(step)
    }

    fn predicate(&mut self) -> Result<Expr, FilterError> {
        self.expect(&Tok::LBracket)?;
        let expr = self.or_expr()?;
        self.expect(&Tok::RBracket)?;
        Ok(expr)
    }

    fn primary_expr(&mut self) -> Result<Expr, FilterError> {
        match self.next() {
            Tok::Variable(name) => Ok(Expr::Variable(name)),
            Tok::Literal(s) => Ok(Expr::String(s)),
            Tok::Number(n) => Ok(Expr::Number(n)),
            Tok::LParen => {
                let expr = self.or_expr()?;
                self.expect(&Tok::RParen)?;
                Ok(expr)
            }
            Tok::Name(name) => {
                self.expect(&Tok::LParen)?;
                let mut args = Vec::new();
                if !self.eat(&Tok::RParen) {
                    loop {
                        args.push(self.or_expr()?);
                        if self.eat(&Tok::RParen) {
                            break;
                        }
                        self.expect(&Tok::Comma)?;
                    }
                }
                function_call(name, args)
            }
            other => Err(self.error(format!("unexpected {other:?}"))),
        }
    }
}

fn is_node_type(name: &str) -> bool {
    matches!(name, "text" | "node")
}

fn function_call(name: String, args: Vec<Expr>) -> Result<Expr, FilterError> {
    if name.contains(':') {
        return Ok(Expr::ExternalFunction { name, args });
    }
    let function = Function::from_name(&name).ok_or(FilterError::UnknownFunction(name))?;
    function.check_arity(args.len())?;
    Ok(Expr::Function { function, args })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(absolute: bool, steps: Vec<Step>) -> Expr {
        Expr::LocationPath(LocationPath { absolute, steps })
    }

    fn child(name: &str) -> Step {
        Step::new(Axis::Child, NodeTest::Name(name.into()))
    }

    #[test]
    fn operators_follow_precedence() {
        let expr = parse("a = 1 or b and c").unwrap();
        assert_eq!(
            expr,
            Expr::or(
                Expr::relational(RelOp::Eq, Expr::child("a"), Expr::Number(1.0)),
                Expr::and(Expr::child("b"), Expr::child("c")),
            )
        );
    }

    #[test]
    fn star_and_names_are_disambiguated_by_position() {
        let expr = parse("* * div").unwrap();
        assert_eq!(
            expr,
            Expr::math(
                MathOp::Mul,
                path(false, vec![Step::new(Axis::Child, NodeTest::Wildcard)]),
                Expr::child("div"),
            )
        );
    }

    #[test]
    fn abbreviations_expand_to_axes() {
        let expr = parse("//a/@id").unwrap();
        assert_eq!(
            expr,
            path(
                true,
                vec![
                    Step::new(Axis::DescendantOrSelf, NodeTest::Node),
                    child("a"),
                    Step::new(Axis::Attribute, NodeTest::Name("id".into())),
                ]
            )
        );
        assert_eq!(
            parse("../.").unwrap(),
            path(
                false,
                vec![
                    Step::new(Axis::Parent, NodeTest::Node),
                    Step::new(Axis::SelfAxis, NodeTest::Node),
                ]
            )
        );
    }

    #[test]
    fn filter_expressions_and_relative_paths() {
        let expr = parse("(a | b)[2]/c").unwrap();
        let Expr::RelativePath { base, path } = expr else {
            panic!("expected a relative path");
        };
        assert!(matches!(*base, Expr::Filter { .. }));
        assert_eq!(path.steps, vec![child("c")]);
    }

    #[test]
    fn prefixed_calls_are_external() {
        let expr = parse("ext:lookup($key, 'x')").unwrap();
        assert_eq!(
            expr,
            Expr::ExternalFunction {
                name: "ext:lookup".into(),
                args: vec![Expr::Variable("key".into()), Expr::String("x".into())],
            }
        );
    }

    #[test]
    fn rejects_bad_input() {
        assert!(matches!(parse("a[1"), Err(FilterError::Parse { .. })));
        assert!(matches!(
            parse("frobnicate(1)"),
            Err(FilterError::UnknownFunction(_))
        ));
        assert!(matches!(parse("not()"), Err(FilterError::Arity { .. })));
        assert!(matches!(parse("'open"), Err(FilterError::Parse { .. })));
    }

    fn too_deep(result: Result<Expr, FilterError>) -> bool {
        matches!(
            result,
            Err(FilterError::Parse { message, .. }) if message == "expression nested too deeply"
        )
    }

    #[test]
    fn hostile_nesting_is_rejected() {
        let parens = format!("{}1{}", "(".repeat(100_000), ")".repeat(100_000));
        assert!(too_deep(parse(&parens)));
        assert!(too_deep(parse(&format!("{}1", "-".repeat(100_000)))));
        assert!(too_deep(parse(&format!("a{}", "[a".repeat(50_000)))));
        let chain = vec!["a"; 50_000].join(" | ");
        assert!(too_deep(parse(&chain)));
        assert!(too_deep(parse(&vec!["1"; 50_000].join(" + "))));
    }

    #[test]
    fn reasonable_nesting_still_parses() {
        let parens = format!("{}1{}", "(".repeat(100), ")".repeat(100));
        assert_eq!(parse(&parens).unwrap(), Expr::Number(1.0));
        assert!(parse(&vec!["a"; 100].join(" | ")).is_ok());
        assert!(parse(&format!("{}1", "-".repeat(100))).is_ok());
    }
}
