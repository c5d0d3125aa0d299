//! Query expression trees.

use core::fmt;

use crate::FilterError;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Relational {
        op: RelOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Math {
        op: MathOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Negate(Box<Expr>),
    Number(f64),
    String(String),
    Function {
        function: Function,
        args: Vec<Expr>,
    },
    Union(Box<Expr>, Box<Expr>),
    /// `/a/b`, `a/b`, `//a`.
    LocationPath(LocationPath),
    /// A filter expression continued by a relative path: `$x/a`, `(a|b)//c`.
    RelativePath {
        base: Box<Expr>,
        path: LocationPath,
    },
    /// A primary expression with predicates: `(a|b)[1]`, `$x[@k]`.
    Filter {
        base: Box<Expr>,
        predicates: Vec<Expr>,
    },
    /// `$name`, resolved by the caller at evaluation time.
    Variable(String),
    /// `prefix:name(...)`, resolved by the caller at evaluation time.
    ExternalFunction { name: String, args: Vec<Expr> },
}

impl Expr {
    pub fn and(left: Expr, right: Expr) -> Self {
        Self::And(Box::new(left), Box::new(right))
    }

    pub fn or(left: Expr, right: Expr) -> Self {
        Self::Or(Box::new(left), Box::new(right))
    }

    pub fn relational(op: RelOp, left: Expr, right: Expr) -> Self {
        Self::Relational {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn math(op: MathOp, left: Expr, right: Expr) -> Self {
        Self::Math {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn function(function: Function, args: Vec<Expr>) -> Self {
        Self::Function { function, args }
    }

    /// A relative single-step child path: `name`.
    pub fn child(name: &str) -> Self {
        Self::LocationPath(LocationPath {
            absolute: false,
            steps: vec![Step::new(Axis::Child, NodeTest::Name(name.to_owned()))],
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocationPath {
    pub absolute: bool,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub axis: Axis,
    pub test: NodeTest,
    pub predicates: Vec<Expr>,
}

impl Step {
    pub fn new(axis: Axis, test: NodeTest) -> Self {
        Self {
            axis,
            test,
            predicates: Vec::new(),
        }
    }

    pub fn with_predicate(mut self, predicate: Expr) -> Self {
        self.predicates.push(predicate);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    Child,
    Attribute,
    Descendant,
    DescendantOrSelf,
    SelfAxis,
    Parent,
    Ancestor,
    AncestorOrSelf,
    FollowingSibling,
    PrecedingSibling,
}

impl Axis {
    /// Reverse axes number their proximity positions against document order.
    pub fn is_reverse(self) -> bool {
        matches!(
            self,
            Self::Ancestor | Self::AncestorOrSelf | Self::PrecedingSibling | Self::Parent
        )
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "child" => Self::Child,
            "attribute" => Self::Attribute,
            "descendant" => Self::Descendant,
            "descendant-or-self" => Self::DescendantOrSelf,
            "self" => Self::SelfAxis,
            "parent" => Self::Parent,
            "ancestor" => Self::Ancestor,
            "ancestor-or-self" => Self::AncestorOrSelf,
            "following-sibling" => Self::FollowingSibling,
            "preceding-sibling" => Self::PrecedingSibling,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeTest {
    /// Elements (or attributes, on the attribute axis) with this name.
    Name(String),
    /// `*`
    Wildcard,
    /// `text()`
    Text,
    /// `node()`
    Node,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl RelOp {
    /// The operator with its operands swapped.
    pub fn flip(self) -> Self {
        match self {
            Self::Eq => Self::Eq,
            Self::Ne => Self::Ne,
            Self::Lt => Self::Gt,
            Self::Le => Self::Ge,
            Self::Gt => Self::Lt,
            Self::Ge => Self::Le,
        }
    }
}

impl fmt::Display for RelOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MathOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl MathOp {
    pub fn apply(self, left: f64, right: f64) -> f64 {
        match self {
            Self::Add => left + right,
            Self::Sub => left - right,
            Self::Mul => left * right,
            Self::Div => left / right,
            Self::Mod => left % right,
        }
    }
}

/// Built-in functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Function {
    True,
    False,
    Not,
    Boolean,
    Count,
    Position,
    Last,
    String,
    StringLength,
    Concat,
    Contains,
    StartsWith,
    LocalName,
    Name,
    Number,
    Sum,
    NormalizeSpace,
}

impl Function {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "true" => Self::True,
            "false" => Self::False,
            "not" => Self::Not,
            "boolean" => Self::Boolean,
            "count" => Self::Count,
            "position" => Self::Position,
            "last" => Self::Last,
            "string" => Self::String,
            "string-length" => Self::StringLength,
            "concat" => Self::Concat,
            "contains" => Self::Contains,
            "starts-with" => Self::StartsWith,
            "local-name" => Self::LocalName,
            "name" => Self::Name,
            "number" => Self::Number,
            "sum" => Self::Sum,
            "normalize-space" => Self::NormalizeSpace,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::True => "true",
            Self::False => "false",
            Self::Not => "not",
            Self::Boolean => "boolean",
            Self::Count => "count",
            Self::Position => "position",
            Self::Last => "last",
            Self::String => "string",
            Self::StringLength => "string-length",
            Self::Concat => "concat",
            Self::Contains => "contains",
            Self::StartsWith => "starts-with",
            Self::LocalName => "local-name",
            Self::Name => "name",
            Self::Number => "number",
            Self::Sum => "sum",
            Self::NormalizeSpace => "normalize-space",
        }
    }

    /// Accepted argument counts, inclusive. `None` means unbounded.
    pub fn arity(self) -> (usize, Option<usize>) {
        match self {
            Self::True | Self::False | Self::Position | Self::Last => (0, Some(0)),
            Self::Not | Self::Boolean | Self::Count | Self::Sum => (1, Some(1)),
            Self::String
            | Self::StringLength
            | Self::LocalName
            | Self::Name
            | Self::Number
            | Self::NormalizeSpace => (0, Some(1)),
            Self::Contains | Self::StartsWith => (2, Some(2)),
            Self::Concat => (2, None),
        }
    }

    pub fn check_arity(self, found: usize) -> Result<(), FilterError> {
        let (min, max) = self.arity();
        if found >= min && max.map_or(true, |max| found <= max) {
            return Ok(());
        }
        let expected = match max {
            Some(max) if max == min => format!("{min}"),
            Some(max) => format!("{min} to {max}"),
            None => format!("at least {min}"),
        };
        Err(FilterError::Arity {
            function: self.name().to_owned(),
            expected,
            found,
        })
    }

    /// Functions whose single argument must be a node-set.
    pub fn wants_node_set(self) -> bool {
        matches!(self, Self::Count | Self::Sum)
    }

    pub fn result_type(self) -> ValueType {
        match self {
            Self::True
            | Self::False
            | Self::Not
            | Self::Boolean
            | Self::Contains
            | Self::StartsWith => ValueType::Boolean,
            Self::Count
            | Self::Position
            | Self::Last
            | Self::StringLength
            | Self::Number
            | Self::Sum => ValueType::Number,
            Self::String
            | Self::Concat
            | Self::LocalName
            | Self::Name
            | Self::NormalizeSpace => ValueType::String,
        }
    }
}

/// Static result type of an expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Boolean,
    Number,
    String,
    NodeSet,
    /// Only known at evaluation time (variables, external functions).
    Any,
}
