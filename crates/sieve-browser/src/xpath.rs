//! XPath evaluation over parsed HTML.
//!
//! Covers the location-path subset that extraction templates use: absolute and
//! relative paths, `//`, `.`, `..`, the `child`, `descendant`,
//! `descendant-or-self`, `self` and `parent` axes, name and `*` tests,
//! trailing `@attr` / `text()` steps (which select the owning element),
//! unions, `(path)[n]` grouping and predicates built from positions,
//! `last()`, attribute and text comparisons, `contains`, `starts-with`,
//! `normalize-space`, `not`, `and` and `or`.

use crate::error::{BrowserError, Result};
use scraper::{ElementRef, Html};
use std::collections::{HashMap, HashSet};

/// A compiled XPath expression.
#[derive(Debug, Clone, PartialEq)]
pub struct XPath {
    expr: String,
    paths: Vec<Path>,
}

impl XPath {
    pub fn parse(expr: &str) -> Result<Self> {
        let invalid = |reason: String| BrowserError::InvalidSelector {
            selector: expr.to_string(),
            reason,
        };
        let tokens = lex(expr).map_err(invalid)?;
        let mut parser = Parser { tokens, pos: 0 };
        let paths = parser.parse_union().map_err(invalid)?;
        if parser.pos != parser.tokens.len() {
            return Err(invalid(format!(
                "unexpected token {:?}",
                parser.tokens[parser.pos]
            )));
        }
        Ok(Self {
            expr: expr.to_string(),
            paths,
        })
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.expr
    }

    /// Evaluate against `document`, with `scope` as the context node.
    ///
    /// Without a scope the context is the document itself. Matches are
    /// returned deduplicated and in document order.
    #[must_use]
    pub fn select<'a>(&self, document: &'a Html, scope: Option<ElementRef<'a>>) -> Vec<ElementRef<'a>> {
        let context = scope.map_or(Node::Document, Node::Element);
        let mut matches = Vec::new();
        for path in &self.paths {
            matches.extend(path.eval(document, context));
        }

        let order: HashMap<_, usize> = document
            .root_element()
            .descendants()
            .filter_map(ElementRef::wrap)
            .enumerate()
            .map(|(index, element)| (element.id(), index))
            .collect();

        let mut elements: Vec<ElementRef<'a>> = dedup(matches)
            .into_iter()
            .filter_map(|node| match node {
                Node::Element(element) => Some(element),
                Node::Document => None,
            })
            .collect();
        elements.sort_by_key(|element| order.get(&element.id()).copied().unwrap_or(usize::MAX));
        elements
    }
}

#[derive(Debug, Clone, Copy)]
enum Node<'a> {
    Document,
    Element(ElementRef<'a>),
}

fn dedup(nodes: Vec<Node<'_>>) -> Vec<Node<'_>> {
    let mut seen = HashSet::new();
    nodes
        .into_iter()
        .filter(|node| {
            seen.insert(match node {
                Node::Document => None,
                Node::Element(element) => Some(element.id()),
            })
        })
        .collect()
}

fn children<'a>(document: &'a Html, node: Node<'a>) -> Vec<Node<'a>> {
    match node {
        Node::Document => vec![Node::Element(document.root_element())],
        Node::Element(element) => element
            .children()
            .filter_map(ElementRef::wrap)
            .map(Node::Element)
            .collect(),
    }
}

fn descendants_or_self<'a>(document: &'a Html, node: Node<'a>) -> Vec<Node<'a>> {
    match node {
        Node::Document => std::iter::once(Node::Document)
            .chain(
                document
                    .root_element()
                    .descendants()
                    .filter_map(ElementRef::wrap)
                    .map(Node::Element),
            )
            .collect(),
        Node::Element(element) => element
            .descendants()
            .filter_map(ElementRef::wrap)
            .map(Node::Element)
            .collect(),
    }
}

fn parent(node: Node<'_>) -> Option<Node<'_>> {
    match node {
        Node::Document => None,
        Node::Element(element) => match element.parent() {
            Some(parent) => Some(ElementRef::wrap(parent).map_or(Node::Document, Node::Element)),
            None => Some(Node::Document),
        },
    }
}

fn string_value(element: ElementRef<'_>) -> String {
    element.text().collect()
}

fn direct_text(element: ElementRef<'_>) -> String {
    element
        .children()
        .filter_map(|child| child.value().as_text().map(|text| text.to_string()))
        .collect()
}

fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[derive(Debug, Clone, PartialEq)]
enum Path {
    Location { absolute: bool, steps: Vec<Step> },
    Grouped { inner: Vec<Path>, predicates: Vec<Predicate> },
}

impl Path {
    fn eval<'a>(&self, document: &'a Html, context: Node<'a>) -> Vec<Node<'a>> {
        match self {
            Self::Location { absolute, steps } => {
                let start = if *absolute { Node::Document } else { context };
                let mut nodes = vec![start];
                for step in steps {
                    nodes = step.apply(document, nodes);
                }
                nodes
            }
            Self::Grouped { inner, predicates } => {
                let mut nodes = Vec::new();
                for path in inner {
                    nodes.extend(path.eval(document, context));
                }
                let order: HashMap<_, usize> = document
                    .root_element()
                    .descendants()
                    .filter_map(ElementRef::wrap)
                    .enumerate()
                    .map(|(index, element)| (element.id(), index))
                    .collect();
                let mut nodes = dedup(nodes);
                nodes.sort_by_key(|node| match node {
                    Node::Document => 0,
                    Node::Element(element) => order.get(&element.id()).map_or(usize::MAX, |i| i + 1),
                });
                apply_predicates(predicates, nodes)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axis {
    Child,
    /// The `//name` shorthand: children of every descendant-or-self node.
    Deep,
    Descendant,
    DescendantOrSelf,
    SelfNode,
    Parent,
}

#[derive(Debug, Clone, PartialEq)]
enum NodeTest {
    Any,
    Name(String),
    Attribute(String),
    Text,
}

impl NodeTest {
    fn matches(&self, node: Node<'_>) -> bool {
        match (self, node) {
            (Self::Any, _) => true,
            (_, Node::Document) => false,
            (Self::Name(name), Node::Element(element)) => {
                element.value().name().eq_ignore_ascii_case(name)
            }
            (Self::Attribute(name), Node::Element(element)) => {
                (name == "*" && element.value().attrs().next().is_some())
                    || element.value().attr(name).is_some()
            }
            (Self::Text, Node::Element(element)) => !direct_text(element).trim().is_empty(),
        }
    }

    /// Attribute and text steps select their owner element.
    fn selects_owner(&self) -> bool {
        matches!(self, Self::Attribute(_) | Self::Text)
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Step {
    axis: Axis,
    test: NodeTest,
    predicates: Vec<Predicate>,
}

impl Step {
    fn apply<'a>(&self, document: &'a Html, contexts: Vec<Node<'a>>) -> Vec<Node<'a>> {
        let mut out = Vec::new();
        for context in contexts {
            if self.test.selects_owner() {
                let owners = match self.axis {
                    Axis::Deep | Axis::Descendant | Axis::DescendantOrSelf => {
                        descendants_or_self(document, context)
                    }
                    _ => vec![context],
                };
                let owners = owners.into_iter().filter(|n| self.test.matches(*n)).collect();
                out.extend(apply_predicates(&self.predicates, owners));
                continue;
            }

            match self.axis {
                Axis::Deep => {
                    for node in descendants_or_self(document, context) {
                        let candidates = children(document, node)
                            .into_iter()
                            .filter(|n| self.test.matches(*n))
                            .collect();
                        out.extend(apply_predicates(&self.predicates, candidates));
                    }
                }
                axis => {
                    let candidates: Vec<Node<'a>> = match axis {
                        Axis::Child => children(document, context),
                        Axis::Descendant => descendants_or_self(document, context)
                            .into_iter()
                            .skip(1)
                            .collect(),
                        Axis::DescendantOrSelf => descendants_or_self(document, context),
                        Axis::SelfNode => vec![context],
                        Axis::Parent => parent(context).into_iter().collect(),
                        Axis::Deep => Vec::new(),
                    };
                    let candidates = candidates
                        .into_iter()
                        .filter(|n| self.test.matches(*n))
                        .collect();
                    out.extend(apply_predicates(&self.predicates, candidates));
                }
            }
        }
        dedup(out)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Predicate {
    Position(usize),
    Last,
    Test(Condition),
}

fn apply_predicates<'a>(predicates: &[Predicate], mut nodes: Vec<Node<'a>>) -> Vec<Node<'a>> {
    for predicate in predicates {
        nodes = match predicate {
            Predicate::Position(position) => nodes
                .get(position.wrapping_sub(1))
                .copied()
                .into_iter()
                .collect(),
            Predicate::Last => nodes.last().copied().into_iter().collect(),
            Predicate::Test(condition) => nodes
                .into_iter()
                .filter(|node| match node {
                    Node::Element(element) => condition.holds(*element),
                    Node::Document => false,
                })
                .collect(),
        };
    }
    nodes
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Attr(String),
    Text,
    StringValue,
    Child(String),
    Normalized(Box<Operand>),
    Literal(String),
}

impl Operand {
    fn value(&self, element: ElementRef<'_>) -> Option<String> {
        match self {
            Self::Attr(name) => element.value().attr(name).map(ToString::to_string),
            Self::Text => Some(direct_text(element)),
            Self::StringValue => Some(string_value(element)),
            Self::Child(name) => element
                .children()
                .filter_map(ElementRef::wrap)
                .find(|child| child.value().name().eq_ignore_ascii_case(name))
                .map(string_value),
            Self::Normalized(inner) => inner.value(element).map(|v| normalize(&v)),
            Self::Literal(value) => Some(value.clone()),
        }
    }

    fn exists(&self, element: ElementRef<'_>) -> bool {
        match self {
            Self::Text => !direct_text(element).trim().is_empty(),
            Self::StringValue | Self::Normalized(_) => {
                self.value(element).is_some_and(|v| !v.trim().is_empty())
            }
            Self::Literal(value) => !value.is_empty(),
            Self::Attr(_) | Self::Child(_) => self.value(element).is_some(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Condition {
    And(Box<Condition>, Box<Condition>),
    Or(Box<Condition>, Box<Condition>),
    Not(Box<Condition>),
    Exists(Operand),
    Equals(Operand, Operand, bool),
    Contains(Operand, Operand),
    StartsWith(Operand, Operand),
}

impl Condition {
    fn holds(&self, element: ElementRef<'_>) -> bool {
        match self {
            Self::And(left, right) => left.holds(element) && right.holds(element),
            Self::Or(left, right) => left.holds(element) || right.holds(element),
            Self::Not(inner) => !inner.holds(element),
            Self::Exists(operand) => operand.exists(element),
            Self::Equals(left, right, negated) => {
                match (left.value(element), right.value(element)) {
                    (Some(l), Some(r)) => (l == r) != *negated,
                    _ => false,
                }
            }
            Self::Contains(haystack, needle) => {
                match (haystack.value(element), needle.value(element)) {
                    (Some(h), Some(n)) => h.contains(&n),
                    _ => false,
                }
            }
            Self::StartsWith(haystack, prefix) => {
                match (haystack.value(element), prefix.value(element)) {
                    (Some(h), Some(p)) => h.starts_with(&p),
                    _ => false,
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Slash,
    DoubleSlash,
    Dot,
    DotDot,
    At,
    Star,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Comma,
    Pipe,
    Eq,
    NotEq,
    DoubleColon,
    Name(String),
    Literal(String),
    Number(usize),
}

fn lex(expr: &str) -> std::result::Result<Vec<Token>, String> {
    let chars: Vec<char> = expr.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            c if c.is_whitespace() => i += 1,
            '/' if next == Some('/') => {
                tokens.push(Token::DoubleSlash);
                i += 2;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '.' if next == Some('.') => {
                tokens.push(Token::DotDot);
                i += 2;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            ':' if next == Some(':') => {
                tokens.push(Token::DoubleColon);
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push(Token::NotEq);
                i += 2;
            }
            '@' | '*' | '[' | ']' | '(' | ')' | ',' | '|' | '=' => {
                tokens.push(match c {
                    '@' => Token::At,
                    '*' => Token::Star,
                    '[' => Token::LBracket,
                    ']' => Token::RBracket,
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    ',' => Token::Comma,
                    '|' => Token::Pipe,
                    _ => Token::Eq,
                });
                i += 1;
            }
            '\'' | '"' => {
                let end = chars[i + 1..]
                    .iter()
                    .position(|&ch| ch == c)
                    .ok_or_else(|| "unterminated string literal".to_string())?;
                tokens.push(Token::Literal(chars[i + 1..i + 1 + end].iter().collect()));
                i += end + 2;
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                let digits: String = chars[start..i].iter().collect();
                let number = digits
                    .parse()
                    .map_err(|_| format!("invalid number {digits}"))?;
                tokens.push(Token::Number(number));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || matches!(chars[i], '-' | '_'))
                {
                    i += 1;
                }
                tokens.push(Token::Name(chars[start..i].iter().collect()));
            }
            other => return Err(format!("unexpected character '{other}'")),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

type ParseResult<T> = std::result::Result<T, String>;

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token) -> ParseResult<()> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(format!("expected {token:?}, found {:?}", self.peek()))
        }
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if matches!(self.peek(), Some(Token::Name(name)) if name == keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn parse_union(&mut self) -> ParseResult<Vec<Path>> {
        let mut paths = vec![self.parse_path()?];
        while self.eat(&Token::Pipe) {
            paths.push(self.parse_path()?);
        }
        Ok(paths)
    }

    fn parse_path(&mut self) -> ParseResult<Path> {
        if self.eat(&Token::LParen) {
            let inner = self.parse_union()?;
            self.expect(&Token::RParen)?;
            let predicates = self.parse_predicates()?;
            return Ok(Path::Grouped { inner, predicates });
        }

        let mut steps = Vec::new();
        let absolute = match self.peek() {
            Some(Token::Slash) => {
                self.pos += 1;
                true
            }
            Some(Token::DoubleSlash) => {
                self.pos += 1;
                steps.push(self.parse_step(Axis::Deep)?);
                true
            }
            _ => false,
        };

        if steps.is_empty() {
            steps.push(self.parse_step(Axis::Child)?);
        }

        loop {
            if self.eat(&Token::Slash) {
                steps.push(self.parse_step(Axis::Child)?);
            } else if self.eat(&Token::DoubleSlash) {
                steps.push(self.parse_step(Axis::Deep)?);
            } else {
                break;
            }
        }

        Ok(Path::Location { absolute, steps })
    }

    fn parse_step(&mut self, default_axis: Axis) -> ParseResult<Step> {
        let mut axis = default_axis;
        let test = match self.peek().cloned() {
            Some(Token::Dot) => {
                self.pos += 1;
                axis = if default_axis == Axis::Deep {
                    Axis::DescendantOrSelf
                } else {
                    Axis::SelfNode
                };
                NodeTest::Any
            }
            Some(Token::DotDot) => {
                self.pos += 1;
                axis = Axis::Parent;
                NodeTest::Any
            }
            Some(Token::At) => {
                self.pos += 1;
                NodeTest::Attribute(self.parse_name_or_star()?)
            }
            Some(Token::Name(name)) if self.peek_at(1) == Some(&Token::DoubleColon) => {
                self.pos += 2;
                axis = match name.as_str() {
                    "child" => Axis::Child,
                    "descendant" => Axis::Descendant,
                    "descendant-or-self" => Axis::DescendantOrSelf,
                    "self" => Axis::SelfNode,
                    "parent" => Axis::Parent,
                    other => return Err(format!("unsupported axis {other}")),
                };
                self.parse_node_test()?
            }
            Some(Token::Name(_) | Token::Star) => self.parse_node_test()?,
            other => return Err(format!("expected a location step, found {other:?}")),
        };

        let predicates = self.parse_predicates()?;
        Ok(Step {
            axis,
            test,
            predicates,
        })
    }

    fn parse_name_or_star(&mut self) -> ParseResult<String> {
        match self.peek().cloned() {
            Some(Token::Star) => {
                self.pos += 1;
                Ok("*".to_string())
            }
            Some(Token::Name(name)) => {
                self.pos += 1;
                Ok(name)
            }
            other => Err(format!("expected a name, found {other:?}")),
        }
    }

    fn parse_node_test(&mut self) -> ParseResult<NodeTest> {
        let name = self.parse_name_or_star()?;
        if name == "*" {
            return Ok(NodeTest::Any);
        }
        if self.eat(&Token::LParen) {
            self.expect(&Token::RParen)?;
            return match name.as_str() {
                "text" => Ok(NodeTest::Text),
                "node" => Ok(NodeTest::Any),
                other => Err(format!("unsupported node test {other}()")),
            };
        }
        Ok(NodeTest::Name(name))
    }

    fn parse_predicates(&mut self) -> ParseResult<Vec<Predicate>> {
        let mut predicates = Vec::new();
        while self.eat(&Token::LBracket) {
            let predicate = match (self.peek().cloned(), self.peek_at(1)) {
                (Some(Token::Number(n)), Some(Token::RBracket)) => {
                    self.pos += 1;
                    Predicate::Position(n)
                }
                (Some(Token::Name(name)), Some(Token::LParen))
                    if name == "last" && self.peek_at(2) == Some(&Token::RParen) =>
                {
                    self.pos += 3;
                    Predicate::Last
                }
                _ => Predicate::Test(self.parse_or()?),
            };
            self.expect(&Token::RBracket)?;
            predicates.push(predicate);
        }
        Ok(predicates)
    }

    fn parse_or(&mut self) -> ParseResult<Condition> {
        let mut left = self.parse_and()?;
        while self.eat_keyword("or") {
            left = Condition::Or(Box::new(left), Box::new(self.parse_and()?));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> ParseResult<Condition> {
        let mut left = self.parse_unary()?;
        while self.eat_keyword("and") {
            left = Condition::And(Box::new(left), Box::new(self.parse_unary()?));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> ParseResult<Condition> {
        if matches!(self.peek(), Some(Token::Name(name)) if name == "not")
            && self.peek_at(1) == Some(&Token::LParen)
        {
            self.pos += 2;
            let inner = self.parse_or()?;
            self.expect(&Token::RParen)?;
            return Ok(Condition::Not(Box::new(inner)));
        }

        if self.eat(&Token::LParen) {
            let inner = self.parse_or()?;
            self.expect(&Token::RParen)?;
            return Ok(inner);
        }

        if let Some(Token::Name(name)) = self.peek().cloned() {
            if matches!(name.as_str(), "contains" | "starts-with")
                && self.peek_at(1) == Some(&Token::LParen)
            {
                self.pos += 2;
                let haystack = self.parse_operand()?;
                self.expect(&Token::Comma)?;
                let needle = self.parse_operand()?;
                self.expect(&Token::RParen)?;
                return Ok(if name == "contains" {
                    Condition::Contains(haystack, needle)
                } else {
                    Condition::StartsWith(haystack, needle)
                });
            }
        }

        let left = self.parse_operand()?;
        if self.eat(&Token::Eq) {
            return Ok(Condition::Equals(left, self.parse_operand()?, false));
        }
        if self.eat(&Token::NotEq) {
            return Ok(Condition::Equals(left, self.parse_operand()?, true));
        }
        Ok(Condition::Exists(left))
    }

    fn parse_operand(&mut self) -> ParseResult<Operand> {
        match self.peek().cloned() {
            Some(Token::At) => {
                self.pos += 1;
                Ok(Operand::Attr(self.parse_name_or_star()?))
            }
            Some(Token::Dot) => {
                self.pos += 1;
                Ok(Operand::StringValue)
            }
            Some(Token::Literal(value)) => {
                self.pos += 1;
                Ok(Operand::Literal(value))
            }
            Some(Token::Number(n)) => {
                self.pos += 1;
                Ok(Operand::Literal(n.to_string()))
            }
            Some(Token::Name(name)) if self.peek_at(1) == Some(&Token::LParen) => {
                self.pos += 2;
                let operand = match name.as_str() {
                    "text" => Operand::Text,
                    "string" | "normalize-space" => {
                        let inner = if self.peek() == Some(&Token::RParen) {
                            Operand::StringValue
                        } else {
                            self.parse_operand()?
                        };
                        if name == "string" {
                            inner
                        } else {
                            Operand::Normalized(Box::new(inner))
                        }
                    }
                    other => return Err(format!("unsupported function {other}()")),
                };
                self.expect(&Token::RParen)?;
                Ok(operand)
            }
            Some(Token::Name(name)) => {
                self.pos += 1;
                Ok(Operand::Child(name))
            }
            other => Err(format!("expected an operand, found {other:?}")),
        }
    }
}
