// XPath subset evaluated over an `HtmlDocument`.
//
// Supported: absolute (`/`, `//`) and relative (`.`, `./`, `.//`) paths,
// element names, `*`, `@name`, `@*`, `text()`, `.` and `..` steps, and
// predicates built from positions, `last()`, comparisons, `contains()`,
// `starts-with()`, `not()`, `and` and `or`.

use serde_json::{Map, Value};
use thiserror::Error;

use super::html::{ElementId, HtmlDocument, Node};

#[derive(Debug, Clone, Error, PartialEq)]
#[error("Invalid XPath expression '{expr}': {reason}")]
pub struct XPathError {
    pub expr: String,
    pub reason: String,
}

/// A node selected by an expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum XNode {
    Element(ElementId),
    /// Attribute at `index` of `element`.
    Attribute { element: ElementId, index: usize },
    /// Text child at `index` of `element`.
    Text { element: ElementId, index: usize },
}

impl XNode {
    pub fn string_value(&self, doc: &HtmlDocument) -> String {
        match *self {
            XNode::Element(id) => doc.text_content(id),
            XNode::Attribute { element, index } => doc.element(element).attributes[index].1.clone(),
            XNode::Text { element, index } => match &doc.element(element).children[index] {
                Node::Text(text) => text.clone(),
                Node::Element(_) => String::new(),
            },
        }
    }

    /// Elements become `{tag, attributes, text}` objects, everything else a string.
    pub fn to_value(&self, doc: &HtmlDocument) -> Value {
        match *self {
            XNode::Element(id) => {
                let element = doc.element(id);
                let attributes: Map<String, Value> = element
                    .attributes
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect();
                let mut object = Map::new();
                object.insert("tag".into(), Value::String(element.tag.clone()));
                object.insert("attributes".into(), Value::Object(attributes));
                object.insert("text".into(), Value::String(doc.text_content(id)));
                Value::Object(object)
            }
            other => Value::String(other.string_value(doc)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum NodeTest {
    Name(String),
    AnyElement,
    Attribute(String),
    AnyAttribute,
    Text,
    SelfNode,
    Parent,
}

#[derive(Debug, Clone, PartialEq)]
struct Step {
    descendant: bool,
    test: NodeTest,
    predicates: Vec<Predicate>,
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Attribute(String),
    Text,
    Context,
    Child(String),
    Literal(String),
    Number(f64),
}

#[derive(Debug, Clone, PartialEq)]
enum Predicate {
    Position(usize),
    Last,
    Exists(Operand),
    Equals(Operand, Operand, bool),
    Contains(Operand, Operand),
    StartsWith(Operand, Operand),
    Not(Box<Predicate>),
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
}

/// A compiled expression.
#[derive(Debug, Clone, PartialEq)]
pub struct XPath {
    source: String,
    absolute: bool,
    steps: Vec<Step>,
}

impl XPath {
    pub fn parse(expr: &str) -> Result<Self, XPathError> {
        let error = |reason: String| XPathError {
            expr: expr.to_string(),
            reason,
        };
        let tokens = tokenize(expr).map_err(error)?;
        let mut parser = Parser { tokens, pos: 0 };
        let (absolute, steps) = parser.path().map_err(error)?;
        if let Some(token) = parser.peek() {
            return Err(error(format!("unexpected {token:?}")));
        }
        Ok(Self {
            source: expr.to_string(),
            absolute,
            steps,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Evaluates against the document root.
    pub fn evaluate(&self, doc: &HtmlDocument) -> Vec<XNode> {
        self.evaluate_from(doc, XNode::Element(doc.root()))
    }

    pub fn evaluate_from(&self, doc: &HtmlDocument, context: XNode) -> Vec<XNode> {
        let start = if self.absolute {
            XNode::Element(doc.root())
        } else {
            context
        };

        let mut current = vec![start];
        for step in &self.steps {
            let mut next = Vec::new();
            for node in &current {
                let candidates = apply_predicates(doc, step, select(doc, step, *node));
                for candidate in candidates {
                    if !next.contains(&candidate) {
                        next.push(candidate);
                    }
                }
            }
            current = next;
        }
        current
    }
}

fn scope(doc: &HtmlDocument, id: ElementId, descendant: bool) -> Vec<ElementId> {
    if descendant {
        let mut all = vec![id];
        all.extend(doc.descendants(id));
        all
    } else {
        vec![id]
    }
}

fn select(doc: &HtmlDocument, step: &Step, node: XNode) -> Vec<XNode> {
    let XNode::Element(id) = node else {
        return match step.test {
            NodeTest::SelfNode => vec![node],
            NodeTest::Parent => match node {
                XNode::Attribute { element, .. } | XNode::Text { element, .. } => {
                    vec![XNode::Element(element)]
                }
                XNode::Element(_) => Vec::new(),
            },
            _ => Vec::new(),
        };
    };

    match &step.test {
        NodeTest::Name(name) => element_children(doc, id, step.descendant)
            .into_iter()
            .filter(|child| doc.element(*child).tag == *name)
            .map(XNode::Element)
            .collect(),
        NodeTest::AnyElement => element_children(doc, id, step.descendant)
            .into_iter()
            .map(XNode::Element)
            .collect(),
        NodeTest::Attribute(name) => scope(doc, id, step.descendant)
            .into_iter()
            .filter_map(|element| {
                doc.element(element)
                    .attributes
                    .iter()
                    .position(|(key, _)| key == name)
                    .map(|index| XNode::Attribute { element, index })
            })
            .collect(),
        NodeTest::AnyAttribute => scope(doc, id, step.descendant)
            .into_iter()
            .flat_map(|element| {
                (0..doc.element(element).attributes.len())
                    .map(move |index| XNode::Attribute { element, index })
            })
            .collect(),
        NodeTest::Text => scope(doc, id, step.descendant)
            .into_iter()
            .flat_map(|element| {
                doc.element(element)
                    .children
                    .iter()
                    .enumerate()
                    .filter(|(_, child)| matches!(child, Node::Text(_)))
                    .map(move |(index, _)| XNode::Text { element, index })
                    .collect::<Vec<_>>()
            })
            .collect(),
        NodeTest::SelfNode => scope(doc, id, step.descendant)
            .into_iter()
            .map(XNode::Element)
            .collect(),
        NodeTest::Parent => doc.parent(id).map(XNode::Element).into_iter().collect(),
    }
}

fn element_children(doc: &HtmlDocument, id: ElementId, descendant: bool) -> Vec<ElementId> {
    if descendant {
        doc.descendants(id)
    } else {
        doc.children(id).collect()
    }
}

fn apply_predicates(doc: &HtmlDocument, step: &Step, mut nodes: Vec<XNode>) -> Vec<XNode> {
    for predicate in &step.predicates {
        let size = nodes.len();
        nodes = nodes
            .into_iter()
            .enumerate()
            .filter(|(i, node)| matches_predicate(doc, predicate, *node, i + 1, size))
            .map(|(_, node)| node)
            .collect();
    }
    nodes
}

fn matches_predicate(
    doc: &HtmlDocument,
    predicate: &Predicate,
    node: XNode,
    position: usize,
    size: usize,
) -> bool {
    match predicate {
        Predicate::Position(n) => position == *n,
        Predicate::Last => position == size,
        Predicate::Exists(operand) => operand_value(doc, operand, node).is_some(),
        Predicate::Equals(left, right, negate) => {
            let (Some(l), Some(r)) = (
                operand_value(doc, left, node),
                operand_value(doc, right, node),
            ) else {
                return false;
            };
            let equal = match (l.parse::<f64>(), r.parse::<f64>()) {
                (Ok(a), Ok(b)) if is_number(left) || is_number(right) => a == b,
                _ => l == r,
            };
            equal != *negate
        }
        Predicate::Contains(haystack, needle) => {
            match (
                operand_value(doc, haystack, node),
                operand_value(doc, needle, node),
            ) {
                (Some(h), Some(n)) => h.contains(&n),
                _ => false,
            }
        }
        Predicate::StartsWith(haystack, prefix) => {
            match (
                operand_value(doc, haystack, node),
                operand_value(doc, prefix, node),
            ) {
                (Some(h), Some(p)) => h.starts_with(&p),
                _ => false,
            }
        }
        Predicate::Not(inner) => !matches_predicate(doc, inner, node, position, size),
        Predicate::And(a, b) => {
            matches_predicate(doc, a, node, position, size)
                && matches_predicate(doc, b, node, position, size)
        }
        Predicate::Or(a, b) => {
            matches_predicate(doc, a, node, position, size)
                || matches_predicate(doc, b, node, position, size)
        }
    }
}

fn is_number(operand: &Operand) -> bool {
    matches!(operand, Operand::Number(_))
}

fn operand_value(doc: &HtmlDocument, operand: &Operand, node: XNode) -> Option<String> {
    match operand {
        Operand::Literal(s) => Some(s.clone()),
        Operand::Number(n) => Some(n.to_string()),
        Operand::Context => Some(node.string_value(doc)),
        Operand::Attribute(name) => match node {
            XNode::Element(id) => doc.attribute(id, name).map(str::to_string),
            _ => None,
        },
        Operand::Text => match node {
            XNode::Element(id) => {
                let texts: Vec<&str> = doc.texts(id).collect();
                (!texts.is_empty()).then(|| texts.concat())
            }
            XNode::Text { .. } => Some(node.string_value(doc)),
            XNode::Attribute { .. } => None,
        },
        Operand::Child(name) => match node {
            XNode::Element(id) => doc
                .children(id)
                .find(|child| doc.element(*child).tag == *name)
                .map(|child| doc.text_content(child)),
            _ => None,
        },
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
    Eq,
    NotEq,
    Name(String),
    Literal(String),
    Number(f64),
}

fn tokenize(expr: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = expr.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '/' if chars.get(i + 1) == Some(&'/') => {
                tokens.push(Token::DoubleSlash);
                i += 2;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '.' if chars.get(i + 1) == Some(&'.') => {
                tokens.push(Token::DotDot);
                i += 2;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '@' => {
                tokens.push(Token::At);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
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
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '=' => {
                tokens.push(Token::Eq);
                i += 1;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::NotEq);
                i += 2;
            }
            '\'' | '"' => {
                let end = chars[i + 1..]
                    .iter()
                    .position(|ch| *ch == c)
                    .ok_or_else(|| "unterminated string literal".to_string())?;
                tokens.push(Token::Literal(chars[i + 1..i + 1 + end].iter().collect()));
                i += end + 2;
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let number = text
                    .parse()
                    .map_err(|_| format!("invalid number '{text}'"))?;
                tokens.push(Token::Number(number));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || matches!(chars[i], '-' | '_' | ':'))
                {
                    i += 1;
                }
                tokens.push(Token::Name(
                    chars[start..i].iter().collect::<String>().to_ascii_lowercase(),
                ));
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

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), String> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(format!("expected {expected:?}, found {token:?}")),
            None => Err(format!("expected {expected:?}, found end of input")),
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

    fn path(&mut self) -> Result<(bool, Vec<Step>), String> {
        let (absolute, mut descendant) = match self.peek() {
            Some(Token::Slash) => {
                self.pos += 1;
                (true, false)
            }
            Some(Token::DoubleSlash) => {
                self.pos += 1;
                (true, true)
            }
            None => return Err("empty expression".to_string()),
            _ => (false, false),
        };

        let mut steps = Vec::new();
        loop {
            steps.push(self.step(descendant)?);
            match self.peek() {
                Some(Token::Slash) => descendant = false,
                Some(Token::DoubleSlash) => descendant = true,
                _ => break,
            }
            self.pos += 1;
        }
        Ok((absolute, steps))
    }

    fn step(&mut self, descendant: bool) -> Result<Step, String> {
        let test = match self.next() {
            Some(Token::Dot) => NodeTest::SelfNode,
            Some(Token::DotDot) => NodeTest::Parent,
            Some(Token::Star) => NodeTest::AnyElement,
            Some(Token::At) => match self.next() {
                Some(Token::Name(name)) => NodeTest::Attribute(name),
                Some(Token::Star) => NodeTest::AnyAttribute,
                other => return Err(format!("expected attribute name, found {other:?}")),
            },
            Some(Token::Name(name)) if name == "text" && self.peek() == Some(&Token::LParen) => {
                self.expect(Token::LParen)?;
                self.expect(Token::RParen)?;
                NodeTest::Text
            }
            Some(Token::Name(name)) => NodeTest::Name(name),
            other => return Err(format!("expected a location step, found {other:?}")),
        };

        let mut predicates = Vec::new();
        while self.peek() == Some(&Token::LBracket) {
            self.pos += 1;
            predicates.push(self.or_expr()?);
            self.expect(Token::RBracket)?;
        }

        Ok(Step {
            descendant,
            test,
            predicates,
        })
    }

    fn or_expr(&mut self) -> Result<Predicate, String> {
        let mut left = self.and_expr()?;
        while self.eat_keyword("or") {
            let right = self.and_expr()?;
            left = Predicate::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Predicate, String> {
        let mut left = self.primary()?;
        while self.eat_keyword("and") {
            let right = self.primary()?;
            left = Predicate::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn primary(&mut self) -> Result<Predicate, String> {
        if let Some(Token::Name(name)) = self.peek()
            && self.peek_at(1) == Some(&Token::LParen)
        {
            let name = name.clone();
            match name.as_str() {
                "not" => {
                    self.pos += 2;
                    let inner = self.or_expr()?;
                    self.expect(Token::RParen)?;
                    return Ok(Predicate::Not(Box::new(inner)));
                }
                "last" => {
                    self.pos += 2;
                    self.expect(Token::RParen)?;
                    return Ok(Predicate::Last);
                }
                "contains" | "starts-with" => {
                    self.pos += 2;
                    let left = self.operand()?;
                    self.expect(Token::Comma)?;
                    let right = self.operand()?;
                    self.expect(Token::RParen)?;
                    return Ok(if name == "contains" {
                        Predicate::Contains(left, right)
                    } else {
                        Predicate::StartsWith(left, right)
                    });
                }
                _ => {}
            }
        }

        if self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            let inner = self.or_expr()?;
            self.expect(Token::RParen)?;
            return Ok(inner);
        }

        if let Some(Token::Number(n)) = self.peek()
            && !matches!(self.peek_at(1), Some(Token::Eq | Token::NotEq))
        {
            let n = *n;
            self.pos += 1;
            if n < 1.0 || n.fract() != 0.0 {
                return Err(format!("invalid position {n}"));
            }
            return Ok(Predicate::Position(n as usize));
        }

        let left = self.operand()?;
        match self.peek() {
            Some(Token::Eq) | Some(Token::NotEq) => {
                let negate = self.next() == Some(Token::NotEq);
                let right = self.operand()?;
                Ok(Predicate::Equals(left, right, negate))
            }
            _ => Ok(Predicate::Exists(left)),
        }
    }

    fn operand(&mut self) -> Result<Operand, String> {
        match self.next() {
            Some(Token::At) => match self.next() {
                Some(Token::Name(name)) => Ok(Operand::Attribute(name)),
                other => Err(format!("expected attribute name, found {other:?}")),
            },
            Some(Token::Dot) => Ok(Operand::Context),
            Some(Token::Literal(s)) => Ok(Operand::Literal(s)),
            Some(Token::Number(n)) => Ok(Operand::Number(n)),
            Some(Token::Name(name)) if name == "text" && self.peek() == Some(&Token::LParen) => {
                self.expect(Token::LParen)?;
                self.expect(Token::RParen)?;
                Ok(Operand::Text)
            }
            Some(Token::Name(name)) => Ok(Operand::Child(name)),
            other => Err(format!("expected an operand, found {other:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<html><body>
<ul id="list">
  <li class="item first">one</li>
  <li class="item">two</li>
  <li class="item" data-live="1">three <b>bold</b></li>
</ul>
<script id="embedded-data" data-props='{"site":{"relive":{"webSocketUrl":"wss://a.example/ws"}}}'></script>
<a href="/one">first</a><a href="/two" rel="next">second</a>
</body></html>"#;

    fn strings(expr: &str) -> Vec<String> {
        let doc = HtmlDocument::parse(PAGE);
        XPath::parse(expr)
            .unwrap()
            .evaluate(&doc)
            .iter()
            .map(|node| node.string_value(&doc))
            .collect()
    }

    #[test]
    fn selects_attributes_by_id() {
        assert_eq!(
            strings("//script[@id='embedded-data']/@data-props"),
            vec![r#"{"site":{"relive":{"webSocketUrl":"wss://a.example/ws"}}}"#]
        );
    }

    #[test]
    fn positions_and_last() {
        assert_eq!(strings("//ul/li[1]/text()"), vec!["one"]);
        assert_eq!(strings("//ul/li[last()]/text()"), vec!["three "]);
        assert_eq!(strings("/html/body/ul/li[2]"), vec!["two"]);
    }

    #[test]
    fn functions_and_boolean_logic() {
        assert_eq!(strings("//li[contains(@class, 'first')]"), vec!["one"]);
        assert_eq!(strings("//li[@data-live and @class='item']/b"), vec!["bold"]);
        assert_eq!(strings("//a[not(@rel)]/@href"), vec!["/one"]);
        assert_eq!(strings("//a[starts-with(@href, '/t') or text()='first']/@href"), vec!["/one", "/two"]);
        assert_eq!(strings("//li[@data-live=1]/text()"), vec!["three "]);
        assert_eq!(strings("//li[text()!='one'][1]"), vec!["two"]);
    }

    #[test]
    fn relative_paths_and_parents() {
        let doc = HtmlDocument::parse(PAGE);
        let list = XPath::parse("//ul").unwrap().evaluate(&doc)[0];
        let items = XPath::parse("./li").unwrap().evaluate_from(&doc, list);
        assert_eq!(items.len(), 3);

        let bold = XPath::parse(".//b/..").unwrap().evaluate_from(&doc, list);
        assert_eq!(bold.len(), 1);
        assert_eq!(doc.attribute(match bold[0] { XNode::Element(id) => id, _ => unreachable!() }, "data-live"), Some("1"));
    }

    #[test]
    fn element_values_are_objects() {
        let doc = HtmlDocument::parse(PAGE);
        let link = XPath::parse("//a[@rel='next']").unwrap().evaluate(&doc)[0];
        let value = link.to_value(&doc);
        assert_eq!(value["tag"], "a");
        assert_eq!(value["attributes"]["href"], "/two");
        assert_eq!(value["text"], "second");
    }

    #[test]
    fn rejects_malformed_expressions() {
        assert!(XPath::parse("").is_err());
        assert!(XPath::parse("//a[@href").is_err());
        assert!(XPath::parse("//a[@href='x]").is_err());
        assert!(XPath::parse("//a[0]").is_err());
    }
}
