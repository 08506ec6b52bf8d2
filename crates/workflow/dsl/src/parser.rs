//! Parser: recursive descent parser for condition expressions
//!
//! Grammar (lowest precedence first):
//!
//! ```text
//! or_expr    := and_expr ( OR and_expr )*
//! and_expr   := unary ( AND unary )*
//! unary      := NOT unary | '(' or_expr ')' | comparison
//! comparison := operand op operand
//! op         := == | != | ~= | > | < | >= | <= | IN | NOT IN | CONTAINS | NOT CONTAINS
//! operand    := string | number | NULL | UNDEFINED | {{ reference }} | '[' operand, ... ']' | word
//! ```

use crate::context::ContextRef;
use crate::errors::{DslError, DslResult};
use crate::lexer::{Lexer, Token, TokenKind};

/// A parsed boolean expression
#[derive(Clone, Debug, PartialEq)]
pub enum Expression {
    Or(Box<Expression>, Box<Expression>),
    And(Box<Expression>, Box<Expression>),
    Not(Box<Expression>),
    Compare(Comparison),
}

/// A binary comparison between two operands
#[derive(Clone, Debug, PartialEq)]
pub struct Comparison {
    pub left: Operand,
    pub op: CompareOp,
    pub right: Operand,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    NotEq,
    /// Case-insensitive equality
    EqIgnoreCase,
    Gt,
    Lt,
    Ge,
    Le,
    In,
    NotIn,
    Contains,
    NotContains,
}

impl std::fmt::Display for CompareOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Eq => "==",
            Self::NotEq => "!=",
            Self::EqIgnoreCase => "~=",
            Self::Gt => ">",
            Self::Lt => "<",
            Self::Ge => ">=",
            Self::Le => "<=",
            Self::In => "IN",
            Self::NotIn => "NOT IN",
            Self::Contains => "CONTAINS",
            Self::NotContains => "NOT CONTAINS",
        };
        write!(f, "{}", text)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Operand {
    Literal(String),
    Number(f64),
    Null,
    Undefined,
    Param(ContextRef),
    List(Vec<Operand>),
}

impl Expression {
    /// All context references, in order of appearance
    pub fn references(&self) -> Vec<&ContextRef> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a ContextRef>) {
        match self {
            Self::Or(l, r) | Self::And(l, r) => {
                l.collect_references(out);
                r.collect_references(out);
            }
            Self::Not(inner) => inner.collect_references(out),
            Self::Compare(cmp) => {
                cmp.left.collect_references(out);
                cmp.right.collect_references(out);
            }
        }
    }
}

impl Operand {
    fn collect_references<'a>(&'a self, out: &mut Vec<&'a ContextRef>) {
        match self {
            Self::Param(r) => out.push(r),
            Self::List(items) => items.iter().for_each(|i| i.collect_references(out)),
            _ => {}
        }
    }
}

/// Parser for condition expressions
pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    /// Parse a condition into an expression tree
    pub fn parse(input: &str) -> DslResult<Expression> {
        let mut lexer = Lexer::new(input);
        let tokens = lexer.tokenize()?;
        let mut parser = Self { tokens, pos: 0 };

        if parser.check(TokenKind::Eof) {
            return Err(DslError::EmptyExpression);
        }

        let expr = parser.parse_or()?;
        if !parser.check(TokenKind::Eof) {
            let tok = parser.peek();
            return Err(DslError::UnexpectedToken {
                expected: "end of input".into(),
                found: tok.text.clone(),
            });
        }
        Ok(expr)
    }

    fn parse_or(&mut self) -> DslResult<Expression> {
        let mut left = self.parse_and()?;
        while self.check(TokenKind::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = Expression::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> DslResult<Expression> {
        let mut left = self.parse_unary()?;
        while self.check(TokenKind::And) {
            self.advance();
            let right = self.parse_unary()?;
            left = Expression::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> DslResult<Expression> {
        match self.peek_kind() {
            TokenKind::Not => {
                self.advance();
                let inner = self.parse_unary()?;
                Ok(Expression::Not(Box::new(inner)))
            }
            TokenKind::OpenParen => {
                self.advance();
                let inner = self.parse_or()?;
                self.expect(TokenKind::CloseParen)?;
                Ok(inner)
            }
            _ => self.parse_comparison().map(Expression::Compare),
        }
    }

    fn parse_comparison(&mut self) -> DslResult<Comparison> {
        let left = self.parse_operand()?;
        let op = self.parse_op()?;
        let right = self.parse_operand()?;
        Ok(Comparison { left, op, right })
    }

    fn parse_op(&mut self) -> DslResult<CompareOp> {
        let op = match self.peek_kind() {
            TokenKind::Eq => CompareOp::Eq,
            TokenKind::NotEq => CompareOp::NotEq,
            TokenKind::EqIgnoreCase => CompareOp::EqIgnoreCase,
            TokenKind::Gt => CompareOp::Gt,
            TokenKind::Lt => CompareOp::Lt,
            TokenKind::Ge => CompareOp::Ge,
            TokenKind::Le => CompareOp::Le,
            TokenKind::In => CompareOp::In,
            TokenKind::Contains => CompareOp::Contains,
            TokenKind::Not => {
                self.advance();
                return match self.peek_kind() {
                    TokenKind::In => {
                        self.advance();
                        Ok(CompareOp::NotIn)
                    }
                    TokenKind::Contains => {
                        self.advance();
                        Ok(CompareOp::NotContains)
                    }
                    _ => Err(self.unexpected("IN or CONTAINS after NOT")),
                };
            }
            _ => return Err(self.unexpected("comparison operator")),
        };
        self.advance();
        Ok(op)
    }

    fn parse_operand(&mut self) -> DslResult<Operand> {
        let tok = self.peek().clone();
        let operand = match tok.kind {
            TokenKind::StringLiteral | TokenKind::Identifier => Operand::Literal(tok.text),
            TokenKind::NumberLiteral => {
                let n = tok.text.parse::<f64>().map_err(|_| DslError::ParseError {
                    line: tok.line,
                    col: tok.col,
                    message: format!("'{}' is not a valid number", tok.text),
                })?;
                Operand::Number(n)
            }
            TokenKind::Null => Operand::Null,
            TokenKind::Undefined => Operand::Undefined,
            TokenKind::Parameter => Operand::Param(ContextRef::parse(&tok.text)?),
            TokenKind::OpenBracket => return self.parse_list(),
            _ => return Err(self.unexpected("operand")),
        };
        self.advance();
        Ok(operand)
    }

    fn parse_list(&mut self) -> DslResult<Operand> {
        self.expect(TokenKind::OpenBracket)?;
        let mut items = Vec::new();
        if !self.check(TokenKind::CloseBracket) {
            loop {
                items.push(self.parse_operand()?);
                if self.check(TokenKind::Comma) {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        self.expect(TokenKind::CloseBracket)?;
        Ok(Operand::List(items))
    }

    // ── Token helpers ────────────────────────────────────────────────

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self) -> TokenKind {
        self.peek().kind.clone()
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.peek_kind() == kind
    }

    fn advance(&mut self) -> &Token {
        let tok = &self.tokens[self.pos.min(self.tokens.len() - 1)];
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, kind: TokenKind) -> DslResult<&Token> {
        if self.check(kind.clone()) {
            Ok(self.advance())
        } else {
            Err(self.unexpected(&kind.to_string()))
        }
    }

    fn unexpected(&self, expected: &str) -> DslError {
        if self.check(TokenKind::Eof) {
            DslError::UnexpectedEof(expected.to_string())
        } else {
            DslError::UnexpectedToken {
                expected: expected.to_string(),
                found: self.peek().text.clone(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ExecutionField, WorkflowField};

    fn lit(s: &str) -> Operand {
        Operand::Literal(s.into())
    }

    #[test]
    fn test_parse_simple_comparison() {
        let expr = Parser::parse("'false' == 'true'").unwrap();
        assert_eq!(
            expr,
            Expression::Compare(Comparison {
                left: lit("false"),
                op: CompareOp::Eq,
                right: lit("true"),
            })
        );
    }

    #[test]
    fn test_and_binds_tighter_than_or() {
        let expr = Parser::parse("'a' == 'a' OR 'b' == 'c' AND 'd' == 'e'").unwrap();
        match expr {
            Expression::Or(_, right) => assert!(matches!(*right, Expression::And(_, _))),
            other => panic!("expected OR at the root, got {:?}", other),
        }
    }

    #[test]
    fn test_parentheses_override_precedence() {
        let expr = Parser::parse("('a' == 'a' OR 'b' == 'c') AND 'd' == 'e'").unwrap();
        assert!(matches!(expr, Expression::And(_, _)));
    }

    #[test]
    fn test_not_in_and_list() {
        let expr = Parser::parse("{{ context.workflow.name }} NOT IN ['ct', 'mr']").unwrap();
        match expr {
            Expression::Compare(cmp) => {
                assert_eq!(cmp.left, Operand::Param(ContextRef::Workflow(WorkflowField::Name)));
                assert_eq!(cmp.op, CompareOp::NotIn);
                assert_eq!(cmp.right, Operand::List(vec![lit("ct"), lit("mr")]));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_not_contains() {
        let expr = Parser::parse("'abc' not contains 'z'").unwrap();
        assert!(matches!(
            expr,
            Expression::Compare(Comparison {
                op: CompareOp::NotContains,
                ..
            })
        ));
    }

    #[test]
    fn test_null_and_number_operands() {
        let expr =
            Parser::parse("{{ context.executions.seg.result.score }} != NULL AND {{ context.executions.seg.result.score }} >= 0.75")
                .unwrap();
        let refs = expr.references();
        assert_eq!(refs.len(), 2);
        assert!(matches!(
            refs[0],
            ContextRef::Execution {
                field: ExecutionField::Result(_),
                ..
            }
        ));
    }

    #[test]
    fn test_not_prefix() {
        let expr = Parser::parse("NOT ('a' == 'b')").unwrap();
        assert!(matches!(expr, Expression::Not(_)));
    }

    #[test]
    fn test_empty_expression() {
        assert_eq!(Parser::parse("  ").unwrap_err(), DslError::EmptyExpression);
    }

    #[test]
    fn test_missing_operator() {
        let err = Parser::parse("'a' 'b'").unwrap_err();
        assert!(matches!(err, DslError::UnexpectedToken { .. }));
    }

    #[test]
    fn test_unbalanced_parentheses() {
        let err = Parser::parse("('a' == 'a'").unwrap_err();
        assert!(matches!(err, DslError::UnexpectedEof(_)));
    }

    #[test]
    fn test_trailing_tokens() {
        let err = Parser::parse("'a' == 'a' 'b'").unwrap_err();
        assert!(matches!(err, DslError::UnexpectedToken { .. }));
    }

    #[test]
    fn test_unknown_reference_is_an_error() {
        let err = Parser::parse("{{ context.nothing }} == 'x'").unwrap_err();
        assert!(matches!(err, DslError::UnknownReference(_)));
    }
}
