//! Condition language for workflow task destinations
//!
//! Destinations may carry boolean conditions such as:
//!
//! ```text
//! {{ context.executions.seg.result.score }} > 0.8
//!     AND {{ context.dicom.series.any('0008','0060') }} IN ['CT', 'MR']
//! ```
//!
//! The [`Lexer`] tokenizes, the [`Parser`] builds an [`Expression`] tree and
//! the [`ConditionEvaluator`] evaluates it against a [`ConditionContext`].
//! The same `{{ ... }}` references are used by [`Template`]s to resolve task
//! arguments and artifact locations.

#![deny(unsafe_code)]

pub mod context;
pub mod errors;
pub mod evaluator;
pub mod lexer;
pub mod parser;
pub mod template;

pub use context::{
    ConditionContext, ContextRef, DicomScope, DicomTag, ExecutionField, PatientField,
    StaticContext, Value, WorkflowField,
};
pub use errors::{DslError, DslResult};
pub use evaluator::ConditionEvaluator;
pub use lexer::{Lexer, Token, TokenKind};
pub use parser::{CompareOp, Comparison, Expression, Operand, Parser};
pub use template::{render, Segment, Template};

/// Parse a condition without evaluating it
pub fn parse_condition(input: &str) -> DslResult<Expression> {
    Parser::parse(input)
}
